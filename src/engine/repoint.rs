//! Relocation.
//!
//! After a buffer's bytes are copied or moved, its embedded addresses still
//! point into the old location.  `repoint_node` walks the same structure the
//! writer produced and rewrites every address from the region's current
//! base.  Positions come from stored lengths, tags and offset tables; no
//! stored address is ever dereferenced.

use crate::codec::{Codec, NodeId, Shape};
use crate::config::IntWidth;
use crate::engine::{
    advance, load_address, load_offset, load_uint, span, store_address, sub_mut, Region, SeqPlan,
};
use crate::error::{Error, Result};
use crate::layout::{align_up, Layout};

impl Codec {
    pub(crate) fn repoint_node(
        &self,
        id: NodeId,
        header: &mut [u8],
        region: &mut Region<'_>,
        start: usize,
    ) -> Result<usize> {
        let ow = self.config().offset_width;

        match &self.node(id).shape {
            Shape::Direct => Ok(start),

            Shape::Pointer { child, optional, tagged } => {
                if !pointer_present(header, *optional, *tagged)? {
                    return Ok(start);
                }
                store_address(header, 0, region.address(start))?;

                let c = self.node(*child).desc;
                let image_end = start + c.static_size;
                let child_start = if c.has_dynamic_payload() { align_up(image_end, c.dynamic_align()) } else { image_end };
                let (img, mut rest) = region.carve(start, c.static_size)?;
                self.repoint_node(*child, img, &mut rest, child_start)
            }

            Shape::Slice { elem, optional } => {
                let lw = self.config().length_width;
                let len = load_uint(header, Layout::slice_length_offset(lw), lw)?;
                if *optional && len == lw.max_value() {
                    return Ok(start);
                }
                let n = usize::try_from(len).map_err(|_| Error::LengthOverflow { len: usize::MAX, width: lw })?;
                store_address(header, 0, region.address(start))?;

                let e = self.node(*elem).desc;
                let es = e.static_size;
                let images_len = span(n, es)?;
                let (images, mut rest) = region.carve(start, images_len)?;
                if n == 0 || !e.has_dynamic_payload() {
                    return Ok(start + images_len);
                }
                let plan = SeqPlan::slice(start, n, es, &e, ow)?;
                self.repoint_elements(*elem, plan, images, &mut rest)
            }

            Shape::Array { elem, len } => {
                let e = self.node(*elem).desc;
                self.repoint_elements(*elem, SeqPlan::array(start, *len, &e, ow)?, header, region)
            }

            Shape::Record { slots, order, table } => {
                let mut cursor = start;
                for (j, &i) in order.iter().enumerate() {
                    let slot = &slots[i];
                    let d = self.node(slot.node).desc;
                    let begin = match j {
                        0 => align_up(start, d.dynamic_align()),
                        _ => start + load_offset(header, table + (j - 1) * ow.size(), ow)?,
                    };
                    cursor = self.repoint_node(slot.node, sub_mut(header, slot.offset, d.static_size)?, region, begin)?;
                }
                Ok(cursor)
            }

            Shape::Union { arms, tag, plan } => {
                let idx = load_uint(header, plan.tag, *tag)?;
                let arm = arms.get(idx as usize).ok_or(Error::InvalidDiscriminant(idx))?;
                let size = self.node(arm.node).desc.static_size;
                self.repoint_node(arm.node, sub_mut(header, plan.payload, size)?, region, start)
            }

            Shape::Optional { payload, plan } => match load_uint(header, plan.tag, IntWidth::U8)? {
                0 => Ok(start),
                _ => {
                    let size = self.node(*payload).desc.static_size;
                    self.repoint_node(*payload, sub_mut(header, plan.payload, size)?, region, start)
                }
            },

            Shape::Result { ok, plan } => match load_uint(header, plan.tag, IntWidth::U8)? {
                0 => {
                    let size = self.node(*ok).desc.static_size;
                    self.repoint_node(*ok, sub_mut(header, plan.payload, size)?, region, start)
                }
                _ => Ok(start),
            },

            Shape::Custom(codec) => codec.repoint(header, region, start),
        }
    }

    fn repoint_elements(
        &self,
        elem: NodeId,
        plan: SeqPlan,
        images: &mut [u8],
        region: &mut Region<'_>,
    ) -> Result<usize> {
        let ow = self.config().offset_width;
        let e = self.node(elem).desc;
        let (es, da) = (e.static_size, e.dynamic_align());

        let (at, len) = plan.table_span(ow);
        let (table, mut rest) = region.carve(at, len)?;

        let mut cursor = plan.section;
        for i in 0..plan.count {
            let begin = match (i, plan.table) {
                (0, _) | (_, None) => align_up(cursor, da),
                (_, Some(_)) => advance(plan.section, load_offset(table, (i - 1) * ow.size(), ow)?)?,
            };
            cursor = self.repoint_node(elem, sub_mut(images, i * es, es)?, &mut rest, begin)?;
        }
        Ok(cursor)
    }
}

/// Whether a pointer header refers to a value.  Untagged optional pointers
/// use a zero address for absence; the address itself may be stale.
pub(crate) fn pointer_present(header: &[u8], optional: bool, tagged: bool) -> Result<bool> {
    if tagged {
        return Ok(load_uint(header, Layout::ADDRESS.size, IntWidth::U8)? != 0);
    }
    Ok(!optional || load_address(header, 0)? != 0)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::config::Config;
    use crate::engine::load_address;
    use crate::schema::{Member, Primitive, SchemaBuilder};
    use crate::{Codec, Value};

    #[test]
    fn copied_buffer_points_into_itself_after_repoint() {
        let mut b = SchemaBuilder::new();
        let n = b.primitive(Primitive::U64);
        let text = b.bytes();
        let boxed = b.pointer(n);
        let r = b.record("Doc", [Member::new("title", text), Member::new("count", boxed)]);
        let schema = Arc::new(b.build().unwrap());
        let codec = Codec::derive(&schema, r, &Config::default()).unwrap();

        let value = Value::record([("title", Value::str("hello")), ("count", Value::ptr(Value::Uint(42)))]);
        let original = codec.encode(&value).unwrap();
        let mut copy = original.clone();
        let walked = codec.repoint_buffer(&mut copy).unwrap();
        assert_eq!(codec.dynamic_offset() + walked, copy.len());

        let lo = copy.as_ptr() as usize;
        let hi = lo + copy.len();
        let header = &copy[..codec.static_size()];
        for at in (0..codec.static_size()).step_by(std::mem::size_of::<usize>()) {
            let addr = load_address(header, at).unwrap();
            if addr > 0xFFFF {
                assert!((lo..hi).contains(&addr), "address {addr:#x} escapes the copy");
            }
        }
        assert_eq!(codec.view(&copy).unwrap().to_value().unwrap(), value);
    }

    #[test]
    fn null_values_are_left_alone() {
        let mut b = SchemaBuilder::new();
        let n = b.primitive(Primitive::U32);
        let maybe = b.optional_pointer(n);
        let schema = Arc::new(b.build().unwrap());
        let codec = Codec::derive(&schema, maybe, &Config::default()).unwrap();

        let mut buf = codec.encode(&Value::Null).unwrap();
        assert_eq!(codec.repoint_buffer(&mut buf).unwrap(), 0);
        assert_eq!(load_address(&buf, 0).unwrap(), 0);
    }
}
