//! Write engine.
//!
//! `write_node` fills a node's static image and appends its dynamic bytes
//! at `start`, returning the offset just past them.  Parents carve their own
//! images out of the region before handing the rest to children, so every
//! byte has exactly one writer.

use crate::codec::{Codec, NodeId, Shape};
use crate::config::IntWidth;
use crate::engine::{
    active_arm, image, plain, span, store_address, store_length, store_offset, store_uint, sub_mut, Region, SeqPlan,
};
use crate::error::{Error, Result};
use crate::layout::{align_up, Layout};
use crate::value::{Items, Value};

impl Codec {
    pub(crate) fn write_node(
        &self,
        id: NodeId,
        value: &Value,
        header: &mut [u8],
        region: &mut Region<'_>,
        start: usize,
    ) -> Result<usize> {
        let node = self.node(id);
        let ow = self.config().offset_width;

        match &node.shape {
            Shape::Direct => {
                plain::write(self.schema(), node.ty, value, header)?;
                Ok(start)
            }

            Shape::Pointer { child, optional, tagged } => {
                let inner = match value {
                    Value::Pointer(v) => v,
                    Value::Null if *optional => {
                        store_address(header, 0, 0)?;
                        if *tagged {
                            store_uint(header, Layout::ADDRESS.size, IntWidth::U8, 0)?;
                        }
                        return Ok(start);
                    }
                    other => return Err(other.mismatch("pointer")),
                };
                store_address(header, 0, region.address(start))?;
                if *tagged {
                    store_uint(header, Layout::ADDRESS.size, IntWidth::U8, 1)?;
                }

                let c = self.node(*child).desc;
                let image_end = start + c.static_size;
                let child_start = if c.has_dynamic_payload() { align_up(image_end, c.dynamic_align()) } else { image_end };
                let (img, mut rest) = region.carve(start, c.static_size)?;
                self.write_node(*child, inner, img, &mut rest, child_start)
            }

            Shape::Slice { elem, optional } => {
                let lw = self.config().length_width;
                let len_at = Layout::slice_length_offset(lw);
                let items = match value {
                    Value::Null if *optional => {
                        store_address(header, 0, 0)?;
                        store_uint(header, len_at, lw, lw.max_value())?;
                        return Ok(start);
                    }
                    v => v.items()?,
                };

                let n = items.len();
                if *optional && n as u64 == lw.max_value() {
                    return Err(Error::LengthOverflow { len: n, width: lw });
                }
                store_length(header, len_at, lw, n)?;
                store_address(header, 0, region.address(start))?;

                let e = self.node(*elem).desc;
                let es = e.static_size;
                let images_end = start + span(n, es)?;
                let (images, mut rest) = region.carve(start, images_end - start)?;

                if let Items::Bytes(raw) = items {
                    if plain::is_byte(self.schema(), self.node(*elem).ty) {
                        images.copy_from_slice(raw);
                        return Ok(images_end);
                    }
                }
                if n == 0 || !e.has_dynamic_payload() {
                    for i in 0..n {
                        self.write_node(*elem, &items.get(i), &mut images[image(i, es)], &mut rest, images_end)?;
                    }
                    return Ok(images_end);
                }

                let plan = SeqPlan::slice(start, n, es, &e, ow)?;
                self.write_elements(*elem, items, plan, images, &mut rest)
            }

            Shape::Array { elem, len } => {
                let items = value.items()?;
                if items.len() != *len {
                    return Err(Error::LengthMismatch { expected: *len, found: items.len() });
                }
                let e = self.node(*elem).desc;
                self.write_elements(*elem, items, SeqPlan::array(start, *len, &e, ow)?, header, region)
            }

            Shape::Record { slots, order, table } => {
                for slot in slots {
                    let d = self.node(slot.node).desc;
                    if !d.has_dynamic_payload() {
                        let field = value.require_field(&slot.name)?;
                        self.write_node(slot.node, field, sub_mut(header, slot.offset, d.static_size)?, region, start)?;
                    }
                }

                let mut cursor = start;
                for (j, &i) in order.iter().enumerate() {
                    let slot = &slots[i];
                    let d = self.node(slot.node).desc;
                    let field = value.require_field(&slot.name)?;
                    cursor = align_up(cursor, d.dynamic_align());
                    if j > 0 {
                        store_offset(header, table + (j - 1) * ow.size(), ow, cursor - start)?;
                    }
                    cursor = self.write_node(slot.node, field, sub_mut(header, slot.offset, d.static_size)?, region, cursor)?;
                }
                Ok(cursor)
            }

            Shape::Union { arms, tag, plan } => {
                let (idx, inner) = active_arm(arms, value)?;
                header.fill(0);
                store_uint(header, plan.tag, *tag, idx as u64)?;
                let arm = arms[idx].node;
                let size = self.node(arm).desc.static_size;
                self.write_node(arm, inner, sub_mut(header, plan.payload, size)?, region, start)
            }

            Shape::Optional { payload, plan } => {
                let Value::Optional(inner) = value else {
                    return Err(value.mismatch("optional"));
                };
                header.fill(0);
                match inner {
                    None => {
                        store_uint(header, plan.tag, IntWidth::U8, 0)?;
                        Ok(start)
                    }
                    Some(v) => {
                        store_uint(header, plan.tag, IntWidth::U8, 1)?;
                        let size = self.node(*payload).desc.static_size;
                        self.write_node(*payload, v, sub_mut(header, plan.payload, size)?, region, start)
                    }
                }
            }

            Shape::Result { ok, plan } => {
                let Value::Result(result) = value else {
                    return Err(value.mismatch("result"));
                };
                header.fill(0);
                match result {
                    Ok(v) => {
                        store_uint(header, plan.tag, IntWidth::U8, 0)?;
                        let size = self.node(*ok).desc.static_size;
                        self.write_node(*ok, v, sub_mut(header, plan.payload, size)?, region, start)
                    }
                    Err(code) => {
                        store_uint(header, plan.tag, IntWidth::U8, 1)?;
                        store_uint(header, plan.payload, IntWidth::U16, u64::from(*code))?;
                        Ok(start)
                    }
                }
            }

            Shape::Custom(codec) => codec.write(value, header, region, start),
        }
    }

    /// Elements with dynamic payloads: offset table first, then each
    /// element's window in order.
    fn write_elements(
        &self,
        elem: NodeId,
        items: Items<'_>,
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
            cursor = align_up(cursor, da);
            if i > 0 && plan.table.is_some() {
                store_offset(table, (i - 1) * ow.size(), ow, cursor - plan.section)?;
            }
            cursor = self.write_node(elem, &items.get(i), sub_mut(images, i * es, es)?, &mut rest, cursor)?;
        }
        Ok(cursor)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::config::{Config, IntWidth};
    use crate::engine::{load_address, load_offset, load_uint};
    use crate::error::Error;
    use crate::layout::Layout;
    use crate::schema::{Member, Primitive, SchemaBuilder};
    use crate::{Codec, Value};

    #[test]
    fn record_with_two_strings_stores_offset_table() {
        let mut b = SchemaBuilder::new();
        let text = b.bytes();
        let r = b.record("Pair", [Member::new("first", text), Member::new("second", text)]);
        let schema = Arc::new(b.build().unwrap());
        let codec = Codec::derive(&schema, r, &Config::default()).unwrap();

        let value = Value::record([("first", Value::str("ab")), ("second", Value::str("xyz"))]);
        let buf = codec.encode(&value).unwrap();
        let (header, dynamic) = buf.split_at(codec.dynamic_offset());
        assert_eq!(dynamic, b"abxyz");

        // One table entry: where "second" starts.
        let table_at = 2 * Layout::slice_header(IntWidth::NATIVE).size;
        assert_eq!(load_offset(header, table_at, IntWidth::U32).unwrap(), 2);
        let base = dynamic.as_ptr() as usize;
        let addrs: Vec<usize> = [0, Layout::slice_header(IntWidth::NATIVE).size]
            .iter()
            .map(|&at| load_address(header, at).unwrap())
            .collect();
        assert!(addrs.contains(&base));
        assert!(addrs.contains(&(base + 2)));
    }

    #[test]
    fn slice_length_limit_depends_on_optionality() {
        let mut b = SchemaBuilder::new();
        let byte = b.primitive(Primitive::U8);
        let s = b.slice(byte);
        let o = b.optional_slice(byte);
        let schema = Arc::new(b.build().unwrap());
        let config = Config { length_width: IntWidth::U8, ..Config::default() };

        let full = Value::Bytes(vec![7; 255]);
        let plain = Codec::derive(&schema, s, &config).unwrap();
        assert!(plain.encode(&full).is_ok());

        let optional = Codec::derive(&schema, o, &config).unwrap();
        assert!(matches!(optional.encode(&full), Err(Error::LengthOverflow { len: 255, .. })));
        let buf = optional.encode(&Value::Null).unwrap();
        assert_eq!(load_uint(&buf, Layout::slice_length_offset(IntWidth::U8), IntWidth::U8).unwrap(), 255);
    }

    #[test]
    fn failed_write_reports_missing_field() {
        let mut b = SchemaBuilder::new();
        let text = b.bytes();
        let r = b.record("One", [Member::new("name", text)]);
        let schema = Arc::new(b.build().unwrap());
        let codec = Codec::derive(&schema, r, &Config::default()).unwrap();
        assert!(matches!(codec.encode(&Value::record([("other", Value::str("x"))])), Err(Error::MissingField(_))));
    }
}
