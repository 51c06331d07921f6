//! Size estimation.
//!
//! Every branch here mirrors one in [`super::write`]: the same alignment
//! steps, the same tables, the same short-circuits for absent values.  The
//! writer's return value is checked against this in debug builds.

use crate::codec::{Codec, NodeId, Shape};
use crate::engine::{active_arm, span, SeqPlan};
use crate::error::{Error, Result};
use crate::layout::align_up;
use crate::value::{Items, Value};

impl Codec {
    pub(crate) fn size_node(&self, id: NodeId, value: &Value, start: usize) -> Result<usize> {
        let ow = self.config().offset_width;

        match &self.node(id).shape {
            Shape::Direct => Ok(start),

            Shape::Pointer { child, optional, .. } => {
                let inner = match value {
                    Value::Pointer(v) => v,
                    Value::Null if *optional => return Ok(start),
                    other => return Err(other.mismatch("pointer")),
                };
                let c = self.node(*child).desc;
                let image_end = start + c.static_size;
                if !c.has_dynamic_payload() {
                    return Ok(image_end);
                }
                self.size_node(*child, inner, align_up(image_end, c.dynamic_align()))
            }

            Shape::Slice { elem, optional } => {
                let items = match value {
                    Value::Null if *optional => return Ok(start),
                    v => v.items()?,
                };
                let e = self.node(*elem).desc;
                let n = items.len();
                if n == 0 || !e.has_dynamic_payload() {
                    return Ok(start + span(n, e.static_size)?);
                }
                let plan = SeqPlan::slice(start, n, e.static_size, &e, ow)?;
                self.size_elements(*elem, items, plan)
            }

            Shape::Array { elem, len } => {
                let items = value.items()?;
                if items.len() != *len {
                    return Err(Error::LengthMismatch { expected: *len, found: items.len() });
                }
                let e = self.node(*elem).desc;
                self.size_elements(*elem, items, SeqPlan::array(start, *len, &e, ow)?)
            }

            Shape::Record { slots, order, .. } => {
                let mut cursor = start;
                for &i in order {
                    let slot = &slots[i];
                    let da = self.node(slot.node).desc.dynamic_align();
                    cursor = self.size_node(slot.node, value.require_field(&slot.name)?, align_up(cursor, da))?;
                }
                Ok(cursor)
            }

            Shape::Union { arms, .. } => {
                let (idx, inner) = active_arm(arms, value)?;
                self.size_node(arms[idx].node, inner, start)
            }

            Shape::Optional { payload, .. } => match value {
                Value::Optional(None) => Ok(start),
                Value::Optional(Some(v)) => self.size_node(*payload, v, start),
                other => Err(other.mismatch("optional")),
            },

            Shape::Result { ok, .. } => match value {
                Value::Result(Err(_)) => Ok(start),
                Value::Result(Ok(v)) => self.size_node(*ok, v, start),
                other => Err(other.mismatch("result")),
            },

            Shape::Custom(codec) => codec.dynamic_size(value, start),
        }
    }

    fn size_elements(&self, elem: NodeId, items: Items<'_>, plan: SeqPlan) -> Result<usize> {
        let da = self.node(elem).desc.dynamic_align();
        let mut cursor = plan.section;
        for i in 0..plan.count {
            cursor = self.size_node(elem, &items.get(i), align_up(cursor, da))?;
        }
        Ok(cursor)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::config::Config;
    use crate::schema::{Member, Primitive, SchemaBuilder};
    use crate::{Codec, Value};

    #[test]
    fn strings_with_table() {
        let mut b = SchemaBuilder::new();
        let text = b.bytes();
        let list = b.slice(text);
        let schema = Arc::new(b.build().unwrap());
        let codec = Codec::derive(&schema, list, &Config::default()).unwrap();

        let value = Value::Seq(vec![Value::str("a"), Value::str("bb"), Value::str("ccc")]);
        let images = 3 * crate::layout::Layout::slice_header(Config::default().length_width).size;
        // images, two u32 offsets, then six content bytes
        assert_eq!(codec.dynamic_size(&value, 0).unwrap(), images + 8 + 6);
    }

    #[test]
    fn absent_values_use_no_dynamic_bytes() {
        let mut b = SchemaBuilder::new();
        let text = b.bytes();
        let n = b.primitive(Primitive::U32);
        let opt = b.optional(text);
        let maybe = b.optional_pointer(n);
        let res = b.result(text);
        let r = b.record("R", [Member::new("o", opt), Member::new("p", maybe), Member::new("r", res)]);
        let schema = Arc::new(b.build().unwrap());
        let codec = Codec::derive(&schema, r, &Config::default()).unwrap();

        let value = Value::record([("o", Value::none()), ("p", Value::Null), ("r", Value::err(3))]);
        assert_eq!(codec.dynamic_size(&value, 0).unwrap(), 0);
    }

    #[test]
    fn mismatched_values_are_reported() {
        let mut b = SchemaBuilder::new();
        let n = b.primitive(Primitive::U32);
        let arr = b.array(n, 2);
        let p = b.pointer(arr);
        let schema = Arc::new(b.build().unwrap());
        let codec = Codec::derive(&schema, p, &Config::default()).unwrap();
        assert!(codec.dynamic_size(&Value::Null, 0).is_err());
        assert_eq!(codec.dynamic_size(&Value::ptr(Value::Seq(vec![1u64.into(), 2u64.into()])), 0).unwrap(), 8);
    }
}
