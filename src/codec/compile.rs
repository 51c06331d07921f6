//! Codec derivation.
//!
//! [`MergeContext`] walks the schema depth-first and emits one node per
//! (type, remaining budget).  The types on the current path sit on a stack;
//! meeting one of them again means the schema is recursive, and the
//! in-progress node is reused by index instead of being expanded again.
//!
//! Dynamic alignment and fixed dynamic size of a recursive node depend on
//! themselves, so they are settled afterwards by iterating over the whole
//! arena until nothing changes.  In-progress nodes start from the bottom:
//! dynamic, alignment 1, variable size.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, trace, warn, Level};

use crate::codec::{Arm, Descriptor, Dynamic, Node, NodeId, Shape, Slot};
use crate::config::{Config, IntWidth};
use crate::error::SchemaError;
use crate::layout::{align_up, plan_record, plan_union, Layout};
use crate::schema::{Kind, Schema, TypeId};

const PENDING: Descriptor = Descriptor {
    static_size:  0,
    static_align: 1,
    dynamic:      Some(Dynamic { align: 1, fixed_size: None }),
};

#[tracing::instrument(level = "debug", skip_all, fields(ty = %root, budget = config.expansion_budget))]
pub(crate) fn derive(schema: &Schema, root: TypeId, config: &Config) -> Result<(Vec<Node>, NodeId), SchemaError> {
    schema.get(root)?;
    let mut cx = MergeContext {
        schema,
        config,
        nodes: Vec::new(),
        stack: Vec::new(),
        memo:  HashMap::new(),
    };
    let id = cx.compile(root, config.expansion_budget)?;
    let rounds = cx.settle();

    if config.log_level.enabled(Level::DEBUG) {
        let d = cx.nodes[id].desc;
        debug!(
            ty = schema.name(root),
            nodes = cx.nodes.len(),
            rounds,
            static_size = d.static_size,
            static_align = d.static_align,
            dynamic = ?d.dynamic,
            "codec derived"
        );
    }
    Ok((cx.nodes, id))
}

struct MergeContext<'s> {
    schema: &'s Schema,
    config: &'s Config,
    nodes:  Vec<Node>,
    stack:  Vec<(TypeId, NodeId)>,
    memo:   HashMap<(TypeId, u32), NodeId>,
}

impl<'s> MergeContext<'s> {
    fn logs(&self, level: Level) -> bool {
        self.config.log_level.enabled(level)
    }

    fn name(&self, ty: TypeId) -> String {
        self.schema.name(ty).to_owned()
    }

    fn compile(&mut self, ty: TypeId, budget: u32) -> Result<NodeId, SchemaError> {
        self.schema.get(ty)?;
        if let Some(&(_, id)) = self.stack.iter().rev().find(|(t, _)| *t == ty) {
            if !self.config.allow_recursive_rereference {
                return Err(SchemaError::RecursiveReference(self.name(ty)));
            }
            if self.logs(Level::TRACE) {
                trace!(ty = self.schema.name(ty), node = id, "recursive reference");
            }
            return Ok(id);
        }
        if let Some(&id) = self.memo.get(&(ty, budget)) {
            return Ok(id);
        }

        let id = self.nodes.len();
        self.nodes.push(Node { ty, desc: PENDING, shape: Shape::Direct });
        self.stack.push((ty, id));
        let expanded = self.expand(ty, budget);
        self.stack.pop();
        let (shape, layout) = expanded?;

        self.nodes[id].shape = shape;
        self.nodes[id].desc = Descriptor { static_size: layout.size, static_align: layout.align, dynamic: None };
        self.nodes[id].desc.dynamic = self.dynamic_of(id);
        self.memo.insert((ty, budget), id);
        Ok(id)
    }

    fn expand(&mut self, ty: TypeId, budget: u32) -> Result<(Shape, Layout), SchemaError> {
        let schema = self.schema;
        let config = self.config;
        let def = schema.def(ty);
        let direct = Ok((Shape::Direct, schema.plain(ty).layout));

        match &def.kind {
            Kind::Void | Kind::Primitive(_) | Kind::Enum { .. } => direct,

            Kind::Opaque => Err(SchemaError::UnsupportedKind { ty: def.name.clone(), kind: "opaque" }),

            Kind::UnknownPointer { .. } => {
                if config.serialize_unknown_pointers_as_address {
                    self.raw(ty, "unknown-length pointer")
                } else {
                    Err(SchemaError::UnknownPointer(def.name.clone()))
                }
            }

            Kind::Pointer { child, optional } => {
                let Some(next) = self.descend(ty, budget)? else {
                    return self.raw(ty, "indirection not expanded");
                };
                let child_id = self.compile(*child, next)?;
                let tagged = *optional && schema.is_zero_sized(*child);
                let layout = if tagged { Layout::tagged_address() } else { Layout::ADDRESS };
                Ok((Shape::Pointer { child: child_id, optional: *optional, tagged }, layout))
            }

            Kind::Slice { elem, optional } => {
                let Some(next) = self.descend(ty, budget)? else {
                    return self.raw(ty, "indirection not expanded");
                };
                let elem_id = self.compile(*elem, next)?;
                Ok((
                    Shape::Slice { elem: elem_id, optional: *optional },
                    Layout::slice_header(config.length_width),
                ))
            }

            Kind::Array { elem, len } => {
                if *len == 0 {
                    return direct;
                }
                let elem_id = self.compile(*elem, budget)?;
                let e = self.nodes[elem_id].desc;
                if !e.has_dynamic_payload() {
                    return direct;
                }
                Ok((Shape::Array { elem: elem_id, len: *len }, Layout::new(e.static_size * len, e.static_align)))
            }

            Kind::Record { fields, packed } => {
                if !config.recurse {
                    return self.image(ty);
                }
                let mut ids = Vec::with_capacity(fields.len());
                for f in fields {
                    ids.push(self.compile(f.ty, budget)?);
                }
                let dynamic: Vec<usize> =
                    (0..fields.len()).filter(|&i| self.nodes[ids[i]].desc.has_dynamic_payload()).collect();
                let Some(&first) = dynamic.first() else {
                    return direct;
                };
                if *packed {
                    return Err(SchemaError::PackedDynamicField {
                        ty:    def.name.clone(),
                        field: fields[first].name.clone(),
                    });
                }
                for &i in &dynamic {
                    let required = self.nodes[ids[i]].desc.static_align;
                    if let Some(align) = fields[i].align.filter(|&a| a < required) {
                        return Err(SchemaError::UnderalignedField {
                            ty: def.name.clone(),
                            field: fields[i].name.clone(),
                            align,
                            required,
                        });
                    }
                }

                let layouts: Vec<(&str, Layout)> = fields
                    .iter()
                    .zip(&ids)
                    .map(|(f, &id)| {
                        let d = self.nodes[id].desc;
                        (f.name.as_str(), Layout::new(d.static_size, f.align.unwrap_or(d.static_align)))
                    })
                    .collect();
                let ow = config.offset_width.size();
                let table = match dynamic.len() {
                    0 | 1 => Layout::ZERO,
                    k => Layout::new(ow * (k - 1), ow),
                };
                let plan = plan_record(&layouts, table);
                let slots = fields
                    .iter()
                    .zip(&ids)
                    .zip(&plan.offsets)
                    .map(|((f, &node), &offset)| Slot { name: f.name.clone(), node, offset })
                    .collect();
                Ok((Shape::Record { slots, order: dynamic, table: plan.table }, plan.layout))
            }

            Kind::Union { arms, tag } => {
                if !config.recurse {
                    return self.image(ty);
                }
                let mut ids = Vec::with_capacity(arms.len());
                for a in arms {
                    ids.push(self.compile(a.ty, budget)?);
                }
                if ids.iter().all(|&id| !self.nodes[id].desc.has_dynamic_payload()) {
                    return direct;
                }
                let Some(tag) = tag else {
                    return Err(SchemaError::UntaggedDynamicUnion(def.name.clone()));
                };
                for (a, &id) in arms.iter().zip(&ids) {
                    let d = self.nodes[id].desc;
                    let required = d.static_align;
                    match a.align {
                        Some(align) if d.has_dynamic_payload() && align < required => {
                            return Err(SchemaError::UnderalignedArm {
                                ty: def.name.clone(),
                                arm: a.name.clone(),
                                align,
                                required,
                            });
                        }
                        _ => {}
                    }
                }
                let layouts: Vec<Layout> = arms
                    .iter()
                    .zip(&ids)
                    .map(|(a, &id)| {
                        let d = self.nodes[id].desc;
                        Layout::new(d.static_size, a.align.unwrap_or(d.static_align))
                    })
                    .collect();
                let plan = plan_union(&layouts, tag.layout());
                let arms = arms
                    .iter()
                    .zip(ids)
                    .map(|(a, node)| Arm { name: a.name.clone(), node })
                    .collect();
                Ok((Shape::Union { arms, tag: *tag, plan }, plan.layout))
            }

            Kind::Optional(inner) => {
                if !config.recurse {
                    return self.image(ty);
                }
                let payload = self.compile(*inner, budget)?;
                let d = self.nodes[payload].desc;
                if !d.has_dynamic_payload() {
                    return direct;
                }
                let plan = plan_union(&[d.layout(), Layout::ZERO], IntWidth::U8.layout());
                Ok((Shape::Optional { payload, plan }, plan.layout))
            }

            Kind::Result { ok } => {
                if !config.recurse {
                    return self.image(ty);
                }
                let ok = self.compile(*ok, budget)?;
                let d = self.nodes[ok].desc;
                if !d.has_dynamic_payload() {
                    return direct;
                }
                let plan = plan_union(&[d.layout(), IntWidth::U16.layout()], IntWidth::U8.layout());
                Ok((Shape::Result { ok, plan }, plan.layout))
            }

            Kind::Custom(codec) => Ok((Shape::Custom(Arc::clone(codec)), codec.static_layout())),
        }
    }

    /// Budget left for the target of an indirection, or `None` when the
    /// indirection is stored as a raw header.
    fn descend(&self, ty: TypeId, budget: u32) -> Result<Option<u32>, SchemaError> {
        if !self.config.dereference {
            return Ok(None);
        }
        if budget == 0 {
            if self.config.error_on_zero_budget {
                return Err(SchemaError::BudgetExhausted(self.name(ty)));
            }
            if self.logs(Level::WARN) {
                warn!(ty = self.schema.name(ty), "expansion budget exhausted; storing raw header");
            }
            return Ok(None);
        }
        Ok(Some(budget - 1))
    }

    /// Plain image that embeds raw addresses.
    fn raw(&self, ty: TypeId, reason: &'static str) -> Result<(Shape, Layout), SchemaError> {
        if self.config.error_on_unsafe_conversion {
            return Err(SchemaError::UnsafeConversion(self.name(ty)));
        }
        if self.logs(Level::DEBUG) {
            debug!(ty = self.schema.name(ty), reason, "storing raw, non-portable header");
        }
        Ok((Shape::Direct, self.schema.plain(ty).layout))
    }

    /// Record or union stored without expansion.
    fn image(&self, ty: TypeId) -> Result<(Shape, Layout), SchemaError> {
        if self.schema.contains_address(ty) {
            return self.raw(ty, "recursion into records disabled");
        }
        Ok((Shape::Direct, self.schema.plain(ty).layout))
    }

    // ── Dynamic descriptors ──────────────────────────────────────────────────

    fn dynamic_of(&self, id: NodeId) -> Option<Dynamic> {
        let desc = |n: NodeId| self.nodes[n].desc;
        let ow = self.config.offset_width.size();

        match &self.nodes[id].shape {
            Shape::Direct => None,

            Shape::Pointer { child, optional, .. } => {
                let c = desc(*child);
                let fixed = if *optional {
                    None
                } else if c.has_dynamic_payload() {
                    c.fixed_size().map(|f| align_up(c.static_size, c.dynamic_align()) + f)
                } else {
                    Some(c.static_size)
                };
                Some(Dynamic { align: c.static_align.max(c.dynamic_align()), fixed_size: fixed })
            }

            Shape::Slice { elem, .. } => {
                let e = desc(*elem);
                let table = if e.needs_length() { ow } else { 1 };
                Some(Dynamic { align: e.static_align.max(e.dynamic_align()).max(table), fixed_size: None })
            }

            Shape::Array { elem, len } => {
                let e = desc(*elem);
                let da = e.dynamic_align();
                let table = if e.needs_length() && *len >= 2 { ow } else { 1 };
                let fixed = e.fixed_size().map(|f| (len - 1) * align_up(f, da) + f);
                Some(Dynamic { align: da.max(table), fixed_size: fixed })
            }

            Shape::Record { slots, order, .. } => {
                let align = order.iter().map(|&i| desc(slots[i].node).dynamic_align()).max().unwrap_or(1);
                let fixed = order.iter().try_fold(0, |cursor, &i| {
                    let d = desc(slots[i].node);
                    d.fixed_size().map(|f| align_up(cursor, d.dynamic_align()) + f)
                });
                Some(Dynamic { align, fixed_size: fixed })
            }

            Shape::Union { arms, .. } => {
                let align = arms.iter().map(|a| desc(a.node).dynamic_align()).max().unwrap_or(1);
                Some(Dynamic { align, fixed_size: common(arms.iter().map(|a| desc(a.node).fixed_size())) })
            }

            Shape::Optional { payload: inner, .. } | Shape::Result { ok: inner, .. } => {
                let d = desc(*inner);
                Some(Dynamic { align: d.dynamic_align(), fixed_size: common([Some(0), d.fixed_size()].into_iter()) })
            }

            Shape::Custom(codec) => codec.dynamic(),
        }
    }

    /// Dynamic field order: most aligned first; then single indirections,
    /// then sequences of dynamic elements, then sequences of static ones;
    /// then by name.
    fn sorted_order(&self, id: NodeId) -> Option<Vec<usize>> {
        let Shape::Record { slots, order, .. } = &self.nodes[id].shape else {
            return None;
        };
        let rank = |node: NodeId| match &self.nodes[node].shape {
            Shape::Pointer { .. } => 0u8,
            Shape::Slice { elem, .. } if self.nodes[*elem].desc.has_dynamic_payload() => 1,
            Shape::Slice { .. } => 2,
            _ => 3,
        };
        let mut sorted = order.clone();
        sorted.sort_by_key(|&i| {
            let node = slots[i].node;
            (Reverse(self.nodes[node].desc.dynamic_align()), rank(node), slots[i].name.as_str())
        });
        Some(sorted)
    }

    /// Recompute descriptors and record orders until stable; returns the
    /// number of rounds taken.
    fn settle(&mut self) -> usize {
        let limit = self.nodes.len() + 2;
        for round in 1..=limit {
            let mut changed = false;
            for id in 0..self.nodes.len() {
                let dynamic = self.dynamic_of(id);
                if dynamic != self.nodes[id].desc.dynamic {
                    self.nodes[id].desc.dynamic = dynamic;
                    changed = true;
                }
                if let Some(sorted) = self.sorted_order(id) {
                    if let Shape::Record { order, .. } = &mut self.nodes[id].shape {
                        if *order != sorted {
                            *order = sorted;
                            changed = true;
                        }
                    }
                }
            }
            if !changed {
                return round;
            }
        }
        limit
    }
}

/// The value shared by every item, if they all agree.
fn common(mut sizes: impl Iterator<Item = Option<usize>>) -> Option<usize> {
    let first = sizes.next()??;
    sizes.all(|s| s == Some(first)).then_some(first)
}
