//! Schema descriptor trees.
//!
//! A schema is an arena of type definitions addressed by [`TypeId`].  Types
//! may refer to each other in any order, including to themselves through a
//! pointer or slice, which is how recursive shapes are expressed:
//!
//! ```
//! use contig::schema::{Member, Primitive, SchemaBuilder};
//!
//! let mut b = SchemaBuilder::new();
//! let node = b.declare("Node");
//! let value = b.primitive(Primitive::U32);
//! let next = b.optional_pointer(node);
//! b.record_into(node, [Member::new("value", value), Member::new("next", next)]);
//! let schema = b.build()?;
//! assert_eq!(schema.name(node), "Node");
//! # Ok::<(), contig::SchemaError>(())
//! ```
//!
//! [`SchemaBuilder::build`] validates the definitions and computes every
//! type's *plain layout*: its native static image, with raw addresses where
//! indirections live.  Plain layouts are what non-expanded (Direct) codecs
//! store.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::codec::custom::CustomCodec;
use crate::config::IntWidth;
use crate::error::SchemaError;
use crate::layout::{plan_packed, plan_record, plan_union, Layout};

// ── Identifiers and primitives ───────────────────────────────────────────────

/// Index of a type inside its [`Schema`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub(crate) u32);

impl TypeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Bool,
    U8,
    U16,
    U32,
    U64,
    Usize,
    I8,
    I16,
    I32,
    I64,
    Isize,
    F32,
    F64,
}

impl Primitive {
    pub fn layout(self) -> Layout {
        let size = match self {
            Primitive::Bool | Primitive::U8 | Primitive::I8 => 1,
            Primitive::U16 | Primitive::I16                 => 2,
            Primitive::U32 | Primitive::I32 | Primitive::F32 => 4,
            Primitive::U64 | Primitive::I64 | Primitive::F64 => 8,
            Primitive::Usize | Primitive::Isize             => IntWidth::NATIVE.size(),
        };
        Layout::new(size, size)
    }

    pub fn name(self) -> &'static str {
        match self {
            Primitive::Bool  => "bool",
            Primitive::U8    => "u8",
            Primitive::U16   => "u16",
            Primitive::U32   => "u32",
            Primitive::U64   => "u64",
            Primitive::Usize => "usize",
            Primitive::I8    => "i8",
            Primitive::I16   => "i16",
            Primitive::I32   => "i32",
            Primitive::I64   => "i64",
            Primitive::Isize => "isize",
            Primitive::F32   => "f32",
            Primitive::F64   => "f64",
        }
    }

    /// Storage width of an integer primitive.
    pub fn int_width(self) -> Option<IntWidth> {
        match self {
            Primitive::Bool | Primitive::F32 | Primitive::F64 => None,
            _ => Some(match self.layout().size {
                1 => IntWidth::U8,
                2 => IntWidth::U16,
                4 => IntWidth::U32,
                _ => IntWidth::U64,
            }),
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            Primitive::I8 | Primitive::I16 | Primitive::I32 | Primitive::I64 | Primitive::Isize
        )
    }
}

// ── Definitions ──────────────────────────────────────────────────────────────

/// A record field or a union arm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub name:  String,
    pub ty:    TypeId,
    /// Alignment override for the member's slot.
    pub align: Option<usize>,
}

impl Member {
    pub fn new(name: impl Into<String>, ty: TypeId) -> Self {
        Self { name: name.into(), ty, align: None }
    }

    pub fn aligned(mut self, align: usize) -> Self {
        self.align = Some(align);
        self
    }
}

#[derive(Debug, Clone)]
pub enum Kind {
    Void,
    Primitive(Primitive),
    Enum { repr: Primitive, variants: Vec<(String, i64)> },
    /// Single indirection.
    Pointer { child: TypeId, optional: bool },
    /// Variable-length sequence.
    Slice { elem: TypeId, optional: bool },
    /// Fixed-length sequence.
    Array { elem: TypeId, len: usize },
    Record { fields: Vec<Member>, packed: bool },
    /// Union; `tag: None` makes it untagged.
    Union { arms: Vec<Member>, tag: Option<IntWidth> },
    /// Optional value that is not itself an indirection.
    Optional(TypeId),
    /// Success payload or a `u16` failure code.
    Result { ok: TypeId },
    /// Pointer to an unknown number of elements.
    UnknownPointer { child: TypeId },
    Custom(Arc<dyn CustomCodec>),
    /// Type whose layout is unknown; only usable behind a raw address.
    Opaque,
}

impl Kind {
    pub fn name(&self) -> &'static str {
        match self {
            Kind::Void              => "void",
            Kind::Primitive(_)      => "primitive",
            Kind::Enum { .. }       => "enum",
            Kind::Pointer { .. }    => "pointer",
            Kind::Slice { .. }      => "slice",
            Kind::Array { .. }      => "array",
            Kind::Record { .. }     => "record",
            Kind::Union { .. }      => "union",
            Kind::Optional(_)       => "optional",
            Kind::Result { .. }     => "result",
            Kind::UnknownPointer{..} => "unknown-length pointer",
            Kind::Custom(_)         => "custom",
            Kind::Opaque            => "opaque",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TypeDef {
    pub name: String,
    pub kind: Kind,
}

/// Static image of a type as stored by a Direct codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plain {
    pub layout:  Layout,
    /// Record: one offset per field.  Union-like: the payload offset per arm.
    /// Raw slice: address and length offsets.
    pub offsets: Vec<usize>,
    pub tag:     Option<usize>,
}

impl Plain {
    fn bare(layout: Layout) -> Self {
        Self { layout, offsets: Vec::new(), tag: None }
    }
}

// ── Schema ───────────────────────────────────────────────────────────────────

/// Validated, immutable set of type definitions.
#[derive(Debug)]
pub struct Schema {
    defs:       Vec<TypeDef>,
    plain:      Vec<Plain>,
    zero_sized: Vec<bool>,
    by_name:    HashMap<String, TypeId>,
}

impl Schema {
    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn get(&self, ty: TypeId) -> Result<&TypeDef, SchemaError> {
        self.defs.get(ty.index()).ok_or(SchemaError::UnknownType(ty.0))
    }

    pub fn def(&self, ty: TypeId) -> &TypeDef {
        &self.defs[ty.index()]
    }

    pub fn kind(&self, ty: TypeId) -> &Kind {
        &self.defs[ty.index()].kind
    }

    pub fn name(&self, ty: TypeId) -> &str {
        &self.defs[ty.index()].name
    }

    pub fn lookup(&self, name: &str) -> Option<TypeId> {
        self.by_name.get(name).copied()
    }

    pub fn plain(&self, ty: TypeId) -> &Plain {
        &self.plain[ty.index()]
    }

    pub fn is_zero_sized(&self, ty: TypeId) -> bool {
        self.zero_sized[ty.index()]
    }

    /// Whether the plain image of `ty` holds a raw address anywhere.
    pub fn contains_address(&self, ty: TypeId) -> bool {
        let mut seen = vec![false; self.defs.len()];
        self.contains_address_from(ty, &mut seen)
    }

    fn contains_address_from(&self, ty: TypeId, seen: &mut [bool]) -> bool {
        if std::mem::replace(&mut seen[ty.index()], true) {
            return false;
        }
        match self.kind(ty) {
            Kind::Pointer { .. } | Kind::Slice { .. } | Kind::UnknownPointer { .. } => true,
            Kind::Array { elem, .. } => self.contains_address_from(*elem, seen),
            Kind::Record { fields: members, .. } | Kind::Union { arms: members, .. } => {
                members.iter().any(|m| self.contains_address_from(m.ty, seen))
            }
            Kind::Optional(inner) | Kind::Result { ok: inner } => self.contains_address_from(*inner, seen),
            _ => false,
        }
    }
}

// ── Builder ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct SchemaBuilder {
    defs:      Vec<(String, Option<Kind>)>,
    by_name:   HashMap<String, TypeId>,
    /// Names defined more than once; reported by `build`.
    redefined: Vec<String>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a named type without defining it yet.  Declaring an existing
    /// name returns its id.
    pub fn declare(&mut self, name: impl Into<String>) -> TypeId {
        let name = name.into();
        if let Some(&id) = self.by_name.get(&name) {
            return id;
        }
        let id = TypeId(self.defs.len() as u32);
        self.by_name.insert(name.clone(), id);
        self.defs.push((name, None));
        id
    }

    /// Give a declared type its definition.  A second definition for the
    /// same type makes [`SchemaBuilder::build`] fail.
    pub fn define(&mut self, id: TypeId, kind: Kind) {
        let (name, slot) = &mut self.defs[id.index()];
        if slot.is_some() {
            self.redefined.push(name.clone());
        }
        *slot = Some(kind);
    }

    pub fn add(&mut self, name: impl Into<String>, kind: Kind) -> TypeId {
        let id = self.declare(name);
        self.define(id, kind);
        id
    }

    fn intern(&mut self, name: String, kind: impl FnOnce() -> Kind) -> TypeId {
        match self.by_name.get(&name) {
            Some(&id) if self.defs[id.index()].1.is_some() => id,
            _ => {
                let kind = kind();
                self.add(name, kind)
            }
        }
    }

    fn name_of(&self, id: TypeId) -> &str {
        &self.defs[id.index()].0
    }

    pub fn primitive(&mut self, p: Primitive) -> TypeId {
        self.intern(p.name().to_owned(), || Kind::Primitive(p))
    }

    pub fn void(&mut self) -> TypeId {
        self.intern("void".to_owned(), || Kind::Void)
    }

    /// `[]u8`.
    pub fn bytes(&mut self) -> TypeId {
        let u8_ty = self.primitive(Primitive::U8);
        self.slice(u8_ty)
    }

    pub fn slice(&mut self, elem: TypeId) -> TypeId {
        let name = format!("[]{}", self.name_of(elem));
        self.intern(name, || Kind::Slice { elem, optional: false })
    }

    pub fn optional_slice(&mut self, elem: TypeId) -> TypeId {
        let name = format!("?[]{}", self.name_of(elem));
        self.intern(name, || Kind::Slice { elem, optional: true })
    }

    pub fn pointer(&mut self, child: TypeId) -> TypeId {
        let name = format!("*{}", self.name_of(child));
        self.intern(name, || Kind::Pointer { child, optional: false })
    }

    pub fn optional_pointer(&mut self, child: TypeId) -> TypeId {
        let name = format!("?*{}", self.name_of(child));
        self.intern(name, || Kind::Pointer { child, optional: true })
    }

    pub fn unknown_pointer(&mut self, child: TypeId) -> TypeId {
        let name = format!("[*]{}", self.name_of(child));
        self.intern(name, || Kind::UnknownPointer { child })
    }

    pub fn array(&mut self, elem: TypeId, len: usize) -> TypeId {
        let name = format!("[{len}]{}", self.name_of(elem));
        self.intern(name, || Kind::Array { elem, len })
    }

    pub fn optional(&mut self, inner: TypeId) -> TypeId {
        let name = format!("?({})", self.name_of(inner));
        self.intern(name, || Kind::Optional(inner))
    }

    pub fn result(&mut self, ok: TypeId) -> TypeId {
        let name = format!("!{}", self.name_of(ok));
        self.intern(name, || Kind::Result { ok })
    }

    pub fn record(&mut self, name: impl Into<String>, fields: impl IntoIterator<Item = Member>) -> TypeId {
        let fields = fields.into_iter().collect();
        self.add(name, Kind::Record { fields, packed: false })
    }

    /// Define a previously declared type as a record.
    pub fn record_into(&mut self, id: TypeId, fields: impl IntoIterator<Item = Member>) {
        let fields = fields.into_iter().collect();
        self.define(id, Kind::Record { fields, packed: false });
    }

    pub fn packed_record(&mut self, name: impl Into<String>, fields: impl IntoIterator<Item = Member>) -> TypeId {
        let fields = fields.into_iter().collect();
        self.add(name, Kind::Record { fields, packed: true })
    }

    pub fn union(
        &mut self,
        name: impl Into<String>,
        tag:  IntWidth,
        arms: impl IntoIterator<Item = Member>,
    ) -> TypeId {
        let arms = arms.into_iter().collect();
        self.add(name, Kind::Union { arms, tag: Some(tag) })
    }

    pub fn untagged_union(&mut self, name: impl Into<String>, arms: impl IntoIterator<Item = Member>) -> TypeId {
        let arms = arms.into_iter().collect();
        self.add(name, Kind::Union { arms, tag: None })
    }

    pub fn enumeration<S: Into<String>>(
        &mut self,
        name:     impl Into<String>,
        repr:     Primitive,
        variants: impl IntoIterator<Item = (S, i64)>,
    ) -> TypeId {
        let variants = variants.into_iter().map(|(n, d)| (n.into(), d)).collect();
        self.add(name, Kind::Enum { repr, variants })
    }

    pub fn custom(&mut self, name: impl Into<String>, codec: Arc<dyn CustomCodec>) -> TypeId {
        self.add(name, Kind::Custom(codec))
    }

    pub fn opaque(&mut self, name: impl Into<String>) -> TypeId {
        self.add(name, Kind::Opaque)
    }

    /// Validate every definition and compute plain layouts.
    pub fn build(self) -> Result<Schema, SchemaError> {
        if let Some(name) = self.redefined.into_iter().next() {
            return Err(SchemaError::DuplicateType(name));
        }
        let mut defs = Vec::with_capacity(self.defs.len());
        for (name, kind) in self.defs {
            match kind {
                Some(kind) => defs.push(TypeDef { name, kind }),
                None => return Err(SchemaError::Undefined(name)),
            }
        }

        for def in &defs {
            validate(def, defs.len())?;
        }

        let mut analysis = Analysis {
            defs:  &defs,
            zero:  vec![None; defs.len()],
            plain: vec![Slot::Pending; defs.len()],
        };
        let zero_sized = (0..defs.len())
            .map(|i| analysis.zero_sized(TypeId(i as u32), &mut vec![false; defs.len()]))
            .collect();
        let mut plain = Vec::with_capacity(defs.len());
        for (i, def) in defs.iter().enumerate() {
            if matches!(def.kind, Kind::Opaque) {
                plain.push(Plain::bare(Layout::ZERO));
            } else {
                plain.push(analysis.plain(TypeId(i as u32))?);
            }
        }

        Ok(Schema { defs, plain, zero_sized, by_name: self.by_name })
    }
}

fn validate(def: &TypeDef, count: usize) -> Result<(), SchemaError> {
    let check_id = |id: TypeId| {
        if id.index() < count { Ok(()) } else { Err(SchemaError::UnknownType(id.0)) }
    };
    let check_members = |members: &[Member]| -> Result<(), SchemaError> {
        for (i, m) in members.iter().enumerate() {
            check_id(m.ty)?;
            if members[..i].iter().any(|o| o.name == m.name) {
                return Err(SchemaError::DuplicateMember { ty: def.name.clone(), member: m.name.clone() });
            }
            if let Some(align) = m.align {
                if !align.is_power_of_two() {
                    return Err(SchemaError::InvalidAlignment {
                        ty: def.name.clone(),
                        member: m.name.clone(),
                        align,
                    });
                }
            }
        }
        Ok(())
    };

    match &def.kind {
        Kind::Pointer { child, .. } | Kind::UnknownPointer { child } => check_id(*child),
        Kind::Slice { elem, .. } | Kind::Array { elem, .. } => check_id(*elem),
        Kind::Optional(inner) | Kind::Result { ok: inner } => check_id(*inner),
        Kind::Record { fields, .. } => check_members(fields),
        Kind::Union { arms, tag } => {
            if arms.is_empty() {
                return Err(SchemaError::EmptyUnion(def.name.clone()));
            }
            if let Some(width) = tag {
                if (arms.len() - 1) as u64 > width.max_value() {
                    return Err(SchemaError::TagOverflow { ty: def.name.clone(), arms: arms.len(), width: *width });
                }
            }
            check_members(arms)
        }
        Kind::Enum { repr, .. } if repr.int_width().is_none() => Err(SchemaError::UnsupportedKind {
            ty: def.name.clone(),
            kind: "non-integer enum representation",
        }),
        Kind::Custom(codec) => {
            let layout = codec.static_layout();
            if !layout.align.is_power_of_two() || layout.size % layout.align != 0 {
                return Err(SchemaError::InvalidAlignment {
                    ty: def.name.clone(),
                    member: codec.name().to_owned(),
                    align: layout.align,
                });
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

// ── Layout analysis ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Slot {
    Pending,
    InProgress,
    Done(Plain),
}

struct Analysis<'d> {
    defs:  &'d [TypeDef],
    zero:  Vec<Option<bool>>,
    plain: Vec<Slot>,
}

impl Analysis<'_> {
    /// Zero-size check along by-value edges.  A type met again on the current
    /// path is treated as sized; such a path is rejected by `plain` anyway.
    fn zero_sized(&mut self, ty: TypeId, visiting: &mut Vec<bool>) -> bool {
        if let Some(z) = self.zero[ty.index()] {
            return z;
        }
        if visiting[ty.index()] {
            return false;
        }
        visiting[ty.index()] = true;
        let z = match &self.defs[ty.index()].kind {
            Kind::Void => true,
            Kind::Array { elem, len } => *len == 0 || self.zero_sized(*elem, visiting),
            Kind::Record { fields, .. } => fields.iter().all(|f| self.zero_sized(f.ty, visiting)),
            Kind::Union { arms, tag: None } => arms.iter().all(|a| self.zero_sized(a.ty, visiting)),
            Kind::Custom(codec) => codec.static_layout().size == 0,
            _ => false,
        };
        visiting[ty.index()] = false;
        self.zero[ty.index()] = Some(z);
        z
    }

    fn member_layout(&mut self, m: &Member) -> Result<Layout, SchemaError> {
        let plain = self.plain(m.ty)?;
        Ok(Layout::new(plain.layout.size, m.align.unwrap_or(plain.layout.align)))
    }

    fn plain(&mut self, ty: TypeId) -> Result<Plain, SchemaError> {
        match &self.plain[ty.index()] {
            Slot::Done(p) => return Ok(p.clone()),
            Slot::InProgress => return Err(SchemaError::InfiniteSize(self.defs[ty.index()].name.clone())),
            Slot::Pending => {}
        }
        self.plain[ty.index()] = Slot::InProgress;
        let defs = self.defs;
        let def = &defs[ty.index()];

        let plain = match &def.kind {
            Kind::Void => Plain::bare(Layout::ZERO),
            Kind::Primitive(p) => Plain::bare(p.layout()),
            Kind::Enum { repr, .. } => Plain::bare(repr.layout()),
            Kind::Pointer { child, optional } => {
                let mut visiting = vec![false; defs.len()];
                if *optional && self.zero_sized(*child, &mut visiting) {
                    Plain { layout: Layout::tagged_address(), offsets: Vec::new(), tag: Some(Layout::ADDRESS.size) }
                } else {
                    Plain::bare(Layout::ADDRESS)
                }
            }
            Kind::UnknownPointer { .. } => Plain::bare(Layout::ADDRESS),
            Kind::Slice { .. } => Plain {
                layout:  Layout::slice_header(IntWidth::NATIVE),
                offsets: vec![0, Layout::slice_length_offset(IntWidth::NATIVE)],
                tag:     None,
            },
            Kind::Array { elem, len } => {
                let e = self.plain(*elem)?.layout;
                Plain::bare(Layout::new(e.size * len, e.align))
            }
            Kind::Record { fields, packed } => {
                let mut slots = Vec::with_capacity(fields.len());
                for f in fields {
                    slots.push(self.member_layout(f)?);
                }
                let plan = if *packed {
                    plan_packed(&slots)
                } else {
                    let named: Vec<(&str, Layout)> =
                        fields.iter().zip(&slots).map(|(f, l)| (f.name.as_str(), *l)).collect();
                    plan_record(&named, Layout::ZERO)
                };
                Plain { layout: plan.layout, offsets: plan.offsets, tag: None }
            }
            Kind::Union { arms, tag } => {
                let mut slots = Vec::with_capacity(arms.len());
                for a in arms {
                    slots.push(self.member_layout(a)?);
                }
                let plan = plan_union(&slots, tag.map_or(Layout::ZERO, IntWidth::layout));
                Plain { layout: plan.layout, offsets: vec![plan.payload; arms.len()], tag: tag.map(|_| plan.tag) }
            }
            Kind::Optional(inner) => {
                let payload = self.plain(*inner)?.layout;
                let plan = plan_union(&[payload, Layout::ZERO], IntWidth::U8.layout());
                Plain { layout: plan.layout, offsets: vec![plan.payload; 2], tag: Some(plan.tag) }
            }
            Kind::Result { ok } => {
                let payload = self.plain(*ok)?.layout;
                let plan = plan_union(&[payload, IntWidth::U16.layout()], IntWidth::U8.layout());
                Plain { layout: plan.layout, offsets: vec![plan.payload; 2], tag: Some(plan.tag) }
            }
            Kind::Custom(codec) => Plain::bare(codec.static_layout()),
            Kind::Opaque => {
                return Err(SchemaError::UnsupportedKind { ty: def.name.clone(), kind: "opaque" });
            }
        };

        self.plain[ty.index()] = Slot::Done(plain.clone());
        Ok(plain)
    }
}
