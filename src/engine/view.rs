//! Lazy views over encoded buffers.
//!
//! A [`View`] is a cursor: a node (or a plain type), the static image it
//! owns and where its dynamic window starts.  Navigation only reads
//! lengths, tags and offset tables, so a view works on a buffer whose
//! addresses are stale; [`View::to_value`] materializes the whole subtree.
//!
//! [`ViewMut`] adds in-place replacement.  A replacement must fit in the
//! dynamic bytes the old value was given (up to the next sibling's start);
//! larger values are refused with [`Error::CapacityExceeded`] and the
//! bytes are left untouched.

use std::fmt;

use crate::codec::{Codec, Descriptor, NodeId, Shape};
use crate::config::IntWidth;
use crate::engine::repoint::pointer_present;
use crate::engine::{load_address, load_offset, load_uint, plain, span, sub, sub_mut, Region, SeqPlan};
use crate::error::{Error, Result};
use crate::layout::{align_up, Layout};
use crate::schema::{Kind, TypeId};
use crate::value::Value;

/// What a view is positioned on.  Direct nodes are always resolved to the
/// plain type they store, so plain images nested inside them can be
/// navigated the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Target {
    Node(NodeId),
    Plain(TypeId),
}

impl Target {
    fn resolve(self, codec: &Codec) -> Self {
        match self {
            Target::Node(id) if matches!(codec.node(id).shape, Shape::Direct) => Target::Plain(codec.node(id).ty),
            other => other,
        }
    }
}

/// Where a child's static image lives.
#[derive(Debug, Clone, Copy)]
enum Image {
    /// Offset inside the parent's image.
    Header(usize),
    /// Offset in the dynamic region.
    Dynamic(usize),
}

/// Position of a child, computed from a parent without borrowing it.
#[derive(Debug, Clone, Copy)]
struct Child {
    target: Target,
    image:  Image,
    size:   usize,
    begin:  usize,
    /// Where the next sibling's dynamic window starts, if one follows.
    next:   Option<usize>,
}

// ── View ─────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy)]
pub struct View<'a> {
    codec:   &'a Codec,
    target:  Target,
    header:  &'a [u8],
    dynamic: &'a [u8],
    /// Offset of `dynamic[0]` in the whole dynamic region.
    origin:  usize,
    start:   usize,
}

impl fmt::Debug for View<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("type", &self.type_name())
            .field("shape", &self.shape_name())
            .field("start", &self.start)
            .finish()
    }
}

impl<'a> View<'a> {
    pub(crate) fn new(codec: &'a Codec, target: Target, header: &'a [u8], dynamic: &'a [u8], start: usize) -> Self {
        Self { codec, target: target.resolve(codec), header, dynamic, origin: 0, start }
    }

    fn dyn_bytes(&self, at: usize, len: usize) -> Result<&'a [u8]> {
        let local = at.checked_sub(self.origin).ok_or(Error::OutOfBounds {
            start: at,
            end:   at.saturating_add(len),
            len:   self.origin + self.dynamic.len(),
        })?;
        sub(self.dynamic, local, len)
    }

    fn child(&self, c: Child) -> Result<View<'a>> {
        let header = match c.image {
            Image::Header(at) => sub(self.header, at, c.size)?,
            Image::Dynamic(at) => self.dyn_bytes(at, c.size)?,
        };
        Ok(View { target: c.target.resolve(self.codec), header, start: c.begin, ..*self })
    }

    pub fn type_id(&self) -> TypeId {
        match self.target {
            Target::Node(id) => self.codec.node(id).ty,
            Target::Plain(ty) => ty,
        }
    }

    pub fn type_name(&self) -> &'a str {
        self.codec.schema().name(self.type_id())
    }

    pub fn descriptor(&self) -> Descriptor {
        match self.target {
            Target::Node(id) => self.codec.node(id).desc,
            Target::Plain(ty) => {
                let l = self.codec.schema().plain(ty).layout;
                Descriptor { static_size: l.size, static_align: l.align, dynamic: None }
            }
        }
    }

    /// The static image this view owns.
    pub fn header(&self) -> &'a [u8] {
        self.header
    }

    fn shape_name(&self) -> &'static str {
        match self.target {
            Target::Node(id) => self.codec.node(id).shape.name(),
            Target::Plain(ty) => self.codec.schema().kind(ty).name(),
        }
    }

    fn wrong(&self, op: &'static str) -> Error {
        Error::WrongShape { op, shape: self.shape_name() }
    }

    fn shape(&self) -> Option<&'a Shape> {
        match self.target {
            Target::Node(id) => Some(&self.codec.node(id).shape),
            Target::Plain(_) => None,
        }
    }

    fn kind(&self) -> Option<&'a Kind> {
        match self.target {
            Target::Plain(ty) => Some(self.codec.schema().kind(ty)),
            Target::Node(_) => None,
        }
    }

    fn entry(&self, plan: &SeqPlan, k: usize) -> Result<usize> {
        let ow = self.codec.config().offset_width;
        let table = plan.table.ok_or(Error::OutOfBounds { start: k, end: k + 1, len: 0 })?;
        load_offset(self.dyn_bytes(table + k * ow.size(), ow.size())?, 0, ow)
    }

    // ── Presence ─────────────────────────────────────────────────────────────

    /// Absent optional pointer or optional slice.
    pub fn is_null(&self) -> Result<bool> {
        match (self.shape(), self.kind()) {
            (Some(Shape::Pointer { optional, tagged, .. }), _) => Ok(!pointer_present(self.header, *optional, *tagged)?),
            (Some(Shape::Slice { optional, .. }), _) => Ok(*optional && self.stored_len()? == self.length_width().max_value()),
            (_, Some(Kind::Pointer { .. } | Kind::Slice { .. })) => {
                Ok(plain::read(self.codec.schema(), self.type_id(), self.header)? == Value::Null)
            }
            _ => Ok(false),
        }
    }

    /// Address stored in a pointer or slice header.  Valid only while the
    /// buffer has not moved since it was written or repointed.
    pub fn address(&self) -> Result<usize> {
        match (self.shape(), self.kind()) {
            (Some(Shape::Pointer { .. } | Shape::Slice { .. }), _)
            | (_, Some(Kind::Pointer { .. } | Kind::UnknownPointer { .. } | Kind::Slice { .. })) => {
                load_address(self.header, 0)
            }
            _ => Err(self.wrong("address")),
        }
    }

    // ── Indirections ─────────────────────────────────────────────────────────

    fn pointee_child(&self) -> Result<Child> {
        let Some(Shape::Pointer { child, optional, tagged }) = self.shape() else {
            return Err(self.wrong("pointee"));
        };
        if !pointer_present(self.header, *optional, *tagged)? {
            return Err(Error::Absent);
        }
        let c = self.codec.node(*child).desc;
        let image_end = self.start + c.static_size;
        let begin = if c.has_dynamic_payload() { align_up(image_end, c.dynamic_align()) } else { image_end };
        Ok(Child { target: Target::Node(*child), image: Image::Dynamic(self.start), size: c.static_size, begin, next: None })
    }

    /// The value a pointer refers to.
    pub fn pointee(&self) -> Result<View<'a>> {
        self.child(self.pointee_child()?)
    }

    // ── Sequences ────────────────────────────────────────────────────────────

    fn length_width(&self) -> IntWidth {
        self.codec.config().length_width
    }

    fn stored_len(&self) -> Result<u64> {
        let lw = self.length_width();
        load_uint(self.header, Layout::slice_length_offset(lw), lw)
    }

    pub fn len(&self) -> Result<usize> {
        match (self.shape(), self.kind()) {
            (Some(Shape::Slice { .. }), _) => {
                if self.is_null()? {
                    return Err(Error::Absent);
                }
                let lw = self.length_width();
                usize::try_from(self.stored_len()?).map_err(|_| Error::LengthOverflow { len: usize::MAX, width: lw })
            }
            (Some(Shape::Array { len, .. }), _) | (_, Some(Kind::Array { len, .. })) => Ok(*len),
            _ => Err(self.wrong("len")),
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn elem_child(&self, i: usize) -> Result<Child> {
        let n = self.len()?;
        if i >= n {
            return Err(Error::IndexOutOfBounds { index: i, len: n });
        }
        let ow = self.codec.config().offset_width;

        let (elem, plan, image) = match (self.shape(), self.kind()) {
            (Some(Shape::Slice { elem, .. }), _) => {
                let e = self.codec.node(*elem).desc;
                // A stored length is only trusted once its images fit the region.
                self.dyn_bytes(self.start, span(n, e.static_size)?)?;
                let image = Image::Dynamic(self.start + i * e.static_size);
                (*elem, SeqPlan::slice(self.start, n, e.static_size, &e, ow)?, image)
            }
            (Some(Shape::Array { elem, .. }), _) => {
                let e = self.codec.node(*elem).desc;
                let image = Image::Header(i * e.static_size);
                (*elem, SeqPlan::array(self.start, n, &e, ow)?, image)
            }
            (_, Some(Kind::Array { elem, .. })) => {
                let size = self.codec.schema().plain(*elem).layout.size;
                let image = Image::Header(i * size);
                return Ok(Child { target: Target::Plain(*elem), image, size, begin: self.start, next: None });
            }
            _ => return Err(self.wrong("index")),
        };

        let e = self.codec.node(elem).desc;
        let (begin, next) = if e.has_dynamic_payload() {
            let begin = plan.locate(i, |k| self.entry(&plan, k))?;
            let next = if i + 1 < n { Some(plan.locate(i + 1, |k| self.entry(&plan, k))?) } else { None };
            (begin, next)
        } else {
            (self.start, None)
        };
        Ok(Child { target: Target::Node(elem), image, size: e.static_size, begin, next })
    }

    pub fn get(&self, i: usize) -> Result<View<'a>> {
        self.child(self.elem_child(i)?)
    }

    pub fn iter(&self) -> Result<impl Iterator<Item = Result<View<'a>>> + 'a> {
        let n = self.len()?;
        let this = *self;
        Ok((0..n).map(move |i| this.get(i)))
    }

    /// Contents of a `u8` sequence.
    pub fn as_bytes(&self) -> Result<&'a [u8]> {
        match (self.shape(), self.kind()) {
            (Some(Shape::Slice { elem, .. }), _) if self.is_byte_node(*elem) => {
                let n = self.len()?;
                self.dyn_bytes(self.start, n)
            }
            (_, Some(Kind::Array { elem, len })) if plain::is_byte(self.codec.schema(), *elem) => sub(self.header, 0, *len),
            _ => Err(self.wrong("as_bytes")),
        }
    }

    pub fn as_str(&self) -> Result<&'a str> {
        Ok(std::str::from_utf8(self.as_bytes()?)?)
    }

    fn is_byte_node(&self, id: NodeId) -> bool {
        let node = self.codec.node(id);
        matches!(node.shape, Shape::Direct) && plain::is_byte(self.codec.schema(), node.ty)
    }

    // ── Records and unions ───────────────────────────────────────────────────

    fn field_child(&self, name: &str) -> Result<Child> {
        match (self.shape(), self.kind()) {
            (Some(Shape::Record { slots, .. }), _) => {
                let idx = plain::member_index(slots.iter().map(|s| &s.name), name)?;
                self.slot_child(idx)
            }
            (_, Some(Kind::Record { fields, .. })) => {
                let idx = plain::member_index(fields.iter().map(|f| &f.name), name)?;
                let schema = self.codec.schema();
                let ty = fields[idx].ty;
                Ok(Child {
                    target: Target::Plain(ty),
                    image:  Image::Header(schema.plain(self.type_id()).offsets[idx]),
                    size:   schema.plain(ty).layout.size,
                    begin:  self.start,
                    next:   None,
                })
            }
            _ => Err(self.wrong("field")),
        }
    }

    fn slot_child(&self, idx: usize) -> Result<Child> {
        let Some(Shape::Record { slots, order, table }) = self.shape() else {
            return Err(self.wrong("field"));
        };
        let ow = self.codec.config().offset_width;
        let slot = &slots[idx];
        let d = self.codec.node(slot.node).desc;
        let at = |j: usize| -> Result<usize> {
            match j {
                0 => Ok(align_up(self.start, self.codec.node(slots[order[0]].node).desc.dynamic_align())),
                _ => Ok(self.start + load_offset(self.header, table + (j - 1) * ow.size(), ow)?),
            }
        };
        let (begin, next) = match order.iter().position(|&i| i == idx) {
            Some(j) => (at(j)?, if j + 1 < order.len() { Some(at(j + 1)?) } else { None }),
            None => (self.start, None),
        };
        Ok(Child { target: Target::Node(slot.node), image: Image::Header(slot.offset), size: d.static_size, begin, next })
    }

    pub fn field(&self, name: &str) -> Result<View<'a>> {
        self.child(self.field_child(name)?)
    }

    fn arm_child(&self) -> Result<(usize, Child)> {
        match (self.shape(), self.kind()) {
            (Some(Shape::Union { arms, tag, plan }), _) => {
                let idx = load_uint(self.header, plan.tag, *tag)?;
                let arm = arms.get(idx as usize).ok_or(Error::InvalidDiscriminant(idx))?;
                let size = self.codec.node(arm.node).desc.static_size;
                let child =
                    Child { target: Target::Node(arm.node), image: Image::Header(plan.payload), size, begin: self.start, next: None };
                Ok((idx as usize, child))
            }
            (_, Some(Kind::Union { arms, tag: Some(width) })) => {
                let schema = self.codec.schema();
                let plain = schema.plain(self.type_id());
                let idx = load_uint(self.header, plain.tag.unwrap_or(0), *width)?;
                let arm = arms.get(idx as usize).ok_or(Error::InvalidDiscriminant(idx))?;
                let child = Child {
                    target: Target::Plain(arm.ty),
                    image:  Image::Header(plain.offsets[idx as usize]),
                    size:   schema.plain(arm.ty).layout.size,
                    begin:  self.start,
                    next:   None,
                };
                Ok((idx as usize, child))
            }
            _ => Err(self.wrong("arm")),
        }
    }

    /// Active arm of a tagged union and its payload.
    pub fn arm(&self) -> Result<(&'a str, View<'a>)> {
        let (idx, child) = self.arm_child()?;
        Ok((arm_name(self.codec, self.target, idx), self.child(child)?))
    }

    fn optional_child(&self) -> Result<Option<Child>> {
        match (self.shape(), self.kind()) {
            (Some(Shape::Optional { payload, plan }), _) => match load_uint(self.header, plan.tag, IntWidth::U8)? {
                0 => Ok(None),
                _ => {
                    let size = self.codec.node(*payload).desc.static_size;
                    let image = Image::Header(plan.payload);
                    Ok(Some(Child { target: Target::Node(*payload), image, size, begin: self.start, next: None }))
                }
            },
            (Some(Shape::Pointer { optional: true, .. }), _) => {
                if self.is_null()? {
                    return Ok(None);
                }
                self.pointee_child().map(Some)
            }
            (_, Some(Kind::Optional(inner))) => {
                let schema = self.codec.schema();
                let plain = schema.plain(self.type_id());
                match load_uint(self.header, plain.tag.unwrap_or(0), IntWidth::U8)? {
                    0 => Ok(None),
                    _ => Ok(Some(Child {
                        target: Target::Plain(*inner),
                        image:  Image::Header(plain.offsets[0]),
                        size:   schema.plain(*inner).layout.size,
                        begin:  self.start,
                        next:   None,
                    })),
                }
            }
            _ => Err(self.wrong("optional")),
        }
    }

    /// Payload of an optional value or an optional pointer's target.
    pub fn optional(&self) -> Result<Option<View<'a>>> {
        self.optional_child()?.map(|c| self.child(c)).transpose()
    }

    fn result_child(&self) -> Result<std::result::Result<Child, u16>> {
        let (tag_at, payload_at, target, size) = match (self.shape(), self.kind()) {
            (Some(Shape::Result { ok, plan }), _) => {
                (plan.tag, plan.payload, Target::Node(*ok), self.codec.node(*ok).desc.static_size)
            }
            (_, Some(Kind::Result { ok })) => {
                let schema = self.codec.schema();
                let plain = schema.plain(self.type_id());
                (plain.tag.unwrap_or(0), plain.offsets[0], Target::Plain(*ok), schema.plain(*ok).layout.size)
            }
            _ => return Err(self.wrong("result")),
        };
        match load_uint(self.header, tag_at, IntWidth::U8)? {
            0 => Ok(Ok(Child { target, image: Image::Header(payload_at), size, begin: self.start, next: None })),
            _ => {
                let code_at = match self.kind() {
                    Some(_) => self.codec.schema().plain(self.type_id()).offsets[1],
                    None => payload_at,
                };
                Ok(Err(load_uint(self.header, code_at, IntWidth::U16)? as u16))
            }
        }
    }

    /// Success payload, or the stored failure code.
    pub fn result(&self) -> Result<std::result::Result<View<'a>, u16>> {
        match self.result_child()? {
            Ok(c) => Ok(Ok(self.child(c)?)),
            Err(code) => Ok(Err(code)),
        }
    }

    // ── Scalars ──────────────────────────────────────────────────────────────

    fn scalar(&self) -> Result<Value> {
        match self.kind() {
            Some(Kind::Primitive(p)) => plain::read_primitive(*p, self.header),
            Some(Kind::Enum { .. }) => plain::read(self.codec.schema(), self.type_id(), self.header),
            _ => Err(self.wrong("scalar")),
        }
    }

    pub fn as_u64(&self) -> Result<u64> {
        let v = self.scalar()?;
        v.as_u64().ok_or_else(|| v.mismatch("unsigned integer"))
    }

    pub fn as_i64(&self) -> Result<i64> {
        let v = self.scalar()?;
        v.as_i64().ok_or_else(|| v.mismatch("signed integer"))
    }

    pub fn as_f64(&self) -> Result<f64> {
        match self.scalar()? {
            Value::Float(f) => Ok(f),
            other => Err(other.mismatch("float")),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self.scalar()? {
            Value::Bool(b) => Ok(b),
            other => Err(other.mismatch("bool")),
        }
    }

    /// Name of the stored enum variant.
    pub fn as_enum(&self) -> Result<String> {
        match self.scalar()? {
            Value::Enum(name) => Ok(name),
            other => Err(other.mismatch("enum variant")),
        }
    }

    // ── Materialization ──────────────────────────────────────────────────────

    /// Read the whole subtree into a [`Value`].
    pub fn to_value(&self) -> Result<Value> {
        let id = match self.target {
            Target::Plain(ty) => return plain::read(self.codec.schema(), ty, self.header),
            Target::Node(id) => id,
        };

        match &self.codec.node(id).shape {
            Shape::Direct => plain::read(self.codec.schema(), self.codec.node(id).ty, self.header),

            Shape::Pointer { .. } => {
                if self.is_null()? {
                    return Ok(Value::Null);
                }
                Ok(Value::ptr(self.pointee()?.to_value()?))
            }

            Shape::Slice { elem, .. } => {
                if self.is_null()? {
                    return Ok(Value::Null);
                }
                if self.is_byte_node(*elem) {
                    return Ok(Value::Bytes(self.as_bytes()?.to_vec()));
                }
                Ok(Value::Seq(self.iter()?.map(|v| v?.to_value()).collect::<Result<_>>()?))
            }

            Shape::Array { .. } => Ok(Value::Seq(self.iter()?.map(|v| v?.to_value()).collect::<Result<_>>()?)),

            Shape::Record { slots, .. } => {
                let mut fields = Vec::with_capacity(slots.len());
                for (idx, slot) in slots.iter().enumerate() {
                    fields.push((slot.name.clone(), self.child(self.slot_child(idx)?)?.to_value()?));
                }
                Ok(Value::Record(fields))
            }

            Shape::Union { .. } => {
                let (name, payload) = self.arm()?;
                Ok(Value::arm(name, payload.to_value()?))
            }

            Shape::Optional { .. } => match self.optional()? {
                None => Ok(Value::none()),
                Some(v) => Ok(Value::some(v.to_value()?)),
            },

            Shape::Result { .. } => match self.result()? {
                Ok(v) => Ok(Value::ok(v.to_value()?)),
                Err(code) => Ok(Value::err(code)),
            },

            Shape::Custom(codec) => {
                let window = self.start.checked_sub(self.origin).and_then(|at| self.dynamic.get(at..)).unwrap_or(&[]);
                codec.read(self.header, window)
            }
        }
    }
}

/// Name of arm `idx` of the union at `target`; `idx` was validated by
/// `arm_child`.
fn arm_name(codec: &Codec, target: Target, idx: usize) -> &str {
    match target {
        Target::Node(id) => match &codec.node(id).shape {
            Shape::Union { arms, .. } => arms.get(idx).map_or("", |a| a.name.as_str()),
            _ => "",
        },
        Target::Plain(ty) => match codec.schema().kind(ty) {
            Kind::Union { arms, .. } => arms.get(idx).map_or("", |a| a.name.as_str()),
            _ => "",
        },
    }
}

// ── ViewMut ──────────────────────────────────────────────────────────────────

/// Mutable cursor; navigation consumes it, [`ViewMut::reborrow`] keeps the
/// parent usable.
pub struct ViewMut<'a> {
    codec:  &'a Codec,
    target: Target,
    header: &'a mut [u8],
    region: Region<'a>,
    start:  usize,
    /// End of the dynamic bytes this value may use.
    end:    usize,
}

impl fmt::Debug for ViewMut<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewMut")
            .field("view", &self.as_view())
            .field("capacity", &(self.end - self.start))
            .finish()
    }
}

impl<'a> ViewMut<'a> {
    pub(crate) fn new(
        codec: &'a Codec,
        target: Target,
        header: &'a mut [u8],
        region: Region<'a>,
        start: usize,
        end: usize,
    ) -> Self {
        Self { codec, target: target.resolve(codec), header, region, start, end }
    }

    pub fn as_view(&self) -> View<'_> {
        View {
            codec:   self.codec,
            target:  self.target,
            header:  &*self.header,
            dynamic: self.region.bytes(),
            origin:  self.region.origin(),
            start:   self.start,
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        self.as_view().to_value()
    }

    pub fn reborrow(&mut self) -> ViewMut<'_> {
        ViewMut {
            codec:  self.codec,
            target: self.target,
            header: &mut *self.header,
            region: self.region.reborrow(),
            start:  self.start,
            end:    self.end,
        }
    }

    /// Dynamic bytes available to a replacement value.
    pub fn capacity(&self) -> usize {
        self.end - self.start
    }

    /// Overwrite the value in place.
    pub fn replace(&mut self, value: &Value) -> Result<()> {
        let id = match self.target {
            Target::Plain(ty) => return plain::write(self.codec.schema(), ty, value, self.header),
            Target::Node(id) => id,
        };
        let needed = self.codec.size_node(id, value, self.start)?;
        if needed > self.end {
            return Err(Error::CapacityExceeded { needed: needed - self.start, available: self.capacity() });
        }
        let written = self.codec.write_node(id, value, self.header, &mut self.region, self.start)?;
        debug_assert_eq!(written, needed, "write disagrees with dynamic_size");
        Ok(())
    }

    fn into_child(self, c: Child) -> Result<ViewMut<'a>> {
        let end = c.next.unwrap_or(self.end);
        let (header, region) = match c.image {
            Image::Header(at) => (sub_mut(self.header, at, c.size)?, self.region),
            Image::Dynamic(at) => self.region.take(at, c.size)?,
        };
        Ok(ViewMut::new(self.codec, c.target, header, region, c.begin, end))
    }

    pub fn field_mut(self, name: &str) -> Result<ViewMut<'a>> {
        let child = self.as_view().field_child(name)?;
        self.into_child(child)
    }

    pub fn elem_mut(self, i: usize) -> Result<ViewMut<'a>> {
        let child = self.as_view().elem_child(i)?;
        self.into_child(child)
    }

    pub fn pointee_mut(self) -> Result<ViewMut<'a>> {
        let child = self.as_view().pointee_child()?;
        self.into_child(child)
    }

    pub fn arm_mut(self) -> Result<(&'a str, ViewMut<'a>)> {
        let (idx, child) = self.as_view().arm_child()?;
        let name = arm_name(self.codec, self.target, idx);
        Ok((name, self.into_child(child)?))
    }

    pub fn set(&mut self, i: usize, value: &Value) -> Result<()> {
        self.reborrow().elem_mut(i)?.replace(value)
    }

    pub fn set_field(&mut self, name: &str, value: &Value) -> Result<()> {
        self.reborrow().field_mut(name)?.replace(value)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::Config;
    use crate::schema::{Member, Primitive, SchemaBuilder};

    fn people() -> (Arc<crate::schema::Schema>, TypeId) {
        let mut b = SchemaBuilder::new();
        let age = b.primitive(Primitive::U8);
        let text = b.bytes();
        let person = b.record("Person", [Member::new("name", text), Member::new("age", age), Member::new("nick", text)]);
        let list = b.slice(person);
        (Arc::new(b.build().unwrap()), list)
    }

    fn crew() -> Value {
        Value::Seq(vec![
            Value::record([("name", Value::str("Ada")), ("age", Value::Uint(36)), ("nick", Value::str("countess"))]),
            Value::record([("name", Value::str("Grace")), ("age", Value::Uint(85)), ("nick", Value::str(""))]),
        ])
    }

    #[test]
    fn navigate_without_materializing() {
        let (schema, list) = people();
        let codec = Codec::derive(&schema, list, &Config::default()).unwrap();
        let buf = codec.encode(&crew()).unwrap();
        let view = codec.view(&buf).unwrap();

        assert_eq!(view.len().unwrap(), 2);
        let grace = view.get(1).unwrap();
        assert_eq!(grace.field("name").unwrap().as_str().unwrap(), "Grace");
        assert_eq!(grace.field("age").unwrap().as_u64().unwrap(), 85);
        assert_eq!(view.get(0).unwrap().field("nick").unwrap().as_str().unwrap(), "countess");
        assert!(matches!(view.get(2), Err(Error::IndexOutOfBounds { index: 2, len: 2 })));
        assert!(matches!(grace.field("email"), Err(Error::NoSuchMember(_))));
        assert_eq!(view.to_value().unwrap(), crew());
    }

    #[test]
    fn replace_in_place_within_capacity() {
        let (schema, list) = people();
        let codec = Codec::derive(&schema, list, &Config::default()).unwrap();
        let mut buf = codec.encode(&crew()).unwrap();

        let mut root = codec.view_mut(&mut buf).unwrap();
        let mut ada = root.reborrow().elem_mut(0).unwrap();
        ada.set_field("age", &Value::Uint(37)).unwrap();
        ada.set_field("nick", &Value::str("count")).unwrap();
        let err = ada.set_field("nick", &Value::str("countess of lovelace")).unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { .. }));

        let value = codec.view(&buf).unwrap().to_value().unwrap();
        let ada = &value_seq(&value)[0];
        assert_eq!(ada.field("age"), Some(&Value::Uint(37)));
        assert_eq!(ada.field("nick"), Some(&Value::str("count")));
    }

    fn value_seq(v: &Value) -> &[Value] {
        match v {
            Value::Seq(items) => items,
            _ => panic!("not a sequence"),
        }
    }

    #[test]
    fn optional_result_and_union_views() {
        let mut b = SchemaBuilder::new();
        let text = b.bytes();
        let n = b.primitive(Primitive::I32);
        let opt = b.optional(text);
        let res = b.result(text);
        let un = b.union("Shape", IntWidth::U8, [Member::new("label", text), Member::new("size", n)]);
        let r = b.record("R", [Member::new("opt", opt), Member::new("res", res), Member::new("un", un)]);
        let schema = Arc::new(b.build().unwrap());
        let codec = Codec::derive(&schema, r, &Config::default()).unwrap();

        let value = Value::record([
            ("opt", Value::some(Value::str("here"))),
            ("res", Value::err(404)),
            ("un", Value::arm("label", Value::str("circle"))),
        ]);
        let buf = codec.encode(&value).unwrap();
        let view = codec.view(&buf).unwrap();

        let opt = view.field("opt").unwrap().optional().unwrap().unwrap();
        assert_eq!(opt.as_str().unwrap(), "here");
        assert_eq!(view.field("res").unwrap().result().unwrap().unwrap_err(), 404);
        let (arm, payload) = view.field("un").unwrap().arm().unwrap();
        assert_eq!(arm, "label");
        assert_eq!(payload.as_str().unwrap(), "circle");
        assert_eq!(view.to_value().unwrap(), value);
    }

    #[test]
    fn pointer_views_and_null() {
        let mut b = SchemaBuilder::new();
        let n = b.primitive(Primitive::U16);
        let p = b.pointer(n);
        let q = b.optional_pointer(n);
        let r = b.record("Ptrs", [Member::new("p", p), Member::new("q", q)]);
        let schema = Arc::new(b.build().unwrap());
        let codec = Codec::derive(&schema, r, &Config::default()).unwrap();

        let value = Value::record([("p", Value::ptr(Value::Uint(7))), ("q", Value::Null)]);
        let mut buf = codec.encode(&value).unwrap();
        let view = codec.view(&buf).unwrap();
        assert_eq!(view.field("p").unwrap().pointee().unwrap().as_u64().unwrap(), 7);
        assert!(view.field("q").unwrap().is_null().unwrap());
        assert!(view.field("q").unwrap().optional().unwrap().is_none());
        assert!(matches!(view.field("q").unwrap().pointee(), Err(Error::Absent)));

        let mut root = codec.view_mut(&mut buf).unwrap();
        root.reborrow().field_mut("p").unwrap().pointee_mut().unwrap().replace(&Value::Uint(9)).unwrap();
        assert_eq!(codec.view(&buf).unwrap().field("p").unwrap().pointee().unwrap().as_u64().unwrap(), 9);
    }
}
