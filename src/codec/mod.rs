//! Codecs: the compiled layout recipe for one schema type.
//!
//! # Buffer layout
//! ```text
//! [ static region: static_size ][ pad to dynamic_align ][ dynamic region ]
//! ```
//! The static region mirrors the type's shape.  Anything whose size varies
//! per value (pointer targets, sequence contents) lives in the dynamic
//! region, addressed from the header by absolute addresses (fixed up by
//! [`Codec::repoint_buffer`] after the bytes move) and from parents by
//! offsets (used by every read, so reads never follow stored addresses).
//!
//! # Identity
//! A codec is derived once per (schema type, [`Config`]) and never changes.
//! Two codecs with the same [`Codec::fingerprint`] lay values out
//! identically, which is what two processes must check before exchanging
//! buffers.  Both ends must also share pointer width and byte order.

pub mod compile;
pub mod custom;

pub use custom::{CustomCodec, NulTerminated};

use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{Config, IntWidth};
use crate::engine::view::{Target, View, ViewMut};
use crate::engine::Region;
use crate::error::{Error, Result, SchemaError};
use crate::layout::{align_up, Layout, UnionPlan};
use crate::schema::{Kind, Schema, TypeId};
use crate::value::Value;

// ── Descriptors ──────────────────────────────────────────────────────────────

/// Dynamic half of a [`Descriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dynamic {
    pub align:      usize,
    /// Set when every value of the type uses the same number of dynamic
    /// bytes, which lets parents locate it without a stored length.
    pub fixed_size: Option<usize>,
}

/// What a parent needs to know to embed a codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descriptor {
    pub static_size:  usize,
    pub static_align: usize,
    pub dynamic:      Option<Dynamic>,
}

impl Descriptor {
    pub fn layout(&self) -> Layout {
        Layout::new(self.static_size, self.static_align)
    }

    #[inline]
    pub fn has_dynamic_payload(&self) -> bool {
        self.dynamic.is_some()
    }

    #[inline]
    pub fn dynamic_align(&self) -> usize {
        self.dynamic.map_or(1, |d| d.align)
    }

    /// Whether a parent must record where this codec's dynamic bytes end.
    #[inline]
    pub fn needs_length(&self) -> bool {
        matches!(self.dynamic, Some(Dynamic { fixed_size: None, .. }))
    }

    /// Dynamic byte count shared by every value; zero for static codecs.
    #[inline]
    pub fn fixed_size(&self) -> Option<usize> {
        match self.dynamic {
            None => Some(0),
            Some(d) => d.fixed_size,
        }
    }
}

// ── Node arena ───────────────────────────────────────────────────────────────

pub(crate) type NodeId = usize;

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub ty:    TypeId,
    pub desc:  Descriptor,
    pub shape: Shape,
}

#[derive(Debug, Clone)]
pub(crate) struct Slot {
    pub name:   String,
    pub node:   NodeId,
    pub offset: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct Arm {
    pub name: String,
    pub node: NodeId,
}

#[derive(Debug, Clone)]
pub(crate) enum Shape {
    /// The type's plain image, copied as is.
    Direct,
    Pointer { child: NodeId, optional: bool, tagged: bool },
    Slice { elem: NodeId, optional: bool },
    Array { elem: NodeId, len: usize },
    /// `slots` in declaration order; `order` lists the dynamic slots in
    /// dynamic-region order; `table` is the header offset of the trailer.
    Record { slots: Vec<Slot>, order: Vec<usize>, table: usize },
    Union { arms: Vec<Arm>, tag: IntWidth, plan: UnionPlan },
    Optional { payload: NodeId, plan: UnionPlan },
    Result { ok: NodeId, plan: UnionPlan },
    Custom(Arc<dyn CustomCodec>),
}

impl Shape {
    pub fn name(&self) -> &'static str {
        match self {
            Shape::Direct         => "raw image",
            Shape::Pointer { .. } => "pointer",
            Shape::Slice { .. }   => "slice",
            Shape::Array { .. }   => "array",
            Shape::Record { .. }  => "record",
            Shape::Union { .. }   => "union",
            Shape::Optional { .. } => "optional",
            Shape::Result { .. }  => "result",
            Shape::Custom(_)      => "custom codec",
        }
    }

    fn children(&self) -> Vec<NodeId> {
        match self {
            Shape::Direct | Shape::Custom(_) => Vec::new(),
            Shape::Pointer { child, .. } => vec![*child],
            Shape::Slice { elem, .. } | Shape::Array { elem, .. } => vec![*elem],
            Shape::Record { slots, .. } => {
                let mut by_offset: Vec<&Slot> = slots.iter().collect();
                by_offset.sort_by_key(|s| s.offset);
                by_offset.into_iter().map(|s| s.node).collect()
            }
            Shape::Union { arms, .. } => arms.iter().map(|a| a.node).collect(),
            Shape::Optional { payload, .. } => vec![*payload],
            Shape::Result { ok, .. } => vec![*ok],
        }
    }
}

// ── Codec ────────────────────────────────────────────────────────────────────

pub struct Codec {
    schema: Arc<Schema>,
    config: Config,
    nodes:  Vec<Node>,
    root:   NodeId,
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codec")
            .field("type", &self.schema.name(self.root_type()))
            .field("descriptor", &self.descriptor())
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

impl Codec {
    /// Compile `ty` under `config`.
    pub fn derive(schema: &Arc<Schema>, ty: TypeId, config: &Config) -> Result<Self, SchemaError> {
        let (nodes, root) = compile::derive(schema, ty, config)?;
        Ok(Self { schema: Arc::clone(schema), config: config.clone(), nodes, root })
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn root_type(&self) -> TypeId {
        self.nodes[self.root].ty
    }

    pub fn descriptor(&self) -> Descriptor {
        self.nodes[self.root].desc
    }

    pub fn static_size(&self) -> usize {
        self.descriptor().static_size
    }

    pub fn static_align(&self) -> usize {
        self.descriptor().static_align
    }

    pub fn has_dynamic_payload(&self) -> bool {
        self.descriptor().has_dynamic_payload()
    }

    pub fn dynamic_align(&self) -> usize {
        self.descriptor().dynamic_align()
    }

    pub fn needs_length(&self) -> bool {
        self.descriptor().needs_length()
    }

    /// Number of nodes in the compiled graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub(crate) fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    // ── Region-level operations ──────────────────────────────────────────────

    /// Offset just past the dynamic bytes `value` needs when its dynamic
    /// window starts at `offset`.  `offset` must be aligned to
    /// [`Codec::dynamic_align`].
    pub fn dynamic_size(&self, value: &Value, offset: usize) -> Result<usize> {
        self.size_node(self.root, value, offset)
    }

    /// Write `value` into `header` and `dynamic`; returns the dynamic bytes
    /// consumed.  `dynamic` must be sized with [`Codec::dynamic_size`].
    pub fn write(&self, value: &Value, header: &mut [u8], dynamic: &mut [u8]) -> Result<usize> {
        let header = self.header_mut(header)?;
        let mut region = Region::new(dynamic);
        self.write_node(self.root, value, header, &mut region, 0)
    }

    /// Lazy view over a header and its dynamic region.
    pub fn read<'a>(&'a self, header: &'a [u8], dynamic: &'a [u8]) -> Result<View<'a>> {
        let header = self.header(header)?;
        Ok(View::new(self, Target::Node(self.root), header, dynamic, 0))
    }

    pub fn read_mut<'a>(&'a self, header: &'a mut [u8], dynamic: &'a mut [u8]) -> Result<ViewMut<'a>> {
        let header = self.header_mut(header)?;
        let end = dynamic.len();
        Ok(ViewMut::new(self, Target::Node(self.root), header, Region::new(dynamic), 0, end))
    }

    /// Rewrite every embedded address for the dynamic region's current
    /// location; returns the dynamic bytes walked.
    pub fn repoint(&self, header: &mut [u8], dynamic: &mut [u8]) -> Result<usize> {
        let header = self.header_mut(header)?;
        let mut region = Region::new(dynamic);
        self.repoint_node(self.root, header, &mut region, 0)
    }

    fn header<'b>(&self, header: &'b [u8]) -> Result<&'b [u8]> {
        let expected = self.static_size();
        header.get(..expected).ok_or(Error::HeaderSize { expected, found: header.len() })
    }

    fn header_mut<'b>(&self, header: &'b mut [u8]) -> Result<&'b mut [u8]> {
        let expected = self.static_size();
        let found = header.len();
        header.get_mut(..expected).ok_or(Error::HeaderSize { expected, found })
    }

    // ── Whole-buffer operations ──────────────────────────────────────────────

    /// Where the dynamic region starts inside a buffer.
    pub fn dynamic_offset(&self) -> usize {
        align_up(self.static_size(), self.dynamic_align())
    }

    /// Alignment a buffer must start at.
    pub fn buffer_align(&self) -> usize {
        self.static_align().max(self.dynamic_align())
    }

    /// Exact buffer length for `value`.
    pub fn buffer_size(&self, value: &Value) -> Result<usize> {
        Ok(self.dynamic_offset() + self.dynamic_size(value, 0)?)
    }

    /// Write `value` at the front of `buf`; returns the bytes used.
    pub fn encode_into(&self, value: &Value, buf: &mut [u8]) -> Result<usize> {
        let total = self.buffer_size(value)?;
        if buf.len() < total {
            return Err(Error::BufferTooSmall { expected: total, found: buf.len() });
        }
        let (header, dynamic) = self.split_mut(&mut buf[..total])?;
        let used = self.write(value, header, dynamic)?;
        debug_assert_eq!(self.dynamic_offset() + used, total, "write disagrees with dynamic_size");
        Ok(total)
    }

    /// Encode into a fresh vector.  Its addresses stay valid for as long as
    /// the vector's heap block does not move.
    pub fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.buffer_size(value)?];
        self.encode_into(value, &mut buf)?;
        Ok(buf)
    }

    pub fn view<'a>(&'a self, buf: &'a [u8]) -> Result<View<'a>> {
        let (header, dynamic) = self.split(buf)?;
        self.read(header, dynamic)
    }

    pub fn view_mut<'a>(&'a self, buf: &'a mut [u8]) -> Result<ViewMut<'a>> {
        let (header, dynamic) = self.split_mut(buf)?;
        self.read_mut(header, dynamic)
    }

    /// Fix up a buffer whose bytes were moved or copied.  Must run before
    /// anything dereferences the buffer's embedded addresses.
    pub fn repoint_buffer(&self, buf: &mut [u8]) -> Result<usize> {
        let (header, dynamic) = self.split_mut(buf)?;
        self.repoint(header, dynamic)
    }

    fn split<'b>(&self, buf: &'b [u8]) -> Result<(&'b [u8], &'b [u8])> {
        let at = self.dynamic_offset();
        if buf.len() < at {
            return Err(Error::BufferTooSmall { expected: at, found: buf.len() });
        }
        Ok(buf.split_at(at))
    }

    fn split_mut<'b>(&self, buf: &'b mut [u8]) -> Result<(&'b mut [u8], &'b mut [u8])> {
        let at = self.dynamic_offset();
        if buf.len() < at {
            return Err(Error::BufferTooSmall { expected: at, found: buf.len() });
        }
        Ok(buf.split_at_mut(at))
    }

    // ── Identity ─────────────────────────────────────────────────────────────

    /// BLAKE3 digest of the codec's canonical description.
    pub fn fingerprint(&self) -> [u8; 32] {
        blake3::hash(self.to_string().as_bytes()).into()
    }

    pub fn fingerprint_hex(&self) -> String {
        hex::encode(self.fingerprint())
    }

    fn describe_node(&self, id: NodeId, index: &HashMap<NodeId, usize>, out: &mut String) -> fmt::Result {
        let node = &self.nodes[id];
        let d = node.desc;
        write!(out, "{}/{}", d.static_size, d.static_align)?;
        match d.dynamic {
            None => out.push_str(" static "),
            Some(Dynamic { align, fixed_size: Some(f) }) => write!(out, " dyn {align}/{f} ")?,
            Some(Dynamic { align, fixed_size: None }) => write!(out, " dyn {align}/* ")?,
        }
        let n = |id: &NodeId| index[id];
        match &node.shape {
            Shape::Direct => self.plain_signature(node.ty, out)?,
            Shape::Pointer { child, optional, tagged } => {
                write!(out, "ptr{}{} -> n{}", if *optional { "?" } else { "" }, if *tagged { "+tag" } else { "" }, n(child))?
            }
            Shape::Slice { elem, optional } => {
                write!(out, "slice{} -> n{}", if *optional { "?" } else { "" }, n(elem))?
            }
            Shape::Array { elem, len } => write!(out, "array[{len}] -> n{}", n(elem))?,
            Shape::Record { slots, order, table } => {
                let mut by_offset: Vec<&Slot> = slots.iter().collect();
                by_offset.sort_by_key(|s| s.offset);
                write!(out, "record table@{table} {{")?;
                for s in by_offset {
                    write!(out, " {}@{} -> n{}", s.name, s.offset, n(&s.node))?;
                }
                out.push_str(" } order [");
                for &i in order {
                    write!(out, " {}", slots[i].name)?;
                }
                out.push_str(" ]");
            }
            Shape::Union { arms, tag, plan } => {
                write!(out, "union {:?}@{} payload@{} {{", tag, plan.tag, plan.payload)?;
                for a in arms {
                    write!(out, " {} -> n{}", a.name, n(&a.node))?;
                }
                out.push_str(" }");
            }
            Shape::Optional { payload, plan } => {
                write!(out, "optional tag@{} payload@{} -> n{}", plan.tag, plan.payload, n(payload))?
            }
            Shape::Result { ok, plan } => {
                write!(out, "result tag@{} payload@{} -> n{}", plan.tag, plan.payload, n(ok))?
            }
            Shape::Custom(c) => write!(out, "custom {}", c.name())?,
        }
        Ok(())
    }

    /// Structural description of a plain image, independent of type names.
    fn plain_signature(&self, ty: TypeId, out: &mut String) -> fmt::Result {
        let plain = self.schema.plain(ty);
        match self.schema.kind(ty) {
            Kind::Void => out.push_str("void"),
            Kind::Primitive(p) => out.push_str(p.name()),
            Kind::Enum { repr, variants } => {
                write!(out, "enum<{}>{{", repr.name())?;
                for (name, d) in variants {
                    write!(out, " {name}={d}")?;
                }
                out.push_str(" }");
            }
            Kind::Pointer { .. } | Kind::UnknownPointer { .. } => {
                out.push_str(if plain.tag.is_some() { "addr+tag" } else { "addr" })
            }
            Kind::Slice { .. } => out.push_str("rawslice"),
            Kind::Array { elem, len } => {
                write!(out, "[{len}]")?;
                self.plain_signature(*elem, out)?;
            }
            Kind::Record { fields, packed } => {
                let mut by_offset: Vec<(usize, &crate::schema::Member)> =
                    plain.offsets.iter().copied().zip(fields.iter()).collect();
                by_offset.sort_by_key(|(o, _)| *o);
                out.push_str(if *packed { "packed{" } else { "{" });
                for (offset, f) in by_offset {
                    write!(out, " {}@{}:", f.name, offset)?;
                    self.plain_signature(f.ty, out)?;
                }
                out.push_str(" }");
            }
            Kind::Union { arms, tag } => {
                match (tag, plain.tag) {
                    (Some(w), Some(at)) => write!(out, "union<{w:?}@{at}>{{")?,
                    _ => out.push_str("untagged{"),
                }
                for a in arms {
                    write!(out, " {}:", a.name)?;
                    self.plain_signature(a.ty, out)?;
                }
                out.push_str(" }");
            }
            Kind::Optional(inner) => {
                out.push('?');
                self.plain_signature(*inner, out)?;
            }
            Kind::Result { ok } => {
                out.push('!');
                self.plain_signature(*ok, out)?;
            }
            Kind::Custom(c) => write!(out, "custom:{}", c.name())?,
            Kind::Opaque => out.push_str("opaque"),
        }
        Ok(())
    }
}

/// Canonical description: one line per reachable node, numbered in
/// breadth-first order from the root.
impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut order = vec![self.root];
        let mut index = HashMap::from([(self.root, 0)]);
        let mut next = 0;
        while next < order.len() {
            for child in self.nodes[order[next]].shape.children() {
                if !index.contains_key(&child) {
                    index.insert(child, order.len());
                    order.push(child);
                }
            }
            next += 1;
        }

        writeln!(f, "lengths {:?} offsets {:?}", self.config.length_width, self.config.offset_width)?;
        for (k, &id) in order.iter().enumerate() {
            let mut line = String::new();
            self.describe_node(id, &index, &mut line)?;
            writeln!(f, "n{k} {line}")?;
        }
        Ok(())
    }
}

// ── Cache ────────────────────────────────────────────────────────────────────

/// Memoizes derived codecs per (type, configuration) for one schema.
///
/// Safe to share across threads; a codec is derived once per key and every
/// caller gets the same `Arc`.
#[derive(Debug)]
pub struct CodecCache {
    schema:  Arc<Schema>,
    entries: Mutex<HashMap<(TypeId, Config), Arc<Codec>>>,
}

impl CodecCache {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self { schema, entries: Mutex::new(HashMap::new()) }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn get(&self, ty: TypeId, config: &Config) -> Result<Arc<Codec>, SchemaError> {
        self.schema.get(ty)?;
        let key = (ty, config.cache_key());
        let mut entries = self.entries.lock();
        if let Some(codec) = entries.get(&key) {
            return Ok(Arc::clone(codec));
        }
        let codec = Arc::new(Codec::derive(&self.schema, ty, config)?);
        entries.insert(key, Arc::clone(&codec));
        Ok(codec)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;
    use crate::schema::{Member, Primitive, SchemaBuilder};

    fn scenario_a() -> (Arc<Schema>, TypeId) {
        let mut b = SchemaBuilder::new();
        let int = b.primitive(Primitive::I32);
        let bytes = b.bytes();
        let rec = b.record("A", [Member::new("a", int), Member::new("b", bytes)]);
        (Arc::new(b.build().unwrap()), rec)
    }

    #[test]
    fn descriptor_flags() {
        let d = Descriptor { static_size: 8, static_align: 8, dynamic: None };
        assert!(!d.has_dynamic_payload());
        assert!(!d.needs_length());
        assert_eq!(d.fixed_size(), Some(0));
        assert_eq!(d.dynamic_align(), 1);
    }

    #[test]
    fn cache_derives_once_per_layout_config() {
        let (schema, rec) = scenario_a();
        let cache = CodecCache::new(Arc::clone(&schema));
        let quiet = Config { log_level: LogLevel::Off, ..Config::default() };
        let a = cache.get(rec, &quiet).unwrap();
        let b = cache.get(rec, &Config::default()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);

        let narrow = Config { length_width: IntWidth::U16, ..Config::default() };
        let c = cache.get(rec, &narrow).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn display_lists_every_node() {
        let (schema, rec) = scenario_a();
        let codec = Codec::derive(&schema, rec, &Config::default()).unwrap();
        let text = codec.to_string();
        assert!(text.contains("record"));
        assert!(text.contains("slice -> n"));
        assert_eq!(codec.fingerprint_hex().len(), 64);
    }

    #[test]
    fn short_buffers_are_rejected() {
        let (schema, rec) = scenario_a();
        let codec = Codec::derive(&schema, rec, &Config::default()).unwrap();
        assert!(matches!(codec.view(&[0u8; 2]), Err(Error::BufferTooSmall { .. })));
        let mut small = [0u8; 2];
        assert!(matches!(codec.write(&Value::Void, &mut small, &mut []), Err(Error::HeaderSize { .. })));
    }
}
