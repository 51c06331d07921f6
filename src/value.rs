//! Dynamic values written into and materialized out of buffers.

use std::borrow::Cow;

use crate::error::{Error, Result};

/// An instance of a schema type.
///
/// Sequences of `u8` materialize as [`Value::Bytes`]; writes accept either
/// `Bytes` or a `Seq` of integers for them.  Records are matched by field
/// name on write and come back in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Void,
    Bool(bool),
    Uint(u64),
    Int(i64),
    Float(f64),
    Enum(String),
    Bytes(Vec<u8>),
    Seq(Vec<Value>),
    /// Absent optional pointer or slice.
    Null,
    Pointer(Box<Value>),
    Record(Vec<(String, Value)>),
    Union(String, Box<Value>),
    Optional(Option<Box<Value>>),
    Result(std::result::Result<Box<Value>, u16>),
    /// Raw address held by an indirection that was not expanded.
    Address(usize),
    /// Raw slice header held by a slice that was not expanded.
    RawSlice { addr: usize, len: usize },
}

impl Value {
    pub fn str(s: &str) -> Self {
        Value::Bytes(s.as_bytes().to_vec())
    }

    pub fn ptr(v: Value) -> Self {
        Value::Pointer(Box::new(v))
    }

    pub fn some(v: Value) -> Self {
        Value::Optional(Some(Box::new(v)))
    }

    pub fn none() -> Self {
        Value::Optional(None)
    }

    pub fn ok(v: Value) -> Self {
        Value::Result(Ok(Box::new(v)))
    }

    pub fn err(code: u16) -> Self {
        Value::Result(Err(code))
    }

    pub fn arm(name: &str, v: Value) -> Self {
        Value::Union(name.to_owned(), Box::new(v))
    }

    pub fn record<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        Value::Record(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Field of a record value.
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Record(fields) => fields.iter().find(|(k, _)| k == name).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::Uint(v) => Some(v),
            Value::Int(v) => u64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int(v) => Some(v),
            Value::Uint(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Short name of the variant, for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Void          => "void",
            Value::Bool(_)       => "bool",
            Value::Uint(_)       => "unsigned integer",
            Value::Int(_)        => "signed integer",
            Value::Float(_)      => "float",
            Value::Enum(_)       => "enum variant",
            Value::Bytes(_)      => "bytes",
            Value::Seq(_)        => "sequence",
            Value::Null          => "null",
            Value::Pointer(_)    => "pointer",
            Value::Record(_)     => "record",
            Value::Union(..)     => "union",
            Value::Optional(_)   => "optional",
            Value::Result(_)     => "result",
            Value::Address(_)    => "raw address",
            Value::RawSlice{..}  => "raw slice",
        }
    }

    pub(crate) fn mismatch(&self, expected: &'static str) -> Error {
        Error::Mismatch { expected, found: self.kind_name() }
    }

    pub(crate) fn items(&self) -> Result<Items<'_>> {
        match self {
            Value::Bytes(b) => Ok(Items::Bytes(b)),
            Value::Seq(v) => Ok(Items::Values(v)),
            other => Err(other.mismatch("sequence")),
        }
    }

    pub(crate) fn require_field(&self, name: &str) -> Result<&Value> {
        match self {
            Value::Record(_) => self.field(name).ok_or_else(|| Error::MissingField(name.to_owned())),
            other => Err(other.mismatch("record")),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

// ── Sequence items ───────────────────────────────────────────────────────────

/// Elements of a sequence value, without copying `Bytes` into `Value`s.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Items<'v> {
    Bytes(&'v [u8]),
    Values(&'v [Value]),
}

impl<'v> Items<'v> {
    pub fn len(&self) -> usize {
        match self {
            Items::Bytes(b) => b.len(),
            Items::Values(v) => v.len(),
        }
    }

    pub fn get(&self, i: usize) -> Cow<'v, Value> {
        match *self {
            Items::Bytes(b) => Cow::Owned(Value::Uint(u64::from(b[i]))),
            Items::Values(v) => Cow::Borrowed(&v[i]),
        }
    }
}
