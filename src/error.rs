//! Error types.
//!
//! Two families, matching when they can occur:
//!
//! - [`SchemaError`]: raised while a schema is built or a codec is derived.
//!   Fatal for that derivation: no codec is produced.
//! - [`Error`]: raised while sizing, writing, reading or relocating a buffer,
//!   or while allocating one.  Recoverable; no partially written buffer is
//!   left reachable through a [`crate::Wrapper`].

use thiserror::Error;

use crate::alloc::AllocError;
use crate::config::IntWidth;

// ── Derivation-time errors ───────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("type `{0}` was declared but never defined")]
    Undefined(String),
    #[error("unknown type id {0}")]
    UnknownType(u32),
    #[error("type `{0}` contains itself by value and has no finite size")]
    InfiniteSize(String),
    #[error("type `{ty}` uses unsupported schema node `{kind}`")]
    UnsupportedKind { ty: String, kind: &'static str },
    #[error("pointer of unknown length in `{0}`; enable `serialize_unknown_pointers_as_address` to store it as a raw address")]
    UnknownPointer(String),
    #[error("untagged union `{0}` carries dynamic data and cannot be read back unambiguously")]
    UntaggedDynamicUnion(String),
    #[error("arm `{arm}` of union `{ty}` is aligned to {align}, below the {required} its payload needs")]
    UnderalignedArm { ty: String, arm: String, align: usize, required: usize },
    #[error("field `{field}` of record `{ty}` is aligned to {align}, below the {required} its payload needs")]
    UnderalignedField { ty: String, field: String, align: usize, required: usize },
    #[error("packed record `{ty}` cannot hold dynamic field `{field}`")]
    PackedDynamicField { ty: String, field: String },
    #[error("`{0}` refers to itself while recursive re-referencing is disabled")]
    RecursiveReference(String),
    #[error("expansion budget exhausted at `{0}`")]
    BudgetExhausted(String),
    #[error("`{0}` would be stored as a raw, non-portable address")]
    UnsafeConversion(String),
    #[error("type `{0}` is defined more than once")]
    DuplicateType(String),
    #[error("duplicate member `{member}` in `{ty}`")]
    DuplicateMember { ty: String, member: String },
    #[error("invalid alignment {align} for `{member}` in `{ty}`")]
    InvalidAlignment { ty: String, member: String, align: usize },
    #[error("union `{0}` has no arms")]
    EmptyUnion(String),
    #[error("union `{ty}` has {arms} arms, more than a {width:?} tag can encode")]
    TagOverflow { ty: String, arms: usize, width: IntWidth },
}

// ── Runtime errors ───────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error("expected {expected}, found {found}")]
    Mismatch { expected: &'static str, found: &'static str },
    #[error("record value has no field `{0}`")]
    MissingField(String),
    #[error("no member named `{0}`")]
    NoSuchMember(String),
    #[error("`{0}` is not a variant of this enum")]
    UnknownVariant(String),
    #[error("discriminant {0} does not name a variant or arm")]
    InvalidDiscriminant(u64),
    #[error("{value} does not fit in {ty}")]
    OutOfRange { value: String, ty: &'static str },
    #[error("array expects {expected} elements, got {found}")]
    LengthMismatch { expected: usize, found: usize },
    #[error("length {len} does not fit a {width:?} length field")]
    LengthOverflow { len: usize, width: IntWidth },
    #[error("offset {offset} does not fit a {width:?} offset field")]
    OffsetOverflow { offset: usize, width: IntWidth },
    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("access to {start}..{end} lies outside the {len} tracked bytes")]
    OutOfBounds { start: usize, end: usize, len: usize },
    #[error("value needs {needed} dynamic bytes but only {available} are available in place")]
    CapacityExceeded { needed: usize, available: usize },
    #[error("buffer holds {found} bytes, {expected} required")]
    BufferTooSmall { expected: usize, found: usize },
    #[error("header holds {found} bytes, codec expects {expected}")]
    HeaderSize { expected: usize, found: usize },
    #[error("`{op}` is not supported on {shape}")]
    WrongShape { op: &'static str, shape: &'static str },
    #[error("absent value has no payload")]
    Absent,
    #[error("invalid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("custom codec `{codec}`: {message}")]
    Custom { codec: String, message: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
