//! Compile nested data shapes into codecs that lay a value out in one
//! contiguous buffer: a static header followed by a dynamic region, with
//! embedded addresses that can be re-derived after the bytes move.
//!
//! ```
//! use std::sync::Arc;
//! use contig::{Codec, Config, Member, Primitive, SchemaBuilder, Value, Wrapper};
//!
//! let mut b = SchemaBuilder::new();
//! let id = b.primitive(Primitive::U32);
//! let name = b.bytes();
//! let user = b.record("User", [Member::new("id", id), Member::new("name", name)]);
//! let schema = Arc::new(b.build()?);
//!
//! let codec = Arc::new(Codec::derive(&schema, user, &Config::default())?);
//! let value = Value::record([("id", Value::Uint(7)), ("name", Value::str("ada"))]);
//! let buf = Wrapper::init(Arc::clone(&codec), &value)?;
//! assert_eq!(buf.get()?.field("name")?.as_str()?, "ada");
//!
//! let moved = buf.try_clone()?;
//! assert_eq!(moved.to_value()?, value);
//! # Ok::<(), contig::Error>(())
//! ```

pub mod alloc;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod layout;
pub mod schema;
pub mod value;
pub mod wrapper;

pub use alloc::{AllocError, Allocator, Global};
pub use codec::{Codec, CodecCache, CustomCodec, Descriptor, Dynamic, NulTerminated};
pub use config::{Config, IntWidth, LogLevel};
pub use engine::view::{View, ViewMut};
pub use engine::Region;
pub use error::{Error, Result, SchemaError};
pub use layout::Layout;
pub use schema::{Kind, Member, Primitive, Schema, SchemaBuilder, TypeId};
pub use value::Value;
pub use wrapper::{DynamicWrapper, Wrapper};
