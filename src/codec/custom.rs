//! Custom extension codecs.
//!
//! A [`CustomCodec`] stands in for a schema type the compiler has no rule
//! for.  It obeys the same contract as derived nodes:
//!
//! - `write` and `dynamic_size` receive a start offset already aligned to
//!   the codec's dynamic alignment and return the offset just past the bytes
//!   they used.  For the same value both must return the same offset.
//! - `repoint` rewrites every address in the header from the region's
//!   current location and returns the same end offset `write` did.
//! - `read` sees the header and the dynamic region from its start offset on.
//!
//! Implementations must be thread-safe: a codec is shared by every buffer
//! derived from it.

use std::fmt;

use crate::codec::Dynamic;
use crate::engine::{load_address, store_address, Region};
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::value::Value;

pub trait CustomCodec: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn static_layout(&self) -> Layout;

    /// `None` when the codec keeps everything in its header.
    fn dynamic(&self) -> Option<Dynamic>;

    fn write(&self, value: &Value, header: &mut [u8], region: &mut Region<'_>, start: usize) -> Result<usize>;

    fn dynamic_size(&self, value: &Value, start: usize) -> Result<usize>;

    fn read(&self, header: &[u8], window: &[u8]) -> Result<Value>;

    fn repoint(&self, header: &mut [u8], region: &mut Region<'_>, start: usize) -> Result<usize>;
}

/// A byte string stored behind an address and terminated by a NUL byte.
///
/// Self-delimiting, so the value carries no stored length; the header is a
/// single address, which makes it layout-compatible with a C string pointer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NulTerminated;

impl NulTerminated {
    fn payload<'v>(&self, value: &'v Value) -> Result<&'v [u8]> {
        let bytes = value.as_bytes().ok_or_else(|| value.mismatch("bytes"))?;
        if bytes.contains(&0) {
            return Err(self.fail("value contains an interior NUL byte"));
        }
        Ok(bytes)
    }

    fn fail(&self, message: &str) -> Error {
        Error::Custom { codec: self.name().to_owned(), message: message.to_owned() }
    }

    fn terminator(&self, bytes: &[u8]) -> Result<usize> {
        bytes.iter().position(|&b| b == 0).ok_or_else(|| self.fail("missing NUL terminator"))
    }
}

impl CustomCodec for NulTerminated {
    fn name(&self) -> &str {
        "nul-terminated"
    }

    fn static_layout(&self) -> Layout {
        Layout::ADDRESS
    }

    fn dynamic(&self) -> Option<Dynamic> {
        Some(Dynamic { align: 1, fixed_size: None })
    }

    fn write(&self, value: &Value, header: &mut [u8], region: &mut Region<'_>, start: usize) -> Result<usize> {
        let bytes = self.payload(value)?;
        let dst = region.slice_mut(start, bytes.len() + 1)?;
        dst[..bytes.len()].copy_from_slice(bytes);
        dst[bytes.len()] = 0;
        store_address(header, 0, region.address(start))?;
        Ok(start + bytes.len() + 1)
    }

    fn dynamic_size(&self, value: &Value, start: usize) -> Result<usize> {
        Ok(start + self.payload(value)?.len() + 1)
    }

    fn read(&self, header: &[u8], window: &[u8]) -> Result<Value> {
        load_address(header, 0)?;
        let len = self.terminator(window)?;
        Ok(Value::Bytes(window[..len].to_vec()))
    }

    fn repoint(&self, header: &mut [u8], region: &mut Region<'_>, start: usize) -> Result<usize> {
        let len = self.terminator(region.tail(start)?)?;
        store_address(header, 0, region.address(start))?;
        Ok(start + len + 1)
    }
}
