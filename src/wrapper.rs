//! Owning buffers.
//!
//! [`Wrapper`] owns one allocation holding a value's header and dynamic
//! region; [`DynamicWrapper`] owns only the dynamic region and writes the
//! header into memory the caller provides.  Both size the allocation with
//! the size estimator first and write exactly once, so no buffer ever grows
//! mid-write.  Freeing happens on drop.
//!
//! Views borrow the wrapper, so the borrow checker rules out the classic
//! misuse of reading through a view after `set` replaced the allocation.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, Level};

use crate::alloc::{Allocator, Global, RawBuf};
use crate::codec::Codec;
use crate::engine::view::{View, ViewMut};
use crate::error::{Error, Result};
use crate::value::Value;

fn logs(codec: &Codec) -> bool {
    codec.config().log_level.enabled(Level::DEBUG)
}

// ── Wrapper ──────────────────────────────────────────────────────────────────

pub struct Wrapper<A: Allocator = Global> {
    codec:       Arc<Codec>,
    buf:         RawBuf<A>,
    dynamic_len: usize,
    /// No in-place edit has left slack in the dynamic region since the
    /// last full write.
    compact:     bool,
}

impl<A: Allocator> fmt::Debug for Wrapper<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wrapper")
            .field("type", &self.codec.schema().name(self.codec.root_type()))
            .field("len", &self.buf.len())
            .field("dynamic_len", &self.dynamic_len)
            .finish()
    }
}

impl Wrapper<Global> {
    pub fn init(codec: Arc<Codec>, value: &Value) -> Result<Self> {
        Self::init_in(codec, value, Global)
    }

    /// Copy an encoded buffer (from disk, another process, ...) and fix its
    /// addresses for the new location.
    pub fn adopt(codec: Arc<Codec>, bytes: &[u8]) -> Result<Self> {
        Self::adopt_in(codec, bytes, Global)
    }
}

impl<A: Allocator> Wrapper<A> {
    /// Bytes a buffer for `value` occupies.
    pub fn get_size(codec: &Codec, value: &Value) -> Result<usize> {
        codec.buffer_size(value)
    }

    pub fn init_in(codec: Arc<Codec>, value: &Value, alloc: A) -> Result<Self> {
        let size = codec.buffer_size(value)?;
        let mut buf = RawBuf::new(size, codec.buffer_align(), alloc)?;
        let used = codec.encode_into(value, buf.as_mut_slice())?;
        debug_assert_eq!(used, size);

        let dynamic_len = size - codec.dynamic_offset();
        if logs(&codec) {
            debug!(ty = codec.schema().name(codec.root_type()), size, dynamic_len, "buffer written");
        }
        Ok(Self { codec, buf, dynamic_len, compact: true })
    }

    pub fn adopt_in(codec: Arc<Codec>, bytes: &[u8], alloc: A) -> Result<Self> {
        let at = codec.dynamic_offset();
        if bytes.len() < at {
            return Err(Error::BufferTooSmall { expected: at, found: bytes.len() });
        }
        let mut buf = RawBuf::new(bytes.len(), codec.buffer_align(), alloc)?;
        buf.as_mut_slice().copy_from_slice(bytes);
        let walked = codec.repoint_buffer(buf.as_mut_slice())?;

        let dynamic_len = bytes.len() - at;
        if logs(&codec) {
            debug!(ty = codec.schema().name(codec.root_type()), len = bytes.len(), walked, "buffer adopted");
        }
        Ok(Self { codec, buf, dynamic_len, compact: walked == dynamic_len })
    }

    pub fn codec(&self) -> &Arc<Codec> {
        &self.codec
    }

    /// Whole buffer: header, padding, dynamic region.
    pub fn as_bytes(&self) -> &[u8] {
        self.buf.as_slice()
    }

    /// Raw access for loading bytes in place.  Call [`Wrapper::repoint`]
    /// before reading anything written this way.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.compact = false;
        self.buf.as_mut_slice()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.len() == 0
    }

    pub fn dynamic_len(&self) -> usize {
        self.dynamic_len
    }

    pub fn get(&self) -> Result<View<'_>> {
        self.codec.view(self.buf.as_slice())
    }

    pub fn get_mut(&mut self) -> Result<ViewMut<'_>> {
        self.compact = false;
        self.codec.view_mut(self.buf.as_mut_slice())
    }

    pub fn to_value(&self) -> Result<Value> {
        self.get()?.to_value()
    }

    /// Replace the whole value.  A new allocation is written first, so on
    /// error the current contents stay intact.
    pub fn set(&mut self, value: &Value) -> Result<()> {
        let next = Self::init_in(Arc::clone(&self.codec), value, self.buf.allocator().clone())?;
        if logs(&self.codec) {
            debug!(from = self.buf.len(), to = next.buf.len(), "buffer replaced");
        }
        *self = next;
        Ok(())
    }

    /// Copy the bytes into a new allocation and repoint them; cheaper than
    /// writing the value again.
    pub fn try_clone(&self) -> Result<Self> {
        let mut buf = RawBuf::new(self.buf.len(), self.buf.align(), self.buf.allocator().clone())?;
        buf.as_mut_slice().copy_from_slice(self.buf.as_slice());
        let walked = self.codec.repoint_buffer(buf.as_mut_slice())?;
        if self.compact {
            debug_assert_eq!(walked, self.dynamic_len, "repoint disagrees with the written length");
        } else {
            debug_assert!(walked <= self.dynamic_len);
        }
        if logs(&self.codec) {
            debug!(len = buf.len(), walked, "buffer cloned");
        }
        Ok(Self { codec: Arc::clone(&self.codec), buf, dynamic_len: self.dynamic_len, compact: self.compact })
    }

    /// Re-derive every embedded address from the buffer's location.
    pub fn repoint(&mut self) -> Result<usize> {
        self.codec.repoint_buffer(self.buf.as_mut_slice())
    }
}

// ── DynamicWrapper ───────────────────────────────────────────────────────────

/// Owns only the dynamic region of a value whose header lives elsewhere.
///
/// Every method that touches the value takes the header explicitly; it
/// must be the header this wrapper's bytes were written or repointed for.
pub struct DynamicWrapper<A: Allocator = Global> {
    codec:   Arc<Codec>,
    buf:     RawBuf<A>,
    compact: bool,
}

impl<A: Allocator> fmt::Debug for DynamicWrapper<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicWrapper")
            .field("type", &self.codec.schema().name(self.codec.root_type()))
            .field("len", &self.buf.len())
            .finish()
    }
}

impl DynamicWrapper<Global> {
    /// Write `value` into `header` plus a new dynamic region.  Returns
    /// `None` when the codec has no dynamic payload; `header` is written
    /// either way.
    pub fn init(codec: Arc<Codec>, value: &Value, header: &mut [u8]) -> Result<Option<Self>> {
        Self::init_in(codec, value, header, Global)
    }
}

impl<A: Allocator> DynamicWrapper<A> {
    pub fn init_in(codec: Arc<Codec>, value: &Value, header: &mut [u8], alloc: A) -> Result<Option<Self>> {
        if !codec.has_dynamic_payload() {
            codec.write(value, header, &mut [])?;
            return Ok(None);
        }
        Self::write_new(codec, value, header, alloc).map(Some)
    }

    fn write_new(codec: Arc<Codec>, value: &Value, header: &mut [u8], alloc: A) -> Result<Self> {
        let size = codec.dynamic_size(value, 0)?;
        let mut buf = RawBuf::new(size, codec.dynamic_align(), alloc)?;

        // Stage the header so a failed write leaves the caller's untouched.
        let mut staged = header.to_vec();
        let used = codec.write(value, &mut staged, buf.as_mut_slice())?;
        debug_assert_eq!(used, size, "write disagrees with dynamic_size");
        header.copy_from_slice(&staged);

        if logs(&codec) {
            debug!(ty = codec.schema().name(codec.root_type()), size, "dynamic region written");
        }
        Ok(Self { codec, buf, compact: true })
    }

    pub fn codec(&self) -> &Arc<Codec> {
        &self.codec
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buf.as_slice()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.len() == 0
    }

    pub fn get<'a>(&'a self, header: &'a [u8]) -> Result<View<'a>> {
        self.codec.read(header, self.buf.as_slice())
    }

    pub fn get_mut<'a>(&'a mut self, header: &'a mut [u8]) -> Result<ViewMut<'a>> {
        self.compact = false;
        self.codec.read_mut(header, self.buf.as_mut_slice())
    }

    /// Replace the value; the old region is freed only after the new one
    /// is fully written.
    pub fn set(&mut self, value: &Value, header: &mut [u8]) -> Result<()> {
        let alloc = self.buf.allocator().clone();
        *self = Self::write_new(Arc::clone(&self.codec), value, header, alloc)?;
        Ok(())
    }

    /// Copy the dynamic region and repoint `header`, which must be a copy
    /// of this wrapper's header.
    pub fn try_clone(&self, header: &mut [u8]) -> Result<Self> {
        let mut buf = RawBuf::new(self.buf.len(), self.buf.align(), self.buf.allocator().clone())?;
        buf.as_mut_slice().copy_from_slice(self.buf.as_slice());
        let walked = self.codec.repoint(header, buf.as_mut_slice())?;
        if self.compact {
            debug_assert_eq!(walked, self.buf.len(), "repoint disagrees with the written length");
        } else {
            debug_assert!(walked <= self.buf.len());
        }
        if logs(&self.codec) {
            debug!(len = buf.len(), walked, "dynamic region cloned");
        }
        Ok(Self { codec: Arc::clone(&self.codec), buf, compact: self.compact })
    }

    pub fn repoint(&mut self, header: &mut [u8]) -> Result<usize> {
        self.codec.repoint(header, self.buf.as_mut_slice())
    }
}
