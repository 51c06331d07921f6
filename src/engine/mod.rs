//! Buffer engines: size estimation, writing, reading and relocation.
//!
//! All four traversals share the conventions set here:
//!
//! - Offsets are relative to the start of the dynamic region.  A node is
//!   always handed a start offset already aligned to its own dynamic
//!   alignment; parents align before every child.
//! - Integers and addresses are stored in native byte order through
//!   `byteorder`, so no access ever requires the bytes to be aligned.
//! - Every access is bounds-checked against the slice it was given and
//!   reported as [`Error::OutOfBounds`].

pub mod plain;
pub mod repoint;
pub mod size;
pub mod view;
pub mod write;

use std::ops::Range;

use byteorder::{ByteOrder, NativeEndian};

use crate::codec::{Arm, Descriptor};
use crate::config::IntWidth;
use crate::error::{Error, Result};
use crate::layout::checked_align_up;
use crate::value::Value;

// ── Region ───────────────────────────────────────────────────────────────────

/// A mutable suffix of a dynamic region.
///
/// Offsets given to a region are relative to the whole dynamic region, not
/// to the suffix, so nested writers keep using the same coordinates after a
/// parent has split off the bytes it still holds on to.
#[derive(Debug)]
pub struct Region<'a> {
    bytes:  &'a mut [u8],
    origin: usize,
    base:   usize,
}

impl<'a> Region<'a> {
    /// Region over a whole dynamic region; addresses are taken from the
    /// slice's current location.
    pub fn new(bytes: &'a mut [u8]) -> Self {
        let base = bytes.as_ptr() as usize;
        Self { bytes, origin: 0, base }
    }

    pub fn empty() -> Region<'static> {
        Region { bytes: &mut [], origin: 0, base: 0 }
    }

    #[inline]
    pub fn origin(&self) -> usize {
        self.origin
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.origin + self.bytes.len()
    }

    /// Absolute address of `offset` in the region's current location.
    #[inline]
    pub fn address(&self, offset: usize) -> usize {
        self.base.wrapping_add(offset)
    }

    fn local(&self, start: usize, len: usize) -> Result<Range<usize>> {
        let out = || Error::OutOfBounds { start, end: start.saturating_add(len), len: self.end() };
        let end = start.checked_add(len).ok_or_else(out)?;
        if start < self.origin || end > self.end() {
            return Err(out());
        }
        Ok(start - self.origin..end - self.origin)
    }

    pub fn slice(&self, start: usize, len: usize) -> Result<&[u8]> {
        let r = self.local(start, len)?;
        Ok(&self.bytes[r])
    }

    pub fn slice_mut(&mut self, start: usize, len: usize) -> Result<&mut [u8]> {
        let r = self.local(start, len)?;
        Ok(&mut self.bytes[r])
    }

    /// Everything from `start` to the end of the region.
    pub fn tail(&self, start: usize) -> Result<&[u8]> {
        let len = self.end().saturating_sub(start);
        self.slice(start, len)
    }

    pub fn reborrow(&mut self) -> Region<'_> {
        Region { bytes: &mut *self.bytes, origin: self.origin, base: self.base }
    }

    /// Split into the bytes before `at` and a region starting at `at`.
    pub fn split_at(self, at: usize) -> Result<(&'a mut [u8], Region<'a>)> {
        if at < self.origin || at > self.end() {
            return Err(Error::OutOfBounds { start: self.origin, end: at, len: self.end() });
        }
        let (head, tail) = self.bytes.split_at_mut(at - self.origin);
        Ok((head, Region { bytes: tail, origin: at, base: self.base }))
    }

    /// Take `[start, start + len)` out of the region together with the
    /// region that follows it.
    pub fn take(self, start: usize, len: usize) -> Result<(&'a mut [u8], Region<'a>)> {
        self.local(start, len)?;
        let origin = self.origin;
        let (head, tail) = self.split_at(start + len)?;
        Ok((&mut head[start - origin..], tail))
    }

    /// [`Region::take`] without giving up the region.
    pub fn carve(&mut self, start: usize, len: usize) -> Result<(&mut [u8], Region<'_>)> {
        self.reborrow().take(start, len)
    }

    /// The bytes from [`Region::origin`] on.
    pub fn bytes(&self) -> &[u8] {
        &*self.bytes
    }
}

// ── Bounds-checked byte access ───────────────────────────────────────────────

pub(crate) fn sub(bytes: &[u8], start: usize, len: usize) -> Result<&[u8]> {
    match start.checked_add(len) {
        Some(end) if end <= bytes.len() => Ok(&bytes[start..end]),
        _ => Err(Error::OutOfBounds { start, end: start.saturating_add(len), len: bytes.len() }),
    }
}

pub(crate) fn sub_mut(bytes: &mut [u8], start: usize, len: usize) -> Result<&mut [u8]> {
    match start.checked_add(len) {
        Some(end) if end <= bytes.len() => Ok(&mut bytes[start..end]),
        _ => Err(Error::OutOfBounds { start, end: start.saturating_add(len), len: bytes.len() }),
    }
}

pub(crate) fn load_uint(bytes: &[u8], at: usize, width: IntWidth) -> Result<u64> {
    let b = sub(bytes, at, width.size())?;
    Ok(match width {
        IntWidth::U8  => u64::from(b[0]),
        IntWidth::U16 => u64::from(NativeEndian::read_u16(b)),
        IntWidth::U32 => u64::from(NativeEndian::read_u32(b)),
        IntWidth::U64 => NativeEndian::read_u64(b),
    })
}

/// Store `value` truncated to `width`; callers check the range first.
pub(crate) fn store_uint(bytes: &mut [u8], at: usize, width: IntWidth, value: u64) -> Result<()> {
    let b = sub_mut(bytes, at, width.size())?;
    match width {
        IntWidth::U8  => b[0] = value as u8,
        IntWidth::U16 => NativeEndian::write_u16(b, value as u16),
        IntWidth::U32 => NativeEndian::write_u32(b, value as u32),
        IntWidth::U64 => NativeEndian::write_u64(b, value),
    }
    Ok(())
}

pub(crate) fn load_address(bytes: &[u8], at: usize) -> Result<usize> {
    Ok(load_uint(bytes, at, IntWidth::NATIVE)? as usize)
}

pub(crate) fn store_address(bytes: &mut [u8], at: usize, address: usize) -> Result<()> {
    store_uint(bytes, at, IntWidth::NATIVE, address as u64)
}

pub(crate) fn store_length(bytes: &mut [u8], at: usize, width: IntWidth, len: usize) -> Result<()> {
    if len as u64 > width.max_value() {
        return Err(Error::LengthOverflow { len, width });
    }
    store_uint(bytes, at, width, len as u64)
}

pub(crate) fn store_offset(bytes: &mut [u8], at: usize, width: IntWidth, offset: usize) -> Result<()> {
    if offset as u64 > width.max_value() {
        return Err(Error::OffsetOverflow { offset, width });
    }
    store_uint(bytes, at, width, offset as u64)
}

pub(crate) fn load_offset(bytes: &[u8], at: usize, width: IntWidth) -> Result<usize> {
    usize::try_from(load_uint(bytes, at, width)?)
        .map_err(|_| Error::OffsetOverflow { offset: usize::MAX, width })
}

/// Index and payload of the arm a union value selects.
pub(crate) fn active_arm<'v>(arms: &[Arm], value: &'v Value) -> Result<(usize, &'v Value)> {
    let Value::Union(name, inner) = value else {
        return Err(value.mismatch("union"));
    };
    let idx = arms
        .iter()
        .position(|a| a.name == *name)
        .ok_or_else(|| Error::NoSuchMember(name.clone()))?;
    Ok((idx, inner))
}

fn overflow() -> Error {
    Error::OutOfBounds { start: 0, end: usize::MAX, len: 0 }
}

/// `count * size`, or an error if the product overflows.
pub(crate) fn span(count: usize, size: usize) -> Result<usize> {
    count.checked_mul(size).ok_or_else(overflow)
}

/// `offset + len`, or an error if the sum overflows.
pub(crate) fn advance(offset: usize, len: usize) -> Result<usize> {
    offset.checked_add(len).ok_or_else(overflow)
}

fn align(offset: usize, to: usize) -> Result<usize> {
    checked_align_up(offset, to).ok_or_else(overflow)
}

// ── Sequence windows ─────────────────────────────────────────────────────────

/// Placement of a sequence's dynamic window.
///
/// A slice window holds the element images, then the offset table (only
/// for variable-size elements and at least two of them), then the element
/// section.  An array keeps its images in the header, so its window starts
/// directly with the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SeqPlan {
    pub images:  usize,
    pub table:   Option<usize>,
    pub section: usize,
    pub count:   usize,
    pub stride:  usize,
}

impl SeqPlan {
    pub fn slice(start: usize, count: usize, elem_size: usize, elem: &Descriptor, offsets: IntWidth) -> Result<Self> {
        Self::place(start, advance(start, span(count, elem_size)?)?, count, elem, offsets)
    }

    pub fn array(start: usize, count: usize, elem: &Descriptor, offsets: IntWidth) -> Result<Self> {
        Self::place(start, start, count, elem, offsets)
    }

    /// Lengths and offsets may come from untrusted bytes, so every step is
    /// checked.
    fn place(images: usize, cursor: usize, count: usize, elem: &Descriptor, offsets: IntWidth) -> Result<Self> {
        let da = elem.dynamic_align();
        let (table, cursor) = if elem.needs_length() && count >= 2 {
            let t = align(cursor, offsets.size())?;
            (Some(t), advance(t, span(count - 1, offsets.size())?)?)
        } else {
            (None, cursor)
        };
        let stride = match elem.fixed_size() {
            Some(f) => align(f, da)?,
            None => 0,
        };
        Ok(Self { images, table, section: align(cursor, da)?, count, stride })
    }

    pub fn table_len(&self, offsets: IntWidth) -> usize {
        if self.table.is_some() { (self.count - 1) * offsets.size() } else { 0 }
    }

    /// Table position and length, for carving it out of a region.
    pub fn table_span(&self, offsets: IntWidth) -> (usize, usize) {
        (self.table.unwrap_or(self.section), self.table_len(offsets))
    }

    /// Start of element `i`'s dynamic window; `entry` reads table entry `k`
    /// (the start of element `k + 1` relative to the section).
    pub fn locate(&self, i: usize, entry: impl FnOnce(usize) -> Result<usize>) -> Result<usize> {
        match (i, self.table) {
            (0, _) => Ok(self.section),
            (_, Some(_)) => advance(self.section, entry(i - 1)?),
            (_, None) => advance(self.section, span(i, self.stride)?),
        }
    }
}

/// Bytes of element `index`'s static image inside a run of images.
pub(crate) fn image(index: usize, size: usize) -> Range<usize> {
    index * size..(index + 1) * size
}
