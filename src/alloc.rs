//! Allocator contract used by the wrappers.
//!
//! Every allocation is handed back zero-initialised, so padding bytes in a
//! freshly written buffer are deterministic.  Zero-size requests never reach
//! the system allocator.

use std::ptr::NonNull;

use thiserror::Error;

use crate::layout::Layout;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("failed to allocate {size} bytes aligned to {align}")]
pub struct AllocError {
    pub size:  usize,
    pub align: usize,
}

impl AllocError {
    pub fn new(layout: Layout) -> Self {
        Self { size: layout.size, align: layout.align }
    }
}

pub trait Allocator: Clone {
    /// Zero-initialised block of `layout.size` bytes aligned to `layout.align`.
    fn alloc(&self, layout: Layout) -> Result<NonNull<u8>, AllocError>;

    /// # Safety
    /// `ptr` must come from `alloc` on this allocator with the same layout,
    /// and must not be used afterwards.
    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout);
}

/// The process allocator.
#[derive(Debug, Clone, Copy, Default)]
pub struct Global;

impl Allocator for Global {
    fn alloc(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        if layout.size == 0 {
            return dangling(layout.align).ok_or(AllocError::new(layout));
        }
        let std_layout =
            std::alloc::Layout::from_size_align(layout.size, layout.align).map_err(|_| AllocError::new(layout))?;
        // SAFETY: size is non-zero.
        let ptr = unsafe { std::alloc::alloc_zeroed(std_layout) };
        NonNull::new(ptr).ok_or(AllocError::new(layout))
    }

    unsafe fn free(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size == 0 {
            return;
        }
        // SAFETY: the caller guarantees ptr came from `alloc` with this layout,
        // which was accepted by `from_size_align` there.
        unsafe {
            let std_layout = std::alloc::Layout::from_size_align_unchecked(layout.size, layout.align);
            std::alloc::dealloc(ptr.as_ptr(), std_layout);
        }
    }
}

/// Well-aligned, non-null pointer for an empty block.
fn dangling(align: usize) -> Option<NonNull<u8>> {
    if !align.is_power_of_two() {
        return None;
    }
    NonNull::new(align as *mut u8)
}

// ── RawBuf ───────────────────────────────────────────────────────────────────

/// One owned, aligned, zero-initialised block, freed on drop.
pub(crate) struct RawBuf<A: Allocator> {
    ptr:    NonNull<u8>,
    layout: Layout,
    alloc:  A,
}

impl<A: Allocator> RawBuf<A> {
    pub fn new(size: usize, align: usize, alloc: A) -> Result<Self, AllocError> {
        let layout = Layout::new(size, align);
        let ptr = alloc.alloc(layout)?;
        Ok(Self { ptr, layout, alloc })
    }

    pub fn len(&self) -> usize {
        self.layout.size
    }

    pub fn align(&self) -> usize {
        self.layout.align
    }

    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size initialised bytes for as long as
        // self lives; for size 0 it is a dangling, aligned, non-null pointer.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size) }
    }
}

impl<A: Allocator> Drop for RawBuf<A> {
    fn drop(&mut self) {
        // SAFETY: ptr came from self.alloc with self.layout and is dropped once.
        unsafe { self.alloc.free(self.ptr, self.layout) }
    }
}

// SAFETY: RawBuf uniquely owns its block; sharing follows the usual &/&mut rules.
unsafe impl<A: Allocator + Send> Send for RawBuf<A> {}
unsafe impl<A: Allocator + Sync> Sync for RawBuf<A> {}

impl<A: Allocator> std::fmt::Debug for RawBuf<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawBuf").field("len", &self.layout.size).field("align", &self.layout.align).finish()
    }
}
