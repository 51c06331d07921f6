//! Alignment arithmetic and slot placement.
//!
//! Every placement rule lives here so that plain layouts (computed per schema
//! type) and codec layouts (computed per derived node) agree byte for byte.

use std::cmp::Reverse;
use std::mem::{align_of, size_of};

use crate::config::IntWidth;

/// Size and alignment of a static image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Layout {
    pub size:  usize,
    pub align: usize,
}

impl Layout {
    pub const ZERO: Layout = Layout { size: 0, align: 1 };

    /// One machine address.
    pub const ADDRESS: Layout = Layout { size: size_of::<usize>(), align: align_of::<usize>() };

    #[inline]
    pub const fn new(size: usize, align: usize) -> Self {
        Self { size, align }
    }

    /// An address followed by a one-byte presence tag.
    pub const fn tagged_address() -> Self {
        let a = Self::ADDRESS;
        Self::new(align_up(a.size + 1, a.align), a.align)
    }

    /// An address followed by a length of the given width.
    pub const fn slice_header(length: IntWidth) -> Self {
        let a = Self::ADDRESS;
        let align = if length.size() > a.align { length.size() } else { a.align };
        Self::new(align_up(align_up(a.size, length.size()) + length.size(), align), align)
    }

    /// Offset of the length field inside [`Layout::slice_header`].
    pub const fn slice_length_offset(length: IntWidth) -> usize {
        align_up(Self::ADDRESS.size, length.size())
    }
}

/// Round `offset` up to the next multiple of `align` (a power of two).
#[inline]
pub const fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) & !(align - 1)
}

/// [`align_up`] that reports overflow instead of wrapping.
#[inline]
pub const fn checked_align_up(offset: usize, align: usize) -> Option<usize> {
    match offset.checked_add(align - 1) {
        Some(x) => Some(x & !(align - 1)),
        None => None,
    }
}

// ── Records ──────────────────────────────────────────────────────────────────

/// Where each slot of a record header lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordPlan {
    /// One offset per input slot, in input order.
    pub offsets: Vec<usize>,
    /// Offset of the trailing table (equal to the slot end when it is empty).
    pub table:   usize,
    pub layout:  Layout,
}

/// Place named slots by descending alignment, then descending size, then
/// name, and append `table` after them.  The result does not depend on the
/// order in which slots are given.
pub fn plan_record(slots: &[(&str, Layout)], table: Layout) -> RecordPlan {
    let mut order: Vec<usize> = (0..slots.len()).collect();
    order.sort_by_key(|&i| (Reverse(slots[i].1.align), Reverse(slots[i].1.size), slots[i].0));

    let mut offsets = vec![0; slots.len()];
    let mut cursor  = 0;
    let mut align   = 1;
    for i in order {
        let slot = slots[i].1;
        cursor     = align_up(cursor, slot.align);
        offsets[i] = cursor;
        cursor    += slot.size;
        align      = align.max(slot.align);
    }

    let table_at = if table.size > 0 { align_up(cursor, table.align) } else { cursor };
    if table.size > 0 {
        cursor = table_at + table.size;
        align  = align.max(table.align);
    }

    RecordPlan { offsets, table: table_at, layout: Layout::new(align_up(cursor, align), align) }
}

/// Place slots in declaration order with no padding.
pub fn plan_packed(slots: &[Layout]) -> RecordPlan {
    let mut offsets = Vec::with_capacity(slots.len());
    let mut cursor  = 0;
    for slot in slots {
        offsets.push(cursor);
        cursor += slot.size;
    }
    RecordPlan { offsets, table: cursor, layout: Layout::new(cursor, 1) }
}

// ── Unions ───────────────────────────────────────────────────────────────────

/// Where the payload slot and the discriminant of a union header land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnionPlan {
    pub payload: usize,
    pub tag:     usize,
    pub layout:  Layout,
}

/// The payload slot is as large and as aligned as the largest arm.  The tag
/// goes first only when it is more aligned than every arm; otherwise it
/// follows the payload.  An untagged union passes [`Layout::ZERO`].
pub fn plan_union(arms: &[Layout], tag: Layout) -> UnionPlan {
    let size  = arms.iter().map(|a| a.size).max().unwrap_or(0);
    let align = arms.iter().map(|a| a.align).max().unwrap_or(1);

    let (payload, tag_at, end) = if tag.align > align {
        let payload = align_up(tag.size, align);
        (payload, 0, payload + size)
    } else {
        let tag_at = align_up(size, tag.align);
        (0, tag_at, tag_at + tag.size)
    };
    let total_align = align.max(tag.align);

    UnionPlan {
        payload,
        tag: tag_at,
        layout: Layout::new(align_up(end, total_align), total_align),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(13, 4), 16);
        assert_eq!(align_up(5, 1), 5);
        assert_eq!(checked_align_up(13, 4), Some(16));
        assert_eq!(checked_align_up(usize::MAX - 2, 8), None);
    }

    #[test]
    fn record_plan_ignores_declaration_order() {
        let a = [("a", Layout::new(1, 1)), ("b", Layout::new(8, 8)), ("c", Layout::new(4, 4))];
        let b = [("c", Layout::new(4, 4)), ("a", Layout::new(1, 1)), ("b", Layout::new(8, 8))];
        let pa = plan_record(&a, Layout::ZERO);
        let pb = plan_record(&b, Layout::ZERO);
        assert_eq!(pa.layout, pb.layout);
        assert_eq!(pa.layout, Layout::new(16, 8));
        // Same field, same offset.
        assert_eq!(pa.offsets[1], pb.offsets[2]);
        assert_eq!(pa.offsets[0], pb.offsets[1]);
    }

    #[test]
    fn record_plan_appends_table() {
        let slots = [("x", Layout::new(1, 1))];
        let plan = plan_record(&slots, Layout::new(8, 4));
        assert_eq!(plan.table, 4);
        assert_eq!(plan.layout, Layout::new(12, 4));
    }

    #[test]
    fn packed_plan_has_no_padding() {
        let plan = plan_packed(&[Layout::new(1, 1), Layout::new(4, 4), Layout::new(2, 2)]);
        assert_eq!(plan.offsets, vec![0, 1, 5]);
        assert_eq!(plan.layout, Layout::new(7, 1));
    }

    #[test]
    fn union_tag_follows_more_aligned_payload() {
        let plan = plan_union(&[Layout::new(8, 8), Layout::new(2, 2)], Layout::new(1, 1));
        assert_eq!(plan.payload, 0);
        assert_eq!(plan.tag, 8);
        assert_eq!(plan.layout, Layout::new(16, 8));
    }

    #[test]
    fn union_tag_leads_when_more_aligned() {
        let plan = plan_union(&[Layout::new(3, 1), Layout::new(1, 1)], Layout::new(4, 4));
        assert_eq!(plan.tag, 0);
        assert_eq!(plan.payload, 4);
        assert_eq!(plan.layout, Layout::new(8, 4));
    }

    #[test]
    fn slice_header_fits_address_and_length() {
        let h = Layout::slice_header(IntWidth::U32);
        assert_eq!(Layout::slice_length_offset(IntWidth::U32), Layout::ADDRESS.size);
        assert_eq!(h.size, align_up(Layout::ADDRESS.size + 4, Layout::ADDRESS.align));
    }
}
