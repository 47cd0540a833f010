//! Ordered free-list over a GPU virtual range

use std::collections::BTreeMap;
use std::ops::Range;

/// Round `value` up to a multiple of `align` (any non-zero alignment)
pub fn align_up(value: u64, align: u64) -> u64 {
    let align = align.max(1);
    (value + align - 1) / align * align
}

/// First address in `hole` satisfying size, alignment and the range limit
fn fit_in(hole: Range<u64>, size: u64, align: u64, limit: &Range<u64>) -> Option<u64> {
    let lo = hole.start.max(limit.start);
    let hi = hole.end.min(limit.end);
    let addr = align_up(lo, align);
    (addr.checked_add(size)? <= hi).then_some(addr)
}

/// First-fit allocator with hole coalescing
///
/// Holes are kept as `start -> end` in address order, so a scan visits them
/// lowest address first and adjacent holes can be merged on free.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeAllocator {
    span: Range<u64>,
    holes: BTreeMap<u64, u64>,
}

impl RangeAllocator {
    /// Allocator covering `span`, entirely free
    pub fn new(span: Range<u64>) -> Self {
        let mut holes = BTreeMap::new();
        if span.end > span.start {
            holes.insert(span.start, span.end);
        }
        Self { span, holes }
    }

    /// Total managed range
    pub fn span(&self) -> Range<u64> {
        self.span.clone()
    }

    /// Bytes not allocated
    pub fn free_bytes(&self) -> u64 {
        self.holes.iter().map(|(s, e)| e - s).sum()
    }

    /// Largest hole intersected with `limit`
    pub fn largest_hole(&self, limit: Range<u64>) -> u64 {
        self.holes
            .iter()
            .map(|(&s, &e)| e.min(limit.end).saturating_sub(s.max(limit.start)))
            .max()
            .unwrap_or(0)
    }

    /// Where an allocation would land, without taking it
    pub fn find_fit(&self, size: u64, align: u64, limit: Range<u64>) -> Option<u64> {
        self.holes
            .iter()
            .find_map(|(&s, &e)| fit_in(s..e, size, align, &limit))
    }

    /// Like [`find_fit`](Self::find_fit) but treating `extra` ranges as free too
    ///
    /// Used by the eviction scan to ask "would a hole appear if these
    /// bindings went away" without touching the free-list.
    pub fn find_fit_with(
        &self,
        extra: &[Range<u64>],
        size: u64,
        align: u64,
        limit: Range<u64>,
    ) -> Option<u64> {
        let mut ranges: Vec<Range<u64>> = self.holes.iter().map(|(&s, &e)| s..e).collect();
        ranges.extend(extra.iter().cloned());
        ranges.sort_by_key(|r| r.start);

        let mut merged: Vec<Range<u64>> = Vec::with_capacity(ranges.len());
        for r in ranges {
            match merged.last_mut() {
                Some(last) if r.start <= last.end => last.end = last.end.max(r.end),
                _ => merged.push(r),
            }
        }
        merged
            .into_iter()
            .find_map(|hole| fit_in(hole, size, align, &limit))
    }

    /// Allocate `size` bytes aligned to `align` within `limit`
    pub fn allocate(&mut self, size: u64, align: u64, limit: Range<u64>) -> Option<u64> {
        let addr = self.find_fit(size, align, limit)?;
        self.reserve(addr, size).then_some(addr)
    }

    /// Carve an exact range out of the free-list; false if any part is in use
    pub fn reserve(&mut self, start: u64, size: u64) -> bool {
        let end = start + size;
        let Some((&hole_start, &hole_end)) = self.holes.range(..=start).next_back() else {
            return false;
        };
        if hole_end < end {
            return false;
        }
        self.holes.remove(&hole_start);
        if hole_start < start {
            self.holes.insert(hole_start, start);
        }
        if end < hole_end {
            self.holes.insert(end, hole_end);
        }
        true
    }

    /// Return a range to the free-list, merging with its neighbours
    pub fn free(&mut self, start: u64, size: u64) {
        let mut lo = start;
        let mut hi = start + size;
        if let Some((&prev_start, &prev_end)) = self.holes.range(..start).next_back() {
            if prev_end == start {
                self.holes.remove(&prev_start);
                lo = prev_start;
            }
        }
        if let Some(next_end) = self.holes.remove(&hi) {
            hi = next_end;
        }
        self.holes.insert(lo, hi);
    }
}
