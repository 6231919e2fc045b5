//! Heap segments.
//!
//! A segment is one [`Storage`] region with a bump cursor (`level`), a
//! logical end (`hi_lim`) that can move within the reservation, an
//! effective end that external-memory charges may pull below `hi_lim`, and
//! its [`CardTable`]. Positions are kept as offsets from the segment start.

use std::io;
use std::ptr::NonNull;

use crate::card_table::CardTable;
use crate::cell::{GcCell, CELL_ALIGN, HEADER_SIZE};
use crate::storage::Storage;

pub struct Segment {
    storage: Storage,
    hi_lim: usize,
    effective_end: usize,
    level: usize,
    cards: CardTable,
}

impl Segment {
    /// Wrap `storage`. The logical end starts at the full reservation.
    #[must_use]
    pub fn new(storage: Storage) -> Self {
        let size = storage.size();
        let cards = CardTable::new(storage.base().as_ptr() as usize, size);
        Self {
            storage,
            hi_lim: size,
            effective_end: size,
            level: 0,
            cards,
        }
    }

    /// Size of the reservation. The logical end never exceeds it.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.storage.size()
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> NonNull<u8> {
        self.storage.base()
    }

    #[inline]
    #[must_use]
    pub fn start_addr(&self) -> usize {
        self.start().as_ptr() as usize
    }

    /// Address `offset` bytes past the start.
    #[inline]
    pub(crate) fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset <= self.capacity());
        // SAFETY: in bounds of the reservation (or one past its end).
        unsafe { self.start().add(offset) }
    }

    /// Offset of `addr` from the start.
    #[inline]
    pub(crate) fn offset_of(&self, addr: usize) -> usize {
        debug_assert!(self.contains(addr) || addr == self.start_addr() + self.capacity());
        addr - self.start_addr()
    }

    #[inline]
    #[must_use]
    pub fn level(&self) -> NonNull<u8> {
        self.ptr_at(self.level)
    }

    /// Level as an offset from the start; equal to [`used`](Self::used).
    #[inline]
    #[must_use]
    pub const fn level_offset(&self) -> usize {
        self.level
    }

    #[inline]
    #[must_use]
    pub const fn used(&self) -> usize {
        self.level
    }

    #[inline]
    #[must_use]
    pub fn hi_lim(&self) -> NonNull<u8> {
        self.ptr_at(self.hi_lim)
    }

    /// Logical size of the segment.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> usize {
        self.hi_lim
    }

    #[inline]
    #[must_use]
    pub fn effective_end(&self) -> NonNull<u8> {
        self.ptr_at(self.effective_end)
    }

    /// Bytes left before the effective end.
    #[inline]
    #[must_use]
    pub const fn available(&self) -> usize {
        self.effective_end.saturating_sub(self.level)
    }

    /// Returns `true` if `addr` lies in the reservation.
    #[inline]
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.storage.contains(addr)
    }

    /// Returns `true` if `addr` lies in `[start, level]`.
    #[inline]
    #[must_use]
    pub fn contains_level(&self, addr: usize) -> bool {
        addr >= self.start_addr() && addr <= self.start_addr() + self.level
    }

    /// Bump-allocate `size` bytes. Fails locally when the request would
    /// cross the effective end.
    #[inline]
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        debug_assert!(size >= HEADER_SIZE && size % CELL_ALIGN == 0);
        if size > self.available() {
            return None;
        }
        let ptr = self.ptr_at(self.level);
        self.level += size;
        let start = ptr.as_ptr() as usize;
        self.cards.update_boundaries(start, start + size);
        Some(ptr)
    }

    /// Raise the logical end to `n` bytes. Clears any external-memory
    /// charge.
    pub fn grow_to(&mut self, n: usize) {
        debug_assert!(n <= self.capacity(), "cannot grow beyond the reservation");
        self.hi_lim = self.hi_lim.max(n.min(self.capacity()));
        self.effective_end = self.hi_lim;
    }

    /// Lower the logical end to `n` bytes. Clears any external-memory
    /// charge.
    pub fn shrink_to(&mut self, n: usize) {
        debug_assert!(n >= self.used(), "cannot shrink below the level");
        self.hi_lim = self.hi_lim.min(n.max(self.level));
        self.effective_end = self.hi_lim;
    }

    pub fn grow_to_limit(&mut self) {
        self.grow_to(self.capacity());
    }

    /// Stop allocation at `offset` bytes from the start.
    pub(crate) fn set_effective_end(&mut self, offset: usize) {
        debug_assert!(offset >= self.level && offset <= self.hi_lim);
        self.effective_end = offset.clamp(self.level, self.hi_lim);
    }

    pub fn clear_external_memory_charge(&mut self) {
        self.effective_end = self.hi_lim;
    }

    /// Set the level after compaction. Does not touch card boundaries.
    pub(crate) fn set_level(&mut self, offset: usize) {
        debug_assert!(offset <= self.hi_lim);
        self.level = offset;
    }

    /// Reclaim the whole segment.
    pub fn reset_level(&mut self) {
        self.level = 0;
        self.cards.clear();
        self.cards.reset_boundaries();
        self.clear_external_memory_charge();
    }

    #[inline]
    #[must_use]
    pub const fn cards(&self) -> &CardTable {
        &self.cards
    }

    #[inline]
    pub fn cards_mut(&mut self) -> &mut CardTable {
        &mut self.cards
    }

    /// Call `f` for every cell in `[start, level)`, dead or alive.
    pub fn for_all_objs(&self, f: impl FnMut(NonNull<GcCell>)) {
        self.for_objs_in_range(0, self.level, f);
    }

    /// Call `f` for every cell starting in `[lo, hi)` (offsets). `lo` must
    /// be a cell boundary.
    pub fn for_objs_in_range(&self, lo: usize, hi: usize, mut f: impl FnMut(NonNull<GcCell>)) {
        let end = self.ptr_at(hi.min(self.level)).as_ptr().cast::<GcCell>();
        let mut cur = self.ptr_at(lo).as_ptr().cast::<GcCell>();
        while cur < end {
            // SAFETY: cells in `[start, level)` are contiguous and well formed.
            let cell = unsafe { NonNull::new_unchecked(cur) };
            cur = unsafe { GcCell::next_cell(cell) };
            f(cell);
        }
    }

    /// `(start, end)` addresses of every cell, in order.
    fn cell_extents(&self) -> Vec<(usize, usize)> {
        let mut extents = Vec::new();
        self.for_all_objs(|cell| {
            let start = cell.as_ptr() as usize;
            // SAFETY: produced by the walk above.
            extents.push((start, start + unsafe { cell.as_ref() }.allocated_size()));
        });
        extents
    }

    /// Replay object boundaries into the card table after the layout
    /// changed.
    pub fn recreate_card_table_boundaries(&mut self) {
        let extents = self.cell_extents();
        self.cards.reset_boundaries();
        for (start, end) in extents {
            self.cards.update_boundaries(start, end);
        }
    }

    /// Check the boundary table against the layout.
    ///
    /// # Panics
    ///
    /// Panics on any mismatch.
    pub fn verify_card_table_boundaries(&self) {
        self.cards.verify_boundaries(self.cell_extents());
    }

    /// Check that cells tile `[start, level)` exactly.
    ///
    /// # Panics
    ///
    /// Panics when a cell is malformed or overruns the level.
    pub fn check_well_formed(&self) {
        let mut offset = 0;
        self.for_all_objs(|cell| {
            // SAFETY: produced by the walk.
            let size = unsafe { cell.as_ref() }.allocated_size();
            assert!(size >= HEADER_SIZE, "cell at offset {offset} is too small");
            assert_eq!(size % CELL_ALIGN, 0, "cell at offset {offset} is misaligned");
            offset += size;
        });
        assert_eq!(offset, self.level, "cells overrun the level");
    }

    /// Advise the pages above the level as unused.
    ///
    /// # Errors
    ///
    /// Propagates the OS error.
    pub fn advise_unused_tail(&self) -> io::Result<()> {
        self.storage
            .advise_unused(self.level, self.capacity() - self.level)
    }

    /// Give up the segment, returning its storage.
    #[must_use]
    pub fn into_storage(self) -> Storage {
        self.storage
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("start", &self.start())
            .field("level", &self.level)
            .field("hi_lim", &self.hi_lim)
            .field("effective_end", &self.effective_end)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card_table::CARD_SIZE;
    use crate::cell::cell_size;
    use crate::kind::CellKind;
    use crate::storage::{MallocStorageProvider, StorageProvider};

    fn segment(pages: usize) -> Segment {
        let size = sys_alloc::page_size() * pages;
        let mut provider = MallocStorageProvider::new(size);
        Segment::new(provider.new_storage("test").unwrap())
    }

    fn alloc_cell(seg: &mut Segment, size: usize) -> Option<NonNull<GcCell>> {
        let at = seg.allocate(size)?;
        Some(unsafe { GcCell::init(at, size, CellKind(1)) })
    }

    #[test]
    fn test_bump_allocation_respects_effective_end() {
        let mut seg = segment(1);
        let page = sys_alloc::page_size();
        seg.shrink_to(page / 2);
        let a = seg.allocate(64).unwrap();
        let b = seg.allocate(64).unwrap();
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 64);
        assert_eq!(seg.used(), 128);

        seg.set_effective_end(192);
        assert!(seg.allocate(128).is_none());
        assert!(seg.allocate(64).is_some());
        assert_eq!(seg.available(), 0);

        seg.clear_external_memory_charge();
        assert_eq!(seg.available(), page / 2 - 192);
    }

    #[test]
    fn test_grow_and_shrink_stay_in_reservation() {
        let mut seg = segment(2);
        let page = sys_alloc::page_size();
        seg.shrink_to(page);
        assert_eq!(seg.size(), page);
        seg.allocate(256).unwrap();
        seg.grow_to(page + 512);
        assert_eq!(seg.size(), page + 512);
        seg.grow_to_limit();
        assert_eq!(seg.size(), 2 * page);
        assert!(seg.allocate(2 * page).is_none());
    }

    #[test]
    fn test_for_all_objs_walks_every_cell() {
        let mut seg = segment(1);
        let sizes = [cell_size(0), cell_size(40), cell_size(1000), cell_size(8)];
        for size in sizes {
            alloc_cell(&mut seg, size).unwrap();
        }
        let mut seen = Vec::new();
        seg.for_all_objs(|c| seen.push(unsafe { c.as_ref() }.allocated_size()));
        assert_eq!(seen, sizes);
        seg.check_well_formed();
        seg.verify_card_table_boundaries();

        let mut tail = Vec::new();
        seg.for_objs_in_range(sizes[0] + sizes[1], seg.used(), |c| {
            tail.push(unsafe { c.as_ref() }.allocated_size());
        });
        assert_eq!(tail, &sizes[2..]);
    }

    #[test]
    fn test_allocation_records_card_boundaries() {
        let mut seg = segment(1);
        let big = alloc_cell(&mut seg, 2 * CARD_SIZE).unwrap();
        let small = alloc_cell(&mut seg, 64).unwrap();
        let cards = seg.cards();
        assert_eq!(cards.first_obj_for_card(1), big.as_ptr() as usize);
        assert_eq!(cards.first_obj_for_card(2), small.as_ptr() as usize);
    }

    #[test]
    fn test_reset_level_reclaims_everything() {
        let mut seg = segment(1);
        alloc_cell(&mut seg, 64).unwrap();
        let addr = seg.start_addr();
        seg.cards_mut().dirty_card_for_address(addr);
        seg.reset_level();
        assert_eq!(seg.used(), 0);
        assert_eq!(seg.cards().dirty_count(), 0);
        assert_eq!(seg.cards().boundary_index(), 0);
        assert!(seg.contains_level(addr));
    }

    #[test]
    fn test_advise_unused_tail() {
        let mut provider = crate::storage::MmapStorageProvider::new(sys_alloc::page_size() * 4);
        let mut seg = Segment::new(provider.new_storage("test").unwrap());
        alloc_cell(&mut seg, 64).unwrap();
        assert!(seg.advise_unused_tail().is_ok());
        assert_eq!(seg.used(), 64);
        provider.delete_storage(seg.into_storage());
    }
}
