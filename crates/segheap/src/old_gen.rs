//! The old generation.
//!
//! An ordered list of segments: every segment but the last is *filled* (its
//! level is frozen until the next compaction) and the last is the *active*
//! segment that allocation bumps into. Segments freed by compaction either
//! go to a cache for reuse or back to the storage provider.
//!
//! The logical size of the generation is kept within `[min_size, max_size]`
//! and is page-granular up to one segment, segment-granular above.
//! External memory charged against the generation lowers its *effective*
//! size, which stops allocation early.

use std::ptr::NonNull;

use crate::cell::{CellPtr, GcCell, TaggedValue};
use crate::config::GcConfig;
use crate::error::{OomReason, OutOfMemory, StorageError};
use crate::kind::KindTable;
use crate::segment::Segment;
use crate::storage::{Storage, StorageProvider, OLD_STORAGE_NAME};
use crate::trace::{RangeVisitor, SlotVisitor};
use crate::young_gen::{EvacAcceptor, YoungGen};

#[cfg(feature = "tracing")]
use crate::tracing::internal::{
    log_heap_resized, log_segment_materialized, log_segments_released, log_storage_failure,
};

/// A position in the generation: a segment index and an offset in it.
///
/// Raw addresses cannot be compared across segments; locations order
/// lexicographically, which matches allocation order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Location {
    pub segment_num: usize,
    pub offset: usize,
}

impl Location {
    #[must_use]
    pub const fn new(segment_num: usize, offset: usize) -> Self {
        Self {
            segment_num,
            offset,
        }
    }
}

pub struct OldGen {
    provider: Box<dyn StorageProvider>,
    /// Filled segments followed by the active segment. Never empty.
    segments: Vec<Segment>,
    /// Retained segments, already grown to their full capacity.
    cache: Vec<Segment>,
    segment_size: usize,
    size: usize,
    min_size: usize,
    max_size: usize,
    external_memory: usize,
    used_in_filled_segments: usize,
    level_at_end_of_last_gc: Location,
    release_unused: bool,
    materializations: usize,
}

impl OldGen {
    /// Create the generation with one active segment sized to the minimum.
    ///
    /// # Errors
    ///
    /// Fails when the provider cannot supply the first segment.
    pub fn new(config: &GcConfig, mut provider: Box<dyn StorageProvider>) -> Result<Self, StorageError> {
        let segment_size = config.segment_size;
        debug_assert_eq!(provider.storage_size(), segment_size);

        // The old generation is at least two pages.
        let floor = 2 * sys_alloc::page_size();
        let min_size =
            Self::adjust_size_with_bounds(config.min_old_size, floor, usize::MAX, segment_size);
        let max_size =
            Self::adjust_size_with_bounds(config.max_old_size, floor, usize::MAX, segment_size)
                .max(min_size);

        let mut active = Segment::new(provider.new_storage(OLD_STORAGE_NAME)?);
        active.shrink_to(min_size.min(segment_size));

        let mut old = Self {
            provider,
            segments: vec![active],
            cache: Vec::new(),
            segment_size,
            size: min_size,
            min_size,
            max_size,
            external_memory: 0,
            used_in_filled_segments: 0,
            level_at_end_of_last_gc: Location::default(),
            release_unused: config.release_unused,
            materializations: 0,
        };
        old.did_finish_gc();
        old.update_effective_end_for_external_memory();
        Ok(old)
    }

    // ------------------------------------------------------------------
    // Size arithmetic
    // ------------------------------------------------------------------

    /// Clamp `desired` to `[min, max]`, then round it up to a page when it
    /// fits in one segment and to a whole number of segments otherwise.
    #[must_use]
    pub fn adjust_size_with_bounds(desired: usize, min: usize, max: usize, segment_size: usize) -> usize {
        let clamped = desired.min(max).max(min);
        let unit = if clamped <= segment_size {
            sys_alloc::page_size()
        } else {
            segment_size
        };
        clamped.div_ceil(unit).saturating_mul(unit)
    }

    /// [`adjust_size_with_bounds`](Self::adjust_size_with_bounds) within
    /// this generation's bounds.
    #[must_use]
    pub fn adjust_size(&self, desired: usize) -> usize {
        Self::adjust_size_with_bounds(desired, self.min_size, self.max_size, self.segment_size)
    }

    /// Segments needed to hold `size` bytes.
    #[must_use]
    pub const fn segments_for_size(&self, size: usize) -> usize {
        size.div_ceil(self.segment_size)
    }

    #[must_use]
    pub const fn max_segments(&self) -> usize {
        self.segments_for_size(self.max_size)
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub const fn min_size(&self) -> usize {
        self.min_size
    }

    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }

    #[must_use]
    pub const fn segment_size(&self) -> usize {
        self.segment_size
    }

    // ------------------------------------------------------------------
    // Segments
    // ------------------------------------------------------------------

    #[inline]
    fn filled_len(&self) -> usize {
        self.segments.len() - 1
    }

    #[inline]
    fn active(&self) -> &Segment {
        &self.segments[self.segments.len() - 1]
    }

    #[inline]
    fn active_mut(&mut self) -> &mut Segment {
        let last = self.segments.len() - 1;
        &mut self.segments[last]
    }

    /// The active segment.
    #[must_use]
    pub fn active_segment(&self) -> &Segment {
        self.active()
    }

    /// Filled segments followed by the active segment.
    #[must_use]
    pub fn used_segments(&self) -> &[Segment] {
        &self.segments
    }

    pub(crate) fn used_segments_mut(&mut self) -> &mut [Segment] {
        &mut self.segments
    }

    /// Number of filled segments.
    #[must_use]
    pub fn num_filled_segments(&self) -> usize {
        self.filled_len()
    }

    /// Number of segments held in the cache.
    #[must_use]
    pub fn num_cached_segments(&self) -> usize {
        self.cache.len()
    }

    /// How many times a new active segment was brought into use.
    #[must_use]
    pub const fn materializations(&self) -> usize {
        self.materializations
    }

    /// Index of the used segment whose reservation holds `addr`.
    #[must_use]
    pub fn segment_index_for(&self, addr: usize) -> Option<usize> {
        let base = addr & !(self.segment_size - 1);
        self.segments.iter().position(|s| s.start_addr() == base)
    }

    /// Returns `true` if `addr` lies in a used segment.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.segment_index_for(addr).is_some()
    }

    /// Dirty the card holding `slot_addr`, if it lies in this generation.
    pub fn dirty_card_for_address(&mut self, slot_addr: usize) {
        if let Some(i) = self.segment_index_for(slot_addr) {
            self.segments[i].cards_mut().dirty_card_for_address(slot_addr);
        }
    }

    #[must_use]
    pub fn is_card_for_address_dirty(&self, slot_addr: usize) -> bool {
        self.segment_index_for(slot_addr)
            .is_some_and(|i| self.segments[i].cards().is_card_for_address_dirty(slot_addr))
    }

    // ------------------------------------------------------------------
    // Usage
    // ------------------------------------------------------------------

    /// Bytes occupied by cells.
    #[must_use]
    pub fn used(&self) -> usize {
        self.used_in_filled_segments + self.active().used()
    }

    /// Offset of the level, counting every filled segment as full.
    #[must_use]
    pub fn level_offset(&self) -> usize {
        self.filled_len() * self.segment_size + self.active().used()
    }

    /// Space lost at the ends of filled segments.
    #[must_use]
    pub fn fragmentation_loss(&self) -> usize {
        self.filled_len() * self.segment_size - self.used_in_filled_segments
    }

    /// Bytes that can still be allocated without growing.
    #[must_use]
    pub fn available(&self) -> usize {
        let avail = self.size.saturating_sub(self.level_offset());
        avail.saturating_sub(self.trailing_external_memory())
    }

    /// The current allocation position.
    #[must_use]
    pub fn level(&self) -> Location {
        Location::new(self.filled_len(), self.active().used())
    }

    /// Address of `loc`.
    #[must_use]
    pub fn location_ptr(&self, loc: Location) -> NonNull<u8> {
        self.segments[loc.segment_num].ptr_at(loc.offset)
    }

    #[must_use]
    pub fn level_at_end_of_last_gc(&self) -> Location {
        self.level_at_end_of_last_gc
    }

    /// Remember the level as the end of the latest collection.
    pub fn did_finish_gc(&mut self) {
        self.level_at_end_of_last_gc = self.level();
    }

    /// Bytes allocated since [`did_finish_gc`](Self::did_finish_gc).
    #[must_use]
    pub fn bytes_allocated_since_last_gc(&self) -> usize {
        let last = self.level_at_end_of_last_gc;
        let Some(first) = self.segments.get(last.segment_num) else {
            return 0;
        };
        let mut res = first.used().saturating_sub(last.offset);
        for seg in &self.segments[last.segment_num + 1..] {
            res += seg.used();
        }
        res
    }

    /// Call `f` for every cell, dead or alive, in allocation order.
    pub fn for_all_objs(&self, mut f: impl FnMut(NonNull<GcCell>)) {
        for seg in &self.segments {
            seg.for_all_objs(&mut f);
        }
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Bump-allocate `size` bytes, bringing in the next segment when the
    /// active one is full. Records object boundaries in the card table.
    pub fn alloc_raw(&mut self, size: usize) -> Option<NonNull<u8>> {
        if let Some(ptr) = self.active_mut().allocate(size) {
            return Some(ptr);
        }
        self.alloc_raw_slow(size)
    }

    fn alloc_raw_slow(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size > self.segment_size {
            return None;
        }
        if self.materialize_next_segment() {
            self.active_mut().allocate(size)
        } else {
            None
        }
    }

    /// Allocation for a nursery survivor. Grows the generation if it must.
    pub(crate) fn alloc_for_promotion(&mut self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        if let Some(ptr) = self.alloc_raw(size) {
            return Ok(ptr);
        }
        if self.grow_to_fit(size) {
            if let Some(ptr) = self.alloc_raw(size) {
                return Ok(ptr);
            }
        }
        Err(OutOfMemory {
            requested: size,
            reason: OomReason::PromotionFailed,
        })
    }

    /// Make the next segment active, taking it from the cache or the
    /// provider. The current active segment becomes filled.
    ///
    /// Refuses when another segment would exceed the effective size, and
    /// leaves the generation unchanged when the provider fails.
    pub fn materialize_next_segment(&mut self) -> bool {
        if self.segments.len() >= self.segments_for_size(self.effective_size()) {
            return false;
        }

        let mut next = match self.cache.pop() {
            Some(seg) => seg,
            None => match self.provider.new_storage(OLD_STORAGE_NAME) {
                Ok(storage) => Segment::new(storage),
                Err(_err) => {
                    #[cfg(feature = "tracing")]
                    log_storage_failure(&_err);
                    return false;
                }
            },
        };
        next.grow_to_limit();

        let used_in_prev = self.active().used();
        self.active_mut().clear_external_memory_charge();
        self.segments.push(next);
        self.used_in_filled_segments += used_in_prev;
        self.materializations += 1;

        // The effective end may now fall in the new segment, and the tail
        // of the old one counts as fragmentation.
        self.update_effective_end_for_external_memory();

        #[cfg(feature = "tracing")]
        log_segment_materialized(self.filled_len(), self.cache.len());
        true
    }

    /// Acquire cached segments until `size` bytes worth of segments are
    /// committed. Gives back what it acquired when the provider fails.
    pub fn seed_segment_cache_for_size(&mut self, size: usize) -> bool {
        let required = self.segments_for_size(size);
        let cache_before = self.cache.len();

        while self.segments.len() + self.cache.len() < required {
            match self.provider.new_storage(OLD_STORAGE_NAME) {
                Ok(storage) => {
                    let mut seg = Segment::new(storage);
                    seg.grow_to_limit();
                    self.cache.push(seg);
                }
                Err(_err) => {
                    #[cfg(feature = "tracing")]
                    log_storage_failure(&_err);
                    let acquired: Vec<Segment> = self.cache.drain(cache_before..).collect();
                    for seg in acquired {
                        self.provider.delete_storage(seg.into_storage());
                    }
                    return false;
                }
            }
        }
        true
    }

    /// Returns `true` if `amount` bytes can be allocated without failure:
    /// they fit in the available space and the backing segments exist.
    pub fn ensure_fits(&mut self, amount: usize) -> bool {
        if amount > self.available() {
            return false;
        }
        self.seed_segment_cache_for_size(self.level_offset() + amount)
    }

    /// Grow just enough for `amount` more bytes. Fails when that would pass
    /// the maximum size or the segments cannot be acquired.
    pub fn grow_to_fit(&mut self, amount: usize) -> bool {
        let unavailable = self.level_offset() + self.trailing_external_memory();
        let needed = unavailable.saturating_add(amount);
        let adjusted = self.adjust_size(needed);

        if adjusted < needed {
            return false;
        }
        if !self.seed_segment_cache_for_size(self.level_offset() + amount) {
            return false;
        }
        self.grow_to(adjusted);
        true
    }

    /// Raise the logical size to `desired`, which must already be adjusted.
    pub fn grow_to(&mut self, desired: usize) {
        debug_assert_eq!(desired, self.adjust_size(desired), "size must be adjusted");
        if self.size >= desired {
            return;
        }
        if self.size < self.segment_size {
            debug_assert_eq!(self.filled_len(), 0);
            let target = desired.min(self.segment_size);
            self.active_mut().grow_to(target);
        }
        #[cfg(feature = "tracing")]
        log_heap_resized(self.size, desired);
        self.size = desired;
        self.update_effective_end_for_external_memory();
    }

    /// Lower the logical size to `desired`, which must already be adjusted.
    ///
    /// # Panics
    ///
    /// Panics if `desired` is below [`used`](Self::used).
    pub fn shrink_to(&mut self, desired: usize) {
        assert!(
            desired >= self.used(),
            "cannot shrink the old generation below its used bytes"
        );
        debug_assert_eq!(desired, self.adjust_size(desired), "size must be adjusted");
        if self.size <= desired {
            return;
        }
        if desired < self.segment_size {
            debug_assert_eq!(self.filled_len(), 0);
            self.active_mut().shrink_to(desired);
        }
        #[cfg(feature = "tracing")]
        log_heap_resized(self.size, desired);
        self.size = desired;
        self.update_effective_end_for_external_memory();
    }

    /// Resize towards `used / occupancy_target` after a full collection.
    pub(crate) fn resize_after_full_gc(&mut self, occupancy_target: f64) {
        #[allow(
            clippy::cast_precision_loss,
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss
        )]
        let target = (self.used() as f64 / occupancy_target) as usize;
        let desired = self
            .adjust_size(target)
            .max(self.adjust_size(self.level_offset()));
        if desired > self.size {
            self.grow_to(desired);
        } else if desired < self.size {
            self.shrink_to(desired);
        }
    }

    // ------------------------------------------------------------------
    // External memory
    // ------------------------------------------------------------------

    #[must_use]
    pub const fn external_memory(&self) -> usize {
        self.external_memory
    }

    pub fn credit_external_memory(&mut self, size: usize) {
        self.external_memory += size;
        self.update_effective_end_for_external_memory();
    }

    pub fn debit_external_memory(&mut self, size: usize) {
        debug_assert!(size <= self.external_memory, "debiting more than was credited");
        self.external_memory = self.external_memory.saturating_sub(size);
        self.update_effective_end_for_external_memory();
    }

    /// External memory not absorbed by fragmentation in filled segments.
    #[must_use]
    pub fn trailing_external_memory(&self) -> usize {
        self.external_memory
            .saturating_sub(self.fragmentation_loss())
    }

    /// Size minus the trailing external memory.
    #[must_use]
    pub fn effective_size(&self) -> usize {
        self.size.saturating_sub(self.trailing_external_memory())
    }

    /// Where allocation has to stop to leave room for external memory.
    ///
    /// `None` when that point lies beyond the used segments. Otherwise it
    /// is usually in the active segment, but an over-committed heap can put
    /// it inside a filled segment, below the level.
    #[must_use]
    pub fn effective_end(&self) -> Option<Location> {
        let offset = self.effective_size();
        let segment_num = offset / self.segment_size;
        let segment_off = offset % self.segment_size;
        if segment_num > self.filled_len() {
            None
        } else {
            Some(Location::new(segment_num, segment_off))
        }
    }

    /// Apply [`effective_end`](Self::effective_end) to the active segment,
    /// never below the level.
    pub fn update_effective_end_for_external_memory(&mut self) {
        let Some(desired) = self.effective_end() else {
            self.active_mut().clear_external_memory_charge();
            return;
        };
        let clamped = desired.max(self.level());
        debug_assert_eq!(
            clamped.segment_num,
            self.filled_len(),
            "effective end should be in the active segment"
        );
        let end = clamped.offset.min(self.active().size());
        self.active_mut().set_effective_end(end);
    }

    // ------------------------------------------------------------------
    // Young collection support
    // ------------------------------------------------------------------

    /// Promote nursery referents of slots on dirty cards, scanning every
    /// segment up to `original_level`. Clears the scanned card tables.
    pub(crate) fn mark_young_gen_pointers(
        &mut self,
        original_level: Location,
        young: &YoungGen,
        kinds: &KindTable,
    ) -> Result<usize, OutOfMemory> {
        let mut promoted = 0;
        if self.used() == 0 {
            return Ok(promoted);
        }

        for seg_num in 0..=original_level.segment_num {
            let (start, seg_level) = {
                let seg = &self.segments[seg_num];
                let level = if seg_num == original_level.segment_num {
                    original_level.offset
                } else {
                    seg.used()
                };
                (seg.start_addr(), seg.start_addr() + level)
            };
            if seg_level > start {
                let to = self.segments[seg_num].cards().address_to_index(seg_level - 1) + 1;
                let mut from = 0;
                while let Some(i_begin) = self.segments[seg_num].cards().find_next_dirty_card(from, to) {
                    let cards = self.segments[seg_num].cards();
                    let i_end = cards.find_next_clean_card(i_begin, to).unwrap_or(to);
                    let begin = cards.index_to_address(i_begin);
                    let end = cards.index_to_address(i_end);
                    let boundary = end.min(seg_level);
                    let first_obj = cards.first_obj_for_card(i_begin);

                    promoted += self.scan_dirty_run(first_obj, begin, end, boundary, young, kinds)?;
                    from = i_end;
                }
            }
            self.segments[seg_num].cards_mut().clear();
        }
        Ok(promoted)
    }

    /// Visit the objects overlapping `[begin, end)`, starting at
    /// `first_obj`. Objects that cross either edge are clamped to the range.
    fn scan_dirty_run(
        &mut self,
        first_obj: usize,
        begin: usize,
        end: usize,
        boundary: usize,
        young: &YoungGen,
        kinds: &KindTable,
    ) -> Result<usize, OutOfMemory> {
        let mut promoted = 0;
        // SAFETY: the card table only records addresses of cells in a used segment.
        let mut obj = unsafe { NonNull::new_unchecked(first_obj as *mut GcCell) };
        promoted += self.visit_cell(obj, Some((begin, end)), young, kinds)?;

        // SAFETY: `obj` is a well-formed cell below the scanned level.
        let mut next = unsafe { GcCell::next_cell(obj) };
        while (next as usize) < boundary {
            // SAFETY: `next` is below the level, so it is a cell.
            obj = unsafe { NonNull::new_unchecked(next) };
            next = unsafe { GcCell::next_cell(obj) };
            let range = ((next as usize) > end).then_some((begin, end));
            promoted += self.visit_cell(obj, range, young, kinds)?;
        }
        Ok(promoted)
    }

    fn visit_cell(
        &mut self,
        cell: NonNull<GcCell>,
        range: Option<(usize, usize)>,
        young: &YoungGen,
        kinds: &KindTable,
    ) -> Result<usize, OutOfMemory> {
        let mut acceptor = EvacAcceptor::new(young, self);
        // SAFETY: `cell` is a well-formed old generation cell.
        unsafe {
            match range {
                Some((lo, hi)) => kinds.trace(cell, &mut RangeVisitor::new(&mut acceptor, lo, hi)),
                None => kinds.trace(cell, &mut acceptor),
            }
        }
        acceptor.finish()
    }

    /// Scan every cell from `to_scan` to the level, promoting what they
    /// reference. Promotion extends the level, and may even bring in a new
    /// active segment, so the loop runs until the scan catches up.
    pub(crate) fn young_gen_transitive_closure(
        &mut self,
        to_scan: Location,
        young: &YoungGen,
        kinds: &KindTable,
    ) -> Result<usize, OutOfMemory> {
        let mut promoted = 0;
        let mut seg_num = to_scan.segment_num;
        let mut offset = to_scan.offset;

        while seg_num < self.filled_len() || offset < self.active().used() {
            // Filled segments: levels are fixed.
            while seg_num < self.filled_len() {
                let level = self.segments[seg_num].used();
                while offset < level {
                    let cell = self.segments[seg_num].ptr_at(offset).cast::<GcCell>();
                    // SAFETY: `offset` is a cell boundary below the level.
                    offset += unsafe { cell.as_ref() }.allocated_size();
                    promoted += self.visit_cell(cell, None, young, kinds)?;
                }
                seg_num += 1;
                offset = 0;
            }

            // Active segment: its level moves while we scan, and it can be
            // replaced by a freshly materialized one.
            let active_start = self.active().start_addr();
            while self.active().start_addr() == active_start && offset < self.active().used() {
                let level = self.active().used();
                while offset < level {
                    let cell = self.segments[seg_num].ptr_at(offset).cast::<GcCell>();
                    // SAFETY: as above.
                    offset += unsafe { cell.as_ref() }.allocated_size();
                    promoted += self.visit_cell(cell, None, young, kinds)?;
                }
            }
        }
        Ok(promoted)
    }

    // ------------------------------------------------------------------
    // Compaction support
    // ------------------------------------------------------------------

    /// Install the post-compaction levels, then release the trailing
    /// segments that received no cells. `levels[i]` is the new level of
    /// segment `i`; segments without an entry are released.
    pub(crate) fn record_level_after_compaction(&mut self, levels: &[usize]) {
        debug_assert!(levels.len() <= self.segments.len());
        for (seg, &level) in self.segments.iter_mut().zip(levels) {
            seg.set_level(level);
        }
        if self.release_unused {
            for seg in &self.segments[..levels.len().min(self.segments.len())] {
                if let Err(_err) = seg.advise_unused_tail() {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %_err, "advise_unused_failed");
                }
            }
        }
        self.release_segments(levels.len().max(1));

        let filled = self.filled_len();
        self.used_in_filled_segments = self.segments[..filled].iter().map(Segment::used).sum();
        for seg in &mut self.segments[..filled] {
            seg.clear_external_memory_charge();
        }
        self.update_effective_end_for_external_memory();
    }

    /// Keep the first `from` segments and cache or release the rest.
    pub(crate) fn release_segments(&mut self, from: usize) {
        debug_assert!(from > 0, "cannot release every segment");

        if self.release_unused {
            let cached: Vec<Segment> = self.cache.drain(..).collect();
            for seg in cached {
                self.provider.delete_storage(seg.into_storage());
            }
        }
        if from >= self.segments.len() {
            return;
        }

        let released: Vec<Segment> = self.segments.drain(from..).collect();
        #[cfg(feature = "tracing")]
        log_segments_released(released.len(), self.release_unused);
        for mut seg in released {
            if self.release_unused {
                self.provider.delete_storage(seg.into_storage());
            } else {
                seg.reset_level();
                seg.grow_to_limit();
                self.cache.push(seg);
            }
        }
    }

    /// Rebuild object boundaries in every used card table.
    pub(crate) fn recreate_card_table_boundaries(&mut self) {
        for seg in &mut self.segments {
            seg.recreate_card_table_boundaries();
        }
        #[cfg(feature = "slow-debug")]
        self.verify_card_table_boundaries();
    }

    /// Clean every card when the nursery is empty. Otherwise dirty every
    /// used card, since moved cells may now point into the nursery.
    pub(crate) fn update_card_tables_after_compaction(&mut self, young_is_empty: bool) {
        for seg in &mut self.segments {
            if young_is_empty {
                seg.cards_mut().clear();
            } else {
                let start = seg.start_addr();
                let level = start + seg.used();
                seg.cards_mut().dirty_range(start, level);
            }
        }
    }

    // ------------------------------------------------------------------
    // Verification
    // ------------------------------------------------------------------

    /// # Panics
    ///
    /// Panics when a card table's boundaries disagree with its segment.
    pub fn verify_card_table_boundaries(&self) {
        for seg in &self.segments {
            seg.verify_card_table_boundaries();
        }
    }

    /// # Panics
    ///
    /// Panics when the segments are not tiled by well-formed cells or the
    /// usage accounting drifted.
    pub fn check_well_formed(&self) {
        for seg in &self.segments {
            seg.check_well_formed();
        }
        let filled: usize = self.segments[..self.filled_len()].iter().map(Segment::used).sum();
        assert_eq!(filled, self.used_in_filled_segments, "fragmentation accounting drifted");
        assert!(self.size >= self.min_size && self.size <= self.max_size);
    }

    /// Check that every slot referencing the nursery lies on a dirty card.
    ///
    /// # Panics
    ///
    /// Panics on the first slot that does not.
    pub(crate) fn verify_card_table(&self, young: &YoungGen, kinds: &KindTable) {
        let mut verifier = CardVerifier { old: self, young };
        self.for_all_objs(|cell| {
            // SAFETY: cells produced by the segment walk.
            unsafe { kinds.trace(cell, &mut verifier) };
        });
    }
}

/// Asserts the card of every old-to-young slot is dirty. Value slots are
/// checked at the address of the whole value, as the barrier records it.
struct CardVerifier<'a> {
    old: &'a OldGen,
    young: &'a YoungGen,
}

impl CardVerifier<'_> {
    fn check<T>(&self, slot: *const T, target: usize) {
        if self.young.contains(target) {
            let slot_addr = slot as usize;
            assert!(
                self.old.is_card_for_address_dirty(slot_addr),
                "old-to-young slot at {slot_addr:#x} is on a clean card"
            );
        }
    }
}

impl SlotVisitor for CardVerifier<'_> {
    fn accept_ptr(&mut self, slot: &mut CellPtr) {
        self.check(std::ptr::from_mut(slot), slot.addr());
    }

    fn accept_value(&mut self, slot: &mut TaggedValue) {
        if let Some(ptr) = slot.as_ptr() {
            self.check(std::ptr::from_mut(slot), ptr.addr());
        }
    }
}

impl OldGen {
    /// Hand storage that was taken from this generation's provider back to
    /// it.
    pub(crate) fn return_storage(&mut self, storage: Storage) {
        self.provider.delete_storage(storage);
    }
}

impl Drop for OldGen {
    fn drop(&mut self) {
        let segments: Vec<Segment> = self.segments.drain(..).chain(self.cache.drain(..)).collect();
        for seg in segments {
            self.provider.delete_storage(seg.into_storage());
        }
    }
}

impl std::fmt::Debug for OldGen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OldGen")
            .field("size", &self.size)
            .field("used", &self.used())
            .field("segments", &self.segments.len())
            .field("cached", &self.cache.len())
            .field("external_memory", &self.external_memory)
            .finish_non_exhaustive()
    }
}
