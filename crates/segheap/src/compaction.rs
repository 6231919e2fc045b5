//! Mark-sweep-compact over both generations.
//!
//! Marking runs from the roots with an explicit grey stack. The sweep walks
//! every used old segment and then the nursery, finalizes dead cells and
//! assigns live ones a target address from a [`CompactionPlan`]. After the
//! references are rewritten the cells slide down to their targets.
//!
//! The plan packs cells greedily into chunks laid out in the same order as
//! the walk, so a target never lies after its source and sliding in walk
//! order never overwrites a cell that has not moved yet.

use std::ptr::{self, NonNull};

use crate::cell::{CellPtr, CellState, GcCell};
use crate::kind::KindTable;
use crate::old_gen::OldGen;
use crate::trace::SlotVisitor;
use crate::young_gen::YoungGen;

/// Call `f` for every cell of the old generation, then of the nursery.
pub(crate) fn for_each_cell(old: &OldGen, young: &YoungGen, mut f: impl FnMut(NonNull<GcCell>)) {
    old.for_all_objs(&mut f);
    young.for_all_objs(f);
}

// ============================================================================
// Marking
// ============================================================================

/// Marks reached cells and queues them for tracing.
#[derive(Default)]
pub(crate) struct MarkAcceptor {
    grey: Vec<NonNull<GcCell>>,
    marked_cells: usize,
    marked_bytes: usize,
}

impl MarkAcceptor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Trace queued cells until the grey stack is empty.
    pub(crate) fn drain(&mut self, kinds: &KindTable) {
        while let Some(cell) = self.grey.pop() {
            // SAFETY: only well-formed, live heap cells are pushed.
            unsafe { kinds.trace(cell, self) };
        }
    }

    pub(crate) const fn marked_cells(&self) -> usize {
        self.marked_cells
    }

    pub(crate) const fn marked_bytes(&self) -> usize {
        self.marked_bytes
    }
}

impl SlotVisitor for MarkAcceptor {
    fn accept_ptr(&mut self, slot: &mut CellPtr) {
        let Some(cell) = slot.as_cell() else {
            return;
        };
        // SAFETY: slots of live cells and roots reference live cells.
        let header = unsafe { &mut *cell.as_ptr() };
        debug_assert_eq!(header.state(), CellState::Live);
        if header.mark() {
            self.marked_cells += 1;
            self.marked_bytes += header.allocated_size();
            self.grey.push(cell);
        }
    }
}

// ============================================================================
// Compaction plan
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Chunk {
    start: usize,
    end: usize,
    cursor: usize,
}

impl Chunk {
    const fn used(&self) -> usize {
        self.cursor - self.start
    }
}

/// Target space for the live cells: one chunk per used old segment, in
/// order, then the nursery.
#[derive(Debug)]
pub(crate) struct CompactionPlan {
    chunks: Vec<Chunk>,
    current: usize,
}

impl CompactionPlan {
    pub(crate) fn new(old: &OldGen, young: &YoungGen) -> Self {
        let chunk = |start: usize, size: usize| Chunk {
            start,
            end: start + size,
            cursor: start,
        };
        let mut chunks: Vec<Chunk> = old
            .used_segments()
            .iter()
            .map(|seg| chunk(seg.start_addr(), seg.size()))
            .collect();
        let young = young.segment();
        chunks.push(chunk(young.start_addr(), young.size()));
        Self { chunks, current: 0 }
    }

    /// Reserve `size` bytes in the current chunk or a later one.
    ///
    /// # Panics
    ///
    /// Panics if the chunks are exhausted, which cannot happen while the
    /// cells are allocated in walk order.
    fn allocate(&mut self, size: usize) -> NonNull<GcCell> {
        loop {
            let chunk = &mut self.chunks[self.current];
            if chunk.end - chunk.cursor >= size {
                let addr = chunk.cursor;
                chunk.cursor += size;
                // SAFETY: chunk bounds come from live segments.
                return unsafe { NonNull::new_unchecked(addr as *mut GcCell) };
            }
            self.current += 1;
            assert!(
                self.current < self.chunks.len(),
                "compaction plan overflowed its chunks"
            );
        }
    }

    /// New levels of the old segments. Always covers the first segment;
    /// trailing segments that received nothing are left out.
    pub(crate) fn old_levels(&self) -> Vec<usize> {
        let old = &self.chunks[..self.chunks.len() - 1];
        let keep = old.iter().rposition(|c| c.used() > 0).map_or(1, |i| i + 1);
        old[..keep].iter().map(Chunk::used).collect()
    }

    /// New level of the nursery.
    pub(crate) fn young_level(&self) -> usize {
        self.chunks[self.chunks.len() - 1].used()
    }
}

// ============================================================================
// Sweep, update, slide
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SweepStats {
    pub(crate) live_bytes: usize,
    pub(crate) dead_bytes: usize,
    pub(crate) finalized: usize,
}

/// Finalize dead cells and forward every marked one to its target.
pub(crate) fn sweep_and_install_forwarding_pointers(
    old: &OldGen,
    young: &YoungGen,
    kinds: &KindTable,
    plan: &mut CompactionPlan,
) -> SweepStats {
    let mut stats = SweepStats::default();
    for_each_cell(old, young, |cell| {
        // SAFETY: cells produced by the segment walks.
        unsafe {
            let size = cell.as_ref().allocated_size();
            if cell.as_ref().is_marked() {
                let target = plan.allocate(size);
                (*cell.as_ptr()).forward_to(target);
                stats.live_bytes += size;
            } else {
                if kinds.finalize(cell) {
                    stats.finalized += 1;
                }
                stats.dead_bytes += size;
            }
        }
    });
    stats
}

/// Rewrites slots that reference forwarded cells.
pub(crate) struct UpdateAcceptor;

impl SlotVisitor for UpdateAcceptor {
    fn accept_ptr(&mut self, slot: &mut CellPtr) {
        let Some(cell) = slot.as_cell() else {
            return;
        };
        // SAFETY: slots of live cells and roots reference live cells.
        if let CellState::Forwarded(to) = unsafe { cell.as_ref() }.state() {
            *slot = CellPtr::from_cell(to);
        }
    }
}

/// Rewrite the slots of every live cell through the forwarding pointers.
pub(crate) fn update_references(old: &OldGen, young: &YoungGen, kinds: &KindTable) {
    for_each_cell(old, young, |cell| {
        // SAFETY: cells produced by the segment walks; the payloads of marked
        // cells are still at their sources.
        unsafe {
            if cell.as_ref().is_marked() {
                kinds.trace(cell, &mut UpdateAcceptor);
            }
        }
    });
}

/// Move every forwarded cell to its target and clear its header state.
pub(crate) fn compact(old: &OldGen, young: &YoungGen) {
    for_each_cell(old, young, |cell| {
        // SAFETY: targets never lie after their sources and cells are
        // visited in address order, so every source is intact when read.
        unsafe {
            if let CellState::Forwarded(target) = cell.as_ref().state() {
                let size = cell.as_ref().allocated_size();
                ptr::copy(cell.as_ptr().cast::<u8>(), target.as_ptr().cast::<u8>(), size);
                (*target.as_ptr()).reset_gc_state();
            }
        }
    });
}
