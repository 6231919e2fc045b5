//! The nursery.
//!
//! One segment with a fixed logical size. Allocation bumps into it; a young
//! collection copies every reachable cell into the old generation, leaves a
//! forwarding pointer behind and then empties the segment.

use std::ptr::{self, NonNull};

use crate::cell::{CellPtr, CellState, GcCell};
use crate::config::GcConfig;
use crate::error::{OutOfMemory, StorageError};
use crate::kind::KindTable;
use crate::old_gen::OldGen;
use crate::segment::Segment;
use crate::storage::{StorageProvider, YOUNG_STORAGE_NAME};
use crate::trace::SlotVisitor;

pub struct YoungGen {
    segment: Segment,
}

impl YoungGen {
    /// Take one segment from `provider` and limit it to the nursery size.
    ///
    /// # Errors
    ///
    /// Fails when the provider cannot supply the segment.
    pub fn new(config: &GcConfig, provider: &mut dyn StorageProvider) -> Result<Self, StorageError> {
        let mut segment = Segment::new(provider.new_storage(YOUNG_STORAGE_NAME)?);
        segment.shrink_to(config.young_size);
        Ok(Self { segment })
    }

    #[inline]
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.segment.allocate(size)
    }

    /// Returns `true` if `addr` is in the nursery's reservation.
    #[inline]
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.segment.contains(addr)
    }

    #[inline]
    #[must_use]
    pub const fn used(&self) -> usize {
        self.segment.used()
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> usize {
        self.segment.size()
    }

    #[inline]
    #[must_use]
    pub const fn available(&self) -> usize {
        self.segment.available()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.used() == 0
    }

    #[must_use]
    pub const fn segment(&self) -> &Segment {
        &self.segment
    }

    /// Set the level after compaction.
    pub(crate) fn set_level(&mut self, offset: usize) {
        self.segment.set_level(offset);
        self.segment.recreate_card_table_boundaries();
    }

    /// Empty the nursery.
    pub fn reset_level(&mut self) {
        self.segment.reset_level();
    }

    pub fn for_all_objs(&self, f: impl FnMut(NonNull<GcCell>)) {
        self.segment.for_all_objs(f);
    }

    pub fn into_segment(self) -> Segment {
        self.segment
    }

    /// Copy the nursery referent of `slot` into `old` unless it was copied
    /// already, and point the slot at the copy. Returns the bytes copied.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfMemory`] when the old generation cannot take the cell.
    pub(crate) fn ensure_referent_copied(
        &self,
        slot: &mut CellPtr,
        old: &mut OldGen,
    ) -> Result<usize, OutOfMemory> {
        let Some(cell) = slot.as_cell() else {
            return Ok(0);
        };
        if !self.contains(cell.as_ptr() as usize) {
            return Ok(0);
        }

        // SAFETY: nursery pointers reference well-formed cells below the level.
        let (state, size) = unsafe {
            let header = cell.as_ref();
            (header.state(), header.allocated_size())
        };
        if let CellState::Forwarded(to) = state {
            *slot = CellPtr::from_cell(to);
            return Ok(0);
        }

        let dst = old.alloc_for_promotion(size)?;
        let copy = dst.cast::<GcCell>();
        // SAFETY: `dst` is a fresh old-generation block of `size` bytes, disjoint
        // from the nursery.
        unsafe {
            ptr::copy_nonoverlapping(cell.as_ptr().cast::<u8>(), dst.as_ptr(), size);
            (*copy.as_ptr()).reset_gc_state();
            (*cell.as_ptr()).forward_to(copy);
        }
        *slot = CellPtr::from_cell(copy);
        Ok(size)
    }

    /// Run finalizers of every cell that was not copied out. Returns how
    /// many ran.
    pub(crate) fn finalize_unreachable(&self, kinds: &KindTable) -> usize {
        let mut finalized = 0;
        self.for_all_objs(|cell| {
            // SAFETY: cells produced by the segment walk; a cell still live
            // after evacuation is unreachable.
            unsafe {
                if cell.as_ref().state() == CellState::Live && kinds.finalize(cell) {
                    finalized += 1;
                }
            }
        });
        finalized
    }
}

impl std::fmt::Debug for YoungGen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YoungGen")
            .field("used", &self.used())
            .field("size", &self.size())
            .finish()
    }
}

/// Evacuates the nursery referents of visited slots.
///
/// The first failure is kept and every later slot is ignored, so a caller
/// checks [`finish`](Self::finish) once after tracing.
pub(crate) struct EvacAcceptor<'a> {
    young: &'a YoungGen,
    old: &'a mut OldGen,
    promoted: usize,
    failed: Option<OutOfMemory>,
}

impl<'a> EvacAcceptor<'a> {
    pub(crate) fn new(young: &'a YoungGen, old: &'a mut OldGen) -> Self {
        Self {
            young,
            old,
            promoted: 0,
            failed: None,
        }
    }

    /// Bytes promoted, or the first failure.
    pub(crate) fn finish(self) -> Result<usize, OutOfMemory> {
        match self.failed {
            Some(err) => Err(err),
            None => Ok(self.promoted),
        }
    }
}

impl SlotVisitor for EvacAcceptor<'_> {
    fn accept_ptr(&mut self, slot: &mut CellPtr) {
        if self.failed.is_some() {
            return;
        }
        match self.young.ensure_referent_copied(slot, self.old) {
            Ok(bytes) => self.promoted += bytes,
            Err(err) => self.failed = Some(err),
        }
    }
}
