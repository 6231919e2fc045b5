//! The heap and its collector.
//!
//! [`Heap`] owns the nursery, the old generation, the kind table and the
//! roots, and runs collections synchronously on the mutator's thread.
//!
//! A young collection copies every reachable nursery cell into the old
//! generation: roots first, then the cells those copies reference, then the
//! old cells on dirty cards. A full collection marks both generations from
//! the roots and slides the survivors down in place, nursery included. It
//! first empties the nursery like a young collection whenever the old
//! generation can absorb it.

use std::marker::PhantomData;
use std::mem::{size_of, ManuallyDrop};
use std::ptr::{self, NonNull};
use std::time::Instant;

use crate::cell::{cell_size, CellPtr, CellState, GcCell, TaggedValue};
use crate::compaction::{
    compact, sweep_and_install_forwarding_pointers, update_references, CompactionPlan,
    MarkAcceptor, UpdateAcceptor,
};
use crate::config::{GcConfig, OomPolicy};
use crate::error::{ConfigError, HeapError, OomReason, OutOfMemory};
use crate::kind::{slot_array, CellKind, HeapObject, KindTable};
use crate::metrics::{CollectionType, GcMetrics, HeapInfo, PhaseTimer};
use crate::old_gen::OldGen;
use crate::roots::{RootHandle, RootProvider, RootSet};
use crate::storage::{MmapStorageProvider, StorageProvider};
use crate::trace::{SlotVisitor, Trace};
use crate::young_gen::{EvacAcceptor, YoungGen};

#[cfg(feature = "tracing")]
use crate::tracing::internal::{
    log_collection_end, log_oom, log_phase_end, log_phase_start, log_young_fallback, next_gc_id,
    trace_gc_collection, trace_phase,
};

// ============================================================================
// GcPhase
// ============================================================================

/// Where the collector is.
///
/// Young collections run `Idle → MarkRoots → EvacuateYoung →
/// ScanDirtyCards → Idle`; full collections continue from `ScanDirtyCards`
/// through `SweepOld → UpdateReferences → Compact → Idle`. `Oom` is
/// terminal and reachable from any phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GcPhase {
    /// The mutator owns the heap.
    #[default]
    Idle = 0,
    /// Roots are being evacuated.
    MarkRoots = 1,
    /// Promoted cells are scanned for further nursery references.
    EvacuateYoung = 2,
    /// Old cells on dirty cards are scanned.
    ScanDirtyCards = 3,
    /// Marking and sweeping of both generations.
    SweepOld = 4,
    /// Slots are rewritten to the post-compaction addresses.
    UpdateReferences = 5,
    /// Cells slide to their new addresses.
    Compact = 6,
    /// An allocation could not be satisfied. The heap is unusable.
    Oom = 7,
}

impl GcPhase {
    #[must_use]
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Idle),
            1 => Some(Self::MarkRoots),
            2 => Some(Self::EvacuateYoung),
            3 => Some(Self::ScanDirtyCards),
            4 => Some(Self::SweepOld),
            5 => Some(Self::UpdateReferences),
            6 => Some(Self::Compact),
            7 => Some(Self::Oom),
            _ => None,
        }
    }

    /// Slot of this phase in [`GcMetrics::phase_durations`].
    #[must_use]
    pub const fn timing_index(self) -> Option<usize> {
        match self {
            Self::Idle | Self::Oom => None,
            phase => Some(phase as usize - 1),
        }
    }

    /// Returns `true` if moving from `self` to `to` is allowed.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Idle, Self::MarkRoots)
                | (Self::MarkRoots, Self::EvacuateYoung)
                | (Self::EvacuateYoung, Self::ScanDirtyCards)
                | (Self::ScanDirtyCards | Self::Compact, Self::Idle)
                | (Self::ScanDirtyCards, Self::SweepOld)
                | (Self::SweepOld, Self::UpdateReferences)
                | (Self::UpdateReferences, Self::Compact)
                | (_, Self::Oom)
        )
    }
}

// ============================================================================
// Heap
// ============================================================================

/// A generational heap.
///
/// Cells are referenced with [`CellPtr`]s. A collection can move any cell,
/// so a `CellPtr` held outside the heap is only valid until the next
/// allocation or collection unless it is stored in a root
/// ([`new_root`](Self::new_root)) or reported by a [`RootProvider`].
pub struct Heap {
    config: GcConfig,
    kinds: KindTable,
    young: ManuallyDrop<YoungGen>,
    old: OldGen,
    roots: RootSet,
    providers: Vec<Box<dyn RootProvider>>,
    phase: GcPhase,
    metrics: GcMetrics,
    totals: HeapInfo,
    _not_send: PhantomData<*mut ()>,
}

impl Heap {
    /// A heap backed by anonymous mappings.
    ///
    /// # Errors
    ///
    /// Fails when `config` is invalid or the initial segments cannot be
    /// mapped.
    pub fn new(config: GcConfig) -> Result<Self, HeapError> {
        let provider = MmapStorageProvider::new(config.segment_size);
        Self::with_storage_provider(config, Box::new(provider))
    }

    /// A heap taking its segments from `provider`.
    ///
    /// # Errors
    ///
    /// Fails when `config` is invalid, the provider's storage size differs
    /// from the segment size, or the initial segments cannot be acquired.
    pub fn with_storage_provider(
        config: GcConfig,
        mut provider: Box<dyn StorageProvider>,
    ) -> Result<Self, HeapError> {
        config.validate()?;
        if provider.storage_size() != config.segment_size {
            return Err(ConfigError::ProviderSize {
                provider: provider.storage_size(),
                segment_size: config.segment_size,
            }
            .into());
        }

        let young = YoungGen::new(&config, provider.as_mut()).map_err(|source| {
            HeapError::Storage {
                generation: "young",
                source,
            }
        })?;
        let old = OldGen::new(&config, provider).map_err(|source| HeapError::Storage {
            generation: "old",
            source,
        })?;

        Ok(Self {
            config,
            kinds: KindTable::new(),
            young: ManuallyDrop::new(young),
            old,
            roots: RootSet::new(),
            providers: Vec::new(),
            phase: GcPhase::Idle,
            metrics: GcMetrics::new(),
            totals: HeapInfo::default(),
            _not_send: PhantomData,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &GcConfig {
        &self.config
    }

    #[must_use]
    pub const fn phase(&self) -> GcPhase {
        self.phase
    }

    /// Returns `true` while the mutator may allocate and store.
    #[must_use]
    pub fn owns_alloc_context(&self) -> bool {
        self.phase == GcPhase::Idle
    }

    fn assert_owns_alloc_context(&self) {
        assert!(
            self.owns_alloc_context(),
            "heap used in phase {:?}; it is unusable after running out of memory",
            self.phase
        );
    }

    fn transition_to(&mut self, to: GcPhase) -> bool {
        if !self.phase.can_transition_to(to) {
            return false;
        }
        self.phase = to;
        true
    }

    fn enter_phase(&mut self, phase: GcPhase, timer: &mut PhaseTimer) {
        #[cfg(feature = "tracing")]
        if self.phase != GcPhase::Idle {
            log_phase_end(self.phase, self.bytes_used());
        }
        let moved = self.transition_to(phase);
        debug_assert!(moved, "invalid phase transition to {phase:?}");
        timer.begin(phase);
        #[cfg(feature = "tracing")]
        log_phase_start(phase, self.bytes_used());
    }

    /// Close the last phase and hand the heap back to the mutator.
    fn leave_phases(&mut self, timer: &mut PhaseTimer) {
        timer.finish();
        #[cfg(feature = "tracing")]
        log_phase_end(self.phase, self.bytes_used());
        let moved = self.transition_to(GcPhase::Idle);
        debug_assert!(moved, "collection ended in phase {:?}", self.phase);
    }

    #[must_use]
    pub fn young_gen(&self) -> &YoungGen {
        &self.young
    }

    #[must_use]
    pub const fn old_gen(&self) -> &OldGen {
        &self.old
    }

    /// Direct access to the old generation, for tests that steer its size.
    #[cfg(feature = "test-util")]
    pub fn old_gen_mut(&mut self) -> &mut OldGen {
        &mut self.old
    }

    #[must_use]
    pub const fn kinds(&self) -> &KindTable {
        &self.kinds
    }

    /// Bytes in use in both generations.
    #[must_use]
    pub fn bytes_used(&self) -> usize {
        self.young.used() + self.old.used()
    }

    /// Statistics of the latest collection.
    #[must_use]
    pub const fn last_gc_metrics(&self) -> GcMetrics {
        self.metrics
    }

    #[must_use]
    pub fn info(&self) -> HeapInfo {
        HeapInfo {
            young_used: self.young.used(),
            young_size: self.young.size(),
            old_used: self.old.used(),
            old_size: self.old.size(),
            old_segments: self.old.used_segments().len(),
            cached_segments: self.old.num_cached_segments(),
            external_memory: self.old.external_memory(),
            ..self.totals
        }
    }

    /// Call `f` for every cell in the heap, dead or alive, old generation
    /// first.
    pub fn for_all_objs(&self, mut f: impl FnMut(CellPtr)) {
        self.old.for_all_objs(|cell| f(CellPtr::from_cell(cell)));
        self.young.for_all_objs(|cell| f(CellPtr::from_cell(cell)));
    }

    /// Returns `true` if `ptr` references a cell in this heap.
    #[must_use]
    pub fn contains(&self, ptr: CellPtr) -> bool {
        let addr = ptr.addr();
        self.young.contains(addr) || self.old.contains(addr)
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Move `value` into a new cell, normally in the nursery.
    ///
    /// Slots in `value` are treated as roots if the allocation collects.
    pub fn alloc<T: HeapObject>(&mut self, value: T) -> CellPtr {
        self.assert_owns_alloc_context();
        let kind = self.kinds.kind_of::<T>();
        let size = cell_size(size_of::<T>());
        let mut value = value;
        let ptr = self.alloc_cell_memory(size, &mut value);
        // SAFETY: fresh block of `size` bytes.
        unsafe { self.init_cell(ptr, size, kind, value) }
    }

    /// Move `value` into a new cell in the old generation.
    pub fn alloc_long_lived<T: HeapObject>(&mut self, value: T) -> CellPtr {
        self.assert_owns_alloc_context();
        let kind = self.kinds.kind_of::<T>();
        let size = cell_size(size_of::<T>());
        let mut value = value;
        let ptr = self.alloc_old(size, &mut value);
        // SAFETY: fresh block of `size` bytes.
        unsafe { self.init_cell(ptr, size, kind, value) }
    }

    /// A new array of `len` `Undefined` values.
    pub fn alloc_array(&mut self, len: usize) -> CellPtr {
        self.assert_owns_alloc_context();
        let size = match slot_array::size_for(len) {
            Some(size) if size <= self.config.segment_size => size,
            other => self.oom(OutOfMemory {
                requested: other.unwrap_or(usize::MAX),
                reason: OomReason::TooLarge,
            }),
        };
        let ptr = self.alloc_cell_memory(size, &mut ());
        // Fits in a segment, so the length fits in 32 bits.
        #[allow(clippy::cast_possible_truncation)]
        let len = len as u32;
        // SAFETY: fresh block sized for `len` elements.
        unsafe {
            let cell = GcCell::init(ptr, size, CellKind::SLOT_ARRAY);
            slot_array::init(cell, len);
            CellPtr::from_cell(cell)
        }
    }

    /// Write the header and payload, then dirty the cards of old-generation
    /// slots that already reference the nursery.
    unsafe fn init_cell<T: HeapObject>(
        &mut self,
        ptr: NonNull<u8>,
        size: usize,
        kind: CellKind,
        value: T,
    ) -> CellPtr {
        // SAFETY: guaranteed by the caller.
        let cell = unsafe {
            let cell = GcCell::init(ptr, size, kind);
            GcCell::payload(cell).cast::<T>().as_ptr().write(value);
            cell
        };
        if !self.young.contains(ptr.as_ptr() as usize) {
            let mut barrier = InitBarrier {
                young: &self.young,
                old: &mut self.old,
            };
            // SAFETY: the payload was initialized above.
            unsafe { self.kinds.trace(cell, &mut barrier) };
        }
        CellPtr::from_cell(cell)
    }

    /// Memory for a new cell, from the nursery when it fits there.
    fn alloc_cell_memory(&mut self, size: usize, pending: &mut dyn Trace) -> NonNull<u8> {
        if size <= self.young.size() {
            if let Some(ptr) = self.young.alloc(size) {
                return ptr;
            }
            self.collect_young_with(pending);
            if let Some(ptr) = self.young.alloc(size) {
                return ptr;
            }
        }
        self.alloc_old(size, pending)
    }

    fn alloc_old(&mut self, size: usize, pending: &mut dyn Trace) -> NonNull<u8> {
        if size > self.config.segment_size {
            self.oom(OutOfMemory {
                requested: size,
                reason: OomReason::TooLarge,
            });
        }
        if let Some(ptr) = self.old.alloc_raw(size) {
            return ptr;
        }
        self.full_collect_then_alloc(size, pending)
    }

    fn full_collect_then_alloc(&mut self, size: usize, pending: &mut dyn Trace) -> NonNull<u8> {
        self.collect_full_with(pending);
        if let Some(ptr) = self.old.alloc_raw(size) {
            return ptr;
        }
        if self.old.grow_to_fit(size) {
            if let Some(ptr) = self.old.alloc_raw(size) {
                return ptr;
            }
        }
        self.oom(OutOfMemory {
            requested: size,
            reason: OomReason::HeapExhausted,
        })
    }

    #[cold]
    fn oom(&mut self, err: OutOfMemory) -> ! {
        self.transition_to(GcPhase::Oom);
        #[cfg(feature = "tracing")]
        log_oom(&err);
        match self.config.oom_policy {
            OomPolicy::Abort => {
                eprintln!("segheap: {err}");
                std::process::abort()
            }
            OomPolicy::Panic => std::panic::panic_any(err),
        }
    }

    // ------------------------------------------------------------------
    // Access and stores
    // ------------------------------------------------------------------

    /// # Safety
    ///
    /// `obj` must reference a live cell of this heap, read from a root or a
    /// heap slot since the last collection.
    ///
    /// # Panics
    ///
    /// Panics if `obj` is null or does not hold a `T`.
    unsafe fn payload_ptr<T: HeapObject>(&self, obj: CellPtr) -> *mut T {
        let Some(cell) = obj.as_cell() else {
            panic!("dereferenced a null cell pointer");
        };
        // SAFETY: guaranteed by the caller.
        let kind = unsafe { cell.as_ref() }.kind();
        assert!(
            self.kinds.lookup::<T>() == Some(kind),
            "cell of kind `{}` is not a `{}`",
            self.kinds.vtable(kind).name,
            std::any::type_name::<T>()
        );
        // SAFETY: guaranteed by the caller.
        unsafe { GcCell::payload(cell).cast::<T>().as_ptr() }
    }

    /// Borrow the payload of `obj`.
    ///
    /// # Safety
    ///
    /// `obj` must reference a live cell of this heap, read from a root or a
    /// heap slot since the last collection.
    ///
    /// # Panics
    ///
    /// Panics if `obj` is null or does not hold a `T`.
    #[must_use]
    pub unsafe fn get<T: HeapObject>(&self, obj: CellPtr) -> &T {
        // SAFETY: guaranteed by the caller.
        unsafe { &*self.payload_ptr::<T>(obj) }
    }

    /// Mutably borrow the payload of `obj`.
    ///
    /// Pointer stores through the returned reference bypass the write
    /// barrier; use [`set_ptr_field`](Self::set_ptr_field) or follow them
    /// with [`write_barrier`](Self::write_barrier).
    ///
    /// # Safety
    ///
    /// Same as [`get`](Self::get).
    ///
    /// # Panics
    ///
    /// Panics if `obj` is null or does not hold a `T`.
    pub unsafe fn get_mut<T: HeapObject>(&mut self, obj: CellPtr) -> &mut T {
        // SAFETY: guaranteed by the caller.
        unsafe { &mut *self.payload_ptr::<T>(obj) }
    }

    /// Store `value` into the pointer slot of `obj` selected by `field`.
    ///
    /// # Safety
    ///
    /// Same as [`get`](Self::get); `field` must return a slot inside the
    /// payload.
    pub unsafe fn set_ptr_field<T: HeapObject>(
        &mut self,
        obj: CellPtr,
        value: CellPtr,
        field: impl FnOnce(&mut T) -> &mut CellPtr,
    ) {
        // SAFETY: guaranteed by the caller.
        let slot = field(unsafe { &mut *self.payload_ptr::<T>(obj) });
        *slot = value;
        let slot = ptr::from_mut(slot).cast_const();
        self.write_barrier(slot, value);
    }

    /// Store `value` into the tagged-value slot of `obj` selected by
    /// `field`.
    ///
    /// # Safety
    ///
    /// Same as [`set_ptr_field`](Self::set_ptr_field).
    pub unsafe fn set_value_field<T: HeapObject>(
        &mut self,
        obj: CellPtr,
        value: TaggedValue,
        field: impl FnOnce(&mut T) -> &mut TaggedValue,
    ) {
        // SAFETY: guaranteed by the caller.
        let slot = field(unsafe { &mut *self.payload_ptr::<T>(obj) });
        *slot = value;
        let slot = ptr::from_mut(slot).cast_const();
        self.write_barrier(slot, value.as_ptr().unwrap_or_default());
    }

    /// Record that the heap slot at `slot` now holds `value`.
    ///
    /// Dirties the slot's card when an old-generation slot references the
    /// nursery. Stores into nursery cells need no barrier.
    #[inline]
    pub fn write_barrier<S>(&mut self, slot: *const S, value: CellPtr) {
        if self.young.contains(value.addr()) {
            self.old.dirty_card_for_address(slot as usize);
        }
    }

    fn array_cell(&self, arr: CellPtr) -> NonNull<GcCell> {
        let Some(cell) = arr.as_cell() else {
            panic!("dereferenced a null cell pointer");
        };
        // SAFETY: the caller of the public accessor guarantees a live cell.
        let kind = unsafe { cell.as_ref() }.kind();
        assert_eq!(kind, CellKind::SLOT_ARRAY, "cell is not an array");
        cell
    }

    /// Number of elements of `arr`.
    ///
    /// # Safety
    ///
    /// Same as [`get`](Self::get).
    ///
    /// # Panics
    ///
    /// Panics if `arr` is not an array.
    #[must_use]
    pub unsafe fn array_len(&self, arr: CellPtr) -> usize {
        // SAFETY: guaranteed by the caller.
        unsafe { slot_array::len(self.array_cell(arr)) }
    }

    /// # Safety
    ///
    /// Same as [`get`](Self::get).
    ///
    /// # Panics
    ///
    /// Panics if `arr` is not an array or `index` is out of bounds.
    #[must_use]
    pub unsafe fn array_get(&self, arr: CellPtr, index: usize) -> TaggedValue {
        let cell = self.array_cell(arr);
        // SAFETY: guaranteed by the caller; the index is checked.
        unsafe {
            let len = slot_array::len(cell);
            assert!(index < len, "index {index} out of bounds for array of length {len}");
            *slot_array::elements(cell).add(index)
        }
    }

    /// Store `value` at `index`, with the write barrier.
    ///
    /// # Safety
    ///
    /// Same as [`get`](Self::get).
    ///
    /// # Panics
    ///
    /// Panics if `arr` is not an array or `index` is out of bounds.
    pub unsafe fn array_set(&mut self, arr: CellPtr, index: usize, value: TaggedValue) {
        let cell = self.array_cell(arr);
        // SAFETY: guaranteed by the caller; the index is checked.
        let slot = unsafe {
            let len = slot_array::len(cell);
            assert!(index < len, "index {index} out of bounds for array of length {len}");
            let slot = slot_array::elements(cell).add(index);
            *slot = value;
            slot
        };
        self.write_barrier(slot.cast_const(), value.as_ptr().unwrap_or_default());
    }

    // ------------------------------------------------------------------
    // Roots
    // ------------------------------------------------------------------

    /// Register `ptr` as a root. The handle follows the cell when it moves.
    pub fn new_root(&mut self, ptr: CellPtr) -> RootHandle {
        self.roots.push(ptr)
    }

    /// Current value of a root.
    #[must_use]
    pub fn root(&self, handle: RootHandle) -> CellPtr {
        self.roots.get(handle)
    }

    pub fn set_root(&mut self, handle: RootHandle, ptr: CellPtr) {
        self.roots.set(handle, ptr);
    }

    pub fn drop_root(&mut self, handle: RootHandle) {
        self.roots.remove(handle);
    }

    /// Open a root scope. Roots created inside it are released by
    /// [`exit_scope`](Self::exit_scope).
    pub fn enter_scope(&mut self) {
        self.roots.enter_scope();
    }

    pub fn exit_scope(&mut self) {
        self.roots.exit_scope();
    }

    #[must_use]
    pub const fn root_set(&self) -> &RootSet {
        &self.roots
    }

    /// Add a source of roots that is consulted by every collection.
    pub fn add_root_provider(&mut self, provider: impl RootProvider + 'static) {
        self.providers.push(Box::new(provider));
    }

    // ------------------------------------------------------------------
    // External memory
    // ------------------------------------------------------------------

    /// Charge `size` bytes held outside the heap on behalf of its cells.
    pub fn credit_external_memory(&mut self, size: usize) {
        self.old.credit_external_memory(size);
    }

    pub fn debit_external_memory(&mut self, size: usize) {
        self.old.debit_external_memory(size);
    }

    // ------------------------------------------------------------------
    // Collection
    // ------------------------------------------------------------------

    /// Evacuate the nursery. Runs a full collection instead when the old
    /// generation cannot absorb it.
    pub fn collect_young(&mut self) {
        self.assert_owns_alloc_context();
        self.collect_young_with(&mut ());
    }

    /// Collect and compact both generations.
    pub fn collect_full(&mut self) {
        self.assert_owns_alloc_context();
        self.collect_full_with(&mut ());
    }

    fn collect_young_with(&mut self, pending: &mut dyn Trace) {
        if !self.old.ensure_fits(self.young.used()) {
            #[cfg(feature = "tracing")]
            log_young_fallback(self.young.used(), self.old.available());
            self.collect_full_with(pending);
            return;
        }

        #[cfg(feature = "tracing")]
        let gc_id = next_gc_id();
        #[cfg(feature = "tracing")]
        let _gc_span = trace_gc_collection("young", gc_id);

        #[cfg(feature = "slow-debug")]
        self.check_well_formed();

        let start = Instant::now();
        let bytes_before = self.bytes_used();
        let mut timer = PhaseTimer::new();

        let promoted = match self.evacuate_young(pending, &mut timer) {
            Ok(promoted) => promoted,
            Err(err) => self.oom(err),
        };
        let finalized = self.young.finalize_unreachable(&self.kinds);
        self.young.reset_level();
        self.old.did_finish_gc();

        self.leave_phases(&mut timer);
        self.record_collection(CollectionType::Young, start, bytes_before, promoted, finalized, &timer);

        #[cfg(feature = "slow-debug")]
        self.check_well_formed();
    }

    /// Copy every reachable nursery cell into the old generation.
    fn evacuate_young(
        &mut self,
        pending: &mut dyn Trace,
        timer: &mut PhaseTimer,
    ) -> Result<usize, OutOfMemory> {
        let original_level = self.old.level();
        let mut promoted;

        {
            #[cfg(feature = "tracing")]
            let _span = trace_phase(GcPhase::MarkRoots);
            self.enter_phase(GcPhase::MarkRoots, timer);
            let mut acceptor = EvacAcceptor::new(&self.young, &mut self.old);
            visit_roots(&mut self.roots, &mut self.providers, pending, &mut acceptor);
            promoted = acceptor.finish()?;
        }
        {
            #[cfg(feature = "tracing")]
            let _span = trace_phase(GcPhase::EvacuateYoung);
            self.enter_phase(GcPhase::EvacuateYoung, timer);
            promoted +=
                self.old
                    .young_gen_transitive_closure(original_level, &self.young, &self.kinds)?;
        }
        {
            #[cfg(feature = "tracing")]
            let _span = trace_phase(GcPhase::ScanDirtyCards);
            self.enter_phase(GcPhase::ScanDirtyCards, timer);
            let scan_from = self.old.level();
            promoted +=
                self.old
                    .mark_young_gen_pointers(original_level, &self.young, &self.kinds)?;
            promoted += self
                .old
                .young_gen_transitive_closure(scan_from, &self.young, &self.kinds)?;
        }
        Ok(promoted)
    }

    fn collect_full_with(&mut self, pending: &mut dyn Trace) {
        #[cfg(feature = "tracing")]
        let gc_id = next_gc_id();
        #[cfg(feature = "tracing")]
        let _gc_span = trace_gc_collection("full", gc_id);

        #[cfg(feature = "slow-debug")]
        self.check_well_formed();

        let start = Instant::now();
        let bytes_before = self.bytes_used();
        let mut timer = PhaseTimer::new();
        let mut promoted = 0;
        let mut finalized = 0;

        if self.old.ensure_fits(self.young.used()) {
            promoted = match self.evacuate_young(pending, &mut timer) {
                Ok(promoted) => promoted,
                Err(err) => self.oom(err),
            };
            finalized += self.young.finalize_unreachable(&self.kinds);
            self.young.reset_level();
        } else {
            // The survivors stay in the nursery and are compacted in place.
            for phase in [
                GcPhase::MarkRoots,
                GcPhase::EvacuateYoung,
                GcPhase::ScanDirtyCards,
            ] {
                self.enter_phase(phase, &mut timer);
            }
        }

        let mut plan = CompactionPlan::new(&self.old, &self.young);
        {
            #[cfg(feature = "tracing")]
            let _span = trace_phase(GcPhase::SweepOld);
            self.enter_phase(GcPhase::SweepOld, &mut timer);
            let mut marker = MarkAcceptor::new();
            visit_roots(&mut self.roots, &mut self.providers, pending, &mut marker);
            marker.drain(&self.kinds);
            let stats =
                sweep_and_install_forwarding_pointers(&self.old, &self.young, &self.kinds, &mut plan);
            debug_assert_eq!(stats.live_bytes, marker.marked_bytes());
            finalized += stats.finalized;
        }
        {
            #[cfg(feature = "tracing")]
            let _span = trace_phase(GcPhase::UpdateReferences);
            self.enter_phase(GcPhase::UpdateReferences, &mut timer);
            update_references(&self.old, &self.young, &self.kinds);
            visit_roots(&mut self.roots, &mut self.providers, pending, &mut UpdateAcceptor);
        }
        {
            #[cfg(feature = "tracing")]
            let _span = trace_phase(GcPhase::Compact);
            self.enter_phase(GcPhase::Compact, &mut timer);
            compact(&self.old, &self.young);
            self.old.record_level_after_compaction(&plan.old_levels());
            self.young.set_level(plan.young_level());
            self.old.recreate_card_table_boundaries();
            self.old
                .update_card_tables_after_compaction(self.young.is_empty());
            self.old.resize_after_full_gc(self.config.occupancy_target);
            self.old.did_finish_gc();
        }

        self.leave_phases(&mut timer);
        self.record_collection(CollectionType::Full, start, bytes_before, promoted, finalized, &timer);

        #[cfg(feature = "slow-debug")]
        self.check_well_formed();
    }

    fn record_collection(
        &mut self,
        collection_type: CollectionType,
        start: Instant,
        bytes_before: usize,
        promoted: usize,
        finalized: usize,
        timer: &PhaseTimer,
    ) {
        let duration = start.elapsed();
        match collection_type {
            CollectionType::Young => self.totals.num_young_collections += 1,
            CollectionType::Full => self.totals.num_full_collections += 1,
            CollectionType::None => {}
        }
        self.totals.total_promoted += promoted;
        self.totals.total_finalized += finalized;
        self.totals.total_gc_time += duration;

        self.metrics = GcMetrics {
            duration,
            collection_type,
            total_collections: self.totals.num_young_collections
                + self.totals.num_full_collections,
            bytes_before,
            bytes_after: self.bytes_used(),
            bytes_promoted: promoted,
            cells_finalized: finalized,
            phase_durations: timer.durations(),
        };

        #[cfg(feature = "tracing")]
        log_collection_end(&self.metrics);
    }

    // ------------------------------------------------------------------
    // Verification
    // ------------------------------------------------------------------

    /// Walk the whole heap and check its invariants: cells tile every
    /// segment, card boundaries match the layout and every old-to-young
    /// slot is on a dirty card.
    ///
    /// # Panics
    ///
    /// Panics on the first violation.
    pub fn check_well_formed(&self) {
        self.old.check_well_formed();
        self.young.segment().check_well_formed();
        self.old.verify_card_table_boundaries();
        self.old.verify_card_table(&self.young, &self.kinds);
        self.for_all_objs(|ptr| {
            if let Some(cell) = ptr.as_cell() {
                // SAFETY: produced by the heap walk.
                let header = unsafe { cell.as_ref() };
                assert_eq!(header.state(), CellState::Live, "stale forwarding pointer");
                assert!(!header.is_marked(), "stale mark bit");
            }
        });
    }
}

/// Report every root to `visitor`: the root set, the providers and the
/// value waiting to be allocated.
fn visit_roots(
    roots: &mut RootSet,
    providers: &mut [Box<dyn RootProvider>],
    pending: &mut dyn Trace,
    visitor: &mut dyn SlotVisitor,
) {
    roots.visit(visitor);
    for provider in providers {
        provider.mark_roots(visitor);
    }
    pending.trace(visitor);
}

/// Dirties the cards of old-generation slots referencing the nursery.
struct InitBarrier<'a> {
    young: &'a YoungGen,
    old: &'a mut OldGen,
}

impl SlotVisitor for InitBarrier<'_> {
    fn accept_ptr(&mut self, slot: &mut CellPtr) {
        if self.young.contains(slot.addr()) {
            self.old.dirty_card_for_address(ptr::from_mut(slot) as usize);
        }
    }

    fn accept_value(&mut self, slot: &mut TaggedValue) {
        if let Some(target) = slot.as_ptr() {
            if self.young.contains(target.addr()) {
                self.old.dirty_card_for_address(ptr::from_mut(slot) as usize);
            }
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        // Forwarded nursery cells were copied; the copies own the payloads.
        let kinds = &self.kinds;
        let mut finalize_live = |cell: NonNull<GcCell>| {
            // SAFETY: cells produced by the heap walks, never used again.
            unsafe {
                if cell.as_ref().state() == CellState::Live {
                    kinds.finalize(cell);
                }
            }
        };
        self.old.for_all_objs(&mut finalize_live);
        self.young.for_all_objs(&mut finalize_live);

        // SAFETY: `young` is not used after this point.
        let young = unsafe { ManuallyDrop::take(&mut self.young) };
        self.old.return_storage(young.into_segment().into_storage());
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("phase", &self.phase)
            .field("young", &*self.young)
            .field("old", &self.old)
            .field("roots", &self.roots.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util;

    #[test]
    fn test_young_cycle_transitions() {
        let path = [
            GcPhase::Idle,
            GcPhase::MarkRoots,
            GcPhase::EvacuateYoung,
            GcPhase::ScanDirtyCards,
            GcPhase::Idle,
        ];
        assert!(path.windows(2).all(|w| w[0].can_transition_to(w[1])));
    }

    #[test]
    fn test_full_cycle_transitions() {
        let path = [
            GcPhase::Idle,
            GcPhase::MarkRoots,
            GcPhase::EvacuateYoung,
            GcPhase::ScanDirtyCards,
            GcPhase::SweepOld,
            GcPhase::UpdateReferences,
            GcPhase::Compact,
            GcPhase::Idle,
        ];
        assert!(path.windows(2).all(|w| w[0].can_transition_to(w[1])));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!GcPhase::Idle.can_transition_to(GcPhase::SweepOld));
        assert!(!GcPhase::MarkRoots.can_transition_to(GcPhase::Idle));
        assert!(!GcPhase::Compact.can_transition_to(GcPhase::MarkRoots));
        assert!(!GcPhase::Oom.can_transition_to(GcPhase::Idle));
        assert!(GcPhase::SweepOld.can_transition_to(GcPhase::Oom));
    }

    #[test]
    fn test_phase_round_trip_and_timing() {
        for v in 0..8 {
            let phase = GcPhase::from_u8(v).unwrap();
            assert_eq!(phase as u8, v);
        }
        assert_eq!(GcPhase::from_u8(8), None);
        assert_eq!(GcPhase::Idle.timing_index(), None);
        assert_eq!(GcPhase::MarkRoots.timing_index(), Some(0));
        assert_eq!(GcPhase::Compact.timing_index(), Some(5));
        assert_eq!(GcPhase::Oom.timing_index(), None);
    }

    #[test]
    fn test_provider_size_mismatch() {
        let config = GcConfig::default();
        let provider = MmapStorageProvider::new(config.segment_size / 2);
        let err = Heap::with_storage_provider(config, Box::new(provider)).unwrap_err();
        assert!(matches!(err, HeapError::Config(ConfigError::ProviderSize { .. })));
    }

    #[test]
    fn test_alloc_and_read_back() {
        let mut heap = Heap::new(GcConfig::default()).unwrap();
        let a = heap.alloc(41u64);
        let b = heap.alloc(String::from("segheap"));
        assert!(heap.young_gen().contains(a.addr()));
        // SAFETY: no collection ran since the allocations.
        unsafe {
            *heap.get_mut::<u64>(a) += 1;
            assert_eq!(*heap.get::<u64>(a), 42);
            assert_eq!(heap.get::<String>(b), "segheap");
        }
        assert!(heap.owns_alloc_context());
    }

    #[test]
    fn test_drop_returns_nursery_segment() {
        let (heap, counters) = test_util::counting_heap(test_util::small_config());
        assert_eq!(counters.num_live(), 2);
        drop(heap);
        assert_eq!(counters.num_live(), 0);
    }

    #[test]
    fn test_write_barrier_ignores_old_values() {
        let mut heap = Heap::new(test_util::small_config()).unwrap();
        let old = heap.alloc_long_lived(CellPtr::NULL);
        let other = heap.alloc_long_lived(0u64);
        // SAFETY: no collection since the allocations.
        let slot = unsafe { heap.get_mut::<CellPtr>(old) } as *const CellPtr;
        heap.write_barrier(slot, other);
        assert!(!heap.old_gen().is_card_for_address_dirty(slot as usize));

        let young = heap.alloc(1u64);
        heap.write_barrier(slot, young);
        assert!(heap.old_gen().is_card_for_address_dirty(slot as usize));
    }

    #[test]
    fn test_phase_is_idle_between_collections() {
        let mut heap = Heap::new(test_util::small_config()).unwrap();
        heap.collect_young();
        assert_eq!(heap.phase(), GcPhase::Idle);
        heap.collect_full();
        assert_eq!(heap.phase(), GcPhase::Idle);
        assert_eq!(heap.info().num_young_collections, 1);
        assert_eq!(heap.info().num_full_collections, 1);
    }

    #[test]
    #[should_panic(expected = "is not a")]
    fn test_get_checks_kind() {
        let mut heap = Heap::new(GcConfig::default()).unwrap();
        let a = heap.alloc(1u32);
        // SAFETY: `a` is live; the kind check fails first.
        let _ = unsafe { heap.get::<u64>(a) };
    }
}
