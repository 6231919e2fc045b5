//! GC metrics and statistics.

use std::time::{Duration, Instant};

use crate::gc::GcPhase;

/// Number of timed collection phases.
pub const NUM_TIMED_PHASES: usize = 6;

/// Statistics from the most recent garbage collection.
#[derive(Debug, Clone, Copy)]
pub struct GcMetrics {
    /// Duration of the last collection.
    pub duration: Duration,
    /// Type of collection (young or full).
    pub collection_type: CollectionType,
    /// Total collections since the heap was created.
    pub total_collections: usize,
    /// Bytes used in both generations before the collection.
    pub bytes_before: usize,
    /// Bytes used in both generations after the collection.
    pub bytes_after: usize,
    /// Bytes copied from the nursery into the old generation.
    pub bytes_promoted: usize,
    /// Finalizers run for unreachable cells.
    pub cells_finalized: usize,
    /// Time spent in each phase, indexed by [`GcPhase::timing_index`].
    pub phase_durations: [Duration; NUM_TIMED_PHASES],
}

impl Default for GcMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GcMetrics {
    /// Create a new `GcMetrics` with all fields set to zero/defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            duration: Duration::ZERO,
            collection_type: CollectionType::None,
            total_collections: 0,
            bytes_before: 0,
            bytes_after: 0,
            bytes_promoted: 0,
            cells_finalized: 0,
            phase_durations: [Duration::ZERO; NUM_TIMED_PHASES],
        }
    }

    /// Bytes freed by the collection.
    #[must_use]
    pub const fn bytes_reclaimed(&self) -> usize {
        self.bytes_before.saturating_sub(self.bytes_after)
    }

    /// Time spent in `phase`. Zero for phases that are not timed.
    #[must_use]
    pub fn phase_duration(&self, phase: GcPhase) -> Duration {
        phase
            .timing_index()
            .map_or(Duration::ZERO, |i| self.phase_durations[i])
    }
}

/// Type of GC collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CollectionType {
    /// No collection has run yet.
    #[default]
    None = 0,
    /// Nursery evacuation only.
    Young = 1,
    /// Mark-sweep-compact of both generations.
    Full = 2,
}

/// Times consecutive collection phases.
///
/// ```
/// use segheap::metrics::PhaseTimer;
/// use segheap::GcPhase;
///
/// let mut timer = PhaseTimer::new();
/// timer.begin(GcPhase::MarkRoots);
/// // ... root marking ...
/// timer.begin(GcPhase::EvacuateYoung);
/// // ... evacuation ...
/// timer.finish();
/// assert!(timer.durations()[1] >= std::time::Duration::ZERO);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct PhaseTimer {
    durations: [Duration; NUM_TIMED_PHASES],
    current: Option<(GcPhase, Instant)>,
}

impl Default for PhaseTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTimer {
    /// Create a timer with every phase at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            durations: [Duration::ZERO; NUM_TIMED_PHASES],
            current: None,
        }
    }

    /// Close the running phase, if any, and start timing `phase`.
    pub fn begin(&mut self, phase: GcPhase) {
        self.finish();
        self.current = Some((phase, Instant::now()));
    }

    /// Close the running phase.
    pub fn finish(&mut self) {
        if let Some((phase, start)) = self.current.take() {
            if let Some(i) = phase.timing_index() {
                self.durations[i] += start.elapsed();
            }
        }
    }

    /// Accumulated time per phase.
    #[must_use]
    pub const fn durations(&self) -> [Duration; NUM_TIMED_PHASES] {
        self.durations
    }
}

/// Cumulative heap statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapInfo {
    /// Young collections completed.
    pub num_young_collections: usize,
    /// Full collections completed.
    pub num_full_collections: usize,
    /// Bytes in use in the nursery.
    pub young_used: usize,
    /// Nursery capacity.
    pub young_size: usize,
    /// Bytes in use in the old generation.
    pub old_used: usize,
    /// Logical size of the old generation.
    pub old_size: usize,
    /// Segments in use by the old generation.
    pub old_segments: usize,
    /// Segments held in the old generation's cache.
    pub cached_segments: usize,
    /// External memory charged to the heap.
    pub external_memory: usize,
    /// Total bytes promoted since the heap was created.
    pub total_promoted: usize,
    /// Total finalizers run since the heap was created.
    pub total_finalized: usize,
    /// Total time spent collecting.
    pub total_gc_time: Duration,
}

impl HeapInfo {
    /// Bytes in use in both generations.
    #[must_use]
    pub const fn total_used(&self) -> usize {
        self.young_used + self.old_used
    }
}
