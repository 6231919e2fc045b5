//! GC tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! tracing spans and events for collections, phases, segment traffic and
//! out-of-memory failures.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    use crate::error::{OutOfMemory, StorageError};
    use crate::gc::GcPhase;
    use crate::metrics::GcMetrics;

    /// Stable identifier for a GC run.
    ///
    /// Correlates all events within a single collection. A monotonically
    /// increasing, process-wide counter starting at 1.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next unique GC ID.
    pub fn next_gc_id() -> GcId {
        GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a span for the entire GC collection.
    pub fn trace_gc_collection(collection_type: &str, gc_id: GcId) -> span::EnteredSpan {
        span!(
            Level::DEBUG,
            "gc_collect",
            collection_type = collection_type,
            gc_id = gc_id.0
        )
        .entered()
    }

    /// Create a span for one collection phase.
    pub fn trace_phase(phase: GcPhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
    }

    /// Log the start of a GC phase.
    pub fn log_phase_start(phase: GcPhase, bytes_used: usize) {
        tracing::debug!(phase = ?phase, bytes_used, "phase_start");
    }

    /// Log the end of a GC phase.
    pub fn log_phase_end(phase: GcPhase, bytes_used: usize) {
        tracing::debug!(phase = ?phase, bytes_used, "phase_end");
    }

    pub fn log_segment_materialized(segment_num: usize, cached_left: usize) {
        tracing::debug!(segment_num, cached_left, "segment_materialized");
    }

    pub fn log_segments_released(count: usize, to_provider: bool) {
        tracing::debug!(count, to_provider, "segments_released");
    }

    pub fn log_heap_resized(from: usize, to: usize) {
        tracing::debug!(from, to, "old_gen_resized");
    }

    pub fn log_storage_failure(err: &StorageError) {
        tracing::warn!(error = %err, "storage_unavailable");
    }

    /// A young collection that cannot be absorbed turns into a full one.
    pub fn log_young_fallback(young_used: usize, old_available: usize) {
        tracing::debug!(young_used, old_available, "young_collection_fallback");
    }

    /// Log the summary of a finished collection.
    pub fn log_collection_end(metrics: &GcMetrics) {
        tracing::debug!(
            collection_type = ?metrics.collection_type,
            bytes_before = metrics.bytes_before,
            bytes_after = metrics.bytes_after,
            bytes_promoted = metrics.bytes_promoted,
            cells_finalized = metrics.cells_finalized,
            duration_us = u64::try_from(metrics.duration.as_micros()).unwrap_or(u64::MAX),
            "collection_end"
        );
    }

    pub fn log_oom(err: &OutOfMemory) {
        tracing::error!(requested = err.requested, reason = %err.reason, "out_of_memory");
    }
}

#[cfg(not(feature = "tracing"))]
pub mod internal {
    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    /// Stub function when tracing is disabled.
    pub const fn next_gc_id() -> GcId {
        GcId(0)
    }
}

pub use internal::GcId;
