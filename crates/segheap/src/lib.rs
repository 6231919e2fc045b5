//! A generational, segmented, mark-sweep-compact heap.
//!
//! `segheap` manages objects for a language runtime. New objects are bump
//! allocated in a nursery segment; a young collection copies the survivors
//! into the old generation, a chain of fixed-size, size-aligned segments.
//! A full collection marks both generations and slides the survivors down in
//! place, then resizes the old generation towards an occupancy target.
//!
//! Old-to-young references are tracked with a card table per segment and a
//! write barrier ([`Heap::write_barrier`]), so a young collection only scans
//! the dirty parts of the old generation.
//!
//! # Quick Start
//!
//! ```
//! use segheap::{CellPtr, GcConfig, Heap, Trace};
//!
//! #[derive(Trace)]
//! struct Node {
//!     value: u64,
//!     next: CellPtr,
//! }
//!
//! let mut heap = Heap::new(GcConfig::default()).unwrap();
//! let tail = heap.alloc(Node { value: 2, next: CellPtr::NULL });
//! let head = heap.alloc(Node { value: 1, next: tail });
//! let root = heap.new_root(head);
//!
//! heap.collect_full();
//!
//! let head = heap.root(root);
//! // SAFETY: `head` was read from a root after the collection.
//! let next = unsafe { heap.get::<Node>(head) }.next;
//! assert_eq!(unsafe { heap.get::<Node>(next) }.value, 2);
//! ```
//!
//! # Moving objects
//!
//! Every collection may move any object. A [`CellPtr`] held on the Rust
//! stack is a plain address: read it back from a root, or from another heap
//! object, after anything that can collect.
//!
//! # Thread Safety
//!
//! [`Heap`] is `!Send` and `!Sync`. The only background work is the
//! [`Prefetcher`], which never touches the heap.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod card_table;
pub mod cell;
mod compaction;
pub mod config;
pub mod error;
mod gc;
pub mod kind;
pub mod metrics;
pub mod old_gen;
pub mod prefetch;
pub mod roots;
pub mod segment;
pub mod storage;
mod trace;
pub mod young_gen;

/// GC tracing support.
///
/// When the `tracing` feature is enabled, collections emit spans and events
/// through the `tracing` crate.
pub mod tracing;

pub use card_table::{CardTable, CARD_SIZE};
pub use cell::{CellPtr, CellState, GcCell, TaggedValue};
pub use config::{GcConfig, OomPolicy};
pub use error::{ConfigError, HeapError, OomReason, OutOfMemory, StorageError};
pub use gc::{GcPhase, Heap};
pub use kind::{CellKind, HeapObject, KindTable};
pub use metrics::{CollectionType, GcMetrics, HeapInfo};
pub use old_gen::{Location, OldGen};
pub use prefetch::{CancellationToken, PrefetchOutcome, Prefetcher};
pub use roots::{RootHandle, RootProvider, RootSet};
pub use segment::Segment;
pub use storage::{
    CountingStorageProvider, LimitedStorageProvider, MallocStorageProvider, MmapStorageProvider,
    Storage, StorageCounters, StorageProvider,
};
pub use trace::{FnVisitor, RangeVisitor, SlotVisitor, Trace};
pub use young_gen::YoungGen;

#[cfg(feature = "derive")]
pub use segheap_derive::Trace;

/// Helpers for tests and benchmarks.
#[cfg(any(test, feature = "test-util"))]
#[doc(hidden)]
pub mod test_util {
    use crate::config::GcConfig;
    use crate::storage::{CountingStorageProvider, MmapStorageProvider, StorageCounters};
    use crate::Heap;
    use std::sync::Arc;

    /// Segment size used by [`small_config`].
    pub const SMALL_SEGMENT: usize = 64 << 10;

    /// A configuration small enough that tests collect and grow often: 64
    /// KiB segments, a 16 KiB nursery and an old generation of one to eight
    /// segments.
    #[must_use]
    pub fn small_config() -> GcConfig {
        GcConfig::default()
            .with_segment_size(SMALL_SEGMENT)
            .with_young_size(16 << 10)
            .with_old_bounds(SMALL_SEGMENT, 8 * SMALL_SEGMENT)
    }

    /// A heap whose segments are counted.
    ///
    /// # Panics
    ///
    /// Panics if `config` is invalid or the segments cannot be mapped.
    #[must_use]
    pub fn counting_heap(config: GcConfig) -> (Heap, Arc<StorageCounters>) {
        let provider = CountingStorageProvider::new(Box::new(MmapStorageProvider::new(
            config.segment_size,
        )));
        let counters = provider.counters();
        let heap = Heap::with_storage_provider(config, Box::new(provider))
            .expect("test heap should be constructible");
        (heap, counters)
    }
}
