//! Error types.

use std::io;

use thiserror::Error;

/// Invalid [`GcConfig`](crate::GcConfig) values.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// Segment size is not a power of two, not page aligned, or smaller than
    /// a card.
    #[error("segment size {size} must be a power of two and a multiple of the page size ({page})")]
    SegmentSize { size: usize, page: usize },
    /// Segment size does not fit a cell header's size field.
    #[error("segment size {0} does not fit in 32 bits")]
    SegmentTooLarge(usize),
    /// Nursery size is zero, not page aligned, or exceeds a segment.
    #[error("young generation size {size} must be a non-zero page multiple no larger than a segment ({segment_size})")]
    YoungSize { size: usize, segment_size: usize },
    /// `min_old_size > max_old_size`.
    #[error("old generation minimum {min} exceeds maximum {max}")]
    OldBounds { min: usize, max: usize },
    /// Occupancy target outside `(0, 1]`.
    #[error("occupancy target {0} must be in (0, 1]")]
    OccupancyTarget(f64),
    /// The storage provider hands out storages of another size.
    #[error("storage provider size {provider} does not match the segment size {segment_size}")]
    ProviderSize { provider: usize, segment_size: usize },
}

/// A storage provider could not hand out a segment.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The OS refused the mapping.
    #[error("failed to map storage `{name}`")]
    Map {
        name: &'static str,
        #[source]
        source: io::Error,
    },
    /// The system allocator returned null.
    #[error("failed to allocate {size} bytes for storage `{name}`")]
    Alloc { name: &'static str, size: usize },
    /// A limited provider reached its live-storage limit.
    #[error("storage limit of {limit} segments reached")]
    LimitReached { limit: usize },
}

/// Heap construction failures.
#[derive(Debug, Error)]
pub enum HeapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The initial segments could not be acquired.
    #[error("could not acquire the initial {generation} generation segment")]
    Storage {
        generation: &'static str,
        #[source]
        source: StorageError,
    },
}

/// Why an allocation was declared out of memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OomReason {
    /// The request is larger than a segment.
    TooLarge,
    /// The old generation is full and cannot grow within its maximum.
    HeapExhausted,
    /// A nursery survivor could not be copied into the old generation.
    PromotionFailed,
}

impl std::fmt::Display for OomReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::TooLarge => "allocation larger than a segment",
            Self::HeapExhausted => "old generation exhausted",
            Self::PromotionFailed => "promotion failed",
        })
    }
}

/// Fatal out-of-memory condition.
///
/// Delivered as a panic payload under [`OomPolicy::Panic`](crate::OomPolicy::Panic).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("out of memory: {reason} (requested {requested} bytes)")]
pub struct OutOfMemory {
    pub requested: usize,
    pub reason: OomReason,
}
