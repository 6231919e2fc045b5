//! Heap configuration.

use crate::card_table::CARD_SIZE;
use crate::error::ConfigError;

/// Default capacity of a heap segment (1 MiB).
pub const DEFAULT_SEGMENT_SIZE: usize = 1 << 20;

/// Default nursery size (256 KiB).
pub const DEFAULT_YOUNG_SIZE: usize = 256 << 10;

/// Default lower bound of the old generation (one segment).
pub const DEFAULT_MIN_OLD_SIZE: usize = DEFAULT_SEGMENT_SIZE;

/// Default upper bound of the old generation (64 MiB).
pub const DEFAULT_MAX_OLD_SIZE: usize = 64 << 20;

/// Fraction of the old generation that should be live right after a full
/// collection. The generation is resized towards `used / target`.
pub const DEFAULT_OCCUPANCY_TARGET: f64 = 0.5;

/// What to do once an allocation cannot be satisfied even after a full
/// collection and a bounded growth attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OomPolicy {
    /// Log the failure and abort the process.
    #[default]
    Abort,
    /// Unwind with an [`OutOfMemory`](crate::OutOfMemory) payload.
    ///
    /// The heap is left in the `Oom` phase and must not be used afterwards
    /// except to drop it.
    Panic,
}

/// Sizes and policies for a [`Heap`](crate::Heap).
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Capacity and alignment of every segment. A power of two and a
    /// multiple of the OS page size.
    pub segment_size: usize,
    /// Usable size of the nursery segment.
    pub young_size: usize,
    /// Lower bound for the old generation size.
    pub min_old_size: usize,
    /// Upper bound for the old generation size.
    pub max_old_size: usize,
    /// Target live fraction used to resize the old generation after a full
    /// collection.
    pub occupancy_target: f64,
    /// Return segments freed by compaction to the storage provider instead
    /// of caching them.
    pub release_unused: bool,
    /// Behavior on fatal out-of-memory.
    pub oom_policy: OomPolicy,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            young_size: DEFAULT_YOUNG_SIZE,
            min_old_size: DEFAULT_MIN_OLD_SIZE,
            max_old_size: DEFAULT_MAX_OLD_SIZE,
            occupancy_target: DEFAULT_OCCUPANCY_TARGET,
            release_unused: true,
            oom_policy: OomPolicy::Abort,
        }
    }
}

impl GcConfig {
    /// Set the segment size.
    #[must_use]
    pub const fn with_segment_size(mut self, size: usize) -> Self {
        self.segment_size = size;
        self
    }

    /// Set the nursery size.
    #[must_use]
    pub const fn with_young_size(mut self, size: usize) -> Self {
        self.young_size = size;
        self
    }

    /// Set the old generation bounds.
    #[must_use]
    pub const fn with_old_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_old_size = min;
        self.max_old_size = max;
        self
    }

    /// Set the post-collection occupancy target.
    #[must_use]
    pub const fn with_occupancy_target(mut self, target: f64) -> Self {
        self.occupancy_target = target;
        self
    }

    /// Choose whether compaction returns freed segments to the provider.
    #[must_use]
    pub const fn with_release_unused(mut self, release: bool) -> Self {
        self.release_unused = release;
        self
    }

    /// Set the out-of-memory policy.
    #[must_use]
    pub const fn with_oom_policy(mut self, policy: OomPolicy) -> Self {
        self.oom_policy = policy;
        self
    }

    /// Check that the sizes are usable.
    ///
    /// # Errors
    ///
    /// Returns the first constraint that does not hold.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let page = sys_alloc::page_size();

        if !self.segment_size.is_power_of_two()
            || self.segment_size % page != 0
            || self.segment_size < CARD_SIZE
        {
            return Err(ConfigError::SegmentSize {
                size: self.segment_size,
                page,
            });
        }
        if u32::try_from(self.segment_size).is_err() {
            return Err(ConfigError::SegmentTooLarge(self.segment_size));
        }
        if self.young_size == 0 || self.young_size % page != 0 || self.young_size > self.segment_size
        {
            return Err(ConfigError::YoungSize {
                size: self.young_size,
                segment_size: self.segment_size,
            });
        }
        if self.min_old_size > self.max_old_size {
            return Err(ConfigError::OldBounds {
                min: self.min_old_size,
                max: self.max_old_size,
            });
        }
        if !(self.occupancy_target > 0.0 && self.occupancy_target <= 1.0) {
            return Err(ConfigError::OccupancyTarget(self.occupancy_target));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(GcConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_non_power_of_two_segment() {
        let page = sys_alloc::page_size();
        let config = GcConfig::default().with_segment_size(3 * page);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SegmentSize { .. })
        ));
    }

    #[test]
    fn test_rejects_young_larger_than_segment() {
        let page = sys_alloc::page_size();
        let config = GcConfig::default()
            .with_segment_size(4 * page)
            .with_young_size(8 * page);
        assert!(matches!(config.validate(), Err(ConfigError::YoungSize { .. })));
    }

    #[test]
    fn test_rejects_inverted_bounds() {
        let config = GcConfig::default().with_old_bounds(10 << 20, 1 << 20);
        assert!(matches!(config.validate(), Err(ConfigError::OldBounds { .. })));
    }

    #[test]
    fn test_rejects_bad_occupancy() {
        for target in [0.0, -1.0, 1.5, f64::NAN] {
            let config = GcConfig::default().with_occupancy_target(target);
            assert!(config.validate().is_err(), "target {target} accepted");
        }
    }
}
