//! Collector configuration.

use std::num::NonZeroUsize;

use crate::error::{GcError, Result};

/// Soft heap limit a fresh collector starts with (4 MiB).
pub const DEFAULT_HEAP_START_LIMIT: usize = 4 * 1024 * 1024;

/// Which collector runs the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollectorKind {
    /// Every phase runs inside one stop-the-world pause.
    Serial,
    /// Marking runs alongside the mutators between two short pauses.
    #[default]
    ConcurrentMarkSweep,
}

/// How handles living outside the heap are enumerated as roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RootMode {
    /// Every root handle is registered in its thread's root set.
    #[default]
    Precise,
    /// Handles on a thread's stack are recorded in a per-frame bitmap and the
    /// objects they reach are pinned while a collection runs. Handles off the
    /// stack still go through the root set.
    Conservative,
}

/// Tunables for a [`Collector`](crate::Collector).
///
/// # Example
///
/// ```
/// use movgc::{CollectorKind, GcConfig};
///
/// let config = GcConfig {
///     collector: CollectorKind::Serial,
///     heap_start_limit: 1 << 20,
///     ..GcConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Serial or concurrent-mark-sweep.
    pub collector: CollectorKind,
    /// Root enumeration strategy.
    pub root_mode: RootMode,
    /// When `false` chunks are only ever swept, never compacted.
    pub compacting: bool,
    /// Initial soft heap limit in bytes.
    pub heap_start_limit: usize,
    /// Hard cap the soft limit never grows past.
    pub max_heap_size: usize,
    /// Factor applied to the soft limit when an allocation has to expand it.
    pub growth_factor: f64,
    /// Fraction of the soft limit at which concurrent marking is started.
    pub mark_threshold: f64,
    /// Fraction of the soft limit beyond which new chunks are refused and a
    /// collection is forced.
    pub collect_threshold: f64,
    /// Chunks with residency below this are compacted.
    pub compacting_residency: f64,
    /// Chunks with residency above this are swept in place.
    pub non_compacting_residency: f64,
    /// Residency drift that makes a chunk in the middle band re-pick its
    /// policy.
    pub residency_epsilon: f64,
    /// Worker threads for marking, sweeping, compaction and fix-up.
    pub worker_threads: usize,
    /// Log a heap summary after every collection.
    pub print_stats: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            collector: CollectorKind::default(),
            root_mode: RootMode::default(),
            compacting: true,
            heap_start_limit: DEFAULT_HEAP_START_LIMIT,
            max_heap_size: usize::MAX,
            growth_factor: 2.0,
            mark_threshold: 0.6,
            collect_threshold: 1.0,
            compacting_residency: 0.5,
            non_compacting_residency: 0.9,
            residency_epsilon: 0.1,
            worker_threads: default_worker_threads(),
            print_stats: false,
        }
    }
}

impl GcConfig {
    /// Serial collector with otherwise default settings.
    #[must_use]
    pub fn serial() -> Self {
        Self {
            collector: CollectorKind::Serial,
            ..Self::default()
        }
    }

    /// Concurrent-mark-sweep collector with otherwise default settings.
    #[must_use]
    pub fn concurrent() -> Self {
        Self::default()
    }

    /// Sets the root enumeration strategy.
    #[must_use]
    pub const fn with_root_mode(mut self, root_mode: RootMode) -> Self {
        self.root_mode = root_mode;
        self
    }

    /// Enables or disables compaction.
    #[must_use]
    pub const fn with_compacting(mut self, compacting: bool) -> Self {
        self.compacting = compacting;
        self
    }

    /// Sets the starting soft limit.
    #[must_use]
    pub const fn with_heap_start_limit(mut self, limit: usize) -> Self {
        self.heap_start_limit = limit;
        self
    }

    /// Sets the hard heap cap.
    #[must_use]
    pub const fn with_max_heap_size(mut self, max: usize) -> Self {
        self.max_heap_size = max;
        self
    }

    /// Sets the worker thread count (at least one is always used).
    #[must_use]
    pub const fn with_worker_threads(mut self, workers: usize) -> Self {
        self.worker_threads = workers;
        self
    }

    /// Workers actually started for parallel phases.
    #[must_use]
    pub fn effective_workers(&self) -> usize {
        self.worker_threads.max(1)
    }

    /// Checks that every field is in range.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        fn fraction(name: &str, value: f64) -> Result<()> {
            if value.is_finite() && value > 0.0 && value <= 1.0 {
                Ok(())
            } else {
                Err(GcError::InvalidConfig(format!(
                    "{name} must be in (0, 1], got {value}"
                )))
            }
        }

        if self.heap_start_limit == 0 {
            return Err(GcError::InvalidConfig(
                "heap_start_limit must be non-zero".into(),
            ));
        }
        if self.max_heap_size < self.heap_start_limit {
            return Err(GcError::InvalidConfig(format!(
                "max_heap_size ({}) is below heap_start_limit ({})",
                self.max_heap_size, self.heap_start_limit
            )));
        }
        if !(self.growth_factor.is_finite() && self.growth_factor > 1.0) {
            return Err(GcError::InvalidConfig(format!(
                "growth_factor must be greater than 1, got {}",
                self.growth_factor
            )));
        }
        fraction("mark_threshold", self.mark_threshold)?;
        fraction("collect_threshold", self.collect_threshold)?;
        fraction("compacting_residency", self.compacting_residency)?;
        fraction("non_compacting_residency", self.non_compacting_residency)?;
        if self.mark_threshold > self.collect_threshold {
            return Err(GcError::InvalidConfig(
                "mark_threshold must not exceed collect_threshold".into(),
            ));
        }
        if self.compacting_residency > self.non_compacting_residency {
            return Err(GcError::InvalidConfig(
                "compacting_residency must not exceed non_compacting_residency".into(),
            ));
        }
        if !(self.residency_epsilon.is_finite() && self.residency_epsilon >= 0.0) {
            return Err(GcError::InvalidConfig(
                "residency_epsilon must be a non-negative number".into(),
            ));
        }
        Ok(())
    }
}

/// One worker per hardware thread, leaving one for the mutator.
#[must_use]
pub fn default_worker_threads() -> usize {
    available_parallelism().saturating_sub(1).max(1)
}

/// Get the number of CPUs available for parallel phases.
#[must_use]
pub fn available_parallelism() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = GcConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.collector, CollectorKind::ConcurrentMarkSweep);
        assert_eq!(config.heap_start_limit, 4 * 1024 * 1024);
        assert!(config.compacting);
        assert!(config.effective_workers() >= 1);
    }

    #[test]
    fn test_serial_preset() {
        assert_eq!(GcConfig::serial().collector, CollectorKind::Serial);
    }

    #[test]
    fn test_rejects_inverted_residency_band() {
        let config = GcConfig {
            compacting_residency: 0.95,
            ..GcConfig::default()
        };
        assert!(matches!(config.validate(), Err(GcError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_shrinking_growth_factor() {
        let config = GcConfig {
            growth_factor: 0.5,
            ..GcConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("growth_factor"));
    }

    #[test]
    fn test_rejects_cap_below_start() {
        let config = GcConfig::default()
            .with_heap_start_limit(1 << 20)
            .with_max_heap_size(1 << 10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_workers_still_runs_one() {
        assert_eq!(GcConfig::default().with_worker_threads(0).effective_workers(), 1);
    }
}
