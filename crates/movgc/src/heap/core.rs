//! Heap accounting and the upstream page allocator.
//!
//! Every chunk and large-object block is mapped through [`CoreAllocator`],
//! which tracks how many bytes the heap holds against a soft limit. Crossing
//! `mark_threshold × limit` raises a request for concurrent marking; a
//! mapping that would cross `collect_threshold × limit` is refused, which
//! sends the allocating mutator down the collect-then-expand ladder.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use sys_alloc::{Mmap, MmapOptions};

use crate::config::GcConfig;
use crate::error::{GcError, Result};
use crate::gc::sync::{LockGuard, LockOrder};
use crate::metrics::HeapStat;
use crate::tracing::internal::log_heap_limit;

/// Freed/occupied ratio below which the limit doubles after a collection.
const TIGHT_YIELD: f64 = 0.01;
/// Freed/occupied ratio below which the limit grows by [`MODEST_GROWTH`].
const LOW_YIELD: f64 = 0.1;
const MODEST_GROWTH: f64 = 1.4;

#[derive(Debug)]
struct CoreState {
    heap_size: usize,
    limit: usize,
    max_limit: usize,
}

/// Maps heap memory and paces collections.
#[derive(Debug)]
pub struct CoreAllocator {
    state: Mutex<CoreState>,
    mark_requested: AtomicBool,
    growth_factor: f64,
    mark_threshold: f64,
    collect_threshold: f64,
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn scale(bytes: usize, factor: f64) -> usize {
    let scaled = bytes as f64 * factor;
    if scaled >= usize::MAX as f64 {
        usize::MAX
    } else {
        scaled as usize
    }
}

impl CoreAllocator {
    /// Creates an allocator with the limits from `config`.
    #[must_use]
    pub fn new(config: &GcConfig) -> Self {
        Self {
            state: Mutex::new(CoreState {
                heap_size: 0,
                limit: config.heap_start_limit,
                max_limit: config.max_heap_size,
            }),
            mark_requested: AtomicBool::new(false),
            growth_factor: config.growth_factor,
            mark_threshold: config.mark_threshold,
            collect_threshold: config.collect_threshold,
        }
    }

    /// Maps `len` bytes (rounded up to the allocation granularity).
    ///
    /// Returns `Ok(None)` when the mapping would push the heap past its
    /// collection threshold.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::MapFailed`] if the OS refuses the mapping.
    pub fn map(&self, len: usize) -> Result<Option<Mmap>> {
        let len = sys_alloc::round_to_granularity(len);
        {
            let _guard = LockGuard::new(LockOrder::Core);
            let mut state = self.state.lock();
            let after = state.heap_size.saturating_add(len);
            if after > scale(state.limit, self.collect_threshold) {
                return Ok(None);
            }
            if after > scale(state.limit, self.mark_threshold) {
                self.mark_requested.store(true, Ordering::Release);
            }
            state.heap_size = after;
        }
        match MmapOptions::new().len(len).map_anon() {
            Ok(memory) => Ok(Some(memory)),
            Err(err) => {
                self.release(len);
                Err(GcError::map_failed(len, &err))
            }
        }
    }

    /// Accounts for `len` bytes that were unmapped.
    pub fn release(&self, len: usize) {
        let _guard = LockGuard::new(LockOrder::Core);
        let mut state = self.state.lock();
        state.heap_size = state.heap_size.saturating_sub(len);
    }

    /// Raises the soft limit so that at least `needed` more bytes fit.
    ///
    /// Returns `false` when the hard cap leaves no room to grow.
    pub fn expand(&self, needed: usize) -> bool {
        let _guard = LockGuard::new(LockOrder::Core);
        let mut state = self.state.lock();
        let old = state.limit;
        let required = scale(
            state.heap_size.saturating_add(sys_alloc::round_to_granularity(needed)),
            1.0 / self.collect_threshold,
        );
        let target = scale(old, self.growth_factor)
            .max(required)
            .min(state.max_limit);
        if target <= old || target < required {
            return false;
        }
        state.limit = target;
        log_heap_limit(old, target);
        true
    }

    /// Grows the soft limit after a collection that freed little.
    pub fn adapt(&self, stat: &HeapStat) {
        if stat.mem_occupied == 0 {
            return;
        }
        #[allow(clippy::cast_precision_loss)]
        let yield_ratio = stat.mem_freed as f64 / stat.mem_occupied as f64;
        let factor = if yield_ratio < TIGHT_YIELD {
            2.0
        } else if yield_ratio < LOW_YIELD {
            MODEST_GROWTH
        } else {
            return;
        };
        let _guard = LockGuard::new(LockOrder::Core);
        let mut state = self.state.lock();
        let old = state.limit;
        state.limit = scale(old, factor).min(state.max_limit).max(old);
        if state.limit != old {
            log_heap_limit(old, state.limit);
        }
    }

    /// Sets the hard cap, lowering the soft limit to it if needed.
    pub fn set_max_limit(&self, max: usize) {
        let _guard = LockGuard::new(LockOrder::Core);
        let mut state = self.state.lock();
        state.max_limit = max;
        if state.limit > max {
            let old = state.limit;
            state.limit = max;
            log_heap_limit(old, max);
        }
    }

    /// Consumes a pending request to start concurrent marking.
    pub fn take_mark_request(&self) -> bool {
        self.mark_requested.swap(false, Ordering::AcqRel)
    }

    /// Bytes currently mapped.
    #[must_use]
    pub fn heap_size(&self) -> usize {
        self.state.lock().heap_size
    }

    /// Current soft limit.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.state.lock().limit
    }

    /// Hard cap of the soft limit.
    #[must_use]
    pub fn max_limit(&self) -> usize {
        self.state.lock().max_limit
    }
}
