//! GC tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! tracing spans and events for collections, their phases, stop-the-world
//! pauses and heap pacing. Without the feature the same functions exist and
//! do nothing, so call sites need no `cfg`.

#[cfg(feature = "tracing")]
pub mod internal {
    //! Spans and events emitted by the collector.

    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use tracing::{span, Level};

    use crate::metrics::HeapStat;

    /// Phases of one collection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum GcPhase {
        /// Trace the live object graph.
        Mark,
        /// Finalize garbage in place.
        Sweep,
        /// Slide live objects together.
        Compact,
        /// Rewrite handles to moved objects.
        Fix,
        /// Reset liveness bits for the next cycle.
        Finalize,
    }

    /// Identifier correlating every event of one collection.
    ///
    /// A monotonically increasing counter starting at 1.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next unique GC ID.
    pub fn next_gc_id() -> GcId {
        GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a span for the entire collection.
    pub fn trace_gc_collection(kind: &str, gc_id: GcId) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_collect", kind = kind, gc_id = gc_id.0).entered()
    }

    /// Create a span for one phase.
    pub fn trace_phase(phase: GcPhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
    }

    /// Log the end of a phase.
    pub fn log_phase_end(phase: GcPhase, bytes: usize) {
        tracing::debug!(phase = ?phase, bytes, "phase_end");
    }

    /// Log that every other mutator acknowledged suspension.
    pub fn log_world_stopped(threads: usize, waited: Duration) {
        tracing::debug!(threads, waited_us = waited.as_micros(), "world_stopped");
    }

    /// Log that every suspended mutator acknowledged resumption.
    pub fn log_world_started(threads: usize) {
        tracing::debug!(threads, "world_started");
    }

    /// Log mutators that missed the safepoint grace period and are being
    /// suspended by the platform primitive.
    pub fn log_forced_suspend(threads: usize) {
        tracing::debug!(threads, "forced_suspend");
    }

    /// Log a platform suspend request the OS rejected.
    pub fn log_suspend_failed(thread: u64, code: i32) {
        tracing::warn!(thread, code, "suspend_failed");
    }

    /// Log a stop-the-world request refused by an unsafe scope.
    pub fn log_stw_refused(attempt: usize) {
        tracing::debug!(attempt, "stop_the_world_refused");
    }

    /// Log a step of the allocation retry ladder.
    pub fn log_alloc_retry(step: &str, requested: usize) {
        tracing::debug!(step, requested, "alloc_retry");
    }

    /// Log a change of the soft heap limit.
    pub fn log_heap_limit(old: usize, new: usize) {
        tracing::debug!(old, new, "heap_limit");
    }

    /// Log the start of concurrent marking.
    pub fn log_concurrent_mark_start(gc_id: GcId, workers: usize) {
        tracing::debug!(gc_id = gc_id.0, workers, "concurrent_mark_start");
    }

    /// Log the end of the final marking pause.
    pub fn log_remark(remembered: usize, marked: usize) {
        tracing::debug!(remembered, marked, "remark");
    }

    /// Log a collection's heap summary.
    pub fn log_heap_stat(gc_id: GcId, stat: &HeapStat, pause: Duration) {
        tracing::info!(
            gc_id = gc_id.0,
            before = stat.mem_before_gc,
            occupied = stat.mem_occupied,
            live = stat.mem_live,
            freed = stat.mem_freed,
            copied = stat.mem_copied,
            pinned = stat.pinned_cnt,
            pause_us = pause.as_micros(),
            "heap_stat"
        );
    }

    /// Log a rejected page discard.
    pub fn log_discard_failed(addr: usize, len: usize) {
        tracing::warn!(addr, len, "discard_failed");
    }
}

#[cfg(not(feature = "tracing"))]
pub mod internal {
    //! No-op stand-ins for the collector's spans and events.

    use std::time::Duration;

    use crate::metrics::HeapStat;

    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum GcPhase {
        /// Trace the live object graph.
        Mark,
        /// Finalize garbage in place.
        Sweep,
        /// Slide live objects together.
        Compact,
        /// Rewrite handles to moved objects.
        Fix,
        /// Reset liveness bits for the next cycle.
        Finalize,
    }

    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    /// Stub span guard.
    #[derive(Debug)]
    pub struct NoSpan;

    /// Stub function when tracing is disabled.
    pub const fn next_gc_id() -> GcId {
        GcId(0)
    }

    /// Stub function when tracing is disabled.
    pub const fn trace_gc_collection(_kind: &str, _gc_id: GcId) -> NoSpan {
        NoSpan
    }

    /// Stub function when tracing is disabled.
    pub const fn trace_phase(_phase: GcPhase) -> NoSpan {
        NoSpan
    }

    /// Stub function when tracing is disabled.
    pub const fn log_phase_end(_phase: GcPhase, _bytes: usize) {}

    /// Stub function when tracing is disabled.
    pub const fn log_world_stopped(_threads: usize, _waited: Duration) {}

    /// Stub function when tracing is disabled.
    pub const fn log_world_started(_threads: usize) {}

    /// Stub function when tracing is disabled.
    pub const fn log_forced_suspend(_threads: usize) {}

    /// Stub function when tracing is disabled.
    pub const fn log_suspend_failed(_thread: u64, _code: i32) {}

    /// Stub function when tracing is disabled.
    pub const fn log_stw_refused(_attempt: usize) {}

    /// Stub function when tracing is disabled.
    pub const fn log_alloc_retry(_step: &str, _requested: usize) {}

    /// Stub function when tracing is disabled.
    pub const fn log_heap_limit(_old: usize, _new: usize) {}

    /// Stub function when tracing is disabled.
    pub const fn log_concurrent_mark_start(_gc_id: GcId, _workers: usize) {}

    /// Stub function when tracing is disabled.
    pub const fn log_remark(_remembered: usize, _marked: usize) {}

    /// Stub function when tracing is disabled.
    pub const fn log_heap_stat(_gc_id: GcId, _stat: &HeapStat, _pause: Duration) {}

    /// Stub function when tracing is disabled.
    pub const fn log_discard_failed(_addr: usize, _len: usize) {}
}

pub use internal::{GcId, GcPhase};
