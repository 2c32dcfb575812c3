//! GC metrics and statistics.

use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::gc::GcKind;
use crate::heap::chunk::ChunkStat;

/// Heap accounting for one collection.
///
/// All sizes are bytes of whole cells, header included.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStat {
    /// Bytes mapped by the heap when the collection started.
    pub mem_before_gc: usize,
    /// Bytes of cells in use when the collection started.
    pub mem_occupied: usize,
    /// Bytes of cells that survived.
    pub mem_live: usize,
    /// Bytes of garbage finalized.
    pub mem_freed: usize,
    /// Bytes relocated by compaction.
    pub mem_copied: usize,
    /// Bytes of chunks and large blocks returned to the OS.
    pub mem_released: usize,
    /// Surviving boxes that were pinned.
    pub pinned_cnt: usize,
}

impl HeapStat {
    /// Fraction of occupied bytes that survived, or 1.0 for an empty heap.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn residency(&self) -> f64 {
        if self.mem_occupied == 0 {
            1.0
        } else {
            self.mem_live as f64 / self.mem_occupied as f64
        }
    }
}

impl AddAssign for HeapStat {
    fn add_assign(&mut self, rhs: Self) {
        self.mem_before_gc += rhs.mem_before_gc;
        self.mem_occupied += rhs.mem_occupied;
        self.mem_live += rhs.mem_live;
        self.mem_freed += rhs.mem_freed;
        self.mem_copied += rhs.mem_copied;
        self.mem_released += rhs.mem_released;
        self.pinned_cnt += rhs.pinned_cnt;
    }
}

impl AddAssign<ChunkStat> for HeapStat {
    fn add_assign(&mut self, rhs: ChunkStat) {
        self.mem_occupied += rhs.occupied;
        self.mem_live += rhs.live;
        self.mem_freed += rhs.freed;
        self.mem_copied += rhs.copied;
        self.pinned_cnt += rhs.pinned;
    }
}

/// Record of one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcRunStat {
    /// What was requested.
    pub kind: GcKind,
    /// Heap accounting.
    pub heap: HeapStat,
    /// Total time the world was stopped.
    pub pause: Duration,
    /// Time spent marking inside the pause.
    pub mark_duration: Duration,
    /// Time spent sweeping and compacting.
    pub collect_duration: Duration,
    /// Time spent rewriting handles.
    pub fix_duration: Duration,
    /// Whether marking ran concurrently before the pause.
    pub concurrent_mark: bool,
}

impl GcRunStat {
    const EMPTY: Self = Self {
        kind: GcKind::MarkAndCollect,
        heap: HeapStat {
            mem_before_gc: 0,
            mem_occupied: 0,
            mem_live: 0,
            mem_freed: 0,
            mem_copied: 0,
            mem_released: 0,
            pinned_cnt: 0,
        },
        pause: Duration::ZERO,
        mark_duration: Duration::ZERO,
        collect_duration: Duration::ZERO,
        fix_duration: Duration::ZERO,
        concurrent_mark: false,
    };
}

/// Cumulative statistics of a collector.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    /// Completed collections.
    pub gc_count: usize,
    /// Sum of all pauses.
    pub total_gc_time: Duration,
    /// Bytes currently mapped by the heap.
    pub heap_size: usize,
    /// Current soft heap limit.
    pub heap_limit: usize,
}

/// Internal helper for timing the phases of a pause.
#[derive(Debug, Clone, Copy)]
pub struct PhaseTimer {
    /// Accumulated mark phase time.
    pub mark: Duration,
    /// Accumulated sweep and compaction time.
    pub collect: Duration,
    /// Accumulated fix-up time.
    pub fix: Duration,
    current_start: Option<Instant>,
}

impl PhaseTimer {
    /// Create a new `PhaseTimer` with all durations set to zero.
    pub const fn new() -> Self {
        Self {
            mark: Duration::ZERO,
            collect: Duration::ZERO,
            fix: Duration::ZERO,
            current_start: None,
        }
    }

    /// Start timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    /// End the mark phase and record its duration.
    pub fn end_mark(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.mark += start.elapsed();
        }
    }

    /// End the sweep/compaction phase and record its duration.
    pub fn end_collect(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.collect += start.elapsed();
        }
    }

    /// End the fix-up phase and record its duration.
    pub fn end_fix(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.fix += start.elapsed();
        }
    }
}

impl Default for PhaseTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Atomic counters for cumulative collector metrics.
#[derive(Debug, Default)]
pub struct GcCounters {
    collections: AtomicUsize,
    bytes_freed: AtomicUsize,
    bytes_copied: AtomicUsize,
    pause_ns: AtomicU64,
}

impl GcCounters {
    /// Returns the total number of collections performed.
    #[inline]
    #[must_use]
    pub fn total_collections(&self) -> usize {
        self.collections.load(Ordering::Relaxed)
    }

    /// Returns the total number of bytes finalized.
    #[inline]
    #[must_use]
    pub fn total_bytes_freed(&self) -> usize {
        self.bytes_freed.load(Ordering::Relaxed)
    }

    /// Returns the total number of bytes moved by compaction.
    #[inline]
    #[must_use]
    pub fn total_bytes_copied(&self) -> usize {
        self.bytes_copied.load(Ordering::Relaxed)
    }

    /// Returns the total pause time.
    #[inline]
    #[must_use]
    pub fn total_pause(&self) -> Duration {
        Duration::from_nanos(self.pause_ns.load(Ordering::Relaxed))
    }
}

/// Ring buffer size for GC history.
const HISTORY_SIZE: usize = 64;

/// Fixed-size ring buffer of recent collections.
#[derive(Debug)]
pub struct GcHistory {
    buffer: Mutex<[GcRunStat; HISTORY_SIZE]>,
    write_idx: AtomicUsize,
}

impl Default for GcHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl GcHistory {
    /// Create an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Mutex::new([GcRunStat::EMPTY; HISTORY_SIZE]),
            write_idx: AtomicUsize::new(0),
        }
    }

    fn push(&self, run: GcRunStat) {
        let mut buffer = self.buffer.lock();
        let idx = self.write_idx.load(Ordering::Relaxed);
        buffer[idx % HISTORY_SIZE] = run;
        self.write_idx.store(idx + 1, Ordering::Release);
    }

    /// Get the total number of collections recorded.
    ///
    /// This may exceed the buffer size.
    #[inline]
    #[must_use]
    pub fn total_recorded(&self) -> usize {
        self.write_idx.load(Ordering::Acquire)
    }

    /// The most recent `n` runs, oldest first.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<GcRunStat> {
        let buffer = self.buffer.lock();
        let total = self.total_recorded();
        let n = n.min(HISTORY_SIZE).min(total);
        (total - n..total)
            .map(|i| buffer[i % HISTORY_SIZE])
            .collect()
    }

    /// The most recent run, if any.
    #[must_use]
    pub fn last(&self) -> Option<GcRunStat> {
        self.recent(1).pop()
    }

    /// Average pause over the most recent `n` runs.
    ///
    /// Returns `Duration::ZERO` if no collections have been recorded.
    #[must_use]
    pub fn average_pause_time(&self, n: usize) -> Duration {
        let recent = self.recent(n);
        if recent.is_empty() {
            return Duration::ZERO;
        }
        let total_ns: u128 = recent.iter().map(|run| run.pause.as_nanos()).sum();
        Duration::from_nanos(
            (total_ns / recent.len() as u128)
                .try_into()
                .unwrap_or(u64::MAX),
        )
    }

    /// Longest pause over the most recent `n` runs.
    #[must_use]
    pub fn max_pause_time(&self, n: usize) -> Duration {
        self.recent(n)
            .iter()
            .map(|run| run.pause)
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

/// Everything a collector records about its runs.
#[derive(Debug, Default)]
pub struct GcMetrics {
    counters: GcCounters,
    history: GcHistory,
}

impl GcMetrics {
    /// Records a finished collection.
    pub fn record(&self, run: GcRunStat) {
        let c = &self.counters;
        c.collections.fetch_add(1, Ordering::Relaxed);
        c.bytes_freed.fetch_add(run.heap.mem_freed, Ordering::Relaxed);
        c.bytes_copied
            .fetch_add(run.heap.mem_copied, Ordering::Relaxed);
        c.pause_ns.fetch_add(
            run.pause.as_nanos().try_into().unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        self.history.push(run);
    }

    /// Cumulative counters.
    #[must_use]
    pub const fn counters(&self) -> &GcCounters {
        &self.counters
    }

    /// Recent runs.
    #[must_use]
    pub const fn history(&self) -> &GcHistory {
        &self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(pause_ms: u64, freed: usize) -> GcRunStat {
        GcRunStat {
            pause: Duration::from_millis(pause_ms),
            heap: HeapStat {
                mem_freed: freed,
                ..HeapStat::default()
            },
            ..GcRunStat::EMPTY
        }
    }

    #[test]
    fn test_heap_stat_accumulates_chunks() {
        let mut stat = HeapStat::default();
        stat += ChunkStat {
            occupied: 96,
            live: 32,
            freed: 64,
            copied: 32,
            pinned: 1,
        };
        stat += ChunkStat {
            occupied: 32,
            live: 32,
            ..ChunkStat::default()
        };
        assert_eq!(stat.mem_occupied, 128);
        assert_eq!(stat.mem_live, 64);
        assert_eq!(stat.mem_freed, 64);
        assert_eq!(stat.mem_copied, 32);
        assert_eq!(stat.pinned_cnt, 1);
        assert!((stat.residency() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_phase_timer_captures_durations() {
        let mut timer = PhaseTimer::new();
        timer.start();
        std::thread::sleep(Duration::from_millis(1));
        timer.end_mark();
        assert!(timer.mark > Duration::ZERO);
        assert!(timer.current_start.is_none());

        timer.end_fix();
        assert_eq!(timer.fix, Duration::ZERO);
    }

    #[test]
    fn test_history_new() {
        let history = GcHistory::new();
        assert_eq!(history.total_recorded(), 0);
        assert!(history.recent(10).is_empty());
        assert!(history.last().is_none());
        assert_eq!(history.average_pause_time(10), Duration::ZERO);
        assert_eq!(history.max_pause_time(10), Duration::ZERO);
    }

    #[test]
    fn test_history_wraps() {
        let metrics = GcMetrics::default();
        for i in 0..(HISTORY_SIZE as u64 + 6) {
            metrics.record(run(i, 10));
        }
        let history = metrics.history();
        assert_eq!(history.total_recorded(), HISTORY_SIZE + 6);
        assert_eq!(history.recent(1000).len(), HISTORY_SIZE);
        assert_eq!(
            history.last().map(|r| r.pause),
            Some(Duration::from_millis(HISTORY_SIZE as u64 + 5))
        );
        assert_eq!(
            history.max_pause_time(3),
            Duration::from_millis(HISTORY_SIZE as u64 + 5)
        );
        assert_eq!(metrics.counters().total_collections(), HISTORY_SIZE + 6);
        assert_eq!(metrics.counters().total_bytes_freed(), 10 * (HISTORY_SIZE + 6));
    }
}
