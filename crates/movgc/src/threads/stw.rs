//! Stop-the-world.
//!
//! [`stop_the_world`] takes the registry lock, fails fast if any thread is
//! inside an unsafe scope, asks every other registered thread to suspend and
//! waits on a counting barrier until each one has acknowledged. The number
//! of acknowledgements to expect is computed while the registry lock is
//! held, so threads registering or leaving concurrently cannot skew it; they
//! block on that lock until the world is resumed.
//!
//! Threads get [`SAFEPOINT_GRACE`] to stop at a safepoint. Whoever is still
//! running after that is stopped with the platform primitive, and the
//! request is repeated every grace period for threads that were inside a
//! critical section when it arrived.
//!
//! Dropping the [`WorldSnapshot`] resumes exactly the threads it stopped and
//! waits for each of them to acknowledge before releasing the registry.

use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{GcError, Result};
use crate::gc::sync::{LockGuard, LockOrder};
use crate::threads::registry::{ThreadRecord, ThreadRegistry};
use crate::tracing::internal::{log_forced_suspend, log_world_started, log_world_stopped};

/// How long a stop-the-world waits for safepoints before suspending the
/// remaining threads with the platform primitive.
pub const SAFEPOINT_GRACE: Duration = Duration::from_millis(2);

/// Arrivals from signal handlers cannot notify, so waiters re-check this
/// often.
const SIGNAL_POLL: Duration = Duration::from_millis(1);

/// Counts acknowledgements from suspended or resumed threads.
///
/// Arrivals may precede [`arm`](Self::arm); the count simply goes negative
/// until the expected number is added.
#[derive(Debug, Default)]
pub struct SuspendBarrier {
    pending: AtomicIsize,
    lock: Mutex<()>,
    done: Condvar,
}

impl SuspendBarrier {
    /// Creates a barrier expecting nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Expects `count` more arrivals.
    pub fn arm(&self, count: usize) {
        let count = isize::try_from(count).unwrap_or(isize::MAX);
        if self.pending.fetch_add(count, Ordering::SeqCst) + count <= 0 {
            self.notify();
        }
    }

    /// Records one arrival.
    pub fn arrive(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notify();
        }
    }

    /// Records one arrival from a signal handler, without waking waiters.
    pub fn arrive_from_signal(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    fn notify(&self) {
        let _lock = self.lock.lock();
        self.done.notify_all();
    }

    fn is_done(&self) -> bool {
        self.pending.load(Ordering::SeqCst) <= 0
    }

    /// Blocks until every expected arrival happened.
    pub fn wait(&self) {
        let mut lock = self.lock.lock();
        while !self.is_done() {
            let _ = self.done.wait_for(&mut lock, SIGNAL_POLL);
        }
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`. Returns whether
    /// every expected arrival happened.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut lock = self.lock.lock();
        while !self.is_done() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let _ = self.done.wait_for(&mut lock, (deadline - now).min(SIGNAL_POLL));
        }
        true
    }
}

/// The world, stopped. Dropping it resumes every thread it suspended.
pub struct WorldSnapshot<'a> {
    registry: &'a ThreadRegistry,
    threads: MutexGuard<'a, Vec<Arc<ThreadRecord>>>,
    stopped: Vec<Arc<ThreadRecord>>,
    _order: LockGuard,
}

impl WorldSnapshot<'_> {
    /// Every registered thread, the requester included.
    #[must_use]
    pub fn threads(&self) -> &[Arc<ThreadRecord>] {
        &self.threads
    }

    /// Number of threads this snapshot suspended.
    #[must_use]
    pub fn suspended(&self) -> usize {
        self.stopped.len()
    }
}

impl Drop for WorldSnapshot<'_> {
    fn drop(&mut self) {
        let mut pending = 0;
        for record in &self.stopped {
            if record.request_resume(self.registry) {
                pending += 1;
            }
        }
        self.registry.barrier.arm(pending);
        self.registry.barrier.wait();
        log_world_started(self.stopped.len());
    }
}

impl std::fmt::Debug for WorldSnapshot<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldSnapshot")
            .field("threads", &self.threads.len())
            .field("suspended", &self.stopped.len())
            .finish()
    }
}

/// Suspends every registered thread except `requester`.
///
/// A registered requester waits for the registry lock outside managed code,
/// so a concurrent stop-the-world can count it as stopped instead of
/// deadlocking on it.
///
/// # Errors
///
/// Returns [`GcError::StopTheWorldDisabled`] if a thread is inside an
/// unsafe scope.
pub fn stop_the_world<'a>(
    registry: &'a ThreadRegistry,
    requester: Option<&ThreadRecord>,
) -> Result<WorldSnapshot<'a>> {
    let order = LockGuard::new(LockOrder::Registry);
    let threads = match requester {
        Some(record) => record.blocking(registry, || registry.lock_threads()),
        None => registry.lock_threads(),
    };
    if registry.disabled.load(Ordering::SeqCst) > 0 {
        return Err(GcError::StopTheWorldDisabled);
    }

    let started = Instant::now();
    let requester = requester.map(ThreadRecord::id);
    let mut stopped = Vec::with_capacity(threads.len());
    let mut pending = 0;
    for record in threads.iter().filter(|record| Some(record.id()) != requester) {
        if record.request_suspend(registry) {
            pending += 1;
        }
        stopped.push(Arc::clone(record));
    }
    registry.barrier.arm(pending);
    while !registry.barrier.wait_timeout(SAFEPOINT_GRACE) {
        let forced = stopped
            .iter()
            .filter(|record| record.force_suspend(registry))
            .count();
        if forced > 0 {
            log_forced_suspend(forced);
        }
    }
    log_world_stopped(stopped.len(), started.elapsed());

    Ok(WorldSnapshot {
        registry,
        threads,
        stopped,
        _order: order,
    })
}
