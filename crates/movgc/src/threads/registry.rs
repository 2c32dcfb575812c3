//! Registered mutator threads and their per-thread collector state.
//!
//! Every thread that touches the heap owns a [`ThreadRecord`]. The record
//! holds the thread's suspension state machine and everything the collector
//! reads from it while the world is stopped: roots, pins, constructions in
//! progress and the store buffer of the write barrier. The owner mutates
//! these only inside a [`Critical`] section; the collector reads them only
//! while the owner is suspended, so the per-record locks are never contended
//! and never held across another lock.
//!
//! # Suspension states
//!
//! ```text
//! Running ──request──▶ SuspendRequested ──safepoint / signal──▶ Suspended
//!    ▲                                                              │
//!    └──────────ack◀── ResumeRequested ◀──────────resume────────────┘
//!
//! Native ──request──▶ NativeSuspended ──resume──▶ Native
//! ```
//!
//! A thread in `Native` is blocked outside managed code and counts as
//! suspended the moment it is asked; it cannot return to `Running` until
//! the world is resumed.
//!
//! A running thread acknowledges at its next safepoint. One that does not
//! get there within the grace period is stopped by the platform primitive
//! in [`suspend`](crate::threads::suspend), at whatever instruction it is
//! executing, unless it is inside a critical section; then it acknowledges
//! when the section ends. The state is a single atomic so the signal
//! handler can take part in every transition.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::config::RootMode;
use crate::error::{GcError, Result};
use crate::gc::sync::{LockGuard, LockOrder};
use crate::heap::index::{IndexEntry, MemoryIndex};
use crate::threads::pins::Pins;
use crate::threads::roots::{AllocStack, RootSet};
use crate::threads::stack::{current_stack_bounds, StackBitmap, StackBounds};
use crate::threads::stw::SuspendBarrier;
#[cfg(all(any(unix, windows), not(miri)))]
use crate::threads::suspend;
use crate::threads::suspend::NativeThread;
#[cfg(all(any(unix, windows), not(miri)))]
use crate::tracing::internal::log_suspend_failed;

/// Suspension state of a mutator thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Executing managed code.
    Running,
    /// Blocked outside managed code.
    Native,
    /// Asked to stop.
    SuspendRequested,
    /// Stopped at a safepoint or by the platform primitive.
    Suspended,
    /// Asked to stop while blocked outside managed code.
    NativeSuspended,
    /// Released but not yet running again.
    ResumeRequested,
}

impl ThreadState {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Running,
            1 => Self::Native,
            2 => Self::SuspendRequested,
            3 => Self::Suspended,
            4 => Self::NativeSuspended,
            _ => Self::ResumeRequested,
        }
    }
}

/// Description of a thread being registered.
#[derive(Debug, Clone, Default)]
pub struct ThreadInfo {
    /// Name used in diagnostics.
    pub name: Option<String>,
    /// Stack range, needed for conservative roots.
    pub stack: Option<StackBounds>,
}

impl ThreadInfo {
    /// Describes the calling thread.
    #[must_use]
    pub fn current() -> Self {
        Self {
            name: thread::current().name().map(str::to_owned),
            stack: current_stack_bounds(),
        }
    }

    /// Overrides the diagnostic name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Collector-visible state of one mutator thread.
pub struct ThreadRecord {
    id: u64,
    os_thread: ThreadId,
    #[cfg_attr(any(miri, not(any(unix, windows))), allow(dead_code))]
    native: Option<NativeThread>,
    name: Option<String>,
    stack: Option<StackBounds>,
    state: AtomicU8,
    gate: Mutex<()>,
    wake: Condvar,
    requested: AtomicBool,
    forced: AtomicBool,
    critical: AtomicUsize,
    unsafe_depth: AtomicUsize,
    pub(crate) roots: Mutex<RootSet>,
    pub(crate) stack_roots: Mutex<Option<StackBitmap>>,
    pub(crate) pins: Mutex<Pins>,
    pub(crate) alloc_stack: Mutex<AllocStack>,
    pub(crate) store_buffer: Mutex<Vec<usize>>,
}

impl ThreadRecord {
    fn new(id: u64, info: ThreadInfo, root_mode: RootMode) -> Self {
        let stack_roots = match (root_mode, info.stack) {
            (RootMode::Conservative, Some(bounds)) => Some(StackBitmap::new(bounds)),
            _ => None,
        };
        Self {
            id,
            os_thread: thread::current().id(),
            native: NativeThread::current(),
            name: info.name,
            stack: info.stack,
            state: AtomicU8::new(ThreadState::Running as u8),
            gate: Mutex::new(()),
            wake: Condvar::new(),
            requested: AtomicBool::new(false),
            forced: AtomicBool::new(false),
            critical: AtomicUsize::new(0),
            unsafe_depth: AtomicUsize::new(0),
            roots: Mutex::new(RootSet::new()),
            stack_roots: Mutex::new(stack_roots),
            pins: Mutex::new(Pins::new()),
            alloc_stack: Mutex::new(AllocStack::new()),
            store_buffer: Mutex::new(Vec::new()),
        }
    }

    /// Collector-unique id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Diagnostic name.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Stack range given at registration.
    #[must_use]
    pub const fn stack(&self) -> Option<StackBounds> {
        self.stack
    }

    /// Current suspension state.
    #[must_use]
    pub fn state(&self) -> ThreadState {
        ThreadState::from_raw(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: ThreadState, to: ThreadState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Whether the thread is inside an unsafe scope.
    #[must_use]
    pub fn in_unsafe_scope(&self) -> bool {
        self.unsafe_depth.load(Ordering::Relaxed) > 0
    }

    /// Whether the thread is inside a critical section.
    #[must_use]
    pub fn in_critical(&self) -> bool {
        self.critical.load(Ordering::SeqCst) > 0
    }

    /// Defers platform suspension of the calling thread until the guard is
    /// dropped. Sections nest.
    ///
    /// Anything that takes a lock the collector also takes during a pause
    /// must run inside one, so the thread is never frozen holding it.
    pub fn enter_critical<'a>(&'a self, registry: &'a ThreadRegistry) -> Critical<'a> {
        self.critical.fetch_add(1, Ordering::SeqCst);
        Critical {
            record: self,
            registry,
        }
    }

    /// Stops here if the collector asked for it.
    #[inline]
    pub fn safepoint(&self, registry: &ThreadRegistry) {
        if self.requested.load(Ordering::Acquire) {
            self.acknowledge(registry);
        }
    }

    #[cold]
    fn acknowledge(&self, registry: &ThreadRegistry) {
        self.critical.fetch_add(1, Ordering::SeqCst);
        if self.transition(ThreadState::SuspendRequested, ThreadState::Suspended) {
            registry.suspended.fetch_add(1, Ordering::SeqCst);
            registry.barrier.arrive();
            let mut gate = self.gate.lock();
            while self.state() == ThreadState::Suspended {
                self.wake.wait(&mut gate);
            }
            drop(gate);
            self.finish_resume(registry);
            registry.barrier.arrive();
        }
        self.critical.fetch_sub(1, Ordering::SeqCst);
    }

    fn finish_resume(&self, registry: &ThreadRegistry) {
        debug_assert_eq!(self.state(), ThreadState::ResumeRequested);
        self.requested.store(false, Ordering::Release);
        self.set_state(ThreadState::Running);
        registry.suspended.fetch_sub(1, Ordering::SeqCst);
    }

    /// Suspend handler body. Only atomics and async-signal-safe calls.
    #[cfg(all(unix, not(miri)))]
    pub(crate) fn park_in_signal(&self, registry: &ThreadRegistry) {
        if self.in_critical()
            || !self.transition(ThreadState::SuspendRequested, ThreadState::Suspended)
        {
            return;
        }
        self.forced.store(true, Ordering::SeqCst);
        registry.suspended.fetch_add(1, Ordering::SeqCst);
        registry.barrier.arrive_from_signal();
        suspend::wait_for_resume(|| self.state() != ThreadState::Suspended);
        self.finish_resume(registry);
        registry.barrier.arrive_from_signal();
    }

    /// Leaves managed code. The collector treats the thread as stopped
    /// until [`leave_native`](Self::leave_native).
    ///
    /// # Panics
    ///
    /// Panics if the thread is already outside managed code.
    pub fn enter_native(&self, registry: &ThreadRegistry) {
        loop {
            match self.state() {
                ThreadState::Running => {
                    if self.transition(ThreadState::Running, ThreadState::Native) {
                        return;
                    }
                }
                ThreadState::SuspendRequested => self.acknowledge(registry),
                other => panic!("thread {} cannot enter native code while {other:?}", self.id),
            }
        }
    }

    /// Returns to managed code, waiting for the world to resume if it is
    /// stopped.
    ///
    /// # Panics
    ///
    /// Panics if the thread is not outside managed code.
    pub fn leave_native(&self) {
        loop {
            match self.state() {
                ThreadState::Native => {
                    if self.transition(ThreadState::Native, ThreadState::Running) {
                        return;
                    }
                }
                ThreadState::NativeSuspended => {
                    let mut gate = self.gate.lock();
                    while self.state() == ThreadState::NativeSuspended {
                        self.wake.wait(&mut gate);
                    }
                }
                other => panic!("thread {} is not in native code but {other:?}", self.id),
            }
        }
    }

    /// Runs `f` outside managed code.
    pub fn blocking<R>(&self, registry: &ThreadRegistry, f: impl FnOnce() -> R) -> R {
        self.enter_native(registry);
        let result = f();
        self.leave_native();
        result
    }

    pub(crate) fn enter_unsafe(&self, registry: &ThreadRegistry) {
        self.safepoint(registry);
        registry.disabled.fetch_add(1, Ordering::SeqCst);
        self.unsafe_depth.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn leave_unsafe(&self, registry: &ThreadRegistry) {
        self.unsafe_depth.fetch_sub(1, Ordering::Relaxed);
        registry.disabled.fetch_sub(1, Ordering::SeqCst);
        self.safepoint(registry);
    }

    /// Collector side: asks the thread to stop. Returns whether an
    /// acknowledgement must be awaited.
    pub(crate) fn request_suspend(&self, registry: &ThreadRegistry) -> bool {
        loop {
            match self.state() {
                ThreadState::Running => {
                    if self.transition(ThreadState::Running, ThreadState::SuspendRequested) {
                        self.requested.store(true, Ordering::Release);
                        return true;
                    }
                }
                ThreadState::Native => {
                    if self.transition(ThreadState::Native, ThreadState::NativeSuspended) {
                        registry.suspended.fetch_add(1, Ordering::SeqCst);
                        return false;
                    }
                }
                other => panic!("thread {} asked to suspend while {other:?}", self.id),
            }
        }
    }

    /// Collector side: stops a thread that has not acknowledged yet with
    /// the platform primitive. Returns whether a suspension was issued.
    #[cfg(all(unix, not(miri)))]
    pub(crate) fn force_suspend(&self, _registry: &ThreadRegistry) -> bool {
        if self.state() != ThreadState::SuspendRequested {
            return false;
        }
        let Some(native) = self.native.as_ref() else {
            return false;
        };
        match suspend::send_suspend(native) {
            Ok(()) => true,
            Err(code) => {
                log_suspend_failed(self.id, code);
                false
            }
        }
    }

    /// Collector side: stops a thread that has not acknowledged yet with
    /// the platform primitive. Returns whether a suspension was issued.
    #[cfg(all(windows, not(miri)))]
    pub(crate) fn force_suspend(&self, registry: &ThreadRegistry) -> bool {
        if self.state() != ThreadState::SuspendRequested {
            return false;
        }
        let Some(native) = self.native.as_ref() else {
            return false;
        };
        if let Err(code) = suspend::freeze(native) {
            log_suspend_failed(self.id, code);
            return false;
        }
        if !self.in_critical()
            && self.transition(ThreadState::SuspendRequested, ThreadState::Suspended)
        {
            self.forced.store(true, Ordering::SeqCst);
            registry.suspended.fetch_add(1, Ordering::SeqCst);
            registry.barrier.arrive();
            true
        } else {
            suspend::thaw(native);
            false
        }
    }

    /// Collector side: no platform primitive here; safepoints only.
    #[cfg(any(miri, not(any(unix, windows))))]
    pub(crate) fn force_suspend(&self, _registry: &ThreadRegistry) -> bool {
        false
    }

    /// Collector side: releases the thread. Returns whether an
    /// acknowledgement must be awaited.
    pub(crate) fn request_resume(&self, registry: &ThreadRegistry) -> bool {
        let acknowledged = match self.state() {
            ThreadState::Suspended if self.forced.swap(false, Ordering::SeqCst) => {
                self.resume_forced(registry)
            }
            ThreadState::Suspended => {
                self.set_state(ThreadState::ResumeRequested);
                true
            }
            ThreadState::NativeSuspended => {
                self.set_state(ThreadState::Native);
                registry.suspended.fetch_sub(1, Ordering::SeqCst);
                false
            }
            other => panic!("thread {} asked to resume while {other:?}", self.id),
        };
        let _gate = self.gate.lock();
        self.wake.notify_all();
        acknowledged
    }

    #[cfg(all(unix, not(miri)))]
    fn resume_forced(&self, _registry: &ThreadRegistry) -> bool {
        self.set_state(ThreadState::ResumeRequested);
        if let Some(native) = self.native.as_ref() {
            if let Err(code) = suspend::send_resume(native) {
                log_suspend_failed(self.id, code);
            }
        }
        true
    }

    #[cfg(all(windows, not(miri)))]
    fn resume_forced(&self, registry: &ThreadRegistry) -> bool {
        self.requested.store(false, Ordering::Release);
        self.set_state(ThreadState::Running);
        registry.suspended.fetch_sub(1, Ordering::SeqCst);
        if let Some(native) = self.native.as_ref() {
            suspend::thaw(native);
        }
        false
    }

    #[cfg(any(miri, not(any(unix, windows))))]
    fn resume_forced(&self, _registry: &ThreadRegistry) -> bool {
        self.set_state(ThreadState::ResumeRequested);
        true
    }
}

impl std::fmt::Debug for ThreadRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// A section in which the owning thread may hold collector locks.
///
/// Dropping the outermost guard runs a safepoint, answering any suspension
/// that was deferred while it lived.
#[must_use = "the section ends when the guard is dropped"]
pub struct Critical<'a> {
    record: &'a ThreadRecord,
    registry: &'a ThreadRegistry,
}

impl Drop for Critical<'_> {
    fn drop(&mut self) {
        if self.record.critical.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.record.safepoint(self.registry);
        }
    }
}

impl std::fmt::Debug for Critical<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Critical")
            .field("thread", &self.record.id)
            .finish()
    }
}

/// All mutator threads of one collector.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    threads: Mutex<Vec<Arc<ThreadRecord>>>,
    count: AtomicUsize,
    next_id: AtomicU64,
    pub(crate) disabled: AtomicUsize,
    pub(crate) suspended: AtomicUsize,
    pub(crate) barrier: SuspendBarrier,
}

impl ThreadRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the calling thread.
    ///
    /// The record stays valid for platform suspension until
    /// [`deregister`](Self::deregister), so the registry must not move in
    /// the meantime.
    ///
    /// In conservative mode the stack range is indexed so that handle slots
    /// on it can be told apart from heap slots.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::ThreadAlreadyRegistered`] if the calling thread
    /// already has a record.
    pub fn register(
        &self,
        info: ThreadInfo,
        root_mode: RootMode,
        index: &MemoryIndex,
    ) -> Result<Arc<ThreadRecord>> {
        let _guard = LockGuard::new(LockOrder::Registry);
        let mut threads = self.threads.lock();
        let os_thread = thread::current().id();
        if threads.iter().any(|record| record.os_thread == os_thread) {
            return Err(GcError::ThreadAlreadyRegistered);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = Arc::new(ThreadRecord::new(id, info, root_mode));
        if let Some(bitmap) = record.stack_roots.lock().as_ref() {
            index.add(bitmap.range(), IndexEntry::Stack(id));
        }
        #[cfg(all(unix, not(miri)))]
        {
            suspend::install();
            // A full table leaves the thread to safepoints alone.
            let _ = suspend::bind(&record, self);
        }
        threads.push(Arc::clone(&record));
        self.count.store(threads.len(), Ordering::SeqCst);
        Ok(record)
    }

    /// Removes `record`, waiting for any stop-the-world in progress.
    ///
    /// Must run on the thread that registered `record`, before that thread
    /// exits.
    pub fn deregister(&self, record: &ThreadRecord, index: &MemoryIndex) {
        debug_assert_eq!(
            thread::current().id(),
            record.os_thread,
            "thread {} deregistered from another thread",
            record.id
        );
        record.enter_native(self);
        #[cfg(all(unix, not(miri)))]
        suspend::unbind(record);
        {
            let _guard = LockGuard::new(LockOrder::Registry);
            let mut threads = self.threads.lock();
            threads.retain(|other| other.id != record.id);
            self.count.store(threads.len(), Ordering::SeqCst);
        }
        if let Some(bitmap) = record.stack_roots.lock().as_ref() {
            index.remove(bitmap.range());
        }
    }

    /// Number of registered threads. Does not take the registry lock, so
    /// it is safe to call while the world is stopped.
    #[must_use]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Whether no thread is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Threads currently stopped by a stop-the-world.
    #[must_use]
    pub fn threads_suspended(&self) -> usize {
        self.suspended.load(Ordering::SeqCst)
    }

    /// Whether some thread is inside an unsafe scope.
    #[must_use]
    pub fn stop_the_world_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst) > 0
    }

    pub(crate) fn lock_threads(&self) -> MutexGuard<'_, Vec<Arc<ThreadRecord>>> {
        self.threads.lock()
    }
}
