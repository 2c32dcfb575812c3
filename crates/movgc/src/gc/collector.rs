//! The collector.
//!
//! [`GcCore`] owns the heap, the thread registry and the marking machinery
//! and drives collections. A [`Collector`] is the shared handle user code
//! holds; every [`Mutator`](crate::Mutator) keeps the same core alive.
//!
//! ## Cycles
//!
//! A serial collection is a single pause: stop the world, mark from the
//! roots with the worker pool, sweep or compact, fix handles, resume.
//!
//! A concurrent mark-sweep cycle splits marking in two. A short pause seeds
//! the packet pools from the roots and turns the write barrier on; marker
//! threads then trace while mutators keep running. The cycle is finished by
//! the first allocation that finds the markers done, or by any explicit
//! collection: a second pause re-scans the roots, drains the remembered set
//! and marks to completion before sweeping.

use std::cell::RefCell;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::compact::{fix_roots, fix_slots};
use crate::compact::Forwarding;
use crate::config::{CollectorKind, GcConfig, RootMode};
use crate::error::{GcError, Result};
use crate::gc::marker::{mark_parallel, MarkWorker};
use crate::gc::packets::PacketManager;
use crate::gc::remset::{self, RememberedSet};
use crate::gc::sync::{LockGuard, LockOrder};
use crate::gc::thread_pool::StaticThreadPool;
use crate::gc::{GcKind, GcOptions};
use crate::handle::Handle;
use crate::heap::box_meta::{self, BoxHeader};
use crate::heap::index::MemoryIndex;
use crate::heap::{self, Allocation, Heap};
use crate::meta::{TypeKey, TypeMeta, TypeRegistry};
use crate::metrics::{GcMetrics, GcRunStat, GcStats, PhaseTimer};
use crate::mutator::Mutator;
use crate::threads::registry::{ThreadInfo, ThreadRecord, ThreadRegistry};
use crate::threads::roots::RootSet;
use crate::threads::stw::{stop_the_world, WorldSnapshot};
use crate::tracing::internal::{
    log_alloc_retry, log_concurrent_mark_start, log_heap_limit, log_heap_stat, log_remark,
    log_stw_refused, next_gc_id, trace_gc_collection, trace_phase,
};
use crate::tracing::{GcId, GcPhase};

/// Stop-the-world attempts before a collection gives up on unsafe scopes.
const STW_ATTEMPTS: usize = 16;

thread_local! {
    /// Records of the current thread, keyed by the address of their core.
    static CURRENT: RefCell<Vec<(usize, Arc<ThreadRecord>)>> = const { RefCell::new(Vec::new()) };
}

/// State of the concurrent cycle.
enum Phase {
    Idle,
    Marking(ConcurrentCycle),
}

struct ConcurrentCycle {
    gc_id: GcId,
    initial_pause: Duration,
    workers: Vec<JoinHandle<usize>>,
}

/// Shared state of one collector.
pub(crate) struct GcCore {
    pub(crate) config: GcConfig,
    pub(crate) heap: Heap,
    pub(crate) types: TypeRegistry,
    pub(crate) registry: ThreadRegistry,
    pub(crate) remembered: RememberedSet,
    marking: AtomicBool,
    packets: PacketManager,
    static_roots: Mutex<RootSet>,
    workers: StaticThreadPool,
    phase: Mutex<Phase>,
    metrics: GcMetrics,
    print_stats: AtomicBool,
}

impl GcCore {
    fn new(config: GcConfig) -> Self {
        Self {
            heap: Heap::new(&config),
            types: TypeRegistry::new(),
            registry: ThreadRegistry::new(),
            remembered: RememberedSet::new(),
            marking: AtomicBool::new(false),
            packets: PacketManager::new(),
            static_roots: Mutex::new(RootSet::new()),
            workers: StaticThreadPool::new(config.effective_workers()),
            phase: Mutex::new(Phase::Idle),
            metrics: GcMetrics::default(),
            print_stats: AtomicBool::new(config.print_stats),
            config,
        }
    }

    fn key(&self) -> usize {
        self as *const Self as usize
    }

    /// Whether concurrent marking is in progress and the write barrier is on.
    #[inline]
    pub(crate) fn is_marking(&self) -> bool {
        self.marking.load(Ordering::SeqCst)
    }

    /// Runs a collection of the requested kind.
    ///
    /// Returns `None` when no pause happened: a mark-only request starts a
    /// concurrent cycle (or does nothing under the serial collector).
    pub(crate) fn collect(
        self: &Arc<Self>,
        options: GcOptions,
        requester: Option<&ThreadRecord>,
    ) -> Result<Option<GcRunStat>> {
        let _order = LockGuard::new(LockOrder::Collection);
        let mut phase = match requester {
            Some(record) => record.blocking(&self.registry, || self.phase.lock()),
            None => self.phase.lock(),
        };
        if options.kind == GcKind::MarkOnly {
            if self.config.collector == CollectorKind::ConcurrentMarkSweep
                && matches!(*phase, Phase::Idle)
            {
                *phase = Phase::Marking(self.start_concurrent_mark(requester)?);
            }
            return Ok(None);
        }
        self.run_cycle(&mut phase, options, requester).map(Some)
    }

    fn stop_world(&self, requester: Option<&ThreadRecord>) -> Result<WorldSnapshot<'_>> {
        let mut attempt = 0;
        loop {
            match stop_the_world(&self.registry, requester) {
                Err(GcError::StopTheWorldDisabled) if attempt + 1 < STW_ATTEMPTS => {
                    log_stw_refused(attempt);
                    attempt += 1;
                    match requester {
                        Some(record) => record.blocking(&self.registry, thread::yield_now),
                        None => thread::yield_now(),
                    }
                }
                other => return other,
            }
        }
    }

    fn start_concurrent_mark(
        self: &Arc<Self>,
        requester: Option<&ThreadRecord>,
    ) -> Result<ConcurrentCycle> {
        let gc_id = next_gc_id();
        let _span = trace_gc_collection(GcKind::MarkOnly.name(), gc_id);
        let world = self.stop_world(requester)?;
        let paused = Instant::now();
        let count = self.config.effective_workers();
        self.packets.start(count);
        {
            let _phase = trace_phase(GcPhase::Mark);
            let mut seeder = MarkWorker::new(&self.packets, self.heap.index());
            self.seed(&world, &mut seeder);
            let _ = seeder.finish();
        }
        self.marking.store(true, Ordering::SeqCst);
        drop(world);
        let initial_pause = paused.elapsed();
        log_concurrent_mark_start(gc_id, count);

        let workers = (0..count)
            .filter_map(|i| {
                let core = Arc::clone(self);
                let spawned = thread::Builder::new()
                    .name(format!("movgc-marker-{i}"))
                    .spawn(move || MarkWorker::new(&core.packets, core.heap.index()).run());
                match spawned {
                    Ok(handle) => Some(handle),
                    Err(_) => {
                        // The final pause marks whatever is left.
                        self.packets.retire_worker();
                        None
                    }
                }
            })
            .collect();
        Ok(ConcurrentCycle {
            gc_id,
            initial_pause,
            workers,
        })
    }

    fn run_cycle(
        &self,
        phase: &mut Phase,
        options: GcOptions,
        requester: Option<&ThreadRecord>,
    ) -> Result<GcRunStat> {
        let mut concurrent = match mem::replace(phase, Phase::Idle) {
            Phase::Marking(cycle) => Some(cycle),
            Phase::Idle => None,
        };
        let gc_id = concurrent.as_ref().map_or_else(next_gc_id, |cycle| cycle.gc_id);
        let _span = trace_gc_collection(options.kind.name(), gc_id);
        let world = match self.stop_world(requester) {
            Ok(world) => world,
            Err(err) => {
                if let Some(cycle) = concurrent {
                    *phase = Phase::Marking(cycle);
                }
                return Err(err);
            }
        };
        let paused = Instant::now();
        let mut timer = PhaseTimer::new();

        timer.start();
        {
            let _phase = trace_phase(GcPhase::Mark);
            let mut marked = 0;
            if let Some(cycle) = concurrent.as_mut() {
                for worker in cycle.workers.drain(..) {
                    marked += worker
                        .join()
                        .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
                }
            }
            self.marking.store(false, Ordering::SeqCst);

            let mut seeder = MarkWorker::new(&self.packets, self.heap.index());
            self.seed(&world, &mut seeder);
            let mut remembered = 0;
            if concurrent.is_some() {
                for record in world.threads() {
                    remset::flush(&record.store_buffer, &self.remembered);
                }
                let cells = self.remembered.drain();
                remembered = cells.len();
                for cell in cells {
                    seeder.shade(cell);
                }
            }
            marked += seeder.finish();
            marked += mark_parallel(&self.packets, self.heap.index(), &self.workers);
            log_remark(remembered, marked);
        }
        timer.end_mark();

        timer.start();
        let full = options.kind == GcKind::FullCollect;
        // SAFETY: the world is stopped and marking has terminated.
        let stat = unsafe {
            self.heap.collect(full, &self.workers, &mut timer, |forwarding, index| {
                self.fix_roots(&world, forwarding, index)
            })
        };
        timer.end_collect();
        drop(world);

        let concurrent_mark = concurrent.is_some();
        let initial_pause = concurrent.map_or(Duration::ZERO, |cycle| cycle.initial_pause);
        let pause = paused.elapsed();
        let run = GcRunStat {
            kind: options.kind,
            heap: stat,
            pause: pause + initial_pause,
            mark_duration: timer.mark,
            collect_duration: timer.collect,
            fix_duration: timer.fix,
            concurrent_mark,
        };
        self.metrics.record(run);
        if options.print_stats || self.print_stats.load(Ordering::Relaxed) {
            log_heap_stat(gc_id, &stat, pause);
        }
        Ok(run)
    }

    /// Shades every root of a stopped world.
    fn seed(&self, world: &WorldSnapshot<'_>, seeder: &mut MarkWorker<'_>) {
        for record in world.threads() {
            for entry in record.alloc_stack.lock().iter() {
                // SAFETY: offsets are recorded by `Construction::store`,
                // which only accepts handle slots inside the object.
                unsafe { seeder.in_flight(entry) };
            }
            let roots = record.roots.lock();
            // SAFETY: root slots stay valid until deregistered.
            for handle in unsafe { roots.handles() } {
                seeder.root(handle);
            }
            drop(roots);
            if let Some(bitmap) = record.stack_roots.lock().as_ref() {
                // SAFETY: as above.
                for handle in unsafe { bitmap.handles() } {
                    seeder.conservative_root(handle.load(Ordering::Acquire) as usize);
                }
            }
            for addr in record.pins.lock().addresses() {
                seeder.pin(addr);
            }
        }
        let statics = self.static_roots.lock();
        // SAFETY: static roots live for the whole program.
        for handle in unsafe { statics.handles() } {
            seeder.root(handle);
        }
    }

    /// Rewrites every handle held outside the heap. Stack slots are left
    /// alone: conservative roots pin their targets.
    fn fix_roots(&self, world: &WorldSnapshot<'_>, forwarding: &Forwarding, index: &MemoryIndex) -> usize {
        let mut fixed = 0;
        for record in world.threads() {
            let roots = record.roots.lock();
            // SAFETY: root slots stay valid until deregistered.
            fixed += fix_roots(unsafe { roots.handles() }, forwarding, index);
            drop(roots);
            for entry in record.alloc_stack.lock().iter() {
                // SAFETY: see `seed`.
                fixed += unsafe {
                    fix_slots(entry.allocation.object() as usize, &entry.offsets, forwarding, index)
                };
            }
        }
        let statics = self.static_roots.lock();
        // SAFETY: static roots live for the whole program.
        fixed + fix_roots(unsafe { statics.handles() }, forwarding, index)
    }

    /// Starts or finishes a concurrent cycle when one is due.
    fn poll(self: &Arc<Self>, record: &ThreadRecord) {
        let requested = self.heap.core().take_mark_request();
        if self.config.collector != CollectorKind::ConcurrentMarkSweep {
            return;
        }
        // A refused pause is retried at a later allocation.
        if self.is_marking() {
            if self.packets.is_done() {
                let _ = self.collect(GcOptions::mark_and_collect(), Some(record));
            }
        } else if requested {
            let _ = self.collect(GcOptions::mark_only(), Some(record));
        }
    }

    /// Reserves a box, collecting and then growing the heap when the first
    /// attempt fails.
    pub(crate) fn allocate(
        self: &Arc<Self>,
        record: &ThreadRecord,
        object_size: usize,
        count: usize,
        meta: Option<&TypeMeta>,
    ) -> Result<Allocation> {
        record.safepoint(&self.registry);
        self.poll(record);
        if let Some(allocation) = self.heap.allocate(object_size, count, meta)? {
            return Ok(allocation);
        }

        let requested = heap::request_size(object_size, count)?;
        log_alloc_retry("collect", requested);
        match self.collect(GcOptions::mark_and_collect(), Some(record)) {
            Ok(_) | Err(GcError::StopTheWorldDisabled) => {}
            Err(err) => return Err(err),
        }
        if let Some(allocation) = self.heap.allocate(object_size, count, meta)? {
            return Ok(allocation);
        }

        log_alloc_retry("expand", requested);
        let core = self.heap.core();
        let limit = core.limit();
        if core.expand(heap::mapping_size(requested)) {
            log_heap_limit(limit, core.limit());
            if let Some(allocation) = self.heap.allocate(object_size, count, meta)? {
                return Ok(allocation);
            }
        }
        Err(GcError::OutOfMemory { requested })
    }

    /// Finishes a construction. Without `meta` the header's metadata is
    /// kept, or metadata is published under `name` from the handle offsets
    /// written during construction.
    pub(crate) fn commit(
        &self,
        record: &ThreadRecord,
        token: u64,
        object_size: usize,
        meta: Option<&TypeMeta>,
        name: &'static str,
    ) {
        let entry = record.alloc_stack.lock().pop(token);
        let allocation = entry.allocation;
        // SAFETY: the allocation owns a box with a header.
        let header = unsafe { BoxHeader::at(allocation.cell()) };
        let meta = match meta {
            Some(meta) => Some(meta),
            None if header.type_meta().is_none() => {
                let offsets: Vec<usize> = entry
                    .offsets
                    .iter()
                    .copied()
                    .filter(|&offset| offset < object_size)
                    .collect();
                Some(self.types.publish(TypeKey::Named(name), || {
                    TypeMeta::self_describing(name, object_size, &offsets)
                }))
            }
            None => None,
        };
        let marking = self.is_marking();
        self.heap.commit(&allocation, meta, marking);
        if marking {
            // SAFETY: the box was just committed with its metadata.
            unsafe {
                box_meta::for_each_handle(allocation.cell(), |handle| {
                    self.remember(record, handle.load(Ordering::Acquire) as usize);
                });
            }
        }
    }

    /// Gives an unfinished construction back to the heap.
    pub(crate) fn abort(&self, record: &ThreadRecord, token: u64) {
        let entry = record.alloc_stack.lock().pop(token);
        self.heap.abort(entry.allocation);
    }

    /// Stores `value` into `dst`, recording it for the final marking pause
    /// if a concurrent cycle has not reached it yet.
    #[inline]
    pub(crate) fn write_barrier(&self, record: &ThreadRecord, dst: &Handle, value: *mut u8) {
        if self.is_marking() {
            self.remember(record, value as usize);
        }
        dst.store(value, Ordering::Release);
    }

    fn remember(&self, record: &ThreadRecord, addr: usize) {
        let Some(descriptor) = self.heap.index().expect_descriptor(addr) else {
            return;
        };
        let cell = descriptor.cell_start(addr);
        if !descriptor.get_mark(cell) {
            remset::remember(&record.store_buffer, &self.remembered, cell as usize);
        }
    }

    pub(crate) fn register_static_root(&self, handle: &'static Handle) {
        self.uninterrupted(|| self.static_roots.lock().insert(handle.slot_address()));
    }

    pub(crate) fn deregister_static_root(&self, handle: &'static Handle) {
        self.uninterrupted(|| self.static_roots.lock().remove(handle.slot_address()));
    }

    /// Runs `f` in a critical section of the calling thread, if it is
    /// registered, so it is not frozen while holding a collector lock.
    pub(crate) fn uninterrupted<R>(&self, f: impl FnOnce() -> R) -> R {
        let current = self.current();
        let _critical = current
            .as_deref()
            .map(|record| record.enter_critical(&self.registry));
        f()
    }

    pub(crate) fn bind_current(&self, record: &Arc<ThreadRecord>) {
        let key = self.key();
        CURRENT.with(|current| current.borrow_mut().push((key, Arc::clone(record))));
    }

    pub(crate) fn unbind_current(&self, record: &ThreadRecord) {
        let key = self.key();
        let _ = CURRENT.try_with(|current| {
            current
                .borrow_mut()
                .retain(|(owner, bound)| *owner != key || bound.id() != record.id());
        });
    }

    /// The calling thread's record in this collector, if it is registered.
    fn current(&self) -> Option<Arc<ThreadRecord>> {
        let key = self.key();
        CURRENT
            .try_with(|current| {
                current
                    .borrow()
                    .iter()
                    .find(|(owner, _)| *owner == key)
                    .map(|(_, record)| Arc::clone(record))
            })
            .ok()
            .flatten()
    }
}

/// Snapshot of a collector's configuration and state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcInfo {
    /// Which collector runs.
    pub collector: CollectorKind,
    /// How thread stacks are scanned.
    pub root_mode: RootMode,
    /// Whether chunks may be compacted.
    pub compacting: bool,
    /// Marking worker threads.
    pub workers: usize,
    /// Registered mutator threads.
    pub threads: usize,
    /// Whether a concurrent cycle is marking.
    pub marking: bool,
    /// Bytes mapped by the heap.
    pub heap_size: usize,
    /// Current soft heap limit.
    pub heap_limit: usize,
    /// Hard heap limit.
    pub max_heap_size: usize,
}

/// A garbage collector instance.
///
/// Cloning is cheap and yields another handle to the same heap.
///
/// # Examples
///
/// ```
/// use movgc::{Collector, GcConfig, GcOptions, ThreadInfo};
///
/// let gc = Collector::new(GcConfig::serial())?;
/// let mutator = gc.register_thread(ThreadInfo::current())?;
/// let root = mutator.alloc(42_u64)?;
/// gc.collect(GcOptions::full())?;
/// assert_eq!(unsafe { mutator.read::<u64>(root.handle()) }, 42);
/// # Ok::<(), movgc::GcError>(())
/// ```
#[derive(Clone)]
pub struct Collector {
    core: Arc<GcCore>,
}

impl Collector {
    /// Creates a collector.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::InvalidConfig`] when `config` is inconsistent.
    pub fn new(config: GcConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            core: Arc::new(GcCore::new(config)),
        })
    }

    /// Registers the calling thread as a mutator.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::ThreadAlreadyRegistered`] if the thread already
    /// has a mutator in this collector.
    pub fn register_thread(&self, info: ThreadInfo) -> Result<Mutator> {
        let record = self.core.registry.register(info, self.core.config.root_mode, self.core.heap.index())?;
        Ok(Mutator::new(Arc::clone(&self.core), record))
    }

    /// Runs a collection. From a registered thread the call is a safepoint.
    ///
    /// Returns `None` if `options` asked only to start marking.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::StopTheWorldDisabled`] if some thread stayed in an
    /// unsafe scope.
    pub fn collect(&self, options: GcOptions) -> Result<Option<GcRunStat>> {
        let current = self.core.current();
        self.core.collect(options, current.as_deref())
    }

    /// Stops every other registered thread until the snapshot is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::StopTheWorldDisabled`] if a thread is inside an
    /// unsafe scope.
    pub fn stop_the_world(&self) -> Result<WorldSnapshot<'_>> {
        let current = self.core.current();
        stop_the_world(&self.core.registry, current.as_deref())
    }

    /// Number of threads currently stopped.
    #[must_use]
    pub fn threads_suspended(&self) -> usize {
        self.core.registry.threads_suspended()
    }

    /// Cumulative statistics.
    #[must_use]
    pub fn stats(&self) -> GcStats {
        let counters = self.core.metrics.counters();
        let core = self.core.heap.core();
        self.core.uninterrupted(|| GcStats {
            gc_count: counters.total_collections(),
            total_gc_time: counters.total_pause(),
            heap_size: core.heap_size(),
            heap_limit: core.limit(),
        })
    }

    /// The most recent collection, if any.
    #[must_use]
    pub fn last_run(&self) -> Option<GcRunStat> {
        self.core.metrics.history().last()
    }

    /// Counters and recent history.
    #[must_use]
    pub fn metrics(&self) -> &GcMetrics {
        &self.core.metrics
    }

    /// Configuration and current state.
    #[must_use]
    pub fn info(&self) -> GcInfo {
        let core = self.core.heap.core();
        self.core.uninterrupted(|| GcInfo {
            collector: self.core.config.collector,
            root_mode: self.core.config.root_mode,
            compacting: self.core.config.compacting,
            workers: self.core.workers.threads(),
            threads: self.core.registry.len(),
            marking: self.core.is_marking(),
            heap_size: core.heap_size(),
            heap_limit: core.limit(),
            max_heap_size: core.max_limit(),
        })
    }

    /// Type metadata cache of this collector.
    #[must_use]
    pub fn types(&self) -> &TypeRegistry {
        &self.core.types
    }

    /// Adds a handle with static lifetime to the root set.
    ///
    /// # Panics
    ///
    /// Panics if the handle is already registered.
    pub fn register_static_root(&self, handle: &'static Handle) {
        self.core.register_static_root(handle);
    }

    /// Removes a handle added with
    /// [`register_static_root`](Self::register_static_root).
    ///
    /// # Panics
    ///
    /// Panics if the handle was never registered.
    pub fn deregister_static_root(&self, handle: &'static Handle) {
        self.core.deregister_static_root(handle);
    }

    /// Changes the hard heap limit.
    pub fn set_heap_limit(&self, max: usize) {
        self.core
            .uninterrupted(|| self.core.heap.core().set_max_limit(max));
    }

    /// Logs a heap summary after every collection.
    pub fn set_print_stats(&self, enabled: bool) {
        self.core.print_stats.store(enabled, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector").field("info", &self.info()).finish()
    }
}
