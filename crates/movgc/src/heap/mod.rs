//! The collected heap.
//!
//! Small boxes live in size-class pools of mapped chunks, large boxes in
//! one mapping each. Every mapping is registered in the [`MemoryIndex`] so
//! that any handle value can be resolved back to the descriptor holding its
//! box's liveness bits.
//!
//! # Collection
//!
//! [`Heap::collect`] runs with the world stopped and marking complete:
//!
//! 1. Chunks marking did not reach are released. Every other chunk is
//!    compacted or swept according to its residency, in parallel.
//! 2. If anything moved, every committed box, every large object and
//!    (through the caller's hook) every root is rewritten.
//! 3. Mark and pin bits are cleared for the next cycle.
//! 4. The soft heap limit is adjusted to the cycle's yield.

pub mod box_meta;
pub mod chunk;
pub mod core;
pub mod descriptor;
pub mod index;
pub mod large;
pub mod pool;

use std::ptr::NonNull;

use parking_lot::{Mutex, MutexGuard};

use crate::compact::{compact, Forwarding};
use crate::config::GcConfig;
use crate::error::{GcError, Result};
use crate::gc::sync::{LockGuard, LockOrder};
use crate::gc::thread_pool::StaticThreadPool;
use crate::metrics::{HeapStat, PhaseTimer};
use crate::meta::TypeMeta;
use crate::tracing::internal::{log_phase_end, trace_phase, GcPhase};

use self::box_meta::{box_size, object_start, BoxHeader, HEADER_SIZE};
use self::chunk::{ChunkPolicy, ChunkStat, PoolChunk};
use self::core::CoreAllocator;
use self::descriptor::Descriptor;
use self::index::MemoryIndex;
use self::large::{LargeObject, LargeObjectAllocator};
use self::pool::{class_index, PoolAllocator, PoolCell, ResidencyPolicy, MAX_SMALL_BOX, SIZE_CLASSES};

/// Smallest box: a header plus room for a forward pointer.
const MIN_BOX: usize = HEADER_SIZE + std::mem::size_of::<usize>();

/// A reserved, not yet committed box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    /// A pool cell.
    Pool {
        /// Size class index.
        class: usize,
        /// The cell.
        cell: PoolCell,
    },
    /// A large object.
    Large(NonNull<LargeObject>),
}

impl Allocation {
    /// Start of the box.
    #[must_use]
    pub fn cell(&self) -> *mut u8 {
        match self {
            // SAFETY: a live allocation keeps its chunk alive.
            Self::Pool { cell, .. } => unsafe { cell.chunk.as_ref() }.cell_at(cell.index),
            // SAFETY: as above.
            Self::Large(object) => unsafe { object.as_ref() }.cell(),
        }
    }

    /// Start of the first object.
    #[must_use]
    pub fn object(&self) -> *mut u8 {
        object_start(self.cell())
    }

    /// Size of the cell backing the box.
    #[must_use]
    pub fn cell_size(&self) -> usize {
        self.descriptor().cell_size()
    }

    /// Descriptor owning the box's bits.
    #[must_use]
    pub fn descriptor(&self) -> Descriptor<'_> {
        match self {
            // SAFETY: see `cell`.
            Self::Pool { cell, .. } => Descriptor::Pool(unsafe { cell.chunk.as_ref() }),
            // SAFETY: see `cell`.
            Self::Large(object) => Descriptor::Large(unsafe { object.as_ref() }),
        }
    }
}

// SAFETY: an allocation only names its chunk or large object, both of which
// stay mapped while the box is in flight because tracing marks it.
unsafe impl Send for Allocation {}
// SAFETY: as above; shared access only reads the descriptor.
unsafe impl Sync for Allocation {}

struct ChunkOutcome {
    class: usize,
    stat: ChunkStat,
    forwarding: Forwarding,
    free: Vec<usize>,
}

/// Size-class pools, the large-object allocator and their index.
pub struct Heap {
    classes: [Mutex<PoolAllocator>; SIZE_CLASSES.len()],
    large: LargeObjectAllocator,
    core: CoreAllocator,
    index: MemoryIndex,
    policy: ResidencyPolicy,
}

impl Heap {
    /// Creates an empty heap.
    #[must_use]
    pub fn new(config: &GcConfig) -> Self {
        Self {
            classes: SIZE_CLASSES.map(|size| Mutex::new(PoolAllocator::new(size))),
            large: LargeObjectAllocator::new(),
            core: CoreAllocator::new(config),
            index: MemoryIndex::new(),
            policy: ResidencyPolicy::from_config(config),
        }
    }

    /// Address index covering the heap.
    #[must_use]
    pub const fn index(&self) -> &MemoryIndex {
        &self.index
    }

    /// Heap accounting.
    #[must_use]
    pub const fn core(&self) -> &CoreAllocator {
        &self.core
    }

    /// Reserves a box for `count` objects of `object_size` bytes, routing
    /// by box size.
    ///
    /// Returns `Ok(None)` when the heap may not grow; the caller decides
    /// whether to collect or expand.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::OutOfMemory`] if the size overflows and
    /// propagates mapping failures.
    pub fn allocate(
        &self,
        object_size: usize,
        count: usize,
        meta: Option<&TypeMeta>,
    ) -> Result<Option<Allocation>> {
        let size = request_size(object_size, count)?;
        if size > MAX_SMALL_BOX {
            let object = self
                .large
                .allocate(size, count, meta, &self.core, &self.index)?;
            return Ok(object.map(Allocation::Large));
        }
        self.allocate_small(object_size, count, meta)
    }

    /// Reserves a box in a size-class pool.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::ObjectTooLarge`] when no size class fits.
    pub fn allocate_small(
        &self,
        object_size: usize,
        count: usize,
        meta: Option<&TypeMeta>,
    ) -> Result<Option<Allocation>> {
        let size = request_size(object_size, count)?;
        let class = class_index(size).ok_or(GcError::ObjectTooLarge { size })?;
        let _guard = LockGuard::new(LockOrder::Heap);
        let mut pool = self.classes[class].lock();
        let cell = pool.allocate(count, meta, &self.core, &self.index)?;
        Ok(cell.map(|cell| Allocation::Pool { class, cell }))
    }

    /// Finishes construction: installs `meta` if given and sets the init
    /// bit, plus the mark bit while marking is in progress.
    pub fn commit(&self, allocation: &Allocation, meta: Option<&TypeMeta>, marking: bool) {
        if let Some(meta) = meta {
            // SAFETY: the allocation owns a box with a header.
            unsafe { BoxHeader::at(allocation.cell()) }.set_type_meta(meta);
        }
        match allocation {
            // SAFETY: the allocation keeps its chunk alive.
            Allocation::Pool { cell, .. } => unsafe { cell.chunk.as_ref() }.commit(cell.index, marking),
            // SAFETY: as above.
            Allocation::Large(object) => unsafe { object.as_ref() }.commit(marking),
        }
    }

    /// Returns an uncommitted box to its allocator.
    pub fn abort(&self, allocation: Allocation) {
        match allocation {
            Allocation::Pool { class, cell } => {
                let _guard = LockGuard::new(LockOrder::Heap);
                self.classes[class].lock().abort(cell);
            }
            Allocation::Large(object) => self.large.abort(object, &self.core, &self.index),
        }
    }

    /// Sweeps or compacts the whole heap.
    ///
    /// `timer` must be running; the fix-up phase is charged to its `fix`
    /// bucket and everything else to `collect`. `fix_roots` is called with the forwarding table when anything moved
    /// and must rewrite every handle outside the heap. `full` ignores the
    /// residency hysteresis and gives the free tail of compacted chunks back
    /// to the OS.
    ///
    /// # Safety
    ///
    /// Must run with the world stopped after marking completed.
    pub unsafe fn collect<F>(
        &self,
        full: bool,
        workers: &StaticThreadPool,
        timer: &mut PhaseTimer,
        fix_roots: F,
    ) -> HeapStat
    where
        F: FnOnce(&Forwarding, &MemoryIndex) -> usize,
    {
        let mut stat = HeapStat {
            mem_before_gc: self.core.heap_size(),
            ..HeapStat::default()
        };
        let _guards: Vec<LockGuard> = (0..self.classes.len())
            .map(|_| LockGuard::new(LockOrder::Heap))
            .collect();
        let mut classes: Vec<MutexGuard<'_, PoolAllocator>> =
            self.classes.iter().map(Mutex::lock).collect();

        let forwarding = {
            let _span = trace_phase(GcPhase::Compact);
            for pool in &mut classes {
                // SAFETY: caller contract.
                let (shrunk, released) = unsafe { pool.shrink(&self.core, &self.index) };
                stat += shrunk;
                stat.mem_released += released;
            }

            let tasks: Vec<_> = classes
                .iter()
                .enumerate()
                .flat_map(|(class, pool)| pool.plan(class, &self.policy, full))
                .collect();
            let outcomes = workers.run(tasks, |task| {
                let mut forwarding = Forwarding::new();
                let mut free = Vec::new();
                let stat = match task.policy {
                    // SAFETY: caller contract; one task per chunk.
                    ChunkPolicy::Compact => unsafe { compact(task.chunk, &mut forwarding, &mut free) },
                    // SAFETY: as above.
                    ChunkPolicy::Sweep => unsafe { task.chunk.sweep(&mut free) },
                };
                ChunkOutcome {
                    class: task.class,
                    stat,
                    forwarding,
                    free,
                }
            });

            let mut forwarding = Forwarding::new();
            let mut free = vec![Vec::new(); classes.len()];
            for outcome in outcomes {
                stat += outcome.stat;
                forwarding.append(outcome.forwarding);
                free[outcome.class].extend(outcome.free);
            }
            for (pool, cells) in classes.iter_mut().zip(free) {
                pool.install_free(cells);
            }

            // SAFETY: caller contract.
            let (large, released) = unsafe { self.large.collect(&self.core, &self.index) };
            stat += large;
            stat.mem_released += released;
            log_phase_end(GcPhase::Compact, stat.mem_copied);
            log_phase_end(GcPhase::Sweep, stat.mem_freed);
            forwarding
        };

        if stat.mem_copied > 0 {
            timer.end_collect();
            timer.start();
            let _span = trace_phase(GcPhase::Fix);
            let index = &self.index;
            let forwarding = &forwarding;
            let chunks: Vec<&PoolChunk> = classes.iter().flat_map(|pool| pool.chunks()).collect();
            // SAFETY: caller contract; chunks are fixed independently.
            let mut fixed: usize = workers
                .run(chunks, |chunk| unsafe { PoolAllocator::fix_chunk(chunk, forwarding, index) })
                .into_iter()
                .sum();
            // SAFETY: caller contract.
            fixed += unsafe { self.large.fix(forwarding, index) };
            fixed += fix_roots(forwarding, index);
            log_phase_end(GcPhase::Fix, fixed);
            timer.end_fix();
            timer.start();
        }

        if full {
            for chunk in classes.iter().flat_map(|pool| pool.chunks()) {
                if matches!(chunk.last_policy(), Some((ChunkPolicy::Compact, _))) {
                    stat.mem_released += chunk.discard_free_tail();
                }
            }
        }

        {
            let _span = trace_phase(GcPhase::Finalize);
            for pool in &classes {
                pool.finalize();
            }
            self.large.finalize();
        }
        drop(classes);

        self.core.adapt(&stat);
        stat
    }

    /// Number of chunks and large objects, for diagnostics.
    #[must_use]
    pub fn block_count(&self) -> (usize, usize) {
        let chunks = self
            .classes
            .iter()
            .map(|class| {
                let _guard = LockGuard::new(LockOrder::Heap);
                class.lock().chunks().count()
            })
            .sum();
        (chunks, self.large.len())
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("core", &self.core)
            .field("blocks", &self.block_count())
            .finish_non_exhaustive()
    }
}

/// Box size of a request, header included.
///
/// # Errors
///
/// Returns [`GcError::OutOfMemory`] when the size overflows.
pub fn request_size(object_size: usize, count: usize) -> Result<usize> {
    box_size(object_size, count)
        .map(|size| size.max(MIN_BOX))
        .ok_or(GcError::OutOfMemory {
            requested: usize::MAX,
        })
}

/// Bytes the heap must be allowed to map to serve a box of `box_size`.
#[must_use]
pub const fn mapping_size(box_size: usize) -> usize {
    if box_size > MAX_SMALL_BOX {
        box_size + large::DESCRIPTOR_SIZE
    } else {
        chunk::CHUNK_SIZE
    }
}
