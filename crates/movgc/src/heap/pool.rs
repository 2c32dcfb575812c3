//! Size-class pools.
//!
//! Small boxes are served from chunks of equal-size cells, one
//! [`PoolAllocator`] per size class. Allocation bumps through the newest
//! chunk, then reuses cells reclaimed by the last collection, then maps a
//! fresh chunk. Collection releases unreached chunks and compacts or sweeps
//! the rest according to their residency.

use std::ptr::NonNull;

use sys_alloc::round_to_granularity;

use crate::compact::{fix_box, Forwarding};
use crate::config::GcConfig;
use crate::error::Result;
use crate::heap::chunk::{ChunkPolicy, ChunkStat, PoolChunk, CHUNK_SIZE};
use crate::heap::core::CoreAllocator;
use crate::heap::index::{IndexEntry, MemoryIndex};
use crate::meta::TypeMeta;

// ============================================================================
// Size classes
// ============================================================================

/// Cell sizes of the small-object pools.
pub const SIZE_CLASSES: [usize; 8] = [32, 64, 128, 256, 512, 1024, 2048, 4096];

/// Boxes larger than this go to the large-object allocator.
pub const MAX_SMALL_BOX: usize = SIZE_CLASSES[SIZE_CLASSES.len() - 1];

/// Index of the smallest class holding a box of `box_size` bytes.
#[must_use]
pub const fn class_index(box_size: usize) -> Option<usize> {
    let mut i = 0;
    while i < SIZE_CLASSES.len() {
        if box_size <= SIZE_CLASSES[i] {
            return Some(i);
        }
        i += 1;
    }
    None
}

// ============================================================================
// Residency policy
// ============================================================================

/// Chooses between compaction and sweeping for each chunk.
///
/// Below `compact_below` a chunk is compacted, above `sweep_above` it is
/// swept. In between it keeps last cycle's choice unless its residency
/// drifted by more than `epsilon`, in which case the band's midpoint
/// decides.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResidencyPolicy {
    compacting: bool,
    compact_below: f64,
    sweep_above: f64,
    epsilon: f64,
}

impl ResidencyPolicy {
    /// Thresholds from the collector configuration.
    #[must_use]
    pub fn from_config(config: &GcConfig) -> Self {
        Self {
            compacting: config.compacting,
            compact_below: config.compacting_residency,
            sweep_above: config.non_compacting_residency,
            epsilon: config.residency_epsilon,
        }
    }

    /// Policy for a chunk at `residency`. A full collection ignores the
    /// previous choice and compacts everything not above `sweep_above`.
    #[must_use]
    pub fn choose(
        &self,
        residency: f64,
        previous: Option<(ChunkPolicy, f64)>,
        full: bool,
    ) -> ChunkPolicy {
        if !self.compacting || residency > self.sweep_above {
            return ChunkPolicy::Sweep;
        }
        if residency < self.compact_below || full {
            return ChunkPolicy::Compact;
        }
        match previous {
            Some((policy, last)) if (residency - last).abs() <= self.epsilon => policy,
            _ if residency < (self.compact_below + self.sweep_above) / 2.0 => ChunkPolicy::Compact,
            _ => ChunkPolicy::Sweep,
        }
    }
}

// ============================================================================
// PoolAllocator
// ============================================================================

/// Cell handed out by a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolCell {
    /// Owning chunk.
    pub chunk: NonNull<PoolChunk>,
    /// Cell number within the chunk.
    pub index: usize,
}

/// Work item for one chunk of a collection.
#[derive(Debug, Clone, Copy)]
pub struct ChunkTask<'a> {
    /// Size class the chunk belongs to.
    pub class: usize,
    /// The chunk.
    pub chunk: &'a PoolChunk,
    /// What to do with it.
    pub policy: ChunkPolicy,
}

/// Allocator of one size class.
#[derive(Debug)]
pub struct PoolAllocator {
    cell_size: usize,
    chunks: Vec<Box<PoolChunk>>,
    bump: Option<(usize, usize)>,
    free: Vec<usize>,
}

impl PoolAllocator {
    /// Creates an empty pool for cells of `cell_size` bytes.
    #[must_use]
    pub const fn new(cell_size: usize) -> Self {
        Self {
            cell_size,
            chunks: Vec::new(),
            bump: None,
            free: Vec::new(),
        }
    }

    /// Cell size of this class.
    #[must_use]
    pub const fn cell_size(&self) -> usize {
        self.cell_size
    }

    /// Chunks currently owned.
    pub fn chunks(&self) -> impl Iterator<Item = &PoolChunk> + '_ {
        self.chunks.iter().map(|chunk| &**chunk)
    }

    /// Number of reclaimed cells waiting for reuse.
    #[must_use]
    pub fn free_cells(&self) -> usize {
        self.free.len()
    }

    /// Reserves a zeroed cell and writes a header for `count` objects.
    ///
    /// Returns `Ok(None)` when a new chunk is needed but the core
    /// allocator refuses to map one.
    ///
    /// # Errors
    ///
    /// Propagates mapping failures.
    pub fn allocate(
        &mut self,
        count: usize,
        meta: Option<&TypeMeta>,
        core: &CoreAllocator,
        index: &MemoryIndex,
    ) -> Result<Option<PoolCell>> {
        let Some(cell) = self.take_cell(core, index)? else {
            return Ok(None);
        };
        // SAFETY: the cell was just taken out of the pool, so it is FREE and
        // exclusively ours.
        unsafe { cell.chunk.as_ref().init_cell(cell.index, count, meta) };
        Ok(Some(cell))
    }

    fn take_cell(&mut self, core: &CoreAllocator, index: &MemoryIndex) -> Result<Option<PoolCell>> {
        if let Some((chunk, next)) = self.bump {
            let owner = &self.chunks[chunk];
            if next < owner.cell_count() {
                self.bump = Some((chunk, next + 1));
                return Ok(Some(PoolCell {
                    chunk: NonNull::from(&**owner),
                    index: next,
                }));
            }
            self.bump = None;
        }

        if let Some(addr) = self.free.pop() {
            let Some(IndexEntry::Pool(chunk)) = index.lookup(addr) else {
                panic!("free cell {addr:#x} is not owned by a pool chunk");
            };
            // SAFETY: indexed chunks are alive.
            let cell_index = unsafe { chunk.as_ref() }.cell_index(addr);
            return Ok(Some(PoolCell {
                chunk,
                index: cell_index,
            }));
        }

        let Some(memory) = core.map(round_to_granularity(CHUNK_SIZE))? else {
            return Ok(None);
        };
        let chunk = Box::new(PoolChunk::new(memory, self.cell_size));
        let owner = NonNull::from(&*chunk);
        index.add(chunk.range(), IndexEntry::Pool(owner));
        self.chunks.push(chunk);
        self.bump = Some((self.chunks.len() - 1, 1));
        Ok(Some(PoolCell {
            chunk: owner,
            index: 0,
        }))
    }

    /// Puts back a cell whose construction was abandoned.
    pub fn abort(&mut self, cell: PoolCell) {
        // SAFETY: the chunk is owned by this pool.
        let chunk = unsafe { cell.chunk.as_ref() };
        chunk.abort(cell.index);
        self.free.push(chunk.cell_at(cell.index) as usize);
    }

    /// Releases every chunk marking did not reach. Returns what was
    /// finalized and the number of bytes unmapped.
    ///
    /// # Safety
    ///
    /// Must run with the world stopped after marking completed.
    pub unsafe fn shrink(&mut self, core: &CoreAllocator, index: &MemoryIndex) -> (ChunkStat, usize) {
        let mut stat = ChunkStat::default();
        let mut released = 0;
        self.chunks.retain(|chunk| {
            if !chunk.is_unused() {
                return true;
            }
            // SAFETY: nothing in an unmarked chunk is reachable.
            let freed = unsafe { chunk.destroy_all() };
            stat.occupied += freed.occupied;
            stat.freed += freed.freed;
            index.remove(chunk.range());
            core.release(chunk.mapped_len());
            released += chunk.mapped_len();
            false
        });
        self.bump = None;
        self.free.clear();
        (stat, released)
    }

    /// Decides what to do with every remaining chunk.
    pub fn plan(&self, class: usize, policy: &ResidencyPolicy, full: bool) -> Vec<ChunkTask<'_>> {
        self.chunks()
            .map(|chunk| {
                let residency = chunk.residency();
                let choice = policy.choose(residency, chunk.last_policy(), full);
                chunk.remember_policy(choice, residency);
                ChunkTask {
                    class,
                    chunk,
                    policy: choice,
                }
            })
            .collect()
    }

    /// Installs the cells reclaimed by a collection. Bump allocation stops;
    /// the untouched tail of the newest chunk is part of `free`.
    pub fn install_free(&mut self, mut free: Vec<usize>) {
        // Hand out low addresses first.
        free.sort_unstable_by(|a, b| b.cmp(a));
        self.free = free;
        self.bump = None;
    }

    /// Rewrites handles inside every committed box of `chunk`.
    ///
    /// # Safety
    ///
    /// Must run with the world stopped, after sweeping and compaction.
    pub unsafe fn fix_chunk(chunk: &PoolChunk, forwarding: &Forwarding, index: &MemoryIndex) -> usize {
        (0..chunk.cell_count())
            .filter(|&i| chunk.is_init(i))
            // SAFETY: committed cell, world stopped.
            .map(|i| unsafe { fix_box(chunk.cell_at(i), forwarding, index) })
            .sum()
    }

    /// Clears mark and pin bits of every chunk.
    pub fn finalize(&self) {
        for chunk in &self.chunks {
            chunk.unmark();
        }
    }
}
