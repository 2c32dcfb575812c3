//! Pool chunks: one mapped slab of same-size cells.
//!
//! A chunk carries three bitmaps indexed by cell number. `mark` is set by
//! marker threads concurrently and is therefore atomic; `pin` and `init`
//! are only written by the owning mutator or with the world stopped, but
//! share the atomic representation so a chunk can be read from any thread.

use std::ops::Range;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use sys_alloc::Mmap;

use crate::bitmap::AtomicBitmap;
use crate::heap::box_meta::{self, BoxHeader, BOX_ALIGN};
use crate::heap::descriptor::LifetimeTag;
use crate::meta::TypeMeta;

/// Bytes mapped for each pool chunk.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// How a chunk was treated by the last collection that looked at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkPolicy {
    /// Live cells were slid towards the start of the chunk.
    Compact,
    /// Garbage was finalized in place.
    Sweep,
}

const POLICY_NONE: u8 = 0;
const POLICY_COMPACT: u8 = 1;
const POLICY_SWEEP: u8 = 2;

/// Per-chunk result of a sweep or compaction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChunkStat {
    /// Bytes of cells in use when the collection started.
    pub occupied: usize,
    /// Bytes of cells that survived.
    pub live: usize,
    /// Bytes of garbage finalized.
    pub freed: usize,
    /// Bytes moved by compaction.
    pub copied: usize,
    /// Surviving cells that were pinned.
    pub pinned: usize,
}

/// A slab of `cell_count` cells of `cell_size` bytes.
pub struct PoolChunk {
    memory: Mmap,
    cell_size: usize,
    cell_count: usize,
    mark: AtomicBitmap,
    pin: AtomicBitmap,
    init: AtomicBitmap,
    last_policy: AtomicU8,
    last_residency: AtomicU64,
}

impl PoolChunk {
    /// Lays out cells of `cell_size` over `memory`.
    ///
    /// # Panics
    ///
    /// Panics if `cell_size` is not a multiple of [`BOX_ALIGN`] or larger
    /// than the mapping.
    #[must_use]
    pub fn new(memory: Mmap, cell_size: usize) -> Self {
        assert!(
            cell_size >= BOX_ALIGN && cell_size % BOX_ALIGN == 0,
            "cell size {cell_size} is not a multiple of {BOX_ALIGN}"
        );
        let cell_count = memory.len() / cell_size;
        assert!(cell_count > 0, "chunk cannot hold a {cell_size} byte cell");
        Self {
            memory,
            cell_size,
            cell_count,
            mark: AtomicBitmap::new(cell_count),
            pin: AtomicBitmap::new(cell_count),
            init: AtomicBitmap::new(cell_count),
            last_policy: AtomicU8::new(POLICY_NONE),
            last_residency: AtomicU64::new(0),
        }
    }

    /// Address of the first cell.
    #[must_use]
    pub fn start(&self) -> *mut u8 {
        self.memory.ptr()
    }

    /// Mapped address range.
    #[must_use]
    pub fn range(&self) -> Range<usize> {
        self.memory.range()
    }

    /// Mapped bytes, including any tail too short for a cell.
    #[must_use]
    pub fn mapped_len(&self) -> usize {
        self.memory.len()
    }

    /// Size of every cell.
    #[must_use]
    pub const fn cell_size(&self) -> usize {
        self.cell_size
    }

    /// Number of cells.
    #[must_use]
    pub const fn cell_count(&self) -> usize {
        self.cell_count
    }

    /// Whether `addr` falls inside a cell of this chunk.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.start() as usize;
        addr >= start && addr < start + self.cell_count * self.cell_size
    }

    /// Index of the cell containing `addr`.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is outside the chunk's cells.
    #[must_use]
    pub fn cell_index(&self, addr: usize) -> usize {
        assert!(self.contains(addr), "address {addr:#x} is outside the chunk");
        (addr - self.start() as usize) / self.cell_size
    }

    /// Start of cell `index`.
    #[must_use]
    pub fn cell_at(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.cell_count);
        self.start().wrapping_add(index * self.cell_size)
    }

    /// Start of the cell containing `addr`.
    #[must_use]
    pub fn cell_of(&self, addr: usize) -> *mut u8 {
        self.cell_at(self.cell_index(addr))
    }

    // ------------------------------------------------------------------
    // Bits
    // ------------------------------------------------------------------

    /// Mark bit of cell `index`.
    #[must_use]
    pub fn get_mark(&self, index: usize) -> bool {
        self.mark.get(index)
    }

    /// Sets the mark bit of cell `index`, returning the previous value.
    pub fn set_mark(&self, index: usize) -> bool {
        self.mark.set(index)
    }

    /// Pin bit of cell `index`.
    #[must_use]
    pub fn get_pin(&self, index: usize) -> bool {
        self.pin.get(index)
    }

    /// Sets the pin bit of cell `index`, returning the previous value.
    pub fn set_pin(&self, index: usize) -> bool {
        self.pin.set(index)
    }

    /// Whether compaction may move cell `index`: LIVE, unpinned and of a
    /// movable type.
    #[must_use]
    pub fn is_movable(&self, index: usize) -> bool {
        self.lifetime_tag(index) == LifetimeTag::Live
            && !self.pin.get(index)
            // SAFETY: a LIVE cell holds an initialized header.
            && unsafe { BoxHeader::at(self.cell_at(index)) }.is_movable()
    }

    /// Init bit of cell `index`.
    #[must_use]
    pub fn is_init(&self, index: usize) -> bool {
        self.init.get(index)
    }

    /// Lifetime tag of cell `index`.
    #[must_use]
    pub fn lifetime_tag(&self, index: usize) -> LifetimeTag {
        LifetimeTag::from_bits(self.mark.get(index), self.init.get(index))
    }

    /// Number of marked cells.
    #[must_use]
    pub fn count_marked(&self) -> usize {
        self.mark.count()
    }

    /// Number of pinned cells.
    #[must_use]
    pub fn count_pinned(&self) -> usize {
        self.pin.count()
    }

    /// Whether marking reached nothing in this chunk.
    #[must_use]
    pub fn is_unused(&self) -> bool {
        self.mark.none()
    }

    /// Fraction of cells that are marked.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn residency(&self) -> f64 {
        self.count_marked() as f64 / self.cell_count as f64
    }

    // ------------------------------------------------------------------
    // Cell lifecycle
    // ------------------------------------------------------------------

    /// Zeroes cell `index` and writes a header for `count` objects.
    ///
    /// # Safety
    ///
    /// The cell must be free and handed to exactly one caller.
    pub unsafe fn init_cell(
        &self,
        index: usize,
        count: usize,
        meta: Option<&TypeMeta>,
    ) -> NonNull<u8> {
        let cell = self.cell_at(index);
        // SAFETY: the cell lies within the mapping and is owned by the caller.
        unsafe {
            ptr::write_bytes(cell, 0, self.cell_size);
            BoxHeader::create(cell, count, meta);
            NonNull::new_unchecked(cell)
        }
    }

    /// Marks cell `index` as constructed. While marking is in progress the
    /// cell is also marked so that objects born during marking survive it.
    pub fn commit(&self, index: usize, marking: bool) {
        if marking {
            self.mark.set(index);
        }
        self.init.set(index);
    }

    /// Returns an aborted, never committed cell to the FREE state.
    pub fn abort(&self, index: usize) {
        // SAFETY: an aborted cell holds no constructed objects.
        unsafe { BoxHeader::at(self.cell_at(index)) }.clear();
        self.init.reset(index);
        self.mark.reset(index);
        self.pin.reset(index);
    }

    /// Runs the destructors of cell `index` and turns it FREE.
    ///
    /// # Safety
    ///
    /// The cell must be GARBAGE: constructed and unreachable.
    pub unsafe fn finalize_cell(&self, index: usize) {
        debug_assert_eq!(self.lifetime_tag(index), LifetimeTag::Garbage);
        // SAFETY: caller contract.
        unsafe { box_meta::destroy(self.cell_at(index)) };
        self.init.reset(index);
    }

    /// Moves the box in cell `from` into the free cell `to`, leaving a
    /// forward pointer behind.
    ///
    /// # Safety
    ///
    /// `from` must be LIVE and unpinned; `to` must be FREE.
    ///
    /// # Panics
    ///
    /// Panics if the box's type cannot be moved; check
    /// [`PoolChunk::is_movable`] first.
    pub unsafe fn move_cell(&self, from: usize, to: usize) -> (NonNull<u8>, NonNull<u8>) {
        debug_assert_eq!(self.lifetime_tag(from), LifetimeTag::Live);
        debug_assert_eq!(self.lifetime_tag(to), LifetimeTag::Free);
        let src = self.cell_at(from);
        let dst = self.cell_at(to);
        // SAFETY: caller contract; distinct cells never overlap.
        unsafe { box_meta::relocate(src, dst, self.cell_size) };
        self.init.set(to);
        self.mark.set(to);

        // SAFETY: cells are never at address zero.
        let (src, dst) = unsafe { (NonNull::new_unchecked(src), NonNull::new_unchecked(dst)) };
        // SAFETY: the source cell still holds a (copied-away) header.
        unsafe { BoxHeader::at(src.as_ptr()) }.set_forward_pointer(dst);
        self.init.reset(from);
        self.mark.reset(from);
        (src, dst)
    }

    /// Finalizes every GARBAGE cell and pushes the address of every
    /// reclaimable cell onto `free`.
    ///
    /// # Safety
    ///
    /// Must run with the world stopped after marking completed.
    pub unsafe fn sweep(&self, free: &mut Vec<usize>) -> ChunkStat {
        let mut stat = ChunkStat::default();
        for index in 0..self.cell_count {
            match self.lifetime_tag(index) {
                LifetimeTag::Live | LifetimeTag::Allocated => {
                    stat.occupied += self.cell_size;
                    stat.live += self.cell_size;
                    if self.get_pin(index) {
                        stat.pinned += 1;
                    }
                }
                LifetimeTag::Garbage => {
                    stat.occupied += self.cell_size;
                    stat.freed += self.cell_size;
                    // SAFETY: caller contract; the tag says GARBAGE.
                    unsafe { self.finalize_cell(index) };
                    free.push(self.cell_at(index) as usize);
                }
                LifetimeTag::Free => free.push(self.cell_at(index) as usize),
            }
        }
        stat
    }

    /// Finalizes every constructed cell. Used when a chunk is released
    /// because nothing in it was reached.
    ///
    /// # Safety
    ///
    /// No cell of the chunk may be reachable.
    pub unsafe fn destroy_all(&self) -> ChunkStat {
        let mut stat = ChunkStat::default();
        for index in self.init.iter_ones().collect::<Vec<_>>() {
            stat.occupied += self.cell_size;
            stat.freed += self.cell_size;
            // SAFETY: caller contract.
            unsafe { self.finalize_cell(index) };
        }
        stat
    }

    /// Clears mark and pin bits for the next cycle.
    pub fn unmark(&self) {
        self.mark.clear();
        self.pin.clear();
    }

    /// Returns the pages past the last used cell to the OS. Returns the
    /// number of bytes given back.
    pub fn discard_free_tail(&self) -> usize {
        let used_end = (0..self.cell_count)
            .rev()
            .find(|&i| self.is_init(i) || self.get_mark(i))
            .map_or(0, |i| (i + 1) * self.cell_size);
        let page = sys_alloc::page_size();
        let offset = used_end.div_ceil(page) * page;
        if offset >= self.memory.len() {
            return 0;
        }
        let len = self.memory.len() - offset;
        match self.memory.discard(offset, len) {
            Ok(()) => len,
            Err(_err) => {
                crate::tracing::internal::log_discard_failed(self.start() as usize, len);
                0
            }
        }
    }

    // ------------------------------------------------------------------
    // Policy memory
    // ------------------------------------------------------------------

    /// Policy and residency recorded by the previous collection.
    #[must_use]
    pub fn last_policy(&self) -> Option<(ChunkPolicy, f64)> {
        let policy = match self.last_policy.load(Ordering::Relaxed) {
            POLICY_COMPACT => ChunkPolicy::Compact,
            POLICY_SWEEP => ChunkPolicy::Sweep,
            _ => return None,
        };
        let residency = f64::from_bits(self.last_residency.load(Ordering::Relaxed));
        Some((policy, residency))
    }

    /// Records the policy applied at `residency`.
    pub fn remember_policy(&self, policy: ChunkPolicy, residency: f64) {
        let raw = match policy {
            ChunkPolicy::Compact => POLICY_COMPACT,
            ChunkPolicy::Sweep => POLICY_SWEEP,
        };
        self.last_policy.store(raw, Ordering::Relaxed);
        self.last_residency
            .store(residency.to_bits(), Ordering::Relaxed);
    }

}

impl std::fmt::Debug for PoolChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolChunk")
            .field("start", &self.start())
            .field("cell_size", &self.cell_size)
            .field("cell_count", &self.cell_count)
            .field("marked", &self.count_marked())
            .finish_non_exhaustive()
    }
}

impl Drop for PoolChunk {
    fn drop(&mut self) {
        for index in self.init.iter_ones().collect::<Vec<_>>() {
            // SAFETY: the chunk is going away with its owner; nothing can
            // reach its boxes any more.
            unsafe { box_meta::destroy(self.cell_at(index)) };
        }
    }
}
