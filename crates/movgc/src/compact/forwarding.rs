//! Old cell → new cell table built by compaction.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use crate::handle::Handle;
use crate::heap::box_meta::BoxHeader;
use crate::heap::descriptor::Descriptor;
use crate::heap::index::MemoryIndex;

/// Moves recorded during one collection, in the order they happened.
///
/// Keys are cell starts. A cell that received an object is never also a
/// source in the same cycle, so rewriting a handle twice changes nothing
/// the second time.
#[derive(Debug, Default)]
pub struct Forwarding {
    moves: Vec<(usize, usize)>,
    lookup: HashMap<usize, usize>,
}

impl Forwarding {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that the box at `from` now lives at `to`.
    pub fn record(&mut self, from: NonNull<u8>, to: NonNull<u8>) {
        let (from, to) = (from.as_ptr() as usize, to.as_ptr() as usize);
        debug_assert_ne!(from, to);
        self.moves.push((from, to));
        self.lookup.insert(from, to);
    }

    /// Appends the moves of another table, as produced by a parallel
    /// compaction task.
    pub fn append(&mut self, other: Self) {
        self.lookup.extend(other.lookup);
        self.moves.extend(other.moves);
    }

    /// Number of moves.
    #[must_use]
    pub fn len(&self) -> usize {
        self.moves.len()
    }

    /// Whether nothing moved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    /// Moves in recording order, as `(old_cell, new_cell)`.
    #[must_use]
    pub fn moves(&self) -> &[(usize, usize)] {
        &self.moves
    }

    /// New location of the cell starting at `cell`, if it moved.
    #[must_use]
    pub fn forward_cell(&self, cell: usize) -> Option<usize> {
        self.lookup.get(&cell).copied()
    }

    /// Where `addr`, possibly interior to a box, points after compaction.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is neither null nor owned by the heap.
    #[must_use]
    pub fn forward(&self, addr: usize, index: &MemoryIndex) -> usize {
        if self.lookup.is_empty() {
            return addr;
        }
        match index.expect_descriptor(addr) {
            Some(descriptor @ Descriptor::Pool(_)) => {
                let cell = descriptor.cell_start(addr) as usize;
                match self.lookup.get(&cell) {
                    Some(&to) => {
                        debug_assert!(
                            // SAFETY: the old cell keeps its forwarding header
                            // until the next allocation, which cannot happen
                            // while the world is stopped.
                            unsafe { BoxHeader::at(cell as *mut u8) }.is_forwarded(),
                            "moved cell {cell:#x} has no forward pointer"
                        );
                        to + (addr - cell)
                    }
                    None => addr,
                }
            }
            _ => addr,
        }
    }

    /// Rewrites `handle` if its target moved. Returns whether it changed.
    pub fn fix_handle(&self, handle: &Handle, index: &MemoryIndex) -> bool {
        let value = handle.load(Ordering::Relaxed) as usize;
        if value == 0 {
            return false;
        }
        let forwarded = self.forward(value, index);
        if forwarded == value {
            return false;
        }
        handle.store(forwarded as *mut u8, Ordering::Relaxed);
        true
    }
}
