//! Remembered set for concurrent marking.
//!
//! While marking runs, the write barrier records every unmarked target it
//! stores. Records first go to the storing thread's sequential store buffer
//! and are flushed here when it fills. The final pause drains the set and
//! marks from it, catching edges the concurrent workers could not see.

use std::collections::HashSet;

use parking_lot::Mutex;

/// Entries a thread buffers before flushing.
pub const STORE_BUFFER_CAPACITY: usize = 128;

/// Shared set of remembered cells.
#[derive(Debug, Default)]
pub struct RememberedSet {
    cells: Mutex<HashSet<usize>>,
}

impl RememberedSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds every cell of a flushed store buffer.
    pub fn extend(&self, cells: impl IntoIterator<Item = usize>) {
        self.cells.lock().extend(cells);
    }

    /// Removes and returns every remembered cell.
    pub fn drain(&self) -> Vec<usize> {
        self.cells.lock().drain().collect()
    }

    /// Number of distinct cells remembered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.lock().len()
    }

    /// Whether nothing is remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.lock().is_empty()
    }
}

/// Appends `cell` to a store buffer, flushing it into `set` when full.
pub fn remember(buffer: &Mutex<Vec<usize>>, set: &RememberedSet, cell: usize) {
    let flushed = {
        let mut buffer = buffer.lock();
        buffer.push(cell);
        if buffer.len() < STORE_BUFFER_CAPACITY {
            return;
        }
        std::mem::take(&mut *buffer)
    };
    set.extend(flushed);
}

/// Moves whatever `buffer` holds into `set`.
pub fn flush(buffer: &Mutex<Vec<usize>>, set: &RememberedSet) -> usize {
    let flushed = std::mem::take(&mut *buffer.lock());
    let count = flushed.len();
    set.extend(flushed);
    count
}
