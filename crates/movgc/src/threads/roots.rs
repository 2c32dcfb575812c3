//! Precise roots and objects under construction.

use std::collections::HashMap;

use crate::handle::Handle;
use crate::heap::Allocation;

/// Explicitly registered root handles.
///
/// Insertion and removal are O(1): slots live in a dense vector and a map
/// remembers each slot's position so removal can `swap_remove`.
#[derive(Debug, Default)]
pub struct RootSet {
    slots: Vec<usize>,
    positions: HashMap<usize, usize>,
}

impl RootSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handle slot at `addr`.
    ///
    /// # Panics
    ///
    /// Panics if the slot is already registered.
    pub fn insert(&mut self, addr: usize) {
        let position = self.slots.len();
        let previous = self.positions.insert(addr, position);
        assert!(previous.is_none(), "root handle {addr:#x} registered twice");
        self.slots.push(addr);
    }

    /// Deregisters the handle slot at `addr`.
    ///
    /// # Panics
    ///
    /// Panics if the slot was never registered.
    pub fn remove(&mut self, addr: usize) {
        let Some(position) = self.positions.remove(&addr) else {
            panic!("root handle {addr:#x} was never registered");
        };
        self.slots.swap_remove(position);
        if let Some(&moved) = self.slots.get(position) {
            self.positions.insert(moved, position);
        }
    }

    /// Whether `addr` is registered.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.positions.contains_key(&addr)
    }

    /// Number of roots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Registered slot addresses, in no particular order.
    pub fn slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots.iter().copied()
    }

    /// Every registered handle.
    ///
    /// # Safety
    ///
    /// Every registered slot must still hold a live handle. Registration
    /// contracts guarantee this while the owner is stopped.
    pub unsafe fn handles(&self) -> impl Iterator<Item = &Handle> + '_ {
        // SAFETY: caller contract.
        self.slots.iter().map(|&addr| unsafe { Handle::from_slot(addr) })
    }
}

/// A box reserved but not yet committed.
///
/// Its handle fields are only known as far as the constructor has written
/// them, so the offsets are recorded as it goes.
#[derive(Debug)]
pub struct InFlight {
    /// Token of the owning construction scope.
    pub token: u64,
    /// The reserved box.
    pub allocation: Allocation,
    /// Handle offsets written so far, relative to the first object.
    pub offsets: Vec<usize>,
}

/// Per-thread stack of constructions in progress.
///
/// Constructions nest: an object's constructor may allocate more objects
/// before it commits. Entries normally leave in LIFO order; a scope dropped
/// out of order is removed by token.
#[derive(Debug, Default)]
pub struct AllocStack {
    entries: Vec<InFlight>,
    next_token: u64,
}

impl AllocStack {
    /// Creates an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a new construction and returns its token.
    pub fn push(&mut self, allocation: Allocation) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        self.entries.push(InFlight {
            token,
            allocation,
            offsets: Vec::new(),
        });
        token
    }

    /// Records a handle written at `offset` by construction `token`.
    ///
    /// # Panics
    ///
    /// Panics if `token` is not in progress.
    pub fn record(&mut self, token: u64, offset: usize) {
        let entry = self.entry_mut(token);
        if !entry.offsets.contains(&offset) {
            entry.offsets.push(offset);
        }
    }

    /// Removes construction `token`.
    ///
    /// # Panics
    ///
    /// Panics if `token` is not in progress.
    pub fn pop(&mut self, token: u64) -> InFlight {
        if self.entries.last().is_some_and(|entry| entry.token == token) {
            if let Some(entry) = self.entries.pop() {
                return entry;
            }
        }
        let position = self
            .entries
            .iter()
            .position(|entry| entry.token == token)
            .unwrap_or_else(|| panic!("construction {token} is not in progress"));
        self.entries.remove(position)
    }

    /// Constructions in progress, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &InFlight> + '_ {
        self.entries.iter()
    }

    /// Number of constructions in progress.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no construction is in progress.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry_mut(&mut self, token: u64) -> &mut InFlight {
        self.entries
            .iter_mut()
            .rev()
            .find(|entry| entry.token == token)
            .unwrap_or_else(|| panic!("construction {token} is not in progress"))
    }
}
