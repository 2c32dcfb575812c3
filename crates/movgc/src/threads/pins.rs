//! Per-thread pins: objects compaction must leave in place.
//!
//! Scoped pins go on a small fixed-depth [`PinStack`] and are released in
//! strict LIFO order. When the stack is full, or a pin is taken or released
//! out of order, the [`PinSet`] multiset takes over.

use std::collections::HashMap;

/// Depth of the LIFO fast path.
pub const PIN_STACK_DEPTH: usize = 64;

/// Fixed-depth LIFO of pinned addresses.
#[derive(Debug)]
pub struct PinStack {
    entries: [usize; PIN_STACK_DEPTH],
    len: usize,
}

impl PinStack {
    /// Creates an empty stack.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [0; PIN_STACK_DEPTH],
            len: 0,
        }
    }

    /// Pushes `addr`, returning `false` if the stack is full.
    pub fn push(&mut self, addr: usize) -> bool {
        if self.len == PIN_STACK_DEPTH {
            return false;
        }
        self.entries[self.len] = addr;
        self.len += 1;
        true
    }

    /// Pops the top entry if it is `addr`.
    pub fn pop_if(&mut self, addr: usize) -> bool {
        if self.len > 0 && self.entries[self.len - 1] == addr {
            self.len -= 1;
            true
        } else {
            false
        }
    }

    /// Pinned addresses, bottom first.
    #[must_use]
    pub fn as_slice(&self) -> &[usize] {
        &self.entries[..self.len]
    }

    /// Number of entries.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the stack is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for PinStack {
    fn default() -> Self {
        Self::new()
    }
}

/// Unordered multiset of pinned addresses.
#[derive(Debug, Default)]
pub struct PinSet {
    counts: HashMap<usize, usize>,
    len: usize,
}

impl PinSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one pin on `addr`.
    pub fn insert(&mut self, addr: usize) {
        *self.counts.entry(addr).or_insert(0) += 1;
        self.len += 1;
    }

    /// Removes one pin on `addr`, returning whether there was one.
    pub fn remove(&mut self, addr: usize) -> bool {
        let Some(count) = self.counts.get_mut(&addr) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            self.counts.remove(&addr);
        }
        self.len -= 1;
        true
    }

    /// Distinct pinned addresses.
    pub fn addresses(&self) -> impl Iterator<Item = usize> + '_ {
        self.counts.keys().copied()
    }

    /// Number of pins, counting repeats.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether no pin is held.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// All pins held by one thread.
#[derive(Debug, Default)]
pub struct Pins {
    stack: PinStack,
    set: PinSet,
}

impl Pins {
    /// Creates an empty pin table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins `addr` on the LIFO fast path, overflowing into the set.
    pub fn push(&mut self, addr: usize) {
        if !self.stack.push(addr) {
            self.set.insert(addr);
        }
    }

    /// Releases a pin taken with [`push`](Self::push).
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not pinned.
    pub fn pop(&mut self, addr: usize) {
        if !self.stack.pop_if(addr) {
            self.remove(addr);
        }
    }

    /// Pins `addr` without ordering constraints.
    pub fn insert(&mut self, addr: usize) {
        self.set.insert(addr);
    }

    /// Releases a pin taken with [`insert`](Self::insert).
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not pinned.
    pub fn remove(&mut self, addr: usize) {
        if self.set.remove(addr) {
            return;
        }
        // A stack pin released out of order: drop it from the middle.
        let entries = self.stack.as_slice();
        let Some(position) = entries.iter().rposition(|&pinned| pinned == addr) else {
            panic!("address {addr:#x} is not pinned");
        };
        let mut kept: Vec<usize> = entries.to_vec();
        kept.remove(position);
        self.stack = PinStack::new();
        for pinned in kept {
            self.stack.push(pinned);
        }
    }

    /// Every pinned address, possibly repeated.
    pub fn addresses(&self) -> impl Iterator<Item = usize> + '_ {
        self.stack.as_slice().iter().copied().chain(self.set.addresses())
    }

    /// Number of pins held.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.stack.len() + self.set.len()
    }

    /// Whether no pin is held.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_is_lifo() {
        let mut pins = Pins::new();
        pins.push(0x10);
        pins.push(0x20);
        pins.pop(0x20);
        pins.pop(0x10);
        assert!(pins.is_empty());
    }

    #[test]
    fn test_overflow_goes_to_set() {
        let mut pins = Pins::new();
        for i in 0..PIN_STACK_DEPTH + 3 {
            pins.push(0x1000 + i * 16);
        }
        assert_eq!(pins.stack.len(), PIN_STACK_DEPTH);
        assert_eq!(pins.set.len(), 3);
        for i in (0..PIN_STACK_DEPTH + 3).rev() {
            pins.pop(0x1000 + i * 16);
        }
        assert!(pins.is_empty());
    }

    #[test]
    fn test_out_of_order_release() {
        let mut pins = Pins::new();
        pins.push(0x10);
        pins.push(0x20);
        pins.pop(0x10);
        assert_eq!(pins.addresses().collect::<Vec<_>>(), vec![0x20]);
        pins.pop(0x20);
        assert!(pins.is_empty());
    }

    #[test]
    fn test_set_counts_repeats() {
        let mut pins = Pins::new();
        pins.insert(0x10);
        pins.insert(0x10);
        assert_eq!(pins.len(), 2);
        pins.remove(0x10);
        assert_eq!(pins.addresses().collect::<Vec<_>>(), vec![0x10]);
        pins.remove(0x10);
        assert!(pins.is_empty());
    }

    #[test]
    #[should_panic(expected = "is not pinned")]
    fn test_releasing_unknown_pin_panics() {
        Pins::new().remove(0x10);
    }
}
