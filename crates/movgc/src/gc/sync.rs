//! # Lock Ordering Discipline
//!
//! The collector's locks must be taken in increasing level:
//!
//! | Level | Lock          | Protects                                   |
//! |-------|---------------|--------------------------------------------|
//! | 1     | `Collection`  | One collection (or marking start) at a time |
//! | 2     | `Registry`    | The mutator thread list                    |
//! | 3     | `Heap`        | A size-class pool or the large-object list |
//! | 4     | `Core`        | Heap size and limit accounting             |
//!
//! A mutator allocating takes `Heap` then `Core`. A collection takes all
//! four in order. Same-level acquisitions are allowed, which lets a
//! collection hold every size-class lock at once.
//!
//! In debug builds every acquisition site creates a [`LockGuard`], which
//! checks the order against what the current thread already holds.

use std::cell::{Cell, RefCell};

const MAX_LOCK_DEPTH: usize = 32;

struct LockOrderState {
    stack: RefCell<Vec<u8>>,
    is_shutdown: Cell<bool>,
}

thread_local!(static LOCK_ORDER_STATE: LockOrderState = LockOrderState {
    stack: RefCell::new(Vec::with_capacity(MAX_LOCK_DEPTH)),
    is_shutdown: Cell::new(false),
});

/// Lock order tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockOrder {
    /// Serializes collections and marking starts.
    Collection = 1,
    /// The thread registry.
    Registry = 2,
    /// A size-class pool or the large-object list.
    Heap = 3,
    /// Heap size accounting.
    Core = 4,
}

impl LockOrder {
    /// Acquisition level of this lock.
    #[must_use]
    pub const fn level(self) -> u8 {
        self as u8
    }

    const fn from_level(level: u8) -> Option<Self> {
        match level {
            1 => Some(Self::Collection),
            2 => Some(Self::Registry),
            3 => Some(Self::Heap),
            4 => Some(Self::Core),
            _ => None,
        }
    }
}

/// Debug-only witness that a lock of the given order is held.
///
/// Create it right before taking the lock and keep it alive exactly as
/// long as the lock guard.
#[must_use = "LockGuard must be held for the duration of the critical section"]
pub struct LockGuard {
    _tag: LockOrder,
}

impl LockGuard {
    /// Validates and records an acquisition of `tag`.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if a higher-level lock is already held.
    pub fn new(tag: LockOrder) -> Self {
        #[cfg(debug_assertions)]
        {
            if let Some(held) = highest_held() {
                validate_lock_order(tag, held);
            }
            push(tag);
        }
        Self { _tag: tag }
    }
}

#[cfg(debug_assertions)]
impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = LOCK_ORDER_STATE.try_with(|state| {
            if !state.is_shutdown.get() {
                state.stack.borrow_mut().pop();
            }
        });
    }
}

/// Stops lock order tracking on this thread, for use while its
/// thread-locals are being torn down.
#[inline]
pub fn enter_thread_shutdown() {
    let _ = LOCK_ORDER_STATE.try_with(|state| state.is_shutdown.set(true));
}

/// Panics if `tag` would be acquired below `held`.
#[inline]
#[allow(clippy::format_in_format_args)]
#[cfg(debug_assertions)]
pub fn validate_lock_order(tag: LockOrder, held: LockOrder) {
    assert!(
        tag.level() >= held.level(),
        "Lock ordering violation: {} (level {}) cannot be acquired while holding {} (level {})",
        format!("{tag:?}"),
        tag.level(),
        format!("{held:?}"),
        held.level()
    );
}

#[cfg(debug_assertions)]
fn push(tag: LockOrder) {
    let _ = LOCK_ORDER_STATE.try_with(|state| {
        if !state.is_shutdown.get() {
            state.stack.borrow_mut().push(tag.level());
        }
    });
}

/// Highest lock level currently held by this thread.
#[must_use]
pub fn highest_held() -> Option<LockOrder> {
    LOCK_ORDER_STATE
        .try_with(|state| {
            if state.is_shutdown.get() {
                return None;
            }
            state
                .stack
                .borrow()
                .iter()
                .copied()
                .max()
                .and_then(LockOrder::from_level)
        })
        .ok()
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::{highest_held, LockGuard, LockOrder};

    #[test]
    fn test_lock_order_levels() {
        assert_eq!(LockOrder::Collection.level(), 1);
        assert_eq!(LockOrder::Registry.level(), 2);
        assert_eq!(LockOrder::Heap.level(), 3);
        assert_eq!(LockOrder::Core.level(), 4);
    }

    #[test]
    fn test_full_collection_order() {
        let _g1 = LockGuard::new(LockOrder::Collection);
        let _g2 = LockGuard::new(LockOrder::Registry);
        let _g3 = LockGuard::new(LockOrder::Heap);
        let _g4 = LockGuard::new(LockOrder::Heap);
        let _g5 = LockGuard::new(LockOrder::Core);
        assert_eq!(highest_held(), Some(LockOrder::Core));
    }

    #[test]
    fn test_allocation_order() {
        let _g1 = LockGuard::new(LockOrder::Heap);
        let _g2 = LockGuard::new(LockOrder::Core);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Lock ordering violation")]
    fn test_registry_under_heap_panics() {
        let _g1 = LockGuard::new(LockOrder::Heap);
        let _g2 = LockGuard::new(LockOrder::Registry);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Lock ordering violation")]
    fn test_nested_drop_then_lower_order_panics() {
        let _g1 = LockGuard::new(LockOrder::Registry);
        {
            let _g2 = LockGuard::new(LockOrder::Core);
        }
        let _g3 = LockGuard::new(LockOrder::Collection);
    }

    #[test]
    fn test_state_restored_after_drop() {
        {
            let _g1 = LockGuard::new(LockOrder::Heap);
            let _g2 = LockGuard::new(LockOrder::Core);
        }
        assert_eq!(highest_held(), None);
        let _g3 = LockGuard::new(LockOrder::Collection);
    }
}
