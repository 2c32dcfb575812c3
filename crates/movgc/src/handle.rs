//! The atomic reference cell through which every managed object is reached.

use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// A pointer-sized, atomically updated reference to a managed object.
///
/// A handle is either null or points into the payload of a live box,
/// possibly at an interior offset. Handles live in mutator memory (on the
/// stack, in a registered [`Root`](crate::Root)) or inside managed objects as
/// fields described by the type's metadata. The collector rewrites them when
/// it moves objects, so application code only reads and writes them through
/// the [`Mutator`](crate::Mutator) barriers.
#[repr(transparent)]
pub struct Handle {
    ptr: AtomicPtr<u8>,
}

impl Handle {
    /// A handle that refers to nothing.
    #[must_use]
    pub const fn null() -> Self {
        Self {
            ptr: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Whether the handle currently refers to nothing.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.ptr.load(Ordering::Relaxed).is_null()
    }

    /// Address of the handle slot itself.
    #[must_use]
    pub fn slot_address(&self) -> usize {
        ptr::from_ref(self) as usize
    }

    #[inline]
    pub(crate) fn load(&self, order: Ordering) -> *mut u8 {
        self.ptr.load(order)
    }

    #[inline]
    pub(crate) fn store(&self, value: *mut u8, order: Ordering) {
        self.ptr.store(value, order);
    }

    /// Reinterprets the word at `addr` as a handle.
    ///
    /// # Safety
    ///
    /// `addr` must be a live, pointer-aligned handle slot for `'a`.
    #[inline]
    pub(crate) unsafe fn from_slot<'a>(addr: usize) -> &'a Self {
        // SAFETY: caller contract; `Handle` is a transparent atomic pointer.
        unsafe { &*(addr as *const Self) }
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handle")
            .field(&self.ptr.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::Handle;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_handle_is_pointer_sized() {
        assert_eq!(std::mem::size_of::<Handle>(), std::mem::size_of::<usize>());
        assert_eq!(std::mem::align_of::<Handle>(), std::mem::align_of::<usize>());
    }

    #[test]
    fn test_null_and_store() {
        let handle = Handle::default();
        assert!(handle.is_null());
        let mut target = 5u8;
        handle.store(&raw mut target, Ordering::Relaxed);
        assert!(!handle.is_null());
        assert_eq!(handle.load(Ordering::Relaxed), &raw mut target);
    }

    #[test]
    fn test_from_slot_aliases() {
        let handle = Handle::null();
        let alias = unsafe { Handle::from_slot(handle.slot_address()) };
        let mut target = 1u8;
        alias.store(&raw mut target, Ordering::Relaxed);
        assert!(!handle.is_null());
    }
}
