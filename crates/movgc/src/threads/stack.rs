//! Thread stack ranges and the conservative root bitmap.
//!
//! In conservative mode a handle living on a mutator's stack is not put in
//! the precise root set. Registering it flips one bit in a [`StackBitmap`]
//! covering the stack, split into fixed-size frames that are allocated the
//! first time one of their slots is used. Tracing walks the set bits. A bit
//! left behind by a missed deregistration only keeps garbage alive.

use std::mem;
use std::ops::Range;

use crate::bitmap::Bitmap;
use crate::handle::Handle;

/// Bytes covered by one frame of the bitmap.
pub const FRAME_BYTES: usize = 4096;

/// Largest stack range a bitmap will cover.
pub const MAX_STACK_BYTES: usize = 64 * 1024 * 1024;

const SLOT: usize = mem::size_of::<usize>();
const SLOTS_PER_FRAME: usize = FRAME_BYTES / SLOT;

/// Bounds of a thread's stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    /// The bottom of the stack (highest address).
    pub bottom: usize,
    /// The top of the stack (lowest address).
    pub top: usize,
}

impl StackBounds {
    /// Range covered, clipped to [`MAX_STACK_BYTES`] below `bottom`.
    #[must_use]
    pub fn range(&self) -> Range<usize> {
        let top = self.top.max(self.bottom.saturating_sub(MAX_STACK_BYTES));
        (top & !(FRAME_BYTES - 1))..self.bottom
    }

    /// Whether `addr` lies on this stack.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.range().contains(&addr)
    }
}

/// Retrieve the stack bounds for the current thread.
#[cfg(miri)]
pub fn current_stack_bounds() -> Option<StackBounds> {
    None
}

/// Retrieve the stack bounds for the current thread.
#[cfg(all(target_os = "linux", not(miri)))]
pub fn current_stack_bounds() -> Option<StackBounds> {
    use libc::{
        pthread_attr_destroy, pthread_attr_getstack, pthread_attr_t, pthread_getattr_np,
        pthread_self,
    };

    // SAFETY: the attribute object is initialized by `pthread_getattr_np`
    // and destroyed on every path after that.
    unsafe {
        let mut attr: pthread_attr_t = mem::zeroed();
        if pthread_getattr_np(pthread_self(), &raw mut attr) != 0 {
            return None;
        }

        let mut stackaddr: *mut libc::c_void = std::ptr::null_mut();
        let mut stacksize: libc::size_t = 0;
        let ret = pthread_attr_getstack(&raw const attr, &raw mut stackaddr, &raw mut stacksize);
        pthread_attr_destroy(&raw mut attr);
        if ret != 0 {
            return None;
        }

        let top = stackaddr as usize;
        Some(StackBounds {
            bottom: top + stacksize,
            top,
        })
    }
}

/// Retrieve the stack bounds for the current thread.
#[cfg(all(target_os = "macos", not(miri)))]
pub fn current_stack_bounds() -> Option<StackBounds> {
    // SAFETY: both calls only read attributes of the calling thread.
    unsafe {
        let this = libc::pthread_self();
        let bottom = libc::pthread_get_stackaddr_np(this) as usize;
        let size = libc::pthread_get_stacksize_np(this);
        Some(StackBounds {
            bottom,
            top: bottom - size,
        })
    }
}

/// Retrieve the stack bounds for the current thread.
#[cfg(all(windows, not(miri)))]
pub fn current_stack_bounds() -> Option<StackBounds> {
    use windows_sys::Win32::System::Threading::GetCurrentThreadStackLimits;

    let mut low: usize = 0;
    let mut high: usize = 0;
    // SAFETY: writes two words describing the calling thread's stack.
    unsafe { GetCurrentThreadStackLimits(&raw mut low, &raw mut high) };
    (high > low).then_some(StackBounds {
        bottom: high,
        top: low,
    })
}

/// Retrieve the stack bounds for the current thread (unsupported platform).
#[cfg(all(
    not(target_os = "linux"),
    not(target_os = "macos"),
    not(windows),
    not(miri)
))]
pub fn current_stack_bounds() -> Option<StackBounds> {
    None
}

/// Per-thread bitmap of stack slots holding root handles.
#[derive(Debug)]
pub struct StackBitmap {
    base: usize,
    end: usize,
    frames: Vec<Option<Box<Bitmap>>>,
    len: usize,
}

impl StackBitmap {
    /// Creates an empty bitmap over `bounds`.
    #[must_use]
    pub fn new(bounds: StackBounds) -> Self {
        let range = bounds.range();
        let frames = range.len().div_ceil(FRAME_BYTES);
        Self {
            base: range.start,
            end: range.end,
            frames: (0..frames).map(|_| None).collect(),
            len: 0,
        }
    }

    /// Stack range covered.
    #[must_use]
    pub const fn range(&self) -> Range<usize> {
        self.base..self.end
    }

    /// Whether `addr` can be recorded here.
    #[must_use]
    pub fn covers(&self, addr: usize) -> bool {
        self.range().contains(&addr)
    }

    /// Number of recorded slots.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether no slot is recorded.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Records the handle slot at `addr`.
    ///
    /// # Panics
    ///
    /// Panics if the slot is outside the stack, misaligned or already
    /// recorded.
    pub fn insert(&mut self, addr: usize) {
        let (frame, slot) = self.locate(addr);
        let bits = self.frames[frame].get_or_insert_with(|| Box::new(Bitmap::new(SLOTS_PER_FRAME)));
        assert!(!bits.set(slot), "root handle {addr:#x} registered twice");
        self.len += 1;
    }

    /// Forgets the handle slot at `addr`.
    ///
    /// # Panics
    ///
    /// Panics if the slot was never recorded.
    pub fn remove(&mut self, addr: usize) {
        let (frame, slot) = self.locate(addr);
        let removed = self.frames[frame]
            .as_mut()
            .is_some_and(|bits| bits.reset(slot));
        assert!(removed, "root handle {addr:#x} was never registered");
        self.len -= 1;
        if self.frames[frame].as_ref().is_some_and(|bits| bits.none()) {
            self.frames[frame] = None;
        }
    }

    /// Whether the slot at `addr` is recorded.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        if !self.covers(addr) || addr % SLOT != 0 {
            return false;
        }
        let (frame, slot) = self.locate(addr);
        self.frames[frame].as_ref().is_some_and(|bits| bits.get(slot))
    }

    /// Addresses of every recorded slot, ascending.
    pub fn slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.frames.iter().enumerate().flat_map(move |(frame, bits)| {
            let base = self.base + frame * FRAME_BYTES;
            bits.iter()
                .flat_map(|bits| bits.iter_ones())
                .map(move |slot| base + slot * SLOT)
        })
    }

    /// Every recorded handle.
    ///
    /// # Safety
    ///
    /// Every recorded slot must still hold a live handle, which holds while
    /// the owning thread is stopped at a safepoint.
    pub unsafe fn handles(&self) -> impl Iterator<Item = &Handle> + '_ {
        // SAFETY: caller contract.
        self.slots().map(|addr| unsafe { Handle::from_slot(addr) })
    }

    fn locate(&self, addr: usize) -> (usize, usize) {
        assert!(
            self.covers(addr),
            "slot {addr:#x} is outside the stack {:#x}..{:#x}",
            self.base,
            self.end
        );
        assert!(addr % SLOT == 0, "slot {addr:#x} is not pointer aligned");
        let offset = addr - self.base;
        (offset / FRAME_BYTES, (offset % FRAME_BYTES) / SLOT)
    }
}
