//! Anonymous page mappings.
//!
//! Every byte of the collected heap comes from here: pool chunks and
//! large-object blocks are each backed by one [`Mmap`]. Mappings are zeroed
//! by the OS and page aligned.

use std::io;
use std::ops::Range;
use std::ptr::NonNull;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is the page size.
#[must_use]
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// Rounds `len` up to a multiple of the allocation granularity.
#[must_use]
pub fn round_to_granularity(len: usize) -> usize {
    let granularity = allocation_granularity();
    len.div_ceil(granularity) * granularity
}

/// An owned anonymous memory mapping.
///
/// The region is unmapped when this handle is dropped, unless ownership was
/// given up with [`Mmap::into_raw`].
pub struct Mmap {
    inner: os::MmapInner,
}

impl Mmap {
    /// Returns a pointer to the start of the mapping.
    #[must_use]
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the mapping in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` for a zero-length mapping.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The address range covered by the mapping.
    #[must_use]
    pub fn range(&self) -> Range<usize> {
        let start = self.ptr() as usize;
        start..start + self.len()
    }

    /// Whether `addr` points into the mapping.
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.range().contains(&addr)
    }

    /// Gives up ownership of the mapping without unmapping it.
    ///
    /// Used when the mapping's own first bytes hold the bookkeeping that
    /// refers back to it; the memory is reclaimed later by
    /// [`Mmap::from_raw`].
    #[must_use]
    pub fn into_raw(self) -> (NonNull<u8>, usize) {
        let this = std::mem::ManuallyDrop::new(self);
        // SAFETY: mappings are never created at address zero.
        let ptr = unsafe { NonNull::new_unchecked(this.ptr()) };
        (ptr, this.len())
    }

    /// Re-takes ownership of a mapping released with [`Mmap::into_raw`].
    ///
    /// # Safety
    ///
    /// `ptr` and `len` must come from a single prior call to `into_raw`,
    /// and no other `Mmap` may own the region.
    #[must_use]
    pub unsafe fn from_raw(ptr: NonNull<u8>, len: usize) -> Self {
        Self {
            // SAFETY: forwarded caller contract.
            inner: unsafe { os::MmapInner::from_raw(ptr.as_ptr(), len) },
        }
    }

    /// Returns the physical pages of `[offset, offset + len)` to the OS while
    /// keeping the range mapped. The range reads back as zeroes.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the advice was rejected.
    ///
    /// # Panics
    ///
    /// Panics if the range is not page aligned or exceeds the mapping.
    pub fn discard(&self, offset: usize, len: usize) -> io::Result<()> {
        let page = page_size();
        assert!(
            offset % page == 0 && len % page == 0,
            "discard range must be page aligned"
        );
        assert!(offset + len <= self.len(), "discard range out of bounds");
        if len == 0 {
            return Ok(());
        }
        // SAFETY: the range lies within this live mapping.
        unsafe { self.inner.discard(offset, len) }
    }
}

impl std::fmt::Debug for Mmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mmap")
            .field("ptr", &self.ptr())
            .field("len", &self.len())
            .finish()
    }
}

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

/// Configuration for creating a memory mapping.
#[derive(Debug, Clone, Default)]
pub struct MmapOptions {
    len: usize,
    populate: bool,
    no_reserve: bool,
}

impl MmapOptions {
    /// Creates options with length 0. A length must be set before mapping.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            len: 0,
            populate: false,
            no_reserve: false,
        }
    }

    /// Sets the length of the mapping in bytes. It is rounded up to the
    /// allocation granularity when mapped.
    #[must_use]
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Pre-fault the page tables (`MAP_POPULATE` on Linux).
    #[must_use]
    pub const fn populate(mut self, populate: bool) -> Self {
        self.populate = populate;
        self
    }

    /// Skip swap reservation (`MAP_NORESERVE` where supported).
    #[must_use]
    pub const fn no_reserve(mut self, no_reserve: bool) -> Self {
        self.no_reserve = no_reserve;
        self
    }

    /// Creates an anonymous, zero-filled, read-write mapping.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidInput` for a zero length, or with the OS error when
    /// the mapping is refused.
    pub fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }
        let len = round_to_granularity(self.len);
        // SAFETY: a fresh mapping with no address hint cannot alias anything.
        let inner = unsafe { os::MmapInner::map_anon(len, self.populate, self.no_reserve)? };
        Ok(Mmap { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn test_page_size() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0, "Page size should be power of 2");
    }

    #[test]
    fn test_allocation_granularity() {
        let ag = allocation_granularity();
        assert!(ag >= page_size());
        assert_eq!(ag & (ag - 1), 0);
    }

    #[test]
    fn test_map_is_zeroed_and_writable() {
        let mmap = MmapOptions::new().len(page_size()).map_anon().unwrap();
        let ptr = mmap.ptr();
        assert_eq!(ptr as usize % page_size(), 0);
        unsafe {
            assert_eq!(ptr::read_volatile(ptr), 0);
            ptr::write_volatile(ptr, 42);
            assert_eq!(ptr::read_volatile(ptr), 42);
        }
    }

    #[test]
    fn test_len_rounds_up() {
        let mmap = MmapOptions::new().len(1).map_anon().unwrap();
        assert_eq!(mmap.len(), allocation_granularity());
        assert!(mmap.contains(mmap.ptr() as usize));
        assert!(!mmap.contains(mmap.ptr() as usize + mmap.len()));
    }

    #[test]
    fn test_zero_len_rejected() {
        let err = MmapOptions::new().map_anon().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_raw_round_trip() {
        let mmap = MmapOptions::new().len(page_size() * 2).map_anon().unwrap();
        let start = mmap.ptr();
        let (raw, len) = mmap.into_raw();
        assert_eq!(raw.as_ptr(), start);
        unsafe { raw.as_ptr().write(7) };
        let mmap = unsafe { Mmap::from_raw(raw, len) };
        assert_eq!(unsafe { mmap.ptr().read() }, 7);
    }

    #[test]
    fn test_discard_zeroes_pages() {
        let page = page_size();
        let mmap = MmapOptions::new().len(page * 2).map_anon().unwrap();
        unsafe {
            mmap.ptr().write(1);
            mmap.ptr().add(page).write(2);
        }
        mmap.discard(0, page).unwrap();
        unsafe {
            assert_eq!(mmap.ptr().read(), 0);
            assert_eq!(mmap.ptr().add(page).read(), 2);
        }
    }
}
