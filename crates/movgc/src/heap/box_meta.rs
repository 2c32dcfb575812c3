//! Box header encoding.
//!
//! Every allocation is a box: a [`BoxHeader`] followed by `object_count`
//! objects of one type. The header's first word holds the type metadata
//! pointer; its low bit is the forwarded flag. Once a box has been relocated
//! the first payload word holds the address of its new cell.
//!
//! ```text
//! cell_start                    cell_start + HEADER_SIZE
//! | meta ptr | F | object count | object 0 | object 1 | ...
//!                                 ^ forward pointer when F = 1
//! ```

use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::GcError;
use crate::handle::Handle;
use crate::meta::TypeMeta;

/// Payload alignment guaranteed for every box.
pub const BOX_ALIGN: usize = 16;

const FORWARDED_BIT: usize = 1;

/// Header at the start of every box.
#[repr(C, align(16))]
pub struct BoxHeader {
    meta: AtomicUsize,
    count: AtomicUsize,
}

/// Size of [`BoxHeader`]; payloads start this many bytes into the cell.
pub const HEADER_SIZE: usize = mem::size_of::<BoxHeader>();

/// Bytes needed for a box of `count` objects of `object_size` bytes, or
/// `None` on overflow.
#[must_use]
pub const fn box_size(object_size: usize, count: usize) -> Option<usize> {
    match object_size.checked_mul(count) {
        Some(payload) => payload.checked_add(HEADER_SIZE),
        None => None,
    }
}

/// Payload address of the box starting at `cell`.
#[inline]
#[must_use]
pub const fn object_start(cell: *mut u8) -> *mut u8 {
    cell.wrapping_add(HEADER_SIZE)
}

impl BoxHeader {
    /// Writes a fresh header at `cell`.
    ///
    /// # Safety
    ///
    /// `cell` must be writable, [`BOX_ALIGN`]-aligned and at least
    /// [`HEADER_SIZE`] plus one pointer long.
    pub unsafe fn create<'a>(cell: *mut u8, count: usize, meta: Option<&TypeMeta>) -> &'a Self {
        let header = cell.cast::<Self>();
        // SAFETY: caller contract.
        unsafe {
            header.write(Self {
                meta: AtomicUsize::new(meta.map_or(0, |m| ptr::from_ref(m) as usize)),
                count: AtomicUsize::new(count),
            });
            &*header
        }
    }

    /// Views the header of the box starting at `cell`.
    ///
    /// # Safety
    ///
    /// `cell` must be the start of a box created with [`BoxHeader::create`]
    /// that stays allocated for `'a`.
    #[inline]
    pub unsafe fn at<'a>(cell: *mut u8) -> &'a Self {
        // SAFETY: caller contract.
        unsafe { &*cell.cast::<Self>() }
    }

    /// Number of objects in the box.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Type metadata, or `None` while a self-describing box is still being
    /// constructed.
    #[must_use]
    pub fn type_meta(&self) -> Option<&TypeMeta> {
        let raw = self.meta.load(Ordering::Acquire) & !FORWARDED_BIT;
        // SAFETY: metadata pointers come from the collector's type registry,
        // which outlives every box.
        unsafe { (raw as *const TypeMeta).as_ref() }
    }

    /// Whether compaction may relocate the box. Boxes still under
    /// construction have no metadata yet and count as movable.
    #[must_use]
    pub fn is_movable(&self) -> bool {
        self.type_meta().map_or(true, TypeMeta::is_movable)
    }

    /// Installs type metadata, keeping the forwarded flag.
    pub fn set_type_meta(&self, meta: &TypeMeta) {
        let flag = self.meta.load(Ordering::Relaxed) & FORWARDED_BIT;
        self.meta
            .store(ptr::from_ref(meta) as usize | flag, Ordering::Release);
    }

    /// Whether the box has been relocated.
    #[must_use]
    pub fn is_forwarded(&self) -> bool {
        self.meta.load(Ordering::Acquire) & FORWARDED_BIT != 0
    }

    /// The cell the box was moved to, if it was.
    #[must_use]
    pub fn forward_pointer(&self) -> Option<NonNull<u8>> {
        if !self.is_forwarded() {
            return None;
        }
        // SAFETY: the forwarded bit is only set after the slot was written.
        let target = unsafe { self.forward_slot().read() };
        NonNull::new(target)
    }

    /// Records that the box now lives at `to` and sets the forwarded flag.
    ///
    /// The first payload word is overwritten, so this is only done to a box
    /// whose contents were already copied away.
    pub fn set_forward_pointer(&self, to: NonNull<u8>) {
        // SAFETY: every box has at least one payload word.
        unsafe { self.forward_slot().write(to.as_ptr()) };
        self.meta.fetch_or(FORWARDED_BIT, Ordering::Release);
    }

    /// Forgets type and count, leaving an empty header.
    pub fn clear(&self) {
        self.meta.store(0, Ordering::Release);
        self.count.store(0, Ordering::Release);
    }

    fn cell(&self) -> *mut u8 {
        ptr::from_ref(self).cast_mut().cast::<u8>()
    }

    fn forward_slot(&self) -> *mut *mut u8 {
        object_start(self.cell()).cast::<*mut u8>()
    }
}

/// Runs the destructor of every object in the box and clears its header.
///
/// # Safety
///
/// `cell` must hold a committed box whose objects are not used afterwards.
pub unsafe fn destroy(cell: *mut u8) {
    // SAFETY: caller contract.
    let header = unsafe { BoxHeader::at(cell) };
    if let Some(meta) = header.type_meta() {
        let base = object_start(cell);
        for i in 0..header.object_count() {
            // SAFETY: object `i` lies within the box and is initialized.
            unsafe { meta.drop_object(base.add(i * meta.type_size())) };
        }
    }
    header.clear();
}

/// Copies the box at `from` into the cell at `to`.
///
/// # Safety
///
/// Both cells must be `cell_size` bytes, must not overlap and `to` must be
/// free.
///
/// # Panics
///
/// Panics with [`GcError::NotMovable`] when the box's type refuses to move.
/// Compaction never picks such boxes; reaching this means a caller skipped
/// [`BoxHeader::is_movable`], and a half-compacted chunk cannot be unwound.
pub unsafe fn relocate(from: *mut u8, to: *mut u8, cell_size: usize) {
    // SAFETY: caller contract.
    let header = unsafe { BoxHeader::at(from) };
    if let Some(meta) = header.type_meta() {
        if !meta.is_movable() {
            panic!(
                "{}",
                GcError::NotMovable {
                    type_name: meta.name().to_owned()
                }
            );
        }
    }
    // SAFETY: caller contract.
    unsafe { ptr::copy_nonoverlapping(from, to, cell_size) };
}

/// Calls `f` on every handle field of every object in the box.
///
/// # Safety
///
/// `cell` must hold a box whose handle fields are initialized (or null).
pub unsafe fn for_each_handle(cell: *mut u8, mut f: impl FnMut(&Handle)) {
    // SAFETY: caller contract.
    let header = unsafe { BoxHeader::at(cell) };
    let Some(meta) = header.type_meta() else {
        return;
    };
    if meta.is_plain() {
        return;
    }
    let base = object_start(cell) as usize;
    for i in 0..header.object_count() {
        let object = base + i * meta.type_size();
        for &offset in meta.handle_offsets() {
            // SAFETY: offsets come from the type's own description.
            f(unsafe { Handle::from_slot(object + offset) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{LayoutBuilder, Managed};

    #[repr(C, align(16))]
    struct Cell64([u8; 64]);

    fn cell() -> Box<Cell64> {
        Box::new(Cell64([0; 64]))
    }

    #[test]
    fn test_header_round_trip() {
        let meta = TypeMeta::of::<u64>();
        let mut storage = cell();
        let start = storage.0.as_mut_ptr();
        for count in [1usize, 3, 6] {
            let header = unsafe { BoxHeader::create(start, count, Some(&meta)) };
            assert_eq!(header.object_count(), count);
            assert!(ptr::eq(header.type_meta().unwrap(), &meta));
            assert!(!header.is_forwarded());
            assert!(header.forward_pointer().is_none());
        }
        let header = unsafe { BoxHeader::create(start, 2, None) };
        assert!(header.type_meta().is_none());
        header.set_type_meta(&meta);
        assert!(header.type_meta().is_some());
    }

    #[test]
    fn test_forward_pointer_sets_flag() {
        let meta = TypeMeta::of::<u64>();
        let mut from = cell();
        let mut to = cell();
        let header = unsafe { BoxHeader::create(from.0.as_mut_ptr(), 1, Some(&meta)) };
        let target = NonNull::new(to.0.as_mut_ptr()).unwrap();
        header.set_forward_pointer(target);
        assert!(header.is_forwarded());
        assert_eq!(header.forward_pointer(), Some(target));
        // The metadata survives the flag.
        assert!(ptr::eq(header.type_meta().unwrap(), &meta));
    }

    #[test]
    fn test_box_size_overflow() {
        assert_eq!(box_size(8, 2), Some(HEADER_SIZE + 16));
        assert_eq!(box_size(usize::MAX, 2), None);
    }

    struct Pinned(u64);

    unsafe impl Managed for Pinned {
        const MOVABLE: bool = false;
        fn describe(_layout: &mut LayoutBuilder, _base: usize) {}
    }

    #[test]
    #[should_panic(expected = "cannot be moved")]
    fn test_relocate_refuses_immovable() {
        let meta = TypeMeta::of::<Pinned>();
        let mut from = cell();
        let mut to = cell();
        unsafe {
            BoxHeader::create(from.0.as_mut_ptr(), 1, Some(&meta));
            relocate(from.0.as_mut_ptr(), to.0.as_mut_ptr(), 64);
        }
    }

    #[test]
    fn test_destroy_runs_drops() {
        use std::sync::atomic::AtomicUsize;
        static DROPS: AtomicUsize = AtomicUsize::new(0);
        struct Counted(#[allow(dead_code)] u64);
        impl Drop for Counted {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }
        unsafe impl Managed for Counted {
            fn describe(_layout: &mut LayoutBuilder, _base: usize) {}
        }

        let meta = TypeMeta::of::<Counted>();
        let mut storage = cell();
        let start = storage.0.as_mut_ptr();
        unsafe {
            BoxHeader::create(start, 2, Some(&meta));
            object_start(start).cast::<Counted>().write(Counted(1));
            object_start(start).cast::<Counted>().add(1).write(Counted(2));
            destroy(start);
            assert!(BoxHeader::at(start).type_meta().is_none());
        }
        assert_eq!(DROPS.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_for_each_handle_visits_every_object() {
        let meta = TypeMeta::of::<[Handle; 2]>();
        let mut storage = cell();
        let start = storage.0.as_mut_ptr();
        let mut seen = Vec::new();
        unsafe {
            BoxHeader::create(start, 2, Some(&meta));
            for_each_handle(start, |h| seen.push(h.slot_address()));
        }
        let base = object_start(start) as usize;
        assert_eq!(seen, vec![base, base + 8, base + 16, base + 24]);
    }
}
