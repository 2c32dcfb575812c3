//! Large-object allocator.
//!
//! Every box above the largest size class gets its own mapping. The
//! [`LargeObject`] descriptor is written at the start of that mapping and
//! the box follows it, so the descriptor lives exactly as long as its
//! memory. Large objects are never moved.

use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use sys_alloc::Mmap;

use crate::compact::{fix_box, Forwarding};
use crate::error::Result;
use crate::gc::sync::{LockGuard, LockOrder};
use crate::heap::box_meta::{self, BoxHeader, BOX_ALIGN};
use crate::heap::chunk::ChunkStat;
use crate::heap::core::CoreAllocator;
use crate::heap::descriptor::LifetimeTag;
use crate::heap::index::{IndexEntry, MemoryIndex};
use crate::meta::TypeMeta;

/// Descriptor placed in front of a large box.
#[repr(C, align(16))]
pub struct LargeObject {
    mapping_len: usize,
    box_size: usize,
    mark: AtomicBool,
    pin: AtomicBool,
    init: AtomicBool,
}

/// Bytes reserved for the descriptor before the box.
pub const DESCRIPTOR_SIZE: usize = mem::size_of::<LargeObject>().div_ceil(BOX_ALIGN) * BOX_ALIGN;

impl LargeObject {
    /// Start of the box.
    #[must_use]
    pub fn cell(&self) -> *mut u8 {
        std::ptr::from_ref(self)
            .cast_mut()
            .cast::<u8>()
            .wrapping_add(DESCRIPTOR_SIZE)
    }

    /// Size of the box.
    #[must_use]
    pub const fn box_size(&self) -> usize {
        self.box_size
    }

    /// Size of the whole mapping.
    #[must_use]
    pub const fn mapping_len(&self) -> usize {
        self.mapping_len
    }

    /// Mark bit.
    #[must_use]
    pub fn get_mark(&self) -> bool {
        self.mark.load(Ordering::Acquire)
    }

    /// Sets the mark bit, returning the previous value.
    pub fn set_mark(&self) -> bool {
        self.mark.swap(true, Ordering::AcqRel)
    }

    /// Pin bit.
    #[must_use]
    pub fn get_pin(&self) -> bool {
        self.pin.load(Ordering::Acquire)
    }

    /// Sets the pin bit, returning the previous value.
    pub fn set_pin(&self) -> bool {
        self.pin.swap(true, Ordering::AcqRel)
    }

    /// Init bit.
    #[must_use]
    pub fn is_init(&self) -> bool {
        self.init.load(Ordering::Acquire)
    }

    /// Lifetime tag of the box.
    #[must_use]
    pub fn lifetime_tag(&self) -> LifetimeTag {
        LifetimeTag::from_bits(self.get_mark(), self.is_init())
    }

    /// Marks the box as constructed, and as reached while marking runs.
    pub fn commit(&self, marking: bool) {
        if marking {
            self.mark.store(true, Ordering::Release);
        }
        self.init.store(true, Ordering::Release);
    }

    fn range(&self) -> std::ops::Range<usize> {
        let start = std::ptr::from_ref(self) as usize;
        start..start + self.mapping_len
    }

    fn unmark(&self) {
        self.mark.store(false, Ordering::Release);
        self.pin.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for LargeObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LargeObject")
            .field("cell", &self.cell())
            .field("box_size", &self.box_size)
            .field("tag", &self.lifetime_tag())
            .finish()
    }
}

/// Owner of all large objects.
#[derive(Debug, Default)]
pub struct LargeObjectAllocator {
    objects: Mutex<Vec<NonNull<LargeObject>>>,
}

// SAFETY: the descriptors are only reached through the lock or with the
// world stopped.
unsafe impl Send for LargeObjectAllocator {}
unsafe impl Sync for LargeObjectAllocator {}

impl LargeObjectAllocator {
    /// Creates an empty allocator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps a block for a box of `box_size` bytes holding `count` objects.
    ///
    /// Returns `Ok(None)` when the core allocator refuses to grow the heap.
    ///
    /// # Errors
    ///
    /// Propagates mapping failures.
    pub fn allocate(
        &self,
        box_size: usize,
        count: usize,
        meta: Option<&TypeMeta>,
        core: &CoreAllocator,
        index: &MemoryIndex,
    ) -> Result<Option<NonNull<LargeObject>>> {
        let Some(memory) = core.map(DESCRIPTOR_SIZE + box_size)? else {
            return Ok(None);
        };
        let range = memory.range();
        let (base, mapping_len) = memory.into_raw();
        let object = base.cast::<LargeObject>();
        // SAFETY: the mapping is fresh, zeroed, page aligned and large
        // enough for the descriptor and the box.
        unsafe {
            object.as_ptr().write(LargeObject {
                mapping_len,
                box_size,
                mark: AtomicBool::new(false),
                pin: AtomicBool::new(false),
                init: AtomicBool::new(false),
            });
            BoxHeader::create(object.as_ref().cell(), count, meta);
        }

        let _guard = LockGuard::new(LockOrder::Heap);
        self.objects.lock().push(object);
        index.add(range, IndexEntry::Large(object));
        Ok(Some(object))
    }

    /// Gives back a block whose construction was abandoned.
    pub fn abort(&self, object: NonNull<LargeObject>, core: &CoreAllocator, index: &MemoryIndex) {
        {
            let _guard = LockGuard::new(LockOrder::Heap);
            self.objects.lock().retain(|&o| o != object);
        }
        // SAFETY: the object was just unlinked and never committed.
        unsafe { release(object, core, index) };
    }

    /// Frees every unmarked large object.
    ///
    /// # Safety
    ///
    /// Must run with the world stopped after marking completed.
    pub unsafe fn collect(&self, core: &CoreAllocator, index: &MemoryIndex) -> (ChunkStat, usize) {
        let mut stat = ChunkStat::default();
        let mut released = 0;
        let _guard = LockGuard::new(LockOrder::Heap);
        let mut objects = self.objects.lock();
        objects.retain(|&object| {
            // SAFETY: every listed descriptor is alive.
            let descriptor = unsafe { object.as_ref() };
            let size = descriptor.box_size();
            match descriptor.lifetime_tag() {
                LifetimeTag::Live | LifetimeTag::Allocated => {
                    stat.occupied += size;
                    stat.live += size;
                    if descriptor.get_pin() {
                        stat.pinned += 1;
                    }
                    true
                }
                tag => {
                    if tag == LifetimeTag::Garbage {
                        stat.occupied += size;
                        stat.freed += size;
                        // SAFETY: garbage is unreachable.
                        unsafe { box_meta::destroy(descriptor.cell()) };
                    }
                    released += descriptor.mapping_len();
                    // SAFETY: unlinked by returning `false`.
                    unsafe { release(object, core, index) };
                    false
                }
            }
        });
        (stat, released)
    }

    /// Rewrites handles held by surviving large objects.
    ///
    /// # Safety
    ///
    /// Must run with the world stopped.
    pub unsafe fn fix(&self, forwarding: &Forwarding, index: &MemoryIndex) -> usize {
        let _guard = LockGuard::new(LockOrder::Heap);
        let objects = self.objects.lock();
        let mut fixed = 0;
        for object in objects.iter() {
            // SAFETY: listed descriptors are alive.
            let descriptor = unsafe { object.as_ref() };
            if descriptor.is_init() {
                // SAFETY: committed box, world stopped.
                fixed += unsafe { fix_box(descriptor.cell(), forwarding, index) };
            }
        }
        fixed
    }

    /// Clears mark and pin bits of every survivor.
    pub fn finalize(&self) {
        let _guard = LockGuard::new(LockOrder::Heap);
        for object in self.objects.lock().iter() {
            // SAFETY: listed descriptors are alive.
            unsafe { object.as_ref() }.unmark();
        }
    }

    /// Number of large objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    /// Whether there are no large objects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }
}

unsafe fn release(object: NonNull<LargeObject>, core: &CoreAllocator, index: &MemoryIndex) {
    // SAFETY: caller guarantees the descriptor is alive and unlinked.
    let (range, len) = unsafe {
        let descriptor = object.as_ref();
        (descriptor.range(), descriptor.mapping_len())
    };
    index.remove(range);
    // SAFETY: the mapping was released with `into_raw` at allocation.
    drop(unsafe { Mmap::from_raw(object.cast(), len) });
    core.release(len);
}

impl Drop for LargeObjectAllocator {
    fn drop(&mut self) {
        for object in self.objects.get_mut().drain(..) {
            // SAFETY: the allocator owns every listed mapping.
            unsafe {
                let descriptor = object.as_ref();
                let len = descriptor.mapping_len();
                if descriptor.is_init() {
                    box_meta::destroy(descriptor.cell());
                }
                drop(Mmap::from_raw(object.cast(), len));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcConfig;

    fn setup() -> (LargeObjectAllocator, CoreAllocator, MemoryIndex) {
        (
            LargeObjectAllocator::new(),
            CoreAllocator::new(&GcConfig::serial()),
            MemoryIndex::new(),
        )
    }

    #[test]
    fn test_allocate_indexes_block() {
        let (loa, core, index) = setup();
        let meta = TypeMeta::of::<[u64; 1024]>();
        let object = loa
            .allocate(box_meta::HEADER_SIZE + 8192, 1, Some(&meta), &core, &index)
            .unwrap()
            .unwrap();
        let cell = unsafe { object.as_ref() }.cell();
        assert_eq!(cell as usize % BOX_ALIGN, 0);
        assert_eq!(index.lookup(cell as usize + 100), Some(IndexEntry::Large(object)));
        assert_eq!(unsafe { BoxHeader::at(cell) }.object_count(), 1);
        assert_eq!(loa.len(), 1);
        assert!(core.heap_size() >= 8192);
    }

    #[test]
    fn test_collect_frees_unmarked() {
        let (loa, core, index) = setup();
        let a = loa.allocate(8192, 1, None, &core, &index).unwrap().unwrap();
        let b = loa.allocate(8192, 1, None, &core, &index).unwrap().unwrap();
        let (a_ref, b_ref) = unsafe { (a.as_ref(), b.as_ref()) };
        a_ref.commit(false);
        b_ref.commit(false);
        a_ref.set_mark();
        let b_cell = b_ref.cell() as usize;

        let (stat, released) = unsafe { loa.collect(&core, &index) };
        assert_eq!(stat.live, 8192);
        assert_eq!(stat.freed, 8192);
        assert!(released >= 8192);
        assert_eq!(loa.len(), 1);
        assert!(index.lookup(b_cell).is_none());

        loa.finalize();
        assert_eq!(a_ref.lifetime_tag(), LifetimeTag::Garbage);
    }

    #[test]
    fn test_abort_unmaps() {
        let (loa, core, index) = setup();
        let object = loa.allocate(8192, 1, None, &core, &index).unwrap().unwrap();
        let before = core.heap_size();
        loa.abort(object, &core, &index);
        assert!(loa.is_empty());
        assert!(core.heap_size() < before);
    }
}
