//! Address → owner lookup.
//!
//! A three-level radix tree keyed by page number maps every page the heap
//! owns to the descriptor responsible for it: a pool chunk, a large object,
//! or (for conservative roots) a mutator's stack. Lookups are lock free;
//! interior nodes are published with a compare-exchange and never freed
//! before the index itself. Entries are written only by the allocator that
//! owns the range, under that allocator's lock.

use std::ops::Range;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::error::{GcError, Result};
use crate::heap::chunk::PoolChunk;
use crate::heap::descriptor::Descriptor;
use crate::heap::large::LargeObject;

/// Granularity of the index.
pub const PAGE_SHIFT: usize = 12;
/// Size of an index page.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

#[cfg(target_pointer_width = "64")]
const LEVEL_BITS: usize = 12;
#[cfg(target_pointer_width = "64")]
const ADDRESS_BITS: usize = 48;
#[cfg(not(target_pointer_width = "64"))]
const LEVEL_BITS: usize = 7;
#[cfg(not(target_pointer_width = "64"))]
const ADDRESS_BITS: usize = 32;

const FANOUT: usize = 1 << LEVEL_BITS;
const LEVEL_MASK: usize = FANOUT - 1;

const TAG_MASK: usize = 0b11;
const TAG_POOL: usize = 1;
const TAG_LARGE: usize = 2;
const TAG_STACK: usize = 3;

/// What owns an indexed page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexEntry {
    /// A small-object pool chunk.
    Pool(NonNull<PoolChunk>),
    /// A large-object block.
    Large(NonNull<LargeObject>),
    /// The stack of the mutator with this id.
    Stack(u64),
}

impl IndexEntry {
    fn encode(self) -> usize {
        match self {
            Self::Pool(chunk) => chunk.as_ptr() as usize | TAG_POOL,
            Self::Large(object) => object.as_ptr() as usize | TAG_LARGE,
            #[allow(clippy::cast_possible_truncation)]
            Self::Stack(thread) => ((thread as usize) << 2) | TAG_STACK,
        }
    }

    fn decode(raw: usize) -> Option<Self> {
        let untagged = raw & !TAG_MASK;
        match raw & TAG_MASK {
            TAG_POOL => NonNull::new(untagged as *mut PoolChunk).map(Self::Pool),
            TAG_LARGE => NonNull::new(untagged as *mut LargeObject).map(Self::Large),
            TAG_STACK => Some(Self::Stack((raw >> 2) as u64)),
            _ => None,
        }
    }
}

type Leaf = [AtomicUsize; FANOUT];
type Inner = [AtomicPtr<Leaf>; FANOUT];

fn zeroed_node<T>() -> *mut T {
    // SAFETY: all-zero is a valid array of atomics (null pointers / zero).
    Box::into_raw(unsafe { Box::<T>::new_zeroed().assume_init() })
}

/// Page-granular map from addresses to their owners.
pub struct MemoryIndex {
    root: Box<[AtomicPtr<Inner>; FANOUT]>,
}

impl MemoryIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        // SAFETY: all-zero is a valid array of null atomic pointers.
        let root = unsafe { Box::<[AtomicPtr<Inner>; FANOUT]>::new_zeroed().assume_init() };
        Self { root }
    }

    /// Maps every page overlapping `range` to `entry`.
    ///
    /// # Panics
    ///
    /// Panics if the range is empty or lies above the indexable address
    /// space.
    pub fn add(&self, range: Range<usize>, entry: IndexEntry) {
        assert!(!range.is_empty(), "cannot index an empty range");
        let raw = entry.encode();
        for page in pages(&range) {
            self.leaf_slot(page, true)
                .unwrap_or_else(|| panic!("address {:#x} is not indexable", page << PAGE_SHIFT))
                .store(raw, Ordering::Release);
        }
    }

    /// Unmaps every page overlapping `range`.
    pub fn remove(&self, range: Range<usize>) {
        if range.is_empty() {
            return;
        }
        for page in pages(&range) {
            if let Some(slot) = self.leaf_slot(page, false) {
                slot.store(0, Ordering::Release);
            }
        }
    }

    /// Owner of `addr`, if any. Null always resolves to `None`.
    #[must_use]
    pub fn lookup(&self, addr: usize) -> Option<IndexEntry> {
        if addr == 0 {
            return None;
        }
        let slot = self.leaf_slot(addr >> PAGE_SHIFT, false)?;
        IndexEntry::decode(slot.load(Ordering::Acquire))
    }

    /// Heap descriptor owning `addr`.
    ///
    /// Returns `Ok(None)` for null and for stack addresses. The descriptor
    /// stays valid only while the world cannot stop or is already stopped
    /// by the caller: a collection may unmap its chunk, so it must never be
    /// held across a collection or a safepoint. Look the address up again
    /// afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::UnindexedMemory`] for any other unknown address.
    pub fn descriptor(&self, addr: usize) -> Result<Option<Descriptor<'_>>> {
        if addr == 0 {
            return Ok(None);
        }
        match self.lookup(addr) {
            // SAFETY: indexed descriptors stay alive until they are removed
            // from the index, which only happens with the world stopped.
            Some(IndexEntry::Pool(chunk)) => Ok(Some(Descriptor::Pool(unsafe { chunk.as_ref() }))),
            Some(IndexEntry::Large(object)) => {
                Ok(Some(Descriptor::Large(unsafe { object.as_ref() })))
            }
            Some(IndexEntry::Stack(_)) => Ok(None),
            None => Err(GcError::UnindexedMemory { addr }),
        }
    }

    /// Heap descriptor owning `addr`, panicking on unindexed memory.
    ///
    /// Used on paths where the address came out of a handle, which must
    /// never hold a pointer the heap does not own. The same lifetime rule
    /// as [`MemoryIndex::descriptor`] applies.
    ///
    /// # Panics
    ///
    /// Panics with [`GcError::UnindexedMemory`].
    #[must_use]
    pub fn expect_descriptor(&self, addr: usize) -> Option<Descriptor<'_>> {
        self.descriptor(addr).unwrap_or_else(|err| panic!("{err}"))
    }

    /// Whether `addr` belongs to a registered mutator's stack.
    #[must_use]
    pub fn is_stack(&self, addr: usize) -> bool {
        matches!(self.lookup(addr), Some(IndexEntry::Stack(_)))
    }

    fn leaf_slot(&self, page: usize, create: bool) -> Option<&AtomicUsize> {
        if page >> (3 * LEVEL_BITS) != 0 || page >> (ADDRESS_BITS - PAGE_SHIFT) != 0 {
            return None;
        }
        let i0 = (page >> (2 * LEVEL_BITS)) & LEVEL_MASK;
        let i1 = (page >> LEVEL_BITS) & LEVEL_MASK;
        let i2 = page & LEVEL_MASK;

        let inner = child(&self.root[i0], create)?;
        // SAFETY: published nodes live as long as the index.
        let leaf = child(unsafe { &(*inner)[i1] }, create)?;
        // SAFETY: as above.
        Some(unsafe { &(*leaf)[i2] })
    }
}

fn pages(range: &Range<usize>) -> std::ops::RangeInclusive<usize> {
    (range.start >> PAGE_SHIFT)..=((range.end - 1) >> PAGE_SHIFT)
}

fn child<T>(slot: &AtomicPtr<T>, create: bool) -> Option<*mut T> {
    let current = slot.load(Ordering::Acquire);
    if !current.is_null() {
        return Some(current);
    }
    if !create {
        return None;
    }
    let fresh = zeroed_node::<T>();
    match slot.compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => Some(fresh),
        Err(winner) => {
            // SAFETY: `fresh` was never published.
            drop(unsafe { Box::from_raw(fresh) });
            Some(winner)
        }
    }
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryIndex {
    fn drop(&mut self) {
        for inner in self.root.iter_mut() {
            let inner = *inner.get_mut();
            if inner.is_null() {
                continue;
            }
            // SAFETY: nodes were created by `zeroed_node` and are exclusively
            // owned by the index once it is being dropped.
            let mut inner = unsafe { Box::from_raw(inner) };
            for leaf in inner.iter_mut() {
                let leaf = *leaf.get_mut();
                if !leaf.is_null() {
                    drop(unsafe { Box::from_raw(leaf) });
                }
            }
        }
    }
}

// SAFETY: all shared state is atomic.
unsafe impl Send for MemoryIndex {}
unsafe impl Sync for MemoryIndex {}

impl std::fmt::Debug for MemoryIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryIndex").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_pool(addr: usize) -> IndexEntry {
        IndexEntry::Pool(NonNull::new(addr as *mut PoolChunk).unwrap())
    }

    #[test]
    fn test_null_resolves_to_nothing() {
        let index = MemoryIndex::new();
        assert_eq!(index.lookup(0), None);
        assert!(matches!(index.descriptor(0), Ok(None)));
    }

    #[test]
    fn test_unknown_address_is_an_error() {
        let index = MemoryIndex::new();
        assert_eq!(
            index.descriptor(0x7000_1234).err(),
            Some(GcError::UnindexedMemory { addr: 0x7000_1234 })
        );
    }

    #[test]
    fn test_add_lookup_remove() {
        let index = MemoryIndex::new();
        let base = 0x5555_0000;
        let range = base..base + 4 * PAGE_SIZE;
        let entry = fake_pool(0x1000);
        index.add(range.clone(), entry);

        for addr in [base, base + 1, base + PAGE_SIZE * 2 + 17, range.end - 1] {
            assert_eq!(index.lookup(addr), Some(entry));
        }
        assert_eq!(index.lookup(range.end), None);
        assert_eq!(index.lookup(base - 1), None);

        index.remove(range.clone());
        for addr in [base, base + PAGE_SIZE * 3] {
            assert_eq!(index.lookup(addr), None);
        }
    }

    #[test]
    fn test_entries_keep_their_kind() {
        let index = MemoryIndex::new();
        let stack = IndexEntry::Stack(42);
        index.add(0x10_0000..0x10_2000, stack);
        assert_eq!(index.lookup(0x10_1000), Some(stack));
        assert!(index.is_stack(0x10_0008));
        assert!(matches!(index.descriptor(0x10_0008), Ok(None)));

        let large = IndexEntry::Large(NonNull::new(0x20_0000 as *mut LargeObject).unwrap());
        index.add(0x20_0000..0x20_1000, large);
        assert_eq!(index.lookup(0x20_0fff), Some(large));
        assert!(!index.is_stack(0x20_0000));
    }

    #[test]
    fn test_concurrent_adds_share_nodes() {
        use std::sync::Arc;
        let index = Arc::new(MemoryIndex::new());
        let handles: Vec<_> = (0..4usize)
            .map(|i| {
                let index = Arc::clone(&index);
                std::thread::spawn(move || {
                    let base = 0x4000_0000 + i * PAGE_SIZE;
                    index.add(base..base + PAGE_SIZE, fake_pool(0x1000 * (i + 1)));
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for i in 0..4usize {
            assert_eq!(
                index.lookup(0x4000_0000 + i * PAGE_SIZE),
                Some(fake_pool(0x1000 * (i + 1)))
            );
        }
    }
}
