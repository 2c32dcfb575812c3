//! Handle fix-up after compaction.

use crate::compact::Forwarding;
use crate::handle::Handle;
use crate::heap::box_meta;
use crate::heap::index::MemoryIndex;

/// Rewrites every handle field of the box at `cell`. Returns the number of
/// handles changed.
///
/// # Safety
///
/// `cell` must hold a committed box and the world must be stopped.
pub unsafe fn fix_box(cell: *mut u8, forwarding: &Forwarding, index: &MemoryIndex) -> usize {
    let mut fixed = 0;
    // SAFETY: caller contract.
    unsafe {
        box_meta::for_each_handle(cell, |handle| {
            if forwarding.fix_handle(handle, index) {
                fixed += 1;
            }
        });
    }
    fixed
}

/// Rewrites the handles at `offsets` from `base`, as recorded for an
/// object that is still under construction.
///
/// # Safety
///
/// Every `base + offset` must be a handle slot inside a live cell.
pub unsafe fn fix_slots(
    base: usize,
    offsets: &[usize],
    forwarding: &Forwarding,
    index: &MemoryIndex,
) -> usize {
    offsets
        .iter()
        // SAFETY: caller contract.
        .filter(|&&offset| forwarding.fix_handle(unsafe { Handle::from_slot(base + offset) }, index))
        .count()
}

/// Rewrites a set of root handles.
pub fn fix_roots<'a>(
    roots: impl IntoIterator<Item = &'a Handle>,
    forwarding: &Forwarding,
    index: &MemoryIndex,
) -> usize {
    roots
        .into_iter()
        .filter(|handle| forwarding.fix_handle(handle, index))
        .count()
}

#[cfg(test)]
mod tests {
    use std::ptr::NonNull;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::compact::compact;
    use crate::heap::box_meta::object_start;
    use crate::heap::chunk::tests::chunk;
    use crate::heap::index::IndexEntry;
    use crate::meta::TypeMeta;

    #[test]
    fn test_fix_is_idempotent() {
        let chunk = chunk(32);
        let index = MemoryIndex::new();
        index.add(chunk.range(), IndexEntry::Pool(NonNull::from(&chunk)));
        let meta = TypeMeta::of::<u64>();
        for i in [0, 5, 9] {
            unsafe { chunk.init_cell(i, 1, Some(&meta)) };
            chunk.commit(i, false);
        }
        for i in [5, 9] {
            chunk.set_mark(i);
        }

        let roots: Vec<Handle> = [5, 9]
            .iter()
            .map(|&i| {
                let handle = Handle::null();
                // Interior pointer into the second payload word.
                let target = unsafe { object_start(chunk.cell_at(i)).add(8) };
                handle.store(target, Ordering::Relaxed);
                handle
            })
            .collect();

        let mut forwarding = Forwarding::new();
        let mut free = Vec::new();
        let _ = unsafe { compact(&chunk, &mut forwarding, &mut free) };
        assert_eq!(forwarding.len(), 2);

        assert_eq!(fix_roots(&roots, &forwarding, &index), 2);
        let fixed: Vec<*mut u8> = roots.iter().map(|h| h.load(Ordering::Relaxed)).collect();
        // 9 moved into the garbage cell 0, then 5 into the free cell 1.
        assert_eq!(fixed[0] as usize, object_start(chunk.cell_at(1)) as usize + 8);
        assert_eq!(fixed[1] as usize, object_start(chunk.cell_at(0)) as usize + 8);

        assert_eq!(fix_roots(&roots, &forwarding, &index), 0);
        let again: Vec<*mut u8> = roots.iter().map(|h| h.load(Ordering::Relaxed)).collect();
        assert_eq!(fixed, again);
        index.remove(chunk.range());
    }
}
