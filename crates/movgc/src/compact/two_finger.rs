//! Two-finger compaction of one pool chunk.
//!
//! `to` scans up from the first cell looking for a FREE or GARBAGE cell;
//! `from` scans down from the last cell looking for a LIVE, unpinned box of
//! a movable type.
//! Each step moves the `from` box into the `to` cell and records the move,
//! until the fingers meet. Garbage the fingers did not reach is finalized
//! afterwards. Allocation order is not preserved.

use crate::compact::Forwarding;
use crate::heap::chunk::{ChunkStat, PoolChunk};
use crate::heap::descriptor::LifetimeTag;

/// Compacts `chunk`, recording moves in `forwarding` and pushing the
/// address of every cell left FREE onto `free`.
///
/// # Safety
///
/// Must run with the world stopped after marking completed, and no other
/// thread may touch `chunk` meanwhile.
pub unsafe fn compact(
    chunk: &PoolChunk,
    forwarding: &mut Forwarding,
    free: &mut Vec<usize>,
) -> ChunkStat {
    let cell_size = chunk.cell_size();
    let mut stat = census(chunk);

    let mut to = 0;
    let mut from = chunk.cell_count();
    loop {
        while to < from && !chunk.lifetime_tag(to).is_reclaimable() {
            to += 1;
        }
        while from > to && !chunk.is_movable(from - 1) {
            from -= 1;
        }
        if to >= from {
            break;
        }
        let src = from - 1;
        if chunk.lifetime_tag(to) == LifetimeTag::Garbage {
            // SAFETY: the tag says GARBAGE.
            unsafe { chunk.finalize_cell(to) };
            stat.freed += cell_size;
        }
        // SAFETY: `src` is LIVE, unpinned and movable, `to` is now FREE.
        let (old, new) = unsafe { chunk.move_cell(src, to) };
        forwarding.record(old, new);
        stat.copied += cell_size;
        to += 1;
        from = src;
    }

    for index in 0..chunk.cell_count() {
        match chunk.lifetime_tag(index) {
            LifetimeTag::Garbage => {
                // SAFETY: the tag says GARBAGE.
                unsafe { chunk.finalize_cell(index) };
                stat.freed += cell_size;
                free.push(chunk.cell_at(index) as usize);
            }
            LifetimeTag::Free => free.push(chunk.cell_at(index) as usize),
            LifetimeTag::Live | LifetimeTag::Allocated => {}
        }
    }
    stat
}

fn census(chunk: &PoolChunk) -> ChunkStat {
    let cell_size = chunk.cell_size();
    let mut stat = ChunkStat::default();
    for index in 0..chunk.cell_count() {
        match chunk.lifetime_tag(index) {
            LifetimeTag::Live | LifetimeTag::Allocated => {
                stat.occupied += cell_size;
                stat.live += cell_size;
                if chunk.get_pin(index) {
                    stat.pinned += 1;
                }
            }
            LifetimeTag::Garbage => stat.occupied += cell_size,
            LifetimeTag::Free => {}
        }
    }
    stat
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::box_meta::{object_start, BoxHeader};
    use crate::heap::chunk::tests::chunk;
    use crate::meta::TypeMeta;

    const CELL: usize = 32;

    fn place(chunk: &PoolChunk, meta: &TypeMeta, index: usize, value: u64, tag: LifetimeTag) {
        unsafe {
            let cell = chunk.init_cell(index, 1, Some(meta));
            object_start(cell.as_ptr()).cast::<u64>().write(value);
        }
        match tag {
            LifetimeTag::Live => {
                chunk.commit(index, false);
                chunk.set_mark(index);
            }
            LifetimeTag::Garbage => chunk.commit(index, false),
            LifetimeTag::Allocated => {
                chunk.set_mark(index);
            }
            LifetimeTag::Free => {}
        }
    }

    fn value_at(chunk: &PoolChunk, index: usize) -> u64 {
        unsafe { *object_start(chunk.cell_at(index)).cast::<u64>() }
    }

    fn live_count(chunk: &PoolChunk) -> usize {
        (0..chunk.cell_count())
            .filter(|&i| chunk.lifetime_tag(i) == LifetimeTag::Live)
            .count()
    }

    #[test]
    fn test_compaction_preserves_live_count() {
        let chunk = chunk(CELL);
        let meta = TypeMeta::of::<u64>();
        // LIVE, LIVE, GARBAGE, FREE, LIVE-pinned, LIVE, GARBAGE, LIVE
        place(&chunk, &meta, 0, 10, LifetimeTag::Live);
        place(&chunk, &meta, 1, 11, LifetimeTag::Live);
        place(&chunk, &meta, 2, 12, LifetimeTag::Garbage);
        place(&chunk, &meta, 4, 14, LifetimeTag::Live);
        chunk.set_pin(4);
        place(&chunk, &meta, 5, 15, LifetimeTag::Live);
        place(&chunk, &meta, 6, 16, LifetimeTag::Garbage);
        place(&chunk, &meta, 7, 17, LifetimeTag::Live);
        let before = live_count(&chunk);

        let mut forwarding = Forwarding::new();
        let mut free = Vec::new();
        let stat = unsafe { compact(&chunk, &mut forwarding, &mut free) };

        assert_eq!(live_count(&chunk), before);
        assert_eq!(stat.live, before * CELL);
        assert_eq!(stat.freed, 2 * CELL);
        assert_eq!(stat.pinned, 1);
        // The pinned cell did not move.
        assert_eq!(chunk.lifetime_tag(4), LifetimeTag::Live);
        assert_eq!(value_at(&chunk, 4), 14);
        // 7 → 2, 5 → 3.
        assert_eq!(forwarding.len(), 2);
        assert_eq!(stat.copied, 2 * CELL);
        for &(old, new) in forwarding.moves() {
            assert_ne!(old, new);
            assert!(new < old);
            let header = unsafe { BoxHeader::at(old as *mut u8) };
            assert_eq!(header.forward_pointer().map(|p| p.as_ptr() as usize), Some(new));
        }
        assert_eq!(value_at(&chunk, 2), 17);
        assert_eq!(value_at(&chunk, 3), 15);
        assert!((0..chunk.cell_count())
            .all(|i| chunk.lifetime_tag(i) != LifetimeTag::Garbage));
        assert_eq!(free.len(), chunk.cell_count() - before);
    }

    #[test]
    fn test_allocated_cells_stay_put() {
        let chunk = chunk(CELL);
        let meta = TypeMeta::of::<u64>();
        place(&chunk, &meta, 0, 1, LifetimeTag::Garbage);
        place(&chunk, &meta, 3, 2, LifetimeTag::Allocated);
        let mut forwarding = Forwarding::new();
        let mut free = Vec::new();
        let stat = unsafe { compact(&chunk, &mut forwarding, &mut free) };
        assert!(forwarding.is_empty());
        assert_eq!(chunk.lifetime_tag(3), LifetimeTag::Allocated);
        assert_eq!(chunk.lifetime_tag(0), LifetimeTag::Free);
        assert_eq!(stat.freed, CELL);
        assert_eq!(stat.live, CELL);
    }

    struct Fixed(#[allow(dead_code)] u64);

    unsafe impl crate::meta::Managed for Fixed {
        const MOVABLE: bool = false;

        fn describe(_: &mut crate::meta::LayoutBuilder, _: usize) {}
    }

    #[test]
    fn test_immovable_type_stays_put() {
        let chunk = chunk(CELL);
        let plain = TypeMeta::of::<u64>();
        let fixed = TypeMeta::of::<Fixed>();
        // GARBAGE, FREE, LIVE, LIVE-immovable
        place(&chunk, &plain, 0, 10, LifetimeTag::Garbage);
        place(&chunk, &plain, 2, 12, LifetimeTag::Live);
        place(&chunk, &fixed, 3, 13, LifetimeTag::Live);

        let mut forwarding = Forwarding::new();
        let mut free = Vec::new();
        let stat = unsafe { compact(&chunk, &mut forwarding, &mut free) };

        assert!(!chunk.is_movable(3));
        assert_eq!(chunk.lifetime_tag(3), LifetimeTag::Live);
        assert_eq!(value_at(&chunk, 3), 13);
        // Only the movable box slid down.
        assert_eq!(forwarding.len(), 1);
        assert_eq!(value_at(&chunk, 0), 12);
        assert_eq!(stat.copied, CELL);
        assert_eq!(stat.freed, CELL);
        assert_eq!(live_count(&chunk), 2);
    }

    #[test]
    fn test_already_dense_chunk_moves_nothing() {
        let chunk = chunk(CELL);
        let meta = TypeMeta::of::<u64>();
        for i in 0..4 {
            place(&chunk, &meta, i, i as u64, LifetimeTag::Live);
        }
        let mut forwarding = Forwarding::new();
        let mut free = Vec::new();
        let stat = unsafe { compact(&chunk, &mut forwarding, &mut free) };
        assert!(forwarding.is_empty());
        assert_eq!(stat.copied, 0);
        assert_eq!(free.len(), chunk.cell_count() - 4);
    }
}
