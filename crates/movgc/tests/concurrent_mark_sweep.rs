//! Concurrent mark-sweep cycles: start, barrier, finish.

use std::thread;

use movgc::{Collector, CollectorKind, GcConfig, GcKind, GcOptions, Handle, Managed, Mutator, ThreadInfo};

#[derive(Managed)]
#[repr(C)]
struct Node {
    value: u64,
    next: Handle,
}

fn concurrent() -> (Collector, Mutator) {
    let gc = Collector::new(GcConfig::concurrent().with_worker_threads(2)).unwrap();
    let mutator = gc.register_thread(ThreadInfo::current()).unwrap();
    (gc, mutator)
}

#[test]
fn test_mark_only_starts_a_cycle() {
    let (gc, mutator) = concurrent();
    assert_eq!(gc.info().collector, CollectorKind::ConcurrentMarkSweep);
    let _root = mutator.alloc(1_u64).unwrap();

    assert!(gc.collect(GcOptions::mark_only()).unwrap().is_none());
    assert!(gc.info().marking);
    // A second request while marking changes nothing.
    assert!(gc.collect(GcOptions::mark_only()).unwrap().is_none());

    let run = gc.collect(GcOptions::mark_and_collect()).unwrap().unwrap();
    assert!(run.concurrent_mark);
    assert_eq!(run.kind, GcKind::MarkAndCollect);
    assert_eq!(run.heap.mem_live, 32);
    assert!(!gc.info().marking);
}

#[test]
fn test_store_during_marking_keeps_target() {
    let (gc, mutator) = concurrent();
    let next = std::mem::offset_of!(Node, next);
    let holder = mutator.alloc(Node { value: 1, next: Handle::null() }).unwrap();
    let target = mutator.alloc(Node { value: 2, next: Handle::null() }).unwrap();
    for _ in 0..200 {
        drop(mutator.alloc(0_u64).unwrap());
    }

    gc.collect(GcOptions::mark_only()).unwrap();
    mutator.store(&holder, next, &target);
    drop(target);
    let fresh = mutator.alloc(3_u64).unwrap();

    let run = gc.collect(GcOptions::mark_and_collect()).unwrap().unwrap();
    assert_eq!(run.heap.mem_live, 96);

    let reached = mutator.load(&holder, next);
    assert_eq!(unsafe { mutator.read::<u64>(&reached) }, 2);
    assert_eq!(unsafe { mutator.read::<u64>(&fresh) }, 3);
}

#[test]
fn test_cycle_finishes_at_allocation() {
    let (gc, mutator) = concurrent();
    let keep: Vec<_> = (0..100_u64).map(|i| mutator.alloc(i).unwrap()).collect();
    gc.collect(GcOptions::mark_only()).unwrap();

    let mut spins = 0;
    while gc.info().marking {
        assert!(spins < 100_000, "concurrent cycle never finished");
        drop(mutator.alloc(0_u64).unwrap());
        thread::yield_now();
        spins += 1;
    }

    let run = gc.last_run().unwrap();
    assert!(run.concurrent_mark);
    assert_eq!(run.kind, GcKind::MarkAndCollect);
    for (i, root) in keep.iter().enumerate() {
        assert_eq!(unsafe { mutator.read::<u64>(root) }, i as u64);
    }
}

#[test]
fn test_full_collect_compacts_after_concurrent_mark() {
    let (gc, mutator) = concurrent();
    let mut roots = Vec::new();
    for i in 0..400_u64 {
        let root = mutator.alloc(i).unwrap();
        if i % 20 == 0 {
            roots.push((i, root));
        }
    }
    gc.collect(GcOptions::mark_only()).unwrap();
    let run = gc.collect(GcOptions::full()).unwrap().unwrap();
    assert!(run.concurrent_mark);
    assert_eq!(run.heap.mem_live, 20 * 32);
    assert!(run.heap.mem_copied > 0);
    for (i, root) in &roots {
        assert_eq!(unsafe { mutator.read::<u64>(root) }, *i);
    }
}

#[test]
fn test_serial_mark_only_does_nothing() {
    let gc = Collector::new(GcConfig::serial()).unwrap();
    assert!(gc.collect(GcOptions::mark_only()).unwrap().is_none());
    assert!(!gc.info().marking);
    assert_eq!(gc.stats().gc_count, 0);
}
