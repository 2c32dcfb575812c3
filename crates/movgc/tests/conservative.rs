//! Conservative stack roots pin their targets.

use movgc::{Collector, GcConfig, GcOptions, Handle, Managed, Mutator, RootMode, ThreadInfo};

#[derive(Managed, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
struct Pair {
    a: u64,
    b: u64,
}

fn conservative() -> Option<(Collector, Mutator)> {
    let info = ThreadInfo::current();
    if info.stack.is_none() {
        eprintln!("stack bounds unavailable on this platform, skipping");
        return None;
    }
    let gc = Collector::new(
        GcConfig::serial()
            .with_root_mode(RootMode::Conservative)
            .with_worker_threads(1),
    )
    .unwrap();
    let mutator = gc.register_thread(info).unwrap();
    Some((gc, mutator))
}

#[test]
fn test_stack_slot_pins_target() {
    let Some((gc, mutator)) = conservative() else {
        return;
    };
    for _ in 0..100 {
        drop(mutator.alloc(Pair { a: 0, b: 0 }).unwrap());
    }

    let slot = Handle::null();
    unsafe { mutator.register_handle(&slot) };
    {
        let root = mutator.alloc(Pair { a: 7, b: 8 }).unwrap();
        mutator.write_barrier(&slot, &root);
    }
    let address = mutator.read_barrier(&slot);

    let run = gc.collect(GcOptions::full()).unwrap().unwrap();
    assert_eq!(run.heap.mem_live, 32);
    assert_eq!(run.heap.pinned_cnt, 1);
    assert_eq!(mutator.read_barrier(&slot), address);
    assert_eq!(unsafe { mutator.read::<Pair>(&slot) }, Pair { a: 7, b: 8 });

    mutator.deregister_handle(&slot);
    let run = gc.collect(GcOptions::full()).unwrap().unwrap();
    assert_eq!(run.heap.mem_live, 0);
}

#[test]
fn test_interior_stack_slot_keeps_box() {
    let Some((gc, mutator)) = conservative() else {
        return;
    };
    let slot = Handle::null();
    unsafe { mutator.register_handle(&slot) };
    {
        let root = mutator.alloc(Pair { a: 1, b: 2 }).unwrap();
        mutator.write_barrier(&slot, &root);
    }
    mutator.interior_write_barrier(&slot, 8);

    let run = gc.collect(GcOptions::full()).unwrap().unwrap();
    assert_eq!(run.heap.mem_live, 32);
    assert_eq!(unsafe { mutator.read::<u64>(&slot) }, 2);
    mutator.deregister_handle(&slot);
}

#[test]
fn test_heap_roots_still_move() {
    let Some((gc, mutator)) = conservative() else {
        return;
    };
    for _ in 0..100 {
        drop(mutator.alloc(Pair { a: 0, b: 0 }).unwrap());
    }
    let precise = mutator.alloc(Pair { a: 3, b: 4 }).unwrap();
    let before = precise.as_ptr();

    let run = gc.collect(GcOptions::full()).unwrap().unwrap();
    assert_eq!(run.heap.pinned_cnt, 0);
    assert_ne!(precise.as_ptr(), before);
    assert_eq!(unsafe { mutator.read::<Pair>(&precise) }, Pair { a: 3, b: 4 });
}
