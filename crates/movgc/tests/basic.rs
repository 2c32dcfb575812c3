//! End-to-end allocation and collection through the public API.

use movgc::{
    AllocRequest, Collector, GcConfig, GcError, GcKind, GcOptions, Handle, Managed, Mutator, Root,
    ThreadInfo, TypeKey, TypeMeta,
};

#[derive(Managed, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
struct Point {
    x: u64,
    y: u64,
}

#[derive(Managed)]
#[repr(C)]
struct Node {
    value: u64,
    next: Handle,
}

const CELL: usize = 32;

fn serial() -> (Collector, Mutator) {
    let gc = Collector::new(GcConfig::serial().with_worker_threads(2)).unwrap();
    let mutator = gc.register_thread(ThreadInfo::current()).unwrap();
    (gc, mutator)
}

#[test]
fn test_hundred_points_ten_roots() {
    let (gc, mutator) = serial();
    let mut roots: Vec<(u64, Root<'_>)> = Vec::new();
    for i in 0..100_u64 {
        let root = mutator.alloc(Point { x: i, y: i * 2 }).unwrap();
        if i % 10 == 0 {
            roots.push((i, root));
        }
    }

    let run = gc.collect(GcOptions::full()).unwrap().unwrap();
    assert_eq!(run.kind, GcKind::FullCollect);
    assert_eq!(run.heap.mem_occupied, 100 * CELL);
    assert_eq!(run.heap.mem_live, 10 * CELL);
    assert_eq!(run.heap.mem_freed, 90 * CELL);

    for (i, root) in &roots {
        let point = unsafe { mutator.read::<Point>(root) };
        assert_eq!(point, Point { x: *i, y: i * 2 });
    }
}

#[test]
fn test_unreachable_cycle_is_freed() {
    let (gc, mutator) = serial();
    let next = std::mem::offset_of!(Node, next);
    {
        let a = mutator.alloc(Node { value: 1, next: Handle::null() }).unwrap();
        let b = mutator.alloc(Node { value: 2, next: Handle::null() }).unwrap();
        mutator.store(&a, next, &b);
        mutator.store(&b, next, &a);
        let run = gc.collect(GcOptions::mark_and_collect()).unwrap().unwrap();
        assert_eq!(run.heap.mem_live, 2 * CELL);
    }
    let run = gc.collect(GcOptions::mark_and_collect()).unwrap().unwrap();
    assert_eq!(run.heap.mem_live, 0);
    assert_eq!(run.heap.mem_freed, 2 * CELL);
}

#[test]
fn test_chain_reachable_from_one_root() {
    let (gc, mutator) = serial();
    let next = std::mem::offset_of!(Node, next);
    let head = mutator.alloc(Node { value: 0, next: Handle::null() }).unwrap();
    for value in 1..50 {
        let node = mutator.alloc(Node { value, next: Handle::null() }).unwrap();
        mutator.store(&node, next, &head);
        head.set(&node);
    }

    let run = gc.collect(GcOptions::full()).unwrap().unwrap();
    assert_eq!(run.heap.mem_live, 50 * CELL);

    let mut cursor = mutator.root(&head);
    for expected in (0..50).rev() {
        assert_eq!(unsafe { mutator.read::<u64>(&cursor) }, expected);
        cursor = mutator.load(&cursor, next);
    }
    assert!(cursor.is_null());
}

#[test]
fn test_array_box() {
    let (gc, mutator) = serial();
    assert!(mutator.type_meta::<Point>().is_plain());
    let request = AllocRequest::new(std::mem::size_of::<Point>())
        .with_count(4)
        .with_type(TypeKey::of::<Point>());
    let mut construction = mutator.allocate(request).unwrap();
    for i in 0..4_u64 {
        unsafe { construction.write(i as usize * 16, Point { x: i, y: 0 }) };
    }
    let root = construction.commit();

    let run = gc.collect(GcOptions::full()).unwrap().unwrap();
    assert_eq!(run.heap.mem_live, 128);
    let third = unsafe { root.as_ptr().cast::<Point>().add(3).read() };
    assert_eq!(third, Point { x: 3, y: 0 });
}

#[test]
fn test_commit_as_uses_published_metadata() {
    let (gc, mutator) = serial();
    let cell = TypeKey::Named("cell");
    gc.types()
        .publish(cell, || TypeMeta::self_describing("cell", 16, &[0]));

    let child = mutator.alloc(5_u64).unwrap();
    let mut construction = mutator.allocate(AllocRequest::new(16)).unwrap();
    construction.store(0, child.handle());
    let parent = construction.commit_as(cell).unwrap();
    drop(child);
    for i in 0..2_000_u64 {
        drop(mutator.alloc(i).unwrap());
    }

    let run = gc.collect(GcOptions::full()).unwrap().unwrap();
    assert_eq!(run.heap.mem_live, 64);
    let child = mutator.load(&parent, 0);
    assert_eq!(unsafe { mutator.read::<u64>(&child) }, 5);
}

#[test]
fn test_unpublished_type_is_rejected() {
    let (gc, mutator) = serial();
    let unknown = TypeKey::Named("never-published");
    assert_eq!(
        mutator
            .allocate(AllocRequest::new(16).with_type(unknown))
            .unwrap_err(),
        GcError::UnknownType(unknown)
    );

    let construction = mutator.allocate(AllocRequest::new(16)).unwrap();
    assert_eq!(
        construction.commit_as(unknown).unwrap_err(),
        GcError::UnknownType(unknown)
    );
    let run = gc.collect(GcOptions::full()).unwrap().unwrap();
    assert_eq!(run.heap.mem_occupied, 0);
}

#[test]
fn test_large_object_lifecycle() {
    let (gc, mutator) = serial();
    let root = mutator.allocate(AllocRequest::new(10_000)).unwrap().commit();
    unsafe { root.as_ptr().add(9_999).write(7) };

    let run = gc.collect(GcOptions::full()).unwrap().unwrap();
    assert!(run.heap.mem_live >= 10_000);
    assert_eq!(unsafe { root.as_ptr().add(9_999).read() }, 7);

    drop(root);
    let run = gc.collect(GcOptions::full()).unwrap().unwrap();
    assert!(run.heap.mem_freed >= 10_000);
    assert!(run.heap.mem_released >= 10_000);
    assert_eq!(gc.stats().gc_count, 2);
}

#[test]
fn test_values_survive_many_collections() {
    let (gc, mutator) = serial();
    let keep: Vec<Root<'_>> = (0..50).map(|i| mutator.alloc(i as u64).unwrap()).collect();
    for round in 0..20_u64 {
        for i in 0..200 {
            drop(mutator.alloc(round * 1000 + i).unwrap());
        }
        gc.collect(GcOptions::mark_and_collect()).unwrap();
    }
    for (i, root) in keep.iter().enumerate() {
        assert_eq!(unsafe { mutator.read::<u64>(root) }, i as u64);
    }
    assert_eq!(gc.stats().gc_count, 20);
    assert_eq!(gc.metrics().history().recent(100).len(), 20);
}

#[test]
fn test_second_registration_rejected() {
    let (gc, _mutator) = serial();
    assert!(matches!(
        gc.register_thread(ThreadInfo::current()),
        Err(GcError::ThreadAlreadyRegistered)
    ));
}
