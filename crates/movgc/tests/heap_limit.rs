//! Heap limits: automatic collections, growth and out-of-memory.

use movgc::{AllocRequest, Collector, GcConfig, GcError, ThreadInfo};

const KIB: usize = 1024;

#[test]
fn test_small_limit_triggers_collections() {
    let gc = Collector::new(
        GcConfig::serial()
            .with_heap_start_limit(256 * KIB)
            .with_worker_threads(1),
    )
    .unwrap();
    let mutator = gc.register_thread(ThreadInfo::current()).unwrap();
    let keep = mutator.alloc(u64::MAX).unwrap();

    for i in 0..100_000_u64 {
        drop(mutator.alloc(i).unwrap());
    }

    let stats = gc.stats();
    assert!(stats.gc_count > 0);
    assert!(stats.heap_size <= 4 * 256 * KIB, "heap grew to {}", stats.heap_size);
    assert_eq!(unsafe { mutator.read::<u64>(&keep) }, u64::MAX);
}

#[test]
fn test_hard_cap_reports_out_of_memory() {
    let gc = Collector::new(
        GcConfig::serial()
            .with_heap_start_limit(256 * KIB)
            .with_max_heap_size(512 * KIB)
            .with_worker_threads(1),
    )
    .unwrap();
    let mutator = gc.register_thread(ThreadInfo::current()).unwrap();

    let mut kept = Vec::new();
    let error = loop {
        match mutator.alloc(kept.len() as u64) {
            Ok(root) => kept.push(root),
            Err(err) => break err,
        }
        assert!(kept.len() < 1_000_000, "heap cap was never reached");
    };
    assert!(matches!(error, GcError::OutOfMemory { .. }));
    assert!(gc.stats().heap_size <= 512 * KIB);
    assert!(gc.stats().heap_limit <= 512 * KIB);

    // Everything allocated before the failure is intact.
    for (i, root) in kept.iter().enumerate() {
        assert_eq!(unsafe { mutator.read::<u64>(root) }, i as u64);
    }
}

#[test]
fn test_oversized_large_object_is_refused() {
    let gc = Collector::new(
        GcConfig::serial()
            .with_heap_start_limit(256 * KIB)
            .with_max_heap_size(512 * KIB)
            .with_worker_threads(1),
    )
    .unwrap();
    let mutator = gc.register_thread(ThreadInfo::current()).unwrap();

    let result = mutator.allocate(AllocRequest::new(1024 * KIB));
    match result {
        Err(GcError::OutOfMemory { requested }) => assert!(requested > 1024 * KIB),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("a box larger than the hard cap was allocated"),
    }

    // The failure left the collector usable.
    let root = mutator.alloc(9_u64).unwrap();
    assert_eq!(unsafe { mutator.read::<u64>(&root) }, 9);
}

#[test]
fn test_limit_can_be_lowered_at_runtime() {
    let gc = Collector::new(GcConfig::serial().with_worker_threads(1)).unwrap();
    gc.set_heap_limit(128 * KIB);
    assert_eq!(gc.info().max_heap_size, 128 * KIB);
    assert_eq!(gc.stats().heap_limit, 128 * KIB);

    let mutator = gc.register_thread(ThreadInfo::current()).unwrap();
    let result = mutator.allocate(AllocRequest::new(512 * KIB));
    assert!(matches!(result, Err(GcError::OutOfMemory { .. })));
}
