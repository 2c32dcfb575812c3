//! Stop-the-world handshakes, native regions and unsafe scopes across
//! real threads.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::Duration;

use movgc::{Collector, GcConfig, GcError, GcOptions, Managed, Root, ThreadInfo};

#[derive(Managed, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
struct Point {
    x: u64,
    y: u64,
}

fn wait_for(counter: &AtomicUsize, expected: usize) {
    while counter.load(Ordering::SeqCst) < expected {
        thread::yield_now();
    }
}

#[test]
fn test_stops_threads_at_safepoints() {
    let gc = Collector::new(GcConfig::serial().with_worker_threads(1)).unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let ready = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let gc = gc.clone();
            let stop = Arc::clone(&stop);
            let ready = Arc::clone(&ready);
            thread::spawn(move || {
                let mutator = gc.register_thread(ThreadInfo::current()).unwrap();
                ready.fetch_add(1, Ordering::SeqCst);
                while !stop.load(Ordering::SeqCst) {
                    mutator.safepoint();
                    thread::yield_now();
                }
            })
        })
        .collect();
    wait_for(&ready, 3);

    let world = gc.stop_the_world().unwrap();
    assert_eq!(world.suspended(), 3);
    assert_eq!(gc.threads_suspended(), 3);
    drop(world);
    assert_eq!(gc.threads_suspended(), 0);

    stop.store(true, Ordering::SeqCst);
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(gc.info().threads, 0);
}

#[test]
fn test_registered_requester_is_not_suspended() {
    let gc = Collector::new(GcConfig::serial().with_worker_threads(1)).unwrap();
    let mutator = gc.register_thread(ThreadInfo::current()).unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let ready = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let gc = gc.clone();
            let stop = Arc::clone(&stop);
            let ready = Arc::clone(&ready);
            thread::spawn(move || {
                let mutator = gc.register_thread(ThreadInfo::current()).unwrap();
                ready.fetch_add(1, Ordering::SeqCst);
                while !stop.load(Ordering::SeqCst) {
                    mutator.safepoint();
                    thread::yield_now();
                }
            })
        })
        .collect();
    wait_for(&ready, 2);

    assert_eq!(gc.threads_suspended(), 0);
    for _ in 0..10 {
        let world = mutator.stop_the_world().unwrap();
        assert_eq!(world.threads().len(), 3);
        assert_eq!(world.suspended(), 2);
        assert_eq!(gc.threads_suspended(), 2);
        drop(world);
        assert_eq!(gc.threads_suspended(), 0);
    }

    stop.store(true, Ordering::SeqCst);
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_blocked_thread_counts_as_stopped() {
    let gc = Collector::new(GcConfig::serial().with_worker_threads(1)).unwrap();
    let (tx, rx) = mpsc::channel::<u64>();
    let ready = Arc::new(AtomicUsize::new(0));

    let handle = {
        let gc = gc.clone();
        let ready = Arc::clone(&ready);
        thread::spawn(move || {
            let mutator = gc.register_thread(ThreadInfo::current()).unwrap();
            let root = mutator.alloc(5_u64).unwrap();
            ready.fetch_add(1, Ordering::SeqCst);
            let received = mutator.blocking(|| rx.recv().unwrap());
            received + unsafe { mutator.read::<u64>(&root) }
        })
    };
    wait_for(&ready, 1);
    thread::sleep(Duration::from_millis(20));

    // The blocked thread never reaches a safepoint, yet the pause completes.
    let run = gc.collect(GcOptions::full()).unwrap().unwrap();
    assert_eq!(run.heap.mem_live, 32);
    tx.send(10).unwrap();
    assert_eq!(handle.join().unwrap(), 15);
}

#[test]
fn test_unsafe_scope_refuses_collection() {
    let gc = Collector::new(GcConfig::serial().with_worker_threads(1)).unwrap();
    let mutator = gc.register_thread(ThreadInfo::current()).unwrap();
    let _root = mutator.alloc(1_u64).unwrap();

    {
        let _scope = mutator.unsafe_scope();
        assert!(matches!(
            gc.collect(GcOptions::full()),
            Err(GcError::StopTheWorldDisabled)
        ));
        assert!(matches!(
            mutator.stop_the_world(),
            Err(GcError::StopTheWorldDisabled)
        ));
    }
    assert!(gc.collect(GcOptions::full()).unwrap().is_some());
}

#[test]
fn test_unsafe_scope_on_another_thread() {
    let gc = Collector::new(GcConfig::serial().with_worker_threads(1)).unwrap();
    let entered = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));

    let handle = {
        let gc = gc.clone();
        let entered = Arc::clone(&entered);
        let release = Arc::clone(&release);
        thread::spawn(move || {
            let mutator = gc.register_thread(ThreadInfo::current()).unwrap();
            {
                let _scope = mutator.unsafe_scope();
                entered.wait();
                release.wait();
            }
            drop(mutator);
        })
    };
    entered.wait();
    assert!(matches!(
        gc.collect(GcOptions::full()),
        Err(GcError::StopTheWorldDisabled)
    ));
    release.wait();
    handle.join().unwrap();
    assert!(gc.collect(GcOptions::full()).unwrap().is_some());
}

fn churn(config: GcConfig) {
    const THREADS: usize = 4;
    const ROUNDS: u64 = 2_000;

    let gc = Collector::new(config).unwrap();
    let handles: Vec<_> = (0..THREADS as u64)
        .map(|t| {
            let gc = gc.clone();
            thread::spawn(move || {
                let mutator = gc.register_thread(ThreadInfo::current()).unwrap();
                let mut kept: Vec<(u64, Root<'_>)> = Vec::new();
                for i in 0..ROUNDS {
                    let tag = t * 1_000_000 + i;
                    let root = mutator.alloc(Point { x: tag, y: !tag }).unwrap();
                    if i % 16 == 0 {
                        kept.push((tag, root));
                    }
                    if i % 500 == 499 {
                        mutator.collect(GcOptions::mark_and_collect()).unwrap();
                    }
                }
                for (tag, root) in &kept {
                    assert_eq!(
                        unsafe { mutator.read::<Point>(root) },
                        Point { x: *tag, y: !*tag }
                    );
                }
                kept.len()
            })
        })
        .collect();

    let kept: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(kept, THREADS * 125);
    assert!(gc.stats().gc_count >= THREADS * 4);
}

#[test]
fn test_multi_thread_churn_serial() {
    churn(GcConfig::serial().with_worker_threads(2));
}

#[test]
fn test_multi_thread_churn_concurrent() {
    churn(GcConfig::concurrent().with_worker_threads(2));
}

#[cfg(all(any(unix, windows), not(miri)))]
#[test]
fn test_collects_while_thread_spins_without_safepoints() {
    let gc = Collector::new(GcConfig::serial().with_worker_threads(1)).unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let (ready_tx, ready_rx) = mpsc::channel();

    let spinner = {
        let gc = gc.clone();
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mutator = gc.register_thread(ThreadInfo::current()).unwrap();
            let kept = mutator.alloc(Point { x: 4, y: 2 }).unwrap();
            ready_tx.send(()).unwrap();
            let mut x = 1_u64;
            while !stop.load(Ordering::Relaxed) {
                x = std::hint::black_box(x.wrapping_mul(31).wrapping_add(7));
            }
            unsafe { mutator.read::<Point>(&kept) }
        })
    };
    ready_rx.recv().unwrap();

    for _ in 0..3 {
        let run = gc.collect(GcOptions::full()).unwrap().unwrap();
        assert_eq!(run.heap.mem_live, 32);
        assert_eq!(gc.threads_suspended(), 0);
    }

    stop.store(true, Ordering::Relaxed);
    assert_eq!(spinner.join().unwrap(), Point { x: 4, y: 2 });
    assert_eq!(gc.stats().gc_count, 3);
}
