//! Loom tests for the store buffer and remembered set hand-off.
//!
//! Mutators remember cells while a collector drains the shared set. Every
//! remembered cell reaches the set once its buffer is flushed, whichever
//! side flushes it.

use std::collections::HashSet;

use loom::sync::Arc;
use parking_lot::Mutex;

use movgc::gc::remset::{flush, remember, RememberedSet, STORE_BUFFER_CAPACITY};

/// Test that concurrent remembering and a final flush lose nothing.
#[test]
#[ignore = "loom test - run with cargo test loom_remset --release -- --ignored"]
fn test_remember_then_flush_loses_nothing() {
    loom::model(|| {
        let set = Arc::new(RememberedSet::new());
        let buffers = Arc::new([Mutex::new(Vec::new()), Mutex::new(Vec::new())]);

        let mutators: Vec<_> = (0..2)
            .map(|t| {
                let set = Arc::clone(&set);
                let buffers = Arc::clone(&buffers);
                loom::thread::spawn(move || {
                    for i in 0..3 {
                        remember(&buffers[t], &set, t * 100 + i);
                    }
                })
            })
            .collect();
        for mutator in mutators {
            mutator.join().unwrap();
        }

        for buffer in buffers.iter() {
            flush(buffer, &set);
        }
        let cells: HashSet<usize> = set.drain().into_iter().collect();
        assert_eq!(cells.len(), 6);
        assert!(set.is_empty());
    });
}

/// Test that a full buffer flushes itself while another thread drains.
#[test]
#[ignore = "loom test - run with cargo test loom_remset --release -- --ignored"]
fn test_overflow_flush_races_with_drain() {
    loom::model(|| {
        let set = Arc::new(RememberedSet::new());
        let buffer = Arc::new(Mutex::new(Vec::new()));

        let mutator = loom::thread::spawn({
            let set = Arc::clone(&set);
            let buffer = Arc::clone(&buffer);
            move || {
                for cell in 0..STORE_BUFFER_CAPACITY {
                    remember(&buffer, &set, cell);
                }
            }
        });
        let early: Vec<usize> = set.drain();
        mutator.join().unwrap();

        flush(&buffer, &set);
        let late = set.drain();
        assert_eq!(early.len() + late.len(), STORE_BUFFER_CAPACITY);
    });
}
