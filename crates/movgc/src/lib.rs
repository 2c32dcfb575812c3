//! A moving, tracing garbage collector for multi-threaded programs.
//!
//! `movgc` manages a heap of boxes addressed through [`Handle`]s. It offers
//! two collectors over the same heap:
//!
//! - **Serial mark-sweep-compact**: every collection is one stop-the-world
//!   pause. Marking runs on a static worker pool; sparse chunks are then
//!   compacted with a two-finger scan and every handle into a moved box is
//!   rewritten, while dense chunks are swept in place.
//! - **Concurrent mark-sweep (CMS)**: a short pause seeds marking, marker
//!   threads trace while mutators run behind a write barrier feeding a
//!   remembered set, and a final pause finishes marking and sweeps.
//!
//! # Features
//!
//! - **Size-class pools** of 64 KiB chunks for boxes up to 4 KiB, and a
//!   large-object space of individually mapped blocks
//! - **Precise or conservative roots**: handles are registered explicitly,
//!   or tracked per stack frame and pinned when the stack is scanned
//! - **Pinning**: scoped guards keep an object in place across collections
//! - **Cooperative stop-the-world** with unsafe scopes that defer it
//! - **Adaptive heap limit** paced by how much each collection frees
//!
//! # Quick Start
//!
//! ```
//! use movgc::{Collector, GcConfig, GcOptions, Handle, LayoutBuilder, Managed, ThreadInfo};
//!
//! #[repr(C)]
//! struct Node {
//!     value: u64,
//!     next: Handle,
//! }
//!
//! unsafe impl Managed for Node {
//!     fn describe(layout: &mut LayoutBuilder, base: usize) {
//!         Handle::describe(layout, base + std::mem::offset_of!(Node, next));
//!     }
//! }
//!
//! let gc = Collector::new(GcConfig::serial())?;
//! let mutator = gc.register_thread(ThreadInfo::current())?;
//!
//! let tail = mutator.alloc(Node { value: 2, next: Handle::null() })?;
//! let head = mutator.alloc(Node { value: 1, next: Handle::null() })?;
//! mutator.store(&head, std::mem::offset_of!(Node, next), &tail);
//! drop(tail);
//!
//! let run = gc.collect(GcOptions::full())?.expect("serial collections pause");
//! assert_eq!(run.heap.mem_live, 64);
//! # Ok::<(), movgc::GcError>(())
//! ```
//!
//! # Threads
//!
//! Each thread touching the heap registers with
//! [`Collector::register_thread`] and gets a `!Send` [`Mutator`]. Threads
//! usually stop at safepoints: every allocation, every collection request
//! and [`Mutator::safepoint`]. A thread that reaches none within
//! [`threads::SAFEPOINT_GRACE`] is suspended by the platform (a signal on
//! Unix, `SuspendThread` on Windows). Code that blocks for long should run
//! inside [`Mutator::blocking`] so collections need not wait for it.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod bitmap;
mod config;
mod error;
mod handle;
mod meta;
mod metrics;
mod mutator;

/// Compaction internals.
///
/// Public for testing and advanced use; most users never touch it.
pub mod compact;

/// Collection internals: marking, remembered set, worker pool.
///
/// Public for testing and advanced use; the entry points are re-exported at
/// the crate root.
pub mod gc;

/// Heap internals: pools, large objects, the memory index.
///
/// This module is public for testing and advanced use cases.
/// Most users should go through [`Mutator`] instead.
pub mod heap;

/// Mutator threads: registration, stop-the-world, roots and pins.
pub mod threads;

/// Structured tracing of collections.
pub mod tracing;

pub use config::{CollectorKind, GcConfig, RootMode, DEFAULT_HEAP_START_LIMIT};
pub use error::{GcError, Result};
pub use gc::{Collector, GcInfo, GcKind, GcOptions};
pub use handle::Handle;
pub use meta::{LayoutBuilder, Managed, TypeKey, TypeMeta, TypeRegistry};
pub use metrics::{GcCounters, GcHistory, GcMetrics, GcRunStat, GcStats, HeapStat, PhaseTimer};
pub use mutator::{
    AllocRequest, Construction, Mutator, PinGuard, PushPinGuard, Root, UnsafeScope,
};
pub use threads::{Critical, StackBounds, ThreadInfo, ThreadState, WorldSnapshot};

// Re-export derive macro when feature is enabled
#[cfg(feature = "derive")]
pub use movgc_derive::Managed;
