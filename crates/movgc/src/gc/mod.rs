//! Collection: marking, the concurrent cycle and the collector handle.
//!
//! This module provides:
//! - The [`Collector`] and the cycle driver behind it
//! - Packet-based parallel marking and its termination protocol
//! - The remembered set used while marking runs concurrently
//! - Lock ordering discipline for deadlock prevention
//! - The static thread pool that parallelizes pause phases

pub mod collector;
pub mod marker;
pub mod packets;
pub mod remset;
pub mod sync;
pub mod thread_pool;

pub use collector::{Collector, GcInfo};

/// What a collection request should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GcKind {
    /// Start concurrent marking if no cycle is running. The serial
    /// collector ignores this request.
    MarkOnly,
    /// Finish (or run) marking, then sweep and compact by residency.
    #[default]
    MarkAndCollect,
    /// Like [`MarkAndCollect`](Self::MarkAndCollect), but every chunk below
    /// the sweep threshold compacts regardless of its last policy, and the
    /// free tails of compacted chunks are returned to the OS.
    FullCollect,
}

impl GcKind {
    /// Short name for logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::MarkOnly => "mark_only",
            Self::MarkAndCollect => "mark_and_collect",
            Self::FullCollect => "full_collect",
        }
    }
}

/// Options of a collection request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GcOptions {
    /// What to do.
    pub kind: GcKind,
    /// Log the heap summary of this run even if stats printing is off.
    pub print_stats: bool,
}

impl GcOptions {
    /// Start concurrent marking.
    #[must_use]
    pub const fn mark_only() -> Self {
        Self {
            kind: GcKind::MarkOnly,
            print_stats: false,
        }
    }

    /// Regular collection.
    #[must_use]
    pub const fn mark_and_collect() -> Self {
        Self {
            kind: GcKind::MarkAndCollect,
            print_stats: false,
        }
    }

    /// Full collection.
    #[must_use]
    pub const fn full() -> Self {
        Self {
            kind: GcKind::FullCollect,
            print_stats: false,
        }
    }

    /// Forces the heap summary of this run to be logged.
    #[must_use]
    pub const fn with_print_stats(mut self) -> Self {
        self.print_stats = true;
        self
    }
}
