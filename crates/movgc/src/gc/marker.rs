//! Mark workers.
//!
//! A [`MarkWorker`] turns white boxes gray by setting their mark bit and
//! queueing them, then blackens gray boxes by shading every handle field
//! their type metadata lists. The mark bit is set with a fetch-or, so of
//! several workers reaching the same box exactly one queues it.
//!
//! The same worker type seeds a cycle from roots, pins, constructions in
//! progress and the remembered set; [`MarkWorker::finish`] then hands its
//! gray cells to the pool for the parallel phase.

use std::mem;
use std::sync::atomic::Ordering;

use crate::gc::packets::{Packet, PacketManager};
use crate::gc::thread_pool::StaticThreadPool;
use crate::handle::Handle;
use crate::heap::box_meta;
use crate::heap::index::MemoryIndex;
use crate::threads::roots::InFlight;

/// One marking thread's view of the shared packet pools.
#[derive(Debug)]
pub struct MarkWorker<'a> {
    packets: &'a PacketManager,
    index: &'a MemoryIndex,
    output: Packet,
    marked: usize,
}

impl<'a> MarkWorker<'a> {
    /// Creates a worker with an empty output packet.
    #[must_use]
    pub fn new(packets: &'a PacketManager, index: &'a MemoryIndex) -> Self {
        Self {
            packets,
            index,
            output: packets.empty_packet(),
            marked: 0,
        }
    }

    /// Bytes of boxes this worker turned gray.
    #[must_use]
    pub const fn marked(&self) -> usize {
        self.marked
    }

    /// Marks the box `addr` points into and queues it if it was white.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not owned by the heap.
    pub fn shade(&mut self, addr: usize) {
        let Some(descriptor) = self.index.expect_descriptor(addr) else {
            return;
        };
        let cell = descriptor.cell_start(addr);
        if !descriptor.set_mark(cell) {
            self.marked += descriptor.cell_size();
            self.push(cell as usize);
        }
    }

    /// Shades the target of a root handle.
    pub fn root(&mut self, handle: &Handle) {
        self.shade(handle.load(Ordering::Acquire) as usize);
    }

    /// Pins and shades the box `addr` points into.
    pub fn pin(&mut self, addr: usize) {
        let Some(descriptor) = self.index.expect_descriptor(addr) else {
            return;
        };
        descriptor.set_pin(descriptor.cell_start(addr));
        self.shade(addr);
    }

    /// Treats a word found in a conservative root slot as a pinned root.
    ///
    /// Words that do not point into a committed box are ignored. Returns
    /// whether the word was taken as a root.
    pub fn conservative_root(&mut self, value: usize) -> bool {
        let Ok(Some(descriptor)) = self.index.descriptor(value) else {
            return false;
        };
        let cell = descriptor.cell_start(value);
        if !descriptor.is_init(cell) {
            return false;
        }
        descriptor.set_pin(cell);
        self.shade(value);
        true
    }

    /// Keeps a construction in progress alive and shades the handles it
    /// has written so far.
    ///
    /// The box is marked but never queued: without its type metadata
    /// only the recorded offsets are known to hold handles.
    ///
    /// # Safety
    ///
    /// Recorded offsets must be handle slots inside the box.
    pub unsafe fn in_flight(&mut self, entry: &InFlight) {
        let allocation = &entry.allocation;
        allocation.descriptor().set_mark(allocation.cell());
        let base = allocation.object() as usize;
        for &offset in &entry.offsets {
            // SAFETY: caller contract.
            self.root(unsafe { Handle::from_slot(base + offset) });
        }
    }

    /// Drains the shared pools until marking terminates. Returns the bytes
    /// this worker marked.
    #[must_use]
    pub fn run(mut self) -> usize {
        while let Some(mut input) = self.packets.next() {
            while let Some(cell) = input.pop().or_else(|| self.output.pop()) {
                // SAFETY: only marked boxes are queued and none is freed
                // before marking terminates.
                unsafe { self.trace(cell) };
            }
            self.packets.publish(input);
        }
        self.marked
    }

    /// Publishes queued cells for other workers. Returns the bytes marked.
    pub fn finish(mut self) -> usize {
        let output = mem::take(&mut self.output);
        self.packets.publish(output);
        self.marked
    }

    unsafe fn trace(&mut self, cell: usize) {
        // SAFETY: caller contract.
        unsafe {
            box_meta::for_each_handle(cell as *mut u8, |handle| {
                self.shade(handle.load(Ordering::Acquire) as usize);
            });
        }
    }

    fn push(&mut self, cell: usize) {
        if !self.output.push(cell) {
            self.packets.exchange(&mut self.output);
            self.output.push(cell);
        }
    }
}

/// Marks everything reachable from the published packets with one worker
/// per pool thread. Returns the bytes marked.
pub fn mark_parallel(packets: &PacketManager, index: &MemoryIndex, pool: &StaticThreadPool) -> usize {
    let workers = pool.threads();
    packets.start(workers);
    pool.run((0..workers).collect(), |_| MarkWorker::new(packets, index).run())
        .into_iter()
        .sum()
}
