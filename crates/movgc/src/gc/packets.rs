//! Gray work packets shared by mark workers.
//!
//! Instead of one shared gray queue, workers exchange fixed-capacity
//! packets. A worker fills its output packet locally and only touches the
//! shared pools when a packet is full or its input runs dry, which keeps
//! contention proportional to packets rather than objects.
//!
//! # Termination
//!
//! A worker with nothing to do registers as idle under the manager's lock.
//! Marking is over when every worker is idle and no full packet is left;
//! the worker that observes this wakes the others. Idle workers re-check
//! the pool at least every millisecond, so a missed wake-up only costs
//! latency.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};

/// Entries per packet.
pub const PACKET_CAPACITY: usize = 512;

const IDLE_POLL: Duration = Duration::from_millis(1);

/// A bounded batch of gray cells.
#[derive(Debug)]
pub struct Packet {
    entries: Vec<usize>,
}

impl Packet {
    /// Creates an empty packet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(PACKET_CAPACITY),
        }
    }

    /// Adds `cell`, returning `false` if the packet is full.
    pub fn push(&mut self, cell: usize) -> bool {
        if self.is_full() {
            return false;
        }
        self.entries.push(cell);
        true
    }

    /// Takes the most recently added cell.
    pub fn pop(&mut self) -> Option<usize> {
        self.entries.pop()
    }

    /// Number of cells held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the packet holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the packet cannot take another cell.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.entries.len() >= PACKET_CAPACITY
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct Idle {
    workers: usize,
    idle: usize,
}

/// Pools of full and empty packets plus the termination protocol.
#[derive(Debug, Default)]
pub struct PacketManager {
    full: SegQueue<Packet>,
    empty: SegQueue<Packet>,
    idle: Mutex<Idle>,
    wake: Condvar,
    done: AtomicBool,
}

impl PacketManager {
    /// Creates a manager with no packets.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepares a marking round for `workers` workers.
    pub fn start(&self, workers: usize) {
        let mut idle = self.idle.lock();
        *idle = Idle {
            workers: workers.max(1),
            idle: 0,
        };
        self.done.store(false, Ordering::Release);
    }

    /// Removes one expected worker, for a worker that never started.
    pub fn retire_worker(&self) {
        let mut idle = self.idle.lock();
        idle.workers = idle.workers.saturating_sub(1);
        if idle.workers > 0 && idle.idle >= idle.workers && self.full.is_empty() {
            self.done.store(true, Ordering::Release);
        }
        self.wake.notify_all();
    }

    /// Whether the current round has terminated.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Whether no full packet is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.full.is_empty()
    }

    /// An empty packet, recycled when possible.
    #[must_use]
    pub fn empty_packet(&self) -> Packet {
        self.empty.pop().unwrap_or_default()
    }

    /// Hands `packet` back: non-empty packets become stealable work.
    pub fn publish(&self, packet: Packet) {
        if packet.is_empty() {
            self.empty.push(packet);
        } else {
            self.full.push(packet);
            self.wake.notify_one();
        }
    }

    /// Swaps a full `packet` for an empty one, publishing the full one.
    pub fn exchange(&self, packet: &mut Packet) {
        let full = mem::replace(packet, self.empty_packet());
        self.publish(full);
    }

    /// Next packet of work, or `None` once marking has terminated.
    pub fn next(&self) -> Option<Packet> {
        loop {
            if let Some(packet) = self.full.pop() {
                return Some(packet);
            }
            let mut idle = self.idle.lock();
            idle.idle += 1;
            loop {
                if self.done.load(Ordering::Acquire) {
                    return None;
                }
                if !self.full.is_empty() {
                    idle.idle -= 1;
                    break;
                }
                if idle.idle >= idle.workers {
                    self.done.store(true, Ordering::Release);
                    self.wake.notify_all();
                    return None;
                }
                self.wake.wait_for(&mut idle, IDLE_POLL);
            }
        }
    }
}
