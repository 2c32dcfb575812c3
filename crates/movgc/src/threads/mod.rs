//! Mutator threads: registration, stop-the-world, roots and pins.

pub mod pins;
pub mod registry;
pub mod roots;
pub mod stack;
pub mod stw;
pub mod suspend;

pub use registry::{Critical, ThreadInfo, ThreadRecord, ThreadRegistry, ThreadState};
pub use stack::StackBounds;
pub use stw::{stop_the_world, WorldSnapshot, SAFEPOINT_GRACE};
