//! Compaction and forwarding.
//!
//! Sparse pool chunks are compacted in place with a two-finger scan. Every
//! move is recorded in a [`Forwarding`] table; once all chunks are done the
//! heap, the roots and the objects under construction are walked and every
//! handle into a moved box is rewritten.

mod fix;
mod forwarding;
mod two_finger;

pub use fix::{fix_box, fix_roots, fix_slots};
pub use forwarding::Forwarding;
pub use two_finger::compact;
