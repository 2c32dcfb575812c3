//! Liveness state shared by both heap regions.
//!
//! A box's `mark`, `pin` and `init` bits live in the descriptor that owns
//! its memory, never in the box. [`Descriptor`] dispatches over the two
//! kinds of owner so the marker and the barriers can treat them alike.

use crate::heap::chunk::PoolChunk;
use crate::heap::large::LargeObject;

/// Where a box is in its life, derived from `(mark, init)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifetimeTag {
    /// Not allocated.
    Free,
    /// Allocated and still being constructed.
    Allocated,
    /// Constructed but not reached by the current marking.
    Garbage,
    /// Constructed and reached.
    Live,
}

impl LifetimeTag {
    /// Tag for the given bits.
    #[must_use]
    pub const fn from_bits(mark: bool, init: bool) -> Self {
        match (mark, init) {
            (false, false) => Self::Free,
            (true, false) => Self::Allocated,
            (false, true) => Self::Garbage,
            (true, true) => Self::Live,
        }
    }

    /// Whether the cell can be handed out again once finalized.
    #[must_use]
    pub const fn is_reclaimable(self) -> bool {
        matches!(self, Self::Free | Self::Garbage)
    }
}

/// Owner of a box's liveness bits.
#[derive(Debug, Clone, Copy)]
pub enum Descriptor<'a> {
    /// A cell of a small-object pool chunk.
    Pool(&'a PoolChunk),
    /// A large object.
    Large(&'a LargeObject),
}

impl Descriptor<'_> {
    /// Start of the cell containing `addr`.
    #[must_use]
    pub fn cell_start(&self, addr: usize) -> *mut u8 {
        match self {
            Self::Pool(chunk) => chunk.cell_of(addr),
            Self::Large(object) => object.cell(),
        }
    }

    /// Size of the cells this descriptor manages.
    #[must_use]
    pub fn cell_size(&self) -> usize {
        match self {
            Self::Pool(chunk) => chunk.cell_size(),
            Self::Large(object) => object.box_size(),
        }
    }

    /// Mark bit of the cell at `cell`.
    #[must_use]
    pub fn get_mark(&self, cell: *mut u8) -> bool {
        match self {
            Self::Pool(chunk) => chunk.get_mark(chunk.cell_index(cell as usize)),
            Self::Large(object) => object.get_mark(),
        }
    }

    /// Sets the mark bit, returning its previous value.
    pub fn set_mark(&self, cell: *mut u8) -> bool {
        match self {
            Self::Pool(chunk) => chunk.set_mark(chunk.cell_index(cell as usize)),
            Self::Large(object) => object.set_mark(),
        }
    }

    /// Pin bit of the cell at `cell`.
    #[must_use]
    pub fn get_pin(&self, cell: *mut u8) -> bool {
        match self {
            Self::Pool(chunk) => chunk.get_pin(chunk.cell_index(cell as usize)),
            Self::Large(object) => object.get_pin(),
        }
    }

    /// Sets the pin bit, returning its previous value.
    pub fn set_pin(&self, cell: *mut u8) -> bool {
        match self {
            Self::Pool(chunk) => chunk.set_pin(chunk.cell_index(cell as usize)),
            Self::Large(object) => object.set_pin(),
        }
    }

    /// Init bit of the cell at `cell`.
    #[must_use]
    pub fn is_init(&self, cell: *mut u8) -> bool {
        match self {
            Self::Pool(chunk) => chunk.is_init(chunk.cell_index(cell as usize)),
            Self::Large(object) => object.is_init(),
        }
    }

    /// Lifetime tag of the cell at `cell`.
    #[must_use]
    pub fn lifetime_tag(&self, cell: *mut u8) -> LifetimeTag {
        LifetimeTag::from_bits(self.get_mark(cell), self.is_init(cell))
    }

    /// Whether boxes owned by this descriptor may be compacted.
    #[must_use]
    pub const fn is_compactible(&self) -> bool {
        matches!(self, Self::Pool(_))
    }
}
