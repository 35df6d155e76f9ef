//! Id block allocation.
//!
//! Every replica must hand out the same identifiers in the same order. An
//! authority reserves a contiguous [`IdRange`] per [`OwnerKey`]; the owner
//! assigns ids from it locally and asks for a replacement through an
//! [`OverflowSink`] once the block is nearly used up.
mod allocator;
mod error;

pub use allocator::{IdAllocator, IdAssignment, IdBlock, OverflowSink};
pub use error::AllocError;

use std::fmt;

use crate::state::LocationId;

/// Scope an id block belongs to: the world, or one location.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OwnerKey {
    Global,
    Location(LocationId),
}

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Location(location) => write!(f, "{location}"),
        }
    }
}

/// Contiguous range `[start, start + size)` reserved by the authority.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IdRange {
    pub start: u32,
    pub size: u32,
}

impl IdRange {
    pub const fn new(start: u32, size: u32) -> Self {
        Self { start, size }
    }

    /// One past the last id, or `None` if the range does not fit in `u32`.
    pub const fn end(&self) -> Option<u32> {
        self.start.checked_add(self.size)
    }

    pub const fn is_valid(&self) -> bool {
        self.size > 0 && self.end().is_some()
    }

    pub const fn contains(&self, id: u32) -> bool {
        match self.end() {
            Some(end) => id >= self.start && id < end,
            None => false,
        }
    }
}

/// Sent once per block when its usage crosses the overflow threshold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OverflowRequest {
    pub owner: OwnerKey,
    pub exhausted_start: u32,
    pub exhausted_size: u32,
}
