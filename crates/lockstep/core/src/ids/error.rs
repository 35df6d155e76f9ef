use crate::error::{ErrorClass, LockstepError};

use super::OwnerKey;

/// Errors raised while handing out identifiers.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    #[error("no id block installed for {owner}")]
    NoBlock { owner: OwnerKey },

    #[error("id block [{start}, {start}+{size}) for {owner} is exhausted")]
    Exhausted { owner: OwnerKey, start: u32, size: u32 },

    #[error("invalid id block for {owner}: start {start}, size {size}")]
    InvalidBlock { owner: OwnerKey, start: u32, size: u32 },
}

impl LockstepError for AllocError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::NoBlock { .. } | Self::InvalidBlock { .. } => ErrorClass::Programmer,
            Self::Exhausted { .. } => ErrorClass::Exhaustion,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::NoBlock { .. } => "ALLOC_NO_BLOCK",
            Self::Exhausted { .. } => "ALLOC_EXHAUSTED",
            Self::InvalidBlock { .. } => "ALLOC_INVALID_BLOCK",
        }
    }
}
