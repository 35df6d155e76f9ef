use crate::error::{ErrorClass, LockstepError};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RandError {
    #[error("random state pop without matching push")]
    NothingPushed,
}

impl LockstepError for RandError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Programmer
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::NothingPushed => "RAND_NOTHING_PUSHED",
        }
    }
}
