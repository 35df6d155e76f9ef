//! Persistence of per-tick replica digests.

mod digest_log;
mod error;
mod in_memory;
mod traits;

pub use digest_log::FileDigestLog;
pub use error::{RepositoryError, Result};
pub use in_memory::InMemoryDigestRepository;
pub use traits::{DigestRecord, DigestRepository, first_divergent_tick};
