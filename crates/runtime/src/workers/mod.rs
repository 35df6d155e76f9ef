//! Background workers owned by the runtime.
//!
//! The [`IdAuthority`] runs as a tokio task and reserves id blocks. Each
//! replica runs on its own OS thread because the lockstep core is
//! single-threaded; the coordinator talks to it over channels.

mod authority;
mod replica;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use authority::{AuthorityCommand, BlockGrant, IdAuthority};
pub use replica::{ReplicaCommand, ReplicaSpec, TickReport, spawn_replica};

/// Index of a replica within one runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(pub usize);

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "replica-{}", self.0)
    }
}
