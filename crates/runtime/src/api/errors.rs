//! Unified error types surfaced by the runtime API.
//!
//! Wraps failures from replica coordination, the id authority and
//! repositories so clients can bubble them up with consistent context.
use thiserror::Error;
use tokio::sync::oneshot;

use lockstep_core::{AllocError, OwnerKey, Tick};

pub use crate::repository::RepositoryError;
use crate::sim::{SimCommand, SimError};
use crate::workers::ReplicaId;

pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime requires at least one replica")]
    NoReplicas,

    #[error("command channel closed")]
    CommandChannelClosed,

    #[error("command buffer full")]
    CommandBufferFull(SimCommand),

    #[error("id authority channel closed")]
    AuthorityChannelClosed,

    #[error("id authority reply channel closed")]
    AuthorityReplyClosed(#[source] oneshot::error::RecvError),

    #[error("{replica} stopped responding")]
    ReplicaLost { replica: ReplicaId },

    #[error("{replica} failed to start")]
    ReplicaStart {
        replica: ReplicaId,
        #[source]
        source: std::io::Error,
    },

    #[error("{replica} panicked")]
    ReplicaPanicked { replica: ReplicaId },

    #[error("worker join failed")]
    WorkerJoin(#[source] tokio::task::JoinError),

    #[error("failed to lay out replica scenario")]
    Setup(#[from] SimError),

    #[error("failed to install initial id block")]
    SetupAllocation(#[from] AllocError),

    #[error("id space exhausted while reserving a block for {owner}")]
    IdSpaceExhausted { owner: OwnerKey },

    #[error("replicas diverged at tick {tick}")]
    Diverged { tick: Tick },

    #[error("failed to encode replica state for digest")]
    Digest(#[source] bincode::Error),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}
