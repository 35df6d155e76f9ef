//! Event types for different topics.

use lockstep_core::{Diagnostic, OverflowRequest, Tick};
use serde::{Deserialize, Serialize};

use crate::workers::{BlockGrant, ReplicaId};

/// A tick completed on every replica with matching digests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickEvent {
    pub tick: Tick,
    /// Hex-encoded state digest shared by all replicas.
    pub digest: String,
    /// Commands replayed during the tick.
    pub commands: usize,
}

/// Id block traffic between replicas and the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdEvent {
    /// A replica crossed the overflow threshold of a block.
    OverflowRequested {
        replica: ReplicaId,
        request: OverflowRequest,
    },
    /// The authority reserved a replacement block.
    BlockGranted(BlockGrant),
}

/// Diagnostic raised by one replica's core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticEvent {
    pub replica: ReplicaId,
    pub tick: Tick,
    pub diagnostic: Diagnostic,
}

/// Replicas reported different digests for the same tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivergenceEvent {
    pub tick: Tick,
    pub digests: Vec<(ReplicaId, String)>,
    /// Index of the first traced random draw that differs, when traces exist.
    pub first_rand_divergence: Option<u64>,
}
