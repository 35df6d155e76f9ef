use lockstep_core::{ActorId, Cell, EntityId, LocationId};
use serde::{Deserialize, Serialize};

/// Externally sourced input, replayed identically on every replica.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimCommand {
    /// Adds or removes a cell from `actor`'s home area.
    Zone {
        actor: ActorId,
        location: LocationId,
        cell: Cell,
        included: bool,
    },
    /// Places a building owned by `actor`.
    Build {
        actor: ActorId,
        location: LocationId,
        cell: Cell,
    },
    /// Hands a thing over to another faction.
    Gift { thing: EntityId, to: ActorId },
    /// Moves a pawn to another location.
    Travel { pawn: EntityId, to: LocationId },
    /// Drops unowned filth on a cell.
    Dump { location: LocationId, cell: Cell },
}

impl SimCommand {
    /// Faction the command acts for, when it names one.
    pub fn actor(&self) -> Option<ActorId> {
        match self {
            Self::Zone { actor, .. } | Self::Build { actor, .. } => Some(*actor),
            Self::Gift { .. } | Self::Travel { .. } | Self::Dump { .. } => None,
        }
    }
}
