use crate::state::{ActorId, Cell, EntityId, ThingInfo};

/// A world change that per-actor indices must reflect.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MutationEvent {
    ThingSpawned(ThingInfo),
    ThingDespawned(ThingInfo),
    /// `thing` carries the new owner.
    ThingOwnerChanged {
        thing: ThingInfo,
        previous_owner: Option<ActorId>,
    },
    /// `cell` entered or left `actor`'s home area. `filth` lists the filth
    /// currently lying on that cell.
    HomeAreaChanged {
        actor: ActorId,
        cell: Cell,
        included: bool,
        filth: Vec<EntityId>,
    },
}

impl MutationEvent {
    /// Thing the event is about, if any.
    pub fn thing(&self) -> Option<&ThingInfo> {
        match self {
            Self::ThingSpawned(thing)
            | Self::ThingDespawned(thing)
            | Self::ThingOwnerChanged { thing, .. } => Some(thing),
            Self::HomeAreaChanged { .. } => None,
        }
    }
}
