use super::ids::{ActorId, Cell, EntityId, LocationId};

/// Reference to a simulated object as seen by the context layer.
///
/// Carries the location the object was spawned in (`None` when it is not
/// spawned) and its owning actor (`None` for unowned objects). The value is
/// a snapshot: the live location is looked up through [`EntityLocator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EntityRef {
    pub id: EntityId,
    pub location: Option<LocationId>,
    pub owner: Option<ActorId>,
}

impl EntityRef {
    pub const fn new(id: EntityId, location: Option<LocationId>, owner: Option<ActorId>) -> Self {
        Self {
            id,
            location,
            owner,
        }
    }

    /// Shorthand for an object spawned at `location`.
    pub const fn spawned(id: EntityId, location: LocationId, owner: Option<ActorId>) -> Self {
        Self::new(id, Some(location), owner)
    }

    pub const fn is_spawned(&self) -> bool {
        self.location.is_some()
    }
}

/// Resource categories tallied by the per-faction resource counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ResourceKind {
    Food,
    Wood,
    Steel,
    Medicine,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [Self::Food, Self::Wood, Self::Steel, Self::Medicine];
}

/// What kind of thing occupies a cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ThingKind {
    Item { resource: ResourceKind, count: u32 },
    Filth,
    Building,
    Pawn,
}

/// World-state unit that shadow indices are derived from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ThingInfo {
    pub id: EntityId,
    pub owner: Option<ActorId>,
    pub cell: Cell,
    pub kind: ThingKind,
}

impl ThingInfo {
    pub const fn new(id: EntityId, owner: Option<ActorId>, cell: Cell, kind: ThingKind) -> Self {
        Self {
            id,
            owner,
            cell,
            kind,
        }
    }

    pub fn as_entity_ref(&self, location: LocationId) -> EntityRef {
        EntityRef::spawned(self.id, location, self.owner)
    }
}

/// Looks up where an entity currently lives.
///
/// Implemented by the world; the context stack uses it to detect entities
/// that were relocated while a context referencing them was open.
pub trait EntityLocator {
    fn location_of(&self, entity: EntityId) -> Option<LocationId>;
}
