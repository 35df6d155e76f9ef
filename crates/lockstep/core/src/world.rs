//! In-memory world for tests and local runs.
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{ErrorClass, LockstepError};
use crate::shadow::{MutationEvent, WorldView};
use crate::state::{
    ActorId, Cell, EntityId, EntityLocator, EntityRef, LocationId, ThingInfo, ThingKind,
};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum WorldError {
    #[error("unknown location {0}")]
    UnknownLocation(LocationId),

    #[error("unknown entity {0}")]
    UnknownEntity(EntityId),

    #[error("entity {0} already exists")]
    DuplicateEntity(EntityId),
}

impl LockstepError for WorldError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Programmer
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::UnknownLocation(_) => "WORLD_UNKNOWN_LOCATION",
            Self::UnknownEntity(_) => "WORLD_UNKNOWN_ENTITY",
            Self::DuplicateEntity(_) => "WORLD_DUPLICATE_ENTITY",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
struct LocationState {
    things: BTreeMap<EntityId, ThingInfo>,
    home_areas: BTreeMap<ActorId, BTreeSet<Cell>>,
}

/// Locations with their things and per-actor home areas.
///
/// Every mutating method returns the [`MutationEvent`] that shadow indices
/// need to see; the caller forwards it to the store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MemoryWorld {
    locations: BTreeMap<LocationId, LocationState>,
    placements: BTreeMap<EntityId, LocationId>,
}

impl MemoryWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_location(&mut self, location: LocationId) {
        self.locations.entry(location).or_default();
    }

    pub fn locations(&self) -> impl Iterator<Item = LocationId> + '_ {
        self.locations.keys().copied()
    }

    pub fn spawn(
        &mut self,
        location: LocationId,
        thing: ThingInfo,
    ) -> Result<MutationEvent, WorldError> {
        if self.placements.contains_key(&thing.id) {
            return Err(WorldError::DuplicateEntity(thing.id));
        }
        let state = self
            .locations
            .get_mut(&location)
            .ok_or(WorldError::UnknownLocation(location))?;
        state.things.insert(thing.id, thing);
        self.placements.insert(thing.id, location);
        Ok(MutationEvent::ThingSpawned(thing))
    }

    pub fn despawn(&mut self, entity: EntityId) -> Result<(LocationId, MutationEvent), WorldError> {
        let location = self
            .placements
            .remove(&entity)
            .ok_or(WorldError::UnknownEntity(entity))?;
        let thing = self
            .locations
            .get_mut(&location)
            .and_then(|state| state.things.remove(&entity))
            .ok_or(WorldError::UnknownEntity(entity))?;
        Ok((location, MutationEvent::ThingDespawned(thing)))
    }

    pub fn set_owner(
        &mut self,
        entity: EntityId,
        owner: Option<ActorId>,
    ) -> Result<(LocationId, MutationEvent), WorldError> {
        let location = self.location_of(entity).ok_or(WorldError::UnknownEntity(entity))?;
        let thing = self
            .locations
            .get_mut(&location)
            .and_then(|state| state.things.get_mut(&entity))
            .ok_or(WorldError::UnknownEntity(entity))?;
        let previous_owner = std::mem::replace(&mut thing.owner, owner);
        Ok((
            location,
            MutationEvent::ThingOwnerChanged {
                thing: *thing,
                previous_owner,
            },
        ))
    }

    /// Moves `entity` to another location, keeping its cell.
    ///
    /// Returns the despawn event for the old location and the spawn event
    /// for the new one.
    pub fn relocate(
        &mut self,
        entity: EntityId,
        to: LocationId,
    ) -> Result<[(LocationId, MutationEvent); 2], WorldError> {
        if !self.locations.contains_key(&to) {
            return Err(WorldError::UnknownLocation(to));
        }
        let (from, despawned) = self.despawn(entity)?;
        let MutationEvent::ThingDespawned(thing) = despawned else {
            return Err(WorldError::UnknownEntity(entity));
        };
        let spawned = self.spawn(to, thing)?;
        Ok([(from, MutationEvent::ThingDespawned(thing)), (to, spawned)])
    }

    /// Adds or removes `cell` from `actor`'s home area at `location`.
    pub fn set_home_cell(
        &mut self,
        actor: ActorId,
        location: LocationId,
        cell: Cell,
        included: bool,
    ) -> Result<MutationEvent, WorldError> {
        let state = self
            .locations
            .get_mut(&location)
            .ok_or(WorldError::UnknownLocation(location))?;
        let home = state.home_areas.entry(actor).or_default();
        if included {
            home.insert(cell);
        } else {
            home.remove(&cell);
        }
        let filth = state
            .things
            .values()
            .filter(|thing| thing.cell == cell && thing.kind == ThingKind::Filth)
            .map(|thing| thing.id)
            .collect();
        Ok(MutationEvent::HomeAreaChanged {
            actor,
            cell,
            included,
            filth,
        })
    }

    pub fn thing(&self, entity: EntityId) -> Option<ThingInfo> {
        let location = self.placements.get(&entity)?;
        self.locations.get(location)?.things.get(&entity).copied()
    }

    /// Current reference to `entity`, with its live location.
    pub fn entity_ref(&self, entity: EntityId) -> Option<EntityRef> {
        let location = self.location_of(entity)?;
        self.thing(entity).map(|thing| thing.as_entity_ref(location))
    }

    /// Things at `location` matching `predicate`, in id order.
    pub fn things_where(
        &self,
        location: LocationId,
        mut predicate: impl FnMut(&ThingInfo) -> bool,
    ) -> Vec<ThingInfo> {
        self.locations
            .get(&location)
            .map(|state| state.things.values().filter(|t| predicate(*t)).copied().collect())
            .unwrap_or_default()
    }

    /// Owners of the buildings within `radius` of `cell`.
    pub fn building_owners_near(
        &self,
        location: LocationId,
        cell: Cell,
        radius: u32,
    ) -> Vec<Option<ActorId>> {
        self.things_where(location, |thing| {
            thing.kind == ThingKind::Building && thing.cell.distance(cell) <= radius
        })
        .into_iter()
        .map(|thing| thing.owner)
        .collect()
    }

    pub fn thing_count(&self) -> usize {
        self.placements.len()
    }
}

impl EntityLocator for MemoryWorld {
    fn location_of(&self, entity: EntityId) -> Option<LocationId> {
        self.placements.get(&entity).copied()
    }
}

impl WorldView for MemoryWorld {
    fn things(&self, location: LocationId) -> Vec<ThingInfo> {
        self.things_where(location, |_| true)
    }

    fn home_area(&self, actor: ActorId, location: LocationId) -> Vec<Cell> {
        self.locations
            .get(&location)
            .and_then(|state| state.home_areas.get(&actor))
            .map(|cells| cells.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ResourceKind;

    const HOME: LocationId = LocationId(1);
    const AWAY: LocationId = LocationId(2);

    fn world() -> MemoryWorld {
        let mut world = MemoryWorld::new();
        world.add_location(HOME);
        world.add_location(AWAY);
        world
    }

    #[test]
    fn relocation_updates_placement_and_emits_both_events() {
        let mut world = world();
        let pawn = ThingInfo::new(EntityId(1), Some(ActorId(1)), Cell::ORIGIN, ThingKind::Pawn);
        world.spawn(HOME, pawn).unwrap();

        let [(from, _), (to, _)] = world.relocate(EntityId(1), AWAY).unwrap();
        assert_eq!((from, to), (HOME, AWAY));
        assert_eq!(world.location_of(EntityId(1)), Some(AWAY));
        assert!(world.things(HOME).is_empty());
    }

    #[test]
    fn home_cell_change_lists_filth_on_the_cell() {
        let mut world = world();
        let cell = Cell::new(3, 3);
        world
            .spawn(HOME, ThingInfo::new(EntityId(5), None, cell, ThingKind::Filth))
            .unwrap();
        world
            .spawn(
                HOME,
                ThingInfo::new(
                    EntityId(6),
                    None,
                    cell,
                    ThingKind::Item {
                        resource: ResourceKind::Food,
                        count: 1,
                    },
                ),
            )
            .unwrap();

        let event = world.set_home_cell(ActorId(1), HOME, cell, true).unwrap();
        assert_eq!(
            event,
            MutationEvent::HomeAreaChanged {
                actor: ActorId(1),
                cell,
                included: true,
                filth: vec![EntityId(5)],
            }
        );
        assert_eq!(world.home_area(ActorId(1), HOME), vec![cell]);
    }

    #[test]
    fn duplicate_and_unknown_entities_are_rejected() {
        let mut world = world();
        let wall = ThingInfo::new(EntityId(9), None, Cell::ORIGIN, ThingKind::Building);
        world.spawn(HOME, wall).unwrap();

        assert_eq!(world.spawn(AWAY, wall), Err(WorldError::DuplicateEntity(EntityId(9))));
        assert_eq!(
            world.despawn(EntityId(10)).unwrap_err(),
            WorldError::UnknownEntity(EntityId(10))
        );
        let stray = ThingInfo::new(EntityId(11), None, Cell::ORIGIN, ThingKind::Pawn);
        assert_eq!(
            world.spawn(LocationId(7), stray),
            Err(WorldError::UnknownLocation(LocationId(7)))
        );
    }
}
