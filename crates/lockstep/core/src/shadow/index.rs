use std::collections::{BTreeMap, BTreeSet};

use bitflags::bitflags;

use crate::state::{ActorId, Cell, EntityId, LocationId, ResourceKind, ThingInfo, ThingKind, Tick};

use super::{MutationEvent, WorldView};

bitflags! {
    /// Parts of a [`ShadowIndex`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct ShadowKinds: u8 {
        const HAULABLES = 1 << 0;
        const FILTH     = 1 << 1;
        const RESOURCES = 1 << 2;
        const HOME_AREA = 1 << 3;
    }
}

/// Cached per-actor view of one location.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ShadowIndex {
    actor: ActorId,
    location: LocationId,
    haulables: BTreeSet<EntityId>,
    filth: BTreeMap<EntityId, Cell>,
    home_area: BTreeSet<Cell>,
    resources: BTreeMap<ResourceKind, u32>,
    last_applied: u64,
    last_refresh: Option<Tick>,
}

impl ShadowIndex {
    /// Empty index; nothing is known about the location yet.
    pub fn new(actor: ActorId, location: LocationId) -> Self {
        Self {
            actor,
            location,
            haulables: BTreeSet::new(),
            filth: BTreeMap::new(),
            home_area: BTreeSet::new(),
            resources: BTreeMap::new(),
            last_applied: 0,
            last_refresh: None,
        }
    }

    /// Builds the index from scratch.
    pub fn build<V>(actor: ActorId, location: LocationId, view: &V) -> Self
    where
        V: WorldView + ?Sized,
    {
        let mut index = Self::new(actor, location);
        index.home_area = view.home_area(actor, location).into_iter().collect();
        for thing in view.things(location) {
            index.add_thing(&thing);
        }
        index
    }

    pub fn actor(&self) -> ActorId {
        self.actor
    }

    pub fn location(&self) -> LocationId {
        self.location
    }

    pub fn haulables(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.haulables.iter().copied()
    }

    pub fn is_haulable(&self, thing: EntityId) -> bool {
        self.haulables.contains(&thing)
    }

    /// Filth inside the actor's home area.
    pub fn filth(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.filth.keys().copied()
    }

    pub fn filth_count(&self) -> usize {
        self.filth.len()
    }

    pub fn in_home_area(&self, cell: Cell) -> bool {
        self.home_area.contains(&cell)
    }

    /// Total count of `kind` owned by the actor at this location.
    pub fn resource(&self, kind: ResourceKind) -> u32 {
        self.resources.get(&kind).copied().unwrap_or(0)
    }

    /// Sequence number of the last mutation applied.
    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn last_refresh(&self) -> Option<Tick> {
        self.last_refresh
    }

    pub(super) fn mark_applied(&mut self, sequence: u64) {
        self.last_applied = sequence;
    }

    pub(super) fn mark_refreshed(&mut self, tick: Tick) {
        self.last_refresh = Some(tick);
    }

    /// Applies `event` and returns the parts that changed.
    ///
    /// Events that are irrelevant to this actor only advance the sequence.
    pub fn apply(&mut self, event: &MutationEvent, sequence: u64) -> ShadowKinds {
        let changed = match event {
            MutationEvent::ThingSpawned(thing) => self.add_thing(thing),
            MutationEvent::ThingDespawned(thing) => self.remove_thing(thing),
            MutationEvent::ThingOwnerChanged {
                thing,
                previous_owner,
            } => {
                let previous = ThingInfo {
                    owner: *previous_owner,
                    ..*thing
                };
                self.remove_thing(&previous) | self.add_thing(thing)
            }
            MutationEvent::HomeAreaChanged {
                actor,
                cell,
                included,
                filth,
            } if *actor == self.actor => self.change_home_area(*cell, *included, filth),
            MutationEvent::HomeAreaChanged { .. } => ShadowKinds::empty(),
        };
        self.last_applied = sequence;
        changed
    }

    fn is_relevant_haulable(&self, thing: &ThingInfo) -> bool {
        matches!(thing.kind, ThingKind::Item { .. })
            && thing.owner.is_none_or(|owner| owner == self.actor)
    }

    fn add_thing(&mut self, thing: &ThingInfo) -> ShadowKinds {
        let mut changed = ShadowKinds::empty();
        match thing.kind {
            ThingKind::Item { resource, count } => {
                if self.is_relevant_haulable(thing) && self.haulables.insert(thing.id) {
                    changed |= ShadowKinds::HAULABLES;
                }
                if thing.owner == Some(self.actor) && count > 0 {
                    *self.resources.entry(resource).or_insert(0) += count;
                    changed |= ShadowKinds::RESOURCES;
                }
            }
            ThingKind::Filth => {
                if self.home_area.contains(&thing.cell)
                    && self.filth.insert(thing.id, thing.cell).is_none()
                {
                    changed |= ShadowKinds::FILTH;
                }
            }
            ThingKind::Building | ThingKind::Pawn => {}
        }
        changed
    }

    fn remove_thing(&mut self, thing: &ThingInfo) -> ShadowKinds {
        let mut changed = ShadowKinds::empty();
        match thing.kind {
            ThingKind::Item { resource, count } => {
                if self.haulables.remove(&thing.id) {
                    changed |= ShadowKinds::HAULABLES;
                }
                if thing.owner == Some(self.actor) && count > 0 {
                    if let Some(total) = self.resources.get_mut(&resource) {
                        *total = total.saturating_sub(count);
                        if *total == 0 {
                            self.resources.remove(&resource);
                        }
                        changed |= ShadowKinds::RESOURCES;
                    }
                }
            }
            ThingKind::Filth => {
                if self.filth.remove(&thing.id).is_some() {
                    changed |= ShadowKinds::FILTH;
                }
            }
            ThingKind::Building | ThingKind::Pawn => {}
        }
        changed
    }

    fn change_home_area(&mut self, cell: Cell, included: bool, filth: &[EntityId]) -> ShadowKinds {
        let mut changed = ShadowKinds::empty();
        if included {
            if self.home_area.insert(cell) {
                changed |= ShadowKinds::HOME_AREA;
            }
            for id in filth {
                if self.filth.insert(*id, cell).is_none() {
                    changed |= ShadowKinds::FILTH;
                }
            }
        } else {
            if self.home_area.remove(&cell) {
                changed |= ShadowKinds::HOME_AREA;
            }
            let before = self.filth.len();
            self.filth.retain(|_, at| *at != cell);
            if self.filth.len() != before {
                changed |= ShadowKinds::FILTH;
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: ActorId = ActorId(1);
    const B: ActorId = ActorId(2);
    const LOC: LocationId = LocationId(1);

    fn item(id: u32, owner: Option<ActorId>, count: u32) -> ThingInfo {
        ThingInfo::new(
            EntityId(id),
            owner,
            Cell::new(id as i32, 0),
            ThingKind::Item {
                resource: ResourceKind::Wood,
                count,
            },
        )
    }

    #[test]
    fn items_are_haulable_when_unowned_or_owned_by_the_actor() {
        let mut index = ShadowIndex::new(A, LOC);

        assert_eq!(
            index.apply(&MutationEvent::ThingSpawned(item(1, None, 5)), 1),
            ShadowKinds::HAULABLES
        );
        assert_eq!(
            index.apply(&MutationEvent::ThingSpawned(item(2, Some(A), 3)), 2),
            ShadowKinds::HAULABLES | ShadowKinds::RESOURCES
        );
        assert!(index.apply(&MutationEvent::ThingSpawned(item(3, Some(B), 9)), 3).is_empty());

        assert_eq!(index.haulables().collect::<Vec<_>>(), vec![EntityId(1), EntityId(2)]);
        assert_eq!(index.resource(ResourceKind::Wood), 3);
        assert_eq!(index.last_applied(), 3);
    }

    #[test]
    fn ownership_transfer_moves_resources_between_actors() {
        let mut a = ShadowIndex::new(A, LOC);
        let mut b = ShadowIndex::new(B, LOC);
        let spawned = MutationEvent::ThingSpawned(item(7, Some(A), 10));
        a.apply(&spawned, 1);
        b.apply(&spawned, 1);

        let transfer = MutationEvent::ThingOwnerChanged {
            thing: item(7, Some(B), 10),
            previous_owner: Some(A),
        };
        a.apply(&transfer, 2);
        b.apply(&transfer, 2);

        assert_eq!(a.resource(ResourceKind::Wood), 0);
        assert!(!a.is_haulable(EntityId(7)));
        assert_eq!(b.resource(ResourceKind::Wood), 10);
        assert!(b.is_haulable(EntityId(7)));
    }

    #[test]
    fn filth_is_tracked_only_inside_the_home_area() {
        let mut index = ShadowIndex::new(A, LOC);
        let home = Cell::new(2, 2);
        let filth = |id| ThingInfo::new(EntityId(id), None, home, ThingKind::Filth);

        index.apply(&MutationEvent::ThingSpawned(filth(10)), 1);
        assert_eq!(index.filth_count(), 0);

        let changed = index.apply(
            &MutationEvent::HomeAreaChanged {
                actor: A,
                cell: home,
                included: true,
                filth: vec![EntityId(10)],
            },
            2,
        );
        assert_eq!(changed, ShadowKinds::HOME_AREA | ShadowKinds::FILTH);

        index.apply(&MutationEvent::ThingSpawned(filth(11)), 3);
        assert_eq!(index.filth_count(), 2);

        let other_actor = MutationEvent::HomeAreaChanged {
            actor: B,
            cell: home,
            included: false,
            filth: Vec::new(),
        };
        assert!(index.apply(&other_actor, 4).is_empty());

        index.apply(
            &MutationEvent::HomeAreaChanged {
                actor: A,
                cell: home,
                included: false,
                filth: Vec::new(),
            },
            5,
        );
        assert_eq!(index.filth_count(), 0);
        assert!(!index.in_home_area(home));
    }
}
