//! Per-actor shadow indices.
//!
//! Locations keep derived indices (haulable things, filth in the home area,
//! resource tallies) that only make sense from one actor's perspective. The
//! [`ShadowStore`] keeps one [`ShadowIndex`] per `(actor, location)` pair and
//! fans every world mutation out to all indices of the affected location.
mod event;
mod index;

pub use event::MutationEvent;
pub use index::{ShadowIndex, ShadowKinds};

use std::cell::{Ref, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::context::ContextStack;
use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::state::{ActorId, Cell, LocationId, ThingInfo, Tick};

/// World state consumed when building shadow indices.
pub trait WorldView {
    /// Every spawned thing at `location`.
    fn things(&self, location: LocationId) -> Vec<ThingInfo>;

    /// Cells of `actor`'s home area at `location`.
    fn home_area(&self, actor: ActorId, location: LocationId) -> Vec<Cell>;
}

/// Result of a rebuild request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RebuildOutcome {
    Rebuilt,
    /// A rebuild of the same index was already running.
    Skipped,
}

type IndexKey = (ActorId, LocationId);

/// All shadow indices of one replica.
///
/// Borrows handed out by [`ShadowStore::get`] and [`ShadowStore::find`] must
/// be released before the store is mutated again.
pub struct ShadowStore {
    indices: RefCell<BTreeMap<IndexKey, ShadowIndex>>,
    sequences: RefCell<BTreeMap<LocationId, u64>>,
    rebuilding: RefCell<BTreeSet<IndexKey>>,
    diagnostics: Diagnostics,
}

impl ShadowStore {
    pub fn new(diagnostics: Diagnostics) -> Self {
        Self {
            indices: RefCell::new(BTreeMap::new()),
            sequences: RefCell::new(BTreeMap::new()),
            rebuilding: RefCell::new(BTreeSet::new()),
            diagnostics,
        }
    }

    /// Index of `actor` at `location`, built from `view` on first access.
    pub fn get<V>(&self, actor: ActorId, location: LocationId, view: &V) -> Ref<'_, ShadowIndex>
    where
        V: WorldView + ?Sized,
    {
        let key = (actor, location);
        if !self.contains(actor, location)
            && self.rebuild(actor, location, view) == RebuildOutcome::Skipped
        {
            // First build of this index still running further up the stack;
            // it replaces the placeholder when it finishes.
            self.indices
                .borrow_mut()
                .entry(key)
                .or_insert_with(|| ShadowIndex::new(actor, location));
        }
        Ref::map(self.indices.borrow(), |indices| &indices[&key])
    }

    /// Index of `actor` at `location` if one exists.
    pub fn find(&self, actor: ActorId, location: LocationId) -> Option<Ref<'_, ShadowIndex>> {
        Ref::filter_map(self.indices.borrow(), |indices| indices.get(&(actor, location))).ok()
    }

    /// Index of the stack's current actor, if one is bound.
    pub fn current<V>(
        &self,
        stack: &ContextStack,
        location: LocationId,
        view: &V,
    ) -> Option<Ref<'_, ShadowIndex>>
    where
        V: WorldView + ?Sized,
    {
        stack.current_actor().map(|actor| self.get(actor, location, view))
    }

    pub fn contains(&self, actor: ActorId, location: LocationId) -> bool {
        self.indices.borrow().contains_key(&(actor, location))
    }

    /// Actors holding an index at `location`, in actor order.
    pub fn actors_at(&self, location: LocationId) -> Vec<ActorId> {
        self.indices
            .borrow()
            .keys()
            .filter(|(_, at)| *at == location)
            .map(|(actor, _)| *actor)
            .collect()
    }

    /// Last sequence number issued for `location`.
    pub fn sequence(&self, location: LocationId) -> u64 {
        self.sequences.borrow().get(&location).copied().unwrap_or(0)
    }

    /// Recomputes the index of `actor` at `location` from scratch.
    ///
    /// A rebuild triggered while the same index is being rebuilt is skipped
    /// and reported as `RecursiveRebuild`.
    pub fn rebuild<V>(&self, actor: ActorId, location: LocationId, view: &V) -> RebuildOutcome
    where
        V: WorldView + ?Sized,
    {
        let key = (actor, location);
        if !self.rebuilding.borrow_mut().insert(key) {
            self.diagnostics.report(
                Diagnostic::new(
                    DiagnosticKind::RecursiveRebuild,
                    format!("recursive rebuild of shadow index for {actor} at {location}"),
                )
                .with_actor(Some(actor)),
            );
            return RebuildOutcome::Skipped;
        }
        let _guard = RebuildGuard {
            rebuilding: &self.rebuilding,
            key,
        };

        let mut index = ShadowIndex::build(actor, location, view);
        index.mark_applied(self.sequence(location));
        let refreshed = self
            .indices
            .borrow()
            .get(&key)
            .and_then(ShadowIndex::last_refresh);
        if let Some(refreshed) = refreshed {
            index.mark_refreshed(refreshed);
        }
        self.indices.borrow_mut().insert(key, index);

        tracing::trace!(
            target: "lockstep::shadow",
            %actor,
            %location,
            "rebuilt shadow index"
        );
        RebuildOutcome::Rebuilt
    }

    /// Rebuilds the index of every actor holding one at `location`.
    ///
    /// Returns the number of indices rebuilt.
    pub fn rebuild_location<V>(&self, location: LocationId, view: &V) -> usize
    where
        V: WorldView + ?Sized,
    {
        self.actors_at(location)
            .into_iter()
            .filter(|actor| self.rebuild(*actor, location, view) == RebuildOutcome::Rebuilt)
            .count()
    }

    /// Applies `event` to every index at `location`, in actor order.
    ///
    /// Returns the sequence number assigned to the event.
    pub fn notify_mutation(&self, location: LocationId, event: &MutationEvent) -> u64 {
        let sequence = {
            let mut sequences = self.sequences.borrow_mut();
            let next = sequences.entry(location).or_insert(0);
            *next += 1;
            *next
        };

        let mut indices = self.indices.borrow_mut();
        for ((_, at), index) in indices.iter_mut() {
            if *at == location {
                let changed = index.apply(event, sequence);
                if !changed.is_empty() {
                    tracing::trace!(
                        target: "lockstep::shadow",
                        actor = %index.actor(),
                        %location,
                        sequence,
                        ?changed,
                        "applied mutation"
                    );
                }
            }
        }
        sequence
    }

    /// Rebuilds every index at `location` when `tick` falls on `interval`.
    ///
    /// An interval of zero disables periodic refresh. Returns the number of
    /// indices refreshed.
    pub fn refresh_due<V>(&self, location: LocationId, tick: Tick, interval: u64, view: &V) -> usize
    where
        V: WorldView + ?Sized,
    {
        if interval == 0 || tick.0 % interval != 0 {
            return 0;
        }

        let refreshed = self.rebuild_location(location, view);
        let mut indices = self.indices.borrow_mut();
        for ((_, at), index) in indices.iter_mut() {
            if *at == location {
                index.mark_refreshed(tick);
            }
        }
        refreshed
    }

    /// Runs `f` over every index in `(actor, location)` order.
    pub fn for_each(&self, mut f: impl FnMut(&ShadowIndex)) {
        for index in self.indices.borrow().values() {
            f(index);
        }
    }

    pub fn len(&self) -> usize {
        self.indices.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.borrow().is_empty()
    }
}

impl fmt::Debug for ShadowStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShadowStore")
            .field("indices", &self.indices.borrow().len())
            .field("sequences", &self.sequences.borrow())
            .finish()
    }
}

struct RebuildGuard<'a> {
    rebuilding: &'a RefCell<BTreeSet<IndexKey>>,
    key: IndexKey,
}

impl Drop for RebuildGuard<'_> {
    fn drop(&mut self) {
        self.rebuilding.borrow_mut().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::CollectingSink;
    use crate::state::{EntityId, ResourceKind, ThingKind};
    use std::cell::Cell as CallCount;
    use std::rc::Rc;

    const A: ActorId = ActorId(1);
    const B: ActorId = ActorId(2);
    const LOC: LocationId = LocationId(3);

    fn store() -> (ShadowStore, Rc<CollectingSink>) {
        let sink = Rc::new(CollectingSink::new());
        (ShadowStore::new(Diagnostics::new(Rc::clone(&sink))), sink)
    }

    fn wood(id: u32, owner: Option<ActorId>) -> ThingInfo {
        ThingInfo::new(
            EntityId(id),
            owner,
            Cell::new(0, id as i32),
            ThingKind::Item {
                resource: ResourceKind::Wood,
                count: 4,
            },
        )
    }

    struct StaticView(Vec<ThingInfo>);

    impl WorldView for StaticView {
        fn things(&self, _: LocationId) -> Vec<ThingInfo> {
            self.0.clone()
        }

        fn home_area(&self, _: ActorId, _: LocationId) -> Vec<Cell> {
            Vec::new()
        }
    }

    /// Calls back into the store while it is being rebuilt.
    struct ReentrantView<'a> {
        store: &'a ShadowStore,
        depth: CallCount<u32>,
        nested: CallCount<Option<RebuildOutcome>>,
    }

    impl WorldView for ReentrantView<'_> {
        fn things(&self, location: LocationId) -> Vec<ThingInfo> {
            self.depth.set(self.depth.get() + 1);
            if self.depth.get() == 1 {
                self.nested.set(Some(self.store.rebuild(A, location, self)));
            }
            vec![wood(1, None)]
        }

        fn home_area(&self, _: ActorId, _: LocationId) -> Vec<Cell> {
            Vec::new()
        }
    }

    fn empty() -> StaticView {
        StaticView(Vec::new())
    }

    #[test]
    fn first_access_reflects_existing_world_state() {
        let (store, _) = store();
        let view = StaticView(vec![wood(50, None), wood(51, Some(B))]);
        assert!(store.find(A, LOC).is_none());

        let lazy = store.get(A, LOC, &view).clone();
        let built = ShadowIndex::build(A, LOC, &view);
        assert_eq!(lazy.haulables().collect::<Vec<_>>(), vec![EntityId(50)]);
        assert_eq!(lazy.haulables().collect::<Vec<_>>(), built.haulables().collect::<Vec<_>>());
        assert_eq!(lazy.resource(ResourceKind::Wood), built.resource(ResourceKind::Wood));
        assert!(store.find(A, LOC).is_some());
    }

    #[test]
    fn mutation_reaches_every_actor_index_at_the_location() {
        let (store, _) = store();
        drop(store.get(A, LOC, &empty()));
        drop(store.get(B, LOC, &empty()));
        drop(store.get(A, LocationId(99), &empty()));

        let sequence = store.notify_mutation(LOC, &MutationEvent::ThingSpawned(wood(5, Some(B))));
        assert_eq!(sequence, 1);

        let a = store.get(A, LOC, &empty());
        let b = store.get(B, LOC, &empty());
        assert!(!a.is_haulable(EntityId(5)));
        assert_eq!(a.last_applied(), 1);
        assert!(b.is_haulable(EntityId(5)));
        assert_eq!(b.resource(ResourceKind::Wood), 4);
        assert_eq!(b.last_applied(), 1);
        drop((a, b));

        assert_eq!(store.find(A, LocationId(99)).map(|index| index.last_applied()), Some(0));
    }

    #[test]
    fn reentrant_rebuild_is_skipped_and_reported() {
        let (store, sink) = store();
        let view = ReentrantView {
            store: &store,
            depth: CallCount::new(0),
            nested: CallCount::new(None),
        };

        assert_eq!(store.rebuild(A, LOC, &view), RebuildOutcome::Rebuilt);
        assert_eq!(view.nested.get(), Some(RebuildOutcome::Skipped));
        assert_eq!(view.depth.get(), 1);
        assert_eq!(sink.count(DiagnosticKind::RecursiveRebuild), 1);
        assert!(store.find(A, LOC).is_some_and(|index| index.is_haulable(EntityId(1))));

        // Guard released: a later rebuild runs normally.
        assert_eq!(store.rebuild(A, LOC, &StaticView(Vec::new())), RebuildOutcome::Rebuilt);
    }

    #[test]
    fn rebuild_guard_is_released_on_unwind() {
        struct PanickingView;

        impl WorldView for PanickingView {
            fn things(&self, _: LocationId) -> Vec<ThingInfo> {
                panic!("world unavailable");
            }

            fn home_area(&self, _: ActorId, _: LocationId) -> Vec<Cell> {
                Vec::new()
            }
        }

        let (store, sink) = store();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            store.rebuild(A, LOC, &PanickingView);
        }));
        assert!(result.is_err());

        assert_eq!(store.rebuild(A, LOC, &StaticView(Vec::new())), RebuildOutcome::Rebuilt);
        assert_eq!(sink.count(DiagnosticKind::RecursiveRebuild), 0);
    }

    #[test]
    fn current_follows_the_bound_actor() {
        let (store, _) = store();
        let stack = ContextStack::new();
        let view = StaticView(vec![wood(4, None)]);
        assert!(store.current(&stack, LOC, &view).is_none());

        let _scope = stack.enter(Some(B), None);
        let index = store.current(&stack, LOC, &view);
        assert_eq!(index.as_ref().map(|index| index.actor()), Some(B));
        assert!(index.is_some_and(|index| index.is_haulable(EntityId(4))));
    }

    #[test]
    fn refresh_runs_only_on_the_interval() {
        let (store, _) = store();
        let view = StaticView(vec![wood(8, None)]);
        drop(store.get(A, LOC, &empty()));
        drop(store.get(B, LOC, &empty()));

        assert_eq!(store.refresh_due(LOC, Tick(3), 5, &view), 0);
        assert!(!store.get(A, LOC, &view).is_haulable(EntityId(8)));

        assert_eq!(store.refresh_due(LOC, Tick(5), 5, &view), 2);
        assert!(store.get(A, LOC, &view).is_haulable(EntityId(8)));
        assert_eq!(store.get(B, LOC, &view).last_refresh(), Some(Tick(5)));
        assert_eq!(store.refresh_due(LOC, Tick(10), 0, &view), 0);
    }

    #[test]
    fn get_builds_only_once() {
        let (store, _) = store();
        let view = StaticView(vec![wood(2, Some(A))]);
        assert_eq!(store.get(A, LOC, &view).resource(ResourceKind::Wood), 4);

        store.notify_mutation(LOC, &MutationEvent::ThingDespawned(wood(2, Some(A))));
        let index = store.get(A, LOC, &view);
        assert_eq!(index.resource(ResourceKind::Wood), 0);
        assert_eq!(index.last_applied(), 1);
    }
}
