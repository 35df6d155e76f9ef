//! Dispatcher-facing bundle of the core components.
//!
//! A dispatcher wraps every simulation operation it invokes on behalf of an
//! actor in one of the `run_*` methods. Scopes are entered before the
//! operation and released after it on every exit path.
use std::fmt;

use crate::config::LockstepConfig;
use crate::context::ContextStack;
use crate::diagnostics::Diagnostics;
use crate::gate::{CommandGate, TickGate};
use crate::ids::{AllocError, IdAllocator, IdAssignment, OverflowRequest, OverflowSink, OwnerKey};
use crate::rng::SimRng;
use crate::shadow::{MutationEvent, ShadowStore, WorldView};
use crate::state::{ActorId, EntityLocator, EntityRef, LocationId, Tick};

/// Core components of one replica.
pub struct Engine<G> {
    config: LockstepConfig,
    diagnostics: Diagnostics,
    stack: ContextStack,
    ids: IdAllocator,
    rng: SimRng,
    shadows: ShadowStore,
    gate: G,
}

impl<G: TickGate> Engine<G> {
    pub fn builder(gate: G) -> EngineBuilder<G> {
        EngineBuilder::new(gate)
    }

    /// Runs `op` with `actor` (and `entity`) bound on the context stack.
    pub fn run_as<R>(
        &self,
        actor: Option<ActorId>,
        entity: Option<EntityRef>,
        op: impl FnOnce(&Self) -> R,
    ) -> R {
        let _scope = self.stack.enter(actor, entity);
        op(self)
    }

    /// Runs `op` in the context of `entity`'s owner.
    pub fn run_for_entity<R>(&self, entity: EntityRef, op: impl FnOnce(&Self) -> R) -> R {
        let _scope = self.stack.enter_for(entity);
        op(self)
    }

    /// Like [`Engine::run_for_entity`], with the generator reseeded for
    /// `entity` at the current tick and restored afterwards.
    pub fn run_attributed<R>(&self, entity: EntityRef, op: impl FnOnce(&Self) -> R) -> R {
        let _scope = self.stack.enter_for(entity);
        let _rand = self.rng.scope_for(entity.id, self.gate.current_tick());
        op(self)
    }

    /// Assigns an id from `owner`'s block, deferred outside replicated phases.
    pub fn allocate_id(&self, owner: OwnerKey) -> Result<IdAssignment, AllocError> {
        self.ids.allocate(owner, self.gate.phase())
    }

    pub fn notify_mutation(&self, location: LocationId, event: &MutationEvent) -> u64 {
        self.shadows.notify_mutation(location, event)
    }

    /// Current actor, reporting a missing binding during ticks.
    pub fn current_actor(&self) -> Option<ActorId> {
        self.stack.current_actor_checked(&self.gate)
    }

    pub fn current_location<L>(&self, locator: &L) -> Option<LocationId>
    where
        L: EntityLocator + ?Sized,
    {
        self.stack.current_location(locator)
    }

    /// Periodic shadow refresh for `location`; runs only while ticking.
    pub fn refresh_shadows<V>(&self, location: LocationId, view: &V) -> usize
    where
        V: WorldView + ?Sized,
    {
        if !self.gate.is_ticking() {
            return 0;
        }
        self.shadows.refresh_due(
            location,
            self.gate.current_tick(),
            self.config.shadow_refresh_interval,
            view,
        )
    }

    pub fn config(&self) -> &LockstepConfig {
        &self.config
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn stack(&self) -> &ContextStack {
        &self.stack
    }

    pub fn ids(&self) -> &IdAllocator {
        &self.ids
    }

    pub fn rng(&self) -> &SimRng {
        &self.rng
    }

    pub fn shadows(&self) -> &ShadowStore {
        &self.shadows
    }

    pub fn gate(&self) -> &G {
        &self.gate
    }
}

impl<C> Engine<CommandGate<C>> {
    /// Runs `f` as the body of `tick`.
    pub fn run_tick<R>(&self, tick: Tick, f: impl FnOnce(&Self) -> R) -> R {
        let _ticking = self.gate.begin_tick(tick);
        self.rng.set_tick(tick);
        f(self)
    }

    /// Replays the commands buffered for `tick` in submission order.
    pub fn replay_commands(&self, tick: Tick, mut apply: impl FnMut(&Self, C)) -> usize {
        self.gate.replay(tick, |command| apply(self, command))
    }
}

impl<G: TickGate> fmt::Debug for Engine<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("tick", &self.gate.current_tick())
            .field("phase", &self.gate.phase())
            .field("stack", &self.stack)
            .field("ids", &self.ids)
            .field("rng", &self.rng)
            .field("shadows", &self.shadows)
            .finish()
    }
}

/// Builder for [`Engine`].
pub struct EngineBuilder<G> {
    gate: G,
    config: LockstepConfig,
    diagnostics: Option<Diagnostics>,
    stack: Option<ContextStack>,
    overflow_sink: Option<Box<dyn OverflowSink>>,
}

impl<G: TickGate> EngineBuilder<G> {
    fn new(gate: G) -> Self {
        Self {
            gate,
            config: LockstepConfig::default(),
            diagnostics: None,
            stack: None,
            overflow_sink: None,
        }
    }

    pub fn config(mut self, config: LockstepConfig) -> Self {
        self.config = config;
        self
    }

    pub fn diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    /// Uses an existing stack instead of creating one.
    pub fn stack(mut self, stack: ContextStack) -> Self {
        self.stack = Some(stack);
        self
    }

    pub fn overflow_sink(mut self, sink: impl OverflowSink + 'static) -> Self {
        self.overflow_sink = Some(Box::new(sink));
        self
    }

    pub fn build(self) -> Engine<G> {
        let diagnostics = self.diagnostics.unwrap_or_default();
        let stack = self.stack.unwrap_or_else(|| {
            ContextStack::with_diagnostics(diagnostics.clone(), self.config.scope_policy)
        });

        let sink = self.overflow_sink;
        let ids = IdAllocator::new(
            move |request: OverflowRequest| match &sink {
                Some(sink) => sink.request(request),
                None => tracing::warn!(
                    target: "lockstep::ids",
                    owner = %request.owner,
                    "no overflow sink configured; replacement block will not arrive"
                ),
            },
            diagnostics.clone(),
        )
        .with_threshold_percent(self.config.overflow_threshold_percent);

        let rng =
            SimRng::from_config(&self.config, diagnostics.clone()).with_context(stack.clone());
        let shadows = ShadowStore::new(diagnostics.clone());

        Engine {
            config: self.config,
            diagnostics,
            stack,
            ids,
            rng,
            shadows,
            gate: self.gate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::ExecutionPhase;
    use crate::ids::IdRange;
    use crate::state::EntityId;

    fn engine() -> Engine<CommandGate<u32>> {
        Engine::builder(CommandGate::new()).build()
    }

    #[test]
    fn run_as_releases_scope_after_failure() {
        let engine = engine();
        let result: Result<(), &str> = engine.run_as(Some(ActorId(1)), None, |engine| {
            assert_eq!(engine.stack().current_actor(), Some(ActorId(1)));
            Err("operation failed")
        });

        assert!(result.is_err());
        assert_eq!(engine.stack().depth(), 0);
    }

    #[test]
    fn attributed_runs_draw_the_same_values_regardless_of_history() {
        let pawn = EntityRef::spawned(EntityId(3), LocationId(1), Some(ActorId(1)));
        let first = engine();
        let second = engine();
        second.rng().next_u64();
        second.rng().next_u64();

        let draw = |engine: &Engine<CommandGate<u32>>| {
            engine.run_tick(Tick(40), |engine| {
                engine.run_attributed(pawn, |engine| engine.rng().roll_d100())
            })
        };

        assert_eq!(draw(&first), draw(&second));
        assert_eq!(first.rng().depth(), 0);
        assert_eq!(second.stack().depth(), 0);
    }

    #[test]
    fn ids_are_assigned_only_during_ticks_and_replays() {
        let engine = engine();
        engine
            .ids()
            .install_block(OwnerKey::Global, IdRange::new(100, 10))
            .unwrap();

        assert_eq!(engine.gate().phase(), ExecutionPhase::Interactive);
        assert_eq!(engine.allocate_id(OwnerKey::Global), Ok(IdAssignment::Deferred));

        let ticked = engine.run_tick(Tick(1), |engine| engine.allocate_id(OwnerKey::Global));
        assert_eq!(ticked, Ok(IdAssignment::Assigned(100)));

        engine.gate().submit(Tick(2), 7);
        let mut replayed = Vec::new();
        engine.replay_commands(Tick(2), |engine, command| {
            replayed.push((command, engine.allocate_id(OwnerKey::Global)));
        });
        assert_eq!(replayed, vec![(7, Ok(IdAssignment::Assigned(101)))]);
    }
}
