//! Reference colony simulation driven through the lockstep core.
//!
//! Every replica runs one [`Simulation`]. All state changes go through the
//! replica's [`Engine`], so pawn behaviour, command replay and area upkeep
//! are attributed to the right faction and draw from entity-seeded
//! randomness.
mod command;
mod scenario;

pub use command::SimCommand;
pub use scenario::ScenarioConfig;

use std::cell::RefCell;

use lockstep_core::{
    ActorId, AllocError, CommandGate, Engine, EntityId, EntityRef, IdAssignment, IdBlock, IdRange,
    LocationId, MemoryWorld, MutationEvent, OwnerKey, ResourceKind, STREAM_SPAWN, ShadowIndex,
    ThingInfo, ThingKind, Tick, TickGate, WorldError, mix_seed, unanimous_owner,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Replica engine specialised for [`SimCommand`]s.
pub type SimEngine = Engine<CommandGate<SimCommand>>;

/// Buildings within this distance of a cell decide who tends it.
pub const TENDING_RADIUS: u32 = 3;

#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    World(#[from] WorldError),

    #[error(transparent)]
    Alloc(#[from] AllocError),

    #[error("id for {owner} deferred outside a replicated phase")]
    Deferred { owner: OwnerKey },
}

/// Result of one simulated tick.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub commands: usize,
    pub rejected: usize,
    pub spawned: usize,
    pub cleaned: usize,
    pub refreshed: usize,
}

/// One replica's world and the engine that mutates it.
pub struct Simulation {
    engine: SimEngine,
    world: RefCell<MemoryWorld>,
    scenario: ScenarioConfig,
}

impl Simulation {
    /// Lays out the scenario inside tick zero.
    ///
    /// The engine must already hold a global id block; pawns and starting
    /// buildings draw their ids from it.
    pub fn new(engine: SimEngine, scenario: ScenarioConfig) -> Result<Self, SimError> {
        let mut world = MemoryWorld::new();
        for location in scenario.locations() {
            world.add_location(location);
        }

        let sim = Self {
            engine,
            world: RefCell::new(world),
            scenario,
        };
        sim.engine.run_tick(Tick::ZERO, |engine| sim.lay_out(engine))?;
        Ok(sim)
    }

    fn lay_out(&self, engine: &SimEngine) -> Result<(), SimError> {
        for actor in self.scenario.actors() {
            let location = self.scenario.home_of(actor);
            let base = self.scenario.base_cell(actor);

            engine.run_as(Some(actor), None, |engine| -> Result<(), SimError> {
                let id = self.assign_id(engine, OwnerKey::Global)?;
                let building = ThingInfo::new(id, Some(actor), base, ThingKind::Building);
                self.spawn(engine, location, building)?;

                for dx in -1..=1 {
                    for dy in -1..=1 {
                        let event = self.world.borrow_mut().set_home_cell(
                            actor,
                            location,
                            base.offset(dx, dy),
                            true,
                        )?;
                        engine.notify_mutation(location, &event);
                    }
                }

                for n in 0..self.scenario.pawns_per_faction {
                    let id = self.assign_id(engine, OwnerKey::Global)?;
                    let dx = i32::try_from(n).unwrap_or(i32::MAX).saturating_add(1);
                    let cell = base.offset(dx, 0);
                    let pawn = ThingInfo::new(id, Some(actor), cell, ThingKind::Pawn);
                    self.spawn(engine, location, pawn)?;
                }
                Ok(())
            })?;
        }

        let world = self.world.borrow();
        for location in self.scenario.locations() {
            for actor in self.scenario.actors() {
                drop(engine.shadows().get(actor, location, &*world));
            }
        }
        Ok(())
    }

    /// Runs `tick`: replays its commands, lets every pawn act, tends home
    /// areas and refreshes indices that are due.
    pub fn step(&self, tick: Tick) -> TickOutcome {
        self.engine.run_tick(tick, |engine| {
            let mut rejected = 0;
            let commands = engine.replay_commands(tick, |engine, command| {
                if let Err(err) = self.apply(engine, &command) {
                    rejected += 1;
                    tracing::debug!(
                        target: "runtime::sim",
                        %tick,
                        ?command,
                        error = %err,
                        "command rejected"
                    );
                }
            });
            let mut outcome = TickOutcome {
                commands,
                rejected,
                ..TickOutcome::default()
            };

            for pawn in self.pawns() {
                let spawned = engine.run_attributed(pawn, |engine| self.behave(engine, pawn));
                match spawned {
                    Ok(spawned) => outcome.spawned += usize::from(spawned),
                    Err(err) => tracing::debug!(
                        target: "runtime::sim",
                        %tick,
                        pawn = %pawn.id,
                        error = %err,
                        "pawn idles"
                    ),
                }
            }

            let locations: Vec<LocationId> = self.world.borrow().locations().collect();
            for location in locations {
                outcome.cleaned += self.tend(engine, location);
                let world = self.world.borrow();
                outcome.refreshed += engine.refresh_shadows(location, &*world);
            }

            outcome
        })
    }

    /// Buffers `command` for replay at `tick`.
    pub fn submit(&self, tick: Tick, command: SimCommand) {
        self.engine.gate().submit(tick, command);
    }

    pub fn install_block(&self, owner: OwnerKey, range: IdRange) -> Result<(), AllocError> {
        self.engine.ids().install_block(owner, range)
    }

    pub fn engine(&self) -> &SimEngine {
        &self.engine
    }

    pub fn world(&self) -> std::cell::Ref<'_, MemoryWorld> {
        self.world.borrow()
    }

    pub fn scenario(&self) -> &ScenarioConfig {
        &self.scenario
    }

    /// SHA-256 over the world, the id blocks and every shadow index.
    pub fn digest(&self) -> Result<[u8; 32], bincode::Error> {
        #[derive(Serialize)]
        struct DigestView<'a> {
            world: &'a MemoryWorld,
            blocks: Vec<IdBlock>,
            shadows: Vec<ShadowIndex>,
        }

        let world = self.world.borrow();
        let mut shadows = Vec::new();
        self.engine.shadows().for_each(|index| shadows.push(index.clone()));
        let view = DigestView {
            world: &world,
            blocks: self.engine.ids().blocks(),
            shadows,
        };
        let bytes = bincode::serialize(&view)?;
        Ok(Sha256::digest(&bytes).into())
    }

    fn apply(&self, engine: &SimEngine, command: &SimCommand) -> Result<(), SimError> {
        match *command {
            SimCommand::Zone {
                actor,
                location,
                cell,
                included,
            } => engine.run_as(Some(actor), None, |engine| -> Result<(), SimError> {
                let event = self
                    .world
                    .borrow_mut()
                    .set_home_cell(actor, location, cell, included)?;
                engine.notify_mutation(location, &event);
                Ok(())
            }),
            SimCommand::Build {
                actor,
                location,
                cell,
            } => engine.run_as(Some(actor), None, |engine| -> Result<(), SimError> {
                let id = self.assign_id(engine, OwnerKey::Location(location))?;
                let building = ThingInfo::new(id, Some(actor), cell, ThingKind::Building);
                self.spawn(engine, location, building)
            }),
            SimCommand::Gift { thing, to } => {
                let target = self
                    .world
                    .borrow()
                    .entity_ref(thing)
                    .ok_or(WorldError::UnknownEntity(thing))?;
                engine.run_for_entity(target, |engine| -> Result<(), SimError> {
                    let (location, event) = self.world.borrow_mut().set_owner(thing, Some(to))?;
                    engine.notify_mutation(location, &event);
                    Ok(())
                })
            }
            SimCommand::Travel { pawn, to } => {
                let target = self
                    .world
                    .borrow()
                    .entity_ref(pawn)
                    .ok_or(WorldError::UnknownEntity(pawn))?;
                engine.run_for_entity(target, |engine| -> Result<(), SimError> {
                    let events = self.world.borrow_mut().relocate(pawn, to)?;
                    for (location, event) in &events {
                        engine.notify_mutation(*location, event);
                    }
                    Ok(())
                })
            }
            SimCommand::Dump { location, cell } => {
                engine.run_as(None, None, |engine| -> Result<(), SimError> {
                    let id = self.assign_id(engine, OwnerKey::Location(location))?;
                    self.spawn(engine, location, ThingInfo::new(id, None, cell, ThingKind::Filth))
                })
            }
        }
    }

    /// One pawn's turn. Returns true if it put something into the world.
    fn behave(&self, engine: &SimEngine, pawn: EntityRef) -> Result<bool, SimError> {
        let (Some(location), Some(actor)) = (pawn.location, engine.current_actor()) else {
            return Ok(false);
        };
        let Some(me) = self.world.borrow().thing(pawn.id) else {
            return Ok(false);
        };

        let rng = engine.rng();
        let roll = rng.roll_d100();
        if roll <= 25 {
            let last = ResourceKind::ALL.len() as u32 - 1;
            let resource = ResourceKind::ALL[rng.range(0, last) as usize];
            let count = rng.range(1, 5);
            let id = self.assign_id(engine, OwnerKey::Location(location))?;
            let cell = {
                let tick = engine.gate().current_tick();
                let seed = mix_seed(rng.world_seed(), tick, id, STREAM_SPAWN);
                let _placement = rng.seeded_scope(seed);
                let dx = rng.range(0, 2) as i32 - 1;
                let dy = rng.range(0, 2) as i32 - 1;
                me.cell.offset(dx, dy)
            };
            self.spawn(
                engine,
                location,
                ThingInfo::new(id, Some(actor), cell, ThingKind::Item { resource, count }),
            )?;
            Ok(true)
        } else if roll <= 35 {
            let id = self.assign_id(engine, OwnerKey::Location(location))?;
            self.spawn(engine, location, ThingInfo::new(id, None, me.cell, ThingKind::Filth))?;
            Ok(true)
        } else if roll <= 60 {
            self.haul(engine, actor, location)?;
            Ok(false)
        } else {
            Ok(false)
        }
    }

    /// Claims the first unowned haulable the faction's index knows about.
    fn haul(
        &self,
        engine: &SimEngine,
        actor: ActorId,
        location: LocationId,
    ) -> Result<(), SimError> {
        let candidate = {
            let world = self.world.borrow();
            let index = engine.shadows().get(actor, location, &*world);
            index
                .haulables()
                .find(|id| world.thing(*id).is_some_and(|thing| thing.owner.is_none()))
        };
        if let Some(thing) = candidate {
            let (location, event) = self.world.borrow_mut().set_owner(thing, Some(actor))?;
            engine.notify_mutation(location, &event);
        }
        Ok(())
    }

    /// Cleans filth lying in a home area whose nearby buildings agree on
    /// an owner. Contested cells are left alone.
    fn tend(&self, engine: &SimEngine, location: LocationId) -> usize {
        let filth = self
            .world
            .borrow()
            .things_where(location, |thing| thing.kind == ThingKind::Filth);

        let mut cleaned = 0;
        for thing in filth {
            let owners = self
                .world
                .borrow()
                .building_owners_near(location, thing.cell, TENDING_RADIUS);
            let Some(actor) = unanimous_owner(owners) else {
                continue;
            };

            let result = engine.run_as(Some(actor), None, |engine| -> Result<bool, SimError> {
                let tended = {
                    let world = self.world.borrow();
                    engine
                        .shadows()
                        .current(engine.stack(), location, &*world)
                        .is_some_and(|index| index.filth().any(|id| id == thing.id))
                };
                if !tended {
                    return Ok(false);
                }
                let (location, event) = self.world.borrow_mut().despawn(thing.id)?;
                engine.notify_mutation(location, &event);
                Ok(true)
            });
            match result {
                Ok(true) => cleaned += 1,
                Ok(false) => {}
                Err(err) => tracing::debug!(
                    target: "runtime::sim",
                    %location,
                    filth = %thing.id,
                    error = %err,
                    "tending failed"
                ),
            }
        }
        cleaned
    }

    fn pawns(&self) -> Vec<EntityRef> {
        let world = self.world.borrow();
        world
            .locations()
            .flat_map(|location| {
                world
                    .things_where(location, |thing| thing.kind == ThingKind::Pawn)
                    .into_iter()
                    .map(move |thing| thing.as_entity_ref(location))
            })
            .collect()
    }

    fn assign_id(&self, engine: &SimEngine, owner: OwnerKey) -> Result<EntityId, SimError> {
        match engine.allocate_id(owner)? {
            IdAssignment::Assigned(id) => Ok(EntityId(id)),
            IdAssignment::Deferred => Err(SimError::Deferred { owner }),
        }
    }

    fn spawn(
        &self,
        engine: &SimEngine,
        location: LocationId,
        thing: ThingInfo,
    ) -> Result<(), SimError> {
        let event: MutationEvent = self.world.borrow_mut().spawn(location, thing)?;
        engine.notify_mutation(location, &event);
        Ok(())
    }
}
