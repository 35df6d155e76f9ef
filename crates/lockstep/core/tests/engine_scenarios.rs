use std::cell::RefCell;
use std::rc::Rc;

use lockstep_core::{
    ActorId, AllocError, Cell, CollectingSink, CommandGate, DiagnosticKind, Diagnostics, Engine,
    EntityId, IdAssignment, IdRange, LocationId, LockstepConfig, MemoryWorld, OverflowRequest,
    OwnerKey, RandTraceConfig, ResourceKind, ScopePolicy, ThingInfo, ThingKind, Tick,
    WorldView, unanimous_owner,
};

const A: ActorId = ActorId(1);
const B: ActorId = ActorId(2);
const COLONY: LocationId = LocationId(1);
const OUTPOST: LocationId = LocationId(2);

#[derive(Clone, Copy, Debug)]
enum Command {
    Forage { pawn: EntityId },
    Gift { item: EntityId, to: ActorId },
}

struct Replica {
    engine: Engine<CommandGate<Command>>,
    world: RefCell<MemoryWorld>,
    diagnostics: Rc<CollectingSink>,
    requests: Rc<RefCell<Vec<OverflowRequest>>>,
}

impl Replica {
    fn new(seed: u64) -> Self {
        let diagnostics = Rc::new(CollectingSink::new());
        let requests = Rc::new(RefCell::new(Vec::new()));
        let recorded = Rc::clone(&requests);
        let config = LockstepConfig::default()
            .with_world_seed(seed)
            .with_scope_policy(ScopePolicy::Panic)
            .with_rand_trace(RandTraceConfig::enabled());
        let engine = Engine::builder(CommandGate::new())
            .config(config)
            .diagnostics(Diagnostics::new(Rc::clone(&diagnostics)))
            .overflow_sink(move |request: OverflowRequest| recorded.borrow_mut().push(request))
            .build();

        let mut world = MemoryWorld::new();
        world.add_location(COLONY);
        world.add_location(OUTPOST);
        for (id, owner) in [(1, A), (2, B)] {
            let cell = Cell::new(id as i32, 0);
            let pawn = ThingInfo::new(EntityId(id), Some(owner), cell, ThingKind::Pawn);
            world.spawn(COLONY, pawn).unwrap();
        }

        engine
            .ids()
            .install_block(OwnerKey::Location(COLONY), IdRange::new(1_000, 100))
            .unwrap();
        for actor in [A, B] {
            drop(engine.shadows().get(actor, COLONY, &world));
        }

        Self {
            engine,
            world: RefCell::new(world),
            diagnostics,
            requests,
        }
    }

    fn apply(&self, command: Command) {
        let engine = &self.engine;
        match command {
            Command::Forage { pawn } => {
                let Some(pawn) = self.world.borrow().entity_ref(pawn) else {
                    return;
                };
                engine.run_attributed(pawn, |engine| {
                    let count = engine.rng().range(1, 5);
                    let id = match engine.allocate_id(OwnerKey::Location(COLONY)) {
                        Ok(IdAssignment::Assigned(id)) => id,
                        other => panic!("forage must assign an id, got {other:?}"),
                    };
                    let item = ThingInfo::new(
                        EntityId(id),
                        engine.current_actor(),
                        Cell::new(0, id as i32),
                        ThingKind::Item {
                            resource: ResourceKind::Food,
                            count,
                        },
                    );
                    let event = self.world.borrow_mut().spawn(COLONY, item).unwrap();
                    engine.notify_mutation(COLONY, &event);
                });
            }
            Command::Gift { item, to } => {
                let (location, event) = self.world.borrow_mut().set_owner(item, Some(to)).unwrap();
                engine.notify_mutation(location, &event);
            }
        }
    }

    fn run(&self, commands: &[(Tick, Command)], ticks: u64) {
        for (tick, command) in commands {
            self.engine.gate().submit(*tick, *command);
        }
        for tick in 1..=ticks {
            self.engine.run_tick(Tick(tick), |engine| {
                engine.replay_commands(Tick(tick), |_, command| self.apply(command));
            });
        }
    }
}

#[test]
fn replicas_fed_the_same_commands_stay_identical() {
    let commands = [
        (Tick(1), Command::Forage { pawn: EntityId(1) }),
        (Tick(1), Command::Forage { pawn: EntityId(2) }),
        (Tick(2), Command::Gift { item: EntityId(1_000), to: B }),
        (Tick(3), Command::Forage { pawn: EntityId(1) }),
    ];

    let first = Replica::new(0xfeed);
    let second = Replica::new(0xfeed);
    // Local-only draws outside any replicated operation must not matter.
    second.engine.rng().next_u64();

    first.run(&commands, 4);
    second.run(&commands, 4);

    assert_eq!(*first.world.borrow(), *second.world.borrow());
    assert_eq!(first.engine.ids().blocks(), second.engine.ids().blocks());

    let first_trace = first.engine.rng().trace_log().unwrap();
    let second_trace = second.engine.rng().trace_log().unwrap();
    let attributed = |trace: &lockstep_core::RandTrace| {
        trace
            .calls()
            .filter(|call| call.entity.is_some())
            .map(|call| (call.tick, call.actor, call.entity, call.value))
            .collect::<Vec<_>>()
    };
    assert_eq!(
        attributed(&*first_trace),
        attributed(&*second_trace),
        "attributed draws diverged: {} vs {}",
        hex::encode(first_trace.digest()),
        hex::encode(second_trace.digest()),
    );

    assert_eq!(first.diagnostics.reports(), Vec::new());
}

#[test]
fn gift_updates_both_actor_indices() {
    let replica = Replica::new(1);
    replica.run(
        &[
            (Tick(1), Command::Forage { pawn: EntityId(1) }),
            (Tick(2), Command::Gift { item: EntityId(1_000), to: B }),
        ],
        2,
    );

    let food = replica.world.borrow().thing(EntityId(1_000)).unwrap();
    let ThingKind::Item { count, .. } = food.kind else {
        panic!("foraged thing must be an item");
    };

    let shadows = replica.engine.shadows();
    let a = shadows.find(A, COLONY).unwrap();
    let b = shadows.find(B, COLONY).unwrap();
    assert_eq!(a.resource(ResourceKind::Food), 0);
    assert!(!a.is_haulable(EntityId(1_000)));
    assert_eq!(b.resource(ResourceKind::Food), count);
    assert!(b.is_haulable(EntityId(1_000)));
    assert_eq!(a.last_applied(), b.last_applied());
}

#[test]
fn shadow_indices_match_a_fresh_build_after_mutations() {
    let replica = Replica::new(2);
    let commands: Vec<_> = (1..=6)
        .map(|tick| (Tick(tick), Command::Forage { pawn: EntityId(1 + (tick as u32 % 2)) }))
        .collect();
    replica.run(&commands, 6);

    let world = replica.world.borrow();
    for actor in [A, B] {
        let incremental = replica.engine.shadows().find(actor, COLONY).unwrap().clone();
        let rebuilt = lockstep_core::ShadowIndex::build(actor, COLONY, &*world);
        assert_eq!(
            incremental.haulables().collect::<Vec<_>>(),
            rebuilt.haulables().collect::<Vec<_>>()
        );
        for kind in ResourceKind::ALL {
            assert_eq!(incremental.resource(kind), rebuilt.resource(kind));
        }
    }
    assert!(world.things(OUTPOST).is_empty());
}

#[test]
fn block_overflow_is_requested_once_and_exhaustion_is_an_error() {
    let replica = Replica::new(3);
    let owner = OwnerKey::Location(COLONY);
    let engine = &replica.engine;

    let ids: Vec<_> = engine.run_tick(Tick(1), |engine| {
        (0..100)
            .map(|_| engine.allocate_id(owner).unwrap().id().unwrap())
            .collect()
    });
    assert_eq!(ids, (1_000..1_100).collect::<Vec<_>>());
    assert_eq!(replica.requests.borrow().len(), 1);
    assert_eq!(replica.requests.borrow()[0].exhausted_start, 1_000);

    let exhausted = engine.run_tick(Tick(2), |engine| engine.allocate_id(owner));
    assert!(matches!(exhausted, Err(AllocError::Exhausted { start: 1_000, .. })));
    assert_eq!(replica.diagnostics.count(DiagnosticKind::IdBlockExhausted), 1);

    engine.ids().install_block(owner, IdRange::new(5_000, 100)).unwrap();
    let next = engine.run_tick(Tick(3), |engine| engine.allocate_id(owner));
    assert_eq!(next, Ok(IdAssignment::Assigned(5_000)));
    assert_eq!(replica.diagnostics.count(DiagnosticKind::BlockReassigned), 0);
}

#[test]
fn contested_border_has_no_acting_faction() {
    let mut world = MemoryWorld::new();
    world.add_location(COLONY);
    world
        .spawn(COLONY, ThingInfo::new(EntityId(10), Some(A), Cell::new(0, 0), ThingKind::Building))
        .unwrap();
    world
        .spawn(COLONY, ThingInfo::new(EntityId(11), None, Cell::new(1, 0), ThingKind::Building))
        .unwrap();

    let near = world.building_owners_near(COLONY, Cell::new(1, 1), 2);
    assert_eq!(unanimous_owner(near), Some(A));

    world
        .spawn(COLONY, ThingInfo::new(EntityId(12), Some(B), Cell::new(2, 2), ThingKind::Building))
        .unwrap();
    let near = world.building_owners_near(COLONY, Cell::new(1, 1), 2);
    assert_eq!(unanimous_owner(near), None);
}

#[test]
fn relocated_pawn_keeps_its_pushed_location() {
    let replica = Replica::new(4);
    let pawn = replica.world.borrow().entity_ref(EntityId(1)).unwrap();

    replica.engine.run_for_entity(pawn, |engine| {
        let moved = replica.world.borrow_mut().relocate(EntityId(1), OUTPOST).unwrap();
        for (location, event) in &moved {
            engine.notify_mutation(*location, event);
        }
        assert_eq!(engine.current_location(&*replica.world.borrow()), Some(COLONY));
    });

    assert_eq!(replica.diagnostics.count(DiagnosticKind::EntityRelocated), 1);
    assert_eq!(replica.engine.stack().depth(), 0);
}
