//! Replica worker running one [`Simulation`] on a dedicated thread.
//!
//! The lockstep core is `!Send`, so the simulation is built inside the
//! thread and never leaves it. The coordinator drives it tick by tick with
//! [`ReplicaCommand::Step`].

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::thread;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use lockstep_core::{
    CommandGate, Diagnostic, DiagnosticSink, Diagnostics, Engine, IdBlock, IdRange, LockstepConfig,
    OverflowRequest, OwnerKey, RandTrace, Tick, TracingSink,
};

use super::{AuthorityCommand, BlockGrant, ReplicaId};
use crate::api::{Result, RuntimeError};
use crate::events::{DiagnosticEvent, Event, EventBus};
use crate::sim::{ScenarioConfig, SimCommand, Simulation, TickOutcome};

/// Messages accepted by a replica worker.
pub enum ReplicaCommand {
    /// Install `grants`, replay `commands` and run `tick`.
    Step {
        tick: Tick,
        grants: Vec<BlockGrant>,
        commands: Vec<SimCommand>,
        reply: oneshot::Sender<Result<TickReport>>,
    },
    /// Copy of the replica's random draw trace, if tracing is enabled.
    RandTrace {
        reply: oneshot::Sender<Option<RandTrace>>,
    },
}

/// What a replica reports after each tick.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TickReport {
    pub replica: ReplicaId,
    pub tick: Tick,
    pub digest: [u8; 32],
    pub rand_digest: Option<[u8; 32]>,
    pub outcome: TickOutcome,
    pub overflow_requests: Vec<OverflowRequest>,
    pub blocks: Vec<IdBlock>,
}

/// Everything a replica thread needs to build its simulation.
#[derive(Clone)]
pub struct ReplicaSpec {
    pub id: ReplicaId,
    pub lockstep: LockstepConfig,
    pub scenario: ScenarioConfig,
    pub initial_blocks: Vec<(OwnerKey, IdRange)>,
    pub authority: mpsc::UnboundedSender<AuthorityCommand>,
    pub event_bus: EventBus,
}

/// Starts a replica thread. `ready` resolves once the scenario is laid out.
pub fn spawn_replica(
    spec: ReplicaSpec,
    command_rx: mpsc::Receiver<ReplicaCommand>,
) -> Result<(thread::JoinHandle<()>, oneshot::Receiver<Result<()>>)> {
    let id = spec.id;
    let (ready_tx, ready_rx) = oneshot::channel();
    let handle = thread::Builder::new()
        .name(id.to_string())
        .spawn(move || match ReplicaWorker::new(spec) {
            Ok(worker) => {
                if ready_tx.send(Ok(())).is_ok() {
                    worker.run(command_rx);
                }
            }
            Err(err) => {
                let _ = ready_tx.send(Err(err));
            }
        })
        .map_err(|source| RuntimeError::ReplicaStart { replica: id, source })?;
    Ok((handle, ready_rx))
}

/// Forwards core diagnostics to tracing and the event bus.
struct BusSink {
    replica: ReplicaId,
    tick: Rc<Cell<Tick>>,
    event_bus: EventBus,
}

impl DiagnosticSink for BusSink {
    fn report(&self, diagnostic: &Diagnostic) {
        TracingSink.report(diagnostic);
        self.event_bus.publish(Event::Diagnostic(DiagnosticEvent {
            replica: self.replica,
            tick: self.tick.get(),
            diagnostic: diagnostic.clone(),
        }));
    }
}

struct ReplicaWorker {
    id: ReplicaId,
    sim: Simulation,
    tick: Rc<Cell<Tick>>,
    requests: Rc<RefCell<Vec<OverflowRequest>>>,
}

impl ReplicaWorker {
    fn new(spec: ReplicaSpec) -> Result<Self> {
        let ReplicaSpec {
            id,
            lockstep,
            scenario,
            initial_blocks,
            authority,
            event_bus,
        } = spec;

        let tick = Rc::new(Cell::new(Tick::ZERO));
        let requests = Rc::new(RefCell::new(Vec::new()));
        let recorded = Rc::clone(&requests);

        let diagnostics = Diagnostics::new(BusSink {
            replica: id,
            tick: Rc::clone(&tick),
            event_bus,
        });
        let engine = Engine::builder(CommandGate::new())
            .config(lockstep)
            .diagnostics(diagnostics)
            .overflow_sink(move |request: OverflowRequest| {
                recorded.borrow_mut().push(request);
                if authority
                    .send(AuthorityCommand::Overflow { replica: id, request })
                    .is_err()
                {
                    warn!(
                        target: "runtime::replica",
                        %id,
                        "id authority gone; overflow request dropped"
                    );
                }
            })
            .build();

        for (owner, range) in initial_blocks {
            engine.ids().install_block(owner, range)?;
        }
        let sim = Simulation::new(engine, scenario)?;

        debug!(
            target: "runtime::replica",
            %id,
            things = sim.world().thing_count(),
            "replica ready"
        );

        Ok(Self {
            id,
            sim,
            tick,
            requests,
        })
    }

    fn run(self, mut command_rx: mpsc::Receiver<ReplicaCommand>) {
        while let Some(command) = command_rx.blocking_recv() {
            match command {
                ReplicaCommand::Step {
                    tick,
                    grants,
                    commands,
                    reply,
                } => {
                    let report = self.step(tick, grants, commands);
                    if reply.send(report).is_err() {
                        debug!(
                            target: "runtime::replica",
                            id = %self.id,
                            "Step reply channel closed (caller dropped)"
                        );
                    }
                }
                ReplicaCommand::RandTrace { reply } => {
                    let trace = self
                        .sim
                        .engine()
                        .rng()
                        .trace_log()
                        .map(|trace| RandTrace::clone(&trace));
                    if reply.send(trace).is_err() {
                        debug!(
                            target: "runtime::replica",
                            id = %self.id,
                            "RandTrace reply channel closed (caller dropped)"
                        );
                    }
                }
            }
        }
        debug!(target: "runtime::replica", id = %self.id, "replica stopped");
    }

    fn step(
        &self,
        tick: Tick,
        grants: Vec<BlockGrant>,
        commands: Vec<SimCommand>,
    ) -> Result<TickReport> {
        self.tick.set(tick);

        for grant in grants {
            if let Err(err) = self.sim.install_block(grant.owner, grant.range) {
                warn!(
                    target: "runtime::replica",
                    id = %self.id,
                    owner = %grant.owner,
                    error = %err,
                    "rejected granted id block"
                );
            }
        }
        for command in commands {
            self.sim.submit(tick, command);
        }

        let outcome = self.sim.step(tick);
        let digest = self.sim.digest().map_err(RuntimeError::Digest)?;
        let rand_digest = self.sim.engine().rng().trace_log().map(|trace| trace.digest());

        Ok(TickReport {
            replica: self.id,
            tick,
            digest,
            rand_digest,
            outcome,
            overflow_requests: std::mem::take(&mut *self.requests.borrow_mut()),
            blocks: self.sim.engine().ids().blocks(),
        })
    }
}
