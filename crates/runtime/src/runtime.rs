//! High-level runtime orchestrator.
//!
//! The runtime owns the id authority task and one thread per replica. It
//! advances every replica through the same ticks with the same commands and
//! block grants, then compares their state digests.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::thread;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use lockstep_core::{IdRange, LockstepConfig, OwnerKey, RandTrace, Tick};

use crate::api::{Result, RuntimeError, RuntimeHandle};
use crate::events::{DivergenceEvent, Event, EventBus, TickEvent};
use crate::repository::{DigestRecord, DigestRepository, FileDigestLog, InMemoryDigestRepository};
use crate::sim::{ScenarioConfig, SimCommand};
use crate::workers::{
    AuthorityCommand, BlockGrant, IdAuthority, ReplicaCommand, ReplicaId, ReplicaSpec, TickReport,
    spawn_replica,
};

/// File name of the digest log inside [`RuntimeConfig::digest_log_dir`].
pub const DIGEST_LOG_FILE: &str = "digests.log";

/// Runtime configuration shared across the orchestrator and workers.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of replicas run side by side.
    pub replicas: usize,
    pub scenario: ScenarioConfig,
    /// Shared by every replica unless overridden on the builder.
    pub lockstep: LockstepConfig,
    /// First id the authority hands out.
    pub first_id: u32,
    pub id_block_size: u32,
    /// Ticks between the tick a grant is issued in and the tick it is
    /// installed at. At least one.
    pub grant_delay_ticks: u64,
    /// Stop with [`RuntimeError::Diverged`] when digests disagree.
    pub halt_on_divergence: bool,
    /// Persist per-tick digests under this directory.
    pub digest_log_dir: Option<PathBuf>,
    pub event_buffer_size: usize,
    pub command_buffer_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            replicas: 2,
            scenario: ScenarioConfig::default(),
            lockstep: LockstepConfig::default(),
            first_id: 1,
            id_block_size: 1_000,
            grant_delay_ticks: 2,
            halt_on_divergence: true,
            digest_log_dir: None,
            event_buffer_size: 100,
            command_buffer_size: 32,
        }
    }
}

/// Outcome of one tick across all replicas.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub tick: Tick,
    /// Digest of the first replica, hex-encoded.
    pub digest: String,
    pub diverged: bool,
    pub commands: usize,
    pub rejected: usize,
    pub spawned: usize,
    pub cleaned: usize,
    pub grants_installed: usize,
    pub grants_issued: usize,
}

/// Totals over a [`Runtime::run_ticks`] call.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub ticks: u64,
    pub last_tick: Tick,
    pub digest: String,
    pub commands: usize,
    pub spawned: usize,
    pub cleaned: usize,
    pub grants: usize,
    pub divergent_ticks: Vec<Tick>,
}

impl RunSummary {
    /// Folds one tick into the totals.
    pub fn record(&mut self, tick: TickSummary) {
        self.ticks += 1;
        self.last_tick = tick.tick;
        self.commands += tick.commands;
        self.spawned += tick.spawned;
        self.cleaned += tick.cleaned;
        self.grants += tick.grants_issued;
        if tick.diverged {
            self.divergent_ticks.push(tick.tick);
        }
        self.digest = tick.digest;
    }
}

struct ReplicaLink {
    id: ReplicaId,
    command_tx: mpsc::Sender<ReplicaCommand>,
    thread: thread::JoinHandle<()>,
}

/// Main runtime that drives replicas in lockstep
///
/// Design: Runtime owns workers and coordinates execution.
/// [`RuntimeHandle`] provides a cloneable façade for clients.
pub struct Runtime {
    config: RuntimeConfig,
    handle: RuntimeHandle,
    event_bus: EventBus,
    command_rx: mpsc::Receiver<SimCommand>,
    queued: Vec<SimCommand>,

    replicas: Vec<ReplicaLink>,
    authority_tx: mpsc::UnboundedSender<AuthorityCommand>,
    authority_handle: JoinHandle<()>,

    tick: Tick,
    scheduled: BTreeMap<Tick, Vec<BlockGrant>>,
    digests: Box<dyn DigestRepository>,
    last_reports: Vec<TickReport>,
}

impl Runtime {
    /// Create a new runtime builder
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Get a cloneable handle to this runtime
    pub fn handle(&self) -> RuntimeHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Last tick every replica completed.
    pub fn tick(&self) -> Tick {
        self.tick
    }

    /// Per-replica reports of the last tick, in replica order.
    pub fn last_reports(&self) -> &[TickReport] {
        &self.last_reports
    }

    /// Grants issued but not yet installed.
    pub fn pending_grants(&self) -> usize {
        self.scheduled.values().map(Vec::len).sum()
    }

    /// Every digest recorded so far.
    pub fn digest_records(&mut self) -> Result<Vec<DigestRecord>> {
        self.digests.flush()?;
        Ok(self.digests.load_all()?)
    }

    /// Queues a command for the next tick, bypassing the handle's bounded
    /// buffer. Replayed ahead of anything submitted through the handle.
    pub fn enqueue(&mut self, command: SimCommand) {
        self.queued.push(command);
    }

    /// Commands waiting for the next tick.
    pub fn queued_commands(&self) -> usize {
        self.queued.len() + self.command_rx.len()
    }

    /// Runs the next tick on every replica.
    ///
    /// Commands queued through [`Runtime::enqueue`] or the handle are
    /// replayed at this tick. Grants
    /// issued for overflow requests raised during the tick are installed
    /// `grant_delay_ticks` later.
    pub async fn step(&mut self) -> Result<TickSummary> {
        let tick = self.tick.next();
        let commands = self.drain_commands();
        let grants = self.scheduled.remove(&tick).unwrap_or_default();

        let mut pending = Vec::with_capacity(self.replicas.len());
        for replica in &self.replicas {
            let (reply, reply_rx) = oneshot::channel();
            replica
                .command_tx
                .send(ReplicaCommand::Step {
                    tick,
                    grants: grants.clone(),
                    commands: commands.clone(),
                    reply,
                })
                .await
                .map_err(|_| RuntimeError::ReplicaLost { replica: replica.id })?;
            pending.push((replica.id, reply_rx));
        }

        let mut reports = Vec::with_capacity(pending.len());
        for (replica, reply_rx) in pending {
            let report = reply_rx
                .await
                .map_err(|_| RuntimeError::ReplicaLost { replica })??;
            reports.push(report);
        }
        for report in &reports {
            self.digests.append(&DigestRecord::from(report))?;
        }

        let reference = reports.first().ok_or(RuntimeError::NoReplicas)?;
        let digest = hex::encode(reference.digest);
        let outcome = reference.outcome.clone();
        let diverged = reports.iter().any(|report| report.digest != reference.digest);

        if diverged {
            self.digests.flush()?;
            let first_rand_divergence = self.first_rand_divergence(&reports).await?;
            let digests: Vec<_> = reports
                .iter()
                .map(|report| (report.replica, hex::encode(report.digest)))
                .collect();
            error!(
                target: "runtime::coordinator",
                %tick,
                ?digests,
                ?first_rand_divergence,
                "replicas diverged"
            );
            self.event_bus.publish(Event::Divergence(DivergenceEvent {
                tick,
                digests,
                first_rand_divergence,
            }));
            if self.config.halt_on_divergence {
                self.last_reports = reports;
                return Err(RuntimeError::Diverged { tick });
            }
        } else {
            self.event_bus.publish(Event::Tick(TickEvent {
                tick,
                digest: digest.clone(),
                commands: commands.len(),
            }));
        }

        let effective = tick + self.config.grant_delay_ticks.max(1);
        let issued = self.collect_grants(effective).await?;
        let grants_issued = issued.len();
        if !issued.is_empty() {
            self.scheduled.entry(effective).or_default().extend(issued);
        }

        debug!(
            target: "runtime::coordinator",
            %tick,
            digest = %digest,
            commands = commands.len(),
            grants_installed = grants.len(),
            grants_issued,
            "tick complete"
        );

        self.tick = tick;
        self.last_reports = reports;

        Ok(TickSummary {
            tick,
            digest,
            diverged,
            commands: outcome.commands,
            rejected: outcome.rejected,
            spawned: outcome.spawned,
            cleaned: outcome.cleaned,
            grants_installed: grants.len(),
            grants_issued,
        })
    }

    /// Runs `ticks` ticks, stopping at the first error.
    pub async fn run_ticks(&mut self, ticks: u64) -> Result<RunSummary> {
        let mut summary = RunSummary {
            last_tick: self.tick,
            ..RunSummary::default()
        };
        for _ in 0..ticks {
            let tick = self.step().await?;
            summary.record(tick);
        }
        info!(
            target: "runtime::coordinator",
            ticks = summary.ticks,
            last_tick = %summary.last_tick,
            digest = %summary.digest,
            "run complete"
        );
        Ok(summary)
    }

    /// Shutdown the runtime gracefully
    ///
    /// Replica threads stop once their command channel closes; the authority
    /// stops once every replica has dropped its sender.
    pub async fn shutdown(self) -> Result<()> {
        let Runtime {
            replicas,
            authority_tx,
            authority_handle,
            mut digests,
            handle,
            command_rx,
            ..
        } = self;
        drop(handle);
        drop(command_rx);
        digests.flush()?;

        for ReplicaLink {
            id,
            command_tx,
            thread,
        } in replicas
        {
            drop(command_tx);
            let joined = tokio::task::spawn_blocking(move || thread.join())
                .await
                .map_err(RuntimeError::WorkerJoin)?;
            joined.map_err(|_| RuntimeError::ReplicaPanicked { replica: id })?;
        }

        drop(authority_tx);
        authority_handle.await.map_err(RuntimeError::WorkerJoin)?;
        Ok(())
    }

    fn drain_commands(&mut self) -> Vec<SimCommand> {
        let mut commands = std::mem::take(&mut self.queued);
        while let Ok(command) = self.command_rx.try_recv() {
            commands.push(command);
        }
        commands
    }

    async fn collect_grants(&self, effective: Tick) -> Result<Vec<BlockGrant>> {
        let (reply, reply_rx) = oneshot::channel();
        self.authority_tx
            .send(AuthorityCommand::Collect { effective, reply })
            .map_err(|_| RuntimeError::AuthorityChannelClosed)?;
        reply_rx.await.map_err(RuntimeError::AuthorityReplyClosed)
    }

    /// Index of the first traced draw that differs between the first replica
    /// and the first one that disagrees with it.
    async fn first_rand_divergence(&self, reports: &[TickReport]) -> Result<Option<u64>> {
        let Some(reference) = reports.first() else {
            return Ok(None);
        };
        let Some(other) = reports.iter().find(|report| report.digest != reference.digest) else {
            return Ok(None);
        };

        let ours = self.fetch_trace(reference.replica).await?;
        let theirs = self.fetch_trace(other.replica).await?;
        Ok(match (ours, theirs) {
            (Some(ours), Some(theirs)) => ours.first_divergence(&theirs).map(|d| d.index),
            _ => None,
        })
    }

    async fn fetch_trace(&self, replica: ReplicaId) -> Result<Option<RandTrace>> {
        let link = self
            .replicas
            .iter()
            .find(|link| link.id == replica)
            .ok_or(RuntimeError::ReplicaLost { replica })?;
        let (reply, reply_rx) = oneshot::channel();
        link.command_tx
            .send(ReplicaCommand::RandTrace { reply })
            .await
            .map_err(|_| RuntimeError::ReplicaLost { replica })?;
        reply_rx.await.map_err(|_| RuntimeError::ReplicaLost { replica })
    }
}

/// Builder for [`Runtime`] with flexible configuration.
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    overrides: HashMap<usize, LockstepConfig>,
}

impl RuntimeBuilder {
    fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            overrides: HashMap::new(),
        }
    }

    /// Set runtime configuration
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs replica `index` with its own lockstep configuration.
    ///
    /// Meant for per-replica tracing settings. Anything that feeds back into
    /// the simulation makes that replica diverge.
    pub fn replica_lockstep(mut self, index: usize, lockstep: LockstepConfig) -> Self {
        self.overrides.insert(index, lockstep);
        self
    }

    /// Build the runtime
    ///
    /// Reserves the starting id blocks, then lays out the scenario on every
    /// replica before returning.
    pub async fn build(mut self) -> Result<Runtime> {
        let config = self.config;
        if config.replicas == 0 {
            return Err(RuntimeError::NoReplicas);
        }

        let event_bus = EventBus::with_capacity(config.event_buffer_size);

        let (authority_tx, authority_rx) = mpsc::unbounded_channel();
        let authority = IdAuthority::new(
            authority_rx,
            event_bus.clone(),
            config.first_id,
            config.id_block_size,
        );
        let authority_handle = tokio::spawn(async move {
            authority.run().await;
        });

        let owners = std::iter::once(OwnerKey::Global)
            .chain(config.scenario.locations().map(OwnerKey::Location));
        let mut initial_blocks = Vec::new();
        for owner in owners {
            initial_blocks.push((owner, reserve(&authority_tx, owner).await?));
        }

        let mut replicas = Vec::with_capacity(config.replicas);
        let mut ready = Vec::with_capacity(config.replicas);
        for index in 0..config.replicas {
            let id = ReplicaId(index);
            let spec = ReplicaSpec {
                id,
                lockstep: self
                    .overrides
                    .remove(&index)
                    .unwrap_or_else(|| config.lockstep.clone()),
                scenario: config.scenario.clone(),
                initial_blocks: initial_blocks.clone(),
                authority: authority_tx.clone(),
                event_bus: event_bus.clone(),
            };
            let (command_tx, command_rx) = mpsc::channel(1);
            let (thread, ready_rx) = spawn_replica(spec, command_rx)?;
            replicas.push(ReplicaLink {
                id,
                command_tx,
                thread,
            });
            ready.push((id, ready_rx));
        }
        for (replica, ready_rx) in ready {
            ready_rx
                .await
                .map_err(|_| RuntimeError::ReplicaLost { replica })??;
        }

        let digests: Box<dyn DigestRepository> = match &config.digest_log_dir {
            Some(dir) => Box::new(FileDigestLog::open_or_create(dir, DIGEST_LOG_FILE)?),
            None => Box::new(InMemoryDigestRepository::new()),
        };

        let (command_tx, command_rx) = mpsc::channel(config.command_buffer_size.max(1));
        let handle = RuntimeHandle::new(command_tx, event_bus.clone());

        info!(
            target: "runtime::coordinator",
            replicas = config.replicas,
            factions = config.scenario.factions,
            locations = config.scenario.locations,
            world_seed = config.lockstep.world_seed,
            "runtime ready"
        );

        Ok(Runtime {
            config,
            handle,
            event_bus,
            command_rx,
            queued: Vec::new(),
            replicas,
            authority_tx,
            authority_handle,
            tick: Tick::ZERO,
            scheduled: BTreeMap::new(),
            digests,
            last_reports: Vec::new(),
        })
    }
}

async fn reserve(
    authority_tx: &mpsc::UnboundedSender<AuthorityCommand>,
    owner: OwnerKey,
) -> Result<IdRange> {
    let (reply, reply_rx) = oneshot::channel();
    authority_tx
        .send(AuthorityCommand::Reserve { owner, reply })
        .map_err(|_| RuntimeError::AuthorityChannelClosed)?;
    reply_rx
        .await
        .map_err(RuntimeError::AuthorityReplyClosed)?
        .ok_or(RuntimeError::IdSpaceExhausted { owner })
}
