//! Lockstep runtime: replicas, id authority and divergence checks.
//!
//! This crate runs several replicas of the same world side by side, each on
//! its own thread with its own [`lockstep_core::Engine`], and feeds them the
//! same commands and id block grants tick by tick. Consumers embed
//! [`Runtime`] to drive ticks and subscribe to events through
//! [`RuntimeHandle`].
//!
//! Modules are organized by responsibility:
//! - [`runtime`] hosts the coordinator and builder
//! - [`api`] exposes the types downstream clients interact with
//! - [`events`] provides topic-based event bus for flexible event routing
//! - [`sim`] is the reference colony simulation every replica runs
//! - [`repository`] persists per-tick digests
//! - `workers` keeps background tasks internal to the crate
pub mod api;
pub mod events;
pub mod repository;
pub mod runtime;
pub mod sim;

mod workers;

pub use api::{Result, RuntimeError, RuntimeHandle};
pub use events::{
    DiagnosticEvent, DivergenceEvent, Event, EventBus, IdEvent, TickEvent, Topic,
};
pub use repository::{
    DigestRecord, DigestRepository, FileDigestLog, InMemoryDigestRepository, RepositoryError,
    first_divergent_tick,
};
pub use runtime::{DIGEST_LOG_FILE, RunSummary, Runtime, RuntimeBuilder, RuntimeConfig, TickSummary};
pub use sim::{ScenarioConfig, SimCommand, SimError, Simulation, TickOutcome};
pub use workers::{BlockGrant, ReplicaId, TickReport};
