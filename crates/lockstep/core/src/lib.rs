//! Execution-context isolation for lockstep multi-actor simulation.
//!
//! `lockstep-core` lets simulation code written for one global actor run on
//! behalf of many. A dispatcher binds the acting faction and entity on a
//! [`context::ContextStack`] around each operation; identifiers come from
//! per-owner blocks reserved by an authority ([`ids::IdAllocator`]);
//! randomness is bracketed per entity ([`rng::SimRng`]); and location-derived
//! indices are kept per actor ([`shadow::ShadowStore`]). [`engine::Engine`]
//! bundles all of them for one replica.
//!
//! Core types are single-threaded (`Rc`/`RefCell`). Each replica owns its own
//! engine on its own thread.
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod gate;
pub mod ids;
pub mod rng;
pub mod shadow;
pub mod state;
pub mod world;

pub use config::{LockstepConfig, RandTraceConfig};
pub use context::{ContextFrame, ContextStack, Scope, unanimous_owner};
pub use diagnostics::{
    CollectingSink, Diagnostic, DiagnosticKind, DiagnosticSink, Diagnostics, TracingSink,
};
pub use engine::{Engine, EngineBuilder};
pub use error::{ErrorClass, LockstepError, ScopePolicy};
pub use gate::{CommandGate, ExecutionPhase, TickGate, TickGuard};
pub use ids::{
    AllocError, IdAllocator, IdAssignment, IdBlock, IdRange, OverflowRequest, OverflowSink,
    OwnerKey,
};
pub use rng::{
    Divergence, DrawKind, RandCall, RandError, RandScope, RandTrace, RandomState, SimRng,
    STREAM_ATTRIBUTED, STREAM_SPAWN, mix_seed,
};
pub use shadow::{MutationEvent, RebuildOutcome, ShadowIndex, ShadowKinds, ShadowStore, WorldView};
pub use state::{
    ActorId, Cell, EntityId, EntityLocator, EntityRef, LocationId, ResourceKind, ThingInfo,
    ThingKind, Tick,
};
pub use world::{MemoryWorld, WorldError};
