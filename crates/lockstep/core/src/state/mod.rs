//! Identifier and world-reference types shared by every core module.
mod entity;
mod ids;

pub use entity::{EntityLocator, EntityRef, ResourceKind, ThingInfo, ThingKind};
pub use ids::{ActorId, Cell, EntityId, LocationId, Tick};
