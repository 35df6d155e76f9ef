//! Common error infrastructure for lockstep-core.
//!
//! Module-specific errors (`AllocError`, `RandError`, ...) live next to the
//! code that raises them. This module provides the classification they share.
//!
//! # Classes
//!
//! - **Programmer**: misuse of the core (unbalanced scopes, allocation with no
//!   installed block, recursive rebuilds). Fails fast under
//!   [`ScopePolicy::Panic`], clamps under [`ScopePolicy::Clamp`].
//! - **Consistency**: the world moved under an open context or an authority
//!   sent conflicting data. Logged, execution continues.
//! - **Exhaustion**: an id block ran out before its replacement arrived.

/// Classification of a core failure or diagnostic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorClass {
    /// Misuse of the core API; indicates a bug in the caller.
    Programmer,

    /// World state diverged from what an open context recorded.
    Consistency,

    /// A finite resource (id range) was consumed.
    Exhaustion,
}

/// How programmer errors are handled.
///
/// Debug builds default to [`ScopePolicy::Panic`] so unbalanced scopes fail
/// at the call site; release builds clamp and keep the replica alive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ScopePolicy {
    Panic,
    Clamp,
}

impl ScopePolicy {
    pub const fn for_build() -> Self {
        if cfg!(debug_assertions) {
            Self::Panic
        } else {
            Self::Clamp
        }
    }

    pub const fn panics(&self) -> bool {
        matches!(self, Self::Panic)
    }
}

impl Default for ScopePolicy {
    fn default() -> Self {
        Self::for_build()
    }
}

/// Common trait for all lockstep-core errors.
///
/// - Use `#[derive(thiserror::Error)]` for Display/Error impl
/// - Classify by who has to act on the failure, not by its impact
pub trait LockstepError: core::fmt::Display + core::fmt::Debug {
    fn class(&self) -> ErrorClass;

    /// Returns a static string identifier for this error variant.
    fn error_code(&self) -> &'static str {
        core::any::type_name::<Self>()
    }
}
