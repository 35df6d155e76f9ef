//! Diagnostics sink for non-fatal core conditions.
//!
//! The core never decides where warnings go. It hands a [`Diagnostic`] to the
//! configured [`DiagnosticSink`]; the default [`TracingSink`] forwards to
//! `tracing`, the runtime forwards to its event bus, and tests collect them.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

use crate::error::ErrorClass;
use crate::state::{ActorId, EntityId};

/// Every condition the core reports without failing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DiagnosticKind {
    /// A scope was exited out of order or a pop went past the sentinel.
    UnbalancedScope,
    /// An entity changed location while a context referencing it was open.
    EntityRelocated,
    /// Tick-driven code asked for the current actor with none bound.
    MissingActorContext,
    /// A different id block replaced the active one for an owner.
    BlockReassigned,
    /// An id was requested for an owner with no installed block.
    NoIdBlock,
    /// An id block ran out before a replacement was installed.
    IdBlockExhausted,
    /// A shadow rebuild was re-entered for the same actor and location.
    RecursiveRebuild,
    /// A random state pop had no matching push.
    UnbalancedRandomState,
}

impl DiagnosticKind {
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::UnbalancedScope
            | Self::NoIdBlock
            | Self::RecursiveRebuild
            | Self::UnbalancedRandomState => ErrorClass::Programmer,
            Self::EntityRelocated | Self::MissingActorContext | Self::BlockReassigned => {
                ErrorClass::Consistency
            }
            Self::IdBlockExhausted => ErrorClass::Exhaustion,
        }
    }
}

/// A reported condition with the context it was raised in.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
    pub actor: Option<ActorId>,
    pub entity: Option<EntityId>,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            actor: None,
            entity: None,
        }
    }

    #[must_use]
    pub fn with_actor(mut self, actor: Option<ActorId>) -> Self {
        self.actor = actor;
        self
    }

    #[must_use]
    pub fn with_entity(mut self, entity: Option<EntityId>) -> Self {
        self.entity = entity;
        self
    }

    pub const fn class(&self) -> ErrorClass {
        self.kind.class()
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

/// Destination for diagnostics raised by the core.
pub trait DiagnosticSink {
    fn report(&self, diagnostic: &Diagnostic);
}

/// Forwards diagnostics to `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn report(&self, diagnostic: &Diagnostic) {
        match diagnostic.class() {
            ErrorClass::Programmer => tracing::error!(
                target: "lockstep::diagnostics",
                kind = diagnostic.kind.as_ref(),
                actor = ?diagnostic.actor,
                entity = ?diagnostic.entity,
                "{}",
                diagnostic.message
            ),
            ErrorClass::Consistency | ErrorClass::Exhaustion => tracing::warn!(
                target: "lockstep::diagnostics",
                kind = diagnostic.kind.as_ref(),
                actor = ?diagnostic.actor,
                entity = ?diagnostic.entity,
                "{}",
                diagnostic.message
            ),
        }
    }
}

/// Keeps every diagnostic in memory, for tests and local runs.
#[derive(Debug, Default)]
pub struct CollectingSink {
    reports: RefCell<Vec<Diagnostic>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<Diagnostic> {
        self.reports.borrow().clone()
    }

    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.reports.borrow().iter().filter(|d| d.kind == kind).count()
    }

    pub fn take(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.reports.borrow_mut())
    }
}

impl DiagnosticSink for CollectingSink {
    fn report(&self, diagnostic: &Diagnostic) {
        self.reports.borrow_mut().push(diagnostic.clone());
    }
}

impl<S: DiagnosticSink + ?Sized> DiagnosticSink for Rc<S> {
    fn report(&self, diagnostic: &Diagnostic) {
        (**self).report(diagnostic);
    }
}

struct DiagnosticsInner {
    sink: Box<dyn DiagnosticSink>,
    reported_once: RefCell<HashSet<(DiagnosticKind, u64)>>,
}

/// Shared handle to the diagnostics sink of one replica.
///
/// Cloning is cheap; every core component of a replica holds a clone.
#[derive(Clone)]
pub struct Diagnostics {
    inner: Rc<DiagnosticsInner>,
}

impl Diagnostics {
    pub fn new(sink: impl DiagnosticSink + 'static) -> Self {
        Self {
            inner: Rc::new(DiagnosticsInner {
                sink: Box::new(sink),
                reported_once: RefCell::new(HashSet::new()),
            }),
        }
    }

    pub fn tracing() -> Self {
        Self::new(TracingSink)
    }

    pub fn report(&self, diagnostic: Diagnostic) {
        self.inner.sink.report(&diagnostic);
    }

    /// Reports `diagnostic` only the first time `(kind, key)` is seen.
    ///
    /// Returns true if the diagnostic was forwarded.
    pub fn report_once(&self, key: u64, diagnostic: Diagnostic) -> bool {
        let first = self
            .inner
            .reported_once
            .borrow_mut()
            .insert((diagnostic.kind, key));
        if first {
            self.report(diagnostic);
        }
        first
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::tracing()
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnostics")
            .field("reported_once", &self.inner.reported_once.borrow().len())
            .finish()
    }
}
