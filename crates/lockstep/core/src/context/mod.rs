//! Execution context stack.
//!
//! Simulation code written for a single global actor reads "whose
//! perspective is this" from a [`ContextStack`] instead. A dispatcher enters a
//! [`Scope`] for the acting faction (and optionally the acting entity) before
//! calling into the simulation and the scope is released when it is dropped,
//! so the binding cannot outlive the operation even when it fails or unwinds.
//!
//! The stack always holds one sentinel frame with no actor and no entity;
//! reads against an otherwise empty stack return `None`.

mod owner;

pub use owner::unanimous_owner;

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::error::ScopePolicy;
use crate::gate::TickGate;
use crate::state::{ActorId, EntityLocator, EntityRef, LocationId};

/// One binding of active actor and active entity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ContextFrame {
    pub entity: Option<EntityRef>,
    pub actor: Option<ActorId>,
}

impl ContextFrame {
    pub const SENTINEL: Self = Self {
        entity: None,
        actor: None,
    };

    pub const fn new(actor: Option<ActorId>, entity: Option<EntityRef>) -> Self {
        Self { entity, actor }
    }
}

struct StackInner {
    frames: RefCell<Vec<ContextFrame>>,
    policy: ScopePolicy,
    diagnostics: Diagnostics,
}

thread_local! {
    static THREAD_STACK: ContextStack = ContextStack::new();
}

/// Handle to an ordered stack of [`ContextFrame`]s.
///
/// Cloning the handle shares the stack. Independent stacks are created with
/// [`ContextStack::new`]; [`ContextStack::current_thread`] returns the default
/// stack of the calling thread for code that cannot be handed one.
#[derive(Clone)]
pub struct ContextStack {
    inner: Rc<StackInner>,
}

impl ContextStack {
    pub fn new() -> Self {
        Self::with_diagnostics(Diagnostics::tracing(), ScopePolicy::for_build())
    }

    pub fn with_diagnostics(diagnostics: Diagnostics, policy: ScopePolicy) -> Self {
        Self {
            inner: Rc::new(StackInner {
                frames: RefCell::new(vec![ContextFrame::SENTINEL]),
                policy,
                diagnostics,
            }),
        }
    }

    /// Returns the calling thread's default stack.
    pub fn current_thread() -> Self {
        THREAD_STACK.with(Clone::clone)
    }

    /// Returns true if both handles refer to the same stack.
    pub fn same_stack(&self, other: &ContextStack) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn policy(&self) -> ScopePolicy {
        self.inner.policy
    }

    /// Binds `actor` (and `entity`) until the returned scope is released.
    ///
    /// A `None` actor does not push anything and returns an inert scope, so
    /// single-actor operation keeps the stack at the sentinel.
    pub fn enter(&self, actor: Option<ActorId>, entity: Option<EntityRef>) -> Scope {
        match actor {
            Some(actor) => {
                let depth = self.push(ContextFrame::new(Some(actor), entity));
                Scope {
                    stack: Some(self.clone()),
                    depth,
                }
            }
            None => Scope::inert(),
        }
    }

    /// Binds the owner of `entity` together with the entity itself.
    ///
    /// Unowned or unspawned entities do not get a context.
    pub fn enter_for(&self, entity: EntityRef) -> Scope {
        if !entity.is_spawned() {
            return Scope::inert();
        }
        self.enter(entity.owner, Some(entity))
    }

    /// Low-level push for dispatchers that cannot hold a [`Scope`].
    ///
    /// Returns the stack length after the push; every push must be matched by
    /// exactly one [`ContextStack::pop`].
    pub fn push(&self, frame: ContextFrame) -> usize {
        let mut frames = self.inner.frames.borrow_mut();
        frames.push(frame);
        frames.len()
    }

    /// Low-level pop matching [`ContextStack::push`].
    ///
    /// Popping the sentinel is a programmer error: it panics under
    /// [`ScopePolicy::Panic`] and is ignored under [`ScopePolicy::Clamp`].
    pub fn pop(&self) -> Option<ContextFrame> {
        let popped = {
            let mut frames = self.inner.frames.borrow_mut();
            if frames.len() > 1 { frames.pop() } else { None }
        };

        if popped.is_none() {
            self.unbalanced("context pop without matching push (stack is at the sentinel)");
        }
        popped
    }

    /// Returns the top frame.
    pub fn current_frame(&self) -> ContextFrame {
        self.inner
            .frames
            .borrow()
            .last()
            .copied()
            .unwrap_or(ContextFrame::SENTINEL)
    }

    pub fn current_actor(&self) -> Option<ActorId> {
        self.current_frame().actor
    }

    pub fn current_entity(&self) -> Option<EntityRef> {
        self.current_frame().entity
    }

    /// Like [`ContextStack::current_actor`], but reports a missing binding
    /// while the gate says tick-driven simulation is running.
    pub fn current_actor_checked<G>(&self, gate: &G) -> Option<ActorId>
    where
        G: TickGate + ?Sized,
    {
        let actor = self.current_actor();
        if actor.is_none() && gate.is_ticking() {
            let tick = gate.current_tick();
            self.inner.diagnostics.report_once(
                tick.0,
                Diagnostic::new(
                    DiagnosticKind::MissingActorContext,
                    format!("actor context not set during ticking (tick {tick})"),
                ),
            );
        }
        actor
    }

    /// Location recorded for the current entity when its frame was pushed.
    ///
    /// If the entity has since moved, an `EntityRelocated` diagnostic is
    /// reported once per entity and the recorded location is still returned:
    /// the frame, not the moved entity, defines the operation's location.
    pub fn current_location<L>(&self, locator: &L) -> Option<LocationId>
    where
        L: EntityLocator + ?Sized,
    {
        let frame = self.current_frame();
        let entity = frame.entity?;
        let live = locator.location_of(entity.id);

        if live != entity.location {
            self.inner.diagnostics.report_once(
                u64::from(entity.id.0),
                Diagnostic::new(
                    DiagnosticKind::EntityRelocated,
                    format!(
                        "entity {} changed location from {:?} to {:?} inside its context",
                        entity.id, entity.location, live
                    ),
                )
                .with_actor(frame.actor)
                .with_entity(Some(entity.id)),
            );
        }

        entity.location
    }

    /// Number of frames above the sentinel.
    pub fn depth(&self) -> usize {
        self.inner.frames.borrow().len() - 1
    }

    /// Snapshot of all frames, sentinel first.
    pub fn frames(&self) -> Vec<ContextFrame> {
        self.inner.frames.borrow().clone()
    }

    fn release(&self, depth: usize) {
        let len = self.inner.frames.borrow().len();

        if len == depth {
            self.inner.frames.borrow_mut().pop();
            return;
        }

        if len > depth {
            // Inner scopes are still open: drop them along with this one.
            self.inner.frames.borrow_mut().truncate(depth - 1);
            self.unbalanced(&format!(
                "scope at depth {} exited while {} inner frame(s) were still open",
                depth - 1,
                len - depth
            ));
        } else {
            self.unbalanced(&format!(
                "scope at depth {} exited after its frame was already popped",
                depth - 1
            ));
        }
    }

    fn unbalanced(&self, message: &str) {
        self.inner.diagnostics.report(
            Diagnostic::new(DiagnosticKind::UnbalancedScope, message)
                .with_actor(self.current_actor()),
        );
        // Never panic while already unwinding; that would abort the process.
        if self.inner.policy.panics() && !std::thread::panicking() {
            panic!("unbalanced context stack: {message}");
        }
    }
}

impl Default for ContextStack {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ContextStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextStack")
            .field("frames", &self.inner.frames.borrow())
            .field("policy", &self.inner.policy)
            .finish()
    }
}

/// Guard for one entered context.
///
/// The frame is popped when the scope is exited or dropped, whichever comes
/// first, including during unwinding.
#[must_use = "dropping a scope immediately exits it"]
pub struct Scope {
    stack: Option<ContextStack>,
    depth: usize,
}

impl Scope {
    fn inert() -> Self {
        Self {
            stack: None,
            depth: 0,
        }
    }

    /// Returns true if this scope pushed a frame that is still bound.
    pub fn is_active(&self) -> bool {
        self.stack.is_some()
    }

    pub fn exit(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(stack) = self.stack.take() {
            stack.release(self.depth);
        }
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("active", &self.is_active())
            .field("depth", &self.depth)
            .finish()
    }
}
