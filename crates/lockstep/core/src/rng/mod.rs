//! Deterministic random scope.
//!
//! [`SimRng`] is the shared generator of one replica. Operations attributed
//! to a single entity bracket their draws with a pushed state, usually seeded
//! from the entity and tick, so their sequence does not depend on unrelated
//! work that happened earlier in the tick. Popping restores the generator
//! exactly, so the outer sequence is unaffected as well.
mod error;
mod seed;
mod trace;

pub use error::RandError;
pub use seed::{STREAM_ATTRIBUTED, STREAM_SPAWN, mix_seed};
pub use trace::{Divergence, DrawKind, RandCall, RandTrace};

use std::cell::{Cell, Ref, RefCell};
use std::fmt;
use std::ops::Deref;

use rand::{Rng, RngCore, SeedableRng};
use rand_pcg::Pcg32;

use crate::config::LockstepConfig;
use crate::context::ContextStack;
use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::error::ScopePolicy;
use crate::state::{EntityId, Tick};

/// Opaque snapshot of the generator.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RandomState(Pcg32);

struct RngInner {
    generator: Pcg32,
    saved: Vec<Pcg32>,
    trace: Option<RandTrace>,
}

/// Shared PCG32 generator with a stack of saved states.
pub struct SimRng {
    inner: RefCell<RngInner>,
    world_seed: u64,
    tick: Cell<Tick>,
    context: Option<ContextStack>,
    policy: ScopePolicy,
    diagnostics: Diagnostics,
}

impl SimRng {
    pub fn new(world_seed: u64) -> Self {
        Self {
            inner: RefCell::new(RngInner {
                generator: Pcg32::seed_from_u64(world_seed),
                saved: Vec::new(),
                trace: None,
            }),
            world_seed,
            tick: Cell::new(Tick::ZERO),
            context: None,
            policy: ScopePolicy::for_build(),
            diagnostics: Diagnostics::tracing(),
        }
    }

    pub fn from_config(config: &LockstepConfig, diagnostics: Diagnostics) -> Self {
        let rng = Self::new(config.world_seed)
            .with_policy(config.scope_policy)
            .with_diagnostics(diagnostics);
        if config.rand_trace.enabled {
            rng.with_trace(RandTrace::new(config.rand_trace.clone()))
        } else {
            rng
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: ScopePolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Attributes traced draws to the actor and entity of `stack`.
    #[must_use]
    pub fn with_context(mut self, stack: ContextStack) -> Self {
        self.context = Some(stack);
        self
    }

    #[must_use]
    pub fn with_trace(self, trace: RandTrace) -> Self {
        self.inner.borrow_mut().trace = Some(trace);
        self
    }

    pub fn world_seed(&self) -> u64 {
        self.world_seed
    }

    /// Sets the tick recorded with traced draws.
    pub fn set_tick(&self, tick: Tick) {
        self.tick.set(tick);
    }

    pub fn next_u32(&self) -> u32 {
        let value = self.inner.borrow_mut().generator.next_u32();
        self.trace(DrawKind::U32, u64::from(value));
        value
    }

    pub fn next_u64(&self) -> u64 {
        let value = self.inner.borrow_mut().generator.next_u64();
        self.trace(DrawKind::U64, value);
        value
    }

    /// Uniform value in `[min, max]`; returns `min` when the range is empty.
    pub fn range(&self, min: u32, max: u32) -> u32 {
        let value = if min >= max {
            min
        } else {
            self.inner.borrow_mut().generator.gen_range(min..=max)
        };
        self.trace(DrawKind::Range, u64::from(value));
        value
    }

    /// 1-100 inclusive.
    pub fn roll_d100(&self) -> u32 {
        let value = self.inner.borrow_mut().generator.gen_range(1..=100);
        self.trace(DrawKind::D100, u64::from(value));
        value
    }

    /// True with probability `percent / 100`.
    pub fn chance(&self, percent: u32) -> bool {
        let hit = self.inner.borrow_mut().generator.gen_range(0..100) < percent;
        self.trace(DrawKind::Chance, u64::from(hit));
        hit
    }

    /// Saves the current state; the matching pop restores it.
    pub fn push_state(&self) {
        let mut inner = self.inner.borrow_mut();
        let saved = inner.generator.clone();
        inner.saved.push(saved);
    }

    /// Saves the current state and reseeds the generator.
    pub fn push_state_seeded(&self, seed: u64) {
        let mut inner = self.inner.borrow_mut();
        let saved = std::mem::replace(&mut inner.generator, Pcg32::seed_from_u64(seed));
        inner.saved.push(saved);
    }

    /// Saves the current state and reseeds from the world seed, `entity` and
    /// `tick`.
    pub fn push_state_for(&self, entity: EntityId, tick: Tick) {
        self.push_state_seeded(mix_seed(self.world_seed, tick, entity, STREAM_ATTRIBUTED));
    }

    /// Restores the most recently saved state.
    ///
    /// A pop with nothing pushed leaves the generator untouched and is
    /// reported; under [`ScopePolicy::Panic`] it panics.
    pub fn pop_state(&self) -> Result<(), RandError> {
        let restored = {
            let mut inner = self.inner.borrow_mut();
            match inner.saved.pop() {
                Some(saved) => {
                    inner.generator = saved;
                    true
                }
                None => false,
            }
        };

        if restored {
            Ok(())
        } else {
            self.unbalanced("random state pop without matching push");
            Err(RandError::NothingPushed)
        }
    }

    /// Number of saved states.
    pub fn depth(&self) -> usize {
        self.inner.borrow().saved.len()
    }

    /// Pushes the current state and pops it when the guard is dropped.
    pub fn scope(&self) -> RandScope<'_> {
        self.push_state();
        RandScope::new(self)
    }

    /// Like [`SimRng::scope`], reseeding with `seed` for the guard's lifetime.
    pub fn seeded_scope(&self, seed: u64) -> RandScope<'_> {
        self.push_state_seeded(seed);
        RandScope::new(self)
    }

    /// Scope seeded for draws attributed to `entity` at `tick`.
    pub fn scope_for(&self, entity: EntityId, tick: Tick) -> RandScope<'_> {
        self.push_state_for(entity, tick);
        RandScope::new(self)
    }

    pub fn snapshot(&self) -> RandomState {
        RandomState(self.inner.borrow().generator.clone())
    }

    pub fn restore(&self, state: RandomState) {
        self.inner.borrow_mut().generator = state.0;
    }

    /// Read access to the draw trace, if tracing is enabled.
    pub fn trace_log(&self) -> Option<Ref<'_, RandTrace>> {
        Ref::filter_map(self.inner.borrow(), |inner| inner.trace.as_ref()).ok()
    }

    fn trace(&self, kind: DrawKind, value: u64) {
        let mut inner = self.inner.borrow_mut();
        let Some(trace) = inner.trace.as_mut() else {
            return;
        };
        let frame = self
            .context
            .as_ref()
            .map(ContextStack::current_frame)
            .unwrap_or_default();
        trace.record(
            self.tick.get(),
            frame.actor,
            frame.entity.map(|e| e.id),
            kind,
            value,
        );
    }

    fn release_scope(&self, depth: usize) {
        let len = self.depth();
        if len < depth {
            self.unbalanced("random scope exited after its state was already popped");
            return;
        }

        let mut inner = self.inner.borrow_mut();
        inner.saved.truncate(depth);
        if let Some(saved) = inner.saved.pop() {
            inner.generator = saved;
        }
        drop(inner);

        if len > depth {
            self.unbalanced("random scope exited with inner states still pushed");
        }
    }

    fn unbalanced(&self, message: &str) {
        self.diagnostics.report(
            Diagnostic::new(DiagnosticKind::UnbalancedRandomState, message).with_actor(
                self.context.as_ref().and_then(ContextStack::current_actor),
            ),
        );
        if self.policy.panics() && !std::thread::panicking() {
            panic!("unbalanced random state: {message}");
        }
    }
}

impl fmt::Debug for SimRng {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("SimRng")
            .field("world_seed", &self.world_seed)
            .field("depth", &inner.saved.len())
            .field("tracing", &inner.trace.is_some())
            .finish()
    }
}

/// Guard that pops the state it pushed when dropped.
///
/// Dereferences to the generator so draws can be made through it.
#[must_use = "dropping the guard immediately restores the previous state"]
pub struct RandScope<'a> {
    rng: &'a SimRng,
    depth: usize,
}

impl<'a> RandScope<'a> {
    fn new(rng: &'a SimRng) -> Self {
        Self {
            depth: rng.depth(),
            rng,
        }
    }
}

impl Deref for RandScope<'_> {
    type Target = SimRng;

    fn deref(&self) -> &SimRng {
        self.rng
    }
}

impl Drop for RandScope<'_> {
    fn drop(&mut self) {
        self.rng.release_scope(self.depth);
    }
}
