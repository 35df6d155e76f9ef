use crate::error::ScopePolicy;
use crate::state::Tick;

/// Lockstep configuration constants and tunable parameters.
///
/// Every replica of a world must run with the same configuration; only
/// `rand_trace` may differ between replicas since it does not feed back into
/// the simulation.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LockstepConfig {
    /// Seed shared by all replicas; mixed into every entity-attributed seed.
    pub world_seed: u64,

    /// Share of an id block (in percent) after which a replacement is requested.
    pub overflow_threshold_percent: u32,

    /// Handling of unbalanced scopes and other programmer errors.
    pub scope_policy: ScopePolicy,

    /// Ticks between periodic shadow index refreshes. `0` disables them.
    pub shadow_refresh_interval: u64,

    pub rand_trace: RandTraceConfig,
}

impl LockstepConfig {
    pub const DEFAULT_WORLD_SEED: u64 = 0x5eed;
    pub const DEFAULT_OVERFLOW_THRESHOLD_PERCENT: u32 = 95;
    pub const DEFAULT_SHADOW_REFRESH_INTERVAL: u64 = 250;

    pub fn new() -> Self {
        Self {
            world_seed: Self::DEFAULT_WORLD_SEED,
            overflow_threshold_percent: Self::DEFAULT_OVERFLOW_THRESHOLD_PERCENT,
            scope_policy: ScopePolicy::for_build(),
            shadow_refresh_interval: Self::DEFAULT_SHADOW_REFRESH_INTERVAL,
            rand_trace: RandTraceConfig::default(),
        }
    }

    #[must_use]
    pub fn with_world_seed(mut self, world_seed: u64) -> Self {
        self.world_seed = world_seed;
        self
    }

    #[must_use]
    pub fn with_overflow_threshold_percent(mut self, percent: u32) -> Self {
        self.overflow_threshold_percent = percent.clamp(1, 100);
        self
    }

    #[must_use]
    pub fn with_scope_policy(mut self, scope_policy: ScopePolicy) -> Self {
        self.scope_policy = scope_policy;
        self
    }

    #[must_use]
    pub fn with_shadow_refresh_interval(mut self, interval: u64) -> Self {
        self.shadow_refresh_interval = interval;
        self
    }

    #[must_use]
    pub fn with_rand_trace(mut self, rand_trace: RandTraceConfig) -> Self {
        self.rand_trace = rand_trace;
        self
    }
}

impl Default for LockstepConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Optional per-draw instrumentation of the shared generator.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RandTraceConfig {
    pub enabled: bool,

    /// Only draws inside `[from, to]` are recorded when set.
    pub tick_window: Option<(Tick, Tick)>,

    /// Maximum number of retained calls; older calls are dropped first.
    /// The running digest still covers dropped calls.
    pub capacity: usize,
}

impl RandTraceConfig {
    pub const DEFAULT_CAPACITY: usize = 4096;

    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_tick_window(mut self, from: Tick, to: Tick) -> Self {
        self.tick_window = Some((from, to));
        self
    }

    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Returns true if a draw at `tick` should be recorded.
    pub fn records(&self, tick: Tick) -> bool {
        self.enabled
            && self
                .tick_window
                .is_none_or(|(from, to)| tick >= from && tick <= to)
    }
}

impl Default for RandTraceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tick_window: None,
            capacity: Self::DEFAULT_CAPACITY,
        }
    }
}
