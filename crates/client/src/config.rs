//! Client configuration loaded from the environment and command line.
use std::env;
use std::path::PathBuf;

use clap::Parser;
use lockstep_core::{LockstepConfig, RandTraceConfig, ScopePolicy, Tick};
use runtime::{RuntimeConfig, ScenarioConfig};

/// Runs replicas of a lockstep colony side by side and checks they agree.
#[derive(Debug, Default, Parser)]
#[command(name = "lockstep", version)]
pub struct Args {
    /// Ticks to run
    #[arg(long)]
    pub ticks: Option<u64>,

    #[arg(long)]
    pub replicas: Option<usize>,

    #[arg(long)]
    pub factions: Option<u32>,

    #[arg(long)]
    pub locations: Option<u32>,

    #[arg(long)]
    pub pawns: Option<u32>,

    /// World seed shared by every replica
    #[arg(long)]
    pub seed: Option<u64>,

    #[arg(long)]
    pub block_size: Option<u32>,

    /// Ticks between granting an id block and installing it
    #[arg(long)]
    pub grant_delay: Option<u64>,

    /// Keep running after replicas diverge
    #[arg(long)]
    pub keep_going: bool,

    /// Record every random draw for divergence diagnosis
    #[arg(long)]
    pub trace: bool,

    /// Directory for the per-tick digest log
    #[arg(long)]
    pub digest_dir: Option<PathBuf>,

    /// JSON file of `{ "tick": n, "command": ... }` entries to submit
    #[arg(long)]
    pub script: Option<PathBuf>,

    /// Print the run summary as JSON
    #[arg(long)]
    pub json: bool,
}

/// Everything the binary needs to build and drive a runtime.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub runtime: RuntimeConfig,
    pub ticks: u64,
    pub script: Option<PathBuf>,
    pub json: bool,
    pub log_dir: Option<PathBuf>,
}

impl ClientConfig {
    pub const DEFAULT_TICKS: u64 = 100;

    /// Construct configuration from process environment variables.
    ///
    /// Environment variables:
    /// - `LOCKSTEP_TICKS` - Ticks to run (default: 100)
    /// - `LOCKSTEP_REPLICAS` - Replica count (default: 2)
    /// - `LOCKSTEP_FACTIONS`, `LOCKSTEP_LOCATIONS`, `LOCKSTEP_PAWNS` - Scenario layout
    /// - `LOCKSTEP_SEED` - World seed
    /// - `LOCKSTEP_BLOCK_SIZE` - Ids per authority block (default: 1000)
    /// - `LOCKSTEP_GRANT_DELAY` - Ticks before a grant is installed (default: 2)
    /// - `LOCKSTEP_OVERFLOW_PERCENT` - Block usage that triggers a request (default: 95)
    /// - `LOCKSTEP_REFRESH_INTERVAL` - Ticks between shadow refreshes (default: 250)
    /// - `LOCKSTEP_SCOPE_POLICY` - `panic` or `clamp`
    /// - `LOCKSTEP_TRACE` - Record random draws
    /// - `LOCKSTEP_TRACE_WINDOW` - `from..to` tick window for recorded draws
    /// - `LOCKSTEP_HALT_ON_DIVERGENCE` - Stop at the first mismatch (default: true)
    /// - `LOCKSTEP_DIGEST_DIR` - Directory for the digest log
    /// - `LOCKSTEP_LOG_DIR` - Directory for the log file
    pub fn from_env() -> Self {
        let mut runtime = RuntimeConfig::default();
        let mut scenario = ScenarioConfig::default();
        let mut lockstep = LockstepConfig::default();

        if let Some(replicas) = read_env::<usize>("LOCKSTEP_REPLICAS") {
            runtime.replicas = replicas.max(1);
        }
        if let Some(factions) = read_env::<u32>("LOCKSTEP_FACTIONS") {
            scenario.factions = factions.max(1);
        }
        if let Some(locations) = read_env::<u32>("LOCKSTEP_LOCATIONS") {
            scenario.locations = locations.max(1);
        }
        if let Some(pawns) = read_env::<u32>("LOCKSTEP_PAWNS") {
            scenario.pawns_per_faction = pawns;
        }
        if let Some(seed) = read_env::<u64>("LOCKSTEP_SEED") {
            lockstep = lockstep.with_world_seed(seed);
        }
        if let Some(size) = read_env::<u32>("LOCKSTEP_BLOCK_SIZE") {
            runtime.id_block_size = size.max(1);
        }
        if let Some(delay) = read_env::<u64>("LOCKSTEP_GRANT_DELAY") {
            runtime.grant_delay_ticks = delay.max(1);
        }
        if let Some(percent) = read_env::<u32>("LOCKSTEP_OVERFLOW_PERCENT") {
            lockstep = lockstep.with_overflow_threshold_percent(percent);
        }
        if let Some(interval) = read_env::<u64>("LOCKSTEP_REFRESH_INTERVAL") {
            lockstep = lockstep.with_shadow_refresh_interval(interval);
        }
        if let Some(policy) = env::var("LOCKSTEP_SCOPE_POLICY")
            .ok()
            .and_then(|v| parse_policy(&v))
        {
            lockstep = lockstep.with_scope_policy(policy);
        }

        if read_flag("LOCKSTEP_TRACE") {
            let mut trace = RandTraceConfig::enabled();
            if let Some((from, to)) = env::var("LOCKSTEP_TRACE_WINDOW")
                .ok()
                .and_then(|v| parse_window(&v))
            {
                trace = trace.with_tick_window(from, to);
            }
            lockstep = lockstep.with_rand_trace(trace);
        }
        if let Some(halt) = read_env::<bool>("LOCKSTEP_HALT_ON_DIVERGENCE") {
            runtime.halt_on_divergence = halt;
        }
        runtime.digest_log_dir = env::var("LOCKSTEP_DIGEST_DIR").ok().map(PathBuf::from);

        runtime.scenario = scenario;
        runtime.lockstep = lockstep;

        Self {
            runtime,
            ticks: read_env("LOCKSTEP_TICKS").unwrap_or(Self::DEFAULT_TICKS),
            script: None,
            json: false,
            log_dir: env::var("LOCKSTEP_LOG_DIR").ok().map(PathBuf::from),
        }
    }

    /// Applies command-line overrides on top of the environment.
    #[must_use]
    pub fn with_args(mut self, args: Args) -> Self {
        let runtime = &mut self.runtime;
        if let Some(ticks) = args.ticks {
            self.ticks = ticks;
        }
        if let Some(replicas) = args.replicas {
            runtime.replicas = replicas.max(1);
        }
        if let Some(factions) = args.factions {
            runtime.scenario.factions = factions.max(1);
        }
        if let Some(locations) = args.locations {
            runtime.scenario.locations = locations.max(1);
        }
        if let Some(pawns) = args.pawns {
            runtime.scenario.pawns_per_faction = pawns;
        }
        if let Some(seed) = args.seed {
            runtime.lockstep.world_seed = seed;
        }
        if let Some(size) = args.block_size {
            runtime.id_block_size = size.max(1);
        }
        if let Some(delay) = args.grant_delay {
            runtime.grant_delay_ticks = delay.max(1);
        }
        if args.keep_going {
            runtime.halt_on_divergence = false;
        }
        if args.trace && !runtime.lockstep.rand_trace.enabled {
            runtime.lockstep.rand_trace = RandTraceConfig::enabled();
        }
        if args.digest_dir.is_some() {
            runtime.digest_log_dir = args.digest_dir;
        }
        self.script = args.script;
        self.json = args.json;
        self
    }
}

fn read_env<T>(key: &str) -> Option<T>
where
    T: std::str::FromStr,
{
    env::var(key).ok()?.parse().ok()
}

/// Set when present and empty, or `1`/`true`/`yes`.
fn read_flag(key: &str) -> bool {
    match env::var(key) {
        Ok(value) => matches!(value.trim(), "" | "1" | "true" | "yes"),
        Err(_) => false,
    }
}

fn parse_policy(value: &str) -> Option<ScopePolicy> {
    match value.trim().to_ascii_lowercase().as_str() {
        "panic" => Some(ScopePolicy::Panic),
        "clamp" => Some(ScopePolicy::Clamp),
        _ => None,
    }
}

fn parse_window(value: &str) -> Option<(Tick, Tick)> {
    let (from, to) = value.split_once("..")?;
    let from = from.trim().parse().ok()?;
    let to = to.trim().parse().ok()?;
    (from <= to).then_some((Tick(from), Tick(to)))
}
