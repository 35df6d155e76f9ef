//! Lockstep client binary.
//!
//! Builds a runtime from `LOCKSTEP_*` environment variables and command-line
//! overrides, runs the requested ticks and reports whether every replica
//! stayed in agreement.
//!
//! # Examples
//!
//! ```bash
//! # Three replicas, four factions sharing two locations
//! cargo run -p lockstep-client -- --replicas 3 --factions 4 --locations 2 --ticks 500
//!
//! # Small id blocks to exercise the authority, with a digest log
//! LOCKSTEP_BLOCK_SIZE=25 cargo run -p lockstep-client -- --digest-dir ./digests
//! ```
mod config;
mod logging;
mod script;

use anyhow::{Context, Result};
use clap::Parser;
use runtime::{Event, RunSummary, Runtime, RuntimeError, Topic};
use tokio::sync::broadcast;

use config::{Args, ClientConfig};
use script::Script;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let config = ClientConfig::from_env().with_args(Args::parse());
    let _guard = logging::setup_logging(config.log_dir.as_deref())?;

    let mut script = match &config.script {
        Some(path) => Script::load(path)?,
        None => Script::default(),
    };

    tracing::info!(
        replicas = config.runtime.replicas,
        factions = config.runtime.scenario.factions,
        locations = config.runtime.scenario.locations,
        ticks = config.ticks,
        scripted = script.len(),
        "Starting lockstep client"
    );

    let mut runtime = Runtime::builder()
        .config(config.runtime.clone())
        .build()
        .await
        .context("failed to build runtime")?;
    let handle = runtime.handle();
    let reporter = tokio::spawn(report_events(handle.subscribe(Topic::Diagnostics)));

    let mut summary = RunSummary::default();
    let mut outcome = Ok(());
    for _ in 0..config.ticks {
        for command in script.take(runtime.tick().next()) {
            runtime.enqueue(command);
        }
        match runtime.step().await {
            Ok(tick) => summary.record(tick),
            Err(err) => {
                outcome = Err(err);
                break;
            }
        }
    }

    runtime.shutdown().await?;
    drop(handle);
    if let Ok(diagnostics) = reporter.await {
        tracing::info!(diagnostics, "diagnostics reported during the run");
    }

    if config.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "ticks={} last_tick={} digest={} commands={} spawned={} cleaned={} grants={}",
            summary.ticks,
            summary.last_tick,
            summary.digest,
            summary.commands,
            summary.spawned,
            summary.cleaned,
            summary.grants
        );
        if !summary.divergent_ticks.is_empty() {
            println!("divergent ticks: {:?}", summary.divergent_ticks);
        }
    }

    match outcome {
        Err(RuntimeError::Diverged { tick }) => anyhow::bail!("replicas diverged at tick {tick}"),
        other => other.context("run aborted"),
    }
}

/// Counts diagnostics until the bus closes.
async fn report_events(mut rx: broadcast::Receiver<Event>) -> usize {
    let mut seen = 0;
    loop {
        match rx.recv().await {
            Ok(Event::Diagnostic(event)) => {
                seen += 1;
                tracing::debug!(
                    replica = %event.replica,
                    tick = %event.tick,
                    kind = %event.diagnostic.kind,
                    "{}",
                    event.diagnostic.message
                );
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "diagnostic reporter lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    seen
}
