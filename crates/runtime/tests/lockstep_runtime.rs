use std::time::Duration;

use lockstep_core::{
    ActorId, Cell, EntityId, LocationId, LockstepConfig, OwnerKey, RandTraceConfig, Tick,
};
use runtime::{
    DIGEST_LOG_FILE, DigestRepository, Event, FileDigestLog, IdEvent, Runtime, RuntimeConfig,
    RuntimeError, ScenarioConfig, SimCommand, Topic, first_divergent_tick,
};

fn config() -> RuntimeConfig {
    RuntimeConfig {
        replicas: 3,
        scenario: ScenarioConfig {
            factions: 3,
            locations: 2,
            pawns_per_faction: 2,
        },
        lockstep: LockstepConfig::default()
            .with_world_seed(0xc0ffee)
            .with_rand_trace(RandTraceConfig::enabled()),
        ..RuntimeConfig::default()
    }
}

#[tokio::test]
async fn replicas_stay_identical_over_many_ticks() {
    let mut runtime = Runtime::builder().config(config()).build().await.unwrap();

    let summary = runtime.run_ticks(40).await.unwrap();
    assert_eq!(summary.ticks, 40);
    assert_eq!(summary.last_tick, Tick(40));
    assert!(summary.divergent_ticks.is_empty());

    let reports = runtime.last_reports();
    assert_eq!(reports.len(), 3);
    assert!(reports.iter().all(|r| r.digest == reports[0].digest));
    assert!(reports.iter().all(|r| r.rand_digest == reports[0].rand_digest));

    let records = runtime.digest_records().unwrap();
    assert_eq!(records.len(), 40 * 3);
    assert_eq!(first_divergent_tick(&records), None);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn submitted_commands_reach_every_replica() {
    let mut runtime = Runtime::builder().config(config()).build().await.unwrap();
    let handle = runtime.handle();
    let mut ticks = handle.subscribe(Topic::Tick);

    handle
        .submit(SimCommand::Build {
            actor: ActorId(2),
            location: LocationId(2),
            cell: Cell::new(10, 10),
        })
        .await
        .unwrap();
    handle
        .submit(SimCommand::Gift {
            thing: EntityId(u32::MAX),
            to: ActorId(1),
        })
        .await
        .unwrap();

    let tick = runtime.step().await.unwrap();
    assert_eq!((tick.commands, tick.rejected), (2, 1));
    assert!(runtime.last_reports().iter().all(|r| r.outcome.commands == 2));

    match ticks.recv().await.unwrap() {
        Event::Tick(event) => {
            assert_eq!(event.tick, Tick(1));
            assert_eq!(event.commands, 2);
            assert_eq!(event.digest, tick.digest);
        }
        other => panic!("unexpected event {other:?}"),
    }

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn a_tick_can_carry_more_commands_than_the_handle_buffers() {
    let config = RuntimeConfig {
        command_buffer_size: 2,
        ..config()
    };
    let mut runtime = Runtime::builder().config(config).build().await.unwrap();
    let handle = runtime.handle();
    let dump = |x| SimCommand::Dump {
        location: LocationId(1),
        cell: Cell::new(x, 0),
    };

    handle.try_submit(dump(1)).unwrap();
    handle.try_submit(dump(2)).unwrap();
    match handle.try_submit(dump(3)) {
        Err(RuntimeError::CommandBufferFull(command)) => runtime.enqueue(command),
        other => panic!("expected a full buffer, got {other:?}"),
    }
    runtime.enqueue(dump(4));
    assert_eq!(runtime.queued_commands(), 4);

    let tick = tokio::time::timeout(Duration::from_secs(2), runtime.step())
        .await
        .expect("step must not wait on the command buffer")
        .unwrap();
    assert_eq!((tick.commands, tick.rejected), (4, 0));
    assert!(!tick.diverged);
    assert_eq!(runtime.queued_commands(), 0);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn commands_at_the_grid_edges_keep_replicas_alive() {
    let mut runtime = Runtime::builder().config(config()).build().await.unwrap();

    runtime.enqueue(SimCommand::Build {
        actor: ActorId(1),
        location: LocationId(1),
        cell: Cell::new(i32::MIN, 0),
    });
    runtime.enqueue(SimCommand::Dump {
        location: LocationId(1),
        cell: Cell::new(5, 0),
    });
    runtime.enqueue(SimCommand::Dump {
        location: LocationId(1),
        cell: Cell::new(i32::MAX, i32::MIN),
    });

    let tick = runtime.step().await.unwrap();
    assert_eq!((tick.commands, tick.rejected), (3, 0));
    assert!(!tick.diverged);

    let summary = runtime.run_ticks(5).await.unwrap();
    assert_eq!(summary.last_tick, Tick(6));
    assert!(summary.divergent_ticks.is_empty());

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn overflow_requests_are_granted_once_and_installed_everywhere() {
    let config = RuntimeConfig {
        id_block_size: 20,
        grant_delay_ticks: 1,
        event_buffer_size: 1_024,
        ..config()
    };
    let mut runtime = Runtime::builder().config(config).build().await.unwrap();
    let mut ids = runtime.handle().subscribe(Topic::Ids);

    let summary = runtime.run_ticks(60).await.unwrap();
    assert!(summary.grants > 0);
    assert!(summary.divergent_ticks.is_empty());

    let mut granted = Vec::new();
    let mut requested = 0;
    while let Ok(event) = ids.try_recv() {
        match event {
            Event::Ids(IdEvent::OverflowRequested { .. }) => requested += 1,
            Event::Ids(IdEvent::BlockGranted(grant)) => granted.push(grant),
            other => panic!("unexpected event {other:?}"),
        }
    }
    // Every replica asks, the authority answers once per exhausted block.
    assert_eq!(requested, granted.len() * 3);
    let mut keys: Vec<_> = granted.iter().map(|g| (g.owner, g.replaces)).collect();
    keys.dedup();
    assert_eq!(keys.len(), granted.len());

    let reports = runtime.last_reports();
    assert!(reports.iter().all(|r| r.blocks == reports[0].blocks));
    let installed = &reports[0].blocks;
    let latest = granted
        .iter()
        .filter(|g| g.effective <= runtime.tick())
        .filter(|g| g.owner == OwnerKey::Location(LocationId(1)))
        .last();
    if let Some(grant) = latest {
        assert!(installed.iter().any(|b| b.owner == grant.owner && b.range == grant.range));
    }

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn divergent_replica_halts_the_run() {
    let diverging = LockstepConfig::default()
        .with_world_seed(0xbad)
        .with_rand_trace(RandTraceConfig::enabled());
    let mut runtime = Runtime::builder()
        .config(config())
        .replica_lockstep(1, diverging)
        .build()
        .await
        .unwrap();
    let mut divergence = runtime.handle().subscribe(Topic::Divergence);

    let err = runtime.run_ticks(20).await.unwrap_err();
    let RuntimeError::Diverged { tick } = err else {
        panic!("expected divergence, got {err:?}");
    };

    match divergence.recv().await.unwrap() {
        Event::Divergence(event) => {
            assert_eq!(event.tick, tick);
            assert_eq!(event.digests.len(), 3);
            assert!(event.first_rand_divergence.is_some());
        }
        other => panic!("unexpected event {other:?}"),
    }

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn zero_replicas_is_rejected() {
    let config = RuntimeConfig {
        replicas: 0,
        ..RuntimeConfig::default()
    };
    assert!(matches!(
        Runtime::builder().config(config).build().await,
        Err(RuntimeError::NoReplicas)
    ));
}

#[tokio::test]
async fn digests_are_persisted_when_a_directory_is_set() {
    let dir = tempfile::tempdir().unwrap();
    let config = RuntimeConfig {
        replicas: 2,
        digest_log_dir: Some(dir.path().to_path_buf()),
        ..config()
    };

    let mut runtime = Runtime::builder().config(config).build().await.unwrap();
    runtime.run_ticks(5).await.unwrap();
    runtime.shutdown().await.unwrap();

    let log = FileDigestLog::open_or_create(dir.path(), DIGEST_LOG_FILE).unwrap();
    let records = log.load_all().unwrap();
    assert_eq!(records.len(), 10);
    assert_eq!(records.last().map(|r| r.tick), Some(Tick(5)));
}
