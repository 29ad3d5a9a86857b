use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use pruner::testing::{MemoryStore, MemoryStoreConfig};
use pruner::{FailureReason, StoreError, TracingProgress};
use treeprune::{Configuration, PruneOrchestrator, PruneStatus, TreePath};

fn chat_archive() -> serde_json::Value {
    let rooms: serde_json::Map<_, _> = (0..12)
        .map(|room| {
            let messages: serde_json::Map<_, _> = (0..25)
                .map(|msg| {
                    (
                        format!("m{msg:04}"),
                        serde_json::json!({"author": format!("user{}", msg % 5), "text": "hello there"}),
                    )
                })
                .collect();
            (format!("room{room:02}"), serde_json::Value::Object(messages))
        })
        .collect();
    serde_json::json!({"archive": rooms, "live": {"room00": {"m0000": "still here"}}})
}

#[tokio::test]
async fn test_prune_with_file_configuration() -> anyhow::Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    writeln!(
        file,
        r#"
        [pruner]
        max_concurrency = 6
        page_size = 5
        call_timeout = "2s"

        [pruner.retry]
        max_attempts = 4
        base_delay = "1ms"
        max_delay = "10ms"
        jitter = 0.1

        [logging]
        level = "pruner=debug,info"
        "#
    )?;

    let config = Configuration::load_from_path(file.path())?;
    common::telemetry::init_tracing(&config.logging);
    assert_eq!(config.pruner.page_size, 5);
    assert_eq!(config.pruner.call_timeout, Duration::from_secs(2));

    let store = Arc::new(MemoryStore::from_json(
        chat_archive(),
        MemoryStoreConfig::default().with_write_size_limit(600),
    ));
    let orchestrator = PruneOrchestrator::new(store.clone(), store.clone(), config.pruner)?
        .with_progress(TracingProgress);

    let report = orchestrator.run(TreePath::parse("/archive")).await;

    assert_eq!(report.status, PruneStatus::Succeeded);
    assert!(!store.exists(&TreePath::parse("/archive")));
    assert!(store.exists(&TreePath::parse("/live/room00/m0000")));
    assert!(report.metrics.paths_fanned_out >= 1);
    assert!(store.peak_in_flight() <= 6);
    tracing::info!(?report.metrics, "archive pruned");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_rerun_after_partial_failure_finishes_the_job() -> anyhow::Result<()> {
    let config = Configuration::default().pruner;
    let failing = TreePath::parse("/archive/room03");
    let store = Arc::new(
        MemoryStore::from_json(
            chat_archive(),
            MemoryStoreConfig::default().with_write_size_limit(600),
        )
        .with_delete_faults(
            failing.clone(),
            [Some(StoreError::NotFound("room03 moved".into()))],
        ),
    );
    let orchestrator = PruneOrchestrator::new(store.clone(), store.clone(), config)?;

    let first = orchestrator.run(TreePath::parse("/archive")).await;
    assert_eq!(first.status, PruneStatus::PartialFailure);
    assert!(matches!(
        first.failed.get(&failing),
        Some(FailureReason::Fatal(StoreError::NotFound(_)))
    ));
    assert!(store.exists(&failing));
    assert!(!store.exists(&TreePath::parse("/archive/room04")));

    // only the failed room is left, so a second run picks up exactly that
    let second = orchestrator.run(TreePath::parse("/archive")).await;
    assert!(second.is_success());
    assert!(!store.exists(&TreePath::parse("/archive")));
    Ok(())
}
