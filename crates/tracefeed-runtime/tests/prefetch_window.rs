use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use tracefeed_core::config::TrainingConfig;
use tracefeed_runtime::coordinator::PrefetchCoordinator;
use tracefeed_runtime::learner::SampleSource;
use tracefeed_runtime::shard::{spawn_shard, ShardContext, ShardHandshake, ShutdownOutcome};
use tracefeed_runtime::synthetic::{seed_synthetic_root, SeedSpec, SyntheticSampleSource};
use tracefeed_store::sample_cache::FsSampleCache;
use tracefeed_store::source::FsSourceStore;
use tracefeed_store::weights::FsWeightStore;

fn temp_root(test_name: &str) -> Result<PathBuf> {
    let mut root = std::env::temp_dir();
    let suffix = format!(
        "tracefeed-prefetch-{}-{}-{}",
        test_name,
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
    );
    root.push(suffix);
    std::fs::create_dir_all(&root)?;
    Ok(root)
}

fn window_config() -> TrainingConfig {
    TrainingConfig {
        iterations_per_training_step: 2,
        batches_per_iteration: 2,
        training_surplus_batches: 1,
        precompute_batches_count: 3,
        batch_prep_shards: 1,
        max_batch_prep_thread_workers: 2,
        batch_size: 3,
        initial_batch_prep_workers: 1,
        cache_full_batch_prep_workers: 1,
        max_batch_prep_workers: 2,
        max_initialization_workers: 2,
        cache_write_backoff_base_ms: 1,
        crop_width: 8,
        crop_height: 8,
        next_state_crop_width: 8,
        next_state_crop_height: 8,
        shard_join_timeout_ms: 10_000,
        ..TrainingConfig::default()
    }
}

async fn coordinator(test_name: &str, cfg: TrainingConfig) -> Result<PrefetchCoordinator> {
    let root = temp_root(test_name)?;
    let store = Arc::new(FsSourceStore::new(root.join("data")));
    seed_synthetic_root(
        &store,
        &SeedSpec {
            testing_steps: 1,
            sessions_per_step: 1,
            traces_per_session: 4,
            image_width: 24,
            image_height: 20,
            running_steps: 0,
            seed: 5,
        },
    )?;
    let batch_dir = root.join("batches");
    std::fs::create_dir_all(&batch_dir)?;

    let cache_dir = root.join("cache");
    let samples: Arc<dyn SampleSource> = Arc::new(SyntheticSampleSource::new(1, 20, 24));
    let cfg = Arc::new(cfg);
    let (handle, ready) = spawn_shard(ShardContext {
        shard_index: 0,
        shard_count: 1,
        training_step_id: "seq_training_step_0".to_string(),
        cache: Arc::new(FsSampleCache::from_config(&cache_dir, &cfg)),
        weights: Arc::new(FsWeightStore::new(&cache_dir, cfg.trace_selection_maximum_weight)),
        cfg: cfg.clone(),
        source: store,
        samples,
        batch_dir,
    });
    let handshake = tokio::time::timeout(Duration::from_secs(10), ready).await??;
    assert!(matches!(handshake, ShardHandshake::Ready { traces: 3, .. }));
    PrefetchCoordinator::new("seq_training_step_0", cfg, vec![handle])
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn window_is_topped_up_until_the_step_total() -> Result<()> {
    let mut coordinator = coordinator("topped-up", window_config()).await?;
    let metrics = coordinator.metrics();
    assert_eq!(coordinator.total_needed(), 5);

    coordinator.fill_window()?;
    assert_eq!(coordinator.submitted(), 3);
    assert_eq!(coordinator.in_flight(), 3);

    let first = coordinator.fetch_batches_for_iteration().await?;
    assert_eq!(first.len(), 2);
    assert!(first.iter().all(|f| f.batch.sample_count() == 3));
    // Both consumed requests were replaced, reaching the step total.
    assert_eq!(coordinator.submitted(), 5);
    assert_eq!(coordinator.in_flight(), 3);

    let second = coordinator.fetch_batches_for_iteration().await?;
    assert_eq!(second.len(), 2);
    assert_eq!(coordinator.submitted(), 5);
    assert_eq!(coordinator.in_flight(), 1);

    assert_eq!(metrics.batches_submitted.get(), 5);
    assert_eq!(metrics.batches_consumed.get(), 4);
    assert_eq!(metrics.in_flight.get(), 1);
    assert_eq!(metrics.in_flight_high_water.get(), 3);

    let outcomes = coordinator.shutdown().await;
    assert_eq!(outcomes, vec![(0, ShutdownOutcome::Joined)]);
    assert_eq!(metrics.in_flight.get(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn window_never_exceeds_a_small_step_total() -> Result<()> {
    let cfg = TrainingConfig {
        iterations_per_training_step: 1,
        batches_per_iteration: 1,
        training_surplus_batches: 0,
        ..window_config()
    };
    let mut coordinator = coordinator("small-total", cfg).await?;

    coordinator.fill_window()?;
    assert_eq!(coordinator.total_needed(), 1);
    assert_eq!(coordinator.submitted(), 1);
    assert_eq!(coordinator.in_flight(), 1);

    coordinator.fetch_batches_for_iteration().await?;
    assert_eq!(coordinator.submitted(), 1);
    assert_eq!(coordinator.in_flight(), 0);

    let exhausted = coordinator.fetch_batches_for_iteration().await;
    assert!(exhausted.is_err());

    coordinator.shutdown().await;
    Ok(())
}
