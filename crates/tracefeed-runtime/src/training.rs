use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use tracing::{error, info, warn};

use tracefeed_core::config::TrainingConfig;
use tracefeed_core::sample::Batch;
use tracefeed_core::types::{StepStatus, TrainingOutcome, TrainingStep};
use tracefeed_observe::metrics::{DurationAgg, RollingMean};
use tracefeed_observe::time::unix_time_ms;
use tracefeed_store::sample_cache::FsSampleCache;
use tracefeed_store::weights::FsWeightStore;
use tracefeed_store::{SourceStore, TrainingStepStore, WeightStore};

use crate::coordinator::PrefetchCoordinator;
use crate::learner::{Learner, SampleSource};
use crate::observer::TrainingObserver;
use crate::shard::{spawn_shard, ShardContext, ShardHandle, ShardHandshake};

/// Identity of the step being run.
#[derive(Debug, Clone)]
pub struct TrainingRequest {
    pub training_sequence_id: String,
    pub step_index: u64,
    pub testing_run_id: Option<String>,
    pub application_id: Option<String>,
}

/// External collaborators and directories for a training step.
#[derive(Clone)]
pub struct TrainingEnvironment {
    pub source: Arc<dyn SourceStore>,
    pub steps: Arc<dyn TrainingStepStore>,
    pub samples: Arc<dyn SampleSource>,
    /// Sample cache and weight side-files.
    pub cache_dir: PathBuf,
    /// Parent of the per-step hand-off directory; the system temp dir when unset.
    pub scratch_dir: Option<PathBuf>,
    pub observers: Vec<Arc<dyn TrainingObserver>>,
}

/// Runs one training step end to end. Never panics on pipeline errors; the
/// outcome reports them and the step record is persisted either way.
///
/// A NaN loss ends the step early: the record is persisted as completed with
/// `had_nan` set, the model is not saved, and the outcome is unsuccessful.
pub async fn run_training_step(
    cfg: TrainingConfig,
    env: &TrainingEnvironment,
    request: TrainingRequest,
    learner: Box<dyn Learner>,
) -> TrainingOutcome {
    if let Err(err) = cfg.validate() {
        error!(error = %err, "invalid training config");
        return TrainingOutcome {
            success: false,
            training_step_id: None,
            exception: Some(err.to_string()),
        };
    }
    let cfg = Arc::new(cfg);

    let mut step = TrainingStep::new(
        &request.training_sequence_id,
        request.step_index,
        request.testing_run_id.clone(),
        request.application_id.clone(),
        unix_time_ms(),
    );
    let training_step_id = step.id.clone();
    info!(
        target: "tracefeed_proof",
        event = "training_step_started",
        training_step_id = %training_step_id,
        iterations = cfg.iterations_per_training_step,
        batch_size = cfg.batch_size as u64,
        shards = cfg.batch_prep_shards as u64,
        "training step started"
    );

    let result = match persist(env, &step).await {
        Ok(()) => drive(&cfg, env, &mut step, learner).await,
        Err(err) => Err(err),
    };

    match result {
        Ok(()) => {
            info!(
                target: "tracefeed_proof",
                event = "training_step_completed",
                training_step_id = %training_step_id,
                iterations = step.iterations_completed,
                had_nan = step.had_nan,
                average_loss = step.average_loss.unwrap_or(0.0),
                "training step completed"
            );
            TrainingOutcome {
                success: true,
                training_step_id: Some(training_step_id),
                exception: None,
            }
        }
        Err(err) => {
            error!(
                training_step_id = %training_step_id,
                error = %format!("{err:#}"),
                "training step failed"
            );
            // A step finalized by `drive` has already been persisted.
            if step.status == StepStatus::Running {
                let _ = step.finalize(StepStatus::Failed, unix_time_ms());
                if let Err(save_err) = persist(env, &step).await {
                    warn!(
                        training_step_id = %training_step_id,
                        error = %format!("{save_err:#}"),
                        "failed to persist failed training step"
                    );
                }
            }
            TrainingOutcome {
                success: false,
                training_step_id: Some(training_step_id),
                exception: Some(format!("{err:#}")),
            }
        }
    }
}

async fn persist(env: &TrainingEnvironment, step: &TrainingStep) -> Result<()> {
    let steps = env.steps.clone();
    let snapshot = step.clone();
    tokio::task::spawn_blocking(move || steps.save_training_step(&snapshot))
        .await
        .map_err(anyhow::Error::from)??;
    Ok(())
}

async fn drive(
    cfg: &Arc<TrainingConfig>,
    env: &TrainingEnvironment,
    step: &mut TrainingStep,
    learner: Box<dyn Learner>,
) -> Result<()> {
    let source = env.source.clone();
    let completed = tokio::task::spawn_blocking(move || source.load_completed_testing_steps())
        .await
        .map_err(anyhow::Error::from)??;
    anyhow::ensure!(
        !completed.is_empty(),
        "no completed testing steps available for training"
    );

    std::fs::create_dir_all(&env.cache_dir)?;
    // Removed on drop, whatever happens below.
    let batch_dir = match &env.scratch_dir {
        Some(parent) => {
            std::fs::create_dir_all(parent)?;
            tempfile::Builder::new()
                .prefix("tracefeed-batches-")
                .tempdir_in(parent)?
        }
        None => tempfile::Builder::new()
            .prefix("tracefeed-batches-")
            .tempdir()?,
    };

    let shards = start_shards(cfg, env, step, batch_dir.path().to_path_buf()).await?;
    let mut coordinator = PrefetchCoordinator::new(step.id.to_string(), cfg.clone(), shards)?;
    for observer in &env.observers {
        observer.training_step_started(step);
    }

    match training_loop(cfg, env, step, &mut coordinator, learner).await {
        Ok(mut learner) => {
            step.finalize(StepStatus::Completed, unix_time_ms())?;
            for observer in &env.observers {
                observer.training_step_finished(step);
            }
            persist(env, step).await?;
            coordinator.shutdown().await;

            if step.had_nan {
                warn!(
                    target: "tracefeed_proof",
                    event = "model_not_saved",
                    training_step_id = %step.id,
                    "NaN seen during training; model not saved"
                );
                return Err(anyhow!(
                    "NaN detected in learner losses after {} iterations of training step {}; model not saved",
                    step.iterations_completed,
                    step.id
                ));
            }
            let checkpoint = cfg.save_model_checkpoints.then(|| step.id.to_string());
            tokio::task::spawn_blocking(move || -> Result<()> {
                learner.save_model(None)?;
                if let Some(name) = checkpoint {
                    learner.save_model(Some(&name))?;
                }
                Ok(())
            })
            .await
            .map_err(anyhow::Error::from)??;
            Ok(())
        }
        Err(err) => {
            coordinator.shutdown().await;
            Err(err)
        }
    }
}

async fn start_shards(
    cfg: &Arc<TrainingConfig>,
    env: &TrainingEnvironment,
    step: &TrainingStep,
    batch_dir: PathBuf,
) -> Result<Vec<ShardHandle>> {
    let cache = Arc::new(FsSampleCache::from_config(&env.cache_dir, cfg));
    let weights: Arc<dyn WeightStore> = Arc::new(FsWeightStore::new(
        &env.cache_dir,
        cfg.trace_selection_maximum_weight,
    ));

    let shard_count = cfg.batch_prep_shards;
    let mut handles = Vec::with_capacity(shard_count);
    let mut handshakes = Vec::with_capacity(shard_count);
    for shard_index in 0..shard_count {
        let (handle, ready) = spawn_shard(ShardContext {
            shard_index,
            shard_count,
            training_step_id: step.id.to_string(),
            cfg: cfg.clone(),
            source: env.source.clone(),
            samples: env.samples.clone(),
            cache: cache.clone(),
            weights: weights.clone(),
            batch_dir: batch_dir.clone(),
        });
        handles.push(handle);
        handshakes.push(ready);
    }

    let mut failures = Vec::new();
    for (shard, ready) in handshakes.into_iter().enumerate() {
        match ready.await {
            Ok(ShardHandshake::Ready { sessions, traces }) => info!(
                training_step_id = %step.id,
                shard,
                sessions,
                traces,
                "shard ready"
            ),
            Ok(ShardHandshake::Error(reason)) => failures.push(format!("shard {shard}: {reason}")),
            Err(_) => failures.push(format!("shard {shard}: exited before reporting ready")),
        }
    }

    if !failures.is_empty() {
        let timeout = Duration::from_millis(cfg.shard_join_timeout_ms);
        for handle in handles {
            handle.shutdown(timeout).await;
        }
        bail!("shard initialization failed: {}", failures.join("; "));
    }
    Ok(handles)
}

async fn training_loop(
    cfg: &Arc<TrainingConfig>,
    env: &TrainingEnvironment,
    step: &mut TrainingStep,
    coordinator: &mut PrefetchCoordinator,
    mut learner: Box<dyn Learner>,
) -> Result<Box<dyn Learner>> {
    coordinator.fill_window()?;

    let loop_started = Instant::now();
    let core_learning = DurationAgg::default();
    let mut hit_rates = RollingMean::new(cfg.print_cache_hit_rate_moving_average_length);

    while step.iterations_completed < cfg.iterations_per_training_step {
        let fetched = coordinator.fetch_batches_for_iteration().await?;
        for f in &fetched {
            hit_rates.push(f.cache_hit_rate);
        }
        let (producing_shards, batches): (Vec<usize>, Vec<Batch>) =
            fetched.into_iter().map(|f| (f.shard, f.batch)).unzip();

        let next_iteration = step.iterations_completed + 1;
        let refresh_target = next_iteration % cfg.update_target_network_every == 0;
        let started = Instant::now();
        let (returned, batches, result) = tokio::task::spawn_blocking(move || {
            let result = learner.learn_from_batches(&batches).and_then(|losses| {
                if refresh_target && losses.is_some() {
                    learner.update_target_network()?;
                }
                Ok(losses)
            });
            (learner, batches, result)
        })
        .await
        .map_err(anyhow::Error::from)?;
        learner = returned;
        core_learning.record(started.elapsed());

        let Some(losses) = result? else {
            step.had_nan = true;
            warn!(
                target: "tracefeed_proof",
                event = "loss_nan",
                training_step_id = %step.id,
                iteration = next_iteration,
                "learner reported NaN loss; stopping"
            );
            break;
        };
        for loss in &losses {
            step.losses.record(loss);
        }
        coordinator.route_losses(&producing_shards, &batches, &losses)?;

        let iteration = step.complete_iteration();
        coordinator.check_starvation(iteration)?;

        if iteration % cfg.print_loss_iterations == 0 {
            report_progress(cfg, step, coordinator, &hit_rates, &core_learning, loop_started);
        }
        if iteration % cfg.iterations_between_db_saves == 0 {
            persist(env, step).await?;
        }
        for observer in &env.observers {
            observer.iteration_completed(step);
        }
    }
    Ok(learner)
}

fn report_progress(
    cfg: &TrainingConfig,
    step: &TrainingStep,
    coordinator: &PrefetchCoordinator,
    hit_rates: &RollingMean,
    core_learning: &DurationAgg,
    loop_started: Instant,
) {
    let iteration = step.iterations_completed;
    let avg = step.losses.moving_averages(cfg.print_loss_moving_average_length);
    let metrics = coordinator.metrics();
    info!(
        target: "tracefeed_metrics",
        training_step_id = %step.id,
        iteration,
        avg_time_per_iteration_secs = loop_started.elapsed().as_secs_f64() / iteration.max(1) as f64,
        core_learning_secs = core_learning.snapshot().avg_secs(),
        total_loss = avg.total_loss,
        total_rebalanced_loss = avg.total_rebalanced_loss,
        total_reward_loss = avg.total_reward_loss,
        present_reward_loss = avg.present_reward_loss,
        discounted_future_reward_loss = avg.discounted_future_reward_loss,
        state_value_loss = avg.state_value_loss,
        advantage_loss = avg.advantage_loss,
        action_probability_loss = avg.action_probability_loss,
        trace_prediction_loss = avg.trace_prediction_loss,
        execution_features_loss = avg.execution_features_loss,
        predicted_cursor_loss = avg.predicted_cursor_loss,
        batches_submitted = coordinator.submitted() as u64,
        total_batches_needed = coordinator.total_needed() as u64,
        batches_consumed = metrics.batches_consumed.get(),
        blocking_fetches = metrics.blocking_fetches.get(),
        starved_fetches = metrics.starved_fetches.get(),
        ready_batches = metrics.ready_batches.get(),
        in_flight = coordinator.in_flight() as u64,
        in_flight_high_water = metrics.in_flight_high_water.get(),
        starved = coordinator.is_starved(),
        "training progress"
    );
    if cfg.print_cache_hit_rate {
        info!(
            target: "tracefeed_metrics",
            training_step_id = %step.id,
            iteration,
            cache_hit_rate = hit_rates.mean().unwrap_or(0.0),
            samples = hit_rates.len() as u64,
            "cache hit rate"
        );
    }
}
