use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use tracefeed_core::config::TrainingConfig;
use tracefeed_core::sample::Batch;
use tracefeed_core::types::{SessionId, TraceId, TraceWeightData};
use tracefeed_observe::metrics::{Counter, DurationAgg, Gauge, RollingMean, ScopedTimer};
use tracefeed_store::retry::{Backoff, RetryPolicy};
use tracefeed_store::sample_cache::FsSampleCache;
use tracefeed_store::{write_atomic_in, SourceStore, StoreError, WeightStore};

use crate::assembler::{assemble, prepare_drawn_sample, AugmentParams};
use crate::learner::SampleSource;
use crate::pool::{plan_pool_size, PoolGenerations, PoolSizing, ReplaceOutcome};
use crate::selector::{SelectionSnapshot, SelectorParams, TraceSelector};

/// How often the control loop checks whether a draining pool can retire.
const RETIRE_TICK: Duration = Duration::from_millis(50);

/// Commands accepted by a shard, processed in arrival order.
#[derive(Debug)]
pub enum ShardCommand {
    Batch(BatchRequest),
    Starved,
    Full,
    UpdateLoss {
        execution_trace_id: TraceId,
        sample_reward_loss: f64,
    },
    Quit,
}

/// A coordinator's request for one batch. Carries its reply channel, so a
/// failed job can be requeued without losing the slot.
#[derive(Debug)]
pub struct BatchRequest {
    reply: oneshot::Sender<PreparedBatch>,
    attempt: u32,
}

impl BatchRequest {
    pub fn new() -> (Self, oneshot::Receiver<PreparedBatch>) {
        let (reply, rx) = oneshot::channel();
        (Self { reply, attempt: 1 }, rx)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    fn retry(self) -> Self {
        Self {
            reply: self.reply,
            attempt: self.attempt.saturating_add(1),
        }
    }
}

/// A batch written to its hand-off file, waiting for the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedBatch {
    pub shard: usize,
    pub path: PathBuf,
    pub sample_count: usize,
    pub cache_hit_rate: f64,
}

impl PreparedBatch {
    /// Reads the hand-off file and deletes it.
    pub fn take(&self) -> Result<Batch> {
        let bytes = std::fs::read(&self.path)
            .with_context(|| format!("reading hand-off file {}", self.path.display()))?;
        let batch: Batch = bincode::deserialize(&bytes)?;
        std::fs::remove_file(&self.path)?;
        Ok(batch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    Initializing,
    Ready,
    DrainingOldPool,
    Terminated,
}

/// Exactly one of these is sent per shard before it accepts commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardHandshake {
    Ready { sessions: usize, traces: usize },
    Error(String),
}

#[derive(Debug, Error)]
pub enum ShardInitError {
    #[error("shard {shard}: store error: {source}")]
    Store {
        shard: usize,
        #[source]
        source: StoreError,
    },
    #[error("shard {shard} has no trainable traces")]
    NoTraces { shard: usize },
    #[error("shard {shard}: {reason}")]
    Setup { shard: usize, reason: String },
}

#[derive(Debug, Default)]
pub struct ShardMetrics {
    pub jobs_submitted: Counter,
    pub jobs_completed: Counter,
    pub jobs_failed: Counter,
    pub jobs_requeued: Counter,
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub sessions_regenerated: Counter,
    pub pool_resizes: Counter,
    pub pools_retired: Counter,
    pub weight_writebacks: Counter,
    pub active_workers: Gauge,
    pub job_duration: DurationAgg,
}

/// Everything a shard needs, passed explicitly at spawn.
#[derive(Clone)]
pub struct ShardContext {
    pub shard_index: usize,
    pub shard_count: usize,
    pub training_step_id: String,
    pub cfg: Arc<TrainingConfig>,
    pub source: Arc<dyn SourceStore>,
    pub samples: Arc<dyn SampleSource>,
    pub cache: Arc<FsSampleCache>,
    pub weights: Arc<dyn WeightStore>,
    /// Hand-off directory, owned by the coordinator.
    pub batch_dir: PathBuf,
}

pub struct ShardHandle {
    index: usize,
    cmd_tx: mpsc::UnboundedSender<ShardCommand>,
    state_rx: watch::Receiver<ShardState>,
    metrics: Arc<ShardMetrics>,
    task: JoinHandle<Result<()>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Joined,
    Failed(String),
    Aborted,
}

impl ShardHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> ShardState {
        *self.state_rx.borrow()
    }

    pub fn metrics(&self) -> Arc<ShardMetrics> {
        self.metrics.clone()
    }

    pub fn send(&self, cmd: ShardCommand) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .map_err(|_| anyhow!("shard {} is no longer accepting commands", self.index))
    }

    pub fn request_batch(&self) -> Result<oneshot::Receiver<PreparedBatch>> {
        let (req, rx) = BatchRequest::new();
        self.send(ShardCommand::Batch(req))?;
        Ok(rx)
    }

    /// `quit`, then a bounded join; a shard that does not exit in time is
    /// aborted.
    pub async fn shutdown(self, timeout: Duration) -> ShutdownOutcome {
        let _ = self.cmd_tx.send(ShardCommand::Quit);
        let shard = self.index;
        let mut task = self.task;
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(Ok(()))) => ShutdownOutcome::Joined,
            Ok(Ok(Err(err))) => ShutdownOutcome::Failed(format!("{err:#}")),
            Ok(Err(err)) => ShutdownOutcome::Failed(err.to_string()),
            Err(_) => {
                warn!(shard, timeout_ms = timeout.as_millis() as u64, "shard did not exit; aborting");
                task.abort();
                ShutdownOutcome::Aborted
            }
        }
    }
}

/// Starts a shard task. The returned receiver yields its startup handshake.
pub fn spawn_shard(ctx: ShardContext) -> (ShardHandle, oneshot::Receiver<ShardHandshake>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ShardState::Initializing);
    let (ready_tx, ready_rx) = oneshot::channel();
    let metrics = Arc::new(ShardMetrics::default());
    let index = ctx.shard_index;
    let requeue = cmd_tx.downgrade();

    let task = tokio::spawn(run_shard(
        ctx,
        cmd_rx,
        requeue,
        state_tx,
        ready_tx,
        metrics.clone(),
    ));

    (
        ShardHandle {
            index,
            cmd_tx,
            state_rx,
            metrics,
            task,
        },
        ready_rx,
    )
}

async fn run_shard(
    ctx: ShardContext,
    cmd_rx: mpsc::UnboundedReceiver<ShardCommand>,
    requeue: mpsc::WeakUnboundedSender<ShardCommand>,
    state_tx: watch::Sender<ShardState>,
    ready_tx: oneshot::Sender<ShardHandshake>,
    metrics: Arc<ShardMetrics>,
) -> Result<()> {
    let shard = ctx.shard_index;
    let ctx = Arc::new(ctx);

    let started = async {
        let report = initialize(ctx.clone()).await?;
        let sessions = report.sessions;
        let traces = report.weights.len();
        let worker = ShardWorker::new(ctx.clone(), report.weights, requeue, state_tx, metrics)?;
        Ok::<_, ShardInitError>((worker, sessions, traces))
    }
    .await;

    let worker = match started {
        Ok((worker, sessions, traces)) => {
            info!(
                target: "tracefeed_proof",
                event = "shard_ready",
                training_step_id = %ctx.training_step_id,
                shard,
                sessions,
                traces,
                "shard initialized"
            );
            let _ = ready_tx.send(ShardHandshake::Ready { sessions, traces });
            worker
        }
        Err(err) => {
            warn!(shard, error = %err, "shard initialization failed");
            let _ = ready_tx.send(ShardHandshake::Error(err.to_string()));
            return Err(err.into());
        }
    };

    worker.run(cmd_rx).await
}

struct InitReport {
    sessions: usize,
    weights: Vec<TraceWeightData>,
}

async fn initialize(ctx: Arc<ShardContext>) -> Result<InitReport, ShardInitError> {
    let shard = ctx.shard_index;
    tokio::task::spawn_blocking(move || load_shard_weights(&ctx))
        .await
        .map_err(|e| ShardInitError::Setup {
            shard,
            reason: e.to_string(),
        })?
}

/// Most recent completed testing steps, partitioned across shards by their
/// position in that ordering. Weights load in parallel but keep load order.
fn load_shard_weights(ctx: &ShardContext) -> Result<InitReport, ShardInitError> {
    let shard = ctx.shard_index;
    let store_err = |source| ShardInitError::Store { shard, source };

    let mut steps = ctx.source.load_completed_testing_steps().map_err(store_err)?;
    steps.sort_by(|a, b| b.start_time_ms.cmp(&a.start_time_ms));
    steps.truncate(ctx.cfg.number_of_recent_testing_sequences_to_use);

    let mut sessions = 0usize;
    let mut traces: Vec<(TraceId, SessionId)> = Vec::new();
    for (i, step) in steps.iter().enumerate() {
        if i % ctx.shard_count.max(1) != shard {
            continue;
        }
        for session_id in &step.execution_sessions {
            match ctx.source.load_session(session_id).map_err(store_err)? {
                Some(session) => {
                    sessions += 1;
                    traces.extend(
                        session
                            .trainable_traces()
                            .iter()
                            .map(|t| (t.clone(), session.id.clone())),
                    );
                }
                None => warn!(shard, session_id = %session_id, "session not found; skipped"),
            }
        }
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(ctx.cfg.max_initialization_workers.max(1))
        .thread_name(move |i| format!("tracefeed-shard{shard}-init-{i}"))
        .build()
        .map_err(|e| ShardInitError::Setup {
            shard,
            reason: e.to_string(),
        })?;
    let weights: Vec<TraceWeightData> = pool.install(|| {
        traces
            .par_iter()
            .filter_map(|(trace_id, session_id)| match ctx.weights.load(trace_id, session_id) {
                Ok(w) => Some(w),
                Err(err) => {
                    warn!(shard, trace_id = %trace_id, error = %err, "failed to load trace weight; skipped");
                    None
                }
            })
            .collect()
    });

    if weights.is_empty() {
        return Err(ShardInitError::NoTraces { shard });
    }
    Ok(InitReport { sessions, weights })
}

struct JobDone {
    generation: u64,
    request: BatchRequest,
    outcome: Result<PreparedBatch, String>,
}

struct ShardWorker {
    ctx: Arc<ShardContext>,
    selector: TraceSelector,
    augment: AugmentParams,
    sizing: PoolSizing,
    pools: PoolGenerations,
    starved: bool,
    cache_full: bool,
    resize_pending: bool,
    batches_since_reset: u64,
    hit_rates: RollingMean,
    rng: StdRng,
    next_job: u64,
    done_tx: mpsc::UnboundedSender<JobDone>,
    done_rx: mpsc::UnboundedReceiver<JobDone>,
    requeue: mpsc::WeakUnboundedSender<ShardCommand>,
    state_tx: watch::Sender<ShardState>,
    saves: HashMap<TraceId, JoinHandle<()>>,
    save_permits: Arc<Semaphore>,
    metrics: Arc<ShardMetrics>,
}

impl ShardWorker {
    fn new(
        ctx: Arc<ShardContext>,
        weights: Vec<TraceWeightData>,
        requeue: mpsc::WeakUnboundedSender<ShardCommand>,
        state_tx: watch::Sender<ShardState>,
        metrics: Arc<ShardMetrics>,
    ) -> Result<Self, ShardInitError> {
        let shard = ctx.shard_index;
        let cfg = ctx.cfg.clone();
        let selector = TraceSelector::new(SelectorParams::from_config(&cfg), weights)
            .map_err(|_| ShardInitError::NoTraces { shard })?;
        let pools = PoolGenerations::new(shard, cfg.initial_batch_prep_workers).map_err(|e| {
            ShardInitError::Setup {
                shard,
                reason: format!("{e:#}"),
            }
        })?;
        metrics.active_workers.set(pools.active().workers() as u64);
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        state_tx.send_replace(ShardState::Ready);

        Ok(Self {
            selector,
            augment: AugmentParams::from_config(&cfg),
            sizing: PoolSizing::from_config(&cfg),
            pools,
            starved: false,
            cache_full: false,
            resize_pending: false,
            batches_since_reset: 0,
            hit_rates: RollingMean::new(cfg.cache_full_state_moving_average_length),
            rng: StdRng::from_entropy(),
            next_job: 0,
            done_tx,
            done_rx,
            requeue,
            state_tx,
            saves: HashMap::new(),
            save_permits: Arc::new(Semaphore::new(cfg.background_trace_save_workers.max(1))),
            metrics,
            ctx,
        })
    }

    fn shard(&self) -> usize {
        self.ctx.shard_index
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<ShardCommand>) -> Result<()> {
        let mut tick = tokio::time::interval(RETIRE_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(ShardCommand::Quit) | None => break,
                    Some(cmd) => self.handle_command(cmd)?,
                },
                Some(done) = self.done_rx.recv() => self.on_job_done(done),
                _ = tick.tick() => {}
            }
            self.retire_drained_pool()?;
        }

        self.shutdown(&mut tick).await;
        Ok(())
    }

    fn handle_command(&mut self, cmd: ShardCommand) -> Result<()> {
        match cmd {
            ShardCommand::Batch(req) => {
                self.batches_since_reset += 1;
                if self.batches_since_reset >= self.ctx.cfg.reset_workers_every_n_batches {
                    self.batches_since_reset = 0;
                    self.resize_pending = true;
                }
                if self.resize_pending {
                    self.resize()?;
                }
                self.submit(req);
            }
            ShardCommand::Starved => {
                info!(shard = self.shard(), "consumer starved");
                self.starved = true;
                self.resize_pending = true;
                self.resize()?;
            }
            ShardCommand::Full => {
                info!(shard = self.shard(), "consumer caught up");
                self.starved = false;
                self.resize_pending = true;
                self.resize()?;
            }
            ShardCommand::UpdateLoss {
                execution_trace_id,
                sample_reward_loss,
            } => self.update_loss(execution_trace_id, sample_reward_loss),
            ShardCommand::Quit => {}
        }
        Ok(())
    }

    fn resize(&mut self) -> Result<()> {
        if self.pools.draining().is_some() {
            debug!(shard = self.shard(), "resize deferred until old pool drains");
            self.resize_pending = true;
            return Ok(());
        }
        let mean_hit_rate = self.hit_rates.mean();
        let plan = plan_pool_size(mean_hit_rate, self.starved, &self.sizing);
        self.cache_full = plan.cache_full;
        if let ReplaceOutcome::Replaced { retired, active } = self.pools.replace(plan.workers)? {
            self.metrics.pool_resizes.inc();
            self.metrics.active_workers.set(plan.workers as u64);
            self.state_tx.send_replace(ShardState::DrainingOldPool);
            info!(
                target: "tracefeed_proof",
                event = "pool_resized",
                shard = self.shard(),
                retired_generation = retired,
                generation = active,
                workers = plan.workers,
                cache_full = plan.cache_full,
                starved = self.starved,
                mean_cache_hit_rate = mean_hit_rate.unwrap_or(0.0),
                "computation pool replaced"
            );
        }
        self.resize_pending = false;
        Ok(())
    }

    fn retire_drained_pool(&mut self) -> Result<()> {
        if let Some(generation) = self.pools.retire_drained() {
            self.metrics.pools_retired.inc();
            self.state_tx.send_replace(ShardState::Ready);
            debug!(shard = self.shard(), generation, "old pool retired");
            if self.resize_pending {
                self.resize()?;
            }
        }
        Ok(())
    }

    fn submit(&mut self, request: BatchRequest) {
        let shard = self.shard();
        let seq = self.next_job;
        self.next_job += 1;
        let job = BatchJob {
            ctx: self.ctx.clone(),
            snapshot: self.selector.snapshot(),
            augment: self.augment,
            cache_warm: self.cache_full,
            seed: self.rng.gen(),
            path: self.ctx.batch_dir.join(format!("shard{shard}-{seq}.batch")),
            metrics: self.metrics.clone(),
        };
        let done_tx = self.done_tx.clone();
        let generation = self.pools.active().generation();
        self.metrics.jobs_submitted.inc();

        self.pools.active().spawn(move || {
            let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| job.run())) {
                Ok(Ok(prepared)) => Ok(prepared),
                Ok(Err(err)) => Err(format!("{err:#}")),
                Err(_) => Err("batch job panicked".to_string()),
            };
            let _ = done_tx.send(JobDone {
                generation,
                request,
                outcome,
            });
        });
    }

    fn on_job_done(&mut self, done: JobDone) {
        let shard = self.shard();
        match done.outcome {
            Ok(prepared) => {
                self.metrics.jobs_completed.inc();
                self.hit_rates.push(prepared.cache_hit_rate);
                if let Err(orphan) = done.request.reply.send(prepared) {
                    let _ = std::fs::remove_file(&orphan.path);
                }
            }
            Err(reason) => {
                self.metrics.jobs_failed.inc();
                warn!(
                    shard,
                    generation = done.generation,
                    attempt = done.request.attempt(),
                    error = %reason,
                    "batch job failed; requeueing"
                );
                let retry = ShardCommand::Batch(done.request.retry());
                let requeued = self
                    .requeue
                    .upgrade()
                    .is_some_and(|tx| tx.send(retry).is_ok());
                if requeued {
                    self.metrics.jobs_requeued.inc();
                } else {
                    debug!(shard, "command channel closed; request dropped");
                }
            }
        }
    }

    fn update_loss(&mut self, trace_id: TraceId, loss: f64) {
        let Some(updated) = self.selector.update_weight(&trace_id, loss) else {
            return;
        };
        self.saves.retain(|_, h| !h.is_finished());
        if self.saves.contains_key(&trace_id) {
            debug!(shard = self.shard(), trace_id = %trace_id, "weight write-back pending; skipped");
            return;
        }

        let store = self.ctx.weights.clone();
        let permits = self.save_permits.clone();
        let metrics = self.metrics.clone();
        let shard = self.shard();
        let handle = tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let trace_id = updated.id.clone();
            match tokio::task::spawn_blocking(move || store.save(&updated)).await {
                Ok(Ok(())) => metrics.weight_writebacks.inc(),
                Ok(Err(err)) => {
                    warn!(shard, trace_id = %trace_id, error = %err, "weight write-back failed")
                }
                Err(err) => {
                    warn!(shard, trace_id = %trace_id, error = %err, "weight write-back task failed")
                }
            }
        });
        self.saves.insert(trace_id, handle);
    }

    /// Waits for in-flight jobs so nothing is written to the hand-off
    /// directory after quit, then for pending weight write-backs.
    async fn shutdown(mut self, tick: &mut tokio::time::Interval) {
        let shard = self.shard();
        while self.pools.total_outstanding() > 0 {
            tokio::select! {
                Some(done) = self.done_rx.recv() => self.finish_on_quit(done),
                _ = tick.tick() => {}
            }
        }
        while let Ok(done) = self.done_rx.try_recv() {
            self.finish_on_quit(done);
        }

        let pending_saves = self.saves.len();
        for (_, handle) in self.saves.drain() {
            let _ = handle.await;
        }
        self.state_tx.send_replace(ShardState::Terminated);
        info!(
            target: "tracefeed_proof",
            event = "shard_quit",
            shard,
            pending_saves,
            jobs_submitted = self.metrics.jobs_submitted.get(),
            jobs_failed = self.metrics.jobs_failed.get(),
            pool_resizes = self.metrics.pool_resizes.get(),
            avg_job_secs = self.metrics.job_duration.snapshot().avg_secs(),
            "shard stopped"
        );
    }

    fn finish_on_quit(&mut self, done: JobDone) {
        if let Ok(prepared) = done.outcome {
            if let Err(orphan) = done.request.reply.send(prepared) {
                let _ = std::fs::remove_file(&orphan.path);
            }
        }
    }
}

/// One unit of batch preparation, run on a computation pool thread.
struct BatchJob {
    ctx: Arc<ShardContext>,
    snapshot: SelectionSnapshot,
    augment: AugmentParams,
    cache_warm: bool,
    seed: u64,
    path: PathBuf,
    metrics: Arc<ShardMetrics>,
}

impl BatchJob {
    fn run(self) -> Result<PreparedBatch> {
        let _timer = ScopedTimer::new(&self.metrics.job_duration);
        let mut rng = StdRng::seed_from_u64(self.seed);
        let chosen = self
            .snapshot
            .draw(self.ctx.cfg.batch_size, self.cache_warm, &mut rng)?;

        let mut hits = 0usize;
        let mut drawn = Vec::with_capacity(chosen.len());
        for entry in &chosen {
            let cached = match self.ctx.cache.get(&entry.id)? {
                Some(sample) => {
                    hits += 1;
                    sample
                }
                None => {
                    self.metrics.cache_misses.inc();
                    regenerate_session(&self.ctx, &entry.execution_session_id)?;
                    self.metrics.sessions_regenerated.inc();
                    self.ctx.cache.get(&entry.id)?.ok_or_else(|| {
                        anyhow!(
                            "trace {} missing from cache after regenerating session {}",
                            entry.id,
                            entry.execution_session_id
                        )
                    })?
                }
            };
            drawn.push(prepare_drawn_sample(&cached, &self.augment, &mut rng)?);
        }
        self.metrics.cache_hits.inc_by(hits as u64);

        let batch = assemble(&drawn)?;
        let bytes = bincode::serialize(&batch)?;
        write_atomic_in(&self.path, &bytes)?;
        Ok(PreparedBatch {
            shard: self.ctx.shard_index,
            path: self.path,
            sample_count: batch.sample_count(),
            cache_hit_rate: hits as f64 / chosen.len().max(1) as f64,
        })
    }
}

/// Rebuilds every sample of a session and writes them through the cache.
fn regenerate_session(ctx: &ShardContext, session_id: &SessionId) -> Result<usize> {
    let policy = RetryPolicy::new(
        ctx.cfg.session_regeneration_max_attempts,
        Backoff::Fixed(Duration::from_millis(ctx.cfg.cache_write_backoff_base_ms)),
    );
    policy
        .run("regenerate_session", |_| regenerate_session_once(ctx, session_id))
        .map_err(|e| {
            e.last.context(format!(
                "regenerating session {session_id} failed after {} attempts",
                e.attempts
            ))
        })
}

fn regenerate_session_once(ctx: &ShardContext, session_id: &SessionId) -> Result<usize> {
    let session = ctx
        .source
        .load_session(session_id)?
        .ok_or_else(|| anyhow!("session {session_id} not found"))?;
    let mut traces = Vec::with_capacity(session.execution_traces.len());
    for trace_id in &session.execution_traces {
        let trace = ctx
            .source
            .load_trace(trace_id)?
            .ok_or_else(|| anyhow!("trace {trace_id} of session {session_id} not found"))?;
        traces.push(trace);
    }

    let samples = ctx.samples.prepare_session_samples(&session, &traces)?;
    for sample in &samples {
        ctx.cache.put(&sample.trace_id, sample)?;
    }
    debug!(
        shard = ctx.shard_index,
        session_id = %session_id,
        samples = samples.len(),
        "session regenerated"
    );
    Ok(samples.len())
}
