use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info};

use tracefeed_core::config::TrainingConfig;
use tracefeed_core::sample::Batch;
use tracefeed_core::types::LossResult;
use tracefeed_observe::metrics::{Counter, DurationAgg, Gauge};

use crate::shard::{ShardCommand, ShardHandle, ShutdownOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StarvationSignal {
    Starved,
    Full,
}

/// Hysteresis over the number of finished-but-unconsumed batches.
///
/// Below a quarter of the prefetch depth the consumer is starved; at or
/// above it again the starvation clears. Transitions are at least
/// `min_gap` iterations apart.
#[derive(Debug, Clone)]
pub struct StarvationMonitor {
    depth: usize,
    min_gap: u64,
    starved: bool,
    last_adjustment: u64,
}

impl StarvationMonitor {
    pub fn new(depth: usize, min_gap: u64) -> Self {
        Self {
            depth,
            min_gap,
            starved: false,
            last_adjustment: 0,
        }
    }

    pub fn is_starved(&self) -> bool {
        self.starved
    }

    pub fn observe(&mut self, iteration: u64, ready: usize) -> Option<StarvationSignal> {
        if iteration <= self.last_adjustment.saturating_add(self.min_gap) {
            return None;
        }
        let low = (ready as f64) < self.depth as f64 / 4.0;
        let signal = match (low, self.starved) {
            (true, false) => StarvationSignal::Starved,
            (false, true) => StarvationSignal::Full,
            _ => return None,
        };
        self.starved = signal == StarvationSignal::Starved;
        self.last_adjustment = iteration;
        Some(signal)
    }
}

#[derive(Debug, Default)]
pub struct CoordinatorMetrics {
    pub batches_submitted: Counter,
    pub batches_consumed: Counter,
    pub blocking_fetches: Counter,
    pub starved_fetches: Counter,
    pub ready_batches: Gauge,
    pub in_flight: Gauge,
    pub in_flight_high_water: Gauge,
    pub fetch_wait: DurationAgg,
}

#[derive(Debug)]
pub struct FetchedBatch {
    pub shard: usize,
    pub batch: Batch,
    pub cache_hit_rate: f64,
}

struct PendingBatch {
    shard: usize,
    task: JoinHandle<Result<FetchedBatch>>,
}

/// Keeps a rolling window of batch requests in flight across the shards
/// and hands finished batches to the training loop.
pub struct PrefetchCoordinator {
    training_step_id: String,
    cfg: Arc<TrainingConfig>,
    shards: Vec<ShardHandle>,
    pending: VecDeque<PendingBatch>,
    next_shard: usize,
    submitted: usize,
    total_needed: usize,
    permits: Arc<Semaphore>,
    monitor: StarvationMonitor,
    metrics: Arc<CoordinatorMetrics>,
}

impl PrefetchCoordinator {
    pub fn new(
        training_step_id: impl Into<String>,
        cfg: Arc<TrainingConfig>,
        shards: Vec<ShardHandle>,
    ) -> Result<Self> {
        anyhow::ensure!(!shards.is_empty(), "coordinator needs at least one shard");
        let permits = cfg.max_batch_prep_thread_workers.max(1) * shards.len();
        Ok(Self {
            training_step_id: training_step_id.into(),
            total_needed: cfg.total_batches_needed(),
            monitor: StarvationMonitor::new(
                cfg.precompute_batches_count,
                cfg.min_batches_between_starve_state_adjustments,
            ),
            permits: Arc::new(Semaphore::new(permits)),
            cfg,
            shards,
            pending: VecDeque::new(),
            next_shard: 0,
            submitted: 0,
            metrics: Arc::new(CoordinatorMetrics::default()),
        })
    }

    pub fn metrics(&self) -> Arc<CoordinatorMetrics> {
        self.metrics.clone()
    }

    pub fn submitted(&self) -> usize {
        self.submitted
    }

    pub fn total_needed(&self) -> usize {
        self.total_needed
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    pub fn is_starved(&self) -> bool {
        self.monitor.is_starved()
    }

    /// Submits requests until the prefetch depth or the step total is reached.
    pub fn fill_window(&mut self) -> Result<()> {
        while self.pending.len() < self.cfg.precompute_batches_count
            && self.submitted < self.total_needed
        {
            self.submit()?;
        }
        info!(
            target: "tracefeed_proof",
            event = "prefetch_window_filled",
            training_step_id = %self.training_step_id,
            in_flight = self.pending.len() as u64,
            total_needed = self.total_needed as u64,
            "prefetch window filled"
        );
        Ok(())
    }

    fn submit(&mut self) -> Result<()> {
        let shard = self.next_shard;
        self.next_shard = (self.next_shard + 1) % self.shards.len();
        let reply = self.shards[shard].request_batch()?;
        let permits = self.permits.clone();

        let task = tokio::spawn(async move {
            let _permit = permits.acquire_owned().await?;
            let prepared = reply
                .await
                .map_err(|_| anyhow!("shard {shard} dropped its batch request"))?;
            let handoff = prepared.clone();
            let batch = tokio::task::spawn_blocking(move || handoff.take())
                .await
                .map_err(anyhow::Error::from)??;
            Ok(FetchedBatch {
                shard: prepared.shard,
                batch,
                cache_hit_rate: prepared.cache_hit_rate,
            })
        });

        self.pending.push_back(PendingBatch { shard, task });
        self.submitted += 1;
        self.metrics.batches_submitted.inc();
        let in_flight = self.metrics.in_flight.add(1);
        self.metrics.in_flight_high_water.max(in_flight);
        Ok(())
    }

    /// Finished but not yet consumed requests.
    pub fn count_ready(&self) -> usize {
        let ready = self.pending.iter().filter(|p| p.task.is_finished()).count();
        self.metrics.ready_batches.set(ready as u64);
        ready
    }

    /// Collects one iteration's batches. Any finished request is taken
    /// first; otherwise this blocks on the oldest. Each consumed request is
    /// replaced until the step total has been submitted.
    pub async fn fetch_batches_for_iteration(&mut self) -> Result<Vec<FetchedBatch>> {
        let wanted = self.cfg.batches_per_iteration;
        let log_threshold = Duration::from_millis(self.cfg.starved_wait_log_threshold_ms);
        let mut out = Vec::with_capacity(wanted);

        for _ in 0..wanted {
            let finished = self.pending.iter().position(|p| p.task.is_finished());
            let (pending, blocked_since) = match finished.and_then(|i| self.pending.remove(i)) {
                Some(p) => (p, None),
                None => {
                    let p = self
                        .pending
                        .pop_front()
                        .ok_or_else(|| anyhow!("no batch requests in flight"))?;
                    (p, Some(Instant::now()))
                }
            };

            let shard = pending.shard;
            self.metrics.in_flight.sub(1);
            let fetched = pending.task.await.map_err(anyhow::Error::from)??;

            if let Some(since) = blocked_since {
                let waited = since.elapsed();
                self.metrics.blocking_fetches.inc();
                self.metrics.fetch_wait.record(waited);
                if waited >= log_threshold {
                    self.metrics.starved_fetches.inc();
                    info!(
                        target: "tracefeed_metrics",
                        training_step_id = %self.training_step_id,
                        shard,
                        waited_ms = waited.as_millis() as u64,
                        "waited for batch preparation"
                    );
                }
            }

            self.metrics.batches_consumed.inc();
            out.push(fetched);
            if self.submitted < self.total_needed {
                self.submit()?;
            }
        }
        Ok(out)
    }

    /// Runs the starvation hysteresis and broadcasts a transition to every
    /// shard.
    pub fn check_starvation(&mut self, iteration: u64) -> Result<Option<StarvationSignal>> {
        let ready = self.count_ready();
        let Some(signal) = self.monitor.observe(iteration, ready) else {
            return Ok(None);
        };
        for shard in &self.shards {
            let cmd = match signal {
                StarvationSignal::Starved => ShardCommand::Starved,
                StarvationSignal::Full => ShardCommand::Full,
            };
            shard.send(cmd)?;
        }
        info!(
            target: "tracefeed_proof",
            event = "starvation_signal",
            training_step_id = %self.training_step_id,
            iteration,
            ready = ready as u64,
            depth = self.cfg.precompute_batches_count as u64,
            signal = ?signal,
            "broadcast starvation state"
        );
        Ok(Some(signal))
    }

    /// Sends each sample's reward loss to the shard that produced its batch.
    pub fn route_losses(
        &self,
        producing_shards: &[usize],
        batches: &[Batch],
        losses: &[LossResult],
    ) -> Result<()> {
        anyhow::ensure!(
            producing_shards.len() == batches.len() && batches.len() == losses.len(),
            "learner returned {} loss results for {} batches",
            losses.len(),
            batches.len()
        );
        for ((&shard, batch), loss) in producing_shards.iter().zip(batches).zip(losses) {
            anyhow::ensure!(
                loss.sample_reward_losses.len() == batch.trace_ids.len(),
                "learner returned {} sample losses for {} samples",
                loss.sample_reward_losses.len(),
                batch.trace_ids.len()
            );
            let handle = self
                .shards
                .get(shard)
                .ok_or_else(|| anyhow!("batch from unknown shard {shard}"))?;
            for (trace_id, &sample_loss) in batch.trace_ids.iter().zip(&loss.sample_reward_losses) {
                handle.send(ShardCommand::UpdateLoss {
                    execution_trace_id: trace_id.clone(),
                    sample_reward_loss: sample_loss,
                })?;
            }
        }
        Ok(())
    }

    /// Abandons outstanding requests and stops every shard in parallel.
    pub async fn shutdown(mut self) -> Vec<(usize, ShutdownOutcome)> {
        let abandoned = self.pending.len();
        for p in self.pending.drain(..) {
            p.task.abort();
        }
        self.metrics.in_flight.sub(abandoned as u64);
        let timeout = Duration::from_millis(self.cfg.shard_join_timeout_ms);
        let mut joins = JoinSet::new();
        for shard in self.shards.drain(..) {
            joins.spawn(async move {
                let index = shard.index();
                (index, shard.shutdown(timeout).await)
            });
        }
        let mut outcomes = Vec::new();
        while let Some(res) = joins.join_next().await {
            match res {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => debug!(error = %err, "shard shutdown task failed"),
            }
        }
        outcomes.sort_by_key(|(index, _)| *index);
        info!(
            target: "tracefeed_proof",
            event = "shards_stopped",
            training_step_id = %self.training_step_id,
            abandoned_requests = abandoned as u64,
            outcomes = ?outcomes,
            "shards stopped"
        );
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starvation_hysteresis_follows_ready_counts() {
        let mut monitor = StarvationMonitor::new(20, 1);
        let counts = [18, 17, 4, 2, 10, 19];
        let signals: Vec<Option<StarvationSignal>> = counts
            .iter()
            .enumerate()
            .map(|(i, &ready)| monitor.observe(i as u64, ready))
            .collect();
        assert_eq!(
            signals,
            vec![
                None,
                None,
                Some(StarvationSignal::Starved),
                None,
                Some(StarvationSignal::Full),
                None
            ]
        );
    }

    #[test]
    fn transitions_respect_minimum_gap() {
        let mut monitor = StarvationMonitor::new(20, 5);
        assert_eq!(monitor.observe(3, 0), None);
        assert_eq!(monitor.observe(6, 0), Some(StarvationSignal::Starved));
        assert_eq!(monitor.observe(8, 20), None);
        assert!(monitor.is_starved());
        assert_eq!(monitor.observe(12, 20), Some(StarvationSignal::Full));
    }

    #[test]
    fn exactly_a_quarter_is_not_starved() {
        let mut monitor = StarvationMonitor::new(20, 0);
        assert_eq!(monitor.observe(1, 5), None);
        assert_eq!(monitor.observe(2, 4), Some(StarvationSignal::Starved));
        assert_eq!(monitor.observe(3, 5), Some(StarvationSignal::Full));
    }
}
