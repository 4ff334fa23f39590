//! Deterministic stand-ins for the model and the trace renderer.
//!
//! Used by the `tracefeed-train` binary and by the integration tests to
//! exercise the whole pipeline without a real model.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::info;

use tracefeed_core::sample::{Batch, Frame, Sample};
use tracefeed_core::types::{
    ExecutionSession, ExecutionTrace, LossResult, SessionId, StepStatus, TestingStep,
    TestingStepId, TraceId,
};
use tracefeed_store::source::FsSourceStore;

use crate::learner::{Learner, SampleSource};

/// Renders every trace as noise seeded by its id, so a trace always maps to
/// the same sample.
#[derive(Debug, Clone)]
pub struct SyntheticSampleSource {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub symbols_per_sample: usize,
}

impl SyntheticSampleSource {
    pub fn new(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height,
            width,
            symbols_per_sample: 4,
        }
    }

    fn frame(&self, trace_id: &TraceId, channels: usize, salt: u64) -> Result<Frame> {
        let mut rng = StdRng::seed_from_u64(seed_for(trace_id.as_str()) ^ salt);
        let data = (0..channels * self.height * self.width)
            .map(|_| rng.gen_range(0.0f32..1.0))
            .collect();
        Frame::new(channels, self.height, self.width, data)
            .with_context(|| format!("rendering trace {trace_id}"))
    }

    fn action_map(&self, trace: &ExecutionTrace) -> Frame {
        let mut map = Frame::zeros(1, self.height, self.width);
        let x = usize::try_from(trace.action_x).unwrap_or(0).min(self.width - 1);
        let y = usize::try_from(trace.action_y).unwrap_or(0).min(self.height - 1);
        map.data[y * self.width + x] = 1.0;
        map
    }

    fn symbols(&self, trace_id: &TraceId, salt: u64) -> (Vec<u32>, Vec<f32>) {
        let mut rng = StdRng::seed_from_u64(seed_for(trace_id.as_str()) ^ salt);
        let count = rng.gen_range(0..=self.symbols_per_sample);
        let indexes = (0..count).map(|_| rng.gen_range(0..512)).collect();
        let weights = (0..count).map(|_| rng.gen_range(0.0f32..1.0)).collect();
        (indexes, weights)
    }
}

const IMAGE_SALT: u64 = 0x1;
const MASK_SALT: u64 = 0x2;
const SYMBOL_SALT: u64 = 0x3;
const FUTURE_SALT: u64 = 0x4;

impl SampleSource for SyntheticSampleSource {
    fn prepare_session_samples(
        &self,
        session: &ExecutionSession,
        traces: &[ExecutionTrace],
    ) -> Result<Vec<Sample>> {
        if self.height == 0 || self.width == 0 {
            return Err(anyhow!("synthetic frames need a non-empty image size"));
        }
        let mut samples = Vec::with_capacity(traces.len().saturating_sub(1));
        for pair in traces.windows(2) {
            let (trace, next) = (&pair[0], &pair[1]);
            if trace.execution_session_id != session.id {
                return Err(anyhow!(
                    "trace {} belongs to session {}, not {}",
                    trace.id,
                    trace.execution_session_id,
                    session.id
                ));
            }
            let (symbol_indexes, symbol_weights) = self.symbols(&trace.id, SYMBOL_SALT);
            let (next_symbol_indexes, next_symbol_weights) = self.symbols(&next.id, SYMBOL_SALT);
            let (decaying_future_symbol_indexes, decaying_future_symbol_weights) =
                self.symbols(&trace.id, FUTURE_SALT);
            samples.push(Sample {
                trace_id: trace.id.clone(),
                processed_image: self.frame(&trace.id, self.channels, IMAGE_SALT)?,
                pixel_action_map: self.action_map(trace),
                reward_pixel_mask: self.frame(&trace.id, 1, MASK_SALT)?,
                next_processed_image: self.frame(&next.id, self.channels, IMAGE_SALT)?,
                next_pixel_action_map: self.action_map(next),
                action_x: trace.action_x,
                action_y: trace.action_y,
                action_type: trace.action_type,
                reward: trace.reward,
                symbol_indexes,
                symbol_weights,
                next_symbol_indexes,
                next_symbol_weights,
                decaying_future_symbol_indexes,
                decaying_future_symbol_weights,
            });
        }
        Ok(samples)
    }
}

/// FNV-1a, stable across runs and toolchains.
fn seed_for(key: &str) -> u64 {
    key.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
        (hash ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
    })
}

/// What a [`SyntheticLearner`] has been asked to do so far.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LearnerLog {
    pub batches_seen: usize,
    pub samples_seen: usize,
    pub learn_calls: u64,
    pub target_updates: u64,
    pub saved_models: Vec<Option<String>>,
}

/// Scores batches with a cheap function of their contents.
#[derive(Debug, Clone, Default)]
pub struct SyntheticLearner {
    nan_at_call: Option<u64>,
    log: Arc<Mutex<LearnerLog>>,
}

impl SyntheticLearner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports NaN on the `call`-th (1-based) `learn_from_batches`.
    pub fn with_nan_at(call: u64) -> Self {
        Self {
            nan_at_call: Some(call),
            log: Arc::default(),
        }
    }

    /// Shared view of the log; stays valid after the learner is moved.
    pub fn log(&self) -> Arc<Mutex<LearnerLog>> {
        self.log.clone()
    }

    fn with_log<T>(&self, f: impl FnOnce(&mut LearnerLog) -> T) -> Result<T> {
        let mut log = self
            .log
            .lock()
            .map_err(|_| anyhow!("learner log lock poisoned"))?;
        Ok(f(&mut log))
    }
}

fn score_batch(batch: &Batch) -> LossResult {
    let pixels = &batch.processed_images.data;
    let mean = if pixels.is_empty() {
        0.0
    } else {
        pixels.iter().map(|&v| f64::from(v)).sum::<f64>() / pixels.len() as f64
    };
    let sample_reward_losses: Vec<f64> = batch
        .rewards
        .iter()
        .map(|&r| (f64::from(r) - mean).abs())
        .collect();
    let reward_loss = if sample_reward_losses.is_empty() {
        0.0
    } else {
        sample_reward_losses.iter().sum::<f64>() / sample_reward_losses.len() as f64
    };
    let batch_reward = if batch.rewards.is_empty() {
        0.0
    } else {
        batch.rewards.iter().map(|&r| f64::from(r)).sum::<f64>() / batch.rewards.len() as f64
    };
    LossResult {
        total_reward_loss: reward_loss,
        present_reward_loss: reward_loss * 0.5,
        discounted_future_reward_loss: reward_loss * 0.5,
        state_value_loss: mean * 0.1,
        advantage_loss: mean * 0.05,
        action_probability_loss: mean * 0.2,
        trace_prediction_loss: 0.0,
        execution_features_loss: 0.0,
        predicted_cursor_loss: 0.0,
        total_loss: reward_loss + mean * 0.35,
        total_rebalanced_loss: reward_loss + mean * 0.35,
        batch_reward,
        sample_reward_losses,
    }
}

impl Learner for SyntheticLearner {
    fn learn_from_batches(&mut self, batches: &[Batch]) -> Result<Option<Vec<LossResult>>> {
        let call = self.with_log(|log| {
            log.learn_calls += 1;
            log.batches_seen += batches.len();
            log.samples_seen += batches.iter().map(|b| b.trace_ids.len()).sum::<usize>();
            log.learn_calls
        })?;
        if self.nan_at_call == Some(call) {
            return Ok(None);
        }
        Ok(Some(batches.iter().map(score_batch).collect()))
    }

    fn update_target_network(&mut self) -> Result<()> {
        self.with_log(|log| log.target_updates += 1)
    }

    fn save_model(&mut self, checkpoint: Option<&str>) -> Result<()> {
        self.with_log(|log| log.saved_models.push(checkpoint.map(str::to_string)))
    }
}

/// Shape of a synthetic recording set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedSpec {
    pub testing_steps: usize,
    pub sessions_per_step: usize,
    pub traces_per_session: usize,
    pub image_width: usize,
    pub image_height: usize,
    /// Extra steps left in `Running`, which training must ignore.
    pub running_steps: usize,
    pub seed: u64,
}

impl Default for SeedSpec {
    fn default() -> Self {
        Self {
            testing_steps: 4,
            sessions_per_step: 2,
            traces_per_session: 6,
            image_width: 48,
            image_height: 32,
            running_steps: 0,
            seed: 7,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedSummary {
    pub testing_steps: usize,
    pub sessions: usize,
    pub traces: usize,
}

/// Writes testing steps, sessions and traces under `store`'s root.
pub fn seed_synthetic_root(store: &FsSourceStore, spec: &SeedSpec) -> Result<SeedSummary> {
    anyhow::ensure!(
        spec.image_width > 0 && spec.image_height > 0,
        "seed image size must be non-zero"
    );
    let mut rng = StdRng::seed_from_u64(spec.seed);
    let mut summary = SeedSummary::default();

    for step_index in 0..spec.testing_steps + spec.running_steps {
        let status = if step_index < spec.testing_steps {
            StepStatus::Completed
        } else {
            StepStatus::Running
        };
        let mut sessions = Vec::with_capacity(spec.sessions_per_step);
        for session_index in 0..spec.sessions_per_step {
            let session_id = SessionId(format!("s{step_index:03}-{session_index:03}"));
            let mut trace_ids = Vec::with_capacity(spec.traces_per_session);
            for trace_index in 0..spec.traces_per_session {
                let trace = ExecutionTrace {
                    id: TraceId(format!("{session_id}-t{trace_index:03}")),
                    execution_session_id: session_id.clone(),
                    action_x: rng.gen_range(0..spec.image_width as i32),
                    action_y: rng.gen_range(0..spec.image_height as i32),
                    action_type: rng.gen_range(0..3),
                    reward: rng.gen_range(0.0f32..1.0),
                };
                store.put_trace(&trace)?;
                trace_ids.push(trace.id);
                summary.traces += 1;
            }
            store.put_session(&ExecutionSession {
                id: session_id.clone(),
                execution_traces: trace_ids,
            })?;
            sessions.push(session_id);
            summary.sessions += 1;
        }
        store.put_testing_step(&TestingStep {
            id: TestingStepId(format!("testing-{step_index:03}")),
            status,
            start_time_ms: 1_700_000_000_000 + step_index as u64 * 60_000,
            execution_sessions: sessions,
        })?;
        summary.testing_steps += 1;
    }

    info!(
        target: "tracefeed_proof",
        event = "synthetic_root_seeded",
        root = %store.root().display(),
        testing_steps = summary.testing_steps as u64,
        sessions = summary.sessions as u64,
        traces = summary.traces as u64,
        "seeded synthetic recordings"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracefeed_store::SourceStore;

    fn trace(id: &str, session: &str, x: i32, y: i32) -> ExecutionTrace {
        ExecutionTrace {
            id: TraceId::from(id),
            execution_session_id: SessionId::from(session),
            action_x: x,
            action_y: y,
            action_type: 1,
            reward: 0.5,
        }
    }

    #[test]
    fn samples_skip_last_trace_and_are_deterministic() -> anyhow::Result<()> {
        let source = SyntheticSampleSource::new(3, 8, 10);
        let session = ExecutionSession {
            id: SessionId::from("s"),
            execution_traces: vec!["a".into(), "b".into(), "c".into()],
        };
        let traces = vec![trace("a", "s", 1, 2), trace("b", "s", 3, 4), trace("c", "s", 9, 7)];

        let first = source.prepare_session_samples(&session, &traces)?;
        let second = source.prepare_session_samples(&session, &traces)?;
        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
        assert_eq!(first[0].processed_image.shape(), (3, 8, 10));
        assert_eq!(first[0].next_processed_image, first[1].processed_image);
        assert_eq!(first[1].next_pixel_action_map.get(0, 7, 9), 1.0);
        Ok(())
    }

    #[test]
    fn nan_is_reported_on_requested_call() -> anyhow::Result<()> {
        let mut learner = SyntheticLearner::with_nan_at(2);
        assert!(learner.learn_from_batches(&[])?.is_some());
        assert!(learner.learn_from_batches(&[])?.is_none());
        learner.save_model(Some("ckpt"))?;
        let log = learner.log();
        let log = log.lock().map_err(|_| anyhow!("poisoned"))?;
        assert_eq!(log.learn_calls, 2);
        assert_eq!(log.saved_models, vec![Some("ckpt".to_string())]);
        Ok(())
    }

    #[test]
    fn seeded_root_lists_only_completed_steps() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FsSourceStore::new(dir.path());
        let spec = SeedSpec {
            testing_steps: 2,
            running_steps: 1,
            sessions_per_step: 1,
            traces_per_session: 3,
            ..SeedSpec::default()
        };
        let summary = seed_synthetic_root(&store, &spec)?;
        assert_eq!(summary.testing_steps, 3);
        assert_eq!(summary.traces, 9);
        assert_eq!(store.load_completed_testing_steps()?.len(), 2);
        Ok(())
    }
}
