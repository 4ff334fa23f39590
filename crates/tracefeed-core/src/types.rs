use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                self.0.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(TraceId);
string_id!(SessionId);
string_id!(TestingStepId);
string_id!(TrainingStepId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
}

/// One recorded run of the application under test. Only `Completed` steps
/// contribute sessions to training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestingStep {
    pub id: TestingStepId,
    pub status: StepStatus,
    pub start_time_ms: u64,
    pub execution_sessions: Vec<SessionId>,
}

/// Ordered list of traces recorded in one session. Immutable from the
/// pipeline's point of view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSession {
    pub id: SessionId,
    pub execution_traces: Vec<TraceId>,
}

impl ExecutionSession {
    /// Traces that can become samples. The last trace of a session has no
    /// successor state and is never trained on.
    pub fn trainable_traces(&self) -> &[TraceId] {
        let n = self.execution_traces.len().saturating_sub(1);
        &self.execution_traces[..n]
    }
}

/// One recorded state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub id: TraceId,
    pub execution_session_id: SessionId,
    pub action_x: i32,
    pub action_y: i32,
    pub action_type: u32,
    pub reward: f32,
}

/// Priority weight used when drawing traces into batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceWeightData {
    pub id: TraceId,
    pub execution_session_id: SessionId,
    pub weight: f64,
}

/// Aggregate losses for one batch plus one reward loss per sample, aligned
/// with the batch's `trace_ids`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LossResult {
    pub total_reward_loss: f64,
    pub present_reward_loss: f64,
    pub discounted_future_reward_loss: f64,
    pub state_value_loss: f64,
    pub advantage_loss: f64,
    pub action_probability_loss: f64,
    pub trace_prediction_loss: f64,
    pub execution_features_loss: f64,
    pub predicted_cursor_loss: f64,
    pub total_loss: f64,
    pub total_rebalanced_loss: f64,
    pub batch_reward: f64,
    pub sample_reward_losses: Vec<f64>,
}

/// Append-only loss sequences, one entry per learned batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LossHistory {
    pub present_reward_losses: Vec<f64>,
    pub discounted_future_reward_losses: Vec<f64>,
    pub state_value_losses: Vec<f64>,
    pub advantage_losses: Vec<f64>,
    pub action_probability_losses: Vec<f64>,
    pub trace_prediction_losses: Vec<f64>,
    pub execution_features_losses: Vec<f64>,
    pub predicted_cursor_losses: Vec<f64>,
    pub total_reward_losses: Vec<f64>,
    pub total_losses: Vec<f64>,
    pub total_rebalanced_losses: Vec<f64>,
}

impl LossHistory {
    pub fn record(&mut self, result: &LossResult) {
        self.present_reward_losses.push(result.present_reward_loss);
        self.discounted_future_reward_losses
            .push(result.discounted_future_reward_loss);
        self.state_value_losses.push(result.state_value_loss);
        self.advantage_losses.push(result.advantage_loss);
        self.action_probability_losses
            .push(result.action_probability_loss);
        self.trace_prediction_losses
            .push(result.trace_prediction_loss);
        self.execution_features_losses
            .push(result.execution_features_loss);
        self.predicted_cursor_losses
            .push(result.predicted_cursor_loss);
        self.total_reward_losses.push(result.total_reward_loss);
        self.total_losses.push(result.total_loss);
        self.total_rebalanced_losses
            .push(result.total_rebalanced_loss);
    }

    pub fn len(&self) -> usize {
        self.total_losses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_losses.is_empty()
    }

    /// Mean of the last `window` entries of every category.
    pub fn moving_averages(&self, window: usize) -> LossAverages {
        LossAverages {
            total_reward_loss: tail_mean(&self.total_reward_losses, window),
            present_reward_loss: tail_mean(&self.present_reward_losses, window),
            discounted_future_reward_loss: tail_mean(&self.discounted_future_reward_losses, window),
            state_value_loss: tail_mean(&self.state_value_losses, window),
            advantage_loss: tail_mean(&self.advantage_losses, window),
            action_probability_loss: tail_mean(&self.action_probability_losses, window),
            trace_prediction_loss: tail_mean(&self.trace_prediction_losses, window),
            execution_features_loss: tail_mean(&self.execution_features_losses, window),
            predicted_cursor_loss: tail_mean(&self.predicted_cursor_losses, window),
            total_loss: tail_mean(&self.total_losses, window),
            total_rebalanced_loss: tail_mean(&self.total_rebalanced_losses, window),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossAverages {
    pub total_reward_loss: f64,
    pub present_reward_loss: f64,
    pub discounted_future_reward_loss: f64,
    pub state_value_loss: f64,
    pub advantage_loss: f64,
    pub action_probability_loss: f64,
    pub trace_prediction_loss: f64,
    pub execution_features_loss: f64,
    pub predicted_cursor_loss: f64,
    pub total_loss: f64,
    pub total_rebalanced_loss: f64,
}

/// Mean of the last `window` values; 0.0 for an empty slice.
pub fn tail_mean(values: &[f64], window: usize) -> f64 {
    let take = window.max(1).min(values.len());
    if take == 0 {
        return 0.0;
    }
    let tail = &values[values.len() - take..];
    tail.iter().sum::<f64>() / take as f64
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrainingStepError {
    #[error("iteration counter cannot move backwards ({current} -> {requested})")]
    IterationRegressed { current: u64, requested: u64 },
    #[error("training step {0} is already finalized")]
    AlreadyFinalized(String),
}

/// One execution of the learning loop. Persisted periodically and at the end,
/// whatever the outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingStep {
    pub id: TrainingStepId,
    pub training_sequence_id: String,
    pub testing_run_id: Option<String>,
    pub application_id: Option<String>,
    pub start_time_ms: u64,
    pub end_time_ms: Option<u64>,
    pub status: StepStatus,
    pub iterations_completed: u64,
    pub losses: LossHistory,
    pub had_nan: bool,
    pub average_time_per_iteration_secs: Option<f64>,
    pub average_loss: Option<f64>,
}

impl TrainingStep {
    pub fn id_for(training_sequence_id: &str, step_index: u64) -> TrainingStepId {
        TrainingStepId(format!("{training_sequence_id}_training_step_{step_index}"))
    }

    pub fn new(
        training_sequence_id: &str,
        step_index: u64,
        testing_run_id: Option<String>,
        application_id: Option<String>,
        start_time_ms: u64,
    ) -> Self {
        Self {
            id: Self::id_for(training_sequence_id, step_index),
            training_sequence_id: training_sequence_id.to_string(),
            testing_run_id,
            application_id,
            start_time_ms,
            end_time_ms: None,
            status: StepStatus::Running,
            iterations_completed: 0,
            losses: LossHistory::default(),
            had_nan: false,
            average_time_per_iteration_secs: None,
            average_loss: None,
        }
    }

    pub fn complete_iteration(&mut self) -> u64 {
        self.iterations_completed = self.iterations_completed.saturating_add(1);
        self.iterations_completed
    }

    /// Raises the counter to `value`; lowering it is rejected.
    pub fn set_iterations_completed(&mut self, value: u64) -> Result<(), TrainingStepError> {
        if value < self.iterations_completed {
            return Err(TrainingStepError::IterationRegressed {
                current: self.iterations_completed,
                requested: value,
            });
        }
        self.iterations_completed = value;
        Ok(())
    }

    pub fn finalize(&mut self, status: StepStatus, end_time_ms: u64) -> Result<(), TrainingStepError> {
        if self.status != StepStatus::Running {
            return Err(TrainingStepError::AlreadyFinalized(self.id.0.clone()));
        }
        self.end_time_ms = Some(end_time_ms);
        self.status = status;
        if self.iterations_completed > 0 {
            let elapsed_ms = end_time_ms.saturating_sub(self.start_time_ms);
            self.average_time_per_iteration_secs =
                Some(elapsed_ms as f64 / 1000.0 / self.iterations_completed as f64);
        }
        if !self.losses.is_empty() {
            self.average_loss = Some(tail_mean(&self.losses.total_losses, usize::MAX));
        }
        Ok(())
    }
}

/// Structured result of one training step, returned whatever happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingOutcome {
    pub success: bool,
    pub training_step_id: Option<TrainingStepId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
}
