use anyhow::Result;

use tracefeed_core::sample::{Batch, Sample};
use tracefeed_core::types::{ExecutionSession, ExecutionTrace, LossResult};

/// The model side of a training step.
///
/// Calls are blocking and made from a dedicated blocking thread, one at a
/// time, so implementations need `Send` but not `Sync`.
pub trait Learner: Send + 'static {
    /// One loss result per batch, in order. `Ok(None)` signals a numeric
    /// failure (NaN); the step stops learning and the model is not saved.
    fn learn_from_batches(&mut self, batches: &[Batch]) -> Result<Option<Vec<LossResult>>>;

    fn update_target_network(&mut self) -> Result<()> {
        Ok(())
    }

    fn save_model(&mut self, checkpoint: Option<&str>) -> Result<()>;
}

/// Turns a recorded session into uncropped samples.
pub trait SampleSource: Send + Sync + 'static {
    /// `traces` are the session's traces in recorded order. Returns one
    /// sample per trace except the last.
    fn prepare_session_samples(
        &self,
        session: &ExecutionSession,
        traces: &[ExecutionTrace],
    ) -> Result<Vec<Sample>>;
}
