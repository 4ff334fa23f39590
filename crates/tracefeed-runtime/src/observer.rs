use tracefeed_core::types::TrainingStep;

/// Hooks into a running training step. Every method defaults to a no-op.
///
/// Called on the driver task between iterations, so implementations should
/// return quickly.
pub trait TrainingObserver: Send + Sync + 'static {
    /// Once the step record is persisted and every shard is ready.
    fn training_step_started(&self, _step: &TrainingStep) {}

    /// After each completed iteration, once losses are recorded.
    fn iteration_completed(&self, _step: &TrainingStep) {}

    /// After the step is finalized and before it is persisted and the model
    /// is saved.
    fn training_step_finished(&self, _step: &TrainingStep) {}
}
