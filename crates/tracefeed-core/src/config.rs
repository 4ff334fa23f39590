use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config read error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Knobs for one training step and its batch-supply pipeline.
///
/// Every field has a default, so a JSON file only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    // Learning loop.
    pub iterations_per_training_step: u64,
    pub batches_per_iteration: usize,
    pub training_surplus_batches: usize,
    pub batch_size: usize,
    pub update_target_network_every: u64,
    pub iterations_between_db_saves: u64,
    pub save_model_checkpoints: bool,

    // Prefetch window and shards.
    /// Prefetch depth: how many batch requests are kept in flight.
    pub precompute_batches_count: usize,
    pub batch_prep_shards: usize,
    pub max_batch_prep_thread_workers: usize,
    pub min_batches_between_starve_state_adjustments: u64,
    /// Fetches that block longer than this are logged as starvation.
    pub starved_wait_log_threshold_ms: u64,
    pub shard_join_timeout_ms: u64,

    // Shard initialisation.
    pub number_of_recent_testing_sequences_to_use: usize,
    pub max_initialization_workers: usize,

    // Elastic computation pool.
    pub initial_batch_prep_workers: usize,
    pub cache_full_batch_prep_workers: usize,
    pub max_batch_prep_workers: usize,
    pub reset_workers_every_n_batches: u64,
    pub cache_full_state_moving_average_length: usize,
    pub cache_full_state_min_cache_hit_rate: f64,
    pub background_trace_save_workers: usize,

    // Trace selection.
    pub trace_selection_minimum_weight: f64,
    pub trace_selection_maximum_weight: f64,
    pub trace_selection_cache_not_full_state_one_side_bias: f64,
    pub trace_selection_min_loss_ratio_difference_for_save: f64,

    // Sample cache.
    pub cache_write_max_attempts: u32,
    pub cache_write_backoff_base_ms: u64,
    pub cache_write_backoff_factor: f64,
    pub session_regeneration_max_attempts: u32,
    pub cache_read_legacy_names: bool,

    // Draw-time augmentation.
    pub enable_image_cropping: bool,
    pub enable_next_state_image_cropping: bool,
    pub crop_width: usize,
    pub crop_height: usize,
    pub next_state_crop_width: usize,
    pub next_state_crop_height: usize,
    pub crop_center_random_x_displacement: i32,
    pub crop_center_random_y_displacement: i32,
    pub augmentation_pixel_noise: f32,

    // Reporting.
    pub print_loss_iterations: u64,
    pub print_loss_moving_average_length: usize,
    pub print_cache_hit_rate: bool,
    pub print_cache_hit_rate_moving_average_length: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            iterations_per_training_step: 1000,
            batches_per_iteration: 1,
            training_surplus_batches: 25,
            batch_size: 32,
            update_target_network_every: 50,
            iterations_between_db_saves: 25,
            save_model_checkpoints: false,

            precompute_batches_count: 50,
            batch_prep_shards: 2,
            max_batch_prep_thread_workers: 12,
            min_batches_between_starve_state_adjustments: 50,
            starved_wait_log_threshold_ms: 500,
            shard_join_timeout_ms: 30_000,

            number_of_recent_testing_sequences_to_use: 100,
            max_initialization_workers: 32,

            initial_batch_prep_workers: 2,
            cache_full_batch_prep_workers: 2,
            max_batch_prep_workers: 8,
            reset_workers_every_n_batches: 50,
            cache_full_state_moving_average_length: 50,
            cache_full_state_min_cache_hit_rate: 0.95,
            background_trace_save_workers: 2,

            trace_selection_minimum_weight: 0.1,
            trace_selection_maximum_weight: 5.0,
            trace_selection_cache_not_full_state_one_side_bias: 5.0,
            trace_selection_min_loss_ratio_difference_for_save: 0.1,

            cache_write_max_attempts: 10,
            cache_write_backoff_base_ms: 1000,
            cache_write_backoff_factor: 1.5,
            session_regeneration_max_attempts: 10,
            cache_read_legacy_names: true,

            enable_image_cropping: true,
            enable_next_state_image_cropping: true,
            crop_width: 256,
            crop_height: 256,
            next_state_crop_width: 256,
            next_state_crop_height: 256,
            crop_center_random_x_displacement: 50,
            crop_center_random_y_displacement: 50,
            augmentation_pixel_noise: 0.02,

            print_loss_iterations: 100,
            print_loss_moving_average_length: 100,
            print_cache_hit_rate: true,
            print_cache_hit_rate_moving_average_length: 100,
        }
    }
}

impl TrainingConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path.as_ref())?;
        let cfg: TrainingConfig = serde_json::from_slice(&bytes)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Batches the coordinator submits over the whole step.
    pub fn total_batches_needed(&self) -> usize {
        let per_step = usize::try_from(self.iterations_per_training_step).unwrap_or(usize::MAX);
        per_step
            .saturating_mul(self.batches_per_iteration)
            .saturating_add(self.training_surplus_batches)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("batches_per_iteration", self.batches_per_iteration),
            ("batch_size", self.batch_size),
            ("precompute_batches_count", self.precompute_batches_count),
            ("batch_prep_shards", self.batch_prep_shards),
            ("max_batch_prep_thread_workers", self.max_batch_prep_thread_workers),
            ("initial_batch_prep_workers", self.initial_batch_prep_workers),
            ("cache_full_batch_prep_workers", self.cache_full_batch_prep_workers),
            ("max_batch_prep_workers", self.max_batch_prep_workers),
            ("background_trace_save_workers", self.background_trace_save_workers),
            ("max_initialization_workers", self.max_initialization_workers),
            (
                "cache_full_state_moving_average_length",
                self.cache_full_state_moving_average_length,
            ),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{field} must be > 0")));
            }
        }
        if self.update_target_network_every == 0
            || self.iterations_between_db_saves == 0
            || self.print_loss_iterations == 0
            || self.reset_workers_every_n_batches == 0
        {
            return Err(ConfigError::Invalid(
                "iteration periods must be > 0".to_string(),
            ));
        }
        if self.cache_write_max_attempts == 0 || self.session_regeneration_max_attempts == 0 {
            return Err(ConfigError::Invalid("retry attempts must be > 0".to_string()));
        }
        if !(self.trace_selection_minimum_weight <= self.trace_selection_maximum_weight) {
            return Err(ConfigError::Invalid(format!(
                "trace_selection_minimum_weight {} exceeds maximum {}",
                self.trace_selection_minimum_weight, self.trace_selection_maximum_weight
            )));
        }
        if !self.cache_write_backoff_factor.is_finite() || self.cache_write_backoff_factor < 1.0 {
            return Err(ConfigError::Invalid(
                "cache_write_backoff_factor must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() -> anyhow::Result<()> {
        let cfg: TrainingConfig = serde_json::from_str(r#"{"batch_size": 4, "batch_prep_shards": 3}"#)?;
        assert_eq!(cfg.batch_size, 4);
        assert_eq!(cfg.batch_prep_shards, 3);
        assert_eq!(cfg.precompute_batches_count, TrainingConfig::default().precompute_batches_count);
        cfg.validate()?;
        Ok(())
    }

    #[test]
    fn total_batches_includes_surplus() {
        let cfg = TrainingConfig {
            iterations_per_training_step: 10,
            batches_per_iteration: 3,
            training_surplus_batches: 5,
            ..Default::default()
        };
        assert_eq!(cfg.total_batches_needed(), 35);
    }

    #[test]
    fn inverted_weight_bounds_are_rejected() {
        let cfg = TrainingConfig {
            trace_selection_minimum_weight: 2.0,
            trace_selection_maximum_weight: 1.0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }
}
