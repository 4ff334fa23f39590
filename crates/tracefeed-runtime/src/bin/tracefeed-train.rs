#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use tracefeed_core::config::TrainingConfig;
use tracefeed_runtime::synthetic::{
    seed_synthetic_root, SeedSpec, SyntheticLearner, SyntheticSampleSource,
};
use tracefeed_runtime::training::{run_training_step, TrainingEnvironment, TrainingRequest};
use tracefeed_store::source::FsSourceStore;

/// Runs one training step against a directory of recorded sessions, using
/// the synthetic renderer and learner.
#[derive(Debug, Parser)]
#[command(name = "tracefeed-train")]
struct Args {
    /// Root of the recorded testing steps, sessions and traces.
    #[arg(long, env = "TRACEFEED_DATA_ROOT")]
    data_root: PathBuf,

    /// Sample cache and weight side-files.
    #[arg(long, env = "TRACEFEED_CACHE_DIR")]
    cache_dir: PathBuf,

    /// Parent of the per-step hand-off directory.
    #[arg(long, env = "TRACEFEED_SCRATCH_DIR")]
    scratch_dir: Option<PathBuf>,

    /// JSON file with `TrainingConfig` overrides.
    #[arg(long, env = "TRACEFEED_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "TRACEFEED_TRAINING_SEQUENCE_ID", default_value = "local")]
    training_sequence_id: String,

    #[arg(long, env = "TRACEFEED_STEP_INDEX", default_value_t = 0)]
    step_index: u64,

    #[arg(long, env = "TRACEFEED_TESTING_RUN_ID")]
    testing_run_id: Option<String>,

    #[arg(long, env = "TRACEFEED_APPLICATION_ID")]
    application_id: Option<String>,

    #[arg(long, env = "TRACEFEED_ITERATIONS")]
    iterations: Option<u64>,

    #[arg(long, env = "TRACEFEED_BATCH_SIZE")]
    batch_size: Option<usize>,

    #[arg(long, env = "TRACEFEED_SHARDS")]
    shards: Option<usize>,

    /// Write a synthetic recording set into `data_root` before training.
    #[arg(long, env = "TRACEFEED_SEED", default_value_t = false)]
    seed: bool,

    #[arg(long, env = "TRACEFEED_SEED_TESTING_STEPS", default_value_t = 4)]
    seed_testing_steps: usize,

    #[arg(long, env = "TRACEFEED_SEED_SESSIONS_PER_STEP", default_value_t = 2)]
    seed_sessions_per_step: usize,

    #[arg(long, env = "TRACEFEED_SEED_TRACES_PER_SESSION", default_value_t = 6)]
    seed_traces_per_session: usize,

    #[arg(long, env = "TRACEFEED_IMAGE_WIDTH", default_value_t = 64)]
    image_width: usize,

    #[arg(long, env = "TRACEFEED_IMAGE_HEIGHT", default_value_t = 48)]
    image_height: usize,

    #[arg(long, env = "TRACEFEED_IMAGE_CHANNELS", default_value_t = 3)]
    image_channels: usize,
}

impl Args {
    fn training_config(&self) -> Result<TrainingConfig> {
        let mut cfg = match &self.config {
            Some(path) => TrainingConfig::from_json_file(path)?,
            None => TrainingConfig::default(),
        };
        if let Some(iterations) = self.iterations {
            cfg.iterations_per_training_step = iterations;
        }
        if let Some(batch_size) = self.batch_size {
            cfg.batch_size = batch_size;
        }
        if let Some(shards) = self.shards {
            cfg.batch_prep_shards = shards;
        }
        Ok(cfg)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracefeed_observe::logging::init_tracing();
    let args = Args::parse();
    let cfg = args.training_config()?;

    let store = Arc::new(FsSourceStore::new(&args.data_root));
    if args.seed {
        let spec = SeedSpec {
            testing_steps: args.seed_testing_steps,
            sessions_per_step: args.seed_sessions_per_step,
            traces_per_session: args.seed_traces_per_session,
            image_width: args.image_width,
            image_height: args.image_height,
            ..SeedSpec::default()
        };
        let seeder = store.clone();
        tokio::task::spawn_blocking(move || seed_synthetic_root(&seeder, &spec)).await??;
    }

    let env = TrainingEnvironment {
        source: store.clone(),
        steps: store,
        samples: Arc::new(SyntheticSampleSource::new(
            args.image_channels,
            args.image_height,
            args.image_width,
        )),
        cache_dir: args.cache_dir.clone(),
        scratch_dir: args.scratch_dir.clone(),
        observers: Vec::new(),
    };
    let request = TrainingRequest {
        training_sequence_id: args.training_sequence_id.clone(),
        step_index: args.step_index,
        testing_run_id: args.testing_run_id.clone(),
        application_id: args.application_id.clone(),
    };

    let outcome = run_training_step(cfg, &env, request, Box::new(SyntheticLearner::new())).await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if !outcome.success {
        std::process::exit(1);
    }
    Ok(())
}
