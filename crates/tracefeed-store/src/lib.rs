#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod retry;
pub mod sample_cache;
pub mod source;
pub mod weights;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tracefeed_core::types::{
    ExecutionSession, ExecutionTrace, SessionId, StepStatus, TestingStep, TraceId, TraceWeightData,
    TrainingStep, TrainingStepId,
};
use tracefeed_observe::time::unix_time_ms;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid key: {0:?}")]
    InvalidKey(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error for {key}: {reason}")]
    Decode { key: String, reason: String },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<StoreError> },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read-only access to recorded sessions, traces and testing steps.
pub trait SourceStore: Send + Sync + 'static {
    fn load_session(&self, id: &SessionId) -> Result<Option<ExecutionSession>, StoreError>;
    fn load_trace(&self, id: &TraceId) -> Result<Option<ExecutionTrace>, StoreError>;
    fn load_testing_steps(&self) -> Result<Vec<TestingStep>, StoreError>;

    fn load_completed_testing_steps(&self) -> Result<Vec<TestingStep>, StoreError> {
        let mut steps = self.load_testing_steps()?;
        steps.retain(|s| s.status == StepStatus::Completed);
        Ok(steps)
    }
}

/// Persistence for the coordinator's run record.
pub trait TrainingStepStore: Send + Sync + 'static {
    fn save_training_step(&self, step: &TrainingStep) -> Result<(), StoreError>;
    fn load_training_step(&self, id: &TrainingStepId) -> Result<Option<TrainingStep>, StoreError>;
}

/// Per-trace selection weights, read at shard startup and written back as
/// losses arrive.
pub trait WeightStore: Send + Sync + 'static {
    fn load(
        &self,
        trace_id: &TraceId,
        execution_session_id: &SessionId,
    ) -> Result<TraceWeightData, StoreError>;
    fn save(&self, data: &TraceWeightData) -> Result<(), StoreError>;
}

/// Keys become file names, so they must be a single non-empty path component.
pub fn validate_key_component(value: &str) -> bool {
    if value.trim().is_empty() {
        return false;
    }
    if value.contains('/') || value.contains('\\') {
        return false;
    }
    if value.contains("..") {
        return false;
    }
    true
}

pub(crate) fn checked_key(value: &str) -> Result<&str, StoreError> {
    if validate_key_component(value) {
        Ok(value)
    } else {
        Err(StoreError::InvalidKey(value.to_string()))
    }
}

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Writes `bytes` to a sibling temp file and renames it over `path`, so
/// readers observe either nothing or the complete content. Creates missing
/// parent directories.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    std::fs::create_dir_all(parent_of(path)?)?;
    write_atomic_in(path, bytes)
}

/// Like [`write_atomic`], but the parent directory must already exist. Used
/// for hand-off files whose directory is removed at shutdown.
pub fn write_atomic_in(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    use std::io::Write;

    parent_of(path)?;
    let mut tmp = path.to_path_buf();
    let suffix = format!(
        "tmp.{}.{}.{}",
        std::process::id(),
        unix_time_ms(),
        TMP_SEQ.fetch_add(1, Ordering::Relaxed)
    );
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad filename"))?;
    tmp.set_file_name(format!("{file_name}.{suffix}"));

    let written = (|| {
        let mut f = std::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
        std::fs::rename(&tmp, path)
    })();
    if written.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    written
}

fn parent_of(path: &Path) -> Result<&Path, std::io::Error> {
    path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path must have parent")
    })
}
