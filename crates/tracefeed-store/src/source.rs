use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracefeed_core::types::{
    ExecutionSession, ExecutionTrace, SessionId, TestingStep, TraceId, TrainingStep,
    TrainingStepId,
};

use crate::{checked_key, write_atomic, SourceStore, StoreError, TrainingStepStore};

const SESSIONS: &str = "execution_sessions";
const TRACES: &str = "execution_traces";
const TESTING_STEPS: &str = "testing_steps";
const TRAINING_STEPS: &str = "training_steps";

/// JSON documents under `<root>/<collection>/<id>.json`.
#[derive(Debug, Clone)]
pub struct FsSourceStore {
    root: PathBuf,
}

impl FsSourceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn doc_path(&self, collection: &str, id: &str) -> Result<PathBuf, StoreError> {
        let key = checked_key(id)?;
        Ok(self.root.join(collection).join(format!("{key}.json")))
    }

    fn read_doc<T: DeserializeOwned>(&self, collection: &str, id: &str) -> Result<Option<T>, StoreError> {
        let path = self.doc_path(collection, id)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    fn write_doc<T: Serialize>(&self, collection: &str, id: &str, doc: &T) -> Result<(), StoreError> {
        let path = self.doc_path(collection, id)?;
        let bytes = serde_json::to_vec_pretty(doc)?;
        write_atomic(&path, &bytes)?;
        Ok(())
    }

    pub fn put_session(&self, session: &ExecutionSession) -> Result<(), StoreError> {
        self.write_doc(SESSIONS, session.id.as_str(), session)
    }

    pub fn put_trace(&self, trace: &ExecutionTrace) -> Result<(), StoreError> {
        self.write_doc(TRACES, trace.id.as_str(), trace)
    }

    pub fn put_testing_step(&self, step: &TestingStep) -> Result<(), StoreError> {
        self.write_doc(TESTING_STEPS, step.id.as_str(), step)
    }
}

impl SourceStore for FsSourceStore {
    fn load_session(&self, id: &SessionId) -> Result<Option<ExecutionSession>, StoreError> {
        self.read_doc(SESSIONS, id.as_str())
    }

    fn load_trace(&self, id: &TraceId) -> Result<Option<ExecutionTrace>, StoreError> {
        self.read_doc(TRACES, id.as_str())
    }

    fn load_testing_steps(&self) -> Result<Vec<TestingStep>, StoreError> {
        let dir = self.root.join(TESTING_STEPS);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::Io(err)),
        };

        let mut steps = Vec::new();
        for entry in entries {
            let path = entry?.path();
            // Skip in-flight temp files from write_atomic.
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = std::fs::read(&path)?;
            steps.push(serde_json::from_slice::<TestingStep>(&bytes)?);
        }
        steps.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(steps)
    }
}

impl TrainingStepStore for FsSourceStore {
    fn save_training_step(&self, step: &TrainingStep) -> Result<(), StoreError> {
        self.write_doc(TRAINING_STEPS, step.id.as_str(), step)
    }

    fn load_training_step(&self, id: &TrainingStepId) -> Result<Option<TrainingStep>, StoreError> {
        self.read_doc(TRAINING_STEPS, id.as_str())
    }
}
