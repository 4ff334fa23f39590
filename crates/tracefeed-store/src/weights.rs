use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracefeed_core::types::{SessionId, TraceId, TraceWeightData};
use tracing::warn;

use crate::{checked_key, write_atomic, StoreError, WeightStore};

#[derive(Debug, Serialize, Deserialize)]
struct WeightFile {
    weight: f64,
}

/// Per-trace selection weights stored next to the sample cache as
/// `<trace_id>-weight.json`.
#[derive(Debug, Clone)]
pub struct FsWeightStore {
    root: PathBuf,
    default_weight: f64,
}

impl FsWeightStore {
    /// `default_weight` is used for traces with no side-file yet (normally the
    /// configured maximum, so fresh traces are drawn eagerly).
    pub fn new(root: impl Into<PathBuf>, default_weight: f64) -> Self {
        Self {
            root: root.into(),
            default_weight,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn weight_path(&self, trace_id: &TraceId) -> Result<PathBuf, StoreError> {
        let key = checked_key(trace_id.as_str())?;
        Ok(self.root.join(format!("{key}-weight.json")))
    }
}

impl WeightStore for FsWeightStore {
    /// Missing and unparseable files fall back to the default weight.
    fn load(
        &self,
        trace_id: &TraceId,
        execution_session_id: &SessionId,
    ) -> Result<TraceWeightData, StoreError> {
        let path = self.weight_path(trace_id)?;
        let weight = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<WeightFile>(&bytes) {
                Ok(file) if file.weight.is_finite() => file.weight,
                Ok(_) | Err(_) => {
                    warn!(trace_id = %trace_id, path = %path.display(), "corrupt weight file; using default");
                    self.default_weight
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => self.default_weight,
            Err(err) => return Err(StoreError::Io(err)),
        };
        Ok(TraceWeightData {
            id: trace_id.clone(),
            execution_session_id: execution_session_id.clone(),
            weight,
        })
    }

    fn save(&self, data: &TraceWeightData) -> Result<(), StoreError> {
        let path = self.weight_path(&data.id)?;
        let bytes = serde_json::to_vec(&WeightFile {
            weight: data.weight,
        })?;
        write_atomic(&path, &bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(test_name: &str) -> anyhow::Result<PathBuf> {
        let mut root = std::env::temp_dir();
        let suffix = format!(
            "tracefeed-weights-{}-{}-{}",
            test_name,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis()
        );
        root.push(suffix);
        std::fs::create_dir_all(&root)?;
        Ok(root)
    }

    #[test]
    fn missing_file_uses_default() -> anyhow::Result<()> {
        let store = FsWeightStore::new(temp_root("missing")?, 5.0);
        let w = store.load(&TraceId::from("t1"), &SessionId::from("s1"))?;
        assert_eq!(w.weight, 5.0);
        assert_eq!(w.execution_session_id, SessionId::from("s1"));
        Ok(())
    }

    #[test]
    fn save_then_load() -> anyhow::Result<()> {
        let root = temp_root("save-load")?;
        let store = FsWeightStore::new(root.clone(), 5.0);
        store.save(&TraceWeightData {
            id: TraceId::from("t1"),
            execution_session_id: SessionId::from("s1"),
            weight: 1.25,
        })?;

        let raw: serde_json::Value = serde_json::from_slice(&std::fs::read(root.join("t1-weight.json"))?)?;
        assert_eq!(raw, serde_json::json!({"weight": 1.25}));
        assert_eq!(store.load(&TraceId::from("t1"), &SessionId::from("s1"))?.weight, 1.25);
        Ok(())
    }

    #[test]
    fn corrupt_file_uses_default() -> anyhow::Result<()> {
        let root = temp_root("corrupt")?;
        std::fs::write(root.join("t1-weight.json"), b"{\"weight\": ")?;
        let store = FsWeightStore::new(root, 3.0);
        assert_eq!(store.load(&TraceId::from("t1"), &SessionId::from("s1"))?.weight, 3.0);
        Ok(())
    }
}
