use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracefeed_core::config::TrainingConfig;
use tracefeed_core::sample::Sample;
use tracefeed_core::types::TraceId;
use tracing::debug;

use crate::retry::{Backoff, RetryPolicy};
use crate::{checked_key, write_atomic, StoreError};

const SAMPLE_SUFFIX: &str = "-sample.bin.gz";
const LEGACY_SUFFIX: &str = ".bin.gz";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Written,
    AlreadyPresent,
}

/// Write-once cache of uncropped samples, one gzip'd bincode file per trace.
///
/// No locking: concurrent writers of the same id race on an atomic rename and
/// readers only ever see complete files.
#[derive(Debug, Clone)]
pub struct FsSampleCache {
    root: PathBuf,
    write_retry: RetryPolicy,
    read_legacy_names: bool,
}

impl FsSampleCache {
    pub fn new(root: impl Into<PathBuf>, write_retry: RetryPolicy) -> Self {
        Self {
            root: root.into(),
            write_retry,
            read_legacy_names: true,
        }
    }

    pub fn from_config(root: impl Into<PathBuf>, cfg: &TrainingConfig) -> Self {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(cfg.cache_write_backoff_base_ms),
            factor: cfg.cache_write_backoff_factor,
            max: Duration::from_secs(60),
        };
        Self::new(root, RetryPolicy::new(cfg.cache_write_max_attempts, backoff))
            .with_legacy_names(cfg.cache_read_legacy_names)
    }

    pub fn with_legacy_names(mut self, enabled: bool) -> Self {
        self.read_legacy_names = enabled;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sample_path(&self, trace_id: &TraceId) -> Result<PathBuf, StoreError> {
        let key = checked_key(trace_id.as_str())?;
        Ok(self.root.join(format!("{key}{SAMPLE_SUFFIX}")))
    }

    pub fn legacy_sample_path(&self, trace_id: &TraceId) -> Result<PathBuf, StoreError> {
        let key = checked_key(trace_id.as_str())?;
        Ok(self.root.join(format!("{key}{LEGACY_SUFFIX}")))
    }

    pub fn contains(&self, trace_id: &TraceId) -> Result<bool, StoreError> {
        Ok(self.sample_path(trace_id)?.is_file())
    }

    /// Canonical name first, then the legacy name. `Ok(None)` is a miss.
    pub fn get(&self, trace_id: &TraceId) -> Result<Option<Sample>, StoreError> {
        let mut candidates = vec![self.sample_path(trace_id)?];
        if self.read_legacy_names {
            candidates.push(self.legacy_sample_path(trace_id)?);
        }
        for path in candidates {
            match std::fs::read(&path) {
                Ok(bytes) => return decode_sample(trace_id, &bytes).map(Some),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(StoreError::Io(err)),
            }
        }
        Ok(None)
    }

    /// No-op when the canonical file already exists. Transient write failures
    /// are retried per the configured policy.
    pub fn put(&self, trace_id: &TraceId, sample: &Sample) -> Result<PutOutcome, StoreError> {
        let path = self.sample_path(trace_id)?;
        if path.is_file() {
            return Ok(PutOutcome::AlreadyPresent);
        }
        let bytes = encode_sample(sample)?;
        self.write_retry
            .run("sample_cache_put", |_| write_atomic(&path, &bytes))
            .map_err(|e| StoreError::RetriesExhausted {
                attempts: e.attempts,
                last: Box::new(StoreError::Io(e.last)),
            })?;
        debug!(trace_id = %trace_id, bytes = bytes.len(), "sample cached");
        Ok(PutOutcome::Written)
    }
}

fn encode_sample(sample: &Sample) -> Result<Vec<u8>, StoreError> {
    let raw = bincode::serialize(sample).map_err(|e| StoreError::Encode(e.to_string()))?;
    let mut enc = GzEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::fast());
    enc.write_all(&raw)?;
    Ok(enc.finish()?)
}

fn decode_sample(trace_id: &TraceId, bytes: &[u8]) -> Result<Sample, StoreError> {
    let mut raw = Vec::new();
    GzDecoder::new(bytes)
        .read_to_end(&mut raw)
        .map_err(|e| StoreError::Decode {
            key: trace_id.to_string(),
            reason: e.to_string(),
        })?;
    bincode::deserialize(&raw).map_err(|e| StoreError::Decode {
        key: trace_id.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tracefeed_core::sample::Frame;

    fn temp_root(test_name: &str) -> anyhow::Result<PathBuf> {
        let mut root = std::env::temp_dir();
        let suffix = format!(
            "tracefeed-sample-cache-{}-{}-{}",
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

    fn sample(id: &str, fill: f32) -> Sample {
        let frame = |c: usize| Frame::new(c, 4, 6, vec![fill; c * 24]).unwrap();
        Sample {
            trace_id: TraceId::from(id),
            processed_image: frame(3),
            pixel_action_map: frame(2),
            reward_pixel_mask: frame(1),
            next_processed_image: frame(3),
            next_pixel_action_map: frame(2),
            action_x: 2,
            action_y: 1,
            action_type: 1,
            reward: 0.5,
            symbol_indexes: vec![1, 4, 9],
            symbol_weights: vec![1.0, 0.5, 0.25],
            next_symbol_indexes: vec![4],
            next_symbol_weights: vec![1.0],
            decaying_future_symbol_indexes: vec![],
            decaying_future_symbol_weights: vec![],
        }
    }

    fn cache(root: PathBuf) -> FsSampleCache {
        FsSampleCache::new(root, RetryPolicy::new(3, Backoff::None))
    }

    #[test]
    fn miss_then_hit() -> anyhow::Result<()> {
        let cache = cache(temp_root("miss-then-hit")?);
        let id = TraceId::from("t1");
        assert_eq!(cache.get(&id)?, None);

        let s = sample("t1", 0.25);
        assert_eq!(cache.put(&id, &s)?, PutOutcome::Written);
        assert_eq!(cache.get(&id)?, Some(s));
        Ok(())
    }

    #[test]
    fn put_is_write_once() -> anyhow::Result<()> {
        let cache = cache(temp_root("write-once")?);
        let id = TraceId::from("t1");
        cache.put(&id, &sample("t1", 0.25))?;
        let before = std::fs::read(cache.sample_path(&id)?)?;

        assert_eq!(cache.put(&id, &sample("t1", 0.75))?, PutOutcome::AlreadyPresent);
        let after = std::fs::read(cache.sample_path(&id)?)?;
        assert_eq!(before, after);
        assert_eq!(cache.get(&id)?.map(|s| s.processed_image.data[0]), Some(0.25));
        Ok(())
    }

    #[test]
    fn concurrent_puts_leave_one_readable_file() -> anyhow::Result<()> {
        let root = temp_root("concurrent-put")?;
        let cache = Arc::new(cache(root.clone()));
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));

        let mut handles = Vec::new();
        for _ in 0..threads {
            let cache = cache.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                cache
                    .put(&TraceId::from("shared"), &sample("shared", 1.0))
                    .expect("put should not error");
            }));
        }
        for h in handles {
            h.join().expect("thread join");
        }

        assert_eq!(cache.get(&TraceId::from("shared"))?, Some(sample("shared", 1.0)));
        let leftovers = std::fs::read_dir(&root)?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .count();
        assert_eq!(leftovers, 0);
        Ok(())
    }

    #[test]
    fn legacy_name_is_read_when_enabled() -> anyhow::Result<()> {
        let root = temp_root("legacy")?;
        let id = TraceId::from("old");
        let bytes = encode_sample(&sample("old", 0.5))?;
        std::fs::write(root.join("old.bin.gz"), bytes)?;

        let with_legacy = cache(root.clone());
        assert_eq!(with_legacy.get(&id)?, Some(sample("old", 0.5)));

        let without_legacy = cache(root).with_legacy_names(false);
        assert_eq!(without_legacy.get(&id)?, None);
        Ok(())
    }

    #[test]
    fn corrupt_file_is_a_decode_error() -> anyhow::Result<()> {
        let root = temp_root("corrupt")?;
        std::fs::write(root.join("bad-sample.bin.gz"), b"not gzip")?;
        let err = cache(root).get(&TraceId::from("bad")).unwrap_err();
        assert!(matches!(err, StoreError::Decode { .. }), "got {err:?}");
        Ok(())
    }

    #[test]
    fn unwritable_root_exhausts_retries() -> anyhow::Result<()> {
        let root = temp_root("unwritable")?;
        let blocker = root.join("not-a-dir");
        std::fs::write(&blocker, b"x")?;

        let err = cache(blocker).put(&TraceId::from("t1"), &sample("t1", 0.0)).unwrap_err();
        match err {
            StoreError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn path_like_ids_are_rejected() -> anyhow::Result<()> {
        let cache = cache(temp_root("bad-id")?);
        assert!(matches!(
            cache.get(&TraceId::from("../escape")),
            Err(StoreError::InvalidKey(_))
        ));
        Ok(())
    }
}
