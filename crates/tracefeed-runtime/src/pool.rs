use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;

use tracefeed_core::config::TrainingConfig;

/// One generation of a shard's computation workers.
///
/// `outstanding` counts jobs that were spawned and have not finished; a
/// generation can be dropped once it reaches zero.
pub struct ComputePool {
    generation: u64,
    workers: usize,
    pool: rayon::ThreadPool,
    outstanding: Arc<AtomicUsize>,
}

struct JobGuard(Arc<AtomicUsize>);

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ComputePool {
    pub fn new(shard: usize, generation: u64, workers: usize) -> Result<Self> {
        let workers = workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(move |i| format!("tracefeed-shard{shard}-g{generation}-{i}"))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build compute pool for shard {shard}: {e}"))?;
        Ok(Self {
            generation,
            workers,
            pool,
            outstanding: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Runs `job` on this generation's threads. The outstanding count is
    /// released when `job` returns or unwinds.
    pub fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        let guard = JobGuard(self.outstanding.clone());
        self.pool.spawn(move || {
            let _guard = guard;
            job();
        });
    }
}

/// Sizing inputs for the elastic pool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolSizing {
    pub initial_workers: usize,
    pub cache_full_workers: usize,
    pub max_workers: usize,
    pub min_cache_hit_rate: f64,
}

impl PoolSizing {
    pub fn from_config(cfg: &TrainingConfig) -> Self {
        Self {
            initial_workers: cfg.initial_batch_prep_workers,
            cache_full_workers: cfg.cache_full_batch_prep_workers,
            max_workers: cfg.max_batch_prep_workers,
            min_cache_hit_rate: cfg.cache_full_state_min_cache_hit_rate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolPlan {
    pub workers: usize,
    pub cache_full: bool,
}

/// A warm cache needs few workers; a cold cache or a starved consumer gets
/// the large pool.
pub fn plan_pool_size(mean_hit_rate: Option<f64>, starved: bool, sizing: &PoolSizing) -> PoolPlan {
    match mean_hit_rate {
        Some(rate) if rate > sizing.min_cache_hit_rate && !starved => PoolPlan {
            workers: sizing.cache_full_workers,
            cache_full: true,
        },
        _ => PoolPlan {
            workers: sizing.max_workers,
            cache_full: false,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    Replaced { retired: u64, active: u64 },
    /// Previous generation is still draining; try again after it retires.
    Deferred,
}

/// Active pool plus at most one draining predecessor.
pub struct PoolGenerations {
    shard: usize,
    active: ComputePool,
    draining: Option<ComputePool>,
}

impl PoolGenerations {
    pub fn new(shard: usize, initial_workers: usize) -> Result<Self> {
        Ok(Self {
            shard,
            active: ComputePool::new(shard, 0, initial_workers)?,
            draining: None,
        })
    }

    pub fn active(&self) -> &ComputePool {
        &self.active
    }

    pub fn draining(&self) -> Option<&ComputePool> {
        self.draining.as_ref()
    }

    pub fn total_outstanding(&self) -> usize {
        self.active.outstanding() + self.draining.as_ref().map_or(0, ComputePool::outstanding)
    }

    /// Starts a new active generation with `workers` threads and moves the
    /// current one to draining.
    pub fn replace(&mut self, workers: usize) -> Result<ReplaceOutcome> {
        if self.draining.is_some() {
            return Ok(ReplaceOutcome::Deferred);
        }
        let next = ComputePool::new(self.shard, self.active.generation() + 1, workers)?;
        let old = std::mem::replace(&mut self.active, next);
        let retired = old.generation();
        self.draining = Some(old);
        Ok(ReplaceOutcome::Replaced {
            retired,
            active: self.active.generation(),
        })
    }

    /// Drops the draining generation if all of its jobs finished. Returns its
    /// generation number when it was dropped.
    pub fn retire_drained(&mut self) -> Option<u64> {
        if self.draining.as_ref()?.outstanding() > 0 {
            return None;
        }
        self.draining.take().map(|p| p.generation())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn sizing() -> PoolSizing {
        PoolSizing {
            initial_workers: 2,
            cache_full_workers: 1,
            max_workers: 6,
            min_cache_hit_rate: 0.9,
        }
    }

    #[test]
    fn warm_cache_gets_small_pool_unless_starved() {
        assert_eq!(
            plan_pool_size(Some(0.95), false, &sizing()),
            PoolPlan {
                workers: 1,
                cache_full: true
            }
        );
        assert_eq!(plan_pool_size(Some(0.95), true, &sizing()).workers, 6);
        assert_eq!(plan_pool_size(Some(0.9), false, &sizing()).workers, 6);
        assert!(!plan_pool_size(None, false, &sizing()).cache_full);
    }

    #[test]
    fn draining_pool_retires_after_jobs_finish() -> anyhow::Result<()> {
        let mut gens = PoolGenerations::new(0, 1)?;
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        gens.active().spawn(move || {
            let _ = release_rx.recv();
            let _ = done_tx.send(());
        });

        assert_eq!(
            gens.replace(3)?,
            ReplaceOutcome::Replaced {
                retired: 0,
                active: 1
            }
        );
        assert_eq!(gens.active().workers(), 3);
        assert_eq!(gens.replace(2)?, ReplaceOutcome::Deferred);
        assert_eq!(gens.retire_drained(), None);

        release_tx.send(())?;
        done_rx.recv_timeout(Duration::from_secs(5))?;
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while gens.draining().is_some_and(|p| p.outstanding() > 0) {
            assert!(std::time::Instant::now() < deadline, "job never released");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(gens.retire_drained(), Some(0));
        assert!(gens.draining().is_none());
        assert!(matches!(gens.replace(2)?, ReplaceOutcome::Replaced { active: 2, .. }));
        Ok(())
    }

    #[test]
    fn job_with_caught_panic_releases_outstanding() -> anyhow::Result<()> {
        let pool = ComputePool::new(0, 0, 1)?;
        let (tx, rx) = mpsc::channel::<()>();
        pool.spawn(move || {
            let _ = std::panic::catch_unwind(|| panic!("job failed"));
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(5))?;
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while pool.outstanding() > 0 {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }
}
