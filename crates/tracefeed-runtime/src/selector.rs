use std::collections::HashMap;
use std::sync::Arc;

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use thiserror::Error;

use tracefeed_core::config::TrainingConfig;
use tracefeed_core::types::{TraceId, TraceWeightData};

const RATIO_EPSILON: f64 = 1e-6;

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("no traces to select from")]
    Empty,
    #[error("invalid selection distribution: {0}")]
    Distribution(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectorParams {
    pub min_weight: f64,
    pub max_weight: f64,
    /// Extra logit given to the first trace in load order while the cache is
    /// cold; decays linearly along the ordering.
    pub cold_bias: f64,
    pub min_loss_ratio_for_update: f64,
}

impl SelectorParams {
    pub fn from_config(cfg: &TrainingConfig) -> Self {
        Self {
            min_weight: cfg.trace_selection_minimum_weight,
            max_weight: cfg.trace_selection_maximum_weight,
            cold_bias: cfg.trace_selection_cache_not_full_state_one_side_bias,
            min_loss_ratio_for_update: cfg.trace_selection_min_loss_ratio_difference_for_save,
        }
    }
}

/// Immutable view of the weights, cheap to hand to a computation job.
#[derive(Debug, Clone)]
pub struct SelectionSnapshot {
    weights: Arc<Vec<TraceWeightData>>,
    params: SelectorParams,
}

impl SelectionSnapshot {
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Selection probability of every trace, in load order.
    pub fn probabilities(&self, cache_warm: bool) -> Vec<f64> {
        let n = self.weights.len();
        let mut logits: Vec<f64> = self
            .weights
            .iter()
            .map(|w| clip(w.weight, self.params.min_weight, self.params.max_weight))
            .collect();
        if !cache_warm && n > 0 {
            for (i, logit) in logits.iter_mut().enumerate() {
                *logit += self.params.cold_bias * (n - i) as f64 / n as f64;
            }
        }
        softmax(&logits)
    }

    /// Draws `count` traces with replacement.
    pub fn draw<R: Rng + ?Sized>(
        &self,
        count: usize,
        cache_warm: bool,
        rng: &mut R,
    ) -> Result<Vec<TraceWeightData>, SelectorError> {
        if self.weights.is_empty() {
            return Err(SelectorError::Empty);
        }
        let probs = self.probabilities(cache_warm);
        let dist =
            WeightedIndex::new(&probs).map_err(|e| SelectorError::Distribution(e.to_string()))?;
        Ok((0..count)
            .map(|_| self.weights[dist.sample(rng)].clone())
            .collect())
    }
}

/// Shard-local weight table. The load order is fixed for the shard's
/// lifetime; only weights change.
#[derive(Debug, Clone)]
pub struct TraceSelector {
    params: SelectorParams,
    weights: Arc<Vec<TraceWeightData>>,
    index: HashMap<TraceId, usize>,
}

impl TraceSelector {
    pub fn new(params: SelectorParams, weights: Vec<TraceWeightData>) -> Result<Self, SelectorError> {
        if weights.is_empty() {
            return Err(SelectorError::Empty);
        }
        let index = weights
            .iter()
            .enumerate()
            .map(|(i, w)| (w.id.clone(), i))
            .collect();
        Ok(Self {
            params,
            weights: Arc::new(weights),
            index,
        })
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn get(&self, id: &TraceId) -> Option<&TraceWeightData> {
        self.index.get(id).map(|&i| &self.weights[i])
    }

    pub fn snapshot(&self) -> SelectionSnapshot {
        SelectionSnapshot {
            weights: self.weights.clone(),
            params: self.params,
        }
    }

    /// Replaces the stored weight when it moved by more than the configured
    /// relative ratio. Returns the updated entry, which the caller persists.
    pub fn update_weight(&mut self, id: &TraceId, new_weight: f64) -> Option<TraceWeightData> {
        if !new_weight.is_finite() {
            return None;
        }
        let &i = self.index.get(id)?;
        let old = self.weights[i].weight;
        let ratio = (old - new_weight).abs() / (old + RATIO_EPSILON);
        if ratio <= self.params.min_loss_ratio_for_update {
            return None;
        }
        let weights = Arc::make_mut(&mut self.weights);
        weights[i].weight = new_weight;
        Some(weights[i].clone())
    }
}

fn clip(value: f64, min: f64, max: f64) -> f64 {
    if value.is_nan() {
        return max;
    }
    value.max(min).min(max)
}

fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}
