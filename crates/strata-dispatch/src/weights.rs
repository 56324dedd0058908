//! Published weight vectors.
//!
//! A [`WeightVector`] is immutable once built. The context swaps whole
//! vectors atomically, so a reader always sees one consistent epoch.
//!
//! Each vector also carries, per link, the instant the link last went from
//! weight 0 to a positive weight. Dispatchers use it for the warm-up ramp.

use std::time::Duration;

use quanta::Instant;
use serde::Serialize;

use crate::error::{DispatchError, Result};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeightVector {
    epoch: u64,
    weights: Vec<f64>,
    #[serde(skip)]
    raised_at: Vec<Option<Instant>>,
}

impl WeightVector {
    pub fn new(epoch: u64, weights: Vec<f64>) -> Result<Self> {
        validate_weights(&weights)?;
        let raised_at = vec![None; weights.len()];
        Ok(Self {
            epoch,
            weights,
            raised_at,
        })
    }

    /// Builds the vector that replaces `self`. Links rising from 0 are
    /// stamped with `now`; links that stay up keep their stamp.
    pub fn successor(&self, epoch: u64, weights: Vec<f64>, now: Instant) -> Result<Self> {
        validate_weights(&weights)?;
        let raised_at = weights
            .iter()
            .enumerate()
            .map(|(link, &w)| {
                if w <= 0.0 {
                    return None;
                }
                match self.weights.get(link) {
                    Some(&prev) if prev > 0.0 => self.raised_at.get(link).copied().flatten(),
                    _ => Some(now),
                }
            })
            .collect();
        Ok(Self {
            epoch,
            weights,
            raised_at,
        })
    }

    /// Bumped on every publish. Dispatchers use it to notice new vectors.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.weights
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn get(&self, link: usize) -> Option<f64> {
        self.weights.get(link).copied()
    }

    pub fn healthy_count(&self) -> usize {
        self.weights.iter().filter(|w| **w > 0.0).count()
    }

    pub fn total(&self) -> f64 {
        self.weights.iter().sum()
    }

    pub fn is_routable(&self) -> bool {
        self.healthy_count() > 0
    }

    /// When `link` last came up from weight 0, if it did during this session.
    pub fn raised_at(&self, link: usize) -> Option<Instant> {
        self.raised_at.get(link).copied().flatten()
    }

    /// Instant at which the last link still ramping reaches full share, or
    /// `None` when nothing ramps.
    pub fn warm_until(&self, warmup: Duration) -> Option<Instant> {
        if warmup.is_zero() {
            return None;
        }
        self.raised_at.iter().flatten().max().map(|&t| t + warmup)
    }

    /// Largest absolute per-link difference to `other`. Length changes
    /// count as infinitely different.
    pub fn max_delta(&self, other: &[f64]) -> f64 {
        if other.len() != self.weights.len() {
            return f64::INFINITY;
        }
        self.weights
            .iter()
            .zip(other)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }
}

/// Every entry finite and non-negative.
pub fn validate_weights(weights: &[f64]) -> Result<()> {
    for (link, &weight) in weights.iter().enumerate() {
        if !weight.is_finite() || weight < 0.0 {
            return Err(DispatchError::InvalidWeight { link, weight });
        }
    }
    Ok(())
}

/// Dispatch share multiplier for a link that came up `elapsed` ago: 0.5
/// right away, rising linearly to 1.0 at `warmup`.
pub fn warmup_factor(elapsed: Duration, warmup: Duration) -> f64 {
    if warmup.is_zero() || elapsed >= warmup {
        return 1.0;
    }
    let progress = elapsed.as_secs_f64() / warmup.as_secs_f64();
    1.0 - 0.5 * (1.0 - progress)
}

/// Fails when fewer than `required` entries are positive.
pub fn ensure_healthy(weights: &[f64], required: usize) -> Result<()> {
    let healthy = weights.iter().filter(|w| **w > 0.0).count();
    if healthy < required {
        return Err(DispatchError::InsufficientHealthyLinks { healthy, required });
    }
    Ok(())
}
