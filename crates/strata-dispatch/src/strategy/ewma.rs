//! EWMA quality weighting.
//!
//! Each tick a link gets an instantaneous score
//!
//! ```text
//! score = max_weight · (1 − loss)^k · 1 / (1 + rtt / rtt_ref) · tp / best_tp
//! ```
//!
//! and its weight moves towards that score by `alpha`:
//! `w' = alpha · score + (1 − alpha) · w`. The throughput term is dropped
//! when no link reports throughput. Links without samples keep their weight.

use crate::config::{EwmaParams, StrategyKind};
use crate::error::Result;
use crate::registry::LinkSummary;

use super::{WeightStrategy, check_inputs, snap_weight};

#[derive(Debug, Clone)]
pub struct EwmaWeights {
    params: EwmaParams,
    min_weight: f64,
    max_weight: f64,
}

impl EwmaWeights {
    pub fn new(params: EwmaParams, min_weight: f64, max_weight: f64) -> Self {
        Self {
            params,
            min_weight,
            max_weight,
        }
    }

    /// Instantaneous score of one link, in `[0, max_weight]`.
    pub fn score(&self, link: &LinkSummary, best_throughput_kbps: f64) -> f64 {
        let delivery = (1.0 - link.loss).clamp(0.0, 1.0).powf(self.params.loss_exponent);
        let latency = 1.0 / (1.0 + link.rtt_ms / self.params.rtt_reference_ms);
        let capacity = if best_throughput_kbps > 0.0 {
            (link.throughput_kbps / best_throughput_kbps).clamp(0.0, 1.0)
        } else {
            1.0
        };
        self.max_weight * delivery * latency * capacity
    }
}

impl WeightStrategy for EwmaWeights {
    fn compute(&self, previous: &[f64], links: &[LinkSummary]) -> Result<Vec<f64>> {
        check_inputs(previous, links)?;

        let best_tp = links
            .iter()
            .filter(|l| !l.failed && l.has_samples())
            .map(|l| l.throughput_kbps)
            .fold(0.0_f64, f64::max);

        let alpha = self.params.alpha;
        Ok(previous
            .iter()
            .zip(links)
            .map(|(&prev, link)| {
                if link.failed {
                    0.0
                } else if !link.has_samples() {
                    prev
                } else {
                    let blended = alpha * self.score(link, best_tp) + (1.0 - alpha) * prev;
                    snap_weight(blended, self.min_weight, self.max_weight)
                }
            })
            .collect())
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Ewma
    }
}
