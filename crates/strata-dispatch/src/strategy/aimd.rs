//! AIMD weighting.
//!
//! While a link's windowed loss stays below the target its weight grows by
//! a fixed increment per tick. At or above the target it is multiplied by
//! the decrease factor. Weights that fall under `min_weight` snap to 0; a
//! link at 0 that is not marked failed climbs back by the increment.

use crate::config::{AimdParams, StrategyKind};
use crate::error::Result;
use crate::registry::LinkSummary;

use super::{WeightStrategy, check_inputs, snap_weight};

#[derive(Debug, Clone)]
pub struct AimdWeights {
    params: AimdParams,
    target_loss: f64,
    min_weight: f64,
    max_weight: f64,
}

impl AimdWeights {
    pub fn new(params: AimdParams, target_loss: f64, min_weight: f64, max_weight: f64) -> Self {
        Self {
            params,
            target_loss,
            min_weight,
            max_weight,
        }
    }

    fn step(&self, prev: f64, loss: f64) -> f64 {
        let next = if loss < self.target_loss {
            prev + self.params.increment
        } else {
            prev * self.params.decrease_factor
        };
        snap_weight(next, self.min_weight, self.max_weight)
    }
}

impl WeightStrategy for AimdWeights {
    fn compute(&self, previous: &[f64], links: &[LinkSummary]) -> Result<Vec<f64>> {
        check_inputs(previous, links)?;
        Ok(previous
            .iter()
            .zip(links)
            .map(|(&prev, link)| {
                if link.failed {
                    0.0
                } else if !link.has_samples() {
                    prev
                } else {
                    self.step(prev, link.loss)
                }
            })
            .collect())
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Aimd
    }
}
