//! Weight update strategies.
//!
//! A strategy maps the previously published weights and the current link
//! summaries to a candidate weight vector. Strategies are pure: they never
//! publish, log, or touch shared state. The rebalance loop owns validation
//! and publication.
//!
//! - [`StaticWeights`]: operator-owned weights, only failures are applied
//! - [`EwmaWeights`]: smoothed quality score from RTT, loss and throughput
//! - [`AimdWeights`]: additive increase while loss is under target,
//!   multiplicative decrease otherwise

pub mod aimd;
pub mod ewma;
pub mod fixed;

pub use aimd::AimdWeights;
pub use ewma::EwmaWeights;
pub use fixed::StaticWeights;

use crate::config::{BondingConfig, StrategyKind};
use crate::error::{DispatchError, Result};
use crate::registry::LinkSummary;

pub trait WeightStrategy: Send + Sync {
    /// Candidate weights for the next epoch, one entry per link.
    fn compute(&self, previous: &[f64], links: &[LinkSummary]) -> Result<Vec<f64>>;

    fn kind(&self) -> StrategyKind;
}

/// Instantiates the strategy selected by `config`, honouring `auto_balance`.
pub fn build(config: &BondingConfig) -> Box<dyn WeightStrategy> {
    match config.effective_strategy() {
        StrategyKind::Static => Box::new(StaticWeights),
        StrategyKind::Ewma => Box::new(EwmaWeights::new(
            config.ewma.clone(),
            config.min_weight,
            config.max_weight,
        )),
        StrategyKind::Aimd => Box::new(AimdWeights::new(
            config.aimd.clone(),
            config.target_loss,
            config.min_weight,
            config.max_weight,
        )),
    }
}

/// Shared input checks: matching lengths and scorable summaries.
pub(crate) fn check_inputs(previous: &[f64], links: &[LinkSummary]) -> Result<()> {
    if previous.len() != links.len() {
        return Err(DispatchError::LengthMismatch {
            expected: previous.len(),
            got: links.len(),
        });
    }
    for link in links {
        link.validate()?;
    }
    Ok(())
}

/// Values under `min_weight` become 0, the rest are capped at `max_weight`.
pub(crate) fn snap_weight(weight: f64, min_weight: f64, max_weight: f64) -> f64 {
    if weight < min_weight || weight <= 0.0 {
        0.0
    } else {
        weight.min(max_weight)
    }
}
