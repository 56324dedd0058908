//! Static weighting.
//!
//! The published vector only changes through operator overrides and
//! failure marks; rebalance ticks republish it as is.

use crate::config::StrategyKind;
use crate::error::Result;
use crate::registry::LinkSummary;

use super::{WeightStrategy, check_inputs};

/// Keeps the previous weights. Telemetry is ignored; failed links stay at 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticWeights;

impl WeightStrategy for StaticWeights {
    fn compute(&self, previous: &[f64], links: &[LinkSummary]) -> Result<Vec<f64>> {
        check_inputs(previous, links)?;
        Ok(previous
            .iter()
            .zip(links)
            .map(|(&w, link)| if link.failed { 0.0 } else { w })
            .collect())
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Static
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::summary;

    #[test]
    fn identity_under_bad_telemetry() {
        let links = vec![summary(0, 900.0, 0.4, 10.0), summary(1, 5.0, 0.0, 9000.0)];
        let out = StaticWeights.compute(&[2.0, 1.0], &links).unwrap();
        assert_eq!(out, vec![2.0, 1.0]);
    }

    #[test]
    fn failed_link_stays_zero() {
        let mut down = summary(1, 10.0, 0.0, 1000.0);
        down.failed = true;
        let out = StaticWeights
            .compute(&[1.0, 0.0], &[summary(0, 10.0, 0.0, 1000.0), down])
            .unwrap();
        assert_eq!(out, vec![1.0, 0.0]);
    }
}
