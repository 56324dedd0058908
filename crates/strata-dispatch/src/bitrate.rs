//! # Dynamic Bitrate Controller
//!
//! Steers the encoder target from aggregate link health, on its own period
//! and independently of the rebalance loop.
//!
//! ## Policy
//!
//! The controller looks at links that are routable (published weight > 0)
//! and have reported telemetry. Their loss is averaged, weighted by
//! throughput, and compared to the target loss with a dead band on either
//! side:
//!
//! - loss above `target + deadband`, or best RTT above the ceiling: one
//!   step down, never below `min_kbps`
//! - loss below `target - deadband`, best RTT under 80% of the ceiling and
//!   enough spare capacity for one more step: one step up, never above the
//!   top grid point
//! - anything in between: hold
//!
//! Every actual change is followed by `cooldown_ticks` ticks in which the
//! target is frozen, so the controller does not chase the weight updates
//! its own change triggers. With every link down the target steps down.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::BitrateConfig;
use crate::context::BondingContext;
use crate::registry::LinkSummary;

/// Ramp-up needs the best RTT below this fraction of the ceiling.
const RTT_RECOVERY_MARGIN: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "phase")]
pub enum BitratePhase {
    Evaluating,
    Holding { remaining: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BitrateChange {
    Increase,
    Decrease,
    Hold,
}

/// Why the controller decided what it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BitrateReason {
    /// Aggregate loss above the band.
    Loss,
    /// Best RTT above the configured ceiling.
    Latency,
    /// No routable link at all.
    NoRoute,
    /// Loss below the band with capacity to spare.
    Recovery,
    /// Inside the cool-down after a change.
    Cooldown,
    /// Routable links exist but none has reported yet.
    NoSignal,
    /// Within the dead band, or capacity does not allow another step.
    Steady,
}

/// Health of the routable link set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AggregateHealth {
    /// Links with published weight > 0.
    pub routable_links: usize,
    /// Routable links with valid telemetry.
    pub healthy_links: usize,
    /// Throughput-weighted mean loss over healthy links.
    pub loss: f64,
    /// Sum of throughput estimates over healthy links.
    pub capacity_kbps: f64,
    pub best_rtt_ms: Option<f64>,
}

impl AggregateHealth {
    pub fn from_links(links: &[LinkSummary], weights: &[f64]) -> Self {
        let mut routable_links = 0;
        let mut healthy_links = 0;
        let mut capacity = 0.0;
        let mut weighted_loss = 0.0;
        let mut loss_sum = 0.0;
        let mut best_rtt: Option<f64> = None;

        for link in links {
            let weight = weights.get(link.id).copied().unwrap_or(0.0);
            if weight <= 0.0 {
                continue;
            }
            routable_links += 1;
            if !link.has_samples() || link.validate().is_err() {
                continue;
            }
            healthy_links += 1;
            capacity += link.throughput_kbps;
            weighted_loss += link.loss * link.throughput_kbps;
            loss_sum += link.loss;
            best_rtt = Some(best_rtt.map_or(link.rtt_ms, |r| r.min(link.rtt_ms)));
        }

        let loss = if healthy_links == 0 {
            0.0
        } else if capacity > 0.0 {
            weighted_loss / capacity
        } else {
            loss_sum / healthy_links as f64
        };

        Self {
            routable_links,
            healthy_links,
            loss,
            capacity_kbps: capacity,
            best_rtt_ms: best_rtt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BitrateDecision {
    pub target_kbps: u32,
    pub previous_kbps: u32,
    pub change: BitrateChange,
    pub reason: BitrateReason,
    pub aggregate: AggregateHealth,
}

pub struct DynamicBitrateController {
    ctx: Arc<BondingContext>,
    config: BitrateConfig,
    target_kbps: u32,
    phase: BitratePhase,
}

impl DynamicBitrateController {
    pub fn new(ctx: Arc<BondingContext>) -> Self {
        let config = ctx.bitrate_config().clone();
        let target_kbps = config.start_target();
        Self {
            ctx,
            config,
            target_kbps,
            phase: BitratePhase::Evaluating,
        }
    }

    pub fn target_kbps(&self) -> u32 {
        self.target_kbps
    }

    pub fn phase(&self) -> BitratePhase {
        self.phase
    }

    pub fn config(&self) -> &BitrateConfig {
        &self.config
    }

    /// Back to the start target, cool-down cleared. Publishes the target.
    pub fn reset(&mut self) {
        self.target_kbps = self.config.start_target();
        self.phase = BitratePhase::Evaluating;
        self.ctx.store_target_kbps(self.target_kbps);
    }

    /// One controller step against the context's current telemetry and
    /// weights. The resulting target is published to the context.
    pub fn tick(&mut self) -> BitrateDecision {
        let links = self.ctx.summaries();
        let weights = self.ctx.weights();
        let decision = self.evaluate(&links, weights.as_slice());
        self.ctx.store_target_kbps(decision.target_kbps);

        if decision.change == BitrateChange::Hold {
            debug!(
                target_kbps = decision.target_kbps,
                reason = ?decision.reason,
                loss = decision.aggregate.loss,
                "bitrate held"
            );
        } else {
            info!(
                target_kbps = decision.target_kbps,
                previous_kbps = decision.previous_kbps,
                reason = ?decision.reason,
                loss = decision.aggregate.loss,
                healthy_links = decision.aggregate.healthy_links,
                "bitrate target changed"
            );
        }
        decision
    }

    /// State-machine step on explicit inputs. Does not touch the context.
    pub fn evaluate(&mut self, links: &[LinkSummary], weights: &[f64]) -> BitrateDecision {
        let aggregate = AggregateHealth::from_links(links, weights);
        let previous = self.target_kbps;

        if let BitratePhase::Holding { remaining } = self.phase {
            let remaining = remaining.saturating_sub(1);
            self.phase = if remaining == 0 {
                BitratePhase::Evaluating
            } else {
                BitratePhase::Holding { remaining }
            };
            return self.decision(previous, BitrateReason::Cooldown, aggregate);
        }

        let bounds = &self.config.bounds;
        let upper = bounds.target_loss + self.config.loss_deadband;
        let lower = bounds.target_loss - self.config.loss_deadband;
        let (rtt_exceeded, rtt_near_ceiling) =
            match (self.config.rtt_ceiling_ms, aggregate.best_rtt_ms) {
                (Some(ceiling), Some(rtt)) => {
                    (rtt > ceiling, rtt >= ceiling * RTT_RECOVERY_MARGIN)
                }
                _ => (false, false),
            };

        let (next, reason) = if aggregate.routable_links == 0 {
            (self.step_down(), BitrateReason::NoRoute)
        } else if aggregate.healthy_links == 0 {
            (previous, BitrateReason::NoSignal)
        } else if aggregate.loss > upper {
            (self.step_down(), BitrateReason::Loss)
        } else if rtt_exceeded {
            (self.step_down(), BitrateReason::Latency)
        } else if aggregate.loss < lower && !rtt_near_ceiling && self.has_room(&aggregate) {
            (self.step_up(), BitrateReason::Recovery)
        } else {
            (previous, BitrateReason::Steady)
        };

        if next != previous {
            self.target_kbps = next;
            if self.config.cooldown_ticks > 0 {
                self.phase = BitratePhase::Holding {
                    remaining: self.config.cooldown_ticks,
                };
            }
        }
        self.decision(previous, reason, aggregate)
    }

    fn decision(
        &self,
        previous: u32,
        reason: BitrateReason,
        aggregate: AggregateHealth,
    ) -> BitrateDecision {
        let change = match self.target_kbps.cmp(&previous) {
            std::cmp::Ordering::Greater => BitrateChange::Increase,
            std::cmp::Ordering::Less => BitrateChange::Decrease,
            std::cmp::Ordering::Equal => BitrateChange::Hold,
        };
        BitrateDecision {
            target_kbps: self.target_kbps,
            previous_kbps: previous,
            change,
            reason,
            aggregate,
        }
    }

    fn step_down(&self) -> u32 {
        let bounds = &self.config.bounds;
        self.target_kbps
            .saturating_sub(bounds.step_kbps)
            .max(bounds.min_kbps)
    }

    fn step_up(&self) -> u32 {
        let bounds = &self.config.bounds;
        self.target_kbps
            .saturating_add(bounds.step_kbps)
            .min(bounds.ceiling_kbps())
    }

    /// Capacity gate for ramping up. Skipped when no link reports
    /// throughput.
    fn has_room(&self, aggregate: &AggregateHealth) -> bool {
        if aggregate.capacity_kbps <= 0.0 {
            return true;
        }
        let usable = aggregate.capacity_kbps * (1.0 - self.config.headroom);
        usable >= f64::from(self.target_kbps) + f64::from(self.config.bounds.step_kbps)
    }
}
