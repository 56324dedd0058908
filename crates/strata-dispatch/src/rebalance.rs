//! # Rebalance Scheduler
//!
//! One rebalance tick walks `Idle → Tick → Publishing → Idle`:
//!
//! 1. Take the control lock and read the published vector.
//! 2. Snapshot the link registry and run the active strategy.
//! 3. Validate the candidate (finite, non-negative, min healthy links).
//! 4. Publish it atomically as a new epoch.
//!
//! A rejected candidate leaves the published vector untouched and is
//! reported as [`TickOutcome::Rejected`]. The next tick starts fresh.
//! Candidates within `publish_epsilon` of the current vector are not
//! published, so a static strategy never bumps the epoch on its own.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use quanta::Instant;
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::context::BondingContext;
use crate::error::{DispatchError, Result};
use crate::registry::LinkSummary;
use crate::strategy::{self, WeightStrategy};
use crate::weights::{WeightVector, ensure_healthy, validate_weights};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum RebalancePhase {
    Idle = 0,
    Tick = 1,
    Publishing = 2,
}

impl RebalancePhase {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => RebalancePhase::Tick,
            2 => RebalancePhase::Publishing,
            _ => RebalancePhase::Idle,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Published { epoch: u64 },
    /// Candidate equal to the published vector (within epsilon).
    Unchanged,
    /// Candidate failed validation or the strategy errored.
    Rejected(DispatchError),
}

#[derive(Debug, Default)]
pub(crate) struct RebalanceCounters {
    ticks: AtomicU64,
    published: AtomicU64,
    unchanged: AtomicU64,
    rejected: AtomicU64,
}

impl RebalanceCounters {
    pub(crate) fn snapshot(&self) -> RebalanceStats {
        RebalanceStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RebalanceStats {
    pub ticks: u64,
    pub published: u64,
    pub unchanged: u64,
    pub rejected: u64,
}

pub struct RebalanceScheduler {
    ctx: Arc<BondingContext>,
    strategy: Box<dyn WeightStrategy>,
}

impl RebalanceScheduler {
    /// Scheduler running the strategy selected by the context's config.
    pub fn new(ctx: Arc<BondingContext>) -> Self {
        let strategy = strategy::build(ctx.config());
        Self { ctx, strategy }
    }

    pub fn with_strategy(ctx: Arc<BondingContext>, strategy: Box<dyn WeightStrategy>) -> Self {
        Self { ctx, strategy }
    }

    pub fn context(&self) -> &Arc<BondingContext> {
        &self.ctx
    }

    pub fn strategy(&self) -> &dyn WeightStrategy {
        self.strategy.as_ref()
    }

    pub fn stats(&self) -> RebalanceStats {
        self.ctx.counters.snapshot()
    }

    pub fn tick(&mut self) -> TickOutcome {
        let started = Instant::now();
        let ctx = &self.ctx;
        ctx.counters.ticks.fetch_add(1, Ordering::Relaxed);
        ctx.set_phase(RebalancePhase::Tick);

        let mut state = ctx.lock_control();
        let current = ctx.published().load_full();
        let links = ctx.summaries();

        let outcome = match self.candidate(&current, &links) {
            Err(e) => TickOutcome::Rejected(e),
            Ok(None) => TickOutcome::Unchanged,
            Ok(Some(weights)) => {
                ctx.set_phase(RebalancePhase::Publishing);
                match ctx.publish_locked(&mut state, weights) {
                    Ok(epoch) => TickOutcome::Published { epoch },
                    Err(e) => TickOutcome::Rejected(e),
                }
            }
        };
        drop(state);
        ctx.set_phase(RebalancePhase::Idle);

        match &outcome {
            TickOutcome::Published { epoch } => {
                ctx.counters.published.fetch_add(1, Ordering::Relaxed);
                debug!(
                    epoch,
                    strategy = self.strategy.kind().as_str(),
                    weights = ?ctx.weights().as_slice(),
                    "published rebalanced weights"
                );
            }
            TickOutcome::Unchanged => {
                ctx.counters.unchanged.fetch_add(1, Ordering::Relaxed);
            }
            TickOutcome::Rejected(e) => {
                ctx.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    epoch = current.epoch(),
                    strategy = self.strategy.kind().as_str(),
                    error = %e,
                    "rebalance candidate rejected, keeping previous weights"
                );
            }
        }
        trace!(elapsed_us = started.elapsed().as_micros() as u64, "rebalance tick");
        outcome
    }

    /// `Ok(None)` when the candidate is within epsilon of `current`.
    fn candidate(
        &self,
        current: &WeightVector,
        links: &[LinkSummary],
    ) -> Result<Option<Vec<f64>>> {
        let candidate = self.strategy.compute(current.as_slice(), links)?;
        if candidate.len() != current.len() {
            return Err(DispatchError::LengthMismatch {
                expected: current.len(),
                got: candidate.len(),
            });
        }
        validate_weights(&candidate)?;
        if current.max_delta(&candidate) <= self.ctx.config().publish_epsilon {
            return Ok(None);
        }
        ensure_healthy(&candidate, self.ctx.config().min_healthy_links)?;
        Ok(Some(candidate))
    }
}
