//! # Bonding Context
//!
//! Shared state of one bonded session: the link registry, the published
//! weight vector, the bitrate target, and the operator control surface.
//!
//! ## Concurrency
//!
//! - The published vector lives in an [`ArcSwap`]. Dispatchers load it
//!   lock-free; writers replace it whole, so a reader never sees entries
//!   from two epochs.
//! - Every writer (rebalance tick or operator override) holds the control
//!   lock while it reads the current vector, derives the next one and
//!   stores it. An override can therefore never be lost to a rebalance that
//!   started from the older vector.
//! - The bitrate target is a single atomic.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;
use quanta::Instant;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{BitrateConfig, BondingConfig, SessionConfig};
use crate::error::{DispatchError, Result};
use crate::rebalance::{RebalanceCounters, RebalancePhase, RebalanceStats};
use crate::registry::{LinkRegistry, LinkSample, LinkSummary};
use crate::weights::{WeightVector, ensure_healthy};

pub(crate) struct ControlState {
    /// Pre-failure weight of links that were set to 0 by an override.
    saved: Vec<Option<f64>>,
    epoch: u64,
}

pub struct BondingContext {
    config: BondingConfig,
    bitrate: BitrateConfig,
    registry: LinkRegistry,
    published: ArcSwap<WeightVector>,
    control: Mutex<ControlState>,
    admin_down: Vec<AtomicBool>,
    target_kbps: AtomicU32,
    phase: AtomicU8,
    pub(crate) counters: RebalanceCounters,
}

/// Point-in-time view for logs and the simulator's JSON output.
#[derive(Debug, Clone, Serialize)]
pub struct BondingStatus {
    pub epoch: u64,
    pub weights: Vec<f64>,
    pub failed: Vec<bool>,
    pub links: Vec<LinkSummary>,
    /// Most recent sample per link.
    pub last_samples: Vec<Option<LinkSample>>,
    pub target_kbps: u32,
    pub strategy: &'static str,
    pub auto_balance: bool,
    pub phase: RebalancePhase,
    pub rebalance: RebalanceStats,
}

impl BondingContext {
    /// Validates both configs and publishes the initial weights as epoch 0.
    /// Links configured at weight 0 start marked failed.
    pub fn new(config: BondingConfig, bitrate: BitrateConfig) -> Result<Arc<Self>> {
        config.validate()?;
        bitrate.validate()?;

        let initial = WeightVector::new(0, config.weights.clone())?;
        let n = config.link_count();
        let admin_down = config
            .weights
            .iter()
            .map(|w| AtomicBool::new(*w == 0.0))
            .collect();

        info!(
            links = n,
            strategy = config.effective_strategy().as_str(),
            rebalance_ms = config.rebalance_interval.as_millis() as u64,
            start_kbps = bitrate.start_target(),
            "bonding context created"
        );

        Ok(Arc::new(Self {
            registry: LinkRegistry::new(n, config.window_depth),
            published: ArcSwap::from_pointee(initial),
            control: Mutex::new(ControlState {
                saved: vec![None; n],
                epoch: 0,
            }),
            admin_down,
            target_kbps: AtomicU32::new(bitrate.start_target()),
            phase: AtomicU8::new(RebalancePhase::Idle as u8),
            counters: RebalanceCounters::default(),
            config,
            bitrate,
        }))
    }

    pub fn from_session(session: SessionConfig) -> Result<Arc<Self>> {
        Self::new(session.bonding, session.bitrate)
    }

    pub fn config(&self) -> &BondingConfig {
        &self.config
    }

    pub fn bitrate_config(&self) -> &BitrateConfig {
        &self.bitrate
    }

    pub fn registry(&self) -> &LinkRegistry {
        &self.registry
    }

    pub fn link_count(&self) -> usize {
        self.config.link_count()
    }

    // ─── Telemetry ──────────────────────────────────────────────────────

    pub fn record_sample(&self, link: usize, rtt_ms: f64, loss: f64, throughput_kbps: f64) {
        self.registry
            .record_sample(link, LinkSample::new(rtt_ms, loss, throughput_kbps));
    }

    /// Windowed summaries with the externally-failed flag filled in.
    pub fn summaries(&self) -> Vec<LinkSummary> {
        self.registry.snapshot(&self.admin_down_flags())
    }

    fn admin_down_flags(&self) -> Vec<bool> {
        self.admin_down
            .iter()
            .map(|f| f.load(Ordering::Acquire))
            .collect()
    }

    // ─── Published state ────────────────────────────────────────────────

    /// Current published vector.
    pub fn weights(&self) -> Arc<WeightVector> {
        self.published.load_full()
    }

    pub(crate) fn published(&self) -> &ArcSwap<WeightVector> {
        &self.published
    }

    pub fn epoch(&self) -> u64 {
        self.published.load().epoch()
    }

    /// True when the published weight of `link` is 0. Unknown links count
    /// as failed.
    pub fn failed(&self, link: usize) -> bool {
        self.published
            .load()
            .get(link)
            .map(|w| w == 0.0)
            .unwrap_or(true)
    }

    pub fn target_kbps(&self) -> u32 {
        self.target_kbps.load(Ordering::Acquire)
    }

    pub(crate) fn store_target_kbps(&self, kbps: u32) {
        self.target_kbps.store(kbps, Ordering::Release);
    }

    pub fn phase(&self) -> RebalancePhase {
        RebalancePhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn set_phase(&self, phase: RebalancePhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    pub fn status(&self) -> BondingStatus {
        let weights = self.weights();
        BondingStatus {
            epoch: weights.epoch(),
            failed: weights.as_slice().iter().map(|w| *w == 0.0).collect(),
            weights: weights.as_slice().to_vec(),
            links: self.summaries(),
            last_samples: (0..self.link_count())
                .map(|link| self.registry.latest(link))
                .collect(),
            target_kbps: self.target_kbps(),
            strategy: self.config.effective_strategy().as_str(),
            auto_balance: self.config.auto_balance,
            phase: self.phase(),
            rebalance: self.counters.snapshot(),
        }
    }

    // ─── Writers ────────────────────────────────────────────────────────

    pub(crate) fn lock_control(&self) -> MutexGuard<'_, ControlState> {
        self.control.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stores `weights` as the next epoch. Caller holds the control lock.
    pub(crate) fn publish_locked(
        &self,
        state: &mut ControlState,
        weights: Vec<f64>,
    ) -> Result<u64> {
        let epoch = state.epoch + 1;
        let vector = self
            .published
            .load()
            .successor(epoch, weights, Instant::now())?;
        self.published.store(Arc::new(vector));
        state.epoch = epoch;
        Ok(epoch)
    }

    fn check_override(&self, link: usize, weight: f64) -> Result<()> {
        if link >= self.link_count() {
            return Err(DispatchError::UnknownLink(link));
        }
        if !weight.is_finite() || weight < 0.0 || weight > self.config.max_weight {
            return Err(DispatchError::InvalidWeight { link, weight });
        }
        Ok(())
    }

    /// Applies one override to `next` and the failure bookkeeping.
    fn apply_override(&self, state: &mut ControlState, next: &mut [f64], link: usize, weight: f64) {
        let current = next[link];
        if weight == 0.0 {
            if current > 0.0 {
                state.saved[link] = Some(current);
            }
            self.admin_down[link].store(true, Ordering::Release);
        } else {
            state.saved[link] = None;
            self.admin_down[link].store(false, Ordering::Release);
        }
        next[link] = weight;
    }

    fn warn_if_degraded(&self, weights: &[f64], epoch: u64) {
        if let Err(e) = ensure_healthy(weights, self.config.min_healthy_links) {
            warn!(epoch, error = %e, "operator override left too few healthy links");
        }
    }

    /// Sets one link's weight and publishes immediately. Weight 0 marks the
    /// link failed and remembers its previous weight for [`restore_link`].
    ///
    /// Overrides are applied even when they leave fewer than
    /// `min_healthy_links` links up; that case is logged.
    ///
    /// [`restore_link`]: Self::restore_link
    pub fn set_link_weight(&self, link: usize, weight: f64) -> Result<u64> {
        self.check_override(link, weight)?;
        let mut state = self.lock_control();
        self.override_locked(&mut state, link, weight)
    }

    fn override_locked(&self, state: &mut ControlState, link: usize, weight: f64) -> Result<u64> {
        let mut next = self.published.load().as_slice().to_vec();
        let previous = next[link];
        self.apply_override(state, &mut next, link, weight);
        let epoch = self.publish_locked(state, next.clone())?;
        info!(link, previous, weight, epoch, "link weight override");
        self.warn_if_degraded(&next, epoch);
        Ok(epoch)
    }

    /// Replaces the whole vector in one publish.
    pub fn set_weights(&self, weights: Vec<f64>) -> Result<u64> {
        if weights.len() != self.link_count() {
            return Err(DispatchError::LengthMismatch {
                expected: self.link_count(),
                got: weights.len(),
            });
        }
        for (link, &weight) in weights.iter().enumerate() {
            self.check_override(link, weight)?;
        }
        let mut state = self.lock_control();
        let mut next = self.published.load().as_slice().to_vec();
        for (link, &weight) in weights.iter().enumerate() {
            self.apply_override(&mut state, &mut next, link, weight);
        }
        let epoch = self.publish_locked(&mut state, next.clone())?;
        info!(epoch, weights = ?next, "weight vector override");
        self.warn_if_degraded(&next, epoch);
        Ok(epoch)
    }

    pub fn mark_failed(&self, link: usize) -> Result<u64> {
        self.set_link_weight(link, 0.0)
    }

    /// Clears a failure. The link gets back the weight it had when it was
    /// set to 0, or its configured weight if it never had one. The saved
    /// weight is read and republished under one hold of the control lock.
    ///
    /// A link that is not marked failed is left alone and the current
    /// epoch is returned.
    pub fn restore_link(&self, link: usize) -> Result<u64> {
        if link >= self.link_count() {
            return Err(DispatchError::UnknownLink(link));
        }
        let mut state = self.lock_control();
        if !self.admin_down[link].load(Ordering::Acquire) {
            return Ok(state.epoch);
        }
        let weight = state.saved[link].unwrap_or_else(|| {
            let configured = self.config.weights[link];
            if configured > 0.0 {
                configured
            } else {
                1.0_f64.min(self.config.max_weight)
            }
        });
        self.check_override(link, weight)?;
        self.override_locked(&mut state, link, weight)
    }

    /// Health input from a link monitor.
    pub fn set_link_health(&self, link: usize, healthy: bool) -> Result<u64> {
        if healthy {
            self.restore_link(link)
        } else {
            self.mark_failed(link)
        }
    }

    pub fn is_marked_failed(&self, link: usize) -> bool {
        self.admin_down
            .get(link)
            .map(|f| f.load(Ordering::Acquire))
            .unwrap_or(true)
    }
}
