//! Session configuration.
//!
//! Configuration arrives as TOML (or is built in code) and is resolved into
//! validated, typed structs before a session starts. Anything inconsistent
//! is rejected here so the control loops never run with broken invariants.
//!
//! ```toml
//! version = 1
//! weights = [2.0, 1.5, 1.0, 0.5]
//! strategy = "ewma"
//! rebalance-interval-ms = 500
//! target-loss-pct = 1.5
//! scheduler = "swrr"
//!
//! [bitrate]
//! min-kbps = 1000
//! max-kbps = 8000
//! step-kbps = 250
//! ```

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

pub const CONFIG_VERSION: u32 = 1;

pub const DEFAULT_REBALANCE_INTERVAL_MS: u64 = 500;
pub const DEFAULT_MAX_WEIGHT: f64 = 4.0;
pub const DEFAULT_MIN_WEIGHT: f64 = 0.01;
pub const DEFAULT_WINDOW_DEPTH: usize = 16;
pub const DEFAULT_TARGET_LOSS_PCT: f64 = 1.0;
pub const DEFAULT_QUANTUM_BYTES: usize = 1_500;
pub const MIN_QUANTUM_BYTES: usize = 256;
pub const MAX_QUANTUM_BYTES: usize = 16_384;
pub const DEFAULT_HEALTH_WARMUP_MS: u64 = 2_000;

pub const DEFAULT_MIN_KBPS: u32 = 1_000;
pub const DEFAULT_MAX_KBPS: u32 = 8_000;
pub const DEFAULT_STEP_KBPS: u32 = 250;
pub const DEFAULT_BITRATE_INTERVAL_MS: u64 = 750;
pub const DEFAULT_COOLDOWN_TICKS: u32 = 2;
pub const DEFAULT_LOSS_DEADBAND_PCT: f64 = 0.1;

/// Weight update policy run by the rebalance loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Weights only change through operator overrides.
    Static,
    /// Exponentially smoothed quality score.
    #[default]
    Ewma,
    /// Additive increase, multiplicative decrease on loss.
    Aimd,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Static => "static",
            StrategyKind::Ewma => "ewma",
            StrategyKind::Aimd => "aimd",
        }
    }
}

impl FromStr for StrategyKind {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "static" => Ok(StrategyKind::Static),
            "ewma" => Ok(StrategyKind::Ewma),
            "aimd" => Ok(StrategyKind::Aimd),
            other => Err(DispatchError::InvalidConfig(format!(
                "unknown strategy '{other}' (expected static, ewma or aimd)"
            ))),
        }
    }
}

/// Per-packet scheduler used by dispatchers built from the session config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SelectionMode {
    /// Smooth weighted round-robin over packets.
    #[default]
    #[serde(rename = "swrr")]
    SmoothWeightedRoundRobin,
    /// Weighted random draw.
    #[serde(rename = "random")]
    WeightedRandom,
    /// Deficit round-robin over bytes.
    #[serde(rename = "drr")]
    DeficitRoundRobin,
}

impl SelectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionMode::SmoothWeightedRoundRobin => "swrr",
            SelectionMode::WeightedRandom => "random",
            SelectionMode::DeficitRoundRobin => "drr",
        }
    }
}

impl FromStr for SelectionMode {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "swrr" => Ok(SelectionMode::SmoothWeightedRoundRobin),
            "random" => Ok(SelectionMode::WeightedRandom),
            "drr" => Ok(SelectionMode::DeficitRoundRobin),
            other => Err(DispatchError::InvalidConfig(format!(
                "unknown scheduler '{other}' (expected swrr, random or drr)"
            ))),
        }
    }
}

/// Smoothing parameters for [`StrategyKind::Ewma`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EwmaParams {
    /// Weight of the instantaneous score, `0 < alpha <= 1`. Lower values
    /// adapt slower and suit noisy links.
    pub alpha: f64,
    /// RTT at which the latency factor halves the score.
    pub rtt_reference_ms: f64,
    /// Exponent applied to the delivery ratio `(1 - loss)`.
    pub loss_exponent: f64,
}

impl Default for EwmaParams {
    fn default() -> Self {
        Self {
            alpha: 0.25,
            rtt_reference_ms: 200.0,
            loss_exponent: 4.0,
        }
    }
}

/// Step sizes for [`StrategyKind::Aimd`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AimdParams {
    pub increment: f64,
    pub decrease_factor: f64,
}

impl Default for AimdParams {
    fn default() -> Self {
        Self {
            increment: 0.1,
            decrease_factor: 0.5,
        }
    }
}

/// Link-weight model and rebalance loop settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BondingConfig {
    /// Initial weight per link. The length fixes the link set for the session.
    pub weights: Vec<f64>,
    pub strategy: StrategyKind,
    pub rebalance_interval: Duration,
    /// When false the static strategy runs regardless of `strategy`.
    pub auto_balance: bool,
    /// Minimum number of positive weights a computed vector must keep.
    pub min_healthy_links: usize,
    pub max_weight: f64,
    /// Strategy outputs below this floor are snapped to 0.
    pub min_weight: f64,
    /// Samples kept per link.
    pub window_depth: usize,
    /// Candidates closer than this (max abs delta) to the published vector
    /// are not published.
    pub publish_epsilon: f64,
    /// Loss fraction above which AIMD backs off.
    pub target_loss: f64,
    pub ewma: EwmaParams,
    pub aimd: AimdParams,
    pub scheduler: SelectionMode,
    /// Base DRR quantum, scaled by each link's share of the total weight.
    pub quantum_bytes: usize,
    /// A link that comes back from weight 0 starts at half its dispatch
    /// share and ramps linearly to full share over this period. Zero
    /// disables the ramp.
    pub health_warmup: Duration,
}

impl BondingConfig {
    /// Defaults for everything except the initial weights.
    pub fn with_weights(weights: Vec<f64>) -> Self {
        let largest = weights.iter().copied().fold(0.0_f64, f64::max);
        Self {
            weights,
            strategy: StrategyKind::default(),
            rebalance_interval: Duration::from_millis(DEFAULT_REBALANCE_INTERVAL_MS),
            auto_balance: true,
            min_healthy_links: 1,
            max_weight: DEFAULT_MAX_WEIGHT.max(largest),
            min_weight: DEFAULT_MIN_WEIGHT,
            window_depth: DEFAULT_WINDOW_DEPTH,
            publish_epsilon: 0.0,
            target_loss: DEFAULT_TARGET_LOSS_PCT / 100.0,
            ewma: EwmaParams::default(),
            aimd: AimdParams::default(),
            scheduler: SelectionMode::default(),
            quantum_bytes: DEFAULT_QUANTUM_BYTES,
            health_warmup: Duration::from_millis(DEFAULT_HEALTH_WARMUP_MS),
        }
    }

    pub fn link_count(&self) -> usize {
        self.weights.len()
    }

    /// The strategy that actually runs, taking `auto_balance` into account.
    pub fn effective_strategy(&self) -> StrategyKind {
        if self.auto_balance {
            self.strategy
        } else {
            StrategyKind::Static
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.weights.is_empty() {
            return Err(DispatchError::EmptyLinkSet);
        }
        if !(self.max_weight.is_finite() && self.max_weight > 0.0) {
            return Err(DispatchError::InvalidConfig(format!(
                "max-weight must be positive, got {}",
                self.max_weight
            )));
        }
        for (link, &weight) in self.weights.iter().enumerate() {
            if !weight.is_finite() || weight < 0.0 {
                return Err(DispatchError::InvalidWeight { link, weight });
            }
            if weight > self.max_weight {
                return Err(DispatchError::InvalidConfig(format!(
                    "weight {weight} for link {link} exceeds max-weight {}",
                    self.max_weight
                )));
            }
        }
        if self.rebalance_interval.is_zero() {
            return Err(DispatchError::InvalidConfig(
                "rebalance-interval-ms must be positive".into(),
            ));
        }
        if !(self.min_weight.is_finite() && self.min_weight >= 0.0)
            || self.min_weight >= self.max_weight
        {
            return Err(DispatchError::InvalidConfig(format!(
                "min-weight must be in [0, max-weight), got {}",
                self.min_weight
            )));
        }
        if self.min_healthy_links == 0 || self.min_healthy_links > self.weights.len() {
            return Err(DispatchError::InvalidConfig(format!(
                "min-healthy-links must be in 1..={}, got {}",
                self.weights.len(),
                self.min_healthy_links
            )));
        }
        let healthy = self.weights.iter().filter(|w| **w > 0.0).count();
        if healthy < self.min_healthy_links {
            return Err(DispatchError::InsufficientHealthyLinks {
                healthy,
                required: self.min_healthy_links,
            });
        }
        if self.window_depth == 0 {
            return Err(DispatchError::InvalidConfig(
                "window-depth must be at least 1".into(),
            ));
        }
        if !(self.publish_epsilon.is_finite() && self.publish_epsilon >= 0.0) {
            return Err(DispatchError::InvalidConfig(format!(
                "publish-epsilon must be non-negative, got {}",
                self.publish_epsilon
            )));
        }
        validate_loss_fraction(self.target_loss)?;
        if !(self.ewma.alpha > 0.0 && self.ewma.alpha <= 1.0) {
            return Err(DispatchError::InvalidConfig(format!(
                "ewma alpha must be in (0, 1], got {}",
                self.ewma.alpha
            )));
        }
        if !(self.ewma.rtt_reference_ms.is_finite() && self.ewma.rtt_reference_ms > 0.0) {
            return Err(DispatchError::InvalidConfig(
                "ewma rtt-reference-ms must be positive".into(),
            ));
        }
        if !(self.ewma.loss_exponent.is_finite() && self.ewma.loss_exponent > 0.0) {
            return Err(DispatchError::InvalidConfig(
                "ewma loss-exponent must be positive".into(),
            ));
        }
        if !(self.aimd.increment.is_finite() && self.aimd.increment > 0.0) {
            return Err(DispatchError::InvalidConfig(
                "aimd increment must be positive".into(),
            ));
        }
        if !(self.aimd.decrease_factor > 0.0 && self.aimd.decrease_factor < 1.0) {
            return Err(DispatchError::InvalidConfig(format!(
                "aimd decrease-factor must be in (0, 1), got {}",
                self.aimd.decrease_factor
            )));
        }
        if !(MIN_QUANTUM_BYTES..=MAX_QUANTUM_BYTES).contains(&self.quantum_bytes) {
            return Err(DispatchError::InvalidConfig(format!(
                "quantum-bytes must be in {MIN_QUANTUM_BYTES}..={MAX_QUANTUM_BYTES}, got {}",
                self.quantum_bytes
            )));
        }
        Ok(())
    }
}

fn validate_loss_fraction(target_loss: f64) -> Result<()> {
    if target_loss.is_finite() && (0.0..1.0).contains(&target_loss) {
        Ok(())
    } else {
        Err(DispatchError::InvalidConfig(format!(
            "target-loss-pct must be in [0, 100), got {}",
            target_loss * 100.0
        )))
    }
}

/// Encoder bitrate limits. The controller only ever outputs points on the
/// grid `min_kbps + k * step_kbps` that do not exceed `max_kbps`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BitrateBounds {
    pub min_kbps: u32,
    pub max_kbps: u32,
    pub step_kbps: u32,
    /// Loss fraction the controller steers towards.
    pub target_loss: f64,
}

impl BitrateBounds {
    pub fn new(min_kbps: u32, max_kbps: u32, step_kbps: u32, target_loss_pct: f64) -> Result<Self> {
        let bounds = Self {
            min_kbps,
            max_kbps,
            step_kbps,
            target_loss: target_loss_pct / 100.0,
        };
        bounds.validate()?;
        Ok(bounds)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_kbps == 0 || self.max_kbps == 0 || self.step_kbps == 0 {
            return Err(DispatchError::InvalidBounds(format!(
                "min/max/step must be positive (got {}/{}/{})",
                self.min_kbps, self.max_kbps, self.step_kbps
            )));
        }
        if self.min_kbps > self.max_kbps {
            return Err(DispatchError::InvalidBounds(format!(
                "min-kbps {} exceeds max-kbps {}",
                self.min_kbps, self.max_kbps
            )));
        }
        validate_loss_fraction(self.target_loss)
            .map_err(|_| DispatchError::InvalidBounds("target-loss-pct out of range".into()))
    }

    /// Highest grid point not above `max_kbps`.
    pub fn ceiling_kbps(&self) -> u32 {
        let span = self.max_kbps - self.min_kbps;
        self.min_kbps + (span / self.step_kbps) * self.step_kbps
    }

    /// Clamps `kbps` into range and rounds it down onto the step grid.
    pub fn snap(&self, kbps: u32) -> u32 {
        let clamped = kbps.clamp(self.min_kbps, self.ceiling_kbps());
        let steps = (clamped - self.min_kbps) / self.step_kbps;
        self.min_kbps + steps * self.step_kbps
    }
}

impl Default for BitrateBounds {
    fn default() -> Self {
        Self {
            min_kbps: DEFAULT_MIN_KBPS,
            max_kbps: DEFAULT_MAX_KBPS,
            step_kbps: DEFAULT_STEP_KBPS,
            target_loss: DEFAULT_TARGET_LOSS_PCT / 100.0,
        }
    }
}

/// Settings for the dynamic bitrate controller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BitrateConfig {
    pub bounds: BitrateBounds,
    /// Target before the first change. Snapped onto the grid.
    pub start_kbps: u32,
    /// Controller period, independent of the rebalance interval.
    pub interval: Duration,
    /// Ticks to hold after any change before another change is allowed.
    pub cooldown_ticks: u32,
    /// Dead band (fraction) around `target_loss` in which nothing changes.
    pub loss_deadband: f64,
    /// Fraction of aggregate capacity kept free when ramping up.
    pub headroom: f64,
    /// Step down while the best healthy RTT exceeds this.
    pub rtt_ceiling_ms: Option<f64>,
}

impl BitrateConfig {
    pub fn new(bounds: BitrateBounds) -> Self {
        Self {
            start_kbps: bounds.ceiling_kbps(),
            bounds,
            interval: Duration::from_millis(DEFAULT_BITRATE_INTERVAL_MS),
            cooldown_ticks: DEFAULT_COOLDOWN_TICKS,
            loss_deadband: DEFAULT_LOSS_DEADBAND_PCT / 100.0,
            headroom: 0.0,
            rtt_ceiling_ms: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.bounds.validate()?;
        if self.interval.is_zero() {
            return Err(DispatchError::InvalidConfig(
                "bitrate interval-ms must be positive".into(),
            ));
        }
        if !(self.loss_deadband.is_finite() && self.loss_deadband >= 0.0) {
            return Err(DispatchError::InvalidConfig(
                "loss-deadband-pct must be non-negative".into(),
            ));
        }
        if !(self.headroom.is_finite() && (0.0..1.0).contains(&self.headroom)) {
            return Err(DispatchError::InvalidConfig(format!(
                "headroom must be in [0, 1), got {}",
                self.headroom
            )));
        }
        if let Some(ceiling) = self.rtt_ceiling_ms {
            if !(ceiling.is_finite() && ceiling > 0.0) {
                return Err(DispatchError::InvalidConfig(
                    "rtt-ceiling-ms must be positive".into(),
                ));
            }
        }
        Ok(())
    }

    /// Start target on the bitrate grid.
    pub fn start_target(&self) -> u32 {
        self.bounds.snap(self.start_kbps)
    }
}

impl Default for BitrateConfig {
    fn default() -> Self {
        Self::new(BitrateBounds::default())
    }
}

/// Everything one bonded session needs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionConfig {
    pub bonding: BondingConfig,
    pub bitrate: BitrateConfig,
}

impl SessionConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let parsed: SessionConfigInput = toml::from_str(input)
            .map_err(|e| DispatchError::InvalidConfig(format!("invalid config TOML: {e}")))?;
        parsed.resolve()
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("loading config {}", path.display()))
    }
}

// ─── Raw TOML input ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SessionConfigInput {
    pub version: u32,
    pub weights: Vec<f64>,
    pub strategy: Option<String>,
    pub rebalance_interval_ms: Option<u64>,
    pub auto_balance: Option<bool>,
    pub min_healthy_links: Option<usize>,
    pub max_weight: Option<f64>,
    pub min_weight: Option<f64>,
    pub window_depth: Option<usize>,
    pub publish_epsilon: Option<f64>,
    pub target_loss_pct: Option<f64>,
    pub scheduler: Option<String>,
    pub quantum_bytes: Option<usize>,
    pub health_warmup_ms: Option<u64>,
    pub ewma: EwmaInput,
    pub aimd: AimdInput,
    pub bitrate: BitrateInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EwmaInput {
    pub alpha: Option<f64>,
    pub rtt_reference_ms: Option<f64>,
    pub loss_exponent: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AimdInput {
    pub increment: Option<f64>,
    pub decrease_factor: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BitrateInput {
    pub min_kbps: Option<u32>,
    pub max_kbps: Option<u32>,
    pub step_kbps: Option<u32>,
    pub start_kbps: Option<u32>,
    pub interval_ms: Option<u64>,
    pub cooldown_ticks: Option<u32>,
    pub loss_deadband_pct: Option<f64>,
    pub headroom: Option<f64>,
    pub rtt_ceiling_ms: Option<f64>,
}

impl SessionConfigInput {
    pub fn resolve(self) -> Result<SessionConfig> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(DispatchError::InvalidConfig(format!(
                "unsupported config version {version}"
            )));
        }

        let target_loss_pct = self.target_loss_pct.unwrap_or(DEFAULT_TARGET_LOSS_PCT);

        let mut bonding = BondingConfig::with_weights(self.weights);
        if let Some(strategy) = self.strategy {
            bonding.strategy = strategy.parse()?;
        }
        if let Some(ms) = self.rebalance_interval_ms {
            bonding.rebalance_interval = Duration::from_millis(ms);
        }
        if let Some(auto) = self.auto_balance {
            bonding.auto_balance = auto;
        }
        if let Some(n) = self.min_healthy_links {
            bonding.min_healthy_links = n;
        }
        if let Some(max) = self.max_weight {
            bonding.max_weight = max;
        }
        if let Some(min) = self.min_weight {
            bonding.min_weight = min;
        }
        if let Some(depth) = self.window_depth {
            bonding.window_depth = depth;
        }
        if let Some(eps) = self.publish_epsilon {
            bonding.publish_epsilon = eps;
        }
        bonding.target_loss = target_loss_pct / 100.0;
        if let Some(scheduler) = self.scheduler {
            bonding.scheduler = scheduler.parse()?;
        }
        if let Some(quantum) = self.quantum_bytes {
            bonding.quantum_bytes = quantum;
        }
        if let Some(ms) = self.health_warmup_ms {
            bonding.health_warmup = Duration::from_millis(ms);
        }
        bonding.ewma = EwmaParams {
            alpha: self.ewma.alpha.unwrap_or(bonding.ewma.alpha),
            rtt_reference_ms: self
                .ewma
                .rtt_reference_ms
                .unwrap_or(bonding.ewma.rtt_reference_ms),
            loss_exponent: self.ewma.loss_exponent.unwrap_or(bonding.ewma.loss_exponent),
        };
        bonding.aimd = AimdParams {
            increment: self.aimd.increment.unwrap_or(bonding.aimd.increment),
            decrease_factor: self
                .aimd
                .decrease_factor
                .unwrap_or(bonding.aimd.decrease_factor),
        };
        bonding.validate()?;

        let input = self.bitrate;
        let bounds = BitrateBounds::new(
            input.min_kbps.unwrap_or(DEFAULT_MIN_KBPS),
            input.max_kbps.unwrap_or(DEFAULT_MAX_KBPS),
            input.step_kbps.unwrap_or(DEFAULT_STEP_KBPS),
            target_loss_pct,
        )?;
        let mut bitrate = BitrateConfig::new(bounds);
        if let Some(start) = input.start_kbps {
            bitrate.start_kbps = start;
        }
        if let Some(ms) = input.interval_ms {
            bitrate.interval = Duration::from_millis(ms);
        }
        if let Some(ticks) = input.cooldown_ticks {
            bitrate.cooldown_ticks = ticks;
        }
        if let Some(pct) = input.loss_deadband_pct {
            bitrate.loss_deadband = pct / 100.0;
        }
        if let Some(headroom) = input.headroom {
            bitrate.headroom = headroom;
        }
        bitrate.rtt_ceiling_ms = input.rtt_ceiling_ms;
        bitrate.validate()?;

        Ok(SessionConfig { bonding, bitrate })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_toml_config_basic() {
        let toml = r#"
            version = 1
            weights = [2.0, 1.5, 1.0, 0.5]
            strategy = "AIMD"
            rebalance-interval-ms = 250
            target-loss-pct = 1.5

            [aimd]
            increment = 0.2

            [bitrate]
            min-kbps = 1000
            max-kbps = 8000
            step-kbps = 250
            cooldown-ticks = 0
            rtt-ceiling-ms = 400.0
        "#;

        let cfg = SessionConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.bonding.link_count(), 4);
        assert_eq!(cfg.bonding.strategy, StrategyKind::Aimd);
        assert_eq!(cfg.bonding.rebalance_interval, Duration::from_millis(250));
        assert!((cfg.bonding.target_loss - 0.015).abs() < 1e-12);
        assert!((cfg.bonding.aimd.increment - 0.2).abs() < f64::EPSILON);
        assert!((cfg.bonding.aimd.decrease_factor - 0.5).abs() < f64::EPSILON);
        assert_eq!(cfg.bitrate.bounds.step_kbps, 250);
        assert!((cfg.bitrate.bounds.target_loss - 0.015).abs() < 1e-12);
        assert_eq!(cfg.bitrate.cooldown_ticks, 0);
        assert_eq!(cfg.bitrate.start_target(), 8000);
        assert_eq!(cfg.bitrate.rtt_ceiling_ms, Some(400.0));
    }

    #[test]
    fn parse_dispatch_settings() {
        let toml = r#"
            weights = [1.0, 1.0]
            scheduler = "DRR"
            quantum-bytes = 3000
            health-warmup-ms = 0
        "#;
        let cfg = SessionConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.bonding.scheduler, SelectionMode::DeficitRoundRobin);
        assert_eq!(cfg.bonding.quantum_bytes, 3000);
        assert!(cfg.bonding.health_warmup.is_zero());

        let err = SessionConfig::from_toml_str("weights = [1.0]\nscheduler = \"fifo\"")
            .unwrap_err();
        assert!(err.to_string().contains("unknown scheduler"));

        let err =
            SessionConfig::from_toml_str("weights = [1.0]\nquantum-bytes = 64").unwrap_err();
        assert!(err.to_string().contains("quantum-bytes"));
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let cfg = SessionConfig::from_toml_str("weights = [1.0]").unwrap();
        assert_eq!(cfg.bonding.strategy, StrategyKind::Ewma);
        assert!(cfg.bonding.auto_balance);
        assert_eq!(
            cfg.bonding.rebalance_interval,
            Duration::from_millis(DEFAULT_REBALANCE_INTERVAL_MS)
        );
        assert_eq!(cfg.bitrate.interval, Duration::from_millis(750));
        assert_eq!(cfg.bitrate.cooldown_ticks, DEFAULT_COOLDOWN_TICKS);
        assert_eq!(cfg.bonding.scheduler, SelectionMode::SmoothWeightedRoundRobin);
        assert_eq!(cfg.bonding.quantum_bytes, DEFAULT_QUANTUM_BYTES);
        assert_eq!(cfg.bonding.health_warmup, Duration::from_millis(2000));
    }

    #[test]
    fn auto_balance_off_forces_static() {
        let mut cfg = BondingConfig::with_weights(vec![1.0]);
        cfg.strategy = StrategyKind::Aimd;
        cfg.auto_balance = false;
        assert_eq!(cfg.effective_strategy(), StrategyKind::Static);
    }

    #[test]
    fn rejects_empty_link_set() {
        let err = SessionConfig::from_toml_str("strategy = \"ewma\"").unwrap_err();
        assert_eq!(err, DispatchError::EmptyLinkSet);
    }

    #[test]
    fn rejects_negative_weight() {
        let err = SessionConfig::from_toml_str("weights = [1.0, -0.5]").unwrap_err();
        assert_eq!(
            err,
            DispatchError::InvalidWeight {
                link: 1,
                weight: -0.5
            }
        );
    }

    #[test]
    fn rejects_all_zero_weights() {
        let err = SessionConfig::from_toml_str("weights = [0.0, 0.0]").unwrap_err();
        assert!(matches!(
            err,
            DispatchError::InsufficientHealthyLinks {
                healthy: 0,
                required: 1
            }
        ));
    }

    #[test]
    fn rejects_inverted_bounds() {
        let toml = r#"
            weights = [1.0]
            [bitrate]
            min-kbps = 5000
            max-kbps = 1000
        "#;
        let err = SessionConfig::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidBounds(_)));
    }

    #[test]
    fn rejects_zero_interval_and_bad_strategy() {
        let err =
            SessionConfig::from_toml_str("weights = [1.0]\nrebalance-interval-ms = 0").unwrap_err();
        assert!(matches!(err, DispatchError::InvalidConfig(_)));

        let err = SessionConfig::from_toml_str("weights = [1.0]\nstrategy = \"bbr\"").unwrap_err();
        assert!(err.to_string().contains("unknown strategy"));
    }

    #[test]
    fn rejects_unsupported_version() {
        let err = SessionConfig::from_toml_str("version = 7\nweights = [1.0]").unwrap_err();
        assert!(err.to_string().contains("unsupported config version"));
    }

    #[test]
    fn max_weight_defaults_to_largest_initial_weight() {
        let cfg = BondingConfig::with_weights(vec![10.0, 1.0]);
        assert!((cfg.max_weight - 10.0).abs() < f64::EPSILON);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn bounds_grid_ceiling_and_snap() {
        let bounds = BitrateBounds::new(1000, 8100, 250, 1.5).unwrap();
        assert_eq!(bounds.ceiling_kbps(), 8000);
        assert_eq!(bounds.snap(9000), 8000);
        assert_eq!(bounds.snap(10), 1000);
        assert_eq!(bounds.snap(1490), 1250);
        assert_eq!(bounds.snap(1500), 1500);
    }

    #[test]
    fn zero_step_rejected() {
        assert!(matches!(
            BitrateBounds::new(1000, 2000, 0, 1.0),
            Err(DispatchError::InvalidBounds(_))
        ));
    }
}
