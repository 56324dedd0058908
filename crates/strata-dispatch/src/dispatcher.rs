//! # Dispatcher
//!
//! Per-packet link selection over the currently published weight vector.
//!
//! Each packet-producing thread owns its own [`Dispatcher`] and shares the
//! session through `Arc<BondingContext>`. A call performs one lock-free
//! load of the published vector, walks it once, and never allocates.
//!
//! ## Modes
//!
//! - **Smooth weighted round-robin** (default): every positive weight is
//!   added to its link's credit, the link with the highest credit wins and
//!   pays back the total. Over any window of `sum(w)` packets each link gets
//!   its exact share, interleaved rather than bursty. Equal weights reduce
//!   to plain round-robin.
//! - **Weighted random**: draws from an injectable RNG and walks the
//!   cumulative weights. Equal weights rotate round-robin instead of
//!   drawing, so no link starves on an unlucky streak.
//! - **Deficit round-robin**: shares bytes rather than packets. The link
//!   under the cursor earns a weight-scaled quantum once per visit and keeps
//!   sending while its deficit covers the packet.
//!
//! ## Epochs and warm-up
//!
//! SWRR credits survive a new epoch: links that dropped to 0 lose theirs,
//! the rest are clamped to the new total and re-centred on zero. DRR
//! deficits of excluded links are cleared.
//!
//! A link that came back from weight 0 within the session's
//! `health_warmup` is dispatched at a reduced share, starting at half and
//! ramping linearly to full. Only the dispatch view is scaled; the
//! published vector is untouched.

use std::sync::Arc;
use std::time::Duration;

use quanta::Instant;
use rand::rngs::SmallRng;
use rand::{Rng, RngExt, SeedableRng};
use tracing::trace;

use crate::context::BondingContext;
use crate::error::{DispatchError, Result};
use crate::weights::{WeightVector, warmup_factor};

pub use crate::config::SelectionMode;

const DEFAULT_SEED: u64 = 0xB04D;

/// What the caller knows about the packet being routed.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketContext {
    /// Drives deficit round-robin; the packet-based modes ignore it.
    pub size_bytes: usize,
    /// Keyframes, headers. Routed like any other packet.
    pub is_critical: bool,
}

impl PacketContext {
    pub fn new(size_bytes: usize) -> Self {
        Self {
            size_bytes,
            is_critical: false,
        }
    }
}

pub struct Dispatcher<R = SmallRng> {
    ctx: Arc<BondingContext>,
    mode: SelectionMode,
    rng: R,
    credits: Vec<f64>,
    deficits: Vec<f64>,
    /// The DRR link under the cursor already earned its quantum.
    granted: bool,
    epoch: u64,
    cursor: usize,
    warm_until: Option<Instant>,
    /// Warm-up scaled weights, reused across calls.
    scaled: Vec<f64>,
    selections: Vec<u64>,
}

impl Dispatcher<SmallRng> {
    /// Dispatcher using the scheduler named in the session config.
    pub fn new(ctx: Arc<BondingContext>) -> Self {
        let mode = ctx.config().scheduler;
        Self::with_mode(ctx, mode)
    }

    pub fn with_mode(ctx: Arc<BondingContext>, mode: SelectionMode) -> Self {
        Self::with_rng(ctx, mode, SmallRng::seed_from_u64(DEFAULT_SEED))
    }
}

impl<R: Rng> Dispatcher<R> {
    pub fn with_rng(ctx: Arc<BondingContext>, mode: SelectionMode, rng: R) -> Self {
        let n = ctx.link_count();
        let published = ctx.weights();
        let warm_until = published.warm_until(ctx.config().health_warmup);
        Self {
            mode,
            rng,
            credits: vec![0.0; n],
            deficits: vec![0.0; n],
            granted: false,
            epoch: published.epoch(),
            cursor: 0,
            warm_until,
            scaled: vec![0.0; n],
            selections: vec![0; n],
            ctx,
        }
    }

    pub fn mode(&self) -> SelectionMode {
        self.mode
    }

    /// Picks the link for one outbound packet. Returns
    /// [`DispatchError::NoRoute`] when every published weight is 0.
    pub fn select_link(&mut self, packet: &PacketContext) -> Result<usize> {
        let published = self.ctx.published().load();
        if published.epoch() != self.epoch {
            self.epoch = published.epoch();
            carry_credits(published.as_slice(), &mut self.credits);
            for (deficit, &w) in self.deficits.iter_mut().zip(published.as_slice()) {
                if w <= 0.0 {
                    *deficit = 0.0;
                }
            }
            self.warm_until = published.warm_until(self.ctx.config().health_warmup);
        }

        let weights: &[f64] = match self.warm_until {
            Some(until) => {
                let now = Instant::now();
                if now >= until {
                    self.warm_until = None;
                    published.as_slice()
                } else {
                    let warmup = self.ctx.config().health_warmup;
                    scale_for_warmup(&published, warmup, now, &mut self.scaled);
                    &self.scaled
                }
            }
            None => published.as_slice(),
        };

        let chosen = match self.mode {
            SelectionMode::SmoothWeightedRoundRobin => swrr(weights, &mut self.credits),
            SelectionMode::WeightedRandom => {
                weighted_random(weights, &mut self.rng, &mut self.cursor)
            }
            SelectionMode::DeficitRoundRobin => drr(
                weights,
                &mut self.deficits,
                &mut self.cursor,
                &mut self.granted,
                packet.size_bytes,
                self.ctx.config().quantum_bytes,
            ),
        }
        .ok_or(DispatchError::NoRoute)?;

        self.selections[chosen] += 1;
        trace!(
            link = chosen,
            epoch = self.epoch,
            size = packet.size_bytes,
            critical = packet.is_critical,
            "dispatch"
        );
        Ok(chosen)
    }

    /// Packets routed to each link by this dispatcher.
    pub fn selections(&self) -> &[u64] {
        &self.selections
    }

    pub fn reset_selections(&mut self) {
        self.selections.iter_mut().for_each(|s| *s = 0);
    }
}

fn scale_for_warmup(
    published: &WeightVector,
    warmup: Duration,
    now: Instant,
    out: &mut [f64],
) {
    for (link, (slot, &w)) in out.iter_mut().zip(published.as_slice()).enumerate() {
        *slot = match published.raised_at(link) {
            Some(since) if w > 0.0 => {
                w * warmup_factor(now.saturating_duration_since(since), warmup)
            }
            _ => w,
        };
    }
}

fn carry_credits(weights: &[f64], credits: &mut [f64]) {
    let (mut total, mut live) = (0.0, 0usize);
    for &w in weights.iter().filter(|w| **w > 0.0) {
        total += w;
        live += 1;
    }
    if live == 0 {
        credits.iter_mut().for_each(|c| *c = 0.0);
        return;
    }
    let mut sum = 0.0;
    for (credit, &w) in credits.iter_mut().zip(weights) {
        if w > 0.0 {
            *credit = (*credit).clamp(-total, total);
            sum += *credit;
        } else {
            *credit = 0.0;
        }
    }
    let mean = sum / live as f64;
    for (credit, &w) in credits.iter_mut().zip(weights) {
        if w > 0.0 {
            *credit -= mean;
        }
    }
}

fn swrr(weights: &[f64], credits: &mut [f64]) -> Option<usize> {
    let mut total = 0.0;
    let mut best: Option<usize> = None;
    let mut best_credit = f64::NEG_INFINITY;
    for (i, (&w, credit)) in weights.iter().zip(credits.iter_mut()).enumerate() {
        if w <= 0.0 {
            continue;
        }
        *credit += w;
        total += w;
        if *credit > best_credit {
            best_credit = *credit;
            best = Some(i);
        }
    }
    let chosen = best?;
    credits[chosen] -= total;
    Some(chosen)
}

fn weighted_random(weights: &[f64], rng: &mut impl Rng, cursor: &mut usize) -> Option<usize> {
    let mut total = 0.0;
    let mut first: Option<f64> = None;
    let mut uniform = true;
    for &w in weights.iter().filter(|w| **w > 0.0) {
        total += w;
        match first {
            None => first = Some(w),
            Some(f) if f != w => uniform = false,
            Some(_) => {}
        }
    }
    first?;

    if uniform {
        let n = weights.len();
        for step in 0..n {
            let i = (*cursor + step) % n;
            if weights[i] > 0.0 {
                *cursor = (i + 1) % n;
                return Some(i);
            }
        }
        return None;
    }

    let r = rng.random::<f64>() * total;
    let mut acc = 0.0;
    let mut last = None;
    for (i, &w) in weights.iter().enumerate() {
        if w <= 0.0 {
            continue;
        }
        acc += w;
        last = Some(i);
        if r < acc {
            return Some(i);
        }
    }
    last
}

/// A link's quantum is `quantum_bytes` scaled by its weight relative to the
/// mean positive weight. The heaviest link earns at least `quantum_bytes`
/// per round, so the loop ends within `size / quantum_bytes + 1` rounds.
fn drr(
    weights: &[f64],
    deficits: &mut [f64],
    cursor: &mut usize,
    granted: &mut bool,
    size_bytes: usize,
    quantum_bytes: usize,
) -> Option<usize> {
    let (mut total, mut live) = (0.0, 0usize);
    for &w in weights.iter().filter(|w| **w > 0.0) {
        total += w;
        live += 1;
    }
    if live == 0 {
        return None;
    }
    let n = weights.len();
    let need = size_bytes.max(1) as f64;
    let per_weight = quantum_bytes as f64 * live as f64 / total;

    loop {
        let i = *cursor % n;
        let w = weights[i];
        if w > 0.0 {
            if !*granted {
                deficits[i] += per_weight * w;
                *granted = true;
            }
            if deficits[i] >= need {
                deficits[i] -= need;
                *cursor = i;
                return Some(i);
            }
        } else {
            deficits[i] = 0.0;
        }
        *cursor = (i + 1) % n;
        *granted = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BitrateConfig, BondingConfig};
    use rand::rngs::StdRng;

    fn context(weights: Vec<f64>) -> Arc<BondingContext> {
        let mut cfg = BondingConfig::with_weights(weights);
        cfg.auto_balance = false;
        BondingContext::new(cfg, BitrateConfig::default()).unwrap()
    }

    fn context_with(weights: Vec<f64>, f: impl FnOnce(&mut BondingConfig)) -> Arc<BondingContext> {
        let mut cfg = BondingConfig::with_weights(weights);
        cfg.auto_balance = false;
        f(&mut cfg);
        BondingContext::new(cfg, BitrateConfig::default()).unwrap()
    }

    fn run<R: Rng>(d: &mut Dispatcher<R>, packets: usize) -> Vec<usize> {
        let pkt = PacketContext::new(1200);
        (0..packets).map(|_| d.select_link(&pkt).unwrap()).collect()
    }

    // ─── Smooth WRR ───

    #[test]
    fn swrr_exact_shares() {
        let ctx = context(vec![2.0, 1.5, 1.0, 0.5]);
        let mut d = Dispatcher::new(ctx);
        run(&mut d, 500);
        assert_eq!(d.selections(), &[200, 150, 100, 50]);
    }

    #[test]
    fn swrr_interleaves() {
        let ctx = context(vec![5.0, 1.0, 1.0]);
        let mut d = Dispatcher::new(ctx);
        assert_eq!(run(&mut d, 7), vec![0, 0, 1, 0, 2, 0, 0]);
    }

    #[test]
    fn swrr_equal_weights_round_robin() {
        let ctx = context(vec![1.0, 1.0, 1.0]);
        let mut d = Dispatcher::new(ctx);
        assert_eq!(run(&mut d, 6), vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn zero_weight_never_selected() {
        let ctx = context(vec![1.0, 0.0, 3.0]);
        let mut d = Dispatcher::new(ctx);
        assert!(run(&mut d, 1000).iter().all(|&l| l != 1));
    }

    #[test]
    fn no_route_when_all_zero() {
        let ctx = context(vec![1.0]);
        let mut d = Dispatcher::new(ctx.clone());
        assert_eq!(d.select_link(&PacketContext::default()), Ok(0));
        ctx.set_link_weight(0, 0.0).unwrap();
        assert_eq!(
            d.select_link(&PacketContext::default()),
            Err(DispatchError::NoRoute)
        );
    }

    #[test]
    fn excluded_link_loses_credit_on_new_epoch() {
        let ctx = context(vec![1.0, 1.0]);
        let mut d = Dispatcher::new(ctx.clone());
        run(&mut d, 3);
        ctx.set_link_weight(0, 0.0).unwrap();
        d.reset_selections();
        run(&mut d, 10);
        assert_eq!(d.selections(), &[0, 10]);
    }

    #[test]
    fn swrr_credits_survive_republish() {
        // A publish between every packet must not hand every packet to the
        // lowest-index link.
        let ctx = context(vec![1.0, 1.0]);
        let mut d = Dispatcher::new(ctx.clone());
        let pkt = PacketContext::new(1200);
        for _ in 0..100 {
            ctx.set_link_weight(0, 1.0).unwrap();
            d.select_link(&pkt).unwrap();
        }
        assert_eq!(d.selections(), &[50, 50]);
    }

    #[test]
    fn carried_credits_are_clamped_and_centred() {
        let mut credits = vec![9.0, -1.0, 4.0];
        carry_credits(&[1.0, 1.0, 0.0], &mut credits);
        // Clamped to +-2, link 2 cleared, then centred.
        assert_eq!(credits, vec![1.5, -1.5, 0.0]);
        assert!((credits.iter().sum::<f64>()).abs() < 1e-12);

        carry_credits(&[0.0, 0.0, 0.0], &mut credits);
        assert_eq!(credits, vec![0.0, 0.0, 0.0]);
    }

    // ─── Weighted random ───

    #[test]
    fn random_is_deterministic_under_seed() {
        let ctx = context(vec![3.0, 1.0]);
        let mut a = Dispatcher::with_rng(
            ctx.clone(),
            SelectionMode::WeightedRandom,
            StdRng::seed_from_u64(42),
        );
        let mut b =
            Dispatcher::with_rng(ctx, SelectionMode::WeightedRandom, StdRng::seed_from_u64(42));
        assert_eq!(run(&mut a, 200), run(&mut b, 200));
    }

    #[test]
    fn random_respects_proportions() {
        let ctx = context(vec![3.0, 0.0, 1.0]);
        let mut d = Dispatcher::with_rng(ctx, SelectionMode::WeightedRandom, StdRng::seed_from_u64(7));
        run(&mut d, 20_000);
        let s = d.selections();
        assert_eq!(s[1], 0);
        let share = s[0] as f64 / 20_000.0;
        assert!((share - 0.75).abs() < 0.03, "share {share}");
    }

    #[test]
    fn random_equal_weights_rotate() {
        let ctx = context(vec![2.0, 0.0, 2.0, 2.0]);
        let mut d = Dispatcher::with_mode(ctx, SelectionMode::WeightedRandom);
        assert_eq!(run(&mut d, 6), vec![0, 2, 3, 0, 2, 3]);
    }

    // ─── Deficit round-robin ───

    #[test]
    fn drr_serves_bytes_in_quanta() {
        let ctx = context(vec![1.0, 1.0]);
        let mut d = Dispatcher::with_mode(ctx, SelectionMode::DeficitRoundRobin);
        let pkt = PacketContext::new(1000);
        let picks: Vec<usize> = (0..7).map(|_| d.select_link(&pkt).unwrap()).collect();
        assert_eq!(picks, vec![0, 1, 0, 0, 1, 1, 0]);
    }

    #[test]
    fn drr_shares_bytes_by_weight() {
        let ctx = context(vec![3.0, 0.0, 1.0]);
        let mut d = Dispatcher::with_mode(ctx, SelectionMode::DeficitRoundRobin);
        let mut sizes = StdRng::seed_from_u64(11);
        let mut bytes = [0usize; 3];
        for _ in 0..20_000 {
            let size = sizes.random_range(200..1400);
            let link = d.select_link(&PacketContext::new(size)).unwrap();
            bytes[link] += size;
        }
        assert_eq!(bytes[1], 0);
        let share = bytes[0] as f64 / (bytes[0] + bytes[2]) as f64;
        assert!((share - 0.75).abs() < 0.01, "byte share {share}");
    }

    #[test]
    fn drr_routes_packets_larger_than_quantum() {
        let ctx = context_with(vec![0.5, 4.0], |cfg| cfg.quantum_bytes = 256);
        let mut d = Dispatcher::with_mode(ctx, SelectionMode::DeficitRoundRobin);
        for _ in 0..50 {
            d.select_link(&PacketContext::new(9000)).unwrap();
        }
        let s = d.selections();
        assert!(s[1] > s[0]);
    }

    #[test]
    fn drr_no_route_when_all_zero() {
        let ctx = context(vec![1.0, 1.0]);
        let mut d = Dispatcher::with_mode(ctx.clone(), SelectionMode::DeficitRoundRobin);
        ctx.set_weights(vec![0.0, 0.0]).unwrap();
        assert_eq!(
            d.select_link(&PacketContext::new(1200)),
            Err(DispatchError::NoRoute)
        );
    }

    #[test]
    fn scheduler_comes_from_config() {
        let ctx = context_with(vec![1.0], |cfg| {
            cfg.scheduler = SelectionMode::DeficitRoundRobin
        });
        assert_eq!(Dispatcher::new(ctx).mode(), SelectionMode::DeficitRoundRobin);
    }

    // ─── Warm-up ───

    #[test]
    fn restored_link_ramps_in_at_reduced_share() {
        let ctx = context_with(vec![1.0, 1.0], |cfg| {
            cfg.health_warmup = Duration::from_secs(600)
        });
        let mut d = Dispatcher::new(ctx.clone());
        ctx.mark_failed(1).unwrap();
        ctx.restore_link(1).unwrap();

        // The published vector keeps the full weight.
        assert_eq!(ctx.weights().as_slice(), &[1.0, 1.0]);
        run(&mut d, 3000);
        let share = d.selections()[1] as f64 / 3000.0;
        assert!((share - 1.0 / 3.0).abs() < 0.02, "restored share {share}");
    }

    #[test]
    fn warmup_disabled_gives_full_share() {
        let ctx = context_with(vec![1.0, 1.0], |cfg| cfg.health_warmup = Duration::ZERO);
        let mut d = Dispatcher::new(ctx.clone());
        ctx.mark_failed(1).unwrap();
        ctx.restore_link(1).unwrap();
        run(&mut d, 3000);
        assert_eq!(d.selections(), &[1500, 1500]);
    }

    #[test]
    fn warmup_ends_after_period() {
        let ctx = context_with(vec![1.0, 1.0], |cfg| {
            cfg.health_warmup = Duration::from_millis(20)
        });
        let mut d = Dispatcher::new(ctx.clone());
        ctx.mark_failed(1).unwrap();
        ctx.restore_link(1).unwrap();
        run(&mut d, 10);
        std::thread::sleep(Duration::from_millis(40));

        d.reset_selections();
        run(&mut d, 1000);
        let s = d.selections();
        assert!(s[0].abs_diff(s[1]) <= 2, "selections {s:?}");
    }

    #[test]
    fn session_start_links_do_not_warm_up() {
        let ctx = context(vec![1.0, 1.0]);
        let mut d = Dispatcher::new(ctx);
        run(&mut d, 1000);
        assert_eq!(d.selections(), &[500, 500]);
    }
}
