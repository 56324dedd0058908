//! # Strata Bond Simulator
//!
//! Drives a bonding session with synthetic link telemetry, without any
//! network I/O. Each simulated tick feeds one sample per link, runs a
//! rebalance, runs the bitrate controller whenever its own period has
//! elapsed in simulated time, and dispatches one tick's worth of packets at
//! the current target bitrate.
//!
//! ## Usage
//!
//! ```bash
//! # Default four-link session, 40 ticks
//! strata-bond-sim
//!
//! # Config file, link 0 fails at tick 10 and comes back at tick 20
//! strata-bond-sim --config session.toml --fail-link 0@10 --restore-link 0@20
//!
//! # 3% loss on link 2, final status as JSON
//! strata-bond-sim --loss 2=3.0 --ticks 100 --json
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use rand::rngs::SmallRng;
use rand::{RngExt, SeedableRng};

use strata_dispatch::{
    BondingContext, DispatchError, Dispatcher, DynamicBitrateController, PacketContext,
    RebalanceScheduler, SessionConfig, TickOutcome,
};

const DEFAULT_WEIGHTS: &str = "weights = [2.0, 1.5, 1.0, 0.5]";
const PACKET_BYTES: usize = 1316;

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    // ── Parse CLI ───────────────────────────────────────────────
    let args = Cli::parse();
    let session = match &args.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::from_toml_str(DEFAULT_WEIGHTS)?,
    };
    let rebalance_period = session.bonding.rebalance_interval;
    let bitrate_period = session.bitrate.interval;

    let ctx = BondingContext::from_session(session)?;
    tracing::info!(
        links = ctx.link_count(),
        ticks = args.ticks,
        seed = args.seed,
        fail_events = args.fail.len(),
        restore_events = args.restore.len(),
        "strata-bond-sim starting"
    );

    // ── Graceful shutdown ───────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutting down...");
            running.store(false, Ordering::Relaxed);
        })?;
    }

    // ── Session components ──────────────────────────────────────
    let mut links = LinkModel::generate(ctx.link_count(), args.seed, &args.loss);
    let mut scheduler = RebalanceScheduler::new(ctx.clone());
    let mut controller = DynamicBitrateController::new(ctx.clone());
    let mut dispatcher = Dispatcher::new(ctx.clone());
    let mut since_bitrate = Duration::ZERO;
    let mut no_route = 0u64;

    // ── Main loop ───────────────────────────────────────────────
    for tick in 0..args.ticks {
        if !running.load(Ordering::Relaxed) {
            break;
        }

        for &(link, _) in args.fail.iter().filter(|(_, at)| *at == tick) {
            links.set_down(link, true);
            ctx.mark_failed(link)?;
        }
        for &(link, _) in args.restore.iter().filter(|(_, at)| *at == tick) {
            links.set_down(link, false);
            ctx.restore_link(link)?;
        }

        links.feed(&ctx);

        if let TickOutcome::Rejected(e) = scheduler.tick() {
            tracing::debug!(tick, error = %e, "rebalance rejected");
        }

        since_bitrate += rebalance_period;
        if since_bitrate >= bitrate_period {
            since_bitrate -= bitrate_period;
            controller.tick();
        }

        let packets = packets_per_tick(ctx.target_kbps(), rebalance_period);
        let pkt = PacketContext::new(PACKET_BYTES);
        for _ in 0..packets {
            match dispatcher.select_link(&pkt) {
                Ok(_) => {}
                Err(DispatchError::NoRoute) => no_route += 1,
                Err(e) => return Err(e.into()),
            }
        }

        let weights = ctx.weights();
        tracing::info!(
            tick,
            epoch = weights.epoch(),
            weights = ?weights.as_slice(),
            target_kbps = ctx.target_kbps(),
            "tick"
        );
    }

    // ── Summary ─────────────────────────────────────────────────
    tracing::info!(
        selections = ?dispatcher.selections(),
        no_route,
        rebalance = ?scheduler.stats(),
        "strata-bond-sim finished"
    );
    if args.json {
        println!("{}", serde_json::to_string_pretty(&ctx.status())?);
    }
    Ok(())
}

fn packets_per_tick(target_kbps: u32, period: Duration) -> u64 {
    let bits = f64::from(target_kbps) * 1000.0 * period.as_secs_f64();
    (bits / (PACKET_BYTES * 8) as f64).round() as u64
}

// ─── Synthetic links ────────────────────────────────────────────────────────

struct LinkProfile {
    base_rtt_ms: f64,
    base_loss: f64,
    capacity_kbps: f64,
    down: bool,
}

struct LinkModel {
    links: Vec<LinkProfile>,
    rng: SmallRng,
}

impl LinkModel {
    fn generate(count: usize, seed: u64, loss_overrides: &[(usize, f64)]) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let links = (0..count)
            .map(|id| {
                let base_loss = loss_overrides
                    .iter()
                    .find(|(link, _)| *link == id)
                    .map(|(_, loss)| *loss)
                    .unwrap_or_else(|| rng.random::<f64>() * 0.005);
                LinkProfile {
                    base_rtt_ms: 30.0 + rng.random::<f64>() * 70.0,
                    base_loss,
                    capacity_kbps: 1500.0 + rng.random::<f64>() * 3500.0,
                    down: false,
                }
            })
            .collect();
        Self { links, rng }
    }

    fn set_down(&mut self, link: usize, down: bool) {
        if let Some(profile) = self.links.get_mut(link) {
            profile.down = down;
        }
    }

    /// One jittered sample per live link.
    fn feed(&mut self, ctx: &BondingContext) {
        for (id, link) in self.links.iter().enumerate() {
            if link.down {
                continue;
            }
            let jitter = 0.8 + self.rng.random::<f64>() * 0.4;
            let loss_jitter = 0.5 + self.rng.random::<f64>();
            ctx.record_sample(
                id,
                link.base_rtt_ms * jitter,
                (link.base_loss * loss_jitter).min(1.0),
                link.capacity_kbps * jitter,
            );
        }
    }
}

// ─── CLI ────────────────────────────────────────────────────────────────────

/// Drive a bonding session with synthetic telemetry.
#[derive(Parser, Debug)]
#[command(name = "strata-bond-sim", about = "Strata bonding session simulator")]
struct Cli {
    /// Session config (TOML).
    #[arg(short, long, env = "STRATA_SIM_CONFIG")]
    config: Option<String>,

    /// Rebalance ticks to simulate.
    #[arg(short, long, default_value_t = 40)]
    ticks: u64,

    /// Telemetry RNG seed.
    #[arg(long, default_value_t = 0x5EED)]
    seed: u64,

    /// Mark a link failed at a tick (repeatable).
    #[arg(long = "fail-link", value_name = "ID@TICK", value_parser = parse_link_tick)]
    fail: Vec<(usize, u64)>,

    /// Restore a failed link at a tick (repeatable).
    #[arg(long = "restore-link", value_name = "ID@TICK", value_parser = parse_link_tick)]
    restore: Vec<(usize, u64)>,

    /// Base loss percentage for a link (repeatable).
    #[arg(long, value_name = "ID=PCT", value_parser = parse_link_loss)]
    loss: Vec<(usize, f64)>,

    /// Print the final session status as JSON.
    #[arg(long, default_value_t = false)]
    json: bool,
}

fn parse_link_tick(val: &str) -> Result<(usize, u64), String> {
    let (link, tick) = val
        .split_once('@')
        .ok_or_else(|| format!("expected ID@TICK, got '{val}'"))?;
    let link: usize = link
        .trim()
        .parse()
        .map_err(|e| format!("invalid link id '{link}': {e}"))?;
    let tick: u64 = tick
        .trim()
        .parse()
        .map_err(|e| format!("invalid tick '{tick}': {e}"))?;
    Ok((link, tick))
}

/// `ID=PCT`, returned as a loss fraction.
fn parse_link_loss(val: &str) -> Result<(usize, f64), String> {
    let (link, pct) = val
        .split_once('=')
        .ok_or_else(|| format!("expected ID=PCT, got '{val}'"))?;
    let link: usize = link
        .trim()
        .parse()
        .map_err(|e| format!("invalid link id '{link}': {e}"))?;
    let pct: f64 = pct
        .trim()
        .parse()
        .map_err(|e| format!("invalid loss '{pct}': {e}"))?;
    if !(0.0..=100.0).contains(&pct) {
        return Err(format!("loss percentage must be in [0, 100], got {pct}"));
    }
    Ok((link, pct / 100.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn cli_collects_repeated_events() {
        let cli = Cli::try_parse_from([
            "strata-bond-sim",
            "--config",
            "session.toml",
            "--fail-link",
            "0@10",
            "--fail-link",
            "2@15",
            "--restore-link",
            "0@20",
            "--loss",
            "1=2.5",
            "-t",
            "60",
            "--json",
        ])
        .unwrap();
        assert_eq!(cli.config.as_deref(), Some("session.toml"));
        assert_eq!(cli.fail, vec![(0, 10), (2, 15)]);
        assert_eq!(cli.restore, vec![(0, 20)]);
        assert_eq!(cli.loss, vec![(1, 0.025)]);
        assert_eq!(cli.ticks, 60);
        assert!(cli.json);
    }

    #[test]
    fn cli_rejects_malformed_events() {
        assert!(Cli::try_parse_from(["strata-bond-sim", "--fail-link", "0:10"]).is_err());
        assert!(Cli::try_parse_from(["strata-bond-sim", "--loss", "1=150"]).is_err());
        assert!(Cli::try_parse_from(["strata-bond-sim", "--bogus"]).is_err());
    }

    #[test]
    fn link_tick_parser() {
        assert_eq!(parse_link_tick(" 3 @ 7 "), Ok((3, 7)));
        assert!(parse_link_tick("x@7").unwrap_err().contains("invalid link id"));
        assert!(parse_link_tick("3@-1").unwrap_err().contains("invalid tick"));
    }

    #[test]
    fn link_loss_parser_returns_fraction() {
        assert_eq!(parse_link_loss("2=3"), Ok((2, 0.03)));
        assert!(parse_link_loss("2").unwrap_err().contains("expected ID=PCT"));
    }
}
