//! Background drivers for the two control loops.
//!
//! Each loop is a named OS thread that sleeps on a crossbeam stop channel
//! until its next deadline, runs one tick, and repeats. Deadlines advance
//! by a fixed period so ticks do not drift; if a tick overruns, missed
//! deadlines are skipped rather than replayed in a burst.
//!
//! Shutdown sends on the stop channel and joins. A tick that is already
//! running completes first, so the published vector and bitrate target are
//! never left half-updated.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use quanta::Instant;
use tracing::{debug, info, warn};

use crate::bitrate::DynamicBitrateController;
use crate::context::BondingContext;
use crate::rebalance::RebalanceScheduler;

pub struct ControlLoop {
    name: String,
    stop_tx: Option<Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ControlLoop {
    pub fn spawn<F>(name: &str, period: Duration, mut tick: F) -> std::io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                debug!(name = %thread_name, period_ms = period.as_millis() as u64, "control loop started");
                let mut deadline = Instant::now() + period;
                loop {
                    let wait = deadline.saturating_duration_since(Instant::now());
                    match stop_rx.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => {
                            tick();
                            deadline = deadline + period;
                            let now = Instant::now();
                            if deadline < now {
                                deadline = now + period;
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!(name = %thread_name, "control loop stopped");
            })?;

        Ok(Self {
            name: name.to_string(),
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stops the loop and waits for it. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(name = %self.name, "control loop panicked");
            }
        }
    }
}

impl Drop for ControlLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Runs the rebalance scheduler and the bitrate controller for one session.
///
/// Dropping the runtime stops both loops.
pub struct BondingRuntime {
    ctx: Arc<BondingContext>,
    rebalance: ControlLoop,
    bitrate: ControlLoop,
}

impl BondingRuntime {
    pub fn start(ctx: Arc<BondingContext>) -> std::io::Result<Self> {
        let mut scheduler = RebalanceScheduler::new(ctx.clone());
        let rebalance = ControlLoop::spawn(
            "strata-rebalance",
            ctx.config().rebalance_interval,
            move || {
                scheduler.tick();
            },
        )?;

        let mut controller = DynamicBitrateController::new(ctx.clone());
        let bitrate = ControlLoop::spawn("strata-bitrate", ctx.bitrate_config().interval, move || {
            controller.tick();
        })?;

        info!(
            rebalance_ms = ctx.config().rebalance_interval.as_millis() as u64,
            bitrate_ms = ctx.bitrate_config().interval.as_millis() as u64,
            "bonding runtime started"
        );
        Ok(Self {
            ctx,
            rebalance,
            bitrate,
        })
    }

    pub fn context(&self) -> &Arc<BondingContext> {
        &self.ctx
    }

    pub fn is_running(&self) -> bool {
        self.rebalance.is_running() && self.bitrate.is_running()
    }

    pub fn shutdown(&mut self) {
        self.rebalance.shutdown();
        self.bitrate.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BitrateConfig, BondingConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn loop_ticks_until_shutdown() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let mut l = ControlLoop::spawn("test-loop", Duration::from_millis(5), move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        thread::sleep(Duration::from_millis(100));
        assert!(l.is_running());
        l.shutdown();
        let after = count.load(Ordering::SeqCst);
        assert!(after >= 3, "ticks {after}");
        assert!(!l.is_running());

        thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), after);
        l.shutdown();
    }

    #[test]
    fn shutdown_is_bounded_with_long_period() {
        let mut l = ControlLoop::spawn("idle-loop", Duration::from_secs(3600), || {}).unwrap();
        let started = std::time::Instant::now();
        l.shutdown();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn runtime_drives_rebalance_and_bitrate() {
        let mut cfg = BondingConfig::with_weights(vec![1.0, 1.0]);
        cfg.rebalance_interval = Duration::from_millis(10);
        let mut bitrate = BitrateConfig::default();
        bitrate.interval = Duration::from_millis(10);
        bitrate.cooldown_ticks = 0;
        let ctx = BondingContext::new(cfg, bitrate).unwrap();
        ctx.record_sample(0, 30.0, 0.2, 3000.0);
        ctx.record_sample(1, 30.0, 0.2, 3000.0);

        let mut rt = BondingRuntime::start(ctx.clone()).unwrap();
        thread::sleep(Duration::from_millis(200));
        rt.shutdown();
        assert!(!rt.is_running());

        assert!(ctx.epoch() > 0);
        assert!(ctx.target_kbps() < 8000);
        assert!(ctx.status().rebalance.ticks > 0);
    }
}
