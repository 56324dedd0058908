//! # Link Registry
//!
//! Per-link telemetry windows. Samples are pushed by whatever observes the
//! links (a transport, a receiver report, the simulator) and read by the
//! rebalance and bitrate loops as averaged [`LinkSummary`] snapshots.
//!
//! Each link has its own lock so producers for different links never
//! contend. Windows are bounded; the oldest sample is evicted on overflow.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::Serialize;
use tracing::warn;

use crate::error::{DispatchError, Result};

/// One telemetry observation for a link.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LinkSample {
    pub rtt_ms: f64,
    /// Loss fraction in `[0, 1]`.
    pub loss: f64,
    pub throughput_kbps: f64,
}

impl LinkSample {
    pub fn new(rtt_ms: f64, loss: f64, throughput_kbps: f64) -> Self {
        Self {
            rtt_ms,
            loss,
            throughput_kbps,
        }
    }

    /// Checks the sample as a reading for `link`.
    pub fn validate(&self, link: usize) -> Result<()> {
        check_quality(link, self.rtt_ms, self.loss, self.throughput_kbps)
    }
}

/// Windowed view of one link, as handed to strategies.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkSummary {
    pub id: usize,
    /// Samples in the window. Zero means the averages below are meaningless.
    pub samples: usize,
    pub rtt_ms: f64,
    pub loss: f64,
    pub throughput_kbps: f64,
    /// Marked failed by an operator or a health input. Strategies keep
    /// such links at 0.
    pub failed: bool,
}

impl LinkSummary {
    pub fn has_samples(&self) -> bool {
        self.samples > 0
    }

    /// Rejects summaries a strategy cannot score.
    pub fn validate(&self) -> Result<()> {
        if !self.has_samples() {
            return Ok(());
        }
        check_quality(self.id, self.rtt_ms, self.loss, self.throughput_kbps)
    }
}

fn check_quality(link: usize, rtt_ms: f64, loss: f64, throughput_kbps: f64) -> Result<()> {
    if !rtt_ms.is_finite() || rtt_ms < 0.0 {
        return Err(DispatchError::MalformedSample {
            link,
            reason: "rtt must be finite and non-negative",
        });
    }
    if !(0.0..=1.0).contains(&loss) {
        return Err(DispatchError::MalformedSample {
            link,
            reason: "loss must be in [0, 1]",
        });
    }
    if !throughput_kbps.is_finite() || throughput_kbps < 0.0 {
        return Err(DispatchError::MalformedSample {
            link,
            reason: "throughput must be finite and non-negative",
        });
    }
    Ok(())
}

pub struct LinkRegistry {
    links: Vec<Mutex<VecDeque<LinkSample>>>,
    depth: usize,
}

impl LinkRegistry {
    pub fn new(link_count: usize, depth: usize) -> Self {
        let depth = depth.max(1);
        Self {
            links: (0..link_count)
                .map(|_| Mutex::new(VecDeque::with_capacity(depth)))
                .collect(),
            depth,
        }
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn window_depth(&self) -> usize {
        self.depth
    }

    /// Appends a sample. Unknown link ids and unusable readings (non-finite,
    /// negative, loss outside `[0, 1]`) are logged and dropped, so the
    /// window only ever holds scorable data.
    pub fn record_sample(&self, link: usize, sample: LinkSample) {
        let Some(slot) = self.links.get(link) else {
            warn!(link, links = self.links.len(), "sample for unknown link ignored");
            return;
        };
        if let Err(e) = sample.validate(link) {
            warn!(link, error = %e, ?sample, "malformed sample dropped");
            return;
        }
        let mut window = slot.lock().unwrap_or_else(|e| e.into_inner());
        if window.len() == self.depth {
            window.pop_front();
        }
        window.push_back(sample);
    }

    /// Most recent sample for `link`, if any.
    pub fn latest(&self, link: usize) -> Option<LinkSample> {
        let slot = self.links.get(link)?;
        let window = slot.lock().unwrap_or_else(|e| e.into_inner());
        window.back().copied()
    }

    /// Averages every window. `failed` is indexed by link id; missing
    /// entries count as not failed.
    pub fn snapshot(&self, failed: &[bool]) -> Vec<LinkSummary> {
        self.links
            .iter()
            .enumerate()
            .map(|(id, slot)| {
                let window = slot.lock().unwrap_or_else(|e| e.into_inner());
                let n = window.len();
                let (mut rtt, mut loss, mut tp) = (0.0, 0.0, 0.0);
                for s in window.iter() {
                    rtt += s.rtt_ms;
                    loss += s.loss;
                    tp += s.throughput_kbps;
                }
                let div = n.max(1) as f64;
                LinkSummary {
                    id,
                    samples: n,
                    rtt_ms: rtt / div,
                    loss: loss / div,
                    throughput_kbps: tp / div,
                    failed: failed.get(id).copied().unwrap_or(false),
                }
            })
            .collect()
    }
}
