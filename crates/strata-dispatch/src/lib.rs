//! # strata-dispatch
//!
//! Adaptive link dispatch and dynamic bitrate control for bonded links.
//!
//! A session is one [`BondingContext`]. Telemetry goes in through
//! [`BondingContext::record_sample`]; the [`RebalanceScheduler`] turns it
//! into a published weight vector; every outbound packet asks a
//! [`Dispatcher`] for a link; the [`DynamicBitrateController`] steers the
//! encoder target. [`BondingRuntime`] runs both control loops in the
//! background.
//!
//! ```no_run
//! use strata_dispatch::{BondingContext, BondingRuntime, Dispatcher, PacketContext, SessionConfig};
//!
//! # fn main() -> anyhow::Result<()> {
//! let session = SessionConfig::from_toml_str("weights = [2.0, 1.0]")?;
//! let ctx = BondingContext::from_session(session)?;
//! let _runtime = BondingRuntime::start(ctx.clone())?;
//!
//! ctx.record_sample(0, 35.0, 0.002, 4200.0);
//! let mut dispatcher = Dispatcher::new(ctx.clone());
//! let link = dispatcher.select_link(&PacketContext::new(1316))?;
//! # let _ = (link, ctx.target_kbps());
//! # Ok(())
//! # }
//! ```

pub mod bitrate;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod rebalance;
pub mod registry;
pub mod runtime;
pub mod strategy;
pub mod weights;

pub use bitrate::{
    AggregateHealth, BitrateChange, BitrateDecision, BitratePhase, BitrateReason,
    DynamicBitrateController,
};
pub use config::{BitrateBounds, BitrateConfig, BondingConfig, SessionConfig, StrategyKind};
pub use context::{BondingContext, BondingStatus};
pub use dispatcher::{Dispatcher, PacketContext, SelectionMode};
pub use error::{DispatchError, Result};
pub use rebalance::{RebalancePhase, RebalanceScheduler, RebalanceStats, TickOutcome};
pub use registry::{LinkRegistry, LinkSample, LinkSummary};
pub use runtime::{BondingRuntime, ControlLoop};
pub use strategy::WeightStrategy;
pub use weights::WeightVector;
