//! Channel health monitor for relaymeter
//!
//! Classifies upstream failures, decides channel status transitions and
//! drives the periodic probe sweep and balance refresh.

#![allow(clippy::missing_errors_doc, clippy::must_use_candidate)]

mod classify;
mod error;
mod monitor;
mod policy;
mod prober;

pub use classify::{Outcome, classify};
pub use error::HealthError;
pub use monitor::{BalanceReport, HealthMonitor, SweepReport};
pub use policy::{HealthPolicy, Observation, Source, Transition, decide};
pub use prober::{ProbeReport, Prober};
