//! Quota ledger for relaymeter
//!
//! Owns every mutation of user, token and channel quota: reservations,
//! commits, refunds and the batched writes behind them.

#![allow(clippy::missing_errors_doc, clippy::must_use_candidate)]

pub mod batch;
mod error;
mod ledger;
pub mod notify;
mod recorder;
pub mod storage;
mod store;

pub use batch::{BatchAccumulator, DeltaKind};
pub use error::{LedgerError, NotifyError, StoreError};
pub use ledger::{Commit, FlushReport, Ledger, LedgerOptions, Reservation, StaleReservation};
pub use notify::{LogNotifier, QuotaNotice, QuotaNotifier, QuotaReminder};
pub use recorder::UsageLogRecorder;
pub use storage::{MemoryStore, RedisStore};
pub use store::{QuotaStore, ReserveOutcome, UsageLogSink};
