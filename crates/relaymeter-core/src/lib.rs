//! Shared building blocks for relaymeter
//!
//! Entities persisted by the ledger, the caller-facing error contract,
//! the normalized upstream failure and the background task pool.

#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod error;
pub mod model;
pub mod tasks;
pub mod upstream;

pub use error::{ErrorBody, ErrorDetail, HttpError};
pub use model::{
    Channel, ChannelId, ChannelPricing, ChannelStatus, LogKind, Quota, Token, TokenId, TokenStatus, UsageLogEntry,
    User, UserId, unix_now,
};
pub use tasks::TaskPool;
pub use upstream::UpstreamError;
