use http::StatusCode;
use relaymeter_core::{ChannelId, HttpError, UpstreamError};
use relaymeter_ledger::{LedgerError, StoreError};

/// Failures raised by an adaptor before anything is sent
#[derive(Debug, thiserror::Error)]
pub enum AdaptorError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors surfaced by the relay pipeline
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Reservation or token checks failed; nothing was dispatched
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("channel {0} not found")]
    ChannelNotFound(ChannelId),

    #[error("channel {0} is disabled")]
    ChannelDisabled(ChannelId),

    /// No adaptor registered for the channel type
    #[error("no adaptor for channel type '{0}'")]
    NoAdaptor(String),

    #[error("failed to convert request: {0}")]
    ConvertRequest(#[from] AdaptorError),

    /// Backend call failed after the reservation; the reservation was refunded
    #[error("upstream request failed: {0}")]
    Upstream(UpstreamError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid relay configuration: {0}")]
    Config(String),
}

impl HttpError for RelayError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Ledger(e) => e.status_code(),
            Self::ChannelNotFound(_) => StatusCode::NOT_FOUND,
            Self::ChannelDisabled(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::ConvertRequest(AdaptorError::InvalidRequest(_)) => StatusCode::BAD_REQUEST,
            Self::NoAdaptor(_) | Self::ConvertRequest(_) | Self::Store(_) | Self::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_type(&self) -> &str {
        match self {
            Self::Ledger(e) => e.error_type(),
            Self::ChannelNotFound(_) => "channel_not_found",
            Self::ChannelDisabled(_) => "channel_disabled",
            Self::NoAdaptor(_) => "invalid_channel_type",
            Self::ConvertRequest(_) => "convert_request_failed",
            Self::Upstream(_) => "do_request_failed",
            Self::Store(_) | Self::Config(_) => "relay_unavailable",
        }
    }

    fn client_message(&self) -> String {
        match self {
            Self::Ledger(e) => e.client_message(),
            Self::Upstream(_) => "upstream request failed".to_owned(),
            Self::Store(_) | Self::Config(_) => "the relay is temporarily unavailable".to_owned(),
            other => other.to_string(),
        }
    }
}
