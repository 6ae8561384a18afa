use http::StatusCode;
use relaymeter_core::{HttpError, Quota, TokenId, TokenStatus};
use uuid::Uuid;

/// Failures of the durable quota store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Row does not exist
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity kind, e.g. `token`
        entity: &'static str,
        id: i64,
    },

    /// Redis command or connection failure
    #[error("redis error: {0}")]
    Redis(String),

    /// Stored row could not be decoded
    #[error("failed to decode {entity}: {message}")]
    Decode {
        entity: &'static str,
        message: String,
    },
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        Self::Redis(e.to_string())
    }
}

/// Errors returned by ledger operations
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Token id is unknown
    #[error("token {0} not found")]
    TokenNotFound(TokenId),

    /// Token is disabled, expired or exhausted
    #[error("token '{name}' is {status}")]
    TokenUnusable {
        name: String,
        status: TokenStatus,
    },

    /// Token is restricted to other models
    #[error("token '{name}' is not allowed to use model '{model}'")]
    ModelNotAllowed { name: String, model: String },

    /// Token remaining quota below the requested reservation
    #[error("insufficient token quota: remaining {remaining}, requested {requested}")]
    InsufficientTokenQuota { remaining: Quota, requested: Quota },

    /// User balance below the requested reservation
    #[error("insufficient user quota: balance {balance}, requested {requested}")]
    InsufficientUserQuota { balance: Quota, requested: Quota },

    /// Negative reservation amount
    #[error("quota amount must not be negative, got {0}")]
    InvalidAmount(Quota),

    /// Reservation already committed or refunded
    #[error("reservation {0} is already settled")]
    ReservationSettled(Uuid),

    /// Invalid ledger settings
    #[error("ledger configuration error: {0}")]
    Config(String),

    /// Durable store failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl HttpError for LedgerError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::TokenNotFound(_) => StatusCode::UNAUTHORIZED,
            Self::TokenUnusable { .. }
            | Self::ModelNotAllowed { .. }
            | Self::InsufficientTokenQuota { .. }
            | Self::InsufficientUserQuota { .. } => StatusCode::FORBIDDEN,
            Self::InvalidAmount(_) => StatusCode::BAD_REQUEST,
            Self::ReservationSettled(_) => StatusCode::CONFLICT,
            Self::Config(_) | Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &str {
        match self {
            Self::TokenNotFound(_) => "invalid_token",
            Self::TokenUnusable { .. } => "token_unusable",
            Self::ModelNotAllowed { .. } => "model_not_allowed",
            Self::InsufficientTokenQuota { .. } => "insufficient_token_quota",
            Self::InsufficientUserQuota { .. } => "insufficient_user_quota",
            Self::InvalidAmount(_) => "invalid_amount",
            Self::ReservationSettled(_) => "reservation_settled",
            Self::Config(_) | Self::Store(_) => "ledger_unavailable",
        }
    }

    fn client_message(&self) -> String {
        match self {
            Self::TokenNotFound(_) => "invalid token".to_owned(),
            Self::TokenUnusable { name, status } => match status {
                TokenStatus::Exhausted => format!("token '{name}' quota has been exhausted"),
                TokenStatus::Expired => format!("token '{name}' has expired"),
                TokenStatus::Disabled | TokenStatus::Enabled => format!("token '{name}' is not available"),
            },
            Self::InsufficientTokenQuota { .. } => "insufficient token quota".to_owned(),
            Self::InsufficientUserQuota { .. } => "insufficient user quota".to_owned(),
            Self::ModelNotAllowed { .. } | Self::InvalidAmount(_) | Self::ReservationSettled(_) => self.to_string(),
            Self::Config(_) | Self::Store(_) => "quota service temporarily unavailable".to_owned(),
        }
    }
}

/// Failure to deliver a low-balance reminder
#[derive(Debug, thiserror::Error)]
#[error("quota notification failed: {0}")]
pub struct NotifyError(pub String);
