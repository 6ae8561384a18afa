use relaymeter_ledger::StoreError;

/// Errors returned by the health monitor
#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    /// Another sweep has not finished yet
    #[error("a channel sweep is already running")]
    SweepInProgress,

    #[error("invalid health configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
