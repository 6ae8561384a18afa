use std::sync::Arc;

use relaymeter_core::{LogKind, UsageLogEntry};

use crate::error::StoreError;
use crate::store::UsageLogSink;

/// Writes usage log entries to the configured sink
///
/// Consume entries are skipped when consume logging is turned off; test
/// entries are always written.
#[derive(Clone)]
pub struct UsageLogRecorder {
    sink: Arc<dyn UsageLogSink>,
    consume_log_enabled: bool,
}

impl UsageLogRecorder {
    pub fn new(sink: Arc<dyn UsageLogSink>, consume_log_enabled: bool) -> Self {
        Self {
            sink,
            consume_log_enabled,
        }
    }

    /// Append one entry
    pub async fn record(&self, entry: UsageLogEntry) -> Result<(), StoreError> {
        if entry.kind == LogKind::Consume && !self.consume_log_enabled {
            tracing::trace!(request_id = %entry.request_id, "consume log disabled, skipping entry");
            return Ok(());
        }

        let request_id = entry.request_id.clone();
        let quota = entry.quota;
        self.sink.append(entry).await.inspect_err(|e| {
            tracing::warn!(
                error = %e,
                request_id = %request_id,
                quota,
                "failed to record usage log entry"
            );
        })
    }

    pub fn sink(&self) -> &Arc<dyn UsageLogSink> {
        &self.sink
    }
}

impl std::fmt::Debug for UsageLogRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageLogRecorder")
            .field("consume_log_enabled", &self.consume_log_enabled)
            .finish_non_exhaustive()
    }
}
