//! Upstream failure classification
//!
//! Only failures that will not heal without operator action are fatal. Rate
//! limits, timeouts and 5xx responses are neutral: they neither disable nor
//! enable a channel. Message text is only consulted for 4xx responses other
//! than 429.

use relaymeter_core::UpstreamError;

/// Class of an upstream failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Auth failure, upstream quota exhausted or unknown model; carries the disable reason
    Fatal(String),
    /// Transient or unknown failure
    Neutral,
}

const FATAL_KINDS: &[&str] = &[
    "insufficient_quota",
    "authentication_error",
    "permission_error",
    "forbidden",
];

const FATAL_CODES: &[&str] = &["invalid_api_key", "account_deactivated", "model_not_found"];

const FATAL_MESSAGES: &[&str] = &[
    "your credit balance is too low",
    "insufficient account balance",
    "permission denied",
    "your access was terminated",
    "violation of our policy",
    "organization has been disabled",
    "organization has been restricted",
    "api key not valid",
    "api key expired",
];

pub fn classify(error: &UpstreamError) -> Outcome {
    if is_fatal(error) {
        Outcome::Fatal(reason(error))
    } else {
        Outcome::Neutral
    }
}

fn is_fatal(error: &UpstreamError) -> bool {
    if matches!(error.status, Some(401 | 403)) {
        return true;
    }
    if error.kind.as_deref().is_some_and(|kind| FATAL_KINDS.contains(&kind)) {
        return true;
    }
    if error.code.as_deref().is_some_and(|code| FATAL_CODES.contains(&code)) {
        return true;
    }

    let Some(status) = error.status else {
        return false;
    };
    if status == 429 || !(400..500).contains(&status) {
        return false;
    }

    let message = error.message.to_lowercase();
    if status == 404 && message.contains("model") {
        return true;
    }
    FATAL_MESSAGES.iter().any(|needle| message.contains(needle))
}

fn reason(error: &UpstreamError) -> String {
    let text = error.to_string();
    if !text.is_empty() {
        return text;
    }
    error
        .code
        .clone()
        .or_else(|| error.kind.clone())
        .unwrap_or_else(|| "channel fatal error".to_owned())
}
