//! Normalized description of a failed backend call
//!
//! Adaptors and the relay reduce every upstream failure to an
//! [`UpstreamError`]; the health monitor classifies it.

use std::fmt;

use serde::Deserialize;

/// A failure reported by, or on the way to, a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamError {
    /// HTTP status from the backend, `None` for transport failures
    pub status: Option<u16>,
    /// Provider error type, e.g. `insufficient_quota`
    pub kind: Option<String>,
    /// Provider error code, e.g. `invalid_api_key`
    pub code: Option<String>,
    pub message: String,
}

#[derive(Deserialize)]
struct WireEnvelope {
    error: WireError,
}

#[derive(Deserialize)]
struct WireError {
    #[serde(default)]
    message: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

impl UpstreamError {
    /// Failure before any response was received
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            kind: None,
            code: None,
            message: message.into(),
        }
    }

    /// Build from a non-success response, parsing an `OpenAI`-style error body when present
    pub fn from_response(status: u16, body: &[u8]) -> Self {
        match serde_json::from_slice::<WireEnvelope>(body) {
            Ok(envelope) => Self {
                status: Some(status),
                kind: envelope.error.kind.filter(|k| !k.is_empty()),
                code: envelope.error.code.and_then(|code| match code {
                    serde_json::Value::String(s) if !s.is_empty() => Some(s),
                    serde_json::Value::Number(n) => Some(n.to_string()),
                    _ => None,
                }),
                message: envelope.error.message,
            },
            Err(_) => Self {
                status: Some(status),
                kind: None,
                code: None,
                message: String::from_utf8_lossy(body).trim().to_owned(),
            },
        }
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) if self.message.is_empty() => write!(f, "http status code: {status}"),
            Some(status) => write!(f, "http status code: {status}, error message: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for UpstreamError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_openai_error_body() {
        let body = br#"{"error":{"message":"Incorrect API key provided","type":"invalid_request_error","code":"invalid_api_key"}}"#;
        let error = UpstreamError::from_response(401, body);

        assert_eq!(error.status, Some(401));
        assert_eq!(error.kind.as_deref(), Some("invalid_request_error"));
        assert_eq!(error.code.as_deref(), Some("invalid_api_key"));
        assert_eq!(error.message, "Incorrect API key provided");
    }

    #[test]
    fn numeric_codes_become_strings() {
        let body = br#"{"error":{"message":"busy","code":1302}}"#;
        let error = UpstreamError::from_response(429, body);
        assert_eq!(error.code.as_deref(), Some("1302"));
        assert_eq!(error.kind, None);
    }

    #[test]
    fn non_json_body_is_kept_as_message() {
        let error = UpstreamError::from_response(502, b" Bad Gateway\n");
        assert_eq!(error.message, "Bad Gateway");
        assert_eq!(error.to_string(), "http status code: 502, error message: Bad Gateway");
    }

    #[test]
    fn transport_errors_have_no_status() {
        let error = UpstreamError::transport("connection refused");
        assert_eq!(error.status, None);
        assert_eq!(error.to_string(), "connection refused");
    }
}
