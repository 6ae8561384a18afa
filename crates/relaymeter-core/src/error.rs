use http::StatusCode;
use serde::Serialize;

/// Trait for domain errors that can be converted to HTTP responses
///
/// Implemented by each caller-facing error type. The front controller
/// renders these through [`ErrorBody`], keeping domain errors decoupled
/// from any web framework.
pub trait HttpError: std::error::Error {
    /// HTTP status code for this error
    fn status_code(&self) -> StatusCode;

    /// Stable machine-readable error code (e.g. `insufficient_user_quota`)
    fn error_type(&self) -> &str;

    /// Message safe to expose to API consumers
    fn client_message(&self) -> String;
}

/// Wire shape of every caller-visible failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub code: String,
}

impl ErrorBody {
    /// Build the response body for a domain error
    pub fn from_error(error: &dyn HttpError) -> Self {
        Self {
            error: ErrorDetail {
                message: error.client_message(),
                kind: error_class(error.status_code()).to_owned(),
                code: error.error_type().to_owned(),
            },
        }
    }
}

/// Coarse error family derived from the status code
fn error_class(status: StatusCode) -> &'static str {
    if status.is_server_error() {
        "upstream_error"
    } else {
        "relay_error"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Dummy;

    impl std::error::Error for Dummy {}

    impl std::fmt::Display for Dummy {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("secret details")
        }
    }

    impl HttpError for Dummy {
        fn status_code(&self) -> StatusCode {
            StatusCode::BAD_GATEWAY
        }

        fn error_type(&self) -> &str {
            "do_request_failed"
        }

        fn client_message(&self) -> String {
            "upstream request failed".to_owned()
        }
    }

    #[test]
    fn body_uses_client_message_and_code() {
        let body = ErrorBody::from_error(&Dummy);
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["error"]["message"], "upstream request failed");
        assert_eq!(json["error"]["code"], "do_request_failed");
        assert_eq!(json["error"]["type"], "upstream_error");
    }
}
