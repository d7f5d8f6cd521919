//! Error types for intake API calls.
//!
//! Every failure a call can produce is normalized into one of three kinds:
//! the server rejected the request ([`Error::Api`]), the transport failed
//! ([`Error::Network`]), or the deadline passed ([`Error::Timeout`]). Callers
//! branch on the kind and the machine-readable code, never on transport
//! internals.

use http::StatusCode;
use std::error::Error as StdError;

/// The session could not be recovered; the credential store has been cleared.
pub const SESSION_EXPIRED: &str = "SESSION_EXPIRED";
/// The call requires a session and none is stored.
pub const UNAUTHENTICATED: &str = "UNAUTHENTICATED";
/// A 2xx response whose body was not the expected JSON.
pub const MALFORMED_RESPONSE: &str = "MALFORMED_RESPONSE";
/// The request could not be built (bad header, unserializable body, bad path).
pub const INVALID_REQUEST: &str = "INVALID_REQUEST";

/// Transport error fragments that usually resolve on their own after a pause.
const PROTOCOL_FAILURE_SIGNATURES: &[&str] = &[
    "http2",
    "h2 protocol",
    "protocol error",
    "alpn",
    "http_1_1_required",
    "connection reset",
    "broken pipe",
    "unexpected eof",
    "connection closed before message completed",
];

/// A classified failure.
///
/// # Examples
///
/// ```no_run
/// use intake_client::{Client, Error};
///
/// # async fn example(client: Client) {
/// match client.get::<serde_json::Value>("/cases").await {
///     Ok(response) => println!("{:?}", response.data),
///     Err(err) if err.is_session_expired() => println!("please sign in again"),
///     Err(Error::Api { status, code, message, .. }) => {
///         println!("rejected ({status:?}, {code}): {message}")
///     }
///     Err(Error::Network { message }) => println!("offline: {message}"),
///     Err(Error::Timeout { message }) => println!("slow network: {message}"),
/// }
/// # }
/// ```
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// The server (or the client on its behalf) rejected the request.
    ///
    /// `status` is `None` for requests that could not be built. The
    /// session-level codes `UNAUTHENTICATED` and `SESSION_EXPIRED` carry
    /// `401` even when no response was received, so callers can treat every
    /// authentication failure alike.
    #[error("API error {code}: {message}")]
    Api {
        /// HTTP status of the response, or `401` for session-level failures.
        status: Option<StatusCode>,
        /// Machine-readable code from the server envelope, or a derived one.
        code: String,
        /// Human-readable message.
        message: String,
        /// Extra structured details from the server, if any.
        details: Option<serde_json::Value>,
    },

    /// The transport failed: connection refused, DNS, TLS or protocol negotiation.
    #[error("Network error: {message}")]
    Network {
        /// Description including the underlying error chain.
        message: String,
    },

    /// The per-attempt deadline was exceeded.
    #[error("Request timed out: {message}")]
    Timeout {
        /// What timed out.
        message: String,
    },
}

impl Error {
    pub(crate) fn api(
        status: Option<StatusCode>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Api {
            status,
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub(crate) fn session_expired(message: impl Into<String>) -> Self {
        Error::api(Some(StatusCode::UNAUTHORIZED), SESSION_EXPIRED, message)
    }

    pub(crate) fn unauthenticated() -> Self {
        Error::api(
            Some(StatusCode::UNAUTHORIZED),
            UNAUTHENTICATED,
            "No active session",
        )
    }

    pub(crate) fn invalid_request(message: impl Into<String>) -> Self {
        Error::api(None, INVALID_REQUEST, message)
    }

    pub(crate) fn malformed(status: StatusCode, message: impl Into<String>) -> Self {
        Error::api(Some(status), MALFORMED_RESPONSE, message)
    }

    /// Returns `true` for transient failures: 5xx, network errors and timeouts.
    ///
    /// 4xx responses describe a defect in the request and are never retryable.
    ///
    /// ```
    /// use intake_client::Error;
    ///
    /// let err = Error::Timeout { message: "read".into() };
    /// assert!(err.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network { .. } | Error::Timeout { .. } => true,
            Error::Api { status, .. } => status.is_some_and(|s| s.is_server_error()),
        }
    }

    /// Returns the HTTP status; `401` for session-level failures, `None` for
    /// network errors, timeouts and requests that could not be built.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Api { status, .. } => *status,
            _ => None,
        }
    }

    /// Returns the error code for API errors.
    pub fn code(&self) -> Option<&str> {
        match self {
            Error::Api { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Human-readable message for any kind.
    pub fn message(&self) -> &str {
        match self {
            Error::Api { message, .. }
            | Error::Network { message }
            | Error::Timeout { message } => message,
        }
    }

    /// Returns `true` if the session is gone and the caller must sign in again.
    pub fn is_session_expired(&self) -> bool {
        self.code() == Some(SESSION_EXPIRED)
    }

    /// Returns `true` for a 401 answered by the server.
    pub(crate) fn is_unauthorized(&self) -> bool {
        self.status() == Some(StatusCode::UNAUTHORIZED)
    }

    /// Returns `true` for network errors matching a known transient
    /// transport signature, which get a longer backoff window.
    pub fn is_protocol_failure(&self) -> bool {
        match self {
            Error::Network { message } => {
                let message = message.to_ascii_lowercase();
                PROTOCOL_FAILURE_SIGNATURES
                    .iter()
                    .any(|signature| message.contains(signature))
            }
            _ => false,
        }
    }

    /// Returns `true` if the server rejected the request over its CSRF token.
    pub(crate) fn mentions_csrf(&self) -> bool {
        match self {
            Error::Api {
                status: Some(status),
                code,
                message,
                ..
            } if status.is_client_error() => {
                code.to_ascii_lowercase().contains("csrf")
                    || message.to_ascii_lowercase().contains("csrf")
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let message = error_chain(&err);
        if err.is_timeout() {
            Error::Timeout { message }
        } else if err.is_builder() {
            Error::invalid_request(message)
        } else {
            Error::Network { message }
        }
    }
}

/// Flattens an error and its sources into one line.
fn error_chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Code derived from a status when the server did not provide one.
pub(crate) fn default_code(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "BAD_REQUEST",
        401 => "UNAUTHORIZED",
        403 => "FORBIDDEN",
        404 => "NOT_FOUND",
        409 => "CONFLICT",
        413 => "PAYLOAD_TOO_LARGE",
        422 => "VALIDATION_ERROR",
        429 => "RATE_LIMITED",
        500..=599 => "SERVER_ERROR",
        _ => "HTTP_ERROR",
    }
}

/// Errors raised while constructing a [`Client`](crate::Client).
#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    /// No base URL was configured.
    #[error("Base URL is required")]
    MissingBaseUrl,

    /// The base URL could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// A default header name or value was rejected.
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// An environment variable held an unusable value.
    #[error("Invalid value {value:?} for {var}")]
    InvalidEnv {
        /// Variable name.
        var: &'static str,
        /// The offending value.
        value: String,
    },

    /// The underlying HTTP client could not be created.
    #[error("Failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

/// A specialized `Result` type for intake API calls.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_retryable_client_errors_are_not() {
        let server = Error::api(Some(StatusCode::BAD_GATEWAY), "SERVER_ERROR", "down");
        assert!(server.is_retryable());

        for status in [
            StatusCode::BAD_REQUEST,
            StatusCode::FORBIDDEN,
            StatusCode::NOT_FOUND,
        ] {
            let err = Error::api(Some(status), default_code(status), "nope");
            assert!(!err.is_retryable(), "{status} must not be retryable");
        }

        assert!(!Error::unauthenticated().is_retryable());
        assert!(!Error::invalid_request("bad header").is_retryable());
    }

    #[test]
    fn protocol_failures_are_recognized() {
        let err = Error::Network {
            message: "error sending request: http2 error: stream error".into(),
        };
        assert!(err.is_protocol_failure());

        let err = Error::Network {
            message: "dns error: failed to lookup address".into(),
        };
        assert!(!err.is_protocol_failure());

        let err = Error::Timeout {
            message: "http2".into(),
        };
        assert!(!err.is_protocol_failure());
    }

    #[test]
    fn csrf_rejections_are_detected_on_client_errors_only() {
        let err = Error::api(Some(StatusCode::FORBIDDEN), "EBADCSRFTOKEN", "invalid token");
        assert!(err.mentions_csrf());

        let err = Error::api(Some(StatusCode::FORBIDDEN), "FORBIDDEN", "CSRF token missing");
        assert!(err.mentions_csrf());

        let err = Error::api(Some(StatusCode::INTERNAL_SERVER_ERROR), "SERVER_ERROR", "csrf");
        assert!(!err.mentions_csrf());
    }

    #[test]
    fn session_expired_carries_code_and_status() {
        let err = Error::session_expired("refresh rejected");
        assert!(err.is_session_expired());
        assert!(err.is_unauthorized());
        assert_eq!(err.code(), Some(SESSION_EXPIRED));
        assert_eq!(err.message(), "refresh rejected");
        assert_eq!(err.status(), Some(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn unauthenticated_reports_401_without_a_response() {
        let err = Error::unauthenticated();
        assert_eq!(err.code(), Some(UNAUTHENTICATED));
        assert_eq!(err.status(), Some(StatusCode::UNAUTHORIZED));
        assert!(!err.is_retryable());

        assert_eq!(Error::invalid_request("bad header").status(), None);
    }

    #[test]
    fn default_codes_follow_status() {
        assert_eq!(default_code(StatusCode::UNPROCESSABLE_ENTITY), "VALIDATION_ERROR");
        assert_eq!(default_code(StatusCode::SERVICE_UNAVAILABLE), "SERVER_ERROR");
        assert_eq!(default_code(StatusCode::IM_A_TEAPOT), "HTTP_ERROR");
    }
}
