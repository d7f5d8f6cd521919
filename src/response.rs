//! Response wrapper and envelope decoding.
//!
//! The intake API wraps payloads in `{success, data?, message?, error?, timestamp}`.
//! A `success: false` envelope is a failure even on a 2xx status, and a 2xx
//! body that is not JSON is a `MALFORMED_RESPONSE` error rather than a success.

use crate::error::{default_code, Error};
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;

/// A successful, decoded response.
///
/// # Examples
///
/// ```no_run
/// use intake_client::Client;
///
/// # async fn example(client: Client) -> Result<(), intake_client::Error> {
/// let response = client.get::<serde_json::Value>("/cases").await?;
///
/// println!("Cases: {}", response.data);
/// println!("Took {:?} over {} attempt(s)", response.latency, response.attempts);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Response<T> {
    /// The decoded payload (the envelope's `data`, or the whole body for
    /// endpoints that do not use the envelope).
    pub data: T,

    /// The raw response body.
    pub raw_body: String,

    /// The HTTP status code of the response.
    pub status: StatusCode,

    /// The response headers.
    pub headers: HeaderMap,

    /// Time from the first attempt until this response, including backoff.
    pub latency: Duration,

    /// Number of HTTP requests made for this call, including any replay
    /// after a session refresh.
    pub attempts: usize,
}

impl<T> Response<T> {
    pub fn new(
        data: T,
        raw_body: String,
        status: StatusCode,
        headers: HeaderMap,
        latency: Duration,
        attempts: usize,
    ) -> Self {
        Self {
            data,
            raw_body,
            status,
            headers,
            latency,
            attempts,
        }
    }

    /// Maps the payload, keeping the metadata.
    ///
    /// ```
    /// # use intake_client::Response;
    /// # use http::{HeaderMap, StatusCode};
    /// # use std::time::Duration;
    /// let response = Response::new(
    ///     42,
    ///     "42".to_string(),
    ///     StatusCode::OK,
    ///     HeaderMap::new(),
    ///     Duration::from_millis(100),
    ///     1,
    /// );
    ///
    /// assert_eq!(response.map(|n| n.to_string()).data, "42");
    /// ```
    pub fn map<U, F>(self, f: F) -> Response<U>
    where
        F: FnOnce(T) -> U,
    {
        Response {
            data: f(self.data),
            raw_body: self.raw_body,
            status: self.status,
            headers: self.headers,
            latency: self.latency,
            attempts: self.attempts,
        }
    }

    /// Returns `true` if more than one request was needed.
    pub fn was_retried(&self) -> bool {
        self.attempts > 1
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }
}

impl<T> AsRef<T> for Response<T> {
    fn as_ref(&self) -> &T {
        &self.data
    }
}

impl<T> std::ops::Deref for Response<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

/// Decodes a 2xx body into the payload type.
pub(crate) fn decode_success<T>(status: StatusCode, raw_body: &str) -> crate::Result<T>
where
    T: DeserializeOwned,
{
    let body: Value = serde_json::from_str(raw_body).map_err(|e| {
        tracing::error!(
            error = %e,
            status = status.as_u16(),
            "Received non-JSON success body"
        );
        Error::malformed(status, format!("Response is not valid JSON: {e}"))
    })?;

    let payload = match body {
        Value::Object(mut envelope) if envelope.contains_key("success") => {
            if envelope.get("success") != Some(&Value::Bool(true)) {
                return Err(envelope_error(status, &Value::Object(envelope)));
            }
            envelope.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    };

    serde_json::from_value(payload).map_err(|e| {
        tracing::error!(error = %e, "Failed to decode response payload");
        Error::malformed(status, format!("Unexpected response shape: {e}"))
    })
}

/// Classifies a non-2xx response.
pub(crate) fn decode_failure(status: StatusCode, raw_body: &str) -> Error {
    match serde_json::from_str::<Value>(raw_body) {
        Ok(body @ Value::Object(_)) => envelope_error(status, &body),
        _ => Error::Api {
            status: Some(status),
            code: default_code(status).to_string(),
            message: fallback_message(status, raw_body),
            details: None,
        },
    }
}

/// Builds an API error from an envelope.
///
/// `error` may be a code string or an object with `code`, `message` and
/// `details`; anything else in the envelope is kept as details.
fn envelope_error(status: StatusCode, body: &Value) -> Error {
    let error = body.get("error");

    let code = error
        .and_then(|e| e.as_str().or_else(|| e.get("code").and_then(Value::as_str)))
        .or_else(|| body.get("code").and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| default_code(status).to_string());

    let message = body
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| error.and_then(|e| e.get("message")).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| fallback_message(status, ""));

    let details = error
        .and_then(|e| e.get("details"))
        .or_else(|| body.get("details"))
        .or_else(|| body.get("errors"))
        .cloned();

    Error::Api {
        status: Some(status),
        code,
        message,
        details,
    }
}

fn fallback_message(status: StatusCode, raw_body: &str) -> String {
    let trimmed = raw_body.trim();
    if !trimmed.is_empty() {
        return trimmed.to_string();
    }
    status
        .canonical_reason()
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()))
}
