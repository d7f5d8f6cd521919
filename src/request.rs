//! Request descriptions.
//!
//! A [`RequestSpec`] describes one logical call. It is never mutated by the
//! executor; every attempt builds a fresh HTTP request from it.

use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::Serialize;

/// The retry/timeout class a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// Safe, idempotent reads (`GET`, `HEAD`, `OPTIONS`).
    Read,
    /// JSON writes.
    Write,
    /// Multipart uploads.
    Upload,
}

/// One file in a multipart body.
#[derive(Debug, Clone)]
pub struct FilePart {
    pub field: String,
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl FilePart {
    pub fn new(
        field: impl Into<String>,
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            field: field.into(),
            file_name: file_name.into(),
            content_type: content_type.into(),
            bytes: bytes.into(),
        }
    }
}

/// A request body.
///
/// Multipart forms are kept as plain data so they can be rebuilt for each
/// attempt.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Json(serde_json::Value),
    Multipart {
        fields: Vec<(String, String)>,
        files: Vec<FilePart>,
    },
}

impl RequestBody {
    pub(crate) fn to_form(&self) -> Option<crate::Result<reqwest::multipart::Form>> {
        let RequestBody::Multipart { fields, files } = self else {
            return None;
        };

        let mut form = reqwest::multipart::Form::new();
        for (name, value) in fields {
            form = form.text(name.clone(), value.clone());
        }
        for file in files {
            let part = reqwest::multipart::Part::bytes(file.bytes.clone())
                .file_name(file.file_name.clone())
                .mime_str(&file.content_type);
            match part {
                Ok(part) => form = form.part(file.field.clone(), part),
                Err(e) => return Some(Err(crate::Error::from(e))),
            }
        }
        Some(Ok(form))
    }
}

/// Everything needed to perform one logical call.
///
/// # Examples
///
/// ```
/// use intake_client::RequestSpec;
/// use serde_json::json;
///
/// let spec = RequestSpec::post("/cases")
///     .json(&json!({"title": "Broken heater"}))
///     .unwrap()
///     .with_idempotency_key("case-draft-42")
///     .requiring_session();
///
/// assert!(spec.is_mutating());
/// ```
#[derive(Debug, Clone)]
pub struct RequestSpec {
    /// The HTTP method.
    pub method: Method,

    /// The request path, relative to the client's base URL.
    pub path: String,

    /// Query parameters, in insertion order.
    pub query_params: Vec<(String, String)>,

    /// Additional headers for this request.
    pub headers: HeaderMap,

    /// Optional body.
    pub body: Option<RequestBody>,

    /// Caller-provided idempotency signal; unlocks retries for mutating verbs.
    pub idempotency_key: Option<String>,

    /// Fail fast with `UNAUTHENTICATED` when no session is stored.
    pub requires_session: bool,

    /// Recover a 401 through the refresh coordinator.
    pub recover_auth: bool,

    /// Overrides the policy's attempt cap.
    pub max_attempts: Option<usize>,
}

impl RequestSpec {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query_params: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
            idempotency_key: None,
            requires_session: false,
            recover_auth: true,
            max_attempts: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Sets a JSON body.
    ///
    /// # Errors
    ///
    /// Returns an `INVALID_REQUEST` API error if the body cannot be serialized.
    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> crate::Result<Self> {
        let value = serde_json::to_value(body).map_err(|e| {
            crate::Error::invalid_request(format!("Failed to serialize request: {e}"))
        })?;
        self.body = Some(RequestBody::Json(value));
        Ok(self)
    }

    /// Sets a multipart body.
    pub fn multipart(mut self, fields: Vec<(String, String)>, files: Vec<FilePart>) -> Self {
        self.body = Some(RequestBody::Multipart { fields, files });
        self
    }

    /// Adds a header to the request.
    ///
    /// # Errors
    ///
    /// Returns an `INVALID_REQUEST` API error if the header name or value is invalid.
    pub fn with_header(
        mut self,
        name: impl AsRef<str>,
        value: impl AsRef<str>,
    ) -> crate::Result<Self> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| crate::Error::invalid_request(format!("Invalid header name: {e}")))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| crate::Error::invalid_request(format!("Invalid header value: {e}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Adds a query parameter to the request.
    pub fn with_query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.push((key.into(), value.into()));
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn requiring_session(mut self) -> Self {
        self.requires_session = true;
        self
    }

    /// Disables 401 recovery; a 401 is returned to the caller as-is.
    pub fn without_auth_recovery(mut self) -> Self {
        self.recover_auth = false;
        self
    }

    /// Limits the call to a single attempt.
    pub fn no_retry(mut self) -> Self {
        self.max_attempts = Some(1);
        self
    }

    /// Returns `true` for state-changing verbs.
    pub fn is_mutating(&self) -> bool {
        !matches!(self.method, Method::GET | Method::HEAD | Method::OPTIONS)
    }

    pub fn class(&self) -> RequestClass {
        match (&self.body, self.is_mutating()) {
            (Some(RequestBody::Multipart { .. }), _) => RequestClass::Upload,
            (_, true) => RequestClass::Write,
            (_, false) => RequestClass::Read,
        }
    }

    /// Attempt cap for this request under `policy_attempts`.
    ///
    /// Mutating requests without an idempotency key get exactly one attempt,
    /// since a failed POST may already have taken effect server-side.
    pub(crate) fn attempt_cap(&self, policy_attempts: usize) -> usize {
        let cap = match self.max_attempts {
            Some(explicit) => explicit,
            None if self.is_mutating() && self.idempotency_key.is_none() => 1,
            None => policy_attempts,
        };
        cap.max(1)
    }
}
