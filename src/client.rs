//! Request executor.
//!
//! The [`Client`] turns a [`RequestSpec`] into HTTP attempts: it attaches the
//! bearer and CSRF tokens, applies the class timeout, retries transient
//! failures with exponential backoff, recovers a 401 once through the
//! refresh coordinator and classifies whatever is left.

use crate::config::Endpoints;
use crate::credentials::{CredentialStorage, CredentialStore, MemoryStorage, Session};
use crate::csrf::CsrfCache;
use crate::error::BuildError;
use crate::policy::{RetryOnTransient, RetryPolicies, RetryPolicy, RetryPredicate};
use crate::refresh::RefreshCoordinator;
use crate::request::{RequestBody, RequestSpec};
use crate::response::{decode_failure, decode_success};
use crate::{Error, Response, Result};
use http::header::ACCEPT;
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

/// Header carrying the anti-forgery token on mutating requests.
pub const CSRF_HEADER: &str = "X-CSRF-Token";
/// Header carrying the caller's idempotency key.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// An intake API client.
///
/// The client is cheap to clone; clones share the connection pool, the
/// credential store, the CSRF cache and the refresh coordinator.
///
/// # Examples
///
/// ```no_run
/// use intake_client::{Client, RetryPolicy};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = Client::builder()
///     .base_url("https://intake.example.org/api")?
///     .read_policy(RetryPolicy {
///         timeout: Duration::from_secs(10),
///         ..RetryPolicy::reads()
///     })
///     .build()?;
///
/// let cases: intake_client::Response<serde_json::Value> = client.get("/cases").await?;
/// println!("{}", cases.data);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    http_client: reqwest::Client,
    base_url: Url,
    default_headers: HeaderMap,
    policies: RetryPolicies,
    retry_predicate: Box<dyn RetryPredicate>,
    endpoints: Endpoints,
    credentials: CredentialStore,
    csrf: CsrfCache,
    refresh: RefreshCoordinator,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshPayload {
    token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// The credential store this client reads tokens from.
    pub fn credentials(&self) -> &CredentialStore {
        &self.inner.credentials
    }

    /// The currently stored session, if any.
    pub fn session(&self) -> Option<Session> {
        self.inner.credentials.get()
    }

    pub fn is_authenticated(&self) -> bool {
        self.session().is_some()
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.inner.endpoints
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    /// Performs one logical call.
    ///
    /// Transient failures (5xx, network, timeout) are retried within the
    /// request class's policy and never surface mid-retry. A 401 triggers at
    /// most one session refresh; a 401 after that ends the session. Mutating
    /// requests are attempted once unless they carry an idempotency key.
    ///
    /// # Errors
    ///
    /// Returns the final classified [`Error`].
    pub async fn execute<T>(&self, spec: RequestSpec) -> Result<Response<T>>
    where
        T: DeserializeOwned,
    {
        let start_time = Instant::now();
        let class_policy = self.inner.policies.for_class(spec.class());
        let policy = RetryPolicy {
            max_attempts: spec.attempt_cap(class_policy.max_attempts),
            ..class_policy.clone()
        };

        let mut sends = 0;
        let mut failures = 0;
        let mut reauthenticated = false;

        loop {
            let access_token = self.inner.credentials.get().map(|s| s.access_token);
            if spec.requires_session && access_token.is_none() {
                tracing::debug!(path = %spec.path, "No session; failing fast");
                return Err(Error::unauthenticated());
            }

            let csrf_token = if spec.is_mutating() {
                self.csrf_token().await
            } else {
                None
            };

            sends += 1;
            let error = match self
                .attempt::<T>(
                    &spec,
                    policy.timeout,
                    access_token.as_deref(),
                    csrf_token.as_deref(),
                    sends,
                )
                .await
            {
                Ok(mut response) => {
                    response.latency = start_time.elapsed();
                    response.attempts = sends;
                    return Ok(response);
                }
                Err(e) => e,
            };

            if error.is_unauthorized() && spec.recover_auth {
                if reauthenticated {
                    tracing::warn!(
                        method = %spec.method,
                        path = %spec.path,
                        "Still unauthorized after session refresh; ending session"
                    );
                    self.end_session();
                    return Err(Error::session_expired(
                        "Request rejected again after session refresh",
                    ));
                }

                reauthenticated = true;
                if let Err(e) = self.reauthenticate(access_token.as_deref()).await {
                    self.inner.csrf.invalidate();
                    return Err(e);
                }
                continue;
            }

            failures += 1;
            tracing::warn!(
                error = %error,
                attempt = failures,
                method = %spec.method,
                path = %spec.path,
                "Request failed"
            );

            if !self.inner.retry_predicate.should_retry(&error, failures) {
                return Err(error);
            }

            match policy.delay_after(failures, error.is_protocol_failure()) {
                Some(delay) => {
                    tracing::info!(
                        delay_ms = delay.as_millis(),
                        attempt = failures,
                        "Retrying request after delay"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    tracing::error!(
                        attempts = failures,
                        method = %spec.method,
                        path = %spec.path,
                        "Retries exhausted"
                    );
                    return Err(error);
                }
            }
        }
    }

    /// Forces a session refresh, sharing any exchange already in flight.
    ///
    /// # Errors
    ///
    /// Returns a `SESSION_EXPIRED` error, with the session cleared, if the
    /// refresh token is missing or rejected.
    pub async fn refresh_session(&self) -> Result<Session> {
        let current = self.session().map(|s| s.access_token);
        self.reauthenticate(current.as_deref()).await
    }

    /// Stores a newly issued session.
    ///
    /// The CSRF token is dropped with the previous session; the next
    /// mutating call fetches one for the new session.
    pub fn start_session(&self, session: &Session) {
        self.inner.credentials.set(session);
        self.inner.csrf.invalidate();
    }

    /// Clears the stored session and the CSRF token.
    pub fn end_session(&self) {
        self.inner.credentials.clear();
        self.inner.csrf.invalidate();
    }

    async fn reauthenticate(&self, stale_access_token: Option<&str>) -> Result<Session> {
        let client = self.clone();
        self.inner
            .refresh
            .refresh(stale_access_token, move |refresh_token| async move {
                client.exchange_refresh_token(refresh_token).await
            })
            .await
    }

    /// Exchanges a refresh token for a new session in a single attempt.
    ///
    /// Goes straight to [`Client::attempt`] so a 401 here can never trigger
    /// another refresh.
    async fn exchange_refresh_token(&self, refresh_token: String) -> Result<Session> {
        let spec = RequestSpec::post(self.inner.endpoints.refresh.as_str())
            .json(&RefreshRequest {
                refresh_token: &refresh_token,
            })?
            .no_retry()
            .without_auth_recovery();

        let csrf_token = self.csrf_token().await;
        let access_token = self.session().map(|s| s.access_token);
        let timeout = self.inner.policies.write.timeout;

        let payload = self
            .attempt::<RefreshPayload>(
                &spec,
                timeout,
                access_token.as_deref(),
                csrf_token.as_deref(),
                1,
            )
            .await?
            .data;

        Ok(Session {
            access_token: payload.token,
            refresh_token: payload.refresh_token.unwrap_or(refresh_token),
            expires_in_seconds: payload.expires_in,
        })
    }

    async fn csrf_token(&self) -> Option<String> {
        self.inner.csrf.ensure(|| self.fetch_csrf_token()).await
    }

    /// Fetches a token from the CSRF endpoint.
    ///
    /// The body may carry `csrfToken` at the top level or inside the envelope's
    /// `data`; a cookie on the response is picked up by [`Client::attempt`].
    async fn fetch_csrf_token(&self) -> Result<Option<String>> {
        let spec = RequestSpec::get(self.inner.endpoints.csrf.as_str())
            .no_retry()
            .without_auth_recovery();
        let access_token = self.session().map(|s| s.access_token);
        let timeout = self.inner.policies.read.timeout;

        let response = self
            .attempt::<serde_json::Value>(&spec, timeout, access_token.as_deref(), None, 1)
            .await?;

        Ok(response
            .data
            .get("csrfToken")
            .and_then(serde_json::Value::as_str)
            .filter(|token| !token.is_empty())
            .map(str::to_string))
    }

    /// Executes a single attempt: build, send under the deadline, decode.
    async fn attempt<T>(
        &self,
        spec: &RequestSpec,
        timeout: Duration,
        access_token: Option<&str>,
        csrf_token: Option<&str>,
        attempt: usize,
    ) -> Result<Response<T>>
    where
        T: DeserializeOwned,
    {
        let result = self
            .send_and_decode(spec, timeout, access_token, csrf_token, attempt)
            .await;

        if let Err(e) = &result {
            if spec.is_mutating() && e.mentions_csrf() {
                self.inner.csrf.invalidate();
            }
        }

        result
    }

    async fn send_and_decode<T>(
        &self,
        spec: &RequestSpec,
        timeout: Duration,
        access_token: Option<&str>,
        csrf_token: Option<&str>,
        attempt: usize,
    ) -> Result<Response<T>>
    where
        T: DeserializeOwned,
    {
        let url = self.url_for(spec);

        tracing::debug!(
            method = %spec.method,
            url = %url,
            attempt = attempt,
            has_bearer = access_token.is_some(),
            has_csrf = csrf_token.is_some(),
            "Executing HTTP request"
        );

        let mut request = self
            .inner
            .http_client
            .request(spec.method.clone(), url)
            .header(ACCEPT, "application/json");

        for (name, value) in &self.inner.default_headers {
            request = request.header(name, value);
        }

        for (name, value) in &spec.headers {
            request = request.header(name, value);
        }

        if let Some(token) = access_token {
            request = request.bearer_auth(token);
        }

        if let Some(token) = csrf_token {
            request = request.header(CSRF_HEADER, token);
        }

        if let Some(key) = &spec.idempotency_key {
            request = request.header(IDEMPOTENCY_HEADER, key.as_str());
        }

        // Multipart bodies get their boundary content type from reqwest.
        match &spec.body {
            Some(RequestBody::Json(value)) => request = request.json(value),
            Some(body @ RequestBody::Multipart { .. }) => {
                if let Some(form) = body.to_form() {
                    request = request.multipart(form?);
                }
            }
            None => {}
        }

        let started = Instant::now();
        let exchange = async {
            let response = request.send().await?;
            let status = response.status();
            let headers = response.headers().clone();
            let raw_body = response.text().await?;
            Ok::<_, Error>((status, headers, raw_body))
        };

        let (status, headers, raw_body) = match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(
                    method = %spec.method,
                    path = %spec.path,
                    timeout_ms = timeout.as_millis(),
                    "Request deadline exceeded"
                );
                return Err(Error::Timeout {
                    message: format!(
                        "{} {} exceeded {}ms",
                        spec.method,
                        spec.path,
                        timeout.as_millis()
                    ),
                });
            }
        };
        let latency = started.elapsed();

        self.inner.csrf.observe(&headers);

        tracing::info!(
            status = status.as_u16(),
            latency_ms = latency.as_millis(),
            attempt = attempt,
            "Received HTTP response"
        );

        if !status.is_success() {
            if status.is_server_error() {
                tracing::warn!(status = status.as_u16(), "Server error (5xx)");
            } else if status == http::StatusCode::UNAUTHORIZED {
                tracing::warn!(path = %spec.path, "Unauthorized (401)");
            } else {
                tracing::error!(
                    status = status.as_u16(),
                    response = %raw_body,
                    "Client error (4xx)"
                );
            }
            return Err(decode_failure(status, &raw_body));
        }

        let data = decode_success(status, &raw_body)?;
        Ok(Response::new(data, raw_body, status, headers, latency, attempt))
    }

    fn url_for(&self, spec: &RequestSpec) -> Url {
        let mut url = self.inner.base_url.clone();
        let path = format!(
            "{}/{}",
            url.path().trim_end_matches('/'),
            spec.path.trim_start_matches('/')
        );
        url.set_path(&path);
        url.set_query(None);

        if !spec.query_params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &spec.query_params {
                pairs.append_pair(key, value);
            }
        }

        url
    }

    /// Makes a GET request to the specified path.
    pub async fn get<Res>(&self, path: impl Into<String>) -> Result<Response<Res>>
    where
        Res: DeserializeOwned,
    {
        self.execute(RequestSpec::get(path)).await
    }

    /// Makes a POST request with a JSON body. Attempted once.
    pub async fn post<Req, Res>(&self, path: impl Into<String>, body: &Req) -> Result<Response<Res>>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        self.execute(RequestSpec::post(path).json(body)?).await
    }

    /// Makes a PUT request with a JSON body. Attempted once.
    pub async fn put<Req, Res>(&self, path: impl Into<String>, body: &Req) -> Result<Response<Res>>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        self.execute(RequestSpec::put(path).json(body)?).await
    }

    /// Makes a PATCH request with a JSON body. Attempted once.
    pub async fn patch<Req, Res>(
        &self,
        path: impl Into<String>,
        body: &Req,
    ) -> Result<Response<Res>>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        self.execute(RequestSpec::patch(path).json(body)?).await
    }

    /// Makes a DELETE request. Attempted once.
    pub async fn delete<Res>(&self, path: impl Into<String>) -> Result<Response<Res>>
    where
        Res: DeserializeOwned,
    {
        self.execute(RequestSpec::delete(path)).await
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.inner.base_url.as_str())
            .field("policies", &self.inner.policies)
            .finish_non_exhaustive()
    }
}

/// Builder for configuring and creating a [`Client`].
///
/// # Examples
///
/// ```no_run
/// use intake_client::{ClientBuilder, FileStorage};
/// use std::sync::Arc;
///
/// # fn example() -> Result<(), intake_client::BuildError> {
/// let client = ClientBuilder::new()
///     .base_url("https://intake.example.org/api")?
///     .default_header("X-Client", "kiosk/2.1")?
///     .credential_storage(Arc::new(FileStorage::new("/var/lib/kiosk/credentials.json")))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    pub(crate) base_url: Option<Url>,
    default_headers: HeaderMap,
    pub(crate) policies: RetryPolicies,
    retry_predicate: Option<Box<dyn RetryPredicate>>,
    storage: Option<Arc<dyn CredentialStorage>>,
    endpoints: Endpoints,
}

impl ClientBuilder {
    /// Creates a builder with the standard policies and in-memory storage.
    pub fn new() -> Self {
        Self {
            base_url: None,
            default_headers: HeaderMap::new(),
            policies: RetryPolicies::standard(),
            retry_predicate: None,
            storage: None,
            endpoints: Endpoints::default(),
        }
    }

    /// Sets the base URL; request paths are appended to its path.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn base_url(mut self, url: impl AsRef<str>) -> std::result::Result<Self, BuildError> {
        self.base_url = Some(Url::parse(url.as_ref())?);
        Ok(self)
    }

    /// Adds a header sent with every request.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn default_header(
        mut self,
        name: impl AsRef<str>,
        value: impl AsRef<str>,
    ) -> std::result::Result<Self, BuildError> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| BuildError::InvalidHeader(format!("Invalid header name: {e}")))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| BuildError::InvalidHeader(format!("Invalid header value: {e}")))?;
        self.default_headers.insert(name, value);
        Ok(self)
    }

    pub fn read_policy(mut self, policy: RetryPolicy) -> Self {
        self.policies.read = policy;
        self
    }

    pub fn write_policy(mut self, policy: RetryPolicy) -> Self {
        self.policies.write = policy;
        self
    }

    pub fn upload_policy(mut self, policy: RetryPolicy) -> Self {
        self.policies.upload = policy;
        self
    }

    pub fn retry_policies(mut self, policies: RetryPolicies) -> Self {
        self.policies = policies;
        self
    }

    /// Sets a custom retry predicate.
    ///
    /// By default, requests are retried based on `Error::is_retryable()`.
    pub fn retry_predicate(mut self, predicate: Box<dyn RetryPredicate>) -> Self {
        self.retry_predicate = Some(predicate);
        self
    }

    /// Sets the medium tokens are persisted to. Defaults to [`MemoryStorage`].
    pub fn credential_storage(mut self, storage: Arc<dyn CredentialStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Builds the configured `Client`.
    ///
    /// # Errors
    ///
    /// Returns an error if no base URL was provided or the HTTP client
    /// cannot be created.
    pub fn build(self) -> std::result::Result<Client, BuildError> {
        let base_url = self.base_url.ok_or(BuildError::MissingBaseUrl)?;
        let http_client = reqwest::Client::builder().build()?;

        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let credentials = CredentialStore::new(storage);

        let retry_predicate = self
            .retry_predicate
            .unwrap_or_else(|| Box::new(RetryOnTransient));

        Ok(Client {
            inner: Arc::new(ClientInner {
                http_client,
                base_url,
                default_headers: self.default_headers,
                policies: self.policies,
                retry_predicate,
                endpoints: self.endpoints,
                refresh: RefreshCoordinator::new(credentials.clone()),
                credentials,
                csrf: CsrfCache::new(),
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> Client {
        Client::builder().base_url(base).unwrap().build().unwrap()
    }

    #[test]
    fn paths_are_appended_to_the_base_path() {
        let client = client("https://intake.example.org/api/");
        let spec = RequestSpec::get("/cases")
            .with_query_param("page", "2")
            .with_query_param("status", "open");

        assert_eq!(
            client.url_for(&spec).as_str(),
            "https://intake.example.org/api/cases?page=2&status=open"
        );
    }

    #[test]
    fn root_base_url_keeps_single_slash() {
        let client = client("http://localhost:3000");
        assert_eq!(
            client.url_for(&RequestSpec::get("auth/me")).as_str(),
            "http://localhost:3000/auth/me"
        );
    }

    #[test]
    fn build_requires_base_url() {
        assert!(matches!(
            Client::builder().build(),
            Err(BuildError::MissingBaseUrl)
        ));
    }

    #[test]
    fn invalid_default_header_is_rejected() {
        let result = Client::builder().default_header("bad header", "x");
        assert!(matches!(result, Err(BuildError::InvalidHeader(_))));
    }
}
