//! Endpoint paths and environment-driven configuration.

use crate::client::ClientBuilder;
use crate::error::BuildError;
use std::time::Duration;

pub const ENV_BASE_URL: &str = "INTAKE_API_URL";
pub const ENV_READ_TIMEOUT_MS: &str = "INTAKE_API_READ_TIMEOUT_MS";
pub const ENV_WRITE_TIMEOUT_MS: &str = "INTAKE_API_WRITE_TIMEOUT_MS";
pub const ENV_UPLOAD_TIMEOUT_MS: &str = "INTAKE_API_UPLOAD_TIMEOUT_MS";
pub const ENV_MAX_ATTEMPTS: &str = "INTAKE_API_MAX_ATTEMPTS";
pub const ENV_BACKOFF_MS: &str = "INTAKE_API_BACKOFF_MS";

/// Paths of the session endpoints, relative to the base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub csrf: String,
    pub login: String,
    pub refresh: String,
    pub logout: String,
    pub current_user: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            csrf: "/csrf-token".to_string(),
            login: "/auth/login".to_string(),
            refresh: "/auth/refresh".to_string(),
            logout: "/auth/logout".to_string(),
            current_user: "/auth/me".to_string(),
        }
    }
}

impl ClientBuilder {
    /// Creates a builder from `INTAKE_API_*` environment variables.
    ///
    /// `INTAKE_API_URL` is required. The timeouts override the per-class
    /// defaults; `INTAKE_API_MAX_ATTEMPTS` and `INTAKE_API_BACKOFF_MS` apply
    /// to reads only, since write retries depend on idempotency keys.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::MissingBaseUrl`] if the URL is unset, or
    /// [`BuildError::InvalidEnv`] for values that do not parse.
    pub fn from_env() -> Result<Self, BuildError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, BuildError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let base_url = lookup(ENV_BASE_URL).ok_or(BuildError::MissingBaseUrl)?;
        let mut builder = Self::new().base_url(base_url.trim())?;

        if let Some(timeout) = millis(&lookup, ENV_READ_TIMEOUT_MS)? {
            builder.policies.read.timeout = timeout;
        }
        if let Some(timeout) = millis(&lookup, ENV_WRITE_TIMEOUT_MS)? {
            builder.policies.write.timeout = timeout;
        }
        if let Some(timeout) = millis(&lookup, ENV_UPLOAD_TIMEOUT_MS)? {
            builder.policies.upload.timeout = timeout;
        }
        if let Some(attempts) = number(&lookup, ENV_MAX_ATTEMPTS)? {
            if attempts == 0 {
                return Err(BuildError::InvalidEnv {
                    var: ENV_MAX_ATTEMPTS,
                    value: attempts.to_string(),
                });
            }
            builder.policies.read.max_attempts = attempts as usize;
        }
        if let Some(delay) = millis(&lookup, ENV_BACKOFF_MS)? {
            builder.policies.read.base_delay = delay;
        }

        tracing::debug!(base_url = %base_url, "Loaded client configuration from environment");
        Ok(builder)
    }
}

fn number<F>(lookup: &F, var: &'static str) -> Result<Option<u64>, BuildError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| BuildError::InvalidEnv { var, value }),
    }
}

fn millis<F>(lookup: &F, var: &'static str) -> Result<Option<Duration>, BuildError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(number(lookup, var)?.map(Duration::from_millis))
}
