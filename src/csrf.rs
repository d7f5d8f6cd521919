//! Anti-forgery token cache.
//!
//! The token is fetched lazily on the first mutating call and reused until
//! it is invalidated. Tokens may also arrive as a cookie on any response,
//! which populates the cache as a fallback source.

use http::header::SET_COOKIE;
use http::HeaderMap;
use parking_lot::RwLock;
use std::future::Future;

/// Cookie names the server may use to deliver the token.
///
/// Not `_csrf`: csurf keeps its secret in that cookie, not the token it
/// expects back in the header.
const CSRF_COOKIE_NAMES: &[&str] = &["XSRF-TOKEN", "csrf-token", "csrfToken"];

#[derive(Debug, Default)]
pub(crate) struct CsrfCache {
    token: RwLock<Option<String>>,
    fetch_lock: tokio::sync::Mutex<()>,
}

impl CsrfCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn current(&self) -> Option<String> {
        self.token.read().clone()
    }

    /// Returns the cached token, fetching one if the cache is empty.
    ///
    /// Concurrent callers share a single fetch. A failed fetch yields `None`;
    /// the request then proceeds without the header and the server decides.
    pub(crate) async fn ensure<F, Fut>(&self, fetch: F) -> Option<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = crate::Result<Option<String>>>,
    {
        if let Some(token) = self.current() {
            return Some(token);
        }

        let _fetching = self.fetch_lock.lock().await;
        if let Some(token) = self.current() {
            return Some(token);
        }

        match fetch().await {
            Ok(Some(token)) => {
                tracing::debug!("Fetched CSRF token");
                self.store(token.clone());
                Some(token)
            }
            Ok(None) => {
                // The fetch response may still have carried the cookie.
                let token = self.current();
                if token.is_none() {
                    tracing::warn!("CSRF endpoint returned no token; sending without one");
                }
                token
            }
            Err(e) => {
                let token = self.current();
                if token.is_none() {
                    tracing::warn!(
                        error = %e,
                        "CSRF token unavailable; sending without one"
                    );
                }
                token
            }
        }
    }

    pub(crate) fn invalidate(&self) {
        if self.token.write().take().is_some() {
            tracing::debug!("CSRF token invalidated");
        }
    }

    /// Picks up a token delivered as a `Set-Cookie` header.
    pub(crate) fn observe(&self, headers: &HeaderMap) {
        if let Some(token) = token_from_cookies(headers) {
            self.store(token);
        }
    }

    fn store(&self, token: String) {
        *self.token.write() = Some(token);
    }
}

/// Extracts a CSRF token from `Set-Cookie` headers.
pub(crate) fn token_from_cookies(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|cookie| {
            let pair = cookie.split(';').next()?.trim();
            let (name, value) = pair.split_once('=')?;
            let value = value.trim().trim_matches('"');
            (CSRF_COOKIE_NAMES.contains(&name.trim()) && !value.is_empty())
                .then(|| value.to_string())
        })
}
