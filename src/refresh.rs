//! Single-flight session refresh.
//!
//! However many calls hit a 401 at the same time, at most one refresh-token
//! exchange is in flight per client. The exchange runs on its own task, so
//! a caller that gives up waiting does not cancel it for the others.

use crate::credentials::{CredentialStore, Session};
use crate::{Error, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;

type RefreshFuture = Shared<BoxFuture<'static, Result<Session>>>;

pub(crate) struct RefreshCoordinator {
    credentials: CredentialStore,
    in_flight: Arc<Mutex<Option<RefreshFuture>>>,
}

impl RefreshCoordinator {
    pub(crate) fn new(credentials: CredentialStore) -> Self {
        Self {
            credentials,
            in_flight: Arc::new(Mutex::new(None)),
        }
    }

    /// Returns a fresh session after a 401 seen with `stale_access_token`.
    ///
    /// Joins the in-flight exchange if there is one. If the stored token has
    /// already changed since the failed request was built, that session is
    /// returned without a new exchange. Otherwise `exchange` is called with
    /// the stored refresh token.
    ///
    /// On any failure, including a missing refresh token, the credential
    /// store is cleared and a `SESSION_EXPIRED` error is returned.
    pub(crate) async fn refresh<F, Fut>(
        &self,
        stale_access_token: Option<&str>,
        exchange: F,
    ) -> Result<Session>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<Session>> + Send + 'static,
    {
        let shared = {
            let mut slot = self.in_flight.lock();

            if let Some(in_flight) = slot.as_ref() {
                tracing::debug!("Joining in-flight session refresh");
                in_flight.clone()
            } else {
                let (epoch, current) = self.credentials.snapshot();

                if let Some(session) = &current {
                    if Some(session.access_token.as_str()) != stale_access_token {
                        tracing::debug!("Session already refreshed; reusing stored token");
                        return Ok(session.clone());
                    }
                }

                let Some(refresh_token) = current
                    .map(|session| session.refresh_token)
                    .filter(|token| !token.is_empty())
                else {
                    tracing::warn!("No refresh token available; ending session");
                    self.credentials.clear();
                    return Err(Error::session_expired("No refresh token available"));
                };

                let started = self.start(epoch, exchange(refresh_token));
                *slot = Some(started.clone());
                started
            }
        };

        shared.await
    }

    /// Spawns the exchange and wraps its outcome in a shareable future.
    ///
    /// Must be called with the in-flight slot locked; the spawned task
    /// clears the slot once it finishes. The outcome is only written back if
    /// the store is still at `epoch`: a logout or login during the exchange
    /// wins over the refreshed session.
    fn start<Fut>(&self, epoch: u64, exchange: Fut) -> RefreshFuture
    where
        Fut: Future<Output = Result<Session>> + Send + 'static,
    {
        tracing::info!("Refreshing session");

        let credentials = self.credentials.clone();
        let slot = Arc::clone(&self.in_flight);

        let task = tokio::spawn(async move {
            let outcome = match exchange.await {
                Ok(session) if credentials.set_if_current(epoch, &session) => {
                    tracing::info!("Session refreshed");
                    Ok(session)
                }
                Ok(_) => {
                    tracing::info!("Session changed during refresh; discarding tokens");
                    Err(Error::session_expired("Session ended during refresh"))
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Session refresh failed; ending session");
                    credentials.clear_if_current(epoch);
                    Err(Error::session_expired(format!(
                        "Session refresh failed: {}",
                        e.message()
                    )))
                }
            };
            slot.lock().take();
            outcome
        });

        let credentials = self.credentials.clone();
        let slot = Arc::clone(&self.in_flight);

        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(error = %e, "Session refresh task aborted");
                    credentials.clear_if_current(epoch);
                    slot.lock().take();
                    Err(Error::session_expired("Session refresh aborted"))
                }
            }
        }
        .boxed()
        .shared()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn unexpected_exchange(_refresh_token: String) -> Result<Session> {
        panic!("no exchange expected");
    }

    fn store_with(session: Option<Session>) -> CredentialStore {
        let store = CredentialStore::new(Arc::new(MemoryStorage::new()));
        if let Some(session) = session {
            store.set(&session);
        }
        store
    }

    #[tokio::test]
    async fn concurrent_refreshes_share_one_exchange() {
        let store = store_with(Some(Session::new("old", "r1", 60)));
        let coordinator = Arc::new(RefreshCoordinator::new(store.clone()));
        let exchanges = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coordinator = Arc::clone(&coordinator);
            let exchanges = Arc::clone(&exchanges);
            handles.push(tokio::spawn(async move {
                coordinator
                    .refresh(Some("old"), move |refresh_token| async move {
                        assert_eq!(refresh_token, "r1");
                        exchanges.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(Session::new("new", "r2", 60))
                    })
                    .await
            }));
        }

        for handle in handles {
            let session = handle.await.unwrap().unwrap();
            assert_eq!(session.access_token, "new");
        }
        assert_eq!(exchanges.load(Ordering::SeqCst), 1);
        assert_eq!(store.get().unwrap().refresh_token, "r2");
    }

    #[tokio::test]
    async fn stale_token_reuses_stored_session() {
        let store = store_with(Some(Session::new("already-new", "r2", 60)));
        let coordinator = RefreshCoordinator::new(store);

        let session = coordinator
            .refresh(Some("old"), unexpected_exchange)
            .await
            .unwrap();
        assert_eq!(session.access_token, "already-new");
    }

    #[tokio::test]
    async fn missing_refresh_token_expires_without_exchange() {
        let store = store_with(Some(Session::new("old", "", 60)));
        let coordinator = RefreshCoordinator::new(store.clone());

        let err = coordinator
            .refresh(Some("old"), unexpected_exchange)
            .await
            .unwrap_err();

        assert!(err.is_session_expired());
        assert!(store.get().is_none());
    }

    #[tokio::test]
    async fn failed_exchange_clears_session() {
        let store = store_with(Some(Session::new("old", "r1", 60)));
        let coordinator = RefreshCoordinator::new(store.clone());

        let err = coordinator
            .refresh(Some("old"), |_| async {
                Err(Error::api(
                    Some(http::StatusCode::UNAUTHORIZED),
                    "INVALID_REFRESH_TOKEN",
                    "expired",
                ))
            })
            .await
            .unwrap_err();

        assert!(err.is_session_expired());
        assert!(store.get().is_none());
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_cancel_exchange() {
        let store = store_with(Some(Session::new("old", "r1", 60)));
        let coordinator = Arc::new(RefreshCoordinator::new(store.clone()));

        let first = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .refresh(Some("old"), |_| async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(Session::new("new", "r2", 60))
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        first.abort();

        let session = coordinator
            .refresh(Some("old"), unexpected_exchange)
            .await
            .unwrap();
        assert_eq!(session.access_token, "new");
        assert_eq!(store.get().unwrap().access_token, "new");
    }

    #[tokio::test]
    async fn session_cleared_mid_exchange_is_not_revived() {
        let store = store_with(Some(Session::new("old", "r1", 60)));
        let coordinator = Arc::new(RefreshCoordinator::new(store.clone()));

        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .refresh(Some("old"), |_| async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(Session::new("new", "r2", 60))
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.clear();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.is_session_expired());
        assert!(store.get().is_none());
    }

    #[tokio::test]
    async fn failed_exchange_leaves_a_newer_login_alone() {
        let store = store_with(Some(Session::new("old", "r1", 60)));
        let coordinator = Arc::new(RefreshCoordinator::new(store.clone()));

        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .refresh(Some("old"), |_| async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Err(Error::Network {
                            message: "connection reset".into(),
                        })
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.set(&Session::new("signed-in-again", "r9", 60));

        assert!(waiter.await.unwrap().is_err());
        assert_eq!(store.get().unwrap().access_token, "signed-in-again");
    }
}
