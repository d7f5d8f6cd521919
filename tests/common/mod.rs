//! Shared helpers for the integration tests.

#![allow(dead_code)]

use intake_client::{Client, RetryPolicies, RetryPolicy, Session};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "intake_client=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Policies with millisecond backoff so retry tests stay fast.
pub fn fast_policies() -> RetryPolicies {
    RetryPolicies {
        read: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            timeout: Duration::from_secs(2),
            ..RetryPolicy::reads()
        },
        write: RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(10),
            timeout: Duration::from_secs(2),
            ..RetryPolicy::writes()
        },
        upload: RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(10),
            timeout: Duration::from_secs(5),
            ..RetryPolicy::uploads()
        },
    }
}

pub fn client_for(server: &MockServer) -> Client {
    init_tracing();
    Client::builder()
        .base_url(server.uri())
        .unwrap()
        .retry_policies(fast_policies())
        .build()
        .unwrap()
}

pub fn sign_in(client: &Client, access_token: &str, refresh_token: &str) {
    client
        .credentials()
        .set(&Session::new(access_token, refresh_token, 900));
}

/// A `{success: true, data}` envelope.
pub fn envelope(status: u16, data: Value) -> ResponseTemplate {
    ResponseTemplate::new(status).set_body_json(json!({
        "success": true,
        "data": data,
        "timestamp": "2024-05-01T12:00:00.000Z"
    }))
}

pub fn unauthorized() -> ResponseTemplate {
    ResponseTemplate::new(401).set_body_json(json!({
        "success": false,
        "message": "Token expired",
        "error": "TOKEN_EXPIRED"
    }))
}

pub async fn mount_csrf(server: &MockServer, token: &str) {
    Mock::given(method("GET"))
        .and(path("/csrf-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "csrfToken": token })))
        .mount(server)
        .await;
}

/// Mounts a CSRF endpoint that issues `t0`, `t1`, ... on successive fetches.
pub async fn mount_rotating_csrf(server: &MockServer, expected_fetches: u64) {
    let issued = AtomicUsize::new(0);
    Mock::given(method("GET"))
        .and(path("/csrf-token"))
        .respond_with(move |_req: &wiremock::Request| {
            let n = issued.fetch_add(1, Ordering::SeqCst);
            ResponseTemplate::new(200).set_body_json(json!({ "csrfToken": format!("t{n}") }))
        })
        .expect(expected_fetches)
        .mount(server)
        .await;
}
