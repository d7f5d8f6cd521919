//! # intake-client - resilient API client for case-intake services
//!
//! Every network call of an intake application goes through one [`Client`].
//! It attaches the bearer token and, for mutating calls, the anti-forgery
//! token; refreshes an expired session exactly once no matter how many calls
//! notice the expiry at the same time; retries transient failures with
//! exponential backoff; and hands callers a closed set of error kinds.
//!
//! ## Quick Start
//!
//! ```no_run
//! use intake_client::{Client, IntakeApi, CaseQuery};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .base_url("https://intake.example.org/api")?
//!         .build()?;
//!     let api = IntakeApi::new(client);
//!
//!     let login = api.login("officer@example.org", "hunter2").await?;
//!     println!("Signed in as {}", login.user.email);
//!
//!     let page = api.list_cases(&CaseQuery::default()).await?;
//!     println!("{} open cases", page.cases.len());
//!
//!     let case = api.submit_case(&json!({"title": "Flooded basement"})).await?;
//!     println!("Created case {}", case.id);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Failure handling
//!
//! | Failure                         | Behavior                                         |
//! |---------------------------------|--------------------------------------------------|
//! | 5xx, network error, timeout     | retried within the class policy, then returned   |
//! | 401                             | one shared session refresh, then one replay      |
//! | 401 after refresh / bad refresh | session cleared, `SESSION_EXPIRED` returned      |
//! | other 4xx                       | returned immediately, never retried              |
//! | non-JSON 2xx, `success: false`  | returned as an API error                         |
//!
//! Mutating calls are attempted once unless the caller supplies an
//! idempotency key; a POST that timed out may already have been applied.
//!
//! ```no_run
//! use intake_client::{Client, Error};
//!
//! # async fn example(client: Client) {
//! match client.get::<serde_json::Value>("/cases").await {
//!     Ok(response) => println!("{}", response.data),
//!     Err(err) if err.is_session_expired() => println!("redirecting to sign-in"),
//!     Err(Error::Api { message, .. }) => println!("{message}"),
//!     Err(Error::Network { .. }) => println!("You appear to be offline"),
//!     Err(Error::Timeout { .. }) => println!("The server is taking too long"),
//! }
//! # }
//! ```

pub mod api;
mod client;
pub mod config;
pub mod credentials;
mod csrf;
pub mod error;
pub mod policy;
mod refresh;
pub mod request;
mod response;

pub use api::{CaseQuery, ExportFormat, IntakeApi};
pub use client::{Client, ClientBuilder, CSRF_HEADER, IDEMPOTENCY_HEADER};
pub use config::Endpoints;
pub use credentials::{CredentialStorage, CredentialStore, FileStorage, MemoryStorage, Session};
pub use error::{BuildError, Error, Result};
pub use policy::{RetryPolicies, RetryPolicy, RetryPredicate};
pub use request::{FilePart, RequestSpec};
pub use response::Response;
