//! Walks through a typical intake session and shows how each error kind
//! surfaces to a caller.
//!
//! Configure with `INTAKE_API_URL` (and optionally `INTAKE_EMAIL` /
//! `INTAKE_PASSWORD`), then run:
//! `cargo run --example intake_session`

use intake_client::{CaseQuery, ClientBuilder, Error, ExportFormat, FileStorage, IntakeApi};
use serde_json::json;
use std::sync::Arc;

/// Maps a classified error to what a screen would show.
fn describe(error: &Error) -> String {
    if error.is_session_expired() {
        return "Your session has ended. Please sign in again.".to_string();
    }
    match error {
        Error::Api {
            status, message, ..
        } => match status {
            Some(status) if status.is_server_error() => {
                "The service is having trouble. Try again later.".to_string()
            }
            _ => message.clone(),
        },
        Error::Network { .. } => "You appear to be offline.".to_string(),
        Error::Timeout { .. } => "The server is taking too long to respond.".to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("intake_client=info")
        .init();

    let storage = FileStorage::new(std::env::temp_dir().join("intake-demo-credentials.json"));
    let client = ClientBuilder::from_env()?
        .credential_storage(Arc::new(storage))
        .build()?;
    let api = IntakeApi::new(client);

    println!("=== Signing in ===");
    let email = std::env::var("INTAKE_EMAIL").unwrap_or_else(|_| "demo@example.org".into());
    let password = std::env::var("INTAKE_PASSWORD").unwrap_or_else(|_| "demo".into());
    match api.login(&email, &password).await {
        Ok(login) => println!("Signed in as {}", login.user.email),
        Err(e) => {
            println!("Sign-in failed: {}", describe(&e));
            return Ok(());
        }
    }
    println!();

    println!("=== Listing cases ===");
    match api.list_cases(&CaseQuery::default()).await {
        Ok(page) => {
            for case in &page.cases {
                println!("  case {} ({})", case.id, case.status.as_deref().unwrap_or("-"));
            }
        }
        Err(e) => println!("  {}", describe(&e)),
    }
    println!();

    println!("=== Submitting a case ===");
    let draft = json!({
        "title": "Water leaking through ceiling",
        "category": "housing",
        "description": "Started after heavy rain on Monday."
    });
    match api.submit_case_idempotent(&draft, "demo-draft-1").await {
        Ok(case) => println!("  created case {}", case.id),
        Err(e) => println!("  {}", describe(&e)),
    }
    println!();

    println!("=== Exporting ===");
    match api.export_cases(ExportFormat::Csv, &CaseQuery::default()).await {
        Ok(export) => println!("  {} {}", export.file_name, export.url.unwrap_or_default()),
        Err(e) => println!("  {}", describe(&e)),
    }
    println!();

    api.logout().await;
    println!("Signed out");

    Ok(())
}
