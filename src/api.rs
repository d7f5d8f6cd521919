//! Typed intake endpoints.
//!
//! [`IntakeApi`] maps domain calls onto [`RequestSpec`]s and decodes the
//! payloads. It never looks past the classified [`Error`](crate::Error).

use crate::credentials::Session;
use crate::request::{FilePart, RequestSpec};
use crate::{Client, Response, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A signed-in user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Value,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginPayload {
    user: User,
    token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: u64,
}

/// Result of a successful login.
#[derive(Debug, Clone)]
pub struct Login {
    pub user: User,
    pub session: Session,
}

/// A case as returned by the intake service.
///
/// Only the identifier is interpreted; everything else is passed through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Case {
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Filters for [`IntakeApi::list_cases`].
#[derive(Debug, Clone, Default)]
pub struct CaseQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub status: Option<String>,
    pub search: Option<String>,
}

impl CaseQuery {
    fn apply(&self, mut spec: RequestSpec) -> RequestSpec {
        if let Some(page) = self.page {
            spec = spec.with_query_param("page", page.to_string());
        }
        if let Some(limit) = self.limit {
            spec = spec.with_query_param("limit", limit.to_string());
        }
        if let Some(status) = &self.status {
            spec = spec.with_query_param("status", status.clone());
        }
        if let Some(search) = &self.search {
            spec = spec.with_query_param("search", search.clone());
        }
        spec
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub limit: u32,
    #[serde(default)]
    pub total: u64,
}

/// One page of cases.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CasePage {
    pub cases: Vec<Case>,
    #[serde(default)]
    pub pagination: Option<Pagination>,
}

/// A file accepted by the upload endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(alias = "originalName", alias = "filename")]
    pub file_name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Deserialize)]
struct UploadPayload {
    files: Vec<UploadedFile>,
}

/// Export formats offered by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Pdf,
    Json,
}

impl ExportFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Pdf => "pdf",
            ExportFormat::Json => "json",
        }
    }
}

/// A generated export.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportFile {
    pub file_name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// Domain-level calls on top of a [`Client`].
///
/// # Examples
///
/// ```no_run
/// use intake_client::{Client, IntakeApi};
/// use serde_json::json;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = Client::builder()
///     .base_url("https://intake.example.org/api")?
///     .build()?;
/// let api = IntakeApi::new(client);
///
/// api.login("officer@example.org", "hunter2").await?;
/// let case = api.submit_case(&json!({"title": "Flooded basement"})).await?;
/// println!("created case {}", case.id);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct IntakeApi {
    client: Client,
}

impl IntakeApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Signs in and persists the session and user record.
    ///
    /// A 401 here means bad credentials; it is returned as-is and does not
    /// touch the stored session.
    pub async fn login(&self, email: &str, password: &str) -> Result<Login> {
        let spec = RequestSpec::post(self.client.endpoints().login.as_str())
            .json(&LoginRequest { email, password })?
            .without_auth_recovery();

        let payload: LoginPayload = self.client.execute(spec).await?.data;

        let session = Session::new(payload.token, payload.refresh_token, payload.expires_in);
        self.client.start_session(&session);
        self.client.credentials().set_current_user(&payload.user);

        tracing::info!("Signed in");
        Ok(Login {
            user: payload.user,
            session,
        })
    }

    /// Signs out. The remote call is best-effort; local state is always cleared.
    pub async fn logout(&self) {
        let spec = RequestSpec::post(self.client.endpoints().logout.as_str())
            .without_auth_recovery();

        if self.client.is_authenticated() {
            if let Err(e) = self.client.execute::<Value>(spec).await {
                tracing::warn!(error = %e, "Remote logout failed; clearing local session anyway");
            }
        }

        self.client.end_session();
        tracing::info!("Signed out");
    }

    /// The stored user record, without a network call.
    pub fn current_user(&self) -> Option<User> {
        self.client.credentials().current_user()
    }

    /// Fetches the signed-in user from the server and refreshes the stored record.
    pub async fn fetch_current_user(&self) -> Result<User> {
        let spec =
            RequestSpec::get(self.client.endpoints().current_user.as_str()).requiring_session();
        let user: User = self.client.execute(spec).await?.data;
        self.client.credentials().set_current_user(&user);
        Ok(user)
    }

    pub async fn list_cases(&self, query: &CaseQuery) -> Result<CasePage> {
        let spec = query.apply(RequestSpec::get("/cases").requiring_session());
        Ok(self.client.execute(spec).await?.data)
    }

    pub async fn get_case(&self, id: &str) -> Result<Case> {
        let spec = RequestSpec::get(format!("/cases/{id}")).requiring_session();
        Ok(self.client.execute(spec).await?.data)
    }

    /// Submits a new case. Attempted once: a repeated submission could
    /// create a duplicate.
    pub async fn submit_case<B>(&self, case: &B) -> Result<Case>
    where
        B: Serialize + ?Sized,
    {
        let spec = RequestSpec::post("/cases").json(case)?.requiring_session();
        Ok(self.client.execute(spec).await?.data)
    }

    /// Submits a new case with an idempotency key, which allows the write
    /// policy's retries.
    pub async fn submit_case_idempotent<B>(&self, case: &B, idempotency_key: &str) -> Result<Case>
    where
        B: Serialize + ?Sized,
    {
        let spec = RequestSpec::post("/cases")
            .json(case)?
            .with_idempotency_key(idempotency_key)
            .requiring_session();
        Ok(self.client.execute(spec).await?.data)
    }

    pub async fn update_case<B>(&self, id: &str, changes: &B) -> Result<Case>
    where
        B: Serialize + ?Sized,
    {
        let spec = RequestSpec::patch(format!("/cases/{id}"))
            .json(changes)?
            .requiring_session();
        Ok(self.client.execute(spec).await?.data)
    }

    /// Uploads evidence files to a case as `multipart/form-data`.
    pub async fn upload_files(
        &self,
        case_id: &str,
        files: Vec<FilePart>,
    ) -> Result<Vec<UploadedFile>> {
        let spec = RequestSpec::post(format!("/cases/{case_id}/files"))
            .multipart(Vec::new(), files)
            .requiring_session();
        let payload: Response<UploadPayload> = self.client.execute(spec).await?;
        Ok(payload.data.files)
    }

    /// Requests an export of cases matching `query`.
    pub async fn export_cases(
        &self,
        format: ExportFormat,
        query: &CaseQuery,
    ) -> Result<ExportFile> {
        let spec = query.apply(
            RequestSpec::get("/cases/export")
                .with_query_param("format", format.as_str())
                .requiring_session(),
        );
        Ok(self.client.execute(spec).await?.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_keeps_unknown_fields() {
        let case: Case = serde_json::from_str(
            r#"{"id": 7, "status": "submitted", "title": "Leak", "priority": "high"}"#,
        )
        .unwrap();

        assert_eq!(case.id, 7);
        assert_eq!(case.status.as_deref(), Some("submitted"));
        assert_eq!(case.fields["title"], "Leak");
        assert_eq!(case.fields["priority"], "high");
    }

    #[test]
    fn case_query_becomes_query_params() {
        let query = CaseQuery {
            page: Some(2),
            status: Some("open".into()),
            ..CaseQuery::default()
        };
        let spec = query.apply(RequestSpec::get("/cases"));

        assert_eq!(
            spec.query_params,
            vec![
                ("page".to_string(), "2".to_string()),
                ("status".to_string(), "open".to_string())
            ]
        );
    }

    #[test]
    fn uploaded_file_accepts_server_field_names() {
        let file: UploadedFile =
            serde_json::from_str(r#"{"originalName": "photo.jpg", "size": 1024}"#).unwrap();
        assert_eq!(file.file_name, "photo.jpg");
        assert_eq!(file.size, Some(1024));
    }
}
