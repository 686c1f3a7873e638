//! Backend HTTP client
//!
//! Uploads spreadsheets to the backend's Excel import endpoint and acts as
//! the [`RemoteRecordService`] for the sync worker. A 401 from any endpoint
//! invalidates the shared session before the error is returned.

use crate::remote::{RemoteError, RemoteRecordService};
use async_trait::async_trait;
use dce_common::models::DriverRecord;
use reqwest::multipart::{Form, Part};
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

const USER_AGENT: &str = concat!("dce-sync/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const EXCEL_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Not signed in")]
    NotAuthenticated,

    #[error("Session expired or rejected by the server")]
    Unauthorized,

    #[error("Network error: {0}")]
    Network(String),

    #[error("API error {0}: {1}")]
    Api(u16, String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Import rejected: {0}")]
    Rejected(String),
}

/// Bearer token shared by every client of one signed-in user
#[derive(Debug, Default)]
pub struct AuthSession {
    token: RwLock<Option<String>>,
}

impl AuthSession {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
        }
    }

    /// A session nobody has signed into yet
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = Some(token.into());
    }

    /// Forget the token; the user has to sign in again
    pub fn invalidate(&self) {
        let previous = self
            .token
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if previous.is_some() {
            info!("Session invalidated");
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// Body of `POST /api/drivers/import/excel`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExcelImportResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub results: Option<ExcelImportResults>,
}

impl ExcelImportResponse {
    /// Fresh local records for every driver the backend created
    pub fn into_records(self) -> Vec<DriverRecord> {
        self.results
            .map(|results| {
                results
                    .drivers
                    .unwrap_or_default()
                    .into_iter()
                    .map(ImportedDriverSummary::into_record)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExcelImportResults {
    #[serde(default)]
    pub imported: usize,
    #[serde(default)]
    pub skipped: usize,
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub errors: Vec<String>,
    /// Absent when the backend created no drivers
    #[serde(default)]
    pub drivers: Option<Vec<ImportedDriverSummary>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportedDriverSummary {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub cp_number: Option<String>,
}

impl ImportedDriverSummary {
    /// Build a local record, keeping the server id when it is a UUID
    pub fn into_record(self) -> DriverRecord {
        let mut record = DriverRecord::new(self.name);
        if let Some(id) = self.id.as_deref().and_then(|id| Uuid::parse_str(id.trim()).ok()) {
            record.id = id;
        }
        record.first_name = self.first_name.filter(|s| !s.trim().is_empty());
        record.cp_number = self.cp_number.filter(|s| !s.trim().is_empty());
        record
    }
}

/// Client for the driver backend
pub struct BackendClient {
    http_client: reqwest::Client,
    base_url: String,
    session: Arc<AuthSession>,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>, session: Arc<AuthSession>) -> Result<Self, BackendError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BackendError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session,
        })
    }

    pub fn session(&self) -> &Arc<AuthSession> {
        &self.session
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn bearer(&self) -> Result<String, BackendError> {
        self.session.token().ok_or(BackendError::NotAuthenticated)
    }

    /// Map 401 and other failures; 401 invalidates the session first
    async fn check(&self, response: Response) -> Result<Response, BackendError> {
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED {
            warn!("Backend rejected credentials, signing out");
            self.session.invalidate();
            return Err(BackendError::Unauthorized);
        }

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(BackendError::Api(status.as_u16(), error_text));
        }

        Ok(response)
    }

    /// Upload a spreadsheet for server-side parsing
    pub async fn import_excel(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<ExcelImportResponse, BackendError> {
        let token = self.bearer()?;

        let part = Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(EXCEL_MIME)
            .map_err(|e| BackendError::Network(e.to_string()))?;
        let form = Form::new().part("file", part);

        debug!(file_name, "Uploading spreadsheet for import");

        let response = self
            .http_client
            .post(self.url("/api/drivers/import/excel"))
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;
        let response = self.check(response).await?;

        let import: ExcelImportResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Parse(e.to_string()))?;

        if !import.success {
            let message = import
                .message
                .clone()
                .unwrap_or_else(|| "no reason given".to_string());
            return Err(BackendError::Rejected(message));
        }

        if let Some(results) = &import.results {
            info!(
                imported = results.imported,
                skipped = results.skipped,
                errors = results.errors.len(),
                "Spreadsheet import accepted"
            );
        }
        Ok(import)
    }

    pub async fn list_drivers(&self) -> Result<Vec<DriverRecord>, BackendError> {
        let token = self.bearer()?;
        let response = self
            .http_client
            .get(self.url("/api/drivers"))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;
        let response = self.check(response).await?;

        response
            .json()
            .await
            .map_err(|e| BackendError::Parse(e.to_string()))
    }

    pub async fn put_driver(&self, record: &DriverRecord) -> Result<(), BackendError> {
        let token = self.bearer()?;
        let response = self
            .http_client
            .put(self.url(&format!("/api/drivers/{}", record.id)))
            .bearer_auth(token)
            .json(record)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;
        self.check(response).await?;
        Ok(())
    }

    pub async fn delete_driver(&self, id: Uuid) -> Result<(), BackendError> {
        let token = self.bearer()?;
        let response = self
            .http_client
            .delete(self.url(&format!("/api/drivers/{}", id)))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;
        self.check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteRecordService for BackendClient {
    async fn upsert(&self, record: &DriverRecord) -> Result<(), RemoteError> {
        Ok(self.put_driver(record).await?)
    }

    async fn delete(&self, id: Uuid) -> Result<(), RemoteError> {
        Ok(self.delete_driver(id).await?)
    }

    async fn fetch_all(&self) -> Result<Vec<DriverRecord>, RemoteError> {
        Ok(self.list_drivers().await?)
    }
}
