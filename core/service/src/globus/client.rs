//! Globus Transfer API client.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use tracing::debug;
use url::Url;

use archeion_common::{BackendError, DirEntry, EndpointId, SubmissionId, TaskId};

use crate::service::{
    ActivationResult, EndpointSearch, EndpointSummary, SubmitResponse, TaskEvent,
    TransferRequest, TransferService,
};

/// Globus Transfer API base URL.
const TRANSFER_API_BASE: &str = "https://transfer.api.globusonline.org/v0.10";

/// Globus Transfer client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobusConfig {
    /// Base URL of the Transfer API.
    #[serde(default = "GlobusConfig::default_base_url")]
    pub base_url: String,
    /// User agent sent with every request.
    #[serde(default = "GlobusConfig::default_user_agent")]
    pub user_agent: String,
}

impl GlobusConfig {
    fn default_base_url() -> String {
        TRANSFER_API_BASE.to_string()
    }

    fn default_user_agent() -> String {
        concat!("archeion/", env!("CARGO_PKG_VERSION")).to_string()
    }
}

impl Default for GlobusConfig {
    fn default() -> Self {
        Self {
            base_url: Self::default_base_url(),
            user_agent: Self::default_user_agent(),
        }
    }
}

/// Envelope of list responses.
#[derive(Debug, Deserialize)]
struct DataList<T> {
    #[serde(rename = "DATA", default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct SubmissionIdResponse {
    value: String,
}

/// Error body of the Transfer API.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    #[serde(default)]
    message: String,
}

/// Map a non-success response to a backend error.
fn classify_error(status: StatusCode, body: &str) -> BackendError {
    let (code, message) = match serde_json::from_str::<ErrorBody>(body) {
        Ok(err) => (err.code, err.message),
        Err(_) => (status.as_u16().to_string(), body.to_string()),
    };

    if code.contains("ActivationRequired") {
        BackendError::ActivationRequired(message)
    } else if code.ends_with(".Exists") || code.contains("AlreadyExists") {
        BackendError::AlreadyExists(message)
    } else if status == StatusCode::NOT_FOUND || code == "ClientError.NotFound" {
        BackendError::NotFound(message)
    } else if status == StatusCode::UNAUTHORIZED {
        BackendError::Unauthorized(message)
    } else {
        BackendError::Service { code, message }
    }
}

fn transport_error(context: &str, err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout
    } else {
        BackendError::Network(format!("{}: {}", context, err))
    }
}

fn transfer_document(request: &TransferRequest) -> serde_json::Value {
    let items: Vec<serde_json::Value> = request
        .items
        .iter()
        .map(|item| {
            json!({
                "DATA_TYPE": "transfer_item",
                "source_path": item.source_path,
                "destination_path": item.destination_path,
                "recursive": item.recursive,
            })
        })
        .collect();

    json!({
        "DATA_TYPE": "transfer",
        "submission_id": request.submission_id.as_str(),
        "source_endpoint": request.source_endpoint.as_str(),
        "destination_endpoint": request.destination_endpoint.as_str(),
        "label": request.label,
        "sync_level": request.sync_level.ordinal(),
        "verify_checksum": request.verify_checksum,
        "encrypt_data": request.encrypt_data,
        "DATA": items,
    })
}

/// Globus Transfer API client.
pub struct GlobusClient {
    http: Client,
    base_url: String,
}

impl GlobusClient {
    /// Create a new Transfer client.
    ///
    /// # Errors
    /// - Malformed base URL
    /// - HTTP client construction failure
    pub fn new(config: GlobusConfig) -> Result<Self, BackendError> {
        Url::parse(&config.base_url).map_err(|e| {
            BackendError::InvalidResponse(format!("Invalid base URL '{}': {}", config.base_url, e))
        })?;

        let http = Client::builder()
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| BackendError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request and decode the JSON answer.
    async fn send<T: DeserializeOwned>(
        &self,
        context: &str,
        request: RequestBuilder,
    ) -> Result<T, BackendError> {
        let response = request
            .send()
            .await
            .map_err(|e| transport_error(context, e))?;

        let status = response.status();
        if status.is_success() {
            response.json().await.map_err(|e| {
                BackendError::InvalidResponse(format!("{}: failed to parse response: {}", context, e))
            })
        } else {
            let body = response.text().await.unwrap_or_default();
            debug!(%status, context, "Transfer API error");
            Err(classify_error(status, &body))
        }
    }
}

#[async_trait]
impl TransferService for GlobusClient {
    fn name(&self) -> &str {
        "globus"
    }

    async fn endpoint_autoactivate(
        &self,
        token: &str,
        endpoint: &EndpointId,
        if_expires_in: u64,
    ) -> Result<ActivationResult, BackendError> {
        let request = self
            .http
            .post(self.url(&format!("/endpoint/{}/autoactivate", endpoint)))
            .bearer_auth(token)
            .query(&[("if_expires_in", if_expires_in.to_string())])
            .json(&json!({}));

        self.send("Failed to autoactivate endpoint", request).await
    }

    async fn list_directory(
        &self,
        token: &str,
        endpoint: &EndpointId,
        path: &str,
    ) -> Result<Vec<DirEntry>, BackendError> {
        let request = self
            .http
            .get(self.url(&format!("/operation/endpoint/{}/ls", endpoint)))
            .bearer_auth(token)
            .query(&[("path", path)]);

        let listing: DataList<DirEntry> = self.send("Failed to list directory", request).await?;
        Ok(listing.data)
    }

    async fn make_directory(
        &self,
        token: &str,
        endpoint: &EndpointId,
        path: &str,
    ) -> Result<(), BackendError> {
        let request = self
            .http
            .post(self.url(&format!("/operation/endpoint/{}/mkdir", endpoint)))
            .bearer_auth(token)
            .json(&json!({ "DATA_TYPE": "mkdir", "path": path }));

        let _: serde_json::Value = self.send("Failed to create directory", request).await?;
        Ok(())
    }

    async fn rename(
        &self,
        token: &str,
        endpoint: &EndpointId,
        old_path: &str,
        new_path: &str,
    ) -> Result<(), BackendError> {
        let request = self
            .http
            .post(self.url(&format!("/operation/endpoint/{}/rename", endpoint)))
            .bearer_auth(token)
            .json(&json!({
                "DATA_TYPE": "rename",
                "old_path": old_path,
                "new_path": new_path,
            }));

        let _: serde_json::Value = self.send("Failed to rename", request).await?;
        Ok(())
    }

    async fn get_submission_id(&self, token: &str) -> Result<SubmissionId, BackendError> {
        let request = self.http.get(self.url("/submission_id")).bearer_auth(token);

        let response: SubmissionIdResponse =
            self.send("Failed to get submission id", request).await?;
        Ok(SubmissionId::new(response.value))
    }

    async fn submit_transfer(
        &self,
        token: &str,
        request: &TransferRequest,
    ) -> Result<SubmitResponse, BackendError> {
        let http_request = self
            .http
            .post(self.url("/transfer"))
            .bearer_auth(token)
            .json(&transfer_document(request));

        self.send("Failed to submit transfer", http_request).await
    }

    async fn task_status(
        &self,
        token: &str,
        task_id: &TaskId,
    ) -> Result<Vec<TaskEvent>, BackendError> {
        let request = self
            .http
            .get(self.url(&format!("/task/{}/event_list", task_id)))
            .bearer_auth(token);

        let events: DataList<TaskEvent> = self.send("Failed to get task events", request).await?;
        Ok(events.data)
    }

    async fn cancel_task(&self, token: &str, task_id: &TaskId) -> Result<(), BackendError> {
        let request = self
            .http
            .post(self.url(&format!("/task/{}/cancel", task_id)))
            .bearer_auth(token)
            .json(&json!({}));

        let _: serde_json::Value = self.send("Failed to cancel task", request).await?;
        Ok(())
    }

    async fn get_endpoint(
        &self,
        token: &str,
        endpoint: &EndpointId,
    ) -> Result<EndpointSummary, BackendError> {
        let request = self
            .http
            .get(self.url(&format!("/endpoint/{}", endpoint)))
            .bearer_auth(token);

        self.send("Failed to get endpoint", request).await
    }

    async fn endpoint_search(
        &self,
        token: &str,
        search: &EndpointSearch,
    ) -> Result<Vec<EndpointSummary>, BackendError> {
        let mut request = self
            .http
            .get(self.url("/endpoint_search"))
            .bearer_auth(token)
            .query(&[
                ("filter_scope", search.scope.as_str().to_string()),
                ("limit", search.limit.to_string()),
            ]);

        if let Some(query) = &search.query {
            request = request.query(&[("filter_fulltext", query.as_str())]);
        }

        let results: DataList<EndpointSummary> =
            self.send("Failed to search endpoints", request).await?;
        Ok(results.data)
    }
}
