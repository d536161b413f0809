//! Backend trait definitions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use archeion_common::{
    AuthError, BackendError, DirEntry, EndpointId, SubmissionId, SyncLevel, TaskId, TransferItem,
};

/// A freshly issued access token with its lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    /// Present when the service issued (or rotated) a refresh token.
    pub refresh_token: Option<String>,
    /// Lifetime in seconds from the moment of issue.
    pub expires_in: u64,
}

/// Tokens obtained from an authorization-code exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSet {
    /// Token for identity-scoped calls.
    pub auth_token: String,
    /// Token (and refresh token) for transfer-scoped calls.
    pub transfer: TokenGrant,
}

/// Identity of the authorized user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub sub: String,
    #[serde(default)]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// Raw autoactivate answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationResult {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// Interpretation of an autoactivate code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationOutcome {
    /// Already active or activated automatically.
    Activated,
    /// The user must activate through the web UI.
    ManualRequired,
    /// A code this client does not know.
    Unrecognized(String),
}

impl ActivationResult {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: String::new(),
        }
    }

    pub fn outcome(&self) -> ActivationOutcome {
        let code = self.code.as_str();
        if code == "AutoActivationFailed" {
            ActivationOutcome::ManualRequired
        } else if code == "AlreadyActivated"
            || code == "NotRequired"
            || code.starts_with("AutoActivated")
            || code.starts_with("Activated")
        {
            ActivationOutcome::Activated
        } else {
            ActivationOutcome::Unrecognized(code.to_string())
        }
    }
}

/// A complete transfer submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub submission_id: SubmissionId,
    pub label: String,
    pub source_endpoint: EndpointId,
    pub destination_endpoint: EndpointId,
    pub items: Vec<TransferItem>,
    pub sync_level: SyncLevel,
    pub verify_checksum: bool,
    pub encrypt_data: bool,
}

/// Service answer to a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    /// `Accepted` or `Duplicate`.
    pub code: String,
    #[serde(default)]
    pub message: String,
    pub task_id: TaskId,
}

/// One entry of a task's event list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub code: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub time: Option<String>,
}

impl TaskEvent {
    pub fn new(code: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            description: String::new(),
            details: details.into(),
            is_error: false,
            time: None,
        }
    }
}

/// Summary of an endpoint as returned by lookups and searches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSummary {
    pub id: EndpointId,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub canonical_name: Option<String>,
}

impl EndpointSummary {
    /// Display name, falling back to the canonical name, then the id.
    pub fn name(&self) -> String {
        self.display_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .or(self.canonical_name.as_deref().filter(|n| !n.is_empty()))
            .map(str::to_string)
            .unwrap_or_else(|| self.id.to_string())
    }
}

/// Which endpoints a search considers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchScope {
    #[default]
    All,
    /// Only endpoints owned by the authorized user.
    MyEndpoints,
}

impl SearchScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchScope::All => "all",
            SearchScope::MyEndpoints => "my-endpoints",
        }
    }
}

/// Endpoint search parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSearch {
    pub query: Option<String>,
    pub scope: SearchScope,
    pub limit: u32,
}

impl EndpointSearch {
    /// Full-text search across all endpoints.
    pub fn fulltext(query: impl Into<String>) -> Self {
        Self {
            query: Some(query.into()),
            scope: SearchScope::All,
            limit: 25,
        }
    }

    /// The user's own endpoints.
    pub fn mine(limit: u32) -> Self {
        Self {
            query: None,
            scope: SearchScope::MyEndpoints,
            limit,
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }
}

/// Authorization backend (OAuth2 provider side).
#[async_trait]
pub trait AuthorizationService: Send + Sync {
    /// URL the user must visit to grant access.
    ///
    /// Implementations keep any per-flow state (PKCE verifier) until the
    /// code has been exchanged.
    fn authorize_url(&self) -> Result<String, AuthError>;

    /// Exchange an authorization code for the initial tokens.
    ///
    /// # Errors
    /// - `InvalidCode` if the service rejects the code
    /// - `NetworkError` on transport failure
    async fn exchange_code(&self, code: &str) -> Result<TokenSet, AuthError>;

    /// Exchange a refresh token for a new transfer access token.
    ///
    /// # Errors
    /// - `RefreshDenied` if the refresh token is revoked or invalid
    /// - `NetworkError` on transport failure
    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant, AuthError>;

    /// Identity of the token's owner.
    async fn userinfo(&self, auth_token: &str) -> Result<UserInfo, BackendError>;
}

/// Transfer backend. Every call carries a valid transfer access token.
#[async_trait]
pub trait TransferService: Send + Sync {
    /// Get the provider name (e.g., "globus", "memory").
    fn name(&self) -> &str;

    /// Activate an endpoint unless it stays active for `if_expires_in` seconds.
    async fn endpoint_autoactivate(
        &self,
        token: &str,
        endpoint: &EndpointId,
        if_expires_in: u64,
    ) -> Result<ActivationResult, BackendError>;

    /// Entries of a remote directory (not recursive).
    async fn list_directory(
        &self,
        token: &str,
        endpoint: &EndpointId,
        path: &str,
    ) -> Result<Vec<DirEntry>, BackendError>;

    /// Create a remote directory.
    ///
    /// # Errors
    /// - `AlreadyExists` if the directory exists
    async fn make_directory(
        &self,
        token: &str,
        endpoint: &EndpointId,
        path: &str,
    ) -> Result<(), BackendError>;

    /// Rename/move a remote path.
    async fn rename(
        &self,
        token: &str,
        endpoint: &EndpointId,
        old_path: &str,
        new_path: &str,
    ) -> Result<(), BackendError>;

    /// Fresh idempotency token for one submission.
    async fn get_submission_id(&self, token: &str) -> Result<SubmissionId, BackendError>;

    /// Submit a transfer. Re-sending the same submission id must not create
    /// a second task.
    async fn submit_transfer(
        &self,
        token: &str,
        request: &TransferRequest,
    ) -> Result<SubmitResponse, BackendError>;

    /// Events of a task, newest first.
    async fn task_status(&self, token: &str, task_id: &TaskId)
        -> Result<Vec<TaskEvent>, BackendError>;

    /// Cancel a task.
    async fn cancel_task(&self, token: &str, task_id: &TaskId) -> Result<(), BackendError>;

    /// Endpoint details.
    async fn get_endpoint(
        &self,
        token: &str,
        endpoint: &EndpointId,
    ) -> Result<EndpointSummary, BackendError>;

    /// Search endpoints.
    async fn endpoint_search(
        &self,
        token: &str,
        search: &EndpointSearch,
    ) -> Result<Vec<EndpointSummary>, BackendError>;
}
