//! Authorized capability handles.
//!
//! A capability pairs a backend with the session's token store. Callers
//! never see a token; each call obtains a valid one first and is bounded by
//! the session's RPC timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use archeion_common::{
    BackendError, DirEntry, EndpointId, OperationError, SubmissionId, TaskId,
};
use archeion_service::{
    ActivationResult, AuthorizationService, EndpointSearch, EndpointSummary, SubmitResponse,
    TaskEvent, TransferRequest, TransferService, UserInfo,
};

use crate::token::TokenStore;

async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, OperationError>
where
    F: Future<Output = Result<T, BackendError>>,
{
    match timeout(limit, call).await {
        Ok(result) => result.map_err(OperationError::from),
        Err(_) => Err(OperationError::Timeout),
    }
}

/// Transfer-scoped RPC handle backed by the session's [`TokenStore`].
///
/// Cheap to clone; clones share the token store, so a refresh made through
/// one clone is visible to all.
#[derive(Clone)]
pub struct TransferCapability {
    service: Arc<dyn TransferService>,
    tokens: Arc<TokenStore>,
    rpc_timeout: Duration,
}

impl TransferCapability {
    pub fn new(
        service: Arc<dyn TransferService>,
        tokens: Arc<TokenStore>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            service,
            tokens,
            rpc_timeout,
        }
    }

    /// Name of the backend behind this capability.
    pub fn backend_name(&self) -> &str {
        self.service.name()
    }

    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    /// The token store this capability draws tokens from.
    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    async fn token(&self) -> Result<String, OperationError> {
        Ok(self.tokens.transfer_token_within(self.rpc_timeout).await?)
    }

    pub async fn endpoint_autoactivate(
        &self,
        endpoint: &EndpointId,
        if_expires_in: u64,
    ) -> Result<ActivationResult, OperationError> {
        let token = self.token().await?;
        bounded(
            self.rpc_timeout,
            self.service
                .endpoint_autoactivate(&token, endpoint, if_expires_in),
        )
        .await
    }

    pub async fn list_directory(
        &self,
        endpoint: &EndpointId,
        path: &str,
    ) -> Result<Vec<DirEntry>, OperationError> {
        let token = self.token().await?;
        bounded(
            self.rpc_timeout,
            self.service.list_directory(&token, endpoint, path),
        )
        .await
    }

    /// Create a directory.
    ///
    /// Unlike the other calls this keeps the raw [`BackendError`] so the
    /// caller can tell an existing directory apart.
    pub async fn make_directory(
        &self,
        endpoint: &EndpointId,
        path: &str,
    ) -> Result<Result<(), BackendError>, OperationError> {
        let token = self.token().await?;
        timeout(
            self.rpc_timeout,
            self.service.make_directory(&token, endpoint, path),
        )
        .await
        .map_err(|_| OperationError::Timeout)
    }

    pub async fn rename(
        &self,
        endpoint: &EndpointId,
        old_path: &str,
        new_path: &str,
    ) -> Result<(), OperationError> {
        let token = self.token().await?;
        bounded(
            self.rpc_timeout,
            self.service.rename(&token, endpoint, old_path, new_path),
        )
        .await
    }

    pub async fn get_submission_id(&self) -> Result<SubmissionId, OperationError> {
        let token = self.token().await?;
        bounded(self.rpc_timeout, self.service.get_submission_id(&token)).await
    }

    /// Submit a transfer.
    ///
    /// Keeps the raw [`BackendError`] so the caller can separate transport
    /// failures (safe to retry) from rejections.
    pub async fn submit_transfer(
        &self,
        request: &TransferRequest,
    ) -> Result<Result<SubmitResponse, BackendError>, OperationError> {
        let token = self.token().await?;
        Ok(timeout(self.rpc_timeout, self.service.submit_transfer(&token, request))
            .await
            .unwrap_or(Err(BackendError::Timeout)))
    }

    pub async fn task_status(&self, task_id: &TaskId) -> Result<Vec<TaskEvent>, OperationError> {
        let token = self.token().await?;
        bounded(self.rpc_timeout, self.service.task_status(&token, task_id)).await
    }

    pub async fn cancel_task(&self, task_id: &TaskId) -> Result<(), OperationError> {
        let token = self.token().await?;
        bounded(self.rpc_timeout, self.service.cancel_task(&token, task_id)).await
    }

    pub async fn get_endpoint(
        &self,
        endpoint: &EndpointId,
    ) -> Result<EndpointSummary, OperationError> {
        let token = self.token().await?;
        bounded(self.rpc_timeout, self.service.get_endpoint(&token, endpoint)).await
    }

    pub async fn endpoint_search(
        &self,
        search: &EndpointSearch,
    ) -> Result<Vec<EndpointSummary>, OperationError> {
        let token = self.token().await?;
        bounded(self.rpc_timeout, self.service.endpoint_search(&token, search)).await
    }
}

/// Identity-scoped RPC handle.
#[derive(Clone)]
pub struct IdentityCapability {
    authorizer: Arc<dyn AuthorizationService>,
    tokens: Arc<TokenStore>,
    rpc_timeout: Duration,
}

impl IdentityCapability {
    pub fn new(
        authorizer: Arc<dyn AuthorizationService>,
        tokens: Arc<TokenStore>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            authorizer,
            tokens,
            rpc_timeout,
        }
    }

    /// Identity of the authorized user.
    pub async fn userinfo(&self) -> Result<UserInfo, OperationError> {
        bounded(
            self.rpc_timeout,
            self.authorizer.userinfo(self.tokens.auth_token()),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archeion_service::MemoryService;
    use async_trait::async_trait;
    use chrono::Utc;

    /// Transfer backend that never answers.
    struct Stalled;

    #[async_trait]
    impl TransferService for Stalled {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn endpoint_autoactivate(
            &self,
            _token: &str,
            _endpoint: &EndpointId,
            _if_expires_in: u64,
        ) -> Result<ActivationResult, BackendError> {
            std::future::pending().await
        }

        async fn list_directory(
            &self,
            _token: &str,
            _endpoint: &EndpointId,
            _path: &str,
        ) -> Result<Vec<DirEntry>, BackendError> {
            std::future::pending().await
        }

        async fn make_directory(
            &self,
            _token: &str,
            _endpoint: &EndpointId,
            _path: &str,
        ) -> Result<(), BackendError> {
            std::future::pending().await
        }

        async fn rename(
            &self,
            _token: &str,
            _endpoint: &EndpointId,
            _old_path: &str,
            _new_path: &str,
        ) -> Result<(), BackendError> {
            std::future::pending().await
        }

        async fn get_submission_id(&self, _token: &str) -> Result<SubmissionId, BackendError> {
            std::future::pending().await
        }

        async fn submit_transfer(
            &self,
            _token: &str,
            _request: &TransferRequest,
        ) -> Result<SubmitResponse, BackendError> {
            std::future::pending().await
        }

        async fn task_status(
            &self,
            _token: &str,
            _task_id: &TaskId,
        ) -> Result<Vec<TaskEvent>, BackendError> {
            std::future::pending().await
        }

        async fn cancel_task(&self, _token: &str, _task_id: &TaskId) -> Result<(), BackendError> {
            std::future::pending().await
        }

        async fn get_endpoint(
            &self,
            _token: &str,
            _endpoint: &EndpointId,
        ) -> Result<EndpointSummary, BackendError> {
            std::future::pending().await
        }

        async fn endpoint_search(
            &self,
            _token: &str,
            _search: &EndpointSearch,
        ) -> Result<Vec<EndpointSummary>, BackendError> {
            std::future::pending().await
        }
    }

    fn endpoint_id() -> EndpointId {
        EndpointId::new("ddb59aef-6d04-11e5-ba46-22000b92c6ec").unwrap()
    }

    #[tokio::test]
    async fn test_timeout_is_not_a_backend_error() {
        let auth = Arc::new(MemoryService::new());
        let tokens = Arc::new(TokenStore::new(auth.clone(), auth.issue_tokens(), Utc::now()));
        let capability =
            TransferCapability::new(Arc::new(Stalled), tokens, Duration::from_millis(20));

        assert_eq!(
            capability.rename(&endpoint_id(), "/a", "/b").await,
            Err(OperationError::Timeout)
        );
        assert_eq!(
            capability
                .make_directory(&endpoint_id(), "/a")
                .await
                .unwrap_err(),
            OperationError::Timeout
        );
    }

    #[tokio::test]
    async fn test_stalled_refresh_is_bounded_by_rpc_timeout() {
        let service = Arc::new(MemoryService::new().with_refresh_delay(Duration::from_secs(5)));
        service.set_token_lifetime(0);
        let tokens = Arc::new(TokenStore::new(
            service.clone(),
            service.issue_tokens(),
            Utc::now(),
        ));
        let capability =
            TransferCapability::new(service.clone(), tokens, Duration::from_millis(50));

        let started = std::time::Instant::now();
        let first = capability.rename(&endpoint_id(), "/a", "/b").await;
        let second = capability.list_directory(&endpoint_id(), "/").await;

        assert_eq!(first, Err(OperationError::Timeout));
        assert_eq!(second, Err(OperationError::Timeout));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(service.refresh_calls(), 2);
    }

    #[tokio::test]
    async fn test_capability_refreshes_stale_token() {
        let service = Arc::new(MemoryService::new());
        service.set_token_lifetime(0);
        let tokens = Arc::new(TokenStore::new(
            service.clone(),
            service.issue_tokens(),
            Utc::now(),
        ));
        service.set_token_lifetime(3600);
        service.add_endpoint(&endpoint_id(), "lab");

        let capability = TransferCapability::new(service.clone(), tokens, Duration::from_secs(5));
        let result = capability
            .endpoint_autoactivate(&endpoint_id(), 3600)
            .await
            .unwrap();

        assert_eq!(result.code, "AutoActivated.CachedCredential");
        assert_eq!(service.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_identity_capability_uses_auth_token() {
        let service = Arc::new(MemoryService::new());
        let tokens = Arc::new(TokenStore::new(
            service.clone(),
            service.issue_tokens(),
            Utc::now(),
        ));
        let identity = IdentityCapability::new(service, tokens, Duration::from_secs(5));

        let user = identity.userinfo().await.unwrap();
        assert_eq!(user.preferred_username.as_deref(), Some("tester@example.org"));
    }
}
