//! Authorization session.
//!
//! A session is created once, either by the interactive authorization-code
//! flow or from externally persisted tokens, and is never re-authorized
//! afterwards; only the token store's refresh path renews credentials.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn, Instrument};

use archeion_common::AuthError;
use archeion_service::{AuthorizationService, TransferService};

use crate::capability::{IdentityCapability, TransferCapability};
use crate::prompt::Prompt;
use crate::token::{StoredTokens, TokenStore};

/// Session tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound for every backend RPC, in milliseconds.
    pub rpc_timeout_ms: u64,
    /// How many codes the user may enter before the flow fails.
    pub max_code_attempts: u32,
    /// Endpoints are re-activated unless they stay active this long.
    pub activation_margin_secs: u64,
}

impl SessionConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Set the RPC timeout.
    pub fn with_rpc_timeout(mut self, limit: Duration) -> Self {
        self.rpc_timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the number of code attempts.
    pub fn with_max_code_attempts(mut self, attempts: u32) -> Self {
        self.max_code_attempts = attempts.max(1);
        self
    }

    /// Set the activation margin.
    pub fn with_activation_margin(mut self, seconds: u64) -> Self {
        self.activation_margin_secs = seconds;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: 30_000,
            max_code_attempts: 3,
            activation_margin_secs: 3600,
        }
    }
}

/// An authorized session.
///
/// Hands out capabilities that share one [`TokenStore`]; any number of
/// endpoint handles may be derived from the same session.
pub struct AuthSession {
    tokens: Arc<TokenStore>,
    authorizer: Arc<dyn AuthorizationService>,
    service: Arc<dyn TransferService>,
    prompt: Arc<dyn Prompt>,
    config: SessionConfig,
}

impl AuthSession {
    /// Run the interactive authorization-code flow.
    ///
    /// Presents the authorization URL through `prompt`, waits for the user to
    /// paste a code and exchanges it. A rejected code re-prompts up to
    /// `config.max_code_attempts` times.
    ///
    /// # Errors
    /// - `InvalidCode` once the attempts are used up
    /// - `NetworkError` if the authorization service is unreachable
    /// - `UserCancelled` if the user aborts at the prompt
    pub async fn authorize(
        authorizer: Arc<dyn AuthorizationService>,
        service: Arc<dyn TransferService>,
        prompt: Arc<dyn Prompt>,
        config: SessionConfig,
    ) -> Result<Self, AuthError> {
        let span = tracing::info_span!("authorize", backend = service.name());
        let max_attempts = config.max_code_attempts.max(1);

        let tokens = async {
            let mut attempt = 0;
            loop {
                attempt += 1;

                let url = authorizer.authorize_url()?;
                prompt
                    .present_url(
                        "Please log in at the following URL and paste the authorization code below:",
                        &url,
                    )
                    .await
                    .map_err(|e| AuthError::Prompt(e.to_string()))?;

                let answer = prompt
                    .read_line("Authorization code: ")
                    .await
                    .map_err(|e| AuthError::Prompt(e.to_string()))?;
                let Some(code) = answer else {
                    info!("Authorization cancelled at the code prompt");
                    return Err(AuthError::UserCancelled);
                };

                let code = code.trim();
                let result = if code.is_empty() {
                    Err(AuthError::InvalidCode("empty authorization code".to_string()))
                } else {
                    timeout(config.rpc_timeout(), authorizer.exchange_code(code))
                        .await
                        .unwrap_or_else(|_| {
                            Err(AuthError::NetworkError(
                                "authorization code exchange timed out".to_string(),
                            ))
                        })
                };

                match result {
                    Ok(tokens) => return Ok(tokens),
                    Err(AuthError::InvalidCode(reason)) if attempt < max_attempts => {
                        warn!(attempt, %reason, "Authorization code rejected, asking again");
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        .instrument(span)
        .await?;

        info!("Authorization completed");
        let store = TokenStore::new(authorizer.clone(), tokens, Utc::now());
        Ok(Self::with_store(store, authorizer, service, prompt, config))
    }

    /// Build a session from externally persisted tokens.
    pub fn from_tokens(
        stored: &StoredTokens,
        authorizer: Arc<dyn AuthorizationService>,
        service: Arc<dyn TransferService>,
        prompt: Arc<dyn Prompt>,
        config: SessionConfig,
    ) -> Self {
        let store = TokenStore::from_stored(authorizer.clone(), stored);
        Self::with_store(store, authorizer, service, prompt, config)
    }

    fn with_store(
        store: TokenStore,
        authorizer: Arc<dyn AuthorizationService>,
        service: Arc<dyn TransferService>,
        prompt: Arc<dyn Prompt>,
        config: SessionConfig,
    ) -> Self {
        Self {
            tokens: Arc::new(store),
            authorizer,
            service,
            prompt,
            config,
        }
    }

    /// Handle for transfer-scoped calls, backed by this session's tokens.
    pub fn transfer_capability(&self) -> TransferCapability {
        TransferCapability::new(
            self.service.clone(),
            self.tokens.clone(),
            self.config.rpc_timeout(),
        )
    }

    /// Handle for identity-scoped calls.
    pub fn identity_capability(&self) -> IdentityCapability {
        IdentityCapability::new(
            self.authorizer.clone(),
            self.tokens.clone(),
            self.config.rpc_timeout(),
        )
    }

    pub fn prompt(&self) -> Arc<dyn Prompt> {
        self.prompt.clone()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::ScriptedPrompt;
    use archeion_service::MemoryService;

    fn backends() -> (Arc<MemoryService>, Arc<dyn AuthorizationService>, Arc<dyn TransferService>) {
        let memory = Arc::new(MemoryService::new());
        let authorizer: Arc<dyn AuthorizationService> = memory.clone();
        let service: Arc<dyn TransferService> = memory.clone();
        (memory, authorizer, service)
    }

    #[tokio::test]
    async fn test_authorize_exchanges_pasted_code() {
        let (memory, authorizer, service) = backends();
        memory.accept_code("good-code");
        let prompt = Arc::new(ScriptedPrompt::new(["  good-code\n"]));

        let session = AuthSession::authorize(
            authorizer,
            service,
            prompt.clone(),
            SessionConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(prompt.presented().len(), 1);
        assert_eq!(session.tokens().auth_token(), "auth-token-1");
        assert_eq!(memory.exchange_calls(), 1);
    }

    #[tokio::test]
    async fn test_invalid_code_reprompts() {
        let (memory, authorizer, service) = backends();
        memory.accept_code("good-code");
        let prompt = Arc::new(ScriptedPrompt::new(["typo", "", "good-code"]));

        let session = AuthSession::authorize(
            authorizer,
            service,
            prompt.clone(),
            SessionConfig::default(),
        )
        .await;

        assert!(session.is_ok());
        assert_eq!(prompt.presented().len(), 3);
        // The empty answer never reaches the service
        assert_eq!(memory.exchange_calls(), 2);
    }

    #[tokio::test]
    async fn test_invalid_code_attempts_are_bounded() {
        let (memory, authorizer, service) = backends();
        let prompt = Arc::new(ScriptedPrompt::new(["a", "b", "c", "d"]));

        let result = AuthSession::authorize(
            authorizer,
            service,
            prompt.clone(),
            SessionConfig::default().with_max_code_attempts(2),
        )
        .await;

        assert!(matches!(result, Err(AuthError::InvalidCode(_))));
        assert_eq!(memory.exchange_calls(), 2);
    }

    #[tokio::test]
    async fn test_network_error_is_not_reprompted() {
        let (memory, authorizer, service) = backends();
        memory.set_auth_network_down(true);
        let prompt = Arc::new(ScriptedPrompt::new(["code", "code"]));

        let result =
            AuthSession::authorize(authorizer, service, prompt.clone(), SessionConfig::default())
                .await;

        assert!(matches!(result, Err(AuthError::NetworkError(_))));
        assert_eq!(prompt.questions().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_at_prompt() {
        let (_memory, authorizer, service) = backends();
        let prompt = Arc::new(ScriptedPrompt::default());
        prompt.cancel();

        let result =
            AuthSession::authorize(authorizer, service, prompt, SessionConfig::default()).await;
        assert!(matches!(result, Err(AuthError::UserCancelled)));
    }

    #[tokio::test]
    async fn test_capabilities_share_token_store() {
        let (memory, authorizer, service) = backends();
        let stored = {
            let tokens = memory.issue_tokens();
            let store = TokenStore::new(authorizer.clone(), tokens, Utc::now());
            store.snapshot().await
        };

        let session = AuthSession::from_tokens(
            &stored,
            authorizer,
            service,
            Arc::new(ScriptedPrompt::default()),
            SessionConfig::default(),
        );

        let first = session.transfer_capability();
        let second = session.transfer_capability();
        assert!(Arc::ptr_eq(first.tokens(), second.tokens()));
        assert!(session.identity_capability().userinfo().await.is_ok());
    }

    #[test]
    fn test_session_config_defaults_fill_in() {
        let config: SessionConfig = serde_json::from_str(r#"{"rpc_timeout_ms": 500}"#).unwrap();
        assert_eq!(config.rpc_timeout(), Duration::from_millis(500));
        assert_eq!(config.max_code_attempts, 3);
        assert_eq!(config.activation_margin_secs, 3600);
    }
}
