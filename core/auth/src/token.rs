//! Token storage with on-demand refresh.
//!
//! The transfer access token is short-lived. Every transfer-scoped call asks
//! the store for a token; a stale token is exchanged through the refresh
//! token first. Concurrent callers hitting the same stale window share one
//! refresh RPC.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use archeion_common::AuthError;
use archeion_service::{AuthorizationService, TokenGrant, TokenSet};

/// Tokens in a form suitable for external persistence.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct StoredTokens {
    /// Token for identity-scoped calls.
    pub auth_token: String,
    /// Token for transfer-scoped calls.
    pub transfer_token: String,
    #[serde(default)]
    pub transfer_refresh_token: Option<String>,
    /// Absolute expiry of `transfer_token`.
    #[zeroize(skip)]
    pub transfer_expiry: DateTime<Utc>,
}

impl fmt::Debug for StoredTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredTokens")
            .field("auth_token", &"[REDACTED]")
            .field("transfer_token", &"[REDACTED]")
            .field(
                "transfer_refresh_token",
                &self.transfer_refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("transfer_expiry", &self.transfer_expiry)
            .finish()
    }
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct TransferTokens {
    access_token: String,
    refresh_token: Option<String>,
    #[zeroize(skip)]
    expiry: DateTime<Utc>,
    /// Set once the refresh token was rejected.
    #[zeroize(skip)]
    denied: Option<String>,
}

impl TransferTokens {
    fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.expiry
    }

    fn apply(&mut self, grant: TokenGrant, now: DateTime<Utc>) {
        self.access_token.zeroize();
        self.access_token = grant.access_token;
        if let Some(refresh_token) = grant.refresh_token {
            self.refresh_token.zeroize();
            self.refresh_token = Some(refresh_token);
        }
        self.expiry = expiry_after(now, grant.expires_in);
    }
}

fn expiry_after(now: DateTime<Utc>, expires_in: u64) -> DateTime<Utc> {
    let seconds = i64::try_from(expires_in).unwrap_or(i64::MAX);
    Duration::try_seconds(seconds)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Holds the session's tokens and refreshes the transfer token on demand.
///
/// Shared by reference between every handle derived from one session, so a
/// refresh performed by one caller is observed by all others.
pub struct TokenStore {
    authorizer: Arc<dyn AuthorizationService>,
    auth_token: String,
    transfer: RwLock<TransferTokens>,
}

impl TokenStore {
    /// Create a store from a freshly exchanged token set.
    ///
    /// # Postconditions
    /// - `transfer_expiry` is `now + expires_in`
    pub fn new(
        authorizer: Arc<dyn AuthorizationService>,
        tokens: TokenSet,
        now: DateTime<Utc>,
    ) -> Self {
        let TokenSet {
            auth_token,
            transfer,
        } = tokens;

        Self {
            authorizer,
            auth_token,
            transfer: RwLock::new(TransferTokens {
                expiry: expiry_after(now, transfer.expires_in),
                access_token: transfer.access_token,
                refresh_token: transfer.refresh_token,
                denied: None,
            }),
        }
    }

    /// Create a store from externally persisted tokens.
    pub fn from_stored(authorizer: Arc<dyn AuthorizationService>, stored: &StoredTokens) -> Self {
        Self {
            authorizer,
            auth_token: stored.auth_token.clone(),
            transfer: RwLock::new(TransferTokens {
                access_token: stored.transfer_token.clone(),
                refresh_token: stored.transfer_refresh_token.clone(),
                expiry: stored.transfer_expiry,
                denied: None,
            }),
        }
    }

    /// Token for identity-scoped calls.
    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    /// Whether the transfer token is still valid at `now`.
    pub async fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.transfer.read().await.is_valid(now)
    }

    /// Expiry of the current transfer token.
    pub async fn transfer_expiry(&self) -> DateTime<Utc> {
        self.transfer.read().await.expiry
    }

    /// Exchange the refresh token for a new transfer token.
    ///
    /// # Postconditions
    /// - On success the new token expires at `now + expires_in`
    ///
    /// # Errors
    /// - `RefreshDenied` if the refresh token was rejected, now or earlier
    /// - `NetworkError` if the authorization service is unreachable
    pub async fn refresh(&self, now: DateTime<Utc>) -> Result<(), AuthError> {
        let mut tokens = self.transfer.write().await;
        self.refresh_locked(&mut tokens, now, None).await
    }

    /// A valid transfer token, refreshing first if it is stale.
    ///
    /// # Errors
    /// - Refresh failed (see [`TokenStore::refresh`])
    pub async fn transfer_token(&self) -> Result<String, AuthError> {
        self.token_at(Utc::now(), None).await
    }

    /// Like [`TokenStore::transfer_token`], giving up on a refresh that takes
    /// longer than `limit`.
    ///
    /// The write lock is released when the limit expires, so other callers
    /// are not held behind a stalled refresh.
    ///
    /// # Errors
    /// - `Timeout` if the refresh did not finish within `limit` (not latched)
    /// - Refresh failed (see [`TokenStore::refresh`])
    pub async fn transfer_token_within(&self, limit: StdDuration) -> Result<String, AuthError> {
        self.token_at(Utc::now(), Some(limit)).await
    }

    /// Like [`TokenStore::transfer_token`] with an explicit clock.
    pub async fn transfer_token_at(&self, now: DateTime<Utc>) -> Result<String, AuthError> {
        self.token_at(now, None).await
    }

    async fn token_at(
        &self,
        now: DateTime<Utc>,
        limit: Option<StdDuration>,
    ) -> Result<String, AuthError> {
        let tokens = self.transfer.read().await;

        if let Some(reason) = &tokens.denied {
            return Err(AuthError::RefreshDenied(reason.clone()));
        }
        if tokens.is_valid(now) {
            return Ok(tokens.access_token.clone());
        }

        drop(tokens);

        let mut tokens = self.transfer.write().await;

        // Another caller may have refreshed while we waited for the lock
        if tokens.denied.is_none() && tokens.is_valid(now) {
            debug!("Transfer token already refreshed by another caller");
            return Ok(tokens.access_token.clone());
        }

        self.refresh_locked(&mut tokens, now, limit).await?;
        Ok(tokens.access_token.clone())
    }

    /// Current tokens for external persistence.
    pub async fn snapshot(&self) -> StoredTokens {
        let tokens = self.transfer.read().await;
        StoredTokens {
            auth_token: self.auth_token.clone(),
            transfer_token: tokens.access_token.clone(),
            transfer_refresh_token: tokens.refresh_token.clone(),
            transfer_expiry: tokens.expiry,
        }
    }

    async fn refresh_locked(
        &self,
        tokens: &mut TransferTokens,
        now: DateTime<Utc>,
        limit: Option<StdDuration>,
    ) -> Result<(), AuthError> {
        if let Some(reason) = &tokens.denied {
            return Err(AuthError::RefreshDenied(reason.clone()));
        }

        let Some(refresh_token) = tokens.refresh_token.clone().map(Zeroizing::new) else {
            let reason = "no refresh token available".to_string();
            tokens.denied = Some(reason.clone());
            return Err(AuthError::RefreshDenied(reason));
        };

        info!("Refreshing expired transfer token");

        let call = self.authorizer.refresh_token(&refresh_token);
        let result = match limit {
            Some(limit) => match timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(?limit, "Transfer token refresh timed out");
                    return Err(AuthError::Timeout);
                }
            },
            None => call.await,
        };

        match result {
            Ok(grant) => {
                tokens.apply(grant, now);
                debug!(expiry = %tokens.expiry, "Transfer token refreshed");
                Ok(())
            }
            Err(AuthError::RefreshDenied(reason)) => {
                warn!(%reason, "Refresh token rejected, re-authorization required");
                tokens.denied = Some(reason.clone());
                Err(AuthError::RefreshDenied(reason))
            }
            Err(err) => Err(err),
        }
    }
}

impl Drop for TokenStore {
    fn drop(&mut self) {
        self.auth_token.zeroize();
    }
}

impl fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archeion_service::MemoryService;
    use futures::future::join_all;

    fn store_with_lifetime(lifetime: u64) -> (Arc<MemoryService>, TokenStore) {
        let service = Arc::new(MemoryService::new());
        service.set_token_lifetime(lifetime);
        let tokens = service.issue_tokens();
        let store = TokenStore::new(service.clone(), tokens, Utc::now());
        (service, store)
    }

    #[tokio::test]
    async fn test_is_valid_uses_expiry() {
        let (_service, store) = store_with_lifetime(3600);
        let now = Utc::now();

        assert!(store.is_valid(now).await);
        assert!(!store.is_valid(now + Duration::hours(2)).await);
    }

    #[tokio::test]
    async fn test_valid_token_does_not_refresh() {
        let (service, store) = store_with_lifetime(3600);

        let token = store.transfer_token().await.unwrap();
        assert_eq!(token, "transfer-token-1");
        assert_eq!(service.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_stale_token_is_refreshed() {
        let (service, store) = store_with_lifetime(0);
        service.set_token_lifetime(3600);

        let now = Utc::now();
        let token = store.transfer_token_at(now).await.unwrap();

        assert_eq!(token, "transfer-token-2");
        assert_eq!(service.refresh_calls(), 1);
        assert_eq!(store.transfer_expiry().await, now + Duration::seconds(3600));
    }

    #[tokio::test]
    async fn test_concurrent_callers_refresh_once() {
        let service = Arc::new(
            MemoryService::new().with_refresh_delay(std::time::Duration::from_millis(50)),
        );
        service.set_token_lifetime(0);
        let tokens = service.issue_tokens();
        service.set_token_lifetime(3600);
        let store = Arc::new(TokenStore::new(service.clone(), tokens, Utc::now()));

        let callers = (0..8).map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.transfer_token().await })
        });
        let results = join_all(callers).await;

        for result in results {
            assert_eq!(result.unwrap().unwrap(), "transfer-token-2");
        }
        assert_eq!(service.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_refresh_denied_latches() {
        let (service, store) = store_with_lifetime(0);
        service.revoke_refresh_token();

        assert!(matches!(
            store.transfer_token().await,
            Err(AuthError::RefreshDenied(_))
        ));
        assert!(matches!(
            store.transfer_token().await,
            Err(AuthError::RefreshDenied(_))
        ));
        assert!(matches!(
            store.refresh(Utc::now()).await,
            Err(AuthError::RefreshDenied(_))
        ));
        assert_eq!(service.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_network_failure_is_not_latched() {
        let (service, store) = store_with_lifetime(0);
        service.set_auth_network_down(true);

        assert!(matches!(
            store.transfer_token().await,
            Err(AuthError::NetworkError(_))
        ));

        service.set_auth_network_down(false);
        service.set_token_lifetime(3600);
        assert!(store.transfer_token().await.is_ok());
        assert_eq!(service.refresh_calls(), 2);
    }

    #[tokio::test]
    async fn test_stalled_refresh_times_out_without_latching() {
        let service = Arc::new(
            MemoryService::new().with_refresh_delay(std::time::Duration::from_secs(5)),
        );
        service.set_token_lifetime(0);
        let store = TokenStore::new(service.clone(), service.issue_tokens(), Utc::now());

        let started = std::time::Instant::now();
        let result = store
            .transfer_token_within(std::time::Duration::from_millis(50))
            .await;

        assert_eq!(result, Err(AuthError::Timeout));
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
        assert!(store.transfer.read().await.denied.is_none());
        assert!(store.transfer.try_write().is_ok());
    }

    #[tokio::test]
    async fn test_snapshot_round_trips_through_store() {
        let (service, store) = store_with_lifetime(3600);
        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.transfer_refresh_token.as_deref(), Some("refresh-token-1"));

        let json = serde_json::to_string(&snapshot).unwrap();
        let restored: StoredTokens = serde_json::from_str(&json).unwrap();
        let reloaded = TokenStore::from_stored(service, &restored);

        assert_eq!(reloaded.auth_token(), "auth-token-1");
        assert!(reloaded.is_valid(Utc::now()).await);
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let stored = StoredTokens {
            auth_token: "secret-auth".to_string(),
            transfer_token: "secret-transfer".to_string(),
            transfer_refresh_token: Some("secret-refresh".to_string()),
            transfer_expiry: Utc::now(),
        };
        let rendered = format!("{:?}", stored);
        assert!(!rendered.contains("secret"));
    }
}
