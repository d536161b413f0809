//! OAuth2 native-app authentication against Globus Auth.

use async_trait::async_trait;
use oauth2::basic::{
    BasicErrorResponse, BasicErrorResponseType, BasicRevocationErrorResponse,
    BasicTokenIntrospectionResponse, BasicTokenType,
};
use oauth2::{
    AuthUrl, AuthorizationCode, Client, ClientId, CsrfToken, EndpointNotSet, EndpointSet,
    ExtraTokenFields, PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, RefreshToken,
    RequestTokenError, Scope, StandardRevocableToken, StandardTokenResponse, TokenResponse,
    TokenUrl,
};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

use archeion_common::{AuthError, BackendError};

use crate::service::{AuthorizationService, TokenGrant, TokenSet, UserInfo};

/// OAuth2 authorization endpoint.
const GLOBUS_AUTH_URL: &str = "https://auth.globus.org/v2/oauth2/authorize";
/// OAuth2 token endpoint.
const GLOBUS_TOKEN_URL: &str = "https://auth.globus.org/v2/oauth2/token";
/// OpenID userinfo endpoint.
const GLOBUS_USERINFO_URL: &str = "https://auth.globus.org/v2/oauth2/userinfo";
/// Redirect URL for native apps: Globus displays the code for copy/paste.
const NATIVE_APP_REDIRECT_URL: &str = "https://auth.globus.org/v2/web/auth-code";

/// Resource server of identity-scoped tokens.
const AUTH_RESOURCE_SERVER: &str = "auth.globus.org";
/// Resource server of transfer-scoped tokens.
const TRANSFER_RESOURCE_SERVER: &str = "transfer.api.globus.org";

/// Upper bound on any single request to Globus Auth.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifetime assumed when the token response omits `expires_in`.
const DEFAULT_EXPIRES_IN: u64 = 48 * 3600;

fn default_scopes() -> Vec<String> {
    vec![
        "openid".to_string(),
        "profile".to_string(),
        "email".to_string(),
        "urn:globus:auth:scope:transfer.api.globus.org:all".to_string(),
    ]
}

/// Configuration for OAuth2 authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Native app client ID registered with Globus.
    pub client_id: String,
    /// Redirect URL for the OAuth2 callback.
    #[serde(default = "AuthConfig::default_redirect_url")]
    pub redirect_url: String,
    /// Requested scopes.
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "AuthConfig::default_auth_url")]
    pub auth_url: String,
    #[serde(default = "AuthConfig::default_token_url")]
    pub token_url: String,
    #[serde(default = "AuthConfig::default_userinfo_url")]
    pub userinfo_url: String,
}

impl AuthConfig {
    /// Default configuration for a client id.
    pub fn for_client(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Self::default()
        }
    }

    fn default_redirect_url() -> String {
        NATIVE_APP_REDIRECT_URL.to_string()
    }

    fn default_auth_url() -> String {
        GLOBUS_AUTH_URL.to_string()
    }

    fn default_token_url() -> String {
        GLOBUS_TOKEN_URL.to_string()
    }

    fn default_userinfo_url() -> String {
        GLOBUS_USERINFO_URL.to_string()
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            redirect_url: Self::default_redirect_url(),
            scopes: default_scopes(),
            auth_url: Self::default_auth_url(),
            token_url: Self::default_token_url(),
            userinfo_url: Self::default_userinfo_url(),
        }
    }
}

/// A token for one resource server, nested in Globus token responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceToken {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    pub resource_server: String,
}

/// Globus-specific fields of a token response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobusTokenFields {
    #[serde(default)]
    pub resource_server: Option<String>,
    #[serde(default)]
    pub other_tokens: Vec<ResourceToken>,
}

impl ExtraTokenFields for GlobusTokenFields {}

type GlobusTokenResponse = StandardTokenResponse<GlobusTokenFields, BasicTokenType>;

type GlobusOAuthClient = Client<
    BasicErrorResponse,
    GlobusTokenResponse,
    BasicTokenIntrospectionResponse,
    StandardRevocableToken,
    BasicRevocationErrorResponse,
    EndpointSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointNotSet,
    EndpointSet,
>;

/// How a token request failed.
enum Rejection {
    /// The authorization server answered with an OAuth2 error.
    Server {
        error: BasicErrorResponseType,
        detail: String,
    },
    /// No usable answer (transport, parse).
    Transport(String),
}

fn classify<RE>(err: RequestTokenError<RE, BasicErrorResponse>) -> Rejection
where
    RE: std::error::Error + 'static,
{
    match err {
        RequestTokenError::ServerResponse(response) => Rejection::Server {
            detail: response.to_string(),
            error: response.error().clone(),
        },
        other => Rejection::Transport(other.to_string()),
    }
}

/// Flatten a token response into `(resource_server, token)` pairs.
fn resource_tokens(response: &GlobusTokenResponse) -> Vec<ResourceToken> {
    let primary = ResourceToken {
        access_token: response.access_token().secret().clone(),
        refresh_token: response.refresh_token().map(|t| t.secret().clone()),
        expires_in: response.expires_in().map(|d| d.as_secs()),
        resource_server: response
            .extra_fields()
            .resource_server
            .clone()
            .unwrap_or_else(|| TRANSFER_RESOURCE_SERVER.to_string()),
    };

    std::iter::once(primary)
        .chain(response.extra_fields().other_tokens.iter().cloned())
        .collect()
}

/// Globus Auth client for the native-app authorization-code flow.
pub struct GlobusAuth {
    client: GlobusOAuthClient,
    http: oauth2::reqwest::Client,
    api: reqwest::Client,
    config: AuthConfig,
    /// PKCE verifier of the flow in progress.
    verifier: Mutex<Option<String>>,
}

impl GlobusAuth {
    /// Create a new authentication client.
    ///
    /// # Errors
    /// - Missing client id
    /// - Malformed URLs in the configuration
    pub fn new(config: AuthConfig) -> Result<Self, AuthError> {
        if config.client_id.trim().is_empty() {
            return Err(AuthError::Configuration(
                "A Globus native app client id is required".to_string(),
            ));
        }

        let client: GlobusOAuthClient = Client::new(ClientId::new(config.client_id.clone()))
            .set_auth_uri(
                AuthUrl::new(config.auth_url.clone())
                    .map_err(|e| AuthError::Configuration(format!("Invalid auth URL: {}", e)))?,
            )
            .set_token_uri(
                TokenUrl::new(config.token_url.clone())
                    .map_err(|e| AuthError::Configuration(format!("Invalid token URL: {}", e)))?,
            )
            .set_redirect_uri(
                RedirectUrl::new(config.redirect_url.clone()).map_err(|e| {
                    AuthError::Configuration(format!("Invalid redirect URL: {}", e))
                })?,
            );

        // Redirects must not be followed on token requests (SSRF).
        let http = oauth2::reqwest::ClientBuilder::new()
            .redirect(oauth2::reqwest::redirect::Policy::none())
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| AuthError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        let api = reqwest::Client::builder()
            .user_agent(concat!("archeion/", env!("CARGO_PKG_VERSION")))
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| AuthError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            http,
            api,
            config,
            verifier: Mutex::new(None),
        })
    }

    /// Get the current configuration.
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }
}

#[async_trait]
impl AuthorizationService for GlobusAuth {
    fn authorize_url(&self) -> Result<String, AuthError> {
        let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();

        let (url, _csrf) = self
            .client
            .authorize_url(CsrfToken::new_random)
            .add_scopes(self.config.scopes.iter().cloned().map(Scope::new))
            .set_pkce_challenge(challenge)
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "login")
            .url();

        *self.verifier.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(verifier.secret().clone());

        Ok(url.to_string())
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenSet, AuthError> {
        let verifier = self
            .verifier
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| {
                AuthError::InvalidCode("No authorization flow in progress".to_string())
            })?;

        let response = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .set_pkce_verifier(PkceCodeVerifier::new(verifier))
            .request_async(&self.http)
            .await
            .map_err(|e| match classify(e) {
                Rejection::Server { detail, .. } => AuthError::InvalidCode(detail),
                Rejection::Transport(detail) => AuthError::NetworkError(detail),
            })?;

        let tokens = resource_tokens(&response);
        let transfer = tokens
            .iter()
            .find(|t| t.resource_server == TRANSFER_RESOURCE_SERVER)
            .ok_or_else(|| {
                AuthError::InvalidCode("The grant does not include the transfer scope".to_string())
            })?;
        let refresh_token = transfer.refresh_token.clone().ok_or_else(|| {
            AuthError::InvalidCode(
                "No refresh token received. Ensure offline access was requested.".to_string(),
            )
        })?;
        let auth_token = tokens
            .iter()
            .find(|t| t.resource_server == AUTH_RESOURCE_SERVER)
            .unwrap_or(transfer)
            .access_token
            .clone();

        *self.verifier.lock().unwrap_or_else(PoisonError::into_inner) = None;
        info!("Authorization code exchanged");

        Ok(TokenSet {
            auth_token,
            transfer: TokenGrant {
                access_token: transfer.access_token.clone(),
                refresh_token: Some(refresh_token),
                expires_in: transfer.expires_in.unwrap_or(DEFAULT_EXPIRES_IN),
            },
        })
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant, AuthError> {
        let response = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(&self.http)
            .await
            .map_err(|e| match classify(e) {
                Rejection::Server {
                    error:
                        BasicErrorResponseType::InvalidGrant
                        | BasicErrorResponseType::InvalidClient
                        | BasicErrorResponseType::UnauthorizedClient,
                    detail,
                } => AuthError::RefreshDenied(detail),
                Rejection::Server { detail, .. } => AuthError::NetworkError(detail),
                Rejection::Transport(detail) => AuthError::NetworkError(detail),
            })?;

        debug!("Transfer token refreshed");

        Ok(TokenGrant {
            access_token: response.access_token().secret().clone(),
            // Refresh tokens may or may not be rotated
            refresh_token: response.refresh_token().map(|t| t.secret().clone()),
            expires_in: response
                .expires_in()
                .map(|d| d.as_secs())
                .unwrap_or(DEFAULT_EXPIRES_IN),
        })
    }

    async fn userinfo(&self, auth_token: &str) -> Result<UserInfo, BackendError> {
        let response = self
            .api
            .get(&self.config.userinfo_url)
            .bearer_auth(auth_token)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout
                } else {
                    BackendError::Network(format!("Failed to fetch userinfo: {}", e))
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(BackendError::Unauthorized("Invalid or expired token".to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Service {
                code: status.as_u16().to_string(),
                message: body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(format!("Failed to parse userinfo: {}", e)))
    }
}
