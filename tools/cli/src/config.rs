//! Configuration and token files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use archeion_auth::{SessionConfig, StoredTokens};
use archeion_service::globus::{AuthConfig, GlobusConfig};

/// Environment variable overriding the OAuth2 client id.
pub const CLIENT_ID_ENV: &str = "ARCHEION_CLIENT_ID";

/// Contents of `config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub auth: AuthConfig,
    pub transfer: GlobusConfig,
    pub session: SessionConfig,
    /// Open presented URLs in the default browser.
    pub open_browser: bool,
}

impl CliConfig {
    /// Apply a client id from the environment, if one is set.
    pub fn with_client_id(mut self, client_id: Option<String>) -> Self {
        if let Some(id) = client_id.filter(|id| !id.trim().is_empty()) {
            self.auth.client_id = id.trim().to_string();
        }
        self
    }
}

fn app_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("archeion"))
}

pub fn default_config_path() -> Option<PathBuf> {
    app_dir().map(|dir| dir.join("config.json"))
}

pub fn default_tokens_path() -> Option<PathBuf> {
    app_dir().map(|dir| dir.join("tokens.json"))
}

/// Load the configuration. A missing file yields the defaults.
pub async fn load_config(path: &Path) -> Result<CliConfig> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Ok(CliConfig::default());
    }

    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Invalid config file {}", path.display()))
}

/// Load persisted tokens, if any.
pub async fn load_tokens(path: &Path) -> Result<Option<StoredTokens>> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Ok(None);
    }

    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read token file {}", path.display()))?;
    let tokens = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid token file {}", path.display()))?;
    Ok(Some(tokens))
}

/// Persist tokens, readable by the owner only.
///
/// The tokens go to a sibling temp file created with mode 0600, which is
/// then renamed over `path`. Readers see either the old or the new file.
pub async fn save_tokens(path: &Path, tokens: &StoredTokens) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let json = serde_json::to_string_pretty(tokens)?;
    let staging = staging_path(path);
    // A leftover from an interrupted run would keep its old mode
    let _ = tokio::fs::remove_file(&staging).await;

    let written = write_private(&staging, json.as_bytes()).await;
    if let Err(e) = written {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(e).with_context(|| format!("Failed to write token file {}", path.display()));
    }

    tokio::fs::rename(&staging, path)
        .await
        .with_context(|| format!("Failed to replace token file {}", path.display()))
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "tokens.json".into());
    name.push(".tmp");
    path.with_file_name(name)
}

async fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(contents).await?;
    file.sync_all().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_config_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load_config(&dir.path().join("config.json")).await.unwrap();

        assert!(config.auth.client_id.is_empty());
        assert_eq!(config.session.max_code_attempts, 3);
        assert!(config.transfer.base_url.contains("transfer.api.globusonline.org"));
    }

    #[tokio::test]
    async fn test_partial_config_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(
            &path,
            r#"{"auth": {"client_id": "abc"}, "session": {"rpc_timeout_ms": 1500}}"#,
        )
        .await
        .unwrap();

        let config = load_config(&path).await.unwrap();
        assert_eq!(config.auth.client_id, "abc");
        assert_eq!(config.session.rpc_timeout(), Duration::from_millis(1500));
        assert_eq!(config.session.activation_margin_secs, 3600);
    }

    #[tokio::test]
    async fn test_invalid_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        assert!(load_config(&path).await.is_err());
    }

    #[test]
    fn test_env_client_id_overrides() {
        let config = CliConfig::default().with_client_id(Some(" from-env ".to_string()));
        assert_eq!(config.auth.client_id, "from-env");

        let unchanged = config.clone().with_client_id(Some(String::new()));
        assert_eq!(unchanged.auth.client_id, "from-env");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_existing_token_file_is_replaced_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tokens.json");
        std::fs::write(&path, "stale").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let tokens: StoredTokens = serde_json::from_str(
            r#"{"auth_token":"a","transfer_token":"t","transfer_expiry":"2030-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        save_tokens(&path, &tokens).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(load_tokens(&path).await.unwrap().unwrap(), tokens);
    }

    #[test]
    fn test_staging_path_is_a_sibling() {
        let path = Path::new("/home/user/.config/archeion/tokens.json");
        assert_eq!(
            staging_path(path),
            Path::new("/home/user/.config/archeion/tokens.json.tmp")
        );
    }

    #[tokio::test]
    async fn test_tokens_round_trip_through_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("tokens.json");
        assert!(load_tokens(&path).await.unwrap().is_none());

        let tokens: StoredTokens = serde_json::from_str(
            r#"{
                "auth_token": "a",
                "transfer_token": "t",
                "transfer_refresh_token": "r",
                "transfer_expiry": "2030-01-01T00:00:00Z"
            }"#,
        )
        .unwrap();
        save_tokens(&path, &tokens).await.unwrap();

        let loaded = load_tokens(&path).await.unwrap().unwrap();
        assert_eq!(loaded, tokens);
        assert!(!staging_path(&path).exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
