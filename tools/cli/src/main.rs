//! Archeion CLI - Command line interface for Globus transfers.
//!
//! Logs in through Globus Auth, operates on endpoints and submits and
//! monitors transfers between them.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use archeion_auth::{AuthSession, ConsolePrompt};
use archeion_common::{EndpointId, SyncLevel, TaskId};
use archeion_service::globus::{GlobusAuth, GlobusClient};
use archeion_service::EndpointSearch;
use archeion_transfer::{
    search_endpoints, EndpointHandle, TransferJob, TransferStatus, DEFAULT_MAX_CHECKSUM_RETRIES,
};

use crate::config::CliConfig;

#[derive(Parser)]
#[command(name = "archeion")]
#[command(about = "Archeion - Globus transfer orchestration")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (default: <config dir>/archeion/config.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Token file (default: <config dir>/archeion/tokens.json).
    #[arg(long, global = true)]
    tokens: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in and store tokens.
    Login,

    /// Show the logged-in identity.
    Whoami,

    /// Search endpoints by name.
    Search {
        /// Text to search for.
        query: Option<String>,

        /// Only endpoints you own.
        #[arg(long)]
        mine: bool,

        /// Maximum number of results.
        #[arg(short, long, default_value_t = 25)]
        limit: u32,
    },

    /// List a directory on an endpoint.
    Ls {
        endpoint: EndpointId,

        #[arg(default_value = "/")]
        path: String,
    },

    /// Create a directory on an endpoint.
    Mkdir { endpoint: EndpointId, path: String },

    /// Rename or move a path on an endpoint.
    Mv {
        endpoint: EndpointId,
        old_path: String,
        new_path: String,
    },

    /// Transfer files between two endpoints.
    Transfer {
        source: EndpointId,
        destination: EndpointId,

        /// Path pair as SOURCE_PATH:DESTINATION_PATH (repeatable).
        #[arg(short, long = "item", value_parser = parse_item, required = true)]
        items: Vec<(String, String)>,

        /// Label shown in the Globus web app.
        #[arg(long, default_value = "archeion transfer")]
        label: String,

        /// exists, size, mtime or checksum.
        #[arg(long, default_value = "checksum")]
        sync_level: SyncLevel,

        /// Skip checksum verification after transfer.
        #[arg(long)]
        no_verify: bool,

        /// Encrypt data in transit.
        #[arg(long)]
        encrypt: bool,

        /// Do not descend into directories.
        #[arg(long)]
        no_recursive: bool,

        /// Wait for the transfer to finish.
        #[arg(short, long)]
        wait: bool,

        /// Seconds between status checks with --wait.
        #[arg(long, default_value_t = 10)]
        poll_interval: u64,
    },

    /// Show the status of a transfer task.
    Status { task_id: String },
}

fn parse_item(value: &str) -> Result<(String, String), String> {
    match value.split_once(':') {
        Some((source, destination)) if !source.is_empty() && !destination.is_empty() => {
            Ok((source.to_string(), destination.to_string()))
        }
        _ => Err(format!(
            "Invalid item '{}'. Use SOURCE_PATH:DESTINATION_PATH",
            value
        )),
    }
}

/// Backends and prompt shared by every command.
struct App {
    config: CliConfig,
    tokens_path: PathBuf,
    authorizer: Arc<GlobusAuth>,
    service: Arc<GlobusClient>,
    prompt: Arc<ConsolePrompt>,
}

impl App {
    async fn load(cli: &Cli) -> Result<Self> {
        let config_path = match &cli.config {
            Some(path) => path.clone(),
            None => config::default_config_path().context("No config directory available")?,
        };
        let tokens_path = match &cli.tokens {
            Some(path) => path.clone(),
            None => config::default_tokens_path().context("No config directory available")?,
        };

        let config = config::load_config(&config_path)
            .await?
            .with_client_id(std::env::var(config::CLIENT_ID_ENV).ok());

        if config.auth.client_id.is_empty() {
            anyhow::bail!(
                "No client id configured. Set {} or add auth.client_id to {}",
                config::CLIENT_ID_ENV,
                config_path.display()
            );
        }

        let authorizer =
            GlobusAuth::new(config.auth.clone()).context("Failed to set up Globus Auth")?;
        let service = GlobusClient::new(config.transfer.clone())
            .context("Failed to set up Globus Transfer client")?;
        let prompt = ConsolePrompt::new().with_browser(config.open_browser);

        Ok(Self {
            config,
            tokens_path,
            authorizer: Arc::new(authorizer),
            service: Arc::new(service),
            prompt: Arc::new(prompt),
        })
    }

    /// Session from stored tokens, or a fresh login.
    async fn session(&self, force_login: bool) -> Result<AuthSession> {
        if !force_login {
            if let Some(stored) = config::load_tokens(&self.tokens_path).await? {
                info!("Using stored tokens from {}", self.tokens_path.display());
                return Ok(AuthSession::from_tokens(
                    &stored,
                    self.authorizer.clone(),
                    self.service.clone(),
                    self.prompt.clone(),
                    self.config.session.clone(),
                ));
            }
        }

        AuthSession::authorize(
            self.authorizer.clone(),
            self.service.clone(),
            self.prompt.clone(),
            self.config.session.clone(),
        )
        .await
        .context("Authorization failed")
    }

    /// Write the session's current tokens back to the token file.
    async fn save(&self, session: &AuthSession) -> Result<()> {
        let snapshot = session.tokens().snapshot().await;
        config::save_tokens(&self.tokens_path, &snapshot).await
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let app = App::load(&cli).await?;
    let session = app.session(matches!(cli.command, Commands::Login)).await?;

    let result = match cli.command {
        Commands::Login | Commands::Whoami => cmd_whoami(&session).await,

        Commands::Search { query, mine, limit } => {
            cmd_search(&session, query, mine, limit).await
        }

        Commands::Ls { endpoint, path } => cmd_ls(&session, endpoint, &path).await,

        Commands::Mkdir { endpoint, path } => cmd_mkdir(&session, endpoint, &path).await,

        Commands::Mv {
            endpoint,
            old_path,
            new_path,
        } => cmd_mv(&session, endpoint, &old_path, &new_path).await,

        Commands::Transfer {
            source,
            destination,
            items,
            label,
            sync_level,
            no_verify,
            encrypt,
            no_recursive,
            wait,
            poll_interval,
        } => {
            let options = TransferOptions {
                label,
                sync_level,
                verify_checksum: !no_verify,
                encrypt_data: encrypt,
                recursive: !no_recursive,
                wait: wait.then(|| Duration::from_secs(poll_interval.max(1))),
            };
            cmd_transfer(&session, source, destination, items, options).await
        }

        Commands::Status { task_id } => cmd_status(&session, &task_id).await,
    };

    // Refreshed tokens are worth keeping even if the command failed
    if let Err(e) = app.save(&session).await {
        warn!("Could not save tokens: {:#}", e);
    }

    result
}

/// Show the logged-in identity.
async fn cmd_whoami(session: &AuthSession) -> Result<()> {
    let user = session
        .identity_capability()
        .userinfo()
        .await
        .context("Failed to fetch identity")?;

    println!("Logged in as:");
    println!("  Username: {}", user.preferred_username.as_deref().unwrap_or("-"));
    println!("  Name: {}", user.name.as_deref().unwrap_or("-"));
    println!("  Email: {}", user.email.as_deref().unwrap_or("-"));
    println!("  ID: {}", user.sub);

    Ok(())
}

/// Search endpoints.
async fn cmd_search(
    session: &AuthSession,
    query: Option<String>,
    mine: bool,
    limit: u32,
) -> Result<()> {
    let search = match (query, mine) {
        (Some(query), true) => EndpointSearch {
            query: Some(query),
            ..EndpointSearch::mine(limit)
        },
        (None, true) => EndpointSearch::mine(limit),
        (Some(query), false) => EndpointSearch::fulltext(query).with_limit(limit),
        (None, false) => anyhow::bail!("Give a search query or --mine"),
    };

    let results = search_endpoints(&session.transfer_capability(), &search)
        .await
        .context("Endpoint search failed")?;

    if results.is_empty() {
        println!("No endpoints found.");
    } else {
        for (name, id) in results {
            println!("  {}  {}", id, name);
        }
    }

    Ok(())
}

/// List directory contents.
async fn cmd_ls(session: &AuthSession, endpoint: EndpointId, path: &str) -> Result<()> {
    let handle = EndpointHandle::new(endpoint, session)
        .await
        .context("Failed to activate endpoint")?;

    let listing = handle
        .list(path)
        .await
        .with_context(|| format!("Failed to list {}", path))?;

    if listing.files.is_empty() && listing.folders.is_empty() {
        println!("Directory is empty.");
    } else {
        println!("Contents of {}:", path);
        for folder in &listing.folders {
            println!("  [DIR]  {}/", folder);
        }
        for file in &listing.files {
            println!("  [FILE] {}", file);
        }
    }

    Ok(())
}

/// Create a directory.
async fn cmd_mkdir(session: &AuthSession, endpoint: EndpointId, path: &str) -> Result<()> {
    info!("Creating directory: {}", path);

    let handle = EndpointHandle::new(endpoint, session)
        .await
        .context("Failed to activate endpoint")?;

    handle
        .make_dir(path)
        .await
        .context("Failed to create directory")?;

    println!("Directory created: {}", path);

    Ok(())
}

/// Rename a path.
async fn cmd_mv(
    session: &AuthSession,
    endpoint: EndpointId,
    old_path: &str,
    new_path: &str,
) -> Result<()> {
    info!("Renaming {} to {}", old_path, new_path);

    let handle = EndpointHandle::new(endpoint, session)
        .await
        .context("Failed to activate endpoint")?;

    handle
        .rename(old_path, new_path)
        .await
        .context("Failed to rename")?;

    println!("Renamed {} -> {}", old_path, new_path);

    Ok(())
}

struct TransferOptions {
    label: String,
    sync_level: SyncLevel,
    verify_checksum: bool,
    encrypt_data: bool,
    recursive: bool,
    wait: Option<Duration>,
}

/// Submit a transfer.
async fn cmd_transfer(
    session: &AuthSession,
    source: EndpointId,
    destination: EndpointId,
    items: Vec<(String, String)>,
    options: TransferOptions,
) -> Result<()> {
    let source = EndpointHandle::new(source, session)
        .await
        .context("Failed to activate source endpoint")?;
    let destination = EndpointHandle::new(destination, session)
        .await
        .context("Failed to activate destination endpoint")?;

    let job = TransferJob::new(
        Arc::new(source),
        Arc::new(destination),
        options.label,
        options.sync_level,
        options.verify_checksum,
        options.encrypt_data,
    )
    .await
    .context("Failed to prepare transfer")?;

    for (source_path, destination_path) in items {
        job.add_item(source_path, destination_path, options.recursive)
            .await?;
    }

    let receipt = job.submit().await.context("Failed to submit transfer")?;

    println!("Transfer submitted!");
    println!("  Task: {}", receipt.task_id);
    println!("  Submission: {}", receipt.submission_id);
    println!("  Outcome: {:?}", receipt.outcome);

    if let Some(interval) = options.wait {
        info!("Waiting for task {}", receipt.task_id);
        let status = job.wait(interval).await.context("Failed to read task status")?;
        println!("  Status: {}", status);
        if !matches!(status.state, archeion_transfer::JobState::Succeeded) {
            anyhow::bail!("Transfer did not succeed: {}", status);
        }
    }

    Ok(())
}

/// Show task status.
async fn cmd_status(session: &AuthSession, task_id: &str) -> Result<()> {
    let task_id = TaskId::new(task_id);
    let events = session
        .transfer_capability()
        .task_status(&task_id)
        .await
        .context("Failed to read task status")?;

    let status = TransferStatus::from_events(&events, DEFAULT_MAX_CHECKSUM_RETRIES);

    println!("Task {}:", task_id);
    println!("  Status: {}", status.state);
    if !status.code.is_empty() {
        println!("  Code: {}", status.code);
    }
    if !status.detail.is_empty() {
        println!("  Detail: {}", status.detail);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_item() {
        assert_eq!(
            parse_item("/data:/backup/data").unwrap(),
            ("/data".to_string(), "/backup/data".to_string())
        );
        assert!(parse_item("/data").is_err());
        assert!(parse_item(":/backup").is_err());
    }

    #[test]
    fn test_transfer_arguments() {
        let cli = Cli::try_parse_from([
            "archeion",
            "transfer",
            "499930f1-5c43-11e7-bf29-22000b9a448b",
            "ddb59aef-6d04-11e5-ba46-22000b92c6ec",
            "--item",
            "/a:/b",
            "--item",
            "/c:/d",
            "--sync-level",
            "mtime",
            "--wait",
        ])
        .unwrap();

        match cli.command {
            Commands::Transfer {
                items,
                sync_level,
                wait,
                ..
            } => {
                assert_eq!(items.len(), 2);
                assert_eq!(sync_level, SyncLevel::ModTime);
                assert!(wait);
            }
            _ => panic!("expected transfer command"),
        }
    }

    #[test]
    fn test_endpoint_ids_are_validated() {
        assert!(Cli::try_parse_from(["archeion", "ls", "not-a-uuid"]).is_err());
    }
}
