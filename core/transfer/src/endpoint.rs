//! Endpoint handles.
//!
//! An [`EndpointHandle`] binds one endpoint id to a session's transfer
//! capability. It owns the endpoint's activation state and re-activates
//! lazily whenever the service reports that activation lapsed.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn, Instrument, Span};

use archeion_auth::{AuthSession, Prompt, SessionConfig, TransferCapability};
use archeion_common::{
    ActivationError, ActivationState, BackendError, DirListing, EndpointId, EntryKind,
    OperationError,
};
use archeion_service::{
    ActivationOutcome, AuthorizationService, EndpointSearch, TransferService,
};

/// Web page where users activate endpoints by hand.
const ACTIVATION_URL: &str = "https://app.globus.org/file-manager?origin_id=";

/// A remote endpoint bound to an authorized session.
pub struct EndpointHandle {
    id: EndpointId,
    transfer: TransferCapability,
    prompt: Arc<dyn Prompt>,
    activation_margin: u64,
    state: Mutex<ActivationState>,
    span: Span,
}

impl EndpointHandle {
    /// Bind `id` to `session` and activate the endpoint.
    ///
    /// # Errors
    /// - `UserCancelled` if the user aborts manual activation
    /// - `Backend` / `Timeout` if the activation call fails
    pub async fn new(id: EndpointId, session: &AuthSession) -> Result<Self, ActivationError> {
        let handle = Self::deferred(id, session);
        handle.activate(handle.activation_margin).await?;
        Ok(handle)
    }

    /// Bind `id` to `session` without activating.
    ///
    /// The first file operation activates the endpoint.
    pub fn deferred(id: EndpointId, session: &AuthSession) -> Self {
        let span = tracing::info_span!("endpoint", id = %id);
        Self {
            id,
            transfer: session.transfer_capability(),
            prompt: session.prompt(),
            activation_margin: session.config().activation_margin_secs,
            state: Mutex::new(ActivationState::Unknown),
            span,
        }
    }

    /// Authorize a brand-new session, then bind and activate `id`.
    ///
    /// # Errors
    /// - `Auth` if the authorization flow fails
    /// - any activation error of [`EndpointHandle::new`]
    pub async fn bootstrap(
        id: EndpointId,
        authorizer: Arc<dyn AuthorizationService>,
        service: Arc<dyn TransferService>,
        prompt: Arc<dyn Prompt>,
        config: SessionConfig,
    ) -> Result<Self, ActivationError> {
        let session = AuthSession::authorize(authorizer, service, prompt, config).await?;
        Self::new(id, &session).await
    }

    pub fn id(&self) -> &EndpointId {
        &self.id
    }

    pub fn capability(&self) -> &TransferCapability {
        &self.transfer
    }

    pub async fn state(&self) -> ActivationState {
        *self.state.lock().await
    }

    pub async fn is_active(&self) -> bool {
        self.state().await == ActivationState::Active
    }

    /// URL where the user can activate this endpoint by hand.
    pub fn activation_url(&self) -> String {
        format!("{}{}", ACTIVATION_URL, self.id)
    }

    /// Activate the endpoint unless it stays active for
    /// `expiry_margin_secs` seconds.
    ///
    /// When the service cannot activate automatically the activation URL is
    /// presented and the call waits for the user to confirm, then tries
    /// again. Concurrent calls on one handle are serialized.
    ///
    /// # Postconditions
    /// - On success the state is `Active`
    ///
    /// # Errors
    /// - `UserCancelled` if the user aborts at the confirmation prompt
    /// - `Backend` on service failures and unrecognized activation codes
    /// - `Timeout` if the activation call timed out
    pub async fn activate(&self, expiry_margin_secs: u64) -> Result<(), ActivationError> {
        let mut state = self.state.lock().await;
        self.activate_locked(&mut state, expiry_margin_secs)
            .instrument(self.span.clone())
            .await
    }

    /// Activate only if the endpoint is not known to be active.
    pub async fn ensure_active(&self) -> Result<(), ActivationError> {
        let mut state = self.state.lock().await;
        if *state == ActivationState::Active {
            return Ok(());
        }
        self.activate_locked(&mut state, self.activation_margin)
            .instrument(self.span.clone())
            .await
    }

    async fn activate_locked(
        &self,
        state: &mut ActivationState,
        expiry_margin_secs: u64,
    ) -> Result<(), ActivationError> {
        loop {
            let result = self
                .transfer
                .endpoint_autoactivate(&self.id, expiry_margin_secs)
                .await?;

            match result.outcome() {
                ActivationOutcome::Activated => {
                    *state = ActivationState::Active;
                    info!(code = %result.code, "Endpoint activated");
                    return Ok(());
                }
                ActivationOutcome::ManualRequired => {
                    *state = ActivationState::RequiresManualActivation;
                    info!("Endpoint requires manual activation");

                    self.prompt
                        .present_url(
                            "Endpoint requires manual activation, please open the following URL in a browser to activate the endpoint:",
                            &self.activation_url(),
                        )
                        .await
                        .map_err(|e| ActivationError::Prompt(e.to_string()))?;

                    let answer = self
                        .prompt
                        .read_line("Press ENTER after activating the endpoint (q to cancel): ")
                        .await
                        .map_err(|e| ActivationError::Prompt(e.to_string()))?;

                    if answer.is_none() {
                        info!("Manual activation cancelled");
                        return Err(ActivationError::UserCancelled);
                    }
                }
                ActivationOutcome::Unrecognized(code) => {
                    *state = ActivationState::Unknown;
                    return Err(ActivationError::Backend(format!(
                        "Unrecognized activation code '{}': {}",
                        code, result.message
                    )));
                }
            }
        }
    }

    async fn mark_lapsed(&self) {
        *self.state.lock().await = ActivationState::Unknown;
    }

    /// Run `op` on an active endpoint, re-activating once if the service
    /// reports that activation lapsed.
    async fn with_activation<T, F, Fut>(&self, op: F) -> Result<T, OperationError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
    {
        self.ensure_active().await?;

        match op().await {
            Err(OperationError::ActivationRequired(detail)) => {
                warn!(%detail, "Endpoint activation lapsed, re-activating");
                self.mark_lapsed().await;
                self.ensure_active().await?;
                op().await
            }
            other => other,
        }
    }

    /// Entries of `path`, split into files and folders. Not recursive.
    ///
    /// Invalid symlinks are neither: they have no target to open or descend
    /// into, so they appear in neither list.
    pub async fn list(&self, path: &str) -> Result<DirListing, OperationError> {
        let entries = self
            .with_activation(move || self.transfer.list_directory(&self.id, path))
            .instrument(self.span.clone())
            .await?;

        let mut listing = DirListing::default();
        for entry in entries {
            match entry.kind {
                EntryKind::File => listing.files.push(entry.name),
                EntryKind::Dir => listing.folders.push(entry.name),
                EntryKind::InvalidSymlink => debug!(name = %entry.name, "Skipping invalid symlink"),
            }
        }
        Ok(listing)
    }

    /// Create the directory `path`. Succeeds if it already exists.
    pub async fn make_dir(&self, path: &str) -> Result<(), OperationError> {
        self.with_activation(move || async move {
            match self.transfer.make_directory(&self.id, path).await? {
                Ok(()) => {
                    debug!(path, "Directory created");
                    Ok(())
                }
                Err(BackendError::AlreadyExists(_)) => {
                    debug!(path, "Directory already exists");
                    Ok(())
                }
                Err(err) => Err(err.into()),
            }
        })
        .instrument(self.span.clone())
        .await
    }

    /// Rename or move `old_path` to `new_path`.
    ///
    /// Not idempotent: a timeout leaves it unknown whether the rename
    /// happened.
    pub async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), OperationError> {
        self.with_activation(move || self.transfer.rename(&self.id, old_path, new_path))
            .instrument(self.span.clone())
            .await
    }

    /// Display name of the endpoint, falling back to its canonical name.
    pub async fn describe(&self) -> Result<String, OperationError> {
        let summary = self
            .transfer
            .get_endpoint(&self.id)
            .instrument(self.span.clone())
            .await?;
        Ok(summary.name())
    }
}

impl std::fmt::Debug for EndpointHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointHandle")
            .field("id", &self.id)
            .field("backend", &self.transfer.backend_name())
            .finish_non_exhaustive()
    }
}

/// Search endpoints and map their names to ids.
///
/// Later results with the same name replace earlier ones.
pub async fn search_endpoints(
    transfer: &TransferCapability,
    search: &EndpointSearch,
) -> Result<BTreeMap<String, EndpointId>, OperationError> {
    let results = transfer.endpoint_search(search).await?;
    debug!(count = results.len(), "Endpoint search finished");

    Ok(results
        .into_iter()
        .map(|summary| (summary.name(), summary.id))
        .collect())
}
