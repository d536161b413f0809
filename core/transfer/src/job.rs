//! Bulk transfer jobs.
//!
//! A [`TransferJob`] collects path pairs between two active endpoints and
//! submits them as one task. The submission id is obtained when the job is
//! built, so re-sending after a transport failure can never create a second
//! task.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn, Instrument, Span};

use archeion_auth::TransferCapability;
use archeion_common::{
    ActivationError, BackendError, OperationError, StateError, SubmissionId, SubmitError,
    SyncLevel, TaskId, TransferItem, ValidationError,
};
use archeion_service::{SubmitResponse, TransferRequest};

use crate::endpoint::EndpointHandle;
use crate::retry::{RetryConfig, RetryExecutor};
use crate::status::{JobState, TransferStatus};

/// Default bound on checksum mismatches before a task is given up.
pub const DEFAULT_MAX_CHECKSUM_RETRIES: u32 = 3;

/// How the service answered an accepted submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmissionOutcome {
    Accepted,
    /// The submission id was already used; the earlier task stands.
    Duplicate,
}

/// Proof of a successful submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    pub task_id: TaskId,
    pub submission_id: SubmissionId,
    pub outcome: SubmissionOutcome,
    pub message: String,
}

struct JobInner {
    state: JobState,
    items: Vec<TransferItem>,
    receipt: Option<SubmissionReceipt>,
    last_status: Option<TransferStatus>,
}

/// A transfer between two endpoints.
pub struct TransferJob {
    source: Arc<EndpointHandle>,
    destination: Arc<EndpointHandle>,
    label: String,
    sync_level: SyncLevel,
    verify_checksum: bool,
    encrypt_data: bool,
    submission_id: SubmissionId,
    transfer: TransferCapability,
    retry: RetryConfig,
    max_checksum_retries: u32,
    inner: Mutex<JobInner>,
    span: Span,
}

fn is_transport_failure(err: &SubmitError) -> bool {
    match err {
        SubmitError::Operation(OperationError::Timeout) => true,
        SubmitError::Operation(OperationError::Backend(backend)) => backend.is_transport(),
        _ => false,
    }
}

fn classify_submit_failure(err: BackendError) -> SubmitError {
    match err {
        BackendError::Service { code, message } => {
            SubmitError::Rejected(format!("{}: {}", code, message))
        }
        BackendError::NotFound(detail) => SubmitError::Rejected(detail),
        other => SubmitError::Operation(other.into()),
    }
}

fn receipt_from(
    response: SubmitResponse,
    submission_id: &SubmissionId,
) -> Result<SubmissionReceipt, SubmitError> {
    let outcome = match response.code.as_str() {
        "Accepted" => SubmissionOutcome::Accepted,
        "Duplicate" => SubmissionOutcome::Duplicate,
        other => {
            return Err(SubmitError::Rejected(format!(
                "Unexpected submission code '{}': {}",
                other, response.message
            )))
        }
    };

    Ok(SubmissionReceipt {
        task_id: response.task_id,
        submission_id: submission_id.clone(),
        outcome,
        message: response.message,
    })
}

impl TransferJob {
    /// Create a job between two active endpoints.
    ///
    /// # Preconditions
    /// - Both handles are `Active`
    ///
    /// # Postconditions
    /// - The job is `Building` and holds its own submission id
    ///
    /// # Errors
    /// - `SameEndpoint` if both handles name the same endpoint
    /// - `NotActive` if either handle is not active
    /// - `SubmissionId` if the service did not hand out a submission id
    pub async fn new(
        source: Arc<EndpointHandle>,
        destination: Arc<EndpointHandle>,
        label: impl Into<String>,
        sync_level: SyncLevel,
        verify_checksum: bool,
        encrypt_data: bool,
    ) -> Result<Self, ValidationError> {
        if source.id() == destination.id() {
            return Err(ValidationError::SameEndpoint(source.id().clone()));
        }
        for handle in [&source, &destination] {
            if !handle.is_active().await {
                return Err(ValidationError::NotActive(handle.id().clone()));
            }
        }

        let label = label.into();
        let span = tracing::info_span!("transfer", label = %label);
        let transfer = source.capability().clone();

        let submission_id = transfer
            .get_submission_id()
            .instrument(span.clone())
            .await
            .map_err(ValidationError::SubmissionId)?;
        debug!(parent: &span, submission_id = %submission_id, "Transfer job created");

        Ok(Self {
            source,
            destination,
            label,
            sync_level,
            verify_checksum,
            encrypt_data,
            submission_id,
            transfer,
            retry: RetryConfig::default(),
            max_checksum_retries: DEFAULT_MAX_CHECKSUM_RETRIES,
            inner: Mutex::new(JobInner {
                state: JobState::Building,
                items: Vec::new(),
                receipt: None,
                last_status: None,
            }),
            span,
        })
    }

    /// Backoff used when re-sending the submission.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Checksum mismatches tolerated before the task counts as failed.
    pub fn with_max_checksum_retries(mut self, retries: u32) -> Self {
        self.max_checksum_retries = retries;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn submission_id(&self) -> &SubmissionId {
        &self.submission_id
    }

    pub fn source(&self) -> &Arc<EndpointHandle> {
        &self.source
    }

    pub fn destination(&self) -> &Arc<EndpointHandle> {
        &self.destination
    }

    pub async fn state(&self) -> JobState {
        self.inner.lock().await.state
    }

    pub async fn items(&self) -> Vec<TransferItem> {
        self.inner.lock().await.items.clone()
    }

    pub async fn receipt(&self) -> Option<SubmissionReceipt> {
        self.inner.lock().await.receipt.clone()
    }

    /// Status cached by the last [`TransferJob::poll_status`].
    pub async fn last_status(&self) -> Option<TransferStatus> {
        self.inner.lock().await.last_status.clone()
    }

    /// Append a path pair.
    ///
    /// # Errors
    /// - `AlreadySubmitted` once the job left `Building`
    pub async fn add_item(
        &self,
        source_path: impl Into<String>,
        destination_path: impl Into<String>,
        recursive: bool,
    ) -> Result<(), StateError> {
        let mut inner = self.inner.lock().await;
        if inner.state != JobState::Building {
            return Err(StateError::AlreadySubmitted);
        }

        let item = TransferItem::new(source_path, destination_path, recursive);
        debug!(parent: &self.span, source = %item.source_path, destination = %item.destination_path, recursive, "Item added");
        inner.items.push(item);
        Ok(())
    }

    /// Submit the job as one task.
    ///
    /// The job leaves `Building` before anything is sent. Transport failures
    /// are retried with backoff and the same submission id; a `Duplicate`
    /// answer counts as success. If the retries run out the job stays
    /// `Submitted` without a receipt and `submit` may be called again.
    ///
    /// # Errors
    /// - `NoItems` if nothing was added (the job stays `Building`)
    /// - `AlreadySubmitted` if the job already holds a receipt or failed
    /// - `NotActive` if an endpoint could not be re-activated
    /// - `Rejected` if the service refused the transfer (the job fails)
    /// - `Operation` if credentials failed or transport retries ran out
    pub async fn submit(&self) -> Result<SubmissionReceipt, SubmitError> {
        let span = self.span.clone();
        async {
            let mut inner = self.inner.lock().await;

            match inner.state {
                JobState::Building if inner.items.is_empty() => return Err(SubmitError::NoItems),
                JobState::Building => inner.state = JobState::Submitted,
                JobState::Submitted if inner.receipt.is_none() => {
                    info!("Re-sending earlier submission");
                }
                _ => return Err(SubmitError::AlreadySubmitted),
            }

            for handle in [&self.source, &self.destination] {
                handle.ensure_active().await.map_err(|err| match err {
                    ActivationError::Auth(auth) => SubmitError::Operation(auth.into()),
                    other => {
                        warn!(endpoint = %handle.id(), "Endpoint not active: {}", other);
                        SubmitError::NotActive(handle.id().clone())
                    }
                })?;
            }

            let request = TransferRequest {
                submission_id: self.submission_id.clone(),
                label: self.label.clone(),
                source_endpoint: self.source.id().clone(),
                destination_endpoint: self.destination.id().clone(),
                items: inner.items.clone(),
                sync_level: self.sync_level,
                verify_checksum: self.verify_checksum,
                encrypt_data: self.encrypt_data,
            };
            info!(items = request.items.len(), sync_level = %self.sync_level, "Submitting transfer");

            let transfer = &self.transfer;
            let request = &request;
            let result = RetryExecutor::new(self.retry.clone())
                .execute(
                    move || async move {
                        transfer
                            .submit_transfer(request)
                            .await?
                            .map_err(classify_submit_failure)
                    },
                    is_transport_failure,
                )
                .await
                .and_then(|response| receipt_from(response, &self.submission_id));

            match result {
                Ok(receipt) => {
                    info!(task_id = %receipt.task_id, outcome = ?receipt.outcome, "Transfer submitted");
                    inner.receipt = Some(receipt.clone());
                    Ok(receipt)
                }
                Err(SubmitError::Rejected(reason)) => {
                    warn!(%reason, "Transfer rejected");
                    inner.state = JobState::Failed;
                    inner.last_status = Some(TransferStatus {
                        state: JobState::Failed,
                        code: "REJECTED".to_string(),
                        detail: reason.clone(),
                        checksum_retries: 0,
                        checksum_limit_exceeded: false,
                    });
                    Err(SubmitError::Rejected(reason))
                }
                Err(err) => Err(err),
            }
        }
        .instrument(span)
        .await
    }

    async fn task_id(&self) -> Result<TaskId, OperationError> {
        self.inner
            .lock()
            .await
            .receipt
            .as_ref()
            .map(|receipt| receipt.task_id.clone())
            .ok_or(OperationError::NotSubmitted)
    }

    /// Read the task's current status.
    ///
    /// Safe to call repeatedly; only the cached status and job state change.
    ///
    /// # Errors
    /// - `NotSubmitted` if the job holds no receipt
    pub async fn poll_status(&self) -> Result<TransferStatus, OperationError> {
        let task_id = self.task_id().await?;
        let events = self
            .transfer
            .task_status(&task_id)
            .instrument(self.span.clone())
            .await?;

        let status = TransferStatus::from_events(&events, self.max_checksum_retries);
        debug!(parent: &self.span, task_id = %task_id, state = %status.state, code = %status.code, "Task status");

        let mut inner = self.inner.lock().await;
        inner.state = status.state;
        inner.last_status = Some(status.clone());
        Ok(status)
    }

    /// Ask the service to cancel the task.
    pub async fn cancel(&self) -> Result<(), OperationError> {
        let task_id = self.task_id().await?;
        self.transfer
            .cancel_task(&task_id)
            .instrument(self.span.clone())
            .await?;
        info!(parent: &self.span, task_id = %task_id, "Transfer cancelled");
        Ok(())
    }

    /// Poll every `poll_interval` until the task reaches a terminal state.
    ///
    /// A task that exceeded the checksum bound is cancelled before the
    /// failed status is returned.
    pub async fn wait(&self, poll_interval: Duration) -> Result<TransferStatus, OperationError> {
        loop {
            let status = self.poll_status().await?;

            if status.checksum_limit_exceeded {
                warn!(parent: &self.span, detail = %status.detail, "Cancelling transfer");
                if let Err(e) = self.cancel().await {
                    warn!(parent: &self.span, "Failed to cancel transfer: {}", e);
                }
                return Ok(status);
            }
            if status.is_terminal() {
                return Ok(status);
            }

            tokio::time::sleep(poll_interval).await;
        }
    }
}

impl std::fmt::Debug for TransferJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferJob")
            .field("label", &self.label)
            .field("source", self.source.id())
            .field("destination", self.destination.id())
            .field("submission_id", &self.submission_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archeion_auth::{AuthSession, ScriptedPrompt, SessionConfig};
    use archeion_common::EndpointId;
    use archeion_service::{MemoryService, SubmitFault};

    fn source_id() -> EndpointId {
        EndpointId::new("499930f1-5c43-11e7-bf29-22000b9a448b").unwrap()
    }

    fn destination_id() -> EndpointId {
        EndpointId::new("ddb59aef-6d04-11e5-ba46-22000b92c6ec").unwrap()
    }

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig::new(max_retries)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false)
    }

    struct Fixture {
        memory: Arc<MemoryService>,
        session: AuthSession,
    }

    impl Fixture {
        async fn new() -> Self {
            let memory = Arc::new(MemoryService::new());
            memory.add_endpoint(&source_id(), "source");
            memory.add_endpoint(&destination_id(), "destination");
            memory.accept_code("code");

            let session = AuthSession::authorize(
                memory.clone(),
                memory.clone(),
                Arc::new(ScriptedPrompt::new(["code"])),
                SessionConfig::default(),
            )
            .await
            .unwrap();

            Self { memory, session }
        }

        async fn handle(&self, id: EndpointId) -> Arc<EndpointHandle> {
            Arc::new(EndpointHandle::new(id, &self.session).await.unwrap())
        }

        /// A job with one item, ready to submit.
        async fn job(&self) -> TransferJob {
            let job = TransferJob::new(
                self.handle(source_id()).await,
                self.handle(destination_id()).await,
                "nightly backup",
                SyncLevel::Checksum,
                true,
                false,
            )
            .await
            .unwrap()
            .with_retry(fast_retry(3));
            job.add_item("/data", "/backup/data", true).await.unwrap();
            job
        }
    }

    #[test]
    fn test_transport_failures_are_retryable() {
        assert!(is_transport_failure(&SubmitError::Operation(
            OperationError::Timeout
        )));
        assert!(is_transport_failure(&SubmitError::Operation(
            OperationError::Backend(BackendError::Network("reset".to_string()))
        )));
        assert!(!is_transport_failure(&SubmitError::Rejected(
            "quota".to_string()
        )));
        assert!(!is_transport_failure(&SubmitError::Operation(
            OperationError::ActivationRequired("lapsed".to_string())
        )));
    }

    #[test]
    fn test_service_errors_are_rejections() {
        assert!(matches!(
            classify_submit_failure(BackendError::Service {
                code: "ClientError.BadRequest".to_string(),
                message: "bad path".to_string(),
            }),
            SubmitError::Rejected(_)
        ));
        assert!(matches!(
            classify_submit_failure(BackendError::Timeout),
            SubmitError::Operation(OperationError::Timeout)
        ));
    }

    #[test]
    fn test_receipt_outcomes() {
        let id = SubmissionId::new("s-1");
        let response = |code: &str| SubmitResponse {
            code: code.to_string(),
            message: String::new(),
            task_id: TaskId::new("t-1"),
        };

        assert_eq!(
            receipt_from(response("Accepted"), &id).unwrap().outcome,
            SubmissionOutcome::Accepted
        );
        assert_eq!(
            receipt_from(response("Duplicate"), &id).unwrap().outcome,
            SubmissionOutcome::Duplicate
        );
        assert!(matches!(
            receipt_from(response("Pending"), &id),
            Err(SubmitError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_same_endpoint_is_rejected() {
        let fixture = Fixture::new().await;
        let first = fixture.handle(source_id()).await;
        let second = fixture.handle(source_id()).await;

        let result = TransferJob::new(first, second, "loop", SyncLevel::Size, false, false).await;
        assert!(matches!(result, Err(ValidationError::SameEndpoint(_))));
    }

    #[tokio::test]
    async fn test_inactive_endpoint_is_rejected() {
        let fixture = Fixture::new().await;
        let source = fixture.handle(source_id()).await;
        let destination = Arc::new(EndpointHandle::deferred(destination_id(), &fixture.session));

        let result =
            TransferJob::new(source, destination, "early", SyncLevel::Exists, false, false).await;
        assert_eq!(
            result.err(),
            Some(ValidationError::NotActive(destination_id()))
        );
    }

    #[tokio::test]
    async fn test_submit_sends_items_and_policy() {
        let fixture = Fixture::new().await;
        let job = fixture.job().await;
        job.add_item("/logs/today.log", "/backup/today.log", false)
            .await
            .unwrap();

        let receipt = job.submit().await.unwrap();
        let sent = fixture.memory.submitted(&receipt.task_id).unwrap();

        assert_eq!(receipt.outcome, SubmissionOutcome::Accepted);
        assert_eq!(&receipt.submission_id, job.submission_id());
        assert_eq!(sent.items.len(), 2);
        assert_eq!(sent.items[1].source_path, "/logs/today.log");
        assert_eq!(sent.sync_level, SyncLevel::Checksum);
        assert!(sent.verify_checksum);
        assert!(!sent.encrypt_data);
        assert_eq!(job.state().await, JobState::Submitted);
    }

    #[tokio::test]
    async fn test_add_item_after_submit_fails() {
        let fixture = Fixture::new().await;
        let job = fixture.job().await;
        job.submit().await.unwrap();

        assert_eq!(
            job.add_item("/late", "/late", true).await,
            Err(StateError::AlreadySubmitted)
        );
        assert!(matches!(
            job.submit().await,
            Err(SubmitError::AlreadySubmitted)
        ));
    }

    #[tokio::test]
    async fn test_empty_job_cannot_be_submitted() {
        let fixture = Fixture::new().await;
        let job = TransferJob::new(
            fixture.handle(source_id()).await,
            fixture.handle(destination_id()).await,
            "empty",
            SyncLevel::Exists,
            false,
            false,
        )
        .await
        .unwrap();

        assert!(matches!(job.submit().await, Err(SubmitError::NoItems)));
        assert_eq!(job.state().await, JobState::Building);
        job.add_item("/a", "/b", false).await.unwrap();
    }

    #[tokio::test]
    async fn test_lost_response_is_resent_as_duplicate() {
        let fixture = Fixture::new().await;
        let job = fixture.job().await;
        fixture.memory.inject_submit_fault(SubmitFault::DropResponse);

        let receipt = job.submit().await.unwrap();

        assert_eq!(receipt.outcome, SubmissionOutcome::Duplicate);
        assert_eq!(fixture.memory.submit_calls(), 2);
        assert_eq!(fixture.memory.task_count(), 1);
        assert_eq!(job.state().await, JobState::Submitted);
    }

    #[tokio::test]
    async fn test_exhausted_retries_leave_job_resubmittable() {
        let fixture = Fixture::new().await;
        let job = fixture.job().await.with_retry(fast_retry(1));
        fixture.memory.inject_submit_fault(SubmitFault::Network);
        fixture.memory.inject_submit_fault(SubmitFault::Timeout);

        let first = job.submit().await;
        assert!(matches!(
            first,
            Err(SubmitError::Operation(OperationError::Timeout))
        ));
        assert_eq!(job.state().await, JobState::Submitted);
        assert_eq!(
            job.add_item("/late", "/late", true).await,
            Err(StateError::AlreadySubmitted)
        );

        let receipt = job.submit().await.unwrap();
        assert_eq!(receipt.outcome, SubmissionOutcome::Accepted);
        assert_eq!(fixture.memory.task_count(), 1);
    }

    #[tokio::test]
    async fn test_rejected_submission_fails_the_job() {
        let fixture = Fixture::new().await;
        let job = fixture.job().await;
        fixture
            .memory
            .inject_submit_fault(SubmitFault::Reject("quota exceeded".to_string()));

        let result = job.submit().await;

        assert!(matches!(result, Err(SubmitError::Rejected(reason)) if reason.contains("quota")));
        assert_eq!(fixture.memory.submit_calls(), 1);
        assert_eq!(job.state().await, JobState::Failed);
        assert!(matches!(
            job.submit().await,
            Err(SubmitError::AlreadySubmitted)
        ));
    }

    #[tokio::test]
    async fn test_poll_status_maps_task_codes() {
        let fixture = Fixture::new().await;
        let job = fixture.job().await;

        assert_eq!(job.poll_status().await, Err(OperationError::NotSubmitted));

        let receipt = job.submit().await.unwrap();
        fixture.memory.push_task_event(&receipt.task_id, "ACTIVE", "");
        assert_eq!(job.poll_status().await.unwrap().state, JobState::Active);
        assert_eq!(job.state().await, JobState::Active);

        fixture.memory.push_task_event(&receipt.task_id, "SUCCEEDED", "");
        let status = job.poll_status().await.unwrap();
        assert_eq!(status.state, JobState::Succeeded);
        assert_eq!(job.last_status().await, Some(status));
    }

    #[tokio::test]
    async fn test_unknown_task_code_is_a_recorded_failure() {
        let fixture = Fixture::new().await;
        let job = fixture.job().await;
        let receipt = job.submit().await.unwrap();
        fixture
            .memory
            .push_task_event(&receipt.task_id, "PERMISSION_DENIED", "/backup is read-only");

        let status = job.poll_status().await.unwrap();

        assert_eq!(status.state, JobState::Failed);
        assert!(status.detail.contains("/backup is read-only"));
    }

    #[tokio::test]
    async fn test_wait_returns_terminal_status() {
        let fixture = Fixture::new().await;
        let job = fixture.job().await;
        let receipt = job.submit().await.unwrap();
        fixture.memory.push_task_event(&receipt.task_id, "STARTED", "");
        fixture.memory.push_task_event(&receipt.task_id, "SUCCEEDED", "");

        let status = job.wait(Duration::from_millis(1)).await.unwrap();
        assert_eq!(status.state, JobState::Succeeded);
    }

    #[tokio::test]
    async fn test_wait_cancels_after_too_many_checksum_mismatches() {
        let fixture = Fixture::new().await;
        let job = fixture.job().await.with_max_checksum_retries(1);
        let receipt = job.submit().await.unwrap();
        for _ in 0..2 {
            fixture
                .memory
                .push_task_event(&receipt.task_id, "CHECKSUM_MISMATCH", "/data/big.bin");
        }

        let status = job.wait(Duration::from_millis(1)).await.unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert!(status.checksum_limit_exceeded);

        let after = job.poll_status().await.unwrap();
        assert_eq!(after.code, "CANCELED");
    }
}
