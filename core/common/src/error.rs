//! Error taxonomy for Archeion.
//!
//! Each layer has its own error enum so callers can tell "re-authorize",
//! "ask the user again" and "the remote action may or may not have happened"
//! apart without string matching.

use thiserror::Error;

use crate::types::EndpointId;

/// Error reported by a backend at the RPC boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Target already exists (e.g. `mkdir` on an existing directory).
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Target path or resource does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The endpoint's activation lapsed and must be renewed.
    #[error("Endpoint activation required: {0}")]
    ActivationRequired(String),

    /// Credentials were rejected.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The service answered with an error code.
    #[error("Service error {code}: {message}")]
    Service { code: String, message: String },

    /// Transport failure before a response was received.
    #[error("Network error: {0}")]
    Network(String),

    /// The request timed out in transport.
    #[error("Request timed out")]
    Timeout,

    /// The response could not be decoded.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl BackendError {
    /// Whether the failure happened in transport and says nothing about
    /// whether the remote action took place.
    pub fn is_transport(&self) -> bool {
        matches!(self, BackendError::Network(_) | BackendError::Timeout)
    }
}

/// Authorization and token lifecycle errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// The authorization code was rejected. Retryable by prompting again.
    #[error("Invalid authorization code: {0}")]
    InvalidCode(String),

    /// The refresh token was rejected. Re-authorization required.
    #[error("Refresh token denied, re-authorization required: {0}")]
    RefreshDenied(String),

    /// Transport failure talking to the authorization service.
    #[error("Network error during authorization: {0}")]
    NetworkError(String),

    /// The authorization service did not answer in time. Not latched.
    #[error("Authorization request timed out")]
    Timeout,

    /// The user aborted the interactive flow.
    #[error("Authorization cancelled by user")]
    UserCancelled,

    /// The prompt collaborator failed.
    #[error("Prompt failed: {0}")]
    Prompt(String),

    /// The authorization client is misconfigured.
    #[error("Invalid authorization configuration: {0}")]
    Configuration(String),
}

/// Endpoint activation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActivationError {
    /// The user aborted manual activation.
    #[error("Activation cancelled by user")]
    UserCancelled,

    /// Service or transport failure while activating.
    #[error("Activation failed: {0}")]
    Backend(String),

    /// The activation request timed out.
    #[error("Activation request timed out")]
    Timeout,

    /// No valid credentials for the activation call.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The prompt collaborator failed.
    #[error("Prompt failed: {0}")]
    Prompt(String),
}

/// Errors from operations on endpoints and tasks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    /// Path or resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The call exceeded its timeout. The remote action may have happened.
    #[error("Operation timed out")]
    Timeout,

    /// The endpoint's activation lapsed.
    #[error("Endpoint activation required: {0}")]
    ActivationRequired(String),

    /// Any other backend failure, passed through unmodified.
    #[error(transparent)]
    Backend(BackendError),

    /// Token acquisition or refresh failed.
    #[error(transparent)]
    Auth(AuthError),

    /// Lazy re-activation failed.
    #[error(transparent)]
    Activation(#[from] ActivationError),

    /// The job has no task to query yet.
    #[error("Transfer has not been submitted")]
    NotSubmitted,
}

impl From<AuthError> for OperationError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Timeout => OperationError::Timeout,
            other => OperationError::Auth(other),
        }
    }
}

impl From<BackendError> for OperationError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotFound(detail) => OperationError::NotFound(detail),
            BackendError::Timeout => OperationError::Timeout,
            BackendError::ActivationRequired(detail) => OperationError::ActivationRequired(detail),
            other => OperationError::Backend(other),
        }
    }
}

impl From<OperationError> for ActivationError {
    fn from(err: OperationError) -> Self {
        match err {
            OperationError::Timeout => ActivationError::Timeout,
            OperationError::Auth(auth) => ActivationError::Auth(auth),
            OperationError::Activation(activation) => activation,
            other => ActivationError::Backend(other.to_string()),
        }
    }
}

/// Errors constructing a transfer job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Source and destination are the same endpoint.
    #[error("Source and destination are the same endpoint: {0}")]
    SameEndpoint(EndpointId),

    /// An endpoint is not active.
    #[error("Endpoint is not active: {0}")]
    NotActive(EndpointId),

    /// The endpoint identifier is malformed.
    #[error("Invalid endpoint id '{0}'")]
    InvalidEndpointId(String),

    /// The submission id could not be obtained.
    #[error("Failed to obtain submission id: {0}")]
    SubmissionId(OperationError),
}

/// Job state violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    /// The job has left the building state.
    #[error("Transfer has already been submitted")]
    AlreadySubmitted,
}

/// Errors from submitting a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// The service refused the transfer.
    #[error("Transfer rejected: {0}")]
    Rejected(String),

    /// Nothing to transfer.
    #[error("Transfer has no items")]
    NoItems,

    /// The job already holds a receipt.
    #[error("Transfer has already been submitted")]
    AlreadySubmitted,

    /// An endpoint could not be (re-)activated before submission.
    #[error("Endpoint is not active: {0}")]
    NotActive(EndpointId),

    /// Transport retries were exhausted or credentials failed.
    #[error(transparent)]
    Operation(#[from] OperationError),
}

impl From<StateError> for SubmitError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::AlreadySubmitted => SubmitError::AlreadySubmitted,
        }
    }
}
