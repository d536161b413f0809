//! Common utilities and types shared across Archeion crates.
//!
//! This module provides the identifiers, value types and the error taxonomy
//! used by the session, endpoint and transfer layers.

pub mod error;
pub mod types;

pub use error::{
    ActivationError, AuthError, BackendError, OperationError, StateError, SubmitError,
    ValidationError,
};
pub use types::{
    ActivationState, DirEntry, DirListing, EndpointId, EntryKind, SubmissionId, SyncLevel,
    TaskId, TransferItem,
};
