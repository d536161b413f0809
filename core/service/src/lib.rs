//! Transfer-service backends for Archeion.
//!
//! The session, endpoint and transfer layers only talk to the remote service
//! through the traits in [`service`]. Two implementations are provided:
//! - [`MemoryService`]: in-memory, scriptable backend for tests and demos
//! - [`globus`]: Globus Auth + Globus Transfer over HTTPS

pub mod globus;
pub mod memory;
pub mod service;

pub use memory::{MemoryService, SubmitFault};
pub use service::{
    ActivationOutcome, ActivationResult, AuthorizationService, EndpointSearch, EndpointSummary,
    SearchScope, SubmitResponse, TaskEvent, TokenGrant, TokenSet, TransferRequest,
    TransferService, UserInfo,
};
