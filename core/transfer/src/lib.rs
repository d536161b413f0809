//! Archeion transfer layer.
//!
//! Endpoint activation and file operations ([`EndpointHandle`]) and bulk
//! transfer submission and monitoring ([`TransferJob`]).

pub mod endpoint;
pub mod job;
pub mod retry;
pub mod status;

pub use endpoint::{search_endpoints, EndpointHandle};
pub use job::{SubmissionOutcome, SubmissionReceipt, TransferJob, DEFAULT_MAX_CHECKSUM_RETRIES};
pub use retry::{RetryConfig, RetryExecutor};
pub use status::{JobState, TransferStatus};
