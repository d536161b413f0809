//! Transfer job states and task event interpretation.

use serde::{Deserialize, Serialize};
use std::fmt;

use archeion_service::TaskEvent;

/// Event codes reporting a failed post-transfer checksum comparison.
const CHECKSUM_EVENT_CODES: [&str; 2] = ["CHECKSUM_MISMATCH", "VERIFY_CHECKSUM_FAILED"];

/// Lifecycle of a transfer job.
///
/// `Building → Submitted → {Active, Succeeded, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Items may still be added.
    Building,
    /// Sent to the service; no status read yet.
    Submitted,
    Active,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Building => "building",
            JobState::Submitted => "submitted",
            JobState::Active => "active",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Latest known status of a submitted task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStatus {
    /// `Active`, `Succeeded` or `Failed`.
    pub state: JobState,
    /// Code of the newest task event (empty before the first event).
    pub code: String,
    pub detail: String,
    /// Checksum mismatches reported so far.
    pub checksum_retries: u32,
    /// Whether the mismatches exceeded the job's bound.
    pub checksum_limit_exceeded: bool,
}

impl TransferStatus {
    /// Interpret a task's event list (newest first).
    ///
    /// Unknown codes map to `Failed` with the code kept in `detail`.
    pub fn from_events(events: &[TaskEvent], max_checksum_retries: u32) -> Self {
        let checksum_retries = events
            .iter()
            .filter(|e| CHECKSUM_EVENT_CODES.contains(&e.code.as_str()))
            .count();
        let checksum_retries = u32::try_from(checksum_retries).unwrap_or(u32::MAX);

        let Some(latest) = events.first() else {
            return Self {
                state: JobState::Active,
                code: String::new(),
                detail: "Task has not reported any events yet".to_string(),
                checksum_retries: 0,
                checksum_limit_exceeded: false,
            };
        };

        let detail = if latest.details.is_empty() {
            latest.description.clone()
        } else {
            latest.details.clone()
        };

        let mut status = Self {
            state: JobState::Failed,
            code: latest.code.clone(),
            detail,
            checksum_retries,
            checksum_limit_exceeded: false,
        };

        match latest.code.as_str() {
            "SUCCEEDED" => status.state = JobState::Succeeded,
            _ if checksum_retries > max_checksum_retries => {
                status.checksum_limit_exceeded = true;
                status.detail = format!(
                    "Checksum verification failed {} times (limit {})",
                    checksum_retries, max_checksum_retries
                );
            }
            "ACTIVE" | "STARTED" | "QUEUED" | "INACTIVE" => status.state = JobState::Active,
            code if CHECKSUM_EVENT_CODES.contains(&code) => status.state = JobState::Active,
            "FAILED" => {}
            other => {
                status.detail = format!("Unrecognized task code '{}': {}", other, status.detail);
            }
        }

        status
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{}", self.state)
        } else {
            write!(f, "{} ({})", self.state, self.detail)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(codes: &[&str]) -> Vec<TaskEvent> {
        codes.iter().map(|c| TaskEvent::new(*c, "")).collect()
    }

    #[test]
    fn test_known_codes() {
        assert_eq!(
            TransferStatus::from_events(&events(&["SUCCEEDED", "STARTED"]), 3).state,
            JobState::Succeeded
        );
        assert_eq!(
            TransferStatus::from_events(&events(&["ACTIVE"]), 3).state,
            JobState::Active
        );
        assert_eq!(
            TransferStatus::from_events(&events(&["FAILED"]), 3).state,
            JobState::Failed
        );
    }

    #[test]
    fn test_unknown_code_fails_with_detail() {
        let status = TransferStatus::from_events(&[TaskEvent::new("EXPLODED", "disk on fire")], 3);
        assert_eq!(status.state, JobState::Failed);
        assert!(status.detail.contains("EXPLODED"));
        assert!(status.detail.contains("disk on fire"));
    }

    #[test]
    fn test_no_events_is_active() {
        let status = TransferStatus::from_events(&[], 3);
        assert_eq!(status.state, JobState::Active);
        assert!(!status.is_terminal());
    }

    #[test]
    fn test_checksum_mismatches_within_bound_stay_active() {
        let status =
            TransferStatus::from_events(&events(&["CHECKSUM_MISMATCH", "CHECKSUM_MISMATCH", "STARTED"]), 3);
        assert_eq!(status.state, JobState::Active);
        assert_eq!(status.checksum_retries, 2);
    }

    #[test]
    fn test_checksum_bound_exceeded_fails() {
        let status = TransferStatus::from_events(
            &events(&[
                "ACTIVE",
                "CHECKSUM_MISMATCH",
                "VERIFY_CHECKSUM_FAILED",
                "CHECKSUM_MISMATCH",
                "STARTED",
            ]),
            2,
        );
        assert_eq!(status.state, JobState::Failed);
        assert!(status.checksum_limit_exceeded);
    }
}
