//! Common types used throughout Archeion.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ValidationError;

/// Identifier of a remote storage endpoint.
///
/// Always held in canonical form (lower-case, hyphenated UUID) so two ids
/// naming the same endpoint compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EndpointId(String);

impl EndpointId {
    /// Create a new EndpointId from a string.
    ///
    /// # Errors
    /// - Returns `InvalidEndpointId` if `id` is not a UUID
    pub fn new(id: impl AsRef<str>) -> Result<Self, ValidationError> {
        let raw = id.as_ref().trim();
        let parsed = Uuid::parse_str(raw)
            .map_err(|_| ValidationError::InvalidEndpointId(raw.to_string()))?;
        Ok(Self(parsed.hyphenated().to_string()))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EndpointId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for EndpointId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EndpointId> for String {
    fn from(id: EndpointId) -> Self {
        id.0
    }
}

/// Idempotency token for a transfer submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubmissionId(String);

impl SubmissionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a submitted transfer task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which files of a recursive transfer are skipped.
///
/// Each level includes the checks of the levels below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncLevel {
    /// Copy only files missing at the destination.
    Exists,
    /// Copy files whose size differs.
    Size,
    /// Copy files whose modification time is newer.
    #[serde(rename = "mtime")]
    ModTime,
    /// Copy files whose checksum differs.
    Checksum,
}

impl SyncLevel {
    /// Wire ordinal (0-3).
    pub fn ordinal(self) -> u8 {
        match self {
            SyncLevel::Exists => 0,
            SyncLevel::Size => 1,
            SyncLevel::ModTime => 2,
            SyncLevel::Checksum => 3,
        }
    }

    /// Level for a wire ordinal.
    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            0 => Some(SyncLevel::Exists),
            1 => Some(SyncLevel::Size),
            2 => Some(SyncLevel::ModTime),
            3 => Some(SyncLevel::Checksum),
            _ => None,
        }
    }
}

impl Default for SyncLevel {
    fn default() -> Self {
        SyncLevel::Checksum
    }
}

impl fmt::Display for SyncLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncLevel::Exists => "exists",
            SyncLevel::Size => "size",
            SyncLevel::ModTime => "mtime",
            SyncLevel::Checksum => "checksum",
        };
        f.write_str(name)
    }
}

impl FromStr for SyncLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exists" | "0" => Ok(SyncLevel::Exists),
            "size" | "1" => Ok(SyncLevel::Size),
            "mtime" | "modtime" | "2" => Ok(SyncLevel::ModTime),
            "checksum" | "3" => Ok(SyncLevel::Checksum),
            other => Err(format!(
                "Unknown sync level '{}'. Use: exists, size, mtime, or checksum",
                other
            )),
        }
    }
}

/// One source/destination pair of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferItem {
    pub source_path: String,
    pub destination_path: String,
    pub recursive: bool,
}

impl TransferItem {
    pub fn new(
        source_path: impl Into<String>,
        destination_path: impl Into<String>,
        recursive: bool,
    ) -> Self {
        Self {
            source_path: source_path.into(),
            destination_path: destination_path.into(),
            recursive,
        }
    }
}

/// Kind of a remote directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Dir,
    InvalidSymlink,
}

/// A remote directory entry as reported by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(default)]
    pub size: Option<u64>,
}

impl DirEntry {
    pub fn new(name: impl Into<String>, kind: EntryKind) -> Self {
        Self {
            name: name.into(),
            kind,
            size: None,
        }
    }
}

/// Directory contents partitioned into files and folders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirListing {
    pub files: Vec<String>,
    pub folders: Vec<String>,
}

/// Activation state of an endpoint handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivationState {
    /// Not yet known, or lapsed.
    Unknown,
    /// Ready for file operations.
    Active,
    /// Waiting on the user to activate in a browser.
    RequiresManualActivation,
}
