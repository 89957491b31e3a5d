//! Remote audio-capture jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One audio-capture job bound to a call's media session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EgressJob {
    pub egress_id: String,
    pub call_id: String,
    pub started_at: DateTime<Utc>,
    pub status: EgressJobStatus,

    /// Object key the platform was asked to write
    pub output_key: String,
}

/// Lifecycle of a job as seen by the recorder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EgressJobStatus {
    Pending,
    Active,
    Stopped,
    Failed,
}

/// Job status as reported by the media platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteEgressStatus {
    #[serde(rename = "EGRESS_STARTING")]
    Starting,
    #[serde(rename = "EGRESS_ACTIVE")]
    Active,
    #[serde(rename = "EGRESS_ENDING")]
    Ending,
    #[serde(rename = "EGRESS_COMPLETE")]
    Complete,
    #[serde(rename = "EGRESS_FAILED")]
    Failed,
    #[serde(rename = "EGRESS_ABORTED")]
    Aborted,
    #[serde(rename = "EGRESS_LIMIT_REACHED")]
    LimitReached,
}

impl RemoteEgressStatus {
    /// The job will not change state again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Failed | Self::Aborted | Self::LimitReached
        )
    }

    /// The job finished and its output was written
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Complete | Self::LimitReached)
    }
}

/// Snapshot of a remote job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressInfo {
    pub egress_id: String,
    pub status: RemoteEgressStatus,

    /// Written file, once the job completed
    pub file: Option<EgressFile>,

    pub error: Option<String>,
}

/// Output file reported by the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressFile {
    pub location: Option<String>,
    pub size_bytes: Option<u64>,
}
