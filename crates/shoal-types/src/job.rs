//! Job identification and status types.

use serde::{Deserialize, Serialize};

/// Identifier for a job, unique among a session's live jobs.
///
/// Ids are small positive integers and are reused once a job is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u32);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a job.
///
/// ```text
///   Created ──start──▶ Foreground ◀──▶ Background ◀──▶ Suspended
///                          │               │               │
///                          └───────────────┴───────┬───────┘
///                                                  ▼
///                                                 Done
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    /// Built but not started yet.
    Created,
    /// Stopped; stages block at their next channel access.
    Suspended,
    /// Running without the caller waiting on it.
    Background,
    /// Running while the starting caller waits for it.
    Foreground,
    /// Finished. Terminal.
    Done,
}

impl JobStatus {
    /// Whether a job may be started in this status.
    pub fn is_start_status(self) -> bool {
        matches!(self, JobStatus::Suspended | JobStatus::Background | JobStatus::Foreground)
    }

    /// Whether the job has been started and has not finished.
    pub fn is_running(self) -> bool {
        self.is_start_status()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Created => write!(f, "Created"),
            JobStatus::Suspended => write!(f, "Suspended"),
            JobStatus::Background => write!(f, "Background"),
            JobStatus::Foreground => write!(f, "Foreground"),
            JobStatus::Done => write!(f, "Done"),
        }
    }
}

/// Snapshot of a job for listing and listener callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    /// Job ID.
    pub id: JobId,
    /// Command text of the pipeline the job runs.
    pub command: String,
    /// Status at the time of the snapshot.
    pub status: JobStatus,
    /// Enclosing job, for pipelines started from inside another job.
    pub parent: Option<JobId>,
}

impl std::fmt::Display for JobInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {:<10} {}", self.id, self.status.to_string(), self.command)
    }
}
