//! Job lifecycle state machine.
//!
//! `pending → running → completed | failed`. Terminal states absorb; nothing
//! transitions out of them. The `pending → running` edge is claimed with a
//! compare-and-set in the job store, which is the only concurrency-control
//! primitive the design needs: once claimed, a job has a single writer.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
    match from {
        JobStatus::Pending => matches!(to, JobStatus::Running),
        JobStatus::Running => matches!(to, JobStatus::Completed | JobStatus::Failed),
        JobStatus::Completed | JobStatus::Failed => false,
    }
}

/// Why a job ended up `failed`. `RetriesExhausted` tells the caller that
/// resubmitting the same input may succeed; `Fatal` tells them it will not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Fatal,
    RetriesExhausted,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Fatal => "fatal",
            ErrorKind::RetriesExhausted => "retries_exhausted",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "fatal" => Some(ErrorKind::Fatal),
            "retries_exhausted" => Some(ErrorKind::RetriesExhausted),
            _ => None,
        }
    }
}
