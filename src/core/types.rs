use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::jobs::{ErrorKind, JobStatus};

/// One submitted unit of asynchronous work.
///
/// `env_context` is a snapshot taken at submission time and is never mutated
/// afterwards; workers read a copy. It holds caller-scoped secrets, so it is
/// excluded from serialized API responses.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    #[serde(rename = "job_id")]
    pub id: String,
    pub owner_id: String,
    pub input: String,
    pub status: JobStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub usage_metrics: Option<UsageMetrics>,
    #[serde(skip_serializing)]
    pub env_context: HashMap<String, String>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

/// Resource counters recorded when a job completes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageMetrics {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
}

/// The message published to the task queue for each job. Carries everything a
/// worker needs apart from the owner's credentials, which are resolved from
/// the session store at execution time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub job_id: String,
    pub owner_id: String,
    pub input: String,
    #[serde(default)]
    pub env_context: HashMap<String, String>,
}

/// OAuth token material for one owner. Refreshed in place by workers when
/// expired; the session store serializes concurrent refreshes per owner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialData {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Unix seconds; `None` means the provider did not report an expiry.
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl CredentialData {
    /// True when the access token is missing or expires within `skew` seconds.
    pub fn is_expired(&self, now: i64, skew: i64) -> bool {
        if self.access_token.is_empty() {
            return true;
        }
        match self.expires_at {
            Some(t) => t <= now + skew,
            None => false,
        }
    }
}

/// Denormalized display data captured during authorization. Advisory only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub picture: String,
}

/// Per-owner OAuth credential and scope state. At most one live record per
/// owner, keyed by `owner_id`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub owner_id: String,
    #[serde(skip_serializing)]
    pub credential_data: CredentialData,
    pub requested_scopes: Vec<String>,
    pub granted_scopes: Vec<String>,
    pub authenticated: bool,
    pub profile: Profile,
    /// Monotonic counter bumped on every credential refresh; the compare-and-
    /// set on this value is what keeps refreshes single-writer per owner.
    #[serde(skip_serializing)]
    pub token_version: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// Partial update for `upsert`: only the populated fields are written, the
/// rest of an existing record is preserved.
#[derive(Debug, Clone, Default)]
pub struct SessionUpsert {
    pub credential_data: Option<CredentialData>,
    pub requested_scopes: Option<Vec<String>>,
    pub granted_scopes: Option<Vec<String>>,
    pub authenticated: Option<bool>,
    pub profile: Option<Profile>,
}

pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
