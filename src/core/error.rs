use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the gateway and the stores.
///
/// `NotFound` covers both a genuinely unknown id and an ownership mismatch so
/// callers cannot probe for the existence of other users' jobs. `Publish`
/// means the job record was persisted but the task message was not: the job
/// stays visible as `pending` and the caller may retry the submit.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not found")]
    NotFound,

    #[error("failed to publish task for job {job_id}: {source}")]
    Publish {
        job_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    /// True when retrying the same call may succeed without any other change.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Publish { .. } | Error::Storage(_))
    }
}
