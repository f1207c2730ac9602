//! Submission gateway: the facade the transport layer calls.
//!
//! `submit` persists first and publishes second. If the publish fails the
//! pending record stays visible and the caller gets a retriable `Publish`
//! error instead of a fabricated success; the worker pool's maintenance pass
//! re-publishes such orphans, so the job is never silently lost.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::core::error::{Error, Result};
use crate::core::queue::TaskQueue;
use crate::core::storage::Storage;
use crate::core::types::{JobRecord, TaskMessage};

pub struct Gateway {
    storage: Arc<Storage>,
    queue: Arc<dyn TaskQueue>,
    queue_name: String,
}

impl Gateway {
    pub fn new(storage: Arc<Storage>, queue: Arc<dyn TaskQueue>, queue_name: String) -> Self {
        Self {
            storage,
            queue,
            queue_name,
        }
    }

    pub async fn submit(
        &self,
        owner_id: &str,
        input: &str,
        env_context: HashMap<String, String>,
    ) -> Result<String> {
        if input.trim().is_empty() {
            return Err(Error::Validation("message must not be empty".to_string()));
        }

        let job = self.storage.create_job(owner_id, input, &env_context).await?;
        let message = TaskMessage {
            job_id: job.id.clone(),
            owner_id: owner_id.to_string(),
            input: input.to_string(),
            env_context,
        };
        let payload = serde_json::to_string(&message)?;

        if let Err(source) = self.queue.publish(&self.queue_name, &payload).await {
            warn!(job_id = %job.id, error = %source, "task publish failed, job left pending");
            return Err(Error::Publish {
                job_id: job.id,
                source,
            });
        }

        info!(job_id = %job.id, owner_id, "job queued");
        Ok(job.id)
    }

    pub async fn get(&self, job_id: &str, requesting_owner_id: &str) -> Result<JobRecord> {
        self.storage
            .get_job_for_owner(job_id, requesting_owner_id)
            .await?
            .ok_or(Error::NotFound)
    }

    pub async fn list(&self, owner_id: &str) -> Result<Vec<JobRecord>> {
        self.storage.list_jobs_for_owner(owner_id).await
    }
}
