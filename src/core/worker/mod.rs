//! Worker pool: independent pull-process-acknowledge loops.
//!
//! Each worker dequeues one task, attempts the `pending → running` claim, and
//! only acknowledges the message once the job has reached a terminal state or
//! is deliberately discarded (lost claim, poison payload). A worker crash in
//! between leaves the lease to expire and the broker to redeliver.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::core::jobs::ErrorKind;
use crate::core::oauth::{self, OAuthConfig};
use crate::core::queue::{Delivery, TaskQueue};
use crate::core::scopes;
use crate::core::storage::Storage;
use crate::core::toolkit::{Toolkit, ToolkitError};
use crate::core::types::{CredentialData, SessionRecord, TaskMessage, unix_now};

/// How long an idle worker sleeps between polls.
const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Delay before a delivery that hit a storage error becomes visible again.
const REQUEUE_DELAY: Duration = Duration::from_secs(5);
/// Interval between maintenance sweeps.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);
/// Access tokens expiring within this window are refreshed up front.
const EXPIRY_SKEW_SECS: i64 = 60;

/// Bounded retries with exponential backoff for transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before the attempt after `attempt` (1-based): base doubled per
    /// failure, capped, with up to 10% jitter to avoid thundering herds.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self.base_delay.saturating_mul(1u32 << exp);
        let capped = raw.min(self.max_delay);
        if capped.is_zero() {
            return capped;
        }
        let jitter = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 10);
        capped + Duration::from_millis(jitter)
    }
}

pub struct WorkerContext {
    pub storage: Arc<Storage>,
    pub queue: Arc<dyn TaskQueue>,
    pub toolkit: Arc<dyn Toolkit>,
    pub oauth: Option<OAuthConfig>,
    pub queue_name: String,
    pub visibility: Duration,
    pub retry: RetryPolicy,
    pub staleness: Duration,
    pub orphan_age: Duration,
    pub retention: Duration,
}

pub async fn run_worker(ctx: Arc<WorkerContext>, worker_id: usize) {
    info!(worker_id, queue = %ctx.queue_name, "worker started");
    loop {
        let delivery = match ctx.queue.dequeue(&ctx.queue_name, ctx.visibility).await {
            Ok(Some(d)) => d,
            Ok(None) => {
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }
            Err(e) => {
                error!(worker_id, error = %e, "dequeue failed, backing off");
                tokio::time::sleep(REQUEUE_DELAY).await;
                continue;
            }
        };

        if let Err(e) = process_delivery(&ctx, &delivery).await {
            // Storage trouble mid-job: abandon the lease so another worker
            // (or this one, later) picks the message up again.
            error!(worker_id, message_id = delivery.id, error = %e, "processing failed, requeueing");
            if let Err(e) = ctx.queue.nack(&delivery, REQUEUE_DELAY).await {
                error!(worker_id, message_id = delivery.id, error = %e, "nack failed");
            }
        }
    }
}

/// Handle one leased message end to end. Errors returned here mean the
/// message was neither acked nor failed terminally and should be redelivered.
pub async fn process_delivery(ctx: &WorkerContext, delivery: &Delivery) -> anyhow::Result<()> {
    let msg: TaskMessage = match serde_json::from_str(&delivery.payload) {
        Ok(m) => m,
        Err(e) => {
            // Poison message: redelivery cannot fix it.
            warn!(message_id = delivery.id, queue = %delivery.queue, error = %e,
                  "dropping undecodable task message");
            ctx.queue.ack(delivery).await?;
            return Ok(());
        }
    };

    // The claim: of all workers holding a redelivered copy of this message,
    // exactly one proceeds. Losing is routine, not an error.
    if !ctx.storage.claim_job(&msg.job_id).await? {
        debug!(job_id = %msg.job_id, "claim lost, discarding delivery");
        ctx.queue.ack(delivery).await?;
        return Ok(());
    }

    let session = match ctx.storage.get_session(&msg.owner_id).await? {
        Some(s) if s.authenticated => s,
        _ => {
            ctx.storage
                .fail_job(
                    &msg.job_id,
                    "owner session missing or not authenticated",
                    ErrorKind::Fatal,
                )
                .await?;
            ctx.queue.ack(delivery).await?;
            return Ok(());
        }
    };

    let env_context = narrowed_env(ctx, &msg, &session).await?;
    execute_with_retries(ctx, &msg, session, &env_context).await?;
    ctx.queue.ack(delivery).await?;
    Ok(())
}

/// Copy the job's environment snapshot, overriding the scope grant with the
/// intersection of what the owner requested and what the provider granted.
async fn narrowed_env(
    ctx: &WorkerContext,
    msg: &TaskMessage,
    session: &SessionRecord,
) -> anyhow::Result<HashMap<String, String>> {
    let allowed = ctx
        .storage
        .scope_filter(&msg.owner_id, &session.requested_scopes)
        .await?;
    let mut env = msg.env_context.clone();
    env.insert(
        "GOOGLE_AUTHORIZED_SCOPES".to_string(),
        serde_json::to_string(&scopes::urls_for(&allowed))?,
    );
    env.insert("SESSION_USER_ID".to_string(), msg.owner_id.clone());
    Ok(env)
}

async fn execute_with_retries(
    ctx: &WorkerContext,
    msg: &TaskMessage,
    session: SessionRecord,
    env_context: &HashMap<String, String>,
) -> anyhow::Result<()> {
    let mut credentials = session.credential_data;
    let mut token_version = session.token_version;

    let max_attempts = ctx.retry.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        match ensure_fresh_credentials(ctx, &msg.owner_id, credentials.clone(), token_version).await {
            Ok((creds, version)) => {
                credentials = creds;
                token_version = version;
            }
            Err(reason) => {
                warn!(job_id = %msg.job_id, attempt, %reason, "credential refresh failed");
                if attempt == max_attempts {
                    let error = format!(
                        "retries exhausted after {} attempts: {reason}",
                        max_attempts
                    );
                    if ctx
                        .storage
                        .fail_job(&msg.job_id, &error, ErrorKind::RetriesExhausted)
                        .await?
                    {
                        info!(job_id = %msg.job_id, "job failed after exhausting retries");
                    }
                    return Ok(());
                }
                tokio::time::sleep(ctx.retry.delay_for(attempt)).await;
                continue;
            }
        }

        match ctx
            .toolkit
            .execute(&msg.input, env_context, &credentials)
            .await
        {
            Ok(output) => {
                if ctx
                    .storage
                    .complete_job(&msg.job_id, &output.result, &output.usage)
                    .await?
                {
                    info!(job_id = %msg.job_id, attempt, "job completed");
                } else {
                    // Lost the job after claiming is only possible via the
                    // staleness reclaim; the other claimant owns the record.
                    warn!(job_id = %msg.job_id, "job no longer running, result discarded");
                }
                return Ok(());
            }
            Err(ToolkitError::Fatal(reason)) => {
                if ctx
                    .storage
                    .fail_job(&msg.job_id, &reason, ErrorKind::Fatal)
                    .await?
                {
                    info!(job_id = %msg.job_id, %reason, "job failed fatally, no retry");
                }
                return Ok(());
            }
            Err(ToolkitError::Retriable(reason)) => {
                if attempt == max_attempts {
                    let error = format!(
                        "retries exhausted after {} attempts: {reason}",
                        max_attempts
                    );
                    if ctx
                        .storage
                        .fail_job(&msg.job_id, &error, ErrorKind::RetriesExhausted)
                        .await?
                    {
                        info!(job_id = %msg.job_id, "job failed after exhausting retries");
                    }
                    return Ok(());
                }
                let delay = ctx.retry.delay_for(attempt);
                warn!(job_id = %msg.job_id, attempt, %reason, delay_ms = delay.as_millis() as u64,
                      "retriable failure, backing off");
                tokio::time::sleep(delay).await;
            }
        }
    }
    Ok(())
}

/// Refresh expired credentials through the token endpoint, serialized per
/// owner by the session store's version compare-and-set. Losing the CAS means
/// another worker refreshed first; use their fresher token. Without an OAuth
/// client configured the stored token is used as-is.
async fn ensure_fresh_credentials(
    ctx: &WorkerContext,
    owner_id: &str,
    credentials: CredentialData,
    token_version: i64,
) -> Result<(CredentialData, i64), String> {
    if !credentials.is_expired(unix_now(), EXPIRY_SKEW_SECS) {
        return Ok((credentials, token_version));
    }
    let Some(oauth_config) = &ctx.oauth else {
        return Ok((credentials, token_version));
    };

    let refreshed = oauth::refresh_access_token(oauth_config, &credentials)
        .await
        .map_err(|e| e.to_string())?;

    let won = ctx
        .storage
        .update_credentials(owner_id, token_version, &refreshed)
        .await
        .map_err(|e| e.to_string())?;
    if won {
        return Ok((refreshed, token_version + 1));
    }

    // Lost the refresh race: re-read and adopt the winner's token.
    let current = ctx
        .storage
        .get_session(owner_id)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "session disappeared during refresh".to_string())?;
    Ok((current.credential_data, current.token_version))
}

pub async fn run_maintenance(ctx: Arc<WorkerContext>) {
    info!("maintenance loop started");
    loop {
        if let Err(e) = maintenance_pass(&ctx).await {
            error!(error = %e, "maintenance pass failed");
        }
        tokio::time::sleep(MAINTENANCE_INTERVAL).await;
    }
}

/// One sweep of the liveness and retention guards: reclaim stale `running`
/// jobs and re-publish them, re-publish orphaned `pending` jobs whose task
/// message was lost, and purge old terminal records. Every re-publish is a
/// duplicate-safe at-least-once delivery; the claim CAS discards extras.
pub async fn maintenance_pass(ctx: &WorkerContext) -> anyhow::Result<()> {
    let stale = ctx
        .storage
        .reclaim_stale_jobs(ctx.staleness.as_secs())
        .await?;
    for job in &stale {
        warn!(job_id = %job.id, "reclaimed stale running job");
        republish(ctx, job).await?;
    }

    let orphans = ctx
        .storage
        .list_orphaned_pending(ctx.orphan_age.as_secs())
        .await?;
    for job in &orphans {
        info!(job_id = %job.id, "re-publishing orphaned pending job");
        republish(ctx, job).await?;
    }

    let purged = ctx
        .storage
        .purge_terminal_jobs(ctx.retention.as_secs())
        .await?;
    if purged > 0 {
        info!(purged, "purged old terminal job records");
    }
    Ok(())
}

async fn republish(ctx: &WorkerContext, job: &crate::core::types::JobRecord) -> anyhow::Result<()> {
    let message = TaskMessage {
        job_id: job.id.clone(),
        owner_id: job.owner_id.clone(),
        input: job.input.clone(),
        env_context: job.env_context.clone(),
    };
    ctx.queue
        .publish(&ctx.queue_name, &serde_json::to_string(&message)?)
        .await
}

#[cfg(test)]
mod tests;
