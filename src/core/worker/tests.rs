use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::*;
use crate::core::jobs::JobStatus;
use crate::core::queue::sqlite::SqliteQueue;
use crate::core::storage::Storage;
use crate::core::toolkit::ToolkitOutput;
use crate::core::types::{Profile, SessionUpsert, UsageMetrics};

/// Replays a scripted sequence of toolkit outcomes and records what it saw.
struct MockToolkit {
    script: std::sync::Mutex<VecDeque<Result<ToolkitOutput, ToolkitError>>>,
    calls: AtomicUsize,
    seen_env: std::sync::Mutex<Vec<HashMap<String, String>>>,
}

impl MockToolkit {
    fn new(script: Vec<Result<ToolkitOutput, ToolkitError>>) -> Arc<Self> {
        Arc::new(Self {
            script: std::sync::Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            seen_env: std::sync::Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn ok_output(result: &str) -> Result<ToolkitOutput, ToolkitError> {
    Ok(ToolkitOutput {
        result: result.to_string(),
        usage: UsageMetrics {
            input_tokens: 10,
            output_tokens: 5,
            total_tokens: 15,
        },
    })
}

#[async_trait::async_trait]
impl Toolkit for MockToolkit {
    async fn execute(
        &self,
        _input: &str,
        env_context: &HashMap<String, String>,
        _credentials: &CredentialData,
    ) -> Result<ToolkitOutput, ToolkitError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_env.lock().unwrap().push(env_context.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .expect("toolkit called more times than scripted")
    }
}

struct Harness {
    storage: Arc<Storage>,
    queue: Arc<SqliteQueue>,
    toolkit: Arc<MockToolkit>,
    ctx: WorkerContext,
}

fn harness(script: Vec<Result<ToolkitOutput, ToolkitError>>) -> Harness {
    let storage = Arc::new(Storage::open_in_memory().unwrap());
    let queue = Arc::new(SqliteQueue::new(storage.get_db()));
    let toolkit = MockToolkit::new(script);
    let ctx = WorkerContext {
        storage: storage.clone(),
        queue: queue.clone(),
        toolkit: toolkit.clone(),
        oauth: None,
        queue_name: "agent".to_string(),
        visibility: Duration::from_secs(600),
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        },
        staleness: Duration::from_secs(1800),
        orphan_age: Duration::ZERO,
        retention: Duration::from_secs(7 * 86_400),
    };
    Harness {
        storage,
        queue,
        toolkit,
        ctx,
    }
}

async fn authenticated_session(storage: &Storage, owner_id: &str) {
    storage
        .upsert_session(
            owner_id,
            SessionUpsert {
                credential_data: Some(CredentialData {
                    access_token: "provider-token".to_string(),
                    refresh_token: Some("refresh".to_string()),
                    expires_at: None,
                    scopes: vec!["drive".to_string()],
                }),
                requested_scopes: Some(vec!["drive".to_string(), "gmail_full".to_string()]),
                granted_scopes: Some(vec!["drive".to_string()]),
                authenticated: Some(true),
                profile: Some(Profile {
                    email: "alice@example.com".to_string(),
                    ..Default::default()
                }),
            },
        )
        .await
        .unwrap();
}

/// Create a job record and put its task message on the queue, then hand the
/// leased delivery back, the way a live worker would receive it.
async fn enqueue_job(h: &Harness, owner_id: &str, input: &str) -> (String, Delivery) {
    let job = h
        .storage
        .create_job(owner_id, input, &HashMap::new())
        .await
        .unwrap();
    let message = TaskMessage {
        job_id: job.id.clone(),
        owner_id: owner_id.to_string(),
        input: input.to_string(),
        env_context: HashMap::new(),
    };
    h.queue
        .publish("agent", &serde_json::to_string(&message).unwrap())
        .await
        .unwrap();
    let delivery = h
        .queue
        .dequeue("agent", Duration::from_secs(600))
        .await
        .unwrap()
        .unwrap();
    (job.id, delivery)
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let h = harness(vec![
        Err(ToolkitError::Retriable("503".into())),
        Err(ToolkitError::Retriable("timeout".into())),
        ok_output("done"),
    ]);
    authenticated_session(&h.storage, "alice").await;
    let (job_id, delivery) = enqueue_job(&h, "alice", "hello").await;

    process_delivery(&h.ctx, &delivery).await.unwrap();

    assert_eq!(h.toolkit.calls(), 3);
    let job = h.storage.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result.as_deref(), Some("done"));
    assert_eq!(job.usage_metrics.unwrap().total_tokens, 15);
    assert!(job.completed_at.is_some());
    // Acked: nothing left to redeliver.
    assert!(
        h.queue
            .dequeue("agent", Duration::from_secs(600))
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn fatal_failure_is_not_retried() {
    let h = harness(vec![Err(ToolkitError::Fatal("bad request".into()))]);
    authenticated_session(&h.storage, "alice").await;
    let (job_id, delivery) = enqueue_job(&h, "alice", "hello").await;

    process_delivery(&h.ctx, &delivery).await.unwrap();

    assert_eq!(h.toolkit.calls(), 1);
    let job = h.storage.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("bad request"));
    assert_eq!(job.error_kind, Some(ErrorKind::Fatal));
}

#[tokio::test]
async fn exhausted_retries_fail_the_job_with_attempt_count() {
    let h = harness(vec![
        Err(ToolkitError::Retriable("503".into())),
        Err(ToolkitError::Retriable("503".into())),
        Err(ToolkitError::Retriable("503".into())),
    ]);
    authenticated_session(&h.storage, "alice").await;
    let (job_id, delivery) = enqueue_job(&h, "alice", "hello").await;

    process_delivery(&h.ctx, &delivery).await.unwrap();

    assert_eq!(h.toolkit.calls(), 3);
    let job = h.storage.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_kind, Some(ErrorKind::RetriesExhausted));
    assert!(job.error.unwrap().contains("3 attempts"));
}

#[tokio::test]
async fn redelivery_after_completion_is_discarded() {
    let h = harness(vec![ok_output("first result")]);
    authenticated_session(&h.storage, "alice").await;
    let (job_id, delivery) = enqueue_job(&h, "alice", "hello").await;

    // Duplicate copy of the same message, as an expired lease would produce.
    h.queue.publish("agent", &delivery.payload).await.unwrap();

    process_delivery(&h.ctx, &delivery).await.unwrap();
    let done = h.storage.get_job(&job_id).await.unwrap().unwrap();

    let duplicate = h
        .queue
        .dequeue("agent", Duration::from_secs(600))
        .await
        .unwrap()
        .unwrap();
    process_delivery(&h.ctx, &duplicate).await.unwrap();

    // The claim lost, the toolkit never ran again, the record is untouched.
    assert_eq!(h.toolkit.calls(), 1);
    let after = h.storage.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(after.status, JobStatus::Completed);
    assert_eq!(after.result, done.result);
    assert_eq!(after.completed_at, done.completed_at);
}

#[tokio::test]
async fn missing_session_fails_the_job_fatally() {
    let h = harness(vec![]);
    let (job_id, delivery) = enqueue_job(&h, "nobody", "hello").await;

    process_delivery(&h.ctx, &delivery).await.unwrap();

    assert_eq!(h.toolkit.calls(), 0);
    let job = h.storage.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_kind, Some(ErrorKind::Fatal));
}

#[tokio::test]
async fn unauthenticated_session_fails_the_job_fatally() {
    let h = harness(vec![]);
    h.storage
        .upsert_session(
            "alice",
            SessionUpsert {
                authenticated: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let (job_id, delivery) = enqueue_job(&h, "alice", "hello").await;

    process_delivery(&h.ctx, &delivery).await.unwrap();

    assert_eq!(h.toolkit.calls(), 0);
    let job = h.storage.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
}

#[tokio::test]
async fn undecodable_message_is_dropped_without_touching_jobs() {
    let h = harness(vec![]);
    h.queue.publish("agent", "not json at all").await.unwrap();
    let delivery = h
        .queue
        .dequeue("agent", Duration::from_secs(600))
        .await
        .unwrap()
        .unwrap();

    process_delivery(&h.ctx, &delivery).await.unwrap();

    assert!(
        h.queue
            .dequeue("agent", Duration::from_secs(600))
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn worker_env_carries_the_narrowed_scope_grant() {
    let h = harness(vec![ok_output("done")]);
    authenticated_session(&h.storage, "alice").await;
    let (_, delivery) = enqueue_job(&h, "alice", "hello").await;

    process_delivery(&h.ctx, &delivery).await.unwrap();

    let seen = h.toolkit.seen_env.lock().unwrap();
    let env = &seen[0];
    // Requested drive + gmail_full, granted drive: only the drive URL is
    // exposed to the toolkit.
    let urls: Vec<String> = serde_json::from_str(&env["GOOGLE_AUTHORIZED_SCOPES"]).unwrap();
    assert_eq!(urls, vec!["https://www.googleapis.com/auth/drive"]);
    assert_eq!(env["SESSION_USER_ID"], "alice");
}

#[tokio::test]
async fn maintenance_republishes_orphaned_pending_jobs() {
    let h = harness(vec![]);
    // A record whose publish never happened, as after a broker outage.
    let job = h
        .storage
        .create_job("alice", "stranded", &HashMap::new())
        .await
        .unwrap();

    maintenance_pass(&h.ctx).await.unwrap();

    let delivery = h
        .queue
        .dequeue("agent", Duration::from_secs(600))
        .await
        .unwrap()
        .unwrap();
    let msg: TaskMessage = serde_json::from_str(&delivery.payload).unwrap();
    assert_eq!(msg.job_id, job.id);
    assert_eq!(msg.input, "stranded");

    // Once the message exists the job is no longer an orphan.
    maintenance_pass(&h.ctx).await.unwrap();
    let again = h.queue.dequeue("agent", Duration::from_secs(600)).await.unwrap();
    assert!(again.is_none(), "orphan must not be republished twice");
}

#[tokio::test]
async fn maintenance_requeues_jobs_stuck_in_running() {
    let mut h = harness(vec![]);
    h.ctx.staleness = Duration::ZERO;
    let job = h
        .storage
        .create_job("alice", "stuck", &HashMap::new())
        .await
        .unwrap();
    assert!(h.storage.claim_job(&job.id).await.unwrap());

    maintenance_pass(&h.ctx).await.unwrap();

    let record = h.storage.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Pending);
    let delivery = h
        .queue
        .dequeue("agent", Duration::from_secs(600))
        .await
        .unwrap()
        .unwrap();
    let msg: TaskMessage = serde_json::from_str(&delivery.payload).unwrap();
    assert_eq!(msg.job_id, job.id);
}

#[tokio::test]
async fn submitted_job_reaches_terminal_state_and_stays_there() {
    let h = harness(vec![ok_output("answer")]);
    authenticated_session(&h.storage, "alice").await;
    let gateway = crate::core::gateway::Gateway::new(
        h.storage.clone(),
        h.queue.clone(),
        "agent".to_string(),
    );

    let job_id = gateway
        .submit("alice", "question", HashMap::new())
        .await
        .unwrap();
    let delivery = h
        .queue
        .dequeue("agent", Duration::from_secs(600))
        .await
        .unwrap()
        .unwrap();
    process_delivery(&h.ctx, &delivery).await.unwrap();

    let job = gateway.get(&job_id, "alice").await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result.as_deref(), Some("answer"));

    // Terminal is forever: neither the maintenance pass nor another poll
    // moves the job back.
    maintenance_pass(&h.ctx).await.unwrap();
    let again = gateway.get(&job_id, "alice").await.unwrap();
    assert_eq!(again.status, JobStatus::Completed);
}

#[test]
fn backoff_doubles_and_caps() {
    let policy = RetryPolicy {
        max_attempts: 5,
        base_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(30),
    };
    let first = policy.delay_for(1);
    assert!(first >= Duration::from_millis(500) && first <= Duration::from_millis(550));
    let second = policy.delay_for(2);
    assert!(second >= Duration::from_secs(1) && second <= Duration::from_millis(1100));
    // Far past the doubling range the cap holds.
    let huge = policy.delay_for(12);
    assert!(huge >= Duration::from_secs(30) && huge <= Duration::from_secs(33));
}

#[test]
fn zero_base_delay_stays_zero() {
    let policy = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    };
    assert_eq!(policy.delay_for(1), Duration::ZERO);
    assert_eq!(policy.delay_for(3), Duration::ZERO);
}
