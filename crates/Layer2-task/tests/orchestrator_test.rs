//! Orchestrator 통합 테스트 - in-memory 세션 런타임으로 spawn/완료/취소 검증
//!
//! `cargo test -p conductor-task --test orchestrator_test`

use async_trait::async_trait;
use conductor_foundation::{ConcurrencyConfig, ConductorConfig, Error, Result};
use conductor_task::{
    AdmissionController, ExternalLinkage, JsonLinkageStore, LinkageRecord, LinkageStore,
    MessagePart, Orchestrator, PromptRequest, PromptSource, SessionClient, SessionMessage,
    SessionStatus, SpawnRequest, StaticAgentValidator, TaskFilter, TaskStatus,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Fake runtime
// ============================================================================

#[derive(Default)]
struct FakeRuntime {
    next_id: AtomicUsize,
    fail_create: AtomicBool,
    /// Session creation never returns
    hang_create: AtomicBool,
    fail_prompt: AtomicBool,
    /// Answer every prompt with `canned_reply` and go idle
    finish_on_prompt: AtomicBool,
    canned_reply: Mutex<String>,
    prompts: Mutex<Vec<(String, PromptRequest)>>,
    aborted: Mutex<Vec<String>>,
    statuses: Mutex<HashMap<String, SessionStatus>>,
    messages: Mutex<HashMap<String, Vec<SessionMessage>>>,
}

impl FakeRuntime {
    fn created(&self) -> usize {
        self.next_id.load(Ordering::SeqCst)
    }

    fn prompt_count(&self) -> usize {
        self.prompts.lock().len()
    }

    fn reply(&self, session_id: &str, text: &str) {
        self.messages
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .push(SessionMessage::assistant(
                "msg",
                vec![MessagePart::Text { text: text.into() }],
            ));
    }

    fn set_status(&self, session_id: &str, status: SessionStatus) {
        self.statuses.lock().insert(session_id.to_string(), status);
    }
}

#[async_trait]
impl SessionClient for FakeRuntime {
    async fn create(&self, _title: &str, _parent: Option<&str>) -> Result<String> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::Session("runtime refused session".into()));
        }
        if self.hang_create.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("ses-{}", n))
    }

    async fn prompt(&self, session_id: &str, request: PromptRequest) -> Result<()> {
        self.prompts
            .lock()
            .push((session_id.to_string(), request));
        if self.fail_prompt.load(Ordering::SeqCst) {
            return Err(Error::Session("runtime unavailable".into()));
        }
        if self.finish_on_prompt.load(Ordering::SeqCst) {
            let reply = self.canned_reply.lock().clone();
            self.reply(session_id, &reply);
            self.set_status(session_id, SessionStatus::Idle);
        }
        Ok(())
    }

    async fn abort(&self, session_id: &str) -> Result<()> {
        self.aborted.lock().push(session_id.to_string());
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<SessionStatus> {
        Ok(self
            .statuses
            .lock()
            .get(session_id)
            .copied()
            .unwrap_or(SessionStatus::Busy))
    }

    async fn statuses(&self) -> Result<HashMap<String, SessionStatus>> {
        Ok(self.statuses.lock().clone())
    }

    async fn messages(&self, session_id: &str) -> Result<Vec<SessionMessage>> {
        Ok(self
            .messages
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }
}

struct FailingLinkageStore;

#[async_trait]
impl LinkageStore for FailingLinkageStore {
    async fn persist(&self, _linkage: &ExternalLinkage, _record: &LinkageRecord) -> Result<()> {
        Err(Error::Storage("disk full".into()))
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn test_config() -> ConductorConfig {
    let mut config = ConductorConfig::default();
    config.concurrency = ConcurrencyConfig::unlimited();
    config.observer.base_interval_ms = 10;
    config.observer.max_interval_ms = 50;
    config.observer.min_runtime_ms = 0;
    config.spawn.wait_poll_interval_ms = 10;
    config
}

fn limited(limit: usize, queue_timeout: Duration) -> Arc<AdmissionController> {
    Arc::new(AdmissionController::new(
        ConcurrencyConfig::default()
            .with_default_limit(limit)
            .with_min_start_interval(Duration::ZERO)
            .with_queue_timeout(queue_timeout),
    ))
}

fn request(description: &str) -> SpawnRequest {
    SpawnRequest::new("forager", "Implement the thing", description)
}

/// Wait (up to 2s) for a condition driven by background tasks
async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

// ============================================================================
// Spawn
// ============================================================================

#[tokio::test]
async fn test_spawn_twice_with_same_key_returns_existing() {
    let runtime = Arc::new(FakeRuntime::default());
    let orchestrator = Orchestrator::builder(runtime.clone())
        .config(test_config())
        .build();

    let first = orchestrator
        .spawn(request("login").with_idempotency_key("k1"))
        .await
        .unwrap();
    assert!(!first.was_existing);
    assert_eq!(first.task.status, TaskStatus::Running);
    assert!(first.task.started_at.is_some());

    let second = orchestrator
        .spawn(request("login again").with_idempotency_key("k1"))
        .await
        .unwrap();
    assert!(second.was_existing);
    assert_eq!(second.task.id, first.task.id);

    eventually(|| runtime.prompt_count() == 1).await;
    assert_eq!(runtime.created(), 1);
    assert_eq!(orchestrator.list(None).len(), 1);

    // Still the same record once it is terminal
    orchestrator
        .handle_session_idle(&first.task.session_id)
        .unwrap();
    let third = orchestrator
        .spawn(request("login").with_idempotency_key("k1"))
        .await
        .unwrap();
    assert!(third.was_existing);
    assert_eq!(third.task.status, TaskStatus::Completed);
    assert_eq!(runtime.created(), 1);
}

#[tokio::test]
async fn test_unknown_agent_rejected_before_session() {
    let runtime = Arc::new(FakeRuntime::default());
    let orchestrator = Orchestrator::builder(runtime.clone())
        .config(test_config())
        .validator(Arc::new(StaticAgentValidator::new(["forager", "scout"])))
        .build();

    let err = orchestrator
        .spawn(SpawnRequest::new("architect", "design it", "design"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(runtime.created(), 0);
    assert!(orchestrator.ledger().is_empty());
}

#[tokio::test]
async fn test_session_create_failure_leaves_nothing_behind() {
    let runtime = Arc::new(FakeRuntime::default());
    runtime.fail_create.store(true, Ordering::SeqCst);
    let gate = limited(1, Duration::from_secs(1));
    let orchestrator = Orchestrator::builder(runtime.clone())
        .config(test_config())
        .admission(gate.clone())
        .build();

    let err = orchestrator.spawn(request("login")).await.unwrap_err();

    assert!(matches!(err, Error::Session(_)));
    assert!(orchestrator.ledger().is_empty());
    assert_eq!(gate.in_use("forager"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_spawn_returns_its_slot() {
    let runtime = Arc::new(FakeRuntime::default());
    runtime.hang_create.store(true, Ordering::SeqCst);
    let gate = limited(1, Duration::from_secs(1));
    let orchestrator = Orchestrator::builder(runtime.clone())
        .config(test_config())
        .admission(gate.clone())
        .build();

    // Caller gives up while the session is still being created
    let abandoned =
        tokio::time::timeout(Duration::from_millis(50), orchestrator.spawn(request("login"))).await;
    assert!(abandoned.is_err());
    assert_eq!(gate.in_use("forager"), 0);

    runtime.hang_create.store(false, Ordering::SeqCst);
    let outcome = orchestrator.spawn(request("login")).await.unwrap();
    assert_eq!(outcome.task.status, TaskStatus::Running);
    assert_eq!(gate.in_use("forager"), 1);
    assert_eq!(orchestrator.list(None).len(), 1);
}

#[tokio::test]
async fn test_dispatch_failure_recorded_as_error() {
    let runtime = Arc::new(FakeRuntime::default());
    runtime.fail_prompt.store(true, Ordering::SeqCst);
    let gate = limited(2, Duration::from_secs(1));
    let orchestrator = Orchestrator::builder(runtime.clone())
        .config(test_config())
        .admission(gate.clone())
        .build();

    let outcome = orchestrator.spawn(request("login")).await.unwrap();
    let id = outcome.task.id;

    eventually(|| orchestrator.get_task(id).unwrap().status == TaskStatus::Error).await;

    let record = orchestrator.get_task(id).unwrap();
    assert!(record
        .error_message
        .as_deref()
        .unwrap()
        .contains("runtime unavailable"));
    assert!(record.completed_at.is_some());
    assert_eq!(gate.in_use("forager"), 0);
}

#[tokio::test]
async fn test_prompt_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let prompt_path = dir.path().join("prompt.md");
    std::fs::write(&prompt_path, "Large prompt body").unwrap();

    let runtime = Arc::new(FakeRuntime::default());
    let orchestrator = Orchestrator::builder(runtime.clone())
        .config(test_config())
        .build();

    orchestrator
        .spawn(SpawnRequest::new(
            "forager",
            PromptSource::File(prompt_path),
            "from file",
        ))
        .await
        .unwrap();
    eventually(|| runtime.prompt_count() == 1).await;
    assert_eq!(runtime.prompts.lock()[0].1.content, "Large prompt body");

    let err = orchestrator
        .spawn(SpawnRequest::new(
            "forager",
            PromptSource::File(dir.path().join("missing.md")),
            "missing",
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
    assert_eq!(runtime.created(), 1);
}

#[tokio::test]
async fn test_model_is_admission_key_and_passed_to_runtime() {
    let runtime = Arc::new(FakeRuntime::default());
    let gate = limited(1, Duration::from_secs(1));
    let orchestrator = Orchestrator::builder(runtime.clone())
        .config(test_config())
        .admission(gate.clone())
        .build();

    orchestrator
        .spawn(request("login").with_model("anthropic/claude-sonnet"))
        .await
        .unwrap();

    assert_eq!(gate.in_use("anthropic/claude-sonnet"), 1);
    assert_eq!(gate.in_use("forager"), 0);
    eventually(|| runtime.prompt_count() == 1).await;
    assert_eq!(
        runtime.prompts.lock()[0].1.model.as_deref(),
        Some("anthropic/claude-sonnet")
    );
}

// ============================================================================
// Admission
// ============================================================================

#[tokio::test]
async fn test_third_spawn_waits_for_release() {
    let runtime = Arc::new(FakeRuntime::default());
    let gate = limited(2, Duration::from_secs(30));
    let orchestrator = Orchestrator::builder(runtime.clone())
        .config(test_config())
        .admission(gate.clone())
        .build();

    let first = orchestrator.spawn(request("one")).await.unwrap();
    orchestrator.spawn(request("two")).await.unwrap();
    assert_eq!(gate.in_use("forager"), 2);

    let third = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.spawn(request("three")).await }
    });
    eventually(|| gate.queue_len("forager") == 1).await;
    assert_eq!(runtime.created(), 2);

    orchestrator
        .handle_session_idle(&first.task.session_id)
        .unwrap();

    let third = third.await.unwrap().unwrap();
    assert!(!third.was_existing);
    assert_eq!(third.task.status, TaskStatus::Running);
    assert_eq!(gate.in_use("forager"), 2);
    assert_eq!(runtime.created(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_queue_timeout_fails_spawn() {
    let runtime = Arc::new(FakeRuntime::default());
    let gate = limited(1, Duration::from_millis(100));
    let orchestrator = Orchestrator::builder(runtime.clone())
        .config(test_config())
        .admission(gate.clone())
        .build();

    orchestrator.spawn(request("one")).await.unwrap();

    let started = tokio::time::Instant::now();
    let err = orchestrator.spawn(request("two")).await.unwrap_err();

    assert!(matches!(err, Error::Timeout(_)));
    assert!(err.is_retryable());
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(runtime.created(), 1);
    assert_eq!(orchestrator.list(None).len(), 1);
}

#[tokio::test]
async fn test_shutdown_rejects_queued_spawns() {
    let runtime = Arc::new(FakeRuntime::default());
    let gate = limited(1, Duration::from_secs(30));
    let orchestrator = Orchestrator::builder(runtime.clone())
        .config(test_config())
        .admission(gate.clone())
        .build();
    let handle = orchestrator.start();

    orchestrator.spawn(request("one")).await.unwrap();
    let queued = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.spawn(request("two")).await }
    });
    eventually(|| gate.queue_len("forager") == 1).await;

    handle.shutdown().await;

    let err = queued.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(runtime.created(), 1);
}

// ============================================================================
// Cancel / Complete
// ============================================================================

#[tokio::test]
async fn test_cancel_on_completed_fails() {
    let runtime = Arc::new(FakeRuntime::default());
    let orchestrator = Orchestrator::builder(runtime.clone())
        .config(test_config())
        .build();

    let outcome = orchestrator.spawn(request("login")).await.unwrap();
    let completed = orchestrator
        .handle_session_idle(&outcome.task.session_id)
        .unwrap()
        .unwrap();
    assert_eq!(completed.status, TaskStatus::Completed);

    let err = orchestrator.cancel(outcome.task.id).await.unwrap_err();
    assert!(err.is_lifecycle());

    let after = orchestrator.get_task(outcome.task.id).unwrap();
    assert_eq!(after, completed);
    assert!(runtime.aborted.lock().is_empty());
}

#[tokio::test]
async fn test_cancel_aborts_session_and_releases_slot() {
    let runtime = Arc::new(FakeRuntime::default());
    let gate = limited(1, Duration::from_secs(1));
    let orchestrator = Orchestrator::builder(runtime.clone())
        .config(test_config())
        .admission(gate.clone())
        .build();

    let outcome = orchestrator.spawn(request("login")).await.unwrap();
    let cancelled = orchestrator.cancel(outcome.task.id).await.unwrap();

    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert_eq!(*runtime.aborted.lock(), vec![outcome.task.session_id.clone()]);
    assert_eq!(gate.in_use("forager"), 0);

    // Completion after cancel is ignored, and the slot is not released twice
    let record = orchestrator
        .handle_session_idle(&outcome.task.session_id)
        .unwrap()
        .unwrap();
    assert_eq!(record.status, TaskStatus::Cancelled);
    assert_eq!(gate.in_use("forager"), 0);
}

#[tokio::test]
async fn test_cancel_all_under_parent() {
    let runtime = Arc::new(FakeRuntime::default());
    let orchestrator = Orchestrator::builder(runtime.clone())
        .config(test_config())
        .build();

    let a = orchestrator
        .spawn(request("a").with_parent("parent-1", None))
        .await
        .unwrap();
    orchestrator
        .spawn(request("b").with_parent("parent-1", None))
        .await
        .unwrap();
    orchestrator
        .spawn(request("c").with_parent("parent-1", None))
        .await
        .unwrap();
    let other = orchestrator
        .spawn(request("d").with_parent("parent-2", None))
        .await
        .unwrap();
    orchestrator.handle_session_idle(&a.task.session_id).unwrap();

    let cancelled = orchestrator.cancel_all("parent-1").await;
    assert_eq!(cancelled.len(), 2);
    assert!(cancelled.iter().all(|r| r.status == TaskStatus::Cancelled));
    assert_eq!(runtime.aborted.lock().len(), 2);

    assert_eq!(
        orchestrator.get_task(other.task.id).unwrap().status,
        TaskStatus::Running
    );
    let counts = orchestrator.get_counts();
    assert_eq!(counts[&TaskStatus::Completed], 1);
    assert_eq!(counts[&TaskStatus::Cancelled], 2);
    assert_eq!(counts[&TaskStatus::Running], 1);
}

#[tokio::test]
async fn test_update_status_rejects_illegal_transition() {
    let runtime = Arc::new(FakeRuntime::default());
    let orchestrator = Orchestrator::builder(runtime.clone())
        .config(test_config())
        .build();

    let outcome = orchestrator.spawn(request("login")).await.unwrap();
    let blocked = orchestrator
        .update_status(outcome.task.id, TaskStatus::Blocked, None)
        .unwrap();
    assert_eq!(blocked.status, TaskStatus::Blocked);

    let err = orchestrator
        .update_status(outcome.task.id, TaskStatus::Completed, None)
        .unwrap_err();
    assert!(err.is_lifecycle());

    let failed = orchestrator
        .update_status(
            outcome.task.id,
            TaskStatus::Failed,
            Some("gave up".to_string()),
        )
        .unwrap();
    assert_eq!(failed.error_message.as_deref(), Some("gave up"));
}

// ============================================================================
// Observer / Output
// ============================================================================

#[tokio::test]
async fn test_observer_completion_and_output() {
    let runtime = Arc::new(FakeRuntime::default());
    let orchestrator = Orchestrator::builder(runtime.clone())
        .config(test_config())
        .build();

    let outcome = orchestrator.spawn(request("login")).await.unwrap();
    let session = outcome.task.session_id.clone();
    runtime.reply(&session, "Implemented login");

    let report = orchestrator.poll_now().await;
    assert_eq!(report.grew, 1);
    let observation = orchestrator
        .get_task_observation(outcome.task.id)
        .unwrap();
    assert_eq!(observation.message_count, 1);
    assert_eq!(orchestrator.get_observations().len(), 1);

    runtime.set_status(&session, SessionStatus::Idle);
    let report = orchestrator.poll_now().await;
    assert_eq!(report.completions.len(), 1);

    let output = orchestrator
        .wait_for_output(outcome.task.id, Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert!(!output.timed_out);
    assert_eq!(output.task.status, TaskStatus::Completed);
    assert_eq!(
        output.output.unwrap().inline_text(),
        Some("Implemented login")
    );
}

#[tokio::test]
async fn test_large_output_written_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.spawn = config.spawn.with_output_dir(dir.path());
    config.spawn.inline_output_limit = 8;

    let runtime = Arc::new(FakeRuntime::default());
    let orchestrator = Orchestrator::builder(runtime.clone()).config(config).build();

    let outcome = orchestrator.spawn(request("login")).await.unwrap();
    runtime.reply(&outcome.task.session_id, "a fairly long report");
    orchestrator
        .handle_session_idle(&outcome.task.session_id)
        .unwrap();

    let output = orchestrator.task_output(outcome.task.id).await.unwrap();
    let path = output.output.as_ref().unwrap().path().unwrap().to_path_buf();
    assert_eq!(path, dir.path().join(format!("{}.output", outcome.task.id)));
    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "a fairly long report"
    );
    assert_eq!(output.task.output_path, Some(path));
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_output_times_out() {
    let runtime = Arc::new(FakeRuntime::default());
    let orchestrator = Orchestrator::builder(runtime.clone())
        .config(test_config())
        .build();

    let outcome = orchestrator.spawn(request("login")).await.unwrap();
    let output = orchestrator
        .wait_for_output(outcome.task.id, Some(Duration::from_millis(100)))
        .await
        .unwrap();

    assert!(output.timed_out);
    assert!(output.output.is_none());
    assert_eq!(output.task.status, TaskStatus::Running);
}

#[tokio::test]
async fn test_spawn_and_wait_with_observer_loop() {
    let runtime = Arc::new(FakeRuntime::default());
    runtime.finish_on_prompt.store(true, Ordering::SeqCst);
    *runtime.canned_reply.lock() = "All done".to_string();

    let orchestrator = Orchestrator::builder(runtime.clone())
        .config(test_config())
        .build();
    let handle = orchestrator.start();

    let result = orchestrator
        .spawn_and_wait(request("login"), Some(Duration::from_secs(5)))
        .await
        .unwrap();

    assert!(!result.spawn.was_existing);
    assert!(!result.output.timed_out);
    assert_eq!(result.output.task.status, TaskStatus::Completed);
    assert_eq!(
        result.output.output.as_ref().and_then(|o| o.inline_text()),
        Some("All done")
    );

    handle.shutdown().await;
}

// ============================================================================
// Linkage
// ============================================================================

#[tokio::test]
async fn test_linkage_persisted_and_guards_live_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonLinkageStore::new(dir.path()));
    let runtime = Arc::new(FakeRuntime::default());
    let orchestrator = Orchestrator::builder(runtime.clone())
        .config(test_config())
        .linkage_store(store.clone())
        .build();
    let linkage = ExternalLinkage::new("auth", "01-login");

    let first = orchestrator
        .spawn(
            request("login")
                .with_idempotency_key("auth-01")
                .with_external_linkage(linkage.clone()),
        )
        .await
        .unwrap();
    assert!(first.persistence_error.is_none());

    let stored = store.load(&linkage).unwrap().unwrap();
    assert_eq!(stored.idempotency_key.as_deref(), Some("auth-01"));
    assert_eq!(stored.session.task_id, first.task.id);

    let again = orchestrator
        .spawn(request("login").with_external_linkage(linkage.clone()))
        .await
        .unwrap();
    assert!(again.was_existing);
    assert_eq!(again.task.id, first.task.id);

    // A finished linkage may be worked on again
    orchestrator.cancel(first.task.id).await.unwrap();
    let retry = orchestrator
        .spawn(request("login").with_external_linkage(linkage.clone()))
        .await
        .unwrap();
    assert!(!retry.was_existing);
    assert_eq!(
        orchestrator
            .get_task_by_external_linkage(&linkage)
            .map(|r| r.id),
        Some(retry.task.id)
    );
}

#[tokio::test]
async fn test_linkage_failure_is_reported_not_raised() {
    let runtime = Arc::new(FakeRuntime::default());
    let orchestrator = Orchestrator::builder(runtime.clone())
        .config(test_config())
        .linkage_store(Arc::new(FailingLinkageStore))
        .build();

    let outcome = orchestrator
        .spawn(request("login").with_external_linkage(ExternalLinkage::new("auth", "01")))
        .await
        .unwrap();

    assert!(outcome
        .persistence_error
        .as_deref()
        .unwrap()
        .contains("disk full"));
    assert_eq!(outcome.task.status, TaskStatus::Running);
    assert_eq!(
        orchestrator
            .list(Some(&TaskFilter::new().with_status(TaskStatus::Running)))
            .len(),
        1
    );
}
