//! Orchestrator - background task spawn/cancel/completion
//!
//! The only component that applies status transitions. It wires together:
//! - [`TaskLedger`] for records and the lifecycle state machine
//! - an optional [`AdmissionGate`] for per-key concurrency
//! - [`ActivityObserver`] for completion detection
//! - the external [`SessionClient`], [`AgentValidator`] and [`LinkageStore`]
//!
//! ## Spawn order
//!
//! 1. idempotency guard (existing record returned as-is)
//! 2. prompt resolution and agent validation
//! 3. admission slot
//! 4. session creation
//! 5. ledger record (`spawned` then `running`)
//! 6. fire-and-forget prompt dispatch
//! 7. best-effort linkage persistence
//!
//! Nothing is written to the ledger until a session exists, so a failure in
//! steps 2-4 leaves nothing to clean up.
//!
//! ## 사용 예시
//!
//! ```ignore
//! let orchestrator = Orchestrator::builder(client)
//!     .config(ConductorConfig::load()?)
//!     .with_admission_controller()
//!     .build();
//! let handle = orchestrator.start();
//!
//! let outcome = orchestrator
//!     .spawn(SpawnRequest::new("forager", "Implement login", "login task").with_idempotency_key("k1"))
//!     .await?;
//! let output = orchestrator.wait_for_output(outcome.task.id, None).await?;
//!
//! handle.shutdown().await;
//! ```

use crate::admission::{AdmissionController, AdmissionGate};
use crate::ledger::{LedgerError, StatusExtra, TaskFilter, TaskLedger};
use crate::linkage::{LinkageRecord, LinkageStore};
use crate::observer::{ActivityObserver, CompletionSignal, PollReport, TaskObservation};
use crate::output::{collect_text, materialize, OutputPayload};
use crate::session::{AgentValidator, PromptRequest, SessionClient, StaticAgentValidator};
use crate::state::TaskStatus;
use crate::task::{ExternalLinkage, TaskId, TaskRecord, TaskSpec};
use conductor_foundation::{ConductorConfig, Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

// ============================================================================
// Requests / Results
// ============================================================================

/// Where the prompt text comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptSource {
    Inline(String),
    /// Large prompts are passed by path and read at spawn time
    File(PathBuf),
}

impl PromptSource {
    async fn resolve(&self) -> Result<String> {
        let content = match self {
            PromptSource::Inline(text) => text.clone(),
            PromptSource::File(path) => tokio::fs::read_to_string(path).await.map_err(|e| {
                Error::InvalidInput(format!(
                    "Failed to read prompt file {}: {}",
                    path.display(),
                    e
                ))
            })?,
        };

        if content.trim().is_empty() {
            return Err(Error::InvalidInput("Prompt is empty".to_string()));
        }
        Ok(content)
    }
}

impl From<String> for PromptSource {
    fn from(text: String) -> Self {
        PromptSource::Inline(text)
    }
}

impl From<&str> for PromptSource {
    fn from(text: &str) -> Self {
        PromptSource::Inline(text.to_string())
    }
}

/// Spawn input
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub agent: String,
    pub prompt: PromptSource,
    pub description: String,
    pub model: Option<String>,
    pub idempotency_key: Option<String>,
    pub parent_session_id: Option<String>,
    pub parent_message_id: Option<String>,
    pub external_linkage: Option<ExternalLinkage>,
}

impl SpawnRequest {
    pub fn new(
        agent: impl Into<String>,
        prompt: impl Into<PromptSource>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            agent: agent.into(),
            prompt: prompt.into(),
            description: description.into(),
            model: None,
            idempotency_key: None,
            parent_session_id: None,
            parent_message_id: None,
            external_linkage: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_parent(
        mut self,
        session_id: impl Into<String>,
        message_id: Option<String>,
    ) -> Self {
        self.parent_session_id = Some(session_id.into());
        self.parent_message_id = message_id;
        self
    }

    pub fn with_external_linkage(mut self, linkage: ExternalLinkage) -> Self {
        self.external_linkage = Some(linkage);
        self
    }

    fn admission_key(&self) -> &str {
        self.model.as_deref().unwrap_or(&self.agent)
    }

    fn task_spec(&self, session_id: &str) -> TaskSpec {
        let mut spec = TaskSpec::new(session_id, &self.agent, &self.description);
        spec.model = self.model.clone();
        spec.idempotency_key = self.idempotency_key.clone();
        spec.parent_session_id = self.parent_session_id.clone();
        spec.parent_message_id = self.parent_message_id.clone();
        spec.external_linkage = self.external_linkage.clone();
        spec
    }
}

/// Spawn result
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnOutcome {
    pub task: TaskRecord,
    /// An existing record was returned; no session was created
    pub was_existing: bool,
    /// Linkage persistence failed (the spawn itself succeeded)
    pub persistence_error: Option<String>,
}

impl SpawnOutcome {
    fn existing(task: TaskRecord) -> Self {
        Self {
            task,
            was_existing: true,
            persistence_error: None,
        }
    }
}

/// Task record plus whatever output it has produced
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutput {
    pub task: TaskRecord,
    pub output: Option<OutputPayload>,
    /// A blocking wait expired before the task finished
    pub timed_out: bool,
}

/// Result of [`Orchestrator::spawn_and_wait`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnAndWait {
    pub spawn: SpawnOutcome,
    pub output: TaskOutput,
}

/// Internal events, applied by the event pump
#[derive(Debug)]
enum TaskEvent {
    Completion(CompletionSignal),
    DispatchFailed { task_id: TaskId, error: String },
}

// ============================================================================
// Builder
// ============================================================================

pub struct OrchestratorBuilder {
    config: ConductorConfig,
    client: Arc<dyn SessionClient>,
    validator: Option<Arc<dyn AgentValidator>>,
    admission: Option<Arc<dyn AdmissionGate>>,
    use_admission_controller: bool,
    linkage: Option<Arc<dyn LinkageStore>>,
    ledger: Option<Arc<TaskLedger>>,
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: ConductorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn validator(mut self, validator: Arc<dyn AgentValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Install a custom admission gate
    pub fn admission(mut self, gate: Arc<dyn AdmissionGate>) -> Self {
        self.admission = Some(gate);
        self
    }

    /// Install an [`AdmissionController`] built from `config.concurrency`
    pub fn with_admission_controller(mut self) -> Self {
        self.use_admission_controller = true;
        self
    }

    pub fn linkage_store(mut self, store: Arc<dyn LinkageStore>) -> Self {
        self.linkage = Some(store);
        self
    }

    pub fn ledger(mut self, ledger: Arc<TaskLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Build the orchestrator and start its event pump.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn build(self) -> Arc<Orchestrator> {
        let ledger = self.ledger.unwrap_or_default();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let completion_tx = events_tx.clone();
        let observer = ActivityObserver::new(
            self.config.observer.clone(),
            ledger.clone(),
            self.client.clone(),
        )
        .with_completion_callback(Arc::new(move |signal| {
            let _ = completion_tx.send(TaskEvent::Completion(signal));
        }));

        let admission = match self.admission {
            Some(gate) => Some(gate),
            None if self.use_admission_controller => Some(Arc::new(AdmissionController::new(
                self.config.concurrency.clone(),
            )) as Arc<dyn AdmissionGate>),
            None => None,
        };

        let orchestrator = Arc::new(Orchestrator {
            config: self.config,
            ledger,
            client: self.client,
            validator: self
                .validator
                .unwrap_or_else(|| Arc::new(StaticAgentValidator::permissive())),
            admission,
            linkage: self.linkage,
            observer: Arc::new(observer),
            events: events_tx,
            held_slots: Mutex::new(HashMap::new()),
        });

        tokio::spawn(event_pump(Arc::downgrade(&orchestrator), events_rx));
        orchestrator
    }
}

/// Slot acquired by an in-flight spawn.
///
/// Released on drop until [`SlotPermit::keep`] moves it to the task.
struct SlotPermit<'a> {
    gate: Option<&'a Arc<dyn AdmissionGate>>,
    key: String,
}

impl<'a> SlotPermit<'a> {
    fn new(gate: &'a Arc<dyn AdmissionGate>, key: String) -> Self {
        Self {
            gate: Some(gate),
            key,
        }
    }

    /// Stop releasing on drop and hand back the admission key
    fn keep(mut self) -> String {
        self.gate = None;
        std::mem::take(&mut self.key)
    }
}

impl Drop for SlotPermit<'_> {
    fn drop(&mut self) {
        if let Some(gate) = self.gate {
            debug!("Releasing unused slot on '{}'", self.key);
            gate.release(&self.key);
        }
    }
}

async fn event_pump(
    orchestrator: Weak<Orchestrator>,
    mut events: mpsc::UnboundedReceiver<TaskEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(orchestrator) = orchestrator.upgrade() else {
            break;
        };
        orchestrator.apply_event(event);
    }
    debug!("Orchestrator event pump stopped");
}

/// Handle for the background observer loop
pub struct OrchestratorHandle {
    shutdown: watch::Sender<bool>,
    observer_task: JoinHandle<()>,
    admission: Option<Arc<dyn AdmissionGate>>,
}

impl OrchestratorHandle {
    /// Stop polling and reject every pending admission waiter
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.observer_task.await {
            warn!("Observer task ended abnormally: {}", e);
        }
        if let Some(gate) = self.admission {
            let rejected = gate.cancel_all();
            if rejected > 0 {
                info!("Rejected {} queued spawn(s) on shutdown", rejected);
            }
        }
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct Orchestrator {
    config: ConductorConfig,
    ledger: Arc<TaskLedger>,
    client: Arc<dyn SessionClient>,
    validator: Arc<dyn AgentValidator>,
    admission: Option<Arc<dyn AdmissionGate>>,
    linkage: Option<Arc<dyn LinkageStore>>,
    observer: Arc<ActivityObserver>,
    events: mpsc::UnboundedSender<TaskEvent>,
    /// Admission key per task holding a slot; removed on release
    held_slots: Mutex<HashMap<TaskId, String>>,
}

impl Orchestrator {
    pub fn builder(client: Arc<dyn SessionClient>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config: ConductorConfig::default(),
            client,
            validator: None,
            admission: None,
            use_admission_controller: false,
            linkage: None,
            ledger: None,
        }
    }

    pub fn config(&self) -> &ConductorConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<TaskLedger> {
        &self.ledger
    }

    pub fn admission(&self) -> Option<&Arc<dyn AdmissionGate>> {
        self.admission.as_ref()
    }

    /// Start the observer loop
    pub fn start(&self) -> OrchestratorHandle {
        let (tx, rx) = watch::channel(false);
        let observer_task = tokio::spawn(self.observer.clone().run(rx));
        OrchestratorHandle {
            shutdown: tx,
            observer_task,
            admission: self.admission.clone(),
        }
    }

    /// Run one observer cycle now
    pub async fn poll_now(&self) -> PollReport {
        self.observer.poll_once().await
    }

    // ========================================================================
    // Spawn
    // ========================================================================

    pub async fn spawn(&self, request: SpawnRequest) -> Result<SpawnOutcome> {
        if let Some(existing) = self.find_existing(&request) {
            info!(
                "Spawn for '{}' matched existing task {} ({})",
                request.description, existing.id, existing.status
            );
            return Ok(SpawnOutcome::existing(existing));
        }

        let prompt = request.prompt.resolve().await?;

        let validation = self.validator.validate(&request.agent).await;
        if !validation.valid {
            let reason = validation
                .error
                .unwrap_or_else(|| format!("Agent '{}' was rejected", request.agent));
            warn!("Spawn rejected: {}", reason);
            return Err(Error::Validation(reason));
        }

        let permit = match self.admission {
            Some(ref gate) => {
                let key = request.admission_key().to_string();
                gate.acquire(&key).await?;
                Some(SlotPermit::new(gate, key))
            }
            None => None,
        };

        let session_id = match self
            .client
            .create(&request.description, request.parent_session_id.as_deref())
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!("Session creation failed for '{}': {}", request.description, e);
                return Err(Error::Session(format!("Failed to create session: {}", e)));
            }
        };

        let record = match self.ledger.create(request.task_spec(&session_id)) {
            Ok(record) => record,
            Err(LedgerError::DuplicateIdempotencyKey { existing, .. }) => {
                // A concurrent spawn with the same key won the race
                drop(permit);
                if let Err(e) = self.client.abort(&session_id).await {
                    debug!("Abort of orphan session {} failed: {}", session_id, e);
                }
                let existing = self
                    .ledger
                    .get(existing)
                    .ok_or_else(|| Error::NotFound(format!("Task {} not found", existing)))?;
                return Ok(SpawnOutcome::existing(existing));
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(permit) = permit {
            self.held_slots.lock().insert(record.id, permit.keep());
        }

        let record = self.transition(record.id, TaskStatus::Running, None)?;
        self.dispatch(&record, prompt);

        let persistence_error = self.persist_linkage(&record).await;

        info!(
            "Spawned task {} (agent {}, session {}): {}",
            record.id, record.agent, record.session_id, record.description
        );
        Ok(SpawnOutcome {
            task: record,
            was_existing: false,
            persistence_error,
        })
    }

    /// Existing record for the same idempotency key (any status), or a live
    /// record for the same linkage
    fn find_existing(&self, request: &SpawnRequest) -> Option<TaskRecord> {
        if let Some(ref key) = request.idempotency_key {
            if let Some(existing) = self.ledger.get_by_idempotency_key(key) {
                return Some(existing);
            }
        }

        request
            .external_linkage
            .as_ref()
            .and_then(|linkage| self.ledger.get_by_external_linkage(linkage))
            .filter(|record| record.is_active())
    }

    fn dispatch(&self, record: &TaskRecord, content: String) {
        let client = self.client.clone();
        let events = self.events.clone();
        let task_id = record.id;
        let session_id = record.session_id.clone();
        let request = PromptRequest {
            agent: record.agent.clone(),
            model: record.model.clone(),
            content,
        };

        tokio::spawn(async move {
            if let Err(e) = client.prompt(&session_id, request).await {
                let _ = events.send(TaskEvent::DispatchFailed {
                    task_id,
                    error: e.to_string(),
                });
            }
        });
    }

    async fn persist_linkage(&self, record: &TaskRecord) -> Option<String> {
        let (Some(store), Some(linkage)) = (&self.linkage, &record.external_linkage) else {
            return None;
        };

        match store
            .persist(linkage, &LinkageRecord::from_task(record))
            .await
        {
            Ok(()) => None,
            Err(e) => {
                warn!("Failed to persist linkage {} for task {}: {}", linkage, record.id, e);
                Some(e.to_string())
            }
        }
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Apply a status change requested by the caller
    pub fn update_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        error_message: Option<String>,
    ) -> Result<TaskRecord> {
        let extra = error_message.map(StatusExtra::error);
        self.transition(id, status, extra)
    }

    /// Cancel a live task. Already-terminal tasks are rejected.
    pub async fn cancel(&self, id: TaskId) -> Result<TaskRecord> {
        let record = self
            .ledger
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("Task {} not found", id)))?;

        if record.is_terminal() {
            return Err(Error::Lifecycle(format!(
                "Task {} is already {}",
                id, record.status
            )));
        }

        if let Err(e) = self.client.abort(&record.session_id).await {
            debug!("Abort of session {} failed: {}", record.session_id, e);
        }

        let record = self.transition(id, TaskStatus::Cancelled, None)?;
        info!("Cancelled task {}", id);
        Ok(record)
    }

    /// Cancel every active task under a parent session, skipping failures
    pub async fn cancel_all(&self, parent_session_id: &str) -> Vec<TaskRecord> {
        let targets = self
            .ledger
            .list(&TaskFilter::new().with_parent_session(parent_session_id))
            .into_iter()
            .filter(|r| r.is_active());

        let mut cancelled = Vec::new();
        for task in targets {
            match self.cancel(task.id).await {
                Ok(record) => cancelled.push(record),
                Err(e) => warn!("Failed to cancel task {}: {}", task.id, e),
            }
        }
        cancelled
    }

    /// Completion entry point, keyed by session. Idempotent.
    pub fn handle_session_idle(&self, session_id: &str) -> Result<Option<TaskRecord>> {
        let Some(record) = self.ledger.get_by_session_id(session_id) else {
            debug!("Idle signal for unknown session {}", session_id);
            return Ok(None);
        };

        if record.status != TaskStatus::Running {
            debug!(
                "Idle signal for task {} ignored ({})",
                record.id, record.status
            );
            return Ok(Some(record));
        }

        let record = self.transition(record.id, TaskStatus::Completed, None)?;
        info!("Task {} completed", record.id);
        Ok(Some(record))
    }

    fn transition(
        &self,
        id: TaskId,
        status: TaskStatus,
        extra: Option<StatusExtra>,
    ) -> Result<TaskRecord> {
        let record = self.ledger.update_status(id, status, extra)?;
        if record.is_terminal() {
            self.release_slot(id);
        }
        Ok(record)
    }

    fn apply_event(&self, event: TaskEvent) {
        match event {
            TaskEvent::Completion(signal) => {
                if let Err(e) = self.handle_session_idle(&signal.session_id) {
                    warn!("Failed to complete task {}: {}", signal.task_id, e);
                }
            }
            TaskEvent::DispatchFailed { task_id, error } => {
                warn!("Prompt dispatch failed for task {}: {}", task_id, error);
                let live = self.ledger.get(task_id).is_some_and(|r| r.is_active());
                if !live {
                    return;
                }
                let extra = Some(StatusExtra::error(error));
                if let Err(e) = self.transition(task_id, TaskStatus::Error, extra) {
                    warn!("Failed to record dispatch error for task {}: {}", task_id, e);
                }
            }
        }
    }

    fn release_slot(&self, id: TaskId) {
        let key = self.held_slots.lock().remove(&id);
        if let (Some(key), Some(gate)) = (key, &self.admission) {
            gate.release(&key);
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn get_task(&self, id: TaskId) -> Option<TaskRecord> {
        self.ledger.get(id)
    }

    pub fn get_task_by_idempotency_key(&self, key: &str) -> Option<TaskRecord> {
        self.ledger.get_by_idempotency_key(key)
    }

    pub fn get_task_by_external_linkage(&self, linkage: &ExternalLinkage) -> Option<TaskRecord> {
        self.ledger.get_by_external_linkage(linkage)
    }

    pub fn list(&self, filter: Option<&TaskFilter>) -> Vec<TaskRecord> {
        match filter {
            Some(filter) => self.ledger.list(filter),
            None => self.ledger.list(&TaskFilter::default()),
        }
    }

    pub fn get_active(&self) -> Vec<TaskRecord> {
        self.ledger.get_active()
    }

    pub fn get_counts(&self) -> HashMap<TaskStatus, usize> {
        self.ledger.count_by_status()
    }

    pub fn get_observations(&self) -> Vec<TaskObservation> {
        self.observer.observations()
    }

    pub fn get_task_observation(&self, id: TaskId) -> Option<TaskObservation> {
        self.observer.observation(id)
    }

    // ========================================================================
    // Output
    // ========================================================================

    /// Current output of a task, without waiting
    pub async fn task_output(&self, id: TaskId) -> Result<TaskOutput> {
        let task = self.require(id)?;
        let output = self.collect_output(&task).await?;
        Ok(TaskOutput {
            task: self.require(id)?,
            output,
            timed_out: false,
        })
    }

    /// Wait for a task to reach a terminal status, then collect its output.
    /// An expired wait returns `timed_out = true` rather than an error.
    pub async fn wait_for_output(&self, id: TaskId, timeout: Option<Duration>) -> Result<TaskOutput> {
        let timeout = timeout.unwrap_or_else(|| self.config.spawn.wait_timeout());
        let deadline = Instant::now() + timeout;
        let poll_interval = self.config.spawn.wait_poll_interval();

        loop {
            let task = self.require(id)?;
            if task.is_terminal() {
                let output = self.collect_output(&task).await?;
                return Ok(TaskOutput {
                    task: self.require(id)?,
                    output,
                    timed_out: false,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                debug!("Wait for task {} timed out after {}ms", id, timeout.as_millis());
                return Ok(TaskOutput {
                    task,
                    output: None,
                    timed_out: true,
                });
            }

            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    /// Spawn, then block until the task finishes (capped)
    pub async fn spawn_and_wait(
        &self,
        request: SpawnRequest,
        timeout: Option<Duration>,
    ) -> Result<SpawnAndWait> {
        let cap = self.config.spawn.sync_wait_cap();
        let timeout = timeout.unwrap_or(cap).min(cap);

        let spawn = self.spawn(request).await?;
        let output = self.wait_for_output(spawn.task.id, Some(timeout)).await?;
        Ok(SpawnAndWait { spawn, output })
    }

    fn require(&self, id: TaskId) -> Result<TaskRecord> {
        self.ledger
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("Task {} not found", id)))
    }

    async fn collect_output(&self, task: &TaskRecord) -> Result<Option<OutputPayload>> {
        if let Some(ref path) = task.output_path {
            let bytes = tokio::fs::metadata(path)
                .await
                .map(|m| m.len() as usize)
                .unwrap_or(0);
            return Ok(Some(OutputPayload::File {
                path: path.clone(),
                bytes,
            }));
        }

        let messages = self.client.messages(&task.session_id).await?;
        let text = collect_text(&messages);
        if text.is_empty() {
            return Ok(None);
        }

        let payload = materialize(
            text,
            self.config.spawn.inline_output_limit,
            &self.config.spawn.output_dir,
            task.id,
        )
        .await?;

        // Only final output is pinned on the record
        if let (Some(path), true) = (payload.path(), task.is_terminal()) {
            self.ledger.set_output_path(task.id, path.to_path_buf())?;
        }
        Ok(Some(payload))
    }
}
