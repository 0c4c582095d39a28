//! Activity Observer - infers task completion by polling sessions
//!
//! The runtime has no reliable push channel for "this session is done", so
//! the observer polls every active task:
//!
//! 1. An explicit idle/completed session status on a running task completes
//!    it immediately.
//! 2. Otherwise the message count is compared to the previous poll. Growth
//!    resets the stable counter and updates progress. Once the count has
//!    been stable for `stable_threshold` polls, the task has at least one
//!    message, and it has run for `min_runtime`, a stability completion
//!    fires.
//!
//! The observer only writes progress. Completion goes out through a
//! callback; the orchestrator decides what to do with it.

use crate::ledger::TaskLedger;
use crate::session::{MessageRole, SessionClient, SessionMessage, SessionStatus};
use crate::task::{ProgressUpdate, TaskId, TaskRecord};
use chrono::{DateTime, Utc};
use conductor_foundation::ObserverConfig;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Why the observer decided a task is done
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    /// The runtime reported the session idle or completed
    SessionIdle,
    /// Message count stopped changing
    Stability,
}

/// Emitted at most once per task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionSignal {
    pub task_id: TaskId,
    pub session_id: String,
    pub reason: CompletionReason,
}

pub type CompletionCallback = Arc<dyn Fn(CompletionSignal) + Send + Sync>;

/// Read-only view of what the observer knows about a task
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskObservation {
    pub task_id: TaskId,
    pub message_count: usize,
    pub last_activity_at: DateTime<Utc>,
    pub maybe_stuck: bool,
    pub stable_polls: u32,
    pub is_stable: bool,
}

/// Summary of one poll cycle
#[derive(Debug, Clone, Default)]
pub struct PollReport {
    /// Another cycle was already in flight; nothing was done
    pub skipped: bool,
    pub polled: usize,
    pub grew: usize,
    pub completions: Vec<CompletionSignal>,
}

impl PollReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
struct TrackState {
    last_count: usize,
    stable_polls: u32,
    errors: u32,
    signalled: bool,
    stuck_logged: bool,
}

struct ObserverState {
    tracks: HashMap<TaskId, TrackState>,
    interval: Duration,
}

/// Resets the single-flight flag when a cycle ends
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Activity Observer
pub struct ActivityObserver {
    config: ObserverConfig,
    ledger: Arc<TaskLedger>,
    client: Arc<dyn SessionClient>,
    on_complete: Option<CompletionCallback>,
    state: Mutex<ObserverState>,
    in_flight: AtomicBool,
}

impl ActivityObserver {
    pub fn new(
        config: ObserverConfig,
        ledger: Arc<TaskLedger>,
        client: Arc<dyn SessionClient>,
    ) -> Self {
        let interval = config.base_interval();
        Self {
            config,
            ledger,
            client,
            on_complete: None,
            state: Mutex::new(ObserverState {
                tracks: HashMap::new(),
                interval,
            }),
            in_flight: AtomicBool::new(false),
        }
    }

    /// Install the completion callback
    pub fn with_completion_callback(mut self, callback: CompletionCallback) -> Self {
        self.on_complete = Some(callback);
        self
    }

    /// Current adaptive poll interval
    pub fn current_interval(&self) -> Duration {
        self.state.lock().interval
    }

    /// Run one poll cycle. Concurrent calls return a skipped report.
    pub async fn poll_once(&self) -> PollReport {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Poll cycle already in flight, skipping");
            return PollReport::skipped();
        }
        let _guard = FlightGuard(&self.in_flight);

        let active = self.ledger.get_active();
        self.prune(&active);
        if active.is_empty() {
            self.state.lock().interval = self.config.base_interval();
            return PollReport::default();
        }

        let statuses = match self.client.statuses().await {
            Ok(statuses) => statuses,
            Err(e) => {
                debug!("Batch status fetch failed: {}", e);
                HashMap::new()
            }
        };

        let fetches = active
            .iter()
            .map(|task| self.client.messages(&task.session_id));
        let results = join_all(fetches).await;

        let now = Utc::now();
        let mut report = PollReport {
            polled: active.len(),
            ..Default::default()
        };
        let mut progress = Vec::new();

        {
            let mut state = self.state.lock();

            for (task, result) in active.iter().zip(results) {
                let track = state.tracks.entry(task.id).or_default();
                if track.signalled {
                    continue;
                }

                let explicit = statuses.get(&task.session_id).copied();
                if task.status.is_running() && explicit.is_some_and(|s| s.is_finished()) {
                    track.signalled = true;
                    report
                        .completions
                        .push(signal(task, CompletionReason::SessionIdle));
                    continue;
                }

                let messages = match result {
                    Ok(messages) => {
                        track.errors = 0;
                        messages
                    }
                    Err(e) => {
                        track.errors += 1;
                        if track.errors == self.config.error_threshold {
                            warn!(
                                "Task {} message fetch failed {} times in a row: {}",
                                task.id, track.errors, e
                            );
                        }
                        continue;
                    }
                };

                let count = messages.len();
                if count > track.last_count {
                    track.last_count = count;
                    track.stable_polls = 0;
                    report.grew += 1;
                    progress.push((task.id, progress_update(&messages, now)));
                } else {
                    track.stable_polls += 1;
                }

                if self.maybe_stuck(task, now) && !track.stuck_logged {
                    track.stuck_logged = true;
                    warn!(
                        "Task {} may be stuck: no activity for {}s",
                        task.id,
                        task.idle_for(now).as_secs()
                    );
                }

                let stable = task.status.is_running()
                    && explicit != Some(SessionStatus::Busy)
                    && track.stable_polls >= self.config.stable_threshold
                    && track.last_count > 0
                    && task.age(now) >= self.config.min_runtime();
                if stable {
                    track.signalled = true;
                    report
                        .completions
                        .push(signal(task, CompletionReason::Stability));
                }
            }

            self.adapt_interval(&mut state, active.len(), report.grew);
        }

        for (id, update) in progress {
            if let Err(e) = self.ledger.update_progress(id, update) {
                debug!("Skipped progress update for task {}: {}", id, e);
            }
        }

        for completion in &report.completions {
            info!(
                "Task {} looks complete ({:?})",
                completion.task_id, completion.reason
            );
            if let Some(ref callback) = self.on_complete {
                callback(completion.clone());
            }
        }

        report
    }

    /// Poll until `shutdown` flips to `true` or its sender is dropped
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Activity observer started (interval {}ms)",
            self.current_interval().as_millis()
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let interval = self.current_interval();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.poll_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Activity observer stopped");
    }

    /// Observations for every active task
    pub fn observations(&self) -> Vec<TaskObservation> {
        let now = Utc::now();
        let state = self.state.lock();
        self.ledger
            .get_active()
            .iter()
            .map(|task| self.observe(task, state.tracks.get(&task.id), now))
            .collect()
    }

    /// Observation for one task. Polling counters of a terminal task are
    /// discarded, so it reports only its ledger progress.
    pub fn observation(&self, id: TaskId) -> Option<TaskObservation> {
        let task = self.ledger.get(id)?;
        let state = self.state.lock();
        Some(self.observe(&task, state.tracks.get(&id), Utc::now()))
    }

    fn observe(
        &self,
        task: &TaskRecord,
        track: Option<&TrackState>,
        now: DateTime<Utc>,
    ) -> TaskObservation {
        let stable_polls = track.map(|t| t.stable_polls).unwrap_or(0);
        TaskObservation {
            task_id: task.id,
            message_count: task.progress.message_count,
            last_activity_at: task.last_active,
            maybe_stuck: self.maybe_stuck(task, now),
            stable_polls,
            is_stable: stable_polls >= self.config.stable_threshold,
        }
    }

    fn maybe_stuck(&self, task: &TaskRecord, now: DateTime<Utc>) -> bool {
        task.status.is_running()
            && task.age(now) >= self.config.stuck_min_runtime()
            && task.idle_for(now) >= self.config.stuck_threshold()
    }

    /// Drop per-task state for tasks that are no longer active
    fn prune(&self, active: &[TaskRecord]) {
        let ids: HashSet<TaskId> = active.iter().map(|t| t.id).collect();
        self.state.lock().tracks.retain(|id, _| ids.contains(id));
    }

    fn adapt_interval(&self, state: &mut ObserverState, active: usize, grew: usize) {
        let base = self.config.base_interval();
        if grew > 0 {
            state.interval = base;
            return;
        }

        let settled = state
            .tracks
            .values()
            .filter(|t| t.stable_polls >= 2)
            .count();
        if settled * 2 > active {
            let next = state.interval.mul_f64(self.config.backoff_factor.max(1.0));
            state.interval = next.min(self.config.max_interval());
        }
    }
}

fn signal(task: &TaskRecord, reason: CompletionReason) -> CompletionSignal {
    CompletionSignal {
        task_id: task.id,
        session_id: task.session_id.clone(),
        reason,
    }
}

fn progress_update(messages: &[SessionMessage], now: DateTime<Utc>) -> ProgressUpdate {
    let update = ProgressUpdate::message_count(messages.len());
    let last = messages
        .iter()
        .rev()
        .filter(|m| m.role == MessageRole::Assistant)
        .map(|m| (m.text(), m.created_at))
        .find(|(text, _)| !text.is_empty());

    match last {
        Some((text, at)) => update.with_last_message(text, at.unwrap_or(now)),
        None => update,
    }
}
