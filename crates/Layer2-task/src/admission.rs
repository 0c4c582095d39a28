//! Admission Controller - per-key concurrency slots
//!
//! Bounds how many tasks may be dispatched at once for a resource key
//! (an agent name or a `provider/model` id). Callers over the limit wait in
//! a FIFO queue; a released slot is handed directly to the oldest waiter.
//!
//! Slots are cooperative accounting only: the controller never stops work
//! that was started without asking it.

use async_trait::async_trait;
use conductor_foundation::{ConcurrencyConfig, Error};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::mem;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Admission errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("Queue timeout for '{key}' after {}ms", .waited.as_millis())]
    QueueTimeout { key: String, waited: Duration },

    #[error("Admission wait for '{0}' was cancelled")]
    Cancelled(String),
}

impl AdmissionError {
    /// Both variants are transient; the caller may try again later
    pub fn is_retryable(&self) -> bool {
        true
    }
}

impl From<AdmissionError> for Error {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::QueueTimeout { .. } => Error::Timeout(err.to_string()),
            AdmissionError::Cancelled(_) => Error::Cancelled,
        }
    }
}

/// Pluggable pre-spawn hook used by the orchestrator
#[async_trait]
pub trait AdmissionGate: Send + Sync {
    /// Wait for a slot under `key`
    async fn acquire(&self, key: &str) -> Result<(), AdmissionError>;

    /// Give back a slot previously granted under `key`
    fn release(&self, key: &str);

    /// Reject every queued waiter on every key; returns how many were rejected
    fn cancel_all(&self) -> usize;
}

/// Snapshot of one key's admission state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionStats {
    pub key: String,
    pub limit: usize,
    pub in_use: usize,
    pub queued: usize,
}

/// Final outcome delivered to a waiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Granted,
    Rejected,
}

/// One-shot settled marker: a waiter leaves `Pending` exactly once
enum WaiterSlot {
    Pending(oneshot::Sender<Settlement>),
    Granted,
    Rejected,
}

struct Waiter {
    id: u64,
    slot: WaiterSlot,
}

impl Waiter {
    /// Settle the waiter. Returns `true` only if the waiting caller
    /// actually received the outcome.
    fn settle(&mut self, outcome: Settlement) -> bool {
        let next = match outcome {
            Settlement::Granted => WaiterSlot::Granted,
            Settlement::Rejected => WaiterSlot::Rejected,
        };
        match mem::replace(&mut self.slot, next) {
            WaiterSlot::Pending(tx) => tx.send(outcome).is_ok(),
            settled => {
                self.slot = settled;
                false
            }
        }
    }

    /// The waiting caller went away (its future was dropped)
    fn is_abandoned(&self) -> bool {
        match &self.slot {
            WaiterSlot::Pending(tx) => tx.is_closed(),
            _ => true,
        }
    }
}

#[derive(Default)]
struct KeyState {
    active: usize,
    waiters: VecDeque<Waiter>,
    last_start: Option<Instant>,
}

#[derive(Default)]
struct AdmissionInner {
    keys: HashMap<String, KeyState>,
    next_waiter_id: u64,
}

enum Admit<'a> {
    Granted,
    Queued(QueuedWaiter<'a>),
}

/// A queued `acquire` call.
///
/// Dropped before it finishes, it leaves the queue; if a release already
/// handed it a slot, that slot is given back.
struct QueuedWaiter<'a> {
    controller: &'a AdmissionController,
    key: &'a str,
    id: u64,
    rx: oneshot::Receiver<Settlement>,
    finished: bool,
}

impl QueuedWaiter<'_> {
    /// Remove the waiter if it is still queued
    fn withdraw(&self) -> bool {
        let mut inner = self.controller.inner.lock();
        let Some(state) = inner.keys.get_mut(self.key) else {
            return false;
        };
        match state.waiters.iter().position(|w| w.id == self.id) {
            Some(pos) => {
                state.waiters.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Outcome delivered before the waiter left the queue.
    /// Closing first means no later release can hand it a slot.
    fn settled(&mut self) -> Option<Settlement> {
        self.rx.close();
        self.rx.try_recv().ok()
    }

    /// Resolve a wait whose deadline passed
    fn expire(&mut self, waited: Duration) -> Result<(), AdmissionError> {
        self.finished = true;
        if self.withdraw() {
            warn!(
                "Queue timeout on '{}' after {}ms",
                self.key,
                waited.as_millis()
            );
            return Err(AdmissionError::QueueTimeout {
                key: self.key.to_string(),
                waited,
            });
        }

        // Settled between the timer firing and taking the lock
        match self.settled() {
            Some(Settlement::Granted) => Ok(()),
            _ => Err(AdmissionError::Cancelled(self.key.to_string())),
        }
    }
}

impl Drop for QueuedWaiter<'_> {
    fn drop(&mut self) {
        if self.finished || self.withdraw() {
            return;
        }
        if self.settled() == Some(Settlement::Granted) {
            debug!("Returning slot on '{}' from a dropped waiter", self.key);
            self.controller.release(self.key);
        }
    }
}

/// Admission Controller
pub struct AdmissionController {
    config: ConcurrencyConfig,
    inner: Mutex<AdmissionInner>,
}

impl AdmissionController {
    pub fn new(config: ConcurrencyConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(AdmissionInner::default()),
        }
    }

    pub fn config(&self) -> &ConcurrencyConfig {
        &self.config
    }

    /// Most specific ceiling for a key (0 = unlimited)
    pub fn get_limit(&self, key: &str) -> usize {
        self.config.resolve_limit(key)
    }

    /// Wait for a slot under `key`.
    ///
    /// Unlimited keys return immediately. Otherwise the minimum start
    /// interval is honored first, then the slot is granted if usage is below
    /// the limit, else the caller queues until a release hands it a slot or
    /// the queue timeout fires.
    pub async fn acquire(&self, key: &str) -> Result<(), AdmissionError> {
        let limit = self.get_limit(key);
        if limit == 0 {
            return Ok(());
        }

        if let Some(delay) = self.start_delay(key) {
            debug!("Delaying start on '{}' by {}ms", key, delay.as_millis());
            tokio::time::sleep(delay).await;
        }

        let mut queued = match self.admit(key, limit) {
            Admit::Granted => return Ok(()),
            Admit::Queued(queued) => queued,
        };

        let queued_at = Instant::now();
        let timeout = self.config.queue_timeout();

        let received = if timeout.is_zero() {
            Ok((&mut queued.rx).await)
        } else {
            tokio::time::timeout(timeout, &mut queued.rx).await
        };

        match received {
            Ok(Ok(Settlement::Granted)) => {
                queued.finished = true;
                debug!(
                    "Slot on '{}' handed off after {}ms",
                    key,
                    queued_at.elapsed().as_millis()
                );
                Ok(())
            }
            Ok(Ok(Settlement::Rejected)) | Ok(Err(_)) => {
                queued.finished = true;
                Err(AdmissionError::Cancelled(key.to_string()))
            }
            Err(_) => queued.expire(timeout),
        }
    }

    /// Grant a free slot or enqueue a waiter for one
    fn admit<'a>(&'a self, key: &'a str, limit: usize) -> Admit<'a> {
        let mut inner = self.inner.lock();
        let id = inner.next_waiter_id;
        inner.next_waiter_id += 1;

        let state = inner.keys.entry(key.to_string()).or_default();
        if state.active < limit {
            state.active += 1;
            state.last_start = Some(Instant::now());
            debug!("Admitted '{}' ({}/{})", key, state.active, limit);
            return Admit::Granted;
        }

        state.waiters.retain(|w| !w.is_abandoned());
        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(Waiter {
            id,
            slot: WaiterSlot::Pending(tx),
        });
        info!(
            "Queued on '{}' at position {} ({}/{} in use)",
            key,
            state.waiters.len(),
            state.active,
            limit
        );

        Admit::Queued(QueuedWaiter {
            controller: self,
            key,
            id,
            rx,
            finished: false,
        })
    }

    /// Non-blocking acquire. Only the ceiling is checked.
    pub fn try_acquire(&self, key: &str) -> bool {
        let limit = self.get_limit(key);
        if limit == 0 {
            return true;
        }

        let mut inner = self.inner.lock();
        let state = inner.keys.entry(key.to_string()).or_default();
        if state.active < limit {
            state.active += 1;
            state.last_start = Some(Instant::now());
            true
        } else {
            false
        }
    }

    /// Give back a slot. The oldest live waiter gets it directly (usage
    /// unchanged); with no waiter, usage drops by one and never below zero.
    pub fn release(&self, key: &str) {
        if self.get_limit(key) == 0 {
            return;
        }

        let mut inner = self.inner.lock();
        let Some(state) = inner.keys.get_mut(key) else {
            return;
        };

        while let Some(mut waiter) = state.waiters.pop_front() {
            if waiter.settle(Settlement::Granted) {
                state.last_start = Some(Instant::now());
                debug!("Handed slot on '{}' to waiter {}", key, waiter.id);
                return;
            }
        }

        state.active = state.active.saturating_sub(1);
        debug!("Released slot on '{}' ({} in use)", key, state.active);
    }

    /// Reject every pending waiter for a key
    pub fn cancel_waiters(&self, key: &str) -> usize {
        let mut inner = self.inner.lock();
        let Some(state) = inner.keys.get_mut(key) else {
            return 0;
        };

        let rejected = reject_all(&mut state.waiters);
        if rejected > 0 {
            info!("Rejected {} waiter(s) on '{}'", rejected, key);
        }
        rejected
    }

    /// Reject every pending waiter on every key
    pub fn cancel_all_waiters(&self) -> usize {
        let mut inner = self.inner.lock();
        let rejected: usize = inner
            .keys
            .values_mut()
            .map(|state| reject_all(&mut state.waiters))
            .sum();
        if rejected > 0 {
            info!("Rejected {} waiter(s) across all keys", rejected);
        }
        rejected
    }

    pub fn in_use(&self, key: &str) -> usize {
        self.inner
            .lock()
            .keys
            .get(key)
            .map(|s| s.active)
            .unwrap_or(0)
    }

    pub fn queue_len(&self, key: &str) -> usize {
        self.inner
            .lock()
            .keys
            .get(key)
            .map(|s| s.waiters.len())
            .unwrap_or(0)
    }

    /// Per-key snapshot, sorted by key
    pub fn stats(&self) -> Vec<AdmissionStats> {
        let inner = self.inner.lock();
        let mut stats: Vec<AdmissionStats> = inner
            .keys
            .iter()
            .map(|(key, state)| AdmissionStats {
                key: key.clone(),
                limit: self.get_limit(key),
                in_use: state.active,
                queued: state.waiters.len(),
            })
            .collect();
        stats.sort_by(|a, b| a.key.cmp(&b.key));
        stats
    }

    /// Remaining wait before the next start on `key` is allowed
    fn start_delay(&self, key: &str) -> Option<Duration> {
        let interval = self.config.min_start_interval();
        if interval.is_zero() {
            return None;
        }

        let inner = self.inner.lock();
        let last = inner.keys.get(key)?.last_start?;
        let elapsed = last.elapsed();
        (elapsed < interval).then(|| interval - elapsed)
    }
}

fn reject_all(waiters: &mut VecDeque<Waiter>) -> usize {
    waiters
        .drain(..)
        .map(|mut w| w.settle(Settlement::Rejected))
        .filter(|delivered| *delivered)
        .count()
}

#[async_trait]
impl AdmissionGate for AdmissionController {
    async fn acquire(&self, key: &str) -> Result<(), AdmissionError> {
        AdmissionController::acquire(self, key).await
    }

    fn release(&self, key: &str) {
        AdmissionController::release(self, key)
    }

    fn cancel_all(&self) -> usize {
        self.cancel_all_waiters()
    }
}
