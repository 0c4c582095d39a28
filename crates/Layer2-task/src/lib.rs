//! # conductor-task
//!
//! Background task orchestration for Conductor.
//! Delegates work to long-running sessions in an external agent runtime and
//! tracks each one through a strict lifecycle.
//!
//! ## Features
//!
//! - Task ledger with a whitelisted state machine and idempotency keys
//! - Per-key admission control (FIFO queue, queue timeout, start spacing)
//! - Polling activity observer that infers completion
//! - Orchestrator: spawn / cancel / wait-for-output

pub mod admission;
pub mod ledger;
pub mod linkage;
pub mod observer;
pub mod orchestrator;
pub mod output;
pub mod session;
pub mod state;
pub mod task;

// Task model
pub use state::TaskStatus;
pub use task::{ExternalLinkage, ProgressUpdate, TaskId, TaskProgress, TaskRecord, TaskSpec};

// Ledger
pub use ledger::{LedgerError, StatusExtra, TaskFilter, TaskLedger};

// Admission
pub use admission::{AdmissionController, AdmissionError, AdmissionGate, AdmissionStats};

// Observer
pub use observer::{
    ActivityObserver, CompletionCallback, CompletionReason, CompletionSignal, PollReport,
    TaskObservation,
};

// External ports
pub use linkage::{JsonLinkageStore, LinkageRecord, LinkageStore, SessionDescriptor};
pub use session::{
    AgentValidation, AgentValidator, MessagePart, MessageRole, PromptRequest, SessionClient,
    SessionMessage, SessionStatus, StaticAgentValidator,
};

// Orchestrator
pub use orchestrator::{
    Orchestrator, OrchestratorBuilder, OrchestratorHandle, PromptSource, SpawnAndWait,
    SpawnOutcome, SpawnRequest, TaskOutput,
};
pub use output::OutputPayload;
