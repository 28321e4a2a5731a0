//! Typed error hierarchy for the marshal orchestrator.
//!
//! Three top-level enums cover the three subsystems:
//! - `OrchestratorError` — run creation, fan-out, and parent aggregation
//! - `DispatchError` — provider routing and broker enqueue failures
//! - `EngineError` — worker-side execution failures

use thiserror::Error;

/// Errors from the orchestrator subsystem.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Run {id} not found")]
    RunNotFound { id: i64 },

    #[error("Run {id} is itself a child run; fan-out is exactly one level deep")]
    NestedFanOut { id: i64 },

    #[error("Dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the queue dispatcher.
///
/// `NoQueueForProvider` is a configuration error: fail fast, no retry.
/// `BrokerUnavailable` is transient: the caller may retry the whole
/// creation; already-created child rows stay `queued` for a later sweep.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("No queue configured for provider '{provider}'")]
    NoQueueForProvider { provider: String },

    #[error("Queue broker unavailable: {0}")]
    BrokerUnavailable(String),
}

/// Errors from worker-side execution.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Malformed job payload: {0}")]
    MalformedPayload(String),

    #[error("Sandbox launch failed: {0}")]
    SandboxLaunch(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
