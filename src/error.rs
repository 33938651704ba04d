//! Error types for the transfer engine.

use thiserror::Error;

use crate::types::BatchId;

/// Errors surfaced by the registry, scheduler, and journey coordinator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CellError {
    /// Malformed request or state update; rejected before it touches any state.
    #[error("validation error: {0}")]
    Validation(String),

    /// A resource with this name is already registered.
    #[error("duplicate resource: {0}")]
    DuplicateResource(String),

    /// The named resource was never registered.
    #[error("unknown resource: {0}")]
    UnknownResource(String),

    /// A state update would break the one-item invariant. Always a caller bug.
    #[error("invariant violation on {resource}: {detail}")]
    InvariantViolation { resource: String, detail: String },

    /// The resource hit an invariant violation earlier and no longer accepts updates.
    #[error("resource {0} is faulted")]
    ResourceFaulted(String),

    /// A batch is already in the cell.
    #[error("batch conflict: {active} is still active, {requested} must wait")]
    BatchConflict { active: BatchId, requested: BatchId },

    /// The batch is not the active one (never arrived or already departed).
    #[error("batch {0} is not active")]
    BatchNotActive(BatchId),

    /// Departure requested before every wafer returned to the carrier.
    #[error("batch {batch} is incomplete: {remaining} wafer(s) still travelling")]
    BatchIncomplete { batch: BatchId, remaining: usize },

    /// No registered robot serves the route.
    #[error("no robot serves {source_name} -> {destination}")]
    RoutingExhausted {
        source_name: String,
        destination: String,
    },

    /// The scheduler (or the owning agent) has shut down.
    #[error("scheduler stopped")]
    SchedulerStopped,
}

impl CellError {
    pub(crate) fn invariant(resource: &str, detail: impl Into<String>) -> Self {
        CellError::InvariantViolation {
            resource: resource.to_string(),
            detail: detail.into(),
        }
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown strategy: {0} (expected lock, mailbox, or agents)")]
    UnknownStrategy(String),

    #[error("unknown unroutable policy: {0} (expected queue or reject)")]
    UnknownPolicy(String),

    #[error("unknown log format: {0} (expected text or json)")]
    UnknownLogFormat(String),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}
