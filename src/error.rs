//! Error types for the ops desk.

use std::time::Duration;

use crate::workflow::status::WorkflowStatus;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Stale write for workflow {id}: expected status {expected:?}, found {found:?}")]
    StaleWrite {
        id: String,
        expected: Option<WorkflowStatus>,
        found: Option<WorkflowStatus>,
    },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// Whether retrying the same write could succeed.
    ///
    /// Stale writes are decided by data, not by availability.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Pool(_) | Self::Query(_))
    }
}

/// Failures of external collaborators (text model, mailbox, calendar, KB).
#[derive(Debug, Clone, thiserror::Error)]
pub enum CapabilityError {
    #[error("{capability} unavailable: {reason}")]
    Unavailable { capability: String, reason: String },

    #[error("{capability} timed out after {timeout:?}")]
    Timeout {
        capability: String,
        timeout: Duration,
    },

    #[error("Invalid response from {capability}: {reason}")]
    InvalidResponse { capability: String, reason: String },

    #[error("{capability} rejected the request: {reason}")]
    Rejected { capability: String, reason: String },
}

/// A single field-level validation failure on an inbound request.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Pipeline errors. Only these abort a workflow run before a decision.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Validation failed: {}", format_field_errors(.0))]
    Validation(Vec<FieldError>),

    #[error("Persistence failed after {attempts} attempt(s): {reason}")]
    Persistence { attempts: u32, reason: String },

    #[error("Concurrent update on workflow {workflow_id}: {reason}")]
    StaleWrite { workflow_id: String, reason: String },

    #[error("Workflow run cancelled before stage {stage}")]
    Cancelled { stage: String },

    #[error("Workflow {workflow_id} not found")]
    NotFound { workflow_id: String },

    #[error("Workflow {workflow_id} cannot move from {from} to {to}")]
    InvalidTransition {
        workflow_id: String,
        from: WorkflowStatus,
        to: WorkflowStatus,
    },

    #[error("Invariant breach: {0}")]
    InvariantBreach(String),
}

fn format_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
