//! `WorkflowStore`: the single async persistence interface for workflows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::workflow::{Decision, IntentCategory, WorkflowPayload, WorkflowStatus};

/// Largest page `list` will return.
pub const MAX_LIST_LIMIT: usize = 200;

/// Listing filter. Unset fields match everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowFilter {
    pub tenant_id: Option<String>,
    pub status: Option<WorkflowStatus>,
    pub limit: usize,
}

impl Default for WorkflowFilter {
    fn default() -> Self {
        Self {
            tenant_id: None,
            status: None,
            limit: 50,
        }
    }
}

impl WorkflowFilter {
    /// Limit clamped to `1..=MAX_LIST_LIMIT`.
    pub fn effective_limit(&self) -> usize {
        self.limit.clamp(1, MAX_LIST_LIMIT)
    }
}

/// Lightweight row for listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowSummary {
    pub workflow_id: Uuid,
    pub tenant_id: String,
    pub status: WorkflowStatus,
    pub intent: Option<IntentCategory>,
    pub decision: Option<Decision>,
    pub subject: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&WorkflowPayload> for WorkflowSummary {
    fn from(payload: &WorkflowPayload) -> Self {
        Self {
            workflow_id: payload.workflow_id,
            tenant_id: payload.tenant_id.clone(),
            status: payload.status,
            intent: payload.intent.as_ref().map(|i| i.category),
            decision: payload.qa_decision.as_ref().map(|d| d.decision),
            subject: payload.message.subject.clone(),
            created_at: payload.created_at,
            updated_at: payload.updated_at,
        }
    }
}

/// Durable workflow snapshots with optimistic concurrency.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Persist a snapshot.
    ///
    /// `expected` is the status the caller last read: `None` inserts a new
    /// workflow, `Some(status)` replaces the stored snapshot only while it is
    /// still in that status. Anything else is [`DatabaseError::StaleWrite`].
    async fn save(
        &self,
        snapshot: &WorkflowPayload,
        expected: Option<WorkflowStatus>,
    ) -> Result<(), DatabaseError>;

    /// Most recent snapshot, if any.
    async fn load(&self, id: Uuid) -> Result<Option<WorkflowPayload>, DatabaseError>;

    /// Newest first.
    async fn list(&self, filter: &WorkflowFilter) -> Result<Vec<WorkflowSummary>, DatabaseError>;
}
