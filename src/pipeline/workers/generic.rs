use async_trait::async_trait;

use super::Worker;
use crate::workflow::{CandidateAction, Intent, UpstreamFlag, WorkerKind, WorkflowPayload};

/// Fallback for categories without a dedicated worker: nothing drafted,
/// flagged for a human.
pub struct GenericWorker;

#[async_trait]
impl Worker for GenericWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Generic
    }

    async fn propose(&self, intent: &Intent, _payload: &WorkflowPayload) -> CandidateAction {
        CandidateAction::needs_human(
            WorkerKind::Generic,
            UpstreamFlag::UnmappedIntent {
                category: intent.category,
            },
        )
    }
}
