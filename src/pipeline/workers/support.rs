use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{Drafter, Worker, insufficient_information, reply_subject};
use crate::capabilities::{DraftContext, DraftGrounding, KnowledgeBase, bounded};
use crate::workflow::{CandidateAction, Intent, ProposedEffect, WorkerKind, WorkflowPayload};

const TOP_K: usize = 2;

/// Answers from the knowledge base and cites the articles used.
pub struct SupportWorker {
    knowledge: Arc<dyn KnowledgeBase>,
    drafter: Drafter,
    timeout: Duration,
}

impl SupportWorker {
    pub(crate) fn new(knowledge: Arc<dyn KnowledgeBase>, drafter: Drafter, timeout: Duration) -> Self {
        Self {
            knowledge,
            drafter,
            timeout,
        }
    }
}

#[async_trait]
impl Worker for SupportWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Support
    }

    async fn propose(&self, intent: &Intent, payload: &WorkflowPayload) -> CandidateAction {
        let name = payload.contact.display_name();
        let query = format!("{} {}", payload.message.subject, payload.message.body_text);

        let snippets = match bounded(
            self.knowledge.name(),
            self.timeout,
            self.knowledge.search(&query, TOP_K),
        )
        .await
        {
            Ok(snippets) if !snippets.is_empty() => snippets,
            Ok(_) => {
                return insufficient_information(
                    WorkerKind::Support,
                    name,
                    "no matching knowledge-base articles".into(),
                );
            }
            Err(e) => {
                warn!(workflow_id = %payload.workflow_id, error = %e, "Knowledge-base search failed");
                return insufficient_information(
                    WorkerKind::Support,
                    name,
                    format!("knowledge-base search failed: {e}"),
                );
            }
        };
        debug!(workflow_id = %payload.workflow_id, hits = snippets.len(), "Knowledge-base hits");

        let citations: Vec<String> = snippets.iter().map(|s| s.doc_id.clone()).collect();
        let context = DraftContext {
            intent: intent.category,
            contact_name: name.to_string(),
            subject: payload.message.subject.clone(),
            body_text: payload.message.body_text.clone(),
            tone: payload.tenant_config.tone.clone(),
            grounding: DraftGrounding::Snippets(snippets),
        };
        let Some((draft, confidence)) = self.drafter.draft(&context).await else {
            return insufficient_information(
                WorkerKind::Support,
                name,
                "no draft could be produced".into(),
            );
        };

        CandidateAction {
            worker: WorkerKind::Support,
            proposed_effects: vec![ProposedEffect::SendReply {
                thread_id: payload.source.thread_id.clone(),
                to: payload.contact.email.clone(),
                subject: reply_subject(&payload.message.subject),
                body: draft.clone(),
            }],
            draft: Some(draft),
            draft_confidence: confidence,
            citations,
            flags: Vec::new(),
        }
    }
}
