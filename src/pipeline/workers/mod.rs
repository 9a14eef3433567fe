//! Worker dispatch.
//!
//! Each intent category routes to exactly one [`WorkerKind`] through an
//! exhaustive match, so adding a category forces a routing decision here.
//! Workers only *propose* side effects; nothing external is written until
//! the guardrail authorizes `auto_send`.

mod generic;
mod scheduling;
mod support;

pub use generic::GenericWorker;
pub use scheduling::SchedulingWorker;
pub use support::SupportWorker;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::capabilities::local::template_draft;
use crate::capabilities::{
    CalendarTransport, DraftContext, KnowledgeBase, TextUnderstanding, bounded,
};
use crate::error::PipelineError;
use crate::workflow::{
    CandidateAction, Intent, IntentCategory, UnitScore, UpstreamFlag, WorkerKind, WorkflowPayload,
};

/// Confidence multiplier for template drafts used when the text model fails.
const TEMPLATE_CONFIDENCE_FACTOR: f32 = 0.6;

/// A worker strategy: turns a classified payload into a candidate action.
#[async_trait]
pub trait Worker: Send + Sync {
    fn kind(&self) -> WorkerKind;

    /// Must not perform side effects. Calling twice on the same payload
    /// yields an equivalent candidate.
    async fn propose(&self, intent: &Intent, payload: &WorkflowPayload) -> CandidateAction;
}

/// Route an intent category to its worker.
pub fn route(category: IntentCategory) -> WorkerKind {
    match category {
        IntentCategory::Scheduling => WorkerKind::Scheduling,
        IntentCategory::Support => WorkerKind::Support,
        IntentCategory::Billing
        | IntentCategory::Lead
        | IntentCategory::Spam
        | IntentCategory::Other => WorkerKind::Generic,
    }
}

/// Closed registry of worker strategies.
pub struct WorkerRegistry {
    scheduling: SchedulingWorker,
    support: SupportWorker,
    generic: GenericWorker,
}

impl WorkerRegistry {
    pub fn new(
        text: Arc<dyn TextUnderstanding>,
        calendar: Arc<dyn CalendarTransport>,
        knowledge: Arc<dyn KnowledgeBase>,
        timeout: Duration,
    ) -> Self {
        let drafter = Drafter {
            text,
            timeout,
        };
        Self {
            scheduling: SchedulingWorker::new(calendar, drafter.clone(), timeout),
            support: SupportWorker::new(knowledge, drafter, timeout),
            generic: GenericWorker,
        }
    }

    fn worker(&self, kind: WorkerKind) -> &dyn Worker {
        match kind {
            WorkerKind::Scheduling => &self.scheduling,
            WorkerKind::Support => &self.support,
            WorkerKind::Generic => &self.generic,
        }
    }

    /// Produce a candidate for `intent` without touching the payload.
    pub async fn dispatch(&self, intent: &Intent, payload: &WorkflowPayload) -> CandidateAction {
        let worker = self.worker(route(intent.category));
        debug!(
            workflow_id = %payload.workflow_id,
            category = %intent.category,
            worker = %worker.kind(),
            "Dispatching to worker"
        );
        let candidate = worker.propose(intent, payload).await;
        if candidate.is_flagged() {
            let flags: Vec<String> = candidate.flags.iter().map(|f| f.describe()).collect();
            info!(
                workflow_id = %payload.workflow_id,
                worker = %candidate.worker,
                flags = %flags.join("; "),
                "Worker flagged candidate for human review"
            );
        }
        candidate
    }

    /// Dispatch and accrete the candidate onto the payload.
    pub async fn dispatch_payload(
        &self,
        payload: WorkflowPayload,
    ) -> Result<WorkflowPayload, PipelineError> {
        let intent = payload.intent.clone().ok_or_else(|| {
            PipelineError::InvariantBreach(format!(
                "workflow {}: dispatch requires intent",
                payload.workflow_id
            ))
        })?;
        let candidate = self.dispatch(&intent, &payload).await;
        payload.with_candidate(candidate)
    }
}

/// Drafting through the text capability with a template fallback.
#[derive(Clone)]
pub(crate) struct Drafter {
    text: Arc<dyn TextUnderstanding>,
    timeout: Duration,
}

impl Drafter {
    /// `None` when neither the model nor the template can produce a draft.
    pub(crate) async fn draft(&self, context: &DraftContext) -> Option<(String, UnitScore)> {
        match bounded(self.text.name(), self.timeout, self.text.generate_draft(context)).await {
            Ok(draft) if !draft.text.trim().is_empty() => {
                Some((draft.text, UnitScore::clamped(draft.confidence)))
            }
            Ok(_) => {
                warn!(capability = %self.text.name(), "Text model returned an empty draft, using template");
                self.template(context)
            }
            Err(e) => {
                warn!(capability = %self.text.name(), error = %e, "Draft generation failed, using template");
                self.template(context)
            }
        }
    }

    fn template(&self, context: &DraftContext) -> Option<(String, UnitScore)> {
        template_draft(context).map(|d| {
            (
                d.text,
                UnitScore::clamped(d.confidence * TEMPLATE_CONFIDENCE_FACTOR),
            )
        })
    }
}

/// Candidate for a worker that could not gather what it needed.
///
/// Carries a holding draft for the reviewer and an insufficient-information
/// flag that forces escalation.
pub(crate) fn insufficient_information(
    worker: WorkerKind,
    contact_name: &str,
    reason: String,
) -> CandidateAction {
    let draft = format!(
        "Hi {contact_name},\n\nThanks for your message. A member of our team will follow up shortly.\n\nBest regards"
    );
    let mut candidate =
        CandidateAction::needs_human(worker, UpstreamFlag::InsufficientInformation { reason });
    candidate.draft = Some(draft);
    candidate
}

/// Subject line for a reply.
pub(crate) fn reply_subject(subject: &str) -> String {
    let trimmed = subject.trim();
    if trimmed.is_empty() {
        "Re: your message".to_string()
    } else if trimmed.to_ascii_lowercase().starts_with("re:") {
        trimmed.to_string()
    } else {
        format!("Re: {trimmed}")
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::capabilities::local::{InMemoryKnowledgeBase, KeywordModel};
    use crate::capabilities::{EventResult, SlotConstraints};
    use crate::error::CapabilityError;
    use crate::workflow::payload::tests::{received, tenant};
    use crate::workflow::{ProposedEffect, TimeSlot};

    /// Calendar with a fixed answer that counts writes.
    pub(crate) struct FixedCalendar {
        pub slots: Result<Vec<TimeSlot>, CapabilityError>,
        pub created: tokio::sync::Mutex<Vec<TimeSlot>>,
    }

    impl FixedCalendar {
        pub(crate) fn with_slots(count: usize) -> Self {
            let slots = (0..count)
                .map(|i| TimeSlot {
                    start: Utc.with_ymd_and_hms(2026, 3, 9, 9 + i as u32, 0, 0).unwrap(),
                    duration_minutes: 30,
                    timezone: "Europe/London".into(),
                })
                .collect();
            Self {
                slots: Ok(slots),
                created: Default::default(),
            }
        }

        pub(crate) fn failing() -> Self {
            Self {
                slots: Err(CapabilityError::Unavailable {
                    capability: "calendar".into(),
                    reason: "calendar offline".into(),
                }),
                created: Default::default(),
            }
        }
    }

    #[async_trait]
    impl CalendarTransport for FixedCalendar {
        fn name(&self) -> &str {
            "fixed-calendar"
        }

        async fn find_slots(
            &self,
            constraints: &SlotConstraints,
        ) -> Result<Vec<TimeSlot>, CapabilityError> {
            self.slots
                .clone()
                .map(|s| s.into_iter().take(constraints.count).collect())
        }

        async fn create_event(
            &self,
            slot: &TimeSlot,
            _attendees: &[String],
            _title: &str,
        ) -> Result<EventResult, CapabilityError> {
            self.created.lock().await.push(slot.clone());
            Ok(EventResult {
                event_id: "evt-1".into(),
            })
        }
    }

    pub(crate) fn intent(category: IntentCategory) -> Intent {
        Intent {
            category,
            priority: UnitScore::clamped(0.3),
            confidence: UnitScore::clamped(0.9),
            sub_intent: None,
            degraded: false,
        }
    }

    fn registry(calendar: Arc<FixedCalendar>) -> WorkerRegistry {
        WorkerRegistry::new(
            Arc::new(KeywordModel::new()),
            calendar,
            Arc::new(InMemoryKnowledgeBase::with_default_articles()),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn every_category_routes_to_one_worker() {
        assert_eq!(route(IntentCategory::Scheduling), WorkerKind::Scheduling);
        assert_eq!(route(IntentCategory::Support), WorkerKind::Support);
        for category in [
            IntentCategory::Billing,
            IntentCategory::Lead,
            IntentCategory::Spam,
            IntentCategory::Other,
        ] {
            assert_eq!(route(category), WorkerKind::Generic);
        }
    }

    #[tokio::test]
    async fn dispatch_is_idempotent_and_side_effect_free() {
        let calendar = Arc::new(FixedCalendar::with_slots(3));
        let registry = registry(calendar.clone());
        let payload = received("Can we schedule a call next week?", tenant(true, 0.9));
        let intent = intent(IntentCategory::Scheduling);

        let first = registry.dispatch(&intent, &payload).await;
        let second = registry.dispatch(&intent, &payload).await;
        assert_eq!(first, second);
        assert!(calendar.created.lock().await.is_empty());
        assert!(
            first
                .proposed_effects
                .iter()
                .any(|e| matches!(e, ProposedEffect::CreateEvent { .. }))
        );
    }

    #[tokio::test]
    async fn unmapped_intent_gets_escalation_biased_candidate() {
        let registry = registry(Arc::new(FixedCalendar::with_slots(3)));
        let payload = received("Please send my invoice", tenant(true, 0.9));
        let candidate = registry
            .dispatch(&intent(IntentCategory::Billing), &payload)
            .await;
        assert_eq!(candidate.worker, WorkerKind::Generic);
        assert!(candidate.draft.is_none());
        assert!(candidate.proposed_effects.is_empty());
        assert_eq!(
            candidate.flags,
            vec![UpstreamFlag::UnmappedIntent {
                category: IntentCategory::Billing
            }]
        );
    }

    #[tokio::test]
    async fn dispatch_payload_requires_intent() {
        let registry = registry(Arc::new(FixedCalendar::with_slots(3)));
        let err = registry
            .dispatch_payload(received("hi", tenant(false, 0.7)))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvariantBreach(_)));
    }

    #[test]
    fn reply_subject_prefixes_once() {
        assert_eq!(reply_subject("Call"), "Re: Call");
        assert_eq!(reply_subject("RE: Call"), "RE: Call");
        assert_eq!(reply_subject("  "), "Re: your message");
    }

    #[tokio::test]
    async fn drafter_falls_back_to_template_with_reduced_confidence() {
        use crate::pipeline::classifier::tests::FixedModel;
        use crate::capabilities::DraftGrounding;
        use crate::workflow::DocumentSnippet;

        let drafter = Drafter {
            text: Arc::new(FixedModel::failing()),
            timeout: Duration::from_secs(1),
        };
        let context = DraftContext {
            intent: IntentCategory::Support,
            contact_name: "Alice".into(),
            subject: "Password".into(),
            body_text: "How do I reset my password?".into(),
            tone: "professional".into(),
            grounding: DraftGrounding::Snippets(vec![DocumentSnippet {
                doc_id: "kb-1".into(),
                title: "Reset".into(),
                content: "Use the forgot password link.".into(),
                score: UnitScore::ONE,
            }]),
        };
        let (text, confidence) = drafter.draft(&context).await.unwrap();
        assert!(text.contains("forgot password"));
        assert!((confidence.value() - 0.9 * TEMPLATE_CONFIDENCE_FACTOR).abs() < 1e-6);

        let empty = DraftContext {
            grounding: DraftGrounding::Snippets(vec![]),
            ..context
        };
        assert!(drafter.draft(&empty).await.is_none());
    }
}
