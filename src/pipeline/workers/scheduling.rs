use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::{Drafter, Worker, insufficient_information, reply_subject};
use crate::capabilities::{
    CalendarTransport, DraftContext, DraftGrounding, SlotConstraints, bounded,
};
use crate::workflow::{
    CandidateAction, Intent, ProposedEffect, TenantConfig, WorkerKind, WorkflowPayload,
};

const SLOT_COUNT: usize = 3;
const SLOT_MINUTES: u32 = 30;
const DAYS_AHEAD: u32 = 7;

/// Offers calendar slots and proposes a tentative hold on the first one.
pub struct SchedulingWorker {
    calendar: Arc<dyn CalendarTransport>,
    drafter: Drafter,
    timeout: Duration,
}

impl SchedulingWorker {
    pub(crate) fn new(
        calendar: Arc<dyn CalendarTransport>,
        drafter: Drafter,
        timeout: Duration,
    ) -> Self {
        Self {
            calendar,
            drafter,
            timeout,
        }
    }

    fn constraints(config: &TenantConfig) -> SlotConstraints {
        SlotConstraints {
            timezone: config.timezone.clone(),
            working_hours_start: config.working_hours_start,
            working_hours_end: config.working_hours_end,
            working_days: config.working_days.clone(),
            count: SLOT_COUNT,
            duration_minutes: SLOT_MINUTES,
            days_ahead: DAYS_AHEAD,
        }
    }
}

#[async_trait]
impl Worker for SchedulingWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Scheduling
    }

    async fn propose(&self, intent: &Intent, payload: &WorkflowPayload) -> CandidateAction {
        let name = payload.contact.display_name();
        let constraints = Self::constraints(&payload.tenant_config);

        let slots = match bounded(
            self.calendar.name(),
            self.timeout,
            self.calendar.find_slots(&constraints),
        )
        .await
        {
            Ok(slots) if !slots.is_empty() => slots,
            Ok(_) => {
                return insufficient_information(
                    WorkerKind::Scheduling,
                    name,
                    "no free slots in the next week".into(),
                );
            }
            Err(e) => {
                warn!(workflow_id = %payload.workflow_id, error = %e, "Slot lookup failed");
                return insufficient_information(
                    WorkerKind::Scheduling,
                    name,
                    format!("calendar lookup failed: {e}"),
                );
            }
        };

        let context = DraftContext {
            intent: intent.category,
            contact_name: name.to_string(),
            subject: payload.message.subject.clone(),
            body_text: payload.message.body_text.clone(),
            tone: payload.tenant_config.tone.clone(),
            grounding: DraftGrounding::Slots(slots.clone()),
        };
        let Some((draft, confidence)) = self.drafter.draft(&context).await else {
            return insufficient_information(
                WorkerKind::Scheduling,
                name,
                "no draft could be produced".into(),
            );
        };

        let proposed_effects = vec![
            ProposedEffect::SendReply {
                thread_id: payload.source.thread_id.clone(),
                to: payload.contact.email.clone(),
                subject: reply_subject(&payload.message.subject),
                body: draft.clone(),
            },
            ProposedEffect::CreateEvent {
                slot: slots[0].clone(),
                attendees: vec![payload.contact.email.clone()],
                title: format!("Call with {name}"),
            },
        ];

        CandidateAction {
            worker: WorkerKind::Scheduling,
            draft: Some(draft),
            draft_confidence: confidence,
            proposed_effects,
            citations: Vec::new(),
            flags: Vec::new(),
        }
    }
}
