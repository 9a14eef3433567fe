//! The workflow payload threaded through the pipeline.
//!
//! Each stage consumes the payload and returns the next version through one
//! of the `with_*` methods. A method refuses to overwrite a field that is
//! already set or to skip a lifecycle status, so a field can only be written
//! by the stage that owns it, in pipeline order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::workflow::status::{MAX_TRANSITIONS, StatusTransition, WorkflowStatus};
use crate::workflow::types::{
    CandidateAction, Contact, Decision, DeliveryReport, Intent, NormalizedMessage, QaDecision,
    Source, TenantConfig, UpstreamFlag,
};

/// Full workflow record. Also the persisted snapshot format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowPayload {
    pub workflow_id: Uuid,
    pub tenant_id: String,
    pub correlation_id: String,
    pub source: Source,
    pub contact: Contact,
    pub message: NormalizedMessage,
    #[serde(default)]
    pub thread_history: Vec<NormalizedMessage>,
    pub tenant_config: TenantConfig,

    pub intent: Option<Intent>,
    pub candidate_action: Option<CandidateAction>,
    pub qa_decision: Option<QaDecision>,
    #[serde(default)]
    pub delivery: Option<DeliveryReport>,

    /// Recoverable degradations noticed along the way.
    #[serde(default)]
    pub warnings: Vec<UpstreamFlag>,

    pub status: WorkflowStatus,
    #[serde(default)]
    pub transitions: Vec<StatusTransition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowPayload {
    /// Create a `Received` payload with a fresh identifier.
    pub fn new(
        tenant_config: TenantConfig,
        source: Source,
        contact: Contact,
        message: NormalizedMessage,
        correlation_id: Option<String>,
    ) -> Self {
        let workflow_id = Uuid::new_v4();
        let now = Utc::now();
        Self {
            workflow_id,
            tenant_id: tenant_config.tenant_id.clone(),
            correlation_id: correlation_id.unwrap_or_else(|| workflow_id.to_string()),
            source,
            contact,
            message,
            thread_history: Vec::new(),
            tenant_config,
            intent: None,
            candidate_action: None,
            qa_decision: None,
            delivery: None,
            warnings: Vec::new(),
            status: WorkflowStatus::Received,
            transitions: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach fetched thread history. Only valid before classification.
    pub fn with_thread_history(
        mut self,
        history: Vec<NormalizedMessage>,
    ) -> Result<Self, PipelineError> {
        self.require_status(WorkflowStatus::Received, "thread_history")?;
        self.thread_history = history;
        self.touch();
        Ok(self)
    }

    /// Record a recoverable degradation.
    pub fn with_warning(mut self, flag: UpstreamFlag) -> Self {
        self.warnings.push(flag);
        self.touch();
        self
    }

    pub fn with_intent(mut self, intent: Intent) -> Result<Self, PipelineError> {
        if self.intent.is_some() {
            return Err(self.already_set("intent"));
        }
        self.intent = Some(intent);
        self.advance(WorkflowStatus::Classified, None)
    }

    pub fn with_candidate(mut self, candidate: CandidateAction) -> Result<Self, PipelineError> {
        if self.intent.is_none() {
            return Err(self.missing("intent", "candidate_action"));
        }
        if self.candidate_action.is_some() {
            return Err(self.already_set("candidate_action"));
        }
        self.candidate_action = Some(candidate);
        self.advance(WorkflowStatus::ActionDrafted, None)
    }

    pub fn with_decision(mut self, decision: QaDecision) -> Result<Self, PipelineError> {
        if self.candidate_action.is_none() {
            return Err(self.missing("candidate_action", "qa_decision"));
        }
        if self.qa_decision.is_some() {
            return Err(self.already_set("qa_decision"));
        }
        let reason = format!("{} at risk {}", decision.decision, decision.risk_score);
        self.qa_decision = Some(decision);
        self.advance(WorkflowStatus::Decided, Some(reason))
    }

    /// Move a `Decided` workflow onto its terminal branch.
    ///
    /// `delivery` must be present exactly when the decision was `auto_send`.
    pub fn settle(mut self, delivery: Option<DeliveryReport>) -> Result<Self, PipelineError> {
        let decision = self
            .qa_decision
            .as_ref()
            .map(|d| d.decision)
            .ok_or_else(|| self.missing("qa_decision", "terminal status"))?;

        let target = match (decision, &delivery) {
            (Decision::AutoSend, Some(report)) if report.succeeded() => WorkflowStatus::Sent,
            (Decision::AutoSend, Some(_)) => WorkflowStatus::DeliveryFailed,
            (Decision::DraftOnly, None) => WorkflowStatus::AwaitingReview,
            (Decision::Escalate, None) => WorkflowStatus::Escalated,
            (Decision::AutoSend, None) => {
                return Err(PipelineError::InvariantBreach(format!(
                    "workflow {} decided auto_send without a delivery attempt",
                    self.workflow_id
                )));
            }
            (_, Some(_)) => {
                return Err(PipelineError::InvariantBreach(format!(
                    "workflow {} executed side effects without auto_send",
                    self.workflow_id
                )));
            }
        };

        let reason = delivery.as_ref().and_then(|report| {
            let failed: Vec<String> = report
                .failures()
                .map(|o| format!("{}: {}", o.effect, o.error.as_deref().unwrap_or("failed")))
                .collect();
            (!failed.is_empty()).then(|| failed.join("; "))
        });
        self.delivery = delivery;
        self.advance(target, reason)
    }

    /// Close a settled workflow.
    pub fn close(self, reason: Option<String>) -> Result<Self, PipelineError> {
        self.advance(WorkflowStatus::Closed, reason)
    }

    fn advance(
        mut self,
        target: WorkflowStatus,
        reason: Option<String>,
    ) -> Result<Self, PipelineError> {
        if !self.status.can_transition_to(target) {
            return Err(PipelineError::InvalidTransition {
                workflow_id: self.workflow_id.to_string(),
                from: self.status,
                to: target,
            });
        }

        self.transitions.push(StatusTransition {
            from: self.status,
            to: target,
            timestamp: Utc::now(),
            reason,
        });
        if self.transitions.len() > MAX_TRANSITIONS {
            let drain_count = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..drain_count);
        }

        self.status = target;
        self.touch();
        Ok(self)
    }

    fn require_status(&self, expected: WorkflowStatus, field: &str) -> Result<(), PipelineError> {
        if self.status == expected {
            Ok(())
        } else {
            Err(PipelineError::InvariantBreach(format!(
                "workflow {}: {field} written in status {}, expected {expected}",
                self.workflow_id, self.status
            )))
        }
    }

    fn already_set(&self, field: &str) -> PipelineError {
        PipelineError::InvariantBreach(format!(
            "workflow {}: {field} is already set",
            self.workflow_id
        ))
    }

    fn missing(&self, field: &str, needed_by: &str) -> PipelineError {
        PipelineError::InvariantBreach(format!(
            "workflow {}: {needed_by} requires {field}",
            self.workflow_id
        ))
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// All upstream flags: payload warnings plus candidate flags.
    pub fn upstream_flags(&self) -> Vec<UpstreamFlag> {
        let mut flags = self.warnings.clone();
        if let Some(candidate) = &self.candidate_action {
            for flag in &candidate.flags {
                if !flags.contains(flag) {
                    flags.push(flag.clone());
                }
            }
        }
        flags
    }
}
