//! Intent classification.
//!
//! Order of evaluation:
//! 1. Rules engine (automated mail, receipts). No capability call.
//! 2. Text-understanding capability, bounded by the stage timeout.
//! 3. Validation of the returned label against the closed category set.
//!
//! Any failure in 2 or 3 degrades to [`Intent::fallback`] and records a
//! [`UpstreamFlag::ClassificationDegraded`] warning. Classification itself
//! never fails the run.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::capabilities::{ClassifyContext, TextUnderstanding, bounded};
use crate::error::PipelineError;
use crate::pipeline::rules::RulesEngine;
use crate::workflow::{
    Contact, Intent, IntentCategory, NormalizedMessage, PriorityHints, TenantConfig, UnitScore,
    UpstreamFlag, WorkflowPayload,
};

/// Scores below this are treated as a non-answer.
pub const MIN_CONFIDENCE: f32 = 0.2;

/// Confidence assigned to rule matches.
const RULE_CONFIDENCE: f32 = 0.95;

/// Classifier output: the intent and, when degraded, why.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub intent: Intent,
    pub warning: Option<UpstreamFlag>,
}

impl Classification {
    fn degraded(reason: String) -> Self {
        Self {
            intent: Intent::fallback(),
            warning: Some(UpstreamFlag::ClassificationDegraded { reason }),
        }
    }
}

pub struct IntentClassifier {
    model: Arc<dyn TextUnderstanding>,
    rules: RulesEngine,
    known_senders: Vec<String>,
    timeout: Duration,
}

impl IntentClassifier {
    pub fn new(
        model: Arc<dyn TextUnderstanding>,
        rules: RulesEngine,
        known_senders: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            model,
            rules,
            known_senders,
            timeout,
        }
    }

    /// Classify one message. Always returns a valid intent.
    pub async fn classify(
        &self,
        message: &NormalizedMessage,
        contact: &Contact,
        tenant_config: &TenantConfig,
        thread_history: &[NormalizedMessage],
    ) -> Classification {
        let priority =
            PriorityHints::analyze(message, &self.known_senders, &contact.email).priority();

        if let Some(matched) = self.rules.evaluate(&contact.email, message) {
            debug!(category = %matched.category, reason = %matched.reason, "Classified by rule");
            return Classification {
                intent: Intent {
                    category: matched.category,
                    priority,
                    confidence: UnitScore::clamped(RULE_CONFIDENCE),
                    sub_intent: None,
                    degraded: false,
                },
                warning: None,
            };
        }

        if message.subject.trim().is_empty() && message.body_text.trim().is_empty() {
            return Classification {
                intent: Intent {
                    category: IntentCategory::Other,
                    priority,
                    confidence: UnitScore::ZERO,
                    sub_intent: None,
                    degraded: false,
                },
                warning: None,
            };
        }

        let context = ClassifyContext {
            contact,
            subject: &message.subject,
            thread_history,
            tone: &tenant_config.tone,
        };
        let raw = match bounded(
            self.model.name(),
            self.timeout,
            self.model.classify(&message.body_text, context),
        )
        .await
        {
            Ok(raw) => raw,
            Err(e) => {
                warn!(capability = %self.model.name(), error = %e, "Classification unavailable, using fallback intent");
                return Classification::degraded(e.to_string());
            }
        };

        let category = match raw.label.parse::<IntentCategory>() {
            Ok(category) => category,
            Err(_) => {
                warn!(label = %raw.label, "Classifier returned a label outside the category set");
                return Classification::degraded(format!("unknown label '{}'", raw.label));
            }
        };

        if !raw.score.is_finite() {
            warn!(label = %raw.label, "Classifier returned a non-finite score");
            return Classification::degraded("non-finite confidence".into());
        }
        let confidence = UnitScore::clamped(raw.score);
        if confidence.value() < MIN_CONFIDENCE {
            warn!(label = %raw.label, confidence = %confidence, "Classifier confidence too low");
            return Classification::degraded(format!(
                "confidence {confidence} below {MIN_CONFIDENCE}"
            ));
        }

        Classification {
            intent: Intent {
                category,
                priority,
                confidence,
                sub_intent: raw.sub_intent,
                degraded: false,
            },
            warning: None,
        }
    }

    /// Classify and accrete the result onto the payload.
    pub async fn classify_payload(
        &self,
        payload: WorkflowPayload,
    ) -> Result<WorkflowPayload, PipelineError> {
        let classification = self
            .classify(
                &payload.message,
                &payload.contact,
                &payload.tenant_config,
                &payload.thread_history,
            )
            .await;

        let payload = match classification.warning {
            Some(flag) => payload.with_warning(flag),
            None => payload,
        };
        payload.with_intent(classification.intent)
    }
}
