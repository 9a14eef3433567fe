//! Guardrail: risk-score a candidate action and decide its disposition.
//!
//! Decision precedence, highest first:
//! 1. any upstream flag → `escalate`
//! 2. `risk >= escalation_threshold` → `escalate`
//! 3. tenant auto-send enabled → `auto_send`
//! 4. otherwise → `draft_only`
//!
//! [`evaluate`] is a pure function of its inputs. A post-decision audit
//! re-checks the precedence rules and forces `escalate` on any violation.

use tracing::error;

use crate::error::PipelineError;
use crate::workflow::{
    CandidateAction, Decision, Intent, IntentCategory, QaDecision, RiskFactor, TenantConfig,
    UnitScore, UpstreamFlag, WorkflowPayload,
};

const PRIORITY_WEIGHT: f32 = 0.2;
const CLASSIFICATION_WEIGHT: f32 = 0.2;
const DRAFT_WEIGHT: f32 = 0.3;
const SIDE_EFFECT_WEIGHT: f32 = 0.15;
const SIDE_EFFECT_CAP: f32 = 0.2;

/// Baseline risk per category: how costly a wrong automatic answer is.
fn category_base(category: IntentCategory) -> f32 {
    match category {
        IntentCategory::Scheduling => 0.0,
        IntentCategory::Support => 0.03,
        IntentCategory::Lead => 0.05,
        IntentCategory::Billing => 0.08,
        IntentCategory::Spam | IntentCategory::Other => 0.1,
    }
}

/// Risk factors for a candidate. Flags are reported separately.
pub fn risk_factors(candidate: &CandidateAction, intent: &Intent) -> Vec<RiskFactor> {
    let mut factors = Vec::with_capacity(5);
    let mut push = |name: &str, weight: f32, detail: String| {
        if weight > 0.0 {
            factors.push(RiskFactor {
                name: name.to_string(),
                weight,
                detail,
            });
        }
    };

    push(
        "priority",
        PRIORITY_WEIGHT * intent.priority.value(),
        format!("{:?} priority ({})", intent.priority_level(), intent.priority),
    );
    push(
        "classification_uncertainty",
        CLASSIFICATION_WEIGHT * (1.0 - intent.confidence.value()),
        format!("intent '{}' at confidence {}", intent.category, intent.confidence),
    );
    let draft_detail = match candidate.draft {
        Some(_) => format!("draft confidence {}", candidate.draft_confidence),
        None => "no draft".to_string(),
    };
    push(
        "draft_uncertainty",
        DRAFT_WEIGHT * (1.0 - candidate.draft_confidence.value()),
        draft_detail,
    );

    let beyond_reply: Vec<&str> = candidate
        .proposed_effects
        .iter()
        .filter(|e| e.is_beyond_reply())
        .map(|e| e.label())
        .collect();
    push(
        "side_effects",
        (SIDE_EFFECT_WEIGHT * beyond_reply.len() as f32).min(SIDE_EFFECT_CAP),
        format!("proposes {}", beyond_reply.join(", ")),
    );
    push(
        "category",
        category_base(intent.category),
        format!("category '{}'", intent.category),
    );

    factors
}

/// The precedence rule, on its own.
pub fn decide(risk: UnitScore, flagged: bool, tenant_config: &TenantConfig) -> Decision {
    if flagged || risk >= tenant_config.escalation_threshold {
        Decision::Escalate
    } else if tenant_config.auto_send_enabled {
        Decision::AutoSend
    } else {
        Decision::DraftOnly
    }
}

/// Score and decide.
///
/// `warnings` are flags recorded on the payload by earlier stages; the
/// candidate's own flags are considered too.
pub fn evaluate(
    candidate: &CandidateAction,
    intent: &Intent,
    tenant_config: &TenantConfig,
    warnings: &[UpstreamFlag],
) -> QaDecision {
    let mut flags: Vec<&UpstreamFlag> = warnings.iter().collect();
    for flag in &candidate.flags {
        if !flags.contains(&flag) {
            flags.push(flag);
        }
    }

    let mut factors = risk_factors(candidate, intent);
    let risk_score = if flags.is_empty() {
        UnitScore::clamped(factors.iter().map(|f| f.weight).sum())
    } else {
        let described: Vec<String> = flags.iter().map(|f| f.describe()).collect();
        factors.push(RiskFactor {
            name: "upstream_flags".to_string(),
            weight: 1.0,
            detail: described.join("; "),
        });
        UnitScore::ONE
    };

    let decision = decide(risk_score, !flags.is_empty(), tenant_config);
    let threshold = tenant_config.escalation_threshold;
    let reason = match decision {
        Decision::Escalate if !flags.is_empty() => {
            let described: Vec<String> = flags.iter().map(|f| f.describe()).collect();
            format!("upstream flags present: {}", described.join("; "))
        }
        Decision::Escalate => format!("risk {risk_score} >= threshold {threshold}"),
        Decision::AutoSend => {
            format!("risk {risk_score} < threshold {threshold}; auto-send enabled for tenant")
        }
        Decision::DraftOnly => {
            format!("risk {risk_score} < threshold {threshold}; auto-send disabled for tenant")
        }
    };

    let mut ranked: Vec<&RiskFactor> = factors.iter().collect();
    ranked.sort_by(|a, b| b.weight.total_cmp(&a.weight));
    let top: Vec<String> = ranked
        .iter()
        .take(3)
        .map(|f| format!("{} {:.2}", f.name, f.weight))
        .collect();
    let rationale = if top.is_empty() {
        format!("{decision}: {reason}")
    } else {
        format!("{decision}: {reason}. Key factors: {}", top.join(", "))
    };

    let proposed = QaDecision {
        decision,
        risk_score,
        rationale,
        factors,
    };
    enforce_policy(proposed, !flags.is_empty(), tenant_config)
}

/// Why a decision breaks the precedence rules, if it does.
fn policy_violation(decision: &QaDecision, flagged: bool, tenant_config: &TenantConfig) -> Option<String> {
    if decision.decision == Decision::Escalate {
        return None;
    }
    if flagged {
        return Some("non-escalating decision despite upstream flags".into());
    }
    if decision.risk_score >= tenant_config.escalation_threshold {
        return Some(format!(
            "risk {} at or above threshold {} was not escalated",
            decision.risk_score, tenant_config.escalation_threshold
        ));
    }
    if decision.decision == Decision::AutoSend && !tenant_config.auto_send_enabled {
        return Some("auto_send while auto-send is disabled for tenant".into());
    }
    None
}

/// Post-decision audit. A violation is an invariant breach: logged at error
/// level and overridden to `escalate`.
pub fn enforce_policy(
    decision: QaDecision,
    flagged: bool,
    tenant_config: &TenantConfig,
) -> QaDecision {
    match policy_violation(&decision, flagged, tenant_config) {
        None => decision,
        Some(violation) => {
            error!(
                tenant_id = %tenant_config.tenant_id,
                decision = %decision.decision,
                violation = %violation,
                "Guardrail policy violation, forcing escalation"
            );
            QaDecision {
                decision: Decision::Escalate,
                rationale: format!("escalate: guardrail policy violation ({violation})"),
                ..decision
            }
        }
    }
}

/// Evaluate and accrete the decision onto the payload.
pub fn evaluate_payload(payload: WorkflowPayload) -> Result<WorkflowPayload, PipelineError> {
    let (Some(intent), Some(candidate)) = (&payload.intent, &payload.candidate_action) else {
        return Err(PipelineError::InvariantBreach(format!(
            "workflow {}: guardrail requires intent and candidate_action",
            payload.workflow_id
        )));
    };
    let decision = evaluate(candidate, intent, &payload.tenant_config, &payload.warnings);
    payload.with_decision(decision)
}
