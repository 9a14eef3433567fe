//! Shared types for the workflow data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Scores ──────────────────────────────────────────────────────────

/// A score guaranteed to lie in `[0, 1]`.
///
/// Values coming from collaborators go through [`UnitScore::clamped`];
/// internally computed values use [`UnitScore::new`] and treat a rejection
/// as a programming error.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(try_from = "f32", into = "f32")]
pub struct UnitScore(f32);

impl UnitScore {
    pub const ZERO: UnitScore = UnitScore(0.0);
    pub const ONE: UnitScore = UnitScore(1.0);

    /// Accepts only finite values within `[0, 1]`.
    pub fn new(value: f32) -> Option<Self> {
        (value.is_finite() && (0.0..=1.0).contains(&value)).then_some(Self(value))
    }

    /// Clamp into range. NaN maps to zero.
    pub fn clamped(value: f32) -> Self {
        if value.is_nan() {
            Self(0.0)
        } else {
            Self(value.clamp(0.0, 1.0))
        }
    }

    pub fn value(self) -> f32 {
        self.0
    }
}

impl TryFrom<f32> for UnitScore {
    type Error = String;
    fn try_from(value: f32) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("score {value} is outside [0, 1]"))
    }
}

impl From<UnitScore> for f32 {
    fn from(score: UnitScore) -> Self {
        score.0
    }
}

impl std::fmt::Display for UnitScore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

// ── Inbound message ─────────────────────────────────────────────────

/// Where a message came from. Set once at ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    /// Channel name, e.g. "gmail".
    pub channel: String,
    pub thread_id: String,
    pub message_id: String,
}

/// Sender identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
}

impl Contact {
    /// Name for greetings, falling back to the local part of the address.
    pub fn display_name(&self) -> &str {
        match self.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name,
            _ => self.email.split('@').next().unwrap_or(&self.email),
        }
    }
}

/// Normalized inbound content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub subject: String,
    pub body_text: String,
    pub received_at: DateTime<Utc>,
    pub message_id: String,
    pub thread_id: String,
    /// Sender address, when known (thread history entries).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
}

// ── Tenant policy ───────────────────────────────────────────────────

/// Policy snapshot in effect for one workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantConfig {
    pub tenant_id: String,
    pub auto_send_enabled: bool,
    /// Risk at or above this escalates.
    pub escalation_threshold: UnitScore,
    pub timezone: String,
    /// Hour of day (0-23).
    pub working_hours_start: u8,
    /// Hour of day, exclusive (1-24).
    pub working_hours_end: u8,
    /// 0 = Monday.
    pub working_days: Vec<u8>,
    pub tone: String,
}

// ── Intent ──────────────────────────────────────────────────────────

/// Closed set of message purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentCategory {
    Scheduling,
    Support,
    Billing,
    Lead,
    Spam,
    Other,
}

impl IntentCategory {
    pub const ALL: [IntentCategory; 6] = [
        Self::Scheduling,
        Self::Support,
        Self::Billing,
        Self::Lead,
        Self::Spam,
        Self::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduling => "scheduling",
            Self::Support => "support",
            Self::Billing => "billing",
            Self::Lead => "lead",
            Self::Spam => "spam",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for IntentCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IntentCategory {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| format!("Unknown intent category: {}", s))
    }
}

/// Coarse urgency bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityLevel {
    Low,
    Normal,
    High,
    Critical,
}

impl PriorityLevel {
    pub fn from_score(score: UnitScore) -> Self {
        match score.value() {
            s if s >= 0.85 => Self::Critical,
            s if s >= 0.6 => Self::High,
            s if s >= 0.25 => Self::Normal,
            _ => Self::Low,
        }
    }
}

/// Classifier output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub category: IntentCategory,
    /// Urgency in `[0, 1]`.
    pub priority: UnitScore,
    /// Classifier confidence in `[0, 1]`.
    pub confidence: UnitScore,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_intent: Option<String>,
    /// True when produced by the fallback path.
    #[serde(default)]
    pub degraded: bool,
}

impl Intent {
    /// Deterministic intent used when classification is unavailable.
    pub fn fallback() -> Self {
        Self {
            category: IntentCategory::Other,
            priority: UnitScore::ZERO,
            confidence: UnitScore::ZERO,
            sub_intent: None,
            degraded: true,
        }
    }

    pub fn priority_level(&self) -> PriorityLevel {
        PriorityLevel::from_score(self.priority)
    }
}

// ── Candidate action ────────────────────────────────────────────────

/// Which worker strategy produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Scheduling,
    Support,
    Generic,
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheduling => write!(f, "scheduling"),
            Self::Support => write!(f, "support"),
            Self::Generic => write!(f, "generic"),
        }
    }
}

/// A bookable calendar slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub start: DateTime<Utc>,
    pub duration_minutes: u32,
    pub timezone: String,
}

/// A knowledge-base hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSnippet {
    pub doc_id: String,
    pub title: String,
    pub content: String,
    pub score: UnitScore,
}

/// An externally visible action proposed by a worker. Executed only after `auto_send`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProposedEffect {
    SendReply {
        thread_id: String,
        to: String,
        subject: String,
        body: String,
    },
    CreateEvent {
        slot: TimeSlot,
        attendees: Vec<String>,
        title: String,
    },
}

impl ProposedEffect {
    pub fn label(&self) -> &'static str {
        match self {
            Self::SendReply { .. } => "send_reply",
            Self::CreateEvent { .. } => "create_event",
        }
    }

    /// Effects beyond replying to the sender carry extra risk.
    pub fn is_beyond_reply(&self) -> bool {
        !matches!(self, Self::SendReply { .. })
    }
}

/// Degradation signals recorded by upstream stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpstreamFlag {
    ClassificationDegraded { reason: String },
    InsufficientInformation { reason: String },
    UnmappedIntent { category: IntentCategory },
}

impl UpstreamFlag {
    pub fn describe(&self) -> String {
        match self {
            Self::ClassificationDegraded { reason } => {
                format!("classification degraded ({reason})")
            }
            Self::InsufficientInformation { reason } => {
                format!("insufficient information ({reason})")
            }
            Self::UnmappedIntent { category } => format!("no worker for intent '{category}'"),
        }
    }
}

/// Worker output, not yet authorized for execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateAction {
    pub worker: WorkerKind,
    /// Reply text. `None` when the worker had nothing to say.
    pub draft: Option<String>,
    pub draft_confidence: UnitScore,
    #[serde(default)]
    pub proposed_effects: Vec<ProposedEffect>,
    #[serde(default)]
    pub citations: Vec<String>,
    #[serde(default)]
    pub flags: Vec<UpstreamFlag>,
}

impl CandidateAction {
    /// An escalation-biased candidate: empty draft, flagged for review.
    pub fn needs_human(worker: WorkerKind, flag: UpstreamFlag) -> Self {
        Self {
            worker,
            draft: None,
            draft_confidence: UnitScore::ZERO,
            proposed_effects: Vec::new(),
            citations: Vec::new(),
            flags: vec![flag],
        }
    }

    pub fn is_flagged(&self) -> bool {
        !self.flags.is_empty()
    }
}

// ── QA decision ─────────────────────────────────────────────────────

/// Guardrail disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    AutoSend,
    DraftOnly,
    Escalate,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutoSend => "auto_send",
            Self::DraftOnly => "draft_only",
            Self::Escalate => "escalate",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One contribution to the risk score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFactor {
    pub name: String,
    pub weight: f32,
    pub detail: String,
}

/// Guardrail output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaDecision {
    pub decision: Decision,
    pub risk_score: UnitScore,
    pub rationale: String,
    #[serde(default)]
    pub factors: Vec<RiskFactor>,
}

// ── Delivery ────────────────────────────────────────────────────────

/// Result of executing one side effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectOutcome {
    pub effect: String,
    pub succeeded: bool,
    /// The call was abandoned at its deadline; the effect may still have
    /// happened on the provider side.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unconfirmed: bool,
    /// Provider id of the sent message or created event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EffectOutcome {
    pub fn executed(effect: &str, external_id: String) -> Self {
        Self {
            effect: effect.to_string(),
            succeeded: true,
            unconfirmed: false,
            external_id: Some(external_id),
            error: None,
        }
    }

    pub fn failed(effect: &str, error: String) -> Self {
        Self {
            effect: effect.to_string(),
            succeeded: false,
            unconfirmed: false,
            external_id: None,
            error: Some(error),
        }
    }

    /// Timed out without an answer from the provider.
    pub fn unconfirmed(effect: &str, error: String) -> Self {
        Self {
            unconfirmed: true,
            ..Self::failed(effect, format!("{error}; delivery outcome unknown"))
        }
    }
}

/// Side-effect execution record, kept separate from the decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub attempted_at: DateTime<Utc>,
    pub outcomes: Vec<EffectOutcome>,
}

impl DeliveryReport {
    pub fn succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.succeeded)
    }

    pub fn failures(&self) -> impl Iterator<Item = &EffectOutcome> {
        self.outcomes.iter().filter(|o| !o.succeeded)
    }

    /// True when some effect may or may not have happened.
    pub fn has_unconfirmed(&self) -> bool {
        self.outcomes.iter().any(|o| o.unconfirmed)
    }
}

// ── Priority hints ──────────────────────────────────────────────────

/// Heuristic urgency signals computed from the message itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriorityHints {
    pub has_question: bool,
    pub urgent_language: bool,
    pub is_reply_to_us: bool,
    pub sender_is_known: bool,
}

const URGENT_TERMS: &[&str] = &[
    "urgent",
    "asap",
    "immediately",
    "as soon as possible",
    "emergency",
    "outage",
    "down",
    "today",
];

impl PriorityHints {
    pub fn analyze(message: &NormalizedMessage, known_senders: &[String], sender: &str) -> Self {
        let text = format!("{} {}", message.subject, message.body_text).to_lowercase();
        let sender_lower = sender.to_lowercase();
        Self {
            has_question: text.contains('?'),
            urgent_language: URGENT_TERMS.iter().any(|t| {
                text.split(|c: char| !c.is_alphanumeric() && c != ' ')
                    .any(|chunk| contains_word(chunk, t))
            }),
            is_reply_to_us: message.subject.trim_start().to_lowercase().starts_with("re:"),
            sender_is_known: known_senders
                .iter()
                .any(|s| s.to_lowercase() == sender_lower),
        }
    }

    /// Urgency score derived from the hints.
    pub fn priority(&self) -> UnitScore {
        let mut score = 0.1;
        if self.has_question {
            score += 0.2;
        }
        if self.urgent_language {
            score += 0.45;
        }
        if self.is_reply_to_us {
            score += 0.1;
        }
        if self.sender_is_known {
            score += 0.1;
        }
        UnitScore::clamped(score)
    }
}

fn contains_word(haystack: &str, term: &str) -> bool {
    haystack.match_indices(term).any(|(idx, _)| {
        let before = haystack[..idx].chars().next_back();
        let after = haystack[idx + term.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}
