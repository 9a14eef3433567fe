//! External collaborators consumed by the pipeline.
//!
//! The pipeline only sees these traits. Every call goes through
//! [`bounded`], so a stalled dependency surfaces as
//! [`CapabilityError::Timeout`] instead of holding the run.

pub mod llm;
pub mod local;
pub mod smtp;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CapabilityError;
use crate::workflow::types::{
    Contact, DocumentSnippet, IntentCategory, NormalizedMessage, TimeSlot,
};

/// Raw classifier output before validation against the closed category set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawClassification {
    pub label: String,
    pub score: f32,
    #[serde(default)]
    pub sub_intent: Option<String>,
}

/// Context handed to the classifier alongside the message text.
#[derive(Debug, Clone)]
pub struct ClassifyContext<'a> {
    pub contact: &'a Contact,
    pub subject: &'a str,
    pub thread_history: &'a [NormalizedMessage],
    pub tone: &'a str,
}

/// What a draft should be grounded on.
#[derive(Debug, Clone)]
pub enum DraftGrounding {
    Slots(Vec<TimeSlot>),
    Snippets(Vec<DocumentSnippet>),
}

/// Context for generating a reply draft.
#[derive(Debug, Clone)]
pub struct DraftContext {
    pub intent: IntentCategory,
    pub contact_name: String,
    pub subject: String,
    pub body_text: String,
    pub tone: String,
    pub grounding: DraftGrounding,
}

/// A generated draft with the generator's own confidence.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedDraft {
    pub text: String,
    pub confidence: f32,
}

/// Text understanding: intent inference and reply drafting.
#[async_trait]
pub trait TextUnderstanding: Send + Sync {
    fn name(&self) -> &str;

    async fn classify(
        &self,
        text: &str,
        context: ClassifyContext<'_>,
    ) -> Result<RawClassification, CapabilityError>;

    async fn generate_draft(&self, context: &DraftContext)
    -> Result<GeneratedDraft, CapabilityError>;
}

/// Result of sending a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResult {
    pub message_id: String,
}

/// Outbound reply content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundReply {
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Message being answered, for threading headers.
    pub in_reply_to: Option<String>,
}

/// Mailbox transport.
#[async_trait]
pub trait MailboxTransport: Send + Sync {
    fn name(&self) -> &str;

    /// Earlier messages of a thread, oldest first.
    async fn fetch_thread(&self, thread_id: &str)
    -> Result<Vec<NormalizedMessage>, CapabilityError>;

    async fn send_reply(
        &self,
        thread_id: &str,
        reply: &OutboundReply,
    ) -> Result<DeliveryResult, CapabilityError>;
}

/// Slot search constraints, derived from tenant policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotConstraints {
    pub timezone: String,
    pub working_hours_start: u8,
    pub working_hours_end: u8,
    pub working_days: Vec<u8>,
    pub count: usize,
    pub duration_minutes: u32,
    pub days_ahead: u32,
}

/// Result of creating an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventResult {
    pub event_id: String,
}

/// Calendar transport.
#[async_trait]
pub trait CalendarTransport: Send + Sync {
    fn name(&self) -> &str;

    async fn find_slots(&self, constraints: &SlotConstraints)
    -> Result<Vec<TimeSlot>, CapabilityError>;

    async fn create_event(
        &self,
        slot: &TimeSlot,
        attendees: &[String],
        title: &str,
    ) -> Result<EventResult, CapabilityError>;
}

/// Knowledge-base retrieval.
#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    fn name(&self) -> &str;

    async fn search(&self, query: &str, top_k: usize)
    -> Result<Vec<DocumentSnippet>, CapabilityError>;
}

/// Run a capability call under a deadline.
pub async fn bounded<T, F>(
    capability: &str,
    timeout: Duration,
    call: F,
) -> Result<T, CapabilityError>
where
    F: Future<Output = Result<T, CapabilityError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(CapabilityError::Timeout {
            capability: capability.to_string(),
            timeout,
        }),
    }
}
