//! LLM-backed text understanding via rig-core.
//!
//! The model is asked for a JSON object in both calls. Responses are parsed
//! leniently (markdown fences, leading prose) and validated downstream.

use std::sync::Arc;

use async_trait::async_trait;
use rig::agent::Agent;
use rig::client::CompletionClient;
use rig::completion::{CompletionModel, Prompt};
use secrecy::ExposeSecret;
use serde::Deserialize;

use super::{
    ClassifyContext, DraftContext, DraftGrounding, GeneratedDraft, RawClassification,
    TextUnderstanding,
};
use crate::config::{LlmBackend, LlmSettings};
use crate::error::CapabilityError;
use crate::workflow::types::IntentCategory;

const MAX_TOKENS: u64 = 1024;

/// Text understanding backed by a rig completion model.
pub struct LlmTextModel<M: CompletionModel> {
    classifier: Agent<M>,
    drafter: Agent<M>,
    provider: String,
}

impl<M> LlmTextModel<M>
where
    M: CompletionModel + 'static,
{
    fn unavailable(&self, e: impl std::fmt::Display) -> CapabilityError {
        CapabilityError::Unavailable {
            capability: self.provider.clone(),
            reason: e.to_string(),
        }
    }

    fn invalid(&self, reason: String) -> CapabilityError {
        CapabilityError::InvalidResponse {
            capability: self.provider.clone(),
            reason,
        }
    }
}

#[async_trait]
impl<M> TextUnderstanding for LlmTextModel<M>
where
    M: CompletionModel + 'static,
{
    fn name(&self) -> &str {
        &self.provider
    }

    async fn classify(
        &self,
        text: &str,
        context: ClassifyContext<'_>,
    ) -> Result<RawClassification, CapabilityError> {
        let prompt = build_classify_prompt(text, &context);
        let raw = self
            .classifier
            .prompt(prompt)
            .await
            .map_err(|e| self.unavailable(e))?;
        parse_classification(&raw).map_err(|reason| self.invalid(reason))
    }

    async fn generate_draft(
        &self,
        context: &DraftContext,
    ) -> Result<GeneratedDraft, CapabilityError> {
        let prompt = build_draft_prompt(context);
        let raw = self
            .drafter
            .prompt(prompt)
            .await
            .map_err(|e| self.unavailable(e))?;
        parse_draft(&raw).map_err(|reason| self.invalid(reason))
    }
}

/// Build the configured text model.
pub fn create_text_model(
    settings: &LlmSettings,
) -> Result<Arc<dyn TextUnderstanding>, CapabilityError> {
    match settings.backend {
        LlmBackend::Anthropic => {
            use rig::providers::anthropic;

            let client: rig::client::Client<anthropic::client::AnthropicExt> =
                anthropic::Client::new(settings.api_key.expose_secret()).map_err(|e| {
                    CapabilityError::Unavailable {
                        capability: "anthropic".to_string(),
                        reason: format!("Failed to create Anthropic client: {}", e),
                    }
                })?;
            tracing::info!("Using Anthropic for text understanding (model: {})", settings.model);
            Ok(Arc::new(build_model(&client, &settings.model, "anthropic")))
        }
        LlmBackend::OpenAi => {
            use rig::providers::openai;

            let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
                openai::Client::new(settings.api_key.expose_secret()).map_err(|e| {
                    CapabilityError::Unavailable {
                        capability: "openai".to_string(),
                        reason: format!("Failed to create OpenAI client: {}", e),
                    }
                })?;
            tracing::info!("Using OpenAI for text understanding (model: {})", settings.model);
            Ok(Arc::new(build_model(&client, &settings.model, "openai")))
        }
    }
}

fn build_model<C>(client: &C, model: &str, provider: &str) -> LlmTextModel<C::CompletionModel>
where
    C: CompletionClient,
    C::CompletionModel: 'static,
{
    let classifier = client
        .agent(model)
        .preamble(&classify_system_prompt())
        .max_tokens(MAX_TOKENS)
        .temperature(0.0)
        .build();
    let drafter = client
        .agent(model)
        .preamble(DRAFT_SYSTEM_PROMPT)
        .max_tokens(MAX_TOKENS)
        .temperature(0.3)
        .build();
    LlmTextModel {
        classifier,
        drafter,
        provider: format!("{provider}:{model}"),
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn classify_system_prompt() -> String {
    let labels: Vec<&str> = IntentCategory::ALL.iter().map(|c| c.as_str()).collect();
    format!(
        "You classify inbound business email by purpose.\n\n\
         Labels: {}.\n\n\
         Respond with ONLY a JSON object:\n\
         {{\"label\": \"...\", \"score\": 0.0, \"sub_intent\": \"...\"}}\n\n\
         Rules:\n\
         - score is your confidence in the label, between 0.0 and 1.0\n\
         - sub_intent is a short snake_case refinement (e.g. \"reschedule\", \"password_reset\"), or omit it\n\
         - Use \"other\" when no label fits",
        labels.join(", ")
    )
}

const DRAFT_SYSTEM_PROMPT: &str = "You write short email replies on behalf of a small business.\n\n\
     Respond with ONLY a JSON object:\n\
     {\"draft\": \"...\", \"confidence\": 0.0}\n\n\
     Rules:\n\
     - Use only the facts provided under Grounding; never invent times, prices or policies\n\
     - Match the requested tone\n\
     - confidence is how fully the grounding answers the message, between 0.0 and 1.0\n\
     - Sign off without a name";

fn build_classify_prompt(text: &str, context: &ClassifyContext<'_>) -> String {
    let mut prompt = String::with_capacity(512);
    prompt.push_str(&format!("From: {}", context.contact.email));
    if let Some(ref name) = context.contact.name {
        prompt.push_str(&format!(" ({})", name));
    }
    prompt.push('\n');
    if !context.subject.is_empty() {
        prompt.push_str(&format!("Subject: {}\n", context.subject));
    }

    if !context.thread_history.is_empty() {
        prompt.push_str("\nRecent thread:\n");
        for (i, msg) in context.thread_history.iter().rev().take(3).enumerate() {
            let preview: String = msg.body_text.chars().take(200).collect();
            let sender = msg.sender.as_deref().unwrap_or("unknown");
            prompt.push_str(&format!("  [{}] {}: {}\n", i + 1, sender, preview));
        }
    }

    let preview: String = text.chars().take(1000).collect();
    prompt.push_str(&format!("\nMessage:\n{}", preview));
    prompt
}

fn build_draft_prompt(context: &DraftContext) -> String {
    let mut prompt = String::with_capacity(1024);
    prompt.push_str(&format!("Intent: {}\n", context.intent));
    prompt.push_str(&format!("Tone: {}\n", context.tone));
    prompt.push_str(&format!("Recipient: {}\n", context.contact_name));
    if !context.subject.is_empty() {
        prompt.push_str(&format!("Subject: {}\n", context.subject));
    }

    prompt.push_str("\nGrounding:\n");
    match &context.grounding {
        DraftGrounding::Slots(slots) => {
            for slot in slots {
                prompt.push_str(&format!(
                    "- available: {} ({}, {} min)\n",
                    slot.start.format("%A %d %B %H:%M"),
                    slot.timezone,
                    slot.duration_minutes
                ));
            }
        }
        DraftGrounding::Snippets(snippets) => {
            for snippet in snippets {
                let content: String = snippet.content.chars().take(600).collect();
                prompt.push_str(&format!("- [{}] {}: {}\n", snippet.doc_id, snippet.title, content));
            }
        }
    }

    let preview: String = context.body_text.chars().take(1000).collect();
    prompt.push_str(&format!("\nMessage:\n{}", preview));
    prompt
}

// ── Response parsing ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct DraftResponse {
    draft: String,
    #[serde(default)]
    confidence: f32,
}

fn parse_classification(raw: &str) -> Result<RawClassification, String> {
    let json_str = extract_json_object(raw);
    let mut parsed: RawClassification =
        serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))?;
    if parsed.label.trim().is_empty() {
        return Err("classification is missing a label".into());
    }
    if parsed.sub_intent.as_deref().is_some_and(|s| s.trim().is_empty()) {
        parsed.sub_intent = None;
    }
    Ok(parsed)
}

fn parse_draft(raw: &str) -> Result<GeneratedDraft, String> {
    let json_str = extract_json_object(raw);
    let response: DraftResponse =
        serde_json::from_str(&json_str).map_err(|e| format!("JSON parse error: {e}"))?;
    if response.draft.trim().is_empty() {
        return Err("draft is empty".into());
    }
    Ok(GeneratedDraft {
        text: response.draft,
        confidence: response.confidence,
    })
}

/// Extract a JSON object from model output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}
