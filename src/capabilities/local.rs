//! Offline collaborators.
//!
//! Deterministic implementations of every capability trait. They back the
//! service when no provider is configured and keep the pipeline runnable
//! end to end without network access.

use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveTime, Utc};
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    CalendarTransport, ClassifyContext, DeliveryResult, DraftContext, DraftGrounding,
    EventResult, GeneratedDraft, KnowledgeBase, MailboxTransport, OutboundReply,
    RawClassification, SlotConstraints, TextUnderstanding,
};
use crate::error::CapabilityError;
use crate::workflow::types::{
    DocumentSnippet, IntentCategory, NormalizedMessage, TimeSlot, UnitScore,
};

// ── Keyword intent model ────────────────────────────────────────────

struct KeywordRule {
    category: IntentCategory,
    regex: Regex,
}

static KEYWORD_RULES: LazyLock<Vec<KeywordRule>> = LazyLock::new(|| {
    let rule = |category, pattern: &str| KeywordRule {
        category,
        regex: Regex::new(pattern).expect("keyword pattern is valid"),
    };
    vec![
        rule(
            IntentCategory::Spam,
            r"(?i)\b(unsubscribe|lottery|you have won|winner|crypto giveaway|act now)\b",
        ),
        rule(
            IntentCategory::Scheduling,
            r"(?i)\b(schedule|reschedule|meeting|meet|call|calendar|availability|available|slot|appointment|next week|tomorrow)\b",
        ),
        rule(
            IntentCategory::Billing,
            r"(?i)\b(invoice|billing|payment|refund|charged?|receipt|subscription)\b",
        ),
        rule(
            IntentCategory::Support,
            r"(?i)\b(help|issue|problem|error|bug|broken|not working|how do i|how to|can't|cannot|support|reset)\b",
        ),
        rule(
            IntentCategory::Lead,
            r"(?i)\b(pricing|quote|demo|interested in|trial|purchase|partnership)\b",
        ),
    ]
});

/// Regex keyword classifier with templated drafting.
#[derive(Debug, Default, Clone)]
pub struct KeywordModel;

impl KeywordModel {
    pub fn new() -> Self {
        Self
    }

    fn score_text(text: &str) -> RawClassification {
        let best = KEYWORD_RULES
            .iter()
            .map(|rule| (rule.category, rule.regex.find_iter(text).count()))
            .filter(|(_, hits)| *hits > 0)
            .fold(None::<(IntentCategory, usize)>, |best, candidate| match best {
                Some((_, hits)) if hits >= candidate.1 => best,
                _ => Some(candidate),
            });

        match best {
            Some((category, hits)) => RawClassification {
                label: category.as_str().to_string(),
                score: (0.55 + 0.15 * hits as f32).min(0.95),
                sub_intent: None,
            },
            None => RawClassification {
                label: IntentCategory::Other.as_str().to_string(),
                score: 0.4,
                sub_intent: None,
            },
        }
    }
}

#[async_trait]
impl TextUnderstanding for KeywordModel {
    fn name(&self) -> &str {
        "keyword-model"
    }

    async fn classify(
        &self,
        text: &str,
        context: ClassifyContext<'_>,
    ) -> Result<RawClassification, CapabilityError> {
        let combined = format!("{}\n{}", context.subject, text);
        Ok(Self::score_text(&combined))
    }

    async fn generate_draft(
        &self,
        context: &DraftContext,
    ) -> Result<GeneratedDraft, CapabilityError> {
        template_draft(context).ok_or_else(|| CapabilityError::Rejected {
            capability: self.name().to_string(),
            reason: "nothing to ground the draft on".into(),
        })
    }
}

/// Render a reply from the grounding alone. `None` when there is nothing to
/// ground on.
pub fn template_draft(context: &DraftContext) -> Option<GeneratedDraft> {
    let greeting = if context.tone.eq_ignore_ascii_case("casual") {
        format!("Hey {},", context.contact_name)
    } else {
        format!("Hi {},", context.contact_name)
    };

    match &context.grounding {
        DraftGrounding::Slots(slots) if !slots.is_empty() => {
            let lines: Vec<String> = slots
                .iter()
                .map(|s| {
                    format!(
                        "- {} ({}, {} min)",
                        s.start.format("%a %d %b %H:%M"),
                        s.timezone,
                        s.duration_minutes
                    )
                })
                .collect();
            Some(GeneratedDraft {
                text: format!(
                    "{greeting}\n\nThanks for reaching out. I have the following times available:\n{}\n\nLet me know which works best and I'll send over an invite.\n\nBest regards",
                    lines.join("\n")
                ),
                confidence: 0.85,
            })
        }
        DraftGrounding::Snippets(snippets) if !snippets.is_empty() => {
            let top = &snippets[0];
            let mut text = format!(
                "{greeting}\n\nThanks for your question. {}\n",
                top.content.trim()
            );
            if snippets.len() > 1 {
                let titles: Vec<&str> = snippets[1..].iter().map(|s| s.title.as_str()).collect();
                text.push_str(&format!(
                    "\nYou may also find these helpful: {}.\n",
                    titles.join(", ")
                ));
            }
            text.push_str("\nBest regards");
            Some(GeneratedDraft {
                text,
                confidence: 0.5 + 0.4 * top.score.value(),
            })
        }
        _ => None,
    }
}

// ── Working-hours calendar ──────────────────────────────────────────

/// Calendar that offers hourly slots inside working hours and remembers
/// the events it created.
///
/// Working hours are interpreted as UTC wall-clock; slots carry the tenant
/// timezone label for display.
#[derive(Debug, Default)]
pub struct WorkingHoursCalendar {
    booked: Mutex<Vec<(TimeSlot, Vec<String>)>>,
}

impl WorkingHoursCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot search anchored at `now`.
    pub async fn find_slots_from(
        &self,
        now: DateTime<Utc>,
        constraints: &SlotConstraints,
    ) -> Vec<TimeSlot> {
        let booked = self.booked.lock().await;
        let mut slots = Vec::with_capacity(constraints.count);
        let day_end_minutes = u32::from(constraints.working_hours_end) * 60;

        for offset in 1..=i64::from(constraints.days_ahead) {
            let date = now.date_naive() + ChronoDuration::days(offset);
            let weekday = date.weekday().num_days_from_monday() as u8;
            if !constraints.working_days.contains(&weekday) {
                continue;
            }
            for hour in constraints.working_hours_start..constraints.working_hours_end {
                if u32::from(hour) * 60 + constraints.duration_minutes > day_end_minutes {
                    break;
                }
                let Some(time) = NaiveTime::from_hms_opt(u32::from(hour), 0, 0) else {
                    continue;
                };
                let start = date.and_time(time).and_utc();
                if booked.iter().any(|(slot, _)| slot.start == start) {
                    continue;
                }
                slots.push(TimeSlot {
                    start,
                    duration_minutes: constraints.duration_minutes,
                    timezone: constraints.timezone.clone(),
                });
                if slots.len() >= constraints.count {
                    return slots;
                }
            }
        }
        slots
    }

    /// Events created so far.
    pub async fn booked(&self) -> Vec<(TimeSlot, Vec<String>)> {
        self.booked.lock().await.clone()
    }
}

#[async_trait]
impl CalendarTransport for WorkingHoursCalendar {
    fn name(&self) -> &str {
        "working-hours-calendar"
    }

    async fn find_slots(
        &self,
        constraints: &SlotConstraints,
    ) -> Result<Vec<TimeSlot>, CapabilityError> {
        Ok(self.find_slots_from(Utc::now(), constraints).await)
    }

    async fn create_event(
        &self,
        slot: &TimeSlot,
        attendees: &[String],
        title: &str,
    ) -> Result<EventResult, CapabilityError> {
        let mut booked = self.booked.lock().await;
        if booked.iter().any(|(s, _)| s.start == slot.start) {
            return Err(CapabilityError::Rejected {
                capability: "working-hours-calendar".into(),
                reason: format!("slot {} is already booked", slot.start),
            });
        }
        booked.push((slot.clone(), attendees.to_vec()));
        let event_id = format!("evt-{}", Uuid::new_v4());
        info!(event_id = %event_id, title = %title, start = %slot.start, "Calendar event created");
        Ok(EventResult { event_id })
    }
}

// ── In-memory knowledge base ────────────────────────────────────────

/// A knowledge-base article.
#[derive(Debug, Clone)]
pub struct Article {
    pub id: String,
    pub title: String,
    pub content: String,
}

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "you", "your", "can", "how", "what", "with", "this", "that", "are",
    "our", "have", "from", "hi", "hello", "thanks", "please",
];

/// Term-overlap search over a fixed article set.
#[derive(Debug, Clone)]
pub struct InMemoryKnowledgeBase {
    articles: Vec<Article>,
}

impl InMemoryKnowledgeBase {
    pub fn new(articles: Vec<Article>) -> Self {
        Self { articles }
    }

    /// A small built-in FAQ.
    pub fn with_default_articles() -> Self {
        let article = |id: &str, title: &str, content: &str| Article {
            id: id.into(),
            title: title.into(),
            content: content.into(),
        };
        Self::new(vec![
            article(
                "kb-password-reset",
                "Resetting your password",
                "You can reset your password from the login page by choosing 'Forgot password' and following the link we email you. The link is valid for 30 minutes.",
            ),
            article(
                "kb-export-data",
                "Exporting your data",
                "Account owners can export all data as CSV from Settings > Data > Export. Large exports are emailed when ready.",
            ),
            article(
                "kb-support-hours",
                "Support hours",
                "Our support team is available Monday to Friday, 9:00 to 17:00 UK time. Urgent outages are handled around the clock.",
            ),
            article(
                "kb-invite-users",
                "Inviting team members",
                "Admins can invite team members from Settings > Team. Invited users receive an email to join your workspace.",
            ),
        ])
    }

    fn terms(text: &str) -> Vec<String> {
        let mut terms: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .map(str::to_lowercase)
            .filter(|t| t.len() >= 3 && !STOPWORDS.contains(&t.as_str()))
            .collect();
        terms.sort();
        terms.dedup();
        terms
    }
}

#[async_trait]
impl KnowledgeBase for InMemoryKnowledgeBase {
    fn name(&self) -> &str {
        "in-memory-kb"
    }

    async fn search(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<DocumentSnippet>, CapabilityError> {
        let query_terms = Self::terms(query);
        if query_terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut hits: Vec<DocumentSnippet> = self
            .articles
            .iter()
            .filter_map(|article| {
                let doc_terms = Self::terms(&format!("{} {}", article.title, article.content));
                let matched = query_terms
                    .iter()
                    .filter(|t| doc_terms.binary_search(t).is_ok())
                    .count();
                (matched > 0).then(|| DocumentSnippet {
                    doc_id: article.id.clone(),
                    title: article.title.clone(),
                    content: article.content.clone(),
                    score: UnitScore::clamped(matched as f32 / query_terms.len() as f32),
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.doc_id.cmp(&b.doc_id))
        });
        hits.truncate(top_k);
        debug!(query_terms = query_terms.len(), hits = hits.len(), "Knowledge base search");
        Ok(hits)
    }
}

// ── Logging mailbox ─────────────────────────────────────────────────

/// Mailbox that records outbound replies instead of sending them.
#[derive(Debug, Default)]
pub struct LoggingMailbox {
    sent: Mutex<Vec<(String, OutboundReply)>>,
}

impl LoggingMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replies "sent" so far, as `(thread_id, reply)`.
    pub async fn sent(&self) -> Vec<(String, OutboundReply)> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl MailboxTransport for LoggingMailbox {
    fn name(&self) -> &str {
        "logging-mailbox"
    }

    async fn fetch_thread(
        &self,
        _thread_id: &str,
    ) -> Result<Vec<NormalizedMessage>, CapabilityError> {
        Ok(Vec::new())
    }

    async fn send_reply(
        &self,
        thread_id: &str,
        reply: &OutboundReply,
    ) -> Result<DeliveryResult, CapabilityError> {
        let message_id = format!("logged-{}", Uuid::new_v4());
        info!(
            thread_id = %thread_id,
            to = %reply.to,
            subject = %reply.subject,
            message_id = %message_id,
            "Outbound reply recorded (no SMTP transport configured)"
        );
        self.sent
            .lock()
            .await
            .push((thread_id.to_string(), reply.clone()));
        Ok(DeliveryResult { message_id })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::workflow::types::Contact;

    fn ctx<'a>(contact: &'a Contact, subject: &'a str) -> ClassifyContext<'a> {
        ClassifyContext {
            contact,
            subject,
            thread_history: &[],
            tone: "professional",
        }
    }

    fn contact() -> Contact {
        Contact {
            email: "a@example.com".into(),
            name: None,
            org_id: None,
        }
    }

    fn constraints() -> SlotConstraints {
        SlotConstraints {
            timezone: "Europe/London".into(),
            working_hours_start: 9,
            working_hours_end: 17,
            working_days: vec![0, 1, 2, 3, 4],
            count: 3,
            duration_minutes: 30,
            days_ahead: 7,
        }
    }

    #[tokio::test]
    async fn keyword_model_detects_scheduling() {
        let c = contact();
        let result = KeywordModel::new()
            .classify("Can we schedule a call next week?", ctx(&c, ""))
            .await
            .unwrap();
        assert_eq!(result.label, "scheduling");
        assert!(result.score > 0.8);
    }

    #[tokio::test]
    async fn keyword_model_detects_support_and_billing() {
        let c = contact();
        let support = KeywordModel::new()
            .classify("I get an error when I try to log in, can you help?", ctx(&c, ""))
            .await
            .unwrap();
        assert_eq!(support.label, "support");

        let billing = KeywordModel::new()
            .classify("Please send the invoice for last month's payment", ctx(&c, ""))
            .await
            .unwrap();
        assert_eq!(billing.label, "billing");
    }

    #[tokio::test]
    async fn keyword_model_falls_back_to_other() {
        let c = contact();
        let result = KeywordModel::new()
            .classify("Lovely weather today.", ctx(&c, ""))
            .await
            .unwrap();
        assert_eq!(result.label, "other");
    }

    #[tokio::test]
    async fn keyword_model_uses_subject() {
        let c = contact();
        let result = KeywordModel::new()
            .classify("See below.", ctx(&c, "Invoice question"))
            .await
            .unwrap();
        assert_eq!(result.label, "billing");
    }

    #[tokio::test]
    async fn slot_drafts_list_every_slot() {
        let start = Utc.with_ymd_and_hms(2026, 3, 3, 10, 0, 0).unwrap();
        let draft = KeywordModel::new()
            .generate_draft(&DraftContext {
                intent: IntentCategory::Scheduling,
                contact_name: "Alice".into(),
                subject: "Call".into(),
                body_text: "Can we talk?".into(),
                tone: "professional".into(),
                grounding: DraftGrounding::Slots(vec![TimeSlot {
                    start,
                    duration_minutes: 30,
                    timezone: "Europe/London".into(),
                }]),
            })
            .await
            .unwrap();
        assert!(draft.text.starts_with("Hi Alice,"));
        assert!(draft.text.contains("Tue 03 Mar 10:00"));
    }

    #[tokio::test]
    async fn empty_grounding_is_rejected() {
        let err = KeywordModel::new()
            .generate_draft(&DraftContext {
                intent: IntentCategory::Support,
                contact_name: "Bob".into(),
                subject: String::new(),
                body_text: String::new(),
                tone: "professional".into(),
                grounding: DraftGrounding::Snippets(vec![]),
            })
            .await;
        assert!(matches!(err, Err(CapabilityError::Rejected { .. })));
    }

    #[tokio::test]
    async fn calendar_offers_weekday_slots_in_working_hours() {
        // Friday
        let now = Utc.with_ymd_and_hms(2026, 3, 6, 15, 0, 0).unwrap();
        let calendar = WorkingHoursCalendar::new();
        let slots = calendar.find_slots_from(now, &constraints()).await;
        assert_eq!(slots.len(), 3);
        // Skips the weekend and starts Monday 09:00.
        assert_eq!(slots[0].start, Utc.with_ymd_and_hms(2026, 3, 9, 9, 0, 0).unwrap());
        assert_eq!(slots[1].start, Utc.with_ymd_and_hms(2026, 3, 9, 10, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn calendar_skips_booked_slots() {
        let now = Utc.with_ymd_and_hms(2026, 3, 6, 15, 0, 0).unwrap();
        let calendar = WorkingHoursCalendar::new();
        let first = calendar.find_slots_from(now, &constraints()).await.remove(0);
        calendar
            .create_event(&first, &["a@example.com".into()], "Call")
            .await
            .unwrap();

        let slots = calendar.find_slots_from(now, &constraints()).await;
        assert!(slots.iter().all(|s| s.start != first.start));
        assert!(calendar.create_event(&first, &[], "Again").await.is_err());
    }

    #[tokio::test]
    async fn calendar_without_working_days_returns_nothing() {
        let mut c = constraints();
        c.working_days.clear();
        let slots = WorkingHoursCalendar::new()
            .find_slots_from(Utc::now(), &c)
            .await;
        assert!(slots.is_empty());
    }

    #[tokio::test]
    async fn knowledge_base_ranks_by_overlap() {
        let kb = InMemoryKnowledgeBase::with_default_articles();
        let hits = kb.search("How do I reset my password?", 2).await.unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].doc_id, "kb-password-reset");
        assert!(hits.len() <= 2);
    }

    #[tokio::test]
    async fn knowledge_base_returns_nothing_for_unrelated_query() {
        let kb = InMemoryKnowledgeBase::with_default_articles();
        assert!(kb.search("zebra xylophone", 2).await.unwrap().is_empty());
        assert!(kb.search("", 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn logging_mailbox_records_replies() {
        let mailbox = LoggingMailbox::new();
        let reply = OutboundReply {
            to: "a@example.com".into(),
            subject: "Re: hi".into(),
            body: "hello".into(),
            in_reply_to: Some("m-1".into()),
        };
        let result = mailbox.send_reply("t-1", &reply).await.unwrap();
        assert!(result.message_id.starts_with("logged-"));
        assert_eq!(mailbox.sent().await, vec![("t-1".to_string(), reply)]);
        assert!(mailbox.fetch_thread("t-1").await.unwrap().is_empty());
    }
}
