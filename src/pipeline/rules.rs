//! Pre-model rules engine for fast pattern matching.
//!
//! Runs before the text-understanding capability to settle obvious cases:
//! - noreply / mailer-daemon / marketing senders → `spam`
//! - unsubscribe subjects and footers → `spam`
//! - payment receipts and invoice numbers → `billing`
//!
//! A match short-circuits the capability call entirely.

use regex::Regex;
use tracing::debug;

use crate::workflow::{IntentCategory, NormalizedMessage};

/// Which field a rule matches against.
#[derive(Debug, Clone, Copy)]
pub enum RuleField {
    Sender,
    Subject,
    Body,
}

/// A single classification rule with a compiled regex.
#[derive(Debug, Clone)]
pub struct ClassificationRule {
    /// Human-readable pattern description.
    pub pattern: String,
    pub regex: Regex,
    pub field: RuleField,
    pub category: IntentCategory,
    /// Why this rule triggers.
    pub reason: String,
}

/// Outcome of a matching rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch {
    pub category: IntentCategory,
    pub reason: String,
}

/// Rules engine evaluated ahead of the intent model.
pub struct RulesEngine {
    rules: Vec<ClassificationRule>,
    /// Senders that always reach the model (bypass every rule).
    bypass_patterns: Vec<Regex>,
}

impl RulesEngine {
    /// Rules for automated and bulk mail.
    pub fn default_rules() -> Self {
        let rule = |pattern: &str, regex: &str, field, category, reason: &str| ClassificationRule {
            pattern: pattern.into(),
            regex: Regex::new(regex).expect("built-in rule pattern is valid"),
            field,
            category,
            reason: reason.into(),
        };

        let rules = vec![
            rule(
                "noreply@*",
                r"(?i)^no[\-_.]?reply@",
                RuleField::Sender,
                IntentCategory::Spam,
                "noreply sender",
            ),
            rule(
                "*@marketing.*",
                r"(?i)@(marketing|newsletter|promo|campaign)\b",
                RuleField::Sender,
                IntentCategory::Spam,
                "marketing/newsletter sender",
            ),
            rule(
                "mailer-daemon",
                r"(?i)^(mailer[\-_]?daemon|postmaster)@",
                RuleField::Sender,
                IntentCategory::Spam,
                "automated mail system",
            ),
            rule(
                "unsubscribe in subject",
                r"(?i)\bunsubscribe\b",
                RuleField::Subject,
                IntentCategory::Spam,
                "newsletter (unsubscribe in subject)",
            ),
            rule(
                "unsubscribe footer",
                r"(?i)(click here to unsubscribe|manage your subscription|email preferences|opt[- ]?out)",
                RuleField::Body,
                IntentCategory::Spam,
                "bulk email (unsubscribe footer)",
            ),
            rule(
                "payment receipt",
                r"(?i)(payment (received|confirmed|failed)|receipt for|invoice #|your (receipt|transaction))",
                RuleField::Body,
                IntentCategory::Billing,
                "payment or receipt notice",
            ),
        ];

        Self {
            rules,
            bypass_patterns: Vec::new(),
        }
    }

    /// Exempt exact sender addresses (case-insensitive) from every rule.
    pub fn with_bypass_senders<S: AsRef<str>>(mut self, senders: &[S]) -> Result<Self, regex::Error> {
        for sender in senders {
            let pattern = format!("(?i)^{}$", regex::escape(sender.as_ref().trim()));
            self.bypass_patterns.push(Regex::new(&pattern)?);
        }
        Ok(self)
    }

    /// First matching rule, in declaration order.
    pub fn evaluate(&self, sender: &str, message: &NormalizedMessage) -> Option<RuleMatch> {
        if self.bypass_patterns.iter().any(|r| r.is_match(sender)) {
            debug!(sender = %sender, "Sender matches bypass pattern, skipping rules");
            return None;
        }

        self.rules.iter().find_map(|rule| {
            let value = match rule.field {
                RuleField::Sender => sender,
                RuleField::Subject => &message.subject,
                RuleField::Body => &message.body_text,
            };
            rule.regex.is_match(value).then(|| {
                debug!(
                    sender = %sender,
                    rule = %rule.pattern,
                    category = %rule.category,
                    "Message matched classification rule"
                );
                RuleMatch {
                    category: rule.category,
                    reason: rule.reason.clone(),
                }
            })
        })
    }
}
