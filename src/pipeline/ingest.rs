//! Ingestion: validate an inbound request and normalize it into a
//! `Received` workflow payload.
//!
//! Request fields default to empty rather than failing deserialization, so
//! that every missing or malformed field is reported together as a
//! [`FieldError`] instead of the first serde error.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::capabilities::{MailboxTransport, bounded};
use crate::config::TenantDefaults;
use crate::error::{FieldError, PipelineError};
use crate::workflow::{
    Contact, NormalizedMessage, Source, TenantConfig, UnitScore, WorkflowPayload,
};

/// Body of `POST /workflows/incoming-message`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IncomingMessageRequest {
    pub tenant_id: String,
    pub source: SourceInput,
    pub contact: ContactInput,
    pub message: MessageInput,
    pub tenant_config: Option<TenantConfigInput>,
    /// Caller-supplied id for log correlation.
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SourceInput {
    pub channel: String,
    pub thread_id: String,
    pub message_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContactInput {
    pub email: String,
    pub name: Option<String>,
    pub org_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessageInput {
    pub subject: String,
    pub body_text: String,
    pub received_at: Option<DateTime<Utc>>,
    pub message_id: String,
    pub thread_id: String,
}

/// Tenant policy overrides. Omitted fields take [`TenantDefaults`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TenantConfigInput {
    pub tenant_id: Option<String>,
    pub auto_send_enabled: Option<bool>,
    pub escalation_threshold: Option<f32>,
    pub timezone: Option<String>,
    pub working_hours_start: Option<u8>,
    pub working_hours_end: Option<u8>,
    pub working_days: Option<Vec<u8>>,
    pub tone: Option<String>,
}

fn require(errors: &mut Vec<FieldError>, field: &str, value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        errors.push(FieldError::new(field, "is required"));
    }
    trimmed.to_string()
}

impl IncomingMessageRequest {
    /// Validate and normalize into a `Received` payload.
    pub fn into_payload(self, defaults: &TenantDefaults) -> Result<WorkflowPayload, PipelineError> {
        let mut errors = Vec::new();

        let tenant_id = require(&mut errors, "tenant_id", &self.tenant_id);
        let source = Source {
            channel: require(&mut errors, "source.channel", &self.source.channel),
            thread_id: require(&mut errors, "source.thread_id", &self.source.thread_id),
            message_id: require(&mut errors, "source.message_id", &self.source.message_id),
        };

        let email = require(&mut errors, "contact.email", &self.contact.email);
        if !email.is_empty() && !is_plausible_email(&email) {
            errors.push(FieldError::new("contact.email", "is not an email address"));
        }
        let contact = Contact {
            email,
            name: non_blank(self.contact.name),
            org_id: non_blank(self.contact.org_id),
        };

        let message = NormalizedMessage {
            subject: self.message.subject.trim().to_string(),
            body_text: self.message.body_text,
            received_at: self.message.received_at.unwrap_or_else(Utc::now),
            message_id: require(&mut errors, "message.message_id", &self.message.message_id),
            thread_id: require(&mut errors, "message.thread_id", &self.message.thread_id),
            sender: Some(contact.email.clone()),
        };

        let tenant_config = resolve_tenant_config(
            &tenant_id,
            self.tenant_config.unwrap_or_default(),
            defaults,
            &mut errors,
        );

        if !errors.is_empty() {
            return Err(PipelineError::Validation(errors));
        }

        Ok(WorkflowPayload::new(
            tenant_config,
            source,
            contact,
            message,
            non_blank(self.correlation_id),
        ))
    }
}

fn resolve_tenant_config(
    tenant_id: &str,
    input: TenantConfigInput,
    defaults: &TenantDefaults,
    errors: &mut Vec<FieldError>,
) -> TenantConfig {
    let mut config = defaults.resolve(tenant_id);

    if let Some(ref id) = input.tenant_id
        && id.trim() != tenant_id
    {
        errors.push(FieldError::new(
            "tenant_config.tenant_id",
            "must match tenant_id",
        ));
    }

    if let Some(enabled) = input.auto_send_enabled {
        config.auto_send_enabled = enabled;
    }
    if let Some(threshold) = input.escalation_threshold {
        match UnitScore::new(threshold) {
            Some(score) => config.escalation_threshold = score,
            None => errors.push(FieldError::new(
                "tenant_config.escalation_threshold",
                "must be between 0 and 1",
            )),
        }
    }
    if let Some(timezone) = input.timezone {
        if timezone.trim().is_empty() {
            errors.push(FieldError::new("tenant_config.timezone", "must not be empty"));
        } else {
            config.timezone = timezone.trim().to_string();
        }
    }
    if let Some(start) = input.working_hours_start {
        config.working_hours_start = start;
    }
    if let Some(end) = input.working_hours_end {
        config.working_hours_end = end;
    }
    if config.working_hours_start >= config.working_hours_end || config.working_hours_end > 24 {
        errors.push(FieldError::new(
            "tenant_config.working_hours",
            "start must be before end, and end at most 24",
        ));
    }
    if let Some(mut days) = input.working_days {
        if days.iter().any(|d| *d > 6) {
            errors.push(FieldError::new(
                "tenant_config.working_days",
                "days are 0 (Monday) to 6 (Sunday)",
            ));
        }
        days.sort_unstable();
        days.dedup();
        config.working_days = days;
    }
    if let Some(tone) = non_blank(input.tone) {
        config.tone = tone;
    }

    config
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn is_plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && !domain.is_empty() && !email.contains(char::is_whitespace)
        }
        None => false,
    }
}

/// Attach earlier thread messages. Failure leaves the payload unchanged.
pub async fn attach_thread_history(
    payload: WorkflowPayload,
    mailbox: &dyn MailboxTransport,
    timeout: Duration,
) -> Result<WorkflowPayload, PipelineError> {
    let thread_id = payload.source.thread_id.clone();
    match bounded(mailbox.name(), timeout, mailbox.fetch_thread(&thread_id)).await {
        Ok(mut history) => {
            history.retain(|m| m.message_id != payload.message.message_id);
            history.sort_by_key(|m| m.received_at);
            debug!(
                workflow_id = %payload.workflow_id,
                messages = history.len(),
                "Thread history attached"
            );
            payload.with_thread_history(history)
        }
        Err(e) => {
            warn!(
                workflow_id = %payload.workflow_id,
                thread_id = %thread_id,
                error = %e,
                "Thread history unavailable, continuing without it"
            );
            Ok(payload)
        }
    }
}
