//! SMTP mailbox transport via lettre.
//!
//! Outbound only. Thread history is not available over SMTP, so
//! `fetch_thread` returns an empty thread.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use uuid::Uuid;

use super::{DeliveryResult, MailboxTransport, OutboundReply};
use crate::config::SmtpSettings;
use crate::error::CapabilityError;
use crate::workflow::types::NormalizedMessage;

/// Sends replies through an SMTP relay.
pub struct SmtpMailbox {
    settings: SmtpSettings,
    /// Socket timeout for the blocking send.
    timeout: Duration,
}

impl SmtpMailbox {
    /// `stage_timeout` is the deadline the caller waits for a send. The
    /// socket timeout is kept below it so a send the caller has abandoned
    /// stops soon after.
    pub fn new(settings: SmtpSettings, stage_timeout: Duration) -> Self {
        Self {
            settings,
            timeout: socket_timeout(stage_timeout),
        }
    }

    fn transport(&self) -> Result<SmtpTransport, CapabilityError> {
        let creds = Credentials::new(
            self.settings.username.clone(),
            self.settings.password.expose_secret().to_string(),
        );
        Ok(SmtpTransport::relay(&self.settings.host)
            .map_err(|e| Self::failed(format!("SMTP relay error: {e}")))?
            .port(self.settings.port)
            .credentials(creds)
            .timeout(Some(self.timeout))
            .build())
    }

    fn failed(reason: String) -> CapabilityError {
        CapabilityError::Unavailable {
            capability: "smtp".into(),
            reason,
        }
    }

    fn rejected(reason: String) -> CapabilityError {
        CapabilityError::Rejected {
            capability: "smtp".into(),
            reason,
        }
    }

    /// Build the outbound message. The returned id is also set as `Message-ID`.
    fn build_message(&self, reply: &OutboundReply) -> Result<(Message, String), CapabilityError> {
        let from: Mailbox = self
            .settings
            .from_address
            .parse()
            .map_err(|e| Self::rejected(format!("Invalid from address: {e}")))?;
        let to: Mailbox = reply
            .to
            .parse()
            .map_err(|e| Self::rejected(format!("Invalid to address: {e}")))?;

        let domain = self
            .settings
            .from_address
            .rsplit_once('@')
            .map(|(_, d)| d)
            .unwrap_or("localhost");
        let message_id = format!("<{}@{}>", Uuid::new_v4(), domain);

        let mut builder = Message::builder()
            .from(from)
            .to(to)
            .subject(reply.subject.clone())
            .message_id(Some(message_id.clone()));
        if let Some(ref parent) = reply.in_reply_to {
            builder = builder
                .in_reply_to(parent.clone())
                .references(parent.clone());
        }

        let email = builder
            .body(reply.body.clone())
            .map_err(|e| Self::rejected(format!("Failed to build email: {e}")))?;
        Ok((email, message_id))
    }
}

fn socket_timeout(stage_timeout: Duration) -> Duration {
    stage_timeout
        .mul_f32(0.8)
        .max(Duration::from_millis(100))
}

#[async_trait]
impl MailboxTransport for SmtpMailbox {
    fn name(&self) -> &str {
        "smtp"
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
        let (email, message_id) = self.build_message(reply)?;

        let transport = self.transport()?;

        // lettre's SmtpTransport is blocking.
        tokio::task::spawn_blocking(move || transport.send(&email))
            .await
            .map_err(|e| Self::failed(format!("SMTP send task panicked: {e}")))?
            .map_err(|e| Self::failed(format!("SMTP send failed: {e}")))?;

        tracing::info!(thread_id = %thread_id, to = %reply.to, "Email sent");
        Ok(DeliveryResult { message_id })
    }
}
