//! Configuration types.
//!
//! Everything is resolved from environment variables once at startup.
//! Tenant policy is resolved per request into an immutable `TenantConfig`.

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::workflow::types::{TenantConfig, UnitScore};

/// Service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// HTTP port.
    pub port: u16,
    /// libSQL database path (`:memory:` for an ephemeral store).
    pub db_path: String,
    /// Bound on every external capability call.
    pub stage_timeout: Duration,
    /// Maximum attempts for one state-store write.
    pub persist_attempts: u32,
    /// Linear backoff step between write attempts.
    pub persist_backoff: Duration,
    /// Defaults for tenant policy fields a request omits.
    pub tenant_defaults: TenantDefaults,
    /// Text-understanding provider. `None` selects the offline keyword model.
    pub llm: Option<LlmSettings>,
    /// SMTP transport. `None` logs outbound replies instead of sending them.
    pub smtp: Option<SmtpSettings>,
    /// Senders treated as known contacts when computing priority.
    pub known_senders: Vec<String>,
    /// Senders that skip the pre-model rules and always reach the model.
    pub bypass_senders: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            db_path: "./data/ops-desk.db".to_string(),
            stage_timeout: Duration::from_secs(20),
            persist_attempts: 3,
            persist_backoff: Duration::from_millis(100),
            tenant_defaults: TenantDefaults::default(),
            llm: None,
            smtp: None,
            known_senders: Vec::new(),
            bypass_senders: Vec::new(),
        }
    }
}

impl ServiceConfig {
    /// Build config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let persist_attempts: u32 = parse_or(&lookup, "OPS_DESK_PERSIST_ATTEMPTS", defaults.persist_attempts)?;
        if persist_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "OPS_DESK_PERSIST_ATTEMPTS".into(),
                message: "must be at least 1".into(),
            });
        }

        let stage_timeout_secs: u64 = parse_or(
            &lookup,
            "OPS_DESK_STAGE_TIMEOUT_SECS",
            defaults.stage_timeout.as_secs(),
        )?;
        if stage_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "OPS_DESK_STAGE_TIMEOUT_SECS".into(),
                message: "must be at least 1".into(),
            });
        }

        Ok(Self {
            port: parse_or(&lookup, "OPS_DESK_PORT", defaults.port)?,
            db_path: lookup("OPS_DESK_DB_PATH").unwrap_or(defaults.db_path),
            stage_timeout: Duration::from_secs(stage_timeout_secs),
            persist_attempts,
            persist_backoff: Duration::from_millis(parse_or(
                &lookup,
                "OPS_DESK_PERSIST_BACKOFF_MS",
                defaults.persist_backoff.as_millis() as u64,
            )?),
            tenant_defaults: TenantDefaults::from_lookup(&lookup)?,
            llm: LlmSettings::from_lookup(&lookup)?,
            smtp: SmtpSettings::from_lookup(&lookup)?,
            known_senders: split_list(lookup("OPS_DESK_KNOWN_SENDERS")),
            bypass_senders: split_list(lookup("OPS_DESK_BYPASS_SENDERS")),
        })
    }
}

/// Defaults applied to tenant policy fields a request leaves out.
#[derive(Debug, Clone, PartialEq)]
pub struct TenantDefaults {
    pub timezone: String,
    pub working_hours_start: u8,
    pub working_hours_end: u8,
    pub working_days: Vec<u8>,
    pub tone: String,
    pub auto_send_enabled: bool,
    pub escalation_threshold: UnitScore,
}

impl Default for TenantDefaults {
    fn default() -> Self {
        Self {
            timezone: "Europe/London".to_string(),
            working_hours_start: 9,
            working_hours_end: 17,
            working_days: vec![0, 1, 2, 3, 4],
            tone: "professional".to_string(),
            auto_send_enabled: false,
            escalation_threshold: UnitScore::clamped(0.7),
        }
    }
}

impl TenantDefaults {
    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let threshold: f32 = parse_or(
            lookup,
            "OPS_DESK_DEFAULT_ESCALATION_THRESHOLD",
            defaults.escalation_threshold.value(),
        )?;
        let escalation_threshold =
            UnitScore::new(threshold).ok_or_else(|| ConfigError::InvalidValue {
                key: "OPS_DESK_DEFAULT_ESCALATION_THRESHOLD".into(),
                message: format!("{threshold} is outside [0, 1]"),
            })?;

        let working_hours_start: u8 =
            parse_or(lookup, "OPS_DESK_DEFAULT_WORK_START", defaults.working_hours_start)?;
        let working_hours_end: u8 =
            parse_or(lookup, "OPS_DESK_DEFAULT_WORK_END", defaults.working_hours_end)?;
        if working_hours_start >= working_hours_end || working_hours_end > 24 {
            return Err(ConfigError::InvalidValue {
                key: "OPS_DESK_DEFAULT_WORK_START".into(),
                message: format!(
                    "working hours {working_hours_start}..{working_hours_end}: start must be before end, and end at most 24"
                ),
            });
        }

        let working_days = match lookup("OPS_DESK_DEFAULT_WORK_DAYS") {
            None => defaults.working_days,
            Some(raw) => parse_working_days(&raw)?,
        };

        Ok(Self {
            timezone: lookup("OPS_DESK_DEFAULT_TIMEZONE").unwrap_or(defaults.timezone),
            working_hours_start,
            working_hours_end,
            working_days,
            tone: lookup("OPS_DESK_DEFAULT_TONE").unwrap_or(defaults.tone),
            auto_send_enabled: parse_or(lookup, "OPS_DESK_DEFAULT_AUTO_SEND", defaults.auto_send_enabled)?,
            escalation_threshold,
        })
    }

    /// A complete policy for `tenant_id` built purely from defaults.
    pub fn resolve(&self, tenant_id: &str) -> TenantConfig {
        TenantConfig {
            tenant_id: tenant_id.to_string(),
            auto_send_enabled: self.auto_send_enabled,
            escalation_threshold: self.escalation_threshold,
            timezone: self.timezone.clone(),
            working_hours_start: self.working_hours_start,
            working_hours_end: self.working_hours_end,
            working_days: self.working_days.clone(),
            tone: self.tone.clone(),
        }
    }
}

/// Supported text-understanding backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
}

impl FromStr for LlmBackend {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "anthropic" => Ok(Self::Anthropic),
            "openai" => Ok(Self::OpenAi),
            other => Err(format!("unknown backend '{other}'")),
        }
    }
}

/// Settings for the model-backed text-understanding capability.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub backend: LlmBackend,
    pub api_key: SecretString,
    pub model: String,
}

impl LlmSettings {
    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Option<Self>, ConfigError> {
        let Some(backend) = lookup("OPS_DESK_LLM_BACKEND") else {
            return Ok(None);
        };
        let backend: LlmBackend =
            backend
                .parse()
                .map_err(|message| ConfigError::InvalidValue {
                    key: "OPS_DESK_LLM_BACKEND".into(),
                    message,
                })?;

        let (key_var, default_model) = match backend {
            LlmBackend::Anthropic => ("ANTHROPIC_API_KEY", "claude-sonnet-4-20250514"),
            LlmBackend::OpenAi => ("OPENAI_API_KEY", "gpt-4o"),
        };
        let api_key = lookup(key_var).ok_or_else(|| ConfigError::MissingEnvVar(key_var.into()))?;

        Ok(Some(Self {
            backend,
            api_key: SecretString::from(api_key),
            model: lookup("OPS_DESK_MODEL").unwrap_or_else(|| default_model.to_string()),
        }))
    }
}

/// SMTP settings for outbound replies.
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl SmtpSettings {
    /// Returns `None` if `SMTP_HOST` is not set.
    fn from_lookup(lookup: &impl Fn(&str) -> Option<String>) -> Result<Option<Self>, ConfigError> {
        let Some(host) = lookup("SMTP_HOST") else {
            return Ok(None);
        };
        let username = lookup("SMTP_USERNAME").unwrap_or_default();
        Ok(Some(Self {
            host,
            port: parse_or(lookup, "SMTP_PORT", 587)?,
            from_address: lookup("SMTP_FROM_ADDRESS").unwrap_or_else(|| username.clone()),
            username,
            password: SecretString::from(lookup("SMTP_PASSWORD").unwrap_or_default()),
        }))
    }
}

/// Comma-separated list, blanks dropped.
fn split_list(raw: Option<String>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

/// Days are 0 (Monday) to 6 (Sunday); at least one is required.
fn parse_working_days(raw: &str) -> Result<Vec<u8>, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidValue {
        key: "OPS_DESK_DEFAULT_WORK_DAYS".into(),
        message,
    };

    let mut days = Vec::new();
    for part in split_list(Some(raw.to_string())) {
        let day: u8 = part
            .parse()
            .map_err(|e| invalid(format!("'{part}': {e}")))?;
        if day > 6 {
            return Err(invalid(format!("{day} is not a day (0 = Monday, 6 = Sunday)")));
        }
        days.push(day);
    }
    if days.is_empty() {
        return Err(invalid("at least one working day is required".into()));
    }
    days.sort_unstable();
    days.dedup();
    Ok(days)
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = ServiceConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.port, 8000);
        assert_eq!(config.persist_attempts, 3);
        assert_eq!(config.stage_timeout, Duration::from_secs(20));
        assert!(config.llm.is_none());
        assert!(config.smtp.is_none());
        assert_eq!(config.tenant_defaults, TenantDefaults::default());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = ServiceConfig::from_lookup(lookup(&[
            ("OPS_DESK_PORT", "9100"),
            ("OPS_DESK_STAGE_TIMEOUT_SECS", "5"),
            ("OPS_DESK_DEFAULT_AUTO_SEND", "true"),
            ("OPS_DESK_DEFAULT_ESCALATION_THRESHOLD", "0.5"),
            ("OPS_DESK_KNOWN_SENDERS", "a@x.com, b@x.com,"),
        ]))
        .unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.stage_timeout, Duration::from_secs(5));
        assert!(config.tenant_defaults.auto_send_enabled);
        assert_eq!(config.tenant_defaults.escalation_threshold.value(), 0.5);
        assert_eq!(config.known_senders, vec!["a@x.com", "b@x.com"]);
    }

    #[test]
    fn invalid_numbers_are_reported_with_key() {
        let err = ServiceConfig::from_lookup(lookup(&[("OPS_DESK_PORT", "eighty")])).unwrap_err();
        assert!(err.to_string().contains("OPS_DESK_PORT"));
    }

    #[test]
    fn threshold_outside_unit_range_is_rejected() {
        let err = ServiceConfig::from_lookup(lookup(&[(
            "OPS_DESK_DEFAULT_ESCALATION_THRESHOLD",
            "1.5",
        )]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn zero_persist_attempts_is_rejected() {
        assert!(ServiceConfig::from_lookup(lookup(&[("OPS_DESK_PERSIST_ATTEMPTS", "0")])).is_err());
    }

    #[test]
    fn llm_backend_requires_key() {
        let err =
            ServiceConfig::from_lookup(lookup(&[("OPS_DESK_LLM_BACKEND", "anthropic")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "ANTHROPIC_API_KEY"));

        let config = ServiceConfig::from_lookup(lookup(&[
            ("OPS_DESK_LLM_BACKEND", "openai"),
            ("OPENAI_API_KEY", "sk-test"),
        ]))
        .unwrap();
        let llm = config.llm.unwrap();
        assert_eq!(llm.backend, LlmBackend::OpenAi);
        assert_eq!(llm.model, "gpt-4o");
        assert_eq!(llm.api_key.expose_secret(), "sk-test");
    }

    #[test]
    fn smtp_from_address_defaults_to_username() {
        let config = ServiceConfig::from_lookup(lookup(&[
            ("SMTP_HOST", "smtp.example.com"),
            ("SMTP_USERNAME", "desk@example.com"),
        ]))
        .unwrap();
        let smtp = config.smtp.unwrap();
        assert_eq!(smtp.port, 587);
        assert_eq!(smtp.from_address, "desk@example.com");
    }

    #[test]
    fn zero_stage_timeout_is_rejected() {
        let err = ServiceConfig::from_lookup(lookup(&[("OPS_DESK_STAGE_TIMEOUT_SECS", "0")]))
            .unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "OPS_DESK_STAGE_TIMEOUT_SECS")
        );
    }

    #[test]
    fn inverted_or_overlong_working_hours_are_rejected() {
        for (start, end) in [("17", "9"), ("9", "9"), ("9", "25")] {
            let err = ServiceConfig::from_lookup(lookup(&[
                ("OPS_DESK_DEFAULT_WORK_START", start),
                ("OPS_DESK_DEFAULT_WORK_END", end),
            ]))
            .unwrap_err();
            assert!(matches!(err, ConfigError::InvalidValue { .. }), "{start}..{end}");
        }

        let config = ServiceConfig::from_lookup(lookup(&[
            ("OPS_DESK_DEFAULT_WORK_START", "0"),
            ("OPS_DESK_DEFAULT_WORK_END", "24"),
        ]))
        .unwrap();
        assert_eq!(config.tenant_defaults.working_hours_end, 24);
    }

    #[test]
    fn working_days_are_validated() {
        let config =
            ServiceConfig::from_lookup(lookup(&[("OPS_DESK_DEFAULT_WORK_DAYS", "4, 0,2,2")])).unwrap();
        assert_eq!(config.tenant_defaults.working_days, vec![0, 2, 4]);

        for raw in ["7", "1,9", "", " , ", "mon"] {
            let err = ServiceConfig::from_lookup(lookup(&[("OPS_DESK_DEFAULT_WORK_DAYS", raw)]))
                .unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "OPS_DESK_DEFAULT_WORK_DAYS"),
                "{raw:?}"
            );
        }
    }

    #[test]
    fn bypass_senders_are_listed() {
        let config = ServiceConfig::from_lookup(lookup(&[(
            "OPS_DESK_BYPASS_SENDERS",
            "noreply@vip.com, alerts@partner.io",
        )]))
        .unwrap();
        assert_eq!(config.bypass_senders, vec!["noreply@vip.com", "alerts@partner.io"]);
        assert!(ServiceConfig::default().bypass_senders.is_empty());
    }

    #[test]
    fn resolve_fills_every_field() {
        let tenant = TenantDefaults::default().resolve("acme");
        assert_eq!(tenant.tenant_id, "acme");
        assert!(!tenant.auto_send_enabled);
        assert_eq!(tenant.escalation_threshold.value(), 0.7);
        assert_eq!(tenant.working_days, vec![0, 1, 2, 3, 4]);
    }
}
