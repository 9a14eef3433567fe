use std::sync::Arc;

use anyhow::Context;

use ops_desk::api::{AppState, workflow_routes};
use ops_desk::capabilities::llm::create_text_model;
use ops_desk::capabilities::local::{
    InMemoryKnowledgeBase, KeywordModel, LoggingMailbox, WorkingHoursCalendar,
};
use ops_desk::capabilities::smtp::SmtpMailbox;
use ops_desk::capabilities::{MailboxTransport, TextUnderstanding};
use ops_desk::config::ServiceConfig;
use ops_desk::pipeline::controller::{
    CancelToken, Capabilities, ControllerSettings, Orchestrator,
};
use ops_desk::pipeline::rules::RulesEngine;
use ops_desk::store::{LibSqlStore, WorkflowStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = ServiceConfig::from_env().context("Invalid configuration")?;

    eprintln!("📬 Ops Desk v{}", env!("CARGO_PKG_VERSION"));

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn WorkflowStore> = if config.db_path == ":memory:" {
        Arc::new(LibSqlStore::new_memory().await?)
    } else {
        if let Some(parent) = std::path::Path::new(&config.db_path).parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        Arc::new(
            LibSqlStore::new_local(std::path::Path::new(&config.db_path))
                .await
                .with_context(|| format!("Failed to open database at {}", config.db_path))?,
        )
    };
    eprintln!("   Database: {}", config.db_path);

    // ── Capabilities ─────────────────────────────────────────────────────
    let text: Arc<dyn TextUnderstanding> = match &config.llm {
        Some(settings) => create_text_model(settings)?,
        None => Arc::new(KeywordModel::new()),
    };
    eprintln!("   Text model: {}", text.name());

    let mailbox: Arc<dyn MailboxTransport> = match &config.smtp {
        Some(settings) => Arc::new(SmtpMailbox::new(
            settings.clone(),
            config.stage_timeout,
        )),
        None => Arc::new(LoggingMailbox::new()),
    };
    eprintln!("   Mailbox: {}", mailbox.name());

    let capabilities = Capabilities {
        text,
        mailbox,
        calendar: Arc::new(WorkingHoursCalendar::new()),
        knowledge: Arc::new(InMemoryKnowledgeBase::with_default_articles()),
    };

    let settings = ControllerSettings {
        stage_timeout: config.stage_timeout,
        persist_attempts: config.persist_attempts,
        persist_backoff: config.persist_backoff,
        known_senders: config.known_senders.clone(),
    };
    let rules = RulesEngine::default_rules()
        .with_bypass_senders(config.bypass_senders.as_slice())
        .context("Invalid OPS_DESK_BYPASS_SENDERS entry")?;
    let orchestrator = Arc::new(Orchestrator::new(store, capabilities, rules, settings));

    // ── HTTP ─────────────────────────────────────────────────────────────
    let cancel = CancelToken::new();
    let app = workflow_routes(AppState {
        orchestrator,
        tenant_defaults: Arc::new(config.tenant_defaults.clone()),
        cancel: cancel.clone(),
    });

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    eprintln!("   API: http://0.0.0.0:{}/workflows", config.port);
    tracing::info!(port = config.port, "Ops desk started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown requested, cancelling in-flight workflows");
            cancel.cancel();
        })
        .await?;

    Ok(())
}
