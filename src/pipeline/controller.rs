//! Orchestration controller.
//!
//! Runs one workflow through ingest → classify → dispatch → evaluate →
//! deliver, persisting the payload at every stage boundary with an
//! optimistic status check. Degradations are absorbed into the payload;
//! only validation, persistence, concurrency and cancellation abort a run.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::capabilities::{
    CalendarTransport, KnowledgeBase, MailboxTransport, OutboundReply, TextUnderstanding, bounded,
};
use crate::error::{CapabilityError, DatabaseError, PipelineError};
use crate::pipeline::classifier::IntentClassifier;
use crate::pipeline::rules::RulesEngine;
use crate::pipeline::workers::WorkerRegistry;
use crate::pipeline::{guardrail, ingest};
use crate::store::{WorkflowFilter, WorkflowStore, WorkflowSummary};
use crate::workflow::{
    Decision, DeliveryReport, EffectOutcome, ProposedEffect, WorkflowPayload, WorkflowStatus,
};

/// Collaborators the pipeline calls out to.
#[derive(Clone)]
pub struct Capabilities {
    pub text: Arc<dyn TextUnderstanding>,
    pub mailbox: Arc<dyn MailboxTransport>,
    pub calendar: Arc<dyn CalendarTransport>,
    pub knowledge: Arc<dyn KnowledgeBase>,
}

/// Controller tuning.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub stage_timeout: Duration,
    pub persist_attempts: u32,
    pub persist_backoff: Duration,
    pub known_senders: Vec<String>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            stage_timeout: Duration::from_secs(20),
            persist_attempts: 3,
            persist_backoff: Duration::from_millis(100),
            known_senders: Vec::new(),
        }
    }
}

/// Cooperative cancellation, checked before each stage.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Outcome of a run, as returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowResult {
    pub workflow_id: Uuid,
    pub decision: Decision,
    pub status: WorkflowStatus,
}

pub struct Orchestrator {
    store: Arc<dyn WorkflowStore>,
    classifier: IntentClassifier,
    workers: WorkerRegistry,
    mailbox: Arc<dyn MailboxTransport>,
    calendar: Arc<dyn CalendarTransport>,
    settings: ControllerSettings,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        capabilities: Capabilities,
        rules: RulesEngine,
        settings: ControllerSettings,
    ) -> Self {
        let classifier = IntentClassifier::new(
            capabilities.text.clone(),
            rules,
            settings.known_senders.clone(),
            settings.stage_timeout,
        );
        let workers = WorkerRegistry::new(
            capabilities.text,
            capabilities.calendar.clone(),
            capabilities.knowledge,
            settings.stage_timeout,
        );
        Self {
            store,
            classifier,
            workers,
            mailbox: capabilities.mailbox,
            calendar: capabilities.calendar,
            settings,
        }
    }

    /// Run a freshly ingested `Received` payload to a terminal status.
    pub async fn run(
        &self,
        payload: WorkflowPayload,
        cancel: &CancelToken,
    ) -> Result<WorkflowResult, PipelineError> {
        let started = Instant::now();
        let workflow_id = payload.workflow_id;
        let tenant_id = payload.tenant_id.clone();

        match self.run_stages(payload, cancel).await {
            Ok(payload) => {
                log_automation_event(&payload, started.elapsed());
                let decision = payload
                    .qa_decision
                    .as_ref()
                    .map(|d| d.decision)
                    .ok_or_else(|| {
                        PipelineError::InvariantBreach(format!(
                            "workflow {workflow_id} settled without a decision"
                        ))
                    })?;
                Ok(WorkflowResult {
                    workflow_id,
                    decision,
                    status: payload.status,
                })
            }
            Err(e) => {
                error!(
                    workflow_id = %workflow_id,
                    tenant_id = %tenant_id,
                    error = %e,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Workflow run aborted"
                );
                Err(e)
            }
        }
    }

    async fn run_stages(
        &self,
        payload: WorkflowPayload,
        cancel: &CancelToken,
    ) -> Result<WorkflowPayload, PipelineError> {
        let timeout = self.settings.stage_timeout;

        check_cancelled(cancel, "ingest")?;
        self.persist(&payload, None).await?;
        let payload =
            ingest::attach_thread_history(payload, self.mailbox.as_ref(), timeout).await?;
        let mut expected = payload.status;

        check_cancelled(cancel, "classify")?;
        let payload = self.classifier.classify_payload(payload).await?;
        self.persist(&payload, Some(expected)).await?;
        expected = payload.status;
        debug!(workflow_id = %payload.workflow_id, stage = "classify", "Stage complete");

        check_cancelled(cancel, "dispatch")?;
        let payload = self.workers.dispatch_payload(payload).await?;
        self.persist(&payload, Some(expected)).await?;
        expected = payload.status;
        debug!(workflow_id = %payload.workflow_id, stage = "dispatch", "Stage complete");

        check_cancelled(cancel, "evaluate")?;
        let payload = guardrail::evaluate_payload(payload)?;
        self.persist(&payload, Some(expected)).await?;
        expected = payload.status;
        debug!(workflow_id = %payload.workflow_id, stage = "evaluate", "Stage complete");

        let decision = payload.qa_decision.as_ref().map(|d| d.decision);
        let payload = if decision == Some(Decision::AutoSend) {
            check_cancelled(cancel, "deliver")?;
            let report = self.execute_effects(&payload).await;
            if !report.succeeded() {
                warn!(
                    workflow_id = %payload.workflow_id,
                    failures = report.failures().count(),
                    "Delivery failed after auto_send, surfacing for follow-up"
                );
            }
            payload.settle(Some(report))?
        } else {
            payload.settle(None)?
        };
        if let Err(e) = self.persist(&payload, Some(expected)).await {
            return Err(match &payload.delivery {
                Some(report) => unrecorded_delivery(&payload, report, e),
                None => e,
            });
        }
        Ok(payload)
    }

    /// Execute proposed effects in order. Stops at the first failure; later
    /// effects are recorded as skipped.
    async fn execute_effects(&self, payload: &WorkflowPayload) -> DeliveryReport {
        let timeout = self.settings.stage_timeout;
        let effects = payload
            .candidate_action
            .as_ref()
            .map(|c| c.proposed_effects.as_slice())
            .unwrap_or_default();

        let mut outcomes = Vec::with_capacity(effects.len());
        let mut failed = false;
        for effect in effects {
            if failed {
                outcomes.push(EffectOutcome::failed(
                    effect.label(),
                    "skipped after an earlier failure".into(),
                ));
                continue;
            }

            let result = match effect {
                ProposedEffect::SendReply {
                    thread_id,
                    to,
                    subject,
                    body,
                } => {
                    let reply = OutboundReply {
                        to: to.clone(),
                        subject: subject.clone(),
                        body: body.clone(),
                        in_reply_to: Some(payload.message.message_id.clone()),
                    };
                    bounded(
                        self.mailbox.name(),
                        timeout,
                        self.mailbox.send_reply(thread_id, &reply),
                    )
                    .await
                    .map(|r| r.message_id)
                }
                ProposedEffect::CreateEvent {
                    slot,
                    attendees,
                    title,
                } => bounded(
                    self.calendar.name(),
                    timeout,
                    self.calendar.create_event(slot, attendees, title),
                )
                .await
                .map(|r| r.event_id),
            };

            match result {
                Ok(external_id) => {
                    info!(
                        workflow_id = %payload.workflow_id,
                        effect = effect.label(),
                        external_id = %external_id,
                        "Side effect executed"
                    );
                    outcomes.push(EffectOutcome::executed(effect.label(), external_id));
                }
                Err(e @ CapabilityError::Timeout { .. }) => {
                    // The provider may still complete the call after we stop waiting.
                    warn!(
                        workflow_id = %payload.workflow_id,
                        effect = effect.label(),
                        error = %e,
                        "Side effect timed out, outcome unknown"
                    );
                    failed = true;
                    outcomes.push(EffectOutcome::unconfirmed(effect.label(), e.to_string()));
                }
                Err(e) => {
                    warn!(
                        workflow_id = %payload.workflow_id,
                        effect = effect.label(),
                        error = %e,
                        "Side effect failed"
                    );
                    failed = true;
                    outcomes.push(EffectOutcome::failed(effect.label(), e.to_string()));
                }
            }
        }

        DeliveryReport {
            attempted_at: Utc::now(),
            outcomes,
        }
    }

    /// Save with bounded retries on transient store errors.
    async fn persist(
        &self,
        payload: &WorkflowPayload,
        expected: Option<WorkflowStatus>,
    ) -> Result<(), PipelineError> {
        let max_attempts = self.settings.persist_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.save(payload, expected).await {
                Ok(()) => return Ok(()),
                Err(e @ DatabaseError::StaleWrite { .. }) => {
                    return Err(PipelineError::StaleWrite {
                        workflow_id: payload.workflow_id.to_string(),
                        reason: e.to_string(),
                    });
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    warn!(
                        workflow_id = %payload.workflow_id,
                        attempt,
                        error = %e,
                        "Workflow save failed, retrying"
                    );
                    tokio::time::sleep(self.settings.persist_backoff * attempt).await;
                }
                Err(e) => {
                    return Err(PipelineError::Persistence {
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    /// Load a workflow. Never mutates it.
    pub async fn get(&self, id: Uuid) -> Result<WorkflowPayload, PipelineError> {
        self.store
            .load(id)
            .await
            .map_err(|e| PipelineError::Persistence {
                attempts: 1,
                reason: e.to_string(),
            })?
            .ok_or_else(|| PipelineError::NotFound {
                workflow_id: id.to_string(),
            })
    }

    pub async fn list(&self, filter: &WorkflowFilter) -> Result<Vec<WorkflowSummary>, PipelineError> {
        self.store
            .list(filter)
            .await
            .map_err(|e| PipelineError::Persistence {
                attempts: 1,
                reason: e.to_string(),
            })
    }

    /// Close a workflow that has reached a terminal branch.
    pub async fn close(
        &self,
        id: Uuid,
        reason: Option<String>,
    ) -> Result<WorkflowPayload, PipelineError> {
        let payload = self.get(id).await?;
        let expected = payload.status;
        let closed = payload.close(reason)?;
        self.persist(&closed, Some(expected)).await?;
        info!(workflow_id = %id, from = %expected, "Workflow closed");
        Ok(closed)
    }
}

fn check_cancelled(cancel: &CancelToken, stage: &str) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        Err(PipelineError::Cancelled {
            stage: stage.to_string(),
        })
    } else {
        Ok(())
    }
}

/// Side effects ran but the settled record could not be saved. The stored
/// workflow stays `decided`, so the delivery report goes to the log and
/// into the returned error.
fn unrecorded_delivery(
    payload: &WorkflowPayload,
    report: &DeliveryReport,
    err: PipelineError,
) -> PipelineError {
    let executed: Vec<String> = report
        .outcomes
        .iter()
        .map(|o| match (&o.external_id, &o.error) {
            (Some(id), _) => format!("{} executed ({id})", o.effect),
            (None, Some(e)) => format!("{} not executed ({e})", o.effect),
            (None, None) => format!("{} not executed", o.effect),
        })
        .collect();
    let executed = executed.join("; ");

    error!(
        target: "automation_event",
        workflow_id = %payload.workflow_id,
        tenant_id = %payload.tenant_id,
        correlation_id = %payload.correlation_id,
        status = %payload.status,
        delivery = %serde_json::to_string(report).unwrap_or_default(),
        error = %err,
        "Side effects executed but settled workflow was not saved"
    );

    match err {
        PipelineError::Persistence { attempts, reason } => PipelineError::Persistence {
            attempts,
            reason: format!("{reason}; side effects already run: {executed}"),
        },
        other => other,
    }
}

/// One summary record per completed run.
fn log_automation_event(payload: &WorkflowPayload, elapsed: Duration) {
    let intent = payload.intent.as_ref();
    let candidate = payload.candidate_action.as_ref();
    let decision = payload.qa_decision.as_ref();
    let flags: Vec<String> = payload
        .upstream_flags()
        .iter()
        .map(|f| f.describe())
        .collect();

    info!(
        target: "automation_event",
        workflow_id = %payload.workflow_id,
        tenant_id = %payload.tenant_id,
        correlation_id = %payload.correlation_id,
        intent = intent.map(|i| i.category.as_str()).unwrap_or("none"),
        priority = intent.map(|i| i.priority.value()).unwrap_or_default(),
        degraded = intent.is_some_and(|i| i.degraded),
        worker = %candidate.map(|c| c.worker.to_string()).unwrap_or_default(),
        effects = candidate.map(|c| c.proposed_effects.len()).unwrap_or_default(),
        decision = decision.map(|d| d.decision.as_str()).unwrap_or("none"),
        risk_score = decision.map(|d| d.risk_score.value()).unwrap_or_default(),
        delivered = payload.delivery.as_ref().map(|r| r.succeeded()),
        flags = %flags.join("; "),
        status = %payload.status,
        elapsed_ms = elapsed.as_millis() as u64,
        "automation_event"
    );
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;

    use super::*;
    use crate::capabilities::local::{
        InMemoryKnowledgeBase, KeywordModel, LoggingMailbox, WorkingHoursCalendar,
    };
    use crate::capabilities::{DeliveryResult, DraftContext, GeneratedDraft};
    use crate::error::CapabilityError;
    use crate::pipeline::classifier::tests::FixedModel;
    use crate::store::MemoryStore;
    use crate::workflow::payload::tests::{received, tenant};
    use crate::workflow::{IntentCategory, NormalizedMessage, UpstreamFlag};

    struct FailingMailbox;

    #[async_trait]
    impl MailboxTransport for FailingMailbox {
        fn name(&self) -> &str {
            "failing-mailbox"
        }

        async fn fetch_thread(
            &self,
            _thread_id: &str,
        ) -> Result<Vec<NormalizedMessage>, CapabilityError> {
            Ok(Vec::new())
        }

        async fn send_reply(
            &self,
            _thread_id: &str,
            _reply: &OutboundReply,
        ) -> Result<DeliveryResult, CapabilityError> {
            Err(CapabilityError::Rejected {
                capability: "failing-mailbox".into(),
                reason: "550 mailbox unavailable".into(),
            })
        }
    }

    /// Completes each send only after `delay`, whether or not anyone waits.
    struct SlowMailbox {
        delay: Duration,
        sent: Arc<tokio::sync::Mutex<Vec<OutboundReply>>>,
    }

    #[async_trait]
    impl MailboxTransport for SlowMailbox {
        fn name(&self) -> &str {
            "slow-mailbox"
        }

        async fn fetch_thread(
            &self,
            _thread_id: &str,
        ) -> Result<Vec<NormalizedMessage>, CapabilityError> {
            Ok(Vec::new())
        }

        async fn send_reply(
            &self,
            _thread_id: &str,
            reply: &OutboundReply,
        ) -> Result<DeliveryResult, CapabilityError> {
            let sent = self.sent.clone();
            let reply = reply.clone();
            let delay = self.delay;
            let handle = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                sent.lock().await.push(reply);
            });
            handle.await.ok();
            Ok(DeliveryResult {
                message_id: "slow-1".into(),
            })
        }
    }

    /// Keyword classification with a fixed drafting confidence.
    struct ScoredDrafts(f32);

    #[async_trait]
    impl TextUnderstanding for ScoredDrafts {
        fn name(&self) -> &str {
            "scored-drafts"
        }

        async fn classify(
            &self,
            text: &str,
            context: crate::capabilities::ClassifyContext<'_>,
        ) -> Result<crate::capabilities::RawClassification, CapabilityError> {
            KeywordModel::new().classify(text, context).await
        }

        async fn generate_draft(
            &self,
            context: &DraftContext,
        ) -> Result<GeneratedDraft, CapabilityError> {
            let mut draft = KeywordModel::new().generate_draft(context).await?;
            draft.confidence = self.0;
            Ok(draft)
        }
    }

    /// Store that fails the first `n` saves with a transient error.
    struct FlakyStore {
        inner: MemoryStore,
        failures_left: AtomicU32,
        /// Every save of a snapshot in this status fails.
        fail_status: Option<WorkflowStatus>,
    }

    impl FlakyStore {
        fn failing_first(n: u32) -> Self {
            Self {
                inner: MemoryStore::new(),
                failures_left: AtomicU32::new(n),
                fail_status: None,
            }
        }

        fn failing_status(status: WorkflowStatus) -> Self {
            Self {
                inner: MemoryStore::new(),
                failures_left: AtomicU32::new(0),
                fail_status: Some(status),
            }
        }
    }

    #[async_trait]
    impl WorkflowStore for FlakyStore {
        async fn save(
            &self,
            snapshot: &WorkflowPayload,
            expected: Option<WorkflowStatus>,
        ) -> Result<(), DatabaseError> {
            if self.fail_status == Some(snapshot.status) {
                return Err(DatabaseError::Query("database is locked".into()));
            }
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(DatabaseError::Query("database is locked".into()));
            }
            self.inner.save(snapshot, expected).await
        }

        async fn load(&self, id: Uuid) -> Result<Option<WorkflowPayload>, DatabaseError> {
            self.inner.load(id).await
        }

        async fn list(
            &self,
            filter: &WorkflowFilter,
        ) -> Result<Vec<WorkflowSummary>, DatabaseError> {
            self.inner.list(filter).await
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        mailbox: Arc<LoggingMailbox>,
        calendar: Arc<WorkingHoursCalendar>,
    }

    fn harness_with(
        store: Arc<dyn WorkflowStore>,
        text: Arc<dyn TextUnderstanding>,
        mailbox: Option<Arc<dyn MailboxTransport>>,
    ) -> Harness {
        harness_with_timeout(store, text, mailbox, Duration::from_secs(2))
    }

    fn harness_with_timeout(
        store: Arc<dyn WorkflowStore>,
        text: Arc<dyn TextUnderstanding>,
        mailbox: Option<Arc<dyn MailboxTransport>>,
        stage_timeout: Duration,
    ) -> Harness {
        let logging = Arc::new(LoggingMailbox::new());
        let calendar = Arc::new(WorkingHoursCalendar::new());
        let capabilities = Capabilities {
            text,
            mailbox: mailbox.unwrap_or_else(|| logging.clone()),
            calendar: calendar.clone(),
            knowledge: Arc::new(InMemoryKnowledgeBase::with_default_articles()),
        };
        let settings = ControllerSettings {
            stage_timeout,
            persist_attempts: 3,
            persist_backoff: Duration::from_millis(1),
            known_senders: Vec::new(),
        };
        Harness {
            orchestrator: Orchestrator::new(
                store,
                capabilities,
                RulesEngine::default_rules(),
                settings,
            ),
            mailbox: logging,
            calendar,
        }
    }

    fn harness() -> Harness {
        harness_with(
            Arc::new(MemoryStore::new()),
            Arc::new(KeywordModel::new()),
            None,
        )
    }

    const SCHEDULING: &str = "Can we schedule a call next week?";

    #[tokio::test]
    async fn auto_send_path_ends_sent() {
        let h = harness();
        let payload = received(SCHEDULING, tenant(true, 0.9));
        let result = h.orchestrator.run(payload, &CancelToken::new()).await.unwrap();

        assert_eq!(result.decision, Decision::AutoSend);
        assert_eq!(result.status, WorkflowStatus::Sent);

        let sent = h.mailbox.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "thread-1");
        assert_eq!(sent[0].1.in_reply_to.as_deref(), Some("msg-1"));
        assert_eq!(h.calendar.booked().await.len(), 1);

        let stored = h.orchestrator.get(result.workflow_id).await.unwrap();
        assert_eq!(stored.status, WorkflowStatus::Sent);
        assert!(stored.delivery.as_ref().unwrap().succeeded());
        let statuses: Vec<WorkflowStatus> = stored.transitions.iter().map(|t| t.to).collect();
        assert_eq!(
            statuses,
            vec![
                WorkflowStatus::Classified,
                WorkflowStatus::ActionDrafted,
                WorkflowStatus::Decided,
                WorkflowStatus::Sent,
            ]
        );
    }

    #[tokio::test]
    async fn draft_only_path_awaits_review_without_side_effects() {
        let h = harness();
        let payload = received(SCHEDULING, tenant(false, 0.7));
        let result = h.orchestrator.run(payload, &CancelToken::new()).await.unwrap();

        assert_eq!(result.decision, Decision::DraftOnly);
        assert_eq!(result.status, WorkflowStatus::AwaitingReview);
        assert!(h.mailbox.sent().await.is_empty());
        assert!(h.calendar.booked().await.is_empty());

        let stored = h.orchestrator.get(result.workflow_id).await.unwrap();
        assert!(stored.delivery.is_none());
        assert!(stored.candidate_action.unwrap().draft.is_some());
    }

    #[tokio::test]
    async fn threshold_escalation_ignores_auto_send() {
        let h = harness_with(
            Arc::new(MemoryStore::new()),
            Arc::new(ScoredDrafts(0.0)),
            None,
        );
        // Low draft confidence pushes risk over a low threshold.
        let payload = received(SCHEDULING, tenant(true, 0.3));
        let result = h.orchestrator.run(payload, &CancelToken::new()).await.unwrap();

        assert_eq!(result.decision, Decision::Escalate);
        assert_eq!(result.status, WorkflowStatus::Escalated);
        assert!(h.mailbox.sent().await.is_empty());
    }

    #[tokio::test]
    async fn degraded_classification_still_decides() {
        let h = harness_with(
            Arc::new(MemoryStore::new()),
            Arc::new(FixedModel::failing()),
            None,
        );
        let payload = received(SCHEDULING, tenant(true, 0.9));
        let result = h.orchestrator.run(payload, &CancelToken::new()).await.unwrap();

        assert_eq!(result.decision, Decision::Escalate);
        assert_eq!(result.status, WorkflowStatus::Escalated);

        let stored = h.orchestrator.get(result.workflow_id).await.unwrap();
        let intent = stored.intent.unwrap();
        assert_eq!(intent.category, IntentCategory::Other);
        assert_eq!(intent.priority.value(), 0.0);
        assert!(matches!(
            stored.warnings.as_slice(),
            [UpstreamFlag::ClassificationDegraded { .. }]
        ));
    }

    #[tokio::test]
    async fn delivery_failure_keeps_decision() {
        let h = harness_with(
            Arc::new(MemoryStore::new()),
            Arc::new(KeywordModel::new()),
            Some(Arc::new(FailingMailbox)),
        );
        let payload = received(SCHEDULING, tenant(true, 0.9));
        let result = h.orchestrator.run(payload, &CancelToken::new()).await.unwrap();

        assert_eq!(result.decision, Decision::AutoSend);
        assert_eq!(result.status, WorkflowStatus::DeliveryFailed);
        // The event hold is skipped once the reply fails.
        assert!(h.calendar.booked().await.is_empty());

        let stored = h.orchestrator.get(result.workflow_id).await.unwrap();
        let report = stored.delivery.unwrap();
        assert_eq!(report.failures().count(), 2);
        assert!(report.outcomes[0].error.as_deref().unwrap().contains("550"));
        assert_eq!(stored.qa_decision.unwrap().decision, Decision::AutoSend);
    }

    #[tokio::test]
    async fn cancelled_run_stops_before_first_stage() {
        let store = Arc::new(MemoryStore::new());
        let h = harness_with(store.clone(), Arc::new(KeywordModel::new()), None);
        let cancel = CancelToken::new();
        cancel.cancel();

        let payload = received(SCHEDULING, tenant(true, 0.9));
        let id = payload.workflow_id;
        let err = h.orchestrator.run(payload, &cancel).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled { ref stage } if stage == "ingest"));
        assert!(store.load(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transient_store_errors_are_retried() {
        let store = Arc::new(FlakyStore::failing_first(2));
        let h = harness_with(store, Arc::new(KeywordModel::new()), None);
        let result = h
            .orchestrator
            .run(received(SCHEDULING, tenant(false, 0.7)), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, WorkflowStatus::AwaitingReview);
    }

    #[tokio::test]
    async fn persistent_store_failure_aborts_without_decision() {
        let store = Arc::new(FlakyStore::failing_first(10));
        let h = harness_with(store, Arc::new(KeywordModel::new()), None);
        let err = h
            .orchestrator
            .run(received(SCHEDULING, tenant(true, 0.9)), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Persistence { attempts: 3, .. }));
        assert!(h.mailbox.sent().await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_run_for_same_workflow_is_stale() {
        let store = Arc::new(MemoryStore::new());
        let h = harness_with(store.clone(), Arc::new(KeywordModel::new()), None);
        let payload = received(SCHEDULING, tenant(false, 0.7));
        store.save(&payload, None).await.unwrap();

        let err = h
            .orchestrator
            .run(payload, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::StaleWrite { .. }));
    }

    #[tokio::test]
    async fn persisted_record_round_trips_decision() {
        let h = harness();
        let result = h
            .orchestrator
            .run(
                received("How do I reset my password?", tenant(false, 0.7)),
                &CancelToken::new(),
            )
            .await
            .unwrap();
        let first = h.orchestrator.get(result.workflow_id).await.unwrap();
        let second = h.orchestrator.get(result.workflow_id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.qa_decision.unwrap().decision, result.decision);
        assert_eq!(
            first.candidate_action.unwrap().citations.first().map(String::as_str),
            Some("kb-password-reset")
        );
    }

    #[tokio::test]
    async fn close_requires_terminal_status() {
        let store = Arc::new(MemoryStore::new());
        let h = harness_with(store.clone(), Arc::new(KeywordModel::new()), None);

        let result = h
            .orchestrator
            .run(received(SCHEDULING, tenant(false, 0.7)), &CancelToken::new())
            .await
            .unwrap();
        let closed = h
            .orchestrator
            .close(result.workflow_id, Some("handled".into()))
            .await
            .unwrap();
        assert_eq!(closed.status, WorkflowStatus::Closed);

        let err = h.orchestrator.close(result.workflow_id, None).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { .. }));

        let pending = received("hi", tenant(false, 0.7));
        store.save(&pending, None).await.unwrap();
        let err = h.orchestrator.close(pending.workflow_id, None).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { .. }));

        let err = h.orchestrator.close(Uuid::new_v4(), None).await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn timed_out_send_is_recorded_as_unconfirmed() {
        let sent = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let mailbox = Arc::new(SlowMailbox {
            delay: Duration::from_millis(300),
            sent: sent.clone(),
        });
        let h = harness_with_timeout(
            Arc::new(MemoryStore::new()),
            Arc::new(KeywordModel::new()),
            Some(mailbox),
            Duration::from_millis(100),
        );
        let result = h
            .orchestrator
            .run(received(SCHEDULING, tenant(true, 0.9)), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, WorkflowStatus::DeliveryFailed);

        let stored = h.orchestrator.get(result.workflow_id).await.unwrap();
        let report = stored.delivery.unwrap();
        assert!(report.has_unconfirmed());
        assert!(report.outcomes[0].unconfirmed);
        assert!(report.outcomes[0].error.as_deref().unwrap().contains("outcome unknown"));
        assert!(!report.outcomes[1].unconfirmed);
        assert!(h.calendar.booked().await.is_empty());

        // The provider finishes the send after the deadline.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn failed_settle_write_reports_executed_effects() {
        let store = Arc::new(FlakyStore::failing_status(WorkflowStatus::Sent));
        let h = harness_with(store.clone(), Arc::new(KeywordModel::new()), None);
        let payload = received(SCHEDULING, tenant(true, 0.9));
        let id = payload.workflow_id;

        let err = h.orchestrator.run(payload, &CancelToken::new()).await.unwrap_err();
        match err {
            PipelineError::Persistence { attempts, reason } => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("send_reply executed (logged-"), "{reason}");
                assert!(reason.contains("create_event executed (evt-"), "{reason}");
            }
            other => panic!("Expected persistence error, got {other:?}"),
        }
        assert_eq!(h.mailbox.sent().await.len(), 1);
        let stored = store.load(id).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkflowStatus::Decided);
    }

    #[tokio::test]
    async fn list_returns_runs_newest_first() {
        let h = harness();
        let first = h
            .orchestrator
            .run(received(SCHEDULING, tenant(false, 0.7)), &CancelToken::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = h
            .orchestrator
            .run(received("Lovely weather", tenant(false, 0.7)), &CancelToken::new())
            .await
            .unwrap();

        let listed = h.orchestrator.list(&WorkflowFilter::default()).await.unwrap();
        let ids: Vec<Uuid> = listed.iter().map(|s| s.workflow_id).collect();
        assert_eq!(ids, vec![second.workflow_id, first.workflow_id]);
        assert_eq!(listed[0].decision, Some(Decision::Escalate));
    }
}
