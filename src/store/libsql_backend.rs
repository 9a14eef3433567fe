//! libSQL backend for [`WorkflowStore`].
//!
//! The full payload is stored as a JSON snapshot. Status, tenant and a few
//! listing columns are denormalized next to it so that filters and the
//! optimistic status check run in SQL.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{WorkflowFilter, WorkflowStore, WorkflowSummary};
use crate::workflow::{Decision, IntentCategory, WorkflowPayload, WorkflowStatus};

/// libSQL workflow store.
///
/// Holds a single connection reused for all operations.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Workflow database opened");
        Ok(store)
    }

    /// In-memory database (tests, ephemeral runs).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Current stored status, used to explain a rejected write.
    async fn current_status(&self, id: Uuid) -> Result<Option<WorkflowStatus>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT status FROM workflows WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("current_status: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let status: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("current_status row: {e}")))?;
                Ok(Some(parse_status(&status)?))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("current_status: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into `DateTime<Utc>`.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_status(s: &str) -> Result<WorkflowStatus, DatabaseError> {
    s.parse()
        .map_err(|e: String| DatabaseError::Serialization(format!("status column: {e}")))
}

fn parse_decision(s: &str) -> Option<Decision> {
    match s {
        "auto_send" => Some(Decision::AutoSend),
        "draft_only" => Some(Decision::DraftOnly),
        "escalate" => Some(Decision::Escalate),
        _ => None,
    }
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn row_to_summary(row: &libsql::Row) -> Result<WorkflowSummary, String> {
    let id: String = row.get(0).map_err(|e| e.to_string())?;
    let tenant_id: String = row.get(1).map_err(|e| e.to_string())?;
    let status: String = row.get(2).map_err(|e| e.to_string())?;
    let intent: Option<String> = row.get(3).map_err(|e| e.to_string())?;
    let decision: Option<String> = row.get(4).map_err(|e| e.to_string())?;
    let subject: String = row.get(5).map_err(|e| e.to_string())?;
    let created_at: String = row.get(6).map_err(|e| e.to_string())?;
    let updated_at: String = row.get(7).map_err(|e| e.to_string())?;

    Ok(WorkflowSummary {
        workflow_id: Uuid::parse_str(&id).map_err(|e| format!("bad id '{id}': {e}"))?,
        tenant_id,
        status: status.parse()?,
        intent: intent.and_then(|s| s.parse::<IntentCategory>().ok()),
        decision: decision.as_deref().and_then(parse_decision),
        subject,
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
    })
}

const SUMMARY_COLUMNS: &str =
    "id, tenant_id, status, intent, decision, subject, created_at, updated_at";

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl WorkflowStore for LibSqlStore {
    async fn save(
        &self,
        snapshot: &WorkflowPayload,
        expected: Option<WorkflowStatus>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let json = serde_json::to_string(snapshot)
            .map_err(|e| DatabaseError::Serialization(format!("workflow snapshot: {e}")))?;
        let id = snapshot.workflow_id.to_string();
        let intent = snapshot.intent.as_ref().map(|i| i.category.as_str());
        let decision = snapshot.qa_decision.as_ref().map(|d| d.decision.as_str());

        let affected = match expected {
            None => conn
                .execute(
                    "INSERT INTO workflows (id, tenant_id, correlation_id, status, snapshot, created_at, updated_at, intent, decision, subject) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) ON CONFLICT(id) DO NOTHING",
                    params![
                        id.clone(),
                        snapshot.tenant_id.clone(),
                        snapshot.correlation_id.clone(),
                        snapshot.status.as_str(),
                        json,
                        snapshot.created_at.to_rfc3339(),
                        snapshot.updated_at.to_rfc3339(),
                        opt_text(intent),
                        opt_text(decision),
                        snapshot.message.subject.clone(),
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("insert_workflow: {e}")))?,
            Some(expected_status) => conn
                .execute(
                    "UPDATE workflows SET status = ?1, snapshot = ?2, updated_at = ?3, intent = ?4, decision = ?5 \
                     WHERE id = ?6 AND status = ?7",
                    params![
                        snapshot.status.as_str(),
                        json,
                        snapshot.updated_at.to_rfc3339(),
                        opt_text(intent),
                        opt_text(decision),
                        id.clone(),
                        expected_status.as_str(),
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("update_workflow: {e}")))?,
        };

        if affected == 0 {
            let found = self.current_status(snapshot.workflow_id).await?;
            return Err(DatabaseError::StaleWrite {
                id,
                expected,
                found,
            });
        }

        debug!(workflow_id = %snapshot.workflow_id, status = %snapshot.status, "Workflow snapshot saved");
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<WorkflowPayload>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT snapshot FROM workflows WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_workflow: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let json: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("load_workflow row: {e}")))?;
                let payload = serde_json::from_str(&json).map_err(|e| {
                    DatabaseError::Serialization(format!("workflow {id} snapshot: {e}"))
                })?;
                Ok(Some(payload))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("load_workflow: {e}"))),
        }
    }

    async fn list(&self, filter: &WorkflowFilter) -> Result<Vec<WorkflowSummary>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SUMMARY_COLUMNS} FROM workflows \
                     WHERE (?1 IS NULL OR tenant_id = ?1) AND (?2 IS NULL OR status = ?2) \
                     ORDER BY created_at DESC LIMIT ?3"
                ),
                params![
                    opt_text(filter.tenant_id.as_deref()),
                    opt_text(filter.status.map(|s| s.as_str())),
                    filter.effective_limit() as i64,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_workflows: {e}")))?;

        let mut summaries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_workflows row: {e}")))?
        {
            match row_to_summary(&row) {
                Ok(summary) => summaries.push(summary),
                Err(e) => tracing::warn!("Skipping workflow row: {e}"),
            }
        }
        Ok(summaries)
    }
}
