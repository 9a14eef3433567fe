//! In-memory [`WorkflowStore`], for tests and ephemeral runs.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::traits::{WorkflowFilter, WorkflowStore, WorkflowSummary};
use crate::workflow::{WorkflowPayload, WorkflowStatus};

#[derive(Debug, Default)]
pub struct MemoryStore {
    workflows: RwLock<HashMap<Uuid, WorkflowPayload>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn save(
        &self,
        snapshot: &WorkflowPayload,
        expected: Option<WorkflowStatus>,
    ) -> Result<(), DatabaseError> {
        let mut workflows = self.workflows.write().await;
        let found = workflows.get(&snapshot.workflow_id).map(|w| w.status);
        if found != expected {
            return Err(DatabaseError::StaleWrite {
                id: snapshot.workflow_id.to_string(),
                expected,
                found,
            });
        }
        workflows.insert(snapshot.workflow_id, snapshot.clone());
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<WorkflowPayload>, DatabaseError> {
        Ok(self.workflows.read().await.get(&id).cloned())
    }

    async fn list(&self, filter: &WorkflowFilter) -> Result<Vec<WorkflowSummary>, DatabaseError> {
        let workflows = self.workflows.read().await;
        let mut matching: Vec<&WorkflowPayload> = workflows
            .values()
            .filter(|w| {
                filter.tenant_id.as_ref().is_none_or(|t| &w.tenant_id == t)
                    && filter.status.is_none_or(|s| w.status == s)
            })
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching
            .into_iter()
            .take(filter.effective_limit())
            .map(WorkflowSummary::from)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::payload::tests::{received, tenant};

    #[tokio::test]
    async fn optimistic_check_matches_libsql_semantics() {
        let store = MemoryStore::new();
        let payload = received("hi", tenant(false, 0.7));

        store.save(&payload, None).await.unwrap();
        assert!(store.save(&payload, None).await.is_err());
        store
            .save(&payload, Some(WorkflowStatus::Received))
            .await
            .unwrap();
        let err = store
            .save(&payload, Some(WorkflowStatus::Classified))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DatabaseError::StaleWrite {
                found: Some(WorkflowStatus::Received),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn list_respects_tenant_and_limit() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            store
                .save(&received("hi", tenant(false, 0.7)), None)
                .await
                .unwrap();
        }
        let page = store
            .list(&WorkflowFilter {
                tenant_id: Some("acme".into()),
                limit: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert!(page[0].created_at >= page[1].created_at);
    }
}
