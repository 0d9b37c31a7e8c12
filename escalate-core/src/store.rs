//! Persistence seam.
//!
//! The engine operates exclusively through [`EscalationStore`], enabling
//! pluggable backends (MemoryStore here; a relational backend slots in
//! behind the same trait). Each call is treated as durable and atomic.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::run::{EscalationRun, RunStatus, StepExecution};
use crate::types::{GroupId, WorkflowDefinition};

#[async_trait]
pub trait EscalationStore: Send + Sync {
    // ── Definitions ──

    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<()>;
    async fn load_definition(&self, group_id: &str) -> Result<Option<WorkflowDefinition>>;
    async fn list_groups(&self) -> Result<Vec<GroupId>>;

    // ── Runs ──

    async fn save_run(&self, run: &EscalationRun) -> Result<()>;
    async fn load_run(&self, id: Uuid) -> Result<Option<EscalationRun>>;
    /// Non-terminal runs for a group.
    async fn load_active_runs(&self, group_id: &str) -> Result<Vec<EscalationRun>>;
    /// Ids of `Active` runs whose `next_action_date` has passed.
    async fn load_due_runs(&self, group_id: &str, now: DateTime<Utc>) -> Result<Vec<Uuid>>;
    /// Move a terminal run out of the active set. Archived, never deleted.
    async fn archive_run(&self, id: Uuid) -> Result<()>;

    // ── Execution log (append-only) ──

    async fn append_execution(&self, run_id: Uuid, record: &StepExecution) -> Result<()>;
    async fn read_executions(&self, run_id: Uuid) -> Result<Vec<StepExecution>>;
}

/// In-memory store. Good for tests and single-node deployments.
#[derive(Default)]
pub struct MemoryStore {
    definitions: RwLock<HashMap<GroupId, WorkflowDefinition>>,
    runs: RwLock<HashMap<Uuid, EscalationRun>>,
    archived: RwLock<HashMap<Uuid, EscalationRun>>,
    executions: RwLock<HashMap<Uuid, Vec<StepExecution>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EscalationStore for MemoryStore {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<()> {
        self.definitions
            .write()
            .await
            .insert(def.group_id.clone(), def.clone());
        Ok(())
    }

    async fn load_definition(&self, group_id: &str) -> Result<Option<WorkflowDefinition>> {
        Ok(self.definitions.read().await.get(group_id).cloned())
    }

    async fn list_groups(&self) -> Result<Vec<GroupId>> {
        let mut groups: Vec<GroupId> = self.definitions.read().await.keys().cloned().collect();
        groups.sort();
        Ok(groups)
    }

    async fn save_run(&self, run: &EscalationRun) -> Result<()> {
        self.runs.write().await.insert(run.id, run.clone());
        Ok(())
    }

    async fn load_run(&self, id: Uuid) -> Result<Option<EscalationRun>> {
        if let Some(run) = self.runs.read().await.get(&id) {
            return Ok(Some(run.clone()));
        }
        Ok(self.archived.read().await.get(&id).cloned())
    }

    async fn load_active_runs(&self, group_id: &str) -> Result<Vec<EscalationRun>> {
        let mut runs: Vec<EscalationRun> = self
            .runs
            .read()
            .await
            .values()
            .filter(|r| r.group_id == group_id && !r.status.is_terminal())
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.start_date);
        Ok(runs)
    }

    async fn load_due_runs(&self, group_id: &str, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut due: Vec<(DateTime<Utc>, Uuid)> = self
            .runs
            .read()
            .await
            .values()
            .filter(|r| {
                r.group_id == group_id
                    && r.status == RunStatus::Active
                    && r.next_action_date <= now
            })
            .map(|r| (r.next_action_date, r.id))
            .collect();
        due.sort();
        Ok(due.into_iter().map(|(_, id)| id).collect())
    }

    async fn archive_run(&self, id: Uuid) -> Result<()> {
        let removed = self.runs.write().await.remove(&id);
        if let Some(run) = removed {
            self.archived.write().await.insert(id, run);
        }
        Ok(())
    }

    async fn append_execution(&self, run_id: Uuid, record: &StepExecution) -> Result<()> {
        self.executions
            .write()
            .await
            .entry(run_id)
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn read_executions(&self, run_id: Uuid) -> Result<Vec<StepExecution>> {
        Ok(self
            .executions
            .read()
            .await
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }
}
