//! Escalation run state.
//!
//! One run per (member, overdue obligation). The run owns its definition
//! snapshot, its position in it, and the append-only execution history.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::types::{Channel, DefinitionSnapshot, GroupId, MemberId};

/// Run lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Active,
    Paused,
    AwaitingApproval,
    Cancelled,
    Completed,
}

impl RunStatus {
    /// Terminal states permit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Immutable audit record, appended on every step transition. The history
/// is the source of truth for what actually happened, independent of any
/// later definition edits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub step_index: usize,
    pub fired_at: DateTime<Utc>,
    pub channels_used: BTreeSet<Channel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
}

/// One member's escalation run through a workflow definition snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EscalationRun {
    pub id: Uuid,
    pub group_id: GroupId,
    pub member_id: MemberId,
    /// Outstanding amount in minor units.
    pub amount_due: i64,
    pub start_date: DateTime<Utc>,
    /// Base for due-day arithmetic. Equal to `start_date` until the run is
    /// paused; every resume shifts it forward by the paused duration so the
    /// remaining schedule is neither skipped nor compressed.
    pub schedule_anchor: DateTime<Utc>,
    /// Index into the snapshot's steps. Always valid for the snapshot.
    pub current_step_index: usize,
    pub status: RunStatus,
    /// `schedule_anchor + cumulative_due_day(current_step_index)` — only
    /// recomputed on transition or resume.
    pub next_action_date: DateTime<Utc>,
    /// Set while paused; cleared on resume.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
    /// Status the run was in when paused (audit).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_from: Option<RunStatus>,
    /// Approvals recorded per step index (approver id).
    #[serde(default)]
    pub approvals: BTreeMap<usize, String>,
    /// Append-only execution log.
    #[serde(default)]
    pub history: Vec<StepExecution>,
    /// Definition version bound at run start (snapshot binding).
    pub snapshot: DefinitionSnapshot,
}

impl EscalationRun {
    /// Create a run bound to the given snapshot. Starts `Pending`; the
    /// engine activates it once the group's workflow is confirmed enabled.
    pub fn new(
        member_id: MemberId,
        amount_due: i64,
        start_date: DateTime<Utc>,
        snapshot: DefinitionSnapshot,
    ) -> Self {
        let next_action_date = start_date + Duration::days(snapshot.cumulative_due_day(0));
        Self {
            id: Uuid::now_v7(),
            group_id: snapshot.group_id.clone(),
            member_id,
            amount_due,
            start_date,
            schedule_anchor: start_date,
            current_step_index: 0,
            status: RunStatus::Pending,
            next_action_date,
            paused_at: None,
            paused_from: None,
            approvals: BTreeMap::new(),
            history: Vec::new(),
            snapshot,
        }
    }

    /// Recompute `next_action_date` from the anchor and current index.
    pub(crate) fn recompute_next_action(&mut self) {
        self.next_action_date = self.schedule_anchor
            + Duration::days(self.snapshot.cumulative_due_day(self.current_step_index));
    }

    /// Whole days since the run started (for display).
    pub fn days_overdue(&self, now: DateTime<Utc>) -> i64 {
        (now - self.start_date).num_days().max(0)
    }

    /// Label of the step the run is currently parked on.
    pub fn current_step_label(&self) -> &'static str {
        self.snapshot.steps[self.current_step_index].step_type.label()
    }
}

/// Derived display view for the API layer: run state plus the fields the
/// escalations screen shows directly.
#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    pub id: Uuid,
    pub group_id: GroupId,
    pub member_id: MemberId,
    pub amount_due: i64,
    pub status: RunStatus,
    pub current_step_index: usize,
    pub current_step_label: &'static str,
    pub days_overdue: i64,
    pub next_action_date: DateTime<Utc>,
    pub steps_total: usize,
    pub steps_fired: usize,
}

impl RunSummary {
    pub fn from_run(run: &EscalationRun, now: DateTime<Utc>) -> Self {
        Self {
            id: run.id,
            group_id: run.group_id.clone(),
            member_id: run.member_id.clone(),
            amount_due: run.amount_due,
            status: run.status,
            current_step_index: run.current_step_index,
            current_step_label: run.current_step_label(),
            days_overdue: run.days_overdue(now),
            next_action_date: run.next_action_date,
            steps_total: run.snapshot.steps.len(),
            steps_fired: run.history.len(),
        }
    }
}
