//! Escalation engine.
//!
//! The single authoritative owner of run state. All commands for a given
//! run serialize through a per-run mutex; runs never share mutable state,
//! so distinct runs advance concurrently without ordering constraints.
//! Intent handoff is non-blocking and happens outside any store write:
//! the engine's contract is "decided and logged", not "delivered".

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::EscalationError;
use crate::intent::{EscalationIntent, NotificationDispatcher};
use crate::machine::{self, Advance};
use crate::run::{EscalationRun, RunSummary, StepExecution};
use crate::simulator::{self, SeededResponseModel, SimulationResult};
use crate::store::EscalationStore;
use crate::types::{format_version, MemberId, WorkflowDefinition};
use crate::validate::validate_definition;

pub struct EscalationEngine {
    store: Arc<dyn EscalationStore>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    clock: Arc<dyn Clock>,
    /// Per-run single-writer locks, created lazily, dropped on archive.
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl EscalationEngine {
    pub fn new(
        store: Arc<dyn EscalationStore>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            clock,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn EscalationStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // ── Definitions ──

    /// Validate and persist a definition. Rejected definitions are never
    /// partially applied; existing runs keep their bound snapshots.
    pub async fn put_definition(
        &self,
        def: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, EscalationError> {
        let errors = validate_definition(&def);
        if !errors.is_empty() {
            return Err(EscalationError::Validation(errors));
        }

        let version = def.version();
        self.store.save_definition(&def).await?;
        info!(
            group_id = %def.group_id,
            steps = def.steps.len(),
            enabled = def.enabled,
            version = %format_version(&version),
            "Workflow definition saved"
        );

        // In-flight runs continue on their snapshots; just note the drift.
        for run in self.store.load_active_runs(&def.group_id).await? {
            if run.snapshot.version != version {
                let drift = EscalationError::StaleDefinition {
                    bound: format_version(&run.snapshot.version),
                    current: format_version(&version),
                };
                debug!(run_id = %run.id, "{drift}");
            }
        }

        Ok(def)
    }

    pub async fn get_definition(
        &self,
        group_id: &str,
    ) -> Result<WorkflowDefinition, EscalationError> {
        self.store
            .load_definition(group_id)
            .await?
            .ok_or_else(|| EscalationError::UnknownWorkflow(group_id.to_string()))
    }

    // ── Run lifecycle ──

    /// Create and activate a run for an overdue member.
    pub async fn start_run(
        &self,
        group_id: &str,
        member_id: MemberId,
        amount_due: i64,
    ) -> Result<EscalationRun, EscalationError> {
        let def = self.get_definition(group_id).await?;
        if !def.enabled {
            return Err(EscalationError::WorkflowDisabled(group_id.to_string()));
        }

        let mut run = EscalationRun::new(member_id, amount_due, self.clock.now(), def.snapshot());
        machine::activate(&mut run)?;
        self.store.save_run(&run).await?;
        info!(
            run_id = %run.id,
            group_id = %run.group_id,
            member_id = %run.member_id,
            next_action = %run.next_action_date,
            "Escalation run started"
        );
        Ok(run)
    }

    /// Advance a run through every step that is currently due.
    ///
    /// One state-machine step per iteration; looping here (rather than in
    /// the machine) is what makes post-downtime catch-up fire and audit
    /// every missed step instead of skipping to the latest one.
    pub async fn advance_due(&self, run_id: Uuid) -> Result<usize, EscalationError> {
        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;

        let mut run = self.load(run_id).await?;
        let now = self.clock.now();
        let mut fired = 0usize;

        loop {
            match machine::advance(&mut run, now) {
                Advance::Fired {
                    execution,
                    intent,
                    completed,
                } => {
                    fired += 1;
                    self.commit_execution(&run, &execution, intent).await?;
                    if completed {
                        info!(run_id = %run.id, "Escalation run completed");
                        self.finish(run).await?;
                        return Ok(fired);
                    }
                }
                Advance::ApprovalRequested(intent) => {
                    info!(
                        run_id = %run.id,
                        step_index = intent.step_index(),
                        "Run awaiting approval"
                    );
                    self.store.save_run(&run).await?;
                    self.hand_off(intent);
                    return Ok(fired);
                }
                Advance::NotDue | Advance::Skipped => {
                    if fired > 0 {
                        self.store.save_run(&run).await?;
                    }
                    return Ok(fired);
                }
            }
        }
    }

    // ── Operator commands ──

    pub async fn pause(&self, run_id: Uuid) -> Result<EscalationRun, EscalationError> {
        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;

        let mut run = self.load(run_id).await?;
        machine::pause(&mut run, self.clock.now())?;
        self.store.save_run(&run).await?;
        info!(run_id = %run.id, "Escalation run paused");
        Ok(run)
    }

    pub async fn resume(&self, run_id: Uuid) -> Result<EscalationRun, EscalationError> {
        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;

        let mut run = self.load(run_id).await?;
        machine::resume(&mut run, self.clock.now())?;
        self.store.save_run(&run).await?;
        info!(run_id = %run.id, next_action = %run.next_action_date, "Escalation run resumed");
        Ok(run)
    }

    pub async fn cancel(&self, run_id: Uuid) -> Result<EscalationRun, EscalationError> {
        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;

        let mut run = self.load(run_id).await?;
        machine::cancel(&mut run)?;
        info!(run_id = %run.id, "Escalation run cancelled");
        self.finish(run.clone()).await?;
        Ok(run)
    }

    /// External "member paid in full" event. Completes the run.
    pub async fn mark_resolved(&self, run_id: Uuid) -> Result<EscalationRun, EscalationError> {
        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;

        let mut run = self.load(run_id).await?;
        machine::mark_resolved(&mut run, self.clock.now())?;
        if let Some(record) = run.history.last().cloned() {
            self.store.append_execution(run.id, &record).await?;
        }
        info!(run_id = %run.id, "Escalation run resolved (member paid)");
        self.finish(run.clone()).await?;
        Ok(run)
    }

    /// Approve the gated step; it fires immediately if still due.
    pub async fn approve(
        &self,
        run_id: Uuid,
        approver: &str,
    ) -> Result<EscalationRun, EscalationError> {
        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;

        let mut run = self.load(run_id).await?;
        let outcome = machine::approve(&mut run, approver, self.clock.now())?;

        match outcome {
            Advance::Fired {
                execution,
                intent,
                completed,
            } => {
                self.commit_execution(&run, &execution, intent).await?;
                info!(
                    run_id = %run.id,
                    step_index = execution.step_index,
                    approver,
                    "Approved step fired"
                );
                if completed {
                    self.finish(run.clone()).await?;
                } else {
                    self.store.save_run(&run).await?;
                }
            }
            // Approval recorded but the step is somehow no longer due
            // (clock moved backwards under test control); persist as-is.
            _ => self.store.save_run(&run).await?,
        }
        Ok(run)
    }

    // ── Queries ──

    pub async fn get_run(&self, run_id: Uuid) -> Result<EscalationRun, EscalationError> {
        self.load(run_id).await
    }

    pub async fn active_runs(&self, group_id: &str) -> Result<Vec<RunSummary>, EscalationError> {
        let now = self.clock.now();
        let runs = self.store.load_active_runs(group_id).await?;
        Ok(runs.iter().map(|r| RunSummary::from_run(r, now)).collect())
    }

    /// Dry-run preview: no intents, no persisted state.
    pub async fn simulate(
        &self,
        group_id: &str,
        member_name: &str,
        amount_due: i64,
        seed: u64,
    ) -> Result<SimulationResult, EscalationError> {
        let def = self.get_definition(group_id).await?;
        let mut model = SeededResponseModel::new(seed);
        Ok(simulator::simulate(
            &def.snapshot(),
            member_name,
            amount_due,
            self.clock.now(),
            &mut model,
        ))
    }

    // ── Internals ──

    async fn load(&self, run_id: Uuid) -> Result<EscalationRun, EscalationError> {
        self.store
            .load_run(run_id)
            .await?
            .ok_or(EscalationError::UnknownRun(run_id))
    }

    /// Append the audit record, then hand the intent off. The record is
    /// committed even when handoff fails — redelivery is the dispatcher's
    /// job, not the engine's.
    async fn commit_execution(
        &self,
        run: &EscalationRun,
        execution: &StepExecution,
        intent: Option<EscalationIntent>,
    ) -> Result<(), EscalationError> {
        self.store.append_execution(run.id, execution).await?;
        self.store.save_run(run).await?;
        if let Some(intent) = intent {
            self.hand_off(intent);
        }
        Ok(())
    }

    fn hand_off(&self, intent: EscalationIntent) {
        if let Err(e) = self.dispatcher.submit(intent) {
            warn!(error = %e, "Intent handoff failed; execution already recorded");
        }
    }

    /// Persist a terminal run and move it to the archive.
    async fn finish(&self, run: EscalationRun) -> Result<(), EscalationError> {
        self.store.save_run(&run).await?;
        self.store.archive_run(run.id).await?;
        self.locks.lock().unwrap().remove(&run.id);
        Ok(())
    }

    fn run_lock(&self, run_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry(run_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::intent::{FailingDispatcher, RecordingDispatcher};
    use crate::run::RunStatus;
    use crate::store::MemoryStore;
    use crate::types::{Channel, StepType, WorkflowStep};
    use chrono::{Duration, TimeZone, Utc};

    struct Harness {
        engine: EscalationEngine,
        clock: Arc<ManualClock>,
        dispatcher: Arc<RecordingDispatcher>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap(),
        ));
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let engine = EscalationEngine::new(
            Arc::new(MemoryStore::new()),
            dispatcher.clone(),
            clock.clone(),
        );
        Harness {
            engine,
            clock,
            dispatcher,
        }
    }

    fn reminder_steps() -> Vec<WorkflowStep> {
        vec![
            WorkflowStep::notify(StepType::GentleReminder, 1, &[Channel::App]),
            WorkflowStep::notify(StepType::FollowupReminder, 2, &[Channel::Sms]),
            WorkflowStep::notify(StepType::FinalNotice, 3, &[Channel::Email]),
        ]
    }

    fn def(steps: Vec<WorkflowStep>, enabled: bool) -> WorkflowDefinition {
        WorkflowDefinition {
            group_id: "g1".into(),
            steps,
            enabled,
        }
    }

    #[tokio::test]
    async fn put_definition_rejects_invalid_atomically() {
        let h = harness();
        let bad = def(vec![WorkflowStep::notify(StepType::FinalNotice, 0, &[])], true);
        let err = h.engine.put_definition(bad).await.unwrap_err();
        assert!(matches!(err, EscalationError::Validation(ref v) if v.len() == 2));
        // Nothing persisted.
        assert!(matches!(
            h.engine.get_definition("g1").await.unwrap_err(),
            EscalationError::UnknownWorkflow(_)
        ));
    }

    #[tokio::test]
    async fn start_run_requires_enabled_workflow() {
        let h = harness();
        h.engine
            .put_definition(def(reminder_steps(), false))
            .await
            .unwrap();
        assert!(matches!(
            h.engine.start_run("g1", "amina".into(), 2500).await.unwrap_err(),
            EscalationError::WorkflowDisabled(_)
        ));
        assert!(matches!(
            h.engine.start_run("g2", "amina".into(), 2500).await.unwrap_err(),
            EscalationError::UnknownWorkflow(_)
        ));
    }

    #[tokio::test]
    async fn advance_due_catches_up_after_downtime() {
        let h = harness();
        h.engine
            .put_definition(def(reminder_steps(), true))
            .await
            .unwrap();
        let run = h.engine.start_run("g1", "amina".into(), 2500).await.unwrap();

        // Steps due at days 1, 3, 6. Scheduler "down" for 10 days.
        h.clock.advance_days(10);
        let fired = h.engine.advance_due(run.id).await.unwrap();
        assert_eq!(fired, 3);

        let loaded = h.engine.get_run(run.id).await.unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);

        // Every step audited in order, nothing skipped.
        let log = h.engine.store().read_executions(run.id).await.unwrap();
        let indices: Vec<usize> = log.iter().map(|e| e.step_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);

        // And every notification handed off.
        assert_eq!(h.dispatcher.intents().len(), 3);
    }

    #[tokio::test]
    async fn handoff_failure_still_commits_execution() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap(),
        ));
        let engine = EscalationEngine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(FailingDispatcher),
            clock.clone(),
        );
        engine
            .put_definition(WorkflowDefinition {
                group_id: "g1".into(),
                steps: vec![WorkflowStep::notify(
                    StepType::GentleReminder,
                    1,
                    &[Channel::App],
                )],
                enabled: true,
            })
            .await
            .unwrap();

        let run = engine.start_run("g1", "amina".into(), 2500).await.unwrap();
        clock.advance_days(2);

        // Dispatcher unreachable, but the decision is still made and logged.
        assert_eq!(engine.advance_due(run.id).await.unwrap(), 1);
        assert_eq!(engine.store().read_executions(run.id).await.unwrap().len(), 1);
        assert_eq!(
            engine.get_run(run.id).await.unwrap().status,
            RunStatus::Completed
        );
    }

    #[tokio::test]
    async fn definition_edits_never_touch_running_snapshots() {
        let h = harness();
        // Five steps, one day apart.
        let five: Vec<WorkflowStep> = (0..5)
            .map(|_| WorkflowStep::notify(StepType::FollowupReminder, 1, &[Channel::App]))
            .collect();
        h.engine.put_definition(def(five, true)).await.unwrap();
        let run = h.engine.start_run("g1", "amina".into(), 2500).await.unwrap();

        // Fire two steps (indices 0, 1) — run now at index 2.
        h.clock.advance_days(2);
        assert_eq!(h.engine.advance_due(run.id).await.unwrap(), 2);
        assert_eq!(h.engine.get_run(run.id).await.unwrap().current_step_index, 2);

        // Delete the last two steps of the stored definition.
        let three: Vec<WorkflowStep> = (0..3)
            .map(|_| WorkflowStep::notify(StepType::FollowupReminder, 1, &[Channel::App]))
            .collect();
        h.engine.put_definition(def(three, true)).await.unwrap();

        // The run still resolves against its 5-step snapshot: no index
        // error, and it runs to completion through step 4.
        h.clock.advance_days(10);
        assert_eq!(h.engine.advance_due(run.id).await.unwrap(), 3);
        let loaded = h.engine.get_run(run.id).await.unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(loaded.history.len(), 5);
    }

    #[tokio::test]
    async fn approve_fires_step_and_reschedules() {
        let h = harness();
        h.engine
            .put_definition(def(
                vec![
                    WorkflowStep::notify(StepType::GentleReminder, 1, &[Channel::App]),
                    WorkflowStep::notify(StepType::UrgentReminder, 3, &[Channel::Sms])
                        .with_approval(),
                    WorkflowStep::notify(StepType::FinalNotice, 5, &[Channel::Email]),
                ],
                true,
            ))
            .await
            .unwrap();
        let run = h.engine.start_run("g1", "amina".into(), 2500).await.unwrap();
        let start = h.clock.now();

        h.clock.advance_days(4);
        h.engine.advance_due(run.id).await.unwrap();
        assert_eq!(
            h.engine.get_run(run.id).await.unwrap().status,
            RunStatus::AwaitingApproval
        );

        let approved = h.engine.approve(run.id, "treasurer").await.unwrap();
        assert_eq!(approved.status, RunStatus::Active);
        assert_eq!(approved.next_action_date, start + Duration::days(9));

        let log = h.engine.store().read_executions(run.id).await.unwrap();
        assert_eq!(log.last().unwrap().approved_by.as_deref(), Some("treasurer"));
    }

    #[tokio::test]
    async fn cancelled_runs_are_archived_and_immutable() {
        let h = harness();
        h.engine
            .put_definition(def(reminder_steps(), true))
            .await
            .unwrap();
        let run = h.engine.start_run("g1", "amina".into(), 2500).await.unwrap();

        h.engine.cancel(run.id).await.unwrap();
        assert!(h.engine.active_runs("g1").await.unwrap().is_empty());

        // Archived, not deleted — still loadable, still terminal.
        let loaded = h.engine.get_run(run.id).await.unwrap();
        assert_eq!(loaded.status, RunStatus::Cancelled);
        assert!(matches!(
            h.engine.resume(run.id).await.unwrap_err(),
            EscalationError::InvalidTransition { .. }
        ));
    }

    #[tokio::test]
    async fn mark_resolved_completes_and_audits() {
        let h = harness();
        h.engine
            .put_definition(def(reminder_steps(), true))
            .await
            .unwrap();
        let run = h.engine.start_run("g1", "amina".into(), 2500).await.unwrap();

        let resolved = h.engine.mark_resolved(run.id).await.unwrap();
        assert_eq!(resolved.status, RunStatus::Completed);
        let log = h.engine.store().read_executions(run.id).await.unwrap();
        assert_eq!(log.last().unwrap().outcome.as_deref(), Some("resolved"));
    }

    #[tokio::test]
    async fn active_runs_expose_display_fields() {
        let h = harness();
        h.engine
            .put_definition(def(reminder_steps(), true))
            .await
            .unwrap();
        h.engine.start_run("g1", "amina".into(), 2500).await.unwrap();

        h.clock.advance_days(2);
        let summaries = h.engine.active_runs("g1").await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].days_overdue, 2);
        assert_eq!(summaries[0].current_step_label, "Gentle reminder");
        assert_eq!(summaries[0].steps_total, 3);
    }
}
