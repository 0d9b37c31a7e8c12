//! Run state machine.
//!
//! Pure transition logic over an [`EscalationRun`] and its bound definition
//! snapshot. No store access, no clock access, no side effects — callers
//! pass `now` in and handle the returned intents. The engine drives this
//! against persisted runs; the simulator replays the exact same functions
//! against a synthetic run.
//!
//! One `advance` call fires at most one step. Catch-up after scheduler
//! downtime is the caller's loop: keep advancing until `NotDue`, so every
//! missed step is executed and audited, never skipped.

use chrono::{DateTime, Utc};

use crate::error::EscalationError;
use crate::intent::EscalationIntent;
use crate::run::{EscalationRun, RunStatus, StepExecution};
use crate::types::render_message;

/// Outcome of a single `advance` call.
#[derive(Debug)]
pub enum Advance {
    /// Run is not `Active` — paused, awaiting approval, pending or terminal.
    Skipped,
    /// The current step is not yet due.
    NotDue,
    /// Approval gate reached: run parked in `AwaitingApproval`, index
    /// unchanged. The intent asks an operator to approve.
    ApprovalRequested(EscalationIntent),
    /// A step fired. `intent` is `None` for pause steps (time consumed, no
    /// notification). `completed` is set when this was the final step.
    Fired {
        execution: StepExecution,
        intent: Option<EscalationIntent>,
        completed: bool,
    },
}

/// Activate a freshly created run. `Pending` → `Active`.
pub fn activate(run: &mut EscalationRun) -> Result<(), EscalationError> {
    match run.status {
        RunStatus::Pending => {
            run.status = RunStatus::Active;
            Ok(())
        }
        from => Err(EscalationError::InvalidTransition {
            from,
            command: "activate",
        }),
    }
}

/// Advance the run by at most one step.
pub fn advance(run: &mut EscalationRun, now: DateTime<Utc>) -> Advance {
    if run.status != RunStatus::Active {
        return Advance::Skipped;
    }
    if now < run.next_action_date {
        return Advance::NotDue;
    }

    let index = run.current_step_index;
    let step = &run.snapshot.steps[index];

    // Approval gate: park without advancing the index.
    if step.requires_approval && !run.approvals.contains_key(&index) {
        run.status = RunStatus::AwaitingApproval;
        return Advance::ApprovalRequested(EscalationIntent::ApprovalRequest {
            run_id: run.id,
            step_index: index,
            step_type: step.step_type,
        });
    }

    let intent = if step.step_type.is_pause() {
        None
    } else {
        Some(EscalationIntent::Execution {
            run_id: run.id,
            step_index: index,
            step_type: step.step_type,
            channels: step.channels.clone(),
            message: render_message(step.message(), &run.member_id, run.amount_due),
        })
    };

    let execution = StepExecution {
        step_index: index,
        fired_at: now,
        channels_used: step.channels.clone(),
        approved_by: run.approvals.get(&index).cloned(),
        outcome: None,
    };
    run.history.push(execution.clone());

    let completed = index == run.snapshot.last_index();
    if completed {
        run.status = RunStatus::Completed;
    } else {
        run.current_step_index += 1;
        run.recompute_next_action();
    }

    Advance::Fired {
        execution,
        intent,
        completed,
    }
}

/// Approve the gated step and immediately re-advance it.
pub fn approve(
    run: &mut EscalationRun,
    approver: &str,
    now: DateTime<Utc>,
) -> Result<Advance, EscalationError> {
    if run.status != RunStatus::AwaitingApproval {
        return Err(EscalationError::InvalidTransition {
            from: run.status,
            command: "approve",
        });
    }
    run.approvals
        .insert(run.current_step_index, approver.to_string());
    run.status = RunStatus::Active;
    Ok(advance(run, now))
}

/// Pause the run. Idempotent when already paused.
pub fn pause(run: &mut EscalationRun, now: DateTime<Utc>) -> Result<(), EscalationError> {
    match run.status {
        RunStatus::Paused => Ok(()),
        RunStatus::Active | RunStatus::AwaitingApproval => {
            run.paused_from = Some(run.status);
            run.paused_at = Some(now);
            run.status = RunStatus::Paused;
            Ok(())
        }
        from => Err(EscalationError::InvalidTransition {
            from,
            command: "pause",
        }),
    }
}

/// Resume a paused run, shifting the schedule forward by exactly the
/// wall-clock duration spent paused. Pausing never skips time and never
/// compresses the remaining schedule.
pub fn resume(run: &mut EscalationRun, now: DateTime<Utc>) -> Result<(), EscalationError> {
    if run.status != RunStatus::Paused {
        return Err(EscalationError::InvalidTransition {
            from: run.status,
            command: "resume",
        });
    }
    let paused_at = run.paused_at.unwrap_or(now);
    run.schedule_anchor += now - paused_at;
    run.recompute_next_action();
    run.paused_at = None;
    run.paused_from = None;
    run.status = RunStatus::Active;
    Ok(())
}

/// Cancel the run. Terminal: nothing transitions out of `Cancelled`.
pub fn cancel(run: &mut EscalationRun) -> Result<(), EscalationError> {
    if run.status.is_terminal() {
        return Err(EscalationError::InvalidTransition {
            from: run.status,
            command: "cancel",
        });
    }
    run.status = RunStatus::Cancelled;
    Ok(())
}

/// Record that the member settled the debt outside the workflow (external
/// event, never inferred). Completes the run with a `resolved` outcome in
/// the audit history; terminal like `cancel`.
pub fn mark_resolved(run: &mut EscalationRun, now: DateTime<Utc>) -> Result<(), EscalationError> {
    if run.status.is_terminal() {
        return Err(EscalationError::InvalidTransition {
            from: run.status,
            command: "resolve",
        });
    }
    run.history.push(StepExecution {
        step_index: run.current_step_index,
        fired_at: now,
        channels_used: Default::default(),
        approved_by: None,
        outcome: Some("resolved".to_string()),
    });
    run.status = RunStatus::Completed;
    Ok(())
}
