//! Engine error taxonomy.
//!
//! Validation and transition errors are returned synchronously to callers;
//! delivery handoff failures are recovered locally (logged, execution record
//! still committed) and never surfaced as a failure of the decision itself.

use crate::run::RunStatus;
use crate::types::GroupId;
use uuid::Uuid;

/// A single definition validation failure, naming the offending step index
/// where one applies.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ValidationError {
    /// Stable rule id (R1..R4).
    pub rule: &'static str,
    /// Index of the offending step, when the rule targets a step.
    pub step: Option<usize>,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.step {
            Some(i) => write!(f, "[{}] step {}: {}", self.rule, i, self.message),
            None => write!(f, "[{}] {}", self.rule, self.message),
        }
    }
}

/// Errors surfaced by the escalation engine.
#[derive(Debug, thiserror::Error)]
pub enum EscalationError {
    #[error("Definition rejected: {}", format_validation(.0))]
    Validation(Vec<ValidationError>),

    #[error("Invalid transition: cannot {command} a {from} run")]
    InvalidTransition { from: RunStatus, command: &'static str },

    #[error("Unknown escalation run: {0}")]
    UnknownRun(Uuid),

    #[error("No workflow configured for group: {0}")]
    UnknownWorkflow(GroupId),

    #[error("Workflow for group {0} is disabled")]
    WorkflowDisabled(GroupId),

    #[error("Definition changed since run start (bound {bound}, current {current}); run continues on its snapshot")]
    StaleDefinition { bound: String, current: String },

    #[error("Intent handoff to dispatcher failed: {0}")]
    DeliveryHandoff(String),

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

fn format_validation(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_join_with_rule_and_step() {
        let err = EscalationError::Validation(vec![
            ValidationError {
                rule: "R1",
                step: Some(0),
                message: "no channels".into(),
            },
            ValidationError {
                rule: "R4",
                step: None,
                message: "no steps".into(),
            },
        ]);
        assert_eq!(
            err.to_string(),
            "Definition rejected: [R1] step 0: no channels; [R4] no steps"
        );
    }

    #[test]
    fn stale_definition_names_both_versions() {
        let err = EscalationError::StaleDefinition {
            bound: "0a1b2c3d".into(),
            current: "4e5f6071".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("bound 0a1b2c3d"));
        assert!(msg.contains("current 4e5f6071"));
        assert!(msg.contains("continues on its snapshot"));
    }
}
