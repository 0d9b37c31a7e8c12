//! Definition validation.
//!
//! Runs on every save, before persistence. Returns all errors found so the
//! authoring UI can show them in one pass.

use crate::error::ValidationError;
use crate::types::WorkflowDefinition;

/// Validate a definition. Empty result means the definition may be persisted.
pub fn validate_definition(def: &WorkflowDefinition) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    for (i, step) in def.steps.iter().enumerate() {
        // R1: every non-pause step notifies someone
        if !step.step_type.is_pause() && step.channels.is_empty() {
            errors.push(ValidationError {
                rule: "R1",
                step: Some(i),
                message: format!("{} step has no channels", step.step_type),
            });
        }

        // R2: pause steps carry no channels
        if step.step_type.is_pause() && !step.channels.is_empty() {
            errors.push(ValidationError {
                rule: "R2",
                step: Some(i),
                message: "pause step must not have channels".to_string(),
            });
        }

        // R3: offsets are at least one day
        if step.offset_days < 1 {
            errors.push(ValidationError {
                rule: "R3",
                step: Some(i),
                message: format!("offset_days must be >= 1, got {}", step.offset_days),
            });
        }
    }

    // R4: an enabled workflow needs at least one step
    if def.enabled && def.steps.is_empty() {
        errors.push(ValidationError {
            rule: "R4",
            step: None,
            message: "cannot enable a workflow with no steps".to_string(),
        });
    }

    errors
}
