use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

// ─── Scalar aliases ───────────────────────────────────────────

/// Group identifier (savings circle).
pub type GroupId = String;

/// Member identifier within a group.
pub type MemberId = String;

/// SHA-256 of a definition's canonical JSON — the version key runs bind to.
pub type DefinitionVersion = [u8; 32];

// ─── Step types ───────────────────────────────────────────────

/// The closed set of escalation step types.
///
/// Presentation metadata (icon, color, display ordering) belongs to the UI
/// layer and is deliberately absent here. `Pause` is semantically special:
/// it carries no channels and fires no notification, only a delay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    GentleReminder,
    FollowupReminder,
    UrgentReminder,
    PhoneCall,
    FinalNotice,
    AdminNotification,
    Pause,
    PaymentPlanOffer,
}

impl StepType {
    /// Human-readable label for operator-facing views.
    pub fn label(&self) -> &'static str {
        match self {
            Self::GentleReminder => "Gentle reminder",
            Self::FollowupReminder => "Follow-up reminder",
            Self::UrgentReminder => "Urgent reminder",
            Self::PhoneCall => "Phone call",
            Self::FinalNotice => "Final notice",
            Self::AdminNotification => "Admin notification",
            Self::Pause => "Pause",
            Self::PaymentPlanOffer => "Payment plan offer",
        }
    }

    /// Default message template used when a step has no override.
    pub fn default_template(&self) -> &'static str {
        match self {
            Self::GentleReminder => {
                "Hi {member}, a friendly reminder that your contribution of {amount} is due."
            }
            Self::FollowupReminder => {
                "Hi {member}, following up on your outstanding contribution of {amount}."
            }
            Self::UrgentReminder => {
                "{member}, your contribution of {amount} is overdue. Please pay as soon as possible."
            }
            Self::PhoneCall => "Call {member} about the overdue contribution of {amount}.",
            Self::FinalNotice => {
                "{member}, this is a final notice for your overdue contribution of {amount}."
            }
            Self::AdminNotification => {
                "Escalation update: {member} has an overdue contribution of {amount}."
            }
            Self::Pause => "",
            Self::PaymentPlanOffer => {
                "{member}, we can split your outstanding {amount} into smaller installments."
            }
        }
    }

    /// Pause steps consume time without notifying anyone.
    pub fn is_pause(&self) -> bool {
        matches!(self, Self::Pause)
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

// ─── Channels ─────────────────────────────────────────────────

/// Delivery channel for a notification step. The engine only decides which
/// channels a step targets; transmission is the dispatcher's concern.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    App,
    Email,
    Sms,
    Whatsapp,
    Manual,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::App => "app",
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Whatsapp => "whatsapp",
            Self::Manual => "manual",
        }
    }
}

// ─── Workflow step ────────────────────────────────────────────

/// One stage of a workflow definition. Immutable value within a definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub step_type: StepType,
    /// Days after the previous step (or run start, for the first step)
    /// before this step becomes due. Must be >= 1.
    pub offset_days: i64,
    /// Empty iff `step_type` is `Pause`.
    #[serde(default)]
    pub channels: BTreeSet<Channel>,
    /// Replaces the step type's default template when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_override: Option<String>,
    /// When true, the run parks in `AwaitingApproval` until an operator
    /// approves this step.
    #[serde(default)]
    pub requires_approval: bool,
}

impl WorkflowStep {
    /// The message this step would send, after override resolution.
    pub fn message(&self) -> &str {
        self.message_override
            .as_deref()
            .unwrap_or_else(|| self.step_type.default_template())
    }
}

// ─── Workflow definition ──────────────────────────────────────

/// The ordered escalation sequence configured for one group.
///
/// Step position defines a total order; the cumulative due-day of step `i`
/// is the sum of `offset_days` over steps `0..=i`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub group_id: GroupId,
    pub steps: Vec<WorkflowStep>,
    pub enabled: bool,
}

impl WorkflowDefinition {
    /// Version key: SHA-256 of the canonical JSON encoding.
    pub fn version(&self) -> DefinitionVersion {
        let json = serde_json::to_string(self).expect("definition serializes");
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        hasher.finalize().into()
    }

    /// Cumulative due-day of step `index`: sum of offsets `0..=index`.
    /// Strictly increasing in `index` for any valid definition.
    pub fn cumulative_due_day(&self, index: usize) -> i64 {
        self.steps[..=index].iter().map(|s| s.offset_days).sum()
    }

    /// Freeze this definition into the snapshot a new run binds to.
    pub fn snapshot(&self) -> DefinitionSnapshot {
        DefinitionSnapshot {
            group_id: self.group_id.clone(),
            version: self.version(),
            steps: self.steps.clone(),
        }
    }
}

// ─── Definition snapshot ──────────────────────────────────────

/// The frozen definition a run was started against.
///
/// A run resolves every step against this snapshot, never against the live
/// stored definition, so mid-run edits cannot shift an in-flight schedule
/// or invalidate `current_step_index`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DefinitionSnapshot {
    pub group_id: GroupId,
    pub version: DefinitionVersion,
    pub steps: Vec<WorkflowStep>,
}

impl DefinitionSnapshot {
    pub fn cumulative_due_day(&self, index: usize) -> i64 {
        self.steps[..=index].iter().map(|s| s.offset_days).sum()
    }

    pub fn last_index(&self) -> usize {
        self.steps.len().saturating_sub(1)
    }
}

// ─── Convenience constructors (used heavily in tests) ─────────

impl WorkflowStep {
    /// A notification step on the given channels.
    pub fn notify(step_type: StepType, offset_days: i64, channels: &[Channel]) -> Self {
        Self {
            step_type,
            offset_days,
            channels: channels.iter().copied().collect(),
            message_override: None,
            requires_approval: false,
        }
    }

    /// A pure delay step.
    pub fn pause(offset_days: i64) -> Self {
        Self {
            step_type: StepType::Pause,
            offset_days,
            channels: BTreeSet::new(),
            message_override: None,
            requires_approval: false,
        }
    }

    pub fn with_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message_override = Some(message.into());
        self
    }
}

/// Render a step message template against a member and amount.
///
/// Amounts are in minor units (e.g. cents); rendering divides by 100.
pub fn render_message(template: &str, member: &str, amount_due: i64) -> String {
    template
        .replace("{member}", member)
        .replace("{amount}", &format!("{:.2}", amount_due as f64 / 100.0))
}

/// Epoch-style helper kept alongside the types it annotates.
pub fn format_version(version: &DefinitionVersion) -> String {
    version[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// Timestamp alias used across run records.
pub type Timestamp = DateTime<Utc>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cumulative_due_day_is_strictly_increasing() {
        let def = WorkflowDefinition {
            group_id: "g1".into(),
            steps: vec![
                WorkflowStep::notify(StepType::GentleReminder, 1, &[Channel::App]),
                WorkflowStep::notify(StepType::UrgentReminder, 3, &[Channel::Sms]),
                WorkflowStep::notify(StepType::FinalNotice, 5, &[Channel::Email]),
            ],
            enabled: true,
        };

        let days: Vec<i64> = (0..def.steps.len())
            .map(|i| def.cumulative_due_day(i))
            .collect();
        assert_eq!(days, vec![1, 4, 9]);
        assert!(days.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn version_changes_when_steps_change() {
        let mut def = WorkflowDefinition {
            group_id: "g1".into(),
            steps: vec![WorkflowStep::notify(
                StepType::GentleReminder,
                1,
                &[Channel::App],
            )],
            enabled: true,
        };
        let v1 = def.version();
        def.steps.push(WorkflowStep::pause(7));
        let v2 = def.version();
        assert_ne!(v1, v2);
    }

    #[test]
    fn message_override_wins_over_template() {
        let step = WorkflowStep::notify(StepType::GentleReminder, 1, &[Channel::App])
            .with_message("Custom text");
        assert_eq!(step.message(), "Custom text");

        let plain = WorkflowStep::notify(StepType::GentleReminder, 1, &[Channel::App]);
        assert_eq!(plain.message(), StepType::GentleReminder.default_template());
    }

    #[test]
    fn render_message_substitutes_member_and_amount() {
        let rendered = render_message("Hi {member}, {amount} due", "Amina", 2500);
        assert_eq!(rendered, "Hi Amina, 25.00 due");
    }
}
