//! Escalation intents — decisions handed to the notification dispatcher.
//!
//! The engine decides *what* and *when*; the dispatcher owns transmission
//! and retry. Handoff is non-blocking so a slow dispatcher never stalls a
//! scheduling sweep, and consumption is at-least-once.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::EscalationError;
use crate::types::{Channel, StepType};

/// A decision emitted by the engine describing what should be communicated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EscalationIntent {
    /// Send the step's message via the given channels.
    Execution {
        run_id: Uuid,
        step_index: usize,
        step_type: StepType,
        channels: BTreeSet<Channel>,
        message: String,
    },
    /// A step requires operator approval before it may fire.
    ApprovalRequest {
        run_id: Uuid,
        step_index: usize,
        step_type: StepType,
    },
}

impl EscalationIntent {
    pub fn run_id(&self) -> Uuid {
        match self {
            Self::Execution { run_id, .. } | Self::ApprovalRequest { run_id, .. } => *run_id,
        }
    }

    pub fn step_index(&self) -> usize {
        match self {
            Self::Execution { step_index, .. } | Self::ApprovalRequest { step_index, .. } => {
                *step_index
            }
        }
    }
}

/// Handoff seam to the external notification dispatcher.
///
/// `submit` must not block: implementations queue and return. A failure here
/// means the intent could not be queued; the engine logs it and keeps the
/// execution record committed (decide-and-log, not guaranteed-delivery).
pub trait NotificationDispatcher: Send + Sync {
    fn submit(&self, intent: EscalationIntent) -> Result<(), EscalationError>;
}

/// Dispatcher backed by a bounded channel; the consumer side is the real
/// delivery layer (or an operational logger in development).
pub struct ChannelDispatcher {
    tx: mpsc::Sender<EscalationIntent>,
}

impl ChannelDispatcher {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<EscalationIntent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl NotificationDispatcher for ChannelDispatcher {
    fn submit(&self, intent: EscalationIntent) -> Result<(), EscalationError> {
        self.tx
            .try_send(intent)
            .map_err(|e| EscalationError::DeliveryHandoff(e.to_string()))
    }
}

/// Dispatcher that records everything it receives. Test use.
#[derive(Default)]
pub struct RecordingDispatcher {
    intents: std::sync::Mutex<Vec<EscalationIntent>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intents(&self) -> Vec<EscalationIntent> {
        self.intents.lock().unwrap().clone()
    }
}

impl NotificationDispatcher for RecordingDispatcher {
    fn submit(&self, intent: EscalationIntent) -> Result<(), EscalationError> {
        self.intents.lock().unwrap().push(intent);
        Ok(())
    }
}

/// Dispatcher that rejects every handoff. Test use (failure semantics).
pub struct FailingDispatcher;

impl NotificationDispatcher for FailingDispatcher {
    fn submit(&self, _intent: EscalationIntent) -> Result<(), EscalationError> {
        Err(EscalationError::DeliveryHandoff("dispatcher unreachable".into()))
    }
}
