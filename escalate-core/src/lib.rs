//! escalate-core: Escalation workflow engine for overdue group contributions
//!
//! Pure domain logic with no HTTP or database dependencies:
//! - Workflow definitions (ordered steps, offsets, channels, approval gates)
//! - Per-member escalation runs bound to an immutable definition snapshot
//! - State machine over run lifecycle (pending, active, paused,
//!   awaiting-approval, cancelled, completed)
//! - Engine commands with per-run serialization and intent handoff
//! - Scheduler sweep with post-downtime catch-up
//! - Deterministic seeded simulator for workflow previews
//!
//! The HTTP surface lives in escalate-server.

pub mod clock;
pub mod engine;
pub mod error;
pub mod intent;
pub mod machine;
pub mod rng;
pub mod run;
pub mod scheduler;
pub mod simulator;
pub mod store;
pub mod types;
pub mod validate;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::EscalationEngine;
pub use error::{EscalationError, ValidationError};
pub use intent::{ChannelDispatcher, EscalationIntent, NotificationDispatcher};
pub use run::{EscalationRun, RunStatus, RunSummary, StepExecution};
pub use scheduler::Scheduler;
pub use simulator::{ResponseModel, SeededResponseModel, SimulationResult};
pub use store::{EscalationStore, MemoryStore};
pub use types::{
    Channel, DefinitionSnapshot, GroupId, MemberId, StepType, WorkflowDefinition, WorkflowStep,
};
pub use validate::validate_definition;
