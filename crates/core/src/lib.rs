//! Pipeline core data models.
//!
//! This crate defines the plan, checkpoint, guard and slot-accounting
//! structures shared by the storage, quality and execution layers, plus the
//! static configuration that drives them.

#![warn(missing_docs)]

// Plan and guards
mod plan;
mod tdd;

// Persisted progress
mod checkpoint;
mod slot;

// Static configuration
mod config;

pub use plan::{AgentType, PlanStrategy, Subtask, SubtaskPlan};
pub use tdd::{GuardPhase, TddGuardResult, TddMode};
pub use checkpoint::{PipelineCheckpoint, SubtaskCheckpointResult, SubtaskStatus};
pub use slot::{SchedulerState, SchedulerTask, SCHEDULER_STATE_VERSION};
pub use config::{
    AgentTypeConfig, ConcurrencyConfig, ConfigError, HostConfig, ModelConfig,
    OrchestratorConfig, PipelineConfig,
};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
