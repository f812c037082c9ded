//! Execution layer - plan layering, slot scheduling, and the pipeline manager.

#![warn(missing_docs)]

pub mod dependency;
pub mod scheduler;
pub mod runner;
pub mod manager;

pub use dependency::{build_execution_layers, topological_sort, validate, PlanError};
pub use scheduler::{ResourceScheduler, ScheduleDecision, SlotGrant};
pub use runner::{GrantedRunner, ScheduledRunner, SubtaskRunner, DEFAULT_MAX_WAIT_ATTEMPTS};
pub use manager::{PipelineError, PipelineManager, PipelineObserver, PipelineOutcome};

pub use tokio_util::sync::CancellationToken;
