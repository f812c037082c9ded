//! Pipeline checkpoint model - persisted progress for crash recovery.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::plan::AgentType;
use crate::tdd::TddGuardResult;
use crate::Time;

/// Execution status of one subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubtaskStatus {
    /// Not started
    Pending,
    /// Handed to the runner
    Running,
    /// Finished successfully
    Done,
    /// Finished with an error
    Failed,
}

/// Recorded result of one subtask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtaskCheckpointResult {
    /// Current status
    pub status: SubtaskStatus,

    /// Role that ran it
    pub agent_type: AgentType,

    /// When the latest attempt started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Time>,

    /// When the latest attempt settled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Time>,

    /// Runner output, or the error text on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl SubtaskCheckpointResult {
    /// A subtask that has just been handed to the runner.
    pub fn running(agent_type: AgentType) -> Self {
        Self {
            status: SubtaskStatus::Running,
            agent_type,
            started_at: Some(chrono::Utc::now()),
            completed_at: None,
            output: None,
        }
    }

    /// Mark as done.
    pub fn complete(&mut self, output: Option<String>) {
        self.status = SubtaskStatus::Done;
        self.completed_at = Some(chrono::Utc::now());
        self.output = output;
    }

    /// Mark as failed with the error text.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = SubtaskStatus::Failed;
        self.completed_at = Some(chrono::Utc::now());
        self.output = Some(error.into());
    }
}

/// Snapshot of pipeline progress, written before each layer starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineCheckpoint {
    /// Session that owns the run
    pub session_id: String,

    /// Hash of the plan being executed
    pub plan_hash: String,

    /// Layers already finished
    pub completed_layers: Vec<usize>,

    /// Layer about to run
    pub current_layer: usize,

    /// Per-subtask results so far
    pub subtask_results: BTreeMap<String, SubtaskCheckpointResult>,

    /// Guard results so far, oldest first
    pub tdd_results: Vec<TddGuardResult>,

    /// Write time
    pub last_updated: Time,
}

impl PipelineCheckpoint {
    /// Checkpoint describing "about to run `layer`".
    pub fn at_layer(
        session_id: impl Into<String>,
        plan_hash: impl Into<String>,
        layer: usize,
        subtask_results: BTreeMap<String, SubtaskCheckpointResult>,
        tdd_results: Vec<TddGuardResult>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            plan_hash: plan_hash.into(),
            completed_layers: (0..layer).collect(),
            current_layer: layer,
            subtask_results,
            tdd_results,
            last_updated: chrono::Utc::now(),
        }
    }
}
