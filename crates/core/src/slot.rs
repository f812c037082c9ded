//! Slot accounting model shared by the scheduler and its state file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::plan::Subtask;

/// Version tag written into the scheduler state file.
pub const SCHEDULER_STATE_VERSION: u32 = 1;

/// A queued task waiting for a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerTask {
    /// Task id (unique within the queue)
    pub id: String,

    /// Agent type key into the agent type config
    pub agent_type: String,
}

impl SchedulerTask {
    /// Create a queued task.
    pub fn new(id: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent_type: agent_type.into(),
        }
    }
}

impl From<&Subtask> for SchedulerTask {
    fn from(subtask: &Subtask) -> Self {
        Self::new(subtask.id.clone(), subtask.agent_type.as_str())
    }
}

/// Scheduler counters, as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerState {
    /// Always [`SCHEDULER_STATE_VERSION`]
    pub version: u32,

    /// host -> model -> slots in use
    pub used_slots: BTreeMap<String, BTreeMap<String, u32>>,

    /// host -> agent type -> running agents
    pub active_agent_counts: BTreeMap<String, BTreeMap<String, u32>>,

    /// task id -> consecutive rounds passed over
    pub skip_counts: BTreeMap<String, u32>,
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self {
            version: SCHEDULER_STATE_VERSION,
            used_slots: BTreeMap::new(),
            active_agent_counts: BTreeMap::new(),
            skip_counts: BTreeMap::new(),
        }
    }
}
