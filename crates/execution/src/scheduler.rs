//! Slot scheduling for model inference hosts.
//!
//! The scheduler owns per-host/per-model slot counts and per-host agent
//! counts. `schedule` picks at most one task from a queue, using a bounded
//! lookahead past a blocked head and force-selecting tasks that have been
//! passed over too often. State is optionally mirrored to a JSON file after
//! every change; a single process is assumed to own that file.

use std::collections::BTreeMap;
use std::path::Path;

use ao_core::{
    AgentTypeConfig, ConcurrencyConfig, HostConfig, OrchestratorConfig, SchedulerState,
    SchedulerTask, SCHEDULER_STATE_VERSION,
};
use ao_storage::{read_json_lenient, write_json_atomic};
use serde_json::Value;
use tracing::{debug, info, warn};

/// A granted slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotGrant {
    /// Selected task
    pub task_id: String,

    /// Agent type of the task
    pub agent_type: String,

    /// Host the slot is on
    pub host: String,

    /// Model the slot is for
    pub model: String,

    /// Inference endpoint of the model on that host
    pub endpoint: String,

    /// Configured retry hint, in seconds
    pub retry_after: u64,

    /// Chosen by the starvation guard rather than queue position
    pub forced: bool,
}

/// Outcome of one scheduling round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleDecision {
    /// A task may proceed
    Granted(SlotGrant),

    /// Nothing fits; try again after `retry_after` seconds
    NoSlots {
        /// Seconds to wait
        retry_after: u64,
    },
}

impl ScheduleDecision {
    /// The grant, if any.
    pub fn grant(&self) -> Option<&SlotGrant> {
        match self {
            Self::Granted(grant) => Some(grant),
            Self::NoSlots { .. } => None,
        }
    }
}

/// Manages inference slots across hosts.
pub struct ResourceScheduler {
    hosts: BTreeMap<String, HostConfig>,
    agent_types: BTreeMap<String, AgentTypeConfig>,
    config: ConcurrencyConfig,
    state: SchedulerState,
}

impl ResourceScheduler {
    /// Create a scheduler, restoring persisted state when a state path is
    /// configured. Unreadable or foreign state is ignored.
    pub async fn new(
        hosts: BTreeMap<String, HostConfig>,
        agent_types: BTreeMap<String, AgentTypeConfig>,
        config: ConcurrencyConfig,
    ) -> Self {
        let mut state = SchedulerState::default();
        for (host_name, host) in &hosts {
            state.used_slots.insert(
                host_name.clone(),
                host.models.keys().map(|m| (m.clone(), 0)).collect(),
            );
            state.active_agent_counts.insert(host_name.clone(), BTreeMap::new());
        }

        let mut scheduler = Self {
            hosts,
            agent_types,
            config,
            state,
        };
        if let Some(path) = scheduler.config.state_path.clone() {
            scheduler.load_state(&path).await;
        }
        scheduler
    }

    /// Create a scheduler from the orchestrator config.
    pub async fn from_config(config: &OrchestratorConfig) -> Self {
        for agent_type in config.unplaceable_agent_types() {
            warn!("No host serves the model for agent type {}", agent_type);
        }
        Self::new(
            config.hosts.clone(),
            config.agent_types.clone(),
            config.concurrency.clone(),
        )
        .await
    }

    /// Scheduler tuning in effect.
    pub fn config(&self) -> &ConcurrencyConfig {
        &self.config
    }

    /// Pick the next task from `queue` that can run now.
    pub async fn schedule(&mut self, queue: &[SchedulerTask]) -> ScheduleDecision {
        let no_slots = ScheduleDecision::NoSlots {
            retry_after: self.config.retry_backoff,
        };
        if queue.is_empty() {
            return no_slots;
        }

        let starving = queue
            .iter()
            .find(|t| self.skip_count(&t.id) >= self.config.max_skips_per_task);
        if let Some(task) = starving {
            if let Some(grant) = self.find_host(task, true) {
                info!("Force-selecting starved task {}", task.id);
                return self.commit(queue, grant).await;
            }
        }

        let window = self.config.queue_lookahead.saturating_add(1);
        for task in queue.iter().take(window) {
            if let Some(grant) = self.find_host(task, false) {
                return self.commit(queue, grant).await;
            }
        }

        debug!("No slots for {} queued task(s)", queue.len());
        no_slots
    }

    /// Return a slot once its task has finished or failed.
    pub async fn release(&mut self, task_id: &str, host: &str, model: &str, agent_type: &str) {
        if let Some(count) = self
            .state
            .used_slots
            .get_mut(host)
            .and_then(|models| models.get_mut(model))
        {
            *count = count.saturating_sub(1);
        }
        if let Some(count) = self
            .state
            .active_agent_counts
            .get_mut(host)
            .and_then(|counts| counts.get_mut(agent_type))
        {
            *count = count.saturating_sub(1);
        }
        self.state.skip_counts.remove(task_id);

        debug!("Released {} slot on {} for {}", model, host, task_id);
        self.persist().await;
    }

    /// Drop the skip count of a task that left the queue without a grant.
    pub async fn forget(&mut self, task_id: &str) {
        if self.state.skip_counts.remove(task_id).is_some() {
            debug!("Forgot skip count for {}", task_id);
            self.persist().await;
        }
    }

    /// Release the slot held by `grant`.
    pub async fn release_grant(&mut self, grant: &SlotGrant) {
        self.release(&grant.task_id, &grant.host, &grant.model, &grant.agent_type)
            .await;
    }

    /// Deep copy of the current counters.
    pub fn snapshot(&self) -> SchedulerState {
        self.state.clone()
    }

    fn skip_count(&self, task_id: &str) -> u32 {
        self.state.skip_counts.get(task_id).copied().unwrap_or(0)
    }

    fn find_host(&self, task: &SchedulerTask, forced: bool) -> Option<SlotGrant> {
        let agent = self.agent_types.get(&task.agent_type)?;

        for (host_name, host) in &self.hosts {
            let Some(model) = host.models.get(&agent.model) else {
                continue;
            };

            let used = self.used(host_name, &agent.model);
            if used >= model.max_slots {
                continue;
            }

            let active = self.active(host_name, &task.agent_type);
            if agent.max_concurrent_per_host.is_some_and(|max| active >= max) {
                continue;
            }

            return Some(SlotGrant {
                task_id: task.id.clone(),
                agent_type: task.agent_type.clone(),
                host: host_name.clone(),
                model: agent.model.clone(),
                endpoint: model.endpoint.clone(),
                retry_after: self.config.retry_backoff,
                forced,
            });
        }

        None
    }

    fn used(&self, host: &str, model: &str) -> u32 {
        self.state
            .used_slots
            .get(host)
            .and_then(|m| m.get(model))
            .copied()
            .unwrap_or(0)
    }

    fn active(&self, host: &str, agent_type: &str) -> u32 {
        self.state
            .active_agent_counts
            .get(host)
            .and_then(|m| m.get(agent_type))
            .copied()
            .unwrap_or(0)
    }

    async fn commit(&mut self, queue: &[SchedulerTask], grant: SlotGrant) -> ScheduleDecision {
        *self
            .state
            .used_slots
            .entry(grant.host.clone())
            .or_default()
            .entry(grant.model.clone())
            .or_insert(0) += 1;
        *self
            .state
            .active_agent_counts
            .entry(grant.host.clone())
            .or_default()
            .entry(grant.agent_type.clone())
            .or_insert(0) += 1;

        for task in queue {
            let skips = self.state.skip_counts.entry(task.id.clone()).or_insert(0);
            if task.id == grant.task_id {
                *skips = 0;
            } else {
                *skips += 1;
            }
        }

        info!(
            "Granted {} slot on {} to {} ({})",
            grant.model, grant.host, grant.task_id, grant.agent_type
        );
        self.persist().await;
        ScheduleDecision::Granted(grant)
    }

    async fn persist(&self) {
        let Some(path) = &self.config.state_path else {
            return;
        };
        if let Err(e) = write_json_atomic(path, &self.state).await {
            warn!("Failed to persist scheduler state to {}: {}", path.display(), e);
        }
    }

    async fn load_state(&mut self, path: &Path) {
        let Some(raw) = read_json_lenient::<Value>(path).await else {
            return;
        };
        if raw.get("version").and_then(Value::as_u64) != Some(u64::from(SCHEDULER_STATE_VERSION)) {
            warn!("Ignoring scheduler state with unknown version at {}", path.display());
            return;
        }

        for (host, models) in entries(&raw, "usedSlots") {
            let Some(known) = self.state.used_slots.get_mut(host) else {
                continue;
            };
            for (model, value) in models.as_object().into_iter().flatten() {
                if let (Some(slot), Some(count)) = (known.get_mut(model), as_count(value)) {
                    *slot = count;
                }
            }
        }

        for (host, counts) in entries(&raw, "activeAgentCounts") {
            let Some(known) = self.state.active_agent_counts.get_mut(host) else {
                continue;
            };
            for (agent_type, value) in counts.as_object().into_iter().flatten() {
                if let Some(count) = as_count(value) {
                    known.insert(agent_type.clone(), count);
                }
            }
        }

        for (task_id, value) in entries(&raw, "skipCounts") {
            if let Some(count) = as_count(value) {
                self.state.skip_counts.insert(task_id.clone(), count);
            }
        }

        debug!("Restored scheduler state from {}", path.display());
    }
}

fn entries<'a>(raw: &'a Value, key: &str) -> impl Iterator<Item = (&'a String, &'a Value)> {
    raw.get(key).and_then(Value::as_object).into_iter().flatten()
}

/// Counts are clamped at zero; non-numbers are skipped.
fn as_count(value: &Value) -> Option<u32> {
    value.as_f64().map(|v| v.max(0.0).min(f64::from(u32::MAX)) as u32)
}
