//! Static configuration: hosts, agent types, concurrency and pipeline knobs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::tdd::TddMode;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error
    #[error("failed to read config {path}: {source}")]
    Io {
        /// File that could not be read
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// Malformed JSON
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// A model served on a host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    /// Inference endpoint
    pub endpoint: String,

    /// Memory footprint of one instance
    pub vram_gb: f64,

    /// Concurrent requests the host accepts for this model
    pub max_slots: u32,
}

/// A named inference host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Network address
    pub address: String,

    /// model name -> model config
    #[serde(default)]
    pub models: BTreeMap<String, ModelConfig>,
}

/// How an agent type maps onto the compute pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTypeConfig {
    /// Model every agent of this type requires
    pub model: String,

    /// Cap on agents of this type per host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_per_host: Option<u32>,
}

/// Scheduler tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyConfig {
    /// Tasks past the head of the queue the scheduler may pick
    #[serde(default = "default_queue_lookahead")]
    pub queue_lookahead: usize,

    /// Skips after which a task is force-selected
    #[serde(default = "default_max_skips_per_task")]
    pub max_skips_per_task: u32,

    /// Seconds a caller should wait after `no-slots`
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: u64,

    /// Where scheduler state is persisted, if anywhere
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_path: Option<PathBuf>,
}

fn default_queue_lookahead() -> usize {
    5
}

fn default_max_skips_per_task() -> u32 {
    2
}

fn default_retry_backoff() -> u64 {
    30
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            queue_lookahead: default_queue_lookahead(),
            max_skips_per_task: default_max_skips_per_task(),
            retry_backoff: default_retry_backoff(),
            state_path: None,
        }
    }
}

impl ConcurrencyConfig {
    /// Set the lookahead window.
    pub fn with_queue_lookahead(mut self, lookahead: usize) -> Self {
        self.queue_lookahead = lookahead;
        self
    }

    /// Set the skip budget.
    pub fn with_max_skips_per_task(mut self, max: u32) -> Self {
        self.max_skips_per_task = max;
        self
    }

    /// Set the retry hint in seconds.
    pub fn with_retry_backoff(mut self, seconds: u64) -> Self {
        self.retry_backoff = seconds;
        self
    }

    /// Persist scheduler state at `path`.
    pub fn with_state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = Some(path.into());
        self
    }
}

/// Pipeline manager knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Guard enforcement mode (required)
    pub tdd_mode: TddMode,

    /// Extra red guard attempts
    #[serde(default = "default_max_red_retries")]
    pub max_red_retries: u32,

    /// Extra green guard attempts
    #[serde(default = "default_max_green_retries")]
    pub max_green_retries: u32,

    /// Extra attempts for a failing subtask
    #[serde(default)]
    pub subtask_retries: u32,

    /// Delay between subtask attempts
    #[serde(default)]
    pub subtask_retry_backoff_ms: u64,

    /// Session the checkpoint belongs to
    #[serde(default = "default_session_id")]
    pub session_id: String,
}

fn default_max_red_retries() -> u32 {
    2
}

fn default_max_green_retries() -> u32 {
    3
}

fn default_session_id() -> String {
    "pipeline-session".to_string()
}

impl PipelineConfig {
    /// Create a config; every other knob takes its documented default.
    pub fn new(tdd_mode: TddMode) -> Self {
        Self {
            tdd_mode,
            max_red_retries: default_max_red_retries(),
            max_green_retries: default_max_green_retries(),
            subtask_retries: 0,
            subtask_retry_backoff_ms: 0,
            session_id: default_session_id(),
        }
    }

    /// Set red guard retries.
    pub fn with_max_red_retries(mut self, retries: u32) -> Self {
        self.max_red_retries = retries;
        self
    }

    /// Set green guard retries.
    pub fn with_max_green_retries(mut self, retries: u32) -> Self {
        self.max_green_retries = retries;
        self
    }

    /// Set subtask retries and the delay between them.
    pub fn with_subtask_retries(mut self, retries: u32, backoff_ms: u64) -> Self {
        self.subtask_retries = retries;
        self.subtask_retry_backoff_ms = backoff_ms;
        self
    }

    /// Set the session id.
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorConfig {
    /// host name -> host
    #[serde(default)]
    pub hosts: BTreeMap<String, HostConfig>,

    /// agent type -> requirements
    #[serde(default)]
    pub agent_types: BTreeMap<String, AgentTypeConfig>,

    /// Scheduler tuning
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    /// Pipeline knobs, when the file drives a pipeline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<PipelineConfig>,
}

impl OrchestratorConfig {
    /// Parse from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Agent types whose model no host serves. Such types are legal but can
    /// never be scheduled.
    pub fn unplaceable_agent_types(&self) -> Vec<&str> {
        self.agent_types
            .iter()
            .filter(|(_, cfg)| !self.hosts.values().any(|h| h.models.contains_key(&cfg.model)))
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "hosts": {
            "local": {
                "address": "localhost",
                "models": {
                    "model-developer": { "endpoint": "http://localhost:8082/v1", "vramGb": 8, "maxSlots": 1 }
                }
            }
        },
        "agentTypes": {
            "tester": { "model": "model-missing", "maxConcurrentPerHost": 1 },
            "developer": { "model": "model-developer" }
        },
        "concurrency": { "retryBackoff": 17 },
        "pipeline": { "tddMode": "strict" }
    }"#;

    #[test]
    fn test_parse_with_defaults() {
        let config = OrchestratorConfig::from_json_str(SAMPLE).unwrap();

        assert_eq!(config.hosts["local"].models["model-developer"].max_slots, 1);
        assert_eq!(config.agent_types["developer"].max_concurrent_per_host, None);
        assert_eq!(config.concurrency.retry_backoff, 17);
        assert_eq!(config.concurrency.queue_lookahead, 5);
        assert_eq!(config.concurrency.max_skips_per_task, 2);

        let pipeline = config.pipeline.unwrap();
        assert_eq!(pipeline.tdd_mode, TddMode::Strict);
        assert_eq!(pipeline.max_red_retries, 2);
        assert_eq!(pipeline.max_green_retries, 3);
        assert_eq!(pipeline.subtask_retries, 0);
        assert_eq!(pipeline.session_id, "pipeline-session");
    }

    #[test]
    fn test_pipeline_requires_tdd_mode() {
        let err = serde_json::from_str::<PipelineConfig>("{}");
        assert!(err.is_err());
    }

    #[test]
    fn test_unplaceable_agent_types() {
        let config = OrchestratorConfig::from_json_str(SAMPLE).unwrap();
        assert_eq!(config.unplaceable_agent_types(), vec!["tester"]);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent-orchestrator.json");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = OrchestratorConfig::from_file(&path).unwrap();
        assert_eq!(config.hosts.len(), 1);

        let missing = OrchestratorConfig::from_file(dir.path().join("missing.json"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
