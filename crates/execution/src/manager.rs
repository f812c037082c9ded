//! The pipeline manager - runs a subtask plan layer by layer.
//!
//! ```text
//! checkpoint → run layer → red guard? → green guard? → next layer
//! ```
//!
//! Guards gate the test-driven flow: red after a tester layer that feeds a
//! developer layer, green after any developer layer. In strict mode a failed
//! guard re-runs the layer and tries again until its attempts run out.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ao_core::{
    AgentType, GuardPhase, PipelineCheckpoint, PipelineConfig, Subtask, SubtaskCheckpointResult,
    SubtaskPlan, TddGuardResult, TddMode,
};
use ao_quality::TddGuard;
use ao_storage::{hash_plan, CheckpointStore, StorageError};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dependency::{build_execution_layers, PlanError};
use crate::runner::SubtaskRunner;

/// Errors that end a pipeline run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The plan failed validation
    #[error("invalid plan: {0}")]
    Plan(#[from] PlanError),

    /// Checkpoint could not be written or cleared, or the plan not hashed
    #[error("checkpoint storage error: {0}")]
    Storage(#[from] StorageError),

    /// A subtask failed after all its retries
    #[error("subtask {id} failed: {source}")]
    Subtask {
        /// Failing subtask
        id: String,
        /// Last runner error
        #[source]
        source: anyhow::Error,
    },

    /// A strict-mode guard never passed
    #[error("TDD {phase} guard failed after {attempts} attempts")]
    GuardFailed {
        /// Guard phase
        phase: GuardPhase,
        /// Attempts made
        attempts: u32,
    },

    /// The run was cancelled; the checkpoint still points at `layer`
    #[error("pipeline cancelled at layer {layer}")]
    Cancelled {
        /// Layer that was about to run or running
        layer: usize,
    },
}

/// Lifecycle hooks. All methods default to doing nothing.
pub trait PipelineObserver: Send + Sync {
    /// A layer is about to run.
    fn on_layer_start(&self, _layer: usize, _subtasks: &[&Subtask]) {}

    /// Every subtask of a layer finished successfully.
    fn on_layer_completed(&self, _layer: usize, _subtasks: &[&Subtask]) {}

    /// A subtask failed and will be tried again. `attempt` is the failed one.
    fn on_subtask_retry(&self, _subtask: &Subtask, _attempt: u32, _error: &anyhow::Error) {}
}

/// Result of a successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutcome {
    /// Every guard attempt, oldest first (including resumed ones)
    pub tdd_results: Vec<TddGuardResult>,

    /// Layer the run started at; 0 unless a matching checkpoint was found
    pub resumed_from_layer: usize,

    /// Final per-subtask results
    pub subtask_results: BTreeMap<String, SubtaskCheckpointResult>,
}

/// How one guard enforcement ended.
enum GuardVerdict {
    Passed,
    Warned,
    Exhausted { attempts: u32 },
}

/// Accumulators for one `execute_plan` call.
#[derive(Default)]
struct RunState {
    tdd_results: Vec<TddGuardResult>,
    subtask_results: BTreeMap<String, SubtaskCheckpointResult>,
}

/// Executes subtask plans.
pub struct PipelineManager {
    runner: Arc<dyn SubtaskRunner>,
    guard: Arc<dyn TddGuard>,
    config: PipelineConfig,
    store: Option<Arc<dyn CheckpointStore>>,
    observer: Option<Arc<dyn PipelineObserver>>,
    cancel: CancellationToken,
}

impl PipelineManager {
    /// Create a manager without checkpointing.
    pub fn new(
        runner: Arc<dyn SubtaskRunner>,
        guard: Arc<dyn TddGuard>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            runner,
            guard,
            config,
            store: None,
            observer: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Persist progress to `store` so an interrupted run can resume.
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Receive lifecycle callbacks.
    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Stop the run when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// The configuration in effect.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run `plan` to completion, resuming from a matching checkpoint.
    pub async fn execute_plan(&self, plan: &SubtaskPlan) -> Result<PipelineOutcome, PipelineError> {
        let layers = build_execution_layers(plan)?;
        let plan_hash = hash_plan(plan)?;

        let mut run = RunState::default();
        let start = self.resume_point(&plan_hash, layers.len(), &mut run).await;

        info!(
            "Executing plan: {} subtasks in {} layers (session {}, starting at layer {})",
            plan.len(),
            layers.len(),
            self.config.session_id,
            start
        );

        for (index, layer) in layers.iter().enumerate().skip(start) {
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled { layer: index });
            }

            self.save_checkpoint(&plan_hash, index, &run).await?;

            info!("Starting layer {} ({} subtasks)", index, layer.len());
            if let Some(observer) = &self.observer {
                observer.on_layer_start(index, layer);
            }

            self.run_layer(index, layer, &mut run).await?;

            if let Some(observer) = &self.observer {
                observer.on_layer_completed(index, layer);
            }
            debug!("Layer {} completed", index);

            let next = layers.get(index + 1);
            if has_agent(layer, AgentType::Tester)
                && next.is_some_and(|n| has_agent(n, AgentType::Developer))
            {
                self.enforce_guard(GuardPhase::Red, index, layer, &mut run)
                    .await
                    .and_then(|v| verdict_to_result(GuardPhase::Red, v))?;
            }

            if has_agent(layer, AgentType::Developer) {
                self.enforce_guard(GuardPhase::Green, index, layer, &mut run)
                    .await
                    .and_then(|v| verdict_to_result(GuardPhase::Green, v))?;
            }
        }

        if let Some(store) = &self.store {
            store.clear().await?;
            debug!("Cleared checkpoint for session {}", self.config.session_id);
        }

        info!(
            "Plan completed with {} guard results",
            run.tdd_results.len()
        );

        Ok(PipelineOutcome {
            tdd_results: run.tdd_results,
            resumed_from_layer: start,
            subtask_results: run.subtask_results,
        })
    }

    async fn resume_point(&self, plan_hash: &str, layer_count: usize, run: &mut RunState) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };
        let Some(checkpoint) = store.load().await else {
            return 0;
        };

        if checkpoint.plan_hash != plan_hash {
            info!(
                "Ignoring checkpoint for session {}: plan changed",
                checkpoint.session_id
            );
            return 0;
        }
        if checkpoint.current_layer >= layer_count {
            warn!(
                "Ignoring checkpoint at layer {}: plan has {} layers",
                checkpoint.current_layer, layer_count
            );
            return 0;
        }

        info!(
            "Resuming session {} at layer {}",
            checkpoint.session_id, checkpoint.current_layer
        );
        run.tdd_results = checkpoint.tdd_results;
        run.subtask_results = checkpoint.subtask_results;
        checkpoint.current_layer
    }

    async fn save_checkpoint(
        &self,
        plan_hash: &str,
        layer: usize,
        run: &RunState,
    ) -> Result<(), PipelineError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let checkpoint = PipelineCheckpoint::at_layer(
            self.config.session_id.clone(),
            plan_hash,
            layer,
            run.subtask_results.clone(),
            run.tdd_results.clone(),
        );
        store.save(&checkpoint).await?;
        debug!("Saved checkpoint at layer {}", layer);
        Ok(())
    }

    /// Run every subtask of a layer concurrently and wait for all of them.
    async fn run_layer(
        &self,
        index: usize,
        layer: &[&Subtask],
        run: &mut RunState,
    ) -> Result<(), PipelineError> {
        for subtask in layer {
            run.subtask_results.insert(
                subtask.id.clone(),
                SubtaskCheckpointResult::running(subtask.agent_type),
            );
        }

        let settled = tokio::select! {
            results = join_all(layer.iter().map(|s| self.run_with_retries(s))) => results,
            _ = self.cancel.cancelled() => {
                warn!("Cancelled while running layer {}", index);
                return Err(PipelineError::Cancelled { layer: index });
            }
        };

        let mut first_failure = None;
        for (subtask, result) in layer.iter().zip(settled) {
            let entry = run
                .subtask_results
                .entry(subtask.id.clone())
                .or_insert_with(|| SubtaskCheckpointResult::running(subtask.agent_type));
            match result {
                Ok(output) => entry.complete(output),
                Err(e) => {
                    error!("Subtask {} failed: {:#}", subtask.id, e);
                    entry.fail(format!("{e:#}"));
                    if first_failure.is_none() {
                        first_failure = Some((subtask.id.clone(), e));
                    }
                }
            }
        }

        match first_failure {
            Some((id, source)) => Err(PipelineError::Subtask { id, source }),
            None => Ok(()),
        }
    }

    async fn run_with_retries(&self, subtask: &Subtask) -> anyhow::Result<Option<String>> {
        let backoff = Duration::from_millis(self.config.subtask_retry_backoff_ms);
        let mut attempt = 0;
        loop {
            attempt += 1;
            debug!("Running subtask {} (attempt {})", subtask.id, attempt);

            match self.runner.run(subtask).await {
                Ok(output) => return Ok(output),
                Err(e) if attempt <= self.config.subtask_retries => {
                    warn!(
                        "Subtask {} failed on attempt {}, retrying: {:#}",
                        subtask.id, attempt, e
                    );
                    if let Some(observer) = &self.observer {
                        observer.on_subtask_retry(subtask, attempt, &e);
                    }
                    if !backoff.is_zero() {
                        tokio::time::sleep(backoff).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn enforce_guard(
        &self,
        phase: GuardPhase,
        index: usize,
        layer: &[&Subtask],
        run: &mut RunState,
    ) -> Result<GuardVerdict, PipelineError> {
        if self.config.tdd_mode == TddMode::Off {
            return Ok(GuardVerdict::Passed);
        }

        let max_attempts = 1 + match phase {
            GuardPhase::Red => self.config.max_red_retries,
            GuardPhase::Green => self.config.max_green_retries,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                result = self.guard.check(phase) => result,
                _ = self.cancel.cancelled() => {
                    return Err(PipelineError::Cancelled { layer: index });
                }
            };
            let passed = result.passed;
            debug!(
                "{} guard attempt {}/{}: exit {}, passed {}",
                phase, attempt, max_attempts, result.test_exit, passed
            );
            run.tdd_results.push(result);

            if passed {
                info!("{} guard passed after layer {}", phase, index);
                return Ok(GuardVerdict::Passed);
            }
            if self.config.tdd_mode == TddMode::Warn {
                warn!("{} guard failed after layer {} (warn mode)", phase, index);
                return Ok(GuardVerdict::Warned);
            }
            if attempt >= max_attempts {
                return Ok(GuardVerdict::Exhausted { attempts: attempt });
            }

            warn!(
                "{} guard failed after layer {}, re-running layer (attempt {}/{})",
                phase, index, attempt, max_attempts
            );
            self.run_layer(index, layer, run).await?;
        }
    }
}

fn verdict_to_result(phase: GuardPhase, verdict: GuardVerdict) -> Result<(), PipelineError> {
    match verdict {
        GuardVerdict::Passed | GuardVerdict::Warned => Ok(()),
        GuardVerdict::Exhausted { attempts } => {
            error!("TDD {} guard failed after {} attempts", phase, attempts);
            Err(PipelineError::GuardFailed { phase, attempts })
        }
    }
}

fn has_agent(layer: &[&Subtask], agent_type: AgentType) -> bool {
    layer.iter().any(|s| s.agent_type == agent_type)
}
