//! Subtask runners.
//!
//! [`SubtaskRunner`] is what the pipeline manager calls for each subtask.
//! [`ScheduledRunner`] adapts a [`GrantedRunner`] into one by first winning
//! an inference slot from a shared [`ResourceScheduler`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ao_core::{SchedulerState, SchedulerTask, Subtask};
use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::scheduler::{ResourceScheduler, ScheduleDecision, SlotGrant};

/// Executes one subtask.
#[async_trait]
pub trait SubtaskRunner: Send + Sync {
    /// Run the subtask, returning optional output for the checkpoint.
    async fn run(&self, subtask: &Subtask) -> anyhow::Result<Option<String>>;
}

/// Executes one subtask on an already granted slot.
#[async_trait]
pub trait GrantedRunner: Send + Sync {
    /// Run the subtask against the granted host/model endpoint.
    async fn run(&self, subtask: &Subtask, grant: &SlotGrant) -> anyhow::Result<Option<String>>;
}

/// Default number of full `retry_after` waits before a subtask gives up.
pub const DEFAULT_MAX_WAIT_ATTEMPTS: u32 = 20;

/// Scheduler plus the tasks currently waiting on it.
struct Broker {
    scheduler: ResourceScheduler,
    queue: Vec<SchedulerTask>,
    /// Grants won on behalf of another waiter, not yet picked up
    granted: HashMap<String, SlotGrant>,
}

impl Broker {
    fn dequeue(&mut self, task_id: &str) {
        self.queue.retain(|t| t.id != task_id);
    }

    async fn abandon(&mut self, task_id: &str, held: Option<SlotGrant>) {
        self.dequeue(task_id);
        let parked = self.granted.remove(task_id);
        if held.is_none() && parked.is_none() {
            self.scheduler.forget(task_id).await;
        }
        for grant in held.iter().chain(parked.iter()) {
            self.scheduler.release_grant(grant).await;
        }
    }
}

/// Runs subtasks only once the scheduler grants them a slot.
///
/// Every concurrent `run` call joins one shared queue so lookahead and
/// starvation accounting see all waiters. A grant won for a different waiter
/// is parked until that waiter picks it up. Slots are always released after
/// the inner runner settles.
pub struct ScheduledRunner<R> {
    inner: R,
    broker: Arc<Mutex<Broker>>,
    released: Arc<Notify>,
    max_wait_attempts: u32,
}

impl<R: GrantedRunner> ScheduledRunner<R> {
    /// Wrap `inner` with slot scheduling.
    pub fn new(scheduler: ResourceScheduler, inner: R) -> Self {
        Self {
            inner,
            broker: Arc::new(Mutex::new(Broker {
                scheduler,
                queue: Vec::new(),
                granted: HashMap::new(),
            })),
            released: Arc::new(Notify::new()),
            max_wait_attempts: DEFAULT_MAX_WAIT_ATTEMPTS,
        }
    }

    /// Give up on a subtask after this many full `retry_after` waits.
    pub fn with_max_wait_attempts(mut self, attempts: u32) -> Self {
        self.max_wait_attempts = attempts;
        self
    }

    /// Current scheduler counters.
    pub async fn snapshot(&self) -> SchedulerState {
        self.broker.lock().await.scheduler.snapshot()
    }

    async fn acquire(&self, reservation: &mut Reservation) -> anyhow::Result<SlotGrant> {
        let task = reservation.task.clone();
        self.broker.lock().await.queue.push(task.clone());

        // only full retry waits count, not wakeups from other releases
        let mut timed_out = 0;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let retry_after = {
                let mut broker = self.broker.lock().await;
                if let Some(grant) = broker.granted.remove(&task.id) {
                    return Ok(grant);
                }

                let decision = {
                    let Broker {
                        scheduler, queue, ..
                    } = &mut *broker;
                    scheduler.schedule(queue.as_slice()).await
                };
                match decision {
                    ScheduleDecision::Granted(grant) => {
                        broker.dequeue(&grant.task_id);
                        if grant.task_id == task.id {
                            return Ok(grant);
                        }
                        debug!("Parking slot grant for waiting task {}", grant.task_id);
                        broker.granted.insert(grant.task_id.clone(), grant);
                        self.released.notify_waiters();
                        continue;
                    }
                    ScheduleDecision::NoSlots { retry_after } => {
                        if timed_out >= self.max_wait_attempts {
                            broker.dequeue(&task.id);
                            broker.scheduler.forget(&task.id).await;
                            reservation.armed = false;
                            anyhow::bail!(
                                "no {} slot for subtask {} after {} waits",
                                task.agent_type,
                                task.id,
                                self.max_wait_attempts
                            );
                        }
                        retry_after
                    }
                }
            };

            warn!(
                "vram.slot.waiting: subtask {} ({}) waiting {}s for a slot",
                task.id, task.agent_type, retry_after
            );
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(Duration::from_secs(retry_after)) => timed_out += 1,
            }
        }
    }
}

#[async_trait]
impl<R: GrantedRunner> SubtaskRunner for ScheduledRunner<R> {
    async fn run(&self, subtask: &Subtask) -> anyhow::Result<Option<String>> {
        let mut reservation = Reservation {
            broker: self.broker.clone(),
            released: self.released.clone(),
            task: SchedulerTask::from(subtask),
            grant: None,
            armed: true,
        };

        let grant = self.acquire(&mut reservation).await?;
        reservation.grant = Some(grant.clone());
        debug!(
            "Running subtask {} on {} via {}",
            subtask.id, grant.host, grant.endpoint
        );

        let result = self.inner.run(subtask, &grant).await;

        reservation.armed = false;
        self.broker.lock().await.scheduler.release_grant(&grant).await;
        self.released.notify_waiters();

        result
    }
}

/// Returns queue entries and slots of a `run` future dropped mid-flight.
struct Reservation {
    broker: Arc<Mutex<Broker>>,
    released: Arc<Notify>,
    task: SchedulerTask,
    grant: Option<SlotGrant>,
    armed: bool,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let broker = self.broker.clone();
        let released = self.released.clone();
        let task_id = std::mem::take(&mut self.task.id);
        let held = self.grant.take();
        handle.spawn(async move {
            broker.lock().await.abandon(&task_id, held).await;
            released.notify_waiters();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ao_core::{AgentType, AgentTypeConfig, ConcurrencyConfig, HostConfig, ModelConfig};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn scheduler(max_slots: u32) -> ResourceScheduler {
        let mut models = BTreeMap::new();
        models.insert(
            "qwen3-coder-30b".to_string(),
            ModelConfig {
                endpoint: "http://gpu-1:8081/v1".to_string(),
                vram_gb: 18.0,
                max_slots,
            },
        );
        let mut hosts = BTreeMap::new();
        hosts.insert(
            "gpu-1".to_string(),
            HostConfig {
                address: "gpu-1".to_string(),
                models,
            },
        );
        let mut agent_types = BTreeMap::new();
        for name in ["tester", "developer"] {
            agent_types.insert(
                name.to_string(),
                AgentTypeConfig {
                    model: "qwen3-coder-30b".to_string(),
                    max_concurrent_per_host: None,
                },
            );
        }
        ResourceScheduler::new(
            hosts,
            agent_types,
            ConcurrencyConfig::default().with_retry_backoff(5),
        )
        .await
    }

    #[derive(Default)]
    struct SlowRunner {
        running: AtomicUsize,
        peak: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl GrantedRunner for SlowRunner {
        async fn run(&self, subtask: &Subtask, grant: &SlotGrant) -> anyhow::Result<Option<String>> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(2)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("agent crashed");
            }
            Ok(Some(format!("{} on {}", subtask.id, grant.endpoint)))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_slot_serializes_subtasks() {
        let runner = ScheduledRunner::new(scheduler(1).await, SlowRunner::default());
        let a = Subtask::new("subtask-0", AgentType::Tester, "write tests");
        let b = Subtask::new("subtask-1", AgentType::Tester, "write more tests");

        let (ra, rb) = tokio::join!(runner.run(&a), runner.run(&b));

        assert_eq!(ra.unwrap().as_deref(), Some("subtask-0 on http://gpu-1:8081/v1"));
        assert_eq!(rb.unwrap().as_deref(), Some("subtask-1 on http://gpu-1:8081/v1"));
        assert_eq!(runner.inner.peak.load(Ordering::SeqCst), 1);

        let snap = runner.snapshot().await;
        assert_eq!(snap.used_slots["gpu-1"]["qwen3-coder-30b"], 0);
        assert!(snap.skip_counts.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_slots_run_in_parallel() {
        let runner = ScheduledRunner::new(scheduler(2).await, SlowRunner::default());
        let a = Subtask::new("subtask-0", AgentType::Developer, "implement");
        let b = Subtask::new("subtask-1", AgentType::Developer, "implement more");

        let (ra, rb) = tokio::join!(runner.run(&a), runner.run(&b));
        assert!(ra.is_ok() && rb.is_ok());
        assert_eq!(runner.inner.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_released_after_failure() {
        let runner = ScheduledRunner::new(
            scheduler(1).await,
            SlowRunner {
                fail: true,
                ..Default::default()
            },
        );
        let a = Subtask::new("subtask-0", AgentType::Developer, "implement");

        let err = runner.run(&a).await.unwrap_err();
        assert!(err.to_string().contains("agent crashed"));
        assert_eq!(runner.snapshot().await.used_slots["gpu-1"]["qwen3-coder-30b"], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_many_waiters_share_one_slot() {
        let runner = ScheduledRunner::new(scheduler(1).await, SlowRunner::default())
            .with_max_wait_attempts(2);
        let subtasks: Vec<_> = (0..40)
            .map(|i| Subtask::new(format!("t{i}"), AgentType::Tester, "write tests"))
            .collect();

        let results = futures::future::join_all(subtasks.iter().map(|s| runner.run(s))).await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(runner.inner.peak.load(Ordering::SeqCst), 1);
        let snap = runner.snapshot().await;
        assert_eq!(snap.used_slots["gpu-1"]["qwen3-coder-30b"], 0);
        assert!(snap.skip_counts.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_waiter_leaves_no_skip_count() {
        let runner = ScheduledRunner::new(scheduler(1).await, SlowRunner::default());
        let first = Subtask::new("t1", AgentType::Tester, "write tests");
        let second = Subtask::new("t2", AgentType::Tester, "write tests");
        let dropped = Subtask::new("t3", AgentType::Tester, "write tests");

        let (a, b, c) = tokio::join!(
            runner.run(&first),
            runner.run(&second),
            tokio::time::timeout(Duration::from_secs(3), runner.run(&dropped)),
        );
        assert!(a.is_ok() && b.is_ok());
        assert!(c.is_err());

        // let the cleanup task run
        tokio::time::sleep(Duration::from_millis(1)).await;
        let snap = runner.snapshot().await;
        assert!(!snap.skip_counts.contains_key("t3"));
        assert_eq!(snap.used_slots["gpu-1"]["qwen3-coder-30b"], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unplaceable_subtask_gives_up() {
        let runner = ScheduledRunner::new(scheduler(1).await, SlowRunner::default())
            .with_max_wait_attempts(3);
        let reviewer = Subtask::new("subtask-2", AgentType::Reviewer, "review");

        let err = runner.run(&reviewer).await.unwrap_err();
        assert!(err.to_string().contains("after 3 waits"));
        assert!(runner.snapshot().await.skip_counts.is_empty());
        assert_eq!(runner.inner.peak.load(Ordering::SeqCst), 0);
    }
}
