//! FIFO job queue and dispatcher.
//!
//! Submitted jobs are appended to a job log and their ids to the pending
//! queue. One dispatcher task drains the queue: a job that gets a washing unit
//! runs on its own task, a job that does not goes back to the tail. Priority
//! is recorded on the job but never reorders the queue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::models::{now_millis, Demand, Job, JobEvent, JobId, JobStatus};
use crate::registry::UnitRegistry;
use crate::unit::UnitClaim;

/// Reason recorded on jobs dropped by [`QueueConfig::max_attempts`].
pub const NO_UNIT_AVAILABLE: &str = "no washing unit available";

/// Queue limits and retry pacing.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of pending jobs
    pub max_pending: usize,
    /// How long the dispatcher waits after a failed assignment, unless a unit
    /// frees up first
    pub retry_interval: Duration,
    /// Fail a job after this many failed assignments. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_pending: 256,
            retry_interval: Duration::from_secs(1),
            max_attempts: None,
        }
    }
}

impl QueueConfig {
    #[must_use]
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    #[must_use]
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<JobId>,
    /// Every job ever submitted, indexed by `id - 1`
    jobs: Vec<Job>,
}

impl QueueState {
    fn job_mut(&mut self, id: JobId) -> Option<&mut Job> {
        let index = usize::try_from(id.0).ok()?.checked_sub(1)?;
        self.jobs.get_mut(index)
    }

    fn job(&self, id: JobId) -> Option<&Job> {
        let index = usize::try_from(id.0).ok()?.checked_sub(1)?;
        self.jobs.get(index)
    }
}

/// Job log plus pending queue.
pub struct JobQueue {
    config: QueueConfig,
    registry: Arc<UnitRegistry>,
    state: Mutex<QueueState>,
    submitted: Notify,
    events: broadcast::Sender<JobEvent>,
}

impl JobQueue {
    pub fn new(registry: Arc<UnitRegistry>, config: QueueConfig) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            config,
            registry,
            state: Mutex::new(QueueState::default()),
            submitted: Notify::new(),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Units jobs are dispatched to.
    pub fn registry(&self) -> &Arc<UnitRegistry> {
        &self.registry
    }

    /// Append a job and return it immediately, still pending.
    ///
    /// A demand no unit could ever hold is refused here rather than failed
    /// later by the dispatcher.
    pub fn submit(&self, demand: Demand, priority: i32) -> Result<Job> {
        demand.validate()?;
        self.registry.check_demand(&demand)?;

        let job = {
            let mut state = self.lock();
            if state.pending.len() >= self.config.max_pending {
                return Err(Error::QueueFull(state.pending.len()));
            }
            let id = JobId(state.jobs.len() as u64 + 1);
            let job = Job::new(id, demand, priority);
            state.jobs.push(job.clone());
            state.pending.push_back(id);
            job
        };

        tracing::info!("Accepted {} (priority {})", job.id, job.priority);
        let _ = self.events.send(JobEvent {
            id: job.id,
            status: job.status,
        });
        self.submitted.notify_one();
        Ok(job)
    }

    /// Snapshot of one job.
    pub fn get(&self, id: JobId) -> Option<Job> {
        self.lock().job(id).cloned()
    }

    /// Snapshot of every job, in submission order.
    pub fn list(&self) -> Vec<Job> {
        self.lock().jobs.clone()
    }

    /// Number of jobs waiting for a unit.
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Status changes of every job, from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Wait until `id` reaches a terminal status.
    pub async fn wait_for(&self, id: JobId) -> Result<Job> {
        let mut events = self.events.subscribe();
        loop {
            let job = self.get(id).ok_or_else(|| Error::NotFound(id.to_string()))?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            loop {
                match events.recv().await {
                    Ok(event) if event.id != id => continue,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(Error::NotFound(id.to_string()));
                    }
                }
            }
        }
    }

    /// Apply `update` to a job and publish its new status.
    fn update<F: FnOnce(&mut Job)>(&self, id: JobId, update: F) -> Option<Job> {
        let job = {
            let mut state = self.lock();
            let job = state.job_mut(id)?;
            update(job);
            job.clone()
        };
        let _ = self.events.send(JobEvent {
            id,
            status: job.status,
        });
        Some(job)
    }

    fn next_pending(&self) -> Option<JobId> {
        self.lock().pending.pop_front()
    }

    /// Put a job that found no unit back at the tail, or fail it once out of
    /// attempts. Returns whether it was requeued.
    fn requeue(&self, id: JobId) -> bool {
        let max_attempts = self.config.max_attempts;
        let mut state = self.lock();
        let Some(job) = state.job_mut(id) else {
            return false;
        };
        job.attempts += 1;
        if max_attempts.is_some_and(|max| job.attempts >= max) {
            job.status = JobStatus::Failed;
            job.ended_at = Some(now_millis());
            job.error = Some(NO_UNIT_AVAILABLE.to_string());
            let event = JobEvent {
                id,
                status: job.status,
            };
            drop(state);
            tracing::warn!("{} failed: {}", id, NO_UNIT_AVAILABLE);
            let _ = self.events.send(event);
            return false;
        }
        state.pending.push_back(id);
        true
    }

    /// Mark a job in progress on `claim` and run it on its own task.
    fn start(self: &Arc<Self>, id: JobId, claim: UnitClaim) {
        let unit = claim.unit().name().to_string();
        let Some(job) = self.update(id, |job| {
            job.attempts += 1;
            job.status = JobStatus::InProgress;
            job.started_at = Some(now_millis());
            job.unit = Some(unit.clone());
        }) else {
            return;
        };
        tracing::info!("{} assigned to {}", id, unit);

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let result = claim.run(&job.demand, &queue.registry).await;
            queue.update(id, |job| {
                job.ended_at = Some(now_millis());
                match result {
                    Ok(outcome) => {
                        job.status = JobStatus::Completed;
                        if outcome.delegated_from.is_some() {
                            job.delegated_to = Some(outcome.unit);
                        }
                    }
                    Err(e) => {
                        job.status = JobStatus::Failed;
                        job.error = Some(e.to_string());
                    }
                }
            });
            match queue.get(id) {
                Some(job) if job.status == JobStatus::Completed => tracing::info!("{} completed", id),
                Some(job) => tracing::warn!("{} failed: {}", id, job.error.unwrap_or_default()),
                None => {}
            }
        });
    }

    /// Start the dispatcher task.
    pub fn spawn_dispatcher(self: &Arc<Self>) -> Dispatcher {
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(dispatch_loop(Arc::clone(self), rx));
        Dispatcher { shutdown, handle }
    }
}

/// Handle to the running dispatcher.
pub struct Dispatcher {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Dispatcher {
    /// Stop dispatching. Jobs already running finish on their own.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

async fn dispatch_loop(queue: Arc<JobQueue>, mut shutdown: watch::Receiver<bool>) {
    tracing::debug!("Dispatcher started");

    loop {
        let id = match queue.next_pending() {
            Some(id) => id,
            None => {
                tokio::select! {
                    _ = queue.submitted.notified() => {}
                    _ = shutdown.changed() => break,
                }
                continue;
            }
        };

        if let Some(claim) = queue.registry.claim_idle() {
            queue.start(id, claim);
            continue;
        }

        if queue.requeue(id) {
            tracing::debug!("No idle unit for {}, requeued", id);
        }
        tokio::select! {
            _ = queue.registry.released() => {}
            _ = tokio::time::sleep(queue.config.retry_interval) => {}
            _ = shutdown.changed() => break,
        }
    }

    tracing::debug!("Dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{SupplyRoutes, UnitConfig, WashingUnit};
    use cistern_transfer::ResourceKind;

    fn cycle() -> Duration {
        Duration::from_millis(300)
    }

    fn queue(units: usize, config: QueueConfig) -> Arc<JobQueue> {
        let units = (1..=units)
            .map(|i| {
                WashingUnit::new(
                    format!("washer{}", i),
                    UnitConfig::default().with_cycle(cycle()).with_replenish(false),
                    SupplyRoutes::new(),
                )
            })
            .collect();
        Arc::new(JobQueue::new(Arc::new(UnitRegistry::new(units).unwrap()), config))
    }

    fn water(quantity: u32) -> Demand {
        Demand::new().with(ResourceKind::Water, quantity)
    }

    #[test]
    fn test_submit_assigns_increasing_ids() {
        let queue = queue(1, QueueConfig::default());
        let a = queue.submit(water(10), 1).unwrap();
        let b = queue.submit(water(20), 5).unwrap();

        assert_eq!(a.id, JobId(1));
        assert_eq!(b.id, JobId(2));
        assert_eq!(a.status, JobStatus::Pending);
        assert_eq!(queue.pending_len(), 2);
        assert_eq!(queue.list().iter().map(|j| j.id).collect::<Vec<_>>(), vec![JobId(1), JobId(2)]);
    }

    #[test]
    fn test_get_is_stable_without_mutation() {
        let queue = queue(1, QueueConfig::default());
        let job = queue.submit(water(10), 1).unwrap();
        assert_eq!(queue.get(job.id), queue.get(job.id));
        assert!(queue.get(JobId(99)).is_none());
        assert!(queue.get(JobId(0)).is_none());
    }

    #[test]
    fn test_submit_rejects_invalid_demand() {
        let queue = queue(1, QueueConfig::default());
        assert!(matches!(queue.submit(Demand::new(), 1), Err(Error::InvalidRequest(_))));
        assert!(matches!(queue.submit(water(0), 1), Err(Error::InvalidRequest(_))));
        assert!(matches!(queue.submit(water(u32::MAX), 1), Err(Error::InvalidRequest(_))));
        assert!(queue.list().is_empty());
    }

    #[test]
    fn test_submit_bounded() {
        let queue = queue(1, QueueConfig::default().with_max_pending(2));
        queue.submit(water(10), 1).unwrap();
        queue.submit(water(10), 1).unwrap();
        assert!(matches!(queue.submit(water(10), 1), Err(Error::QueueFull(2))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatches_and_completes() {
        let queue = queue(1, QueueConfig::default());
        let dispatcher = queue.spawn_dispatcher();

        let job = queue.submit(water(20), 1).unwrap();
        let done = queue.wait_for(job.id).await.unwrap();

        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.unit.as_deref(), Some("washer1"));
        assert_eq!(done.attempts, 1);
        assert!(done.started_at.is_some() && done.ended_at.is_some());
        assert!(!dispatcher.is_finished());
        dispatcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_free_unit() {
        let queue = queue(1, QueueConfig::default());
        let dispatcher = queue.spawn_dispatcher();

        let first = queue.submit(water(10), 1).unwrap();
        let second = queue.submit(water(10), 9).unwrap();
        tokio::time::sleep(cycle() / 3).await;

        assert_eq!(queue.get(first.id).unwrap().status, JobStatus::InProgress);
        let waiting = queue.get(second.id).unwrap();
        assert_eq!(waiting.status, JobStatus::Pending);
        assert!(waiting.attempts >= 1);

        let done = queue.wait_for(second.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(queue.get(first.id).unwrap().ended_at <= done.started_at);
        dispatcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_does_not_reorder() {
        let queue = queue(1, QueueConfig::default());
        let low = queue.submit(water(10), 0).unwrap();
        let high = queue.submit(water(10), 100).unwrap();
        let dispatcher = queue.spawn_dispatcher();

        let high = queue.wait_for(high.id).await.unwrap();
        let low = queue.get(low.id).unwrap();
        assert_eq!(low.status, JobStatus::Completed);
        assert!(low.started_at <= high.started_at);
        dispatcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_after_max_attempts() {
        let queue = queue(1, QueueConfig::default().with_max_attempts(Some(2)));
        let _busy = queue.registry().claim_idle().unwrap();
        let dispatcher = queue.spawn_dispatcher();

        let job = queue.submit(water(10), 1).unwrap();
        let done = queue.wait_for(job.id).await.unwrap();

        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.attempts, 2);
        assert_eq!(done.error.as_deref(), Some(NO_UNIT_AVAILABLE));
        assert_eq!(queue.pending_len(), 0);
        dispatcher.stop().await;
    }

    #[test]
    fn test_submit_rejects_demand_beyond_every_ceiling() {
        let queue = queue(2, QueueConfig::default());

        // 90 water can never fit an 80 reserve.
        let err = queue.submit(water(90), 1).unwrap_err();
        assert!(matches!(&err, Error::InvalidRequest(msg) if msg.contains("reserve ceiling")));
        assert!(queue.list().is_empty());
        assert_eq!(queue.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unit_failure_is_terminal() {
        let queue = queue(1, QueueConfig::default());
        let dispatcher = queue.spawn_dispatcher();

        // Without suppliers the second job finds the reserve empty.
        let first = queue.submit(water(80), 1).unwrap();
        let second = queue.submit(water(80), 1).unwrap();
        assert_eq!(queue.wait_for(first.id).await.unwrap().status, JobStatus::Completed);
        let done = queue.wait_for(second.id).await.unwrap();

        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.error.unwrap().contains("washer1 short 80 water"));
        assert_eq!(queue.pending_len(), 0);
        dispatcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_sees_lifecycle() {
        let queue = queue(1, QueueConfig::default());
        let mut events = queue.subscribe();
        let dispatcher = queue.spawn_dispatcher();

        let job = queue.submit(water(10), 1).unwrap();
        let mut seen = Vec::new();
        while let Ok(event) = events.recv().await {
            assert_eq!(event.id, job.id);
            seen.push(event.status);
            if event.status.is_terminal() {
                break;
            }
        }

        assert_eq!(seen, vec![JobStatus::Pending, JobStatus::InProgress, JobStatus::Completed]);
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_wait_for_unknown_job() {
        let queue = queue(1, QueueConfig::default());
        assert!(matches!(queue.wait_for(JobId(5)).await, Err(Error::NotFound(_))));
    }
}
