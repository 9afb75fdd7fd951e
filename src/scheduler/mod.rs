//! The job scheduler.
//!
//! A [`Scheduler`] owns a fixed pool of worker tasks, an in-memory table of
//! active jobs (pending, running or cooling down before a retry) and a
//! bounded table of finished ones. Every lifecycle transition is applied to
//! the in-memory job under the table lock and written to the [`JobStore`]
//! after the lock is released. Writes carry a per-job revision, so a state
//! that loses a race to a newer one is never stored over it. The in-memory
//! tables stay authoritative when a store write fails.
//!
//! ```text
//! Pending -> Running -> Completed
//!                    -> Failed
//!                    -> Retrying -> Pending
//! Pending | Running | Retrying -> Cancelled
//! ```

mod queue;
mod retry;
mod worker;

pub use retry::{Backoff, RetryPolicy, DEFAULT_COOLDOWN};

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use transq_common::{
    Error, Job, JobDefaults, JobId, JobStatus, Result, SubmitRequest, SubmitResponse,
};
use transq_db::JobStore;

use crate::converter::Converter;
use crate::events::{Event, EventBus, EventPayload};
use crate::monitor::{ResourceMonitor, ResourceSnapshot};

use queue::PendingQueue;

/// Timing and retention settings for a [`Scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Longest a worker waits on an empty queue before rechecking shutdown.
    pub poll_interval: Duration,
    /// Pause after a job was denied admission.
    pub admission_pause: Duration,
    /// How long [`Scheduler::shutdown`] waits for workers to stop.
    pub shutdown_timeout: Duration,
    /// Finished jobs kept in memory; the oldest are evicted first.
    pub history_limit: usize,
    /// Kill the running conversion when its job is cancelled.
    pub kill_on_cancel: bool,
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            admission_pause: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
            history_limit: 1000,
            kill_on_cancel: false,
            retry: RetryPolicy::default(),
        }
    }
}

/// Aggregate view of the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub queued_count: usize,
    pub running_count: usize,
    /// Finished jobs still held in memory.
    pub completed_count: usize,
    pub resource_snapshot: ResourceSnapshot,
    pub can_admit: bool,
    pub optimal_concurrency: usize,
    pub workers: usize,
}

struct ActiveJob {
    job: Job,
    cancel: CancellationToken,
    /// Whole percent last written to the store.
    persisted_percent: u32,
    /// Transitions applied so far.
    revision: u64,
    /// Revision last written to the store, shared with in-flight writes.
    written: Arc<Mutex<u64>>,
}

impl ActiveJob {
    fn new(job: Job) -> Self {
        Self {
            job,
            cancel: CancellationToken::new(),
            persisted_percent: 0,
            revision: 0,
            written: Arc::new(Mutex::new(0)),
        }
    }

    /// Capture the current state for writing once the table lock is released.
    fn record(&mut self) -> StoreWrite {
        self.revision += 1;
        StoreWrite {
            job: self.job.clone(),
            revision: self.revision,
            written: Arc::clone(&self.written),
        }
    }
}

/// One job state headed for the store.
struct StoreWrite {
    job: Job,
    revision: u64,
    written: Arc<Mutex<u64>>,
}

#[derive(Default)]
struct JobTables {
    active: HashMap<JobId, ActiveJob>,
    finished: HashMap<JobId, Job>,
    finished_order: VecDeque<JobId>,
}

impl JobTables {
    fn is_tracked(&self, id: &JobId) -> bool {
        self.active.contains_key(id) || self.finished.contains_key(id)
    }

    fn finish(&mut self, job: Job, limit: usize) {
        while self.finished_order.len() >= limit.max(1) {
            match self.finished_order.pop_front() {
                Some(oldest) => {
                    self.finished.remove(&oldest);
                }
                None => break,
            }
        }
        self.finished_order.push_back(job.id.clone());
        self.finished.insert(job.id.clone(), job);
    }
}

/// What a worker should do after a failed attempt.
pub(crate) enum AfterFailure {
    Retry { delay: Duration },
    Failed,
    /// The job was cancelled while the attempt ran.
    Dropped,
}

/// State shared between the [`Scheduler`] handle and its workers.
pub(crate) struct Shared {
    config: SchedulerConfig,
    monitor: ResourceMonitor,
    store: JobStore,
    converter: Arc<dyn Converter>,
    events: Arc<EventBus>,
    queue: PendingQueue,
    tables: Mutex<JobTables>,
    shutdown: CancellationToken,
}

impl Shared {
    /// Write a captured state unless a later one for the same job already
    /// reached the store. Never called with the table lock held.
    fn persist(&self, write: StoreWrite) -> Result<()> {
        let mut written = write.written.lock();
        if write.revision <= *written {
            debug!(job_id = %write.job.id, revision = write.revision, "Skipping superseded store write");
            return Ok(());
        }
        self.store
            .upsert(&write.job)
            .inspect_err(|e| {
                error!(job_id = %write.job.id, status = %write.job.status, error = %e, "Failed to persist job");
            })?;
        *written = write.revision;
        Ok(())
    }

    fn is_pending(&self, id: &JobId) -> bool {
        self.tables
            .lock()
            .active
            .get(id)
            .is_some_and(|entry| entry.job.status == JobStatus::Pending)
    }

    /// Put a job that was denied admission back at the tail of the queue,
    /// unless it was cancelled in the meantime.
    fn defer(&self, id: &JobId) {
        let tables = self.tables.lock();
        if tables
            .active
            .get(id)
            .is_some_and(|entry| entry.job.status == JobStatus::Pending)
        {
            self.queue.push(id.clone());
        }
    }

    /// Pending -> Running. `None` if the job is no longer waiting.
    fn begin(&self, id: &JobId) -> Option<(Job, CancellationToken)> {
        let (write, cancel) = {
            let mut tables = self.tables.lock();
            let entry = tables.active.get_mut(id)?;
            if entry.job.status != JobStatus::Pending {
                return None;
            }
            entry.job.start();
            entry.persisted_percent = 0;
            (entry.record(), entry.cancel.clone())
        };

        let job = write.job.clone();
        let _ = self.persist(write);
        self.events.broadcast(EventPayload::JobStarted {
            job_id: id.clone(),
            attempt: job.retry_count + 1,
        });
        Some((job, cancel))
    }

    /// Apply a converter progress report, in percent.
    fn record_progress(&self, id: &JobId, percent: f64) {
        let (progress, write) = {
            let mut tables = self.tables.lock();
            let Some(entry) = tables.active.get_mut(id) else {
                return;
            };
            if !entry.job.record_progress(percent) {
                return;
            }
            let whole = entry.job.progress.floor() as u32;
            let write = if whole > entry.persisted_percent {
                entry.persisted_percent = whole;
                Some(entry.record())
            } else {
                None
            };
            (entry.job.progress, write)
        };

        if let Some(write) = write {
            let _ = self.persist(write);
        }
        self.events.broadcast(EventPayload::JobProgress {
            job_id: id.clone(),
            progress,
        });
    }

    fn complete(&self, id: &JobId) {
        let write = {
            let mut tables = self.tables.lock();
            let Some(mut entry) = tables.active.remove(id) else {
                debug!(job_id = %id, "Job left the active table during conversion, discarding result");
                return;
            };
            entry.job.complete();
            let write = entry.record();
            tables.finish(entry.job, self.config.history_limit);
            write
        };

        let _ = self.persist(write);
        info!(job_id = %id, "Job completed");
        self.events
            .broadcast(EventPayload::JobCompleted { job_id: id.clone() });
    }

    fn fail_attempt(&self, id: &JobId, message: &str) -> AfterFailure {
        let mut tables = self.tables.lock();
        let Some(entry) = tables.active.get_mut(id) else {
            debug!(job_id = %id, error = message, "Job left the active table during conversion, ignoring failure");
            return AfterFailure::Dropped;
        };

        if entry.job.can_retry() {
            entry.job.mark_retrying(message);
            let write = entry.record();
            let (retry_count, max_retries) = (entry.job.retry_count, entry.job.max_retries);
            drop(tables);
            let _ = self.persist(write);

            let delay = self.config.retry.delay_for(retry_count);
            warn!(
                job_id = %id,
                retry_count,
                max_retries,
                delay_ms = delay.as_millis() as u64,
                error = message,
                "Conversion failed, will retry"
            );
            self.events.broadcast(EventPayload::JobRetrying {
                job_id: id.clone(),
                retry_count,
                max_retries,
                error: message.to_string(),
            });
            AfterFailure::Retry { delay }
        } else {
            let Some(mut entry) = tables.active.remove(id) else {
                return AfterFailure::Dropped;
            };
            entry.job.fail(message);
            let write = entry.record();
            let retries = entry.job.retry_count;
            tables.finish(entry.job, self.config.history_limit);
            drop(tables);
            let _ = self.persist(write);

            error!(job_id = %id, retries, error = message, "Job failed");
            self.events.broadcast(EventPayload::JobFailed {
                job_id: id.clone(),
                error: message.to_string(),
            });
            AfterFailure::Failed
        }
    }

    /// Retrying -> Pending and back onto the queue. `false` if the job was
    /// cancelled during the cooldown.
    fn requeue(&self, id: &JobId) -> bool {
        let write = {
            let mut tables = self.tables.lock();
            let Some(entry) = tables.active.get_mut(id) else {
                return false;
            };
            entry.job.requeue();
            let write = entry.record();
            self.queue.push(id.clone());
            write
        };
        let _ = self.persist(write);
        true
    }

    /// Trip the cancellation token of every running job.
    fn kill_running(&self) -> usize {
        let tables = self.tables.lock();
        let mut killed = 0;
        for entry in tables.active.values() {
            if entry.job.status == JobStatus::Running {
                entry.cancel.cancel();
                killed += 1;
            }
        }
        killed
    }
}

/// Handle to a running worker pool. Dropping it signals the workers to stop.
pub struct Scheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl Scheduler {
    /// Start a pool sized from one resource sample taken now. The pool is
    /// never resized afterwards.
    pub async fn start(
        config: SchedulerConfig,
        monitor: ResourceMonitor,
        store: JobStore,
        converter: Arc<dyn Converter>,
        events: Arc<EventBus>,
    ) -> Self {
        let snapshot = monitor.sample().await;
        let cores = num_cpus::get();
        let workers = monitor.optimal_concurrency(&snapshot, cores);
        info!(
            workers,
            cores,
            cpu_percent = snapshot.cpu_percent,
            "Sized worker pool from current load"
        );
        Self::with_workers(config, monitor, store, converter, events, workers)
    }

    /// Start a pool with exactly `workers` workers (at least one).
    pub fn with_workers(
        config: SchedulerConfig,
        monitor: ResourceMonitor,
        store: JobStore,
        converter: Arc<dyn Converter>,
        events: Arc<EventBus>,
        workers: usize,
    ) -> Self {
        let shared = Arc::new(Shared {
            config,
            monitor,
            store,
            converter,
            events,
            queue: PendingQueue::new(),
            tables: Mutex::new(JobTables::default()),
            shutdown: CancellationToken::new(),
        });

        let worker_count = workers.max(1);
        let handles = (0..worker_count)
            .map(|worker_id| tokio::spawn(worker::run(Arc::clone(&shared), worker_id)))
            .collect();

        Self {
            shared,
            workers: Mutex::new(handles),
            worker_count,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    /// Queue a pending job.
    ///
    /// Returns `Ok(false)` without touching anything when a job with the
    /// same id is active or still in the finished table. If the store write
    /// fails the job stays queued and the error is returned. Once
    /// [`shutdown`](Self::shutdown) has been called nothing is accepted.
    pub fn submit(&self, job: Job) -> Result<bool> {
        if job.status != JobStatus::Pending {
            return Err(Error::invalid_input(format!(
                "job {} must be pending to be submitted, found {}",
                job.id, job.status
            )));
        }

        let id = job.id.clone();
        let write = {
            let mut tables = self.shared.tables.lock();
            if self.shared.shutdown.is_cancelled() {
                return Err(Error::internal(format!(
                    "scheduler is shut down, job {id} not accepted"
                )));
            }
            if tables.is_tracked(&id) {
                debug!(job_id = %id, "Duplicate submission ignored");
                return Ok(false);
            }
            let mut entry = ActiveJob::new(job);
            let write = entry.record();
            tables.active.insert(id.clone(), entry);
            self.shared.queue.push(id.clone());
            write
        };

        let persisted = self.shared.persist(write);
        info!(job_id = %id, "Job queued");
        self.shared
            .events
            .broadcast(EventPayload::JobQueued { job_id: id });
        persisted.map(|()| true)
    }

    /// Build a job from `request`, filling omitted settings from `defaults`,
    /// and submit it.
    pub fn submit_request(
        &self,
        request: SubmitRequest,
        defaults: &JobDefaults,
    ) -> Result<SubmitResponse> {
        let job = request.into_job(defaults)?;
        let job_id = job.id.clone();
        let accepted = self.submit(job)?;
        Ok(SubmitResponse { job_id, accepted })
    }

    /// Cancel an active job. Returns `Ok(false)` for unknown or finished ids.
    ///
    /// A running conversion keeps going unless `kill_on_cancel` is set; its
    /// eventual result is discarded either way.
    pub fn cancel(&self, id: &JobId) -> Result<bool> {
        let (write, previous) = {
            let mut tables = self.shared.tables.lock();
            let Some(mut entry) = tables.active.remove(id) else {
                return Ok(false);
            };
            let previous = entry.job.status;
            entry.job.cancel();
            self.shared.queue.remove(id);
            if self.shared.config.kill_on_cancel {
                entry.cancel.cancel();
            }
            let write = entry.record();
            tables.finish(entry.job, self.shared.config.history_limit);
            (write, previous)
        };

        let persisted = self.shared.persist(write);
        info!(job_id = %id, previous = %previous, "Job cancelled");
        self.shared
            .events
            .broadcast(EventPayload::JobCancelled { job_id: id.clone() });
        persisted.map(|()| true)
    }

    /// Current state of a job: active table first, then finished.
    pub fn status(&self, id: &JobId) -> Option<Job> {
        let tables = self.shared.tables.lock();
        tables
            .active
            .get(id)
            .map(|entry| entry.job.clone())
            .or_else(|| tables.finished.get(id).cloned())
    }

    /// Re-submit a job found in flight by [`JobStore::reconcile_interrupted`].
    ///
    /// Jobs that were waiting go back to the queue as they were. A job that
    /// was mid-conversion counts the interrupted attempt as a failure and is
    /// only queued if it has retries left.
    pub fn resume(&self, mut job: Job) -> Result<bool> {
        match job.status {
            JobStatus::Pending | JobStatus::Retrying => {}
            JobStatus::Running if job.can_retry() => {
                job.mark_retrying(transq_db::store::INTERRUPTED_MESSAGE);
            }
            _ => return Ok(false),
        }
        job.requeue();
        job.completed_at = None;
        self.submit(job)
    }

    pub async fn queue_status(&self) -> QueueStatus {
        let snapshot = self.shared.monitor.sample().await;
        let (running_count, completed_count) = {
            let tables = self.shared.tables.lock();
            let running = tables
                .active
                .values()
                .filter(|entry| entry.job.status == JobStatus::Running)
                .count();
            (running, tables.finished.len())
        };

        QueueStatus {
            queued_count: self.shared.queue.len(),
            running_count,
            completed_count,
            can_admit: self.shared.monitor.can_admit(&snapshot),
            optimal_concurrency: self
                .shared
                .monitor
                .optimal_concurrency(&snapshot, num_cpus::get()),
            resource_snapshot: snapshot,
            workers: self.worker_count,
        }
    }

    /// Stop the workers, waiting up to the configured timeout.
    ///
    /// Workers busy with a conversion past the deadline are aborted and
    /// their conversions killed; those jobs are picked up again by
    /// reconciliation on the next start.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let handles = std::mem::take(&mut *self.workers.lock());
        if handles.is_empty() {
            return;
        }
        info!(workers = handles.len(), "Stopping workers");

        let deadline = tokio::time::Instant::now() + self.shared.config.shutdown_timeout;
        let mut stragglers = 0;
        for handle in handles {
            let abort = handle.abort_handle();
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Worker ended abnormally"),
                Err(_) => {
                    abort.abort();
                    stragglers += 1;
                }
            }
        }

        if stragglers > 0 {
            let killed = self.shared.kill_running();
            warn!(stragglers, killed, "Workers did not stop in time and were aborted");
        } else {
            info!("All workers stopped");
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}
