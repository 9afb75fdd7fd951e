//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`], which wires a [`Scheduler`] to an in-memory
//! [`JobStore`], a [`StaticProbe`] and a [`ScriptedConverter`] with
//! millisecond timings so whole lifecycles finish quickly.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use transq::converter::{ConversionRequest, ConvertError, Converter, ProgressSender};
use transq::events::EventBus;
use transq::monitor::{ResourceLimits, ResourceMonitor, ResourceSnapshot, StaticProbe};
use transq::scheduler::RetryPolicy;
use transq::{Scheduler, SchedulerConfig};
use transq_common::{ConversionParams, Job, JobId, JobStatus};
use transq_db::JobStore;

/// What one scripted conversion attempt does.
#[derive(Debug, Clone)]
pub enum Step {
    /// Report each fraction, then succeed.
    Succeed(Vec<f64>),
    /// Fail with the given stderr.
    Fail(String),
    Panic,
    /// Block until cancelled (or ten seconds pass), then report `Cancelled`.
    WaitForCancel,
    /// Report 50% after half the duration, then succeed.
    Sleep(Duration),
}

/// Converter that plays back a list of [`Step`]s, one per call, and then
/// repeats `fallback` forever.
pub struct ScriptedConverter {
    steps: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: AtomicUsize,
    saw_cancel: AtomicBool,
    requests: Mutex<Vec<ConversionRequest>>,
}

impl ScriptedConverter {
    pub fn new(steps: Vec<Step>, fallback: Step) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            fallback,
            calls: AtomicUsize::new(0),
            saw_cancel: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn always(step: Step) -> Self {
        Self::new(Vec::new(), step)
    }

    pub fn succeeding() -> Self {
        Self::always(Step::Succeed(vec![0.5, 1.0]))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn saw_cancel(&self) -> bool {
        self.saw_cancel.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ConversionRequest> {
        self.requests.lock().clone()
    }

    fn next_step(&self) -> Step {
        self.steps
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl Converter for ScriptedConverter {
    async fn convert(
        &self,
        request: &ConversionRequest,
        progress: ProgressSender,
        cancel: CancellationToken,
    ) -> Result<(), ConvertError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        match self.next_step() {
            Step::Succeed(fractions) => {
                for fraction in fractions {
                    let _ = progress.send(fraction);
                    tokio::task::yield_now().await;
                }
                Ok(())
            }
            Step::Fail(stderr) => Err(ConvertError::Exited {
                code: Some(1),
                stderr,
            }),
            Step::Panic => panic!("scripted converter panic"),
            Step::WaitForCancel => {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.saw_cancel.store(true, Ordering::SeqCst);
                        Err(ConvertError::Cancelled)
                    }
                    _ = tokio::time::sleep(Duration::from_secs(10)) => Ok(()),
                }
            }
            Step::Sleep(duration) => {
                tokio::time::sleep(duration / 2).await;
                let _ = progress.send(0.5);
                tokio::time::sleep(duration / 2).await;
                Ok(())
            }
        }
    }
}

/// A host with plenty of headroom.
pub fn roomy_snapshot() -> ResourceSnapshot {
    ResourceSnapshot {
        cpu_percent: 10.0,
        memory_percent: 30.0,
        memory_available_gb: 16.0,
        disk_percent: 40.0,
        disk_free_gb: 500.0,
    }
}

/// A host whose CPU is over every limit.
pub fn busy_snapshot() -> ResourceSnapshot {
    ResourceSnapshot {
        cpu_percent: 95.0,
        ..roomy_snapshot()
    }
}

pub fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        poll_interval: Duration::from_millis(10),
        admission_pause: Duration::from_millis(20),
        shutdown_timeout: Duration::from_millis(500),
        history_limit: 100,
        kill_on_cancel: false,
        retry: RetryPolicy::fixed(Duration::from_millis(10)),
    }
}

pub fn job(id: &str) -> Job {
    Job::new(
        JobId::from(id),
        ConversionParams::new(format!("/in/{id}.mkv"), format!("/out/{id}.mp4")),
    )
}

/// Scheduler wired to in-memory collaborators.
pub struct TestHarness {
    pub scheduler: Scheduler,
    pub store: JobStore,
    pub converter: Arc<ScriptedConverter>,
    pub probe: Arc<StaticProbe>,
    pub events: Arc<EventBus>,
}

impl TestHarness {
    /// One worker, roomy host, fast timings.
    pub fn new(converter: ScriptedConverter) -> Self {
        Self::with_config(fast_config(), converter, 1)
    }

    pub fn with_config(config: SchedulerConfig, converter: ScriptedConverter, workers: usize) -> Self {
        let store = JobStore::in_memory().expect("failed to create in-memory store");
        Self::with_store(config, converter, workers, store)
    }

    pub fn with_store(
        config: SchedulerConfig,
        converter: ScriptedConverter,
        workers: usize,
        store: JobStore,
    ) -> Self {
        let probe = Arc::new(StaticProbe::new(roomy_snapshot()));
        let monitor = ResourceMonitor::new(probe.clone(), ResourceLimits::default());
        let converter = Arc::new(converter);
        let events = Arc::new(EventBus::default());

        let scheduler = Scheduler::with_workers(
            config,
            monitor,
            store.clone(),
            converter.clone(),
            events.clone(),
            workers,
        );

        Self {
            scheduler,
            store,
            converter,
            probe,
            events,
        }
    }

    pub fn submit(&self, job: Job) -> JobId {
        let id = job.id.clone();
        assert!(
            self.scheduler.submit(job).expect("submit failed"),
            "job {id} was rejected as a duplicate"
        );
        id
    }

    /// Poll the scheduler until the job reaches `status`.
    pub async fn wait_for(&self, id: &JobId, status: JobStatus) -> Job {
        let found = wait_until(|| {
            self.scheduler
                .status(id)
                .filter(|job| job.status == status)
        })
        .await;
        found.unwrap_or_else(|| {
            panic!(
                "job {id} never reached {status}, last seen as {:?}",
                self.scheduler.status(id).map(|j| j.status)
            )
        })
    }

    /// Poll the store until the stored row reaches `status`.
    pub async fn wait_for_stored(&self, id: &JobId, status: JobStatus) -> Job {
        wait_until(|| {
            self.store
                .get(id)
                .ok()
                .flatten()
                .filter(|job| job.status == status)
        })
        .await
        .unwrap_or_else(|| panic!("stored job {id} never reached {status}"))
    }
}

/// Call `check` every 10ms for up to five seconds.
pub async fn wait_until<T>(mut check: impl FnMut() -> Option<T>) -> Option<T> {
    for _ in 0..500 {
        if let Some(found) = check() {
            return Some(found);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    None
}

/// Fail the test if `fut` does not finish within `limit`.
pub async fn within<F: Future>(limit: Duration, fut: F) -> F::Output {
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or_else(|_| panic!("did not finish within {limit:?}"))
}

/// Receive events until the terminal one for `id`, returning that job's
/// payloads in order.
pub async fn events_until_terminal(
    rx: &mut tokio::sync::broadcast::Receiver<transq::events::Event>,
    id: &JobId,
) -> Vec<transq::events::EventPayload> {
    within(Duration::from_secs(5), async {
        let mut seen = Vec::new();
        loop {
            let event = rx.recv().await.expect("event bus closed or lagged");
            if event.payload.job_id() != id {
                continue;
            }
            let terminal = event.payload.is_terminal();
            seen.push(event.payload);
            if terminal {
                return seen;
            }
        }
    })
    .await
}
