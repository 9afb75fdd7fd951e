//! Wiring a [`Scheduler`] from a [`Config`] and recovering work left by a
//! previous process.

use std::sync::Arc;
use tracing::{info, warn};
use transq_common::Result;
use transq_db::JobStore;

use crate::config::Config;
use crate::converter::Converter;
use crate::events::EventBus;
use crate::monitor::ResourceMonitor;
use crate::scheduler::Scheduler;

/// Build the monitor described by `config` and start a scheduler on it.
pub async fn start_scheduler(
    config: &Config,
    store: JobStore,
    converter: Arc<dyn Converter>,
    events: Arc<EventBus>,
) -> Scheduler {
    let monitor = ResourceMonitor::system(config.resources.clone(), &config.storage.output_dir);
    let scheduler_config = config.scheduler.to_scheduler_config();

    match config.scheduler.workers {
        Some(workers) => {
            info!(workers, "Using configured worker count");
            Scheduler::with_workers(scheduler_config, monitor, store, converter, events, workers)
        }
        None => Scheduler::start(scheduler_config, monitor, store, converter, events).await,
    }
}

/// Outcome of startup reconciliation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Recovery {
    /// Jobs found pending, running or retrying in the store.
    pub interrupted: usize,
    /// Jobs handed back to the scheduler.
    pub resumed: usize,
}

/// Fail every job a previous process left in flight and, when `resume` is
/// set, hand the ones that still have attempts left back to `scheduler`.
pub fn recover_interrupted(store: &JobStore, scheduler: &Scheduler, resume: bool) -> Result<Recovery> {
    let interrupted = store.reconcile_interrupted()?;
    let mut recovery = Recovery {
        interrupted: interrupted.len(),
        resumed: 0,
    };
    if !resume {
        return Ok(recovery);
    }

    for job in interrupted {
        let id = job.id.clone();
        match scheduler.resume(job) {
            Ok(true) => recovery.resumed += 1,
            Ok(false) => info!(job_id = %id, "Interrupted job has no retries left"),
            Err(e) => warn!(job_id = %id, error = %e, "Failed to resume interrupted job"),
        }
    }
    Ok(recovery)
}
