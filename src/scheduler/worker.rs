//! Worker loop.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use transq_common::{Job, JobId};

use super::{AfterFailure, Shared};
use crate::converter::{progress_channel, ConversionRequest};

pub(super) async fn run(shared: Arc<Shared>, worker_id: usize) {
    debug!(worker_id, "Worker started");

    while !shared.shutdown.is_cancelled() {
        let Some(id) = shared.queue.pop(shared.config.poll_interval).await else {
            continue;
        };

        // Cancelled while it sat in the queue.
        if !shared.is_pending(&id) {
            continue;
        }

        let snapshot = shared.monitor.sample().await;
        let admission = shared.monitor.admission(&snapshot);
        if !admission.is_admitted() {
            debug!(worker_id, job_id = %id, reason = %admission, "Host busy, job goes back in line");
            shared.defer(&id);
            if pause(&shared, shared.config.admission_pause).await {
                break;
            }
            continue;
        }

        // Shutdown may have arrived while the job was popped and sampled.
        if shared.shutdown.is_cancelled() {
            shared.defer(&id);
            break;
        }

        process(&shared, worker_id, &id).await;
    }

    debug!(worker_id, "Worker stopped");
}

/// Sleep unless shutdown comes first. Returns `true` on shutdown.
async fn pause(shared: &Shared, duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shared.shutdown.cancelled() => true,
    }
}

async fn process(shared: &Shared, worker_id: usize, id: &JobId) {
    let Some((job, cancel)) = shared.begin(id) else {
        return;
    };
    info!(worker_id, job_id = %id, attempt = job.retry_count + 1, "Starting conversion");

    let outcome = convert(shared, job, cancel).await;
    let message = match outcome {
        Ok(()) => {
            shared.complete(id);
            return;
        }
        Err(message) => message,
    };

    if let AfterFailure::Retry { delay } = shared.fail_attempt(id, &message) {
        if pause(shared, delay).await {
            debug!(job_id = %id, "Shutdown during retry cooldown");
            return;
        }
        if !shared.requeue(id) {
            debug!(job_id = %id, "Job cancelled during retry cooldown");
        }
    }
}

/// Run the converter in its own task so a panic fails the attempt rather
/// than the worker, relaying progress as it arrives.
async fn convert(shared: &Shared, job: Job, cancel: CancellationToken) -> Result<(), String> {
    let (tx, mut rx) = progress_channel();
    let converter = Arc::clone(&shared.converter);
    let request = ConversionRequest::from(&job);
    let mut task = tokio::spawn(async move { converter.convert(&request, tx, cancel).await });

    let joined = loop {
        tokio::select! {
            biased;
            Some(fraction) = rx.recv() => shared.record_progress(&job.id, fraction * 100.0),
            joined = &mut task => break joined,
        }
    };
    while let Ok(fraction) = rx.try_recv() {
        shared.record_progress(&job.id, fraction * 100.0);
    }

    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) if e.is_panic() => Err(format!(
            "converter panicked: {}",
            panic_message(e.into_panic())
        )),
        Err(e) => Err(format!("converter task failed: {e}")),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
