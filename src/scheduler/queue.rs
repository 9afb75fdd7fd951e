//! FIFO of job ids waiting for a worker.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Notify;
use transq_common::JobId;

#[derive(Default)]
pub(crate) struct PendingQueue {
    items: Mutex<VecDeque<JobId>>,
    notify: Notify,
}

impl PendingQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append to the tail and wake one waiting worker.
    pub(crate) fn push(&self, id: JobId) {
        self.items.lock().push_back(id);
        self.notify.notify_one();
    }

    pub(crate) fn try_pop(&self) -> Option<JobId> {
        self.items.lock().pop_front()
    }

    /// Take the head, waiting at most `wait` for something to arrive.
    pub(crate) async fn pop(&self, wait: Duration) -> Option<JobId> {
        if let Some(id) = self.try_pop() {
            return Some(id);
        }

        // Register interest before the second check so a push in between
        // is not missed.
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(id) = self.try_pop() {
            return Some(id);
        }

        let _ = tokio::time::timeout(wait, notified).await;
        self.try_pop()
    }

    /// Drop every occurrence of `id`. Returns whether any was present.
    pub(crate) fn remove(&self, id: &JobId) -> bool {
        let mut items = self.items.lock();
        let before = items.len();
        items.retain(|queued| queued != id);
        items.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.items.lock().len()
    }
}
