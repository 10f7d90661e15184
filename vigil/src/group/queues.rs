use crate::work::Work;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

/// In-flight Works and Works waiting for the completion hook.
///
/// When both queues are needed the pending lock is always taken first; only
/// [`retire`](Self::retire) and [`both_empty`](Self::both_empty) do that.
#[derive(Default)]
pub(crate) struct WorkQueues {
    pending: Mutex<VecDeque<Arc<Work>>>,
    completed: Mutex<VecDeque<Arc<Work>>>,
    completed_ready: Notify,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // Queue contents stay consistent across a panic in a holder.
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl WorkQueues {
    pub(crate) fn push_pending(&self, work: Arc<Work>) {
        lock(&self.pending).push_back(work);
    }

    /// Copy of the pending queue, so it can be processed without the lock.
    pub(crate) fn pending_snapshot(&self) -> Vec<Arc<Work>> {
        lock(&self.pending).iter().cloned().collect()
    }

    pub(crate) fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Remove `work` from the pending queue, handing it to the completion
    /// hook queue when `keep_for_hook` is set.
    pub(crate) fn retire(&self, work: &Arc<Work>, keep_for_hook: bool) {
        let mut pending = lock(&self.pending);
        pending.retain(|w| !Arc::ptr_eq(w, work));
        if keep_for_hook {
            lock(&self.completed).push_back(Arc::clone(work));
            drop(pending);
            self.completed_ready.notify_one();
        }
    }

    pub(crate) fn front_completed(&self) -> Option<Arc<Work>> {
        lock(&self.completed).front().cloned()
    }

    pub(crate) fn pop_completed(&self, work: &Arc<Work>) {
        let mut completed = lock(&self.completed);
        if completed.front().is_some_and(|w| Arc::ptr_eq(w, work)) {
            completed.pop_front();
        }
    }

    pub(crate) async fn completed_notified(&self) {
        self.completed_ready.notified().await
    }

    pub(crate) fn both_empty(&self) -> bool {
        let pending = lock(&self.pending);
        let completed = lock(&self.completed);
        pending.is_empty() && completed.is_empty()
    }
}
