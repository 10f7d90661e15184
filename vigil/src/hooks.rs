//! User callbacks run on every completed Work.

use crate::error::Result;
use crate::group::GroupState;
use crate::work::WorkInfo;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

/// Called once per completed Work, in completion order, on the blocking
/// pool. An error or panic aborts the group's communicators.
pub type CompletionHook = Arc<dyn Fn(WorkInfo) -> Result<()> + Send + Sync>;

pub(crate) async fn run(st: Arc<GroupState>, hook: CompletionHook) {
    tracing::debug!("{}completion hook task started", st.prefix);
    loop {
        let Some(work) = st.queues.front_completed() else {
            if st.is_terminating() && st.queues.both_empty() {
                break;
            }
            // Notify can race with the watchdog; fall back to polling.
            let _ = tokio::time::timeout(
                st.config.watchdog_poll_interval,
                st.queues.completed_notified(),
            )
            .await;
            continue;
        };

        let info = work.info();
        let call = Arc::clone(&hook);
        let outcome = tokio::task::spawn_blocking(move || {
            catch_unwind(AssertUnwindSafe(|| call(info))).map_err(|panic| {
                panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "completion hook panicked".to_string())
            })
        })
        .await;
        let failure = match outcome {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(e))) => Some(e.to_string()),
            Ok(Err(panic)) => Some(panic),
            Err(e) => Some(format!("completion hook task failed: {e}")),
        };
        if let Some(reason) = failure {
            tracing::error!(
                "{}completion hook failed on {} (seq {}): {reason}",
                st.prefix,
                work.kind(),
                work.seq()
            );
            let comms = st.cache.communicators();
            st.cache
                .abort_all(Some(&format!("completion hook failed: {reason}")));
            st.cache.publish_aborted(&comms).await;
        }

        st.queues.pop_completed(&work);
        work.mark_retired();
    }
    tracing::debug!("{}completion hook task exited", st.prefix);
}
