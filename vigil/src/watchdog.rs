//! Background task that polls in-flight Works.
//!
//! The watchdog is the only place that turns a timeout into a Work exception
//! (apart from blocking waits), applies the error-handling policy and retires
//! completed Works.

use crate::desync::{desync_report, trace_end_key, trace_start_key, update_trace};
use crate::error::VigilError;
use crate::group::GroupState;
use crate::work::Work;
use std::sync::Arc;
use std::sync::atomic::Ordering;

pub(crate) async fn run(st: Arc<GroupState>) {
    let mut terminate = st.terminate.subscribe();
    tracing::debug!("{}watchdog started", st.prefix);
    loop {
        if st.is_terminating() && st.queues.pending_len() == 0 {
            break;
        }
        // Woken early by shutdown.
        let _ = tokio::time::timeout(st.config.watchdog_poll_interval, terminate.changed()).await;
        st.heartbeat.fetch_add(1, Ordering::Relaxed);

        for work in st.queues.pending_snapshot() {
            process(&st, &work).await;
            st.heartbeat.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(trigger) = &st.dump_trigger
            && trigger.poll()
        {
            tracing::info!("{}dump requested through the trigger file", st.prefix);
            st.dump_debug_info().await;
        }
    }
    tracing::info!("{}watchdog exited", st.prefix);
}

async fn process(st: &Arc<GroupState>, work: &Arc<Work>) {
    let terminating = st.is_terminating();
    if !terminating {
        work.check_and_set_exception();
    }
    // Diagnostics are only for a Work whose first failure is this timeout.
    let failed_before = work.exception().is_some();
    if work.check_timeout(None) && !failed_before && !terminating {
        on_timeout(st, work).await;
    }

    if !terminating
        && let Some(err) = work.exception()
    {
        let policy = st.config.async_error_handling;
        if policy.aborts_communicators() {
            let comms = st.cache.communicators();
            work.abort();
            let reason = format!("{} (seq {}) failed: {err}", work.kind(), work.seq());
            st.cache.abort_all(Some(&reason));
            st.cache.publish_aborted(&comms).await;
        }
        if let Err(e) = work.handle_exception(policy) {
            st.terminator.terminate(&e.to_string());
        }
    }

    if st.config.desync_debug && work.exception().is_none() {
        publish_progress(st, work).await;
    }

    if work.is_completed() {
        st.last_completed_seq.store(work.seq(), Ordering::Release);
        work.mark_finished();
        if let Some(id) = work.trace_id() {
            st.recorder.retire(id, work.exception().is_none());
        }
        let keep = st.hook.get().is_some();
        st.queues.retire(work, keep);
        if !keep {
            work.mark_retired();
        }
        st.touch_work_list();
    }
}

/// Collect diagnostics for a timed-out Work before the policy tears anything down.
async fn on_timeout(st: &Arc<GroupState>, work: &Work) {
    tracing::error!(
        pg = st.uid,
        rank = st.rank,
        seq = work.seq(),
        "{}timeout at {work}: last enqueued work {}, last completed work {}",
        st.prefix,
        st.last_enqueued_seq.load(Ordering::Acquire),
        st.last_completed_seq.load(Ordering::Acquire)
    );

    if st.config.desync_debug || st.config.dump_on_timeout {
        st.publish_timeout_flag().await;
        st.debug_info_mode.store(true, Ordering::Relaxed);
    }

    if st.config.dump_on_timeout {
        if st.dump_debug_info().await {
            tracing::info!("{}debug info dumped after timeout", st.prefix);
        }
        // Give peers time to notice the flag and dump their own state.
        tokio::time::sleep(st.config.heartbeat_timeout).await;
    }

    if st.config.desync_debug {
        match desync_report(&*st.store, st.backend.name(), st.rank, st.size).await {
            Ok(report) => tracing::error!("{}{}", st.prefix, VigilError::Desync { report }),
            Err(e) => tracing::warn!("{}failed to build desync report: {e}", st.prefix),
        }
    }
}

/// Publish the start and end trace keys of `work` once each.
async fn publish_progress(st: &GroupState, work: &Work) {
    if st.store_error.load(Ordering::Relaxed) || st.is_terminating() {
        return;
    }
    let backend = st.backend.name();
    if !work.start_trace_updated.load(Ordering::Relaxed) && work.is_started() {
        let key = trace_start_key(backend, st.rank);
        match update_trace(&*st.store, &key, work.seq(), work.kind()).await {
            Ok(()) => work.start_trace_updated.store(true, Ordering::Relaxed),
            Err(e) => {
                st.store_error.store(true, Ordering::Relaxed);
                tracing::warn!("{}failed to publish {key}: {e}", st.prefix);
                return;
            }
        }
    }
    if work.is_completed() {
        let key = trace_end_key(backend, st.rank);
        if let Err(e) = update_trace(&*st.store, &key, work.seq(), work.kind()).await {
            st.store_error.store(true, Ordering::Relaxed);
            tracing::warn!("{}failed to publish {key}: {e}", st.prefix);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::local::{LocalFabric, LocalRuntime};
    use crate::backend::{BackendStatus, CollectiveBackend, DeviceRuntime};
    use crate::buffer::Buffer;
    use crate::config::{ErrorHandling, ProcessGroupConfig};
    use crate::debug::{MemoryDebugInfoWriter, RecordingTerminator};
    use crate::group::ProcessGroup;
    use crate::store::{MemStore, Store};
    use crate::types::ReduceOp;
    use std::time::Duration;

    struct Rig {
        pg: ProcessGroup,
        fabric: LocalFabric,
        store: Arc<MemStore>,
        terminator: Arc<RecordingTerminator>,
        writer: Arc<MemoryDebugInfoWriter>,
    }

    /// Rank 0 of a two-rank group whose peer never shows up.
    fn lonely_rank(config: ProcessGroupConfig) -> Rig {
        let fabric = LocalFabric::new();
        let runtime = Arc::new(LocalRuntime::new(1));
        let backend: Arc<dyn CollectiveBackend> = Arc::new(fabric.backend(Arc::clone(&runtime)));
        let store = Arc::new(MemStore::new());
        let terminator = Arc::new(RecordingTerminator::new());
        let writer = Arc::new(MemoryDebugInfoWriter::new());
        let pg = ProcessGroup::builder(
            Arc::clone(&store) as Arc<dyn Store>,
            0,
            2,
            backend,
            runtime as Arc<dyn DeviceRuntime>,
        )
        .config(config)
        .terminator(Arc::clone(&terminator) as _)
        .debug_writer(Arc::clone(&writer) as _)
        .build()
        .unwrap();
        Rig {
            pg,
            fabric,
            store,
            terminator,
            writer,
        }
    }

    fn base_config() -> ProcessGroupConfig {
        ProcessGroupConfig {
            timeout: Duration::from_millis(500),
            watchdog_poll_interval: Duration::from_millis(100),
            heartbeat_timeout: Duration::from_secs(3600),
            trace_buffer_size: 8,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_detected_within_timeout_plus_poll() {
        let rig = lonely_rank(base_config());
        let buf = Buffer::from_slice(0, &[1.0f32]);
        let work = rig.pg.all_reduce(&buf, ReduceOp::Sum).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(work.exception().is_none());
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(work.exception().is_some_and(VigilError::is_timeout));
        // Skip-cleanup aborts the communicator but does not terminate.
        assert!(rig.pg.communicators().get("0").unwrap().is_aborted());
        assert!(!rig.terminator.terminated());
        assert_eq!(rig.pg.pending_works(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tear_down_terminates() {
        let rig = lonely_rank(ProcessGroupConfig {
            async_error_handling: ErrorHandling::TearDown,
            ..base_config()
        });
        let buf = Buffer::from_slice(0, &[1.0f32]);
        rig.pg.all_reduce(&buf, ReduceOp::Sum).await.unwrap();
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(rig.terminator.terminated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_handling_leaves_communicators_alone() {
        let rig = lonely_rank(ProcessGroupConfig {
            async_error_handling: ErrorHandling::NoHandling,
            ..base_config()
        });
        let buf = Buffer::from_slice(0, &[1.0f32]);
        let work = rig.pg.all_reduce(&buf, ReduceOp::Sum).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(work.exception().is_some());
        assert!(!rig.pg.communicators().get("0").unwrap().is_aborted());
        let err = work.wait(None).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dump_on_timeout_sets_flag_and_dumps() {
        let rig = lonely_rank(ProcessGroupConfig {
            dump_on_timeout: true,
            heartbeat_timeout: Duration::from_secs(2),
            ..base_config()
        });
        let buf = Buffer::from_slice(0, &[1.0f32]);
        rig.pg.all_reduce(&buf, ReduceOp::Sum).await.unwrap();
        tokio::time::sleep(Duration::from_millis(700)).await;

        assert_eq!(rig.store.peek(crate::group::TIMEOUT_DUMP_KEY), Some(b"0".to_vec()));
        assert!(rig.pg.in_debug_info_mode());
        let reports = rig.writer.reports();
        assert!(!reports.is_empty());
        // The dump was taken while the Work was still outstanding.
        let dump: serde_json::Value = serde_json::from_str(&reports[0]).unwrap();
        assert_eq!(dump["entries"][0]["retired"], false);
        assert!(!rig.pg.communicators().get("0").unwrap().is_aborted());

        // After the peer grace period the policy applies.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(rig.pg.communicators().get("0").unwrap().is_aborted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_aborts_every_communicator_of_the_group() {
        let rig = lonely_rank(base_config());
        rig.pg.eager_connect_single_device(0).await.unwrap();
        let buf = Buffer::from_slice(0, &[0.0f32]);
        // Rank 1 never sends.
        let work = rig.pg.recv(&buf, 1).await.unwrap().unwrap();
        let comms = rig.pg.communicators();
        assert!(comms.get("0").is_some() && comms.get("0:1").is_some());

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(work.exception().is_some_and(VigilError::is_timeout));
        for comm in comms.communicators() {
            assert!(comm.is_aborted(), "'{}' survived the cascade", comm.key());
        }
        assert!(comms.get("0").unwrap().is_aborted());
        assert!(comms.get("0:1").unwrap().is_aborted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_error_past_the_deadline_is_not_a_timeout() {
        let rig = lonely_rank(ProcessGroupConfig {
            dump_on_timeout: true,
            watchdog_poll_interval: Duration::from_millis(300),
            ..base_config()
        });
        let buf = Buffer::from_slice(0, &[1.0f32]);
        let work = rig.pg.all_reduce(&buf, ReduceOp::Sum).await.unwrap().unwrap();
        // Injected after the poll at 300 ms; the poll at 600 ms finds it with
        // the Work already past its 500 ms deadline.
        tokio::time::sleep(Duration::from_millis(450)).await;
        rig.fabric.inject_error(BackendStatus::SystemError);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let err = work.exception().cloned().unwrap();
        assert!(!err.is_timeout(), "{err}");
        assert_eq!(rig.store.peek(crate::group::TIMEOUT_DUMP_KEY), None);
        assert!(!rig.pg.in_debug_info_mode());
        assert!(rig.writer.reports().is_empty());
        assert!(rig.pg.communicators().get("0").unwrap().is_aborted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_advances() {
        let rig = lonely_rank(base_config());
        let before = rig.pg.heartbeat();
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(rig.pg.heartbeat() >= before + 3);
    }
}
