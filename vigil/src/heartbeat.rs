//! Background task that watches the watchdog.
//!
//! If the watchdog heartbeat stops moving, or (for the default group with
//! dump-on-timeout) a peer announced a timeout through the global store, the
//! monitor collects debug info and terminates the process.

use crate::group::{GroupState, TIMEOUT_DUMP_KEY};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::Instant;

/// Upper bound for the host liveness probe.
const LIVENESS_PROBE_TIMEOUT: Duration = Duration::from_millis(300);

pub(crate) async fn run(st: Arc<GroupState>) {
    let mut stop = st.monitor_stop.subscribe();
    let check_signal = st.config.dump_on_timeout && st.uid == 0;
    let poll = if check_signal {
        st.config.coord_check_interval
    } else {
        st.config.heartbeat_timeout
    };
    let mut last_beat = st.heartbeat.load(Ordering::Relaxed);
    let mut last_beat_check = Instant::now();
    let mut last_store_check = Instant::now();

    let reason = loop {
        let stopped = tokio::time::timeout(poll, stop.wait_for(|v| *v))
            .await
            .is_ok();
        if stopped {
            tracing::debug!("{}heartbeat monitor stopped", st.prefix);
            return;
        }
        let now = Instant::now();

        if check_signal
            && now.duration_since(st.last_work_list_update()) >= st.config.watchdog_poll_interval
            && now.duration_since(last_store_check) >= st.config.coord_check_interval
        {
            last_store_check = now;
            match st.global_store.check(&[TIMEOUT_DUMP_KEY.to_string()]).await {
                Ok(true) => {
                    break format!(
                        "{}a timeout was signaled through the store by this or a peer rank",
                        st.prefix
                    );
                }
                Ok(false) => {}
                Err(e) => {
                    st.store_error.store(true, Ordering::Relaxed);
                    tracing::warn!("{}failed to poll the store for the timeout flag: {e}", st.prefix);
                }
            }
        }

        if now.duration_since(last_beat_check) >= st.config.heartbeat_timeout {
            last_beat_check = now;
            let beat = st.heartbeat.load(Ordering::Relaxed);
            if beat == last_beat {
                break format!(
                    "{}watchdog heartbeat did not move for {:?}; the watchdog is stuck, \
                     possibly in a hung backend call",
                    st.prefix, st.config.heartbeat_timeout
                );
            }
            last_beat = beat;
        }
    };

    terminate(&st, &mut stop, reason).await;
}

async fn terminate(
    st: &Arc<GroupState>,
    stop: &mut tokio::sync::watch::Receiver<bool>,
    reason: String,
) {
    tracing::error!("{reason}");
    if let Some(dump_stacks) = &st.stack_dumper {
        tracing::error!("{}stack traces:\n{}", st.prefix, dump_stacks());
    }
    if st.dump_debug_info().await {
        tracing::info!("{}debug info dumped by the heartbeat monitor", st.prefix);
    }

    if let Some(probe) = st.liveness_probe.clone() {
        let checked = tokio::time::timeout(
            LIVENESS_PROBE_TIMEOUT,
            tokio::task::spawn_blocking(move || probe()),
        )
        .await;
        match checked {
            Ok(Ok(true)) => tracing::info!("{}host liveness probe passed", st.prefix),
            Ok(Ok(false)) => tracing::error!("{}host liveness probe failed", st.prefix),
            Ok(Err(e)) => tracing::error!("{}host liveness probe panicked: {e}", st.prefix),
            Err(_) => tracing::error!(
                "{}host liveness probe did not answer within {LIVENESS_PROBE_TIMEOUT:?}",
                st.prefix
            ),
        }
    }

    if st.is_terminating() || st.debug_info_mode.load(Ordering::Relaxed) {
        // Let the watchdog and peers finish their own dumps.
        tokio::select! {
            _ = tokio::time::sleep(st.config.heartbeat_timeout) => {}
            _ = stop.wait_for(|v| *v) => {
                tracing::info!("{}heartbeat monitor stopped before terminating", st.prefix);
                return;
            }
        }
    }

    if !st.config.enable_monitoring {
        tracing::error!("{}monitoring is disabled, not terminating: {reason}", st.prefix);
        return;
    }
    st.terminator.terminate(&reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::local::{LocalFabric, LocalRuntime};
    use crate::backend::{CollectiveBackend, DeviceRuntime};
    use crate::config::ProcessGroupConfig;
    use crate::debug::{LivenessProbe, MemoryDebugInfoWriter, RecordingTerminator};
    use crate::group::{ProcessGroup, ProcessGroupOptions};
    use crate::store::{MemStore, Store};
    use std::sync::atomic::AtomicBool;

    struct Rig {
        state: Arc<GroupState>,
        store: Arc<MemStore>,
        terminator: Arc<RecordingTerminator>,
        writer: Arc<MemoryDebugInfoWriter>,
    }

    fn rig(config: ProcessGroupConfig, uid: u64) -> Rig {
        rig_with_probe(config, uid, None)
    }

    fn rig_with_probe(config: ProcessGroupConfig, uid: u64, probe: Option<LivenessProbe>) -> Rig {
        let fabric = LocalFabric::new();
        let runtime = Arc::new(LocalRuntime::new(1));
        let backend: Arc<dyn CollectiveBackend> = Arc::new(fabric.backend(Arc::clone(&runtime)));
        let store = Arc::new(MemStore::new());
        let terminator = Arc::new(RecordingTerminator::new());
        let writer = Arc::new(MemoryDebugInfoWriter::new());
        let mut builder = ProcessGroup::builder(
            Arc::clone(&store) as Arc<dyn Store>,
            0,
            2,
            backend,
            runtime as Arc<dyn DeviceRuntime>,
        )
        .config(config)
        .options(ProcessGroupOptions {
            uid: Some(uid),
            ..Default::default()
        })
        .terminator(Arc::clone(&terminator) as _)
        .debug_writer(Arc::clone(&writer) as _);
        if let Some(probe) = probe {
            builder = builder.liveness_probe(probe);
        }
        Rig {
            state: builder.build_state().unwrap(),
            store,
            terminator,
            writer,
        }
    }

    fn config() -> ProcessGroupConfig {
        ProcessGroupConfig {
            heartbeat_timeout: Duration::from_secs(10),
            coord_check_interval: Duration::from_secs(1),
            watchdog_poll_interval: Duration::from_millis(100),
            ..Default::default()
        }
    }

    // No watchdog runs here, so the heartbeat never moves.
    #[tokio::test(start_paused = true)]
    async fn test_stuck_watchdog_terminates() {
        let rig = rig(config(), 7);
        let task = tokio::spawn(run(Arc::clone(&rig.state)));
        tokio::time::sleep(Duration::from_secs(21)).await;
        assert!(task.is_finished());
        assert!(rig.terminator.terminated());
        assert!(rig.terminator.reasons()[0].contains("heartbeat"));
        assert_eq!(rig.writer.reports().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_probe_runs_before_terminating() {
        let probed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&probed);
        let probe: LivenessProbe = Arc::new(move || {
            flag.store(true, Ordering::Relaxed);
            true
        });
        let rig = rig_with_probe(config(), 10, Some(probe));
        let task = tokio::spawn(run(Arc::clone(&rig.state)));
        tokio::time::sleep(Duration::from_secs(21)).await;
        assert!(task.is_finished());
        assert!(probed.load(Ordering::Relaxed));
        assert!(rig.terminator.terminated());
    }

    #[tokio::test]
    async fn test_hung_liveness_check_is_abandoned() {
        let probe: LivenessProbe = Arc::new(|| {
            std::thread::sleep(Duration::from_secs(2));
            true
        });
        let rig = rig_with_probe(
            ProcessGroupConfig {
                heartbeat_timeout: Duration::from_millis(50),
                ..config()
            },
            11,
            Some(probe),
        );
        let started = std::time::Instant::now();
        run(Arc::clone(&rig.state)).await;
        assert!(started.elapsed() < Duration::from_secs(1), "{:?}", started.elapsed());
        assert!(rig.terminator.terminated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_moving_heartbeat_keeps_running() {
        let rig = rig(config(), 8);
        let task = tokio::spawn(run(Arc::clone(&rig.state)));
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(5)).await;
            rig.state.heartbeat.fetch_add(1, Ordering::Relaxed);
        }
        assert!(!rig.terminator.terminated());
        rig.state.monitor_stop.send_replace(true);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_monitoring_only_logs() {
        let rig = rig(
            ProcessGroupConfig {
                enable_monitoring: false,
                ..config()
            },
            9,
        );
        let task = tokio::spawn(run(Arc::clone(&rig.state)));
        tokio::time::sleep(Duration::from_secs(21)).await;
        assert!(task.is_finished());
        assert!(!rig.terminator.terminated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_signal_on_default_group() {
        let rig = rig(
            ProcessGroupConfig {
                dump_on_timeout: true,
                ..config()
            },
            0,
        );
        let task = tokio::spawn(run(Arc::clone(&rig.state)));
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!rig.terminator.terminated());

        rig.store
            .set(TIMEOUT_DUMP_KEY, b"3".to_vec())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        // Dumped, not in debug mode and not shutting down: terminate at once.
        assert!(task.is_finished());
        assert!(rig.terminator.reasons()[0].contains("signaled through the store"));
        assert_eq!(rig.writer.reports().len(), 1);
    }
}
