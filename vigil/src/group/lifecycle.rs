use super::{ProcessGroup, device_key};
use crate::comm::CommRole;
use crate::error::{Result, VigilError};
use crate::hooks::CompletionHook;
use crate::types::{DeviceIndex, NO_COLOR};
use crate::work::SYNCHRONIZE_BUSY_WAIT;
use std::sync::Arc;
use std::sync::atomic::Ordering;

impl ProcessGroup {
    /// Stop the group: signal the background tasks, abort every communicator
    /// (bounded by the group timeout), stop the heartbeat monitor and wait for
    /// the tasks to exit.
    pub async fn shutdown(&self) -> Result<()> {
        let st = &self.state;
        tracing::info!("{}shutting down process group", st.prefix);
        st.terminate.send_replace(true);

        let state = Arc::clone(st);
        let abort = tokio::spawn(async move {
            let comms = state.cache.communicators();
            state.cache.abort_all(Some("process group shut down"));
            state.cache.publish_aborted(&comms).await;
        });
        let aborted = tokio::time::timeout(st.timeout, abort).await;
        st.monitor_stop.send_replace(true);

        let tasks = match self.tasks.lock() {
            Ok(mut t) => std::mem::take(&mut *t),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            if tokio::time::timeout(st.timeout, task).await.is_err() {
                tracing::warn!("{}background task did not exit within {:?}", st.prefix, st.timeout);
            }
        }

        match aborted {
            Ok(_) => Ok(()),
            Err(_) => Err(VigilError::InvalidState(format!(
                "{}aborting communicators did not finish within {:?}",
                st.prefix, st.timeout
            ))),
        }
    }

    /// Abort every communicator right away. In-flight Works fail with an
    /// external-abort error; the group accepts no further operations.
    pub fn abort(&self, reason: Option<&str>) {
        let st = &self.state;
        let reason = reason.unwrap_or("process group aborted");
        tracing::warn!("{}aborting process group: {reason}", st.prefix);
        st.terminate.send_replace(true);
        for work in st.queues.pending_snapshot() {
            work.set_exception(VigilError::ExternalAbort {
                reason: reason.to_string(),
            });
        }
        st.cache.abort_all(Some(reason));
        st.monitor_stop.send_replace(true);
    }

    /// Wait until the watchdog has seen every enqueued Work complete and the
    /// completion hook has consumed them.
    pub async fn wait_for_pending_works(&self) {
        while !self.state.queues.both_empty() {
            tokio::time::sleep(SYNCHRONIZE_BUSY_WAIT).await;
        }
    }

    /// Create start events for Works issued from now on.
    pub fn enable_collectives_timing(&self) {
        self.state.enable_timing.store(true, Ordering::Relaxed);
    }

    /// Create the device communicator now instead of on first use.
    pub async fn eager_connect_single_device(&self, device: DeviceIndex) -> Result<()> {
        tracing::info!("{}eagerly connecting on device {device}", self.state.prefix);
        self.state
            .cache
            .get_or_create(&device_key(device), device, CommRole::Collective)
            .await
            .map(|_| ())
    }

    /// Take part in a parent-communicator split without joining the new
    /// communicator. Needed on ranks outside a group being split off.
    pub fn perform_nocolor_split(&self, device: DeviceIndex) -> Result<()> {
        let st = &self.state;
        let key = device_key(device);
        if st.cache.get(&key).is_none() {
            return Err(VigilError::InvalidState(format!(
                "{}no communicator on device {device} to split",
                st.prefix
            )));
        }
        st.cache.split(&key, NO_COLOR, st.rank)?;
        Ok(())
    }

    /// Run `hook` on every completed Work. Needs collective timing and can
    /// be done once per group.
    pub fn register_on_completion_hook(&self, hook: CompletionHook) -> Result<()> {
        let st = &self.state;
        if !st.enable_timing.load(Ordering::Relaxed) {
            return Err(VigilError::InvalidState(
                "completion hooks require collective timing; enable it first".into(),
            ));
        }
        if st.hook.set(Arc::clone(&hook)).is_err() {
            return Err(VigilError::InvalidState(
                "a completion hook is already registered".into(),
            ));
        }
        let task = tokio::spawn(crate::hooks::run(Arc::clone(st), hook));
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(task);
        }
        Ok(())
    }

    /// Write the flight recorder through the debug writer. Returns whether
    /// the dump finished in time.
    pub async fn dump_debugging_info(&self) -> bool {
        self.state.dump_debug_info().await
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        let st = &self.state;
        if !st.is_terminating() {
            st.terminate.send_replace(true);
            if st.config.abort_in_destroy {
                st.cache.abort_all(Some("process group dropped without shutdown"));
            }
        }
        st.monitor_stop.send_replace(true);
        // Tasks exit on their own once they observe the signals.
    }
}
