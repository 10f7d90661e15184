//! The process group: dispatch entry points plus the state shared with its
//! background tasks.

mod coalescing;
mod dispatch;
mod lifecycle;
mod ops;
mod queues;
mod strategy;

pub(crate) use coalescing::CoalescingState;
pub(crate) use queues::WorkQueues;

use crate::backend::{CollectiveBackend, DeviceRuntime};
use crate::comm::{CacheSettings, CommRegistry, CommunicatorCache};
use crate::config::ProcessGroupConfig;
use crate::debug::{
    DebugInfoWriter, DumpTrigger, FileDebugInfoWriter, FileDumpTrigger, LivenessProbe,
    ProcessTerminator, StackDumper, Terminator,
};
use crate::error::{Result, VigilError};
use crate::flight_recorder::{DumpFilter, FlightRecorder};
use crate::hooks::CompletionHook;
use crate::store::{Store, underlying_non_prefix};
use crate::types::{DeviceIndex, Rank};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Key in the global store announcing that some rank hit a timeout.
pub const TIMEOUT_DUMP_KEY: &str = "timeout_dump";

static NEXT_GROUP_UID: AtomicU64 = AtomicU64::new(0);

/// Store key of the communicator shared by every rank on `device`.
pub(crate) fn device_key(device: DeviceIndex) -> String {
    device.to_string()
}

/// Per-group options, as opposed to the process-wide [`ProcessGroupConfig`].
#[derive(Clone, Default)]
pub struct ProcessGroupOptions {
    /// Overrides the configured default operation timeout.
    pub timeout: Option<Duration>,
    pub high_priority_stream: bool,
    /// Color used when deriving communicators from a parent group. Must be
    /// non-zero when a parent is set.
    pub split_color: i32,
    /// Global ranks of the members, in group rank order. Informational.
    pub global_ranks_in_group: Vec<Rank>,
    /// Restrict the group to one device.
    pub bound_device: Option<DeviceIndex>,
    /// Explicit group id. Defaults to a process-wide counter.
    pub uid: Option<u64>,
}

/// State shared between the caller-facing [`ProcessGroup`] and its tasks.
pub(crate) struct GroupState {
    pub uid: u64,
    pub rank: Rank,
    pub size: u32,
    pub prefix: String,
    pub config: ProcessGroupConfig,
    pub options: ProcessGroupOptions,
    pub timeout: Duration,
    pub store: Arc<dyn Store>,
    pub global_store: Arc<dyn Store>,
    pub backend: Arc<dyn CollectiveBackend>,
    pub runtime: Arc<dyn DeviceRuntime>,
    pub cache: Arc<CommunicatorCache>,
    pub registry: Arc<CommRegistry>,
    pub recorder: Arc<FlightRecorder>,
    pub queues: WorkQueues,

    pub seq: AtomicU64,
    pub op_id: AtomicU64,
    pub coalescing: Mutex<CoalescingState>,
    pub enable_timing: AtomicBool,

    pub heartbeat: AtomicU64,
    pub terminate: watch::Sender<bool>,
    pub monitor_stop: watch::Sender<bool>,
    pub debug_info_mode: AtomicBool,
    pub last_enqueued_seq: AtomicU64,
    pub last_completed_seq: AtomicU64,
    pub last_work_list_update: Mutex<Instant>,
    pub store_error: AtomicBool,

    pub dump_lock: tokio::sync::Mutex<()>,
    pub writer: Arc<dyn DebugInfoWriter>,
    pub terminator: Arc<dyn Terminator>,
    pub dump_trigger: Option<Arc<dyn DumpTrigger>>,
    pub stack_dumper: Option<StackDumper>,
    pub liveness_probe: Option<LivenessProbe>,
    pub hook: OnceLock<CompletionHook>,
}

impl GroupState {
    pub(crate) fn is_terminating(&self) -> bool {
        *self.terminate.borrow()
    }

    pub(crate) fn touch_work_list(&self) {
        if let Ok(mut t) = self.last_work_list_update.lock() {
            *t = Instant::now();
        }
    }

    pub(crate) fn last_work_list_update(&self) -> Instant {
        self.last_work_list_update
            .lock()
            .map(|t| *t)
            .unwrap_or_else(|_| Instant::now())
    }

    /// Tell every rank through the global store that a timeout was seen.
    pub(crate) async fn publish_timeout_flag(&self) {
        if let Err(e) = self
            .global_store
            .set(TIMEOUT_DUMP_KEY, self.rank.to_string().into_bytes())
            .await
        {
            self.store_error.store(true, Ordering::Relaxed);
            tracing::warn!("{}failed to set timeout flag in the store: {e}", self.prefix);
        }
    }

    /// Write the flight-recorder contents through the debug writer, giving up
    /// after `wait_timeout_dump`. Concurrent requests are serialized.
    ///
    /// The writer does blocking IO, so it runs on the blocking pool; a writer
    /// that never returns is abandoned there.
    pub(crate) async fn dump_debug_info(self: &Arc<Self>) -> bool {
        let _serialized = self.dump_lock.lock().await;
        let state = Arc::clone(self);
        let task = tokio::task::spawn_blocking(move || {
            let report = state.recorder.dump(state.rank, DumpFilter::default())?;
            state.writer.write(&report)
        });
        match tokio::time::timeout(self.config.wait_timeout_dump, task).await {
            Ok(Ok(Ok(()))) => true,
            Ok(Ok(Err(e))) => {
                tracing::warn!("{}debug dump failed: {e}", self.prefix);
                false
            }
            Ok(Err(e)) => {
                tracing::warn!("{}debug dump task failed: {e}", self.prefix);
                false
            }
            Err(_) => {
                tracing::warn!(
                    "{}debug dump did not finish within {:?}",
                    self.prefix,
                    self.config.wait_timeout_dump
                );
                false
            }
        }
    }
}

/// Builds a [`ProcessGroup`]. Everything but the store, the rank layout, the
/// backend and the runtime has a default.
pub struct ProcessGroupBuilder {
    store: Arc<dyn Store>,
    rank: Rank,
    size: u32,
    backend: Arc<dyn CollectiveBackend>,
    runtime: Arc<dyn DeviceRuntime>,
    config: ProcessGroupConfig,
    options: ProcessGroupOptions,
    split_from: Option<Arc<CommunicatorCache>>,
    recorder: Option<Arc<FlightRecorder>>,
    registry: Option<Arc<CommRegistry>>,
    writer: Option<Arc<dyn DebugInfoWriter>>,
    terminator: Option<Arc<dyn Terminator>>,
    dump_trigger: Option<Arc<dyn DumpTrigger>>,
    stack_dumper: Option<StackDumper>,
    liveness_probe: Option<LivenessProbe>,
}

impl ProcessGroupBuilder {
    pub fn config(mut self, config: ProcessGroupConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the options wholesale. A color set through
    /// [`split_from`](Self::split_from) survives when `options` leaves it at 0.
    pub fn options(mut self, options: ProcessGroupOptions) -> Self {
        let color = self.options.split_color;
        self.options = options;
        if self.options.split_color == 0 {
            self.options.split_color = color;
        }
        self
    }

    /// Derive communicators from `parent` instead of running a rendezvous.
    pub fn split_from(mut self, parent: &ProcessGroup, color: i32) -> Self {
        self.split_from = Some(Arc::clone(&parent.state.cache));
        self.options.split_color = color;
        self
    }

    /// Share a flight recorder between groups. Defaults to a private one
    /// sized by `trace_buffer_size`.
    pub fn flight_recorder(mut self, recorder: Arc<FlightRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn registry(mut self, registry: Arc<CommRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn debug_writer(mut self, writer: Arc<dyn DebugInfoWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn terminator(mut self, terminator: Arc<dyn Terminator>) -> Self {
        self.terminator = Some(terminator);
        self
    }

    pub fn dump_trigger(mut self, trigger: Arc<dyn DumpTrigger>) -> Self {
        self.dump_trigger = Some(trigger);
        self
    }

    pub fn stack_dumper(mut self, dumper: StackDumper) -> Self {
        self.stack_dumper = Some(dumper);
        self
    }

    pub fn liveness_probe(mut self, probe: LivenessProbe) -> Self {
        self.liveness_probe = Some(probe);
        self
    }

    pub(crate) fn build_state(self) -> Result<Arc<GroupState>> {
        if self.size == 0 || self.rank >= self.size {
            return Err(VigilError::InvalidArgument(format!(
                "rank {} is out of range for group size {}",
                self.rank, self.size
            )));
        }
        if self.split_from.is_some() && self.options.split_color == 0 {
            return Err(VigilError::InvalidArgument(
                "split color must be non-zero when splitting from a parent group".into(),
            ));
        }
        let config = self.config.normalized();
        let uid = self
            .options
            .uid
            .unwrap_or_else(|| NEXT_GROUP_UID.fetch_add(1, Ordering::Relaxed));
        let prefix = format!("[PG {uid} Rank {}] ", self.rank);
        let timeout = self.options.timeout.unwrap_or(config.timeout);
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(CommRegistry::new()));
        let cache = Arc::new(CommunicatorCache::new(
            CacheSettings {
                rank: self.rank,
                world_size: self.size,
                high_priority_stream: self.options.high_priority_stream,
                bound_device: self.options.bound_device,
                split_from: self.split_from.clone(),
                split_color: self.options.split_color,
                register_segments: config.register_allocator_segments,
                log_prefix: prefix.clone(),
            },
            Arc::clone(&self.backend),
            Arc::clone(&self.runtime),
            Arc::clone(&self.store),
            Arc::clone(&registry),
        ));
        let writer = self.writer.unwrap_or_else(|| {
            Arc::new(FileDebugInfoWriter::new(
                config.debug_info_file.clone(),
                self.rank,
            ))
        });
        let dump_trigger = self.dump_trigger.or_else(|| {
            config
                .debug_info_pipe_file
                .as_ref()
                .map(|stem| Arc::new(FileDumpTrigger::new(stem.clone(), self.rank)) as _)
        });
        let recorder = self
            .recorder
            .unwrap_or_else(|| Arc::new(FlightRecorder::new(config.trace_buffer_size)));

        tracing::info!(
            "{prefix}process group created: size {}, backend {}, timeout {:?}, blocking wait {}, \
             error handling {:?}, desync debug {}, dump on timeout {}, trace buffer {}",
            self.size,
            self.backend.name(),
            timeout,
            config.blocking_wait,
            config.async_error_handling,
            config.desync_debug,
            config.dump_on_timeout,
            recorder.capacity()
        );

        let enable_timing = config.enable_timing;
        Ok(Arc::new(GroupState {
            uid,
            rank: self.rank,
            size: self.size,
            prefix,
            global_store: underlying_non_prefix(&self.store),
            store: self.store,
            backend: self.backend,
            runtime: self.runtime,
            cache,
            registry,
            recorder,
            queues: WorkQueues::default(),
            seq: AtomicU64::new(0),
            op_id: AtomicU64::new(0),
            coalescing: Mutex::new(CoalescingState::default()),
            enable_timing: AtomicBool::new(enable_timing),
            heartbeat: AtomicU64::new(1),
            terminate: watch::channel(false).0,
            monitor_stop: watch::channel(false).0,
            debug_info_mode: AtomicBool::new(false),
            last_enqueued_seq: AtomicU64::new(0),
            last_completed_seq: AtomicU64::new(0),
            last_work_list_update: Mutex::new(Instant::now()),
            store_error: AtomicBool::new(false),
            dump_lock: tokio::sync::Mutex::new(()),
            writer,
            terminator: self
                .terminator
                .unwrap_or_else(|| Arc::new(ProcessTerminator)),
            dump_trigger,
            stack_dumper: self.stack_dumper,
            liveness_probe: self.liveness_probe,
            hook: OnceLock::new(),
            timeout,
            config,
            options: self.options,
        }))
    }

    /// Create the group and start its watchdog and heartbeat monitor.
    ///
    /// Must be called within a tokio runtime.
    pub fn build(self) -> Result<ProcessGroup> {
        let state = self.build_state()?;
        let mut tasks = vec![tokio::spawn(crate::watchdog::run(Arc::clone(&state)))];
        tasks.push(tokio::spawn(crate::heartbeat::run(Arc::clone(&state))));
        Ok(ProcessGroup {
            state,
            tasks: Mutex::new(tasks),
        })
    }
}

/// One rank's view of a group of cooperating processes.
///
/// Collectives are issued asynchronously on per-device communication streams
/// and return a [`Work`](crate::work::Work) that tracks completion. A
/// background watchdog turns stuck or failed Works into errors and applies the
/// configured error-handling policy; a heartbeat monitor makes sure the
/// watchdog itself keeps running.
pub struct ProcessGroup {
    pub(crate) state: Arc<GroupState>,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessGroup {
    pub fn builder(
        store: Arc<dyn Store>,
        rank: Rank,
        size: u32,
        backend: Arc<dyn CollectiveBackend>,
        runtime: Arc<dyn DeviceRuntime>,
    ) -> ProcessGroupBuilder {
        ProcessGroupBuilder {
            store,
            rank,
            size,
            backend,
            runtime,
            config: ProcessGroupConfig::default(),
            options: ProcessGroupOptions::default(),
            split_from: None,
            recorder: None,
            registry: None,
            writer: None,
            terminator: None,
            dump_trigger: None,
            stack_dumper: None,
            liveness_probe: None,
        }
    }

    pub fn uid(&self) -> u64 {
        self.state.uid
    }

    pub fn rank(&self) -> Rank {
        self.state.rank
    }

    pub fn size(&self) -> u32 {
        self.state.size
    }

    pub fn backend_name(&self) -> &'static str {
        self.state.backend.name()
    }

    /// Effective (normalized) configuration.
    pub fn config(&self) -> &ProcessGroupConfig {
        &self.state.config
    }

    pub fn options(&self) -> &ProcessGroupOptions {
        &self.state.options
    }

    /// Default timeout of Works issued by this group.
    pub fn timeout(&self) -> Duration {
        self.state.timeout
    }

    pub fn communicators(&self) -> &Arc<CommunicatorCache> {
        &self.state.cache
    }

    pub fn registry(&self) -> &Arc<CommRegistry> {
        &self.state.registry
    }

    pub fn flight_recorder(&self) -> &Arc<FlightRecorder> {
        &self.state.recorder
    }

    /// Counter bumped by the watchdog on every iteration.
    pub fn heartbeat(&self) -> u64 {
        self.state.heartbeat.load(Ordering::Relaxed)
    }

    /// Sequence number of the most recent collective.
    pub fn sequence_number(&self) -> u64 {
        self.state.seq.load(Ordering::Acquire)
    }

    /// Number of Works the watchdog is still tracking.
    pub fn pending_works(&self) -> usize {
        self.state.queues.pending_len()
    }

    pub fn is_terminating(&self) -> bool {
        self.state.is_terminating()
    }

    /// Whether a timeout moved the group into debug-info collection.
    pub fn in_debug_info_mode(&self) -> bool {
        self.state.debug_info_mode.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("uid", &self.state.uid)
            .field("rank", &self.state.rank)
            .field("size", &self.state.size)
            .field("seq", &self.sequence_number())
            .finish()
    }
}
