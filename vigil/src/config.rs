//! Runtime-configurable behavior of a process group.
//!
//! All values have defaults suitable for production. Override via environment
//! variables (prefixed `VIGIL_`) or by constructing a custom
//! [`ProcessGroupConfig`]. Call [`ProcessGroupConfig::normalized`] (the
//! process group does this on construction) to resolve interactions between
//! options.

use std::path::PathBuf;
use std::time::Duration;

/// What to do once a Work has captured an asynchronous error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorHandling {
    /// Only surface the error to callers of `wait()`.
    NoHandling,
    /// Abort communicators, then terminate the process.
    TearDown,
    /// Abort communicators and let the caller continue.
    SkipCleanUp,
}

impl ErrorHandling {
    /// Whether affected communicators get aborted.
    pub fn aborts_communicators(self) -> bool {
        !matches!(self, ErrorHandling::NoHandling)
    }

    /// Whether the process is terminated after the abort.
    pub fn tears_down(self) -> bool {
        matches!(self, ErrorHandling::TearDown)
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "0" | "none" | "no-handling" => Some(ErrorHandling::NoHandling),
            "1" | "tear-down" | "teardown" => Some(ErrorHandling::TearDown),
            // 2 historically meant "clean up only", which is what skip-cleanup does here.
            "2" | "3" | "skip-cleanup" | "clean-up-only" => Some(ErrorHandling::SkipCleanUp),
            _ => None,
        }
    }
}

/// Tuning parameters for the dispatch engine and its background tasks.
#[derive(Debug, Clone)]
pub struct ProcessGroupConfig {
    /// `wait()` busy-polls the Work instead of making the caller's stream wait.
    pub blocking_wait: bool,

    pub async_error_handling: ErrorHandling,

    /// Publish per-rank start/end trace keys and build desync reports on timeout.
    pub desync_debug: bool,

    /// Write a flight-recorder dump when a timeout is detected.
    pub dump_on_timeout: bool,

    /// The heartbeat monitor declares the watchdog stuck after this long
    /// without progress.
    pub heartbeat_timeout: Duration,

    /// Upper bound on a single debug dump.
    pub wait_timeout_dump: Duration,

    /// How often the heartbeat monitor polls the store for a peer timeout.
    pub coord_check_interval: Duration,

    pub watchdog_poll_interval: Duration,

    /// Flight-recorder capacity. Zero disables recording.
    pub trace_buffer_size: usize,

    /// When disabled, a stuck watchdog is only logged.
    pub enable_monitoring: bool,

    /// Stash buffers on the Work instead of recording them with the allocator.
    pub avoid_record_streams: bool,

    pub enable_timing: bool,

    /// Default per-operation timeout.
    pub timeout: Duration,

    /// Stem of the per-rank debug dump file.
    pub debug_info_file: PathBuf,

    /// Stem of the per-rank dump trigger file. `None` disables the trigger.
    pub debug_info_pipe_file: Option<PathBuf>,

    /// Register allocator segments with every new communicator.
    pub register_allocator_segments: bool,

    /// Abort communicators when the process group is dropped without shutdown.
    pub abort_in_destroy: bool,
}

impl Default for ProcessGroupConfig {
    fn default() -> Self {
        Self {
            blocking_wait: false,
            async_error_handling: ErrorHandling::SkipCleanUp,
            desync_debug: false,
            dump_on_timeout: false,
            heartbeat_timeout: Duration::from_secs(600),
            wait_timeout_dump: Duration::from_millis(60_000),
            coord_check_interval: Duration::from_millis(1_000),
            watchdog_poll_interval: Duration::from_millis(100),
            trace_buffer_size: 0,
            enable_monitoring: true,
            avoid_record_streams: false,
            enable_timing: false,
            timeout: Duration::from_secs(600),
            debug_info_file: PathBuf::from("/tmp/vigil_trace_rank_"),
            debug_info_pipe_file: None,
            register_allocator_segments: false,
            abort_in_destroy: true,
        }
    }
}

impl ProcessGroupConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `VIGIL_BLOCKING_WAIT`
    /// - `VIGIL_ASYNC_ERROR_HANDLING` (`0`/`none`, `1`/`tear-down`, `2`, `3`/`skip-cleanup`)
    /// - `VIGIL_DESYNC_DEBUG`
    /// - `VIGIL_DUMP_ON_TIMEOUT`
    /// - `VIGIL_HEARTBEAT_TIMEOUT_SEC`
    /// - `VIGIL_WAIT_TIMEOUT_DUMP_MILSEC`
    /// - `VIGIL_COORD_CHECK_MILSEC`
    /// - `VIGIL_TRACE_BUFFER_SIZE`
    /// - `VIGIL_ENABLE_MONITORING`
    /// - `VIGIL_AVOID_RECORD_STREAMS`
    /// - `VIGIL_ENABLE_TIMING`
    /// - `VIGIL_TIMEOUT_MS`
    /// - `VIGIL_DEBUG_INFO_TEMP_FILE`
    /// - `VIGIL_DEBUG_INFO_PIPE_FILE`
    /// - `VIGIL_USE_TENSOR_REGISTER_ALLOCATOR_HOOK`
    /// - `VIGIL_ABORT_IN_DESTROY_PG`
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        let flag = |name: &str, slot: &mut bool| {
            if let Some(v) = lookup(name) {
                if let Some(b) = parse_bool(&v) {
                    *slot = b;
                }
            }
        };

        flag("VIGIL_BLOCKING_WAIT", &mut cfg.blocking_wait);
        flag("VIGIL_DESYNC_DEBUG", &mut cfg.desync_debug);
        flag("VIGIL_DUMP_ON_TIMEOUT", &mut cfg.dump_on_timeout);
        flag("VIGIL_ENABLE_MONITORING", &mut cfg.enable_monitoring);
        flag("VIGIL_AVOID_RECORD_STREAMS", &mut cfg.avoid_record_streams);
        flag("VIGIL_ENABLE_TIMING", &mut cfg.enable_timing);
        flag(
            "VIGIL_USE_TENSOR_REGISTER_ALLOCATOR_HOOK",
            &mut cfg.register_allocator_segments,
        );
        flag("VIGIL_ABORT_IN_DESTROY_PG", &mut cfg.abort_in_destroy);

        if let Some(v) = lookup("VIGIL_ASYNC_ERROR_HANDLING") {
            if let Some(h) = ErrorHandling::parse(&v) {
                cfg.async_error_handling = h;
            }
        }
        if let Some(v) = lookup("VIGIL_HEARTBEAT_TIMEOUT_SEC") {
            if let Ok(s) = v.parse::<u64>() {
                cfg.heartbeat_timeout = Duration::from_secs(s);
            }
        }
        if let Some(v) = lookup("VIGIL_WAIT_TIMEOUT_DUMP_MILSEC") {
            if let Ok(ms) = v.parse::<u64>() {
                cfg.wait_timeout_dump = Duration::from_millis(ms);
            }
        }
        if let Some(v) = lookup("VIGIL_COORD_CHECK_MILSEC") {
            if let Ok(ms) = v.parse::<u64>() {
                cfg.coord_check_interval = Duration::from_millis(ms);
            }
        }
        if let Some(v) = lookup("VIGIL_TRACE_BUFFER_SIZE") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.trace_buffer_size = n;
            }
        }
        if let Some(v) = lookup("VIGIL_TIMEOUT_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                cfg.timeout = Duration::from_millis(ms);
            }
        }
        if let Some(v) = lookup("VIGIL_DEBUG_INFO_TEMP_FILE") {
            if !v.is_empty() {
                cfg.debug_info_file = PathBuf::from(v);
            }
        }
        if let Some(v) = lookup("VIGIL_DEBUG_INFO_PIPE_FILE") {
            if !v.is_empty() {
                cfg.debug_info_pipe_file = Some(PathBuf::from(v));
            }
        }

        cfg
    }

    /// Resolve interactions between options.
    ///
    /// Blocking wait disables asynchronous error handling and desync debugging,
    /// desync debugging needs a handling policy and timing events.
    pub fn normalized(mut self) -> Self {
        if self.blocking_wait {
            if self.async_error_handling != ErrorHandling::NoHandling || self.desync_debug {
                tracing::info!(
                    "blocking wait is enabled; disabling async error handling and desync debugging"
                );
            }
            self.async_error_handling = ErrorHandling::NoHandling;
            self.desync_debug = false;
        } else if self.desync_debug && self.async_error_handling == ErrorHandling::NoHandling {
            tracing::info!("desync debugging requires async error handling; using skip-cleanup");
            self.async_error_handling = ErrorHandling::SkipCleanUp;
        }
        if self.desync_debug {
            self.enable_timing = true;
        }
        self
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "y" => Some(true),
        "0" | "false" | "no" | "off" | "n" => Some(false),
        _ => None,
    }
}
