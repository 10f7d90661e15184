//! One outstanding collective invocation.

use crate::backend::{DeviceRuntime, Event};
use crate::buffer::Buffer;
use crate::comm::Communicator;
use crate::config::ErrorHandling;
use crate::error::{Result, VigilError};
use crate::flight_recorder::TraceId;
use crate::types::{DeviceIndex, OpKind, Rank};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;

/// Interval at which blocking waits poll for completion.
pub(crate) const SYNCHRONIZE_BUSY_WAIT: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkState {
    Created,
    Enqueued,
    Completed,
    Failed,
    Retired,
}

/// Start/end events of a Work. The flight recorder keeps a weak reference.
#[derive(Debug)]
pub struct WorkEvents {
    pub(crate) start: Option<Event>,
    pub(crate) end: Event,
}

impl WorkEvents {
    pub(crate) fn has_started(&self) -> bool {
        self.start
            .as_ref()
            .is_some_and(|e| e.query().unwrap_or(false))
    }

    pub(crate) fn has_finished(&self) -> bool {
        self.end.query().unwrap_or(false)
    }

    pub(crate) fn duration_ms(&self) -> Option<f32> {
        self.start.as_ref()?.elapsed_ms(&self.end).ok()
    }
}

/// Immutable summary handed to completion hooks.
#[derive(Debug, Clone)]
pub struct WorkInfo {
    pub kind: OpKind,
    pub seq: u64,
    pub time_started: SystemTime,
    pub time_finished: SystemTime,
    pub active_duration: Duration,
}

pub(crate) struct WorkSpec {
    pub pg_uid: u64,
    pub rank: Rank,
    pub kind: OpKind,
    pub seq: u64,
    pub op_id: u64,
    pub device: DeviceIndex,
    pub comm: Arc<Communicator>,
    pub timeout: Duration,
    pub enable_timing: bool,
    pub blocking_wait: bool,
    pub avoid_record_streams: bool,
    pub numel_in: usize,
    pub numel_out: usize,
}

pub struct Work {
    pg_uid: u64,
    rank: Rank,
    kind: OpKind,
    seq: u64,
    op_id: u64,
    device: DeviceIndex,
    comm: Arc<Communicator>,
    runtime: Arc<dyn DeviceRuntime>,
    events: Arc<WorkEvents>,
    created_at: Instant,
    created_wall: SystemTime,
    timeout: Duration,
    blocking_wait: bool,
    avoid_record_streams: bool,
    numel_in: usize,
    numel_out: usize,
    exception: OnceLock<VigilError>,
    state: Mutex<WorkState>,
    trace_id: OnceLock<TraceId>,
    outputs: Mutex<Vec<Buffer>>,
    stashed: Mutex<Vec<Buffer>>,
    barrier_buffer: OnceLock<Buffer>,
    pub(crate) start_trace_updated: AtomicBool,
}

impl Work {
    pub(crate) fn new(spec: WorkSpec, runtime: &Arc<dyn DeviceRuntime>) -> Result<Self> {
        let start = if spec.enable_timing {
            Some(Event::new(runtime, spec.device, true)?)
        } else {
            None
        };
        let end = Event::new(runtime, spec.device, spec.enable_timing)?;
        Ok(Self {
            pg_uid: spec.pg_uid,
            rank: spec.rank,
            kind: spec.kind,
            seq: spec.seq,
            op_id: spec.op_id,
            device: spec.device,
            comm: spec.comm,
            runtime: Arc::clone(runtime),
            events: Arc::new(WorkEvents { start, end }),
            created_at: Instant::now(),
            created_wall: SystemTime::now(),
            timeout: spec.timeout,
            blocking_wait: spec.blocking_wait,
            avoid_record_streams: spec.avoid_record_streams,
            numel_in: spec.numel_in,
            numel_out: spec.numel_out,
            exception: OnceLock::new(),
            state: Mutex::new(WorkState::Created),
            trace_id: OnceLock::new(),
            outputs: Mutex::new(Vec::new()),
            stashed: Mutex::new(Vec::new()),
            barrier_buffer: OnceLock::new(),
            start_trace_updated: AtomicBool::new(false),
        })
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn op_id(&self) -> u64 {
        self.op_id
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn device(&self) -> DeviceIndex {
        self.device
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn trace_id(&self) -> Option<TraceId> {
        self.trace_id.get().copied()
    }

    pub fn communicator(&self) -> &Arc<Communicator> {
        &self.comm
    }

    pub fn state(&self) -> WorkState {
        self.state.lock().map(|s| *s).unwrap_or(WorkState::Failed)
    }

    /// The captured error, if any. Set at most once, never cleared.
    pub fn exception(&self) -> Option<&VigilError> {
        self.exception.get()
    }

    /// Output buffers of the operation.
    pub fn result(&self) -> Vec<Buffer> {
        self.outputs.lock().map(|o| o.clone()).unwrap_or_default()
    }

    pub(crate) fn events(&self) -> &Arc<WorkEvents> {
        &self.events
    }

    pub(crate) fn set_trace_id(&self, id: TraceId) {
        let _ = self.trace_id.set(id);
    }

    pub(crate) fn set_outputs(&self, outputs: Vec<Buffer>) {
        if let Ok(mut o) = self.outputs.lock() {
            *o = outputs;
        }
    }

    pub(crate) fn stash(&self, buffers: impl IntoIterator<Item = Buffer>) {
        if let Ok(mut s) = self.stashed.lock() {
            s.extend(buffers);
        }
    }

    pub(crate) fn set_barrier_buffer(&self, buffer: Buffer) {
        let _ = self.barrier_buffer.set(buffer);
    }

    /// Store `err` unless an exception is already present. Returns whether it was stored.
    pub(crate) fn set_exception(&self, err: VigilError) -> bool {
        self.exception.set(err).is_ok()
    }

    /// Move `Created` to `Enqueued`. Returns false if the Work was enqueued before.
    pub(crate) fn mark_enqueued(&self) -> bool {
        match self.state.lock() {
            Ok(mut s) if *s == WorkState::Created => {
                *s = WorkState::Enqueued;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn mark_finished(&self) {
        if let Ok(mut s) = self.state.lock()
            && matches!(*s, WorkState::Created | WorkState::Enqueued)
        {
            *s = if self.exception.get().is_some() {
                WorkState::Failed
            } else {
                WorkState::Completed
            };
        }
    }

    pub(crate) fn mark_retired(&self) {
        if let Ok(mut s) = self.state.lock() {
            *s = WorkState::Retired;
        }
    }

    /// Pull the communicator's error state into the exception slot.
    pub fn check_and_set_exception(&self) {
        if self.exception.get().is_some() {
            return;
        }
        if let Some(err) = self.comm.check_for_errors()
            && self.set_exception(err.clone())
        {
            tracing::info!(
                "[PG {} Rank {}] found async exception when checking for backend errors: {err}",
                self.pg_uid,
                self.rank
            );
        }
    }

    /// Whether the device started executing the operation. Needs timing.
    pub fn is_started(&self) -> bool {
        self.check_and_set_exception();
        self.exception.get().is_some() || self.events.has_started()
    }

    /// Completed on the device, or failed.
    pub fn is_completed(&self) -> bool {
        self.check_and_set_exception();
        self.exception.get().is_some() || self.finished_execution()
    }

    pub fn is_success(&self) -> bool {
        self.exception.get().is_none() && self.finished_execution()
    }

    fn finished_execution(&self) -> bool {
        match self.events.end.query() {
            Ok(done) => done,
            Err(e) => {
                self.set_exception(e);
                true
            }
        }
    }

    /// Record a timeout if the Work has been outstanding for longer than
    /// `timeout` (or its own timeout). Returns whether it timed out.
    pub fn check_timeout(&self, timeout: Option<Duration>) -> bool {
        let elapsed = self.created_at.elapsed();
        let limit = timeout.unwrap_or(self.timeout);
        if elapsed < limit {
            return false;
        }
        if self.exception.get().is_some() {
            return true;
        }
        let err = VigilError::Timeout {
            rank: self.rank,
            work: self.to_string(),
            elapsed_ms: elapsed.as_millis() as u64,
        };
        tracing::error!("[PG {} Rank {}] {err}", self.pg_uid, self.rank);
        self.set_exception(err);
        true
    }

    /// Make the caller's current stream wait for the operation.
    pub fn synchronize_stream(&self) -> Result<()> {
        let current = self.runtime.current_stream(self.device)?;
        self.events.end.block(current)?;
        if self.avoid_record_streams
            && let Ok(mut s) = self.stashed.lock()
        {
            s.clear();
        }
        Ok(())
    }

    /// Wait for the operation.
    ///
    /// Normally only makes the current stream wait on the operation. In
    /// blocking-wait mode polls until completion or `timeout`, aborting the
    /// communicator on failure. A captured exception is returned.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        self.synchronize_stream()?;

        if self.blocking_wait {
            while !self.is_completed() {
                if self.check_timeout(timeout) {
                    break;
                }
                tokio::time::sleep(SYNCHRONIZE_BUSY_WAIT).await;
            }
            if let Some(err) = self.exception.get() {
                self.abort();
                return Err(err.clone());
            }
        }

        // Barriers hand control back only once the host observed completion.
        if self.barrier_buffer.get().is_some() {
            while !self.is_completed() {
                tokio::time::sleep(SYNCHRONIZE_BUSY_WAIT).await;
            }
        }

        match self.exception.get() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    pub async fn synchronize(&self) -> Result<()> {
        self.wait(None).await
    }

    /// Abort the communicator this Work runs on.
    pub fn abort(&self) {
        self.comm.abort(Some(&format!(
            "Work {} (seq {}) aborted",
            self.kind, self.seq
        )));
    }

    /// Apply the error-handling policy to a captured exception.
    ///
    /// Only `TearDown` hands the error back so the caller can terminate.
    pub(crate) fn handle_exception(&self, policy: ErrorHandling) -> Result<()> {
        let Some(err) = self.exception.get() else {
            return Ok(());
        };
        tracing::error!(
            "[PG {} Rank {}] some collective operations have failed or timed out; \
             subsequent operations may run on corrupted or incomplete data: {err}",
            self.pg_uid,
            self.rank
        );
        if policy.tears_down() {
            return Err(err.clone());
        }
        Ok(())
    }

    /// Device time between start and end. Needs timing and a completed Work.
    pub fn duration_ms(&self) -> Result<f32> {
        let start = self.events.start.as_ref().ok_or_else(|| {
            VigilError::InvalidState("duration requires collective timing to be enabled".into())
        })?;
        if !self.events.has_finished() {
            return Err(VigilError::InvalidState(format!(
                "work seq {} has not completed",
                self.seq
            )));
        }
        start.elapsed_ms(&self.events.end)
    }

    pub fn info(&self) -> WorkInfo {
        let active_ms = self.events.duration_ms().unwrap_or(0.0).max(0.0);
        WorkInfo {
            kind: self.kind,
            seq: self.seq,
            time_started: self.created_wall,
            time_finished: SystemTime::now(),
            active_duration: Duration::from_secs_f64(active_ms as f64 / 1000.0),
        }
    }
}

impl std::fmt::Display for Work {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "WorkNCCL(SeqNum={}, OpType={}, NumelIn={}, NumelOut={}, Timeout(ms)={})",
            self.seq,
            self.kind,
            self.numel_in,
            self.numel_out,
            self.timeout.as_millis()
        )
    }
}

impl std::fmt::Debug for Work {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Work")
            .field("seq", &self.seq)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("exception", &self.exception.get())
            .finish()
    }
}
