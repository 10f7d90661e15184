use crate::backend::{DeviceRuntime, MemorySegment, StreamHandle};
use crate::buffer::Buffer;
use crate::error::{Result, VigilError};
use crate::types::{CaptureStatus, DataType, DeviceIndex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

type Continuation = Box<dyn FnOnce() + Send>;

/// One unit of simulated device work. Completes at most once.
pub(crate) struct PendingOp {
    state: Mutex<OpState>,
}

#[derive(Default)]
struct OpState {
    finished_at: Option<Instant>,
    continuations: Vec<Continuation>,
}

impl PendingOp {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(OpState::default()),
        })
    }

    pub(crate) fn is_done(&self) -> bool {
        self.finished_at().is_some()
    }

    pub(crate) fn finished_at(&self) -> Option<Instant> {
        self.state.lock().ok().and_then(|s| s.finished_at)
    }

    pub(crate) fn complete(&self) {
        let continuations = match self.state.lock() {
            Ok(mut s) if s.finished_at.is_none() => {
                s.finished_at = Some(Instant::now());
                std::mem::take(&mut s.continuations)
            }
            _ => return,
        };
        for c in continuations {
            c();
        }
    }

    fn on_complete(&self, c: Continuation) {
        if let Ok(mut s) = self.state.lock()
            && s.finished_at.is_none()
        {
            s.continuations.push(c);
            return;
        }
        c();
    }
}

struct StreamState {
    pending: Vec<Arc<PendingOp>>,
}

impl StreamState {
    fn outstanding(&mut self) -> Vec<Arc<PendingOp>> {
        self.pending.retain(|op| !op.is_done());
        self.pending.clone()
    }
}

struct EventState {
    timing: bool,
    waits_on: Vec<Arc<PendingOp>>,
    recorded_at: Option<Instant>,
}

impl EventState {
    fn is_complete(&self) -> bool {
        self.waits_on.iter().all(|op| op.is_done())
    }

    fn completed_at(&self) -> Option<Instant> {
        let mut latest = self.recorded_at?;
        for op in &self.waits_on {
            latest = latest.max(op.finished_at()?);
        }
        Some(latest)
    }
}

#[derive(Default)]
struct RuntimeState {
    next_handle: u64,
    streams: HashMap<u64, StreamState>,
    current: HashMap<DeviceIndex, u64>,
    events: HashMap<u64, EventState>,
    capture: HashMap<DeviceIndex, CaptureStatus>,
    segments: Vec<MemorySegment>,
    recorded_buffers: HashMap<usize, usize>,
}

impl RuntimeState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn stream(&mut self, stream: StreamHandle) -> Result<&mut StreamState> {
        self.streams
            .get_mut(&stream.raw)
            .ok_or_else(|| VigilError::device(format!("unknown stream {}", stream.raw)))
    }

    fn event(&mut self, event: u64) -> Result<&mut EventState> {
        self.events
            .get_mut(&event)
            .ok_or_else(|| VigilError::device(format!("unknown event {event}")))
    }
}

/// Simulated accelerator runtime for one rank.
///
/// Streams track the operations enqueued on them; an event captures the
/// operations outstanding on a stream when it is recorded and completes when
/// all of them complete.
pub struct LocalRuntime {
    devices: usize,
    state: Mutex<RuntimeState>,
}

impl LocalRuntime {
    pub fn new(devices: usize) -> Self {
        Self {
            devices,
            state: Mutex::new(RuntimeState::default()),
        }
    }

    /// Pretend the current stream of `device` is (or stops) being captured.
    pub fn set_capture_status(&self, device: DeviceIndex, status: CaptureStatus) {
        if let Ok(mut s) = self.state.lock() {
            s.capture.insert(device, status);
        }
    }

    /// Pretend the allocator holds a segment.
    pub fn add_segment(&self, device: DeviceIndex, address: u64, len_bytes: usize) {
        if let Ok(mut s) = self.state.lock() {
            s.segments.push(MemorySegment {
                device,
                address,
                len_bytes,
            });
        }
    }

    /// How many times `buffer`'s allocation was recorded on a stream.
    pub fn record_count(&self, buffer: &Buffer) -> usize {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.recorded_buffers.get(&buffer.storage_id()).copied())
            .unwrap_or(0)
    }

    /// Number of live events.
    pub fn live_events(&self) -> usize {
        self.state.lock().map(|s| s.events.len()).unwrap_or(0)
    }

    pub(crate) fn enqueue(&self, stream: StreamHandle, op: Arc<PendingOp>) -> Result<()> {
        let mut s = self.lock()?;
        let st = s.stream(stream)?;
        st.pending.retain(|p| !p.is_done());
        if !op.is_done() {
            st.pending.push(op);
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, RuntimeState>> {
        self.state
            .lock()
            .map_err(|_| VigilError::LockPoisoned("local runtime"))
    }

    fn check_device(&self, device: DeviceIndex) -> Result<()> {
        if device as usize >= self.devices {
            return Err(VigilError::InvalidArgument(format!(
                "device {device} out of range ({} devices)",
                self.devices
            )));
        }
        Ok(())
    }
}

impl DeviceRuntime for LocalRuntime {
    fn device_count(&self) -> usize {
        self.devices
    }

    fn current_stream(&self, device: DeviceIndex) -> Result<StreamHandle> {
        self.check_device(device)?;
        let mut s = self.lock()?;
        if let Some(&raw) = s.current.get(&device) {
            return Ok(StreamHandle { device, raw });
        }
        let raw = s.handle();
        s.streams.insert(raw, StreamState { pending: Vec::new() });
        s.current.insert(device, raw);
        Ok(StreamHandle { device, raw })
    }

    fn stream_from_pool(&self, device: DeviceIndex, _high_priority: bool) -> Result<StreamHandle> {
        self.check_device(device)?;
        let mut s = self.lock()?;
        let raw = s.handle();
        s.streams.insert(raw, StreamState { pending: Vec::new() });
        Ok(StreamHandle { device, raw })
    }

    fn create_event(&self, device: DeviceIndex, enable_timing: bool) -> Result<u64> {
        self.check_device(device)?;
        let mut s = self.lock()?;
        let raw = s.handle();
        s.events.insert(
            raw,
            EventState {
                timing: enable_timing,
                waits_on: Vec::new(),
                recorded_at: None,
            },
        );
        Ok(raw)
    }

    fn destroy_event(&self, event: u64) {
        if let Ok(mut s) = self.state.lock() {
            s.events.remove(&event);
        }
    }

    fn record_event(&self, event: u64, stream: StreamHandle) -> Result<()> {
        let mut s = self.lock()?;
        let outstanding = s.stream(stream)?.outstanding();
        let ev = s.event(event)?;
        ev.waits_on = outstanding;
        ev.recorded_at = Some(Instant::now());
        Ok(())
    }

    fn block_stream(&self, event: u64, stream: StreamHandle) -> Result<()> {
        let mut s = self.lock()?;
        let deps: Vec<Arc<PendingOp>> = s
            .event(event)?
            .waits_on
            .iter()
            .filter(|op| !op.is_done())
            .cloned()
            .collect();
        s.stream(stream)?.pending.extend(deps);
        Ok(())
    }

    fn query_event(&self, event: u64) -> Result<bool> {
        let mut s = self.lock()?;
        Ok(s.event(event)?.is_complete())
    }

    fn elapsed_ms(&self, start: u64, end: u64) -> Result<f32> {
        let mut s = self.lock()?;
        let (start_timing, start_at) = {
            let ev = s.event(start)?;
            (ev.timing, ev.completed_at())
        };
        let (end_timing, end_at) = {
            let ev = s.event(end)?;
            (ev.timing, ev.completed_at())
        };
        if !start_timing || !end_timing {
            return Err(VigilError::device("events were created without timing"));
        }
        match (start_at, end_at) {
            (Some(a), Some(b)) => Ok(b.saturating_duration_since(a).as_secs_f32() * 1000.0),
            _ => Err(VigilError::device("events have not completed")),
        }
    }

    fn allocate(&self, device: DeviceIndex, dtype: DataType, numel: usize) -> Result<Buffer> {
        self.check_device(device)?;
        Ok(Buffer::zeros(device, dtype, &[numel]))
    }

    fn copy_async(&self, dst: &Buffer, src: &Buffer, stream: StreamHandle) -> Result<()> {
        if dst.len_bytes() != src.len_bytes() {
            return Err(VigilError::InvalidArgument(format!(
                "copy size mismatch: {} vs {} bytes",
                dst.len_bytes(),
                src.len_bytes()
            )));
        }
        let mut s = self.lock()?;
        let deps = s.stream(stream)?.outstanding();
        let op = PendingOp::new();
        let remaining = Arc::new(AtomicUsize::new(deps.len() + 1));
        let finish: Arc<dyn Fn() + Send + Sync> = {
            let op = Arc::clone(&op);
            let (dst, src) = (dst.clone(), src.clone());
            Arc::new(move || {
                if remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
                    return;
                }
                let copied = src.read_bytes().and_then(|bytes| dst.write_bytes(&bytes));
                if let Err(e) = copied {
                    tracing::warn!(error = %e, "local stream copy failed");
                }
                op.complete();
            })
        };
        for dep in &deps {
            let f = Arc::clone(&finish);
            dep.on_complete(Box::new(move || f()));
        }
        s.stream(stream)?.pending.push(Arc::clone(&op));
        drop(s);
        finish();
        Ok(())
    }

    fn record_stream(&self, buffer: &Buffer, _stream: StreamHandle) -> Result<()> {
        let mut s = self.lock()?;
        *s.recorded_buffers.entry(buffer.storage_id()).or_default() += 1;
        Ok(())
    }

    fn capture_status(&self, device: DeviceIndex) -> CaptureStatus {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.capture.get(&device).copied())
            .unwrap_or(CaptureStatus::None)
    }

    fn memory_segments(&self, device: DeviceIndex) -> Vec<MemorySegment> {
        self.state
            .lock()
            .map(|s| {
                s.segments
                    .iter()
                    .filter(|seg| seg.device == device)
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tracks_outstanding_ops() {
        let rt = LocalRuntime::new(1);
        let stream = rt.stream_from_pool(0, false).unwrap();
        let op = PendingOp::new();
        rt.enqueue(stream, Arc::clone(&op)).unwrap();

        let ev = rt.create_event(0, false).unwrap();
        rt.record_event(ev, stream).unwrap();
        assert!(!rt.query_event(ev).unwrap());
        op.complete();
        assert!(rt.query_event(ev).unwrap());
    }

    #[test]
    fn test_event_recorded_on_idle_stream_is_complete() {
        let rt = LocalRuntime::new(1);
        let stream = rt.current_stream(0).unwrap();
        let ev = rt.create_event(0, true).unwrap();
        rt.record_event(ev, stream).unwrap();
        assert!(rt.query_event(ev).unwrap());
    }

    #[test]
    fn test_block_stream_inherits_dependencies() {
        let rt = LocalRuntime::new(1);
        let a = rt.stream_from_pool(0, false).unwrap();
        let b = rt.current_stream(0).unwrap();
        let op = PendingOp::new();
        rt.enqueue(a, Arc::clone(&op)).unwrap();

        let ev = rt.create_event(0, false).unwrap();
        rt.record_event(ev, a).unwrap();
        rt.block_stream(ev, b).unwrap();

        let later = rt.create_event(0, false).unwrap();
        rt.record_event(later, b).unwrap();
        assert!(!rt.query_event(later).unwrap());
        op.complete();
        assert!(rt.query_event(later).unwrap());
    }

    #[test]
    fn test_copy_waits_for_prior_work() {
        let rt = LocalRuntime::new(1);
        let stream = rt.stream_from_pool(0, false).unwrap();
        let gate = PendingOp::new();
        rt.enqueue(stream, Arc::clone(&gate)).unwrap();

        let src = Buffer::from_slice(0, &[1i32, 2, 3]);
        let dst = Buffer::zeros(0, DataType::I32, &[3]);
        rt.copy_async(&dst, &src, stream).unwrap();
        assert_eq!(dst.to_vec::<i32>().unwrap(), vec![0, 0, 0]);
        gate.complete();
        assert_eq!(dst.to_vec::<i32>().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_elapsed_requires_timing() {
        let rt = LocalRuntime::new(1);
        let stream = rt.current_stream(0).unwrap();
        let start = rt.create_event(0, false).unwrap();
        let end = rt.create_event(0, false).unwrap();
        rt.record_event(start, stream).unwrap();
        rt.record_event(end, stream).unwrap();
        assert!(rt.elapsed_ms(start, end).is_err());
    }

    #[test]
    fn test_invalid_device_rejected() {
        let rt = LocalRuntime::new(2);
        assert!(rt.current_stream(2).is_err());
        assert!(rt.allocate(5, DataType::F32, 4).is_err());
    }
}
