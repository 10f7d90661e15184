use crate::buffer::Buffer;
use crate::error::{Result, VigilError};
use crate::types::{CaptureStatus, DataType, DeviceIndex};
use serde::Serialize;
use std::sync::Arc;

/// Raw stream handle on one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle {
    pub device: DeviceIndex,
    pub raw: u64,
}

/// One block handed out by the device allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemorySegment {
    pub device: DeviceIndex,
    pub address: u64,
    pub len_bytes: usize,
}

/// Streams, events and allocator hooks of the accelerator runtime.
///
/// Event handles are raw `u64` values owned by the runtime; use [`Event`] for
/// an RAII wrapper.
pub trait DeviceRuntime: Send + Sync {
    fn device_count(&self) -> usize;

    /// Stream the caller is currently issuing compute work on.
    fn current_stream(&self, device: DeviceIndex) -> Result<StreamHandle>;

    /// Fresh stream reserved for communication.
    fn stream_from_pool(&self, device: DeviceIndex, high_priority: bool) -> Result<StreamHandle>;

    fn create_event(&self, device: DeviceIndex, enable_timing: bool) -> Result<u64>;

    fn destroy_event(&self, event: u64);

    fn record_event(&self, event: u64, stream: StreamHandle) -> Result<()>;

    /// Make `stream` wait until `event` completes.
    fn block_stream(&self, event: u64, stream: StreamHandle) -> Result<()>;

    /// Whether all work captured by `event` has finished. Never blocks.
    fn query_event(&self, event: u64) -> Result<bool>;

    fn elapsed_ms(&self, start: u64, end: u64) -> Result<f32>;

    fn allocate(&self, device: DeviceIndex, dtype: DataType, numel: usize) -> Result<Buffer>;

    /// Copy `src` into `dst` in stream order.
    fn copy_async(&self, dst: &Buffer, src: &Buffer, stream: StreamHandle) -> Result<()>;

    /// Tell the allocator `buffer` is in use on `stream` so its memory is not
    /// reused before the stream's pending work finishes.
    fn record_stream(&self, buffer: &Buffer, stream: StreamHandle) -> Result<()>;

    fn capture_status(&self, device: DeviceIndex) -> CaptureStatus;

    /// Snapshot of the allocator's segments on `device`.
    fn memory_segments(&self, device: DeviceIndex) -> Vec<MemorySegment>;
}

/// Device event destroyed when dropped.
pub struct Event {
    raw: u64,
    device: DeviceIndex,
    timing: bool,
    runtime: Arc<dyn DeviceRuntime>,
}

impl Event {
    pub fn new(
        runtime: &Arc<dyn DeviceRuntime>,
        device: DeviceIndex,
        enable_timing: bool,
    ) -> Result<Self> {
        let raw = runtime.create_event(device, enable_timing)?;
        Ok(Self {
            raw,
            device,
            timing: enable_timing,
            runtime: Arc::clone(runtime),
        })
    }

    pub fn device(&self) -> DeviceIndex {
        self.device
    }

    pub fn record(&self, stream: StreamHandle) -> Result<()> {
        self.runtime.record_event(self.raw, stream)
    }

    /// Make `stream` wait for this event.
    pub fn block(&self, stream: StreamHandle) -> Result<()> {
        self.runtime.block_stream(self.raw, stream)
    }

    pub fn query(&self) -> Result<bool> {
        self.runtime.query_event(self.raw)
    }

    /// Milliseconds between this event and `end`. Both need timing enabled.
    pub fn elapsed_ms(&self, end: &Event) -> Result<f32> {
        if !self.timing || !end.timing {
            return Err(VigilError::InvalidState(
                "elapsed time requires events created with timing enabled".into(),
            ));
        }
        self.runtime.elapsed_ms(self.raw, end.raw)
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        self.runtime.destroy_event(self.raw);
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("raw", &self.raw)
            .field("device", &self.device)
            .field("timing", &self.timing)
            .finish()
    }
}
