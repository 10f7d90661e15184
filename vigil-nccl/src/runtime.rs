//! CUDA implementation of [`DeviceRuntime`] over the driver API.
//!
//! Handles cross the trait boundary as `u64`: streams and events are the raw
//! `CUstream` / `CUevent` pointers. Every call first makes the device's
//! primary context current on the calling thread, since tokio may move tasks
//! between threads.

use crate::types::driver_error;
use cudarc::driver::result::{self as cuda, stream::StreamKind};
use cudarc::driver::sys;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use vigil::backend::{MemorySegment, StreamHandle};
use vigil::{Buffer, CaptureStatus, DataType, DeviceIndex, DeviceRuntime, Result, VigilError};

struct Retained {
    event: sys::CUevent,
    device: DeviceIndex,
    _buffer: Buffer,
}

#[derive(Default)]
struct State {
    /// Streams installed with [`CudaRuntime::set_current_stream`].
    current: HashMap<DeviceIndex, u64>,
    events: HashMap<u64, DeviceIndex>,
    segments: HashMap<u64, MemorySegment>,
    /// Buffers kept alive until the streams that use them pass an event.
    retained: Vec<Retained>,
}

struct Inner {
    contexts: Vec<sys::CUcontext>,
    state: Mutex<State>,
}

// SAFETY: primary contexts are process-wide and valid on any thread once made
// current; the raw handles in `State` are only used under the mutex.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

impl Inner {
    fn bind(&self, device: DeviceIndex) -> Result<()> {
        let ctx = self.contexts.get(device as usize).copied().ok_or_else(|| {
            VigilError::InvalidArgument(format!(
                "device {device} out of range ({} visible)",
                self.contexts.len()
            ))
        })?;
        unsafe { cuda::ctx::set_current(ctx) }
            .map_err(|e| driver_error(&format!("cuCtxSetCurrent on device {device}"), e))
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| VigilError::LockPoisoned("cuda runtime state"))
    }
}

/// Device memory handed out by [`CudaRuntime::allocate`], freed on drop.
struct Allocation {
    ptr: sys::CUdeviceptr,
    device: DeviceIndex,
    inner: Arc<Inner>,
}

impl Drop for Allocation {
    fn drop(&mut self) {
        if let Ok(mut s) = self.inner.state.lock() {
            s.segments.remove(&self.ptr);
        }
        if self.inner.bind(self.device).is_ok()
            && let Err(e) = unsafe { cuda::free_sync(self.ptr) }
        {
            tracing::warn!(device = self.device, "failed to free device memory: {e}");
        }
    }
}

/// CUDA driver runtime covering every visible device.
#[derive(Clone)]
pub struct CudaRuntime {
    inner: Arc<Inner>,
}

impl CudaRuntime {
    /// Initialize the driver and retain the primary context of every device.
    pub fn new() -> Result<Self> {
        cuda::init().map_err(|e| driver_error("cuInit", e))?;
        let count = cuda::device::get_count().map_err(|e| driver_error("cuDeviceGetCount", e))?;
        let mut contexts = Vec::with_capacity(count as usize);
        for ordinal in 0..count {
            let dev = cuda::device::get(ordinal)
                .map_err(|e| driver_error(&format!("cuDeviceGet({ordinal})"), e))?;
            let ctx = unsafe { cuda::primary_ctx::retain(dev) }
                .map_err(|e| driver_error(&format!("cuDevicePrimaryCtxRetain({ordinal})"), e))?;
            contexts.push(ctx);
        }
        tracing::info!(devices = count, "CUDA runtime initialized");
        Ok(Self {
            inner: Arc::new(Inner {
                contexts,
                state: Mutex::new(State::default()),
            }),
        })
    }

    /// Make `device` current on the calling thread.
    pub fn bind(&self, device: DeviceIndex) -> Result<()> {
        self.inner.bind(device)
    }

    /// Declare the stream compute work is issued on. Defaults to the legacy
    /// default stream.
    pub fn set_current_stream(&self, device: DeviceIndex, raw: u64) -> Result<()> {
        self.inner.lock()?.current.insert(device, raw);
        Ok(())
    }

    /// Detach retained buffers whose streams have moved past their event.
    /// The caller drops them after releasing the state lock, since the last
    /// view of an allocation unregisters its segment.
    fn sweep(&self, s: &mut State) -> Vec<Retained> {
        let (done, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut s.retained)
            .into_iter()
            .partition(|r| {
                self.inner.bind(r.device).is_ok()
                    && unsafe { sys::cuEventQuery(r.event) }.result().is_ok()
            });
        s.retained = pending;
        for r in &done {
            let _ = unsafe { cuda::event::destroy(r.event) };
        }
        done
    }
}

pub(crate) fn raw_stream(stream: StreamHandle) -> sys::CUstream {
    stream.raw as usize as sys::CUstream
}

fn raw_event(event: u64) -> sys::CUevent {
    event as usize as sys::CUevent
}

fn device_ptr(buffer: &Buffer, what: &str) -> Result<sys::CUdeviceptr> {
    buffer.device_ptr().ok_or_else(|| {
        VigilError::InvalidArgument(format!("{what} buffer is host memory, expected device memory"))
    })
}

impl DeviceRuntime for CudaRuntime {
    fn device_count(&self) -> usize {
        self.inner.contexts.len()
    }

    fn current_stream(&self, device: DeviceIndex) -> Result<StreamHandle> {
        self.bind(device)?;
        let raw = self.inner.lock()?.current.get(&device).copied().unwrap_or(0);
        Ok(StreamHandle { device, raw })
    }

    fn stream_from_pool(&self, device: DeviceIndex, high_priority: bool) -> Result<StreamHandle> {
        self.bind(device)?;
        let stream = if high_priority {
            let (mut least, mut greatest) = (0, 0);
            let mut stream = std::ptr::null_mut();
            unsafe {
                sys::cuCtxGetStreamPriorityRange(&mut least, &mut greatest)
                    .result()
                    .map_err(|e| driver_error("cuCtxGetStreamPriorityRange", e))?;
                sys::cuStreamCreateWithPriority(
                    &mut stream,
                    sys::CUstream_flags::CU_STREAM_NON_BLOCKING as u32,
                    greatest,
                )
                .result()
                .map_err(|e| driver_error("cuStreamCreateWithPriority", e))?;
            }
            stream
        } else {
            cuda::stream::create(StreamKind::NonBlocking)
                .map_err(|e| driver_error("cuStreamCreate", e))?
        };
        tracing::debug!(device, high_priority, "created communication stream");
        Ok(StreamHandle {
            device,
            raw: stream as usize as u64,
        })
    }

    fn create_event(&self, device: DeviceIndex, enable_timing: bool) -> Result<u64> {
        self.bind(device)?;
        let flags = if enable_timing {
            sys::CUevent_flags::CU_EVENT_DEFAULT
        } else {
            sys::CUevent_flags::CU_EVENT_DISABLE_TIMING
        };
        let event = cuda::event::create(flags).map_err(|e| driver_error("cuEventCreate", e))?;
        let raw = event as usize as u64;
        self.inner.lock()?.events.insert(raw, device);
        Ok(raw)
    }

    fn destroy_event(&self, event: u64) {
        let Some(device) = self
            .inner
            .state
            .lock()
            .ok()
            .and_then(|mut s| s.events.remove(&event))
        else {
            return;
        };
        if self.bind(device).is_ok()
            && let Err(e) = unsafe { cuda::event::destroy(raw_event(event)) }
        {
            tracing::warn!(device, "failed to destroy event: {e}");
        }
    }

    fn record_event(&self, event: u64, stream: StreamHandle) -> Result<()> {
        self.bind(stream.device)?;
        unsafe { cuda::event::record(raw_event(event), raw_stream(stream)) }
            .map_err(|e| driver_error("cuEventRecord", e))
    }

    fn block_stream(&self, event: u64, stream: StreamHandle) -> Result<()> {
        self.bind(stream.device)?;
        unsafe {
            cuda::stream::wait_event(
                raw_stream(stream),
                raw_event(event),
                sys::CUevent_wait_flags::CU_EVENT_WAIT_DEFAULT,
            )
        }
        .map_err(|e| driver_error("cuStreamWaitEvent", e))
    }

    fn query_event(&self, event: u64) -> Result<bool> {
        if let Some(&device) = self.inner.lock()?.events.get(&event) {
            self.bind(device)?;
        }
        match unsafe { sys::cuEventQuery(raw_event(event)) }.result() {
            Ok(()) => Ok(true),
            Err(e) if e.0 == sys::CUresult::CUDA_ERROR_NOT_READY => Ok(false),
            Err(e) => Err(driver_error("cuEventQuery", e)),
        }
    }

    fn elapsed_ms(&self, start: u64, end: u64) -> Result<f32> {
        if let Some(&device) = self.inner.lock()?.events.get(&start) {
            self.bind(device)?;
        }
        unsafe { cuda::event::elapsed(raw_event(start), raw_event(end)) }
            .map_err(|e| driver_error("cuEventElapsedTime", e))
    }

    fn allocate(&self, device: DeviceIndex, dtype: DataType, numel: usize) -> Result<Buffer> {
        self.bind(device)?;
        let len_bytes = numel * dtype.size_in_bytes();
        let ptr = unsafe { cuda::malloc_sync(len_bytes.max(1)) }
            .map_err(|e| driver_error(&format!("cuMemAlloc of {len_bytes} bytes"), e))?;
        unsafe { cuda::memset_d8_sync(ptr, 0, len_bytes) }
            .map_err(|e| driver_error("cuMemsetD8", e))?;
        self.inner.lock()?.segments.insert(
            ptr,
            MemorySegment {
                device,
                address: ptr,
                len_bytes,
            },
        );
        let owner = Arc::new(Allocation {
            ptr,
            device,
            inner: Arc::clone(&self.inner),
        });
        // SAFETY: `ptr` covers `len_bytes` on `device` and lives as long as `owner`.
        Ok(unsafe { Buffer::from_device_ptr(device, ptr, dtype, &[numel], Some(owner)) })
    }

    fn copy_async(&self, dst: &Buffer, src: &Buffer, stream: StreamHandle) -> Result<()> {
        if dst.len_bytes() != src.len_bytes() {
            return Err(VigilError::InvalidArgument(format!(
                "copy size mismatch: {} vs {} bytes",
                dst.len_bytes(),
                src.len_bytes()
            )));
        }
        let (d, s) = (device_ptr(dst, "copy destination")?, device_ptr(src, "copy source")?);
        self.bind(stream.device)?;
        unsafe { cuda::memcpy_dtod_async(d, s, src.len_bytes(), raw_stream(stream)) }
            .map_err(|e| driver_error("cuMemcpyDtoDAsync", e))
    }

    fn record_stream(&self, buffer: &Buffer, stream: StreamHandle) -> Result<()> {
        self.bind(stream.device)?;
        let event = cuda::event::create(sys::CUevent_flags::CU_EVENT_DISABLE_TIMING)
            .map_err(|e| driver_error("cuEventCreate", e))?;
        unsafe { cuda::event::record(event, raw_stream(stream)) }
            .map_err(|e| driver_error("cuEventRecord", e))?;
        let mut s = self.inner.lock()?;
        let released = self.sweep(&mut s);
        s.retained.push(Retained {
            event,
            device: stream.device,
            _buffer: buffer.clone(),
        });
        drop(s);
        drop(released);
        Ok(())
    }

    fn capture_status(&self, device: DeviceIndex) -> CaptureStatus {
        let Ok(stream) = self.current_stream(device) else {
            return CaptureStatus::None;
        };
        let mut status = sys::CUstreamCaptureStatus::CU_STREAM_CAPTURE_STATUS_NONE;
        let queried = unsafe { sys::cuStreamIsCapturing(raw_stream(stream), &mut status) }.result();
        match (queried, status) {
            (Err(e), _) => {
                tracing::warn!(device, "cuStreamIsCapturing failed: {e}");
                CaptureStatus::None
            }
            (Ok(()), sys::CUstreamCaptureStatus::CU_STREAM_CAPTURE_STATUS_ACTIVE) => {
                CaptureStatus::Active
            }
            (Ok(()), sys::CUstreamCaptureStatus::CU_STREAM_CAPTURE_STATUS_INVALIDATED) => {
                CaptureStatus::Invalidated
            }
            (Ok(()), _) => CaptureStatus::None,
        }
    }

    fn memory_segments(&self, device: DeviceIndex) -> Vec<MemorySegment> {
        let released = match self.inner.lock() {
            Ok(mut s) => self.sweep(&mut s),
            Err(_) => return Vec::new(),
        };
        drop(released);
        let Ok(s) = self.inner.lock() else {
            return Vec::new();
        };
        let mut segments: Vec<MemorySegment> = s
            .segments
            .values()
            .filter(|seg| seg.device == device)
            .copied()
            .collect();
        segments.sort_by_key(|seg| seg.address);
        segments
    }
}
