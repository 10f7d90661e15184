use crate::runtime::CudaRuntime;
use crate::types::{status_from_raw, status_of, to_nccl_dtype, to_nccl_op};
use cudarc::nccl::{result as nccl, sys};
use std::collections::HashMap;
use std::ffi::c_void;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use vigil::backend::StreamHandle;
use vigil::{
    BackendComm, BackendStatus, Buffer, DeviceIndex, NO_COLOR, Rank, ReduceOp, Result,
};

/// One rank's handle on an NCCL communicator.
///
/// Uses cudarc's `result` layer directly (raw pointers) rather than the `safe`
/// layer, because buffers reach us as `u64` device pointers.
pub struct NcclComm {
    comm: sys::ncclComm_t,
    rank: Rank,
    device: DeviceIndex,
    runtime: CudaRuntime,
    aborted: AtomicBool,
    /// Registration handles keyed by segment address.
    registrations: Mutex<HashMap<u64, usize>>,
}

// SAFETY: ncclComm_t is thread-safe per NCCL documentation when used with
// proper stream synchronization. Registration handles are only touched under
// the mutex.
unsafe impl Send for NcclComm {}
unsafe impl Sync for NcclComm {}

impl NcclComm {
    /// Join communicator `id` as `rank` of `world_size`, on `device`.
    pub fn init(
        runtime: CudaRuntime,
        id: sys::ncclUniqueId,
        world_size: u32,
        rank: Rank,
        device: DeviceIndex,
    ) -> Result<Self> {
        runtime.bind(device)?;
        let mut comm = MaybeUninit::uninit();
        unsafe { nccl::comm_init_rank(comm.as_mut_ptr(), world_size as i32, id, rank as i32) }
            .map_err(|e| crate::types::nccl_error("ncclCommInitRank", e))?;
        Ok(Self::wrap(
            unsafe { comm.assume_init() },
            rank,
            device,
            runtime,
        ))
    }

    fn wrap(comm: sys::ncclComm_t, rank: Rank, device: DeviceIndex, runtime: CudaRuntime) -> Self {
        Self {
            comm,
            rank,
            device,
            runtime,
            aborted: AtomicBool::new(false),
            registrations: Mutex::new(HashMap::new()),
        }
    }

    fn launch(&self, f: impl FnOnce() -> BackendStatus) -> BackendStatus {
        if self.aborted.load(Ordering::Acquire) {
            return BackendStatus::InvalidUsage;
        }
        if let Err(e) = self.runtime.bind(self.device) {
            tracing::warn!(rank = self.rank, "cannot bind device {}: {e}", self.device);
            return BackendStatus::UnhandledDeviceError;
        }
        f()
    }

    fn with_op(
        &self,
        op: ReduceOp,
        f: impl FnOnce(sys::ncclRedOp_t) -> BackendStatus,
    ) -> BackendStatus {
        match to_nccl_op(op) {
            Some(nccl_op) => f(nccl_op),
            None => {
                // Custom NCCL ops are opaque ids that do not fit the bindgen enum.
                tracing::warn!(rank = self.rank, "reduce op {op} is not supported by NCCL");
                BackendStatus::InvalidArgument
            }
        }
    }
}

fn send_ptr(buffer: &Buffer) -> Option<*const c_void> {
    buffer.device_ptr().map(|p| p as usize as *const c_void)
}

fn recv_ptr(buffer: &Buffer) -> Option<*mut c_void> {
    buffer.device_ptr().map(|p| p as usize as *mut c_void)
}

fn nccl_stream(stream: StreamHandle) -> sys::cudaStream_t {
    stream.raw as usize as sys::cudaStream_t
}

impl BackendComm for NcclComm {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn device(&self) -> DeviceIndex {
        self.device
    }

    fn split(&self, color: i32, key: Rank) -> Result<Option<Arc<dyn BackendComm>>> {
        self.runtime.bind(self.device)?;
        let mut child: sys::ncclComm_t = std::ptr::null_mut();
        let code = unsafe {
            sys::ncclCommSplit(
                self.comm,
                color,
                key as i32,
                &mut child,
                std::ptr::null_mut(),
            )
        };
        status_from_raw(code).check(|| format!("ncclCommSplit(color {color}, key {key})"))?;
        if color == NO_COLOR || child.is_null() {
            return Ok(None);
        }
        let child_rank = unsafe { nccl::comm_user_rank(child) }
            .map_err(|e| crate::types::nccl_error("ncclCommUserRank", e))?;
        Ok(Some(Arc::new(Self::wrap(
            child,
            child_rank as Rank,
            self.device,
            self.runtime.clone(),
        ))))
    }

    fn abort(&self) -> BackendStatus {
        if self.aborted.swap(true, Ordering::AcqRel) {
            return BackendStatus::Success;
        }
        let _ = self.runtime.bind(self.device);
        status_of(unsafe { nccl::comm_abort(self.comm) })
    }

    fn async_error(&self) -> BackendStatus {
        if self.aborted.load(Ordering::Acquire) {
            return BackendStatus::Success;
        }
        let mut code = sys::ncclResult_t::ncclSuccess;
        let queried = unsafe { sys::ncclCommGetAsyncError(self.comm, &mut code) };
        if queried != sys::ncclResult_t::ncclSuccess {
            return status_from_raw(queried);
        }
        status_from_raw(code)
    }

    fn register_segment(&self, address: u64, len_bytes: usize) -> BackendStatus {
        self.launch(|| {
            let mut handle: *mut c_void = std::ptr::null_mut();
            let code = unsafe {
                sys::ncclCommRegister(
                    self.comm,
                    address as usize as *mut c_void,
                    len_bytes,
                    &mut handle,
                )
            };
            if code == sys::ncclResult_t::ncclSuccess
                && let Ok(mut regs) = self.registrations.lock()
            {
                regs.insert(address, handle as usize);
            }
            status_from_raw(code)
        })
    }

    fn deregister_segment(&self, address: u64) -> BackendStatus {
        let handle = self
            .registrations
            .lock()
            .ok()
            .and_then(|mut regs| regs.remove(&address));
        let Some(handle) = handle else {
            return BackendStatus::InvalidArgument;
        };
        self.launch(|| {
            status_from_raw(unsafe {
                sys::ncclCommDeregister(self.comm, handle as *mut c_void)
            })
        })
    }

    fn all_reduce(
        &self,
        send: &Buffer,
        recv: &Buffer,
        op: ReduceOp,
        stream: StreamHandle,
    ) -> BackendStatus {
        let (Some(s), Some(r)) = (send_ptr(send), recv_ptr(recv)) else {
            return BackendStatus::InvalidArgument;
        };
        self.launch(|| {
            self.with_op(op, |nccl_op| {
                status_of(unsafe {
                    nccl::all_reduce(
                        s,
                        r,
                        send.numel(),
                        to_nccl_dtype(send.dtype()),
                        nccl_op,
                        self.comm,
                        nccl_stream(stream),
                    )
                })
            })
        })
    }

    fn broadcast(
        &self,
        send: &Buffer,
        recv: &Buffer,
        root: Rank,
        stream: StreamHandle,
    ) -> BackendStatus {
        let (Some(s), Some(r)) = (send_ptr(send), recv_ptr(recv)) else {
            return BackendStatus::InvalidArgument;
        };
        self.launch(|| {
            status_of(unsafe {
                nccl::broadcast(
                    s,
                    r,
                    send.numel(),
                    to_nccl_dtype(send.dtype()),
                    root as i32,
                    self.comm,
                    nccl_stream(stream),
                )
            })
        })
    }

    fn reduce(
        &self,
        send: &Buffer,
        recv: &Buffer,
        op: ReduceOp,
        root: Rank,
        stream: StreamHandle,
    ) -> BackendStatus {
        let (Some(s), Some(r)) = (send_ptr(send), recv_ptr(recv)) else {
            return BackendStatus::InvalidArgument;
        };
        self.launch(|| {
            self.with_op(op, |nccl_op| {
                status_of(unsafe {
                    nccl::reduce(
                        s,
                        r,
                        send.numel(),
                        to_nccl_dtype(send.dtype()),
                        nccl_op,
                        root as i32,
                        self.comm,
                        nccl_stream(stream),
                    )
                })
            })
        })
    }

    fn all_gather(&self, send: &Buffer, recv: &Buffer, stream: StreamHandle) -> BackendStatus {
        let (Some(s), Some(r)) = (send_ptr(send), recv_ptr(recv)) else {
            return BackendStatus::InvalidArgument;
        };
        self.launch(|| {
            status_of(unsafe {
                nccl::all_gather(
                    s,
                    r,
                    send.numel(),
                    to_nccl_dtype(send.dtype()),
                    self.comm,
                    nccl_stream(stream),
                )
            })
        })
    }

    fn reduce_scatter(
        &self,
        send: &Buffer,
        recv: &Buffer,
        op: ReduceOp,
        stream: StreamHandle,
    ) -> BackendStatus {
        let (Some(s), Some(r)) = (send_ptr(send), recv_ptr(recv)) else {
            return BackendStatus::InvalidArgument;
        };
        self.launch(|| {
            self.with_op(op, |nccl_op| {
                status_of(unsafe {
                    nccl::reduce_scatter(
                        s,
                        r,
                        recv.numel(),
                        to_nccl_dtype(recv.dtype()),
                        nccl_op,
                        self.comm,
                        nccl_stream(stream),
                    )
                })
            })
        })
    }

    fn send(&self, buffer: &Buffer, peer: Rank, stream: StreamHandle) -> BackendStatus {
        let Some(p) = send_ptr(buffer) else {
            return BackendStatus::InvalidArgument;
        };
        self.launch(|| {
            status_of(unsafe {
                nccl::send(
                    p,
                    buffer.numel(),
                    to_nccl_dtype(buffer.dtype()),
                    peer as i32,
                    self.comm,
                    nccl_stream(stream),
                )
            })
        })
    }

    fn recv(&self, buffer: &Buffer, peer: Rank, stream: StreamHandle) -> BackendStatus {
        let Some(p) = recv_ptr(buffer) else {
            return BackendStatus::InvalidArgument;
        };
        self.launch(|| {
            status_of(unsafe {
                nccl::recv(
                    p,
                    buffer.numel(),
                    to_nccl_dtype(buffer.dtype()),
                    peer as i32,
                    self.comm,
                    nccl_stream(stream),
                )
            })
        })
    }
}

impl Drop for NcclComm {
    fn drop(&mut self) {
        if self.aborted.load(Ordering::Acquire) {
            return;
        }
        let _ = self.runtime.bind(self.device);
        unsafe {
            // comm_abort does not wait for outstanding work on the stream.
            let _ = nccl::comm_abort(self.comm);
        }
    }
}
