//! Interfaces to the vendor collective library and the device runtime.
//!
//! The dispatch layer never moves data itself. It drives a
//! [`CollectiveBackend`] for communicator creation and the collective
//! primitives, and a [`DeviceRuntime`] for streams, events and the allocator.

mod device;
pub mod local;

pub use device::{DeviceRuntime, Event, MemorySegment, StreamHandle};

use crate::buffer::Buffer;
use crate::error::{Result, VigilError};
use crate::types::{DeviceIndex, Rank, ReduceOp};
use std::sync::Arc;

/// Status code returned by every backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendStatus {
    Success,
    /// A non-blocking call is still running.
    InProgress,
    UnhandledDeviceError,
    SystemError,
    InternalError,
    InvalidArgument,
    InvalidUsage,
    /// A peer failed or disappeared.
    RemoteError,
}

impl BackendStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, BackendStatus::Success | BackendStatus::InProgress)
    }

    /// Convert a failing status into a `Communication` error.
    pub fn check(self, context: impl FnOnce() -> String) -> Result<()> {
        if self.is_ok() {
            return Ok(());
        }
        Err(VigilError::backend(
            format!("{} ({})", context(), self.describe()),
            self,
        ))
    }

    pub fn describe(self) -> &'static str {
        match self {
            BackendStatus::Success => "no error",
            BackendStatus::InProgress => "operation in progress",
            BackendStatus::UnhandledDeviceError => "unhandled device error",
            BackendStatus::SystemError => "unhandled system error",
            BackendStatus::InternalError => "internal check failed",
            BackendStatus::InvalidArgument => "invalid argument",
            BackendStatus::InvalidUsage => "invalid usage",
            BackendStatus::RemoteError => "remote process exited or there was a network error",
        }
    }
}

impl std::fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.describe())
    }
}

/// Opaque id every member of a communicator must agree on before creating it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UniqueId(pub Vec<u8>);

impl UniqueId {
    /// Per-byte lowercase hex rendering, used in store keys and logs.
    pub fn hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:x}")).collect()
    }
}

/// Store key under which a rank records that it aborted communicator `id`.
pub fn aborted_comm_store_key(id: &UniqueId) -> String {
    format!("NCCLABORTEDCOMM:{}", id.hex())
}

/// Entry point of a vendor collective library.
pub trait CollectiveBackend: Send + Sync {
    /// Short name used for store trace keys, e.g. `"NCCL"`.
    fn name(&self) -> &'static str;

    fn generate_unique_id(&self) -> Result<UniqueId>;

    /// Create the handle for `rank` of a communicator of `world_size` members.
    fn create_comm(
        &self,
        id: &UniqueId,
        world_size: u32,
        rank: Rank,
        device: DeviceIndex,
    ) -> Result<Arc<dyn BackendComm>>;

    /// Open a group: calls until the matching `group_end` are launched together.
    fn group_start(&self) -> BackendStatus;

    fn group_end(&self) -> BackendStatus;
}

/// One rank's handle on a backend communicator.
///
/// Collective calls only enqueue work on `stream`; they return as soon as the
/// backend accepted the call.
pub trait BackendComm: Send + Sync {
    fn rank(&self) -> Rank;

    fn device(&self) -> DeviceIndex;

    /// Derive a communicator over the members that pass the same `color`.
    ///
    /// `Ok(None)` when this rank passed [`NO_COLOR`](crate::types::NO_COLOR)
    /// or the backend cannot split.
    fn split(&self, color: i32, key: Rank) -> Result<Option<Arc<dyn BackendComm>>>;

    fn abort(&self) -> BackendStatus;

    /// Error raised asynchronously by work already enqueued on this communicator.
    fn async_error(&self) -> BackendStatus;

    fn register_segment(&self, address: u64, len_bytes: usize) -> BackendStatus;

    fn deregister_segment(&self, address: u64) -> BackendStatus;

    fn all_reduce(
        &self,
        send: &Buffer,
        recv: &Buffer,
        op: ReduceOp,
        stream: StreamHandle,
    ) -> BackendStatus;

    fn broadcast(&self, send: &Buffer, recv: &Buffer, root: Rank, stream: StreamHandle)
    -> BackendStatus;

    fn reduce(
        &self,
        send: &Buffer,
        recv: &Buffer,
        op: ReduceOp,
        root: Rank,
        stream: StreamHandle,
    ) -> BackendStatus;

    /// `recv` holds `world_size * send.numel()` elements in rank order.
    fn all_gather(&self, send: &Buffer, recv: &Buffer, stream: StreamHandle) -> BackendStatus;

    /// `send` holds `world_size * recv.numel()` elements in rank order.
    fn reduce_scatter(
        &self,
        send: &Buffer,
        recv: &Buffer,
        op: ReduceOp,
        stream: StreamHandle,
    ) -> BackendStatus;

    fn send(&self, buffer: &Buffer, peer: Rank, stream: StreamHandle) -> BackendStatus;

    fn recv(&self, buffer: &Buffer, peer: Rank, stream: StreamHandle) -> BackendStatus;
}
