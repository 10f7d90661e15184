//! Communicators and their per-group cache.

mod cache;
mod registry;

pub use cache::{CacheSettings, CommRole, CommunicatorCache};
pub use registry::CommRegistry;

use crate::backend::{BackendComm, Event, MemorySegment, StreamHandle, UniqueId};
use crate::error::{Result, VigilError};
use crate::types::DeviceIndex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Lifecycle of a communicator. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommState {
    Initializing,
    Ready,
    Aborted,
}

/// A backend handle bound to one device and one participant-set key,
/// together with the communication stream work on it is issued to.
pub struct Communicator {
    key: String,
    device: DeviceIndex,
    unique_id: UniqueId,
    handle: Arc<dyn BackendComm>,
    stream: StreamHandle,
    /// Lets the communication stream wait on the caller's stream.
    sync_event: Event,
    state: Mutex<CommState>,
    failure_reason: Mutex<Option<String>>,
    split_count: AtomicU64,
    registered_segments: Mutex<HashSet<u64>>,
    registry: Weak<CommRegistry>,
}

impl Communicator {
    pub(crate) fn new(
        key: impl Into<String>,
        device: DeviceIndex,
        unique_id: UniqueId,
        handle: Arc<dyn BackendComm>,
        stream: StreamHandle,
        sync_event: Event,
        registry: &Arc<CommRegistry>,
    ) -> Self {
        Self {
            key: key.into(),
            device,
            unique_id,
            handle,
            stream,
            sync_event,
            state: Mutex::new(CommState::Initializing),
            failure_reason: Mutex::new(None),
            split_count: AtomicU64::new(0),
            registered_segments: Mutex::new(HashSet::new()),
            registry: Arc::downgrade(registry),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn device(&self) -> DeviceIndex {
        self.device
    }

    pub fn unique_id(&self) -> &UniqueId {
        &self.unique_id
    }

    pub fn handle(&self) -> &Arc<dyn BackendComm> {
        &self.handle
    }

    pub fn stream(&self) -> StreamHandle {
        self.stream
    }

    pub(crate) fn sync_event(&self) -> &Event {
        &self.sync_event
    }

    pub fn state(&self) -> CommState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(CommState::Aborted)
    }

    pub fn is_aborted(&self) -> bool {
        self.state() == CommState::Aborted
    }

    pub fn failure_reason(&self) -> Option<String> {
        self.failure_reason.lock().ok().and_then(|r| r.clone())
    }

    /// Number of communicators derived from this one.
    pub fn split_count(&self) -> u64 {
        self.split_count.load(Ordering::Relaxed)
    }

    pub(crate) fn note_split(&self) {
        self.split_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn mark_ready(&self) {
        if let Ok(mut s) = self.state.lock()
            && *s == CommState::Initializing
        {
            *s = CommState::Ready;
        }
    }

    /// Abort the backend handle and deregister from the memory registry.
    ///
    /// Idempotent; the first reason wins.
    pub fn abort(&self, reason: Option<&str>) {
        {
            let Ok(mut s) = self.state.lock() else {
                return;
            };
            if *s == CommState::Aborted {
                return;
            }
            *s = CommState::Aborted;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.deregister(self);
        }
        let status = self.handle.abort();
        if !status.is_ok() {
            tracing::warn!(key = %self.key, %status, "backend abort reported an error");
        }
        if let Ok(mut r) = self.failure_reason.lock()
            && r.is_none()
        {
            *r = Some(reason.unwrap_or("communicator aborted").to_string());
        }
        tracing::info!(key = %self.key, id = %self.unique_id.hex(), "communicator aborted");
    }

    /// Error state of the communicator, preferring the recorded abort reason
    /// over the backend's asynchronous error.
    pub fn check_for_errors(&self) -> Option<VigilError> {
        if let Some(reason) = self.failure_reason() {
            return Some(VigilError::communication(format!(
                "communicator '{}' was aborted: {reason}",
                self.key
            )));
        }
        let status = self.handle.async_error();
        if status.is_ok() {
            return None;
        }
        Some(VigilError::backend(
            format!(
                "asynchronous error on communicator '{}': {}",
                self.key,
                status.describe()
            ),
            status,
        ))
    }

    pub(crate) fn register_segment(&self, segment: &MemorySegment) -> Result<()> {
        let mut registered = self
            .registered_segments
            .lock()
            .map_err(|_| VigilError::LockPoisoned("communicator segments"))?;
        if !registered.insert(segment.address) {
            return Ok(());
        }
        self.handle
            .register_segment(segment.address, segment.len_bytes)
            .check(|| format!("registering segment {:#x} with '{}'", segment.address, self.key))
    }

    pub(crate) fn deregister_segment(&self, address: u64) -> Result<()> {
        let mut registered = self
            .registered_segments
            .lock()
            .map_err(|_| VigilError::LockPoisoned("communicator segments"))?;
        if !registered.remove(&address) {
            return Ok(());
        }
        self.handle
            .deregister_segment(address)
            .check(|| format!("deregistering segment {address:#x} from '{}'", self.key))
    }
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("key", &self.key)
            .field("device", &self.device)
            .field("state", &self.state())
            .finish()
    }
}
