use super::Communicator;
use crate::backend::MemorySegment;
use crate::types::DeviceIndex;
use std::sync::{Arc, Mutex};

/// Live communicators of the process, keyed by device.
///
/// Allocator hooks go through the registry so every communicator on a device
/// sees segments allocated after it was created.
#[derive(Default)]
pub struct CommRegistry {
    entries: Mutex<Vec<Arc<Communicator>>>,
}

impl CommRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, comm: &Arc<Communicator>) {
        if let Ok(mut e) = self.entries.lock()
            && !e.iter().any(|c| Arc::ptr_eq(c, comm))
        {
            e.push(Arc::clone(comm));
        }
    }

    pub fn deregister(&self, comm: &Communicator) {
        if let Ok(mut e) = self.entries.lock() {
            e.retain(|c| !std::ptr::eq(Arc::as_ptr(c), comm));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, comm: &Communicator) -> bool {
        self.entries
            .lock()
            .map(|e| e.iter().any(|c| std::ptr::eq(Arc::as_ptr(c), comm)))
            .unwrap_or(false)
    }

    fn on_device(&self, device: DeviceIndex) -> Vec<Arc<Communicator>> {
        self.entries
            .lock()
            .map(|e| e.iter().filter(|c| c.device() == device).cloned().collect())
            .unwrap_or_default()
    }

    /// Allocator hook: register a new segment with every communicator on its device.
    pub fn segment_allocated(&self, segment: MemorySegment) {
        for comm in self.on_device(segment.device) {
            if let Err(e) = comm.register_segment(&segment) {
                tracing::warn!(key = comm.key(), error = %e, "segment registration failed");
            }
        }
    }

    /// Allocator hook: drop a freed segment from every communicator on its device.
    pub fn segment_freed(&self, device: DeviceIndex, address: u64) {
        for comm in self.on_device(device) {
            if let Err(e) = comm.deregister_segment(address) {
                tracing::warn!(key = comm.key(), error = %e, "segment deregistration failed");
            }
        }
    }
}
