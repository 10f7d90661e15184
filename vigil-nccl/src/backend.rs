use crate::comm::NcclComm;
use crate::runtime::CudaRuntime;
use crate::types::{id_from_bytes, id_to_bytes, nccl_error, status_of};
use cudarc::nccl::result as nccl;
use std::sync::Arc;
use vigil::backend::UniqueId;
use vigil::{BackendComm, BackendStatus, CollectiveBackend, DeviceIndex, Rank, Result};

/// [`CollectiveBackend`] over the NCCL library.
#[derive(Clone)]
pub struct NcclBackend {
    runtime: CudaRuntime,
}

impl NcclBackend {
    pub fn new(runtime: CudaRuntime) -> Self {
        Self { runtime }
    }

    /// `(major, minor, patch)` of the loaded library.
    pub fn version(&self) -> Result<(i32, i32, i32)> {
        let code = nccl::get_nccl_version().map_err(|e| nccl_error("ncclGetVersion", e))?;
        // 2.19.3 is encoded as 21903.
        Ok((code / 10000, (code % 10000) / 100, code % 100))
    }
}

impl CollectiveBackend for NcclBackend {
    fn name(&self) -> &'static str {
        "NCCL"
    }

    fn generate_unique_id(&self) -> Result<UniqueId> {
        let id = nccl::get_uniqueid().map_err(|e| nccl_error("ncclGetUniqueId", e))?;
        Ok(id_to_bytes(&id))
    }

    fn create_comm(
        &self,
        id: &UniqueId,
        world_size: u32,
        rank: Rank,
        device: DeviceIndex,
    ) -> Result<Arc<dyn BackendComm>> {
        let raw = id_from_bytes(id)?;
        tracing::debug!(rank, world_size, device, id = %id.hex(), "initializing NCCL communicator");
        let comm = NcclComm::init(self.runtime.clone(), raw, world_size, rank, device)?;
        Ok(Arc::new(comm))
    }

    fn group_start(&self) -> BackendStatus {
        status_of(nccl::group_start())
    }

    fn group_end(&self) -> BackendStatus {
        status_of(nccl::group_end())
    }
}
