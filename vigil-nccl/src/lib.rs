//! NCCL collective backend and CUDA device runtime for vigil.
//!
//! ```no_run
//! use std::sync::Arc;
//! use vigil::{MemStore, ProcessGroup};
//! use vigil_nccl::{CudaRuntime, NcclBackend};
//!
//! # fn main() -> vigil::Result<()> {
//! let runtime = CudaRuntime::new()?;
//! let backend = Arc::new(NcclBackend::new(runtime.clone()));
//! let pg = ProcessGroup::builder(Arc::new(MemStore::new()), 0, 1, backend, Arc::new(runtime))
//!     .build()?;
//! # let _ = pg;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod comm;
pub mod runtime;
pub mod types;

pub use backend::NcclBackend;
pub use comm::NcclComm;
pub use runtime::CudaRuntime;
pub use types::{id_from_bytes, id_to_bytes, status_from_raw, to_nccl_dtype, to_nccl_op};
