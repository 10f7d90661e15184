pub mod backend;
pub mod buffer;
pub mod comm;
pub mod config;
pub mod debug;
pub mod desync;
pub mod error;
pub mod flight_recorder;
pub mod group;
mod heartbeat;
pub mod hooks;
pub mod reduce;
pub mod store;
pub mod types;
mod watchdog;
pub mod work;

pub use backend::local::{LocalBackend, LocalFabric, LocalRuntime};
pub use backend::{BackendComm, BackendStatus, CollectiveBackend, DeviceRuntime, Event};
pub use buffer::Buffer;
pub use comm::{CommRegistry, CommState, Communicator, CommunicatorCache};
pub use config::{ErrorHandling, ProcessGroupConfig};
pub use debug::{
    DebugInfoWriter, DumpTrigger, FileDebugInfoWriter, FileDumpTrigger, LivenessProbe,
    MemoryDebugInfoWriter, ProcessTerminator, RecordingTerminator, StackDumper, Terminator,
};
pub use error::{Result, VigilError};
pub use flight_recorder::{DumpFilter, FlightRecorder};
pub use group::{ProcessGroup, ProcessGroupBuilder, ProcessGroupOptions, TIMEOUT_DUMP_KEY};
pub use hooks::CompletionHook;
pub use reduce::Element;
pub use store::{MemStore, PrefixStore, Store};
pub use types::{CaptureStatus, DataType, DeviceIndex, NO_COLOR, OpKind, Rank, ReduceOp};
pub use work::{Work, WorkInfo, WorkState};
