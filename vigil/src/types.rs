use serde::Serialize;

/// Rank of a participant in a process group (0-indexed).
pub type Rank = u32;

/// Local accelerator device ordinal.
pub type DeviceIndex = u32;

/// Color passed to a split by ranks that do not join the derived communicator.
pub const NO_COLOR: i32 = -1;

/// Element types understood by the dispatch layer and the backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum DataType {
    F32 = 0,
    F64 = 1,
    F16 = 2,
    BF16 = 3,
    I8 = 4,
    I32 = 5,
    I64 = 6,
    U8 = 7,
    U32 = 8,
    U64 = 9,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            DataType::F32 | DataType::I32 | DataType::U32 => 4,
            DataType::F64 | DataType::I64 | DataType::U64 => 8,
            DataType::F16 | DataType::BF16 => 2,
            DataType::I8 | DataType::U8 => 1,
        }
    }

    /// Human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::F16 => "f16",
            DataType::BF16 => "bf16",
            DataType::I8 => "i8",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::U8 => "u8",
            DataType::U32 => "u32",
            DataType::U64 => "u64",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Reduction operations for collective communication.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReduceOp {
    /// Element-wise sum across ranks.
    Sum,
    /// Element-wise product across ranks.
    Prod,
    /// Element-wise minimum across ranks.
    Min,
    /// Element-wise maximum across ranks.
    Max,
    /// Sum divided by the number of participants.
    Avg,
    /// Each contribution is multiplied by the factor before summing.
    PreMulSum(f64),
}

impl std::fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReduceOp::Sum => f.write_str("sum"),
            ReduceOp::Prod => f.write_str("prod"),
            ReduceOp::Min => f.write_str("min"),
            ReduceOp::Max => f.write_str("max"),
            ReduceOp::Avg => f.write_str("avg"),
            ReduceOp::PreMulSum(factor) => write!(f, "premul_sum({factor})"),
        }
    }
}

/// Kind of operation a Work or a trace entry stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Broadcast,
    AllReduce,
    AllReduceCoalesced,
    Reduce,
    AllGather,
    AllGatherBase,
    AllGatherCoalesced,
    Gather,
    Scatter,
    ReduceScatter,
    ReduceScatterBase,
    ReduceScatterCoalesced,
    AllToAllBase,
    AllToAll,
    Send,
    Recv,
    Barrier,
    Coalesced,
    Unknown,
}

impl OpKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            OpKind::Broadcast => "BROADCAST",
            OpKind::AllReduce => "ALLREDUCE",
            OpKind::AllReduceCoalesced => "ALLREDUCE_COALESCED",
            OpKind::Reduce => "REDUCE",
            OpKind::AllGather => "ALLGATHER",
            OpKind::AllGatherBase => "_ALLGATHER_BASE",
            OpKind::AllGatherCoalesced => "ALLGATHER_COALESCED",
            OpKind::Gather => "GATHER",
            OpKind::Scatter => "SCATTER",
            OpKind::ReduceScatter => "REDUCE_SCATTER",
            OpKind::ReduceScatterBase => "_REDUCE_SCATTER_BASE",
            OpKind::ReduceScatterCoalesced => "REDUCE_SCATTER_COALESCED",
            OpKind::AllToAllBase => "ALLTOALL_BASE",
            OpKind::AllToAll => "ALLTOALL",
            OpKind::Send => "SEND",
            OpKind::Recv => "RECV",
            OpKind::Barrier => "BARRIER",
            OpKind::Coalesced => "COALESCED",
            OpKind::Unknown => "UNKNOWN",
        }
    }

    /// Parse the name written by [`OpKind::as_str`].
    pub fn from_name(name: &str) -> Option<Self> {
        const ALL: [OpKind; 19] = [
            OpKind::Broadcast,
            OpKind::AllReduce,
            OpKind::AllReduceCoalesced,
            OpKind::Reduce,
            OpKind::AllGather,
            OpKind::AllGatherBase,
            OpKind::AllGatherCoalesced,
            OpKind::Gather,
            OpKind::Scatter,
            OpKind::ReduceScatter,
            OpKind::ReduceScatterBase,
            OpKind::ReduceScatterCoalesced,
            OpKind::AllToAllBase,
            OpKind::AllToAll,
            OpKind::Send,
            OpKind::Recv,
            OpKind::Barrier,
            OpKind::Coalesced,
            OpKind::Unknown,
        ];
        ALL.into_iter().find(|k| k.as_str() == name)
    }

    pub const fn is_p2p(self) -> bool {
        matches!(self, OpKind::Send | OpKind::Recv)
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Graph-capture state of a device stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    None,
    Active,
    Invalidated,
}
