use cudarc::nccl::result::{NcclError, NcclStatus};
use cudarc::nccl::sys;
use vigil::backend::UniqueId;
use vigil::{BackendStatus, DataType, ReduceOp, Result, VigilError};

/// Size of `ncclUniqueId::internal`.
pub const UNIQUE_ID_BYTES: usize = 128;

/// Convert a vigil DataType to the NCCL data type.
pub fn to_nccl_dtype(dt: DataType) -> sys::ncclDataType_t {
    match dt {
        DataType::F32 => sys::ncclDataType_t::ncclFloat32,
        DataType::F64 => sys::ncclDataType_t::ncclFloat64,
        DataType::F16 => sys::ncclDataType_t::ncclFloat16,
        DataType::BF16 => sys::ncclDataType_t::ncclBfloat16,
        DataType::I8 => sys::ncclDataType_t::ncclInt8,
        DataType::I32 => sys::ncclDataType_t::ncclInt32,
        DataType::I64 => sys::ncclDataType_t::ncclInt64,
        DataType::U8 => sys::ncclDataType_t::ncclUint8,
        DataType::U32 => sys::ncclDataType_t::ncclUint32,
        DataType::U64 => sys::ncclDataType_t::ncclUint64,
    }
}

/// Convert a built-in reduce op. `PreMulSum` has no static counterpart.
pub fn to_nccl_op(op: ReduceOp) -> Option<sys::ncclRedOp_t> {
    match op {
        ReduceOp::Sum => Some(sys::ncclRedOp_t::ncclSum),
        ReduceOp::Prod => Some(sys::ncclRedOp_t::ncclProd),
        ReduceOp::Min => Some(sys::ncclRedOp_t::ncclMin),
        ReduceOp::Max => Some(sys::ncclRedOp_t::ncclMax),
        ReduceOp::Avg => Some(sys::ncclRedOp_t::ncclAvg),
        ReduceOp::PreMulSum(_) => None,
    }
}

/// Map a raw NCCL result code to the backend-neutral status.
pub fn status_from_raw(code: sys::ncclResult_t) -> BackendStatus {
    match code {
        sys::ncclResult_t::ncclSuccess => BackendStatus::Success,
        sys::ncclResult_t::ncclInProgress => BackendStatus::InProgress,
        sys::ncclResult_t::ncclUnhandledCudaError => BackendStatus::UnhandledDeviceError,
        sys::ncclResult_t::ncclSystemError => BackendStatus::SystemError,
        sys::ncclResult_t::ncclInvalidArgument => BackendStatus::InvalidArgument,
        sys::ncclResult_t::ncclInvalidUsage => BackendStatus::InvalidUsage,
        sys::ncclResult_t::ncclRemoteError => BackendStatus::RemoteError,
        _ => BackendStatus::InternalError,
    }
}

/// Collapse the result of a cudarc NCCL call into a status.
pub fn status_of(r: std::result::Result<NcclStatus, NcclError>) -> BackendStatus {
    match r {
        Ok(NcclStatus::InProgress) => BackendStatus::InProgress,
        Ok(_) => BackendStatus::Success,
        Err(NcclError(code)) => status_from_raw(code),
    }
}

pub fn nccl_error(context: &str, e: NcclError) -> VigilError {
    VigilError::backend(format!("{context}: {e:?}"), status_from_raw(e.0))
}

pub fn driver_error(context: &str, e: cudarc::driver::DriverError) -> VigilError {
    VigilError::device_with_source(context.to_string(), e)
}

pub fn id_to_bytes(id: &sys::ncclUniqueId) -> UniqueId {
    UniqueId(id.internal.iter().map(|&c| c as u8).collect())
}

pub fn id_from_bytes(id: &UniqueId) -> Result<sys::ncclUniqueId> {
    if id.0.len() != UNIQUE_ID_BYTES {
        return Err(VigilError::InvalidArgument(format!(
            "NCCL unique id must be {UNIQUE_ID_BYTES} bytes, got {}",
            id.0.len()
        )));
    }
    let mut internal = [0 as std::ffi::c_char; UNIQUE_ID_BYTES];
    for (dst, &b) in internal.iter_mut().zip(&id.0) {
        *dst = b as std::ffi::c_char;
    }
    Ok(sys::ncclUniqueId { internal })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_mapping() {
        assert_eq!(
            to_nccl_dtype(DataType::F32),
            sys::ncclDataType_t::ncclFloat32
        );
        assert_eq!(
            to_nccl_dtype(DataType::BF16),
            sys::ncclDataType_t::ncclBfloat16
        );
        assert_eq!(to_nccl_dtype(DataType::U8), sys::ncclDataType_t::ncclUint8);
    }

    #[test]
    fn test_op_mapping() {
        assert_eq!(to_nccl_op(ReduceOp::Sum), Some(sys::ncclRedOp_t::ncclSum));
        assert_eq!(to_nccl_op(ReduceOp::Avg), Some(sys::ncclRedOp_t::ncclAvg));
        assert_eq!(to_nccl_op(ReduceOp::PreMulSum(0.5)), None);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_from_raw(sys::ncclResult_t::ncclRemoteError),
            BackendStatus::RemoteError
        );
        assert_eq!(
            status_of(Err(NcclError(sys::ncclResult_t::ncclUnhandledCudaError))),
            BackendStatus::UnhandledDeviceError
        );
        assert_eq!(status_of(Ok(NcclStatus::Success)), BackendStatus::Success);
    }
}
