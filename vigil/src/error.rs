use crate::backend::BackendStatus;
use crate::types::Rank;
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, VigilError>;

/// Errors surfaced by the process group, its Works and its collaborators.
///
/// Errors are `Clone` because one captured failure is handed to every caller
/// that waits on the failed Work.
#[derive(Debug, Clone, thiserror::Error)]
pub enum VigilError {
    #[error("communication error: {message}")]
    Communication {
        message: String,
        status: Option<BackendStatus>,
    },

    #[error(
        "[Rank {rank}] Watchdog caught collective operation timeout: {work} ran for {elapsed_ms} milliseconds before timing out."
    )]
    Timeout {
        rank: Rank,
        work: String,
        elapsed_ms: u64,
    },

    #[error("collective desync detected: {report}")]
    Desync { report: String },

    #[error("store operation on key '{key}' failed: {reason}")]
    Store { key: String, reason: String },

    #[error("process group aborted externally: {reason}")]
    ExternalAbort { reason: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("unsupported data type: {dtype:?} for operation {op}")]
    UnsupportedDType {
        dtype: crate::types::DataType,
        op: &'static str,
    },

    #[error("device runtime error: {message}")]
    Device {
        message: String,
        #[source]
        source: Option<Arc<dyn std::error::Error + Send + Sync>>,
    },

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl VigilError {
    /// Create a `Communication` error with just a message.
    pub fn communication(msg: impl Into<String>) -> Self {
        Self::Communication {
            message: msg.into(),
            status: None,
        }
    }

    /// Create a `Communication` error carrying the backend status that caused it.
    pub fn backend(msg: impl Into<String>, status: BackendStatus) -> Self {
        Self::Communication {
            message: msg.into(),
            status: Some(status),
        }
    }

    /// Create a `Device` error with just a message.
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Device` error with a message and a source error.
    pub fn device_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Device {
            message: msg.into(),
            source: Some(Arc::new(source)),
        }
    }

    pub fn store(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Store {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error came out of the timeout path.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<std::io::Error> for VigilError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for VigilError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display() {
        let e = VigilError::Timeout {
            rank: 3,
            work: "WorkNCCL(SeqNum=7, OpType=ALLREDUCE)".into(),
            elapsed_ms: 1500,
        };
        assert_eq!(
            e.to_string(),
            "[Rank 3] Watchdog caught collective operation timeout: WorkNCCL(SeqNum=7, OpType=ALLREDUCE) ran for 1500 milliseconds before timing out."
        );
        assert!(e.is_timeout());
    }

    #[test]
    fn test_backend_error_keeps_status() {
        let e = VigilError::backend("allreduce failed", BackendStatus::RemoteError);
        match e {
            VigilError::Communication { status, .. } => {
                assert_eq!(status, Some(BackendStatus::RemoteError));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only fs");
        let err: VigilError = io_err.into();
        assert!(err.to_string().contains("read-only fs"));
        // Clone shares the underlying io::Error.
        let cloned = err.clone();
        assert_eq!(cloned.to_string(), err.to_string());
    }

    #[test]
    fn test_all_variants_display() {
        let errors: Vec<VigilError> = vec![
            VigilError::communication("comm aborted"),
            VigilError::backend("x", BackendStatus::SystemError),
            VigilError::Timeout {
                rank: 0,
                work: "w".into(),
                elapsed_ms: 1,
            },
            VigilError::Desync {
                report: "rank 1 behind".into(),
            },
            VigilError::store("0", "timed out"),
            VigilError::ExternalAbort {
                reason: "user".into(),
            },
            VigilError::InvalidArgument("empty key".into()),
            VigilError::InvalidState("already coalescing".into()),
            VigilError::UnsupportedDType {
                dtype: crate::types::DataType::F16,
                op: "reduce",
            },
            VigilError::device("oom"),
            VigilError::Serialization("bad".into()),
            VigilError::LockPoisoned("queues"),
        ];
        for e in &errors {
            assert!(!e.to_string().is_empty(), "empty display for {e:?}");
        }
    }
}
