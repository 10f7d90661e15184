//! Debug dump sinks, the external dump trigger and process termination.

use crate::error::Result;
use crate::types::Rank;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Receives serialized flight-recorder dumps.
pub trait DebugInfoWriter: Send + Sync {
    fn write(&self, report: &str) -> Result<()>;
}

/// Writes each dump to `{stem}{rank}`, replacing the previous one.
pub struct FileDebugInfoWriter {
    path: PathBuf,
}

impl FileDebugInfoWriter {
    pub fn new(stem: impl Into<PathBuf>, rank: Rank) -> Self {
        let mut path = stem.into().into_os_string();
        path.push(rank.to_string());
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl DebugInfoWriter for FileDebugInfoWriter {
    fn write(&self, report: &str) -> Result<()> {
        std::fs::write(&self.path, report)?;
        tracing::info!(path = %self.path.display(), "wrote debug info");
        Ok(())
    }
}

/// Keeps every dump in memory.
#[derive(Default)]
pub struct MemoryDebugInfoWriter {
    reports: Mutex<Vec<String>>,
}

impl MemoryDebugInfoWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<String> {
        self.reports.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl DebugInfoWriter for MemoryDebugInfoWriter {
    fn write(&self, report: &str) -> Result<()> {
        if let Ok(mut r) = self.reports.lock() {
            r.push(report.to_string());
        }
        Ok(())
    }
}

/// Lets an operator request a dump from outside the process.
pub trait DumpTrigger: Send + Sync {
    /// Whether a dump was requested since the last poll. Consumes the request.
    fn poll(&self) -> bool;
}

/// Triggered by writing anything into `{stem}{rank}.pipe`.
pub struct FileDumpTrigger {
    path: PathBuf,
}

impl FileDumpTrigger {
    pub fn new(stem: impl Into<PathBuf>, rank: Rank) -> Self {
        let mut path = stem.into().into_os_string();
        path.push(format!("{rank}.pipe"));
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl DumpTrigger for FileDumpTrigger {
    fn poll(&self) -> bool {
        match std::fs::metadata(&self.path) {
            Ok(m) if m.len() > 0 => {
                if let Err(e) = std::fs::write(&self.path, b"") {
                    tracing::warn!(path = %self.path.display(), error = %e, "could not reset dump trigger");
                }
                true
            }
            _ => false,
        }
    }
}

/// Ends the process once the group decided it cannot make progress.
pub trait Terminator: Send + Sync {
    fn terminate(&self, reason: &str);
}

/// Aborts the process.
pub struct ProcessTerminator;

impl Terminator for ProcessTerminator {
    fn terminate(&self, reason: &str) {
        tracing::error!("terminating process: {reason}");
        std::process::abort();
    }
}

/// Records termination requests instead of acting on them.
#[derive(Default)]
pub struct RecordingTerminator {
    reasons: Mutex<Vec<String>>,
}

impl RecordingTerminator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.reasons.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn terminated(&self) -> bool {
        !self.reasons().is_empty()
    }
}

impl Terminator for RecordingTerminator {
    fn terminate(&self, reason: &str) {
        tracing::warn!("termination requested: {reason}");
        if let Ok(mut r) = self.reasons.lock() {
            r.push(reason.to_string());
        }
    }
}

/// Host-level liveness check run before terminating on a stuck watchdog.
pub type LivenessProbe = Arc<dyn Fn() -> bool + Send + Sync>;

/// Collects a textual stack dump of the process for the logs.
pub type StackDumper = Arc<dyn Fn() -> String + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("vigil-debug-{}-{name}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_file_writer_appends_rank() {
        let dir = scratch("writer");
        let w = FileDebugInfoWriter::new(dir.join("trace_"), 3);
        assert!(w.path().ends_with("trace_3"));
        w.write("{}").unwrap();
        assert_eq!(std::fs::read_to_string(w.path()).unwrap(), "{}");
    }

    #[test]
    fn test_dump_trigger_consumes_request() {
        let dir = scratch("trigger");
        let t = FileDumpTrigger::new(dir.join("pipe_"), 1);
        assert!(t.path().ends_with("pipe_1.pipe"));
        assert!(!t.poll());
        std::fs::write(t.path(), b"1").unwrap();
        assert!(t.poll());
        assert!(!t.poll());
    }

    #[test]
    fn test_recording_terminator() {
        let t = RecordingTerminator::new();
        assert!(!t.terminated());
        t.terminate("stuck");
        assert_eq!(t.reasons(), vec!["stuck".to_string()]);
    }
}
