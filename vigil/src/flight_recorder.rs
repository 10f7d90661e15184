//! Bounded trace of recent dispatches for postmortem diagnosis.
//!
//! Each dispatch appends an immutable [`TraceEntry`]. The buffer keeps the
//! newest `capacity` entries. Completion state is not stored in the entry;
//! a dump derives it from the Work's events through a weak reference, so
//! recording never extends a Work's lifetime.

use crate::error::{Result, VigilError};
use crate::types::{DataType, OpKind};
use crate::work::WorkEvents;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of a recorded entry. Ids grow by one per record.
pub type TraceId = u64;

const DUMP_VERSION: &str = "1.0";

/// What a dispatch looked like.
#[derive(Debug, Clone)]
pub struct TraceMetadata {
    pub pg_uid: u64,
    pub seq: u64,
    pub op_id: u64,
    pub kind: OpKind,
    pub input_sizes: Vec<Vec<usize>>,
    pub input_dtypes: Vec<DataType>,
    pub output_sizes: Vec<Vec<usize>>,
    pub output_dtypes: Vec<DataType>,
}

#[derive(Debug, Clone)]
struct TraceEntry {
    id: TraceId,
    meta: TraceMetadata,
    events: Option<Weak<WorkEvents>>,
    dispatched_at: SystemTime,
    retired: bool,
    success: Option<bool>,
}

/// Execution state derived at dump time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Scheduled,
    Started,
    Completed,
}

#[derive(Debug, Serialize)]
struct DumpedEntry {
    record_id: TraceId,
    pg_id: u64,
    collective_seq_id: u64,
    op_id: u64,
    profiling_name: String,
    time_created_ns: u128,
    input_sizes: Vec<Vec<usize>>,
    input_dtypes: Vec<DataType>,
    output_sizes: Vec<Vec<usize>>,
    output_dtypes: Vec<DataType>,
    state: EntryState,
    duration_ms: Option<f32>,
    retired: bool,
    success: Option<bool>,
}

#[derive(Debug, Serialize)]
struct Dump<'a> {
    version: &'a str,
    rank: u32,
    entries: Vec<DumpedEntry>,
}

/// Which entries to include in a dump.
#[derive(Debug, Clone, Copy, Default)]
pub struct DumpFilter {
    /// Skip entries that completed and were retired.
    pub only_active: bool,
    /// Leave out device durations.
    pub skip_durations: bool,
}

struct Ring {
    entries: VecDeque<TraceEntry>,
    next_id: TraceId,
}

/// Fixed-capacity ring of trace entries, shared by every group of a process.
pub struct FlightRecorder {
    capacity: usize,
    ring: Mutex<Ring>,
}

impl FlightRecorder {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ring: Mutex::new(Ring {
                entries: VecDeque::with_capacity(capacity),
                next_id: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    /// Append an entry, evicting the oldest one when full.
    ///
    /// Returns `None` when recording is disabled.
    pub fn record(
        &self,
        meta: TraceMetadata,
        events: Option<Weak<WorkEvents>>,
    ) -> Option<TraceId> {
        if self.capacity == 0 {
            return None;
        }
        let mut ring = self.ring.lock().ok()?;
        let id = ring.next_id;
        ring.next_id += 1;
        if ring.entries.len() == self.capacity {
            ring.entries.pop_front();
        }
        ring.entries.push_back(TraceEntry {
            id,
            meta,
            events,
            dispatched_at: SystemTime::now(),
            retired: false,
            success: None,
        });
        Some(id)
    }

    /// Mark an entry as finished. Calling it again, or for an evicted id, is a no-op.
    pub fn retire(&self, id: TraceId, success: bool) {
        let Ok(mut ring) = self.ring.lock() else {
            return;
        };
        let Some(first) = ring.entries.front().map(|e| e.id) else {
            return;
        };
        let Some(offset) = id.checked_sub(first) else {
            return;
        };
        if let Some(entry) = ring.entries.get_mut(offset as usize)
            && entry.id == id
            && !entry.retired
        {
            entry.retired = true;
            entry.success = Some(success);
            // The events may be reused once the Work is gone.
            entry.events = None;
        }
    }

    pub fn len(&self) -> usize {
        self.ring.lock().map(|r| r.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequence numbers of the buffered entries, oldest first.
    pub fn seqs(&self) -> Vec<u64> {
        self.ring
            .lock()
            .map(|r| r.entries.iter().map(|e| e.meta.seq).collect())
            .unwrap_or_default()
    }

    /// Serialize the buffered entries to JSON.
    pub fn dump(&self, rank: u32, filter: DumpFilter) -> Result<String> {
        let snapshot: Vec<TraceEntry> = self
            .ring
            .lock()
            .map_err(|_| VigilError::LockPoisoned("flight recorder"))?
            .entries
            .iter()
            .cloned()
            .collect();

        let entries = snapshot
            .into_iter()
            .filter_map(|e| {
                let events = e.events.as_ref().and_then(Weak::upgrade);
                let state = match &events {
                    Some(ev) if ev.has_finished() => EntryState::Completed,
                    Some(ev) if ev.has_started() => EntryState::Started,
                    Some(_) => EntryState::Scheduled,
                    None if e.retired => EntryState::Completed,
                    None => EntryState::Scheduled,
                };
                if filter.only_active && e.retired {
                    return None;
                }
                let duration_ms = if filter.skip_durations {
                    None
                } else {
                    events.as_ref().and_then(|ev| ev.duration_ms())
                };
                Some(DumpedEntry {
                    record_id: e.id,
                    pg_id: e.meta.pg_uid,
                    collective_seq_id: e.meta.seq,
                    op_id: e.meta.op_id,
                    profiling_name: format!("nccl:{}", e.meta.kind.as_str().to_lowercase()),
                    time_created_ns: e
                        .dispatched_at
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_nanos())
                        .unwrap_or(0),
                    input_sizes: e.meta.input_sizes,
                    input_dtypes: e.meta.input_dtypes,
                    output_sizes: e.meta.output_sizes,
                    output_dtypes: e.meta.output_dtypes,
                    state,
                    duration_ms,
                    retired: e.retired,
                    success: e.success,
                })
            })
            .collect();

        Ok(serde_json::to_string(&Dump {
            version: DUMP_VERSION,
            rank,
            entries,
        })?)
    }
}

impl std::fmt::Debug for FlightRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlightRecorder")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}
