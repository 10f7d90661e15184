//! Explicit batch boundaries: everything issued between `start_coalescing`
//! and `end_coalescing` runs as one backend group and is tracked by one Work.

use super::ProcessGroup;
use crate::buffer::Buffer;
use crate::comm::Communicator;
use crate::error::{Result, VigilError};
use crate::flight_recorder::TraceMetadata;
use crate::types::{CaptureStatus, OpKind};
use crate::work::{Work, WorkSpec};
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Operations accumulated by the open session.
#[derive(Default)]
pub(crate) struct CoalescingState {
    pub active: bool,
    pub comm: Option<Arc<Communicator>>,
    pub ops: usize,
    pub numel_in: usize,
    pub numel_out: usize,
    pub held: Vec<Buffer>,
    pub results: Vec<Buffer>,
}

impl ProcessGroup {
    /// Whether a coalescing session is open.
    pub fn is_coalescing(&self) -> bool {
        self.state.coalescing.lock().map(|c| c.active).unwrap_or(false)
    }

    /// Open a coalescing session. Only one session can be open at a time.
    pub fn start_coalescing(&self) -> Result<()> {
        let st = &self.state;
        let mut session = st
            .coalescing
            .lock()
            .map_err(|_| VigilError::LockPoisoned("coalescing session"))?;
        if session.active {
            return Err(VigilError::InvalidState(format!(
                "{}a coalescing session is already open",
                st.prefix
            )));
        }
        st.backend
            .group_start()
            .check(|| format!("{}opening backend group", st.prefix))?;
        *session = CoalescingState {
            active: true,
            ..Default::default()
        };
        st.seq.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub(crate) fn note_coalesced(
        &self,
        comm: &Arc<Communicator>,
        numel_in: usize,
        numel_out: usize,
        held: Vec<Buffer>,
        results: Vec<Buffer>,
    ) -> Result<()> {
        let st = &self.state;
        let mut session = st
            .coalescing
            .lock()
            .map_err(|_| VigilError::LockPoisoned("coalescing session"))?;
        if !session.active {
            return Err(VigilError::InvalidState(format!(
                "{}coalescing session closed while an operation was being issued",
                st.prefix
            )));
        }
        match &session.comm {
            Some(existing) if !Arc::ptr_eq(existing, comm) => {
                return Err(VigilError::InvalidArgument(format!(
                    "{}coalesced operations must use one communicator, got '{}' and '{}'",
                    st.prefix,
                    existing.key(),
                    comm.key()
                )));
            }
            Some(_) => {}
            None => session.comm = Some(Arc::clone(comm)),
        }
        session.ops += 1;
        session.numel_in += numel_in;
        session.numel_out += numel_out;
        session.held.extend(held);
        session.results.extend(results);
        Ok(())
    }

    /// Close the session and return the Work tracking everything issued in
    /// it, or `None` if nothing was. `kind` defaults to `Coalesced`.
    /// Close the session after the sub-operation that failed with `cause`.
    /// A failure to close is logged; `cause` is what the caller sees.
    pub(crate) fn abandon_coalescing(&self, kind: OpKind, cause: VigilError) -> VigilError {
        if let Err(e) = self.end_coalescing(Some(kind)) {
            tracing::warn!(
                "{}closing the {kind} batch after a failed sub-operation: {e}",
                self.state.prefix
            );
        }
        cause
    }

    pub fn end_coalescing(&self, kind: Option<OpKind>) -> Result<Option<Arc<Work>>> {
        let st = &self.state;
        let session = {
            let mut session = st
                .coalescing
                .lock()
                .map_err(|_| VigilError::LockPoisoned("coalescing session"))?;
            if !session.active {
                return Err(VigilError::InvalidState(format!(
                    "{}no coalescing session is open",
                    st.prefix
                )));
            }
            std::mem::take(&mut *session)
        };
        let close = || {
            st.backend
                .group_end()
                .check(|| format!("{}closing backend group", st.prefix))
        };

        let Some(comm) = session.comm else {
            close()?;
            return Ok(None);
        };
        let kind = kind.unwrap_or(OpKind::Coalesced);
        let seq = st.seq.load(Ordering::Acquire);
        let op_id = st.op_id.fetch_add(1, Ordering::AcqRel) + 1;
        let device = comm.device();
        let work = match Work::new(
            WorkSpec {
                pg_uid: st.uid,
                rank: st.rank,
                kind,
                seq,
                op_id,
                device,
                comm: Arc::clone(&comm),
                timeout: st.timeout,
                enable_timing: st.enable_timing.load(Ordering::Relaxed),
                blocking_wait: st.config.blocking_wait,
                avoid_record_streams: st.config.avoid_record_streams,
                numel_in: session.numel_in,
                numel_out: session.numel_out,
            },
            &st.runtime,
        ) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                close()?;
                return Err(e);
            }
        };
        let meta = TraceMetadata {
            pg_uid: st.uid,
            seq,
            op_id,
            kind,
            input_sizes: Vec::new(),
            input_dtypes: Vec::new(),
            output_sizes: session.results.iter().map(|b| b.shape().to_vec()).collect(),
            output_dtypes: session.results.iter().map(Buffer::dtype).collect(),
        };
        if let Some(id) = st
            .recorder
            .record(meta, Some(Arc::downgrade(work.events())))
        {
            work.set_trace_id(id);
        }

        let started = match &work.events().start {
            Some(start) => start.record(comm.stream()),
            None => Ok(()),
        };
        close()?;
        started?;
        work.events().end.record(comm.stream())?;

        self.hold_buffers(&work, &comm, session.held)?;
        work.set_outputs(session.results);
        tracing::debug!(
            "{}coalesced {} operation(s) into {kind} (seq {seq})",
            st.prefix,
            session.ops
        );
        if st.runtime.capture_status(device) != CaptureStatus::Active {
            self.enqueue(&work);
        }
        Ok(Some(work))
    }
}
