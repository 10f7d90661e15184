//! Issuing one operation end to end: sequence numbers, communicator lookup,
//! stream ordering, the backend call and Work bookkeeping.

use super::strategy::{CollectiveStrategy, NoOp};
use super::{GroupState, ProcessGroup, device_key};
use crate::buffer::Buffer;
use crate::comm::{CommRole, Communicator};
use crate::error::{Result, VigilError};
use crate::flight_recorder::TraceMetadata;
use crate::types::{CaptureStatus, DataType, DeviceIndex, OpKind, Rank, ReduceOp};
use crate::work::{Work, WorkSpec};
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Backend call behind an operation.
#[derive(Debug, Clone)]
pub(crate) enum Primitive {
    /// One all-reduce per input/output pair.
    AllReduce(ReduceOp),
    Broadcast { root: Rank },
    Reduce { op: ReduceOp, root: Rank },
    /// One all-gather per input/output pair.
    AllGather,
    /// One reduce-scatter per input/output pair.
    ReduceScatter(ReduceOp),
    /// Exchange of consecutive slices, `send[p]`/`recv[p]` elements per peer.
    AllToAll { send: Vec<usize>, recv: Vec<usize> },
    /// Input `p` goes to peer `p`, output `p` comes from peer `p`.
    AllToAllList,
    Gather { root: Rank },
    Scatter { root: Rank },
    Send { peer: Rank },
    Recv { peer: Rank },
}

impl Primitive {
    fn launch(
        &self,
        st: &GroupState,
        comm: &Communicator,
        inputs: &[Buffer],
        outputs: &[Buffer],
    ) -> Result<()> {
        let h = comm.handle();
        let stream = comm.stream();
        let ctx = |what: &str| format!("{}{what} on communicator '{}'", st.prefix, comm.key());
        match self {
            Primitive::AllReduce(op) => grouped(st, inputs.len() > 1, || {
                for (i, o) in inputs.iter().zip(outputs) {
                    h.all_reduce(i, o, *op, stream).check(|| ctx("all-reduce"))?;
                }
                Ok(())
            }),
            Primitive::Broadcast { root } => h
                .broadcast(first(inputs)?, first(outputs)?, *root, stream)
                .check(|| ctx("broadcast")),
            Primitive::Reduce { op, root } => h
                .reduce(first(inputs)?, first(outputs)?, *op, *root, stream)
                .check(|| ctx("reduce")),
            Primitive::AllGather => grouped(st, inputs.len() > 1, || {
                for (i, o) in inputs.iter().zip(outputs) {
                    h.all_gather(i, o, stream).check(|| ctx("all-gather"))?;
                }
                Ok(())
            }),
            Primitive::ReduceScatter(op) => grouped(st, inputs.len() > 1, || {
                for (i, o) in inputs.iter().zip(outputs) {
                    h.reduce_scatter(i, o, *op, stream)
                        .check(|| ctx("reduce-scatter"))?;
                }
                Ok(())
            }),
            Primitive::AllToAll { send, recv } => grouped(st, true, || {
                let (mut send_off, mut recv_off) = (0, 0);
                for peer in 0..st.size {
                    let p = peer as usize;
                    let out = first(inputs)?.flat_view(send_off, send[p])?;
                    let inc = first(outputs)?.flat_view(recv_off, recv[p])?;
                    h.send(&out, peer, stream).check(|| ctx("all-to-all send"))?;
                    h.recv(&inc, peer, stream).check(|| ctx("all-to-all recv"))?;
                    send_off += send[p];
                    recv_off += recv[p];
                }
                Ok(())
            }),
            Primitive::AllToAllList => grouped(st, true, || {
                for (peer, (i, o)) in (0..st.size).zip(inputs.iter().zip(outputs)) {
                    h.send(i, peer, stream).check(|| ctx("all-to-all send"))?;
                    h.recv(o, peer, stream).check(|| ctx("all-to-all recv"))?;
                }
                Ok(())
            }),
            Primitive::Gather { root } => grouped(st, true, || {
                if st.rank == *root {
                    for (peer, o) in (0..st.size).zip(outputs) {
                        if peer == st.rank {
                            h.send(first(inputs)?, peer, stream).check(|| ctx("gather send"))?;
                        }
                        h.recv(o, peer, stream).check(|| ctx("gather recv"))?;
                    }
                    Ok(())
                } else {
                    h.send(first(inputs)?, *root, stream).check(|| ctx("gather send"))
                }
            }),
            Primitive::Scatter { root } => grouped(st, true, || {
                if st.rank == *root {
                    for (peer, i) in (0..st.size).zip(inputs) {
                        h.send(i, peer, stream).check(|| ctx("scatter send"))?;
                        if peer == st.rank {
                            h.recv(first(outputs)?, peer, stream).check(|| ctx("scatter recv"))?;
                        }
                    }
                    Ok(())
                } else {
                    h.recv(first(outputs)?, *root, stream).check(|| ctx("scatter recv"))
                }
            }),
            Primitive::Send { peer } => h.send(first(inputs)?, *peer, stream).check(|| ctx("send")),
            Primitive::Recv { peer } => h.recv(first(outputs)?, *peer, stream).check(|| ctx("recv")),
        }
    }
}

fn first(buffers: &[Buffer]) -> Result<&Buffer> {
    buffers
        .first()
        .ok_or_else(|| VigilError::InvalidArgument("operation is missing a buffer".into()))
}

/// Run `f` inside a backend group when `enabled`. The group is closed even
/// if `f` fails.
fn grouped(st: &GroupState, enabled: bool, f: impl FnOnce() -> Result<()>) -> Result<()> {
    if !enabled {
        return f();
    }
    st.backend
        .group_start()
        .check(|| format!("{}opening backend group", st.prefix))?;
    let result = f();
    let closed = st.backend.group_end();
    result?;
    closed.check(|| format!("{}closing backend group", st.prefix))
}

/// One operation as issued by the public entry points.
pub(crate) struct Dispatch {
    pub kind: OpKind,
    /// Buffers the primitive reads.
    pub inputs: Vec<Buffer>,
    /// Buffers the primitive writes.
    pub outputs: Vec<Buffer>,
    /// Buffers the caller sees as the result, when they differ from `outputs`.
    pub results: Option<Vec<Buffer>>,
    pub primitive: Primitive,
    pub strategy: Box<dyn CollectiveStrategy>,
}

impl Dispatch {
    pub(crate) fn new(
        kind: OpKind,
        inputs: Vec<Buffer>,
        outputs: Vec<Buffer>,
        primitive: Primitive,
    ) -> Self {
        Self {
            kind,
            inputs,
            outputs,
            results: None,
            primitive,
            strategy: Box::new(NoOp),
        }
    }

    pub(crate) fn with_strategy(mut self, strategy: impl CollectiveStrategy + 'static) -> Self {
        self.strategy = Box::new(strategy);
        self
    }

    pub(crate) fn with_results(mut self, results: Vec<Buffer>) -> Self {
        self.results = Some(results);
        self
    }

    fn results(&self) -> Vec<Buffer> {
        self.results.clone().unwrap_or_else(|| self.outputs.clone())
    }

    /// Every buffer that must outlive the operation on the stream.
    fn held_buffers(&self) -> Vec<Buffer> {
        let mut all: Vec<Buffer> = self.inputs.iter().chain(&self.outputs).cloned().collect();
        if let Some(results) = &self.results {
            all.extend(results.iter().cloned());
        }
        all
    }
}

/// Device and element type shared by all `buffers`.
pub(crate) fn common_layout<'a>(
    buffers: impl IntoIterator<Item = &'a Buffer>,
) -> Result<(DeviceIndex, DataType)> {
    let mut iter = buffers.into_iter();
    let first = iter
        .next()
        .ok_or_else(|| VigilError::InvalidArgument("operation needs at least one buffer".into()))?;
    for b in iter {
        if b.device() != first.device() {
            return Err(VigilError::InvalidArgument(format!(
                "buffers must be on one device, found devices {} and {}",
                first.device(),
                b.device()
            )));
        }
        if b.dtype() != first.dtype() {
            return Err(VigilError::InvalidArgument(format!(
                "buffers must share one element type, found {} and {}",
                first.dtype(),
                b.dtype()
            )));
        }
    }
    Ok((first.device(), first.dtype()))
}

fn trace_metadata(st: &GroupState, seq: u64, op_id: u64, d: &Dispatch) -> TraceMetadata {
    TraceMetadata {
        pg_uid: st.uid,
        seq,
        op_id,
        kind: d.kind,
        input_sizes: d.inputs.iter().map(|b| b.shape().to_vec()).collect(),
        input_dtypes: d.inputs.iter().map(Buffer::dtype).collect(),
        output_sizes: d.outputs.iter().map(|b| b.shape().to_vec()).collect(),
        output_dtypes: d.outputs.iter().map(Buffer::dtype).collect(),
    }
}

impl ProcessGroup {
    fn ensure_running(&self) -> Result<()> {
        if self.state.is_terminating() {
            return Err(VigilError::InvalidState(format!(
                "{}process group has been shut down",
                self.state.prefix
            )));
        }
        Ok(())
    }

    /// Issue a collective over the communicator shared by all ranks.
    pub(crate) async fn collective(&self, d: Dispatch) -> Result<Option<Arc<Work>>> {
        self.ensure_running()?;
        let st = &self.state;
        let (device, _) = common_layout(d.inputs.iter().chain(&d.outputs))?;
        let coalescing = self.is_coalescing();
        let seq = if coalescing {
            st.seq.load(Ordering::Acquire)
        } else {
            st.seq.fetch_add(1, Ordering::AcqRel) + 1
        };
        let op_id = st.op_id.fetch_add(1, Ordering::AcqRel) + 1;
        let comm = st
            .cache
            .get_or_create(&device_key(device), device, CommRole::Collective)
            .await?;
        self.launch(d, comm, device, seq, op_id, coalescing)
    }

    /// Issue a send or recv of `buffer` with `peer`.
    ///
    /// Inside a coalescing session the device communicator is used and the
    /// sequence number stays put; otherwise a dedicated two-rank communicator
    /// keyed by the rank pair is used.
    pub(crate) async fn point_to_point(
        &self,
        kind: OpKind,
        buffer: &Buffer,
        peer: Rank,
    ) -> Result<Option<Arc<Work>>> {
        self.ensure_running()?;
        let st = &self.state;
        if peer >= st.size {
            return Err(VigilError::InvalidArgument(format!(
                "peer {peer} is out of range for group size {}",
                st.size
            )));
        }
        let device = buffer.device();
        let batched = self.is_coalescing();
        let (key, role, target) = if batched {
            (device_key(device), CommRole::Collective, peer)
        } else {
            let (low, high) = (st.rank.min(peer), st.rank.max(peer));
            let p2p_rank = if st.rank <= peer { 0 } else { 1 };
            let to_self = st.rank == peer;
            let target = if to_self { 0 } else { 1 - p2p_rank };
            (
                format!("{low}:{high}"),
                CommRole::PointToPoint { p2p_rank, to_self },
                target,
            )
        };
        let seq = if batched {
            st.seq.load(Ordering::Acquire)
        } else {
            st.seq.fetch_add(1, Ordering::AcqRel) + 1
        };
        let op_id = st.op_id.fetch_add(1, Ordering::AcqRel) + 1;
        let comm = st.cache.get_or_create(&key, device, role).await?;
        let d = match kind {
            OpKind::Send => Dispatch::new(
                kind,
                vec![buffer.clone()],
                Vec::new(),
                Primitive::Send { peer: target },
            ),
            OpKind::Recv => Dispatch::new(
                kind,
                Vec::new(),
                vec![buffer.clone()],
                Primitive::Recv { peer: target },
            ),
            other => {
                return Err(VigilError::InvalidArgument(format!(
                    "{other} is not a point-to-point operation"
                )));
            }
        };
        self.launch(d, comm, device, seq, op_id, batched)
    }

    fn launch(
        &self,
        d: Dispatch,
        comm: Arc<Communicator>,
        device: DeviceIndex,
        seq: u64,
        op_id: u64,
        coalescing: bool,
    ) -> Result<Option<Arc<Work>>> {
        let st = &self.state;
        let runtime = &st.runtime;
        let stream = comm.stream();

        // The communication stream must not run ahead of the caller's work.
        let current = runtime.current_stream(device)?;
        comm.sync_event().record(current)?;
        comm.sync_event().block(stream)?;

        let meta = trace_metadata(st, seq, op_id, &d);

        if coalescing {
            st.recorder.record(meta, None);
            d.strategy.pre(runtime.as_ref(), stream)?;
            d.primitive.launch(st, &comm, &d.inputs, &d.outputs)?;
            d.strategy.post(runtime.as_ref(), stream)?;
            let numel_in = d.inputs.iter().map(Buffer::numel).sum();
            let numel_out = d.outputs.iter().map(Buffer::numel).sum();
            self.note_coalesced(&comm, numel_in, numel_out, d.held_buffers(), d.results())?;
            return Ok(None);
        }

        let work = Arc::new(Work::new(
            WorkSpec {
                pg_uid: st.uid,
                rank: st.rank,
                kind: d.kind,
                seq,
                op_id,
                device,
                comm: Arc::clone(&comm),
                timeout: st.timeout,
                enable_timing: st.enable_timing.load(Ordering::Relaxed),
                blocking_wait: st.config.blocking_wait,
                avoid_record_streams: st.config.avoid_record_streams,
                numel_in: d.inputs.iter().map(Buffer::numel).sum(),
                numel_out: d.outputs.iter().map(Buffer::numel).sum(),
            },
            runtime,
        )?);
        let trace_id = st
            .recorder
            .record(meta, Some(Arc::downgrade(work.events())));
        if let Some(id) = trace_id {
            work.set_trace_id(id);
        }

        let issued = (|| -> Result<()> {
            if let Some(start) = &work.events().start {
                start.record(stream)?;
            }
            d.strategy.pre(runtime.as_ref(), stream)?;
            d.primitive.launch(st, &comm, &d.inputs, &d.outputs)?;
            d.strategy.post(runtime.as_ref(), stream)?;
            work.events().end.record(stream)
        })();
        if let Err(e) = issued {
            if let Some(id) = trace_id {
                st.recorder.retire(id, false);
            }
            tracing::warn!("{}{} (seq {seq}) failed to launch: {e}", st.prefix, d.kind);
            return Err(e);
        }

        self.hold_buffers(&work, &comm, d.held_buffers())?;
        work.set_outputs(d.results());

        if runtime.capture_status(device) == CaptureStatus::Active {
            tracing::debug!("{}{} (seq {seq}) issued under stream capture, not tracked", st.prefix, d.kind);
        } else {
            self.enqueue(&work);
        }
        Ok(Some(work))
    }

    /// Keep `buffers` alive until the communication stream is done with them.
    pub(crate) fn hold_buffers(
        &self,
        work: &Work,
        comm: &Communicator,
        buffers: Vec<Buffer>,
    ) -> Result<()> {
        if self.state.config.avoid_record_streams {
            work.stash(buffers);
            return Ok(());
        }
        for b in &buffers {
            self.state.runtime.record_stream(b, comm.stream())?;
        }
        Ok(())
    }

    pub(crate) fn enqueue(&self, work: &Arc<Work>) {
        let st = &self.state;
        if !work.mark_enqueued() {
            return;
        }
        st.queues.push_pending(Arc::clone(work));
        st.last_enqueued_seq.store(work.seq(), Ordering::Release);
        st.touch_work_list();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_layout_rejects_mixed_buffers() {
        let a = Buffer::from_slice(0, &[1.0f32]);
        let b = Buffer::from_slice(1, &[1.0f32]);
        let c = Buffer::from_slice(0, &[1i32]);
        assert!(common_layout([&a, &a]).is_ok());
        assert!(matches!(
            common_layout([&a, &b]),
            Err(VigilError::InvalidArgument(_))
        ));
        assert!(matches!(
            common_layout([&a, &c]),
            Err(VigilError::InvalidArgument(_))
        ));
        assert!(matches!(
            common_layout(std::iter::empty::<&Buffer>()),
            Err(VigilError::InvalidArgument(_))
        ));
    }
}
