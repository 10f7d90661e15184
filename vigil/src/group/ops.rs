//! Public collective and point-to-point operations.
//!
//! Every operation returns `Ok(None)` inside a coalescing session (the
//! session's Work tracks it) and `Ok(Some(work))` otherwise.

use super::dispatch::{Dispatch, Primitive, common_layout};
use super::strategy::{CopyBack, FlattenInputs};
use super::ProcessGroup;
use crate::buffer::Buffer;
use crate::error::{Result, VigilError};
use crate::types::{DataType, OpKind, Rank, ReduceOp};
use crate::work::Work;
use std::sync::Arc;

type WorkResult = Result<Option<Arc<Work>>>;

impl ProcessGroup {
    fn check_root(&self, root: Rank) -> Result<()> {
        if root >= self.size() {
            return Err(VigilError::InvalidArgument(format!(
                "root {root} is out of range for group size {}",
                self.size()
            )));
        }
        Ok(())
    }

    fn check_count(&self, what: &str, buffers: &[Buffer]) -> Result<()> {
        if buffers.len() != self.size() as usize {
            return Err(VigilError::InvalidArgument(format!(
                "{what} needs one buffer per rank ({}), got {}",
                self.size(),
                buffers.len()
            )));
        }
        Ok(())
    }

    fn alloc_like(&self, like: &Buffer, numel: usize) -> Result<Buffer> {
        self.state.runtime.allocate(like.device(), like.dtype(), numel)
    }

    pub async fn all_reduce(&self, buffer: &Buffer, op: ReduceOp) -> WorkResult {
        self.collective(Dispatch::new(
            OpKind::AllReduce,
            vec![buffer.clone()],
            vec![buffer.clone()],
            Primitive::AllReduce(op),
        ))
        .await
    }

    /// All-reduce several buffers in one backend group, tracked by one Work.
    pub async fn all_reduce_coalesced(&self, buffers: &[Buffer], op: ReduceOp) -> WorkResult {
        common_layout(buffers)?;
        self.collective(Dispatch::new(
            OpKind::AllReduceCoalesced,
            buffers.to_vec(),
            buffers.to_vec(),
            Primitive::AllReduce(op),
        ))
        .await
    }

    /// In-place broadcast from `root`.
    pub async fn broadcast(&self, buffer: &Buffer, root: Rank) -> WorkResult {
        self.check_root(root)?;
        self.collective(Dispatch::new(
            OpKind::Broadcast,
            vec![buffer.clone()],
            vec![buffer.clone()],
            Primitive::Broadcast { root },
        ))
        .await
    }

    /// Broadcast `input` on `root` into `output` on every rank.
    pub async fn broadcast_oop(&self, input: &Buffer, output: &Buffer, root: Rank) -> WorkResult {
        self.check_root(root)?;
        if input.numel() != output.numel() {
            return Err(VigilError::InvalidArgument(format!(
                "out-of-place broadcast needs equally sized buffers, got {} and {}",
                input.numel(),
                output.numel()
            )));
        }
        self.collective(Dispatch::new(
            OpKind::Broadcast,
            vec![input.clone()],
            vec![output.clone()],
            Primitive::Broadcast { root },
        ))
        .await
    }

    /// In-place reduce onto `root`.
    pub async fn reduce(&self, buffer: &Buffer, root: Rank, op: ReduceOp) -> WorkResult {
        self.check_root(root)?;
        self.collective(Dispatch::new(
            OpKind::Reduce,
            vec![buffer.clone()],
            vec![buffer.clone()],
            Primitive::Reduce { op, root },
        ))
        .await
    }

    pub async fn reduce_oop(
        &self,
        input: &Buffer,
        output: &Buffer,
        root: Rank,
        op: ReduceOp,
    ) -> WorkResult {
        self.check_root(root)?;
        if input.numel() != output.numel() {
            return Err(VigilError::InvalidArgument(format!(
                "out-of-place reduce needs equally sized buffers, got {} and {}",
                input.numel(),
                output.numel()
            )));
        }
        self.collective(Dispatch::new(
            OpKind::Reduce,
            vec![input.clone()],
            vec![output.clone()],
            Primitive::Reduce { op, root },
        ))
        .await
    }

    /// Gather `input` from every rank into `outputs[rank]`.
    ///
    /// Equally sized outputs go through one flat all-gather. Uneven sizes
    /// are issued as one broadcast per rank inside a coalescing session,
    /// which therefore must not already be open.
    pub async fn all_gather(&self, outputs: &[Buffer], input: &Buffer) -> WorkResult {
        self.check_count("all-gather", outputs)?;
        common_layout(outputs.iter().chain(std::iter::once(input)))?;

        if outputs.iter().all(|o| o.numel() == input.numel()) {
            let flat = self.alloc_like(input, input.numel() * outputs.len())?;
            let d = Dispatch::new(
                OpKind::AllGather,
                vec![input.clone()],
                vec![flat.clone()],
                Primitive::AllGather,
            )
            .with_strategy(CopyBack {
                flat,
                targets: outputs.to_vec(),
            })
            .with_results(outputs.to_vec());
            return self.collective(d).await;
        }

        self.start_coalescing()?;
        for (root, output) in (0..self.size()).zip(outputs) {
            let source = if root == self.rank() { input } else { output };
            if let Err(e) = self.broadcast_oop(source, output, root).await {
                return Err(self.abandon_coalescing(OpKind::AllGather, e));
            }
        }
        self.end_coalescing(Some(OpKind::AllGather))
    }

    /// Gather into one flat buffer of `size * input.numel()` elements.
    pub async fn all_gather_into_tensor(&self, output: &Buffer, input: &Buffer) -> WorkResult {
        self.check_flat("all-gather", output, input.numel())?;
        self.collective(Dispatch::new(
            OpKind::AllGatherBase,
            vec![input.clone()],
            vec![output.clone()],
            Primitive::AllGather,
        ))
        .await
    }

    pub async fn all_gather_into_tensor_coalesced(
        &self,
        outputs: &[Buffer],
        inputs: &[Buffer],
    ) -> WorkResult {
        self.check_pairs(outputs, inputs)?;
        for (o, i) in outputs.iter().zip(inputs) {
            self.check_flat("all-gather", o, i.numel())?;
        }
        self.collective(Dispatch::new(
            OpKind::AllGatherCoalesced,
            inputs.to_vec(),
            outputs.to_vec(),
            Primitive::AllGather,
        ))
        .await
    }

    /// Reduce `inputs` (one per rank) across ranks, leaving the slice for
    /// this rank in `output`. Uneven inputs become one reduce per root inside
    /// a coalescing session.
    pub async fn reduce_scatter(
        &self,
        output: &Buffer,
        inputs: &[Buffer],
        op: ReduceOp,
    ) -> WorkResult {
        self.check_count("reduce-scatter", inputs)?;
        common_layout(inputs.iter().chain(std::iter::once(output)))?;

        if inputs.iter().all(|i| i.numel() == output.numel()) {
            let flat = self.alloc_like(output, output.numel() * inputs.len())?;
            let d = Dispatch::new(
                OpKind::ReduceScatter,
                vec![flat.clone()],
                vec![output.clone()],
                Primitive::ReduceScatter(op),
            )
            .with_strategy(FlattenInputs {
                flat,
                sources: inputs.to_vec(),
            });
            return self.collective(d).await;
        }

        self.start_coalescing()?;
        for (root, input) in (0..self.size()).zip(inputs) {
            let target = if root == self.rank() { output } else { input };
            if let Err(e) = self.reduce_oop(input, target, root, op).await {
                return Err(self.abandon_coalescing(OpKind::ReduceScatter, e));
            }
        }
        self.end_coalescing(Some(OpKind::ReduceScatter))
    }

    /// Reduce-scatter from one flat buffer of `size * output.numel()` elements.
    pub async fn reduce_scatter_tensor(
        &self,
        output: &Buffer,
        input: &Buffer,
        op: ReduceOp,
    ) -> WorkResult {
        self.check_flat("reduce-scatter", input, output.numel())?;
        self.collective(Dispatch::new(
            OpKind::ReduceScatterBase,
            vec![input.clone()],
            vec![output.clone()],
            Primitive::ReduceScatter(op),
        ))
        .await
    }

    pub async fn reduce_scatter_tensor_coalesced(
        &self,
        outputs: &[Buffer],
        inputs: &[Buffer],
        op: ReduceOp,
    ) -> WorkResult {
        self.check_pairs(outputs, inputs)?;
        for (o, i) in outputs.iter().zip(inputs) {
            self.check_flat("reduce-scatter", i, o.numel())?;
        }
        self.collective(Dispatch::new(
            OpKind::ReduceScatterCoalesced,
            inputs.to_vec(),
            outputs.to_vec(),
            Primitive::ReduceScatter(op),
        ))
        .await
    }

    /// Exchange slices of `input` with every rank. Without splits both
    /// buffers are divided evenly; split lists give elements per rank.
    pub async fn all_to_all_base(
        &self,
        output: &Buffer,
        input: &Buffer,
        output_splits: Option<&[usize]>,
        input_splits: Option<&[usize]>,
    ) -> WorkResult {
        let send = self.splits("input", input, input_splits)?;
        let recv = self.splits("output", output, output_splits)?;
        self.collective(Dispatch::new(
            OpKind::AllToAllBase,
            vec![input.clone()],
            vec![output.clone()],
            Primitive::AllToAll { send, recv },
        ))
        .await
    }

    /// Send `inputs[p]` to rank `p` and receive `outputs[p]` from it.
    pub async fn all_to_all(&self, outputs: &[Buffer], inputs: &[Buffer]) -> WorkResult {
        self.check_count("all-to-all inputs", inputs)?;
        self.check_count("all-to-all outputs", outputs)?;
        self.collective(Dispatch::new(
            OpKind::AllToAll,
            inputs.to_vec(),
            outputs.to_vec(),
            Primitive::AllToAllList,
        ))
        .await
    }

    /// Gather `input` from every rank into `outputs` on `root`. Non-root
    /// ranks pass no outputs.
    pub async fn gather(&self, outputs: &[Buffer], input: &Buffer, root: Rank) -> WorkResult {
        self.check_root(root)?;
        if self.rank() == root {
            self.check_count("gather", outputs)?;
            if outputs.iter().any(|o| o.numel() != input.numel()) {
                return Err(VigilError::InvalidArgument(
                    "gather outputs must match the input size".into(),
                ));
            }
        } else if !outputs.is_empty() {
            return Err(VigilError::InvalidArgument(format!(
                "only the root passes gather outputs (rank {}, root {root})",
                self.rank()
            )));
        }
        self.collective(Dispatch::new(
            OpKind::Gather,
            vec![input.clone()],
            outputs.to_vec(),
            Primitive::Gather { root },
        ))
        .await
    }

    /// Scatter `inputs` on `root` so rank `p` receives `inputs[p]` in
    /// `output`. Non-root ranks pass no inputs.
    pub async fn scatter(&self, output: &Buffer, inputs: &[Buffer], root: Rank) -> WorkResult {
        self.check_root(root)?;
        if self.rank() == root {
            self.check_count("scatter", inputs)?;
            if inputs.iter().any(|i| i.numel() != output.numel()) {
                return Err(VigilError::InvalidArgument(
                    "scatter inputs must match the output size".into(),
                ));
            }
        } else if !inputs.is_empty() {
            return Err(VigilError::InvalidArgument(format!(
                "only the root passes scatter inputs (rank {}, root {root})",
                self.rank()
            )));
        }
        self.collective(Dispatch::new(
            OpKind::Scatter,
            inputs.to_vec(),
            vec![output.clone()],
            Primitive::Scatter { root },
        ))
        .await
    }

    pub async fn send(&self, buffer: &Buffer, peer: Rank) -> WorkResult {
        self.point_to_point(OpKind::Send, buffer, peer).await
    }

    pub async fn recv(&self, buffer: &Buffer, peer: Rank) -> WorkResult {
        self.point_to_point(OpKind::Recv, buffer, peer).await
    }

    /// All-reduce a one-byte buffer on the last used device, or a device
    /// guessed from the rank. The Work's `wait` returns only after the host
    /// observed completion.
    pub async fn barrier(&self) -> WorkResult {
        let st = &self.state;
        let device = match st.cache.last_device() {
            Some(d) => d,
            None => {
                let count = st.runtime.device_count().max(1) as u32;
                let guessed = st.rank % count;
                tracing::info!(
                    "{}barrier is using device {guessed} guessed from the rank; \
                     issue a collective first to pin the device",
                    st.prefix
                );
                guessed
            }
        };
        let buffer = st.runtime.allocate(device, DataType::U8, 1)?;
        let work = self
            .collective(Dispatch::new(
                OpKind::Barrier,
                vec![buffer.clone()],
                vec![buffer.clone()],
                Primitive::AllReduce(ReduceOp::Sum),
            ))
            .await?;
        if let Some(w) = &work {
            w.set_barrier_buffer(buffer);
        }
        Ok(work)
    }

    fn check_flat(&self, what: &str, flat: &Buffer, per_rank: usize) -> Result<()> {
        if flat.numel() != per_rank * self.size() as usize {
            return Err(VigilError::InvalidArgument(format!(
                "{what} flat buffer needs {} elements ({} ranks x {per_rank}), got {}",
                per_rank * self.size() as usize,
                self.size(),
                flat.numel()
            )));
        }
        Ok(())
    }

    fn check_pairs(&self, outputs: &[Buffer], inputs: &[Buffer]) -> Result<()> {
        if outputs.is_empty() || outputs.len() != inputs.len() {
            return Err(VigilError::InvalidArgument(format!(
                "coalesced operation needs matching input and output lists, got {} and {}",
                inputs.len(),
                outputs.len()
            )));
        }
        Ok(())
    }

    fn splits(&self, what: &str, buffer: &Buffer, splits: Option<&[usize]>) -> Result<Vec<usize>> {
        let size = self.size() as usize;
        match splits {
            Some(s) if !s.is_empty() => {
                if s.len() != size || s.iter().sum::<usize>() != buffer.numel() {
                    return Err(VigilError::InvalidArgument(format!(
                        "{what} splits {s:?} do not cover {} elements over {size} ranks",
                        buffer.numel()
                    )));
                }
                Ok(s.to_vec())
            }
            _ => {
                if buffer.numel() % size != 0 {
                    return Err(VigilError::InvalidArgument(format!(
                        "{what} of {} elements does not divide evenly over {size} ranks",
                        buffer.numel()
                    )));
                }
                Ok(vec![buffer.numel() / size; size])
            }
        }
    }
}
