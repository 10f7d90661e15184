//! In-process reference backend.
//!
//! A [`LocalFabric`] simulates one job: every simulated rank gets its own
//! [`LocalRuntime`] and a [`LocalBackend`] built from the shared fabric.
//! Collectives complete once every member of the communicator has issued the
//! matching call; until then the work stays pending on the issuing stream,
//! which is exactly what the watchdog observes for a hung peer.

mod runtime;

pub use runtime::LocalRuntime;

use crate::backend::{BackendComm, BackendStatus, CollectiveBackend, StreamHandle, UniqueId};
use crate::buffer::Buffer;
use crate::error::{Result, VigilError};
use crate::reduce::reduce_all;
use crate::types::{DeviceIndex, NO_COLOR, Rank, ReduceOp};
use runtime::PendingOp;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Compute a non-zero FNV-1a hash over an iterator of byte slices.
///
/// All members of a split derive the same child id from the parent id, the
/// split generation and the color.
fn fnv1a_comm_id<I, S>(parts: I) -> u64
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    let mut h: u64 = 0xcbf29ce484222325; // FNV-1a offset basis
    for part in parts {
        for &b in part.as_ref() {
            h ^= b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
    }
    if h == 0 { 1 } else { h }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CollectiveKind {
    AllReduce(ReduceOp),
    Broadcast(Rank),
    Reduce(ReduceOp, Rank),
    AllGather,
    ReduceScatter(ReduceOp),
}

struct Contribution {
    data: Vec<u8>,
    recv: Buffer,
}

struct Rendezvous {
    kind: CollectiveKind,
    contributions: HashMap<Rank, Contribution>,
    op: Arc<PendingOp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TransferKey {
    comm: u64,
    src: Rank,
    dst: Rank,
    seq: u64,
}

struct Transfer {
    data: Option<Vec<u8>>,
    recv: Option<Buffer>,
    op: Arc<PendingOp>,
}

struct SplitRound {
    parent_world: u32,
    entries: Vec<(Rank, i32, Rank)>,
}

#[derive(Default)]
struct FabricState {
    /// World size per communicator id, `None` while a split is unresolved.
    groups: HashMap<u64, Option<u32>>,
    collectives: HashMap<(u64, u64), Rendezvous>,
    transfers: HashMap<TransferKey, Transfer>,
    splits: HashMap<(u64, u64), SplitRound>,
    /// Asynchronous errors per communicator id.
    poisoned: HashMap<u64, BackendStatus>,
    injected: Option<BackendStatus>,
    fail_next: Option<BackendStatus>,
}

impl FabricState {
    fn try_complete(&mut self, key: (u64, u64)) {
        let Some(Some(world)) = self.groups.get(&key.0).copied() else {
            return;
        };
        let ready = self
            .collectives
            .get(&key)
            .is_some_and(|r| r.contributions.len() as u32 >= world);
        if !ready {
            return;
        }
        let Some(rv) = self.collectives.remove(&key) else {
            return;
        };
        if let Err(e) = apply(&rv, world) {
            tracing::warn!(comm = key.0, error = %e, "local collective failed");
            self.poisoned.insert(key.0, BackendStatus::InvalidArgument);
        }
        rv.op.complete();
    }

    fn resolve_split(&mut self, parent: u64, generation: u64) {
        let Some(round) = self.splits.get(&(parent, generation)) else {
            return;
        };
        if round.entries.len() as u32 != round.parent_world {
            return;
        }
        let Some(round) = self.splits.remove(&(parent, generation)) else {
            return;
        };
        let mut by_color: HashMap<i32, Vec<Rank>> = HashMap::new();
        for &(_, color, key) in &round.entries {
            if color != NO_COLOR {
                by_color.entry(color).or_default().push(key);
            }
        }
        for (color, mut keys) in by_color {
            let child = child_comm_id(parent, generation, color);
            keys.sort_unstable();
            let dense = keys.iter().enumerate().all(|(i, &k)| i as u32 == k);
            if !dense {
                tracing::warn!(color, ?keys, "split keys must be dense ranks 0..n");
                self.poisoned.insert(child, BackendStatus::InvalidUsage);
            }
            self.groups.insert(child, Some(keys.len() as u32));
            let pending: Vec<(u64, u64)> = self
                .collectives
                .keys()
                .filter(|k| k.0 == child)
                .copied()
                .collect();
            for key in pending {
                self.try_complete(key);
            }
        }
    }

    /// Complete every outstanding operation of communicator `comm`.
    fn drain_comm(&mut self, comm: u64) {
        let keys: Vec<(u64, u64)> = self
            .collectives
            .keys()
            .filter(|k| k.0 == comm)
            .copied()
            .collect();
        for key in keys {
            if let Some(rv) = self.collectives.remove(&key) {
                rv.op.complete();
            }
        }
        let keys: Vec<TransferKey> = self
            .transfers
            .keys()
            .filter(|k| k.comm == comm)
            .copied()
            .collect();
        for key in keys {
            if let Some(t) = self.transfers.remove(&key) {
                t.op.complete();
            }
        }
    }
}

fn child_comm_id(parent: u64, generation: u64, color: i32) -> u64 {
    fnv1a_comm_id([
        &parent.to_le_bytes()[..],
        &generation.to_le_bytes(),
        &color.to_le_bytes(),
    ])
}

fn apply(rv: &Rendezvous, world: u32) -> Result<()> {
    let ordered: Vec<&Contribution> = (0..world)
        .filter_map(|r| rv.contributions.get(&r))
        .collect();
    if ordered.len() as u32 != world {
        return Err(VigilError::InvalidArgument(
            "contributions are not keyed by dense ranks".into(),
        ));
    }
    let Some(first) = ordered.first() else {
        return Ok(());
    };
    let dtype = first.recv.dtype();
    match rv.kind {
        CollectiveKind::AllReduce(op) => {
            let inputs: Vec<&[u8]> = ordered.iter().map(|c| c.data.as_slice()).collect();
            let count = first.data.len() / dtype.size_in_bytes();
            let result = reduce_all(&inputs, count, dtype, op)?;
            for c in &ordered {
                c.recv.write_bytes(&result)?;
            }
        }
        CollectiveKind::Broadcast(root) => {
            let data = &member(&ordered, root)?.data;
            for c in &ordered {
                c.recv.write_bytes(data)?;
            }
        }
        CollectiveKind::Reduce(op, root) => {
            let inputs: Vec<&[u8]> = ordered.iter().map(|c| c.data.as_slice()).collect();
            let count = first.data.len() / dtype.size_in_bytes();
            let result = reduce_all(&inputs, count, dtype, op)?;
            member(&ordered, root)?.recv.write_bytes(&result)?;
        }
        CollectiveKind::AllGather => {
            let gathered: Vec<u8> = ordered.iter().flat_map(|c| c.data.iter().copied()).collect();
            for c in &ordered {
                c.recv.write_bytes(&gathered)?;
            }
        }
        CollectiveKind::ReduceScatter(op) => {
            let inputs: Vec<&[u8]> = ordered.iter().map(|c| c.data.as_slice()).collect();
            let count = first.data.len() / dtype.size_in_bytes();
            let result = reduce_all(&inputs, count, dtype, op)?;
            let chunk = result.len() / world as usize;
            for (r, c) in ordered.iter().enumerate() {
                c.recv.write_bytes(&result[r * chunk..(r + 1) * chunk])?;
            }
        }
    }
    Ok(())
}

fn member<'a>(ordered: &[&'a Contribution], root: Rank) -> Result<&'a Contribution> {
    ordered
        .get(root as usize)
        .copied()
        .ok_or_else(|| VigilError::InvalidArgument(format!("root {root} out of range")))
}

struct FabricInner {
    state: Mutex<FabricState>,
    next_id: AtomicU64,
}

impl FabricInner {
    fn lock(&self) -> Option<std::sync::MutexGuard<'_, FabricState>> {
        self.state.lock().ok()
    }

    fn take_failure(&self) -> Option<BackendStatus> {
        self.lock().and_then(|mut s| s.fail_next.take())
    }
}

/// Shared simulation of one multi-rank job.
#[derive(Clone)]
pub struct LocalFabric {
    inner: Arc<FabricInner>,
}

impl LocalFabric {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FabricInner {
                state: Mutex::new(FabricState::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Backend for one simulated rank, issuing its work on `runtime`.
    pub fn backend(&self, runtime: Arc<LocalRuntime>) -> LocalBackend {
        LocalBackend {
            fabric: Arc::clone(&self.inner),
            runtime,
            group_depth: AtomicI64::new(0),
        }
    }

    /// Every communicator reports `status` as its asynchronous error from now on.
    pub fn inject_error(&self, status: BackendStatus) {
        if let Some(mut s) = self.inner.lock() {
            s.injected = Some(status);
        }
    }

    /// The next collective or point-to-point call fails synchronously with `status`.
    pub fn fail_next_call(&self, status: BackendStatus) {
        if let Some(mut s) = self.inner.lock() {
            s.fail_next = Some(status);
        }
    }

    /// Number of collectives and transfers still waiting for peers.
    pub fn pending_operations(&self) -> usize {
        self.inner
            .lock()
            .map(|s| s.collectives.len() + s.transfers.len())
            .unwrap_or(0)
    }
}

impl Default for LocalFabric {
    fn default() -> Self {
        Self::new()
    }
}

/// One rank's view of a [`LocalFabric`].
pub struct LocalBackend {
    fabric: Arc<FabricInner>,
    runtime: Arc<LocalRuntime>,
    group_depth: AtomicI64,
}

impl CollectiveBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "LOCAL"
    }

    fn generate_unique_id(&self) -> Result<UniqueId> {
        let id = self.fabric.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(UniqueId(id.to_le_bytes().to_vec()))
    }

    fn create_comm(
        &self,
        id: &UniqueId,
        world_size: u32,
        rank: Rank,
        device: DeviceIndex,
    ) -> Result<Arc<dyn BackendComm>> {
        let raw: [u8; 8] = id
            .0
            .as_slice()
            .try_into()
            .map_err(|_| VigilError::InvalidArgument(format!("malformed unique id {}", id.hex())))?;
        let comm_id = u64::from_le_bytes(raw);
        if rank >= world_size {
            return Err(VigilError::InvalidArgument(format!(
                "rank {rank} out of range for world size {world_size}"
            )));
        }
        let mut s = self
            .fabric
            .lock()
            .ok_or(VigilError::LockPoisoned("local fabric"))?;
        match s.groups.get(&comm_id) {
            Some(Some(w)) if *w != world_size => {
                return Err(VigilError::backend(
                    format!("communicator {comm_id} has {w} members, rank {rank} expected {world_size}"),
                    BackendStatus::InvalidUsage,
                ));
            }
            _ => {
                s.groups.insert(comm_id, Some(world_size));
            }
        }
        Ok(Arc::new(LocalComm::new(
            Arc::clone(&self.fabric),
            Arc::clone(&self.runtime),
            comm_id,
            rank,
            device,
        )))
    }

    fn group_start(&self) -> BackendStatus {
        self.group_depth.fetch_add(1, Ordering::AcqRel);
        BackendStatus::Success
    }

    fn group_end(&self) -> BackendStatus {
        if self.group_depth.fetch_sub(1, Ordering::AcqRel) <= 0 {
            self.group_depth.fetch_add(1, Ordering::AcqRel);
            return BackendStatus::InvalidUsage;
        }
        BackendStatus::Success
    }
}

struct LocalComm {
    fabric: Arc<FabricInner>,
    runtime: Arc<LocalRuntime>,
    comm_id: u64,
    rank: Rank,
    device: DeviceIndex,
    collective_seq: AtomicU64,
    split_generation: AtomicU64,
    send_seq: Mutex<HashMap<Rank, u64>>,
    recv_seq: Mutex<HashMap<Rank, u64>>,
    aborted: AtomicBool,
}

impl LocalComm {
    fn new(
        fabric: Arc<FabricInner>,
        runtime: Arc<LocalRuntime>,
        comm_id: u64,
        rank: Rank,
        device: DeviceIndex,
    ) -> Self {
        Self {
            fabric,
            runtime,
            comm_id,
            rank,
            device,
            collective_seq: AtomicU64::new(0),
            split_generation: AtomicU64::new(0),
            send_seq: Mutex::new(HashMap::new()),
            recv_seq: Mutex::new(HashMap::new()),
            aborted: AtomicBool::new(false),
        }
    }

    fn preflight(&self) -> std::result::Result<(), BackendStatus> {
        if self.aborted.load(Ordering::Acquire) {
            return Err(BackendStatus::InvalidUsage);
        }
        if let Some(status) = self.fabric.take_failure() {
            return Err(status);
        }
        Ok(())
    }

    fn collective(
        &self,
        kind: CollectiveKind,
        send: &Buffer,
        recv: &Buffer,
        stream: StreamHandle,
    ) -> BackendStatus {
        if let Err(status) = self.preflight() {
            return status;
        }
        let Ok(data) = send.read_bytes() else {
            return BackendStatus::InvalidArgument;
        };
        let seq = self.collective_seq.fetch_add(1, Ordering::AcqRel);
        let key = (self.comm_id, seq);
        let Some(mut s) = self.fabric.lock() else {
            return BackendStatus::InternalError;
        };
        let rv = s.collectives.entry(key).or_insert_with(|| Rendezvous {
            kind,
            contributions: HashMap::new(),
            op: PendingOp::new(),
        });
        if rv.kind != kind {
            tracing::warn!(
                comm = self.comm_id,
                seq,
                expected = ?rv.kind,
                got = ?kind,
                "mismatched collective across ranks"
            );
            s.poisoned.insert(self.comm_id, BackendStatus::InvalidUsage);
            return BackendStatus::InvalidUsage;
        }
        rv.contributions.insert(
            self.rank,
            Contribution {
                data,
                recv: recv.clone(),
            },
        );
        let op = Arc::clone(&rv.op);
        s.try_complete(key);
        drop(s);
        match self.runtime.enqueue(stream, op) {
            Ok(()) => BackendStatus::Success,
            Err(_) => BackendStatus::InvalidArgument,
        }
    }

    fn next_seq(table: &Mutex<HashMap<Rank, u64>>, peer: Rank) -> Option<u64> {
        let mut t = table.lock().ok()?;
        let slot = t.entry(peer).or_default();
        let seq = *slot;
        *slot += 1;
        Some(seq)
    }

    fn transfer(
        &self,
        key: TransferKey,
        data: Option<Vec<u8>>,
        recv: Option<Buffer>,
        stream: StreamHandle,
    ) -> BackendStatus {
        let Some(mut s) = self.fabric.lock() else {
            return BackendStatus::InternalError;
        };
        let t = s.transfers.entry(key).or_insert_with(|| Transfer {
            data: None,
            recv: None,
            op: PendingOp::new(),
        });
        if data.is_some() {
            t.data = data;
        }
        if recv.is_some() {
            t.recv = recv;
        }
        let op = Arc::clone(&t.op);
        if t.data.is_some() && t.recv.is_some() {
            if let Some(t) = s.transfers.remove(&key) {
                if let (Some(bytes), Some(dst)) = (&t.data, &t.recv)
                    && let Err(e) = dst.write_bytes(bytes)
                {
                    tracing::warn!(comm = key.comm, error = %e, "local transfer failed");
                    s.poisoned.insert(key.comm, BackendStatus::InvalidArgument);
                }
                t.op.complete();
            }
        }
        drop(s);
        match self.runtime.enqueue(stream, op) {
            Ok(()) => BackendStatus::Success,
            Err(_) => BackendStatus::InvalidArgument,
        }
    }
}

impl BackendComm for LocalComm {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn device(&self) -> DeviceIndex {
        self.device
    }

    fn split(&self, color: i32, key: Rank) -> Result<Option<Arc<dyn BackendComm>>> {
        if self.aborted.load(Ordering::Acquire) {
            return Err(VigilError::backend(
                "cannot split an aborted communicator",
                BackendStatus::InvalidUsage,
            ));
        }
        let generation = self.split_generation.fetch_add(1, Ordering::AcqRel);
        let mut s = self
            .fabric
            .lock()
            .ok_or(VigilError::LockPoisoned("local fabric"))?;
        let Some(Some(parent_world)) = s.groups.get(&self.comm_id).copied() else {
            return Err(VigilError::backend(
                "parent communicator membership is not resolved yet",
                BackendStatus::InvalidUsage,
            ));
        };
        s.splits
            .entry((self.comm_id, generation))
            .or_insert_with(|| SplitRound {
                parent_world,
                entries: Vec::new(),
            })
            .entries
            .push((self.rank, color, key));
        let child = (color != NO_COLOR).then(|| child_comm_id(self.comm_id, generation, color));
        if let Some(id) = child {
            s.groups.entry(id).or_insert(None);
        }
        s.resolve_split(self.comm_id, generation);
        drop(s);

        Ok(child.map(|id| {
            Arc::new(LocalComm::new(
                Arc::clone(&self.fabric),
                Arc::clone(&self.runtime),
                id,
                key,
                self.device,
            )) as Arc<dyn BackendComm>
        }))
    }

    fn abort(&self) -> BackendStatus {
        if self.aborted.swap(true, Ordering::AcqRel) {
            return BackendStatus::Success;
        }
        if let Some(mut s) = self.fabric.lock() {
            s.drain_comm(self.comm_id);
        }
        BackendStatus::Success
    }

    fn async_error(&self) -> BackendStatus {
        let Some(s) = self.fabric.lock() else {
            return BackendStatus::InternalError;
        };
        if let Some(status) = s.poisoned.get(&self.comm_id) {
            return *status;
        }
        s.injected.unwrap_or(BackendStatus::Success)
    }

    fn register_segment(&self, _address: u64, _len_bytes: usize) -> BackendStatus {
        BackendStatus::Success
    }

    fn deregister_segment(&self, _address: u64) -> BackendStatus {
        BackendStatus::Success
    }

    fn all_reduce(
        &self,
        send: &Buffer,
        recv: &Buffer,
        op: ReduceOp,
        stream: StreamHandle,
    ) -> BackendStatus {
        self.collective(CollectiveKind::AllReduce(op), send, recv, stream)
    }

    fn broadcast(
        &self,
        send: &Buffer,
        recv: &Buffer,
        root: Rank,
        stream: StreamHandle,
    ) -> BackendStatus {
        self.collective(CollectiveKind::Broadcast(root), send, recv, stream)
    }

    fn reduce(
        &self,
        send: &Buffer,
        recv: &Buffer,
        op: ReduceOp,
        root: Rank,
        stream: StreamHandle,
    ) -> BackendStatus {
        self.collective(CollectiveKind::Reduce(op, root), send, recv, stream)
    }

    fn all_gather(&self, send: &Buffer, recv: &Buffer, stream: StreamHandle) -> BackendStatus {
        self.collective(CollectiveKind::AllGather, send, recv, stream)
    }

    fn reduce_scatter(
        &self,
        send: &Buffer,
        recv: &Buffer,
        op: ReduceOp,
        stream: StreamHandle,
    ) -> BackendStatus {
        self.collective(CollectiveKind::ReduceScatter(op), send, recv, stream)
    }

    fn send(&self, buffer: &Buffer, peer: Rank, stream: StreamHandle) -> BackendStatus {
        if let Err(status) = self.preflight() {
            return status;
        }
        let Ok(data) = buffer.read_bytes() else {
            return BackendStatus::InvalidArgument;
        };
        let Some(seq) = Self::next_seq(&self.send_seq, peer) else {
            return BackendStatus::InternalError;
        };
        let key = TransferKey {
            comm: self.comm_id,
            src: self.rank,
            dst: peer,
            seq,
        };
        self.transfer(key, Some(data), None, stream)
    }

    fn recv(&self, buffer: &Buffer, peer: Rank, stream: StreamHandle) -> BackendStatus {
        if let Err(status) = self.preflight() {
            return status;
        }
        if !buffer.is_host() {
            return BackendStatus::InvalidArgument;
        }
        let Some(seq) = Self::next_seq(&self.recv_seq, peer) else {
            return BackendStatus::InternalError;
        };
        let key = TransferKey {
            comm: self.comm_id,
            src: peer,
            dst: self.rank,
            seq,
        };
        self.transfer(key, None, Some(buffer.clone()), stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DeviceRuntime;

    struct Rank0And1 {
        rt: [Arc<LocalRuntime>; 2],
        comms: [Arc<dyn BackendComm>; 2],
    }

    fn pair(fabric: &LocalFabric) -> Rank0And1 {
        let rt = [Arc::new(LocalRuntime::new(1)), Arc::new(LocalRuntime::new(1))];
        let b0 = fabric.backend(Arc::clone(&rt[0]));
        let b1 = fabric.backend(Arc::clone(&rt[1]));
        let id = b0.generate_unique_id().unwrap();
        let comms = [
            b0.create_comm(&id, 2, 0, 0).unwrap(),
            b1.create_comm(&id, 2, 1, 0).unwrap(),
        ];
        Rank0And1 { rt, comms }
    }

    fn done(rt: &LocalRuntime, stream: StreamHandle) -> bool {
        let ev = rt.create_event(0, false).unwrap();
        rt.record_event(ev, stream).unwrap();
        rt.query_event(ev).unwrap()
    }

    #[test]
    fn test_fnv1a_deterministic() {
        assert_eq!(child_comm_id(5, 0, 7), child_comm_id(5, 0, 7));
        assert_ne!(child_comm_id(5, 0, 7), child_comm_id(5, 1, 7));
    }

    #[test]
    fn test_all_reduce_completes_when_all_ranks_join() {
        let fabric = LocalFabric::new();
        let p = pair(&fabric);
        let s0 = p.rt[0].stream_from_pool(0, false).unwrap();
        let s1 = p.rt[1].stream_from_pool(0, false).unwrap();
        let a = Buffer::from_slice(0, &[1.0f32, 2.0]);
        let b = Buffer::from_slice(0, &[3.0f32, 4.0]);

        assert!(p.comms[0].all_reduce(&a, &a, ReduceOp::Sum, s0).is_ok());
        assert!(!done(&p.rt[0], s0));
        assert!(p.comms[1].all_reduce(&b, &b, ReduceOp::Sum, s1).is_ok());
        assert!(done(&p.rt[0], s0));
        assert_eq!(a.to_vec::<f32>().unwrap(), vec![4.0, 6.0]);
        assert_eq!(b.to_vec::<f32>().unwrap(), vec![4.0, 6.0]);
        assert_eq!(fabric.pending_operations(), 0);
    }

    #[test]
    fn test_send_recv_matches_in_order() {
        let fabric = LocalFabric::new();
        let p = pair(&fabric);
        let s0 = p.rt[0].stream_from_pool(0, false).unwrap();
        let s1 = p.rt[1].stream_from_pool(0, false).unwrap();
        let first = Buffer::zeros(0, crate::types::DataType::I32, &[1]);
        let second = Buffer::zeros(0, crate::types::DataType::I32, &[1]);
        assert!(p.comms[1].recv(&first, 0, s1).is_ok());
        assert!(p.comms[1].recv(&second, 0, s1).is_ok());
        assert!(p.comms[0].send(&Buffer::from_slice(0, &[10i32]), 1, s0).is_ok());
        assert!(p.comms[0].send(&Buffer::from_slice(0, &[20i32]), 1, s0).is_ok());
        assert_eq!(first.to_vec::<i32>().unwrap(), vec![10]);
        assert_eq!(second.to_vec::<i32>().unwrap(), vec![20]);
    }

    #[test]
    fn test_abort_releases_pending_work() {
        let fabric = LocalFabric::new();
        let p = pair(&fabric);
        let s0 = p.rt[0].stream_from_pool(0, false).unwrap();
        let a = Buffer::from_slice(0, &[1u8]);
        assert!(p.comms[0].all_reduce(&a, &a, ReduceOp::Max, s0).is_ok());
        assert!(!done(&p.rt[0], s0));
        assert!(p.comms[0].abort().is_ok());
        assert!(done(&p.rt[0], s0));
        assert_eq!(
            p.comms[0].all_reduce(&a, &a, ReduceOp::Max, s0),
            BackendStatus::InvalidUsage
        );
    }

    #[test]
    fn test_split_resolves_child_world() {
        let fabric = LocalFabric::new();
        let p = pair(&fabric);
        let c0 = p.comms[0].split(7, 0).unwrap().unwrap();
        let c1 = p.comms[1].split(7, 1).unwrap().unwrap();
        let s0 = p.rt[0].stream_from_pool(0, false).unwrap();
        let s1 = p.rt[1].stream_from_pool(0, false).unwrap();
        let a = Buffer::from_slice(0, &[2i64]);
        let b = Buffer::from_slice(0, &[5i64]);
        assert!(c0.all_reduce(&a, &a, ReduceOp::Prod, s0).is_ok());
        assert!(c1.all_reduce(&b, &b, ReduceOp::Prod, s1).is_ok());
        assert_eq!(a.to_vec::<i64>().unwrap(), vec![10]);
    }

    #[test]
    fn test_no_color_split_returns_none() {
        let fabric = LocalFabric::new();
        let p = pair(&fabric);
        assert!(p.comms[0].split(NO_COLOR, 0).unwrap().is_none());
    }

    #[test]
    fn test_injected_errors_surface() {
        let fabric = LocalFabric::new();
        let p = pair(&fabric);
        assert_eq!(p.comms[0].async_error(), BackendStatus::Success);
        fabric.inject_error(BackendStatus::RemoteError);
        assert_eq!(p.comms[1].async_error(), BackendStatus::RemoteError);

        let s0 = p.rt[0].stream_from_pool(0, false).unwrap();
        fabric.fail_next_call(BackendStatus::SystemError);
        let a = Buffer::from_slice(0, &[1u8]);
        assert_eq!(
            p.comms[0].broadcast(&a, &a, 0, s0),
            BackendStatus::SystemError
        );
    }

    #[test]
    fn test_mismatched_kinds_poison_the_communicator() {
        let fabric = LocalFabric::new();
        let p = pair(&fabric);
        let s0 = p.rt[0].stream_from_pool(0, false).unwrap();
        let s1 = p.rt[1].stream_from_pool(0, false).unwrap();
        let a = Buffer::from_slice(0, &[1.0f64]);
        assert!(p.comms[0].all_reduce(&a, &a, ReduceOp::Sum, s0).is_ok());
        assert_eq!(
            p.comms[1].broadcast(&a, &a, 0, s1),
            BackendStatus::InvalidUsage
        );
        assert_eq!(p.comms[0].async_error(), BackendStatus::InvalidUsage);
    }
}
