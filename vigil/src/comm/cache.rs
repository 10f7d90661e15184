use super::{CommRegistry, Communicator};
use crate::backend::{
    BackendComm, CollectiveBackend, DeviceRuntime, Event, UniqueId, aborted_comm_store_key,
};
use crate::error::{Result, VigilError};
use crate::store::Store;
use crate::types::{DeviceIndex, Rank};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Which participant set a communicator key stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommRole {
    /// Every rank of the group, in group rank order.
    Collective,
    /// A two-rank communicator for one send/recv pair. `p2p_rank` is 0 for
    /// the lower group rank.
    PointToPoint { p2p_rank: Rank, to_self: bool },
}

/// Fixed parameters of a cache.
#[derive(Clone, Default)]
pub struct CacheSettings {
    pub rank: Rank,
    pub world_size: u32,
    pub high_priority_stream: bool,
    pub bound_device: Option<DeviceIndex>,
    /// Derive communicators from this cache's healthy communicators instead of
    /// running a rendezvous.
    pub split_from: Option<Arc<CommunicatorCache>>,
    pub split_color: i32,
    pub register_segments: bool,
    pub log_prefix: String,
}

/// Creation gate of one key. Callers of the same key queue on `gate`; other
/// keys are created independently.
struct Pending {
    gate: tokio::sync::Mutex<()>,
    /// Store key the unique id is exchanged under.
    id_key: String,
}

#[derive(Default)]
struct CacheInner {
    ready: HashMap<String, Arc<Communicator>>,
    initializing: HashMap<String, Arc<Communicator>>,
    pending: HashMap<String, Arc<Pending>>,
    used_devices: BTreeSet<DeviceIndex>,
    last_device: Option<DeviceIndex>,
}

/// Creates, caches and splits the communicators of one process group.
pub struct CommunicatorCache {
    settings: CacheSettings,
    backend: Arc<dyn CollectiveBackend>,
    runtime: Arc<dyn DeviceRuntime>,
    store: Arc<dyn Store>,
    registry: Arc<CommRegistry>,
    inner: Mutex<CacheInner>,
    comm_counter: AtomicU64,
    split_counter: AtomicU64,
}

impl CommunicatorCache {
    pub fn new(
        settings: CacheSettings,
        backend: Arc<dyn CollectiveBackend>,
        runtime: Arc<dyn DeviceRuntime>,
        store: Arc<dyn Store>,
        registry: Arc<CommRegistry>,
    ) -> Self {
        Self {
            settings,
            backend,
            runtime,
            store,
            registry,
            inner: Mutex::new(CacheInner::default()),
            comm_counter: AtomicU64::new(0),
            split_counter: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, CacheInner>> {
        self.inner
            .lock()
            .map_err(|_| VigilError::LockPoisoned("communicator cache"))
    }

    /// Return the communicator for `key`, creating it on first use.
    pub async fn get_or_create(
        &self,
        key: &str,
        device: DeviceIndex,
        role: CommRole,
    ) -> Result<Arc<Communicator>> {
        if key.is_empty() {
            return Err(VigilError::InvalidArgument(
                "communicator key must not be empty".into(),
            ));
        }
        if device as usize >= self.runtime.device_count() {
            return Err(VigilError::InvalidArgument(format!(
                "device {device} is not a valid local device ({} available)",
                self.runtime.device_count()
            )));
        }
        if let Some(bound) = self.settings.bound_device
            && bound != device
        {
            return Err(VigilError::InvalidArgument(format!(
                "group is bound to device {bound} but device {device} was requested"
            )));
        }
        let pending = {
            let mut inner = self.lock()?;
            inner.used_devices.insert(device);
            inner.last_device = Some(device);
            if let Some(comm) = inner.ready.get(key) {
                return usable(Arc::clone(comm));
            }
            match inner.pending.get(key) {
                Some(p) => Arc::clone(p),
                None => {
                    // Allocated before the first await so collective ids are
                    // numbered in call order, which matches across ranks.
                    let p = Arc::new(Pending {
                        gate: tokio::sync::Mutex::new(()),
                        id_key: self.id_store_key(key, role),
                    });
                    inner.pending.insert(key.to_string(), Arc::clone(&p));
                    p
                }
            }
        };

        let _creating = pending.gate.lock().await;
        if let Some(comm) = self.get(key) {
            return usable(comm);
        }
        let created = self.create(key, device, role, &pending.id_key).await;
        if let Ok(mut inner) = self.lock()
            && inner
                .pending
                .get(key)
                .is_some_and(|p| Arc::ptr_eq(p, &pending))
        {
            inner.pending.remove(key);
        }
        created
    }

    fn id_store_key(&self, key: &str, role: CommRole) -> String {
        match role {
            CommRole::Collective => self.comm_counter.fetch_add(1, Ordering::Relaxed).to_string(),
            CommRole::PointToPoint { .. } => key.to_string(),
        }
    }

    async fn create(
        &self,
        key: &str,
        device: DeviceIndex,
        role: CommRole,
        id_key: &str,
    ) -> Result<Arc<Communicator>> {
        let prefix = &self.settings.log_prefix;
        if role == CommRole::Collective
            && let Some(parent) = &self.settings.split_from
        {
            if self.settings.split_color == 0 {
                return Err(VigilError::InvalidArgument(
                    "split color must be non-zero when splitting from a parent group".into(),
                ));
            }
            if let Some(comm) = parent.split(key, self.settings.split_color, self.settings.rank)? {
                let comm = self.install(comm)?;
                tracing::info!(
                    "{prefix}derived communicator '{key}' on device {device} by splitting the parent"
                );
                return Ok(comm);
            }
        }

        let (world, comm_rank) = match role {
            CommRole::Collective => (self.settings.world_size, self.settings.rank),
            CommRole::PointToPoint { to_self: true, .. } => (1, 0),
            CommRole::PointToPoint { p2p_rank, .. } => (2, p2p_rank),
        };
        let id = self.exchange_unique_id(key, role, id_key).await?;
        let handle = self.backend.create_comm(&id, world, comm_rank, device)?;
        let comm = Arc::new(self.wrap(key, device, id, handle)?);

        self.lock()?
            .initializing
            .insert(key.to_string(), Arc::clone(&comm));
        if self.settings.register_segments {
            for segment in self.runtime.memory_segments(device) {
                if let Err(e) = comm.register_segment(&segment) {
                    tracing::warn!("{prefix}segment registration failed: {e}");
                }
            }
        }
        let comm = self.install(comm)?;
        tracing::info!(
            "{prefix}created communicator '{key}' on device {device} (rank {comm_rank} of {world}, id {})",
            comm.unique_id().hex()
        );
        Ok(comm)
    }

    fn wrap(
        &self,
        key: &str,
        device: DeviceIndex,
        id: UniqueId,
        handle: Arc<dyn BackendComm>,
    ) -> Result<Communicator> {
        let stream = self
            .runtime
            .stream_from_pool(device, self.settings.high_priority_stream)?;
        let sync_event = Event::new(&self.runtime, device, false)?;
        Ok(Communicator::new(
            key,
            device,
            id,
            handle,
            stream,
            sync_event,
            &self.registry,
        ))
    }

    /// Promote a parked communicator to `Ready`.
    fn install(&self, comm: Arc<Communicator>) -> Result<Arc<Communicator>> {
        let mut inner = self.lock()?;
        inner.initializing.remove(comm.key());
        if comm.is_aborted() {
            return Err(VigilError::communication(format!(
                "communicator '{}' was aborted during initialization",
                comm.key()
            )));
        }
        comm.mark_ready();
        inner
            .ready
            .insert(comm.key().to_string(), Arc::clone(&comm));
        drop(inner);
        self.registry.register(&comm);
        Ok(comm)
    }

    async fn exchange_unique_id(
        &self,
        key: &str,
        role: CommRole,
        store_key: &str,
    ) -> Result<UniqueId> {
        let writer = match role {
            CommRole::PointToPoint { to_self: true, .. } => {
                return self.backend.generate_unique_id();
            }
            CommRole::PointToPoint { p2p_rank, .. } => p2p_rank == 0,
            CommRole::Collective => self.settings.rank == 0,
        };
        if writer {
            let id = self.backend.generate_unique_id()?;
            self.store
                .set(store_key, id.0.clone())
                .await
                .map_err(|e| {
                    VigilError::store(
                        store_key,
                        format!("unable to publish unique id for '{key}': {e}"),
                    )
                })?;
            return Ok(id);
        }
        let bytes = self.store.get(store_key).await.map_err(|e| {
            VigilError::store(
                store_key,
                format!("unable to fetch unique id for '{key}': {e}"),
            )
        })?;
        if bytes.is_empty() {
            return Err(VigilError::store(
                store_key,
                format!("empty unique id published for '{key}'"),
            ));
        }
        Ok(UniqueId(bytes))
    }

    /// Derive a communicator from the healthy communicator cached under
    /// `parent_key`. No store access happens.
    ///
    /// Returns `None` when there is no healthy parent or the backend cannot split.
    pub fn split(
        &self,
        parent_key: &str,
        color: i32,
        local_rank: Rank,
    ) -> Result<Option<Arc<Communicator>>> {
        let Some(parent) = self.get(parent_key) else {
            return Ok(None);
        };
        if parent.is_aborted() {
            return Ok(None);
        }
        let Some(handle) = parent.handle().split(color, local_rank)? else {
            return Ok(None);
        };
        parent.note_split();
        self.split_counter.fetch_add(1, Ordering::Relaxed);
        let comm = self.wrap(parent_key, parent.device(), parent.unique_id().clone(), handle)?;
        comm.mark_ready();
        Ok(Some(Arc::new(comm)))
    }

    pub fn get(&self, key: &str) -> Option<Arc<Communicator>> {
        self.inner.lock().ok()?.ready.get(key).cloned()
    }

    /// Snapshot of every `Ready` (or aborted but not destroyed) communicator.
    pub fn communicators(&self) -> Vec<Arc<Communicator>> {
        self.inner
            .lock()
            .map(|i| i.ready.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Abort every communicator of the group. Entries stay in the cache.
    ///
    /// Returns how many communicators were aborted by this call.
    pub fn abort_all(&self, reason: Option<&str>) -> usize {
        let comms: Vec<Arc<Communicator>> = match self.inner.lock() {
            Ok(i) => i
                .ready
                .values()
                .chain(i.initializing.values())
                .cloned()
                .collect(),
            Err(_) => return 0,
        };
        let mut aborted = 0;
        for comm in comms {
            self.registry.deregister(&comm);
            if !comm.is_aborted() {
                comm.abort(reason);
                aborted += 1;
            }
        }
        if aborted > 0 {
            tracing::info!(
                "{}aborted {aborted} communicator(s): {}",
                self.settings.log_prefix,
                reason.unwrap_or("no reason given")
            );
        }
        aborted
    }

    /// Record in the store that this rank aborted `comms`.
    pub async fn publish_aborted(&self, comms: &[Arc<Communicator>]) {
        for comm in comms {
            let key = aborted_comm_store_key(comm.unique_id());
            if let Err(e) = self
                .store
                .set(&key, self.settings.rank.to_string().into_bytes())
                .await
            {
                tracing::warn!(
                    "{}failed to publish abort of '{}': {e}",
                    self.settings.log_prefix,
                    comm.key()
                );
            }
        }
    }

    /// Abort and forget the communicator for `key` so the next use recreates it.
    pub fn destroy(&self, key: &str) -> bool {
        let removed = self.inner.lock().ok().and_then(|mut i| i.ready.remove(key));
        match removed {
            Some(comm) => {
                comm.abort(Some("communicator destroyed"));
                true
            }
            None => false,
        }
    }

    /// Number of splits performed from this group's communicators.
    pub fn split_counter(&self) -> u64 {
        self.split_counter.load(Ordering::Relaxed)
    }

    pub fn used_devices(&self) -> Vec<DeviceIndex> {
        self.inner
            .lock()
            .map(|i| i.used_devices.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn last_device(&self) -> Option<DeviceIndex> {
        self.inner.lock().ok().and_then(|i| i.last_device)
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }
}

fn usable(comm: Arc<Communicator>) -> Result<Arc<Communicator>> {
    if comm.is_aborted() {
        return Err(VigilError::communication(format!(
            "communicator '{}' was aborted ({}); destroy it before reuse",
            comm.key(),
            comm.failure_reason().unwrap_or_default()
        )));
    }
    Ok(comm)
}
