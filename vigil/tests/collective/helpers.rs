use std::sync::Arc;
use std::time::Duration;
use vigil::{
    Buffer, CollectiveBackend, DeviceRuntime, LocalFabric, LocalRuntime, MemStore,
    MemoryDebugInfoWriter, PrefixStore, ProcessGroup, ProcessGroupConfig, ProcessGroupOptions,
    Rank, RecordingTerminator, Store, Work,
};

/// One simulated rank: its group plus the test doubles wired into it.
pub struct Member {
    pub pg: ProcessGroup,
    pub runtime: Arc<LocalRuntime>,
    pub backend: Arc<dyn CollectiveBackend>,
    pub terminator: Arc<RecordingTerminator>,
    pub writer: Arc<MemoryDebugInfoWriter>,
}

/// A simulated job: every member shares one fabric and one store.
pub struct Cluster {
    pub fabric: LocalFabric,
    pub store: Arc<MemStore>,
    pub members: Vec<Member>,
}

impl Cluster {
    pub fn pg(&self, rank: Rank) -> &ProcessGroup {
        &self.members[rank as usize].pg
    }
}

/// Short timeouts and a fast watchdog; the heartbeat monitor stays quiet.
pub fn test_config() -> ProcessGroupConfig {
    ProcessGroupConfig {
        timeout: Duration::from_secs(5),
        watchdog_poll_interval: Duration::from_millis(20),
        heartbeat_timeout: Duration::from_secs(3600),
        coord_check_interval: Duration::from_millis(500),
        trace_buffer_size: 64,
        ..ProcessGroupConfig::default()
    }
}

pub fn cluster(world: u32, config: ProcessGroupConfig) -> Cluster {
    cluster_with_uid(world, config, 1)
}

/// Build `world` ranks of group `uid`. Group keys live under `pg{uid}/` in
/// the shared store.
pub fn cluster_with_uid(world: u32, config: ProcessGroupConfig, uid: u64) -> Cluster {
    let fabric = LocalFabric::new();
    let store = Arc::new(MemStore::new());
    let members = (0..world)
        .map(|rank| {
            let runtime = Arc::new(LocalRuntime::new(1));
            let backend: Arc<dyn CollectiveBackend> =
                Arc::new(fabric.backend(Arc::clone(&runtime)));
            member(&store, rank, world, uid, config.clone(), runtime, backend)
        })
        .collect();
    Cluster {
        fabric,
        store,
        members,
    }
}

pub fn group_store(store: &Arc<MemStore>, uid: u64) -> Arc<dyn Store> {
    Arc::new(PrefixStore::new(
        format!("pg{uid}"),
        Arc::clone(store) as Arc<dyn Store>,
    ))
}

pub fn member(
    store: &Arc<MemStore>,
    rank: Rank,
    world: u32,
    uid: u64,
    config: ProcessGroupConfig,
    runtime: Arc<LocalRuntime>,
    backend: Arc<dyn CollectiveBackend>,
) -> Member {
    let terminator = Arc::new(RecordingTerminator::new());
    let writer = Arc::new(MemoryDebugInfoWriter::new());
    let pg = ProcessGroup::builder(
        group_store(store, uid),
        rank,
        world,
        Arc::clone(&backend),
        Arc::clone(&runtime) as Arc<dyn DeviceRuntime>,
    )
    .config(config)
    .options(ProcessGroupOptions {
        uid: Some(uid),
        ..Default::default()
    })
    .terminator(Arc::clone(&terminator) as _)
    .debug_writer(Arc::clone(&writer) as _)
    .build()
    .unwrap();
    Member {
        pg,
        runtime,
        backend,
        terminator,
        writer,
    }
}

/// Poll until the device side of `work` finished (or failed).
pub async fn completed(work: &Work) {
    while !work.is_completed() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

pub fn f32s(buffer: &Buffer) -> Vec<f32> {
    buffer.to_vec::<f32>().unwrap()
}
