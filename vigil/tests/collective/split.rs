use std::sync::Arc;
use vigil::{Buffer, DeviceRuntime, ProcessGroup, ProcessGroupOptions, ReduceOp};

use super::helpers::{cluster_with_uid, completed, f32s, group_store, test_config};

#[tokio::test(start_paused = true)]
async fn test_split_derives_communicator_without_store_traffic() {
    let c = cluster_with_uid(4, test_config(), 10);
    for m in &c.members {
        m.pg.eager_connect_single_device(0).await.unwrap();
    }
    let (sets, gets) = (c.store.set_count(), c.store.get_count());

    // Ranks 0 and 1 split off with color 7, ranks 2 and 3 opt out.
    let children: Vec<ProcessGroup> = c.members[..2]
        .iter()
        .enumerate()
        .map(|(rank, m)| {
            ProcessGroup::builder(
                group_store(&c.store, 11),
                rank as u32,
                2,
                Arc::clone(&m.backend),
                Arc::clone(&m.runtime) as Arc<dyn DeviceRuntime>,
            )
            .config(test_config())
            .options(ProcessGroupOptions {
                uid: Some(11),
                ..Default::default()
            })
            .split_from(&m.pg, 7)
            .build()
            .unwrap()
        })
        .collect();

    let bufs: Vec<Buffer> = (0..2)
        .map(|r| Buffer::from_slice(0, &[r as f32 + 1.0; 2]))
        .collect();
    let mut works = Vec::new();
    for (child, buf) in children.iter().zip(&bufs) {
        works.push(child.all_reduce(buf, ReduceOp::Sum).await.unwrap().unwrap());
    }
    for m in &c.members[2..] {
        m.pg.perform_nocolor_split(0).unwrap();
    }
    for w in &works {
        completed(w).await;
        assert!(w.is_success());
    }
    for buf in &bufs {
        assert_eq!(f32s(buf), vec![3.0, 3.0]);
    }

    assert_eq!(c.store.set_count(), sets);
    assert_eq!(c.store.get_count(), gets);
    assert_eq!(c.pg(0).communicators().split_counter(), 1);
    assert_eq!(c.pg(0).communicators().get("0").unwrap().split_count(), 1);
    assert_eq!(c.pg(2).communicators().split_counter(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_split_requires_nonzero_color() {
    let c = cluster_with_uid(2, test_config(), 12);
    let m = &c.members[0];
    let built = ProcessGroup::builder(
        group_store(&c.store, 13),
        0,
        1,
        Arc::clone(&m.backend),
        Arc::clone(&m.runtime) as Arc<dyn DeviceRuntime>,
    )
    .split_from(&m.pg, 0)
    .build();
    assert!(built.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_nocolor_split_needs_a_communicator() {
    let c = cluster_with_uid(2, test_config(), 14);
    assert!(c.pg(1).perform_nocolor_split(0).is_err());
}
