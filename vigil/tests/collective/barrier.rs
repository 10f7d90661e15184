use vigil::{Buffer, OpKind, ReduceOp};

use super::helpers::{cluster, completed, test_config};

#[tokio::test(start_paused = true)]
async fn test_barrier_4_ranks() {
    let c = cluster(4, test_config());
    let mut works = Vec::new();
    for m in &c.members {
        let w = m.pg.barrier().await.unwrap().unwrap();
        assert_eq!(w.kind(), OpKind::Barrier);
        works.push(w);
    }
    for w in &works {
        w.wait(None).await.unwrap();
        assert!(w.is_completed());
    }
}

#[tokio::test(start_paused = true)]
async fn test_barrier_uses_last_device() {
    let c = cluster(2, test_config());
    let bufs: Vec<Buffer> = (0..2).map(|_| Buffer::from_slice(0, &[1.0f32])).collect();
    for (m, buf) in c.members.iter().zip(&bufs) {
        m.pg.all_reduce(buf, ReduceOp::Sum).await.unwrap();
    }
    let mut works = Vec::new();
    for m in &c.members {
        works.push(m.pg.barrier().await.unwrap().unwrap());
    }
    for w in &works {
        assert_eq!(w.device(), 0);
        assert_eq!(w.seq(), 2);
        completed(w).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_barrier_wait_blocks_until_peers_arrive() {
    let c = cluster(2, test_config());
    let first = c.pg(0).barrier().await.unwrap().unwrap();
    let waiter = {
        let first = first.clone();
        tokio::spawn(async move { first.wait(None).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(!waiter.is_finished());

    c.pg(1).barrier().await.unwrap();
    waiter.await.unwrap().unwrap();
}
