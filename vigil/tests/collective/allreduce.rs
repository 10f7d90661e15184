use vigil::{Buffer, OpKind, ReduceOp, WorkState};

use super::helpers::{cluster, completed, f32s, test_config};

#[tokio::test(start_paused = true)]
async fn test_allreduce_2_ranks_sum() {
    let c = cluster(2, test_config());
    let bufs: Vec<Buffer> = (0..2)
        .map(|r| Buffer::from_slice(0, &[(r + 1) as f32; 4]))
        .collect();

    let mut works = Vec::new();
    for (m, buf) in c.members.iter().zip(&bufs) {
        works.push(m.pg.all_reduce(buf, ReduceOp::Sum).await.unwrap().unwrap());
    }
    for w in &works {
        completed(w).await;
        assert!(w.is_success());
        assert_eq!(w.seq(), 1);
        assert_eq!(w.kind(), OpKind::AllReduce);
    }
    for buf in &bufs {
        assert_eq!(f32s(buf), vec![3.0; 4]);
    }
    for m in &c.members {
        assert_eq!(m.pg.sequence_number(), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_allreduce_3_ranks_max_i32() {
    let c = cluster(3, test_config());
    let bufs: Vec<Buffer> = (0..3)
        .map(|r| Buffer::from_slice(0, &[r as i32, 10 - r as i32]))
        .collect();
    let mut works = Vec::new();
    for (m, buf) in c.members.iter().zip(&bufs) {
        works.push(m.pg.all_reduce(buf, ReduceOp::Max).await.unwrap().unwrap());
    }
    for w in &works {
        completed(w).await;
    }
    for buf in &bufs {
        assert_eq!(buf.to_vec::<i32>().unwrap(), vec![2, 10]);
    }
}

#[tokio::test(start_paused = true)]
async fn test_sequence_numbers_are_monotonic() {
    let c = cluster(2, test_config());
    let buf: Vec<Buffer> = (0..2).map(|_| Buffer::from_slice(0, &[1.0f32])).collect();
    let mut seqs = vec![Vec::new(), Vec::new()];
    for _ in 0..4 {
        for (r, m) in c.members.iter().enumerate() {
            let w = m.pg.all_reduce(&buf[r], ReduceOp::Sum).await.unwrap().unwrap();
            seqs[r].push(w.seq());
        }
    }
    assert_eq!(seqs[0], vec![1, 2, 3, 4]);
    assert_eq!(seqs[0], seqs[1]);
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_retires_completed_works() {
    let c = cluster(2, test_config());
    let bufs: Vec<Buffer> = (0..2).map(|_| Buffer::from_slice(0, &[1.0f32])).collect();
    let mut works = Vec::new();
    for (m, buf) in c.members.iter().zip(&bufs) {
        works.push(m.pg.all_reduce(buf, ReduceOp::Sum).await.unwrap().unwrap());
    }
    for m in &c.members {
        m.pg.wait_for_pending_works().await;
        assert_eq!(m.pg.pending_works(), 0);
    }
    for w in &works {
        assert_eq!(w.state(), WorkState::Retired);
        w.wait(None).await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_allreduce_coalesced_is_one_work() {
    let c = cluster(2, test_config());
    let lists: Vec<Vec<Buffer>> = (0..2)
        .map(|r| {
            vec![
                Buffer::from_slice(0, &[r as f32 + 1.0; 2]),
                Buffer::from_slice(0, &[10.0f32 * (r as f32 + 1.0)]),
            ]
        })
        .collect();
    let mut works = Vec::new();
    for (m, list) in c.members.iter().zip(&lists) {
        let w = m
            .pg
            .all_reduce_coalesced(list, ReduceOp::Sum)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(w.kind(), OpKind::AllReduceCoalesced);
        works.push(w);
    }
    for w in &works {
        completed(w).await;
    }
    for list in &lists {
        assert_eq!(f32s(&list[0]), vec![3.0, 3.0]);
        assert_eq!(f32s(&list[1]), vec![30.0]);
    }
}

#[tokio::test(start_paused = true)]
async fn test_broadcast_and_reduce() {
    let c = cluster(2, test_config());
    let bufs: Vec<Buffer> = (0..2)
        .map(|r| Buffer::from_slice(0, &[(r as f32 + 1.0) * 5.0; 3]))
        .collect();
    let mut works = Vec::new();
    for (m, buf) in c.members.iter().zip(&bufs) {
        works.push(m.pg.broadcast(buf, 1).await.unwrap().unwrap());
    }
    for w in &works {
        completed(w).await;
    }
    for buf in &bufs {
        assert_eq!(f32s(buf), vec![10.0; 3]);
    }

    let mut works = Vec::new();
    for (m, buf) in c.members.iter().zip(&bufs) {
        works.push(m.pg.reduce(buf, 0, ReduceOp::Sum).await.unwrap().unwrap());
    }
    for w in &works {
        completed(w).await;
    }
    assert_eq!(f32s(&bufs[0]), vec![20.0; 3]);
    assert_eq!(f32s(&bufs[1]), vec![10.0; 3]);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_root_is_rejected() {
    let c = cluster(2, test_config());
    let buf = Buffer::from_slice(0, &[1.0f32]);
    assert!(c.pg(0).broadcast(&buf, 2).await.is_err());
    assert_eq!(c.pg(0).sequence_number(), 0);
}
