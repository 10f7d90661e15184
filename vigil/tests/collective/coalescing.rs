use vigil::{Buffer, DataType, OpKind, ReduceOp};

use super::helpers::{cluster, completed, f32s, test_config};

#[tokio::test(start_paused = true)]
async fn test_session_tracks_everything_with_one_work() {
    let c = cluster(2, test_config());
    let bufs: Vec<Vec<Buffer>> = (0..2)
        .map(|r| {
            vec![
                Buffer::from_slice(0, &[r as f32 + 1.0]),
                Buffer::from_slice(0, &[r as f32 + 10.0; 2]),
            ]
        })
        .collect();

    let mut works = Vec::new();
    for (m, list) in c.members.iter().zip(&bufs) {
        m.pg.start_coalescing().unwrap();
        assert!(m.pg.is_coalescing());
        for b in list {
            assert!(m.pg.all_reduce(b, ReduceOp::Sum).await.unwrap().is_none());
        }
        assert_eq!(m.pg.pending_works(), 0);
        let w = m.pg.end_coalescing(None).unwrap().unwrap();
        assert_eq!(w.kind(), OpKind::Coalesced);
        assert_eq!(w.seq(), 1);
        works.push(w);
    }
    for w in &works {
        completed(w).await;
    }
    for list in &bufs {
        assert_eq!(f32s(&list[0]), vec![3.0]);
        assert_eq!(f32s(&list[1]), vec![21.0, 21.0]);
    }
    for m in &c.members {
        assert_eq!(m.pg.sequence_number(), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_empty_session_yields_no_work() {
    let c = cluster(2, test_config());
    let pg = c.pg(0);
    pg.start_coalescing().unwrap();
    assert!(pg.end_coalescing(None).unwrap().is_none());
    assert!(!pg.is_coalescing());
}

#[tokio::test(start_paused = true)]
async fn test_nested_sessions_are_rejected() {
    let c = cluster(2, test_config());
    let pg = c.pg(0);
    pg.start_coalescing().unwrap();
    assert!(pg.start_coalescing().is_err());
    assert!(pg.end_coalescing(None).unwrap().is_none());
    assert!(pg.end_coalescing(None).is_err());
}

#[tokio::test(start_paused = true)]
async fn test_batched_send_recv() {
    let c = cluster(2, test_config());
    let payload = Buffer::from_slice(0, &[5.0f32, 6.0]);
    let inbox = Buffer::zeros(0, DataType::F32, &[2]);

    c.pg(0).start_coalescing().unwrap();
    assert!(c.pg(0).send(&payload, 1).await.unwrap().is_none());
    let sent = c.pg(0).end_coalescing(None).unwrap().unwrap();

    c.pg(1).start_coalescing().unwrap();
    assert!(c.pg(1).recv(&inbox, 0).await.unwrap().is_none());
    let received = c.pg(1).end_coalescing(None).unwrap().unwrap();

    completed(&sent).await;
    completed(&received).await;
    assert_eq!(f32s(&inbox), vec![5.0, 6.0]);
    // Batched point-to-point rides on the device communicator.
    assert!(c.pg(0).communicators().get("0").is_some());
    assert!(c.pg(0).communicators().get("0:1").is_none());
}
