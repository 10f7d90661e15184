use vigil::{Buffer, DataType, OpKind};

use super::helpers::{cluster, completed, f32s, test_config};

#[tokio::test(start_paused = true)]
async fn test_allgather_even_copies_into_outputs() {
    let c = cluster(3, test_config());
    let inputs: Vec<Buffer> = (0..3)
        .map(|r| Buffer::from_slice(0, &[r as f32, r as f32 + 0.5]))
        .collect();
    let outputs: Vec<Vec<Buffer>> = (0..3)
        .map(|_| {
            (0..3)
                .map(|_| Buffer::zeros(0, DataType::F32, &[2]))
                .collect()
        })
        .collect();

    let mut works = Vec::new();
    for ((m, input), outs) in c.members.iter().zip(&inputs).zip(&outputs) {
        let w = m.pg.all_gather(outs, input).await.unwrap().unwrap();
        assert_eq!(w.kind(), OpKind::AllGather);
        works.push(w);
    }
    for w in &works {
        completed(w).await;
        assert!(w.is_success());
        assert_eq!(w.result().len(), 3);
    }
    for outs in &outputs {
        for (r, out) in outs.iter().enumerate() {
            assert_eq!(f32s(out), vec![r as f32, r as f32 + 0.5]);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_allgather_uneven_is_one_coalesced_work() {
    let c = cluster(2, test_config());
    let inputs = [
        Buffer::from_slice(0, &[1.0f32, 2.0]),
        Buffer::from_slice(0, &[3.0f32]),
    ];
    let outputs: Vec<Vec<Buffer>> = (0..2)
        .map(|_| {
            vec![
                Buffer::zeros(0, DataType::F32, &[2]),
                Buffer::zeros(0, DataType::F32, &[1]),
            ]
        })
        .collect();

    let mut works = Vec::new();
    for ((m, input), outs) in c.members.iter().zip(&inputs).zip(&outputs) {
        let w = m.pg.all_gather(outs, input).await.unwrap().unwrap();
        assert_eq!(w.kind(), OpKind::AllGather);
        assert_eq!(w.seq(), 1);
        assert!(!m.pg.is_coalescing());
        works.push(w);
    }
    for w in &works {
        completed(w).await;
    }
    for m in &c.members {
        m.pg.wait_for_pending_works().await;
        assert_eq!(m.pg.sequence_number(), 1);
    }
    for outs in &outputs {
        assert_eq!(f32s(&outs[0]), vec![1.0, 2.0]);
        assert_eq!(f32s(&outs[1]), vec![3.0]);
    }
}

#[tokio::test(start_paused = true)]
async fn test_allgather_into_tensor() {
    let c = cluster(2, test_config());
    let inputs: Vec<Buffer> = (0..2)
        .map(|r| Buffer::from_slice(0, &[r as f32 + 1.0; 2]))
        .collect();
    let outputs: Vec<Buffer> = (0..2)
        .map(|_| Buffer::zeros(0, DataType::F32, &[4]))
        .collect();
    let mut works = Vec::new();
    for ((m, input), output) in c.members.iter().zip(&inputs).zip(&outputs) {
        works.push(
            m.pg.all_gather_into_tensor(output, input)
                .await
                .unwrap()
                .unwrap(),
        );
    }
    for w in &works {
        completed(w).await;
    }
    for output in &outputs {
        assert_eq!(f32s(output), vec![1.0, 1.0, 2.0, 2.0]);
    }
}

#[tokio::test(start_paused = true)]
async fn test_allgather_into_tensor_checks_size() {
    let c = cluster(2, test_config());
    let input = Buffer::from_slice(0, &[1.0f32; 2]);
    let output = Buffer::zeros(0, DataType::F32, &[3]);
    assert!(c.pg(0).all_gather_into_tensor(&output, &input).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_allgather_rejects_mixed_dtypes() {
    let c = cluster(2, test_config());
    let input = Buffer::from_slice(0, &[1.0f32]);
    let outputs = vec![
        Buffer::zeros(0, DataType::F32, &[1]),
        Buffer::zeros(0, DataType::I32, &[1]),
    ];
    assert!(c.pg(0).all_gather(&outputs, &input).await.is_err());
}
