use vigil::{Buffer, DataType, OpKind, ReduceOp};

use super::helpers::{cluster, completed, f32s, test_config};

#[tokio::test(start_paused = true)]
async fn test_reduce_scatter_even() {
    let c = cluster(2, test_config());
    // Rank r contributes [r+1, r+1] for slot 0 and [10(r+1)] twice for slot 1.
    let inputs: Vec<Vec<Buffer>> = (0..2)
        .map(|r| {
            let v = r as f32 + 1.0;
            vec![
                Buffer::from_slice(0, &[v, v]),
                Buffer::from_slice(0, &[10.0 * v, 10.0 * v]),
            ]
        })
        .collect();
    let outputs: Vec<Buffer> = (0..2)
        .map(|_| Buffer::zeros(0, DataType::F32, &[2]))
        .collect();

    let mut works = Vec::new();
    for ((m, ins), output) in c.members.iter().zip(&inputs).zip(&outputs) {
        let w = m
            .pg
            .reduce_scatter(output, ins, ReduceOp::Sum)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(w.kind(), OpKind::ReduceScatter);
        works.push(w);
    }
    for w in &works {
        completed(w).await;
    }
    assert_eq!(f32s(&outputs[0]), vec![3.0, 3.0]);
    assert_eq!(f32s(&outputs[1]), vec![30.0, 30.0]);
}

#[tokio::test(start_paused = true)]
async fn test_reduce_scatter_uneven_reduces_per_root() {
    let c = cluster(2, test_config());
    let inputs: Vec<Vec<Buffer>> = (0..2)
        .map(|r| {
            let v = r as f32 + 1.0;
            vec![
                Buffer::from_slice(0, &[v]),
                Buffer::from_slice(0, &[v, 2.0 * v, 3.0 * v]),
            ]
        })
        .collect();
    let outputs = [
        Buffer::zeros(0, DataType::F32, &[1]),
        Buffer::zeros(0, DataType::F32, &[3]),
    ];

    let mut works = Vec::new();
    for ((m, ins), output) in c.members.iter().zip(&inputs).zip(&outputs) {
        let w = m
            .pg
            .reduce_scatter(output, ins, ReduceOp::Sum)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(w.kind(), OpKind::ReduceScatter);
        works.push(w);
    }
    for w in &works {
        completed(w).await;
    }
    assert_eq!(f32s(&outputs[0]), vec![3.0]);
    assert_eq!(f32s(&outputs[1]), vec![3.0, 6.0, 9.0]);
}

#[tokio::test(start_paused = true)]
async fn test_reduce_scatter_tensor() {
    let c = cluster(2, test_config());
    let inputs: Vec<Buffer> = (0..2)
        .map(|r| Buffer::from_slice(0, &[1.0f32, 2.0, 3.0, 4.0].map(|x| x * (r as f32 + 1.0))))
        .collect();
    let outputs: Vec<Buffer> = (0..2)
        .map(|_| Buffer::zeros(0, DataType::F32, &[2]))
        .collect();
    let mut works = Vec::new();
    for ((m, input), output) in c.members.iter().zip(&inputs).zip(&outputs) {
        works.push(
            m.pg.reduce_scatter_tensor(output, input, ReduceOp::Sum)
                .await
                .unwrap()
                .unwrap(),
        );
    }
    for w in &works {
        completed(w).await;
    }
    assert_eq!(f32s(&outputs[0]), vec![3.0, 6.0]);
    assert_eq!(f32s(&outputs[1]), vec![9.0, 12.0]);
}
