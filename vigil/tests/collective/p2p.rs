use vigil::{Buffer, DataType, OpKind};

use super::helpers::{cluster, completed, f32s, test_config};

#[tokio::test(start_paused = true)]
async fn test_send_recv_pair() {
    let c = cluster(3, test_config());
    let payload = Buffer::from_slice(0, &[4.0f32, 5.0, 6.0]);
    let inbox = Buffer::zeros(0, DataType::F32, &[3]);

    // The lower rank of the pair publishes the rendezvous id.
    let recv = c.pg(0).recv(&inbox, 2).await.unwrap().unwrap();
    let send = c.pg(2).send(&payload, 0).await.unwrap().unwrap();
    completed(&recv).await;
    completed(&send).await;

    assert_eq!(recv.kind(), OpKind::Recv);
    assert_eq!(send.kind(), OpKind::Send);
    assert_eq!(f32s(&inbox), vec![4.0, 5.0, 6.0]);
    // The pair communicator is cached under "low:high".
    assert!(c.pg(0).communicators().get("0:2").is_some());
    assert!(c.pg(2).communicators().get("0:2").is_some());
    assert!(c.pg(1).communicators().get("0:2").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_send_to_self() {
    let c = cluster(2, test_config());
    let payload = Buffer::from_slice(0, &[9.0f32]);
    let inbox = Buffer::zeros(0, DataType::F32, &[1]);
    let send = c.pg(1).send(&payload, 1).await.unwrap().unwrap();
    let recv = c.pg(1).recv(&inbox, 1).await.unwrap().unwrap();
    completed(&send).await;
    completed(&recv).await;
    assert_eq!(f32s(&inbox), vec![9.0]);
}

#[tokio::test(start_paused = true)]
async fn test_unmatched_recv_stays_pending() {
    let c = cluster(2, test_config());
    let inbox = Buffer::zeros(0, DataType::F32, &[1]);
    let recv = c.pg(0).recv(&inbox, 1).await.unwrap().unwrap();
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    assert!(!recv.is_completed());
    assert_eq!(c.pg(0).pending_works(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_peer_out_of_range() {
    let c = cluster(2, test_config());
    let buf = Buffer::zeros(0, DataType::F32, &[1]);
    assert!(c.pg(0).send(&buf, 5).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_gather_and_scatter() {
    let c = cluster(2, test_config());
    let inputs: Vec<Buffer> = (0..2)
        .map(|r| Buffer::from_slice(0, &[r as f32 + 1.0; 2]))
        .collect();
    let gathered = vec![
        Buffer::zeros(0, DataType::F32, &[2]),
        Buffer::zeros(0, DataType::F32, &[2]),
    ];
    let root = c.pg(0).gather(&gathered, &inputs[0], 0).await.unwrap().unwrap();
    let leaf = c.pg(1).gather(&[], &inputs[1], 0).await.unwrap().unwrap();
    completed(&root).await;
    completed(&leaf).await;
    assert_eq!(f32s(&gathered[0]), vec![1.0, 1.0]);
    assert_eq!(f32s(&gathered[1]), vec![2.0, 2.0]);

    let outputs: Vec<Buffer> = (0..2)
        .map(|_| Buffer::zeros(0, DataType::F32, &[2]))
        .collect();
    let pieces = vec![
        Buffer::from_slice(0, &[7.0f32; 2]),
        Buffer::from_slice(0, &[8.0f32; 2]),
    ];
    let root = c.pg(1).scatter(&outputs[1], &pieces, 1).await.unwrap().unwrap();
    let leaf = c.pg(0).scatter(&outputs[0], &[], 1).await.unwrap().unwrap();
    completed(&root).await;
    completed(&leaf).await;
    assert_eq!(f32s(&outputs[0]), vec![7.0, 7.0]);
    assert_eq!(f32s(&outputs[1]), vec![8.0, 8.0]);
}

#[tokio::test(start_paused = true)]
async fn test_all_to_all_base_even() {
    let c = cluster(2, test_config());
    let inputs = [
        Buffer::from_slice(0, &[1.0f32, 2.0]),
        Buffer::from_slice(0, &[3.0f32, 4.0]),
    ];
    let outputs: Vec<Buffer> = (0..2)
        .map(|_| Buffer::zeros(0, DataType::F32, &[2]))
        .collect();
    let mut works = Vec::new();
    for ((m, input), output) in c.members.iter().zip(&inputs).zip(&outputs) {
        works.push(
            m.pg.all_to_all_base(output, input, None, None)
                .await
                .unwrap()
                .unwrap(),
        );
    }
    for w in &works {
        completed(w).await;
    }
    assert_eq!(f32s(&outputs[0]), vec![1.0, 3.0]);
    assert_eq!(f32s(&outputs[1]), vec![2.0, 4.0]);
}
