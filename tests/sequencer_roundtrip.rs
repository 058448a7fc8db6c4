//! Control-channel integration: a real sequencer server fanning out to
//! real TCP subscribers.

use std::time::Duration;

use renderfarm::sequencer::{
    job_payload, ControlKind, ControlMessage, SequencedClient, SequencerServer,
};
use tokio::sync::mpsc;

async fn wait_for_subscribers(server: &SequencerServer, count: usize) {
    for _ in 0..100 {
        if server.connected_peers().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("subscribers never connected");
}

async fn recv_n(
    rx: &mut mpsc::UnboundedReceiver<ControlMessage>,
    n: usize,
) -> Vec<ControlMessage> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for control message")
            .expect("control stream closed");
        out.push(msg);
    }
    out
}

#[tokio::test]
async fn test_two_subscribers_observe_identical_order() {
    let (leader_tx, mut leader_rx) = mpsc::unbounded_channel();
    let server = SequencerServer::start(0, leader_tx).await.unwrap();
    let port = server.local_port();

    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    let _client_a = SequencedClient::start("127.0.0.1".parse().unwrap(), port, tx_a);
    let _client_b = SequencedClient::start("127.0.0.1".parse().unwrap(), port, tx_b);
    wait_for_subscribers(&server, 2).await;

    let kinds = [
        ControlKind::JobCreated,
        ControlKind::JobBroadcastBegin,
        ControlKind::JobSent,
        ControlKind::JobBroadcastDone,
        ControlKind::JobCommit,
    ];
    for kind in kinds {
        server.broadcast(kind, job_payload("job-1"));
    }

    let got_a = recv_n(&mut rx_a, kinds.len()).await;
    let got_b = recv_n(&mut rx_b, kinds.len()).await;
    let got_leader = recv_n(&mut leader_rx, kinds.len()).await;

    for (idx, messages) in [&got_a, &got_b, &got_leader].iter().enumerate() {
        let seqs: Vec<u64> = messages.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5], "subscriber {idx} saw a gap or reorder");
        let seen: Vec<ControlKind> = messages.iter().map(|m| m.kind).collect();
        assert_eq!(seen.as_slice(), kinds.as_slice());
    }
}

#[tokio::test]
async fn test_late_subscriber_misses_earlier_seqs_without_blocking() {
    let (leader_tx, _leader_rx) = mpsc::unbounded_channel();
    let server = SequencerServer::start(0, leader_tx).await.unwrap();
    let port = server.local_port();

    // Two messages go out before anyone connects.
    server.broadcast(ControlKind::JobCreated, job_payload("j"));
    server.broadcast(ControlKind::JobBroadcastBegin, job_payload("j"));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _client = SequencedClient::start("127.0.0.1".parse().unwrap(), port, tx);
    wait_for_subscribers(&server, 1).await;

    // The late subscriber buffers seq 3 (its next_expected is 1) and only
    // a fresh incarnation would replay from the start; the channel must
    // not deliver an out-of-order message.
    server.broadcast(ControlKind::JobSent, job_payload("j"));
    let nothing = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(nothing.is_err(), "seq 3 must not be dispatched before 1 and 2");
}

#[tokio::test]
async fn test_dead_subscriber_is_dropped_from_fanout() {
    let (leader_tx, _leader_rx) = mpsc::unbounded_channel();
    let server = SequencerServer::start(0, leader_tx).await.unwrap();
    let port = server.local_port();

    let (tx, rx) = mpsc::unbounded_channel();
    let client = SequencedClient::start("127.0.0.1".parse().unwrap(), port, tx);
    wait_for_subscribers(&server, 1).await;

    // Kill the client side and keep broadcasting until the server notices
    // the dead connection.
    client.stop();
    drop(rx);
    for _ in 0..50 {
        server.broadcast(ControlKind::JobSent, job_payload("j"));
        if server.connected_peers().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(
        server.connected_peers().is_empty(),
        "dead subscriber must eventually be dropped"
    );
}
