//! Ordering, catch-up and reconciliation over real WebSockets


use harness::{TestClient, execute, start_server, start_server_at};
use easel_protocol::{RejectReason, ServerMessage};
use serde_json::json;
use std::time::Duration;

fn create_image(pos: [f64; 2], hash: &str) -> serde_json::Value {
    json!({
        "type": "image",
        "pos": pos,
        "size": [200.0, 200.0],
        "properties": {"hash": hash}
    })
}

/// Two tabs of one user submit concurrently; the server picks one total
/// order, acks each originator, and mirrors the other op as a state_update.
#[tokio::test]
async fn concurrent_creates_get_one_total_order() {
    let (server, _dir) = start_server(256).await;
    let mut t1 = TestClient::connect(server.ws_addr).await.unwrap();
    let mut t2 = TestClient::connect(server.ws_addr).await.unwrap();
    t1.join(7, "u", "A").await.unwrap();
    t2.join(7, "u", "B").await.unwrap();

    t1.send(&execute("a", "node_create", create_image([100.0, 100.0], "H1"), 0))
        .await
        .unwrap();
    t2.send(&execute("b", "node_create", create_image([300.0, 100.0], "H2"), 0))
        .await
        .unwrap();

    let ack_a = t1
        .recv_until(|m| matches!(m, ServerMessage::OperationAck { .. }))
        .await
        .unwrap();
    let ack_b = t2
        .recv_until(|m| matches!(m, ServerMessage::OperationAck { .. }))
        .await
        .unwrap();

    let (ServerMessage::OperationAck { operation_id: id_a, seq: seq_a, .. },
         ServerMessage::OperationAck { operation_id: id_b, seq: seq_b, .. }) = (ack_a, ack_b)
    else {
        unreachable!()
    };
    assert_eq!(id_a, "a");
    assert_eq!(id_b, "b");
    // One total order: the two seqs are exactly {1, 2}.
    let mut seqs = [seq_a, seq_b];
    seqs.sort();
    assert_eq!(seqs, [1, 2]);

    // Each tab sees the other op as a delta with the peer's payload.
    let update_on_t1 = t1
        .recv_until(|m| matches!(m, ServerMessage::StateUpdate { .. }))
        .await
        .unwrap();
    let ServerMessage::StateUpdate {
        state_version,
        operation_id,
        changes,
        ..
    } = update_on_t1
    else {
        unreachable!()
    };
    assert_eq!(state_version, seq_b);
    assert_eq!(operation_id.as_deref(), Some("b"));
    assert_eq!(changes.added.len(), 1);
    assert_eq!(changes.added[0].pos, [300.0, 100.0]);

    let update_on_t2 = t2
        .recv_until(|m| matches!(m, ServerMessage::StateUpdate { .. }))
        .await
        .unwrap();
    let ServerMessage::StateUpdate { state_version, .. } = update_on_t2 else {
        unreachable!()
    };
    assert_eq!(state_version, seq_a);
}

/// A client whose gap fits the ring gets exactly the missing ops in order.
#[tokio::test]
async fn catch_up_within_ring() {
    let (server, _dir) = start_server(256).await;
    let mut writer = TestClient::connect(server.ws_addr).await.unwrap();
    writer.join(8, "alice", "A").await.unwrap();

    for i in 1..=6u64 {
        writer
            .send(&execute(
                &format!("op-{i}"),
                "node_create",
                create_image([i as f64, 0.0], "H"),
                i - 1,
            ))
            .await
            .unwrap();
        writer
            .recv_until(|m| matches!(m, ServerMessage::OperationAck { .. }))
            .await
            .unwrap();
    }

    let mut late = TestClient::connect(server.ws_addr).await.unwrap();
    let at_join = late.join(8, "bob", "B").await.unwrap();
    assert_eq!(at_join, 6);

    late.send(&easel_protocol::ClientMessage::SyncCheck {
        project_id: 8,
        last_seq: 2,
        state_hash: None,
    })
    .await
    .unwrap();

    let response = late
        .recv_until(|m| matches!(m, ServerMessage::SyncResponse { .. }))
        .await
        .unwrap();
    let ServerMessage::SyncResponse {
        needs_sync,
        missed_operations,
        latest_seq,
        server_state_hash,
    } = response
    else {
        unreachable!()
    };
    assert!(needs_sync);
    assert_eq!(latest_seq, 6);
    assert!(server_state_hash.is_some());
    let missed = missed_operations.expect("gap fits the ring");
    let seqs: Vec<u64> = missed.iter().map(|op| op.seq).collect();
    assert_eq!(seqs, vec![3, 4, 5, 6]);
}

/// An up-to-date client is told nothing is missing.
#[tokio::test]
async fn sync_check_when_current_is_a_noop() {
    let (server, _dir) = start_server(256).await;
    let mut client = TestClient::connect(server.ws_addr).await.unwrap();
    client.join(8, "alice", "A").await.unwrap();

    client
        .send(&easel_protocol::ClientMessage::SyncCheck {
            project_id: 8,
            last_seq: 0,
            state_hash: None,
        })
        .await
        .unwrap();
    let response = client
        .recv_until(|m| matches!(m, ServerMessage::SyncResponse { .. }))
        .await
        .unwrap();
    let ServerMessage::SyncResponse {
        needs_sync,
        latest_seq,
        ..
    } = response
    else {
        unreachable!()
    };
    assert!(!needs_sync);
    assert_eq!(latest_seq, 0);
}

/// A gap beyond the ring forces the full-resync path.
#[tokio::test]
async fn catch_up_beyond_ring_requires_full_sync() {
    let (server, _dir) = start_server(4).await;
    let mut writer = TestClient::connect(server.ws_addr).await.unwrap();
    writer.join(9, "alice", "A").await.unwrap();

    for i in 1..=10u64 {
        writer
            .send(&execute(
                &format!("op-{i}"),
                "node_create",
                create_image([i as f64, 0.0], "H"),
                i - 1,
            ))
            .await
            .unwrap();
        writer
            .recv_until(|m| matches!(m, ServerMessage::OperationAck { .. }))
            .await
            .unwrap();
    }

    let mut late = TestClient::connect(server.ws_addr).await.unwrap();
    late.join(9, "bob", "B").await.unwrap();

    late.send(&easel_protocol::ClientMessage::SyncCheck {
        project_id: 9,
        last_seq: 1,
        state_hash: None,
    })
    .await
    .unwrap();
    let response = late
        .recv_until(|m| matches!(m, ServerMessage::SyncResponse { .. }))
        .await
        .unwrap();
    let ServerMessage::SyncResponse {
        needs_sync,
        missed_operations,
        latest_seq,
        ..
    } = response
    else {
        unreachable!()
    };
    assert!(needs_sync);
    assert!(missed_operations.is_none(), "gap exceeds the ring");
    assert_eq!(latest_seq, 10);

    late.send(&easel_protocol::ClientMessage::RequestFullSync { project_id: 9 })
        .await
        .unwrap();
    let full = late
        .recv_until(|m| matches!(m, ServerMessage::FullStateSync { .. }))
        .await
        .unwrap();
    let ServerMessage::FullStateSync {
        state,
        state_version,
    } = full
    else {
        unreachable!()
    };
    assert_eq!(state_version, 10);
    assert_eq!(state["nodes"].as_object().unwrap().len(), 10);
}

/// Temp ids resolve to authoritative ids in the ack; peers only ever see the
/// authoritative id.
#[tokio::test]
async fn temp_id_reconciliation() {
    let (server, _dir) = start_server(256).await;
    let mut originator = TestClient::connect(server.ws_addr).await.unwrap();
    let mut peer = TestClient::connect(server.ws_addr).await.unwrap();
    originator.join(10, "alice", "A").await.unwrap();
    peer.join(10, "bob", "B").await.unwrap();

    originator
        .send(&execute(
            "create-1",
            "node_create",
            json!({
                "id": "t-17",
                "type": "image",
                "pos": [50.0, 50.0],
                "size": [100.0, 100.0]
            }),
            0,
        ))
        .await
        .unwrap();

    let ack = originator
        .recv_until(|m| matches!(m, ServerMessage::OperationAck { .. }))
        .await
        .unwrap();
    let ServerMessage::OperationAck {
        seq, assigned_ids, ..
    } = ack
    else {
        unreachable!()
    };
    assert_eq!(seq, 1);
    let server_id = *assigned_ids.get("t-17").expect("temp id mapping");

    let update = peer
        .recv_until(|m| matches!(m, ServerMessage::StateUpdate { .. }))
        .await
        .unwrap();
    let ServerMessage::StateUpdate { changes, .. } = update else {
        unreachable!()
    };
    assert_eq!(changes.added.len(), 1);
    assert_eq!(changes.added[0].id, server_id);
    assert_eq!(changes.added[0].pos, [50.0, 50.0]);
}

/// A dangling node reference is rejected with not_found and never broadcast.
#[tokio::test]
async fn dangling_reference_is_rejected_without_broadcast() {
    let (server, _dir) = start_server(256).await;
    let mut originator = TestClient::connect(server.ws_addr).await.unwrap();
    let mut peer = TestClient::connect(server.ws_addr).await.unwrap();
    originator.join(11, "alice", "A").await.unwrap();
    peer.join(11, "bob", "B").await.unwrap();

    originator
        .send(&execute(
            "move-x",
            "node_move",
            json!({"nodeId": 999, "position": [10.0, 10.0]}),
            0,
        ))
        .await
        .unwrap();

    let rejected = originator
        .recv_until(|m| matches!(m, ServerMessage::OperationRejected { .. }))
        .await
        .unwrap();
    let ServerMessage::OperationRejected {
        operation_id,
        reason,
        error,
    } = rejected
    else {
        unreachable!()
    };
    assert_eq!(operation_id, "move-x");
    assert_eq!(reason, RejectReason::NotFound);
    assert_eq!(error.as_deref(), Some("node 999"));

    peer.expect_silence(Duration::from_millis(300)).await.unwrap();
}

/// Resubmitting an operationId inside the dedup window replays the same ack
/// and produces no second operation.
#[tokio::test]
async fn duplicate_operation_id_is_idempotent() {
    let (server, _dir) = start_server(256).await;
    let mut client = TestClient::connect(server.ws_addr).await.unwrap();
    let mut peer = TestClient::connect(server.ws_addr).await.unwrap();
    client.join(12, "alice", "A").await.unwrap();
    peer.join(12, "bob", "B").await.unwrap();

    let message = execute("dup-1", "node_create", create_image([5.0, 5.0], "H"), 0);
    client.send(&message).await.unwrap();
    let first = client
        .recv_until(|m| matches!(m, ServerMessage::OperationAck { .. }))
        .await
        .unwrap();

    client.send(&message).await.unwrap();
    let second = client
        .recv_until(|m| matches!(m, ServerMessage::OperationAck { .. }))
        .await
        .unwrap();
    assert_eq!(first, second);

    // The peer saw exactly one create.
    peer.recv_until(|m| matches!(m, ServerMessage::StateUpdate { .. }))
        .await
        .unwrap();
    peer.expect_silence(Duration::from_millis(300)).await.unwrap();
}

/// Operations embedding data-URIs are refused outright.
#[tokio::test]
async fn inline_media_payload_is_rejected() {
    let (server, _dir) = start_server(256).await;
    let mut client = TestClient::connect(server.ws_addr).await.unwrap();
    client.join(13, "alice", "A").await.unwrap();

    client
        .send(&execute(
            "inline-1",
            "node_create",
            json!({
                "type": "image",
                "pos": [0.0, 0.0],
                "size": [10.0, 10.0],
                "properties": {"src": "data:image/png;base64,AAAA"}
            }),
            0,
        ))
        .await
        .unwrap();

    let rejected = client
        .recv_until(|m| matches!(m, ServerMessage::OperationRejected { .. }))
        .await
        .unwrap();
    let ServerMessage::OperationRejected { reason, .. } = rejected else {
        unreachable!()
    };
    assert_eq!(reason, RejectReason::PayloadContainsInlineMedia);
}

/// A transaction's children get contiguous seqs and one update per child.
#[tokio::test]
async fn transaction_children_are_sequenced_contiguously() {
    let (server, _dir) = start_server(256).await;
    let mut client = TestClient::connect(server.ws_addr).await.unwrap();
    let mut peer = TestClient::connect(server.ws_addr).await.unwrap();
    client.join(14, "alice", "A").await.unwrap();
    peer.join(14, "bob", "B").await.unwrap();

    client
        .send(&execute(
            "tx-1",
            "transaction",
            json!({
                "transactionId": "batch-9",
                "operations": [
                    {"type": "node_create", "params":
                        {"id": "t-1", "type": "text", "pos": [0.0, 0.0], "size": [10.0, 10.0]}},
                    {"type": "node_create", "params":
                        {"id": "t-2", "type": "text", "pos": [20.0, 0.0], "size": [10.0, 10.0]}}
                ]
            }),
            0,
        ))
        .await
        .unwrap();

    let ack = client
        .recv_until(|m| matches!(m, ServerMessage::OperationAck { .. }))
        .await
        .unwrap();
    let ServerMessage::OperationAck {
        seq, assigned_ids, ..
    } = ack
    else {
        unreachable!()
    };
    assert_eq!(seq, 2, "ack carries the last child seq");
    assert_eq!(assigned_ids.len(), 2);

    for expected_seq in [1u64, 2] {
        let update = peer
            .recv_until(|m| matches!(m, ServerMessage::StateUpdate { .. }))
            .await
            .unwrap();
        let ServerMessage::StateUpdate {
            state_version,
            transaction_id,
            ..
        } = update
        else {
            unreachable!()
        };
        assert_eq!(state_version, expected_seq);
        assert_eq!(transaction_id.as_deref(), Some("batch-9"));
    }
}

/// Snapshots plus log replay survive a full server restart.
#[tokio::test]
async fn restart_recovers_canvas_from_log() {
    let dir = tempfile::tempdir().unwrap();

    let server = start_server_at(dir.path(), 256).await;
    let ws_addr = server.ws_addr;
    {
        let mut client = TestClient::connect(ws_addr).await.unwrap();
        client.join(15, "alice", "A").await.unwrap();
        for i in 1..=3u64 {
            client
                .send(&execute(
                    &format!("op-{i}"),
                    "node_create",
                    create_image([i as f64 * 10.0, 0.0], "H"),
                    i - 1,
                ))
                .await
                .unwrap();
            client
                .recv_until(|m| matches!(m, ServerMessage::OperationAck { .. }))
                .await
                .unwrap();
        }
        client.close().await.unwrap();
        // Give the leave a moment to persist the final snapshot.
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    server.shutdown().await;

    let server = start_server_at(dir.path(), 256).await;
    let mut client = TestClient::connect(server.ws_addr).await.unwrap();
    let at_join = client.join(15, "alice", "A").await.unwrap();
    assert_eq!(at_join, 3);

    client
        .send(&easel_protocol::ClientMessage::RequestFullSync { project_id: 15 })
        .await
        .unwrap();
    let full = client
        .recv_until(|m| matches!(m, ServerMessage::FullStateSync { .. }))
        .await
        .unwrap();
    let ServerMessage::FullStateSync {
        state,
        state_version,
    } = full
    else {
        unreachable!()
    };
    assert_eq!(state_version, 3);
    assert_eq!(state["nodes"].as_object().unwrap().len(), 3);
    server.shutdown().await;
}
