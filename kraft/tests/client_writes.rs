mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::RaftRouter;
use futures::prelude::*;
use kraft::raft::EntryPayload;
use kraft::ClientWriteError;
use maplit::btreeset;
use memstore::ClientResponse;

/// Client write tests.
///
/// What does this test do?
///
/// - create a stable 3-node cluster.
/// - write a lot of data to it from several clients concurrently.
/// - assert that the cluster stayed stable and has all of the expected data.
///
/// RUST_LOG=kraft,memstore,client_writes=trace cargo test -p kraft --test client_writes
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn client_writes() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(fixtures::test_config());
    let router = Arc::new(RaftRouter::new(config.clone()));
    router.new_raft_node(0).await;
    router.new_raft_node(1).await;
    router.new_raft_node(2).await;

    let mut want = 0;

    tracing::info!("--- initializing cluster");
    router.initialize_from_single_node(0).await?;
    want += 1;

    router.wait_for_log(&btreeset! {0, 1, 2}, want, None, "init").await?;
    router.assert_stable_cluster(Some(1), Some(want)).await;

    let leader = router.leader().await.expect("leader not found");
    assert_eq!(leader, 0, "expected leader to be node 0, got {}", leader);

    tracing::info!("--- writing from 3 clients");
    let mut clients = futures::stream::FuturesUnordered::new();
    clients.push(router.client_request_many(leader, "0", 100));
    clients.push(router.client_request_many(leader, "1", 100));
    clients.push(router.client_request_many(leader, "2", 100));
    while clients.next().await.is_some() {}
    want += 300;

    router.wait_for_log(&btreeset! {0, 1, 2}, want, Some(Duration::from_secs(5)), "sync logs").await?;
    router.assert_stable_cluster(Some(1), Some(want)).await;
    router.assert_storage_state(1, want, Some(0)).await;

    for id in 0..3 {
        let sto = router.get_storage_handle(id).await?;
        let sm = sto.get_state_machine().await;
        for client in ["0", "1", "2"] {
            assert_eq!(
                sm.client_status.get(client).map(String::as_str),
                Some("request-99"),
                "node {} has unexpected status for client {}",
                id,
                client
            );
        }

        // Every node holds the same entries, in the order the leader appended them.
        let log = sto.get_log().await;
        let normal = log.values().filter(|entry| matches!(entry.payload, EntryPayload::Normal(_))).count();
        assert_eq!(normal, 300, "node {} has {} normal entries", id, normal);
    }

    Ok(())
}

/// Replication never sends more than `max_replication_entries` entries per AppendEntries RPC.
///
/// What does this test do?
///
/// - create a stable 3-node cluster whose leader sends at most 3 entries per request.
/// - write from several clients concurrently, so that the followers fall behind the leader.
/// - assert that every node holds all of the data, and that no request exceeded the limit.
///
/// RUST_LOG=kraft,memstore,client_writes=trace cargo test -p kraft --test client_writes
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn client_writes_bounded_batches() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(fixtures::test_config_builder().max_replication_entries(Some(3)).validate()?);
    let router = Arc::new(RaftRouter::new(config.clone()));
    router.new_raft_node(0).await;
    router.new_raft_node(1).await;
    router.new_raft_node(2).await;

    let mut want = 0;

    router.initialize_from_single_node(0).await?;
    want += 1;
    router.wait_for_log(&btreeset! {0, 1, 2}, want, None, "init").await?;

    let mut clients = futures::stream::FuturesUnordered::new();
    clients.push(router.client_request_many(0, "0", 40));
    clients.push(router.client_request_many(0, "1", 40));
    clients.push(router.client_request_many(0, "2", 40));
    while clients.next().await.is_some() {}
    want += 120;

    router.wait_for_log(&btreeset! {0, 1, 2}, want, Some(Duration::from_secs(5)), "sync logs").await?;
    router.assert_stable_cluster(Some(1), Some(want)).await;

    let largest = router.largest_append_batch().await;
    assert!((1..=3).contains(&largest), "an AppendEntries request carried {} entries", largest);

    for id in 0..3 {
        let sto = router.get_storage_handle(id).await?;
        let sm = sto.get_state_machine().await;
        assert_eq!(sm.client_status.get("2").map(String::as_str), Some("request-39"), "node {}", id);
    }

    Ok(())
}

/// The state machine's response reaches the client, and retried serials are answered from the
/// dedup table.
///
/// RUST_LOG=kraft,memstore,client_writes=trace cargo test -p kraft --test client_writes
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_write_responses() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(fixtures::test_config());
    let router = Arc::new(RaftRouter::new(config.clone()));
    router.new_raft_node(0).await;
    router.new_raft_node(1).await;
    router.new_raft_node(2).await;

    router.initialize_from_single_node(0).await?;
    router.wait_for_log(&btreeset! {0, 1, 2}, 1, None, "init").await?;

    let first = router.send_client_request(0, fixtures::client_request("c", 0)).await?;
    assert_eq!(first.index, 2);
    assert_eq!(first.data, ClientResponse(None));

    let second = router.client_request(0, "c", 1).await;
    assert_eq!(second, ClientResponse::from(Some("request-0".to_string())));

    // A retry of an applied serial is appended again but answered from the dedup table.
    let retry = router.send_client_request(0, fixtures::client_request("c", 1)).await?;
    assert_eq!(retry.index, 4);
    assert_eq!(retry.data, second);

    router.wait_for_log(&btreeset! {0, 1, 2}, 4, None, "retried write").await?;
    let sto = router.get_storage_handle(1).await?;
    assert_eq!(sto.get_state_machine().await.client_status.get("c").map(String::as_str), Some("request-1"));

    Ok(())
}

/// Writes sent to a follower are handed back along with the leader's ID.
///
/// RUST_LOG=kraft,memstore,client_writes=trace cargo test -p kraft --test client_writes
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_writes_forwarded_by_followers() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(fixtures::test_config());
    let router = Arc::new(RaftRouter::new(config.clone()));
    router.new_raft_node(0).await;
    router.new_raft_node(1).await;
    router.new_raft_node(2).await;

    router.initialize_from_single_node(0).await?;
    router.wait_for_log(&btreeset! {0, 1, 2}, 1, None, "init").await?;

    for follower in [1, 2] {
        let res = router.send_client_request(follower, fixtures::client_request("fwd", 7)).await;
        match res {
            Err(ClientWriteError::ForwardToLeader(req, leader)) => {
                assert_eq!(leader, Some(0));
                assert_eq!(req.client, "fwd");
                assert_eq!(req.serial, 7);
            }
            other => panic!("expected ForwardToLeader from node {}, got {:?}", follower, other),
        }
    }

    // Nothing was appended by the refused writes.
    fixtures::sleep_ms(200).await;
    router.assert_stable_cluster(Some(1), Some(1)).await;

    Ok(())
}
