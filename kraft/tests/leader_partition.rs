mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::RaftRouter;
use kraft::raft::EntryPayload;
use kraft::{ClientWriteError, State};
use maplit::btreeset;

/// Leader partition test.
///
/// What does this test do?
///
/// - create a stable 3-node cluster and write some data to it.
/// - isolate the leader, and send it a write which can never commit.
/// - assert that the write fails once the old leader notices it lost its quorum, and that the
///   remaining nodes elect a new leader which accepts writes.
/// - restore the old leader, and assert that its uncommitted entry is replaced by the new
///   leader's log and never reaches its state machine.
///
/// RUST_LOG=kraft,memstore,leader_partition=trace cargo test -p kraft --test leader_partition
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn leader_partition() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(fixtures::test_config());
    let router = Arc::new(RaftRouter::new(config.clone()));
    router.new_raft_node(0).await;
    router.new_raft_node(1).await;
    router.new_raft_node(2).await;

    let mut want = 0;

    router.initialize_from_single_node(0).await?;
    want += 1;
    router.wait_for_log(&btreeset! {0, 1, 2}, want, None, "init").await?;

    router.client_request_many(0, "0", 10).await;
    want += 10;
    router.wait_for_log(&btreeset! {0, 1, 2}, want, None, "first writes").await?;
    router.assert_stable_cluster(Some(1), Some(want)).await;

    tracing::info!("--- isolating leader node 0");
    router.isolate_node(0).await;

    let pending = {
        let router = router.clone();
        tokio::spawn(async move { router.send_client_request(0, fixtures::client_request("lost", 1)).await })
    };

    let timeout = Duration::from_secs(5);
    let res = tokio::time::timeout(timeout, pending).await??;
    assert!(
        matches!(res, Err(ClientWriteError::Unavailable)),
        "expected the partitioned leader to fail the write, got {:?}",
        res
    );
    router
        .wait(0, Some(timeout))
        .await?
        .metrics(|x| x.state != State::Leader, "old leader steps down")
        .await?;

    let leader = router.wait_for_leader(timeout, "new leader").await?;
    assert_ne!(leader, 0, "the isolated node must not be reported as leader");

    tracing::info!(leader, "--- writing through the new leader");
    router.client_request_many(leader, "1", 5).await;
    let leader_log = router.wait(leader, Some(timeout)).await?.metrics(|x| x.last_applied >= want + 6, "new writes").await?;
    let new_last = leader_log.last_log_index;

    tracing::info!("--- restoring node 0");
    router.restore_node(0).await;

    router
        .wait(0, Some(Duration::from_secs(10)))
        .await?
        .metrics(|x| x.last_applied >= new_last, "old leader catches up")
        .await?;

    let sto = router.get_storage_handle(0).await?;
    {
        let log = sto.get_log().await;
        let lost = log.values().any(|entry| match &entry.payload {
            EntryPayload::Normal(req) => req.client == "lost",
            _ => false,
        });
        assert!(!lost, "the uncommitted entry must have been replaced");
    }
    for id in 0..3 {
        let sto = router.get_storage_handle(id).await?;
        let sm = sto.get_state_machine().await;
        assert!(!sm.client_status.contains_key("lost"), "node {} applied an uncommitted entry", id);
        assert_eq!(sm.client_status.get("1").map(String::as_str), Some("request-4"));
    }

    // The cluster settles with a single leader and uniform logs.
    fixtures::sleep_ms(2000).await;
    let leader = router.wait_for_leader(timeout, "settled leader").await?;
    let leader_metrics = router.wait(leader, Some(timeout)).await?.metrics(|_| true, "leader").await?;
    router
        .wait_for_log(
            &btreeset! {0, 1, 2},
            leader_metrics.last_log_index,
            Some(timeout),
            "uniform logs",
        )
        .await?;
    router.assert_stable_cluster(None, None).await;

    Ok(())
}
