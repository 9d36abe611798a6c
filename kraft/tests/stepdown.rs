mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::RaftRouter;
use kraft::{ChangeConfigError, State};
use maplit::btreeset;

/// Leader stepdown test.
///
/// What does this test do?
///
/// - create a stable 3-node cluster.
/// - remove the leader from the group through the leader itself.
/// - assert that the old leader steps down once the change commits, and that the two remaining
///   nodes elect a new leader and keep accepting writes without it.
///
/// RUST_LOG=kraft,memstore,stepdown=trace cargo test -p kraft --test stepdown
#[tokio::test(flavor = "multi_thread", worker_threads = 5)]
async fn stepdown() -> Result<()> {
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

    let orig_leader = router.leader().await.expect("expected the cluster to have a leader");
    assert_eq!(0, orig_leader, "expected original leader to be node 0");

    router.client_request_many(orig_leader, "0", 2).await;
    want += 2;
    router.wait_for_log(&btreeset! {0, 1, 2}, want, None, "writes").await?;

    tracing::info!("--- removing node 0 from the group");
    router.remove_voter(orig_leader, orig_leader).await?;
    want += 1;

    let timeout = Some(Duration::from_secs(5));
    router.wait_for_state(&btreeset! {0}, State::NonVoter, timeout, "old leader steps down").await?;
    let metrics = router.wait(0, timeout).await?.log(want, "old leader applied its removal").await?;
    assert_eq!(metrics.current_leader, None);

    let new_leader = router.wait_for_leader(Duration::from_secs(5), "new leader").await?;
    assert_ne!(orig_leader, new_leader, "expected a new leader");
    router.wait_for_members(&btreeset! {1, 2}, btreeset! {1, 2}, timeout, "remaining members").await?;
    want += 1;
    router.wait_for_log(&btreeset! {1, 2}, want, timeout, "new leader's blank entry").await?;

    tracing::info!("--- writing through the new leader");
    router.client_request_many(new_leader, "1", 3).await;
    want += 3;
    router.wait_for_log(&btreeset! {1, 2}, want, timeout, "writes after stepdown").await?;

    // The removed node no longer receives entries.
    fixtures::sleep_ms(300).await;
    let metrics = router.wait(0, None).await?.metrics(|_| true, "old leader").await?;
    assert_eq!(metrics.state, State::NonVoter);
    assert!(metrics.last_log_index < want);

    Ok(())
}

/// Removing a follower shrinks the group, and the follower stops receiving entries.
///
/// RUST_LOG=kraft,memstore,stepdown=trace cargo test -p kraft --test stepdown
#[tokio::test(flavor = "multi_thread", worker_threads = 5)]
async fn remove_follower() -> Result<()> {
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

    router.remove_voter(0, 2).await?;
    want += 1;

    let timeout = Some(Duration::from_secs(5));
    router.wait_for_members(&btreeset! {0, 1, 2}, btreeset! {0, 1}, timeout, "shrunk group").await?;
    router.wait_for_state(&btreeset! {2}, State::NonVoter, timeout, "removed follower").await?;
    router.wait_for_log(&btreeset! {0, 1}, want, timeout, "removal committed").await?;

    let res = router.remove_voter(0, 2).await;
    assert!(matches!(res, Err(ChangeConfigError::Noop)), "got {:?}", res);

    router.client_request_many(0, "0", 3).await;
    want += 3;
    router.wait_for_log(&btreeset! {0, 1}, want, timeout, "writes to the shrunk group").await?;

    let metrics = router.wait(2, None).await?.metrics(|_| true, "removed follower").await?;
    assert!(metrics.last_log_index < want);
    assert_eq!(metrics.current_term, 1, "the removed node must not campaign");

    Ok(())
}

/// The last member of a group cannot be removed.
///
/// RUST_LOG=kraft,memstore,stepdown=trace cargo test -p kraft --test stepdown
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remove_last_member() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(fixtures::test_config());
    let router = Arc::new(RaftRouter::new(config.clone()));
    router.new_raft_node(0).await;

    router.initialize_from_single_node(0).await?;
    router.wait_for_log(&btreeset! {0}, 1, None, "init").await?;

    let res = router.remove_voter(0, 0).await;
    assert!(matches!(res, Err(ChangeConfigError::InoperableConfig)), "got {:?}", res);
    router.assert_stable_cluster(Some(1), Some(1)).await;

    Ok(())
}
