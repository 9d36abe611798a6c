mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::RaftRouter;
use kraft::{InitializeError, State};
use maplit::btreeset;

/// Cluster initialization test.
///
/// What does this test do?
///
/// - brings 3 nodes online with only knowledge of themselves.
/// - asserts that they remain in non-voter state with no activity (they should be completely passive).
/// - initializes the cluster with membership config including all nodes.
/// - asserts that the cluster was able to come online, elect a leader and maintain a stable state.
/// - asserts that a second initialization is refused on every node.
///
/// RUST_LOG=kraft,memstore,initialization=trace cargo test -p kraft --test initialization
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn initialization() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(fixtures::test_config());
    let router = Arc::new(RaftRouter::new(config.clone()));
    router.new_raft_node(0).await;
    router.new_raft_node(1).await;
    router.new_raft_node(2).await;

    // Assert all nodes are in non-voter state & have no entries.
    fixtures::sleep_ms(1000).await;
    router.assert_pristine_cluster().await;

    tracing::info!("--- initializing cluster");
    router.initialize_from_single_node(0).await?;

    let timeout = Some(Duration::from_secs(5));
    router.wait_for_log(&btreeset! {0, 1, 2}, 1, timeout, "init").await?;
    router.wait_for_state(&btreeset! {0}, State::Leader, timeout, "init leader").await?;
    router.wait_for_state(&btreeset! {1, 2}, State::Follower, timeout, "init followers").await?;
    router.assert_stable_cluster(Some(1), Some(1)).await;
    router.assert_storage_state(1, 1, Some(0)).await;

    tracing::info!("--- initializing an initialized cluster");
    for id in 0..3 {
        let raft = router.get_raft_handle(id).await?;
        let res = raft.initialize(btreeset! {0, 1, 2}.into_iter().map(|id| (id, fixtures::endpoint(id))).collect()).await;
        assert!(
            matches!(res, Err(InitializeError::NotAllowed)),
            "expected node {} to refuse initialization, got {:?}",
            id,
            res
        );
    }
    router.assert_stable_cluster(Some(1), Some(1)).await;

    Ok(())
}

/// A single node cluster elects itself right away.
///
/// RUST_LOG=kraft,memstore,initialization=trace cargo test -p kraft --test initialization
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn initialization_single_node() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(fixtures::test_config());
    let router = Arc::new(RaftRouter::new(config.clone()));
    router.new_raft_node(0).await;

    router.initialize_from_single_node(0).await?;

    let timeout = Some(Duration::from_secs(2));
    router.wait_for_log(&btreeset! {0}, 1, timeout, "init").await?;
    router.wait_for_state(&btreeset! {0}, State::Leader, timeout, "single node leader").await?;
    router.assert_stable_cluster(Some(1), Some(1)).await;

    let metrics = router.wait(0, timeout).await?.members(btreeset! {0}, "members").await?;
    assert_eq!(metrics.commit_index, 1);
    assert_eq!(metrics.current_leader, Some(0));

    Ok(())
}

/// A node refuses a membership which does not include itself.
///
/// RUST_LOG=kraft,memstore,initialization=trace cargo test -p kraft --test initialization
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn initialization_without_self() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(fixtures::test_config());
    let router = Arc::new(RaftRouter::new(config.clone()));
    router.new_raft_node(0).await;
    router.new_raft_node(1).await;

    let raft = router.get_raft_handle(0).await?;
    let res = raft.initialize(btreeset! {1}.into_iter().map(|id| (id, fixtures::endpoint(id))).collect()).await;
    assert!(matches!(res, Err(InitializeError::NotAllowed)), "got {:?}", res);

    fixtures::sleep_ms(500).await;
    router.assert_pristine_cluster().await;

    Ok(())
}
