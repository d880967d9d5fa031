//! Leader election across an in-memory cluster: a single leader per term,
//! re-election on failure, and no progress without a majority.


use std::time::Duration;

use quorum_consensus::RaftRole;
use test_harness::TestCluster;

#[tokio::test]
async fn test_initial_election() {
    let cluster = TestCluster::new(3);

    let leader = cluster
        .wait_for_leader(Duration::from_secs(3))
        .await
        .expect("a leader should be elected");

    // Give heartbeats time to reach everyone, then check they agree
    tokio::time::sleep(Duration::from_millis(100)).await;
    let statuses = cluster.statuses(&cluster.ids()).await;
    let leaders: Vec<_> = statuses.iter().filter(|s| s.is_leader).collect();
    assert_eq!(leaders.len(), 1, "exactly one leader expected: {statuses:?}");

    let term = leaders[0].term;
    for status in &statuses {
        assert_eq!(status.term, term);
        if !status.is_leader {
            assert_eq!(status.role, RaftRole::Follower);
            assert_eq!(status.leader_id, Some(leader));
        }
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_leader_stays_put_without_failures() {
    let cluster = TestCluster::new(3);
    let leader = cluster
        .wait_for_leader(Duration::from_secs(3))
        .await
        .expect("a leader should be elected");
    let term = cluster.status(leader).await.unwrap().term;

    // Several election timeouts pass; heartbeats must keep followers quiet
    tokio::time::sleep(Duration::from_millis(600)).await;

    let status = cluster.status(leader).await.unwrap();
    assert!(status.is_leader);
    assert_eq!(status.term, term);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_reelection_after_leader_isolated() {
    let cluster = TestCluster::new(3);
    let old = cluster
        .wait_for_leader(Duration::from_secs(3))
        .await
        .expect("a leader should be elected");
    let old_term = cluster.status(old).await.unwrap().term;

    let rest: Vec<_> = cluster.ids().into_iter().filter(|id| *id != old).collect();
    cluster.net.partition(&[old], &rest);

    let new = cluster
        .wait_for_leader_in(&rest, Duration::from_secs(3))
        .await
        .expect("the majority should elect a new leader");
    assert_ne!(new, old);
    assert!(cluster.status(new).await.unwrap().term > old_term);

    // The deposed leader learns the new term and steps down once it can talk again
    cluster.net.heal();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let status = cluster.status(old).await.unwrap();
    assert!(!status.is_leader);
    assert!(status.term > old_term);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_minority_cannot_elect_leader() {
    let cluster = TestCluster::new(5);
    let leader = cluster
        .wait_for_leader(Duration::from_secs(3))
        .await
        .expect("a leader should be elected");

    // Keep the current leader on the majority side
    let mut majority = vec![leader];
    let mut minority = Vec::new();
    for id in cluster.ids() {
        if id == leader {
            continue;
        }
        if majority.len() < 3 {
            majority.push(id);
        } else {
            minority.push(id);
        }
    }
    cluster.net.partition(&majority, &minority);

    tokio::time::sleep(Duration::from_millis(500)).await;

    for status in cluster.statuses(&minority).await {
        assert!(!status.is_leader, "minority node {} became leader", status.id);
    }
    assert_eq!(cluster.leader_in(&majority).await, Some(leader));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_split_votes_resolve_to_single_leader() {
    let cluster = TestCluster::new(5);

    // Repeatedly knock out the leader so several elections race each other
    for _ in 0..4 {
        let leader = cluster
            .wait_for_leader(Duration::from_secs(3))
            .await
            .expect("elections should keep converging");
        let rest: Vec<_> = cluster.ids().into_iter().filter(|id| *id != leader).collect();
        cluster.net.partition(&[leader], &rest);
        cluster
            .wait_for_leader_in(&rest, Duration::from_secs(3))
            .await
            .expect("the remaining four should elect a leader");
        cluster.net.heal();
    }

    cluster
        .wait_for_leader(Duration::from_secs(3))
        .await
        .expect("a leader should be elected after healing");
    cluster.assert_safe();
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_stopped_leader_is_replaced() {
    let mut cluster = TestCluster::new(3);
    let leader = cluster
        .wait_for_leader(Duration::from_secs(3))
        .await
        .expect("a leader should be elected");

    cluster.crash(leader).await;

    let rest: Vec<_> = cluster.ids().into_iter().filter(|id| *id != leader).collect();
    let next = cluster
        .wait_for_leader_in(&rest, Duration::from_secs(3))
        .await
        .expect("survivors should elect a leader");
    assert_ne!(next, leader);

    cluster.shutdown().await;
}
