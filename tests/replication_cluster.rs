//! Replication protocols exercised across in-process clusters.
//!
//! Every test places nodes at fixed ring positions on a 16-bit ring, so the
//! owner of each chunk is known in advance.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Cluster, eventually, growing_near, record};
use ringvault::address::SequentialCalculator;
use ringvault::guard::GuardStep;
use ringvault::log::CacheMark;
use ringvault::messages::ChunkAction;
use ringvault::protocols::ChunkStore;
use ringvault::replication::ChunkOp;
use ringvault::{Chunk, ChunkId, Diff, Node, NodeConfig, Outcome, StockEntry};

fn config(redundancy: usize) -> NodeConfig {
    NodeConfig {
        redundancy,
        ..NodeConfig::for_tests()
    }
}

#[tokio::test]
async fn chunk_operations_reach_the_owner() {
    let cluster = Cluster::new(config(1), &[1_000, 20_000, 40_000]);
    cluster.mesh().await;

    let chunk = growing_near(&cluster.ring, 20_100, vec![b"a".to_vec()], 10);
    let added = cluster.node(0).add(chunk.clone()).await;
    assert_eq!(added.outcome, Outcome::Success);
    assert_eq!(cluster.store(1).len(), 1, "owner stores the chunk");
    assert!(cluster.store(0).is_empty());
    assert!(cluster.store(2).is_empty());

    let fetched = cluster.node(2).get(chunk.id).await;
    assert_eq!(fetched.outcome, Outcome::Success);
    assert_eq!(fetched.chunk, Some(chunk.clone()));

    let patched = cluster
        .node(2)
        .patch_and_get(chunk.id, vec![Diff::Append(b"b".to_vec())], 11)
        .await;
    assert_eq!(patched.outcome, Outcome::Success);
    assert_eq!(patched.chunk.map(|c| c.version()), Some(2));

    let missing = cluster.node(0).get(ChunkId::growing([0xEE; 32])).await;
    assert_eq!(missing.outcome, Outcome::NotFound);

    cluster.shutdown().await;
}

#[tokio::test]
async fn misrouted_add_is_rejected_without_mutation() {
    // 0 knows only 2; 2 knows 1, which owns the chunk.
    let cluster = Cluster::new(config(1), &[1_000, 20_000, 25_000]);
    cluster.join(2, 1).await;
    cluster.join(0, 2).await;
    assert!(!cluster.node(0).membership().is_connected(&cluster.node(1).identity()));

    let chunk = growing_near(&cluster.ring, 21_000, vec![b"x".to_vec()], 1);
    let result = cluster.node(0).add(chunk).await;
    assert_eq!(result.outcome, Outcome::Rejected);
    for i in 0..3 {
        assert!(cluster.store(i).is_empty(), "node {i} must not store a rejected chunk");
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn concurrent_adds_write_once() {
    let cluster = Cluster::new(config(1), &[1_000, 30_000]);
    cluster.mesh().await;

    let chunk = Chunk::constant(b"shared payload".to_vec(), 5);
    let mut adds = Vec::new();
    for _ in 0..10 {
        let node = cluster.node(0).clone();
        let chunk = chunk.clone();
        adds.push(tokio::spawn(async move { node.add(chunk).await }));
    }
    for add in adds {
        assert_eq!(add.await.unwrap().outcome, Outcome::Success);
    }

    let writes: usize = (0..2).map(|i| cluster.store(i).writes()).sum();
    assert_eq!(writes, 1);
    assert_eq!(cluster.node(0).telemetry().in_flight, 0);

    cluster.shutdown().await;
}

#[tokio::test]
async fn backup_one_replicates_to_a_neighbor_once() {
    let cluster = Cluster::new(config(2), &[1_000, 1_200]);
    cluster.mesh().await;

    let chunk = growing_near(&cluster.ring, 1_100, vec![b"v1".to_vec()], 3);
    cluster.store(0).force_write(chunk.clone()).await.unwrap();

    assert_eq!(cluster.node(0).backup_one(chunk.id).await, Outcome::Success);
    assert_eq!(cluster.store(1).read(&chunk.id).await.unwrap(), Some(chunk.clone()));

    // Neighbor is current now; nothing is pushed again.
    let writes = cluster.store(1).writes();
    assert_eq!(cluster.node(0).backup_one(chunk.id).await, Outcome::Success);
    assert_eq!(cluster.store(1).writes(), writes);

    assert_eq!(
        cluster.node(0).backup_one(ChunkId::growing([0x11; 32])).await,
        Outcome::NotFound
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn recovery_with_mismatched_hash_fails_and_commits_nothing() {
    let cluster = Cluster::new(config(2), &[1_000, 1_200]);
    cluster.mesh().await;

    let held = growing_near(&cluster.ring, 1_100, vec![b"real".to_vec()], 9);
    cluster.store(1).force_write(held.clone()).await.unwrap();
    let impostor = Chunk::constant(b"something else".to_vec(), 9);

    let advertised = StockEntry {
        id: held.id,
        date: held.date,
        hash: impostor.hash(),
    };
    let outcome = cluster.node(0).recover(cluster.node(1).record(), advertised).await;
    assert_eq!(outcome, Outcome::Failure);
    assert!(cluster.store(0).is_empty());

    cluster.shutdown().await;
}

#[tokio::test]
async fn recovery_pulls_only_the_missing_suffix() {
    let cluster = Cluster::new(config(2), &[1_000, 1_200]);
    cluster.mesh().await;

    let old = growing_near(&cluster.ring, 1_100, vec![b"a".to_vec()], 4);
    let mut newer = old.clone();
    newer
        .patch(&[Diff::Append(b"b".to_vec()), Diff::Append(b"c".to_vec())], 8)
        .unwrap();
    cluster.store(0).force_write(old).await.unwrap();
    cluster.store(1).force_write(newer.clone()).await.unwrap();

    let outcome = cluster.node(0).recover(cluster.node(1).record(), newer.stock()).await;
    assert_eq!(outcome, Outcome::Success);
    assert_eq!(cluster.store(0).read(&newer.id).await.unwrap(), Some(newer.clone()));

    // A second pull finds the local copy current.
    assert_eq!(
        cluster.node(0).recover(cluster.node(1).record(), newer.stock()).await,
        Outcome::Success
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn check_demand_exchanges_missing_chunks_both_ways() {
    let cluster = Cluster::new(config(2), &[1_000, 1_200]);
    cluster.mesh().await;

    let mine = growing_near(&cluster.ring, 1_050, vec![b"mine".to_vec()], 2);
    let theirs = growing_near(&cluster.ring, 1_150, vec![b"theirs".to_vec()], 2);
    cluster.store(0).force_write(mine.clone()).await.unwrap();
    cluster.store(1).force_write(theirs.clone()).await.unwrap();

    let summary = cluster.node(0).check_demand(cluster.node(1).record()).await;
    assert_eq!(summary.outcome, Outcome::Success);
    assert_eq!((summary.pushed, summary.pulled), (1, 1));
    assert_eq!(cluster.store(0).len(), 2);
    assert_eq!(cluster.store(1).len(), 2);

    // Identical stock on both sides: nothing left to move.
    let again = cluster.node(0).check_demand(cluster.node(1).record()).await;
    assert_eq!((again.pushed, again.pulled), (0, 0));

    cluster.shutdown().await;
}

#[tokio::test]
async fn silent_holder_times_out_and_frees_everything() {
    let cluster = Cluster::new(config(1), &[1_000]);
    let silent = record(42);
    cluster.calc.assign(silent.identity, 30_000);
    // Attached but never read: requests vanish into its queue.
    let (_transport, _unread) = cluster.network.attach(silent.clone());
    cluster.node(0).membership().add_peer(silent);

    let chunk = growing_near(&cluster.ring, 30_000, vec![], 1);
    let result = cluster.node(0).get(chunk.id).await;
    assert_eq!(result.outcome, Outcome::GiveUp);

    let telemetry = cluster.node(0).telemetry();
    assert_eq!(telemetry.in_flight, 0);
    assert_eq!(telemetry.pending_sessions, 0);

    cluster.shutdown().await;
}

#[tokio::test]
async fn partitioned_holder_is_released_early() {
    let cluster = Cluster::new(config(1), &[1_000, 30_000]);
    cluster.mesh().await;
    let a = cluster.node(0).identity();
    let b = cluster.node(1).identity();
    cluster.network.partition(a, b);

    let chunk = growing_near(&cluster.ring, 30_000, vec![], 1);
    let started = tokio::time::Instant::now();
    let result = cluster.node(0).get(chunk.id).await;
    assert_eq!(result.outcome, Outcome::GiveUp);
    assert!(started.elapsed() < cluster.node(0).config().request_timeout);

    // The unreachable peer moves from membership to the reserve pot.
    let node = cluster.node(0).clone();
    assert!(eventually(|| !node.membership().is_connected(&b)).await);
    assert_eq!(node.reserve().len(), 1);

    cluster.shutdown().await;
}

#[tokio::test]
async fn cached_lookups_remember_hits_and_misses() {
    let cluster = Cluster::new(config(1), &[1_000, 30_000]);
    cluster.mesh().await;

    let chunk = growing_near(&cluster.ring, 30_000, vec![b"hot".to_vec()], 7);
    cluster.store(1).force_write(chunk.clone()).await.unwrap();

    let first = cluster.node(0).get_cached(chunk.id).await;
    assert_eq!(first.chunk, Some(chunk.clone()));
    assert_eq!(cluster.store(0).cached_len(), 1);

    let delivered = cluster.network.delivered();
    let second = cluster.node(0).get_cached(chunk.id).await;
    assert_eq!(second.chunk, Some(chunk));
    assert_eq!(cluster.network.delivered(), delivered, "hit served locally");

    let missing = growing_near(&cluster.ring, 31_000, vec![], 1).id;
    assert_eq!(cluster.node(0).get_cached(missing).await.outcome, Outcome::NotFound);
    assert!(cluster.node(0).cache_log().is_known_missing(&missing));
    let delivered = cluster.network.delivered();
    assert_eq!(cluster.node(0).get_cached(missing).await.outcome, Outcome::NotFound);
    assert_eq!(cluster.network.delivered(), delivered, "tombstone answered locally");

    cluster.shutdown().await;
}

#[tokio::test]
async fn guard_round_connects_a_reserve_peer() {
    let cluster = Cluster::new(config(1), &[1_000, 20_000, 40_000]);
    cluster.join(2, 1).await;
    cluster.join(0, 2).await;
    let target = cluster.node(1).identity();
    assert!(!cluster.node(0).membership().is_connected(&target));

    let step = cluster.node(0).guard_round().await;
    assert_eq!(
        step,
        GuardStep::Probed {
            peer: target,
            outcome: Outcome::Success
        }
    );
    assert!(cluster.node(0).membership().is_connected(&target));

    cluster.shutdown().await;
}

#[tokio::test]
async fn lonely_guard_does_nothing() {
    let cluster = Cluster::new(config(1), &[1_000]);
    assert_eq!(cluster.node(0).guard_round().await, GuardStep::Lonely);
    cluster.shutdown().await;
}

#[tokio::test]
async fn spoofed_address_claim_is_rejected() {
    let cluster = Cluster::new(config(1), &[1_000, 20_000]);
    // The newcomer believes in a position node 0 does not compute for it.
    let other = Arc::new(SequentialCalculator::new(cluster.ring));
    other.assign(record(9).identity, 5_000);
    let (liar, _store) = Node::attach(&cluster.network, config(1), record(9), other);
    cluster.calc.assign(record(9).identity, 50_000);

    let accessed = liar.bootstrap(cluster.node(0).record()).await;
    assert_eq!(accessed.outcome, Outcome::Rejected);
    assert!(!cluster.node(0).membership().is_connected(&record(9).identity));

    liar.shutdown().await;
    cluster.shutdown().await;
}

#[tokio::test]
async fn simple_recovery_commits_only_owned_chunks() {
    let cluster = Cluster::new(config(1), &[1_000, 30_000]);
    cluster.mesh().await;

    // Owned by node 1: node 0 must not take a copy.
    let theirs = growing_near(&cluster.ring, 30_000, vec![b"theirs".to_vec()], 3);
    cluster.store(1).force_write(theirs.clone()).await.unwrap();
    assert_eq!(cluster.node(0).simple_recover(theirs.id).await, Outcome::Rejected);
    assert!(cluster.store(0).is_empty());

    // Owned by node 0 but only held by node 1.
    let mine = growing_near(&cluster.ring, 1_000, vec![b"mine".to_vec()], 3);
    cluster.store(1).force_write(mine.clone()).await.unwrap();
    assert_eq!(cluster.node(0).simple_recover(mine.id).await, Outcome::Success);
    assert_eq!(cluster.store(0).read(&mine.id).await.unwrap(), Some(mine.clone()));

    // Nothing newer to take: the write does not happen.
    let writes = cluster.store(0).writes();
    assert_eq!(cluster.node(0).simple_recover(mine.id).await, Outcome::Failure);
    assert_eq!(cluster.store(0).writes(), writes);

    let absent = growing_near(&cluster.ring, 8_000, vec![], 1).id;
    assert_eq!(cluster.node(0).simple_recover(absent).await, Outcome::NotFound);

    cluster.shutdown().await;
}

/// Six owned chunks, two per stock page.
async fn seeded_pair(backup_interval: Duration, demand_interval: Duration) -> (Cluster, Vec<Chunk>) {
    let config = NodeConfig {
        redundancy: 2,
        max_demand_entries: 2,
        backup_interval,
        demand_interval,
        ..NodeConfig::for_tests()
    };
    let cluster = Cluster::new(config, &[1_000, 1_200]);
    cluster.mesh().await;
    let mut chunks = Vec::new();
    for i in 1..=6u64 {
        let chunk = growing_near(&cluster.ring, i * 5_000, vec![vec![i as u8]], 1);
        cluster.store(0).force_write(chunk.clone()).await.unwrap();
        chunks.push(chunk);
    }
    (cluster, chunks)
}

#[tokio::test]
async fn backup_sweep_pages_through_every_held_chunk() {
    let (cluster, chunks) =
        seeded_pair(Duration::from_millis(50), Duration::from_secs(3600)).await;
    assert!(eventually(|| cluster.store(1).len() == chunks.len()).await);
    for chunk in &chunks {
        assert_eq!(cluster.store(1).read(&chunk.id).await.unwrap(), Some(chunk.clone()));
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn demand_sweep_pages_through_every_held_chunk() {
    let (cluster, chunks) =
        seeded_pair(Duration::from_secs(3600), Duration::from_millis(50)).await;
    assert!(eventually(|| cluster.store(1).len() == chunks.len()).await);
    cluster.shutdown().await;
}

#[tokio::test]
async fn check_demand_from_a_non_owner_is_rejected() {
    let cluster = Cluster::new(config(1), &[1_000, 30_000]);
    cluster.mesh().await;

    // Node 0 holds a stray copy of something node 1 owns.
    let stray = growing_near(&cluster.ring, 30_000, vec![b"stray".to_vec()], 2);
    cluster.store(0).force_write(stray).await.unwrap();

    let summary = cluster.node(0).check_demand(cluster.node(1).record()).await;
    assert_eq!(summary.outcome, Outcome::Rejected);
    assert_eq!((summary.pushed, summary.pulled), (0, 0));
    assert!(cluster.store(1).is_empty());

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn guard_rounds_keep_their_period_despite_slow_peers() {
    let config = NodeConfig {
        redundancy: 1,
        guard_interval: Duration::from_secs(10),
        request_timeout: Duration::from_secs(3),
        operation_timeout: Duration::from_secs(5),
        ..NodeConfig::for_tests()
    };
    let cluster = Cluster::new(config, &[1_000, 30_000]);
    cluster.mesh().await;

    // Every round contacts a peer that never answers and costs a full timeout.
    let mut silent = Vec::new();
    for seed in 50..55u8 {
        let peer = record(seed);
        cluster.calc.assign(peer.identity, 10_000 + seed as u64);
        silent.push(cluster.network.attach(peer.clone()));
        cluster.node(0).reserve().add(peer);
    }

    tokio::time::sleep(Duration::from_secs(35)).await;
    // Rounds start at 0s, 10s, 20s and 30s.
    assert_eq!(cluster.node(0).telemetry().guard_rounds, 4);

    cluster.shutdown().await;
}

#[tokio::test]
async fn cached_update_refreshes_the_cache_mark() {
    let cluster = Cluster::new(config(1), &[1_000, 30_000]);
    cluster.mesh().await;

    let chunk = growing_near(&cluster.ring, 30_000, vec![b"warm".to_vec()], 4);
    cluster.store(1).force_write(chunk.clone()).await.unwrap();
    let node = cluster.node(0);
    assert_eq!(node.get_cached(chunk.id).await.chunk, Some(chunk.clone()));
    node.cache_log().remove(&chunk.id);

    let update = ChunkOp::cached(chunk.id, ChunkAction::Update { stock: Some(chunk.stock()) });
    let result = node.chunk(update).await;
    assert_eq!(result.outcome, Outcome::Success);
    assert_eq!(result.chunk, None);
    assert_eq!(node.cache_log().get(&chunk.id), Some(CacheMark::Found { date: chunk.date }));

    let delivered = cluster.network.delivered();
    assert_eq!(node.get_cached(chunk.id).await.chunk, Some(chunk));
    assert_eq!(cluster.network.delivered(), delivered);

    cluster.shutdown().await;
}
