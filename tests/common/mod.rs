//! Shared helpers for in-process cluster tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use ringvault::address::SequentialCalculator;
use ringvault::store::MemoryStore;
use ringvault::transport::MemoryNetwork;
use ringvault::{Address, Chunk, Identity, Node, NodeConfig, PeerRecord, Ring};

pub fn record(seed: u8) -> PeerRecord {
    PeerRecord::new(
        Identity::from_bytes([seed; 32]),
        format!("127.0.0.1:{}", 9000 + seed as u16).parse().unwrap(),
    )
}

pub struct Member {
    pub node: Arc<Node>,
    pub store: Arc<MemoryStore>,
}

/// Nodes on one in-memory network with hand-placed ring positions.
pub struct Cluster {
    pub network: Arc<MemoryNetwork>,
    pub calc: Arc<SequentialCalculator>,
    pub ring: Ring,
    pub members: Vec<Member>,
}

impl Cluster {
    /// Node `i` gets seed `i + 1` and ring position `positions[i]`.
    pub fn new(config: NodeConfig, positions: &[u64]) -> Self {
        let ring = Ring::new(config.ring_bits);
        let network = MemoryNetwork::new();
        let calc = Arc::new(SequentialCalculator::new(ring));
        let members = positions
            .iter()
            .enumerate()
            .map(|(i, position)| {
                let record = record(i as u8 + 1);
                calc.assign(record.identity, *position);
                let (node, store) = Node::attach(&network, config.clone(), record, calc.clone());
                Member {
                    node: Arc::new(node),
                    store,
                }
            })
            .collect();
        Self {
            network,
            calc,
            ring,
            members,
        }
    }

    pub fn node(&self, i: usize) -> &Arc<Node> {
        &self.members[i].node
    }

    pub fn store(&self, i: usize) -> &Arc<MemoryStore> {
        &self.members[i].store
    }

    /// `joiner` runs FirstAccess against `seed`.
    pub async fn join(&self, joiner: usize, seed: usize) {
        let accessed = self.node(joiner).bootstrap(self.node(seed).record()).await;
        assert_eq!(accessed.outcome, ringvault::Outcome::Success, "join {joiner} -> {seed}");
    }

    /// Every node joins every earlier node.
    pub async fn mesh(&self) {
        for joiner in 1..self.members.len() {
            for seed in 0..joiner {
                self.join(joiner, seed).await;
            }
        }
    }

    pub async fn shutdown(&self) {
        for member in &self.members {
            member.node.shutdown().await;
        }
    }
}

/// A growing chunk whose address lies as close as possible to `position`.
pub fn growing_near(ring: &Ring, position: u64, entries: Vec<Vec<u8>>, date: u64) -> Chunk {
    let target = Address::new(position);
    let key = (0u16..=u16::MAX)
        .map(|n| {
            let mut key = [0u8; 32];
            key[..2].copy_from_slice(&n.to_be_bytes());
            key[31] = 0xA5;
            key
        })
        .min_by_key(|key| ring.distance(ringvault::ChunkId::growing(*key).address(ring), target))
        .unwrap();
    Chunk::growing(key, entries, date)
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
