//! # Partition Guard
//!
//! A connected node can still sit in an island that never hears about the
//! rest of the ring. Rounds start every `guard_interval`, measured from the
//! start of the previous round. Each round:
//!
//! 1. does nothing while the node has no connections at all (bootstrap owns
//!    that case);
//! 2. otherwise picks a random peer from the reserve pot and runs
//!    `FirstAccess` against it, dropping stale entries on the way;
//! 3. with an empty pot, asks a random connected peer who it knows near a
//!    random address, refilling the pot for the next round.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::seq::SliceRandom;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::context::NodeContext;
use crate::driver::BlockingDriver;
use crate::identity::Identity;
use crate::messages::Outcome;
use crate::replication::{FirstAccess, FirstAccessDriver, PeerAccess, PeerAccessDriver};

/// What one guard round did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardStep {
    /// No connections; nothing to probe through.
    Lonely,
    Probed { peer: Identity, outcome: Outcome },
    /// The pot was empty; `added` peers were learned.
    Refilled { added: usize },
}

pub struct PartitionGuard {
    ctx: Arc<NodeContext>,
    first_access: BlockingDriver<FirstAccessDriver>,
    peer_access: BlockingDriver<PeerAccessDriver>,
    rounds: AtomicU64,
}

impl PartitionGuard {
    pub fn new(
        ctx: Arc<NodeContext>,
        first_access: BlockingDriver<FirstAccessDriver>,
        peer_access: BlockingDriver<PeerAccessDriver>,
    ) -> Self {
        Self {
            ctx,
            first_access,
            peer_access,
            rounds: AtomicU64::new(0),
        }
    }

    /// Rounds completed by [`PartitionGuard::run`].
    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::Relaxed)
    }

    pub async fn tick(&self) -> GuardStep {
        let ctx = &self.ctx;
        if ctx.membership.connection_count() == 0 {
            return GuardStep::Lonely;
        }

        let me = ctx.me().identity;
        while let Some(peer) = ctx.reserve.random() {
            if peer.identity == me
                || ctx.membership.is_connected(&peer.identity)
                || ctx.outlaws.is_blacklisted(&peer.endpoint)
            {
                ctx.reserve.remove(&peer.identity);
                continue;
            }
            let identity = peer.identity;
            let accessed = self
                .first_access
                .execute(FirstAccess { peer }, ctx.config.operation_timeout)
                .await;
            ctx.reserve.remove(&identity);
            debug!(peer = %identity.short(), outcome = ?accessed.outcome, "reserve peer probed");
            return GuardStep::Probed {
                peer: identity,
                outcome: accessed.outcome,
            };
        }

        let via = ctx.membership.peers().choose(&mut rand::thread_rng()).cloned();
        let Some(via) = via else {
            return GuardStep::Lonely;
        };
        let before = ctx.reserve.len();
        let op = PeerAccess {
            via,
            target: ctx.ring.random_address(),
        };
        self.peer_access.execute(op, ctx.config.operation_timeout).await;
        GuardStep::Refilled {
            added: ctx.reserve.len().saturating_sub(before),
        }
    }

    /// Run rounds until `shutdown` flips or its sender goes away.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.ctx.config.guard_interval;
        loop {
            let started = Instant::now();
            let step = tokio::select! {
                step = self.tick() => step,
                _ = shutdown.changed() => break,
            };
            self.rounds.fetch_add(1, Ordering::Relaxed);
            trace!(?step, "partition guard round");
            tokio::select! {
                _ = tokio::time::sleep_until(started + interval) => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!("partition guard stopped");
    }
}
