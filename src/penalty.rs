//! # Abuse Penalties
//!
//! Peers that send malformed or protocol-violating traffic are reported here
//! as *outlaws*. Reports are queued without blocking the reporter and drained
//! by a single consumer task:
//!
//! ```text
//! report(peer) ──► queue ──► consumer ──► limiter[peer] += 1
//!                                 │            │
//!                                 │            └─ >= threshold ──► remove peer + blacklist endpoint
//!                                 └─ claim decay worker for peer (if unclaimed)
//! ```
//!
//! ## Decay
//!
//! Each penalized peer gets at most one decay worker, guarded by a claim flag
//! taken with an atomic insert-if-absent. The worker decrements the count
//! every `decay_interval` until it reaches zero, releases the claim, then
//! re-checks: a report that arrived between the last decrement and the release
//! found the claim taken and spawned nothing, so the worker re-claims and keeps
//! going if the count is non-zero again.
//!
//! ## Blacklist
//!
//! A bounded map from endpoint to expiry. Entries expire on their own: any
//! lookup past the expiry removes them.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use lru::LruCache;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::identity::{Identity, PeerRecord};
use crate::protocols::Membership;

/// Offenses within the decay window that get a peer removed.
pub const DEFAULT_PENALTY_THRESHOLD: u32 = 5;

/// One offense is forgiven per interval.
pub const DEFAULT_DECAY_INTERVAL: Duration = Duration::from_secs(30);

/// Maximum blacklisted endpoints.
/// SECURITY: Bounds memory used by an attacker cycling endpoints.
pub const DEFAULT_BLACKLIST_CAPACITY: usize = 4096;

/// How long a removed peer's endpoint stays banned.
pub const DEFAULT_BLACKLIST_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Clone, Debug)]
pub struct PenaltyConfig {
    pub threshold: u32,
    pub decay_interval: Duration,
    pub blacklist_capacity: usize,
    pub blacklist_timeout: Duration,
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_PENALTY_THRESHOLD,
            decay_interval: DEFAULT_DECAY_INTERVAL,
            blacklist_capacity: DEFAULT_BLACKLIST_CAPACITY,
            blacklist_timeout: DEFAULT_BLACKLIST_TIMEOUT,
        }
    }
}

/// Self-expiring endpoint ban list.
pub struct Blacklist {
    timeout: Duration,
    entries: Mutex<LruCache<SocketAddr, Instant>>,
}

impl Blacklist {
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            timeout,
            entries: Mutex::new(LruCache::new(cap)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<SocketAddr, Instant>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, endpoint: SocketAddr) {
        let expiry = Instant::now() + self.timeout;
        self.lock().put(endpoint, expiry);
    }

    pub fn contains(&self, endpoint: &SocketAddr) -> bool {
        let now = Instant::now();
        let mut entries = self.lock();
        match entries.peek(endpoint) {
            Some(expiry) if *expiry > now => true,
            Some(_) => {
                entries.pop(endpoint);
                false
            }
            None => false,
        }
    }

    pub fn remove(&self, endpoint: &SocketAddr) -> bool {
        self.lock().pop(endpoint).is_some()
    }

    /// Number of live bans. Sweeps expired entries first.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let expired: Vec<SocketAddr> = entries
            .iter()
            .filter(|(_, expiry)| **expiry <= now)
            .map(|(endpoint, _)| *endpoint)
            .collect();
        for endpoint in expired {
            entries.pop(&endpoint);
        }
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-peer offense counter.
#[derive(Default)]
struct Limiter {
    counts: DashMap<Identity, u32>,
}

impl Limiter {
    fn increment(&self, peer: &Identity) -> u32 {
        let mut count = self.counts.entry(*peer).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    fn decrement(&self, peer: &Identity) -> u32 {
        let remaining = match self.counts.get_mut(peer) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => return 0,
        };
        if remaining == 0 {
            self.counts.remove_if(peer, |_, count| *count == 0);
        }
        remaining
    }

    fn count(&self, peer: &Identity) -> u32 {
        self.counts.get(peer).map(|c| *c).unwrap_or(0)
    }
}

#[derive(Debug)]
struct Offense {
    peer: PeerRecord,
    reason: &'static str,
}

struct State {
    config: PenaltyConfig,
    limiter: Limiter,
    claims: DashMap<Identity, ()>,
    blacklist: Blacklist,
    membership: Arc<dyn Membership>,
    shutdown: watch::Receiver<bool>,
}

impl State {
    fn claim(&self, peer: &Identity) -> bool {
        match self.claims.entry(*peer) {
            Entry::Vacant(entry) => {
                entry.insert(());
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    fn remove_invalid_peer(&self, peer: &PeerRecord) {
        self.membership.remove_peer(&peer.identity);
        self.blacklist.add(peer.endpoint);
        warn!(
            peer = %peer.identity.short(),
            endpoint = %peer.endpoint,
            "peer removed and blacklisted for repeated offenses"
        );
    }
}

/// Handle to the penalty system.
pub struct Outlaws {
    tx: mpsc::UnboundedSender<Offense>,
    state: Arc<State>,
}

impl Outlaws {
    /// Start the consumer task. It stops when `shutdown` turns true or its
    /// sender is dropped.
    pub fn spawn(
        config: PenaltyConfig,
        membership: Arc<dyn Membership>,
        shutdown: watch::Receiver<bool>,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(State {
            blacklist: Blacklist::new(config.blacklist_capacity, config.blacklist_timeout),
            config,
            limiter: Limiter::default(),
            claims: DashMap::new(),
            membership,
            shutdown,
        });
        let handle = tokio::spawn(consume(state.clone(), rx));
        (Arc::new(Self { tx, state }), handle)
    }

    /// Queue a report. Never blocks.
    pub fn report(&self, peer: PeerRecord, reason: &'static str) {
        debug!(peer = %peer.identity.short(), reason, "outlaw reported");
        if self.tx.send(Offense { peer, reason }).is_err() {
            trace!("penalty consumer stopped, report dropped");
        }
    }

    pub fn is_blacklisted(&self, endpoint: &SocketAddr) -> bool {
        self.state.blacklist.contains(endpoint)
    }

    pub fn blacklist(&self) -> &Blacklist {
        &self.state.blacklist
    }

    /// Current offense count for `peer`.
    pub fn offenses(&self, peer: &Identity) -> u32 {
        self.state.limiter.count(peer)
    }

    /// Number of live decay workers.
    pub fn decaying(&self) -> usize {
        self.state.claims.len()
    }
}

async fn consume(state: Arc<State>, mut rx: mpsc::UnboundedReceiver<Offense>) {
    let mut shutdown = state.shutdown.clone();
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            offense = rx.recv() => {
                let Some(offense) = offense else { break };
                punish(&state, offense);
            }
        }
    }
    debug!("penalty consumer stopped");
}

fn punish(state: &Arc<State>, offense: Offense) {
    let identity = offense.peer.identity;
    let count = state.limiter.increment(&identity);
    trace!(peer = %identity.short(), reason = offense.reason, count, "offense counted");

    if count >= state.config.threshold {
        state.remove_invalid_peer(&offense.peer);
    }
    if state.claim(&identity) {
        tokio::spawn(decay(state.clone(), identity));
    }
}

async fn decay(state: Arc<State>, peer: Identity) {
    let mut shutdown = state.shutdown.clone();
    loop {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(state.config.decay_interval) => {}
                _ = shutdown.changed() => return,
            }
            if state.limiter.decrement(&peer) == 0 {
                break;
            }
        }
        state.claims.remove(&peer);

        // A report may have landed after the last decrement.
        if state.limiter.count(&peer) > 0 && state.claim(&peer) {
            trace!(peer = %peer.short(), "decay worker re-armed");
            continue;
        }
        break;
    }
    trace!(peer = %peer.short(), "offenses fully decayed");
}
