//! # Cache Consistency Logs
//!
//! Bounded, time-limited memory of recent facts about peers and chunks.
//!
//! A [`TimedLog`] is an LRU map whose entries carry the instant they were
//! recorded. It is bounded two ways:
//!
//! - **capacity**: inserting beyond `limit` evicts the oldest entry
//! - **duration**: entries older than `duration` are expired lazily, from the
//!   oldest end, on every mutating access; reading an expired key removes it
//!
//! Reads use `peek`, so the LRU order stays the insertion order and the oldest
//! entry is always at the front.
//!
//! Two instances are used by the node:
//!
//! | Log | Key → Value | Purpose |
//! |-----|-------------|---------|
//! | [`AddressLog`] | `Identity → Address` | positions peers announced, to spot spoofing |
//! | [`CacheLog`] | `ChunkId → CacheMark` | recent cache fills and `NotFound` tombstones |

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;

use crate::address::Address;
use crate::chunk::ChunkId;
use crate::identity::Identity;

/// Default entry bound for the address log.
pub const DEFAULT_ADDRESS_LOG_LIMIT: usize = 4096;

/// Default lifetime of an address log entry.
pub const DEFAULT_ADDRESS_LOG_DURATION: Duration = Duration::from_secs(10 * 60);

/// Default entry bound for the cache log.
pub const DEFAULT_CACHE_LOG_LIMIT: usize = 8192;

/// Default lifetime of a cache log entry.
pub const DEFAULT_CACHE_LOG_DURATION: Duration = Duration::from_secs(60);

struct Stamped<V> {
    value: V,
    at: Instant,
}

pub struct TimedLog<K: Hash + Eq, V> {
    limit: usize,
    duration: Duration,
    entries: Mutex<LruCache<K, Stamped<V>>>,
}

impl<K, V> TimedLog<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(limit: usize, duration: Duration) -> Self {
        let cap = NonZeroUsize::new(limit.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            limit: cap.get(),
            duration,
            entries: Mutex::new(LruCache::new(cap)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<K, Stamped<V>>> {
        // A poisoned log still holds valid entries.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn expire_front(&self, entries: &mut LruCache<K, Stamped<V>>, now: Instant) {
        while let Some((_, oldest)) = entries.peek_lru() {
            if now.saturating_duration_since(oldest.at) < self.duration {
                break;
            }
            entries.pop_lru();
        }
    }

    /// Record `value` for `key`, observed now.
    pub fn add(&self, key: K, value: V) {
        self.add_at(key, value, Instant::now());
    }

    pub fn add_at(&self, key: K, value: V, now: Instant) {
        self.add_observed_at(key, value, now, now);
    }

    /// Record a fact observed at `observed`. Instants in the future are
    /// clamped to `now`.
    pub fn add_observed_at(&self, key: K, value: V, observed: Instant, now: Instant) {
        let at = observed.min(now);
        let mut entries = self.lock();
        self.expire_front(&mut entries, now);
        if now.saturating_duration_since(at) >= self.duration {
            entries.pop(&key);
            return;
        }
        entries.put(key, Stamped { value, at });
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    /// Value for `key` if recorded less than `duration` before `now`.
    pub fn get_at(&self, key: &K, now: Instant) -> Option<V> {
        let mut entries = self.lock();
        self.expire_front(&mut entries, now);
        let expired = match entries.peek(key) {
            None => return None,
            Some(entry) => now.saturating_duration_since(entry.at) >= self.duration,
        };
        if expired {
            entries.pop(key);
            return None;
        }
        entries.peek(key).map(|entry| entry.value.clone())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn contains_at(&self, key: &K, now: Instant) -> bool {
        self.get_at(key, now).is_some()
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.lock().pop(key).map(|entry| entry.value)
    }

    /// Number of stored entries, expired ones not yet swept included.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Drop every expired entry.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut entries = self.lock();
        self.expire_front(&mut entries, now);
    }
}

/// Positions peers recently announced.
pub type AddressLog = TimedLog<Identity, Address>;

impl TimedLog<Identity, Address> {
    /// True if `peer` recently announced a position other than `address`.
    pub fn contains_and_not_equals(&self, peer: &Identity, address: Address) -> bool {
        matches!(self.get(peer), Some(logged) if logged != address)
    }
}

/// What the local cache recently learned about a chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheMark {
    /// Cached at this version date.
    Found { date: u64 },
    /// The network recently answered `NotFound`.
    NotFound,
}

pub type CacheLog = TimedLog<ChunkId, CacheMark>;

impl TimedLog<ChunkId, CacheMark> {
    /// True while a `NotFound` tombstone for `id` is fresh.
    pub fn is_known_missing(&self, id: &ChunkId) -> bool {
        matches!(self.get(id), Some(CacheMark::NotFound))
    }
}
