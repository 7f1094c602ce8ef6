//! # Single-Flight Station
//!
//! Collapses concurrent executions of the same logical operation into one.
//!
//! ```text
//! caller A ── register(k) → None ─────── executes ── free(k, v) ──┐
//! caller B ── register(k) → Instrument ── get(timeout) ───────────┼─→ v
//! caller C ── register(k) → Instrument ── get(timeout) ───────────┘─→ v
//! ```
//!
//! Registration is an atomic insert-if-absent on a sharded map, so exactly one
//! caller wins even under a storm of identical requests. Each registration
//! owns a one-shot broadcast latch (`tokio::sync::watch` holding `Option<V>`):
//! any number of waiters, one producer, never reused.
//!
//! `Instrument::get` returns `None` only on timeout (or if the executor
//! vanished without publishing); a published value is always `Some`, so a
//! legitimately "absent" result encoded in `V` stays distinguishable.

use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tracing::trace;

/// Errors returned by [`Station::free`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationError {
    /// The key has no live registration (never registered, or already freed).
    NotRegistered,
}

impl std::fmt::Display for StationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StationError::NotRegistered => write!(f, "key is not registered with the station"),
        }
    }
}

impl std::error::Error for StationError {}

pub struct Station<K, V> {
    flights: DashMap<K, watch::Sender<Option<V>>>,
}

impl<K, V> Default for Station<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            flights: DashMap::new(),
        }
    }
}

impl<K, V> Station<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `key`.
    ///
    /// Returns `None` when the caller is now the executor and must eventually
    /// call [`Station::free`]; otherwise returns an [`Instrument`] bound to the
    /// in-flight execution.
    pub fn register(&self, key: K) -> Option<Instrument<V>> {
        match self.flights.entry(key) {
            Entry::Occupied(entry) => Some(Instrument {
                rx: entry.get().subscribe(),
            }),
            Entry::Vacant(entry) => {
                let (tx, _rx) = watch::channel(None);
                entry.insert(tx);
                None
            }
        }
    }

    /// Publish `value` to every waiter of `key` and drop the registration.
    ///
    /// Returns the number of waiters that were attached at publish time.
    pub fn free(&self, key: &K, value: V) -> Result<usize, StationError> {
        let (_, tx) = self.flights.remove(key).ok_or(StationError::NotRegistered)?;
        let waiters = tx.receiver_count();
        tx.send_replace(Some(value));
        trace!(waiters, "single-flight registration freed");
        Ok(waiters)
    }

    /// Number of keys currently in flight.
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }

    pub fn is_registered(&self, key: &K) -> bool {
        self.flights.contains_key(key)
    }
}

/// Handle on someone else's in-flight execution.
pub struct Instrument<V> {
    rx: watch::Receiver<Option<V>>,
}

impl<V: Clone> Instrument<V> {
    /// Wait for the executor's result, at most `timeout`.
    pub async fn get(mut self, timeout: Duration) -> Option<V> {
        match tokio::time::timeout(timeout, self.rx.wait_for(Option::is_some)).await {
            Ok(Ok(value)) => (*value).clone(),
            // Executor dropped its sender without publishing.
            Ok(Err(_)) => None,
            Err(_) => None,
        }
    }
}

/// Executor-side registration that always frees its key.
///
/// Dropping the guard without calling [`FlightGuard::land`] (error, panic or
/// task cancellation) frees the key with the fallback value, so a key can
/// never stay stuck in flight.
pub struct FlightGuard<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    station: Arc<Station<K, V>>,
    key: Option<K>,
    fallback: V,
}

impl<K, V> FlightGuard<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Wrap a registration the caller has already won via [`Station::register`].
    pub fn new(station: Arc<Station<K, V>>, key: K, fallback: V) -> Self {
        Self {
            station,
            key: Some(key),
            fallback,
        }
    }

    /// Publish the real outcome.
    pub fn land(mut self, value: V) -> usize {
        match self.key.take() {
            Some(key) => self.station.free(&key, value).unwrap_or(0),
            None => 0,
        }
    }
}

impl<K, V> Drop for FlightGuard<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let _ = self.station.free(&key, self.fallback.clone());
        }
    }
}
