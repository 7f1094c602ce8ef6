//! # Logical Address Space
//!
//! Chunk ids and node identities are mapped onto a modular ring of `2^bits`
//! addresses. This module owns the ring arithmetic and the closeness metric
//! that ownership decisions are derived from:
//!
//! | Concept | Definition |
//! |---------|------------|
//! | clockwise distance | `(to - from) mod 2^bits` |
//! | ring distance | `min(cw(a, b), cw(b, a))` (symmetric) |
//! | closeness | ring distance, ties broken by lower address value |
//!
//! Ownership itself (`dominates`, `more_appropriate`) depends on live
//! membership and is evaluated in [`crate::membership`] on every request; the
//! helpers here are pure.
//!
//! ## Address Calculators
//!
//! - [`HashCalculator`]: blake3(identity) truncated to the ring width, memoized
//!   in a bounded LRU whose capacity is chosen by the owner of the calculator
//! - [`SequentialCalculator`]: explicit assignments for tests and simulations

use std::cmp::Ordering;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Mutex, RwLock};

use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::identity::Identity;

/// Largest supported ring width.
pub const MAX_RING_BITS: u8 = 64;

/// Default ring width for new networks.
pub const DEFAULT_RING_BITS: u8 = 64;

/// Domain separation prefix for identity → address hashing.
const IDENTITY_ADDRESS_DOMAIN: &[u8] = b"ringvault-node-address-v1:";

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(u64);

impl Address {
    #[inline]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address({:#018x})", self.0)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Ring geometry, fixed at network creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ring {
    bits: u8,
}

impl Ring {
    /// Create a ring of `2^bits` addresses. `bits` is clamped to `1..=64`.
    pub fn new(bits: u8) -> Self {
        Self { bits: bits.clamp(1, MAX_RING_BITS) }
    }

    #[inline]
    pub fn bits(&self) -> u8 {
        self.bits
    }

    #[inline]
    fn mask(&self) -> u64 {
        if self.bits >= 64 {
            u64::MAX
        } else {
            (1u64 << self.bits) - 1
        }
    }

    #[inline]
    pub fn wrap(&self, value: u64) -> Address {
        Address(value & self.mask())
    }

    /// Clockwise distance travelling from `from` to `to`.
    #[inline]
    pub fn clockwise(&self, from: Address, to: Address) -> u64 {
        to.0.wrapping_sub(from.0) & self.mask()
    }

    /// Symmetric ring distance.
    #[inline]
    pub fn distance(&self, a: Address, b: Address) -> u64 {
        self.clockwise(a, b).min(self.clockwise(b, a))
    }

    /// Order `a` and `b` by closeness to `target` (closest first).
    pub fn closeness(&self, target: Address, a: Address, b: Address) -> Ordering {
        self.distance(target, a)
            .cmp(&self.distance(target, b))
            .then(a.0.cmp(&b.0))
    }

    /// True if `a` is strictly closer to `target` than `b`.
    #[inline]
    pub fn is_closer(&self, target: Address, a: Address, b: Address) -> bool {
        self.closeness(target, a, b) == Ordering::Less
    }

    /// Address halfway along the clockwise arc from `from` to `to`.
    pub fn midpoint(&self, from: Address, to: Address) -> Address {
        let half = self.clockwise(from, to) / 2;
        self.wrap(from.0.wrapping_add(half))
    }

    /// Address of an arbitrary key (chunk ids, probe targets).
    pub fn address_of_key(&self, key: &[u8]) -> Address {
        let digest = blake3::hash(key);
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);
        self.wrap(u64::from_be_bytes(head))
    }

    /// Uniformly random address on this ring.
    pub fn random_address(&self) -> Address {
        self.wrap(rand::random::<u64>())
    }
}

impl Default for Ring {
    fn default() -> Self {
        Self::new(DEFAULT_RING_BITS)
    }
}

/// Clockwise half-open arc `[start, end)`; `start == end` covers the whole ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressRange {
    pub start: Address,
    pub end: Address,
}

impl AddressRange {
    pub fn new(start: Address, end: Address) -> Self {
        Self { start, end }
    }

    pub fn full(ring: &Ring) -> Self {
        let origin = ring.wrap(0);
        Self { start: origin, end: origin }
    }

    pub fn is_full(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, ring: &Ring, address: Address) -> bool {
        if self.is_full() {
            return true;
        }
        ring.clockwise(self.start, address) < ring.clockwise(self.start, self.end)
    }
}

/// Maps node identities onto the ring.
pub trait AddressCalculator: Send + Sync + 'static {
    fn ring(&self) -> Ring;

    fn calculate(&self, identity: &Identity) -> Address;
}

/// Deterministic hash-based calculator with a bounded memo.
///
/// Identities are stable for a session so memoized entries never go stale;
/// the bound only limits memory.
pub struct HashCalculator {
    ring: Ring,
    memo: Mutex<LruCache<Identity, Address>>,
}

impl HashCalculator {
    pub fn new(ring: Ring, memo_capacity: usize) -> Self {
        let cap = NonZeroUsize::new(memo_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            ring,
            memo: Mutex::new(LruCache::new(cap)),
        }
    }

    fn compute(&self, identity: &Identity) -> Address {
        let mut hasher = blake3::Hasher::new();
        hasher.update(IDENTITY_ADDRESS_DOMAIN);
        hasher.update(identity.as_bytes());
        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);
        self.ring.wrap(u64::from_be_bytes(head))
    }

    #[cfg(test)]
    fn memo_len(&self) -> usize {
        self.memo.lock().map(|m| m.len()).unwrap_or(0)
    }
}

impl AddressCalculator for HashCalculator {
    fn ring(&self) -> Ring {
        self.ring
    }

    fn calculate(&self, identity: &Identity) -> Address {
        if let Ok(mut memo) = self.memo.lock() {
            if let Some(address) = memo.get(identity) {
                return *address;
            }
            let address = self.compute(identity);
            memo.put(*identity, address);
            return address;
        }
        self.compute(identity)
    }
}

/// Calculator with explicitly assigned positions.
///
/// Unassigned identities fall back to their first 8 bytes (big-endian), so a
/// test can place nodes by choosing identity bytes alone.
pub struct SequentialCalculator {
    ring: Ring,
    assigned: RwLock<HashMap<Identity, Address>>,
}

impl SequentialCalculator {
    pub fn new(ring: Ring) -> Self {
        Self {
            ring,
            assigned: RwLock::new(HashMap::new()),
        }
    }

    pub fn assign(&self, identity: Identity, value: u64) {
        if let Ok(mut assigned) = self.assigned.write() {
            assigned.insert(identity, self.ring.wrap(value));
        }
    }
}

impl AddressCalculator for SequentialCalculator {
    fn ring(&self) -> Ring {
        self.ring
    }

    fn calculate(&self, identity: &Identity) -> Address {
        if let Ok(assigned) = self.assigned.read()
            && let Some(address) = assigned.get(identity)
        {
            return *address;
        }
        let mut head = [0u8; 8];
        head.copy_from_slice(&identity.as_bytes()[..8]);
        self.ring.wrap(u64::from_be_bytes(head))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_respects_ring_width() {
        let ring = Ring::new(8);
        assert_eq!(ring.wrap(0x1FF), Address::new(0xFF));
        assert_eq!(ring.wrap(256), Address::new(0));

        let full = Ring::new(64);
        assert_eq!(full.wrap(u64::MAX), Address::new(u64::MAX));
    }

    #[test]
    fn distance_wraps_around_the_ring() {
        let ring = Ring::new(8);
        let a = Address::new(250);
        let b = Address::new(5);
        assert_eq!(ring.clockwise(a, b), 11);
        assert_eq!(ring.clockwise(b, a), 245);
        assert_eq!(ring.distance(a, b), 11);
        assert_eq!(ring.distance(b, a), 11);
    }

    #[test]
    fn closeness_breaks_ties_by_address() {
        let ring = Ring::new(8);
        let target = Address::new(10);
        let below = Address::new(8);
        let above = Address::new(12);
        assert_eq!(ring.closeness(target, below, above), Ordering::Less);
        assert!(ring.is_closer(target, below, above));
        assert!(!ring.is_closer(target, above, below));
        assert!(!ring.is_closer(target, below, below));
    }

    #[test]
    fn range_contains_handles_wraparound() {
        let ring = Ring::new(8);
        let range = AddressRange::new(Address::new(250), Address::new(10));
        assert!(range.contains(&ring, Address::new(250)));
        assert!(range.contains(&ring, Address::new(0)));
        assert!(range.contains(&ring, Address::new(9)));
        assert!(!range.contains(&ring, Address::new(10)));
        assert!(!range.contains(&ring, Address::new(100)));
        assert!(AddressRange::full(&ring).contains(&ring, Address::new(100)));
    }

    #[test]
    fn midpoint_follows_clockwise_arc() {
        let ring = Ring::new(8);
        assert_eq!(ring.midpoint(Address::new(250), Address::new(10)), Address::new(2));
        assert_eq!(ring.midpoint(Address::new(10), Address::new(20)), Address::new(15));
    }

    #[test]
    fn hash_calculator_is_deterministic_and_bounded() {
        let calc = HashCalculator::new(Ring::new(32), 2);
        let a = Identity::from_bytes([1u8; 32]);
        let b = Identity::from_bytes([2u8; 32]);
        let c = Identity::from_bytes([3u8; 32]);

        let first = calc.calculate(&a);
        assert_eq!(calc.calculate(&a), first);
        assert!(first.value() < (1u64 << 32));

        calc.calculate(&b);
        calc.calculate(&c);
        assert_eq!(calc.memo_len(), 2);
        // Evicted entries recompute to the same value.
        assert_eq!(calc.calculate(&a), first);
    }

    #[test]
    fn sequential_calculator_prefers_assignments() {
        let calc = SequentialCalculator::new(Ring::new(16));
        let mut bytes = [0u8; 32];
        bytes[7] = 42;
        let id = Identity::from_bytes(bytes);
        assert_eq!(calc.calculate(&id), Address::new(42));

        calc.assign(id, 0x1_0007);
        assert_eq!(calc.calculate(&id), Address::new(7));
    }

    #[test]
    fn key_addresses_are_stable() {
        let ring = Ring::new(20);
        assert_eq!(ring.address_of_key(b"chunk"), ring.address_of_key(b"chunk"));
        assert!(ring.address_of_key(b"chunk").value() < (1 << 20));
    }
}
