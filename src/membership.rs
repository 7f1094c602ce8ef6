//! # Ring Membership
//!
//! In-memory [`Membership`] view: the set of live peers and their ring
//! positions, with ownership answered from that set on every call.
//!
//! ## Ownership rule
//!
//! Closeness is the symmetric ring distance, ties broken by lower address. With
//! redundancy `r`:
//!
//! - `dominates(a)`: fewer than `r` live peers are strictly closer to `a` than
//!   the local node
//! - `more_appropriate(a, id)`: at least `r` known nodes (local node and live
//!   peers, `id` excluded) are strictly closer to `a` than `id`
//!
//! With `r = 1` this is the single-owner rule; larger `r` lets the `r` nearest
//! nodes all act as replica holders for an address.
//!
//! [`ReservePot`] keeps peers that were seen but are not connected, for the
//! partition guard to probe.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use lru::LruCache;
use rand::Rng;
use tracing::{debug, trace};

use crate::address::{Address, AddressCalculator, AddressRange, Ring};
use crate::identity::{Identity, PeerRecord};
use crate::protocols::Membership;

/// Default number of nodes that hold each address.
pub const DEFAULT_REDUNDANCY: usize = 3;

/// Default capacity of the reserve pot.
pub const DEFAULT_RESERVE_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
struct Member {
    record: PeerRecord,
    address: Address,
}

pub struct RingMembership {
    me: PeerRecord,
    my_address: Address,
    calculator: Arc<dyn AddressCalculator>,
    redundancy: usize,
    members: DashMap<Identity, Member>,
}

impl RingMembership {
    pub fn new(me: PeerRecord, calculator: Arc<dyn AddressCalculator>, redundancy: usize) -> Self {
        let my_address = calculator.calculate(&me.identity);
        Self {
            me,
            my_address,
            calculator,
            redundancy: redundancy.max(1),
            members: DashMap::new(),
        }
    }

    pub fn redundancy(&self) -> usize {
        self.redundancy
    }

    fn snapshot(&self) -> Vec<Member> {
        self.members.iter().map(|entry| entry.value().clone()).collect()
    }

    fn sorted_by_closeness(&self, target: Address) -> Vec<Member> {
        let ring = self.calculator.ring();
        let mut members = self.snapshot();
        members.sort_by(|a, b| ring.closeness(target, a.address, b.address));
        members
    }
}

impl Membership for RingMembership {
    fn ring(&self) -> Ring {
        self.calculator.ring()
    }

    fn self_record(&self) -> PeerRecord {
        self.me.clone()
    }

    fn self_address(&self) -> Address {
        self.my_address
    }

    fn address_of(&self, identity: &Identity) -> Address {
        if *identity == self.me.identity {
            return self.my_address;
        }
        if let Some(member) = self.members.get(identity) {
            return member.address;
        }
        self.calculator.calculate(identity)
    }

    fn add_peer(&self, peer: PeerRecord) -> bool {
        if peer.identity == self.me.identity {
            return false;
        }
        let address = self.calculator.calculate(&peer.identity);
        let identity = peer.identity;
        let fresh = self
            .members
            .insert(identity, Member { record: peer, address })
            .is_none();
        if fresh {
            debug!(peer = %identity.short(), %address, "peer joined");
        }
        fresh
    }

    fn remove_peer(&self, identity: &Identity) -> Option<PeerRecord> {
        let removed = self.members.remove(identity).map(|(_, m)| m.record);
        if removed.is_some() {
            debug!(peer = %identity.short(), "peer removed");
        }
        removed
    }

    fn peer(&self, identity: &Identity) -> Option<PeerRecord> {
        self.members.get(identity).map(|m| m.record.clone())
    }

    fn is_connected(&self, identity: &Identity) -> bool {
        self.members.contains_key(identity)
    }

    fn connection_count(&self) -> usize {
        self.members.len()
    }

    fn peers(&self) -> Vec<PeerRecord> {
        self.members.iter().map(|m| m.record.clone()).collect()
    }

    fn important_peers(&self, address: Address, n: usize) -> Vec<PeerRecord> {
        self.sorted_by_closeness(address)
            .into_iter()
            .take(n)
            .map(|m| m.record)
            .collect()
    }

    fn backup_neighbors(&self, n: usize) -> Vec<PeerRecord> {
        self.important_peers(self.my_address, n)
    }

    fn closest_peer(&self, address: Address) -> Option<PeerRecord> {
        let ring = self.ring();
        self.snapshot()
            .into_iter()
            .min_by(|a, b| ring.closeness(address, a.address, b.address))
            .map(|m| m.record)
    }

    fn dominates(&self, address: Address) -> bool {
        let ring = self.ring();
        let closer = self
            .members
            .iter()
            .filter(|m| ring.is_closer(address, m.address, self.my_address))
            .take(self.redundancy)
            .count();
        closer < self.redundancy
    }

    fn more_appropriate(&self, address: Address, identity: &Identity) -> bool {
        let ring = self.ring();
        let candidate = self.address_of(identity);
        let mut closer = 0usize;
        if *identity != self.me.identity && ring.is_closer(address, self.my_address, candidate) {
            closer += 1;
        }
        for member in self.members.iter() {
            if closer >= self.redundancy {
                break;
            }
            if member.key() != identity && ring.is_closer(address, member.address, candidate) {
                closer += 1;
            }
        }
        trace!(%address, peer = %identity.short(), closer, "appropriateness check");
        closer >= self.redundancy
    }

    fn responsibility_range(&self) -> AddressRange {
        let ring = self.ring();
        let r = self.redundancy;
        let members = self.snapshot();
        if members.len() < 2 * r {
            return AddressRange::full(&ring);
        }

        let mut clockwise: Vec<u64> = members
            .iter()
            .map(|m| ring.clockwise(self.my_address, m.address))
            .filter(|d| *d != 0)
            .collect();
        clockwise.sort_unstable();
        if clockwise.len() < 2 * r {
            return AddressRange::full(&ring);
        }

        // r-th successor clockwise, r-th predecessor counter-clockwise.
        let successor = ring.wrap(self.my_address.value().wrapping_add(clockwise[r - 1]));
        let predecessor = ring.wrap(
            self.my_address
                .value()
                .wrapping_add(clockwise[clockwise.len() - r]),
        );
        let start = ring.midpoint(predecessor, self.my_address);
        let end = ring.wrap(ring.midpoint(self.my_address, successor).value().wrapping_add(1));
        AddressRange::new(start, end)
    }
}

/// Bounded set of known but unconnected peers.
pub struct ReservePot {
    peers: Mutex<LruCache<Identity, PeerRecord>>,
}

impl ReservePot {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            peers: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn add(&self, peer: PeerRecord) {
        if let Ok(mut peers) = self.peers.lock() {
            peers.put(peer.identity, peer);
        }
    }

    pub fn remove(&self, identity: &Identity) -> Option<PeerRecord> {
        self.peers.lock().ok()?.pop(identity)
    }

    /// A uniformly random peer from the pot.
    pub fn random(&self) -> Option<PeerRecord> {
        let peers = self.peers.lock().ok()?;
        if peers.is_empty() {
            return None;
        }
        let pick = rand::thread_rng().gen_range(0..peers.len());
        peers.iter().nth(pick).map(|(_, peer)| peer.clone())
    }

    pub fn len(&self) -> usize {
        self.peers.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::SequentialCalculator;

    fn record(seed: u8) -> PeerRecord {
        PeerRecord::new(
            Identity::from_bytes([seed; 32]),
            format!("127.0.0.1:{}", 7000 + seed as u16).parse().unwrap(),
        )
    }

    /// Local node at 100 on a 16-bit ring with peers at the given positions.
    fn ring_with(redundancy: usize, positions: &[(u8, u64)]) -> RingMembership {
        let calc = Arc::new(SequentialCalculator::new(Ring::new(16)));
        calc.assign(record(1).identity, 100);
        for (seed, position) in positions {
            calc.assign(record(*seed).identity, *position);
        }
        let membership = RingMembership::new(record(1), calc, redundancy);
        for (seed, _) in positions {
            membership.add_peer(record(*seed));
        }
        membership
    }

    #[test]
    fn single_owner_rule() {
        let m = ring_with(1, &[(2, 200), (3, 300)]);
        assert!(m.dominates(Address::new(120)));
        assert!(!m.dominates(Address::new(190)));

        // Peer 3 asking about 120: the local node is closer.
        assert!(m.more_appropriate(Address::new(120), &record(3).identity));
        // Peer 2 asking about 190: nobody known is closer.
        assert!(!m.more_appropriate(Address::new(190), &record(2).identity));
    }

    #[test]
    fn redundancy_widens_authority() {
        let m = ring_with(2, &[(2, 200), (3, 300), (4, 400)]);
        // 180 is closest to 200, then 100: the local node is the second holder.
        assert!(m.dominates(Address::new(180)));
        assert!(!m.dominates(Address::new(320)));
        assert!(!m.more_appropriate(Address::new(180), &record(2).identity));
        assert!(m.more_appropriate(Address::new(180), &record(4).identity));
    }

    #[test]
    fn unknown_identity_uses_calculator() {
        let m = ring_with(1, &[(2, 200)]);
        let stranger = record(9).identity;
        // Unassigned identity falls back to its leading bytes, far from 100.
        assert!(m.more_appropriate(Address::new(100), &stranger));
    }

    #[test]
    fn add_and_remove_peers() {
        let m = ring_with(1, &[]);
        assert!(!m.add_peer(record(1)), "local node is never a peer");
        assert!(m.add_peer(record(2)));
        assert!(!m.add_peer(record(2)));
        assert_eq!(m.connection_count(), 1);
        assert_eq!(m.remove_peer(&record(2).identity), Some(record(2)));
        assert!(!m.is_connected(&record(2).identity));
    }

    #[test]
    fn closest_and_important_peers() {
        let m = ring_with(1, &[(2, 200), (3, 300), (4, 400)]);
        assert_eq!(m.closest_peer(Address::new(290)), Some(record(3)));
        let important = m.important_peers(Address::new(290), 2);
        assert_eq!(important, vec![record(3), record(2)]);
        assert_eq!(m.backup_neighbors(1), vec![record(2)]);
    }

    #[test]
    fn responsibility_range_tracks_neighbors() {
        let small = ring_with(1, &[(2, 200)]);
        assert!(small.responsibility_range().is_full());

        let m = ring_with(1, &[(2, 200), (3, 300), (4, 60_000), (5, 50_000)]);
        let range = m.responsibility_range();
        let ring = Ring::new(16);
        assert!(range.contains(&ring, Address::new(100)));
        assert!(range.contains(&ring, Address::new(150)));
        assert!(!range.contains(&ring, Address::new(151)));
        assert!(!range.contains(&ring, Address::new(250)));
    }

    #[test]
    fn reserve_pot_is_bounded() {
        let pot = ReservePot::new(2);
        assert!(pot.random().is_none());
        pot.add(record(1));
        pot.add(record(2));
        pot.add(record(3));
        assert_eq!(pot.len(), 2);
        assert!(pot.random().is_some());
        assert!(pot.remove(&record(1).identity).is_none());
        assert_eq!(pot.remove(&record(3).identity), Some(record(3)));
    }
}
