//! Collaborator traits for the replication core.
//!
//! The core never touches disks, sockets or routing tables directly. It
//! depends on three boundaries, each with a reference implementation in this
//! crate:
//!
//! | Boundary | Trait | Reference |
//! |----------|-------|-----------|
//! | Storage | [`ChunkStore`] | [`crate::store::MemoryStore`] |
//! | Transport | [`Transport`] | [`crate::transport::MemoryNetwork`], [`crate::transport::UdpTransport`] |
//! | Membership | [`Membership`] | [`crate::membership::RingMembership`] |
//!
//! Traits live here, apart from their implementations, so the handlers and
//! drivers depend only on the boundary.

use async_trait::async_trait;

use crate::address::{Address, AddressRange, Ring};
use crate::chunk::{Chunk, ChunkId, Diff, PatchError, StockEntry};
use crate::identity::{Identity, PeerRecord};
use crate::messages::{Channel, Envelope};

/// Local storage failure. Absence is never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    Io(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(reason) => write!(f, "storage I/O failure: {}", reason),
        }
    }
}

impl std::error::Error for StoreError {}

/// Result of applying diffs to a stored chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchResult {
    Patched(Chunk),
    NotFound,
    Invalid(PatchError),
}

/// Chunk storage used by the replication core.
#[async_trait]
pub trait ChunkStore: Send + Sync + 'static {
    async fn read(&self, id: &ChunkId) -> Result<Option<Chunk>, StoreError>;

    /// Store `chunk` only if it supersedes the local copy (or none exists).
    /// Returns whether it was written.
    async fn update(&self, chunk: Chunk) -> Result<bool, StoreError>;

    async fn patch(&self, id: &ChunkId, diffs: &[Diff], date: u64) -> Result<PatchResult, StoreError>;

    /// Replace an existing copy regardless of version. Returns false when absent.
    async fn force_update(&self, chunk: Chunk) -> Result<bool, StoreError>;

    async fn force_write(&self, chunk: Chunk) -> Result<(), StoreError>;

    /// Write only if absent. Returns whether it was written.
    async fn weak_write(&self, chunk: Chunk) -> Result<bool, StoreError>;

    async fn read_cache(&self, id: &ChunkId) -> Result<Option<Chunk>, StoreError>;

    async fn force_write_cache(&self, chunk: Chunk) -> Result<(), StoreError>;

    /// Drop any cached copy of a chunk the network reported missing.
    async fn add_not_found_cache(&self, id: &ChunkId) -> Result<(), StoreError>;

    async fn patch_cache(&self, id: &ChunkId, diffs: &[Diff], date: u64) -> Result<PatchResult, StoreError>;

    /// Up to `limit` stock entries for primary chunks whose address is in
    /// `range`, in id order, starting strictly after `after` when given.
    async fn stock(
        &self,
        range: AddressRange,
        after: Option<ChunkId>,
        limit: usize,
    ) -> Result<Vec<StockEntry>, StoreError>;
}

/// Fire-and-forget mail delivery.
///
/// Delivery failures are reported asynchronously as
/// [`crate::transport::NetEvent::Unsent`] on the sender's event queue.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send_mail(&self, to: &PeerRecord, channel: Channel, mail: Vec<Envelope>);
}

/// Live view of ring membership.
///
/// Ownership answers are computed from the current peer set on every call.
pub trait Membership: Send + Sync + 'static {
    fn ring(&self) -> Ring;

    fn self_record(&self) -> PeerRecord;

    fn self_address(&self) -> Address;

    fn address_of(&self, identity: &Identity) -> Address;

    /// Returns false if the peer was already connected or is the local node.
    fn add_peer(&self, peer: PeerRecord) -> bool;

    fn remove_peer(&self, identity: &Identity) -> Option<PeerRecord>;

    fn peer(&self, identity: &Identity) -> Option<PeerRecord>;

    fn is_connected(&self, identity: &Identity) -> bool;

    fn connection_count(&self) -> usize;

    fn peers(&self) -> Vec<PeerRecord>;

    /// Up to `n` live peers closest to `address`, closest first.
    fn important_peers(&self, address: Address, n: usize) -> Vec<PeerRecord>;

    /// Up to `n` ring neighbors of the local node that should hold replicas of
    /// what it owns.
    fn backup_neighbors(&self, n: usize) -> Vec<PeerRecord>;

    fn closest_peer(&self, address: Address) -> Option<PeerRecord>;

    /// The local node is currently authoritative for `address`.
    fn dominates(&self, address: Address) -> bool;

    /// Known nodes are a better fit for `address` than `identity`.
    fn more_appropriate(&self, address: Address, identity: &Identity) -> bool;

    /// Arc of the ring the local node holds replicas for.
    fn responsibility_range(&self) -> AddressRange;
}
