//! # Chunk Model
//!
//! A chunk is the unit of replicated content. The replication core never
//! branches on the concrete kind: it only reads, patches and hashes chunks
//! through the methods on [`Chunk`].
//!
//! | Kind | Body | Patchable |
//! |------|------|-----------|
//! | `Constant` | immutable bytes | no |
//! | `Growing` | append-only list of entries | `Diff::Append` |
//!
//! ## Versions
//!
//! Every chunk carries a `date` (ms since epoch) that only moves forward.
//! [`StockEntry`] summarizes a held chunk as `(id, date, hash)`; when two
//! entries disagree, the later date wins and equal dates are ordered by hash so
//! that all replicas converge on the same copy.

use serde::{Deserialize, Serialize};

use crate::address::{Address, Ring};

/// Maximum encoded size of a chunk body (1 MiB).
/// SECURITY: Bounds memory taken by a single push or recovery reply.
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Domain separation prefix for chunk content hashes.
const CHUNK_HASH_DOMAIN: &[u8] = b"ringvault-chunk-v1:";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ChunkKind {
    Constant,
    Growing,
}

impl ChunkKind {
    fn tag(self) -> u8 {
        match self {
            ChunkKind::Constant => 0,
            ChunkKind::Growing => 1,
        }
    }
}

/// Type-tagged chunk key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkId {
    pub kind: ChunkKind,
    pub key: [u8; 32],
}

impl ChunkId {
    pub fn new(kind: ChunkKind, key: [u8; 32]) -> Self {
        Self { kind, key }
    }

    /// Content-addressed id for an immutable chunk.
    pub fn constant_for(content: &[u8]) -> Self {
        Self::new(ChunkKind::Constant, *blake3::hash(content).as_bytes())
    }

    pub fn growing(key: [u8; 32]) -> Self {
        Self::new(ChunkKind::Growing, key)
    }

    fn tagged_bytes(&self) -> [u8; 33] {
        let mut out = [0u8; 33];
        out[0] = self.kind.tag();
        out[1..].copy_from_slice(&self.key);
        out
    }

    pub fn address(&self, ring: &Ring) -> Address {
        ring.address_of_key(&self.tagged_bytes())
    }

    pub fn short(&self) -> String {
        hex::encode(&self.key[..8])
    }
}

impl std::fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChunkId({:?}, {})", self.kind, self.short())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkHash([u8; 32]);

impl ChunkHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for ChunkHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChunkHash({})", hex::encode(&self.0[..8]))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkBody {
    Constant(Vec<u8>),
    Growing(Vec<Vec<u8>>),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Diff {
    Append(Vec<u8>),
}

impl Diff {
    pub fn len(&self) -> usize {
        match self {
            Diff::Append(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reasons a patch could not be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchError {
    /// Constant chunks never change after creation.
    Immutable,
    /// Applying the diffs would exceed [`MAX_CHUNK_SIZE`].
    TooLarge,
    /// A diff base does not line up with the current version.
    VersionGap { have: u64, base: u64 },
}

impl std::fmt::Display for PatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatchError::Immutable => write!(f, "constant chunks cannot be patched"),
            PatchError::TooLarge => write!(f, "patched chunk exceeds {} bytes", MAX_CHUNK_SIZE),
            PatchError::VersionGap { have, base } => {
                write!(f, "diff base {} does not match local version {}", base, have)
            }
        }
    }
}

impl std::error::Error for PatchError {}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub date: u64,
    pub body: ChunkBody,
}

impl Chunk {
    pub fn constant(content: Vec<u8>, date: u64) -> Self {
        Self {
            id: ChunkId::constant_for(&content),
            date,
            body: ChunkBody::Constant(content),
        }
    }

    pub fn growing(key: [u8; 32], entries: Vec<Vec<u8>>, date: u64) -> Self {
        Self {
            id: ChunkId::growing(key),
            date,
            body: ChunkBody::Growing(entries),
        }
    }

    /// Content hash over kind, key and body. The date is deliberately left out
    /// so identical content always hashes identically.
    pub fn hash(&self) -> ChunkHash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(CHUNK_HASH_DOMAIN);
        hasher.update(&self.id.tagged_bytes());
        match &self.body {
            ChunkBody::Constant(bytes) => {
                hasher.update(&(bytes.len() as u64).to_be_bytes());
                hasher.update(bytes);
            }
            ChunkBody::Growing(entries) => {
                hasher.update(&(entries.len() as u64).to_be_bytes());
                for entry in entries {
                    hasher.update(&(entry.len() as u64).to_be_bytes());
                    hasher.update(entry);
                }
            }
        }
        ChunkHash(*hasher.finalize().as_bytes())
    }

    pub fn size(&self) -> usize {
        match &self.body {
            ChunkBody::Constant(bytes) => bytes.len(),
            ChunkBody::Growing(entries) => entries.iter().map(Vec::len).sum(),
        }
    }

    /// Version usable as a diff base: number of entries for growing chunks,
    /// zero for constant chunks.
    pub fn version(&self) -> u64 {
        match &self.body {
            ChunkBody::Constant(_) => 0,
            ChunkBody::Growing(entries) => entries.len() as u64,
        }
    }

    /// Structural sanity: a constant chunk's key must be the hash of its bytes,
    /// and the body kind must match the id kind.
    pub fn is_well_formed(&self) -> bool {
        if self.size() > MAX_CHUNK_SIZE {
            return false;
        }
        match (&self.body, self.id.kind) {
            (ChunkBody::Constant(bytes), ChunkKind::Constant) => {
                blake3::hash(bytes).as_bytes() == &self.id.key
            }
            (ChunkBody::Growing(_), ChunkKind::Growing) => true,
            _ => false,
        }
    }

    pub fn stock(&self) -> StockEntry {
        StockEntry {
            id: self.id,
            date: self.date,
            hash: self.hash(),
        }
    }

    /// Apply diffs in order, advancing the date to at least `date`.
    pub fn patch(&mut self, diffs: &[Diff], date: u64) -> Result<(), PatchError> {
        let added: usize = diffs.iter().map(Diff::len).sum();
        match &mut self.body {
            ChunkBody::Constant(_) => Err(PatchError::Immutable),
            ChunkBody::Growing(entries) => {
                let current: usize = entries.iter().map(Vec::len).sum();
                if current.saturating_add(added) > MAX_CHUNK_SIZE {
                    return Err(PatchError::TooLarge);
                }
                for diff in diffs {
                    match diff {
                        Diff::Append(bytes) => entries.push(bytes.clone()),
                    }
                }
                self.date = date.max(self.date.saturating_add(1));
                Ok(())
            }
        }
    }

    /// Apply diffs produced by [`Chunk::diff_since`] at `base`.
    pub fn apply_since(&mut self, base: u64, diffs: &[Diff], date: u64) -> Result<(), PatchError> {
        let have = self.version();
        if have != base {
            return Err(PatchError::VersionGap { have, base });
        }
        self.patch(diffs, date)
    }

    /// Diffs that bring a copy at `version` up to this chunk, or `None` when
    /// the copy cannot be expressed as a prefix (constant chunks, or a version
    /// beyond ours).
    pub fn diff_since(&self, version: u64) -> Option<Vec<Diff>> {
        match &self.body {
            ChunkBody::Constant(_) => None,
            ChunkBody::Growing(entries) => {
                let start = usize::try_from(version).ok()?;
                if start > entries.len() {
                    return None;
                }
                Some(entries[start..].iter().cloned().map(Diff::Append).collect())
            }
        }
    }
}

/// Compact advertisement of a held chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StockEntry {
    pub id: ChunkId,
    pub date: u64,
    pub hash: ChunkHash,
}

impl StockEntry {
    /// True if a holder of `self` should replace a copy described by `other`.
    pub fn supersedes(&self, other: &StockEntry) -> bool {
        self.date > other.date || (self.date == other.date && self.hash > other.hash)
    }
}
