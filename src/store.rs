//! In-memory [`ChunkStore`].
//!
//! Primary copies and cached copies live in separate sharded maps; every
//! conditional write (`update`, `weak_write`, `patch`) is decided under the
//! shard lock of its key, so concurrent writers of the same chunk serialize.
//!
//! Tests can switch on I/O failure injection to exercise the `GiveUp` paths.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::trace;

use crate::address::{AddressRange, Ring};
use crate::chunk::{Chunk, ChunkId, Diff, StockEntry};
use crate::protocols::{ChunkStore, PatchResult, StoreError};

pub struct MemoryStore {
    ring: Ring,
    primary: DashMap<ChunkId, Chunk>,
    cache: DashMap<ChunkId, Chunk>,
    failing: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new(ring: Ring) -> Self {
        Self {
            ring,
            primary: DashMap::new(),
            cache: DashMap::new(),
            failing: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
        }
    }

    /// Make every subsequent operation fail with [`StoreError::Io`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of primary writes that changed stored content.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.primary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_empty()
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Io("injected failure".to_string()));
        }
        Ok(())
    }

    fn wrote(&self, chunk: &Chunk) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        trace!(chunk = %chunk.id.short(), date = chunk.date, "chunk written");
    }

    fn patch_in(map: &DashMap<ChunkId, Chunk>, id: &ChunkId, diffs: &[Diff], date: u64) -> PatchResult {
        let Some(mut stored) = map.get_mut(id) else {
            return PatchResult::NotFound;
        };
        let mut patched = stored.clone();
        match patched.patch(diffs, date) {
            Ok(()) => {
                *stored = patched.clone();
                PatchResult::Patched(patched)
            }
            Err(e) => PatchResult::Invalid(e),
        }
    }
}

#[async_trait]
impl ChunkStore for MemoryStore {
    async fn read(&self, id: &ChunkId) -> Result<Option<Chunk>, StoreError> {
        self.check()?;
        Ok(self.primary.get(id).map(|c| c.clone()))
    }

    async fn update(&self, chunk: Chunk) -> Result<bool, StoreError> {
        self.check()?;
        match self.primary.entry(chunk.id) {
            Entry::Occupied(mut entry) => {
                if !chunk.stock().supersedes(&entry.get().stock()) {
                    return Ok(false);
                }
                self.wrote(&chunk);
                entry.insert(chunk);
                Ok(true)
            }
            Entry::Vacant(entry) => {
                self.wrote(&chunk);
                entry.insert(chunk);
                Ok(true)
            }
        }
    }

    async fn patch(&self, id: &ChunkId, diffs: &[Diff], date: u64) -> Result<PatchResult, StoreError> {
        self.check()?;
        let result = Self::patch_in(&self.primary, id, diffs, date);
        if let PatchResult::Patched(chunk) = &result {
            self.wrote(chunk);
        }
        Ok(result)
    }

    async fn force_update(&self, chunk: Chunk) -> Result<bool, StoreError> {
        self.check()?;
        match self.primary.get_mut(&chunk.id) {
            Some(mut stored) => {
                self.wrote(&chunk);
                *stored = chunk;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn force_write(&self, chunk: Chunk) -> Result<(), StoreError> {
        self.check()?;
        self.wrote(&chunk);
        self.primary.insert(chunk.id, chunk);
        Ok(())
    }

    async fn weak_write(&self, chunk: Chunk) -> Result<bool, StoreError> {
        self.check()?;
        match self.primary.entry(chunk.id) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(entry) => {
                self.wrote(&chunk);
                entry.insert(chunk);
                Ok(true)
            }
        }
    }

    async fn read_cache(&self, id: &ChunkId) -> Result<Option<Chunk>, StoreError> {
        self.check()?;
        Ok(self.cache.get(id).map(|c| c.clone()))
    }

    async fn force_write_cache(&self, chunk: Chunk) -> Result<(), StoreError> {
        self.check()?;
        self.cache.insert(chunk.id, chunk);
        Ok(())
    }

    async fn add_not_found_cache(&self, id: &ChunkId) -> Result<(), StoreError> {
        self.check()?;
        self.cache.remove(id);
        Ok(())
    }

    async fn patch_cache(&self, id: &ChunkId, diffs: &[Diff], date: u64) -> Result<PatchResult, StoreError> {
        self.check()?;
        Ok(Self::patch_in(&self.cache, id, diffs, date))
    }

    async fn stock(
        &self,
        range: AddressRange,
        after: Option<ChunkId>,
        limit: usize,
    ) -> Result<Vec<StockEntry>, StoreError> {
        self.check()?;
        let mut entries: Vec<StockEntry> = self
            .primary
            .iter()
            .filter(|entry| after.is_none_or(|after| *entry.key() > after))
            .filter(|entry| range.contains(&self.ring, entry.key().address(&self.ring)))
            .map(|entry| entry.value().stock())
            .collect();
        entries.sort_by_key(|entry| entry.id);
        entries.truncate(limit);
        Ok(entries)
    }
}
