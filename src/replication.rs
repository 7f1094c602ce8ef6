//! # Replication Drivers
//!
//! The requesting side of every protocol, each written as a [`CoreDriver`]
//! and exposed through a [`DriverPair`]:
//!
//! | Driver | Op | Output | Used by |
//! |--------|----|--------|---------|
//! | [`FirstAccessDriver`] | [`FirstAccess`] | [`Accessed`] | bootstrap, partition guard |
//! | [`PeerAccessDriver`] | [`PeerAccess`] | [`Accessed`] | partition guard (fills the reserve pot) |
//! | [`CheckDemandDriver`] | [`CheckDemand`] | [`DemandSummary`] | demand sweep |
//! | [`BackupOneDriver`] | [`BackupOne`] | [`Outcome`] | backup sweep |
//! | [`BackupDriver`] | [`Backup`] | [`Outcome`] | explicit pushes |
//! | [`RecoveryDriver`] | [`Recovery`] | [`Outcome`] | demand offers |
//! | [`SimpleRecoveryDriver`] | [`SimpleRecovery`] | [`Outcome`] | public API |
//! | [`ChunkDriver`] | [`ChunkOp`] | [`ChunkResult`] | public chunk API |
//!
//! ## Reply handling
//!
//! A reply of the wrong shape is a protocol violation: the sender is reported
//! to the penalty system and the operation gives up. A missing reply (timeout,
//! unsent mail, null release) gives up without a report.
//!
//! ## Commit rule
//!
//! Data pulled from a peer is committed only if the local node still
//! dominates the chunk's address at commit time and the content hash equals
//! the advertised one. Commits use newer-only semantics, so a racing newer
//! copy wins and the pull reports `Failure`.

use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::address::{Address, AddressRange};
use crate::chunk::{Chunk, ChunkId, ChunkKind, Diff, StockEntry};
use crate::context::NodeContext;
use crate::driver::{CoreDriver, DriverPair};
use crate::handlers;
use crate::identity::PeerRecord;
use crate::log::CacheMark;
use crate::messages::{ChunkAction, Outcome, Reply, Request};
use crate::pool::WorkerPool;
use crate::protocols::PatchResult;

fn violation(ctx: &NodeContext, peer: &PeerRecord, op: &'static str, reply: &Reply) {
    warn!(peer = %peer.identity.short(), op, reply = reply.name(), "unexpected reply");
    ctx.report(peer, "unexpected reply type");
}

/// Queue peers we learned about for the partition guard.
fn merge_peers(ctx: &NodeContext, peers: &[PeerRecord]) {
    let me = ctx.me();
    for peer in peers {
        if peer.identity == me.identity
            || ctx.membership.is_connected(&peer.identity)
            || ctx.outlaws.is_blacklisted(&peer.endpoint)
        {
            continue;
        }
        ctx.reserve.add(peer.clone());
    }
}

/// Accept an access reply, enforcing the peer list bound.
fn accept_access(
    ctx: &NodeContext,
    from: &PeerRecord,
    owner: Option<PeerRecord>,
    mut peers: Vec<PeerRecord>,
) -> Accessed {
    if peers.len() > ctx.config.max_access_peers {
        ctx.report(from, "oversized peer list");
        peers.truncate(ctx.config.max_access_peers);
    }
    if let Some(owner) = &owner {
        merge_peers(ctx, std::slice::from_ref(owner));
    }
    merge_peers(ctx, &peers);
    Accessed {
        outcome: Outcome::Success,
        owner,
        peers,
    }
}

// ============================================================================
// Access
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Accessed {
    pub outcome: Outcome,
    /// `None` when the answering peer owns the address itself.
    pub owner: Option<PeerRecord>,
    pub peers: Vec<PeerRecord>,
}

impl Accessed {
    fn status(outcome: Outcome) -> Self {
        Self {
            outcome,
            owner: None,
            peers: Vec::new(),
        }
    }
}

/// Announce the local address to `peer` and join its membership.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FirstAccess {
    pub peer: PeerRecord,
}

pub struct FirstAccessDriver {
    ctx: Arc<NodeContext>,
}

#[async_trait]
impl CoreDriver for FirstAccessDriver {
    type Op = FirstAccess;
    type Output = Accessed;

    fn name(&self) -> &'static str {
        "first_access"
    }

    async fn execute(&self, op: FirstAccess, deadline: Instant) -> anyhow::Result<Accessed> {
        let ctx = &self.ctx;
        let address = ctx.membership.self_address();
        let reply = ctx
            .exchange(&op.peer, Request::AddressAccess { address }, deadline)
            .await;
        Ok(match reply {
            Some(Reply::Access { owner, peers }) => {
                let peer_address = ctx.calculator.calculate(&op.peer.identity);
                ctx.address_log.add(op.peer.identity, peer_address);
                ctx.reserve.remove(&op.peer.identity);
                ctx.membership.add_peer(op.peer.clone());
                accept_access(ctx, &op.peer, owner, peers)
            }
            Some(Reply::Status(outcome)) => Accessed::status(outcome),
            Some(other) => {
                violation(ctx, &op.peer, self.name(), &other);
                self.give_up()
            }
            None => self.give_up(),
        })
    }

    fn give_up(&self) -> Accessed {
        Accessed::status(Outcome::GiveUp)
    }

    fn is_obvious(&self, op: &FirstAccess) -> Option<Accessed> {
        if op.peer.identity == self.ctx.me().identity || self.ctx.outlaws.is_blacklisted(&op.peer.endpoint) {
            return Some(Accessed::status(Outcome::Rejected));
        }
        None
    }
}

/// Ask `via` who owns `target`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PeerAccess {
    pub via: PeerRecord,
    pub target: Address,
}

pub struct PeerAccessDriver {
    ctx: Arc<NodeContext>,
}

#[async_trait]
impl CoreDriver for PeerAccessDriver {
    type Op = PeerAccess;
    type Output = Accessed;

    fn name(&self) -> &'static str {
        "peer_access"
    }

    async fn execute(&self, op: PeerAccess, deadline: Instant) -> anyhow::Result<Accessed> {
        let ctx = &self.ctx;
        let reply = ctx
            .exchange(&op.via, Request::PeerAccess { target: op.target }, deadline)
            .await;
        Ok(match reply {
            Some(Reply::Access { owner, peers }) => accept_access(ctx, &op.via, owner, peers),
            Some(Reply::Status(outcome)) => Accessed::status(outcome),
            Some(other) => {
                violation(ctx, &op.via, self.name(), &other);
                self.give_up()
            }
            None => self.give_up(),
        })
    }

    fn give_up(&self) -> Accessed {
        Accessed::status(Outcome::GiveUp)
    }
}

// ============================================================================
// Demand and backup
// ============================================================================

/// Reconcile the stock of `range` with `peer`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CheckDemand {
    pub peer: PeerRecord,
    pub range: AddressRange,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DemandSummary {
    pub outcome: Outcome,
    /// Demanded chunks the peer accepted.
    pub pushed: usize,
    /// Offered chunks committed locally.
    pub pulled: usize,
}

impl DemandSummary {
    fn status(outcome: Outcome) -> Self {
        Self {
            outcome,
            pushed: 0,
            pulled: 0,
        }
    }
}

pub struct CheckDemandDriver {
    ctx: Arc<NodeContext>,
}

#[async_trait]
impl CoreDriver for CheckDemandDriver {
    type Op = CheckDemand;
    type Output = DemandSummary;

    fn name(&self) -> &'static str {
        "check_demand"
    }

    async fn execute(&self, op: CheckDemand, deadline: Instant) -> anyhow::Result<DemandSummary> {
        let ctx = &self.ctx;
        let limit = ctx.config.max_demand_entries;
        let candidates = ctx
            .stock_page(&ctx.demand_cursors, &op.peer.identity, op.range)
            .await?;
        let sent: HashSet<ChunkId> = candidates.iter().map(|c| c.id).collect();

        let request = Request::CheckDemand {
            range: op.range,
            candidates,
        };
        let (demands, offers) = match ctx.exchange(&op.peer, request, deadline).await {
            Some(Reply::Demands { demands, offers }) => (demands, offers),
            Some(Reply::Status(outcome)) => return Ok(DemandSummary::status(outcome)),
            Some(other) => {
                violation(ctx, &op.peer, self.name(), &other);
                return Ok(self.give_up());
            }
            None => return Ok(self.give_up()),
        };
        if demands.len() > limit || offers.len() > limit {
            ctx.report(&op.peer, "oversized demand reply");
            return Ok(self.give_up());
        }

        let mut summary = DemandSummary::status(Outcome::Success);
        for demand in demands.iter().filter(|d| sent.contains(&d.id)) {
            let Some(chunk) = ctx.store.read(&demand.id).await? else {
                continue;
            };
            if push_backup(ctx, &op.peer, chunk, deadline).await == Outcome::Success {
                summary.pushed += 1;
            }
        }
        for offer in offers {
            // Offers page independently of our candidates; skip what we already hold.
            if let Some(local) = ctx.store.read(&offer.id).await?
                && !offer.supersedes(&local.stock())
            {
                continue;
            }
            if recover_entry(ctx, &op.peer, offer, deadline).await? == Outcome::Success {
                summary.pulled += 1;
            }
        }
        debug!(
            peer = %op.peer.identity.short(),
            pushed = summary.pushed,
            pulled = summary.pulled,
            "demand check finished"
        );
        Ok(summary)
    }

    fn give_up(&self) -> DemandSummary {
        DemandSummary::status(Outcome::GiveUp)
    }
}

async fn push_backup(ctx: &NodeContext, to: &PeerRecord, chunk: Chunk, deadline: Instant) -> Outcome {
    match ctx.exchange(to, Request::Backup { chunk }, deadline).await {
        Some(Reply::Status(outcome)) => outcome,
        Some(other) => {
            violation(ctx, to, "backup", &other);
            Outcome::GiveUp
        }
        None => Outcome::GiveUp,
    }
}

/// Replicate one held chunk to a random backup neighbor, if it wants it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BackupOne {
    pub id: ChunkId,
}

pub struct BackupOneDriver {
    ctx: Arc<NodeContext>,
}

#[async_trait]
impl CoreDriver for BackupOneDriver {
    type Op = BackupOne;
    type Output = Outcome;

    fn name(&self) -> &'static str {
        "backup_one"
    }

    async fn execute(&self, op: BackupOne, deadline: Instant) -> anyhow::Result<Outcome> {
        let ctx = &self.ctx;
        let Some(chunk) = ctx.store.read(&op.id).await? else {
            return Ok(Outcome::NotFound);
        };
        let neighbors = ctx.membership.backup_neighbors(ctx.config.backup_neighbors);
        let Some(peer) = neighbors.choose(&mut rand::thread_rng()).cloned() else {
            return Ok(Outcome::Success);
        };

        let request = Request::CheckOneDemand { entry: chunk.stock() };
        match ctx.exchange(&peer, request, deadline).await {
            Some(Reply::Demand(false)) => {
                trace!(chunk = %op.id.short(), peer = %peer.identity.short(), "neighbor already current");
                Ok(Outcome::Success)
            }
            Some(Reply::Demand(true)) => Ok(push_backup(ctx, &peer, chunk, deadline).await),
            Some(Reply::Status(outcome)) => Ok(outcome),
            Some(other) => {
                violation(ctx, &peer, self.name(), &other);
                Ok(Outcome::GiveUp)
            }
            None => Ok(Outcome::GiveUp),
        }
    }

    fn give_up(&self) -> Outcome {
        Outcome::GiveUp
    }

    fn is_obvious(&self, op: &BackupOne) -> Option<Outcome> {
        if !self.ctx.config.backup_kinds.contains(&op.id.kind)
            || self.ctx.membership.connection_count() == 0
        {
            return Some(Outcome::Success);
        }
        None
    }
}

/// Push the local copy of `id` to `to` unconditionally.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Backup {
    pub to: PeerRecord,
    pub id: ChunkId,
}

pub struct BackupDriver {
    ctx: Arc<NodeContext>,
}

#[async_trait]
impl CoreDriver for BackupDriver {
    type Op = Backup;
    type Output = Outcome;

    fn name(&self) -> &'static str {
        "backup"
    }

    async fn execute(&self, op: Backup, deadline: Instant) -> anyhow::Result<Outcome> {
        let Some(chunk) = self.ctx.store.read(&op.id).await? else {
            return Ok(Outcome::NotFound);
        };
        Ok(push_backup(&self.ctx, &op.to, chunk, deadline).await)
    }

    fn give_up(&self) -> Outcome {
        Outcome::GiveUp
    }
}

// ============================================================================
// Recovery
// ============================================================================

/// Pull the copy `stock` describes from `from`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Recovery {
    pub from: PeerRecord,
    pub stock: StockEntry,
}

pub struct RecoveryDriver {
    ctx: Arc<NodeContext>,
}

#[async_trait]
impl CoreDriver for RecoveryDriver {
    type Op = Recovery;
    type Output = Outcome;

    fn name(&self) -> &'static str {
        "recovery"
    }

    async fn execute(&self, op: Recovery, deadline: Instant) -> anyhow::Result<Outcome> {
        recover_entry(&self.ctx, &op.from, op.stock, deadline).await
    }

    fn give_up(&self) -> Outcome {
        Outcome::GiveUp
    }

    fn is_obvious(&self, op: &Recovery) -> Option<Outcome> {
        let address = op.stock.id.address(&self.ctx.ring);
        (!self.ctx.membership.dominates(address)).then_some(Outcome::Rejected)
    }
}

async fn recover_entry(
    ctx: &NodeContext,
    from: &PeerRecord,
    stock: StockEntry,
    deadline: Instant,
) -> anyhow::Result<Outcome> {
    let id = stock.id;
    let address = id.address(&ctx.ring);
    if !ctx.membership.dominates(address) {
        return Ok(Outcome::Rejected);
    }

    let local = ctx.store.read(&id).await?;
    if let Some(local) = &local
        && !stock.supersedes(&local.stock())
    {
        trace!(chunk = %id.short(), "local copy already current");
        return Ok(Outcome::Success);
    }

    let since = local
        .as_ref()
        .filter(|c| c.id.kind == ChunkKind::Growing)
        .map(Chunk::version);
    let recovered = match ctx.exchange(from, Request::Recovery { id, since }, deadline).await {
        Some(Reply::Chunk(chunk)) => {
            if chunk.id != id || !chunk.is_well_formed() {
                ctx.report(from, "recovery returned a different chunk");
                return Ok(Outcome::GiveUp);
            }
            chunk
        }
        Some(Reply::Diff {
            id: diff_id,
            base,
            diffs,
            date,
            hash,
        }) => {
            let Some(base_copy) = local.filter(|_| diff_id == id && since == Some(base)) else {
                ctx.report(from, "recovery returned an unusable diff");
                return Ok(Outcome::GiveUp);
            };
            if hash != stock.hash {
                debug!(chunk = %id.short(), "holder moved past the advertised copy");
                return Ok(Outcome::Failure);
            }
            match rebuild(base_copy, base, &diffs, date) {
                Some(chunk) => chunk,
                None => return Ok(Outcome::Failure),
            }
        }
        Some(Reply::Status(outcome)) => return Ok(outcome),
        Some(other) => {
            violation(ctx, from, "recovery", &other);
            return Ok(Outcome::GiveUp);
        }
        None => return Ok(Outcome::GiveUp),
    };

    commit(ctx, recovered, stock).await
}

fn rebuild(mut chunk: Chunk, base: u64, diffs: &[Diff], date: u64) -> Option<Chunk> {
    match chunk.apply_since(base, diffs, date) {
        Ok(()) => Some(chunk),
        Err(e) => {
            debug!(chunk = %chunk.id.short(), error = %e, "diff does not apply");
            None
        }
    }
}

/// Newer-only commit of a pulled copy, re-checking ownership and hash.
async fn commit(ctx: &NodeContext, chunk: Chunk, stock: StockEntry) -> anyhow::Result<Outcome> {
    if chunk.hash() != stock.hash {
        debug!(chunk = %stock.id.short(), "pulled copy does not match advertised hash");
        return Ok(Outcome::Failure);
    }
    if !ctx.membership.dominates(stock.id.address(&ctx.ring)) {
        debug!(chunk = %stock.id.short(), "lost ownership before commit");
        return Ok(Outcome::Rejected);
    }
    ctx.store.update(chunk).await?;
    Ok(match ctx.store.read(&stock.id).await? {
        Some(stored) if stored.hash() == stock.hash => Outcome::Success,
        _ => Outcome::Failure,
    })
}

/// Fetch `id` from its nearest holders without a known stock entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SimpleRecovery {
    pub id: ChunkId,
}

pub struct SimpleRecoveryDriver {
    ctx: Arc<NodeContext>,
}

#[async_trait]
impl CoreDriver for SimpleRecoveryDriver {
    type Op = SimpleRecovery;
    type Output = Outcome;

    fn name(&self) -> &'static str {
        "simple_recovery"
    }

    async fn execute(&self, op: SimpleRecovery, deadline: Instant) -> anyhow::Result<Outcome> {
        let ctx = &self.ctx;
        let address = op.id.address(&ctx.ring);
        if !ctx.membership.dominates(address) {
            return Ok(Outcome::Rejected);
        }
        let holders = ctx.membership.important_peers(address, ctx.config.redundancy);
        let mut outcome = Outcome::NotFound;
        for holder in holders {
            let request = Request::Recovery { id: op.id, since: None };
            match ctx.exchange(&holder, request, deadline).await {
                Some(Reply::Chunk(chunk)) if chunk.id == op.id && chunk.is_well_formed() => {
                    if !ctx.membership.dominates(address) {
                        debug!(chunk = %op.id.short(), "lost ownership before commit");
                        return Ok(Outcome::Rejected);
                    }
                    // Newer-only: a local copy at least as recent wins.
                    return Ok(if ctx.store.update(chunk).await? {
                        Outcome::Success
                    } else {
                        Outcome::Failure
                    });
                }
                Some(Reply::Status(Outcome::NotFound)) => {}
                Some(Reply::Status(_)) | None => outcome = Outcome::GiveUp,
                Some(other) => {
                    violation(ctx, &holder, self.name(), &other);
                    outcome = Outcome::GiveUp;
                }
            }
        }
        Ok(outcome)
    }

    fn give_up(&self) -> Outcome {
        Outcome::GiveUp
    }

    fn is_obvious(&self, op: &SimpleRecovery) -> Option<Outcome> {
        let address = op.id.address(&self.ctx.ring);
        (!self.ctx.membership.dominates(address)).then_some(Outcome::Rejected)
    }
}

// ============================================================================
// Chunk operations
// ============================================================================

/// One chunk action routed to the chunk's holder.
///
/// Two ops collapse into one flight only when they are the same action on the
/// same chunk with the same payload: concurrent `Get`s share a read, while two
/// `Add`s of different content both run.
#[derive(Clone, Debug)]
pub struct ChunkOp {
    pub id: ChunkId,
    pub action: ChunkAction,
    /// Serve lookups from, and record results in, the local cache.
    pub cache: bool,
}

impl ChunkOp {
    pub fn new(id: ChunkId, action: ChunkAction) -> Self {
        Self {
            id,
            action,
            cache: false,
        }
    }

    pub fn cached(id: ChunkId, action: ChunkAction) -> Self {
        Self { id, action, cache: true }
    }

    fn payload_digest(&self) -> (u8, [u8; 32]) {
        fn diffs_into(hasher: &mut blake3::Hasher, diffs: &[Diff], date: u64) {
            hasher.update(&date.to_be_bytes());
            for Diff::Append(bytes) in diffs {
                hasher.update(&(bytes.len() as u64).to_be_bytes());
                hasher.update(bytes);
            }
        }

        let mut hasher = blake3::Hasher::new();
        let tag = match &self.action {
            ChunkAction::Get => 0,
            ChunkAction::Add { chunk } => {
                hasher.update(chunk.hash().as_bytes());
                hasher.update(&chunk.date.to_be_bytes());
                1
            }
            ChunkAction::Patch { diffs, date } => {
                diffs_into(&mut hasher, diffs, *date);
                2
            }
            ChunkAction::Update { stock } => {
                if let Some(stock) = stock {
                    hasher.update(stock.hash.as_bytes());
                    hasher.update(&stock.date.to_be_bytes());
                }
                3
            }
            ChunkAction::PatchAndGet { diffs, date } => {
                diffs_into(&mut hasher, diffs, *date);
                4
            }
            ChunkAction::PatchOrAddAndGet { initial, diffs, date } => {
                hasher.update(initial.hash().as_bytes());
                diffs_into(&mut hasher, diffs, *date);
                5
            }
        };
        (tag, *hasher.finalize().as_bytes())
    }
}

impl PartialEq for ChunkOp {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.cache == other.cache && self.payload_digest() == other.payload_digest()
    }
}

impl Eq for ChunkOp {}

impl Hash for ChunkOp {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.cache.hash(state);
        self.payload_digest().hash(state);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkResult {
    pub outcome: Outcome,
    pub chunk: Option<Chunk>,
}

impl ChunkResult {
    pub fn status(outcome: Outcome) -> Self {
        Self { outcome, chunk: None }
    }

    fn found(chunk: Chunk) -> Self {
        Self {
            outcome: Outcome::Success,
            chunk: Some(chunk),
        }
    }
}

pub struct ChunkDriver {
    ctx: Arc<NodeContext>,
}

impl ChunkDriver {
    async fn cached_copy(&self, id: &ChunkId) -> Option<Chunk> {
        if !matches!(self.ctx.cache_log.get(id), Some(CacheMark::Found { .. })) {
            return None;
        }
        match self.ctx.store.read_cache(id).await {
            Ok(found) => found,
            Err(e) => {
                debug!(chunk = %id.short(), error = %e, "cache read failed");
                None
            }
        }
    }

    async fn remember(&self, id: ChunkId, action: &ChunkAction, result: &ChunkResult) {
        let ctx = &self.ctx;
        let written = match (&result.chunk, result.outcome, action) {
            (Some(chunk), _, _) | (None, Outcome::Success, ChunkAction::Add { chunk }) => {
                let date = chunk.date;
                ctx.store
                    .force_write_cache(chunk.clone())
                    .await
                    .map(|()| Some(CacheMark::Found { date }))
            }
            (None, Outcome::NotFound, _) => ctx
                .store
                .add_not_found_cache(&id)
                .await
                .map(|()| Some(CacheMark::NotFound)),
            (None, Outcome::Success, ChunkAction::Update { stock: Some(stock) }) => {
                ctx.store.read_cache(&id).await.map(|cached| {
                    cached
                        .filter(|c| c.hash() == stock.hash)
                        .map(|c| CacheMark::Found { date: c.date })
                })
            }
            (None, Outcome::Success, ChunkAction::Patch { diffs, date }) => {
                ctx.store.patch_cache(&id, diffs, *date).await.map(|patched| match patched {
                    PatchResult::Patched(chunk) => Some(CacheMark::Found { date: chunk.date }),
                    _ => None,
                })
            }
            _ => Ok(None),
        };
        match written {
            Ok(Some(mark)) => ctx.cache_log.add(id, mark),
            Ok(None) => {}
            Err(e) => debug!(chunk = %id.short(), error = %e, "cache write failed"),
        }
    }
}

#[async_trait]
impl CoreDriver for ChunkDriver {
    type Op = ChunkOp;
    type Output = ChunkResult;

    fn name(&self) -> &'static str {
        "chunk"
    }

    async fn execute(&self, op: ChunkOp, deadline: Instant) -> anyhow::Result<ChunkResult> {
        let ctx = &self.ctx;
        let ChunkOp { id, action, cache } = op;

        if cache
            && matches!(action, ChunkAction::Get)
            && let Some(chunk) = self.cached_copy(&id).await
        {
            trace!(chunk = %id.short(), "served from cache");
            return Ok(ChunkResult::found(chunk));
        }

        let address = id.address(&ctx.ring);
        let holder = if ctx.membership.dominates(address) {
            None
        } else {
            ctx.membership.closest_peer(address)
        };

        let reply = match &holder {
            None => handlers::apply_action(ctx, id, action.clone()).await,
            Some(peer) => {
                let request = Request::Chunk {
                    id,
                    action: action.clone(),
                };
                match ctx.exchange(peer, request, deadline).await {
                    Some(reply) => reply,
                    None => return Ok(self.give_up()),
                }
            }
        };

        let result = match reply {
            Reply::Status(outcome) => ChunkResult::status(outcome),
            Reply::Chunk(chunk) if chunk.id == id && chunk.is_well_formed() => ChunkResult::found(chunk),
            other => {
                if let Some(peer) = &holder {
                    violation(ctx, peer, action.name(), &other);
                }
                return Ok(self.give_up());
            }
        };

        if cache && holder.is_some() {
            self.remember(id, &action, &result).await;
        }
        Ok(result)
    }

    fn give_up(&self) -> ChunkResult {
        ChunkResult::status(Outcome::GiveUp)
    }

    fn is_obvious(&self, op: &ChunkOp) -> Option<ChunkResult> {
        match &op.action {
            ChunkAction::Get if op.cache && self.ctx.cache_log.is_known_missing(&op.id) => {
                Some(ChunkResult::status(Outcome::NotFound))
            }
            ChunkAction::Add { chunk } | ChunkAction::PatchOrAddAndGet { initial: chunk, .. }
                if chunk.id != op.id || !chunk.is_well_formed() =>
            {
                Some(ChunkResult::status(Outcome::Failure))
            }
            _ => None,
        }
    }
}

/// Every replication driver of one node.
pub struct Drivers {
    pub first_access: DriverPair<FirstAccessDriver>,
    pub peer_access: DriverPair<PeerAccessDriver>,
    pub check_demand: DriverPair<CheckDemandDriver>,
    pub backup_one: DriverPair<BackupOneDriver>,
    pub backup: DriverPair<BackupDriver>,
    pub recovery: DriverPair<RecoveryDriver>,
    pub simple_recovery: DriverPair<SimpleRecoveryDriver>,
    pub chunk: DriverPair<ChunkDriver>,
}

impl Drivers {
    pub fn new(ctx: Arc<NodeContext>, pool: Arc<WorkerPool>) -> Self {
        Self {
            first_access: DriverPair::new(FirstAccessDriver { ctx: ctx.clone() }, pool.clone()),
            peer_access: DriverPair::new(PeerAccessDriver { ctx: ctx.clone() }, pool.clone()),
            check_demand: DriverPair::new(CheckDemandDriver { ctx: ctx.clone() }, pool.clone()),
            backup_one: DriverPair::new(BackupOneDriver { ctx: ctx.clone() }, pool.clone()),
            backup: DriverPair::new(BackupDriver { ctx: ctx.clone() }, pool.clone()),
            recovery: DriverPair::new(RecoveryDriver { ctx: ctx.clone() }, pool.clone()),
            simple_recovery: DriverPair::new(SimpleRecoveryDriver { ctx: ctx.clone() }, pool.clone()),
            chunk: DriverPair::new(ChunkDriver { ctx }, pool),
        }
    }

    /// Operations in flight across all drivers.
    pub fn in_flight(&self) -> usize {
        self.first_access.in_flight()
            + self.peer_access.in_flight()
            + self.check_demand.in_flight()
            + self.backup_one.in_flight()
            + self.backup.in_flight()
            + self.recovery.in_flight()
            + self.simple_recovery.in_flight()
            + self.chunk.in_flight()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn digest(op: &ChunkOp) -> u64 {
        let mut hasher = DefaultHasher::new();
        op.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn lookups_collapse_by_key() {
        let id = ChunkId::growing([1u8; 32]);
        let a = ChunkOp::new(id, ChunkAction::Get);
        let b = ChunkOp::new(id, ChunkAction::Get);
        assert_eq!(a, b);
        assert_eq!(digest(&a), digest(&b));
        assert_ne!(a, ChunkOp::cached(id, ChunkAction::Get));
    }

    #[test]
    fn mutations_with_different_payloads_stay_apart() {
        let first = Chunk::constant(b"one".to_vec(), 1);
        let second = Chunk::constant(b"two".to_vec(), 1);
        let add_first = ChunkOp::new(first.id, ChunkAction::Add { chunk: first.clone() });
        let add_second = ChunkOp::new(first.id, ChunkAction::Add { chunk: second });
        assert_ne!(add_first, add_second);
        assert_eq!(
            add_first,
            ChunkOp::new(first.id, ChunkAction::Add { chunk: first })
        );

        let id = ChunkId::growing([2u8; 32]);
        let patch = |bytes: &[u8]| {
            ChunkOp::new(
                id,
                ChunkAction::Patch {
                    diffs: vec![Diff::Append(bytes.to_vec())],
                    date: 5,
                },
            )
        };
        assert_ne!(patch(b"x"), patch(b"y"));
        assert_eq!(patch(b"x"), patch(b"x"));
    }

    #[test]
    fn different_actions_never_collapse() {
        let id = ChunkId::growing([3u8; 32]);
        let get = ChunkOp::new(id, ChunkAction::Get);
        let update = ChunkOp::new(id, ChunkAction::Update { stock: None });
        assert_ne!(get, update);
    }
}
