//! # Request Handlers
//!
//! The responder side of every replication protocol. Each handler checks the
//! requester against the ownership rule before touching the store:
//!
//! | Request | Gate | Reply |
//! |---------|------|-------|
//! | `AddressAccess` | claimed address matches the calculated one and the address log; requester is appropriate for it | `Access` |
//! | `PeerAccess` | none | `Access` |
//! | `CheckDemand` | requester appropriate for every candidate | `Demands` |
//! | `CheckOneDemand` | responder dominates the entry | `Demand` |
//! | `Backup` | responder dominates the chunk | `Status` |
//! | `Recovery` | none (read only) | `Chunk` / `Diff` / `Status` |
//! | `Chunk` | requester not less appropriate than the responder | `Chunk` / `Status` |
//!
//! A failed gate answers `Rejected` and leaves every piece of local state
//! untouched. Local I/O failures answer `GiveUp`.

use std::collections::HashMap;

use tracing::{debug, trace, warn};

use crate::address::{Address, AddressRange};
use crate::chunk::{Chunk, ChunkId, StockEntry};
use crate::context::NodeContext;
use crate::identity::{Identity, PeerRecord};
use crate::messages::{ChunkAction, Outcome, Reply, Request};
use crate::protocols::{PatchResult, StoreError};

/// Answer one request from `from`.
pub async fn handle(ctx: &NodeContext, from: &PeerRecord, request: Request) -> Reply {
    let name = request.name();
    let reply = match request {
        Request::AddressAccess { address } => address_access(ctx, from, address),
        Request::PeerAccess { target } => peer_access(ctx, from, target),
        Request::CheckDemand { range, candidates } => {
            check_demand(ctx, from, range, candidates).await
        }
        Request::CheckOneDemand { entry } => check_one_demand(ctx, entry).await,
        Request::Backup { chunk } => backup(ctx, from, chunk).await,
        Request::Recovery { id, since } => recovery(ctx, id, since).await,
        Request::Chunk { id, action } => chunk_request(ctx, from, id, action).await,
    };
    trace!(from = %from.identity.short(), request = name, reply = reply.name(), "request handled");
    reply
}

fn io_give_up(request: &'static str, e: StoreError) -> Reply {
    warn!(request, error = %e, "local store failed");
    Reply::Status(Outcome::GiveUp)
}

/// Owner of `address` among the local node and its peers, `exclude` left
/// out, plus the peers nearest to it.
fn locate(ctx: &NodeContext, address: Address, exclude: &Identity) -> (Option<PeerRecord>, Vec<PeerRecord>) {
    let limit = ctx.config.max_access_peers;
    let peers: Vec<PeerRecord> = ctx
        .membership
        .important_peers(address, limit.saturating_add(1))
        .into_iter()
        .filter(|p| p.identity != *exclude)
        .take(limit)
        .collect();
    let me = ctx.membership.self_address();
    let owner = peers
        .first()
        .filter(|p| ctx.ring.is_closer(address, ctx.membership.address_of(&p.identity), me))
        .cloned();
    (owner, peers)
}

fn address_access(ctx: &NodeContext, from: &PeerRecord, address: Address) -> Reply {
    let calculated = ctx.calculator.calculate(&from.identity);
    if calculated != address {
        ctx.report(from, "address claim does not match identity");
        return Reply::Status(Outcome::Rejected);
    }
    if ctx.address_log.contains_and_not_equals(&from.identity, address) {
        debug!(peer = %from.identity.short(), %address, "address conflicts with logged position");
        return Reply::Status(Outcome::Rejected);
    }
    if ctx.membership.more_appropriate(address, &from.identity) {
        debug!(peer = %from.identity.short(), %address, "requester not appropriate for its address");
        return Reply::Status(Outcome::Rejected);
    }

    let (owner, peers) = locate(ctx, address, &from.identity);
    ctx.address_log.add(from.identity, address);
    ctx.reserve.remove(&from.identity);
    ctx.membership.add_peer(from.clone());
    Reply::Access { owner, peers }
}

fn peer_access(ctx: &NodeContext, from: &PeerRecord, target: Address) -> Reply {
    let (owner, peers) = locate(ctx, target, &from.identity);
    Reply::Access { owner, peers }
}

async fn check_demand(
    ctx: &NodeContext,
    from: &PeerRecord,
    range: AddressRange,
    candidates: Vec<StockEntry>,
) -> Reply {
    let limit = ctx.config.max_demand_entries;
    if candidates.len() > limit {
        ctx.report(from, "oversized demand check");
        return Reply::Status(Outcome::Rejected);
    }
    for candidate in &candidates {
        let address = candidate.id.address(&ctx.ring);
        if ctx.membership.more_appropriate(address, &from.identity) {
            debug!(
                peer = %from.identity.short(),
                chunk = %candidate.id.short(),
                "demand check for chunk the requester does not own"
            );
            return Reply::Status(Outcome::Rejected);
        }
    }

    let mut demands = Vec::new();
    for candidate in &candidates {
        if demands.len() >= limit {
            break;
        }
        match ctx.store.read(&candidate.id).await {
            Ok(None) => demands.push(*candidate),
            Ok(Some(local)) if candidate.supersedes(&local.stock()) => demands.push(*candidate),
            Ok(Some(_)) => {}
            Err(e) => return io_give_up("check_demand", e),
        }
    }

    let local = match ctx.stock_page(&ctx.offer_cursors, &from.identity, range).await {
        Ok(stock) => stock,
        Err(e) => return io_give_up("check_demand", e),
    };
    let theirs: HashMap<ChunkId, StockEntry> = candidates.iter().map(|c| (c.id, *c)).collect();
    let offers: Vec<StockEntry> = local
        .into_iter()
        .filter(|mine| match theirs.get(&mine.id) {
            Some(their) => mine.supersedes(their),
            None => !ctx
                .membership
                .more_appropriate(mine.id.address(&ctx.ring), &from.identity),
        })
        .take(limit)
        .collect();

    Reply::Demands { demands, offers }
}

async fn check_one_demand(ctx: &NodeContext, entry: StockEntry) -> Reply {
    if !ctx.membership.dominates(entry.id.address(&ctx.ring)) {
        return Reply::Status(Outcome::Rejected);
    }
    match ctx.store.read(&entry.id).await {
        Ok(None) => Reply::Demand(true),
        Ok(Some(local)) => Reply::Demand(entry.supersedes(&local.stock())),
        Err(e) => io_give_up("check_one_demand", e),
    }
}

async fn backup(ctx: &NodeContext, from: &PeerRecord, chunk: Chunk) -> Reply {
    if !chunk.is_well_formed() {
        ctx.report(from, "malformed backup chunk");
        return Reply::Status(Outcome::Rejected);
    }
    if !ctx.membership.dominates(chunk.id.address(&ctx.ring)) {
        return Reply::Status(Outcome::Rejected);
    }

    let expected = chunk.hash();
    let id = chunk.id;
    if let Err(e) = ctx.store.update(chunk).await {
        return io_give_up("backup", e);
    }
    match ctx.store.read(&id).await {
        Ok(Some(stored)) if stored.hash() == expected => Reply::Status(Outcome::Success),
        Ok(_) => {
            debug!(chunk = %id.short(), "backup superseded by a different local copy");
            Reply::Status(Outcome::Failure)
        }
        Err(e) => io_give_up("backup", e),
    }
}

async fn recovery(ctx: &NodeContext, id: ChunkId, since: Option<u64>) -> Reply {
    let chunk = match ctx.store.read(&id).await {
        Ok(Some(chunk)) => chunk,
        Ok(None) => return Reply::Status(Outcome::NotFound),
        Err(e) => return io_give_up("recovery", e),
    };
    if let Some(base) = since
        && let Some(diffs) = chunk.diff_since(base)
    {
        return Reply::Diff {
            id,
            base,
            diffs,
            date: chunk.date,
            hash: chunk.hash(),
        };
    }
    Reply::Chunk(chunk)
}

async fn chunk_request(ctx: &NodeContext, from: &PeerRecord, id: ChunkId, action: ChunkAction) -> Reply {
    let address = id.address(&ctx.ring);
    if ctx.membership.more_appropriate(address, &from.identity) && !ctx.membership.dominates(address) {
        debug!(
            peer = %from.identity.short(),
            chunk = %id.short(),
            action = action.name(),
            "chunk request routed to the wrong holder"
        );
        return Reply::Status(Outcome::Rejected);
    }
    if let ChunkAction::Add { chunk } | ChunkAction::PatchOrAddAndGet { initial: chunk, .. } = &action
        && (chunk.id != id || !chunk.is_well_formed())
    {
        ctx.report(from, "malformed chunk in request");
        return Reply::Status(Outcome::Rejected);
    }
    apply_action(ctx, id, action).await
}

/// Run a chunk action against the local primary store.
///
/// Shared by remote requests and by drivers that find the local node is the
/// holder. Callers have already validated any chunk carried by `action`.
pub async fn apply_action(ctx: &NodeContext, id: ChunkId, action: ChunkAction) -> Reply {
    let name = action.name();
    let result = match action {
        ChunkAction::Get => ctx.store.read(&id).await.map(|found| match found {
            Some(chunk) => Reply::Chunk(chunk),
            None => Reply::Status(Outcome::NotFound),
        }),
        ChunkAction::Add { chunk } => add(ctx, chunk).await,
        ChunkAction::Patch { diffs, date } => {
            ctx.store.patch(&id, &diffs, date).await.map(|result| match result {
                PatchResult::Patched(_) => Reply::Status(Outcome::Success),
                other => patched(other),
            })
        }
        ChunkAction::Update { stock } => ctx.store.read(&id).await.map(|found| match (found, stock) {
            (None, _) => Reply::Status(Outcome::NotFound),
            (Some(chunk), Some(known)) if known == chunk.stock() => Reply::Status(Outcome::Success),
            (Some(chunk), _) => Reply::Chunk(chunk),
        }),
        ChunkAction::PatchAndGet { diffs, date } => ctx
            .store
            .patch(&id, &diffs, date)
            .await
            .map(patched),
        ChunkAction::PatchOrAddAndGet { initial, diffs, date } => {
            match ctx.store.weak_write(initial).await {
                Ok(_) => ctx.store.patch(&id, &diffs, date).await.map(patched),
                Err(e) => Err(e),
            }
        }
    };
    result.unwrap_or_else(|e| io_give_up(name, e))
}

async fn add(ctx: &NodeContext, chunk: Chunk) -> Result<Reply, StoreError> {
    let id = chunk.id;
    let hash = chunk.hash();
    if ctx.store.weak_write(chunk).await? {
        return Ok(Reply::Status(Outcome::Success));
    }
    // Already present: identical content counts as success.
    Ok(match ctx.store.read(&id).await? {
        Some(existing) if existing.hash() == hash => Reply::Status(Outcome::Success),
        Some(_) => Reply::Status(Outcome::Failure),
        None => Reply::Status(Outcome::GiveUp),
    })
}

fn patched(result: PatchResult) -> Reply {
    match result {
        PatchResult::Patched(chunk) => Reply::Chunk(chunk),
        PatchResult::NotFound => Reply::Status(Outcome::NotFound),
        PatchResult::Invalid(e) => {
            debug!(error = %e, "patch refused");
            Reply::Status(Outcome::Failure)
        }
    }
}
