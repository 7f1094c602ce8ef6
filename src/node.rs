//! # High-Level Node API
//!
//! A [`Node`] wires the replication core to a transport and a store and runs
//! its background tasks:
//!
//! | Task | Cadence | Work |
//! |------|---------|------|
//! | dispatcher | per event | requests → worker pool → handlers; replies → sessions |
//! | backup sweep | `backup_interval` | `BackupOne` for the next page of held chunks in range |
//! | demand sweep | `demand_interval` | `CheckDemand` with each backup neighbor |
//! | partition guard | `guard_interval` | probe the reserve pot |
//! | penalty consumer | per report | count offenses, blacklist repeat offenders |
//! | telemetry | `telemetry_interval` | one log line of counters |
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::bind(NodeConfig::default(), &Keypair::generate(), "0.0.0.0:0".parse()?).await?;
//! node.bootstrap(seed).await;
//! node.add(Chunk::constant(b"hello".to_vec(), now_ms())).await;
//! ```
//!
//! All tasks watch one shutdown channel; [`Node::shutdown`] flips it and
//! waits for them.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::address::{Address, AddressCalculator, HashCalculator, Ring};
use crate::chunk::{Chunk, ChunkId, Diff, StockEntry};
use crate::config::NodeConfig;
use crate::context::{NodeContext, StockCursors};
use crate::driver::Dispatch;
use crate::guard::{GuardStep, PartitionGuard};
use crate::handlers;
use crate::identity::{Identity, Keypair, PeerRecord};
use crate::log::{AddressLog, CacheLog};
use crate::membership::{ReservePot, RingMembership};
use crate::messages::{Body, ChunkAction, Envelope, Outcome};
use crate::penalty::Outlaws;
use crate::pool::WorkerPool;
use crate::protocols::{ChunkStore, Membership, Transport};
use crate::replication::{
    Accessed, Backup, BackupOne, ChunkOp, ChunkResult, CheckDemand, DemandSummary, Drivers,
    FirstAccess, PeerAccess, Recovery, SimpleRecovery,
};
use crate::session::SessionCorrelator;
use crate::store::MemoryStore;
use crate::transport::{EventReceiver, MemoryNetwork, NetEvent, UdpTransport};

/// Collaborators a node is assembled from.
pub struct NodeParts {
    pub config: NodeConfig,
    pub record: PeerRecord,
    pub transport: Arc<dyn Transport>,
    pub events: EventReceiver,
    pub store: Arc<dyn ChunkStore>,
    pub calculator: Arc<dyn AddressCalculator>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub connections: usize,
    pub reserve: usize,
    pub pending_sessions: usize,
    pub in_flight: usize,
    pub workers: usize,
    pub queued_jobs: usize,
    pub blacklisted: usize,
    pub logged_addresses: usize,
    pub cache_marks: usize,
    pub guard_rounds: u64,
}

pub struct Node {
    ctx: Arc<NodeContext>,
    drivers: Arc<Drivers>,
    pool: Arc<WorkerPool>,
    guard: Arc<PartitionGuard>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Assemble a node and start its background tasks.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn start(parts: NodeParts) -> Self {
        let NodeParts {
            config,
            record,
            transport,
            events,
            store,
            calculator,
        } = parts;
        let ring = calculator.ring();
        let membership: Arc<dyn Membership> = Arc::new(RingMembership::new(
            record.clone(),
            calculator.clone(),
            config.redundancy,
        ));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (outlaws, outlaws_task) =
            Outlaws::spawn(config.penalty.clone(), membership.clone(), shutdown_rx.clone());

        let ctx = Arc::new(NodeContext {
            ring,
            calculator,
            membership,
            store,
            transport,
            sessions: SessionCorrelator::new(),
            address_log: AddressLog::new(config.address_log_limit, config.address_log_duration),
            cache_log: CacheLog::new(config.cache_log_limit, config.cache_log_duration),
            outlaws,
            reserve: ReservePot::new(config.reserve_capacity),
            demand_cursors: StockCursors::new(),
            offer_cursors: StockCursors::new(),
            config,
        });

        let pool = WorkerPool::new(
            ctx.config.min_workers,
            ctx.config.max_workers,
            ctx.config.worker_idle_keepalive,
        );
        let drivers = Arc::new(Drivers::new(ctx.clone(), pool.clone()));
        let guard = Arc::new(PartitionGuard::new(
            ctx.clone(),
            drivers.first_access.blocking.clone(),
            drivers.peer_access.blocking.clone(),
        ));

        let mut tasks = vec![
            outlaws_task,
            tokio::spawn(dispatch(ctx.clone(), pool.clone(), events, shutdown_rx.clone())),
            tokio::spawn(backup_sweep(ctx.clone(), drivers.clone(), shutdown_rx.clone())),
            tokio::spawn(demand_sweep(ctx.clone(), drivers.clone(), shutdown_rx.clone())),
        ];
        let guard_task = guard.clone();
        let guard_rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { guard_task.run(guard_rx).await }));

        let node = Self {
            ctx,
            drivers,
            pool,
            guard,
            shutdown,
            tasks: Mutex::new(tasks),
        };
        if let Some(every) = node.ctx.config.telemetry_interval {
            let ctx = node.ctx.clone();
            let drivers = node.drivers.clone();
            let pool = node.pool.clone();
            let guard = node.guard.clone();
            let handle = tokio::spawn(telemetry_loop(ctx, drivers, pool, guard, every, shutdown_rx));
            if let Ok(mut tasks) = node.tasks.lock() {
                tasks.push(handle);
            }
        }

        info!(
            identity = %node.identity(),
            address = %node.address(),
            endpoint = %node.record().endpoint,
            redundancy = node.ctx.config.redundancy,
            "node started"
        );
        node
    }

    /// A UDP node with an in-memory store.
    pub async fn bind(config: NodeConfig, keypair: &Keypair, addr: SocketAddr) -> Result<Self> {
        let ring = Ring::new(config.ring_bits);
        let calculator = Arc::new(HashCalculator::new(ring, config.address_memo_capacity));
        let (transport, events) = UdpTransport::bind(keypair.identity(), addr).await?;
        let record = transport.record().clone();
        Ok(Self::start(NodeParts {
            config,
            record,
            transport,
            events,
            store: Arc::new(MemoryStore::new(ring)),
            calculator,
        }))
    }

    /// A node on an in-process network, returning its store for inspection.
    pub fn attach(
        network: &Arc<MemoryNetwork>,
        config: NodeConfig,
        record: PeerRecord,
        calculator: Arc<dyn AddressCalculator>,
    ) -> (Self, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new(calculator.ring()));
        let (transport, events) = network.attach(record.clone());
        let node = Self::start(NodeParts {
            config,
            record,
            transport,
            events,
            store: store.clone(),
            calculator,
        });
        (node, store)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn identity(&self) -> Identity {
        self.ctx.me().identity
    }

    pub fn record(&self) -> PeerRecord {
        self.ctx.me()
    }

    pub fn address(&self) -> Address {
        self.ctx.membership.self_address()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.ctx.config
    }

    pub fn membership(&self) -> &Arc<dyn Membership> {
        &self.ctx.membership
    }

    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.ctx.store
    }

    pub fn outlaws(&self) -> &Arc<Outlaws> {
        &self.ctx.outlaws
    }

    pub fn address_log(&self) -> &AddressLog {
        &self.ctx.address_log
    }

    pub fn cache_log(&self) -> &CacheLog {
        &self.ctx.cache_log
    }

    pub fn reserve(&self) -> &ReservePot {
        &self.ctx.reserve
    }

    pub fn drivers(&self) -> &Drivers {
        &self.drivers
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        snapshot(&self.ctx, &self.drivers, &self.pool, &self.guard)
    }

    // =========================================================================
    // Membership
    // =========================================================================

    /// Join the ring through `seed`.
    pub async fn bootstrap(&self, seed: PeerRecord) -> Accessed {
        let timeout = self.ctx.config.operation_timeout;
        let accessed = self
            .drivers
            .first_access
            .blocking
            .execute(FirstAccess { peer: seed.clone() }, timeout)
            .await;
        info!(
            seed = %seed.identity.short(),
            outcome = ?accessed.outcome,
            learned = accessed.peers.len(),
            "bootstrap finished"
        );
        accessed
    }

    /// Ask `via` who owns `target`.
    pub async fn lookup(&self, via: PeerRecord, target: Address) -> Accessed {
        self.drivers
            .peer_access
            .blocking
            .execute(PeerAccess { via, target }, self.ctx.config.operation_timeout)
            .await
    }

    /// Run one partition guard round now.
    pub async fn guard_round(&self) -> GuardStep {
        self.guard.tick().await
    }

    // =========================================================================
    // Chunk API
    // =========================================================================

    pub async fn chunk(&self, op: ChunkOp) -> ChunkResult {
        self.drivers
            .chunk
            .blocking
            .execute(op, self.ctx.config.operation_timeout)
            .await
    }

    pub async fn get(&self, id: ChunkId) -> ChunkResult {
        self.chunk(ChunkOp::new(id, ChunkAction::Get)).await
    }

    /// Lookup served from the local cache when a fresh copy is logged there.
    pub async fn get_cached(&self, id: ChunkId) -> ChunkResult {
        self.chunk(ChunkOp::cached(id, ChunkAction::Get)).await
    }

    pub async fn add(&self, chunk: Chunk) -> ChunkResult {
        self.chunk(ChunkOp::new(chunk.id, ChunkAction::Add { chunk })).await
    }

    pub async fn patch(&self, id: ChunkId, diffs: Vec<Diff>, date: u64) -> ChunkResult {
        self.chunk(ChunkOp::new(id, ChunkAction::Patch { diffs, date })).await
    }

    /// Fetch `id` unless `stock` already describes the holder's copy.
    pub async fn update(&self, id: ChunkId, stock: Option<StockEntry>) -> ChunkResult {
        self.chunk(ChunkOp::new(id, ChunkAction::Update { stock })).await
    }

    pub async fn patch_and_get(&self, id: ChunkId, diffs: Vec<Diff>, date: u64) -> ChunkResult {
        self.chunk(ChunkOp::new(id, ChunkAction::PatchAndGet { diffs, date })).await
    }

    pub async fn patch_or_add_and_get(&self, initial: Chunk, diffs: Vec<Diff>, date: u64) -> ChunkResult {
        let id = initial.id;
        self.chunk(ChunkOp::new(id, ChunkAction::PatchOrAddAndGet { initial, diffs, date }))
            .await
    }

    // =========================================================================
    // Replication
    // =========================================================================

    pub async fn backup_one(&self, id: ChunkId) -> Outcome {
        self.drivers
            .backup_one
            .blocking
            .execute(BackupOne { id }, self.ctx.config.operation_timeout)
            .await
    }

    pub async fn backup_to(&self, to: PeerRecord, id: ChunkId) -> Outcome {
        self.drivers
            .backup
            .blocking
            .execute(Backup { to, id }, self.ctx.config.operation_timeout)
            .await
    }

    /// Reconcile this node's responsibility range with `peer`.
    pub async fn check_demand(&self, peer: PeerRecord) -> DemandSummary {
        let range = self.ctx.membership.responsibility_range();
        self.drivers
            .check_demand
            .blocking
            .execute(CheckDemand { peer, range }, self.ctx.config.operation_timeout)
            .await
    }

    pub async fn recover(&self, from: PeerRecord, stock: StockEntry) -> Outcome {
        self.drivers
            .recovery
            .blocking
            .execute(Recovery { from, stock }, self.ctx.config.operation_timeout)
            .await
    }

    pub async fn simple_recover(&self, id: ChunkId) -> Outcome {
        self.drivers
            .simple_recovery
            .blocking
            .execute(SimpleRecovery { id }, self.ctx.config.operation_timeout)
            .await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Stop every background task and the worker pool.
    pub async fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        self.pool.shutdown();
        let tasks = self
            .tasks
            .lock()
            .map(|mut tasks| std::mem::take(&mut *tasks))
            .unwrap_or_default();
        for task in tasks {
            if let Err(e) = task.await
                && !e.is_cancelled()
            {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        info!(identity = %self.identity(), "node stopped");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        self.pool.shutdown();
    }
}

// ============================================================================
// Background tasks
// ============================================================================

async fn dispatch(
    ctx: Arc<NodeContext>,
    pool: Arc<WorkerPool>,
    mut events: EventReceiver,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        on_event(&ctx, &pool, event);
    }
    debug!("dispatcher stopped");
}

fn on_event(ctx: &Arc<NodeContext>, pool: &Arc<WorkerPool>, event: NetEvent) {
    match event {
        NetEvent::Mail { from, mail } => {
            if ctx.outlaws.is_blacklisted(&from.endpoint) {
                trace!(from = %from.endpoint, "mail from blacklisted endpoint dropped");
                return;
            }
            for envelope in mail {
                let session = envelope.session;
                match envelope.body {
                    Body::Request(request) => {
                        let ctx = ctx.clone();
                        let from = from.clone();
                        let job = async move {
                            let reply = handlers::handle(&ctx, &from, request).await;
                            ctx.transport
                                .send_mail(&from, reply.channel(), vec![Envelope::reply(session, reply)])
                                .await;
                        };
                        if pool.submit(job).is_err() {
                            debug!(session, "worker pool closed, request dropped");
                        }
                    }
                    Body::Reply(reply) => {
                        if !ctx.sessions.set_reply(session, &from.identity, reply) {
                            trace!(session, from = %from.identity.short(), "reply without a waiting session");
                        }
                    }
                }
            }
        }
        NetEvent::Connected(peer) => {
            if peer.identity != ctx.me().identity
                && !ctx.membership.is_connected(&peer.identity)
                && !ctx.outlaws.is_blacklisted(&peer.endpoint)
            {
                ctx.reserve.add(peer);
            }
        }
        NetEvent::PeerInvalid(peer) => ctx.report(&peer, "undecodable mail"),
        NetEvent::CommError { peer, reason } => {
            debug!(peer = %peer.identity.short(), reason, "communication error");
            ctx.report(&peer, "communication error");
        }
        NetEvent::Unreachable(peer) => {
            let released = ctx.sessions.release_all(&peer.identity);
            ctx.demand_cursors.forget(&peer.identity);
            ctx.offer_cursors.forget(&peer.identity);
            if ctx.membership.remove_peer(&peer.identity).is_some() {
                ctx.reserve.add(peer.clone());
            }
            debug!(peer = %peer.identity.short(), released, "peer unreachable");
        }
        NetEvent::PortClosed => warn!("transport port closed"),
        NetEvent::Unsent { to, sessions } => {
            for session in sessions {
                ctx.sessions.set_null(session, &to.identity);
            }
        }
    }
}

async fn backup_sweep(ctx: Arc<NodeContext>, drivers: Arc<Drivers>, mut shutdown: watch::Receiver<bool>) {
    let cursor = StockCursors::new();
    let me = ctx.me().identity;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(ctx.config.backup_interval) => {}
            _ = shutdown.changed() => break,
        }
        let range = ctx.membership.responsibility_range();
        let stock = match ctx.stock_page(&cursor, &me, range).await {
            Ok(stock) => stock,
            Err(e) => {
                warn!(error = %e, "backup sweep could not list stock");
                continue;
            }
        };
        let mut submitted = 0usize;
        for entry in stock {
            let op = BackupOne { id: entry.id };
            if drivers.backup_one.background.execute(op, ctx.config.operation_timeout) == Dispatch::Submitted {
                submitted += 1;
            }
        }
        debug!(submitted, "backup sweep");
    }
}

async fn demand_sweep(ctx: Arc<NodeContext>, drivers: Arc<Drivers>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(ctx.config.demand_interval) => {}
            _ = shutdown.changed() => break,
        }
        let range = ctx.membership.responsibility_range();
        for peer in ctx.membership.backup_neighbors(ctx.config.backup_neighbors) {
            let op = CheckDemand { peer, range };
            let dispatch = drivers.check_demand.background.execute(op, ctx.config.operation_timeout);
            trace!(?dispatch, "demand check queued");
        }
    }
}

fn snapshot(ctx: &NodeContext, drivers: &Drivers, pool: &WorkerPool, guard: &PartitionGuard) -> TelemetrySnapshot {
    TelemetrySnapshot {
        connections: ctx.membership.connection_count(),
        reserve: ctx.reserve.len(),
        pending_sessions: ctx.sessions.pending(),
        in_flight: drivers.in_flight(),
        workers: pool.workers(),
        queued_jobs: pool.queued(),
        blacklisted: ctx.outlaws.blacklist().len(),
        logged_addresses: ctx.address_log.len(),
        cache_marks: ctx.cache_log.len(),
        guard_rounds: guard.rounds(),
    }
}

async fn telemetry_loop(
    ctx: Arc<NodeContext>,
    drivers: Arc<Drivers>,
    pool: Arc<WorkerPool>,
    guard: Arc<PartitionGuard>,
    every: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(every) => {}
            _ = shutdown.changed() => break,
        }
        let t = snapshot(&ctx, &drivers, &pool, &guard);
        info!(
            connections = t.connections,
            reserve = t.reserve,
            pending_sessions = t.pending_sessions,
            in_flight = t.in_flight,
            workers = t.workers,
            queued_jobs = t.queued_jobs,
            blacklisted = t.blacklisted,
            "telemetry"
        );
    }
}
