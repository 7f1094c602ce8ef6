//! Node configuration.
//!
//! Every tunable has a `DEFAULT_*` constant next to the module that uses it;
//! [`NodeConfig::default`] collects them. The binary overrides a subset from
//! the command line.

use std::time::Duration;

use crate::address::DEFAULT_RING_BITS;
use crate::chunk::ChunkKind;
use crate::log::{
    DEFAULT_ADDRESS_LOG_DURATION, DEFAULT_ADDRESS_LOG_LIMIT, DEFAULT_CACHE_LOG_DURATION,
    DEFAULT_CACHE_LOG_LIMIT,
};
use crate::membership::{DEFAULT_REDUNDANCY, DEFAULT_RESERVE_CAPACITY};
use crate::penalty::PenaltyConfig;
use crate::pool::{DEFAULT_IDLE_KEEPALIVE, DEFAULT_MAX_WORKERS, DEFAULT_MIN_WORKERS};

/// Identity → address memo entries kept by the hash calculator.
pub const DEFAULT_ADDRESS_MEMO_CAPACITY: usize = 8192;

/// Wait for a single reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Total budget of one driver execution (may span several exchanges).
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(15);

pub const DEFAULT_BACKUP_INTERVAL: Duration = Duration::from_secs(60);

pub const DEFAULT_DEMAND_INTERVAL: Duration = Duration::from_secs(120);

pub const DEFAULT_GUARD_INTERVAL: Duration = Duration::from_secs(30);

/// Neighbors considered when picking a backup destination.
pub const DEFAULT_BACKUP_NEIGHBORS: usize = 2;

/// Stock entries per CheckDemand exchange, and cap on each reply list.
/// SECURITY: Bounds work a single request can demand.
pub const DEFAULT_MAX_DEMAND_ENTRIES: usize = 256;

/// Peers returned in an access reply.
pub const DEFAULT_MAX_ACCESS_PEERS: usize = 16;

#[derive(Clone, Debug)]
pub struct NodeConfig {
    // ========================================================================
    // Ring and ownership
    // ========================================================================
    pub ring_bits: u8,
    pub redundancy: usize,
    pub address_memo_capacity: usize,

    // ========================================================================
    // Logs and penalties
    // ========================================================================
    pub address_log_limit: usize,
    pub address_log_duration: Duration,
    pub cache_log_limit: usize,
    pub cache_log_duration: Duration,
    pub penalty: PenaltyConfig,

    // ========================================================================
    // Workers and timeouts
    // ========================================================================
    pub min_workers: usize,
    pub max_workers: usize,
    pub worker_idle_keepalive: Duration,
    pub request_timeout: Duration,
    pub operation_timeout: Duration,

    // ========================================================================
    // Background loops
    // ========================================================================
    pub backup_interval: Duration,
    pub demand_interval: Duration,
    pub guard_interval: Duration,
    /// Log a telemetry line this often. `None` disables it.
    pub telemetry_interval: Option<Duration>,

    // ========================================================================
    // Replication limits
    // ========================================================================
    pub backup_neighbors: usize,
    /// Chunk kinds the backup sweep pushes to neighbors.
    pub backup_kinds: Vec<ChunkKind>,
    pub max_demand_entries: usize,
    pub max_access_peers: usize,
    pub reserve_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            ring_bits: DEFAULT_RING_BITS,
            redundancy: DEFAULT_REDUNDANCY,
            address_memo_capacity: DEFAULT_ADDRESS_MEMO_CAPACITY,

            address_log_limit: DEFAULT_ADDRESS_LOG_LIMIT,
            address_log_duration: DEFAULT_ADDRESS_LOG_DURATION,
            cache_log_limit: DEFAULT_CACHE_LOG_LIMIT,
            cache_log_duration: DEFAULT_CACHE_LOG_DURATION,
            penalty: PenaltyConfig::default(),

            min_workers: DEFAULT_MIN_WORKERS,
            max_workers: DEFAULT_MAX_WORKERS,
            worker_idle_keepalive: DEFAULT_IDLE_KEEPALIVE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,

            backup_interval: DEFAULT_BACKUP_INTERVAL,
            demand_interval: DEFAULT_DEMAND_INTERVAL,
            guard_interval: DEFAULT_GUARD_INTERVAL,
            telemetry_interval: None,

            backup_neighbors: DEFAULT_BACKUP_NEIGHBORS,
            backup_kinds: vec![ChunkKind::Constant, ChunkKind::Growing],
            max_demand_entries: DEFAULT_MAX_DEMAND_ENTRIES,
            max_access_peers: DEFAULT_MAX_ACCESS_PEERS,
            reserve_capacity: DEFAULT_RESERVE_CAPACITY,
        }
    }
}

impl NodeConfig {
    /// Short timeouts and intervals for in-process test clusters.
    pub fn for_tests() -> Self {
        Self {
            ring_bits: 16,
            redundancy: 1,
            min_workers: 2,
            max_workers: 16,
            request_timeout: Duration::from_millis(500),
            operation_timeout: Duration::from_secs(2),
            backup_interval: Duration::from_secs(3600),
            demand_interval: Duration::from_secs(3600),
            guard_interval: Duration::from_secs(3600),
            ..Self::default()
        }
    }
}
