//! # Ringvault - Replication Core for a Ring-Structured Chunk Store
//!
//! Ringvault keeps chunks of data alive on a peer-to-peer ring:
//!
//! - **Ownership**: every chunk id hashes to a ring address; the `r` nodes
//!   nearest to it hold the chunk
//! - **Replication**: backup pushes, demand checks and recovery pulls keep
//!   holders in sync as peers join and leave
//! - **Consistency**: every store mutation is gated on ownership, and pulled
//!   data is committed only if its content hash matches
//! - **Abuse handling**: protocol violations are counted per peer; repeat
//!   offenders are dropped and their endpoints blacklisted for a while
//!
//! ## Architecture
//!
//! Each replication operation is a [`driver::CoreDriver`] wrapped twice: a
//! blocking wrapper for callers that want the result and a non-blocking one
//! for periodic sweeps. Both share a single-flight [`station::Station`], so
//! identical concurrent operations run once.
//!
//! Storage, transport and membership sit behind the traits in [`protocols`];
//! the crate ships in-memory and UDP implementations.
//!
//! ## Security Model
//!
//! - Identity = Ed25519 public key; ring address = hash of identity
//! - Peers must claim the address their identity hashes to
//! - Mail is decoded with size-limited bincode; every table is bounded
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API and background tasks |
//! | `identity` | Keypairs, identities, peer records |
//! | `address` | Ring arithmetic, ranges, identity → address calculators |
//! | `chunk` | Chunks, diffs, stock entries, content hashes |
//! | `station` | Single-flight registry |
//! | `session` | Request/reply correlation |
//! | `pool` | Elastic worker pool for request handling |
//! | `driver` | Core driver trait and its blocking / non-blocking wrappers |
//! | `log` | Bounded time-expiring logs of peer addresses and cache results |
//! | `penalty` | Offense counting, decay and blacklisting |
//! | `membership` | Live peer set, ownership rule, reserve pot |
//! | `handlers` | Responder side of every protocol |
//! | `replication` | Requester side of every protocol |
//! | `guard` | Partition guard |
//! | `transport` | In-memory network and UDP transport |
//! | `store` | In-memory chunk store |
//! | `messages` | Wire types and the mail codec |
//! | `protocols` | Storage, transport and membership traits |
//! | `config` | Node configuration |

pub mod address;
pub mod chunk;
pub mod config;
pub mod context;
pub mod driver;
pub mod guard;
pub mod handlers;
pub mod identity;
pub mod log;
pub mod membership;
pub mod messages;
pub mod node;
pub mod penalty;
pub mod pool;
pub mod protocols;
pub mod replication;
pub mod session;
pub mod station;
pub mod store;
pub mod transport;

pub use address::{Address, AddressRange, Ring, DEFAULT_RING_BITS, MAX_RING_BITS};
pub use chunk::{Chunk, ChunkId, ChunkKind, Diff, StockEntry};
pub use config::NodeConfig;
pub use identity::{Identity, Keypair, PeerRecord};
pub use membership::DEFAULT_REDUNDANCY;
pub use messages::Outcome;
pub use node::{Node, NodeParts, TelemetrySnapshot};
pub use pool::DEFAULT_MAX_WORKERS;
pub use replication::{Accessed, ChunkResult, DemandSummary};
