//! # Wire Protocol Messages
//!
//! Every exchange in the replication core is a request answered by exactly one
//! typed reply, correlated by session id. Messages travel in *mail*: a batch of
//! [`Envelope`]s sent to one peer on one [`Channel`].
//!
//! ## Exchanges
//!
//! | Request | Reply | Gate |
//! |---------|-------|------|
//! | `AddressAccess` | `Access` | claimed address must match and be appropriate |
//! | `PeerAccess` | `Access` | none |
//! | `CheckDemand` | `Demands` | every candidate address |
//! | `CheckOneDemand` | `Demand` | responder dominates |
//! | `Backup` | `Status` | responder dominates |
//! | `Recovery` | `Chunk` / `Diff` / `Status` | none (read only) |
//! | `Chunk` | `Chunk` / `Status` | requester appropriate or responder dominates |
//!
//! ## Security Limits
//!
//! - `MAX_MAIL_SIZE`: a chunk plus framing overhead
//! - `MAX_MAIL_MESSAGES`: envelopes per mail
//! - All decoding goes through [`decode_mail`] with the size limit enforced

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::address::{Address, AddressRange};
use crate::chunk::{Chunk, ChunkHash, ChunkId, Diff, MAX_CHUNK_SIZE, StockEntry};
use crate::identity::PeerRecord;
use crate::session::SessionId;

/// Maximum encoded mail size: one full chunk plus 64 KiB of framing.
pub const MAX_MAIL_SIZE: u64 = MAX_CHUNK_SIZE as u64 + 64 * 1024;

/// Maximum envelopes accepted in one mail.
pub const MAX_MAIL_MESSAGES: usize = 64;

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_MAIL_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize_bounded<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

pub fn encode_mail(mail: &[Envelope]) -> Result<Vec<u8>, bincode::Error> {
    serialize_bounded(&mail)
}

pub fn decode_mail(bytes: &[u8]) -> Result<Vec<Envelope>, bincode::Error> {
    let mail: Vec<Envelope> = deserialize_bounded(bytes)?;
    if mail.len() > MAX_MAIL_MESSAGES {
        return Err(Box::new(bincode::ErrorKind::Custom(format!(
            "mail carries {} envelopes (max {})",
            mail.len(),
            MAX_MAIL_MESSAGES
        ))));
    }
    Ok(mail)
}

/// Logical lane a mail travels on. Bulk carries chunk content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Control,
    Bulk,
}

/// Terminal status of an exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    /// Ran, but the result disagrees with what was expected (e.g. hash mismatch).
    Failure,
    NotFound,
    /// The address authority check failed.
    Rejected,
    /// No answer in time, or a local failure. Safe to retry later.
    GiveUp,
}

/// Storage operation carried by [`Request::Chunk`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkAction {
    Get,
    /// Insert if absent.
    Add { chunk: Chunk },
    Patch { diffs: Vec<Diff>, date: u64 },
    /// Fetch only if the holder's copy differs from `stock`.
    Update { stock: Option<StockEntry> },
    PatchAndGet { diffs: Vec<Diff>, date: u64 },
    /// Patch the existing copy, or write `initial` and patch it.
    PatchOrAddAndGet {
        initial: Chunk,
        diffs: Vec<Diff>,
        date: u64,
    },
}

impl ChunkAction {
    pub fn name(&self) -> &'static str {
        match self {
            ChunkAction::Get => "get",
            ChunkAction::Add { .. } => "add",
            ChunkAction::Patch { .. } => "patch",
            ChunkAction::Update { .. } => "update",
            ChunkAction::PatchAndGet { .. } => "patch_and_get",
            ChunkAction::PatchOrAddAndGet { .. } => "patch_or_add_and_get",
        }
    }

    pub fn is_mutation(&self) -> bool {
        !matches!(self, ChunkAction::Get | ChunkAction::Update { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// The requester announces its own ring position.
    AddressAccess { address: Address },
    /// Who owns `target`, and whom do you know near it?
    PeerAccess { target: Address },
    CheckDemand {
        range: AddressRange,
        candidates: Vec<StockEntry>,
    },
    CheckOneDemand { entry: StockEntry },
    Backup { chunk: Chunk },
    /// Full chunk, or diffs since `since` for growing chunks.
    Recovery { id: ChunkId, since: Option<u64> },
    Chunk { id: ChunkId, action: ChunkAction },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::AddressAccess { .. } => "address_access",
            Request::PeerAccess { .. } => "peer_access",
            Request::CheckDemand { .. } => "check_demand",
            Request::CheckOneDemand { .. } => "check_one_demand",
            Request::Backup { .. } => "backup",
            Request::Recovery { .. } => "recovery",
            Request::Chunk { action, .. } => action.name(),
        }
    }

    /// Chunk content travels on the bulk channel.
    pub fn channel(&self) -> Channel {
        match self {
            Request::Backup { .. } => Channel::Bulk,
            Request::Chunk { action, .. } if action.is_mutation() => Channel::Bulk,
            _ => Channel::Control,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Status(Outcome),
    /// `owner == None` means the responder itself.
    Access {
        owner: Option<PeerRecord>,
        peers: Vec<PeerRecord>,
    },
    Demands {
        demands: Vec<StockEntry>,
        offers: Vec<StockEntry>,
    },
    Demand(bool),
    Chunk(Chunk),
    Diff {
        id: ChunkId,
        base: u64,
        diffs: Vec<Diff>,
        date: u64,
        hash: ChunkHash,
    },
}

impl Reply {
    pub fn name(&self) -> &'static str {
        match self {
            Reply::Status(_) => "status",
            Reply::Access { .. } => "access",
            Reply::Demands { .. } => "demands",
            Reply::Demand(_) => "demand",
            Reply::Chunk(_) => "chunk",
            Reply::Diff { .. } => "diff",
        }
    }

    pub fn channel(&self) -> Channel {
        match self {
            Reply::Chunk(_) | Reply::Diff { .. } => Channel::Bulk,
            _ => Channel::Control,
        }
    }

    /// The explicit status carried by the reply, if it is a bare status.
    pub fn status(&self) -> Option<Outcome> {
        match self {
            Reply::Status(outcome) => Some(*outcome),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Body {
    Request(Request),
    Reply(Reply),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub session: SessionId,
    pub body: Body,
}

impl Envelope {
    pub fn request(session: SessionId, request: Request) -> Self {
        Self {
            session,
            body: Body::Request(request),
        }
    }

    pub fn reply(session: SessionId, reply: Reply) -> Self {
        Self {
            session,
            body: Body::Reply(reply),
        }
    }

    pub fn channel(&self) -> Channel {
        match &self.body {
            Body::Request(request) => request.channel(),
            Body::Reply(reply) => reply.channel(),
        }
    }
}
