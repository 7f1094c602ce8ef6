//! # Node Identities and Peer Records
//!
//! - [`Keypair`]: Ed25519 signing keypair owned by the local node
//! - [`Identity`]: 32-byte public key serving as the peer's unique identifier
//! - [`PeerRecord`]: an identity together with the endpoint it is reachable at
//!
//! ## Identity Model
//!
//! **Identity = Ed25519 Public Key.** Identities are stable for the lifetime of a
//! session, which is what allows address calculators to memoize the
//! identity→address mapping (see [`crate::address`]).
//!
//! A peer's ring position is never carried on the wire as an authority: it is
//! recomputed locally from the identity, and a peer announcing a different
//! position is treated as spoofing.

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Returns current time as milliseconds since Unix epoch.
/// Used for chunk version markers and log timestamps.
#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn identity(&self) -> Identity {
        Identity::from_bytes(self.public_key_bytes())
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &hex::encode(self.identity().as_bytes()))
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Short hex prefix used in log fields.
    #[inline]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// Check that this identity is a usable Ed25519 public key.
    ///
    /// Rejects the trivially invalid all-zero and all-0xFF patterns before
    /// attempting point decompression.
    #[inline]
    pub fn is_valid(&self) -> bool {
        if self.0.iter().all(|&b| b == 0) || self.0.iter().all(|&b| b == 0xFF) {
            return false;
        }
        VerifyingKey::try_from(self.0.as_slice()).is_ok()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for Identity {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Identity {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A peer as seen by the overlay: who it is and where to send mail.
///
/// Equality and hashing consider the identity only; the same peer seen at a new
/// endpoint is still the same peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerRecord {
    pub identity: Identity,
    pub endpoint: SocketAddr,
}

impl PeerRecord {
    pub fn new(identity: Identity, endpoint: SocketAddr) -> Self {
        Self { identity, endpoint }
    }
}

impl PartialEq for PeerRecord {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity
    }
}

impl Eq for PeerRecord {}

impl std::hash::Hash for PeerRecord {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.identity.hash(state);
    }
}
