//! Wire types exchanged between clients and the aggregator.
//!
//! The driver moves these values around as plain data; no transport is
//! implied. Formats are canonical: the encrypted share payload is encoded
//! with bincode, which is deterministic, so fixed randomness reproduces
//! byte-identical ciphertext bundles.

use std::collections::BTreeMap;
use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::IV_LENGTH;
use crate::error::AggError;

/// Fixed-point scale applied to client secrets before masking. Secrets keep
/// four decimal digits.
pub const FIXED_POINT_SCALE: f64 = 10_000.0;

/// 128-bit opaque client identifier.
///
/// The total order on identifiers drives the pairwise sign convention, so
/// every party must compare them the same way.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u128);

impl ClientId {
    pub fn random<R: RngCore>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 16];
        rng.fill_bytes(&mut bytes);
        ClientId(u128::from_le_bytes(bytes))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Leading 8 hex digits are enough to tell parties apart in logs.
        write!(f, "{}", &hex::encode(self.0.to_be_bytes())[..8])
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self)
    }
}

/// Public halves a client announces in round 0.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PeerKeys {
    /// X25519 public key whose exchanges seed the pairwise masks.
    pub mask_pk: [u8; 32],
    /// X25519 public key whose exchanges derive the pairwise AES keys.
    pub cipher_pk: [u8; 32],
}

/// Roster broadcast by the aggregator after round 0.
pub type Roster = BTreeMap<ClientId, PeerKeys>;

/// An encrypted pair of Shamir shares in transit between two clients.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SealedShares {
    pub ciphertext: Vec<u8>,
    pub iv: [u8; IV_LENGTH],
}

/// Plaintext carried inside a [`SealedShares`] blob.
///
/// `sender` and `recipient` are authenticated copies of the transport
/// routing; the recipient must reject a payload whose copies disagree with
/// the channel it arrived on.
#[derive(Serialize, Deserialize, Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharePayload {
    #[zeroize(skip)]
    pub sender: ClientId,
    #[zeroize(skip)]
    pub recipient: ClientId,
    /// The recipient's share of the sender's exported mask private key.
    pub key_share: Vec<u8>,
    /// The recipient's share of the sender's self-mask seed.
    pub seed_share: Vec<u8>,
    /// Shamir evaluation point of both shares (the recipient's rank).
    #[zeroize(skip)]
    pub index: u8,
}

impl SharePayload {
    pub fn encode(&self) -> Result<Vec<u8>, AggError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AggError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Which sharing a disclosed share belongs to.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShareKind {
    /// Share of a dropped peer's mask private key.
    Key,
    /// Share of a surviving peer's self-mask seed.
    Seed,
}

/// One share disclosed to the aggregator in round 3.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ShareDisclosure {
    pub bytes: Vec<u8>,
    pub index: u8,
    pub kind: ShareKind,
}
