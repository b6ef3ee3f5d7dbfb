//! Client side of the four-round aggregation protocol.
//!
//! A client contributes one private scalar per run. Round 0 announces key
//! material, round 1 distributes encrypted Shamir shares of the two local
//! seeds, round 2 submits the doubly masked contribution, and round 3
//! discloses the share material the aggregator needs to unmask: self-mask
//! seed shares for peers that survived, mask-key shares for peers that
//! dropped after distributing their shares.
//!
//! A client marked down with [`Client::put_down`] stays down; its round
//! methods turn into no-ops, which is how the driver simulates fail-stop
//! dropouts.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tracing::debug;

use crate::crypto::{self, KeyPair, MaskPrng};
use crate::error::AggError;
use crate::messages::{
    ClientId, PeerKeys, Roster, SealedShares, ShareDisclosure, ShareKind, SharePayload,
    FIXED_POINT_SCALE,
};
use crate::shamir::{self, Share};

/// Pairwise state derived once per peer in round 1.
struct PeerSession {
    mask_seed: i16,
    cipher_key: [u8; 32],
}

/// One protocol participant.
pub struct Client {
    id: ClientId,
    secret: f64,
    t: usize,
    rng: ChaCha20Rng,
    down: bool,

    mask_keys: Option<KeyPair>,
    cipher_keys: Option<KeyPair>,

    /// Snapshot of the aggregator's round-0 roster (includes self).
    roster: Roster,
    sessions: BTreeMap<ClientId, PeerSession>,

    self_seed: Option<u32>,
    own_index: u8,
    own_seed_share: Option<Share>,

    /// Sealed blobs received after round 1, decrypted only in round 3.
    inbox: BTreeMap<ClientId, SealedShares>,
    u2_local: BTreeSet<ClientId>,
    u3_local: BTreeSet<ClientId>,
}

impl Client {
    /// Creates a client holding `secret`, for a run of `n` parties with
    /// reconstruction threshold `t`. All of the client's randomness (keys,
    /// seeds, IVs, Shamir polynomials) is drawn from `rng_seed`.
    pub fn new(
        id: ClientId,
        secret: f64,
        n: usize,
        t: usize,
        rng_seed: [u8; 32],
    ) -> Result<Self, AggError> {
        if t < 2 || t > n {
            return Err(AggError::InvalidParameter(format!(
                "threshold {} must be in 2..={}",
                t, n
            )));
        }
        Ok(Client {
            id,
            secret,
            t,
            rng: ChaCha20Rng::from_seed(rng_seed),
            down: false,
            mask_keys: None,
            cipher_keys: None,
            roster: Roster::new(),
            sessions: BTreeMap::new(),
            self_seed: None,
            own_index: 0,
            own_seed_share: None,
            inbox: BTreeMap::new(),
            u2_local: BTreeSet::new(),
            u3_local: BTreeSet::new(),
        })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn secret(&self) -> f64 {
        self.secret
    }

    pub fn is_up(&self) -> bool {
        !self.down
    }

    /// Marks the client fail-stop. Once down, never comes up.
    pub fn put_down(&mut self) {
        debug!(client = %self.id, "client going down");
        self.down = true;
    }

    /// Round 0: generates the mask and cipher key pairs and announces the
    /// public halves.
    pub fn round0(&mut self) -> Option<PeerKeys> {
        if self.down {
            return None;
        }
        let mask_keys = KeyPair::generate(&mut self.rng);
        let cipher_keys = KeyPair::generate(&mut self.rng);
        let announcement = PeerKeys {
            mask_pk: mask_keys.public_bytes(),
            cipher_pk: cipher_keys.public_bytes(),
        };
        self.mask_keys = Some(mask_keys);
        self.cipher_keys = Some(cipher_keys);
        Some(announcement)
    }

    /// Accepts the aggregator's roster broadcast and records it as the
    /// local view of the first membership set.
    pub fn receive_clients(&mut self, roster: &Roster) -> Result<(), AggError> {
        if self.down {
            return Ok(());
        }
        if roster.len() < self.t {
            return Err(AggError::TooFewClients(format!(
                "roster has {} clients, threshold is {}",
                roster.len(),
                self.t
            )));
        }

        let mut seen = HashSet::with_capacity(roster.len() * 2);
        for (peer, keys) in roster {
            if !seen.insert(keys.mask_pk) || !seen.insert(keys.cipher_pk) {
                return Err(AggError::KeyCollision(format!(
                    "client {} announced a public key already in use",
                    peer
                )));
            }
        }
        if !roster.contains_key(&self.id) {
            return Err(AggError::MembershipViolation(format!(
                "own id {} missing from roster",
                self.id
            )));
        }

        self.roster = roster.clone();
        Ok(())
    }

    /// Round 1: samples the self-mask seed, Shamir-splits it together with
    /// the exported mask private key, derives the pairwise material for
    /// every peer, and returns one sealed share payload per peer.
    pub fn round1(&mut self) -> Result<Option<BTreeMap<ClientId, SealedShares>>, AggError> {
        if self.down {
            return Ok(None);
        }
        let mask_secret;
        let mut derived: BTreeMap<ClientId, (i16, [u8; 32])> = BTreeMap::new();
        {
            let mask_keys = self
                .mask_keys
                .as_ref()
                .ok_or_else(|| AggError::ProtocolViolation("round 1 before round 0".to_string()))?;
            let cipher_keys = self
                .cipher_keys
                .as_ref()
                .ok_or_else(|| AggError::ProtocolViolation("round 1 before round 0".to_string()))?;
            mask_secret = mask_keys.secret_bytes();
            for (peer, keys) in &self.roster {
                if *peer == self.id {
                    continue;
                }
                derived.insert(
                    *peer,
                    (
                        crypto::pairwise_mask_seed(mask_keys, &keys.mask_pk),
                        crypto::pairwise_cipher_key(cipher_keys, &keys.cipher_pk),
                    ),
                );
            }
        }

        let group_size = self.roster.len();
        let self_seed = self.rng.next_u32();
        let key_shares = shamir::split(&mask_secret, group_size, self.t, &mut self.rng)?;
        let seed_shares =
            shamir::split(&self_seed.to_le_bytes(), group_size, self.t, &mut self.rng)?;

        // Share index of a party is its 1-based rank in the sorted roster.
        let order: Vec<ClientId> = self.roster.keys().copied().collect();
        let mut outbox = BTreeMap::new();
        for (rank0, peer) in order.iter().enumerate() {
            if *peer == self.id {
                self.own_index = (rank0 + 1) as u8;
                self.own_seed_share = Some(seed_shares[rank0].clone());
                continue;
            }
            let (mask_seed, cipher_key) = derived[peer];
            let payload = SharePayload {
                sender: self.id,
                recipient: *peer,
                key_share: key_shares[rank0].bytes.clone(),
                seed_share: seed_shares[rank0].bytes.clone(),
                index: (rank0 + 1) as u8,
            };
            let (ciphertext, iv) =
                crypto::aead_encrypt(&cipher_key, &payload.encode()?, &mut self.rng)?;
            outbox.insert(*peer, SealedShares { ciphertext, iv });
            self.sessions
                .insert(*peer, PeerSession { mask_seed, cipher_key });
        }

        self.self_seed = Some(self_seed);
        debug!(client = %self.id, peers = outbox.len(), "round 1 shares sealed");
        Ok(Some(outbox))
    }

    /// Accepts the pivoted bundle of ciphertexts addressed to this client.
    /// The set of senders becomes the local view of the second membership
    /// set; the blobs themselves stay sealed until round 3.
    pub fn receive_ciphertexts(
        &mut self,
        bundle: BTreeMap<ClientId, SealedShares>,
    ) -> Result<(), AggError> {
        if self.down {
            return Ok(());
        }
        if bundle.len() + 1 < self.t {
            return Err(AggError::TooFewCiphertexts(format!(
                "received {} ciphertexts, need at least {}",
                bundle.len(),
                self.t - 1
            )));
        }
        for sender in bundle.keys() {
            if !self.sessions.contains_key(sender) {
                return Err(AggError::MembershipViolation(format!(
                    "ciphertext from unknown client {}",
                    sender
                )));
            }
        }

        self.u2_local = bundle.keys().copied().collect();
        self.inbox = bundle;
        Ok(())
    }

    /// Round 2: computes the doubly masked contribution.
    ///
    /// All arithmetic wraps in 32 bits. Each pairwise mask enters with
    /// opposite signs on the two sides of the pair (the lower id adds, the
    /// higher id subtracts), so the masks cancel in the honest sum; the
    /// self-mask is always added and removed later by the aggregator.
    pub fn round2(&mut self) -> Result<Option<i32>, AggError> {
        if self.down {
            return Ok(None);
        }
        let self_seed = self
            .self_seed
            .ok_or_else(|| AggError::ProtocolViolation("round 2 before round 1".to_string()))?;

        let mut masked = (self.secret * FIXED_POINT_SCALE).round() as i64 as i32;
        for peer in &self.u2_local {
            let session = self.sessions.get(peer).ok_or_else(|| {
                AggError::MembershipViolation(format!("no session for client {}", peer))
            })?;
            let draw = MaskPrng::from_seed(i64::from(session.mask_seed)).next_mask() as i32;
            if *peer > self.id {
                masked = masked.wrapping_sub(draw);
            } else {
                masked = masked.wrapping_add(draw);
            }
        }
        masked = masked.wrapping_add(MaskPrng::from_seed(i64::from(self_seed)).next_mask() as i32);

        debug!(client = %self.id, "round 2 contribution masked");
        Ok(Some(masked))
    }

    /// Accepts the aggregator's survivor list (third membership set).
    pub fn receive_survivors(&mut self, survivors: &[ClientId]) -> Result<(), AggError> {
        if self.down {
            return Ok(());
        }
        if survivors.len() < self.t {
            return Err(AggError::TooFewSurvivors(format!(
                "{} survivors, threshold is {}",
                survivors.len(),
                self.t
            )));
        }
        for id in survivors {
            if *id != self.id && !self.u2_local.contains(id) {
                return Err(AggError::MembershipViolation(format!(
                    "survivor {} never delivered a ciphertext",
                    id
                )));
            }
        }
        self.u3_local = survivors.iter().copied().collect();
        Ok(())
    }

    /// Round 3: opens every sealed blob from round 1 and discloses, per
    /// peer, the share the aggregator needs. Also includes the client's own
    /// self-mask seed share.
    pub fn round3(&mut self) -> Result<Option<BTreeMap<ClientId, ShareDisclosure>>, AggError> {
        if self.down {
            return Ok(None);
        }
        if self.u3_local.is_empty() {
            return Err(AggError::ProtocolViolation(
                "round 3 before the survivor list arrived".to_string(),
            ));
        }

        let mut disclosures = BTreeMap::new();
        for (sender, sealed) in &self.inbox {
            let session = self.sessions.get(sender).ok_or_else(|| {
                AggError::MembershipViolation(format!("no session for client {}", sender))
            })?;
            let plaintext = crypto::aead_decrypt(&session.cipher_key, &sealed.ciphertext, &sealed.iv)?;
            let payload = SharePayload::decode(&plaintext)?;
            if payload.sender != *sender || payload.recipient != self.id {
                return Err(AggError::CiphertextMisdirected(format!(
                    "blob from {} claims sender {} and recipient {}",
                    sender, payload.sender, payload.recipient
                )));
            }

            let disclosure = if self.u3_local.contains(sender) {
                ShareDisclosure {
                    bytes: payload.seed_share.clone(),
                    index: payload.index,
                    kind: ShareKind::Seed,
                }
            } else {
                ShareDisclosure {
                    bytes: payload.key_share.clone(),
                    index: payload.index,
                    kind: ShareKind::Key,
                }
            };
            disclosures.insert(*sender, disclosure);
        }

        let own_share = self
            .own_seed_share
            .as_ref()
            .ok_or_else(|| AggError::ProtocolViolation("round 3 before round 1".to_string()))?;
        disclosures.insert(
            self.id,
            ShareDisclosure {
                bytes: own_share.bytes.clone(),
                index: self.own_index,
                kind: ShareKind::Seed,
            },
        );

        debug!(client = %self.id, disclosed = disclosures.len(), "round 3 shares disclosed");
        Ok(Some(disclosures))
    }

    /// Pairwise mask seed derived for `peer`, if round 1 ran. Used by tests
    /// to check both sides of a pair agree.
    #[cfg(test)]
    pub(crate) fn mask_seed_with(&self, peer: &ClientId) -> Option<i16> {
        self.sessions.get(peer).map(|s| s.mask_seed)
    }
}
