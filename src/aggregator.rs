//! Aggregator side: membership tracking, masked-sum accumulation, unmasking.
//!
//! The aggregator never sees a plaintext contribution. It routes round-1
//! ciphertexts, sums the masked round-2 values in wrapping 32-bit
//! arithmetic, and in round 3 rebuilds exactly two kinds of material from
//! Shamir shares: the mask private keys of clients that dropped after
//! distributing shares (to cancel their orphaned pairwise masks) and the
//! self-mask seeds of clients that survived (to strip their self-masks).
//!
//! Membership shrinks monotonically: U1 (announced keys) ⊇ U2 (delivered
//! ciphertexts) ⊇ U3 (delivered masked values) ⊇ U4 (disclosed shares).
//! Every round refuses to run once its input set is below the threshold.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use crate::crypto::{self, KeyPair, MaskPrng};
use crate::error::AggError;
use crate::messages::{
    ClientId, Roster, SealedShares, ShareDisclosure, ShareKind, FIXED_POINT_SCALE,
};
use crate::shamir::{self, Share};

/// Protocol phase; transitions are strictly monotone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    Registered,
    SharesRouted,
    Summed,
    Done,
}

pub struct Aggregator {
    t: usize,
    phase: Phase,
    roster: Roster,
    u2: BTreeSet<ClientId>,
    u3: BTreeSet<ClientId>,
    u4: BTreeSet<ClientId>,
    sum: i32,
}

impl Aggregator {
    pub fn new(n: usize, t: usize) -> Result<Self, AggError> {
        if t < 2 || t > n {
            return Err(AggError::InvalidParameter(format!(
                "threshold {} must be in 2..={}",
                t, n
            )));
        }
        Ok(Aggregator {
            t,
            phase: Phase::Init,
            roster: Roster::new(),
            u2: BTreeSet::new(),
            u3: BTreeSet::new(),
            u4: BTreeSet::new(),
            sum: 0,
        })
    }

    fn advance(&mut self, expected: Phase, next: Phase) -> Result<(), AggError> {
        if self.phase != expected {
            return Err(AggError::ProtocolViolation(format!(
                "expected phase {:?}, currently in {:?}",
                expected, self.phase
            )));
        }
        self.phase = next;
        Ok(())
    }

    /// Round 0: registers every announcing client and returns the roster to
    /// broadcast back to all of them.
    pub fn round0(&mut self, announcements: Roster) -> Result<Roster, AggError> {
        self.advance(Phase::Init, Phase::Registered)?;
        if announcements.len() < self.t {
            return Err(AggError::BelowThreshold(format!(
                "{} clients announced keys, threshold is {}",
                announcements.len(),
                self.t
            )));
        }
        info!(clients = announcements.len(), "round 0: roster registered");
        self.roster = announcements;
        Ok(self.roster.clone())
    }

    /// Round 1: pivots the per-sender outboxes into per-recipient inboxes.
    /// The senders form the second membership set.
    pub fn round1(
        &mut self,
        outboxes: BTreeMap<ClientId, BTreeMap<ClientId, SealedShares>>,
    ) -> Result<BTreeMap<ClientId, BTreeMap<ClientId, SealedShares>>, AggError> {
        self.advance(Phase::Registered, Phase::SharesRouted)?;
        for sender in outboxes.keys() {
            if !self.roster.contains_key(sender) {
                return Err(AggError::MembershipViolation(format!(
                    "outbox from unregistered client {}",
                    sender
                )));
            }
        }
        self.u2 = outboxes.keys().copied().collect();
        if self.u2.len() < self.t {
            return Err(AggError::BelowThreshold(format!(
                "{} clients delivered ciphertexts, threshold is {}",
                self.u2.len(),
                self.t
            )));
        }

        let mut inboxes: BTreeMap<ClientId, BTreeMap<ClientId, SealedShares>> = BTreeMap::new();
        for (sender, outbox) in outboxes {
            for (recipient, sealed) in outbox {
                if recipient != sender && self.u2.contains(&recipient) {
                    inboxes.entry(recipient).or_default().insert(sender, sealed);
                }
            }
        }
        debug!(recipients = inboxes.len(), "round 1: ciphertexts routed");
        Ok(inboxes)
    }

    /// Round 2: folds the masked contributions into the wrapping 32-bit
    /// accumulator and returns the survivor list.
    pub fn round2(&mut self, masked: BTreeMap<ClientId, i32>) -> Result<Vec<ClientId>, AggError> {
        self.advance(Phase::SharesRouted, Phase::Summed)?;
        for sender in masked.keys() {
            if !self.u2.contains(sender) {
                return Err(AggError::MembershipViolation(format!(
                    "masked value from client {} outside the share exchange",
                    sender
                )));
            }
        }
        self.u3 = masked.keys().copied().collect();
        if self.u3.len() < self.t {
            return Err(AggError::BelowThreshold(format!(
                "{} clients delivered masked values, threshold is {}",
                self.u3.len(),
                self.t
            )));
        }

        self.sum = masked.values().fold(0i32, |acc, m| acc.wrapping_add(*m));
        info!(survivors = self.u3.len(), "round 2: masked sum accumulated");
        Ok(self.u3.iter().copied().collect())
    }

    /// Round 3: reconstructs the unmasking material from the disclosed
    /// shares and returns the mean of the surviving secrets.
    ///
    /// Pairwise masks of dropped clients are removed before self-masks of
    /// survivors; the order is fixed only so that transcripts are
    /// reproducible.
    pub fn round3(
        &mut self,
        responses: BTreeMap<ClientId, BTreeMap<ClientId, ShareDisclosure>>,
    ) -> Result<f64, AggError> {
        self.advance(Phase::Summed, Phase::Done)?;
        for responder in responses.keys() {
            if !self.u3.contains(responder) {
                return Err(AggError::MembershipViolation(format!(
                    "share response from client {} outside the survivor set",
                    responder
                )));
            }
        }
        self.u4 = responses.keys().copied().collect();
        if self.u4.len() < self.t {
            return Err(AggError::BelowThreshold(format!(
                "{} clients disclosed shares, threshold is {}",
                self.u4.len(),
                self.t
            )));
        }

        let mut sum = self.sum;

        let dropped: Vec<ClientId> = self.u2.difference(&self.u3).copied().collect();
        for dead in &dropped {
            let key_bytes = self.reconstruct_for(&responses, *dead, ShareKind::Key)?;
            let key: [u8; 32] = key_bytes.try_into().map_err(|bytes: Vec<u8>| {
                AggError::ReconstructionFailed(format!(
                    "recovered {} bytes for client {}, expected a 32-byte key",
                    bytes.len(),
                    dead
                ))
            })?;
            let mask_keys = KeyPair::from_secret_bytes(key);

            // Each survivor folded one draw of the (dead, survivor) stream
            // into its contribution; replay the draw with the opposite sign.
            for survivor in &self.u3 {
                let peer = &self.roster[survivor];
                let seed = crypto::pairwise_mask_seed(&mask_keys, &peer.mask_pk);
                let draw = MaskPrng::from_seed(i64::from(seed)).next_mask() as i32;
                if *survivor < *dead {
                    sum = sum.wrapping_add(draw);
                } else {
                    sum = sum.wrapping_sub(draw);
                }
            }
            debug!(client = %dead, "round 3: pairwise masks of dropped client removed");
        }

        let survivors: Vec<ClientId> = self.u3.iter().copied().collect();
        for alive in &survivors {
            let seed_bytes = self.reconstruct_for(&responses, *alive, ShareKind::Seed)?;
            let seed: [u8; 4] = seed_bytes.try_into().map_err(|bytes: Vec<u8>| {
                AggError::ReconstructionFailed(format!(
                    "recovered {} bytes for client {}, expected a 4-byte seed",
                    bytes.len(),
                    alive
                ))
            })?;
            let draw = MaskPrng::from_seed(i64::from(u32::from_le_bytes(seed))).next_mask() as i32;
            sum = sum.wrapping_sub(draw);
        }

        let mean = sum as f64 / FIXED_POINT_SCALE / self.u3.len() as f64;
        info!(
            dropped = dropped.len(),
            survivors = self.u3.len(),
            mean,
            "round 3: aggregate unmasked"
        );
        Ok(mean)
    }

    /// Gathers the disclosed shares of `target`'s sharing of `kind` and runs
    /// Shamir reconstruction over the first `t` of them.
    fn reconstruct_for(
        &self,
        responses: &BTreeMap<ClientId, BTreeMap<ClientId, ShareDisclosure>>,
        target: ClientId,
        kind: ShareKind,
    ) -> Result<Vec<u8>, AggError> {
        let mut by_index: BTreeMap<u8, Share> = BTreeMap::new();
        for (responder, disclosures) in responses {
            let Some(disclosure) = disclosures.get(&target) else {
                continue;
            };
            if disclosure.kind != kind {
                warn!(
                    responder = %responder,
                    target = %target,
                    "ignoring share of unexpected kind"
                );
                continue;
            }
            by_index.entry(disclosure.index).or_insert_with(|| Share {
                index: disclosure.index,
                bytes: disclosure.bytes.clone(),
            });
        }

        if by_index.len() < self.t {
            return Err(AggError::ReconstructionFailed(format!(
                "{} usable shares for client {}, need {}",
                by_index.len(),
                target,
                self.t
            )));
        }
        let shares: Vec<Share> = by_index.into_values().take(self.t).collect();
        shamir::reconstruct(&shares)
    }

    /// Survivor set fixed at the end of round 2.
    pub fn survivors(&self) -> &BTreeSet<ClientId> {
        &self.u3
    }

    /// Wrapping masked sum accumulated in round 2.
    pub fn masked_sum(&self) -> i32 {
        self.sum
    }
}
