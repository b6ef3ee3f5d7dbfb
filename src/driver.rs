//! In-process driver: owns every party, sequences the four rounds, and
//! moves messages between the clients and the aggregator.
//!
//! The driver stands in for the transport: delivery within a round is
//! synchronous, bundles are maps, and ordering inside a bundle carries no
//! meaning. Dropouts are simulated by putting a client down between rounds;
//! a down client simply stops producing messages and the aggregator's
//! membership sets shrink accordingly.

use std::collections::BTreeMap;

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tracing::debug;

use crate::aggregator::Aggregator;
use crate::client::Client;
use crate::error::AggError;
use crate::messages::{ClientId, Roster, SealedShares, FIXED_POINT_SCALE};

pub struct Driver {
    clients: Vec<Client>,
    aggregator: Aggregator,
    round1_bundles: BTreeMap<ClientId, BTreeMap<ClientId, SealedShares>>,
}

impl Driver {
    /// Builds one client per secret plus the aggregator. Every bit of
    /// randomness in the run (identifiers, keys, seeds, IVs, Shamir
    /// polynomials) derives from `master_seed`, so equal seeds reproduce
    /// identical transcripts.
    pub fn new(secrets: &[f64], t: usize, master_seed: u64) -> Result<Self, AggError> {
        let n = secrets.len();
        let mut seeder = ChaCha20Rng::seed_from_u64(master_seed);
        let mut clients = Vec::with_capacity(n);
        for &secret in secrets {
            let id = ClientId::random(&mut seeder);
            let mut rng_seed = [0u8; 32];
            seeder.fill_bytes(&mut rng_seed);
            clients.push(Client::new(id, secret, n, t, rng_seed)?);
        }
        let aggregator = Aggregator::new(n, t)?;
        Ok(Driver {
            clients,
            aggregator,
            round1_bundles: BTreeMap::new(),
        })
    }

    /// Simulates a fail-stop dropout of the `index`-th client.
    pub fn put_down(&mut self, index: usize) {
        self.clients[index].put_down();
    }

    pub fn client_id(&self, index: usize) -> ClientId {
        self.clients[index].id()
    }

    /// Round 0: clients announce key pairs, the aggregator broadcasts the
    /// roster back.
    pub fn round0(&mut self) -> Result<(), AggError> {
        let mut announcements = Roster::new();
        for client in self.clients.iter_mut() {
            if let Some(keys) = client.round0() {
                announcements.insert(client.id(), keys);
            }
        }
        let roster = self.aggregator.round0(announcements)?;
        for client in self.clients.iter_mut() {
            client.receive_clients(&roster)?;
        }
        Ok(())
    }

    /// Round 1: clients seal Shamir shares for every peer, the aggregator
    /// pivots them into per-recipient bundles.
    pub fn round1(&mut self) -> Result<(), AggError> {
        let mut outboxes = BTreeMap::new();
        for client in self.clients.iter_mut() {
            if let Some(outbox) = client.round1()? {
                outboxes.insert(client.id(), outbox);
            }
        }
        self.round1_bundles = self.aggregator.round1(outboxes)?;
        for client in self.clients.iter_mut() {
            if let Some(bundle) = self.round1_bundles.get(&client.id()) {
                client.receive_ciphertexts(bundle.clone())?;
            }
        }
        Ok(())
    }

    /// Round 2: clients deliver masked contributions, the aggregator sums
    /// them and circulates the survivor list.
    pub fn round2(&mut self) -> Result<(), AggError> {
        let mut masked = BTreeMap::new();
        for client in self.clients.iter_mut() {
            if let Some(value) = client.round2()? {
                masked.insert(client.id(), value);
            }
        }
        let survivors = self.aggregator.round2(masked)?;
        for client in self.clients.iter_mut() {
            if client.is_up() && survivors.contains(&client.id()) {
                client.receive_survivors(&survivors)?;
            }
        }
        Ok(())
    }

    /// Round 3: clients disclose share material, the aggregator unmasks and
    /// returns the mean of the surviving secrets.
    pub fn round3(&mut self) -> Result<f64, AggError> {
        let mut responses = BTreeMap::new();
        for client in self.clients.iter_mut() {
            if let Some(disclosures) = client.round3()? {
                responses.insert(client.id(), disclosures);
            }
        }
        debug!(responders = responses.len(), "round 3 responses collected");
        self.aggregator.round3(responses)
    }

    /// Runs all four rounds back to back.
    pub fn run(&mut self) -> Result<f64, AggError> {
        self.round0()?;
        self.round1()?;
        self.round2()?;
        self.round3()
    }

    /// Plaintext fixed-point mean over the survivor set. Reveals the inputs;
    /// only meant for validating protocol runs.
    pub fn aggregate_without_secrecy(&self) -> f64 {
        let survivors = self.aggregator.survivors();
        let total: i64 = self
            .clients
            .iter()
            .filter(|c| survivors.contains(&c.id()))
            .map(|c| (c.secret() * FIXED_POINT_SCALE).round() as i64)
            .sum();
        total as f64 / FIXED_POINT_SCALE / survivors.len() as f64
    }

    /// Pivoted round-1 bundles, kept for transcript comparison.
    pub fn round1_bundles(&self) -> &BTreeMap<ClientId, BTreeMap<ClientId, SealedShares>> {
        &self.round1_bundles
    }

    /// Wrapping masked sum held by the aggregator after round 2.
    pub fn masked_sum(&self) -> i32 {
        self.aggregator.masked_sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_point_mean(secrets: &[f64]) -> f64 {
        let total: i64 = secrets
            .iter()
            .map(|s| (s * FIXED_POINT_SCALE).round() as i64)
            .sum();
        total as f64 / FIXED_POINT_SCALE / secrets.len() as f64
    }

    const SECRETS: [f64; 4] = [131070.2132, 3.14159265, -42.0, 6.0];

    #[test]
    fn test_full_run_without_dropouts() {
        let mut driver = Driver::new(&SECRETS, 2, 1).unwrap();
        let mean = driver.run().unwrap();

        let expected = fixed_point_mean(&SECRETS);
        assert!((mean - expected).abs() < 1e-9, "got {}, want {}", mean, expected);
        assert!((mean - 32759.3387).abs() < 1e-4);
        assert!((mean - driver.aggregate_without_secrecy()).abs() < 1e-9);
    }

    #[test]
    fn test_dropout_after_share_distribution() {
        let mut driver = Driver::new(&SECRETS, 2, 2).unwrap();
        driver.round0().unwrap();
        driver.round1().unwrap();
        driver.put_down(0);
        driver.round2().unwrap();
        let mean = driver.round3().unwrap();

        let expected = fixed_point_mean(&SECRETS[1..]);
        assert!((mean - expected).abs() < 1e-9, "got {}, want {}", mean, expected);
        assert!((mean - (-10.9528)).abs() < 1e-4);
    }

    #[test]
    fn test_dropout_before_share_distribution() {
        // A client that dies after announcing keys never distributes shares,
        // so nobody masks against it and nothing about it is reconstructed.
        let mut driver = Driver::new(&SECRETS, 2, 11).unwrap();
        driver.round0().unwrap();
        driver.put_down(1);
        driver.round1().unwrap();
        driver.round2().unwrap();
        let mean = driver.round3().unwrap();

        let survivors = [SECRETS[0], SECRETS[2], SECRETS[3]];
        assert!((mean - fixed_point_mean(&survivors)).abs() < 1e-9);
    }

    #[test]
    fn test_dropout_after_masking_keeps_all_survivors() {
        // A client that disappears between rounds 2 and 3 already delivered
        // its masked value, so it stays in the survivor set and its
        // self-mask is recovered from the other clients' shares.
        let secrets = [1.0, 2.0, 3.0, 4.0, 5.0];
        let mut driver = Driver::new(&secrets, 3, 3).unwrap();
        driver.round0().unwrap();
        driver.round1().unwrap();
        driver.round2().unwrap();
        driver.put_down(4);
        let mean = driver.round3().unwrap();

        assert!((mean - fixed_point_mean(&secrets)).abs() < 1e-9);
        assert!((mean - driver.aggregate_without_secrecy()).abs() < 1e-9);
    }

    #[test]
    fn test_mass_dropout_aborts_at_round2() {
        let secrets = [1.0, 2.0, 3.0, 4.0, 5.0];
        let mut driver = Driver::new(&secrets, 3, 4).unwrap();
        driver.round0().unwrap();
        driver.round1().unwrap();
        driver.put_down(0);
        driver.put_down(1);
        driver.put_down(2);
        assert!(matches!(
            driver.round2(),
            Err(AggError::BelowThreshold(_))
        ));
    }

    #[test]
    fn test_two_party_dropout_always_aborts() {
        let mut driver = Driver::new(&[10.0, 20.0], 2, 5).unwrap();
        driver.put_down(1);
        assert!(matches!(driver.round0(), Err(AggError::BelowThreshold(_))));

        let mut driver = Driver::new(&[10.0, 20.0], 2, 6).unwrap();
        driver.round0().unwrap();
        driver.round1().unwrap();
        driver.put_down(0);
        assert!(matches!(driver.round2(), Err(AggError::BelowThreshold(_))));
    }

    #[test]
    fn test_dropout_before_final_round_aborts() {
        let secrets = [1.0, 2.0, 3.0, 4.0];
        let mut driver = Driver::new(&secrets, 3, 7).unwrap();
        driver.round0().unwrap();
        driver.round1().unwrap();
        driver.round2().unwrap();
        driver.put_down(0);
        driver.put_down(1);
        assert!(matches!(
            driver.round3(),
            Err(AggError::BelowThreshold(_))
        ));
    }

    #[test]
    fn test_double_dropout_recovery() {
        let secrets: Vec<f64> = (0..10).map(|i| (i as f64) * 1.25 - 3.0).collect();
        let mut driver = Driver::new(&secrets, 5, 8).unwrap();
        driver.round0().unwrap();
        driver.round1().unwrap();
        driver.put_down(3);
        driver.put_down(7);
        driver.round2().unwrap();
        let mean = driver.round3().unwrap();

        let survivors: Vec<f64> = secrets
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != 3 && *i != 7)
            .map(|(_, s)| *s)
            .collect();
        assert!((mean - fixed_point_mean(&survivors)).abs() < 1e-9);
        assert!((mean - driver.aggregate_without_secrecy()).abs() < 1e-4);
    }

    #[test]
    fn test_fixed_seed_reproduces_transcript() {
        let mut first = Driver::new(&SECRETS, 2, 42).unwrap();
        let mut second = Driver::new(&SECRETS, 2, 42).unwrap();

        first.round0().unwrap();
        second.round0().unwrap();
        first.round1().unwrap();
        second.round1().unwrap();
        assert_eq!(first.round1_bundles(), second.round1_bundles());

        first.round2().unwrap();
        second.round2().unwrap();
        assert_eq!(first.masked_sum(), second.masked_sum());

        let mean_a = first.round3().unwrap();
        let mean_b = second.round3().unwrap();
        assert_eq!(mean_a, mean_b);
    }

    #[test]
    fn test_different_seeds_change_transcript_not_result() {
        let mut first = Driver::new(&SECRETS, 2, 100).unwrap();
        let mut second = Driver::new(&SECRETS, 2, 101).unwrap();

        first.round0().unwrap();
        second.round0().unwrap();
        first.round1().unwrap();
        second.round1().unwrap();
        assert_ne!(first.round1_bundles(), second.round1_bundles());

        first.round2().unwrap();
        second.round2().unwrap();
        let mean_a = first.round3().unwrap();
        let mean_b = second.round3().unwrap();
        assert!((mean_a - mean_b).abs() < 1e-9);
    }

    #[test]
    fn test_tampered_ciphertext_fails_at_recipient() {
        // Hand-wired run so the bundle can be corrupted in flight.
        let secrets = [5.0, 6.0, 7.0];
        let mut seeder = ChaCha20Rng::seed_from_u64(9);
        let mut clients: Vec<Client> = secrets
            .iter()
            .map(|&secret| {
                let id = ClientId::random(&mut seeder);
                let mut rng_seed = [0u8; 32];
                seeder.fill_bytes(&mut rng_seed);
                Client::new(id, secret, 3, 2, rng_seed).unwrap()
            })
            .collect();
        let mut aggregator = Aggregator::new(3, 2).unwrap();

        let announcements: Roster = clients
            .iter_mut()
            .map(|c| (c.id(), c.round0().unwrap()))
            .collect();
        let roster = aggregator.round0(announcements).unwrap();
        for client in clients.iter_mut() {
            client.receive_clients(&roster).unwrap();
        }

        let outboxes = clients
            .iter_mut()
            .map(|c| (c.id(), c.round1().unwrap().unwrap()))
            .collect();
        let mut inboxes = aggregator.round1(outboxes).unwrap();

        let victim = clients[0].id();
        let bundle = inboxes.get_mut(&victim).unwrap();
        let (_, sealed) = bundle.iter_mut().next().unwrap();
        sealed.ciphertext[0] ^= 0xff;

        for client in clients.iter_mut() {
            client
                .receive_ciphertexts(inboxes[&client.id()].clone())
                .unwrap();
        }
        let masked = clients
            .iter_mut()
            .map(|c| (c.id(), c.round2().unwrap().unwrap()))
            .collect();
        let survivors = aggregator.round2(masked).unwrap();
        for client in clients.iter_mut() {
            client.receive_survivors(&survivors).unwrap();
        }

        let tampered = clients
            .iter_mut()
            .find(|c| c.id() == victim)
            .unwrap()
            .round3();
        assert!(matches!(tampered, Err(AggError::DecryptionFailed(_))));
    }
}
