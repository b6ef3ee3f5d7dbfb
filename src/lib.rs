//! Secure Aggregation
//!
//! This library implements the dropout-tolerant secure aggregation protocol
//! of Bonawitz et al. (CCS 2017) for scalar inputs: `n` clients and one
//! honest-but-curious aggregator jointly compute the mean of the clients'
//! private values, and no party learns any individual input beyond what the
//! sum reveals. The run survives fail-stop dropouts at any round as long as
//! at least `t` clients remain.
//!
//! ## Overview
//!
//! Every contribution is hidden under two mask families that the aggregator
//! can only remove in the aggregate:
//!
//! - **Pairwise masks**: each pair of clients derives a common PRNG seed via
//!   Diffie-Hellman; one side adds the stream, the other subtracts it, so
//!   the masks cancel when everyone is present.
//! - **Self-masks**: each client additionally adds a stream seeded from a
//!   private random value, covering the gap while dropouts are resolved.
//!
//! Both seeds are Shamir-shared among the clients in round 1, so after a
//! dropout the aggregator can reconstruct a dead client's pairwise streams
//! (from its mask key shares) and every survivor's self-mask stream (from
//! its seed shares), and subtract both families from the masked sum.
//!
//! ## Rounds
//!
//! 0. Clients announce two X25519 public keys; the aggregator broadcasts
//!    the roster.
//! 1. Clients seal Shamir shares of their mask key and self-mask seed to
//!    every peer; the aggregator routes the ciphertexts.
//! 2. Clients deliver masked contributions; the aggregator sums them and
//!    circulates the survivor list.
//! 3. Clients disclose recovery shares; the aggregator unmasks and reports
//!    the mean.
//!
//! ## Example
//!
//! ```rust
//! use secure_aggregation::driver::Driver;
//!
//! let secrets = [1.5, -2.25, 3.0, 0.5];
//! let mut driver = Driver::new(&secrets, 2, 7).unwrap();
//! let mean = driver.run().unwrap();
//! assert!((mean - 0.6875).abs() < 1e-9);
//! ```

pub mod aggregator;
pub mod client;
pub mod crypto;
pub mod driver;
pub mod error;
pub mod messages;
pub mod shamir;

pub use error::AggError;
