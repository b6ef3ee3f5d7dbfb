//! Cryptographic primitives shared by clients and the aggregator.
//!
//! Everything in this module is part of the wire contract. Both ends of a
//! pair must derive the same mask seed and the same AES key from their
//! respective (private, public) halves, and the mask generator must emit the
//! same sequence for the same seed on every machine, because the aggregator
//! replays these derivations during unmasking.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::Aead;
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, KeyInit};
use hkdf::Hkdf;
use rand::{CryptoRng, RngCore};
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha20Rng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::AggError;

/// Initialization vectors carried next to each share ciphertext.
pub const IV_LENGTH: usize = 16;

/// Byte offset of the two-byte mask-seed window within the expanded
/// shared secret. Every party must read the same window.
const MASK_SEED_OFFSET: usize = 1;

const MASK_SEED_INFO: &[u8] = b"secure-aggregation/pairwise-mask-seed/v1";
const CIPHER_KEY_INFO: &[u8] = b"secure-aggregation/pairwise-cipher-key/v1";

/// AES-256-GCM with a 16-byte nonce.
type ShareCipher = AesGcm<Aes256, U16>;

/// An X25519 key pair whose private half has a portable byte form.
///
/// The raw 32-byte scalar round-trips through [`KeyPair::secret_bytes`] and
/// [`KeyPair::from_secret_bytes`] without transformation, so a scalar
/// reassembled from Shamir shares agrees with the original key on every
/// shared secret.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generates a fresh key pair from the given randomness source.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        Self::from_secret_bytes(bytes)
    }

    /// Rebuilds a key pair from an exported private scalar.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        KeyPair { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    /// Exports the private scalar for secret sharing.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    fn shared_secret(&self, peer_public: &[u8; 32]) -> [u8; 32] {
        *self
            .secret
            .diffie_hellman(&PublicKey::from(*peer_public))
            .as_bytes()
    }
}

/// Derives the pairwise mask seed from a Diffie-Hellman exchange.
///
/// The raw shared secret is expanded with HKDF-SHA256 and a two-byte window
/// of the output is read as a little-endian signed 16-bit integer. The seed
/// space is therefore 2^16 per pair; seed collisions between different pairs
/// are possible and do not affect correctness, only mask reuse.
pub fn pairwise_mask_seed(own: &KeyPair, peer_public: &[u8; 32]) -> i16 {
    let okm = expand(&own.shared_secret(peer_public), MASK_SEED_INFO);
    i16::from_le_bytes([okm[MASK_SEED_OFFSET], okm[MASK_SEED_OFFSET + 1]])
}

/// Derives the 256-bit AES-GCM key shared by a pair of clients.
pub fn pairwise_cipher_key(own: &KeyPair, peer_public: &[u8; 32]) -> [u8; 32] {
    let mut key = [0u8; 32];
    let hk = Hkdf::<Sha256>::new(None, &own.shared_secret(peer_public));
    hk.expand(CIPHER_KEY_INFO, &mut key)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    key
}

fn expand(shared: &[u8; 32], info: &[u8]) -> [u8; 16] {
    let mut okm = [0u8; 16];
    let hk = Hkdf::<Sha256>::new(None, shared);
    hk.expand(info, &mut okm)
        .expect("16 bytes is a valid HKDF-SHA256 output length");
    okm
}

/// Encrypts `plaintext` under a pairwise key with a freshly sampled IV.
pub fn aead_encrypt<R: RngCore + CryptoRng>(
    key: &[u8; 32],
    plaintext: &[u8],
    rng: &mut R,
) -> Result<(Vec<u8>, [u8; IV_LENGTH]), AggError> {
    let mut iv = [0u8; IV_LENGTH];
    rng.fill_bytes(&mut iv);

    let cipher = ShareCipher::new(GenericArray::from_slice(key));
    let ciphertext = cipher
        .encrypt(GenericArray::from_slice(&iv), plaintext)
        .map_err(|_| AggError::CryptoError("AES-GCM encryption failed".to_string()))?;
    Ok((ciphertext, iv))
}

/// Decrypts a share ciphertext, verifying the authentication tag.
pub fn aead_decrypt(
    key: &[u8; 32],
    ciphertext: &[u8],
    iv: &[u8; IV_LENGTH],
) -> Result<Vec<u8>, AggError> {
    let cipher = ShareCipher::new(GenericArray::from_slice(key));
    cipher
        .decrypt(GenericArray::from_slice(iv), ciphertext)
        .map_err(|_| AggError::DecryptionFailed("AES-GCM tag mismatch".to_string()))
}

/// Deterministic mask generator.
///
/// The generator is frozen to ChaCha20 keyed with the little-endian bytes of
/// the seed; changing it breaks unmasking between parties that disagree.
/// Pairwise seeds (signed 16-bit) and self-mask seeds (unsigned 32-bit) both
/// go through the same widening to `i64` before keying.
pub struct MaskPrng(ChaCha20Rng);

impl MaskPrng {
    pub fn from_seed(seed: i64) -> Self {
        let mut key = [0u8; 32];
        key[..8].copy_from_slice(&seed.to_le_bytes());
        MaskPrng(ChaCha20Rng::from_seed(key))
    }

    /// Draws the next 32-bit mask word.
    pub fn next_mask(&mut self) -> u32 {
        self.0.next_u32()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair(tag: u8) -> KeyPair {
        let mut rng = ChaCha20Rng::from_seed([tag; 32]);
        KeyPair::generate(&mut rng)
    }

    #[test]
    fn test_pairwise_derivations_are_symmetric() {
        let a = keypair(1);
        let b = keypair(2);

        assert_eq!(
            pairwise_mask_seed(&a, &b.public_bytes()),
            pairwise_mask_seed(&b, &a.public_bytes())
        );
        assert_eq!(
            pairwise_cipher_key(&a, &b.public_bytes()),
            pairwise_cipher_key(&b, &a.public_bytes())
        );
    }

    #[test]
    fn test_exported_key_round_trip() {
        let a = keypair(3);
        let b = keypair(4);

        let rebuilt = KeyPair::from_secret_bytes(a.secret_bytes());
        assert_eq!(rebuilt.public_bytes(), a.public_bytes());
        assert_eq!(
            pairwise_mask_seed(&rebuilt, &b.public_bytes()),
            pairwise_mask_seed(&a, &b.public_bytes())
        );
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let mut rng = ChaCha20Rng::from_seed([9; 32]);
        let key = [7u8; 32];
        let plaintext = b"share material".to_vec();

        let (ciphertext, iv) = aead_encrypt(&key, &plaintext, &mut rng).unwrap();
        let recovered = aead_decrypt(&key, &ciphertext, &iv).unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let mut rng = ChaCha20Rng::from_seed([10; 32]);
        let key = [7u8; 32];

        let (mut ciphertext, iv) = aead_encrypt(&key, b"share material", &mut rng).unwrap();
        ciphertext[0] ^= 0x01;
        assert!(matches!(
            aead_decrypt(&key, &ciphertext, &iv),
            Err(AggError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_wrong_key_fails() {
        let mut rng = ChaCha20Rng::from_seed([11; 32]);
        let (ciphertext, iv) = aead_encrypt(&[7u8; 32], b"share material", &mut rng).unwrap();
        assert!(aead_decrypt(&[8u8; 32], &ciphertext, &iv).is_err());
    }

    #[test]
    fn test_mask_prng_replay() {
        let mut p1 = MaskPrng::from_seed(-12345);
        let mut p2 = MaskPrng::from_seed(-12345);
        for _ in 0..16 {
            assert_eq!(p1.next_mask(), p2.next_mask());
        }

        let mut p3 = MaskPrng::from_seed(12345);
        assert_ne!(p1.next_mask(), p3.next_mask());
    }
}
