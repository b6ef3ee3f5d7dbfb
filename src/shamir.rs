//! Byte-wise Shamir secret sharing over GF(2^8).
//!
//! Secrets are opaque byte strings (an exported private scalar, a mask seed).
//! Each byte is shared independently with a fresh random polynomial whose
//! constant term is the secret byte. Share indices are 1-based and double as
//! the evaluation points, so they must stay stable for the whole run.

use rand::RngCore;

use crate::error::AggError;

/// One share of a `(threshold, n)` sharing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Share {
    /// Evaluation point, in `1..=n`.
    pub index: u8,
    /// One byte per byte of the shared secret.
    pub bytes: Vec<u8>,
}

/// Splits `secret` into `n` shares of which any `threshold` reconstruct it.
pub fn split<R: RngCore>(
    secret: &[u8],
    n: usize,
    threshold: usize,
    rng: &mut R,
) -> Result<Vec<Share>, AggError> {
    if threshold < 2 || threshold > n {
        return Err(AggError::InvalidParameter(format!(
            "threshold {} must be in 2..={}",
            threshold, n
        )));
    }
    if n > 255 {
        return Err(AggError::InvalidParameter(format!(
            "at most 255 shares supported, requested {}",
            n
        )));
    }

    let mut shares: Vec<Share> = (1..=n as u8)
        .map(|index| Share {
            index,
            bytes: Vec::with_capacity(secret.len()),
        })
        .collect();

    let mut coeffs = vec![0u8; threshold];
    for &byte in secret {
        coeffs[0] = byte;
        rng.fill_bytes(&mut coeffs[1..]);
        for share in shares.iter_mut() {
            share.bytes.push(eval(&coeffs, share.index));
        }
    }
    Ok(shares)
}

/// Recovers the secret from the given shares by Lagrange interpolation at
/// zero. The caller is responsible for passing at least `threshold` shares;
/// with fewer the output is unrelated to the secret.
pub fn reconstruct(shares: &[Share]) -> Result<Vec<u8>, AggError> {
    let first = shares
        .first()
        .ok_or_else(|| AggError::ReconstructionFailed("no shares provided".to_string()))?;
    let len = first.bytes.len();

    for (i, share) in shares.iter().enumerate() {
        if share.index == 0 {
            return Err(AggError::ReconstructionFailed(
                "share index 0 is not a valid evaluation point".to_string(),
            ));
        }
        if share.bytes.len() != len {
            return Err(AggError::ReconstructionFailed(format!(
                "share length mismatch: {} vs {}",
                share.bytes.len(),
                len
            )));
        }
        if shares[..i].iter().any(|other| other.index == share.index) {
            return Err(AggError::ReconstructionFailed(format!(
                "duplicate share index {}",
                share.index
            )));
        }
    }

    // Lagrange basis at x = 0 depends only on the index set.
    let mut basis = Vec::with_capacity(shares.len());
    for share in shares {
        let mut li = 1u8;
        for other in shares {
            if other.index != share.index {
                li = gf_mul(li, gf_mul(other.index, gf_inv(other.index ^ share.index)));
            }
        }
        basis.push(li);
    }

    let mut secret = Vec::with_capacity(len);
    for pos in 0..len {
        let mut byte = 0u8;
        for (share, &li) in shares.iter().zip(basis.iter()) {
            byte ^= gf_mul(share.bytes[pos], li);
        }
        secret.push(byte);
    }
    Ok(secret)
}

/// Horner evaluation of the polynomial at `x`.
fn eval(coeffs: &[u8], x: u8) -> u8 {
    let mut acc = 0u8;
    for &coeff in coeffs.iter().rev() {
        acc = gf_mul(acc, x) ^ coeff;
    }
    acc
}

/// Carry-less multiplication modulo the AES polynomial x^8 + x^4 + x^3 + x + 1.
fn gf_mul(mut a: u8, mut b: u8) -> u8 {
    let mut product = 0u8;
    while b != 0 {
        if b & 1 != 0 {
            product ^= a;
        }
        let carry = a & 0x80;
        a <<= 1;
        if carry != 0 {
            a ^= 0x1b;
        }
        b >>= 1;
    }
    product
}

fn gf_inv(a: u8) -> u8 {
    // a^254 = a^-1 in GF(2^8); a is never zero here because share indices
    // are distinct and nonzero.
    debug_assert_ne!(a, 0);
    let mut result = 1u8;
    let mut base = a;
    let mut exp = 254u8;
    while exp != 0 {
        if exp & 1 != 0 {
            result = gf_mul(result, base);
        }
        base = gf_mul(base, base);
        exp >>= 1;
    }
    result
}
