//! Address validation and proof-of-work difficulty math for Duskpool.
//!
//! Wallet signing is out of scope here (consumed via the node's own
//! UTXO/RPC library) — this crate only validates payout addresses and
//! converts between difficulty and 256-bit targets.

use duskpool_core::{Hash, Target};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid address prefix")]
    InvalidPrefix,
    #[error("invalid base58 encoding: {0}")]
    InvalidBase58(#[from] bs58::decode::Error),
    #[error("invalid address length: {0}")]
    InvalidLength(usize),
    #[error("address checksum mismatch")]
    ChecksumMismatch,
}

const ADDRESS_PREFIX: &str = "dusk:";
const ADDRESS_PAYLOAD_LEN: usize = 20;
const ADDRESS_CHECKSUM_LEN: usize = 4;

/// Validate a protocol-level payout address of the form `dusk:<base58
/// payload+checksum>`. Addresses that don't carry the protocol prefix are
/// not protocol addresses — the caller (C5) falls back to a custodian-user
/// lookup for those, per spec.md §4.5.
pub fn validate_address(address: &str) -> Result<(), CryptoError> {
    let payload = address.strip_prefix(ADDRESS_PREFIX).ok_or(CryptoError::InvalidPrefix)?;
    let decoded = bs58::decode(payload).into_vec()?;
    if decoded.len() != ADDRESS_PAYLOAD_LEN + ADDRESS_CHECKSUM_LEN {
        return Err(CryptoError::InvalidLength(decoded.len()));
    }

    let (body, checksum) = decoded.split_at(ADDRESS_PAYLOAD_LEN);
    let expected = checksum_of(body);
    if expected != checksum {
        return Err(CryptoError::ChecksumMismatch);
    }
    Ok(())
}

/// True if `address` parses as a protocol address (vs. an opaque
/// custodian-user identifier that must be resolved via the persistence
/// gateway's `getUser`).
pub fn is_protocol_address(address: &str) -> bool {
    validate_address(address).is_ok()
}

fn checksum_of(body: &[u8]) -> [u8; ADDRESS_CHECKSUM_LEN] {
    let first = Sha256::digest(body);
    let second = Sha256::digest(first);
    let mut checksum = [0u8; ADDRESS_CHECKSUM_LEN];
    checksum.copy_from_slice(&second[..ADDRESS_CHECKSUM_LEN]);
    checksum
}

/// Largest target a difficulty-1 share must meet, i.e. `Target::MAX`
/// scaled so that `difficulty_to_target(1.0) == Target::MAX`.
pub fn difficulty_to_target(difficulty: f64) -> Target {
    if difficulty <= 0.0 {
        return Target::MAX;
    }
    // Represent MAX as a u128-scaled approximation of the leading 16 bytes;
    // the trailing 16 bytes stay at their max-entropy value, which is
    // precise enough for VarDiff-scale (not consensus-scale) comparisons.
    let max_leading = u128::from_be_bytes(Target::MAX.0[..16].try_into().unwrap());
    let scaled = (max_leading as f64 / difficulty) as u128;
    let mut bytes = [0xffu8; 32];
    bytes[..16].copy_from_slice(&scaled.to_be_bytes());
    Target(bytes)
}

/// Inverse of [`difficulty_to_target`], used when reporting a worker's
/// effective difficulty back from a stored target.
pub fn target_to_difficulty(target: &Target) -> f64 {
    let leading = u128::from_be_bytes(target.0[..16].try_into().unwrap());
    if leading == 0 {
        return f64::MAX;
    }
    let max_leading = u128::from_be_bytes(Target::MAX.0[..16].try_into().unwrap());
    max_leading as f64 / leading as f64
}

/// Round `value` down to the nearest power of two, used by the VarDiff
/// controller when `clampPow2` is enabled. Never rounds below 1.0.
pub fn round_down_pow2(value: f64) -> f64 {
    if value < 1.0 {
        return 1.0;
    }
    2f64.powi(value.log2().floor() as i32)
}

/// Finalizes a block header with a candidate nonce into the hash that is
/// compared against a target. The actual Kaspa PoW algorithm (kHeavyHash)
/// is out of scope here — it is consumed as a library by the real node —
/// so this trait is the seam the Template Cache and Shares Manager hash
/// through, with [`Sha256dHasher`] standing in for tests and for any
/// deployment that links a real hasher in its place.
pub trait PowHasher: Send + Sync {
    fn hash_nonce(&self, raw_header: &[u8], nonce: u64) -> Hash;
}

/// Double-SHA256 over `raw_header || nonce` (big-endian). Not the
/// production Kaspa PoW function — a placeholder seam implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256dHasher;

impl PowHasher for Sha256dHasher {
    fn hash_nonce(&self, raw_header: &[u8], nonce: u64) -> Hash {
        let mut buf = raw_header.to_vec();
        buf.extend_from_slice(&nonce.to_be_bytes());
        let first = Sha256::digest(&buf);
        let second = Sha256::digest(first);
        let mut out = [0u8; 32];
        out.copy_from_slice(&second);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_address_roundtrips() {
        let body = [7u8; ADDRESS_PAYLOAD_LEN];
        let checksum = checksum_of(&body);
        let mut payload = body.to_vec();
        payload.extend_from_slice(&checksum);
        let address = format!("dusk:{}", bs58::encode(&payload).into_string());
        assert!(validate_address(&address).is_ok());
        assert!(is_protocol_address(&address));
    }

    #[test]
    fn rejects_missing_prefix() {
        assert!(matches!(validate_address("qz1somebech32like"), Err(CryptoError::InvalidPrefix)));
    }

    #[test]
    fn rejects_bad_checksum() {
        let body = [1u8; ADDRESS_PAYLOAD_LEN];
        let mut payload = body.to_vec();
        payload.extend_from_slice(&[0u8; ADDRESS_CHECKSUM_LEN]);
        let address = format!("dusk:{}", bs58::encode(&payload).into_string());
        assert!(matches!(validate_address(&address), Err(CryptoError::ChecksumMismatch)));
    }

    #[test]
    fn difficulty_target_roundtrip_is_approximate() {
        let target = difficulty_to_target(4.0);
        let back = target_to_difficulty(&target);
        assert!((back - 4.0).abs() < 0.01);
    }

    #[test]
    fn higher_difficulty_yields_smaller_target() {
        let low = difficulty_to_target(1.0);
        let high = difficulty_to_target(1000.0);
        assert!(high.0 < low.0);
    }

    #[test]
    fn pow2_rounding() {
        assert_eq!(round_down_pow2(1000.0), 512.0);
        assert_eq!(round_down_pow2(1024.0), 1024.0);
        assert_eq!(round_down_pow2(0.5), 1.0);
    }

    #[test]
    fn hasher_is_deterministic_and_nonce_sensitive() {
        let hasher = Sha256dHasher;
        let header = [1u8, 2, 3];
        let a = hasher.hash_nonce(&header, 1);
        let b = hasher.hash_nonce(&header, 1);
        let c = hasher.hash_nonce(&header, 2);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
