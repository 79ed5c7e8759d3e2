//! Proof of work arithmetic
//!
//! Decodes the compact `bits` difficulty encoding into a 256-bit target and
//! derives the per-block work value used as the fork-choice metric. All
//! arithmetic is arbitrary precision: chain work passes 2^64 long before any
//! realistic height.

use crate::crypto::Hash256;
use num_bigint::BigUint;

/// Cumulative or per-block proof of work
pub type Work = BigUint;

/// Compact bits of the easiest target a regtest-style network accepts
pub const REGTEST_BITS: u32 = 0x207f_ffff;

/// Width of chain work values when hex encoded (256 bits)
pub const CHAIN_WORK_HEX_LEN: usize = 64;

/// Expand compact `bits` into a target.
///
/// Returns `None` for encodings that cannot be met: zero, negative or wider
/// than 256 bits.
pub fn target_from_bits(bits: u32) -> Option<BigUint> {
    let exponent = bits >> 24;
    let mantissa = bits & 0x007f_ffff;

    if bits & 0x0080_0000 != 0 && mantissa != 0 {
        return None;
    }

    let target = if exponent <= 3 {
        BigUint::from(mantissa >> (8 * (3 - exponent)))
    } else {
        BigUint::from(mantissa) << (8 * (exponent - 3)) as usize
    };

    if target.bits() == 0 || target.bits() > 256 {
        return None;
    }
    Some(target)
}

/// Work implied by `bits`: `2^256 / (target + 1)`.
///
/// Unmeetable encodings carry no work.
pub fn work_from_bits(bits: u32) -> Work {
    match target_from_bits(bits) {
        Some(target) => (BigUint::from(1u32) << 256usize) / (target + 1u32),
        None => Work::default(),
    }
}

/// Check that `hash`, read as a little-endian integer, does not exceed the
/// target implied by `bits`
pub fn meets_target(hash: &Hash256, bits: u32) -> bool {
    match target_from_bits(bits) {
        Some(target) => BigUint::from_bytes_le(hash.as_bytes()) <= target,
        None => false,
    }
}

/// Zero-padded lowercase hex, the form stored in bulk rows and manifests
pub fn work_to_hex(work: &Work) -> String {
    format!("{:0width$x}", work, width = CHAIN_WORK_HEX_LEN)
}

/// Parse a hex chain work value; an optional `0x` prefix is accepted
pub fn work_from_hex(s: &str) -> Option<Work> {
    let digits = s.trim().trim_start_matches("0x");
    if digits.is_empty() {
        return None;
    }
    BigUint::parse_bytes(digits.as_bytes(), 16)
}

/// Serde adapter storing [`Work`] as a hex string
pub mod serde_work_hex {
    use super::{work_from_hex, work_to_hex, Work};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(work: &Work, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&work_to_hex(work))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Work, D::Error> {
        let s = String::deserialize(deserializer)?;
        work_from_hex(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid chain work: {s}")))
    }
}
