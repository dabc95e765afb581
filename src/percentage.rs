//! Deterministic percentage bucketing.
//!
//! The hash algorithm and seed are shared with the server. Changing either moves existing users
//! between buckets.
use std::io::Cursor;

/// Upper bound (exclusive) of a percentage bucket.
pub const MAX_PERCENTAGE: u32 = 1_000_000;

pub trait PercentageCalculator {
    /// Map `identity` and `feature_id` onto `[0, MAX_PERCENTAGE)`.
    fn bucket(&self, identity: &str, feature_id: &str) -> u32;
}

/// The default (and only) calculator: Murmur3 x86 32-bit with seed 0.
#[derive(Debug, Default, Clone, Copy)]
pub struct Murmur3PercentageCalculator;

const SEED: u32 = 0;

impl PercentageCalculator for Murmur3PercentageCalculator {
    fn bucket(&self, identity: &str, feature_id: &str) -> u32 {
        let input = format!("{identity}{feature_id}");
        // Reading from an in-memory cursor cannot fail.
        let hash = murmur3::murmur3_32(&mut Cursor::new(input.as_bytes()), SEED).unwrap_or(0);
        ((u64::from(MAX_PERCENTAGE) * u64::from(hash)) >> 32) as u32
    }
}

#[cfg(test)]
pub struct FixedPercentageCalculator(pub u32);

#[cfg(test)]
impl PercentageCalculator for FixedPercentageCalculator {
    fn bucket(&self, _identity: &str, _feature_id: &str) -> u32 {
        self.0
    }
}
