// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! HyperLogLog cardinality sketch used by per-node/tree sampling (§4.D).
//!
//! Dense representation: `2^precision` registers, each 6 bits wide, packed
//! into a byte array. Registers are addressed by the top `precision` bits
//! of an [`crate::hash::hash64`] digest; the register value is the count of
//! leading zeros in the remaining bits, plus one.

const REGISTER_BITS: u32 = 6;
const REGISTER_MAX: u8 = (1 << REGISTER_BITS) - 1;

/// A dense HyperLogLog sketch.
#[derive(Clone, Debug)]
pub struct Hll {
    precision: u8,
    registers: Vec<u8>,
}

impl Hll {
    /// Creates an empty sketch with `2^precision` registers.
    ///
    /// # Panics
    ///
    /// Panics if `precision` is not in `4..=16`.
    #[must_use]
    pub fn new(precision: u8) -> Self {
        assert!((4..=16).contains(&precision), "invalid HLL precision");

        Self {
            precision,
            registers: vec![0; 1 << precision],
        }
    }

    /// The precision (`log2` of the register count) this sketch was
    /// created with.
    #[must_use]
    pub fn precision(&self) -> u8 {
        self.precision
    }

    /// Inserts a key's hash into the sketch.
    pub fn insert(&mut self, key: &[u8]) {
        self.insert_hash(crate::hash::hash64(key));
    }

    fn insert_hash(&mut self, hash: u64) {
        let m = self.registers.len() as u64;
        let idx = (hash >> (64 - self.precision)) as usize;
        let rest = (hash << self.precision) | (1 << (self.precision - 1));
        // `rest` is never zero (the OR above guarantees a set bit), so
        // `leading_zeros` is bounded by 64 - precision + 1.
        let rank = (rest.leading_zeros() + 1).min(u32::from(REGISTER_MAX));

        debug_assert!((idx as u64) < m);

        if let Some(slot) = self.registers.get_mut(idx) {
            *slot = (*slot).max(rank as u8);
        }
    }

    /// Unions `other` into `self` register-wise (max per register).
    ///
    /// # Panics
    ///
    /// Panics if the two sketches have different precisions.
    pub fn union(&mut self, other: &Self) {
        assert_eq!(
            self.precision, other.precision,
            "cannot union HLL sketches of different precision"
        );

        for (a, b) in self.registers.iter_mut().zip(other.registers.iter()) {
            *a = (*a).max(*b);
        }
    }

    /// Estimates the cardinality of the inserted set.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn estimate(&self) -> u64 {
        let m = self.registers.len() as f64;
        let alpha = match self.registers.len() {
            16 => 0.673,
            32 => 0.697,
            64 => 0.709,
            _ => 0.7213 / (1.0 + 1.079 / m),
        };

        let mut sum = 0.0;
        let mut zeros = 0u32;

        for &r in &self.registers {
            sum += 2f64.powi(-i32::from(r));
            if r == 0 {
                zeros += 1;
            }
        }

        let raw = alpha * m * m / sum;

        // Small-range correction: linear counting when zero registers
        // remain.
        let estimate = if raw <= 2.5 * m && zeros > 0 {
            m * (m / f64::from(zeros)).ln()
        } else {
            raw
        };

        estimate.round().max(0.0) as u64
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn empty_estimates_zero() {
        let hll = Hll::new(11);
        assert_eq!(0, hll.estimate());
    }

    #[test]
    fn counts_roughly_right() {
        let mut hll = Hll::new(11);

        for i in 0..10_000u64 {
            hll.insert(&i.to_be_bytes());
        }

        let estimate = hll.estimate();
        let error = (estimate as f64 - 10_000.0).abs() / 10_000.0;
        assert!(error < 0.1, "estimate {estimate} too far from 10000");
    }

    #[test]
    fn union_matches_combined_insert() {
        let mut a = Hll::new(11);
        let mut b = Hll::new(11);
        let mut combined = Hll::new(11);

        for i in 0..5_000u64 {
            a.insert(&i.to_be_bytes());
            combined.insert(&i.to_be_bytes());
        }

        for i in 5_000..10_000u64 {
            b.insert(&i.to_be_bytes());
            combined.insert(&i.to_be_bytes());
        }

        a.union(&b);

        let unioned = a.estimate();
        let direct = combined.estimate();
        let diff = (unioned as f64 - direct as f64).abs();
        assert!(diff < 50.0, "union diverged from direct: {unioned} vs {direct}");
    }

    #[test]
    #[should_panic = "invalid HLL precision"]
    fn rejects_bad_precision() {
        let _ = Hll::new(2);
    }
}
