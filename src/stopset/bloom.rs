//! Fixed-size probabilistic stop set.
//!
//! A bit array sized for an expected number of keys and a target false
//! positive rate. Each key sets `num_hashes` bits whose positions come from a
//! single SHA-256 digest (double hashing). A lookup may wrongly report a link
//! as already probed, never the reverse.

use bitvec::prelude::*;
use sha2::{Digest, Sha256};

use super::{StopSet, StopSetError, StopSetParams, StopSetSnapshot};

/// Bloom-filter stop set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomSet {
    bits: BitVec<u64, Lsb0>,
    num_hashes: u32,
}

impl BloomSet {
    /// Create with explicit geometry. Both values are clamped to at least 1.
    pub fn new(num_bits: u64, num_hashes: u32) -> Self {
        let num_bits = num_bits.max(1) as usize;
        Self {
            bits: bitvec![u64, Lsb0; 0; num_bits],
            num_hashes: num_hashes.max(1),
        }
    }

    /// Size the bit array for `expected_items` keys at `false_positive_rate`
    pub fn with_rate(expected_items: u64, false_positive_rate: f64) -> Self {
        let (bits, hashes) = optimal_geometry(expected_items, false_positive_rate);
        Self::new(bits, hashes)
    }

    pub fn num_bits(&self) -> u64 {
        self.bits.len() as u64
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Fraction of bits set
    pub fn fill_ratio(&self) -> f64 {
        self.bits.count_ones() as f64 / self.bits.len() as f64
    }

    fn check_geometry(&self, num_bits: u64, num_hashes: u32) -> Result<(), StopSetError> {
        if num_bits != self.num_bits() || num_hashes != self.num_hashes {
            return Err(StopSetError::GeometryMismatch {
                expected_bits: self.num_bits(),
                expected_hashes: self.num_hashes,
                found_bits: num_bits,
                found_hashes: num_hashes,
            });
        }
        Ok(())
    }

    fn or_words(&mut self, words: &[u64]) {
        for (mine, theirs) in self.bits.as_raw_mut_slice().iter_mut().zip(words) {
            *mine |= *theirs;
        }
    }

    fn indexes(&self, key: &str) -> impl Iterator<Item = usize> + use<> {
        let digest = Sha256::digest(key.as_bytes());
        let mut h1 = [0u8; 8];
        let mut h2 = [0u8; 8];
        h1.copy_from_slice(&digest[0..8]);
        h2.copy_from_slice(&digest[8..16]);
        let h1 = u64::from_le_bytes(h1);
        // Odd step so successive probes cycle through distinct positions
        let h2 = u64::from_le_bytes(h2) | 1;
        let m = self.bits.len() as u64;
        (0..self.num_hashes as u64).map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % m) as usize)
    }
}

/// Bit count and hash count for `n` items at false positive rate `p`.
///
/// m = -n ln p / (ln 2)^2, k = (m / n) ln 2
pub fn optimal_geometry(expected_items: u64, false_positive_rate: f64) -> (u64, u32) {
    let n = expected_items.max(1) as f64;
    let p = false_positive_rate.clamp(f64::MIN_POSITIVE, 0.5);
    let ln2 = std::f64::consts::LN_2;
    let m = (-n * p.ln() / (ln2 * ln2)).ceil().max(1.0);
    let k = ((m / n) * ln2).round().max(1.0);
    (m as u64, k as u32)
}

impl StopSet for BloomSet {
    const KIND: &'static str = "bloom";

    fn with_params(params: &StopSetParams) -> Self {
        Self::with_rate(params.expected_items, params.false_positive_rate)
    }

    fn empty_like(&self) -> Self {
        Self::new(self.num_bits(), self.num_hashes)
    }

    fn add(&mut self, key: &str) {
        for idx in self.indexes(key) {
            self.bits.set(idx, true);
        }
    }

    fn contains(&self, key: &str) -> bool {
        self.indexes(key).all(|idx| self.bits[idx])
    }

    fn union_with(&mut self, other: &Self) -> Result<(), StopSetError> {
        self.check_geometry(other.num_bits(), other.num_hashes)?;
        self.or_words(other.bits.as_raw_slice());
        Ok(())
    }

    fn union_snapshot(&mut self, snapshot: &StopSetSnapshot) -> Result<(), StopSetError> {
        match snapshot {
            StopSetSnapshot::Exact { keys } => {
                for key in keys {
                    self.add(key);
                }
                Ok(())
            }
            StopSetSnapshot::Bloom {
                num_bits,
                num_hashes,
                words,
            } => {
                self.check_geometry(*num_bits, *num_hashes)?;
                let expected_words = self.bits.as_raw_slice().len();
                if words.len() != expected_words {
                    return Err(StopSetError::InvalidSnapshot(format!(
                        "expected {} words for {} bits, got {}",
                        expected_words,
                        num_bits,
                        words.len()
                    )));
                }
                let mut incoming = BitVec::<u64, Lsb0>::from_vec(words.clone());
                // Clear padding past the last real bit before merging
                incoming[*num_bits as usize..].fill(false);
                self.or_words(incoming.as_raw_slice());
                Ok(())
            }
        }
    }

    fn wipe(&mut self) {
        self.bits.fill(false);
    }

    fn len(&self) -> usize {
        self.bits.count_ones()
    }

    fn to_snapshot(&self) -> StopSetSnapshot {
        StopSetSnapshot::Bloom {
            num_bits: self.num_bits(),
            num_hashes: self.num_hashes,
            words: self.bits.as_raw_slice().to_vec(),
        }
    }

    fn from_snapshot(
        snapshot: &StopSetSnapshot,
        params: &StopSetParams,
    ) -> Result<Self, StopSetError> {
        let mut set = match snapshot {
            StopSetSnapshot::Bloom {
                num_bits,
                num_hashes,
                ..
            } => Self::new(*num_bits, *num_hashes),
            StopSetSnapshot::Exact { .. } => Self::with_params(params),
        };
        set.union_snapshot(snapshot)?;
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optimal_geometry_reference_point() {
        // n=4000, p=1e-7 is ~134k bits with 23 hashes
        let (m, k) = optimal_geometry(4000, 1e-7);
        assert!((134_000..135_000).contains(&m), "m = {}", m);
        assert_eq!(k, 23);
    }

    #[test]
    fn test_no_false_negatives() {
        let mut set = BloomSet::with_rate(1000, 0.01);
        let keys: Vec<String> = (0..1000).map(|i| format!("10.0.{}.{}-8.8.8.8", i / 256, i % 256)).collect();
        for key in &keys {
            set.add(key);
        }
        for key in &keys {
            assert!(set.contains(key), "missing {}", key);
        }
    }

    #[test]
    fn test_false_positive_rate_roughly_bounded() {
        let mut set = BloomSet::with_rate(1000, 0.01);
        for i in 0..1000 {
            set.add(&format!("member-{}", i));
        }
        let false_positives = (0..10_000)
            .filter(|i| set.contains(&format!("absent-{}", i)))
            .count();
        // Target is 1%; allow generous slack
        assert!(false_positives < 500, "false positives: {}", false_positives);
    }

    #[test]
    fn test_wipe_preserves_size() {
        let mut set = BloomSet::new(1024, 3);
        set.add("a");
        assert!(set.len() > 0);
        set.wipe();
        assert_eq!(set.len(), 0);
        assert_eq!(set.num_bits(), 1024);
        assert_eq!(set.num_hashes(), 3);
        assert!(!set.contains("a"));
    }

    #[test]
    fn test_fill_ratio_tracks_set_bits() {
        let mut set = BloomSet::new(1024, 3);
        assert_eq!(set.fill_ratio(), 0.0);
        set.add("10.0.0.1-8.8.8.8");
        let ratio = set.fill_ratio();
        assert!(ratio > 0.0 && ratio <= 3.0 / 1024.0, "ratio = {}", ratio);
        assert_eq!(ratio, set.len() as f64 / 1024.0);
        set.wipe();
        assert_eq!(set.fill_ratio(), 0.0);
    }

    #[test]
    fn test_union_idempotent() {
        let mut s = BloomSet::new(4096, 4);
        let mut t = BloomSet::new(4096, 4);
        s.add("a");
        t.add("b");

        s.union_with(&t).unwrap();
        let once = s.clone();
        s.union_with(&t).unwrap();

        assert_eq!(s, once);
        assert!(s.contains("a") && s.contains("b"));
    }

    #[test]
    fn test_union_geometry_mismatch() {
        let mut s = BloomSet::new(4096, 4);
        let t = BloomSet::new(2048, 4);
        assert!(matches!(
            s.union_with(&t),
            Err(StopSetError::GeometryMismatch { .. })
        ));
    }

    #[test]
    fn test_accepts_exact_snapshot() {
        let mut s = BloomSet::new(4096, 4);
        let snap = StopSetSnapshot::Exact {
            keys: vec!["x".into(), "y".into()],
        };
        s.union_snapshot(&snap).unwrap();
        assert!(s.contains("x") && s.contains("y"));
    }

    #[test]
    fn test_snapshot_roundtrip() {
        // 100 bits leaves padding in the second word
        let mut s = BloomSet::new(100, 2);
        s.add("a");
        s.add("b");
        let back = BloomSet::from_snapshot(&s.to_snapshot(), &StopSetParams::default()).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn test_snapshot_wrong_word_count() {
        let mut s = BloomSet::new(128, 2);
        let snap = StopSetSnapshot::Bloom {
            num_bits: 128,
            num_hashes: 2,
            words: vec![0],
        };
        assert!(matches!(
            s.union_snapshot(&snap),
            Err(StopSetError::InvalidSnapshot(_))
        ));
    }
}
