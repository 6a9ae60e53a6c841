//! Marker dictionaries and packed marker codes.

use serde::{Deserialize, Serialize};

use crate::matcher::rotate_code_u64;

/// An ArUco-style dictionary.
///
/// Dictionaries are plain data so the standard OpenCV tables can be supplied
/// from configuration. [`Dictionary::generate`] builds a rotation-distinct
/// codebook when none is configured.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dictionary {
    /// Human-readable name (for logging).
    pub name: String,
    /// Number of inner bits per side.
    pub marker_size: usize,
    /// Maximum Hamming distance the dictionary can correct.
    pub max_correction_bits: u8,
    /// One `u64` per marker id, inner `marker_size × marker_size` bits stored
    /// row-major with **black = 1**.
    pub codes: Vec<u64>,
}

impl Default for Dictionary {
    fn default() -> Self {
        Self::generate("GENERATED_4X4_50", 4, 50, 4)
    }
}

impl Dictionary {
    /// Total number of inner bits per marker.
    #[inline]
    pub fn bit_count(&self) -> usize {
        self.marker_size * self.marker_size
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.codes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// Greedily collect up to `count` codes whose pairwise distance, over all four
    /// rotations and including each code against its own rotations, is at least
    /// `min_distance`.
    ///
    /// Candidates come from a fixed-seed xorshift sequence, so the result is
    /// identical on every run.
    pub fn generate(name: &str, marker_size: usize, count: usize, min_distance: u32) -> Self {
        let bits = marker_size * marker_size;
        let mask = if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 };
        let mut state = 0x9E37_79B9_7F4A_7C15_u64;
        let mut codes: Vec<u64> = Vec::with_capacity(count);
        let mut rotated: Vec<u64> = Vec::with_capacity(4 * count);

        let max_candidates = 5000 * count.max(1);
        for _ in 0..max_candidates {
            if codes.len() == count {
                break;
            }
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let cand = state & mask;

            let ones = cand.count_ones() as usize;
            if ones < bits / 4 || ones > bits - bits / 4 {
                continue;
            }
            let self_distinct = (1..4).all(|r| {
                (cand ^ rotate_code_u64(cand, marker_size, r)).count_ones() >= min_distance
            });
            if !self_distinct {
                continue;
            }
            if rotated
                .iter()
                .any(|&c| (cand ^ c).count_ones() < min_distance)
            {
                continue;
            }
            codes.push(cand);
            rotated.extend((0..4).map(|r| rotate_code_u64(cand, marker_size, r)));
        }

        Self {
            name: name.to_string(),
            marker_size,
            max_correction_bits: (min_distance.saturating_sub(1) / 2) as u8,
            codes,
        }
    }
}
