//! Dictionary matching and rotation helpers.

use crate::Dictionary;

/// A dictionary match for an observed marker code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Match {
    /// Marker id (index into the dictionary).
    pub id: u32,
    /// Rotation `0..=3` such that `observed == rotate(dict_code, rotation)`.
    pub rotation: u8,
    /// Hamming distance after rotation.
    pub hamming: u8,
}

/// Brute-force matcher over all ids and rotations.
#[derive(Clone, Debug)]
pub struct Matcher {
    bits: usize,
    max_hamming: u8,
    rotated: Vec<[u64; 4]>,
}

impl Matcher {
    /// `None` if the dictionary's codes do not fit in 64 bits.
    pub fn new(dict: &Dictionary, max_hamming: u8) -> Option<Self> {
        let bits = dict.bit_count();
        if bits == 0 || bits > 64 {
            return None;
        }
        let n = dict.marker_size;
        let rotated = dict
            .codes
            .iter()
            .map(|&c| [0, 1, 2, 3].map(|r| rotate_code_u64(c, n, r)))
            .collect();
        Some(Self {
            bits,
            max_hamming,
            rotated,
        })
    }

    #[inline]
    pub fn bit_count(&self) -> usize {
        self.bits
    }

    /// Best match within `max_hamming`. Ties keep the lowest id and rotation.
    pub fn match_code(&self, observed: u64) -> Option<Match> {
        let mut best: Option<Match> = None;
        for (id, rots) in self.rotated.iter().enumerate() {
            for (rot, &cand) in rots.iter().enumerate() {
                let h = (observed ^ cand).count_ones() as u8;
                if h > self.max_hamming {
                    continue;
                }
                if best.is_none_or(|b| h < b.hamming) {
                    best = Some(Match {
                        id: id as u32,
                        rotation: rot as u8,
                        hamming: h,
                    });
                    if h == 0 {
                        return best;
                    }
                }
            }
        }
        best
    }
}

/// Rotate a code stored row-major (`idx = y * n + x`) by `rot` quarter turns.
pub fn rotate_code_u64(code: u64, n: usize, rot: u8) -> u64 {
    let rot = rot & 3;
    if rot == 0 {
        return code;
    }
    let mut out = 0u64;
    for y in 0..n {
        for x in 0..n {
            let (sx, sy) = match rot {
                1 => (y, n - 1 - x),
                2 => (n - 1 - x, n - 1 - y),
                _ => (n - 1 - y, x),
            };
            out |= ((code >> (sy * n + sx)) & 1) << (y * n + x);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn four_quarter_turns_are_identity() {
        let code = 0x0123_4567_89ab_cdef_u64;
        let r = (0..4).fold(code, |c, _| rotate_code_u64(c, 8, 1));
        assert_eq!(r, code);
        assert_eq!(
            rotate_code_u64(rotate_code_u64(code, 8, 1), 8, 1),
            rotate_code_u64(code, 8, 2)
        );
    }

    #[test]
    fn matcher_finds_rotated_and_corrupted_codes() {
        let dict = Dictionary::generate("t", 4, 10, 4);
        let matcher = Matcher::new(&dict, 1).expect("matcher");

        let observed = rotate_code_u64(dict.codes[3], 4, 1);
        assert_eq!(
            matcher.match_code(observed),
            Some(Match {
                id: 3,
                rotation: 1,
                hamming: 0
            })
        );

        let m = matcher.match_code(observed ^ 0b100).expect("one bit flipped");
        assert_eq!((m.id, m.rotation, m.hamming), (3, 1, 1));
    }

    #[test]
    fn oversized_dictionary_is_rejected() {
        let dict = Dictionary {
            name: "big".into(),
            marker_size: 9,
            max_correction_bits: 0,
            codes: vec![1],
        };
        assert!(Matcher::new(&dict, 0).is_none());
    }
}
