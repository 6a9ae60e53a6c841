//! Global intensity thresholding.

/// 256-bin intensity histogram.
#[derive(Clone, Debug)]
pub(crate) struct Histogram {
    bins: [u32; 256],
    total: u32,
}

impl Histogram {
    pub(crate) fn new() -> Self {
        Self {
            bins: [0; 256],
            total: 0,
        }
    }

    #[cfg(test)]
    fn from_samples(samples: &[u8]) -> Self {
        let mut h = Self::new();
        for &v in samples {
            h.push(v);
        }
        h
    }

    #[inline]
    pub(crate) fn push(&mut self, v: u8) {
        self.bins[v as usize] += 1;
        self.total += 1;
    }

    /// `(min, max)` of the pushed samples.
    pub(crate) fn range(&self) -> Option<(u8, u8)> {
        let lo = self.bins.iter().position(|&c| c > 0)?;
        let hi = self.bins.iter().rposition(|&c| c > 0)?;
        Some((lo as u8, hi as u8))
    }

    /// Otsu threshold: samples `< t` form the dark class.
    pub(crate) fn otsu(&self) -> u8 {
        let Some((lo, hi)) = self.range() else {
            return 127;
        };
        if lo == hi {
            return lo;
        }
        let occupied = self.bins.iter().filter(|&&c| c > 0).count();
        if occupied <= 2 {
            return ((lo as u16 + hi as u16 + 1) / 2) as u8;
        }

        let total = self.total as f64;
        let sum_total: f64 = self
            .bins
            .iter()
            .enumerate()
            .map(|(i, &c)| i as f64 * c as f64)
            .sum();

        let mut sum_b = 0.0;
        let mut w_b = 0.0;
        let mut best_var = -1.0;
        let mut best_t = 127u8;
        for (t, &c) in self.bins.iter().enumerate() {
            w_b += c as f64;
            if w_b < 1.0 {
                continue;
            }
            let w_f = total - w_b;
            if w_f < 1.0 {
                break;
            }
            sum_b += t as f64 * c as f64;
            let m_b = sum_b / w_b;
            let m_f = (sum_total - sum_b) / w_f;
            let var_between = w_b * w_f * (m_b - m_f) * (m_b - m_f);
            if var_between > best_var {
                best_var = var_between;
                // dark class is [0, t], so the strict threshold is t + 1
                best_t = (t as u8).saturating_add(1);
            }
        }
        best_t
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bimodal_samples_split_between_modes() {
        let mut samples = vec![20u8; 100];
        samples.extend(std::iter::repeat(30u8).take(50));
        samples.extend(std::iter::repeat(220u8).take(200));
        samples.extend(std::iter::repeat(230u8).take(10));
        let t = Histogram::from_samples(&samples).otsu();
        assert!(t > 30 && t <= 220, "threshold {t}");
    }

    #[test]
    fn two_level_image_uses_midpoint() {
        let t = Histogram::from_samples(&[0, 0, 255, 255]).otsu();
        assert_eq!(t, 128);
    }

    #[test]
    fn empty_and_flat_inputs() {
        assert_eq!(Histogram::new().otsu(), 127);
        assert_eq!(Histogram::from_samples(&[42; 10]).otsu(), 42);
    }
}
