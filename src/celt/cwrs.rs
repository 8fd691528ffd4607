//! Combinatorial indexing of pulse vectors.
//!
//! Maps between integer vectors of dimension N with L1 norm K and indices
//! in `[0, V(N, K))`, where `V(N, K) = V(N-1, K) + V(N, K-1) + V(N-1, K-1)`
//! counts the signed pulse arrangements. The table is filled once at
//! construction by the bounded recurrence, so it is identical every run.

use crate::math::ilog;

/// Widest vector this codebook indexes (the widest band of a 20 ms frame).
pub(crate) const MAX_PULSE_N: usize = 176;
/// Most pulses considered per vector.
pub(crate) const MAX_PULSE_K: usize = 128;

/// Indices must stay below this bound so they fit one `decode_uint` call.
const MAX_INDEX: u64 = 1 << 31;

/// Precomputed V(N, K) table with saturating entries.
pub(crate) struct PulseCodebook {
    /// v[n * (MAX_PULSE_K + 1) + k]
    v: Vec<u64>,
}

impl PulseCodebook {
    /// Builds the table.
    pub(crate) fn new() -> Self {
        let cols = MAX_PULSE_K + 1;
        let mut v = vec![0_u64; (MAX_PULSE_N + 1) * cols];

        v[0] = 1; // V(0, 0)
        for n in 1..=MAX_PULSE_N {
            v[n * cols] = 1; // V(n, 0)
            for k in 1..=MAX_PULSE_K {
                let a = v[(n - 1) * cols + k];
                let b = v[n * cols + k - 1];
                let c = v[(n - 1) * cols + k - 1];
                v[n * cols + k] = a.saturating_add(b).saturating_add(c);
            }
        }
        // V(0, k) = 0 for k > 0 is already the zero initialization.

        Self { v }
    }

    /// Number of vectors of dimension `n` with L1 norm exactly `k`.
    #[inline(always)]
    pub(crate) fn v(&self, n: usize, k: usize) -> u64 {
        debug_assert!(n <= MAX_PULSE_N && k <= MAX_PULSE_K);
        self.v[n * (MAX_PULSE_K + 1) + k]
    }

    /// Upper bound on the bits needed to code an index, in 1/8 bit units.
    pub(crate) fn bits8(&self, n: usize, k: usize) -> u32 {
        let count = self.v(n, k);
        if count <= 1 {
            return 0;
        }
        ilog((count - 1).min(u64::from(u32::MAX)) as u32) << 3
    }

    /// Largest pulse count whose index still fits the given bit budget and
    /// a single uniform symbol.
    pub(crate) fn max_k_for_bits(&self, n: usize, bits8: u32) -> usize {
        if n == 0 || n > MAX_PULSE_N {
            return 0;
        }
        let mut k = 0;
        while k < MAX_PULSE_K && self.v(n, k + 1) < MAX_INDEX && self.bits8(n, k + 1) <= bits8 {
            k += 1;
        }
        k
    }

    /// Ranks a pulse vector to its index.
    ///
    /// The vector must have L1 norm `k` with `V(n, k)` below the index
    /// bound.
    pub(crate) fn encode_pulses(&self, pulses: &[i32]) -> u32 {
        let n = pulses.len();
        let k: i32 = pulses.iter().map(|p| p.abs()).sum();
        debug_assert!(self.v(n, k as usize) < MAX_INDEX);

        let mut index = 0_u64;
        let mut k_left = k as usize;

        for (pos, &p) in pulses.iter().enumerate() {
            if k_left == 0 {
                break;
            }
            let n_rem = n - pos - 1;

            // Vectors whose value at this position is zero come first.
            if p != 0 {
                index += self.v(n_rem, k_left);
                let mag = p.unsigned_abs() as usize;
                // Then, for each smaller magnitude, both signs.
                for m in 1..mag {
                    index += 2 * self.v(n_rem, k_left - m);
                }
                // Negative follows positive within one magnitude shelf.
                if p < 0 {
                    index += self.v(n_rem, k_left - mag);
                }
                k_left -= mag;
            }
        }

        index as u32
    }

    /// Unranks an index back into a pulse vector; the exact inverse of
    /// [`Self::encode_pulses`].
    pub(crate) fn decode_pulses(&self, index: u32, k: usize, out: &mut [i32]) {
        let n = out.len();
        let mut idx = u64::from(index);
        let mut k_left = k;

        for pos in 0..n {
            out[pos] = 0;
            if k_left == 0 {
                continue;
            }
            let n_rem = n - pos - 1;

            let zero_count = self.v(n_rem, k_left);
            if idx < zero_count {
                continue;
            }
            idx -= zero_count;

            // Probe magnitude shelves until one contains the index.
            let mut mag = 1;
            loop {
                let per_sign = self.v(n_rem, k_left - mag);
                if idx < 2 * per_sign {
                    out[pos] = if idx < per_sign {
                        mag as i32
                    } else {
                        idx -= per_sign;
                        -(mag as i32)
                    };
                    break;
                }
                idx -= 2 * per_sign;
                if mag == k_left {
                    // A corrupt index walks off the table; drop the rest of
                    // the pulses at this position.
                    out[pos] = k_left as i32;
                    break;
                }
                mag += 1;
            }
            k_left -= out[pos].unsigned_abs() as usize;
        }
    }
}

/// Scales an integer pulse vector to unit L2 norm.
pub(crate) fn normalize_pulses(pulses: &[i32], out: &mut [f32]) {
    let energy: f32 = pulses.iter().map(|&p| (p * p) as f32).sum();
    if energy <= 0.0 {
        out[..pulses.len()].iter_mut().for_each(|v| *v = 0.0);
        return;
    }
    let scale = 1.0 / energy.sqrt();
    for (o, &p) in out.iter_mut().zip(pulses.iter()) {
        *o = p as f32 * scale;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use nanorand::RNG;

    use super::*;

    #[test]
    fn test_v_recurrence_anchors() {
        let cb = PulseCodebook::new();
        assert_eq!(cb.v(0, 0), 1);
        assert_eq!(cb.v(1, 0), 1);
        assert_eq!(cb.v(1, 3), 2);
        assert_eq!(cb.v(2, 1), 4);
        assert_eq!(cb.v(2, 2), 8);
        // V(3,2): 3 positions for |2| * 2 signs + 3 pairs * 4 sign combos.
        assert_eq!(cb.v(3, 2), 18);
    }

    #[test]
    fn test_rank_unrank_bijection() {
        let cb = PulseCodebook::new();

        // Exhaustive over every index for small (n, k).
        for &(n, k) in [(1_usize, 1_usize), (2, 4), (4, 3), (8, 2)].iter() {
            let count = cb.v(n, k);
            let mut seen = std::collections::HashSet::new();
            for index in 0..count as u32 {
                let mut pulses = vec![0_i32; n];
                cb.decode_pulses(index, k, &mut pulses);

                let l1: i32 = pulses.iter().map(|p| p.abs()).sum();
                assert_eq!(l1 as usize, k, "index {} lost pulses", index);
                assert_eq!(cb.encode_pulses(&pulses), index);
                assert!(seen.insert(pulses.clone()), "duplicate vector");
            }
            assert_eq!(seen.len() as u64, count);
        }
    }

    #[test]
    fn test_random_round_trip_large() {
        let cb = PulseCodebook::new();
        let mut rng = nanorand::WyRand::new_seed(176);

        for &(n, k) in [(16_usize, 8_usize), (22, 6), (96, 3), (176, 2)].iter() {
            for _ in 0..50 {
                let mut pulses = vec![0_i32; n];
                for _ in 0..k {
                    let pos = rng.generate_range::<u32>(0, n as u32) as usize;
                    if rng.generate_range::<u32>(0, 2) == 0 {
                        pulses[pos] += 1;
                    } else {
                        pulses[pos] -= 1;
                    }
                }
                // Collisions of opposite signs can shrink the norm; top it
                // back up in the first position.
                let l1: i32 = pulses.iter().map(|p| p.abs()).sum();
                pulses[0] += k as i32 - l1;

                let index = cb.encode_pulses(&pulses);
                let mut back = vec![0_i32; n];
                cb.decode_pulses(index, k, &mut back);
                assert_eq!(back, pulses);
            }
        }
    }

    #[test]
    fn test_spec_corner_vector() {
        // Eight unit pulses in the low half of a 16-wide band.
        let cb = PulseCodebook::new();
        let pulses = [1, 1, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0];
        let index = cb.encode_pulses(&pulses);
        let mut back = [0_i32; 16];
        cb.decode_pulses(index, 8, &mut back);
        assert_eq!(back, pulses);
    }

    #[test]
    fn test_max_k_respects_budget() {
        let cb = PulseCodebook::new();
        for &n in [1_usize, 4, 16, 96].iter() {
            for &bits8 in [0_u32, 8, 40, 120, 248].iter() {
                let k = cb.max_k_for_bits(n, bits8);
                if k > 0 {
                    assert!(cb.bits8(n, k) <= bits8);
                    assert!(cb.v(n, k) < 1 << 31);
                }
            }
        }
    }

    #[test]
    fn test_normalize_pulses() {
        let pulses = [3, 0, -4, 0];
        let mut out = [0.0_f32; 4];
        normalize_pulses(&pulses, &mut out);
        let norm: f32 = out.iter().map(|v| v * v).sum();
        assert!((norm - 1.0).abs() < 1e-6);
        assert!((out[0] - 0.6).abs() < 1e-6);
        assert!((out[2] + 0.8).abs() < 1e-6);
    }
}
