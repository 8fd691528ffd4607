//! Implements the FFT used for the MDCT.
//!
//! A mixed-radix (2/3/5) decimation-in-time transform, sized for the MDCT's
//! quarter-frame lengths (30, 60, 120, 240). Twiddles are computed once at
//! plan creation; the transform itself never allocates.

use std::f64::consts::PI;

use num_complex::Complex;

pub(crate) type Complex32 = Complex<f32>;

/// A fixed-size FFT plan.
pub(crate) struct Fft {
    n: usize,
    /// exp(-2 pi i t / n) for t in 0..n.
    twiddles: Vec<Complex32>,
}

impl Fft {
    /// Creates a plan for transforms of length `n`. The length must factor
    /// into powers of 2, 3 and 5.
    pub(crate) fn new(n: usize) -> Self {
        debug_assert!(n > 0);
        let twiddles = (0..n)
            .map(|t| {
                let angle = -2.0 * PI * t as f64 / n as f64;
                Complex32::new(angle.cos() as f32, angle.sin() as f32)
            })
            .collect();

        Self { n, twiddles }
    }

    /// Transform length of this plan.
    pub(crate) fn len(&self) -> usize {
        self.n
    }

    /// Runs the forward transform of `input` into `output`.
    ///
    /// Both slices must be exactly `len()` long.
    pub(crate) fn forward(&self, input: &[Complex32], output: &mut [Complex32]) {
        debug_assert_eq!(input.len(), self.n);
        debug_assert_eq!(output.len(), self.n);
        self.recurse(input, 1, output, self.n, 1);
    }

    /// Decimation step: `input` is read at the given stride, `out` receives
    /// `n` transformed values. `tw_stride` maps sub-transform bins onto the
    /// root twiddle table.
    fn recurse(
        &self,
        input: &[Complex32],
        stride: usize,
        out: &mut [Complex32],
        n: usize,
        tw_stride: usize,
    ) {
        if n == 1 {
            out[0] = input[0];
            return;
        }

        let radix = [2, 3, 5].iter().copied().find(|r| n % r == 0);
        let radix = match radix {
            Some(r) => r,
            None => {
                // Prime length fallback: direct transform.
                for (k, o) in out.iter_mut().enumerate().take(n) {
                    let mut acc = Complex32::new(0.0, 0.0);
                    for m in 0..n {
                        acc += input[m * stride] * self.twiddles[(m * k * tw_stride) % self.n];
                    }
                    *o = acc;
                }
                return;
            }
        };

        let m = n / radix;
        for q in 0..radix {
            self.recurse(
                &input[q * stride..],
                stride * radix,
                &mut out[q * m..(q + 1) * m],
                m,
                tw_stride * radix,
            );
        }

        // Butterfly combine: gather the sub-transform bins, then scatter
        // them over the radix output groups.
        let mut ys = [Complex32::new(0.0, 0.0); 5];
        for k in 0..m {
            for (q, y) in ys.iter_mut().enumerate().take(radix) {
                *y = out[q * m + k];
            }
            for j in 0..radix {
                let idx = j * m + k;
                let mut acc = ys[0];
                for (q, &y) in ys.iter().enumerate().take(radix).skip(1) {
                    acc += y * self.twiddles[(idx * q * tw_stride) % self.n];
                }
                out[idx] = acc;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use std::f64::consts::PI;

    use nanorand::RNG;

    use super::*;

    fn dft_naive(input: &[Complex32]) -> Vec<Complex32> {
        let n = input.len();
        (0..n)
            .map(|k| {
                let mut acc = Complex::<f64>::new(0.0, 0.0);
                for (m, v) in input.iter().enumerate() {
                    let angle = -2.0 * PI * (m * k) as f64 / n as f64;
                    acc += Complex::new(f64::from(v.re), f64::from(v.im))
                        * Complex::new(angle.cos(), angle.sin());
                }
                Complex32::new(acc.re as f32, acc.im as f32)
            })
            .collect()
    }

    #[test]
    fn test_matches_naive_dft() {
        let mut rng = nanorand::WyRand::new_seed(808);
        for &n in [1_usize, 2, 3, 4, 5, 6, 15, 30, 60, 120, 240].iter() {
            let input: Vec<Complex32> = (0..n)
                .map(|_| {
                    Complex32::new(
                        rng.generate_range::<u32>(0, 2000) as f32 / 1000.0 - 1.0,
                        rng.generate_range::<u32>(0, 2000) as f32 / 1000.0 - 1.0,
                    )
                })
                .collect();

            let plan = Fft::new(n);
            let mut out = vec![Complex32::new(0.0, 0.0); n];
            plan.forward(&input, &mut out);

            let want = dft_naive(&input);
            for k in 0..n {
                let err = (out[k] - want[k]).norm();
                assert!(err < 1e-3 * (n as f32), "n {} bin {} err {}", n, k, err);
            }
        }
    }

    #[test]
    fn test_impulse_is_flat() {
        let n = 60;
        let mut input = vec![Complex32::new(0.0, 0.0); n];
        input[0] = Complex32::new(1.0, 0.0);
        let plan = Fft::new(n);
        let mut out = vec![Complex32::new(0.0, 0.0); n];
        plan.forward(&input, &mut out);
        for v in out.iter() {
            assert!((v.re - 1.0).abs() < 1e-5 && v.im.abs() < 1e-5);
        }
    }
}
