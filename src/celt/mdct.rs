//! Implements the modified discrete cosine transform.
//!
//! This is a simple MDCT implementation that uses a N/2 complex FFT to do
//! most of the work: the 2N-point MDCT folds into an N-point DCT-IV, which
//! in turn maps onto the FFT with one pre- and one post-twiddle.
//!
//! The window is the Vorbis power-complementary window applied over the
//! `OVERLAP` region, with a flat top and zero padding for frames longer
//! than one short block. Analysis and synthesis use the same window, so
//! overlap-add reconstructs exactly with a fixed `OVERLAP` sample delay.

use std::f64::consts::PI;

use crate::celt::fft::{Complex32, Fft};
use crate::celt::OVERLAP;

/// An MDCT plan for one frame size.
///
/// `n` is the number of spectral bins; the transform reads 2n windowed
/// samples.
pub(crate) struct Mdct {
    n: usize,
    fft: Fft,
    /// exp(-i pi m / n) for the DCT-IV input rotation.
    pre_twiddle: Vec<Complex32>,
    /// exp(-i pi (k + 1/4) / n) for the DCT-IV output rotation.
    post_twiddle: Vec<Complex32>,
    /// Symmetric window over 2n samples.
    window: Vec<f32>,
    /// FFT work buffers, allocated once.
    fft_in: Vec<Complex32>,
    fft_out: Vec<Complex32>,
    fold: Vec<f32>,
    dct: Vec<f32>,
}

impl Mdct {
    /// Creates a plan producing `n` bins.
    pub(crate) fn new(n: usize) -> Self {
        debug_assert!(n % 4 == 0 && n >= OVERLAP);
        let half = n / 2;

        let pre_twiddle = (0..half)
            .map(|m| {
                let angle = -PI * m as f64 / n as f64;
                Complex32::new(angle.cos() as f32, angle.sin() as f32)
            })
            .collect();
        let post_twiddle = (0..half)
            .map(|k| {
                let angle = -PI * (k as f64 + 0.25) / n as f64;
                Complex32::new(angle.cos() as f32, angle.sin() as f32)
            })
            .collect();

        // Vorbis window ramp over OVERLAP samples, flat top, zero padding.
        let pad = (n - OVERLAP) / 2;
        let mut window = vec![0.0_f32; 2 * n];
        for j in 0..OVERLAP {
            let inner = (PI * (j as f64 + 0.5) / (2.0 * OVERLAP as f64)).sin();
            window[pad + j] = (PI / 2.0 * inner * inner).sin() as f32;
        }
        for w in window.iter_mut().take(n).skip(pad + OVERLAP) {
            *w = 1.0;
        }
        for i in n..2 * n {
            window[i] = window[2 * n - 1 - i];
        }

        Self {
            n,
            fft: Fft::new(half),
            pre_twiddle,
            post_twiddle,
            window,
            fft_in: vec![Complex32::new(0.0, 0.0); half],
            fft_out: vec![Complex32::new(0.0, 0.0); half],
            fold: vec![0.0; n],
            dct: vec![0.0; n],
        }
    }

    /// Number of spectral bins.
    pub(crate) fn len(&self) -> usize {
        self.n
    }

    /// The analysis/synthesis window over `2 * len()` samples.
    pub(crate) fn window(&self) -> &[f32] {
        &self.window
    }

    /// Zero-padding before the window ramp.
    pub(crate) fn pad(&self) -> usize {
        (self.n - OVERLAP) / 2
    }

    /// Unnormalized DCT-IV of `input` into `output` (both `n` long).
    fn dct4(&mut self, input: &[f32], output: &mut [f32]) {
        let n = self.n;
        let half = n / 2;

        for m in 0..half {
            let z = Complex32::new(input[2 * m], input[n - 1 - 2 * m]);
            self.fft_in[m] = z * self.pre_twiddle[m];
        }
        self.fft.forward(&self.fft_in, &mut self.fft_out);
        for k in 0..half {
            let zk = self.fft_out[k] * self.post_twiddle[k];
            output[2 * k] = zk.re;
            output[n - 1 - 2 * k] = -zk.im;
        }
    }

    /// Forward MDCT of 2n windowed samples into n bins.
    pub(crate) fn forward(&mut self, input: &[f32], output: &mut [f32]) {
        let n = self.n;
        debug_assert_eq!(input.len(), 2 * n);
        debug_assert!(output.len() >= n);
        let half = n / 2;

        // Time-domain aliasing fold: 2n -> n.
        for i in 0..half {
            self.fold[i] = -input[3 * half - 1 - i] - input[3 * half + i];
        }
        for i in half..n {
            self.fold[i] = input[i - half] - input[3 * half - 1 - i];
        }

        let fold = std::mem::take(&mut self.fold);
        let mut dct = std::mem::take(&mut self.dct);
        self.dct4(&fold, &mut dct[..]);
        output[..n].copy_from_slice(&dct);
        self.fold = fold;
        self.dct = dct;
    }

    /// Inverse MDCT of n bins into 2n samples (unwindowed).
    pub(crate) fn inverse(&mut self, input: &[f32], output: &mut [f32]) {
        let n = self.n;
        debug_assert!(input.len() >= n);
        debug_assert_eq!(output.len(), 2 * n);
        let half = n / 2;
        let scale = 2.0 / n as f32;

        let mut dct = std::mem::take(&mut self.dct);
        self.dct4(&input[..n], &mut dct[..]);

        for j in 0..half {
            output[j] = scale * dct[half + j];
        }
        for j in 0..n {
            output[half + j] = -scale * dct[n - 1 - j];
        }
        for j in 0..half {
            output[3 * half + j] = -scale * dct[j];
        }

        self.dct = dct;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use std::f64::consts::PI;

    use nanorand::RNG;

    use super::*;

    fn mdct_direct(x: &[f32]) -> Vec<f32> {
        let n = x.len() / 2;
        (0..n)
            .map(|k| {
                let mut acc = 0.0_f64;
                for (i, &v) in x.iter().enumerate() {
                    acc += f64::from(v)
                        * (PI / n as f64
                            * (i as f64 + 0.5 + n as f64 / 2.0)
                            * (k as f64 + 0.5))
                            .cos();
                }
                acc as f32
            })
            .collect()
    }

    fn random_signal(rng: &mut nanorand::WyRand, len: usize) -> Vec<f32> {
        (0..len)
            .map(|_| rng.generate_range::<u32>(0, 2000) as f32 / 1000.0 - 1.0)
            .collect()
    }

    #[test]
    fn test_forward_matches_direct() {
        let mut rng = nanorand::WyRand::new_seed(120);
        for &n in [120_usize, 240].iter() {
            let x = random_signal(&mut rng, 2 * n);
            let mut plan = Mdct::new(n);
            let mut out = vec![0.0_f32; n];
            plan.forward(&x, &mut out);

            let want = mdct_direct(&x);
            for k in 0..n {
                assert!(
                    (out[k] - want[k]).abs() < 1e-2,
                    "n {} bin {}: {} vs {}",
                    n,
                    k,
                    out[k],
                    want[k]
                );
            }
        }
    }

    #[test]
    fn test_window_is_power_complementary() {
        for &n in [120_usize, 240, 480, 960].iter() {
            let plan = Mdct::new(n);
            let w = plan.window();
            for i in 0..n {
                let sum = w[i] * w[i] + w[i + n] * w[i + n];
                // Zero-padded regions pair with the flat top.
                assert!(
                    (sum - 1.0).abs() < 1e-6 || sum.abs() < 1e-12,
                    "n {} index {} sum {}",
                    n,
                    i,
                    sum
                );
            }
        }
    }

    /// Windowed MDCT -> IMDCT -> overlap-add reconstructs the input within
    /// floating point error for every supported frame size.
    #[test]
    fn test_round_trip_with_overlap_add() {
        let mut rng = nanorand::WyRand::new_seed(480);

        for &n in [120_usize, 240, 480, 960].iter() {
            let mut plan = Mdct::new(n);
            let pad = plan.pad();
            let frames = 5;
            let src = random_signal(&mut rng, n * frames);

            let mut enc_mem = vec![0.0_f32; OVERLAP];
            let mut tail = vec![0.0_f32; OVERLAP];
            let mut out = vec![0.0_f32; n * frames];

            for f in 0..frames {
                let cur = &src[f * n..(f + 1) * n];

                // Analysis: zero-padded window support of OVERLAP past
                // samples plus the current frame.
                let mut x2n = vec![0.0_f32; 2 * n];
                for i in 0..OVERLAP {
                    x2n[pad + i] = enc_mem[i];
                }
                for i in 0..n {
                    x2n[pad + OVERLAP + i] = cur[i];
                }
                let w = plan.window().to_vec();
                for i in 0..2 * n {
                    x2n[i] *= w[i];
                }
                enc_mem.copy_from_slice(&cur[n - OVERLAP..]);

                let mut spec = vec![0.0_f32; n];
                plan.forward(&x2n, &mut spec);

                // Synthesis.
                let mut y2n = vec![0.0_f32; 2 * n];
                plan.inverse(&spec, &mut y2n);
                for i in 0..2 * n {
                    y2n[i] *= w[i];
                }

                for i in 0..OVERLAP {
                    out[f * n + i] = tail[i] + y2n[pad + i];
                }
                for i in OVERLAP..n {
                    out[f * n + i] = y2n[pad + i];
                }
                tail.copy_from_slice(&y2n[pad + n..pad + n + OVERLAP]);
            }

            // Decoded sample t corresponds to src[t - OVERLAP].
            let mut max_err = 0.0_f32;
            for t in n..n * frames {
                let err = (out[t] - src[t - OVERLAP]).abs();
                max_err = max_err.max(err);
            }
            assert!(max_err < 1e-4, "n {} max error {}", n, max_err);
        }
    }

    /// Two identical all-zero spectra produce a seamless (all zero) splice.
    #[test]
    fn test_zero_frames_are_continuous() {
        let n = 480;
        let mut plan = Mdct::new(n);
        let spec = vec![0.0_f32; n];
        let mut y = vec![0.0_f32; 2 * n];
        plan.inverse(&spec, &mut y);
        assert!(y.iter().all(|&v| v.abs() < 1e-12));
    }
}
