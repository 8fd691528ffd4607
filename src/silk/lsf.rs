//! Line spectral frequency processing for the Silk layer.
//!
//! Covers stage-2 residual dequantization, inter-frame interpolation,
//! stabilization and the conversion between normalized LSFs (Q15) and LPC
//! coefficients (Q12) in both directions.

use std::f64::consts::PI;

use crate::silk::tables::{
    LSF_PRED_MAP_NB_MB, LSF_PRED_MAP_WB, LSF_PRED_WEIGHTS_NB_MB, LSF_PRED_WEIGHTS_WB,
};
use crate::silk::MAX_LPC_ORDER;

/// Stage-2 quantization step in Q16, by wideband flag.
pub(crate) const LSF_STEP_Q16: [i32; 2] = [11796, 9830];

/// Minimum spacing between neighbouring normalized LSFs, Q15.
pub(crate) const MIN_DELTA_Q15: i32 = 250;

/// Chirp factor applied when the short-term filter is too resonant.
const BWEXPAND_CHIRP: f64 = 0.96;
/// Bound on reflection coefficient magnitude accepted as stable.
const STABILITY_LIMIT: f64 = 0.99;
/// Maximum bandwidth expansion rounds.
const MAX_BWEXPAND_ROUNDS: usize = 30;

/// Dequantizes one stage-2 residual index (already centered on zero).
fn dequant_step(res: i32, step_q16: i32) -> i32 {
    let fix = if res < 0 {
        102
    } else if res > 0 {
        -102
    } else {
        0
    };

    ((res * 1024 + fix) * step_q16) >> 16
}

/// Dequantizes the stage-2 residual vector into Q10 offsets.
///
/// Prediction runs backwards: each coefficient borrows a weighted share of
/// the next higher one, with the weight list chosen per coefficient by the
/// stage-1 index.
pub(crate) fn dequant_residuals(
    res_indices: &[i32],
    stage1: usize,
    wideband: bool,
    out_q10: &mut [i32],
) {
    let order = res_indices.len();
    let step_q16 = LSF_STEP_Q16[usize::from(wideband)];

    let mut prev: Option<i32> = None;
    for i in (0..order).rev() {
        let r = dequant_step(res_indices[i], step_q16);

        let pred = match prev {
            // The weight applies between coefficient i and i+1; the list is
            // selected per position by the stage-1 map.
            Some(p) if i + 1 < order => {
                let weight = if wideband {
                    let list = usize::from(LSF_PRED_MAP_WB[stage1][i] != 0);
                    LSF_PRED_WEIGHTS_WB[list][i]
                } else {
                    let list = usize::from(LSF_PRED_MAP_NB_MB[stage1][i] != 0);
                    LSF_PRED_WEIGHTS_NB_MB[list][i]
                };
                (p * i32::from(weight)) >> 8
            }
            _ => 0,
        };

        out_q10[i] = r + pred;
        prev = Some(out_q10[i]);
    }
}

/// Reconstructs normalized LSFs from a stage-1 codebook vector and Q10
/// residuals.
pub(crate) fn reconstruct_nlsf(base_q8: &[u8], res_q10: &[i32], out_q15: &mut [i16]) {
    for i in 0..base_q8.len() {
        let v = (i32::from(base_q8[i]) << 7) + (res_q10[i] << 5);
        out_q15[i] = v.max(0).min(32767) as i16;
    }
}

/// Interpolates between the previous and current LSF vectors with a Q2
/// weight in 0..=4.
pub(crate) fn interpolate_nlsf(prev_q15: &[i16], cur_q15: &[i16], w_q2: i32, out_q15: &mut [i16]) {
    for i in 0..cur_q15.len() {
        let p = i32::from(prev_q15[i]);
        let c = i32::from(cur_q15[i]);
        out_q15[i] = (p + ((w_q2 * (c - p)) >> 2)) as i16;
    }
}

/// Enforces ordering and minimum spacing on a normalized LSF vector.
///
/// Corrupt bitstreams can produce crossed or clustered frequencies; the
/// synthesis filter derived from such a vector would be unstable.
pub(crate) fn stabilize_nlsf(nlsf_q15: &mut [i16]) {
    let order = nlsf_q15.len() as i32;

    // Forward pass: each frequency at least MIN_DELTA above its predecessor.
    let mut floor = MIN_DELTA_Q15;
    for f in nlsf_q15.iter_mut() {
        if i32::from(*f) < floor {
            *f = floor as i16;
        }
        floor = i32::from(*f) + MIN_DELTA_Q15;
    }

    // Backward pass: keep headroom below the Nyquist end.
    let mut ceil = 32768 - MIN_DELTA_Q15;
    for f in nlsf_q15.iter_mut().rev() {
        if i32::from(*f) > ceil {
            *f = ceil as i16;
        }
        ceil = i32::from(*f) - MIN_DELTA_Q15;
    }

    debug_assert!(order * MIN_DELTA_Q15 < 32768);
}

/// Converts normalized LSFs (Q15) to LPC prediction coefficients (Q12).
///
/// The synthesis convention is `y[n] = e[n] + sum(a[k] * y[n-k])`. The
/// filter is tested for stability and bandwidth-expanded with a 0.96 chirp
/// until its reflection coefficients are inside the unit circle.
pub(crate) fn nlsf_to_lpc_q12(nlsf_q15: &[i16], out_q12: &mut [i16]) {
    let order = nlsf_q15.len();
    debug_assert!(order % 2 == 0 && order <= MAX_LPC_ORDER);

    let mut p = [0.0_f64; MAX_LPC_ORDER + 2];
    let mut q = [0.0_f64; MAX_LPC_ORDER + 2];
    let mut scratch = [0.0_f64; MAX_LPC_ORDER + 2];

    // P collects the even-indexed frequencies, Q the odd-indexed ones.
    p[0] = 1.0;
    let mut p_len = 1;
    q[0] = 1.0;
    let mut q_len = 1;

    for (i, &f) in nlsf_q15.iter().enumerate() {
        let w = f64::from(f) * PI / 32768.0;
        let c = w.cos();
        let (poly, len) = if i % 2 == 0 {
            (&mut p, &mut p_len)
        } else {
            (&mut q, &mut q_len)
        };

        // (poly * (1 - 2c x + x^2)) via scratch to avoid aliasing.
        scratch[..*len + 2].iter_mut().for_each(|v| *v = 0.0);
        for j in 0..*len {
            scratch[j] += poly[j];
            scratch[j + 1] -= 2.0 * c * poly[j];
            scratch[j + 2] += poly[j];
        }
        poly[..*len + 2].copy_from_slice(&scratch[..*len + 2]);
        *len += 2;
    }

    // P gains a root at z = -1, Q at z = 1.
    scratch[..p_len + 1].iter_mut().for_each(|v| *v = 0.0);
    for j in 0..p_len {
        scratch[j] += p[j];
        scratch[j + 1] += p[j];
    }
    p[..p_len + 1].copy_from_slice(&scratch[..p_len + 1]);

    scratch[..q_len + 1].iter_mut().for_each(|v| *v = 0.0);
    for j in 0..q_len {
        scratch[j] += q[j];
        scratch[j + 1] -= q[j];
    }
    q[..q_len + 1].copy_from_slice(&scratch[..q_len + 1]);

    // A(z) = (P(z) + Q(z)) / 2; prediction coefficients flip the sign.
    let mut a = [0.0_f64; MAX_LPC_ORDER];
    for k in 1..=order {
        a[k - 1] = -0.5 * (p[k] + q[k]);
    }

    for _ in 0..MAX_BWEXPAND_ROUNDS {
        if is_stable(&a[..order]) && fits_q12(&a[..order]) {
            break;
        }
        bandwidth_expand(&mut a[..order], BWEXPAND_CHIRP);
    }

    for k in 0..order {
        let v = (a[k] * 4096.0).round();
        out_q12[k] = v.max(-32768.0).min(32767.0) as i16;
    }
}

fn fits_q12(a: &[f64]) -> bool {
    a.iter().all(|&v| (v * 4096.0).abs() <= 32767.0)
}

/// Applies `a[k] *= chirp^(k+1)` bandwidth expansion.
pub(crate) fn bandwidth_expand(a: &mut [f64], chirp: f64) {
    let mut factor = chirp;
    for v in a.iter_mut() {
        *v *= factor;
        factor *= chirp;
    }
}

/// Tests filter stability through the reflection coefficients obtained by
/// the step-down recursion.
pub(crate) fn is_stable(a: &[f64]) -> bool {
    let order = a.len();
    let mut c = [0.0_f64; MAX_LPC_ORDER];
    let mut tmp = [0.0_f64; MAX_LPC_ORDER];
    c[..order].copy_from_slice(a);

    for m in (0..order).rev() {
        let k = c[m];
        if k.abs() >= STABILITY_LIMIT {
            return false;
        }
        let denom = 1.0 - k * k;
        for i in 0..m {
            tmp[i] = (c[i] + k * c[m - 1 - i]) / denom;
        }
        c[..m].copy_from_slice(&tmp[..m]);
    }

    true
}

/// Converts LPC prediction coefficients to normalized LSFs (Q15).
///
/// Roots of the symmetric/antisymmetric sum polynomials are located on the
/// cosine grid by sign-change scanning followed by bisection. Falls back to
/// an evenly spaced vector if root finding fails (e.g. an unstable filter),
/// which the stage-1 quantizer handles gracefully.
pub(crate) fn lpc_to_nlsf_q15(a_q12: &[i16], out_q15: &mut [i16]) {
    let order = a_q12.len();
    debug_assert!(order % 2 == 0 && order <= MAX_LPC_ORDER);
    let half = order / 2;

    // A(z) = 1 + sum(c_i z^-i) with c_i the negated prediction coefficients.
    let mut c = [0.0_f64; MAX_LPC_ORDER + 1];
    for i in 0..order {
        c[i + 1] = -f64::from(a_q12[i]) / 4096.0;
    }

    // Chebyshev series coefficients of the deflated sum and difference
    // polynomials.
    let mut f1 = [0.0_f64; MAX_LPC_ORDER / 2 + 1];
    let mut f2 = [0.0_f64; MAX_LPC_ORDER / 2 + 1];
    f1[0] = 1.0;
    f2[0] = 1.0;
    for i in 1..=half {
        f1[i] = c[i] + c[order + 1 - i] - f1[i - 1];
        f2[i] = c[i] - c[order + 1 - i] + f2[i - 1];
    }

    let eval = |f: &[f64], x: f64| -> f64 {
        // Chebyshev evaluation: f[half]/2 + sum f[i] * T_{half-i}(x).
        let mut b0 = 0.0;
        let mut b1 = 0.0;
        for i in 0..half {
            let tmp = 2.0 * x * b0 - b1 + f[i];
            b1 = b0;
            b0 = tmp;
        }
        x * b0 - b1 + f[half] / 2.0
    };

    const GRID: usize = 128;
    let mut found = 0;
    let mut use_f1 = true;
    let mut prev_x = 1.0_f64;
    let mut prev_v = eval(&f1, prev_x);

    let mut roots = [0.0_f64; MAX_LPC_ORDER];

    for g in 1..=GRID {
        if found == order {
            break;
        }
        let x = 1.0 - 2.0 * g as f64 / GRID as f64;
        let f = if use_f1 { &f1 } else { &f2 };
        let v = eval(f, x);
        if prev_v * v <= 0.0 && (prev_v != 0.0 || v != 0.0) {
            // Bisect to refine the crossing.
            let (mut lo, mut hi, mut flo) = (prev_x, x, prev_v);
            for _ in 0..24 {
                let mid = 0.5 * (lo + hi);
                let fm = eval(f, mid);
                if flo * fm <= 0.0 {
                    hi = mid;
                } else {
                    lo = mid;
                    flo = fm;
                }
            }
            let root = 0.5 * (lo + hi);
            roots[found] = root;
            found += 1;
            // Roots of P and Q interlace, switch polynomials.
            use_f1 = !use_f1;
            prev_v = eval(if use_f1 { &f1 } else { &f2 }, x);
            prev_x = x;
        } else {
            prev_v = v;
            prev_x = x;
        }
    }

    if found == order {
        for i in 0..order {
            let w = roots[i].max(-1.0).min(1.0).acos();
            out_q15[i] = ((w / PI) * 32768.0).round().max(1.0).min(32767.0) as i16;
        }
    } else {
        // Root search failed; produce an evenly spread fallback.
        for i in 0..order {
            out_q15[i] = (((i + 1) * 32768) / (order + 1)) as i16;
        }
    }

    stabilize_nlsf(&mut out_q15[..order]);
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use nanorand::RNG;

    use super::*;

    fn random_nlsf(rng: &mut nanorand::WyRand, order: usize) -> Vec<i16> {
        let mut v: Vec<i16> = (0..order)
            .map(|_| rng.generate_range::<u32>(1, 32767) as i16)
            .collect();
        v.sort_unstable();
        stabilize_nlsf(&mut v);
        v
    }

    #[test]
    fn test_stabilize_orders_and_spaces() {
        let mut v = [30000_i16, 10, 10, 25000, 500, 700, 900, 1100, 20000, 31000];
        stabilize_nlsf(&mut v);
        for i in 1..v.len() {
            assert!(
                i32::from(v[i]) - i32::from(v[i - 1]) >= MIN_DELTA_Q15,
                "spacing violated at {}",
                i
            );
        }
        assert!(i32::from(v[0]) >= MIN_DELTA_Q15);
        assert!(i32::from(v[9]) <= 32768 - MIN_DELTA_Q15);
    }

    #[test]
    fn test_lpc_from_any_stabilized_nlsf_is_stable() {
        let mut rng = nanorand::WyRand::new_seed(6716);
        for &order in [10_usize, 16].iter() {
            for _ in 0..200 {
                let nlsf = random_nlsf(&mut rng, order);
                let mut lpc = [0_i16; MAX_LPC_ORDER];
                nlsf_to_lpc_q12(&nlsf, &mut lpc[..order]);

                let a: Vec<f64> = lpc[..order]
                    .iter()
                    .map(|&v| f64::from(v) / 4096.0)
                    .collect();
                assert!(is_stable(&a), "unstable filter for {:?}", nlsf);
            }
        }
    }

    #[test]
    fn test_synthesis_stays_bounded() {
        let mut rng = nanorand::WyRand::new_seed(42);
        let nlsf = random_nlsf(&mut rng, 16);
        let mut lpc = [0_i16; 16];
        nlsf_to_lpc_q12(&nlsf, &mut lpc);

        // Drive the all-pole filter with a bounded excitation for a while.
        let mut hist = [0.0_f32; 16];
        let mut peak = 0.0_f32;
        for n in 0..4000 {
            let e = if n % 37 == 0 { 0.5 } else { -0.01 };
            let mut y = e;
            for k in 0..16 {
                y += f32::from(lpc[k]) / 4096.0 * hist[k];
            }
            let y = y.max(-1.0).min(1.0);
            hist.rotate_right(1);
            hist[0] = y;
            peak = peak.max(y.abs());
        }
        assert!(peak <= 1.0);
    }

    #[test]
    fn test_lsf_round_trip_through_lpc() {
        // NLSF -> LPC -> NLSF keeps frequencies near the originals.
        let mut rng = nanorand::WyRand::new_seed(7);
        for _ in 0..50 {
            let nlsf = random_nlsf(&mut rng, 10);
            let mut lpc = [0_i16; 10];
            nlsf_to_lpc_q12(&nlsf, &mut lpc);

            let mut back = [0_i16; 10];
            lpc_to_nlsf_q15(&lpc, &mut back);

            for i in 0..10 {
                let err = (i32::from(back[i]) - i32::from(nlsf[i])).abs();
                assert!(err < 2200, "coefficient {} error {} too big", i, err);
            }
        }
    }

    #[test]
    fn test_dequant_residuals_walk() {
        let res = [0_i32, 1, -1, 4, -4, 0, 2, -2, 3, 0];
        let mut out = [0_i32; 10];
        dequant_residuals(&res, 3, false, &mut out);

        // Zero residual with zero following prediction stays zero.
        let res0 = [0_i32; 10];
        let mut out0 = [0_i32; 10];
        dequant_residuals(&res0, 0, false, &mut out0);
        assert_eq!(out0, [0; 10]);

        // Residuals propagate backwards only.
        assert_ne!(out[0], 0);
    }
}
