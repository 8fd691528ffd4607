//! Implements the comb filter behind the Celt post-filter.
//!
//! A five-tap comb at the decoded pitch period, cross-faded from the
//! previous frame's parameters over the overlap region.

use crate::celt::tables::{COMB_FILTER_MIN_PERIOD, POSTFILTER_TAPS};

/// Constant-parameter section of the comb filter, in place.
///
/// `y[offset..offset + n]` is filtered using history before `offset`.
#[allow(clippy::many_single_char_names)]
fn comb_filter_const_inplace(
    y: &mut [f32],
    offset: usize,
    t: usize,
    n: usize,
    g10: f32,
    g11: f32,
    g12: f32,
) {
    let mut x4 = y[offset - t - 2];
    let mut x3 = y[offset - t - 1];
    let mut x2 = y[offset - t];
    let mut x1 = y[offset - t + 1];
    (0..n).into_iter().for_each(|i| {
        let x0 = y[offset + i - t + 2];
        y[offset + i] += (g10 * x2) + (g11 * (x1 + x3)) + (g12 * (x0 + x4));
        x4 = x3;
        x3 = x2;
        x2 = x1;
        x1 = x0;
    });
}

/// Applies the post-filter comb over `y[offset..offset + n]`, cross-fading
/// from the old `(t0, g0, tapset0)` parameters to the new ones over the
/// first `overlap` samples using the squared synthesis window `window`.
///
/// At least `t + 2` samples of history must precede `offset`.
#[allow(clippy::too_many_arguments)]
#[allow(clippy::many_single_char_names)]
pub(crate) fn comb_filter_inplace(
    y: &mut [f32],
    offset: usize,
    mut t0: usize,
    mut t1: usize,
    n: usize,
    g0: f32,
    g1: f32,
    tapset0: usize,
    tapset1: usize,
    window: &[f32],
) {
    if g0 == 0.0 && g1 == 0.0 {
        return;
    }

    // When the gain is zero the period may be zero as well; keep the taps
    // inside the history either way.
    t0 = usize::max(t0, COMB_FILTER_MIN_PERIOD);
    t1 = usize::max(t1, COMB_FILTER_MIN_PERIOD);

    let g00 = g0 * POSTFILTER_TAPS[tapset0][0];
    let g01 = g0 * POSTFILTER_TAPS[tapset0][1];
    let g02 = g0 * POSTFILTER_TAPS[tapset0][2];
    let g10 = g1 * POSTFILTER_TAPS[tapset1][0];
    let g11 = g1 * POSTFILTER_TAPS[tapset1][1];
    let g12 = g1 * POSTFILTER_TAPS[tapset1][2];

    // If the filter didn't change, no cross-fade is needed.
    let overlap = if (g0 - g1).abs() < f32::EPSILON && t0 == t1 && tapset0 == tapset1 {
        0
    } else {
        window.len().min(n)
    };

    let mut x1 = y[offset - t1 + 1];
    let mut x2 = y[offset - t1];
    let mut x3 = y[offset - t1 - 1];
    let mut x4 = y[offset - t1 - 2];

    for i in 0..overlap {
        let x0 = y[offset + i - t1 + 2];
        let f = window[i] * window[i];
        y[offset + i] += ((1.0 - f) * g00) * y[offset + i - t0]
            + ((1.0 - f) * g01) * (y[offset + i - t0 + 1] + y[offset + i - t0 - 1])
            + ((1.0 - f) * g02) * (y[offset + i - t0 + 2] + y[offset + i - t0 - 2])
            + (f * g10) * x2
            + (f * g11) * (x1 + x3)
            + (f * g12) * (x0 + x4);

        x4 = x3;
        x3 = x2;
        x2 = x1;
        x1 = x0;
    }

    if g1 == 0.0 || overlap >= n {
        return;
    }

    comb_filter_const_inplace(y, offset + overlap, t1, n - overlap, g10, g11, g12);
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]

    use super::*;

    #[test]
    fn test_zero_gain_is_identity() {
        let mut y: Vec<f32> = (0..256).map(|i| (i as f32 * 0.1).sin()).collect();
        let want = y.clone();
        let window = [0.5_f32; 120];
        comb_filter_inplace(&mut y, 64, 20, 20, 128, 0.0, 0.0, 0, 0, &window);
        assert_eq!(y, want);
    }

    #[test]
    fn test_comb_reinforces_periodic_signal() {
        // A signal with period 32 should gain energy from a period-32 comb.
        let period = 32;
        let mut y: Vec<f32> = (0..512)
            .map(|i| ((i % period) as f32 / period as f32 * 2.0 - 1.0) * 0.3)
            .collect();
        let before: f32 = y[128..384].iter().map(|v| v * v).sum();

        let window: Vec<f32> = (0..120).map(|i| i as f32 / 120.0).collect();
        comb_filter_inplace(
            &mut y, 128, period, period, 256, 0.5, 0.5, 0, 0, &window,
        );
        let after: f32 = y[128..384].iter().map(|v| v * v).sum();
        assert!(after > before);
    }

    #[test]
    fn test_small_period_is_clamped() {
        let mut y = vec![0.25_f32; 256];
        let window = [0.5_f32; 120];
        // A period below the minimum must not read out of range.
        comb_filter_inplace(&mut y, 64, 1, 1, 128, 0.3, 0.3, 1, 1, &window);
        assert!(y.iter().all(|v| v.is_finite()));
    }
}
