//! Bit allocation and band shape coding for the Celt layer.
//!
//! The allocator is run identically by the encoder and the decoder: any
//! divergence desynchronizes the shared range coder. Its inputs are the
//! byte budget and a handful of coded side decisions (spread, band boosts,
//! trim, intensity and dual stereo flags).

use crate::celt::cwrs::{normalize_pulses, PulseCodebook};
use crate::celt::energy::MAX_FINE_BITS;
use crate::celt::tables::{FREQ_RANGE, LOG2_FRAC, SPREAD_ICDF, STATIC_ALLOC, STATIC_CAPS, TRIM_ICDF};
use crate::celt::{band_start, band_width, MAX_BANDS, MAX_FRAME_LEN};
use crate::encoder_error::EncoderError;
use crate::math::{bitexact_cos, bitexact_log2tan, ilog};
use crate::range_coder::{RangeDecoder, RangeEncoder, Tell};
use crate::silk::excitation::lcg_step;

/// Interpolation steps between allocation rows.
const ALLOC_STEPS: usize = 6;
/// Default allocation trim.
pub(crate) const TRIM_DEFAULT: i32 = 5;

/// Side decisions coded ahead of the allocation itself.
#[derive(Clone, Copy, Debug)]
pub(crate) struct AllocParams {
    pub(crate) spread: u32,
    pub(crate) boosts: [i32; MAX_BANDS],
    pub(crate) trim: i32,
}

impl Default for AllocParams {
    fn default() -> Self {
        Self {
            spread: 2,
            boosts: [0; MAX_BANDS],
            trim: TRIM_DEFAULT,
        }
    }
}

/// Per-band bit budget produced by the allocator.
#[derive(Clone, Copy)]
pub(crate) struct Allocation {
    /// PVQ budget per band in 1/8 bit units, all channels together.
    pub(crate) shape_bits8: [i32; MAX_BANDS],
    /// Fine energy bits per band and channel.
    pub(crate) fine_bits: [u32; MAX_BANDS],
    /// Reserved 1/8 bits for the anti-collapse flag.
    pub(crate) anti_collapse_rsv: i32,
    /// Reserved 1/8 bits for the intensity boundary, zero when absent.
    pub(crate) intensity_rsv: i32,
    /// Reserved 1/8 bits for the dual stereo flag, zero when absent.
    pub(crate) dual_rsv: i32,
}

/// Maximum PVQ bits each band may absorb, in 1/8 bit units.
fn caps(lm: usize, channels: usize, band: usize) -> i32 {
    let cap = i32::from(STATIC_CAPS[lm][channels - 1][band]);
    (cap + 64) * i32::from(FREQ_RANGE[band]) << (channels - 1) << lm >> 2
}

/// Decodes the allocation side decisions.
pub(crate) fn decode_alloc_params(
    dec: &mut RangeDecoder<'_>,
    lm: usize,
    channels: usize,
    start: usize,
    end: usize,
    total_bits: u32,
) -> AllocParams {
    let mut params = AllocParams::default();

    if total_bits.saturating_sub(dec.tell()) > 4 {
        params.spread = dec.decode_icdf(&SPREAD_ICDF, 5);
    }

    let total_bits8 = total_bits << 3;
    let mut dynalloc_logp = 6_u32;
    for band in start..end {
        let quanta = quanta_for(band, lm, channels);
        let mut band_logp = dynalloc_logp;
        loop {
            let tell8 = dec.tell_frac();
            if tell8 + (band_logp << 3) >= total_bits8
                || params.boosts[band] + quanta > caps(lm, channels, band)
            {
                break;
            }
            if !dec.decode_bit_logp(band_logp) {
                break;
            }
            params.boosts[band] += quanta;
            band_logp = 1;
        }
        if params.boosts[band] > 0 && dynalloc_logp > 2 {
            dynalloc_logp -= 1;
        }
    }

    if dec.tell_frac() + (6 << 3) <= total_bits8 {
        params.trim = dec.decode_icdf(&TRIM_ICDF, 7) as i32;
    }

    params
}

/// Encodes the allocation side decisions; exact mirror of
/// [`decode_alloc_params`].
///
/// The boosts are updated in place to what the budget actually allowed, so
/// the caller allocates from the values the decoder will see.
pub(crate) fn encode_alloc_params(
    enc: &mut RangeEncoder<'_>,
    params: &mut AllocParams,
    lm: usize,
    channels: usize,
    start: usize,
    end: usize,
    total_bits: u32,
) -> Result<(), EncoderError> {
    if total_bits.saturating_sub(enc.tell()) > 4 {
        enc.encode_icdf(params.spread as usize, &SPREAD_ICDF, 5)?;
    }

    let total_bits8 = total_bits << 3;
    let mut dynalloc_logp = 6_u32;
    for band in start..end {
        let quanta = quanta_for(band, lm, channels);
        let mut band_logp = dynalloc_logp;
        let mut remaining = params.boosts[band];
        let mut emitted = 0;
        loop {
            let tell8 = enc.tell_frac();
            if tell8 + (band_logp << 3) >= total_bits8
                || emitted + quanta > caps(lm, channels, band)
            {
                break;
            }
            let more = remaining >= quanta;
            enc.encode_bit_logp(u32::from(more), band_logp)?;
            if !more {
                break;
            }
            remaining -= quanta;
            emitted += quanta;
            band_logp = 1;
        }
        params.boosts[band] = emitted;
        if emitted > 0 && dynalloc_logp > 2 {
            dynalloc_logp -= 1;
        }
    }

    if enc.tell_frac() + (6 << 3) <= total_bits8 {
        enc.encode_icdf(params.trim as usize, &TRIM_ICDF, 7)?;
    }

    Ok(())
}

/// Boost step of one band in 1/8 bit units.
fn quanta_for(band: usize, lm: usize, channels: usize) -> i32 {
    let width = (i32::from(FREQ_RANGE[band]) << lm) << (channels - 1);
    (width << 3).min(width.max(6 << 3))
}

/// Computes the per-band budget from the remaining bit budget and the coded
/// side decisions. Pure function of its arguments.
#[allow(clippy::too_many_arguments)]
pub(crate) fn compute_allocation(
    lm: usize,
    channels: usize,
    start: usize,
    end: usize,
    available_bits8: i32,
    params: &AllocParams,
    transient: bool,
) -> Allocation {
    let c = channels as i32;
    let mut alloc = Allocation {
        shape_bits8: [0; MAX_BANDS],
        fine_bits: [0; MAX_BANDS],
        anti_collapse_rsv: 0,
        intensity_rsv: 0,
        dual_rsv: 0,
    };

    let mut available = (available_bits8 - 1).max(0);

    // Anti-collapse flag is only worth reserving for longer transient
    // frames.
    if transient && lm >= 2 && available >= ((lm as i32) + 2) << 3 {
        alloc.anti_collapse_rsv = 1 << 3;
        available -= 1 << 3;
    }

    if channels == 2 {
        let intensity = i32::from(LOG2_FRAC[end - start]);
        if intensity <= available {
            alloc.intensity_rsv = intensity;
            available -= intensity;
            if available >= 1 << 3 {
                alloc.dual_rsv = 1 << 3;
                available -= 1 << 3;
            }
        }
    }

    // Thresholds below which a band is not worth coding, and the trim tilt.
    let mut threshold = [0_i32; MAX_BANDS];
    let mut trim_offset = [0_i32; MAX_BANDS];
    for band in start..end {
        let width = i32::from(FREQ_RANGE[band]);
        threshold[band] = ((3 * width) << lm << 3 >> 4).max(c << 3);
        trim_offset[band] = (params.trim - 5 - lm as i32)
            * width
            * ((end - band) as i32 - 1)
            * (1 << (lm + 3))
            * (c)
            >> 6;
        if (width << lm) == 1 {
            trim_offset[band] -= c << 3;
        }
    }

    let band_bits_for_row = |row: usize, band: usize| -> i32 {
        let width = i32::from(FREQ_RANGE[band]);
        let bits = (width * i32::from(STATIC_ALLOC[row][band])) << (channels - 1) << lm >> 2;
        if bits != 0 {
            (bits + trim_offset[band]).max(0)
        } else {
            bits
        }
    };

    let total_for = |bits_of: &dyn Fn(usize) -> i32| -> i32 {
        let mut total = 0;
        let mut done = false;
        for band in (start..end).rev() {
            let bits = bits_of(band);
            if bits >= threshold[band] || done {
                done = true;
                total += bits.min(caps(lm, channels, band));
            } else if bits >= c << 3 {
                total += c << 3;
            }
        }
        total
    };

    // Bisect the static allocation rows.
    let mut low = 1_usize;
    let mut high = STATIC_ALLOC.len() - 1;
    while low <= high {
        let center = (low + high) / 2;
        let total = total_for(&|band| band_bits_for_row(center, band) + params.boosts[band]);
        if total > available {
            if center == 0 {
                break;
            }
            high = center - 1;
        } else {
            low = center + 1;
        }
    }
    let hi_row = low.min(STATIC_ALLOC.len() - 1);
    let lo_row = hi_row - 1;

    // Interpolate between the bracketing rows.
    let mut bits1 = [0_i32; MAX_BANDS];
    let mut bits2 = [0_i32; MAX_BANDS];
    for band in start..end {
        bits1[band] = band_bits_for_row(lo_row, band) + params.boosts[band];
        bits2[band] =
            (band_bits_for_row(hi_row, band) + params.boosts[band] - bits1[band]).max(0);
    }

    let mut lo_frac = 0_i32;
    let mut hi_frac = 1 << ALLOC_STEPS;
    for _ in 0..ALLOC_STEPS {
        let mid = (lo_frac + hi_frac) / 2;
        let total = total_for(&|band| bits1[band] + ((mid * bits2[band]) >> ALLOC_STEPS));
        if total > available {
            hi_frac = mid;
        } else {
            lo_frac = mid;
        }
    }

    // Materialize the final allocation with the skip logic frozen.
    let mut done = false;
    for band in (start..end).rev() {
        let mut bits = bits1[band] + ((lo_frac * bits2[band]) >> ALLOC_STEPS);
        if bits >= threshold[band] || done {
            done = true;
        } else {
            bits = if bits >= c << 3 { c << 3 } else { 0 };
        }
        let bits = bits.min(caps(lm, channels, band));

        // Carve fine energy out of the band budget: half the per-sample
        // resolution, capped at 8 bits.
        let den = c * band_width(band, lm) as i32;
        let fine = ((bits / den) >> 4).max(0).min(MAX_FINE_BITS as i32) as u32;
        alloc.fine_bits[band] = fine;
        alloc.shape_bits8[band] = (bits - ((fine as i32 * c) << 3)).max(0);
    }

    alloc
}

/// Decodes the intensity boundary and dual stereo flag reserved by the
/// allocator.
pub(crate) fn decode_stereo_params(
    dec: &mut RangeDecoder<'_>,
    start: usize,
    end: usize,
    alloc: &Allocation,
) -> (usize, bool) {
    let intensity = if alloc.intensity_rsv > 0 {
        start + dec.decode_uint((end - start + 1) as u32) as usize
    } else {
        end
    };
    let dual = if alloc.dual_rsv > 0 {
        dec.decode_bit_logp(1)
    } else {
        false
    };
    (intensity.min(end), dual)
}

/// Encodes the intensity boundary and dual stereo flag.
pub(crate) fn encode_stereo_params(
    enc: &mut RangeEncoder<'_>,
    start: usize,
    end: usize,
    alloc: &Allocation,
    intensity: usize,
    dual: bool,
) -> Result<(), EncoderError> {
    if alloc.intensity_rsv > 0 {
        enc.encode_uint((intensity - start) as u32, (end - start + 1) as u32)?;
    }
    if alloc.dual_rsv > 0 {
        enc.encode_bit_logp(u32::from(dual), 1)?;
    }
    Ok(())
}

/// Theta resolution for a mid/side band budget.
fn theta_steps(bits8: i32) -> u32 {
    if bits8 >= 16 << 3 {
        16
    } else if bits8 >= 8 << 3 {
        8
    } else {
        4
    }
}

/// Splits a stereo band budget between mid and side for the given theta.
///
/// Returns `(mid_bits8, side_bits8, remaining_bits8)`.
fn split_theta_bits(n: usize, bits8: i32, qn: u32, itheta: u32) -> (i32, i32) {
    let theta_cost = (ilog(qn) << 3) as i32;
    let b = (bits8 - theta_cost).max(0);

    let itheta_q14 = (itheta * 16384 / qn) as i16;
    let imid = i32::from(bitexact_cos(itheta_q14));
    let iside = i32::from(bitexact_cos(16384 - itheta_q14));
    let delta8 = ((n as i32 - 1) * bitexact_log2tan(iside, imid)) >> 8;

    let mbits = ((b - delta8) / 2).max(0).min(b);
    let sbits = b - mbits;
    (mbits, sbits)
}

/// Gains of the mid and side components for a coded theta.
pub(crate) fn theta_gains(qn: u32, itheta: u32) -> (f32, f32) {
    let itheta_q14 = (itheta * 16384 / qn) as i16;
    let g_mid = f32::from(bitexact_cos(itheta_q14)) / 32768.0;
    let g_side = f32::from(bitexact_cos(16384 - itheta_q14)) / 32768.0;
    (g_mid, g_side)
}

/// Collapse mask of a pulse vector: one bit per short block that received
/// at least one pulse.
fn collapse_mask(pulses: &[i32], blocks: usize) -> u8 {
    if blocks == 1 {
        return u8::from(pulses.iter().any(|&p| p != 0));
    }
    let mut mask = 0_u8;
    for (i, &p) in pulses.iter().enumerate() {
        if p != 0 {
            mask |= 1 << (i % blocks).min(7);
        }
    }
    mask
}

/// Reconstructs an uncoded band by folding the previous spectrum content,
/// or noise when no donor exists, with LCG-driven sign flips.
fn fold_band(
    norm: &mut [f32; MAX_FRAME_LEN],
    band: usize,
    lm: usize,
    start_band: usize,
    seed: &mut u32,
) {
    let begin = band_start(band, lm);
    let n = band_width(band, lm);
    let lowest = band_start(start_band, lm);

    for i in 0..n {
        let r = lcg_step(seed);
        let value = if begin >= lowest + n {
            // Fold the block immediately below, sign-randomized.
            let v = norm[begin - n + i];
            if r & 0x8000 != 0 {
                -v
            } else {
                v
            }
        } else {
            // No donor: uniform noise.
            (r >> 16) as i16 as f32 / 32768.0
        };
        norm[begin + i] = value;
    }

    // Restore the unit norm the shape contract promises.
    let energy: f32 = norm[begin..begin + n].iter().map(|v| v * v).sum();
    if energy > 1e-15 {
        let scale = 1.0 / energy.sqrt();
        for v in norm[begin..begin + n].iter_mut() {
            *v *= scale;
        }
    } else {
        let scale = 1.0 / (n as f32).sqrt();
        for v in norm[begin..begin + n].iter_mut() {
            *v = scale;
        }
    }
}

/// Decodes all band shapes into unit-norm spectra.
#[allow(clippy::too_many_arguments)]
pub(crate) fn decode_bands(
    dec: &mut RangeDecoder<'_>,
    cb: &PulseCodebook,
    lm: usize,
    channels: usize,
    start: usize,
    end: usize,
    alloc: &Allocation,
    intensity: usize,
    dual: bool,
    transient: bool,
    seed: &mut u32,
    norm: &mut [[f32; MAX_FRAME_LEN]; 2],
    collapse: &mut [u8; MAX_BANDS],
) {
    let blocks = if transient { 1 << lm } else { 1 };
    let mut pulses = [0_i32; MAX_FRAME_LEN];

    for band in start..end {
        let begin = band_start(band, lm);
        let n = band_width(band, lm);
        let bits8 = alloc.shape_bits8[band];
        collapse[band] = 0;

        if channels == 1 {
            let k = cb.max_k_for_bits(n, bits8.max(0) as u32);
            if k > 0 {
                let count = cb.v(n, k) as u32;
                let index = dec.decode_uint(count);
                cb.decode_pulses(index, k, &mut pulses[..n]);
                normalize_pulses(&pulses[..n], &mut norm[0][begin..begin + n]);
                collapse[band] = collapse_mask(&pulses[..n], blocks);
            } else {
                fold_band(&mut norm[0], band, lm, start, seed);
            }
            continue;
        }

        if band >= intensity {
            // Intensity: one shape for both channels plus an inversion flag.
            let k = cb.max_k_for_bits(n, (bits8 - 8).max(0) as u32);
            let invert = dec.decode_bits(1) == 1;
            if k > 0 {
                let count = cb.v(n, k) as u32;
                let index = dec.decode_uint(count);
                cb.decode_pulses(index, k, &mut pulses[..n]);
                normalize_pulses(&pulses[..n], &mut norm[0][begin..begin + n]);
                collapse[band] = collapse_mask(&pulses[..n], blocks);
            } else {
                fold_band(&mut norm[0], band, lm, start, seed);
            }
            for i in 0..n {
                let v = norm[0][begin + i];
                norm[1][begin + i] = if invert { -v } else { v };
            }
        } else if dual {
            // Independent shapes, half the budget each.
            for c in 0..2 {
                let k = cb.max_k_for_bits(n, (bits8 / 2).max(0) as u32);
                if k > 0 {
                    let count = cb.v(n, k) as u32;
                    let index = dec.decode_uint(count);
                    cb.decode_pulses(index, k, &mut pulses[..n]);
                    normalize_pulses(&pulses[..n], &mut norm[c][begin..begin + n]);
                    collapse[band] |= collapse_mask(&pulses[..n], blocks);
                } else {
                    fold_band(&mut norm[c], band, lm, start, seed);
                }
            }
        } else {
            // Mid/side with a coded angle.
            let qn = theta_steps(bits8);
            let itheta = dec.decode_uint(qn + 1).min(qn);
            let (mbits, sbits) = split_theta_bits(n, bits8, qn, itheta);
            let (g_mid, g_side) = theta_gains(qn, itheta);

            let mut mid = [0.0_f32; 176];
            let mut side = [0.0_f32; 176];

            let km = cb.max_k_for_bits(n, mbits.max(0) as u32);
            if km > 0 {
                let count = cb.v(n, km) as u32;
                let index = dec.decode_uint(count);
                cb.decode_pulses(index, km, &mut pulses[..n]);
                normalize_pulses(&pulses[..n], &mut mid[..n]);
                collapse[band] |= collapse_mask(&pulses[..n], blocks);
            } else {
                fold_band(&mut norm[0], band, lm, start, seed);
                mid[..n].copy_from_slice(&norm[0][begin..begin + n]);
            }

            let ks = cb.max_k_for_bits(n, sbits.max(0) as u32);
            if ks > 0 {
                let count = cb.v(n, ks) as u32;
                let index = dec.decode_uint(count);
                cb.decode_pulses(index, ks, &mut pulses[..n]);
                normalize_pulses(&pulses[..n], &mut side[..n]);
                collapse[band] |= collapse_mask(&pulses[..n], blocks);
            }

            for i in 0..n {
                norm[0][begin + i] = g_mid * mid[i] + g_side * side[i];
                norm[1][begin + i] = g_mid * mid[i] - g_side * side[i];
            }
            renormalize(&mut norm[0][begin..begin + n]);
            renormalize(&mut norm[1][begin..begin + n]);
        }
    }
}

/// Encodes all band shapes; the exact mirror of [`decode_bands`].
#[allow(clippy::too_many_arguments)]
pub(crate) fn encode_bands(
    enc: &mut RangeEncoder<'_>,
    cb: &PulseCodebook,
    lm: usize,
    channels: usize,
    start: usize,
    end: usize,
    alloc: &Allocation,
    intensity: usize,
    dual: bool,
    norm: &[[f32; MAX_FRAME_LEN]; 2],
) -> Result<(), EncoderError> {
    let mut pulses = [0_i32; MAX_FRAME_LEN];
    let mut shape = [0.0_f32; 176];

    for band in start..end {
        let begin = band_start(band, lm);
        let n = band_width(band, lm);
        let bits8 = alloc.shape_bits8[band];

        if channels == 1 {
            let k = cb.max_k_for_bits(n, bits8.max(0) as u32);
            if k > 0 {
                quantize_shape(&norm[0][begin..begin + n], k, &mut pulses[..n]);
                let count = cb.v(n, k) as u32;
                enc.encode_uint(cb.encode_pulses(&pulses[..n]), count)?;
            }
            continue;
        }

        if band >= intensity {
            // Mid shape from the channel average; the inversion flag tracks
            // anti-phase content.
            let mut dot = 0.0_f32;
            for i in 0..n {
                dot += norm[0][begin + i] * norm[1][begin + i];
            }
            let invert = dot < 0.0;
            enc.encode_bits(u32::from(invert), 1)?;

            let k = cb.max_k_for_bits(n, (bits8 - 8).max(0) as u32);
            if k > 0 {
                for i in 0..n {
                    let r = if invert {
                        norm[1][begin + i] * -1.0
                    } else {
                        norm[1][begin + i]
                    };
                    shape[i] = 0.5 * (norm[0][begin + i] + r);
                }
                quantize_shape(&shape[..n], k, &mut pulses[..n]);
                let count = cb.v(n, k) as u32;
                enc.encode_uint(cb.encode_pulses(&pulses[..n]), count)?;
            }
        } else if dual {
            for c in 0..2 {
                let k = cb.max_k_for_bits(n, (bits8 / 2).max(0) as u32);
                if k > 0 {
                    quantize_shape(&norm[c][begin..begin + n], k, &mut pulses[..n]);
                    let count = cb.v(n, k) as u32;
                    enc.encode_uint(cb.encode_pulses(&pulses[..n]), count)?;
                }
            }
        } else {
            // Mid/side: derive the angle from the channel energies.
            let mut mid = [0.0_f32; 176];
            let mut side = [0.0_f32; 176];
            let mut e_mid = 0.0_f32;
            let mut e_side = 0.0_f32;
            for i in 0..n {
                mid[i] = 0.5 * (norm[0][begin + i] + norm[1][begin + i]);
                side[i] = 0.5 * (norm[0][begin + i] - norm[1][begin + i]);
                e_mid += mid[i] * mid[i];
                e_side += side[i] * side[i];
            }

            let qn = theta_steps(bits8);
            let theta = crate::math::fast_atan2(e_side.sqrt(), e_mid.sqrt());
            let itheta = ((theta / (std::f32::consts::PI / 2.0)) * qn as f32)
                .round()
                .max(0.0)
                .min(qn as f32) as u32;
            enc.encode_uint(itheta, qn + 1)?;

            let (mbits, sbits) = split_theta_bits(n, bits8, qn, itheta);

            renormalize(&mut mid[..n]);
            renormalize(&mut side[..n]);

            let km = cb.max_k_for_bits(n, mbits.max(0) as u32);
            if km > 0 {
                quantize_shape(&mid[..n], km, &mut pulses[..n]);
                let count = cb.v(n, km) as u32;
                enc.encode_uint(cb.encode_pulses(&pulses[..n]), count)?;
            }
            let ks = cb.max_k_for_bits(n, sbits.max(0) as u32);
            if ks > 0 {
                quantize_shape(&side[..n], ks, &mut pulses[..n]);
                let count = cb.v(n, ks) as u32;
                enc.encode_uint(cb.encode_pulses(&pulses[..n]), count)?;
            }
        }
    }

    Ok(())
}

/// Scales a slice to unit L2 norm, leaving silence untouched.
pub(crate) fn renormalize(x: &mut [f32]) {
    let energy: f32 = x.iter().map(|v| v * v).sum();
    if energy > 1e-15 {
        let scale = 1.0 / energy.sqrt();
        x.iter_mut().for_each(|v| *v *= scale);
    }
}

/// Quantizes a unit-norm shape to an integer vector with L1 norm `k`.
///
/// Greedy rounding: project, floor, then hand out the remaining pulses to
/// the positions with the largest leftover magnitude.
pub(crate) fn quantize_shape(x: &[f32], k: usize, out: &mut [i32]) {
    let n = x.len();
    let l1: f32 = x.iter().map(|v| v.abs()).sum();

    let mut assigned = 0_usize;
    if l1 > 1e-9 {
        let scale = k as f32 / l1;
        for i in 0..n {
            let p = (x[i].abs() * scale).floor() as i32;
            let p = p.min(k as i32);
            out[i] = if x[i] < 0.0 { -p } else { p };
            assigned += p as usize;
        }
    } else {
        out[..n].iter_mut().for_each(|v| *v = 0);
    }

    // Distribute the remainder by largest residual magnitude, keeping the
    // sign of the underlying sample.
    while assigned < k {
        let scale = k as f32 / l1.max(1e-9);
        let mut best = 0;
        let mut best_err = f32::MIN;
        for i in 0..n {
            let want = x[i].abs() * scale;
            let err = want - out[i].abs() as f32;
            if err > best_err {
                best_err = err;
                best = i;
            }
        }
        if x[best] < 0.0 {
            out[best] -= 1;
        } else {
            out[best] += 1;
        }
        assigned += 1;
    }

    // Over-assignment can only come from the floor of negative zero areas;
    // trim from the smallest residuals.
    while assigned > k {
        let mut best = 0;
        let mut found = false;
        let mut best_err = f32::MAX;
        let scale = k as f32 / l1.max(1e-9);
        for i in 0..n {
            if out[i] != 0 {
                let want = x[i].abs() * scale;
                let err = want - out[i].abs() as f32;
                if err < best_err {
                    best_err = err;
                    best = i;
                    found = true;
                }
            }
        }
        if !found {
            break;
        }
        out[best] -= out[best].signum();
        assigned -= 1;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use nanorand::RNG;

    use super::*;
    use crate::range_coder::{RangeDecoder, RangeEncoder};

    #[test]
    fn test_quantize_shape_hits_norm() {
        let mut rng = nanorand::WyRand::new_seed(11);
        for _ in 0..200 {
            let n = rng.generate_range::<u32>(1, 32) as usize;
            let k = rng.generate_range::<u32>(1, 16) as usize;
            let mut x: Vec<f32> = (0..n)
                .map(|_| rng.generate_range::<u32>(0, 2000) as f32 / 1000.0 - 1.0)
                .collect();
            renormalize(&mut x);

            let mut out = vec![0_i32; n];
            quantize_shape(&x, k, &mut out);
            let l1: i32 = out.iter().map(|p| p.abs()).sum();
            assert_eq!(l1 as usize, k, "vector {:?}", out);
        }
    }

    #[test]
    fn test_allocation_is_deterministic_and_bounded() {
        let params = AllocParams::default();
        for lm in 0..4 {
            for &channels in [1_usize, 2].iter() {
                for &budget in [100_i32, 800, 2000, 8000].iter() {
                    let a = compute_allocation(lm, channels, 0, 21, budget, &params, false);
                    let b = compute_allocation(lm, channels, 0, 21, budget, &params, false);

                    let mut total = 0;
                    for band in 0..21 {
                        assert_eq!(a.shape_bits8[band], b.shape_bits8[band]);
                        assert_eq!(a.fine_bits[band], b.fine_bits[band]);
                        assert!(a.shape_bits8[band] >= 0);
                        assert!(a.fine_bits[band] <= 8);
                        total += a.shape_bits8[band]
                            + ((a.fine_bits[band] as i32 * channels as i32) << 3);
                    }
                    // The allocation never promises more than the budget.
                    assert!(
                        total <= budget,
                        "lm {} ch {} budget {}: allocated {}",
                        lm,
                        channels,
                        budget,
                        total
                    );
                }
            }
        }
    }

    #[test]
    fn test_alloc_params_round_trip() {
        let mut params = AllocParams::default();
        params.spread = 1;
        params.trim = 7;
        params.boosts[3] = quanta_for(3, 2, 1);

        let mut buffer = vec![0_u8; 256];
        let mut enc = RangeEncoder::new(&mut buffer);
        encode_alloc_params(&mut enc, &mut params, 2, 1, 0, 21, 1600).unwrap();
        enc.done().unwrap();
        drop(enc);

        let mut dec = RangeDecoder::new(&buffer);
        let decoded = decode_alloc_params(&mut dec, 2, 1, 0, 21, 1600);

        assert_eq!(decoded.spread, params.spread);
        assert_eq!(decoded.trim, params.trim);
        assert_eq!(decoded.boosts, params.boosts);
    }

    #[test]
    fn test_band_round_trip_mono() {
        let mut rng = nanorand::WyRand::new_seed(2121);
        let cb = PulseCodebook::new();
        let lm = 1;
        let channels = 1;
        let alloc_params = AllocParams::default();
        let alloc = compute_allocation(lm, channels, 0, 17, 4000, &alloc_params, false);

        let mut norm = Box::new([[0.0_f32; MAX_FRAME_LEN]; 2]);
        for band in 0..17 {
            let begin = band_start(band, lm);
            let n = band_width(band, lm);
            for i in 0..n {
                norm[0][begin + i] = rng.generate_range::<u32>(0, 2000) as f32 / 1000.0 - 1.0;
            }
            renormalize(&mut norm[0][begin..begin + n]);
        }

        let mut buffer = vec![0_u8; 2048];
        let mut enc = RangeEncoder::new(&mut buffer);
        encode_bands(&mut enc, &cb, lm, channels, 0, 17, &alloc, 17, false, &norm).unwrap();
        enc.done().unwrap();
        drop(enc);

        let mut dec = RangeDecoder::new(&buffer);
        let mut out = Box::new([[0.0_f32; MAX_FRAME_LEN]; 2]);
        let mut collapse = [0_u8; MAX_BANDS];
        let mut seed = 0_u32;
        decode_bands(
            &mut dec, &cb, lm, channels, 0, 17, &alloc, 17, false, false, &mut seed, &mut out,
            &mut collapse,
        );

        // Bands with pulses correlate strongly with the source shape.
        for band in 0..17 {
            let begin = band_start(band, lm);
            let n = band_width(band, lm);
            if cb.max_k_for_bits(n, alloc.shape_bits8[band].max(0) as u32) >= 2 {
                let mut dot = 0.0_f32;
                for i in 0..n {
                    dot += out[0][begin + i] * norm[0][begin + i];
                }
                assert!(
                    dot > 0.3,
                    "band {} decorrelated: dot {} (k {})",
                    band,
                    dot,
                    cb.max_k_for_bits(n, alloc.shape_bits8[band].max(0) as u32)
                );
            }
        }
    }
}
