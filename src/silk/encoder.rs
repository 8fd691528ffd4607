//! Implements the Silk encoder.
//!
//! The encoder mirrors the decoder: every parameter is quantized with the
//! decoder's reconstruction rule and emitted through the same tables in the
//! same order, so the shared range coder stays in sync symbol for symbol.

use log::trace;

use crate::encoder_error::EncoderError;
use crate::range_coder::RangeEncoder;
use crate::silk::excitation::{encode_lsbs, encode_pulse_count, encode_shell_block, encode_signs};
use crate::silk::lsf::{
    dequant_residuals, lpc_to_nlsf_q15, nlsf_to_lpc_q12, reconstruct_nlsf, stabilize_nlsf,
    LSF_STEP_Q16,
};
use crate::silk::tables::*;
use crate::silk::{
    dequant_gain_q16, BandwidthConfig, QuantOffset, SignalType, LTP_ORDER, MAX_FRAME_LEN,
    MAX_LPC_ORDER, MAX_LSB_COUNT, MAX_SILK_FRAMES, MAX_SUBFRAMES, SHELL_BLOCK_LEN,
};
use crate::Bandwidth;

/// Input level below which a frame is classified inactive.
const VAD_THRESHOLD: f32 = 1e-6;
/// Normalized pitch correlation above which a frame is voiced.
const VOICED_THRESHOLD: f32 = 0.55;

/// Encoder state for one Silk channel.
#[derive(Clone)]
struct SilkChannelEncoder {
    previous_log_gain: i32,
    /// Input tail kept for LPC and LTP look-back across frames.
    input_history: [f32; MAX_FRAME_LEN + 2],
}

impl SilkChannelEncoder {
    fn new() -> Self {
        Self {
            previous_log_gain: 0,
            input_history: [0.0; MAX_FRAME_LEN + 2],
        }
    }

    fn reset(&mut self) {
        *self = Self::new();
    }

    /// Analyses and encodes one frame of `subframes * subframe_len` samples.
    fn encode_frame(
        &mut self,
        enc: &mut RangeEncoder<'_>,
        config: BandwidthConfig,
        subframes: usize,
        input: &[f32],
        vad: bool,
        independent: bool,
    ) -> Result<(), EncoderError> {
        let frame_len = config.subframe_len * subframes;
        let order = config.lpc_order;
        let wideband = config.is_wideband();

        // Classification.
        let energy: f32 = input.iter().map(|v| v * v).sum::<f32>() / frame_len as f32;
        let (pitch_lag, pitch_corr) = if vad {
            find_pitch(input, config.pitch_min, config.pitch_max)
        } else {
            (config.pitch_min, 0.0)
        };
        let voiced = vad && pitch_corr > VOICED_THRESHOLD;
        let signal_type = if !vad {
            SignalType::Inactive
        } else if voiced {
            SignalType::Voiced
        } else {
            SignalType::Unvoiced
        };
        let quant_offset = if energy > 1e-3 {
            QuantOffset::High
        } else {
            QuantOffset::Low
        };
        trace!(
            "silk encode: type {:?} corr {:.2} lag {}",
            signal_type,
            pitch_corr,
            pitch_lag
        );

        // Frame type symbol.
        if !vad {
            enc.encode_icdf(quant_offset.index(), &FRAME_TYPE_INACTIVE_ICDF, 8)?;
        } else {
            let sym = quant_offset.index() + if voiced { 2 } else { 0 };
            enc.encode_icdf(sym, &FRAME_TYPE_ACTIVE_ICDF, 8)?;
        }

        // Short-term analysis over the whole frame.
        let mut a_q12 = [0_i16; MAX_LPC_ORDER];
        lpc_analysis(input, order, &mut a_q12);

        // Quantize through the LSF domain exactly as the decoder will
        // reconstruct it.
        let mut nlsf_q15 = [0_i16; MAX_LPC_ORDER];
        lpc_to_nlsf_q15(&a_q12[..order], &mut nlsf_q15[..order]);

        let (stage1, res_indices, rec_nlsf_q15) = quantize_nlsf(&nlsf_q15[..order], wideband);

        // Residual for gain selection and excitation, using the quantized
        // filter the decoder will run.
        let mut rec_lpc_q12 = [0_i16; MAX_LPC_ORDER];
        nlsf_to_lpc_q12(&rec_nlsf_q15[..order], &mut rec_lpc_q12[..order]);

        let mut residual = [0.0_f32; MAX_FRAME_LEN];
        compute_residual(
            input,
            &self.input_history,
            &rec_lpc_q12[..order],
            voiced,
            pitch_lag,
            &mut residual[..frame_len],
        );

        // Subframe gains, delta-quantized with the decoder's update rule.
        let mut gains = [0.0_f32; MAX_SUBFRAMES];
        let mut gain_symbols = [(0_usize, 0_usize, false); MAX_SUBFRAMES];
        for s in 0..subframes {
            let sub = &residual[s * config.subframe_len..(s + 1) * config.subframe_len];
            let rms = (sub.iter().map(|v| v * v).sum::<f32>() / sub.len() as f32).sqrt();
            // Aim the per-sample pulse magnitude at roughly three, which the
            // shell coder handles without deep LSB cascades.
            let target_q16 = (f64::from(rms) * 10922.0 * 65536.0).max(1.0) as i64;

            if s == 0 && independent {
                // Absolute: search the 6-bit log gain grid.
                let mut best = 0;
                let mut best_err = i64::MAX;
                for lg in 0..64 {
                    let err = (i64::from(dequant_gain_q16(lg)) - target_q16).abs();
                    if err < best_err {
                        best_err = err;
                        best = lg;
                    }
                }
                let floor = self.previous_log_gain - 16;
                let log_gain = best.max(floor);
                gain_symbols[s] = ((log_gain >> 3) as usize, (log_gain & 7) as usize, true);
                self.previous_log_gain = log_gain;
            } else {
                // Delta: pick the symbol whose reconstruction lands closest.
                let mut best_delta = 0;
                let mut best_err = i64::MAX;
                let mut best_lg = self.previous_log_gain;
                for delta in 0..GAIN_DELTA_ICDF.len() as i32 {
                    let lg = (delta * 2 - 16)
                        .max(self.previous_log_gain + delta - 4)
                        .max(0)
                        .min(63);
                    let err = (i64::from(dequant_gain_q16(lg)) - target_q16).abs();
                    if err < best_err {
                        best_err = err;
                        best_delta = delta;
                        best_lg = lg;
                    }
                }
                gain_symbols[s] = (best_delta as usize, 0, false);
                self.previous_log_gain = best_lg;
            }
            gains[s] = dequant_gain_q16(self.previous_log_gain) as f32 / 65536.0;

            let (a, b, absolute) = gain_symbols[s];
            if absolute {
                enc.encode_icdf(a, &GAIN_MSB_ICDF[signal_type.index()], 8)?;
                enc.encode_icdf(b, &GAIN_LSB_ICDF, 8)?;
            } else {
                enc.encode_icdf(a, &GAIN_DELTA_ICDF, 8)?;
            }
        }

        // LSF emission.
        enc.encode_icdf(
            stage1,
            &LSF_STAGE1_ICDF[2 * usize::from(wideband) + usize::from(voiced)],
            8,
        )?;
        for i in 0..order {
            let model: &[u8] = if wideband {
                LSF_STAGE2_MAP_WB[stage1 % 10][i]
            } else {
                LSF_STAGE2_MAP_NB_MB[stage1][i]
            };
            let r = res_indices[i];
            let main = r.max(-4).min(4);
            enc.encode_icdf((main + 4) as usize, model, 8)?;
            if main == -4 {
                enc.encode_icdf((-4 - r) as usize, &LSF_EXTENSION_ICDF, 8)?;
            } else if main == 4 {
                enc.encode_icdf((r - 4) as usize, &LSF_EXTENSION_ICDF, 8)?;
            }
        }

        if subframes == MAX_SUBFRAMES {
            // Interpolation is left off (weight 4); the decoder only
            // interpolates for smaller weights.
            enc.encode_icdf(4, &LSF_INTERPOLATION_ICDF, 8)?;
        }

        // Pitch and LTP.
        if voiced {
            let low_scale = match config.rate_khz {
                8 => PITCH_LOW_ICDF_NB.len(),
                12 => PITCH_LOW_ICDF_MB.len(),
                _ => PITCH_LOW_ICDF_WB.len(),
            };
            let clamped = pitch_lag.max(config.pitch_min).min(config.pitch_max);
            // The coded range is 32 * low_scale lags; the top lag of a
            // wideband frame saturates into the last cell.
            let rel = (clamped - config.pitch_min).min(32 * low_scale - 1);
            let high = rel / low_scale;
            let low = rel - high * low_scale;

            enc.encode_icdf(high, &PITCH_HIGH_ICDF, 8)?;
            match config.rate_khz {
                8 => enc.encode_icdf(low, &PITCH_LOW_ICDF_NB, 8)?,
                12 => enc.encode_icdf(low, &PITCH_LOW_ICDF_MB, 8)?,
                _ => enc.encode_icdf(low, &PITCH_LOW_ICDF_WB, 8)?,
            };

            // Flat contour (index 0 is the all-zero vector in every book).
            match (config.rate_khz, subframes) {
                (8, 2) => enc.encode_icdf(0, &CONTOUR_NB_10MS_ICDF, 8)?,
                (8, _) => enc.encode_icdf(0, &CONTOUR_NB_20MS_ICDF, 8)?,
                (_, 2) => enc.encode_icdf(0, &CONTOUR_MBWB_10MS_ICDF, 8)?,
                _ => enc.encode_icdf(0, &CONTOUR_MBWB_20MS_ICDF, 8)?,
            };

            // Periodicity class from the pitch correlation strength.
            let periodicity = if pitch_corr < 0.65 {
                0
            } else if pitch_corr < 0.8 {
                1
            } else {
                2
            };
            enc.encode_icdf(periodicity, &LTP_PERIODICITY_ICDF, 8)?;

            let target_center = (pitch_corr * 96.0) as i32;
            for _ in 0..subframes {
                let idx = match periodicity {
                    0 => nearest_ltp(&LTP_FILTER0_GAIN_Q7, target_center),
                    1 => nearest_ltp(&LTP_FILTER1_GAIN_Q7, target_center),
                    _ => nearest_ltp(&LTP_FILTER2_GAIN_Q7, target_center),
                };
                match periodicity {
                    0 => enc.encode_icdf(idx, &LTP_FILTER0_ICDF, 8)?,
                    1 => enc.encode_icdf(idx, &LTP_FILTER1_ICDF, 8)?,
                    _ => enc.encode_icdf(idx, &LTP_FILTER2_ICDF, 8)?,
                };
            }

            enc.encode_icdf(0, &LTP_SCALE_ICDF, 8)?;
        }

        // Excitation.
        enc.encode_icdf(0, &SEED_ICDF, 8)?;

        let rate_level = rate_level_for(&residual[..frame_len], &gains[..subframes]);
        enc.encode_icdf(rate_level, &RATE_LEVEL_ICDF[usize::from(voiced)], 8)?;

        let shell_blocks = (frame_len + SHELL_BLOCK_LEN - 1) / SHELL_BLOCK_LEN;
        let mut magnitudes = [0_i32; MAX_FRAME_LEN];
        let mut signs = [1_i32; MAX_FRAME_LEN];
        for i in 0..frame_len {
            let s = i / config.subframe_len;
            let gain = gains[s.min(subframes - 1)];
            let e_q23 = residual[i] / gain.max(1e-9) * 8_388_608.0;
            let m = (e_q23 / 256.0).round() as i32;
            magnitudes[i] = m.abs().min(1023);
            signs[i] = if m < 0 { -1 } else { 1 };
        }

        let mut msb = [0_i32; SHELL_BLOCK_LEN];
        let mut counts = [(0_u32, 0_u32); MAX_FRAME_LEN / SHELL_BLOCK_LEN];
        for b in 0..shell_blocks {
            let start = b * SHELL_BLOCK_LEN;
            let mut lsb_count = 0_u32;
            loop {
                let sum: i32 = (0..SHELL_BLOCK_LEN)
                    .map(|i| {
                        magnitudes
                            .get(start + i)
                            .map(|&m| m >> lsb_count)
                            .unwrap_or(0)
                    })
                    .sum();
                if sum <= 16 || lsb_count == MAX_LSB_COUNT {
                    break;
                }
                lsb_count += 1;
            }
            let sum: i32 = (0..SHELL_BLOCK_LEN)
                .map(|i| magnitudes.get(start + i).map(|&m| m >> lsb_count).unwrap_or(0))
                .sum();
            counts[b] = (sum.min(16) as u32, lsb_count);
            encode_pulse_count(enc, rate_level, counts[b].0, counts[b].1)?;
        }

        for b in 0..shell_blocks {
            let start = b * SHELL_BLOCK_LEN;
            let (_, lsb_count) = counts[b];
            let mut full = [0_i32; SHELL_BLOCK_LEN];
            for i in 0..SHELL_BLOCK_LEN {
                full[i] = magnitudes.get(start + i).copied().unwrap_or(0);
                msb[i] = full[i] >> lsb_count;
            }
            // Keep the coded MSB sum consistent with the emitted count.
            let mut excess: i32 = msb.iter().sum::<i32>() - counts[b].0 as i32;
            for m in msb.iter_mut() {
                while excess > 0 && *m > 0 {
                    *m -= 1;
                    excess -= 1;
                }
            }
            for i in 0..SHELL_BLOCK_LEN {
                full[i] = (msb[i] << lsb_count) | (full[i] & ((1 << lsb_count) - 1));
            }

            encode_shell_block(enc, &msb)?;
            encode_lsbs(enc, lsb_count, &full)?;

            // Remember the rounded magnitudes for the sign pass.
            for i in 0..SHELL_BLOCK_LEN {
                if start + i < frame_len {
                    magnitudes[start + i] = full[i];
                }
            }
        }

        for b in 0..shell_blocks {
            let start = b * SHELL_BLOCK_LEN;
            let mut signed = [0_i32; SHELL_BLOCK_LEN];
            for i in 0..SHELL_BLOCK_LEN {
                let m = magnitudes.get(start + i).copied().unwrap_or(0);
                let s = signs.get(start + i).copied().unwrap_or(1);
                signed[i] = m * s;
            }
            encode_signs(enc, signal_type, quant_offset, counts[b].0, &signed)?;
        }

        // Keep the input tail for the next frame's look-back.
        let keep = self.input_history.len();
        if frame_len >= keep {
            self.input_history
                .copy_from_slice(&input[frame_len - keep..frame_len]);
        } else {
            self.input_history.copy_within(frame_len..keep, 0);
            self.input_history[keep - frame_len..].copy_from_slice(&input[..frame_len]);
        }

        Ok(())
    }
}

/// The Silk encoder.
pub(crate) struct SilkEncoder {
    mid: SilkChannelEncoder,
    side: SilkChannelEncoder,
    mid_buf: [f32; MAX_FRAME_LEN * MAX_SILK_FRAMES],
    side_buf: [f32; MAX_FRAME_LEN * MAX_SILK_FRAMES],
}

impl SilkEncoder {
    /// Creates a new Silk encoder.
    pub(crate) fn new() -> Self {
        Self {
            mid: SilkChannelEncoder::new(),
            side: SilkChannelEncoder::new(),
            mid_buf: [0.0; MAX_FRAME_LEN * MAX_SILK_FRAMES],
            side_buf: [0.0; MAX_FRAME_LEN * MAX_SILK_FRAMES],
        }
    }

    /// Resets the Silk encoder to its initial state.
    pub(crate) fn reset(&mut self) {
        self.mid.reset();
        self.side.reset();
    }

    /// Encodes one Silk payload of `samples` per channel at the internal
    /// rate. `left`/`right` are equal slices for mono input.
    pub(crate) fn encode(
        &mut self,
        enc: &mut RangeEncoder<'_>,
        bandwidth: Bandwidth,
        frame_size_48k: usize,
        left: &[f32],
        right: Option<&[f32]>,
    ) -> Result<(), EncoderError> {
        let config = BandwidthConfig::from_bandwidth(bandwidth);
        let stereo = right.is_some();

        let (frames, subframes) = match frame_size_48k {
            480 => (1, 2),
            960 => (1, 4),
            1920 => (2, 4),
            2880 => (3, 4),
            _ => return Err(EncoderError::BadArguments("invalid silk frame size")),
        };
        let frame_len = config.subframe_len * subframes;
        if left.len() < frames * frame_len {
            return Err(EncoderError::BadArguments("input shorter than frame"));
        }

        // Mid/side decomposition with zero prediction weights, matching the
        // weight indices emitted below.
        let total = frames * frame_len;
        if let Some(right) = right {
            for n in 0..total {
                self.mid_buf[n] = 0.5 * (left[n] + right[n]);
                self.side_buf[n] = 0.5 * (left[n] - right[n]);
            }
        } else {
            self.mid_buf[..total].copy_from_slice(&left[..total]);
        }

        // VAD flags, then the LBRR flag (never set by this encoder).
        let mut mid_vad = [false; MAX_SILK_FRAMES];
        let mut side_vad = [false; MAX_SILK_FRAMES];
        for f in 0..frames {
            let frame = &self.mid_buf[f * frame_len..(f + 1) * frame_len];
            mid_vad[f] = frame.iter().map(|v| v * v).sum::<f32>() / frame_len as f32
                > VAD_THRESHOLD;
            enc.encode_bit_logp(u32::from(mid_vad[f]), 1)?;
        }
        enc.encode_bit_logp(0, 1)?;
        if stereo {
            for f in 0..frames {
                let frame = &self.side_buf[f * frame_len..(f + 1) * frame_len];
                side_vad[f] = frame.iter().map(|v| v * v).sum::<f32>() / frame_len as f32
                    > VAD_THRESHOLD;
                enc.encode_bit_logp(u32::from(side_vad[f]), 1)?;
            }
            enc.encode_bit_logp(0, 1)?;
        }

        for f in 0..frames {
            if stereo {
                // Zero-ish prediction weights: the center of the grid.
                encode_zero_stereo_weights(enc)?;
                if !side_vad[f] {
                    // Side is coded even when inactive.
                    enc.encode_icdf(0, &STEREO_MID_ONLY_ICDF, 8)?;
                }
            }

            let mid_in: &[f32] = &self.mid_buf[f * frame_len..(f + 1) * frame_len];
            let mid = &mut self.mid;
            mid.encode_frame(enc, config, subframes, mid_in, mid_vad[f], f == 0)?;

            if stereo {
                let side_in: &[f32] = &self.side_buf[f * frame_len..(f + 1) * frame_len];
                let side = &mut self.side;
                side.encode_frame(enc, config, subframes, side_in, side_vad[f], f == 0)?;
            }
        }

        Ok(())
    }
}

/// Emits stereo weight indices that reconstruct to (w0, w1) = (-w, w) with w
/// as small as the grid allows, i.e. an essentially unweighted mid/side.
fn encode_zero_stereo_weights(enc: &mut RangeEncoder<'_>) -> Result<(), EncoderError> {
    // n = 12 -> i0 base 6, i2 base 6; index 7 spans the -820..820 cell.
    enc.encode_icdf(12, &STEREO_STAGE1_ICDF, 8)?;
    enc.encode_icdf(1, &STEREO_STAGE2_ICDF, 8)?;
    enc.encode_icdf(2, &STEREO_STAGE3_ICDF, 8)?;
    enc.encode_icdf(1, &STEREO_STAGE2_ICDF, 8)?;
    enc.encode_icdf(2, &STEREO_STAGE3_ICDF, 8)?;
    Ok(())
}

/// Open-loop pitch search by normalized autocorrelation.
///
/// Returns the best lag and its normalized correlation in [0, 1].
fn find_pitch(input: &[f32], min_lag: usize, max_lag: usize) -> (usize, f32) {
    let n = input.len();
    if n <= max_lag {
        return (min_lag, 0.0);
    }

    let mut best_lag = min_lag;
    let mut best_corr = 0.0_f32;
    let energy0: f32 = input[max_lag..].iter().map(|v| v * v).sum();

    for lag in min_lag..=max_lag {
        let mut corr = 0.0_f32;
        let mut energy1 = 0.0_f32;
        for i in max_lag..n {
            corr += input[i] * input[i - lag];
            energy1 += input[i - lag] * input[i - lag];
        }
        let denom = (energy0 * energy1).sqrt();
        if denom > 1e-9 {
            let norm = corr / denom;
            if norm > best_corr {
                best_corr = norm;
                best_lag = lag;
            }
        }
    }

    (best_lag, best_corr.max(0.0))
}

/// Windowed autocorrelation followed by Levinson-Durbin.
fn lpc_analysis(input: &[f32], order: usize, out_q12: &mut [i16; MAX_LPC_ORDER]) {
    let n = input.len();
    let mut r = [0.0_f64; MAX_LPC_ORDER + 1];
    for k in 0..=order {
        let mut acc = 0.0_f64;
        for i in k..n {
            // Light Welch window tapering keeps the estimate stable.
            let w_i = 1.0 - ((2.0 * i as f64 / n as f64) - 1.0).powi(2);
            acc += f64::from(input[i]) * f64::from(input[i - k]) * w_i;
        }
        r[k] = acc;
    }
    r[0] *= 1.0001;
    r[0] += 1e-9;

    let mut a = [0.0_f64; MAX_LPC_ORDER];
    let mut err = r[0];
    for m in 0..order {
        let mut acc = r[m + 1];
        for i in 0..m {
            acc -= a[i] * r[m - i];
        }
        let k = acc / err;
        // Reflection coefficients outside the unit circle would make the
        // synthesis filter unstable; truncate the recursion instead.
        if k.abs() >= 0.999 {
            break;
        }
        let mut new_a = a;
        new_a[m] = k;
        for i in 0..m {
            new_a[i] = a[i] - k * a[m - 1 - i];
        }
        a = new_a;
        err *= 1.0 - k * k;
    }

    for i in 0..order {
        let v = (a[i] * 4096.0).round();
        out_q12[i] = v.max(-32768.0).min(32767.0) as i16;
    }
}

/// Quantizes an LSF vector: nearest stage-1 entry, then sequential stage-2
/// residuals using the decoder's backwards prediction.
fn quantize_nlsf(
    nlsf_q15: &[i16],
    wideband: bool,
) -> (usize, [i32; MAX_LPC_ORDER], [i16; MAX_LPC_ORDER]) {
    let order = nlsf_q15.len();
    let step_q16 = LSF_STEP_Q16[usize::from(wideband)];

    // Stage 1: nearest neighbour in the codebook.
    let mut stage1 = 0;
    let mut best = i64::MAX;
    for cb in 0..32 {
        let mut dist = 0_i64;
        for i in 0..order {
            let base = if wideband {
                i32::from(LSF_CODEBOOK_WB[cb][i]) << 7
            } else {
                i32::from(LSF_CODEBOOK_NB_MB[cb][i]) << 7
            };
            let d = i64::from(i32::from(nlsf_q15[i]) - base);
            dist += d * d;
        }
        if dist < best {
            best = dist;
            stage1 = cb;
        }
    }

    // Stage 2: quantize residual steps backwards so the prediction chain
    // matches the decoder.
    let dequant_step = |res: i32| -> i32 {
        let fix = if res < 0 {
            102
        } else if res > 0 {
            -102
        } else {
            0
        };
        ((res * 1024 + fix) * step_q16) >> 16
    };

    let mut res_indices = [0_i32; MAX_LPC_ORDER];
    let mut rec_q10 = [0_i32; MAX_LPC_ORDER];
    let mut prev: Option<i32> = None;
    for i in (0..order).rev() {
        let base = if wideband {
            i32::from(LSF_CODEBOOK_WB[stage1][i]) << 7
        } else {
            i32::from(LSF_CODEBOOK_NB_MB[stage1][i]) << 7
        };
        let target_q10 = (i32::from(nlsf_q15[i]) - base) >> 5;

        let pred = match prev {
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

        let want = target_q10 - pred;
        let mut best_r = 0;
        let mut best_err = i32::MAX;
        for r in -10..=10 {
            let err = (dequant_step(r) - want).abs();
            if err < best_err {
                best_err = err;
                best_r = r;
            }
        }
        res_indices[i] = best_r;
        rec_q10[i] = dequant_step(best_r) + pred;
        prev = Some(rec_q10[i]);
    }

    // Reconstruct exactly as the decoder does.
    let mut check_q10 = [0_i32; MAX_LPC_ORDER];
    dequant_residuals(&res_indices[..order], stage1, wideband, &mut check_q10[..order]);

    let mut rec_nlsf = [0_i16; MAX_LPC_ORDER];
    if wideband {
        reconstruct_nlsf(&LSF_CODEBOOK_WB[stage1], &check_q10[..order], &mut rec_nlsf[..order]);
    } else {
        reconstruct_nlsf(
            &LSF_CODEBOOK_NB_MB[stage1],
            &check_q10[..order],
            &mut rec_nlsf[..order],
        );
    }
    stabilize_nlsf(&mut rec_nlsf[..order]);

    (stage1, res_indices, rec_nlsf)
}

/// Short-term (and long-term, when voiced) analysis filtering.
fn compute_residual(
    input: &[f32],
    history: &[f32],
    a_q12: &[i16],
    voiced: bool,
    pitch_lag: usize,
    out: &mut [f32],
) {
    let h = history.len();

    let sample = |idx: i32| -> f32 {
        if idx >= 0 {
            input[idx as usize]
        } else {
            let j = h as i32 + idx;
            if j >= 0 {
                history[j as usize]
            } else {
                0.0
            }
        }
    };

    for n in 0..out.len() {
        let mut r = input[n];
        for (k, &a) in a_q12.iter().enumerate() {
            r -= f32::from(a) / 4096.0 * sample(n as i32 - 1 - k as i32);
        }
        if voiced && pitch_lag > 0 {
            // Small fixed comb matching the decoder's flat-contour synthesis.
            r -= 0.5 * sample(n as i32 - pitch_lag as i32);
        }
        out[n] = r;
    }
}

/// Rate level from the residual loudness relative to the chosen gains.
fn rate_level_for(residual: &[f32], gains: &[f32]) -> usize {
    let rms = (residual.iter().map(|v| v * v).sum::<f32>() / residual.len() as f32).sqrt();
    let mean_gain = gains.iter().sum::<f32>() / gains.len() as f32;
    let ratio = rms / mean_gain.max(1e-9);
    ((ratio * 4.0) as usize).min(8)
}

/// Index of the filter whose center tap is nearest the target.
fn nearest_ltp<const N: usize>(book: &[[i8; LTP_ORDER]; N], target_center: i32) -> usize {
    let mut best = 0;
    let mut best_err = i32::MAX;
    for (i, row) in book.iter().enumerate() {
        let err = (i32::from(row[2]) - target_center).abs();
        if err < best_err {
            best_err = err;
            best = i;
        }
    }
    best
}
