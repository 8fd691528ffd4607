//! Implements the Silk decoder.

use log::{debug, trace, warn};

use crate::range_coder::RangeDecoder;
use crate::silk::excitation::{
    decode_lsbs, decode_pulse_count, decode_shell_block, decode_signs, lcg_step,
    reconstruct_excitation,
};
use crate::silk::lsf::{
    dequant_residuals, interpolate_nlsf, nlsf_to_lpc_q12, reconstruct_nlsf, stabilize_nlsf,
};
use crate::silk::tables::*;
use crate::silk::{
    dequant_gain_q16, BandwidthConfig, QuantOffset, SignalType, HISTORY_LEN, LTP_ORDER,
    MAX_FRAME_LEN, MAX_LPC_ORDER, MAX_SILK_FRAMES, MAX_SUBFRAMES, SHELL_BLOCK_LEN,
};
use crate::{Bandwidth, DecoderError};

/// Decoded parameters of one 20 ms frame that outlive the frame, kept for
/// concealment.
#[derive(Clone, Copy, Debug)]
struct ConcealmentState {
    signal_type: SignalType,
    gain: f32,
    pitch_lag: usize,
    lpc_q12: [i16; MAX_LPC_ORDER],
    lpc_order: usize,
}

impl Default for ConcealmentState {
    fn default() -> Self {
        Self {
            signal_type: SignalType::Inactive,
            gain: 0.0,
            pitch_lag: 0,
            lpc_q12: [0; MAX_LPC_ORDER],
            lpc_order: 10,
        }
    }
}

/// Decoder state for one Silk channel.
///
/// The channel exclusively owns its arrays; stereo streams run two of these
/// side by side.
#[derive(Clone)]
pub(crate) struct SilkChannelDecoder {
    /// Gates delta coding of gains and LSF interpolation.
    have_decoded: bool,
    previous_log_gain: i32,
    prev_lsf_q15: [i16; MAX_LPC_ORDER],
    /// Ring buffer of reconstructed output at the internal rate.
    output_history: [f32; HISTORY_LEN],
    history_pos: usize,
    is_previous_frame_voiced: bool,
    conceal: ConcealmentState,
    /// Noise state reused by concealment.
    plc_seed: u32,
    /// Scratch excitation for one frame.
    excitation: [i32; MAX_FRAME_LEN],
}

impl SilkChannelDecoder {
    fn new() -> Self {
        Self {
            have_decoded: false,
            previous_log_gain: 0,
            prev_lsf_q15: [0; MAX_LPC_ORDER],
            output_history: [0.0; HISTORY_LEN],
            history_pos: 0,
            is_previous_frame_voiced: false,
            conceal: ConcealmentState::default(),
            plc_seed: 0,
            excitation: [0; MAX_FRAME_LEN],
        }
    }

    fn reset(&mut self) {
        *self = Self::new();
    }

    /// Reads a sample `delay` steps back from the write position.
    #[inline(always)]
    fn history(&self, delay: usize) -> f32 {
        debug_assert!(delay >= 1 && delay <= HISTORY_LEN);
        self.output_history[(self.history_pos + HISTORY_LEN - delay) % HISTORY_LEN]
    }

    #[inline(always)]
    fn push_history(&mut self, value: f32) {
        self.output_history[self.history_pos] = value;
        self.history_pos = (self.history_pos + 1) % HISTORY_LEN;
    }

    /// Decodes one 20 ms (or 10 ms) frame worth of parameters and runs the
    /// synthesis filters. Writes `subframes * subframe_len` samples.
    #[allow(clippy::too_many_arguments)]
    fn decode_frame(
        &mut self,
        dec: &mut RangeDecoder<'_>,
        config: BandwidthConfig,
        subframes: usize,
        vad: bool,
        independent: bool,
        out: &mut [f32],
    ) -> Result<(), DecoderError> {
        let frame_len = config.subframe_len * subframes;
        if out.len() < frame_len {
            return Err(DecoderError::BufferTooSmall);
        }

        // Frame classification.
        let (signal_type, quant_offset) = if !vad {
            let sym = dec.decode_icdf(&FRAME_TYPE_INACTIVE_ICDF, 8);
            let offset = if sym == 0 {
                QuantOffset::Low
            } else {
                QuantOffset::High
            };
            (SignalType::Inactive, offset)
        } else {
            match dec.decode_icdf(&FRAME_TYPE_ACTIVE_ICDF, 8) {
                0 => (SignalType::Unvoiced, QuantOffset::Low),
                1 => (SignalType::Unvoiced, QuantOffset::High),
                2 => (SignalType::Voiced, QuantOffset::Low),
                // Out-of-range symbols clamp to the last table entry.
                _ => (SignalType::Voiced, QuantOffset::High),
            }
        };
        let voiced = signal_type == SignalType::Voiced;
        trace!("silk frame: type {:?} offset {:?}", signal_type, quant_offset);

        // Subframe gains.
        let mut gains = [0.0_f32; MAX_SUBFRAMES];
        for s in 0..subframes {
            if s == 0 && independent {
                let msb = dec.decode_icdf(&GAIN_MSB_ICDF[signal_type.index()], 8) as i32;
                let lsb = dec.decode_icdf(&GAIN_LSB_ICDF, 8) as i32;
                self.previous_log_gain = ((msb << 3) | lsb).max(self.previous_log_gain - 16);
            } else {
                let delta = dec.decode_icdf(&GAIN_DELTA_ICDF, 8) as i32;
                self.previous_log_gain = (delta * 2 - 16)
                    .max(self.previous_log_gain + delta - 4)
                    .max(0)
                    .min(63);
            }
            gains[s] = dequant_gain_q16(self.previous_log_gain) as f32 / 65536.0;
        }

        // LSF, two-stage VQ.
        let order = config.lpc_order;
        let wideband = config.is_wideband();
        let stage1_ctx = 2 * usize::from(wideband) + usize::from(voiced);
        let stage1 = (dec.decode_icdf(&LSF_STAGE1_ICDF[stage1_ctx], 8) as usize).min(31);

        let mut res_indices = [0_i32; MAX_LPC_ORDER];
        for i in 0..order {
            let model: &[u8] = if wideband {
                LSF_STAGE2_MAP_WB[stage1 % 10][i]
            } else {
                LSF_STAGE2_MAP_NB_MB[stage1][i]
            };
            let mut r = dec.decode_icdf(model, 8) as i32 - 4;
            if r == -4 {
                r -= dec.decode_icdf(&LSF_EXTENSION_ICDF, 8) as i32;
            } else if r == 4 {
                r += dec.decode_icdf(&LSF_EXTENSION_ICDF, 8) as i32;
            }
            res_indices[i] = r;
        }

        let mut res_q10 = [0_i32; MAX_LPC_ORDER];
        dequant_residuals(&res_indices[..order], stage1, wideband, &mut res_q10[..order]);

        let mut nlsf_q15 = [0_i16; MAX_LPC_ORDER];
        if wideband {
            reconstruct_nlsf(&LSF_CODEBOOK_WB[stage1], &res_q10[..order], &mut nlsf_q15[..order]);
        } else {
            reconstruct_nlsf(
                &LSF_CODEBOOK_NB_MB[stage1],
                &res_q10[..order],
                &mut nlsf_q15[..order],
            );
        }
        stabilize_nlsf(&mut nlsf_q15[..order]);

        // Optional interpolation for the first half of a 20 ms frame.
        let mut lpc_q12_first = [0_i16; MAX_LPC_ORDER];
        let mut lpc_q12 = [0_i16; MAX_LPC_ORDER];
        let mut interpolated = false;
        if subframes == MAX_SUBFRAMES {
            let w_q2 = dec.decode_icdf(&LSF_INTERPOLATION_ICDF, 8) as i32;
            if w_q2 < 4 && self.have_decoded {
                let mut nlsf0 = [0_i16; MAX_LPC_ORDER];
                interpolate_nlsf(
                    &self.prev_lsf_q15[..order],
                    &nlsf_q15[..order],
                    w_q2,
                    &mut nlsf0[..order],
                );
                stabilize_nlsf(&mut nlsf0[..order]);
                nlsf_to_lpc_q12(&nlsf0[..order], &mut lpc_q12_first[..order]);
                interpolated = true;
            }
        }
        nlsf_to_lpc_q12(&nlsf_q15[..order], &mut lpc_q12[..order]);
        if !interpolated {
            lpc_q12_first = lpc_q12;
        }
        self.prev_lsf_q15[..order].copy_from_slice(&nlsf_q15[..order]);

        // Pitch lags and contour.
        let mut pitch_lags = [0_usize; MAX_SUBFRAMES];
        let mut ltp_q7 = [[0_i8; LTP_ORDER]; MAX_SUBFRAMES];
        let mut ltp_scale_q14 = 0_i32;
        if voiced {
            let low_scale = match config.rate_khz {
                8 => PITCH_LOW_ICDF_NB.len(),
                12 => PITCH_LOW_ICDF_MB.len(),
                _ => PITCH_LOW_ICDF_WB.len(),
            };
            let high = dec.decode_icdf(&PITCH_HIGH_ICDF, 8) as usize;
            let low = match config.rate_khz {
                8 => dec.decode_icdf(&PITCH_LOW_ICDF_NB, 8),
                12 => dec.decode_icdf(&PITCH_LOW_ICDF_MB, 8),
                _ => dec.decode_icdf(&PITCH_LOW_ICDF_WB, 8),
            } as usize;
            let lag = (config.pitch_min + high * low_scale + low)
                .max(config.pitch_min)
                .min(config.pitch_max);

            let contour: &[i8] = match (config.rate_khz, subframes) {
                (8, 2) => {
                    let idx = dec.decode_icdf(&CONTOUR_NB_10MS_ICDF, 8) as usize;
                    &CONTOUR_NB_10MS[idx.min(CONTOUR_NB_10MS.len() - 1)]
                }
                (8, _) => {
                    let idx = dec.decode_icdf(&CONTOUR_NB_20MS_ICDF, 8) as usize;
                    &CONTOUR_NB_20MS[idx.min(CONTOUR_NB_20MS.len() - 1)]
                }
                (_, 2) => {
                    let idx = dec.decode_icdf(&CONTOUR_MBWB_10MS_ICDF, 8) as usize;
                    &CONTOUR_MBWB_10MS[idx.min(CONTOUR_MBWB_10MS.len() - 1)]
                }
                _ => {
                    let idx = dec.decode_icdf(&CONTOUR_MBWB_20MS_ICDF, 8) as usize;
                    &CONTOUR_MBWB_20MS[idx.min(CONTOUR_MBWB_20MS.len() - 1)]
                }
            };
            for s in 0..subframes {
                let l = lag as i32 + i32::from(contour[s]);
                pitch_lags[s] = (l.max(config.pitch_min as i32) as usize).min(config.pitch_max);
            }

            // LTP filter per subframe.
            let periodicity = dec.decode_icdf(&LTP_PERIODICITY_ICDF, 8) as usize;
            for s in 0..subframes {
                ltp_q7[s] = match periodicity {
                    0 => {
                        let idx = dec.decode_icdf(&LTP_FILTER0_ICDF, 8) as usize;
                        LTP_FILTER0_GAIN_Q7[idx.min(7)]
                    }
                    1 => {
                        let idx = dec.decode_icdf(&LTP_FILTER1_ICDF, 8) as usize;
                        LTP_FILTER1_GAIN_Q7[idx.min(15)]
                    }
                    _ => {
                        let idx = dec.decode_icdf(&LTP_FILTER2_ICDF, 8) as usize;
                        LTP_FILTER2_GAIN_Q7[idx.min(31)]
                    }
                };
            }

            let scale_idx = dec.decode_icdf(&LTP_SCALE_ICDF, 8) as usize;
            ltp_scale_q14 = LTP_SCALE_Q14[scale_idx.min(2)];
        }

        // Excitation seed and shell-coded pulses.
        let mut seed = dec.decode_icdf(&SEED_ICDF, 8);

        let rate_level =
            dec.decode_icdf(&RATE_LEVEL_ICDF[usize::from(voiced)], 8) as usize;

        let shell_blocks = (frame_len + SHELL_BLOCK_LEN - 1) / SHELL_BLOCK_LEN;
        let mut pulse_counts = [0_u32; MAX_FRAME_LEN / SHELL_BLOCK_LEN];
        let mut lsb_counts = [0_u32; MAX_FRAME_LEN / SHELL_BLOCK_LEN];
        for b in 0..shell_blocks {
            let (count, lsbs) = decode_pulse_count(dec, rate_level);
            pulse_counts[b] = count;
            lsb_counts[b] = lsbs;
        }

        let mut block = [0_i32; SHELL_BLOCK_LEN];
        for b in 0..shell_blocks {
            decode_shell_block(dec, pulse_counts[b], &mut block);
            decode_lsbs(dec, lsb_counts[b], &mut block);
            self.excitation[b * SHELL_BLOCK_LEN..(b + 1) * SHELL_BLOCK_LEN]
                .copy_from_slice(&block);
        }
        for b in 0..shell_blocks {
            let start = b * SHELL_BLOCK_LEN;
            let mut signed: [i32; SHELL_BLOCK_LEN] = [0; SHELL_BLOCK_LEN];
            signed.copy_from_slice(&self.excitation[start..start + SHELL_BLOCK_LEN]);
            decode_signs(dec, signal_type, quant_offset, pulse_counts[b], &mut signed);
            self.excitation[start..start + SHELL_BLOCK_LEN].copy_from_slice(&signed);
        }

        reconstruct_excitation(
            signal_type,
            quant_offset,
            &mut seed,
            &mut self.excitation[..shell_blocks * SHELL_BLOCK_LEN],
        );

        // Synthesis, subframe by subframe.
        for s in 0..subframes {
            let gain = gains[s];
            let a_q12 = if s < subframes / 2 {
                &lpc_q12_first
            } else {
                &lpc_q12
            };
            let lag = pitch_lags[s];
            let b_q7 = &ltp_q7[s];
            let ltp_scale = ltp_scale_q14 as f32 / 16384.0;

            for n in 0..config.subframe_len {
                let idx = s * config.subframe_len + n;
                let mut x = self.excitation[idx] as f32 / 8_388_608.0 * gain;

                if voiced && lag > 0 {
                    // 5-tap comb around the pitch lag; the neighbourhood spans
                    // lag-2 .. lag+2.
                    let mut pred = 0.0_f32;
                    for (i, &b) in b_q7.iter().enumerate() {
                        let delay = (lag + 2).saturating_sub(i).max(1);
                        pred += f32::from(b) / 128.0 * self.history(delay);
                    }
                    x += pred * ltp_scale;
                }

                // Short-term prediction over the output history.
                let mut y = x;
                for (k, &a) in a_q12[..order].iter().enumerate() {
                    y += f32::from(a) / 4096.0 * self.history(k + 1);
                }

                let y = y.max(-1.0).min(1.0);
                self.push_history(y);
                out[idx] = y;
            }
        }

        // Persist what concealment needs.
        self.conceal = ConcealmentState {
            signal_type,
            gain: gains[subframes - 1],
            pitch_lag: pitch_lags[subframes - 1],
            lpc_q12,
            lpc_order: order,
        };
        self.plc_seed = seed;
        self.is_previous_frame_voiced = voiced;
        self.have_decoded = true;

        Ok(())
    }

    /// Extrapolates one lost frame into `out`, scaled by `fade`.
    fn conceal_frame(&mut self, frame_len: usize, fade: f32, out: &mut [f32]) {
        let st = self.conceal;

        match st.signal_type {
            SignalType::Voiced if self.is_previous_frame_voiced && st.pitch_lag > 0 => {
                // Repeat the last pitch cycle from the history.
                for n in 0..frame_len {
                    let y = (self.history(st.pitch_lag) * fade).max(-1.0).min(1.0);
                    self.push_history(y);
                    out[n] = y;
                }
            }
            _ => {
                // Noise shaped by the previous short-term filter.
                let order = st.lpc_order;
                for n in 0..frame_len {
                    let r = lcg_step(&mut self.plc_seed) as i32;
                    let mut y = (r >> 16) as f32 / 32768.0 * 0.25 * st.gain * fade;
                    for k in 0..order {
                        y += f32::from(st.lpc_q12[k]) / 4096.0 * self.history(k + 1);
                    }
                    let y = y.max(-1.0).min(1.0);
                    self.push_history(y);
                    out[n] = y;
                }
            }
        }
    }
}

/// The Silk decoder.
///
/// Owns one channel decoder per stream channel plus the stereo prediction
/// state. Concealment state that spans layers (fade, counters) lives in the
/// top-level decoder.
#[derive(Clone)]
pub(crate) struct SilkDecoder {
    mid: SilkChannelDecoder,
    side: SilkChannelDecoder,
    prev_stereo_weights: [i32; 2],
    /// Left/right (or mono) output at the internal rate.
    out_left: [f32; MAX_FRAME_LEN * MAX_SILK_FRAMES],
    out_right: [f32; MAX_FRAME_LEN * MAX_SILK_FRAMES],
    /// Scratch for the two coded channels of one frame.
    mid_buf: [f32; MAX_FRAME_LEN],
    side_buf: [f32; MAX_FRAME_LEN],
}

impl SilkDecoder {
    /// Creates a new Silk decoder.
    pub(crate) fn new() -> Self {
        Self {
            mid: SilkChannelDecoder::new(),
            side: SilkChannelDecoder::new(),
            prev_stereo_weights: [0; 2],
            out_left: [0.0; MAX_FRAME_LEN * MAX_SILK_FRAMES],
            out_right: [0.0; MAX_FRAME_LEN * MAX_SILK_FRAMES],
            mid_buf: [0.0; MAX_FRAME_LEN],
            side_buf: [0.0; MAX_FRAME_LEN],
        }
    }

    /// Resets the Silk decoder to its initial state.
    pub(crate) fn reset(&mut self) {
        self.mid.reset();
        self.side.reset();
        self.prev_stereo_weights = [0; 2];
        debug!("silk decoder reset");
    }

    /// Pitch lag of the last decoded frame, in samples at the internal rate.
    pub(crate) fn pitch(&self) -> u32 {
        self.mid.conceal.pitch_lag as u32
    }

    /// Left channel of the last decode at the internal rate.
    pub(crate) fn left(&self) -> &[f32] {
        &self.out_left
    }

    /// Right channel of the last decode at the internal rate. Mirrors the
    /// left channel for mono streams.
    pub(crate) fn right(&self) -> &[f32] {
        &self.out_right
    }

    /// Decodes one Silk payload (10 to 60 ms).
    ///
    /// Returns the number of samples produced per channel at the internal
    /// sampling rate.
    pub(crate) fn decode(
        &mut self,
        dec: &mut RangeDecoder<'_>,
        bandwidth: Bandwidth,
        frame_size_48k: usize,
        stereo: bool,
    ) -> Result<usize, DecoderError> {
        let config = BandwidthConfig::from_bandwidth(bandwidth);

        // 10 ms payloads carry one half-length frame; everything longer is
        // built from 20 ms frames.
        let (frames, subframes) = match frame_size_48k {
            480 => (1, 2),
            960 => (1, 4),
            1920 => (2, 4),
            2880 => (3, 4),
            _ => return Err(DecoderError::InvalidPacket),
        };
        let frame_len = config.subframe_len * subframes;

        // VAD flags and LBRR flags lead the payload.
        let mut mid_vad = [false; MAX_SILK_FRAMES];
        let mut side_vad = [false; MAX_SILK_FRAMES];
        for v in mid_vad[..frames].iter_mut() {
            *v = dec.decode_bit_logp(1);
        }
        if dec.decode_bit_logp(1) {
            warn!("silk: LBRR data present but not supported, output may be degraded");
        }
        if stereo {
            for v in side_vad[..frames].iter_mut() {
                *v = dec.decode_bit_logp(1);
            }
            if dec.decode_bit_logp(1) {
                warn!("silk: side LBRR data present but not supported");
            }
        }

        for f in 0..frames {
            let mut mid_only = false;
            let mut w0_q13 = 0_i32;
            let mut w1_q13 = 0_i32;

            if stereo {
                let (w0, w1) = decode_stereo_weights(dec);
                w0_q13 = w0;
                w1_q13 = w1;
                self.prev_stereo_weights = [w0, w1];

                if !side_vad[f] {
                    mid_only = dec.decode_icdf(&STEREO_MID_ONLY_ICDF, 8) != 0;
                }
            }

            let mid_buf = &mut self.mid_buf;
            self.mid
                .decode_frame(dec, config, subframes, mid_vad[f], f == 0, mid_buf)?;

            if stereo && !mid_only {
                let side_buf = &mut self.side_buf;
                self.side
                    .decode_frame(dec, config, subframes, side_vad[f], f == 0, side_buf)?;
            } else {
                self.side_buf[..frame_len].iter_mut().for_each(|v| *v = 0.0);
            }

            let base = f * frame_len;
            if stereo {
                let w0 = w0_q13 as f32 / 8192.0;
                let w1 = w1_q13 as f32 / 8192.0;
                for n in 0..frame_len {
                    let m = self.mid_buf[n];
                    let s = self.side_buf[n];
                    let pred = w0 * m + w1 * s;
                    self.out_left[base + n] = (m + s + pred).max(-1.0).min(1.0);
                    self.out_right[base + n] = (m - s + pred).max(-1.0).min(1.0);
                }
            } else {
                for n in 0..frame_len {
                    self.out_left[base + n] = self.mid_buf[n];
                    self.out_right[base + n] = self.mid_buf[n];
                }
            }
        }

        Ok(frames * frame_len)
    }

    /// Conceals one lost payload; mirrors the shape of `decode`.
    pub(crate) fn conceal(
        &mut self,
        bandwidth: Bandwidth,
        frame_size_48k: usize,
        stereo: bool,
        fade: f32,
    ) -> usize {
        let config = BandwidthConfig::from_bandwidth(bandwidth);
        let (frames, subframes) = match frame_size_48k {
            480 => (1, 2),
            1920 => (2, 4),
            2880 => (3, 4),
            _ => (1, 4),
        };
        let frame_len = config.subframe_len * subframes;

        for f in 0..frames {
            let mid_buf = &mut self.mid_buf;
            self.mid.conceal_frame(frame_len, fade, mid_buf);
            if stereo {
                let side_buf = &mut self.side_buf;
                self.side.conceal_frame(frame_len, fade, side_buf);
            }

            let base = f * frame_len;
            let w0 = self.prev_stereo_weights[0] as f32 / 8192.0;
            let w1 = self.prev_stereo_weights[1] as f32 / 8192.0;
            for n in 0..frame_len {
                let m = self.mid_buf[n];
                if stereo {
                    let s = self.side_buf[n];
                    let pred = w0 * m + w1 * s;
                    self.out_left[base + n] = (m + s + pred).max(-1.0).min(1.0);
                    self.out_right[base + n] = (m - s + pred).max(-1.0).min(1.0);
                } else {
                    self.out_left[base + n] = m;
                    self.out_right[base + n] = m;
                }
            }
        }

        frames * frame_len
    }
}

/// Decodes the Q13 mid/side prediction weights.
pub(crate) fn decode_stereo_weights(dec: &mut RangeDecoder<'_>) -> (i32, i32) {
    let n = dec.decode_icdf(&STEREO_STAGE1_ICDF, 8) as usize;
    let i0 = dec.decode_icdf(&STEREO_STAGE2_ICDF, 8) as usize + 3 * (n / 5);
    let i1 = dec.decode_icdf(&STEREO_STAGE3_ICDF, 8) as usize * 2 + 1;
    let i2 = dec.decode_icdf(&STEREO_STAGE2_ICDF, 8) as usize + 3 * (n % 5);
    let i3 = dec.decode_icdf(&STEREO_STAGE3_ICDF, 8) as usize * 2 + 1;

    let weight = |idx: usize, scale: usize| -> i32 {
        let idx = idx.min(STEREO_WEIGHTS_Q13.len() - 2);
        let w = STEREO_WEIGHTS_Q13[idx];
        let w1 = STEREO_WEIGHTS_Q13[idx + 1];
        w + (((w1 - w) * 6554) >> 16) * scale as i32
    };

    let w0 = weight(i0, i1);
    let w1 = weight(i2, i3);

    (w0 - w1, w1)
}
