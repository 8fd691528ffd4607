//! Implements the Celt encoder.
//!
//! The encoder mirrors the decoder stage for stage: the same flags, the
//! same allocator on the same inputs, and quantized values fed forward so
//! its prediction state matches the decoder's exactly.

use log::trace;

use crate::celt::bands::{
    compute_allocation, encode_alloc_params, encode_bands, encode_stereo_params, AllocParams,
};
use crate::celt::cwrs::PulseCodebook;
use crate::celt::energy::{encode_coarse, encode_fine};
use crate::celt::mdct::Mdct;
use crate::celt::{
    band_start, band_width, lm_from_frame_size, DEEMPH_COEF, EFFECTIVE_BANDS, MAX_BANDS,
    MAX_FRAME_LEN, OVERLAP,
};
use crate::encoder_error::EncoderError;
use crate::math::fast_log2;
use crate::range_coder::{RangeEncoder, Tell};

/// Energy ratio between neighbouring sub-blocks that marks a transient.
const TRANSIENT_RATIO: f32 = 4.0;
/// Band energy floor in the log2 domain.
const ENERGY_FLOOR: f32 = -28.0;

/// The Celt encoder.
pub(crate) struct CeltEncoder {
    channels: usize,
    mdcts: [Mdct; 4],
    codebook: PulseCodebook,

    /// Quantized energies of the previous frame, the decoder's view.
    prev_energy: [[f32; MAX_BANDS]; 2],
    /// Pre-emphasis memory per channel.
    preemph_state: [f32; 2],
    /// Input overlap kept for the next frame's MDCT support.
    input_memory: [[f32; OVERLAP]; 2],
    /// True once a frame has been coded; the first frame codes intra.
    have_encoded: bool,

    // Preallocated scratch.
    preemph: [[f32; MAX_FRAME_LEN]; 2],
    mdct_in: [f32; 2 * MAX_FRAME_LEN],
    spectrum: [[f32; MAX_FRAME_LEN]; 2],
    norm: [[f32; MAX_FRAME_LEN]; 2],
    energy: [[f32; MAX_BANDS]; 2],
}

impl CeltEncoder {
    /// Creates a new Celt encoder for the given channel count.
    pub(crate) fn new(channels: usize) -> Self {
        Self {
            channels,
            mdcts: [Mdct::new(120), Mdct::new(240), Mdct::new(480), Mdct::new(960)],
            codebook: PulseCodebook::new(),
            prev_energy: [[ENERGY_FLOOR; MAX_BANDS]; 2],
            preemph_state: [0.0; 2],
            input_memory: [[0.0; OVERLAP]; 2],
            have_encoded: false,
            preemph: [[0.0; MAX_FRAME_LEN]; 2],
            mdct_in: [0.0; 2 * MAX_FRAME_LEN],
            spectrum: [[0.0; MAX_FRAME_LEN]; 2],
            norm: [[0.0; MAX_FRAME_LEN]; 2],
            energy: [[0.0; MAX_BANDS]; 2],
        }
    }

    /// Resets the Celt encoder to its initial state.
    pub(crate) fn reset(&mut self) {
        let channels = self.channels;
        *self = Self::new(channels);
    }

    /// Encodes one frame of `frame_size` samples per channel at 48 kHz.
    ///
    /// `input` holds one slice per channel. In hybrid mode `start_band` is
    /// 17 and the bands below stay silent.
    pub(crate) fn encode(
        &mut self,
        enc: &mut RangeEncoder<'_>,
        frame_size: usize,
        start_band: usize,
        input: [&[f32]; 2],
    ) -> Result<(), EncoderError> {
        let lm = lm_from_frame_size(frame_size)
            .ok_or(EncoderError::BadArguments("invalid celt frame size"))?;
        let end = EFFECTIVE_BANDS[lm].max(start_band);
        let start = start_band.min(end);
        let channels = self.channels;
        let hybrid = start > 0;
        let total_bits = (enc.storage() * 8) as u32;

        // Pre-emphasis with persistent state.
        for c in 0..channels {
            let x = input[c];
            let mut state = self.preemph_state[c];
            for n in 0..frame_size {
                self.preemph[c][n] = x[n] - DEEMPH_COEF * state;
                state = x[n];
            }
            self.preemph_state[c] = state;
        }

        // Transient analysis over eight sub-blocks.
        let transient = lm > 0 && self.detect_transient(frame_size);

        // Forward MDCT, long or short interleaved.
        self.analyze(frame_size, lm, transient);

        // Band energies and normalized shapes.
        let mut silence = true;
        for c in 0..channels {
            for band in start..end {
                let begin = band_start(band, lm);
                let n = band_width(band, lm);
                let e: f32 = self.spectrum[c][begin..begin + n]
                    .iter()
                    .map(|v| v * v)
                    .sum();
                let log_e = fast_log2(e.sqrt() + 1e-14).max(ENERGY_FLOOR);
                self.energy[c][band] = log_e;
                if log_e > -24.0 {
                    silence = false;
                }

                let gain = e.sqrt();
                if gain > 1e-14 {
                    for i in 0..n {
                        self.norm[c][begin + i] = self.spectrum[c][begin + i] / gain;
                    }
                } else {
                    self.norm[c][begin..begin + n].iter_mut().for_each(|v| *v = 0.0);
                }
            }
        }
        trace!(
            "celt encode: lm {} transient {} silence {}",
            lm,
            transient,
            silence
        );

        if enc.tell() < total_bits {
            enc.encode_bit_logp(u32::from(silence), 15)?;
        }
        if silence {
            // Track the decoder's silence-frame energy decay so the next
            // frame predicts from the same values.
            for c in 0..channels {
                for e in self.prev_energy[c].iter_mut() {
                    *e = (*e - 4.0).max(ENERGY_FLOOR);
                }
            }
            return Ok(());
        }

        // Post-filter is never used by this encoder; signal its absence.
        if !hybrid && enc.tell() + 16 <= total_bits {
            enc.encode_bit_logp(0, 1)?;
        }

        // From here on only the coded flag values matter; if the budget
        // cannot carry a flag, the decoder assumes it clear.
        let transient = if lm > 0 && enc.tell() + 3 <= total_bits {
            enc.encode_bit_logp(u32::from(transient), 3)?;
            transient
        } else {
            false
        };

        let intra = if enc.tell() + 3 <= total_bits {
            let intra = !self.have_encoded;
            enc.encode_bit_logp(u32::from(intra), 3)?;
            intra
        } else {
            false
        };

        let target = self.energy;
        let prev = self.prev_energy;
        encode_coarse(
            enc,
            lm,
            intra,
            channels,
            start,
            end,
            total_bits,
            &mut self.energy,
            &prev,
        )?;

        let mut params = AllocParams::default();
        encode_alloc_params(enc, &mut params, lm, channels, start, end, total_bits)?;

        let available = (total_bits << 3) as i32 - enc.tell_frac() as i32;
        let alloc = compute_allocation(lm, channels, start, end, available, &params, transient);

        // All bands stay mid/side; intensity is parked at the end.
        let intensity = end;
        let dual = false;
        encode_stereo_params(enc, start, end, &alloc, intensity, dual)?;

        encode_fine(
            enc,
            channels,
            start,
            end,
            &alloc.fine_bits,
            &mut self.energy,
            &target,
        )?;

        encode_bands(
            enc,
            &self.codebook,
            lm,
            channels,
            start,
            end,
            &alloc,
            intensity,
            dual,
            &self.norm,
        )?;

        if alloc.anti_collapse_rsv > 0 {
            enc.encode_bits(u32::from(transient), 1)?;
        }

        // Roll the quantized energy history the way the decoder will.
        for c in 0..channels {
            for band in 0..MAX_BANDS {
                self.prev_energy[c][band] = if band >= start && band < end {
                    self.energy[c][band].max(ENERGY_FLOOR)
                } else {
                    ENERGY_FLOOR
                };
            }
        }
        self.have_encoded = true;

        Ok(())
    }

    /// Max-to-neighbour energy ratio over eight sub-blocks of the
    /// pre-emphasized frame.
    fn detect_transient(&self, frame_size: usize) -> bool {
        let block = frame_size / 8;
        let mut energies = [0.0_f32; 8];
        for (b, e) in energies.iter_mut().enumerate() {
            let mut acc = 0.0;
            for c in 0..self.channels {
                for n in 0..block {
                    let v = self.preemph[c][b * block + n];
                    acc += v * v;
                }
            }
            *e = acc + 1e-12;
        }

        for b in 1..8 {
            let ratio = energies[b] / energies[b - 1];
            if ratio > TRANSIENT_RATIO {
                return true;
            }
        }
        false
    }

    /// Windows the pre-emphasized input and runs the forward MDCT(s).
    fn analyze(&mut self, frame_size: usize, lm: usize, transient: bool) {
        let channels = self.channels;
        let blocks = if transient { 1 << lm } else { 1 };
        let short = blocks > 1;

        for c in 0..channels {
            if !short {
                let mdct = &mut self.mdcts[lm];
                let pad = mdct.pad();
                let window = mdct.window();

                // Window support: OVERLAP past samples plus this frame,
                // zero-padded on both flanks.
                self.mdct_in[..2 * frame_size].iter_mut().for_each(|v| *v = 0.0);
                for i in 0..OVERLAP {
                    self.mdct_in[pad + i] = self.input_memory[c][i] * window[pad + i];
                }
                for i in 0..frame_size {
                    self.mdct_in[pad + OVERLAP + i] =
                        self.preemph[c][i] * window[pad + OVERLAP + i];
                }

                let (spec, input) = (&mut self.spectrum[c], &self.mdct_in);
                mdct.forward(&input[..2 * frame_size], &mut spec[..frame_size]);
            } else {
                let s = frame_size / blocks;
                debug_assert_eq!(s, crate::celt::SHORT_BLOCK_LEN);
                for b in 0..blocks {
                    let mdct = &mut self.mdcts[0];
                    let window = mdct.window();

                    // Short block b spans the concatenated memory + frame
                    // starting at b * s.
                    for i in 0..2 * s {
                        let pos = b * s + i;
                        let sample = if pos < OVERLAP {
                            self.input_memory[c][pos]
                        } else {
                            self.preemph[c][pos - OVERLAP]
                        };
                        self.mdct_in[i] = sample * window[i];
                    }

                    let mut short_spec = [0.0_f32; 120];
                    let input = &self.mdct_in;
                    self.mdcts[0].forward(&input[..2 * s], &mut short_spec[..s]);

                    // Interleave: block b owns bins b, b + blocks, ...
                    for k in 0..s {
                        self.spectrum[c][k * blocks + b] = short_spec[k];
                    }
                }
            }

            for i in 0..OVERLAP {
                self.input_memory[c][i] = self.preemph[c][frame_size - OVERLAP + i];
            }
        }
    }
}

#[cfg(all(test, feature = "decoder"))]
mod tests {
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use std::f32::consts::PI;

    use super::*;
    use crate::celt::CeltDecoder;
    use crate::range_coder::{RangeDecoder, RangeEncoder};

    fn tone(len: usize, freq: f32, amp: f32) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * PI * freq * i as f32 / 48000.0).sin() * amp)
            .collect()
    }

    fn round_trip(
        frame_size: usize,
        frames: usize,
        channels: usize,
        bytes: usize,
        signal: &[f32],
    ) -> Vec<f32> {
        let mut encoder = CeltEncoder::new(channels);
        let mut decoder = CeltDecoder::new(channels);
        let mut out = Vec::new();

        for f in 0..frames {
            let frame = &signal[f * frame_size..(f + 1) * frame_size];
            let mut buffer = vec![0_u8; bytes];
            {
                let mut enc = RangeEncoder::new(&mut buffer);
                encoder
                    .encode(&mut enc, frame_size, 0, [frame, frame])
                    .unwrap();
                enc.done().unwrap();
            }

            let mut dec = RangeDecoder::new(&buffer);
            let produced = decoder.decode(&mut dec, frame_size, 0).unwrap();
            assert_eq!(produced, frame_size);
            out.extend_from_slice(&decoder.channel(0)[..frame_size]);
        }

        out
    }

    #[test]
    fn test_silence_round_trip() {
        let signal = vec![0.0_f32; 960 * 3];
        let out = round_trip(960, 3, 1, 100, &signal);
        let peak = out.iter().fold(0.0_f32, |m, v| m.max(v.abs()));
        assert!(peak < 1e-3, "silence came back with peak {}", peak);
    }

    #[test]
    fn test_tone_round_trip_keeps_energy() {
        let signal = tone(960 * 4, 440.0, 0.4);
        let out = round_trip(960, 4, 1, 160, &signal);

        // Skip the first frame (decoder priming) and compare energies.
        let in_energy: f32 = signal[960..].iter().map(|v| v * v).sum::<f32>() / (960.0 * 3.0);
        let out_energy: f32 = out[960..].iter().map(|v| v * v).sum::<f32>() / (960.0 * 3.0);

        assert!(out_energy > 0.05 * in_energy, "decoded tone too quiet: {} vs {}", out_energy, in_energy);
        assert!(out_energy < 20.0 * in_energy, "decoded tone exploded: {} vs {}", out_energy, in_energy);
        assert!(out.iter().all(|v| v.is_finite() && v.abs() <= 1.0));
    }

    #[test]
    fn test_stereo_round_trip_is_bounded() {
        let signal = tone(480 * 4, 880.0, 0.3);
        let out = round_trip(480, 4, 2, 120, &signal);
        assert!(out.iter().all(|v| v.is_finite() && v.abs() <= 1.0));
        let energy: f32 = out[480..].iter().map(|v| v * v).sum();
        assert!(energy > 0.0);
    }

    #[test]
    fn test_impulse_sets_transient_flag() {
        // Quiet lead-in, then an impulse late in the frame.
        let mut signal = vec![0.001_f32; 960 * 2];
        for i in 0..32 {
            signal[960 + 480 + i] = 0.9 - i as f32 / 64.0;
        }

        let mut encoder = CeltEncoder::new(1);
        // Prime the first frame.
        let mut buffer = vec![0_u8; 160];
        {
            let mut enc = RangeEncoder::new(&mut buffer);
            encoder
                .encode(&mut enc, 960, 0, [&signal[..960], &signal[..960]])
                .unwrap();
            enc.done().unwrap();
        }

        // The transient detector must fire on the impulse frame.
        encoder.preemph[0][..960].copy_from_slice(&signal[960..]);
        assert!(encoder.detect_transient(960));
    }

    #[test]
    fn test_all_frame_sizes_round_trip() {
        for &frame_size in [120_usize, 240, 480, 960].iter() {
            let signal = tone(frame_size * 3, 330.0, 0.25);
            let out = round_trip(frame_size, 3, 1, 80, &signal);
            assert_eq!(out.len(), frame_size * 3);
            assert!(out.iter().all(|v| v.is_finite() && v.abs() <= 1.0));
        }
    }

    #[test]
    fn test_determinism() {
        let signal = tone(960 * 2, 1000.0, 0.5);
        let a = round_trip(960, 2, 1, 120, &signal);
        let b = round_trip(960, 2, 1, 120, &signal);
        assert_eq!(a, b);
    }
}
