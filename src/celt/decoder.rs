//! Implements the Celt decoder.

use log::{debug, trace};

use crate::celt::bands::{compute_allocation, decode_alloc_params, decode_bands, decode_stereo_params, renormalize};
use crate::celt::comb_filter::comb_filter_inplace;
use crate::celt::cwrs::PulseCodebook;
use crate::celt::energy::{decode_coarse, decode_fine};
use crate::celt::mdct::Mdct;
use crate::celt::{
    band_start, band_width, lm_from_frame_size, DEEMPH_COEF, EFFECTIVE_BANDS, MAX_BANDS,
    MAX_FRAME_LEN, OVERLAP,
};
use crate::range_coder::{RangeDecoder, Tell};
use crate::silk::excitation::lcg_step;
use crate::DecoderError;

/// Largest comb filter period the post-filter may use.
const MAX_PERIOD: usize = 1024;
/// Energy floor in the log2 domain.
const ENERGY_FLOOR: f32 = -28.0;

/// The Celt decoder.
pub(crate) struct CeltDecoder {
    channels: usize,
    mdcts: [Mdct; 4],
    codebook: PulseCodebook,

    /// Band energies of the previous frame, log2 domain.
    prev_energy: [[f32; MAX_BANDS]; 2],
    /// Band energies of the frame before that; anti-collapse floor.
    prev_energy2: [[f32; MAX_BANDS]; 2],
    /// Overlap-add tail per channel.
    overlap_buffer: [[f32; OVERLAP]; 2],
    /// First-order de-emphasis memory per channel.
    deemph_state: [f32; 2],
    /// Folding and concealment noise state.
    rng_seed: u32,

    // Post-filter state, double-buffered for the cross-fade.
    pf_period: usize,
    pf_gain: f32,
    pf_tapset: usize,
    pf_period_old: usize,
    pf_gain_old: f32,
    pf_tapset_old: usize,
    /// Output history feeding the comb filter look-back.
    pf_memory: [[f32; MAX_PERIOD + 2]; 2],

    // Preallocated scratch.
    energy: [[f32; MAX_BANDS]; 2],
    norm: [[f32; MAX_FRAME_LEN]; 2],
    spectrum: [[f32; MAX_FRAME_LEN]; 2],
    collapse: [u8; MAX_BANDS],
    imdct_in: [f32; MAX_FRAME_LEN],
    imdct_out: [f32; 2 * MAX_FRAME_LEN],
    output: [[f32; MAX_FRAME_LEN]; 2],
}

impl CeltDecoder {
    /// Creates a new Celt decoder for the given channel count.
    pub(crate) fn new(channels: usize) -> Self {
        Self {
            channels,
            mdcts: [Mdct::new(120), Mdct::new(240), Mdct::new(480), Mdct::new(960)],
            codebook: PulseCodebook::new(),
            prev_energy: [[ENERGY_FLOOR; MAX_BANDS]; 2],
            prev_energy2: [[ENERGY_FLOOR; MAX_BANDS]; 2],
            overlap_buffer: [[0.0; OVERLAP]; 2],
            deemph_state: [0.0; 2],
            rng_seed: 0,
            pf_period: 0,
            pf_gain: 0.0,
            pf_tapset: 0,
            pf_period_old: 0,
            pf_gain_old: 0.0,
            pf_tapset_old: 0,
            pf_memory: [[0.0; MAX_PERIOD + 2]; 2],
            energy: [[0.0; MAX_BANDS]; 2],
            norm: [[0.0; MAX_FRAME_LEN]; 2],
            spectrum: [[0.0; MAX_FRAME_LEN]; 2],
            collapse: [0; MAX_BANDS],
            imdct_in: [0.0; MAX_FRAME_LEN],
            imdct_out: [0.0; 2 * MAX_FRAME_LEN],
            output: [[0.0; MAX_FRAME_LEN]; 2],
        }
    }

    /// Resets the Celt decoder to its initial state.
    pub(crate) fn reset(&mut self) {
        let channels = self.channels;
        *self = Self::new(channels);
        debug!("celt decoder reset");
    }

    /// Sets the coded channel count, taken from the packet's TOC.
    pub(crate) fn set_stream_channels(&mut self, channels: usize) {
        self.channels = channels.max(1).min(2);
    }

    /// Pitch period of the active post-filter, if any.
    pub(crate) fn pitch(&self) -> u32 {
        self.pf_period as u32
    }

    /// Output of the last decode, one channel (48 kHz).
    pub(crate) fn channel(&self, c: usize) -> &[f32] {
        &self.output[c.min(self.channels - 1)]
    }

    /// Decodes one Celt frame of `frame_size` samples at 48 kHz.
    ///
    /// In hybrid mode `start_band` is 17 and the post-filter stays off.
    pub(crate) fn decode(
        &mut self,
        dec: &mut RangeDecoder<'_>,
        frame_size: usize,
        start_band: usize,
    ) -> Result<usize, DecoderError> {
        let lm = lm_from_frame_size(frame_size).ok_or(DecoderError::InvalidPacket)?;
        let end = EFFECTIVE_BANDS[lm].max(start_band);
        let start = start_band.min(end);
        let channels = self.channels;
        let total_bits = (dec.storage() * 8) as u32;
        let hybrid = start > 0;

        let silence = if dec.tell() >= total_bits {
            true
        } else {
            dec.decode_bit_logp(15)
        };

        if silence {
            trace!("celt: silence frame");
            for c in 0..channels {
                for e in self.prev_energy[c].iter_mut() {
                    *e = (*e - 4.0).max(ENERGY_FLOOR);
                }
            }
            self.spectrum = [[0.0; MAX_FRAME_LEN]; 2];
            self.synthesize(frame_size, lm, false);
            self.deemphasis(frame_size);
            return Ok(frame_size);
        }

        // Post-filter parameters.
        let mut pf_period = 0_usize;
        let mut pf_gain = 0.0_f32;
        let mut pf_tapset = 0_usize;
        if !hybrid && dec.tell() + 16 <= total_bits && dec.decode_bit_logp(1) {
            let octave = dec.decode_uint(6);
            pf_period = ((16 << octave) + dec.decode_bits(4 + octave) as usize - 1)
                .min(MAX_PERIOD);
            pf_gain = 0.093_75 * (dec.decode_bits(3) + 1) as f32;
            pf_tapset = if dec.tell() + 2 <= total_bits {
                dec.decode_icdf(&crate::celt::tables::TAPSET_ICDF, 2) as usize
            } else {
                0
            };
            trace!(
                "celt postfilter: period {} gain {:.3} tapset {}",
                pf_period,
                pf_gain,
                pf_tapset
            );
        }

        let transient = if lm > 0 && dec.tell() + 3 <= total_bits {
            dec.decode_bit_logp(3)
        } else {
            false
        };

        let intra = if dec.tell() + 3 <= total_bits {
            dec.decode_bit_logp(3)
        } else {
            false
        };
        trace!("celt frame: lm {} transient {} intra {}", lm, transient, intra);

        // Coarse energy predicts from the previous frame's values in place.
        self.energy = self.prev_energy;
        decode_coarse(
            dec,
            lm,
            intra,
            channels,
            start,
            end,
            total_bits,
            &mut self.energy,
        );

        let params = decode_alloc_params(dec, lm, channels, start, end, total_bits);

        let available = (total_bits << 3) as i32 - dec.tell_frac() as i32;
        let alloc = compute_allocation(lm, channels, start, end, available, &params, transient);

        let (intensity, dual) = decode_stereo_params(dec, start, end, &alloc);

        decode_fine(dec, channels, start, end, &alloc.fine_bits, &mut self.energy);

        self.norm = [[0.0; MAX_FRAME_LEN]; 2];
        let mut seed = self.rng_seed;
        decode_bands(
            dec,
            &self.codebook,
            lm,
            channels,
            start,
            end,
            &alloc,
            intensity,
            dual,
            transient,
            &mut seed,
            &mut self.norm,
            &mut self.collapse,
        );
        self.rng_seed = seed;

        // Anti-collapse: refill short blocks that lost all pulses.
        let anti_collapse = alloc.anti_collapse_rsv > 0 && dec.decode_bits(1) == 1;
        if anti_collapse && transient {
            self.apply_anti_collapse(lm, channels, start, end);
        }

        // Denormalize into the frame spectrum.
        self.spectrum = [[0.0; MAX_FRAME_LEN]; 2];
        for c in 0..channels {
            for band in start..end {
                let begin = band_start(band, lm);
                let n = band_width(band, lm);
                let gain = crate::math::fast_exp2(self.energy[c][band].min(15.0));
                for i in 0..n {
                    self.spectrum[c][begin + i] = self.norm[c][begin + i] * gain;
                }
            }
        }

        self.synthesize(frame_size, lm, transient);

        // Post-filter (disabled in hybrid mode).
        if !hybrid {
            self.pf_period_old = self.pf_period;
            self.pf_gain_old = self.pf_gain;
            self.pf_tapset_old = self.pf_tapset;
            self.pf_period = pf_period;
            self.pf_gain = pf_gain;
            self.pf_tapset = pf_tapset;
            self.apply_postfilter(frame_size);
        }

        self.deemphasis(frame_size);

        // Roll the energy history; uncoded bands fall to the floor.
        self.prev_energy2 = self.prev_energy;
        for c in 0..channels {
            for band in 0..MAX_BANDS {
                self.prev_energy[c][band] = if band >= start && band < end {
                    self.energy[c][band].max(ENERGY_FLOOR)
                } else {
                    ENERGY_FLOOR
                };
            }
        }

        Ok(frame_size)
    }

    /// Conceals one lost frame: per-band energy decay with noise fill.
    pub(crate) fn conceal(&mut self, frame_size: usize, fade: f32) -> usize {
        let lm = match lm_from_frame_size(frame_size) {
            Some(lm) => lm,
            None => return 0,
        };
        let end = EFFECTIVE_BANDS[lm];
        let channels = self.channels;
        debug!("celt: concealing {} samples", frame_size);

        for c in 0..channels {
            for e in self.prev_energy[c].iter_mut() {
                *e = (*e - 0.25).max(ENERGY_FLOOR);
            }
        }

        // Fill every band with unit-norm noise at the decayed energy.
        self.spectrum = [[0.0; MAX_FRAME_LEN]; 2];
        for c in 0..channels {
            for band in 0..end {
                let begin = band_start(band, lm);
                let n = band_width(band, lm);
                for i in 0..n {
                    let r = lcg_step(&mut self.rng_seed);
                    self.norm[c][begin + i] = (r >> 16) as i16 as f32 / 32768.0;
                }
                renormalize(&mut self.norm[c][begin..begin + n]);
                let gain = crate::math::fast_exp2(self.prev_energy[c][band].min(15.0)) * fade;
                for i in 0..n {
                    self.spectrum[c][begin + i] = self.norm[c][begin + i] * gain;
                }
            }
        }

        self.synthesize(frame_size, lm, false);
        self.deemphasis(frame_size);

        frame_size
    }

    /// Injects noise into collapsed short blocks at the two-frame energy
    /// floor, then restores the unit norm.
    fn apply_anti_collapse(&mut self, lm: usize, channels: usize, start: usize, end: usize) {
        let blocks = 1 << lm;
        for c in 0..channels {
            for band in start..end {
                let begin = band_start(band, lm);
                let n = band_width(band, lm);
                let mask = self.collapse[band];
                let floor = self.prev_energy[c][band].min(self.prev_energy2[c][band]);
                let r = crate::math::fast_exp2((floor - self.energy[c][band]).min(0.0))
                    / (n as f32 / blocks as f32).sqrt();

                let mut injected = false;
                for b in 0..blocks.min(8) {
                    if mask & (1 << b) != 0 {
                        continue;
                    }
                    let mut i = b;
                    while i < n {
                        let noise = lcg_step(&mut self.rng_seed);
                        self.norm[c][begin + i] += if noise & 0x8000 != 0 { -r } else { r };
                        i += blocks;
                    }
                    injected = true;
                }
                if injected {
                    renormalize(&mut self.norm[c][begin..begin + n]);
                }
            }
        }
    }

    /// IMDCT and overlap-add into `output`, long or short blocks.
    fn synthesize(&mut self, frame_size: usize, lm: usize, transient: bool) {
        let channels = self.channels;
        let blocks = if transient { 1 << lm } else { 1 };
        let short = blocks > 1;

        for c in 0..channels {
            let out = &mut self.output[c];
            out[..frame_size].iter_mut().for_each(|v| *v = 0.0);
            for (n, t) in out
                .iter_mut()
                .zip(self.overlap_buffer[c].iter())
                .take(OVERLAP)
            {
                *n += *t;
            }

            if !short {
                let mdct = &mut self.mdcts[lm];
                let pad = mdct.pad();
                self.imdct_in[..frame_size].copy_from_slice(&self.spectrum[c][..frame_size]);
                mdct.inverse(&self.imdct_in[..frame_size], &mut self.imdct_out[..2 * frame_size]);
                let window = mdct.window();
                for i in 0..frame_size {
                    out[i] += self.imdct_out[pad + i] * window[pad + i];
                }
                for (j, t) in self.overlap_buffer[c].iter_mut().enumerate() {
                    *t = self.imdct_out[pad + frame_size + j]
                        * window[pad + frame_size + j];
                }
            } else {
                let s = frame_size / blocks;
                debug_assert_eq!(s, crate::celt::SHORT_BLOCK_LEN);
                // De-interleave the short block spectra: block b owns bins
                // b, b + blocks, ...
                for b in 0..blocks {
                    for k in 0..s {
                        self.imdct_in[k] = self.spectrum[c][k * blocks + b];
                    }
                    let mdct = &mut self.mdcts[0];
                    mdct.inverse(&self.imdct_in[..s], &mut self.imdct_out[..2 * s]);
                    let window = mdct.window();
                    for i in 0..2 * s {
                        let pos = b * s + i;
                        let v = self.imdct_out[i] * window[i];
                        if pos < frame_size {
                            out[pos] += v;
                        } else {
                            self.overlap_buffer[c][pos - frame_size] = v;
                        }
                    }
                }
            }
        }
    }

    /// Runs the comb post-filter over the fresh output with history.
    fn apply_postfilter(&mut self, frame_size: usize) {
        if self.pf_gain == 0.0 && self.pf_gain_old == 0.0 {
            // Keep the memory warm for the next transition.
            for c in 0..self.channels {
                update_pf_memory(&mut self.pf_memory[c], &self.output[c][..frame_size]);
            }
            return;
        }

        let mut buf = [0.0_f32; MAX_PERIOD + 2 + MAX_FRAME_LEN];
        for c in 0..self.channels {
            let mem = MAX_PERIOD + 2;
            buf[..mem].copy_from_slice(&self.pf_memory[c]);
            buf[mem..mem + frame_size].copy_from_slice(&self.output[c][..frame_size]);

            let window = &self.mdcts[0].window()[..OVERLAP];
            comb_filter_inplace(
                &mut buf[..mem + frame_size],
                mem,
                self.pf_period_old,
                self.pf_period,
                frame_size,
                self.pf_gain_old,
                self.pf_gain,
                self.pf_tapset_old,
                self.pf_tapset,
                window,
            );

            self.output[c][..frame_size].copy_from_slice(&buf[mem..mem + frame_size]);
            update_pf_memory(&mut self.pf_memory[c], &self.output[c][..frame_size]);
        }
    }

    /// First-order de-emphasis with persistent state.
    fn deemphasis(&mut self, frame_size: usize) {
        for c in 0..self.channels {
            let mut state = self.deemph_state[c];
            for v in self.output[c][..frame_size].iter_mut() {
                let y = *v + DEEMPH_COEF * state;
                state = y;
                *v = y.max(-1.0).min(1.0);
            }
            self.deemph_state[c] = state;
        }
    }
}

/// Shifts fresh samples into the post-filter history.
fn update_pf_memory(memory: &mut [f32; MAX_PERIOD + 2], fresh: &[f32]) {
    let mem = memory.len();
    if fresh.len() >= mem {
        memory.copy_from_slice(&fresh[fresh.len() - mem..]);
    } else {
        memory.copy_within(fresh.len().., 0);
        memory[mem - fresh.len()..].copy_from_slice(fresh);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use nanorand::RNG;

    use super::*;
    use crate::range_coder::RangeDecoder;

    /// Random bitstreams must decode without panicking and stay bounded.
    #[test]
    fn test_decode_garbage_is_bounded() {
        let mut rng = nanorand::WyRand::new_seed(0xCE17);

        for case in 0..40 {
            let len = 8 + (case % 60);
            let data: Vec<u8> = (0..len)
                .map(|_| rng.generate_range::<u32>(0, 256) as u8)
                .collect();

            let mut celt = CeltDecoder::new(1 + case % 2);
            let mut dec = RangeDecoder::new(&data);
            let produced = celt.decode(&mut dec, 960, 0).unwrap();
            assert_eq!(produced, 960);

            for &v in celt.channel(0)[..produced].iter() {
                assert!(v.is_finite() && v.abs() <= 1.0, "unbounded sample {}", v);
            }
        }
    }

    #[test]
    fn test_empty_payload_is_silence() {
        // A one-byte packet has an empty frame payload, which decodes as
        // silence.
        let data: [u8; 0] = [];
        let mut celt = CeltDecoder::new(1);
        let mut dec = RangeDecoder::new(&data);
        let produced = celt.decode(&mut dec, 480, 0).unwrap();
        assert_eq!(produced, 480);
        assert!(celt.channel(0)[..produced].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_conceal_decays_energy() {
        let mut celt = CeltDecoder::new(1);
        celt.prev_energy[0].iter_mut().for_each(|e| *e = 2.0);

        let first = celt.conceal(960, 1.0);
        assert_eq!(first, 960);
        let energy1: f32 = celt.channel(0)[..960].iter().map(|v| v * v).sum();

        let _ = celt.conceal(960, 0.5);
        let energy2: f32 = celt.channel(0)[..960].iter().map(|v| v * v).sum();

        assert!(energy1 > 0.0);
        assert!(energy2 < energy1);
    }

    #[test]
    fn test_reset_restores_initial_state() {
        let mut celt = CeltDecoder::new(2);
        celt.prev_energy[0][3] = 5.0;
        celt.deemph_state = [0.3, -0.2];
        celt.reset();
        assert_eq!(celt.prev_energy[0][3], ENERGY_FLOOR);
        assert_eq!(celt.deemph_state, [0.0, 0.0]);
    }
}
