//! Implements the Opus decoder.

use log::{debug, trace};

use crate::celt::CeltDecoder;
use crate::range_coder::{RangeDecoder, Tell};
use crate::silk::SilkDecoder;
use crate::{
    parse_packet, Bandwidth, Channels, CodecMode, DecoderError, Sample, SamplingRate, Toc,
};

/// Decoder-side delay of the Silk branch against Celt in hybrid mode.
const HYBRID_DELAY: usize = 60;
/// Concealment gain halves with every lost frame.
const PLC_FADE: f32 = 0.5;
/// After this many concealed frames the output is muted.
const PLC_LIMIT: u32 = 5;
/// Samples of a 120 ms packet at 48 kHz, the largest the framing allows.
const MAX_PACKET_SAMPLES: usize = 5760;
/// Samples of one hybrid frame at 48 kHz.
const MAX_HYBRID_FRAME: usize = 960;

/// Configures the decoder on creation.
///
/// Internally Opus stores data at 48000 Hz, so that should be the default
/// value for the sampling rate. However, the decoder can efficiently decode
/// to buffers at 8, 12, 16, and 24 kHz so if for some reason the caller cannot
/// use data at the full sample rate, or knows the compressed data doesn't
/// use the full frequency range, it can request decoding at a reduced
/// rate. Likewise, the decoder is capable of filling in either mono or
/// interleaved stereo pcm buffers, at the caller's request.
#[derive(Clone, Debug)]
pub struct DecoderConfiguration {
    /// Sample rate to decode at (Hz). Default: 48000 Hz.
    pub sampling_rate: SamplingRate,
    /// Number of channels to decode. Default: Stereo.
    pub channels: Channels,
    /// Scales the decoded output by a factor specified in Q8 dB units. Default: 0.
    pub gain: i16,
}

impl Default for DecoderConfiguration {
    fn default() -> Self {
        Self {
            sampling_rate: SamplingRate::Hz48000,
            channels: Channels::Stereo,
            gain: 0,
        }
    }
}

/// Opus decoder.
///
/// Opus is a stateful codec with overlapping blocks and as a result Opus
/// packets are not coded independently of each other. Packets must be
/// passed into the decoder serially and in the correct order for a correct
/// decode. Lost packets can be replaced with loss concealment by calling
/// the decoder with `None` for the missing packet.
pub struct Decoder {
    celt_dec: CeltDecoder,
    silk_dec: SilkDecoder,
    channels: Channels,
    sampling_rate: SamplingRate,
    decode_gain: i16,

    bandwidth: Bandwidth,
    prev_mode: Option<CodecMode>,
    prev_toc: Option<Toc>,
    last_packet_duration: Option<usize>,
    final_range: u32,

    fade_factor: f32,
    concealed_count: u32,

    /// Persistent delay line for the hybrid Silk branch, per channel.
    hybrid_delay: [[f32; HYBRID_DELAY]; 2],
    /// Last Silk sample per channel, for upsampler continuity.
    upsample_state: [f32; 2],

    /// Decoded frame at 48 kHz, per channel.
    pcm48: [[f32; MAX_PACKET_SAMPLES]; 2],
    /// Upsampled Silk branch scratch for one hybrid frame.
    silk48: [[f32; MAX_HYBRID_FRAME]; 2],
}

impl Decoder {
    /// Creates a new `Decoder` with the given configuration.
    pub fn new(configuration: &DecoderConfiguration) -> Result<Self, DecoderError> {
        let celt_dec = CeltDecoder::new(configuration.channels as usize);
        let silk_dec = SilkDecoder::new();

        Ok(Self {
            celt_dec,
            silk_dec,
            sampling_rate: configuration.sampling_rate,
            channels: configuration.channels,
            decode_gain: configuration.gain,
            bandwidth: Bandwidth::Auto,
            prev_mode: None,
            prev_toc: None,
            last_packet_duration: None,
            final_range: 0,
            fade_factor: 1.0,
            concealed_count: 0,
            hybrid_delay: [[0.0; HYBRID_DELAY]; 2],
            upsample_state: [0.0; 2],
            pcm48: [[0.0; MAX_PACKET_SAMPLES]; 2],
            silk48: [[0.0; MAX_HYBRID_FRAME]; 2],
        })
    }

    /// Resets the Decoder to be equivalent to a freshly initialized decoder.
    ///
    /// This should be called when switching streams in order to prevent
    /// the back to back decoding from giving different results from
    /// one at a time decoding.
    pub fn reset(&mut self) {
        self.silk_dec.reset();
        self.celt_dec.reset();

        self.bandwidth = Bandwidth::Auto;
        self.prev_mode = None;
        self.prev_toc = None;
        self.last_packet_duration = None;
        self.final_range = 0;
        self.fade_factor = 1.0;
        self.concealed_count = 0;
        self.hybrid_delay = [[0.0; HYBRID_DELAY]; 2];
        self.upsample_state = [0.0; 2];
        debug!("decoder reset");
    }

    /// Returns the sampling rate the decoder was initialized with.
    pub fn sampling_rate(&self) -> SamplingRate {
        self.sampling_rate
    }

    /// Returns the channels the decoder was initialized with.
    pub fn channels(&self) -> Channels {
        self.channels
    }

    /// Returns the amount to scale PCM signal by in Q8 dB units.
    pub fn gain(&self) -> i16 {
        self.decode_gain
    }

    /// Returns the decoder's last bandpass.
    pub fn bandwidth(&self) -> Bandwidth {
        self.bandwidth
    }

    /// Returns the pitch of the last decoded frame, measured in samples at
    /// the active layer's internal rate.
    pub fn pitch(&self) -> Option<u32> {
        match self.prev_mode? {
            CodecMode::Celt => Some(self.celt_dec.pitch()),
            CodecMode::Silk | CodecMode::Hybrid => Some(self.silk_dec.pitch()),
        }
    }

    /// Returns the duration (in samples per channel at 48 kHz) of the last
    /// packet successfully decoded or concealed.
    pub fn last_packet_duration(&self) -> Option<usize> {
        self.last_packet_duration
    }

    /// Returns the final state of the codec's entropy coder.
    ///
    /// This is used for testing purposes, the encoder and decoder state
    /// should be identical after coding a payload assuming no data
    /// corruption or software bugs.
    pub fn final_range(&self) -> u32 {
        self.final_range
    }

    /// Decode an Opus packet with a generic sample output.
    ///
    /// Returns the number of decoded samples per channel.
    ///
    /// The samples buffer must be large enough for the full packet at the
    /// configured sampling rate, interleaved if stereo; otherwise the call
    /// fails with `BufferTooSmall` and no samples are written.
    ///
    /// # Arguments
    /// * `packet`  - Input payload. Use `None` to indicate packet loss.
    /// * `samples` - Output signal encoded as PCM samples (interleaved if 2
    ///               channels).
    pub fn decode<S: Sample>(
        &mut self,
        packet: Option<&[u8]>,
        samples: &mut [S],
    ) -> Result<usize, DecoderError> {
        let produced48 = self.decode_native(packet)?;
        self.deliver(produced48, samples)
    }

    /// Decode an Opus packet with floating point output.
    ///
    /// Returns the number of decoded samples per channel. See
    /// [`Self::decode`].
    pub fn decode_float(
        &mut self,
        packet: Option<&[u8]>,
        samples: &mut [f32],
    ) -> Result<usize, DecoderError> {
        self.decode(packet, samples)
    }

    /// Decodes or conceals one packet into the internal 48 kHz buffers.
    fn decode_native(&mut self, packet: Option<&[u8]>) -> Result<usize, DecoderError> {
        let packet = match packet {
            Some(packet) if !packet.is_empty() => packet,
            Some(_) => return Err(DecoderError::InvalidPacket),
            None => return self.conceal(),
        };

        let toc = Toc::parse(packet[0]);
        let mut sizes = [0_usize; 48];
        let mut offsets = [0_usize; 48];
        let count = parse_packet(packet, false, Some(&mut offsets), &mut sizes, None, None)?;

        let total48 = toc.frame_size * count;
        if total48 > MAX_PACKET_SAMPLES {
            return Err(DecoderError::InvalidPacket);
        }

        let mut produced = 0;
        for f in 0..count {
            let frame = &packet[offsets[f]..offsets[f] + sizes[f]];
            let n = self.decode_frame(&toc, frame, produced)?;
            produced += n;
        }

        self.bandwidth = toc.bandwidth;
        self.prev_mode = Some(toc.mode);
        self.prev_toc = Some(toc);
        self.last_packet_duration = Some(produced);
        self.fade_factor = 1.0;
        self.concealed_count = 0;

        Ok(produced)
    }

    /// Decodes one frame at `base` samples into the 48 kHz buffers.
    fn decode_frame(
        &mut self,
        toc: &Toc,
        frame: &[u8],
        base: usize,
    ) -> Result<usize, DecoderError> {
        let mut dec = RangeDecoder::new(frame);
        trace!(
            "decoding {:?} frame, {} bytes, {} samples",
            toc.mode,
            frame.len(),
            toc.frame_size
        );

        let produced = match toc.mode {
            CodecMode::Silk => {
                let native = self.silk_dec.decode(
                    &mut dec,
                    toc.bandwidth,
                    toc.frame_size,
                    toc.stereo,
                )?;
                let factor = toc.frame_size / native;
                for c in 0..2 {
                    let source = if c == 0 {
                        self.silk_dec.left()
                    } else {
                        self.silk_dec.right()
                    };
                    let mut state = self.upsample_state[c];
                    upsample_linear(
                        &source[..native],
                        factor,
                        &mut state,
                        &mut self.pcm48[c][base..base + toc.frame_size],
                    );
                    self.upsample_state[c] = state;
                }
                toc.frame_size
            }
            CodecMode::Celt => {
                self.celt_dec
                    .set_stream_channels(if toc.stereo { 2 } else { 1 });
                let n = self.celt_dec.decode(&mut dec, toc.frame_size, 0)?;
                for c in 0..2 {
                    let src = self.celt_dec.channel(c);
                    self.pcm48[c][base..base + n].copy_from_slice(&src[..n]);
                }
                n
            }
            CodecMode::Hybrid => {
                // Silk first at its wideband internal rate.
                let native = self.silk_dec.decode(
                    &mut dec,
                    Bandwidth::Wideband,
                    toc.frame_size,
                    toc.stereo,
                )?;
                debug_assert_eq!(native * 3, toc.frame_size);

                for c in 0..2 {
                    let source = if c == 0 {
                        self.silk_dec.left()
                    } else {
                        self.silk_dec.right()
                    };
                    let mut state = self.upsample_state[c];
                    upsample_linear(
                        &source[..native],
                        3,
                        &mut state,
                        &mut self.silk48[c][..toc.frame_size],
                    );
                    self.upsample_state[c] = state;
                }

                // Celt covers the bands above the Silk passband.
                self.celt_dec
                    .set_stream_channels(if toc.stereo { 2 } else { 1 });
                let n = self
                    .celt_dec
                    .decode(&mut dec, toc.frame_size, crate::celt::HYBRID_START_BAND)?;

                for c in 0..2 {
                    // Delay the Silk branch to Celt's MDCT latency, then sum.
                    let (delayed, delay_line) =
                        (&mut self.silk48[c][..n], &mut self.hybrid_delay[c]);
                    apply_delay(delayed, delay_line);

                    let celt = self.celt_dec.channel(c.min(1));
                    for i in 0..n {
                        self.pcm48[c][base + i] =
                            (self.silk48[c][i] + celt[i]).max(-1.0).min(1.0);
                    }
                }
                n
            }
        };

        self.final_range = dec.range();

        Ok(produced)
    }

    /// Produces one concealed frame after packet loss.
    fn conceal(&mut self) -> Result<usize, DecoderError> {
        let toc = self
            .prev_toc
            .ok_or(DecoderError::InvalidState("no frame to conceal from"))?;
        let duration = toc.frame_size;

        self.concealed_count = (self.concealed_count + 1).min(PLC_LIMIT + 1);
        if self.concealed_count > PLC_LIMIT {
            // Long loss bursts fade into silence.
            for c in 0..2 {
                self.pcm48[c][..duration].iter_mut().for_each(|v| *v = 0.0);
            }
            self.last_packet_duration = Some(duration);
            return Ok(duration);
        }
        let fade = self.fade_factor * PLC_FADE;
        self.fade_factor = fade;
        debug!(
            "concealing lost packet {} with fade {:.3}",
            self.concealed_count, fade
        );

        match toc.mode {
            CodecMode::Silk => {
                let native =
                    self.silk_dec
                        .conceal(toc.bandwidth, toc.frame_size, toc.stereo, fade);
                let factor = toc.frame_size / native.max(1);
                for c in 0..2 {
                    let source = if c == 0 {
                        self.silk_dec.left()
                    } else {
                        self.silk_dec.right()
                    };
                    let mut state = self.upsample_state[c];
                    upsample_linear(
                        &source[..native],
                        factor,
                        &mut state,
                        &mut self.pcm48[c][..toc.frame_size],
                    );
                    self.upsample_state[c] = state;
                }
            }
            CodecMode::Celt => {
                self.celt_dec.conceal(toc.frame_size, fade);
                for c in 0..2 {
                    let src = self.celt_dec.channel(c);
                    self.pcm48[c][..toc.frame_size].copy_from_slice(&src[..toc.frame_size]);
                }
            }
            CodecMode::Hybrid => {
                let native =
                    self.silk_dec
                        .conceal(Bandwidth::Wideband, toc.frame_size, toc.stereo, fade);
                for c in 0..2 {
                    let source = if c == 0 {
                        self.silk_dec.left()
                    } else {
                        self.silk_dec.right()
                    };
                    let mut state = self.upsample_state[c];
                    upsample_linear(
                        &source[..native],
                        3,
                        &mut state,
                        &mut self.silk48[c][..toc.frame_size],
                    );
                    self.upsample_state[c] = state;
                }
                self.celt_dec.conceal(toc.frame_size, fade);
                for c in 0..2 {
                    let (delayed, delay_line) = (
                        &mut self.silk48[c][..toc.frame_size],
                        &mut self.hybrid_delay[c],
                    );
                    apply_delay(delayed, delay_line);
                    let celt = self.celt_dec.channel(c);
                    for i in 0..toc.frame_size {
                        self.pcm48[c][i] = (self.silk48[c][i] + celt[i]).max(-1.0).min(1.0);
                    }
                }
            }
        }

        self.last_packet_duration = Some(toc.frame_size);
        Ok(toc.frame_size)
    }

    /// Converts the 48 kHz buffers to the caller's rate, channel layout,
    /// gain and sample format.
    fn deliver<S: Sample>(
        &mut self,
        produced48: usize,
        samples: &mut [S],
    ) -> Result<usize, DecoderError> {
        let factor = 48000 / self.sampling_rate as usize;
        let out_per_channel = produced48 / factor;
        let channels = self.channels as usize;

        if samples.len() < out_per_channel * channels {
            return Err(DecoderError::BufferTooSmall);
        }

        let gain = if self.decode_gain == 0 {
            1.0
        } else {
            10.0_f32.powf(f32::from(self.decode_gain) / (20.0 * 256.0))
        };

        for i in 0..out_per_channel {
            for c in 0..channels {
                // Box average over the decimation window.
                let mut acc = 0.0;
                if channels == 1 {
                    for k in 0..factor {
                        acc += 0.5 * (self.pcm48[0][i * factor + k] + self.pcm48[1][i * factor + k]);
                    }
                } else {
                    for k in 0..factor {
                        acc += self.pcm48[c][i * factor + k];
                    }
                }
                let v = (acc / factor as f32 * gain).max(-1.0).min(1.0);
                samples[i * channels + c] = S::from_f32(v);
            }
        }

        Ok(out_per_channel)
    }
}

/// Linear interpolation upsampler by an integer factor with one sample of
/// persistent history.
fn upsample_linear(input: &[f32], factor: usize, state: &mut f32, out: &mut [f32]) {
    debug_assert_eq!(out.len(), input.len() * factor);
    let mut prev = *state;
    for (i, &cur) in input.iter().enumerate() {
        for k in 0..factor {
            let t = (k + 1) as f32 / factor as f32;
            out[i * factor + k] = prev + (cur - prev) * t;
        }
        prev = cur;
    }
    *state = prev;
}

/// Runs `signal` through a fixed delay line, in place.
fn apply_delay(signal: &mut [f32], line: &mut [f32; HYBRID_DELAY]) {
    for v in signal.iter_mut() {
        let delayed = line[0];
        line.copy_within(1.., 0);
        line[HYBRID_DELAY - 1] = *v;
        *v = delayed;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn decoder(rate: SamplingRate, channels: Channels) -> Decoder {
        Decoder::new(&DecoderConfiguration {
            sampling_rate: rate,
            channels,
            gain: 0,
        })
        .unwrap()
    }

    #[test]
    fn test_upsample_linear_endpoint() {
        let mut state = 0.0;
        let mut out = [0.0_f32; 9];
        upsample_linear(&[3.0, 6.0, 9.0], 3, &mut state, &mut out);
        // Each native sample is hit exactly at the end of its segment.
        assert_eq!(out[2], 3.0);
        assert_eq!(out[5], 6.0);
        assert_eq!(out[8], 9.0);
        assert_eq!(state, 9.0);
        // Interpolated values rise monotonically.
        assert!(out.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_apply_delay_shifts_by_sixty() {
        let mut line = [0.0_f32; HYBRID_DELAY];
        let mut signal: Vec<f32> = (1..=200).map(|i| i as f32).collect();
        apply_delay(&mut signal, &mut line);

        // First 60 samples flush the (zero) line, then the input reappears.
        assert!(signal[..HYBRID_DELAY].iter().all(|&v| v == 0.0));
        assert_eq!(signal[HYBRID_DELAY], 1.0);
        assert_eq!(signal[199], (200 - HYBRID_DELAY) as f32);
    }

    #[test]
    fn test_plc_without_history_is_invalid_state() {
        let mut dec = decoder(SamplingRate::Hz48000, Channels::Mono);
        let mut samples = vec![0.0_f32; 960];
        assert!(matches!(
            dec.decode(None, &mut samples),
            Err(DecoderError::InvalidState(_))
        ));
    }

    #[test]
    fn test_celt_packet_decodes_to_correct_length() {
        // TOC: config 31 (Celt FB 20 ms), mono, code 0 plus an empty frame.
        let packet = [31_u8 << 3];
        let mut dec = decoder(SamplingRate::Hz48000, Channels::Mono);
        let mut samples = vec![0.0_f32; 960];
        let produced = dec.decode(Some(&packet[..]), &mut samples).unwrap();
        assert_eq!(produced, 960);
    }

    #[test]
    fn test_output_rate_conversion() {
        let packet = [31_u8 << 3];
        let mut dec = decoder(SamplingRate::Hz16000, Channels::Mono);
        let mut samples = vec![0.0_f32; 320];
        let produced = dec.decode(Some(&packet[..]), &mut samples).unwrap();
        assert_eq!(produced, 320);
    }

    #[test]
    fn test_buffer_too_small() {
        let packet = [31_u8 << 3];
        let mut dec = decoder(SamplingRate::Hz48000, Channels::Stereo);
        let mut samples = vec![0.0_f32; 100];
        assert_eq!(
            dec.decode(Some(&packet[..]), &mut samples),
            Err(DecoderError::BufferTooSmall)
        );
    }

    #[test]
    fn test_plc_after_decode_then_recovers() {
        let packet = [31_u8 << 3];
        let mut dec = decoder(SamplingRate::Hz48000, Channels::Mono);
        let mut samples = vec![0.0_f32; 960];

        dec.decode(Some(&packet[..]), &mut samples).unwrap();
        // Concealment runs without error and reports the same duration.
        let produced = dec.decode(None, &mut samples).unwrap();
        assert_eq!(produced, 960);
        // A long burst fades to silence.
        for _ in 0..6 {
            dec.decode(None, &mut samples).unwrap();
        }
        assert!(samples.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_decode_i16_output() {
        let packet = [31_u8 << 3];
        let mut dec = decoder(SamplingRate::Hz48000, Channels::Mono);
        let mut samples = vec![0_i16; 960];
        let produced = dec.decode(Some(&packet[..]), &mut samples).unwrap();
        assert_eq!(produced, 960);
    }

    #[test]
    fn test_multi_frame_packet() {
        // Code 3 CBR with three empty Celt frames still yields 3 x 960
        // samples of silence.
        let toc = 31_u8 << 3 | 3;
        let packet = [toc, 3];
        let mut dec = decoder(SamplingRate::Hz48000, Channels::Mono);
        let mut samples = vec![0.0_f32; 2880];
        let produced = dec.decode(Some(&packet[..]), &mut samples).unwrap();
        assert_eq!(produced, 2880);
    }
}
