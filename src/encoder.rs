//! Implements the Opus encoder.

use log::trace;

use crate::celt::CeltEncoder;
use crate::range_coder::RangeEncoder;
use crate::silk::SilkEncoder;
use crate::{
    Application, Bandwidth, Channels, CodecMode, EncoderError, Sample, SamplingRate, Toc,
    MAX_FRAME_BYTES,
};

/// Encoder-side delay of the Silk analysis branch in hybrid mode.
const HYBRID_INPUT_DELAY: usize = 130;
/// Samples of a 60 ms frame at 48 kHz, the largest the encoder produces.
const MAX_INPUT_SAMPLES: usize = 2880;

/// Configures the encoder on creation.
#[derive(Clone, Debug)]
pub struct EncoderConfiguration {
    /// Sample rate of the input (Hz). Default: 48000 Hz.
    pub sampling_rate: SamplingRate,
    /// Number of input channels. Default: Stereo.
    pub channels: Channels,
    /// Intended application, steering the mode decision. Default: Audio.
    pub application: Application,
}

impl Default for EncoderConfiguration {
    fn default() -> Self {
        Self {
            sampling_rate: SamplingRate::Hz48000,
            channels: Channels::Stereo,
            application: Application::Audio,
        }
    }
}

/// Opus encoder.
///
/// The encoder packs one frame of PCM per call into one Opus packet,
/// choosing the coding layer from the application, the bandwidth and the
/// configured hints.
pub struct Encoder {
    silk_enc: SilkEncoder,
    celt_enc: CeltEncoder,
    channels: Channels,
    sampling_rate: SamplingRate,
    application: Application,

    bitrate: u32,
    complexity: u8,
    inband_fec: bool,
    packet_loss_perc: u8,
    dtx: bool,
    mode_hint: Option<CodecMode>,
    bandwidth_hint: Bandwidth,
    /// Frame duration in samples at 48 kHz.
    frame_size: usize,

    /// Upsampler memory per channel for non-48 kHz input.
    upsample_state: [f32; 2],
    /// Hybrid Silk branch input delay, per channel.
    silk_delay: [[f32; HYBRID_INPUT_DELAY]; 2],

    /// De-interleaved input at 48 kHz.
    in48: [[f32; MAX_INPUT_SAMPLES]; 2],
    /// Silk-rate analysis buffer.
    silk_in: [[f32; MAX_INPUT_SAMPLES]; 2],
}

impl Encoder {
    /// Creates a new `Encoder` with the given configuration.
    pub fn new(configuration: &EncoderConfiguration) -> Result<Self, EncoderError> {
        Ok(Self {
            silk_enc: SilkEncoder::new(),
            celt_enc: CeltEncoder::new(configuration.channels as usize),
            channels: configuration.channels,
            sampling_rate: configuration.sampling_rate,
            application: configuration.application,
            bitrate: 64_000,
            complexity: 9,
            inband_fec: false,
            packet_loss_perc: 0,
            dtx: false,
            mode_hint: None,
            bandwidth_hint: Bandwidth::Auto,
            frame_size: 960,
            upsample_state: [0.0; 2],
            silk_delay: [[0.0; HYBRID_INPUT_DELAY]; 2],
            in48: [[0.0; MAX_INPUT_SAMPLES]; 2],
            silk_in: [[0.0; MAX_INPUT_SAMPLES]; 2],
        })
    }

    /// Resets the encoder to its initial state.
    pub fn reset(&mut self) {
        self.silk_enc.reset();
        self.celt_enc.reset();
        self.upsample_state = [0.0; 2];
        self.silk_delay = [[0.0; HYBRID_INPUT_DELAY]; 2];
    }

    /// Returns the sampling rate the encoder was initialized with.
    pub fn sampling_rate(&self) -> SamplingRate {
        self.sampling_rate
    }

    /// Returns the channels the encoder was initialized with.
    pub fn channels(&self) -> Channels {
        self.channels
    }

    /// Sets the target bitrate in bits per second (6000 to 510000).
    pub fn set_bitrate(&mut self, bitrate: u32) -> Result<(), EncoderError> {
        if !(6_000..=510_000).contains(&bitrate) {
            return Err(EncoderError::BadArguments("bitrate out of range"));
        }
        self.bitrate = bitrate;
        Ok(())
    }

    /// Sets the computational complexity (0 to 10). Kept for API parity;
    /// this implementation always runs its full analysis.
    pub fn set_complexity(&mut self, complexity: u8) -> Result<(), EncoderError> {
        if complexity > 10 {
            return Err(EncoderError::BadArguments("complexity out of range"));
        }
        self.complexity = complexity;
        Ok(())
    }

    /// Enables or disables in-band forward error correction.
    pub fn set_inband_fec(&mut self, enabled: bool) {
        self.inband_fec = enabled;
    }

    /// Sets the expected packet loss percentage (0 to 100).
    pub fn set_packet_loss_perc(&mut self, percentage: u8) -> Result<(), EncoderError> {
        if percentage > 100 {
            return Err(EncoderError::BadArguments("loss percentage out of range"));
        }
        self.packet_loss_perc = percentage;
        Ok(())
    }

    /// Enables or disables discontinuous transmission.
    pub fn set_dtx(&mut self, enabled: bool) {
        self.dtx = enabled;
    }

    /// Forces a codec mode instead of the automatic decision.
    pub fn set_mode_hint(&mut self, mode: Option<CodecMode>) {
        self.mode_hint = mode;
    }

    /// Restricts the coded audio bandwidth.
    pub fn set_bandwidth_hint(&mut self, bandwidth: Bandwidth) {
        self.bandwidth_hint = bandwidth;
    }

    /// Sets the frame duration in samples at 48 kHz.
    pub fn set_frame_size(&mut self, frame_size: usize) -> Result<(), EncoderError> {
        match frame_size {
            120 | 240 | 480 | 960 | 1920 | 2880 => {
                self.frame_size = frame_size;
                Ok(())
            }
            _ => Err(EncoderError::BadArguments("unsupported frame size")),
        }
    }

    /// Encodes one frame of interleaved PCM into an Opus packet.
    ///
    /// The input must hold exactly one frame at the configured sampling
    /// rate. Returns the number of bytes written into `packet`.
    pub fn encode<S: Sample + Copy>(
        &mut self,
        pcm: &[S],
        packet: &mut [u8],
    ) -> Result<usize, EncoderError> {
        let channels = self.channels as usize;
        let factor = 48000 / self.sampling_rate as usize;
        let in_per_channel = self.frame_size / factor;

        if pcm.len() != in_per_channel * channels {
            return Err(EncoderError::BadArguments(
                "input length does not match the frame size",
            ));
        }

        // De-interleave, clamp and upsample to the internal 48 kHz.
        for c in 0..channels {
            let mut state = self.upsample_state[c];
            if factor == 1 {
                for i in 0..in_per_channel {
                    self.in48[c][i] = pcm[i * channels + c].to_f32().max(-1.0).min(1.0);
                }
            } else {
                for i in 0..in_per_channel {
                    let cur = pcm[i * channels + c].to_f32().max(-1.0).min(1.0);
                    for k in 0..factor {
                        let t = (k + 1) as f32 / factor as f32;
                        self.in48[c][i * factor + k] = state + (cur - state) * t;
                    }
                    state = cur;
                }
            }
            self.upsample_state[c] = state;
        }
        if channels == 1 {
            let (first, second) = self.in48.split_at_mut(1);
            second[0][..self.frame_size].copy_from_slice(&first[0][..self.frame_size]);
        }

        let (mode, bandwidth) = self.select_mode()?;
        let toc = Toc {
            mode,
            bandwidth,
            frame_size: self.frame_size,
            stereo: channels == 2,
            frame_code: 0,
        };
        trace!("encoding {:?} {:?} frame of {}", mode, bandwidth, self.frame_size);

        // Discontinuous transmission: silent frames shrink to the TOC byte.
        if self.dtx {
            let energy: f32 = self.in48[0][..self.frame_size]
                .iter()
                .chain(self.in48[1][..self.frame_size].iter())
                .map(|v| v * v)
                .sum();
            if energy < 1e-7 {
                if packet.is_empty() {
                    return Err(EncoderError::BufferTooSmall);
                }
                packet[0] = toc.build()?;
                return Ok(1);
            }
        }

        let budget = (self.bitrate as usize * self.frame_size / 48000 / 8)
            .max(8)
            .min(MAX_FRAME_BYTES);
        if packet.len() < budget + 1 {
            return Err(EncoderError::BufferTooSmall);
        }

        packet[0] = toc.build()?;
        let payload = &mut packet[1..budget + 1];

        let written = match mode {
            CodecMode::Celt => {
                let mut enc = RangeEncoder::new(payload);
                let frame_size = self.frame_size;
                let (left, right) = (&self.in48[0][..frame_size], &self.in48[1][..frame_size]);
                self.celt_enc.encode(&mut enc, frame_size, 0, [left, right])?;
                enc.done()?;
                // Celt allocation is budget-driven; the packet stays CBR.
                budget
            }
            CodecMode::Silk => {
                let native_khz = match bandwidth {
                    Bandwidth::Narrowband => 8,
                    Bandwidth::Mediumband => 12,
                    _ => 16,
                };
                self.downsample_to_silk(native_khz, false);
                let native_len = self.frame_size / (48 / native_khz);

                let mut enc = RangeEncoder::new(payload);
                let (left, right) = {
                    let (a, b) = self.silk_in.split_at(1);
                    (&a[0][..native_len], &b[0][..native_len])
                };
                self.silk_enc.encode(
                    &mut enc,
                    bandwidth,
                    self.frame_size,
                    left,
                    if channels == 2 { Some(right) } else { None },
                )?;
                enc.done()?;
                // Silk packets are VBR: emit only the coded prefix.
                (enc.range_bytes() + 1).min(budget)
            }
            CodecMode::Hybrid => {
                // Silk first on the delayed branch, then Celt above it.
                self.downsample_to_silk(16, true);
                let native_len = self.frame_size / 3;

                let mut enc = RangeEncoder::new(payload);
                {
                    let (a, b) = self.silk_in.split_at(1);
                    self.silk_enc.encode(
                        &mut enc,
                        Bandwidth::Wideband,
                        self.frame_size,
                        &a[0][..native_len],
                        if channels == 2 {
                            Some(&b[0][..native_len])
                        } else {
                            None
                        },
                    )?;
                }
                let frame_size = self.frame_size;
                let (left, right) = (&self.in48[0][..frame_size], &self.in48[1][..frame_size]);
                self.celt_enc.encode(
                    &mut enc,
                    frame_size,
                    crate::celt::HYBRID_START_BAND,
                    [left, right],
                )?;
                enc.done()?;
                budget
            }
        };

        Ok(written + 1)
    }

    /// Encodes one frame of interleaved float PCM. See [`Self::encode`].
    pub fn encode_float(
        &mut self,
        pcm: &[f32],
        packet: &mut [u8],
    ) -> Result<usize, EncoderError> {
        self.encode(pcm, packet)
    }

    /// Picks the codec mode and bandwidth for the current frame.
    fn select_mode(&self) -> Result<(CodecMode, Bandwidth), EncoderError> {
        let bandwidth = match self.bandwidth_hint {
            Bandwidth::Auto => match self.application {
                Application::Voip => Bandwidth::Wideband,
                Application::Audio | Application::LowDelay => Bandwidth::Fullband,
            },
            other => other,
        };

        let mode = if let Some(hint) = self.mode_hint {
            hint
        } else if self.frame_size > 960 {
            // Long frames only exist in the Silk layer.
            CodecMode::Silk
        } else if self.frame_size < 480 {
            // Short frames only exist in the Celt layer.
            CodecMode::Celt
        } else {
            match (self.application, bandwidth) {
                (Application::Voip, b) if b <= Bandwidth::Wideband => CodecMode::Silk,
                (Application::Voip, _) => CodecMode::Hybrid,
                _ => CodecMode::Celt,
            }
        };

        // Square the bandwidth with what the TOC can express.
        let bandwidth = match mode {
            CodecMode::Silk => bandwidth.min(Bandwidth::Wideband),
            CodecMode::Hybrid => {
                if bandwidth >= Bandwidth::Fullband {
                    Bandwidth::Fullband
                } else {
                    Bandwidth::Superwideband
                }
            }
            CodecMode::Celt => {
                if bandwidth == Bandwidth::Mediumband {
                    Bandwidth::Wideband
                } else {
                    bandwidth
                }
            }
        };

        // Reject combinations the packet format cannot carry.
        let toc = Toc {
            mode,
            bandwidth,
            frame_size: self.frame_size,
            stereo: false,
            frame_code: 0,
        };
        toc.config()?;

        Ok((mode, bandwidth))
    }

    /// Box-average downsample of the 48 kHz input into the Silk analysis
    /// buffer, optionally through the hybrid branch delay.
    fn downsample_to_silk(&mut self, native_khz: usize, delayed: bool) {
        let factor = 48 / native_khz;
        let native_len = self.frame_size / factor;

        for c in 0..self.channels as usize {
            // The hybrid branch aligns Silk analysis against Celt's MDCT
            // window by delaying its input.
            if delayed {
                let line = &mut self.silk_delay[c];
                for i in 0..self.frame_size {
                    let fresh = self.in48[c][i];
                    let out = line[0];
                    line.copy_within(1.., 0);
                    line[HYBRID_INPUT_DELAY - 1] = fresh;
                    self.silk_in[c][i] = out;
                }
                for i in 0..native_len {
                    let mut acc = 0.0;
                    for k in 0..factor {
                        acc += self.silk_in[c][i * factor + k];
                    }
                    self.silk_in[c][i] = acc / factor as f32;
                }
            } else {
                for i in 0..native_len {
                    let mut acc = 0.0;
                    for k in 0..factor {
                        acc += self.in48[c][i * factor + k];
                    }
                    self.silk_in[c][i] = acc / factor as f32;
                }
            }
        }
    }
}
