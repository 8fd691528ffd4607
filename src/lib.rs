#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
//! Implements the free and open audio codec Opus in Rust.
//!
//! The Opus codec is designed for interactive speech and audio transmission over the Internet.
//! It is designed by the IETF Codec Working Group and incorporates technology from
//! Skype's Silk codec and Xiph.Org's Celt codec.
//!
//! The Opus codec is designed to handle a wide range of interactive audio applications,
//! including Voice over IP, videoconferencing, in-game chat, and even remote live music
//! performances. It can scale from low bit-rate narrowband speech to very high quality
//! stereo music. Its main features are:
//!
//! * Sampling rates from 8 to 48 kHz
//! * Bit-rates from 6 kb/s to 510 kb/s
//! * Support for both constant bit-rate (CBR) and variable bit-rate (VBR)
//! * Audio bandwidth from narrowband to full-band
//! * Support for speech and music
//! * Support for mono and stereo
//! * Frame sizes from 2.5 ms to 60 ms
//! * Good loss robustness and packet loss concealment (PLC)
#[cfg(feature = "decoder")]
pub use decoder::*;
pub use decoder_error::*;
#[cfg(feature = "encoder")]
pub use encoder::*;
pub use encoder_error::*;

pub(crate) mod celt;
#[cfg(feature = "decoder")]
mod decoder;
mod decoder_error;
#[cfg(feature = "encoder")]
mod encoder;
mod encoder_error;
pub(crate) mod math;
pub(crate) mod range_coder;
pub(crate) mod silk;

// Affects the following targets: avr and msp430
#[cfg(any(target_pointer_width = "8", target_pointer_width = "16"))]
compile_error!("usize needs to be at least 32 bit wide");

/// The largest frame any Opus stream may carry, in bytes.
pub(crate) const MAX_FRAME_BYTES: usize = 1275;

/// Allows applications to use their own sample format.
pub trait Sample {
    /// Converts the given float into the custom sample.
    fn from_f32(float: f32) -> Self;
    /// Converts the custom sample into a float in [-1, 1].
    fn to_f32(self) -> f32;
}

impl Sample for f32 {
    #[inline(always)]
    fn from_f32(float: f32) -> Self {
        float
    }

    #[inline(always)]
    fn to_f32(self) -> f32 {
        self
    }
}

impl Sample for f64 {
    #[inline(always)]
    fn from_f32(float: f32) -> Self {
        float as f64
    }

    #[inline(always)]
    fn to_f32(self) -> f32 {
        self as f32
    }
}

impl Sample for i16 {
    #[inline(always)]
    fn from_f32(float: f32) -> Self {
        let float = float * 32767.0;
        if float > 32767.0 {
            32767
        } else if float < -32768.0 {
            -32768
        } else {
            float as i16
        }
    }

    #[inline(always)]
    fn to_f32(self) -> f32 {
        f32::from(self) / 32767.0
    }
}

/// Audio channels.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Channels {
    /// Mono - 1 channel
    Mono = 1,
    /// Stereo - 2 channels
    Stereo = 2,
}

/// Samples per second.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SamplingRate {
    /// 8 kHz
    Hz8000 = 8000,
    /// 12 kHz
    Hz12000 = 12000,
    /// 16 kHz
    Hz16000 = 16000,
    /// 24 kHz
    Hz24000 = 24000,
    /// 48 kHz
    Hz48000 = 48000,
}

/// Intended application of the encoded stream.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Application {
    /// Favor speech intelligibility.
    Voip,
    /// Favor faithful music reproduction.
    Audio,
    /// Favor the lowest possible coding delay.
    LowDelay,
}

/// Audio bandwidth.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum Bandwidth {
    /// Automatic selection.
    Auto,
    /// 4 kHz passband.
    Narrowband,
    /// 6 kHz passband.
    Mediumband,
    /// 8 kHz passband.
    Wideband,
    /// 12 kHz passband.
    Superwideband,
    /// 20 kHz passband.
    Fullband,
}

const BANDWIDTH_TABLE: [Bandwidth; 32] = [
    Bandwidth::Narrowband,
    Bandwidth::Narrowband,
    Bandwidth::Narrowband,
    Bandwidth::Narrowband,
    Bandwidth::Mediumband,
    Bandwidth::Mediumband,
    Bandwidth::Mediumband,
    Bandwidth::Mediumband,
    Bandwidth::Wideband,
    Bandwidth::Wideband,
    Bandwidth::Wideband,
    Bandwidth::Wideband,
    Bandwidth::Superwideband,
    Bandwidth::Superwideband,
    Bandwidth::Fullband,
    Bandwidth::Fullband,
    Bandwidth::Narrowband,
    Bandwidth::Narrowband,
    Bandwidth::Narrowband,
    Bandwidth::Narrowband,
    Bandwidth::Wideband,
    Bandwidth::Wideband,
    Bandwidth::Wideband,
    Bandwidth::Wideband,
    Bandwidth::Superwideband,
    Bandwidth::Superwideband,
    Bandwidth::Superwideband,
    Bandwidth::Superwideband,
    Bandwidth::Fullband,
    Bandwidth::Fullband,
    Bandwidth::Fullband,
    Bandwidth::Fullband,
];

impl From<u8> for Bandwidth {
    fn from(u: u8) -> Self {
        BANDWIDTH_TABLE[u as usize]
    }
}

/// Codec mode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CodecMode {
    /// Silk only.
    Silk,
    /// Hybrid mode.
    Hybrid,
    /// Celt only.
    Celt,
}

/// The decoded table-of-contents byte that leads every Opus packet.
///
/// The TOC byte (MSB to LSB) packs a 5-bit configuration number, a stereo
/// flag and a 2-bit frame count code. The configuration maps onto a codec
/// mode, an audio bandwidth and a frame duration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Toc {
    /// Codec mode of the packet.
    pub mode: CodecMode,
    /// Audio bandwidth of the packet.
    pub bandwidth: Bandwidth,
    /// Frame duration in samples at 48 kHz (120, 240, 480, 960, 1920 or 2880).
    pub frame_size: usize,
    /// True if the packet carries a stereo stream.
    pub stereo: bool,
    /// Frame count code (0..=3).
    pub frame_code: u8,
}

impl Toc {
    /// Parses a TOC byte.
    pub fn parse(byte: u8) -> Self {
        let config = byte >> 3;
        let stereo = byte & 0x4 != 0;
        let frame_code = byte & 0x3;

        let mode = if config < 12 {
            CodecMode::Silk
        } else if config < 16 {
            CodecMode::Hybrid
        } else {
            CodecMode::Celt
        };

        let bandwidth = Bandwidth::from(config);

        let frame_size = match mode {
            CodecMode::Silk => 480 << (config & 0x3),
            CodecMode::Hybrid => 480 << (config & 0x1),
            CodecMode::Celt => 120 << (config & 0x3),
        };

        Self {
            mode,
            bandwidth,
            frame_size,
            stereo,
            frame_code,
        }
    }

    /// Returns the configuration number (0..=31) for this TOC.
    pub fn config(&self) -> Result<u8, EncoderError> {
        let bad = EncoderError::BadArguments("invalid mode/bandwidth/frame size combination");
        let config = match self.mode {
            CodecMode::Silk => {
                let base = match self.bandwidth {
                    Bandwidth::Narrowband => 0,
                    Bandwidth::Mediumband => 4,
                    Bandwidth::Wideband => 8,
                    _ => return Err(bad),
                };
                let duration = match self.frame_size {
                    480 => 0,
                    960 => 1,
                    1920 => 2,
                    2880 => 3,
                    _ => return Err(bad),
                };
                base + duration
            }
            CodecMode::Hybrid => {
                let base = match self.bandwidth {
                    Bandwidth::Superwideband => 12,
                    Bandwidth::Fullband => 14,
                    _ => return Err(bad),
                };
                let duration = match self.frame_size {
                    480 => 0,
                    960 => 1,
                    _ => return Err(bad),
                };
                base + duration
            }
            CodecMode::Celt => {
                let base = match self.bandwidth {
                    Bandwidth::Narrowband => 16,
                    Bandwidth::Wideband => 20,
                    Bandwidth::Superwideband => 24,
                    Bandwidth::Fullband => 28,
                    _ => return Err(bad),
                };
                let duration = match self.frame_size {
                    120 => 0,
                    240 => 1,
                    480 => 2,
                    960 => 3,
                    _ => return Err(bad),
                };
                base + duration
            }
        };

        Ok(config)
    }

    /// Builds the TOC byte.
    pub fn build(&self) -> Result<u8, EncoderError> {
        let config = self.config()?;
        if self.frame_code > 3 {
            return Err(EncoderError::BadArguments("frame code out of range"));
        }
        Ok(config << 3 | u8::from(self.stereo) << 2 | self.frame_code)
    }
}

/// Returns the bandwidth of an Opus packet.
///
/// Packet must have at least a size of 1.
///
/// # Arguments
/// * `packet` - Input payload.
pub fn query_packet_bandwidth(packet: &[u8]) -> Bandwidth {
    debug_assert!(!packet.is_empty());

    let value = (packet[0] & 0xF8) >> 3;
    value.into()
}

/// Returns the number of channels from an Opus packet.
///
/// Packet must have at least a size of 1.
///
/// # Arguments
/// * `packet` - Input payload.
pub fn query_packet_channel_count(packet: &[u8]) -> Channels {
    debug_assert!(!packet.is_empty());

    if packet[0] & 0x4 != 0 {
        Channels::Stereo
    } else {
        Channels::Mono
    }
}

/// Returns the number of frames in an Opus packet.
///
/// Packet must have at least a size of 1.
///
/// # Arguments
/// * `packet` - Input payload.
pub fn query_packet_frame_count(packet: &[u8]) -> Result<usize, DecoderError> {
    debug_assert!(!packet.is_empty());

    let count = packet[0] & 0x3;
    if count == 0 {
        Ok(1)
    } else if count != 3 {
        Ok(2)
    } else if packet.len() < 2 {
        Err(DecoderError::InvalidPacket)
    } else {
        Ok((packet[1] & 0x3F) as usize)
    }
}

/// Returns the number of samples per frame from an Opus packet.
///
/// # Arguments
/// * `packet`        - Input payload.
/// * `sampling_rate` - Sampling rate.
pub fn query_packet_samples_per_frame(packet: &[u8], sampling_rate: SamplingRate) -> usize {
    if packet[0] & 0x80 != 0 {
        let audio_size = usize::from((packet[0] >> 3) & 0x3);
        ((sampling_rate as usize) << audio_size) / 400
    } else if (packet[0] & 0x60) == 0x60 {
        if packet[0] & 0x08 != 0 {
            sampling_rate as usize / 50
        } else {
            sampling_rate as usize / 100
        }
    } else {
        let audio_size = usize::from((packet[0] >> 3) & 0x3);
        if audio_size == 3 {
            sampling_rate as usize * 60 / 1000
        } else {
            ((sampling_rate as usize) << audio_size) / 100
        }
    }
}

/// Returns the number of samples of an Opus packet.
///
/// Packet must have at least a size of 1.
///
/// # Arguments
/// * `packet`        - Input payload.
/// * `sampling_rate` - Sampling rate.
pub fn query_packet_sample_count(
    packet: &[u8],
    sampling_rate: SamplingRate,
) -> Result<usize, DecoderError> {
    let count = query_packet_frame_count(packet)?;
    let samples = count * query_packet_samples_per_frame(packet, sampling_rate);
    if samples * 25 > sampling_rate as usize * 3 {
        Err(DecoderError::InvalidPacket)
    } else {
        Ok(samples)
    }
}

/// Returns the codec mode of the Opus packet.
///
/// # Arguments
/// * `packet` - Input payload.
pub fn query_packet_codec_mode(packet: &[u8]) -> CodecMode {
    if packet[0] & 0x80 == 0x80 {
        CodecMode::Celt
    } else if packet[0] & 0x60 == 0x60 {
        CodecMode::Hybrid
    } else {
        CodecMode::Silk
    }
}

/// Parse an Opus packet into one or more frames.
///
/// Returns the number of frames inside the packet.
///
/// `Decoder::decode` will perform this operation internally so most applications do not need
/// to use this function.
///
/// This function does not copy the frames, it returns the offsets to the frames inside the packet.
///
/// # Arguments
/// * `packet`         - Opus packet to be parsed.
/// * `self_delimited` - True if the packet has self delimited framing.
/// * `frames`         - Returns the encapsulated frame offsets.
/// * `sizes`          - Returns the sizes of the encapsulated frames.
/// * `payload_offset` - Returns the position of the payload within the packet (in bytes).
/// * `packet_offset`  - Returns the position of the next packet (in bytes) in
///                      multi channel packets.
pub fn parse_packet(
    packet: &[u8],
    self_delimited: bool,
    mut frames: Option<&mut [usize; 48]>,
    sizes: &mut [usize; 48],
    payload_offset: Option<&mut usize>,
    packet_offset: Option<&mut usize>,
) -> Result<usize, DecoderError> {
    if packet.is_empty() {
        return Err(DecoderError::InvalidPacket);
    }

    let framesize = query_packet_samples_per_frame(packet, SamplingRate::Hz48000);
    let mut offset = 1;
    let mut len = packet.len() - offset;
    let mut last_size = len;
    let mut cbr = false;
    let mut pad = 0;
    let count: usize;

    match packet[0] & 0x3 {
        0 => {
            // One frame.
            count = 1;
        }
        1 => {
            // Two CBR frames.
            count = 2;
            cbr = true;

            if !self_delimited {
                if len & 0x1 == 1 {
                    return Err(DecoderError::InvalidPacket);
                }
                last_size = len / 2;
                // If last_size doesn't fit in size[0], we'll catch it later.
                sizes[0] = last_size;
            }
        }
        2 => {
            // Two VBR frames.
            count = 2;
            let bytes = parse_size(&packet[offset..], &mut sizes[0])?;
            len -= bytes;
            if sizes[0] > len {
                return Err(DecoderError::InvalidPacket);
            }
            offset += bytes;
            last_size = len - sizes[0];
        }
        3 => {
            // Multiple CBR/VBR frames (from 0 to 120 ms).
            if len < 1 {
                return Err(DecoderError::InvalidPacket);
            }
            // Number of frames encoded in bits 0 to 5.
            let ch = usize::from(packet[offset]);
            offset += 1;

            count = ch & 0x3F;
            if count == 0 || framesize * count > 5760 {
                return Err(DecoderError::InvalidPacket);
            }
            len -= 1;

            // Padding flag is bit 6.
            if ch & 0x40 != 0x0 {
                let mut p = 255;
                while p == 255 {
                    if len < 1 {
                        return Err(DecoderError::InvalidPacket);
                    }
                    p = usize::from(packet[offset]);
                    offset += 1;
                    len -= 1;

                    let tmp = if p == 255 { 254 } else { p };
                    if tmp > len {
                        return Err(DecoderError::InvalidPacket);
                    }
                    len -= tmp;
                    pad += tmp;
                }
            }

            // VBR flag is bit 7.
            cbr = ch & 0x80 == 0;
            if !cbr {
                // VBR case
                last_size = len;
                for i in 0..count - 1 {
                    let bytes = parse_size(&packet[offset..], &mut sizes[i])?;
                    len -= bytes;
                    if sizes[i] > len {
                        return Err(DecoderError::InvalidPacket);
                    }
                    offset += bytes;
                    last_size -= bytes + sizes[i];
                }
            } else if !self_delimited {
                // CBR case.
                last_size = len / count;
                if last_size * count != len {
                    return Err(DecoderError::InvalidPacket);
                }
                (0..count - 1).into_iter().for_each(|i| {
                    sizes[i] = last_size;
                });
            }
        }
        _ => {
            // The two low bits can only hold 0..=3.
            return Err(DecoderError::InternalError("frame code out of range"));
        }
    }

    // Self-delimited framing has an extra size for the last frame.
    if self_delimited {
        let bytes = parse_size(&packet[offset..], &mut sizes[count - 1])?;
        len -= bytes;
        if sizes[count - 1] > len {
            return Err(DecoderError::InvalidPacket);
        }
        offset += bytes;
        // For CBR packets, apply the size to all the frames.
        if cbr {
            if sizes[count - 1] * count > len {
                return Err(DecoderError::InvalidPacket);
            }
            (0..count - 1).into_iter().for_each(|i| {
                sizes[i] = sizes[count - 1];
            });
        } else if bytes + sizes[count - 1] > last_size {
            return Err(DecoderError::InvalidPacket);
        }
    } else {
        // Because it's not encoded explicitly, it's possible the size of the
        // last packet (or all the packets, for the CBR case) is larger than
        // 1275. Reject them here.
        if last_size > MAX_FRAME_BYTES {
            return Err(DecoderError::InvalidPacket);
        }
        sizes[count - 1] = last_size;
    }

    if let Some(payload_offset) = payload_offset {
        *payload_offset = offset;
    }

    (0..count).into_iter().for_each(|i| {
        if let Some(frames) = &mut frames {
            frames[i] = offset;
        }

        offset += sizes[i];
    });

    if let Some(packet_offset) = packet_offset {
        *packet_offset = pad + offset;
    }

    Ok(count)
}

fn parse_size(data: &[u8], size: &mut usize) -> Result<usize, DecoderError> {
    if data.is_empty() {
        Err(DecoderError::InvalidPacket)
    } else if data[0] < 252 {
        *size = data[0] as usize;
        Ok(1)
    } else if data.len() < 2 {
        Err(DecoderError::InvalidPacket)
    } else {
        *size = 4 * usize::from(data[1]) + usize::from(data[0]);
        Ok(2)
    }
}

/// Writes a frame length in the 1 or 2 byte Opus encoding.
///
/// Returns the number of bytes written.
fn write_size(out: &mut [u8], len: usize) -> Result<usize, EncoderError> {
    if len < 252 {
        if out.is_empty() {
            return Err(EncoderError::BufferTooSmall);
        }
        out[0] = len as u8;
        Ok(1)
    } else if len <= MAX_FRAME_BYTES {
        if out.len() < 2 {
            return Err(EncoderError::BufferTooSmall);
        }
        let b0 = 252 + (len - 252) % 4;
        out[0] = b0 as u8;
        out[1] = ((len - b0) / 4) as u8;
        Ok(2)
    } else {
        Err(EncoderError::BadArguments("frame larger than 1275 bytes"))
    }
}

/// Builds an Opus packet from one or more encoded frames.
///
/// The frame count code is chosen from the frame list: a single frame uses
/// code 0, two equal-sized frames code 1, two unequal frames code 2 and
/// anything else (or any packet with padding) code 3. Code 3 packets are CBR
/// when all frames share one length and VBR otherwise.
///
/// Returns the number of bytes written.
///
/// # Arguments
/// * `out`     - Output buffer.
/// * `toc`     - Mode, bandwidth, frame duration and channel layout. The
///               `frame_code` field is ignored and derived from `frames`.
/// * `frames`  - The encoded frames, at most 48, each at most 1275 bytes.
/// * `padding` - Number of padding bytes to append.
pub fn build_packet(
    out: &mut [u8],
    toc: &Toc,
    frames: &[&[u8]],
    padding: usize,
) -> Result<usize, EncoderError> {
    if frames.is_empty() || frames.len() > 48 {
        return Err(EncoderError::BadArguments(
            "packet must contain 1 to 48 frames",
        ));
    }
    if frames.iter().any(|f| f.len() > MAX_FRAME_BYTES) {
        return Err(EncoderError::BadArguments("frame larger than 1275 bytes"));
    }

    let uniform = frames.iter().all(|f| f.len() == frames[0].len());
    let frame_code = if padding > 0 || frames.len() > 2 {
        3
    } else if frames.len() == 1 {
        0
    } else if uniform {
        1
    } else {
        2
    };

    let toc_byte = Toc { frame_code, ..*toc }.build()?;

    if out.is_empty() {
        return Err(EncoderError::BufferTooSmall);
    }
    out[0] = toc_byte;
    let mut offset = 1;

    match frame_code {
        0 => {}
        1 => {}
        2 => {
            offset += write_size(&mut out[offset..], frames[0].len())?;
        }
        _ => {
            let vbr = !uniform;
            if out.len() < offset + 1 {
                return Err(EncoderError::BufferTooSmall);
            }
            out[offset] = u8::from(vbr) << 7 | u8::from(padding > 0) << 6 | frames.len() as u8;
            offset += 1;

            if padding > 0 {
                let mut pad = padding;
                while pad >= 255 {
                    if out.len() < offset + 1 {
                        return Err(EncoderError::BufferTooSmall);
                    }
                    out[offset] = 255;
                    offset += 1;
                    pad -= 254;
                }
                if out.len() < offset + 1 {
                    return Err(EncoderError::BufferTooSmall);
                }
                out[offset] = pad as u8;
                offset += 1;
            }

            if vbr {
                // All lengths but the last are explicit.
                for frame in &frames[..frames.len() - 1] {
                    offset += write_size(&mut out[offset..], frame.len())?;
                }
            }
        }
    }

    for frame in frames {
        if out.len() < offset + frame.len() {
            return Err(EncoderError::BufferTooSmall);
        }
        out[offset..offset + frame.len()].copy_from_slice(frame);
        offset += frame.len();
    }

    if out.len() < offset + padding {
        return Err(EncoderError::BufferTooSmall);
    }
    out[offset..offset + padding].iter_mut().for_each(|b| *b = 0);
    offset += padding;

    Ok(offset)
}

/// Applies soft-clipping to bring a float signal within the [-1,1] range. If
/// the signal is already in that range, nothing is done. If there are values
/// outside of [-1,1], then the signal is clipped as smoothly as possible to
/// both fit in the range and avoid creating excessive distortion in the
/// process.
///
/// # Arguments
/// * `pcm`          - Input PCM and modified PCM.
/// * `channels`     - Number of channels.
/// * `softclip_mem` - State memory for the soft clipping process
///                    (one float per channel, initialized to zero).
pub fn pcm_soft_clip(pcm: &mut [f32], channels: usize, softclip_mem: &mut [f32]) {
    if pcm.is_empty() || channels == 0 || softclip_mem.len() < channels {
        return;
    }
    let frame_size = pcm.len() / channels;

    // First thing: saturate everything to +/- 2 which is the highest level our
    // non-linearity can handle. At the point where the signal reaches +/-2,
    // the derivative will be zero anyway, so this doesn't introduce any
    // discontinuity in the derivative.
    pcm.iter_mut()
        .for_each(|x| *x = f32::min(f32::max(*x, -2.0), 2.0));

    (0..channels).into_iter().for_each(|c| {
        let mut a = softclip_mem[c];

        // Continue applying the non-linearity from the previous frame to avoid
        // any discontinuity.
        for i in 0..frame_size {
            let off = c + i * channels;
            if pcm[off] * a >= 0.0 {
                break;
            }
            pcm[off] += a * pcm[off] * pcm[off];
        }

        let mut curr = 0;
        let x0 = pcm[c];

        loop {
            let mut pos = 0;
            for i in curr..frame_size {
                pos = i;
                if pcm[c + pos * channels] > 1.0 || pcm[c + pos * channels] < -1.0 {
                    break;
                }
            }

            if pos == frame_size {
                a = 0.0;
                break;
            }

            let mut peak_pos = pos;
            let mut start = pos;
            let mut end = pos;
            let mut maxval = f32::abs(pcm[c + pos * channels]);

            // Look for first zero crossing before clipping.
            while start > 0 && pcm[c + pos * channels] * pcm[c + (start - 1) * channels] >= 0.0 {
                start -= 1;
            }

            // Look for first zero crossing after clipping.
            while end < frame_size && pcm[c + pos * channels] * pcm[c + end * channels] >= 0.0 {
                // Look for other peaks until the next zero-crossing.
                if f32::abs(pcm[c + end * channels]) > maxval {
                    maxval = f32::abs(pcm[c + end * channels]);
                    peak_pos = end;
                }
                end += 1;
            }

            // Detect the special case where we clip before the first zero crossing.
            let special = start == 0 && (pcm[c + pos * channels] * pcm[c]) >= 0.0;

            // Compute a such that maxval + a * maxval^2 = 1
            a = (maxval - 1.0) / (maxval * maxval);

            // Slightly boost "a" by 2^-22. This is just enough to ensure -ffast-math
            // does not cause output values larger than +/-1, but small enough not
            // to matter even for 24-bit output.
            a += a * 2.4e-7;

            if pcm[c + pos * channels] > 0.0 {
                a = -a;
            }

            // Apply soft clipping.
            (start..end).into_iter().for_each(|i| {
                let off = c + i * channels;
                pcm[off] += a * pcm[off] * pcm[off];
            });

            if special && peak_pos >= 2 {
                // Add a linear ramp from the first sample to the signal peak.
                // This avoids a discontinuity at the beginning of the frame.
                let mut offset = x0 - pcm[c];
                let delta = offset / peak_pos as f32;

                (curr..peak_pos).into_iter().for_each(|i| {
                    let off = c + i * channels;
                    offset -= delta;
                    pcm[off] += offset;
                    pcm[off] = f32::min(f32::max(pcm[off], -1.0), 1.0);
                });
            }

            curr = end;
            if curr == frame_size {
                break;
            }
        }
        softclip_mem[c] = a;
    });
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use super::*;

    const TEST_PACKET_SINGLE: &[u8] = &[
        0x80, 0xDA, 0x84, 0xE8, 0x87, 0x77, 0x83, 0xD6, 0x48, 0xB3, 0x6B, 0x45,
    ];
    const TEST_PACKET_CBR: &[u8] = &[
        0x81, 0xDA, 0x84, 0xE8, 0x87, 0x77, 0x83, 0xD6, 0x48, 0xB3, 0x6B,
    ];
    const TEST_PACKET_VBR: &[u8] = &[
        0x82, 0x4, 0xDA, 0x84, 0xE8, 0x87, 0x77, 0x83, 0xD6, 0x48, 0xB3, 0x6B,
    ];
    const TEST_PACKET_INVALID: &[u8] = &[0x81, 0xDA];

    #[test]
    fn test_query_packet_bandwidth() {
        let bandwidths: Vec<Bandwidth> = (0..32)
            .into_iter()
            .map(|c| {
                let arr = [c << 3];
                query_packet_bandwidth(&arr)
            })
            .collect();

        assert_eq!(bandwidths.len(), 32);
        (0..4).for_each(|i| assert_eq!(bandwidths[i], Bandwidth::Narrowband));
        (4..8).for_each(|i| assert_eq!(bandwidths[i], Bandwidth::Mediumband));
        (8..12).for_each(|i| assert_eq!(bandwidths[i], Bandwidth::Wideband));
        (12..14).for_each(|i| assert_eq!(bandwidths[i], Bandwidth::Superwideband));
        (14..16).for_each(|i| assert_eq!(bandwidths[i], Bandwidth::Fullband));
        (16..20).for_each(|i| assert_eq!(bandwidths[i], Bandwidth::Narrowband));
        (20..24).for_each(|i| assert_eq!(bandwidths[i], Bandwidth::Wideband));
        (24..28).for_each(|i| assert_eq!(bandwidths[i], Bandwidth::Superwideband));
        (28..32).for_each(|i| assert_eq!(bandwidths[i], Bandwidth::Fullband));
    }

    #[test]
    fn test_query_packet_channel_count() {
        assert_eq!(query_packet_channel_count(&[0]), Channels::Mono);
        assert_eq!(query_packet_channel_count(&[0x4]), Channels::Stereo);
    }

    #[test]
    fn test_query_packet_frame_count() {
        assert_eq!(query_packet_frame_count(&[0]).unwrap(), 1);
        assert_eq!(query_packet_frame_count(&[1]).unwrap(), 2);
        assert_eq!(query_packet_frame_count(&[2]).unwrap(), 2);
        assert!(query_packet_frame_count(&[3]).is_err());
        assert_eq!(query_packet_frame_count(&[3, 5]).unwrap(), 5);
    }

    #[test]
    fn test_query_packet_samples_per_frame() {
        let frame_sizes: Vec<usize> = (0..32)
            .into_iter()
            .map(|c| {
                let arr = [c << 3];
                query_packet_samples_per_frame(&arr, SamplingRate::Hz48000)
            })
            .collect();

        let expected = [
            480, 960, 1920, 2880, 480, 960, 1920, 2880, 480, 960, 1920, 2880, 480, 960, 480, 960,
            120, 240, 480, 960, 120, 240, 480, 960, 120, 240, 480, 960, 120, 240, 480, 960,
        ];
        assert_eq!(&frame_sizes[..], &expected[..]);
    }

    #[test]
    fn test_query_packet_sample_count() {
        assert_eq!(
            query_packet_sample_count(&[70], SamplingRate::Hz48000).unwrap(),
            960
        );
        assert!(query_packet_sample_count(&[3], SamplingRate::Hz48000).is_err());
        assert_eq!(
            query_packet_sample_count(&[255, 5], SamplingRate::Hz48000).unwrap(),
            4800
        );
    }

    #[test]
    fn test_parse_packet_with_single_frame() {
        let mut frames = [0; 48];
        let mut sizes = [0; 48];
        let mut payload_offset = 0;
        let mut packet_offset = 0;

        let count = parse_packet(
            TEST_PACKET_SINGLE,
            false,
            Some(&mut frames),
            &mut sizes,
            Some(&mut payload_offset),
            Some(&mut packet_offset),
        )
        .unwrap();

        assert_eq!(count, 1);
        assert_eq!(frames[0], 1);
        assert_eq!(sizes[0], 11);
        assert_eq!(payload_offset, 1);
        assert_eq!(packet_offset, 12);
    }

    #[test]
    fn test_parse_packet_with_two_cbr_frames() {
        let mut frames = [0; 48];
        let mut sizes = [0; 48];
        let mut payload_offset = 0;
        let mut packet_offset = 0;

        let count = parse_packet(
            TEST_PACKET_CBR,
            false,
            Some(&mut frames),
            &mut sizes,
            Some(&mut payload_offset),
            Some(&mut packet_offset),
        )
        .unwrap();

        assert_eq!(count, 2);
        assert_eq!(frames[0], 1);
        assert_eq!(sizes[0], 5);
        assert_eq!(frames[1], 6);
        assert_eq!(sizes[1], 5);
        assert_eq!(payload_offset, 1);
        assert_eq!(packet_offset, 11);
    }

    #[test]
    fn test_parse_packet_with_two_vbr_frames() {
        let mut frames = [0; 48];
        let mut sizes = [0; 48];
        let mut payload_offset = 0;
        let mut packet_offset = 0;

        let count = parse_packet(
            TEST_PACKET_VBR,
            false,
            Some(&mut frames),
            &mut sizes,
            Some(&mut payload_offset),
            Some(&mut packet_offset),
        )
        .unwrap();

        assert_eq!(count, 2);
        assert_eq!(frames[0], 2);
        assert_eq!(sizes[0], 4);
        assert_eq!(frames[1], 6);
        assert_eq!(sizes[1], 6);
        assert_eq!(payload_offset, 2);
        assert_eq!(packet_offset, 12);
    }

    #[test]
    fn test_parse_packet_invalid_frame() {
        let mut frames = [0; 48];
        let mut sizes = [0; 48];

        assert!(parse_packet(
            TEST_PACKET_INVALID,
            false,
            Some(&mut frames),
            &mut sizes,
            None,
            None,
        )
        .is_err())
    }

    #[test]
    fn test_toc_round_trip() {
        // Every valid (config, stereo, frame_code) tuple survives a
        // parse -> build round trip.
        for config in 0..32_u8 {
            for stereo in 0..2_u8 {
                for frame_code in 0..4_u8 {
                    let byte = config << 3 | stereo << 2 | frame_code;
                    let toc = Toc::parse(byte);
                    assert_eq!(toc.build().unwrap(), byte, "config {}", config);
                }
            }
        }
    }

    fn round_trip_packet(frames: &[&[u8]], padding: usize) {
        let toc = Toc {
            mode: CodecMode::Celt,
            bandwidth: Bandwidth::Fullband,
            frame_size: 960,
            stereo: false,
            frame_code: 0,
        };

        let mut out = vec![0_u8; 48 * 1280 + 1024];
        let written = build_packet(&mut out, &toc, frames, padding).unwrap();

        let mut offsets = [0; 48];
        let mut sizes = [0; 48];
        let mut packet_offset = 0;
        let count = parse_packet(
            &out[..written],
            false,
            Some(&mut offsets),
            &mut sizes,
            None,
            Some(&mut packet_offset),
        )
        .unwrap();

        assert_eq!(count, frames.len());
        assert_eq!(packet_offset, written);
        for i in 0..count {
            assert_eq!(sizes[i], frames[i].len(), "frame {} size", i);
            assert_eq!(
                &out[offsets[i]..offsets[i] + sizes[i]],
                frames[i],
                "frame {} content",
                i
            );
        }
    }

    #[test]
    fn test_build_packet_round_trip() {
        let lengths = [0_usize, 1, 251, 252, 255, 256, 1020, 1275];
        let paddings = [0_usize, 254, 255, 510];

        // Code 0: one frame.
        for &len in lengths.iter() {
            let frame = vec![0xA5_u8; len];
            round_trip_packet(&[&frame], 0);
        }

        // Code 1: two equal frames.
        for &len in lengths.iter() {
            let frame = vec![0x5A_u8; len];
            round_trip_packet(&[&frame, &frame], 0);
        }

        // Code 2: two unequal frames.
        for &len in lengths.iter() {
            let a = vec![0x11_u8; len];
            let b = vec![0x22_u8; (len + 7) % 1275];
            round_trip_packet(&[&a, &b], 0);
        }

        // Code 3: CBR and VBR batches with padding.
        for &pad in paddings.iter() {
            let a = vec![0x33_u8; 17];
            round_trip_packet(&[&a, &a, &a], pad);

            let b = vec![0x44_u8; 252];
            let c = vec![0x55_u8; 9];
            round_trip_packet(&[&a, &b, &c], pad);
        }
    }

    #[test]
    fn test_build_packet_multi_frame_cbr() {
        // Three equal-sized frames parse back as exactly three equal slices.
        let frame = vec![0x7E_u8; 33];
        round_trip_packet(&[&frame, &frame, &frame], 0);
    }

    #[test]
    fn test_build_packet_rejects_bad_counts() {
        let toc = Toc {
            mode: CodecMode::Celt,
            bandwidth: Bandwidth::Fullband,
            frame_size: 960,
            stereo: false,
            frame_code: 0,
        };
        let mut out = vec![0_u8; 4096];

        assert!(build_packet(&mut out, &toc, &[], 0).is_err());

        let frame = [0_u8; 4];
        let frames: Vec<&[u8]> = (0..49).map(|_| &frame[..]).collect();
        assert!(build_packet(&mut out, &toc, &frames, 0).is_err());
    }

    #[test]
    fn test_vbr_length_boundaries() {
        // Frame code 2 with first-frame lengths at the 1/2 byte encoding edges.
        for &len in [251_usize, 252, 1020, 1275].iter() {
            let a = vec![0x66_u8; len];
            let b = vec![0x77_u8; 3];
            round_trip_packet(&[&a, &b], 0);
        }
    }

    #[test]
    fn test_pcm_soft_clip() {
        let mut x = [0_f32; 1024];
        let mut s = [0_f32; 8];

        (0..1024).into_iter().for_each(|i| {
            (0..1024).into_iter().for_each(|j| {
                x[j] = (j & 255) as f32 * (1.0 / 32.0) - 4.0;
            });

            pcm_soft_clip(&mut x[i..], 1, &mut s);

            (i..1024).into_iter().for_each(|j| {
                assert!(x[j] <= 1.0);
                assert!(x[j] >= -1.0);
            });
        });

        (1..9).into_iter().for_each(|i| {
            (0..1024).into_iter().for_each(|j| {
                x[j] = (j & 255) as f32 * (1.0 / 32.0) - 4.0;
            });
            pcm_soft_clip(&mut x, i, &mut s);
            (0..(1024 / i) * i).into_iter().for_each(|j| {
                assert!(x[j] <= 1.0);
                assert!(x[j] >= -1.0);
            });
        });
    }
}
