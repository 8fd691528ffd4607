//! Implements the Silk layer: a linear-prediction speech coder.
//!
//! Silk frames carry two-stage vector-quantized line spectral frequencies,
//! subframe gains, an optional long-term (pitch) predictor and a shell-coded
//! excitation, all sharing the packet's range coder with the Celt layer.
#[cfg(feature = "decoder")]
pub(crate) use decoder::SilkDecoder;
#[cfg(feature = "encoder")]
pub(crate) use encoder::SilkEncoder;

pub(crate) mod excitation;
pub(crate) mod lsf;
pub(crate) mod tables;

#[cfg(feature = "decoder")]
mod decoder;
#[cfg(feature = "encoder")]
mod encoder;

use crate::Bandwidth;

/// Samples per 5 ms subframe at the widest internal rate (16 kHz).
pub(crate) const MAX_SUBFRAME_LEN: usize = 80;
/// Subframes in a 20 ms frame.
pub(crate) const MAX_SUBFRAMES: usize = 4;
/// Samples in a 20 ms frame at the widest internal rate.
pub(crate) const MAX_FRAME_LEN: usize = MAX_SUBFRAME_LEN * MAX_SUBFRAMES;
/// Widest LPC order (wideband; narrowband and mediumband use 10).
pub(crate) const MAX_LPC_ORDER: usize = 16;
/// Length of the long-term prediction filter.
pub(crate) const LTP_ORDER: usize = 5;
/// Output history kept for long-term prediction look-back. Must cover the
/// widest pitch lag (288) plus the filter neighbourhood.
pub(crate) const HISTORY_LEN: usize = 322;
/// Samples per shell coding block.
pub(crate) const SHELL_BLOCK_LEN: usize = 16;
/// Largest number of 20 ms frames in one Silk payload (60 ms).
pub(crate) const MAX_SILK_FRAMES: usize = 3;
/// Maximum less-significant-bit passes for one excitation block.
pub(crate) const MAX_LSB_COUNT: u32 = 10;

/// Per-bandwidth layout of a Silk frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct BandwidthConfig {
    /// Internal sampling rate in kHz.
    pub(crate) rate_khz: usize,
    /// Order of the short-term prediction filter.
    pub(crate) lpc_order: usize,
    /// Samples per 5 ms subframe.
    pub(crate) subframe_len: usize,
    /// Smallest pitch lag in samples (2 ms).
    pub(crate) pitch_min: usize,
    /// Largest pitch lag in samples (18 ms).
    pub(crate) pitch_max: usize,
}

impl BandwidthConfig {
    /// Returns the frame layout for the given audio bandwidth.
    ///
    /// Superwideband and fullband map to wideband: in hybrid mode Silk always
    /// runs at its 16 kHz internal rate.
    pub(crate) fn from_bandwidth(bandwidth: Bandwidth) -> Self {
        match bandwidth {
            Bandwidth::Narrowband | Bandwidth::Auto => Self {
                rate_khz: 8,
                lpc_order: 10,
                subframe_len: 40,
                pitch_min: 16,
                pitch_max: 144,
            },
            Bandwidth::Mediumband => Self {
                rate_khz: 12,
                lpc_order: 10,
                subframe_len: 60,
                pitch_min: 24,
                pitch_max: 216,
            },
            Bandwidth::Wideband | Bandwidth::Superwideband | Bandwidth::Fullband => Self {
                rate_khz: 16,
                lpc_order: 16,
                subframe_len: 80,
                pitch_min: 32,
                pitch_max: 288,
            },
        }
    }

    /// True for the wideband layout (16 coefficient LPC).
    pub(crate) fn is_wideband(&self) -> bool {
        self.lpc_order == MAX_LPC_ORDER
    }

    /// Samples in one 20 ms frame at the internal rate.
    pub(crate) fn frame_len(&self) -> usize {
        self.subframe_len * MAX_SUBFRAMES
    }
}

/// Signal classification of one Silk frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum SignalType {
    Inactive,
    Unvoiced,
    Voiced,
}

impl SignalType {
    /// Index into tables split by signal type.
    pub(crate) fn index(self) -> usize {
        match self {
            SignalType::Inactive => 0,
            SignalType::Unvoiced => 1,
            SignalType::Voiced => 2,
        }
    }
}

/// Quantization offset class of one Silk frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum QuantOffset {
    Low,
    High,
}

impl QuantOffset {
    /// Index into tables split by quantization offset.
    pub(crate) fn index(self) -> usize {
        match self {
            QuantOffset::Low => 0,
            QuantOffset::High => 1,
        }
    }
}

/// Offset added to the excitation in Q10, from the frame classification.
pub(crate) fn quant_offset_q10(signal_type: SignalType, offset: QuantOffset) -> i32 {
    let class = match signal_type {
        SignalType::Voiced => 1,
        _ => 0,
    };
    tables::QUANT_OFFSET_Q10[class][offset.index()]
}

/// Converts a value in log2 Q7 to a linear Q16 gain.
///
/// Integer piecewise parabolic approximation; the encoder and decoder must
/// reconstruct identical gains from it.
pub(crate) fn log2lin(log_q7: i32) -> i32 {
    let i = 1_i32 << (log_q7 >> 7);
    let f = log_q7 & 127;

    i + ((-174 * f * (128 - f) >> 16) + f) * (i >> 7)
}

/// Dequantizes a 6-bit log gain index to a linear Q16 gain.
pub(crate) fn dequant_gain_q16(log_gain: i32) -> i32 {
    log2lin((log_gain * 0x1D1C71 >> 16) + 2090)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_bandwidth_config() {
        let nb = BandwidthConfig::from_bandwidth(Bandwidth::Narrowband);
        assert_eq!(nb.rate_khz, 8);
        assert_eq!(nb.frame_len(), 160);
        assert!(!nb.is_wideband());

        let mb = BandwidthConfig::from_bandwidth(Bandwidth::Mediumband);
        assert_eq!(mb.rate_khz, 12);
        assert_eq!(mb.frame_len(), 240);

        let wb = BandwidthConfig::from_bandwidth(Bandwidth::Wideband);
        assert_eq!(wb.rate_khz, 16);
        assert_eq!(wb.frame_len(), 320);
        assert!(wb.is_wideband());

        // Hybrid always uses the wideband layout.
        assert_eq!(
            BandwidthConfig::from_bandwidth(Bandwidth::Superwideband),
            wb
        );
        assert_eq!(BandwidthConfig::from_bandwidth(Bandwidth::Fullband), wb);

        // History must cover the widest look-back.
        assert!(HISTORY_LEN >= wb.pitch_max + LTP_ORDER / 2 + 2);
    }

    #[test]
    fn test_gain_dequant_is_monotonic() {
        let mut prev = 0;
        for log_gain in 0..64 {
            let gain = dequant_gain_q16(log_gain);
            assert!(gain > prev, "gain not monotonic at {}", log_gain);
            prev = gain;
        }
    }

    #[test]
    fn test_log2lin_anchors() {
        // 2^8 in Q7 input is 256 in linear domain.
        assert_eq!(log2lin(8 << 7), 256);
        assert_eq!(log2lin(16 << 7), 65536);
    }
}
