//! Implements the Celt layer: a transform coder built on the MDCT.
//!
//! Celt codes per-band energy envelopes (coarse + fine) and normalized band
//! shapes through pyramid vector quantization, with folding and
//! anti-collapse keeping every band audible even at starved bitrates.
#[cfg(feature = "decoder")]
pub(crate) use decoder::CeltDecoder;
#[cfg(feature = "encoder")]
pub(crate) use encoder::CeltEncoder;

pub(crate) mod bands;
pub(crate) mod comb_filter;
pub(crate) mod cwrs;
pub(crate) mod energy;
pub(crate) mod fft;
pub(crate) mod mdct;
pub(crate) mod tables;

#[cfg(feature = "decoder")]
mod decoder;
#[cfg(feature = "encoder")]
mod encoder;

/// Number of energy bands at 48 kHz.
pub(crate) const MAX_BANDS: usize = 21;
/// Samples of one short block (2.5 ms at 48 kHz).
pub(crate) const SHORT_BLOCK_LEN: usize = 120;
/// Largest frame size in samples (20 ms at 48 kHz).
pub(crate) const MAX_FRAME_LEN: usize = 960;
/// MDCT overlap region, also the decoder's algorithmic delay.
pub(crate) const OVERLAP: usize = 120;
/// First-order de-emphasis (and pre-emphasis) coefficient.
pub(crate) const DEEMPH_COEF: f32 = 0.85;
/// First band coded in hybrid mode; bands below come from Silk.
pub(crate) const HYBRID_START_BAND: usize = 17;

/// Band edges in bins of a 2.5 ms frame; scale by `1 << lm` for longer
/// frames.
pub(crate) const EBANDS: [usize; MAX_BANDS + 1] = [
    0, 1, 2, 3, 4, 5, 6, 7, 8, 10, 12, 14, 16, 20, 24, 28, 34, 40, 48, 60, 78, 100,
];

/// Number of bands coded per frame size (LM 0..=3).
pub(crate) const EFFECTIVE_BANDS: [usize; 4] = [13, 17, 19, 21];

/// Frame size class: log2 of the frame length in short blocks.
pub(crate) fn lm_from_frame_size(frame_size: usize) -> Option<usize> {
    match frame_size {
        120 => Some(0),
        240 => Some(1),
        480 => Some(2),
        960 => Some(3),
        _ => None,
    }
}

/// Width of `band` in bins at the given frame size class.
#[inline(always)]
pub(crate) fn band_width(band: usize, lm: usize) -> usize {
    (EBANDS[band + 1] - EBANDS[band]) << lm
}

/// First bin of `band` at the given frame size class.
#[inline(always)]
pub(crate) fn band_start(band: usize, lm: usize) -> usize {
    EBANDS[band] << lm
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]

    use super::*;

    #[test]
    fn test_band_layout() {
        assert_eq!(band_start(0, 0), 0);
        assert_eq!(band_width(0, 0), 1);
        assert_eq!(band_width(20, 0), 22);
        assert_eq!(band_width(20, 3), 176);
        // All coded bins fit in the frame for every size class.
        for lm in 0..4 {
            let end = EFFECTIVE_BANDS[lm];
            assert!(band_start(end, lm) <= 120 << lm);
        }
    }

    #[test]
    fn test_lm_mapping() {
        assert_eq!(lm_from_frame_size(120), Some(0));
        assert_eq!(lm_from_frame_size(960), Some(3));
        assert_eq!(lm_from_frame_size(961), None);
    }
}
