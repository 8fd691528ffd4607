//! Band energy coding for the Celt layer.
//!
//! Coarse energy is coded with a Laplace model at 6 dB resolution under
//! two-dimensional prediction: `alpha` leaks the previous frame's energy in,
//! `beta` the previous band's prediction error. Fine energy refines each
//! band with raw uniform bits. The encoder always feeds its own quantized
//! reconstruction forward, so both sides predict from identical values.

use crate::celt::tables::{
    ALPHA_COEF, BETA_COEF, BETA_INTRA, COARSE_ENERGY_INTER, COARSE_ENERGY_INTRA,
    ENERGY_SMALL_ICDF,
};
use crate::celt::MAX_BANDS;
use crate::encoder_error::EncoderError;
use crate::range_coder::{RangeDecoder, RangeEncoder, Tell};

/// Most fine energy bits a band may receive.
pub(crate) const MAX_FINE_BITS: u32 = 8;

/// Prediction parameters for one frame.
fn prediction(lm: usize, intra: bool) -> (f32, f32, &'static [u8; 42]) {
    if intra {
        (0.0, BETA_INTRA, &COARSE_ENERGY_INTRA[lm])
    } else {
        (ALPHA_COEF[lm], BETA_COEF[lm], &COARSE_ENERGY_INTER[lm])
    }
}

/// Decodes coarse energies for `start..end` into `energy`, predicting from
/// the caller's previous-frame values already present there.
#[allow(clippy::too_many_arguments)]
pub(crate) fn decode_coarse(
    dec: &mut RangeDecoder<'_>,
    lm: usize,
    intra: bool,
    channels: usize,
    start: usize,
    end: usize,
    total_bits: u32,
    energy: &mut [[f32; MAX_BANDS]; 2],
) {
    let (alpha, beta, model) = prediction(lm, intra);
    let mut prev = [0.0_f32; 2];

    for band in start..end {
        for (c, prev_c) in prev.iter_mut().enumerate().take(channels) {
            let bits_left = total_bits as i64 - dec.tell() as i64;

            let qi = if bits_left >= 15 {
                let pi = 2 * band.min(20);
                dec.decode_laplace(
                    u32::from(model[pi]) << 7,
                    u32::from(model[pi + 1]) << 6,
                ) as f32
            } else if bits_left >= 1 {
                let v = dec.decode_icdf(&ENERGY_SMALL_ICDF, 2) as i32;
                ((v >> 1) ^ -(v & 1)) as f32
            } else {
                -1.0
            };

            let e = &mut energy[c][band];
            *e = e.max(-9.0) * alpha + *prev_c + qi;
            *prev_c += beta * qi;
        }
    }
}

/// Encodes coarse energies; `energy` holds the target values on input and
/// the quantized reconstruction on output.
#[allow(clippy::too_many_arguments)]
pub(crate) fn encode_coarse(
    enc: &mut RangeEncoder<'_>,
    lm: usize,
    intra: bool,
    channels: usize,
    start: usize,
    end: usize,
    total_bits: u32,
    energy: &mut [[f32; MAX_BANDS]; 2],
    prev_energy: &[[f32; MAX_BANDS]; 2],
) -> Result<(), EncoderError> {
    let (alpha, beta, model) = prediction(lm, intra);
    let mut prev = [0.0_f32; 2];

    for band in start..end {
        for c in 0..channels {
            let bits_left = total_bits as i64 - enc.tell() as i64;
            let pred = prev_energy[c][band].max(-9.0) * alpha + prev[c];
            let target = energy[c][band];
            let mut qi = (target - pred).round() as i32;

            if bits_left >= 15 {
                let pi = 2 * band.min(20);
                enc.encode_laplace(
                    &mut qi,
                    u32::from(model[pi]) << 7,
                    u32::from(model[pi + 1]) << 6,
                )?;
            } else if bits_left >= 1 {
                qi = qi.max(-1).min(1);
                // Zigzag order 0, -1, +1 matching the decoder's unfolding.
                let v = match qi {
                    0 => 0,
                    -1 => 1,
                    _ => 2,
                };
                enc.encode_icdf(v, &ENERGY_SMALL_ICDF, 2)?;
            } else {
                qi = -1;
            }

            energy[c][band] = pred + qi as f32;
            prev[c] += beta * qi as f32;
        }
    }

    Ok(())
}

/// Decodes fine energy refinements.
pub(crate) fn decode_fine(
    dec: &mut RangeDecoder<'_>,
    channels: usize,
    start: usize,
    end: usize,
    fine_bits: &[u32; MAX_BANDS],
    energy: &mut [[f32; MAX_BANDS]; 2],
) {
    for band in start..end {
        let bits = fine_bits[band];
        if bits == 0 {
            continue;
        }
        for chan in energy.iter_mut().take(channels) {
            let q = dec.decode_bits(bits);
            let offset = (q as f32 + 0.5) / (1 << bits) as f32 - 0.5;
            chan[band] += offset;
        }
    }
}

/// Encodes fine energy refinements; `energy` is updated to the decoder's
/// reconstruction.
pub(crate) fn encode_fine(
    enc: &mut RangeEncoder<'_>,
    channels: usize,
    start: usize,
    end: usize,
    fine_bits: &[u32; MAX_BANDS],
    energy: &mut [[f32; MAX_BANDS]; 2],
    target: &[[f32; MAX_BANDS]; 2],
) -> Result<(), EncoderError> {
    for band in start..end {
        let bits = fine_bits[band];
        if bits == 0 {
            continue;
        }
        for c in 0..channels {
            let err = target[c][band] - energy[c][band];
            let scale = (1 << bits) as f32;
            let q = (((err + 0.5) * scale) as i32).max(0).min((1 << bits) - 1) as u32;
            enc.encode_bits(q, bits)?;
            let offset = (q as f32 + 0.5) / scale - 0.5;
            energy[c][band] += offset;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use nanorand::RNG;

    use super::*;
    use crate::range_coder::{RangeDecoder, RangeEncoder};

    /// The decoder reconstructs exactly the energies the encoder committed
    /// to, across frames (inter prediction) and bands (beta leak).
    #[test]
    fn test_coarse_round_trip_consistency() {
        let mut rng = nanorand::WyRand::new_seed(21);

        for &intra in [false, true].iter() {
            for lm in 0..4 {
                let mut enc_prev = [[0.0_f32; MAX_BANDS]; 2];
                let mut dec_energy = [[0.0_f32; MAX_BANDS]; 2];

                for _frame in 0..4 {
                    let mut target = [[0.0_f32; MAX_BANDS]; 2];
                    for c in 0..2 {
                        for b in 0..MAX_BANDS {
                            target[c][b] =
                                rng.generate_range::<u32>(0, 240) as f32 / 10.0 - 12.0;
                        }
                    }

                    let mut buffer = vec![0_u8; 1024];
                    let mut enc = RangeEncoder::new(&mut buffer);
                    let mut enc_energy = target;
                    encode_coarse(
                        &mut enc, lm, intra, 2, 0, MAX_BANDS, 8192, &mut enc_energy, &enc_prev,
                    )
                    .unwrap();
                    enc.done().unwrap();
                    drop(enc);

                    let mut dec = RangeDecoder::new(&buffer);
                    decode_coarse(&mut dec, lm, intra, 2, 0, MAX_BANDS, 8192, &mut dec_energy);

                    for c in 0..2 {
                        for b in 0..MAX_BANDS {
                            assert!(
                                (dec_energy[c][b] - enc_energy[c][b]).abs() < 1e-4,
                                "lm {} intra {} band {} ch {}: {} vs {}",
                                lm,
                                intra,
                                b,
                                c,
                                dec_energy[c][b],
                                enc_energy[c][b]
                            );
                        }
                    }

                    enc_prev = enc_energy;
                    // The decoder's own state carries over in dec_energy.
                }
            }
        }
    }

    #[test]
    fn test_fine_round_trip() {
        let mut rng = nanorand::WyRand::new_seed(33);
        let mut fine_bits = [0_u32; MAX_BANDS];
        for (i, f) in fine_bits.iter_mut().enumerate() {
            *f = (i as u32) % 5;
        }

        let mut coarse = [[0.0_f32; MAX_BANDS]; 2];
        let mut target = [[0.0_f32; MAX_BANDS]; 2];
        for b in 0..MAX_BANDS {
            for c in 0..2 {
                coarse[c][b] = rng.generate_range::<u32>(0, 100) as f32 / 10.0;
                target[c][b] = coarse[c][b] + rng.generate_range::<u32>(0, 100) as f32 / 200.0
                    - 0.25;
            }
        }

        let mut buffer = vec![0_u8; 512];
        let mut enc = RangeEncoder::new(&mut buffer);
        let mut enc_energy = coarse;
        encode_fine(&mut enc, 2, 0, MAX_BANDS, &fine_bits, &mut enc_energy, &target).unwrap();
        enc.done().unwrap();
        drop(enc);

        let mut dec = RangeDecoder::new(&buffer);
        let mut dec_energy = coarse;
        decode_fine(&mut dec, 2, 0, MAX_BANDS, &fine_bits, &mut dec_energy);

        for b in 0..MAX_BANDS {
            for c in 0..2 {
                assert!((dec_energy[c][b] - enc_energy[c][b]).abs() < 1e-6);
                if fine_bits[b] > 0 {
                    // Fine quantization brings us within half a step.
                    let step = 1.0 / (1 << fine_bits[b]) as f32;
                    assert!((dec_energy[c][b] - target[c][b]).abs() <= 0.5 * step + 1e-5);
                }
            }
        }
    }
}
