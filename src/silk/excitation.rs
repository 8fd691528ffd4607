//! Shell-coded excitation for the Silk layer.
//!
//! The excitation of a frame is coded in blocks of 16 samples. Each block
//! carries a total pulse count, a recursive binary-split distribution of the
//! pulses over the samples, optional less-significant-bit refinements and
//! one sign per non-zero sample. Zero samples are filled with shaped noise
//! from a linear congruential generator seeded from the bitstream.

use crate::encoder_error::EncoderError;
use crate::range_coder::{RangeDecoder, RangeEncoder};
use crate::silk::tables::{
    EXCITATION_LSB_ICDF, PULSE_COUNT_ICDF, RATE_LEVEL_ICDF, SHELL_SPLIT_DEPTH0,
    SHELL_SPLIT_DEPTH1, SHELL_SPLIT_DEPTH2, SHELL_SPLIT_DEPTH3, SIGN_ICDF,
};
use crate::silk::{quant_offset_q10, QuantOffset, SignalType, MAX_LSB_COUNT, SHELL_BLOCK_LEN};

/// Multiplier of the excitation noise generator.
pub(crate) const LCG_MUL: u32 = 196_314_165;
/// Increment of the excitation noise generator.
pub(crate) const LCG_ADD: u32 = 907_633_515;

/// Advances the noise generator and returns the new state.
#[inline(always)]
pub(crate) fn lcg_step(seed: &mut u32) -> u32 {
    *seed = seed.wrapping_mul(LCG_MUL).wrapping_add(LCG_ADD);
    *seed
}

/// Split distribution for a partition of the given length.
fn split_table(len: usize, count: u32) -> &'static [u8] {
    // Parent counts above 16 can only come from corrupt streams; clamp.
    let idx = (count.max(1).min(16) - 1) as usize;
    match len {
        16 => SHELL_SPLIT_DEPTH0[idx],
        8 => SHELL_SPLIT_DEPTH1[idx],
        4 => SHELL_SPLIT_DEPTH2[idx],
        _ => SHELL_SPLIT_DEPTH3[idx],
    }
}

/// Decodes the pulse count of one shell block.
///
/// Returns `(pulse_count, lsb_count)`. Pulse counts of 17 escape into an
/// extra LSB pass, up to [`MAX_LSB_COUNT`].
pub(crate) fn decode_pulse_count(dec: &mut RangeDecoder<'_>, rate_level: usize) -> (u32, u32) {
    let mut lsb_count = 0;
    let mut table = rate_level.min(8);

    loop {
        let v = dec.decode_icdf(&PULSE_COUNT_ICDF[table], 8);
        if v < 17 || lsb_count >= MAX_LSB_COUNT {
            return (v.min(16), lsb_count);
        }
        lsb_count += 1;
        table = if lsb_count < MAX_LSB_COUNT { 9 } else { 10 };
    }
}

/// Encodes the pulse count of one shell block.
pub(crate) fn encode_pulse_count(
    enc: &mut RangeEncoder<'_>,
    rate_level: usize,
    pulse_count: u32,
    lsb_count: u32,
) -> Result<(), EncoderError> {
    let mut table = rate_level.min(8);
    for i in 0..lsb_count {
        enc.encode_icdf(17, &PULSE_COUNT_ICDF[table], 8)?;
        table = if i + 1 < MAX_LSB_COUNT { 9 } else { 10 };
    }
    enc.encode_icdf(pulse_count.min(16) as usize, &PULSE_COUNT_ICDF[table], 8)
}

/// Decodes the pulse positions of one block through the binary split tree.
///
/// The recursion is run with an explicit stack; its depth is bounded by
/// log2 of the block length.
pub(crate) fn decode_shell_block(
    dec: &mut RangeDecoder<'_>,
    pulse_count: u32,
    out: &mut [i32; SHELL_BLOCK_LEN],
) {
    out.iter_mut().for_each(|v| *v = 0);
    if pulse_count == 0 {
        return;
    }

    // (offset, length, pulses) partitions awaiting a split.
    let mut stack = [(0_usize, 0_usize, 0_u32); SHELL_BLOCK_LEN];
    let mut top = 0;
    stack[top] = (0, SHELL_BLOCK_LEN, pulse_count);
    top += 1;

    while top > 0 {
        top -= 1;
        let (offset, len, count) = stack[top];

        if len == 1 {
            out[offset] = count as i32;
            continue;
        }

        let half = len / 2;
        let left = dec
            .decode_icdf(split_table(len, count), 8)
            .min(count);
        let right = count - left;

        if right > 0 {
            stack[top] = (offset + half, half, right);
            top += 1;
        }
        if left > 0 {
            stack[top] = (offset, half, left);
            top += 1;
        }
    }
}

/// Encodes the pulse positions of one block; the exact inverse of
/// [`decode_shell_block`].
pub(crate) fn encode_shell_block(
    enc: &mut RangeEncoder<'_>,
    magnitudes: &[i32; SHELL_BLOCK_LEN],
) -> Result<(), EncoderError> {
    let total: i32 = magnitudes.iter().sum();
    if total == 0 {
        return Ok(());
    }

    let mut stack = [(0_usize, 0_usize, 0_u32); SHELL_BLOCK_LEN];
    let mut top = 0;
    stack[top] = (0, SHELL_BLOCK_LEN, total as u32);
    top += 1;

    while top > 0 {
        top -= 1;
        let (offset, len, count) = stack[top];

        if len == 1 {
            continue;
        }

        let half = len / 2;
        let left: i32 = magnitudes[offset..offset + half].iter().sum();
        let left = left as u32;
        let right = count - left;

        enc.encode_icdf(left as usize, split_table(len, count), 8)?;

        if right > 0 {
            stack[top] = (offset + half, half, right);
            top += 1;
        }
        if left > 0 {
            stack[top] = (offset, half, left);
            top += 1;
        }
    }

    Ok(())
}

/// Decodes the LSB refinement passes of one block.
pub(crate) fn decode_lsbs(
    dec: &mut RangeDecoder<'_>,
    lsb_count: u32,
    magnitudes: &mut [i32; SHELL_BLOCK_LEN],
) {
    for _ in 0..lsb_count {
        for m in magnitudes.iter_mut() {
            let bit = dec.decode_icdf(&EXCITATION_LSB_ICDF, 8);
            *m = (*m << 1) | bit as i32;
        }
    }
}

/// Encodes the LSB refinement passes of one block.
pub(crate) fn encode_lsbs(
    enc: &mut RangeEncoder<'_>,
    lsb_count: u32,
    magnitudes: &[i32; SHELL_BLOCK_LEN],
) -> Result<(), EncoderError> {
    for pass in (0..lsb_count).rev() {
        for &m in magnitudes.iter() {
            let bit = (m >> pass) & 1;
            enc.encode_icdf(bit as usize, &EXCITATION_LSB_ICDF, 8)?;
        }
    }
    Ok(())
}

/// Index of the sign table for the given frame classification and block
/// pulse count.
fn sign_table(
    signal_type: SignalType,
    offset: QuantOffset,
    pulse_count: u32,
) -> &'static [u8; 2] {
    let bucket = pulse_count.min(6) as usize;
    &SIGN_ICDF[signal_type.index() * 2 + offset.index()][bucket]
}

/// Decodes one sign per non-zero magnitude, applying it in place.
pub(crate) fn decode_signs(
    dec: &mut RangeDecoder<'_>,
    signal_type: SignalType,
    offset: QuantOffset,
    pulse_count: u32,
    excitation: &mut [i32; SHELL_BLOCK_LEN],
) {
    let table = sign_table(signal_type, offset, pulse_count);
    for e in excitation.iter_mut() {
        if *e != 0 && dec.decode_icdf(table, 8) == 0 {
            *e = -*e;
        }
    }
}

/// Encodes one sign per non-zero magnitude.
pub(crate) fn encode_signs(
    enc: &mut RangeEncoder<'_>,
    signal_type: SignalType,
    offset: QuantOffset,
    pulse_count: u32,
    excitation: &[i32; SHELL_BLOCK_LEN],
) -> Result<(), EncoderError> {
    let table = sign_table(signal_type, offset, pulse_count);
    for &e in excitation.iter() {
        if e != 0 {
            enc.encode_icdf(usize::from(e > 0), table, 8)?;
        }
    }
    Ok(())
}

/// Expands block magnitudes into the excitation domain, where one pulse is
/// 256 units, adding the quantization offset and shaped noise into
/// zero-pulse positions.
///
/// Voiced frames receive reduced noise so the pitch structure stays clean.
pub(crate) fn reconstruct_excitation(
    signal_type: SignalType,
    offset: QuantOffset,
    seed: &mut u32,
    excitation: &mut [i32],
) {
    // Offsets are specified in Q10 against a unit pulse; rescale to the
    // 256-per-pulse excitation domain.
    let offset = quant_offset_q10(signal_type, offset) >> 2;
    let noise_shift = if signal_type == SignalType::Voiced {
        2
    } else {
        1
    };

    for e in excitation.iter_mut() {
        if *e != 0 {
            let sign = if *e < 0 { -1 } else { 1 };
            *e = (*e << 8) - sign * 20 + offset;
        } else {
            // Noise fill: a zero-centered value bounded by the offset scale.
            let r = lcg_step(seed) as i32;
            *e = offset + (((r >> 16) * offset.abs()) >> (15 + noise_shift));
        }
    }
}
