//! PRED — Predictive RED.
//!
//! Identical byte mapping to RED, but three statistics tables are kept in
//! parallel, keyed by the sign category of the preceding coded byte:
//! nil (zero), positive (high bit clear), negative (high bit set). Local
//! sign correlation in physiological signals makes each context far
//! sharper than a single pooled table. The first byte of a block codes
//! in the nil context; a block whose discontinuity flag is set starts
//! from the same state, since tables never survive a block boundary.

use byteorder::{ByteOrder, LittleEndian};
use med_core::error::{MedError, Result};

use crate::deriv;
use crate::range::{RangeDecoder, RangeEncoder};
use crate::red::{
    self, CumulativeTable, StatsBin, choose_overflow_bytes, map_derivatives,
    normalize_statistics, overflow_bytes_from_flags, overflow_flags, read_statistics,
    unmap_stream, write_statistics,
};

pub const MODEL_FIXED_BYTES: usize = 16;
pub const CATEGORIES: usize = 3;
pub const NIL: usize = 0;
pub const POS: usize = 1;
pub const NEG: usize = 2;

/// Context category of the byte preceding the one being coded.
#[inline]
pub fn category(previous: u8) -> usize {
    if previous == 0 {
        NIL
    } else if previous & 0x80 != 0 {
        NEG
    } else {
        POS
    }
}

#[derive(Debug, Clone)]
pub struct PredEncoded {
    pub model: Vec<u8>,
    pub payload: Vec<u8>,
    pub derivative_level: u8,
}

pub fn encode(
    samples: &[i32],
    derivative_level: u8,
    overflow_choice: Option<u8>,
    full_table: bool,
) -> Result<PredEncoded> {
    if samples.is_empty() {
        return Err(MedError::encode("empty block"));
    }
    let mut work = samples.to_vec();
    deriv::differentiate(&mut work, derivative_level);

    let min_width = choose_overflow_bytes(&work);
    let overflow_bytes = overflow_choice.map_or(min_width, |o| o.clamp(2, 4).max(min_width));
    let mut stream = Vec::with_capacity(work.len());
    let mut keysamples = Vec::new();
    map_derivatives(&work, overflow_bytes, &mut stream, &mut keysamples);

    // Per-category counts.
    let mut raw = [[0u32; 256]; CATEGORIES];
    let mut prev = 0u8;
    for &b in &stream {
        raw[category(prev)][b as usize] += 1;
        prev = b;
    }

    // Every category needs a non-empty table even if unvisited; give an
    // unvisited category a single zero bin.
    let mut bins: Vec<Vec<StatsBin>> = Vec::with_capacity(CATEGORIES);
    for cat_raw in &mut raw {
        if cat_raw.iter().all(|&c| c == 0) {
            cat_raw[0] = 1;
        }
        bins.push(normalize_statistics(cat_raw, full_table));
    }
    let tables: Vec<CumulativeTable> = bins.iter().map(|b| CumulativeTable::new(b)).collect();

    let mut encoder = RangeEncoder::new();
    let mut prev = 0u8;
    for &b in &stream {
        tables[category(prev)].encode_symbol(&mut encoder, b)?;
        prev = b;
    }
    let coded = encoder.finish();

    let mut model = Vec::with_capacity(MODEL_FIXED_BYTES);
    let mut word = [0u8; 4];
    LittleEndian::write_u32(&mut word, keysamples.len() as u32);
    model.extend_from_slice(&word);
    model.push(derivative_level);
    model.extend_from_slice(&[0; 3]);
    let mut half = [0u8; 2];
    for cat_bins in &bins {
        LittleEndian::write_u16(&mut half, cat_bins.len() as u16);
        model.extend_from_slice(&half);
    }
    let flags =
        overflow_flags(overflow_bytes) | if full_table { 0 } else { red::FLAG_NO_ZERO_COUNTS };
    LittleEndian::write_u16(&mut half, flags);
    model.extend_from_slice(&half);
    for cat_bins in &bins {
        write_statistics(cat_bins, &mut model);
    }

    let mut payload = keysamples;
    payload.extend_from_slice(&coded);

    Ok(PredEncoded {
        model,
        payload,
        derivative_level,
    })
}

pub fn decode(model: &[u8], payload: &[u8], number_of_samples: usize) -> Result<Vec<i32>> {
    if model.len() < MODEL_FIXED_BYTES {
        return Err(MedError::decode("short PRED model region"));
    }
    let keysample_bytes = LittleEndian::read_u32(&model[0..]) as usize;
    let derivative_level = model[4];
    let n_bins = [
        LittleEndian::read_u16(&model[8..]) as usize,
        LittleEndian::read_u16(&model[10..]) as usize,
        LittleEndian::read_u16(&model[12..]) as usize,
    ];
    let flags = LittleEndian::read_u16(&model[14..]);
    let overflow_bytes = overflow_bytes_from_flags(flags);

    let mut cursor = MODEL_FIXED_BYTES;
    let mut tables = Vec::with_capacity(CATEGORIES);
    for &n in &n_bins {
        if n == 0 || n > red::MAX_STATS_BINS {
            return Err(MedError::decode(format!("bad PRED bin count {n}")));
        }
        let bins = read_statistics(&model[cursor..], n)?;
        cursor += 4 * n;
        tables.push(CumulativeTable::new(&bins));
    }

    if keysample_bytes > payload.len() {
        return Err(MedError::decode("keysample region exceeds payload"));
    }
    let (keysamples, coded) = payload.split_at(keysample_bytes);

    let mut decoder = RangeDecoder::new(coded);
    let mut stream = Vec::with_capacity(number_of_samples);
    let mut prev = 0u8;
    for _ in 0..number_of_samples {
        let b = tables[category(prev)].decode_symbol(&mut decoder)?;
        stream.push(b);
        prev = b;
    }

    let mut samples = unmap_stream(&stream, keysamples, overflow_bytes)?;
    deriv::integrate(&mut samples, derivative_level);
    Ok(samples)
}
