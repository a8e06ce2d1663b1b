//! RED — Range-Encoded Derivatives.
//!
//! Differenced samples are mapped to a byte stream: values fitting a
//! signed byte are stored directly, anything larger emits the keysample
//! flag byte (0x80) and appends its full value to a side stream of 2-,
//! 3-, or 4-byte escapes. The byte stream is then range-coded against a
//! per-block statistics table. RED1 writes the classic full 256-bin
//! table; RED2, the default writer, stores only the occupied bins.
//!
//! Payload layout: keysample escapes first (length in the model header),
//! range-coded stream after.

use byteorder::{ByteOrder, LittleEndian};
use med_core::error::{MedError, Result};

use crate::deriv;
use crate::range::{RangeDecoder, RangeEncoder, TOTAL_COUNTS};

pub const KEYSAMPLE_FLAG: u8 = 0x80;
pub const MODEL_FIXED_BYTES: usize = 12;
pub const MAX_STATS_BINS: usize = 256;

// Model flag bits.
pub const FLAG_NO_ZERO_COUNTS: u16 = 1;
pub const FLAG_POSITIVE_DERIVATIVES: u16 = 1 << 1;
pub const FLAG_2_BYTE_OVERFLOWS: u16 = 1 << 2;
pub const FLAG_3_BYTE_OVERFLOWS: u16 = 1 << 3;

/// One normalized statistics bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsBin {
    pub symbol: u8,
    pub count: u32,
}

/// Map overflow width to model flags.
pub fn overflow_flags(overflow_bytes: u8) -> u16 {
    match overflow_bytes {
        2 => FLAG_2_BYTE_OVERFLOWS,
        3 => FLAG_3_BYTE_OVERFLOWS,
        _ => 0,
    }
}

pub fn overflow_bytes_from_flags(flags: u16) -> u8 {
    if flags & FLAG_2_BYTE_OVERFLOWS != 0 {
        2
    } else if flags & FLAG_3_BYTE_OVERFLOWS != 0 {
        3
    } else {
        4
    }
}

/// Smallest escape width that holds every out-of-byte derivative.
pub fn choose_overflow_bytes(derivatives: &[i32]) -> u8 {
    let mut width = 2u8;
    for &v in derivatives {
        if (-127..=127).contains(&v) {
            continue;
        }
        if i64::from(v) >= -(1 << 15) && i64::from(v) < (1 << 15) {
            // fits 2 bytes
        } else if i64::from(v) >= -(1 << 23) && i64::from(v) < (1 << 23) {
            width = width.max(3);
        } else {
            return 4;
        }
    }
    width
}

/// Map derivatives to the coded byte stream plus keysample escapes.
pub fn map_derivatives(
    derivatives: &[i32],
    overflow_bytes: u8,
    stream: &mut Vec<u8>,
    keysamples: &mut Vec<u8>,
) {
    for &v in derivatives {
        if (-127..=127).contains(&v) {
            stream.push(v as i8 as u8);
        } else {
            stream.push(KEYSAMPLE_FLAG);
            let le = v.to_le_bytes();
            keysamples.extend_from_slice(&le[..overflow_bytes as usize]);
        }
    }
}

/// Invert [`map_derivatives`].
pub fn unmap_stream(
    stream: &[u8],
    keysamples: &[u8],
    overflow_bytes: u8,
) -> Result<Vec<i32>> {
    let width = overflow_bytes as usize;
    let mut out = Vec::with_capacity(stream.len());
    let mut cursor = 0usize;
    for &b in stream {
        if b == KEYSAMPLE_FLAG {
            if cursor + width > keysamples.len() {
                return Err(MedError::decode("keysample stream exhausted"));
            }
            let mut value = [0u8; 4];
            value[..width].copy_from_slice(&keysamples[cursor..cursor + width]);
            // Sign-extend from the escape width.
            let shift = 32 - 8 * width as u32;
            out.push((i32::from_le_bytes(value) << shift) >> shift);
            cursor += width;
        } else {
            out.push(b as i8 as i32);
        }
    }
    if cursor != keysamples.len() {
        return Err(MedError::decode("trailing keysample bytes"));
    }
    Ok(out)
}

/// Normalize raw byte counts to a table summing exactly to 2^16. With
/// `include_zero_bins` every symbol gets a bin (the RED1 classic table);
/// otherwise only occupied symbols appear.
pub fn normalize_statistics(raw: &[u32; 256], include_zero_bins: bool) -> Vec<StatsBin> {
    let total: u64 = raw.iter().map(|&c| u64::from(c)).sum();
    let mut bins: Vec<StatsBin> = (0..256)
        .filter(|&s| include_zero_bins || raw[s] > 0)
        .map(|s| {
            let scaled = if total == 0 {
                1
            } else {
                ((u64::from(raw[s]) * u64::from(TOTAL_COUNTS)) / total).max(1) as u32
            };
            StatsBin {
                symbol: s as u8,
                count: scaled,
            }
        })
        .collect();
    debug_assert!(!bins.is_empty() && bins.len() <= MAX_STATS_BINS);

    let mut sum: i64 = bins.iter().map(|b| i64::from(b.count)).sum();
    let target = i64::from(TOTAL_COUNTS);
    while sum > target {
        // Shave from the largest bin, never below 1.
        let largest = bins
            .iter_mut()
            .max_by_key(|b| b.count)
            .expect("bins is non-empty");
        let take = (sum - target).min(i64::from(largest.count) - 1);
        largest.count -= take as u32;
        sum -= take;
        if take == 0 {
            break;
        }
    }
    if sum < target {
        let largest = bins
            .iter_mut()
            .max_by_key(|b| b.count)
            .expect("bins is non-empty");
        largest.count += (target - sum) as u32;
    }
    bins
}

/// Serialize bins: `{symbol, pad, count - 1 as u16}` per entry.
pub fn write_statistics(bins: &[StatsBin], out: &mut Vec<u8>) {
    for bin in bins {
        out.push(bin.symbol);
        out.push(0);
        let mut count = [0u8; 2];
        LittleEndian::write_u16(&mut count, (bin.count - 1) as u16);
        out.extend_from_slice(&count);
    }
}

pub fn read_statistics(bytes: &[u8], n_bins: usize) -> Result<Vec<StatsBin>> {
    if bytes.len() < 4 * n_bins {
        return Err(MedError::decode("short statistics table"));
    }
    let bins: Vec<StatsBin> = (0..n_bins)
        .map(|i| StatsBin {
            symbol: bytes[4 * i],
            count: u32::from(LittleEndian::read_u16(&bytes[4 * i + 2..])) + 1,
        })
        .collect();
    let sum: u64 = bins.iter().map(|b| u64::from(b.count)).sum();
    if sum != u64::from(TOTAL_COUNTS) {
        return Err(MedError::decode(format!(
            "statistics table sums to {sum}, expected {TOTAL_COUNTS}"
        )));
    }
    Ok(bins)
}

/// Cumulative lookup structure over a normalized table.
pub struct CumulativeTable {
    /// (cumulative, count) per bin, in bin order.
    entries: Vec<(u32, u32)>,
    /// symbol -> bin index.
    by_symbol: [u16; 256],
    symbols: Vec<u8>,
}

pub const NO_BIN: u16 = u16::MAX;

impl CumulativeTable {
    pub fn new(bins: &[StatsBin]) -> Self {
        let mut entries = Vec::with_capacity(bins.len());
        let mut by_symbol = [NO_BIN; 256];
        let mut symbols = Vec::with_capacity(bins.len());
        let mut cum = 0u32;
        for (i, bin) in bins.iter().enumerate() {
            entries.push((cum, bin.count));
            by_symbol[bin.symbol as usize] = i as u16;
            symbols.push(bin.symbol);
            cum += bin.count;
        }
        CumulativeTable {
            entries,
            by_symbol,
            symbols,
        }
    }

    pub fn encode_symbol(&self, encoder: &mut RangeEncoder, symbol: u8) -> Result<()> {
        let idx = self.by_symbol[symbol as usize];
        if idx == NO_BIN {
            return Err(MedError::encode(format!(
                "symbol {symbol:#04x} missing from statistics table"
            )));
        }
        let (cum, count) = self.entries[idx as usize];
        encoder.encode(cum, count);
        Ok(())
    }

    pub fn decode_symbol(&self, decoder: &mut RangeDecoder) -> Result<u8> {
        let target = decoder.decode_target();
        let idx = self.entries.partition_point(|&(cum, _)| cum <= target) - 1;
        let (cum, count) = self.entries[idx];
        decoder.decode_update(cum, count)?;
        Ok(self.symbols[idx])
    }
}

/// An encoded RED block: model region plus payload.
#[derive(Debug, Clone)]
pub struct RedEncoded {
    pub model: Vec<u8>,
    pub payload: Vec<u8>,
    pub derivative_level: u8,
}

/// Encode with RED. `full_table` selects the RED1 classic 256-bin table.
pub fn encode(
    samples: &[i32],
    derivative_level: u8,
    overflow_choice: Option<u8>,
    full_table: bool,
) -> Result<RedEncoded> {
    if samples.is_empty() {
        return Err(MedError::encode("empty block"));
    }
    let mut work = samples.to_vec();
    deriv::differentiate(&mut work, derivative_level);

    // A requested escape width is a goal: it is widened when the block's
    // derivatives do not fit it.
    let min_width = choose_overflow_bytes(&work);
    let overflow_bytes = overflow_choice.map_or(min_width, |o| o.clamp(2, 4).max(min_width));
    let mut stream = Vec::with_capacity(work.len());
    let mut keysamples = Vec::new();
    map_derivatives(&work, overflow_bytes, &mut stream, &mut keysamples);

    let mut raw = [0u32; 256];
    for &b in &stream {
        raw[b as usize] += 1;
    }
    let bins = normalize_statistics(&raw, full_table);
    let table = CumulativeTable::new(&bins);

    let mut encoder = RangeEncoder::new();
    for &b in &stream {
        table.encode_symbol(&mut encoder, b)?;
    }
    let coded = encoder.finish();

    let mut model = Vec::with_capacity(MODEL_FIXED_BYTES + 4 * bins.len());
    let mut word = [0u8; 4];
    LittleEndian::write_u32(&mut word, keysamples.len() as u32);
    model.extend_from_slice(&word);
    model.push(derivative_level);
    model.extend_from_slice(&[0; 3]);
    let mut half = [0u8; 2];
    LittleEndian::write_u16(&mut half, bins.len() as u16);
    model.extend_from_slice(&half);
    let flags = overflow_flags(overflow_bytes) | if full_table { 0 } else { FLAG_NO_ZERO_COUNTS };
    LittleEndian::write_u16(&mut half, flags);
    model.extend_from_slice(&half);
    write_statistics(&bins, &mut model);

    let mut payload = keysamples;
    payload.extend_from_slice(&coded);

    Ok(RedEncoded {
        model,
        payload,
        derivative_level,
    })
}

/// Decode a RED block.
pub fn decode(model: &[u8], payload: &[u8], number_of_samples: usize) -> Result<Vec<i32>> {
    if model.len() < MODEL_FIXED_BYTES {
        return Err(MedError::decode("short RED model region"));
    }
    let keysample_bytes = LittleEndian::read_u32(&model[0..]) as usize;
    let derivative_level = model[4];
    let n_bins = LittleEndian::read_u16(&model[8..]) as usize;
    let flags = LittleEndian::read_u16(&model[10..]);
    let overflow_bytes = overflow_bytes_from_flags(flags);

    if n_bins == 0 || n_bins > MAX_STATS_BINS {
        return Err(MedError::decode(format!("bad bin count {n_bins}")));
    }
    let bins = read_statistics(&model[MODEL_FIXED_BYTES..], n_bins)?;
    let table = CumulativeTable::new(&bins);

    if keysample_bytes > payload.len() {
        return Err(MedError::decode("keysample region exceeds payload"));
    }
    let (keysamples, coded) = payload.split_at(keysample_bytes);

    let mut decoder = RangeDecoder::new(coded);
    let mut stream = Vec::with_capacity(number_of_samples);
    for _ in 0..number_of_samples {
        stream.push(table.decode_symbol(&mut decoder)?);
    }

    let mut samples = unmap_stream(&stream, keysamples, overflow_bytes)?;
    deriv::integrate(&mut samples, derivative_level);
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_samples(n: usize, amplitude: f64) -> Vec<i32> {
        (0..n)
            .map(|i| (amplitude * (i as f64 * 0.05).sin()) as i32)
            .collect()
    }

    #[test]
    fn round_trip_smooth_signal() {
        let samples = sine_samples(4000, 20_000.0);
        for level in 0..=3u8 {
            for full_table in [false, true] {
                let encoded = encode(&samples, level, None, full_table).unwrap();
                let decoded = decode(&encoded.model, &encoded.payload, samples.len()).unwrap();
                assert_eq!(decoded, samples, "level {level} full {full_table}");
            }
        }
    }

    #[test]
    fn round_trip_extreme_values() {
        let samples = vec![i32::MAX, i32::MIN, 0, -1, 1, i32::MAX - 1, i32::MIN + 1, 127, -127, -128];
        let encoded = encode(&samples, 1, None, false).unwrap();
        let decoded = decode(&encoded.model, &encoded.payload, samples.len()).unwrap();
        assert_eq!(decoded, samples);
    }

    #[test]
    fn round_trip_single_sample() {
        let samples = vec![42_000_000];
        let encoded = encode(&samples, 1, None, false).unwrap();
        let decoded = decode(&encoded.model, &encoded.payload, 1).unwrap();
        assert_eq!(decoded, samples);
    }

    #[test]
    fn round_trip_constant_block() {
        let samples = vec![-500; 2048];
        let encoded = encode(&samples, 1, None, false).unwrap();
        let decoded = decode(&encoded.model, &encoded.payload, samples.len()).unwrap();
        assert_eq!(decoded, samples);
        // One derivative of a constant block is almost all zeros; the
        // coded stream should collapse to a handful of bytes.
        assert!(encoded.payload.len() < 64);
    }

    #[test]
    fn overflow_width_selection() {
        assert_eq!(choose_overflow_bytes(&[0, 100, -100]), 2);
        assert_eq!(choose_overflow_bytes(&[300]), 2);
        assert_eq!(choose_overflow_bytes(&[40_000]), 3);
        assert_eq!(choose_overflow_bytes(&[9_000_000]), 4);
        assert_eq!(choose_overflow_bytes(&[300, 9_000_000]), 4);
    }

    #[test]
    fn smooth_signal_compresses() {
        let samples = sine_samples(8000, 3_000.0);
        let encoded = encode(&samples, 2, None, false).unwrap();
        let total = encoded.model.len() + encoded.payload.len();
        assert!(
            total < samples.len() * 2,
            "expected < 2 bytes/sample, got {total} for {} samples",
            samples.len()
        );
    }

    #[test]
    fn corrupt_statistics_table_is_rejected() {
        let samples = sine_samples(256, 1000.0);
        let mut encoded = encode(&samples, 1, None, false).unwrap();
        // Perturb a stored count: the sum check must fire.
        let idx = MODEL_FIXED_BYTES + 2;
        encoded.model[idx] = encoded.model[idx].wrapping_add(1);
        assert!(decode(&encoded.model, &encoded.payload, samples.len()).is_err());
    }
}
