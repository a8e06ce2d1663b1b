//! MBE — Minimum-Bit Encoding.
//!
//! Each differenced sample is packed in the fewest bits that span the
//! block's `[min, max]`, with the minimum stored in the model. MBE is
//! also the fall-through target: when RED or PRED would expand a block,
//! the encoder emits MBE instead, whose size is exactly predictable.

use byteorder::{ByteOrder, LittleEndian};
use med_core::error::{MedError, Result};

use crate::deriv;

pub const MODEL_FIXED_BYTES: usize = 8;

#[derive(Debug, Clone)]
pub struct MbeEncoded {
    pub model: Vec<u8>,
    pub payload: Vec<u8>,
    pub derivative_level: u8,
}

fn bits_to_span(min: i32, max: i32) -> u8 {
    let range = i64::from(max) - i64::from(min);
    let bits = 64 - (range as u64).leading_zeros();
    bits.max(1) as u8
}

/// Exact encoded size (model + payload) for a derivative stream, used by
/// the fall-through comparison without materializing the block.
pub fn encoded_size(derivatives: &[i32]) -> usize {
    let min = derivatives.iter().copied().min().unwrap_or(0);
    let max = derivatives.iter().copied().max().unwrap_or(0);
    let bits = bits_to_span(min, max) as usize;
    MODEL_FIXED_BYTES + (derivatives.len() * bits).div_ceil(8)
}

pub fn encode(samples: &[i32], derivative_level: u8) -> Result<MbeEncoded> {
    if samples.is_empty() {
        return Err(MedError::encode("empty block"));
    }
    let mut work = samples.to_vec();
    deriv::differentiate(&mut work, derivative_level);

    let min = *work.iter().min().unwrap();
    let max = *work.iter().max().unwrap();
    let bits = bits_to_span(min, max);

    let mut payload = vec![0u8; (work.len() * bits as usize).div_ceil(8)];
    let mut bit_pos = 0usize;
    for &v in &work {
        let offset = (i64::from(v) - i64::from(min)) as u64;
        for bit in 0..bits as usize {
            if offset & (1 << bit) != 0 {
                payload[(bit_pos + bit) / 8] |= 1 << ((bit_pos + bit) % 8);
            }
        }
        bit_pos += bits as usize;
    }

    let mut model = vec![0u8; MODEL_FIXED_BYTES];
    LittleEndian::write_i32(&mut model[0..], min);
    model[4] = bits;
    model[5] = derivative_level;
    // flags at 6..8 stay zero

    Ok(MbeEncoded {
        model,
        payload,
        derivative_level,
    })
}

pub fn decode(model: &[u8], payload: &[u8], number_of_samples: usize) -> Result<Vec<i32>> {
    if model.len() < MODEL_FIXED_BYTES {
        return Err(MedError::decode("short MBE model region"));
    }
    let min = LittleEndian::read_i32(&model[0..]);
    let bits = model[4] as usize;
    let derivative_level = model[5];
    if bits == 0 || bits > 33 {
        return Err(MedError::decode(format!("bad MBE bit width {bits}")));
    }
    if payload.len() * 8 < number_of_samples * bits {
        return Err(MedError::decode("MBE payload shorter than declared samples"));
    }

    let mut samples = Vec::with_capacity(number_of_samples);
    let mut bit_pos = 0usize;
    for _ in 0..number_of_samples {
        let mut offset = 0u64;
        for bit in 0..bits {
            if payload[(bit_pos + bit) / 8] & (1 << ((bit_pos + bit) % 8)) != 0 {
                offset |= 1 << bit;
            }
        }
        bit_pos += bits;
        samples.push((i64::from(min) + offset as i64) as i32);
    }
    deriv::integrate(&mut samples, derivative_level);
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_levels() {
        let samples: Vec<i32> = (0..2000)
            .map(|i| ((i as f64 * 0.02).sin() * 10_000.0) as i32)
            .collect();
        for level in 0..=3u8 {
            let encoded = encode(&samples, level).unwrap();
            let decoded = decode(&encoded.model, &encoded.payload, samples.len()).unwrap();
            assert_eq!(decoded, samples, "level {level}");
        }
    }

    #[test]
    fn round_trip_extremes() {
        let samples = vec![i32::MIN, i32::MAX, 0, -1, 1];
        let encoded = encode(&samples, 0).unwrap();
        let decoded = decode(&encoded.model, &encoded.payload, samples.len()).unwrap();
        assert_eq!(decoded, samples);
    }

    #[test]
    fn constant_block_is_one_bit_per_sample() {
        let samples = vec![777; 4096];
        let encoded = encode(&samples, 0).unwrap();
        assert_eq!(encoded.payload.len(), 4096 / 8);
    }

    #[test]
    fn encoded_size_is_exact() {
        let samples: Vec<i32> = (0..1500).map(|i| (i % 37) * 11 - 200).collect();
        for level in 0..=3u8 {
            let mut work = samples.clone();
            deriv::differentiate(&mut work, level);
            let predicted = encoded_size(&work);
            let encoded = encode(&samples, level).unwrap();
            assert_eq!(predicted, encoded.model.len() + encoded.payload.len());
        }
    }

    #[test]
    fn wrapping_derivative_range_uses_33_bits_at_most() {
        // min = i32::MIN, max = i32::MAX spans 2^32 - 1 -> 32 bits.
        let samples = vec![0, i32::MAX, i32::MIN];
        let encoded = encode(&samples, 0).unwrap();
        assert!(encoded.model[4] <= 33);
        let decoded = decode(&encoded.model, &encoded.payload, samples.len()).unwrap();
        assert_eq!(decoded, samples);
    }
}
