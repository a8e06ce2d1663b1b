//! VDS — Vectorized Data Stream, the lossy template-extraction codec.
//!
//! The encoder keeps only the samples needed to trace the signal within
//! an amplitude tolerance, then compresses the kept amplitudes and their
//! sample times as two independent sub-streams, each with its own choice
//! of lossless sub-algorithm. Decoding re-expands the template through
//! modified-Akima interpolation. A user threshold of 0.0 keeps every
//! sample and is exactly lossless.
//!
//! The user threshold (0–10) maps to an amplitude tolerance through a
//! 101-entry table built from the shape-3 gamma CDF; the tolerance is
//! expressed in units of the block's robust noise estimate (median
//! absolute successive difference).

use byteorder::{ByteOrder, LittleEndian};
use med_core::error::{MedError, Result};
use once_cell::sync::Lazy;

use crate::block::Algorithm;
use crate::interp::makima_at;
use crate::{mbe, pred, red};

pub const MODEL_FIXED_BYTES: usize = 16;
pub const THRESHOLD_MAP_ENTRIES: usize = 101;
pub const DEFAULT_THRESHOLD: f64 = 5.0;

// VDS model flag bits: amplitude sub-algorithm in bits 0-4, time
// sub-algorithm in bits 5-9, both in RED1/PRED1/MBE/RED2/PRED2 order.
const AMPLITUDE_SHIFT: u32 = 0;
const TIME_SHIFT: u32 = 5;

fn algorithm_bits(algorithm: Algorithm) -> Result<u32> {
    Ok(match algorithm {
        Algorithm::Red1 => 1,
        Algorithm::Pred1 => 1 << 1,
        Algorithm::Mbe => 1 << 2,
        Algorithm::Red2 => 1 << 3,
        Algorithm::Pred2 => 1 << 4,
        Algorithm::Vds => {
            return Err(MedError::encode("VDS cannot nest itself as a sub-algorithm"));
        }
    })
}

fn algorithm_from_bits(bits: u32) -> Result<Algorithm> {
    match bits {
        1 => Ok(Algorithm::Red1),
        2 => Ok(Algorithm::Pred1),
        4 => Ok(Algorithm::Mbe),
        8 => Ok(Algorithm::Red2),
        16 => Ok(Algorithm::Pred2),
        other => Err(MedError::decode(format!(
            "bad VDS sub-algorithm bits {other:#x}"
        ))),
    }
}

/// One threshold-map entry: the user-facing threshold and the amplitude
/// tolerances used with and without low-frequency prefiltering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdMapEntry {
    pub user_threshold: f64,
    pub algorithm_threshold_lfp: f64,
    pub algorithm_threshold_no_filt: f64,
}

// Regularized CDF of the Erlang(3) distribution.
fn gamma3_cdf(x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    1.0 - (-x).exp() * (1.0 + x + x * x / 2.0)
}

pub static THRESHOLD_MAP: Lazy<[ThresholdMapEntry; THRESHOLD_MAP_ENTRIES]> = Lazy::new(|| {
    let mut map = [ThresholdMapEntry {
        user_threshold: 0.0,
        algorithm_threshold_lfp: 0.0,
        algorithm_threshold_no_filt: 0.0,
    }; THRESHOLD_MAP_ENTRIES];
    // Tolerances saturate near 6 noise units at user threshold 10.
    let ceiling = 6.0 / gamma3_cdf(10.0);
    for (i, entry) in map.iter_mut().enumerate() {
        let user = i as f64 / 10.0;
        let no_filt = ceiling * gamma3_cdf(user);
        *entry = ThresholdMapEntry {
            user_threshold: user,
            algorithm_threshold_lfp: no_filt / 2.0,
            algorithm_threshold_no_filt: no_filt,
        };
    }
    map
});

/// Linear lookup of the amplitude tolerance for a user threshold.
pub fn amplitude_tolerance(user_threshold: f64, lfp_filtered: bool) -> f64 {
    let t = user_threshold.clamp(0.0, 10.0);
    let pos = t * 10.0;
    let lo = pos.floor() as usize;
    let hi = (lo + 1).min(THRESHOLD_MAP_ENTRIES - 1);
    let frac = pos - lo as f64;
    let pick = |e: &ThresholdMapEntry| {
        if lfp_filtered {
            e.algorithm_threshold_lfp
        } else {
            e.algorithm_threshold_no_filt
        }
    };
    pick(&THRESHOLD_MAP[lo]) * (1.0 - frac) + pick(&THRESHOLD_MAP[hi]) * frac
}

// Robust per-sample noise estimate: median absolute successive
// difference.
fn noise_estimate(samples: &[i32]) -> f64 {
    if samples.len() < 2 {
        return 1.0;
    }
    let mut diffs: Vec<f64> = samples
        .windows(2)
        .map(|w| (f64::from(w[1]) - f64::from(w[0])).abs())
        .collect();
    diffs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let median = diffs[diffs.len() / 2];
    median.max(1.0)
}

// Greedy template extraction: walk the block keeping the longest linear
// spans whose interior stays within `tolerance` of the chord.
fn extract_template(samples: &[i32], tolerance: f64) -> Vec<u32> {
    let n = samples.len();
    if tolerance <= 0.0 || n <= 2 {
        return (0..n as u32).collect();
    }
    let mut kept = vec![0u32];
    let mut anchor = 0usize;
    let mut candidate = 1usize;
    while candidate < n - 1 {
        // Test the chord anchor -> candidate + 1 over its interior.
        let end = candidate + 1;
        let x0 = anchor as f64;
        let y0 = f64::from(samples[anchor]);
        let slope = (f64::from(samples[end]) - y0) / (end as f64 - x0);
        let fits = (anchor + 1..end).all(|j| {
            let predicted = y0 + slope * (j as f64 - x0);
            (predicted - f64::from(samples[j])).abs() <= tolerance
        });
        if fits {
            candidate = end;
        } else {
            kept.push(candidate as u32);
            anchor = candidate;
            candidate += 1;
        }
    }
    kept.push((n - 1) as u32);
    kept
}

fn encode_sub(algorithm: Algorithm, data: &[i32]) -> Result<(Vec<u8>, Vec<u8>)> {
    let level = crate::deriv::find_level(data, 4);
    Ok(match algorithm {
        Algorithm::Red1 => {
            let e = red::encode(data, level, None, true)?;
            (e.model, e.payload)
        }
        Algorithm::Red2 => {
            let e = red::encode(data, level, None, false)?;
            (e.model, e.payload)
        }
        Algorithm::Pred1 => {
            let e = pred::encode(data, level, None, true)?;
            (e.model, e.payload)
        }
        Algorithm::Pred2 => {
            let e = pred::encode(data, level, None, false)?;
            (e.model, e.payload)
        }
        Algorithm::Mbe => {
            let e = mbe::encode(data, level)?;
            (e.model, e.payload)
        }
        Algorithm::Vds => unreachable!("rejected by algorithm_bits"),
    })
}

fn decode_sub(algorithm: Algorithm, model: &[u8], payload: &[u8], n: usize) -> Result<Vec<i32>> {
    match algorithm {
        Algorithm::Red1 | Algorithm::Red2 => red::decode(model, payload, n),
        Algorithm::Pred1 | Algorithm::Pred2 => pred::decode(model, payload, n),
        Algorithm::Mbe => mbe::decode(model, payload, n),
        Algorithm::Vds => unreachable!("rejected by algorithm_from_bits"),
    }
}

#[derive(Debug, Clone)]
pub struct VdsEncoded {
    pub model: Vec<u8>,
    pub payload: Vec<u8>,
    pub kept_samples: u32,
}

/// Encode a block with VDS at `user_threshold` (0.0 keeps everything).
pub fn encode(
    samples: &[i32],
    user_threshold: f64,
    amplitude_algorithm: Algorithm,
    time_algorithm: Algorithm,
) -> Result<VdsEncoded> {
    if samples.is_empty() {
        return Err(MedError::encode("empty block"));
    }
    let tolerance = amplitude_tolerance(user_threshold, false) * noise_estimate(samples);
    let kept = if user_threshold <= 0.0 {
        (0..samples.len() as u32).collect::<Vec<_>>()
    } else {
        extract_template(samples, tolerance)
    };

    let amplitudes: Vec<i32> = kept.iter().map(|&i| samples[i as usize]).collect();
    let times: Vec<i32> = kept.iter().map(|&i| i as i32).collect();

    let (amp_model, amp_payload) = encode_sub(amplitude_algorithm, &amplitudes)?;
    let (time_model, time_payload) = encode_sub(time_algorithm, &times)?;

    let flags = (algorithm_bits(amplitude_algorithm)? << AMPLITUDE_SHIFT)
        | (algorithm_bits(time_algorithm)? << TIME_SHIFT);

    let mut model = vec![0u8; MODEL_FIXED_BYTES];
    LittleEndian::write_u32(&mut model[0..], kept.len() as u32);
    LittleEndian::write_u32(
        &mut model[4..],
        (amp_model.len() + amp_payload.len()) as u32,
    );
    LittleEndian::write_u16(&mut model[8..], amp_model.len() as u16);
    LittleEndian::write_u16(&mut model[10..], time_model.len() as u16);
    LittleEndian::write_u32(&mut model[12..], flags);

    let mut payload =
        Vec::with_capacity(amp_model.len() + amp_payload.len() + time_model.len() + time_payload.len());
    payload.extend_from_slice(&amp_model);
    payload.extend_from_slice(&amp_payload);
    payload.extend_from_slice(&time_model);
    payload.extend_from_slice(&time_payload);

    Ok(VdsEncoded {
        model,
        payload,
        kept_samples: kept.len() as u32,
    })
}

/// Decode a VDS block back to `number_of_samples` samples.
pub fn decode(model: &[u8], payload: &[u8], number_of_samples: usize) -> Result<Vec<i32>> {
    if model.len() < MODEL_FIXED_BYTES {
        return Err(MedError::decode("short VDS model region"));
    }
    let kept = LittleEndian::read_u32(&model[0..]) as usize;
    let amp_total = LittleEndian::read_u32(&model[4..]) as usize;
    let amp_model_bytes = LittleEndian::read_u16(&model[8..]) as usize;
    let time_model_bytes = LittleEndian::read_u16(&model[10..]) as usize;
    let flags = LittleEndian::read_u32(&model[12..]);

    if kept == 0 || kept > number_of_samples {
        return Err(MedError::decode(format!("bad VDS sample count {kept}")));
    }
    if amp_total > payload.len() || amp_model_bytes > amp_total {
        return Err(MedError::decode("VDS sub-block extents exceed payload"));
    }
    let amplitude_algorithm = algorithm_from_bits((flags >> AMPLITUDE_SHIFT) & 0x1F)?;
    let time_algorithm = algorithm_from_bits((flags >> TIME_SHIFT) & 0x1F)?;

    let (amp_region, time_region) = payload.split_at(amp_total);
    if time_model_bytes > time_region.len() {
        return Err(MedError::decode("VDS time model exceeds payload"));
    }
    let amplitudes = decode_sub(
        amplitude_algorithm,
        &amp_region[..amp_model_bytes],
        &amp_region[amp_model_bytes..],
        kept,
    )?;
    let times = decode_sub(
        time_algorithm,
        &time_region[..time_model_bytes],
        &time_region[time_model_bytes..],
        kept,
    )?;

    if kept == number_of_samples {
        return Ok(amplitudes);
    }

    // Re-expand the template.
    let x: Vec<f64> = times.iter().map(|&t| f64::from(t)).collect();
    let y: Vec<f64> = amplitudes.iter().map(|&a| f64::from(a)).collect();
    let xi: Vec<f64> = (0..number_of_samples).map(|i| i as f64).collect();
    let expanded = makima_at(&x, &y, &xi);
    Ok(expanded
        .iter()
        .map(|&v| v.round().clamp(f64::from(i32::MIN), f64::from(i32::MAX)) as i32)
        .collect())
}

/// Mean absolute residual of a reconstruction, relative to the signal's
/// mean absolute deviation. This is the ratio the lossy goal loop tunes.
pub fn mean_residual_ratio(original: &[i32], reconstructed: &[i32]) -> f64 {
    debug_assert_eq!(original.len(), reconstructed.len());
    if original.is_empty() {
        return 0.0;
    }
    let mean: f64 =
        original.iter().map(|&v| f64::from(v)).sum::<f64>() / original.len() as f64;
    let deviation: f64 = original
        .iter()
        .map(|&v| (f64::from(v) - mean).abs())
        .sum::<f64>()
        / original.len() as f64;
    let residual: f64 = original
        .iter()
        .zip(reconstructed)
        .map(|(&a, &b)| (f64::from(a) - f64::from(b)).abs())
        .sum::<f64>()
        / original.len() as f64;
    if deviation == 0.0 {
        if residual == 0.0 { 0.0 } else { f64::INFINITY }
    } else {
        residual / deviation
    }
}
