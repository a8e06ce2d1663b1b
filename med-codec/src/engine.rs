//! The block compression engine: directives, parameters, and the
//! encode/decode paths over one block.
//!
//! Encode order: detrend, amplitude scale, frequency scale, derivative +
//! entropy coding (with fall-through to MBE when the nominal encoding
//! expands), region assembly, encryption, CRC. Decode inverts the chain,
//! validating the CRC before decryption and decryption before parsing
//! the encrypted header fields.

use med_core::aes;
use med_core::crc::{CrcMode, crc};
use med_core::error::{MedError, Result};
use med_core::password::ExpandedKey;
use tracing::debug;

use crate::block::{
    Algorithm, BLOCK_CRC_START_OFFSET, BLOCK_ENCRYPTION_START_OFFSET, BLOCK_FIXED_HEADER_BYTES,
    BLOCK_START_UID, BlockFlags, BlockHeader, BlockParameters, MIN_ENCRYPTED_HEADER_BYTES,
    align4,
};
use crate::interp::spline_at;
use crate::vds::mean_residual_ratio;
use crate::{deriv, mbe, pred, red, vds};

/// Derivative-level policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivativeChoice {
    Fixed(u8),
    /// Try all four levels, keep the smallest encoding.
    Find,
}

impl Default for DerivativeChoice {
    fn default() -> Self {
        DerivativeChoice::Fixed(deriv::DEFAULT_DERIVATIVE_LEVEL)
    }
}

/// Keysample escape-width policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowChoice {
    Fixed(u8),
    /// Determine per block.
    #[default]
    Find,
}

/// Amplitude-scale policy; `Find` runs the lossy goal loop.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ScaleChoice {
    #[default]
    None,
    Fixed(f32),
    Find,
}

/// Behavior of the compression engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CodecDirectives {
    pub algorithm: Algorithm,
    /// Encryption level of time-series data blocks (0 = none).
    pub encryption_level: i8,
    /// Emit MBE when the nominal encoding would be larger.
    pub fall_through_to_best_encoding: bool,
    pub reset_discontinuity: bool,
    /// Omit zero-count bins even in the classic-table encodings.
    pub no_zero_counts: bool,
    pub derivative: DerivativeChoice,
    pub overflow: OverflowChoice,
    pub convert_to_native_units: bool,
    pub detrend_data: bool,
    pub amplitude_scale: ScaleChoice,
    /// Integer decimation factor; reconstruction upsamples by spline.
    pub frequency_scale: Option<u32>,
    /// Tune lossy scaling against the mean-residual ratio rather than
    /// the compression ratio.
    pub use_mean_residual_ratio: bool,
}

impl Default for CodecDirectives {
    fn default() -> Self {
        CodecDirectives {
            algorithm: Algorithm::Pred2,
            encryption_level: 0,
            fall_through_to_best_encoding: true,
            reset_discontinuity: true,
            no_zero_counts: false,
            derivative: DerivativeChoice::default(),
            overflow: OverflowChoice::default(),
            convert_to_native_units: true,
            detrend_data: false,
            amplitude_scale: ScaleChoice::default(),
            frequency_scale: None,
            use_mean_residual_ratio: true,
        }
    }
}

/// Numeric knobs of the engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CodecParameters {
    pub goal_ratio: f64,
    pub goal_tolerance: f64,
    pub maximum_goal_attempts: u32,
    /// 0.0 encodes VDS losslessly.
    pub vds_threshold: f64,
    pub amplitude_units_conversion_factor: f64,
}

impl Default for CodecParameters {
    fn default() -> Self {
        CodecParameters {
            goal_ratio: 0.05,
            goal_tolerance: 0.005,
            maximum_goal_attempts: 20,
            vds_threshold: vds::DEFAULT_THRESHOLD,
            amplitude_units_conversion_factor: 1.0,
        }
    }
}

/// Per-block inputs that are not sample data.
#[derive(Debug, Clone, Default)]
pub struct BlockMeta {
    pub start_time: i64,
    pub acquisition_channel_number: i32,
    pub discontinuity: bool,
    /// Opaque block records, passed through unchanged.
    pub records: Vec<u8>,
    pub number_of_records: u16,
}

/// A decoded block.
#[derive(Debug, Clone)]
pub struct DecodedBlock {
    pub header: BlockHeader,
    pub samples: Vec<i32>,
    pub parameters: BlockParameters,
    pub discontinuity: bool,
    pub lossy: bool,
}

impl DecodedBlock {
    /// Samples in native units per the metadata conversion factor.
    pub fn to_native_units(&self, factor: f64) -> Vec<f64> {
        let factor = if factor == 0.0 { 1.0 } else { factor };
        self.samples.iter().map(|&v| f64::from(v) * factor).collect()
    }
}

/// One engine per stream of blocks; scratch state is reused across
/// blocks.
#[derive(Debug, Clone, Default)]
pub struct CodecEngine {
    pub directives: CodecDirectives,
    pub parameters: CodecParameters,
    pub crc_mode: CrcMode,
    /// Ratio achieved by the most recent lossy encode.
    pub actual_ratio: Option<f64>,
    keys: [Option<Box<ExpandedKey>>; 2],
}

impl CodecEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_directives(directives: CodecDirectives) -> Self {
        CodecEngine {
            directives,
            ..Self::default()
        }
    }

    /// Install the expanded key for an encryption level (1 or 2).
    pub fn set_key(&mut self, level: i8, key: ExpandedKey) -> Result<()> {
        match level {
            1 | 2 => {
                self.keys[(level - 1) as usize] = Some(Box::new(key));
                Ok(())
            }
            _ => Err(MedError::parameter(format!("bad encryption level {level}"))),
        }
    }

    fn key_for(&self, level: i8) -> Result<&ExpandedKey> {
        match level {
            1 | 2 => self.keys[(level - 1) as usize]
                .as_deref()
                .ok_or_else(|| MedError::BadPassword { hint: None }),
            _ => Err(MedError::parameter(format!("bad encryption level {level}"))),
        }
    }

    fn derivative_level(&self, samples: &[i32]) -> u8 {
        match self.directives.derivative {
            DerivativeChoice::Fixed(level) => level.min(deriv::MAX_DERIVATIVE_LEVEL),
            DerivativeChoice::Find => deriv::find_level(samples, 4),
        }
    }

    fn overflow_choice(&self) -> Option<u8> {
        match self.directives.overflow {
            OverflowChoice::Fixed(width) => Some(width),
            OverflowChoice::Find => None,
        }
    }

    // Entropy-code one prepared stream, applying the fall-through rule.
    fn encode_inner(
        &self,
        work: &[i32],
        algorithm: Algorithm,
    ) -> Result<(Algorithm, Vec<u8>, Vec<u8>)> {
        let level = self.derivative_level(work);
        let full_table = matches!(algorithm, Algorithm::Red1 | Algorithm::Pred1)
            && !self.directives.no_zero_counts;
        let (model, payload) = match algorithm {
            Algorithm::Red1 | Algorithm::Red2 => {
                let e = red::encode(work, level, self.overflow_choice(), full_table)?;
                (e.model, e.payload)
            }
            Algorithm::Pred1 | Algorithm::Pred2 => {
                let e = pred::encode(work, level, self.overflow_choice(), full_table)?;
                (e.model, e.payload)
            }
            Algorithm::Mbe => {
                let e = mbe::encode(work, level)?;
                (e.model, e.payload)
            }
            Algorithm::Vds => {
                let e = vds::encode(
                    work,
                    self.parameters.vds_threshold,
                    Algorithm::Red2,
                    Algorithm::Red2,
                )?;
                (e.model, e.payload)
            }
        };

        if self.directives.fall_through_to_best_encoding
            && !matches!(algorithm, Algorithm::Mbe | Algorithm::Vds)
        {
            let mut differenced = work.to_vec();
            deriv::differentiate(&mut differenced, level);
            if mbe::encoded_size(&differenced) < model.len() + payload.len() {
                let e = mbe::encode(work, level)?;
                debug!(nominal = ?algorithm, "fell through to MBE");
                return Ok((Algorithm::Mbe, e.model, e.payload));
            }
        }
        Ok((algorithm, model, payload))
    }

    // Quantize by the amplitude scale.
    fn scale_samples(samples: &[i32], scale: f32) -> Vec<i32> {
        let s = f64::from(scale);
        samples
            .iter()
            .map(|&v| (f64::from(v) / s).round() as i32)
            .collect()
    }

    fn unscale_samples(samples: &[i32], scale: f32) -> Vec<i32> {
        let s = f64::from(scale);
        samples
            .iter()
            .map(|&v| {
                (f64::from(v) * s)
                    .round()
                    .clamp(f64::from(i32::MIN), f64::from(i32::MAX)) as i32
            })
            .collect()
    }

    // Reconstruction the decoder will produce for a given scale, used by
    // the goal loop without running the entropy coder for lossless
    // algorithms.
    fn lossy_reconstruction(&self, work: &[i32], scale: f32) -> Result<Vec<i32>> {
        let scaled = Self::scale_samples(work, scale);
        if self.directives.algorithm == Algorithm::Vds {
            let e = vds::encode(
                &scaled,
                self.parameters.vds_threshold,
                Algorithm::Red2,
                Algorithm::Red2,
            )?;
            let decoded = vds::decode(&e.model, &e.payload, scaled.len())?;
            Ok(Self::unscale_samples(&decoded, scale))
        } else {
            Ok(Self::unscale_samples(&scaled, scale))
        }
    }

    // The lossy goal loop: choose an amplitude scale whose reconstruction
    // meets the goal ratio within tolerance.
    fn find_amplitude_scale(&mut self, work: &[i32]) -> Result<f32> {
        let goal = self.parameters.goal_ratio;
        let tolerance = self.parameters.goal_tolerance;
        let mean: f64 = work.iter().map(|&v| f64::from(v)).sum::<f64>() / work.len() as f64;
        let deviation: f64 = work
            .iter()
            .map(|&v| (f64::from(v) - mean).abs())
            .sum::<f64>()
            / work.len() as f64;
        // Quantization by s leaves a mean residual near s/4.
        let mut scale = ((4.0 * goal * deviation).max(1.0)) as f32;
        let mut best = (scale, f64::INFINITY);
        for attempt in 0..self.parameters.maximum_goal_attempts {
            let recon = self.lossy_reconstruction(work, scale)?;
            let ratio = mean_residual_ratio(work, &recon);
            if (ratio - goal).abs() < (best.1 - goal).abs() {
                best = (scale, ratio);
            }
            if ratio <= goal + tolerance && (ratio >= goal - tolerance || scale <= 1.0) {
                self.actual_ratio = Some(ratio);
                return Ok(scale);
            }
            debug!(attempt, scale, ratio, "lossy goal iteration");
            if ratio <= 0.0 {
                scale *= 2.0;
            } else {
                scale = (f64::from(scale) * (goal / ratio)).clamp(1.0, 1e12) as f32;
            }
        }
        self.actual_ratio = Some(best.1);
        Ok(best.0)
    }

    /// Encode one block.
    pub fn encode_block(&mut self, samples: &[i32], meta: &BlockMeta) -> Result<Vec<u8>> {
        if samples.is_empty() {
            return Err(MedError::encode("a block must contain samples"));
        }
        let mut parameters = BlockParameters::default();
        let mut work = samples.to_vec();

        if self.directives.detrend_data {
            let (intercept, gradient) = linear_fit(&work);
            for (i, v) in work.iter_mut().enumerate() {
                let trend = (f64::from(intercept) + f64::from(gradient) * i as f64).round();
                *v = (f64::from(*v) - trend) as i32;
            }
            parameters.intercept = Some(intercept);
            parameters.gradient = Some(gradient);
        }

        match self.directives.amplitude_scale {
            ScaleChoice::None => {}
            ScaleChoice::Fixed(scale) if scale > 1.0 => {
                work = Self::scale_samples(&work, scale);
                parameters.amplitude_scale = Some(scale);
            }
            ScaleChoice::Fixed(_) => {}
            ScaleChoice::Find => {
                let scale = self.find_amplitude_scale(&work)?;
                if scale > 1.0 {
                    work = Self::scale_samples(&work, scale);
                    parameters.amplitude_scale = Some(scale);
                }
            }
        }

        if let Some(factor) = self.directives.frequency_scale {
            if factor > 1 {
                work = work.iter().copied().step_by(factor as usize).collect();
                parameters.frequency_scale = Some(factor as f32);
            }
        }

        let (algorithm, model, payload) = self.encode_inner(&work, self.directives.algorithm)?;

        // Region assembly.
        let record_region = align4(meta.records.len());
        let parameter_region = align4(parameters.region_bytes());
        let model_region = align4(model.len());
        let mut discretionary_region = 0usize;
        let mut total_header = BLOCK_FIXED_HEADER_BYTES
            + record_region
            + parameter_region
            + model_region;
        if self.directives.encryption_level > 0
            && (total_header as u32) < MIN_ENCRYPTED_HEADER_BYTES
        {
            discretionary_region = MIN_ENCRYPTED_HEADER_BYTES as usize - total_header;
            total_header += discretionary_region;
        }
        let total_block = total_header + payload.len();

        let mut flags = BlockFlags(algorithm.flag_bit());
        if meta.discontinuity {
            flags.set(BlockFlags::DISCONTINUITY);
        }
        match self.directives.encryption_level {
            1 => flags.set(BlockFlags::LEVEL_1_ENCRYPTION),
            2 => flags.set(BlockFlags::LEVEL_2_ENCRYPTION),
            _ => {}
        }

        let header = BlockHeader {
            block_start_uid: BLOCK_START_UID,
            block_crc: med_core::crc::CRC_NO_ENTRY,
            block_flags: flags,
            start_time: meta.start_time,
            acquisition_channel_number: meta.acquisition_channel_number,
            total_block_bytes: total_block as u32,
            number_of_samples: samples.len() as u32,
            number_of_records: meta.number_of_records,
            record_region_bytes: record_region as u16,
            parameter_flags: parameters.flags(),
            parameter_region_bytes: parameter_region as u16,
            protected_region_bytes: 0,
            discretionary_region_bytes: discretionary_region as u16,
            model_region_bytes: model_region as u16,
            total_header_bytes: total_header as u32,
        };

        let mut block = vec![0u8; total_block];
        header.write_to(&mut block);
        let mut cursor = BLOCK_FIXED_HEADER_BYTES;
        block[cursor..cursor + meta.records.len()].copy_from_slice(&meta.records);
        cursor += record_region;
        let mut param_bytes = Vec::with_capacity(parameter_region);
        parameters.write_to(&mut param_bytes);
        block[cursor..cursor + param_bytes.len()].copy_from_slice(&param_bytes);
        cursor += parameter_region;
        cursor += discretionary_region;
        block[cursor..cursor + model.len()].copy_from_slice(&model);
        block[total_header..].copy_from_slice(&payload);

        if self.directives.encryption_level > 0 {
            let key = self.key_for(self.directives.encryption_level)?;
            aes::encrypt(&mut block[BLOCK_ENCRYPTION_START_OFFSET..total_header], key);
            aes::encrypt(&mut block[total_header..], key);
        }

        if self.crc_mode.calculate_on_output {
            let block_crc = crc(&block[BLOCK_CRC_START_OFFSET..]);
            block[8..12].copy_from_slice(&block_crc.to_le_bytes());
        }
        Ok(block)
    }

    /// Decode one block. On a CRC mismatch the reported offset is
    /// relative to the block start; the caller rebases it onto the file.
    pub fn decode_block(&mut self, block: &[u8]) -> Result<DecodedBlock> {
        if block.len() < BLOCK_FIXED_HEADER_BYTES {
            return Err(MedError::decode("short block"));
        }
        // Plaintext prefix only: UID, CRC, flags, times, extent.
        let flags = BlockFlags(u32::from_le_bytes(block[12..16].try_into().unwrap()));
        let total_block =
            u32::from_le_bytes(block[28..32].try_into().unwrap()) as usize;
        if u64::from_le_bytes(block[0..8].try_into().unwrap()) != BLOCK_START_UID {
            return Err(MedError::decode("bad block start UID"));
        }
        if total_block > block.len() {
            return Err(MedError::decode("declared block length exceeds buffer"));
        }

        if self.crc_mode.validate_on_input {
            let stored = u32::from_le_bytes(block[8..12].try_into().unwrap());
            let computed = crc(&block[BLOCK_CRC_START_OFFSET..total_block]);
            if stored != computed {
                return Err(MedError::CrcMismatch {
                    path: Default::default(),
                    offset: 0,
                });
            }
        }

        let mut owned = block[..total_block].to_vec();
        let encryption_level = flags.encryption_level();
        if encryption_level > 0 {
            if total_block < MIN_ENCRYPTED_HEADER_BYTES as usize {
                return Err(MedError::decode("encrypted block shorter than its header"));
            }
            let key = self.key_for(encryption_level)?;
            // The leading two cipher blocks expose the header length.
            for chunk in [32usize, 48] {
                let window: &mut [u8; 16] =
                    (&mut owned[chunk..chunk + 16]).try_into().unwrap();
                aes::decrypt_block(window, key);
            }
            let total_header =
                u32::from_le_bytes(owned[52..56].try_into().unwrap()) as usize;
            if total_header < 64 || total_header > total_block {
                return Err(MedError::decode("bad encrypted header length"));
            }
            if total_header > 64 {
                aes::decrypt(&mut owned[64..total_header], key);
            }
            aes::decrypt(&mut owned[total_header..], key);
        }

        let header = BlockHeader::from_bytes(&owned)?;
        header.validate_layout()?;

        let parameters = BlockParameters::from_bytes(
            header.parameter_flags,
            &owned[header.parameter_region_offset()..],
        )?;
        let model = &owned
            [header.model_region_offset()..header.model_region_offset() + header.model_region_bytes as usize];
        let payload = &owned[header.payload_range()];

        let n = header.number_of_samples as usize;
        let encoded_n = match parameters.frequency_scale {
            Some(factor) if factor > 1.0 => n.div_ceil(factor as usize),
            _ => n,
        };

        let algorithm = header.block_flags.algorithm()?;
        let mut samples = match algorithm {
            Algorithm::Red1 | Algorithm::Red2 => red::decode(model, payload, encoded_n)?,
            Algorithm::Pred1 | Algorithm::Pred2 => pred::decode(model, payload, encoded_n)?,
            Algorithm::Mbe => mbe::decode(model, payload, encoded_n)?,
            Algorithm::Vds => vds::decode(model, payload, encoded_n)?,
        };
        let mut lossy = false;

        if let Some(factor) = parameters.frequency_scale {
            if factor > 1.0 {
                samples = upsample_decimated(&samples, factor as usize, n)?;
                lossy = true;
            }
        }
        if let Some(scale) = parameters.amplitude_scale {
            if scale > 1.0 {
                samples = Self::unscale_samples(&samples, scale);
                lossy = true;
            }
        }
        if let (Some(intercept), Some(gradient)) = (parameters.intercept, parameters.gradient) {
            for (i, v) in samples.iter_mut().enumerate() {
                let trend = (f64::from(intercept) + f64::from(gradient) * i as f64).round();
                *v = (f64::from(*v) + trend)
                    .clamp(f64::from(i32::MIN), f64::from(i32::MAX)) as i32;
            }
        }
        if algorithm == Algorithm::Vds && self.parameters.vds_threshold > 0.0 {
            lossy = true;
        }

        Ok(DecodedBlock {
            discontinuity: header.block_flags.discontinuity(),
            header,
            samples,
            parameters,
            lossy,
        })
    }
}

// Least-squares line through the samples.
fn linear_fit(samples: &[i32]) -> (i32, f32) {
    let n = samples.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y: f64 = samples.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
    let mut num = 0.0;
    let mut den = 0.0;
    for (i, &v) in samples.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (f64::from(v) - mean_y);
        den += dx * dx;
    }
    let gradient = if den == 0.0 { 0.0 } else { num / den };
    let intercept = mean_y - gradient * mean_x;
    (intercept.round() as i32, gradient as f32)
}

// Rebuild a decimated stream at full length by spline through the kept
// sample positions.
fn upsample_decimated(samples: &[i32], factor: usize, n: usize) -> Result<Vec<i32>> {
    let x: Vec<f64> = (0..samples.len()).map(|i| (i * factor) as f64).collect();
    let y: Vec<f64> = samples.iter().map(|&v| f64::from(v)).collect();
    // Queries past the last kept sample clamp to it.
    let last = *x.last().unwrap_or(&0.0);
    let xi: Vec<f64> = (0..n).map(|i| (i as f64).min(last)).collect();
    let out = spline_at(&x, &y, &xi)?;
    Ok(out
        .iter()
        .map(|&v| v.round().clamp(f64::from(i32::MIN), f64::from(i32::MAX)) as i32)
        .collect())
}
