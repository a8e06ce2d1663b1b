//! The compressed-block fixed header and its variable regions.
//!
//! Layout of one block, all regions 4-byte aligned:
//!
//! ```text
//! 0    fixed header (56 bytes)
//! 56   records region        (record_region_bytes)
//!      parameter region      (parameter_region_bytes)
//!      protected region      (protected_region_bytes)
//!      discretionary region  (discretionary_region_bytes)
//!      model region          (model_region_bytes)
//!      payload               (total_block_bytes - total_header_bytes)
//! ```
//!
//! The block CRC covers bytes 12..`total_block_bytes`. Encryption, when a
//! level flag is set, covers bytes 32..`total_header_bytes`; the encoder
//! keeps `total_header_bytes` at 80 or more for encrypted blocks so the
//! header-length field always lies inside the two leading cipher blocks.

use byteorder::{ByteOrder, LittleEndian};
use med_core::error::{MedError, Result};

pub const BLOCK_FIXED_HEADER_BYTES: usize = 56;
pub const BLOCK_START_UID: u64 = 0x0123_4567_89AB_CDEF;
/// The block CRC starts at the flags field.
pub const BLOCK_CRC_START_OFFSET: usize = 12;
/// Encryption starts at the `number_of_samples` field.
pub const BLOCK_ENCRYPTION_START_OFFSET: usize = 32;
/// Minimum header length for encrypted blocks (see module docs).
pub const MIN_ENCRYPTED_HEADER_BYTES: u32 = 80;

/// Block flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockFlags(pub u32);

impl BlockFlags {
    pub const DISCONTINUITY: u32 = 1;
    pub const LEVEL_1_ENCRYPTION: u32 = 1 << 4;
    pub const LEVEL_2_ENCRYPTION: u32 = 1 << 5;
    pub const RED1_ENCODING: u32 = 1 << 8;
    pub const PRED1_ENCODING: u32 = 1 << 9;
    pub const MBE_ENCODING: u32 = 1 << 10;
    pub const VDS_ENCODING: u32 = 1 << 11;
    pub const RED2_ENCODING: u32 = 1 << 12;
    pub const PRED2_ENCODING: u32 = 1 << 13;

    pub const ALGORITHM_MASK: u32 = Self::RED1_ENCODING
        | Self::PRED1_ENCODING
        | Self::MBE_ENCODING
        | Self::VDS_ENCODING
        | Self::RED2_ENCODING
        | Self::PRED2_ENCODING;
    pub const ENCRYPTION_MASK: u32 = Self::LEVEL_1_ENCRYPTION | Self::LEVEL_2_ENCRYPTION;

    pub fn discontinuity(self) -> bool {
        self.0 & Self::DISCONTINUITY != 0
    }

    pub fn encryption_level(self) -> i8 {
        if self.0 & Self::LEVEL_2_ENCRYPTION != 0 {
            2
        } else if self.0 & Self::LEVEL_1_ENCRYPTION != 0 {
            1
        } else {
            0
        }
    }

    pub fn algorithm(self) -> Result<Algorithm> {
        Algorithm::from_flags(self.0)
    }

    pub fn set(&mut self, bit: u32) {
        self.0 |= bit;
    }
}

/// The six block encodings, mutually exclusive in the flags word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Red1,
    Pred1,
    Mbe,
    Vds,
    Red2,
    Pred2,
}

impl Algorithm {
    pub fn flag_bit(self) -> u32 {
        match self {
            Algorithm::Red1 => BlockFlags::RED1_ENCODING,
            Algorithm::Pred1 => BlockFlags::PRED1_ENCODING,
            Algorithm::Mbe => BlockFlags::MBE_ENCODING,
            Algorithm::Vds => BlockFlags::VDS_ENCODING,
            Algorithm::Red2 => BlockFlags::RED2_ENCODING,
            Algorithm::Pred2 => BlockFlags::PRED2_ENCODING,
        }
    }

    pub fn from_flags(flags: u32) -> Result<Self> {
        match flags & BlockFlags::ALGORITHM_MASK {
            BlockFlags::RED1_ENCODING => Ok(Algorithm::Red1),
            BlockFlags::PRED1_ENCODING => Ok(Algorithm::Pred1),
            BlockFlags::MBE_ENCODING => Ok(Algorithm::Mbe),
            BlockFlags::VDS_ENCODING => Ok(Algorithm::Vds),
            BlockFlags::RED2_ENCODING => Ok(Algorithm::Red2),
            BlockFlags::PRED2_ENCODING => Ok(Algorithm::Pred2),
            other => Err(MedError::decode(format!(
                "block flags {other:#x} do not select exactly one encoding"
            ))),
        }
    }
}

/// The 56-byte fixed block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub block_start_uid: u64,
    pub block_crc: u32,
    pub block_flags: BlockFlags,
    pub start_time: i64,
    pub acquisition_channel_number: i32,
    pub total_block_bytes: u32,
    pub number_of_samples: u32,
    pub number_of_records: u16,
    pub record_region_bytes: u16,
    pub parameter_flags: u32,
    pub parameter_region_bytes: u16,
    pub protected_region_bytes: u16,
    pub discretionary_region_bytes: u16,
    pub model_region_bytes: u16,
    pub total_header_bytes: u32,
}

impl BlockHeader {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < BLOCK_FIXED_HEADER_BYTES {
            return Err(MedError::decode("short block header"));
        }
        let header = BlockHeader {
            block_start_uid: LittleEndian::read_u64(&bytes[0..]),
            block_crc: LittleEndian::read_u32(&bytes[8..]),
            block_flags: BlockFlags(LittleEndian::read_u32(&bytes[12..])),
            start_time: LittleEndian::read_i64(&bytes[16..]),
            acquisition_channel_number: LittleEndian::read_i32(&bytes[24..]),
            total_block_bytes: LittleEndian::read_u32(&bytes[28..]),
            number_of_samples: LittleEndian::read_u32(&bytes[32..]),
            number_of_records: LittleEndian::read_u16(&bytes[36..]),
            record_region_bytes: LittleEndian::read_u16(&bytes[38..]),
            parameter_flags: LittleEndian::read_u32(&bytes[40..]),
            parameter_region_bytes: LittleEndian::read_u16(&bytes[44..]),
            protected_region_bytes: LittleEndian::read_u16(&bytes[46..]),
            discretionary_region_bytes: LittleEndian::read_u16(&bytes[48..]),
            model_region_bytes: LittleEndian::read_u16(&bytes[50..]),
            total_header_bytes: LittleEndian::read_u32(&bytes[52..]),
        };
        if header.block_start_uid != BLOCK_START_UID {
            return Err(MedError::decode(format!(
                "bad block start UID {:#018x}",
                header.block_start_uid
            )));
        }
        Ok(header)
    }

    pub fn write_to(&self, bytes: &mut [u8]) {
        LittleEndian::write_u64(&mut bytes[0..], self.block_start_uid);
        LittleEndian::write_u32(&mut bytes[8..], self.block_crc);
        LittleEndian::write_u32(&mut bytes[12..], self.block_flags.0);
        LittleEndian::write_i64(&mut bytes[16..], self.start_time);
        LittleEndian::write_i32(&mut bytes[24..], self.acquisition_channel_number);
        LittleEndian::write_u32(&mut bytes[28..], self.total_block_bytes);
        LittleEndian::write_u32(&mut bytes[32..], self.number_of_samples);
        LittleEndian::write_u16(&mut bytes[36..], self.number_of_records);
        LittleEndian::write_u16(&mut bytes[38..], self.record_region_bytes);
        LittleEndian::write_u32(&mut bytes[40..], self.parameter_flags);
        LittleEndian::write_u16(&mut bytes[44..], self.parameter_region_bytes);
        LittleEndian::write_u16(&mut bytes[46..], self.protected_region_bytes);
        LittleEndian::write_u16(&mut bytes[48..], self.discretionary_region_bytes);
        LittleEndian::write_u16(&mut bytes[50..], self.model_region_bytes);
        LittleEndian::write_u32(&mut bytes[52..], self.total_header_bytes);
    }

    /// Offset of the model region within the block.
    pub fn model_region_offset(&self) -> usize {
        BLOCK_FIXED_HEADER_BYTES
            + self.record_region_bytes as usize
            + self.parameter_region_bytes as usize
            + self.protected_region_bytes as usize
            + self.discretionary_region_bytes as usize
    }

    /// Offset of the parameter region within the block.
    pub fn parameter_region_offset(&self) -> usize {
        BLOCK_FIXED_HEADER_BYTES + self.record_region_bytes as usize
    }

    pub fn payload_range(&self) -> std::ops::Range<usize> {
        self.total_header_bytes as usize..self.total_block_bytes as usize
    }

    /// Check the region arithmetic declared by the header.
    pub fn validate_layout(&self) -> Result<()> {
        if self.number_of_samples == 0 {
            return Err(MedError::decode("block declares zero samples"));
        }
        let expected = self.model_region_offset() + self.model_region_bytes as usize;
        if expected != self.total_header_bytes as usize {
            return Err(MedError::decode(format!(
                "block header regions sum to {expected} but total_header_bytes is {}",
                self.total_header_bytes
            )));
        }
        if self.total_header_bytes > self.total_block_bytes {
            return Err(MedError::decode("block header longer than block"));
        }
        Ok(())
    }
}

/// Decoded parameter region: a packed `u32` per set bit of
/// `parameter_flags`, in ascending bit order.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BlockParameters {
    pub intercept: Option<i32>,
    pub gradient: Option<f32>,
    pub amplitude_scale: Option<f32>,
    pub frequency_scale: Option<f32>,
    pub noise_scores: Option<[u8; 4]>,
}

impl BlockParameters {
    pub const INTERCEPT: u32 = 1;
    pub const GRADIENT: u32 = 1 << 1;
    pub const AMPLITUDE_SCALE: u32 = 1 << 2;
    pub const FREQUENCY_SCALE: u32 = 1 << 3;
    pub const NOISE_SCORES: u32 = 1 << 4;

    pub fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.intercept.is_some() {
            flags |= Self::INTERCEPT;
        }
        if self.gradient.is_some() {
            flags |= Self::GRADIENT;
        }
        if self.amplitude_scale.is_some() {
            flags |= Self::AMPLITUDE_SCALE;
        }
        if self.frequency_scale.is_some() {
            flags |= Self::FREQUENCY_SCALE;
        }
        if self.noise_scores.is_some() {
            flags |= Self::NOISE_SCORES;
        }
        flags
    }

    pub fn region_bytes(&self) -> usize {
        4 * self.flags().count_ones() as usize
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        let mut word = [0u8; 4];
        if let Some(v) = self.intercept {
            LittleEndian::write_i32(&mut word, v);
            out.extend_from_slice(&word);
        }
        if let Some(v) = self.gradient {
            LittleEndian::write_f32(&mut word, v);
            out.extend_from_slice(&word);
        }
        if let Some(v) = self.amplitude_scale {
            LittleEndian::write_f32(&mut word, v);
            out.extend_from_slice(&word);
        }
        if let Some(v) = self.frequency_scale {
            LittleEndian::write_f32(&mut word, v);
            out.extend_from_slice(&word);
        }
        if let Some(v) = self.noise_scores {
            out.extend_from_slice(&v);
        }
    }

    pub fn from_bytes(flags: u32, bytes: &[u8]) -> Result<Self> {
        let needed = 4 * flags.count_ones() as usize;
        if bytes.len() < needed {
            return Err(MedError::decode("short parameter region"));
        }
        let mut params = BlockParameters::default();
        let mut cursor = 0usize;
        let mut take = || {
            let word = &bytes[cursor..cursor + 4];
            cursor += 4;
            word
        };
        if flags & Self::INTERCEPT != 0 {
            params.intercept = Some(LittleEndian::read_i32(take()));
        }
        if flags & Self::GRADIENT != 0 {
            params.gradient = Some(LittleEndian::read_f32(take()));
        }
        if flags & Self::AMPLITUDE_SCALE != 0 {
            params.amplitude_scale = Some(LittleEndian::read_f32(take()));
        }
        if flags & Self::FREQUENCY_SCALE != 0 {
            params.frequency_scale = Some(LittleEndian::read_f32(take()));
        }
        if flags & Self::NOISE_SCORES != 0 {
            params.noise_scores = Some(take().try_into().unwrap());
        }
        Ok(params)
    }
}

/// Round a region length up to 4-byte alignment.
pub fn align4(len: usize) -> usize {
    (len + 3) & !3
}
