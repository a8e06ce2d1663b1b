//! Record headers, the three 24-byte index strides, and the `Sgmt`
//! record that anchors cross-channel sample-number math.
//!
//! Record bodies are opaque to the core: it dispatches by the 4-byte type
//! code and hands the bytes to whichever decoder registered for that
//! code. `Sgmt` is the one record the core decodes itself.

use byteorder::{ByteOrder, LittleEndian};

use crate::crc::crc;
use crate::error::{MedError, Result};
use crate::types::{self, SGMT_TYPE_CODE, Uid};

pub const RECORD_HEADER_BYTES: usize = 24;
pub const INDEX_BYTES: usize = 24;
/// Record CRCs start at the `total_record_bytes` field.
pub const RECORD_CRC_START_OFFSET: usize = 4;

/// The 24-byte header that begins every record in a record-data file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub record_crc: u32,
    pub total_record_bytes: u32,
    pub start_time: i64,
    pub type_code: u32,
    pub version_major: u8,
    pub version_minor: u8,
    pub encryption_level: i8,
}

impl RecordHeader {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < RECORD_HEADER_BYTES {
            return Err(MedError::decode("short record header"));
        }
        Ok(RecordHeader {
            record_crc: LittleEndian::read_u32(&bytes[0..]),
            total_record_bytes: LittleEndian::read_u32(&bytes[4..]),
            start_time: LittleEndian::read_i64(&bytes[8..]),
            type_code: LittleEndian::read_u32(&bytes[16..]),
            version_major: bytes[21],
            version_minor: bytes[22],
            encryption_level: bytes[23] as i8,
        })
    }

    pub fn write_to(&self, bytes: &mut [u8]) {
        LittleEndian::write_u32(&mut bytes[0..], self.record_crc);
        LittleEndian::write_u32(&mut bytes[4..], self.total_record_bytes);
        LittleEndian::write_i64(&mut bytes[8..], self.start_time);
        LittleEndian::write_u32(&mut bytes[16..], self.type_code);
        bytes[20] = 0; // type string terminal zero
        bytes[21] = self.version_major;
        bytes[22] = self.version_minor;
        bytes[23] = self.encryption_level as u8;
    }

    /// CRC over a complete serialized record (header + body), covering
    /// everything after the CRC field itself.
    pub fn compute_crc(record_bytes: &[u8]) -> u32 {
        crc(&record_bytes[RECORD_CRC_START_OFFSET..])
    }

    pub fn type_string(&self) -> String {
        String::from_utf8_lossy(&self.type_code.to_le_bytes()).into_owned()
    }
}

/// One time-series index entry. On disk the file offset is negated when
/// a discontinuity begins at the block; in memory the two facts are
/// separate fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSeriesIndexEntry {
    pub file_offset: u64,
    pub discontinuity: bool,
    pub start_time: i64,
    pub start_sample_number: i64,
}

impl TimeSeriesIndexEntry {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let raw_offset = LittleEndian::read_i64(&bytes[0..]);
        let (file_offset, discontinuity) = remove_discontinuity(raw_offset);
        TimeSeriesIndexEntry {
            file_offset,
            discontinuity,
            start_time: LittleEndian::read_i64(&bytes[8..]),
            start_sample_number: LittleEndian::read_i64(&bytes[16..]),
        }
    }

    pub fn write_to(&self, bytes: &mut [u8]) {
        LittleEndian::write_i64(&mut bytes[0..], apply_discontinuity(self.file_offset, self.discontinuity));
        LittleEndian::write_i64(&mut bytes[8..], self.start_time);
        LittleEndian::write_i64(&mut bytes[16..], self.start_sample_number);
    }
}

/// Store a file offset with the discontinuity encoding applied.
pub fn apply_discontinuity(offset: u64, discontinuity: bool) -> i64 {
    let signed = offset as i64;
    if discontinuity { -signed } else { signed }
}

/// Recover `(offset, discontinuity)` from the on-disk signed form.
pub fn remove_discontinuity(raw: i64) -> (u64, bool) {
    if raw < 0 {
        ((-raw) as u64, true)
    } else {
        (raw as u64, false)
    }
}

/// One video index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoIndexEntry {
    pub file_offset: u64,
    pub discontinuity: bool,
    pub start_time: i64,
    pub start_frame_number: u32,
    pub video_file_number: u32,
}

impl VideoIndexEntry {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let raw_offset = LittleEndian::read_i64(&bytes[0..]);
        let (file_offset, discontinuity) = remove_discontinuity(raw_offset);
        VideoIndexEntry {
            file_offset,
            discontinuity,
            start_time: LittleEndian::read_i64(&bytes[8..]),
            start_frame_number: LittleEndian::read_u32(&bytes[16..]),
            video_file_number: LittleEndian::read_u32(&bytes[20..]),
        }
    }

    pub fn write_to(&self, bytes: &mut [u8]) {
        LittleEndian::write_i64(&mut bytes[0..], apply_discontinuity(self.file_offset, self.discontinuity));
        LittleEndian::write_i64(&mut bytes[8..], self.start_time);
        LittleEndian::write_u32(&mut bytes[16..], self.start_frame_number);
        LittleEndian::write_u32(&mut bytes[20..], self.video_file_number);
    }
}

/// One record index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordIndexEntry {
    pub file_offset: u64,
    pub start_time: i64,
    pub type_code: u32,
    pub version_major: u8,
    pub version_minor: u8,
    pub encryption_level: i8,
}

impl RecordIndexEntry {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        RecordIndexEntry {
            file_offset: LittleEndian::read_i64(&bytes[0..]) as u64,
            start_time: LittleEndian::read_i64(&bytes[8..]),
            type_code: LittleEndian::read_u32(&bytes[16..]),
            version_major: bytes[21],
            version_minor: bytes[22],
            encryption_level: bytes[23] as i8,
        }
    }

    pub fn write_to(&self, bytes: &mut [u8]) {
        LittleEndian::write_i64(&mut bytes[0..], self.file_offset as i64);
        LittleEndian::write_i64(&mut bytes[8..], self.start_time);
        LittleEndian::write_u32(&mut bytes[16..], self.type_code);
        bytes[20] = 0;
        bytes[21] = self.version_major;
        bytes[22] = self.version_minor;
        bytes[23] = self.encryption_level as u8;
    }
}

/// The `Sgmt` record body (version 1.0, 48 bytes plus an optional
/// description). One exists per segment at the channel level, and at the
/// session level when the session-wide array is maintained.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SgmtRecord {
    pub start_time: i64,
    pub end_time: i64,
    pub start_sample_number: i64,
    pub end_sample_number: i64,
    pub segment_uid: Uid,
    pub segment_number: i32,
    pub acquisition_channel_number: i32,
    pub sampling_frequency: f64,
}

pub const SGMT_RECORD_BYTES: usize = 48;

impl SgmtRecord {
    /// Decode from a record body; `start_time` comes from the record
    /// header.
    pub fn from_body(start_time: i64, body: &[u8]) -> Result<Self> {
        if body.len() < SGMT_RECORD_BYTES {
            return Err(MedError::decode("short Sgmt record body"));
        }
        Ok(SgmtRecord {
            start_time,
            end_time: LittleEndian::read_i64(&body[0..]),
            start_sample_number: LittleEndian::read_i64(&body[8..]),
            end_sample_number: LittleEndian::read_i64(&body[16..]),
            segment_uid: Uid(LittleEndian::read_u64(&body[24..])),
            segment_number: LittleEndian::read_i32(&body[32..]),
            acquisition_channel_number: LittleEndian::read_i32(&body[36..]),
            sampling_frequency: LittleEndian::read_f64(&body[40..]),
        })
    }

    pub fn to_body(&self) -> [u8; SGMT_RECORD_BYTES] {
        let mut body = [0u8; SGMT_RECORD_BYTES];
        LittleEndian::write_i64(&mut body[0..], self.end_time);
        LittleEndian::write_i64(&mut body[8..], self.start_sample_number);
        LittleEndian::write_i64(&mut body[16..], self.end_sample_number);
        LittleEndian::write_u64(&mut body[24..], self.segment_uid.0);
        LittleEndian::write_i32(&mut body[32..], self.segment_number);
        LittleEndian::write_i32(&mut body[36..], self.acquisition_channel_number);
        LittleEndian::write_f64(&mut body[40..], self.sampling_frequency);
        body
    }

    /// Sample count covered by this segment.
    pub fn sample_count(&self) -> i64 {
        if self.start_sample_number == types::SAMPLE_NUMBER_NO_ENTRY
            || self.end_sample_number == types::SAMPLE_NUMBER_NO_ENTRY
        {
            return 0;
        }
        self.end_sample_number - self.start_sample_number + 1
    }

    pub fn type_code() -> u32 {
        SGMT_TYPE_CODE
    }
}

/// The `Stat` record body (version 1.0, 32 bytes): summary statistics
/// for the enclosing span.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatRecord {
    pub minimum: i32,
    pub maximum: i32,
    pub mean: i32,
    pub median: i32,
    pub mode: i32,
    pub variance: f32,
    pub skewness: f32,
    pub kurtosis: f32,
}

pub const STAT_RECORD_BYTES: usize = 32;

impl StatRecord {
    pub fn from_body(body: &[u8]) -> Result<Self> {
        if body.len() < STAT_RECORD_BYTES {
            return Err(MedError::decode("short Stat record body"));
        }
        Ok(StatRecord {
            minimum: LittleEndian::read_i32(&body[0..]),
            maximum: LittleEndian::read_i32(&body[4..]),
            mean: LittleEndian::read_i32(&body[8..]),
            median: LittleEndian::read_i32(&body[12..]),
            mode: LittleEndian::read_i32(&body[16..]),
            variance: LittleEndian::read_f32(&body[20..]),
            skewness: LittleEndian::read_f32(&body[24..]),
            kurtosis: LittleEndian::read_f32(&body[28..]),
        })
    }

    pub fn to_body(&self) -> [u8; STAT_RECORD_BYTES] {
        let mut body = [0u8; STAT_RECORD_BYTES];
        LittleEndian::write_i32(&mut body[0..], self.minimum);
        LittleEndian::write_i32(&mut body[4..], self.maximum);
        LittleEndian::write_i32(&mut body[8..], self.mean);
        LittleEndian::write_i32(&mut body[12..], self.median);
        LittleEndian::write_i32(&mut body[16..], self.mode);
        LittleEndian::write_f32(&mut body[20..], self.variance);
        LittleEndian::write_f32(&mut body[24..], self.skewness);
        LittleEndian::write_f32(&mut body[28..], self.kurtosis);
        body
    }

    pub fn type_code() -> u32 {
        crate::types::record_type_code(b"Stat")
    }
}

/// A nullable include/exclude filter over record type codes. Codes are
/// stored signed: a positive entry includes its type, a negative entry
/// excludes it. A record matching no entry is included unless every
/// entry is positive (a pure include-list).
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    codes: Vec<i64>,
}

impl RecordFilter {
    /// No filtering: every record passes.
    pub fn all() -> Self {
        RecordFilter::default()
    }

    pub fn include(codes: impl IntoIterator<Item = u32>) -> Self {
        RecordFilter {
            codes: codes.into_iter().map(|c| c as i64).collect(),
        }
    }

    pub fn exclude(codes: impl IntoIterator<Item = u32>) -> Self {
        RecordFilter {
            codes: codes.into_iter().map(|c| -(c as i64)).collect(),
        }
    }

    pub fn passes(&self, type_code: u32) -> bool {
        if self.codes.is_empty() {
            return true;
        }
        let mut all_positive = true;
        for &code in &self.codes {
            if code < 0 {
                all_positive = false;
                if (-code) as u32 == type_code {
                    return false;
                }
            } else if code as u32 == type_code {
                return true;
            }
        }
        // No match: a pure include-list excludes, a list with any
        // exclusions includes.
        !all_positive
    }
}
