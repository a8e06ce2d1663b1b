//! Format-wide constants, sentinels, and small value types.
//!
//! Every multi-byte integer in a MED file is little-endian; the constants
//! here are the sentinel values the format reserves inside those fields.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use strum_macros::{Display, EnumString};

/// MED format version written by this library.
pub const MED_VERSION_MAJOR: u8 = 1;
pub const MED_VERSION_MINOR: u8 = 0;
pub const MED_VERSION_NO_ENTRY: u8 = 0xFF;

pub const BIG_ENDIAN: u8 = 0;
pub const LITTLE_ENDIAN: u8 = 1;

/// Value used to fill alignment padding on disk (ASCII `~`).
pub const PAD_BYTE_VALUE: u8 = 0x7E;

/// Segment file numbers are zero-padded to this many digits.
pub const FILE_NUMBERING_DIGITS: usize = 4;

// µUTC sentinels.
pub const UUTC_NO_ENTRY: i64 = i64::MIN;
pub const BEGINNING_OF_TIME: i64 = 0;
pub const END_OF_TIME: i64 = i64::MAX;

// Sample-number sentinels.
pub const SAMPLE_NUMBER_NO_ENTRY: i64 = i64::MIN;
pub const BEGINNING_OF_SAMPLE_NUMBERS: i64 = 0;
pub const END_OF_SAMPLE_NUMBERS: i64 = i64::MAX;

// Frequency sentinels (stored in f64 fields).
pub const FREQUENCY_NO_ENTRY: f64 = -1.0;
/// Stored at the session level when channel sampling frequencies differ.
pub const FREQUENCY_VARIABLE: f64 = -2.0;

pub const SEGMENT_NUMBER_NO_ENTRY: i32 = -1;
pub const CHANNEL_NUMBER_NO_ENTRY: i32 = -1;
pub const CHANNEL_NUMBER_ALL_CHANNELS: i32 = -2;
pub const NUMBER_OF_ENTRIES_NO_ENTRY: i64 = -1;

/// Reserved sample values for 4-byte signed output.
pub mod si4 {
    pub const NAN: i32 = i32::MIN; // 0x8000_0000
    pub const NEG_INF: i32 = i32::MIN + 1; // 0x8000_0001
    pub const POS_INF: i32 = i32::MAX; // 0x7FFF_FFFF
}

/// Reserved sample values for 2-byte signed output.
pub mod si2 {
    pub const NAN: i16 = i16::MIN; // 0x8000
    pub const NEG_INF: i16 = i16::MIN + 1; // 0x8001
    pub const POS_INF: i16 = i16::MAX; // 0x7FFF
}

/// A 64-bit MED unique identifier (session, channel, segment, file, or
/// provenance). Zero means "no entry".
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Uid(pub u64);

impl Uid {
    pub const NO_ENTRY: Uid = Uid(0);

    /// Generate a fresh non-zero UID.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        loop {
            let v: u64 = rng.random();
            if v != 0 {
                return Uid(v);
            }
        }
    }

    pub fn is_set(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({:#018x})", self.0)
    }
}

/// The level a universal header belongs to, encoded in its
/// `segment_number` field for non-segment files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelCode {
    Segment(i32),
    Channel,
    Session,
}

impl LevelCode {
    pub const CHANNEL_CODE: i32 = -2;
    pub const SESSION_CODE: i32 = -3;

    pub fn from_segment_number(n: i32) -> Self {
        match n {
            Self::CHANNEL_CODE => LevelCode::Channel,
            Self::SESSION_CODE => LevelCode::Session,
            n => LevelCode::Segment(n),
        }
    }

    pub fn to_segment_number(self) -> i32 {
        match self {
            LevelCode::Segment(n) => n,
            LevelCode::Channel => Self::CHANNEL_CODE,
            LevelCode::Session => Self::SESSION_CODE,
        }
    }
}

/// Effective access level granted by a processed password.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum AccessLevel {
    #[default]
    None,
    Level1,
    Level2,
}

impl AccessLevel {
    pub fn as_encryption_level(self) -> i8 {
        match self {
            AccessLevel::None => 0,
            AccessLevel::Level1 => 1,
            AccessLevel::Level2 => 2,
        }
    }

    /// True when this access level suffices to decrypt content encrypted
    /// at `level` (0 means unencrypted).
    pub fn grants(self, level: i8) -> bool {
        level <= 0 || self.as_encryption_level() >= level
    }
}

/// The 4-character type codes used in universal headers, file extensions,
/// and directory suffixes, stored on disk as the little-endian `u32` of
/// the ASCII bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
pub enum FileTypeCode {
    #[strum(serialize = "medd")]
    SessionDirectory,
    #[strum(serialize = "ticd")]
    TimeSeriesChannelDirectory,
    #[strum(serialize = "tisd")]
    TimeSeriesSegmentDirectory,
    #[strum(serialize = "tmet")]
    TimeSeriesMetadata,
    #[strum(serialize = "tdat")]
    TimeSeriesData,
    #[strum(serialize = "tidx")]
    TimeSeriesIndices,
    #[strum(serialize = "vicd")]
    VideoChannelDirectory,
    #[strum(serialize = "visd")]
    VideoSegmentDirectory,
    #[strum(serialize = "vmet")]
    VideoMetadata,
    #[strum(serialize = "vdat")]
    VideoData,
    #[strum(serialize = "vidx")]
    VideoIndices,
    #[strum(serialize = "recd")]
    RecordDirectory,
    #[strum(serialize = "rdat")]
    RecordData,
    #[strum(serialize = "ridx")]
    RecordIndices,
}

impl FileTypeCode {
    /// The on-disk `u32` form (little-endian ASCII).
    pub fn code(self) -> u32 {
        let s = self.type_string();
        u32::from_le_bytes([s[0], s[1], s[2], s[3]])
    }

    pub fn type_string(self) -> [u8; 4] {
        let mut out = [0u8; 4];
        let s = self.to_string();
        out.copy_from_slice(s.as_bytes());
        out
    }

    pub fn from_code(code: u32) -> Option<Self> {
        let bytes = code.to_le_bytes();
        let s = std::str::from_utf8(&bytes).ok()?;
        s.parse().ok()
    }

    pub fn is_metadata(self) -> bool {
        matches!(self, FileTypeCode::TimeSeriesMetadata | FileTypeCode::VideoMetadata)
    }
}

/// Type code of a record, e.g. `Sgmt`, stored like a file type code.
pub fn record_type_code(type_string: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*type_string)
}

/// The `Sgmt` (segment) record type code.
pub const SGMT_TYPE_CODE: u32 = 0x746D_6753; // "Sgmt" little-endian

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_codes_match_original_constants() {
        // Little-endian codes from the MED 1.0 definition.
        assert_eq!(FileTypeCode::SessionDirectory.code(), 0x6464_656D);
        assert_eq!(FileTypeCode::TimeSeriesChannelDirectory.code(), 0x6463_6974);
        assert_eq!(FileTypeCode::TimeSeriesSegmentDirectory.code(), 0x6473_6974);
        assert_eq!(FileTypeCode::TimeSeriesMetadata.code(), 0x7465_6D74);
        assert_eq!(FileTypeCode::TimeSeriesData.code(), 0x7461_6474);
        assert_eq!(FileTypeCode::TimeSeriesIndices.code(), 0x7864_6974);
        assert_eq!(FileTypeCode::RecordData.code(), 0x7461_6472);
        assert_eq!(SGMT_TYPE_CODE, record_type_code(b"Sgmt"));
    }

    #[test]
    fn type_code_round_trip() {
        for code in [
            FileTypeCode::SessionDirectory,
            FileTypeCode::TimeSeriesData,
            FileTypeCode::VideoIndices,
            FileTypeCode::RecordIndices,
        ] {
            assert_eq!(FileTypeCode::from_code(code.code()), Some(code));
        }
        assert_eq!(FileTypeCode::from_code(0), None);
    }

    #[test]
    fn access_level_grants() {
        assert!(AccessLevel::None.grants(0));
        assert!(!AccessLevel::None.grants(1));
        assert!(AccessLevel::Level1.grants(1));
        assert!(!AccessLevel::Level1.grants(2));
        assert!(AccessLevel::Level2.grants(1));
        assert!(AccessLevel::Level2.grants(2));
    }

    #[test]
    fn level_code_round_trip() {
        for code in [LevelCode::Segment(7), LevelCode::Channel, LevelCode::Session] {
            assert_eq!(LevelCode::from_segment_number(code.to_segment_number()), code);
        }
    }
}
