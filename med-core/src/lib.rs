//! On-disk structures and primitives for the Multiscale Electrophysiology
//! Data (MED) format.
//!
//! This crate owns everything that has an exact byte layout: the 1 KiB
//! universal header that prefixes every MED file, the 16 KiB metadata file,
//! record headers and the three 24-byte index strides, plus the primitives
//! they depend on (CRC-32 in the MED variant, AES-128-ECB, the SHA-256
//! password derivation, and fixed-width UTF-8 fields). Reading whole
//! sessions and decoding sample data live in the `med-session` and
//! `med-codec` crates.

pub use behavior::{Behavior, BehaviorStack, OnFail};
pub use crc::{CrcMode, crc, crc_combine, crc_update};
pub use error::{ErrorKind, MedError, Result};
pub use metadata::{
    Metadata, MetadataSection1, MetadataSection2, MetadataSection3, TimeSeriesSection2,
    VideoSection2,
};
pub use password::{ExpandedKey, PasswordData, expand_password};
pub use record::{
    RecordFilter, RecordHeader, RecordIndexEntry, SgmtRecord, StatRecord, TimeSeriesIndexEntry,
    VideoIndexEntry,
};
pub use types::{AccessLevel, FileTypeCode, LevelCode, Uid};
pub use universal_header::UniversalHeader;

pub mod aes;
pub mod behavior;
pub mod crc;
pub mod error;
pub mod metadata;
pub mod password;
pub mod record;
pub mod text;
pub mod types;
pub mod universal_header;

/// Signed microseconds since the Unix epoch ("micro-UTC").
pub type Uutc = i64;
/// Session- or segment-relative sample index.
pub type SampleNumber = i64;
