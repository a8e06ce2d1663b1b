//! The 1 KiB universal header that prefixes every MED file.
//!
//! The header CRC covers bytes 4..1024 (everything after itself); the
//! body CRC covers bytes 1024..EOF. Multi-byte integers are
//! little-endian. Unknown protected and discretionary bytes are carried
//! through rewrites untouched.

use byteorder::{ByteOrder, LittleEndian};

use crate::crc::{crc, crc_combine};
use crate::error::{MedError, Result};
use crate::text::{read_fixed_utf8, write_fixed_utf8};
use crate::types::{
    self, FileTypeCode, LevelCode, LITTLE_ENDIAN, MED_VERSION_MAJOR, MED_VERSION_MINOR, Uid,
};

pub const UNIVERSAL_HEADER_BYTES: usize = 1024;

// Field offsets.
const HEADER_CRC_OFFSET: usize = 0;
const BODY_CRC_OFFSET: usize = 4;
const HEADER_CRC_START_OFFSET: usize = 4;
const FILE_END_TIME_OFFSET: usize = 8;
const NUMBER_OF_ENTRIES_OFFSET: usize = 16;
const MAXIMUM_ENTRY_SIZE_OFFSET: usize = 24;
const SEGMENT_NUMBER_OFFSET: usize = 28;
const TYPE_STRING_OFFSET: usize = 32;
const MED_VERSION_MAJOR_OFFSET: usize = 37;
const MED_VERSION_MINOR_OFFSET: usize = 38;
const BYTE_ORDER_CODE_OFFSET: usize = 39;
const SESSION_START_TIME_OFFSET: usize = 40;
const FILE_START_TIME_OFFSET: usize = 48;
const SESSION_NAME_OFFSET: usize = 56;
const CHANNEL_NAME_OFFSET: usize = 312;
const ANONYMIZED_SUBJECT_ID_OFFSET: usize = 568;
const SESSION_UID_OFFSET: usize = 824;
const CHANNEL_UID_OFFSET: usize = 832;
const SEGMENT_UID_OFFSET: usize = 840;
const FILE_UID_OFFSET: usize = 848;
const PROVENANCE_UID_OFFSET: usize = 856;
const LEVEL_1_VALIDATION_OFFSET: usize = 864;
const LEVEL_2_VALIDATION_OFFSET: usize = 880;
const LEVEL_3_VALIDATION_OFFSET: usize = 896;
const PROTECTED_REGION_OFFSET: usize = 912;
const PROTECTED_REGION_BYTES: usize = 56;
const DISCRETIONARY_REGION_OFFSET: usize = 968;
const DISCRETIONARY_REGION_BYTES: usize = 56;

const NAME_BYTES: usize = 256;

/// Parsed universal header.
#[derive(Debug, Clone)]
pub struct UniversalHeader {
    pub header_crc: u32,
    pub body_crc: u32,
    pub file_end_time: i64,
    pub number_of_entries: i64,
    pub maximum_entry_size: u32,
    pub segment_number: i32,
    pub type_code: u32,
    pub med_version_major: u8,
    pub med_version_minor: u8,
    pub byte_order_code: u8,
    pub session_start_time: i64,
    pub file_start_time: i64,
    pub session_name: String,
    pub channel_name: String,
    pub anonymized_subject_id: String,
    pub session_uid: Uid,
    pub channel_uid: Uid,
    pub segment_uid: Uid,
    pub file_uid: Uid,
    pub provenance_uid: Uid,
    pub password_validation_fields: [[u8; 16]; 3],
    pub protected_region: [u8; PROTECTED_REGION_BYTES],
    pub discretionary_region: [u8; DISCRETIONARY_REGION_BYTES],
}

impl UniversalHeader {
    /// A fresh header for a new file of `type_code` at the given level.
    pub fn new(type_code: FileTypeCode, level: LevelCode) -> Self {
        UniversalHeader {
            header_crc: crate::crc::CRC_NO_ENTRY,
            body_crc: crate::crc::CRC_NO_ENTRY,
            file_end_time: types::UUTC_NO_ENTRY,
            number_of_entries: types::NUMBER_OF_ENTRIES_NO_ENTRY,
            maximum_entry_size: 0,
            segment_number: level.to_segment_number(),
            type_code: type_code.code(),
            med_version_major: MED_VERSION_MAJOR,
            med_version_minor: MED_VERSION_MINOR,
            byte_order_code: LITTLE_ENDIAN,
            session_start_time: types::UUTC_NO_ENTRY,
            file_start_time: types::UUTC_NO_ENTRY,
            session_name: String::new(),
            channel_name: String::new(),
            anonymized_subject_id: String::new(),
            session_uid: Uid::NO_ENTRY,
            channel_uid: Uid::NO_ENTRY,
            segment_uid: Uid::NO_ENTRY,
            file_uid: Uid::generate(),
            provenance_uid: Uid::NO_ENTRY,
            password_validation_fields: [[0; 16]; 3],
            protected_region: [0; PROTECTED_REGION_BYTES],
            discretionary_region: [0; DISCRETIONARY_REGION_BYTES],
        }
    }

    /// Parse a header, validating its CRC and byte order. `path` is used
    /// only for error context.
    pub fn from_bytes(bytes: &[u8], path: &std::path::Path) -> Result<Self> {
        if bytes.len() < UNIVERSAL_HEADER_BYTES {
            return Err(MedError::NotMed {
                path: path.to_owned(),
                detail: format!("{} bytes is shorter than a universal header", bytes.len()),
            });
        }
        let header_crc = LittleEndian::read_u32(&bytes[HEADER_CRC_OFFSET..]);
        let computed = crc(&bytes[HEADER_CRC_START_OFFSET..UNIVERSAL_HEADER_BYTES]);
        if computed != header_crc {
            return Err(MedError::CrcMismatch {
                path: path.to_owned(),
                offset: 0,
            });
        }
        let byte_order_code = bytes[BYTE_ORDER_CODE_OFFSET];
        if byte_order_code != LITTLE_ENDIAN {
            return Err(MedError::NotMed {
                path: path.to_owned(),
                detail: format!("unsupported byte order code {byte_order_code}"),
            });
        }
        let type_code = LittleEndian::read_u32(&bytes[TYPE_STRING_OFFSET..]);
        if FileTypeCode::from_code(type_code).is_none() {
            return Err(MedError::NotMed {
                path: path.to_owned(),
                detail: "unknown file type code".into(),
            });
        }

        let mut validation = [[0u8; 16]; 3];
        validation[0].copy_from_slice(&bytes[LEVEL_1_VALIDATION_OFFSET..][..16]);
        validation[1].copy_from_slice(&bytes[LEVEL_2_VALIDATION_OFFSET..][..16]);
        validation[2].copy_from_slice(&bytes[LEVEL_3_VALIDATION_OFFSET..][..16]);

        let mut protected_region = [0u8; PROTECTED_REGION_BYTES];
        protected_region.copy_from_slice(&bytes[PROTECTED_REGION_OFFSET..][..PROTECTED_REGION_BYTES]);
        let mut discretionary_region = [0u8; DISCRETIONARY_REGION_BYTES];
        discretionary_region
            .copy_from_slice(&bytes[DISCRETIONARY_REGION_OFFSET..][..DISCRETIONARY_REGION_BYTES]);

        Ok(UniversalHeader {
            header_crc,
            body_crc: LittleEndian::read_u32(&bytes[BODY_CRC_OFFSET..]),
            file_end_time: LittleEndian::read_i64(&bytes[FILE_END_TIME_OFFSET..]),
            number_of_entries: LittleEndian::read_i64(&bytes[NUMBER_OF_ENTRIES_OFFSET..]),
            maximum_entry_size: LittleEndian::read_u32(&bytes[MAXIMUM_ENTRY_SIZE_OFFSET..]),
            segment_number: LittleEndian::read_i32(&bytes[SEGMENT_NUMBER_OFFSET..]),
            type_code,
            med_version_major: bytes[MED_VERSION_MAJOR_OFFSET],
            med_version_minor: bytes[MED_VERSION_MINOR_OFFSET],
            byte_order_code,
            session_start_time: LittleEndian::read_i64(&bytes[SESSION_START_TIME_OFFSET..]),
            file_start_time: LittleEndian::read_i64(&bytes[FILE_START_TIME_OFFSET..]),
            session_name: read_fixed_utf8(&bytes[SESSION_NAME_OFFSET..][..NAME_BYTES])?,
            channel_name: read_fixed_utf8(&bytes[CHANNEL_NAME_OFFSET..][..NAME_BYTES])?,
            anonymized_subject_id: read_fixed_utf8(
                &bytes[ANONYMIZED_SUBJECT_ID_OFFSET..][..NAME_BYTES],
            )?,
            session_uid: Uid(LittleEndian::read_u64(&bytes[SESSION_UID_OFFSET..])),
            channel_uid: Uid(LittleEndian::read_u64(&bytes[CHANNEL_UID_OFFSET..])),
            segment_uid: Uid(LittleEndian::read_u64(&bytes[SEGMENT_UID_OFFSET..])),
            file_uid: Uid(LittleEndian::read_u64(&bytes[FILE_UID_OFFSET..])),
            provenance_uid: Uid(LittleEndian::read_u64(&bytes[PROVENANCE_UID_OFFSET..])),
            password_validation_fields: validation,
            protected_region,
            discretionary_region,
        })
    }

    /// Serialize, leaving both CRC fields as currently stored. Call
    /// [`refresh_crcs`] on the full file buffer to finalize them.
    pub fn to_bytes(&self) -> Result<[u8; UNIVERSAL_HEADER_BYTES]> {
        let mut bytes = [0u8; UNIVERSAL_HEADER_BYTES];
        LittleEndian::write_u32(&mut bytes[HEADER_CRC_OFFSET..], self.header_crc);
        LittleEndian::write_u32(&mut bytes[BODY_CRC_OFFSET..], self.body_crc);
        LittleEndian::write_i64(&mut bytes[FILE_END_TIME_OFFSET..], self.file_end_time);
        LittleEndian::write_i64(&mut bytes[NUMBER_OF_ENTRIES_OFFSET..], self.number_of_entries);
        LittleEndian::write_u32(&mut bytes[MAXIMUM_ENTRY_SIZE_OFFSET..], self.maximum_entry_size);
        LittleEndian::write_i32(&mut bytes[SEGMENT_NUMBER_OFFSET..], self.segment_number);
        LittleEndian::write_u32(&mut bytes[TYPE_STRING_OFFSET..], self.type_code);
        // Type string terminal zero at offset 36 is the zero fill.
        bytes[MED_VERSION_MAJOR_OFFSET] = self.med_version_major;
        bytes[MED_VERSION_MINOR_OFFSET] = self.med_version_minor;
        bytes[BYTE_ORDER_CODE_OFFSET] = self.byte_order_code;
        LittleEndian::write_i64(&mut bytes[SESSION_START_TIME_OFFSET..], self.session_start_time);
        LittleEndian::write_i64(&mut bytes[FILE_START_TIME_OFFSET..], self.file_start_time);
        write_fixed_utf8(&mut bytes[SESSION_NAME_OFFSET..CHANNEL_NAME_OFFSET], &self.session_name)?;
        write_fixed_utf8(
            &mut bytes[CHANNEL_NAME_OFFSET..ANONYMIZED_SUBJECT_ID_OFFSET],
            &self.channel_name,
        )?;
        write_fixed_utf8(
            &mut bytes[ANONYMIZED_SUBJECT_ID_OFFSET..SESSION_UID_OFFSET],
            &self.anonymized_subject_id,
        )?;
        LittleEndian::write_u64(&mut bytes[SESSION_UID_OFFSET..], self.session_uid.0);
        LittleEndian::write_u64(&mut bytes[CHANNEL_UID_OFFSET..], self.channel_uid.0);
        LittleEndian::write_u64(&mut bytes[SEGMENT_UID_OFFSET..], self.segment_uid.0);
        LittleEndian::write_u64(&mut bytes[FILE_UID_OFFSET..], self.file_uid.0);
        LittleEndian::write_u64(&mut bytes[PROVENANCE_UID_OFFSET..], self.provenance_uid.0);
        bytes[LEVEL_1_VALIDATION_OFFSET..][..16].copy_from_slice(&self.password_validation_fields[0]);
        bytes[LEVEL_2_VALIDATION_OFFSET..][..16].copy_from_slice(&self.password_validation_fields[1]);
        bytes[LEVEL_3_VALIDATION_OFFSET..][..16].copy_from_slice(&self.password_validation_fields[2]);
        bytes[PROTECTED_REGION_OFFSET..][..PROTECTED_REGION_BYTES]
            .copy_from_slice(&self.protected_region);
        bytes[DISCRETIONARY_REGION_OFFSET..][..DISCRETIONARY_REGION_BYTES]
            .copy_from_slice(&self.discretionary_region);
        Ok(bytes)
    }

    pub fn level(&self) -> LevelCode {
        LevelCode::from_segment_number(self.segment_number)
    }

    pub fn file_type(&self) -> Option<FileTypeCode> {
        FileTypeCode::from_code(self.type_code)
    }

    /// Validate the body CRC of a complete file buffer against this
    /// header's stored value.
    pub fn validate_body_crc(&self, file_bytes: &[u8], path: &std::path::Path) -> Result<()> {
        let computed = crc(&file_bytes[UNIVERSAL_HEADER_BYTES..]);
        if computed != self.body_crc {
            return Err(MedError::CrcMismatch {
                path: path.to_owned(),
                offset: UNIVERSAL_HEADER_BYTES as u64,
            });
        }
        Ok(())
    }
}

/// Recompute and store both CRCs over a complete file image: the body
/// CRC first (bytes 1024..EOF into offset 4), then the header CRC
/// (bytes 4..1024 into offset 0).
pub fn refresh_crcs(file_bytes: &mut [u8]) {
    debug_assert!(file_bytes.len() >= UNIVERSAL_HEADER_BYTES);
    let body_crc = crc(&file_bytes[UNIVERSAL_HEADER_BYTES..]);
    LittleEndian::write_u32(&mut file_bytes[BODY_CRC_OFFSET..], body_crc);
    let header_crc = crc(&file_bytes[HEADER_CRC_START_OFFSET..UNIVERSAL_HEADER_BYTES]);
    LittleEndian::write_u32(&mut file_bytes[HEADER_CRC_OFFSET..], header_crc);
}

/// CRC of a whole file, derived from the two stored section CRCs without
/// re-reading the bytes.
pub fn whole_file_crc(header_crc: u32, body_crc: u32, body_len: u64) -> u32 {
    crc_combine(header_crc, body_crc, body_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn sample_header() -> UniversalHeader {
        let mut uh = UniversalHeader::new(
            FileTypeCode::TimeSeriesMetadata,
            LevelCode::Segment(1),
        );
        uh.session_name = "sleep-study".into();
        uh.channel_name = "Fp1".into();
        uh.session_start_time = 1_600_000_000_000_000;
        uh.file_start_time = 1_600_000_000_000_000;
        uh.file_end_time = 1_600_000_600_000_000;
        uh.session_uid = Uid(0x1122_3344_5566_7788);
        uh
    }

    #[test]
    fn round_trip_through_bytes() {
        let uh = sample_header();
        let mut file = uh.to_bytes().unwrap().to_vec();
        file.extend_from_slice(b"body bytes of some file");
        refresh_crcs(&mut file);

        let parsed = UniversalHeader::from_bytes(&file, Path::new("t.tmet")).unwrap();
        assert_eq!(parsed.session_name, "sleep-study");
        assert_eq!(parsed.channel_name, "Fp1");
        assert_eq!(parsed.segment_number, 1);
        assert_eq!(parsed.file_type(), Some(FileTypeCode::TimeSeriesMetadata));
        assert_eq!(parsed.session_uid, Uid(0x1122_3344_5566_7788));
        parsed.validate_body_crc(&file, Path::new("t.tmet")).unwrap();
    }

    #[test]
    fn header_crc_corruption_is_detected() {
        let uh = sample_header();
        let mut file = uh.to_bytes().unwrap().to_vec();
        refresh_crcs(&mut file);
        file[100] ^= 1;
        let err = UniversalHeader::from_bytes(&file, Path::new("t.tmet")).unwrap_err();
        assert!(matches!(err, MedError::CrcMismatch { offset: 0, .. }));
    }

    #[test]
    fn body_crc_corruption_is_detected_with_offset() {
        let uh = sample_header();
        let mut file = uh.to_bytes().unwrap().to_vec();
        file.extend_from_slice(&[1, 2, 3, 4]);
        refresh_crcs(&mut file);
        file[UNIVERSAL_HEADER_BYTES + 2] ^= 1;
        let parsed = UniversalHeader::from_bytes(&file, Path::new("t.tmet")).unwrap();
        let err = parsed.validate_body_crc(&file, Path::new("t.tmet")).unwrap_err();
        assert!(matches!(err, MedError::CrcMismatch { offset: 1024, .. }));
    }

    #[test]
    fn big_endian_files_are_rejected() {
        let uh = sample_header();
        let mut file = uh.to_bytes().unwrap().to_vec();
        file[BYTE_ORDER_CODE_OFFSET] = crate::types::BIG_ENDIAN;
        refresh_crcs(&mut file);
        let err = UniversalHeader::from_bytes(&file, Path::new("t.tmet")).unwrap_err();
        assert!(matches!(err, MedError::NotMed { .. }));
    }

    #[test]
    fn whole_file_crc_matches_direct_computation() {
        let uh = sample_header();
        let mut file = uh.to_bytes().unwrap().to_vec();
        file.extend_from_slice(b"some body");
        refresh_crcs(&mut file);
        let parsed = UniversalHeader::from_bytes(&file, Path::new("t.tmet")).unwrap();
        let direct = crate::crc::crc(&file[4..]);
        let body_len = (file.len() - UNIVERSAL_HEADER_BYTES) as u64;
        assert_eq!(
            whole_file_crc(parsed.header_crc, parsed.body_crc, body_len),
            direct
        );
    }
}
