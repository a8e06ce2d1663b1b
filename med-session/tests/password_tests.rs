//! Password and encryption behavior across a written session: access
//! levels, hint recovery, encrypted data blocks, and CRC-validated
//! corruption reporting.

use med_core::error::{ErrorKind, MedError};
use med_core::crc::CrcMode;
use med_session::{
    MatrixData, MatrixRequestBuilder, MedContext, SegmentPiece, Session, SessionWriter,
    TimeSlice, get_matrix,
};
use tempfile::TempDir;

const T0: i64 = 1_650_000_000_000_000;

fn ramp(n: usize) -> Vec<i32> {
    (0..n).map(|i| (i as i32 % 2000) - 1000).collect()
}

fn protected_session(dir: &TempDir, data_encryption: bool) -> std::path::PathBuf {
    let mut writer = SessionWriter::new(dir.path(), "protected")
        .with_passwords("patient", "research", "first pet", "grant number");
    if data_encryption {
        writer = writer.with_data_encryption(1);
    }
    writer.add_channel("chan", 1000.0, 0.5, "µV");
    writer
        .add_segment(
            "chan",
            vec![SegmentPiece {
                start_time: T0,
                samples: ramp(4_000),
            }],
        )
        .unwrap();
    writer.write().unwrap()
}

#[test]
fn wrong_password_fails_with_bad_password() {
    let dir = TempDir::new().unwrap();
    let path = protected_session(&dir, false);
    let err = Session::open(&path, Some("intruder")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadPassword);
}

#[test]
fn no_password_on_an_encrypted_session_surfaces_the_hint() {
    let dir = TempDir::new().unwrap();
    let path = protected_session(&dir, false);
    // Without a password, section 2 stays ciphertext and the level-1
    // hint is surfaced for a reprompt.
    let err = Session::open(&path, None).unwrap_err();
    match err {
        MedError::BadPassword { hint } => assert_eq!(hint.as_deref(), Some("first pet")),
        other => panic!("expected BadPassword, got {other:?}"),
    }
}

#[test]
fn level_1_password_reads_data_but_not_section_3() {
    let dir = TempDir::new().unwrap();
    let path = protected_session(&dir, false);
    let session = Session::open(&path, Some("patient")).unwrap();
    let segment = session.channel(0).segment(0).unwrap();
    assert!(!segment.section_3_readable);
    let s2 = segment.metadata.time_series().unwrap();
    assert_eq!(s2.sampling_frequency, 1000.0);
}

#[test]
fn level_2_password_reads_everything_including_level_1_hint() {
    let dir = TempDir::new().unwrap();
    let path = protected_session(&dir, false);
    let session = Session::open(&path, Some("research")).unwrap();
    let segment = session.channel(0).segment(0).unwrap();
    assert!(segment.section_3_readable);
    // With level-2 access the level-1 hint is readable from section 1.
    assert_eq!(segment.metadata.section_1.level_1_password_hint, "first pet");
    assert_eq!(
        segment.metadata.section_3.standard_timezone_acronym,
        "UTC"
    );
}

#[test]
fn encrypted_data_blocks_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = protected_session(&dir, true);
    let session = Session::open(&path, Some("patient")).unwrap();
    let slice = TimeSlice::from_times(T0, T0 + 4_000_000 - 1);
    let request = MatrixRequestBuilder::default()
        .sampling_frequency(Some(1000.0))
        .build()
        .unwrap();
    let matrix = get_matrix(&session, slice, &request).unwrap();
    let MatrixData::Sf8(data) = &matrix.data else { panic!() };
    // Ramp values scaled by the 0.5 units factor.
    assert!((data[[0, 0]] - (-1000.0 * 0.5)).abs() < 1.0);
    assert!((data[[0, 1500]] - (500.0 * 0.5)).abs() < 1.0);
}

#[test]
fn corrupted_block_payload_reports_its_file_offset() {
    let dir = TempDir::new().unwrap();
    let mut writer = SessionWriter::new(dir.path(), "fragile");
    writer.add_channel("chan", 1000.0, 1.0, "µV");
    writer
        .add_segment(
            "chan",
            vec![SegmentPiece {
                start_time: T0,
                samples: ramp(3_000),
            }],
        )
        .unwrap();
    let path = writer.write().unwrap();

    // Corrupt one byte inside a block payload near the file's end.
    let data_path = path
        .join("chan.ticd")
        .join("chan-0001.tisd")
        .join("chan-0001.tdat");
    let mut bytes = std::fs::read(&data_path).unwrap();
    let second_block_region = bytes.len() - 100;
    bytes[second_block_region] ^= 0x20;
    std::fs::write(&data_path, &bytes).unwrap();

    let mut context = MedContext::new();
    context.crc_mode = CrcMode::VALIDATE_ON_INPUT;
    let session = Session::open_with_context(&path, context).unwrap();
    let slice = TimeSlice::from_times(T0, T0 + 3_000_000 - 1);
    let request = MatrixRequestBuilder::default()
        .sampling_frequency(Some(1000.0))
        .build()
        .unwrap();
    let err = get_matrix(&session, slice, &request).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReadError);
    match err {
        MedError::CrcMismatch { path, offset } => {
            assert!(path.ends_with("chan-0001.tdat"));
            assert!(offset >= 1024, "offset {offset}");
        }
        other => panic!("expected CrcMismatch, got {other:?}"),
    }
}

#[test]
fn read_log_localizes_the_corruption() {
    let dir = TempDir::new().unwrap();
    let mut writer = SessionWriter::new(dir.path(), "logged");
    writer.add_channel("chan", 1000.0, 1.0, "µV");
    writer
        .add_segment(
            "chan",
            vec![SegmentPiece {
                start_time: T0,
                samples: ramp(2_000),
            }],
        )
        .unwrap();
    let path = writer.write().unwrap();
    let data_path = path
        .join("chan.ticd")
        .join("chan-0001.tisd")
        .join("chan-0001.tdat");
    let mut bytes = std::fs::read(&data_path).unwrap();
    let tail = bytes.len() - 9;
    bytes[tail] ^= 0x01;
    std::fs::write(&data_path, &bytes).unwrap();

    let mut context = MedContext::new();
    context.crc_mode = CrcMode::VALIDATE_ON_INPUT;
    let log = context.enable_read_log();
    let session = Session::open_with_context(&path, context).unwrap();
    let slice = TimeSlice::from_times(T0, T0 + 2_000_000 - 1);
    let request = MatrixRequestBuilder::default()
        .sampling_frequency(Some(500.0))
        .build()
        .unwrap();
    let _ = get_matrix(&session, slice, &request);
    let failure = log.first_failure().expect("a failed read was logged");
    assert!(failure.path.ends_with("chan-0001.tdat"));
}
