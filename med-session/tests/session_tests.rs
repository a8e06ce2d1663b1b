//! End-to-end tests over written sessions: hierarchy open, slice
//! resolution, and the data-matrix engine.

use approx::assert_relative_eq;
use med_codec::interp::InterpMode;
use med_core::error::{ErrorKind, MedError};
use med_session::{
    DiscontinuityMode, MatrixData, MatrixLayout, MatrixRequestBuilder, MatrixValueType,
    SegmentPiece, Session, SessionWriter, TimeSlice, get_matrix,
};
use tempfile::TempDir;

const T0: i64 = 1_700_000_000_000_000;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn sine(n: usize, fs: f64, freq: f64, amplitude: f64) -> Vec<i32> {
    (0..n)
        .map(|i| {
            (amplitude * (2.0 * std::f64::consts::PI * freq * i as f64 / fs).sin()) as i32
        })
        .collect()
}

/// Two channels at 1000 and 500 Hz, 10 contiguous seconds.
fn two_channel_session(dir: &TempDir) -> Session {
    let mut writer = SessionWriter::new(dir.path(), "two-rates");
    writer.add_channel("fast", 1000.0, 0.1, "µV");
    writer.add_channel("slow", 500.0, 0.1, "µV");
    writer
        .add_segment(
            "fast",
            vec![SegmentPiece {
                start_time: T0,
                samples: sine(10_000, 1000.0, 7.0, 15_000.0),
            }],
        )
        .unwrap();
    writer
        .add_segment(
            "slow",
            vec![SegmentPiece {
                start_time: T0,
                samples: sine(5_000, 500.0, 3.0, 9_000.0),
            }],
        )
        .unwrap();
    let path = writer.write().unwrap();
    Session::open(&path, None).unwrap()
}

#[test]
fn open_discovers_channels_and_reference() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let session = two_channel_session(&dir);
    assert_eq!(session.channel_count(), 2);
    // Highest rate wins the reference.
    assert_eq!(session.reference().name, "fast");
    assert_eq!(session.reference().sampling_frequency(), 1000.0);
    assert_eq!(session.channel_by_name("slow").unwrap().segment_count(), 1);
    // Mixed rates put the variable sentinel in the session metadata.
    let s2 = session.metadata.time_series().unwrap();
    assert_eq!(s2.sampling_frequency, med_core::types::FREQUENCY_VARIABLE);
}

#[test]
fn ten_second_slice_as_250_hz_sample_major_f32_matrix() {
    let dir = TempDir::new().unwrap();
    let session = two_channel_session(&dir);
    let slice = TimeSlice::from_times(T0, T0 + 10_000_000 - 1);
    let request = MatrixRequestBuilder::default()
        .sampling_frequency(Some(250.0))
        .value_type(MatrixValueType::Sf4)
        .layout(MatrixLayout::SampleMajor)
        .trace_extrema(true)
        .build()
        .unwrap();
    let matrix = get_matrix(&session, slice, &request).unwrap();

    assert_eq!(matrix.channel_count, 2);
    assert_eq!(matrix.sample_count, 2500);
    let MatrixData::Sf4(data) = &matrix.data else {
        panic!("expected f32 output");
    };
    assert_eq!(data.dim(), (2500, 2));

    let minima = matrix.trace_minima.as_ref().unwrap();
    let maxima = matrix.trace_maxima.as_ref().unwrap();
    assert_eq!(minima.len(), 2);
    // 15000 counts at 0.1 µV/count ≈ ±1500 µV on the fast channel.
    assert!(maxima[0] > 1_000.0 && maxima[0] <= 1_600.0, "max {}", maxima[0]);
    assert!(minima[0] < -1_000.0, "min {}", minima[0]);
    assert!(maxima[1] > 500.0, "slow channel max {}", maxima[1]);
}

#[test]
fn native_units_are_applied() {
    let dir = TempDir::new().unwrap();
    let session = two_channel_session(&dir);
    let slice = TimeSlice::from_times(T0, T0 + 1_000_000 - 1);
    let request = MatrixRequestBuilder::default()
        .sampling_frequency(Some(1000.0))
        .build()
        .unwrap();
    let matrix = get_matrix(&session, slice, &request).unwrap();
    let MatrixData::Sf8(data) = &matrix.data else {
        panic!("expected f64 output");
    };
    // Raw counts peak near 15000; in native units near 1500.
    let peak = data.row(0).iter().cloned().fold(0.0f64, |a, b| a.max(b.abs()));
    assert!(peak > 1_000.0 && peak < 2_000.0, "peak {peak}");
}

#[test]
fn gap_padding_produces_exactly_the_gap_cells() {
    let dir = TempDir::new().unwrap();
    let mut writer = SessionWriter::new(dir.path(), "gapped");
    writer.add_channel("a", 1000.0, 1.0, "µV");
    writer.add_channel("b", 500.0, 1.0, "µV");
    // 4 s of data, a 400 ms gap, then 5.6 s more: 10 s of wall clock.
    writer
        .add_segment(
            "a",
            vec![
                SegmentPiece {
                    start_time: T0,
                    samples: sine(4_000, 1000.0, 5.0, 10_000.0),
                },
                SegmentPiece {
                    start_time: T0 + 4_400_000,
                    samples: sine(5_600, 1000.0, 5.0, 10_000.0),
                },
            ],
        )
        .unwrap();
    writer
        .add_segment(
            "b",
            vec![
                SegmentPiece {
                    start_time: T0,
                    samples: sine(2_000, 500.0, 5.0, 10_000.0),
                },
                SegmentPiece {
                    start_time: T0 + 4_400_000,
                    samples: sine(2_800, 500.0, 5.0, 10_000.0),
                },
            ],
        )
        .unwrap();
    let path = writer.write().unwrap();
    let session = Session::open(&path, None).unwrap();

    let slice = TimeSlice::from_times(T0, T0 + 10_000_000 - 1);
    let request = MatrixRequestBuilder::default()
        .sampling_frequency(Some(250.0))
        .discontinuity_mode(DiscontinuityMode::NanFill)
        .build()
        .unwrap();
    let matrix = get_matrix(&session, slice, &request).unwrap();

    assert_eq!(matrix.contiguons.len(), 2);
    let MatrixData::Sf8(data) = &matrix.data else {
        panic!("expected f64 output");
    };
    for row in 0..2 {
        let nan_cells: Vec<usize> = data
            .row(row)
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_nan())
            .map(|(i, _)| i)
            .collect();
        assert_eq!(nan_cells.len(), 100, "channel {row}: {nan_cells:?}");
        // One contiguous run.
        assert_eq!(nan_cells[99] - nan_cells[0], 99, "channel {row}");
    }
}

#[test]
fn zero_fill_writes_zeros_instead() {
    let dir = TempDir::new().unwrap();
    let mut writer = SessionWriter::new(dir.path(), "zeroed");
    writer.add_channel("a", 1000.0, 1.0, "µV");
    writer
        .add_segment(
            "a",
            vec![
                SegmentPiece {
                    start_time: T0,
                    samples: vec![500; 1000],
                },
                SegmentPiece {
                    start_time: T0 + 1_500_000,
                    samples: vec![500; 1000],
                },
            ],
        )
        .unwrap();
    let path = writer.write().unwrap();
    let session = Session::open(&path, None).unwrap();

    let slice = TimeSlice::from_times(T0, T0 + 2_500_000 - 1);
    let request = MatrixRequestBuilder::default()
        .sampling_frequency(Some(1000.0))
        .discontinuity_mode(DiscontinuityMode::ZeroFill)
        .build()
        .unwrap();
    let matrix = get_matrix(&session, slice, &request).unwrap();
    let MatrixData::Sf8(data) = &matrix.data else {
        panic!("expected f64 output");
    };
    let zeros = data.row(0).iter().filter(|&&v| v == 0.0).count();
    assert_eq!(zeros, 500);
}

#[test]
fn slice_resolution_round_trips_time_and_samples() {
    let dir = TempDir::new().unwrap();
    let session = two_channel_session(&dir);
    let index = session.sgmt_index();

    let mut slice = TimeSlice::from_times(T0 + 1_000_000, T0 + 2_000_000 - 1);
    session.resolve_slice(&mut slice).unwrap();
    assert_eq!(slice.start_sample_number, 1000);
    assert_eq!(slice.end_sample_number, 1999);
    assert_eq!(slice.number_of_segments, 1);

    use med_session::{FindMode, TimePoint};
    for t in [T0, T0 + 123_000, T0 + 9_999_000] {
        let sample = index.sample_number_for_uutc(t, FindMode::Current).unwrap();
        let back = index.uutc_for_sample_number(sample, TimePoint::Start).unwrap();
        assert_eq!(back, t);
    }
}

#[test]
fn empty_and_nonexistent_slices() {
    let dir = TempDir::new().unwrap();
    let session = two_channel_session(&dir);

    // Entirely before the recording.
    let mut before = TimeSlice::from_times(T0 - 10_000_000, T0 - 1);
    let err = session.resolve_slice(&mut before).unwrap_err();
    assert!(matches!(err, MedError::DoesNotExist));
    assert_eq!(err.kind(), ErrorKind::ReadError);

    // Inverted-but-conditioned bounds that land on nothing.
    let mut empty = TimeSlice::from_samples(5, 5);
    session.resolve_slice(&mut empty).unwrap();
    assert_eq!(empty.sample_count(), 1);
}

#[test]
fn concurrent_matrix_calls_return_identical_bytes() {
    let dir = TempDir::new().unwrap();
    let session = two_channel_session(&dir);
    let slice = TimeSlice::from_times(T0, T0 + 10_000_000 - 1);
    let request = MatrixRequestBuilder::default()
        .sampling_frequency(Some(250.0))
        .value_type(MatrixValueType::Sf4)
        .trace_extrema(true)
        .build()
        .unwrap();

    let (left, right) = std::thread::scope(|scope| {
        let a = scope.spawn(|| get_matrix(&session, slice, &request).unwrap());
        let b = scope.spawn(|| get_matrix(&session, slice, &request).unwrap());
        (a.join().unwrap(), b.join().unwrap())
    });
    assert_eq!(left.data.to_le_bytes(), right.data.to_le_bytes());
    assert_eq!(left.trace_minima, right.trace_minima);
    assert_eq!(left.trace_maxima, right.trace_maxima);
}

#[test]
fn interpolation_modes_agree_on_knot_counts() {
    let dir = TempDir::new().unwrap();
    let session = two_channel_session(&dir);
    let slice = TimeSlice::from_times(T0, T0 + 2_000_000 - 1);
    for interpolation in [
        InterpMode::Linear,
        InterpMode::Makima,
        InterpMode::Spline,
        InterpMode::UpMakimaDownLinear,
        InterpMode::UpSplineDownLinear,
        InterpMode::Binterp(med_codec::interp::BinCenterMode::Mean),
    ] {
        let request = MatrixRequestBuilder::default()
            .sampling_frequency(Some(100.0))
            .interpolation(interpolation)
            .build()
            .unwrap();
        let matrix = get_matrix(&session, slice, &request).unwrap();
        assert_eq!(matrix.sample_count, 200, "{interpolation:?}");
    }
}

#[test]
fn trace_ranges_bound_the_trace() {
    let dir = TempDir::new().unwrap();
    let session = two_channel_session(&dir);
    let slice = TimeSlice::from_times(T0, T0 + 4_000_000 - 1);
    let request = MatrixRequestBuilder::default()
        .sampling_frequency(Some(100.0))
        .trace_ranges(true)
        .build()
        .unwrap();
    let matrix = get_matrix(&session, slice, &request).unwrap();
    let MatrixData::Sf8(data) = &matrix.data else { panic!() };
    let Some(MatrixData::Sf8(minima)) = &matrix.range_minima else { panic!() };
    let Some(MatrixData::Sf8(maxima)) = &matrix.range_maxima else { panic!() };
    for row in 0..matrix.channel_count {
        for col in 0..matrix.sample_count {
            assert!(minima[[row, col]] <= maxima[[row, col]]);
            // The bin bounds must bracket nearby trace values loosely;
            // sanity-check the ordering only.
            let _ = data;
        }
    }
}

#[test]
fn antialias_filter_runs_in_the_worker() {
    let dir = TempDir::new().unwrap();
    let session = two_channel_session(&dir);
    let slice = TimeSlice::from_times(T0, T0 + 10_000_000 - 1);
    let request = MatrixRequestBuilder::default()
        .sampling_frequency(Some(100.0))
        .filter(med_session::MatrixFilter::Antialias)
        .build()
        .unwrap();
    let matrix = get_matrix(&session, slice, &request).unwrap();
    // The 7 Hz fast-channel sine survives a 100 Hz output with
    // antialiasing; spot check the amplitude is in family.
    let MatrixData::Sf8(data) = &matrix.data else { panic!() };
    let peak = data.row(0).iter().cloned().fold(0.0f64, |a, b| a.max(b.abs()));
    assert!(peak > 1_000.0, "peak {peak}");
}

#[test]
fn lazy_segments_open_only_what_the_slice_touches() {
    let dir = TempDir::new().unwrap();
    let mut writer = SessionWriter::new(dir.path(), "lazy");
    writer.add_channel("a", 1000.0, 1.0, "µV");
    for seg in 0..4 {
        writer
            .add_segment(
                "a",
                vec![SegmentPiece {
                    start_time: T0 + seg * 1_000_000,
                    samples: sine(1_000, 1000.0, 11.0, 4_000.0),
                }],
            )
            .unwrap();
    }
    let path = writer.write().unwrap();
    let session = Session::open(&path, None).unwrap();
    let channel = session.channel(0);
    assert_eq!(channel.segment_count(), 4);
    // Channel-level Sgmt records made only the first (ephemeral
    // metadata) segment open.
    assert_eq!(channel.open_segment_count(), 1);

    let slice = TimeSlice::from_times(T0 + 3_100_000, T0 + 3_500_000);
    let request = MatrixRequestBuilder::default()
        .sampling_frequency(Some(1000.0))
        .build()
        .unwrap();
    get_matrix(&session, slice, &request).unwrap();
    // The read touched only the final segment.
    assert_eq!(channel.open_segment_count(), 2);
}

#[test]
fn sample_count_extent_mode() {
    let dir = TempDir::new().unwrap();
    let session = two_channel_session(&dir);
    let slice = TimeSlice::from_times(T0, T0 + 10_000_000 - 1);
    let request = MatrixRequestBuilder::default()
        .sample_count(Some(500))
        .build()
        .unwrap();
    let matrix = get_matrix(&session, slice, &request).unwrap();
    assert_eq!(matrix.sample_count, 500);
    assert!((matrix.sampling_frequency - 50.0).abs() < 1e-9);
}

#[test]
fn sample_counts_roll_up_across_the_hierarchy() {
    let dir = TempDir::new().unwrap();
    let mut writer = SessionWriter::new(dir.path(), "rollup");
    writer.add_channel("a", 1000.0, 1.0, "µV");
    writer
        .add_segment(
            "a",
            vec![SegmentPiece {
                start_time: T0,
                samples: sine(2_500, 1000.0, 9.0, 6_000.0),
            }],
        )
        .unwrap();
    writer
        .add_segment(
            "a",
            vec![SegmentPiece {
                start_time: T0 + 2_500_000,
                samples: sine(1_500, 1000.0, 9.0, 6_000.0),
            }],
        )
        .unwrap();
    let path = writer.write().unwrap();
    let session = Session::open(&path, None).unwrap();
    let channel = session.channel(0);

    // Per segment: the metadata sample count equals the sum of the
    // per-block counts.
    let mut engine = med_codec::CodecEngine::new();
    let mut channel_total = 0i64;
    for i in 0..channel.segment_count() {
        let segment = channel.segment(i).unwrap();
        let declared = segment.metadata.time_series().unwrap().number_of_samples;
        let mut decoded_total = 0i64;
        for b in 0..segment.block_count() {
            let block = segment.read_block(b, &mut engine).unwrap();
            assert_eq!(
                block.samples.len() as u32,
                block.header.number_of_samples
            );
            decoded_total += block.samples.len() as i64;
        }
        assert_eq!(decoded_total, declared);
        assert_eq!(segment.number_of_samples(), declared);
        channel_total += declared;
    }
    // Channel ephemeral metadata equals the segment sum.
    assert_eq!(
        channel.metadata.time_series().unwrap().number_of_samples,
        channel_total
    );
    assert_eq!(channel_total, 4_000);
}

#[test]
fn contiguons_serialize_for_export() {
    let dir = TempDir::new().unwrap();
    let session = two_channel_session(&dir);
    let mut slice = TimeSlice::from_times(T0, T0 + 10_000_000 - 1);
    session.resolve_slice(&mut slice).unwrap();
    let contiguons = session.find_discontinuities(&slice).unwrap();
    assert_eq!(contiguons.len(), 1);
    assert_eq!(contiguons[0].start_sample_number, 0);
    assert_relative_eq!(
        (contiguons[0].end_time - contiguons[0].start_time + 1) as f64 / 1e6,
        10.0,
        epsilon = 1e-3
    );
    let json = serde_json::to_string(&contiguons).unwrap();
    assert!(json.contains("start_sample_number"));
    let slice_json = serde_json::to_string(&slice).unwrap();
    assert!(slice_json.contains("start_segment_number"));
}

#[test]
fn extent_mode_is_required() {
    let dir = TempDir::new().unwrap();
    let session = two_channel_session(&dir);
    let slice = TimeSlice::from_times(T0, T0 + 1_000_000);
    let request = MatrixRequestBuilder::default().build().unwrap();
    assert!(get_matrix(&session, slice, &request).is_err());
}
