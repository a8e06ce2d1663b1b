//! The data-matrix engine: cross-channel assembly of a time slice into a
//! `channel × sample` matrix at a caller-chosen output rate.
//!
//! One worker per channel decodes the covering blocks, places the
//! samples on a time-aligned buffer at the channel's own rate, filters,
//! resamples to the output rate, and hands back its trace; traces land
//! at fixed matrix coordinates, so worker completion order never
//! matters. Discontinuities are carried as a contiguon list and,
//! optionally, padded with type-specific NaN sentinels or zeros at the
//! output rate.

use derive_builder::Builder;
use ndarray::Array2;
use rayon::prelude::*;
use tracing::warn;

use med_codec::engine::CodecEngine;
use med_codec::filt::{
    ButterworthFilter, FILTER_ORDER_DEFAULT, PAD_SAMPLES_PER_POLE, adjusted_highpass_cutoff,
    smooth_discontinuity_edges,
};
use med_codec::interp::{BinCenterMode, InterpMode, binterpolate, interpolate};
use med_core::error::{MedError, Result};
use med_core::types::{si2, si4};

use crate::channel::Channel;
use crate::context::MedContext;
use crate::session::Session;
use crate::slice::{Contiguon, TimeSlice};

/// Element type of the output matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatrixValueType {
    Si2,
    Si4,
    Sf4,
    #[default]
    Sf8,
}

/// Matrix axis order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatrixLayout {
    /// Rows are channels.
    #[default]
    ChannelMajor,
    /// Rows are samples.
    SampleMajor,
}

/// What to do about gaps in the recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscontinuityMode {
    /// Return the contiguon list only.
    #[default]
    Contiguons,
    /// Also overwrite gap cells with the type's NaN sentinel.
    NanFill,
    /// Also overwrite gap cells with zero.
    ZeroFill,
}

/// Per-channel filtering applied before resampling.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum MatrixFilter {
    #[default]
    None,
    Lowpass {
        high_cutoff: f64,
    },
    Highpass {
        low_cutoff: f64,
    },
    Bandpass {
        low_cutoff: f64,
        high_cutoff: f64,
    },
    Bandstop {
        low_cutoff: f64,
        high_cutoff: f64,
    },
    /// Lowpass with the cutoff derived from the input rate.
    Antialias,
}

/// A matrix request. Exactly one of `sample_count` and
/// `sampling_frequency` fixes the output extent.
#[derive(Debug, Clone, PartialEq, Builder)]
#[builder(default)]
pub struct MatrixRequest {
    pub value_type: MatrixValueType,
    pub layout: MatrixLayout,
    pub sample_count: Option<i64>,
    pub sampling_frequency: Option<f64>,
    /// Relative limits: the extent is interpreted against the reference
    /// channel's own rate rather than wall-clock duration.
    pub relative_limits: bool,
    /// Multiplied into every output cell.
    pub scale: Option<f64>,
    pub filter: MatrixFilter,
    pub filter_order: usize,
    pub interpolation: InterpMode,
    /// Return per-bin minima and maxima matrices.
    pub trace_ranges: bool,
    /// Return per-channel minima and maxima.
    pub trace_extrema: bool,
    pub discontinuity_mode: DiscontinuityMode,
}

impl Default for MatrixRequest {
    fn default() -> Self {
        MatrixRequest {
            value_type: MatrixValueType::default(),
            layout: MatrixLayout::default(),
            sample_count: None,
            sampling_frequency: None,
            relative_limits: false,
            scale: None,
            filter: MatrixFilter::None,
            filter_order: FILTER_ORDER_DEFAULT,
            interpolation: InterpMode::default(),
            trace_ranges: false,
            trace_extrema: false,
            discontinuity_mode: DiscontinuityMode::default(),
        }
    }
}

/// Typed matrix storage.
#[derive(Debug, Clone, PartialEq)]
pub enum MatrixData {
    Si2(Array2<i16>),
    Si4(Array2<i32>),
    Sf4(Array2<f32>),
    Sf8(Array2<f64>),
}

impl MatrixData {
    pub fn shape(&self) -> (usize, usize) {
        let shape = match self {
            MatrixData::Si2(a) => a.dim(),
            MatrixData::Si4(a) => a.dim(),
            MatrixData::Sf4(a) => a.dim(),
            MatrixData::Sf8(a) => a.dim(),
        };
        shape
    }

    /// Raw little-endian bytes of the cells, row-major. Used to compare
    /// outputs for bit-identity.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            MatrixData::Si2(a) => a.iter().flat_map(|v| v.to_le_bytes()).collect(),
            MatrixData::Si4(a) => a.iter().flat_map(|v| v.to_le_bytes()).collect(),
            MatrixData::Sf4(a) => a.iter().flat_map(|v| v.to_le_bytes()).collect(),
            MatrixData::Sf8(a) => a.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }
}

/// A populated matrix.
#[derive(Debug, Clone)]
pub struct DataMatrix {
    pub channel_count: usize,
    pub sample_count: usize,
    pub sampling_frequency: f64,
    pub channel_names: Vec<String>,
    pub slice: TimeSlice,
    pub data: MatrixData,
    pub range_minima: Option<MatrixData>,
    pub range_maxima: Option<MatrixData>,
    pub trace_minima: Option<Vec<f64>>,
    pub trace_maxima: Option<Vec<f64>>,
    pub contiguons: Vec<Contiguon>,
}

struct ChannelTrace {
    samples: Vec<f64>,
    bin_minima: Option<Vec<f64>>,
    bin_maxima: Option<Vec<f64>>,
    /// Gap runs at the output rate.
    gaps: Vec<std::ops::Range<usize>>,
}

/// Assemble a matrix for a slice of a session.
pub fn get_matrix(
    session: &Session,
    slice: TimeSlice,
    request: &MatrixRequest,
) -> Result<DataMatrix> {
    let mut slice = slice;
    session.resolve_slice(&mut slice)?;

    let duration_seconds = slice.duration() as f64 / 1e6;
    let reference_frequency = session.reference().sampling_frequency();
    let (sample_count, sampling_frequency) =
        match (request.sample_count, request.sampling_frequency) {
            (Some(count), None) => {
                if count <= 0 {
                    return Err(MedError::parameter("sample count must be positive"));
                }
                let frequency = if request.relative_limits {
                    reference_frequency
                } else {
                    count as f64 / duration_seconds
                };
                (count as usize, frequency)
            }
            (None, Some(frequency)) => {
                if frequency <= 0.0 {
                    return Err(MedError::parameter("output frequency must be positive"));
                }
                ((duration_seconds * frequency).round().max(1.0) as usize, frequency)
            }
            _ => {
                return Err(MedError::parameter(
                    "exactly one of sample_count and sampling_frequency must be set",
                ));
            }
        };

    let contiguons = session.find_discontinuities(&slice)?;

    let traces: Vec<Result<ChannelTrace>> = session
        .time_series_channels
        .par_iter()
        .map(|channel| {
            channel_trace(
                channel,
                &session.context,
                &slice,
                sample_count,
                sampling_frequency,
                request,
            )
        })
        .collect();

    let channel_count = traces.len();
    let mut data = Array2::<f64>::zeros((channel_count, sample_count));
    let mut range_minima = request
        .trace_ranges
        .then(|| Array2::<f64>::zeros((channel_count, sample_count)));
    let mut range_maxima = range_minima.clone();
    let mut gap_cells: Vec<Vec<std::ops::Range<usize>>> = Vec::with_capacity(channel_count);

    for (row, trace) in traces.into_iter().enumerate() {
        let trace = trace?;
        for (col, &v) in trace.samples.iter().enumerate() {
            data[[row, col]] = v;
        }
        if let (Some(minima), Some(min_trace)) = (&mut range_minima, &trace.bin_minima) {
            for (col, &v) in min_trace.iter().enumerate() {
                minima[[row, col]] = v;
            }
        }
        if let (Some(maxima), Some(max_trace)) = (&mut range_maxima, &trace.bin_maxima) {
            for (col, &v) in max_trace.iter().enumerate() {
                maxima[[row, col]] = v;
            }
        }
        gap_cells.push(trace.gaps);
    }

    // Discontinuity padding at the output rate.
    let fill = match request.discontinuity_mode {
        DiscontinuityMode::Contiguons => None,
        DiscontinuityMode::NanFill => Some(f64::NAN),
        DiscontinuityMode::ZeroFill => Some(0.0),
    };
    if let Some(fill) = fill {
        for (row, gaps) in gap_cells.iter().enumerate() {
            for gap in gaps {
                for col in gap.clone() {
                    if col < sample_count {
                        data[[row, col]] = fill;
                        if let Some(minima) = &mut range_minima {
                            minima[[row, col]] = fill;
                        }
                        if let Some(maxima) = &mut range_maxima {
                            maxima[[row, col]] = fill;
                        }
                    }
                }
            }
        }
    }

    let (trace_minima, trace_maxima) = if request.trace_extrema {
        let mut minima = Vec::with_capacity(channel_count);
        let mut maxima = Vec::with_capacity(channel_count);
        for row in 0..channel_count {
            let mut lo = f64::INFINITY;
            let mut hi = f64::NEG_INFINITY;
            for col in 0..sample_count {
                let v = data[[row, col]];
                if v.is_nan() {
                    continue;
                }
                lo = lo.min(v);
                hi = hi.max(v);
            }
            minima.push(lo);
            maxima.push(hi);
        }
        (Some(minima), Some(maxima))
    } else {
        (None, None)
    };

    Ok(DataMatrix {
        channel_count,
        sample_count,
        sampling_frequency,
        channel_names: session
            .time_series_channels
            .iter()
            .map(|c| c.name.clone())
            .collect(),
        slice,
        data: typed(data, request.value_type, request.layout),
        range_minima: range_minima.map(|a| typed(a, request.value_type, request.layout)),
        range_maxima: range_maxima.map(|a| typed(a, request.value_type, request.layout)),
        trace_minima,
        trace_maxima,
        contiguons,
    })
}

// One channel's work: decode, align, filter, resample.
fn channel_trace(
    channel: &Channel,
    context: &MedContext,
    slice: &TimeSlice,
    sample_count: usize,
    sampling_frequency: f64,
    request: &MatrixRequest,
) -> Result<ChannelTrace> {
    let channel_frequency = channel.sampling_frequency();
    let duration_seconds = slice.duration() as f64 / 1e6;
    let channel_samples = ((duration_seconds * channel_frequency).round() as usize).max(1);

    let mut engine = CodecEngine::new();
    engine.crc_mode = context.crc_mode;
    for level in [1i8, 2] {
        if let Some(key) = context.password.key_for_level(level) {
            engine.set_key(level, *key)?;
        }
    }

    let blocks = channel.read_blocks_in_range(slice.start_time, slice.end_time, &mut engine)?;
    let units = channel.amplitude_units_conversion_factor();
    let units = if engine.directives.convert_to_native_units && units != 0.0 {
        units
    } else {
        1.0
    };

    // Place decoded samples on the channel-rate timeline; unwritten
    // cells are gaps.
    let mut aligned = vec![f64::NAN; channel_samples];
    for block in &blocks {
        let position = ((block.header.start_time - slice.start_time) as f64 * channel_frequency
            / 1e6)
            .round() as i64;
        for (i, &v) in block.samples.iter().enumerate() {
            let p = position + i as i64;
            if (0..channel_samples as i64).contains(&p) {
                aligned[p as usize] = f64::from(v) * units;
            }
        }
    }

    let channel_gaps = nan_runs(&aligned);
    bridge_gaps(&mut aligned);

    // Filtering at the channel rate.
    let filter = match request.filter {
        MatrixFilter::None => None,
        MatrixFilter::Lowpass { high_cutoff } => Some(ButterworthFilter::lowpass(
            request.filter_order,
            channel_frequency,
            high_cutoff,
        )?),
        MatrixFilter::Highpass { low_cutoff } => {
            let cutoff =
                adjusted_highpass_cutoff(low_cutoff, channel_frequency, aligned.len());
            Some(ButterworthFilter::highpass(
                request.filter_order,
                channel_frequency,
                cutoff,
            )?)
        }
        MatrixFilter::Bandpass {
            low_cutoff,
            high_cutoff,
        } => Some(ButterworthFilter::bandpass(
            request.filter_order,
            channel_frequency,
            low_cutoff,
            high_cutoff,
        )?),
        MatrixFilter::Bandstop {
            low_cutoff,
            high_cutoff,
        } => Some(ButterworthFilter::bandstop(
            request.filter_order,
            channel_frequency,
            low_cutoff,
            high_cutoff,
        )?),
        MatrixFilter::Antialias => Some(ButterworthFilter::antialias(
            request.filter_order,
            channel_frequency,
            sampling_frequency,
        )?),
    };
    if let Some(filter) = filter {
        if aligned.len() > filter.pad_samples() {
            // Soften the kinks the gap bridges leave at contiguon edges
            // before the filter pad sees them.
            if !channel_gaps.is_empty() {
                let boundaries: Vec<usize> = channel_gaps
                    .iter()
                    .flat_map(|gap| [gap.start, gap.end])
                    .filter(|&edge| edge > 0 && edge < aligned.len())
                    .collect();
                smooth_discontinuity_edges(&mut aligned, &boundaries, PAD_SAMPLES_PER_POLE);
            }
            aligned = filter.filtfilt(&aligned)?;
        } else {
            warn!(
                channel = %channel.name,
                samples = aligned.len(),
                "slice too short to filter; skipping"
            );
        }
    }

    // Resample to the output rate.
    let (samples, bin_minima, bin_maxima) = match request.interpolation {
        InterpMode::Binterp(center) => {
            let (out, minima, maxima) = binterpolate(&aligned, sample_count, center);
            (out, Some(minima), Some(maxima))
        }
        mode => {
            let out = interpolate(&aligned, sample_count, mode)?;
            if request.trace_ranges {
                let (_, minima, maxima) =
                    binterpolate(&aligned, sample_count, BinCenterMode::Midpoint);
                (out, Some(minima), Some(maxima))
            } else {
                (out, None, None)
            }
        }
    };
    let mut samples = samples;
    let (mut bin_minima, mut bin_maxima) = (bin_minima, bin_maxima);
    if let Some(scale) = request.scale {
        for v in &mut samples {
            *v *= scale;
        }
        for bounds in [&mut bin_minima, &mut bin_maxima].into_iter().flatten() {
            for v in bounds {
                *v *= scale;
            }
        }
    }

    // Gap runs mapped to output coordinates.
    let ratio = sampling_frequency / channel_frequency;
    let gaps = channel_gaps
        .into_iter()
        .map(|run| {
            let start = (run.start as f64 * ratio).round() as usize;
            let end = (run.end as f64 * ratio).round() as usize;
            start..end.min(sample_count)
        })
        .filter(|run| !run.is_empty())
        .collect();

    Ok(ChannelTrace {
        samples,
        bin_minima,
        bin_maxima,
        gaps,
    })
}

// Maximal runs of NaN cells.
fn nan_runs(data: &[f64]) -> Vec<std::ops::Range<usize>> {
    let mut runs = Vec::new();
    let mut start = None;
    for (i, v) in data.iter().enumerate() {
        match (v.is_nan(), start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                runs.push(s..i);
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        runs.push(s..data.len());
    }
    runs
}

// Replace NaN runs with a linear bridge so filtering and resampling see
// finite values; gap cells are re-marked afterwards.
fn bridge_gaps(data: &mut [f64]) {
    let runs = nan_runs(data);
    for run in runs {
        let left = run.start.checked_sub(1).map(|i| data[i]);
        let right = data.get(run.end).copied();
        match (left, right) {
            (Some(l), Some(r)) => {
                let span = (run.len() + 1) as f64;
                for (k, i) in run.clone().enumerate() {
                    data[i] = l + (r - l) * (k + 1) as f64 / span;
                }
            }
            (Some(l), None) => {
                for i in run.clone() {
                    data[i] = l;
                }
            }
            (None, Some(r)) => {
                for i in run.clone() {
                    data[i] = r;
                }
            }
            (None, None) => {
                for i in run.clone() {
                    data[i] = 0.0;
                }
            }
        }
    }
}

// Convert to the requested element type and layout, clamping to the
// reserved sample values.
fn typed(data: Array2<f64>, value_type: MatrixValueType, layout: MatrixLayout) -> MatrixData {
    let data = match layout {
        MatrixLayout::ChannelMajor => data,
        MatrixLayout::SampleMajor => data.reversed_axes().as_standard_layout().to_owned(),
    };
    match value_type {
        MatrixValueType::Sf8 => MatrixData::Sf8(data),
        MatrixValueType::Sf4 => MatrixData::Sf4(data.mapv(|v| v as f32)),
        MatrixValueType::Si4 => MatrixData::Si4(data.mapv(|v| {
            if v.is_nan() {
                si4::NAN
            } else if v >= f64::from(si4::POS_INF) {
                si4::POS_INF
            } else if v <= f64::from(si4::NEG_INF) {
                si4::NEG_INF
            } else {
                v.round() as i32
            }
        })),
        MatrixValueType::Si2 => MatrixData::Si2(data.mapv(|v| {
            if v.is_nan() {
                si2::NAN
            } else if v >= f64::from(si2::POS_INF) {
                si2::POS_INF
            } else if v <= f64::from(si2::NEG_INF) {
                si2::NEG_INF
            } else {
                v.round() as i16
            }
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nan_runs_are_maximal() {
        let data = [1.0, f64::NAN, f64::NAN, 2.0, f64::NAN];
        let runs = nan_runs(&data);
        assert_eq!(runs, vec![1..3, 4..5]);
    }

    #[test]
    fn bridge_interpolates_interior_gaps() {
        let mut data = [0.0, f64::NAN, f64::NAN, f64::NAN, 4.0];
        bridge_gaps(&mut data);
        assert_eq!(data, [0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn bridge_extends_edges() {
        let mut data = [f64::NAN, 5.0, f64::NAN];
        bridge_gaps(&mut data);
        assert_eq!(data, [5.0, 5.0, 5.0]);
    }

    #[test]
    fn sentinel_clamping() {
        let data = Array2::from_shape_vec(
            (1, 4),
            vec![f64::NAN, 1e12, -1e12, 7.4],
        )
        .unwrap();
        let MatrixData::Si4(out) = typed(data, MatrixValueType::Si4, MatrixLayout::ChannelMajor)
        else {
            panic!("wrong type");
        };
        assert_eq!(out[[0, 0]], si4::NAN);
        assert_eq!(out[[0, 1]], si4::POS_INF);
        assert_eq!(out[[0, 2]], si4::NEG_INF);
        assert_eq!(out[[0, 3]], 7);
    }

    #[test]
    fn builder_defaults_and_validation() {
        let request = MatrixRequestBuilder::default()
            .sampling_frequency(Some(250.0))
            .value_type(MatrixValueType::Sf4)
            .build()
            .unwrap();
        assert_eq!(request.value_type, MatrixValueType::Sf4);
        assert_eq!(request.layout, MatrixLayout::ChannelMajor);
        assert!(request.sample_count.is_none());
    }
}
