//! Channel aggregates: the segments of one recorded signal, its `Sgmt`
//! array, ephemeral metadata, and channel-level records.
//!
//! Segments open lazily: a channel holding channel-level `Sgmt` records
//! resolves slices without touching segment files, and a slice read
//! opens only the segments it intersects. The first segment always opens
//! eagerly — ephemeral metadata needs its recording parameters.

use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing::debug;

use med_codec::engine::{CodecEngine, DecodedBlock};
use med_core::error::{MedError, Result};
use med_core::metadata::{Metadata, MetadataSection2};
use med_core::record::SgmtRecord;
use med_core::types::FileTypeCode;

use crate::context::MedContext;
use crate::records::RecordSet;
use crate::segment::{Segment, parse_segment_dir_name};
use crate::slice::{Contiguon, SgmtIndex, TimeSlice};

/// What a channel records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    TimeSeries,
    Video,
}

/// One time-series channel.
#[derive(Debug)]
pub struct Channel {
    pub name: String,
    pub directory: PathBuf,
    pub kind: ChannelKind,
    context: MedContext,
    segment_dirs: Vec<PathBuf>,
    segments: Vec<OnceCell<Segment>>,
    /// One entry per segment, session-relative sample spans.
    pub sgmt_records: Vec<SgmtRecord>,
    /// Ephemeral: synthesized from the segments, never written back.
    pub metadata: Metadata,
    pub records: Option<RecordSet>,
}

impl Channel {
    /// Open a `.ticd` channel directory.
    pub fn open(directory: &Path, context: &MedContext) -> Result<Channel> {
        let name = directory
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| MedError::NotMed {
                path: directory.to_owned(),
                detail: "unreadable channel directory name".into(),
            })?
            .to_owned();

        // Discover segment directories, sorted by number, and check the
        // numbering is contiguous from 1.
        let mut segment_dirs: Vec<(i32, PathBuf)> = std::fs::read_dir(directory)?
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                let (_, number) = parse_segment_dir_name(&path)?;
                Some((number, path))
            })
            .collect();
        segment_dirs.sort_by_key(|(number, _)| *number);
        if segment_dirs.is_empty() {
            return Err(MedError::NotMed {
                path: directory.to_owned(),
                detail: "channel has no segments".into(),
            });
        }
        for (i, (number, path)) in segment_dirs.iter().enumerate() {
            if *number != i as i32 + 1 {
                return Err(MedError::NotMed {
                    path: path.clone(),
                    detail: format!("segment numbering gap at {number}"),
                });
            }
        }
        let segment_dirs: Vec<PathBuf> = segment_dirs.into_iter().map(|(_, p)| p).collect();

        let records = RecordSet::open(directory, &name, context)?;

        let segments: Vec<OnceCell<Segment>> =
            (0..segment_dirs.len()).map(|_| OnceCell::new()).collect();
        let mut channel = Channel {
            name,
            directory: directory.to_owned(),
            kind: ChannelKind::TimeSeries,
            context: context.clone(),
            segment_dirs,
            segments,
            sgmt_records: Vec::new(),
            metadata: Metadata::new_time_series(),
            records,
        };

        // The Sgmt array: channel-level records when present, otherwise
        // synthesized by opening every segment. Records locked above the
        // granted access level fall back to the segment scan, whose
        // failure carries the password hint.
        let from_records = match &channel.records {
            Some(set) => match set.sgmt_records(context) {
                Ok(records) => records,
                Err(MedError::BadPassword { .. }) => Vec::new(),
                Err(e) => return Err(e),
            },
            None => Vec::new(),
        };
        channel.sgmt_records = if from_records.len() == channel.segment_dirs.len() {
            from_records
        } else {
            let mut synthesized = Vec::with_capacity(channel.segment_dirs.len());
            for i in 0..channel.segment_dirs.len() {
                synthesized.push(channel.segment(i)?.sgmt_record());
            }
            synthesized
        };

        channel.metadata = channel.synthesize_metadata()?;
        debug!(
            channel = %channel.name,
            segments = channel.segment_dirs.len(),
            "opened channel"
        );
        Ok(channel)
    }

    pub fn segment_count(&self) -> usize {
        self.segment_dirs.len()
    }

    /// The segment at `index` (zero-based), opening it on first touch.
    pub fn segment(&self, index: usize) -> Result<&Segment> {
        self.segments[index].get_or_try_init(|| Segment::open(&self.segment_dirs[index], &self.context))
    }

    /// Number of segments currently open (for tests and diagnostics).
    pub fn open_segment_count(&self) -> usize {
        self.segments.iter().filter(|cell| cell.get().is_some()).count()
    }

    pub fn sampling_frequency(&self) -> f64 {
        self.sgmt_records
            .first()
            .map(|r| r.sampling_frequency)
            .unwrap_or(med_core::types::FREQUENCY_NO_ENTRY)
    }

    pub fn sgmt_index(&self) -> SgmtIndex<'_> {
        SgmtIndex::new(&self.sgmt_records)
    }

    /// The metadata amplitude-units conversion factor.
    pub fn amplitude_units_conversion_factor(&self) -> f64 {
        self.metadata
            .section_2
            .as_time_series()
            .map(|s2| s2.amplitude_units_conversion_factor)
            .unwrap_or(1.0)
    }

    // Ephemeral channel metadata from the first segment plus the Sgmt
    // array.
    fn synthesize_metadata(&self) -> Result<Metadata> {
        let first = self.segment(0)?;
        let mut metadata = first.metadata.clone();
        if let MetadataSection2::TimeSeries(s2) = &mut metadata.section_2 {
            s2.absolute_start_sample_number = self
                .sgmt_records
                .first()
                .map(|r| r.start_sample_number)
                .unwrap_or(0);
            s2.number_of_samples = self.sgmt_records.iter().map(|r| r.sample_count()).sum();
            // Block statistics only roll up across the segments that are
            // open; the rest stay at their first-segment values.
            let open: Vec<&Segment> = self
                .segments
                .iter()
                .filter_map(|cell| cell.get())
                .collect();
            if open.len() == self.segment_dirs.len() {
                s2.number_of_blocks = open.iter().map(|s| s.block_count() as i64).sum();
                s2.number_of_discontinuities = open
                    .iter()
                    .flat_map(|s| s.indices[..s.block_count()].iter())
                    .filter(|e| e.discontinuity)
                    .count() as i64;
            }
            s2.segment_description = String::new();
        }
        Ok(metadata)
    }

    /// Decode every block intersecting `[start_time, end_time]`, in file
    /// order across the intersecting segments.
    pub fn read_blocks_in_range(
        &self,
        start_time: i64,
        end_time: i64,
        engine: &mut CodecEngine,
    ) -> Result<Vec<DecodedBlock>> {
        let mut blocks = Vec::new();
        for (i, record) in self.sgmt_records.iter().enumerate() {
            if record.end_time < start_time || record.start_time > end_time {
                continue;
            }
            let segment = self.segment(i)?;
            for block in segment.blocks_in_time_range(start_time, end_time) {
                blocks.push(segment.read_block(block, engine)?);
            }
        }
        Ok(blocks)
    }

    /// Contiguon discovery over a resolved slice: scan the intersecting
    /// segments' indices for discontinuity marks.
    pub fn contiguons(&self, slice: &TimeSlice) -> Result<Vec<Contiguon>> {
        let mut contiguons: Vec<Contiguon> = Vec::new();
        let mut current: Option<Contiguon> = None;

        for (i, record) in self.sgmt_records.iter().enumerate() {
            if record.end_time < slice.start_time || record.start_time > slice.end_time {
                continue;
            }
            let segment = self.segment(i)?;
            let period = 1e6 / record.sampling_frequency;
            for b in segment.blocks_in_time_range(slice.start_time, slice.end_time) {
                let entry = segment.indices[b];
                let next = segment.indices[b + 1];
                // The terminal entry closes the last block's sample span.
                let block_samples = next.start_sample_number - entry.start_sample_number;
                let block_start_abs =
                    record.start_sample_number + entry.start_sample_number;
                let block_end_abs = block_start_abs + block_samples - 1;
                // A block's span ends at its own last sample period, not
                // at the next block's start: the two differ across gaps.
                let block_end_time =
                    entry.start_time + (block_samples as f64 * period).round() as i64 - 1;
                if entry.discontinuity {
                    if let Some(done) = current.take() {
                        contiguons.push(done);
                    }
                }
                match &mut current {
                    Some(span) => {
                        span.end_time = block_end_time;
                        span.end_sample_number = block_end_abs;
                        span.end_segment_number = record.segment_number;
                    }
                    None => {
                        current = Some(Contiguon {
                            start_time: entry.start_time,
                            end_time: block_end_time,
                            start_sample_number: block_start_abs,
                            end_sample_number: block_end_abs,
                            start_segment_number: record.segment_number,
                            end_segment_number: record.segment_number,
                        });
                    }
                }
            }
        }
        if let Some(done) = current.take() {
            contiguons.push(done);
        }

        // Clip to the slice bounds.
        for span in &mut contiguons {
            if span.start_time < slice.start_time {
                span.start_time = slice.start_time;
                span.start_sample_number = span.start_sample_number.max(slice.start_sample_number);
            }
            if span.end_time > slice.end_time {
                span.end_time = slice.end_time;
                span.end_sample_number = span.end_sample_number.min(slice.end_sample_number);
            }
        }
        contiguons.retain(|span| span.start_time <= span.end_time);
        Ok(contiguons)
    }
}

/// A video channel: discovery, index entries, and ephemeral metadata —
/// the core does not decode video payloads.
#[derive(Debug)]
pub struct VideoChannel {
    pub name: String,
    pub directory: PathBuf,
    pub segment_count: usize,
    pub metadata: Option<Metadata>,
    /// Clip index entries of the first segment, terminal excluded.
    pub indices: Vec<med_core::record::VideoIndexEntry>,
}

impl VideoChannel {
    pub fn open(directory: &Path, context: &MedContext) -> Result<VideoChannel> {
        let name = directory
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_owned();
        let mut segment_dirs: Vec<PathBuf> = std::fs::read_dir(directory)?
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                let is_video_segment = path
                    .extension()
                    .map(|e| e == "visd")
                    .unwrap_or(false);
                is_video_segment.then_some(path)
            })
            .collect();
        segment_dirs.sort();

        // Ephemeral metadata and clip indices from the first segment,
        // as far as they are readable.
        let mut metadata = None;
        let mut indices = Vec::new();
        if let Some(seg_dir) = segment_dirs.first() {
            if let Some(base) = seg_dir.file_stem().and_then(|s| s.to_str()) {
                let vmet = seg_dir.join(format!("{base}.vmet"));
                metadata = crate::fps::Fps::open_read(&vmet, context, Default::default())
                    .ok()
                    .and_then(|fps| fps.read_body(false).ok())
                    .and_then(|mut payload| {
                        med_core::metadata::decrypt_sections(&mut payload, &context.password);
                        Metadata::from_payload(&payload, FileTypeCode::VideoMetadata).ok()
                    });
                let vidx = seg_dir.join(format!("{base}.vidx"));
                if let Ok(fps) =
                    crate::fps::Fps::open_read(&vidx, context, Default::default())
                {
                    let body = fps.read_body(context.crc_mode.validate_on_input)?;
                    indices = body
                        .chunks_exact(24)
                        .map(med_core::record::VideoIndexEntry::from_bytes)
                        .collect();
                    indices.pop();
                }
            }
        }

        Ok(VideoChannel {
            name,
            directory: directory.to_owned(),
            segment_count: segment_dirs.len(),
            metadata,
            indices,
        })
    }
}
