//! One time-series segment: a metadata file, a data file of compressed
//! blocks, an index file, and optional segment-level records.

use std::ops::Range;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use med_codec::engine::{CodecEngine, DecodedBlock};
use med_core::error::{MedError, Result};
use med_core::metadata::{self, Metadata};
use med_core::record::{SgmtRecord, TimeSeriesIndexEntry};
use med_core::types::FileTypeCode;
use med_core::universal_header::{UNIVERSAL_HEADER_BYTES, UniversalHeader};

use crate::context::MedContext;
use crate::fps::{Fps, FpsDirectives};
use crate::records::RecordSet;

static SEGMENT_DIR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<name>.+)-(?P<number>\d{4})\.tisd$").expect("static pattern"));

/// A parsed segment directory name.
pub fn parse_segment_dir_name(dir: &Path) -> Option<(String, i32)> {
    let file_name = dir.file_name()?.to_str()?;
    let captures = SEGMENT_DIR_PATTERN.captures(file_name)?;
    let name = captures["name"].to_owned();
    let number = captures["number"].parse().ok()?;
    Some((name, number))
}

/// One open time-series segment.
#[derive(Debug)]
pub struct Segment {
    pub name: String,
    pub number: i32,
    pub directory: PathBuf,
    pub universal_header: UniversalHeader,
    pub metadata: Metadata,
    /// Whether the password unlocked section 3 of the metadata.
    pub section_3_readable: bool,
    /// All index entries, terminal sentinel included as the last entry.
    pub indices: Vec<TimeSeriesIndexEntry>,
    data_fps: Fps,
    pub records: Option<RecordSet>,
}

impl Segment {
    /// Open a `.tisd` directory.
    pub fn open(directory: &Path, context: &MedContext) -> Result<Segment> {
        let (name, number) = parse_segment_dir_name(directory).ok_or_else(|| MedError::NotMed {
            path: directory.to_owned(),
            detail: "not a time-series segment directory name".into(),
        })?;
        let base = format!("{name}-{number:04}");

        // Metadata.
        let metadata_path = directory.join(format!("{base}.tmet"));
        if !metadata_path.exists() {
            return Err(MedError::NoMetadata {
                path: directory.to_owned(),
            });
        }
        let metadata_fps = Fps::open_read(&metadata_path, context, FpsDirectives::default())?;
        let mut payload = metadata_fps.read_body(context.crc_mode.validate_on_input)?;
        if payload.len() != metadata::METADATA_BYTES {
            return Err(MedError::NotMed {
                path: metadata_path.clone(),
                detail: format!("metadata payload is {} bytes", payload.len()),
            });
        }
        let (section_2_readable, section_3_readable) =
            metadata::decrypt_sections(&mut payload, &context.password);
        if !section_2_readable {
            // Without section 2 there is no sampling frequency; surface
            // the stored hint so the caller can reprompt.
            let hint = med_core::text::read_fixed_utf8(&payload[0..256]).ok().filter(|h| !h.is_empty());
            return Err(MedError::BadPassword { hint });
        }
        if !section_3_readable {
            // Section 3 stays ciphertext; blank it so parsing yields an
            // empty section rather than garbage.
            payload[metadata::SECTION_3_OFFSET..].fill(0);
        }
        let metadata = Metadata::from_payload(&payload, FileTypeCode::TimeSeriesMetadata)?;

        // Indices.
        let index_path = directory.join(format!("{base}.tidx"));
        let index_fps = Fps::open_read(&index_path, context, FpsDirectives::default())?;
        let index_body = index_fps.read_body(context.crc_mode.validate_on_input)?;
        let indices: Vec<TimeSeriesIndexEntry> = index_body
            .chunks_exact(24)
            .map(TimeSeriesIndexEntry::from_bytes)
            .collect();
        if indices.len() < 2 {
            return Err(MedError::NotMed {
                path: index_path,
                detail: "index file has no entries".into(),
            });
        }

        // Data file; blocks are read on demand.
        let data_path = directory.join(format!("{base}.tdat"));
        let data_fps = Fps::open_read(&data_path, context, FpsDirectives::default())?;

        let records = RecordSet::open(directory, &base, context)?;

        debug!(segment = number, blocks = indices.len() - 1, "opened segment");
        Ok(Segment {
            name,
            number,
            directory: directory.to_owned(),
            universal_header: metadata_fps.universal_header.clone(),
            metadata,
            section_3_readable,
            indices,
            data_fps,
            records,
        })
    }

    pub fn block_count(&self) -> usize {
        self.indices.len() - 1
    }

    pub fn sampling_frequency(&self) -> f64 {
        self.metadata
            .section_2
            .as_time_series()
            .map(|s2| s2.sampling_frequency)
            .unwrap_or(med_core::types::FREQUENCY_NO_ENTRY)
    }

    /// Session-relative sample number of this segment's first sample.
    pub fn absolute_start_sample_number(&self) -> i64 {
        self.metadata
            .section_2
            .as_time_series()
            .map(|s2| s2.absolute_start_sample_number)
            .unwrap_or(med_core::types::SAMPLE_NUMBER_NO_ENTRY)
    }

    pub fn number_of_samples(&self) -> i64 {
        self.indices[self.indices.len() - 1].start_sample_number
    }

    pub fn start_time(&self) -> i64 {
        self.indices[0].start_time
    }

    /// Inclusive end time (terminal index entry).
    pub fn end_time(&self) -> i64 {
        self.indices[self.indices.len() - 1].start_time
    }

    /// Synthesize this segment's `Sgmt` record.
    pub fn sgmt_record(&self) -> SgmtRecord {
        let start = self.absolute_start_sample_number();
        SgmtRecord {
            start_time: self.start_time(),
            end_time: self.end_time(),
            start_sample_number: start,
            end_sample_number: start + self.number_of_samples() - 1,
            segment_uid: self.universal_header.segment_uid,
            segment_number: self.number,
            acquisition_channel_number: self
                .metadata
                .section_2
                .as_time_series()
                .map(|s2| s2.acquisition_channel_number)
                .unwrap_or(med_core::types::CHANNEL_NUMBER_NO_ENTRY),
            sampling_frequency: self.sampling_frequency(),
        }
    }

    /// Decode one block by index.
    pub fn read_block(&self, block: usize, engine: &mut CodecEngine) -> Result<DecodedBlock> {
        if block >= self.block_count() {
            return Err(MedError::parameter(format!(
                "block {block} of {}",
                self.block_count()
            )));
        }
        let entry = self.indices[block];
        let next = self.indices[block + 1];
        let length = next
            .file_offset
            .checked_sub(entry.file_offset)
            .ok_or_else(|| MedError::decode("index offsets are not monotonic"))?
            as usize;
        let bytes = self.data_fps.read_range(entry.file_offset, length)?;
        let decoded = engine.decode_block(&bytes).map_err(|e| match e {
            // Rebase block-relative CRC offsets onto the file.
            MedError::CrcMismatch { offset, .. } => {
                self.data_fps
                    .log_crc_outcome(entry.file_offset, length as u64, false);
                MedError::CrcMismatch {
                    path: self.data_fps.path().to_owned(),
                    offset: entry.file_offset + offset,
                }
            }
            other => other,
        })?;
        Ok(decoded)
    }

    /// Indices of the blocks whose spans intersect `[start_time,
    /// end_time]`.
    pub fn blocks_in_time_range(&self, start_time: i64, end_time: i64) -> Range<usize> {
        let n = self.block_count();
        if end_time < self.start_time() || start_time > self.end_time() || n == 0 {
            return 0..0;
        }
        // Block i spans [indices[i].start_time, indices[i + 1].start_time).
        let first = self.indices[..n]
            .partition_point(|e| e.start_time <= start_time)
            .saturating_sub(1);
        let last = self.indices[..n]
            .partition_point(|e| e.start_time <= end_time)
            .saturating_sub(1);
        first..(last + 1).min(n)
    }

    /// Offset of the first data byte (for diagnostics).
    pub fn data_start_offset(&self) -> u64 {
        UNIVERSAL_HEADER_BYTES as u64
    }

    pub fn data_path(&self) -> &Path {
        self.data_fps.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_dir_names_parse() {
        assert_eq!(
            parse_segment_dir_name(Path::new("/s/ch.ticd/ch-0001.tisd")),
            Some(("ch".into(), 1))
        );
        assert_eq!(
            parse_segment_dir_name(Path::new("ab-cd-0123.tisd")),
            Some(("ab-cd".into(), 123))
        );
        assert_eq!(parse_segment_dir_name(Path::new("ch-1.tisd")), None);
        assert_eq!(parse_segment_dir_name(Path::new("ch-0001.visd")), None);
    }
}
