//! Authoring MED sessions: channels, segments, compressed data blocks,
//! indices, metadata, and `Sgmt` record files, with universal-header
//! bookkeeping refreshed at close.

use std::path::{Path, PathBuf};

use tracing::info;

use med_codec::block::Algorithm;
use med_codec::engine::{BlockMeta, CodecDirectives, CodecEngine};
use med_core::crc::crc as crc32;
use med_core::error::{MedError, Result};
use med_core::metadata::{self, Metadata, MetadataSection2};
use med_core::password::{PasswordData, build_validation_fields};
use med_core::record::{
    RECORD_CRC_START_OFFSET, RECORD_HEADER_BYTES, RecordHeader, RecordIndexEntry, SgmtRecord,
    TimeSeriesIndexEntry,
};
use med_core::types::{CHANNEL_NUMBER_ALL_CHANNELS, FREQUENCY_VARIABLE, FileTypeCode, LevelCode, SGMT_TYPE_CODE, Uid};
use med_core::universal_header::UniversalHeader;

use crate::fps::{Fps, FpsDirectives};

/// One contiguous run of samples; a new piece after the first in a
/// segment records a discontinuity.
#[derive(Debug, Clone)]
pub struct SegmentPiece {
    pub start_time: i64,
    pub samples: Vec<i32>,
}

#[derive(Debug, Clone)]
struct ChannelSpec {
    name: String,
    sampling_frequency: f64,
    amplitude_units_conversion_factor: f64,
    amplitude_units_description: String,
    acquisition_channel_number: i32,
    segments: Vec<Vec<SegmentPiece>>,
}

/// Builds a complete `.medd` session directory.
#[derive(Debug)]
pub struct SessionWriter {
    parent: PathBuf,
    session_name: String,
    passwords: Option<PasswordSpec>,
    data_encryption_level: i8,
    block_samples: usize,
    algorithm: Algorithm,
    channels: Vec<ChannelSpec>,
}

#[derive(Debug, Clone)]
struct PasswordSpec {
    level_1: String,
    level_2: String,
    level_1_hint: String,
    level_2_hint: String,
}

impl SessionWriter {
    pub fn new(parent: &Path, session_name: &str) -> Self {
        SessionWriter {
            parent: parent.to_owned(),
            session_name: session_name.to_owned(),
            passwords: None,
            data_encryption_level: 0,
            block_samples: 1000,
            algorithm: Algorithm::Pred2,
            channels: Vec::new(),
        }
    }

    /// Protect the session: metadata section 2 at level 1, section 3 at
    /// level 2, `Sgmt` records at level 1.
    pub fn with_passwords(
        mut self,
        level_1: &str,
        level_2: &str,
        level_1_hint: &str,
        level_2_hint: &str,
    ) -> Self {
        self.passwords = Some(PasswordSpec {
            level_1: level_1.to_owned(),
            level_2: level_2.to_owned(),
            level_1_hint: level_1_hint.to_owned(),
            level_2_hint: level_2_hint.to_owned(),
        });
        self
    }

    /// Also encrypt the time-series data blocks (1 or 2). Requires
    /// passwords.
    pub fn with_data_encryption(mut self, level: i8) -> Self {
        self.data_encryption_level = level;
        self
    }

    pub fn with_block_samples(mut self, block_samples: usize) -> Self {
        self.block_samples = block_samples.max(1);
        self
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn add_channel(
        &mut self,
        name: &str,
        sampling_frequency: f64,
        amplitude_units_conversion_factor: f64,
        amplitude_units_description: &str,
    ) -> &mut Self {
        self.channels.push(ChannelSpec {
            name: name.to_owned(),
            sampling_frequency,
            amplitude_units_conversion_factor,
            amplitude_units_description: amplitude_units_description.to_owned(),
            acquisition_channel_number: self.channels.len() as i32 + 1,
            segments: Vec::new(),
        });
        self
    }

    /// Append one segment of one or more contiguous pieces to a channel.
    pub fn add_segment(&mut self, channel: &str, pieces: Vec<SegmentPiece>) -> Result<&mut Self> {
        if pieces.is_empty() || pieces.iter().any(|p| p.samples.is_empty()) {
            return Err(MedError::parameter("a segment needs non-empty pieces"));
        }
        let spec = self
            .channels
            .iter_mut()
            .find(|c| c.name == channel)
            .ok_or_else(|| MedError::parameter(format!("unknown channel {channel}")))?;
        spec.segments.push(pieces);
        Ok(self)
    }

    /// Write the session; returns the `.medd` directory path.
    pub fn write(&self) -> Result<PathBuf> {
        if self.channels.is_empty() || self.channels.iter().any(|c| c.segments.is_empty()) {
            return Err(MedError::parameter("every channel needs at least one segment"));
        }
        let session_dir = self.parent.join(format!("{}.medd", self.session_name));
        std::fs::create_dir_all(&session_dir)?;

        let session_start_time = self
            .channels
            .iter()
            .flat_map(|c| c.segments.iter().flatten())
            .map(|p| p.start_time)
            .min()
            .expect("channels verified non-empty");
        let session_uid = Uid::generate();

        let (validation_fields, password_data) = match &self.passwords {
            Some(spec) => {
                let fields = build_validation_fields(&spec.level_1, &spec.level_2)?;
                let data = PasswordData::process(&spec.level_2, &fields)?;
                (fields, Some(data))
            }
            None => ([[0u8; 16]; 3], None),
        };
        if self.data_encryption_level > 0 && password_data.is_none() {
            return Err(MedError::parameter(
                "data encryption requires session passwords",
            ));
        }

        let mut all_channel_sgmt: Vec<Vec<SgmtRecord>> = Vec::new();
        for spec in &self.channels {
            let sgmt = self.write_channel(
                &session_dir,
                spec,
                session_start_time,
                session_uid,
                &validation_fields,
                password_data.as_ref(),
            )?;
            all_channel_sgmt.push(sgmt);
        }

        // Session-level Sgmt records from the highest-rate channel, with
        // sentinels when channel rates differ.
        let uniform = self
            .channels
            .iter()
            .map(|c| c.sampling_frequency)
            .all(|f| f == self.channels[0].sampling_frequency);
        let reference = all_channel_sgmt
            .iter()
            .zip(&self.channels)
            .max_by(|(_, a), (_, b)| {
                a.sampling_frequency
                    .partial_cmp(&b.sampling_frequency)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(sgmt, _)| sgmt.clone())
            .unwrap_or_default();
        let session_sgmt: Vec<SgmtRecord> = reference
            .into_iter()
            .map(|mut record| {
                record.acquisition_channel_number = CHANNEL_NUMBER_ALL_CHANNELS;
                if !uniform {
                    // Variable-rate sessions have no session-wide sample
                    // numbering.
                    record.sampling_frequency = FREQUENCY_VARIABLE;
                    record.start_sample_number = med_core::types::SAMPLE_NUMBER_NO_ENTRY;
                    record.end_sample_number = med_core::types::SAMPLE_NUMBER_NO_ENTRY;
                }
                record
            })
            .collect();
        self.write_record_files(
            &session_dir,
            &self.session_name,
            LevelCode::Session,
            &session_sgmt,
            session_start_time,
            session_uid,
            Uid::NO_ENTRY,
            &validation_fields,
            password_data.as_ref(),
        )?;

        info!(session = %session_dir.display(), channels = self.channels.len(), "wrote session");
        Ok(session_dir)
    }

    #[allow(clippy::too_many_arguments)]
    fn base_universal_header(
        &self,
        type_code: FileTypeCode,
        level: LevelCode,
        session_start_time: i64,
        file_start_time: i64,
        session_uid: Uid,
        channel_uid: Uid,
        segment_uid: Uid,
        channel_name: &str,
        validation_fields: &[[u8; 16]; 3],
    ) -> UniversalHeader {
        let mut uh = UniversalHeader::new(type_code, level);
        uh.session_start_time = session_start_time;
        uh.file_start_time = file_start_time;
        uh.session_name = self.session_name.clone();
        uh.channel_name = channel_name.to_owned();
        uh.session_uid = session_uid;
        uh.channel_uid = channel_uid;
        uh.segment_uid = segment_uid;
        uh.provenance_uid = uh.file_uid;
        uh.password_validation_fields = *validation_fields;
        uh
    }

    #[allow(clippy::too_many_arguments)]
    fn write_channel(
        &self,
        session_dir: &Path,
        spec: &ChannelSpec,
        session_start_time: i64,
        session_uid: Uid,
        validation_fields: &[[u8; 16]; 3],
        password_data: Option<&PasswordData>,
    ) -> Result<Vec<SgmtRecord>> {
        let channel_dir = session_dir.join(format!("{}.ticd", spec.name));
        std::fs::create_dir_all(&channel_dir)?;
        let channel_uid = Uid::generate();
        let period = 1e6 / spec.sampling_frequency;

        let mut engine = CodecEngine::with_directives(CodecDirectives {
            algorithm: self.algorithm,
            encryption_level: self.data_encryption_level,
            ..Default::default()
        });
        if self.data_encryption_level > 0 {
            let key = password_data
                .and_then(|p| p.key_for_level(self.data_encryption_level))
                .ok_or(MedError::BadPassword { hint: None })?;
            engine.set_key(self.data_encryption_level, *key)?;
        }

        let mut sgmt_records = Vec::new();
        let mut absolute_start_sample = 0i64;
        let mut expected_next_time: Option<i64> = None;

        for (seg_idx, pieces) in spec.segments.iter().enumerate() {
            let segment_number = seg_idx as i32 + 1;
            let segment_uid = Uid::generate();
            let base = format!("{}-{segment_number:04}", spec.name);
            let segment_dir = channel_dir.join(format!("{base}.tisd"));
            std::fs::create_dir_all(&segment_dir)?;

            let segment_samples: i64 = pieces.iter().map(|p| p.samples.len() as i64).sum();
            let segment_start_time = pieces[0].start_time;
            let last_piece = pieces.last().expect("verified non-empty");
            let segment_end_time = time_at(last_piece.start_time, last_piece.samples.len() - 1, period)
                + period.round() as i64
                - 1;

            // Data blocks + index entries.
            let data_path = segment_dir.join(format!("{base}.tdat"));
            let mut data_uh = self.base_universal_header(
                FileTypeCode::TimeSeriesData,
                LevelCode::Segment(segment_number),
                session_start_time,
                segment_start_time,
                session_uid,
                channel_uid,
                segment_uid,
                &spec.name,
                validation_fields,
            );
            data_uh.segment_uid = segment_uid;
            let mut data_fps = Fps::create(
                &data_path,
                data_uh,
                FpsDirectives {
                    update_universal_header: true,
                    ..Default::default()
                },
            );

            let mut index_entries: Vec<TimeSeriesIndexEntry> = Vec::new();
            let mut segment_sample_cursor = 0i64;
            let mut maximum_block_bytes = 0u32;
            let mut discontinuities = 0i64;

            for piece in pieces {
                let mut offset_in_piece = 0usize;
                for chunk in piece.samples.chunks(self.block_samples) {
                    let block_start_time = time_at(piece.start_time, offset_in_piece, period);
                    let discontinuity = match expected_next_time {
                        Some(expected) => (block_start_time - expected).abs() > 1,
                        None => true,
                    };
                    if discontinuity {
                        discontinuities += 1;
                    }
                    let meta = BlockMeta {
                        start_time: block_start_time,
                        acquisition_channel_number: spec.acquisition_channel_number,
                        discontinuity,
                        ..Default::default()
                    };
                    let block = engine.encode_block(chunk, &meta)?;
                    maximum_block_bytes = maximum_block_bytes.max(block.len() as u32);
                    let file_offset = data_fps.append_body(&block)?;
                    index_entries.push(TimeSeriesIndexEntry {
                        file_offset,
                        discontinuity,
                        start_time: block_start_time,
                        start_sample_number: segment_sample_cursor,
                    });
                    segment_sample_cursor += chunk.len() as i64;
                    offset_in_piece += chunk.len();
                    expected_next_time =
                        Some(time_at(piece.start_time, offset_in_piece, period));
                }
            }
            let block_count = index_entries.len() as i64;
            // The terminal entry's offset is the data file's total
            // length: where the next block would have started.
            let terminal = TimeSeriesIndexEntry {
                file_offset: data_fps.len(),
                discontinuity: false,
                start_time: segment_end_time,
                start_sample_number: segment_samples,
            };
            data_fps.close_write(segment_end_time, block_count, maximum_block_bytes)?;

            // Index file.
            let index_path = segment_dir.join(format!("{base}.tidx"));
            let index_uh = self.base_universal_header(
                FileTypeCode::TimeSeriesIndices,
                LevelCode::Segment(segment_number),
                session_start_time,
                segment_start_time,
                session_uid,
                channel_uid,
                segment_uid,
                &spec.name,
                validation_fields,
            );
            let mut index_fps = Fps::create(
                &index_path,
                index_uh,
                FpsDirectives {
                    update_universal_header: true,
                    ..Default::default()
                },
            );
            let mut entry_bytes = [0u8; 24];
            for entry in index_entries.iter().chain(std::iter::once(&terminal)) {
                entry.write_to(&mut entry_bytes);
                index_fps.append_body(&entry_bytes)?;
            }
            index_fps.close_write(segment_end_time, block_count + 1, 24)?;

            // Metadata file.
            let metadata_path = segment_dir.join(format!("{base}.tmet"));
            let metadata_uh = self.base_universal_header(
                FileTypeCode::TimeSeriesMetadata,
                LevelCode::Segment(segment_number),
                session_start_time,
                segment_start_time,
                session_uid,
                channel_uid,
                segment_uid,
                &spec.name,
                validation_fields,
            );
            let metadata = self.segment_metadata(
                spec,
                segment_samples,
                absolute_start_sample,
                block_count,
                maximum_block_bytes,
                discontinuities,
            );
            let mut payload = metadata.to_payload()?;
            if let Some(password) = password_data {
                metadata::encrypt_sections(&mut payload, password)?;
            }
            let mut metadata_fps = Fps::create(
                &metadata_path,
                metadata_uh,
                FpsDirectives {
                    update_universal_header: true,
                    ..Default::default()
                },
            );
            metadata_fps.append_body(&payload)?;
            metadata_fps.close_write(segment_end_time, 1, payload.len() as u32)?;

            sgmt_records.push(SgmtRecord {
                start_time: segment_start_time,
                end_time: segment_end_time,
                start_sample_number: absolute_start_sample,
                end_sample_number: absolute_start_sample + segment_samples - 1,
                segment_uid,
                segment_number,
                acquisition_channel_number: spec.acquisition_channel_number,
                sampling_frequency: spec.sampling_frequency,
            });
            absolute_start_sample += segment_samples;
        }

        // Channel-level Sgmt record files.
        self.write_record_files(
            &channel_dir,
            &spec.name,
            LevelCode::Channel,
            &sgmt_records,
            session_start_time,
            session_uid,
            channel_uid,
            validation_fields,
            password_data,
        )?;

        Ok(sgmt_records)
    }

    fn segment_metadata(
        &self,
        spec: &ChannelSpec,
        segment_samples: i64,
        absolute_start_sample: i64,
        block_count: i64,
        maximum_block_bytes: u32,
        discontinuities: i64,
    ) -> Metadata {
        let mut metadata = Metadata::new_time_series();
        if let Some(passwords) = &self.passwords {
            metadata.section_1.level_1_password_hint = passwords.level_1_hint.clone();
            metadata.section_1.level_2_password_hint = passwords.level_2_hint.clone();
        } else {
            metadata.section_1.section_2_encryption_level = 0;
            metadata.section_1.section_3_encryption_level = 0;
        }
        metadata.section_1.time_series_data_encryption_level = self.data_encryption_level;
        if let MetadataSection2::TimeSeries(s2) = &mut metadata.section_2 {
            s2.channel_description = format!("channel {}", spec.name);
            s2.acquisition_channel_number = spec.acquisition_channel_number;
            s2.sampling_frequency = spec.sampling_frequency;
            s2.amplitude_units_conversion_factor = spec.amplitude_units_conversion_factor;
            s2.amplitude_units_description = spec.amplitude_units_description.clone();
            s2.time_base_units_conversion_factor = 1e-6;
            s2.time_base_units_description = "seconds".into();
            s2.absolute_start_sample_number = absolute_start_sample;
            s2.number_of_samples = segment_samples;
            s2.number_of_blocks = block_count;
            s2.maximum_block_bytes = i64::from(maximum_block_bytes);
            s2.maximum_block_samples = self.block_samples as u32;
            s2.maximum_block_duration =
                self.block_samples as f64 / spec.sampling_frequency * 1e6;
            s2.number_of_discontinuities = discontinuities;
        }
        metadata.section_3.standard_timezone_acronym = "UTC".into();
        metadata.section_3.standard_timezone_string = "Coordinated Universal Time".into();
        metadata
    }

    #[allow(clippy::too_many_arguments)]
    fn write_record_files(
        &self,
        dir: &Path,
        base: &str,
        level: LevelCode,
        sgmt_records: &[SgmtRecord],
        session_start_time: i64,
        session_uid: Uid,
        channel_uid: Uid,
        validation_fields: &[[u8; 16]; 3],
        password_data: Option<&PasswordData>,
    ) -> Result<()> {
        let record_encryption_level: i8 = if self.passwords.is_some() { 1 } else { 0 };
        let first_time = sgmt_records.first().map(|r| r.start_time).unwrap_or(0);
        let last_time = sgmt_records.last().map(|r| r.end_time).unwrap_or(0);

        let data_path = dir.join(format!("{base}.rdat"));
        let data_uh = self.base_universal_header(
            FileTypeCode::RecordData,
            level,
            session_start_time,
            first_time,
            session_uid,
            channel_uid,
            Uid::NO_ENTRY,
            base,
            validation_fields,
        );
        let mut data_fps = Fps::create(
            &data_path,
            data_uh,
            FpsDirectives {
                update_universal_header: true,
                ..Default::default()
            },
        );

        let mut index_entries = Vec::new();
        let mut maximum_entry = 0u32;
        for record in sgmt_records {
            let mut body = record.to_body().to_vec();
            if record_encryption_level > 0 {
                let key = password_data
                    .and_then(|p| p.key_for_level(record_encryption_level))
                    .ok_or(MedError::BadPassword { hint: None })?;
                med_core::aes::encrypt(&mut body, key);
            }
            let total = (RECORD_HEADER_BYTES + body.len()) as u32;
            let mut header = RecordHeader {
                record_crc: 0,
                total_record_bytes: total,
                start_time: record.start_time,
                type_code: SGMT_TYPE_CODE,
                version_major: 1,
                version_minor: 0,
                encryption_level: record_encryption_level,
            };
            let mut record_bytes = vec![0u8; total as usize];
            header.write_to(&mut record_bytes);
            record_bytes[RECORD_HEADER_BYTES..].copy_from_slice(&body);
            header.record_crc = crc32(&record_bytes[RECORD_CRC_START_OFFSET..]);
            record_bytes[0..4].copy_from_slice(&header.record_crc.to_le_bytes());

            let file_offset = data_fps.append_body(&record_bytes)?;
            maximum_entry = maximum_entry.max(total);
            index_entries.push(RecordIndexEntry {
                file_offset,
                start_time: record.start_time,
                type_code: SGMT_TYPE_CODE,
                version_major: 1,
                version_minor: 0,
                encryption_level: record_encryption_level,
            });
        }
        let terminal = RecordIndexEntry {
            file_offset: data_fps.len(),
            start_time: last_time,
            type_code: 0,
            version_major: 0xFF,
            version_minor: 0xFF,
            encryption_level: 0,
        };
        data_fps.close_write(last_time, sgmt_records.len() as i64, maximum_entry)?;

        let index_path = dir.join(format!("{base}.ridx"));
        let index_uh = self.base_universal_header(
            FileTypeCode::RecordIndices,
            level,
            session_start_time,
            first_time,
            session_uid,
            channel_uid,
            Uid::NO_ENTRY,
            base,
            validation_fields,
        );
        let mut index_fps = Fps::create(
            &index_path,
            index_uh,
            FpsDirectives {
                update_universal_header: true,
                ..Default::default()
            },
        );
        let mut entry_bytes = [0u8; 24];
        for entry in index_entries.iter().chain(std::iter::once(&terminal)) {
            entry.write_to(&mut entry_bytes);
            index_fps.append_body(&entry_bytes)?;
        }
        index_fps.close_write(last_time, index_entries.len() as i64 + 1, 24)?;
        Ok(())
    }
}

fn time_at(piece_start: i64, sample_offset: usize, period_us: f64) -> i64 {
    piece_start + (sample_offset as f64 * period_us).round() as i64
}
