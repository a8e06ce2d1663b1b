//! The session aggregate: channels, session-level records, ephemeral
//! metadata, and the reference channel that anchors session-wide sample
//! numbering.

use std::path::{Path, PathBuf};

use itertools::Itertools;
use tracing::{info, warn};

use med_core::error::{MedError, Result};
use med_core::metadata::{Metadata, MetadataSection2};
use med_core::record::{RecordHeader, SgmtRecord};
use med_core::types::{
    CHANNEL_NUMBER_ALL_CHANNELS, FREQUENCY_VARIABLE, SAMPLE_NUMBER_NO_ENTRY,
};

use crate::channel::{Channel, VideoChannel};
use crate::context::MedContext;
use crate::records::RecordSet;
use crate::slice::{Contiguon, SgmtIndex, TimeSlice};

/// An open MED session.
#[derive(Debug)]
pub struct Session {
    pub name: String,
    pub directory: PathBuf,
    pub context: MedContext,
    pub time_series_channels: Vec<Channel>,
    pub video_channels: Vec<VideoChannel>,
    /// Index into `time_series_channels`; the session's sample clock.
    pub reference_channel: usize,
    /// Session-level `Sgmt` array; sentinel values where channels
    /// disagree.
    pub sgmt_records: Vec<SgmtRecord>,
    /// Ephemeral session metadata.
    pub metadata: Metadata,
    pub records: Option<RecordSet>,
    /// Per-segment session record sets from the optional `.recd`
    /// directory.
    pub segmented_session_records: Vec<RecordSet>,
}

impl Session {
    /// Open a `.medd` session directory, optionally with a password.
    pub fn open(directory: &Path, password: Option<&str>) -> Result<Session> {
        let context = match password {
            Some(p) => MedContext::with_password(p),
            None => MedContext::new(),
        };
        Self::open_with_context(directory, context)
    }

    /// Open with a prepared context (behavior stack, CRC mode, record
    /// filter, diagnostics).
    pub fn open_with_context(directory: &Path, mut context: MedContext) -> Result<Session> {
        if !directory.is_dir() {
            return Err(MedError::NoFile {
                path: directory.to_owned(),
            });
        }
        let name = directory
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_owned();

        let mut ts_dirs = Vec::new();
        let mut video_dirs = Vec::new();
        for entry in std::fs::read_dir(directory)? {
            let path = entry?.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some("ticd") => ts_dirs.push(path),
                Some("vicd") => video_dirs.push(path),
                _ => {}
            }
        }
        ts_dirs.sort();
        video_dirs.sort();
        if ts_dirs.is_empty() && video_dirs.is_empty() {
            return Err(MedError::NotMed {
                path: directory.to_owned(),
                detail: "no channel directories found".into(),
            });
        }

        // Process the password against the first channel's first
        // metadata file so the context holds key schedules before any
        // decryption happens.
        if let Some(first_channel) = ts_dirs.first() {
            if let Some(first_segment) = std::fs::read_dir(first_channel)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| crate::segment::parse_segment_dir_name(p).is_some())
                .sorted()
                .next()
            {
                if let Some((seg_name, number)) =
                    crate::segment::parse_segment_dir_name(&first_segment)
                {
                    let metadata_path =
                        first_segment.join(format!("{seg_name}-{number:04}.tmet"));
                    let fps = crate::fps::Fps::open_read(
                        &metadata_path,
                        &context,
                        Default::default(),
                    )?;
                    context.process_password(&fps.universal_header)?;
                }
            }
        }

        let time_series_channels: Vec<Channel> = ts_dirs
            .iter()
            .map(|dir| Channel::open(dir, &context))
            .collect::<Result<_>>()?;
        let video_channels: Vec<VideoChannel> = video_dirs
            .iter()
            .map(|dir| VideoChannel::open(dir, &context))
            .collect::<Result<_>>()?;

        // Reference channel: highest sampling rate, ties to the first.
        let reference_channel = time_series_channels
            .iter()
            .position_max_by(|a, b| {
                a.sampling_frequency()
                    .partial_cmp(&b.sampling_frequency())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(0);

        let records = RecordSet::open(directory, &name, &context)?;

        // Segmented session records: one record file pair per segment
        // under `<name>.recd`.
        let mut segmented_session_records = Vec::new();
        let recd_dir = directory.join(format!("{name}.recd"));
        if recd_dir.is_dir() {
            let bases: Vec<String> = std::fs::read_dir(&recd_dir)?
                .filter_map(|entry| {
                    let path = entry.ok()?.path();
                    if path.extension()? != "ridx" {
                        return None;
                    }
                    Some(path.file_stem()?.to_string_lossy().into_owned())
                })
                .sorted()
                .collect();
            for base in bases {
                if let Some(set) = RecordSet::open(&recd_dir, &base, &context)? {
                    segmented_session_records.push(set);
                }
            }
        }

        let mut session = Session {
            name,
            directory: directory.to_owned(),
            context,
            time_series_channels,
            video_channels,
            reference_channel,
            sgmt_records: Vec::new(),
            metadata: Metadata::new_time_series(),
            records,
            segmented_session_records,
        };
        session.sgmt_records = session.build_session_sgmt_records();
        session.metadata = session.synthesize_metadata();
        info!(
            session = %session.name,
            channels = session.time_series_channels.len(),
            reference = session.reference_channel,
            "opened session"
        );
        Ok(session)
    }

    fn uniform_frequency(&self) -> Option<f64> {
        let mut frequencies = self
            .time_series_channels
            .iter()
            .map(|c| c.sampling_frequency());
        let first = frequencies.next()?;
        frequencies.all(|f| f == first).then_some(first)
    }

    // Session-level Sgmt records: per-segment spans from the reference
    // channel, with sentinel frequency and sample fields when the
    // channels disagree.
    fn build_session_sgmt_records(&self) -> Vec<SgmtRecord> {
        let Some(reference) = self.time_series_channels.get(self.reference_channel) else {
            return Vec::new();
        };
        let uniform = self.uniform_frequency();
        if uniform.is_none() {
            warn!(
                "channel sampling frequencies differ; session Sgmt records carry the variable-frequency sentinel"
            );
        }
        reference
            .sgmt_records
            .iter()
            .map(|record| {
                let mut session_record = *record;
                session_record.acquisition_channel_number = CHANNEL_NUMBER_ALL_CHANNELS;
                if uniform.is_none() {
                    session_record.sampling_frequency = FREQUENCY_VARIABLE;
                    session_record.start_sample_number = SAMPLE_NUMBER_NO_ENTRY;
                    session_record.end_sample_number = SAMPLE_NUMBER_NO_ENTRY;
                }
                session_record
            })
            .collect()
    }

    // Ephemeral session metadata: the reference channel's, with the
    // frequency field replaced by the variable sentinel when rates mix.
    fn synthesize_metadata(&self) -> Metadata {
        let Some(reference) = self.time_series_channels.get(self.reference_channel) else {
            return Metadata::new_time_series();
        };
        let mut metadata = reference.metadata.clone();
        if let MetadataSection2::TimeSeries(s2) = &mut metadata.section_2 {
            if self.uniform_frequency().is_none() {
                s2.sampling_frequency = FREQUENCY_VARIABLE;
            }
            s2.channel_description = String::new();
        }
        metadata
    }

    pub fn channel_count(&self) -> usize {
        self.time_series_channels.len()
    }

    pub fn channel(&self, index: usize) -> &Channel {
        &self.time_series_channels[index]
    }

    pub fn channel_by_name(&self, name: &str) -> Option<&Channel> {
        self.time_series_channels.iter().find(|c| c.name == name)
    }

    pub fn reference(&self) -> &Channel {
        &self.time_series_channels[self.reference_channel]
    }

    /// Resolver over the reference channel.
    pub fn sgmt_index(&self) -> SgmtIndex<'_> {
        self.reference().sgmt_index()
    }

    /// Resolve a slice against the session (the reference channel's
    /// clock).
    pub fn resolve_slice(&self, slice: &mut TimeSlice) -> Result<()> {
        if self.time_series_channels.is_empty() {
            return Err(MedError::NoMetadata {
                path: self.directory.clone(),
            });
        }
        self.sgmt_index().resolve(slice)
    }

    /// Contiguon list for a slice, from the reference channel.
    pub fn find_discontinuities(&self, slice: &TimeSlice) -> Result<Vec<Contiguon>> {
        self.reference().contiguons(slice)
    }

    /// Session-level records intersecting a resolved slice, after the
    /// context's type filter.
    pub fn records_in_slice(&self, slice: &TimeSlice) -> Result<Vec<(RecordHeader, Vec<u8>)>> {
        match &self.records {
            Some(set) => set.records_in_range(slice.start_time, slice.end_time, &self.context),
            None => Ok(Vec::new()),
        }
    }
}
