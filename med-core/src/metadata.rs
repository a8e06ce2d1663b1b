//! The metadata file payload: 15 KiB after the universal header, split
//! into three separately encryptable sections.
//!
//! Section 1 is always plaintext and names the encryption levels of the
//! rest: section 2 (recording parameters, default level 1), section 3
//! (timing and subject identity, default level 2), and the time-series
//! data blocks themselves (default unencrypted). Section 2 is a
//! discriminated union between the time-series and video variants,
//! selected by the file's type code.
//!
//! Session- and channel-level metadata is *ephemeral*: synthesized from
//! the union of the segments at open time and never written back.

use byteorder::{ByteOrder, LittleEndian};

use crate::aes;
use crate::error::{MedError, Result};
use crate::password::PasswordData;
use crate::text::{read_fixed_utf8, write_fixed_utf8};
use crate::types::{self, FileTypeCode};

pub const METADATA_BYTES: usize = 15_360;
pub const METADATA_FILE_BYTES: usize = METADATA_BYTES + 1024;

// Payload-relative section extents.
pub const SECTION_1_BYTES: usize = 1024;
pub const SECTION_2_OFFSET: usize = 1024;
pub const SECTION_2_BYTES: usize = 10_240;
pub const SECTION_3_OFFSET: usize = 11_264;
pub const SECTION_3_BYTES: usize = 4_096;

pub const SECTION_2_ENCRYPTION_LEVEL_DEFAULT: i8 = 1;
pub const SECTION_3_ENCRYPTION_LEVEL_DEFAULT: i8 = 2;
pub const TIME_SERIES_DATA_ENCRYPTION_LEVEL_DEFAULT: i8 = 0;

const HINT_BYTES: usize = 256;

/// Section 1: password hints and encryption levels. Never encrypted.
#[derive(Debug, Clone)]
pub struct MetadataSection1 {
    pub level_1_password_hint: String,
    pub level_2_password_hint: String,
    pub section_2_encryption_level: i8,
    pub section_3_encryption_level: i8,
    pub time_series_data_encryption_level: i8,
    pub protected_region: Vec<u8>,
    pub discretionary_region: Vec<u8>,
}

impl Default for MetadataSection1 {
    fn default() -> Self {
        MetadataSection1 {
            level_1_password_hint: String::new(),
            level_2_password_hint: String::new(),
            section_2_encryption_level: SECTION_2_ENCRYPTION_LEVEL_DEFAULT,
            section_3_encryption_level: SECTION_3_ENCRYPTION_LEVEL_DEFAULT,
            time_series_data_encryption_level: TIME_SERIES_DATA_ENCRYPTION_LEVEL_DEFAULT,
            protected_region: vec![0; 253],
            discretionary_region: vec![0; 256],
        }
    }
}

/// Time-series variant of section 2.
#[derive(Debug, Clone)]
pub struct TimeSeriesSection2 {
    pub session_description: String,
    pub channel_description: String,
    pub segment_description: String,
    pub equipment_description: String,
    pub acquisition_channel_number: i32,
    pub reference_description: String,
    pub sampling_frequency: f64,
    pub low_frequency_filter_setting: f64,
    pub high_frequency_filter_setting: f64,
    pub notch_filter_frequency_setting: f64,
    pub ac_line_frequency: f64,
    pub amplitude_units_conversion_factor: f64,
    pub amplitude_units_description: String,
    pub time_base_units_conversion_factor: f64,
    pub time_base_units_description: String,
    pub absolute_start_sample_number: i64,
    pub number_of_samples: i64,
    pub number_of_blocks: i64,
    pub maximum_block_bytes: i64,
    pub maximum_block_samples: u32,
    pub maximum_block_keysample_bytes: u32,
    pub maximum_block_duration: f64,
    pub number_of_discontinuities: i64,
    pub maximum_contiguous_blocks: i64,
    pub maximum_contiguous_block_bytes: i64,
    pub maximum_contiguous_samples: i64,
    pub protected_region: Vec<u8>,
    pub discretionary_region: Vec<u8>,
}

impl Default for TimeSeriesSection2 {
    fn default() -> Self {
        TimeSeriesSection2 {
            session_description: String::new(),
            channel_description: String::new(),
            segment_description: String::new(),
            equipment_description: String::new(),
            acquisition_channel_number: types::CHANNEL_NUMBER_NO_ENTRY,
            reference_description: String::new(),
            sampling_frequency: types::FREQUENCY_NO_ENTRY,
            low_frequency_filter_setting: types::FREQUENCY_NO_ENTRY,
            high_frequency_filter_setting: types::FREQUENCY_NO_ENTRY,
            notch_filter_frequency_setting: types::FREQUENCY_NO_ENTRY,
            ac_line_frequency: types::FREQUENCY_NO_ENTRY,
            amplitude_units_conversion_factor: 0.0,
            amplitude_units_description: String::new(),
            time_base_units_conversion_factor: 0.0,
            time_base_units_description: String::new(),
            absolute_start_sample_number: types::SAMPLE_NUMBER_NO_ENTRY,
            number_of_samples: -1,
            number_of_blocks: -1,
            maximum_block_bytes: -1,
            maximum_block_samples: u32::MAX,
            maximum_block_keysample_bytes: u32::MAX,
            maximum_block_duration: -1.0,
            number_of_discontinuities: -1,
            maximum_contiguous_blocks: -1,
            maximum_contiguous_block_bytes: -1,
            maximum_contiguous_samples: -1,
            protected_region: vec![0; 1344],
            discretionary_region: vec![0; 1336],
        }
    }
}

/// Video variant of section 2.
#[derive(Debug, Clone)]
pub struct VideoSection2 {
    pub session_description: String,
    pub channel_description: String,
    pub segment_description: String,
    pub equipment_description: String,
    pub acquisition_channel_number: i32,
    pub time_base_units_conversion_factor: f64,
    pub time_base_units_description: String,
    pub absolute_start_frame_number: i64,
    pub number_of_frames: i64,
    pub frame_rate: f64,
    pub number_of_clips: i64,
    pub maximum_clip_bytes: i64,
    pub maximum_clip_frames: u32,
    pub number_of_video_files: i32,
    pub maximum_clip_duration: f64,
    pub number_of_discontinuities: i64,
    pub maximum_contiguous_clips: i64,
    pub maximum_contiguous_clip_bytes: i64,
    pub maximum_contiguous_frames: i64,
    pub horizontal_pixels: u32,
    pub vertical_pixels: u32,
    pub video_format: String,
    pub protected_region: Vec<u8>,
    pub discretionary_region: Vec<u8>,
}

impl Default for VideoSection2 {
    fn default() -> Self {
        VideoSection2 {
            session_description: String::new(),
            channel_description: String::new(),
            segment_description: String::new(),
            equipment_description: String::new(),
            acquisition_channel_number: types::CHANNEL_NUMBER_NO_ENTRY,
            time_base_units_conversion_factor: 0.0,
            time_base_units_description: String::new(),
            absolute_start_frame_number: types::SAMPLE_NUMBER_NO_ENTRY,
            number_of_frames: -1,
            frame_rate: types::FREQUENCY_NO_ENTRY,
            number_of_clips: -1,
            maximum_clip_bytes: -1,
            maximum_clip_frames: u32::MAX,
            number_of_video_files: -1,
            maximum_clip_duration: -1.0,
            number_of_discontinuities: -1,
            maximum_contiguous_clips: -1,
            maximum_contiguous_clip_bytes: -1,
            maximum_contiguous_frames: -1,
            horizontal_pixels: 0,
            vertical_pixels: 0,
            video_format: String::new(),
            protected_region: vec![0; 1808],
            discretionary_region: vec![0; 1800],
        }
    }
}

/// Section 2, discriminated by the metadata file's type code.
#[derive(Debug, Clone)]
pub enum MetadataSection2 {
    TimeSeries(TimeSeriesSection2),
    Video(VideoSection2),
}

impl MetadataSection2 {
    pub fn as_time_series(&self) -> Option<&TimeSeriesSection2> {
        match self {
            MetadataSection2::TimeSeries(s) => Some(s),
            MetadataSection2::Video(_) => None,
        }
    }

    pub fn as_video(&self) -> Option<&VideoSection2> {
        match self {
            MetadataSection2::Video(s) => Some(s),
            MetadataSection2::TimeSeries(_) => None,
        }
    }
}

/// Section 3: timing, timezone, and subject identity.
#[derive(Debug, Clone)]
pub struct MetadataSection3 {
    pub recording_time_offset: i64,
    pub daylight_time_start_code: i64,
    pub daylight_time_end_code: i64,
    pub standard_timezone_acronym: String,
    pub standard_timezone_string: String,
    pub daylight_timezone_acronym: String,
    pub daylight_timezone_string: String,
    pub subject_name_1: String,
    pub subject_name_2: String,
    pub subject_name_3: String,
    pub subject_id: String,
    pub recording_country: String,
    pub recording_territory: String,
    pub recording_locality: String,
    pub recording_institution: String,
    pub geotag_format: String,
    pub geotag_data: String,
    pub standard_utc_offset: i32,
    pub protected_region: Vec<u8>,
    pub discretionary_region: Vec<u8>,
}

impl Default for MetadataSection3 {
    fn default() -> Self {
        MetadataSection3 {
            recording_time_offset: 0,
            daylight_time_start_code: -1,
            daylight_time_end_code: -1,
            standard_timezone_acronym: String::new(),
            standard_timezone_string: String::new(),
            daylight_timezone_acronym: String::new(),
            daylight_timezone_string: String::new(),
            subject_name_1: String::new(),
            subject_name_2: String::new(),
            subject_name_3: String::new(),
            subject_id: String::new(),
            recording_country: String::new(),
            recording_territory: String::new(),
            recording_locality: String::new(),
            recording_institution: String::new(),
            geotag_format: String::new(),
            geotag_data: String::new(),
            standard_utc_offset: 0,
            protected_region: vec![0; 668],
            discretionary_region: vec![0; 664],
        }
    }
}

/// A fully parsed metadata payload.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub section_1: MetadataSection1,
    pub section_2: MetadataSection2,
    pub section_3: MetadataSection3,
}

impl Metadata {
    pub fn new_time_series() -> Self {
        Metadata {
            section_1: MetadataSection1::default(),
            section_2: MetadataSection2::TimeSeries(TimeSeriesSection2::default()),
            section_3: MetadataSection3::default(),
        }
    }

    pub fn new_video() -> Self {
        Metadata {
            section_1: MetadataSection1::default(),
            section_2: MetadataSection2::Video(VideoSection2::default()),
            section_3: MetadataSection3::default(),
        }
    }

    pub fn time_series(&self) -> Result<&TimeSeriesSection2> {
        self.section_2.as_time_series().ok_or_else(|| {
            MedError::decode("metadata section 2 is not the time-series variant")
        })
    }

    /// Parse a decrypted payload. `type_code` selects the section 2
    /// variant.
    pub fn from_payload(payload: &[u8], type_code: FileTypeCode) -> Result<Self> {
        if payload.len() != METADATA_BYTES {
            return Err(MedError::decode(format!(
                "metadata payload is {} bytes, expected {METADATA_BYTES}",
                payload.len()
            )));
        }

        let section_1 = MetadataSection1 {
            level_1_password_hint: read_fixed_utf8(&payload[0..HINT_BYTES])?,
            level_2_password_hint: read_fixed_utf8(&payload[256..256 + HINT_BYTES])?,
            section_2_encryption_level: payload[512] as i8,
            section_3_encryption_level: payload[513] as i8,
            time_series_data_encryption_level: payload[514] as i8,
            protected_region: payload[515..768].to_vec(),
            discretionary_region: payload[768..1024].to_vec(),
        };

        let section_2 = match type_code {
            FileTypeCode::TimeSeriesMetadata => {
                MetadataSection2::TimeSeries(parse_time_series_section_2(payload)?)
            }
            FileTypeCode::VideoMetadata => MetadataSection2::Video(parse_video_section_2(payload)?),
            other => {
                return Err(MedError::decode(format!(
                    "{other} is not a metadata file type"
                )));
            }
        };

        let section_3 = parse_section_3(payload)?;

        Ok(Metadata {
            section_1,
            section_2,
            section_3,
        })
    }

    /// Serialize to a plaintext payload. Section encryption is applied
    /// afterwards, over the final image.
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        let mut payload = vec![0u8; METADATA_BYTES];

        let s1 = &self.section_1;
        write_fixed_utf8(&mut payload[0..HINT_BYTES], &s1.level_1_password_hint)?;
        write_fixed_utf8(&mut payload[256..512], &s1.level_2_password_hint)?;
        payload[512] = s1.section_2_encryption_level as u8;
        payload[513] = s1.section_3_encryption_level as u8;
        payload[514] = s1.time_series_data_encryption_level as u8;
        payload[515..768].copy_from_slice(&s1.protected_region);
        payload[768..1024].copy_from_slice(&s1.discretionary_region);

        match &self.section_2 {
            MetadataSection2::TimeSeries(s2) => write_time_series_section_2(&mut payload, s2)?,
            MetadataSection2::Video(s2) => write_video_section_2(&mut payload, s2)?,
        }

        write_section_3(&mut payload, &self.section_3)?;
        Ok(payload)
    }
}

fn parse_common_section_2(payload: &[u8]) -> Result<(String, String, String, String, i32)> {
    Ok((
        read_fixed_utf8(&payload[1024..3072])?,
        read_fixed_utf8(&payload[3072..4096])?,
        read_fixed_utf8(&payload[4096..5120])?,
        read_fixed_utf8(&payload[5120..7164])?,
        LittleEndian::read_i32(&payload[7164..]),
    ))
}

fn parse_time_series_section_2(payload: &[u8]) -> Result<TimeSeriesSection2> {
    let (session_description, channel_description, segment_description, equipment_description, acq) =
        parse_common_section_2(payload)?;
    Ok(TimeSeriesSection2 {
        session_description,
        channel_description,
        segment_description,
        equipment_description,
        acquisition_channel_number: acq,
        reference_description: read_fixed_utf8(&payload[7168..8192])?,
        sampling_frequency: LittleEndian::read_f64(&payload[8192..]),
        low_frequency_filter_setting: LittleEndian::read_f64(&payload[8200..]),
        high_frequency_filter_setting: LittleEndian::read_f64(&payload[8208..]),
        notch_filter_frequency_setting: LittleEndian::read_f64(&payload[8216..]),
        ac_line_frequency: LittleEndian::read_f64(&payload[8224..]),
        amplitude_units_conversion_factor: LittleEndian::read_f64(&payload[8232..]),
        amplitude_units_description: read_fixed_utf8(&payload[8240..8368])?,
        time_base_units_conversion_factor: LittleEndian::read_f64(&payload[8368..]),
        time_base_units_description: read_fixed_utf8(&payload[8376..8504])?,
        absolute_start_sample_number: LittleEndian::read_i64(&payload[8504..]),
        number_of_samples: LittleEndian::read_i64(&payload[8512..]),
        number_of_blocks: LittleEndian::read_i64(&payload[8520..]),
        maximum_block_bytes: LittleEndian::read_i64(&payload[8528..]),
        maximum_block_samples: LittleEndian::read_u32(&payload[8536..]),
        maximum_block_keysample_bytes: LittleEndian::read_u32(&payload[8540..]),
        maximum_block_duration: LittleEndian::read_f64(&payload[8544..]),
        number_of_discontinuities: LittleEndian::read_i64(&payload[8552..]),
        maximum_contiguous_blocks: LittleEndian::read_i64(&payload[8560..]),
        maximum_contiguous_block_bytes: LittleEndian::read_i64(&payload[8568..]),
        maximum_contiguous_samples: LittleEndian::read_i64(&payload[8576..]),
        protected_region: payload[8584..9928].to_vec(),
        discretionary_region: payload[9928..11264].to_vec(),
    })
}

fn parse_video_section_2(payload: &[u8]) -> Result<VideoSection2> {
    let (session_description, channel_description, segment_description, equipment_description, acq) =
        parse_common_section_2(payload)?;
    Ok(VideoSection2 {
        session_description,
        channel_description,
        segment_description,
        equipment_description,
        acquisition_channel_number: acq,
        time_base_units_conversion_factor: LittleEndian::read_f64(&payload[7168..]),
        time_base_units_description: read_fixed_utf8(&payload[7176..7304])?,
        absolute_start_frame_number: LittleEndian::read_i64(&payload[7304..]),
        number_of_frames: LittleEndian::read_i64(&payload[7312..]),
        frame_rate: LittleEndian::read_f64(&payload[7320..]),
        number_of_clips: LittleEndian::read_i64(&payload[7328..]),
        maximum_clip_bytes: LittleEndian::read_i64(&payload[7336..]),
        maximum_clip_frames: LittleEndian::read_u32(&payload[7344..]),
        number_of_video_files: LittleEndian::read_i32(&payload[7348..]),
        maximum_clip_duration: LittleEndian::read_f64(&payload[7352..]),
        number_of_discontinuities: LittleEndian::read_i64(&payload[7360..]),
        maximum_contiguous_clips: LittleEndian::read_i64(&payload[7368..]),
        maximum_contiguous_clip_bytes: LittleEndian::read_i64(&payload[7376..]),
        maximum_contiguous_frames: LittleEndian::read_i64(&payload[7384..]),
        horizontal_pixels: LittleEndian::read_u32(&payload[7392..]),
        vertical_pixels: LittleEndian::read_u32(&payload[7396..]),
        video_format: read_fixed_utf8(&payload[7400..7656])?,
        protected_region: payload[7656..9464].to_vec(),
        discretionary_region: payload[9464..11264].to_vec(),
    })
}

fn parse_section_3(payload: &[u8]) -> Result<MetadataSection3> {
    Ok(MetadataSection3 {
        recording_time_offset: LittleEndian::read_i64(&payload[11264..]),
        daylight_time_start_code: LittleEndian::read_i64(&payload[11272..]),
        daylight_time_end_code: LittleEndian::read_i64(&payload[11280..]),
        standard_timezone_acronym: read_fixed_utf8(&payload[11288..11296])?,
        standard_timezone_string: read_fixed_utf8(&payload[11296..11360])?,
        daylight_timezone_acronym: read_fixed_utf8(&payload[11360..11368])?,
        daylight_timezone_string: read_fixed_utf8(&payload[11368..11432])?,
        subject_name_1: read_fixed_utf8(&payload[11432..11560])?,
        subject_name_2: read_fixed_utf8(&payload[11560..11688])?,
        subject_name_3: read_fixed_utf8(&payload[11688..11816])?,
        subject_id: read_fixed_utf8(&payload[11816..11944])?,
        recording_country: read_fixed_utf8(&payload[11944..12200])?,
        recording_territory: read_fixed_utf8(&payload[12200..12456])?,
        recording_locality: read_fixed_utf8(&payload[12456..12712])?,
        recording_institution: read_fixed_utf8(&payload[12712..12968])?,
        geotag_format: read_fixed_utf8(&payload[12968..13000])?,
        geotag_data: read_fixed_utf8(&payload[13000..14024])?,
        standard_utc_offset: LittleEndian::read_i32(&payload[14024..]),
        protected_region: payload[14028..14696].to_vec(),
        discretionary_region: payload[14696..15360].to_vec(),
    })
}

fn write_common_section_2(
    payload: &mut [u8],
    session: &str,
    channel: &str,
    segment: &str,
    equipment: &str,
    acq: i32,
) -> Result<()> {
    write_fixed_utf8(&mut payload[1024..3072], session)?;
    write_fixed_utf8(&mut payload[3072..4096], channel)?;
    write_fixed_utf8(&mut payload[4096..5120], segment)?;
    write_fixed_utf8(&mut payload[5120..7164], equipment)?;
    LittleEndian::write_i32(&mut payload[7164..], acq);
    Ok(())
}

fn write_time_series_section_2(payload: &mut [u8], s2: &TimeSeriesSection2) -> Result<()> {
    write_common_section_2(
        payload,
        &s2.session_description,
        &s2.channel_description,
        &s2.segment_description,
        &s2.equipment_description,
        s2.acquisition_channel_number,
    )?;
    write_fixed_utf8(&mut payload[7168..8192], &s2.reference_description)?;
    LittleEndian::write_f64(&mut payload[8192..], s2.sampling_frequency);
    LittleEndian::write_f64(&mut payload[8200..], s2.low_frequency_filter_setting);
    LittleEndian::write_f64(&mut payload[8208..], s2.high_frequency_filter_setting);
    LittleEndian::write_f64(&mut payload[8216..], s2.notch_filter_frequency_setting);
    LittleEndian::write_f64(&mut payload[8224..], s2.ac_line_frequency);
    LittleEndian::write_f64(&mut payload[8232..], s2.amplitude_units_conversion_factor);
    write_fixed_utf8(&mut payload[8240..8368], &s2.amplitude_units_description)?;
    LittleEndian::write_f64(&mut payload[8368..], s2.time_base_units_conversion_factor);
    write_fixed_utf8(&mut payload[8376..8504], &s2.time_base_units_description)?;
    LittleEndian::write_i64(&mut payload[8504..], s2.absolute_start_sample_number);
    LittleEndian::write_i64(&mut payload[8512..], s2.number_of_samples);
    LittleEndian::write_i64(&mut payload[8520..], s2.number_of_blocks);
    LittleEndian::write_i64(&mut payload[8528..], s2.maximum_block_bytes);
    LittleEndian::write_u32(&mut payload[8536..], s2.maximum_block_samples);
    LittleEndian::write_u32(&mut payload[8540..], s2.maximum_block_keysample_bytes);
    LittleEndian::write_f64(&mut payload[8544..], s2.maximum_block_duration);
    LittleEndian::write_i64(&mut payload[8552..], s2.number_of_discontinuities);
    LittleEndian::write_i64(&mut payload[8560..], s2.maximum_contiguous_blocks);
    LittleEndian::write_i64(&mut payload[8568..], s2.maximum_contiguous_block_bytes);
    LittleEndian::write_i64(&mut payload[8576..], s2.maximum_contiguous_samples);
    payload[8584..9928].copy_from_slice(&s2.protected_region);
    payload[9928..11264].copy_from_slice(&s2.discretionary_region);
    Ok(())
}

fn write_video_section_2(payload: &mut [u8], s2: &VideoSection2) -> Result<()> {
    write_common_section_2(
        payload,
        &s2.session_description,
        &s2.channel_description,
        &s2.segment_description,
        &s2.equipment_description,
        s2.acquisition_channel_number,
    )?;
    LittleEndian::write_f64(&mut payload[7168..], s2.time_base_units_conversion_factor);
    write_fixed_utf8(&mut payload[7176..7304], &s2.time_base_units_description)?;
    LittleEndian::write_i64(&mut payload[7304..], s2.absolute_start_frame_number);
    LittleEndian::write_i64(&mut payload[7312..], s2.number_of_frames);
    LittleEndian::write_f64(&mut payload[7320..], s2.frame_rate);
    LittleEndian::write_i64(&mut payload[7328..], s2.number_of_clips);
    LittleEndian::write_i64(&mut payload[7336..], s2.maximum_clip_bytes);
    LittleEndian::write_u32(&mut payload[7344..], s2.maximum_clip_frames);
    LittleEndian::write_i32(&mut payload[7348..], s2.number_of_video_files);
    LittleEndian::write_f64(&mut payload[7352..], s2.maximum_clip_duration);
    LittleEndian::write_i64(&mut payload[7360..], s2.number_of_discontinuities);
    LittleEndian::write_i64(&mut payload[7368..], s2.maximum_contiguous_clips);
    LittleEndian::write_i64(&mut payload[7376..], s2.maximum_contiguous_clip_bytes);
    LittleEndian::write_i64(&mut payload[7384..], s2.maximum_contiguous_frames);
    LittleEndian::write_u32(&mut payload[7392..], s2.horizontal_pixels);
    LittleEndian::write_u32(&mut payload[7396..], s2.vertical_pixels);
    write_fixed_utf8(&mut payload[7400..7656], &s2.video_format)?;
    payload[7656..9464].copy_from_slice(&s2.protected_region);
    payload[9464..11264].copy_from_slice(&s2.discretionary_region);
    Ok(())
}

fn write_section_3(payload: &mut [u8], s3: &MetadataSection3) -> Result<()> {
    LittleEndian::write_i64(&mut payload[11264..], s3.recording_time_offset);
    LittleEndian::write_i64(&mut payload[11272..], s3.daylight_time_start_code);
    LittleEndian::write_i64(&mut payload[11280..], s3.daylight_time_end_code);
    write_fixed_utf8(&mut payload[11288..11296], &s3.standard_timezone_acronym)?;
    write_fixed_utf8(&mut payload[11296..11360], &s3.standard_timezone_string)?;
    write_fixed_utf8(&mut payload[11360..11368], &s3.daylight_timezone_acronym)?;
    write_fixed_utf8(&mut payload[11368..11432], &s3.daylight_timezone_string)?;
    write_fixed_utf8(&mut payload[11432..11560], &s3.subject_name_1)?;
    write_fixed_utf8(&mut payload[11560..11688], &s3.subject_name_2)?;
    write_fixed_utf8(&mut payload[11688..11816], &s3.subject_name_3)?;
    write_fixed_utf8(&mut payload[11816..11944], &s3.subject_id)?;
    write_fixed_utf8(&mut payload[11944..12200], &s3.recording_country)?;
    write_fixed_utf8(&mut payload[12200..12456], &s3.recording_territory)?;
    write_fixed_utf8(&mut payload[12456..12712], &s3.recording_locality)?;
    write_fixed_utf8(&mut payload[12712..12968], &s3.recording_institution)?;
    write_fixed_utf8(&mut payload[12968..13000], &s3.geotag_format)?;
    write_fixed_utf8(&mut payload[13000..14024], &s3.geotag_data)?;
    LittleEndian::write_i32(&mut payload[14024..], s3.standard_utc_offset);
    payload[14028..14696].copy_from_slice(&s3.protected_region);
    payload[14696..15360].copy_from_slice(&s3.discretionary_region);
    Ok(())
}

/// Encrypt sections 2 and 3 of a payload in place per the levels declared
/// in section 1. Requires keys for every non-zero level.
pub fn encrypt_sections(payload: &mut [u8], password: &PasswordData) -> Result<()> {
    if payload.len() != METADATA_BYTES {
        return Err(MedError::parameter("metadata payload has the wrong length"));
    }
    let s2_level = payload[512] as i8;
    let s3_level = payload[513] as i8;
    if s2_level > 0 {
        let key = password.key_for_level(s2_level).ok_or_else(|| {
            MedError::parameter(format!("no key for section 2 encryption level {s2_level}"))
        })?;
        aes::encrypt(&mut payload[SECTION_2_OFFSET..SECTION_2_OFFSET + SECTION_2_BYTES], key);
    }
    if s3_level > 0 {
        let key = password.key_for_level(s3_level).ok_or_else(|| {
            MedError::parameter(format!("no key for section 3 encryption level {s3_level}"))
        })?;
        aes::encrypt(&mut payload[SECTION_3_OFFSET..SECTION_3_OFFSET + SECTION_3_BYTES], key);
    }
    Ok(())
}

/// Decrypt whichever of sections 2 and 3 the password's access level
/// unlocks. Returns `(section_2_readable, section_3_readable)`; an
/// undecryptable section is left in place so the caller can decide
/// whether that is fatal.
pub fn decrypt_sections(payload: &mut [u8], password: &PasswordData) -> (bool, bool) {
    if payload.len() != METADATA_BYTES {
        return (false, false);
    }
    let s2_level = payload[512] as i8;
    let s3_level = payload[513] as i8;
    let mut readable = (s2_level <= 0, s3_level <= 0);
    if s2_level > 0 {
        if let Some(key) = password.key_for_level(s2_level) {
            aes::decrypt(&mut payload[SECTION_2_OFFSET..SECTION_2_OFFSET + SECTION_2_BYTES], key);
            readable.0 = true;
        }
    }
    if s3_level > 0 {
        if let Some(key) = password.key_for_level(s3_level) {
            aes::decrypt(&mut payload[SECTION_3_OFFSET..SECTION_3_OFFSET + SECTION_3_BYTES], key);
            readable.1 = true;
        }
    }
    readable
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::password::build_validation_fields;

    fn sample_metadata() -> Metadata {
        let mut md = Metadata::new_time_series();
        md.section_1.level_1_password_hint = "first pet".into();
        md.section_1.level_2_password_hint = "grant number".into();
        if let MetadataSection2::TimeSeries(s2) = &mut md.section_2 {
            s2.channel_description = "left frontal".into();
            s2.sampling_frequency = 1000.0;
            s2.amplitude_units_conversion_factor = 0.1;
            s2.amplitude_units_description = "µV".into();
            s2.absolute_start_sample_number = 0;
            s2.number_of_samples = 100_000;
            s2.number_of_blocks = 10;
        }
        md.section_3.recording_time_offset = 0;
        md.section_3.standard_timezone_acronym = "UTC".into();
        md.section_3.subject_id = "S-0042".into();
        md
    }

    #[test]
    fn payload_round_trip() {
        let md = sample_metadata();
        let payload = md.to_payload().unwrap();
        assert_eq!(payload.len(), METADATA_BYTES);
        let parsed = Metadata::from_payload(&payload, FileTypeCode::TimeSeriesMetadata).unwrap();
        let s2 = parsed.time_series().unwrap();
        assert_eq!(s2.sampling_frequency, 1000.0);
        assert_eq!(s2.amplitude_units_description, "µV");
        assert_eq!(s2.number_of_samples, 100_000);
        assert_eq!(parsed.section_3.subject_id, "S-0042");
        assert_eq!(parsed.section_1.level_1_password_hint, "first pet");
    }

    #[test]
    fn section_encryption_round_trip() {
        let md = sample_metadata();
        let fields = build_validation_fields("patient", "research").unwrap();
        let level_2 = PasswordData::process("research", &fields).unwrap();

        let plain = md.to_payload().unwrap();
        let mut cipher = plain.clone();
        encrypt_sections(&mut cipher, &level_2).unwrap();
        assert_ne!(cipher[SECTION_2_OFFSET..], plain[SECTION_2_OFFSET..]);
        // Section 1 stays plaintext.
        assert_eq!(cipher[..SECTION_1_BYTES], plain[..SECTION_1_BYTES]);

        let (s2_ok, s3_ok) = decrypt_sections(&mut cipher, &level_2);
        assert!(s2_ok && s3_ok);
        assert_eq!(cipher, plain);
    }

    #[test]
    fn level_1_password_cannot_read_section_3() {
        let md = sample_metadata();
        let fields = build_validation_fields("patient", "research").unwrap();
        let level_2 = PasswordData::process("research", &fields).unwrap();
        let level_1 = PasswordData::process("patient", &fields).unwrap();

        let plain = md.to_payload().unwrap();
        let mut cipher = plain.clone();
        encrypt_sections(&mut cipher, &level_2).unwrap();
        let (s2_ok, s3_ok) = decrypt_sections(&mut cipher, &level_1);
        assert!(s2_ok);
        assert!(!s3_ok);
        // Section 2 came back; section 3 is still ciphertext.
        assert_eq!(
            cipher[SECTION_2_OFFSET..SECTION_3_OFFSET],
            plain[SECTION_2_OFFSET..SECTION_3_OFFSET]
        );
        assert_ne!(cipher[SECTION_3_OFFSET..], plain[SECTION_3_OFFSET..]);
    }

    #[test]
    fn video_variant_round_trip() {
        let mut md = Metadata::new_video();
        if let MetadataSection2::Video(s2) = &mut md.section_2 {
            s2.frame_rate = 30.0;
            s2.horizontal_pixels = 1920;
            s2.vertical_pixels = 1080;
            s2.video_format = "h264".into();
        }
        let payload = md.to_payload().unwrap();
        let parsed = Metadata::from_payload(&payload, FileTypeCode::VideoMetadata).unwrap();
        let s2 = parsed.section_2.as_video().unwrap();
        assert_eq!(s2.frame_rate, 30.0);
        assert_eq!(s2.horizontal_pixels, 1920);
        assert_eq!(s2.video_format, "h264");
    }
}
