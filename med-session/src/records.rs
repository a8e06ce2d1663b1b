//! The record plane: reading, filtering, and dispatching typed records.
//!
//! Record bodies stay opaque; collaborator decoders register per type
//! code. `Sgmt` records are decoded natively because the resolver is
//! built on them.

use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;
use tracing::warn;

use med_core::aes;
use med_core::crc::crc;
use med_core::error::{MedError, Result};
use med_core::record::{
    RECORD_CRC_START_OFFSET, RECORD_HEADER_BYTES, RecordHeader, RecordIndexEntry, SgmtRecord,
};
use med_core::types::SGMT_TYPE_CODE;
use med_core::universal_header::UNIVERSAL_HEADER_BYTES;

use crate::context::MedContext;
use crate::fps::{Fps, FpsDirectives};

/// A record data + index file pair, read in full at open.
#[derive(Debug)]
pub struct RecordSet {
    pub data_path: PathBuf,
    /// Index entries, terminal sentinel excluded.
    pub entries: Vec<RecordIndexEntry>,
    data_body: Vec<u8>,
}

impl RecordSet {
    /// Open `<base>.rdat` / `<base>.ridx` under `dir`, if present.
    pub fn open(dir: &Path, base: &str, context: &MedContext) -> Result<Option<RecordSet>> {
        let data_path = dir.join(format!("{base}.rdat"));
        let index_path = dir.join(format!("{base}.ridx"));
        if !data_path.exists() || !index_path.exists() {
            return Ok(None);
        }

        let index_fps = Fps::open_read(&index_path, context, FpsDirectives::default())?;
        let index_body = index_fps.read_body(context.crc_mode.validate_on_input)?;
        let mut entries: Vec<RecordIndexEntry> = index_body
            .chunks_exact(24)
            .map(RecordIndexEntry::from_bytes)
            .collect();
        // The terminal entry marks end of file, not a record.
        entries.pop();

        let data_fps = Fps::open_read(&data_path, context, FpsDirectives::default())?;
        let data_body = data_fps.read_body(context.crc_mode.validate_on_input)?;

        Ok(Some(RecordSet {
            data_path,
            entries,
            data_body,
        }))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn record_at(
        &self,
        entry: &RecordIndexEntry,
        context: &MedContext,
    ) -> Result<(RecordHeader, Vec<u8>)> {
        let start = (entry.file_offset as usize)
            .checked_sub(UNIVERSAL_HEADER_BYTES)
            .ok_or_else(|| MedError::decode("record offset inside the universal header"))?;
        if start + RECORD_HEADER_BYTES > self.data_body.len() {
            return Err(MedError::decode("record offset beyond data file"));
        }
        let header = RecordHeader::from_bytes(&self.data_body[start..])?;
        let total = header.total_record_bytes as usize;
        if start + total > self.data_body.len() {
            return Err(MedError::decode("record extends beyond data file"));
        }
        let record_bytes = &self.data_body[start..start + total];
        if context.crc_mode.validate_on_input {
            let computed = crc(&record_bytes[RECORD_CRC_START_OFFSET..]);
            if computed != header.record_crc {
                return Err(MedError::CrcMismatch {
                    path: self.data_path.clone(),
                    offset: entry.file_offset,
                });
            }
        }
        let mut body = record_bytes[RECORD_HEADER_BYTES..].to_vec();
        if header.encryption_level > 0 {
            match context.password.key_for_level(header.encryption_level) {
                Some(key) => aes::decrypt(&mut body, key),
                None => {
                    return Err(MedError::BadPassword { hint: None });
                }
            }
        }
        Ok((header, body))
    }

    /// Records whose start time falls in `[start_time, end_time]`,
    /// passing the context's type-code filter. The index is binary
    /// searched on start time.
    pub fn records_in_range(
        &self,
        start_time: i64,
        end_time: i64,
        context: &MedContext,
    ) -> Result<Vec<(RecordHeader, Vec<u8>)>> {
        let first = self.entries.partition_point(|e| e.start_time < start_time);
        let mut out = Vec::new();
        for entry in &self.entries[first..] {
            if entry.start_time > end_time {
                break;
            }
            if !context.record_filter.passes(entry.type_code) {
                continue;
            }
            match self.record_at(entry, context) {
                Ok(record) => out.push(record),
                Err(MedError::BadPassword { .. }) => {
                    warn!(
                        type_code = entry.type_code,
                        "skipping record encrypted above the granted access level"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Decode every `Sgmt` record in the set, in segment order.
    pub fn sgmt_records(&self, context: &MedContext) -> Result<Vec<SgmtRecord>> {
        let mut out = Vec::new();
        for entry in &self.entries {
            if entry.type_code != SGMT_TYPE_CODE {
                continue;
            }
            let (header, body) = self.record_at(entry, context)?;
            out.push(SgmtRecord::from_body(header.start_time, &body)?);
        }
        out.sort_by_key(|r| r.segment_number);
        Ok(out)
    }
}

/// Dispatch table for collaborator record decoders, keyed by type code.
type DecoderFn = Box<dyn Fn(&RecordHeader, &[u8]) + Send + Sync>;

#[derive(Default)]
pub struct RecordDecoderRegistry {
    decoders: FxHashMap<u32, DecoderFn>,
}

impl RecordDecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        type_code: u32,
        decoder: impl Fn(&RecordHeader, &[u8]) + Send + Sync + 'static,
    ) {
        self.decoders.insert(type_code, Box::new(decoder));
    }

    /// Invoke the decoder registered for a record's type code. Returns
    /// whether one was registered.
    pub fn dispatch(&self, header: &RecordHeader, body: &[u8]) -> bool {
        match self.decoders.get(&header.type_code) {
            Some(decoder) => {
                decoder(header, body);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for RecordDecoderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordDecoderRegistry")
            .field("type_codes", &self.decoders.keys().collect::<Vec<_>>())
            .finish()
    }
}
