//! The per-call context that replaces the original library's per-thread
//! globals: password state, failure policy, CRC policy, and the record
//! filter. Workers receive a clone, so per-call state is inherited.

use std::sync::Arc;

use med_core::behavior::{Behavior, BehaviorStack};
use med_core::crc::CrcMode;
use med_core::error::Result;
use med_core::password::PasswordData;
use med_core::record::RecordFilter;
use med_core::universal_header::UniversalHeader;

use crate::diag::ReadLog;

/// Context threaded through every entry point.
#[derive(Debug, Clone, Default)]
pub struct MedContext {
    /// The password as supplied; validated against each opened file.
    password_string: Option<String>,
    /// Processed password state after the first successful validation.
    pub password: PasswordData,
    pub behavior: BehaviorStack,
    pub crc_mode: CrcMode,
    pub record_filter: RecordFilter,
    /// Opt-in read-provenance log for diagnosing corrupt files.
    pub read_log: Option<Arc<ReadLog>>,
}

impl MedContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_password(password: &str) -> Self {
        MedContext {
            password_string: Some(password.to_owned()),
            ..Self::default()
        }
    }

    /// Current failure policy.
    pub fn behavior(&self) -> Behavior {
        self.behavior.current()
    }

    /// Check the supplied password against a file's validation fields
    /// without updating the processed state. Every opened file goes
    /// through this; opens without a password skip validation and read
    /// only unencrypted content.
    pub fn check_password(&self, universal_header: &UniversalHeader) -> Result<()> {
        let Some(password) = &self.password_string else {
            return Ok(());
        };
        // Unwritten validation fields mean the file is open-access.
        if universal_header
            .password_validation_fields
            .iter()
            .all(|field| field.iter().all(|&b| b == 0))
        {
            return Ok(());
        }
        PasswordData::process(password, &universal_header.password_validation_fields)?;
        Ok(())
    }

    /// Check the password and retain the processed key schedules for
    /// later decryption. Called once per hierarchy open, on the first
    /// file carrying validation fields.
    pub fn process_password(&mut self, universal_header: &UniversalHeader) -> Result<()> {
        let Some(password) = &self.password_string else {
            return Ok(());
        };
        if universal_header
            .password_validation_fields
            .iter()
            .all(|field| field.iter().all(|&b| b == 0))
        {
            return Ok(());
        }
        let processed =
            PasswordData::process(password, &universal_header.password_validation_fields)?;
        if !self.password.processed {
            self.password = processed;
        }
        Ok(())
    }

    pub fn enable_read_log(&mut self) -> Arc<ReadLog> {
        let log = Arc::new(ReadLog::default());
        self.read_log = Some(Arc::clone(&log));
        log
    }
}
