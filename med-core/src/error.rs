//! Error types for MED file access.
//!
//! The format defines a closed set of failure kinds ([`ErrorKind`]); the
//! richer [`MedError`] variants carry enough context to report *where* a
//! failure happened (path, byte offset) while still mapping onto that set.

use std::path::PathBuf;
use thiserror::Error;

/// The closed set of failure kinds the format defines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NoError,
    NoFile,
    ReadError,
    WriteError,
    NotMed,
    BadPassword,
    NoMetadata,
    NoInternet,
}

/// Error type for all MED operations.
#[derive(Debug, Error)]
pub enum MedError {
    /// The named file or directory does not exist.
    #[error("no such file: {path}")]
    NoFile { path: PathBuf },

    /// A read failed or returned short.
    #[error("read failed at byte {offset} of {path}: {detail}")]
    Read {
        path: PathBuf,
        offset: u64,
        detail: String,
    },

    /// A CRC did not match its stored value. Reported with the byte
    /// offset of the failing region so corrupted blocks can be located;
    /// any data read before the failure is retained by the caller.
    #[error("CRC mismatch at byte {offset} of {path}")]
    CrcMismatch { path: PathBuf, offset: u64 },

    /// A write failed or wrote short.
    #[error("write failed on {path}: {detail}")]
    Write { path: PathBuf, detail: String },

    /// The file exists but its content is not MED.
    #[error("not a MED file: {path} ({detail})")]
    NotMed { path: PathBuf, detail: String },

    /// The supplied password matched neither validation field.
    #[error("password does not match{}", hint.as_deref().map(|h| format!(" (hint: {h})")).unwrap_or_default())]
    BadPassword { hint: Option<String> },

    /// No metadata file was found where one is required.
    #[error("no metadata found under {path}")]
    NoMetadata { path: PathBuf },

    /// A collaborator required network access and had none.
    #[error("no internet connection")]
    NoInternet,

    /// A block failed to decode.
    #[error("decode failed: {detail}")]
    Decode { detail: String },

    /// A block failed to encode.
    #[error("encode failed: {detail}")]
    Encode { detail: String },

    /// A time slice resolved to an empty intersection.
    #[error("time slice is empty")]
    EmptySlice,

    /// The requested range lies entirely outside the recording.
    #[error("requested range does not exist in the recording")]
    DoesNotExist,

    /// A caller-supplied parameter was out of range or inconsistent.
    #[error("invalid parameter: {detail}")]
    Parameter { detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MedError {
    /// Map this error onto the format's failure-kind set.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MedError::NoFile { .. } => ErrorKind::NoFile,
            MedError::Read { .. }
            | MedError::CrcMismatch { .. }
            | MedError::Decode { .. }
            | MedError::EmptySlice
            | MedError::DoesNotExist => ErrorKind::ReadError,
            MedError::Write { .. } | MedError::Encode { .. } => ErrorKind::WriteError,
            MedError::NotMed { .. } => ErrorKind::NotMed,
            MedError::BadPassword { .. } => ErrorKind::BadPassword,
            MedError::NoMetadata { .. } => ErrorKind::NoMetadata,
            MedError::NoInternet => ErrorKind::NoInternet,
            MedError::Parameter { .. } => ErrorKind::ReadError,
            MedError::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorKind::NoFile,
                _ => ErrorKind::ReadError,
            },
        }
    }

    /// True for failures worth one retry (transient I/O, short reads).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MedError::Read { .. } | MedError::Write { .. } | MedError::Io(_)
        )
    }

    pub fn decode(detail: impl Into<String>) -> Self {
        MedError::Decode {
            detail: detail.into(),
        }
    }

    pub fn encode(detail: impl Into<String>) -> Self {
        MedError::Encode {
            detail: detail.into(),
        }
    }

    pub fn parameter(detail: impl Into<String>) -> Self {
        MedError::Parameter {
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_the_format_set() {
        let e = MedError::CrcMismatch {
            path: PathBuf::from("a.tdat"),
            offset: 1024,
        };
        assert_eq!(e.kind(), ErrorKind::ReadError);
        assert!(e.to_string().contains("1024"));

        let e = MedError::BadPassword { hint: None };
        assert_eq!(e.kind(), ErrorKind::BadPassword);

        let e = MedError::encode("block too large");
        assert_eq!(e.kind(), ErrorKind::WriteError);
    }

    #[test]
    fn bad_password_reports_hint() {
        let e = MedError::BadPassword {
            hint: Some("first pet".into()),
        };
        assert!(e.to_string().contains("first pet"));
    }
}
