//! Opt-in read diagnostics.
//!
//! When a context enables the log, every file read appends an event with
//! its path, byte range, and CRC outcome. Reading a foreign or damaged
//! session with the log enabled localizes the first corrupt region
//! without a debugger. This replaces the original allocation tracker's
//! diagnostic role; ownership already rules out the double frees it
//! existed to catch.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One logged read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadEvent {
    pub path: PathBuf,
    pub offset: u64,
    pub bytes: u64,
    /// `None` when no CRC covered this read.
    pub crc_ok: Option<bool>,
}

/// Append-only read log shared across workers.
#[derive(Debug, Default)]
pub struct ReadLog {
    events: Mutex<Vec<ReadEvent>>,
}

impl ReadLog {
    pub fn record(&self, path: &Path, offset: u64, bytes: u64, crc_ok: Option<bool>) {
        self.events.lock().expect("read log poisoned").push(ReadEvent {
            path: path.to_owned(),
            offset,
            bytes,
            crc_ok,
        });
    }

    pub fn events(&self) -> Vec<ReadEvent> {
        self.events.lock().expect("read log poisoned").clone()
    }

    /// The first read whose CRC failed, if any.
    pub fn first_failure(&self) -> Option<ReadEvent> {
        self.events
            .lock()
            .expect("read log poisoned")
            .iter()
            .find(|e| e.crc_ok == Some(false))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_accumulates_and_finds_failures() {
        let log = ReadLog::default();
        log.record(Path::new("a.tdat"), 0, 1024, Some(true));
        log.record(Path::new("a.tdat"), 1024, 512, Some(false));
        log.record(Path::new("a.tidx"), 0, 96, None);
        assert_eq!(log.events().len(), 3);
        let failure = log.first_failure().unwrap();
        assert_eq!(failure.offset, 1024);
        assert_eq!(failure.path, Path::new("a.tdat"));
    }
}
