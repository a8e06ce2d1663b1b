//! Session access engine for MED recordings.
//!
//! A session directory (`<name>.medd`) holds time-series and video
//! channel directories, each holding numbered segment directories of
//! metadata, data, and index files. This crate opens that hierarchy,
//! synthesizes the ephemeral channel- and session-level metadata,
//! resolves time slices between µUTC, sample numbers, and segments
//! through the reference channel's `Sgmt` records, and assembles
//! cross-channel sample matrices with per-channel filtering and
//! resampling fanned out over a worker pool.

pub use channel::{Channel, ChannelKind, VideoChannel};
pub use collab::{HardwareSpecs, HwParams, PasswordPrompt, TimezoneResolver, open_with_prompt};
pub use context::MedContext;
pub use diag::{ReadEvent, ReadLog};
pub use fps::{Fps, FpsDirectives, LockMode};
pub use matrix::{
    DataMatrix, DiscontinuityMode, MatrixData, MatrixFilter, MatrixLayout, MatrixRequest,
    MatrixRequestBuilder, MatrixValueType, get_matrix,
};
pub use records::{RecordDecoderRegistry, RecordSet};
pub use segment::Segment;
pub use session::Session;
pub use slice::{Contiguon, FindMode, SgmtIndex, TimePoint, TimeSlice};
pub use writer::{SegmentPiece, SessionWriter};

pub mod channel;
pub mod collab;
pub mod context;
pub mod diag;
pub mod fps;
pub mod matrix;
pub mod records;
pub mod segment;
pub mod session;
pub mod slice;
pub mod writer;
