//! Block codec for MED time-series data, plus the filter and
//! interpolation kernels the access engine shares with it.
//!
//! A time-series data file is a sequence of self-contained compressed
//! blocks. Each block carries a 56-byte fixed header, optional records /
//! parameter / protected / discretionary regions, an algorithm-specific
//! model region, and the encoded payload. Six encodings exist: range-coded
//! derivatives in two generations (RED1/RED2), their predictive variants
//! (PRED1/PRED2), minimum-bit packing (MBE), and the lossy vectorized
//! data stream (VDS). The [`engine::CodecEngine`] dispatches between
//! them, applies per-block encryption and CRC policy, and owns the
//! lossy-scaling goal loop.

pub use block::{Algorithm, BlockFlags, BlockHeader, BlockParameters};
pub use engine::{
    BlockMeta, CodecDirectives, CodecEngine, CodecParameters, DecodedBlock, DerivativeChoice,
    OverflowChoice, ScaleChoice,
};
pub use filt::{ButterworthFilter, TailMode, moving_average, quantile_filter};
pub use interp::{BinCenterMode, InterpMode, binterpolate, interpolate, linear, makima, spline};

pub mod block;
pub mod deriv;
pub mod engine;
pub mod filt;
pub mod interp;
pub mod mbe;
pub mod pred;
pub mod range;
pub mod red;
pub mod vds;
