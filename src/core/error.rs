#[cfg(not(feature = "std"))]
use alloc::{string::String, vec::Vec};

use thiserror::Error;

/// Everything that can go wrong while building or stepping a maximum
/// activation search.
///
/// Errors raised by `prepare`/`step` are reported before any record is
/// touched, and a rejected bundle leaves the controller exactly as it was.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MaxActError {
    #[error("top_n must be in [1, {max}], got {top_n}")]
    InvalidTopN { top_n: usize, max: usize },

    #[error("no outputs to monitor")]
    NoOutputs,

    #[error("output `{0}` is monitored more than once")]
    DuplicateOutput(String),

    #[error("no dimensions known for output `{0}`")]
    UnknownDims(String),

    #[error("output `{0}` has a zero-sized dimension")]
    EmptyDims(String),

    #[error("output `{output}`: {top_n} slots of this shape exceed the addressable size")]
    BufferTooLarge { output: String, top_n: usize },

    #[error("no activations supplied for output `{0}`")]
    MissingActivations(String),

    #[error("output `{output}`: expected rank {expected} activations, got rank {found}")]
    RankMismatch {
        output: String,
        expected: usize,
        found: usize,
    },

    #[error("output `{output}`: expected activations shaped (batch, {expected:?}), got {found:?}")]
    ShapeMismatch {
        output: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("output `{output}`: batch size {found} differs from the step batch size {expected}")]
    BatchSizeMismatch {
        output: String,
        expected: usize,
        found: usize,
    },

    #[error("update bundle was prepared at stream position {found}, controller is at {expected}")]
    StaleBundle { expected: u64, found: u64 },

    #[error("update bundle belongs to another search")]
    ForeignBundle,

    #[error("update targets unknown buffer {0}")]
    UnknownBuffer(String),

    #[error("update for {target} has shape {found:?}, buffer has {expected:?}")]
    BufferShapeMismatch {
        target: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("tensor data has {found} elements, which does not fill shape {shape:?}")]
    LengthMismatch {
        shape: Vec<usize>,
        /// `None` when the element count of `shape` overflows.
        expected: Option<usize>,
        found: usize,
    },

    #[error("axis {axis} out of range for rank {rank}")]
    AxisOutOfRange { axis: usize, rank: usize },

    #[error("index tensor of rank {found} cannot be padded to rank {target}")]
    IndexRank { target: usize, found: usize },

    #[error("cannot broadcast index extent {found} against data extent {expected} on axis {axis}")]
    Broadcast {
        axis: usize,
        expected: usize,
        found: usize,
    },

    #[error("index {index} out of bounds for axis {axis} of length {len}")]
    IndexOutOfBounds { axis: usize, index: usize, len: usize },

    #[error("cannot concatenate {left:?} with {right:?} along the leading axis")]
    Concat { left: Vec<usize>, right: Vec<usize> },
}

pub type Result<T, E = MaxActError> = core::result::Result<T, E>;
