//! # maxact
//!
//! Streaming per-unit top-N maximum activation tracking.
//!
//! Feed batches of activations from a set of monitored network outputs and
//! keep, for every unit, the `top_n` strongest activations seen so far along
//! with where in the stream (and, for convolutional outputs, where in the
//! feature map) each one came from.
//!
//! ## Quick Start
//!
//! ```
//! use maxact::prelude::*;
//!
//! let outputs = vec![
//!     MonitoredOutput::dense("fc1", 4),
//!     MonitoredOutput::spatial("conv1", 2, 3, 3),
//! ];
//! let config = SearchConfig::default().with_top_n(5);
//! let mut search = MaximumActivationSearch::new(outputs, &(), config).unwrap();
//!
//! let fc1 = Tensor::<f32>::zeros(&[8, 4]);
//! let conv1 = Tensor::<f32>::zeros(&[8, 2, 3, 3]);
//! let batch = ActivationBatch::new().with("fc1", &fc1).with("conv1", &conv1);
//!
//! // Either in one go...
//! search.step(&batch).unwrap();
//!
//! // ...or staged, letting the caller decide when to apply.
//! let bundle = search.prepare(&batch).unwrap();
//! search.commit(bundle).unwrap();
//!
//! assert_eq!(search.stream_position(), 16);
//! ```
//!
//! ## Feature Flags
//!
//! - `std` (default): Standard library support, checkpoint images and observers
//! - `serde` (default): Serialization of configs and observer snapshots
//! - `parallel`: Rank units on multiple threads via rayon
//! - `cli`: Build the `maxact-cli` binary
//!
//! ## no_std Support
//!
//! Disable default features for `no_std` environments:
//! ```toml
//! maxact = { version = "0.1", default-features = false }
//! ```
//!
//! ## Modules
//!
//! - [`tensor`]: Flat row-major tensors
//! - [`gather`]: Reindexing by permutations and reduced indices
//! - [`record`]: Per-output top-N state
//! - [`topn`]: The streaming update rule
//! - [`search`]: The controller and its update bundles
//! - [`storage`]: Checkpoint images
//! - [`observer`]: Read-only views of the tables

// no_std support
#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(not(feature = "std"))]
extern crate alloc;

#[path = "core/error.rs"]
pub mod error;

#[path = "core/tensor.rs"]
pub mod tensor;

#[path = "core/gather.rs"]
pub mod gather;

#[path = "core/record.rs"]
pub mod record;

#[path = "core/topn.rs"]
pub mod topn;

#[path = "core/search.rs"]
pub mod search;

#[cfg(feature = "std")]
#[path = "core/storage.rs"]
pub mod storage;

#[cfg(feature = "std")]
pub mod observer;

/// Prelude module for convenient imports.
///
/// ```
/// use maxact::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{MaxActError, Result};
    pub use crate::record::{
        BufferRole, BufferTag, Coordinate, OutputDims, OutputId, SentinelPolicy, StatisticsRecord,
    };
    pub use crate::search::{
        ActivationBatch, BufferId, MaximumActivationSearch, MonitoredOutput, PendingUpdate,
        SearchConfig, ShapeQuery, UpdateBundle,
    };
    pub use crate::tensor::Tensor;
    pub use crate::topn::ExecutionTier;
    #[cfg(feature = "std")]
    pub use crate::observer::{SearchAdapter, SearchSnapshot, TopActivationTable};
}
