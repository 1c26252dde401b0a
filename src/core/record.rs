#[cfg(not(feature = "std"))]
use alloc::{string::String, vec, vec::Vec};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{MaxActError, Result};
use crate::tensor::{element_count, Tensor};

/// Name of a monitored output.
pub type OutputId = String;

/// Shape of the activations produced by one monitored output, minus the
/// leading batch axis.
///
/// Chosen once when the record is created; batches are checked against it
/// rather than dispatched on their runtime rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum OutputDims {
    /// `(batch, units)` activations.
    Dense { units: usize },
    /// `(batch, units, height, width)` activations.
    Spatial {
        units: usize,
        height: usize,
        width: usize,
    },
}

impl OutputDims {
    pub fn dense(units: usize) -> Self {
        Self::Dense { units }
    }

    pub fn spatial(units: usize, height: usize, width: usize) -> Self {
        Self::Spatial {
            units,
            height,
            width,
        }
    }

    #[inline]
    pub fn units(&self) -> usize {
        match *self {
            Self::Dense { units } | Self::Spatial { units, .. } => units,
        }
    }

    #[inline]
    pub fn is_spatial(&self) -> bool {
        matches!(self, Self::Spatial { .. })
    }

    /// Rank of a batch of activations, batch axis included.
    pub fn activation_rank(&self) -> usize {
        match self {
            Self::Dense { .. } => 2,
            Self::Spatial { .. } => 4,
        }
    }

    /// Per-example activation shape.
    pub fn feature_shape(&self) -> Vec<usize> {
        match *self {
            Self::Dense { units } => vec![units],
            Self::Spatial {
                units,
                height,
                width,
            } => vec![units, height, width],
        }
    }

    /// Number of coordinates stored per slot: the example index, plus row and
    /// column for spatial outputs.
    pub fn coordinate_arity(&self) -> usize {
        match self {
            Self::Dense { .. } => 1,
            Self::Spatial { .. } => 3,
        }
    }

    pub fn has_empty_axis(&self) -> bool {
        self.feature_shape().contains(&0)
    }

    /// Size in bytes of the largest buffer a record with `top_n` slots holds.
    ///
    /// `None` when that size, or the per-example activation count, does not
    /// fit in an allocation.
    pub fn max_buffer_bytes(&self, top_n: usize, snapshots: bool) -> Option<usize> {
        let features = element_count(&self.feature_shape())?;
        let index_bytes = self
            .units()
            .checked_mul(self.coordinate_arity())?
            .checked_mul(core::mem::size_of::<u64>())?;
        let snapshot_bytes = if snapshots && self.is_spatial() {
            features.checked_mul(core::mem::size_of::<f32>())?
        } else {
            0
        };
        let bytes = top_n.checked_mul(index_bytes.max(snapshot_bytes))?;
        (bytes <= isize::MAX as usize).then_some(bytes)
    }
}

/// What a persistent buffer holds, for introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BufferRole {
    Quantity,
    Index,
    Snapshot,
}

impl BufferRole {
    pub fn label(self) -> &'static str {
        match self {
            Self::Quantity => "maximum_activation_quantity",
            Self::Index => "maximum_activation_index",
            Self::Snapshot => "maximum_activation_snapshot",
        }
    }
}

/// Associates a persistent buffer with the output it tracks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferTag {
    pub output: OutputId,
    pub role: BufferRole,
}

/// Initial content of the quantity buffers.
///
/// With `Zero` (the default) the empty slots are zero-valued sentinels that
/// point at example 0. They compete with real activations, so until `top_n`
/// real entries have been seen for a unit, zeros at example 0 can outrank
/// negative activations. `NegativeInfinity` removes that artifact: any finite
/// activation displaces a sentinel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SentinelPolicy {
    #[default]
    Zero,
    NegativeInfinity,
}

impl SentinelPolicy {
    pub fn value(self) -> f32 {
        match self {
            Self::Zero => 0.0,
            Self::NegativeInfinity => f32::NEG_INFINITY,
        }
    }
}

/// Where a recorded activation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Coordinate {
    /// Absolute stream position of the example.
    pub example: u64,
    /// `(row, column)` of the maximum within the feature map (spatial only).
    pub location: Option<(u64, u64)>,
}

/// The persistent top-N state for one monitored output.
///
/// - `quantities`: `(top_n, units)`, each column sorted descending.
/// - `indices`: `(top_n, units)` example positions for dense outputs,
///   `(top_n, units, 3)` `[example, row, column]` triples for spatial ones.
/// - `snapshot`: `(top_n, units, height, width)`, the unit's whole feature map
///   at the time each entry was recorded. Spatial outputs only, optional.
///
/// Slot `i` of unit `u` always describes the same activation across all three
/// buffers. The buffers are only ever replaced wholesale by the controller.
#[derive(Debug, Clone)]
pub struct StatisticsRecord {
    output: OutputId,
    dims: OutputDims,
    top_n: usize,
    pub(crate) quantities: Tensor<f32>,
    pub(crate) indices: Tensor<u64>,
    pub(crate) snapshot: Option<Tensor<f32>>,
}

impl StatisticsRecord {
    /// Allocate sentinel-filled buffers for `top_n` slots.
    ///
    /// # Panics
    ///
    /// If the buffers are not addressable, i.e. when
    /// [`OutputDims::max_buffer_bytes`] returns `None`.
    pub fn new(
        output: OutputId,
        dims: OutputDims,
        top_n: usize,
        sentinel: SentinelPolicy,
        capture_snapshot: bool,
    ) -> Self {
        let units = dims.units();
        let quantities = Tensor::filled(&[top_n, units], sentinel.value());
        let indices = Tensor::zeros(&Self::index_shape(dims, top_n));
        let snapshot = match dims {
            OutputDims::Spatial { .. } if capture_snapshot => {
                Some(Tensor::zeros(&Self::snapshot_shape(dims, top_n)))
            }
            _ => None,
        };
        Self {
            output,
            dims,
            top_n,
            quantities,
            indices,
            snapshot,
        }
    }

    /// Rebuild a record from previously saved buffers, checking every shape.
    pub fn from_parts(
        output: OutputId,
        dims: OutputDims,
        top_n: usize,
        quantities: Tensor<f32>,
        indices: Tensor<u64>,
        snapshot: Option<Tensor<f32>>,
    ) -> Result<Self> {
        let record = Self {
            output,
            dims,
            top_n,
            quantities,
            indices,
            snapshot,
        };
        record.check_shape(BufferRole::Quantity, record.quantities.shape())?;
        record.check_shape(BufferRole::Index, record.indices.shape())?;
        if let Some(snapshot) = &record.snapshot {
            record.check_shape(BufferRole::Snapshot, snapshot.shape())?;
        }
        Ok(record)
    }

    fn index_shape(dims: OutputDims, top_n: usize) -> Vec<usize> {
        match dims {
            OutputDims::Dense { units } => vec![top_n, units],
            OutputDims::Spatial { units, .. } => vec![top_n, units, 3],
        }
    }

    fn snapshot_shape(dims: OutputDims, top_n: usize) -> Vec<usize> {
        let mut shape = vec![top_n];
        shape.extend(dims.feature_shape());
        shape
    }

    /// Expected shape of the buffer with `role`, or `None` if this record has
    /// no such buffer.
    pub fn buffer_shape(&self, role: BufferRole) -> Option<Vec<usize>> {
        match role {
            BufferRole::Quantity => Some(vec![self.top_n, self.dims.units()]),
            BufferRole::Index => Some(Self::index_shape(self.dims, self.top_n)),
            BufferRole::Snapshot if self.dims.is_spatial() && self.snapshot.is_some() => {
                Some(Self::snapshot_shape(self.dims, self.top_n))
            }
            BufferRole::Snapshot => None,
        }
    }

    pub(crate) fn check_shape(&self, role: BufferRole, found: &[usize]) -> Result<()> {
        let target = || buffer_label(&self.output, role);
        let expected = self
            .buffer_shape(role)
            .ok_or_else(|| MaxActError::UnknownBuffer(target()))?;
        if expected != found {
            return Err(MaxActError::BufferShapeMismatch {
                target: target(),
                expected,
                found: found.to_vec(),
            });
        }
        Ok(())
    }

    #[inline]
    pub fn output(&self) -> &str {
        &self.output
    }

    #[inline]
    pub fn dims(&self) -> OutputDims {
        self.dims
    }

    #[inline]
    pub fn top_n(&self) -> usize {
        self.top_n
    }

    pub fn quantities(&self) -> &Tensor<f32> {
        &self.quantities
    }

    pub fn indices(&self) -> &Tensor<u64> {
        &self.indices
    }

    pub fn snapshot(&self) -> Option<&Tensor<f32>> {
        self.snapshot.as_ref()
    }

    /// Activation held in slot `rank` for `unit`.
    pub fn quantity(&self, rank: usize, unit: usize) -> Option<f32> {
        self.quantities.get(&[rank, unit])
    }

    /// Origin of the activation held in slot `rank` for `unit`.
    pub fn coordinate(&self, rank: usize, unit: usize) -> Option<Coordinate> {
        match self.dims {
            OutputDims::Dense { .. } => Some(Coordinate {
                example: self.indices.get(&[rank, unit])?,
                location: None,
            }),
            OutputDims::Spatial { .. } => Some(Coordinate {
                example: self.indices.get(&[rank, unit, 0])?,
                location: Some((
                    self.indices.get(&[rank, unit, 1])?,
                    self.indices.get(&[rank, unit, 2])?,
                )),
            }),
        }
    }

    /// Tags for every buffer this record owns, quantity first.
    pub fn tags(&self) -> Vec<BufferTag> {
        let mut roles = vec![BufferRole::Quantity, BufferRole::Index];
        if self.snapshot.is_some() {
            roles.push(BufferRole::Snapshot);
        }
        roles
            .into_iter()
            .map(|role| BufferTag {
                output: self.output.clone(),
                role,
            })
            .collect()
    }
}

fn buffer_label(output: &str, role: BufferRole) -> String {
    let mut s = String::with_capacity(output.len() + role.label().len() + 1);
    s.push_str(output);
    s.push('/');
    s.push_str(role.label());
    s
}
