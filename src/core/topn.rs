//! Streaming top-N update rule.
//!
//! One call folds one batch of activations into one [`StatisticsRecord`]:
//!
//! 1. Reduce the batch to one candidate per (example, unit): the activation
//!    itself for dense outputs, the feature-map maximum for spatial outputs.
//! 2. Tag each candidate with its coordinate: stream position of the example,
//!    plus `(row, col)` of the maximum for spatial outputs.
//! 3. Stack the record's current `top_n` entries on top of the `batch`
//!    candidates, rank every unit's column in descending order and keep the
//!    first `top_n` rows of the ranking.
//! 4. Gather quantities, coordinates and snapshots through that ranking.
//!
//! The ranking is a stable sort: on equal activations existing entries stay
//! ahead of new ones, and within each group the original order is kept, so
//! the earliest example wins a tie. NaN ranks below every number.
//!
//! NaN inside a feature map is skipped when locating its maximum, so a map
//! with any number in it yields that number as its candidate. This diverges
//! from a NumPy-style `argmax`, which stops at the first NaN: there the unit's
//! candidate would be NaN and rank last. Only an all-NaN map yields a NaN
//! candidate here, located at `(0, 0)`.
//!
//! Nothing here mutates the record; the new buffers are returned for the
//! controller to commit.

#[cfg(not(feature = "std"))]
use alloc::{vec, vec::Vec};

use core::cmp::Ordering;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{MaxActError, Result};
use crate::gather::{gather_by_permutation, gather_by_reduced_index};
use crate::record::{OutputDims, StatisticsRecord};
use crate::tensor::Tensor;

/// Execution tier for ranking.
///
/// - `Scalar`: rank units one after another (default, works everywhere)
/// - `Parallel`: rank units on the rayon pool (requires `parallel` feature)
///
/// Both tiers produce identical results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ExecutionTier {
    #[default]
    Scalar,
    Parallel,
}

impl ExecutionTier {
    /// The tier that will actually run, given the compiled features.
    pub fn effective(self) -> Self {
        match self {
            Self::Parallel if cfg!(feature = "parallel") => Self::Parallel,
            _ => Self::Scalar,
        }
    }
}

/// Post-batch buffers for one record.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordUpdate {
    pub quantities: Tensor<f32>,
    pub indices: Tensor<u64>,
    pub snapshot: Option<Tensor<f32>>,
}

/// Check `batch` against the dims recorded for `record`; returns the batch size.
pub fn check_batch(record: &StatisticsRecord, batch: &Tensor<f32>) -> Result<usize> {
    let dims = record.dims();
    let expected = dims.activation_rank();
    if batch.rank() != expected {
        return Err(MaxActError::RankMismatch {
            output: record.output().into(),
            expected,
            found: batch.rank(),
        });
    }
    let feature = dims.feature_shape();
    if batch.shape()[1..] != feature[..] {
        return Err(MaxActError::ShapeMismatch {
            output: record.output().into(),
            expected: feature,
            found: batch.shape().to_vec(),
        });
    }
    Ok(batch.shape()[0])
}

/// Fold `batch` into `record`, starting at `stream_position`.
pub fn compute_update(
    record: &StatisticsRecord,
    batch: &Tensor<f32>,
    stream_position: u64,
    tier: ExecutionTier,
) -> Result<RecordUpdate> {
    let batch_size = check_batch(record, batch)?;
    let (tmax, tind) = candidates(record.dims(), batch, batch_size, stream_position)?;

    let cmax = record.quantities().concat_leading(&tmax)?;
    let cind = record.indices().concat_leading(&tind)?;
    let perm = rank_top_n(&cmax, record.top_n(), tier)?;

    let quantities = gather_by_permutation(&cmax, &perm, 0)?;
    let indices = gather_by_permutation(&cind, &perm, 0)?;
    let snapshot = match record.snapshot() {
        Some(snap) => Some(gather_by_permutation(&snap.concat_leading(batch)?, &perm, 0)?),
        None => None,
    };

    Ok(RecordUpdate {
        quantities,
        indices,
        snapshot,
    })
}

/// Per-(example, unit) candidate values and their coordinates.
fn candidates(
    dims: OutputDims,
    batch: &Tensor<f32>,
    batch_size: usize,
    stream_position: u64,
) -> Result<(Tensor<f32>, Tensor<u64>)> {
    match dims {
        OutputDims::Dense { units } => {
            let mut ind = Vec::with_capacity(batch_size * units);
            for i in 0..batch_size {
                let example = stream_position + i as u64;
                ind.extend(core::iter::repeat(example).take(units));
            }
            Ok((batch.clone(), Tensor::from_vec(&[batch_size, units], ind)?))
        }
        OutputDims::Spatial {
            units,
            height,
            width,
        } => {
            let arity = dims.coordinate_arity();
            let flat = batch.clone().reshape(&[batch_size, units, height * width])?;
            let argmax = argmax_last_axis(&flat)?;
            let tmax = gather_by_reduced_index(&flat, &argmax, 2)?;

            let mut ind = Vec::with_capacity(batch_size * units * arity);
            for (k, &loc) in argmax.as_slice().iter().enumerate() {
                let example = stream_position + (k / units) as u64;
                ind.extend_from_slice(&[example, (loc / width) as u64, (loc % width) as u64]);
            }
            Ok((tmax, Tensor::from_vec(&[batch_size, units, arity], ind)?))
        }
    }
}

/// Position of the maximum along the last axis, for every other position.
///
/// The first maximum wins. NaN is skipped unless the whole row is NaN (then
/// 0). Unlike NumPy's `argmax`, a NaN does not win over the numbers around it.
pub fn argmax_last_axis(data: &Tensor<f32>) -> Result<Tensor<usize>> {
    let rank = data.rank();
    if rank == 0 {
        return Err(MaxActError::AxisOutOfRange { axis: 0, rank });
    }
    let n = data.shape()[rank - 1];
    let out_shape = &data.shape()[..rank - 1];
    if n == 0 {
        return Err(MaxActError::IndexOutOfBounds {
            axis: rank - 1,
            index: 0,
            len: 0,
        });
    }
    let out: Vec<usize> = data.as_slice().chunks_exact(n).map(argmax_row).collect();
    Tensor::from_vec(out_shape, out)
}

fn argmax_row(row: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in row.iter().enumerate().skip(1) {
        let b = row[best];
        if v > b || (b.is_nan() && !v.is_nan()) {
            best = i;
        }
    }
    best
}

#[inline]
fn descending(a: f32, b: f32) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (false, false) => b.partial_cmp(&a).unwrap_or(Ordering::Equal),
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (true, true) => Ordering::Equal,
    }
}

/// Rank each column of a `(m, units)` stack and keep the first `top_n` rows.
///
/// Returns a `(top_n, units)` permutation: entry `[k, u]` is the row of the
/// `k`-th largest value of unit `u`.
pub fn rank_top_n(merged: &Tensor<f32>, top_n: usize, tier: ExecutionTier) -> Result<Tensor<usize>> {
    if merged.rank() != 2 {
        return Err(MaxActError::IndexRank {
            target: 2,
            found: merged.rank(),
        });
    }
    let (m, units) = (merged.shape()[0], merged.shape()[1]);
    if top_n > m {
        return Err(MaxActError::IndexOutOfBounds {
            axis: 0,
            index: top_n,
            len: m,
        });
    }

    let values = merged.as_slice();
    let columns = rank_columns(values, m, units, top_n, tier);

    let mut perm = vec![0usize; top_n * units];
    for (u, column) in columns.iter().enumerate() {
        for (k, &row) in column.iter().enumerate() {
            perm[k * units + u] = row;
        }
    }
    Tensor::from_vec(&[top_n, units], perm)
}

fn rank_columns(
    values: &[f32],
    m: usize,
    units: usize,
    top_n: usize,
    tier: ExecutionTier,
) -> Vec<Vec<usize>> {
    if tier.effective() == ExecutionTier::Parallel {
        #[cfg(feature = "parallel")]
        return (0..units)
            .into_par_iter()
            .map(|u| rank_unit(values, m, units, u, top_n))
            .collect();
    }
    (0..units)
        .map(|u| rank_unit(values, m, units, u, top_n))
        .collect()
}

fn rank_unit(values: &[f32], m: usize, units: usize, unit: usize, top_n: usize) -> Vec<usize> {
    let column: Vec<f32> = (0..m).map(|row| values[row * units + unit]).collect();
    let mut order: Vec<usize> = (0..m).collect();
    // `sort_by` is stable: equal values keep their stacking order.
    order.sort_by(|&a, &b| descending(column[a], column[b]));
    order.truncate(top_n);
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SentinelPolicy;

    fn dense_record(units: usize, top_n: usize) -> StatisticsRecord {
        StatisticsRecord::new("fc".into(), OutputDims::dense(units), top_n, SentinelPolicy::Zero, true)
    }

    fn commit(record: &mut StatisticsRecord, update: RecordUpdate) {
        record.quantities = update.quantities;
        record.indices = update.indices;
        record.snapshot = update.snapshot;
    }

    #[test]
    fn dense_top_two_displaces_smallest() {
        let mut record = dense_record(1, 2);

        let b1 = Tensor::from_vec(&[2, 1], vec![5.0, 1.0]).unwrap();
        let u1 = compute_update(&record, &b1, 0, ExecutionTier::Scalar).unwrap();
        assert_eq!(u1.quantities.as_slice(), &[5.0, 1.0]);
        assert_eq!(u1.indices.as_slice(), &[0, 1]);
        commit(&mut record, u1);

        let b2 = Tensor::from_vec(&[1, 1], vec![3.0]).unwrap();
        let u2 = compute_update(&record, &b2, 2, ExecutionTier::Scalar).unwrap();
        assert_eq!(u2.quantities.as_slice(), &[5.0, 3.0]);
        assert_eq!(u2.indices.as_slice(), &[0, 2]);
    }

    #[test]
    fn spatial_maximum_records_location() {
        let record = StatisticsRecord::new(
            "conv".into(),
            OutputDims::spatial(1, 2, 2),
            1,
            SentinelPolicy::Zero,
            true,
        );
        let batch = Tensor::from_vec(&[1, 1, 2, 2], vec![1.0, 9.0, 2.0, 3.0]).unwrap();
        let u = compute_update(&record, &batch, 0, ExecutionTier::Scalar).unwrap();
        assert_eq!(u.quantities.as_slice(), &[9.0]);
        assert_eq!(u.indices.shape(), &[1, 1, 3]);
        assert_eq!(u.indices.as_slice(), &[0, 0, 1]);
        assert_eq!(
            u.snapshot.as_ref().map(|s| s.as_slice().to_vec()),
            Some(vec![1.0, 9.0, 2.0, 3.0])
        );
    }

    #[test]
    fn spatial_location_decomposes_by_width() {
        // 2x3 map with the maximum at row 1, col 2.
        let record = StatisticsRecord::new(
            "conv".into(),
            OutputDims::spatial(1, 2, 3),
            1,
            SentinelPolicy::Zero,
            false,
        );
        let batch = Tensor::from_vec(&[1, 1, 2, 3], vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6]).unwrap();
        let u = compute_update(&record, &batch, 7, ExecutionTier::Scalar).unwrap();
        assert_eq!(u.indices.as_slice(), &[7, 1, 2]);
        assert!(u.snapshot.is_none());
    }

    #[test]
    fn small_batch_keeps_sentinels() {
        let record = dense_record(2, 5);
        let batch = Tensor::from_vec(&[3, 2], vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]).unwrap();
        let u = compute_update(&record, &batch, 0, ExecutionTier::Scalar).unwrap();
        assert_eq!(u.quantities.shape(), &[5, 2]);
        assert_eq!(u.indices.shape(), &[5, 2]);
        // Column 0: 3, 2, 1 then the two zero sentinels.
        let col0: Vec<f32> = (0..5).map(|k| u.quantities.get(&[k, 0]).unwrap()).collect();
        assert_eq!(col0, vec![3.0, 2.0, 1.0, 0.0, 0.0]);
        let idx0: Vec<u64> = (0..5).map(|k| u.indices.get(&[k, 0]).unwrap()).collect();
        assert_eq!(idx0, vec![2, 1, 0, 0, 0]);
    }

    #[test]
    fn ties_prefer_existing_then_earlier_examples() {
        let mut record = dense_record(1, 2);
        let b1 = Tensor::from_vec(&[2, 1], vec![4.0, 4.0]).unwrap();
        let u1 = compute_update(&record, &b1, 0, ExecutionTier::Scalar).unwrap();
        assert_eq!(u1.indices.as_slice(), &[0, 1]);
        commit(&mut record, u1);

        let b2 = Tensor::from_vec(&[2, 1], vec![4.0, 4.0]).unwrap();
        let u2 = compute_update(&record, &b2, 2, ExecutionTier::Scalar).unwrap();
        assert_eq!(u2.indices.as_slice(), &[0, 1]);
    }

    #[test]
    fn negative_activations_lose_to_zero_sentinels() {
        let record = dense_record(1, 2);
        let batch = Tensor::from_vec(&[2, 1], vec![-1.0, -2.0]).unwrap();
        let u = compute_update(&record, &batch, 0, ExecutionTier::Scalar).unwrap();
        assert_eq!(u.quantities.as_slice(), &[0.0, 0.0]);

        let record = StatisticsRecord::new(
            "fc".into(),
            OutputDims::dense(1),
            2,
            SentinelPolicy::NegativeInfinity,
            true,
        );
        let u = compute_update(&record, &batch, 0, ExecutionTier::Scalar).unwrap();
        assert_eq!(u.quantities.as_slice(), &[-1.0, -2.0]);
        assert_eq!(u.indices.as_slice(), &[0, 1]);
    }

    #[test]
    fn nan_ranks_last() {
        let record = dense_record(1, 2);
        let batch = Tensor::from_vec(&[3, 1], vec![f32::NAN, 2.0, 1.0]).unwrap();
        let u = compute_update(&record, &batch, 0, ExecutionTier::Scalar).unwrap();
        assert_eq!(u.quantities.as_slice(), &[2.0, 1.0]);
        assert_eq!(u.indices.as_slice(), &[1, 2]);
    }

    #[test]
    fn argmax_skips_nan_and_prefers_first() {
        let data = Tensor::from_vec(
            &[3, 3],
            vec![f32::NAN, 1.0, 0.5, 2.0, 2.0, 1.0, f32::NAN, f32::NAN, f32::NAN],
        )
        .unwrap();
        let am = argmax_last_axis(&data).unwrap();
        assert_eq!(am.as_slice(), &[1, 0, 0]);
    }

    #[test]
    fn nan_in_feature_map_does_not_become_the_candidate() {
        let record = StatisticsRecord::new(
            "conv".into(),
            OutputDims::spatial(1, 1, 3),
            4,
            SentinelPolicy::NegativeInfinity,
            false,
        );
        let batch = Tensor::from_vec(
            &[2, 1, 1, 3],
            vec![f32::NAN, 3.0, 1.0, f32::NAN, f32::NAN, f32::NAN],
        )
        .unwrap();
        let u = compute_update(&record, &batch, 0, ExecutionTier::Scalar).unwrap();
        assert_eq!(u.quantities.get(&[0, 0]), Some(3.0));
        assert_eq!(u.quantities.get(&[1, 0]), Some(f32::NEG_INFINITY));
        assert!(u.quantities.get(&[3, 0]).unwrap().is_nan());
        assert_eq!(
            u.indices.as_slice(),
            &[0, 0, 1, 0, 0, 0, 0, 0, 0, 1, 0, 0]
        );
    }

    #[test]
    fn rank_mismatch_is_rejected() {
        let record = dense_record(3, 2);
        let batch = Tensor::<f32>::zeros(&[2, 3, 1, 1]);
        assert_eq!(
            compute_update(&record, &batch, 0, ExecutionTier::Scalar).unwrap_err(),
            MaxActError::RankMismatch {
                output: "fc".into(),
                expected: 2,
                found: 4
            }
        );

        let batch = Tensor::<f32>::zeros(&[2, 4]);
        assert!(matches!(
            compute_update(&record, &batch, 0, ExecutionTier::Scalar),
            Err(MaxActError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn empty_batch_keeps_state() {
        let record = dense_record(2, 3);
        let batch = Tensor::<f32>::zeros(&[0, 2]);
        let u = compute_update(&record, &batch, 4, ExecutionTier::Scalar).unwrap();
        assert_eq!(&u.quantities, record.quantities());
        assert_eq!(&u.indices, record.indices());
    }

    #[test]
    fn parallel_tier_matches_scalar() {
        let units = 16;
        let record = dense_record(units, 4);
        let data: Vec<f32> = (0..10 * units)
            .map(|i| ((i * 7919) % 113) as f32 - 40.0)
            .collect();
        let batch = Tensor::from_vec(&[10, units], data).unwrap();
        let scalar = compute_update(&record, &batch, 0, ExecutionTier::Scalar).unwrap();
        let parallel = compute_update(&record, &batch, 0, ExecutionTier::Parallel).unwrap();
        assert_eq!(scalar, parallel);
    }
}
