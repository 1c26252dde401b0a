#[cfg(not(feature = "std"))]
use alloc::{format, vec::Vec};

#[cfg(feature = "std")]
use std::collections::HashMap;

#[cfg(not(feature = "std"))]
use hashbrown::HashMap;

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{MaxActError, Result};
use crate::record::{BufferRole, BufferTag, OutputDims, OutputId, SentinelPolicy, StatisticsRecord};
use crate::tensor::Tensor;
use crate::topn::{self, ExecutionTier, RecordUpdate};

/// Source of output dimensions for outputs registered without explicit dims.
pub trait ShapeQuery {
    fn output_dims(&self, output: &str) -> Option<OutputDims>;
}

/// No shape source: every output must carry explicit dims.
impl ShapeQuery for () {
    fn output_dims(&self, _output: &str) -> Option<OutputDims> {
        None
    }
}

impl ShapeQuery for HashMap<OutputId, OutputDims> {
    fn output_dims(&self, output: &str) -> Option<OutputDims> {
        self.get(output).copied()
    }
}

/// An output whose activations are tracked.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MonitoredOutput {
    pub name: OutputId,
    /// Explicit dims; when `None` they are asked from the [`ShapeQuery`].
    #[cfg_attr(feature = "serde", serde(default))]
    pub dims: Option<OutputDims>,
}

impl MonitoredOutput {
    pub fn new(name: impl Into<OutputId>) -> Self {
        Self {
            name: name.into(),
            dims: None,
        }
    }

    pub fn dense(name: impl Into<OutputId>, units: usize) -> Self {
        Self::new(name).with_dims(OutputDims::dense(units))
    }

    pub fn spatial(name: impl Into<OutputId>, units: usize, height: usize, width: usize) -> Self {
        Self::new(name).with_dims(OutputDims::spatial(units, height, width))
    }

    pub fn with_dims(mut self, dims: OutputDims) -> Self {
        self.dims = Some(dims);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SearchConfig {
    /// Number of top activations kept per unit.
    pub top_n: usize,
    /// Keep the full feature map of every recorded spatial activation.
    pub capture_snapshots: bool,
    /// Initial content of empty slots.
    pub sentinel: SentinelPolicy,
    pub execution_tier: ExecutionTier,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            top_n: Self::DEFAULT_TOP_N,
            capture_snapshots: true,
            sentinel: SentinelPolicy::Zero,
            execution_tier: ExecutionTier::Scalar,
        }
    }
}

impl SearchConfig {
    pub const DEFAULT_TOP_N: usize = 100;
    /// Upper bound on `top_n` (slot indices must fit the image format's u32).
    pub const MAX_TOP_N: usize = 1 << 24;

    pub fn with_top_n(mut self, top_n: usize) -> Self {
        self.top_n = top_n;
        self
    }

    pub fn with_snapshots(mut self, capture: bool) -> Self {
        self.capture_snapshots = capture;
        self
    }

    pub fn with_sentinel(mut self, sentinel: SentinelPolicy) -> Self {
        self.sentinel = sentinel;
        self
    }

    pub fn with_execution_tier(mut self, tier: ExecutionTier) -> Self {
        self.execution_tier = tier;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.top_n == 0 || self.top_n > Self::MAX_TOP_N {
            return Err(MaxActError::InvalidTopN {
                top_n: self.top_n,
                max: Self::MAX_TOP_N,
            });
        }
        Ok(())
    }
}

/// One step's activations, keyed by output name.
#[derive(Debug, Clone, Default)]
pub struct ActivationBatch<'a> {
    entries: Vec<(&'a str, &'a Tensor<f32>)>,
}

impl<'a> ActivationBatch<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) the activations of `output`.
    pub fn insert(&mut self, output: &'a str, activations: &'a Tensor<f32>) {
        match self.entries.iter_mut().find(|(name, _)| *name == output) {
            Some(entry) => entry.1 = activations,
            None => self.entries.push((output, activations)),
        }
    }

    pub fn with(mut self, output: &'a str, activations: &'a Tensor<f32>) -> Self {
        self.insert(output, activations);
        self
    }

    pub fn get(&self, output: &str) -> Option<&'a Tensor<f32>> {
        self.entries
            .iter()
            .find(|(name, _)| *name == output)
            .map(|(_, t)| *t)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Identifies a persistent buffer owned by a [`MaximumActivationSearch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferId {
    Record { record: usize, role: BufferRole },
    StreamPosition,
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Record { record, role } => write!(f, "record {}/{}", record, role.label()),
            Self::StreamPosition => f.write_str("stream position"),
        }
    }
}

/// A deferred replacement of one buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingUpdate {
    Quantities { record: usize, value: Tensor<f32> },
    Indices { record: usize, value: Tensor<u64> },
    Snapshot { record: usize, value: Tensor<f32> },
    StreamPosition { value: u64 },
}

impl PendingUpdate {
    pub fn target(&self) -> BufferId {
        match *self {
            Self::Quantities { record, .. } => BufferId::Record {
                record,
                role: BufferRole::Quantity,
            },
            Self::Indices { record, .. } => BufferId::Record {
                record,
                role: BufferRole::Index,
            },
            Self::Snapshot { record, .. } => BufferId::Record {
                record,
                role: BufferRole::Snapshot,
            },
            Self::StreamPosition { .. } => BufferId::StreamPosition,
        }
    }

    fn value_shape(&self) -> &[usize] {
        match self {
            Self::Quantities { value, .. } | Self::Snapshot { value, .. } => value.shape(),
            Self::Indices { value, .. } => value.shape(),
            Self::StreamPosition { .. } => &[],
        }
    }
}

/// Every pending update of one step.
///
/// A bundle is tied to the search that prepared it and to the stream
/// position it was prepared against, and is applied all-or-nothing by
/// [`MaximumActivationSearch::commit`]. Committing advances the stream
/// position, so the same bundle can never be applied twice.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateBundle {
    owner: u64,
    base_position: u64,
    batch_size: usize,
    updates: Vec<PendingUpdate>,
}

impl UpdateBundle {
    pub fn base_position(&self) -> u64 {
        self.base_position
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn updates(&self) -> &[PendingUpdate] {
        &self.updates
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

/// Tracks the top-N maximally activating examples of every unit of a set of
/// monitored outputs across a stream of batches.
///
/// ```
/// use maxact::prelude::*;
///
/// let outputs = vec![MonitoredOutput::dense("fc1", 1)];
/// let mut search =
///     MaximumActivationSearch::new(outputs, &(), SearchConfig::default().with_top_n(2)).unwrap();
///
/// let acts = Tensor::from_vec(&[2, 1], vec![5.0, 1.0]).unwrap();
/// search.step(&ActivationBatch::new().with("fc1", &acts)).unwrap();
///
/// let acts = Tensor::from_vec(&[1, 1], vec![3.0]).unwrap();
/// search.step(&ActivationBatch::new().with("fc1", &acts)).unwrap();
///
/// let record = search.record("fc1").unwrap();
/// assert_eq!(record.quantities().as_slice(), &[5.0, 3.0]);
/// assert_eq!(record.indices().as_slice(), &[0, 2]);
/// assert_eq!(search.stream_position(), 3);
/// ```
#[derive(Debug)]
pub struct MaximumActivationSearch {
    id: u64,
    config: SearchConfig,
    records: Vec<StatisticsRecord>,
    lookup: HashMap<OutputId, usize>,
    stream_position: u64,
}

static NEXT_SEARCH_ID: AtomicU64 = AtomicU64::new(0);

fn next_search_id() -> u64 {
    NEXT_SEARCH_ID.fetch_add(1, Ordering::Relaxed)
}

/// A clone is a separate search: bundles prepared by one are rejected by the
/// other.
impl Clone for MaximumActivationSearch {
    fn clone(&self) -> Self {
        Self {
            id: next_search_id(),
            config: self.config,
            records: self.records.clone(),
            lookup: self.lookup.clone(),
            stream_position: self.stream_position,
        }
    }
}

impl MaximumActivationSearch {
    /// Allocate one record per output, in order.
    ///
    /// Explicit dims on a [`MonitoredOutput`] take precedence over `shapes`.
    pub fn new<Q: ShapeQuery + ?Sized>(
        outputs: Vec<MonitoredOutput>,
        shapes: &Q,
        config: SearchConfig,
    ) -> Result<Self> {
        config.validate()?;
        if outputs.is_empty() {
            return Err(MaxActError::NoOutputs);
        }

        let mut records = Vec::with_capacity(outputs.len());
        for output in outputs {
            let dims = output
                .dims
                .or_else(|| shapes.output_dims(&output.name))
                .ok_or_else(|| MaxActError::UnknownDims(output.name.clone()))?;
            if dims.has_empty_axis() {
                return Err(MaxActError::EmptyDims(output.name));
            }
            if dims
                .max_buffer_bytes(config.top_n, config.capture_snapshots)
                .is_none()
            {
                return Err(MaxActError::BufferTooLarge {
                    output: output.name,
                    top_n: config.top_n,
                });
            }
            records.push(StatisticsRecord::new(
                output.name,
                dims,
                config.top_n,
                config.sentinel,
                config.capture_snapshots,
            ));
        }

        let search = Self::from_records(config, records, 0)?;
        tracing::debug!(
            outputs = search.records.len(),
            top_n = config.top_n,
            tier = ?config.execution_tier.effective(),
            "allocated maximum activation records"
        );
        Ok(search)
    }

    /// Reassemble a controller from existing records (all sized for `config.top_n`).
    pub(crate) fn from_records(
        config: SearchConfig,
        records: Vec<StatisticsRecord>,
        stream_position: u64,
    ) -> Result<Self> {
        config.validate()?;
        if records.is_empty() {
            return Err(MaxActError::NoOutputs);
        }
        let mut lookup: HashMap<OutputId, usize> = HashMap::with_capacity(records.len());
        for (i, record) in records.iter().enumerate() {
            if record.top_n() != config.top_n {
                return Err(MaxActError::InvalidTopN {
                    top_n: record.top_n(),
                    max: config.top_n,
                });
            }
            if record
                .dims()
                .max_buffer_bytes(config.top_n, record.snapshot().is_some())
                .is_none()
            {
                return Err(MaxActError::BufferTooLarge {
                    output: record.output().into(),
                    top_n: config.top_n,
                });
            }
            if lookup.insert(record.output().into(), i).is_some() {
                return Err(MaxActError::DuplicateOutput(record.output().into()));
            }
        }
        Ok(Self {
            id: next_search_id(),
            config,
            records,
            lookup,
            stream_position,
        })
    }

    #[inline]
    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    #[inline]
    pub fn top_n(&self) -> usize {
        self.config.top_n
    }

    /// Number of examples folded in so far.
    #[inline]
    pub fn stream_position(&self) -> u64 {
        self.stream_position
    }

    pub fn records(&self) -> &[StatisticsRecord] {
        &self.records
    }

    pub fn record(&self, output: &str) -> Option<&StatisticsRecord> {
        self.lookup.get(output).map(|&i| &self.records[i])
    }

    pub fn outputs(&self) -> impl Iterator<Item = &str> + '_ {
        self.records.iter().map(|r| r.output())
    }

    /// Tags of every persistent buffer, in record order.
    pub fn tags(&self) -> Vec<BufferTag> {
        self.records.iter().flat_map(|r| r.tags()).collect()
    }

    /// Compute the update bundle for one batch without touching any state.
    ///
    /// Every output must be present in `batch`, match its recorded dims, and
    /// share one batch size; all of this is checked before any top-N work.
    pub fn prepare(&self, batch: &ActivationBatch<'_>) -> Result<UpdateBundle> {
        let mut inputs = Vec::with_capacity(self.records.len());
        let mut batch_size: Option<usize> = None;
        for record in &self.records {
            let acts = batch
                .get(record.output())
                .ok_or_else(|| MaxActError::MissingActivations(record.output().into()))?;
            let size = topn::check_batch(record, acts)?;
            match batch_size {
                None => batch_size = Some(size),
                Some(expected) if expected != size => {
                    return Err(MaxActError::BatchSizeMismatch {
                        output: record.output().into(),
                        expected,
                        found: size,
                    });
                }
                Some(_) => {}
            }
            inputs.push(acts);
        }
        let batch_size = batch_size.unwrap_or(0);

        let results = self.compute_all(&inputs)?;

        let mut updates = Vec::with_capacity(self.records.len() * 3 + 1);
        for (record, update) in results.into_iter().enumerate() {
            updates.push(PendingUpdate::Quantities {
                record,
                value: update.quantities,
            });
            updates.push(PendingUpdate::Indices {
                record,
                value: update.indices,
            });
            if let Some(value) = update.snapshot {
                updates.push(PendingUpdate::Snapshot { record, value });
            }
        }
        updates.push(PendingUpdate::StreamPosition {
            value: self.stream_position + batch_size as u64,
        });

        Ok(UpdateBundle {
            owner: self.id,
            base_position: self.stream_position,
            batch_size,
            updates,
        })
    }

    fn compute_all(&self, inputs: &[&Tensor<f32>]) -> Result<Vec<RecordUpdate>> {
        let tier = self.config.execution_tier.effective();
        let position = self.stream_position;
        if tier == ExecutionTier::Parallel && self.records.len() > 1 {
            #[cfg(feature = "parallel")]
            return self
                .records
                .par_iter()
                .zip(inputs.par_iter())
                .map(|(record, acts)| topn::compute_update(record, acts, position, tier))
                .collect();
        }
        self.records
            .iter()
            .zip(inputs)
            .map(|(record, acts)| topn::compute_update(record, acts, position, tier))
            .collect()
    }

    /// Apply a bundle prepared by [`prepare`](Self::prepare).
    ///
    /// The whole bundle is validated first; if it was prepared by another
    /// search, is stale, or holds an update that targets a missing buffer or
    /// has the wrong shape, nothing is applied.
    pub fn commit(&mut self, bundle: UpdateBundle) -> Result<()> {
        if bundle.owner != self.id {
            tracing::warn!(
                bundle = bundle.owner,
                search = self.id,
                "rejecting update bundle prepared by another search"
            );
            return Err(MaxActError::ForeignBundle);
        }
        if bundle.base_position != self.stream_position {
            tracing::warn!(
                bundle = bundle.base_position,
                current = self.stream_position,
                "rejecting stale update bundle"
            );
            return Err(MaxActError::StaleBundle {
                expected: self.stream_position,
                found: bundle.base_position,
            });
        }
        for update in &bundle.updates {
            self.check_update(update)?;
        }

        let batch_size = bundle.batch_size;
        for update in bundle.updates {
            self.apply_update(update);
        }
        tracing::debug!(
            batch_size,
            stream_position = self.stream_position,
            outputs = self.records.len(),
            "committed maximum activation update"
        );
        Ok(())
    }

    /// Prepare and commit one batch.
    pub fn step(&mut self, batch: &ActivationBatch<'_>) -> Result<()> {
        let bundle = self.prepare(batch)?;
        self.commit(bundle)
    }

    fn check_update(&self, update: &PendingUpdate) -> Result<()> {
        match update.target() {
            BufferId::Record { record, role } => self
                .records
                .get(record)
                .ok_or_else(|| MaxActError::UnknownBuffer(format!("{}", update.target())))?
                .check_shape(role, update.value_shape()),
            BufferId::StreamPosition => Ok(()),
        }
    }

    fn apply_update(&mut self, update: PendingUpdate) {
        match update {
            PendingUpdate::Quantities { record, value } => self.records[record].quantities = value,
            PendingUpdate::Indices { record, value } => self.records[record].indices = value,
            PendingUpdate::Snapshot { record, value } => {
                self.records[record].snapshot = Some(value)
            }
            PendingUpdate::StreamPosition { value } => self.stream_position = value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dense_search(units: usize, top_n: usize) -> MaximumActivationSearch {
        MaximumActivationSearch::new(
            vec![MonitoredOutput::dense("fc", units)],
            &(),
            SearchConfig::default().with_top_n(top_n),
        )
        .unwrap()
    }

    #[test]
    fn construction_rejects_degenerate_top_n() {
        for top_n in [0, SearchConfig::MAX_TOP_N + 1] {
            let err = MaximumActivationSearch::new(
                vec![MonitoredOutput::dense("fc", 2)],
                &(),
                SearchConfig::default().with_top_n(top_n),
            )
            .unwrap_err();
            assert!(matches!(err, MaxActError::InvalidTopN { .. }));
        }
    }

    #[test]
    fn construction_checks_outputs() {
        let cfg = SearchConfig::default();
        assert_eq!(
            MaximumActivationSearch::new(vec![], &(), cfg).unwrap_err(),
            MaxActError::NoOutputs
        );
        assert_eq!(
            MaximumActivationSearch::new(vec![MonitoredOutput::new("fc")], &(), cfg).unwrap_err(),
            MaxActError::UnknownDims("fc".into())
        );
        assert_eq!(
            MaximumActivationSearch::new(
                vec![MonitoredOutput::dense("fc", 2), MonitoredOutput::dense("fc", 3)],
                &(),
                cfg
            )
            .unwrap_err(),
            MaxActError::DuplicateOutput("fc".into())
        );
        assert_eq!(
            MaximumActivationSearch::new(vec![MonitoredOutput::spatial("c", 2, 0, 3)], &(), cfg)
                .unwrap_err(),
            MaxActError::EmptyDims("c".into())
        );
    }

    #[test]
    fn construction_rejects_unaddressable_buffers() {
        let err = MaximumActivationSearch::new(
            vec![
                MonitoredOutput::dense("fc", 4),
                MonitoredOutput::spatial("c", 1, 1 << 30, 1 << 30),
            ],
            &(),
            SearchConfig::default().with_top_n(16),
        )
        .unwrap_err();
        assert_eq!(
            err,
            MaxActError::BufferTooLarge {
                output: "c".into(),
                top_n: 16
            }
        );

        let err = MaximumActivationSearch::new(
            vec![MonitoredOutput::spatial("c", usize::MAX, 2, 2)],
            &(),
            SearchConfig::default().with_snapshots(false),
        )
        .unwrap_err();
        assert!(matches!(err, MaxActError::BufferTooLarge { .. }));
    }

    #[test]
    fn dims_come_from_shape_query_unless_explicit() {
        let mut shapes: HashMap<OutputId, OutputDims> = HashMap::new();
        shapes.insert("conv".into(), OutputDims::spatial(4, 3, 3));
        shapes.insert("fc".into(), OutputDims::dense(10));

        let search = MaximumActivationSearch::new(
            vec![MonitoredOutput::new("conv"), MonitoredOutput::dense("fc", 6)],
            &shapes,
            SearchConfig::default().with_top_n(5),
        )
        .unwrap();
        assert_eq!(search.record("conv").unwrap().dims(), OutputDims::spatial(4, 3, 3));
        assert_eq!(search.record("fc").unwrap().dims(), OutputDims::dense(6));
        assert_eq!(search.outputs().collect::<Vec<_>>(), vec!["conv", "fc"]);
        assert_eq!(search.tags().len(), 5);
    }

    #[test]
    fn bundle_lists_updates_in_output_order_then_position() {
        let search = MaximumActivationSearch::new(
            vec![
                MonitoredOutput::spatial("conv", 2, 2, 2),
                MonitoredOutput::dense("fc", 3),
            ],
            &(),
            SearchConfig::default().with_top_n(2),
        )
        .unwrap();
        let conv = Tensor::<f32>::zeros(&[4, 2, 2, 2]);
        let fc = Tensor::<f32>::zeros(&[4, 3]);
        let bundle = search
            .prepare(&ActivationBatch::new().with("fc", &fc).with("conv", &conv))
            .unwrap();

        let targets: Vec<BufferId> = bundle.updates().iter().map(|u| u.target()).collect();
        assert_eq!(
            targets,
            vec![
                BufferId::Record {
                    record: 0,
                    role: BufferRole::Quantity
                },
                BufferId::Record {
                    record: 0,
                    role: BufferRole::Index
                },
                BufferId::Record {
                    record: 0,
                    role: BufferRole::Snapshot
                },
                BufferId::Record {
                    record: 1,
                    role: BufferRole::Quantity
                },
                BufferId::Record {
                    record: 1,
                    role: BufferRole::Index
                },
                BufferId::StreamPosition,
            ]
        );
        assert_eq!(bundle.batch_size(), 4);
        assert_eq!(
            bundle.updates().last(),
            Some(&PendingUpdate::StreamPosition { value: 4 })
        );
        // Preparing does not touch state.
        assert_eq!(search.stream_position(), 0);
    }

    #[test]
    fn stale_bundle_is_rejected_without_mutation() {
        let mut search = dense_search(1, 2);
        let a = Tensor::from_vec(&[1, 1], vec![7.0]).unwrap();
        let batch = ActivationBatch::new().with("fc", &a);

        let bundle = search.prepare(&batch).unwrap();
        search.commit(bundle.clone()).unwrap();
        let before = search.record("fc").unwrap().quantities().clone();

        assert_eq!(
            search.commit(bundle).unwrap_err(),
            MaxActError::StaleBundle {
                expected: 1,
                found: 0
            }
        );
        assert_eq!(search.stream_position(), 1);
        assert_eq!(search.record("fc").unwrap().quantities(), &before);
    }

    #[test]
    fn bundle_from_another_search_is_rejected() {
        let a = dense_search(1, 1);
        let mut b = dense_search(1, 1);
        let acts = Tensor::from_vec(&[1, 1], vec![42.0]).unwrap();
        let bundle = a.prepare(&ActivationBatch::new().with("fc", &acts)).unwrap();

        assert_eq!(b.commit(bundle.clone()).unwrap_err(), MaxActError::ForeignBundle);
        assert_eq!(b.stream_position(), 0);
        assert_eq!(b.record("fc").unwrap().quantities().as_slice(), &[0.0]);

        let mut copy = a.clone();
        assert_eq!(copy.commit(bundle.clone()).unwrap_err(), MaxActError::ForeignBundle);
        assert_eq!(copy.stream_position(), 0);

        let mut a = a;
        a.commit(bundle).unwrap();
        assert_eq!(a.record("fc").unwrap().quantities().as_slice(), &[42.0]);
    }

    #[test]
    fn shape_mismatch_fails_before_mutation() {
        let mut search = MaximumActivationSearch::new(
            vec![MonitoredOutput::dense("a", 2), MonitoredOutput::spatial("b", 2, 2, 2)],
            &(),
            SearchConfig::default().with_top_n(2),
        )
        .unwrap();
        let a = Tensor::from_vec(&[1, 2], vec![3.0, 4.0]).unwrap();
        let b = Tensor::<f32>::zeros(&[1, 2]);
        let err = search
            .step(&ActivationBatch::new().with("a", &a).with("b", &b))
            .unwrap_err();
        assert_eq!(
            err,
            MaxActError::RankMismatch {
                output: "b".into(),
                expected: 4,
                found: 2
            }
        );
        assert_eq!(search.stream_position(), 0);
        assert!(search
            .record("a")
            .unwrap()
            .quantities()
            .as_slice()
            .iter()
            .all(|&q| q == 0.0));
    }

    #[test]
    fn batch_sizes_must_agree() {
        let search = MaximumActivationSearch::new(
            vec![MonitoredOutput::dense("a", 1), MonitoredOutput::dense("b", 1)],
            &(),
            SearchConfig::default().with_top_n(1),
        )
        .unwrap();
        let a = Tensor::<f32>::zeros(&[2, 1]);
        let b = Tensor::<f32>::zeros(&[3, 1]);
        assert_eq!(
            search
                .prepare(&ActivationBatch::new().with("a", &a).with("b", &b))
                .unwrap_err(),
            MaxActError::BatchSizeMismatch {
                output: "b".into(),
                expected: 2,
                found: 3
            }
        );
    }

    #[test]
    fn missing_activations_are_reported() {
        let search = dense_search(1, 1);
        assert_eq!(
            search.prepare(&ActivationBatch::new()).unwrap_err(),
            MaxActError::MissingActivations("fc".into())
        );
    }

    #[test]
    fn commit_validates_every_update_first() {
        let mut search = dense_search(2, 2);
        let a = Tensor::<f32>::zeros(&[1, 2]);
        let mut bundle = search.prepare(&ActivationBatch::new().with("fc", &a)).unwrap();
        bundle.updates.insert(
            0,
            PendingUpdate::Snapshot {
                record: 0,
                value: Tensor::zeros(&[2, 2]),
            },
        );
        assert!(matches!(
            search.commit(bundle).unwrap_err(),
            MaxActError::UnknownBuffer(_)
        ));
        assert_eq!(search.stream_position(), 0);
    }
}
