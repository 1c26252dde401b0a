#[cfg(feature = "serde")]
use serde::Serialize;

use crate::record::{OutputDims, StatisticsRecord};
use crate::search::MaximumActivationSearch;

/// A read-only view of the current top-N tables.
///
/// Snapshotting is on-demand and allocates; the step path never builds these.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct SearchSnapshot {
    pub stream_position: u64,
    pub top_n: usize,
    pub tables: Vec<TopActivationTable>,
}

/// Ranked entries for every unit of one output.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct TopActivationTable {
    pub output: String,
    pub dims: OutputDims,
    pub units: Vec<UnitTable>,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct UnitTable {
    pub unit: usize,
    pub entries: Vec<TopEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct TopEntry {
    pub rank: usize,
    pub quantity: f32,
    pub example: u64,
    /// `(row, column)` within the feature map, spatial outputs only.
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub location: Option<(u64, u64)>,
}

pub struct SearchAdapter<'a> {
    search: &'a MaximumActivationSearch,
}

impl<'a> SearchAdapter<'a> {
    pub fn new(search: &'a MaximumActivationSearch) -> Self {
        Self { search }
    }

    pub fn snapshot(&self) -> SearchSnapshot {
        SearchSnapshot {
            stream_position: self.search.stream_position(),
            top_n: self.search.top_n(),
            tables: self.search.records().iter().map(table_of).collect(),
        }
    }

    /// Table for a single output, if it is monitored.
    pub fn table(&self, output: &str) -> Option<TopActivationTable> {
        self.search.record(output).map(table_of)
    }
}

impl SearchSnapshot {
    pub fn table(&self, output: &str) -> Option<&TopActivationTable> {
        self.tables.iter().find(|t| t.output == output)
    }

    #[cfg(feature = "serde")]
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

fn table_of(record: &StatisticsRecord) -> TopActivationTable {
    let units = (0..record.dims().units())
        .map(|unit| UnitTable {
            unit,
            entries: (0..record.top_n())
                .filter_map(|rank| {
                    let coord = record.coordinate(rank, unit)?;
                    Some(TopEntry {
                        rank,
                        quantity: record.quantity(rank, unit)?,
                        example: coord.example,
                        location: coord.location,
                    })
                })
                .collect(),
        })
        .collect();
    TopActivationTable {
        output: record.output().to_string(),
        dims: record.dims(),
        units,
    }
}
