// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Input model for layout derivation: the relational execution unit as
//! seen by this layer, plus input-table statistics.

use arrow::datatypes::DataType;

use super::target_info::TargetInfo;

/// Observed value range of a group-by column, from table statistics.
/// `bucket` > 0 quantizes values into `(v - min) / bucket` bins.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ColRange {
    pub min: i64,
    pub max: i64,
    pub bucket: i64,
    pub has_nulls: bool,
}

impl ColRange {
    /// Number of perfect-hash bins for this range, including the null
    /// bin. None when the range is unusable (inverted or overflowing).
    pub fn bucketed_cardinality(&self) -> Option<u64> {
        if self.max < self.min {
            return None;
        }
        let span = (self.max as i128) - (self.min as i128);
        let step = if self.bucket > 0 { self.bucket as i128 } else { 1 };
        let bins = span / step + 1 + if self.has_nulls { 1 } else { 0 };
        u64::try_from(bins).ok()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GroupColumn {
    pub data_type: DataType,
    pub range: Option<ColRange>,
    pub nullable: bool,
    /// Group-by over UNNEST of an array expression.
    pub is_unnested_array: bool,
}

impl GroupColumn {
    pub fn new(data_type: DataType) -> Self {
        Self {
            data_type,
            range: None,
            nullable: false,
            is_unnested_array: false,
        }
    }

    pub fn with_range(data_type: DataType, range: ColRange) -> Self {
        Self {
            data_type,
            range: Some(range),
            nullable: range.has_nulls,
            is_unnested_array: false,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SortAlgorithm {
    Default,
    SpeculativeTopN,
    StreamingTopN,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OrderEntry {
    /// Index into the target list.
    pub target_idx: usize,
    pub descending: bool,
    pub nulls_first: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SortInfo {
    pub order_entries: Vec<OrderEntry>,
    pub algorithm: SortAlgorithm,
    pub limit: u64,
    pub offset: u64,
}

impl SortInfo {
    pub fn none() -> Self {
        Self {
            order_entries: Vec::new(),
            algorithm: SortAlgorithm::Default,
            limit: 0,
            offset: 0,
        }
    }
}

/// The slice of the relational execution unit this layer consumes.
#[derive(Clone, Debug, PartialEq)]
pub struct RelAlgExecutionUnit {
    pub group_cols: Vec<GroupColumn>,
    pub targets: Vec<TargetInfo>,
    pub sort_info: SortInfo,
    pub scan_limit: Option<u64>,
    pub use_bump_allocator: bool,
    /// Cardinality-estimator query: produces an estimator buffer instead
    /// of aggregate rows.
    pub is_estimator: bool,
    pub is_table_function: bool,
    pub is_distributed: bool,
    pub must_use_baseline_sort: bool,
    pub threads_can_reuse_group_by_buffers: bool,
}

impl RelAlgExecutionUnit {
    pub fn new(group_cols: Vec<GroupColumn>, targets: Vec<TargetInfo>) -> Self {
        Self {
            group_cols,
            targets,
            sort_info: SortInfo::none(),
            scan_limit: None,
            use_bump_allocator: false,
            is_estimator: false,
            is_table_function: false,
            is_distributed: false,
            must_use_baseline_sort: false,
            threads_can_reuse_group_by_buffers: false,
        }
    }
}

/// Per-fragment tuple statistics of the scanned input.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableStats {
    pub fragment_tuple_counts: Vec<u64>,
}

impl TableStats {
    pub fn with_total(total: u64) -> Self {
        Self {
            fragment_tuple_counts: vec![total],
        }
    }

    pub fn total_tuples(&self) -> u64 {
        self.fragment_tuple_counts.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucketed_cardinality_counts_null_bin() {
        let range = ColRange {
            min: 10,
            max: 19,
            bucket: 0,
            has_nulls: false,
        };
        assert_eq!(range.bucketed_cardinality(), Some(10));
        let with_nulls = ColRange {
            has_nulls: true,
            ..range
        };
        assert_eq!(with_nulls.bucketed_cardinality(), Some(11));
    }

    #[test]
    fn bucketed_cardinality_applies_bucket() {
        let range = ColRange {
            min: 0,
            max: 99,
            bucket: 10,
            has_nulls: false,
        };
        assert_eq!(range.bucketed_cardinality(), Some(10));
    }

    #[test]
    fn inverted_range_is_rejected() {
        let range = ColRange {
            min: 5,
            max: 0,
            bucket: 0,
            has_nulls: false,
        };
        assert_eq!(range.bucketed_cardinality(), None);
    }
}
