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
//! Aggregate target model consumed by layout derivation.
//!
//! A target is one output expression of the execution unit: either a
//! plain column projection or an aggregate over an argument expression.
//! Layout decisions only need the aggregate kind, distinctness, the
//! arrow types involved, and a handful of shape predicates.

use arrow::datatypes::DataType;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum AggKind {
    Count,
    CountIf,
    Sum,
    Min,
    Max,
    Avg,
    Mode,
    ApproxQuantile,
    Sample,
    SingleValue,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TargetInfo {
    pub agg: Option<AggKind>,
    /// COUNT(DISTINCT ...) / APPROX_COUNT_DISTINCT.
    pub is_distinct: bool,
    /// Approximate variant of the aggregate (e.g. approx count distinct).
    pub is_approx: bool,
    /// Output type of the target.
    pub data_type: DataType,
    /// Type of the aggregate argument, if any.
    pub arg_type: Option<DataType>,
    /// Whether the aggregate argument may be NULL. Drives the keyless
    /// probe analysis: COUNT over a nullable argument can legitimately
    /// stay at zero in an occupied entry.
    pub arg_nullable: bool,
    /// Quantile parameter for APPROX_QUANTILE.
    pub quantile: Option<f64>,
    /// Index of the group-by expression this target re-projects, if any.
    pub group_col_ref: Option<usize>,
    /// Physical coordinate columns for geometry targets; zero otherwise.
    pub physical_coord_cols: usize,
    /// Column is resolved lazily by the fetch layer; no slot storage.
    pub is_lazy_fetch: bool,
    /// Declared flat-buffer byte size for table-function output columns.
    pub flatbuffer_size: Option<usize>,
}

impl TargetInfo {
    fn plain(agg: Option<AggKind>, data_type: DataType, arg_type: Option<DataType>) -> Self {
        Self {
            agg,
            is_distinct: false,
            is_approx: false,
            data_type,
            arg_type,
            arg_nullable: false,
            quantile: None,
            group_col_ref: None,
            physical_coord_cols: 0,
            is_lazy_fetch: false,
            flatbuffer_size: None,
        }
    }

    pub fn column(data_type: DataType) -> Self {
        Self::plain(None, data_type, None)
    }

    pub fn group_ref(data_type: DataType, group_idx: usize) -> Self {
        let mut t = Self::plain(None, data_type, None);
        t.group_col_ref = Some(group_idx);
        t
    }

    pub fn count() -> Self {
        Self::plain(Some(AggKind::Count), DataType::Int64, None)
    }

    pub fn count_col(arg_type: DataType, nullable: bool) -> Self {
        let mut t = Self::plain(Some(AggKind::Count), DataType::Int64, Some(arg_type));
        t.arg_nullable = nullable;
        t
    }

    pub fn count_if(arg_type: DataType) -> Self {
        Self::plain(Some(AggKind::CountIf), DataType::Int64, Some(arg_type))
    }

    pub fn count_distinct(arg_type: DataType) -> Self {
        let mut t = Self::plain(Some(AggKind::Count), DataType::Int64, Some(arg_type));
        t.is_distinct = true;
        t
    }

    pub fn approx_count_distinct(arg_type: DataType) -> Self {
        let mut t = Self::count_distinct(arg_type);
        t.is_approx = true;
        t
    }

    pub fn sum(arg_type: DataType) -> Self {
        let out = match arg_type {
            DataType::Float32 | DataType::Float64 => DataType::Float64,
            _ => DataType::Int64,
        };
        Self::plain(Some(AggKind::Sum), out, Some(arg_type))
    }

    pub fn min(arg_type: DataType) -> Self {
        Self::plain(Some(AggKind::Min), arg_type.clone(), Some(arg_type))
    }

    pub fn max(arg_type: DataType) -> Self {
        Self::plain(Some(AggKind::Max), arg_type.clone(), Some(arg_type))
    }

    pub fn avg(arg_type: DataType) -> Self {
        Self::plain(Some(AggKind::Avg), DataType::Float64, Some(arg_type))
    }

    pub fn mode(arg_type: DataType) -> Self {
        Self::plain(Some(AggKind::Mode), arg_type.clone(), Some(arg_type))
    }

    pub fn approx_quantile(arg_type: DataType, quantile: f64) -> Self {
        let mut t = Self::plain(
            Some(AggKind::ApproxQuantile),
            DataType::Float64,
            Some(arg_type),
        );
        t.quantile = Some(quantile);
        t
    }

    pub fn sample(arg_type: DataType) -> Self {
        Self::plain(Some(AggKind::Sample), arg_type.clone(), Some(arg_type))
    }

    pub fn is_agg(&self) -> bool {
        self.agg.is_some()
    }

    pub fn is_count_distinct(&self) -> bool {
        self.is_distinct && matches!(self.agg, Some(AggKind::Count))
    }

    pub fn is_mode(&self) -> bool {
        matches!(self.agg, Some(AggKind::Mode))
    }

    pub fn is_quantile(&self) -> bool {
        matches!(self.agg, Some(AggKind::ApproxQuantile))
    }

    /// A SAMPLE over variable-length data keeps pointer+length slots that
    /// cannot be re-striped across warp lanes.
    pub fn is_varlen_sample(&self) -> bool {
        matches!(self.agg, Some(AggKind::Sample))
            && self.arg_type.as_ref().is_some_and(is_varlen_type)
    }
}

/// Byte width of a fixed-width type; 0 for variable-length types.
pub fn byte_width(data_type: &DataType) -> usize {
    match data_type {
        DataType::Boolean | DataType::Int8 | DataType::UInt8 => 1,
        DataType::Int16 | DataType::UInt16 | DataType::Float16 => 2,
        DataType::Int32 | DataType::UInt32 | DataType::Float32 | DataType::Date32 => 4,
        DataType::Int64
        | DataType::UInt64
        | DataType::Float64
        | DataType::Date64
        | DataType::Timestamp(_, _)
        | DataType::Time64(_)
        | DataType::Duration(_)
        | DataType::Decimal128(_, _) => 8,
        DataType::Dictionary(_, _) => 4,
        _ => 0,
    }
}

pub fn is_varlen_type(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Utf8
            | DataType::LargeUtf8
            | DataType::Binary
            | DataType::LargeBinary
            | DataType::List(_)
            | DataType::LargeList(_)
    )
}

pub fn is_dict_encoded_text(data_type: &DataType) -> bool {
    matches!(data_type, DataType::Dictionary(_, value) if matches!(**value, DataType::Utf8))
}

pub fn is_number_or_time(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::Float32
            | DataType::Float64
            | DataType::Decimal128(_, _)
            | DataType::Date32
            | DataType::Date64
            | DataType::Timestamp(_, _)
            | DataType::Time64(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widths_for_fixed_types() {
        assert_eq!(byte_width(&DataType::Int8), 1);
        assert_eq!(byte_width(&DataType::Int32), 4);
        assert_eq!(byte_width(&DataType::Float64), 8);
        assert_eq!(byte_width(&DataType::Utf8), 0);
    }

    #[test]
    fn count_distinct_shape() {
        let t = TargetInfo::count_distinct(DataType::Int32);
        assert!(t.is_count_distinct());
        assert!(t.is_agg());
        assert!(!TargetInfo::count().is_count_distinct());
    }

    #[test]
    fn varlen_sample_detection() {
        assert!(TargetInfo::sample(DataType::Utf8).is_varlen_sample());
        assert!(!TargetInfo::sample(DataType::Int64).is_varlen_sample());
    }
}
