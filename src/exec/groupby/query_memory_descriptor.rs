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
//! The query memory descriptor: the immutable per-kernel plan of the
//! aggregation result buffer.
//!
//! Responsibilities:
//! - Derives, from the execution unit and table statistics, the
//!   description type, entry count, key widths, keyless-hash probe,
//!   warp interleaving, columnar flag and streaming-top-N flag.
//! - Answers every geometric query about the buffer: row size, total
//!   size, per-slot offsets and entry strides.
//!
//! The descriptor is the contract shared by code generation, the
//! initializer and the result-set reader; geometry functions are pure
//! and two descriptors that compare equal answer them identically.

use crate::runtime::device::DeviceKind;

use super::QueryMemoryConfig;
use super::descriptors::{
    ApproxQuantileDescriptor, CountDistinctDescriptors, count_mode_targets,
    derive_approx_quantile_descriptors, derive_count_distinct_descriptors,
};
use super::error::{GroupByError, GroupByResult};
use super::exec_unit::{RelAlgExecutionUnit, SortAlgorithm, TableStats};
use super::slot_context::SlotContext;
use super::target_info::{
    AggKind, TargetInfo, byte_width, is_dict_encoded_text, is_number_or_time,
};

pub const WARP_SIZE: usize = 32;

/// Reserved "no key yet" bit patterns, one per key width. The type
/// maximum never collides with an encoded group value because range
/// analysis rejects columns that reach it.
pub const EMPTY_KEY_8: i8 = i8::MAX;
pub const EMPTY_KEY_16: i16 = i16::MAX;
pub const EMPTY_KEY_32: i32 = i32::MAX;
pub const EMPTY_KEY_64: i64 = i64::MAX;

pub fn empty_key_for_width(width: usize) -> i64 {
    match width {
        1 => EMPTY_KEY_8 as i64,
        2 => EMPTY_KEY_16 as i64,
        4 => EMPTY_KEY_32 as i64,
        _ => EMPTY_KEY_64,
    }
}

/// Perfect hashing stays attractive up to this many bins; past it the
/// mostly-empty buffer costs more than baseline hashing saves.
const MAX_PERFECT_HASH_BINS: u64 = 1 << 22;

/// Past this entry count a declared sort order prefers the keyed layout,
/// which the sorter can reorder in place.
const LARGE_FOR_SORT_ENTRY_COUNT: usize = 1_000_000;

/// Interleaving replicates every bin per warp lane; only tiny buffers
/// can afford it.
const MAX_INTERLEAVED_ENTRY_COUNT: usize = 512;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum QueryDescriptionType {
    Projection,
    NonGroupedAggregate,
    GroupByPerfectHash,
    GroupByBaselineHash,
    TableFunction,
    Estimator,
}

/// Caller-side knobs for one derivation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DescriptorOptions {
    /// Lower bound on the compact aggregate width.
    pub min_byte_width: usize,
    /// Cardinality estimate: baseline-hash capacity, multi-column
    /// perfect-hash capacity, projection fallback row count.
    pub max_groups: usize,
    pub shard_count: usize,
    pub device: DeviceKind,
    pub sort_on_gpu: bool,
    pub output_columnar_hint: bool,
}

impl Default for DescriptorOptions {
    fn default() -> Self {
        Self {
            min_byte_width: 4,
            max_groups: 2048,
            shard_count: 1,
            device: DeviceKind::Cpu,
            sort_on_gpu: false,
            output_columnar_hint: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueryMemoryDescriptor {
    description_type: QueryDescriptionType,
    entry_count: usize,
    group_col_widths: Vec<usize>,
    group_col_compact_width: usize,
    /// Per target: group-by column index when the target re-projects a
    /// key, -1 otherwise.
    target_groupby_indices: Vec<i64>,
    /// When set, keys are recomputable from the bin index and not
    /// stored; the named target slot is the emptiness probe.
    probe_target: Option<usize>,
    interleaved_bins_on_gpu: bool,
    output_columnar: bool,
    // Perfect-hash coordinate: bin = (value - min_val) / max(bucket, 1).
    min_val: i64,
    max_val: i64,
    bucket: i64,
    has_nulls: bool,
    use_streaming_top_n: bool,
    topn_limit: u64,
    topn_offset: u64,
    slot_context: SlotContext,
    count_distinct_descriptors: CountDistinctDescriptors,
    approx_quantile_descriptors: Vec<Option<ApproxQuantileDescriptor>>,
    num_mode_targets: usize,
    must_use_baseline_sort: bool,
    sort_on_gpu: bool,
    threads_can_reuse_group_by_buffers: bool,
    device: DeviceKind,
}

impl QueryMemoryDescriptor {
    /// Derive the full plan. Decision order: compact width,
    /// classification, streaming top-N, entry count, keyless probe,
    /// interleaving, columnar layout, slot resolution.
    pub fn derive(
        ra_exe_unit: &RelAlgExecutionUnit,
        stats: &TableStats,
        config: &QueryMemoryConfig,
        options: &DescriptorOptions,
    ) -> GroupByResult<Self> {
        let compact_width = compact_target_width(ra_exe_unit, stats, config, options);
        let description_type = classify(ra_exe_unit, options);

        let use_streaming_top_n =
            streaming_top_n_eligible(ra_exe_unit, config, options, description_type);
        let (topn_limit, topn_offset) = if use_streaming_top_n {
            (ra_exe_unit.sort_info.limit, ra_exe_unit.sort_info.offset)
        } else {
            (0, 0)
        };

        let entry_count = derive_entry_count(
            ra_exe_unit,
            options,
            description_type,
            use_streaming_top_n,
        )?;

        let single_range = (ra_exe_unit.group_cols.len() == 1)
            .then(|| ra_exe_unit.group_cols[0].range)
            .flatten();
        let (min_val, max_val, bucket, has_nulls) = match single_range {
            Some(r) => (r.min, r.max, r.bucket, r.has_nulls),
            None => (0, 0, 0, false),
        };

        let probe_target = derive_probe_target(
            ra_exe_unit,
            options,
            description_type,
            entry_count,
            bucket,
            use_streaming_top_n,
        );
        let keyless = probe_target.is_some();

        let count_distinct_descriptors =
            derive_count_distinct_descriptors(ra_exe_unit, options.device);
        let approx_quantile_descriptors = derive_approx_quantile_descriptors(ra_exe_unit);
        let num_mode_targets = count_mode_targets(ra_exe_unit);
        let has_per_entry_handles = count_distinct_descriptors
            .iter()
            .any(|d| d.impl_type != super::descriptors::CountDistinctImpl::Invalid)
            || approx_quantile_descriptors.iter().any(Option::is_some)
            || num_mode_targets > 0;

        let output_columnar = derive_output_columnar(
            config,
            options,
            description_type,
            keyless,
            use_streaming_top_n,
            has_per_entry_handles,
        )?;

        let interleaved_bins_on_gpu = keyless
            && config.enable_smem_group_by
            && options.device == DeviceKind::Gpu
            && !output_columnar
            && entry_count <= MAX_INTERLEAVED_ENTRY_COUNT
            && !has_per_entry_handles
            && !ra_exe_unit.targets.iter().any(TargetInfo::is_varlen_sample);

        let group_col_widths: Vec<usize> = ra_exe_unit
            .group_cols
            .iter()
            .map(|g| byte_width(&g.data_type).max(4))
            .collect();
        let group_col_compact_width =
            if group_col_widths.iter().any(|w| *w > 4) { 8 } else { 4 };

        let target_groupby_indices: Vec<i64> = ra_exe_unit
            .targets
            .iter()
            .map(|t| t.group_col_ref.map(|i| i as i64).unwrap_or(-1))
            .collect();

        let mut slot_context = SlotContext::from_targets(
            &ra_exe_unit.targets,
            compact_width,
            config.enable_lazy_fetch,
        );
        if description_type == QueryDescriptionType::GroupByBaselineHash {
            // Key re-projections read back from the key block, not from
            // a target slot.
            for (col, target) in ra_exe_unit.targets.iter().enumerate() {
                if target.group_col_ref.is_some() {
                    slot_context.set_col_absent(col)?;
                }
            }
        }
        let logical_sized = output_columnar
            && matches!(
                description_type,
                QueryDescriptionType::Projection | QueryDescriptionType::TableFunction
            );
        slot_context.resolve_padding(logical_sized);
        if !output_columnar && description_type == QueryDescriptionType::Projection {
            slot_context.align_slots();
        }
        slot_context.validate(&ra_exe_unit.targets)?;

        let qmd = Self {
            description_type,
            entry_count,
            group_col_widths,
            group_col_compact_width,
            target_groupby_indices,
            probe_target,
            interleaved_bins_on_gpu,
            output_columnar,
            min_val,
            max_val,
            bucket,
            has_nulls,
            use_streaming_top_n,
            topn_limit,
            topn_offset,
            slot_context,
            count_distinct_descriptors,
            approx_quantile_descriptors,
            num_mode_targets,
            must_use_baseline_sort: ra_exe_unit.must_use_baseline_sort,
            sort_on_gpu: options.sort_on_gpu,
            threads_can_reuse_group_by_buffers: ra_exe_unit.threads_can_reuse_group_by_buffers,
            device: options.device,
        };
        qmd.check_invariants(ra_exe_unit)?;
        Ok(qmd)
    }

    fn check_invariants(&self, ra_exe_unit: &RelAlgExecutionUnit) -> GroupByResult<()> {
        if self.group_col_widths.len() != ra_exe_unit.group_cols.len() {
            return Err(GroupByError::internal(
                "group column width count does not match group-by list",
            ));
        }
        if self.target_groupby_indices.len() != ra_exe_unit.targets.len() {
            return Err(GroupByError::internal(
                "target group-by index count does not match target list",
            ));
        }
        for idx in &self.target_groupby_indices {
            if *idx >= self.group_col_widths.len() as i64 {
                return Err(GroupByError::internal("target group-by index out of range"));
            }
        }
        if self.sort_on_gpu && (!self.output_columnar || self.probe_target.is_some()) {
            return Err(GroupByError::internal(
                "sort-on-gpu requires columnar keyed output",
            ));
        }
        if self.use_streaming_top_n && self.output_columnar {
            return Err(GroupByError::internal(
                "streaming top-n does not support columnar output",
            ));
        }
        Ok(())
    }

    // Accessors.

    pub fn description_type(&self) -> QueryDescriptionType {
        self.description_type
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub fn group_col_count(&self) -> usize {
        self.group_col_widths.len()
    }

    pub fn group_col_widths(&self) -> &[usize] {
        &self.group_col_widths
    }

    pub fn group_col_compact_width(&self) -> usize {
        self.group_col_compact_width
    }

    pub fn target_groupby_indices(&self) -> &[i64] {
        &self.target_groupby_indices
    }

    pub fn is_keyless(&self) -> bool {
        self.probe_target.is_some()
    }

    /// Target index whose slot doubles as the emptiness probe.
    pub fn probe_target(&self) -> Option<usize> {
        self.probe_target
    }

    pub fn interleaved_bins_on_gpu(&self) -> bool {
        self.interleaved_bins_on_gpu
    }

    pub fn is_output_columnar(&self) -> bool {
        self.output_columnar
    }

    pub fn min_val(&self) -> i64 {
        self.min_val
    }

    pub fn max_val(&self) -> i64 {
        self.max_val
    }

    pub fn bucket(&self) -> i64 {
        self.bucket
    }

    pub fn has_nulls(&self) -> bool {
        self.has_nulls
    }

    pub fn use_streaming_top_n(&self) -> bool {
        self.use_streaming_top_n
    }

    pub fn topn_limit(&self) -> u64 {
        self.topn_limit
    }

    pub fn topn_offset(&self) -> u64 {
        self.topn_offset
    }

    pub fn slot_context(&self) -> &SlotContext {
        &self.slot_context
    }

    pub fn count_distinct_descriptors(&self) -> &CountDistinctDescriptors {
        &self.count_distinct_descriptors
    }

    pub fn approx_quantile_descriptors(&self) -> &[Option<ApproxQuantileDescriptor>] {
        &self.approx_quantile_descriptors
    }

    pub fn num_mode_targets(&self) -> usize {
        self.num_mode_targets
    }

    pub fn device(&self) -> DeviceKind {
        self.device
    }

    pub fn sort_on_gpu(&self) -> bool {
        self.sort_on_gpu
    }

    pub fn threads_can_reuse_group_by_buffers(&self) -> bool {
        self.threads_can_reuse_group_by_buffers
    }

    pub fn is_group_by(&self) -> bool {
        matches!(
            self.description_type,
            QueryDescriptionType::GroupByPerfectHash | QueryDescriptionType::GroupByBaselineHash
        )
    }

    /// Per-entry seeding needs unique handles when any target carries a
    /// count-distinct, quantile or mode state.
    pub fn has_per_entry_handles(&self) -> bool {
        self.count_distinct_descriptors
            .iter()
            .any(|d| d.impl_type != super::descriptors::CountDistinctImpl::Invalid)
            || self.approx_quantile_descriptors.iter().any(Option::is_some)
            || self.num_mode_targets > 0
    }

    // Setters. The descriptor is otherwise frozen.

    /// Switch the layout to column-major. Streaming top-N buffers are
    /// heap-shaped and stay row-major.
    pub fn set_output_columnar(&mut self, columnar: bool) -> GroupByResult<()> {
        if columnar && self.use_streaming_top_n {
            return Err(GroupByError::internal(
                "streaming top-n does not support columnar output",
            ));
        }
        self.output_columnar = columnar;
        let logical_sized = columnar
            && matches!(
                self.description_type,
                QueryDescriptionType::Projection | QueryDescriptionType::TableFunction
            );
        self.slot_context.resolve_padding(logical_sized);
        if !columnar && self.description_type == QueryDescriptionType::Projection {
            self.slot_context.align_slots();
        }
        Ok(())
    }

    pub fn set_padded_slot_width(&mut self, slot_idx: usize, width: usize) -> GroupByResult<()> {
        self.slot_context.set_padded_size(slot_idx, width)
    }

    // Geometry. All pure; equal descriptors answer identically.

    /// Warp replication factor of the row-major layout.
    pub fn warp_factor(&self) -> usize {
        if self.interleaved_bins_on_gpu {
            WARP_SIZE
        } else {
            1
        }
    }

    /// Bytes of inline key storage per row. Zero when keyless; baseline
    /// and keyed perfect hash store one compact-width word per key.
    pub fn key_bytes_per_row(&self) -> usize {
        if self.probe_target.is_some() {
            return 0;
        }
        if !self.is_group_by() {
            return 0;
        }
        self.group_col_widths.len() * self.effective_key_width()
    }

    /// Uniform stored key width. Narrow keys widen to the compact width
    /// so the empty-key sentinel fits every column.
    pub fn effective_key_width(&self) -> usize {
        self.group_col_compact_width.max(4).min(8)
    }

    /// Full row width, padded to a multiple of eight.
    pub fn row_size(&self) -> usize {
        align8(self.key_bytes_per_row() + self.slot_context.total_padded_bytes())
    }

    /// Byte offset of a slot within one entry (row-major) or of the
    /// slot's column block (column-major), at the planned entry count.
    pub fn col_offset(&self, slot_idx: usize) -> usize {
        self.col_offset_for(slot_idx, self.entry_count)
    }

    /// Column-major block offsets shrink with the entry count; after
    /// projection compaction readers pass the live row count instead of
    /// the planned one. Row-major offsets are entry-count independent.
    pub fn col_offset_for(&self, slot_idx: usize, entry_count: usize) -> usize {
        if !self.output_columnar {
            return self.key_bytes_per_row() + self.slot_context.offset_in_row(slot_idx);
        }
        let mut off = self.columnar_key_block_bytes_for(entry_count);
        for idx in 0..slot_idx {
            off += self.columnar_slot_block_bytes_for(idx, entry_count);
        }
        off
    }

    /// Per-entry stride of a slot: the distance from entry b to b+1.
    pub fn next_col_off(&self, slot_idx: usize) -> usize {
        if self.output_columnar {
            self.slot_context.padded_size(slot_idx)
        } else {
            self.row_size() * self.warp_factor()
        }
    }

    /// Key columns (and the projection index column) fully precede the
    /// target columns in the column-major layout.
    pub fn columnar_key_block_bytes(&self) -> usize {
        self.columnar_key_block_bytes_for(self.entry_count)
    }

    pub fn columnar_key_block_bytes_for(&self, entry_count: usize) -> usize {
        match self.description_type {
            // Implicit 8-byte row-index column.
            QueryDescriptionType::Projection => 8 * entry_count,
            QueryDescriptionType::GroupByPerfectHash
            | QueryDescriptionType::GroupByBaselineHash => {
                if self.probe_target.is_some() {
                    0
                } else {
                    // Keys are stored widened to eight bytes so the
                    // 64-bit sentinel fits.
                    self.group_col_widths.len() * align8(8 * entry_count)
                }
            }
            _ => 0,
        }
    }

    /// Bytes one slot's column occupies in the column-major layout.
    pub fn columnar_slot_block_bytes(&self, slot_idx: usize) -> usize {
        self.columnar_slot_block_bytes_for(slot_idx, self.entry_count)
    }

    pub fn columnar_slot_block_bytes_for(&self, slot_idx: usize, entry_count: usize) -> usize {
        let Some(slot) = self.slot_context.slot(slot_idx) else {
            return 0;
        };
        if let Some(flat) = slot.flatbuffer_size() {
            return align8(flat);
        }
        align8(slot.padded_size() * entry_count)
    }

    /// Main buffer size for a given entry count. Streaming top-N sizing
    /// goes through the heap layout instead.
    pub fn buffer_size_bytes(&self, entry_count: usize) -> u64 {
        if entry_count == 0 {
            return 0;
        }
        if !self.output_columnar {
            return (self.row_size() as u64)
                .saturating_mul(entry_count as u64)
                .saturating_mul(self.warp_factor() as u64);
        }
        let mut total = match self.description_type {
            QueryDescriptionType::Projection => 8 * entry_count as u64,
            QueryDescriptionType::GroupByPerfectHash
            | QueryDescriptionType::GroupByBaselineHash
                if self.probe_target.is_none() =>
            {
                (self.group_col_widths.len() as u64) * align8(8 * entry_count) as u64
            }
            _ => 0,
        };
        for idx in 0..self.slot_context.slot_count() {
            let slot = self.slot_context.slot(idx).expect("slot index in range");
            total += if let Some(flat) = slot.flatbuffer_size() {
                align8(flat) as u64
            } else {
                align8(slot.padded_size() * entry_count) as u64
            };
        }
        total
    }

    pub fn default_buffer_size_bytes(&self) -> u64 {
        self.buffer_size_bytes(self.entry_count)
    }

    /// Whether the template fill may be broadcast in parallel: no
    /// per-entry unique handles in any slot.
    pub fn can_parallelize_seeding(&self, config: &QueryMemoryConfig) -> bool {
        config.optimize_row_initialization && !self.has_per_entry_handles()
    }
}

pub fn align8(bytes: usize) -> usize {
    (bytes + 7) & !7
}

// Derivation rules, in application order.

fn compact_target_width(
    ra_exe_unit: &RelAlgExecutionUnit,
    stats: &TableStats,
    config: &QueryMemoryConfig,
    options: &DescriptorOptions,
) -> usize {
    if config.bigint_count {
        return 8;
    }
    let mut width = options.min_byte_width.clamp(1, 8).max(4);
    let unnested_wide_array = ra_exe_unit.group_cols.iter().any(|g| {
        g.is_unnested_array && !is_dict_encoded_text(&g.data_type)
    });
    let wide_agg_arg = ra_exe_unit.targets.iter().any(|t| {
        t.is_agg()
            && !matches!(t.agg, Some(AggKind::Count | AggKind::CountIf))
            && t.arg_type
                .as_ref()
                .is_some_and(|arg| !is_dict_encoded_text(arg))
    });
    let wide_target = ra_exe_unit
        .targets
        .iter()
        .any(|t| byte_width(&t.data_type) > 4);
    if unnested_wide_array || wide_agg_arg || wide_target {
        width = 8;
    }
    if stats.total_tuples() > u32::MAX as u64 {
        width = 8;
    }
    width
}

fn classify(
    ra_exe_unit: &RelAlgExecutionUnit,
    _options: &DescriptorOptions,
) -> QueryDescriptionType {
    if ra_exe_unit.is_estimator {
        return QueryDescriptionType::Estimator;
    }
    if ra_exe_unit.is_table_function {
        return QueryDescriptionType::TableFunction;
    }
    if ra_exe_unit.group_cols.is_empty() {
        return if ra_exe_unit.targets.iter().any(TargetInfo::is_agg) {
            QueryDescriptionType::NonGroupedAggregate
        } else {
            QueryDescriptionType::Projection
        };
    }
    let perfect = ra_exe_unit.group_cols.iter().try_fold(1u64, |acc, g| {
        let card = g.range.and_then(|r| r.bucketed_cardinality())?;
        acc.checked_mul(card)
    });
    match perfect {
        Some(bins) if bins > 0 && bins <= MAX_PERFECT_HASH_BINS => {
            QueryDescriptionType::GroupByPerfectHash
        }
        _ => QueryDescriptionType::GroupByBaselineHash,
    }
}

fn streaming_top_n_eligible(
    ra_exe_unit: &RelAlgExecutionUnit,
    config: &QueryMemoryConfig,
    options: &DescriptorOptions,
    description_type: QueryDescriptionType,
) -> bool {
    if ra_exe_unit.is_distributed
        || options.output_columnar_hint
        || options.sort_on_gpu
        || ra_exe_unit.sort_info.algorithm != SortAlgorithm::StreamingTopN
        || ra_exe_unit.sort_info.limit == 0
    {
        return false;
    }
    if !matches!(
        description_type,
        QueryDescriptionType::Projection
            | QueryDescriptionType::GroupByPerfectHash
            | QueryDescriptionType::GroupByBaselineHash
    ) {
        return false;
    }
    let [entry] = ra_exe_unit.sort_info.order_entries.as_slice() else {
        return false;
    };
    let sortable = ra_exe_unit
        .targets
        .get(entry.target_idx)
        .is_some_and(|t| is_number_or_time(&t.data_type));
    sortable
        && ra_exe_unit.sort_info.offset + ra_exe_unit.sort_info.limit
            <= config.streaming_topn_max
}

fn derive_entry_count(
    ra_exe_unit: &RelAlgExecutionUnit,
    options: &DescriptorOptions,
    description_type: QueryDescriptionType,
    use_streaming_top_n: bool,
) -> GroupByResult<usize> {
    if use_streaming_top_n {
        let n = ra_exe_unit.sort_info.offset + ra_exe_unit.sort_info.limit;
        return usize::try_from(n)
            .map_err(|_| GroupByError::internal("streaming top-n row count overflow"));
    }
    let count = match description_type {
        QueryDescriptionType::Projection => {
            if ra_exe_unit.use_bump_allocator {
                // Sized per fragment once row counts are known.
                0
            } else {
                ra_exe_unit
                    .scan_limit
                    .map(|l| l as usize)
                    .unwrap_or(options.max_groups)
            }
        }
        QueryDescriptionType::NonGroupedAggregate => 1,
        // One row of estimator slots; the sketch itself lives behind a
        // handle, not in the result buffer.
        QueryDescriptionType::Estimator => 1,
        QueryDescriptionType::TableFunction => options.max_groups,
        QueryDescriptionType::GroupByPerfectHash => {
            if ra_exe_unit.group_cols.len() == 1 {
                let range = ra_exe_unit.group_cols[0]
                    .range
                    .ok_or_else(|| GroupByError::internal("perfect hash without a range"))?;
                let bins = range
                    .bucketed_cardinality()
                    .ok_or_else(|| GroupByError::internal("perfect hash with unusable range"))?;
                usize::try_from(bins)
                    .map_err(|_| GroupByError::internal("perfect hash bin count overflow"))?
            } else {
                options.max_groups
            }
        }
        QueryDescriptionType::GroupByBaselineHash => {
            options.max_groups / options.shard_count.max(1)
        }
    };
    Ok(count)
}

/// Keyless analysis: the probe must be a slot whose seeded identity can
/// never be produced by the kernel for an occupied entry. A plain COUNT
/// with a non-nullable argument (or COUNT(*)) qualifies; it is at least
/// one in every occupied entry.
pub fn keyless_probe_index(targets: &[TargetInfo]) -> Option<usize> {
    targets.iter().position(|t| {
        matches!(t.agg, Some(AggKind::Count))
            && !t.is_distinct
            && (t.arg_type.is_none() || !t.arg_nullable)
    })
}

fn derive_probe_target(
    ra_exe_unit: &RelAlgExecutionUnit,
    options: &DescriptorOptions,
    description_type: QueryDescriptionType,
    entry_count: usize,
    bucket: i64,
    use_streaming_top_n: bool,
) -> Option<usize> {
    if description_type != QueryDescriptionType::GroupByPerfectHash
        || ra_exe_unit.group_cols.len() != 1
        || options.sort_on_gpu
        || bucket != 0
        || ra_exe_unit.must_use_baseline_sort
        || use_streaming_top_n
    {
        return None;
    }
    let large_for_sort = entry_count > LARGE_FOR_SORT_ENTRY_COUNT
        && !ra_exe_unit.sort_info.order_entries.is_empty();
    if large_for_sort {
        return None;
    }
    keyless_probe_index(&ra_exe_unit.targets)
}

fn derive_output_columnar(
    config: &QueryMemoryConfig,
    options: &DescriptorOptions,
    description_type: QueryDescriptionType,
    keyless: bool,
    use_streaming_top_n: bool,
    has_per_entry_handles: bool,
) -> GroupByResult<bool> {
    if use_streaming_top_n {
        return Ok(false);
    }
    if description_type == QueryDescriptionType::TableFunction {
        return Ok(true);
    }
    if options.sort_on_gpu {
        if keyless {
            return Err(GroupByError::internal(
                "sort-on-gpu cannot use the keyless layout",
            ));
        }
        return Ok(true);
    }
    let requested = options.output_columnar_hint || config.enable_columnar_output;
    if !requested {
        return Ok(false);
    }
    Ok(match description_type {
        QueryDescriptionType::Projection => true,
        QueryDescriptionType::GroupByPerfectHash | QueryDescriptionType::GroupByBaselineHash => {
            !has_per_entry_handles
        }
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::groupby::exec_unit::{ColRange, GroupColumn, OrderEntry, SortInfo};
    use arrow::datatypes::DataType;

    fn derive(ra: &RelAlgExecutionUnit, options: &DescriptorOptions) -> QueryMemoryDescriptor {
        QueryMemoryDescriptor::derive(
            ra,
            &TableStats::with_total(1000),
            &QueryMemoryConfig::default(),
            options,
        )
        .expect("derive")
    }

    #[test]
    fn non_grouped_sum_has_one_eight_byte_row() {
        let ra = RelAlgExecutionUnit::new(vec![], vec![TargetInfo::sum(DataType::Int32)]);
        let qmd = derive(&ra, &DescriptorOptions::default());
        assert_eq!(
            qmd.description_type(),
            QueryDescriptionType::NonGroupedAggregate
        );
        assert_eq!(qmd.entry_count(), 1);
        assert!(!qmd.is_keyless());
        assert_eq!(qmd.row_size(), 8);
        assert_eq!(qmd.default_buffer_size_bytes(), 8);
    }

    #[test]
    fn perfect_hash_count_star_goes_keyless() {
        let ra = RelAlgExecutionUnit::new(
            vec![GroupColumn::with_range(
                DataType::Int32,
                ColRange {
                    min: 10,
                    max: 19,
                    bucket: 0,
                    has_nulls: false,
                },
            )],
            vec![TargetInfo::count()],
        );
        let qmd = derive(&ra, &DescriptorOptions::default());
        assert_eq!(
            qmd.description_type(),
            QueryDescriptionType::GroupByPerfectHash
        );
        assert_eq!(qmd.entry_count(), 10);
        assert_eq!(qmd.probe_target(), Some(0));
        // No inline keys: one eight-byte count slot per bin.
        assert_eq!(qmd.key_bytes_per_row(), 0);
        assert_eq!(qmd.row_size(), 8);
        assert_eq!(qmd.default_buffer_size_bytes(), 80);
    }

    #[test]
    fn nullable_count_argument_disables_keyless() {
        let ra = RelAlgExecutionUnit::new(
            vec![GroupColumn::with_range(
                DataType::Int32,
                ColRange {
                    min: 0,
                    max: 9,
                    bucket: 0,
                    has_nulls: false,
                },
            )],
            vec![TargetInfo::count_col(DataType::Int32, true)],
        );
        let qmd = derive(&ra, &DescriptorOptions::default());
        assert!(!qmd.is_keyless());
        assert_eq!(qmd.key_bytes_per_row(), 4);
    }

    #[test]
    fn baseline_two_key_average_row_is_32_bytes() {
        let ra = RelAlgExecutionUnit::new(
            vec![
                GroupColumn::new(DataType::Int64),
                GroupColumn::new(DataType::Int64),
            ],
            vec![TargetInfo::avg(DataType::Float64)],
        );
        let options = DescriptorOptions {
            max_groups: 1024,
            ..DescriptorOptions::default()
        };
        let qmd = derive(&ra, &options);
        assert_eq!(
            qmd.description_type(),
            QueryDescriptionType::GroupByBaselineHash
        );
        assert_eq!(qmd.entry_count(), 1024);
        assert_eq!(qmd.group_col_compact_width(), 8);
        assert_eq!(qmd.key_bytes_per_row(), 16);
        assert_eq!(qmd.slot_context().total_padded_bytes(), 16);
        assert_eq!(qmd.row_size(), 32);
        assert!(!qmd.is_keyless());
    }

    #[test]
    fn columnar_projection_uses_logical_widths_and_index_column() {
        let ra = {
            let mut ra = RelAlgExecutionUnit::new(
                vec![],
                vec![
                    TargetInfo::column(DataType::Int32),
                    TargetInfo::column(DataType::Int32),
                ],
            );
            ra.scan_limit = Some(100);
            ra
        };
        let options = DescriptorOptions {
            output_columnar_hint: true,
            ..DescriptorOptions::default()
        };
        let qmd = derive(&ra, &options);
        assert!(qmd.is_output_columnar());
        assert_eq!(qmd.entry_count(), 100);
        assert_eq!(qmd.slot_context().padded_size(0), 4);
        let x_off = qmd.col_offset(0);
        assert_eq!(x_off, 8 * 100);
        assert_eq!(qmd.col_offset(1), align8(x_off + 100 * 4));
        assert_eq!(
            qmd.default_buffer_size_bytes(),
            (8 * 100 + align8(4 * 100) + align8(4 * 100)) as u64
        );
    }

    #[test]
    fn streaming_top_n_entry_count_is_offset_plus_limit() {
        let mut ra = RelAlgExecutionUnit::new(
            vec![GroupColumn::with_range(
                DataType::Int32,
                ColRange {
                    min: 0,
                    max: 999,
                    bucket: 0,
                    has_nulls: false,
                },
            )],
            vec![TargetInfo::sum(DataType::Int32)],
        );
        ra.sort_info = SortInfo {
            order_entries: vec![OrderEntry {
                target_idx: 0,
                descending: true,
                nulls_first: false,
            }],
            algorithm: SortAlgorithm::StreamingTopN,
            limit: 20,
            offset: 5,
        };
        let qmd = derive(&ra, &DescriptorOptions::default());
        assert!(qmd.use_streaming_top_n());
        assert_eq!(qmd.entry_count(), 25);
        assert!(!qmd.is_output_columnar());
        assert!(!qmd.is_keyless());
        let mut qmd = qmd;
        assert!(qmd.set_output_columnar(true).is_err());
    }

    #[test]
    fn over_limit_top_n_falls_back_to_default_sort() {
        let mut ra = RelAlgExecutionUnit::new(
            vec![],
            vec![TargetInfo::column(DataType::Int64)],
        );
        ra.scan_limit = Some(500);
        ra.sort_info = SortInfo {
            order_entries: vec![OrderEntry {
                target_idx: 0,
                descending: false,
                nulls_first: false,
            }],
            algorithm: SortAlgorithm::StreamingTopN,
            limit: 200_000,
            offset: 0,
        };
        let qmd = derive(&ra, &DescriptorOptions::default());
        assert!(!qmd.use_streaming_top_n());
        assert_eq!(qmd.entry_count(), 500);
    }

    #[test]
    fn estimator_plans_a_single_row() {
        let mut ra = RelAlgExecutionUnit::new(vec![], vec![TargetInfo::count()]);
        ra.is_estimator = true;
        let qmd = derive(&ra, &DescriptorOptions::default());
        assert_eq!(qmd.description_type(), QueryDescriptionType::Estimator);
        assert_eq!(qmd.entry_count(), 1);
        assert!(!qmd.is_keyless());
        assert!(!qmd.is_output_columnar());
        assert_eq!(qmd.default_buffer_size_bytes(), 8);
    }

    #[test]
    fn wide_range_falls_back_to_baseline() {
        let ra = RelAlgExecutionUnit::new(
            vec![GroupColumn::with_range(
                DataType::Int64,
                ColRange {
                    min: 0,
                    max: i64::MAX - 1,
                    bucket: 0,
                    has_nulls: false,
                },
            )],
            vec![TargetInfo::count()],
        );
        let qmd = derive(&ra, &DescriptorOptions::default());
        assert_eq!(
            qmd.description_type(),
            QueryDescriptionType::GroupByBaselineHash
        );
    }

    #[test]
    fn row_size_is_multiple_of_eight() {
        let ra = RelAlgExecutionUnit::new(
            vec![GroupColumn::with_range(
                DataType::Int32,
                ColRange {
                    min: 0,
                    max: 99,
                    bucket: 0,
                    has_nulls: true,
                },
            )],
            vec![
                TargetInfo::count_col(DataType::Int32, true),
                TargetInfo::min(DataType::Int16),
                TargetInfo::max(DataType::Float64),
            ],
        );
        let qmd = derive(&ra, &DescriptorOptions::default());
        assert_eq!(qmd.row_size() % 8, 0);
        assert_eq!(
            qmd.default_buffer_size_bytes(),
            (qmd.row_size() * qmd.entry_count()) as u64
        );
    }

    #[test]
    fn interleaving_requires_small_keyless_gpu_buffer() {
        let ra = RelAlgExecutionUnit::new(
            vec![GroupColumn::with_range(
                DataType::Int32,
                ColRange {
                    min: 0,
                    max: 299,
                    bucket: 0,
                    has_nulls: false,
                },
            )],
            vec![TargetInfo::count()],
        );
        let gpu = DescriptorOptions {
            device: DeviceKind::Gpu,
            ..DescriptorOptions::default()
        };
        let qmd = derive(&ra, &gpu);
        assert!(qmd.interleaved_bins_on_gpu());
        assert_eq!(qmd.warp_factor(), WARP_SIZE);
        assert_eq!(
            qmd.default_buffer_size_bytes(),
            (WARP_SIZE * 300 * qmd.row_size()) as u64
        );
        let cpu = derive(&ra, &DescriptorOptions::default());
        assert!(!cpu.interleaved_bins_on_gpu());
    }

    #[test]
    fn equal_descriptors_share_geometry() {
        let ra = RelAlgExecutionUnit::new(
            vec![GroupColumn::with_range(
                DataType::Int32,
                ColRange {
                    min: 0,
                    max: 49,
                    bucket: 0,
                    has_nulls: false,
                },
            )],
            vec![TargetInfo::sum(DataType::Int64), TargetInfo::count()],
        );
        let a = derive(&ra, &DescriptorOptions::default());
        let b = derive(&ra, &DescriptorOptions::default());
        assert_eq!(a, b);
        for slot in 0..a.slot_context().slot_count() {
            assert_eq!(a.col_offset(slot), b.col_offset(slot));
            assert_eq!(a.next_col_off(slot), b.next_col_off(slot));
        }
        assert_eq!(a.default_buffer_size_bytes(), b.default_buffer_size_bytes());
    }

    #[test]
    fn empty_key_sentinels_are_type_maxima() {
        assert_eq!(empty_key_for_width(1), i8::MAX as i64);
        assert_eq!(empty_key_for_width(2), i16::MAX as i64);
        assert_eq!(empty_key_for_width(4), i32::MAX as i64);
        assert_eq!(empty_key_for_width(8), i64::MAX);
    }
}
