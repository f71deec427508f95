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
//! The query memory initializer: allocates result buffers for one worker
//! or device, reserves count-distinct, quantile and mode auxiliary
//! memory, seeds every entry with its per-slot initial value, and runs
//! the post-kernel compaction and copy-back paths.
//!
//! Responsibilities:
//! - Pre-allocation safety checks (bitmap totals, buffer ceilings).
//! - Fixed allocation order: bitmaps, digest capacity, mode tables, the
//!   main buffer, the optional varlen buffer.
//! - Template-row seeding with a parallel broadcast fast path, and a
//!   per-entry slow path when slots carry unique handles.
//! - Streaming top-N heap setup and offset application.
//! - Projection compaction and GPU copy-back.

use std::sync::Arc;

use crate::runtime::device::{
    DeviceAllocator, DeviceBuffer, DeviceKind, KernelDispatchMode, LaunchParams,
};
use crate::runtime::memory_owner::{ArenaId, BufferId, QueryMemoryOwner, SlotHandle};

use super::QueryMemoryConfig;
use super::descriptors::{CountDistinctImpl, total_bitmap_bytes};
use super::error::{GroupByError, GroupByResult};
use super::query_memory_descriptor::{
    EMPTY_KEY_64, QueryDescriptionType, QueryMemoryDescriptor, align8, empty_key_for_width,
};
use super::result_set::{ResultSet, write_scalar};
use super::streaming_topn::{self, TopNHeapLayout, TopNSortKey};
use super::target_info::{AggKind, TargetInfo};

/// Device-side MODE sub-table: a u64 entry count (u64::MAX on overflow)
/// followed by fixed-capacity (value, count) pairs.
pub const MODE_DEVICE_TABLE_CAPACITY: usize = 64;
pub const MODE_DEVICE_TABLE_BYTES: usize = 8 + MODE_DEVICE_TABLE_CAPACITY * 16;

const PARALLEL_SEED_MIN_ROWS: usize = 4096;

pub struct InitializerOptions<'a> {
    pub launch: LaunchParams,
    pub dispatch: KernelDispatchMode,
    pub thread_idx: usize,
    /// Input row count; sizes the buffer under the bump allocator.
    pub num_input_rows: Option<u64>,
    /// Defer GPU seeding to the kernel launcher.
    pub lazy_gpu_init: bool,
    pub allocator: Option<&'a dyn DeviceAllocator>,
}

impl Default for InitializerOptions<'_> {
    fn default() -> Self {
        Self {
            launch: LaunchParams::default(),
            dispatch: KernelDispatchMode::KernelPerFragment,
            thread_idx: 0,
            num_input_rows: None,
            lazy_gpu_init: false,
            allocator: None,
        }
    }
}

#[derive(Debug)]
pub struct QueryMemoryInitializer {
    qmd: Arc<QueryMemoryDescriptor>,
    config: QueryMemoryConfig,
    owner: Arc<QueryMemoryOwner>,
    targets: Vec<TargetInfo>,
    thread_idx: usize,
    num_buffers: usize,
    /// Entry count actually seeded; differs from the descriptor's under
    /// the bump allocator and streaming top-N heaps.
    effective_entry_count: usize,
    buffers: Vec<BufferId>,
    device_buffers: Vec<DeviceBuffer>,
    varlen_buffers: Vec<BufferId>,
    /// [buffer][target column] bitmap arena, for bitmap distinct counts.
    bitmap_arenas: Vec<Vec<Option<ArenaId>>>,
    /// [buffer][mode ordinal] device-side hash-table arrays.
    mode_device_tables: Vec<Vec<DeviceBuffer>>,
    heap_layout: Option<TopNHeapLayout>,
    init_vals: Arc<Vec<i64>>,
}

impl QueryMemoryInitializer {
    pub fn new(
        qmd: Arc<QueryMemoryDescriptor>,
        targets: &[TargetInfo],
        config: &QueryMemoryConfig,
        owner: &Arc<QueryMemoryOwner>,
        options: InitializerOptions<'_>,
    ) -> GroupByResult<Self> {
        let device = qmd.device();
        let num_buffers = match device {
            DeviceKind::Cpu => 1,
            DeviceKind::Gpu => {
                options.launch.block_size
                    * if options.launch.blocks_share_memory {
                        1
                    } else {
                        options.launch.grid_size
                    }
            }
        };

        let heap_layout = if qmd.use_streaming_top_n() {
            Some(TopNHeapLayout {
                row_size: qmd.row_size(),
                rows_per_heap: qmd.entry_count(),
                thread_count: options.launch.block_size * options.launch.grid_size,
            })
        } else {
            None
        };

        let effective_entry_count = if let Some(layout) = &heap_layout {
            layout.total_rows()
        } else if qmd.entry_count() == 0 {
            // Bump-allocated projection: sized by the input rows.
            match (options.dispatch, options.num_input_rows) {
                (KernelDispatchMode::KernelPerFragment, Some(rows)) => rows as usize,
                _ => 0,
            }
        } else {
            qmd.entry_count()
        };

        // Safety checks come before any allocation. The bitmap budget is
        // computed from the entry count the arenas are actually sized by.
        let bitmap_bytes = total_bitmap_bytes(
            qmd.count_distinct_descriptors(),
            effective_entry_count.max(1),
        )
        .saturating_mul(num_buffers as u64);
        if bitmap_bytes > config.bitmap_memory_limit {
            return Err(GroupByError::OutOfHostMemory {
                bytes: bitmap_bytes,
            });
        }
        if qmd.description_type() == QueryDescriptionType::TableFunction {
            let mut total = 0u64;
            for idx in 0..qmd.slot_context().slot_count() {
                let slot = qmd
                    .slot_context()
                    .slot(idx)
                    .ok_or_else(|| GroupByError::internal("slot index out of range"))?;
                total += slot.flatbuffer_size().unwrap_or_else(|| {
                    slot.logical_size() * qmd.entry_count()
                }) as u64;
            }
            if total > config.max_buffer_size {
                return Err(GroupByError::OutOfHostMemory { bytes: total });
            }
        }

        let main_bytes = if let Some(layout) = &heap_layout {
            layout.heap_size()
        } else if qmd.entry_count() == 0 {
            (qmd.row_size() as u64) * effective_entry_count as u64
        } else {
            qmd.default_buffer_size_bytes()
        };
        if main_bytes > config.max_buffer_size {
            return Err(GroupByError::OutOfHostMemory { bytes: main_bytes });
        }
        if heap_layout.is_some() && main_bytes > config.max_memory_allocation_size {
            return Err(GroupByError::StreamingTopNOversizedHeap { bytes: main_bytes });
        }

        let allocator = match device {
            DeviceKind::Cpu => None,
            DeviceKind::Gpu => Some(options.allocator.ok_or_else(|| {
                GroupByError::internal("gpu execution requires a device allocator")
            })?),
        };
        if let Some(alloc) = allocator {
            if heap_layout.is_some() && main_bytes > alloc.max_allocation_size() as u64 {
                return Err(GroupByError::StreamingTopNOversizedHeap { bytes: main_bytes });
            }
        }

        let init_vals = Arc::new(compute_init_values(&qmd, targets));

        let mut init = Self {
            qmd,
            config: config.clone(),
            owner: Arc::clone(owner),
            targets: targets.to_vec(),
            thread_idx: options.thread_idx,
            num_buffers,
            effective_entry_count,
            buffers: Vec::with_capacity(num_buffers),
            device_buffers: Vec::new(),
            varlen_buffers: Vec::new(),
            bitmap_arenas: Vec::with_capacity(num_buffers),
            mode_device_tables: Vec::new(),
            heap_layout,
            init_vals,
        };

        for buffer_idx in 0..num_buffers {
            init.allocate_one(buffer_idx, main_bytes, allocator, &options)?;
        }
        Ok(init)
    }

    fn allocate_one(
        &mut self,
        buffer_idx: usize,
        main_bytes: u64,
        allocator: Option<&dyn DeviceAllocator>,
        options: &InitializerOptions<'_>,
    ) -> GroupByResult<()> {
        // 1. Count-distinct bitmap arenas, one per bitmap target.
        let mut arenas = vec![None; self.targets.len()];
        for (col, desc) in self.qmd.count_distinct_descriptors().iter().enumerate() {
            if let CountDistinctImpl::Bitmap { padded_bytes } = desc.impl_type {
                let total = padded_bytes
                    .checked_mul(self.effective_entry_count.max(1))
                    .ok_or_else(|| GroupByError::internal("bitmap arena size overflow"))?;
                arenas[col] = Some(self.owner.create_bitmap_arena(total, padded_bytes)?);
            }
        }
        self.bitmap_arenas.push(arenas);

        // 2. Quantile digest capacity is reserved up front.
        let digest_bytes: usize = self
            .qmd
            .approx_quantile_descriptors()
            .iter()
            .flatten()
            .map(|d| d.nbytes() * self.effective_entry_count)
            .sum();
        if digest_bytes > 0 {
            self.owner.reserve_tdigest_capacity(digest_bytes);
        }

        // 3. GPU mode tables; CPU mode handles are allocated per entry
        // during seeding.
        if let Some(alloc) = allocator {
            let mut tables = Vec::new();
            for _ in 0..self.qmd.num_mode_targets() {
                let bytes = self.effective_entry_count * MODE_DEVICE_TABLE_BYTES;
                tables.push(alloc.alloc_zeroed(bytes).map_err(|e| {
                    GroupByError::OutOfHostMemory {
                        bytes: e.requested as u64,
                    }
                })?);
            }
            self.mode_device_tables.push(tables);
        }

        // 4. The main buffer; reused from the per-thread cache when the
        // execution unit allows it.
        let reuse = self.qmd.threads_can_reuse_group_by_buffers()
            && self.qmd.device() == DeviceKind::Cpu
            && self.num_buffers == 1;
        let (id, needs_seed) = if reuse {
            self.owner
                .reuse_or_allocate_buffer(self.thread_idx, main_bytes as usize)
        } else {
            (
                self.owner
                    .allocate_buffer(self.thread_idx, main_bytes as usize),
                true,
            )
        };
        self.buffers.push(id);
        if let Some(alloc) = allocator {
            self.device_buffers
                .push(alloc.alloc_zeroed(main_bytes as usize).map_err(|e| {
                    GroupByError::OutOfHostMemory {
                        bytes: e.requested as u64,
                    }
                })?);
        }

        // 5. Varlen output buffer.
        let varlen_bytes = self.varlen_element_bytes() * self.effective_entry_count;
        if varlen_bytes > 0 {
            self.varlen_buffers
                .push(self.owner.allocate_buffer(self.thread_idx, varlen_bytes));
        }

        let lazy = options.lazy_gpu_init && self.qmd.device() == DeviceKind::Gpu;
        if needs_seed && !lazy && main_bytes > 0 {
            self.seed_buffer(buffer_idx)?;
        }
        if !lazy && self.qmd.device() == DeviceKind::Gpu && main_bytes > 0 {
            self.stage_to_device(buffer_idx)?;
        }
        Ok(())
    }

    fn varlen_element_bytes(&self) -> usize {
        self.targets
            .iter()
            .filter(|t| t.is_varlen_sample())
            .count()
            * 16
    }

    // Seeding.

    /// Template row: empty-key sentinels in the key block, per-slot
    /// identities in the target block.
    fn template_row(&self) -> Vec<u8> {
        let row_size = self.qmd.row_size();
        let mut template = vec![0u8; row_size];
        let key_width = self.qmd.effective_key_width();
        if !self.qmd.is_keyless() && self.qmd.is_group_by() {
            for key in 0..self.qmd.group_col_count() {
                write_scalar(
                    &mut template,
                    key * key_width,
                    key_width,
                    empty_key_for_width(key_width),
                );
            }
        }
        let key_bytes = self.qmd.key_bytes_per_row();
        for slot_idx in 0..self.qmd.slot_context().slot_count() {
            let width = self.qmd.slot_context().padded_size(slot_idx);
            if width == 0 {
                continue;
            }
            write_scalar(
                &mut template,
                key_bytes + self.qmd.slot_context().offset_in_row(slot_idx),
                width,
                self.init_vals[slot_idx],
            );
        }
        template
    }

    /// Unique handles for one entry's count-distinct, quantile and mode
    /// slots. Allocated outside the buffer lock.
    fn allocate_entry_handles(&self, buffer_idx: usize) -> GroupByResult<Vec<(usize, u64)>> {
        let mut writes = Vec::new();
        for (col, target) in self.targets.iter().enumerate() {
            let handle = if target.is_count_distinct() {
                match &self.qmd.count_distinct_descriptors()[col].impl_type {
                    CountDistinctImpl::Bitmap { .. } => {
                        let arena = self.bitmap_arenas[buffer_idx][col]
                            .ok_or_else(|| GroupByError::internal("bitmap arena missing"))?;
                        self.owner.bump_bitmap_handle(arena)?
                    }
                    CountDistinctImpl::UnorderedSet => self.owner.allocate_distinct_set(),
                    CountDistinctImpl::Invalid => {
                        return Err(GroupByError::internal(
                            "distinct target without a descriptor",
                        ));
                    }
                }
            } else if let Some(desc) = self.qmd.approx_quantile_descriptors()[col] {
                self.owner
                    .allocate_tdigest(desc, target.quantile.unwrap_or(0.5))
            } else if target.is_mode() {
                self.owner.allocate_mode()
            } else {
                continue;
            };
            let slot_idx = self.qmd.slot_context().col_slots(col)[0];
            writes.push((slot_idx, handle.raw()));
        }
        Ok(writes)
    }

    fn seed_buffer(&self, buffer_idx: usize) -> GroupByResult<()> {
        let id = self.buffers[buffer_idx];
        if self.heap_layout.is_some() {
            self.seed_streaming(buffer_idx)?;
        } else if self.qmd.is_output_columnar() {
            self.seed_columnar(buffer_idx)?;
        } else {
            self.seed_row_major(buffer_idx, 0, self.row_count_to_seed())?;
        }
        self.owner.mark_buffer_seeded(id);
        Ok(())
    }

    fn row_count_to_seed(&self) -> usize {
        self.effective_entry_count * self.qmd.warp_factor()
    }

    fn seed_row_major(
        &self,
        buffer_idx: usize,
        byte_offset: usize,
        rows: usize,
    ) -> GroupByResult<()> {
        let id = self.buffers[buffer_idx];
        let template = self.template_row();
        let row_size = self.qmd.row_size();
        if row_size == 0 || rows == 0 {
            return Ok(());
        }
        let handle_writes = if self.qmd.has_per_entry_handles() {
            let mut writes = Vec::new();
            for entry in 0..rows {
                for (slot_idx, raw) in self.allocate_entry_handles(buffer_idx)? {
                    let off = byte_offset
                        + entry * row_size
                        + self.qmd.key_bytes_per_row()
                        + self.qmd.slot_context().offset_in_row(slot_idx);
                    writes.push((off, raw));
                }
            }
            writes
        } else {
            Vec::new()
        };
        let parallel = self.qmd.can_parallelize_seeding(&self.config);
        self.owner.with_buffer_mut(id, |buf| {
            let region = buf
                .get_mut(byte_offset..byte_offset + rows * row_size)
                .ok_or_else(|| GroupByError::internal("seed region outside buffer"))?;
            broadcast_template(region, &template, parallel);
            for (off, raw) in &handle_writes {
                let local = off - byte_offset;
                region[local..local + 8].copy_from_slice(&raw.to_ne_bytes());
            }
            Ok(())
        })?
    }

    fn seed_columnar(&self, buffer_idx: usize) -> GroupByResult<()> {
        if self.qmd.has_per_entry_handles() {
            return Err(GroupByError::internal(
                "column-major layout cannot carry per-entry handles",
            ));
        }
        let id = self.buffers[buffer_idx];
        let entries = self.effective_entry_count;
        let qmd = Arc::clone(&self.qmd);
        let init_vals = Arc::clone(&self.init_vals);
        self.owner.with_buffer_mut(id, move |buf| {
            if qmd.is_group_by() && !qmd.is_keyless() {
                for key in 0..qmd.group_col_count() {
                    let start = key * align8(8 * entries);
                    for entry in 0..entries {
                        write_scalar(buf, start + entry * 8, 8, EMPTY_KEY_64);
                    }
                }
            }
            // The projection index column stays zeroed.
            for slot_idx in 0..qmd.slot_context().slot_count() {
                let width = qmd.slot_context().padded_size(slot_idx);
                if width == 0 {
                    continue;
                }
                let start = qmd.col_offset_for(slot_idx, entries);
                for entry in 0..entries {
                    write_scalar(buf, start + entry * width, width, init_vals[slot_idx]);
                }
            }
        })
    }

    fn seed_streaming(&self, buffer_idx: usize) -> GroupByResult<()> {
        let layout = self
            .heap_layout
            .ok_or_else(|| GroupByError::internal("streaming seed without a heap layout"))?;
        let id = self.buffers[buffer_idx];
        self.owner.with_buffer_mut(id, move |buf| {
            streaming_topn::initialize_heap_storage(buf, &layout)
        })??;
        self.seed_row_major(buffer_idx, layout.rows_offset(), layout.total_rows())
    }

    fn stage_to_device(&mut self, buffer_idx: usize) -> GroupByResult<()> {
        let id = self.buffers[buffer_idx];
        let host = self.owner.with_buffer(id, |buf| buf.to_vec())?;
        self.device_buffers[buffer_idx]
            .copy_from_host(0, &host)
            .map_err(GroupByError::Internal)
    }

    // Post-execution paths.

    /// Shift every column left so only the first `actual` rows stay
    /// contiguous. Column-major projection only; the caller updates the
    /// result set's entry count afterwards.
    pub fn compact_projection_buffer(
        &self,
        buffer_idx: usize,
        actual: usize,
    ) -> GroupByResult<()> {
        if self.qmd.description_type() != QueryDescriptionType::Projection
            || !self.qmd.is_output_columnar()
        {
            return Err(GroupByError::internal(
                "compaction applies to column-major projection buffers",
            ));
        }
        let entries = self.effective_entry_count;
        if actual > entries {
            return Err(GroupByError::internal(format!(
                "actual row count {} exceeds capacity {}",
                actual, entries
            )));
        }
        if actual == entries || entries == 0 {
            return Ok(());
        }
        let id = self.buffers[buffer_idx];
        let qmd = Arc::clone(&self.qmd);
        self.owner.with_buffer_mut(id, move |buf| {
            // Index column truncates in place; target columns move to
            // their compacted offsets in slot order, so each source
            // region is consumed before it is overwritten.
            let mut dst = 8 * actual;
            for slot_idx in 0..qmd.slot_context().slot_count() {
                let width = qmd.slot_context().padded_size(slot_idx);
                let src = qmd.col_offset_for(slot_idx, entries);
                let live = width * actual;
                buf.copy_within(src..src + live, dst);
                dst += align8(live);
            }
        })
    }

    /// GPU variant: refresh the host mirror from the device allocation,
    /// then compact on the host.
    pub fn compact_projection_buffer_from_gpu(
        &self,
        buffer_idx: usize,
        actual: usize,
    ) -> GroupByResult<()> {
        self.copy_buffer_from_gpu(buffer_idx)?;
        self.compact_projection_buffer(buffer_idx, actual)
    }

    fn copy_buffer_from_gpu(&self, buffer_idx: usize) -> GroupByResult<()> {
        let device = self
            .device_buffers
            .get(buffer_idx)
            .ok_or_else(|| GroupByError::internal("no device buffer to copy back"))?;
        let id = self.buffers[buffer_idx];
        self.owner.with_buffer_mut(id, |buf| {
            device
                .copy_to_host(0, buf)
                .map_err(GroupByError::Internal)
        })?
    }

    /// Copy every result buffer back from the device after the kernel
    /// fence.
    pub fn copy_group_by_buffers_from_gpu(&self) -> GroupByResult<()> {
        for buffer_idx in 0..self.device_buffers.len() {
            self.copy_buffer_from_gpu(buffer_idx)?;
        }
        Ok(())
    }

    /// Merge per-thread heaps, apply the declared offset, and pack the
    /// surviving rows at the start of the buffer. Returns the final row
    /// count.
    pub fn apply_streaming_topn_offset(
        &self,
        buffer_idx: usize,
        key: &TopNSortKey,
    ) -> GroupByResult<usize> {
        let layout = self
            .heap_layout
            .ok_or_else(|| GroupByError::internal("offset application without streaming top-n"))?;
        let offset = self.qmd.topn_offset();
        let limit = self.qmd.topn_limit();
        let id = self.buffers[buffer_idx];
        self.owner.with_buffer_mut(id, move |buf| {
            streaming_topn::apply_offset(buf, &layout, key, offset, limit)
        })?
    }

    /// GPU variant of the offset application: device-side heaps are
    /// copied back first.
    pub fn apply_streaming_topn_offset_from_gpu(
        &self,
        buffer_idx: usize,
        key: &TopNSortKey,
    ) -> GroupByResult<usize> {
        self.copy_buffer_from_gpu(buffer_idx)?;
        self.apply_streaming_topn_offset(buffer_idx, key)
    }

    /// Move every GPU mode hash table into its host `AggMode`
    /// counterpart. A device table that overflowed its capacity reports
    /// u64::MAX entries and forces a CPU re-run.
    pub fn copy_mode_from_gpu(&self) -> GroupByResult<()> {
        for (buffer_idx, tables) in self.mode_device_tables.iter().enumerate() {
            let mut ordinal = 0;
            for (col, target) in self.targets.iter().enumerate() {
                if !target.is_mode() {
                    continue;
                }
                let table = &tables[ordinal];
                ordinal += 1;
                let slot_idx = self.qmd.slot_context().col_slots(col)[0];
                for entry in 0..self.effective_entry_count {
                    let mut sub = vec![0u8; MODE_DEVICE_TABLE_BYTES];
                    table
                        .copy_to_host(entry * MODE_DEVICE_TABLE_BYTES, &mut sub)
                        .map_err(GroupByError::Internal)?;
                    let count = u64::from_ne_bytes(sub[..8].try_into().unwrap());
                    if count == u64::MAX {
                        return Err(GroupByError::QueryMustRunOnCpu);
                    }
                    if count == 0 {
                        continue;
                    }
                    if count as usize > MODE_DEVICE_TABLE_CAPACITY {
                        return Err(GroupByError::internal("mode table count exceeds capacity"));
                    }
                    let handle = self.read_slot_handle(buffer_idx, entry, slot_idx)?;
                    self.owner.with_mode_mut(handle, |mode| {
                        for pair in 0..count as usize {
                            let off = 8 + pair * 16;
                            let value =
                                i64::from_ne_bytes(sub[off..off + 8].try_into().unwrap());
                            let n =
                                u64::from_ne_bytes(sub[off + 8..off + 16].try_into().unwrap());
                            mode.add_count(value, n);
                        }
                    })?;
                }
            }
        }
        Ok(())
    }

    fn read_slot_handle(
        &self,
        buffer_idx: usize,
        entry: usize,
        slot_idx: usize,
    ) -> GroupByResult<SlotHandle> {
        let id = self.buffers[buffer_idx];
        let off = self.qmd.col_offset(slot_idx) + entry * self.qmd.next_col_off(slot_idx);
        let raw = self.owner.with_buffer(id, |buf| {
            buf.get(off..off + 8)
                .map(|b| u64::from_ne_bytes(b.try_into().unwrap()))
                .ok_or_else(|| GroupByError::internal("handle slot outside buffer"))
        })??;
        Ok(SlotHandle::from_raw(raw))
    }

    // Accessors.

    pub fn descriptor(&self) -> &QueryMemoryDescriptor {
        &self.qmd
    }

    pub fn num_buffers(&self) -> usize {
        self.num_buffers
    }

    pub fn buffers(&self) -> &[BufferId] {
        &self.buffers
    }

    pub fn varlen_buffers(&self) -> &[BufferId] {
        &self.varlen_buffers
    }

    pub fn heap_layout(&self) -> Option<&TopNHeapLayout> {
        self.heap_layout.as_ref()
    }

    /// Device-side main allocation, for the kernel launcher.
    pub fn device_buffer_mut(&mut self, buffer_idx: usize) -> Option<&mut DeviceBuffer> {
        self.device_buffers.get_mut(buffer_idx)
    }

    /// Device-side mode table array for one mode target ordinal.
    pub fn mode_device_table_mut(
        &mut self,
        buffer_idx: usize,
        ordinal: usize,
    ) -> Option<&mut DeviceBuffer> {
        self.mode_device_tables
            .get_mut(buffer_idx)
            .and_then(|tables| tables.get_mut(ordinal))
    }

    pub fn init_vals(&self) -> &[i64] {
        &self.init_vals
    }

    pub fn effective_entry_count(&self) -> usize {
        self.effective_entry_count
    }

    /// One reader per buffer, holding a weak handle into the owner. The
    /// readers start at the seeded entry range, which the bump allocator
    /// and streaming heaps size past the descriptor's entry count.
    pub fn result_sets(&self) -> Vec<ResultSet> {
        self.buffers
            .iter()
            .map(|id| {
                ResultSet::new(
                    Arc::clone(&self.qmd),
                    &self.owner,
                    *id,
                    self.effective_entry_count,
                    Arc::clone(&self.init_vals),
                )
            })
            .collect()
    }
}

/// Fill a buffer with copies of one row. The parallel path splits the
/// row range over scoped threads; broadcast and per-row writes produce
/// byte-identical buffers.
fn broadcast_template(buf: &mut [u8], template: &[u8], parallel: bool) {
    let row_size = template.len();
    if row_size == 0 || buf.is_empty() {
        return;
    }
    let rows = buf.len() / row_size;
    if parallel && rows >= PARALLEL_SEED_MIN_ROWS {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(8);
        let chunk_rows = rows.div_ceil(workers).max(1);
        std::thread::scope(|scope| {
            for chunk in buf.chunks_mut(chunk_rows * row_size) {
                scope.spawn(move || {
                    for row in chunk.chunks_mut(row_size) {
                        row.copy_from_slice(&template[..row.len()]);
                    }
                });
            }
        });
    } else {
        for row in buf.chunks_mut(row_size) {
            row.copy_from_slice(&template[..row.len()]);
        }
    }
}

/// Neutral identity per slot: zero for counting and summing, the
/// width-appropriate extremum for min/max, the null sentinel for
/// non-aggregated values. Handle slots start at zero and are overwritten
/// during per-entry seeding.
pub fn compute_init_values(qmd: &QueryMemoryDescriptor, targets: &[TargetInfo]) -> Vec<i64> {
    let mut vals = vec![0i64; qmd.slot_context().slot_count()];
    for (col, target) in targets.iter().enumerate() {
        let slots = qmd.slot_context().col_slots(col).to_vec();
        for slot_idx in &slots {
            let width = qmd.slot_context().padded_size(*slot_idx);
            if width == 0 {
                continue;
            }
            vals[*slot_idx] = slot_init_value(target, width);
        }
    }
    vals
}

fn slot_init_value(target: &TargetInfo, width: usize) -> i64 {
    let is_float = matches!(
        target.data_type,
        arrow::datatypes::DataType::Float32 | arrow::datatypes::DataType::Float64
    );
    match target.agg {
        None => null_sentinel(target, width),
        Some(AggKind::Count) | Some(AggKind::CountIf) => 0,
        Some(AggKind::Sum) => 0,
        // Sum then count; both start at zero.
        Some(AggKind::Avg) => 0,
        Some(AggKind::Min) => {
            if is_float {
                float_bits(f64::MAX, width)
            } else {
                int_max_for_width(width)
            }
        }
        Some(AggKind::Max) => {
            if is_float {
                float_bits(f64::MIN, width)
            } else {
                int_min_for_width(width)
            }
        }
        Some(AggKind::Mode) | Some(AggKind::ApproxQuantile) => 0,
        Some(AggKind::Sample) | Some(AggKind::SingleValue) => null_sentinel(target, width),
    }
}

fn null_sentinel(target: &TargetInfo, width: usize) -> i64 {
    let is_float = matches!(
        target.data_type,
        arrow::datatypes::DataType::Float32 | arrow::datatypes::DataType::Float64
    );
    if is_float {
        float_bits(f64::MIN, width)
    } else {
        int_min_for_width(width)
    }
}

fn int_min_for_width(width: usize) -> i64 {
    match width {
        1 => i8::MIN as i64,
        2 => i16::MIN as i64,
        4 => i32::MIN as i64,
        _ => i64::MIN,
    }
}

fn int_max_for_width(width: usize) -> i64 {
    match width {
        1 => i8::MAX as i64,
        2 => i16::MAX as i64,
        4 => i32::MAX as i64,
        _ => i64::MAX,
    }
}

fn float_bits(value: f64, width: usize) -> i64 {
    match width {
        4 => (value as f32).to_bits() as i64,
        _ => value.to_bits() as i64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::UniqueId;
    use crate::exec::groupby::exec_unit::{ColRange, GroupColumn, RelAlgExecutionUnit};
    use crate::exec::groupby::query_memory_descriptor::DescriptorOptions;
    use crate::exec::groupby::exec_unit::TableStats;
    use crate::runtime::device::GpuAllocator;
    use crate::runtime::mem_tracker::MemTracker;
    use arrow::datatypes::DataType;

    fn owner() -> Arc<QueryMemoryOwner> {
        let root = MemTracker::new_root("test");
        QueryMemoryOwner::new(UniqueId { hi: 7, lo: 7 }, &root)
    }

    fn derive(ra: &RelAlgExecutionUnit, options: &DescriptorOptions) -> Arc<QueryMemoryDescriptor> {
        Arc::new(
            QueryMemoryDescriptor::derive(
                ra,
                &TableStats::with_total(1000),
                &QueryMemoryConfig::default(),
                options,
            )
            .expect("derive"),
        )
    }

    #[test]
    fn non_grouped_sum_seeds_identity() {
        let ra = RelAlgExecutionUnit::new(vec![], vec![TargetInfo::sum(DataType::Int32)]);
        let qmd = derive(&ra, &DescriptorOptions::default());
        let owner = owner();
        let init = QueryMemoryInitializer::new(
            Arc::clone(&qmd),
            &ra.targets,
            &QueryMemoryConfig::default(),
            &owner,
            InitializerOptions::default(),
        )
        .expect("init");
        let rs = init.result_sets().remove(0);
        assert_eq!(rs.entry_count(), 1);
        assert_eq!(rs.read_slot(0, 0).expect("slot"), 0);
    }

    #[test]
    fn keyless_entries_probe_empty_until_written() {
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
        let owner = owner();
        let init = QueryMemoryInitializer::new(
            Arc::clone(&qmd),
            &ra.targets,
            &QueryMemoryConfig::default(),
            &owner,
            InitializerOptions::default(),
        )
        .expect("init");
        let mut rs = init.result_sets().remove(0);
        for entry in 0..10 {
            assert!(rs.is_entry_empty(entry).expect("probe"));
        }
        // Kernel writes a count of 5 into entry 3.
        owner
            .with_buffer_mut(rs.buffer_id(), |buf| {
                buf[3 * 8..4 * 8].copy_from_slice(&5i64.to_ne_bytes());
            })
            .expect("write");
        assert!(!rs.is_entry_empty(3).expect("probe"));
        assert_eq!(rs.read_slot(3, 0).expect("slot"), 5);
        assert_eq!(rs.row_count().expect("rows"), 1);
        rs.set_entry_count(4);
        assert_eq!(rs.entry_count(), 4);
    }

    #[test]
    fn baseline_keys_seed_the_empty_sentinel() {
        let ra = RelAlgExecutionUnit::new(
            vec![
                GroupColumn::new(DataType::Int64),
                GroupColumn::new(DataType::Int64),
            ],
            vec![TargetInfo::avg(DataType::Float64)],
        );
        let options = DescriptorOptions {
            max_groups: 16,
            ..DescriptorOptions::default()
        };
        let qmd = derive(&ra, &options);
        let owner = owner();
        let init = QueryMemoryInitializer::new(
            Arc::clone(&qmd),
            &ra.targets,
            &QueryMemoryConfig::default(),
            &owner,
            InitializerOptions::default(),
        )
        .expect("init");
        let rs = init.result_sets().remove(0);
        for entry in 0..16 {
            assert_eq!(rs.read_key(entry, 0).expect("key"), EMPTY_KEY_64);
            assert_eq!(rs.read_key(entry, 1).expect("key"), EMPTY_KEY_64);
            assert!(rs.is_entry_empty(entry).expect("probe"));
        }
        // Sum and count slots both start at zero.
        assert_eq!(rs.read_slot(5, 0).expect("sum"), 0);
        assert_eq!(rs.read_slot(5, 1).expect("count"), 0);
    }

    #[test]
    fn broadcast_matches_per_entry_seeding() {
        let template: Vec<u8> = (0u8..16).collect();
        let mut fast = vec![0u8; 16 * 100];
        let mut slow = vec![0u8; 16 * 100];
        broadcast_template(&mut fast, &template, true);
        for row in slow.chunks_mut(16) {
            row.copy_from_slice(&template);
        }
        assert_eq!(fast, slow);
    }

    #[test]
    fn bitmap_total_over_limit_fails_before_allocating() {
        let ra = RelAlgExecutionUnit::new(
            vec![GroupColumn::with_range(
                DataType::Int64,
                ColRange {
                    min: 0,
                    max: 999,
                    bucket: 0,
                    has_nulls: false,
                },
            )],
            vec![TargetInfo::approx_count_distinct(DataType::Int64)],
        );
        let qmd = derive(&ra, &DescriptorOptions::default());
        // 1000 entries x 2 KiB bitmaps.
        let mut config = QueryMemoryConfig::default();
        config.bitmap_memory_limit = 1000 * 2048;
        let owner_at_limit = owner();
        assert!(
            QueryMemoryInitializer::new(
                Arc::clone(&qmd),
                &ra.targets,
                &config,
                &owner_at_limit,
                InitializerOptions::default(),
            )
            .is_ok()
        );
        config.bitmap_memory_limit = 1000 * 2048 - 1;
        let owner_over = owner();
        let err = QueryMemoryInitializer::new(
            Arc::clone(&qmd),
            &ra.targets,
            &config,
            &owner_over,
            InitializerOptions::default(),
        )
        .expect_err("over limit");
        assert!(matches!(
            err,
            GroupByError::OutOfHostMemory { bytes } if bytes == 1000 * 2048
        ));
    }

    #[test]
    fn distinct_entries_get_unique_bitmap_handles() {
        let ra = RelAlgExecutionUnit::new(
            vec![GroupColumn::with_range(
                DataType::Int64,
                ColRange {
                    min: 0,
                    max: 3,
                    bucket: 0,
                    has_nulls: false,
                },
            )],
            vec![TargetInfo::approx_count_distinct(DataType::Int64)],
        );
        let qmd = derive(&ra, &DescriptorOptions::default());
        let owner = owner();
        let init = QueryMemoryInitializer::new(
            Arc::clone(&qmd),
            &ra.targets,
            &QueryMemoryConfig::default(),
            &owner,
            InitializerOptions::default(),
        )
        .expect("init");
        let rs = init.result_sets().remove(0);
        let mut handles = Vec::new();
        for entry in 0..4 {
            handles.push(rs.read_slot(entry, 0).expect("handle") as u64);
        }
        handles.sort_unstable();
        handles.dedup();
        assert_eq!(handles.len(), 4);
        // Handles resolve to live bitmaps in the owner.
        for raw in handles {
            owner
                .with_bitmap(SlotHandle::from_raw(raw), |bits| {
                    assert!(bits.iter().all(|b| *b == 0));
                })
                .expect("bitmap");
        }
    }

    #[test]
    fn columnar_compaction_packs_live_rows() {
        let mut ra = RelAlgExecutionUnit::new(
            vec![],
            vec![
                TargetInfo::column(DataType::Int32),
                TargetInfo::column(DataType::Int32),
            ],
        );
        ra.scan_limit = Some(10);
        let options = DescriptorOptions {
            output_columnar_hint: true,
            ..DescriptorOptions::default()
        };
        let qmd = derive(&ra, &options);
        let owner = owner();
        let init = QueryMemoryInitializer::new(
            Arc::clone(&qmd),
            &ra.targets,
            &QueryMemoryConfig::default(),
            &owner,
            InitializerOptions::default(),
        )
        .expect("init");
        let mut rs = init.result_sets().remove(0);
        // Kernel writes three live rows in each column.
        let x_off = qmd.col_offset(0);
        let y_off = qmd.col_offset(1);
        owner
            .with_buffer_mut(rs.buffer_id(), |buf| {
                for row in 0..3i32 {
                    let x = x_off + row as usize * 4;
                    buf[x..x + 4].copy_from_slice(&(row + 1).to_ne_bytes());
                    let y = y_off + row as usize * 4;
                    buf[y..y + 4].copy_from_slice(&((row + 1) * 10).to_ne_bytes());
                }
            })
            .expect("write");
        init.compact_projection_buffer(0, 3).expect("compact");
        rs.set_entry_count(3);
        // Columns are now packed back to back after the index column.
        owner
            .with_buffer(rs.buffer_id(), |buf| {
                let x_base = 8 * 3;
                let y_base = x_base + align8(4 * 3);
                for row in 0..3usize {
                    let x =
                        i32::from_ne_bytes(buf[x_base + row * 4..x_base + row * 4 + 4].try_into().unwrap());
                    let y =
                        i32::from_ne_bytes(buf[y_base + row * 4..y_base + row * 4 + 4].try_into().unwrap());
                    assert_eq!(x, row as i32 + 1);
                    assert_eq!(y, (row as i32 + 1) * 10);
                }
            })
            .expect("read");
    }

    #[test]
    fn result_set_reads_follow_compacted_offsets() {
        let mut ra =
            RelAlgExecutionUnit::new(vec![], vec![TargetInfo::column(DataType::Int64)]);
        ra.scan_limit = Some(10);
        let options = DescriptorOptions {
            output_columnar_hint: true,
            ..DescriptorOptions::default()
        };
        let qmd = derive(&ra, &options);
        let owner = owner();
        let init = QueryMemoryInitializer::new(
            Arc::clone(&qmd),
            &ra.targets,
            &QueryMemoryConfig::default(),
            &owner,
            InitializerOptions::default(),
        )
        .expect("init");
        let mut rs = init.result_sets().remove(0);
        let col = qmd.col_offset(0);
        owner
            .with_buffer_mut(rs.buffer_id(), |buf| {
                for row in 0..9i64 {
                    let off = col + row as usize * 8;
                    buf[off..off + 8].copy_from_slice(&(100 + row).to_ne_bytes());
                }
            })
            .expect("write");
        init.compact_projection_buffer(0, 9).expect("compact");
        rs.set_entry_count(9);
        for row in 0..9 {
            assert_eq!(rs.read_slot(row, 0).expect("slot"), 100 + row as i64);
        }
        assert!(rs.read_slot(9, 0).is_err());
    }

    #[test]
    fn gpu_buffers_stage_and_copy_back() {
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
            vec![TargetInfo::count()],
        );
        // Large bins keep interleaving off so the host mirror is
        // byte-comparable.
        let options = DescriptorOptions {
            device: DeviceKind::Gpu,
            ..DescriptorOptions::default()
        };
        let mut config = QueryMemoryConfig::default();
        config.enable_smem_group_by = false;
        let qmd = Arc::new(
            QueryMemoryDescriptor::derive(&ra, &TableStats::with_total(1000), &config, &options)
                .expect("derive"),
        );
        let owner = owner();
        let alloc = GpuAllocator::new(0, 1 << 20, 1 << 24);
        let init = QueryMemoryInitializer::new(
            Arc::clone(&qmd),
            &ra.targets,
            &config,
            &owner,
            InitializerOptions {
                launch: LaunchParams {
                    block_size: 2,
                    grid_size: 2,
                    blocks_share_memory: false,
                },
                allocator: Some(&alloc),
                ..InitializerOptions::default()
            },
        )
        .expect("init");
        assert_eq!(init.num_buffers(), 4);
        // Poison the host mirrors, then restore them from the device.
        for id in init.buffers() {
            owner.with_buffer_mut(*id, |buf| buf.fill(0xAA)).expect("poison");
        }
        init.copy_group_by_buffers_from_gpu().expect("copy back");
        let rs = init.result_sets().remove(0);
        for entry in 0..10 {
            assert!(rs.is_entry_empty(entry).expect("probe"));
        }
    }

    #[test]
    fn reused_buffer_skips_reseeding() {
        let mut ra = RelAlgExecutionUnit::new(
            vec![GroupColumn::with_range(
                DataType::Int32,
                ColRange {
                    min: 0,
                    max: 9,
                    bucket: 0,
                    has_nulls: false,
                },
            )],
            vec![TargetInfo::count()],
        );
        ra.threads_can_reuse_group_by_buffers = true;
        let qmd = derive(&ra, &DescriptorOptions::default());
        let owner = owner();
        let first = QueryMemoryInitializer::new(
            Arc::clone(&qmd),
            &ra.targets,
            &QueryMemoryConfig::default(),
            &owner,
            InitializerOptions::default(),
        )
        .expect("first");
        let first_buffer = first.buffers()[0];
        // Kernel result survives in the recycled buffer.
        owner
            .with_buffer_mut(first_buffer, |buf| {
                buf[0..8].copy_from_slice(&9i64.to_ne_bytes());
            })
            .expect("write");
        owner.recycle_buffer(first_buffer).expect("recycle");
        let second = QueryMemoryInitializer::new(
            Arc::clone(&qmd),
            &ra.targets,
            &QueryMemoryConfig::default(),
            &owner,
            InitializerOptions::default(),
        )
        .expect("second");
        assert_eq!(second.buffers()[0], first_buffer);
        let value = owner
            .with_buffer(first_buffer, |buf| {
                i64::from_ne_bytes(buf[0..8].try_into().unwrap())
            })
            .expect("read");
        assert_eq!(value, 9);
    }

    #[test]
    fn zero_entries_allocate_nothing() {
        let mut ra = RelAlgExecutionUnit::new(vec![], vec![TargetInfo::column(DataType::Int64)]);
        ra.scan_limit = Some(0);
        let qmd = derive(&ra, &DescriptorOptions::default());
        assert_eq!(qmd.default_buffer_size_bytes(), 0);
        let owner = owner();
        let init = QueryMemoryInitializer::new(
            Arc::clone(&qmd),
            &ra.targets,
            &QueryMemoryConfig::default(),
            &owner,
            InitializerOptions::default(),
        )
        .expect("init");
        assert_eq!(owner.buffer_len(init.buffers()[0]).expect("len"), 0);
    }
}
