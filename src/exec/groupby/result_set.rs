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
//! Reader over one seeded and executed result buffer.
//!
//! The result set holds a weak handle into the per-query memory owner;
//! it never owns buffer storage and is invalidated when the owner is
//! dropped. Emptiness probing under the keyless layout is a method
//! here, not an implicit byte comparison at call sites.

use std::sync::{Arc, Weak};

use crate::runtime::memory_owner::{BufferId, QueryMemoryOwner};

use super::error::{GroupByError, GroupByResult};
use super::query_memory_descriptor::{
    QueryDescriptionType, QueryMemoryDescriptor, empty_key_for_width,
};

/// Write a native-endian scalar of `width` bytes at `off`.
pub(crate) fn write_scalar(buf: &mut [u8], off: usize, width: usize, value: i64) {
    let bytes = value.to_ne_bytes();
    buf[off..off + width].copy_from_slice(&bytes[..width]);
}

/// Sign-extending native-endian read of `width` bytes at `off`.
pub(crate) fn read_scalar(buf: &[u8], off: usize, width: usize) -> i64 {
    match width {
        1 => buf[off] as i8 as i64,
        2 => i16::from_ne_bytes(buf[off..off + 2].try_into().unwrap()) as i64,
        4 => i32::from_ne_bytes(buf[off..off + 4].try_into().unwrap()) as i64,
        _ => i64::from_ne_bytes(buf[off..off + 8].try_into().unwrap()),
    }
}

pub struct ResultSet {
    qmd: Arc<QueryMemoryDescriptor>,
    owner: Weak<QueryMemoryOwner>,
    buffer: BufferId,
    entry_count: usize,
    /// Per-slot seeded identity values; the keyless probe compares
    /// against these.
    init_vals: Arc<Vec<i64>>,
}

impl ResultSet {
    pub fn new(
        qmd: Arc<QueryMemoryDescriptor>,
        owner: &Arc<QueryMemoryOwner>,
        buffer: BufferId,
        entry_count: usize,
        init_vals: Arc<Vec<i64>>,
    ) -> Self {
        Self {
            qmd,
            owner: Arc::downgrade(owner),
            buffer,
            entry_count,
            init_vals,
        }
    }

    pub fn descriptor(&self) -> &QueryMemoryDescriptor {
        &self.qmd
    }

    pub fn buffer_id(&self) -> BufferId {
        self.buffer
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    /// Shrink the visible entry range after compaction or top-N offset
    /// application. Column-major offsets follow the new count, so reads
    /// land on the compacted block positions.
    pub fn set_entry_count(&mut self, entry_count: usize) {
        self.entry_count = entry_count;
    }

    pub fn init_vals(&self) -> &[i64] {
        &self.init_vals
    }

    fn owner(&self) -> GroupByResult<Arc<QueryMemoryOwner>> {
        self.owner
            .upgrade()
            .ok_or_else(|| GroupByError::internal("result set outlived the query memory owner"))
    }

    fn check_entry(&self, entry: usize) -> GroupByResult<()> {
        if entry >= self.entry_count {
            return Err(GroupByError::internal(format!(
                "entry {} out of range ({} entries)",
                entry, self.entry_count
            )));
        }
        Ok(())
    }

    /// Raw value of one slot, sign-extended from its padded width.
    pub fn read_slot(&self, entry: usize, slot_idx: usize) -> GroupByResult<i64> {
        self.check_entry(entry)?;
        let width = self.qmd.slot_context().padded_size(slot_idx);
        if width == 0 {
            return Err(GroupByError::internal(format!(
                "slot {} is logically absent",
                slot_idx
            )));
        }
        let off = self.qmd.col_offset_for(slot_idx, self.entry_count)
            + entry * self.qmd.next_col_off(slot_idx);
        self.owner()?
            .with_buffer(self.buffer, |buf| {
                if off + width > buf.len() {
                    return Err(GroupByError::internal("slot read past buffer end"));
                }
                Ok(read_scalar(buf, off, width))
            })?
    }

    /// Inline group key of one entry. Not valid under the keyless
    /// layout, where keys are recomputed from the bin index.
    pub fn read_key(&self, entry: usize, key_idx: usize) -> GroupByResult<i64> {
        self.check_entry(entry)?;
        if self.qmd.is_keyless() {
            return Err(GroupByError::internal(
                "keyless layout stores no inline keys",
            ));
        }
        if key_idx >= self.qmd.group_col_count() {
            return Err(GroupByError::internal(format!(
                "key {} out of range",
                key_idx
            )));
        }
        let (off, width) = if self.qmd.is_output_columnar() {
            let width = 8;
            (
                key_idx * super::query_memory_descriptor::align8(8 * self.entry_count)
                    + entry * width,
                width,
            )
        } else {
            let width = self.qmd.effective_key_width();
            (entry * self.qmd.row_size() + key_idx * width, width)
        };
        self.owner()?
            .with_buffer(self.buffer, |buf| {
                if off + width > buf.len() {
                    return Err(GroupByError::internal("key read past buffer end"));
                }
                Ok(read_scalar(buf, off, width))
            })?
    }

    /// Whether an entry never received a kernel write. Keyless layouts
    /// probe the designated target slot against its seeded identity;
    /// keyed layouts probe the first key against the empty sentinel.
    pub fn is_entry_empty(&self, entry: usize) -> GroupByResult<bool> {
        self.check_entry(entry)?;
        match self.qmd.description_type() {
            QueryDescriptionType::Projection
            | QueryDescriptionType::TableFunction
            | QueryDescriptionType::Estimator => Ok(false),
            QueryDescriptionType::NonGroupedAggregate => Ok(false),
            QueryDescriptionType::GroupByPerfectHash
            | QueryDescriptionType::GroupByBaselineHash => {
                if let Some(probe_target) = self.qmd.probe_target() {
                    let slot_idx = self.qmd.slot_context().col_slots(probe_target)[0];
                    let seeded = self.init_vals.get(slot_idx).copied().ok_or_else(|| {
                        GroupByError::internal("probe slot has no seeded identity")
                    })?;
                    Ok(self.read_slot(entry, slot_idx)? == seeded)
                } else {
                    let width = if self.qmd.is_output_columnar() {
                        8
                    } else {
                        self.qmd.effective_key_width()
                    };
                    Ok(self.read_key(entry, 0)? == empty_key_for_width(width))
                }
            }
        }
    }

    /// Occupied entries for group-by layouts; the full entry range
    /// otherwise.
    pub fn row_count(&self) -> GroupByResult<usize> {
        if !self.qmd.is_group_by() {
            return Ok(self.entry_count);
        }
        let mut rows = 0;
        for entry in 0..self.entry_count {
            if !self.is_entry_empty(entry)? {
                rows += 1;
            }
        }
        Ok(rows)
    }
}
