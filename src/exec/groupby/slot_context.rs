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
//! Physical slot layout of one result row.
//!
//! Each output target owns one or more slots. A slot has a logical size
//! (the semantic width of the value) and a padded size (the width
//! actually stored). Padded sizes are resolved once, before any geometry
//! query, and never shrink below logical sizes afterwards. A padded size
//! of zero marks a logically absent slot: a group-by column that is also
//! its own target under baseline hashing, or a lazily fetched column.

use super::error::{GroupByError, GroupByResult};
use super::target_info::{TargetInfo, byte_width, is_varlen_type};

/// Slots wider than this are never required; all scalar storage fits in
/// eight bytes.
pub const MAX_SLOT_WIDTH: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Slot {
    logical: usize,
    /// None until `resolve_padding` runs; Some(0) marks an absent slot.
    padded: Option<usize>,
    /// Declared flat-buffer byte size for table-function output slots.
    flatbuffer_size: Option<usize>,
}

impl Slot {
    fn fixed(width: usize) -> Self {
        Self {
            logical: width,
            padded: Some(width),
            flatbuffer_size: None,
        }
    }

    fn unpadded(logical: usize) -> Self {
        Self {
            logical,
            padded: None,
            flatbuffer_size: None,
        }
    }

    pub fn logical_size(&self) -> usize {
        self.logical
    }

    pub fn padded_size(&self) -> usize {
        self.padded.unwrap_or(MAX_SLOT_WIDTH)
    }

    pub fn is_absent(&self) -> bool {
        self.padded == Some(0) && self.flatbuffer_size.is_none()
    }

    pub fn is_flatbuffer(&self) -> bool {
        self.flatbuffer_size.is_some()
    }

    pub fn flatbuffer_size(&self) -> Option<usize> {
        self.flatbuffer_size
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SlotContext {
    slots: Vec<Slot>,
    /// Per output column: indices of the slots backing it.
    col_to_slots: Vec<Vec<usize>>,
}

impl SlotContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the slot list for an ordered target list with the given
    /// compact aggregate width (4 or 8). With `lazy_fetch_enabled` off,
    /// targets marked lazy still get materialized slots.
    pub fn from_targets(
        targets: &[TargetInfo],
        compact_width: usize,
        lazy_fetch_enabled: bool,
    ) -> Self {
        let mut ctx = Self::new();
        for target in targets {
            ctx.add_target(target, compact_width, lazy_fetch_enabled);
        }
        ctx
    }

    pub fn add_target(
        &mut self,
        target: &TargetInfo,
        compact_width: usize,
        lazy_fetch_enabled: bool,
    ) {
        let first_slot = self.slots.len();

        if let Some(flat) = target.flatbuffer_size {
            self.slots.push(Slot {
                logical: 0,
                padded: Some(0),
                flatbuffer_size: Some(flat),
            });
        } else if target.is_lazy_fetch && lazy_fetch_enabled {
            self.slots.push(Slot {
                logical: byte_width(&target.data_type),
                padded: Some(0),
                flatbuffer_size: None,
            });
        } else if target.physical_coord_cols > 0 {
            // Pointer + length per physical coordinate column.
            for _ in 0..target.physical_coord_cols {
                self.slots.push(Slot::unpadded(8));
                self.slots.push(Slot::unpadded(8));
            }
        } else if !target.is_agg() {
            if is_varlen_type(&target.data_type) {
                // Pointer + length.
                self.slots.push(Slot::unpadded(8));
                self.slots.push(Slot::unpadded(8));
            } else {
                self.slots.push(Slot::fixed(byte_width(&target.data_type)));
            }
        } else {
            match target.agg.expect("aggregate kind") {
                super::target_info::AggKind::Avg => {
                    // Sum and count.
                    self.slots.push(Slot::unpadded(8));
                    self.slots.push(Slot::unpadded(8));
                }
                super::target_info::AggKind::Count | super::target_info::AggKind::CountIf => {
                    // Plain counts and distinct-count handles both take
                    // one 8-byte slot.
                    self.slots.push(Slot::unpadded(8));
                }
                super::target_info::AggKind::Sample
                    if target.arg_type.as_ref().is_some_and(is_varlen_type) =>
                {
                    self.slots.push(Slot::unpadded(8));
                    self.slots.push(Slot::unpadded(8));
                }
                super::target_info::AggKind::Mode
                | super::target_info::AggKind::ApproxQuantile => {
                    // Handle slot.
                    self.slots.push(Slot::unpadded(8));
                }
                _ => {
                    // The compact-width derivation has already widened to
                    // eight bytes when any target needs it.
                    self.slots.push(Slot::unpadded(compact_width));
                }
            }
        }

        self.col_to_slots.push((first_slot..self.slots.len()).collect());
    }

    /// Mark all slots of an output column as logically absent.
    pub fn set_col_absent(&mut self, col: usize) -> GroupByResult<()> {
        let slot_indices = self
            .col_to_slots
            .get(col)
            .cloned()
            .ok_or_else(|| GroupByError::internal(format!("no such column: {}", col)))?;
        for idx in slot_indices {
            self.slots[idx].padded = Some(0);
            self.slots[idx].flatbuffer_size = None;
        }
        Ok(())
    }

    /// Resolve every unset padded size. With `logical_sized_columns`
    /// (column-major Projection / TableFunction output), padded sizes
    /// collapse to logical sizes; otherwise unset slots widen to eight
    /// bytes.
    pub fn resolve_padding(&mut self, logical_sized_columns: bool) {
        for slot in &mut self.slots {
            if slot.is_flatbuffer() || slot.padded == Some(0) {
                continue;
            }
            slot.padded = if logical_sized_columns {
                Some(slot.logical)
            } else {
                Some(slot.padded.unwrap_or(MAX_SLOT_WIDTH))
            };
        }
    }

    /// Re-align slots so that each slot's byte offset within the target
    /// region is a multiple of its padded size (capped at eight). The pad
    /// is absorbed by widening the preceding slot.
    pub fn align_slots(&mut self) {
        let mut offset = 0usize;
        let mut prev: Option<usize> = None;
        for idx in 0..self.slots.len() {
            let padded = self.slots[idx].padded_size();
            if padded == 0 {
                continue;
            }
            let align = padded.min(MAX_SLOT_WIDTH);
            let rem = offset % align;
            if rem != 0 {
                let pad = align - rem;
                if let Some(prev_idx) = prev {
                    if let Some(p) = self.slots[prev_idx].padded.as_mut() {
                        *p += pad;
                    }
                }
                offset += pad;
            }
            offset += padded;
            prev = Some(idx);
        }
    }

    /// Explicitly widen one slot. Padded sizes never shrink below the
    /// logical size.
    pub fn set_padded_size(&mut self, slot_idx: usize, width: usize) -> GroupByResult<()> {
        let slot = self
            .slots
            .get_mut(slot_idx)
            .ok_or_else(|| GroupByError::internal(format!("no such slot: {}", slot_idx)))?;
        if width < slot.logical {
            return Err(GroupByError::internal(format!(
                "padded size {} below logical size {} for slot {}",
                width, slot.logical, slot_idx
            )));
        }
        slot.padded = Some(width);
        Ok(())
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn col_count(&self) -> usize {
        self.col_to_slots.len()
    }

    pub fn slot(&self, idx: usize) -> Option<&Slot> {
        self.slots.get(idx)
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn col_slots(&self, col: usize) -> &[usize] {
        self.col_to_slots
            .get(col)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn padded_size(&self, idx: usize) -> usize {
        self.slots.get(idx).map(Slot::padded_size).unwrap_or(0)
    }

    pub fn logical_size(&self, idx: usize) -> usize {
        self.slots.get(idx).map(Slot::logical_size).unwrap_or(0)
    }

    /// Byte offset of a slot within the target region of one row.
    pub fn offset_in_row(&self, slot_idx: usize) -> usize {
        self.slots
            .iter()
            .take(slot_idx)
            .map(Slot::padded_size)
            .sum()
    }

    pub fn total_padded_bytes(&self) -> usize {
        self.slots.iter().map(Slot::padded_size).sum()
    }

    pub fn total_logical_bytes(&self) -> usize {
        self.slots.iter().map(Slot::logical_size).sum()
    }

    /// Consistency checks before the layout is shared with readers and
    /// code generation. The caller's target list must agree on column
    /// count; every padded size must be resolved and at least logical.
    pub fn validate(&self, targets: &[TargetInfo]) -> GroupByResult<()> {
        if targets.len() != self.col_to_slots.len() {
            return Err(GroupByError::SchemaMismatch(format!(
                "target list has {} entries, slot context maps {}",
                targets.len(),
                self.col_to_slots.len()
            )));
        }
        for (idx, slot) in self.slots.iter().enumerate() {
            let Some(padded) = slot.padded else {
                return Err(GroupByError::internal(format!(
                    "slot {} padded size unresolved",
                    idx
                )));
            };
            if padded != 0 && padded < slot.logical {
                return Err(GroupByError::internal(format!(
                    "slot {} padded size {} below logical {}",
                    idx, padded, slot.logical
                )));
            }
        }
        Ok(())
    }
}
