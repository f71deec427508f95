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
//! Per-query owner of all group-by memory: result buffers, count-distinct
//! bitmap arenas and sets, T-Digests, and MODE hash tables.
//!
//! Result buffers never store raw pointers. An auxiliary aggregate state
//! is referenced from its 8-byte slot by a `SlotHandle`: an index into a
//! side table owned here. The owner is dropped at query end, releasing
//! every arena on all exit paths; readers hold weak handles and fail
//! cleanly afterwards.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use hashbrown::{HashMap, HashSet};

use crate::common::types::UniqueId;
use crate::exec::groupby::descriptors::ApproxQuantileDescriptor;
use crate::exec::groupby::error::{GroupByError, GroupByResult};
use crate::exec::groupby::sketches::{AggMode, TDigest};
use crate::runtime::mem_tracker::MemTracker;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct BufferId(pub usize);

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ArenaId(pub usize);

/// Stable 8-byte slot encoding shared between kernel and reader:
/// bit 63 is the device discriminator (0 = host side table, 1 = GPU
/// tagged), bits 62..32 a 31-bit table index, bits 31..0 a secondary
/// index (bitmap entry, device sub-table position).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct SlotHandle(u64);

const DEVICE_TAG: u64 = 1 << 63;
const TABLE_MASK: u64 = 0x7FFF_FFFF;

impl SlotHandle {
    pub fn host(table_idx: u32, secondary: u32) -> Self {
        Self(((table_idx as u64) & TABLE_MASK) << 32 | secondary as u64)
    }

    pub fn device_tagged(table_idx: u32, secondary: u32) -> Self {
        Self(DEVICE_TAG | ((table_idx as u64) & TABLE_MASK) << 32 | secondary as u64)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn is_device(self) -> bool {
        self.0 & DEVICE_TAG != 0
    }

    pub fn table_index(self) -> u32 {
        ((self.0 >> 32) & TABLE_MASK) as u32
    }

    pub fn secondary_index(self) -> u32 {
        self.0 as u32
    }
}

#[derive(Debug)]
struct OwnedBuffer {
    bytes: Vec<u8>,
    thread_idx: usize,
}

#[derive(Debug)]
struct BitmapArena {
    bytes: Vec<u8>,
    bitmap_bytes: usize,
    next_entry: usize,
}

#[derive(Debug, Default)]
struct OwnerState {
    buffers: Vec<OwnedBuffer>,
    // Recycled buffers by (thread_idx, len); values index `buffers`.
    free_buffers: HashMap<(usize, usize), Vec<usize>>,
    seeded: HashSet<usize>,
    bitmap_arenas: Vec<BitmapArena>,
    distinct_sets: Vec<HashSet<i64>>,
    tdigests: Vec<TDigest>,
    modes: Vec<AggMode>,
}

#[derive(Debug)]
pub struct QueryMemoryOwner {
    query_id: UniqueId,
    tracker: Arc<MemTracker>,
    consumed: AtomicI64,
    state: Mutex<OwnerState>,
}

impl QueryMemoryOwner {
    pub fn new(query_id: UniqueId, parent: &Arc<MemTracker>) -> Arc<Self> {
        let tracker = MemTracker::new_child(format!("query-{}", query_id), parent);
        Arc::new(Self {
            query_id,
            tracker,
            consumed: AtomicI64::new(0),
            state: Mutex::new(OwnerState::default()),
        })
    }

    pub fn query_id(&self) -> UniqueId {
        self.query_id
    }

    pub fn tracker(&self) -> &Arc<MemTracker> {
        &self.tracker
    }

    fn consume(&self, bytes: usize) {
        let bytes = i64::try_from(bytes).unwrap_or(i64::MAX);
        self.tracker.consume(bytes);
        self.consumed.fetch_add(bytes, Ordering::Relaxed);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, OwnerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate a zero-filled result buffer bound to one worker thread.
    pub fn allocate_buffer(&self, thread_idx: usize, bytes: usize) -> BufferId {
        let mut state = self.lock();
        state.buffers.push(OwnedBuffer {
            bytes: vec![0u8; bytes],
            thread_idx,
        });
        self.consume(bytes);
        BufferId(state.buffers.len() - 1)
    }

    /// Retrieve a recycled same-size buffer for this thread, or allocate.
    /// The boolean is true when the buffer still needs seeding.
    pub fn reuse_or_allocate_buffer(&self, thread_idx: usize, bytes: usize) -> (BufferId, bool) {
        {
            let mut state = self.lock();
            if let Some(free) = state.free_buffers.get_mut(&(thread_idx, bytes)) {
                if let Some(idx) = free.pop() {
                    let needs_seed = !state.seeded.contains(&idx);
                    tracing::debug!(
                        "reusing group-by buffer {} ({} bytes, seeded={})",
                        idx,
                        bytes,
                        !needs_seed
                    );
                    return (BufferId(idx), needs_seed);
                }
            }
        }
        (self.allocate_buffer(thread_idx, bytes), true)
    }

    /// Return a buffer to the per-thread cache for reuse within this
    /// query. Its seeded mark is kept.
    pub fn recycle_buffer(&self, id: BufferId) -> GroupByResult<()> {
        let mut state = self.lock();
        let buf = state
            .buffers
            .get(id.0)
            .ok_or_else(|| GroupByError::internal(format!("no such buffer: {}", id.0)))?;
        let key = (buf.thread_idx, buf.bytes.len());
        state.free_buffers.entry(key).or_default().push(id.0);
        Ok(())
    }

    pub fn mark_buffer_seeded(&self, id: BufferId) {
        self.lock().seeded.insert(id.0);
    }

    pub fn buffer_len(&self, id: BufferId) -> GroupByResult<usize> {
        let state = self.lock();
        state
            .buffers
            .get(id.0)
            .map(|b| b.bytes.len())
            .ok_or_else(|| GroupByError::internal(format!("no such buffer: {}", id.0)))
    }

    pub fn with_buffer<R>(&self, id: BufferId, f: impl FnOnce(&[u8]) -> R) -> GroupByResult<R> {
        let state = self.lock();
        let buf = state
            .buffers
            .get(id.0)
            .ok_or_else(|| GroupByError::internal(format!("no such buffer: {}", id.0)))?;
        Ok(f(&buf.bytes))
    }

    pub fn with_buffer_mut<R>(
        &self,
        id: BufferId,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> GroupByResult<R> {
        let mut state = self.lock();
        let buf = state
            .buffers
            .get_mut(id.0)
            .ok_or_else(|| GroupByError::internal(format!("no such buffer: {}", id.0)))?;
        Ok(f(&mut buf.bytes))
    }

    /// One contiguous zeroed arena for count-distinct bitmaps; handles
    /// are bumped out of it per entry.
    pub fn create_bitmap_arena(
        &self,
        total_bytes: usize,
        bitmap_bytes: usize,
    ) -> GroupByResult<ArenaId> {
        if bitmap_bytes == 0 {
            return Err(GroupByError::internal("bitmap arena with zero bitmap size"));
        }
        let mut state = self.lock();
        state.bitmap_arenas.push(BitmapArena {
            bytes: vec![0u8; total_bytes],
            bitmap_bytes,
            next_entry: 0,
        });
        self.consume(total_bytes);
        Ok(ArenaId(state.bitmap_arenas.len() - 1))
    }

    pub fn bump_bitmap_handle(&self, arena: ArenaId) -> GroupByResult<SlotHandle> {
        let mut state = self.lock();
        let arena_idx = arena.0;
        let a = state
            .bitmap_arenas
            .get_mut(arena_idx)
            .ok_or_else(|| GroupByError::internal(format!("no such bitmap arena: {}", arena_idx)))?;
        let entry = a.next_entry;
        if (entry + 1) * a.bitmap_bytes > a.bytes.len() {
            return Err(GroupByError::internal("bitmap arena exhausted"));
        }
        a.next_entry += 1;
        Ok(SlotHandle::host(arena_idx as u32, entry as u32))
    }

    pub fn with_bitmap<R>(
        &self,
        handle: SlotHandle,
        f: impl FnOnce(&[u8]) -> R,
    ) -> GroupByResult<R> {
        let state = self.lock();
        let a = state
            .bitmap_arenas
            .get(handle.table_index() as usize)
            .ok_or_else(|| GroupByError::internal("bitmap handle: no such arena"))?;
        let start = handle.secondary_index() as usize * a.bitmap_bytes;
        let slice = a
            .bytes
            .get(start..start + a.bitmap_bytes)
            .ok_or_else(|| GroupByError::internal("bitmap handle out of arena range"))?;
        Ok(f(slice))
    }

    pub fn with_bitmap_mut<R>(
        &self,
        handle: SlotHandle,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> GroupByResult<R> {
        let mut state = self.lock();
        let a = state
            .bitmap_arenas
            .get_mut(handle.table_index() as usize)
            .ok_or_else(|| GroupByError::internal("bitmap handle: no such arena"))?;
        let start = handle.secondary_index() as usize * a.bitmap_bytes;
        let bitmap_bytes = a.bitmap_bytes;
        let slice = a
            .bytes
            .get_mut(start..start + bitmap_bytes)
            .ok_or_else(|| GroupByError::internal("bitmap handle out of arena range"))?;
        Ok(f(slice))
    }

    pub fn allocate_distinct_set(&self) -> SlotHandle {
        let mut state = self.lock();
        state.distinct_sets.push(HashSet::new());
        SlotHandle::host((state.distinct_sets.len() - 1) as u32, 0)
    }

    pub fn with_distinct_set_mut<R>(
        &self,
        handle: SlotHandle,
        f: impl FnOnce(&mut HashSet<i64>) -> R,
    ) -> GroupByResult<R> {
        let mut state = self.lock();
        let set = state
            .distinct_sets
            .get_mut(handle.table_index() as usize)
            .ok_or_else(|| GroupByError::internal("no such distinct set"))?;
        Ok(f(set))
    }

    /// Account the digest capacity one worker reserves up front.
    pub fn reserve_tdigest_capacity(&self, total_bytes: usize) {
        self.consume(total_bytes);
    }

    pub fn allocate_tdigest(
        &self,
        descriptor: ApproxQuantileDescriptor,
        quantile: f64,
    ) -> SlotHandle {
        let mut state = self.lock();
        state.tdigests.push(TDigest::new(descriptor, quantile));
        SlotHandle::host((state.tdigests.len() - 1) as u32, 0)
    }

    pub fn with_tdigest_mut<R>(
        &self,
        handle: SlotHandle,
        f: impl FnOnce(&mut TDigest) -> R,
    ) -> GroupByResult<R> {
        let mut state = self.lock();
        let digest = state
            .tdigests
            .get_mut(handle.table_index() as usize)
            .ok_or_else(|| GroupByError::internal("no such tdigest"))?;
        Ok(f(digest))
    }

    pub fn allocate_mode(&self) -> SlotHandle {
        let mut state = self.lock();
        state.modes.push(AggMode::new());
        SlotHandle::host((state.modes.len() - 1) as u32, 0)
    }

    pub fn mode_count(&self) -> usize {
        self.lock().modes.len()
    }

    pub fn with_mode_mut<R>(
        &self,
        handle: SlotHandle,
        f: impl FnOnce(&mut AggMode) -> R,
    ) -> GroupByResult<R> {
        let mut state = self.lock();
        let mode = state
            .modes
            .get_mut(handle.table_index() as usize)
            .ok_or_else(|| GroupByError::internal("no such mode table"))?;
        Ok(f(mode))
    }
}

impl Drop for QueryMemoryOwner {
    fn drop(&mut self) {
        self.tracker.release(self.consumed.load(Ordering::Relaxed));
    }
}
