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
//! Device kinds and the allocation seam the query memory initializer
//! drives.
//!
//! GPU memory is modeled as a separate address space: a `DeviceBuffer`
//! tagged `Gpu` is only reachable through explicit `copy_from_host` /
//! `copy_to_host` calls, which is the same discipline a real driver
//! allocation imposes. Kernel launching is outside this layer.

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

/// How kernels are dispatched over input fragments. Affects per-fragment
/// buffer sizing in the initializer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum KernelDispatchMode {
    KernelPerFragment,
    MultifragmentKernel,
}

/// GPU launch geometry. CPU execution uses a single implicit "block".
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LaunchParams {
    pub block_size: usize,
    pub grid_size: usize,
    /// When blocks aggregate into shared memory, one buffer per block
    /// instead of one per block x grid.
    pub blocks_share_memory: bool,
}

impl Default for LaunchParams {
    fn default() -> Self {
        Self {
            block_size: 1,
            grid_size: 1,
            blocks_share_memory: false,
        }
    }
}

/// Raised when an allocation exceeds the allocator's per-allocation or
/// total capacity. Carries the requested byte count for error reporting.
#[derive(Debug, Clone, Copy)]
pub struct DeviceAllocError {
    pub requested: usize,
    pub limit: usize,
}

/// One allocation on a device. `Gpu` buffers must be staged through the
/// explicit host copy calls; reading device bytes directly is a layering
/// violation in the real engine and is kept private here.
#[derive(Debug)]
pub struct DeviceBuffer {
    device: DeviceKind,
    bytes: Vec<u8>,
    /// Pool usage counter of the owning allocator; the allocation is
    /// returned to the pool when the buffer drops.
    pool: Option<Arc<AtomicUsize>>,
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if let Some(pool) = &self.pool {
            pool.fetch_sub(self.bytes.len(), Ordering::Relaxed);
        }
    }
}

impl DeviceBuffer {
    pub fn device(&self) -> DeviceKind {
        self.device
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn copy_from_host(&mut self, offset: usize, src: &[u8]) -> Result<(), String> {
        let end = offset
            .checked_add(src.len())
            .ok_or_else(|| "device copy range overflow".to_string())?;
        let dst = self
            .bytes
            .get_mut(offset..end)
            .ok_or_else(|| format!("device copy out of range: {}..{}", offset, end))?;
        dst.copy_from_slice(src);
        Ok(())
    }

    pub fn copy_to_host(&self, offset: usize, dst: &mut [u8]) -> Result<(), String> {
        let end = offset
            .checked_add(dst.len())
            .ok_or_else(|| "device copy range overflow".to_string())?;
        let src = self
            .bytes
            .get(offset..end)
            .ok_or_else(|| format!("device copy out of range: {}..{}", offset, end))?;
        dst.copy_from_slice(src);
        Ok(())
    }

    pub fn fill(&mut self, value: u8) {
        self.bytes.fill(value);
    }
}

pub trait DeviceAllocator: Send + Sync {
    fn device(&self) -> DeviceKind;

    /// Largest single allocation this device accepts.
    fn max_allocation_size(&self) -> usize;

    fn alloc_zeroed(&self, bytes: usize) -> Result<DeviceBuffer, DeviceAllocError>;
}

/// Device allocator with a per-allocation slab limit and a finite total
/// capacity, mirroring a driver-managed memory pool.
pub struct GpuAllocator {
    device_id: u32,
    max_slab_size: usize,
    capacity: usize,
    /// Shared with every live buffer so drops return capacity.
    in_use: Arc<AtomicUsize>,
    // Serializes reservation checks against concurrent allocs.
    reserve: Mutex<()>,
}

impl GpuAllocator {
    pub fn new(device_id: u32, max_slab_size: usize, capacity: usize) -> Self {
        Self {
            device_id,
            max_slab_size,
            capacity,
            in_use: Arc::new(AtomicUsize::new(0)),
            reserve: Mutex::new(()),
        }
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }
}

impl DeviceAllocator for GpuAllocator {
    fn device(&self) -> DeviceKind {
        DeviceKind::Gpu
    }

    fn max_allocation_size(&self) -> usize {
        self.max_slab_size
    }

    fn alloc_zeroed(&self, bytes: usize) -> Result<DeviceBuffer, DeviceAllocError> {
        if bytes > self.max_slab_size {
            return Err(DeviceAllocError {
                requested: bytes,
                limit: self.max_slab_size,
            });
        }
        let _guard = self.reserve.lock().unwrap_or_else(|e| e.into_inner());
        let used = self.in_use.load(Ordering::Relaxed);
        if used.saturating_add(bytes) > self.capacity {
            return Err(DeviceAllocError {
                requested: bytes,
                limit: self.capacity - used.min(self.capacity),
            });
        }
        self.in_use.fetch_add(bytes, Ordering::Relaxed);
        Ok(DeviceBuffer {
            device: DeviceKind::Gpu,
            bytes: vec![0u8; bytes],
            pool: Some(Arc::clone(&self.in_use)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_allocator_enforces_slab_limit() {
        let alloc = GpuAllocator::new(0, 1024, 4096);
        assert!(alloc.alloc_zeroed(1024).is_ok());
        let err = alloc.alloc_zeroed(1025).expect_err("over slab limit");
        assert_eq!(err.requested, 1025);
    }

    #[test]
    fn gpu_allocator_enforces_capacity() {
        let alloc = GpuAllocator::new(0, 1024, 2048);
        let _a = alloc.alloc_zeroed(1024).expect("first");
        let _b = alloc.alloc_zeroed(1024).expect("second");
        assert!(alloc.alloc_zeroed(1).is_err());
    }

    #[test]
    fn dropped_buffers_return_capacity_to_the_pool() {
        let alloc = GpuAllocator::new(0, 2048, 2048);
        let full = alloc.alloc_zeroed(2048).expect("at capacity");
        assert_eq!(alloc.in_use(), 2048);
        assert!(alloc.alloc_zeroed(1).is_err());
        drop(full);
        assert_eq!(alloc.in_use(), 0);
        let _again = alloc.alloc_zeroed(2048).expect("reclaimed");
    }

    #[test]
    fn device_buffer_round_trips_host_bytes() {
        let alloc = GpuAllocator::new(0, 1 << 20, 1 << 20);
        let mut buf = alloc.alloc_zeroed(8).expect("alloc");
        buf.copy_from_host(0, &[1, 2, 3, 4, 5, 6, 7, 8]).expect("in");
        let mut out = [0u8; 8];
        buf.copy_to_host(0, &mut out).expect("out");
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);
    }
}
