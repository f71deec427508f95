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
//! Group-by aggregation memory layer.
//!
//! Responsibilities:
//! - Plans result-buffer layout per execution kernel (`QueryMemoryDescriptor`).
//! - Allocates and seeds result buffers per worker/device (`QueryMemoryInitializer`).
//! - Exposes the seeded buffers through `ResultSet` readers.
//!
//! Key exported interfaces:
//! - Types: `QueryMemoryConfig`, `QueryMemoryDescriptor`,
//!   `QueryMemoryInitializer`, `ResultSet`, `SlotContext`.
//!
//! Current limitations:
//! - Kernel execution itself (the aggregation hot loop) is an external
//!   collaborator; this layer only defines the buffer contract it runs
//!   against.

pub mod descriptors;
pub mod error;
pub mod exec_unit;
pub mod query_memory_descriptor;
pub mod query_memory_initializer;
pub mod result_set;
pub mod sketches;
pub mod slot_context;
pub mod streaming_topn;
pub mod target_info;

use crate::common::config;

/// Immutable snapshot of the process-wide group-by knobs, captured once
/// and passed by reference into descriptor derivation and initializer
/// construction. The execution layer never reads mutable globals.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryMemoryConfig {
    pub bitmap_memory_limit: u64,
    pub streaming_topn_max: u64,
    pub enable_smem_group_by: bool,
    pub enable_columnar_output: bool,
    pub enable_lazy_fetch: bool,
    pub bigint_count: bool,
    pub optimize_row_initialization: bool,
    pub max_memory_allocation_size: u64,
    pub max_buffer_size: u64,
}

impl Default for QueryMemoryConfig {
    fn default() -> Self {
        Self {
            bitmap_memory_limit: 8 * (1 << 30),
            streaming_topn_max: 100_000,
            enable_smem_group_by: true,
            enable_columnar_output: false,
            enable_lazy_fetch: true,
            bigint_count: false,
            optimize_row_initialization: true,
            max_memory_allocation_size: 2 * (1 << 30),
            max_buffer_size: 1 << 44,
        }
    }
}

impl QueryMemoryConfig {
    /// Snapshot the process configuration (`emberdb.toml` / defaults).
    pub fn from_app_config() -> Self {
        Self {
            bitmap_memory_limit: config::bitmap_memory_limit(),
            streaming_topn_max: config::streaming_topn_max(),
            enable_smem_group_by: config::enable_smem_group_by(),
            enable_columnar_output: config::enable_columnar_output(),
            enable_lazy_fetch: config::enable_lazy_fetch(),
            bigint_count: config::bigint_count(),
            optimize_row_initialization: config::optimize_row_initialization(),
            max_memory_allocation_size: config::max_memory_allocation_size(),
            max_buffer_size: config::max_buffer_size(),
        }
    }
}
