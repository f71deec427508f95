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
//! emberdb: group-by aggregation memory layer of a GPU-accelerated
//! analytical database.
//!
//! The layer has two halves. `QueryMemoryDescriptor` plans the in-memory
//! layout of aggregation result buffers for one execution kernel: bytes
//! per entry, slot packing, row- vs column-major placement, keyless-hash
//! and streaming-top-N arrangements. `QueryMemoryInitializer` allocates
//! those buffers on a device, reserves count-distinct / quantile / mode
//! auxiliary memory, seeds every entry with its per-slot initial value,
//! and runs the post-kernel compaction and copy-back paths.

pub mod common;
pub mod exec;
pub mod runtime;

pub use common::app_config as emberdb_config;
pub use common::logging as emberdb_logging;
pub use exec::groupby::error::{GroupByError, GroupByResult};
pub use exec::groupby::query_memory_descriptor::QueryMemoryDescriptor;
pub use exec::groupby::query_memory_initializer::QueryMemoryInitializer;
pub use exec::groupby::result_set::ResultSet;
pub use exec::groupby::QueryMemoryConfig;
pub use runtime::device::DeviceKind;
pub use runtime::memory_owner::QueryMemoryOwner;
