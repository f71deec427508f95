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
//! Common utilities and helpers for integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use emberdb::common::types::UniqueId;
use emberdb::exec::groupby::QueryMemoryConfig;
use emberdb::exec::groupby::exec_unit::{ColRange, RelAlgExecutionUnit, TableStats};
use emberdb::exec::groupby::query_memory_descriptor::{
    DescriptorOptions, QueryMemoryDescriptor,
};
use emberdb::runtime::mem_tracker::MemTracker;
use emberdb::runtime::memory_owner::QueryMemoryOwner;

/// Root tracker plus a per-query memory owner hanging off it.
pub fn test_owner() -> (Arc<MemTracker>, Arc<QueryMemoryOwner>) {
    let root = MemTracker::new_root("integration-test");
    let owner = QueryMemoryOwner::new(UniqueId { hi: 42, lo: 1 }, &root);
    (root, owner)
}

/// Unbucketed integer range without nulls.
pub fn int_range(min: i64, max: i64) -> ColRange {
    ColRange {
        min,
        max,
        bucket: 0,
        has_nulls: false,
    }
}

pub fn derive(
    ra_exe_unit: &RelAlgExecutionUnit,
    options: &DescriptorOptions,
) -> Arc<QueryMemoryDescriptor> {
    derive_with_config(ra_exe_unit, options, &QueryMemoryConfig::default())
}

pub fn derive_with_config(
    ra_exe_unit: &RelAlgExecutionUnit,
    options: &DescriptorOptions,
    config: &QueryMemoryConfig,
) -> Arc<QueryMemoryDescriptor> {
    Arc::new(
        QueryMemoryDescriptor::derive(
            ra_exe_unit,
            &TableStats::with_total(10_000),
            config,
            options,
        )
        .expect("descriptor derivation"),
    )
}
