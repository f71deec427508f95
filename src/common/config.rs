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
use crate::emberdb_config::config as emberdb_app_config;

pub(crate) fn bitmap_memory_limit() -> u64 {
    emberdb_app_config()
        .ok()
        .map(|c| c.group_by.bitmap_memory_limit)
        .unwrap_or(8 * (1 << 30))
}

pub(crate) fn streaming_topn_max() -> u64 {
    emberdb_app_config()
        .ok()
        .map(|c| c.group_by.streaming_topn_max)
        .unwrap_or(100_000)
}

pub(crate) fn enable_smem_group_by() -> bool {
    emberdb_app_config()
        .ok()
        .map(|c| c.group_by.enable_smem_group_by)
        .unwrap_or(true)
}

pub(crate) fn enable_columnar_output() -> bool {
    emberdb_app_config()
        .ok()
        .map(|c| c.group_by.enable_columnar_output)
        .unwrap_or(false)
}

pub(crate) fn enable_lazy_fetch() -> bool {
    emberdb_app_config()
        .ok()
        .map(|c| c.group_by.enable_lazy_fetch)
        .unwrap_or(true)
}

pub(crate) fn bigint_count() -> bool {
    emberdb_app_config()
        .ok()
        .map(|c| c.group_by.bigint_count)
        .unwrap_or(false)
}

pub(crate) fn optimize_row_initialization() -> bool {
    emberdb_app_config()
        .ok()
        .map(|c| c.group_by.optimize_row_initialization)
        .unwrap_or(true)
}

pub(crate) fn max_memory_allocation_size() -> u64 {
    emberdb_app_config()
        .ok()
        .map(|c| c.group_by.max_memory_allocation_size)
        .unwrap_or(2 * (1 << 30))
}

pub(crate) fn max_buffer_size() -> u64 {
    emberdb_app_config()
        .ok()
        .map(|c| c.group_by.max_buffer_size)
        .unwrap_or(1 << 44)
}
