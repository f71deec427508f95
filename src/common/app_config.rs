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
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<EmberConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static EmberConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = EmberConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn init_from_env_or_default() -> Result<&'static EmberConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    let cfg = EmberConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn config() -> Result<&'static EmberConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("EMBERDB_CONFIG") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }

    let candidates = [PathBuf::from("emberdb.toml")];
    for p in candidates {
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "missing config file: set $EMBERDB_CONFIG or create ./emberdb.toml"
    ))
}

#[derive(Clone, Deserialize)]
pub struct EmberConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    /// Example: "emberdb=debug,h2=off"
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub group_by: GroupBySection,
}

impl EmberConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        let cfg: EmberConfig =
            toml::from_str(&s).with_context(|| format!("parse toml: {}", path.display()))?;
        Ok(cfg)
    }
}

impl Default for EmberConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            group_by: GroupBySection::default(),
        }
    }
}

/// Knobs of the group-by aggregation memory layer. Read once at process
/// start; the execution layer consumes an immutable snapshot
/// (`QueryMemoryConfig`) and never touches these globals directly.
#[derive(Clone, Deserialize)]
pub struct GroupBySection {
    #[serde(default = "default_bitmap_memory_limit")]
    pub bitmap_memory_limit: u64,
    #[serde(default = "default_streaming_topn_max")]
    pub streaming_topn_max: u64,
    #[serde(default = "default_enable_smem_group_by")]
    pub enable_smem_group_by: bool,
    #[serde(default)]
    pub enable_columnar_output: bool,
    #[serde(default = "default_enable_lazy_fetch")]
    pub enable_lazy_fetch: bool,
    #[serde(default)]
    pub bigint_count: bool,
    #[serde(default = "default_optimize_row_initialization")]
    pub optimize_row_initialization: bool,
    #[serde(default = "default_max_memory_allocation_size")]
    pub max_memory_allocation_size: u64,
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: u64,
}

fn default_bitmap_memory_limit() -> u64 {
    8 * (1 << 30)
}
fn default_streaming_topn_max() -> u64 {
    100_000
}
fn default_enable_smem_group_by() -> bool {
    true
}
fn default_enable_lazy_fetch() -> bool {
    true
}
fn default_optimize_row_initialization() -> bool {
    true
}
fn default_max_memory_allocation_size() -> u64 {
    2 * (1 << 30)
}

#[cfg(feature = "asan-limits")]
fn default_max_buffer_size() -> u64 {
    1 << 40
}

#[cfg(not(feature = "asan-limits"))]
fn default_max_buffer_size() -> u64 {
    1 << 44
}

impl Default for GroupBySection {
    fn default() -> Self {
        Self {
            bitmap_memory_limit: default_bitmap_memory_limit(),
            streaming_topn_max: default_streaming_topn_max(),
            enable_smem_group_by: default_enable_smem_group_by(),
            enable_columnar_output: false,
            enable_lazy_fetch: default_enable_lazy_fetch(),
            bigint_count: false,
            optimize_row_initialization: default_optimize_row_initialization(),
            max_memory_allocation_size: default_max_memory_allocation_size(),
            max_buffer_size: default_max_buffer_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_by_section_defaults() {
        let cfg: EmberConfig = toml::from_str("").expect("empty config");
        assert_eq!(cfg.group_by.bitmap_memory_limit, 8 * (1 << 30));
        assert_eq!(cfg.group_by.streaming_topn_max, 100_000);
        assert!(cfg.group_by.enable_smem_group_by);
        assert!(!cfg.group_by.bigint_count);
    }

    #[test]
    fn group_by_section_overrides() {
        let cfg: EmberConfig = toml::from_str(
            "[group_by]\nbitmap_memory_limit = 1024\nbigint_count = true\n",
        )
        .expect("config");
        assert_eq!(cfg.group_by.bitmap_memory_limit, 1024);
        assert!(cfg.group_by.bigint_count);
    }
}
