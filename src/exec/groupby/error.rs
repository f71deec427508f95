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
use std::error::Error;
use std::fmt;

/// Errors surfaced by the group-by memory layer.
///
/// `StreamingTopNOversizedHeap` is catchable by the scheduler, which falls
/// back to a non-streaming sort. `QueryMustRunOnCpu` is caught by the
/// dispatcher, which re-plans the query on CPU. Everything else aborts the
/// query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupByError {
    /// A host allocation (bitmap totals, projection buffer, template
    /// buffer) exceeds a configured limit. Carries the requested bytes.
    OutOfHostMemory { bytes: u64 },
    /// The streaming top-N heap exceeds the device per-slab limit.
    StreamingTopNOversizedHeap { bytes: u64 },
    /// A GPU-only precondition failed; the caller retries on CPU.
    QueryMustRunOnCpu,
    /// Descriptor and caller target list disagree on slot layout.
    SchemaMismatch(String),
    /// Internal invariant violation. Fatal for the query.
    Internal(String),
}

pub type GroupByResult<T> = Result<T, GroupByError>;

impl GroupByError {
    pub fn internal(msg: impl Into<String>) -> Self {
        GroupByError::Internal(msg.into())
    }

    /// Stable taxonomy tag reported to users for non-OOM errors.
    pub fn taxonomy_tag(&self) -> &'static str {
        match self {
            GroupByError::OutOfHostMemory { .. } => "OUT_OF_HOST_MEMORY",
            GroupByError::StreamingTopNOversizedHeap { .. } => "STREAMING_TOPN_OVERSIZED_HEAP",
            GroupByError::QueryMustRunOnCpu => "QUERY_MUST_RUN_ON_CPU",
            GroupByError::SchemaMismatch(_) => "SCHEMA_MISMATCH",
            GroupByError::Internal(_) => "INTERNAL",
        }
    }
}

impl fmt::Display for GroupByError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupByError::OutOfHostMemory { bytes } => {
                write!(f, "out of host memory: requested {} bytes", bytes)
            }
            GroupByError::StreamingTopNOversizedHeap { bytes } => {
                write!(f, "streaming top-n heap too large: {} bytes", bytes)
            }
            GroupByError::QueryMustRunOnCpu => write!(f, "query must run on CPU"),
            GroupByError::SchemaMismatch(msg) => write!(f, "schema mismatch: {}", msg),
            GroupByError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl Error for GroupByError {}

impl From<String> for GroupByError {
    fn from(msg: String) -> Self {
        GroupByError::Internal(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oom_reports_requested_bytes() {
        let err = GroupByError::OutOfHostMemory { bytes: 1 << 33 };
        assert!(err.to_string().contains("8589934592"));
        assert_eq!(err.taxonomy_tag(), "OUT_OF_HOST_MEMORY");
    }
}
