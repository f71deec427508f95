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
//! Per-target descriptors for count-distinct and approximate-quantile
//! implementations, indexed by target position.

use crate::runtime::device::DeviceKind;

use super::exec_unit::RelAlgExecutionUnit;
use super::target_info::{AggKind, TargetInfo, byte_width};

/// How one COUNT(DISTINCT ...) / APPROX_COUNT_DISTINCT target is backed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CountDistinctImpl {
    /// Not a distinct-count target.
    Invalid,
    /// Dense bitmap of a known padded byte size.
    Bitmap { padded_bytes: usize },
    /// Exact distinct set for unbounded domains.
    UnorderedSet,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CountDistinctDescriptor {
    pub impl_type: CountDistinctImpl,
    pub device: DeviceKind,
    /// Domain minimum subtracted before bitmap indexing.
    pub min_val: i64,
}

impl CountDistinctDescriptor {
    pub fn invalid() -> Self {
        Self {
            impl_type: CountDistinctImpl::Invalid,
            device: DeviceKind::Cpu,
            min_val: 0,
        }
    }

    pub fn bitmap_bytes(&self) -> usize {
        match self.impl_type {
            CountDistinctImpl::Bitmap { padded_bytes } => padded_bytes,
            _ => 0,
        }
    }

    pub fn is_bitmap(&self) -> bool {
        matches!(self.impl_type, CountDistinctImpl::Bitmap { .. })
    }
}

pub type CountDistinctDescriptors = Vec<CountDistinctDescriptor>;

/// Derive one descriptor per target. A bitmap is used when the argument
/// domain has a usable range; otherwise an unordered set. Approximate
/// distinct counts always take a fixed-size bitmap sketch.
pub fn derive_count_distinct_descriptors(
    ra_exe_unit: &RelAlgExecutionUnit,
    device: DeviceKind,
) -> CountDistinctDescriptors {
    ra_exe_unit
        .targets
        .iter()
        .map(|target| derive_one(target, device))
        .collect()
}

const APPROX_DISTINCT_BITMAP_BYTES: usize = 1 << 11;

fn derive_one(target: &TargetInfo, device: DeviceKind) -> CountDistinctDescriptor {
    if !target.is_count_distinct() {
        return CountDistinctDescriptor::invalid();
    }
    if target.is_approx {
        return CountDistinctDescriptor {
            impl_type: CountDistinctImpl::Bitmap {
                padded_bytes: APPROX_DISTINCT_BITMAP_BYTES,
            },
            device,
            min_val: 0,
        };
    }
    // Narrow integer domains get a dense bitmap over the full type range;
    // everything else falls back to an exact set.
    let arg_width = target.arg_type.as_ref().map(byte_width).unwrap_or(0);
    match arg_width {
        1 | 2 | 4 => {
            let bits = 1u64 << (arg_width as u64 * 8);
            CountDistinctDescriptor {
                impl_type: CountDistinctImpl::Bitmap {
                    padded_bytes: (bits / 8) as usize,
                },
                device,
                min_val: match arg_width {
                    1 => i8::MIN as i64,
                    2 => i16::MIN as i64,
                    _ => i32::MIN as i64,
                },
            }
        }
        _ => CountDistinctDescriptor {
            impl_type: CountDistinctImpl::UnorderedSet,
            device,
            min_val: 0,
        },
    }
}

/// Total host bytes all bitmap descriptors would occupy for one buffer.
pub fn total_bitmap_bytes(descriptors: &CountDistinctDescriptors, entry_count: usize) -> u64 {
    descriptors
        .iter()
        .map(|d| d.bitmap_bytes() as u64)
        .sum::<u64>()
        .saturating_mul(entry_count as u64)
}

/// Sizing parameters of one T-Digest instance.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ApproxQuantileDescriptor {
    pub buffer_size: usize,
    pub centroids_size: usize,
}

impl ApproxQuantileDescriptor {
    /// Host bytes one digest reserves: f64 buffer plus (mean, weight)
    /// centroid pairs.
    pub fn nbytes(&self) -> usize {
        self.buffer_size * 8 + self.centroids_size * 16
    }
}

pub const DEFAULT_QUANTILE_BUFFER_SIZE: usize = 1024;
pub const DEFAULT_QUANTILE_CENTROIDS_SIZE: usize = 256;

/// One optional descriptor per target, `Some` for APPROX_QUANTILE.
pub fn derive_approx_quantile_descriptors(
    ra_exe_unit: &RelAlgExecutionUnit,
) -> Vec<Option<ApproxQuantileDescriptor>> {
    ra_exe_unit
        .targets
        .iter()
        .map(|target| {
            target.is_quantile().then_some(ApproxQuantileDescriptor {
                buffer_size: DEFAULT_QUANTILE_BUFFER_SIZE,
                centroids_size: DEFAULT_QUANTILE_CENTROIDS_SIZE,
            })
        })
        .collect()
}

pub fn count_mode_targets(ra_exe_unit: &RelAlgExecutionUnit) -> usize {
    ra_exe_unit
        .targets
        .iter()
        .filter(|t| matches!(t.agg, Some(AggKind::Mode)))
        .count()
}
