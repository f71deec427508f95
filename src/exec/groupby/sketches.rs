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
//! CPU-side auxiliary aggregate states referenced by slot handles:
//! the T-Digest quantile sketch and the MODE hash table.

use hashbrown::HashMap;

use super::descriptors::ApproxQuantileDescriptor;

#[derive(Copy, Clone, Debug, PartialEq)]
struct Centroid {
    mean: f64,
    weight: f64,
}

/// Quantile sketch with a bounded ingest buffer and a bounded centroid
/// list. Values accumulate in the buffer and are folded into centroids
/// when it fills.
#[derive(Clone, Debug)]
pub struct TDigest {
    quantile: f64,
    buffer_size: usize,
    centroids_size: usize,
    buffer: Vec<f64>,
    centroids: Vec<Centroid>,
}

impl TDigest {
    pub fn new(descriptor: ApproxQuantileDescriptor, quantile: f64) -> Self {
        Self {
            quantile,
            buffer_size: descriptor.buffer_size.max(1),
            centroids_size: descriptor.centroids_size.max(1),
            buffer: Vec::new(),
            centroids: Vec::new(),
        }
    }

    pub fn quantile_param(&self) -> f64 {
        self.quantile
    }

    pub fn add(&mut self, value: f64) {
        if value.is_nan() {
            return;
        }
        self.buffer.push(value);
        if self.buffer.len() >= self.buffer_size {
            self.compress();
        }
    }

    pub fn merge(&mut self, other: &TDigest) {
        for c in &other.centroids {
            self.centroids.push(*c);
        }
        for v in &other.buffer {
            self.buffer.push(*v);
        }
        self.compress();
    }

    pub fn total_weight(&self) -> f64 {
        self.centroids.iter().map(|c| c.weight).sum::<f64>() + self.buffer.len() as f64
    }

    /// Estimate the configured quantile. None when no values were added.
    pub fn quantile(&mut self) -> Option<f64> {
        self.compress();
        if self.centroids.is_empty() {
            return None;
        }
        let total: f64 = self.centroids.iter().map(|c| c.weight).sum();
        let rank = self.quantile.clamp(0.0, 1.0) * total;
        let mut seen = 0.0;
        for c in &self.centroids {
            seen += c.weight;
            if seen >= rank {
                return Some(c.mean);
            }
        }
        self.centroids.last().map(|c| c.mean)
    }

    fn compress(&mut self) {
        if self.buffer.is_empty() && self.centroids.len() <= self.centroids_size {
            return;
        }
        let mut points: Vec<Centroid> = self
            .centroids
            .drain(..)
            .chain(self.buffer.drain(..).map(|v| Centroid {
                mean: v,
                weight: 1.0,
            }))
            .collect();
        points.sort_by(|a, b| a.mean.total_cmp(&b.mean));

        let total: f64 = points.iter().map(|c| c.weight).sum();
        if total == 0.0 {
            return;
        }
        let per_centroid = total / self.centroids_size as f64;
        let mut acc = Centroid {
            mean: 0.0,
            weight: 0.0,
        };
        for point in points {
            if acc.weight + point.weight > per_centroid && acc.weight > 0.0 {
                self.centroids.push(acc);
                acc = Centroid {
                    mean: 0.0,
                    weight: 0.0,
                };
            }
            let w = acc.weight + point.weight;
            acc.mean = (acc.mean * acc.weight + point.mean * point.weight) / w;
            acc.weight = w;
        }
        if acc.weight > 0.0 {
            self.centroids.push(acc);
        }
    }
}

/// Per-entry hash table backing the MODE aggregate.
#[derive(Clone, Debug, Default)]
pub struct AggMode {
    counts: HashMap<i64, u64>,
}

impl AggMode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: i64) {
        self.add_count(value, 1);
    }

    pub fn add_count(&mut self, value: i64, count: u64) {
        *self.counts.entry(value).or_insert(0) += count;
    }

    pub fn merge(&mut self, other: &AggMode) {
        for (value, count) in &other.counts {
            *self.counts.entry(*value).or_insert(0) += count;
        }
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Most frequent value; ties resolve to the smaller value so results
    /// are deterministic across runs.
    pub fn mode(&self) -> Option<i64> {
        self.counts
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(value, _)| *value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> ApproxQuantileDescriptor {
        ApproxQuantileDescriptor {
            buffer_size: 16,
            centroids_size: 8,
        }
    }

    #[test]
    fn median_of_uniform_values() {
        let mut digest = TDigest::new(descriptor(), 0.5);
        for v in 1..=100 {
            digest.add(v as f64);
        }
        let q = digest.quantile().expect("quantile");
        assert!((q - 50.0).abs() < 10.0, "median estimate {q}");
    }

    #[test]
    fn empty_digest_has_no_quantile() {
        let mut digest = TDigest::new(descriptor(), 0.5);
        assert_eq!(digest.quantile(), None);
    }

    #[test]
    fn merge_combines_weights() {
        let mut a = TDigest::new(descriptor(), 0.5);
        let mut b = TDigest::new(descriptor(), 0.5);
        for v in 0..10 {
            a.add(v as f64);
            b.add(v as f64);
        }
        a.merge(&b);
        assert_eq!(a.total_weight(), 20.0);
    }

    #[test]
    fn mode_prefers_highest_count_then_smaller_value() {
        let mut mode = AggMode::new();
        for v in [3, 3, 7, 7, 1] {
            mode.add(v);
        }
        assert_eq!(mode.mode(), Some(3));
        mode.add(7);
        assert_eq!(mode.mode(), Some(7));
    }

    #[test]
    fn mode_merge_accumulates() {
        let mut a = AggMode::new();
        a.add(5);
        let mut b = AggMode::new();
        b.add(5);
        b.add(9);
        a.merge(&b);
        assert_eq!(a.mode(), Some(5));
        assert_eq!(a.len(), 2);
    }
}
