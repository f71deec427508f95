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
//! Streaming top-N heap buffers.
//!
//! The buffer holds one fixed-capacity heap per kernel thread: a prefix
//! of per-thread node counts (one u64 each), then `thread_count` heaps
//! of `rows_per_heap` rows. After the kernel finishes, the heaps are
//! merged, the global top `offset + limit` rows extracted, the first
//! `offset` dropped, and the survivors rewritten packed at the start of
//! the buffer.

use super::error::{GroupByError, GroupByResult};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TopNHeapLayout {
    pub row_size: usize,
    /// Heap capacity: sort offset + limit.
    pub rows_per_heap: usize,
    pub thread_count: usize,
}

impl TopNHeapLayout {
    pub fn heap_size(&self) -> u64 {
        heap_size(self.row_size, self.rows_per_heap, self.thread_count)
    }

    /// Byte offset of the first heap row, past the node-count prefix.
    pub fn rows_offset(&self) -> usize {
        self.thread_count * 8
    }

    pub fn total_rows(&self) -> usize {
        self.thread_count * self.rows_per_heap
    }

    fn heap_row_offset(&self, thread: usize, row: usize) -> usize {
        self.rows_offset() + (thread * self.rows_per_heap + row) * self.row_size
    }
}

/// Total heap buffer size: node-count prefix plus the per-thread heaps.
pub fn heap_size(row_size: usize, rows_per_heap: usize, thread_count: usize) -> u64 {
    (thread_count as u64) * 8
        + (thread_count as u64) * (rows_per_heap as u64) * (row_size as u64)
}

/// Zero the node counts and poison the heap rows; row seeding follows
/// at `rows_offset` with `total_rows` effective entries.
pub fn initialize_heap_storage(buf: &mut [u8], layout: &TopNHeapLayout) -> GroupByResult<()> {
    let rows_offset = layout.rows_offset();
    if buf.len() < layout.heap_size() as usize {
        return Err(GroupByError::internal(format!(
            "heap buffer of {} bytes is smaller than layout size {}",
            buf.len(),
            layout.heap_size()
        )));
    }
    buf[..rows_offset].fill(0);
    buf[rows_offset..].fill(0xFF);
    Ok(())
}

/// The single order-by column the heaps are keyed on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TopNSortKey {
    /// Byte offset of the key slot within a row.
    pub col_offset: usize,
    pub width: usize,
    pub descending: bool,
    pub is_float: bool,
}

impl TopNSortKey {
    /// Read the key of one row as a totally ordered integer. Floats map
    /// through the sign-flip trick so integer comparison matches IEEE
    /// order.
    fn sortable_key(&self, row: &[u8]) -> GroupByResult<i64> {
        let bytes = row
            .get(self.col_offset..self.col_offset + self.width)
            .ok_or_else(|| GroupByError::internal("sort key outside row bounds"))?;
        let raw = match self.width {
            1 => bytes[0] as i8 as i64,
            2 => i16::from_ne_bytes(bytes.try_into().unwrap()) as i64,
            4 => i32::from_ne_bytes(bytes.try_into().unwrap()) as i64,
            8 => i64::from_ne_bytes(bytes.try_into().unwrap()),
            w => {
                return Err(GroupByError::internal(format!(
                    "unsupported sort key width {}",
                    w
                )));
            }
        };
        if !self.is_float {
            return Ok(raw);
        }
        let bits = match self.width {
            4 => (raw as i32 as u32 as u64) << 32,
            8 => raw as u64,
            w => {
                return Err(GroupByError::internal(format!(
                    "unsupported float sort key width {}",
                    w
                )));
            }
        };
        // Negative floats reverse bit order; flip accordingly.
        let flipped = if bits & (1 << 63) != 0 {
            !bits
        } else {
            bits | (1 << 63)
        };
        Ok(flipped as i64)
    }
}

/// Merge every thread's heap and return the rows in sort order, best
/// first, truncated to `top_n`.
pub fn merge_heaps(
    buf: &[u8],
    layout: &TopNHeapLayout,
    key: &TopNSortKey,
    top_n: usize,
) -> GroupByResult<Vec<Vec<u8>>> {
    let mut rows: Vec<(i64, Vec<u8>)> = Vec::new();
    for thread in 0..layout.thread_count {
        let count_off = thread * 8;
        let count_bytes = buf
            .get(count_off..count_off + 8)
            .ok_or_else(|| GroupByError::internal("heap node-count prefix out of bounds"))?;
        let node_count = u64::from_ne_bytes(count_bytes.try_into().unwrap()) as usize;
        if node_count > layout.rows_per_heap {
            return Err(GroupByError::internal(format!(
                "heap {} reports {} nodes with capacity {}",
                thread, node_count, layout.rows_per_heap
            )));
        }
        for row_idx in 0..node_count {
            let off = layout.heap_row_offset(thread, row_idx);
            let row = buf
                .get(off..off + layout.row_size)
                .ok_or_else(|| GroupByError::internal("heap row out of bounds"))?;
            rows.push((key.sortable_key(row)?, row.to_vec()));
        }
    }
    if key.descending {
        rows.sort_by(|a, b| b.0.cmp(&a.0));
    } else {
        rows.sort_by(|a, b| a.0.cmp(&b.0));
    }
    rows.truncate(top_n);
    Ok(rows.into_iter().map(|(_, row)| row).collect())
}

/// Merge the heaps, drop the first `offset` rows and pack the remaining
/// `limit` rows at the start of the buffer. Returns the final row count.
pub fn apply_offset(
    buf: &mut [u8],
    layout: &TopNHeapLayout,
    key: &TopNSortKey,
    offset: u64,
    limit: u64,
) -> GroupByResult<usize> {
    let top_n = (offset + limit) as usize;
    let survivors: Vec<Vec<u8>> = merge_heaps(buf, layout, key, top_n)?
        .into_iter()
        .skip(offset as usize)
        .collect();
    for (idx, row) in survivors.iter().enumerate() {
        let off = idx * layout.row_size;
        buf[off..off + layout.row_size].copy_from_slice(row);
    }
    Ok(survivors.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> TopNHeapLayout {
        TopNHeapLayout {
            row_size: 16,
            rows_per_heap: 3,
            thread_count: 2,
        }
    }

    fn push_row(buf: &mut [u8], layout: &TopNHeapLayout, thread: usize, key: i64, payload: i64) {
        let count_off = thread * 8;
        let count =
            u64::from_ne_bytes(buf[count_off..count_off + 8].try_into().unwrap()) as usize;
        let off = layout.heap_row_offset(thread, count);
        buf[off..off + 8].copy_from_slice(&key.to_ne_bytes());
        buf[off + 8..off + 16].copy_from_slice(&payload.to_ne_bytes());
        buf[count_off..count_off + 8].copy_from_slice(&((count as u64) + 1).to_ne_bytes());
    }

    #[test]
    fn heap_size_counts_prefix_and_rows() {
        assert_eq!(heap_size(16, 25, 32), 32 * 8 + 32 * 25 * 16);
        // One row per thread still carries the full prefix.
        assert_eq!(heap_size(8, 1, 4), 4 * 8 + 4 * 8);
    }

    #[test]
    fn initialize_poisons_rows_and_zeroes_counts() {
        let layout = layout();
        let mut buf = vec![0xABu8; layout.heap_size() as usize];
        initialize_heap_storage(&mut buf, &layout).expect("init");
        assert!(buf[..layout.rows_offset()].iter().all(|b| *b == 0));
        assert!(buf[layout.rows_offset()..].iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn merge_orders_rows_across_heaps() {
        let layout = layout();
        let mut buf = vec![0u8; layout.heap_size() as usize];
        push_row(&mut buf, &layout, 0, 30, 100);
        push_row(&mut buf, &layout, 0, 10, 101);
        push_row(&mut buf, &layout, 1, 20, 102);
        let key = TopNSortKey {
            col_offset: 0,
            width: 8,
            descending: true,
            is_float: false,
        };
        let rows = merge_heaps(&buf, &layout, &key, 2).expect("merge");
        assert_eq!(rows.len(), 2);
        let keys: Vec<i64> = rows
            .iter()
            .map(|r| i64::from_ne_bytes(r[..8].try_into().unwrap()))
            .collect();
        assert_eq!(keys, vec![30, 20]);
    }

    #[test]
    fn apply_offset_drops_leading_rows() {
        let layout = layout();
        let mut buf = vec![0u8; layout.heap_size() as usize];
        for (thread, key) in [(0, 5i64), (0, 1), (1, 4), (1, 2), (1, 3)] {
            push_row(&mut buf, &layout, thread, key, key * 10);
        }
        let key = TopNSortKey {
            col_offset: 0,
            width: 8,
            descending: false,
            is_float: false,
        };
        let count = apply_offset(&mut buf, &layout, &key, 1, 3).expect("offset");
        assert_eq!(count, 3);
        let keys: Vec<i64> = (0..count)
            .map(|i| {
                let off = i * layout.row_size;
                i64::from_ne_bytes(buf[off..off + 8].try_into().unwrap())
            })
            .collect();
        assert_eq!(keys, vec![2, 3, 4]);
    }

    #[test]
    fn float_keys_compare_in_ieee_order() {
        let key = TopNSortKey {
            col_offset: 0,
            width: 8,
            descending: false,
            is_float: true,
        };
        let mut rows: Vec<[u8; 8]> = [-2.5f64, 3.0, -0.5, 0.0]
            .iter()
            .map(|v| v.to_bits().to_ne_bytes())
            .collect();
        rows.sort_by_key(|r| key.sortable_key(r).expect("key"));
        let sorted: Vec<f64> = rows
            .iter()
            .map(|r| f64::from_bits(u64::from_ne_bytes(*r)))
            .collect();
        assert_eq!(sorted, vec![-2.5, -0.5, 0.0, 3.0]);
    }
}
