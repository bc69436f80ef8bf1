/*
 * Created on Fri Feb 2 2024
 *
 * This file is a part of Tabletd
 * Tabletd is a free and open-source, horizontally-partitioned columnar
 * storage engine providing snapshot-isolated, replicated tablets for
 * structured data.
 *
 * Copyright (c) 2024, Sayan Nandan <ohsayan@outlook.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

/*
 * The rowset tree and budgeted compaction selection: a "width" cost model
 * (a rowset's key range expressed as a fraction of the tablet's overall
 * keyspace) and a knapsack-style selection that maximizes width-reduction
 * per byte under a fixed budget.
 */

use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Start,
    Stop,
}

#[derive(Debug, Clone)]
pub struct RowSetBounds {
    pub id: u64,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
    pub size_bytes: u64,
}

/// Convert a byte-comparable key into an `f64` position usable for
/// interval-width arithmetic; only the leading bytes matter since this
/// is a monotonic (not exact) embedding used purely for cost estimation,
/// never for correctness-affecting range decisions.
fn key_to_f64(key: &[u8]) -> f64 {
    let mut buf = [0u8; 8];
    let n = key.len().min(8);
    buf[..n].copy_from_slice(&key[..n]);
    u64::from_be_bytes(buf) as f64
}

pub struct RowSetTree {
    entries: Vec<RowSetBounds>,
}

impl RowSetTree {
    pub fn new(entries: Vec<RowSetBounds>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `PointQuery(pk) -> {rs}`.
    pub fn point_query(&self, pk: &[u8]) -> Vec<u64> {
        self.entries
            .iter()
            .filter(|e| e.min_key.as_slice() <= pk && pk <= e.max_key.as_slice())
            .map(|e| e.id)
            .collect()
    }

    /// `RangeQuery([lo, hi)) -> {rs}`.
    pub fn range_query(&self, lo: &[u8], hi: &[u8]) -> Vec<u64> {
        self.entries
            .iter()
            .filter(|e| e.min_key.as_slice() < hi && lo <= e.max_key.as_slice())
            .map(|e| e.id)
            .collect()
    }

    /// `KeyEndpoints()`: every rowset's (START, key) and (STOP, key) pair,
    /// in key order.
    pub fn key_endpoints(&self) -> Vec<(u64, Endpoint, Vec<u8>)> {
        let mut out = Vec::with_capacity(self.entries.len() * 2);
        for e in &self.entries {
            out.push((e.id, Endpoint::Start, e.min_key.clone()));
            out.push((e.id, Endpoint::Stop, e.max_key.clone()));
        }
        out.sort_by(|a, b| a.2.cmp(&b.2));
        out
    }

    fn keyspace_extent(&self) -> Option<(f64, f64)> {
        let min = self.entries.iter().map(|e| key_to_f64(&e.min_key)).fold(f64::MAX, f64::min);
        let max = self.entries.iter().map(|e| key_to_f64(&e.max_key)).fold(f64::MIN, f64::max);
        if self.entries.is_empty() || max < min {
            None
        } else {
            Some((min, max))
        }
    }

    /// Each rowset's normalized width: its key-range span as a fraction of
    /// the tablet's overall keyspace, so that widths sum to (at most) 1
    /// across non-overlapping rowsets.
    fn widths(&self) -> Vec<(u64, f64, u64)> {
        let Some((lo, hi)) = self.keyspace_extent() else {
            return Vec::new();
        };
        let total = (hi - lo).max(1.0);
        self.entries
            .iter()
            .map(|e| {
                let span = (key_to_f64(&e.max_key) - key_to_f64(&e.min_key)).max(0.0);
                (e.id, (span / total).max(0.0), e.size_bytes.max(1))
            })
            .collect()
    }

    /// Budgeted compaction selection: greedily pick rowsets maximizing
    /// width-reduction per byte, subject to `byte_budget`.
    pub fn select_compaction_budgeted(&self, byte_budget: u64) -> Vec<u64> {
        let mut candidates = self.widths();
        // highest width-per-byte first: these are the rowsets buying the
        // most overlap reduction for the least I/O.
        candidates.sort_by(|a, b| {
            let ratio_a = a.1 / a.2 as f64;
            let ratio_b = b.1 / b.2 as f64;
            ratio_b.partial_cmp(&ratio_a).unwrap_or(Ordering::Equal)
        });
        let mut selected = Vec::new();
        let mut spent = 0u64;
        for (id, _width, size) in candidates {
            if spent + size > byte_budget && !selected.is_empty() {
                continue;
            }
            selected.push(id);
            spent += size;
            if spent >= byte_budget {
                break;
            }
        }
        selected
    }

    /// `SplitKeyRange`: walk key endpoints within `[start, stop)` and emit
    /// a chunk boundary every time the accumulated weighted size reaches
    /// `target_chunk_size`. `size_override` optionally scopes the
    /// weighting to a column subset's on-disk size via a per-rowset
    /// override.
    pub fn split_key_range(
        &self,
        start: &[u8],
        stop: &[u8],
        target_chunk_size: u64,
        size_override: impl Fn(u64) -> u64,
    ) -> Vec<Vec<u8>> {
        let mut boundaries = Vec::new();
        let mut acc = 0u64;
        let endpoints = self.key_endpoints();
        let mut active: Vec<u64> = Vec::new();
        let mut last_key: Option<Vec<u8>> = None;

        for (id, kind, key) in endpoints {
            if key.as_slice() < start || key.as_slice() >= stop {
                if kind == Endpoint::Start {
                    active.push(id);
                } else {
                    active.retain(|&x| x != id);
                }
                continue;
            }
            if let Some(prev) = &last_key {
                let per_unit: u64 = active.iter().map(|&id| size_override(id)).sum();
                let width = key_to_f64(&key) - key_to_f64(prev);
                acc += (per_unit as f64 * width.max(0.0) / 1024.0) as u64;
                if acc >= target_chunk_size {
                    boundaries.push(key.clone());
                    acc = 0;
                }
            }
            match kind {
                Endpoint::Start => active.push(id),
                Endpoint::Stop => active.retain(|&x| x != id),
            }
            last_key = Some(key);
        }
        boundaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds(id: u64, min: u64, max: u64, size: u64) -> RowSetBounds {
        RowSetBounds {
            id,
            min_key: min.to_be_bytes().to_vec(),
            max_key: max.to_be_bytes().to_vec(),
            size_bytes: size,
        }
    }

    #[test]
    fn point_query_finds_overlapping_rowsets() {
        let tree = RowSetTree::new(vec![bounds(1, 0, 10, 100), bounds(2, 5, 20, 100)]);
        let mut ids = tree.point_query(&7u64.to_be_bytes());
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn budgeted_selection_stays_within_budget_when_possible() {
        let tree = RowSetTree::new(vec![
            bounds(1, 0, 100, 10),
            bounds(2, 0, 50, 10),
            bounds(3, 0, 10, 10),
        ]);
        let selected = tree.select_compaction_budgeted(20);
        let total: u64 = selected
            .iter()
            .map(|id| tree.entries.iter().find(|e| e.id == *id).unwrap().size_bytes)
            .sum();
        assert!(total <= 20 || selected.len() == 1);
    }

    #[test]
    fn split_key_range_emits_boundaries() {
        let tree = RowSetTree::new(vec![bounds(1, 0, 1000, 1000)]);
        let boundaries = tree.split_key_range(&0u64.to_be_bytes(), &1000u64.to_be_bytes(), 1, |_| 1);
        assert!(!boundaries.is_empty());
    }
}
