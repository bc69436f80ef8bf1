/*
 * Created on Mon Jan 29 2024
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
 * The in-memory delta store for one rowset's uncommitted/unflushed
 * updates and deletes. Concurrency story mirrors `rowset::mem::MemRowSet`:
 * a `crossbeam_skiplist::SkipMap` ordered map, with a short coarse lock
 * around the disambiguator-retry loop.
 */

use {
    crate::{
        error::RuntimeResult,
        mvcc::Snapshot,
        schema::Value,
        timestamp::Timestamp,
    },
    crossbeam_skiplist::SkipMap,
    parking_lot::Mutex,
    std::collections::HashMap,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeltaKey {
    pub row_idx: u64,
    pub timestamp: u64,
    pub disambiguator: u32,
}

#[derive(Debug, Clone)]
pub enum DeltaChange {
    Update(Vec<(usize, Value)>),
    Delete,
}

/// Running statistics captured during `flush_to_redo_records`: min/max
/// timestamp and per-column update counters.
#[derive(Debug, Clone, Default)]
pub struct DeltaStats {
    pub min_timestamp: Option<Timestamp>,
    pub max_timestamp: Option<Timestamp>,
    pub update_counts_by_column: HashMap<usize, u64>,
    pub delete_count: u64,
}

impl DeltaStats {
    fn observe(&mut self, ts: Timestamp, change: &DeltaChange) {
        self.min_timestamp = Some(self.min_timestamp.map_or(ts, |m| m.min(ts)));
        self.max_timestamp = Some(self.max_timestamp.map_or(ts, |m| m.max(ts)));
        match change {
            DeltaChange::Update(cols) => {
                for (idx, _) in cols {
                    *self.update_counts_by_column.entry(*idx).or_default() += 1;
                }
            }
            DeltaChange::Delete => self.delete_count += 1,
        }
    }
}

pub struct DeltaMemStore {
    deltas: SkipMap<DeltaKey, DeltaChange>,
    update_lock: Mutex<()>,
    min_anchor_op_id: Mutex<Option<u64>>,
}

impl Default for DeltaMemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DeltaMemStore {
    pub fn new() -> Self {
        Self {
            deltas: SkipMap::new(),
            update_lock: Mutex::new(()),
            min_anchor_op_id: Mutex::new(None),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    /// `Update(ts, row_idx, change, op_id)`. On a `(row_idx, ts)`
    /// collision, retries with a monotonically increasing disambiguator.
    pub fn update(&self, ts: Timestamp, row_idx: u64, change: DeltaChange, op_id: u64) -> RuntimeResult<()> {
        let _guard = self.update_lock.lock();
        let mut disambiguator = 0u32;
        loop {
            let key = DeltaKey {
                row_idx,
                timestamp: ts.value(),
                disambiguator,
            };
            if self.deltas.get(&key).is_none() {
                self.deltas.insert(key, change);
                break;
            }
            disambiguator += 1;
        }
        let mut anchor = self.min_anchor_op_id.lock();
        *anchor = Some(anchor.map_or(op_id, |m| m.min(op_id)));
        Ok(())
    }

    pub fn min_anchored_op_id(&self) -> Option<u64> {
        *self.min_anchor_op_id.lock()
    }

    /// `PrepareBatch(n_rows)`: every delta touching `[row_start, row_start
    /// + n_rows)`, in `(row_idx, timestamp, disambiguator)` order.
    pub fn prepare_batch(&self, row_start: u64, n_rows: u64) -> Vec<(DeltaKey, DeltaChange)> {
        let lo = DeltaKey {
            row_idx: row_start,
            timestamp: 0,
            disambiguator: 0,
        };
        let hi = DeltaKey {
            row_idx: row_start + n_rows,
            timestamp: 0,
            disambiguator: 0,
        };
        self.deltas
            .range(lo..hi)
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    /// Emit one REDO record per delta, in order, and return the
    /// accumulated stats.
    pub fn flush_to_redo_records(&self) -> (Vec<(DeltaKey, DeltaChange)>, DeltaStats) {
        let mut stats = DeltaStats::default();
        let mut records = Vec::with_capacity(self.deltas.len());
        for entry in self.deltas.iter() {
            let key = *entry.key();
            let change = entry.value().clone();
            stats.observe(Timestamp::new(key.timestamp), &change);
            records.push((key, change));
        }
        (records, stats)
    }
}

/// Apply a prepared batch's per-column updates to `dst` (one slot per row
/// in `[row_start, row_start + dst.len())`), oldest committed update
/// first so the newest committed one wins.
pub fn apply_updates(
    prepared: &[(DeltaKey, DeltaChange)],
    row_start: u64,
    col_idx: usize,
    snapshot: &Snapshot,
    dst: &mut [Option<Value>],
) {
    for (key, change) in prepared {
        if !snapshot.is_committed(Timestamp::new(key.timestamp)) {
            continue;
        }
        if let DeltaChange::Update(cols) = change {
            for (idx, val) in cols {
                if *idx == col_idx {
                    let row_offset = (key.row_idx - row_start) as usize;
                    if let Some(slot) = dst.get_mut(row_offset) {
                        *slot = Some(val.clone());
                    }
                }
            }
        }
    }
}

/// Clear selection bits for rows deleted as of `snapshot`.
pub fn apply_deletes(prepared: &[(DeltaKey, DeltaChange)], row_start: u64, snapshot: &Snapshot, sel: &mut [bool]) {
    for (key, change) in prepared {
        if !snapshot.is_committed(Timestamp::new(key.timestamp)) {
            continue;
        }
        if matches!(change, DeltaChange::Delete) {
            let row_offset = (key.row_idx - row_start) as usize;
            if let Some(bit) = sel.get_mut(row_offset) {
                *bit = false;
            }
        }
    }
}

/// Composes several prepared batches (one per delta file plus the live
/// DMS for a DRS) into a single newest-wins application order, while
/// preserving each row's own chronological timestamp order.
pub struct DeltaIteratorMerger;

impl DeltaIteratorMerger {
    pub fn merge(sources: Vec<Vec<(DeltaKey, DeltaChange)>>) -> Vec<(DeltaKey, DeltaChange)> {
        let mut merged: Vec<(DeltaKey, DeltaChange)> = sources.into_iter().flatten().collect();
        merged.sort_by_key(|(k, _)| *k);
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disambiguator_resolves_same_row_same_timestamp_collisions() {
        let dms = DeltaMemStore::new();
        dms.update(Timestamp::new(5), 1, DeltaChange::Update(vec![(0, Value::U64(1))]), 10)
            .unwrap();
        dms.update(Timestamp::new(5), 1, DeltaChange::Update(vec![(0, Value::U64(2))]), 11)
            .unwrap();
        assert_eq!(dms.len(), 2);
    }

    #[test]
    fn apply_updates_respects_snapshot_and_newest_wins() {
        let dms = DeltaMemStore::new();
        dms.update(Timestamp::new(3), 0, DeltaChange::Update(vec![(1, Value::U64(300))]), 1)
            .unwrap();
        dms.update(Timestamp::new(5), 0, DeltaChange::Update(vec![(1, Value::U64(500))]), 2)
            .unwrap();
        let prepared = dms.prepare_batch(0, 1);

        let mut dst = vec![None];
        let snap4 = {
            let mut s = Snapshot::at(Timestamp::new(4));
            s.widen_with([Timestamp::new(3)]);
            s
        };
        apply_updates(&prepared, 0, 1, &snap4, &mut dst);
        assert_eq!(dst[0], Some(Value::U64(300)));

        let mut dst = vec![None];
        let snap6 = {
            let mut s = Snapshot::at(Timestamp::new(6));
            s.widen_with([Timestamp::new(3), Timestamp::new(5)]);
            s
        };
        apply_updates(&prepared, 0, 1, &snap6, &mut dst);
        assert_eq!(dst[0], Some(Value::U64(500)));
    }

    #[test]
    fn merger_orders_by_row_then_timestamp() {
        let a = vec![(
            DeltaKey {
                row_idx: 1,
                timestamp: 5,
                disambiguator: 0,
            },
            DeltaChange::Delete,
        )];
        let b = vec![(
            DeltaKey {
                row_idx: 1,
                timestamp: 3,
                disambiguator: 0,
            },
            DeltaChange::Update(vec![(0, Value::U64(1))]),
        )];
        let merged = DeltaIteratorMerger::merge(vec![a, b]);
        assert_eq!(merged[0].0.timestamp, 3);
        assert_eq!(merged[1].0.timestamp, 5);
    }
}
