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
 * A concurrent ordered map from encoded PK to a row header carrying a
 * mutation chain: prepared-mutation insert, REINSERT-over-ghost, and
 * chain-walk projection at scan time.
 */

use {
    crate::{
        error::{Error, ErrorKind, RuntimeResult},
        mvcc::Snapshot,
        schema::{Row, Schema, Value},
        timestamp::Timestamp,
    },
    crossbeam_skiplist::SkipMap,
    parking_lot::{Mutex, RwLock},
};

/// One link in a row's mutation chain. Exposed (not just used internally)
/// so the flush path (`rowset::disk`) can replay a row's full history into
/// UNDO records, not just its final projected state.
#[derive(Debug, Clone)]
pub enum MutationKind {
    Insert(Row),
    Reinsert(Row),
    Update(Vec<(usize, Value)>),
    Delete,
}

#[derive(Debug, Clone)]
struct Mutation {
    ts: Timestamp,
    op_id: u64,
    kind: MutationKind,
}

/// Per-row state: an append-only mutation chain in timestamp order, plus
/// the op-id of its very first entry (used to anchor the owning WAL
/// segment against GC).
struct RowEntry {
    chain: Vec<Mutation>,
}

impl RowEntry {
    fn is_ghost(&self) -> bool {
        matches!(
            self.chain.last().map(|m| &m.kind),
            Some(MutationKind::Delete)
        )
    }

    /// Project this row's state as of `snapshot`. Returns `(row,
    /// is_deleted)` where `row` is the most recent known column values
    /// (possibly stale if currently deleted,
    /// kept around so an `IS_DELETED` projection can still report the
    /// last-known values if ever needed).
    fn project(&self, snapshot: &Snapshot) -> Option<(Row, bool)> {
        let mut current: Option<Row> = None;
        let mut deleted = true; // no committed insert yet => doesn't exist
        for m in &self.chain {
            if !snapshot.is_committed(m.ts) {
                continue;
            }
            match &m.kind {
                MutationKind::Insert(row) | MutationKind::Reinsert(row) => {
                    current = Some(row.clone());
                    deleted = false;
                }
                MutationKind::Update(changes) => {
                    if let Some(row) = &mut current {
                        for (idx, val) in changes {
                            if *idx < row.values.len() {
                                row.values[*idx] = val.clone();
                            }
                        }
                    }
                }
                MutationKind::Delete => {
                    deleted = true;
                }
            }
        }
        current.map(|row| (row, deleted))
    }

    fn first_op_id(&self) -> Option<u64> {
        self.chain.first().map(|m| m.op_id)
    }
}

/// One row as yielded by a scan: final projected values plus whether it
/// read as deleted as of the requested snapshot.
pub struct ScannedRow {
    pub key: Vec<u8>,
    pub row: Row,
    pub is_deleted: bool,
}

pub struct MemRowSet {
    rows: SkipMap<Vec<u8>, RwLock<RowEntry>>,
    // Coarse lock serializing the ghost-check-then-append/insert decision.
    // A genuinely lock-free version would need a CAS on the chain head
    // itself; this trades that for a short critical section.
    insert_lock: Mutex<()>,
    row_count: std::sync::atomic::AtomicUsize,
}

impl Default for MemRowSet {
    fn default() -> Self {
        Self::new()
    }
}

impl MemRowSet {
    pub fn new() -> Self {
        Self {
            rows: SkipMap::new(),
            insert_lock: Mutex::new(()),
            row_count: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn approx_row_count(&self) -> usize {
        self.row_count.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// `Insert`. Fails with `AlreadyPresent` unless the existing row is a
    /// ghost (most recent mutation is DELETE), in which case the insert is
    /// folded in as a REINSERT.
    pub fn insert(&self, schema: &Schema, ts: Timestamp, row: Row, op_id: u64) -> RuntimeResult<()> {
        row.validate(schema)?;
        let key = row.encode_key(schema);
        let _guard = self.insert_lock.lock();
        match self.rows.get(&key) {
            None => {
                self.rows.insert(
                    key,
                    RwLock::new(RowEntry {
                        chain: vec![Mutation {
                            ts,
                            op_id,
                            kind: MutationKind::Insert(row),
                        }],
                    }),
                );
                self.row_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                Ok(())
            }
            Some(entry) => {
                let mut guard = entry.value().write();
                if guard.is_ghost() {
                    guard.chain.push(Mutation {
                        ts,
                        op_id,
                        kind: MutationKind::Reinsert(row),
                    });
                    Ok(())
                } else {
                    Err(Error::with_kind(ErrorKind::AlreadyPresent))
                }
            }
        }
    }

    /// `Mutate`: append an UPDATE to an existing row's chain.
    pub fn update(&self, key: &[u8], ts: Timestamp, changes: Vec<(usize, Value)>, op_id: u64) -> RuntimeResult<()> {
        let entry = self
            .rows
            .get(key)
            .ok_or_else(|| Error::with_kind(ErrorKind::NotFound))?;
        entry.value().write().chain.push(Mutation {
            ts,
            op_id,
            kind: MutationKind::Update(changes),
        });
        Ok(())
    }

    /// Append a DELETE to an existing row's chain.
    pub fn delete(&self, key: &[u8], ts: Timestamp, op_id: u64) -> RuntimeResult<()> {
        let entry = self
            .rows
            .get(key)
            .ok_or_else(|| Error::with_kind(ErrorKind::NotFound))?;
        entry.value().write().chain.push(Mutation {
            ts,
            op_id,
            kind: MutationKind::Delete,
        });
        Ok(())
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.rows.get(key).is_some()
    }

    /// The lowest op-id anchoring any row still resident in this MRS, used
    /// by the maintenance pool to compute WAL retention.
    pub fn min_anchored_op_id(&self) -> Option<u64> {
        self.rows
            .iter()
            .filter_map(|e| e.value().read().first_op_id())
            .min()
    }

    /// `SeekAtOrAfter` + `NextBlock` collapsed into a single bounded scan:
    /// project every row (in PK order) visible under `snapshot`.
    pub fn scan(&self, snapshot: &Snapshot, include_deleted: bool) -> Vec<ScannedRow> {
        let mut out = Vec::new();
        for entry in self.rows.iter() {
            let guard = entry.value().read();
            if let Some((row, is_deleted)) = guard.project(snapshot) {
                if is_deleted && !include_deleted {
                    continue;
                }
                out.push(ScannedRow {
                    key: entry.key().clone(),
                    row,
                    is_deleted,
                });
            }
        }
        out
    }

    /// Materialize a snapshot's worth of rows for a flush to a new DRS.
    /// Every row (including ghosts, so the DRS's UNDO chain can still
    /// recover pre-delete history) is included; the caller decides what to
    /// persist as base data vs. UNDO/REDO.
    pub fn flush_snapshot(&self, snapshot: &Snapshot) -> Vec<(Vec<u8>, Row, bool)> {
        let mut out = Vec::new();
        for entry in self.rows.iter() {
            let guard = entry.value().read();
            if let Some((row, is_deleted)) = guard.project(snapshot) {
                out.push((entry.key().clone(), row, is_deleted));
            }
        }
        out
    }

    /// Every row's full mutation chain, in insertion order, keyed by
    /// encoded PK. Used by `rowset::disk::DiskRowSet::from_mem_rowset` to
    /// derive UNDO records covering the row's pre-flush-snapshot history.
    pub fn export_for_flush(&self) -> Vec<(Vec<u8>, Vec<(Timestamp, u64, MutationKind)>)> {
        self.rows
            .iter()
            .map(|entry| {
                let guard = entry.value().read();
                let chain = guard
                    .chain
                    .iter()
                    .map(|m| (m.ts, m.op_id, m.kind.clone()))
                    .collect();
                (entry.key().clone(), chain)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnId, ColumnSchema, DataType};

    fn schema() -> Schema {
        Schema::new(
            vec![
                ColumnSchema::new(ColumnId(0), "pk", DataType::U64, false),
                ColumnSchema::new(ColumnId(1), "a", DataType::U64, true),
            ],
            1,
        )
        .unwrap()
    }

    fn row(pk: u64, a: u64) -> Row {
        Row::new(vec![Value::U64(pk), Value::U64(a)])
    }

    #[test]
    fn insert_then_duplicate_insert_fails() {
        let schema = schema();
        let mrs = MemRowSet::new();
        mrs.insert(&schema, Timestamp::new(1), row(1, 10), 1).unwrap();
        let err = mrs
            .insert(&schema, Timestamp::new(2), row(1, 20), 2)
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::AlreadyPresent));
    }

    #[test]
    fn reinsert_after_delete_succeeds() {
        let schema = schema();
        let mrs = MemRowSet::new();
        let key = row(7, 1).encode_key(&schema);
        mrs.insert(&schema, Timestamp::new(1), row(7, 1), 1).unwrap();
        mrs.delete(&key, Timestamp::new(2), 2).unwrap();
        mrs.insert(&schema, Timestamp::new(3), row(7, 3), 3).unwrap();

        let snap_at_2 = Snapshot::at(Timestamp::new(2));
        assert!(mrs.scan(&snap_at_2, false).is_empty());

        let snap_at_2_incl = {
            let mut s = Snapshot::at(Timestamp::new(2));
            s.widen_with([Timestamp::new(2)]);
            s
        };
        let scanned = mrs.scan(&snap_at_2_incl, true);
        assert_eq!(scanned.len(), 1);
        assert!(scanned[0].is_deleted);

        let snap_at_4 = Snapshot::at(Timestamp::new(4));
        let scanned = mrs.scan(&snap_at_4, false);
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].row.values[1], Value::U64(3));
    }

    #[test]
    fn update_then_scan_at_various_snapshots() {
        let schema = schema();
        let mrs = MemRowSet::new();
        let key = row(42, 100).encode_key(&schema);
        mrs.insert(&schema, Timestamp::new(1), row(42, 100), 1).unwrap();
        mrs.update(&key, Timestamp::new(3), vec![(1, Value::U64(300))], 2)
            .unwrap();
        mrs.update(&key, Timestamp::new(5), vec![(1, Value::U64(500))], 3)
            .unwrap();

        let at4 = {
            let mut s = Snapshot::at(Timestamp::new(4));
            s.widen_with([Timestamp::new(3)]);
            s
        };
        assert_eq!(mrs.scan(&at4, false)[0].row.values[1], Value::U64(300));

        let at6 = {
            let mut s = Snapshot::at(Timestamp::new(6));
            s.widen_with([Timestamp::new(3), Timestamp::new(5)]);
            s
        };
        assert_eq!(mrs.scan(&at6, false)[0].row.values[1], Value::U64(500));

        let at2 = Snapshot::at(Timestamp::new(2));
        assert_eq!(mrs.scan(&at2, false)[0].row.values[1], Value::U64(100));
    }
}
