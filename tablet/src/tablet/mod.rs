/*
 * Created on Mon Feb 5 2024
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

//! Tablet write/read path, bootstrap, and replica lifecycle.

pub mod bootstrap;
pub mod op;
pub mod replica;

use {
    crate::{
        block::BlockManager,
        config::Config,
        error::{Error, ErrorKind, RuntimeResult},
        mvcc::{Mvcc, Snapshot},
        rowset::{
            disk::{DiskRowSet, ScannedRow as DiskScannedRow},
            mem::{MemRowSet, ScannedRow as MemScannedRow},
            tree::{RowSetBounds, RowSetTree},
        },
        schema::Schema,
        timestamp::Timestamp,
        wal::{Entry, SegmentSequence},
    },
    op::Op,
    parking_lot::{Mutex, RwLock},
    std::{
        path::{Path, PathBuf},
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
    },
};

/// One scanned row from either the MRS or a DRS, normalized for merging
/// into a single PK-ordered stream.
pub struct ScannedRow {
    pub key: Vec<u8>,
    pub row: crate::schema::Row,
    pub is_deleted: bool,
}

impl From<MemScannedRow> for ScannedRow {
    fn from(r: MemScannedRow) -> Self {
        Self {
            key: r.key,
            row: r.row,
            is_deleted: r.is_deleted,
        }
    }
}
impl From<DiskScannedRow> for ScannedRow {
    fn from(r: DiskScannedRow) -> Self {
        Self {
            key: r.key,
            row: r.row,
            is_deleted: r.is_deleted,
        }
    }
}

/// The per-tablet storage engine: one MemRowSet, a list of immutable
/// DiskRowSets indexed by a RowSetTree, the MVCC coordinator, and the WAL.
///
/// Operations against one `Tablet` are assumed to be serialized by the
/// caller's apply pool (one op per tablet at a time); that assumption is
/// what lets `apply` validate-then-mutate without a transactional
/// rollback path.
pub struct Tablet {
    pub id: String,
    schema: Schema,
    mvcc: Mvcc,
    mrs: RwLock<Arc<MemRowSet>>,
    rowsets: RwLock<Vec<Arc<RwLock<DiskRowSet>>>>,
    wal: Mutex<SegmentSequence>,
    blocks: BlockManager,
    next_op_id: AtomicU64,
    next_drs_id: AtomicU64,
    config: Config,
}

impl Tablet {
    /// Create a brand new tablet rooted at `dir`.
    pub fn create(dir: impl AsRef<Path>, id: impl Into<String>, schema: Schema, config: Config) -> RuntimeResult<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let (wal, replay) = SegmentSequence::open(
            wal_dir(dir),
            config.wal_segment_size_mb * 1024 * 1024,
        )?;
        if !replay.is_empty() {
            return Err(Error::with_kind(ErrorKind::IllegalState(
                "create() called on a directory with existing WAL history",
            )));
        }
        let blocks = BlockManager::open(
            blocks_dir(dir),
            config.block_alignment_bytes,
            config.wal_segment_size_mb * 1024 * 1024,
        )?;
        Ok(Self {
            id: id.into(),
            schema,
            mvcc: Mvcc::new(),
            mrs: RwLock::new(Arc::new(MemRowSet::new())),
            rowsets: RwLock::new(Vec::new()),
            wal: Mutex::new(wal),
            blocks,
            next_op_id: AtomicU64::new(1),
            next_drs_id: AtomicU64::new(1),
            config,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn mvcc(&self) -> &Mvcc {
        &self.mvcc
    }

    fn next_op_id(&self) -> u64 {
        self.next_op_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Apply one row op end to end: allocate a timestamp, durably
    /// replicate, mutate memory, durably commit.
    ///
    /// A logical failure (`AlreadyPresent`/`NotFound`) still completes the
    /// MVCC transaction — once APPLYING, the only terminal transition is
    /// commit — and is returned to the caller as the op's result; the
    /// tablet continues.
    pub fn apply(&self, op: Op) -> RuntimeResult<(Timestamp, RuntimeResult<()>)> {
        let ts = self.mvcc.allocate_timestamp();
        self.mvcc.start_transaction(ts)?;
        let op_id = self.next_op_id();

        self.wal.lock().append_batch(&[Entry::Replicate {
            op_index: op_id,
            payload: op.encode(),
        }])?;

        self.mvcc.start_applying_transaction(ts);
        let outcome = self.apply_to_memory(&op, ts, op_id);

        self.wal.lock().append_batch(&[Entry::Commit { op_index: op_id }])?;
        self.mvcc.commit_transaction(ts);

        Ok((ts, outcome))
    }

    /// Routes a validated op to the MRS or the owning DRS's DMS.
    fn apply_to_memory(&self, op: &Op, ts: Timestamp, op_id: u64) -> RuntimeResult<()> {
        match op {
            Op::Insert { row } => self.mrs.read().clone().insert(&self.schema, ts, row.clone(), op_id),
            Op::Update { key, changes } => self.route_mutation(key, ts, op_id, Mutation::Update(changes.clone())),
            Op::Delete { key } => self.route_mutation(key, ts, op_id, Mutation::Delete),
        }
    }

    fn route_mutation(&self, key: &[u8], ts: Timestamp, op_id: u64, mutation: Mutation) -> RuntimeResult<()> {
        let mrs = self.mrs.read().clone();
        if mrs.contains_key(key) {
            return match mutation {
                Mutation::Update(changes) => mrs.update(key, ts, changes, op_id),
                Mutation::Delete => mrs.delete(key, ts, op_id),
            };
        }
        let rowsets = self.rowsets.read();
        for drs in rowsets.iter() {
            let drs_guard = drs.read();
            if !drs_guard.might_contain_key(key) {
                continue;
            }
            if let Some(ordinal) = drs_guard.find_ordinal(key) {
                let change = match &mutation {
                    Mutation::Update(changes) => crate::rowset::delta_mem::DeltaChange::Update(changes.clone()),
                    Mutation::Delete => crate::rowset::delta_mem::DeltaChange::Delete,
                };
                return drs_guard.dms().update(ts, ordinal, change, op_id);
            }
        }
        Err(Error::with_kind(ErrorKind::NotFound))
    }

    /// Flush the MRS: snapshot + atomically publish a new empty MRS,
    /// write the snapshot as a new DRS, persist that DRS's catalog so it
    /// survives a restart, and leave a FLUSH-MARKER in the WAL so
    /// bootstrap knows to skip those ops.
    pub fn flush_mrs(&self) -> RuntimeResult<()> {
        let snapshot = self.mvcc.take_snapshot();
        let old_mrs = {
            let mut guard = self.mrs.write();
            std::mem::replace(&mut *guard, Arc::new(MemRowSet::new()))
        };
        if old_mrs.is_empty() {
            return Ok(());
        }
        let drs_id = self.next_drs_id.fetch_add(1, Ordering::SeqCst);
        let export = old_mrs.export_for_flush();
        let mut drs = DiskRowSet::from_mem_rowset(drs_id, &self.schema, snapshot, export);
        drs.persist_catalog(&self.blocks)?;
        self.rowsets.write().push(Arc::new(RwLock::new(drs)));

        let up_to = self.next_op_id.load(Ordering::SeqCst).saturating_sub(1);
        self.wal
            .lock()
            .append_batch(&[Entry::FlushMarker { up_to_op_index: up_to }])?;
        Ok(())
    }

    fn rowset_tree(&self) -> RowSetTree {
        let rowsets = self.rowsets.read();
        let mut bounds = Vec::new();
        for drs in rowsets.iter() {
            let guard = drs.read();
            if let Ok((min, max)) = guard.bounds() {
                bounds.push(RowSetBounds {
                    id: guard.id,
                    min_key: min.to_vec(),
                    max_key: max.to_vec(),
                    size_bytes: guard.on_disk_base_data_size_with_redos(),
                });
            }
        }
        RowSetTree::new(bounds)
    }

    /// Merge the MRS's and every DRS's rows, visible under `snapshot`, in
    /// PK order.
    pub fn scan(&self, snapshot: &Snapshot, include_deleted: bool) -> Vec<ScannedRow> {
        let mut out: Vec<ScannedRow> = self
            .mrs
            .read()
            .scan(snapshot, include_deleted)
            .into_iter()
            .map(Into::into)
            .collect();
        for drs in self.rowsets.read().iter() {
            out.extend(
                drs.read()
                    .scan(snapshot, include_deleted)
                    .into_iter()
                    .map(ScannedRow::from),
            );
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    pub fn mrs_row_count(&self) -> usize {
        self.mrs.read().approx_row_count()
    }

    pub fn should_flush(&self) -> bool {
        self.mrs_row_count() >= self.config.mrs_flush_row_threshold
    }

    /// Minor delta compaction over every DRS past the file-count
    /// threshold, persisting each compacted DRS's catalog afterward.
    pub fn run_minor_delta_compaction(&self) -> RuntimeResult<()> {
        for drs in self.rowsets.read().iter() {
            let mut guard = drs.write();
            if guard.redo_file_count() >= self.config.minor_compaction_file_threshold {
                guard.minor_compact_deltas();
                guard.persist_catalog(&self.blocks)?;
            }
        }
        Ok(())
    }

    /// Merging compaction: select rowsets via the budgeted policy and
    /// substitute them with freshly merged, non-overlapping DRSs. A
    /// failed merge leaves inputs untouched.
    pub fn run_merging_compaction(&self, snapshot: &Snapshot) -> RuntimeResult<()> {
        let tree = self.rowset_tree();
        if tree.is_empty() {
            return Ok(());
        }
        let selected_ids = tree.select_compaction_budgeted(self.config.compaction_byte_budget);
        if selected_ids.len() < 2 {
            return Ok(());
        }
        let mut rowsets = self.rowsets.write();
        let (selected, remaining): (Vec<_>, Vec<_>) = rowsets
            .drain(..)
            .partition(|drs| selected_ids.contains(&drs.read().id));

        let mut merged_rows = Vec::new();
        for drs in &selected {
            merged_rows.extend(drs.read().scan(snapshot, true));
        }
        merged_rows.sort_by(|a, b| a.key.cmp(&b.key));

        let new_id = self.next_drs_id.fetch_add(1, Ordering::SeqCst);
        // Merging compaction collapses each row down to its state as of
        // `snapshot`: the merged DRS carries no older MVCC history, so its
        // creation snapshot is `including_all` (every row it holds is
        // unconditionally committed) rather than the caller's `snapshot`.
        let export: Vec<_> = merged_rows
            .into_iter()
            .map(|r| {
                let kind = if r.is_deleted {
                    crate::rowset::mem::MutationKind::Delete
                } else {
                    crate::rowset::mem::MutationKind::Insert(r.row)
                };
                (r.key, vec![(Timestamp::ZERO, 0u64, kind)])
            })
            .collect();
        let mut merged_drs = DiskRowSet::from_mem_rowset(new_id, &self.schema, Snapshot::including_all(), export);
        merged_drs.persist_catalog(&self.blocks)?;
        for drs in &selected {
            if let Some(block) = drs.read().catalog_block() {
                self.blocks.delete_block(block)?;
            }
        }

        *rowsets = remaining;
        rowsets.push(Arc::new(RwLock::new(merged_drs)));
        Ok(())
    }
}

enum Mutation {
    Update(Vec<(usize, crate::schema::Value)>),
    Delete,
}

fn wal_dir(root: &Path) -> PathBuf {
    root.join("wal")
}

fn blocks_dir(root: &Path) -> PathBuf {
    root.join("blocks")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnId, ColumnSchema, DataType, Row, Value};

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

    #[test]
    fn insert_then_scan_sees_row() {
        let dir = tempfile::tempdir().unwrap();
        let tablet = Tablet::create(dir.path(), "t1", schema(), Config::default()).unwrap();
        let (ts, res) = tablet
            .apply(Op::Insert {
                row: Row::new(vec![Value::U64(1), Value::U64(10)]),
            })
            .unwrap();
        res.unwrap();
        let mut snap = Snapshot::at(ts.next());
        snap.widen_with([ts]);
        let rows = tablet.scan(&snap, false);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].row.values[1], Value::U64(10));
    }

    #[test]
    fn duplicate_insert_reports_already_present_but_tablet_continues() {
        let dir = tempfile::tempdir().unwrap();
        let tablet = Tablet::create(dir.path(), "t1", schema(), Config::default()).unwrap();
        tablet
            .apply(Op::Insert {
                row: Row::new(vec![Value::U64(1), Value::U64(10)]),
            })
            .unwrap()
            .1
            .unwrap();
        let (_, second) = tablet
            .apply(Op::Insert {
                row: Row::new(vec![Value::U64(1), Value::U64(20)]),
            })
            .unwrap();
        assert!(matches!(second.unwrap_err().kind(), ErrorKind::AlreadyPresent));
    }

    #[test]
    fn flush_then_scan_matches_pre_flush() {
        let dir = tempfile::tempdir().unwrap();
        let tablet = Tablet::create(dir.path(), "t1", schema(), Config::default()).unwrap();
        let (ts, _) = tablet
            .apply(Op::Insert {
                row: Row::new(vec![Value::U64(1), Value::U64(10)]),
            })
            .unwrap();
        let mut snap = Snapshot::at(ts.next());
        snap.widen_with([ts]);
        let before = tablet.scan(&snap, false);
        tablet.flush_mrs().unwrap();
        let after = tablet.scan(&snap, false);
        assert_eq!(before.len(), after.len());
        assert_eq!(before[0].row.values, after[0].row.values);
    }

    #[test]
    fn update_after_flush_routes_to_drs_dms() {
        let dir = tempfile::tempdir().unwrap();
        let tablet = Tablet::create(dir.path(), "t1", schema(), Config::default()).unwrap();
        let (ts1, _) = tablet
            .apply(Op::Insert {
                row: Row::new(vec![Value::U64(42), Value::U64(1)]),
            })
            .unwrap();
        let mut flush_snap = Snapshot::at(ts1.next());
        flush_snap.widen_with([ts1]);
        tablet.flush_mrs().unwrap();

        let key = Row::new(vec![Value::U64(42), Value::U64(1)]).encode_key(&schema());
        let (ts2, res) = tablet
            .apply(Op::Update {
                key,
                changes: vec![(1, Value::U64(99))],
            })
            .unwrap();
        res.unwrap();

        let mut scan_snap = Snapshot::at(ts2.next());
        scan_snap.widen_with([ts1, ts2]);
        let rows = tablet.scan(&scan_snap, false);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].row.values[1], Value::U64(99));
    }
}
