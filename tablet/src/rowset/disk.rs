/*
 * Created on Wed Jan 31 2024
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
 * A DRS is immutable base data (written once, at flush or compaction time)
 * plus two append-only delta lists: REDO (mutations after the DRS's
 * creation snapshot, fed by the DRS's own live `DeltaMemStore` until it is
 * itself flushed to a delta file) and UNDO (mutations before it, letting a
 * scan at an older snapshot roll rows backward).
 */

use {
    crate::{
        block::{BlockId, BlockManager},
        error::{Error, ErrorKind, RuntimeResult},
        mvcc::Snapshot,
        rowset::{
            delta_mem::{self, DeltaChange, DeltaIteratorMerger, DeltaKey, DeltaMemStore, DeltaStats},
            mem::MutationKind,
        },
        schema::{Row, Schema, Value},
        timestamp::Timestamp,
    },
    std::collections::HashMap,
};

/// One link in a row's UNDO chain: applying it rolls the row back across
/// the mutation it inverts.
#[derive(Debug, Clone)]
enum UndoOp {
    /// undoes the row's original INSERT: before this ts, it didn't exist.
    ToNonExistent,
    /// undoes a REINSERT: before this ts, the row was a ghost.
    ToDeleted,
    /// undoes a DELETE: before this ts, the row held these values.
    Undelete(Row),
    /// undoes an UPDATE: before this ts, these columns held these values.
    UndoUpdate(Vec<(usize, Value)>),
}

/// A minimal Bloom filter for negative PK lookups.
struct Bloom {
    bits: Vec<u64>,
    num_hashes: u32,
}

impl Bloom {
    fn with_capacity(expected_items: usize) -> Self {
        let bits_len = ((expected_items.max(64) * 10) / 64) + 1;
        Self {
            bits: vec![0u64; bits_len],
            num_hashes: 4,
        }
    }

    fn hash(&self, key: &[u8], seed: u32) -> usize {
        let mut buf = Vec::with_capacity(key.len() + 4);
        buf.extend_from_slice(&seed.to_le_bytes());
        buf.extend_from_slice(key);
        crate::checksum::crc32c(&buf) as usize % (self.bits.len() * 64)
    }

    fn insert(&mut self, key: &[u8]) {
        for h in 0..self.num_hashes {
            let bit = self.hash(key, h);
            self.bits[bit / 64] |= 1 << (bit % 64);
        }
    }

    fn might_contain(&self, key: &[u8]) -> bool {
        (0..self.num_hashes).all(|h| {
            let bit = self.hash(key, h);
            self.bits[bit / 64] & (1 << (bit % 64)) != 0
        })
    }
}

/// One materialized scan row, mirroring `rowset::mem::ScannedRow`.
pub struct ScannedRow {
    pub key: Vec<u8>,
    pub row: Row,
    pub is_deleted: bool,
}

/// An on-disk RowSet: immutable base data plus REDO/UNDO delta lists.
pub struct DiskRowSet {
    pub id: u64,
    /// base rows, sorted by encoded PK; index here is the row's ordinal,
    /// which both the ad-hoc PK index and per-row UNDO chains key on.
    base_rows: Vec<(Vec<u8>, Row)>,
    bloom: Bloom,
    undo_chains: HashMap<u64, Vec<(Timestamp, UndoOp)>>,
    /// flushed REDO delta files, oldest first; minor delta compaction
    /// merges these down over time.
    redo_files: Vec<Vec<(DeltaKey, DeltaChange)>>,
    /// live DMS catching mutations that land on this DRS after creation.
    dms: DeltaMemStore,
    creation_snapshot: Snapshot,
    /// block holding this DRS's persisted catalog, if it has been
    /// written at least once; `None` until the first `persist_catalog`.
    catalog_block: Option<BlockId>,
}

const CATALOG_BLOCK_TAG: u8 = 1;

impl DiskRowSet {
    /// Build a DRS from a MemRowSet flush. `flush_snapshot` is the MVCC
    /// snapshot the MRS was frozen at.
    pub fn from_mem_rowset(
        id: u64,
        schema: &Schema,
        flush_snapshot: Snapshot,
        export: Vec<(Vec<u8>, Vec<(Timestamp, u64, MutationKind)>)>,
    ) -> Self {
        let mut base_rows = Vec::new();
        let mut undo_chains = HashMap::new();
        let mut bloom = Bloom::with_capacity(export.len());

        for (key, chain) in export {
            let mut current: Option<Row> = None;
            let mut forward_undo: Vec<(Timestamp, UndoOp)> = Vec::new();
            for (ts, _op_id, kind) in &chain {
                if !flush_snapshot.is_committed(*ts) {
                    continue;
                }
                let undo = match kind {
                    MutationKind::Insert(_) => UndoOp::ToNonExistent,
                    MutationKind::Reinsert(_) => UndoOp::ToDeleted,
                    MutationKind::Delete => {
                        UndoOp::Undelete(current.clone().unwrap_or_else(|| Row::new(vec![])))
                    }
                    MutationKind::Update(changes) => {
                        let pre = current
                            .as_ref()
                            .map(|row| {
                                changes
                                    .iter()
                                    .map(|(idx, _)| (*idx, row.values.get(*idx).cloned().unwrap_or(Value::Null)))
                                    .collect()
                            })
                            .unwrap_or_default();
                        UndoOp::UndoUpdate(pre)
                    }
                };
                forward_undo.push((*ts, undo));
                match kind {
                    MutationKind::Insert(row) | MutationKind::Reinsert(row) => current = Some(row.clone()),
                    MutationKind::Update(changes) => {
                        if let Some(row) = &mut current {
                            for (idx, val) in changes {
                                if *idx < row.values.len() {
                                    row.values[*idx] = val.clone();
                                }
                            }
                        }
                    }
                    MutationKind::Delete => current = None,
                }
            }
            forward_undo.reverse(); // newest-first, for backward replay
            let ordinal = base_rows.len() as u64;
            if let Some(row) = current {
                bloom.insert(&key);
                base_rows.push((key, row));
                if !forward_undo.is_empty() {
                    undo_chains.insert(ordinal, forward_undo);
                }
            }
            // ghost rows (deleted as of the flush snapshot) are not part
            // of base data; their history is not retained past flush.
        }
        let _ = schema;

        Self {
            id,
            base_rows,
            bloom,
            undo_chains,
            redo_files: Vec::new(),
            dms: DeltaMemStore::new(),
            creation_snapshot: flush_snapshot,
            catalog_block: None,
        }
    }

    pub fn dms(&self) -> &DeltaMemStore {
        &self.dms
    }

    pub fn row_count(&self) -> usize {
        self.base_rows.len()
    }

    /// `GetBounds(min, max)`. A DRS with zero rows has no bounds.
    pub fn bounds(&self) -> RuntimeResult<(&[u8], &[u8])> {
        match (self.base_rows.first(), self.base_rows.last()) {
            (Some((min, _)), Some((max, _))) => Ok((min, max)),
            _ => Err(Error::with_kind(ErrorKind::NotFound)),
        }
    }

    /// Binary search over the ad-hoc PK index for the row ordinal holding
    /// `key`, if any is present in base data (negative lookups should
    /// consult `might_contain_key` first to avoid an unnecessary search).
    pub fn find_ordinal(&self, key: &[u8]) -> Option<u64> {
        self.base_rows
            .binary_search_by(|(k, _)| k.as_slice().cmp(key))
            .ok()
            .map(|i| i as u64)
    }

    pub fn might_contain_key(&self, key: &[u8]) -> bool {
        self.bloom.might_contain(key)
    }

    /// `OnDiskBaseDataSizeWithRedos()`.
    pub fn on_disk_base_data_size_with_redos(&self) -> u64 {
        let base: usize = self.base_rows.iter().map(|(k, r)| k.len() + r.encode().len()).sum();
        let redo: usize = self
            .redo_files
            .iter()
            .flatten()
            .map(|(_, c)| match c {
                DeltaChange::Update(cols) => cols.iter().map(|(_, v)| v.encode().len() + 8).sum::<usize>(),
                DeltaChange::Delete => 1,
            })
            .sum();
        (base + redo) as u64
    }

    /// `OnDiskBaseDataColumnSize(col)`.
    pub fn on_disk_base_data_column_size(&self, col_idx: usize) -> u64 {
        self.base_rows
            .iter()
            .filter_map(|(_, r)| r.values.get(col_idx).map(|v| v.encode().len() as u64))
            .sum()
    }

    /// Number of REDO delta files awaiting minor compaction.
    pub fn redo_file_count(&self) -> usize {
        self.redo_files.len()
    }

    /// Flush this DRS's live DMS into a new REDO delta file, as happens
    /// periodically so the DMS doesn't grow unbounded (mirrors
    /// `DeltaMemStore::flush_to_redo_records`, scoped to one DRS).
    pub fn flush_dms_to_redo_file(&mut self) -> DeltaStats {
        let (records, stats) = self.dms.flush_to_redo_records();
        self.redo_files.push(records);
        self.dms = DeltaMemStore::new();
        stats
    }

    /// Minor delta compaction: merge every REDO file into one. Keeps
    /// every record rather than discarding superseded values —
    /// correctness-preserving, just not space-optimal, since records are
    /// immutable facts about a specific timestamp and never truly
    /// redundant under MVCC.
    pub fn minor_compact_deltas(&mut self) {
        if self.redo_files.len() <= 1 {
            return;
        }
        let merged = DeltaIteratorMerger::merge(std::mem::take(&mut self.redo_files));
        self.redo_files = vec![merged];
    }

    /// Major delta compaction: fold REDO records up to `frontier` into
    /// base data, generating the corresponding UNDOs, then keep only REDO
    /// records after `frontier`.
    pub fn major_compact_deltas(&mut self, frontier: Timestamp) {
        self.minor_compact_deltas();
        let Some(records) = self.redo_files.pop() else {
            return;
        };
        let (to_fold, remaining): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|(k, _)| Timestamp::new(k.timestamp) <= frontier);

        for (key, change) in to_fold {
            let ordinal = key.row_idx as usize;
            let Some((_, row)) = self.base_rows.get_mut(ordinal) else {
                continue;
            };
            let undo = match &change {
                DeltaChange::Update(cols) => UndoOp::UndoUpdate(
                    cols.iter()
                        .map(|(idx, _)| (*idx, row.values.get(*idx).cloned().unwrap_or(Value::Null)))
                        .collect(),
                ),
                DeltaChange::Delete => UndoOp::Undelete(row.clone()),
            };
            self.undo_chains
                .entry(ordinal as u64)
                .or_default()
                .insert(0, (Timestamp::new(key.timestamp), undo));
            if let DeltaChange::Update(cols) = &change {
                for (idx, val) in cols {
                    if *idx < row.values.len() {
                        row.values[*idx] = val.clone();
                    }
                }
            }
        }
        if !remaining.is_empty() {
            self.redo_files.push(remaining);
        }
    }

    /// Scan every base row visible under `snapshot`, applying REDO deltas
    /// (for mutations after creation) and UNDO deltas (for a snapshot
    /// predating creation) as needed.
    pub fn creation_snapshot(&self) -> &Snapshot {
        &self.creation_snapshot
    }

    pub fn scan(&self, snapshot: &Snapshot, include_deleted: bool) -> Vec<ScannedRow> {
        let mut redo_by_row: HashMap<u64, Vec<(DeltaKey, DeltaChange)>> = HashMap::new();
        let dms_batch = self.dms.prepare_batch(0, self.base_rows.len() as u64);
        for (k, c) in dms_batch {
            redo_by_row.entry(k.row_idx).or_default().push((k, c));
        }
        for file in &self.redo_files {
            for (k, c) in file {
                redo_by_row.entry(k.row_idx).or_default().push((k.clone(), c.clone()));
            }
        }

        let mut out = Vec::new();
        for (ordinal, (key, base_row)) in self.base_rows.iter().enumerate() {
            let ordinal = ordinal as u64;
            let mut row = base_row.clone();
            let mut deleted = false;

            // Roll the row backward past any mutation the scan snapshot
            // doesn't consider committed. The chain is newest-first, so
            // this naturally undoes the most recent folded-in mutation
            // first.
            if let Some(chain) = self.undo_chains.get(&ordinal) {
                for (ts, undo) in chain {
                    if snapshot.is_committed(*ts) {
                        continue;
                    }
                    match undo {
                        UndoOp::ToNonExistent | UndoOp::ToDeleted => {
                            deleted = true;
                        }
                        UndoOp::Undelete(pre) => {
                            row = pre.clone();
                            deleted = false;
                        }
                        UndoOp::UndoUpdate(pre) => {
                            for (idx, val) in pre {
                                if *idx < row.values.len() {
                                    row.values[*idx] = val.clone();
                                }
                            }
                        }
                    }
                }
            }

            if let Some(redos) = redo_by_row.get(&ordinal) {
                let mut sorted = redos.clone();
                sorted.sort_by_key(|(k, _)| *k);
                let mut dst: Vec<Option<Value>> = row.values.iter().cloned().map(Some).collect();
                for col_idx in 0..row.values.len() {
                    delta_mem::apply_updates(&sorted, ordinal, col_idx, snapshot, &mut dst);
                }
                for (i, v) in dst.into_iter().enumerate() {
                    if let Some(v) = v {
                        row.values[i] = v;
                    }
                }
                let mut sel = [true];
                delta_mem::apply_deletes(&sorted, ordinal, snapshot, &mut sel);
                if !sel[0] {
                    deleted = true;
                }
            }

            if deleted && !include_deleted {
                continue;
            }
            out.push(ScannedRow {
                key: key.clone(),
                row,
                is_deleted: deleted,
            });
        }
        out
    }

    /// The block currently holding this DRS's persisted catalog, if any.
    pub fn catalog_block(&self) -> Option<BlockId> {
        self.catalog_block
    }

    fn encode_catalog(&self) -> Vec<u8> {
        let mut buf = vec![CATALOG_BLOCK_TAG];
        buf.extend_from_slice(&self.id.to_le_bytes());

        buf.extend_from_slice(&(self.base_rows.len() as u32).to_le_bytes());
        for (key, row) in &self.base_rows {
            buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
            buf.extend_from_slice(key);
            let encoded = row.encode();
            buf.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
            buf.extend_from_slice(&encoded);
        }

        buf.extend_from_slice(&(self.undo_chains.len() as u32).to_le_bytes());
        for (ordinal, chain) in &self.undo_chains {
            buf.extend_from_slice(&ordinal.to_le_bytes());
            buf.extend_from_slice(&(chain.len() as u32).to_le_bytes());
            for (ts, undo) in chain {
                buf.extend_from_slice(&ts.value().to_le_bytes());
                let encoded = encode_undo_op(undo);
                buf.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
                buf.extend_from_slice(&encoded);
            }
        }

        buf.extend_from_slice(&(self.redo_files.len() as u32).to_le_bytes());
        for file in &self.redo_files {
            buf.extend_from_slice(&(file.len() as u32).to_le_bytes());
            for (key, change) in file {
                buf.extend_from_slice(&encode_delta_key(key));
                let encoded = encode_delta_change(change);
                buf.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
                buf.extend_from_slice(&encoded);
            }
        }

        let snapshot_encoded = self.creation_snapshot.encode();
        buf.extend_from_slice(&(snapshot_encoded.len() as u32).to_le_bytes());
        buf.extend_from_slice(&snapshot_encoded);

        buf
    }

    /// Decode a catalog block back into a DRS. `dms` is always fresh:
    /// mutations accumulated after the last persisted catalog are
    /// recovered separately, by replaying the WAL.
    fn decode_catalog(buf: &[u8]) -> Option<Self> {
        let mut pos = 0usize;
        let take = |pos: &mut usize, n: usize| -> Option<&[u8]> {
            let slice = buf.get(*pos..*pos + n)?;
            *pos += n;
            Some(slice)
        };
        if take(&mut pos, 1)? != [CATALOG_BLOCK_TAG] {
            return None;
        }
        let id = u64::from_le_bytes(take(&mut pos, 8)?.try_into().ok()?);

        let base_count = u32::from_le_bytes(take(&mut pos, 4)?.try_into().ok()?);
        let mut base_rows = Vec::with_capacity(base_count as usize);
        let mut bloom = Bloom::with_capacity(base_count as usize);
        for _ in 0..base_count {
            let key_len = u32::from_le_bytes(take(&mut pos, 4)?.try_into().ok()?) as usize;
            let key = take(&mut pos, key_len)?.to_vec();
            let row_len = u32::from_le_bytes(take(&mut pos, 4)?.try_into().ok()?) as usize;
            let (row, _) = Row::decode(take(&mut pos, row_len)?)?;
            bloom.insert(&key);
            base_rows.push((key, row));
        }

        let chain_count = u32::from_le_bytes(take(&mut pos, 4)?.try_into().ok()?);
        let mut undo_chains = HashMap::with_capacity(chain_count as usize);
        for _ in 0..chain_count {
            let ordinal = u64::from_le_bytes(take(&mut pos, 8)?.try_into().ok()?);
            let link_count = u32::from_le_bytes(take(&mut pos, 4)?.try_into().ok()?);
            let mut chain = Vec::with_capacity(link_count as usize);
            for _ in 0..link_count {
                let ts = Timestamp::new(u64::from_le_bytes(take(&mut pos, 8)?.try_into().ok()?));
                let op_len = u32::from_le_bytes(take(&mut pos, 4)?.try_into().ok()?) as usize;
                let undo = decode_undo_op(take(&mut pos, op_len)?)?;
                chain.push((ts, undo));
            }
            undo_chains.insert(ordinal, chain);
        }

        let file_count = u32::from_le_bytes(take(&mut pos, 4)?.try_into().ok()?);
        let mut redo_files = Vec::with_capacity(file_count as usize);
        for _ in 0..file_count {
            let record_count = u32::from_le_bytes(take(&mut pos, 4)?.try_into().ok()?);
            let mut records = Vec::with_capacity(record_count as usize);
            for _ in 0..record_count {
                let key = decode_delta_key(take(&mut pos, 20)?)?;
                let change_len = u32::from_le_bytes(take(&mut pos, 4)?.try_into().ok()?) as usize;
                let change = decode_delta_change(take(&mut pos, change_len)?)?;
                records.push((key, change));
            }
            redo_files.push(records);
        }

        let snapshot_len = u32::from_le_bytes(take(&mut pos, 4)?.try_into().ok()?) as usize;
        let (creation_snapshot, _) = Snapshot::decode(take(&mut pos, snapshot_len)?)?;

        Some(Self {
            id,
            base_rows,
            bloom,
            undo_chains,
            redo_files,
            dms: DeltaMemStore::new(),
            creation_snapshot,
            catalog_block: None,
        })
    }

    /// Persist this DRS's full catalog (base data, UNDO chains, REDO
    /// files, creation snapshot) to a new block, replacing any
    /// previously-persisted catalog block for this DRS.
    pub fn persist_catalog(&mut self, blocks: &BlockManager) -> RuntimeResult<()> {
        let encoded = self.encode_catalog();
        let new_block = blocks.create_block(&encoded)?;
        if let Some(old) = self.catalog_block.replace(new_block) {
            blocks.delete_block(old)?;
        }
        Ok(())
    }

    /// Reload every persisted DRS by scanning the block container for
    /// catalog blocks. There is no separate catalog index: any block
    /// that decodes as a catalog is one.
    pub fn load_all(blocks: &BlockManager) -> Vec<Self> {
        let mut out = Vec::new();
        for id in blocks.all_blocks() {
            let Ok(buf) = blocks.read_block(id) else {
                continue;
            };
            if let Some(mut drs) = Self::decode_catalog(&buf) {
                drs.catalog_block = Some(id);
                out.push(drs);
            }
        }
        out
    }
}

fn encode_undo_op(op: &UndoOp) -> Vec<u8> {
    match op {
        UndoOp::ToNonExistent => vec![0],
        UndoOp::ToDeleted => vec![1],
        UndoOp::Undelete(row) => {
            let mut buf = vec![2];
            buf.extend_from_slice(&row.encode());
            buf
        }
        UndoOp::UndoUpdate(cols) => {
            let mut buf = vec![3];
            buf.extend_from_slice(&(cols.len() as u32).to_le_bytes());
            for (idx, val) in cols {
                buf.extend_from_slice(&(*idx as u32).to_le_bytes());
                let encoded = val.encode();
                buf.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
                buf.extend_from_slice(&encoded);
            }
            buf
        }
    }
}

fn decode_undo_op(buf: &[u8]) -> Option<UndoOp> {
    let (tag, rest) = buf.split_first()?;
    match tag {
        0 => Some(UndoOp::ToNonExistent),
        1 => Some(UndoOp::ToDeleted),
        2 => Row::decode(rest).map(|(row, _)| UndoOp::Undelete(row)),
        3 => {
            let mut pos = 0usize;
            let take = |pos: &mut usize, n: usize| -> Option<&[u8]> {
                let slice = rest.get(*pos..*pos + n)?;
                *pos += n;
                Some(slice)
            };
            let count = u32::from_le_bytes(take(&mut pos, 4)?.try_into().ok()?);
            let mut cols = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let idx = u32::from_le_bytes(take(&mut pos, 4)?.try_into().ok()?) as usize;
                let len = u32::from_le_bytes(take(&mut pos, 4)?.try_into().ok()?) as usize;
                let (val, _) = Value::decode(take(&mut pos, len)?)?;
                cols.push((idx, val));
            }
            Some(UndoOp::UndoUpdate(cols))
        }
        _ => None,
    }
}

fn encode_delta_key(key: &DeltaKey) -> [u8; 20] {
    let mut buf = [0u8; 20];
    buf[0..8].copy_from_slice(&key.row_idx.to_le_bytes());
    buf[8..16].copy_from_slice(&key.timestamp.to_le_bytes());
    buf[16..20].copy_from_slice(&key.disambiguator.to_le_bytes());
    buf
}

fn decode_delta_key(buf: &[u8]) -> Option<DeltaKey> {
    if buf.len() != 20 {
        return None;
    }
    Some(DeltaKey {
        row_idx: u64::from_le_bytes(buf[0..8].try_into().ok()?),
        timestamp: u64::from_le_bytes(buf[8..16].try_into().ok()?),
        disambiguator: u32::from_le_bytes(buf[16..20].try_into().ok()?),
    })
}

fn encode_delta_change(change: &DeltaChange) -> Vec<u8> {
    match change {
        DeltaChange::Update(cols) => {
            let mut buf = vec![0];
            buf.extend_from_slice(&(cols.len() as u32).to_le_bytes());
            for (idx, val) in cols {
                buf.extend_from_slice(&(*idx as u32).to_le_bytes());
                let encoded = val.encode();
                buf.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
                buf.extend_from_slice(&encoded);
            }
            buf
        }
        DeltaChange::Delete => vec![1],
    }
}

fn decode_delta_change(buf: &[u8]) -> Option<DeltaChange> {
    let (tag, rest) = buf.split_first()?;
    match tag {
        0 => {
            let mut pos = 0usize;
            let take = |pos: &mut usize, n: usize| -> Option<&[u8]> {
                let slice = rest.get(*pos..*pos + n)?;
                *pos += n;
                Some(slice)
            };
            let count = u32::from_le_bytes(take(&mut pos, 4)?.try_into().ok()?);
            let mut cols = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let idx = u32::from_le_bytes(take(&mut pos, 4)?.try_into().ok()?) as usize;
                let len = u32::from_le_bytes(take(&mut pos, 4)?.try_into().ok()?) as usize;
                let (val, _) = Value::decode(take(&mut pos, len)?)?;
                cols.push((idx, val));
            }
            Some(DeltaChange::Update(cols))
        }
        1 => Some(DeltaChange::Delete),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        rowset::mem::MemRowSet,
        schema::{ColumnId, ColumnSchema, DataType},
    };

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
    fn flush_then_scan_matches_pre_flush_scan() {
        let schema = schema();
        let mrs = MemRowSet::new();
        mrs.insert(&schema, Timestamp::new(1), row(1, 100), 1).unwrap();
        mrs.insert(&schema, Timestamp::new(2), row(2, 200), 2).unwrap();

        let mut snap = Snapshot::at(Timestamp::new(3));
        snap.widen_with([Timestamp::new(1), Timestamp::new(2)]);

        let pre_flush = mrs.scan(&snap, false);
        let export = mrs.export_for_flush();
        let drs = DiskRowSet::from_mem_rowset(1, &schema, snap.clone(), export);
        let post_flush = drs.scan(&snap, false);

        assert_eq!(pre_flush.len(), post_flush.len());
        for (a, b) in pre_flush.iter().zip(post_flush.iter()) {
            assert_eq!(a.key, b.key);
            assert_eq!(a.row.values, b.row.values);
        }
    }

    #[test]
    fn bounds_reflect_min_max_key() {
        let schema = schema();
        let mrs = MemRowSet::new();
        mrs.insert(&schema, Timestamp::new(1), row(5, 1), 1).unwrap();
        mrs.insert(&schema, Timestamp::new(1), row(1, 1), 2).unwrap();
        mrs.insert(&schema, Timestamp::new(1), row(9, 1), 3).unwrap();
        let mut snap = Snapshot::at(Timestamp::new(2));
        snap.widen_with([Timestamp::new(1)]);
        let drs = DiskRowSet::from_mem_rowset(1, &schema, snap, mrs.export_for_flush());
        let (min, max) = drs.bounds().unwrap();
        assert_eq!(min, row(1, 1).encode_key(&schema));
        assert_eq!(max, row(9, 1).encode_key(&schema));
    }

    #[test]
    fn bloom_never_false_negatives() {
        let schema = schema();
        let mrs = MemRowSet::new();
        mrs.insert(&schema, Timestamp::new(1), row(42, 1), 1).unwrap();
        let mut snap = Snapshot::at(Timestamp::new(2));
        snap.widen_with([Timestamp::new(1)]);
        let drs = DiskRowSet::from_mem_rowset(1, &schema, snap, mrs.export_for_flush());
        let key = row(42, 1).encode_key(&schema);
        assert!(drs.might_contain_key(&key));
    }
}
