/*
 * Created on Thu Jan 25 2024
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
 * Presents an ordered `SegmentSequence` over a directory of WAL segment
 * files, plus a by-op-index lookup built while scanning. Segment file
 * names are `<sequence>.wal`; sequence numbers are contiguous starting at
 * 1 — a gap is a corruption, not a missing-file condition to paper over.
 */

use {
    crate::{
        error::{Error, ErrorKind, RuntimeResult, StorageError},
        wal::{
            entry::Entry,
            segment::{SegmentFooter, SegmentReader, SegmentWriter},
        },
    },
    std::{
        collections::BTreeMap,
        path::{Path, PathBuf},
    },
};

fn segment_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("{seq}.wal"))
}

#[derive(Debug, Clone)]
struct SegmentMeta {
    sequence: u64,
    footer: Option<SegmentFooter>,
}

/// A decoded `(op_index -> location)` entry, used by `ReadReplicatesInRange`
/// to avoid rescanning every segment on every read.
#[derive(Debug, Clone, Copy)]
struct LogLocation {
    segment_seq: u64,
    offset_in_segment: u64,
}

/// Owns the directory of WAL segments for one tablet: the ordered
/// `SegmentSequence`, the active (still-open) writer, and the
/// op-index-to-location log index built during recovery scan.
pub struct SegmentSequence {
    dir: PathBuf,
    segments: Vec<SegmentMeta>,
    index: BTreeMap<u64, LogLocation>,
    active_writer: Option<SegmentWriter>,
    roll_threshold_bytes: u64,
}

impl SegmentSequence {
    /// Open (or initialize empty) the segment sequence rooted at `dir`,
    /// scanning every segment to rebuild the log index. Returns the
    /// sequence plus every successfully-decoded entry, in log order, for
    /// the bootstrap replay pass to consume.
    pub fn open(dir: impl Into<PathBuf>, roll_threshold_bytes: u64) -> RuntimeResult<(Self, Vec<Entry>)> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let mut seqs = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".wal") {
                if let Ok(seq) = stem.parse::<u64>() {
                    seqs.push(seq);
                }
            }
        }
        seqs.sort_unstable();
        for (expected, actual) in (1..).zip(seqs.iter()) {
            if expected != *actual {
                return Err(StorageError::WalSegmentSequenceGap.into());
            }
        }

        let mut segments = Vec::new();
        let mut index = BTreeMap::new();
        let mut replay = Vec::new();
        for (i, seq) in seqs.iter().enumerate() {
            let mut reader = SegmentReader::open(segment_path(&dir, *seq))?;
            let scan = reader.scan()?;
            let is_last = i + 1 == seqs.len();
            if scan.truncated && !is_last {
                // corruption in a non-tail segment is fatal to bootstrap;
                // only the trailing entries of the last segment tolerate a
                // torn write.
                return Err(StorageError::WalCrcMismatch.into());
            }
            for batch in &scan.batches {
                for entry in &batch.entries {
                    index.insert(
                        entry.op_index(),
                        LogLocation {
                            segment_seq: *seq,
                            offset_in_segment: batch.offset,
                        },
                    );
                    replay.push(entry.clone());
                }
            }
            let _ = is_last;
            segments.push(SegmentMeta {
                sequence: *seq,
                footer: scan.footer,
            });
        }

        // the active writer (if any) is reopened lazily on first append,
        // to avoid holding both a reader and a writer on the tail segment
        // during this scan.
        Ok((
            Self {
                dir,
                segments,
                index,
                active_writer: None,
                roll_threshold_bytes,
            },
            replay,
        ))
    }

    /// `GetSegmentsSnapshot()`.
    pub fn segments_snapshot(&self) -> Vec<u64> {
        self.segments.iter().map(|s| s.sequence).collect()
    }

    fn next_sequence(&self) -> u64 {
        self.segments.last().map(|s| s.sequence + 1).unwrap_or(1)
    }

    fn ensure_writer_open(&mut self) -> RuntimeResult<()> {
        if self.active_writer.is_some() {
            return Ok(());
        }
        let seq = self.next_sequence();
        let writer = SegmentWriter::create(segment_path(&self.dir, seq), seq)?;
        self.segments.push(SegmentMeta {
            sequence: seq,
            footer: None,
        });
        self.active_writer = Some(writer);
        Ok(())
    }

    /// Append one batch, rolling to a fresh segment first if the active
    /// one has reached the configured roll threshold.
    pub fn append_batch(&mut self, entries: &[Entry]) -> RuntimeResult<()> {
        self.ensure_writer_open()?;
        if self.active_writer.as_ref().unwrap().offset() >= self.roll_threshold_bytes {
            self.roll()?;
            self.ensure_writer_open()?;
        }
        let writer = self.active_writer.as_mut().unwrap();
        let seq = writer.sequence;
        let offset = writer.write_batch(entries)?;
        for e in entries {
            self.index.insert(
                e.op_index(),
                LogLocation {
                    segment_seq: seq,
                    offset_in_segment: offset,
                },
            );
        }
        Ok(())
    }

    fn roll(&mut self) -> RuntimeResult<()> {
        if let Some(writer) = self.active_writer.take() {
            let seq = writer.sequence;
            let footer = writer.close()?;
            if let Some(meta) = self.segments.iter_mut().find(|s| s.sequence == seq) {
                meta.footer = Some(footer);
            }
        }
        Ok(())
    }

    /// `ReadReplicatesInRange(first, last, max_bytes)`.
    ///
    /// The first matching entry is always included even if it alone
    /// exceeds `max_bytes`.
    pub fn read_replicates_in_range(
        &self,
        first: u64,
        last: u64,
        max_bytes: usize,
    ) -> RuntimeResult<Vec<Entry>> {
        let mut out = Vec::new();
        let mut bytes = 0usize;
        // group requested indexes by segment to avoid reopening a reader
        // per entry
        let mut by_segment: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
        for (&idx, loc) in self.index.range(first..=last) {
            by_segment.entry(loc.segment_seq).or_default().push(idx);
        }
        'outer: for (seq, _) in by_segment {
            let mut reader = SegmentReader::open(segment_path(&self.dir, seq))?;
            let scan = reader.scan()?;
            for batch in scan.batches {
                for entry in batch.entries {
                    if let Entry::Replicate { op_index, .. } = &entry {
                        if *op_index < first || *op_index > last {
                            continue;
                        }
                        let size = entry.encode().len();
                        if !out.is_empty() && bytes + size > max_bytes {
                            break 'outer;
                        }
                        bytes += size;
                        out.push(entry);
                    }
                }
            }
        }
        Ok(out)
    }

    /// `TrimSegmentsUpToAndIncluding(seq)`: remove fully-obsolete closed
    /// segments at or below `seq`.
    pub fn trim_up_to_and_including(&mut self, seq: u64) -> RuntimeResult<()> {
        let mut retained = Vec::new();
        for meta in std::mem::take(&mut self.segments) {
            if meta.sequence <= seq && meta.footer.is_some() {
                std::fs::remove_file(segment_path(&self.dir, meta.sequence))?;
                self.index.retain(|_, loc| loc.segment_seq != meta.sequence);
            } else {
                retained.push(meta);
            }
        }
        self.segments = retained;
        Ok(())
    }

    /// `AppendEmptySegment(seg)`: force-roll to a new, empty segment
    /// regardless of the current size threshold.
    pub fn append_empty_segment(&mut self) -> RuntimeResult<u64> {
        self.roll()?;
        self.ensure_writer_open()?;
        Ok(self.active_writer.as_ref().unwrap().sequence)
    }

    /// `ReplaceLastSegment(seg)`: discard the current (unclosed) tail
    /// segment and start a fresh one in its place, used after bootstrap
    /// truncates a torn tail.
    pub fn replace_last_segment(&mut self) -> RuntimeResult<u64> {
        if let Some(last) = self.segments.last().cloned() {
            if self.active_writer.as_ref().map(|w| w.sequence) == Some(last.sequence) {
                self.active_writer = None;
            }
            std::fs::remove_file(segment_path(&self.dir, last.sequence))?;
            self.segments.pop();
            self.index.retain(|_, loc| loc.segment_seq != last.sequence);
        }
        self.ensure_writer_open()?;
        Ok(self.active_writer.as_ref().unwrap().sequence)
    }

    pub fn earliest_op_index(&self) -> Option<u64> {
        self.index.keys().next().copied()
    }

    pub fn latest_op_index(&self) -> Option<u64> {
        self.index.keys().next_back().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replicate(i: u64) -> Entry {
        Entry::Replicate {
            op_index: i,
            payload: vec![0u8; 4],
        }
    }

    #[test]
    fn append_and_read_range() {
        let dir = tempfile::tempdir().unwrap();
        let (mut seq, replay) = SegmentSequence::open(dir.path(), 1024 * 1024).unwrap();
        assert!(replay.is_empty());
        for i in 1..=5u64 {
            seq.append_batch(&[replicate(i), Entry::Commit { op_index: i }])
                .unwrap();
        }
        let replicates = seq.read_replicates_in_range(2, 4, usize::MAX).unwrap();
        let indexes: Vec<u64> = replicates.iter().map(|e| e.op_index()).collect();
        assert_eq!(indexes, vec![2, 3, 4]);
    }

    #[test]
    fn rolls_at_size_threshold_and_reopens_with_contiguous_sequence() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut seq, _) = SegmentSequence::open(dir.path(), 16).unwrap();
            for i in 1..=20u64 {
                seq.append_batch(&[replicate(i)]).unwrap();
            }
            seq.roll().unwrap();
            assert!(seq.segments_snapshot().len() > 1);
        }
        let (seq2, replay) = SegmentSequence::open(dir.path(), 16).unwrap();
        assert_eq!(replay.len(), 20);
        let snap = seq2.segments_snapshot();
        for (expected, actual) in (1..).zip(snap.iter()) {
            assert_eq!(expected, *actual);
        }
    }

    #[test]
    fn trim_removes_closed_segments_and_their_index_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut seq = {
            let (mut seq, _) = SegmentSequence::open(dir.path(), 16).unwrap();
            for i in 1..=20u64 {
                seq.append_batch(&[replicate(i)]).unwrap();
            }
            seq.roll().unwrap();
            seq
        };
        let first_closed = seq
            .segments
            .iter()
            .find(|s| s.footer.is_some())
            .unwrap()
            .sequence;
        seq.trim_up_to_and_including(first_closed).unwrap();
        assert!(!seq.segments_snapshot().contains(&first_closed));
    }
}
