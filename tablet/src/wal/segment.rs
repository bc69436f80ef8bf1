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
 * WAL segment I/O: a magic-prefixed header, a sequence of checksummed
 * entry batches, and (once closed) a footer summarizing the segment for
 * fast reopen. The batch header carries an explicit `msg_len_comp` field
 * so a compression codec can be slotted in later without changing the
 * on-disk shape; no codec is wired up yet, so `msg_len_comp == msg_len`
 * always.
 */

use {
    crate::{
        checksum::crc32c,
        error::{RuntimeResult, StorageError},
        wal::entry::Entry,
    },
    std::{
        fs::{File, OpenOptions},
        io::{Read, Seek, SeekFrom, Write},
        path::Path,
    },
};

pub const SEGMENT_MAGIC: &[u8; 8] = b"TBLTWAL1";
pub const FOOTER_MAGIC: &[u8; 8] = b"TBLTFOOT";
const BATCH_HEADER_LEN: usize = 16;

#[derive(Debug, Clone, Copy)]
pub struct SegmentHeader {
    pub sequence: u64,
}

impl SegmentHeader {
    fn encode(&self) -> Vec<u8> {
        self.sequence.to_le_bytes().to_vec()
    }
    fn decode(buf: &[u8]) -> RuntimeResult<Self> {
        if buf.len() != 8 {
            return Err(StorageError::WalBadMagic.into());
        }
        Ok(Self {
            sequence: u64::from_le_bytes(buf.try_into().unwrap()),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentFooter {
    pub entry_count: u64,
    pub min_op_index: u64,
    pub max_op_index: u64,
}

impl SegmentFooter {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24);
        out.extend_from_slice(&self.entry_count.to_le_bytes());
        out.extend_from_slice(&self.min_op_index.to_le_bytes());
        out.extend_from_slice(&self.max_op_index.to_le_bytes());
        out
    }
    fn decode(buf: &[u8]) -> RuntimeResult<Self> {
        if buf.len() != 24 {
            return Err(StorageError::WalFooterMissing.into());
        }
        Ok(Self {
            entry_count: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            min_op_index: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            max_op_index: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
        })
    }
}

/// One decoded batch plus the file offset it started at, used by the
/// log-index to map an op index to `(segment, offset)`.
pub struct ScannedBatch {
    pub offset: u64,
    pub entries: Vec<Entry>,
}

/// An append-only writer for one segment file. Rolling to a new segment is
/// the log layer's responsibility.
pub struct SegmentWriter {
    file: File,
    pub sequence: u64,
    offset: u64,
    entry_count: u64,
    min_op_index: Option<u64>,
    max_op_index: Option<u64>,
    closed: bool,
}

impl SegmentWriter {
    pub fn create(path: impl AsRef<Path>, sequence: u64) -> RuntimeResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        let header = SegmentHeader { sequence };
        let header_bytes = header.encode();
        let header_crc = crc32c(&header_bytes);
        file.write_all(SEGMENT_MAGIC)?;
        file.write_all(&(header_bytes.len() as u32).to_be_bytes())?;
        file.write_all(&header_crc.to_be_bytes())?;
        file.write_all(&header_bytes)?;
        let offset = file.stream_position()?;
        Ok(Self {
            file,
            sequence,
            offset,
            entry_count: 0,
            min_op_index: None,
            max_op_index: None,
            closed: false,
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Append one batch of entries, fsync'd before returning. The caller is
    /// expected to run this off the critical path via a dedicated append
    /// pool, not inline on the hot path.
    pub fn write_batch(&mut self, entries: &[Entry]) -> RuntimeResult<u64> {
        let mut prev_index = None;
        for e in entries {
            if let Some(prev) = prev_index {
                if e.op_index() <= prev {
                    return Err(StorageError::WalEntryIndexOutOfOrder.into());
                }
            }
            prev_index = Some(e.op_index());
            self.min_op_index = Some(self.min_op_index.map_or(e.op_index(), |m| m.min(e.op_index())));
            self.max_op_index = Some(self.max_op_index.map_or(e.op_index(), |m| m.max(e.op_index())));
        }
        let mut payload = Vec::new();
        for e in entries {
            payload.extend_from_slice(&e.encode());
        }
        let msg_len = payload.len() as u32;
        let msg_len_comp = msg_len; // no compression codec wired up yet
        let msg_crc = crc32c(&payload);
        let mut header = Vec::with_capacity(12);
        header.extend_from_slice(&msg_len.to_le_bytes());
        header.extend_from_slice(&msg_len_comp.to_le_bytes());
        header.extend_from_slice(&msg_crc.to_le_bytes());
        let header_crc = crc32c(&header);

        let batch_offset = self.offset;
        self.file.write_all(&header)?;
        self.file.write_all(&header_crc.to_le_bytes())?;
        self.file.write_all(&payload)?;
        self.file.sync_data()?;
        self.offset += BATCH_HEADER_LEN as u64 + payload.len() as u64;
        self.entry_count += entries.len() as u64;
        Ok(batch_offset)
    }

    /// Append the footer and mark this segment closed to further writes.
    pub fn close(mut self) -> RuntimeResult<SegmentFooter> {
        let footer = SegmentFooter {
            entry_count: self.entry_count,
            min_op_index: self.min_op_index.unwrap_or(0),
            max_op_index: self.max_op_index.unwrap_or(0),
        };
        let footer_bytes = footer.encode();
        let footer_crc = crc32c(&footer_bytes);
        self.file.write_all(FOOTER_MAGIC)?;
        self.file.write_all(&(footer_bytes.len() as u32).to_be_bytes())?;
        self.file.write_all(&footer_crc.to_be_bytes())?;
        self.file.write_all(&footer_bytes)?;
        self.file.sync_all()?;
        self.closed = true;
        Ok(footer)
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        // an un-closed segment is exactly the "open at crash time" case;
        // bootstrap reconstructs its footer by scanning (see `open_for_scan`).
        let _ = &self.closed;
    }
}

/// Scan a segment file front to back, stopping at the first batch that
/// fails its checksum or is truncated. Whether a trailing truncation is
/// tolerated or fatal to bootstrap is a policy decision left to the
/// caller, not made here.
pub struct SegmentReader {
    file: File,
    pub sequence: u64,
}

pub struct ScanResult {
    pub batches: Vec<ScannedBatch>,
    /// Offset immediately after the last successfully decoded batch.
    pub valid_prefix_len: u64,
    /// Whether a footer was present and validated.
    pub footer: Option<SegmentFooter>,
    /// Whether the scan stopped due to a corrupt/truncated batch rather
    /// than running cleanly into a (possibly absent) footer.
    pub truncated: bool,
}

impl SegmentReader {
    pub fn open(path: impl AsRef<Path>) -> RuntimeResult<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)?;
        if &magic != SEGMENT_MAGIC {
            return Err(StorageError::WalBadMagic.into());
        }
        let mut len_buf = [0u8; 4];
        file.read_exact(&mut len_buf)?;
        let header_len = u32::from_be_bytes(len_buf) as usize;
        let mut crc_buf = [0u8; 4];
        file.read_exact(&mut crc_buf)?;
        let header_crc = u32::from_be_bytes(crc_buf);
        let mut header_bytes = vec![0u8; header_len];
        file.read_exact(&mut header_bytes)?;
        if crc32c(&header_bytes) != header_crc {
            return Err(StorageError::WalCrcMismatch.into());
        }
        let header = SegmentHeader::decode(&header_bytes)?;
        Ok(Self {
            file,
            sequence: header.sequence,
        })
    }

    /// Scan every entry batch in the segment, returning a prefix-valid
    /// result even if the tail is corrupt or the file reads as an
    /// all-zero preallocated tail, which is treated as empty.
    pub fn scan(&mut self) -> RuntimeResult<ScanResult> {
        let data_start = self.file.stream_position()?;
        let file_len = self.file.seek(SeekFrom::End(0))?;
        self.file.seek(SeekFrom::Start(data_start))?;

        let mut batches = Vec::new();
        let mut cursor = data_start;
        let mut truncated = false;
        let mut footer = None;

        loop {
            if cursor >= file_len {
                break;
            }
            let remaining = file_len - cursor;
            if remaining < 8 {
                truncated = remaining != 0;
                break;
            }
            let mut peek = [0u8; 8];
            self.file.seek(SeekFrom::Start(cursor))?;
            self.file.read_exact(&mut peek)?;
            if &peek == FOOTER_MAGIC {
                footer = self.try_read_footer(cursor)?;
                break;
            }
            self.file.seek(SeekFrom::Start(cursor))?;
            match self.try_read_batch(cursor, remaining) {
                Some(batch) => {
                    cursor += BATCH_HEADER_LEN as u64 + batch.entries_len as u64;
                    batches.push(ScannedBatch {
                        offset: batch.offset,
                        entries: batch.entries,
                    });
                }
                None => {
                    truncated = !all_zero_from(&mut self.file, cursor, file_len)?;
                    break;
                }
            }
        }

        Ok(ScanResult {
            batches,
            valid_prefix_len: cursor,
            footer,
            truncated,
        })
    }

    fn try_read_footer(&mut self, offset: u64) -> RuntimeResult<Option<SegmentFooter>> {
        self.file.seek(SeekFrom::Start(offset + 8))?;
        let mut len_buf = [0u8; 4];
        if self.file.read_exact(&mut len_buf).is_err() {
            return Ok(None);
        }
        let footer_len = u32::from_be_bytes(len_buf) as usize;
        let mut crc_buf = [0u8; 4];
        if self.file.read_exact(&mut crc_buf).is_err() {
            return Ok(None);
        }
        let footer_crc = u32::from_be_bytes(crc_buf);
        let mut footer_bytes = vec![0u8; footer_len];
        if self.file.read_exact(&mut footer_bytes).is_err() {
            return Ok(None);
        }
        if crc32c(&footer_bytes) != footer_crc {
            return Ok(None);
        }
        Ok(SegmentFooter::decode(&footer_bytes).ok())
    }

    fn try_read_batch(&mut self, offset: u64, remaining: u64) -> Option<DecodedBatch> {
        if remaining < BATCH_HEADER_LEN as u64 {
            return None;
        }
        let mut header = [0u8; BATCH_HEADER_LEN];
        self.file.read_exact(&mut header).ok()?;
        let msg_len = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let msg_len_comp = u32::from_le_bytes(header[4..8].try_into().unwrap());
        let msg_crc = u32::from_le_bytes(header[8..12].try_into().unwrap());
        let header_crc = u32::from_le_bytes(header[12..16].try_into().unwrap());
        if crc32c(&header[0..12]) != header_crc {
            return None;
        }
        if remaining - BATCH_HEADER_LEN as u64 < msg_len_comp as u64 {
            return None;
        }
        let mut payload = vec![0u8; msg_len_comp as usize];
        self.file.read_exact(&mut payload).ok()?;
        if crc32c(&payload) != msg_crc {
            return None;
        }
        debug_assert_eq!(msg_len, msg_len_comp, "no compression codec implemented yet");
        let entries = Entry::decode_all(&payload)?;
        Some(DecodedBatch {
            offset,
            entries_len: payload.len(),
            entries,
        })
    }
}

struct DecodedBatch {
    offset: u64,
    entries_len: usize,
    entries: Vec<Entry>,
}

fn all_zero_from(file: &mut File, start: u64, end: u64) -> RuntimeResult<bool> {
    file.seek(SeekFrom::Start(start))?;
    let mut buf = vec![0u8; (end - start) as usize];
    file.read_exact(&mut buf)?;
    Ok(buf.iter().all(|&b| b == 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_scan_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1.wal");
        let mut writer = SegmentWriter::create(&path, 1).unwrap();
        writer
            .write_batch(&[
                Entry::Replicate {
                    op_index: 1,
                    payload: b"a".to_vec(),
                },
                Entry::Commit { op_index: 1 },
            ])
            .unwrap();
        writer
            .write_batch(&[Entry::Replicate {
                op_index: 2,
                payload: b"b".to_vec(),
            }])
            .unwrap();
        let footer = writer.close().unwrap();
        assert_eq!(footer.entry_count, 3);
        assert_eq!(footer.min_op_index, 1);
        assert_eq!(footer.max_op_index, 2);

        let mut reader = SegmentReader::open(&path).unwrap();
        let scan = reader.scan().unwrap();
        assert_eq!(scan.batches.len(), 2);
        assert!(!scan.truncated);
        assert_eq!(scan.footer.unwrap().entry_count, 3);
    }

    #[test]
    fn truncated_trailing_batch_is_tolerated_as_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1.wal");
        let mut writer = SegmentWriter::create(&path, 1).unwrap();
        writer
            .write_batch(&[Entry::Replicate {
                op_index: 1,
                payload: b"a".to_vec(),
            }])
            .unwrap();
        let good_len = writer.offset();
        writer
            .write_batch(&[Entry::Replicate {
                op_index: 2,
                payload: b"this will be torn off".to_vec(),
            }])
            .unwrap();
        drop(writer);

        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(good_len + 6).unwrap(); // tear the second batch mid-payload
        drop(f);

        let mut reader = SegmentReader::open(&path).unwrap();
        let scan = reader.scan().unwrap();
        assert_eq!(scan.batches.len(), 1);
        assert!(scan.truncated);
        assert_eq!(scan.valid_prefix_len, good_len);
    }
}
