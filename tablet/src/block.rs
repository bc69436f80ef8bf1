/*
 * Created on Tue Jan 23 2024
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
 * A container is a pair of files sharing a stem: `<id>.data` holds raw
 * block bytes back to back, `<id>.metadata` holds an append-only log of
 * CREATE/DELETE records describing what lives in `.data` and where.
 * Deleting a block punches a hole in `.data` (so the file's apparent size
 * never shrinks, but its disk usage does) and appends a DELETE record.
 */

use {
    crate::{
        checksum::crc32c,
        error::{Error, ErrorKind, RuntimeResult, StorageError},
    },
    std::{
        collections::HashMap,
        fs::{File, OpenOptions},
        io::{Read, Seek, SeekFrom, Write},
        path::{Path, PathBuf},
        sync::atomic::{AtomicU64, Ordering},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u64);

const METADATA_RECORD_TAG_CREATE: u8 = 1;
const METADATA_RECORD_TAG_DELETE: u8 = 2;

/// One entry in a container's `.metadata` log.
#[derive(Debug, Clone, Copy)]
enum MetaRecord {
    Create {
        block_id: BlockId,
        offset: u64,
        length: u64,
    },
    Delete {
        block_id: BlockId,
    },
}

impl MetaRecord {
    /// `tag(1) + block_id(8) [+ offset(8) + length(8)] + crc32c(4)`
    fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(25);
        match *self {
            Self::Create {
                block_id,
                offset,
                length,
            } => {
                body.push(METADATA_RECORD_TAG_CREATE);
                body.extend_from_slice(&block_id.0.to_le_bytes());
                body.extend_from_slice(&offset.to_le_bytes());
                body.extend_from_slice(&length.to_le_bytes());
            }
            Self::Delete { block_id } => {
                body.push(METADATA_RECORD_TAG_DELETE);
                body.extend_from_slice(&block_id.0.to_le_bytes());
            }
        }
        let crc = crc32c(&body);
        body.extend_from_slice(&crc.to_le_bytes());
        body
    }

    const CREATE_LEN: usize = 1 + 8 + 8 + 8 + 4;
    const DELETE_LEN: usize = 1 + 8 + 4;

    /// Decode one record starting at `buf[0]`. Returns the record and the
    /// number of bytes consumed, or `None` if `buf` does not hold a
    /// complete, checksum-valid record (a truncated trailing metadata
    /// record).
    fn decode(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.is_empty() {
            return None;
        }
        let (len, rec) = match buf[0] {
            METADATA_RECORD_TAG_CREATE => {
                if buf.len() < Self::CREATE_LEN {
                    return None;
                }
                let block_id = BlockId(u64::from_le_bytes(buf[1..9].try_into().unwrap()));
                let offset = u64::from_le_bytes(buf[9..17].try_into().unwrap());
                let length = u64::from_le_bytes(buf[17..25].try_into().unwrap());
                (
                    Self::CREATE_LEN,
                    Self::Create {
                        block_id,
                        offset,
                        length,
                    },
                )
            }
            METADATA_RECORD_TAG_DELETE => {
                if buf.len() < Self::DELETE_LEN {
                    return None;
                }
                let block_id = BlockId(u64::from_le_bytes(buf[1..9].try_into().unwrap()));
                (Self::DELETE_LEN, Self::Delete { block_id })
            }
            _ => return None,
        };
        let crc_off = len - 4;
        let expected = u32::from_le_bytes(buf[crc_off..len].try_into().unwrap());
        if crc32c(&buf[..crc_off]) != expected {
            return None;
        }
        Some((rec, len))
    }
}

#[derive(Debug, Clone, Copy)]
struct LiveBlock {
    offset: u64,
    length: u64,
}

/// One open container: a `.data`/`.metadata` file pair plus the decoded
/// live-block index recovered from the metadata log.
struct Container {
    data: File,
    metadata: File,
    live: HashMap<BlockId, LiveBlock>,
    data_len: u64,
}

impl Container {
    fn paths(dir: &Path, stem: u64) -> (PathBuf, PathBuf) {
        (
            dir.join(format!("{stem}.data")),
            dir.join(format!("{stem}.metadata")),
        )
    }

    /// Create a brand new, empty container.
    fn create(dir: &Path, stem: u64) -> RuntimeResult<Self> {
        let (data_path, meta_path) = Self::paths(dir, stem);
        let data = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&data_path)?;
        let metadata = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&meta_path)?;
        Ok(Self {
            data,
            metadata,
            live: HashMap::new(),
            data_len: 0,
        })
    }

    /// Open and recover an existing container, applying the five crash
    /// recovery cases.
    fn open(dir: &Path, stem: u64, alignment: u64) -> RuntimeResult<Self> {
        let (data_path, meta_path) = Self::paths(dir, stem);
        let data_exists = data_path.exists();
        let meta_exists = meta_path.exists();
        if data_exists != meta_exists {
            // case 1: incomplete container (one half missing)
            return Err(StorageError::ContainerIncomplete.into());
        }
        let mut data = OpenOptions::new().read(true).write(true).open(&data_path)?;
        let mut metadata = OpenOptions::new().read(true).write(true).open(&meta_path)?;

        let mut meta_buf = Vec::new();
        metadata.read_to_end(&mut meta_buf)?;

        let mut live: HashMap<BlockId, LiveBlock> = HashMap::new();
        // every range a DELETE record ever pointed at, remembered before
        // it's folded out of `live`, so a punch that didn't make it to
        // disk before a crash can be re-issued below.
        let mut deleted: Vec<LiveBlock> = Vec::new();
        let mut cursor = 0usize;
        let mut max_extent = 0u64;
        while cursor < meta_buf.len() {
            match MetaRecord::decode(&meta_buf[cursor..]) {
                Some((rec, consumed)) => {
                    match rec {
                        MetaRecord::Create {
                            block_id,
                            offset,
                            length,
                        } => {
                            if offset % alignment != 0 {
                                // case 5: misaligned block
                                return Err(StorageError::ContainerMisalignedBlock.into());
                            }
                            max_extent = max_extent.max(offset + length);
                            live.insert(block_id, LiveBlock { offset, length });
                        }
                        MetaRecord::Delete { block_id } => {
                            if let Some(block) = live.remove(&block_id) {
                                deleted.push(block);
                            }
                        }
                    }
                    cursor += consumed;
                }
                None => {
                    // case 2: truncated trailing metadata record. Whatever
                    // partial bytes remain did not make it to disk intact;
                    // drop them and trim the file to the last valid record.
                    metadata.set_len(cursor as u64)?;
                    metadata.seek(SeekFrom::End(0))?;
                    break;
                }
            }
        }

        let actual_len = data.seek(SeekFrom::End(0))?;
        if actual_len > max_extent {
            // case 3: preallocated-but-unwritten tail. Trust only the
            // trailing zero region past the last recorded CREATE extent;
            // anything non-zero there would mean an extent record is
            // itself missing, which is a harder corruption we don't try
            // to paper over.
            let mut tail = vec![0u8; (actual_len - max_extent) as usize];
            data.seek(SeekFrom::Start(max_extent))?;
            data.read_exact(&mut tail)?;
            if tail.iter().any(|&b| b != 0) {
                return Err(StorageError::ContainerIncomplete.into());
            }
            data.set_len(max_extent)?;
        }
        data.seek(SeekFrom::End(0))?;

        // case 4: a deleted block whose bytes were never actually
        // hole-punched (crash between the DELETE record's append and the
        // punch syscall). Re-issuing the punch is idempotent against an
        // already-punched or already-zeroed range, so just redo it for
        // every DELETE the metadata log recorded.
        for block in &deleted {
            punch_hole(&data, block.offset, block.length)?;
        }

        Ok(Self {
            data,
            metadata,
            live,
            data_len: max_extent,
        })
    }

    fn append_meta(&mut self, rec: &MetaRecord) -> RuntimeResult<()> {
        let buf = rec.encode();
        self.metadata.write_all(&buf)?;
        self.metadata.sync_data()?;
        Ok(())
    }

    fn write_block(&mut self, id: BlockId, bytes: &[u8], alignment: u64) -> RuntimeResult<()> {
        let offset = align_up(self.data_len, alignment);
        if offset > self.data_len {
            self.data.set_len(offset)?;
        }
        self.data.seek(SeekFrom::Start(offset))?;
        self.data.write_all(bytes)?;
        self.data.sync_data()?;
        self.append_meta(&MetaRecord::Create {
            block_id: id,
            offset,
            length: bytes.len() as u64,
        })?;
        self.live.insert(
            id,
            LiveBlock {
                offset,
                length: bytes.len() as u64,
            },
        );
        self.data_len = offset + bytes.len() as u64;
        Ok(())
    }

    fn read_block(&mut self, id: BlockId) -> RuntimeResult<Vec<u8>> {
        let block = *self
            .live
            .get(&id)
            .ok_or_else(|| Error::with_kind(ErrorKind::NotFound))?;
        let mut buf = vec![0u8; block.length as usize];
        self.data.seek(SeekFrom::Start(block.offset))?;
        self.data.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn delete_block(&mut self, id: BlockId) -> RuntimeResult<()> {
        let block = self
            .live
            .remove(&id)
            .ok_or_else(|| Error::with_kind(ErrorKind::NotFound))?;
        punch_hole(&self.data, block.offset, block.length)?;
        self.append_meta(&MetaRecord::Delete { block_id: id })?;
        Ok(())
    }
}

fn align_up(v: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return v;
    }
    (v + alignment - 1) / alignment * alignment
}

#[cfg(unix)]
fn punch_hole(file: &File, offset: u64, length: u64) -> RuntimeResult<()> {
    use std::os::unix::io::AsRawFd;
    // best-effort: not every filesystem supports FALLOC_FL_PUNCH_HOLE.
    // Fall back to zero-filling the range so the on-disk invariant ("a
    // deleted block's bytes read as zero") holds regardless.
    const FALLOC_FL_PUNCH_HOLE: i32 = 0x02;
    const FALLOC_FL_KEEP_SIZE: i32 = 0x01;
    let rc = unsafe {
        libc::fallocate(
            file.as_raw_fd(),
            FALLOC_FL_PUNCH_HOLE | FALLOC_FL_KEEP_SIZE,
            offset as libc::off_t,
            length as libc::off_t,
        )
    };
    if rc == 0 {
        return Ok(());
    }
    zero_fill(file, offset, length)
}

#[cfg(not(unix))]
fn punch_hole(file: &File, offset: u64, length: u64) -> RuntimeResult<()> {
    zero_fill(file, offset, length)
}

fn zero_fill(file: &File, offset: u64, length: u64) -> RuntimeResult<()> {
    let mut file = file.try_clone()?;
    file.seek(SeekFrom::Start(offset))?;
    let zeros = vec![0u8; length as usize];
    file.write_all(&zeros)?;
    file.sync_data()?;
    Ok(())
}

/// Manages a directory of containers and hands out globally monotone
/// block ids across all of them.
pub struct BlockManager {
    dir: PathBuf,
    alignment: u64,
    next_block_id: AtomicU64,
    next_container_stem: AtomicU64,
    containers: parking_lot::Mutex<HashMap<u64, Container>>,
    block_to_container: parking_lot::Mutex<HashMap<BlockId, u64>>,
    active_container: parking_lot::Mutex<u64>,
    container_soft_limit_bytes: u64,
}

impl BlockManager {
    /// Open (creating if empty) a block manager rooted at `dir`, recovering
    /// every existing container found there.
    pub fn open(dir: impl Into<PathBuf>, alignment: u64, container_soft_limit_bytes: u64) -> RuntimeResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let mut stems = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".data") {
                if let Ok(stem) = stem.parse::<u64>() {
                    stems.push(stem);
                }
            }
        }
        stems.sort_unstable();

        let mut containers = HashMap::new();
        let mut block_to_container = HashMap::new();
        let mut max_block_id = 0u64;
        for stem in &stems {
            let container = Container::open(&dir, *stem, alignment)?;
            for id in container.live.keys() {
                block_to_container.insert(*id, *stem);
                max_block_id = max_block_id.max(id.0);
            }
            containers.insert(*stem, container);
        }

        let active_stem = *stems.last().unwrap_or(&0);
        if containers.is_empty() {
            containers.insert(0, Container::create(&dir, 0)?);
        }

        Ok(Self {
            dir,
            alignment,
            next_block_id: AtomicU64::new(max_block_id + 1),
            next_container_stem: AtomicU64::new(stems.last().map(|s| s + 1).unwrap_or(1)),
            containers: parking_lot::Mutex::new(containers),
            block_to_container: parking_lot::Mutex::new(block_to_container),
            active_container: parking_lot::Mutex::new(active_stem),
            container_soft_limit_bytes,
        })
    }

    /// Write `bytes` as a new, immutable block. Returns its freshly
    /// allocated id.
    pub fn create_block(&self, bytes: &[u8]) -> RuntimeResult<BlockId> {
        let id = BlockId(self.next_block_id.fetch_add(1, Ordering::SeqCst));
        let mut active = self.active_container.lock();
        let mut containers = self.containers.lock();
        let needs_roll = containers
            .get(&*active)
            .map(|c| c.data_len >= self.container_soft_limit_bytes)
            .unwrap_or(true);
        if needs_roll {
            let stem = self.next_container_stem.fetch_add(1, Ordering::SeqCst);
            containers.insert(stem, Container::create(&self.dir, stem)?);
            *active = stem;
        }
        let container = containers.get_mut(&*active).expect("active container must exist");
        container.write_block(id, bytes, self.alignment)?;
        self.block_to_container.lock().insert(id, *active);
        Ok(id)
    }

    pub fn read_block(&self, id: BlockId) -> RuntimeResult<Vec<u8>> {
        let stem = *self
            .block_to_container
            .lock()
            .get(&id)
            .ok_or_else(|| Error::with_kind(ErrorKind::NotFound))?;
        let mut containers = self.containers.lock();
        let container = containers
            .get_mut(&stem)
            .ok_or_else(|| Error::with_kind(ErrorKind::NotFound))?;
        container.read_block(id)
    }

    pub fn delete_block(&self, id: BlockId) -> RuntimeResult<()> {
        let stem = self
            .block_to_container
            .lock()
            .remove(&id)
            .ok_or_else(|| Error::with_kind(ErrorKind::NotFound))?;
        let mut containers = self.containers.lock();
        let container = containers
            .get_mut(&stem)
            .ok_or_else(|| Error::with_kind(ErrorKind::NotFound))?;
        container.delete_block(id)
    }

    /// All block ids currently live across every container, for bootstrap
    /// reconciliation against rowset metadata.
    pub fn all_blocks(&self) -> Vec<BlockId> {
        self.block_to_container.lock().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_read_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = BlockManager::open(dir.path(), 4096, 16 * 1024 * 1024).unwrap();
        let id = mgr.create_block(b"hello world").unwrap();
        assert_eq!(mgr.read_block(id).unwrap(), b"hello world");
        mgr.delete_block(id).unwrap();
        assert!(mgr.read_block(id).is_err());
    }

    #[test]
    fn block_ids_are_globally_monotone() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = BlockManager::open(dir.path(), 4096, 16 * 1024 * 1024).unwrap();
        let a = mgr.create_block(b"a").unwrap();
        let b = mgr.create_block(b"b").unwrap();
        assert!(b.0 > a.0);
    }

    #[test]
    fn recovers_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let mgr = BlockManager::open(dir.path(), 4096, 16 * 1024 * 1024).unwrap();
            let id = mgr.create_block(b"persisted").unwrap();
            id
        };
        let mgr2 = BlockManager::open(dir.path(), 4096, 16 * 1024 * 1024).unwrap();
        assert_eq!(mgr2.read_block(id).unwrap(), b"persisted");
    }

    #[test]
    fn truncated_trailing_metadata_record_is_dropped_on_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let stem;
        {
            let mgr = BlockManager::open(dir.path(), 4096, 16 * 1024 * 1024).unwrap();
            mgr.create_block(b"whole").unwrap();
            stem = *mgr.active_container.lock();
        }
        let meta_path = dir.path().join(format!("{stem}.metadata"));
        let mut f = OpenOptions::new().append(true).open(&meta_path).unwrap();
        f.write_all(&[METADATA_RECORD_TAG_CREATE, 9, 9, 9]).unwrap();
        drop(f);
        // should recover cleanly, dropping the torn trailing bytes
        let mgr2 = BlockManager::open(dir.path(), 4096, 16 * 1024 * 1024).unwrap();
        assert_eq!(mgr2.all_blocks().len(), 1);
    }

    #[test]
    fn unpunched_delete_tail_is_repunched_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let (stem, id, data_path, offset, length) = {
            let mgr = BlockManager::open(dir.path(), 4096, 16 * 1024 * 1024).unwrap();
            let id = mgr.create_block(b"gone-but-not-punched").unwrap();
            let stem = *mgr.active_container.lock();
            let (offset, length) = {
                let containers = mgr.containers.lock();
                let block = containers.get(&stem).unwrap().live[&id];
                (block.offset, block.length)
            };
            let data_path = dir.path().join(format!("{stem}.data"));
            // simulate a crash between the DELETE record landing and the
            // punch syscall running: append the DELETE but leave the data
            // bytes in place.
            mgr.block_to_container.lock().remove(&id);
            let mut containers = mgr.containers.lock();
            let container = containers.get_mut(&stem).unwrap();
            container.live.remove(&id);
            container
                .append_meta(&MetaRecord::Delete { block_id: id })
                .unwrap();
            drop(containers);
            (stem, id, data_path, offset, length)
        };
        let mut raw = vec![0u8; length as usize];
        {
            let mut f = File::open(&data_path).unwrap();
            f.seek(SeekFrom::Start(offset)).unwrap();
            f.read_exact(&mut raw).unwrap();
        }
        assert!(raw.iter().any(|&b| b != 0), "test setup should leave unpunched bytes");

        let mgr2 = BlockManager::open(dir.path(), 4096, 16 * 1024 * 1024).unwrap();
        assert!(mgr2.read_block(id).is_err());
        let _ = stem;
        let mut after = vec![0u8; length as usize];
        let mut f = File::open(&data_path).unwrap();
        f.seek(SeekFrom::Start(offset)).unwrap();
        f.read_exact(&mut after).unwrap();
        assert!(after.iter().all(|&b| b == 0), "delete tail must be punched on reopen");
    }
}
