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
 * WAL entry types: REPLICATE, COMMIT, and FLUSH-MARKER.
 */

use std::convert::TryInto;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    /// The op itself, not yet known to be committed.
    Replicate { op_index: u64, payload: Vec<u8> },
    /// Marks `op_index` (previously REPLICATEd) as committed.
    Commit { op_index: u64 },
    /// Emitted when an MRS flush folds ops `.. <= up_to_op_index` into a
    /// new DRS; bootstrap uses this to skip ops already reflected on disk.
    FlushMarker { up_to_op_index: u64 },
}

const TAG_REPLICATE: u8 = 1;
const TAG_COMMIT: u8 = 2;
const TAG_FLUSH_MARKER: u8 = 3;

impl Entry {
    pub fn op_index(&self) -> u64 {
        match *self {
            Self::Replicate { op_index, .. } => op_index,
            Self::Commit { op_index } => op_index,
            Self::FlushMarker { up_to_op_index } => up_to_op_index,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Self::Replicate { op_index, payload } => {
                out.push(TAG_REPLICATE);
                out.extend_from_slice(&op_index.to_le_bytes());
                out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
                out.extend_from_slice(payload);
            }
            Self::Commit { op_index } => {
                out.push(TAG_COMMIT);
                out.extend_from_slice(&op_index.to_le_bytes());
            }
            Self::FlushMarker { up_to_op_index } => {
                out.push(TAG_FLUSH_MARKER);
                out.extend_from_slice(&up_to_op_index.to_le_bytes());
            }
        }
        out
    }

    /// Decode one entry from the front of `buf`, returning it and the
    /// number of bytes consumed, or `None` if `buf` doesn't hold a
    /// complete entry.
    pub fn decode(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.is_empty() {
            return None;
        }
        match buf[0] {
            TAG_REPLICATE => {
                if buf.len() < 13 {
                    return None;
                }
                let op_index = u64::from_le_bytes(buf[1..9].try_into().unwrap());
                let len = u32::from_le_bytes(buf[9..13].try_into().unwrap()) as usize;
                if buf.len() < 13 + len {
                    return None;
                }
                let payload = buf[13..13 + len].to_vec();
                Some((Self::Replicate { op_index, payload }, 13 + len))
            }
            TAG_COMMIT => {
                if buf.len() < 9 {
                    return None;
                }
                let op_index = u64::from_le_bytes(buf[1..9].try_into().unwrap());
                Some((Self::Commit { op_index }, 9))
            }
            TAG_FLUSH_MARKER => {
                if buf.len() < 9 {
                    return None;
                }
                let up_to_op_index = u64::from_le_bytes(buf[1..9].try_into().unwrap());
                Some((Self::FlushMarker { up_to_op_index }, 9))
            }
            _ => None,
        }
    }

    /// Decode every entry packed into one batch payload. A batch may carry
    /// several entries back to back.
    pub fn decode_all(mut buf: &[u8]) -> Option<Vec<Self>> {
        let mut entries = Vec::new();
        while !buf.is_empty() {
            let (entry, consumed) = Self::decode(buf)?;
            entries.push(entry);
            buf = &buf[consumed..];
        }
        Some(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_each_variant() {
        let entries = vec![
            Entry::Replicate {
                op_index: 1,
                payload: b"row bytes".to_vec(),
            },
            Entry::Commit { op_index: 1 },
            Entry::FlushMarker { up_to_op_index: 60 },
        ];
        let mut batch = Vec::new();
        for e in &entries {
            batch.extend_from_slice(&e.encode());
        }
        let decoded = Entry::decode_all(&batch).unwrap();
        assert_eq!(decoded, entries);
    }
}
