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

/*
 * The row-op payload carried by WAL REPLICATE entries.
 */

use crate::schema::{Row, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Insert { row: Row },
    Update { key: Vec<u8>, changes: Vec<(usize, Value)> },
    Delete { key: Vec<u8> },
}

const TAG_INSERT: u8 = 1;
const TAG_UPDATE: u8 = 2;
const TAG_DELETE: u8 = 3;

impl Op {
    pub fn key(&self, schema: &crate::schema::Schema) -> Vec<u8> {
        match self {
            Op::Insert { row } => row.encode_key(schema),
            Op::Update { key, .. } | Op::Delete { key } => key.clone(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Op::Insert { row } => {
                out.push(TAG_INSERT);
                let encoded = row.encode();
                out.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
                out.extend_from_slice(&encoded);
            }
            Op::Update { key, changes } => {
                out.push(TAG_UPDATE);
                out.extend_from_slice(&(key.len() as u32).to_le_bytes());
                out.extend_from_slice(key);
                out.extend_from_slice(&(changes.len() as u32).to_le_bytes());
                for (idx, val) in changes {
                    out.extend_from_slice(&(*idx as u32).to_le_bytes());
                    let encoded = val.encode();
                    out.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
                    out.extend_from_slice(&encoded);
                }
            }
            Op::Delete { key } => {
                out.push(TAG_DELETE);
                out.extend_from_slice(&(key.len() as u32).to_le_bytes());
                out.extend_from_slice(key);
            }
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.is_empty() {
            return None;
        }
        match buf[0] {
            TAG_INSERT => {
                let len = u32::from_le_bytes(buf.get(1..5)?.try_into().ok()?) as usize;
                let (row, _) = Row::decode(buf.get(5..5 + len)?)?;
                Some(Op::Insert { row })
            }
            TAG_UPDATE => {
                let mut cursor = 1;
                let klen = u32::from_le_bytes(buf.get(cursor..cursor + 4)?.try_into().ok()?) as usize;
                cursor += 4;
                let key = buf.get(cursor..cursor + klen)?.to_vec();
                cursor += klen;
                let n = u32::from_le_bytes(buf.get(cursor..cursor + 4)?.try_into().ok()?) as usize;
                cursor += 4;
                let mut changes = Vec::with_capacity(n);
                for _ in 0..n {
                    let idx = u32::from_le_bytes(buf.get(cursor..cursor + 4)?.try_into().ok()?) as usize;
                    cursor += 4;
                    let vlen = u32::from_le_bytes(buf.get(cursor..cursor + 4)?.try_into().ok()?) as usize;
                    cursor += 4;
                    let (val, _) = Value::decode(buf.get(cursor..cursor + vlen)?)?;
                    cursor += vlen;
                    changes.push((idx, val));
                }
                Some(Op::Update { key, changes })
            }
            TAG_DELETE => {
                let klen = u32::from_le_bytes(buf.get(1..5)?.try_into().ok()?) as usize;
                let key = buf.get(5..5 + klen)?.to_vec();
                Some(Op::Delete { key })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_all_variants() {
        let ops = vec![
            Op::Insert {
                row: Row::new(vec![Value::U64(1), Value::Bytes(b"x".to_vec())]),
            },
            Op::Update {
                key: vec![1, 2, 3],
                changes: vec![(1, Value::U64(9))],
            },
            Op::Delete { key: vec![9, 9] },
        ];
        for op in ops {
            let decoded = Op::decode(&op.encode()).unwrap();
            assert_eq!(decoded, op);
        }
    }
}
