/*
 * Created on Wed Jan 17 2024
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
 * A `Schema` is an ordered list of columns, the first `num_key_columns` of
 * which form the primary key and must be non-nullable. Columns carry a
 * stable `ColumnId` distinct from their positional index, so that a schema
 * can evolve (columns added/removed) without invalidating references baked
 * into already-flushed on-disk rowsets.
 */

use {
    crate::error::{Error, ErrorKind, RuntimeResult},
    std::{collections::HashMap, fmt, sync::Arc},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ColumnId(pub u32);

impl fmt::Display for ColumnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "col#{}", self.0)
    }
}

/// The physical type a column's cells are stored as. Kept intentionally
/// small: column values are opaque typed cells rather than a full type
/// system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Binary,
    String,
}

impl DataType {
    /// Fixed-width column storage size, or `None` for variable-length
    /// types (`Binary`/`String`, which are stored out-of-line with an
    /// offset in the fixed-width column file).
    pub fn fixed_width(self) -> Option<usize> {
        use DataType::*;
        match self {
            Bool | I8 | U8 => Some(1),
            I16 | U16 => Some(2),
            I32 | U32 | F32 => Some(4),
            I64 | U64 | F64 => Some(8),
            Binary | String => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ColumnSchema {
    pub id: ColumnId,
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl ColumnSchema {
    pub fn new(id: ColumnId, name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            id,
            name: name.into(),
            data_type,
            nullable,
        }
    }
}

/// An ordered column list with a primary key prefix.
///
/// Cheap to clone: the expensive parts (`columns`, the id/name indexes)
/// live behind an `Arc` rather than being deep-cloned on every scan.
#[derive(Debug, Clone)]
pub struct Schema(Arc<SchemaInner>);

#[derive(Debug)]
struct SchemaInner {
    columns: Vec<ColumnSchema>,
    num_key_columns: usize,
    id_to_idx: HashMap<ColumnId, usize>,
    name_to_idx: HashMap<String, usize>,
}

impl Schema {
    /// Build a schema. `columns[..num_key_columns]` form the primary key
    /// and must all be non-nullable.
    pub fn new(columns: Vec<ColumnSchema>, num_key_columns: usize) -> RuntimeResult<Self> {
        if num_key_columns == 0 {
            return Err(Error::with_kind(ErrorKind::InvalidArgument(
                "schema must have at least one key column",
            )));
        }
        if num_key_columns > columns.len() {
            return Err(Error::with_kind(ErrorKind::InvalidArgument(
                "num_key_columns exceeds column count",
            )));
        }
        for col in &columns[..num_key_columns] {
            if col.nullable {
                return Err(Error::with_kind(ErrorKind::InvalidArgument(
                    "primary key columns must not be nullable",
                )));
            }
        }
        let mut id_to_idx = HashMap::with_capacity(columns.len());
        let mut name_to_idx = HashMap::with_capacity(columns.len());
        for (idx, col) in columns.iter().enumerate() {
            if id_to_idx.insert(col.id, idx).is_some() {
                return Err(Error::with_kind(ErrorKind::InvalidArgument(
                    "duplicate column id in schema",
                )));
            }
            if name_to_idx.insert(col.name.clone(), idx).is_some() {
                return Err(Error::with_kind(ErrorKind::InvalidArgument(
                    "duplicate column name in schema",
                )));
            }
        }
        Ok(Self(Arc::new(SchemaInner {
            columns,
            num_key_columns,
            id_to_idx,
            name_to_idx,
        })))
    }

    pub fn columns(&self) -> &[ColumnSchema] {
        &self.0.columns
    }

    pub fn num_key_columns(&self) -> usize {
        self.0.num_key_columns
    }

    pub fn key_columns(&self) -> &[ColumnSchema] {
        &self.0.columns[..self.0.num_key_columns]
    }

    pub fn column_by_idx(&self, idx: usize) -> Option<&ColumnSchema> {
        self.0.columns.get(idx)
    }

    pub fn idx_of_id(&self, id: ColumnId) -> Option<usize> {
        self.0.id_to_idx.get(&id).copied()
    }

    pub fn idx_of_name(&self, name: &str) -> Option<usize> {
        self.0.name_to_idx.get(name).copied()
    }

    pub fn num_columns(&self) -> usize {
        self.0.columns.len()
    }
}

/// A single cell value. `Null` is only valid for nullable (i.e.
/// non-key) columns — enforced by [`Row::validate`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    I64(i64),
    U64(u64),
    F64(f64),
    Bytes(Vec<u8>),
}

const VALUE_TAG_NULL: u8 = 0;
const VALUE_TAG_BOOL: u8 = 1;
const VALUE_TAG_I64: u8 = 2;
const VALUE_TAG_U64: u8 = 3;
const VALUE_TAG_F64: u8 = 4;
const VALUE_TAG_BYTES: u8 = 5;

impl Value {
    /// Self-describing binary encoding, used for persisted column/delta
    /// storage where a schema may not be at hand to supply type tags out
    /// of band.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Value::Null => out.push(VALUE_TAG_NULL),
            Value::Bool(b) => {
                out.push(VALUE_TAG_BOOL);
                out.push(*b as u8);
            }
            Value::I64(i) => {
                out.push(VALUE_TAG_I64);
                out.extend_from_slice(&i.to_le_bytes());
            }
            Value::U64(u) => {
                out.push(VALUE_TAG_U64);
                out.extend_from_slice(&u.to_le_bytes());
            }
            Value::F64(f) => {
                out.push(VALUE_TAG_F64);
                out.extend_from_slice(&f.to_le_bytes());
            }
            Value::Bytes(b) => {
                out.push(VALUE_TAG_BYTES);
                out.extend_from_slice(&(b.len() as u32).to_le_bytes());
                out.extend_from_slice(b);
            }
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.is_empty() {
            return None;
        }
        match buf[0] {
            VALUE_TAG_NULL => Some((Value::Null, 1)),
            VALUE_TAG_BOOL => buf.get(1).map(|b| (Value::Bool(*b != 0), 2)),
            VALUE_TAG_I64 => {
                if buf.len() < 9 {
                    return None;
                }
                Some((Value::I64(i64::from_le_bytes(buf[1..9].try_into().ok()?)), 9))
            }
            VALUE_TAG_U64 => {
                if buf.len() < 9 {
                    return None;
                }
                Some((Value::U64(u64::from_le_bytes(buf[1..9].try_into().ok()?)), 9))
            }
            VALUE_TAG_F64 => {
                if buf.len() < 9 {
                    return None;
                }
                Some((Value::F64(f64::from_le_bytes(buf[1..9].try_into().ok()?)), 9))
            }
            VALUE_TAG_BYTES => {
                if buf.len() < 5 {
                    return None;
                }
                let len = u32::from_le_bytes(buf[1..5].try_into().ok()?) as usize;
                if buf.len() < 5 + len {
                    return None;
                }
                Some((Value::Bytes(buf[5..5 + len].to_vec()), 5 + len))
            }
            _ => None,
        }
    }
}

/// One row's worth of values, ordered to match its `Schema`'s column
/// order. The encoded primary key is derived from `values[..num_key_columns]`.
#[derive(Debug, Clone)]
pub struct Row {
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn validate(&self, schema: &Schema) -> RuntimeResult<()> {
        if self.values.len() != schema.num_columns() {
            return Err(Error::with_kind(ErrorKind::InvalidArgument(
                "row value count does not match schema column count",
            )));
        }
        for (col, val) in schema.columns().iter().zip(&self.values) {
            if matches!(val, Value::Null) && !col.nullable {
                return Err(Error::with_kind(ErrorKind::InvalidArgument(
                    "null value in non-nullable column",
                )));
            }
        }
        Ok(())
    }

    /// Byte-comparable encoding of the key columns, used as the ordering
    /// key for MemRowSet and the on-disk PK index.
    pub fn encode_key(&self, schema: &Schema) -> Vec<u8> {
        encode_key_values(&self.values[..schema.num_key_columns()])
    }

    /// Self-describing encoding of the whole row, used for on-disk base
    /// data and delta payloads.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.values.len() as u32).to_le_bytes());
        for v in &self.values {
            out.extend_from_slice(&v.encode());
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.len() < 4 {
            return None;
        }
        let n = u32::from_le_bytes(buf[0..4].try_into().ok()?) as usize;
        let mut cursor = 4;
        let mut values = Vec::with_capacity(n);
        for _ in 0..n {
            let (v, consumed) = Value::decode(&buf[cursor..])?;
            values.push(v);
            cursor += consumed;
        }
        Some((Row::new(values), cursor))
    }
}

/// Encode a prefix of values (assumed to be the key columns, in schema
/// order) into a byte-comparable key. Integers are big-endian with the
/// sign bit flipped so that two's-complement ordering becomes unsigned
/// lexicographic ordering; strings/bytes are length-prefixed so that a
/// short key never becomes a prefix of a longer one that should sort after
/// it.
pub fn encode_key_values(values: &[Value]) -> Vec<u8> {
    let mut out = Vec::new();
    for v in values {
        match v {
            Value::Null => unreachable!("key columns are never nullable"),
            Value::Bool(b) => out.push(*b as u8),
            Value::I64(i) => out.extend_from_slice(&((*i as u64) ^ (1 << 63)).to_be_bytes()),
            Value::U64(u) => out.extend_from_slice(&u.to_be_bytes()),
            Value::F64(f) => {
                let bits = f.to_bits();
                let flipped = if *f >= 0.0 {
                    bits | (1 << 63)
                } else {
                    !bits
                };
                out.extend_from_slice(&flipped.to_be_bytes());
            }
            Value::Bytes(b) => {
                out.extend_from_slice(&(b.len() as u32).to_be_bytes());
                out.extend_from_slice(b);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schema() -> Schema {
        Schema::new(
            vec![
                ColumnSchema::new(ColumnId(0), "id", DataType::U64, false),
                ColumnSchema::new(ColumnId(1), "name", DataType::String, true),
            ],
            1,
        )
        .unwrap()
    }

    #[test]
    fn rejects_nullable_key_column() {
        let err = Schema::new(
            vec![ColumnSchema::new(ColumnId(0), "id", DataType::U64, true)],
            1,
        )
        .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidArgument(_)));
    }

    #[test]
    fn row_validate_rejects_null_key() {
        let schema = sample_schema();
        let row = Row::new(vec![Value::Null, Value::Null]);
        assert!(row.validate(&schema).is_err());
    }

    #[test]
    fn key_encoding_preserves_numeric_order() {
        let a = encode_key_values(&[Value::U64(1)]);
        let b = encode_key_values(&[Value::U64(2)]);
        assert!(a < b);

        let a = encode_key_values(&[Value::I64(-5)]);
        let b = encode_key_values(&[Value::I64(5)]);
        assert!(a < b);
    }

    #[test]
    fn key_encoding_length_prefixes_bytes() {
        let short = encode_key_values(&[Value::Bytes(b"ab".to_vec())]);
        let long = encode_key_values(&[Value::Bytes(b"abc".to_vec())]);
        assert!(short < long);
    }
}
