/*
 * Created on Mon Feb 12 2024
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

//! `tabletd-engine`: a per-tablet columnar storage and MVCC concurrency
//! engine. A tablet owns one key range of one table: a mutable
//! [`rowset::mem::MemRowSet`] write buffer, a set of immutable on-disk
//! [`rowset::disk::DiskRowSet`]s, a write-ahead log, and a block container,
//! all coordinated by [`mvcc::Mvcc`] and driven by a single apply path per
//! tablet. [`tablet::replica::Replica`] is the state machine a consensus
//! layer drives the tablet through; [`maintenance::MaintenanceMgr`] runs
//! the background flush/compaction sweep.

pub mod block;
pub mod checksum;
pub mod config;
pub mod error;
pub mod maintenance;
pub mod mvcc;
pub mod rowset;
pub mod schema;
pub mod tablet;
pub mod timestamp;
pub mod wal;

pub use {
    config::Config,
    error::{Error, ErrorKind, RuntimeResult},
    mvcc::{Mvcc, Snapshot},
    schema::Schema,
    tablet::{op::Op, replica::Replica, Tablet},
    timestamp::Timestamp,
};

/// Install the engine's logger. Each embedding binary calls this once at
/// startup rather than the library initializing it implicitly.
pub fn init_logger() {
    let _ = env_logger::try_init();
}
