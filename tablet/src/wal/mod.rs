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

//! The write-ahead log: segmented, CRC-protected append log with an
//! ordered segment sequence and a by-op-index lookup.

pub mod entry;
pub mod log;
pub mod segment;

pub use entry::Entry;
pub use log::SegmentSequence;
