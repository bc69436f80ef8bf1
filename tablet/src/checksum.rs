/*
 * Created on Mon Jan 15 2024
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

use crc::{Crc, Digest, CRC_32_ISCSI, CRC_64_XZ};

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);
const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// A running CRC64 digest, used by the block container's metadata stream
/// and the on-disk rowset's integrity checks.
#[derive(Clone)]
pub struct Crc64 {
    digest: Digest<'static, u64>,
}

impl Default for Crc64 {
    fn default() -> Self {
        Self::new()
    }
}

impl Crc64 {
    pub fn new() -> Self {
        Self {
            digest: CRC64.digest(),
        }
    }
    pub fn update(&mut self, bytes: &[u8]) {
        self.digest.update(bytes)
    }
    pub fn finish(self) -> u64 {
        self.digest.finalize()
    }
}

/// A one-shot CRC32C, used for the WAL segment header and per-batch
/// checksums.
pub fn crc32c(bytes: &[u8]) -> u32 {
    let mut digest = CRC32C.digest();
    digest.update(bytes);
    digest.finalize()
}
