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

use {crate::error::RuntimeResult, serde::Deserialize, std::path::Path};

/// Tunables for the per-tablet storage engine. None of these affect
/// correctness; they affect when flush/compaction/GC decide to run and how
/// big on-disk structures are allowed to grow before being rolled.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// WAL segments are rolled once they reach this size.
    pub wal_segment_size_mb: u64,
    /// block container alignment, in bytes; block offsets are rounded up
    /// to this boundary.
    pub block_alignment_bytes: u64,
    /// MemRowSet is flushed once it holds this many rows.
    pub mrs_flush_row_threshold: usize,
    /// MemRowSet is flushed once its estimated footprint exceeds this many
    /// bytes, regardless of row count.
    pub mrs_flush_byte_threshold: u64,
    /// A DRS becomes eligible for minor delta compaction once its REDO
    /// delta file count reaches this.
    pub minor_compaction_file_threshold: usize,
    /// A DRS becomes eligible for major delta compaction once its
    /// cumulative REDO byte size exceeds this.
    pub major_compaction_redo_byte_threshold: u64,
    /// byte budget handed to the budgeted-compaction selector.
    pub compaction_byte_budget: u64,
    /// how often the maintenance pool's background sweep looks for
    /// flush/compaction/GC work.
    pub maintenance_sweep_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            wal_segment_size_mb: 64,
            block_alignment_bytes: 4096,
            mrs_flush_row_threshold: 1_000_000,
            mrs_flush_byte_threshold: 128 * 1024 * 1024,
            minor_compaction_file_threshold: 8,
            major_compaction_redo_byte_threshold: 32 * 1024 * 1024,
            compaction_byte_budget: 256 * 1024 * 1024,
            maintenance_sweep_interval_secs: 30,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file, falling back to defaults for
    /// any key the file omits.
    pub fn load_yaml(path: impl AsRef<Path>) -> RuntimeResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_self_consistent() {
        let cfg = Config::default();
        assert!(cfg.wal_segment_size_mb > 0);
        assert!(cfg.mrs_flush_row_threshold > 0);
    }

    #[test]
    fn partial_yaml_fills_in_defaults() {
        let cfg: Config = serde_yaml::from_str("wal_segment_size_mb: 8\n").unwrap();
        assert_eq!(cfg.wal_segment_size_mb, 8);
        assert_eq!(
            cfg.mrs_flush_row_threshold,
            Config::default().mrs_flush_row_threshold
        );
    }
}
