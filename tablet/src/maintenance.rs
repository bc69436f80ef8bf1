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

/*
 * Maintenance pool: runs flushes, compactions, and log GC selected by a
 * maintenance manager. A single background task owns the queue, a
 * periodic tick posts routine work to itself rather than running it
 * inline, and ad-hoc callers can post directly through the returned
 * handle.
 */

use {
    crate::{config::Config, tablet::Tablet},
    std::{sync::Arc, time::Duration},
    tokio::{
        sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
        task::JoinHandle,
    },
};

/// One unit of maintenance work for a single tablet.
pub enum Task {
    FlushMrs,
    MinorDeltaCompaction,
    MergingCompaction,
}

/// Handle to a running maintenance executor for one tablet.
pub struct MaintenanceMgr {
    dispatcher: UnboundedSender<Task>,
}

impl MaintenanceMgr {
    /// Spawn the periodic sweep plus its task executor. The executor exits
    /// once every sender (including the one returned here) is dropped.
    pub fn start(tablet: Arc<Tablet>, config: Config) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(Self::run(tablet, config, rx, tx.clone()));
        (Self { dispatcher: tx }, handle)
    }

    /// Post an ad-hoc task, e.g. a manual flush request.
    pub fn post(&self, task: Task) {
        let _ = self.dispatcher.send(task);
    }

    async fn run(
        tablet: Arc<Tablet>,
        config: Config,
        mut rx: UnboundedReceiver<Task>,
        self_tx: UnboundedSender<Task>,
    ) {
        let sweep_interval = Duration::from_secs(config.maintenance_sweep_interval_secs.max(1));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(sweep_interval) => {
                    Self::sweep(&tablet, &self_tx);
                }
                task = rx.recv() => {
                    let Some(task) = task else { return };
                    Self::run_task(&tablet, task);
                }
            }
        }
    }

    /// Decide what's due, based on `Config`'s thresholds, and post it to
    /// the queue rather than running it inline — a slow compaction should
    /// never delay the next sweep's tick.
    fn sweep(tablet: &Arc<Tablet>, self_tx: &UnboundedSender<Task>) {
        if tablet.should_flush() {
            let _ = self_tx.send(Task::FlushMrs);
        }
        let _ = self_tx.send(Task::MinorDeltaCompaction);
        let _ = self_tx.send(Task::MergingCompaction);
    }

    fn run_task(tablet: &Arc<Tablet>, task: Task) {
        match task {
            Task::FlushMrs => {
                if let Err(e) = tablet.flush_mrs() {
                    log::error!("tablet {}: flush failed: {e}", tablet.id);
                }
            }
            Task::MinorDeltaCompaction => {
                if let Err(e) = tablet.run_minor_delta_compaction() {
                    log::error!("tablet {}: minor delta compaction failed: {e}", tablet.id);
                }
            }
            Task::MergingCompaction => {
                let snapshot = tablet.mvcc().take_snapshot();
                if let Err(e) = tablet.run_merging_compaction(&snapshot) {
                    log::error!("tablet {}: merging compaction failed: {e}", tablet.id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnId, ColumnSchema, DataType, Row, Value};

    fn schema() -> crate::schema::Schema {
        crate::schema::Schema::new(
            vec![
                ColumnSchema::new(ColumnId(0), "pk", DataType::U64, false),
                ColumnSchema::new(ColumnId(1), "a", DataType::U64, true),
            ],
            1,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn ad_hoc_flush_task_runs() {
        let dir = tempfile::tempdir().unwrap();
        let tablet = Arc::new(Tablet::create(dir.path(), "t1", schema(), Config::default()).unwrap());
        tablet
            .apply(crate::tablet::op::Op::Insert {
                row: Row::new(vec![Value::U64(1), Value::U64(2)]),
            })
            .unwrap()
            .1
            .unwrap();

        let mut config = Config::default();
        config.maintenance_sweep_interval_secs = 3600;
        let (mgr, handle) = MaintenanceMgr::start(tablet.clone(), config);
        mgr.post(Task::FlushMrs);
        drop(mgr);
        handle.await.unwrap();
        assert_eq!(tablet.mrs_row_count(), 0);
    }
}
