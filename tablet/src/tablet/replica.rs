/*
 * Created on Thu Feb 8 2024
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

//! Tablet replica lifecycle: a single-threaded state machine wrapping a
//! [`Tablet`], plus the operations the consensus layer drives it through.

use {
    super::{op::Op, Tablet},
    crate::{
        config::Config,
        error::{Error, ErrorKind, RuntimeResult},
        schema::Schema,
        timestamp::Timestamp,
    },
    parking_lot::Mutex,
    std::path::{Path, PathBuf},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    NotInitialized,
    Initialized,
    Bootstrapping,
    Running,
    Stopped,
    Shutdown,
    Failed,
}

/// What put the replica into `Failed`, carried alongside the state.
#[derive(Debug, Clone)]
pub struct Status {
    pub message: String,
}

struct Inner {
    state: State,
    failure: Option<Status>,
    tablet: Option<Tablet>,
}

/// A consensus-facing wrapper around [`Tablet`] that enforces the legal
/// transition order `NOT_INITIALIZED -> INITIALIZED -> BOOTSTRAPPING ->
/// RUNNING -> STOPPED -> SHUTDOWN`, with a `FAILED` side branch reachable
/// from any non-terminal state. Transitions are single-threaded: callers
/// serialize their own access.
pub struct Replica {
    dir: PathBuf,
    id: String,
    schema: Schema,
    config: Config,
    inner: Mutex<Inner>,
}

impl Replica {
    pub fn new(dir: impl Into<PathBuf>, id: impl Into<String>, schema: Schema, config: Config) -> Self {
        Self {
            dir: dir.into(),
            id: id.into(),
            schema,
            config,
            inner: Mutex::new(Inner {
                state: State::NotInitialized,
                failure: None,
                tablet: None,
            }),
        }
    }

    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    pub fn status(&self) -> Option<Status> {
        self.inner.lock().failure.clone()
    }

    fn require(&self, inner: &Inner, expected: State) -> RuntimeResult<()> {
        if inner.state != expected {
            return Err(Error::with_kind(ErrorKind::IllegalState(
                "replica transition attempted from the wrong predecessor state",
            )));
        }
        Ok(())
    }

    fn fail(&self, inner: &mut Inner, message: impl Into<String>) -> Error {
        inner.state = State::Failed;
        inner.failure = Some(Status { message: message.into() });
        Error::with_kind(ErrorKind::IllegalState("replica transition failed"))
    }

    /// `NOT_INITIALIZED -> INITIALIZED`: make sure the on-disk directories
    /// exist without touching WAL/rowset state yet.
    pub fn initialize(&self) -> RuntimeResult<()> {
        let mut inner = self.inner.lock();
        self.require(&inner, State::NotInitialized)?;
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            return Err(self.fail(&mut inner, e.to_string()));
        }
        inner.state = State::Initialized;
        Ok(())
    }

    /// `INITIALIZED -> BOOTSTRAPPING -> RUNNING`: open the tablet,
    /// reloading its rowsets and replaying its WAL, then start serving
    /// ops.
    pub fn start(&self) -> RuntimeResult<()> {
        let mut inner = self.inner.lock();
        self.require(&inner, State::Initialized)?;
        inner.state = State::Bootstrapping;
        match Tablet::open(&self.dir, self.id.clone(), self.schema.clone(), self.config.clone()) {
            Ok(tablet) => {
                inner.tablet = Some(tablet);
                inner.state = State::Running;
                Ok(())
            }
            Err(e) => Err(self.fail(&mut inner, e.to_string())),
        }
    }

    fn running_tablet<'a>(&self, inner: &'a Inner) -> RuntimeResult<&'a Tablet> {
        if inner.state != State::Running {
            return Err(Error::with_kind(ErrorKind::ServiceUnavailable));
        }
        inner.tablet.as_ref().ok_or_else(|| Error::with_kind(ErrorKind::Uninitialized))
    }

    /// `SubmitWrite(op) -> Status`: enqueue and apply one op.
    pub fn submit_write(&self, op: Op) -> RuntimeResult<(Timestamp, RuntimeResult<()>)> {
        let inner = self.inner.lock();
        self.running_tablet(&inner)?.apply(op)
    }

    /// `StartFollowerTransaction(round)`: apply an op that originated
    /// elsewhere in the Raft group, identically to a locally submitted
    /// write from this tablet's point of view.
    pub fn start_follower_transaction(&self, op: Op) -> RuntimeResult<(Timestamp, RuntimeResult<()>)> {
        self.submit_write(op)
    }

    /// `FinishConsensusOnlyRound(round)`: a no-op apply that still reserves
    /// and commits an MVCC timestamp, purely to advance safe time.
    pub fn finish_consensus_only_round(&self) -> RuntimeResult<Timestamp> {
        let inner = self.inner.lock();
        let tablet = self.running_tablet(&inner)?;
        let ts = tablet.mvcc().allocate_timestamp();
        tablet.mvcc().start_transaction(ts)?;
        tablet.mvcc().start_applying_transaction(ts);
        tablet.mvcc().commit_transaction(ts);
        Ok(ts)
    }

    /// `Stop()`: refuse new ops, drain in-flight, release resources.
    /// Idempotent.
    pub fn stop(&self) -> RuntimeResult<()> {
        let mut inner = self.inner.lock();
        if inner.state == State::Stopped || inner.state == State::Shutdown {
            return Ok(());
        }
        if let Some(tablet) = &inner.tablet {
            tablet.mvcc().close();
            tablet.mvcc().wait_for_applying_transactions_to_commit()?;
        }
        inner.state = State::Stopped;
        Ok(())
    }

    /// Release all resources after a stop; terminal.
    pub fn shutdown(&self) -> RuntimeResult<()> {
        let mut inner = self.inner.lock();
        self.require(&inner, State::Stopped)?;
        inner.tablet = None;
        inner.state = State::Shutdown;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnId, ColumnSchema, DataType, Row, Value};

    fn schema() -> Schema {
        Schema::new(
            vec![
                ColumnSchema::new(ColumnId(0), "pk", DataType::U64, false),
                ColumnSchema::new(ColumnId(1), "a", DataType::U64, true),
            ],
            1,
        )
        .unwrap()
    }

    #[test]
    fn lifecycle_happy_path() {
        let dir = tempfile::tempdir().unwrap();
        let replica = Replica::new(dir.path(), "t1", schema(), Config::default());
        assert_eq!(replica.state(), State::NotInitialized);
        replica.initialize().unwrap();
        assert_eq!(replica.state(), State::Initialized);
        replica.start().unwrap();
        assert_eq!(replica.state(), State::Running);

        let (_, res) = replica
            .submit_write(Op::Insert {
                row: Row::new(vec![Value::U64(1), Value::U64(2)]),
            })
            .unwrap();
        res.unwrap();

        replica.stop().unwrap();
        assert_eq!(replica.state(), State::Stopped);
        replica.shutdown().unwrap();
        assert_eq!(replica.state(), State::Shutdown);
    }

    #[test]
    fn out_of_order_transition_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let replica = Replica::new(dir.path(), "t1", schema(), Config::default());
        assert!(replica.start().is_err());
    }

    #[test]
    fn submit_write_before_running_is_service_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let replica = Replica::new(dir.path(), "t1", schema(), Config::default());
        replica.initialize().unwrap();
        let err = replica
            .submit_write(Op::Delete { key: vec![1] })
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ServiceUnavailable));
    }

    #[test]
    fn stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let replica = Replica::new(dir.path(), "t1", schema(), Config::default());
        replica.initialize().unwrap();
        replica.start().unwrap();
        replica.stop().unwrap();
        replica.stop().unwrap();
    }
}
