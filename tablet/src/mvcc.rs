/*
 * Created on Fri Jan 19 2024
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
 * The MVCC coordinator: tracks in-flight, applying, and committed
 * transactions for one tablet and hands out repeatable snapshots.
 */

use {
    crate::{
        error::{MvccError, RuntimeResult},
        timestamp::Timestamp,
    },
    parking_lot::{Condvar, Mutex},
    std::{
        collections::HashMap,
        sync::atomic::{AtomicBool, AtomicU64, Ordering},
        time::{Duration, Instant},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Reserved,
    Applying,
}

/// A snapshot of the MVCC state, deciding whether a given timestamp should
/// be considered committed.
///
/// Summary rule: `T` is committed iff `T < all_committed_before` or
/// `T` is in `committed_explicit_set`.
#[derive(Debug, Clone)]
pub struct Snapshot {
    all_committed_before: Timestamp,
    none_committed_at_or_after: Timestamp,
    committed_explicit_set: Vec<u64>,
}

impl Snapshot {
    /// A snapshot that considers nothing committed; used before safe time
    /// has ever been advanced.
    pub fn including_none() -> Self {
        Self {
            all_committed_before: Timestamp::ZERO,
            none_committed_at_or_after: Timestamp::ZERO,
            committed_explicit_set: Vec::new(),
        }
    }

    /// A snapshot that considers every timestamp committed; useful for
    /// scans that intentionally ignore MVCC (tests, full historical reads).
    pub fn including_all() -> Self {
        Self {
            all_committed_before: Timestamp::MAX,
            none_committed_at_or_after: Timestamp::MAX,
            committed_explicit_set: Vec::new(),
        }
    }

    /// A "clean" snapshot at a single cut timestamp: everything strictly
    /// before `ts` is committed, nothing at or after is.
    pub fn at(ts: Timestamp) -> Self {
        Self {
            all_committed_before: ts,
            none_committed_at_or_after: ts,
            committed_explicit_set: Vec::new(),
        }
    }

    pub fn is_committed(&self, ts: Timestamp) -> bool {
        if ts < self.all_committed_before {
            return true;
        }
        if ts >= self.none_committed_at_or_after {
            return false;
        }
        self.committed_explicit_set.contains(&ts.value())
    }

    /// True if this snapshot is exactly `all_committed_before` with no
    /// explicit exceptions.
    pub fn is_clean(&self) -> bool {
        self.committed_explicit_set.is_empty()
    }

    /// Widen this snapshot to additionally consider `extra` committed, even
    /// though they may not have been at construction time. Used by the
    /// flush path, where the set of ops folded into a freshly flushed DRS
    /// need not form one consistent MVCC snapshot.
    pub fn widen_with(&mut self, extra: impl IntoIterator<Item = Timestamp>) {
        for ts in extra {
            if !self.is_committed(ts) {
                self.committed_explicit_set.push(ts.value());
                if ts >= self.none_committed_at_or_after {
                    self.none_committed_at_or_after = ts.next();
                }
            }
        }
    }

    /// Whether this snapshot might contain commits at or after `ts` — used
    /// to short-circuit REDO delta scans.
    pub fn may_have_committed_at_or_after(&self, ts: Timestamp) -> bool {
        ts < self.none_committed_at_or_after
    }

    /// Whether this snapshot might contain uncommitted ops at or before
    /// `ts` — used to short-circuit UNDO delta scans.
    pub fn may_have_uncommitted_at_or_before(&self, ts: Timestamp) -> bool {
        ts >= self.all_committed_before
    }

    /// Serialize this snapshot for inclusion in a persisted rowset catalog.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(20 + self.committed_explicit_set.len() * 8);
        buf.extend_from_slice(&self.all_committed_before.value().to_le_bytes());
        buf.extend_from_slice(&self.none_committed_at_or_after.value().to_le_bytes());
        buf.extend_from_slice(&(self.committed_explicit_set.len() as u32).to_le_bytes());
        for ts in &self.committed_explicit_set {
            buf.extend_from_slice(&ts.to_le_bytes());
        }
        buf
    }

    /// Decode a snapshot previously written by [`Self::encode`]. Returns the
    /// snapshot and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.len() < 20 {
            return None;
        }
        let all_committed_before = Timestamp::new(u64::from_le_bytes(buf[0..8].try_into().ok()?));
        let none_committed_at_or_after =
            Timestamp::new(u64::from_le_bytes(buf[8..16].try_into().ok()?));
        let count = u32::from_le_bytes(buf[16..20].try_into().ok()?) as usize;
        let mut pos = 20;
        let mut committed_explicit_set = Vec::with_capacity(count);
        for _ in 0..count {
            let end = pos + 8;
            if buf.len() < end {
                return None;
            }
            committed_explicit_set.push(u64::from_le_bytes(buf[pos..end].try_into().ok()?));
            pos = end;
        }
        Some((
            Self {
                all_committed_before,
                none_committed_at_or_after,
                committed_explicit_set,
            },
            pos,
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitFor {
    AllCommitted,
    NoneApplying,
}

struct Inner {
    in_flight: HashMap<u64, TxnState>,
    safe_time: Timestamp,
    earliest_in_flight: Timestamp,
    cur_snap: Snapshot,
}

impl Inner {
    fn earliest_in_flight_or_max(&self) -> Timestamp {
        self.in_flight
            .keys()
            .copied()
            .min()
            .map(Timestamp::new)
            .unwrap_or(Timestamp::MAX)
    }
}

/// Coordinator of MVCC transactions for one tablet.
///
/// Two valid lifecycles for a timestamp:
///   `start -> start_applying -> commit`
///   `start -> abort`
/// Once `start_applying` has been called, `abort` is a programmer error:
/// in-memory edits are not rolled back, so an applying op must commit.
pub struct Mvcc {
    inner: Mutex<Inner>,
    waiters: Condvar,
    next_ts: AtomicU64,
    open: AtomicBool,
}

impl Default for Mvcc {
    fn default() -> Self {
        Self::new()
    }
}

impl Mvcc {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                in_flight: HashMap::new(),
                safe_time: Timestamp::ZERO,
                earliest_in_flight: Timestamp::MAX,
                cur_snap: Snapshot::including_none(),
            }),
            waiters: Condvar::new(),
            next_ts: AtomicU64::new(1),
            open: AtomicBool::new(true),
        }
    }

    /// Allocate the next timestamp. Does not itself enter it into
    /// `in_flight`; callers must follow with [`Self::start_transaction`].
    pub fn allocate_timestamp(&self) -> Timestamp {
        Timestamp::new(self.next_ts.fetch_add(1, Ordering::SeqCst))
    }

    fn check_open(&self) -> RuntimeResult<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(MvccError::Aborted.into())
        }
    }

    /// `StartTransaction(t)`: reserve a not-yet-committed timestamp.
    ///
    /// # Panics
    /// Fatal (panics) if `t` is already in flight, or if `t <= safe_time`:
    /// both are programmer-contract violations.
    pub fn start_transaction(&self, t: Timestamp) -> RuntimeResult<()> {
        self.check_open()?;
        let mut inner = self.inner.lock();
        assert!(
            !inner.in_flight.contains_key(&t.value()),
            "mvcc: timestamp {t} already in flight"
        );
        assert!(
            t > inner.safe_time,
            "mvcc: timestamp {t} not greater than safe time {}",
            inner.safe_time
        );
        inner.in_flight.insert(t.value(), TxnState::Reserved);
        if t < inner.earliest_in_flight {
            inner.earliest_in_flight = t;
        }
        Ok(())
    }

    /// `StartApplyingTransaction(t)`: transition RESERVED -> APPLYING.
    ///
    /// # Panics
    /// Fatal if `t` isn't RESERVED (including if it's already APPLYING or
    /// unknown).
    pub fn start_applying_transaction(&self, t: Timestamp) {
        let mut inner = self.inner.lock();
        match inner.in_flight.get_mut(&t.value()) {
            Some(state @ TxnState::Reserved) => *state = TxnState::Applying,
            other => panic!("mvcc: start_applying on non-reserved txn {t}: {other:?}"),
        }
    }

    /// `AbortTransaction(t)`: drop a RESERVED timestamp without ever
    /// folding it into a snapshot.
    ///
    /// # Panics
    /// Fatal if `t` is not RESERVED (double-abort, or aborting an
    /// APPLYING/committed txn).
    pub fn abort_transaction(&self, t: Timestamp) {
        let mut inner = self.inner.lock();
        match inner.in_flight.remove(&t.value()) {
            Some(TxnState::Reserved) => {}
            other => panic!("mvcc: abort on non-reserved txn {t}: {other:?}"),
        }
        if inner.earliest_in_flight == t {
            inner.earliest_in_flight = inner.earliest_in_flight_or_max();
        }
        drop(inner);
        self.waiters.notify_all();
    }

    /// `CommitTransaction(t)`: fold `t` into the current snapshot and
    /// advance `all_committed_before` if `t` was the earliest in-flight.
    ///
    /// # Panics
    /// Fatal if `t` is not APPLYING (double-commit, or committing a
    /// never-started timestamp).
    pub fn commit_transaction(&self, t: Timestamp) {
        let mut inner = self.inner.lock();
        match inner.in_flight.remove(&t.value()) {
            Some(TxnState::Applying) => {}
            other => panic!("mvcc: commit on non-applying txn {t}: {other:?}"),
        }
        let was_earliest = inner.earliest_in_flight == t;
        inner.cur_snap.widen_with([t]);
        if was_earliest {
            inner.earliest_in_flight = inner.earliest_in_flight_or_max();
            // every timestamp below the new earliest in-flight (or safe_time,
            // whichever is lower) is now permanently committed.
            let floor = inner.earliest_in_flight.min(inner.safe_time.next());
            if floor > inner.cur_snap.all_committed_before {
                inner.cur_snap.all_committed_before = floor;
            }
        }
        drop(inner);
        self.waiters.notify_all();
    }

    /// `AdjustSafeTime(t)`: monotonically raise the safe-time floor.
    pub fn adjust_safe_time(&self, t: Timestamp) {
        let mut inner = self.inner.lock();
        if t > inner.safe_time {
            inner.safe_time = t;
            let floor = inner.earliest_in_flight.min(inner.safe_time.next());
            if floor > inner.cur_snap.all_committed_before {
                inner.cur_snap.all_committed_before = floor;
            }
        }
        drop(inner);
        self.waiters.notify_all();
    }

    /// The watermark below which every timestamp is committed or aborted:
    /// `min(safe_time, earliest_in_flight)`.
    pub fn clean_time(&self) -> Timestamp {
        let inner = self.inner.lock();
        inner.safe_time.min(inner.earliest_in_flight)
    }

    pub fn safe_time(&self) -> Timestamp {
        self.inner.lock().safe_time
    }

    /// Take a snapshot of the current MVCC state.
    pub fn take_snapshot(&self) -> Snapshot {
        self.inner.lock().cur_snap.clone()
    }

    pub fn count_in_flight(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    /// Wait (bounded by `deadline`) until every timestamp `<= ts` is
    /// either committed or aborted, then return a repeatable snapshot.
    pub fn wait_for_snapshot_with_all_committed(
        &self,
        ts: Timestamp,
        deadline: Instant,
    ) -> RuntimeResult<Snapshot> {
        self.wait_until(WaitFor::AllCommitted, ts, deadline)?;
        Ok(self.take_snapshot())
    }

    /// Wait for every op that is currently APPLYING to commit. Does not
    /// guarantee no op is APPLYING on return, only that ops APPLYING at
    /// call time have finished.
    pub fn wait_for_applying_transactions_to_commit(&self) -> RuntimeResult<()> {
        self.wait_until(WaitFor::NoneApplying, Timestamp::MAX, Instant::now() + Duration::from_secs(3600))
    }

    fn wait_until(&self, wait_for: WaitFor, ts: Timestamp, deadline: Instant) -> RuntimeResult<()> {
        let mut inner = self.inner.lock();
        loop {
            self.check_open()?;
            if Self::is_done_waiting(&inner, wait_for, ts) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(MvccError::TimedOut.into());
            }
            let timed_out = self.waiters.wait_for(&mut inner, deadline - now).timed_out();
            if timed_out && !Self::is_done_waiting(&inner, wait_for, ts) {
                return Err(MvccError::TimedOut.into());
            }
        }
    }

    fn is_done_waiting(inner: &Inner, wait_for: WaitFor, ts: Timestamp) -> bool {
        match wait_for {
            WaitFor::AllCommitted => !inner
                .in_flight
                .keys()
                .any(|&t| Timestamp::new(t) <= ts),
            WaitFor::NoneApplying => !inner
                .in_flight
                .values()
                .any(|&s| s == TxnState::Applying),
        }
    }

    /// Close the coordinator: wake every waiter with `Aborted`, and refuse
    /// all subsequent `start_transaction` calls.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
        self.waiters.notify_all();
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_commit_visible_after_commit_only() {
        let mvcc = Mvcc::new();
        let t1 = Timestamp::new(1);
        mvcc.start_transaction(t1).unwrap();
        let snap = mvcc.take_snapshot();
        assert!(!snap.is_committed(t1));
        mvcc.start_applying_transaction(t1);
        mvcc.commit_transaction(t1);
        let snap = mvcc.take_snapshot();
        assert!(snap.is_committed(t1));
    }

    #[test]
    fn out_of_order_commit() {
        let mvcc = Mvcc::new();
        let t5 = Timestamp::new(5);
        let t10 = Timestamp::new(10);
        mvcc.start_transaction(t5).unwrap();
        mvcc.start_transaction(t10).unwrap();
        mvcc.start_applying_transaction(t10);
        mvcc.commit_transaction(t10);
        let snap = mvcc.take_snapshot();
        assert!(snap.is_committed(t10));
        assert!(!snap.is_committed(t5));

        mvcc.start_applying_transaction(t5);
        mvcc.commit_transaction(t5);
        mvcc.adjust_safe_time(t10);
        let snap = mvcc.take_snapshot();
        assert!(snap.is_committed(t5));
        assert!(snap.is_committed(t10));
        assert!(snap.is_clean());
    }

    #[test]
    #[should_panic]
    fn double_commit_is_fatal() {
        let mvcc = Mvcc::new();
        let t = Timestamp::new(1);
        mvcc.start_transaction(t).unwrap();
        mvcc.start_applying_transaction(t);
        mvcc.commit_transaction(t);
        mvcc.commit_transaction(t);
    }

    #[test]
    #[should_panic]
    fn double_abort_is_fatal() {
        let mvcc = Mvcc::new();
        let t = Timestamp::new(1);
        mvcc.start_transaction(t).unwrap();
        mvcc.abort_transaction(t);
        mvcc.abort_transaction(t);
    }

    #[test]
    #[should_panic]
    fn commit_without_applying_is_fatal() {
        let mvcc = Mvcc::new();
        let t = Timestamp::new(1);
        mvcc.start_transaction(t).unwrap();
        mvcc.commit_transaction(t);
    }

    #[test]
    fn close_wakes_waiters_with_aborted() {
        let mvcc = std::sync::Arc::new(Mvcc::new());
        let t1 = Timestamp::new(1);
        mvcc.start_transaction(t1).unwrap();
        let mvcc2 = mvcc.clone();
        let handle = std::thread::spawn(move || {
            mvcc2.wait_for_snapshot_with_all_committed(t1, Instant::now() + Duration::from_secs(10))
        });
        std::thread::sleep(Duration::from_millis(50));
        mvcc.close();
        let res = handle.join().unwrap();
        assert!(matches!(res.unwrap_err().kind(), crate::error::ErrorKind::Mvcc(MvccError::Aborted)));
    }
}
