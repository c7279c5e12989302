// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Connection: request queues, the preallocated pool, admission control and
//! the mount/device lifecycle shared by both holders.

use crate::config::ConnConfig;
use crate::error::{FuseError, FuseResult, LocalFault};
use crate::fault::FaultInjector;
use crate::lock;
use crate::options::{MountFlags, MountOptions};
use crate::request::{Completion, ReqState, Request};
use crate::task::Task;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Capabilities agreed with the daemon in INIT.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Negotiated {
    /// Set once a valid INIT reply has been processed.
    pub initialized: bool,
    pub minor: u32,
    pub max_write: u32,
    pub max_readahead: u32,
    pub async_read: bool,
}

/// Point-in-time view of a connection's bookkeeping.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConnStats {
    pub pending: usize,
    pub processing: usize,
    pub background: usize,
    /// Requests owned by the connection in any queue, including finished
    /// ones not yet collected by their waiter.
    pub queued: usize,
    pub unused: usize,
    pub available: usize,
    pub debt: usize,
    pub waiting: usize,
    pub holders: u32,
    pub mounted: bool,
    pub connected: bool,
    pub conn_error: bool,
    pub freed: bool,
    pub protocol_violations: u64,
    pub faults_injected: u64,
    pub reqctr: u64,
}

pub(crate) struct ConnState {
    pub(crate) mounted: bool,
    pub(crate) connected: bool,
    pub(crate) conn_error: bool,
    pub(crate) user_id: u32,
    pub(crate) group_id: u32,
    pub(crate) flags: MountFlags,
    pub(crate) max_read: u32,
    pub(crate) negotiated: Negotiated,
    pub(crate) reqctr: u64,
    pub(crate) requests: HashMap<u64, Request>,
    pub(crate) pending: VecDeque<u64>,
    pub(crate) processing: HashSet<u64>,
    pub(crate) background: VecDeque<u64>,
    pub(crate) unused: Vec<Request>,
    pub(crate) available: usize,
    pub(crate) debt: usize,
    pub(crate) waiting: usize,
    pub(crate) holders: u32,
    pub(crate) freed: bool,
    pub(crate) protocol_violations: u64,
}

impl ConnState {
    /// Next unique id; zero is never handed out.
    pub(crate) fn next_unique(&mut self) -> u64 {
        self.reqctr = self.reqctr.wrapping_add(1);
        if self.reqctr == 0 {
            self.reqctr = 1;
        }
        self.reqctr
    }

    pub(crate) fn check_connected(&self) -> Result<(), LocalFault> {
        if !self.connected {
            return Err(LocalFault::NotConnected);
        }
        Ok(())
    }

    pub(crate) fn check_usable(&self) -> Result<(), LocalFault> {
        self.check_connected()?;
        if self.conn_error {
            return Err(LocalFault::ConnectionRefused);
        }
        Ok(())
    }
}

pub(crate) struct Shared {
    pub(crate) id: u64,
    pub(crate) state: Mutex<ConnState>,
    /// Daemon threads blocked in `Device::read_request`.
    pub(crate) reader_wait: Condvar,
    /// Callers blocked in `get_request`.
    pub(crate) admission_wait: Condvar,
    pub(crate) config: ConnConfig,
    pub(crate) faults: FaultInjector,
}

/// One mount's channel to its userspace daemon.
///
/// Cloning the handle does not add a holder; the two holders (mount and
/// device) are tracked explicitly and the connection is freed when both
/// have released it.
#[derive(Clone)]
pub struct Connection {
    pub(crate) shared: Arc<Shared>,
}

impl Connection {
    pub(crate) fn new(config: ConnConfig, options: &MountOptions) -> Self {
        let pool = config.max_outstanding;
        let unused = (0..pool).map(|_| Request::new(true)).collect();
        let state = ConnState {
            mounted: true,
            connected: true,
            conn_error: false,
            user_id: options.user_id,
            group_id: options.group_id,
            flags: options.flags,
            max_read: options.max_read,
            negotiated: Negotiated::default(),
            reqctr: 0,
            requests: HashMap::new(),
            pending: VecDeque::new(),
            processing: HashSet::new(),
            background: VecDeque::new(),
            unused,
            available: pool,
            debt: 0,
            waiting: 0,
            holders: 2,
            freed: false,
            protocol_violations: 0,
        };
        let id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
        info!(target: "fusewire::conn", conn = id, pool, "connection created");
        Self {
            shared: Arc::new(Shared {
                id,
                state: Mutex::new(state),
                reader_wait: Condvar::new(),
                admission_wait: Condvar::new(),
                faults: FaultInjector::new(config.faults.clone()),
                config,
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ConnState> {
        lock(&self.shared.state)
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn config(&self) -> &ConnConfig {
        &self.shared.config
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.shared.faults
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn is_mounted(&self) -> bool {
        self.lock().mounted
    }

    pub fn has_error(&self) -> bool {
        self.lock().conn_error
    }

    pub fn negotiated(&self) -> Negotiated {
        self.lock().negotiated
    }

    pub fn user_id(&self) -> u32 {
        self.lock().user_id
    }

    pub fn group_id(&self) -> u32 {
        self.lock().group_id
    }

    pub fn flags(&self) -> MountFlags {
        self.lock().flags
    }

    pub fn max_read(&self) -> u32 {
        self.lock().max_read
    }

    pub fn stats(&self) -> ConnStats {
        let state = self.lock();
        ConnStats {
            pending: state.pending.len(),
            processing: state.processing.len(),
            background: state.background.len(),
            queued: state.requests.len(),
            unused: state.unused.len(),
            available: state.available,
            debt: state.debt,
            waiting: state.waiting,
            holders: state.holders,
            mounted: state.mounted,
            connected: state.connected,
            conn_error: state.conn_error,
            freed: state.freed,
            protocol_violations: state.protocol_violations,
            faults_injected: self.shared.faults.injected(),
            reqctr: state.reqctr,
        }
    }

    /// Takes one admission unit and a request from the pool.
    ///
    /// Blocks while every unit is in use; only `task`'s signal ends the wait
    /// early, with `Interrupted`.
    pub fn get_request(&self, task: &Task) -> FuseResult<Request> {
        let mut state = self.lock();
        state.waiting += 1;
        if state.available == 0 {
            let weak = Arc::downgrade(&self.shared);
            let _armed = task.signal().arm(Arc::new(move || {
                if let Some(shared) = weak.upgrade() {
                    let _guard = lock(&shared.state);
                    shared.admission_wait.notify_all();
                }
            }));
            while state.available == 0 && !task.signal().is_pending() {
                state = self
                    .shared
                    .admission_wait
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if state.available == 0 {
                state.waiting -= 1;
                debug!(target: "fusewire::conn", conn = self.id(), pid = task.pid, "admission wait interrupted");
                return Err(FuseError::Interrupted);
            }
        }
        state.available -= 1;
        // The pool only runs dry if units outnumber pooled requests.
        let mut req = state.unused.pop().unwrap_or_else(|| Request::new(false));
        drop(state);

        req.holds_unit = true;
        req.counted_waiting = true;
        req.stamp(task);
        Ok(req)
    }

    /// A request outside the pool and without an admission unit.
    ///
    /// Used for FORGET and RELEASE, which must be sendable even when the
    /// pool is exhausted; the unit is settled when the request is queued.
    pub fn reserve_request(&self) -> Request {
        Request::new(false)
    }

    /// Recycles a request and gives back its admission unit, debt first.
    ///
    /// Takes the request by value, so a second put of the same request
    /// cannot be expressed.
    pub fn put_request(&self, mut req: Request) {
        let holds_unit = req.holds_unit;
        let counted_waiting = req.counted_waiting;
        let preallocated = req.flags.preallocated;
        // Drops inode and file references outside the lock.
        req.reset();

        let mut state = self.lock();
        if counted_waiting {
            state.waiting = state.waiting.saturating_sub(1);
        }
        if preallocated && !state.freed {
            state.unused.push(req);
        }
        if holds_unit {
            if state.debt > 0 {
                state.debt -= 1;
            } else {
                state.available += 1;
                self.shared.admission_wait.notify_one();
            }
        }
    }

    /// Takes the admission unit of a request that is about to be queued,
    /// running into debt when none is free.
    pub(crate) fn charge_unit(state: &mut ConnState, req: &mut Request) {
        if req.holds_unit {
            return;
        }
        if state.available > 0 {
            state.available -= 1;
        } else {
            state.debt += 1;
        }
        req.holds_unit = true;
    }

    /// Forces a disconnect: every queued request ends with `Aborted`.
    pub fn abort(&self) {
        let retired = {
            let mut state = self.lock();
            if !state.connected {
                return;
            }
            state.connected = false;
            let retired = Self::end_all(&mut state, LocalFault::Aborted);
            self.shared.reader_wait.notify_all();
            self.shared.admission_wait.notify_all();
            retired
        };
        info!(target: "fusewire::conn", conn = self.id(), ended = retired.len(), "connection aborted");
        for req in retired {
            self.retire(req);
        }
    }

    /// Ends pending and processing requests; requests mid-copy are flagged
    /// and ended by the thread copying them.
    fn end_all(state: &mut ConnState, fault: LocalFault) -> Vec<Request> {
        let mut ids: Vec<u64> = state.pending.drain(..).collect();
        ids.extend(state.processing.drain());
        let mut retired = Vec::new();
        for unique in ids {
            if let Some(req) = Self::finish_locked(state, unique, Completion::Fault(fault)) {
                retired.push(req);
            }
        }
        for req in state.requests.values_mut() {
            if req.state == ReqState::Sent {
                req.flags.aborted = true;
            }
        }
        retired
    }

    /// Marks `unique` finished and unlinks it from the queues.
    ///
    /// Returns the request when nobody waits for it; the caller must hand
    /// it to [`Connection::retire`] after dropping the lock.
    pub(crate) fn finish_locked(
        state: &mut ConnState,
        unique: u64,
        completion: Completion,
    ) -> Option<Request> {
        let req = state.requests.get_mut(&unique)?;
        let was_pending = req.state == ReqState::Pending;
        req.mark_finished(completion);
        let waited_on = req.flags.is_reply && !req.flags.background;
        if was_pending {
            state.pending.retain(|id| *id != unique);
        }
        state.processing.remove(&unique);
        if waited_on {
            return None;
        }
        if let Some(pos) = state.background.iter().position(|id| *id == unique) {
            state.background.remove(pos);
        }
        state.requests.remove(&unique)
    }

    /// Completion path for requests nobody waits on: releases their
    /// references, then runs the end callback or recycles them.
    pub(crate) fn retire(&self, mut req: Request) {
        drop(req.take_resources());
        match req.end.take() {
            Some(end) => end(self, req),
            None => self.put_request(req),
        }
    }

    /// First half of unmount: stops new dispatch and wakes daemon readers.
    pub(crate) fn begin_unmount(&self) {
        let mut state = self.lock();
        state.mounted = false;
        state.user_id = 0;
        state.group_id = 0;
        state.flags = MountFlags::default();
        self.shared.reader_wait.notify_all();
    }

    /// Releases the inode and file references of every background request.
    ///
    /// The requests stay queued; their replies, or the device release, still
    /// finish and recycle them.
    pub(crate) fn drain_background(&self) -> usize {
        let released: Vec<_> = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let mut released = Vec::with_capacity(state.background.len());
            for unique in state.background.drain(..) {
                if let Some(req) = state.requests.get_mut(&unique) {
                    released.push(req.take_resources());
                }
            }
            released
        };
        let count = released.len();
        drop(released);
        count
    }

    /// Drops one holder; frees the connection when none remain.
    pub(crate) fn release_holder(&self, holder: &'static str) {
        let mut state = self.lock();
        state.holders = state.holders.saturating_sub(1);
        debug!(target: "fusewire::conn", conn = self.id(), holder, remaining = state.holders, "holder released");
        if state.holders == 0 && !state.mounted && !state.connected && !state.freed {
            state.freed = true;
            state.unused.clear();
            info!(target: "fusewire::conn", conn = self.id(), "connection freed");
        }
    }

    pub fn is_freed(&self) -> bool {
        self.lock().freed
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("id", &self.id()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_connection;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn pool_is_preallocated_to_admission_limit() {
        let conn = test_connection(ConnConfig::default());
        let stats = conn.stats();
        assert_eq!(stats.unused, 10);
        assert_eq!(stats.available, 10);
        assert_eq!(stats.debt, 0);
        assert_eq!(stats.holders, 2);
        assert!(stats.mounted && stats.connected);
    }

    #[test]
    fn get_and_put_balance_units() {
        let conn = test_connection(ConnConfig::default());
        let task = Task::new(0, 0, 1);
        let req = conn.get_request(&task).expect("request");
        assert!(req.is_preallocated());
        assert_eq!(conn.stats().available, 9);
        assert_eq!(conn.stats().waiting, 1);

        conn.put_request(req);
        let stats = conn.stats();
        assert_eq!(stats.available, 10);
        assert_eq!(stats.unused, 10);
        assert_eq!(stats.waiting, 0);
    }

    #[test]
    fn reserved_request_holds_no_unit() {
        let conn = test_connection(ConnConfig::default());
        let req = conn.reserve_request();
        assert!(!req.is_preallocated());
        conn.put_request(req);
        let stats = conn.stats();
        assert_eq!(stats.available, 10);
        assert_eq!(stats.unused, 10);
    }

    #[test]
    fn put_pays_debt_before_freeing_units() {
        let config = ConnConfig {
            max_outstanding: 1,
            ..Default::default()
        };
        let conn = test_connection(config);
        let task = Task::new(0, 0, 1);
        let held = conn.get_request(&task).expect("request");

        let mut extra = conn.reserve_request();
        {
            let mut state = conn.lock();
            Connection::charge_unit(&mut state, &mut extra);
            assert_eq!(state.debt, 1);
        }

        conn.put_request(held);
        assert_eq!(conn.stats().debt, 0);
        assert_eq!(conn.stats().available, 0);

        conn.put_request(extra);
        assert_eq!(conn.stats().available, 1);
    }

    #[test]
    fn admission_wait_is_interruptible() {
        let config = ConnConfig {
            max_outstanding: 1,
            ..Default::default()
        };
        let conn = test_connection(config);
        let holder = Task::new(0, 0, 1);
        let held = conn.get_request(&holder).expect("request");

        let blocked = Task::new(0, 0, 2);
        let signal = blocked.signal().clone();
        let waiter = {
            let conn = conn.clone();
            thread::spawn(move || conn.get_request(&blocked).map(|_| ()))
        };
        thread::sleep(Duration::from_millis(50));
        signal.raise();

        let outcome = waiter.join().expect("join");
        assert!(matches!(outcome, Err(FuseError::Interrupted)));
        assert_eq!(conn.stats().waiting, 1);
        conn.put_request(held);
        assert_eq!(conn.stats().waiting, 0);
    }

    #[test]
    fn blocked_get_wakes_on_put() {
        let config = ConnConfig {
            max_outstanding: 1,
            ..Default::default()
        };
        let conn = test_connection(config);
        let task = Task::new(0, 0, 1);
        let held = conn.get_request(&task).expect("request");

        let waiter = {
            let conn = conn.clone();
            thread::spawn(move || {
                let req = conn.get_request(&Task::new(0, 0, 2))?;
                conn.put_request(req);
                Ok::<_, FuseError>(())
            })
        };
        thread::sleep(Duration::from_millis(20));
        conn.put_request(held);
        waiter.join().expect("join").expect("second request");
        assert_eq!(conn.stats().available, 1);
    }

    #[test]
    fn connection_freed_only_after_both_holders() {
        let conn = test_connection(ConnConfig::default());
        conn.begin_unmount();
        conn.release_holder("mount");
        assert!(!conn.is_freed());
        conn.abort();
        conn.release_holder("device");
        let stats = conn.stats();
        assert!(stats.freed);
        assert_eq!(stats.holders, 0);
        assert_eq!(stats.unused, 0);
    }

    #[test]
    fn drain_releases_pinned_inodes_and_keeps_requests_queued() {
        use crate::inode::IdentityMap;
        use crate::sink::CountingSink;
        use fusewire_proto::abi::S_IFREG;
        use fusewire_proto::{Attr, Opcode};
        use std::sync::Arc;

        let conn = test_connection(ConnConfig::default());
        let map = IdentityMap::new(conn.clone(), Arc::new(CountingSink::default()));
        let attr = Attr {
            mode: S_IFREG | 0o644,
            nlink: 1,
            ..Default::default()
        };
        let inode = map.resolve(4, 0, &attr).expect("resolve");

        let mut req = conn.reserve_request();
        req.set_opcode(Opcode::Release).set_nodeid(4);
        req.set_inode(inode.clone());
        conn.send_background(req).expect("queued");
        drop(inode);
        assert_eq!(map.ref_count(4), Some(1));

        assert_eq!(conn.drain_background(), 1);
        assert_eq!(map.ref_count(4), None);
        let stats = conn.stats();
        assert_eq!(stats.background, 0);
        // The RELEASE stays queued next to the FORGET the eviction sent.
        assert_eq!(stats.queued, 2);
        assert_eq!(conn.drain_background(), 0);
    }

    #[test]
    fn unique_ids_skip_zero() {
        let conn = test_connection(ConnConfig::default());
        let mut state = conn.lock();
        state.reqctr = u64::MAX;
        assert_eq!(state.next_unique(), 1);
        assert_eq!(state.next_unique(), 2);
    }
}
