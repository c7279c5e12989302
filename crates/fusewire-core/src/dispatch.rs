// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Synchronous, background and no-reply send primitives

use crate::conn::{ConnState, Connection};
use crate::error::{FuseError, FuseResult, LocalFault};
use crate::lock;
use crate::request::{Completion, ReqState, Request};
use crate::task::Task;
use std::sync::{Arc, MutexGuard, PoisonError};
use tracing::debug;

impl Connection {
    /// Assigns the unique id, settles the admission unit and queues `req`
    /// for the daemon.
    fn queue_request(&self, state: &mut ConnState, mut req: Request) -> u64 {
        let unique = state.next_unique();
        req.header.unique = unique;
        req.state = ReqState::Pending;
        Self::charge_unit(state, &mut req);
        debug!(
            target: "fusewire::dispatch",
            conn = self.id(),
            unique,
            opcode = req.header.opcode,
            nodeid = req.header.nodeid,
            background = req.flags.background,
            reply = req.flags.is_reply,
            "queued"
        );
        state.requests.insert(unique, req);
        state.pending.push_back(unique);
        self.shared.reader_wait.notify_one();
        unique
    }

    /// Gets a request and lets `build` fill it in; the request goes back to
    /// the pool if building fails.
    pub fn prepare<F>(&self, task: &Task, build: F) -> FuseResult<Request>
    where
        F: FnOnce(&mut Request) -> FuseResult<()>,
    {
        let mut req = self.get_request(task)?;
        if let Err(err) = build(&mut req) {
            self.put_request(req);
            return Err(err);
        }
        Ok(req)
    }

    /// Sends `req` and blocks until the daemon replies.
    ///
    /// `Ok` carries the finished request whatever errno the daemon chose;
    /// check [`Request::result`] and hand it back with `put_request`. Local
    /// faults come back as `Err`, with the request already recycled, or
    /// detached into the background when an interrupt arrives after the
    /// daemon has seen it.
    pub fn send(&self, mut req: Request, task: &Task) -> FuseResult<Request> {
        req.flags.is_reply = true;
        let mut state = self.lock();
        if let Err(fault) = state.check_usable() {
            drop(state);
            req.mark_finished(Completion::Fault(fault));
            self.put_request(req);
            return Err(fault.into());
        }
        let unique = self.queue_request(&mut state, req);
        self.wait_answer(state, unique, task)
    }

    /// `send` that also turns a daemon errno into `Err(Daemon)`.
    pub fn call(&self, req: Request, task: &Task) -> FuseResult<Request> {
        let req = self.send(req, task)?;
        if let Err(err) = req.result() {
            self.put_request(req);
            return Err(err);
        }
        Ok(req)
    }

    /// Builds, sends and decodes one synchronous round trip.
    pub fn roundtrip<T, B, D>(&self, task: &Task, build: B, decode: D) -> FuseResult<T>
    where
        B: FnOnce(&mut Request) -> FuseResult<()>,
        D: FnOnce(&Request) -> FuseResult<T>,
    {
        let req = self.prepare(task, build)?;
        let req = self.call(req, task)?;
        let out = decode(&req);
        self.put_request(req);
        out
    }

    fn wait_answer(
        &self,
        mut state: MutexGuard<'_, ConnState>,
        unique: u64,
        task: &Task,
    ) -> FuseResult<Request> {
        let Some(waitq) = state.requests.get(&unique).map(|req| req.waitq.clone()) else {
            return Err(FuseError::UnknownRequest(unique));
        };
        {
            let weak = Arc::downgrade(&self.shared);
            let wake = waitq.clone();
            let _armed = task.signal().arm(Arc::new(move || {
                if let Some(shared) = weak.upgrade() {
                    let _guard = lock(&shared.state);
                    wake.notify_all();
                }
            }));
            loop {
                let finished = state
                    .requests
                    .get(&unique)
                    .map_or(true, |req| req.state == ReqState::Finished);
                if finished || task.signal().is_pending() {
                    break;
                }
                state = waitq.wait(state).unwrap_or_else(PoisonError::into_inner);
            }
        }

        match state.requests.get(&unique).map(|req| req.state) {
            Some(ReqState::Finished) | None => {
                let req = state.requests.remove(&unique);
                drop(state);
                let req = req.ok_or(FuseError::UnknownRequest(unique))?;
                if let Completion::Fault(fault) = req.completion() {
                    self.put_request(req);
                    return Err(fault.into());
                }
                Ok(req)
            }
            Some(ReqState::Pending) => {
                state.pending.retain(|id| *id != unique);
                let req = state.requests.remove(&unique);
                drop(state);
                if let Some(mut req) = req {
                    req.flags.interrupted = true;
                    req.mark_finished(Completion::Fault(LocalFault::Interrupted));
                    self.put_request(req);
                }
                debug!(target: "fusewire::dispatch", conn = self.id(), unique, "interrupted before read");
                Err(FuseError::Interrupted)
            }
            Some(_) => {
                // The daemon may already act on it: keep it queued so the
                // reply is consumed and its references released later.
                if let Some(req) = state.requests.get_mut(&unique) {
                    req.flags.interrupted = true;
                    req.flags.background = true;
                }
                state.background.push_back(unique);
                debug!(target: "fusewire::dispatch", conn = self.id(), unique, "interrupted after read, moved to background");
                Err(FuseError::Interrupted)
            }
        }
    }

    /// Queues `req` without waiting; the completion path releases its
    /// references and runs its end callback, if any.
    pub fn send_background(&self, mut req: Request) -> FuseResult<()> {
        req.flags.is_reply = true;
        req.flags.background = true;
        let mut state = self.lock();
        if let Err(fault) = state.check_usable() {
            drop(state);
            req.mark_finished(Completion::Fault(fault));
            self.retire(req);
            return Err(fault.into());
        }
        let unique = self.queue_request(&mut state, req);
        state.background.push_back(unique);
        Ok(())
    }

    /// Queues `req` for a one-way notification; it is recycled as soon as
    /// the daemon has read it.
    pub fn send_noreply(&self, mut req: Request) -> FuseResult<()> {
        req.flags.is_reply = false;
        let mut state = self.lock();
        if let Err(fault) = state.check_connected() {
            drop(state);
            req.mark_finished(Completion::Fault(fault));
            self.retire(req);
            return Err(fault.into());
        }
        self.queue_request(&mut state, req);
        Ok(())
    }
}
