// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Daemon-facing transport endpoint
//!
//! A [`Device`] is the daemon's open transport file. It starts unbound, is
//! installed in an [`FdTable`] under a descriptor number, and is bound to a
//! fresh [`Connection`] when a mount names that descriptor.

use crate::conn::{ConnState, Connection};
use crate::error::{FuseError, FuseResult, LocalFault};
use crate::fault::FaultOp;
use crate::lock;
use crate::request::{Completion, ReqState, Request};
use fusewire_proto::abi::IN_HEADER_SIZE;
use fusewire_proto::{split_struct, validate_reply_header, OutHeader, ValidationError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// Readiness reported by [`Device::poll`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PollStatus {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

#[derive(Debug, Default)]
pub struct Device {
    binding: Mutex<Option<Connection>>,
    nonblocking: AtomicBool,
}

impl Device {
    pub fn open() -> Self {
        Self::default()
    }

    /// Binds a connection created by `create`; a device serves one mount.
    pub(crate) fn bind_with<F>(&self, create: F) -> FuseResult<Connection>
    where
        F: FnOnce() -> Connection,
    {
        let mut binding = lock(&self.binding);
        if binding.is_some() {
            return Err(FuseError::InvalidArgument);
        }
        let conn = create();
        *binding = Some(conn.clone());
        Ok(conn)
    }

    #[cfg(test)]
    pub(crate) fn bind(&self, conn: Connection) -> FuseResult<()> {
        self.bind_with(|| conn).map(|_| ())
    }

    pub fn connection(&self) -> Option<Connection> {
        lock(&self.binding).clone()
    }

    fn bound(&self) -> FuseResult<Connection> {
        self.connection().ok_or(FuseError::PermissionDenied)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) {
        self.nonblocking.store(nonblocking, Ordering::SeqCst);
    }

    /// Copies the oldest pending request into `buf` and returns its length.
    pub fn read_request(&self, buf: &mut [u8]) -> FuseResult<usize> {
        let conn = self.bound()?;
        read_one(&conn, buf, self.nonblocking.load(Ordering::SeqCst))
    }

    /// `read_request` into a buffer big enough for any request.
    pub fn read_frame(&self) -> FuseResult<Vec<u8>> {
        let conn = self.bound()?;
        let config = conn.config();
        let mut buf = vec![0; IN_HEADER_SIZE + config.max_request_bytes() + config.page_size];
        let len = read_one(&conn, &mut buf, self.nonblocking.load(Ordering::SeqCst))?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Delivers one reply frame; returns the number of bytes consumed.
    pub fn write_reply(&self, bytes: &[u8]) -> FuseResult<usize> {
        let conn = self.bound()?;
        write_one(&conn, bytes)
    }

    pub fn poll(&self) -> PollStatus {
        let Some(conn) = self.connection() else {
            return PollStatus {
                error: true,
                ..Default::default()
            };
        };
        let state = conn.lock();
        if !state.connected {
            return PollStatus {
                error: true,
                ..Default::default()
            };
        }
        PollStatus {
            readable: !state.pending.is_empty(),
            writable: true,
            error: false,
        }
    }

    /// Closes the daemon side: aborts every request and drops this holder.
    pub fn release(&self) {
        let Some(conn) = lock(&self.binding).take() else {
            return;
        };
        conn.abort();
        conn.release_holder("device");
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.release();
    }
}

fn read_one(conn: &Connection, buf: &mut [u8], nonblocking: bool) -> FuseResult<usize> {
    let mut state = conn.lock();
    while state.connected && state.mounted && state.pending.is_empty() {
        if nonblocking {
            return Err(FuseError::WouldBlock);
        }
        state = conn
            .shared
            .reader_wait
            .wait(state)
            .unwrap_or_else(PoisonError::into_inner);
    }
    if !state.connected {
        return Err(FuseError::NoDevice);
    }
    let Some(unique) = state.pending.pop_front() else {
        return Err(FuseError::NoDevice);
    };
    let Some(req) = state.requests.get_mut(&unique) else {
        return Err(FuseError::UnknownRequest(unique));
    };
    req.state = ReqState::Sent;
    req.flags.locked = true;
    let frame = req.encode_frame();
    drop(state);

    let copied = if buf.len() < frame.len() {
        Err(FuseError::InvalidArgument)
    } else if let Some(err) = conn.faults().check(FaultOp::DeviceRead) {
        Err(err)
    } else {
        buf[..frame.len()].copy_from_slice(&frame);
        Ok(frame.len())
    };

    let mut state = conn.lock();
    let (retired, outcome) = after_copy(&mut state, unique, copied);
    drop(state);
    if let Some(req) = retired {
        conn.retire(req);
    }
    outcome
}

/// Settles a request whose frame was just copied out.
fn after_copy(
    state: &mut ConnState,
    unique: u64,
    copied: FuseResult<usize>,
) -> (Option<Request>, FuseResult<usize>) {
    let Some(req) = state.requests.get_mut(&unique) else {
        return (None, Err(FuseError::UnknownRequest(unique)));
    };
    req.flags.locked = false;
    let flags = req.flags;
    match copied {
        Err(err) => {
            let fault = if flags.interrupted {
                LocalFault::Interrupted
            } else {
                LocalFault::Transport
            };
            debug!(target: "fusewire::device", unique, error = %err, "request copy failed");
            let retired = Connection::finish_locked(state, unique, Completion::Fault(fault));
            (retired, Err(err))
        }
        Ok(_) if flags.aborted => {
            let retired =
                Connection::finish_locked(state, unique, Completion::Fault(LocalFault::Aborted));
            (retired, Err(FuseError::NoDevice))
        }
        Ok(_) if flags.interrupted => {
            let retired =
                Connection::finish_locked(state, unique, Completion::Fault(LocalFault::Interrupted));
            (retired, Err(FuseError::UnknownRequest(unique)))
        }
        Ok(len) if !flags.is_reply => {
            let retired = Connection::finish_locked(state, unique, Completion::Replied(0));
            (retired, Ok(len))
        }
        Ok(len) => {
            req.state = ReqState::Processing;
            state.processing.insert(unique);
            (None, Ok(len))
        }
    }
}

fn write_one(conn: &Connection, bytes: &[u8]) -> FuseResult<usize> {
    let Ok((header, body)) = split_struct::<OutHeader>(bytes) else {
        return Err(FuseError::InvalidArgument);
    };
    match validate_reply_header(&header, bytes.len()) {
        // Malformed bodies are charged to the request below.
        Ok(()) | Err(ValidationError::ErrorWithBody(_)) => {}
        Err(err) => {
            warn!(target: "fusewire::device", conn = conn.id(), error = %err, "rejected reply header");
            return Err(FuseError::InvalidArgument);
        }
    }
    let unique = header.unique;
    let injected = conn.faults().check(FaultOp::DeviceWrite);

    let mut state = conn.lock();
    if !state.connected {
        return Err(FuseError::NoDevice);
    }
    if !state.processing.remove(&unique) {
        state.protocol_violations += 1;
        warn!(target: "fusewire::device", conn = conn.id(), unique, "reply for unknown request");
        return Err(FuseError::UnknownRequest(unique));
    }
    let Some(req) = state.requests.get_mut(&unique) else {
        return Err(FuseError::UnknownRequest(unique));
    };

    let (completion, outcome) = if req.flags.interrupted {
        (
            Completion::Fault(LocalFault::Interrupted),
            Err(FuseError::UnknownRequest(unique)),
        )
    } else if let Some(err) = injected {
        (Completion::Fault(LocalFault::Transport), Err(err))
    } else {
        match req.fill_reply(header.errno(), body) {
            Ok(()) => (Completion::Replied(header.errno()), Ok(bytes.len())),
            Err(reason) => {
                warn!(target: "fusewire::device", conn = conn.id(), unique, %reason, "malformed reply");
                (
                    Completion::Fault(LocalFault::ProtocolViolation),
                    Err(FuseError::InvalidArgument),
                )
            }
        }
    };
    if completion == Completion::Fault(LocalFault::ProtocolViolation) {
        state.protocol_violations += 1;
    }
    debug!(target: "fusewire::device", conn = conn.id(), unique, ?completion, "reply");
    let retired = Connection::finish_locked(&mut state, unique, completion);
    drop(state);
    if let Some(req) = retired {
        conn.retire(req);
    }
    outcome
}

/// Process-wide table mapping descriptor numbers to open devices.
#[derive(Debug, Default)]
pub struct FdTable {
    entries: Mutex<HashMap<u32, Arc<Device>>>,
}

impl FdTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, fd: u32, device: Arc<Device>) -> FuseResult<()> {
        let mut entries = lock(&self.entries);
        if entries.contains_key(&fd) {
            return Err(FuseError::InvalidArgument);
        }
        entries.insert(fd, device);
        Ok(())
    }

    pub fn get(&self, fd: u32) -> Option<Arc<Device>> {
        lock(&self.entries).get(&fd).cloned()
    }

    pub fn close(&self, fd: u32) -> Option<Arc<Device>> {
        lock(&self.entries).remove(&fd)
    }
}
