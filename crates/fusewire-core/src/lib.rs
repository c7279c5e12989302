// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! fusewire core: the kernel side of a userspace filesystem transport
//!
//! A [`Mount`] owns one [`Connection`] to a daemon that serves requests
//! through a [`Device`]. Requests flow through a bounded pool with explicit
//! admission control; replies are matched back to their callers by unique
//! ID, and daemon node IDs are mapped to resident inodes by the
//! [`IdentityMap`].

pub mod config;
pub mod conn;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod fault;
pub mod file;
pub mod inode;
pub mod mount;
pub mod ops;
pub mod options;
pub mod request;
pub mod sink;
pub mod task;

#[cfg(test)]
pub(crate) mod testing;

pub use config::ConnConfig;
pub use conn::{ConnStats, Connection, Negotiated};
pub use device::{Device, FdTable, PollStatus};
pub use error::{FuseError, FuseResult, LocalFault};
pub use fault::{FaultErrno, FaultInjector, FaultOp, FaultPolicy, FaultRule};
pub use file::{FileHandle, FileRef};
pub use inode::{FileKind, IdentityMap, Inode, InodeRef};
pub use mount::{Mount, UnmountReport};
pub use ops::{MAY_EXEC, MAY_READ, MAY_WRITE};
pub use options::{MountFlags, MountOptions};
pub use request::{Completion, PageList, ReqFlags, ReqState, Request, MAX_ARGS};
pub use sink::{AttrSink, CountingSink};
pub use task::{Signal, Task};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `mutex`, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
