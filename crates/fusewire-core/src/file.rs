// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Open file handles

use crate::error::FuseResult;
use crate::inode::InodeRef;
use crate::lock;
use crate::request::Request;
use fusewire_proto::{Opcode, ReleaseIn};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// A file opened through the daemon.
///
/// Carries the RELEASE request reserved at open time, so closing the file
/// never has to wait for an admission unit. A handle dropped without an
/// explicit release sends that request on its way out.
pub struct FileHandle {
    pub(crate) fh: u64,
    pub(crate) open_flags: u32,
    pub(crate) flags: u32,
    pub(crate) inode: InodeRef,
    pub(crate) release_req: Mutex<Option<Request>>,
}

pub type FileRef = Arc<FileHandle>;

impl FileHandle {
    pub(crate) fn new(fh: u64, open_flags: u32, flags: u32, inode: InodeRef, release: Request) -> Self {
        Self {
            fh,
            open_flags,
            flags,
            inode,
            release_req: Mutex::new(Some(release)),
        }
    }

    /// The daemon's handle for this open file.
    pub fn fh(&self) -> u64 {
        self.fh
    }

    pub fn open_flags(&self) -> u32 {
        self.open_flags
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn inode(&self) -> &InodeRef {
        &self.inode
    }

    pub fn is_dir(&self) -> bool {
        self.inode.is_dir()
    }

    pub fn is_released(&self) -> bool {
        lock(&self.release_req).is_none()
    }

    pub(crate) fn take_release(&self) -> Option<Request> {
        lock(&self.release_req).take()
    }

    /// Fills `req` as this handle's RELEASE or RELEASEDIR.
    pub(crate) fn build_release(&self, req: &mut Request) -> FuseResult<()> {
        let opcode = if self.is_dir() {
            Opcode::Releasedir
        } else {
            Opcode::Release
        };
        req.set_opcode(opcode).set_nodeid(self.inode.node_id());
        req.add_in_struct(&ReleaseIn {
            fh: self.fh,
            flags: self.flags,
            padding: 0,
        })?;
        req.set_inode(self.inode.clone());
        Ok(())
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        let Some(mut req) = self.take_release() else {
            return;
        };
        let conn = self.inode.connection();
        if !conn.is_mounted() {
            debug!(target: "fusewire::file", fh = self.fh, "unreleased handle dropped after unmount");
            return;
        }
        let sent = self
            .build_release(&mut req)
            .and_then(|()| conn.send_background(req));
        match sent {
            Ok(()) => debug!(target: "fusewire::file", fh = self.fh, "release sent on drop"),
            Err(err) => debug!(target: "fusewire::file", fh = self.fh, error = %err, "release on drop not delivered"),
        }
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandle")
            .field("fh", &self.fh)
            .field("node_id", &self.inode.node_id())
            .field("flags", &self.flags)
            .field("released", &self.is_released())
            .finish()
    }
}
