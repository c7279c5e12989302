// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! VFS-facing operation adapters
//!
//! Thin wrappers that turn one filesystem operation into requests on the
//! mount's connection and apply the replies to the identity map.

use crate::error::{FuseError, FuseResult};
use crate::file::{FileHandle, FileRef};
use crate::inode::{FileKind, InodeRef};
use crate::mount::Mount;
use crate::task::Task;
use fusewire_proto::abi::{COMPAT_STATFS_SIZE, ROOT_ID};
use fusewire_proto::{
    Attr, AttrOut, EntryOut, ForgetIn, Kstatfs, OpenIn, OpenOut, Opcode, ReadIn, StatfsOut,
    WriteIn, WriteOut,
};
use ssz::Encode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Access bits of a `permission` mask.
pub const MAY_EXEC: u32 = 1;
pub const MAY_WRITE: u32 = 2;
pub const MAY_READ: u32 = 4;

/// Open flags handled locally and never passed to the daemon.
const LOCAL_OPEN_FLAGS: u32 = (libc::O_CREAT | libc::O_EXCL | libc::O_NOCTTY | libc::O_TRUNC) as u32;

fn timeout(secs: u64, nsec: u32) -> Duration {
    Duration::from_secs(secs).saturating_add(Duration::from_nanos(u64::from(nsec)))
}

fn fixed_len<T: Encode>() -> usize {
    <T as Encode>::ssz_fixed_len()
}

impl Mount {
    /// Resolves `name` in the directory `parent`.
    pub fn lookup(&self, parent: &InodeRef, name: &str, task: &Task) -> FuseResult<InodeRef> {
        parent.check()?;
        if !parent.is_dir() {
            return Err(FuseError::NotDirectory);
        }
        if name.len() > self.connection().config().name_max {
            return Err(FuseError::NameTooLong);
        }
        let entry: EntryOut = self.connection().roundtrip(
            task,
            |req| {
                req.set_opcode(Opcode::Lookup).set_nodeid(parent.node_id());
                req.add_in_name(name.as_bytes())?;
                req.add_out(fixed_len::<EntryOut>())?;
                Ok(())
            },
            |req| req.out_struct(0),
        )?;
        if entry.nodeid == 0 {
            return Err(FuseError::Daemon(-libc::ENOENT));
        }
        match self
            .identity_map()
            .resolve(entry.nodeid, entry.generation, &entry.attr)
        {
            Ok(inode) => {
                inode.set_entry_timeout(timeout(entry.entry_valid, entry.entry_valid_nsec));
                inode.set_attr_timeout(timeout(entry.attr_valid, entry.attr_valid_nsec));
                Ok(inode)
            }
            Err(err) => {
                // The daemon counted this lookup; give it back.
                self.send_forget(entry.nodeid, 1);
                Err(err)
            }
        }
    }

    fn send_forget(&self, node_id: u64, nlookup: u64) {
        let conn = self.connection();
        let mut req = conn.reserve_request();
        req.set_opcode(Opcode::Forget).set_nodeid(node_id);
        let queued = req
            .add_in_struct(&ForgetIn { nlookup })
            .map(|_| ())
            .and_then(|()| conn.send_noreply(req));
        if let Err(err) = queued {
            debug!(target: "fusewire::inode", node_id, error = %err, "forget not delivered");
        }
    }

    /// Attributes of `inode`, from cache while they are valid.
    pub fn getattr(&self, inode: &InodeRef, task: &Task) -> FuseResult<Attr> {
        inode.check()?;
        self.allow_task(task)?;
        if inode.attr_valid() {
            return Ok(inode.attr());
        }
        let out: AttrOut = self.connection().roundtrip(
            task,
            |req| {
                req.set_opcode(Opcode::Getattr).set_nodeid(inode.node_id());
                req.add_out(fixed_len::<AttrOut>())?;
                Ok(())
            },
            |req| req.out_struct(0),
        )?;
        if FileKind::from_mode(out.attr.mode) != Some(inode.kind()) {
            warn!(
                target: "fusewire::inode",
                node_id = inode.node_id(),
                mode = out.attr.mode,
                "getattr reported another file type"
            );
            inode.mark_bad();
            return Err(FuseError::BadInode);
        }
        self.identity_map().change_attributes(inode, &out.attr);
        inode.set_attr_timeout(timeout(out.attr_valid, out.attr_valid_nsec));
        Ok(inode.attr())
    }

    /// Forces the next `getattr` on `inode` to ask the daemon.
    pub fn invalidate_attr(&self, inode: &InodeRef) {
        inode.invalidate_attr();
    }

    pub fn open(&self, inode: &InodeRef, flags: u32, task: &Task) -> FuseResult<FileRef> {
        inode.check()?;
        let conn = self.connection();
        let release = conn.reserve_request();
        let opcode = if inode.is_dir() {
            Opcode::Opendir
        } else {
            Opcode::Open
        };
        let out: OpenOut = conn.roundtrip(
            task,
            |req| {
                req.set_opcode(opcode).set_nodeid(inode.node_id());
                req.add_in_struct(&OpenIn {
                    flags: flags & !LOCAL_OPEN_FLAGS,
                    padding: 0,
                })?;
                req.add_out(fixed_len::<OpenOut>())?;
                Ok(())
            },
            |req| req.out_struct(0),
        )?;
        debug!(target: "fusewire::dispatch", node_id = inode.node_id(), fh = out.fh, "opened");
        Ok(Arc::new(FileHandle::new(
            out.fh,
            out.open_flags,
            flags,
            inode.clone(),
            release,
        )))
    }

    /// Closes `file` in the background; the request keeps the inode and the
    /// handle alive until the daemon answers.
    pub fn release(&self, file: &FileRef) -> FuseResult<()> {
        let Some(mut req) = file.take_release() else {
            return Err(FuseError::InvalidArgument);
        };
        file.build_release(&mut req)?;
        req.set_file(file.clone());
        self.connection().send_background(req)
    }

    /// Reads up to `size` bytes at `offset`; fewer come back at end of file.
    pub fn read(&self, file: &FileRef, offset: u64, size: usize, task: &Task) -> FuseResult<Vec<u8>> {
        file.inode().check()?;
        if file.is_dir() {
            return Err(FuseError::IsDirectory);
        }
        let conn = self.connection();
        let config = conn.config();
        let chunk = if conn.flags().large_read {
            config.large_read_chunk
        } else {
            config.page_size
        };
        let size = size
            .min(conn.max_read() as usize)
            .min(config.max_request_bytes())
            .min(chunk);
        if size == 0 {
            return Ok(Vec::new());
        }
        let page_size = config.page_size;
        conn.roundtrip(
            task,
            |req| {
                req.set_opcode(Opcode::Read).set_nodeid(file.inode().node_id());
                req.add_in_struct(&ReadIn {
                    fh: file.fh(),
                    offset,
                    size: size as u32,
                    padding: 0,
                })?;
                req.add_out_pages(page_size, size, true)?;
                req.set_out_argvar(true);
                Ok(())
            },
            |req| Ok(req.out_arg(0).unwrap_or_default()),
        )
    }

    /// Writes a prefix of `data` at `offset` and returns how much the daemon
    /// accepted.
    pub fn write(&self, file: &FileRef, offset: u64, data: &[u8], task: &Task) -> FuseResult<usize> {
        file.inode().check()?;
        if file.is_dir() {
            return Err(FuseError::IsDirectory);
        }
        let conn = self.connection();
        let config = conn.config();
        let negotiated = conn.negotiated();
        let max_write = if negotiated.initialized {
            negotiated.max_write as usize
        } else {
            config.page_size
        };
        let size = data.len().min(max_write).min(config.max_request_bytes());
        let page_size = config.page_size;
        let out: WriteOut = conn.roundtrip(
            task,
            |req| {
                req.set_opcode(Opcode::Write).set_nodeid(file.inode().node_id());
                req.add_in_struct(&WriteIn {
                    fh: file.fh(),
                    offset,
                    size: size as u32,
                    write_flags: 0,
                })?;
                req.add_in_pages(page_size, &data[..size])?;
                req.add_out(fixed_len::<WriteOut>())?;
                Ok(())
            },
            |req| req.out_struct(0),
        )?;
        let written = out.size as usize;
        if written > size {
            warn!(target: "fusewire::dispatch", sent = size, written, "daemon claims a longer write");
            return Err(FuseError::ProtocolViolation(format!(
                "wrote {written} of {size} bytes"
            )));
        }
        Ok(written)
    }

    pub fn statfs(&self, task: &Task) -> FuseResult<Kstatfs> {
        let conn = self.connection();
        let negotiated = conn.negotiated();
        let size = if negotiated.initialized && negotiated.minor < 4 {
            COMPAT_STATFS_SIZE
        } else {
            fixed_len::<StatfsOut>()
        };
        let out: StatfsOut = conn.roundtrip(
            task,
            |req| {
                req.set_opcode(Opcode::Statfs).set_nodeid(ROOT_ID);
                req.add_out(size)?;
                Ok(())
            },
            |req| req.out_struct_padded(0),
        )?;
        Ok(out.st)
    }

    /// Whether `task` may use this mount at all.
    ///
    /// Without `allow_other` only the mounting user and group get in.
    pub fn allow_task(&self, task: &Task) -> FuseResult<()> {
        let conn = self.connection();
        if conn.flags().allow_other {
            return Ok(());
        }
        if task.uid == conn.user_id() && task.gid == conn.group_id() {
            return Ok(());
        }
        Err(FuseError::AccessDenied)
    }

    /// Checks `mask` (`MAY_*` bits) against `inode` for `task`.
    ///
    /// Mode bits are only enforced with `default_permissions`; otherwise the
    /// daemon decides, except that files without any execute bit are never
    /// executable.
    pub fn permission(&self, inode: &InodeRef, task: &Task, mask: u32) -> FuseResult<()> {
        inode.check()?;
        self.allow_task(task)?;
        let attr = inode.attr();
        let exec_denied = mask & MAY_EXEC != 0 && !inode.is_dir() && attr.mode & 0o111 == 0;

        if !self.connection().flags().default_permissions {
            return if exec_denied {
                Err(FuseError::AccessDenied)
            } else {
                Ok(())
            };
        }
        if task.uid == 0 {
            return if exec_denied {
                Err(FuseError::AccessDenied)
            } else {
                Ok(())
            };
        }
        let granted = if task.uid == attr.uid {
            (attr.mode >> 6) & 0o7
        } else if task.gid == attr.gid {
            (attr.mode >> 3) & 0o7
        } else {
            attr.mode & 0o7
        };
        if mask & 0o7 & !granted != 0 {
            return Err(FuseError::AccessDenied);
        }
        Ok(())
    }
}
