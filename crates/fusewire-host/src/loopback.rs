// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory daemon answering requests read from a [`Device`]

use anyhow::{bail, Result};
use fusewire_core::{Device, FuseError};
use fusewire_proto::abi::{
    INIT_ASYNC_READ, KERNEL_MINOR_VERSION, KERNEL_VERSION, ROOT_ID, S_IFDIR, S_IFREG,
};
use fusewire_proto::{
    split_struct, validate_request_header, Attr, AttrOut, EntryOut, ForgetIn, InHeader, InitIn,
    InitOut, Kstatfs, OpenIn, OpenOut, Opcode, ReadIn, ReleaseIn, ReplyFrame, RequestFrame,
    StatfsOut, ValidationError, WriteIn, WriteOut,
};
use serde::{Deserialize, Serialize};
use ssz::Encode;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

const BLOCK_SIZE: u32 = 4096;
const NAME_MAX: u32 = 255;
/// Seconds a LOOKUP answer may be cached. Attributes are never cached so a
/// GETATTR after a WRITE sees the new size.
const ENTRY_VALID_SECS: u64 = 1;
/// Writes that would grow a file past this fail with `EFBIG`.
const MAX_FILE_SIZE: usize = 64 * 1024 * 1024;

/// One file or directory to create before serving.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Slash-separated path below the root; parents are created as needed.
    pub path: String,
    #[serde(default)]
    pub dir: bool,
    #[serde(default)]
    pub contents: String,
}

#[derive(Debug)]
enum NodeData {
    Dir(BTreeMap<String, u64>),
    File(Vec<u8>),
}

#[derive(Debug)]
struct Node {
    data: NodeData,
    lookups: u64,
}

/// The daemon's filesystem: a tree of nodes plus open handles.
#[derive(Debug)]
pub struct LoopbackFs {
    nodes: HashMap<u64, Node>,
    handles: HashMap<u64, u64>,
    next_node: u64,
    next_fh: u64,
    max_write: u32,
    uid: u32,
    gid: u32,
    served: usize,
}

impl Default for LoopbackFs {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl LoopbackFs {
    /// An empty tree whose nodes are owned by `uid`/`gid`.
    pub fn new(uid: u32, gid: u32) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_ID,
            Node {
                data: NodeData::Dir(BTreeMap::new()),
                lookups: 0,
            },
        );
        Self {
            nodes,
            handles: HashMap::new(),
            next_node: ROOT_ID + 1,
            next_fh: 1,
            max_write: 128 * 1024,
            uid,
            gid,
            served: 0,
        }
    }

    /// Write size announced in the INIT reply.
    pub fn with_max_write(mut self, max_write: u32) -> Self {
        self.max_write = max_write;
        self
    }

    pub fn populate(&mut self, entries: &[TreeEntry]) -> Result<()> {
        for entry in entries {
            let components: Vec<&str> = entry.path.split('/').filter(|c| !c.is_empty()).collect();
            let Some((last, parents)) = components.split_last() else {
                bail!("empty path in tree entry");
            };
            let mut dir = ROOT_ID;
            for name in parents {
                dir = self.ensure_child(dir, name, || NodeData::Dir(BTreeMap::new()), &entry.path)?;
            }
            let data = if entry.dir {
                NodeData::Dir(BTreeMap::new())
            } else {
                NodeData::File(entry.contents.as_bytes().to_vec())
            };
            self.ensure_child(dir, last, move || data, &entry.path)?;
        }
        Ok(())
    }

    fn ensure_child(
        &mut self,
        dir: u64,
        name: &str,
        make: impl FnOnce() -> NodeData,
        path: &str,
    ) -> Result<u64> {
        let Some(Node {
            data: NodeData::Dir(children),
            ..
        }) = self.nodes.get(&dir)
        else {
            bail!("{path}: parent is not a directory");
        };
        if let Some(&existing) = children.get(name) {
            return Ok(existing);
        }
        let id = self.next_node;
        self.next_node += 1;
        self.nodes.insert(
            id,
            Node {
                data: make(),
                lookups: 0,
            },
        );
        if let Some(Node {
            data: NodeData::Dir(children),
            ..
        }) = self.nodes.get_mut(&dir)
        {
            children.insert(name.to_owned(), id);
        }
        Ok(id)
    }

    /// Lookups the kernel side still holds on `node_id`.
    pub fn lookup_count(&self, node_id: u64) -> u64 {
        self.nodes.get(&node_id).map_or(0, |n| n.lookups)
    }

    /// Lookups outstanding across the whole tree.
    pub fn total_lookups(&self) -> u64 {
        self.nodes.values().map(|n| n.lookups).sum()
    }

    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Frames read from the device so far.
    pub fn served(&self) -> usize {
        self.served
    }

    pub fn contents(&self, path: &str) -> Option<&[u8]> {
        let mut node = ROOT_ID;
        for name in path.split('/').filter(|c| !c.is_empty()) {
            match &self.nodes.get(&node)?.data {
                NodeData::Dir(children) => node = *children.get(name)?,
                NodeData::File(_) => return None,
            }
        }
        match &self.nodes.get(&node)?.data {
            NodeData::File(bytes) => Some(bytes),
            NodeData::Dir(_) => None,
        }
    }

    fn attr(&self, node_id: u64) -> Option<Attr> {
        let node = self.nodes.get(&node_id)?;
        let (mode, size, nlink) = match &node.data {
            NodeData::Dir(_) => (S_IFDIR | 0o755, 0, 2),
            NodeData::File(bytes) => (S_IFREG | 0o644, bytes.len() as u64, 1),
        };
        Some(Attr {
            ino: node_id,
            size,
            blocks: size.div_ceil(512),
            mode,
            nlink,
            uid: self.uid,
            gid: self.gid,
            ..Default::default()
        })
    }

    /// Checks and decodes one frame read from the device, then answers it.
    ///
    /// Frames whose header disagrees with the bytes read are dropped.
    pub fn handle_bytes(&mut self, bytes: &[u8]) -> Option<ReplyFrame> {
        let header = match split_struct::<InHeader>(bytes) {
            Ok((header, _)) => header,
            Err(err) => {
                warn!(target: "fusewire::loopback", error = %err, "short request");
                return None;
            }
        };
        match validate_request_header(&header, bytes.len()) {
            Ok(_) | Err(ValidationError::UnknownOpcode(_)) => {}
            Err(err) => {
                warn!(target: "fusewire::loopback", unique = header.unique, error = %err, "malformed request");
                return None;
            }
        }
        let frame = match RequestFrame::decode(bytes) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(target: "fusewire::loopback", error = %err, "undecodable request");
                return None;
            }
        };
        self.served += 1;
        self.handle(&frame)
    }

    /// Answers one request; `None` for requests that take no reply.
    pub fn handle(&mut self, frame: &RequestFrame) -> Option<ReplyFrame> {
        let unique = frame.unique();
        let opcode = match frame.opcode() {
            Ok(op) => op,
            Err(err) => {
                warn!(target: "fusewire::loopback", unique, error = %err, "undecodable opcode");
                return Some(ReplyFrame::error(unique, -libc::ENOSYS));
            }
        };
        debug!(target: "fusewire::loopback", unique, %opcode, nodeid = frame.header.nodeid, "request");
        if opcode == Opcode::Forget {
            self.forget(frame);
            return None;
        }
        Some(match self.answer(opcode, frame) {
            Ok(body) => ReplyFrame::ok(unique, body),
            Err(errno) => ReplyFrame::error(unique, errno),
        })
    }

    fn forget(&mut self, frame: &RequestFrame) {
        let Ok((arg, _)) = frame.arg::<ForgetIn>() else {
            return;
        };
        if let Some(node) = self.nodes.get_mut(&frame.header.nodeid) {
            node.lookups = node.lookups.saturating_sub(arg.nlookup);
        }
    }

    fn answer(&mut self, opcode: Opcode, frame: &RequestFrame) -> Result<Vec<u8>, i32> {
        let nodeid = frame.header.nodeid;
        let einval = |_| -libc::EINVAL;
        match opcode {
            Opcode::Init => {
                let (arg, _) = frame.arg::<InitIn>().map_err(einval)?;
                Ok(InitOut {
                    major: KERNEL_VERSION,
                    minor: KERNEL_MINOR_VERSION,
                    max_readahead: arg.max_readahead,
                    flags: arg.flags & INIT_ASYNC_READ,
                    unused: 0,
                    max_write: self.max_write,
                }
                .as_ssz_bytes())
            }
            Opcode::Lookup => {
                let name = frame.name().map_err(einval)?;
                let name = std::str::from_utf8(name).map_err(|_| -libc::EINVAL)?;
                let child = match &self.nodes.get(&nodeid).ok_or(-libc::ENOENT)?.data {
                    NodeData::Dir(children) => *children.get(name).ok_or(-libc::ENOENT)?,
                    NodeData::File(_) => return Err(-libc::ENOTDIR),
                };
                let attr = self.attr(child).ok_or(-libc::ENOENT)?;
                if let Some(node) = self.nodes.get_mut(&child) {
                    node.lookups += 1;
                }
                Ok(EntryOut {
                    nodeid: child,
                    entry_valid: ENTRY_VALID_SECS,
                    attr,
                    ..Default::default()
                }
                .as_ssz_bytes())
            }
            Opcode::Getattr => {
                let attr = self.attr(nodeid).ok_or(-libc::ENOENT)?;
                Ok(AttrOut {
                    attr,
                    ..Default::default()
                }
                .as_ssz_bytes())
            }
            Opcode::Open | Opcode::Opendir => {
                let _ = frame.arg::<OpenIn>().map_err(einval)?;
                match (&self.nodes.get(&nodeid).ok_or(-libc::ENOENT)?.data, opcode) {
                    (NodeData::Dir(_), Opcode::Open) => return Err(-libc::EISDIR),
                    (NodeData::File(_), Opcode::Opendir) => return Err(-libc::ENOTDIR),
                    _ => {}
                }
                let fh = self.next_fh;
                self.next_fh += 1;
                self.handles.insert(fh, nodeid);
                Ok(OpenOut {
                    fh,
                    ..Default::default()
                }
                .as_ssz_bytes())
            }
            Opcode::Read => {
                let (arg, _) = frame.arg::<ReadIn>().map_err(einval)?;
                let bytes = self.file_mut(arg.fh)?;
                let start = (arg.offset as usize).min(bytes.len());
                let end = start.saturating_add(arg.size as usize).min(bytes.len());
                Ok(bytes[start..end].to_vec())
            }
            Opcode::Write => {
                let (arg, data) = frame.arg::<WriteIn>().map_err(einval)?;
                let data = data.get(..arg.size as usize).ok_or(-libc::EINVAL)?;
                let bytes = self.file_mut(arg.fh)?;
                let start = usize::try_from(arg.offset).map_err(|_| -libc::EFBIG)?;
                let end = start
                    .checked_add(data.len())
                    .filter(|&end| end <= MAX_FILE_SIZE)
                    .ok_or(-libc::EFBIG)?;
                if bytes.len() < end {
                    bytes.resize(end, 0);
                }
                bytes[start..end].copy_from_slice(data);
                Ok(WriteOut {
                    size: data.len() as u32,
                    padding: 0,
                }
                .as_ssz_bytes())
            }
            Opcode::Release | Opcode::Releasedir => {
                let (arg, _) = frame.arg::<ReleaseIn>().map_err(einval)?;
                self.handles.remove(&arg.fh).ok_or(-libc::EBADF)?;
                Ok(Vec::new())
            }
            Opcode::Statfs => {
                let used: u64 = self
                    .nodes
                    .values()
                    .map(|n| match &n.data {
                        NodeData::File(bytes) => (bytes.len() as u64).div_ceil(u64::from(BLOCK_SIZE)),
                        NodeData::Dir(_) => 0,
                    })
                    .sum();
                let blocks = used.max(1) * 16;
                let st = Kstatfs {
                    blocks,
                    bfree: blocks - used,
                    bavail: blocks - used,
                    files: self.nodes.len() as u64,
                    ffree: u64::from(u32::MAX) - self.nodes.len() as u64,
                    bsize: BLOCK_SIZE,
                    namelen: NAME_MAX,
                    frsize: BLOCK_SIZE,
                    padding: 0,
                };
                Ok(StatfsOut { st }.as_ssz_bytes())
            }
            _ => Err(-libc::ENOSYS),
        }
    }

    fn file_mut(&mut self, fh: u64) -> Result<&mut Vec<u8>, i32> {
        let node_id = *self.handles.get(&fh).ok_or(-libc::EBADF)?;
        match &mut self.nodes.get_mut(&node_id).ok_or(-libc::EBADF)?.data {
            NodeData::File(bytes) => Ok(bytes),
            NodeData::Dir(_) => Err(-libc::EISDIR),
        }
    }

    /// Serves `dev` on a new thread until the device or the mount goes
    /// away, then hands the tree back.
    pub fn serve(mut self, dev: Arc<Device>) -> JoinHandle<Self> {
        thread::spawn(move || {
            loop {
                let bytes = match dev.read_frame() {
                    Ok(bytes) => bytes,
                    Err(FuseError::NoDevice | FuseError::PermissionDenied) => break,
                    Err(err) => {
                        debug!(target: "fusewire::loopback", error = %err, "read skipped");
                        continue;
                    }
                };
                let Some(reply) = self.handle_bytes(&bytes) else {
                    continue;
                };
                if let Err(err) = dev.write_reply(&reply.encode()) {
                    debug!(
                        target: "fusewire::loopback",
                        unique = reply.header.unique,
                        error = %err,
                        "reply not delivered"
                    );
                }
            }
            self
        })
    }
}
