// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-flight operation descriptor

use crate::conn::Connection;
use crate::error::{FuseError, FuseResult, LocalFault};
use crate::file::FileRef;
use crate::inode::InodeRef;
use crate::task::Task;
use fusewire_proto::abi::IN_HEADER_SIZE;
use fusewire_proto::{decode_padded, InHeader, Opcode};
use ssz::{Decode, Encode};
use std::fmt;
use std::sync::{Arc, Condvar};

/// Capacity of the input and output argument lists.
pub const MAX_ARGS: usize = 3;

/// Lifecycle of a request; transitions only move forward until `reset`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReqState {
    Free,
    /// Queued, not yet seen by the daemon.
    Pending,
    /// Being copied out to the daemon.
    Sent,
    /// Read by the daemon, awaiting its reply.
    Processing,
    Finished,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReqFlags {
    pub is_reply: bool,
    pub background: bool,
    pub interrupted: bool,
    /// Data is being copied to or from the daemon outside the connection lock.
    pub locked: bool,
    pub preallocated: bool,
    pub aborted: bool,
}

/// How a request ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    Pending,
    /// The daemon answered; zero or a negative errno.
    Replied(i32),
    Fault(LocalFault),
}

/// Called instead of `put_request` when a background request finishes.
pub type EndFn = Box<dyn FnOnce(&Connection, Request) + Send>;

/// Bulk payload of READ and WRITE, held as page-sized buffers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PageList {
    page_size: usize,
    pages: Vec<Vec<u8>>,
    len: usize,
}

impl PageList {
    /// Zeroed pages covering `len` bytes.
    pub fn with_len(page_size: usize, len: usize) -> Self {
        let count = len.div_ceil(page_size.max(1));
        Self {
            page_size,
            pages: vec![vec![0; page_size]; count],
            len,
        }
    }

    pub fn from_bytes(page_size: usize, data: &[u8]) -> Self {
        let mut list = Self::with_len(page_size, data.len());
        list.write_at(0, data);
        list
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn num_pages(&self) -> usize {
        self.pages.len()
    }

    /// The first `len` bytes, concatenated.
    pub fn to_vec(&self, len: usize) -> Vec<u8> {
        let len = len.min(self.len);
        let mut out = Vec::with_capacity(len);
        for page in &self.pages {
            let want = (len - out.len()).min(page.len());
            out.extend_from_slice(&page[..want]);
            if out.len() == len {
                break;
            }
        }
        out
    }

    fn write_at(&mut self, offset: usize, data: &[u8]) {
        let mut pos = offset;
        let mut src = data;
        while !src.is_empty() && pos < self.len {
            let page = pos / self.page_size;
            let within = pos % self.page_size;
            let n = src.len().min(self.page_size - within).min(self.len - pos);
            self.pages[page][within..within + n].copy_from_slice(&src[..n]);
            pos += n;
            src = &src[n..];
        }
    }

    fn zero_from(&mut self, offset: usize) {
        if offset < self.len {
            let zeros = vec![0; self.len - offset];
            self.write_at(offset, &zeros);
        }
    }
}

#[derive(Clone, Debug)]
enum InArg {
    Inline(Vec<u8>),
    /// Taken from the page list.
    Pages(usize),
}

#[derive(Clone, Debug)]
struct OutArg {
    size: usize,
    pages: bool,
    /// Bytes the reply actually filled.
    len: usize,
    value: Vec<u8>,
}

/// References a request keeps alive so an abandoned request can still
/// release them when it finishes.
#[derive(Default)]
pub(crate) struct Resources {
    pub(crate) inode: Option<InodeRef>,
    pub(crate) inode2: Option<InodeRef>,
    pub(crate) file: Option<FileRef>,
}

impl Resources {
    pub(crate) fn is_empty(&self) -> bool {
        self.inode.is_none() && self.inode2.is_none() && self.file.is_none()
    }
}

/// One operation's input, output and completion state.
pub struct Request {
    pub(crate) state: ReqState,
    pub(crate) flags: ReqFlags,
    pub(crate) header: InHeader,
    in_args: Vec<InArg>,
    out_args: Vec<OutArg>,
    out_argvar: bool,
    page_zeroing: bool,
    pages: PageList,
    pub(crate) completion: Completion,
    pub(crate) resources: Resources,
    pub(crate) end: Option<EndFn>,
    /// Owns one admission unit that `put_request` must give back.
    pub(crate) holds_unit: bool,
    /// Counted in the connection's `waiting` gauge until put.
    pub(crate) counted_waiting: bool,
    pub(crate) waitq: Arc<Condvar>,
}

impl Request {
    pub(crate) fn new(preallocated: bool) -> Self {
        Self {
            state: ReqState::Free,
            flags: ReqFlags {
                preallocated,
                ..Default::default()
            },
            header: InHeader::default(),
            in_args: Vec::with_capacity(MAX_ARGS),
            out_args: Vec::with_capacity(MAX_ARGS),
            out_argvar: false,
            page_zeroing: false,
            pages: PageList::default(),
            completion: Completion::Pending,
            resources: Resources::default(),
            end: None,
            holds_unit: false,
            counted_waiting: false,
            waitq: Arc::new(Condvar::new()),
        }
    }

    /// Restores a pristine state, keeping only the `preallocated` flag.
    ///
    /// Drops any inode or file references, so it must not run under the
    /// connection lock.
    pub fn reset(&mut self) {
        let preallocated = self.flags.preallocated;
        let waitq = self.waitq.clone();
        *self = Self::new(preallocated);
        self.waitq = waitq;
    }

    pub fn unique(&self) -> u64 {
        self.header.unique
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::try_from(self.header.opcode).ok()
    }

    pub fn nodeid(&self) -> u64 {
        self.header.nodeid
    }

    pub fn state(&self) -> ReqState {
        self.state
    }

    pub fn flags(&self) -> ReqFlags {
        self.flags
    }

    pub fn is_preallocated(&self) -> bool {
        self.flags.preallocated
    }

    pub fn completion(&self) -> Completion {
        self.completion
    }

    pub fn set_opcode(&mut self, opcode: Opcode) -> &mut Self {
        self.header.opcode = opcode.into();
        self
    }

    pub fn set_nodeid(&mut self, nodeid: u64) -> &mut Self {
        self.header.nodeid = nodeid;
        self
    }

    pub(crate) fn stamp(&mut self, task: &Task) {
        self.header.uid = task.uid;
        self.header.gid = task.gid;
        self.header.pid = task.pid;
    }

    pub fn add_in(&mut self, bytes: Vec<u8>) -> FuseResult<&mut Self> {
        if self.in_args.len() == MAX_ARGS {
            return Err(FuseError::InvalidArgument);
        }
        self.in_args.push(InArg::Inline(bytes));
        Ok(self)
    }

    pub fn add_in_struct<T: Encode>(&mut self, value: &T) -> FuseResult<&mut Self> {
        self.add_in(value.as_ssz_bytes())
    }

    /// A NUL-terminated name argument.
    pub fn add_in_name(&mut self, name: &[u8]) -> FuseResult<&mut Self> {
        let mut bytes = Vec::with_capacity(name.len() + 1);
        bytes.extend_from_slice(name);
        bytes.push(0);
        self.add_in(bytes)
    }

    /// A page-backed input argument carrying `data`.
    pub fn add_in_pages(&mut self, page_size: usize, data: &[u8]) -> FuseResult<&mut Self> {
        if self.in_args.len() == MAX_ARGS {
            return Err(FuseError::InvalidArgument);
        }
        self.pages = PageList::from_bytes(page_size, data);
        self.in_args.push(InArg::Pages(data.len()));
        Ok(self)
    }

    pub fn add_out(&mut self, size: usize) -> FuseResult<&mut Self> {
        if self.out_args.len() == MAX_ARGS {
            return Err(FuseError::InvalidArgument);
        }
        self.out_args.push(OutArg {
            size,
            pages: false,
            len: 0,
            value: Vec::new(),
        });
        Ok(self)
    }

    /// A page-backed output argument of up to `size` bytes.
    pub fn add_out_pages(
        &mut self,
        page_size: usize,
        size: usize,
        zeroing: bool,
    ) -> FuseResult<&mut Self> {
        if self.out_args.len() == MAX_ARGS {
            return Err(FuseError::InvalidArgument);
        }
        self.pages = PageList::with_len(page_size, size);
        self.page_zeroing = zeroing;
        self.out_args.push(OutArg {
            size,
            pages: true,
            len: 0,
            value: Vec::new(),
        });
        Ok(self)
    }

    /// Lets the last output argument come back shorter than declared.
    pub fn set_out_argvar(&mut self, argvar: bool) -> &mut Self {
        self.out_argvar = argvar;
        self
    }

    pub fn set_inode(&mut self, inode: InodeRef) -> &mut Self {
        self.resources.inode = Some(inode);
        self
    }

    pub fn set_inode2(&mut self, inode: InodeRef) -> &mut Self {
        self.resources.inode2 = Some(inode);
        self
    }

    pub fn set_file(&mut self, file: FileRef) -> &mut Self {
        self.resources.file = Some(file);
        self
    }

    pub fn set_end(&mut self, end: EndFn) -> &mut Self {
        self.end = Some(end);
        self
    }

    pub(crate) fn take_resources(&mut self) -> Resources {
        std::mem::take(&mut self.resources)
    }

    /// Moves to `Finished` and wakes the waiter; later calls are ignored.
    pub fn mark_finished(&mut self, completion: Completion) -> bool {
        if self.state == ReqState::Finished {
            return false;
        }
        self.state = ReqState::Finished;
        self.completion = completion;
        self.flags.locked = false;
        self.waitq.notify_all();
        true
    }

    /// Outcome of a finished request.
    pub fn result(&self) -> FuseResult<()> {
        match self.completion {
            Completion::Replied(0) => Ok(()),
            Completion::Replied(errno) => Err(FuseError::Daemon(errno)),
            Completion::Fault(fault) => Err(fault.into()),
            Completion::Pending => Err(FuseError::ProtocolViolation(
                "request has not finished".into(),
            )),
        }
    }

    /// Bytes of output argument `idx` as copied from the reply.
    pub fn out_arg(&self, idx: usize) -> Option<Vec<u8>> {
        let arg = self.out_args.get(idx)?;
        if arg.pages {
            Some(self.pages.to_vec(arg.len))
        } else {
            Some(arg.value.clone())
        }
    }

    pub fn out_struct<T: Decode>(&self, idx: usize) -> FuseResult<T> {
        let bytes = self.out_arg(idx).ok_or(FuseError::InvalidArgument)?;
        T::from_ssz_bytes(&bytes)
            .map_err(|err| FuseError::ProtocolViolation(format!("bad reply argument: {err:?}")))
    }

    /// Like `out_struct`, zero-extending a reply shortened by `argvar`.
    pub fn out_struct_padded<T: Decode>(&self, idx: usize) -> FuseResult<T> {
        let bytes = self.out_arg(idx).ok_or(FuseError::InvalidArgument)?;
        decode_padded(&bytes).map_err(|err| FuseError::ProtocolViolation(err.to_string()))
    }

    pub fn pages(&self) -> &PageList {
        &self.pages
    }

    /// Frame length for the daemon: header plus concatenated inputs.
    pub(crate) fn frame_len(&self) -> usize {
        IN_HEADER_SIZE
            + self
                .in_args
                .iter()
                .map(|arg| match arg {
                    InArg::Inline(bytes) => bytes.len(),
                    InArg::Pages(len) => *len,
                })
                .sum::<usize>()
    }

    pub(crate) fn encode_frame(&self) -> Vec<u8> {
        let len = self.frame_len();
        let mut header = self.header;
        header.len = len as u32;
        let mut out = header.as_ssz_bytes();
        out.reserve(len - IN_HEADER_SIZE);
        for arg in &self.in_args {
            match arg {
                InArg::Inline(bytes) => out.extend_from_slice(bytes),
                InArg::Pages(len) => out.extend_from_slice(&self.pages.to_vec(*len)),
            }
        }
        out
    }

    /// Copies a reply body into the output arguments.
    pub(crate) fn fill_reply(&mut self, errno: i32, body: &[u8]) -> Result<(), String> {
        if errno != 0 {
            if !body.is_empty() {
                return Err(format!("error reply carries {} bytes", body.len()));
            }
            return Ok(());
        }
        let declared: usize = self.out_args.iter().map(|arg| arg.size).sum();
        if body.len() > declared {
            return Err(format!("reply body {} exceeds {declared}", body.len()));
        }
        let short = declared - body.len();
        if short > 0 {
            let last = self.out_args.last().map(|arg| arg.size).unwrap_or(0);
            if !self.out_argvar || short > last {
                return Err(format!("reply body {} shorter than {declared}", body.len()));
            }
        }

        let count = self.out_args.len();
        let mut rest = body;
        for idx in 0..count {
            let size = self.out_args[idx].size;
            let take = if idx + 1 == count { size - short } else { size };
            let (chunk, tail) = rest.split_at(take);
            rest = tail;
            self.out_args[idx].len = take;
            if self.out_args[idx].pages {
                self.pages.write_at(0, chunk);
                if self.page_zeroing {
                    self.pages.zero_from(chunk.len());
                }
            } else {
                self.out_args[idx].value = chunk.to_vec();
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("unique", &self.header.unique)
            .field("opcode", &self.header.opcode)
            .field("nodeid", &self.header.nodeid)
            .field("state", &self.state)
            .field("flags", &self.flags)
            .field("completion", &self.completion)
            .field("holds_unit", &self.holds_unit)
            .finish()
    }
}
