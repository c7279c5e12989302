// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Inode identity map
//!
//! Keeps at most one resident [`Inode`] per daemon node ID and tracks how
//! many lookups the daemon has to be told to forget. Every record reserves
//! its FORGET request when it is created, so evicting it never has to
//! allocate.
//!
//! Lock order: the map lock may be held while taking the connection lock,
//! never the reverse. [`InodeRef`]s must therefore not be dropped while the
//! connection lock is held.

use crate::conn::Connection;
use crate::error::{FuseError, FuseResult};
use crate::lock;
use crate::request::Request;
use crate::sink::AttrSink;
use fusewire_proto::abi::{
    S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK,
};
use fusewire_proto::{Attr, ForgetIn, Opcode};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
}

impl FileKind {
    pub fn from_mode(mode: u32) -> Option<Self> {
        let kind = match mode & S_IFMT {
            S_IFREG => FileKind::Regular,
            S_IFDIR => FileKind::Directory,
            S_IFLNK => FileKind::Symlink,
            S_IFCHR => FileKind::CharDevice,
            S_IFBLK => FileKind::BlockDevice,
            S_IFIFO => FileKind::Fifo,
            S_IFSOCK => FileKind::Socket,
            _ => return None,
        };
        Some(kind)
    }

    pub fn type_bits(self) -> u32 {
        match self {
            FileKind::Regular => S_IFREG,
            FileKind::Directory => S_IFDIR,
            FileKind::Symlink => S_IFLNK,
            FileKind::CharDevice => S_IFCHR,
            FileKind::BlockDevice => S_IFBLK,
            FileKind::Fifo => S_IFIFO,
            FileKind::Socket => S_IFSOCK,
        }
    }
}

#[derive(Debug, Default)]
struct AttrCache {
    attr: Attr,
    attr_valid_until: Option<Instant>,
    entry_valid_until: Option<Instant>,
}

/// A resident inode. Node ID, generation and type never change.
pub struct Inode {
    node_id: u64,
    generation: u64,
    kind: FileKind,
    bad: AtomicBool,
    cache: Mutex<AttrCache>,
}

impl Inode {
    fn new(node_id: u64, generation: u64, kind: FileKind) -> Self {
        Self {
            node_id,
            generation,
            kind,
            bad: AtomicBool::new(false),
            cache: Mutex::new(AttrCache::default()),
        }
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    /// Makes every later operation on this inode fail with `BadInode`.
    pub fn mark_bad(&self) {
        self.bad.store(true, Ordering::SeqCst);
    }

    pub fn is_bad(&self) -> bool {
        self.bad.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> FuseResult<()> {
        if self.is_bad() {
            return Err(FuseError::BadInode);
        }
        Ok(())
    }

    pub fn attr(&self) -> Attr {
        lock(&self.cache).attr
    }

    /// True while cached attributes may be used without a round trip.
    pub fn attr_valid(&self) -> bool {
        lock(&self.cache)
            .attr_valid_until
            .is_some_and(|until| Instant::now() < until)
    }

    pub fn entry_valid(&self) -> bool {
        lock(&self.cache)
            .entry_valid_until
            .is_some_and(|until| Instant::now() < until)
    }

    pub fn set_attr_timeout(&self, valid: Duration) {
        lock(&self.cache).attr_valid_until = Instant::now().checked_add(valid);
    }

    pub fn set_entry_timeout(&self, valid: Duration) {
        lock(&self.cache).entry_valid_until = Instant::now().checked_add(valid);
    }

    pub fn invalidate_attr(&self) {
        lock(&self.cache).attr_valid_until = None;
    }

    /// Stores `attr`, keeping the stored type bits; returns the old size.
    fn store_attr(&self, attr: &Attr) -> u64 {
        let mut cache = lock(&self.cache);
        let old_size = cache.attr.size;
        cache.attr = Attr {
            mode: self.kind.type_bits() | (attr.mode & 0o7777),
            ..*attr
        };
        old_size
    }
}

impl fmt::Debug for Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inode")
            .field("node_id", &self.node_id)
            .field("generation", &self.generation)
            .field("kind", &self.kind)
            .field("bad", &self.is_bad())
            .finish()
    }
}

struct Entry {
    inode: Arc<Inode>,
    /// Live `InodeRef`s.
    refs: usize,
    /// Lookups the daemon has not been told to forget.
    nlookup: u64,
    forget: Option<Request>,
}

struct MapInner {
    conn: Connection,
    sink: Arc<dyn AttrSink>,
    entries: Mutex<HashMap<u64, Entry>>,
}

impl MapInner {
    /// Drops one reference; evicts the record when it was the last.
    fn put(&self, inode: &Arc<Inode>) {
        let mut entries = lock(&self.entries);
        let Some(entry) = entries.get_mut(&inode.node_id) else {
            return;
        };
        // A detached record is no longer tracked here.
        if !Arc::ptr_eq(&entry.inode, inode) {
            return;
        }
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return;
        }
        if let Some(entry) = entries.remove(&inode.node_id) {
            drop(entries);
            self.evict(entry);
        }
    }

    /// Consumes an evicted record's FORGET: sent while mounted, else dropped.
    fn evict(&self, mut entry: Entry) {
        let node_id = entry.inode.node_id;
        let Some(mut forget) = entry.forget.take() else {
            return;
        };
        if !self.conn.is_mounted() || entry.nlookup == 0 {
            debug!(target: "fusewire::inode", node_id, "record dropped without forget");
            return;
        }
        let built = forget
            .set_opcode(Opcode::Forget)
            .set_nodeid(node_id)
            .add_in_struct(&ForgetIn {
                nlookup: entry.nlookup,
            })
            .map(|_| ());
        if let Err(err) = built.and_then(|()| self.conn.send_noreply(forget)) {
            debug!(target: "fusewire::inode", node_id, error = %err, "forget not delivered");
            return;
        }
        debug!(target: "fusewire::inode", node_id, nlookup = entry.nlookup, "forget queued");
    }
}

/// Find-or-create map from node ID to resident inode for one connection.
#[derive(Clone)]
pub struct IdentityMap {
    inner: Arc<MapInner>,
}

impl IdentityMap {
    pub fn new(conn: Connection, sink: Arc<dyn AttrSink>) -> Self {
        Self {
            inner: Arc::new(MapInner {
                conn,
                sink,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.inner.conn
    }

    /// Returns the resident inode for `node_id`, creating it if needed, and
    /// counts one more lookup against it.
    ///
    /// A record whose type differs from `attr` is marked bad and replaced by
    /// a fresh one. The map lock is held throughout, so one replacement is
    /// always enough.
    pub fn resolve(&self, node_id: u64, generation: u64, attr: &Attr) -> FuseResult<InodeRef> {
        if node_id == 0 {
            return Err(FuseError::InvalidArgument);
        }
        let kind = FileKind::from_mode(attr.mode).ok_or_else(|| {
            FuseError::ProtocolViolation(format!("node {node_id} has unknown type {:o}", attr.mode))
        })?;

        let mut entries = lock(&self.inner.entries);
        if let Some(entry) = entries.get_mut(&node_id) {
            if entry.inode.kind == kind {
                entry.refs += 1;
                entry.nlookup += 1;
                let inode = entry.inode.clone();
                drop(entries);
                self.change_attributes(&inode, attr);
                return Ok(self.wrap(inode));
            }
            warn!(
                target: "fusewire::inode",
                node_id,
                old = ?entry.inode.kind,
                new = ?kind,
                "node changed type, replacing record"
            );
            entry.inode.mark_bad();
            if let Some(stale) = entries.remove(&node_id) {
                self.inner.evict(stale);
            }
        }

        let inode = Arc::new(Inode::new(node_id, generation, kind));
        inode.store_attr(attr);
        entries.insert(
            node_id,
            Entry {
                inode: inode.clone(),
                refs: 1,
                nlookup: 1,
                forget: Some(self.inner.conn.reserve_request()),
            },
        );
        debug!(target: "fusewire::inode", node_id, generation, ?kind, "inode created");
        Ok(self.wrap(inode))
    }

    /// Applies freshly fetched attributes to a resident inode.
    ///
    /// A size change on a regular file invalidates its cached pages.
    pub fn change_attributes(&self, inode: &Inode, attr: &Attr) {
        let old_size = inode.store_attr(attr);
        if inode.kind == FileKind::Regular && old_size != attr.size {
            self.inner.sink.invalidate_pages(inode.node_id);
        }
    }

    /// Another reference to a resident inode, without counting a lookup.
    pub fn get(&self, node_id: u64) -> Option<InodeRef> {
        let mut entries = lock(&self.inner.entries);
        let entry = entries.get_mut(&node_id)?;
        entry.refs += 1;
        let inode = entry.inode.clone();
        drop(entries);
        Some(self.wrap(inode))
    }

    /// Drops the caller's reference; the last one evicts the record.
    pub fn release(&self, inode: InodeRef) {
        drop(inode);
    }

    pub fn lookup_count(&self, node_id: u64) -> Option<u64> {
        lock(&self.inner.entries).get(&node_id).map(|e| e.nlookup)
    }

    pub fn ref_count(&self, node_id: u64) -> Option<usize> {
        lock(&self.inner.entries).get(&node_id).map(|e| e.refs)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn wrap(&self, inode: Arc<Inode>) -> InodeRef {
        InodeRef {
            inode,
            map: self.inner.clone(),
        }
    }
}

impl fmt::Debug for IdentityMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityMap")
            .field("conn", &self.inner.conn.id())
            .field("len", &self.len())
            .finish()
    }
}

/// Counted handle to a resident inode.
pub struct InodeRef {
    inode: Arc<Inode>,
    map: Arc<MapInner>,
}

impl InodeRef {
    pub fn ptr_eq(a: &InodeRef, b: &InodeRef) -> bool {
        Arc::ptr_eq(&a.inode, &b.inode)
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.map.conn
    }
}

impl Clone for InodeRef {
    fn clone(&self) -> Self {
        let mut entries = lock(&self.map.entries);
        if let Some(entry) = entries.get_mut(&self.inode.node_id) {
            if Arc::ptr_eq(&entry.inode, &self.inode) {
                entry.refs += 1;
            }
        }
        drop(entries);
        Self {
            inode: self.inode.clone(),
            map: self.map.clone(),
        }
    }
}

impl Deref for InodeRef {
    type Target = Inode;

    fn deref(&self) -> &Inode {
        &self.inode
    }
}

impl Drop for InodeRef {
    fn drop(&mut self) {
        self.map.put(&self.inode);
    }
}

impl fmt::Debug for InodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inode.fmt(f)
    }
}
