// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Node identity across lookups, type changes and eviction

mod common;

use common::{read_frame, spawn_daemon, task, wait_until, FD, OPTIONS};
use fusewire_core::{ConnConfig, CountingSink, Device, FdTable, FileKind, InodeRef, Mount};
use fusewire_proto::abi::{S_IFDIR, S_IFREG};
use fusewire_proto::{Attr, AttrOut, EntryOut, ForgetIn, Opcode, ReplyFrame, RequestFrame};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};

fn entry(nodeid: u64, mode: u32, size: u64) -> EntryOut {
    EntryOut {
        nodeid,
        attr: Attr {
            ino: nodeid,
            mode,
            size,
            nlink: 1,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// A daemon whose node 5 reports `mode` and `size` from shared cells and
/// which reports every FORGET it reads.
fn shifting_daemon(
    mode: Arc<AtomicU32>,
    size: Arc<AtomicU64>,
    forgets: mpsc::Sender<(u64, u64)>,
) -> impl FnMut(&RequestFrame) -> Option<ReplyFrame> + Send + 'static {
    move |frame| {
        let unique = frame.unique();
        let current = entry(5, mode.load(Ordering::SeqCst), size.load(Ordering::SeqCst));
        match frame.opcode().ok()? {
            Opcode::Lookup => Some(ReplyFrame::ok_struct(unique, &current)),
            Opcode::Getattr => Some(ReplyFrame::ok_struct(
                unique,
                &AttrOut {
                    attr: current.attr,
                    ..Default::default()
                },
            )),
            Opcode::Forget => {
                let (arg, _) = frame.arg::<ForgetIn>().ok()?;
                let _ = forgets.send((frame.header.nodeid, arg.nlookup));
                None
            }
            _ => Some(ReplyFrame::error(unique, -libc::ENOSYS)),
        }
    }
}

struct Setup {
    mount: Mount,
    dev: Arc<Device>,
    sink: Arc<CountingSink>,
    mode: Arc<AtomicU32>,
    size: Arc<AtomicU64>,
    forgets: mpsc::Receiver<(u64, u64)>,
    daemon: std::thread::JoinHandle<usize>,
}

fn setup() -> Setup {
    let table = FdTable::new();
    let dev = Arc::new(Device::open());
    table.install(FD, dev.clone()).expect("install");
    let sink = Arc::new(CountingSink::new());
    let mount = Mount::mount_with_sink(&table, OPTIONS, ConnConfig::default(), sink.clone())
        .expect("mount");

    let mode = Arc::new(AtomicU32::new(S_IFREG | 0o644));
    let size = Arc::new(AtomicU64::new(0));
    let (tx, forgets) = mpsc::channel();
    let daemon = spawn_daemon(dev.clone(), shifting_daemon(mode.clone(), size.clone(), tx));
    let conn = mount.connection().clone();
    wait_until(|| conn.negotiated().initialized);
    Setup {
        mount,
        dev,
        sink,
        mode,
        size,
        forgets,
        daemon,
    }
}

#[test]
fn repeated_lookup_returns_same_record() {
    let s = setup();
    let root = s.mount.root().expect("root");
    let caller = task(1);
    let a = s.mount.lookup(&root, "n", &caller).expect("first");
    let b = s.mount.lookup(&root, "n", &caller).expect("second");
    let c = s.mount.lookup(&root, "n", &caller).expect("third");
    assert!(InodeRef::ptr_eq(&a, &b) && InodeRef::ptr_eq(&b, &c));
    assert_eq!(s.mount.identity_map().lookup_count(5), Some(3));

    drop((a, b, c));
    let (node, nlookup) = s.forgets.recv().expect("forget");
    assert_eq!((node, nlookup), (5, 3));
    assert_eq!(s.mount.identity_map().lookup_count(5), None);

    drop(root);
    s.mount.unmount();
    s.dev.release();
    s.daemon.join().expect("daemon");
}

#[test]
fn type_change_yields_fresh_record() {
    let s = setup();
    let root = s.mount.root().expect("root");
    let caller = task(2);
    let file = s.mount.lookup(&root, "n", &caller).expect("file");
    assert_eq!(file.kind(), FileKind::Regular);

    s.mode.store(S_IFDIR | 0o755, Ordering::SeqCst);
    let dir = s.mount.lookup(&root, "n", &caller).expect("dir");
    assert_eq!(dir.kind(), FileKind::Directory);
    assert!(!InodeRef::ptr_eq(&file, &dir));
    assert!(file.is_bad());

    // The old record's lookup was forgotten before the new one appeared.
    assert_eq!(s.forgets.recv().expect("forget"), (5, 1));
    assert_eq!(s.mount.identity_map().lookup_count(5), Some(1));

    // Stale handles fail cleanly.
    assert!(s.mount.getattr(&file, &caller).is_err());
    assert!(s.mount.open(&file, 0, &caller).is_err());

    drop((file, dir, root));
    s.mount.unmount();
    s.dev.release();
    s.daemon.join().expect("daemon");
}

#[test]
fn size_change_invalidates_cached_pages() {
    let s = setup();
    let root = s.mount.root().expect("root");
    let caller = task(3);
    let file = s.mount.lookup(&root, "n", &caller).expect("file");
    assert_eq!(s.sink.count(), 0);

    s.size.store(4096, Ordering::SeqCst);
    s.mount.invalidate_attr(&file);
    assert_eq!(s.mount.getattr(&file, &caller).expect("getattr").size, 4096);
    assert_eq!(s.sink.count(), 1);

    // Same size again: nothing to invalidate.
    s.mount.invalidate_attr(&file);
    s.mount.getattr(&file, &caller).expect("getattr");
    assert_eq!(s.sink.count(), 1);

    drop((file, root));
    s.mount.unmount();
    s.dev.release();
    s.daemon.join().expect("daemon");
}

#[test]
fn eviction_after_unmount_sends_no_forget() {
    let table = FdTable::new();
    let dev = Arc::new(Device::open());
    table.install(FD, dev.clone()).expect("install");
    let mount = Mount::mount(&table, OPTIONS, ConnConfig::default()).expect("mount");
    let map = mount.identity_map().clone();
    let conn = mount.connection().clone();
    assert_eq!(read_frame(&dev).opcode(), Ok(Opcode::Init));

    let root = mount.root().expect("root");
    mount.unmount();
    assert_eq!(map.lookup_count(1), Some(1));
    drop(root);
    assert!(map.is_empty());
    assert_eq!(conn.stats().pending, 0);
}
