// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end mount, dispatch and teardown scenarios

mod common;

use common::{read_frame, task, wait_until, Harness, OPTIONS};
use fusewire_core::{ConnConfig, Device, FdTable, FuseError, Mount};
use fusewire_proto::abi::{ROOT_ID, S_IFREG};
use fusewire_proto::{Attr, EntryOut, Opcode, OpenOut, ReplyFrame, StatfsOut};
use ssz::Encode;
use std::sync::Arc;

#[test]
fn mount_with_required_options_creates_root() {
    let harness = Harness::mount(OPTIONS, ConnConfig::default());
    let map = harness.mount.identity_map();
    assert_eq!(map.len(), 1);
    assert_eq!(map.lookup_count(ROOT_ID), Some(1));
    let root = harness.mount.root().expect("root");
    assert_eq!(root.node_id(), ROOT_ID);
    assert_eq!(harness.mount.options().to_string(), "user_id=0,group_id=0");

    let stats = harness.mount.connection().stats();
    assert_eq!(stats.holders, 2);
    assert!(stats.mounted && stats.connected);
    // INIT is the only request so far.
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.background, 1);
}

#[test]
fn mount_without_credentials_is_rejected() {
    let table = FdTable::new();
    let dev = Arc::new(Device::open());
    table.install(7, dev.clone()).expect("install");

    let err = Mount::mount(&table, "fd=7,rootmode=040755", ConnConfig::default())
        .expect_err("mount must fail");
    assert!(matches!(err, FuseError::InvalidOptions(_)));
    assert!(dev.connection().is_none());
}

#[test]
fn daemon_error_reaches_caller_unchanged() {
    let (harness, daemon) = Harness::serve(ConnConfig::default(), |frame| {
        Some(ReplyFrame::error(frame.unique(), -2))
    });
    let conn = harness.mount.connection().clone();
    let caller = task(10);

    let req = conn
        .prepare(&caller, |req| {
            req.set_opcode(Opcode::Statfs).set_nodeid(ROOT_ID);
            req.add_out(<StatfsOut as Encode>::ssz_fixed_len())?;
            Ok(())
        })
        .expect("prepare");
    assert_eq!(conn.stats().available, 9);

    let req = conn.send(req, &caller).expect("daemon replied");
    assert!(matches!(req.result(), Err(FuseError::Daemon(-2))));
    conn.put_request(req);

    let stats = conn.stats();
    assert_eq!(stats.available, 10);
    assert_eq!(stats.unused, 10);
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.waiting, 0);

    // The statfs adapter surfaces the same errno.
    assert!(matches!(
        harness.mount.statfs(&caller),
        Err(FuseError::Daemon(-2))
    ));

    harness.mount.unmount();
    harness.dev.release();
    assert_eq!(daemon.join().expect("daemon"), 3);
}

#[test]
fn unmount_drains_outstanding_background_request() {
    // A daemon that opens everything and never answers RELEASE.
    let (harness, daemon) = Harness::serve(ConnConfig::default(), |frame| {
        let unique = frame.unique();
        match frame.opcode().ok()? {
            Opcode::Lookup => {
                let entry = EntryOut {
                    nodeid: 2,
                    attr: Attr {
                        ino: 2,
                        mode: S_IFREG | 0o644,
                        nlink: 1,
                        ..Default::default()
                    },
                    ..Default::default()
                };
                Some(ReplyFrame::ok_struct(unique, &entry))
            }
            Opcode::Open => Some(ReplyFrame::ok_struct(
                unique,
                &OpenOut {
                    fh: 1,
                    ..Default::default()
                },
            )),
            _ => None,
        }
    });
    let Harness { table, dev, mount } = harness;
    let conn = mount.connection().clone();
    let map = mount.identity_map().clone();
    let caller = task(11);

    let root = mount.root().expect("root");
    let inode = mount.lookup(&root, "file", &caller).expect("lookup");
    let file = mount.open(&inode, libc::O_RDONLY as u32, &caller).expect("open");
    mount.release(&file).expect("release queued");
    drop((file, inode, root));
    wait_until(|| conn.stats().processing == 1);

    // The in-flight RELEASE pins the inode directly and through the handle.
    assert_eq!(map.ref_count(2), Some(2));
    assert_eq!(conn.stats().background, 1);

    let report = mount.unmount();
    assert_eq!(report.drained, 1);
    assert_eq!(report.stats.background, 0);
    assert_eq!(map.ref_count(2), None);
    assert!(map.is_empty());
    assert!(!conn.is_freed());

    table.close(7);
    dev.release();
    let stats = conn.stats();
    assert_eq!(stats.background, 0);
    assert_eq!(stats.queued, 0);
    assert_eq!(stats.holders, 0);
    assert!(stats.freed);
    daemon.join().expect("daemon");
}

#[test]
fn device_release_first_then_unmount_also_frees() {
    let harness = Harness::mount(OPTIONS, ConnConfig::default());
    let conn = harness.mount.connection().clone();
    let frame = read_frame(&harness.dev);
    assert_eq!(frame.opcode(), Ok(Opcode::Init));

    harness.dev.release();
    // INIT ended with an abort, which refuses further requests.
    assert!(conn.has_error());
    assert!(!conn.is_freed());
    assert!(matches!(
        harness.mount.statfs(&task(3)),
        Err(FuseError::NotConnected)
    ));

    harness.mount.unmount();
    assert!(conn.is_freed());
}
