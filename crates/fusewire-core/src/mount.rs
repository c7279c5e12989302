// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mount lifecycle: option parsing, device binding, root inode, INIT
//! negotiation and unmount

use crate::config::ConnConfig;
use crate::conn::{ConnStats, Connection, Negotiated};
use crate::device::{Device, FdTable};
use crate::error::{FuseError, FuseResult};
use crate::inode::{IdentityMap, InodeRef};
use crate::options::MountOptions;
use crate::request::Request;
use crate::sink::{AttrSink, CountingSink};
use crate::task::Task;
use fusewire_proto::abi::{INIT_ASYNC_READ, KERNEL_MINOR_VERSION, KERNEL_VERSION, ROOT_ID};
use fusewire_proto::{Attr, InitIn, InitOut, Opcode};
use serde::Serialize;
use ssz::Encode;
use std::sync::Arc;
use tracing::{info, warn};

/// Write ceiling of daemons older than minor version 5.
const COMPAT_MAX_WRITE: u32 = 4096;

/// What [`Mount::unmount`] observed.
#[derive(Clone, Debug, Serialize)]
pub struct UnmountReport {
    /// Background requests whose references were released.
    pub drained: usize,
    pub stats: ConnStats,
}

/// One mounted filesystem: the superblock side of a [`Connection`].
pub struct Mount {
    conn: Connection,
    device: Arc<Device>,
    map: IdentityMap,
    root: Option<InodeRef>,
    options: MountOptions,
    active: bool,
}

impl Mount {
    /// Mounts the device installed at the `fd` named in `options`.
    pub fn mount(table: &FdTable, options: &str, config: ConnConfig) -> FuseResult<Self> {
        Self::mount_with_sink(table, options, config, Arc::new(CountingSink::new()))
    }

    pub fn mount_with_sink(
        table: &FdTable,
        options: &str,
        config: ConnConfig,
        sink: Arc<dyn AttrSink>,
    ) -> FuseResult<Self> {
        config.validate()?;
        let options = MountOptions::parse(options)?;
        let device = table.get(options.fd).ok_or(FuseError::InvalidArgument)?;
        let conn = device.bind_with(|| Connection::new(config, &options))?;
        let map = IdentityMap::new(conn.clone(), sink);

        let root_attr = Attr {
            ino: ROOT_ID,
            mode: options.rootmode,
            nlink: 1,
            ..Default::default()
        };
        let root = match map.resolve(ROOT_ID, 0, &root_attr) {
            Ok(root) => root,
            Err(err) => {
                conn.begin_unmount();
                conn.release_holder("mount");
                return Err(err);
            }
        };
        // From here on a failure unwinds through Drop.
        let mount = Self {
            conn,
            device,
            map,
            root: Some(root),
            options,
            active: true,
        };
        send_init(&mount.conn)?;
        info!(
            target: "fusewire::mount",
            conn = mount.conn.id(),
            fd = mount.options.fd,
            options = %mount.options,
            "mounted"
        );
        Ok(mount)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn identity_map(&self) -> &IdentityMap {
        &self.map
    }

    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// A new reference to the root inode.
    pub fn root(&self) -> FuseResult<InodeRef> {
        self.root.clone().ok_or(FuseError::NotConnected)
    }

    /// Detaches the superblock: stops dispatch, releases what background
    /// requests hold and drops the mount's holder reference.
    pub fn unmount(mut self) -> UnmountReport {
        self.teardown()
    }

    fn teardown(&mut self) -> UnmountReport {
        self.active = false;
        self.conn.begin_unmount();
        let drained = self.conn.drain_background();
        drop(self.root.take());
        self.conn.release_holder("mount");
        let stats = self.conn.stats();
        info!(
            target: "fusewire::mount",
            conn = self.conn.id(),
            drained,
            holders = stats.holders,
            "unmounted"
        );
        UnmountReport { drained, stats }
    }
}

impl Drop for Mount {
    fn drop(&mut self) {
        if self.active {
            self.teardown();
        }
    }
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount")
            .field("conn", &self.conn.id())
            .field("options", &self.options.to_string())
            .field("active", &self.active)
            .finish()
    }
}

/// Queues INIT in the background; the reply settles `conn_error` and the
/// negotiated limits.
fn send_init(conn: &Connection) -> FuseResult<()> {
    let max_readahead = conn.config().max_readahead;
    let mut req = conn.prepare(&Task::kernel(), |req| {
        req.set_opcode(Opcode::Init);
        req.add_in_struct(&InitIn {
            major: KERNEL_VERSION,
            minor: KERNEL_MINOR_VERSION,
            max_readahead,
            flags: INIT_ASYNC_READ,
        })?;
        req.add_out(<InitOut as Encode>::ssz_fixed_len())?;
        req.set_out_argvar(true);
        Ok(())
    })?;
    req.set_end(Box::new(process_init_reply));
    conn.send_background(req)
}

fn process_init_reply(conn: &Connection, req: Request) {
    let outcome = req
        .result()
        .and_then(|()| req.out_struct_padded::<InitOut>(0));
    conn.put_request(req);

    let negotiated = match outcome {
        Ok(out) if out.major == KERNEL_VERSION => Negotiated {
            initialized: true,
            minor: out.minor,
            max_write: if out.minor < 5 {
                COMPAT_MAX_WRITE
            } else {
                out.max_write
            },
            max_readahead: out.max_readahead.min(conn.config().max_readahead),
            async_read: out.minor >= 6 && out.flags & INIT_ASYNC_READ != 0,
        },
        Ok(out) => {
            warn!(target: "fusewire::mount", conn = conn.id(), major = out.major, "daemon speaks another protocol major");
            conn.lock().conn_error = true;
            return;
        }
        Err(err) => {
            warn!(target: "fusewire::mount", conn = conn.id(), error = %err, "INIT failed");
            conn.lock().conn_error = true;
            return;
        }
    };
    conn.lock().negotiated = negotiated;
    info!(
        target: "fusewire::mount",
        conn = conn.id(),
        minor = negotiated.minor,
        max_write = negotiated.max_write,
        async_read = negotiated.async_read,
        "protocol negotiated"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{init_reply, read_frame, write_reply};

    const OPTS: &str = "fd=7,rootmode=040755,user_id=0,group_id=0";

    fn table_with_device(fd: u32) -> (FdTable, Arc<Device>) {
        let table = FdTable::new();
        let dev = Arc::new(Device::open());
        table.install(fd, dev.clone()).expect("install");
        (table, dev)
    }

    #[test]
    fn mount_creates_root_and_queues_init() {
        let (table, dev) = table_with_device(7);
        let mount = Mount::mount(&table, OPTS, ConnConfig::default()).expect("mount");
        let root = mount.root().expect("root");
        assert_eq!(root.node_id(), ROOT_ID);
        assert!(root.is_dir());
        assert_eq!(mount.identity_map().lookup_count(ROOT_ID), Some(1));

        let frame = read_frame(&dev);
        assert_eq!(frame.opcode(), Ok(Opcode::Init));
        let (init, _) = frame.arg::<InitIn>().expect("init arg");
        assert_eq!((init.major, init.minor), (KERNEL_VERSION, KERNEL_MINOR_VERSION));
        assert_eq!(init.flags, INIT_ASYNC_READ);
    }

    #[test]
    fn missing_options_create_no_connection() {
        let (table, dev) = table_with_device(7);
        let err = Mount::mount(&table, "fd=7,rootmode=040755", ConnConfig::default())
            .expect_err("must fail");
        assert!(matches!(err, FuseError::InvalidOptions(_)));
        assert!(dev.connection().is_none());
    }

    #[test]
    fn empty_request_pool_fails_before_binding() {
        let (table, dev) = table_with_device(7);
        let config = ConnConfig {
            max_outstanding: 0,
            ..Default::default()
        };
        let err = Mount::mount(&table, OPTS, config).expect_err("must fail");
        assert!(matches!(err, FuseError::InvalidConfig(_)));
        assert!(dev.connection().is_none());
        // The device stays free for a well-formed mount.
        let _mount = Mount::mount(&table, OPTS, ConnConfig::default()).expect("mount");
    }

    #[test]
    fn unknown_fd_and_rebind_fail() {
        let (table, _dev) = table_with_device(7);
        let other = "fd=8,rootmode=040755,user_id=0,group_id=0";
        assert!(matches!(
            Mount::mount(&table, other, ConnConfig::default()),
            Err(FuseError::InvalidArgument)
        ));
        let _first = Mount::mount(&table, OPTS, ConnConfig::default()).expect("mount");
        assert!(matches!(
            Mount::mount(&table, OPTS, ConnConfig::default()),
            Err(FuseError::InvalidArgument)
        ));
    }

    #[test]
    fn init_reply_records_negotiation() {
        let (table, dev) = table_with_device(7);
        let mount = Mount::mount(&table, OPTS, ConnConfig::default()).expect("mount");
        let frame = read_frame(&dev);
        write_reply(&dev, &init_reply(frame.unique(), 7, 6)).expect("reply");

        let negotiated = mount.connection().negotiated();
        assert!(negotiated.initialized);
        assert_eq!(negotiated.minor, 6);
        assert!(negotiated.async_read);
        assert_eq!(negotiated.max_write, 64 * 1024);
        assert!(!mount.connection().has_error());
        assert_eq!(mount.connection().stats().available, 10);
    }

    #[test]
    fn old_minor_gets_compat_write_size() {
        let (table, dev) = table_with_device(7);
        let mount = Mount::mount(&table, OPTS, ConnConfig::default()).expect("mount");
        let frame = read_frame(&dev);
        write_reply(&dev, &init_reply(frame.unique(), 7, 2)).expect("reply");
        let negotiated = mount.connection().negotiated();
        assert_eq!(negotiated.max_write, COMPAT_MAX_WRITE);
        assert!(!negotiated.async_read);
    }

    #[test]
    fn major_mismatch_marks_conn_error() {
        let (table, dev) = table_with_device(7);
        let mount = Mount::mount(&table, OPTS, ConnConfig::default()).expect("mount");
        let frame = read_frame(&dev);
        write_reply(&dev, &init_reply(frame.unique(), 8, 0)).expect("reply");
        assert!(mount.connection().has_error());
        assert!(!mount.connection().negotiated().initialized);
    }

    #[test]
    fn unmount_then_device_release_frees_connection() {
        let (table, dev) = table_with_device(7);
        let mount = Mount::mount(&table, OPTS, ConnConfig::default()).expect("mount");
        let conn = mount.connection().clone();

        // INIT is still outstanding in the background.
        let report = mount.unmount();
        assert_eq!(report.drained, 1);
        assert_eq!(report.stats.background, 0);
        assert_eq!(report.stats.holders, 1);
        assert!(!conn.is_freed());

        table.close(7);
        dev.release();
        let stats = conn.stats();
        assert!(stats.freed);
        assert_eq!(stats.holders, 0);
        assert_eq!(stats.queued, 0);
    }
}
