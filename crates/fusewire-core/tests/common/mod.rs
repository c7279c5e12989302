// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

#![allow(dead_code)]

use fusewire_core::{ConnConfig, Device, FdTable, Mount, Task};
use fusewire_proto::abi::INIT_ASYNC_READ;
use fusewire_proto::{InitOut, Opcode, ReplyFrame, RequestFrame};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const FD: u32 = 7;
pub const OPTIONS: &str = "fd=7,rootmode=040755,user_id=0,group_id=0";

pub fn task(pid: u32) -> Task {
    Task::new(0, 0, pid)
}

pub fn init_reply(unique: u64) -> ReplyFrame {
    ReplyFrame::ok_struct(
        unique,
        &InitOut {
            major: 7,
            minor: 6,
            max_readahead: 64 * 1024,
            flags: INIT_ASYNC_READ,
            unused: 0,
            max_write: 64 * 1024,
        },
    )
}

pub fn read_frame(dev: &Device) -> RequestFrame {
    let bytes = dev.read_frame().expect("read request");
    RequestFrame::decode(&bytes).expect("decode request")
}

pub fn wait_until<F: FnMut() -> bool>(mut cond: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(2));
    }
}

/// Serves frames with `handler` until the device goes away; answers INIT
/// itself. Returns the number of frames read.
pub fn spawn_daemon<F>(dev: Arc<Device>, mut handler: F) -> JoinHandle<usize>
where
    F: FnMut(&RequestFrame) -> Option<ReplyFrame> + Send + 'static,
{
    thread::spawn(move || {
        let mut served = 0;
        while let Ok(bytes) = dev.read_frame() {
            let Ok(frame) = RequestFrame::decode(&bytes) else {
                continue;
            };
            served += 1;
            let reply = if frame.opcode() == Ok(Opcode::Init) {
                Some(init_reply(frame.unique()))
            } else {
                handler(&frame)
            };
            if let Some(reply) = reply {
                let _ = dev.write_reply(&reply.encode());
            }
        }
        served
    })
}

/// A mounted filesystem plus the device its daemon talks through.
pub struct Harness {
    pub table: FdTable,
    pub dev: Arc<Device>,
    pub mount: Mount,
}

impl Harness {
    pub fn mount(options: &str, config: ConnConfig) -> Self {
        let table = FdTable::new();
        let dev = Arc::new(Device::open());
        table.install(FD, dev.clone()).expect("install device");
        let mount = Mount::mount(&table, options, config).expect("mount");
        Self { table, dev, mount }
    }

    /// Mounts and starts a daemon, returning once INIT is negotiated.
    pub fn serve<F>(config: ConnConfig, handler: F) -> (Self, JoinHandle<usize>)
    where
        F: FnMut(&RequestFrame) -> Option<ReplyFrame> + Send + 'static,
    {
        let harness = Self::mount(OPTIONS, config);
        let daemon = spawn_daemon(harness.dev.clone(), handler);
        let conn = harness.mount.connection().clone();
        wait_until(|| conn.negotiated().initialized);
        (harness, daemon)
    }
}
