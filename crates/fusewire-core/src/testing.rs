// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Helpers shared by the unit tests

pub(crate) mod daemon;

use crate::config::ConnConfig;
use crate::conn::Connection;
use crate::device::Device;
use crate::error::FuseResult;
use crate::options::MountOptions;
use fusewire_proto::{InitOut, ReplyFrame, RequestFrame};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub(crate) fn test_options() -> MountOptions {
    MountOptions::parse("fd=7,rootmode=040755,user_id=0,group_id=0").expect("options")
}

pub(crate) fn test_connection(config: ConnConfig) -> Connection {
    Connection::new(config, &test_options())
}

/// A connection bound to a device, without a mount around it.
pub(crate) fn test_pair(config: ConnConfig) -> (Connection, Arc<Device>) {
    let conn = test_connection(config);
    let dev = Arc::new(Device::open());
    dev.bind(conn.clone()).expect("bind");
    (conn, dev)
}

pub(crate) fn read_frame(dev: &Device) -> RequestFrame {
    let bytes = dev.read_frame().expect("read request");
    RequestFrame::decode(&bytes).expect("decode request")
}

pub(crate) fn write_reply(dev: &Device, reply: &ReplyFrame) -> FuseResult<usize> {
    dev.write_reply(&reply.encode())
}

pub(crate) fn init_reply(unique: u64, major: u32, minor: u32) -> ReplyFrame {
    ReplyFrame::ok_struct(
        unique,
        &InitOut {
            major,
            minor,
            max_readahead: 64 * 1024,
            flags: fusewire_proto::abi::INIT_ASYNC_READ,
            unused: 0,
            max_write: 64 * 1024,
        },
    )
}

/// Polls `cond` until it holds; panics after five seconds.
pub(crate) fn wait_until<F: FnMut() -> bool>(mut cond: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(2));
    }
}
