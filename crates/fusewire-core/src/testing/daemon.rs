// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use crate::device::Device;
use fusewire_proto::{ReplyFrame, RequestFrame};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// A daemon thread that answers each request with whatever the handler
/// returns; `None` sends nothing. Stops when the device read fails.
pub(crate) struct ScriptedDaemon {
    handle: JoinHandle<usize>,
}

impl ScriptedDaemon {
    pub(crate) fn spawn<F>(dev: Arc<Device>, mut handler: F) -> Self
    where
        F: FnMut(RequestFrame) -> Option<ReplyFrame> + Send + 'static,
    {
        let handle = thread::spawn(move || {
            let mut served = 0;
            while let Ok(bytes) = dev.read_frame() {
                let Ok(frame) = RequestFrame::decode(&bytes) else {
                    continue;
                };
                served += 1;
                if let Some(reply) = handler(frame) {
                    let _ = dev.write_reply(&reply.encode());
                }
            }
            served
        });
        Self { handle }
    }

    /// Waits for the thread to stop and returns how many frames it read.
    pub(crate) fn join(self) -> usize {
        self.handle.join().expect("daemon thread")
    }
}
