// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Calling-thread identity and interruption
//!
//! A [`Task`] stands for the thread issuing a filesystem operation: its
//! credentials are stamped into every request header, and its [`Signal`]
//! interrupts the two blocking waits of the core (admission and reply).

use crate::lock;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub(crate) type WakeFn = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct SignalInner {
    pending: AtomicBool,
    waker: Mutex<Option<WakeFn>>,
}

/// A pending-signal flag that can interrupt a blocked wait from another thread.
///
/// The flag stays raised until [`Signal::clear`], so every wait started
/// while it is raised fails immediately.
#[derive(Clone, Default)]
pub struct Signal {
    inner: Arc<SignalInner>,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.inner.pending.store(true, Ordering::SeqCst);
        // Clone out so the waker runs without the registration lock held.
        let waker = lock(&self.inner.waker).clone();
        if let Some(wake) = waker {
            wake();
        }
    }

    pub fn clear(&self) {
        self.inner.pending.store(false, Ordering::SeqCst);
    }

    pub fn is_pending(&self) -> bool {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Registers `waker` for the duration of one blocking wait.
    ///
    /// Must be armed before the waiter first checks [`Signal::is_pending`].
    pub(crate) fn arm(&self, waker: WakeFn) -> ArmedSignal<'_> {
        *lock(&self.inner.waker) = Some(waker);
        ArmedSignal { signal: self }
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("pending", &self.is_pending())
            .finish()
    }
}

pub(crate) struct ArmedSignal<'a> {
    signal: &'a Signal,
}

impl Drop for ArmedSignal<'_> {
    fn drop(&mut self) {
        *lock(&self.signal.inner.waker) = None;
    }
}

/// Credentials and interruption state of a calling thread.
#[derive(Clone, Debug)]
pub struct Task {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    signal: Signal,
}

impl Task {
    pub fn new(uid: u32, gid: u32, pid: u32) -> Self {
        Self {
            uid,
            gid,
            pid,
            signal: Signal::new(),
        }
    }

    /// Identity used for requests the kernel side issues on its own (INIT).
    pub fn kernel() -> Self {
        Self::new(0, 0, 0)
    }

    pub fn signal(&self) -> &Signal {
        &self.signal
    }
}
