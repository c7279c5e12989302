// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Boundary to the page cache owned by the surrounding VFS layer

use std::sync::atomic::{AtomicU64, Ordering};

/// Receives notifications that cached file data went stale.
#[cfg_attr(test, mockall::automock)]
pub trait AttrSink: Send + Sync {
    /// The daemon reported a new size for a regular file.
    fn invalidate_pages(&self, node_id: u64);
}

/// Sink that only counts invalidations; used when no page cache is attached.
#[derive(Debug, Default)]
pub struct CountingSink {
    invalidations: AtomicU64,
}

impl CountingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }
}

impl AttrSink for CountingSink {
    fn invalidate_pages(&self, _node_id: u64) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }
}
