// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! fusewire host: mounts a connection over an in-process device and serves
//! it with the loopback daemon

pub mod loopback;
pub mod script;

use anyhow::{anyhow, bail, Context, Result};
use fusewire_core::{ConnConfig, ConnStats, Connection, Device, FdTable, Mount, MountOptions, Task};
use serde::Serialize;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

pub use loopback::{LoopbackFs, TreeEntry};
pub use script::{Script, Step, StepOutcome, Walker};

const INIT_TIMEOUT: Duration = Duration::from_secs(5);

/// What the daemon looked like once it stopped.
#[derive(Clone, Debug, Serialize)]
pub struct DaemonSummary {
    pub served: usize,
    pub open_handles: usize,
    pub outstanding_lookups: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub steps: Vec<StepOutcome>,
    /// Background requests released by the unmount.
    pub drained: usize,
    /// Connection state after both holders let go.
    pub stats: ConnStats,
    pub daemon: DaemonSummary,
}

fn wait_for_init(conn: &Connection, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !conn.negotiated().initialized {
        if conn.has_error() || Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
    true
}

/// Mounts `options`, runs `script` against the mount and tears everything
/// down again.
pub fn run(options: &str, config: ConnConfig, script: &Script) -> Result<RunReport> {
    config.validate().context("validating config")?;
    let parsed = MountOptions::parse(options).context("parsing mount options")?;
    let table = FdTable::new();
    let dev = Arc::new(Device::open());
    table
        .install(parsed.fd, dev.clone())
        .with_context(|| format!("installing device at fd {}", parsed.fd))?;

    let mut fs = LoopbackFs::new(parsed.user_id, parsed.group_id);
    fs.populate(&script.tree)?;

    let mount = Mount::mount(&table, options, config).context("mounting")?;
    let conn = mount.connection().clone();
    let daemon = fs.serve(dev.clone());

    let negotiated = wait_for_init(&conn, INIT_TIMEOUT);
    let steps = if negotiated {
        info!(target: "fusewire_host", negotiated = ?conn.negotiated(), "daemon ready");
        let task = Task::new(parsed.user_id, parsed.group_id, std::process::id());
        let mut walker = Walker::new(&mount, task);
        let steps = walker.run(&script.steps);
        walker.close_all();
        steps
    } else {
        Vec::new()
    };

    let report = mount.unmount();
    table.close(parsed.fd);
    dev.release();
    let fs = daemon
        .join()
        .map_err(|_| anyhow!("loopback daemon panicked"))?;
    if !negotiated {
        bail!("daemon did not complete INIT within {INIT_TIMEOUT:?}");
    }

    let stats = conn.stats();
    info!(target: "fusewire_host", freed = stats.freed, drained = report.drained, "torn down");
    Ok(RunReport {
        steps,
        drained: report.drained,
        stats,
        daemon: DaemonSummary {
            served: fs.served(),
            open_handles: fs.open_handles(),
            outstanding_lookups: fs.total_lookups(),
        },
    })
}
