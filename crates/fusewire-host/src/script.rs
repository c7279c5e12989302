// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Scripted walks over a mounted filesystem
//!
//! A script names the tree the loopback daemon starts with and a list of
//! VFS-level steps to run against the mount. Every step is recorded with
//! its outcome; a failing step does not stop the walk.

use crate::loopback::TreeEntry;
use anyhow::{Context, Result};
use fusewire_core::{FileRef, FuseError, FuseResult, InodeRef, Mount, Task};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    #[serde(default)]
    pub tree: Vec<TreeEntry>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// One operation. Paths are relative to the root; handles are names the
/// script picks when opening.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Lookup {
        path: String,
    },
    Getattr {
        path: String,
    },
    Open {
        path: String,
        handle: String,
        #[serde(default)]
        flags: u32,
    },
    Read {
        handle: String,
        #[serde(default)]
        offset: u64,
        size: usize,
    },
    Write {
        handle: String,
        #[serde(default)]
        offset: u64,
        data: String,
    },
    Release {
        handle: String,
    },
    Statfs,
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::Lookup { .. } => "lookup",
            Step::Getattr { .. } => "getattr",
            Step::Open { .. } => "open",
            Step::Read { .. } => "read",
            Step::Write { .. } => "write",
            Step::Release { .. } => "release",
            Step::Statfs => "statfs",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StepOutcome {
    pub index: usize,
    pub op: &'static str,
    pub ok: bool,
    /// Result fields on success, `{"error", "errno"}` on failure.
    pub detail: Value,
}

impl Script {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading script {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parsing script {}", path.display()))
    }

    /// A small walk used when no script is given.
    pub fn demo() -> Self {
        let handle = "h".to_string();
        Self {
            tree: vec![
                TreeEntry {
                    path: "docs/hello.txt".into(),
                    contents: "hello from the loopback daemon\n".into(),
                    ..Default::default()
                },
                TreeEntry {
                    path: "scratch".into(),
                    dir: true,
                    ..Default::default()
                },
            ],
            steps: vec![
                Step::Lookup {
                    path: "docs/hello.txt".into(),
                },
                Step::Open {
                    path: "docs/hello.txt".into(),
                    handle: handle.clone(),
                    flags: libc::O_RDWR as u32,
                },
                Step::Read {
                    handle: handle.clone(),
                    offset: 0,
                    size: 64,
                },
                Step::Write {
                    handle: handle.clone(),
                    offset: 0,
                    data: "HELLO".into(),
                },
                Step::Getattr {
                    path: "docs/hello.txt".into(),
                },
                Step::Release { handle },
                Step::Statfs,
            ],
        }
    }
}

/// Runs steps against one mount, holding open handles between steps.
pub struct Walker<'m> {
    mount: &'m Mount,
    task: Task,
    handles: HashMap<String, FileRef>,
}

impl<'m> Walker<'m> {
    pub fn new(mount: &'m Mount, task: Task) -> Self {
        Self {
            mount,
            task,
            handles: HashMap::new(),
        }
    }

    pub fn run(&mut self, steps: &[Step]) -> Vec<StepOutcome> {
        steps
            .iter()
            .enumerate()
            .map(|(index, step)| {
                let outcome = match self.step(step) {
                    Ok(detail) => StepOutcome {
                        index,
                        op: step.name(),
                        ok: true,
                        detail,
                    },
                    Err(err) => StepOutcome {
                        index,
                        op: step.name(),
                        ok: false,
                        detail: json!({ "error": err.to_string(), "errno": err.errno() }),
                    },
                };
                if outcome.ok {
                    info!(target: "fusewire_host", index, op = outcome.op, detail = %outcome.detail, "step");
                } else {
                    warn!(target: "fusewire_host", index, op = outcome.op, detail = %outcome.detail, "step failed");
                }
                outcome
            })
            .collect()
    }

    /// Releases every handle the script left open, as a closing process
    /// would.
    pub fn close_all(&mut self) {
        for (name, file) in self.handles.drain() {
            if let Err(err) = self.mount.release(&file) {
                warn!(target: "fusewire_host", handle = %name, error = %err, "release at exit failed");
            }
        }
    }

    fn resolve(&self, path: &str) -> FuseResult<InodeRef> {
        let mut node = self.mount.root()?;
        for name in path.split('/').filter(|c| !c.is_empty()) {
            node = self.mount.lookup(&node, name, &self.task)?;
        }
        Ok(node)
    }

    fn handle(&self, name: &str) -> FuseResult<&FileRef> {
        self.handles
            .get(name)
            .ok_or(FuseError::InvalidArgument)
    }

    fn step(&mut self, step: &Step) -> FuseResult<Value> {
        match step {
            Step::Lookup { path } => {
                let inode = self.resolve(path)?;
                Ok(json!({ "node_id": inode.node_id(), "kind": inode.kind() }))
            }
            Step::Getattr { path } => {
                let inode = self.resolve(path)?;
                let attr = self.mount.getattr(&inode, &self.task)?;
                Ok(json!({ "ino": attr.ino, "size": attr.size, "mode": format!("{:o}", attr.mode) }))
            }
            Step::Open {
                path,
                handle,
                flags,
            } => {
                let inode = self.resolve(path)?;
                let file = self.mount.open(&inode, *flags, &self.task)?;
                let fh = file.fh();
                if let Some(previous) = self.handles.insert(handle.clone(), file) {
                    // Reusing a name closes what it pointed at.
                    self.mount.release(&previous)?;
                }
                Ok(json!({ "fh": fh }))
            }
            Step::Read {
                handle,
                offset,
                size,
            } => {
                let file = self.handle(handle)?;
                let data = self.mount.read(file, *offset, *size, &self.task)?;
                Ok(json!({ "len": data.len(), "data": String::from_utf8_lossy(&data) }))
            }
            Step::Write {
                handle,
                offset,
                data,
            } => {
                let file = self.handle(handle)?;
                let written = self.mount.write(file, *offset, data.as_bytes(), &self.task)?;
                Ok(json!({ "written": written }))
            }
            Step::Release { handle } => {
                let file = self
                    .handles
                    .remove(handle)
                    .ok_or(FuseError::InvalidArgument)?;
                self.mount.release(&file)?;
                Ok(json!({}))
            }
            Step::Statfs => {
                let st = self.mount.statfs(&self.task)?;
                Ok(json!({ "blocks": st.blocks, "bfree": st.bfree, "files": st.files, "bsize": st.bsize }))
            }
        }
    }
}

impl Drop for Walker<'_> {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_parse_from_tagged_json() {
        let script: Script = serde_json::from_str(
            r#"{
                "tree": [ { "path": "a/b.txt", "contents": "x" } ],
                "steps": [
                    { "op": "open", "path": "a/b.txt", "handle": "f" },
                    { "op": "read", "handle": "f", "size": 10 },
                    { "op": "statfs" }
                ]
            }"#,
        )
        .expect("script");
        assert_eq!(script.tree[0].path, "a/b.txt");
        assert!(!script.tree[0].dir);
        assert_eq!(
            script.steps[0],
            Step::Open {
                path: "a/b.txt".into(),
                handle: "f".into(),
                flags: 0
            }
        );
        assert_eq!(
            script.steps[1],
            Step::Read {
                handle: "f".into(),
                offset: 0,
                size: 10
            }
        );
        assert_eq!(script.steps[2].name(), "statfs");
    }

    #[test]
    fn unknown_op_is_rejected() {
        let err = serde_json::from_str::<Script>(r#"{ "steps": [ { "op": "mkdir", "path": "x" } ] }"#);
        assert!(err.is_err());
    }

    #[test]
    fn demo_round_trips_through_json() {
        let demo = Script::demo();
        let text = serde_json::to_string(&demo).expect("json");
        let back: Script = serde_json::from_str(&text).expect("parse");
        assert_eq!(back, demo);
    }
}
