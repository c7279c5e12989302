// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! fusewire host
//!
//! Mounts a connection, serves it with the in-memory loopback daemon, runs a
//! scripted walk and prints the final connection statistics as JSON.

use anyhow::{Context, Result};
use clap::Parser;
use fusewire_core::ConnConfig;
use fusewire_host::Script;
use fusewire_logging::CliLoggingArgs;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "fusewire-host", version)]
struct Args {
    /// Mount options, e.g. fd=3,rootmode=040755,user_id=0,group_id=0
    #[arg(short, long)]
    options: String,

    /// Connection configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Script with the initial tree and the steps to run (JSON); a built-in
    /// demo walk runs when omitted
    #[arg(short, long)]
    script: Option<PathBuf>,

    #[command(flatten)]
    logging: CliLoggingArgs,
}

fn load_config(path: Option<&Path>) -> Result<ConnConfig> {
    match path {
        Some(path) => {
            let bytes =
                fs::read(path).with_context(|| format!("reading config {}", path.display()))?;
            let config = ConnConfig::from_json_bytes(&bytes)
                .with_context(|| format!("parsing config {}", path.display()))?;
            config
                .validate()
                .with_context(|| format!("validating config {}", path.display()))?;
            Ok(config)
        }
        None => Ok(ConnConfig::default()),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    args.logging.clone().init("fusewire-host")?;

    let config = load_config(args.config.as_deref())?;
    let script = match &args.script {
        Some(path) => Script::load(path)?,
        None => Script::demo(),
    };
    tracing::info!(
        target: "fusewire_host",
        options = %args.options,
        steps = script.steps.len(),
        "starting"
    );

    let report = fusewire_host::run(&args.options, config, &script)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
