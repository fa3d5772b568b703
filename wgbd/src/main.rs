// Copyright (c) 2025 Ralf Anton Beier
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! # Guest Bridge Daemon (wgbd)
//!
//! A daemon process that runs a sandboxed guest module against the host
//! bridge and provides its system services.
//!
//! This daemon provides:
//! - Bridge construction over the standard host facades (console, clocks,
//!   randomness, timers)
//! - Argument and environment forwarding into guest memory
//! - A blocking event loop driving the guest's timers to completion
//! - Exit code propagation from the guest to the calling shell
//!
//! ## Usage
//!
//! ```bash
//! wgbd [--arg <value>]... [--env KEY=VALUE]... [--no-return-on-exit]
//! ```
//!
//! The built-in demo guest prints through the bridge's write path, sleeps on
//! the timer shim and exits with code 0. `--arg` and `--env` values are
//! marshalled into guest memory exactly as they would be for a real guest.
//!
//! Set `RUST_LOG_FORMAT` to `json` or `compact` to switch the log output
//! format; the default is human-readable pretty printing.

#![warn(missing_docs)]

mod demo;

use std::env;
use std::rc::Rc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use wgb_bridge::bridge::{Bridge, BridgeConfig, HostEnv};
use wgb_bridge::event_loop::EventLoop;
use wgb_bridge::host::{OsRandom, StdFileSystem, StdProcess, SystemClock};
use wgb_bridge::module::GuestModule;

/// Guest Bridge Daemon CLI arguments
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Arguments forwarded to the guest after the program name
    #[arg(long = "arg", value_name = "VALUE")]
    args: Vec<String>,

    /// Environment variables forwarded to the guest
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
    env: Vec<(String, String)>,

    /// Terminate the process directly on guest exit instead of returning
    /// through the event loop
    #[arg(long)]
    no_return_on_exit: bool,
}

fn parse_env(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {s:?}"))
}

fn main() -> Result<()> {
    // Initialize tracing
    initialize_tracing();

    // Parse command line arguments
    let args = Args::parse();

    let mut argv = vec!["wgbd-demo".to_string()];
    argv.extend(args.args);

    let event_loop = EventLoop::new();
    let mut bridge = Bridge::new(
        BridgeConfig { return_on_exit: !args.no_return_on_exit, shared_value: None },
        HostEnv {
            fs: Box::new(StdFileSystem),
            process: Box::new(StdProcess::new(argv, args.env.into_iter().collect())),
            clock: Box::new(SystemClock::new()),
            random: Box::new(OsRandom),
            scheduler: Box::new(event_loop.scheduler()),
        },
    );

    info!("starting demo guest");
    let guest: Rc<dyn GuestModule> = demo::DemoGuest::new();
    bridge.start(guest).context("guest failed to start")?;

    let code = event_loop.run(&mut bridge).context("guest cannot make progress")?;
    info!("guest exited with code {}", code);
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

/// Initialize the tracing system for logging
fn initialize_tracing() {
    let format = env::var("RUST_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_span_events(FmtSpan::NONE)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    match format.as_str() {
        "json" => subscriber.json().init(),
        "compact" => subscriber.compact().init(),
        _ => subscriber.pretty().init(),
    }
}
