// Copyright (c) 2025 Ralf Anton Beier
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

#![forbid(unsafe_code)] // Rule 2

//! Host-side bridge for sandboxed guest bytecode modules (WGB).
//!
//! This crate is the host half of a guest/host boundary: the guest is a
//! sandboxed program with a flat linear memory and no native system access,
//! and every capability it uses — console output, time, randomness, timers
//! and arbitrary host values — crosses through one [`bridge::Bridge`]
//! instance.
//!
//! ## Features
//!
//! - Value table mapping host values to guest-visible integer handles with
//!   explicit reference counting ([`table`])
//! - NaN-boxed 8-byte wire encoding of boundary values ([`codec`])
//! - Reflective call bridge: property access, calls, construction and byte
//!   copies over registered host objects ([`bridge`], [`value`])
//! - Synchronous host-to-guest callbacks via a pending-call trampoline
//! - Timer shim with host-side scheduling and a reference event loop
//!   ([`event_loop`])
//!
//! ## Usage
//!
//! ```rust,no_run
//! # use std::rc::Rc;
//! # use wgb_bridge::prelude::*;
//! use wgb_bridge::bridge::{Bridge, BridgeConfig, HostEnv};
//! use wgb_bridge::event_loop::EventLoop;
//! use wgb_bridge::host::{OsRandom, StdFileSystem, StdProcess, SystemClock};
//!
//! # fn load_guest() -> Rc<dyn wgb_bridge::module::GuestModule> { unimplemented!() }
//! let event_loop = EventLoop::new();
//! let mut bridge = Bridge::new(
//!     BridgeConfig::default(),
//!     HostEnv {
//!         fs: Box::new(StdFileSystem),
//!         process: Box::new(StdProcess::from_os()),
//!         clock: Box::new(SystemClock::new()),
//!         random: Box::new(OsRandom),
//!         scheduler: Box::new(event_loop.scheduler()),
//!     },
//! );
//!
//! let guest = load_guest();
//! bridge.start(guest).expect("guest failed to start");
//! let code = event_loop.run(&mut bridge).expect("guest deadlocked");
//! std::process::exit(code);
//! ```
//!
//! The bridge is deliberately single-threaded: it is neither `Send` nor
//! `Sync`, and guest execution is strictly cooperative.

#![warn(missing_docs)]
#![warn(clippy::missing_panics_doc)]

pub mod bridge;
pub mod codec;
pub mod event_loop;
pub mod host;
pub mod memory;
pub mod module;
pub mod prelude;
pub mod table;
pub mod value;

pub use bridge::{Bridge, BridgeConfig, HostEnv, LifecycleState};
pub use event_loop::EventLoop;
pub use module::GuestModule;
pub use table::{Handle, ValueTable};
pub use value::{HostFunc, HostObject, HostValue, ReflectResult};
