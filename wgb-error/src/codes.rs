// WGB - wgb-error
// Module: WGB Error Codes
//
// Copyright (c) 2025 Ralf Anton Beier
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! Error codes for WGB

// Lifecycle error codes (1000-1999)
/// Bridge was started a second time
pub const BRIDGE_ALREADY_STARTED: u16 = 1000;
/// Operation requires the bridge to be in the running state
pub const BRIDGE_NOT_RUNNING: u16 = 1001;
/// Bridge has already exited
pub const BRIDGE_EXITED: u16 = 1002;
/// No guest module is attached to the bridge
pub const NO_GUEST_MODULE: u16 = 1003;

// Memory error codes (2000-2999)
/// Guest memory access out of bounds
pub const MEMORY_OUT_OF_BOUNDS: u16 = 2000;
/// Address arithmetic overflowed
pub const ADDRESS_OVERFLOW: u16 = 2001;

// Value table error codes (3000-3999)
/// Handle does not name a live host value
pub const INVALID_HANDLE: u16 = 3000;
/// Value cannot be internalized (numbers and undefined stay on the float path)
pub const NOT_INTERNALIZABLE: u16 = 3001;
/// Handle released more times than it was referenced
pub const OVER_RELEASED_HANDLE: u16 = 3002;

// Startup error codes (4000-4999)
/// Command line and environment exceed the reserved guest memory region
pub const ARGS_TOO_LARGE: u16 = 4000;

// Runtime error codes (5000-5999)
/// A reflective host operation failed outside an error boundary
pub const GUEST_FAULT: u16 = 5000;
/// Guest invoked an import the bridge does not provide
pub const IMPORT_NOT_FOUND: u16 = 5001;
/// Host event loop cannot make progress
pub const EVENT_LOOP_STALLED: u16 = 5002;
/// Random source failed to produce bytes
pub const RANDOM_SOURCE_FAILED: u16 = 5003;

// I/O error codes (6000-6999)
/// Host write operation failed
pub const WRITE_FAILED: u16 = 6000;
/// File descriptor is not backed by the filesystem facade
pub const BAD_FILE_DESCRIPTOR: u16 = 6001;
