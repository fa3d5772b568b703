// WGB - wgb-error
// Module: WGB Error Kinds
//
// Copyright (c) 2025 Ralf Anton Beier
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! Helper constructors for common bridge errors.

use crate::{codes, Error, ErrorCategory};

/// Bridge was started a second time.
#[must_use]
pub const fn already_started_error(message: &'static str) -> Error {
    Error::new(ErrorCategory::InvalidState, codes::BRIDGE_ALREADY_STARTED, message)
}

/// Operation requires the bridge to be running.
#[must_use]
pub const fn not_running_error(message: &'static str) -> Error {
    Error::new(ErrorCategory::InvalidState, codes::BRIDGE_NOT_RUNNING, message)
}

/// Guest memory access was out of bounds.
#[must_use]
pub const fn memory_out_of_bounds_error(message: &'static str) -> Error {
    Error::new(ErrorCategory::Memory, codes::MEMORY_OUT_OF_BOUNDS, message)
}

/// Handle does not name a live host value.
#[must_use]
pub const fn invalid_handle_error(message: &'static str) -> Error {
    Error::new(ErrorCategory::Resource, codes::INVALID_HANDLE, message)
}

/// Command line and environment exceed the reserved guest memory region.
#[must_use]
pub const fn args_too_large_error(message: &'static str) -> Error {
    Error::new(ErrorCategory::Capacity, codes::ARGS_TOO_LARGE, message)
}

/// Reflective host operation failed outside an error boundary.
#[must_use]
pub const fn guest_fault_error(message: &'static str) -> Error {
    Error::new(ErrorCategory::Runtime, codes::GUEST_FAULT, message)
}

/// Guest invoked an import the bridge does not provide.
#[must_use]
pub const fn import_not_found_error(message: &'static str) -> Error {
    Error::new(ErrorCategory::Runtime, codes::IMPORT_NOT_FOUND, message)
}

/// Host write operation failed.
#[must_use]
pub const fn write_failed_error(message: &'static str) -> Error {
    Error::new(ErrorCategory::Io, codes::WRITE_FAILED, message)
}
