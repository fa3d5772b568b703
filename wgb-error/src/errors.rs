// WGB - wgb-error
// Module: WGB Error Types
//
// Copyright (c) 2025 Ralf Anton Beier
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! Unified error types for WGB
//!
//! This module provides the error type shared by every crate in the bridge
//! workspace. Errors carry a category, a numeric code and a static message.

use core::fmt;

/// `Error` categories for WGB operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCategory {
    /// Guest memory errors
    Memory = 1,
    /// Value table and handle errors
    Resource = 2,
    /// Validation errors (malformed wire data, bad arguments)
    Validation = 3,
    /// Runtime errors (general)
    Runtime = 4,
    /// I/O errors
    Io = 5,
    /// Capacity errors (size ceilings)
    Capacity = 6,
    /// Initialization and startup errors
    Initialization = 7,
    /// Invalid lifecycle state errors
    InvalidState = 8,
}

/// WGB `Error` type
///
/// The main error type for the guest bridge. Protocol and usage errors are
/// reported through this type; guest-visible call failures travel as host
/// values through the Call Bridge error boundary instead.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Error {
    /// `Error` category
    pub category: ErrorCategory,
    /// `Error` code
    pub code: u16,
    /// `Error` message
    pub message: &'static str,
}

impl Error {
    /// Create a new error.
    #[must_use]
    pub const fn new(category: ErrorCategory, code: u16, message: &'static str) -> Self {
        Self { category, code, message }
    }

    /// Check if this is a lifecycle usage error
    #[must_use]
    pub fn is_lifecycle_error(&self) -> bool {
        self.category == ErrorCategory::InvalidState
    }

    /// Check if this is a memory error
    #[must_use]
    pub fn is_memory_error(&self) -> bool {
        self.category == ErrorCategory::Memory
    }

    /// Check if this is a capacity error
    #[must_use]
    pub fn is_capacity_error(&self) -> bool {
        self.category == ErrorCategory::Capacity
    }

    /// Check if this is a runtime error
    #[must_use]
    pub fn is_runtime_error(&self) -> bool {
        self.category == ErrorCategory::Runtime
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] Error {}: {}", self.category, self.code, self.message)
    }
}

impl core::error::Error for Error {}
