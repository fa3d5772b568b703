// WGB - wgb-error
// Module: WGB Error Handling
//
// Copyright (c) 2025 Ralf Anton Beier
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! WGB error handling library
//!
//! This library provides the error handling system for the WebAssembly Guest
//! Bridge. It includes error types, numeric error codes and helper functions
//! for creating and classifying errors.
//!
//! # Error Categories
//!
//! Errors are organized into categories, each with its own range of error
//! codes:
//!
//! - Lifecycle errors (1000-1999): starting a bridge twice, resuming a
//!   bridge that is not running
//! - Memory errors (2000-2999): out-of-bounds guest memory access
//! - Value table errors (3000-3999): invalid or stale handles
//! - Startup errors (4000-4999): argument/environment marshalling failures
//! - Runtime errors (5000-5999): guest-triggered faults, unknown imports
//! - I/O errors (6000-6999): host write failures
//!
//! # Usage
//!
//! ```
//! use wgb_error::{codes, Error, ErrorCategory};
//!
//! let error = Error::new(
//!     ErrorCategory::InvalidState,
//!     codes::BRIDGE_NOT_RUNNING,
//!     "Resume called on a bridge that is not running",
//! );
//! assert!(error.is_lifecycle_error());
//! ```

#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![allow(clippy::module_name_repetitions)]

#[cfg(feature = "std")]
extern crate std;

/// Error codes for WGB
pub mod codes;
/// Error and error handling types
pub mod errors;
/// Error kind helper constructors
pub mod kinds;

// Re-export key types
pub use errors::{Error, ErrorCategory};

/// A specialized `Result` type for WGB operations.
///
/// This type alias uses `wgb_error::Error` as the error type.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_carries_category_code_and_message() {
        let err = Error::new(
            ErrorCategory::Capacity,
            codes::ARGS_TOO_LARGE,
            "argument region exceeds limit",
        );
        assert_eq!(err.category, ErrorCategory::Capacity);
        assert_eq!(err.code, codes::ARGS_TOO_LARGE);
        assert_eq!(err.message, "argument region exceeds limit");
    }

    #[test]
    fn result_alias_propagates() {
        fn fails() -> Result<()> {
            Err(kinds::not_running_error("no"))
        }
        assert!(fails().is_err());
    }
}
