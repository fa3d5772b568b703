// Copyright (c) 2025 Ralf Anton Beier
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! Prelude module for wgb-bridge
//!
//! Re-exports the types and traits used across the crate so individual
//! modules can share one import line.

pub use core::cell::{Cell, RefCell};
pub use core::fmt;
pub use core::time::Duration;
pub use std::collections::{BTreeMap, HashMap};
pub use std::rc::Rc;

pub use wgb_error::{codes, kinds, Error, ErrorCategory, Result};

pub use crate::value::{HostFunc, HostObject, HostValue, ReflectResult};
