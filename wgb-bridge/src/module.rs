// Copyright (c) 2025 Ralf Anton Beier
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! Guest module contract.
//!
//! The guest is opaque to the bridge: a sandboxed program with a flat linear
//! memory and no native system access. It must export the four capabilities
//! below. Execution is strictly cooperative: the guest only runs inside
//! `run` and `resume`, both of which return at the guest's next yield point,
//! and every host capability the guest touches goes through
//! [`Bridge::invoke_import`](crate::bridge::Bridge::invoke_import) with a
//! stack-pointer argument selecting the call frame layout.
//!
//! Contract details the bridge relies on:
//!
//! - `stack_pointer` is only guaranteed stable while no guest code is
//!   executing; the bridge re-fetches it after any re-entrant call.
//! - A guest resumed by a timer must deregister the timer id (the
//!   `runtime.clearTimeout` import) before yielding again, otherwise the
//!   missed-resume retry loop keeps resuming it.

use crate::bridge::Bridge;
use crate::memory::SharedMemory;
use crate::prelude::*;

/// The capabilities a guest bytecode module must export.
pub trait GuestModule {
    /// The guest's linear memory buffer.
    ///
    /// Returned as a shared handle; growth reallocates in place. After a
    /// growth the guest is expected to call the `runtime.resetMemoryView`
    /// import so the bridge rebuilds its cached view.
    fn memory(&self) -> SharedMemory;

    /// Entry point. Runs guest code until its first yield or exit.
    fn run(&self, host: &mut Bridge, argc: i32, argv_ptr: u32) -> Result<()>;

    /// Current stack pointer. Valid only while the guest is suspended.
    fn stack_pointer(&self) -> u32;

    /// Continue guest execution from its last suspension point until the
    /// next yield.
    fn resume(&self, host: &mut Bridge) -> Result<()>;
}
