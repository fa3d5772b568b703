// Copyright (c) 2025 Ralf Anton Beier
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! Built-in demo guest.
//!
//! A small native module exercising the bridge the way real guest bytecode
//! would: every host interaction writes a call frame into its linear memory
//! relative to the stack pointer and goes through `invoke_import`. It
//! prints through the bridge's write path, sleeps on the timer shim and
//! exits cleanly when the timer fires.

use std::cell::Cell;
use std::rc::Rc;

use wgb_bridge::bridge::Bridge;
use wgb_bridge::memory::{new_shared_memory, MemoryView, SharedMemory};
use wgb_bridge::module::GuestModule;
use wgb_error::Result;

const SP: u32 = 0x8000;
const SCRATCH: u64 = 0x6000;
const SLEEP_NANOS: i64 = 100_000_000;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Waiting,
    Done,
}

/// Demo guest module: print, sleep on a timer, exit 0.
pub struct DemoGuest {
    memory: SharedMemory,
    phase: Cell<Phase>,
    timeout_id: Cell<i32>,
}

impl DemoGuest {
    /// Create the demo guest with a fresh 64 KiB linear memory.
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            memory: new_shared_memory(1 << 16),
            phase: Cell::new(Phase::Done),
            timeout_id: Cell::new(0),
        })
    }

    fn view(&self) -> MemoryView {
        MemoryView::new(self.memory.clone())
    }

    /// Write `text` to stdout through the bridge's raw write import.
    fn print(&self, host: &mut Bridge, text: &str) -> Result<()> {
        let sp = u64::from(SP);
        let v = self.view();
        v.write_bytes(SCRATCH, text.as_bytes())?;
        v.set_i64(sp + 8, 1)?;
        v.set_i64(sp + 16, SCRATCH as i64)?;
        v.set_i32(sp + 24, text.len() as i32)?;
        host.invoke_import("runtime.write", SP)
    }
}

impl GuestModule for DemoGuest {
    fn memory(&self) -> SharedMemory {
        self.memory.clone()
    }

    fn run(&self, host: &mut Bridge, argc: i32, _argv_ptr: u32) -> Result<()> {
        let sp = u64::from(SP);
        let v = self.view();

        self.print(host, &format!("demo guest starting with {argc} argument(s)\n"))?;

        host.invoke_import("runtime.nanotime", SP)?;
        let now = v.get_i64(sp + 8)?;
        self.print(host, &format!("monotonic clock reads {now}ns\n"))?;

        // Sleep through the timer shim; resume() finishes the run.
        v.set_i64(sp + 8, SLEEP_NANOS)?;
        host.invoke_import("runtime.scheduleTimeout", SP)?;
        self.timeout_id.set(v.get_i32(sp + 16)?);
        self.phase.set(Phase::Waiting);
        Ok(())
    }

    fn stack_pointer(&self) -> u32 {
        SP
    }

    fn resume(&self, host: &mut Bridge) -> Result<()> {
        if self.phase.get() != Phase::Waiting {
            return Ok(());
        }
        self.phase.set(Phase::Done);

        let sp = u64::from(SP);
        let v = self.view();
        v.set_i32(sp + 8, self.timeout_id.get())?;
        host.invoke_import("runtime.clearTimeout", SP)?;

        self.print(host, "demo guest woke up, exiting\n")?;
        v.set_i32(sp + 8, 0)?;
        host.invoke_import("runtime.exit", SP)
    }
}
