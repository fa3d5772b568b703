// Copyright (c) 2025 Ralf Anton Beier
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! Host environment facades.
//!
//! The bridge reaches the surrounding environment only through these narrow
//! traits: a synchronous write-like filesystem, a process facade for
//! arguments/environment/exit, wall and monotonic clocks, a random source
//! and a timer scheduler. The std implementations live here; tests and
//! embedders substitute their own.

use std::collections::BTreeMap;
use std::io::Write;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::prelude::*;

/// Synchronous filesystem facade.
///
/// Used exactly once per guest-initiated raw write. There are no real file
/// descriptor semantics behind it.
pub trait FileSystem {
    /// Write `bytes` to the descriptor, returning the number written.
    fn write_sync(&mut self, fd: i64, bytes: &[u8]) -> Result<usize>;
}

/// Process facade: arguments, environment and exit.
pub trait ProcessFacade {
    /// Command line arguments, program name first.
    fn argv(&self) -> Vec<String>;
    /// Environment variables.
    fn env(&self) -> BTreeMap<String, String>;
    /// Record an exit code for the embedding process to observe later.
    fn set_exit_code(&mut self, code: i32);
    /// Terminate immediately with the given code.
    fn exit(&mut self, code: i32);
}

/// Wall and monotonic clock sources.
pub trait Clock {
    /// Wall time as (seconds since the epoch, nanosecond remainder).
    fn wall_time(&self) -> (i64, i32);
    /// Monotonic time in nanoseconds from an arbitrary origin.
    fn monotonic_nanos(&self) -> i64;
}

/// Random byte source.
pub trait RandomSource {
    /// Fill `buf` with random bytes.
    fn fill(&mut self, buf: &mut [u8]) -> Result<()>;
}

/// Opaque identifier of a scheduled host timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub u64);

/// Host timer facility.
///
/// The bridge schedules "resume me after this delay" timers here and
/// cancels them when the guest clears a timeout.
pub trait TimerScheduler {
    /// Schedule a timer firing `timer_id` after `delay`.
    fn schedule(&mut self, delay: Duration, timer_id: i32) -> TimerHandle;
    /// Cancel a previously scheduled timer. Unknown handles are a no-op.
    fn cancel(&mut self, handle: TimerHandle);
}

/// Filesystem facade writing fd 1 to stdout and fd 2 to stderr.
#[derive(Debug, Default)]
pub struct StdFileSystem;

impl FileSystem for StdFileSystem {
    fn write_sync(&mut self, fd: i64, bytes: &[u8]) -> Result<usize> {
        let result = match fd {
            1 => std::io::stdout().write(bytes),
            2 => std::io::stderr().write(bytes),
            _ => {
                return Err(Error::new(
                    ErrorCategory::Io,
                    codes::BAD_FILE_DESCRIPTOR,
                    "Only stdout and stderr are backed by the std filesystem facade",
                ))
            }
        };
        result.map_err(|err| {
            log::error!("write_sync({fd}) failed: {err}");
            kinds::write_failed_error("Host write operation failed")
        })
    }
}

/// Process facade backed by explicit argv/env snapshots.
///
/// `exit` terminates the process; the deferred path records the code in
/// `exit_code` instead.
#[derive(Debug, Default)]
pub struct StdProcess {
    argv: Vec<String>,
    env: BTreeMap<String, String>,
    /// Exit code recorded by the deferred exit path.
    pub exit_code: Option<i32>,
}

impl StdProcess {
    /// Build from explicit arguments and environment.
    #[must_use]
    pub fn new(argv: Vec<String>, env: BTreeMap<String, String>) -> Self {
        Self { argv, env, exit_code: None }
    }

    /// Snapshot the real process arguments and environment.
    #[must_use]
    pub fn from_os() -> Self {
        Self::new(std::env::args().collect(), std::env::vars().collect())
    }
}

impl ProcessFacade for StdProcess {
    fn argv(&self) -> Vec<String> {
        self.argv.clone()
    }

    fn env(&self) -> BTreeMap<String, String> {
        self.env.clone()
    }

    fn set_exit_code(&mut self, code: i32) {
        self.exit_code = Some(code);
    }

    fn exit(&mut self, code: i32) {
        std::process::exit(code);
    }
}

/// Clock backed by `SystemTime` and `Instant`.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self { origin: Instant::now() }
    }
}

impl SystemClock {
    /// Create a clock with the monotonic origin fixed at construction.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn wall_time(&self) -> (i64, i32) {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => (d.as_secs() as i64, d.subsec_nanos() as i32),
            // Clock before the epoch: clamp rather than crash the guest.
            Err(_) => (0, 0),
        }
    }

    fn monotonic_nanos(&self) -> i64 {
        self.origin.elapsed().as_nanos() as i64
    }
}

/// Random source backed by the operating system.
#[derive(Debug, Default)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        getrandom::getrandom(buf).map_err(|err| {
            log::error!("getrandom failed: {err}");
            Error::new(
                ErrorCategory::Runtime,
                codes::RANDOM_SOURCE_FAILED,
                "Random source failed to produce bytes",
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn std_process_records_deferred_exit_code() {
        let mut p = StdProcess::new(vec!["prog".to_string()], BTreeMap::new());
        assert_eq!(p.exit_code, None);
        p.set_exit_code(3);
        assert_eq!(p.exit_code, Some(3));
    }

    #[test]
    fn std_filesystem_rejects_unknown_descriptors() {
        let mut fs = StdFileSystem;
        let err = fs.write_sync(7, b"x").unwrap_err();
        assert_eq!(err.code, codes::BAD_FILE_DESCRIPTOR);
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.monotonic_nanos();
        let b = clock.monotonic_nanos();
        assert!(b >= a);
        let (sec, nsec) = clock.wall_time();
        assert!(sec > 0);
        assert!((0..1_000_000_000).contains(&nsec));
    }

    #[test]
    fn os_random_fills_buffers() {
        let mut r = OsRandom;
        let mut buf = [0u8; 32];
        r.fill(&mut buf).unwrap();
        // 32 zero bytes from the OS RNG would be astronomically unlikely.
        assert!(buf.iter().any(|&b| b != 0));
    }
}
