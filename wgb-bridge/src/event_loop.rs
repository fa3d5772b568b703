// Copyright (c) 2025 Ralf Anton Beier
// Licensed under the MIT license.
// SPDX-License-Identifier: MIT

//! Single-threaded timer event loop.
//!
//! The reference scheduler for hosts without their own reactor: a binary
//! heap of deadlines drained on the calling thread. [`EventLoop::run`]
//! drives a started bridge until the guest exits, sleeping between
//! deadlines and delivering fires through
//! [`Bridge::timeout_fired`](crate::bridge::Bridge::timeout_fired).
//!
//! Cancellation is lazy: cancelled entries stay in the heap and are
//! discarded when they surface, so cancel is O(1) and the heap never needs
//! rebuilding.

use std::collections::{BinaryHeap, HashSet};
use std::cmp::Reverse;
use std::time::Instant;

use crate::bridge::Bridge;
use crate::host::{TimerHandle, TimerScheduler};
use crate::prelude::*;

const STALLED: Error = Error::new(
    ErrorCategory::Runtime,
    codes::EVENT_LOOP_STALLED,
    "Guest yielded with no scheduled timeout and no way to make progress",
);

/// What the queue wants the loop to do next.
enum Poll {
    /// A timer is due: deliver this id.
    Fire(i32),
    /// Nothing due yet: sleep until the earliest deadline.
    Sleep(Duration),
    /// No live entries at all.
    Idle,
}

#[derive(Default)]
struct TimerQueue {
    // (deadline, handle, timer id); Reverse turns the max-heap into a
    // min-heap on the deadline.
    heap: BinaryHeap<Reverse<(Instant, u64, i32)>>,
    // Handles with an entry still in the heap. Tombstones are only kept
    // for live entries, so a cancel arriving after the fire (the normal
    // clearTimeout path) leaves no state behind.
    live: HashSet<u64>,
    cancelled: HashSet<u64>,
    next_handle: u64,
}

impl TimerQueue {
    fn schedule(&mut self, delay: Duration, timer_id: i32) -> TimerHandle {
        self.next_handle += 1;
        let handle = self.next_handle;
        self.live.insert(handle);
        self.heap.push(Reverse((Instant::now() + delay, handle, timer_id)));
        TimerHandle(handle)
    }

    fn cancel(&mut self, handle: TimerHandle) {
        if self.live.remove(&handle.0) {
            self.cancelled.insert(handle.0);
        }
    }

    fn poll(&mut self, now: Instant) -> Poll {
        while let Some(Reverse((deadline, handle, timer_id))) = self.heap.peek().copied() {
            if self.cancelled.remove(&handle) {
                self.heap.pop();
                continue;
            }
            if deadline > now {
                return Poll::Sleep(deadline - now);
            }
            self.heap.pop();
            self.live.remove(&handle);
            return Poll::Fire(timer_id);
        }
        Poll::Idle
    }
}

/// [`TimerScheduler`] backed by the loop's shared queue.
#[derive(Clone)]
pub struct LoopScheduler {
    queue: Rc<RefCell<TimerQueue>>,
}

impl TimerScheduler for LoopScheduler {
    fn schedule(&mut self, delay: Duration, timer_id: i32) -> TimerHandle {
        self.queue.borrow_mut().schedule(delay, timer_id)
    }

    fn cancel(&mut self, handle: TimerHandle) {
        self.queue.borrow_mut().cancel(handle);
    }
}

/// Blocking event loop driving one bridge to guest exit.
pub struct EventLoop {
    queue: Rc<RefCell<TimerQueue>>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    /// Create an empty loop.
    #[must_use]
    pub fn new() -> Self {
        Self { queue: Rc::new(RefCell::new(TimerQueue::default())) }
    }

    /// Scheduler handle to construct the bridge with.
    #[must_use]
    pub fn scheduler(&self) -> LoopScheduler {
        LoopScheduler { queue: self.queue.clone() }
    }

    /// Drive a started bridge until the guest exits, returning its exit
    /// code.
    ///
    /// Errors if the guest is suspended with nothing scheduled: with no
    /// pending timer and no external event source the guest can never run
    /// again, which is a deadlock, not a quiet exit.
    pub fn run(&self, bridge: &mut Bridge) -> Result<i32> {
        loop {
            if bridge.is_exited() {
                return Ok(bridge.exit_code().unwrap_or(0));
            }
            let action = self.queue.borrow_mut().poll(Instant::now());
            match action {
                Poll::Fire(id) => bridge.timeout_fired(id)?,
                Poll::Sleep(wait) => std::thread::sleep(wait),
                Poll::Idle => {
                    log::error!("event loop stalled: guest suspended with no pending timers");
                    return Err(STALLED);
                }
            }
        }
    }
}

#[derive(Default)]
struct ManualState {
    scheduled: Vec<(Duration, i32, TimerHandle)>,
    cancelled: Vec<TimerHandle>,
    next_handle: u64,
}

/// Recording scheduler for tests: nothing ever fires on its own.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    state: Rc<RefCell<ManualState>>,
}

impl ManualScheduler {
    /// Create an empty recording scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All schedule calls observed so far.
    #[must_use]
    pub fn scheduled(&self) -> Vec<(Duration, i32, TimerHandle)> {
        self.state.borrow().scheduled.clone()
    }

    /// All cancel calls observed so far.
    #[must_use]
    pub fn cancelled(&self) -> Vec<TimerHandle> {
        self.state.borrow().cancelled.clone()
    }
}

impl TimerScheduler for ManualScheduler {
    fn schedule(&mut self, delay: Duration, timer_id: i32) -> TimerHandle {
        let mut state = self.state.borrow_mut();
        state.next_handle += 1;
        let handle = TimerHandle(state.next_handle);
        state.scheduled.push((delay, timer_id, handle));
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        self.state.borrow_mut().cancelled.push(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_fires_in_deadline_order() {
        let mut q = TimerQueue::default();
        let now = Instant::now();
        q.schedule(Duration::from_millis(20), 2);
        q.schedule(Duration::from_millis(10), 1);

        let later = now + Duration::from_millis(50);
        assert!(matches!(q.poll(later), Poll::Fire(1)));
        assert!(matches!(q.poll(later), Poll::Fire(2)));
        assert!(matches!(q.poll(later), Poll::Idle));
    }

    #[test]
    fn queue_reports_sleep_until_earliest_deadline() {
        let mut q = TimerQueue::default();
        q.schedule(Duration::from_secs(60), 1);
        match q.poll(Instant::now()) {
            Poll::Sleep(wait) => assert!(wait <= Duration::from_secs(60)),
            _ => panic!("expected a sleep"),
        }
    }

    #[test]
    fn cancelled_entries_are_discarded() {
        let mut q = TimerQueue::default();
        let h = q.schedule(Duration::from_millis(1), 1);
        q.schedule(Duration::from_millis(2), 2);
        q.cancel(h);

        let later = Instant::now() + Duration::from_millis(10);
        assert!(matches!(q.poll(later), Poll::Fire(2)));
        assert!(matches!(q.poll(later), Poll::Idle));
    }

    #[test]
    fn cancel_after_fire_leaves_no_tombstone() {
        let mut q = TimerQueue::default();
        let later = Instant::now() + Duration::from_millis(10);

        // Normal completion path: fire first, then the guest deregisters
        // the id and the bridge cancels the already-fired handle.
        let h = q.schedule(Duration::from_millis(1), 1);
        assert!(matches!(q.poll(later), Poll::Fire(1)));
        q.cancel(h);
        assert!(q.cancelled.is_empty());
        assert!(q.live.is_empty());

        // A real cancellation keeps its tombstone only until the entry
        // surfaces.
        let h2 = q.schedule(Duration::from_millis(1), 2);
        q.cancel(h2);
        assert_eq!(q.cancelled.len(), 1);
        assert!(matches!(q.poll(later), Poll::Idle));
        assert!(q.cancelled.is_empty());
        assert!(q.live.is_empty());
    }

    #[test]
    fn manual_scheduler_records_calls() {
        let mut s = ManualScheduler::new();
        let h = s.schedule(Duration::from_nanos(5), 3);
        s.cancel(h);
        assert_eq!(s.scheduled().len(), 1);
        assert_eq!(s.scheduled()[0].1, 3);
        assert_eq!(s.cancelled(), vec![h]);
    }
}
