use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::server::pipes::GracefulTrigger;

/// Which control pipes the next readiness wait includes. The listeners are
/// always included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selectable {
    pub owner_pipe: bool,
    pub graceful_pipe: bool,
}

impl Selectable {
    const ALL: Selectable = Selectable {
        owner_pipe: true,
        graceful_pipe: true,
    };
}

#[derive(Debug)]
pub(crate) struct LoopState {
    pub(crate) generation: u64,
    pub(crate) running: bool,
    pub(crate) select_timeout: Option<Duration>,
    pub(crate) selectable: Selectable,
    pub(crate) soft_terminating: bool,
    pub(crate) trigger: Option<GracefulTrigger>,
}

/// Snapshot of the loop counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub iterations: u64,
    pub processed_requests: u64,
    pub ignored_requests: u64,
}

/// Loop state shared with controlling threads.
///
/// Every mutation happens under the lock and is followed by a broadcast.
/// `generation` moves on every start and every stop.
pub(crate) struct Shared {
    state: Mutex<LoopState>,
    changed: Condvar,
    iterations: AtomicU64,
    processed: AtomicU64,
    ignored: AtomicU64,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(LoopState {
                generation: 0,
                running: false,
                select_timeout: None,
                selectable: Selectable::ALL,
                soft_terminating: false,
                trigger: None,
            }),
            changed: Condvar::new(),
            iterations: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            ignored: AtomicU64::new(0),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub(crate) fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Marks the loop armed. The returned guard marks it stopped on drop.
    pub(crate) fn begin(&self, trigger: GracefulTrigger) -> RunningGuard<'_> {
        let mut state = self.lock();
        state.generation += 1;
        state.running = true;
        state.select_timeout = None;
        state.selectable = Selectable::ALL;
        state.soft_terminating = false;
        state.trigger = Some(trigger);
        drop(state);
        self.changed.notify_all();
        RunningGuard { shared: self }
    }

    /// Wakes start-up waiters when arming failed before `begin`.
    pub(crate) fn abandon_start(&self) {
        self.lock().generation += 1;
        self.changed.notify_all();
    }

    fn finish(&self) {
        let mut state = self.lock();
        state.generation += 1;
        state.running = false;
        state.select_timeout = None;
        state.selectable = Selectable::ALL;
        state.trigger = None;
        drop(state);
        self.changed.notify_all();
    }

    /// Current timeout and selectable set for the next readiness wait.
    pub(crate) fn wait_params(&self) -> (Option<Duration>, Selectable) {
        let state = self.lock();
        (state.select_timeout, state.selectable)
    }

    pub(crate) fn select_timeout(&self) -> Option<Duration> {
        self.lock().select_timeout
    }

    /// Leaves only the linger timeout able to end the wait.
    pub(crate) fn stop_watching_pipes(&self) {
        let mut state = self.lock();
        state.selectable = Selectable {
            owner_pipe: false,
            graceful_pipe: false,
        };
        drop(state);
        self.changed.notify_all();
    }

    /// Blocks until `generation` differs from `seen`, returning the new value.
    pub(crate) fn wait_for_change(&self, seen: u64) -> u64 {
        let state = self
            .changed
            .wait_while(self.lock(), |state| state.generation == seen)
            .unwrap_or_else(PoisonError::into_inner);
        state.generation
    }

    pub(crate) fn wait_until_stopped(&self) {
        let _state = self
            .changed
            .wait_while(self.lock(), |state| state.running)
            .unwrap_or_else(PoisonError::into_inner);
    }

    pub(crate) fn count_iteration(&self) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_ignored(&self) {
        self.ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn counters(&self) -> Counters {
        Counters {
            iterations: self.iterations.load(Ordering::Relaxed),
            processed_requests: self.processed.load(Ordering::Relaxed),
            ignored_requests: self.ignored.load(Ordering::Relaxed),
        }
    }
}

pub(crate) struct RunningGuard<'a> {
    shared: &'a Shared,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.shared.finish();
    }
}
