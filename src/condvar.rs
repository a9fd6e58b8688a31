// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A condition variable for user threads.
//!
//! The wait queue is not separately synchronized: callers of `wait`,
//! `signal` and `broadcast` must hold the same [`SpinLock`] around the
//! call, which is what makes the enqueue-release-block sequence in
//! `wait` immune to missed notifications.

use std::cell::UnsafeCell;
use std::collections::VecDeque;

use log::trace;

use crate::mutex::SpinLock;
use crate::scheduler::{self, MAX_THREADS_PER_CORE};
use crate::threads::ThreadId;
use crate::tls::Environment;

#[derive(Debug)]
pub struct CondVar {
    waiters: UnsafeCell<VecDeque<ThreadId>>,
}

// The queue is guarded by the mutex the caller holds around every
// access (see module docs).
unsafe impl Send for CondVar {}
unsafe impl Sync for CondVar {}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}

impl CondVar {
    pub fn new() -> CondVar {
        CondVar {
            waiters: UnsafeCell::new(VecDeque::with_capacity(MAX_THREADS_PER_CORE)),
        }
    }

    /// Releases `mutex`, suspends the calling user thread until it is
    /// notified, and re-acquires `mutex` before returning.
    ///
    /// Must be called with `mutex` held. Wakeups may be spurious, so
    /// callers loop on their predicate.
    pub fn wait(&self, mutex: &SpinLock) {
        let tid = Environment::tid();
        unsafe { (*self.waiters.get()).push_back(tid) };
        trace!("{} waiting", tid);

        mutex.unlock();
        scheduler::suspend_current_thread();
        mutex.lock();

        // A wakeup that was not ours (a stale make_runnable) leaves our
        // entry queued; drop it so notifications are not misdirected.
        unsafe { (*self.waiters.get()).retain(|waiter| *waiter != tid) };
    }

    /// Wakes the longest-waiting thread, if any.
    ///
    /// Must be called with the associated mutex held.
    pub fn signal(&self) {
        let waking = unsafe { (*self.waiters.get()).pop_front() };
        if let Some(tid) = waking {
            trace!("{} notified", tid);
            scheduler::make_runnable(tid);
        }
    }

    /// Wakes every waiting thread.
    ///
    /// Must be called with the associated mutex held.
    pub fn broadcast(&self) {
        while let Some(tid) = unsafe { (*self.waiters.get()).pop_front() } {
            scheduler::make_runnable(tid);
        }
    }

    /// True iff some thread is queued on this condition variable.
    ///
    /// Must be called with the associated mutex held.
    pub fn has_waiters(&self) -> bool {
        unsafe { !(*self.waiters.get()).is_empty() }
    }
}

impl Drop for CondVar {
    fn drop(&mut self) {
        assert!(
            !self.has_waiters(),
            "Can't have outstanding waiters on CV"
        );
    }
}
