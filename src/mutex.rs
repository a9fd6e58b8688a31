// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A busy-waiting mutex that yields to the scheduler between attempts.

use std::hint::spin_loop;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_utils::CachePadded;

use crate::scheduler;
use crate::tls;

/// A spinning mutex.
///
/// `lock` busy-waits, yielding the core between attempts so another user
/// thread on the same core can release the lock. The lock is not
/// recursive and records no owner; it may be held across suspension
/// points, which is discouraged except where the condition-variable
/// protocol requires it.
#[derive(Debug)]
pub struct SpinLock {
    held: CachePadded<AtomicBool>,
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl SpinLock {
    pub const fn new() -> SpinLock {
        SpinLock {
            held: CachePadded::new(AtomicBool::new(false)),
        }
    }

    /// Makes a single acquisition attempt.
    pub fn try_lock(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Acquires the lock, spinning until it is free.
    ///
    /// On a user thread the core is relinquished between attempts so
    /// that the holder (which may be scheduled on the same core) can
    /// make progress; elsewhere the OS scheduler is yielded to instead.
    pub fn lock(&self) {
        while !self.try_lock() {
            if tls::is_user_thread() {
                scheduler::relinquish();
            } else {
                thread::yield_now();
            }
            spin_loop();
        }
    }

    /// Releases the lock.
    ///
    /// Releasing a lock that is not held is a usage error.
    pub fn unlock(&self) {
        let was_held = self.held.swap(false, Ordering::Release);
        debug_assert!(was_held, "Released a SpinLock that was not held?");
    }
}
