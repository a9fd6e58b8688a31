// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Cycle-counter time utilities.
//!
//! Wake-up deadlines are kept in raw TSC units so they fit in a single
//! atomic word. The TSC rate is estimated once against the OS monotonic
//! clock; conversions in both directions use the same estimate, so
//! elapsed-time comparisons are self-consistent even if the estimate is
//! slightly off.

use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use log::info;

const ONE_GHZ_IN_HZ: u64 = 1_000_000_000;

lazy_static! {
    /// Estimated TSC frequency in Hz.
    static ref CYCLES_PER_SEC: u64 = {
        let wall = Instant::now();
        let start = unsafe { x86::time::rdtsc() };
        // Busy-wait so the calibration interval is not distorted by a
        // late wake-up from the OS.
        while wall.elapsed() < Duration::from_millis(10) {
            core::hint::spin_loop();
        }
        let cycles = unsafe { x86::time::rdtsc() } - start;
        let cycles_per_sec =
            (cycles as u128 * ONE_GHZ_IN_HZ as u128 / wall.elapsed().as_nanos()) as u64;
        info!("Estimated TSC rate is {} cycles per second.", cycles_per_sec);
        cycles_per_sec
    };
}

/// Reads the time stamp counter.
#[inline(always)]
pub fn rdtsc() -> u64 {
    unsafe { x86::time::rdtsc() }
}

/// Returns the estimated TSC frequency in Hz, measuring it on first use.
pub fn per_second() -> u64 {
    *CYCLES_PER_SEC
}

/// Converts nanoseconds to cycles, rounding up so a deadline computed
/// from a duration never undershoots it.
#[inline]
pub fn from_nanos(ns: u64) -> u64 {
    (ns as u128 * per_second() as u128).div_ceil(ONE_GHZ_IN_HZ as u128) as u64
}

/// Converts a cycle count to nanoseconds (rounding down).
#[inline]
pub fn to_nanos(cycles: u64) -> u64 {
    (cycles as u128 * ONE_GHZ_IN_HZ as u128 / per_second() as u128) as u64
}

/// Converts a [`Duration`] to cycles.
#[inline]
pub fn from_duration(d: Duration) -> u64 {
    from_nanos(d.as_nanos() as u64)
}
