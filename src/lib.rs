// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! spindle: cooperative user-level M:N threading with microsecond-scale
//! scheduling.
//!
//! A [`Runtime`] multiplexes many lightweight user threads onto a fixed
//! set of kernel threads, one pinned per core. Each user thread owns a
//! fixed-size stack and is scheduled cooperatively: it keeps its core
//! until it suspends through [`relinquish`], [`sleep`], [`block`],
//! [`join`], a contended [`SpinLock::lock`](mutex::SpinLock::lock), a
//! [`CondVar::wait`](condvar::CondVar::wait), or by returning. There is
//! no preemption — a compute-bound thread that never yields monopolizes
//! its core; that is the price of dispatch latencies in the tens of
//! nanoseconds.
//!
//! Threads are bound to the core they were created on. Each core keeps
//! its threads in a fixed table of 56 slots whose occupancy lives in a
//! single packed atomic word, so creating a thread from any core, exits,
//! and load inspection are all lock-free.
//!
//! ```
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use std::sync::Arc;
//!
//! use spindle::{Options, Runtime};
//!
//! let runtime = Runtime::new(Options { num_cores: 1, ..Default::default() });
//!
//! let done = Arc::new(AtomicBool::new(false));
//! let d = done.clone();
//! runtime
//!     .spawn(0, move || d.store(true, Ordering::SeqCst))
//!     .expect("no free thread slot");
//!
//! while !done.load(Ordering::SeqCst) {
//!     std::hint::spin_loop();
//! }
//! runtime.shutdown();
//! ```

#[cfg(not(target_arch = "x86_64"))]
compile_error!("spindle implements its context switch for x86_64 only");

pub mod condvar;
pub mod context;
pub mod cycles;
pub mod mutex;
pub mod options;

mod scheduler;
mod stack;
mod threads;
mod tls;

/// Index of a core; kernel threads, slot tables and thread affinity are
/// all per-core.
pub type CoreId = usize;

pub use crate::condvar::CondVar;
pub use crate::context::SPACE_FOR_SAVED_REGISTERS;
pub use crate::mutex::SpinLock;
pub use crate::options::{Options, ParseError};
pub use crate::scheduler::{
    block, join, make_runnable, relinquish, sleep, OccupiedAndCount, Runtime,
    MAX_THREADS_PER_CORE,
};
pub use crate::stack::DEFAULT_STACK_SIZE_BYTES;
pub use crate::threads::{ThreadId, MAX_INVOCATION_BYTES};
pub use crate::tls::Environment;
