// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Kernel-thread local state.
//!
//! Each kernel thread installs a pointer to its `SchedulerControlBlock`
//! before entering the scheduler loop. User threads run on the same
//! kernel thread, so the block is reachable from inside them through
//! ordinary thread-local storage (the stack switch does not touch the
//! TLS register).

use std::cell::Cell;
use std::ptr;

use crate::scheduler::Runtime;
use crate::threads::{ThreadContext, ThreadId};
use crate::CoreId;

/// Per kernel-thread scheduler state.
///
/// Lives on the kernel thread's own stack for the duration of the
/// scheduler loop; only that thread (and the user threads it runs) ever
/// touch it.
pub(crate) struct SchedulerControlBlock {
    /// Core this scheduler is bound to.
    pub(crate) core_id: CoreId,
    /// The runtime this scheduler belongs to.
    pub(crate) runtime: *const Runtime,
    /// Slot currently executing on this core, null while the scheduler
    /// loop itself runs.
    pub(crate) running: Cell<*mut ThreadContext>,
    /// Saved stack pointer of the scheduler loop, so user threads can
    /// switch back into it.
    pub(crate) scheduler_sp: Cell<*mut u8>,
}

impl SchedulerControlBlock {
    pub(crate) fn new(core_id: CoreId, runtime: &Runtime) -> SchedulerControlBlock {
        SchedulerControlBlock {
            core_id,
            runtime,
            running: Cell::new(ptr::null_mut()),
            scheduler_sp: Cell::new(ptr::null_mut()),
        }
    }
}

thread_local! {
    static SCB: Cell<*const SchedulerControlBlock> = const { Cell::new(ptr::null()) };
}

/// Installs (or clears, with null) the scheduler control block of the
/// calling kernel thread.
///
/// # Safety
/// `scb` must stay valid until it is cleared again.
pub(crate) unsafe fn set_scb(scb: *const SchedulerControlBlock) {
    SCB.with(|cell| cell.set(scb));
}

pub(crate) fn try_scb<'a>() -> Option<&'a SchedulerControlBlock> {
    let scb = SCB.with(|cell| cell.get());
    if scb.is_null() {
        None
    } else {
        Some(unsafe { &*scb })
    }
}

pub(crate) fn scb<'a>() -> &'a SchedulerControlBlock {
    try_scb().expect("No scheduler on this kernel thread?")
}

/// The control block plus the currently running slot; panics when called
/// from the scheduler loop or from a thread outside the runtime.
pub(crate) fn current_thread<'a>() -> (&'a SchedulerControlBlock, &'a ThreadContext) {
    let scb = scb();
    let running = scb.running.get();
    assert!(!running.is_null(), "No user thread running here?");
    (scb, unsafe { &*running })
}

/// True iff the caller is a user thread of some runtime.
pub(crate) fn is_user_thread() -> bool {
    try_scb().is_some_and(|scb| !scb.running.get().is_null())
}

/// Accessors for the identity of the calling user thread.
pub struct Environment {}

impl Environment {
    /// The [`ThreadId`] of the calling user thread.
    ///
    /// # Panics
    /// When called from outside a user thread.
    pub fn tid() -> ThreadId {
        let (_, ctx) = current_thread();
        ThreadId::new(ctx.into(), ctx.generation.load(std::sync::atomic::Ordering::Acquire))
    }

    /// The core the calling user thread is bound to.
    ///
    /// # Panics
    /// When called from outside the runtime's kernel threads.
    pub fn core_id() -> CoreId {
        scb().core_id
    }
}
