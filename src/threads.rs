// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Thread contexts (slots), thread identifiers, and the type-erased
//! storage for a thread's function and arguments.

use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::mem::{self, MaybeUninit};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64};

use crate::condvar::CondVar;
use crate::context;
use crate::mutex::SpinLock;
use crate::stack::ThreadStack;

/// Wake-up sentinel: the slot is blocked until someone stores a smaller
/// value. `0` means runnable immediately; anything else is a TSC
/// deadline.
pub(crate) const WAKEUP_NEVER: u64 = u64::MAX;

/// Maximum size of a thread closure (function plus captured arguments).
pub const MAX_INVOCATION_BYTES: usize = 48;
const INVOCATION_ALIGN: usize = 8;

/// Inline, type-erased storage for one thread invocation.
///
/// The closure is written in place by the creator before the slot is
/// published and read out exactly once by the trampoline; no heap
/// allocation happens on the thread-creation path.
pub(crate) struct ThreadInvocation {
    payload: MaybeUninit<[u64; MAX_INVOCATION_BYTES / 8]>,
    invoke: Option<unsafe fn(*mut u8)>,
    drop: Option<unsafe fn(*mut u8)>,
}

impl ThreadInvocation {
    pub(crate) const fn empty() -> ThreadInvocation {
        ThreadInvocation {
            payload: MaybeUninit::uninit(),
            invoke: None,
            drop: None,
        }
    }

    /// Moves `f` into the inline payload.
    ///
    /// Closures larger than [`MAX_INVOCATION_BYTES`] or with alignment
    /// above 8 are rejected at compile time.
    pub(crate) fn set<F>(&mut self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        const {
            assert!(
                mem::size_of::<F>() <= MAX_INVOCATION_BYTES,
                "thread closure exceeds the inline invocation payload"
            );
            assert!(mem::align_of::<F>() <= INVOCATION_ALIGN);
        }
        debug_assert!(self.invoke.is_none(), "Slot already has an invocation?");

        unsafe { self.payload.as_mut_ptr().cast::<F>().write(f) };
        self.invoke = Some(invoke_erased::<F>);
        self.drop = Some(drop_erased::<F>);
    }

    /// Runs the stored closure, consuming it.
    pub(crate) fn invoke(&mut self) {
        let invoke = self
            .invoke
            .take()
            .expect("Dispatched a slot with no invocation?");
        self.drop = None;
        unsafe { invoke(self.payload.as_mut_ptr().cast()) };
    }
}

impl Drop for ThreadInvocation {
    fn drop(&mut self) {
        // Runs only for invocations that were stored but never
        // dispatched (e.g. teardown with threads still pending).
        if let Some(drop) = self.drop.take() {
            unsafe { drop(self.payload.as_mut_ptr().cast()) };
        }
    }
}

unsafe fn invoke_erased<F: FnOnce()>(payload: *mut u8) {
    (payload.cast::<F>().read())()
}

unsafe fn drop_erased<F>(payload: *mut u8) {
    payload.cast::<F>().drop_in_place()
}

/// One reusable thread slot.
///
/// The slot's memory is address-stable for the runtime's lifetime.
/// Except for the atomic fields (and the invocation, which the creator
/// writes before publication), a slot is only ever touched by the kernel
/// thread of the core it belongs to.
pub(crate) struct ThreadContext {
    /// Saved stack pointer. Meaningful only while the slot is not
    /// executing; read and written only on the owning kernel thread.
    pub(crate) sp: Cell<*mut u8>,
    /// The slot's execution stack, primed once at startup.
    pub(crate) stack: ThreadStack,
    /// Wake-up deadline in TSC units (see [`WAKEUP_NEVER`]). Any thread
    /// may store to this; the owning scheduler loads it.
    pub(crate) wakeup_time_in_cycles: AtomicU64,
    /// Bumped on creation and on exit; distinguishes reuses of the slot.
    pub(crate) generation: AtomicU32,
    /// The pending or running closure.
    pub(crate) invocation: UnsafeCell<ThreadInvocation>,
    /// Guards `generation` transitions against joiners.
    pub(crate) join_lock: SpinLock,
    /// Joiners wait here until the occupant terminates.
    pub(crate) join_cv: CondVar,
    /// Index of this slot within its core's active list.
    pub(crate) index: usize,
}

// A slot is shared across kernel threads, but the non-atomic fields are
// only accessed under the publication protocol described above.
unsafe impl Send for ThreadContext {}
unsafe impl Sync for ThreadContext {}

impl ThreadContext {
    pub(crate) fn new(
        index: usize,
        stack_size: usize,
        entry: unsafe extern "C" fn(),
    ) -> ThreadContext {
        let stack = ThreadStack::from_size(stack_size);
        let sp = unsafe { context::init_stack(stack.base(), entry) };
        ThreadContext {
            sp: Cell::new(sp),
            stack,
            wakeup_time_in_cycles: AtomicU64::new(WAKEUP_NEVER),
            generation: AtomicU32::new(0),
            invocation: UnsafeCell::new(ThreadInvocation::empty()),
            join_lock: SpinLock::new(),
            join_cv: CondVar::new(),
            index,
        }
    }
}

impl fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "ThreadContext#{} ({} KiB stack)",
            self.index,
            self.stack.size() / 1024
        )
    }
}

/// A stable handle for one execution of a thread slot.
///
/// The handle stays unique across slot reuse: it pairs the slot address
/// with the generation the slot had when the thread was created, and
/// every termination advances the generation. Operations on a stale
/// handle treat the thread as already terminated — except
/// [`make_runnable`](crate::make_runnable), which deliberately does not
/// check the generation.
///
/// A `ThreadId` borrows no data, but it points into the runtime that
/// created it and must not be used after that runtime is gone.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ThreadId {
    context: NonNull<ThreadContext>,
    generation: u32,
}

unsafe impl Send for ThreadId {}
unsafe impl Sync for ThreadId {}

impl ThreadId {
    pub(crate) fn new(context: NonNull<ThreadContext>, generation: u32) -> ThreadId {
        ThreadId {
            context,
            generation,
        }
    }

    pub(crate) fn context(&self) -> &ThreadContext {
        unsafe { self.context.as_ref() }
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "ThreadId {{ slot={:p} gen={} }}",
            self.context.as_ptr(),
            self.generation
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn invocation_runs_closure_with_captures() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let mut invocation = ThreadInvocation::empty();
        invocation.set(move || {
            c.fetch_add(41, Ordering::SeqCst);
        });
        invocation.invoke();
        assert_eq!(counter.load(Ordering::SeqCst), 41);
        // The closure (and its Arc) was consumed by the call.
        assert_eq!(Arc::strong_count(&counter), 1);
    }

    #[test]
    fn pending_invocation_is_dropped() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        {
            let mut invocation = ThreadInvocation::empty();
            invocation.set(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        // Never invoked: the closure must not run, but its captures must
        // still be released.
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(Arc::strong_count(&counter), 1);
    }
}
