// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The core logic of the runtime.
//!
//! Has the following properties:
//! * Cooperative scheduling (threads yield voluntarily, no preemption)
//! * Round robin scheduling (per-core)
//! * One kernel thread pinned per core; threads stay on the core they
//!   were created on (no migration, no work stealing)
//! * Per-core slot table with a single packed atomic occupancy word,
//!   so creation, exit and load inspection are lock-free

use std::hint::spin_loop;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_utils::CachePadded;
use log::{debug, trace, warn};

use crate::context;
use crate::cycles;
use crate::threads::{ThreadContext, ThreadId, WAKEUP_NEVER};
use crate::tls::{self, SchedulerControlBlock};
use crate::CoreId;

/// Number of thread slots per core.
///
/// Bounded by the packed occupancy word: 56 slot bits plus an 8-bit
/// population count must fit in 64 bits.
pub const MAX_THREADS_PER_CORE: usize = 56;

const OCCUPIED_MASK: u64 = (1 << MAX_THREADS_PER_CORE) - 1;

/// Unpacked view of a core's occupancy word.
///
/// The word packs the slot bitmask together with its population count so
/// that load can be read in O(1) and creation/exit can maintain both
/// fields with a single compare-and-swap. `num_occupied` equals
/// `occupied.count_ones()` in every observable state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OccupiedAndCount {
    /// Bitmask of in-use slots (bit i = slot i).
    pub occupied: u64,
    /// Population count of `occupied`.
    pub num_occupied: u8,
}

impl OccupiedAndCount {
    pub(crate) fn unpack(word: u64) -> OccupiedAndCount {
        OccupiedAndCount {
            occupied: word & OCCUPIED_MASK,
            num_occupied: (word >> MAX_THREADS_PER_CORE) as u8,
        }
    }

    pub(crate) fn pack(self) -> u64 {
        debug_assert_eq!(u32::from(self.num_occupied), self.occupied.count_ones());
        ((self.num_occupied as u64) << MAX_THREADS_PER_CORE) | self.occupied
    }
}

/// Per-core scheduler state: the slot table and its occupancy word.
pub(crate) struct CoreState {
    pub(crate) occupied_and_count: CachePadded<AtomicU64>,
    /// The core's active list. Slot addresses are stable for the
    /// runtime's lifetime; only the core's kernel thread executes them.
    pub(crate) slots: Box<[ThreadContext]>,
}

impl CoreState {
    pub(crate) fn new(stack_size: usize) -> CoreState {
        let slots = (0..MAX_THREADS_PER_CORE)
            .map(|index| ThreadContext::new(index, stack_size, thread_trampoline))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        CoreState {
            occupied_and_count: CachePadded::new(AtomicU64::new(0)),
            slots,
        }
    }

    /// Claims the lowest free slot, or returns None with no side effects
    /// when all slots are taken.
    pub(crate) fn claim_slot(&self) -> Option<usize> {
        let mut current = self.occupied_and_count.load(Ordering::Relaxed);
        loop {
            let unpacked = OccupiedAndCount::unpack(current);
            if unpacked.num_occupied as usize == MAX_THREADS_PER_CORE {
                return None;
            }
            // Guaranteed < 56 while the popcount invariant holds.
            let index = (!unpacked.occupied).trailing_zeros() as usize;
            let next = OccupiedAndCount {
                occupied: unpacked.occupied | 1 << index,
                num_occupied: unpacked.num_occupied + 1,
            };
            match self.occupied_and_count.compare_exchange(
                current,
                next.pack(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(index),
                // Contention or the slot got taken: rescan.
                Err(actual) => current = actual,
            }
        }
    }

    /// Returns a slot to the free pool.
    pub(crate) fn release_slot(&self, index: usize) {
        let mut current = self.occupied_and_count.load(Ordering::Relaxed);
        loop {
            let unpacked = OccupiedAndCount::unpack(current);
            debug_assert_ne!(unpacked.occupied & 1 << index, 0, "Slot {} not in use?", index);
            let next = OccupiedAndCount {
                occupied: unpacked.occupied & !(1 << index),
                num_occupied: unpacked.num_occupied - 1,
            };
            match self.occupied_and_count.compare_exchange(
                current,
                next.pack(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

/// A handle to one M:N threading runtime.
///
/// Created with [`Runtime::new`], which spawns one kernel thread per
/// configured core; torn down with [`Runtime::shutdown`]. All thread
/// creation goes through [`Runtime::spawn`]; the suspension primitives
/// ([`relinquish`], [`sleep`], [`block`], [`join`]) are free functions
/// because they always act on the calling user thread.
pub struct Runtime {
    pub(crate) cores: Vec<CoreState>,
    stack_size: usize,
    shutdown: AtomicBool,
    live_cores: AtomicUsize,
    kernel_threads: spin::Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Runtime {
    /// Brings up a runtime: allocates and primes all per-core slot
    /// tables, then spawns one kernel thread per core and waits until
    /// every one of them has entered its scheduler loop.
    pub fn new(opts: crate::Options) -> Arc<Runtime> {
        assert!(opts.num_cores >= 1, "Need at least one core?");
        assert!(opts.stack_size >= 4096, "Stack size {} too small?", opts.stack_size);

        // Force the TSC estimate now, not on the first sleep deadline.
        cycles::per_second();

        let cores = (0..opts.num_cores)
            .map(|_| CoreState::new(opts.stack_size))
            .collect();
        let runtime = Arc::new(Runtime {
            cores,
            stack_size: opts.stack_size,
            shutdown: AtomicBool::new(false),
            live_cores: AtomicUsize::new(0),
            kernel_threads: spin::Mutex::new(Vec::new()),
        });

        let mut handles = Vec::with_capacity(opts.num_cores);
        for core_id in 0..opts.num_cores {
            let r = Arc::clone(&runtime);
            let handle = thread::Builder::new()
                .name(format!("spindle-core-{}", core_id))
                .spawn(move || thread_main(&r, core_id))
                .expect("Can't spawn the kernel thread?");
            handles.push(handle);
        }
        *runtime.kernel_threads.lock() = handles;

        while runtime.live_cores.load(Ordering::SeqCst) != opts.num_cores {
            spin_loop();
        }
        runtime
    }

    /// Places `f` in a free slot on `core_id` and makes it runnable.
    ///
    /// Returns None when all slots on the core are in use; the attempt
    /// then has no side effects. The closure (with its captures) must
    /// fit the slot's inline invocation storage
    /// ([`MAX_INVOCATION_BYTES`](crate::MAX_INVOCATION_BYTES)); larger
    /// closures are rejected at compile time.
    ///
    /// # Panics
    /// When `core_id` is not a configured core.
    pub fn spawn<F>(&self, core_id: CoreId, f: F) -> Option<ThreadId>
    where
        F: FnOnce() + Send + 'static,
    {
        assert!(core_id < self.cores.len(), "Core {} does not exist?", core_id);
        let core = &self.cores[core_id];

        let index = core.claim_slot().or_else(|| {
            debug!("too many threads on core {}", core_id);
            None
        })?;
        let ctx = &core.slots[index];

        // The slot is ours (bit set) but not yet schedulable: its wakeup
        // word still holds WAKEUP_NEVER from init or from the previous
        // occupant's exit. Fill in the invocation, then publish the slot
        // with the release store below; the scheduler's acquire load of
        // the wakeup word is what orders these writes.
        unsafe { (*ctx.invocation.get()).set(f) };
        let generation = ctx.generation.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        ctx.wakeup_time_in_cycles.store(0, Ordering::Release);

        trace!("spawned thread {} in slot {} of core {}", generation, index, core_id);
        Some(ThreadId::new(NonNull::from(ctx), generation))
    }

    /// Reads a core's occupancy word (slot bitmask plus count).
    ///
    /// This is the runtime's load-inspection surface: a single atomic
    /// read, coherent between mask and count.
    pub fn occupied_and_count(&self, core_id: CoreId) -> OccupiedAndCount {
        assert!(core_id < self.cores.len(), "Core {} does not exist?", core_id);
        OccupiedAndCount::unpack(self.cores[core_id].occupied_and_count.load(Ordering::SeqCst))
    }

    /// Number of cores (and kernel threads) this runtime drives.
    pub fn num_cores(&self) -> usize {
        self.cores.len()
    }

    /// Per-thread stack size in bytes.
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Tears the runtime down: every kernel thread leaves its scheduler
    /// loop at the next idle point and is joined.
    ///
    /// User threads still occupying slots are abandoned, not completed;
    /// callers drain the runtime first if they care. Idempotent.
    ///
    /// # Panics
    /// When called from one of the runtime's own kernel threads.
    pub fn shutdown(&self) {
        assert!(
            tls::try_scb().is_none(),
            "Can't shut down from inside the runtime?"
        );
        self.shutdown.store(true, Ordering::Release);
        let handles = mem::take(&mut *self.kernel_threads.lock());
        for handle in handles {
            let _r = handle.join();
        }
    }

    /// Round-robin scheduler loop; runs on a kernel thread's own stack
    /// until shutdown.
    fn scheduler_main_loop(&self, scb: &SchedulerControlBlock) {
        let core = &self.cores[scb.core_id];
        let mut next_slot = 0;

        while !self.shutdown.load(Ordering::Acquire) {
            let occupied =
                OccupiedAndCount::unpack(core.occupied_and_count.load(Ordering::Acquire)).occupied;
            let now = cycles::rdtsc();
            let mut dispatched = false;

            for offset in 0..MAX_THREADS_PER_CORE {
                let index = (next_slot + offset) % MAX_THREADS_PER_CORE;
                if occupied & 1 << index == 0 {
                    continue;
                }
                let ctx = &core.slots[index];
                if ctx.wakeup_time_in_cycles.load(Ordering::Acquire) > now {
                    continue;
                }

                // Park the wakeup word at the blocked sentinel while the
                // thread runs. This is what lets block() suspend without
                // writing: a make_runnable that lands between here and
                // the thread's next suspension is never lost, it just
                // makes the next suspension return immediately.
                ctx.wakeup_time_in_cycles.store(WAKEUP_NEVER, Ordering::Relaxed);
                scb.running.set(ctx as *const ThreadContext as *mut ThreadContext);
                unsafe {
                    context::swapcontext(scb.scheduler_sp.as_ptr(), ctx.sp.as_ptr());
                }
                scb.running.set(ptr::null_mut());

                next_slot = index + 1;
                dispatched = true;
                // The occupancy word may have changed under us; rescan.
                break;
            }

            if !dispatched {
                spin_loop();
            }
        }
        trace!("scheduler loop on core {} exiting", scb.core_id);
    }
}

/// Entry point of each kernel thread: pin, install the control block,
/// report live, schedule until shutdown.
fn thread_main(runtime: &Runtime, core_id: CoreId) {
    pin_to_core(core_id);

    let scb = SchedulerControlBlock::new(core_id, runtime);
    unsafe { tls::set_scb(&scb) };
    runtime.live_cores.fetch_add(1, Ordering::SeqCst);
    debug!("kernel thread for core {} is live", core_id);

    runtime.scheduler_main_loop(&scb);

    unsafe { tls::set_scb(ptr::null()) };
}

#[cfg(target_os = "linux")]
fn pin_to_core(core_id: CoreId) {
    let cpus = thread::available_parallelism().map_or(1, |n| n.get());
    unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core_id % cpus, &mut set);
        if libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            warn!("failed to pin kernel thread to core {}", core_id);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_core(core_id: CoreId) {
    debug!("no core pinning on this platform (kernel thread for core {})", core_id);
}

/// Every primed stack enters here on its first dispatch and loops once
/// per occupant: run the invocation, retire the slot, switch back to the
/// scheduler, and wait (suspended inside the loop) for the slot's next
/// occupant.
///
/// The exit protocol below runs while the slot's bit is still set, on
/// the slot's own stack. That is safe even if another core reclaims the
/// slot the instant the bit clears: the reclaimer only writes memory,
/// and the one kernel thread that could dispatch the slot is suspended
/// until our final swapcontext lands back in it.
unsafe extern "C" fn thread_trampoline() {
    loop {
        let scb = tls::scb();
        let ctx: &ThreadContext = &*scb.running.get();

        (*ctx.invocation.get()).invoke();

        // Retire this occupant: advance the generation and wake joiners
        // before the slot becomes reclaimable, so no joiner can observe
        // the old generation on a freed slot.
        ctx.join_lock.lock();
        ctx.generation.fetch_add(1, Ordering::Release);
        ctx.join_cv.broadcast();
        ctx.join_lock.unlock();

        trace!("thread in slot {} of core {} has terminated", ctx.index, scb.core_id);

        // Leave the slot blocked for its next occupant, then free it.
        // Order matters: once the bit clears, a creator may publish a
        // new wakeup value, which we must not overwrite.
        ctx.wakeup_time_in_cycles.store(WAKEUP_NEVER, Ordering::Relaxed);
        let runtime = &*scb.runtime;
        runtime.cores[scb.core_id].release_slot(ctx.index);

        context::swapcontext(ctx.sp.as_ptr(), scb.scheduler_sp.as_ptr());
        // Resumed: the slot has been reused and dispatched again.
    }
}

/// Suspends the calling user thread and resumes the core's scheduler
/// loop. Returns when the scheduler dispatches this slot again.
pub(crate) fn suspend_current_thread() {
    let (scb, ctx) = tls::current_thread();
    unsafe {
        context::swapcontext(ctx.sp.as_ptr(), scb.scheduler_sp.as_ptr());
    }
}

/// Yields the core.
///
/// The calling thread stays runnable, but every other runnable thread on
/// the same core is offered the core first.
///
/// # Panics
/// When called from outside a user thread.
pub fn relinquish() {
    let (_, ctx) = tls::current_thread();
    ctx.wakeup_time_in_cycles.store(0, Ordering::Relaxed);
    suspend_current_thread();
}

/// Suspends the calling thread for at least `duration`.
///
/// The wake-up is deadline-based: the scheduler re-dispatches the thread
/// on its first scan after the deadline, so the actual delay is the
/// requested one plus scheduling latency.
///
/// # Panics
/// When called from outside a user thread.
pub fn sleep(duration: Duration) {
    let (_, ctx) = tls::current_thread();
    let deadline = cycles::rdtsc() + cycles::from_duration(duration);
    ctx.wakeup_time_in_cycles.store(deadline, Ordering::Relaxed);
    suspend_current_thread();
}

/// Suspends the calling thread until some other thread passes its id to
/// [`make_runnable`].
///
/// The thread's wakeup word has held the blocked sentinel since it was
/// last dispatched, so there is no window here for a wake-up to get
/// lost: a `make_runnable` that raced ahead of this call simply makes it
/// return immediately.
///
/// # Panics
/// When called from outside a user thread.
pub fn block() {
    suspend_current_thread();
}

/// Makes the identified thread runnable, whichever core it lives on.
///
/// A single unconditional store: idempotent, callable from any thread
/// (including threads outside the runtime), and a no-op in effect if the
/// target is not blocked. The generation of `tid` is deliberately not
/// checked; signalling a handle whose thread has terminated touches the
/// recycled slot and can spuriously wake its new occupant. Callers are
/// expected to hold a live handle.
pub fn make_runnable(tid: ThreadId) {
    tid.context()
        .wakeup_time_in_cycles
        .store(0, Ordering::Release);
}

/// Blocks the calling user thread until the thread identified by `tid`
/// has terminated. Returns immediately if it already has (or if `tid` is
/// stale from an earlier use of the slot).
///
/// # Panics
/// When called from outside a user thread.
pub fn join(tid: ThreadId) {
    let ctx = tid.context();
    ctx.join_lock.lock();
    while ctx.generation.load(Ordering::Acquire) == tid.generation() {
        ctx.join_cv.wait(&ctx.join_lock);
    }
    ctx.join_lock.unlock();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::limited_time_wait;
    use crate::Options;
    use crossbeam_queue::ArrayQueue;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize};
    use std::sync::Arc;

    fn two_cores() -> Arc<Runtime> {
        let _r = env_logger::try_init();
        Runtime::new(Options::default())
    }

    fn drain(r: &Runtime) {
        for core_id in 0..r.num_cores() {
            limited_time_wait(|| r.occupied_and_count(core_id).num_occupied == 0);
        }
        r.shutdown();
    }

    #[test]
    fn occupancy_word_stays_consistent() {
        let core = CoreState::new(16 * 1024);
        for expected in 0..MAX_THREADS_PER_CORE {
            assert_eq!(core.claim_slot(), Some(expected));
            let oc = OccupiedAndCount::unpack(core.occupied_and_count.load(Ordering::SeqCst));
            assert_eq!(u32::from(oc.num_occupied), oc.occupied.count_ones());
        }
        assert_eq!(core.claim_slot(), None);

        // Freed slots are re-claimed lowest-first.
        core.release_slot(3);
        core.release_slot(17);
        assert_eq!(core.claim_slot(), Some(3));
        assert_eq!(core.claim_slot(), Some(17));
    }

    #[test]
    fn spawn_runs_to_completion() {
        let r = two_cores();
        assert_eq!(
            r.occupied_and_count(0),
            OccupiedAndCount { occupied: 0, num_occupied: 0 }
        );

        let gate = Arc::new(AtomicBool::new(false));
        let g = gate.clone();
        r.spawn(0, move || {
            while !g.load(Ordering::SeqCst) {
                relinquish();
            }
        })
        .unwrap();

        assert_eq!(r.occupied_and_count(0).occupied, 1);
        assert_eq!(r.occupied_and_count(0).num_occupied, 1);

        gate.store(true, Ordering::SeqCst);
        limited_time_wait(|| r.occupied_and_count(0).num_occupied == 0);
        assert_eq!(r.occupied_and_count(0).occupied, 0);
        r.shutdown();
    }

    #[test]
    fn spawn_passes_captured_arguments() {
        let r = two_cores();
        let value = Arc::new(AtomicUsize::new(0));
        let v = value.clone();
        r.spawn(0, move || {
            v.store(0x5ca1ab1e, Ordering::SeqCst);
        })
        .unwrap();
        limited_time_wait(|| value.load(Ordering::SeqCst) == 0x5ca1ab1e);
        drain(&r);
    }

    #[test]
    fn spawn_returns_none_when_slots_exhausted() {
        let r = two_cores();
        let gate = Arc::new(AtomicBool::new(false));

        for _ in 0..MAX_THREADS_PER_CORE {
            let g = gate.clone();
            let tid = r.spawn(0, move || {
                while !g.load(Ordering::SeqCst) {
                    relinquish();
                }
            });
            assert!(tid.is_some());
        }
        assert!(r
            .spawn(0, || panic!("this thread must never have been created"))
            .is_none());
        assert_eq!(
            r.occupied_and_count(0).num_occupied as usize,
            MAX_THREADS_PER_CORE
        );

        gate.store(true, Ordering::SeqCst);
        drain(&r);
    }

    #[test]
    fn running_thread_observes_parked_wakeup_word() {
        // While a thread runs, its wakeup word holds the blocked
        // sentinel and its occupancy bit is set.
        let r = two_cores();
        let r2 = r.clone();
        let ok = Arc::new(AtomicBool::new(false));
        let o = ok.clone();
        r.spawn(0, move || {
            let state_ok = r2.cores[0].slots[0]
                .wakeup_time_in_cycles
                .load(Ordering::SeqCst)
                == WAKEUP_NEVER
                && r2.occupied_and_count(0)
                    == OccupiedAndCount { occupied: 1, num_occupied: 1 };
            o.store(state_ok, Ordering::SeqCst);
        })
        .unwrap();
        limited_time_wait(|| ok.load(Ordering::SeqCst));
        drain(&r);
    }

    #[test]
    fn relinquish_gives_other_threads_the_core() {
        let r = two_cores();
        let keep_yielding = Arc::new(AtomicBool::new(true));
        let k = keep_yielding.clone();
        r.spawn(0, move || {
            while k.load(Ordering::SeqCst) {
                relinquish();
            }
        })
        .unwrap();

        let flag = Arc::new(AtomicBool::new(false));
        let f = flag.clone();
        r.spawn(0, move || {
            f.store(true, Ordering::SeqCst);
        })
        .unwrap();

        // The second thread only runs if the yielder actually gives up
        // the core.
        limited_time_wait(|| flag.load(Ordering::SeqCst));
        keep_yielding.store(false, Ordering::SeqCst);
        drain(&r);
    }

    #[test]
    fn relinquish_reaches_all_threads() {
        let r = two_cores();
        let keep_yielding = Arc::new(AtomicBool::new(true));
        let bits = Arc::new(AtomicUsize::new(0));

        for bit in 0..3 {
            let k = keep_yielding.clone();
            let b = bits.clone();
            r.spawn(0, move || {
                while k.load(Ordering::SeqCst) {
                    b.fetch_or(1 << bit, Ordering::SeqCst);
                    relinquish();
                }
            })
            .unwrap();
        }

        limited_time_wait(|| bits.load(Ordering::SeqCst) == 0b111);
        keep_yielding.store(false, Ordering::SeqCst);
        drain(&r);
    }

    #[test]
    fn sleep_lasts_at_least_the_requested_time() {
        let r = two_cores();
        let elapsed_cycles = Arc::new(AtomicU64::new(0));
        let e = elapsed_cycles.clone();
        r.spawn(0, move || {
            let before = cycles::rdtsc();
            sleep(Duration::from_nanos(1000));
            e.store(cycles::rdtsc() - before, Ordering::SeqCst);
        })
        .unwrap();

        limited_time_wait(|| elapsed_cycles.load(Ordering::SeqCst) != 0);
        assert!(cycles::to_nanos(elapsed_cycles.load(Ordering::SeqCst)) >= 1000);
        drain(&r);
    }

    #[test]
    fn sleep_wakeup_is_reset_after_resumption() {
        let r = two_cores();
        let r2 = r.clone();
        let awake = Arc::new(AtomicBool::new(false));
        let hold = Arc::new(AtomicBool::new(true));
        let a = awake.clone();
        let h = hold.clone();
        r.spawn(0, move || {
            sleep(Duration::from_micros(10));
            a.store(true, Ordering::SeqCst);
            while h.load(Ordering::SeqCst) {
                relinquish();
            }
        })
        .unwrap();

        limited_time_wait(|| awake.load(Ordering::SeqCst));
        // The sleeper is running again (or runnable): its deadline must
        // have been replaced by the blocked sentinel at dispatch.
        let wakeup = r2.cores[0].slots[0]
            .wakeup_time_in_cycles
            .load(Ordering::SeqCst);
        assert!(wakeup == WAKEUP_NEVER || wakeup == 0);
        hold.store(false, Ordering::SeqCst);
        drain(&r);
    }

    #[test]
    fn block_until_made_runnable() {
        let r = two_cores();
        let blocker_has_started = Arc::new(AtomicBool::new(false));
        let b = blocker_has_started.clone();
        let tid = r
            .spawn(0, move || {
                b.store(true, Ordering::SeqCst);
                block();
            })
            .unwrap();
        assert_eq!(
            r.occupied_and_count(0),
            OccupiedAndCount { occupied: 1, num_occupied: 1 }
        );

        limited_time_wait(|| blocker_has_started.load(Ordering::SeqCst));
        make_runnable(tid);
        limited_time_wait(|| r.occupied_and_count(0).num_occupied == 0);
        assert_eq!(r.occupied_and_count(0).occupied, 0);
        r.shutdown();
    }

    #[test]
    fn join_after_termination() {
        let r = two_cores();
        // The joinee never suspends, so it terminates before the joiner
        // first runs.
        let joinee = r.spawn(0, || {}).unwrap();
        r.spawn(0, move || {
            join(joinee);
        })
        .unwrap();
        drain(&r);
    }

    #[test]
    fn join_during_run_orders_completion() {
        let r = two_cores();
        let order = Arc::new(ArrayQueue::new(2));

        let o = order.clone();
        let joinee = r
            .spawn(0, move || {
                relinquish();
                let _r = o.push("joinee");
            })
            .unwrap();

        let o = order.clone();
        r.spawn(0, move || {
            join(joinee);
            let _r = o.push("joiner");
        })
        .unwrap();

        limited_time_wait(|| order.len() == 2);
        assert_eq!(order.pop(), Some("joinee"));
        assert_eq!(order.pop(), Some("joiner"));
        drain(&r);
    }

    #[test]
    fn join_with_stale_id_returns_immediately() {
        let r = two_cores();
        let first = r.spawn(0, || {}).unwrap();
        limited_time_wait(|| r.occupied_and_count(0).num_occupied == 0);

        // `first` is stale now; a join on it must not wait.
        let done = Arc::new(AtomicBool::new(false));
        let d = done.clone();
        r.spawn(0, move || {
            join(first);
            d.store(true, Ordering::SeqCst);
        })
        .unwrap();
        limited_time_wait(|| done.load(Ordering::SeqCst));
        drain(&r);
    }

    #[test]
    fn cores_run_on_distinct_kernel_threads() {
        let r = two_cores();
        let seen = Arc::new(ArrayQueue::new(2));

        for core_id in 0..2 {
            let s = seen.clone();
            r.spawn(core_id, move || {
                let _r = s.push(thread::current().id());
            })
            .unwrap();
        }

        limited_time_wait(|| seen.len() == 2);
        let a = seen.pop().unwrap();
        let b = seen.pop().unwrap();
        assert_ne!(a, b, "Threads didn't run on different kernel threads?");
        drain(&r);
    }

    #[test]
    fn threads_can_spawn_threads() {
        let r = two_cores();
        let r2 = r.clone();
        let child_ran = Arc::new(AtomicBool::new(false));
        let c = child_ran.clone();
        r.spawn(0, move || {
            let child = r2
                .spawn(1, move || {
                    c.store(true, Ordering::SeqCst);
                })
                .expect("Can't spawn the child thread?");
            join(child);
        })
        .unwrap();
        limited_time_wait(|| child_ran.load(Ordering::SeqCst));
        drain(&r);
    }
}
