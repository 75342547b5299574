//! Thread control blocks and the scheduler core.
//!
//! The kernel tracks threads in a fixed-size arena of control blocks. A
//! public [`ThreadId`] pairs the arena index with a generation counter so
//! that a handle left over from an exited thread is detected instead of
//! silently addressing the slot's next occupant.
//!
//! The state machine:
//!
#![cfg_attr(
    feature = "doc",
    doc = svgbobdoc::transform!(
        /// ```svgbob
        ///             dispatch
        ///   READY --------------> RUNNING ----> STOPPED
        ///     ^                    |  |          (exit)
        ///     |   preempt / yield  |  |
        ///     +<-------------------+  | block
        ///     |                       v
        ///     +<------------------ WAITING
        ///           wake / timeout
        /// ```
    )
)]
//!
//! `WAITING` covers both plain sleeps and waits on a synchronization object;
//! in the latter case the control block records which object, so that a
//! timeout can unlink the thread from the object's queue and so that
//! priority inheritance can follow the blocking chain.
use core::fmt;

use crate::{
    error::{BadContextError, BadIdError},
    klock::{CpuLockCell, CpuLockTokenRefMut},
    mutex::Mutex,
    timeout::Timeout,
    utils::Init,
    wait::WaitQueue,
    Kernel, Port, Priority, MAX_THREADS,
};

pub(crate) mod ready_queue;

pub(crate) use ready_queue::ThreadList;

/// Handle to a thread created by [`Kernel::spawn`](crate::Kernel::spawn).
///
/// Handles are generational: once the thread exits, every outstanding handle
/// to it becomes stale and operations taking it return `BadId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId {
    pub(crate) index: u8,
    pub(crate) generation: u8,
}

/// The arena index of the idle thread. The slot is reserved by
/// [`Kernel::start`](crate::Kernel::start); user threads occupy the
/// remaining slots.
pub(crate) const IDLE_INDEX: u8 = 0;

/// The priority of the idle thread. User threads must use a higher one.
pub(crate) const IDLE_PRIORITY: Priority = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ThreadSt {
    /// The slot is unoccupied.
    Dormant,
    /// In the ready queue, waiting for dispatch.
    Ready,
    /// The current thread. At most one thread is in this state.
    Running,
    /// Blocked, possibly with an armed timeout. `wait_target` tells whether
    /// the thread is in a wait queue or in a plain sleep.
    Waiting,
    /// Exited. The slot can be reused; the generation counter has already
    /// been bumped.
    Stopped,
}

impl Init for ThreadSt {
    const INIT: Self = Self::Dormant;
}

/// The result code delivered to a thread when it is woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeupMessage {
    /// Woken by a signal or an ownership handoff.
    Ok,
    /// The wait timed out.
    Timeout,
    /// The object was reset or broadcast while the thread was waiting.
    Reset,
}

impl Init for WakeupMessage {
    const INIT: Self = Self::Ok;
}

/// Link fields for [`ThreadList`]. Arena indices instead of pointers.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Link {
    pub(crate) prev: Option<u8>,
    pub(crate) next: Option<u8>,
}

impl Init for Link {
    const INIT: Self = Self {
        prev: None,
        next: None,
    };
}

/// What a `Waiting` thread is blocked on.
pub(crate) enum WaitTarget<P: Port> {
    /// A wait queue embedded in a semaphore or a condition variable.
    Queue(&'static WaitQueue<P>),
    /// A mutex. Distinguished from `Queue` so that priority inheritance can
    /// follow the chain of blocked owners.
    Mutex(&'static Mutex<P>),
}

impl<P: Port> Clone for WaitTarget<P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P: Port> Copy for WaitTarget<P> {}

impl<P: Port> fmt::Debug for WaitTarget<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Queue(q) => f.debug_tuple("Queue").field(&(*q as *const _)).finish(),
            Self::Mutex(m) => f.debug_tuple("Mutex").field(&(*m as *const _)).finish(),
        }
    }
}

/// *Thread control block* - the state data of a thread.
pub(crate) struct ThreadCb<P: Port> {
    pub(crate) st: CpuLockCell<P, ThreadSt>,

    /// The priority the thread was created with or assigned last, never
    /// affected by inheritance.
    pub(crate) base_priority: CpuLockCell<P, Priority>,

    /// The priority the scheduler actually uses. Equals `base_priority`
    /// unless raised by priority inheritance.
    pub(crate) effective_priority: CpuLockCell<P, Priority>,

    pub(crate) link: CpuLockCell<P, Link>,

    pub(crate) wakeup_message: CpuLockCell<P, WakeupMessage>,

    pub(crate) wait_target: CpuLockCell<P, Option<WaitTarget<P>>>,

    /// The head of the list of mutexes held by this thread, linked through
    /// [`Mutex::prev_held`], most recently locked first.
    pub(crate) last_mutex_held: CpuLockCell<P, Option<&'static Mutex<P>>>,

    /// Remaining round-robin quantum, in ticks. Unused when the kernel is
    /// not configured for round-robin scheduling.
    pub(crate) quantum_ticks: CpuLockCell<P, u32>,

    pub(crate) generation: CpuLockCell<P, u8>,

    /// The execution context maintained by the port. `None` while the slot
    /// is unoccupied.
    pub(crate) context: CpuLockCell<P, Option<P::Context>>,
}

impl<P: Port> Init for ThreadCb<P> {
    const INIT: Self = Self {
        st: Init::INIT,
        base_priority: Init::INIT,
        effective_priority: Init::INIT,
        link: Init::INIT,
        wakeup_message: Init::INIT,
        wait_target: Init::INIT,
        last_mutex_held: Init::INIT,
        quantum_ticks: Init::INIT,
        generation: Init::INIT,
        context: Init::INIT,
    };
}

impl<P: Port> fmt::Debug for ThreadCb<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ThreadCb")
            .field("self", &(self as *const _))
            .field("st", &self.st)
            .field("base_priority", &self.base_priority)
            .field("effective_priority", &self.effective_priority)
            .field("wakeup_message", &self.wakeup_message)
            .field("wait_target", &self.wait_target)
            .field("quantum_ticks", &self.quantum_ticks)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

pub(crate) struct ThreadArena<P: Port> {
    cbs: [ThreadCb<P>; MAX_THREADS],
}

impl<P: Port> Init for ThreadArena<P> {
    const INIT: Self = Self { cbs: Init::INIT };
}

impl<P: Port> ThreadArena<P> {
    /// Get the control block at a trusted arena index.
    #[inline]
    pub(crate) fn cb(&self, idx: u8) -> &ThreadCb<P> {
        &self.cbs[idx as usize]
    }

    /// Resolve a public handle, checking liveness and generation.
    pub(crate) fn get(
        &self,
        thread: ThreadId,
        lock: CpuLockTokenRefMut<'_, P>,
    ) -> Result<u8, BadIdError> {
        if thread.index as usize >= MAX_THREADS {
            return Err(BadIdError::BadId);
        }
        let cb = self.cb(thread.index);
        match cb.st.get(&*lock) {
            ThreadSt::Dormant | ThreadSt::Stopped => return Err(BadIdError::BadId),
            _ => {}
        }
        if cb.generation.get(&*lock) != thread.generation {
            return Err(BadIdError::BadId);
        }
        Ok(thread.index)
    }

    /// Find an unoccupied slot, excluding the idle slot.
    pub(crate) fn find_free(&self, lock: CpuLockTokenRefMut<'_, P>) -> Option<u8> {
        (IDLE_INDEX + 1..MAX_THREADS as u8).find(|&i| {
            matches!(
                self.cb(i).st.get(&*lock),
                ThreadSt::Dormant | ThreadSt::Stopped
            )
        })
    }
}

/// Check that the calling context may block: there is a current thread and
/// we are not inside an interrupt handler. Returns the current thread's
/// arena index.
pub(crate) fn expect_waitable_context<P: Port>(
    kernel: &Kernel<P>,
    lock: CpuLockTokenRefMut<'_, P>,
) -> Result<u8, BadContextError> {
    if P::is_interrupt_context() {
        return Err(BadContextError::BadContext);
    }
    kernel
        .current
        .get(&*lock)
        .ok_or(BadContextError::BadContext)
}

/// Check that the caller is in thread context. Wake operations that acquire
/// the kernel lock themselves may dispatch immediately, so an interrupt
/// handler must use the `*_with` forms instead.
pub(crate) fn expect_thread_context<P: Port>() -> Result<(), BadContextError> {
    if P::is_interrupt_context() {
        return Err(BadContextError::BadContext);
    }
    Ok(())
}

pub(crate) fn current_index<P: Port>(
    kernel: &Kernel<P>,
    lock: CpuLockTokenRefMut<'_, P>,
) -> Option<u8> {
    kernel.current.get(&*lock)
}

/// Insert a woken or newly created thread into the ready queue, after its
/// equal-priority peers. Does not reschedule; the caller decides when.
pub(crate) fn make_ready<P: Port>(
    kernel: &Kernel<P>,
    mut lock: CpuLockTokenRefMut<'_, P>,
    idx: u8,
) {
    let cb = kernel.threads.cb(idx);
    debug_assert_ne!(cb.st.get(&*lock), ThreadSt::Ready);
    debug_assert_ne!(cb.st.get(&*lock), ThreadSt::Running);
    cb.st.replace(&mut *lock, ThreadSt::Ready);
    kernel.ready_queue.insert_behind(&kernel.threads, idx, lock);
}

/// Like [`make_ready`], but the thread goes in front of its equal-priority
/// peers. Used for a preempted thread that has not used up its turn.
fn make_ready_ahead<P: Port>(kernel: &Kernel<P>, mut lock: CpuLockTokenRefMut<'_, P>, idx: u8) {
    let cb = kernel.threads.cb(idx);
    cb.st.replace(&mut *lock, ThreadSt::Ready);
    kernel.ready_queue.insert_ahead(&kernel.threads, idx, lock);
}

/// Make `next` the current thread and switch execution contexts. Returns
/// when `prev` is dispatched again.
///
/// The caller must have already placed `prev` wherever it belongs (ready
/// queue, a wait queue, or nowhere for an exiting thread).
pub(crate) fn switch_to<P: Port>(
    kernel: &Kernel<P>,
    mut lock: CpuLockTokenRefMut<'_, P>,
    prev: u8,
    next: u8,
) {
    let threads = &kernel.threads;
    threads.cb(next).st.replace(&mut *lock, ThreadSt::Running);
    threads
        .cb(next)
        .quantum_ticks
        .replace(&mut *lock, kernel.quantum.map_or(0, |q| q.get()));
    kernel.current.replace(&mut *lock, Some(next));

    // Raw pointers because the cell borrows must not be held across the
    // switch; other threads run and mutate the arena while this one is
    // suspended inside `context_switch`.
    let next_ctx = match threads.cb(next).context.read(&*lock) {
        Some(ctx) => ctx as *const P::Context,
        None => unreachable!("dispatched thread has no context"),
    };
    let prev_ctx = match threads.cb(prev).context.read(&*lock) {
        Some(ctx) => ctx as *const P::Context,
        None => unreachable!("suspended thread has no context"),
    };

    // Safety: CPU Lock is active, and both pointers refer to contexts of
    // live threads. Ownership of the CPU Lock state transfers to `next` and
    // comes back when `prev` is dispatched again.
    unsafe { P::context_switch(next_ctx, prev_ctx) };
}

/// Move the current thread out of the `Running` state and dispatch the
/// ready-queue head. Returns when the caller is dispatched again.
///
/// The caller is responsible for the bookkeeping that makes the current
/// thread findable again (wait queue membership, `wait_target`).
pub(crate) fn go_sleep<P: Port>(kernel: &Kernel<P>, mut lock: CpuLockTokenRefMut<'_, P>) {
    let cur = match kernel.current.get(&*lock) {
        Some(cur) => cur,
        None => unreachable!("blocking without a current thread"),
    };
    kernel
        .threads
        .cb(cur)
        .st
        .replace(&mut *lock, ThreadSt::Waiting);

    // The idle thread never blocks, so the ready queue cannot be empty here
    let next = match kernel
        .ready_queue
        .pop_front(&kernel.threads, lock.borrow_mut())
    {
        Some(next) => next,
        None => unreachable!("ready queue is empty"),
    };
    switch_to(kernel, lock, cur, next);
}

/// [`go_sleep`] with a timeout. Returns the wakeup message: `Timeout` if the
/// timer fired first, whatever the waker stored otherwise. Exactly one of
/// the two paths delivers the wakeup; the loser is disarmed.
///
/// `timeout` must not be [`Timeout::Immediate`]; the caller handles that
/// case without blocking.
pub(crate) fn go_sleep_timeout<P: Port>(
    kernel: &Kernel<P>,
    mut lock: CpuLockTokenRefMut<'_, P>,
    timeout: Timeout,
) -> WakeupMessage {
    let cur = match kernel.current.get(&*lock) {
        Some(cur) => cur,
        None => unreachable!("blocking without a current thread"),
    };

    match timeout {
        Timeout::Immediate => unreachable!("immediate timeout reached the blocking path"),
        Timeout::Infinite => {
            go_sleep(kernel, lock.borrow_mut());
        }
        Timeout::Ticks(ticks) => {
            let token = kernel.timeouts.arm_reserved(
                lock.borrow_mut(),
                ticks.get(),
                wake_on_timeout::<P>,
                cur as usize,
            );
            go_sleep(kernel, lock.borrow_mut());
            // If the timer is still armed, we were woken by a signal; disarm
            // it so it cannot deliver a second, phantom wakeup later.
            kernel.timeouts.reset(lock.borrow_mut(), token);
        }
    }

    kernel.threads.cb(cur).wakeup_message.get(&*lock)
}

/// Timer callback for [`go_sleep_timeout`]. `param` is the arena index of
/// the sleeping thread.
fn wake_on_timeout<P: Port>(kernel: &Kernel<P>, mut lock: CpuLockTokenRefMut<'_, P>, param: usize) {
    let idx = param as u8;
    let cb = kernel.threads.cb(idx);

    // The thread may have been woken by a signal in the same tick batch,
    // before it got a chance to run and disarm this timer. Nothing to do.
    if cb.st.get(&*lock) != ThreadSt::Waiting {
        return;
    }

    if let Some(target) = cb.wait_target.replace(&mut *lock, None) {
        match target {
            WaitTarget::Queue(q) => q.unlink(kernel, lock.borrow_mut(), idx),
            WaitTarget::Mutex(m) => m.unlink_waiter(kernel, lock.borrow_mut(), idx),
        }
    }

    cb.wakeup_message.replace(&mut *lock, WakeupMessage::Timeout);
    make_ready(kernel, lock, idx);
}

/// Wake a blocked thread, delivering `msg`. The thread must already be
/// unlinked from any wait queue.
///
/// Fast path: if the woken thread outranks the current one, it is dispatched
/// directly and the current thread goes back to the ready queue ahead of its
/// peers, skipping a full reschedule pass. Otherwise the thread is only made
/// ready.
pub(crate) fn wakeup<P: Port>(
    kernel: &Kernel<P>,
    mut lock: CpuLockTokenRefMut<'_, P>,
    idx: u8,
    msg: WakeupMessage,
) {
    let threads = &kernel.threads;
    threads.cb(idx).wakeup_message.replace(&mut *lock, msg);

    let cur = match kernel.current.get(&*lock) {
        Some(cur) => cur,
        None => {
            // Pre-start: just queue the thread
            make_ready(kernel, lock, idx);
            return;
        }
    };

    let woken_priority = threads.cb(idx).effective_priority.get(&*lock);
    let current_priority = threads.cb(cur).effective_priority.get(&*lock);
    if woken_priority <= current_priority {
        make_ready(kernel, lock, idx);
    } else {
        make_ready_ahead(kernel, lock.borrow_mut(), cur);
        switch_to(kernel, lock, cur, idx);
    }
}

/// Preempt the current thread if the ready-queue head outranks it. Called
/// after any operation that may have made a higher-priority thread ready.
pub(crate) fn reschedule<P: Port>(kernel: &Kernel<P>, mut lock: CpuLockTokenRefMut<'_, P>) {
    let Some(cur) = kernel.current.get(&*lock) else {
        return;
    };
    let Some(head) = kernel.ready_queue.first(lock.borrow_mut()) else {
        return;
    };
    let threads = &kernel.threads;
    if threads.cb(head).effective_priority.get(&*lock)
        > threads.cb(cur).effective_priority.get(&*lock)
    {
        kernel
            .ready_queue
            .remove(threads, head, lock.borrow_mut());
        make_ready_ahead(kernel, lock.borrow_mut(), cur);
        switch_to(kernel, lock, cur, head);
    }
}

/// Voluntarily hand the CPU to the ready-queue head if it is of equal or
/// higher priority. The yielding thread goes behind its peers.
pub(crate) fn yield_current<P: Port>(kernel: &Kernel<P>, mut lock: CpuLockTokenRefMut<'_, P>) {
    let Some(cur) = kernel.current.get(&*lock) else {
        return;
    };
    let Some(head) = kernel.ready_queue.first(lock.borrow_mut()) else {
        return;
    };
    let threads = &kernel.threads;
    if threads.cb(head).effective_priority.get(&*lock)
        >= threads.cb(cur).effective_priority.get(&*lock)
    {
        kernel
            .ready_queue
            .remove(threads, head, lock.borrow_mut());
        make_ready(kernel, lock.borrow_mut(), cur);
        switch_to(kernel, lock, cur, head);
    }
}

/// Tick-driven preemption check: strict priority always preempts; with
/// round-robin enabled, an expired quantum lets an equal-priority peer in.
pub(crate) fn tick_preemption<P: Port>(kernel: &Kernel<P>, mut lock: CpuLockTokenRefMut<'_, P>) {
    let Some(cur) = kernel.current.get(&*lock) else {
        return;
    };
    let Some(head) = kernel.ready_queue.first(lock.borrow_mut()) else {
        return;
    };
    let threads = &kernel.threads;
    let head_priority = threads.cb(head).effective_priority.get(&*lock);
    let current_priority = threads.cb(cur).effective_priority.get(&*lock);

    let quantum_expired =
        kernel.quantum.is_some() && threads.cb(cur).quantum_ticks.get(&*lock) == 0;
    let required = if quantum_expired {
        head_priority >= current_priority
    } else {
        head_priority > current_priority
    };
    if !required {
        return;
    }

    kernel.ready_queue.remove(threads, head, lock.borrow_mut());
    if quantum_expired {
        // The thread consumed its turn; it goes behind its peers and gets a
        // fresh quantum the next time it is dispatched.
        make_ready(kernel, lock.borrow_mut(), cur);
    } else {
        make_ready_ahead(kernel, lock.borrow_mut(), cur);
    }
    switch_to(kernel, lock, cur, head);
}

/// Decrement the current thread's round-robin quantum. Called once per tick.
pub(crate) fn consume_quantum<P: Port>(kernel: &Kernel<P>, mut lock: CpuLockTokenRefMut<'_, P>) {
    if kernel.quantum.is_none() {
        return;
    }
    if let Some(cur) = kernel.current.get(&*lock) {
        let cell = &kernel.threads.cb(cur).quantum_ticks;
        let ticks = cell.get(&*lock);
        if ticks > 0 {
            cell.replace(&mut *lock, ticks - 1);
        }
    }
}

/// Change a thread's base priority and propagate the consequences: queue
/// repositioning, inheritance reevaluation, and preemption.
pub(crate) fn set_priority<P: Port>(
    kernel: &Kernel<P>,
    mut lock: CpuLockTokenRefMut<'_, P>,
    idx: u8,
    priority: Priority,
) {
    kernel
        .threads
        .cb(idx)
        .base_priority
        .replace(&mut *lock, priority);
    #[cfg(feature = "priority_inheritance")]
    let effective = crate::mutex::evaluate_effective_priority(kernel, lock.borrow_mut(), idx);
    #[cfg(not(feature = "priority_inheritance"))]
    let effective = priority;
    apply_effective_priority(kernel, lock.borrow_mut(), idx, effective);
    reschedule(kernel, lock);
}

/// Store a new effective priority and reposition the thread in whatever
/// priority-ordered structure it currently occupies.
pub(crate) fn apply_effective_priority<P: Port>(
    kernel: &Kernel<P>,
    mut lock: CpuLockTokenRefMut<'_, P>,
    idx: u8,
    effective: Priority,
) {
    let threads = &kernel.threads;
    let cb = threads.cb(idx);
    if cb.effective_priority.get(&*lock) == effective {
        return;
    }
    cb.effective_priority.replace(&mut *lock, effective);

    match cb.st.get(&*lock) {
        ThreadSt::Ready => {
            kernel.ready_queue.remove(threads, idx, lock.borrow_mut());
            kernel.ready_queue.insert_behind(threads, idx, lock);
        }
        ThreadSt::Waiting => {
            if let Some(target) = cb.wait_target.get(&*lock) {
                match target {
                    WaitTarget::Queue(q) => q.reposition(kernel, lock, idx),
                    WaitTarget::Mutex(m) => {
                        m.reposition_waiter(kernel, lock.borrow_mut(), idx);
                        // A raised priority must flow on to the owner that
                        // this thread is blocked behind.
                        #[cfg(feature = "priority_inheritance")]
                        crate::mutex::boost_owner_chain(kernel, lock, m, effective);
                    }
                }
            }
        }
        _ => {}
    }
}
