//! The Kestrel kernel: a small priority-scheduled RTOS core.
//!
//! The kernel is an ordinary value, [`Kernel`], constructible in a `const`
//! context and meant to live in a `static`. It is generic over a [`Port`],
//! the type that binds it to a particular processor (or, for testing, to a
//! simulated one running on hosted threads). All kernel state is internally
//! protected by *CPU Lock*, the port's interrupt mask, modeled in the type
//! system by [`CpuLockGuard`] so that state access without the lock does not
//! compile.
//!
//! # Scheduling
//!
//! Scheduling is strictly priority-based: the highest-priority ready thread
//! runs, always. [`Priority`] is a `u8` where larger means more urgent;
//! priority 0 is reserved for the built-in idle thread. Among equal
//! priorities the order is FIFO, with optional round-robin time slicing
//! ([`KernelConfig::round_robin_quantum`]).
//!
//! Time is counted in ticks. The port (or, on a hosted port, any thread
//! standing in for the tick interrupt) calls [`Kernel::timer_tick`] once per
//! tick; timeouts, sleeps, and user timers are all driven by it.
//!
//! # Synchronization
//!
//! [`Semaphore`], [`Mutex`], and [`Condvar`] block threads on
//! priority-ordered wait queues. Mutexes hand ownership directly to the
//! highest-priority waiter and, with the `priority_inheritance` feature
//! (default), propagate priority through chains of blocked owners.
//!
//! Operations that are useful from interrupt handlers and timer callbacks
//! also come in a `*_with` flavor that takes an already-held
//! [`CpuLockTokenRefMut`] instead of acquiring CPU Lock itself.
#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

use core::{fmt, mem::forget, num::NonZeroU32};

pub mod error;
mod klock;
pub mod mem;
mod condvar;
mod mutex;
mod semaphore;
mod thread;
mod timeout;
mod utils;
mod wait;

use crate::{
    error::{
        ArmTimerError, BadContextError, GetPriorityError, SetPriorityError, SleepError,
        SpawnError, StartError, YieldError,
    },
    klock::CpuLockCell,
    thread::{ThreadArena, ThreadList, ThreadSt, WakeupMessage},
    timeout::TimeoutGlobals,
    utils::Init,
};

pub use crate::{
    condvar::{Condvar, CondvarWait},
    klock::{
        assume_cpu_lock, lock_cpu, CpuLockGuard, CpuLockKeyhole, CpuLockTag, CpuLockToken,
        CpuLockTokenRefMut,
    },
    mutex::Mutex,
    semaphore::Semaphore,
    thread::ThreadId,
    timeout::{Timeout, TimerCallback, TimerToken},
};

/// The number of thread slots, the built-in idle thread included.
pub const MAX_THREADS: usize = 32;

/// The number of timers [`Kernel::arm_timer`] may have armed at once.
/// Blocking timeouts do not count against this; they have a reserved slot
/// per thread.
pub const USER_TIMER_CAPACITY: usize = 32;

/// A thread priority. Larger values are more urgent. Zero is reserved for
/// the idle thread; user threads use `1..=255`.
pub type Priority = u8;

/// The interface a target processor must provide to host the kernel.
///
/// A port is a zero-sized tag type; none of these methods take `self`. The
/// kernel calls them to mask interrupts (*CPU Lock*) and to create and
/// switch thread execution contexts.
///
/// # Safety of implementation
///
/// The context methods are trusted to actually suspend and resume machine
/// state as documented; the kernel's memory safety rests on it. In
/// particular, `context_switch` must return in `prev`'s context exactly when
/// `prev` is next dispatched, with CPU Lock active.
pub trait Port: Sized + 'static {
    /// A thread's saved execution state. For a bare-metal port this is
    /// typically a saved stack pointer; for a hosted port, a handle to a
    /// parked host thread.
    type Context: Send + 'static;

    /// Activate CPU Lock. Returns `false` without doing anything if it was
    /// already active.
    ///
    /// # Safety
    ///
    /// Only the kernel may call this; it owns the CPU Lock state machine.
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Deactivate CPU Lock.
    ///
    /// # Safety
    ///
    /// CPU Lock must be active, and the caller must be the kernel code that
    /// activated it (or received ownership of it across a context switch).
    unsafe fn leave_cpu_lock();

    fn is_cpu_lock_active() -> bool;

    /// Whether the calling context is an interrupt handler. Blocking
    /// operations are rejected there.
    fn is_interrupt_context() -> bool;

    /// Set up an execution context that, when first dispatched, deactivates
    /// CPU Lock and runs `entry.entry(entry.param)`; if that returns, it
    /// calls `entry.finalizer(entry.finalizer_param)`.
    ///
    /// # Safety
    ///
    /// `stack` must refer to memory usable as this thread's stack for the
    /// context's whole lifetime (ports that provide their own stacks, such
    /// as hosted ones, may ignore it).
    unsafe fn create_context(entry: ThreadEntry, stack: StackRegion) -> Self::Context;

    /// Suspend the calling thread's state into `prev` and resume `next`.
    /// Returns when `prev` is dispatched again.
    ///
    /// # Safety
    ///
    /// CPU Lock must be active; ownership of it transfers to `next` and
    /// returns with `prev`. Both pointers must refer to live contexts
    /// created by `create_context` (or the context captured by
    /// `dispatch_first`).
    unsafe fn context_switch(next: *const Self::Context, prev: *const Self::Context);

    /// Resume `next` and never come back; the calling thread is gone.
    ///
    /// # Safety
    ///
    /// Same as [`Self::context_switch`], except nothing is saved.
    unsafe fn exit_and_switch(next: *const Self::Context) -> !;

    /// Dispatch the very first thread from the boot context. Returns only
    /// after [`Self::request_shutdown`].
    ///
    /// # Safety
    ///
    /// CPU Lock must be active and the scheduler fully initialized. Must be
    /// called at most once.
    unsafe fn dispatch_first(next: *const Self::Context);

    /// Wait for something to happen. Called in a loop by the idle thread,
    /// with CPU Lock inactive.
    ///
    /// # Safety
    ///
    /// Only the idle thread may call this.
    unsafe fn idle();

    /// Make [`Self::dispatch_first`] return.
    ///
    /// # Safety
    ///
    /// The kernel must have been started.
    unsafe fn request_shutdown();
}

/// What a newly created context runs, passed to [`Port::create_context`].
#[derive(Debug, Clone, Copy)]
pub struct ThreadEntry {
    pub entry: fn(usize),
    pub param: usize,
    /// Run if `entry` returns. Never returns; it retires the thread.
    pub finalizer: fn(usize) -> !,
    pub finalizer_param: usize,
}

/// A stack for a new thread.
#[derive(Debug, Clone, Copy)]
pub struct StackRegion {
    pub start: *mut u8,
    pub len: usize,
}

impl StackRegion {
    /// An empty region, for ports that provide stacks themselves.
    pub const fn empty() -> Self {
        Self {
            start: core::ptr::null_mut(),
            len: 0,
        }
    }
}

/// Parameters for [`Kernel::spawn`].
#[derive(Debug, Clone, Copy)]
pub struct ThreadParams {
    pub entry: fn(usize),
    pub param: usize,
    /// Must be in the user range `1..=255`.
    pub priority: Priority,
    pub stack: StackRegion,
}

/// Compile-time kernel configuration, passed to [`Kernel::new`].
#[derive(Debug, Clone, Copy)]
pub struct KernelConfig {
    /// When `Some`, a running thread that exhausts this many ticks yields to
    /// its equal-priority peers. When `None`, equal-priority threads run
    /// until they block or yield.
    pub round_robin_quantum: Option<NonZeroU32>,
}

impl KernelConfig {
    pub const DEFAULT: Self = Self {
        round_robin_quantum: None,
    };
}

/// An instance of the kernel. See the [crate documentation](crate).
///
/// Store it in a `static` and hand `&'static` references around; the
/// blocking objects and the spawning operations require `'static` because
/// threads and wait queues keep references to it.
pub struct Kernel<P: Port> {
    pub(crate) threads: ThreadArena<P>,
    pub(crate) ready_queue: ThreadList<P>,
    /// The arena index of the running thread. `None` until the first
    /// dispatch.
    pub(crate) current: CpuLockCell<P, Option<u8>>,
    pub(crate) timeouts: TimeoutGlobals<P>,
    started: CpuLockCell<P, bool>,
    pub(crate) quantum: Option<NonZeroU32>,
}

impl<P: Port> fmt::Debug for Kernel<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("self", &(self as *const _))
            .field("current", &self.current)
            .field("started", &self.started)
            .field("quantum", &self.quantum)
            .finish_non_exhaustive()
    }
}

impl<P: Port> Kernel<P> {
    pub const fn new(cfg: KernelConfig) -> Self {
        Self {
            threads: Init::INIT,
            ready_queue: Init::INIT,
            current: Init::INIT,
            timeouts: Init::INIT,
            started: Init::INIT,
            quantum: cfg.round_robin_quantum,
        }
    }

    /// Create a thread and make it ready. Callable both before and after
    /// [`Self::start`]; if the new thread outranks the caller, it runs
    /// before `spawn` returns.
    pub fn spawn(&'static self, params: ThreadParams) -> Result<ThreadId, SpawnError> {
        if params.priority == thread::IDLE_PRIORITY {
            return Err(SpawnError::BadParam);
        }
        let mut lock = klock::lock_cpu::<P>()?;

        let idx = self
            .threads
            .find_free(lock.borrow_mut())
            .ok_or(SpawnError::NoFreeSlot)?;

        let entry = ThreadEntry {
            entry: params.entry,
            param: params.param,
            finalizer: thread_finalizer::<P>,
            finalizer_param: self as *const Self as usize,
        };
        // Safety: the caller of `spawn` vouches for the stack by providing
        // it; everything else is kernel-controlled
        let context = unsafe { P::create_context(entry, params.stack) };

        let cb = self.threads.cb(idx);
        cb.base_priority.replace(&mut *lock, params.priority);
        cb.effective_priority.replace(&mut *lock, params.priority);
        cb.wakeup_message.replace(&mut *lock, WakeupMessage::Ok);
        cb.wait_target.replace(&mut *lock, None);
        cb.last_mutex_held.replace(&mut *lock, None);
        cb.quantum_ticks.replace(&mut *lock, 0);
        cb.context.replace(&mut *lock, Some(context));
        let generation = cb.generation.get(&*lock);

        thread::make_ready(self, lock.borrow_mut(), idx);
        if self.started.get(&*lock) {
            thread::reschedule(self, lock.borrow_mut());
        }
        Ok(ThreadId {
            index: idx,
            generation,
        })
    }

    /// Start the scheduler: create the idle thread on `idle_stack` and
    /// dispatch the highest-priority ready thread. Returns only after
    /// [`Self::shutdown`].
    pub fn start(&'static self, idle_stack: StackRegion) -> Result<(), StartError> {
        let mut lock = klock::lock_cpu::<P>()?;
        if self.started.get(&*lock) {
            return Err(StartError::BadObjectState);
        }

        let entry = ThreadEntry {
            entry: idle_entry::<P>,
            param: 0,
            finalizer: thread_finalizer::<P>,
            finalizer_param: self as *const Self as usize,
        };
        // Safety: the caller provides the idle stack
        let context = unsafe { P::create_context(entry, idle_stack) };

        let cb = self.threads.cb(thread::IDLE_INDEX);
        cb.base_priority.replace(&mut *lock, thread::IDLE_PRIORITY);
        cb.effective_priority
            .replace(&mut *lock, thread::IDLE_PRIORITY);
        cb.context.replace(&mut *lock, Some(context));
        thread::make_ready(self, lock.borrow_mut(), thread::IDLE_INDEX);

        self.started.replace(&mut *lock, true);

        // The idle thread is in the queue, so it cannot be empty
        let next = match self
            .ready_queue
            .pop_front(&self.threads, lock.borrow_mut())
        {
            Some(next) => next,
            None => unreachable!("ready queue is empty"),
        };
        self.threads
            .cb(next)
            .st
            .replace(&mut *lock, ThreadSt::Running);
        self.threads
            .cb(next)
            .quantum_ticks
            .replace(&mut *lock, self.quantum.map_or(0, |q| q.get()));
        self.current.replace(&mut *lock, Some(next));
        let next_ctx = match self.threads.cb(next).context.read(&*lock) {
            Some(ctx) => ctx as *const P::Context,
            None => unreachable!("dispatched thread has no context"),
        };

        // Ownership of the CPU Lock state transfers to the first thread,
        // which releases it on its way into its entry function
        forget(lock);
        // Safety: CPU Lock is active and the scheduler state is complete
        unsafe { P::dispatch_first(next_ctx) };
        Ok(())
    }

    /// Ask the port to wind down; [`Self::start`] returns in response.
    pub fn shutdown(&self) {
        // Safety: reaching any kernel API implies the kernel was started
        unsafe { P::request_shutdown() }
    }

    /// Retire the calling thread. Threads that return from their entry
    /// function end up here automatically.
    ///
    /// Panics if called while CPU Lock is active or while the thread still
    /// holds a mutex; neither has a recoverable answer.
    pub fn exit_thread(&self) -> ! {
        let Ok(mut lock) = klock::lock_cpu::<P>() else {
            panic!("thread exit while CPU Lock is active");
        };
        let cur = match thread::current_index(self, lock.borrow_mut()) {
            Some(cur) => cur,
            None => panic!("thread exit without a current thread"),
        };
        debug_assert_ne!(cur, thread::IDLE_INDEX, "the idle thread cannot exit");

        let cb = self.threads.cb(cur);
        if cb.last_mutex_held.get(&*lock).is_some() {
            panic!("thread exit while holding a mutex");
        }

        cb.st.replace(&mut *lock, ThreadSt::Stopped);
        let generation = cb.generation.get(&*lock);
        cb.generation.replace(&mut *lock, generation.wrapping_add(1));
        // Retire the execution context; outstanding `ThreadId`s are now
        // stale and will be rejected by the generation check
        cb.context.replace(&mut *lock, None);

        // The idle thread never blocks or exits, so the queue is never empty
        let next = match self
            .ready_queue
            .pop_front(&self.threads, lock.borrow_mut())
        {
            Some(next) => next,
            None => unreachable!("ready queue is empty"),
        };
        self.threads
            .cb(next)
            .st
            .replace(&mut *lock, ThreadSt::Running);
        self.threads
            .cb(next)
            .quantum_ticks
            .replace(&mut *lock, self.quantum.map_or(0, |q| q.get()));
        self.current.replace(&mut *lock, Some(next));
        let next_ctx = match self.threads.cb(next).context.read(&*lock) {
            Some(ctx) => ctx as *const P::Context,
            None => unreachable!("dispatched thread has no context"),
        };

        // CPU Lock transfers to `next`; this context is never resumed
        forget(lock);
        // Safety: CPU Lock is active and `next_ctx` is a live context
        unsafe { P::exit_and_switch(next_ctx) }
    }

    /// Let an equal- or higher-priority ready thread run. A no-op when the
    /// caller outranks every ready thread.
    pub fn yield_now(&self) -> Result<(), YieldError> {
        let mut lock = klock::lock_cpu::<P>()?;
        thread::expect_waitable_context(self, lock.borrow_mut())?;
        thread::yield_current(self, lock.borrow_mut());
        Ok(())
    }

    /// Block the calling thread for `ticks` ticks. Zero is rejected; use
    /// [`Self::yield_now`] to give up the CPU without sleeping.
    pub fn sleep(&self, ticks: u32) -> Result<(), SleepError> {
        let Some(ticks) = NonZeroU32::new(ticks) else {
            return Err(SleepError::BadParam);
        };
        let mut lock = klock::lock_cpu::<P>()?;
        let cur = thread::expect_waitable_context(self, lock.borrow_mut())?;

        // Not waiting on any object; only the timeout can end this sleep
        self.threads.cb(cur).wait_target.replace(&mut *lock, None);
        let msg = thread::go_sleep_timeout(self, lock.borrow_mut(), Timeout::Ticks(ticks));
        debug_assert_eq!(msg, WakeupMessage::Timeout);
        Ok(())
    }

    /// The handle of the calling thread, or `None` in the boot context.
    pub fn current_thread(&self) -> Result<Option<ThreadId>, BadContextError> {
        let mut lock = klock::lock_cpu::<P>()?;
        Ok(
            thread::current_index(self, lock.borrow_mut()).map(|index| ThreadId {
                index,
                generation: self.threads.cb(index).generation.get(&*lock),
            }),
        )
    }

    /// A thread's effective priority: its base priority, possibly raised by
    /// priority inheritance.
    pub fn thread_priority(&self, thread: ThreadId) -> Result<Priority, GetPriorityError> {
        let mut lock = klock::lock_cpu::<P>()?;
        let idx = self.threads.get(thread, lock.borrow_mut())?;
        Ok(self.threads.cb(idx).effective_priority.get(&*lock))
    }

    /// Change a thread's base priority, immediately repositioning it in the
    /// scheduler. May preempt the caller.
    pub fn set_priority(
        &self,
        thread: ThreadId,
        priority: Priority,
    ) -> Result<(), SetPriorityError> {
        if priority == thread::IDLE_PRIORITY {
            return Err(SetPriorityError::BadParam);
        }
        let mut lock = klock::lock_cpu::<P>()?;
        let idx = self.threads.get(thread, lock.borrow_mut())?;
        thread::set_priority(self, lock.borrow_mut(), idx, priority);
        Ok(())
    }

    /// Ticks elapsed since [`Self::start`].
    pub fn time(&self) -> Result<u64, BadContextError> {
        let mut lock = klock::lock_cpu::<P>()?;
        Ok(self.timeouts.now(lock.borrow_mut()))
    }

    /// Advance kernel time by one tick: fire due timers, charge the running
    /// thread's round-robin quantum, and preempt if the tick made a
    /// higher-ranked (or, on quantum expiry, equal-ranked) thread ready.
    ///
    /// Ports call this from their tick interrupt handler, with
    /// [`assume_cpu_lock`] when the handler already holds CPU Lock; hosted
    /// setups may call it from an ordinary thread.
    pub fn timer_tick(&self) -> Result<(), BadContextError> {
        let mut lock = klock::lock_cpu::<P>()?;
        self.timer_tick_with(lock.borrow_mut());
        Ok(())
    }

    /// [`Self::timer_tick`] under a held kernel lock.
    pub fn timer_tick_with(&self, mut lock: CpuLockTokenRefMut<'_, P>) {
        self.timeouts.handle_tick(self, lock.borrow_mut());
        thread::consume_quantum(self, lock.borrow_mut());
        thread::tick_preemption(self, lock);
    }

    /// Arm a one-shot timer: after `delay` ticks, `callback` runs with CPU
    /// Lock held, receiving `param`.
    pub fn arm_timer(
        &self,
        delay: u32,
        callback: TimerCallback<P>,
        param: usize,
    ) -> Result<TimerToken, ArmTimerError> {
        let mut lock = klock::lock_cpu::<P>()?;
        self.timeouts.arm(lock.borrow_mut(), delay, callback, param)
    }

    /// [`Self::arm_timer`] under a held kernel lock.
    pub fn arm_timer_with(
        &self,
        lock: CpuLockTokenRefMut<'_, P>,
        delay: u32,
        callback: TimerCallback<P>,
        param: usize,
    ) -> Result<TimerToken, ArmTimerError> {
        self.timeouts.arm(lock, delay, callback, param)
    }

    /// Disarm a timer. Returns `true` if it was still armed; `false` means
    /// it already fired or was already reset, which is harmless.
    pub fn reset_timer(&self, token: TimerToken) -> Result<bool, BadContextError> {
        let mut lock = klock::lock_cpu::<P>()?;
        Ok(self.timeouts.reset(lock.borrow_mut(), token))
    }

    /// [`Self::reset_timer`] under a held kernel lock.
    pub fn reset_timer_with(&self, lock: CpuLockTokenRefMut<'_, P>, token: TimerToken) -> bool {
        self.timeouts.reset(lock, token)
    }
}

/// The body of the built-in idle thread.
fn idle_entry<P: Port>(_: usize) {
    loop {
        // Safety: this is the idle thread; `Kernel::start` created it with
        // this entry function
        unsafe { P::idle() };
    }
}

/// The finalizer installed on every spawned thread. `param` is the address
/// of the owning [`Kernel`].
fn thread_finalizer<P: Port>(param: usize) -> ! {
    // Safety: `spawn` set the parameter to the address of the kernel, which
    // lives in a static
    let kernel = unsafe { &*(param as *const Kernel<P>) };
    kernel.exit_thread()
}

/// Define a minimal [`Port`] for unit tests: CPU Lock is a per-type atomic
/// flag, and contexts are inert (any test that reaches a real context switch
/// is a bug).
///
/// Each expansion mints a fresh type with its own lock flag, so tests stay
/// independent even when the harness runs them in parallel.
#[cfg(test)]
macro_rules! define_test_port {
    ($name:ident) => {
        $crate::define_test_port!($name, in_interrupt: false);
    };
    ($name:ident, in_interrupt: $in_interrupt:expr) => {
        struct $name;

        impl $name {
            fn lock_flag() -> &'static ::std::sync::atomic::AtomicBool {
                static FLAG: ::std::sync::atomic::AtomicBool =
                    ::std::sync::atomic::AtomicBool::new(false);
                &FLAG
            }
        }

        impl $crate::Port for $name {
            type Context = ();

            unsafe fn try_enter_cpu_lock() -> bool {
                !Self::lock_flag().swap(true, ::std::sync::atomic::Ordering::Acquire)
            }

            unsafe fn leave_cpu_lock() {
                Self::lock_flag().store(false, ::std::sync::atomic::Ordering::Release);
            }

            fn is_cpu_lock_active() -> bool {
                Self::lock_flag().load(::std::sync::atomic::Ordering::Relaxed)
            }

            fn is_interrupt_context() -> bool {
                $in_interrupt
            }

            unsafe fn create_context(
                _entry: $crate::ThreadEntry,
                _stack: $crate::StackRegion,
            ) -> Self::Context {
            }

            unsafe fn context_switch(_next: *const (), _prev: *const ()) {
                unreachable!("context switch in a unit test");
            }

            unsafe fn exit_and_switch(_next: *const ()) -> ! {
                unreachable!("context switch in a unit test");
            }

            unsafe fn dispatch_first(_next: *const ()) {
                unreachable!("dispatch in a unit test");
            }

            unsafe fn idle() {}

            unsafe fn request_shutdown() {}
        }
    };
}

#[cfg(test)]
pub(crate) use define_test_port;
