//! Simulator port: runs the Kestrel kernel on hosted `std` threads.
//!
//! Every kernel thread is backed by a real host thread, but a *gate* per
//! thread ensures at most one of them executes at a time, which is exactly
//! the execution model the kernel expects from a uniprocessor port. A
//! "context switch" opens the next thread's gate and blocks on the calling
//! thread's own gate; CPU Lock is a plain atomic flag since there are no
//! real interrupts to mask.
//!
//! Use [`use_hosted_port!`] to mint a port type, then hand it to the kernel:
//!
//! ```
//! use kestrel_kernel::{Kernel, KernelConfig, StackRegion, ThreadParams};
//!
//! kestrel_port_std::use_hosted_port!(struct SimPort);
//! static KERNEL: Kernel<SimPort> = Kernel::new(KernelConfig::DEFAULT);
//!
//! fn main_thread(_: usize) {
//!     KERNEL.shutdown();
//! }
//!
//! KERNEL
//!     .spawn(ThreadParams {
//!         entry: main_thread,
//!         param: 0,
//!         priority: 1,
//!         stack: StackRegion::empty(),
//!     })
//!     .unwrap();
//! KERNEL.start(StackRegion::empty()).unwrap();
//! ```
//!
//! There is no simulated tick interrupt; tests that need time typically
//! dedicate a low-priority thread to calling
//! [`timer_tick`](kestrel_kernel::Kernel::timer_tick) in a loop.
#![deny(unsafe_op_in_unsafe_fn)]

use slab::Slab;
use spin::Mutex as SpinMutex;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    thread,
};

use kestrel_kernel::ThreadEntry;

/// Used by [`use_hosted_port!`].
#[doc(hidden)]
pub use kestrel_kernel;
/// Used by [`use_hosted_port!`].
#[doc(hidden)]
pub use once_cell::sync::Lazy;

/// A binary gate a host thread blocks on while its kernel thread is not
/// running. Opening it lets the thread take exactly one turn; `wait`
/// consumes the opening.
struct ThreadGate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl ThreadGate {
    fn new() -> Self {
        Self {
            open: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cond.wait(open).unwrap();
        }
        *open = false;
    }

    fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cond.notify_one();
    }
}

/// The saved "execution state" of a kernel thread: a key into the port's
/// gate table. Dropping it (when the kernel retires the thread) removes the
/// gate; the host thread itself parks forever in `exit_and_switch`.
pub struct ThreadContext {
    state: &'static State,
    key: usize,
}

impl std::fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ThreadContext")
            .field("key", &self.key)
            .finish()
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        self.state.threads.lock().remove(self.key);
    }
}

/// The internal state of the port. One per port type, created lazily by
/// [`use_hosted_port!`].
#[doc(hidden)]
pub struct State {
    cpu_lock: AtomicBool,
    threads: SpinMutex<Slab<Arc<ThreadGate>>>,
    shutdown_flag: Mutex<bool>,
    shutdown_cond: Condvar,
}

impl State {
    pub fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        Self {
            cpu_lock: AtomicBool::new(false),
            threads: SpinMutex::new(Slab::new()),
            shutdown_flag: Mutex::new(false),
            shutdown_cond: Condvar::new(),
        }
    }

    pub fn try_enter_cpu_lock(&self) -> bool {
        !self.cpu_lock.swap(true, Ordering::Acquire)
    }

    pub fn leave_cpu_lock(&self) {
        self.cpu_lock.store(false, Ordering::Release);
    }

    pub fn is_cpu_lock_active(&self) -> bool {
        self.cpu_lock.load(Ordering::Relaxed)
    }

    fn gate(&self, key: usize) -> Arc<ThreadGate> {
        Arc::clone(&self.threads.lock()[key])
    }

    /// Back a new kernel thread with a host thread. The host thread blocks
    /// on its gate until first dispatched, then releases CPU Lock (handed
    /// over by the dispatcher) and runs the entry function.
    pub fn create_context(&'static self, entry: ThreadEntry) -> ThreadContext {
        let gate = Arc::new(ThreadGate::new());
        let key = self.threads.lock().insert(Arc::clone(&gate));
        log::trace!("creating thread {key}");

        let state: &'static State = self;
        thread::Builder::new()
            .name(format!("kestrel thread {key}"))
            .spawn(move || {
                gate.wait();
                state.leave_cpu_lock();
                (entry.entry)(entry.param);
                (entry.finalizer)(entry.finalizer_param)
            })
            .expect("failed to spawn a host thread");

        ThreadContext { state: self, key }
    }

    /// # Safety
    ///
    /// `next` and `prev` must point to live [`ThreadContext`]s; see
    /// [`kestrel_kernel::Port::context_switch`].
    pub unsafe fn context_switch(next: *const ThreadContext, prev: *const ThreadContext) {
        // Safety: the kernel guarantees both contexts are live
        let (state, next_key) = unsafe { ((*next).state, (*next).key) };
        let prev_key = unsafe { (*prev).key };
        log::trace!("context switch: {prev_key} -> {next_key}");

        // Clone both gates before opening anything; once `next` runs it may
        // mutate the gate table
        let next_gate = state.gate(next_key);
        let prev_gate = state.gate(prev_key);
        next_gate.open();
        prev_gate.wait();
    }

    /// # Safety
    ///
    /// See [`kestrel_kernel::Port::exit_and_switch`].
    pub unsafe fn exit_and_switch(next: *const ThreadContext) -> ! {
        // Safety: the kernel guarantees the context is live
        let (state, next_key) = unsafe { ((*next).state, (*next).key) };
        log::trace!("exiting; dispatching {next_key}");
        state.gate(next_key).open();
        // This kernel thread is gone; the backing host thread has nothing
        // left to do
        loop {
            thread::park();
        }
    }

    /// # Safety
    ///
    /// See [`kestrel_kernel::Port::dispatch_first`].
    pub unsafe fn dispatch_first(next: *const ThreadContext) {
        // Safety: the kernel guarantees the context is live
        let (state, next_key) = unsafe { ((*next).state, (*next).key) };
        log::trace!("dispatching the first thread: {next_key}");
        state.gate(next_key).open();

        // The boot context stands by until shutdown is requested
        let mut down = state.shutdown_flag.lock().unwrap();
        while !*down {
            down = state.shutdown_cond.wait(down).unwrap();
        }
    }

    pub fn idle(&self) {
        // Nothing to simulate; just do not hog the host CPU
        thread::sleep(std::time::Duration::from_millis(1));
    }

    pub fn request_shutdown(&self) {
        log::trace!("shutdown requested");
        *self.shutdown_flag.lock().unwrap() = true;
        self.shutdown_cond.notify_all();
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// Define a type implementing [`kestrel_kernel::Port`] backed by hosted
/// threads. Each expansion gets its own [`State`], so multiple kernels in
/// one process (e.g., parallel tests) do not interfere.
#[macro_export]
macro_rules! use_hosted_port {
    ($vis:vis struct $Port:ident) => {
        $vis struct $Port;

        impl $Port {
            fn port_state() -> &'static $crate::State {
                static STATE: $crate::Lazy<$crate::State> = $crate::Lazy::new($crate::State::new);
                &STATE
            }
        }

        impl $crate::kestrel_kernel::Port for $Port {
            type Context = $crate::ThreadContext;

            unsafe fn try_enter_cpu_lock() -> bool {
                Self::port_state().try_enter_cpu_lock()
            }

            unsafe fn leave_cpu_lock() {
                Self::port_state().leave_cpu_lock()
            }

            fn is_cpu_lock_active() -> bool {
                Self::port_state().is_cpu_lock_active()
            }

            fn is_interrupt_context() -> bool {
                false
            }

            unsafe fn create_context(
                entry: $crate::kestrel_kernel::ThreadEntry,
                _stack: $crate::kestrel_kernel::StackRegion,
            ) -> Self::Context {
                // Host threads bring their own stacks
                Self::port_state().create_context(entry)
            }

            unsafe fn context_switch(
                next: *const $crate::ThreadContext,
                prev: *const $crate::ThreadContext,
            ) {
                // Safety: forwarded from the kernel
                unsafe { $crate::State::context_switch(next, prev) }
            }

            unsafe fn exit_and_switch(next: *const $crate::ThreadContext) -> ! {
                // Safety: forwarded from the kernel
                unsafe { $crate::State::exit_and_switch(next) }
            }

            unsafe fn dispatch_first(next: *const $crate::ThreadContext) {
                // Safety: forwarded from the kernel
                unsafe { $crate::State::dispatch_first(next) }
            }

            unsafe fn idle() {
                Self::port_state().idle()
            }

            unsafe fn request_shutdown() {
                Self::port_state().request_shutdown()
            }
        }
    };
}
