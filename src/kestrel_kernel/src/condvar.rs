//! Condition variables.
use core::fmt;

use crate::{
    error::{BadContextError, WaitCondvarError},
    klock::{self, CpuLockTokenRefMut},
    mutex::Mutex,
    thread::{self, WaitTarget, WakeupMessage},
    timeout::Timeout,
    wait::WaitQueue,
    Kernel, Port,
};

/// What ended a successful [`Condvar::wait`].
///
/// A waiter woken by [`Condvar::broadcast`] learns that every peer was woken
/// too, which some protocols use to invalidate cached state wholesale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondvarWait {
    /// Woken by [`Condvar::signal`].
    Signaled,
    /// Woken by [`Condvar::broadcast`].
    Broadcast,
}

/// A condition variable.
///
/// A condition variable is just a wait queue; the protected predicate lives
/// behind a [`Mutex`] chosen by convention. Pair each condition variable
/// with exactly one mutex, and re-check the predicate in a loop around
/// [`Self::wait`].
pub struct Condvar<P: Port> {
    wait_queue: WaitQueue<P>,
}

impl<P: Port> fmt::Debug for Condvar<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Condvar")
            .field("self", &(self as *const _))
            .finish_non_exhaustive()
    }
}

impl<P: Port> Condvar<P> {
    pub const fn new() -> Self {
        Self {
            wait_queue: WaitQueue::new(),
        }
    }

    /// Atomically release `mutex` and wait on the condition variable; on
    /// wakeup, reacquire `mutex` before returning.
    ///
    /// The unlock and the enqueue happen inside one critical section, so a
    /// signal issued by whoever takes the mutex next can never slip in
    /// between them and get lost.
    ///
    /// The mutex is reacquired on every return path, including `Timeout`.
    /// `mutex` must be owned by the calling thread and be its most recently
    /// locked mutex still held.
    pub fn wait(
        &'static self,
        kernel: &Kernel<P>,
        mutex: &'static Mutex<P>,
        timeout: Timeout,
    ) -> Result<CondvarWait, WaitCondvarError> {
        let mut lock = klock::lock_cpu::<P>()?;
        let cur = thread::expect_waitable_context(kernel, lock.borrow_mut())?;

        if mutex.owner_index(lock.borrow_mut()) != Some(cur) {
            return Err(WaitCondvarError::NotOwner);
        }

        if timeout == Timeout::Immediate {
            // Equivalent to an unlock, a wait that times out at once, and a
            // relock; holding on to the mutex throughout is indistinguishable
            return Err(WaitCondvarError::Timeout);
        }

        // Release the mutex without rescheduling: the wakeup of the next
        // owner (if any) and our own enqueue must happen in the same
        // critical section
        mutex.unlock_core(kernel, lock.borrow_mut(), cur);

        let msg = self.wait_queue.wait(
            kernel,
            lock.borrow_mut(),
            WaitTarget::Queue(&self.wait_queue),
            timeout,
        );

        mutex.relock(kernel, lock.borrow_mut(), cur);

        match msg {
            WakeupMessage::Ok => Ok(CondvarWait::Signaled),
            WakeupMessage::Reset => Ok(CondvarWait::Broadcast),
            WakeupMessage::Timeout => Err(WaitCondvarError::Timeout),
        }
    }

    /// Wake the highest-priority waiter, which may preempt the caller.
    /// A no-op if no thread is waiting.
    ///
    /// Not callable from interrupt context; interrupt handlers use
    /// [`Self::signal_with`].
    pub fn signal(&self, kernel: &Kernel<P>) -> Result<(), BadContextError> {
        thread::expect_thread_context::<P>()?;
        let mut lock = klock::lock_cpu::<P>()?;
        self.wait_queue
            .wake_one(kernel, lock.borrow_mut(), WakeupMessage::Ok);
        Ok(())
    }

    /// [`Self::signal`] under a held kernel lock. The woken thread is only
    /// made ready; the caller reschedules afterwards.
    pub fn signal_with(&self, kernel: &Kernel<P>, lock: CpuLockTokenRefMut<'_, P>) {
        self.wait_queue.wake_one_ready(kernel, lock, WakeupMessage::Ok);
    }

    /// Wake every waiter.
    ///
    /// Not callable from interrupt context; interrupt handlers use
    /// [`Self::broadcast_with`].
    pub fn broadcast(&self, kernel: &Kernel<P>) -> Result<(), BadContextError> {
        thread::expect_thread_context::<P>()?;
        let mut lock = klock::lock_cpu::<P>()?;
        self.broadcast_with(kernel, lock.borrow_mut());
        thread::reschedule(kernel, lock.borrow_mut());
        Ok(())
    }

    /// [`Self::broadcast`] under a held kernel lock. The woken threads are
    /// only made ready; the caller reschedules afterwards.
    pub fn broadcast_with(&self, kernel: &Kernel<P>, lock: CpuLockTokenRefMut<'_, P>) {
        self.wait_queue
            .wake_all_ready(kernel, lock, WakeupMessage::Reset);
    }
}
