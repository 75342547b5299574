//! Counting semaphores.
use core::fmt;

use crate::{
    error::{
        BadContextError, PollSemaphoreError, QueueOverflowError, SignalSemaphoreError,
        WaitSemaphoreError,
    },
    klock::{self, CpuLockTokenRefMut},
    thread::{self, WaitTarget, WakeupMessage},
    timeout::Timeout,
    wait::WaitQueue,
    Kernel, Port,
};

/// A counting semaphore: a counter that never goes below zero, plus a
/// priority-ordered queue of threads waiting for it to become positive.
///
/// When a permit is signaled while threads are waiting, the counter is left
/// untouched and the permit is handed directly to the highest-priority
/// waiter, so a permit can never be "stolen" by a thread that starts waiting
/// later.
///
/// The `*_with` methods take a [`CpuLockTokenRefMut`] and are safe to call
/// from interrupt context or from a timer callback; the plain methods
/// acquire the kernel lock themselves and may reschedule.
pub struct Semaphore<P: Port> {
    count: klock::CpuLockCell<P, u32>,
    wait_queue: WaitQueue<P>,
}

impl<P: Port> fmt::Debug for Semaphore<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("self", &(self as *const _))
            .field("count", &self.count)
            .finish_non_exhaustive()
    }
}

impl<P: Port> Semaphore<P> {
    /// Construct a semaphore holding `initial` permits.
    pub const fn new(initial: u32) -> Self {
        Self {
            count: klock::CpuLockCell::new(initial),
            wait_queue: WaitQueue::new(),
        }
    }

    /// Take a permit, blocking for at most `timeout`.
    ///
    /// With [`Timeout::Immediate`], a missing permit is reported as
    /// `Timeout` without ever suspending the caller.
    pub fn wait(
        &'static self,
        kernel: &Kernel<P>,
        timeout: Timeout,
    ) -> Result<(), WaitSemaphoreError> {
        let mut lock = klock::lock_cpu::<P>()?;
        thread::expect_waitable_context(kernel, lock.borrow_mut())?;

        let count = self.count.get(&*lock);
        if count > 0 {
            self.count.replace(&mut *lock, count - 1);
            return Ok(());
        }

        if timeout == Timeout::Immediate {
            return Err(WaitSemaphoreError::Timeout);
        }

        match self.wait_queue.wait(
            kernel,
            lock.borrow_mut(),
            WaitTarget::Queue(&self.wait_queue),
            timeout,
        ) {
            WakeupMessage::Ok => Ok(()),
            WakeupMessage::Timeout => Err(WaitSemaphoreError::Timeout),
            WakeupMessage::Reset => Err(WaitSemaphoreError::Reset),
        }
    }

    /// Take a permit only if one is available right now. Never blocks, but
    /// still requires the kernel lock to be inactive.
    pub fn try_wait(&self) -> Result<(), PollSemaphoreError> {
        let mut lock = klock::lock_cpu::<P>()?;
        let count = self.count.get(&*lock);
        if count > 0 {
            self.count.replace(&mut *lock, count - 1);
            Ok(())
        } else {
            Err(PollSemaphoreError::Timeout)
        }
    }

    /// Release one permit. If a thread is waiting, the permit transfers to
    /// the highest-priority waiter, which may preempt the caller.
    ///
    /// Not callable from interrupt context; interrupt handlers use
    /// [`Self::signal_with`].
    pub fn signal(&self, kernel: &Kernel<P>) -> Result<(), SignalSemaphoreError> {
        thread::expect_thread_context::<P>()?;
        let mut lock = klock::lock_cpu::<P>()?;
        if !self
            .wait_queue
            .wake_one(kernel, lock.borrow_mut(), WakeupMessage::Ok)
        {
            self.deposit(lock.borrow_mut())?;
        }
        Ok(())
    }

    /// [`Self::signal`] under a held kernel lock. The woken thread is only
    /// made ready; the wakeup takes effect when the caller reschedules (on
    /// interrupt exit, or when the lock guard is dropped and a reschedule is
    /// requested).
    pub fn signal_with(
        &self,
        kernel: &Kernel<P>,
        mut lock: CpuLockTokenRefMut<'_, P>,
    ) -> Result<(), QueueOverflowError> {
        if !self
            .wait_queue
            .wake_one_ready(kernel, lock.borrow_mut(), WakeupMessage::Ok)
        {
            self.deposit(lock)?;
        }
        Ok(())
    }

    fn deposit(&self, mut lock: CpuLockTokenRefMut<'_, P>) -> Result<(), QueueOverflowError> {
        let count = self.count.get(&*lock);
        let count = count
            .checked_add(1)
            .ok_or(QueueOverflowError::QueueOverflow)?;
        self.count.replace(&mut *lock, count);
        Ok(())
    }

    /// Wake every waiter with a `Reset` result and set the counter to
    /// `count`. Waiters observe [`WaitSemaphoreError::Reset`].
    ///
    /// Not callable from interrupt context; interrupt handlers use
    /// [`Self::reset_with`].
    pub fn reset(&self, kernel: &Kernel<P>, count: u32) -> Result<(), BadContextError> {
        thread::expect_thread_context::<P>()?;
        let mut lock = klock::lock_cpu::<P>()?;
        self.reset_with(kernel, lock.borrow_mut(), count);
        thread::reschedule(kernel, lock.borrow_mut());
        Ok(())
    }

    /// [`Self::reset`] under a held kernel lock. The woken threads are only
    /// made ready; the caller reschedules afterwards.
    pub fn reset_with(&self, kernel: &Kernel<P>, mut lock: CpuLockTokenRefMut<'_, P>, count: u32) {
        self.wait_queue
            .wake_all_ready(kernel, lock.borrow_mut(), WakeupMessage::Reset);
        self.count.replace(&mut *lock, count);
    }

    /// The number of permits currently available.
    pub fn count(&self) -> Result<u32, BadContextError> {
        let lock = klock::lock_cpu::<P>()?;
        Ok(self.count.get(&*lock))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KernelConfig;

    /// The self-locking wake forms may dispatch, so an interrupt handler
    /// gets `BadContext` and must go through the `*_with` forms.
    #[test]
    fn wake_operations_are_rejected_in_interrupt_context() {
        crate::define_test_port!(IsrPort, in_interrupt: true);
        static KERNEL: Kernel<IsrPort> = Kernel::new(KernelConfig::DEFAULT);
        static SEM: Semaphore<IsrPort> = Semaphore::new(0);

        assert_eq!(SEM.signal(&KERNEL), Err(SignalSemaphoreError::BadContext));
        assert_eq!(SEM.reset(&KERNEL, 1), Err(BadContextError::BadContext));

        // The lock-held forms stay available
        let mut lock = klock::lock_cpu::<IsrPort>().unwrap();
        SEM.signal_with(&KERNEL, lock.borrow_mut()).unwrap();
        assert_eq!(SEM.count.get(&*lock), 1);
    }
}
