//! Wait queues for synchronization objects.
use core::fmt;

use crate::{
    klock::CpuLockTokenRefMut,
    thread::{self, ThreadList, WaitTarget, WakeupMessage},
    timeout::Timeout,
    utils::Init,
    Kernel, Port,
};

/// A priority-ordered queue of blocked threads, embedded in each
/// synchronization object. FIFO among equal priorities.
pub(crate) struct WaitQueue<P: Port> {
    list: ThreadList<P>,
}

impl<P: Port> WaitQueue<P> {
    pub(crate) const fn new() -> Self {
        Self {
            list: ThreadList::INIT,
        }
    }
}

impl<P: Port> Init for WaitQueue<P> {
    const INIT: Self = Self::new();
}

impl<P: Port> fmt::Debug for WaitQueue<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WaitQueue")
            .field("self", &(self as *const _))
            .finish_non_exhaustive()
    }
}

impl<P: Port> WaitQueue<P> {
    /// Block the current thread on this queue until it is woken or the
    /// timeout fires, and return the delivered wakeup message.
    ///
    /// `target` is recorded in the thread's control block so that the
    /// timeout path can find and unlink it; for a mutex it additionally
    /// lets priority inheritance follow the blocking chain. The caller has
    /// verified the context is waitable and that `timeout` is not
    /// `Immediate`.
    pub(crate) fn wait(
        &self,
        kernel: &Kernel<P>,
        mut lock: CpuLockTokenRefMut<'_, P>,
        target: WaitTarget<P>,
        timeout: Timeout,
    ) -> WakeupMessage {
        let cur = match thread::current_index(kernel, lock.borrow_mut()) {
            Some(cur) => cur,
            None => unreachable!("waiting without a current thread"),
        };
        kernel
            .threads
            .cb(cur)
            .wait_target
            .replace(&mut *lock, Some(target));
        self.list
            .insert_behind(&kernel.threads, cur, lock.borrow_mut());

        thread::go_sleep_timeout(kernel, lock, timeout)
    }

    /// Dequeue the highest-priority waiter and wake it with `msg`, possibly
    /// dispatching it immediately. Returns `true` if a thread was woken.
    pub(crate) fn wake_one(
        &self,
        kernel: &Kernel<P>,
        mut lock: CpuLockTokenRefMut<'_, P>,
        msg: WakeupMessage,
    ) -> bool {
        match self.dequeue_one(kernel, lock.borrow_mut()) {
            Some(idx) => {
                thread::wakeup(kernel, lock, idx, msg);
                true
            }
            None => false,
        }
    }

    /// Dequeue the highest-priority waiter and make it ready with `msg`,
    /// without rescheduling. For use under a held kernel lock (interrupt
    /// context or composed operations); the caller reschedules afterwards.
    pub(crate) fn wake_one_ready(
        &self,
        kernel: &Kernel<P>,
        mut lock: CpuLockTokenRefMut<'_, P>,
        msg: WakeupMessage,
    ) -> bool {
        match self.dequeue_one(kernel, lock.borrow_mut()) {
            Some(idx) => {
                kernel
                    .threads
                    .cb(idx)
                    .wakeup_message
                    .replace(&mut *lock, msg);
                thread::make_ready(kernel, lock, idx);
                true
            }
            None => false,
        }
    }

    /// Make every waiter ready with `msg`. Returns the number of threads
    /// woken. The caller reschedules afterwards.
    pub(crate) fn wake_all_ready(
        &self,
        kernel: &Kernel<P>,
        mut lock: CpuLockTokenRefMut<'_, P>,
        msg: WakeupMessage,
    ) -> usize {
        let mut count = 0;
        while self.wake_one_ready(kernel, lock.borrow_mut(), msg) {
            count += 1;
        }
        count
    }

    /// Dequeue the highest-priority waiter, clearing its wait bookkeeping.
    /// Delivering a wakeup is up to the caller.
    pub(crate) fn dequeue_one(
        &self,
        kernel: &Kernel<P>,
        mut lock: CpuLockTokenRefMut<'_, P>,
    ) -> Option<u8> {
        let idx = self.list.pop_front(&kernel.threads, lock.borrow_mut())?;
        kernel
            .threads
            .cb(idx)
            .wait_target
            .replace(&mut *lock, None);
        Some(idx)
    }

    /// The arena index of the highest-priority waiter.
    #[cfg(feature = "priority_inheritance")]
    pub(crate) fn first_waiter(&self, lock: CpuLockTokenRefMut<'_, P>) -> Option<u8> {
        self.list.first(lock)
    }

    /// Remove a specific waiter. Used by the timeout path, which has already
    /// cleared the thread's `wait_target`.
    pub(crate) fn unlink(&self, kernel: &Kernel<P>, lock: CpuLockTokenRefMut<'_, P>, idx: u8) {
        self.list.remove(&kernel.threads, idx, lock);
    }

    /// Re-sort a waiter after its effective priority changed.
    pub(crate) fn reposition(
        &self,
        kernel: &Kernel<P>,
        mut lock: CpuLockTokenRefMut<'_, P>,
        idx: u8,
    ) {
        self.list.remove(&kernel.threads, idx, lock.borrow_mut());
        self.list.insert_behind(&kernel.threads, idx, lock);
    }
}
