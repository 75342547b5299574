//! Mutexes with optional priority inheritance.
use core::{fmt, ptr};

use crate::{
    error::{BadContextError, LockMutexError, TryLockMutexError, UnlockMutexError},
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    thread::{self, ThreadId, WaitTarget, WakeupMessage},
    timeout::Timeout,
    wait::WaitQueue,
    Kernel, Port, Priority,
};

/// A mutual-exclusion lock with direct ownership handoff.
///
/// Unlocking a contended mutex transfers ownership to the highest-priority
/// waiter instead of releasing it for grabs, so a lower-priority thread can
/// never barge in between the unlock and the waiter's wakeup.
///
/// With the `priority_inheritance` feature (on by default), a holder's
/// effective priority is raised to that of its highest-priority waiter,
/// transitively across chains of blocked holders, bounding priority
/// inversion.
///
/// Mutexes must be released in the reverse order of acquisition; the held
/// mutexes of a thread form a stack. An out-of-order [`Self::unlock`] is
/// rejected with `BadObjectState`.
pub struct Mutex<P: Port> {
    /// The arena index of the owning thread. A weak reference: the mutex
    /// never keeps a thread alive or vice versa.
    owner: CpuLockCell<P, Option<u8>>,

    /// The next entry in the owner's held-mutex stack (the one locked just
    /// before this one). Meaningful only while `owner` is `Some`.
    prev_held: CpuLockCell<P, Option<&'static Mutex<P>>>,

    wait_queue: WaitQueue<P>,
}

impl<P: Port> fmt::Debug for Mutex<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("self", &(self as *const _))
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

impl<P: Port> Mutex<P> {
    pub const fn new() -> Self {
        Self {
            owner: CpuLockCell::new(None),
            prev_held: CpuLockCell::new(None),
            wait_queue: WaitQueue::new(),
        }
    }

    /// Acquire the mutex, blocking without a time limit if it is held.
    ///
    /// Mutex waits are deliberately untimed: a timeout would leave the
    /// protected state's ownership ambiguous. Use [`Self::try_lock`] for a
    /// non-blocking attempt.
    pub fn lock(&'static self, kernel: &Kernel<P>) -> Result<(), LockMutexError> {
        let mut lock = klock::lock_cpu::<P>()?;
        let cur = thread::expect_waitable_context(kernel, lock.borrow_mut())?;

        match self.owner.get(&*lock) {
            None => {
                self.claim(kernel, lock.borrow_mut(), cur);
                Ok(())
            }
            Some(owner) if owner == cur => Err(LockMutexError::WouldDeadlock),
            Some(_) => {
                self.lock_slow(kernel, lock.borrow_mut(), cur);
                Ok(())
            }
        }
    }

    /// Acquire the mutex only if it is free right now.
    pub fn try_lock(&'static self, kernel: &Kernel<P>) -> Result<(), TryLockMutexError> {
        let mut lock = klock::lock_cpu::<P>()?;
        let cur = thread::expect_waitable_context(kernel, lock.borrow_mut())?;

        match self.owner.get(&*lock) {
            None => {
                self.claim(kernel, lock.borrow_mut(), cur);
                Ok(())
            }
            Some(owner) if owner == cur => Err(TryLockMutexError::WouldDeadlock),
            Some(_) => Err(TryLockMutexError::Timeout),
        }
    }

    /// Release the mutex. If threads are waiting, ownership transfers to the
    /// highest-priority waiter, which may preempt the caller.
    pub fn unlock(&'static self, kernel: &Kernel<P>) -> Result<(), UnlockMutexError> {
        let mut lock = klock::lock_cpu::<P>()?;
        let cur = thread::expect_waitable_context(kernel, lock.borrow_mut())?;

        if self.owner.get(&*lock) != Some(cur) {
            return Err(UnlockMutexError::NotOwner);
        }
        match kernel.threads.cb(cur).last_mutex_held.get(&*lock) {
            Some(held) if ptr::eq(held, self) => {}
            _ => return Err(UnlockMutexError::BadObjectState),
        }

        self.unlock_core(kernel, lock.borrow_mut(), cur);
        thread::reschedule(kernel, lock.borrow_mut());
        Ok(())
    }

    /// The thread currently owning the mutex, if any.
    pub fn owner(&self, kernel: &Kernel<P>) -> Result<Option<ThreadId>, BadContextError> {
        let lock = klock::lock_cpu::<P>()?;
        Ok(self.owner.get(&*lock).map(|index| ThreadId {
            index,
            generation: kernel.threads.cb(index).generation.get(&*lock),
        }))
    }

    /// The arena index of the owner, for internal ownership checks.
    pub(crate) fn owner_index(&self, lock: CpuLockTokenRefMut<'_, P>) -> Option<u8> {
        self.owner.get(&*lock)
    }

    /// Record `idx` as the owner and push the mutex onto its held stack.
    fn claim(&'static self, kernel: &Kernel<P>, mut lock: CpuLockTokenRefMut<'_, P>, idx: u8) {
        self.owner.replace(&mut *lock, Some(idx));
        let prev = kernel
            .threads
            .cb(idx)
            .last_mutex_held
            .replace(&mut *lock, Some(self));
        self.prev_held.replace(&mut *lock, prev);
    }

    /// Block `cur` until ownership is handed over by the current owner.
    fn lock_slow(&'static self, kernel: &Kernel<P>, mut lock: CpuLockTokenRefMut<'_, P>, cur: u8) {
        #[cfg(feature = "priority_inheritance")]
        {
            let priority = kernel.threads.cb(cur).effective_priority.get(&*lock);
            boost_owner_chain(kernel, lock.borrow_mut(), self, priority);
        }

        let msg = self.wait_queue.wait(
            kernel,
            lock.borrow_mut(),
            WaitTarget::Mutex(self),
            Timeout::Infinite,
        );
        // The unlocking thread claimed the mutex on our behalf before waking
        // us; there is no reacquisition race to lose.
        debug_assert_eq!(msg, WakeupMessage::Ok);
        debug_assert_eq!(self.owner.get(&*lock), Some(cur));
    }

    /// Release the mutex owned by `cur`: pop the held stack, shed any
    /// priority inherited through this mutex, and hand ownership to the
    /// best waiter. Does not reschedule.
    ///
    /// The mutex must be at the top of `cur`'s held stack.
    pub(crate) fn unlock_core(
        &'static self,
        kernel: &Kernel<P>,
        mut lock: CpuLockTokenRefMut<'_, P>,
        cur: u8,
    ) {
        debug_assert_eq!(self.owner.get(&*lock), Some(cur));
        {
            let top = kernel.threads.cb(cur).last_mutex_held.get(&*lock);
            debug_assert!(matches!(top, Some(held) if ptr::eq(held, self)));
        }

        let prev = self.prev_held.replace(&mut *lock, None);
        kernel
            .threads
            .cb(cur)
            .last_mutex_held
            .replace(&mut *lock, prev);

        #[cfg(feature = "priority_inheritance")]
        {
            let effective = evaluate_effective_priority(kernel, lock.borrow_mut(), cur);
            thread::apply_effective_priority(kernel, lock.borrow_mut(), cur, effective);
        }

        match self.wait_queue.dequeue_one(kernel, lock.borrow_mut()) {
            Some(next) => {
                self.claim(kernel, lock.borrow_mut(), next);
                kernel
                    .threads
                    .cb(next)
                    .wakeup_message
                    .replace(&mut *lock, WakeupMessage::Ok);
                thread::make_ready(kernel, lock, next);
            }
            None => {
                self.owner.replace(&mut *lock, None);
            }
        }
    }

    /// Reacquire the mutex after a condition-variable wait.
    pub(crate) fn relock(
        &'static self,
        kernel: &Kernel<P>,
        mut lock: CpuLockTokenRefMut<'_, P>,
        cur: u8,
    ) {
        match self.owner.get(&*lock) {
            None => self.claim(kernel, lock, cur),
            Some(owner) => {
                debug_assert_ne!(owner, cur);
                self.lock_slow(kernel, lock, cur);
            }
        }
    }

    /// Remove a waiter that timed out. Its `wait_target` is already cleared.
    pub(crate) fn unlink_waiter(
        &self,
        kernel: &Kernel<P>,
        lock: CpuLockTokenRefMut<'_, P>,
        idx: u8,
    ) {
        self.wait_queue.unlink(kernel, lock, idx);
    }

    /// Re-sort a waiter whose effective priority changed.
    pub(crate) fn reposition_waiter(
        &self,
        kernel: &Kernel<P>,
        lock: CpuLockTokenRefMut<'_, P>,
        idx: u8,
    ) {
        self.wait_queue.reposition(kernel, lock, idx);
    }
}

/// Compute the priority a thread is entitled to: its base priority, raised
/// to the highest-priority waiter on any mutex it still holds. Recomputing
/// from the live held set unwinds nested inheritance correctly no matter in
/// which order boosts arrived.
#[cfg(feature = "priority_inheritance")]
pub(crate) fn evaluate_effective_priority<P: Port>(
    kernel: &Kernel<P>,
    mut lock: CpuLockTokenRefMut<'_, P>,
    idx: u8,
) -> Priority {
    let cb = kernel.threads.cb(idx);
    let mut effective = cb.base_priority.get(&*lock);

    let mut held = cb.last_mutex_held.get(&*lock);
    while let Some(mutex) = held {
        if let Some(waiter) = mutex.wait_queue.first_waiter(lock.borrow_mut()) {
            let priority = kernel.threads.cb(waiter).effective_priority.get(&*lock);
            if priority > effective {
                effective = priority;
            }
        }
        held = mutex.prev_held.get(&*lock);
    }

    effective
}

/// Raise the priority of `mutex`'s owner to at least `priority`, following
/// the chain when that owner is itself blocked on another mutex. Each
/// boosted thread is repositioned in whatever queue it occupies.
#[cfg(feature = "priority_inheritance")]
pub(crate) fn boost_owner_chain<P: Port>(
    kernel: &Kernel<P>,
    mut lock: CpuLockTokenRefMut<'_, P>,
    mutex: &Mutex<P>,
    priority: Priority,
) {
    let mut mutex = mutex;
    loop {
        let Some(owner) = mutex.owner.get(&*lock) else {
            return;
        };
        let cb = kernel.threads.cb(owner);
        if cb.effective_priority.get(&*lock) >= priority {
            return;
        }
        cb.effective_priority.replace(&mut *lock, priority);

        match cb.st.get(&*lock) {
            thread::ThreadSt::Ready => {
                kernel
                    .ready_queue
                    .remove(&kernel.threads, owner, lock.borrow_mut());
                kernel
                    .ready_queue
                    .insert_behind(&kernel.threads, owner, lock.borrow_mut());
                return;
            }
            thread::ThreadSt::Waiting => match cb.wait_target.get(&*lock) {
                Some(WaitTarget::Mutex(next)) => {
                    next.wait_queue.reposition(kernel, lock.borrow_mut(), owner);
                    mutex = next;
                }
                Some(WaitTarget::Queue(queue)) => {
                    queue.reposition(kernel, lock.borrow_mut(), owner);
                    return;
                }
                None => return,
            },
            // A running owner just keeps running, now at the raised priority
            _ => return,
        }
    }
}
