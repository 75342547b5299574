//! The virtual-timer subsystem.
//!
//! All armed timers live in one deadline-sorted queue. Each tick advances
//! the kernel's monotonic tick counter and fires every timer whose deadline
//! has been reached, in deadline order (FIFO among equal deadlines).
//!
//! Timers are identified by a [`TimerToken`], a sequence number that is
//! never reused. A token naturally becomes invalid when its timer fires, so
//! resetting an already-fired timer is a harmless no-op rather than
//! undefined behavior.
//!
//! The queue's capacity is split in two: one slot is reserved for each
//! thread's blocking timeout (a thread can have at most one), so the
//! blocking paths can never fail to arm; the rest,
//! [`USER_TIMER_CAPACITY`](crate::USER_TIMER_CAPACITY) slots, serve
//! [`Kernel::arm_timer`](crate::Kernel::arm_timer), which reports
//! `QueueFull` when they run out.
use arrayvec::ArrayVec;
use core::num::NonZeroU32;

use crate::{
    error::ArmTimerError,
    klock::{CpuLockCell, CpuLockTokenRefMut},
    utils::Init,
    Kernel, Port, MAX_THREADS, USER_TIMER_CAPACITY,
};

/// A monotonic tick count.
pub(crate) type Time = u64;

const TIMER_QUEUE_CAPACITY: usize = MAX_THREADS + USER_TIMER_CAPACITY;

/// How long a blocking operation is allowed to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Do not wait at all. A blocking operation that cannot complete
    /// immediately returns a timeout without suspending the caller.
    Immediate,
    /// Wait for at most this many ticks.
    Ticks(NonZeroU32),
    /// Wait forever. No timer is armed.
    Infinite,
}

impl Timeout {
    /// Construct a timeout from a plain tick count, mapping zero to
    /// [`Timeout::Immediate`].
    pub const fn from_ticks(ticks: u32) -> Self {
        match NonZeroU32::new(ticks) {
            Some(ticks) => Self::Ticks(ticks),
            None => Self::Immediate,
        }
    }
}

/// Handle to an armed timer. Stale after the timer fires or is reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerToken(u32);

/// Called when a timer fires, with CPU Lock held. `usize` is the argument
/// given when the timer was armed. The callback must not block, but it may
/// arm further timers and wake threads.
pub type TimerCallback<P> = fn(&Kernel<P>, CpuLockTokenRefMut<'_, P>, usize);

struct TimerEntry<P: Port> {
    at: Time,
    token: TimerToken,
    callback: TimerCallback<P>,
    param: usize,
    /// Whether the entry counts against the user-timer budget.
    user: bool,
}

pub(crate) struct TimeoutGlobals<P: Port> {
    /// Ticks elapsed since the kernel started.
    now: CpuLockCell<P, Time>,
    next_token: CpuLockCell<P, u32>,
    user_armed: CpuLockCell<P, usize>,
    queue: CpuLockCell<P, ArrayVec<TimerEntry<P>, TIMER_QUEUE_CAPACITY>>,
}

impl<P: Port> Init for TimeoutGlobals<P> {
    const INIT: Self = Self {
        now: Init::INIT,
        next_token: Init::INIT,
        user_armed: Init::INIT,
        queue: Init::INIT,
    };
}

impl<P: Port> TimeoutGlobals<P> {
    pub(crate) fn now(&self, lock: CpuLockTokenRefMut<'_, P>) -> Time {
        self.now.get(&*lock)
    }

    /// Arm a user timer, counting against the user-timer budget.
    pub(crate) fn arm(
        &self,
        mut lock: CpuLockTokenRefMut<'_, P>,
        delay: u32,
        callback: TimerCallback<P>,
        param: usize,
    ) -> Result<TimerToken, ArmTimerError> {
        if delay == 0 {
            return Err(ArmTimerError::BadParam);
        }
        if self.user_armed.get(&*lock) >= USER_TIMER_CAPACITY {
            return Err(ArmTimerError::QueueFull);
        }
        let token = self.insert(lock.borrow_mut(), delay, callback, param, true);
        let armed = self.user_armed.get(&*lock);
        self.user_armed.replace(&mut *lock, armed + 1);
        Ok(token)
    }

    /// Arm a timer from one of the per-thread reserved slots. Cannot fail:
    /// each thread arms at most one of these at a time, and the queue has a
    /// slot for every thread on top of the user-timer budget.
    pub(crate) fn arm_reserved(
        &self,
        lock: CpuLockTokenRefMut<'_, P>,
        delay: u32,
        callback: TimerCallback<P>,
        param: usize,
    ) -> TimerToken {
        debug_assert_ne!(delay, 0);
        self.insert(lock, delay, callback, param, false)
    }

    fn insert(
        &self,
        mut lock: CpuLockTokenRefMut<'_, P>,
        delay: u32,
        callback: TimerCallback<P>,
        param: usize,
        user: bool,
    ) -> TimerToken {
        let at = self.now.get(&*lock) + Time::from(delay);
        let raw = self.next_token.get(&*lock);
        self.next_token.replace(&mut *lock, raw.wrapping_add(1));
        let token = TimerToken(raw);

        let queue = self.queue.write(&mut *lock);
        // Insert after all entries with the same deadline so that equal
        // deadlines fire in arming order
        let pos = queue.partition_point(|e| e.at <= at);
        let entry = TimerEntry {
            at,
            token,
            callback,
            param,
            user,
        };
        if queue.try_insert(pos, entry).is_err() {
            // The budget split makes this impossible; see the module docs
            unreachable!("timer queue overflow");
        }
        token
    }

    /// Disarm a timer. Returns `true` if it was still armed, `false` if it
    /// had already fired or been reset (a no-op).
    pub(crate) fn reset(&self, mut lock: CpuLockTokenRefMut<'_, P>, token: TimerToken) -> bool {
        let queue = self.queue.write(&mut *lock);
        let Some(pos) = queue.iter().position(|e| e.token == token) else {
            return false;
        };
        let entry = queue.remove(pos);
        if entry.user {
            let armed = self.user_armed.get(&*lock);
            self.user_armed.replace(&mut *lock, armed - 1);
        }
        true
    }

    /// Advance the tick counter and fire every timer that has come due.
    /// Callbacks run with CPU Lock held and may arm or reset other timers.
    pub(crate) fn handle_tick(&self, kernel: &Kernel<P>, mut lock: CpuLockTokenRefMut<'_, P>) {
        let now = self.now.get(&*lock) + 1;
        self.now.replace(&mut *lock, now);

        loop {
            let due = {
                let queue = self.queue.write(&mut *lock);
                match queue.first() {
                    Some(entry) if entry.at <= now => Some(queue.remove(0)),
                    _ => None,
                }
            };
            let Some(entry) = due else { break };
            if entry.user {
                let armed = self.user_armed.get(&*lock);
                self.user_armed.replace(&mut *lock, armed - 1);
            }
            (entry.callback)(kernel, lock.borrow_mut(), entry.param);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{klock, KernelConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fires_in_deadline_order() {
        crate::define_test_port!(TestPort);
        static KERNEL: Kernel<TestPort> = Kernel::new(KernelConfig::DEFAULT);
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        fn record<P: Port>(_: &Kernel<P>, _: CpuLockTokenRefMut<'_, P>, param: usize) {
            let prev = FIRED.load(Ordering::Relaxed);
            FIRED.store(prev * 10 + param, Ordering::Relaxed);
        }

        let mut lock = klock::lock_cpu::<TestPort>().unwrap();
        let t = &KERNEL.timeouts;
        t.arm(lock.borrow_mut(), 3, record, 3).unwrap();
        t.arm(lock.borrow_mut(), 1, record, 1).unwrap();
        t.arm(lock.borrow_mut(), 2, record, 2).unwrap();

        for _ in 0..3 {
            t.handle_tick(&KERNEL, lock.borrow_mut());
        }
        assert_eq!(FIRED.load(Ordering::Relaxed), 123);
        assert_eq!(t.now(lock.borrow_mut()), 3);
    }

    #[test]
    fn equal_deadlines_fire_in_arming_order() {
        crate::define_test_port!(TestPort);
        static KERNEL: Kernel<TestPort> = Kernel::new(KernelConfig::DEFAULT);
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        fn record<P: Port>(_: &Kernel<P>, _: CpuLockTokenRefMut<'_, P>, param: usize) {
            let prev = FIRED.load(Ordering::Relaxed);
            FIRED.store(prev * 10 + param, Ordering::Relaxed);
        }

        let mut lock = klock::lock_cpu::<TestPort>().unwrap();
        let t = &KERNEL.timeouts;
        t.arm(lock.borrow_mut(), 1, record, 7).unwrap();
        t.arm(lock.borrow_mut(), 1, record, 8).unwrap();
        t.handle_tick(&KERNEL, lock.borrow_mut());
        assert_eq!(FIRED.load(Ordering::Relaxed), 78);
    }

    #[test]
    fn reset_disarms_and_is_idempotent() {
        crate::define_test_port!(TestPort);
        static KERNEL: Kernel<TestPort> = Kernel::new(KernelConfig::DEFAULT);
        fn nop<P: Port>(_: &Kernel<P>, _: CpuLockTokenRefMut<'_, P>, _: usize) {}

        let mut lock = klock::lock_cpu::<TestPort>().unwrap();
        let t = &KERNEL.timeouts;
        let token = t.arm(lock.borrow_mut(), 5, nop, 1).unwrap();
        assert!(t.reset(lock.borrow_mut(), token));
        // Resetting again, or after firing, is a no-op
        assert!(!t.reset(lock.borrow_mut(), token));
    }

    #[test]
    fn reset_after_fire_is_a_noop() {
        crate::define_test_port!(TestPort);
        static KERNEL: Kernel<TestPort> = Kernel::new(KernelConfig::DEFAULT);
        static FIRED: AtomicUsize = AtomicUsize::new(0);
        fn record<P: Port>(_: &Kernel<P>, _: CpuLockTokenRefMut<'_, P>, param: usize) {
            FIRED.fetch_add(param, Ordering::Relaxed);
        }

        let mut lock = klock::lock_cpu::<TestPort>().unwrap();
        let t = &KERNEL.timeouts;
        let token = t.arm(lock.borrow_mut(), 1, record, 5).unwrap();
        t.handle_tick(&KERNEL, lock.borrow_mut());
        assert_eq!(FIRED.load(Ordering::Relaxed), 5);
        assert!(!t.reset(lock.borrow_mut(), token));
    }

    #[test]
    fn user_budget_is_enforced() {
        crate::define_test_port!(TestPort);
        static KERNEL: Kernel<TestPort> = Kernel::new(KernelConfig::DEFAULT);
        fn nop<P: Port>(_: &Kernel<P>, _: CpuLockTokenRefMut<'_, P>, _: usize) {}

        let mut lock = klock::lock_cpu::<TestPort>().unwrap();
        let t = &KERNEL.timeouts;
        for _ in 0..USER_TIMER_CAPACITY {
            t.arm(lock.borrow_mut(), 100, nop, 0).unwrap();
        }
        assert_eq!(
            t.arm(lock.borrow_mut(), 100, nop, 0),
            Err(ArmTimerError::QueueFull)
        );
        assert_eq!(t.arm(lock.borrow_mut(), 0, nop, 0), Err(ArmTimerError::BadParam));
    }
}
