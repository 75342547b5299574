//! Tick-driven timeouts, sleeps, and one-shot timers.
use kestrel_kernel::{
    error::{SleepError, WaitSemaphoreError},
    CpuLockTokenRefMut, Kernel, KernelConfig, Port, Semaphore, StackRegion, ThreadParams, Timeout,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

fn spawn_thread<P: Port>(kernel: &'static Kernel<P>, entry: fn(usize), priority: u8) {
    kernel
        .spawn(ThreadParams {
            entry,
            param: 0,
            priority,
            stack: StackRegion::empty(),
        })
        .unwrap();
}

#[test]
fn sleep_lasts_the_exact_number_of_ticks() {
    kestrel_port_std::use_hosted_port!(struct Port);
    static KERNEL: Kernel<Port> = Kernel::new(KernelConfig::DEFAULT);
    static STOP: AtomicBool = AtomicBool::new(false);

    fn sleeper(_: usize) {
        assert_eq!(KERNEL.sleep(0), Err(SleepError::BadParam));

        let t0 = KERNEL.time().unwrap();
        KERNEL.sleep(10).unwrap();
        assert_eq!(KERNEL.time().unwrap() - t0, 10);

        STOP.store(true, Ordering::Relaxed);
        KERNEL.shutdown();
    }
    fn ticker(_: usize) {
        while !STOP.load(Ordering::Relaxed) {
            KERNEL.timer_tick().unwrap();
            KERNEL.yield_now().unwrap();
        }
    }

    spawn_thread(&KERNEL, sleeper, 5);
    spawn_thread(&KERNEL, ticker, 1);
    KERNEL.start(StackRegion::empty()).unwrap();
}

#[test]
fn semaphore_wait_times_out_after_the_exact_deadline() {
    kestrel_port_std::use_hosted_port!(struct Port);
    static KERNEL: Kernel<Port> = Kernel::new(KernelConfig::DEFAULT);
    static SEM: Semaphore<Port> = Semaphore::new(0);
    static STOP: AtomicBool = AtomicBool::new(false);

    fn waiter(_: usize) {
        let t0 = KERNEL.time().unwrap();
        assert_eq!(
            SEM.wait(&KERNEL, Timeout::from_ticks(10)),
            Err(WaitSemaphoreError::Timeout)
        );
        assert_eq!(KERNEL.time().unwrap() - t0, 10);

        STOP.store(true, Ordering::Relaxed);
        KERNEL.shutdown();
    }
    fn ticker(_: usize) {
        while !STOP.load(Ordering::Relaxed) {
            KERNEL.timer_tick().unwrap();
            KERNEL.yield_now().unwrap();
        }
    }

    spawn_thread(&KERNEL, waiter, 5);
    spawn_thread(&KERNEL, ticker, 1);
    KERNEL.start(StackRegion::empty()).unwrap();
}

#[test]
fn a_permit_and_a_timeout_due_the_same_tick_produce_one_outcome() {
    kestrel_port_std::use_hosted_port!(struct Port);
    static KERNEL: Kernel<Port> = Kernel::new(KernelConfig::DEFAULT);
    static SEM: Semaphore<Port> = Semaphore::new(0);
    static STOP: AtomicBool = AtomicBool::new(false);

    fn on_fire(kernel: &Kernel<Port>, lock: CpuLockTokenRefMut<'_, Port>, _: usize) {
        SEM.signal_with(kernel, lock).unwrap();
    }
    fn waiter(_: usize) {
        KERNEL.arm_timer(5, on_fire, 0).unwrap();
        let outcome = SEM.wait(&KERNEL, Timeout::from_ticks(5));
        // Whichever side wins the tick, there is exactly one wakeup, and a
        // permit that loses stays in the counter
        match outcome {
            Ok(()) => assert_eq!(SEM.count(), Ok(0)),
            Err(WaitSemaphoreError::Timeout) => assert_eq!(SEM.count(), Ok(1)),
            Err(e) => panic!("unexpected wait result: {e:?}"),
        }

        STOP.store(true, Ordering::Relaxed);
        KERNEL.shutdown();
    }
    fn ticker(_: usize) {
        while !STOP.load(Ordering::Relaxed) {
            KERNEL.timer_tick().unwrap();
            KERNEL.yield_now().unwrap();
        }
    }

    spawn_thread(&KERNEL, waiter, 5);
    spawn_thread(&KERNEL, ticker, 1);
    KERNEL.start(StackRegion::empty()).unwrap();
}

#[test]
fn a_permit_losing_the_race_to_a_timeout_stays_in_the_counter() {
    kestrel_port_std::use_hosted_port!(struct Port);
    static KERNEL: Kernel<Port> = Kernel::new(KernelConfig::DEFAULT);
    static SEM: Semaphore<Port> = Semaphore::new(0);
    static STOP: AtomicBool = AtomicBool::new(false);

    fn on_fire(kernel: &Kernel<Port>, lock: CpuLockTokenRefMut<'_, Port>, _: usize) {
        SEM.signal_with(kernel, lock).unwrap();
    }
    fn waiter(_: usize) {
        let outcome = SEM.wait(&KERNEL, Timeout::from_ticks(5));
        match outcome {
            Ok(()) => assert_eq!(SEM.count(), Ok(0)),
            Err(WaitSemaphoreError::Timeout) => assert_eq!(SEM.count(), Ok(1)),
            Err(e) => panic!("unexpected wait result: {e:?}"),
        }

        STOP.store(true, Ordering::Relaxed);
        KERNEL.shutdown();
    }
    fn arbiter(_: usize) {
        // Runs once the waiter is blocked, so the wait's deadline was armed
        // first and fires first; the permit must then land in the counter
        KERNEL.arm_timer(5, on_fire, 0).unwrap();
    }
    fn ticker(_: usize) {
        while !STOP.load(Ordering::Relaxed) {
            KERNEL.timer_tick().unwrap();
            KERNEL.yield_now().unwrap();
        }
    }

    spawn_thread(&KERNEL, waiter, 5);
    spawn_thread(&KERNEL, arbiter, 4);
    spawn_thread(&KERNEL, ticker, 1);
    KERNEL.start(StackRegion::empty()).unwrap();
}

#[test]
fn a_disarmed_timeout_cannot_cut_a_later_wait_short() {
    kestrel_port_std::use_hosted_port!(struct Port);
    static KERNEL: Kernel<Port> = Kernel::new(KernelConfig::DEFAULT);
    static SEM: Semaphore<Port> = Semaphore::new(0);
    static STOP: AtomicBool = AtomicBool::new(false);

    fn on_fire(kernel: &Kernel<Port>, lock: CpuLockTokenRefMut<'_, Port>, _: usize) {
        SEM.signal_with(kernel, lock).unwrap();
    }
    fn waiter(_: usize) {
        // Woken by the permit at tick 2; the 5-tick deadline is disarmed on
        // the way out of the wait
        KERNEL.arm_timer(2, on_fire, 0).unwrap();
        SEM.wait(&KERNEL, Timeout::from_ticks(5)).unwrap();

        // A leftover deadline at tick 5 would end this wait 17 ticks early
        let t0 = KERNEL.time().unwrap();
        assert_eq!(
            SEM.wait(&KERNEL, Timeout::from_ticks(20)),
            Err(WaitSemaphoreError::Timeout)
        );
        assert_eq!(KERNEL.time().unwrap() - t0, 20);

        STOP.store(true, Ordering::Relaxed);
        KERNEL.shutdown();
    }
    fn ticker(_: usize) {
        while !STOP.load(Ordering::Relaxed) {
            KERNEL.timer_tick().unwrap();
            KERNEL.yield_now().unwrap();
        }
    }

    spawn_thread(&KERNEL, waiter, 5);
    spawn_thread(&KERNEL, ticker, 1);
    KERNEL.start(StackRegion::empty()).unwrap();
}

#[test]
fn one_shot_timers_fire_once_and_reset_disarms() {
    kestrel_port_std::use_hosted_port!(struct Port);
    static KERNEL: Kernel<Port> = Kernel::new(KernelConfig::DEFAULT);
    static FIRED: AtomicUsize = AtomicUsize::new(0);
    static STOP: AtomicBool = AtomicBool::new(false);

    fn on_fire(_: &Kernel<Port>, _: CpuLockTokenRefMut<'_, Port>, param: usize) {
        FIRED.fetch_add(param, Ordering::Relaxed);
    }
    fn main_thread(_: usize) {
        let armed = KERNEL.arm_timer(3, on_fire, 7).unwrap();
        let canceled = KERNEL.arm_timer(50, on_fire, 1000).unwrap();
        assert!(KERNEL.reset_timer(canceled).unwrap());

        KERNEL.sleep(5).unwrap();
        assert_eq!(FIRED.load(Ordering::Relaxed), 7);
        // Only fires once; its token is stale by now
        assert!(!KERNEL.reset_timer(armed).unwrap());

        STOP.store(true, Ordering::Relaxed);
        KERNEL.shutdown();
    }
    fn ticker(_: usize) {
        while !STOP.load(Ordering::Relaxed) {
            KERNEL.timer_tick().unwrap();
            KERNEL.yield_now().unwrap();
        }
    }

    spawn_thread(&KERNEL, main_thread, 5);
    spawn_thread(&KERNEL, ticker, 1);
    KERNEL.start(StackRegion::empty()).unwrap();
}

#[test]
fn a_timer_callback_can_signal_a_semaphore() {
    kestrel_port_std::use_hosted_port!(struct Port);
    static KERNEL: Kernel<Port> = Kernel::new(KernelConfig::DEFAULT);
    static SEM: Semaphore<Port> = Semaphore::new(0);
    static STOP: AtomicBool = AtomicBool::new(false);

    // Runs with the kernel lock held, as a tick interrupt handler would
    fn on_fire(kernel: &Kernel<Port>, lock: CpuLockTokenRefMut<'_, Port>, _: usize) {
        SEM.signal_with(kernel, lock).unwrap();
    }
    fn waiter(_: usize) {
        let t0 = KERNEL.time().unwrap();
        KERNEL.arm_timer(5, on_fire, 0).unwrap();
        SEM.wait(&KERNEL, Timeout::Infinite).unwrap();
        assert_eq!(KERNEL.time().unwrap() - t0, 5);

        STOP.store(true, Ordering::Relaxed);
        KERNEL.shutdown();
    }
    fn ticker(_: usize) {
        while !STOP.load(Ordering::Relaxed) {
            KERNEL.timer_tick().unwrap();
            KERNEL.yield_now().unwrap();
        }
    }

    spawn_thread(&KERNEL, waiter, 5);
    spawn_thread(&KERNEL, ticker, 1);
    KERNEL.start(StackRegion::empty()).unwrap();
}
