//! Condition variables: wake paths, mutex reacquisition, ownership checks.
use kestrel_kernel::{
    error::WaitCondvarError, Condvar, CondvarWait, Kernel, KernelConfig, Mutex, Port, StackRegion,
    ThreadParams, Timeout,
};
use std::sync::atomic::{AtomicUsize, Ordering};

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

fn record(seq: &AtomicUsize, digit: usize) {
    let prev = seq.load(Ordering::Relaxed);
    seq.store(prev * 10 + digit, Ordering::Relaxed);
}

#[test]
fn signal_wakes_the_waiter_with_the_mutex_held() {
    kestrel_port_std::use_hosted_port!(struct Port);
    static KERNEL: Kernel<Port> = Kernel::new(KernelConfig::DEFAULT);
    static MTX: Mutex<Port> = Mutex::new();
    static CV: Condvar<Port> = Condvar::new();
    static SEQ: AtomicUsize = AtomicUsize::new(0);

    fn waiter(_: usize) {
        MTX.lock(&KERNEL).unwrap();
        record(&SEQ, 1);
        let wake = CV.wait(&KERNEL, &MTX, Timeout::Infinite).unwrap();
        assert_eq!(wake, CondvarWait::Signaled);
        // The mutex comes back with the wakeup
        assert_eq!(
            MTX.owner(&KERNEL).unwrap(),
            KERNEL.current_thread().unwrap()
        );
        record(&SEQ, 3);
        MTX.unlock(&KERNEL).unwrap();
        KERNEL.shutdown();
    }
    fn signaler(_: usize) {
        MTX.lock(&KERNEL).unwrap();
        record(&SEQ, 2);
        CV.signal(&KERNEL).unwrap();
        // The woken waiter cannot proceed until we let go of the mutex
        MTX.unlock(&KERNEL).unwrap();
    }

    spawn_thread(&KERNEL, waiter, 5);
    spawn_thread(&KERNEL, signaler, 3);
    KERNEL.start(StackRegion::empty()).unwrap();

    assert_eq!(SEQ.load(Ordering::Relaxed), 123);
}

#[test]
fn broadcast_wakes_every_waiter() {
    kestrel_port_std::use_hosted_port!(struct Port);
    static KERNEL: Kernel<Port> = Kernel::new(KernelConfig::DEFAULT);
    static MTX: Mutex<Port> = Mutex::new();
    static CV: Condvar<Port> = Condvar::new();
    static SEQ: AtomicUsize = AtomicUsize::new(0);

    fn waiter(param: usize) {
        MTX.lock(&KERNEL).unwrap();
        let wake = CV.wait(&KERNEL, &MTX, Timeout::Infinite).unwrap();
        assert_eq!(wake, CondvarWait::Broadcast);
        record(&SEQ, param);
        MTX.unlock(&KERNEL).unwrap();
    }
    fn orchestrator(_: usize) {
        CV.broadcast(&KERNEL).unwrap();
        record(&SEQ, 3);
        KERNEL.shutdown();
    }

    KERNEL
        .spawn(ThreadParams {
            entry: waiter,
            param: 1,
            priority: 5,
            stack: StackRegion::empty(),
        })
        .unwrap();
    KERNEL
        .spawn(ThreadParams {
            entry: waiter,
            param: 2,
            priority: 4,
            stack: StackRegion::empty(),
        })
        .unwrap();
    spawn_thread(&KERNEL, orchestrator, 3);
    KERNEL.start(StackRegion::empty()).unwrap();

    assert_eq!(SEQ.load(Ordering::Relaxed), 123);
}

#[test]
fn wait_requires_mutex_ownership() {
    kestrel_port_std::use_hosted_port!(struct Port);
    static KERNEL: Kernel<Port> = Kernel::new(KernelConfig::DEFAULT);
    static MTX: Mutex<Port> = Mutex::new();
    static CV: Condvar<Port> = Condvar::new();

    fn main_thread(_: usize) {
        assert_eq!(
            CV.wait(&KERNEL, &MTX, Timeout::Infinite),
            Err(WaitCondvarError::NotOwner)
        );

        // An immediate timeout reports `Timeout` but keeps the mutex locked
        MTX.lock(&KERNEL).unwrap();
        assert_eq!(
            CV.wait(&KERNEL, &MTX, Timeout::Immediate),
            Err(WaitCondvarError::Timeout)
        );
        MTX.unlock(&KERNEL).unwrap();
        KERNEL.shutdown();
    }

    spawn_thread(&KERNEL, main_thread, 4);
    KERNEL.start(StackRegion::empty()).unwrap();
}

#[test]
fn timed_wait_reacquires_the_mutex_on_timeout() {
    kestrel_port_std::use_hosted_port!(struct Port);
    static KERNEL: Kernel<Port> = Kernel::new(KernelConfig::DEFAULT);
    static MTX: Mutex<Port> = Mutex::new();
    static CV: Condvar<Port> = Condvar::new();
    static STOP: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

    fn waiter(_: usize) {
        MTX.lock(&KERNEL).unwrap();
        let t0 = KERNEL.time().unwrap();
        assert_eq!(
            CV.wait(&KERNEL, &MTX, Timeout::from_ticks(10)),
            Err(WaitCondvarError::Timeout)
        );
        assert_eq!(KERNEL.time().unwrap() - t0, 10);
        // Timed out, but we still own the mutex
        assert_eq!(
            MTX.owner(&KERNEL).unwrap(),
            KERNEL.current_thread().unwrap()
        );
        MTX.unlock(&KERNEL).unwrap();
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
