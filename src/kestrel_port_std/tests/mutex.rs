//! Mutex ownership, handoff, unlock ordering, and priority inheritance.
use kestrel_kernel::{
    error::{LockMutexError, TryLockMutexError, UnlockMutexError},
    Kernel, KernelConfig, Mutex, Port, Semaphore, StackRegion, ThreadParams, Timeout,
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

/// The calling thread's current effective priority.
fn my_priority<P: Port>(kernel: &'static Kernel<P>) -> u8 {
    let id = kernel.current_thread().unwrap().unwrap();
    kernel.thread_priority(id).unwrap()
}

#[test]
fn ownership_is_tracked_and_misuse_rejected() {
    kestrel_port_std::use_hosted_port!(struct Port);
    static KERNEL: Kernel<Port> = Kernel::new(KernelConfig::DEFAULT);
    static MTX: Mutex<Port> = Mutex::new();

    fn main_thread(_: usize) {
        assert_eq!(MTX.owner(&KERNEL), Ok(None));
        MTX.lock(&KERNEL).unwrap();
        assert_eq!(
            MTX.owner(&KERNEL).unwrap(),
            KERNEL.current_thread().unwrap()
        );

        // Recursive locking is a deadlock, not a wait
        assert_eq!(MTX.lock(&KERNEL), Err(LockMutexError::WouldDeadlock));
        assert_eq!(MTX.try_lock(&KERNEL), Err(TryLockMutexError::WouldDeadlock));

        MTX.unlock(&KERNEL).unwrap();
        assert_eq!(MTX.unlock(&KERNEL), Err(UnlockMutexError::NotOwner));
        assert_eq!(MTX.owner(&KERNEL), Ok(None));
        KERNEL.shutdown();
    }

    spawn_thread(&KERNEL, main_thread, 4);
    KERNEL.start(StackRegion::empty()).unwrap();
}

#[test]
fn mutexes_unlock_in_reverse_locking_order() {
    kestrel_port_std::use_hosted_port!(struct Port);
    static KERNEL: Kernel<Port> = Kernel::new(KernelConfig::DEFAULT);
    static A: Mutex<Port> = Mutex::new();
    static B: Mutex<Port> = Mutex::new();

    fn main_thread(_: usize) {
        A.lock(&KERNEL).unwrap();
        B.lock(&KERNEL).unwrap();
        assert_eq!(A.unlock(&KERNEL), Err(UnlockMutexError::BadObjectState));
        B.unlock(&KERNEL).unwrap();
        A.unlock(&KERNEL).unwrap();
        KERNEL.shutdown();
    }

    spawn_thread(&KERNEL, main_thread, 4);
    KERNEL.start(StackRegion::empty()).unwrap();
}

#[test]
fn unlock_hands_ownership_to_the_waiter() {
    kestrel_port_std::use_hosted_port!(struct Port);
    static KERNEL: Kernel<Port> = Kernel::new(KernelConfig::DEFAULT);
    static MTX: Mutex<Port> = Mutex::new();
    static START: Semaphore<Port> = Semaphore::new(0);
    static SEQ: AtomicUsize = AtomicUsize::new(0);

    fn contender(_: usize) {
        START.wait(&KERNEL, Timeout::Infinite).unwrap();
        MTX.lock(&KERNEL).unwrap();
        record(&SEQ, 3);
        MTX.unlock(&KERNEL).unwrap();
    }
    fn holder(_: usize) {
        MTX.lock(&KERNEL).unwrap();
        record(&SEQ, 1);
        // Wakes the contender, which immediately blocks on the mutex
        START.signal(&KERNEL).unwrap();
        record(&SEQ, 2);
        // Handoff: the contender owns the mutex the moment we release it
        MTX.unlock(&KERNEL).unwrap();
        record(&SEQ, 4);
        KERNEL.shutdown();
    }

    spawn_thread(&KERNEL, contender, 5);
    spawn_thread(&KERNEL, holder, 3);
    KERNEL.start(StackRegion::empty()).unwrap();

    assert_eq!(SEQ.load(Ordering::Relaxed), 1234);
}

#[test]
fn try_lock_reports_a_held_mutex() {
    kestrel_port_std::use_hosted_port!(struct Port);
    static KERNEL: Kernel<Port> = Kernel::new(KernelConfig::DEFAULT);
    static MTX: Mutex<Port> = Mutex::new();

    fn prober(_: usize) {
        assert_eq!(MTX.try_lock(&KERNEL), Err(TryLockMutexError::Timeout));
    }
    fn main_thread(_: usize) {
        MTX.lock(&KERNEL).unwrap();
        spawn_thread(&KERNEL, prober, 9);
        MTX.unlock(&KERNEL).unwrap();
        KERNEL.shutdown();
    }

    spawn_thread(&KERNEL, main_thread, 4);
    KERNEL.start(StackRegion::empty()).unwrap();
}

#[test]
fn holder_inherits_the_waiter_priority() {
    kestrel_port_std::use_hosted_port!(struct Port);
    static KERNEL: Kernel<Port> = Kernel::new(KernelConfig::DEFAULT);
    static MTX: Mutex<Port> = Mutex::new();
    static MID_GATE: Semaphore<Port> = Semaphore::new(0);
    static HIGH_GATE: Semaphore<Port> = Semaphore::new(0);
    static SEQ: AtomicUsize = AtomicUsize::new(0);

    fn high(_: usize) {
        HIGH_GATE.wait(&KERNEL, Timeout::Infinite).unwrap();
        // Readies `mid` without yielding to it, then blocks on the mutex
        MID_GATE.signal(&KERNEL).unwrap();
        MTX.lock(&KERNEL).unwrap();
        record(&SEQ, 3);
        MTX.unlock(&KERNEL).unwrap();
    }
    fn mid(_: usize) {
        MID_GATE.wait(&KERNEL, Timeout::Infinite).unwrap();
        // Must not run while the boosted `low` still holds the mutex
        record(&SEQ, 4);
    }
    fn low(_: usize) {
        MTX.lock(&KERNEL).unwrap();
        record(&SEQ, 1);
        HIGH_GATE.signal(&KERNEL).unwrap();
        // `high` is now blocked on the mutex; we run in its stead
        assert_eq!(my_priority(&KERNEL), 4);
        record(&SEQ, 2);
        MTX.unlock(&KERNEL).unwrap();
        // The boost is gone with the mutex
        assert_eq!(my_priority(&KERNEL), 2);
        record(&SEQ, 5);
        KERNEL.shutdown();
    }

    spawn_thread(&KERNEL, high, 4);
    spawn_thread(&KERNEL, mid, 3);
    spawn_thread(&KERNEL, low, 2);
    KERNEL.start(StackRegion::empty()).unwrap();

    assert_eq!(SEQ.load(Ordering::Relaxed), 12345);
}

#[test]
fn inheritance_propagates_through_blocking_chains() {
    kestrel_port_std::use_hosted_port!(struct Port);
    static KERNEL: Kernel<Port> = Kernel::new(KernelConfig::DEFAULT);
    static A: Mutex<Port> = Mutex::new();
    static B: Mutex<Port> = Mutex::new();
    static G1: Semaphore<Port> = Semaphore::new(0);
    static G2: Semaphore<Port> = Semaphore::new(0);
    static SEQ: AtomicUsize = AtomicUsize::new(0);

    // t3 (prio 5) blocks on B, held by t2 (prio 3), which blocks on A, held
    // by t1 (prio 2). Both holders must end up at priority 5.
    fn t1(_: usize) {
        A.lock(&KERNEL).unwrap();
        record(&SEQ, 1);
        G1.signal(&KERNEL).unwrap();
        assert_eq!(my_priority(&KERNEL), 5);
        record(&SEQ, 2);
        A.unlock(&KERNEL).unwrap();
        record(&SEQ, 6);
        KERNEL.shutdown();
    }
    fn t2(_: usize) {
        G1.wait(&KERNEL, Timeout::Infinite).unwrap();
        B.lock(&KERNEL).unwrap();
        G2.signal(&KERNEL).unwrap();
        A.lock(&KERNEL).unwrap();
        assert_eq!(my_priority(&KERNEL), 5);
        record(&SEQ, 3);
        A.unlock(&KERNEL).unwrap();
        B.unlock(&KERNEL).unwrap();
        record(&SEQ, 5);
    }
    fn t3(_: usize) {
        G2.wait(&KERNEL, Timeout::Infinite).unwrap();
        B.lock(&KERNEL).unwrap();
        record(&SEQ, 4);
        B.unlock(&KERNEL).unwrap();
    }

    spawn_thread(&KERNEL, t3, 5);
    spawn_thread(&KERNEL, t2, 3);
    spawn_thread(&KERNEL, t1, 2);
    KERNEL.start(StackRegion::empty()).unwrap();

    assert_eq!(SEQ.load(Ordering::Relaxed), 123456);
}
