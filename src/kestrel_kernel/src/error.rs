//! Result codes returned by kernel operations.
//!
//! Each operation gets its own error enum listing exactly the failures it can
//! produce. The failure conditions shared by many operations are defined once
//! as single-variant "sub-errors" that convert into the per-operation enums
//! with `?`.

macro_rules! define_suberror {
    (
        $( #[doc $( $doc:tt )*] )*
        $( #[into( $Supererror:path )] )*
        $vis:vis enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[derive(Debug, PartialEq, Eq, Copy, Clone)]
        $vis enum $Name {
            $( $Variant ),*
        }

        define_suberror! {
            @into
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    // Emit one `From` impl per `#[into(…)]` attribute. A flat repetition
    // cannot iterate `$Supererror` and `$Variant` independently, so recurse
    // with one supererror peeled off per step.
    (
        @into
        #[into( $Supererror0:path )]
        $( #[into( $Supererror:path )] )*
        enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        impl From<$Name> for $Supererror0 {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }

        define_suberror! {
            @into
            $( #[into( $Supererror )] )*
            enum $Name {
                $( $Variant, )*
            }
        }
    };

    ( @into enum $($_:tt)* ) => {};
}

define_suberror! {
    /// The operation was attempted in a context where it is not allowed,
    /// e.g., while CPU Lock is already active, from an interrupt handler, or
    /// before the kernel has a current thread.
    #[into(SpawnError)]
    #[into(StartError)]
    #[into(SleepError)]
    #[into(YieldError)]
    #[into(GetPriorityError)]
    #[into(SetPriorityError)]
    #[into(ArmTimerError)]
    #[into(WaitSemaphoreError)]
    #[into(PollSemaphoreError)]
    #[into(SignalSemaphoreError)]
    #[into(LockMutexError)]
    #[into(TryLockMutexError)]
    #[into(UnlockMutexError)]
    #[into(WaitCondvarError)]
    pub enum BadContextError {
        BadContext,
    }
}

define_suberror! {
    /// The specified thread handle does not refer to a live thread.
    #[into(GetPriorityError)]
    #[into(SetPriorityError)]
    pub enum BadIdError {
        BadId,
    }
}

define_suberror! {
    /// A parameter was out of the permitted range.
    #[into(SpawnError)]
    #[into(SleepError)]
    #[into(SetPriorityError)]
    #[into(ArmTimerError)]
    pub enum BadParamError {
        BadParam,
    }
}

/// Error type for [`Kernel::spawn`](crate::Kernel::spawn).
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum SpawnError {
    /// CPU Lock is active.
    BadContext,
    /// The priority is outside the user range.
    BadParam,
    /// All thread slots are in use.
    NoFreeSlot,
}

/// Error type for [`Kernel::start`](crate::Kernel::start).
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum StartError {
    /// CPU Lock is active.
    BadContext,
    /// The kernel is already running.
    BadObjectState,
}

/// Error type for [`Kernel::sleep`](crate::Kernel::sleep).
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum SleepError {
    /// The calling context is not waitable.
    BadContext,
    /// The duration is zero.
    BadParam,
}

/// Error type for [`Kernel::yield_now`](crate::Kernel::yield_now).
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum YieldError {
    /// CPU Lock is active, or there is no current thread.
    BadContext,
}

/// Error type for [`Kernel::thread_priority`](crate::Kernel::thread_priority).
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum GetPriorityError {
    /// CPU Lock is active.
    BadContext,
    /// The thread handle is stale or invalid.
    BadId,
}

/// Error type for [`Kernel::set_priority`](crate::Kernel::set_priority).
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum SetPriorityError {
    /// CPU Lock is active.
    BadContext,
    /// The thread handle is stale or invalid.
    BadId,
    /// The priority is outside the user range.
    BadParam,
}

/// Error type for [`Kernel::arm_timer`](crate::Kernel::arm_timer).
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ArmTimerError {
    /// CPU Lock is active.
    BadContext,
    /// The delay is zero.
    BadParam,
    /// No space is left in the timer queue.
    QueueFull,
}

/// Error type for the allocating operations of
/// [`Arena`](crate::mem::Arena) and [`Heap`](crate::mem::Heap).
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum AllocError {
    /// CPU Lock is active.
    BadContext,
    /// Not enough contiguous memory to satisfy the request.
    NoMemory,
}

impl From<BadContextError> for AllocError {
    #[inline]
    fn from(_: BadContextError) -> Self {
        Self::BadContext
    }
}

/// Error type for [`Semaphore::wait`](crate::Semaphore::wait).
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum WaitSemaphoreError {
    /// The calling context is not waitable.
    BadContext,
    /// The timeout elapsed before a permit became available.
    Timeout,
    /// The semaphore was reset while the thread was waiting.
    Reset,
}

/// Error type for [`Semaphore::try_wait`](crate::Semaphore::try_wait).
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum PollSemaphoreError {
    /// CPU Lock is active.
    BadContext,
    /// No permit was available.
    Timeout,
}

/// Error type for [`Semaphore::signal`](crate::Semaphore::signal).
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum SignalSemaphoreError {
    /// CPU Lock is active.
    BadContext,
    /// The counter would overflow.
    QueueOverflow,
}

define_suberror! {
    /// The semaphore counter would overflow.
    #[into(SignalSemaphoreError)]
    pub enum QueueOverflowError {
        QueueOverflow,
    }
}

/// Error type for [`Mutex::lock`](crate::Mutex::lock).
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum LockMutexError {
    /// The calling context is not waitable.
    BadContext,
    /// The current thread already owns the mutex.
    WouldDeadlock,
}

/// Error type for [`Mutex::try_lock`](crate::Mutex::try_lock).
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum TryLockMutexError {
    /// CPU Lock is active, or there is no current thread.
    BadContext,
    /// The current thread already owns the mutex.
    WouldDeadlock,
    /// The mutex is held by another thread.
    Timeout,
}

/// Error type for [`Mutex::unlock`](crate::Mutex::unlock).
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum UnlockMutexError {
    /// CPU Lock is active, or there is no current thread.
    BadContext,
    /// The current thread does not own the mutex.
    NotOwner,
    /// The mutex is not the most recently locked one still held by the
    /// current thread. Mutexes must be released in lock-reverse order.
    BadObjectState,
}

/// Error type for [`Condvar::wait`](crate::Condvar::wait).
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum WaitCondvarError {
    /// The calling context is not waitable.
    BadContext,
    /// The current thread does not own the paired mutex.
    NotOwner,
    /// The timeout elapsed before the condition variable was signaled. The
    /// mutex has been reacquired regardless.
    Timeout,
}
