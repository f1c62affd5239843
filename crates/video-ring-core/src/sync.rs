//! Process-shared mutex and condition-variable primitives.
//!
//! The reference design calls these out as pre-built collaborators, but
//! `std::sync::Mutex`/`Condvar` are not specified as relocatable into a
//! foreign mapping and have no process-shared mode. We build directly on
//! `libc::pthread_mutex_t`/`pthread_cond_t` with `PTHREAD_PROCESS_SHARED`
//! instead, the way a systems crate embedding OS synchronization primitives
//! in a `#[repr(C)]` layout normally would.

use crate::Error;
use std::cell::UnsafeCell;
use std::time::Duration;

use crate::clock::now_ns;

/// A process-shared mutex, embeddable directly in a shared-memory region.
#[repr(C)]
pub(crate) struct RawMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

// The mutex is designed to be shared across process boundaries; within one
// process it is equally safe to share across threads.
unsafe impl Send for RawMutex {}
unsafe impl Sync for RawMutex {}

impl RawMutex {
    /// Initializes the mutex in place. Must run exactly once, before any
    /// process attempts to lock it (normally as part of writer-side `init`).
    ///
    /// # Safety
    /// `self` must be valid, writable memory that no other thread or
    /// process is concurrently initializing or locking.
    pub(crate) unsafe fn init_in_place(&self) -> Result<(), Error> {
        let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
        pthread_call(libc::pthread_mutexattr_init(&mut attr))?;
        let init_result = (|| {
            pthread_call(libc::pthread_mutexattr_setpshared(
                &mut attr,
                libc::PTHREAD_PROCESS_SHARED,
            ))?;
            #[cfg(any(target_os = "linux", target_os = "android"))]
            {
                // Best-effort: a robust mutex lets a reattached writer notice
                // a crashed predecessor instead of deadlocking forever. Not
                // every libc supports this; we don't treat failure as fatal.
                let _ = libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST);
            }
            pthread_call(libc::pthread_mutex_init(self.inner.get(), &attr))
        })();
        libc::pthread_mutexattr_destroy(&mut attr);
        init_result
    }

    /// Locks the mutex, blocking until available.
    ///
    /// If the previous owner died while holding the lock (robust mutex
    /// support only), the lock is recovered and marked consistent so later
    /// locks behave normally; this is the "crashed writer" recovery path
    /// §9 of the spec asks for.
    pub(crate) fn lock(&self) -> MutexGuard<'_> {
        // SAFETY: `inner` was initialized by `init_in_place` before any
        // handle to this mutex could have been constructed.
        let rc = unsafe { libc::pthread_mutex_lock(self.inner.get()) };
        if rc == libc::EOWNERDEAD {
            unsafe {
                libc::pthread_mutex_consistent(self.inner.get());
            }
        } else if rc != 0 {
            panic!("pthread_mutex_lock failed with errno {rc}");
        }
        MutexGuard { mutex: self }
    }
}

/// RAII guard releasing a [`RawMutex`] on drop.
pub(crate) struct MutexGuard<'a> {
    mutex: &'a RawMutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_unlock(self.mutex.inner.get());
        }
    }
}

/// Outcome of a timed condition-variable wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    Signaled,
    TimedOut,
}

/// A process-shared condition variable paired with a [`RawMutex`].
#[repr(C)]
pub(crate) struct RawCondvar {
    inner: UnsafeCell<libc::pthread_cond_t>,
}

unsafe impl Send for RawCondvar {}
unsafe impl Sync for RawCondvar {}

impl RawCondvar {
    /// Initializes the condition variable in place. See
    /// [`RawMutex::init_in_place`] for the same one-time-init contract.
    ///
    /// # Safety
    /// `self` must be valid, writable memory that no other thread or
    /// process is concurrently initializing or waiting on.
    pub(crate) unsafe fn init_in_place(&self) -> Result<(), Error> {
        let mut attr: libc::pthread_condattr_t = std::mem::zeroed();
        pthread_call(libc::pthread_condattr_init(&mut attr))?;
        let init_result = (|| {
            pthread_call(libc::pthread_condattr_setpshared(
                &mut attr,
                libc::PTHREAD_PROCESS_SHARED,
            ))?;
            #[cfg(any(target_os = "linux", target_os = "android"))]
            {
                // Pair the condvar's deadline clock with `clock::now_ns`
                // (CLOCK_MONOTONIC) so timed waits aren't thrown off by
                // wall-clock adjustments.
                pthread_call(libc::pthread_condattr_setclock(
                    &mut attr,
                    libc::CLOCK_MONOTONIC,
                ))?;
            }
            pthread_call(libc::pthread_cond_init(self.inner.get(), &attr))
        })();
        libc::pthread_condattr_destroy(&mut attr);
        init_result
    }

    /// Waits for a notification or `timeout`, whichever comes first.
    pub(crate) fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a>,
        timeout: Duration,
    ) -> Result<(MutexGuard<'a>, WaitOutcome), Error> {
        let deadline_ns = now_ns().saturating_add(timeout.as_nanos() as u64);
        let ts = libc::timespec {
            tv_sec: (deadline_ns / 1_000_000_000) as libc::time_t,
            tv_nsec: (deadline_ns % 1_000_000_000) as _,
        };
        let rc = unsafe {
            libc::pthread_cond_timedwait(self.inner.get(), guard.mutex.inner.get(), &ts)
        };
        match rc {
            0 => Ok((guard, WaitOutcome::Signaled)),
            libc::ETIMEDOUT => Ok((guard, WaitOutcome::TimedOut)),
            errno => Err(Error::CondWaitFailed(format!(
                "pthread_cond_timedwait failed with errno {errno}"
            ))),
        }
    }

    pub(crate) fn notify_all(&self) {
        unsafe {
            libc::pthread_cond_broadcast(self.inner.get());
        }
    }
}

fn pthread_call(rc: libc::c_int) -> Result<(), Error> {
    if rc == 0 {
        Ok(())
    } else {
        Err(Error::CondWaitFailed(format!(
            "pthread primitive call failed with errno {rc}"
        )))
    }
}
