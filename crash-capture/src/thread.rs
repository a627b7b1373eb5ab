//! Enumeration, suspension, and resumption of every thread in the process.
//!
//! All of this is meant to be driven from inside the crash handler, so the
//! platform implementations only use raw syscalls, never the allocator.

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod linux;
        use linux as imp;
    } else if #[cfg(target_os = "macos")] {
        mod mac;
        use mac as imp;
    }
}

pub use imp::ThreadHandle;
#[doc(hidden)]
pub use imp::live_storage;

use crate::{Error, SharedCrashState, SignalSafeLogger};
use std::{
    cell::Cell,
    sync::atomic::{AtomicUsize, Ordering},
};

/// The `pthread_self` of the thread that currently owns a [`ThreadList`], 0
/// if none
static OWNER: AtomicUsize = AtomicUsize::new(0);

/// How long a thread waiting for ownership sleeps between attempts
const OWNER_POLL_NANOS: libc::c_long = 1_000_000;

#[inline]
fn current_thread_id() -> usize {
    // SAFETY: syscall
    unsafe { libc::pthread_self() as usize }
}

/// Ownership of the thread controller, only one [`ThreadList`] exists at any
/// one time so that two threads crashing at once never suspend each other or
/// interleave their suspend/resume cycles
struct Ownership;

impl Ownership {
    fn try_acquire() -> Result<Self, Error> {
        OWNER
            .compare_exchange(0, current_thread_id(), Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| Self)
            .map_err(|_| Error::Busy)
    }

    /// Waits until the current owner, if any, releases the controller.
    ///
    /// A waiting thread is one of the owner's siblings, so it is suspended
    /// and resumed along with the rest of them while it waits.
    fn acquire() -> Result<Self, Error> {
        let me = current_thread_id();

        // SAFETY: timespec is plain old data
        let mut interval: libc::timespec = unsafe { std::mem::zeroed() };
        interval.tv_nsec = OWNER_POLL_NANOS;

        loop {
            match OWNER.compare_exchange(0, me, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return Ok(Self),
                // Eg. a second signal delivered to this thread while it is
                // capturing the first, the owner would be waiting on itself
                Err(owner) if owner == me => return Err(Error::Busy),
                Err(_) => {
                    // SAFETY: syscall
                    unsafe {
                        libc::nanosleep(&interval, std::ptr::null_mut());
                    }
                }
            }
        }
    }
}

impl Drop for Ownership {
    #[inline]
    fn drop(&mut self) {
        OWNER.store(0, Ordering::SeqCst);
    }
}

/// The threads of the process at the time of [`ThreadList::initialize`],
/// along with the calling thread, which is excluded from suspension.
///
/// The handles and their backing storage are released exactly once, either
/// by [`ThreadList::deinitialize`] or when the list is dropped.
pub struct ThreadList<'log> {
    threads: imp::Threads,
    log: &'log SignalSafeLogger,
    suspended: Cell<bool>,
    // Dropped last, after Drop has released the threads
    _owner: Ownership,
}

impl<'log> ThreadList<'log> {
    /// Enumerates the threads of the current process.
    ///
    /// If another thread has a list, eg. because it is handling a crash of
    /// its own, this waits until that list is released. Failures that occur
    /// after initialization (suspending, resuming, releasing) are written to
    /// `log`.
    ///
    /// Returns [`Error::Busy`] if the calling thread already has a list.
    pub fn initialize(log: &'log SignalSafeLogger) -> Result<Self, Error> {
        Self::with_owner(log, Ownership::acquire()?)
    }

    /// Same as [`Self::initialize`], but returns [`Error::Busy`] instead of
    /// waiting if any thread already has a list.
    pub fn try_initialize(log: &'log SignalSafeLogger) -> Result<Self, Error> {
        Self::with_owner(log, Ownership::try_acquire()?)
    }

    fn with_owner(log: &'log SignalSafeLogger, owner: Ownership) -> Result<Self, Error> {
        let threads = imp::Threads::enumerate(log)?;
        Ok(Self {
            threads,
            log,
            suspended: Cell::new(false),
            _owner: owner,
        })
    }

    /// Every thread handle, including the calling thread's
    #[inline]
    pub fn handles(&self) -> &[ThreadHandle] {
        self.threads.handles()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.handles().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.handles().is_empty()
    }

    /// The handle of the thread that initialized the list
    #[inline]
    pub fn current(&self) -> ThreadHandle {
        self.threads.current()
    }

    /// The threads other than the calling thread, with their index in the list
    #[inline]
    fn siblings(&self) -> impl Iterator<Item = (usize, ThreadHandle)> + '_ {
        let current = self.current();
        self.handles()
            .iter()
            .copied()
            .enumerate()
            .filter(move |(_, thread)| *thread != current)
    }

    /// Suspends every thread in the list other than the calling one.
    ///
    /// Suspension is best effort, a thread that fails to suspend is logged
    /// and skipped. The threads are resumed when the returned guard is
    /// resumed or dropped.
    ///
    /// Suspensions don't nest. While the threads are already suspended this
    /// does nothing, and the returned guard leaves resuming to the outer one.
    pub fn suspend_all_except_current(&self) -> SuspendedThreads<'_, 'log> {
        if self.suspended.replace(true) {
            return SuspendedThreads {
                list: self,
                resumed: true,
            };
        }

        imp::begin_suspend();

        let mut suspended = 0;
        for (index, thread) in self.siblings() {
            match imp::suspend(thread) {
                Ok(()) => suspended += 1,
                Err(err) => self.log_failure("suspend-failed", index, thread, &err),
            }
        }

        imp::wait_suspended(suspended, self.log);

        SuspendedThreads {
            list: self,
            resumed: false,
        }
    }

    fn resume_siblings(&self) {
        imp::begin_resume();

        for (index, thread) in self.siblings() {
            if let Err(err) = imp::resume(thread) {
                self.log_failure("resume-failed", index, thread, &err);
            }
        }

        self.suspended.set(false);
    }

    /// Suspends the other threads, writes a record for each of them to the
    /// crash log, then resumes them.
    ///
    /// The calling thread is skipped, its context is only known to whoever
    /// has the machine context for the signal, see
    /// [`crate::MachineContext::log_faulting_thread`].
    pub fn log_threads(&self, state: &SharedCrashState) -> Result<(), Error> {
        let log = state.log();
        let suspended = self.suspend_all_except_current();

        let mut result = Ok(());
        for (index, thread) in self.siblings() {
            if let Err(err) = log_thread(log, index, thread) {
                result = Err(err);
            }
        }

        suspended.resume_all_except_current();
        result
    }

    /// Releases every thread handle and the storage backing the list.
    ///
    /// Each release is attempted regardless of earlier failures, which are
    /// logged. This never fails outward.
    pub fn deinitialize(mut self) -> Result<(), Error> {
        self.threads.release(self.log);
        Ok(())
    }

    fn log_failure(&self, event: &str, index: usize, thread: ThreadHandle, err: &Error) {
        let log = self.log;
        let _ = log.write_key_str("event", event, false);
        let _ = log.write_key_integer("thread", index, false);
        let _ = log.write_key_integer("handle", thread as usize, false);
        let _ = log.write_key_integer("code", err.code().unwrap_or_default() as usize, true);
    }
}

impl Drop for ThreadList<'_> {
    fn drop(&mut self) {
        self.threads.release(self.log);
    }
}

fn log_thread(log: &SignalSafeLogger, index: usize, thread: ThreadHandle) -> Result<(), Error> {
    log.write_key_integer("thread", index, false)?;
    log.write_key_integer("handle", thread as usize, true)
}

/// Guard for a suspension cycle started by
/// [`ThreadList::suspend_all_except_current`]
#[must_use = "the threads are resumed as soon as this is dropped"]
pub struct SuspendedThreads<'list, 'log> {
    list: &'list ThreadList<'log>,
    resumed: bool,
}

impl SuspendedThreads<'_, '_> {
    /// Resumes every thread that was suspended
    #[inline]
    pub fn resume_all_except_current(mut self) {
        self.resume();
    }

    fn resume(&mut self) {
        if !self.resumed {
            self.resumed = true;
            self.list.resume_siblings();
        }
    }
}

impl Drop for SuspendedThreads<'_, '_> {
    fn drop(&mut self) {
        self.resume();
    }
}
