//! Mach lets us suspend and resume any thread of our own task directly, the
//! handles are send rights to the thread ports returned by `task_threads`,
//! all of which need to be deallocated along with the array holding them.

use crate::{Error, SignalSafeLogger};
use mach2::{
    kern_return::{KERN_SUCCESS, kern_return_t},
    mach_init::mach_thread_self,
    mach_port::mach_port_deallocate,
    mach_types::{thread_act_array_t, thread_act_t},
    message::mach_msg_type_number_t,
    port::MACH_PORT_NULL,
    task::task_threads,
    thread_act::{thread_resume, thread_suspend},
    traps::mach_task_self,
    vm::mach_vm_deallocate,
};
use std::sync::atomic::{AtomicUsize, Ordering};

pub type ThreadHandle = thread_act_t;

/// Number of `task_threads` arrays that have not been deallocated
static LIVE_STORAGE: AtomicUsize = AtomicUsize::new(0);

/// The number of thread lists whose backing storage has not been released
pub fn live_storage() -> usize {
    LIVE_STORAGE.load(Ordering::SeqCst)
}

#[inline]
fn check(kr: kern_return_t) -> Result<(), Error> {
    if kr == KERN_SUCCESS {
        Ok(())
    } else {
        Err(Error::Kern(kr))
    }
}

pub(super) struct Threads {
    threads: thread_act_array_t,
    count: mach_msg_type_number_t,
    current: thread_act_t,
    released: bool,
}

impl Threads {
    pub(super) fn enumerate(_log: &SignalSafeLogger) -> Result<Self, Error> {
        let mut threads: thread_act_array_t = std::ptr::null_mut();
        let mut count = 0;

        // SAFETY: syscalls
        unsafe {
            check(task_threads(mach_task_self(), &mut threads, &mut count))?;
            LIVE_STORAGE.fetch_add(1, Ordering::SeqCst);

            Ok(Self {
                threads,
                count,
                current: mach_thread_self(),
                released: false,
            })
        }
    }

    #[inline]
    pub(super) fn handles(&self) -> &[thread_act_t] {
        if self.threads.is_null() {
            &[]
        } else {
            // SAFETY: task_threads returned an array of count ports
            unsafe { std::slice::from_raw_parts(self.threads, self.count as usize) }
        }
    }

    #[inline]
    pub(super) fn current(&self) -> thread_act_t {
        self.current
    }

    pub(super) fn release(&mut self, log: &SignalSafeLogger) {
        if self.released {
            return;
        }
        self.released = true;

        // SAFETY: syscalls, every port and the array were handed to us by
        // task_threads and mach_thread_self
        unsafe {
            let task = mach_task_self();

            if !self.threads.is_null() {
                for i in 0..self.count as usize {
                    let thread = self.threads.add(i);
                    if let Err(err) = check(mach_port_deallocate(task, *thread)) {
                        log_release_failure(log, "thread-port", &err);
                    }
                    *thread = MACH_PORT_NULL;
                }

                let size = std::mem::size_of::<thread_act_t>() * self.count as usize;
                if let Err(err) = check(mach_vm_deallocate(task, self.threads as u64, size as u64))
                {
                    log_release_failure(log, "storage", &err);
                }

                LIVE_STORAGE.fetch_sub(1, Ordering::SeqCst);
                self.threads = std::ptr::null_mut();
                self.count = 0;
            }

            if let Err(err) = check(mach_port_deallocate(task, self.current)) {
                log_release_failure(log, "current-thread-port", &err);
            }
        }
    }
}

fn log_release_failure(log: &SignalSafeLogger, what: &str, err: &Error) {
    let _ = log.write_key_str("event", "release-failed", false);
    let _ = log.write_key_str("resource", what, false);
    let _ = log.write_key_integer("code", err.code().unwrap_or_default() as usize, true);
}

#[inline]
pub(super) fn begin_suspend() {}

#[inline]
pub(super) fn suspend(thread: thread_act_t) -> Result<(), Error> {
    // SAFETY: syscall
    check(unsafe { thread_suspend(thread) })
}

/// `thread_suspend` does not return until the thread is suspended
#[inline]
pub(super) fn wait_suspended(_expected: usize, _log: &SignalSafeLogger) {}

#[inline]
pub(super) fn begin_resume() {}

#[inline]
pub(super) fn resume(thread: thread_act_t) -> Result<(), Error> {
    // SAFETY: syscall
    check(unsafe { thread_resume(thread) })
}
