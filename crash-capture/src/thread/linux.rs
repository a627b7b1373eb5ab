//! Linux has no way to suspend another thread of the same process from
//! within the process, so suspension is cooperative: every thread is sent
//! [`SUSPEND_SIGNAL`], whose handler acknowledges and then parks on a futex
//! until the suspending thread bumps the futex word again.
//!
//! The word is even while threads are running and odd while a suspension is
//! in progress. A suspend signal that arrives late, after the threads were
//! already resumed, sees an even word and returns straight away.
//!
//! A thread that has the suspend signal blocked never acknowledges, and the
//! signal stays pending on it. Once that has happened the suspend handler is
//! left installed for the rest of the process, see [`STRAGGLERS`], as
//! putting back the default disposition would let the pending signal kill
//! the process as soon as the thread unblocks it.

use crate::{Error, SignalSafeLogger};
use std::{
    mem, ptr,
    sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
};

pub type ThreadHandle = libc::pid_t;

/// The signal used to park threads. Not one of the handled fatal signals,
/// and rarely used by anything else.
const SUSPEND_SIGNAL: i32 = libc::SIGPWR;

/// Extra capacity for threads created between counting and filling the list
const SPARE_CAPACITY: usize = 16;

/// How many times, at [`ACK_POLL_NANOS`] apart, the suspending thread checks
/// that every signalled thread has parked before giving up on the stragglers
const ACK_POLL_ATTEMPTS: usize = 1000;
const ACK_POLL_NANOS: libc::c_long = 1_000_000;

/// Futex word parked threads wait on, odd while suspended
static SUSPEND_WORD: AtomicU32 = AtomicU32::new(0);
/// Number of threads that have parked during the current suspension
static ACKNOWLEDGED: AtomicUsize = AtomicUsize::new(0);
/// Set once a suspension gave up on a thread that never acknowledged, whose
/// suspend signal may therefore still be pending
static STRAGGLERS: AtomicBool = AtomicBool::new(false);
/// Number of thread lists whose storage is currently mapped
static LIVE_STORAGE: AtomicUsize = AtomicUsize::new(0);

/// The number of thread lists whose backing storage has not been released
pub fn live_storage() -> usize {
    LIVE_STORAGE.load(Ordering::SeqCst)
}

#[inline]
fn gettid() -> libc::pid_t {
    // SAFETY: syscall
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

pub(super) struct Threads {
    storage: *mut libc::pid_t,
    capacity: usize,
    len: usize,
    current: libc::pid_t,
    /// The suspend signal disposition before we installed ours, `None` if we
    /// didn't install it
    previous_action: Option<libc::sigaction>,
    released: bool,
}

impl Threads {
    pub(super) fn enumerate(log: &SignalSafeLogger) -> Result<Self, Error> {
        let mut threads = Self {
            storage: ptr::null_mut(),
            capacity: 0,
            len: 0,
            current: gettid(),
            previous_action: None,
            released: false,
        };

        // Every failure from here on goes through release so the suspend
        // handler is put back
        if let Err(err) = threads.install_suspend_handler() {
            threads.release(log);
            return Err(err);
        }

        if let Err(err) = threads.fill(log) {
            threads.release(log);
            return Err(err);
        }

        Ok(threads)
    }

    fn install_suspend_handler(&mut self) -> Result<(), Error> {
        // SAFETY: syscalls
        unsafe {
            let mut action: libc::sigaction = mem::zeroed();

            // Everything but the fatal signals is blocked while parked, a
            // parked thread that faults should still be reported
            libc::sigfillset(&mut action.sa_mask);
            for signal in crate::HANDLED_SIGNALS {
                libc::sigdelset(&mut action.sa_mask, signal as i32);
            }

            action.sa_sigaction = suspend_handler as usize;
            action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;

            let mut previous: libc::sigaction = mem::zeroed();
            if libc::sigaction(SUSPEND_SIGNAL, &action, &mut previous) == -1 {
                return Err(Error::last_os_error());
            }

            // If a previous cycle never got to restore the disposition, the
            // handler is still ours and there is nothing to put back
            if previous.sa_sigaction != suspend_handler as usize {
                self.previous_action = Some(previous);
            }
        }

        Ok(())
    }

    /// Reads `/proc/self/task` twice, once to size the storage, once to fill it
    fn fill(&mut self, log: &SignalSafeLogger) -> Result<(), Error> {
        let dir = TaskDir::open()?;

        let mut count = 0;
        dir.for_each_tid(|_| count += 1)?;

        self.map_storage(count + SPARE_CAPACITY)?;

        dir.rewind()?;

        let mut dropped = 0;
        dir.for_each_tid(|tid| {
            if self.len < self.capacity {
                // SAFETY: within the mapping, checked against capacity above
                unsafe { self.storage.add(self.len).write(tid) };
                self.len += 1;
            } else {
                dropped += 1;
            }
        })?;

        if dropped > 0 {
            let _ = log.write_key_str("event", "threads-truncated", false);
            let _ = log.write_key_integer("dropped", dropped, true);
        }

        Ok(())
    }

    fn map_storage(&mut self, capacity: usize) -> Result<(), Error> {
        // SAFETY: syscall
        let storage = unsafe {
            libc::mmap(
                ptr::null_mut(),
                capacity * mem::size_of::<libc::pid_t>(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };

        if storage == libc::MAP_FAILED {
            return Err(Error::OutOfMemory);
        }

        LIVE_STORAGE.fetch_add(1, Ordering::SeqCst);
        self.storage = storage.cast();
        self.capacity = capacity;
        Ok(())
    }

    #[inline]
    pub(super) fn handles(&self) -> &[libc::pid_t] {
        if self.storage.is_null() {
            &[]
        } else {
            // SAFETY: the first len entries of the mapping were written in fill
            unsafe { std::slice::from_raw_parts(self.storage, self.len) }
        }
    }

    #[inline]
    pub(super) fn current(&self) -> libc::pid_t {
        self.current
    }

    pub(super) fn release(&mut self, log: &SignalSafeLogger) {
        if self.released {
            return;
        }
        self.released = true;

        if !self.storage.is_null() {
            // SAFETY: syscall, the mapping was created in map_storage with
            // the same length
            let res = unsafe {
                libc::munmap(
                    self.storage.cast(),
                    self.capacity * mem::size_of::<libc::pid_t>(),
                )
            };
            if res == -1 {
                log_release_failure(log, "storage");
            }

            LIVE_STORAGE.fetch_sub(1, Ordering::SeqCst);
            self.storage = ptr::null_mut();
            self.len = 0;
        }

        if let Some(previous) = self.previous_action.take() {
            // A pending suspend signal is discarded by SIG_IGN, anything else
            // would either kill the process or run someone else's handler
            if STRAGGLERS.load(Ordering::SeqCst) && previous.sa_sigaction != libc::SIG_IGN {
                let _ = log.write_key_str("event", "suspend-handler-kept", true);
                return;
            }

            // SAFETY: syscall
            if unsafe { libc::sigaction(SUSPEND_SIGNAL, &previous, ptr::null_mut()) } == -1 {
                log_release_failure(log, "suspend-handler");
            }
        }
    }
}

fn log_release_failure(log: &SignalSafeLogger, what: &str) {
    let _ = log.write_key_str("event", "release-failed", false);
    let _ = log.write_key_str("resource", what, false);
    let _ = log.write_key_integer("code", errno::errno().0 as usize, true);
}

/// A raw directory descriptor for `/proc/self/task`
struct TaskDir(libc::c_int);

impl TaskDir {
    fn open() -> Result<Self, Error> {
        // SAFETY: syscall
        let fd = unsafe {
            libc::open(
                c"/proc/self/task".as_ptr(),
                libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
            )
        };

        if fd == -1 {
            Err(Error::last_os_error())
        } else {
            Ok(Self(fd))
        }
    }

    fn rewind(&self) -> Result<(), Error> {
        // SAFETY: syscall
        if unsafe { libc::lseek(self.0, 0, libc::SEEK_SET) } == -1 {
            Err(Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Invokes the callback with every thread id in the directory
    fn for_each_tid(&self, mut f: impl FnMut(libc::pid_t)) -> Result<(), Error> {
        // Byte offsets within `struct linux_dirent64`
        const RECLEN_OFFSET: usize = 16;
        const NAME_OFFSET: usize = 19;

        let mut buf = [0u8; 2048];

        loop {
            // SAFETY: syscall, the buffer is valid for its length
            let read = unsafe {
                libc::syscall(libc::SYS_getdents64, self.0, buf.as_mut_ptr(), buf.len())
            };

            if read < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::Io(err));
            } else if read == 0 {
                return Ok(());
            }

            let entries = &buf[..read as usize];
            let mut offset = 0;
            while offset + NAME_OFFSET <= entries.len() {
                let reclen = u16::from_ne_bytes([
                    entries[offset + RECLEN_OFFSET],
                    entries[offset + RECLEN_OFFSET + 1],
                ]) as usize;

                if reclen == 0 || offset + reclen > entries.len() {
                    break;
                }

                if let Some(tid) = parse_tid(&entries[offset + NAME_OFFSET..offset + reclen]) {
                    f(tid);
                }

                offset += reclen;
            }
        }
    }
}

impl Drop for TaskDir {
    fn drop(&mut self) {
        // SAFETY: syscall, we own the descriptor
        unsafe {
            libc::close(self.0);
        }
    }
}

/// Parses a nul terminated decimal directory entry name, `.` and `..` are
/// rejected along with anything else that isn't a number
fn parse_tid(name: &[u8]) -> Option<libc::pid_t> {
    let name = name.split(|b| *b == 0).next()?;
    if name.is_empty() {
        return None;
    }

    name.iter().try_fold(0 as libc::pid_t, |tid, b| {
        if !b.is_ascii_digit() {
            return None;
        }

        tid.checked_mul(10)?.checked_add((b - b'0') as libc::pid_t)
    })
}

pub(super) fn begin_suspend() {
    ACKNOWLEDGED.store(0, Ordering::SeqCst);

    // Only ever moves from even to odd, a suspension that is already in
    // progress is left alone
    let _ = SUSPEND_WORD.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |word| {
        (word & 1 == 0).then_some(word + 1)
    });
}

pub(super) fn suspend(thread: libc::pid_t) -> Result<(), Error> {
    // SAFETY: syscalls
    let res = unsafe {
        libc::syscall(
            libc::SYS_tgkill,
            libc::getpid(),
            thread,
            SUSPEND_SIGNAL,
        )
    };

    if res < 0 {
        Err(Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Waits until every signalled thread has parked, giving up after roughly a
/// second, eg. because a thread has the suspend signal blocked
pub(super) fn wait_suspended(expected: usize, log: &SignalSafeLogger) {
    // SAFETY: timespec is plain old data
    let mut interval: libc::timespec = unsafe { mem::zeroed() };
    interval.tv_nsec = ACK_POLL_NANOS;

    for _ in 0..ACK_POLL_ATTEMPTS {
        if ACKNOWLEDGED.load(Ordering::SeqCst) >= expected {
            return;
        }

        // SAFETY: syscall
        unsafe {
            libc::nanosleep(&interval, ptr::null_mut());
        }
    }

    STRAGGLERS.store(true, Ordering::SeqCst);

    let _ = log.write_key_str("event", "suspend-timeout", false);
    let _ = log.write_key_integer("expected", expected, false);
    let _ = log.write_key_integer("acknowledged", ACKNOWLEDGED.load(Ordering::SeqCst), true);
}

pub(super) fn begin_resume() {
    if SUSPEND_WORD
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |word| {
            (word & 1 == 1).then_some(word + 1)
        })
        .is_err()
    {
        return;
    }

    // SAFETY: syscall on a valid futex word
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            SUSPEND_WORD.as_ptr(),
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            i32::MAX,
        );
    }
}

/// Threads are released all at once by [`begin_resume`], so there is nothing
/// left to do, or to fail, per thread
#[inline]
pub(super) fn resume(_thread: libc::pid_t) -> Result<(), Error> {
    Ok(())
}

/// Parks the receiving thread until the current suspension ends
unsafe extern "C" fn suspend_handler(
    _signal: i32,
    _info: *mut libc::siginfo_t,
    _uc: *mut libc::c_void,
) {
    let saved = errno::errno();

    let word = SUSPEND_WORD.load(Ordering::SeqCst);
    if word & 1 == 1 {
        ACKNOWLEDGED.fetch_add(1, Ordering::SeqCst);

        while SUSPEND_WORD.load(Ordering::SeqCst) == word {
            // SAFETY: syscall on a valid futex word, spurious wakeups and
            // EINTR are handled by the loop
            unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    SUSPEND_WORD.as_ptr(),
                    libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                    word,
                    ptr::null::<libc::timespec>(),
                );
            }
        }
    }

    errno::set_errno(saved);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_tids() {
        assert_eq!(parse_tid(b"1234\0\0\0"), Some(1234));
        assert_eq!(parse_tid(b"7"), Some(7));
        assert_eq!(parse_tid(b".\0"), None);
        assert_eq!(parse_tid(b"..\0"), None);
        assert_eq!(parse_tid(b"\0"), None);
        assert_eq!(parse_tid(b"12a\0"), None);
        assert_eq!(parse_tid(b"99999999999999\0"), None);
    }
}
