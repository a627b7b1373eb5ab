//! [`CrashReporter`] captures diagnostic state from inside the handler of a
//! fatal signal, before the process is terminated or the previously
//! installed handler gets to run.
//!
//! The following signals are handled
//!
//! ## `SIGBUS`
//!
//! Signal sent to a process when it causes a [bus error](https://en.wikipedia.org/wiki/Bus_error).
//!
//! ## `SIGABRT`
//!
//! Signal sent to a process to tell it to abort, usually raised by the process
//! itself via `std::process::abort` or `libc::abort`.
//!
//! ## `SIGILL`
//!
//! Signal sent to a process when it attempts to execute an **illegal**,
//! malformed, unknown, or privileged, instruction.
//!
//! ## `SIGSEGV`
//!
//! Signal sent to a process when it makes an invalid virtual memory reference,
//! a [segmentation fault](https://en.wikipedia.org/wiki/Segmentation_fault).
//!
//! ## `SIGSYS`
//!
//! Signal sent to a process when it passes a bad argument to a system call, or
//! makes a system call forbidden by a seccomp filter.
//!
//! # Handling a signal
//!
//! When one of these signals is delivered the handler
//!
//! 1. saves `errno`
//! 2. moves the [`CrashState`] from its entry state, see [`machine`]
//! 3. writes a record for the signal to the crash log
//! 4. runs the [`CrashCapture`] collaborator, by default [`ThreadCapture`],
//!    which suspends every other thread, records them, and resumes them
//! 5. moves the [`CrashState`] to its exit state
//! 6. restores `errno`
//!
//! The handlers are installed with `SA_RESETHAND`, so once the handler
//! returns the signal is at its default disposition, and a repeat of the
//! fault terminates the process.
//!
//! Everything that runs in the handler is async signal safe. The crash log is
//! written with [`SignalSafeLogger`], which never allocates or locks. Errors
//! during setup and teardown are reported through the [`log`](https://docs.rs/log)
//! facade, which is never used from the handler.

#![allow(unsafe_code)]

#[cfg(feature = "debug-print")]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {
        let cstr = concat!($s, "\n");
        $crate::write_stderr(cstr);
    };
}

#[cfg(not(feature = "debug-print"))]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {};
}

/// Writes the specified string directly to stderr.
///
/// This is safe to be called from within a compromised context.
#[inline]
pub fn write_stderr(s: &'static str) {
    unsafe {
        libc::write(2, s.as_ptr().cast(), s.len());
    }
}

mod capture;
mod error;
mod logger;
pub mod machine;
mod reporter;
pub mod signal;
mod state;
pub mod thread;

pub use capture::{CrashCapture, MachineContext, ThreadCapture, make_crash_capture};
pub use error::Error;
pub use logger::SignalSafeLogger;
pub use reporter::{CrashReporter, Options};
pub use signal::{HANDLED_SIGNALS, Signal};
pub use state::{AtomicCrashState, CrashState, SharedCrashState};
pub use thread::{SuspendedThreads, ThreadHandle, ThreadList};
