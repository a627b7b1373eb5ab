//! Installation of the fatal signal handlers and the handler itself.
//!
//! The handler is installed with `SA_RESETHAND | SA_NODEFER`. The former
//! means the kernel puts back the default disposition as soon as our handler
//! is entered, so a second identical fault, including one caused by the
//! handler itself, falls through to the default action instead of looping
//! back into us. The latter means that the signal being handled is not
//! blocked while the handler runs, so such a fault is delivered immediately
//! rather than leaving the thread stuck.

pub mod altstack;

use crate::{Error, SharedCrashState, capture::MachineContext, machine};
use std::{
    mem, ptr,
    sync::{
        Arc,
        atomic::{AtomicPtr, AtomicUsize, Ordering},
    },
};

/// The fatal signals that are handled
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum Signal {
    Bus = libc::SIGBUS,
    Abort = libc::SIGABRT,
    Illegal = libc::SIGILL,
    Segv = libc::SIGSEGV,
    Sys = libc::SIGSYS,
}

impl Signal {
    /// Static name of the signal, usable from signal context
    #[inline]
    pub fn name(self) -> &'static str {
        match self {
            Self::Bus => "SIGBUS",
            Self::Abort => "SIGABRT",
            Self::Illegal => "SIGILL",
            Self::Segv => "SIGSEGV",
            Self::Sys => "SIGSYS",
        }
    }

    #[inline]
    pub fn from_raw(signal: i32) -> Option<Self> {
        HANDLED_SIGNALS.into_iter().find(|s| *s as i32 == signal)
    }
}

/// Number of handled signals
pub const SIGNAL_COUNT: usize = 5;

/// The signals the crash handler is installed for, in installation order
pub const HANDLED_SIGNALS: [Signal; SIGNAL_COUNT] = [
    Signal::Bus,
    Signal::Abort,
    Signal::Illegal,
    Signal::Segv,
    Signal::Sys,
];

/// The dispositions that were in place before [`install`], one per handled
/// signal, `None` if our handler could not be swapped in for that signal
pub(crate) struct PreexistingDispositions([Option<libc::sigaction>; SIGNAL_COUNT]);

/// The state the handler operates on. Holds a strong reference created via
/// [`Arc::into_raw`] while installed.
static INSTALLED_STATE: AtomicPtr<SharedCrashState> = AtomicPtr::new(ptr::null_mut());

/// Number of handler invocations that may currently be dereferencing
/// [`INSTALLED_STATE`]
static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

/// Installs the crash handler for every signal in [`HANDLED_SIGNALS`],
/// capturing the previous dispositions into the state so that [`uninstall`]
/// can put them back.
///
/// Every signal is attempted even if an earlier one fails, partial coverage
/// being preferable to none. If any registration fails [`Error::Install`] is
/// returned, with the individual failures logged.
pub fn install(state: &Arc<SharedCrashState>) -> Result<(), Error> {
    let mut preexisting = state.constant.preexisting.lock();

    if preexisting.is_some() {
        return Err(Error::AlreadyInstalled);
    }

    let raw = Arc::into_raw(Arc::clone(state)).cast_mut();
    if INSTALLED_STATE
        .compare_exchange(ptr::null_mut(), raw, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        // SAFETY: the pointer was created by Arc::into_raw just above and was
        // never published
        drop(unsafe { Arc::from_raw(raw) });
        return Err(Error::AlreadyInstalled);
    }

    state.mutable.signal_count.store(0, Ordering::SeqCst);

    // SAFETY: syscalls
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_sigaction = signal_handler as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_RESETHAND | libc::SA_NODEFER | libc::SA_ONSTACK;

        let mut dispositions = [None; SIGNAL_COUNT];
        let mut failed = 0;

        for (signal, slot) in HANDLED_SIGNALS.into_iter().zip(dispositions.iter_mut()) {
            let mut previous = mem::zeroed();
            if libc::sigaction(signal as i32, &action, &mut previous) == -1 {
                log::error!(
                    "unable to install crash handler for {}: {}",
                    signal.name(),
                    std::io::Error::last_os_error()
                );
                failed += 1;
            } else {
                *slot = Some(previous);
            }
        }

        *preexisting = Some(PreexistingDispositions(dispositions));

        if failed > 0 {
            Err(Error::Install { failed })
        } else {
            log::debug!("installed crash handlers for {SIGNAL_COUNT} signals");
            Ok(())
        }
    }
}

/// Restores the dispositions captured by [`install`].
///
/// If any of them cannot be restored, the default disposition is installed
/// for every handled signal instead, so that the process is never left with
/// a handler referring to a state that is about to go away. Once the
/// dispositions are dealt with the state is withdrawn from the handler, and
/// this waits for any handler invocation still using it to finish.
///
/// This must not be called from within the crash handler itself.
pub fn uninstall(state: &SharedCrashState) -> Result<(), Error> {
    uninstall_with(state, restore_preexisting)
}

fn uninstall_with(
    state: &SharedCrashState,
    restore: impl FnOnce(&PreexistingDispositions) -> Result<(), Error>,
) -> Result<(), Error> {
    let mut preexisting = state.constant.preexisting.lock();

    let Some(dispositions) = preexisting.take() else {
        return Ok(());
    };

    let result = match restore(&dispositions) {
        Ok(()) => Ok(()),
        Err(err) => {
            log::warn!("failed to restore preexisting handlers, falling back to defaults: {err}");
            install_default_handlers()
        }
    };

    withdraw(state);
    result
}

/// Withdraws the published state, if it is `state`, and releases the
/// reference held on behalf of the handler
fn withdraw(state: &SharedCrashState) {
    let ours = (state as *const SharedCrashState).cast_mut();
    if INSTALLED_STATE
        .compare_exchange(ours, ptr::null_mut(), Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }

    while IN_FLIGHT.load(Ordering::SeqCst) != 0 {
        std::thread::yield_now();
    }

    // SAFETY: the published pointer was created by Arc::into_raw in install,
    // and no handler can observe it any longer
    drop(unsafe { Arc::from_raw(ours.cast_const()) });
}

fn restore_preexisting(dispositions: &PreexistingDispositions) -> Result<(), Error> {
    let mut failed = 0;

    for (signal, action) in HANDLED_SIGNALS.into_iter().zip(dispositions.0.iter()) {
        // We never swapped this one in, so there is nothing to restore
        let Some(action) = action else {
            continue;
        };

        // SAFETY: syscall
        let res = unsafe {
            if action.sa_sigaction == libc::SIG_DFL {
                set_default_handler(signal)
            } else {
                libc::sigaction(signal as i32, action, ptr::null_mut())
            }
        };

        if res == -1 {
            log::warn!(
                "unable to restore handler for {}: {}",
                signal.name(),
                std::io::Error::last_os_error()
            );
            failed += 1;
        }
    }

    if failed > 0 {
        Err(Error::Install { failed })
    } else {
        Ok(())
    }
}

fn install_default_handlers() -> Result<(), Error> {
    let mut failed = 0;

    for signal in HANDLED_SIGNALS {
        // SAFETY: syscall
        if unsafe { set_default_handler(signal) } == -1 {
            log::error!(
                "unable to install default handler for {}: {}",
                signal.name(),
                std::io::Error::last_os_error()
            );
            failed += 1;
        }
    }

    if failed > 0 {
        Err(Error::Install { failed })
    } else {
        Ok(())
    }
}

/// Sets the disposition of the signal to the default action
///
/// SAFETY: syscall
unsafe fn set_default_handler(signal: Signal) -> i32 {
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_sigaction = libc::SIG_DFL;
        action.sa_flags = 0;

        libc::sigaction(signal as i32, &action, ptr::null_mut())
    }
}

/// Restores `errno` when the handler exits, on every path
struct ErrnoGuard(errno::Errno);

impl Drop for ErrnoGuard {
    #[inline]
    fn drop(&mut self) {
        errno::set_errno(self.0);
    }
}

/// Marks a handler invocation as possibly using [`INSTALLED_STATE`]
struct InFlight;

impl InFlight {
    #[inline]
    fn enter() -> Self {
        IN_FLIGHT.fetch_add(1, Ordering::SeqCst);
        Self
    }
}

impl Drop for InFlight {
    #[inline]
    fn drop(&mut self) {
        IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The function installed for each of [`HANDLED_SIGNALS`], invoked by the
/// kernel on the thread that received the signal.
///
/// Everything this calls must be async signal safe: no allocation, no locks
/// that the interrupted code could be holding, only raw syscalls and atomics.
unsafe extern "C" fn signal_handler(
    signal: i32,
    info: *mut libc::siginfo_t,
    uc: *mut libc::c_void,
) {
    // Declared first so that it is dropped last, after anything else the
    // handler does that may clobber errno
    let _errno = ErrnoGuard(errno::errno());
    let _in_flight = InFlight::enter();

    let state = INSTALLED_STATE.load(Ordering::SeqCst);
    if state.is_null() {
        debug_print!("no crash state installed");
        return;
    }

    // SAFETY: the pointer stays valid until uninstall observes that there
    // are no more handlers in flight
    let state = unsafe { &*state };
    let count = state.mutable.signal_count.fetch_add(1, Ordering::SeqCst) + 1;

    machine::transition(state, machine::Trigger::Entry);

    // No handlers are reinstalled or restored here. SA_RESETHAND has already
    // put the default disposition back for this signal, so any repeat of it
    // terminates the process rather than re-entering us.

    // A null siginfo or context means we were invoked without SA_SIGINFO,
    // eg. someone reinstalled us with `signal`
    if info.is_null() || uc.is_null() {
        debug_print!("invoked without siginfo");
        return;
    }

    // SAFETY: the kernel hands us valid siginfo_t and ucontext_t pointers
    // when SA_SIGINFO is set, which we checked for null above
    let context = unsafe { MachineContext::new(signal, &*info, &*uc.cast::<libc::ucontext_t>()) };

    let log = &state.constant.log;
    if log.is_valid() {
        let _ = log.write_key_str("event", "signal", false);
        let _ = log.write_key_str(
            "signal",
            Signal::from_raw(signal).map_or("unknown", Signal::name),
            false,
        );
        let _ = log.write_key_integer("count", count, false);
        // For raised signals the address overlaps the sender's pid
        let (origin, address) = if context.is_user_generated() {
            ("raised", ptr::null())
        } else {
            ("fault", context.fault_address())
        };

        let _ = log.write_key_str("origin", origin, false);
        let _ = log.write_key_pointer("address", address, true);
    }

    debug_print!("running capture");
    if let Err(err) = state.constant.capture.capture(state, &context) {
        let _ = log.write_key_str("event", "capture-failed", false);
        let _ = log.write_key_str("error", err.kind_str(), false);
        let _ = log.write_key_integer("code", err.code().unwrap_or_default() as usize, true);
    }

    machine::transition(state, machine::Trigger::Exit);
    debug_print!("finishing signal handler");
}
