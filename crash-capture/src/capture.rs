use crate::{Error, SharedCrashState, SignalSafeLogger, ThreadList};

/// User implemented collaborator that captures whatever forensic data it
/// wants when a fatal signal is handled.
///
/// # Safety
///
/// This trait is marked unsafe as [`Self::capture`] is run from within a
/// signal handler, where only a small subset of libc functions are
/// [async signal safe](https://man7.org/linux/man-pages/man7/signal-safety.7.html).
/// Allocating, taking locks, or doing formatted I/O can deadlock or corrupt
/// the process further. Do as little as possible, and prepare anything more
/// complicated before the handler is installed.
pub unsafe trait CrashCapture: Send + Sync {
    /// Invoked once per handled signal, on the thread that received it.
    ///
    /// Errors are recorded in the crash log by the handler, they do not stop
    /// the handler from completing.
    fn capture(&self, state: &SharedCrashState, context: &MachineContext<'_>) -> Result<(), Error>;
}

/// Creates a [`CrashCapture`] using the supplied closure as the implementation.
///
/// # Safety
///
/// See the [`CrashCapture`] Safety section for information on why this is `unsafe`.
#[inline]
pub unsafe fn make_crash_capture<F>(closure: F) -> Box<dyn CrashCapture>
where
    F: Send + Sync + Fn(&SharedCrashState, &MachineContext<'_>) -> Result<(), Error> + 'static,
{
    struct Wrapper<F> {
        inner: F,
    }

    unsafe impl<F> CrashCapture for Wrapper<F>
    where
        F: Send + Sync + Fn(&SharedCrashState, &MachineContext<'_>) -> Result<(), Error>,
    {
        fn capture(
            &self,
            state: &SharedCrashState,
            context: &MachineContext<'_>,
        ) -> Result<(), Error> {
            (self.inner)(state, context)
        }
    }

    Box::new(Wrapper { inner: closure })
}

/// The machine context the kernel handed to the signal handler
pub struct MachineContext<'uc> {
    signal: i32,
    info: &'uc libc::siginfo_t,
    context: &'uc libc::ucontext_t,
}

impl<'uc> MachineContext<'uc> {
    #[inline]
    pub(crate) fn new(
        signal: i32,
        info: &'uc libc::siginfo_t,
        context: &'uc libc::ucontext_t,
    ) -> Self {
        Self {
            signal,
            info,
            context,
        }
    }

    #[inline]
    pub fn signal(&self) -> i32 {
        self.signal
    }

    #[inline]
    pub fn siginfo(&self) -> &'uc libc::siginfo_t {
        self.info
    }

    #[inline]
    pub fn ucontext(&self) -> &'uc libc::ucontext_t {
        self.context
    }

    /// The `si_code` of the signal
    #[inline]
    pub fn code(&self) -> i32 {
        self.info.si_code
    }

    /// True if the signal was sent by `kill`, `raise` or similar rather than
    /// being caused by a hardware fault
    #[inline]
    pub fn is_user_generated(&self) -> bool {
        self.info.si_code <= 0
    }

    /// The faulting address for memory faults, meaningless for user generated
    /// signals
    #[inline]
    pub fn fault_address(&self) -> *const libc::c_void {
        cfg_if::cfg_if! {
            if #[cfg(any(target_os = "linux", target_os = "android"))] {
                // SAFETY: reads the union field, which is valid for every
                // signal we handle
                unsafe { self.info.si_addr().cast_const() }
            } else {
                self.info.si_addr.cast_const()
            }
        }
    }

    /// The instruction pointer of the interrupted thread, if known for this
    /// target
    pub fn instruction_pointer(&self) -> Option<usize> {
        cfg_if::cfg_if! {
            if #[cfg(all(target_os = "linux", target_arch = "x86_64"))] {
                Some(self.context.uc_mcontext.gregs[libc::REG_RIP as usize] as usize)
            } else if #[cfg(all(target_os = "linux", target_arch = "aarch64"))] {
                Some(self.context.uc_mcontext.pc as usize)
            } else if #[cfg(all(target_os = "macos", target_arch = "x86_64"))] {
                // SAFETY: the kernel points uc_mcontext at the saved state,
                // checked for null
                unsafe { self.context.uc_mcontext.as_ref().map(|mc| mc.__ss.__rip as usize) }
            } else if #[cfg(all(target_os = "macos", target_arch = "aarch64"))] {
                // SAFETY: as above
                unsafe { self.context.uc_mcontext.as_ref().map(|mc| mc.__ss.__pc as usize) }
            } else {
                None
            }
        }
    }

    /// The stack pointer of the interrupted thread, if known for this target
    pub fn stack_pointer(&self) -> Option<usize> {
        cfg_if::cfg_if! {
            if #[cfg(all(target_os = "linux", target_arch = "x86_64"))] {
                Some(self.context.uc_mcontext.gregs[libc::REG_RSP as usize] as usize)
            } else if #[cfg(all(target_os = "linux", target_arch = "aarch64"))] {
                Some(self.context.uc_mcontext.sp as usize)
            } else if #[cfg(all(target_os = "macos", target_arch = "x86_64"))] {
                // SAFETY: the kernel points uc_mcontext at the saved state,
                // checked for null
                unsafe { self.context.uc_mcontext.as_ref().map(|mc| mc.__ss.__rsp as usize) }
            } else if #[cfg(all(target_os = "macos", target_arch = "aarch64"))] {
                // SAFETY: as above
                unsafe { self.context.uc_mcontext.as_ref().map(|mc| mc.__ss.__sp as usize) }
            } else {
                None
            }
        }
    }

    /// Writes a record for the thread the signal was delivered on
    pub fn log_faulting_thread(
        &self,
        log: &SignalSafeLogger,
        handle: crate::ThreadHandle,
    ) -> Result<(), Error> {
        log.write_key_str("thread", "current", false)?;
        log.write_key_integer("handle", handle as usize, false)?;
        log.write_key_integer("pc", self.instruction_pointer().unwrap_or_default(), false)?;
        log.write_key_integer("sp", self.stack_pointer().unwrap_or_default(), true)
    }
}

/// The default [`CrashCapture`].
///
/// Records the faulting thread's registers from the machine context, then
/// suspends every other thread, records each of them, and resumes them.
pub struct ThreadCapture;

unsafe impl CrashCapture for ThreadCapture {
    fn capture(&self, state: &SharedCrashState, context: &MachineContext<'_>) -> Result<(), Error> {
        let log = state.log();
        let list = ThreadList::initialize(log)?;

        // The faulting thread is never suspended, so it is logged here from
        // the machine context rather than by the thread list
        let current = context.log_faulting_thread(log, list.current());
        let siblings = list.log_threads(state);

        list.deinitialize()?;
        current.and(siblings)
    }
}
