/// An error that can occur while attaching, detaching, or running inside the
/// crash handler.
///
/// None of the variants allocate, so an [`Error`] can be created and inspected
/// from within a signal handler.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A required argument (file descriptor, pointer, handle) was missing or
    /// otherwise unusable
    #[error("a required argument was null or otherwise invalid")]
    ArgumentInvalid,
    /// Only one [`crate::SharedCrashState`] can be installed at any one time
    #[error("a crash handler is already installed")]
    AlreadyInstalled,
    /// Another thread currently owns the thread controller, which happens when
    /// more than one thread is handling a crash at the same time
    #[error("another thread is currently suspending the process")]
    Busy,
    /// One or more of the handled signals could not be registered, the
    /// remaining ones are still active
    #[error("failed to register {failed} signal handler(s)")]
    Install { failed: usize },
    /// Unable to `mmap` memory
    #[error("unable to allocate memory")]
    OutOfMemory,
    /// An I/O or other syscall failed
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// A Mach call returned something other than `KERN_SUCCESS`
    #[cfg(target_os = "macos")]
    #[error("mach call failed with kern_return_t {0}")]
    Kern(mach2::kern_return::kern_return_t),
}

impl Error {
    /// A short, static description of the error kind, used when the error
    /// needs to be recorded from signal context where formatting is not
    /// possible
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::ArgumentInvalid => "argument-invalid",
            Self::AlreadyInstalled => "already-installed",
            Self::Busy => "busy",
            Self::Install { .. } => "install",
            Self::OutOfMemory => "out-of-memory",
            Self::Io(_) => "io",
            #[cfg(target_os = "macos")]
            Self::Kern(_) => "kern",
        }
    }

    /// The raw OS error code, if any
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Io(err) => err.raw_os_error(),
            #[cfg(target_os = "macos")]
            Self::Kern(kr) => Some(*kr),
            _ => None,
        }
    }

    /// Captures `errno` for the syscall that just failed.
    ///
    /// This does not allocate.
    #[inline]
    pub(crate) fn last_os_error() -> Self {
        Self::Io(std::io::Error::last_os_error())
    }
}
