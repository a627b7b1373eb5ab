//! Various ways of making the current process receive one of the fatal
//! signals, for testing crash handlers against.

use std::{arch::asm, io, path::Path};

/// The different kinds of sadness available
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SadnessFlavor {
    /// `SIGBUS`
    Bus,
    /// `SIGABRT`
    Abort,
    /// `SIGILL`
    Illegal,
    /// `SIGSEGV`
    Segfault,
    /// `SIGSYS`
    BadSystemCall,
}

impl SadnessFlavor {
    /// The signal number this flavor is expected to raise
    pub fn signal(self) -> i32 {
        match self {
            Self::Bus => libc::SIGBUS,
            Self::Abort => libc::SIGABRT,
            Self::Illegal => libc::SIGILL,
            Self::Segfault => libc::SIGSEGV,
            Self::BadSystemCall => libc::SIGSYS,
        }
    }

    /// Does the sadness.
    ///
    /// If a handler for the signal returns, the sadness is repeated, so this
    /// only returns if the process somehow survives that as well, eg. because
    /// the signal is being ignored.
    pub fn make_sad(self) {
        match self {
            Self::Bus => {
                let path = std::env::temp_dir().join(format!("sadness-{}.bus", std::process::id()));
                if let Err(err) = raise_bus(&path) {
                    eprintln!("unable to cause a bus error with {}: {err}", path.display());
                }
                let _ = std::fs::remove_file(&path);
            }
            Self::Abort => raise_abort(),
            Self::Illegal => raise_illegal_instruction(),
            Self::Segfault => raise_segfault(),
            Self::BadSystemCall => raise_bad_system_call(),
        }
    }
}

/// Raises `SIGABRT`
pub fn raise_abort() {
    std::process::abort();
}

/// Raises `SIGSEGV` by reading through a null pointer
pub fn raise_segfault() {
    // avoid deref_nullptr lint
    fn definitely_not_null() -> *const u32 {
        std::ptr::null()
    }

    loop {
        // SAFETY: it's not, that's the point
        let s = unsafe { definitely_not_null().read_volatile() };
        println!("we are crashing by accessing a null reference: {s}");
    }
}

/// Raises `SIGILL` by executing an undefined instruction
pub fn raise_illegal_instruction() {
    loop {
        // SAFETY: it's not, that's the point
        unsafe {
            #[cfg(target_arch = "x86_64")]
            asm!("ud2");
            #[cfg(target_arch = "aarch64")]
            asm!("udf #0");
        }
    }
}

/// Raises `SIGBUS` by reading from a shared mapping of a file that is
/// smaller than the mapping.
///
/// The file at `path` is created (or truncated) and is not removed.
pub fn raise_bus(path: &Path) -> io::Result<()> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;

    use std::os::fd::AsRawFd;

    // SAFETY: syscall
    let mapping = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            128,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };

    if mapping == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }

    let mapping = mapping.cast::<u8>();
    loop {
        // SAFETY: the mapping is valid, the file backing it is not
        let byte = unsafe { mapping.add(1).read_volatile() };
        println!("{byte}");
    }
}

/// Raises `SIGSYS`.
///
/// A bad system call only produces the signal when a seccomp filter forbids
/// it, which is far too invasive for a test, so the signal is raised directly.
pub fn raise_bad_system_call() {
    loop {
        // SAFETY: syscall
        unsafe {
            libc::raise(libc::SIGSYS);
        }
    }
}
