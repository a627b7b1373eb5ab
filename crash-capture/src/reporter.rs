use crate::{CrashCapture, Error, SharedCrashState, SignalSafeLogger, signal};
use std::{path::PathBuf, sync::Arc};

/// Options for [`CrashReporter::attach`]
#[derive(Clone, Debug)]
pub struct Options {
    log_path: PathBuf,
    alternate_stack: bool,
}

impl Options {
    /// Creates options that write the crash log to the specified path
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
            alternate_stack: true,
        }
    }

    /// Whether an alternate signal stack is installed on the attaching thread
    /// if it doesn't already have one, defaults to `true`.
    ///
    /// Without an alternate stack a stack overflow can't be handled, as the
    /// handler would need to run on the very stack that overflowed.
    pub fn alternate_stack(mut self, install: bool) -> Self {
        self.alternate_stack = install;
        self
    }

    #[inline]
    pub fn log_path(&self) -> &std::path::Path {
        &self.log_path
    }
}

/// Owns a [`SharedCrashState`] and the signal handlers installed for it
///
/// Only one can be attached at any one time. The handlers are uninstalled
/// when this is dropped.
pub struct CrashReporter {
    state: Arc<SharedCrashState>,
    _alt_stack: Option<signal::altstack::AltStack>,
}

impl CrashReporter {
    /// Opens the crash log and installs the signal handlers.
    ///
    /// The capture collaborator runs in a compromised context, see
    /// [`CrashCapture`] for what it can and can't do.
    ///
    /// If only some of the handlers could be installed the reporter is still
    /// returned, as partial coverage is better than none, with the failures
    /// reported on the diagnostic log.
    pub fn attach(options: Options, capture: Box<dyn CrashCapture>) -> Result<Self, Error> {
        let log = SignalSafeLogger::open(&options.log_path)?;

        let alt_stack = if options.alternate_stack {
            signal::altstack::AltStack::install()?
        } else {
            None
        };

        let state = Arc::new(SharedCrashState::new(log, capture));

        match signal::install(&state) {
            Ok(()) => {}
            Err(Error::Install { failed }) => {
                log::warn!(
                    "{failed} of {} crash handlers failed to install, continuing with the rest",
                    signal::SIGNAL_COUNT
                );
            }
            Err(err) => return Err(err),
        }

        log::debug!("crash reporter attached, logging to {}", options.log_path.display());

        Ok(Self {
            state,
            _alt_stack: alt_stack,
        })
    }

    /// The state the installed handlers operate on
    #[inline]
    pub fn state(&self) -> &Arc<SharedCrashState> {
        &self.state
    }

    /// Uninstalls the handlers, restoring the ones that were installed before
    /// [`Self::attach`].
    ///
    /// This is done automatically when the [`CrashReporter`] is dropped.
    #[inline]
    pub fn detach(self) {
        drop(self);
    }
}

impl Drop for CrashReporter {
    fn drop(&mut self) {
        if let Err(err) = signal::uninstall(&self.state) {
            log::error!("failed to uninstall crash handlers: {err}");
        }
    }
}
