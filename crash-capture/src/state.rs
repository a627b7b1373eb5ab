//! The process-wide record shared between the installer and the signal
//! handler.

use crate::{CrashCapture, SignalSafeLogger, signal::PreexistingDispositions};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Where the crash handling of the process currently is.
///
/// The state only moves through the transitions in [`crate::machine`]. The
/// Mach states are entered by the exception delivery path, which can respond
/// to a fault before the equivalent signal is delivered.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CrashState {
    Initialized = 0,
    FirstSignal = 1,
    FirstSignalHandled = 2,
    FirstMachExceptionReplied = 3,
    FirstSignalAfterMachExceptionReplied = 4,
    FirstSignalHandledAfterMachExceptionReplied = 5,
}

impl CrashState {
    pub const ALL: [Self; 6] = [
        Self::Initialized,
        Self::FirstSignal,
        Self::FirstSignalHandled,
        Self::FirstMachExceptionReplied,
        Self::FirstSignalAfterMachExceptionReplied,
        Self::FirstSignalHandledAfterMachExceptionReplied,
    ];

    /// Static name of the state, usable from signal context
    pub fn name(self) -> &'static str {
        match self {
            Self::Initialized => "Initialized",
            Self::FirstSignal => "FirstSignal",
            Self::FirstSignalHandled => "FirstSignalHandled",
            Self::FirstMachExceptionReplied => "FirstMachExceptionReplied",
            Self::FirstSignalAfterMachExceptionReplied => "FirstSignalAfterMachExceptionReplied",
            Self::FirstSignalHandledAfterMachExceptionReplied => {
                "FirstSignalHandledAfterMachExceptionReplied"
            }
        }
    }
}

impl TryFrom<u8> for CrashState {
    type Error = u8;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        Self::ALL.get(raw as usize).copied().ok_or(raw)
    }
}

/// A [`CrashState`] that can be shared between threads.
///
/// The raw byte is validated on every load, a value outside of the enum is
/// returned as an error rather than being turned into a `CrashState`.
#[derive(Debug)]
pub struct AtomicCrashState(AtomicU8);

impl AtomicCrashState {
    #[inline]
    pub const fn new(state: CrashState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    #[inline]
    pub fn load(&self) -> Result<CrashState, u8> {
        CrashState::try_from(self.0.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn store(&self, state: CrashState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Stores `new` if the current value is `current`. On failure the value
    /// that was actually found is returned.
    #[inline]
    pub fn compare_exchange(
        &self,
        current: CrashState,
        new: CrashState,
    ) -> Result<CrashState, Result<CrashState, u8>> {
        self.0
            .compare_exchange(current as u8, new as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| current)
            .map_err(CrashState::try_from)
    }

    #[cfg(test)]
    pub(crate) fn store_raw(&self, raw: u8) {
        self.0.store(raw, Ordering::SeqCst);
    }
}

/// Set before the handlers are armed, never written from the signal handler
pub(crate) struct ConstantState {
    pub(crate) log: SignalSafeLogger,
    pub(crate) capture: Box<dyn CrashCapture>,
    /// Only touched by [`crate::signal::install`] and
    /// [`crate::signal::uninstall`], the lock serializes those two outside of
    /// signal context and is never taken by the handler
    pub(crate) preexisting: parking_lot::Mutex<Option<PreexistingDispositions>>,
}

/// Updated concurrently from the signal handler, only ever via atomics
pub(crate) struct MutableState {
    pub(crate) signal_count: AtomicUsize,
    pub(crate) crash_state: AtomicCrashState,
}

/// The single record that the signal handler operates on.
///
/// It is split into a constant partition, which is fully initialized before
/// any handler is armed, and a mutable partition that the handler (possibly
/// on several threads at once) updates with atomic operations only.
pub struct SharedCrashState {
    pub(crate) constant: ConstantState,
    pub(crate) mutable: MutableState,
}

impl SharedCrashState {
    /// Creates the state that [`crate::signal::install`] will publish to the
    /// signal handler
    pub fn new(log: SignalSafeLogger, capture: Box<dyn CrashCapture>) -> Self {
        Self {
            constant: ConstantState {
                log,
                capture,
                preexisting: parking_lot::Mutex::new(None),
            },
            mutable: MutableState {
                signal_count: AtomicUsize::new(0),
                crash_state: AtomicCrashState::new(CrashState::Initialized),
            },
        }
    }

    /// The crash log
    #[inline]
    pub fn log(&self) -> &SignalSafeLogger {
        &self.constant.log
    }

    /// The number of times the signal handler has been entered since the last
    /// install
    #[inline]
    pub fn signal_count(&self) -> usize {
        self.mutable.signal_count.load(Ordering::SeqCst)
    }

    /// The current crash state, or the raw byte if it has been corrupted
    #[inline]
    pub fn crash_state(&self) -> Result<CrashState, u8> {
        self.mutable.crash_state.load()
    }

    /// True if this state has its handlers installed
    #[inline]
    pub fn is_installed(&self) -> bool {
        self.constant.preexisting.lock().is_some()
    }
}
