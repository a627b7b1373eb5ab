//! Transitions of the [`CrashState`] stored in a [`SharedCrashState`].
//!
//! | Trigger            | From                                 | To                                          |
//! |--------------------|--------------------------------------|---------------------------------------------|
//! | `Entry`            | `Initialized`                        | `FirstSignal`                               |
//! | `Entry`            | `FirstMachExceptionReplied`          | `FirstSignalAfterMachExceptionReplied`      |
//! | `Exit`             | `FirstSignal`                        | `FirstSignalHandled`                        |
//! | `Exit`             | `FirstSignalAfterMachExceptionReplied` | `FirstSignalHandledAfterMachExceptionReplied` |
//! | `ExceptionReplied` | `Initialized`                        | `FirstMachExceptionReplied`                 |
//!
//! Every other pair is invalid. Invalid pairs are recorded in the crash log
//! and the state is left untouched, there is no attempt at guessing what the
//! state should have been.

use crate::{CrashState, SharedCrashState};

/// What is driving the transition
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// The signal handler was entered
    Entry,
    /// The signal handler is about to return
    Exit,
    /// The exception delivery path replied to an exception before any signal
    /// was handled
    ExceptionReplied,
}

impl Trigger {
    #[inline]
    pub fn name(self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Exit => "exit",
            Self::ExceptionReplied => "exception-replied",
        }
    }
}

/// The outcome of [`transition`]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    /// The state was moved
    Moved { from: CrashState, to: CrashState },
    /// The trigger is not valid for the state, which was left unchanged
    Invalid(CrashState),
    /// Another thread changed the state between the load and the store. The
    /// state holds whatever that thread stored.
    Lost {
        expected: CrashState,
        found: Result<CrashState, u8>,
    },
    /// The stored byte is not a [`CrashState`]
    Corrupt(u8),
}

/// The state that `trigger` moves `from` to, if the pair is valid
#[inline]
pub const fn next(trigger: Trigger, from: CrashState) -> Option<CrashState> {
    use CrashState as Cs;

    match (trigger, from) {
        (Trigger::Entry, Cs::Initialized) => Some(Cs::FirstSignal),
        (Trigger::Entry, Cs::FirstMachExceptionReplied) => {
            Some(Cs::FirstSignalAfterMachExceptionReplied)
        }
        (Trigger::Exit, Cs::FirstSignal) => Some(Cs::FirstSignalHandled),
        (Trigger::Exit, Cs::FirstSignalAfterMachExceptionReplied) => {
            Some(Cs::FirstSignalHandledAfterMachExceptionReplied)
        }
        (Trigger::ExceptionReplied, Cs::Initialized) => Some(Cs::FirstMachExceptionReplied),
        _ => None,
    }
}

/// Applies `trigger` to the crash state as a single compare and swap.
///
/// This is safe to call from a signal handler. Anything other than
/// [`Transition::Moved`] is recorded in the crash log.
pub fn transition(state: &SharedCrashState, trigger: Trigger) -> Transition {
    let cell = &state.mutable.crash_state;
    let log = &state.constant.log;

    let current = match cell.load() {
        Ok(current) => current,
        Err(raw) => {
            let _ = log.write_key_str("event", "corrupt-state", false);
            let _ = log.write_key_str("trigger", trigger.name(), false);
            let _ = log.write_key_integer("raw", raw as usize, true);
            return Transition::Corrupt(raw);
        }
    };

    let Some(to) = next(trigger, current) else {
        let _ = log.write_key_str("event", "invalid-transition", false);
        let _ = log.write_key_str("trigger", trigger.name(), false);
        let _ = log.write_key_str("state", current.name(), true);
        return Transition::Invalid(current);
    };

    match cell.compare_exchange(current, to) {
        Ok(from) => Transition::Moved { from, to },
        Err(found) => {
            let _ = log.write_key_str("event", "lost-transition", false);
            let _ = log.write_key_str("trigger", trigger.name(), false);
            let _ = log.write_key_str("expected", current.name(), false);
            match found {
                Ok(found) => {
                    let _ = log.write_key_str("found", found.name(), true);
                }
                Err(raw) => {
                    let _ = log.write_key_integer("found", raw as usize, true);
                }
            }

            Transition::Lost {
                expected: current,
                found,
            }
        }
    }
}

/// Entry point for the exception delivery path, marking that it replied to
/// an exception before any signal was handled
#[inline]
pub fn exception_replied(state: &SharedCrashState) -> Transition {
    transition(state, Trigger::ExceptionReplied)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{SignalSafeLogger, capture::ThreadCapture};

    fn state_with_log() -> (SharedCrashState, std::path::PathBuf) {
        let path =
            std::env::temp_dir().join(format!("crash-machine-{}.log", uuid::Uuid::new_v4()));
        let log = SignalSafeLogger::open(&path).unwrap();
        (SharedCrashState::new(log, Box::new(ThreadCapture)), path)
    }

    fn take_log(path: &std::path::Path) -> String {
        let contents = std::fs::read_to_string(path).unwrap_or_default();
        let _ = std::fs::remove_file(path);
        contents
    }

    #[test]
    fn first_signal_path() {
        let (state, path) = state_with_log();

        assert_eq!(
            transition(&state, Trigger::Entry),
            Transition::Moved {
                from: CrashState::Initialized,
                to: CrashState::FirstSignal
            }
        );
        assert_eq!(
            transition(&state, Trigger::Exit),
            Transition::Moved {
                from: CrashState::FirstSignal,
                to: CrashState::FirstSignalHandled
            }
        );
        assert_eq!(state.crash_state(), Ok(CrashState::FirstSignalHandled));
        assert!(take_log(&path).is_empty());
    }

    #[test]
    fn mach_exception_path() {
        let (state, path) = state_with_log();

        assert!(matches!(
            exception_replied(&state),
            Transition::Moved { .. }
        ));
        assert!(matches!(
            transition(&state, Trigger::Entry),
            Transition::Moved { .. }
        ));
        assert!(matches!(
            transition(&state, Trigger::Exit),
            Transition::Moved { .. }
        ));

        assert_eq!(
            state.crash_state(),
            Ok(CrashState::FirstSignalHandledAfterMachExceptionReplied)
        );
        assert!(take_log(&path).is_empty());
    }

    #[test]
    fn invalid_pairs_are_untouched() {
        for trigger in [Trigger::Entry, Trigger::Exit, Trigger::ExceptionReplied] {
            for from in CrashState::ALL {
                if next(trigger, from).is_some() {
                    continue;
                }

                let (state, path) = state_with_log();
                state.mutable.crash_state.store(from);

                assert_eq!(transition(&state, trigger), Transition::Invalid(from));
                assert_eq!(state.crash_state(), Ok(from));

                assert_eq!(
                    take_log(&path),
                    format!(
                        "event: invalid-transition, trigger: {}, state: {}\n",
                        trigger.name(),
                        from.name()
                    )
                );
            }
        }
    }

    #[test]
    fn corrupt_state_is_reported() {
        let (state, path) = state_with_log();
        state.mutable.crash_state.store_raw(0xfe);

        assert_eq!(transition(&state, Trigger::Entry), Transition::Corrupt(0xfe));
        assert_eq!(state.crash_state(), Err(0xfe));
        assert_eq!(
            take_log(&path),
            "event: corrupt-state, trigger: entry, raw: 0xfe\n"
        );
    }

    #[test]
    fn racing_entries_leave_a_valid_state() {
        let (state, path) = state_with_log();
        let state = std::sync::Arc::new(state);

        let results: Vec<_> = (0..8)
            .map(|_| {
                let state = state.clone();
                std::thread::spawn(move || transition(&state, Trigger::Entry))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|jh| jh.join().unwrap())
            .collect();

        let moved = results
            .iter()
            .filter(|t| matches!(t, Transition::Moved { .. }))
            .count();
        assert_eq!(moved, 1);
        assert_eq!(state.crash_state(), Ok(CrashState::FirstSignal));

        let _ = take_log(&path);
    }
}
