//! An alternate signal stack for the attaching thread, so that a `SIGSEGV`
//! caused by a stack overflow still has a stack to run the handler on.

use crate::Error;
use std::{mem, ptr};

// std::cmp::max is not const :(
const fn stack_size() -> usize {
    if libc::SIGSTKSZ > 16 * 1024 {
        libc::SIGSTKSZ
    } else {
        16 * 1024
    }
}

/// The size of the mapped alternate stack, not counting the guard page.
///
/// The memory is only committed if the handler actually runs on it.
pub const ALT_STACK_SIZE: usize = stack_size();

/// An alternate stack mapped and registered by [`AltStack::install`].
///
/// Dropping it restores the previous alternate stack and unmaps the memory.
pub struct AltStack {
    /// Base of the mapping, including the guard page
    mapping: *mut libc::c_void,
    mapping_len: usize,
    previous: Option<libc::stack_t>,
    ours: libc::stack_t,
}

impl AltStack {
    /// Registers an alternate signal stack for the calling thread, unless it
    /// already has one that is large enough, in which case `None` is
    /// returned and nothing is changed.
    pub fn install() -> Result<Option<Self>, Error> {
        // SAFETY: syscalls
        unsafe {
            let mut current: libc::stack_t = mem::zeroed();
            if libc::sigaltstack(ptr::null(), &mut current) == -1 {
                return Err(Error::last_os_error());
            }

            if current.ss_flags & libc::SS_DISABLE == 0 && current.ss_size >= ALT_STACK_SIZE {
                return Ok(None);
            }

            let guard_size = libc::sysconf(libc::_SC_PAGESIZE) as usize;
            let mapping_len = guard_size + ALT_STACK_SIZE;

            let mapping = libc::mmap(
                ptr::null_mut(),
                mapping_len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            if mapping == libc::MAP_FAILED {
                return Err(Error::OutOfMemory);
            }

            // Everything above the guard page is usable stack
            let stack_ptr = mapping.cast::<u8>().add(guard_size).cast::<libc::c_void>();
            if libc::mprotect(stack_ptr, ALT_STACK_SIZE, libc::PROT_READ | libc::PROT_WRITE) == -1
            {
                let err = Error::last_os_error();
                libc::munmap(mapping, mapping_len);
                return Err(err);
            }

            let ours = libc::stack_t {
                ss_sp: stack_ptr,
                ss_flags: 0,
                ss_size: ALT_STACK_SIZE,
            };

            if libc::sigaltstack(&ours, ptr::null_mut()) == -1 {
                let err = Error::last_os_error();
                libc::munmap(mapping, mapping_len);
                return Err(err);
            }

            log::debug!("installed {ALT_STACK_SIZE} byte alternate signal stack");

            Ok(Some(Self {
                mapping,
                mapping_len,
                previous: (current.ss_flags & libc::SS_DISABLE == 0).then_some(current),
                ours,
            }))
        }
    }
}

impl Drop for AltStack {
    fn drop(&mut self) {
        // SAFETY: syscalls
        unsafe {
            let mut current: libc::stack_t = mem::zeroed();
            if libc::sigaltstack(ptr::null(), &mut current) == -1 {
                log::warn!(
                    "unable to query alternate signal stack: {}",
                    std::io::Error::last_os_error()
                );
                return;
            }

            // If the stack registered for this thread is not ours we are being
            // dropped on a different thread than the one we were installed on.
            // The mapping might still be in use there, so leak it rather than
            // pulling it out from under that thread.
            if current.ss_sp != self.ours.ss_sp {
                log::warn!("alternate signal stack dropped on a different thread, leaking it");
                return;
            }

            let restore = self.previous.unwrap_or_else(|| {
                let mut disable: libc::stack_t = mem::zeroed();
                disable.ss_flags = libc::SS_DISABLE;
                disable
            });

            if libc::sigaltstack(&restore, ptr::null_mut()) == -1 {
                log::warn!(
                    "unable to restore previous alternate signal stack: {}",
                    std::io::Error::last_os_error()
                );
                return;
            }

            if libc::munmap(self.mapping, self.mapping_len) == -1 {
                log::warn!(
                    "unable to unmap alternate signal stack: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
    }
}

// SAFETY: the mapping is only ever touched through syscalls, and Drop checks
// which thread it is running on before unmapping
unsafe impl Send for AltStack {}

#[cfg(test)]
mod test {
    use super::*;

    fn current_stack() -> libc::stack_t {
        unsafe {
            let mut current: libc::stack_t = mem::zeroed();
            assert_eq!(libc::sigaltstack(ptr::null(), &mut current), 0);
            current
        }
    }

    #[test]
    fn installs_and_restores() {
        // Run on a fresh thread so we don't interfere with the stack std sets
        // up for the test harness threads
        std::thread::spawn(|| {
            let before = current_stack();

            let stack = AltStack::install().expect("failed to install alt stack");
            if let Some(stack) = stack {
                let installed = current_stack();
                assert_eq!(installed.ss_sp, stack.ours.ss_sp);
                assert!(installed.ss_size >= ALT_STACK_SIZE);

                drop(stack);
            }

            let after = current_stack();
            assert_eq!(before.ss_sp, after.ss_sp);
            assert_eq!(
                before.ss_flags & libc::SS_DISABLE,
                after.ss_flags & libc::SS_DISABLE
            );
        })
        .join()
        .unwrap();
    }
}
