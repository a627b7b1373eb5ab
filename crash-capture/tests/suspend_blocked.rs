//! A sibling that has the suspend signal blocked never parks, the signal
//! stays pending on it until it unblocks, which must not kill the process.
#![cfg(any(target_os = "linux", target_os = "android"))]

mod shared;

use crash_capture as cc;
use std::{
    sync::{Arc, Barrier},
    time::Duration,
};

fn set_blocked(block: bool) {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGPWR);
        assert_eq!(
            libc::pthread_sigmask(
                if block { libc::SIG_BLOCK } else { libc::SIG_UNBLOCK },
                &set,
                std::ptr::null_mut(),
            ),
            0
        );
    }
}

#[test]
fn pending_suspend_signal_is_harmless() {
    let path = shared::log_path("suspend-blocked");
    let log = cc::SignalSafeLogger::open(&path).expect("failed to open log");

    let blocked = Arc::new(Barrier::new(2));
    let cycled = Arc::new(Barrier::new(2));

    let stubborn = {
        let blocked = blocked.clone();
        let cycled = cycled.clone();
        std::thread::spawn(move || {
            set_blocked(true);
            blocked.wait();
            cycled.wait();

            // Delivers the suspend signal that has been pending all along
            set_blocked(false);
            std::thread::sleep(Duration::from_millis(50));
        })
    };

    blocked.wait();

    let list = cc::ThreadList::initialize(&log).expect("failed to enumerate threads");
    list.suspend_all_except_current().resume_all_except_current();
    list.deinitialize().expect("deinitialize never fails");

    cycled.wait();
    stubborn.join().expect("stubborn thread panicked");

    // Still alive, and the suspend handler is still there to swallow any
    // other signal that is pending somewhere
    assert_ne!(shared::disposition(libc::SIGPWR).sa_sigaction, libc::SIG_DFL);

    let records = shared::read_records(&path);
    assert!(
        records
            .iter()
            .any(|r| shared::field(r, "event") == Some("suspend-timeout")),
        "{records:?}"
    );
    assert!(
        records
            .iter()
            .any(|r| shared::field(r, "event") == Some("suspend-handler-kept")),
        "{records:?}"
    );

    // Later cycles work as normal
    let spinners = shared::Spinners::spawn(2);
    let list = cc::ThreadList::initialize(&log).expect("failed to enumerate threads");
    let suspended = list.suspend_all_except_current();
    let frozen: [usize; 2] = spinners.snapshot();
    std::thread::sleep(Duration::from_millis(20));
    let still_frozen: [usize; 2] = spinners.snapshot();
    suspended.resume_all_except_current();
    list.deinitialize().expect("deinitialize never fails");
    spinners.stop();

    assert_eq!(frozen, still_frozen);

    let _ = std::fs::remove_file(path);
}
