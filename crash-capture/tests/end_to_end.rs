mod shared;

use crash_capture::{self as cc, CrashCapture};

#[test]
fn handles_raised_segv() {
    let path = shared::log_path("end-to-end");

    let reporter = cc::CrashReporter::attach(
        cc::Options::new(&path),
        unsafe {
            cc::make_crash_capture(|state, context| {
                // Clobber errno, the handler must put it back regardless
                errno::set_errno(errno::Errno(99));

                if context.signal() != libc::SIGSEGV || !context.is_user_generated() {
                    return Err(cc::Error::ArgumentInvalid);
                }

                cc::ThreadCapture.capture(state, context)
            })
        },
    )
    .expect("failed to attach");

    let spinners = shared::Spinners::spawn(4);

    errno::set_errno(errno::Errno(1234));
    unsafe {
        libc::raise(libc::SIGSEGV);
    }
    let after = errno::errno().0;

    let state = reporter.state().clone();
    spinners.stop();

    assert_eq!(after, 1234);
    assert_eq!(state.signal_count(), 1);
    assert_eq!(state.crash_state(), Ok(cc::CrashState::FirstSignalHandled));

    // SA_RESETHAND means the next SIGSEGV would be fatal
    assert_eq!(shared::disposition(libc::SIGSEGV).sa_sigaction, libc::SIG_DFL);

    reporter.detach();

    let records = shared::read_records(&path);

    let signal = records
        .iter()
        .find(|r| shared::field(r, "event") == Some("signal"))
        .expect("no signal record");
    assert_eq!(shared::field(signal, "signal"), Some("SIGSEGV"));
    assert_eq!(shared::field(signal, "count"), Some("0x1"));
    assert_eq!(shared::field(signal, "origin"), Some("raised"));
    // The address of a raised signal would be the sender's pid
    assert_eq!(shared::field(signal, "address"), Some("0x0"));

    assert!(
        !records
            .iter()
            .any(|r| shared::field(r, "event") == Some("capture-failed")),
        "{records:?}"
    );

    let current = records
        .iter()
        .find(|r| shared::field(r, "thread") == Some("current"))
        .expect("no record for the faulting thread");
    assert!(shared::field(current, "pc").is_some_and(|pc| pc != "0x0"));

    // The spinners, plus the test harness' main thread
    let siblings = records
        .iter()
        .filter(|r| shared::field(r, "thread").is_some_and(|t| t.starts_with("0x")))
        .count();
    assert!(siblings >= 4, "{records:?}");

    assert!(
        !records
            .iter()
            .any(|r| shared::field(r, "event") == Some("invalid-transition")),
        "{records:?}"
    );

    let _ = std::fs::remove_file(path);
}
