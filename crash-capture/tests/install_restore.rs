mod shared;

use crash_capture as cc;

#[test]
fn restores_preexisting_dispositions() {
    // A mix of custom and default dispositions
    shared::install_dummy(libc::SIGSYS);
    shared::install_dummy(libc::SIGILL);
    shared::install_default(libc::SIGABRT);
    shared::install_default(libc::SIGBUS);

    let before: Vec<_> = cc::HANDLED_SIGNALS
        .iter()
        .map(|sig| shared::disposition(*sig as i32))
        .collect();

    let path = shared::log_path("install-restore");
    let reporter = cc::CrashReporter::attach(
        cc::Options::new(&path).alternate_stack(false),
        Box::new(cc::ThreadCapture),
    )
    .expect("failed to attach");

    assert!(reporter.state().is_installed());
    assert_eq!(reporter.state().signal_count(), 0);
    assert_eq!(reporter.state().crash_state(), Ok(cc::CrashState::Initialized));

    let ours = shared::disposition(libc::SIGSEGV);
    for sig in cc::HANDLED_SIGNALS {
        let current = shared::disposition(sig as i32);
        assert_eq!(current.sa_sigaction, ours.sa_sigaction, "{}", sig.name());
        assert_ne!(current.sa_flags & libc::SA_RESETHAND, 0);
        assert_ne!(current.sa_flags & libc::SA_NODEFER, 0);
        assert_ne!(current.sa_flags & libc::SA_SIGINFO, 0);
    }

    // Only one state can be published at a time
    let second = std::sync::Arc::new(cc::SharedCrashState::new(
        cc::SignalSafeLogger::disabled(),
        Box::new(cc::ThreadCapture),
    ));
    assert!(matches!(cc::signal::install(&second), Err(cc::Error::AlreadyInstalled)));
    assert!(!second.is_installed());

    let state = reporter.state().clone();
    reporter.detach();
    assert!(!state.is_installed());

    for (sig, before) in cc::HANDLED_SIGNALS.iter().zip(before) {
        let after = shared::disposition(*sig as i32);
        assert_eq!(after.sa_sigaction, before.sa_sigaction, "{}", sig.name());
        assert_eq!(
            after.sa_flags & libc::SA_SIGINFO,
            before.sa_flags & libc::SA_SIGINFO,
            "{}",
            sig.name()
        );
    }

    assert_eq!(
        shared::disposition(libc::SIGSYS).sa_sigaction,
        shared::dummy_handler as usize
    );
    assert_eq!(shared::disposition(libc::SIGABRT).sa_sigaction, libc::SIG_DFL);

    // Uninstalling again is a no-op
    cc::signal::uninstall(&state).expect("second uninstall failed");

    // With nothing published any longer a new state can be installed
    cc::signal::install(&second).expect("failed to install after detach");
    cc::signal::uninstall(&second).expect("failed to uninstall");

    let _ = std::fs::remove_file(path);
}
