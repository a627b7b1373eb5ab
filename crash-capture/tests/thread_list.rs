mod shared;

use crash_capture::{self as cc, thread::live_storage};
use std::time::Duration;

#[test]
fn enumerates_and_releases() {
    let path = shared::log_path("thread-list");
    let log = cc::SignalSafeLogger::open(&path).expect("failed to open log");

    let spinners = shared::Spinners::spawn(3);
    let baseline = live_storage();

    let list = cc::ThreadList::initialize(&log).expect("failed to enumerate threads");
    assert_eq!(live_storage(), baseline + 1);

    // The spinners, the test thread, and libtest's main thread
    assert!(list.len() >= 4, "only found {} threads", list.len());
    assert!(list.handles().contains(&list.current()));

    // Only one list at a time. A thread that already has one can't wait for
    // itself, and the non-blocking variant never waits at all
    assert!(matches!(cc::ThreadList::initialize(&log), Err(cc::Error::Busy)));
    assert!(matches!(cc::ThreadList::try_initialize(&log), Err(cc::Error::Busy)));

    let other = std::thread::scope(|s| {
        s.spawn(|| matches!(cc::ThreadList::try_initialize(&log), Err(cc::Error::Busy)))
            .join()
            .expect("thread panicked")
    });
    assert!(other);

    // Enumerating doesn't stop anything
    let before: [usize; 3] = spinners.snapshot();
    std::thread::sleep(Duration::from_millis(20));
    let after: [usize; 3] = spinners.snapshot();
    for (before, after) in before.iter().zip(after.iter()) {
        assert!(after > before);
    }

    list.deinitialize().expect("deinitialize never fails");
    assert_eq!(live_storage(), baseline);

    // Dropping releases as well, and frees the list up for the next owner
    {
        let _list = cc::ThreadList::initialize(&log).expect("failed to enumerate threads");
        assert_eq!(live_storage(), baseline + 1);
    }
    assert_eq!(live_storage(), baseline);

    spinners.stop();

    // Nothing went wrong, so nothing was logged
    assert!(shared::read_records(&path).is_empty());
    let _ = std::fs::remove_file(path);
}
