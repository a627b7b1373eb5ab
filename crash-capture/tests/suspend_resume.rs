mod shared;

use crash_capture as cc;
use std::time::{Duration, Instant};

#[test]
fn suspends_and_resumes_siblings() {
    let path = shared::log_path("suspend-resume");
    let log = cc::SignalSafeLogger::open(&path).expect("failed to open log");

    let spinners = shared::Spinners::spawn(4);
    let list = cc::ThreadList::initialize(&log).expect("failed to enumerate threads");

    // Nothing in here may allocate or panic, the thread that would need to
    // make progress for that to work could be one of the suspended ones
    let suspended = list.suspend_all_except_current();
    let frozen: [usize; 4] = spinners.snapshot();
    std::thread::sleep(Duration::from_millis(50));

    // Suspensions don't nest, the inner guard neither waits on threads that
    // are already parked nor resumes them when dropped
    let nested_start = Instant::now();
    drop(list.suspend_all_except_current());
    let nested = nested_start.elapsed();

    std::thread::sleep(Duration::from_millis(50));
    let still_frozen: [usize; 4] = spinners.snapshot();
    suspended.resume_all_except_current();

    assert_eq!(frozen, still_frozen);
    assert!(nested < Duration::from_millis(500), "nested suspension took {nested:?}");

    std::thread::sleep(Duration::from_millis(50));
    let resumed: [usize; 4] = spinners.snapshot();
    for (frozen, resumed) in frozen.iter().zip(resumed.iter()) {
        assert!(resumed > frozen);
    }

    // A dropped guard resumes as well
    {
        let _suspended = list.suspend_all_except_current();
    }
    let before: [usize; 4] = spinners.snapshot();
    std::thread::sleep(Duration::from_millis(50));
    let after: [usize; 4] = spinners.snapshot();
    for (before, after) in before.iter().zip(after.iter()) {
        assert!(after > before);
    }

    list.deinitialize().expect("deinitialize never fails");
    spinners.stop();

    // Every sibling acknowledged in time, nothing failed, and the nested
    // suspension didn't wait for acknowledgements that never came
    assert!(shared::read_records(&path).is_empty());
    let _ = std::fs::remove_file(path);
}
