use capture_test::*;

#[test]
fn abort_simple() {
    run_test(Flavor::Abort, 0, false);
}

#[test]
fn abort_threaded() {
    run_threaded_test(Flavor::Abort, 8);
}
