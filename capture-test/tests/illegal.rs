use capture_test::*;

#[test]
fn illegal_simple() {
    run_test(Flavor::Illegal, 0, false);
}

#[test]
fn illegal_threaded() {
    run_threaded_test(Flavor::Illegal, 8);
}
