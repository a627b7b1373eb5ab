use capture_test::Flavor;

use clap::Parser;

#[derive(Parser)]
struct Command {
    /// The path of the crash log to append to
    #[arg(long)]
    log: std::path::PathBuf,
    /// The signal to raise
    #[arg(long, value_enum)]
    flavor: Flavor,
    /// Raises the signal on a separate thread rather than the main thread
    #[arg(long)]
    use_thread: bool,
    /// The number of idle threads to spawn before raising the signal
    #[arg(long, default_value_t = capture_test::CLIENT_THREADS)]
    threads: usize,
}

fn real_main() -> anyhow::Result<()> {
    let cmd = Command::parse();

    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    println!("pid: {}", std::process::id());

    let _reporter = crash_capture::CrashReporter::attach(
        crash_capture::Options::new(&cmd.log),
        Box::new(crash_capture::ThreadCapture),
    )?;

    let flavor = cmd.flavor.sadness();

    for _ in 0..cmd.threads {
        std::thread::spawn(move || std::thread::sleep(std::time::Duration::MAX));
    }

    if cmd.use_thread {
        std::thread::spawn(move || flavor.make_sad())
            .join()
            .map_err(|_| anyhow::anyhow!("crashing thread panicked"))?;
    } else {
        flavor.make_sad();
    }

    anyhow::bail!("we should have raised a signal and died");
}

fn main() {
    // We want this program to crash, it _shouldn't_ have errors that prevent
    // that from happening, so emit an error code if we do encounter an error
    // so that we can fail the test
    if let Err(e) = real_main() {
        eprintln!("error: {e:#}");

        // When dying due to a signal there is no exit code, at least on unixes
        std::process::exit(222);
    }
}
