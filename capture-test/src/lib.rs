//! Runs `crash-client` in a child process, makes it crash in a particular
//! way, and checks both how it died and what it wrote to its crash log.

use std::{fmt, path::PathBuf};

/// The number of idle threads the client spawns before crashing
pub const CLIENT_THREADS: usize = 10;

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flavor {
    Abort,
    Bus,
    Illegal,
    Segv,
    Sys,
}

impl Flavor {
    pub fn sadness(self) -> sadness_generator::SadnessFlavor {
        use sadness_generator::SadnessFlavor as Sf;

        match self {
            Self::Abort => Sf::Abort,
            Self::Bus => Sf::Bus,
            Self::Illegal => Sf::Illegal,
            Self::Segv => Sf::Segfault,
            Self::Sys => Sf::BadSystemCall,
        }
    }

    #[inline]
    pub fn signal(self) -> i32 {
        self.sadness().signal()
    }

    /// The name the crash log uses for the signal
    pub fn signal_name(self) -> &'static str {
        match self {
            Self::Abort => "SIGABRT",
            Self::Bus => "SIGBUS",
            Self::Illegal => "SIGILL",
            Self::Segv => "SIGSEGV",
            Self::Sys => "SIGSYS",
        }
    }

    /// True if the signal is caused by the hardware rather than `raise`
    pub fn is_fault(self) -> bool {
        !matches!(self, Self::Abort | Self::Sys)
    }
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Abort => "abort",
            Self::Bus => "bus",
            Self::Illegal => "illegal",
            Self::Segv => "segv",
            Self::Sys => "sys",
        })
    }
}

/// A single `key: value, key: value` record from a crash log
#[derive(Debug)]
pub struct Record(Vec<(String, String)>);

impl Record {
    pub fn parse(line: &str) -> anyhow::Result<Self> {
        let fields = line
            .split(", ")
            .map(|field| {
                field
                    .split_once(": ")
                    .map(|(k, v)| (k.to_owned(), v.to_owned()))
                    .ok_or_else(|| anyhow::anyhow!("malformed field '{field}' in '{line}'"))
            })
            .collect::<anyhow::Result<_>>()?;

        Ok(Self(fields))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find_map(|(k, v)| (k == key).then_some(v.as_str()))
    }
}

#[inline]
fn make_log_path(id: &str) -> PathBuf {
    PathBuf::from(format!(".logs/{id}.log"))
}

#[inline]
pub fn run_test(flavor: Flavor, counter: u32, use_thread: bool) -> Vec<Record> {
    let id = format!(
        "{}-{}-{}",
        flavor,
        counter,
        if use_thread { "threaded" } else { "simple" }
    );

    let records = generate_log(&id, flavor, use_thread);
    assert_log(&records, flavor);
    records
}

pub fn generate_log(id: &str, flavor: Flavor, use_thread: bool) -> Vec<Record> {
    let log_path = make_log_path(id);

    if log_path.exists() {
        if let Err(e) = std::fs::remove_file(&log_path) {
            panic!(
                "failed to remove existing log file {}: {}",
                log_path.display(),
                e
            );
        }
    } else if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    run_client(&log_path, flavor, use_thread);

    let log = match std::fs::read_to_string(&log_path) {
        Ok(log) => log,
        Err(e) => {
            panic!("failed to read crash log {}: {}", log_path.display(), e);
        }
    };

    log.lines()
        .map(|line| Record::parse(line).expect("invalid crash log"))
        .collect()
}

pub fn run_client(log_path: &std::path::Path, flavor: Flavor, use_thread: bool) {
    use std::{env, os::unix::process::ExitStatusExt};

    // Adapted from
    // https://github.com/rust-lang/cargo/blob/485670b3983b52289a2f353d589c57fae2f60f82/tests/testsuite/support/mod.rs#L507
    let mut cmd_path = env::current_exe().expect("failed to get exe path");
    cmd_path.pop();
    if cmd_path.ends_with("deps") {
        cmd_path.pop();
    }

    cmd_path.push("crash-client");

    let mut cmd = std::process::Command::new(&cmd_path);
    cmd.stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());
    cmd.arg("--log")
        .arg(log_path)
        .args(["--flavor", &flavor.to_string()])
        .args(["--threads", &CLIENT_THREADS.to_string()]);
    if use_thread {
        cmd.arg("--use-thread");
    }

    let child = cmd.spawn().expect("failed to run crash-client");
    let output = child.wait_with_output().expect("failed to wait for output");

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    println!("{stdout}");
    eprintln!("{stderr}");

    // The handler returns, so the repeated signal hits the default
    // disposition and terminates the client
    assert_eq!(
        output.status.signal(),
        Some(flavor.signal()),
        "client exited with {:?}",
        output.status
    );
}

pub fn assert_log(records: &[Record], flavor: Flavor) {
    let signals: Vec<_> = records
        .iter()
        .filter(|r| r.get("event") == Some("signal"))
        .collect();

    // Only the first signal is handled, the repeat is fatal
    assert_eq!(signals.len(), 1, "{records:#?}");

    let signal = signals[0];
    assert_eq!(signal.get("signal"), Some(flavor.signal_name()));
    assert_eq!(signal.get("count"), Some("0x1"));
    assert_eq!(
        signal.get("origin"),
        Some(if flavor.is_fault() { "fault" } else { "raised" })
    );

    for record in records {
        assert!(
            !matches!(
                record.get("event"),
                Some("capture-failed" | "invalid-transition" | "corrupt-state" | "lost-transition")
            ),
            "{record:?}"
        );
    }

    assert!(
        records.iter().any(|r| r.get("thread") == Some("current")),
        "{records:#?}"
    );

    let siblings = records
        .iter()
        .filter(|r| r.get("thread").is_some_and(|t| t.starts_with("0x")))
        .count();
    assert!(siblings >= CLIENT_THREADS, "{records:#?}");
}

pub fn run_threaded_test(flavor: Flavor, count: u32) {
    use rayon::prelude::*;

    (0..count).into_par_iter().for_each(|i| {
        run_test(flavor, i, true);
    });
}
