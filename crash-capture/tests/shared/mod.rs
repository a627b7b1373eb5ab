#![allow(dead_code, unsafe_code)]

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::JoinHandle,
};

/// A unique crash log path in the temp directory
pub fn log_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("crash-capture-{name}-{}.log", uuid::Uuid::new_v4()))
}

/// A single `key: value, key: value` record from the crash log
pub type Record = Vec<(String, String)>;

pub fn read_records(path: &std::path::Path) -> Vec<Record> {
    let log = std::fs::read_to_string(path).expect("failed to read crash log");

    log.lines()
        .map(|line| {
            line.split(", ")
                .map(|field| {
                    let (key, value) = field
                        .split_once(": ")
                        .unwrap_or_else(|| panic!("malformed field '{field}' in '{line}'"));
                    (key.to_owned(), value.to_owned())
                })
                .collect()
        })
        .collect()
}

pub fn field<'r>(record: &'r Record, key: &str) -> Option<&'r str> {
    record
        .iter()
        .find_map(|(k, v)| (k == key).then_some(v.as_str()))
}

/// A set of threads that spin, each bumping its own counter, until stopped
pub struct Spinners {
    stop: Arc<AtomicBool>,
    pub counters: Vec<Arc<AtomicUsize>>,
    handles: Vec<JoinHandle<()>>,
}

impl Spinners {
    pub fn spawn(count: usize) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let started = Arc::new(std::sync::Barrier::new(count + 1));

        let mut counters = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);

        for _ in 0..count {
            let counter = Arc::new(AtomicUsize::new(0));
            counters.push(counter.clone());

            let stop = stop.clone();
            let started = started.clone();
            handles.push(std::thread::spawn(move || {
                started.wait();
                while !stop.load(Ordering::Relaxed) {
                    counter.fetch_add(1, Ordering::Relaxed);
                    std::hint::spin_loop();
                }
            }));
        }

        started.wait();

        Self {
            stop,
            counters,
            handles,
        }
    }

    pub fn snapshot<const N: usize>(&self) -> [usize; N] {
        let mut snap = [0; N];
        for (slot, counter) in snap.iter_mut().zip(&self.counters) {
            *slot = counter.load(Ordering::SeqCst);
        }
        snap
    }

    pub fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.handles {
            handle.join().expect("spinner panicked");
        }
    }
}

/// The current disposition of the signal
pub fn disposition(signal: i32) -> libc::sigaction {
    unsafe {
        let mut current: libc::sigaction = std::mem::zeroed();
        assert_eq!(libc::sigaction(signal, std::ptr::null(), &mut current), 0);
        current
    }
}

pub extern "C" fn dummy_handler(_signal: i32, _info: *mut libc::siginfo_t, _uc: *mut libc::c_void) {}

/// Installs [`dummy_handler`] for the signal
pub fn install_dummy(signal: i32) {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_sigaction = dummy_handler as usize;
        action.sa_flags = libc::SA_SIGINFO;
        assert_eq!(libc::sigaction(signal, &action, std::ptr::null_mut()), 0);
    }
}

pub fn install_default(signal: i32) {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_sigaction = libc::SIG_DFL;
        assert_eq!(libc::sigaction(signal, &action, std::ptr::null_mut()), 0);
    }
}
