//! An append-only crash log that can be written to from within a signal
//! handler.
//!
//! Every write goes straight to `write(2)` on a file descriptor opened with
//! `O_APPEND`. Nothing here allocates, takes a lock, or formats through
//! [`std::fmt`], which makes the writer usable while the interrupted code may
//! be holding the allocator lock or the stdio locks.
//!
//! Records are sequences of `key: value` tokens, separated by `, ` and
//! terminated by a newline, which lets callers build a structured record one
//! token at a time via the `last` flag on the `write_key_*` methods.
//!
//! ```text
//! event: signal, signal: SIGSEGV, count: 0x1, origin: fault, address: 0x0
//! ```

use crate::Error;
use std::{
    io,
    os::fd::{AsRawFd, OwnedFd, RawFd},
    path::Path,
};

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// `0x` plus two hex digits for every byte of a `usize`
const INTEGER_BUF_LEN: usize = 2 + 2 * std::mem::size_of::<usize>();

/// The number of input bytes that are hex encoded per `write` call
const HEX_CHUNK_LEN: usize = 32;

/// Writer for the crash log, safe to use from signal context
#[derive(Debug)]
pub struct SignalSafeLogger {
    fd: Option<OwnedFd>,
}

impl SignalSafeLogger {
    /// Opens (or creates) the crash log at the specified path.
    ///
    /// The file is opened for appending, so concurrent writes from several
    /// faulting threads each land at the current end of the file. This is not
    /// safe to call from a signal handler.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;

        Ok(Self {
            fd: Some(file.into()),
        })
    }

    /// Wraps an already open descriptor, eg. a pipe or stderr duplicate.
    ///
    /// The caller is responsible for the descriptor being suitable for
    /// appending.
    #[inline]
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self { fd: Some(fd) }
    }

    /// A logger that refuses every write
    #[inline]
    pub const fn disabled() -> Self {
        Self { fd: None }
    }

    /// Returns true if the logger has a destination to write to.
    ///
    /// Callers can use this to skip building a record that would go nowhere.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.fd.is_some()
    }

    #[inline]
    fn raw_fd(&self) -> Result<RawFd, Error> {
        self.fd
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or(Error::ArgumentInvalid)
    }

    /// Writes raw bytes, retrying on `EINTR` and partial writes
    pub fn write_data(&self, mut data: &[u8]) -> Result<(), Error> {
        let fd = self.raw_fd()?;

        while !data.is_empty() {
            // SAFETY: syscall, the pointer and length come from a valid slice
            let written = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };

            if written < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }

                return Err(Error::Io(err));
            } else if written == 0 {
                return Err(Error::Io(io::ErrorKind::WriteZero.into()));
            }

            data = &data[written as usize..];
        }

        Ok(())
    }

    #[inline]
    pub fn write_str(&self, s: &str) -> Result<(), Error> {
        self.write_data(s.as_bytes())
    }

    /// Writes an unsigned integer as `0x` prefixed lowercase hex
    pub fn write_integer(&self, value: usize) -> Result<(), Error> {
        let mut buf = [0u8; INTEGER_BUF_LEN];
        let digits = format_hex(value, &mut buf);
        self.write_data(digits)
    }

    pub fn write_key_integer(&self, key: &str, value: usize, last: bool) -> Result<(), Error> {
        self.write_key(key)?;
        self.write_integer(value)?;
        self.write_separator(last)
    }

    /// Writes a pointer value, a null pointer is written as `0x0`
    pub fn write_key_pointer<T>(&self, key: &str, ptr: *const T, last: bool) -> Result<(), Error> {
        self.write_key(key)?;
        self.write_integer(ptr as usize)?;
        self.write_separator(last)
    }

    pub fn write_key_str(&self, key: &str, value: &str, last: bool) -> Result<(), Error> {
        self.write_key(key)?;
        self.write_str(value)?;
        self.write_separator(last)
    }

    /// Writes the buffer as two lowercase hex digits per byte, with no prefix
    pub fn write_key_hex(&self, key: &str, data: &[u8], last: bool) -> Result<(), Error> {
        self.write_key(key)?;

        let mut buf = [0u8; HEX_CHUNK_LEN * 2];
        for chunk in data.chunks(HEX_CHUNK_LEN) {
            for (byte, out) in chunk.iter().zip(buf.chunks_exact_mut(2)) {
                out[0] = HEX_DIGITS[(byte >> 4) as usize];
                out[1] = HEX_DIGITS[(byte & 0xf) as usize];
            }

            self.write_data(&buf[..chunk.len() * 2])?;
        }

        self.write_separator(last)
    }

    #[inline]
    fn write_key(&self, key: &str) -> Result<(), Error> {
        self.write_str(key)?;
        self.write_data(b": ")
    }

    #[inline]
    fn write_separator(&self, last: bool) -> Result<(), Error> {
        self.write_data(if last { b"\n" } else { b", " })
    }
}

/// Formats the value into the back of the buffer, returning the slice that
/// was filled
fn format_hex(mut value: usize, buf: &mut [u8; INTEGER_BUF_LEN]) -> &[u8] {
    let mut start = buf.len();

    loop {
        start -= 1;
        buf[start] = HEX_DIGITS[value & 0xf];
        value >>= 4;

        if value == 0 {
            break;
        }
    }

    start -= 2;
    buf[start] = b'0';
    buf[start + 1] = b'x';

    &buf[start..]
}
