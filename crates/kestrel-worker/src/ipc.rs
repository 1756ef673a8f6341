//! Error channel between the master and each child
//!
//! The master creates a connected socket pair per child. The child's half is
//! placed on a fixed descriptor in the new process and announced through
//! `KESTREL_IPC_FD`. A child writes at most one newline-terminated JSON
//! [`ErrorRecord`], right before exiting abnormally; the master reads it after
//! reaping the child.

use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, BufReader, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::time::Duration;
use tracing::{debug, warn};

/// Environment variable naming the child's descriptor
pub const IPC_FD_ENV: &str = "KESTREL_IPC_FD";

/// Descriptor the child's endpoint lands on
pub const CHILD_FD: RawFd = 3;

/// How long the master waits on a silent channel
pub const RECEIVE_TIMEOUT: Duration = Duration::from_millis(10);

/// What made a child give up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FatalKind {
    /// Unrecoverable setup error
    Fatal,
    /// Panic inside a job handler
    Panic,
    /// Backend unreachable or rejecting commands
    Backend,
}

/// Structured description of a child's fatal error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: FatalKind,
    pub file: String,
    pub line: u32,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(kind: FatalKind, file: impl Into<String>, line: u32, message: impl Into<String>) -> Self {
        Self {
            kind,
            file: file.into(),
            line,
            message: message.into(),
        }
    }

    /// Record located at the caller
    #[track_caller]
    pub fn here(kind: FatalKind, message: impl Into<String>) -> Self {
        let location = std::panic::Location::caller();
        Self::new(kind, location.file(), location.line(), message)
    }
}

impl std::fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{:?}] {} at {}:{}",
            self.kind, self.message, self.file, self.line
        )
    }
}

/// Master-side view of one child's channel
pub struct Channel {
    master: UnixStream,
    child: Option<UnixStream>,
}

impl Channel {
    /// Create a connected pair
    pub fn pair() -> io::Result<Self> {
        let (master, child) = UnixStream::pair()?;
        Ok(Self {
            master,
            child: Some(child),
        })
    }

    /// Arrange for `command`'s process to inherit the child endpoint on
    /// [`CHILD_FD`]
    pub fn attach(&self, command: &mut Command) -> io::Result<()> {
        let fd = self
            .child
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "child endpoint already closed"))?;

        command.env(IPC_FD_ENV, CHILD_FD.to_string());
        // SAFETY: the hook only calls async-signal-safe libc functions.
        unsafe {
            command.pre_exec(move || inherit_fd(fd, CHILD_FD));
        }
        Ok(())
    }

    /// Close the master's copy of the child endpoint and arm the read timeout.
    /// Call once the child has been spawned.
    pub fn close_child(&mut self) -> io::Result<()> {
        self.child.take();
        self.master.set_read_timeout(Some(RECEIVE_TIMEOUT))
    }

    /// Read the child's error record, if it left one
    pub fn receive(&mut self) -> Option<ErrorRecord> {
        self.child.take();
        if let Err(e) = self.master.set_read_timeout(Some(RECEIVE_TIMEOUT)) {
            warn!("Failed to set IPC read timeout: {}", e);
        }

        let mut reader = BufReader::new(&self.master);
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) => return None,
            Ok(_) => {}
            Err(e) if is_timeout(&e) => return None,
            Err(e) => {
                warn!("Failed to read IPC channel: {}", e);
                return None;
            }
        }

        match serde_json::from_str(line.trim()) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Discarding malformed IPC record {:?}: {}", line.trim(), e);
                None
            }
        }
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Runs between fork and exec: place `fd` on `target` without close-on-exec
fn inherit_fd(fd: RawFd, target: RawFd) -> io::Result<()> {
    if fd == target {
        // SAFETY: plain fcntl on a descriptor we own.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
            return Err(io::Error::last_os_error());
        }
    } else if unsafe { libc::dup2(fd, target) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Child-side endpoint
pub struct ChildEnd {
    stream: UnixStream,
}

impl ChildEnd {
    pub fn from_stream(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Endpoint inherited from the master, if this process was given one
    pub fn inherited() -> Option<Self> {
        let fd: RawFd = std::env::var(IPC_FD_ENV).ok()?.parse().ok()?;
        // SAFETY: plain fcntl probe; a closed descriptor reports EBADF.
        if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
            debug!("{}={} is not an open descriptor", IPC_FD_ENV, fd);
            return None;
        }
        // SAFETY: the master handed this descriptor to us and nothing else in
        // this process owns it.
        let stream = unsafe { UnixStream::from_raw_fd(fd) };
        Some(Self { stream })
    }

    /// Write one record
    pub fn send(&mut self, record: &ErrorRecord) -> io::Result<()> {
        let mut payload = serde_json::to_vec(record)?;
        payload.push(b'\n');
        self.stream.write_all(&payload)?;
        self.stream.flush()
    }
}
