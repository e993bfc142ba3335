//! Standard stream handling.
//!
//! [`StderrSink`] is the one place that writes to the real stderr; the crash reporter,
//! the log formatter and the stderr echo all go through it so their output does not
//! interleave. [`StdioCapture`] swaps fds 1 and 2 for pipes and forwards every line
//! the process prints to the manager while still echoing it to the real stream.

use std::{
    io::{self, Write},
    sync::{Mutex, MutexGuard, PoisonError, TryLockError},
    time::{Duration, Instant},
};

#[cfg(unix)]
use std::{
    os::fd::RawFd,
    sync::{
        Arc,
        atomic::{AtomicI32, Ordering},
        mpsc,
    },
};

#[cfg(unix)]
use manderrow_ipc::OutputChannel;

#[cfg(unix)]
use crate::host::HostApi;

const CRASH_LOCK_WAIT: Duration = Duration::from_millis(200);
const MAX_LINE_BYTES: usize = 1 << 20;

#[derive(Debug)]
pub struct StderrSink {
    #[cfg(unix)]
    fd: AtomicI32,
    lock: Mutex<()>,
}

impl Default for StderrSink {
    fn default() -> Self {
        Self::new()
    }
}

impl StderrSink {
    pub fn new() -> Self {
        Self {
            #[cfg(unix)]
            fd: AtomicI32::new(libc::STDERR_FILENO),
            lock: Mutex::new(()),
        }
    }

    /// Write somewhere other than fd 2, e.g. a duplicate taken before fd 2 was redirected.
    #[cfg(unix)]
    pub fn redirect_to(&self, fd: RawFd) {
        self.fd.store(fd, Ordering::Release);
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write_locked(&self, buf: &[u8]) -> io::Result<()> {
        let _guard = self.guard();
        self.write_raw(buf)
    }

    /// Like [`write_locked`](Self::write_locked), but never waits for long. A thread that
    /// crashes while holding the lock must still be able to report.
    pub fn write_for_crash(&self, buf: &[u8]) {
        let deadline = Instant::now() + CRASH_LOCK_WAIT;
        let _guard = loop {
            match self.lock.try_lock() {
                Ok(g) => break Some(g),
                Err(TryLockError::Poisoned(p)) => break Some(p.into_inner()),
                Err(TryLockError::WouldBlock) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(TryLockError::WouldBlock) => break None,
            }
        };
        let _ = self.write_raw(buf);
    }

    #[cfg(unix)]
    fn write_raw(&self, buf: &[u8]) -> io::Result<()> {
        write_all_fd(self.fd.load(Ordering::Acquire), buf)
    }

    #[cfg(not(unix))]
    fn write_raw(&self, buf: &[u8]) -> io::Result<()> {
        io::stderr().write_all(buf)
    }
}

/// Lets `tracing_subscriber::fmt` use the sink; each formatted event is one write.
impl Write for &StderrSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_locked(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(unix)]
fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    // SAFETY: `buf` is valid for `buf.len()` bytes.
    let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

#[cfg(unix)]
fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Splits a byte stream on `\n`. Lines are emitted without the terminator.
#[derive(Debug, Default)]
pub(crate) struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub(crate) fn push(&mut self, mut chunk: &[u8], mut emit: impl FnMut(&[u8])) {
        while let Some(pos) = chunk.iter().position(|&b| b == b'\n') {
            if self.pending.is_empty() {
                emit(&chunk[..pos]);
            } else {
                self.pending.extend_from_slice(&chunk[..pos]);
                emit(&self.pending);
                self.pending.clear();
            }
            chunk = &chunk[pos + 1..];
        }
        self.pending.extend_from_slice(chunk);
        if self.pending.len() >= MAX_LINE_BYTES {
            emit(&self.pending);
            self.pending.clear();
        }
    }

    /// Emit a trailing unterminated line, if any.
    pub(crate) fn finish(&mut self, mut emit: impl FnMut(&[u8])) {
        if !self.pending.is_empty() {
            emit(&self.pending);
            self.pending.clear();
        }
    }
}

#[cfg(unix)]
#[derive(Debug)]
struct CapturedStream {
    fd: RawFd,
    real: RawFd,
    done: mpsc::Receiver<()>,
}

/// Redirected stdout and stderr. Dropping it without [`finish`](Self::finish) leaves the
/// redirection in place.
#[cfg(unix)]
#[derive(Debug)]
pub struct StdioCapture {
    streams: Vec<CapturedStream>,
}

#[cfg(unix)]
impl StdioCapture {
    pub fn install(host: Arc<dyn HostApi>, stderr: Arc<StderrSink>) -> io::Result<Self> {
        let mut streams = Vec::with_capacity(2);
        for (fd, channel) in [
            (libc::STDOUT_FILENO, OutputChannel::Out),
            (libc::STDERR_FILENO, OutputChannel::Err),
        ] {
            streams.push(capture_fd(fd, channel, host.clone(), stderr.clone())?);
        }
        Ok(Self { streams })
    }

    /// Put the real streams back and wait up to `timeout` for buffered output to be
    /// forwarded.
    pub fn finish(self, timeout: Duration) {
        // SAFETY: fflush(NULL) flushes every C stdio stream.
        unsafe { libc::fflush(std::ptr::null_mut()) };
        let _ = io::stdout().flush();

        for s in &self.streams {
            // Replacing the fd closes the pipe's write end, so the reader sees EOF once
            // no child process holds a copy.
            // SAFETY: both fds are open.
            if let Err(e) = cvt(unsafe { libc::dup2(s.real, s.fd) }) {
                tracing::warn!(fd = s.fd, error = %e, "failed to restore stream");
            }
        }

        let deadline = Instant::now() + timeout;
        for s in &self.streams {
            let left = deadline.saturating_duration_since(Instant::now());
            if s.done.recv_timeout(left).is_err() {
                tracing::debug!(fd = s.fd, "stream did not drain in time");
            }
        }
    }
}

#[cfg(unix)]
fn capture_fd(
    fd: RawFd,
    channel: OutputChannel,
    host: Arc<dyn HostApi>,
    stderr: Arc<StderrSink>,
) -> io::Result<CapturedStream> {
    use std::{fs::File, io::Read, os::fd::FromRawFd};

    // SAFETY: plain fd manipulation; every returned fd is checked.
    let (real, read_end) = unsafe {
        let real = cvt(libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 3))?;
        let mut pipe = [0 as libc::c_int; 2];
        cvt(libc::pipe(pipe.as_mut_ptr()))?;
        cvt(libc::fcntl(pipe[0], libc::F_SETFD, libc::FD_CLOEXEC))?;
        cvt(libc::dup2(pipe[1], fd))?;
        libc::close(pipe[1]);
        (real, pipe[0])
    };

    if channel == OutputChannel::Err {
        stderr.redirect_to(real);
    }

    // SAFETY: `read_end` is a fresh fd owned by nothing else.
    let mut reader = unsafe { File::from_raw_fd(read_end) };
    let (done_tx, done) = mpsc::channel();
    let name = match channel {
        OutputChannel::Out => "manderrow-stdout",
        OutputChannel::Err => "manderrow-stderr",
    };

    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let mut lines = LineSplitter::default();
            let mut buf = [0u8; 8192];
            let mut forward = |line: &[u8]| {
                let _ = host.send_output_line(channel, line);
            };
            loop {
                let n = match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                };
                let chunk = &buf[..n];
                let _ = match channel {
                    OutputChannel::Out => write_all_fd(real, chunk),
                    OutputChannel::Err => stderr.write_locked(chunk),
                };
                lines.push(chunk, &mut forward);
            }
            lines.finish(&mut forward);
            let _ = done_tx.send(());
        })?;

    Ok(CapturedStream { fd, real, done })
}

#[cfg(unix)]
fn write_all_fd(fd: RawFd, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match write_fd(fd, buf) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
