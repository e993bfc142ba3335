//! Last-resort error reporting.
//!
//! [`CrashReporter::crash`] writes a report to the crash log and to stderr, tells the
//! manager if it can, and aborts. It never returns. Anything that fails along the way is
//! ignored so that the abort is always reached.

use std::{
    backtrace::{Backtrace, BacktraceStatus},
    cell::RefCell,
    fmt::Write as _,
    fs::OpenOptions,
    io::Write as _,
    panic::{AssertUnwindSafe, PanicHookInfo},
    path::PathBuf,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::{
    host::HostApi,
    logs::LogsDir,
    stdio::StderrSink,
    timestamp::{Timestamp, log_file_name},
};

const SEPARATOR: &str = "\n----------------------------------------\n\n";

static NEXT_REPORTER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Reporters this thread is currently crashing through.
    static CRASHING: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

/// What "trap" and "abort" mean. Tests swap these for functions that unwind.
#[derive(Debug, Clone, Copy)]
pub struct CrashHooks {
    pub trap: fn(),
    pub abort: fn() -> !,
}

impl Default for CrashHooks {
    fn default() -> Self {
        Self {
            trap: debug_trap,
            abort: std::process::abort,
        }
    }
}

#[cfg(unix)]
fn debug_trap() {
    // SAFETY: raising SIGTRAP stops under a debugger; otherwise the default action
    // terminates the process, which is what the caller is about to do anyway.
    unsafe {
        libc::raise(libc::SIGTRAP);
    }
}

#[cfg(not(unix))]
fn debug_trap() {}

pub struct CrashReporter {
    id: u64,
    logs: Arc<LogsDir>,
    stderr: Arc<StderrSink>,
    host: OnceLock<Arc<dyn HostApi>>,
    started: Timestamp,
    hooks: CrashHooks,
}

impl std::fmt::Debug for CrashReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrashReporter")
            .field("id", &self.id)
            .field("logs", &self.logs)
            .field("has_host", &self.host.get().is_some())
            .field("started", &self.started)
            .finish()
    }
}

impl CrashReporter {
    pub fn new(logs: Arc<LogsDir>, stderr: Arc<StderrSink>) -> Self {
        Self::with_hooks(logs, stderr, CrashHooks::default())
    }

    pub fn with_hooks(logs: Arc<LogsDir>, stderr: Arc<StderrSink>, hooks: CrashHooks) -> Self {
        Self {
            id: NEXT_REPORTER_ID.fetch_add(1, Ordering::Relaxed),
            logs,
            stderr,
            host: OnceLock::new(),
            started: Timestamp::now(),
            hooks,
        }
    }

    /// Once connected, crashes are also sent to the manager.
    pub fn set_host(&self, host: Arc<dyn HostApi>) {
        let _ = self.host.set(host);
    }

    /// One file per process. Later crashes append to it.
    pub fn log_path(&self) -> PathBuf {
        self.logs.resolve().join(log_file_name("crash", self.started))
    }

    pub fn crash(&self, message: &str) -> ! {
        let reentered = CRASHING.with(|c| {
            let mut c = c.borrow_mut();
            if c.contains(&self.id) {
                true
            } else {
                c.push(self.id);
                false
            }
        });
        if reentered {
            // The reporting path itself failed. Don't try again.
            (self.hooks.trap)();
            (self.hooks.abort)();
        }

        let report = build_report(message);
        let _ = self.append_to_log(&report);
        self.stderr.write_for_crash(report.as_bytes());

        if let Some(host) = self.host.get() {
            let _ = std::panic::catch_unwind(AssertUnwindSafe(|| host.send_crash(message)));
        }

        (self.hooks.abort)()
    }

    fn append_to_log(&self, report: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;
        if file.metadata()?.len() > 0 {
            file.write_all(SEPARATOR.as_bytes())?;
        }
        file.write_all(report.as_bytes())?;
        file.flush()
    }

    /// Route panics into [`crash`](Self::crash).
    pub fn install_panic_hook(self: &Arc<Self>) {
        let reporter = self.clone();
        std::panic::set_hook(Box::new(move |info| reporter.crash(&panic_message(info))));
    }
}

fn build_report(message: &str) -> String {
    let mut report = String::new();
    let _ = writeln!(report, "manderrow-agent crashed at {}", Timestamp::now());
    let _ = writeln!(report, "{message}");
    report.push('\n');

    let bt = Backtrace::force_capture();
    match bt.status() {
        BacktraceStatus::Captured => {
            let _ = writeln!(report, "stack backtrace:\n{bt}");
        }
        _ => {
            let _ = writeln!(report, "stack backtrace unavailable (no debug information)");
        }
    }
    report
}

fn panic_message(info: &PanicHookInfo<'_>) -> String {
    let payload = info.payload();
    let msg = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("Box<dyn Any>");
    let thread = std::thread::current();
    let name = thread.name().unwrap_or("<unnamed>");
    match info.location() {
        Some(loc) => format!("thread '{name}' panicked at {loc}:\n{msg}"),
        None => format!("thread '{name}' panicked:\n{msg}"),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        panic::catch_unwind,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use manderrow_ipc::{LogLevel, OutputChannel};

    use super::*;
    use crate::host::{HostError, testing::{Call, RecordingHost}};

    struct Aborted;

    static TRAPS: AtomicUsize = AtomicUsize::new(0);

    fn count_trap() {
        TRAPS.fetch_add(1, Ordering::SeqCst);
    }

    fn unwind_abort() -> ! {
        std::panic::resume_unwind(Box::new(Aborted))
    }

    fn reporter(dir: &std::path::Path) -> CrashReporter {
        CrashReporter::with_hooks(
            Arc::new(LogsDir::new(Some(dir.to_path_buf()))),
            Arc::new(StderrSink::new()),
            CrashHooks {
                trap: count_trap,
                abort: unwind_abort,
            },
        )
    }

    fn aborted<T>(result: std::thread::Result<T>) -> bool {
        matches!(result, Err(payload) if payload.is::<Aborted>())
    }

    #[test]
    fn crash_writes_log_notifies_host_and_aborts() {
        let tmp = tempfile::tempdir().unwrap();
        let reporter = reporter(tmp.path());
        let host = Arc::new(RecordingHost::default());
        reporter.set_host(host.clone());

        let result = catch_unwind(AssertUnwindSafe(|| reporter.crash("bad things")));
        assert!(aborted(result));

        let log = std::fs::read_to_string(reporter.log_path()).unwrap();
        assert!(log.contains("bad things"));
        assert!(log.contains("stack backtrace"));
        assert_eq!(host.calls(), vec![Call::Crash("bad things".to_string())]);
    }

    #[test]
    fn second_crash_appends_with_separator() {
        let tmp = tempfile::tempdir().unwrap();
        let reporter = reporter(tmp.path());

        // Each crash runs on its own thread, as a second crash in one process would.
        for msg in ["crash-one-4f1a", "crash-two-9c2b"] {
            let r = &reporter;
            std::thread::scope(|s| {
                let result = s
                    .spawn(move || catch_unwind(AssertUnwindSafe(|| r.crash(msg))))
                    .join()
                    .unwrap();
                assert!(aborted(result));
            });
        }

        let log = std::fs::read_to_string(reporter.log_path()).unwrap();
        let first = log.find("crash-one-4f1a").unwrap();
        let sep = log.find(SEPARATOR).unwrap();
        let second = log.find("crash-two-9c2b").unwrap();
        assert!(first < sep && sep < second);
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 1);
    }

    /// Fails the first way a crash-time host call can: by crashing again.
    struct RecursingHost {
        reporter: Mutex<Option<Arc<CrashReporter>>>,
    }

    impl HostApi for RecursingHost {
        fn init(&self, _: &str) -> Result<(), HostError> {
            Ok(())
        }
        fn send_exit(&self, _: Option<i32>, _: Duration) -> Result<(), HostError> {
            Ok(())
        }
        fn send_crash(&self, error: &str) -> Result<(), HostError> {
            let reporter = self.reporter.lock().unwrap().clone();
            if let Some(r) = reporter {
                r.crash(&format!("while reporting: {error}"));
            }
            Ok(())
        }
        fn send_output_line(&self, _: OutputChannel, _: &[u8]) -> Result<(), HostError> {
            Ok(())
        }
        fn send_log(&self, _: LogLevel, _: &str, _: &str) -> Result<(), HostError> {
            Ok(())
        }
    }

    #[test]
    fn recursive_crash_traps_and_still_aborts() {
        let tmp = tempfile::tempdir().unwrap();
        let reporter = Arc::new(reporter(tmp.path()));
        let host = Arc::new(RecursingHost {
            reporter: Mutex::new(Some(reporter.clone())),
        });
        reporter.set_host(host);

        let before = TRAPS.load(Ordering::SeqCst);
        let r = reporter.clone();
        let result = std::thread::spawn(move || catch_unwind(AssertUnwindSafe(|| r.crash("outer"))))
            .join()
            .unwrap();
        assert!(aborted(result));
        assert!(TRAPS.load(Ordering::SeqCst) > before);

        // The nested call never got as far as the log file.
        let log = std::fs::read_to_string(reporter.log_path()).unwrap();
        assert!(log.contains("outer"));
        assert!(!log.contains("while reporting"));
    }

    #[test]
    fn guard_is_per_thread() {
        let tmp = tempfile::tempdir().unwrap();
        let reporter = Arc::new(reporter(tmp.path()));

        for _ in 0..2 {
            let r = reporter.clone();
            let result = std::thread::spawn(move || catch_unwind(AssertUnwindSafe(|| r.crash("x"))))
                .join()
                .unwrap();
            assert!(aborted(result));
        }
        // A crash on one thread does not count as recursion on another.
        let log = std::fs::read_to_string(reporter.log_path()).unwrap();
        assert_eq!(log.matches("manderrow-agent crashed at").count(), 2);
    }
}
