//! Where the agent writes its files, and how its own diagnostics are logged.

use std::{
    cell::Cell,
    fmt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use manderrow_ipc::LogLevel;
use tracing::{Event, Level, Subscriber, field::Field};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer,
    field::Visit,
    layer::{Context, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::{
    config,
    host::HostApi,
    stdio::StderrSink,
    timestamp::{Timestamp, log_file_name},
};

/// Lazily resolved logs directory.
///
/// [`resolve`](Self::resolve) is called from the crash path, so it must not deadlock:
/// a thread that re-enters it while resolving (a crash during resolution) or finds the
/// init lock poisoned gets the current directory. Other threads wait their turn.
#[derive(Debug)]
pub struct LogsDir {
    configured: Option<PathBuf>,
    default_dir: Option<PathBuf>,
    resolved: Mutex<Option<PathBuf>>,
}

thread_local! {
    static RESOLVING: Cell<bool> = const { Cell::new(false) };
}

impl LogsDir {
    /// `configured` comes from `--logs-dir`, already normalized and created.
    pub fn new(configured: Option<PathBuf>) -> Self {
        let default_dir = match configured {
            Some(_) => None,
            None => config::default_logs_dir(),
        };
        Self::with_default_dir(configured, default_dir)
    }

    pub(crate) fn with_default_dir(configured: Option<PathBuf>, default_dir: Option<PathBuf>) -> Self {
        Self {
            configured,
            default_dir,
            resolved: Mutex::new(None),
        }
    }

    pub fn resolve(&self) -> PathBuf {
        if let Some(dir) = &self.configured {
            return dir.clone();
        }
        if RESOLVING.with(Cell::get) {
            return current_dir();
        }

        let mut slot = match self.resolved.lock() {
            Ok(slot) => slot,
            Err(_) => return current_dir(),
        };
        if let Some(dir) = slot.as_ref() {
            return dir.clone();
        }

        RESOLVING.with(|r| r.set(true));
        let dir = self
            .default_dir
            .clone()
            .filter(|dir| std::fs::create_dir_all(dir).is_ok())
            .unwrap_or_else(current_dir);
        RESOLVING.with(|r| r.set(false));

        *slot = Some(dir.clone());
        dir
    }
}

fn current_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// Install the global subscriber: stderr, optionally a log file, and the manager.
///
/// Returns `false` if another subscriber was already installed.
pub fn init_tracing(
    stderr: Arc<StderrSink>,
    log_file_dir: Option<&Path>,
    host: Option<Arc<dyn HostApi>>,
) -> bool {
    let filter = EnvFilter::try_new(config::log_filter()).unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = log_file_dir.and_then(|dir| {
        let name = log_file_name("log", Timestamp::now());
        match RollingFileAppender::builder()
            .rotation(Rotation::NEVER)
            .filename_prefix(name)
            .build(dir)
        {
            Ok(appender) => Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(appender),
            ),
            Err(e) => {
                let msg = format!("manderrow-agent: log file disabled: {e}\n");
                let _ = stderr.write_locked(msg.as_bytes());
                None
            }
        }
    });

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .with(host.map(HostLogLayer::new))
        .try_init()
        .is_ok()
}

thread_local! {
    static FORWARDING: Cell<bool> = const { Cell::new(false) };
}

/// Sends agent log events to the manager as `Log` messages.
pub struct HostLogLayer {
    host: Arc<dyn HostApi>,
}

impl HostLogLayer {
    pub fn new(host: Arc<dyn HostApi>) -> Self {
        Self { host }
    }
}

/// Events from the transport itself stay local, or a broken connection would feed on
/// its own warnings.
fn is_transport_target(target: &str) -> bool {
    target.starts_with("manderrow_ipc") || target.starts_with("manderrow_agent_host")
}

fn level_of(level: &Level) -> LogLevel {
    match *level {
        Level::ERROR => LogLevel::Error,
        Level::WARN => LogLevel::Warn,
        Level::INFO => LogLevel::Info,
        Level::DEBUG => LogLevel::Debug,
        _ => LogLevel::Trace,
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            self.record_debug(field, &value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        use std::fmt::Write;

        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

impl<S: Subscriber> Layer<S> for HostLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if is_transport_target(meta.target()) {
            return;
        }
        if FORWARDING.with(|f| f.replace(true)) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        visitor.message.push_str(&visitor.fields);
        let _ = self
            .host
            .send_log(level_of(meta.level()), meta.target(), &visitor.message);

        FORWARDING.with(|f| f.set(false));
    }
}
