//! The launch agent.
//!
//! Loaded into a freshly spawned game process, it reads its instructions from the
//! process's arguments, sets up the environment they ask for, connects to the manager
//! and loads the requested libraries. It then relays the process's output and
//! lifecycle until it exits.

use std::{
    ffi::OsString,
    sync::{
        Arc, Mutex, OnceLock, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::Context as _;
use manderrow_args::{AgentConfig, ParsedArgs};

pub mod bridge;
pub mod config;
pub mod crash;
pub mod host;
pub mod instructions;
pub mod logs;
#[cfg(unix)]
mod start;
pub mod stdio;
pub mod timestamp;

use crate::{
    bridge::{BridgeError, DynamicHost},
    crash::{CrashHooks, CrashReporter},
    host::{HostApi, HostError, LinkedHost},
    instructions::InstructionError,
    logs::LogsDir,
    stdio::StderrSink,
};

/// Everything the agent knows about the process it lives in.
pub struct AgentContext {
    parsed: ParsedArgs,
    logs: Arc<LogsDir>,
    stderr: Arc<StderrSink>,
    crash: Arc<CrashReporter>,
    host: OnceLock<Arc<dyn HostApi>>,
    exit_code: Mutex<Option<i32>>,
    #[cfg(unix)]
    stdio: Mutex<Option<stdio::StdioCapture>>,
    finished: AtomicBool,
}

impl std::fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentContext")
            .field("config", &self.parsed.config)
            .field("connected", &self.host.get().is_some())
            .finish_non_exhaustive()
    }
}

impl AgentContext {
    pub fn new(parsed: ParsedArgs) -> Self {
        Self::with_crash_hooks(parsed, CrashHooks::default())
    }

    pub fn with_crash_hooks(parsed: ParsedArgs, hooks: CrashHooks) -> Self {
        let logs = Arc::new(LogsDir::new(parsed.config.logs_dir.clone()));
        let stderr = Arc::new(StderrSink::new());
        let crash = Arc::new(CrashReporter::with_hooks(logs.clone(), stderr.clone(), hooks));
        Self {
            parsed,
            logs,
            stderr,
            crash,
            host: OnceLock::new(),
            exit_code: Mutex::new(None),
            #[cfg(unix)]
            stdio: Mutex::new(None),
            finished: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.parsed.config
    }

    /// The argument vector the target's `main` receives.
    pub fn target_args(&self) -> Vec<OsString> {
        self.parsed.target_args()
    }

    pub fn logs(&self) -> &LogsDir {
        &self.logs
    }

    pub fn host(&self) -> Option<&Arc<dyn HostApi>> {
        self.host.get()
    }

    pub fn crash(&self, message: &str) -> ! {
        self.crash.crash(message)
    }

    /// Connect through `host` to the manager named by `--c2s-tx`. Without a token there
    /// is nobody to talk to and `host` is dropped.
    pub fn connect(&self, host: Arc<dyn HostApi>) -> Result<bool, HostError> {
        let Some(c2s_tx) = self.parsed.config.c2s_tx.as_deref() else {
            return Ok(false);
        };
        host.init(c2s_tx)?;
        self.crash.set_host(host.clone());
        let _ = self.host.set(host);
        Ok(true)
    }

    /// Set the environment variables the launch asked for.
    pub fn apply_env(&self) {
        instructions::set_vars(&self.parsed.config.instructions);
    }

    /// [`apply_env`](Self::apply_env), then [`connect`](Self::connect). The manager
    /// sees the environment the target runs with.
    pub fn announce(&self, host: Arc<dyn HostApi>) -> Result<bool, HostError> {
        self.apply_env();
        self.connect(host)
    }

    pub fn load_libraries(&self) -> Result<(), InstructionError> {
        instructions::load_libraries(&self.parsed.config.instructions)
    }

    #[cfg(unix)]
    pub fn capture_stdio(&self) -> std::io::Result<()> {
        let Some(host) = self.host.get() else {
            return Ok(());
        };
        let capture = stdio::StdioCapture::install(host.clone(), self.stderr.clone())?;
        *self.stdio.lock().unwrap_or_else(PoisonError::into_inner) = Some(capture);
        Ok(())
    }

    pub fn record_exit_code(&self, code: i32) {
        *self.exit_code.lock().unwrap_or_else(PoisonError::into_inner) = Some(code);
    }

    /// [`record_exit_code`](Self::record_exit_code) and [`finish`](Self::finish) in one
    /// step, for exit paths that know the status.
    pub fn finish_with_status(&self, code: i32) {
        self.record_exit_code(code);
        self.finish();
    }

    /// Drain captured output and report `Exit`. Only the first call does anything.
    ///
    /// Runs from the process's exit handlers, so a process leaving through `_exit` or
    /// a fatal signal never reports.
    pub fn finish(&self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }

        #[cfg(unix)]
        if let Some(capture) = self.stdio.lock().unwrap_or_else(PoisonError::into_inner).take() {
            capture.finish(config::stdio_drain_timeout());
        }

        if let Some(host) = self.host.get() {
            let code = *self.exit_code.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = host.send_exit(code, config::ipc_flush_timeout()) {
                tracing::warn!(error = %e, "failed to report exit");
            }
        }
    }
}

/// The manager's library as this process can reach it.
pub fn select_host(config: &AgentConfig) -> Result<Arc<dyn HostApi>, BridgeError> {
    Ok(match config.bridge_paths() {
        Some((dlfcn_host, agent_host)) => Arc::new(DynamicHost::load(dlfcn_host, agent_host)?),
        None => Arc::new(LinkedHost::new()),
    })
}

static AGENT: OnceLock<AgentContext> = OnceLock::new();

/// The running agent, once [`start`] has accepted the process's arguments.
pub fn agent() -> Option<&'static AgentContext> {
    AGENT.get()
}

/// Bring the agent up from the process's raw arguments.
///
/// Returns `None` when the agent is disabled or already running. Configuration and
/// connection failures do not return: they go through the crash reporter.
pub fn start(args: Vec<OsString>) -> Option<&'static AgentContext> {
    if AGENT.get().is_some() {
        return None;
    }

    let parsed = match manderrow_args::parse(args) {
        Ok(parsed) => parsed,
        Err(e) if e.is_disabled() => return None,
        Err(e) => {
            let reporter = CrashReporter::new(Arc::new(LogsDir::new(None)), Arc::new(StderrSink::new()));
            reporter.crash(&format!("invalid agent arguments: {e}"))
        }
    };

    let ctx = AGENT.get_or_init(|| AgentContext::new(parsed));
    if let Err(e) = boot(ctx) {
        ctx.crash(&format!("{e:#}"));
    }
    Some(ctx)
}

fn boot(ctx: &'static AgentContext) -> anyhow::Result<()> {
    ctx.crash.install_panic_hook();

    if ctx.config().c2s_tx.is_some() {
        let host = select_host(ctx.config()).context("failed to resolve the manager's library")?;
        ctx.announce(host).context("failed to connect to the manager")?;
    } else {
        ctx.apply_env();
    }

    let log_file_dir = ctx.config().log_to_file.then(|| ctx.logs.resolve());
    logs::init_tracing(ctx.stderr.clone(), log_file_dir.as_deref(), ctx.host().cloned());

    ctx.load_libraries()
        .context("failed to apply launch instructions")?;

    #[cfg(unix)]
    {
        if let Err(e) = ctx.capture_stdio() {
            tracing::warn!(error = %e, "output will not be forwarded");
        }
        if ctx.parsed.edits_args() && !start::REWRITES_ARGV {
            tracing::warn!("argument instructions are not supported on this platform");
        }

        if !register_exit_handler() {
            tracing::warn!("failed to register exit handler");
        }
    }

    tracing::info!(
        connected = ctx.host().is_some(),
        instructions = ctx.config().instructions.len(),
        "agent started"
    );
    Ok(())
}

/// Report `Exit` from the process's exit handlers. glibc hands `on_exit` handlers
/// the status given to `exit`, which also covers returning from `main`.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn register_exit_handler() -> bool {
    use std::ffi::{c_int, c_void};

    unsafe extern "C" {
        fn on_exit(function: extern "C" fn(c_int, *mut c_void), arg: *mut c_void) -> c_int;
    }

    extern "C" fn on_process_exit(status: c_int, _arg: *mut c_void) {
        if let Some(ctx) = agent() {
            ctx.finish_with_status(status);
        }
    }

    // SAFETY: registering a plain extern "C" function with no argument.
    unsafe { on_exit(on_process_exit, std::ptr::null_mut()) == 0 }
}

/// Elsewhere only `atexit` is available, so the status is whatever the `main`
/// trampoline recorded.
#[cfg(all(unix, not(all(target_os = "linux", target_env = "gnu"))))]
fn register_exit_handler() -> bool {
    extern "C" fn on_process_exit() {
        if let Some(ctx) = agent() {
            ctx.finish();
        }
    }

    // SAFETY: registering a plain extern "C" function.
    unsafe { libc::atexit(on_process_exit) == 0 }
}

/// Runs when the dynamic linker loads the agent. glibc passes the process's argv.
#[cfg(all(target_os = "linux", target_env = "gnu", not(test)))]
#[unsafe(link_section = ".init_array")]
#[used]
static INIT: extern "C" fn(std::ffi::c_int, *const *const std::ffi::c_char, *const *const std::ffi::c_char) = {
    extern "C" fn init(
        argc: std::ffi::c_int,
        argv: *const *const std::ffi::c_char,
        _envp: *const *const std::ffi::c_char,
    ) {
        // SAFETY: the loader passes the same argc/argv that `main` will get.
        let args = unsafe { start::collect_args(argc, argv) };
        start(args);
    }
    init
};
