//! Reaching the manager's library through a loader shim.
//!
//! Under a compatibility layer the agent cannot link the manager's native library or
//! open it with its own loader. The launcher passes a small shim that exports the
//! usual `dlopen`/`dlsym`/`dlerror`; the agent opens the shim, then opens the host
//! library through it and resolves the five `manderrow_agent_host_*` entry points.

use std::{
    ffi::{CStr, c_char, c_int, c_void},
    path::{Path, PathBuf},
    time::Duration,
};

use manderrow_agent_host::ffi::LINE_KIND_BYTES;
use manderrow_ipc::{LogLevel, OutputChannel};
use thiserror::Error;

use crate::host::{HostApi, HostError};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to open {path:?}: {reason}")]
    OpenLibrary { path: PathBuf, reason: String },
    #[error("{library:?} does not export {symbol}: {reason}")]
    MissingSymbol {
        library: PathBuf,
        symbol: &'static str,
        reason: String,
    },
    #[error("path {0:?} cannot be passed to the loader")]
    InvalidPath(PathBuf),
    #[error("the loader bridge is not supported on this platform")]
    Unsupported,
}

type DlopenFn = unsafe extern "C" fn(*const c_char, c_int) -> *mut c_void;
type DlsymFn = unsafe extern "C" fn(*mut c_void, *const c_char) -> *mut c_void;
type DlerrorFn = unsafe extern "C" fn() -> *mut c_char;

type InitFn = unsafe extern "C" fn(*const u8, usize) -> u8;
type SendExitFn = unsafe extern "C" fn(bool, i32, u64) -> u8;
type SendCrashFn = unsafe extern "C" fn(*const u8, usize) -> u8;
type SendOutputLineFn = unsafe extern "C" fn(u8, u8, *const c_void, usize) -> u8;
type SendLogFn = unsafe extern "C" fn(u8, *const u8, usize, *const u8, usize) -> u8;

/// Entry points resolved from the host library. Filled once, never modified.
#[derive(Debug, Clone, Copy)]
struct HostFns {
    init: InitFn,
    send_exit: SendExitFn,
    send_crash: SendCrashFn,
    send_output_line: SendOutputLineFn,
    send_log: SendLogFn,
}

#[derive(Debug)]
pub struct DynamicHost {
    fns: HostFns,
}

// SAFETY: the table holds plain function pointers into a library that is never unloaded.
unsafe impl Send for DynamicHost {}
unsafe impl Sync for DynamicHost {}

impl DynamicHost {
    #[cfg(unix)]
    pub fn load(dlfcn_host: &Path, agent_host: &Path) -> Result<Self, BridgeError> {
        let shim = open_with(libc::dlopen, || last_error(libc::dlerror), dlfcn_host)?;

        // SAFETY: the shim's exports are declared with the standard dlfcn signatures.
        let (shim_dlopen, shim_dlsym, shim_dlerror) = unsafe {
            let lookup = |name: &'static CStr| {
                resolve(libc::dlsym, || last_error(libc::dlerror), shim, dlfcn_host, name)
            };
            (
                std::mem::transmute::<*mut c_void, DlopenFn>(lookup(c"dlopen")?),
                std::mem::transmute::<*mut c_void, DlsymFn>(lookup(c"dlsym")?),
                std::mem::transmute::<*mut c_void, DlerrorFn>(lookup(c"dlerror")?),
            )
        };

        let host = open_with(shim_dlopen, || last_error(shim_dlerror), agent_host)?;
        let lookup = |name: &'static CStr| {
            resolve(shim_dlsym, || last_error(shim_dlerror), host, agent_host, name)
        };

        // SAFETY: the symbols are the manderrow_agent_host_* exports, whose signatures
        // match the aliases above.
        let fns = unsafe {
            HostFns {
                init: std::mem::transmute::<*mut c_void, InitFn>(lookup(
                    c"manderrow_agent_host_init",
                )?),
                send_exit: std::mem::transmute::<*mut c_void, SendExitFn>(lookup(
                    c"manderrow_agent_host_send_exit",
                )?),
                send_crash: std::mem::transmute::<*mut c_void, SendCrashFn>(lookup(
                    c"manderrow_agent_host_send_crash",
                )?),
                send_output_line: std::mem::transmute::<*mut c_void, SendOutputLineFn>(lookup(
                    c"manderrow_agent_host_send_output_line",
                )?),
                send_log: std::mem::transmute::<*mut c_void, SendLogFn>(lookup(
                    c"manderrow_agent_host_send_log",
                )?),
            }
        };

        tracing::debug!(shim = %dlfcn_host.display(), host = %agent_host.display(), "resolved host library");
        Ok(Self { fns })
    }

    #[cfg(not(unix))]
    pub fn load(_dlfcn_host: &Path, _agent_host: &Path) -> Result<Self, BridgeError> {
        Err(BridgeError::Unsupported)
    }
}

#[cfg(unix)]
fn c_path(path: &Path) -> Result<std::ffi::CString, BridgeError> {
    use std::os::unix::ffi::OsStrExt;

    std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| BridgeError::InvalidPath(path.to_path_buf()))
}

fn last_error(dlerror: unsafe extern "C" fn() -> *mut c_char) -> String {
    // SAFETY: dlerror returns NULL or a NUL-terminated string valid until the next call.
    unsafe {
        let msg = dlerror();
        if msg.is_null() {
            "unknown error".to_string()
        } else {
            CStr::from_ptr(msg).to_string_lossy().into_owned()
        }
    }
}

#[cfg(unix)]
fn open_with(
    dlopen: unsafe extern "C" fn(*const c_char, c_int) -> *mut c_void,
    error: impl Fn() -> String,
    path: &Path,
) -> Result<*mut c_void, BridgeError> {
    let c = c_path(path)?;
    // SAFETY: `c` is NUL-terminated and outlives the call.
    let handle = unsafe { dlopen(c.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
    if handle.is_null() {
        return Err(BridgeError::OpenLibrary {
            path: path.to_path_buf(),
            reason: error(),
        });
    }
    Ok(handle)
}

#[cfg(unix)]
fn resolve(
    dlsym: unsafe extern "C" fn(*mut c_void, *const c_char) -> *mut c_void,
    error: impl Fn() -> String,
    handle: *mut c_void,
    library: &Path,
    name: &'static CStr,
) -> Result<*mut c_void, BridgeError> {
    // SAFETY: `handle` came from a successful dlopen and is never closed.
    let sym = unsafe { dlsym(handle, name.as_ptr()) };
    if sym.is_null() {
        return Err(BridgeError::MissingSymbol {
            library: library.to_path_buf(),
            symbol: name.to_str().unwrap_or("?"),
            reason: error(),
        });
    }
    Ok(sym)
}

impl HostApi for DynamicHost {
    fn init(&self, c2s_tx: &str) -> Result<(), HostError> {
        // SAFETY: pointer and length describe a live &str.
        let code = unsafe { (self.fns.init)(c2s_tx.as_ptr(), c2s_tx.len()) };
        HostError::check("init", code)
    }

    fn send_exit(&self, code: Option<i32>, flush_timeout: Duration) -> Result<(), HostError> {
        let timeout_ms = u64::try_from(flush_timeout.as_millis()).unwrap_or(u64::MAX);
        // SAFETY: plain values only.
        let status = unsafe { (self.fns.send_exit)(code.is_some(), code.unwrap_or(0), timeout_ms) };
        HostError::check("send_exit", status)
    }

    fn send_crash(&self, error: &str) -> Result<(), HostError> {
        // SAFETY: pointer and length describe a live &str.
        let code = unsafe { (self.fns.send_crash)(error.as_ptr(), error.len()) };
        HostError::check("send_crash", code)
    }

    fn send_output_line(&self, channel: OutputChannel, line: &[u8]) -> Result<(), HostError> {
        // SAFETY: pointer and length describe a live byte slice.
        let code = unsafe {
            (self.fns.send_output_line)(
                channel as u8,
                LINE_KIND_BYTES,
                line.as_ptr().cast(),
                line.len(),
            )
        };
        HostError::check("send_output_line", code)
    }

    fn send_log(&self, level: LogLevel, scope: &str, message: &str) -> Result<(), HostError> {
        // SAFETY: pointers and lengths describe live &strs.
        let code = unsafe {
            (self.fns.send_log)(
                level as u8,
                scope.as_ptr(),
                scope.len(),
                message.as_ptr(),
                message.len(),
            )
        };
        HostError::check("send_log", code)
    }
}

#[cfg(all(test, target_os = "linux", target_env = "gnu"))]
mod tests {
    use super::*;

    #[test]
    fn missing_shim_is_reported() {
        let err = DynamicHost::load(
            Path::new("/nonexistent/libdlfcn-host.so"),
            Path::new("/nonexistent/libmanderrow_agent_host.so"),
        )
        .unwrap_err();
        match err {
            BridgeError::OpenLibrary { path, reason } => {
                assert_eq!(path, Path::new("/nonexistent/libdlfcn-host.so"));
                assert!(!reason.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn host_library_without_entry_points_is_reported() {
        // The C library is a valid shim, but it is not a host library.
        let err = DynamicHost::load(Path::new("libc.so.6"), Path::new("libc.so.6")).unwrap_err();
        assert!(
            matches!(err, BridgeError::MissingSymbol { .. }),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn paths_with_nul_are_rejected() {
        let err = DynamicHost::load(Path::new("bad\0path"), Path::new("x")).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidPath(_)));
    }
}
