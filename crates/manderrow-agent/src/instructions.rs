//! Applying launch instructions to the running process.
//!
//! Environment changes and library loads happen here, before the target's `main`.
//! Variables are set first, before the manager is told the process started.
//! Argument edits are only recorded in [`ParsedArgs::target_args`](manderrow_args::ParsedArgs)
//! and take effect when `main` is entered.

use std::path::{Path, PathBuf};

use manderrow_args::Instruction;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstructionError {
    #[error("failed to load library {path:?}: {reason}")]
    LoadLibrary { path: PathBuf, reason: String },
}

/// Apply every `SetVar`, in order. Runs before the manager connection is set up so
/// the environment reported in `Start` is the one the target gets.
pub fn set_vars(instructions: &[Instruction]) {
    for insn in instructions {
        if let Instruction::SetVar { key, value } = insn {
            // SAFETY: runs during process start-up, before the target has had a chance
            // to spawn threads that read the environment.
            unsafe { std::env::set_var(key, value) };
            tracing::debug!(key = %key.to_string_lossy(), "set environment variable");
        }
    }
}

/// Load every `LoadLibrary`, in order, stopping at the first failure.
pub fn load_libraries(instructions: &[Instruction]) -> Result<(), InstructionError> {
    for insn in instructions {
        if let Instruction::LoadLibrary { path } = insn {
            load_library(path)?;
            tracing::debug!(path = %path.display(), "loaded library");
        }
    }
    Ok(())
}

/// Load a library for the lifetime of the process. The handle is never closed.
#[cfg(unix)]
fn load_library(path: &Path) -> Result<(), InstructionError> {
    use std::{ffi::CStr, ffi::CString, os::unix::ffi::OsStrExt};

    let err = |reason: String| InstructionError::LoadLibrary {
        path: path.to_path_buf(),
        reason,
    };
    let c = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| err("path contains a NUL byte".to_string()))?;

    // SAFETY: `c` is NUL-terminated; dlerror's result is read before any other dl call.
    unsafe {
        let handle = libc::dlopen(c.as_ptr(), libc::RTLD_NOW | libc::RTLD_GLOBAL);
        if handle.is_null() {
            let msg = libc::dlerror();
            let reason = if msg.is_null() {
                "unknown error".to_string()
            } else {
                CStr::from_ptr(msg).to_string_lossy().into_owned()
            };
            return Err(err(reason));
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn load_library(path: &Path) -> Result<(), InstructionError> {
    Err(InstructionError::LoadLibrary {
        path: path.to_path_buf(),
        reason: "library loading is not supported on this platform".to_string(),
    })
}
