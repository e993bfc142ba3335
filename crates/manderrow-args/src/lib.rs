//! Agent instruction block carried in a launched process's argument vector.
//!
//! The launcher appends a delimited region to the target's arguments:
//!
//! ```text
//! game.exe --real-arg {manderrow --enable --c2s-tx tcp://127.0.0.1:4000?conn=7 manderrow} --more
//! ```
//!
//! Everything between [`OPEN`] and [`CLOSE`] belongs to the agent and never reaches the
//! wrapped program. Everything outside is passed through untouched.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

mod builder;
mod error;
mod parse;

pub use builder::ArgsBuilder;
pub use error::{ArgsError, Encoding};
pub use parse::{decode, parse};

pub const OPEN: &str = "{manderrow";
pub const CLOSE: &str = "manderrow}";

/// Directive names accepted inside the region.
pub mod opt {
    pub const ENABLE: &str = "--enable";
    pub const LOG_TO_FILE: &str = "--log-to-file";
    pub const LOGS_DIR: &str = "--logs-dir";
    pub const C2S_TX: &str = "--c2s-tx";
    pub const INSN_LOAD_LIBRARY: &str = "--insn-load-library";
    pub const INSN_SET_VAR: &str = "--insn-set-var";
    pub const INSN_PREPEND_ARG: &str = "--insn-prepend-arg";
    pub const INSN_APPEND_ARG: &str = "--insn-append-arg";
    pub const AGENT_PATH: &str = "--agent-path";
    pub const DLFCN_HOST_PATH: &str = "--dlfcn-host-path";
    pub const AGENT_HOST_PATH: &str = "--agent-host-path";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    LoadLibrary { path: PathBuf },
    SetVar { key: OsString, value: OsString },
    PrependArg { value: OsString },
    AppendArg { value: OsString },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentConfig {
    pub enabled: bool,
    pub log_to_file: bool,
    /// Normalized and already created by [`parse`]; as given by [`decode`].
    pub logs_dir: Option<PathBuf>,
    pub c2s_tx: Option<String>,
    pub instructions: Vec<Instruction>,
    pub dlfcn_host_path: Option<PathBuf>,
    pub agent_host_path: Option<PathBuf>,
}

impl AgentConfig {
    /// Loader shim and host library paths, when the agent must resolve the host dynamically.
    pub fn bridge_paths(&self) -> Option<(&Path, &Path)> {
        match (&self.dlfcn_host_path, &self.agent_host_path) {
            (Some(dlfcn), Some(host)) => Some((dlfcn, host)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedArgs {
    pub config: AgentConfig,
    /// Arguments outside the region, in their original order (argv[0] included).
    pub passthrough: Vec<OsString>,
}

impl ParsedArgs {
    /// Argument vector the wrapped program should see.
    ///
    /// argv[0] stays first, prepended values follow in encounter order, then the
    /// original arguments, then appended values.
    pub fn target_args(&self) -> Vec<OsString> {
        let mut rest = self.passthrough.iter();
        let mut out = Vec::with_capacity(self.passthrough.len() + self.config.instructions.len());
        if let Some(program) = rest.next() {
            out.push(program.clone());
        }
        for insn in &self.config.instructions {
            if let Instruction::PrependArg { value } = insn {
                out.push(value.clone());
            }
        }
        out.extend(rest.cloned());
        for insn in &self.config.instructions {
            if let Instruction::AppendArg { value } = insn {
                out.push(value.clone());
            }
        }
        out
    }

    /// True when the instructions change argv beyond removing the region.
    pub fn edits_args(&self) -> bool {
        self.config.instructions.iter().any(|i| {
            matches!(
                i,
                Instruction::PrependArg { .. } | Instruction::AppendArg { .. }
            )
        })
    }
}
