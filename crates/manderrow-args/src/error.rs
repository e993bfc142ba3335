use std::{ffi::OsString, fmt, io, path::PathBuf};

use thiserror::Error;

/// Text encoding an option value is declared to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    /// Whatever the OS passes through its own string APIs. Must not contain NUL.
    Native,
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Utf8 => f.write_str("UTF-8"),
            Encoding::Native => f.write_str("OS-native text"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ArgsError {
    /// Not a failure: the region is absent or lacks `--enable`. Leave the process alone.
    #[error("agent is not enabled")]
    Disabled,

    #[error("unbalanced delimiter {token:?} at argument {index}")]
    UnbalancedDelimiter { token: &'static str, index: usize },

    #[error("unexpected argument {0:?}")]
    UnexpectedArgument(OsString),

    #[error("missing value for option {0}")]
    MissingOptionValue(&'static str),

    #[error("value for option {option} is not valid {encoding}: {value:?}")]
    InvalidEncoding {
        option: &'static str,
        encoding: Encoding,
        value: OsString,
    },

    #[error("invalid value for --insn-set-var, expected KEY=VALUE: {0:?}")]
    InvalidSetVarKV(OsString),

    #[error("option {0} given more than once")]
    DuplicateOption(&'static str),

    #[error("--dlfcn-host-path and --agent-host-path must be given together")]
    IncompleteBridgePaths,

    #[error("value for option {option} cannot be carried in an agent region: {value:?}")]
    UnrepresentableValue {
        option: &'static str,
        value: OsString,
    },

    #[error("failed to prepare logs directory {path:?}: {source}")]
    LogsDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ArgsError {
    pub fn is_disabled(&self) -> bool {
        matches!(self, ArgsError::Disabled)
    }
}
