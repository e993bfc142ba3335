use std::{
    ffi::OsString,
    path::PathBuf,
};

use crate::{ArgsError, CLOSE, Instruction, OPEN, opt};

/// Renders an agent region for a launcher to append to the target's arguments.
#[derive(Debug, Clone)]
pub struct ArgsBuilder {
    enable: bool,
    log_to_file: bool,
    logs_dir: Option<PathBuf>,
    c2s_tx: Option<String>,
    instructions: Vec<Instruction>,
    agent_path: Option<PathBuf>,
    bridge: Option<(PathBuf, PathBuf)>,
}

impl Default for ArgsBuilder {
    fn default() -> Self {
        Self {
            enable: true,
            log_to_file: false,
            logs_dir: None,
            c2s_tx: None,
            instructions: Vec::new(),
            agent_path: None,
            bridge: None,
        }
    }
}

impl ArgsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Omit `--enable`, producing a region the agent will ignore.
    pub fn disabled(mut self) -> Self {
        self.enable = false;
        self
    }

    pub fn log_to_file(mut self) -> Self {
        self.log_to_file = true;
        self
    }

    pub fn logs_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.logs_dir = Some(dir.into());
        self
    }

    pub fn c2s_tx(mut self, token: impl Into<String>) -> Self {
        self.c2s_tx = Some(token.into());
        self
    }

    pub fn instruction(mut self, insn: Instruction) -> Self {
        self.instructions.push(insn);
        self
    }

    pub fn agent_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.agent_path = Some(path.into());
        self
    }

    pub fn bridge(mut self, dlfcn_host: impl Into<PathBuf>, agent_host: impl Into<PathBuf>) -> Self {
        self.bridge = Some((dlfcn_host.into(), agent_host.into()));
        self
    }

    /// The region, sentinels included.
    ///
    /// Fails for values [`parse`](crate::parse) would read back differently: a sentinel
    /// as a value, a NUL byte, or a `--insn-set-var` key that is empty or contains `=`.
    pub fn build(&self) -> Result<Vec<OsString>, ArgsError> {
        let mut out = vec![OsString::from(OPEN)];
        let mut push = |name: &'static str, value: Option<OsString>| {
            out.push(name.into());
            if let Some(v) = value {
                check_value(name, &v)?;
                out.push(v);
            }
            Ok::<(), ArgsError>(())
        };

        if self.enable {
            push(opt::ENABLE, None)?;
        }
        if self.log_to_file {
            push(opt::LOG_TO_FILE, None)?;
        }
        if let Some(dir) = &self.logs_dir {
            push(opt::LOGS_DIR, Some(dir.clone().into_os_string()))?;
        }
        if let Some(tx) = &self.c2s_tx {
            push(opt::C2S_TX, Some(tx.into()))?;
        }
        if let Some(path) = &self.agent_path {
            push(opt::AGENT_PATH, Some(path.clone().into_os_string()))?;
        }
        for insn in &self.instructions {
            match insn {
                Instruction::LoadLibrary { path } => {
                    push(opt::INSN_LOAD_LIBRARY, Some(path.clone().into_os_string()))?
                }
                Instruction::SetVar { key, value } => {
                    if key.is_empty() || key.as_encoded_bytes().contains(&b'=') {
                        return Err(ArgsError::UnrepresentableValue {
                            option: opt::INSN_SET_VAR,
                            value: key.clone(),
                        });
                    }
                    let mut kv = key.clone();
                    kv.push("=");
                    kv.push(value);
                    push(opt::INSN_SET_VAR, Some(kv))?;
                }
                Instruction::PrependArg { value } => {
                    push(opt::INSN_PREPEND_ARG, Some(value.clone()))?
                }
                Instruction::AppendArg { value } => push(opt::INSN_APPEND_ARG, Some(value.clone()))?,
            }
        }
        if let Some((dlfcn, host)) = &self.bridge {
            push(opt::DLFCN_HOST_PATH, Some(dlfcn.clone().into_os_string()))?;
            push(opt::AGENT_HOST_PATH, Some(host.clone().into_os_string()))?;
        }

        out.push(CLOSE.into());
        Ok(out)
    }

    /// `before`, then the region, then `after`.
    pub fn wrap<I, J>(&self, before: I, after: J) -> Result<Vec<OsString>, ArgsError>
    where
        I: IntoIterator<Item = OsString>,
        J: IntoIterator<Item = OsString>,
    {
        let mut out: Vec<OsString> = before.into_iter().collect();
        out.extend(self.build()?);
        out.extend(after);
        Ok(out)
    }
}

fn check_value(option: &'static str, value: &OsString) -> Result<(), ArgsError> {
    if value == OPEN || value == CLOSE || value.as_encoded_bytes().contains(&0) {
        return Err(ArgsError::UnrepresentableValue {
            option,
            value: value.clone(),
        });
    }
    Ok(())
}
