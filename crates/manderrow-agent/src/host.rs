//! The five calls the agent makes into the manager's library.

use std::time::Duration;

use manderrow_agent_host::{AgentHost, HostCallError, HostStatus};
use manderrow_ipc::{LogLevel, OutputChannel, SafeOsString};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("host call {call} failed: {status:?}")]
pub struct HostError {
    pub call: &'static str,
    pub status: HostStatus,
}

impl HostError {
    pub(crate) fn check(call: &'static str, code: u8) -> Result<(), HostError> {
        match HostStatus::from_u8(code) {
            Some(HostStatus::Ok) => Ok(()),
            Some(status) => Err(HostError { call, status }),
            None => Err(HostError {
                call,
                status: HostStatus::InvalidArgument,
            }),
        }
    }

    fn linked(call: &'static str, e: HostCallError) -> Self {
        tracing::debug!(call, error = %e, "host call failed");
        HostError {
            call,
            status: e.status(),
        }
    }
}

/// How the agent reaches the manager. Chosen once at startup.
pub trait HostApi: Send + Sync {
    fn init(&self, c2s_tx: &str) -> Result<(), HostError>;
    fn send_exit(&self, code: Option<i32>, flush_timeout: Duration) -> Result<(), HostError>;
    fn send_crash(&self, error: &str) -> Result<(), HostError>;
    fn send_output_line(&self, channel: OutputChannel, line: &[u8]) -> Result<(), HostError>;
    fn send_log(&self, level: LogLevel, scope: &str, message: &str) -> Result<(), HostError>;
}

/// The manager's library linked into the agent.
#[derive(Debug, Default)]
pub struct LinkedHost {
    host: AgentHost,
}

impl LinkedHost {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HostApi for LinkedHost {
    fn init(&self, c2s_tx: &str) -> Result<(), HostError> {
        self.host
            .init(c2s_tx)
            .map_err(|e| HostError::linked("init", e))
    }

    fn send_exit(&self, code: Option<i32>, flush_timeout: Duration) -> Result<(), HostError> {
        self.host
            .send_exit(code, flush_timeout)
            .map_err(|e| HostError::linked("send_exit", e))
    }

    fn send_crash(&self, error: &str) -> Result<(), HostError> {
        self.host
            .send_crash(error)
            .map_err(|e| HostError::linked("send_crash", e))
    }

    fn send_output_line(&self, channel: OutputChannel, line: &[u8]) -> Result<(), HostError> {
        self.host
            .send_output_line(channel, SafeOsString::from_bytes(line))
            .map_err(|e| HostError::linked("send_output_line", e))
    }

    fn send_log(&self, level: LogLevel, scope: &str, message: &str) -> Result<(), HostError> {
        self.host
            .send_log(level, scope, message)
            .map_err(|e| HostError::linked("send_log", e))
    }
}
