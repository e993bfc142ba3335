//! Host side of the agent boundary.
//!
//! The agent talks to the manager through five calls: `init`, `send_exit`, `send_crash`,
//! `send_output_line` and `send_log`. Linked builds call [`AgentHost`] directly; builds
//! that cross a loader boundary resolve the `manderrow_agent_host_*` symbols in [`ffi`].

use std::{ffi::OsString, sync::OnceLock, time::Duration};

use manderrow_ipc::{
    C2SMessage, ConnectionStatus, DoctorReport, IpcClient, IpcError, LogLevel, MessageError,
    OutputChannel, PendingResponse, ProtocolError, SafeOsString,
};
use thiserror::Error;

pub mod ffi;

/// Result codes shared by every exported call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HostStatus {
    Ok = 0,
    InvalidScope = 1,
    InvalidMessage = 2,
    NotConnected = 3,
    InvalidArgument = 4,
    AlreadyInitialized = 5,
    ConnectFailed = 6,
    FlushTimeout = 7,
}

impl HostStatus {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => HostStatus::Ok,
            1 => HostStatus::InvalidScope,
            2 => HostStatus::InvalidMessage,
            3 => HostStatus::NotConnected,
            4 => HostStatus::InvalidArgument,
            5 => HostStatus::AlreadyInitialized,
            6 => HostStatus::ConnectFailed,
            7 => HostStatus::FlushTimeout,
            _ => return None,
        })
    }
}

#[derive(Debug, Error)]
pub enum HostCallError {
    #[error("host connection is not initialized")]
    NotInitialized,
    #[error("host connection is already initialized")]
    AlreadyInitialized,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Ipc(#[from] IpcError),
}

impl HostCallError {
    pub fn status(&self) -> HostStatus {
        match self {
            HostCallError::NotInitialized => HostStatus::NotConnected,
            HostCallError::AlreadyInitialized => HostStatus::AlreadyInitialized,
            HostCallError::InvalidArgument(_) => HostStatus::InvalidArgument,
            HostCallError::Message(MessageError::InvalidScope(_)) => HostStatus::InvalidScope,
            HostCallError::Message(_) => HostStatus::InvalidMessage,
            HostCallError::Ipc(e) => match e {
                IpcError::Transport(_) => HostStatus::InvalidArgument,
                IpcError::Connect { .. } | IpcError::Runtime(_) => HostStatus::ConnectFailed,
                IpcError::Protocol(ProtocolError::Invalid(MessageError::InvalidScope(_))) => {
                    HostStatus::InvalidScope
                }
                IpcError::Protocol(ProtocolError::Invalid(_)) => HostStatus::InvalidMessage,
                IpcError::FlushTimeout => HostStatus::FlushTimeout,
                IpcError::Protocol(_) | IpcError::Frame(_) | IpcError::Closed => {
                    HostStatus::NotConnected
                }
            },
        }
    }
}

/// One process's connection to the manager. Initialized at most once.
#[derive(Debug, Default)]
pub struct AgentHost {
    client: OnceLock<IpcClient>,
}

impl AgentHost {
    pub const fn new() -> Self {
        Self {
            client: OnceLock::new(),
        }
    }

    /// Connect to the manager and announce the process.
    ///
    /// Sends `Connect`, then `Start` describing the command line and environment the
    /// target sees, then `Started`. Call it after the launch environment is in place.
    pub fn init(&self, c2s_tx: &str) -> Result<(), HostCallError> {
        if self.client.get().is_some() {
            return Err(HostCallError::AlreadyInitialized);
        }
        let client = IpcClient::connect(c2s_tx)?;
        client.send(start_message(std::env::args_os(), std::env::vars_os()))?;
        client.send(C2SMessage::Started {
            pid: std::process::id(),
        })?;

        let id = client.id();
        self.client
            .set(client)
            .map_err(|_| HostCallError::AlreadyInitialized)?;
        tracing::info!(conn = %id, "agent connected to manager");
        Ok(())
    }

    pub fn status(&self) -> Option<ConnectionStatus> {
        self.client.get().map(IpcClient::status)
    }

    fn client(&self) -> Result<&IpcClient, HostCallError> {
        self.client.get().ok_or(HostCallError::NotInitialized)
    }

    /// Report the process's exit and wait up to `flush_timeout` for it to leave.
    pub fn send_exit(&self, code: Option<i32>, flush_timeout: Duration) -> Result<(), HostCallError> {
        let client = self.client()?;
        client.send(C2SMessage::Exit { code })?;
        client.flush(flush_timeout)?;
        Ok(())
    }

    pub fn send_crash(&self, error: &str) -> Result<(), HostCallError> {
        self.client()?.send(C2SMessage::crash(error))?;
        Ok(())
    }

    pub fn send_output_line(
        &self,
        channel: OutputChannel,
        line: SafeOsString,
    ) -> Result<(), HostCallError> {
        self.client()?.send(C2SMessage::Output { channel, line })?;
        Ok(())
    }

    pub fn send_log(&self, level: LogLevel, scope: &str, message: &str) -> Result<(), HostCallError> {
        // Validate before looking at the connection so callers learn about bad input
        // even when nothing is listening.
        let msg = C2SMessage::log(level, scope, message)?;
        self.client()?.send(msg)?;
        Ok(())
    }

    /// Raise a doctor report. Waiting on the returned handle is up to the caller.
    pub fn doctor_report(&self, report: DoctorReport) -> Result<PendingResponse, HostCallError> {
        Ok(self.client()?.doctor_report(report)?)
    }

    /// Flush whatever is queued without ending the connection.
    pub fn flush(&self, timeout: Duration) -> Result<(), HostCallError> {
        Ok(self.client()?.flush(timeout)?)
    }
}

/// `Start` for a process launched with `args` and running with `vars`.
///
/// The agent region never reaches the target, so it is not reported either: the
/// arguments are the ones the target's `main` receives.
pub fn start_message<A, V>(args: A, vars: V) -> C2SMessage
where
    A: IntoIterator<Item = OsString>,
    V: IntoIterator<Item = (OsString, OsString)>,
{
    let raw: Vec<OsString> = args.into_iter().collect();
    let target = match manderrow_args::decode(raw.iter().cloned()) {
        Ok(parsed) => parsed.target_args(),
        Err(e) if e.is_disabled() => raw,
        Err(e) => {
            tracing::debug!(error = %e, "reporting raw arguments");
            raw
        }
    };

    let mut argv = target.iter().map(|a| SafeOsString::from(a.as_os_str()));
    let command = argv.next().unwrap_or_else(|| SafeOsString::from(""));
    C2SMessage::Start {
        command,
        args: argv.collect(),
        env: vars
            .into_iter()
            .map(|(k, v)| (SafeOsString::from(k.as_os_str()), SafeOsString::from(v.as_os_str())))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{BufRead, BufReader, Write},
        net::TcpListener,
        thread,
    };

    use manderrow_ipc::{ConnectionId, DoctorFix, HostSession};

    use super::*;

    #[test]
    fn calls_before_init_report_not_connected() {
        let host = AgentHost::new();
        let err = host.send_crash("boom").unwrap_err();
        assert_eq!(err.status(), HostStatus::NotConnected);
        assert_eq!(host.status(), None);
    }

    #[test]
    fn send_log_validates_before_connection() {
        let host = AgentHost::new();
        let err = host.send_log(LogLevel::Info, "bad scope", "x").unwrap_err();
        assert_eq!(err.status(), HostStatus::InvalidScope);
        let err = host.send_log(LogLevel::Info, "agent", "x").unwrap_err();
        assert_eq!(err.status(), HostStatus::NotConnected);
    }

    #[test]
    fn bad_token_is_invalid_argument() {
        let host = AgentHost::new();
        let err = host.init("carrier-pigeon://coop").unwrap_err();
        assert_eq!(err.status(), HostStatus::InvalidArgument);
    }

    #[test]
    fn start_reports_target_arguments_and_environment() {
        let args = manderrow_args::ArgsBuilder::new()
            .c2s_tx("tcp://127.0.0.1:4000?conn=2")
            .instruction(manderrow_args::Instruction::PrependArg {
                value: "--doorstop".into(),
            })
            .instruction(manderrow_args::Instruction::SetVar {
                key: "DOORSTOP_ENABLED".into(),
                value: "1".into(),
            })
            .wrap(vec!["game".into(), "-batchmode".into()], vec!["-nolog".into()])
            .unwrap();
        let vars = vec![(OsString::from("DOORSTOP_ENABLED"), OsString::from("1"))];

        let C2SMessage::Start { command, args, env } = start_message(args, vars) else {
            panic!("not a start message");
        };
        assert_eq!(command, SafeOsString::from("game"));
        assert_eq!(
            args,
            vec![
                SafeOsString::from("--doorstop"),
                SafeOsString::from("-batchmode"),
                SafeOsString::from("-nolog"),
            ]
        );
        assert!(!args.iter().any(|a| a.to_string_lossy().contains("manderrow")));
        assert_eq!(
            env,
            vec![(SafeOsString::from("DOORSTOP_ENABLED"), SafeOsString::from("1"))]
        );
    }

    #[test]
    fn start_without_region_reports_arguments_as_is() {
        let args: Vec<OsString> = vec!["game".into(), "-x".into()];
        let C2SMessage::Start { command, args, .. } = start_message(args, Vec::new()) else {
            panic!("not a start message");
        };
        assert_eq!(command, SafeOsString::from("game"));
        assert_eq!(args, vec![SafeOsString::from("-x")]);
    }

    #[test]
    fn status_codes_round_trip() {
        for code in 0..=7u8 {
            assert_eq!(HostStatus::from_u8(code).map(|s| s as u8), Some(code));
        }
        assert_eq!(HostStatus::from_u8(8), None);
    }

    #[test]
    fn session_announces_start_and_reports_exit() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let manager = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            let mut session = HostSession::new(ConnectionId(21));
            let mut seen = Vec::new();
            for line in BufReader::new(stream).lines() {
                let msg = session.receive_line(&line.unwrap()).unwrap();
                seen.push(msg.kind());
                match msg {
                    C2SMessage::DoctorReport(report) => {
                        let out = session.respond(&report.id, "ignore").unwrap();
                        writer.write_all(out.as_bytes()).unwrap();
                    }
                    C2SMessage::Exit { code } => {
                        assert_eq!(code, Some(0));
                        break;
                    }
                    _ => {}
                }
            }
            seen
        });

        let host = AgentHost::new();
        host.init(&format!("tcp://127.0.0.1:{port}?conn=21")).unwrap();
        assert!(matches!(
            host.init(&format!("tcp://127.0.0.1:{port}?conn=21")),
            Err(HostCallError::AlreadyInitialized)
        ));
        assert_eq!(host.status(), Some(ConnectionStatus::Connected));

        host.send_output_line(OutputChannel::Out, SafeOsString::from("hello"))
            .unwrap();
        host.send_log(LogLevel::Warn, "Preloader", "patching").unwrap();
        let choice = host
            .doctor_report(DoctorReport {
                id: "r".into(),
                translation_key: "doctor.r".into(),
                message: None,
                args: None,
                fixes: vec![DoctorFix::new("ignore")],
            })
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(choice, "ignore");
        host.send_exit(Some(0), Duration::from_secs(5)).unwrap();
        assert_eq!(host.status(), Some(ConnectionStatus::Disconnected));

        assert_eq!(
            manager.join().unwrap(),
            vec!["connect", "start", "started", "output", "log", "doctor_report", "exit"]
        );
    }
}
