//! Agent ⇄ host event/command protocol.
//!
//! The agent produces [`C2SMessage`]s tagged with a [`ConnectionId`]; the host answers
//! doctor reports with [`S2CMessage::PatientResponse`]. Frames travel as one JSON object
//! per line over whatever byte stream the `--c2s-tx` token names.

use std::fmt;

pub mod client;
pub mod connection;
pub mod frame;
pub mod host;
pub mod message;
pub mod safe_os_string;
pub mod transport;

pub use client::{IpcClient, IpcError, PendingResponse};
pub use connection::{Connection, ConnectionStatus, ProtocolError};
pub use frame::{C2SFrame, FrameError, S2CFrame};
pub use host::{HostError, HostSession};
pub use message::{C2SMessage, DoctorFix, DoctorReport, MessageError, S2CMessage};
pub use safe_os_string::SafeOsString;
pub use transport::{Endpoint, TransportAddr, TransportError};

/// Host-assigned identifier of one agent ⇄ host connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Self-assigned id for ad-hoc/attach mode, when the host did not hand one over.
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum LogLevel {
    Critical = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => LogLevel::Critical,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            5 => LogLevel::Trace,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum OutputChannel {
    Out = 1,
    Err = 2,
}

impl OutputChannel {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(OutputChannel::Out),
            2 => Some(OutputChannel::Err),
            _ => None,
        }
    }
}
