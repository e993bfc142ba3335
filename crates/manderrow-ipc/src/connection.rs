use std::collections::HashMap;

use thiserror::Error;

use crate::{C2SMessage, ConnectionId, MessageError, S2CMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    /// Terminal.
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("connection {0} is not connected; cannot carry {1}")]
    NotConnected(ConnectionId, &'static str),
    #[error("connection {0} is already connected")]
    AlreadyConnected(ConnectionId),
    #[error("connection {0} is disconnected")]
    Disconnected(ConnectionId),
    #[error("doctor report {0:?} is already awaiting a response")]
    DuplicateReport(String),
    #[error("no doctor report {0:?} is awaiting a response")]
    UnknownReport(String),
    #[error("doctor report {report:?} offers no fix {choice:?}")]
    UnknownFix { report: String, choice: String },
    #[error(transparent)]
    Invalid(#[from] MessageError),
}

/// Lifecycle of one agent ⇄ host connection, shared by both ends.
///
/// `Connecting → Connected → Disconnected`, never backwards.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    status: ConnectionStatus,
    // report id -> offered fix ids
    pending_reports: HashMap<String, Vec<String>>,
}

impl Connection {
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            status: ConnectionStatus::Connecting,
            pending_reports: HashMap::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_pending(&self, report_id: &str) -> bool {
        self.pending_reports.contains_key(report_id)
    }

    /// Account for an agent → host message. Errors leave the state untouched.
    pub fn on_c2s(&mut self, msg: &C2SMessage) -> Result<(), ProtocolError> {
        msg.validate()?;
        match (self.status, msg) {
            (ConnectionStatus::Disconnected, _) => Err(ProtocolError::Disconnected(self.id)),
            (ConnectionStatus::Connecting, C2SMessage::Connect) => {
                self.status = ConnectionStatus::Connected;
                Ok(())
            }
            (ConnectionStatus::Connecting, other) => {
                Err(ProtocolError::NotConnected(self.id, other.kind()))
            }
            (ConnectionStatus::Connected, C2SMessage::Connect) => {
                Err(ProtocolError::AlreadyConnected(self.id))
            }
            (ConnectionStatus::Connected, C2SMessage::Disconnect | C2SMessage::Exit { .. }) => {
                self.teardown();
                Ok(())
            }
            (ConnectionStatus::Connected, C2SMessage::DoctorReport(report)) => {
                if self.pending_reports.contains_key(&report.id) {
                    return Err(ProtocolError::DuplicateReport(report.id.clone()));
                }
                self.pending_reports.insert(
                    report.id.clone(),
                    report.fixes.iter().map(|f| f.id.clone()).collect(),
                );
                Ok(())
            }
            (ConnectionStatus::Connected, _) => Ok(()),
        }
    }

    /// Account for a host → agent message. A response consumes its report.
    pub fn on_s2c(&mut self, msg: &S2CMessage) -> Result<(), ProtocolError> {
        match self.status {
            ConnectionStatus::Disconnected => return Err(ProtocolError::Disconnected(self.id)),
            ConnectionStatus::Connecting => {
                return Err(ProtocolError::NotConnected(self.id, "patient_response"));
            }
            ConnectionStatus::Connected => {}
        }

        match msg {
            S2CMessage::PatientResponse { id, choice } => {
                let fixes = self
                    .pending_reports
                    .get(id)
                    .ok_or_else(|| ProtocolError::UnknownReport(id.clone()))?;
                if !fixes.iter().any(|f| f == choice) {
                    return Err(ProtocolError::UnknownFix {
                        report: id.clone(),
                        choice: choice.clone(),
                    });
                }
                self.pending_reports.remove(id);
                Ok(())
            }
        }
    }

    /// The transport went away. Same effect as `Disconnect`.
    pub fn teardown(&mut self) {
        self.status = ConnectionStatus::Disconnected;
        self.pending_reports.clear();
    }
}
