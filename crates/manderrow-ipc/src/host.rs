//! Host-side bookkeeping for one agent connection.
//!
//! The host process manager owns the listening socket; this type only decodes what
//! arrives on an accepted stream and keeps the shared state machine honest.

use thiserror::Error;

use crate::{
    C2SFrame, C2SMessage, Connection, ConnectionId, ConnectionStatus, FrameError, ProtocolError,
    S2CFrame, S2CMessage,
};

#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone)]
pub struct HostSession {
    connection: Connection,
}

impl HostSession {
    pub fn new(id: ConnectionId) -> Self {
        Self {
            connection: Connection::new(id),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    /// Decode one line from the agent and advance the connection.
    pub fn receive_line(&mut self, line: &str) -> Result<C2SMessage, HostError> {
        let frame = C2SFrame::decode_line(line)?;
        if frame.conn != self.connection.id() {
            return Err(FrameError::WrongConnection {
                expected: self.connection.id(),
                got: frame.conn,
            }
            .into());
        }
        self.connection.on_c2s(&frame.msg)?;
        Ok(frame.msg)
    }

    /// Encode the user's choice for a pending doctor report.
    pub fn respond(&mut self, report_id: &str, choice: &str) -> Result<String, HostError> {
        let msg = S2CMessage::PatientResponse {
            id: report_id.to_string(),
            choice: choice.to_string(),
        };
        self.connection.on_s2c(&msg)?;
        Ok(S2CFrame {
            conn: self.connection.id(),
            msg,
        }
        .encode_line()?)
    }

    pub fn transport_closed(&mut self) {
        self.connection.teardown();
    }
}
