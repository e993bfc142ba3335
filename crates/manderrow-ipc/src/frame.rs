//! Line framing: one JSON object per `\n`-terminated line.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::{C2SMessage, ConnectionId, S2CMessage};

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame for connection {got} arrived on connection {expected}")]
    WrongConnection {
        expected: ConnectionId,
        got: ConnectionId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct C2SFrame {
    pub conn: ConnectionId,
    pub msg: C2SMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S2CFrame {
    pub conn: ConnectionId,
    pub msg: S2CMessage,
}

impl C2SFrame {
    pub fn encode_line(&self) -> Result<String, FrameError> {
        encode_line(self)
    }

    pub fn decode_line(line: &str) -> Result<Self, FrameError> {
        decode_line(line)
    }
}

impl S2CFrame {
    pub fn encode_line(&self) -> Result<String, FrameError> {
        encode_line(self)
    }

    pub fn decode_line(line: &str) -> Result<Self, FrameError> {
        decode_line(line)
    }
}

fn encode_line<T: Serialize>(frame: &T) -> Result<String, FrameError> {
    // serde_json never emits raw newlines, so the line is self-delimiting.
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    Ok(line)
}

fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, FrameError> {
    Ok(serde_json::from_str(line.trim_end_matches(['\r', '\n']))?)
}
