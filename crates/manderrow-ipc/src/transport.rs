//! `--c2s-tx` tokens.
//!
//! ```text
//! tcp://127.0.0.1:41234?conn=17
//! unix:///run/user/1000/manderrow/ipc.sock?conn=17
//! ```
//!
//! `conn` is the host-allocated connection id. Without it the agent runs in
//! ad-hoc mode and picks its own.

use std::{fmt, path::PathBuf};

use thiserror::Error;

use crate::ConnectionId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("empty transport token")]
    Empty,
    #[error("unsupported transport scheme in {0:?}")]
    UnsupportedScheme(String),
    #[error("missing address in transport token {0:?}")]
    MissingAddress(String),
    #[error("invalid connection id {0:?}")]
    InvalidConnectionId(String),
    #[error("unknown transport parameter {0:?}")]
    UnknownParameter(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Unix(PathBuf),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportAddr {
    pub endpoint: Endpoint,
    pub conn: Option<ConnectionId>,
}

impl TransportAddr {
    pub fn parse(raw: &str) -> Result<Self, TransportError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(TransportError::Empty);
        }

        let (base, query) = match trimmed.split_once('?') {
            Some((b, q)) => (b, Some(q)),
            None => (trimmed, None),
        };

        let endpoint = if let Some(rest) = base.strip_prefix("tcp://") {
            if rest.is_empty() {
                return Err(TransportError::MissingAddress(raw.to_string()));
            }
            Endpoint::Tcp(rest.to_string())
        } else if let Some(rest) = base.strip_prefix("unix://") {
            if rest.is_empty() {
                return Err(TransportError::MissingAddress(raw.to_string()));
            }
            Endpoint::Unix(PathBuf::from(rest))
        } else {
            return Err(TransportError::UnsupportedScheme(raw.to_string()));
        };

        let mut conn = None;
        for pair in query.into_iter().flat_map(|q| q.split('&')).filter(|p| !p.is_empty()) {
            match pair.split_once('=') {
                Some(("conn", v)) => {
                    let id = v
                        .parse::<u64>()
                        .map_err(|_| TransportError::InvalidConnectionId(v.to_string()))?;
                    conn = Some(ConnectionId(id));
                }
                _ => return Err(TransportError::UnknownParameter(pair.to_string())),
            }
        }

        Ok(Self { endpoint, conn })
    }
}

impl fmt::Display for TransportAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.endpoint)?;
        if let Some(conn) = self.conn {
            write!(f, "?conn={conn}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_with_connection_id() {
        let addr = TransportAddr::parse("tcp://127.0.0.1:41234?conn=17").unwrap();
        assert_eq!(addr.endpoint, Endpoint::Tcp("127.0.0.1:41234".to_string()));
        assert_eq!(addr.conn, Some(ConnectionId(17)));
        assert_eq!(addr.to_string(), "tcp://127.0.0.1:41234?conn=17");
    }

    #[test]
    fn parses_unix_without_connection_id() {
        let addr = TransportAddr::parse("unix:///tmp/m.sock").unwrap();
        assert_eq!(addr.endpoint, Endpoint::Unix(PathBuf::from("/tmp/m.sock")));
        assert_eq!(addr.conn, None);
    }

    #[test]
    fn rejects_malformed_tokens() {
        assert_eq!(TransportAddr::parse("  "), Err(TransportError::Empty));
        assert!(matches!(
            TransportAddr::parse("pipe://x"),
            Err(TransportError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            TransportAddr::parse("tcp://"),
            Err(TransportError::MissingAddress(_))
        ));
        assert_eq!(
            TransportAddr::parse("tcp://h:1?conn=abc"),
            Err(TransportError::InvalidConnectionId("abc".to_string()))
        );
        assert_eq!(
            TransportAddr::parse("tcp://h:1?retry=1"),
            Err(TransportError::UnknownParameter("retry=1".to_string()))
        );
    }
}
