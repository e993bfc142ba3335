use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{LogLevel, OutputChannel, SafeOsString};

const MAX_MESSAGE_BYTES: usize = 64 * 1024;
const MAX_CRASH_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("log scope must be non-empty printable ASCII without spaces: {0:?}")]
    InvalidScope(String),
    #[error("message is not valid UTF-8")]
    InvalidMessage,
    #[error("invalid doctor report: {0}")]
    InvalidDoctorReport(&'static str),
}

/// A remediation the user can pick in response to a [`DoctorReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoctorFix {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirm_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl DoctorFix {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: None,
            confirm_label: None,
            description: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoctorReport {
    pub id: String,
    pub translation_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<BTreeMap<String, String>>,
    pub fixes: Vec<DoctorFix>,
}

impl DoctorReport {
    pub fn validate(&self) -> Result<(), MessageError> {
        if self.id.is_empty() {
            return Err(MessageError::InvalidDoctorReport("empty report id"));
        }
        if self.fixes.is_empty() {
            return Err(MessageError::InvalidDoctorReport("no fixes offered"));
        }
        for (i, fix) in self.fixes.iter().enumerate() {
            if fix.id.is_empty() {
                return Err(MessageError::InvalidDoctorReport("empty fix id"));
            }
            if self.fixes[..i].iter().any(|f| f.id == fix.id) {
                return Err(MessageError::InvalidDoctorReport("duplicate fix id"));
            }
        }
        Ok(())
    }
}

/// Agent → host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum C2SMessage {
    Connect,
    Disconnect,
    Start {
        command: SafeOsString,
        args: Vec<SafeOsString>,
        env: Vec<(SafeOsString, SafeOsString)>,
    },
    Started {
        pid: u32,
    },
    Log {
        level: LogLevel,
        scope: String,
        message: String,
    },
    Output {
        channel: OutputChannel,
        line: SafeOsString,
    },
    Exit {
        code: Option<i32>,
    },
    Crash {
        error: String,
    },
    DoctorReport(DoctorReport),
}

impl C2SMessage {
    pub fn log(
        level: LogLevel,
        scope: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<Self, MessageError> {
        let scope = scope.into();
        validate_scope(&scope)?;
        Ok(C2SMessage::Log {
            level,
            scope,
            message: truncate_utf8(&message.into(), MAX_MESSAGE_BYTES),
        })
    }

    /// For callers holding raw bytes, e.g. across the C ABI.
    pub fn log_from_bytes(level: LogLevel, scope: &[u8], message: &[u8]) -> Result<Self, MessageError> {
        let scope = std::str::from_utf8(scope)
            .map_err(|_| MessageError::InvalidScope(String::from_utf8_lossy(scope).into_owned()))?;
        let message = std::str::from_utf8(message).map_err(|_| MessageError::InvalidMessage)?;
        Self::log(level, scope, message)
    }

    pub fn crash(error: impl Into<String>) -> Self {
        C2SMessage::Crash {
            error: truncate_utf8(&error.into(), MAX_CRASH_BYTES),
        }
    }

    pub fn crash_from_bytes(error: &[u8]) -> Result<Self, MessageError> {
        let error = std::str::from_utf8(error).map_err(|_| MessageError::InvalidMessage)?;
        Ok(Self::crash(error))
    }

    pub fn output(channel: OutputChannel, line: &[u8]) -> Self {
        C2SMessage::Output {
            channel,
            line: SafeOsString::from_bytes(line),
        }
    }

    /// Checks the invariants that constructors enforce, for messages built by hand or
    /// decoded off the wire.
    pub fn validate(&self) -> Result<(), MessageError> {
        match self {
            C2SMessage::Log { scope, .. } => validate_scope(scope),
            C2SMessage::DoctorReport(report) => report.validate(),
            _ => Ok(()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            C2SMessage::Connect => "connect",
            C2SMessage::Disconnect => "disconnect",
            C2SMessage::Start { .. } => "start",
            C2SMessage::Started { .. } => "started",
            C2SMessage::Log { .. } => "log",
            C2SMessage::Output { .. } => "output",
            C2SMessage::Exit { .. } => "exit",
            C2SMessage::Crash { .. } => "crash",
            C2SMessage::DoctorReport(_) => "doctor_report",
        }
    }
}

/// Host → agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum S2CMessage {
    PatientResponse { id: String, choice: String },
}

pub fn validate_scope(scope: &str) -> Result<(), MessageError> {
    if scope.is_empty() || !scope.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(MessageError::InvalidScope(scope.to_string()));
    }
    Ok(())
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_rejects_bad_scopes() {
        for bad in ["", "has space", "tab\there", "ünicode", "nl\n"] {
            let err = C2SMessage::log(LogLevel::Info, bad, "hello").unwrap_err();
            assert_eq!(err, MessageError::InvalidScope(bad.to_string()));
        }
        assert!(C2SMessage::log(LogLevel::Info, "BepInEx.Preloader", "hello").is_ok());
    }

    #[test]
    fn log_from_bytes_rejects_non_utf8_message() {
        let err = C2SMessage::log_from_bytes(LogLevel::Warn, b"agent", &[0x66, 0xff]).unwrap_err();
        assert_eq!(err, MessageError::InvalidMessage);

        let err = C2SMessage::log_from_bytes(LogLevel::Warn, &[0xff], b"fine").unwrap_err();
        assert!(matches!(err, MessageError::InvalidScope(_)));
    }

    #[test]
    fn crash_from_bytes_rejects_non_utf8() {
        assert_eq!(
            C2SMessage::crash_from_bytes(&[0xc3]).unwrap_err(),
            MessageError::InvalidMessage
        );
    }

    #[test]
    fn long_log_messages_are_truncated_on_char_boundary() {
        let long = "é".repeat(MAX_MESSAGE_BYTES);
        let C2SMessage::Log { message, .. } = C2SMessage::log(LogLevel::Info, "agent", long).unwrap()
        else {
            unreachable!()
        };
        assert!(message.len() <= MAX_MESSAGE_BYTES);
        assert!(message.ends_with("…(truncated)"));
    }

    #[test]
    fn wire_shape_is_internally_tagged() {
        let msg = C2SMessage::output(OutputChannel::Err, b"boom");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "output",
                "channel": "err",
                "line": { "kind": "unicode", "value": "boom" }
            })
        );

        let report = C2SMessage::DoctorReport(DoctorReport {
            id: "r1".into(),
            translation_key: "doctor.missing_dll".into(),
            message: None,
            args: None,
            fixes: vec![DoctorFix::new("ignore")],
        });
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["type"], "doctor_report");
        assert_eq!(json["fixes"][0]["id"], "ignore");
        assert!(json.get("message").is_none());
    }

    #[test]
    fn doctor_report_validation() {
        let mut report = DoctorReport {
            id: "r".into(),
            translation_key: "k".into(),
            message: None,
            args: None,
            fixes: vec![DoctorFix::new("a"), DoctorFix::new("a")],
        };
        assert_eq!(
            report.validate(),
            Err(MessageError::InvalidDoctorReport("duplicate fix id"))
        );
        report.fixes.pop();
        assert!(report.validate().is_ok());
        report.fixes.clear();
        assert!(report.validate().is_err());
    }
}
