use crate::error::UnitdError;
use serde::{Deserialize, Serialize};

/// One-shot startup result relayed from a detached supervisor to its invoker.
///
/// Wire form is a single JSON line; `url` is present only when `started` is
/// true and `error` only when it is false.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeReport {
    pub started: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HandshakeReport {
    pub fn started(url: impl Into<String>) -> Self {
        Self {
            started: true,
            url: Some(url.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            started: false,
            url: None,
            error: Some(error.into()),
        }
    }

    /// Encode as a single line, without the trailing newline
    pub fn to_line(&self) -> Result<String, UnitdError> {
        serde_json::to_string(self)
            .map_err(|e| UnitdError::handshake(format!("cannot encode report: {e}")))
    }

    pub fn from_line(line: &str) -> Result<Self, UnitdError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Err(UnitdError::handshake("empty handshake line"));
        }
        serde_json::from_str(line)
            .map_err(|e| UnitdError::handshake(format!("malformed handshake line: {e}")))
    }
}
