//! Client wire protocol.
//!
//! Inbound frames are `{"type": ..., "data": ...}`; outbound frames are
//! `{"name": ..., "data": ...}`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A parsed client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Start the target with this catalog id on the user's machine.
    Start { target_id: u32 },
    /// Keepalive; only refreshes activity.
    Ping,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unknown message type '{0}'")]
    UnknownType(String),
}

impl ProtocolError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed_message",
            Self::UnknownType(_) => "unknown_message",
        }
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct StartData {
    target_id: u32,
}

impl Inbound {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        match envelope.kind.as_str() {
            "start" => {
                let data: StartData = serde_json::from_value(envelope.data)
                    .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
                Ok(Self::Start {
                    target_id: data.target_id,
                })
            }
            "ping" => Ok(Self::Ping),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

/// A message sent to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "name", content = "data", rename_all = "snake_case")]
pub enum Outbound {
    Starting {},
    Started {
        endpoint: String,
    },
    Error {
        #[serde(rename = "type")]
        kind: String,
        error: String,
    },
}

impl Outbound {
    pub fn starting() -> Self {
        Self::Starting {}
    }

    pub fn started(endpoint: impl Into<String>) -> Self {
        Self::Started {
            endpoint: endpoint.into(),
        }
    }

    pub fn error(kind: impl Into<String>, error: impl Into<String>) -> Self {
        Self::Error {
            kind: kind.into(),
            error: error.into(),
        }
    }

    pub fn already_connected() -> Self {
        Self::error(
            "already_connected",
            "user already connected on another tab or browser",
        )
    }

    /// Error `type`, for error messages.
    pub fn error_kind(&self) -> Option<&str> {
        match self {
            Self::Error { kind, .. } => Some(kind),
            _ => None,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"name":"error","data":{"type":"internal","error":"encoding failed"}}"#.to_string()
        })
    }
}
