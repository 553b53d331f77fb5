//! Error types for kaos-vsession.

use thiserror::Error;

use crate::transport::ConnectionId;

pub type Result<T> = std::result::Result<T, VSessionError>;

#[derive(Error, Debug)]
pub enum VSessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Admission rejected: session {identity} already has {max} connections")]
    AdmissionRejected { identity: String, max: usize },

    #[error("Handshake abandoned by connection {connection}")]
    HandshakeAbandoned { connection: ConnectionId },

    #[error("Handshake timed out for connection {connection}")]
    HandshakeTimeout { connection: ConnectionId },

    #[error("Invalid session identity")]
    InvalidIdentity,

    #[error("Session closed: {identity}")]
    SessionClosed { identity: String },

    #[error("Callbacks are not supported when broadcasting")]
    CallbackOnBroadcast,

    #[error("Reserved event name: {0}")]
    ReservedEvent(String),

    #[error("Room error: {reason}")]
    Room { reason: String },

    #[error("Configuration error: {reason}")]
    Config { reason: String },

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl VSessionError {
    pub fn admission_rejected(identity: impl Into<String>, max: usize) -> Self {
        Self::AdmissionRejected {
            identity: identity.into(),
            max,
        }
    }

    pub fn session_closed(identity: impl Into<String>) -> Self {
        Self::SessionClosed {
            identity: identity.into(),
        }
    }

    pub fn reserved(event: impl Into<String>) -> Self {
        Self::ReservedEvent(event.into())
    }

    pub fn room(reason: impl Into<String>) -> Self {
        Self::Room {
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// True for failures that only concern the connection being admitted.
    pub fn is_admission_failure(&self) -> bool {
        matches!(
            self,
            Self::AdmissionRejected { .. }
                | Self::HandshakeAbandoned { .. }
                | Self::HandshakeTimeout { .. }
                | Self::InvalidIdentity
        )
    }
}
