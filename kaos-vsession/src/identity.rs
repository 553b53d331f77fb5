//! Peer-supplied session identity.

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, VSessionError};

/// Longest token accepted from a peer.
pub const MAX_IDENTITY_LEN: usize = 256;

/// Opaque token a peer presents on every physical connection.
///
/// Two connections presenting the same token in one namespace belong to the same
/// virtual session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionIdentity(Arc<str>);

impl SessionIdentity {
    /// Validate a token received during the handshake.
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        if token.is_empty() || token.len() > MAX_IDENTITY_LEN || token.chars().any(char::is_control) {
            return Err(VSessionError::InvalidIdentity);
        }
        Ok(Self(token.into()))
    }

    /// Fresh random identity, as a client would mint on first launch.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for SessionIdentity {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for SessionIdentity {
    type Error = VSessionError;

    fn try_from(token: &str) -> Result<Self> {
        Self::new(token)
    }
}
