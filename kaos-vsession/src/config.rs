//! Session and server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VSessionError};
use crate::reorder::DeliveryMode;

/// Per-session behaviour, shared by every session of a namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Physical connections one identity may hold at once.
    pub max_connections_per_session: usize,
    /// Deliver inbound events in emission order. When false they are
    /// delivered on arrival.
    pub sequential_recv: bool,
    /// Retry the in-flight packet of a connection that detaches.
    pub requeue_on_detach: bool,
    /// How long a dispatched packet may wait for its ack. `None` waits forever.
    pub ack_timeout_ms: Option<u64>,
    /// How long a new connection may take to present its identity.
    pub handshake_timeout_ms: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_connections_per_session: 20,
            sequential_recv: true,
            requeue_on_detach: true,
            ack_timeout_ms: Some(30_000),
            handshake_timeout_ms: Some(10_000),
        }
    }
}

impl SessionConfig {
    pub fn delivery_mode(&self) -> DeliveryMode {
        if self.sequential_recv {
            DeliveryMode::Sequential
        } else {
            DeliveryMode::Immediate
        }
    }

    pub fn ack_timeout(&self) -> Option<Duration> {
        self.ack_timeout_ms.map(Duration::from_millis)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections_per_session == 0 {
            return Err(VSessionError::config("max_connections_per_session must be at least 1"));
        }
        if self.ack_timeout_ms == Some(0) {
            return Err(VSessionError::config("ack_timeout_ms must be positive"));
        }
        if self.handshake_timeout_ms == Some(0) {
            return Err(VSessionError::config("handshake_timeout_ms must be positive"));
        }
        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub session: SessionConfig,
    /// Period of the ack-timeout sweep.
    pub reap_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            reap_interval_ms: 1_000,
        }
    }
}

impl ServerConfig {
    /// Parse and validate a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.reap_interval_ms == 0 {
            return Err(VSessionError::config("reap_interval_ms must be positive"));
        }
        self.session.validate()
    }
}
