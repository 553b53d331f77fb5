//! Physical connection boundary.
//!
//! A transport (WebSocket, RUDP, an in-memory pipe in tests) implements
//! [`Connection`] for each accepted stream. The session layer hands it a
//! [`ConnectionLink`] on attach; the transport reports inbound packets, send
//! errors and closure back through that link, and completes each send through
//! the [`AckHandle`] it was given.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;

use async_trait::async_trait;
use serde_json::Value;

use crate::packet::{Packet, SeqNum};
use crate::session::VirtualSession;

/// Unique physical connection identifier
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id for a new connection.
pub fn generate_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// A single physical connection (transport-agnostic)
#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Check if connection is still open
    fn is_open(&self) -> bool;

    /// Ask the peer for its session token. Resolves to `None` if the connection
    /// closes first.
    async fn request_identity(&self) -> Option<String>;

    /// Route this connection's inbound traffic to a session.
    fn bind(&self, link: ConnectionLink);

    /// Transmit a packet. The peer's acknowledgment, or a transport failure
    /// for this packet, must be reported through `ack`.
    fn send(&self, packet: &Packet, ack: AckHandle) -> io::Result<()>;

    /// Close the connection. Safe to call more than once.
    fn close(&self);
}

/// Session-side endpoint handed to a bound connection.
#[derive(Clone)]
pub struct ConnectionLink {
    session: Weak<VirtualSession>,
    conn: ConnectionId,
}

impl ConnectionLink {
    pub(crate) fn new(session: Weak<VirtualSession>, conn: ConnectionId) -> Self {
        Self { session, conn }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.conn
    }

    /// False once the session is gone.
    pub fn is_bound(&self) -> bool {
        self.session.strong_count() > 0
    }

    /// A data packet arrived from the peer.
    pub fn inbound(&self, packet: Packet) {
        if let Some(session) = self.session.upgrade() {
            session.on_inbound(self.conn, packet);
        }
    }

    /// The transport failed to deliver `packet`.
    pub fn error(&self, packet: Packet) {
        if let Some(session) = self.session.upgrade() {
            session.on_transport_error(self.conn, packet);
        }
    }

    /// The connection closed.
    pub fn closed(&self, reason: &str) {
        if let Some(session) = self.session.upgrade() {
            session.detach(self.conn, reason);
        }
    }
}

/// Completion handle for one transmitted packet.
///
/// Consumed by either [`acknowledge`](Self::acknowledge) or
/// [`fail`](Self::fail). A handle whose dispatch was already reclaimed by the
/// ack timeout is ignored.
pub struct AckHandle {
    session: Weak<VirtualSession>,
    conn: ConnectionId,
    token: u64,
    seq: SeqNum,
}

impl AckHandle {
    pub(crate) fn new(session: Weak<VirtualSession>, conn: ConnectionId, token: u64, seq: SeqNum) -> Self {
        Self {
            session,
            conn,
            token,
            seq,
        }
    }

    pub fn seq(&self) -> SeqNum {
        self.seq
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.conn
    }

    /// The peer acknowledged the packet, optionally with reply arguments.
    pub fn acknowledge(self, args: Vec<Value>) {
        if let Some(session) = self.session.upgrade() {
            session.on_ack(self.conn, self.token, args);
        }
    }

    /// The transport gave up on this packet.
    pub fn fail(self) {
        if let Some(session) = self.session.upgrade() {
            session.on_ack_failure(self.conn, self.token);
        }
    }
}

impl std::fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckHandle")
            .field("conn", &self.conn)
            .field("token", &self.token)
            .field("seq", &self.seq)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_are_unique() {
        let a = generate_connection_id();
        let b = generate_connection_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_dangling_link_is_inert() {
        let link = ConnectionLink::new(Weak::new(), 7);
        assert!(!link.is_bound());
        assert_eq!(link.connection_id(), 7);
        link.inbound(Packet::data(SeqNum(0), crate::packet::Payload::message(vec![])));
        link.closed("gone");

        let ack = AckHandle::new(Weak::new(), 7, 0, SeqNum(3));
        assert_eq!(ack.seq(), SeqNum(3));
        ack.acknowledge(vec![]);
    }
}
