//! In-memory connection for driving sessions from tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use kaos_test_support::{DropDecision, LossGenerator};
use kaos_vsession::{
    generate_connection_id, AckHandle, Connection, ConnectionId, ConnectionLink, Packet, Payload, SeqNum,
    SessionRegistry, VirtualSession,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

pub struct MockConnection {
    id: ConnectionId,
    open: AtomicBool,
    identity_rx: Mutex<Option<oneshot::Receiver<String>>>,
    identity_tx: Mutex<Option<oneshot::Sender<String>>>,
    link: Mutex<Option<ConnectionLink>>,
    sent: Mutex<VecDeque<(Packet, AckHandle)>>,
    history: Mutex<Vec<Packet>>,
    loss: Mutex<Option<LossGenerator>>,
    closes: AtomicUsize,
}

impl MockConnection {
    /// Connection whose peer has not answered the identity request yet.
    pub fn new() -> Arc<Self> {
        let (tx, rx) = oneshot::channel();
        Arc::new(Self {
            id: generate_connection_id(),
            open: AtomicBool::new(true),
            identity_rx: Mutex::new(Some(rx)),
            identity_tx: Mutex::new(Some(tx)),
            link: Mutex::new(None),
            sent: Mutex::new(VecDeque::new()),
            history: Mutex::new(Vec::new()),
            loss: Mutex::new(None),
            closes: AtomicUsize::new(0),
        })
    }

    /// Connection whose peer answers with `token` right away.
    pub fn with_identity(token: &str) -> Arc<Self> {
        let conn = Self::new();
        conn.answer_identity(token);
        conn
    }

    pub fn answer_identity(&self, token: &str) {
        if let Some(tx) = self.identity_tx.lock().take() {
            let _ = tx.send(token.to_string());
        }
    }

    /// Fail sends according to `loss`.
    pub fn set_loss(&self, loss: LossGenerator) {
        *self.loss.lock() = Some(loss);
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_bound(&self) -> bool {
        self.link.lock().as_ref().is_some_and(ConnectionLink::is_bound)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn link(&self) -> Option<ConnectionLink> {
        self.link.lock().clone()
    }

    fn pop(&self) -> Option<(Packet, AckHandle)> {
        self.sent.lock().pop_front()
    }

    /// Packets sent and not yet acked or failed.
    pub fn pending(&self) -> Vec<Packet> {
        self.sent.lock().iter().map(|(p, _)| p.clone()).collect()
    }

    pub fn pending_events(&self) -> Vec<String> {
        self.pending().into_iter().map(|p| p.payload.event).collect()
    }

    pub fn take_sent(&self) -> Vec<(Packet, AckHandle)> {
        self.sent.lock().drain(..).collect()
    }

    /// Every packet ever handed to this connection.
    pub fn history(&self) -> Vec<Packet> {
        self.history.lock().clone()
    }

    /// Peer acks the oldest outstanding packet.
    pub fn ack_next(&self) -> Option<Packet> {
        self.ack_next_with(Vec::new())
    }

    pub fn ack_next_with(&self, args: Vec<Value>) -> Option<Packet> {
        let (packet, ack) = self.pop()?;
        ack.acknowledge(args);
        Some(packet)
    }

    /// Transport gives up on the oldest outstanding packet.
    pub fn fail_next(&self) -> Option<Packet> {
        let (packet, ack) = self.pop()?;
        ack.fail();
        Some(packet)
    }

    /// Transport reports the oldest outstanding packet as failed through the
    /// connection's error channel.
    pub fn report_error_next(&self) -> Option<Packet> {
        let (packet, _ack) = self.pop()?;
        if let Some(link) = self.link() {
            link.error(packet.clone());
        }
        Some(packet)
    }

    /// Peer sends `packet` to us.
    pub fn deliver(&self, packet: Packet) {
        if let Some(link) = self.link() {
            link.inbound(packet);
        }
    }

    pub fn deliver_event(&self, seq: u32, event: &str, args: Vec<Value>) {
        self.deliver(Packet::data(SeqNum(seq), Payload::new(event, args)));
    }

    /// Transport-level disconnect.
    pub fn drop_connection(&self) {
        self.close();
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn request_identity(&self) -> Option<String> {
        let rx = self.identity_rx.lock().take()?;
        rx.await.ok()
    }

    fn bind(&self, link: ConnectionLink) {
        *self.link.lock() = Some(link);
    }

    fn send(&self, packet: &Packet, ack: AckHandle) -> io::Result<()> {
        if !self.is_open() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"));
        }
        let drop = self
            .loss
            .lock()
            .as_mut()
            .map(|loss| loss.should_drop(packet.seq.0));
        if drop == Some(DropDecision::Drop) {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "injected loss"));
        }
        self.history.lock().push(packet.clone());
        self.sent.lock().push_back((packet.clone(), ack));
        Ok(())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        self.identity_tx.lock().take();
        let link = self.link.lock().take();
        if let Some(link) = link {
            link.closed("transport close");
        }
    }
}

/// Admit a connection presenting `token`.
pub async fn connect(registry: &SessionRegistry, token: &str) -> (Arc<MockConnection>, Arc<VirtualSession>) {
    let conn = MockConnection::with_identity(token);
    let session = registry
        .admit(conn.clone())
        .await
        .expect("admission succeeds");
    (conn, session)
}

pub type Recorded = Arc<Mutex<Vec<Vec<Value>>>>;

/// Capture every firing of `event` on `session`.
pub fn record(session: &VirtualSession, event: &str) -> Recorded {
    let seen: Recorded = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    session.on(event, move |args: &[Value]| sink.lock().push(args.to_vec()));
    seen
}

pub fn events(packets: &[Packet]) -> Vec<String> {
    packets.iter().map(|p| p.payload.event.clone()).collect()
}
