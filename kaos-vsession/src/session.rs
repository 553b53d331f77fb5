//! Virtual session: one logical channel over many physical connections.
//!
//! All mutable state of a session sits behind a single mutex. Connection I/O
//! and application callbacks never run under it: state changes queue
//! notifications in an ordered outbox, and whichever caller finds the outbox
//! idle drains it after releasing the lock. Events therefore reach listeners in
//! reorder-buffer order even when several connections deliver concurrently or a
//! listener emits from inside its callback.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;

use crate::config::SessionConfig;
use crate::error::{Result, VSessionError};
use crate::events::{is_reserved, Listeners, SESSION_RESERVED};
use crate::identity::SessionIdentity;
use crate::packet::{Packet, Payload, SeqNum};
use crate::registry::SessionTable;
use crate::reorder::{Accepted, ReorderBuffer};
use crate::room::{BroadcastOperator, BroadcastOptions, RoomAdapter};
use crate::scheduler::{AckCallback, Dispatch, Removal, Scheduler};
use crate::transport::{AckHandle, Connection, ConnectionId, ConnectionLink};

#[cfg(feature = "metrics")]
use crate::metrics::Metrics;

/// Reason attached to the `disconnect` event after [`VirtualSession::disconnect`].
pub const SERVER_DISCONNECT: &str = "server disconnect";
/// Reason used when a connection is dropped after a failed send.
pub const TRANSPORT_ERROR: &str = "transport error";

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Disconnected,
}

/// Point-in-time view of a session's queues and counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub state: SessionState,
    pub connections: usize,
    pub idle: usize,
    pub in_flight: usize,
    pub queued: usize,
    pub retry_queued: usize,
    pub buffered_inbound: usize,
    pub next_outbound: SeqNum,
    pub next_expected: SeqNum,
    pub delivered: u64,
    pub duplicates: u64,
    pub rooms: usize,
}

/// Everything a namespace shares with its sessions.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub namespace: String,
    pub config: SessionConfig,
    pub adapter: Arc<dyn RoomAdapter>,
    pub table: Weak<SessionTable>,
    #[cfg(feature = "metrics")]
    pub metrics: Option<Metrics>,
}

impl SessionContext {
    /// Context with no registry behind it.
    #[cfg(test)]
    pub(crate) fn detached(config: SessionConfig) -> Arc<Self> {
        use crate::room::MemoryAdapter;

        Arc::new(Self {
            namespace: "/".into(),
            config,
            adapter: Arc::new(MemoryAdapter::new(Weak::new())),
            table: Weak::new(),
            #[cfg(feature = "metrics")]
            metrics: None,
        })
    }
}

enum Notice {
    Event(Payload),
    Error(Payload),
    Disconnect(String),
    Acked { callback: AckCallback, args: Vec<Value> },
}

type Outgoing = (Arc<dyn Connection>, Dispatch);

struct Inner {
    state: SessionState,
    connections: HashMap<ConnectionId, Arc<dyn Connection>>,
    scheduler: Scheduler,
    reorder: ReorderBuffer,
    rooms: BTreeSet<String>,
    outbox: VecDeque<Notice>,
    draining: bool,
    /// The registry raised `connect` for this session.
    announced: bool,
    /// `disconnect()` is tearing the session down.
    closing: bool,
}

impl Inner {
    fn is_closed(&self) -> bool {
        self.closing || self.state == SessionState::Disconnected
    }

    /// Run the dispatch loop and pair each dispatch with its connection.
    fn collect_sends(&mut self) -> Vec<Outgoing> {
        if self.closing {
            return Vec::new();
        }
        let dispatches = self.scheduler.dispatch(Instant::now());
        let mut sends = Vec::with_capacity(dispatches.len());
        for d in dispatches {
            if let Some(conn) = self.connections.get(&d.conn) {
                sends.push((conn.clone(), d));
            }
        }
        sends
    }

    /// Move to `Disconnected` and discard all send state.
    fn end(&mut self, reason: &str) -> usize {
        self.state = SessionState::Disconnected;
        self.rooms.clear();
        self.outbox.push_back(Notice::Disconnect(reason.to_string()));
        self.scheduler.clear()
    }
}

pub struct VirtualSession {
    identity: SessionIdentity,
    ctx: Arc<SessionContext>,
    inner: Mutex<Inner>,
    listeners: Listeners<[Value]>,
    me: Weak<VirtualSession>,
}

impl VirtualSession {
    pub(crate) fn new(identity: SessionIdentity, ctx: Arc<SessionContext>) -> Arc<Self> {
        let mode = ctx.config.delivery_mode();
        Arc::new_cyclic(|me| Self {
            identity,
            inner: Mutex::new(Inner {
                state: SessionState::Active,
                connections: HashMap::new(),
                scheduler: Scheduler::new(),
                reorder: ReorderBuffer::new(mode),
                rooms: BTreeSet::new(),
                outbox: VecDeque::new(),
                draining: false,
                announced: false,
                closing: false,
            }),
            listeners: Listeners::new(),
            me: me.clone(),
            ctx,
        })
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub fn namespace(&self) -> &str {
        &self.ctx.namespace
    }

    pub fn config(&self) -> &SessionConfig {
        &self.ctx.config
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.inner.lock().connections.keys().copied().collect()
    }

    pub fn rooms(&self) -> Vec<String> {
        self.inner.lock().rooms.iter().cloned().collect()
    }

    pub fn stats(&self) -> SessionStats {
        let inner = self.inner.lock();
        SessionStats {
            state: inner.state,
            connections: inner.connections.len(),
            idle: inner.scheduler.idle_len(),
            in_flight: inner.scheduler.in_flight_len(),
            queued: inner.scheduler.queued_len(),
            retry_queued: inner.scheduler.retry_len(),
            buffered_inbound: inner.reorder.held_len(),
            next_outbound: inner.scheduler.next_seq(),
            next_expected: inner.reorder.next_expected(),
            delivered: inner.reorder.delivered(),
            duplicates: inner.reorder.duplicates(),
            rooms: inner.rooms.len(),
        }
    }

    /// Register a listener for an application event, or for `error` /
    /// `disconnect`.
    pub fn on<F>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        self.listeners.on(event, handler);
    }

    pub fn off(&self, event: &str) -> usize {
        self.listeners.off(event)
    }

    /// Queue an event for the peer. Returns its sequence id.
    pub fn emit(&self, event: &str, args: Vec<Value>) -> Result<SeqNum> {
        if is_reserved(SESSION_RESERVED, event) {
            return Err(VSessionError::reserved(event));
        }
        self.push_outbound(Payload::new(event, args), None)
    }

    /// Like [`emit`](Self::emit); `on_ack` runs with the peer's reply arguments
    /// once the packet is acknowledged.
    pub fn emit_with_ack<F>(&self, event: &str, args: Vec<Value>, on_ack: F) -> Result<SeqNum>
    where
        F: FnOnce(&[Value]) + Send + 'static,
    {
        if is_reserved(SESSION_RESERVED, event) {
            return Err(VSessionError::reserved(event));
        }
        self.push_outbound(Payload::new(event, args), Some(Box::new(on_ack)))
    }

    /// Emit a `message` event.
    pub fn send(&self, args: Vec<Value>) -> Result<SeqNum> {
        self.push_outbound(Payload::message(args), None)
    }

    pub fn write(&self, args: Vec<Value>) -> Result<SeqNum> {
        self.send(args)
    }

    pub(crate) fn push_outbound(&self, payload: Payload, on_ack: Option<AckCallback>) -> Result<SeqNum> {
        let (seq, sends) = {
            let mut inner = self.inner.lock();
            if inner.is_closed() {
                return Err(VSessionError::session_closed(self.identity.as_str()));
            }
            let seq = inner.scheduler.enqueue(payload, on_ack);
            (seq, inner.collect_sends())
        };
        self.transmit(sends);
        Ok(seq)
    }

    /// Broadcast to `room`, excluding this session.
    pub fn to(&self, room: impl Into<String>) -> BroadcastOperator {
        self.broadcast().to(room)
    }

    /// Alias of [`to`](Self::to).
    pub fn in_room(&self, room: impl Into<String>) -> BroadcastOperator {
        self.to(room)
    }

    /// Broadcast to every other session of the namespace.
    pub fn broadcast(&self) -> BroadcastOperator {
        let opts = BroadcastOptions {
            rooms: Vec::new(),
            except: vec![self.identity.clone()],
        };
        BroadcastOperator::new(self.ctx.adapter.clone(), opts, SESSION_RESERVED)
    }

    fn transmit(&self, sends: Vec<Outgoing>) {
        for (conn, d) in sends {
            record!(self.ctx.metrics, packets_dispatched.inc());
            let ack = AckHandle::new(self.me.clone(), d.conn, d.token, d.packet.seq);
            if let Err(err) = conn.send(&d.packet, ack) {
                self.abandon_connection(d.conn, d.token, err);
            }
        }
    }

    /// A send failed synchronously: retry its packet and drop the connection.
    fn abandon_connection(&self, conn: ConnectionId, token: u64, _err: io::Error) {
        let handle = {
            let mut inner = self.inner.lock();
            let survivors = inner.connections.keys().any(|id| *id != conn);
            if let Some(failed) = inner.scheduler.fail(conn, token) {
                trace_warn!(
                    "Send of seq {} failed on connection {} for session {}: {}",
                    failed.seq, conn, self.identity, _err
                );
                // Losing the last connection surfaces as `disconnect` alone.
                if survivors {
                    record!(self.ctx.metrics, packets_retried.inc());
                    inner.outbox.push_back(Notice::Error(failed.payload));
                }
            }
            inner.connections.get(&conn).cloned()
        };

        self.detach(conn, TRANSPORT_ERROR);
        if let Some(handle) = handle {
            handle.close();
        }
    }

    pub(crate) fn on_ack(&self, conn: ConnectionId, token: u64, args: Vec<Value>) {
        let sends = {
            let mut inner = self.inner.lock();
            let Some(done) = inner.scheduler.acknowledge(conn, token) else {
                trace_debug!("Ignoring stale ack on connection {} for session {}", conn, self.identity);
                return;
            };
            if let Some(callback) = done.on_ack {
                inner.outbox.push_back(Notice::Acked { callback, args });
            }
            inner.collect_sends()
        };
        self.transmit(sends);
        self.drain_outbox();
    }

    pub(crate) fn on_ack_failure(&self, conn: ConnectionId, token: u64) {
        let sends = {
            let mut inner = self.inner.lock();
            let Some(failed) = inner.scheduler.fail(conn, token) else {
                return;
            };
            trace_debug!("Retrying seq {} from connection {} for session {}", failed.seq, conn, self.identity);
            inner.outbox.push_back(Notice::Error(failed.payload));
            inner.collect_sends()
        };
        record!(self.ctx.metrics, packets_retried.inc());
        self.transmit(sends);
        self.drain_outbox();
    }

    pub(crate) fn on_transport_error(&self, conn: ConnectionId, packet: Packet) {
        let sends = {
            let mut inner = self.inner.lock();
            if inner.is_closed() || !inner.connections.contains_key(&conn) {
                return;
            }
            let failed = inner.scheduler.report_error(conn, packet);
            trace_debug!("Transport error for seq {} on connection {} ({})", failed.seq, conn, self.identity);
            inner.outbox.push_back(Notice::Error(failed.payload));
            inner.collect_sends()
        };
        record!(self.ctx.metrics, packets_retried.inc());
        self.transmit(sends);
        self.drain_outbox();
    }

    pub(crate) fn on_inbound(&self, conn: ConnectionId, packet: Packet) {
        {
            let mut inner = self.inner.lock();
            if inner.is_closed() || !inner.connections.contains_key(&conn) {
                return;
            }
            let _seq = packet.seq;
            let mut released = Vec::new();
            match inner.reorder.push(packet, &mut released) {
                Accepted::Duplicate => {
                    trace_debug!("Dropping duplicate seq {} for session {}", _seq, self.identity);
                    record!(self.ctx.metrics, duplicates_dropped.inc());
                }
                Accepted::Held => {}
                Accepted::Released(_n) => {
                    record!(self.ctx.metrics, packets_delivered.inc_by(_n as u64));
                }
            }
            inner.outbox.extend(released.into_iter().map(Notice::Event));
        }
        self.drain_outbox();
    }

    /// Bind a physical connection to this session and let it serve queued
    /// packets. A connection beyond the configured cap is closed and rejected.
    pub fn attach(&self, conn: Arc<dyn Connection>) -> Result<()> {
        let id = conn.id();
        let max = self.ctx.config.max_connections_per_session;
        let sends = {
            let mut inner = self.inner.lock();
            if inner.is_closed() {
                return Err(VSessionError::session_closed(self.identity.as_str()));
            }
            if inner.connections.contains_key(&id) {
                return Ok(());
            }
            if inner.connections.len() >= max {
                drop(inner);
                trace_warn!("Rejecting connection {} for session {}: {} connections attached", id, self.identity, max);
                record!(self.ctx.metrics, admissions_rejected.inc());
                conn.close();
                return Err(VSessionError::admission_rejected(self.identity.as_str(), max));
            }
            inner.connections.insert(id, conn.clone());
            inner.scheduler.add_connection(id);
            inner.collect_sends()
        };

        conn.bind(ConnectionLink::new(self.me.clone(), id));
        trace_debug!("Connection {} attached to session {}", id, self.identity);
        record!(self.ctx.metrics, connections_attached.inc());

        self.transmit(sends);
        // Closed before the link was in place; its close went unobserved.
        if !conn.is_open() {
            self.detach(id, "transport close");
        }
        Ok(())
    }

    /// Remove a connection. The last detach ends the session: it deregisters,
    /// releases its rooms and raises `disconnect` with `reason`.
    pub fn detach(&self, conn: ConnectionId, reason: &str) -> bool {
        let (sends, ended) = {
            let mut inner = self.inner.lock();
            if inner.connections.remove(&conn).is_none() {
                return false;
            }
            let requeue = self.ctx.config.requeue_on_detach && !inner.closing;
            match inner.scheduler.remove_connection(conn, requeue) {
                Removal::Requeued(_seq) => {
                    trace_debug!("Requeued seq {} from detached connection {}", _seq, conn);
                    record!(self.ctx.metrics, packets_retried.inc());
                }
                Removal::Dropped(_seq) => {
                    trace_warn!("Dropped seq {} in flight on detached connection {}", _seq, conn);
                }
                Removal::Idle | Removal::Unknown => {}
            }

            if inner.connections.is_empty() {
                let _dropped = inner.end(reason);
                trace_debug!("Session {} discarded {} unsent packets", self.identity, _dropped);
                (Vec::new(), Some(inner.announced))
            } else {
                (inner.collect_sends(), None)
            }
        };
        record!(self.ctx.metrics, connections_attached.dec());
        trace_debug!("Connection {} detached from session {}: {}", conn, self.identity, reason);

        if let Some(announced) = ended {
            self.release(reason, announced);
        }
        self.transmit(sends);
        self.drain_outbox();
        true
    }

    /// Detach and close every attached connection.
    /// In-flight packets are dropped rather than moved to sibling connections
    /// that are about to close.
    pub fn disconnect(&self) {
        let conns: Vec<(ConnectionId, Arc<dyn Connection>)> = {
            let mut inner = self.inner.lock();
            inner.closing = true;
            inner
                .connections
                .iter()
                .map(|(id, conn)| (*id, conn.clone()))
                .collect()
        };
        for (id, conn) in conns {
            self.detach(id, SERVER_DISCONNECT);
            conn.close();
        }
    }

    fn release(&self, _reason: &str, announced: bool) {
        self.deregister();
        trace_info!("Session {} disconnected: {}", self.identity, _reason);
        record!(self.ctx.metrics, disconnects.inc());
        if announced {
            record!(self.ctx.metrics, sessions_active.dec());
        }
    }

    fn deregister(&self) {
        self.ctx.adapter.del_all(&self.identity);
        if let Some(table) = self.ctx.table.upgrade() {
            table.remove_if(&self.identity, |_, current| std::ptr::eq(Arc::as_ptr(current), self));
        }
    }

    /// Record that the registry announced this session. False if it already
    /// ended, in which case it must not be announced.
    pub(crate) fn mark_announced(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.is_closed() {
            return false;
        }
        inner.announced = true;
        record!(self.ctx.metrics, sessions_active.inc());
        true
    }

    /// End a session that never got a connection, without raising `disconnect`.
    pub(crate) fn discard(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Disconnected {
                return;
            }
            inner.state = SessionState::Disconnected;
            inner.rooms.clear();
            inner.scheduler.clear();
        }
        trace_debug!("Discarding unattached session {}", self.identity);
        self.deregister();
    }

    /// Retry packets whose ack is overdue. Returns how many were reclaimed.
    pub fn reclaim_expired(&self, timeout: Duration) -> usize {
        let (count, sends) = {
            let mut inner = self.inner.lock();
            if inner.is_closed() {
                return 0;
            }
            let expired = inner.scheduler.reclaim_expired(Instant::now(), timeout);
            for (_conn, _seq) in &expired {
                trace_warn!("Ack timeout for seq {} on connection {} ({})", _seq, _conn, self.identity);
            }
            (expired.len(), inner.collect_sends())
        };
        if count > 0 {
            record!(self.ctx.metrics, ack_timeouts.inc_by(count as u64));
        }
        self.transmit(sends);
        count
    }

    pub fn join(&self, room: impl Into<String>) -> Result<()> {
        let room = room.into();
        {
            let inner = self.inner.lock();
            if inner.is_closed() {
                return Err(VSessionError::session_closed(self.identity.as_str()));
            }
            if inner.rooms.contains(&room) {
                return Ok(());
            }
        }
        self.ctx.adapter.add(&self.identity, &room)?;

        let mut inner = self.inner.lock();
        if inner.is_closed() {
            // Disconnected while the adapter call ran.
            drop(inner);
            self.ctx.adapter.del(&self.identity, &room)?;
            return Err(VSessionError::session_closed(self.identity.as_str()));
        }
        inner.rooms.insert(room);
        Ok(())
    }

    pub fn leave(&self, room: &str) -> Result<()> {
        self.ctx.adapter.del(&self.identity, room)?;
        self.inner.lock().rooms.remove(room);
        Ok(())
    }

    pub fn leave_all(&self) {
        self.ctx.adapter.del_all(&self.identity);
        self.inner.lock().rooms.clear();
    }

    fn drain_outbox(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.draining || inner.outbox.is_empty() {
                return;
            }
            inner.draining = true;
        }
        loop {
            let notice = {
                let mut inner = self.inner.lock();
                match inner.outbox.pop_front() {
                    Some(notice) => notice,
                    None => {
                        inner.draining = false;
                        return;
                    }
                }
            };
            self.deliver(notice);
        }
    }

    fn deliver(&self, notice: Notice) {
        match notice {
            Notice::Event(payload) => {
                self.listeners.fire(&payload.event, payload.args.as_slice());
            }
            Notice::Error(payload) => {
                self.listeners.fire("error", &payload.to_values());
            }
            Notice::Disconnect(reason) => {
                self.listeners.fire("disconnect", &[Value::String(reason)]);
            }
            Notice::Acked { callback, args } => callback(args.as_slice()),
        }
    }
}

impl std::fmt::Debug for VirtualSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualSession")
            .field("identity", &self.identity)
            .field("namespace", &self.ctx.namespace)
            .field("stats", &self.stats())
            .finish()
    }
}
