//! Send-side packet scheduling.
//!
//! The scheduler owns the outbound and retry queues of one session and the
//! partition of its connections into an idle pool and an in-flight map. Each
//! connection carries at most one unacknowledged packet; retries always go
//! before ordinary traffic. It deals in [`ConnectionId`]s only, the session
//! maps them back to live connections.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::packet::{Packet, Payload, SeqNum};
use crate::transport::ConnectionId;

/// Caller-supplied completion callback, run with the peer's ack arguments.
pub type AckCallback = Box<dyn FnOnce(&[Value]) + Send + 'static>;

/// A queued packet and its completion callback.
pub struct Outbound {
    pub packet: Packet,
    pub on_ack: Option<AckCallback>,
    pub attempts: u32,
}

impl Outbound {
    fn new(packet: Packet, on_ack: Option<AckCallback>) -> Self {
        Self {
            packet,
            on_ack,
            attempts: 0,
        }
    }

    fn into_retry(mut self) -> Self {
        self.packet = self.packet.into_retry();
        self.attempts += 1;
        self
    }
}

impl fmt::Debug for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outbound")
            .field("packet", &self.packet)
            .field("on_ack", &self.on_ack.is_some())
            .field("attempts", &self.attempts)
            .finish()
    }
}

struct InFlight {
    item: Outbound,
    token: u64,
    sent_at: Instant,
}

/// One packet assigned to one connection by [`Scheduler::dispatch`].
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub conn: ConnectionId,
    /// Identifies this transmission; acks carrying another token are stale.
    pub token: u64,
    pub packet: Packet,
}

/// What happened to a connection's in-flight packet when it was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// Not tracked by the scheduler.
    Unknown,
    /// Was idle.
    Idle,
    /// In-flight packet moved to the retry queue.
    Requeued(SeqNum),
    /// In-flight packet discarded.
    Dropped(SeqNum),
}

pub struct Scheduler {
    next_seq: SeqNum,
    outbound: VecDeque<Outbound>,
    retries: VecDeque<Outbound>,
    idle: VecDeque<ConnectionId>,
    in_flight: HashMap<ConnectionId, InFlight>,
    next_token: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::starting_at(SeqNum::ZERO)
    }

    /// Scheduler whose first packet gets `first`.
    pub fn starting_at(first: SeqNum) -> Self {
        Self {
            next_seq: first,
            outbound: VecDeque::with_capacity(64),
            retries: VecDeque::new(),
            idle: VecDeque::new(),
            in_flight: HashMap::new(),
            next_token: 0,
        }
    }

    /// Id the next enqueued packet will get.
    pub fn next_seq(&self) -> SeqNum {
        self.next_seq
    }

    /// Wrap `payload` into a data packet with a fresh sequence id and queue it.
    pub fn enqueue(&mut self, payload: Payload, on_ack: Option<AckCallback>) -> SeqNum {
        let seq = self.next_seq;
        self.next_seq = seq.next();
        self.outbound
            .push_back(Outbound::new(Packet::data(seq, payload), on_ack));
        seq
    }

    /// Put a newly attached connection in the idle pool.
    pub fn add_connection(&mut self, conn: ConnectionId) -> bool {
        if self.is_tracked(conn) {
            return false;
        }
        self.idle.push_back(conn);
        true
    }

    pub fn is_tracked(&self, conn: ConnectionId) -> bool {
        self.in_flight.contains_key(&conn) || self.idle.contains(&conn)
    }

    fn has_work(&self) -> bool {
        !self.retries.is_empty() || !self.outbound.is_empty()
    }

    /// Pair idle connections with queued packets, retries first.
    pub fn dispatch(&mut self, now: Instant) -> Vec<Dispatch> {
        let mut out = Vec::new();
        while self.has_work() {
            let Some(conn) = self.idle.pop_front() else {
                break;
            };
            let Some(item) = self.retries.pop_front().or_else(|| self.outbound.pop_front()) else {
                self.idle.push_front(conn);
                break;
            };
            let token = self.next_token;
            self.next_token = self.next_token.wrapping_add(1);
            out.push(Dispatch {
                conn,
                token,
                packet: item.packet.clone(),
            });
            self.in_flight.insert(
                conn,
                InFlight {
                    item,
                    token,
                    sent_at: now,
                },
            );
        }
        out
    }

    fn take_in_flight(&mut self, conn: ConnectionId, token: u64) -> Option<Outbound> {
        match self.in_flight.get(&conn) {
            Some(f) if f.token == token => self.in_flight.remove(&conn).map(|f| f.item),
            _ => None,
        }
    }

    /// Peer acknowledged the dispatch `token` on `conn`: free the connection and
    /// hand back the completed packet. Stale tokens return `None`.
    pub fn acknowledge(&mut self, conn: ConnectionId, token: u64) -> Option<Outbound> {
        let item = self.take_in_flight(conn, token)?;
        self.idle.push_back(conn);
        Some(item)
    }

    /// The dispatch `token` on `conn` failed: retry its packet first and return
    /// the connection to the idle pool.
    pub fn fail(&mut self, conn: ConnectionId, token: u64) -> Option<Packet> {
        let item = self.take_in_flight(conn, token)?;
        let packet = item.packet.clone();
        self.retries.push_back(item.into_retry());
        self.idle.push_back(conn);
        Some(packet)
    }

    /// Transport reported `packet` as failed on `conn`. If it is the packet in
    /// flight there the dispatch is failed as a whole; otherwise the reported
    /// packet is queued for retry on its own.
    pub fn report_error(&mut self, conn: ConnectionId, packet: Packet) -> Packet {
        let token = self
            .in_flight
            .get(&conn)
            .filter(|f| f.item.packet.seq == packet.seq)
            .map(|f| f.token);
        if let Some(failed) = token.and_then(|token| self.fail(conn, token)) {
            return failed;
        }
        self.retries
            .push_back(Outbound::new(packet.clone().into_retry(), None));
        packet
    }

    /// Forget `conn`. Its in-flight packet is retried when `requeue` is set.
    pub fn remove_connection(&mut self, conn: ConnectionId, requeue: bool) -> Removal {
        if let Some(pos) = self.idle.iter().position(|c| *c == conn) {
            self.idle.remove(pos);
            return Removal::Idle;
        }
        match self.in_flight.remove(&conn) {
            Some(f) => {
                let seq = f.item.packet.seq;
                if requeue {
                    self.retries.push_back(f.item.into_retry());
                    Removal::Requeued(seq)
                } else {
                    Removal::Dropped(seq)
                }
            }
            None => Removal::Unknown,
        }
    }

    /// Reclaim connections whose packet has waited longer than `timeout` for an
    /// ack. Their packets are retried; late acks for them are ignored.
    pub fn reclaim_expired(&mut self, now: Instant, timeout: Duration) -> Vec<(ConnectionId, SeqNum)> {
        let expired: Vec<(ConnectionId, u64)> = self
            .in_flight
            .iter()
            .filter(|(_, f)| now.saturating_duration_since(f.sent_at) >= timeout)
            .map(|(conn, f)| (*conn, f.token))
            .collect();

        expired
            .into_iter()
            .filter_map(|(conn, token)| self.fail(conn, token).map(|p| (conn, p.seq)))
            .collect()
    }

    /// Drop every queued and in-flight packet and forget all connections.
    /// Returns the number of packets discarded.
    pub fn clear(&mut self) -> usize {
        let dropped = self.outbound.len() + self.retries.len() + self.in_flight.len();
        self.outbound.clear();
        self.retries.clear();
        self.in_flight.clear();
        self.idle.clear();
        dropped
    }

    pub fn idle_len(&self) -> usize {
        self.idle.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn queued_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn retry_len(&self) -> usize {
        self.retries.len()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
