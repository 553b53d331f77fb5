//! Rooms and broadcast fan-out.
//!
//! A [`RoomAdapter`] tracks which sessions are in which rooms and fans a payload
//! out to them. [`MemoryAdapter`] keeps everything in process; a clustered
//! deployment would plug in an adapter backed by a shared bus.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde_json::Value;

use crate::error::{Result, VSessionError};
use crate::events::is_reserved;
use crate::identity::SessionIdentity;
use crate::packet::Payload;
use crate::registry::SessionTable;
use crate::session::VirtualSession;

/// Target selection for a broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastOptions {
    /// Union of these rooms; empty means every session in the namespace.
    pub rooms: Vec<String>,
    pub except: Vec<SessionIdentity>,
}

/// Room membership and fan-out for one namespace.
pub trait RoomAdapter: Send + Sync {
    fn add(&self, id: &SessionIdentity, room: &str) -> Result<()>;

    fn del(&self, id: &SessionIdentity, room: &str) -> Result<()>;

    /// Remove `id` from every room.
    fn del_all(&self, id: &SessionIdentity);

    /// Send `payload` to every selected session. Returns how many accepted it.
    fn broadcast(&self, payload: &Payload, opts: &BroadcastOptions) -> Result<usize>;

    fn clients(&self, room: &str) -> Vec<SessionIdentity>;
}

/// In-process room adapter
pub struct MemoryAdapter {
    sessions: Weak<SessionTable>,
    rooms: DashMap<String, HashSet<SessionIdentity>>,
    memberships: DashMap<SessionIdentity, HashSet<String>>,
}

impl MemoryAdapter {
    pub fn new(sessions: Weak<SessionTable>) -> Self {
        Self {
            sessions,
            rooms: DashMap::new(),
            memberships: DashMap::new(),
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    fn leave_room(&self, id: &SessionIdentity, room: &str) {
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(id);
        }
        self.rooms.remove_if(room, |_, members| members.is_empty());
    }

    fn targets(&self, opts: &BroadcastOptions, table: &SessionTable) -> Vec<SessionIdentity> {
        let mut targets: Vec<SessionIdentity> = if opts.rooms.is_empty() {
            table.iter().map(|entry| entry.key().clone()).collect()
        } else {
            let mut seen = HashSet::new();
            for room in &opts.rooms {
                if let Some(members) = self.rooms.get(room) {
                    seen.extend(members.iter().cloned());
                }
            }
            seen.into_iter().collect()
        };
        targets.retain(|id| !opts.except.contains(id));
        targets
    }
}

impl RoomAdapter for MemoryAdapter {
    fn add(&self, id: &SessionIdentity, room: &str) -> Result<()> {
        if room.is_empty() {
            return Err(VSessionError::room("room name must not be empty"));
        }
        self.rooms.entry(room.to_string()).or_default().insert(id.clone());
        self.memberships
            .entry(id.clone())
            .or_default()
            .insert(room.to_string());
        Ok(())
    }

    fn del(&self, id: &SessionIdentity, room: &str) -> Result<()> {
        self.leave_room(id, room);
        if let Some(mut rooms) = self.memberships.get_mut(id) {
            rooms.remove(room);
        }
        self.memberships.remove_if(id, |_, rooms| rooms.is_empty());
        Ok(())
    }

    fn del_all(&self, id: &SessionIdentity) {
        if let Some((_, rooms)) = self.memberships.remove(id) {
            for room in &rooms {
                self.leave_room(id, room);
            }
        }
    }

    fn broadcast(&self, payload: &Payload, opts: &BroadcastOptions) -> Result<usize> {
        let Some(table) = self.sessions.upgrade() else {
            return Ok(0);
        };
        // Resolve every target before emitting; no map guard is held while a
        // session runs its send path.
        let sessions: Vec<Arc<VirtualSession>> = self
            .targets(opts, &table)
            .iter()
            .filter_map(|id| table.get(id).map(|entry| entry.value().clone()))
            .collect();

        Ok(sessions
            .iter()
            .filter(|session| session.push_outbound(payload.clone(), None).is_ok())
            .count())
    }

    fn clients(&self, room: &str) -> Vec<SessionIdentity> {
        self.rooms
            .get(room)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Room-targeted emitter returned by `to()` / `broadcast()`.
///
/// Acknowledgment callbacks cannot be used with a broadcast; every target acks
/// independently.
#[derive(Clone)]
pub struct BroadcastOperator {
    adapter: Arc<dyn RoomAdapter>,
    opts: BroadcastOptions,
    reserved: &'static [&'static str],
}

impl BroadcastOperator {
    pub(crate) fn new(adapter: Arc<dyn RoomAdapter>, opts: BroadcastOptions, reserved: &'static [&'static str]) -> Self {
        Self {
            adapter,
            opts,
            reserved,
        }
    }

    pub fn to(mut self, room: impl Into<String>) -> Self {
        let room = room.into();
        if !self.opts.rooms.contains(&room) {
            self.opts.rooms.push(room);
        }
        self
    }

    /// Alias of [`to`](Self::to).
    pub fn in_room(self, room: impl Into<String>) -> Self {
        self.to(room)
    }

    pub fn except(mut self, id: SessionIdentity) -> Self {
        if !self.opts.except.contains(&id) {
            self.opts.except.push(id);
        }
        self
    }

    pub fn options(&self) -> &BroadcastOptions {
        &self.opts
    }

    pub fn emit(&self, event: &str, args: Vec<Value>) -> Result<usize> {
        if is_reserved(self.reserved, event) {
            return Err(VSessionError::reserved(event));
        }
        self.adapter.broadcast(&Payload::new(event, args), &self.opts)
    }

    /// Always fails with [`VSessionError::CallbackOnBroadcast`].
    pub fn emit_with_ack<F>(&self, _event: &str, _args: Vec<Value>, _on_ack: F) -> Result<usize>
    where
        F: FnOnce(&[Value]) + Send + 'static,
    {
        Err(VSessionError::CallbackOnBroadcast)
    }

    pub fn send(&self, args: Vec<Value>) -> Result<usize> {
        self.emit("message", args)
    }

    pub fn write(&self, args: Vec<Value>) -> Result<usize> {
        self.send(args)
    }
}
