//! Sequence ids, event payloads and packets.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sequence id in the wrapping `u32` space.
///
/// Ids are compared with serial-number arithmetic, so `SeqNum(0)` follows
/// `SeqNum(u32::MAX)`. Comparisons only make sense between ids less than half
/// the space apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeqNum(pub u32);

impl SeqNum {
    pub const ZERO: SeqNum = SeqNum(0);
    pub const MAX: SeqNum = SeqNum(u32::MAX);

    /// The id after this one, wrapping to zero.
    #[inline]
    pub fn next(self) -> Self {
        SeqNum(self.0.wrapping_add(1))
    }

    /// Signed distance from `base` to `self`.
    #[inline]
    pub fn distance_from(self, base: SeqNum) -> i32 {
        self.0.wrapping_sub(base.0) as i32
    }

    #[inline]
    pub fn serial_cmp(self, other: SeqNum) -> Ordering {
        self.distance_from(other).cmp(&0)
    }

    /// True if `self` comes before `other`.
    #[inline]
    pub fn precedes(self, other: SeqNum) -> bool {
        self.distance_from(other) < 0
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SeqNum {
    fn from(v: u32) -> Self {
        SeqNum(v)
    }
}

/// Event name plus arguments, as handed to application listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub event: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl Payload {
    pub fn new(event: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            event: event.into(),
            args,
        }
    }

    /// `message` event, the target of `send`/`write`.
    pub fn message(args: Vec<Value>) -> Self {
        Self::new("message", args)
    }

    /// Event name followed by the arguments, the shape `error` listeners receive.
    pub fn to_values(&self) -> Vec<Value> {
        let mut values = Vec::with_capacity(self.args.len() + 1);
        values.push(Value::String(self.event.clone()));
        values.extend(self.args.iter().cloned());
        values
    }
}

/// Packet kind. Error packets are retries of sends that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketKind {
    Data,
    Error,
}

/// Unit of transmission between the two ends of a virtual session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub seq: SeqNum,
    pub kind: PacketKind,
    pub payload: Payload,
}

impl Packet {
    pub fn data(seq: SeqNum, payload: Payload) -> Self {
        Self {
            seq,
            kind: PacketKind::Data,
            payload,
        }
    }

    /// Same packet, marked for priority retry. The sequence id is kept.
    pub fn into_retry(mut self) -> Self {
        self.kind = PacketKind::Error;
        self
    }

    pub fn is_retry(&self) -> bool {
        self.kind == PacketKind::Error
    }
}
