//! Receive-side reordering for a virtual session.
//!
//! Packets from every connection of a session land in one `ReorderBuffer`.
//! In sequential mode they are held in a min-heap keyed by sequence id and
//! released only when the id in front of the heap is the next one expected, so
//! the application sees emission order regardless of which connection carried
//! each packet. Immediate mode releases on arrival and only filters duplicates.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use crate::packet::{Packet, Payload, SeqNum};

/// How far ahead of the watermark immediate mode tracks delivered ids. A packet
/// beyond it forces the watermark forward and writes off the ids it skips.
pub const IMMEDIATE_WINDOW: u32 = 4096;

/// How inbound packets are released to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Strict emission order.
    Sequential,
    /// Release on arrival; duplicates are still discarded.
    Immediate,
}

/// Outcome of pushing one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
    /// This many payloads became deliverable (possibly including earlier held ones).
    Released(usize),
    /// Held until the gap in front of it closes.
    Held,
    /// Already delivered or already held; dropped.
    Duplicate,
}

/// Heap entry ordered so the smallest sequence id sits on top.
struct Held(Packet);

impl PartialEq for Held {
    fn eq(&self, other: &Self) -> bool {
        self.0.seq == other.0.seq
    }
}

impl Eq for Held {}

impl PartialOrd for Held {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Held {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap.
        other.0.seq.serial_cmp(self.0.seq)
    }
}

pub struct ReorderBuffer {
    mode: DeliveryMode,
    next_expected: SeqNum,
    held: BinaryHeap<Held>,
    /// Sequential: ids in `held`. Immediate: ids delivered ahead of `next_expected`,
    /// all within `IMMEDIATE_WINDOW` of it.
    ahead: HashSet<SeqNum>,
    delivered: u64,
    duplicates: u64,
    skipped: u64,
}

impl ReorderBuffer {
    pub fn new(mode: DeliveryMode) -> Self {
        Self::starting_at(mode, SeqNum::ZERO)
    }

    /// Buffer whose first expected id is `next_expected`.
    pub fn starting_at(mode: DeliveryMode, next_expected: SeqNum) -> Self {
        Self {
            mode,
            next_expected,
            held: BinaryHeap::new(),
            ahead: HashSet::new(),
            delivered: 0,
            duplicates: 0,
            skipped: 0,
        }
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    pub fn next_expected(&self) -> SeqNum {
        self.next_expected
    }

    /// Packets waiting for a gap to close.
    pub fn held_len(&self) -> usize {
        self.held.len()
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    /// Ids immediate mode gave up on after they fell out of its window.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    fn is_duplicate(&self, seq: SeqNum) -> bool {
        seq.precedes(self.next_expected) || self.ahead.contains(&seq)
    }

    fn advance(&mut self) {
        self.next_expected = self.next_expected.next();
    }

    /// Slide the watermark over ids already delivered ahead of it.
    fn slide(&mut self) {
        while self.ahead.remove(&self.next_expected) {
            self.advance();
        }
    }

    /// Move the watermark up so `seq` lands inside the immediate window.
    fn force_window(&mut self, seq: SeqNum) {
        let base = SeqNum(seq.0.wrapping_sub(IMMEDIATE_WINDOW - 1));
        let gap = base.distance_from(self.next_expected) as u64;
        let before = self.ahead.len();
        self.ahead.retain(|id| !id.precedes(base));
        let passed = (before - self.ahead.len()) as u64;
        self.next_expected = base;
        self.skipped += gap - passed;
    }

    /// Accept one packet and append every payload it unblocks to `out`, in order.
    pub fn push(&mut self, packet: Packet, out: &mut Vec<Payload>) -> Accepted {
        if self.is_duplicate(packet.seq) {
            self.duplicates += 1;
            return Accepted::Duplicate;
        }

        match self.mode {
            DeliveryMode::Sequential => {
                self.ahead.insert(packet.seq);
                self.held.push(Held(packet));

                let before = out.len();
                while self
                    .held
                    .peek()
                    .is_some_and(|top| top.0.seq == self.next_expected)
                {
                    if let Some(Held(packet)) = self.held.pop() {
                        self.ahead.remove(&packet.seq);
                        self.advance();
                        out.push(packet.payload);
                    }
                }

                let released = out.len() - before;
                self.delivered += released as u64;
                if released == 0 {
                    Accepted::Held
                } else {
                    Accepted::Released(released)
                }
            }
            DeliveryMode::Immediate => {
                if packet.seq.distance_from(self.next_expected) >= IMMEDIATE_WINDOW as i32 {
                    self.force_window(packet.seq);
                }
                if packet.seq == self.next_expected {
                    self.advance();
                } else {
                    self.ahead.insert(packet.seq);
                }
                self.slide();
                out.push(packet.payload);
                self.delivered += 1;
                Accepted::Released(1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn packet(seq: u32) -> Packet {
        Packet::data(SeqNum(seq), Payload::new("n", vec![json!(seq)]))
    }

    fn seqs(out: &[Payload]) -> Vec<u64> {
        out.iter().map(|p| p.args[0].as_u64().unwrap()).collect()
    }

    #[test]
    fn in_order_delivery() {
        let mut buf = ReorderBuffer::new(DeliveryMode::Sequential);
        let mut out = Vec::new();
        for i in 0..4 {
            assert_eq!(buf.push(packet(i), &mut out), Accepted::Released(1));
        }
        assert_eq!(seqs(&out), vec![0, 1, 2, 3]);
        assert_eq!(buf.next_expected(), SeqNum(4));
    }

    #[test]
    fn out_of_order_delivery() {
        let mut buf = ReorderBuffer::new(DeliveryMode::Sequential);
        let mut out = Vec::new();
        assert_eq!(buf.push(packet(2), &mut out), Accepted::Held);
        assert_eq!(buf.push(packet(1), &mut out), Accepted::Held);
        assert_eq!(buf.held_len(), 2);
        assert_eq!(buf.push(packet(0), &mut out), Accepted::Released(3));
        assert_eq!(seqs(&out), vec![0, 1, 2]);
        assert_eq!(buf.held_len(), 0);
    }

    #[test]
    fn missing_then_fill_gap() {
        let mut buf = ReorderBuffer::new(DeliveryMode::Sequential);
        let mut out = Vec::new();
        buf.push(packet(0), &mut out);
        buf.push(packet(2), &mut out);
        assert_eq!(seqs(&out), vec![0]);
        buf.push(packet(1), &mut out);
        assert_eq!(seqs(&out), vec![0, 1, 2]);
    }

    #[test]
    fn duplicate_and_stale_are_dropped() {
        let mut buf = ReorderBuffer::new(DeliveryMode::Sequential);
        let mut out = Vec::new();
        buf.push(packet(0), &mut out);
        buf.push(packet(2), &mut out);
        assert_eq!(buf.push(packet(0), &mut out), Accepted::Duplicate); // stale
        assert_eq!(buf.push(packet(2), &mut out), Accepted::Duplicate); // already held
        buf.push(packet(1), &mut out);
        assert_eq!(seqs(&out), vec![0, 1, 2]);
        assert_eq!(buf.duplicates(), 2);
        assert_eq!(buf.delivered(), 3);
    }

    #[test]
    fn sequence_wraparound() {
        let start = u32::MAX - 2;
        let mut buf = ReorderBuffer::starting_at(DeliveryMode::Sequential, SeqNum(start));
        let mut out = Vec::new();
        // Arrival order: 1, MAX, 0, MAX-2, MAX-1
        for seq in [1, u32::MAX, 0, start, start + 1] {
            buf.push(packet(seq), &mut out);
        }
        assert_eq!(
            seqs(&out),
            vec![start as u64, (start + 1) as u64, u32::MAX as u64, 0, 1]
        );
        assert_eq!(buf.next_expected(), SeqNum(2));
        // The pre-wrap ids are now behind us.
        assert_eq!(buf.push(packet(u32::MAX), &mut out), Accepted::Duplicate);
    }

    #[test]
    fn immediate_mode_releases_on_arrival() {
        let mut buf = ReorderBuffer::new(DeliveryMode::Immediate);
        let mut out = Vec::new();
        assert_eq!(buf.push(packet(2), &mut out), Accepted::Released(1));
        assert_eq!(buf.push(packet(0), &mut out), Accepted::Released(1));
        assert_eq!(buf.push(packet(1), &mut out), Accepted::Released(1));
        assert_eq!(seqs(&out), vec![2, 0, 1]);
        assert_eq!(buf.next_expected(), SeqNum(3));
    }

    #[test]
    fn immediate_mode_still_drops_duplicates() {
        let mut buf = ReorderBuffer::new(DeliveryMode::Immediate);
        let mut out = Vec::new();
        buf.push(packet(3), &mut out);
        assert_eq!(buf.push(packet(3), &mut out), Accepted::Duplicate);
        buf.push(packet(0), &mut out);
        assert_eq!(buf.push(packet(0), &mut out), Accepted::Duplicate);
        assert_eq!(seqs(&out), vec![3, 0]);
    }

    #[test]
    fn immediate_mode_bounds_state_behind_a_lost_packet() {
        let mut buf = ReorderBuffer::new(DeliveryMode::Immediate);
        let mut out = Vec::new();
        // Seq 0 never arrives.
        for seq in 1..=100_000 {
            assert_eq!(buf.push(packet(seq), &mut out), Accepted::Released(1));
            assert!(buf.ahead.len() < IMMEDIATE_WINDOW as usize);
        }
        assert_eq!(out.len(), 100_000);
        assert_eq!(buf.next_expected(), SeqNum(100_001));
        assert!(buf.ahead.is_empty());
        assert_eq!(buf.skipped(), 1);

        // Written off, and the ids behind the watermark stay duplicates.
        assert_eq!(buf.push(packet(0), &mut out), Accepted::Duplicate);
        assert_eq!(buf.push(packet(99_999), &mut out), Accepted::Duplicate);
        assert_eq!(buf.push(packet(100_001), &mut out), Accepted::Released(1));
    }

    #[test]
    fn immediate_window_keeps_ids_inside_it() {
        let mut buf = ReorderBuffer::new(DeliveryMode::Immediate);
        let mut out = Vec::new();
        buf.push(packet(5), &mut out);
        buf.push(packet(IMMEDIATE_WINDOW + 2), &mut out);
        // Base moved to 3: ids 0..3 written off, 5 still remembered.
        assert_eq!(buf.next_expected(), SeqNum(3));
        assert_eq!(buf.skipped(), 3);
        assert_eq!(buf.push(packet(5), &mut out), Accepted::Duplicate);
        assert_eq!(buf.push(packet(1), &mut out), Accepted::Duplicate);
        assert_eq!(buf.push(packet(3), &mut out), Accepted::Released(1));
        assert_eq!(buf.push(packet(4), &mut out), Accepted::Released(1));
        assert_eq!(buf.next_expected(), SeqNum(6));
    }
}
