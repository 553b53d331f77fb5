//! Delivery verification utilities.

use std::collections::HashSet;
use std::sync::Mutex;

/// Records what the application received and checks it against emission order.
///
/// Thread-safe so it can be fed straight from event listeners.
#[derive(Default)]
pub struct OrderVerifier {
    received: Mutex<Vec<u64>>,
}

impl OrderVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one delivery
    pub fn record(&self, id: u64) {
        self.received.lock().unwrap().push(id);
    }

    pub fn received(&self) -> Vec<u64> {
        self.received.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compare the deliveries with the `expected` ids `0..expected`.
    pub fn stats(&self, expected: u64) -> VerifyStats {
        let received = self.received.lock().unwrap();
        let mut seen = HashSet::with_capacity(received.len());
        let mut duplicates = 0;
        let mut out_of_order = 0;
        let mut highest: Option<u64> = None;

        for &id in received.iter() {
            if !seen.insert(id) {
                duplicates += 1;
                continue;
            }
            if highest.is_some_and(|h| id < h) {
                out_of_order += 1;
            }
            highest = Some(highest.map_or(id, |h| h.max(id)));
        }

        let missing = (0..expected).filter(|id| !seen.contains(id)).collect();
        VerifyStats {
            delivered: received.len() as u64,
            duplicates,
            out_of_order,
            missing,
        }
    }

    /// Panic unless exactly `0..expected` arrived, once each, in order.
    pub fn assert_in_order(&self, expected: u64) {
        let received = self.received();
        let want: Vec<u64> = (0..expected).collect();
        if received != want {
            let stats = self.stats(expected);
            panic!(
                "delivery order broken: {} delivered, {} duplicates, {} out of order, missing {:?}",
                stats.delivered, stats.duplicates, stats.out_of_order, stats.missing
            );
        }
    }

    /// Panic unless every id in `0..expected` arrived exactly once, in any order.
    pub fn assert_complete(&self, expected: u64) {
        let stats = self.stats(expected);
        assert!(stats.is_clean_set(), "incomplete delivery: {:?}", stats);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyStats {
    pub delivered: u64,
    pub duplicates: u64,
    pub out_of_order: u64,
    pub missing: Vec<u64>,
}

impl VerifyStats {
    /// Every id arrived exactly once.
    pub fn is_clean_set(&self) -> bool {
        self.duplicates == 0 && self.missing.is_empty()
    }

    pub fn is_ordered(&self) -> bool {
        self.is_clean_set() && self.out_of_order == 0
    }
}
