//! Chaos utilities - reordering and duplication of deliveries.
//!
//! Every monkey is seeded so a failing run can be replayed.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

/// What happens to one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChaosEvent {
    /// Deliver twice
    Duplicate,
    /// Swap with the next delivery
    Reorder,
    /// Drop on the floor; the sender retries elsewhere
    Drop,
    /// Pass through
    None,
}

/// Chaos monkey for shuffling what a set of connections delivers.
///
/// # Example
///
/// ```
/// use kaos_test_support::chaos::ChaosMonkey;
///
/// let mut monkey = ChaosMonkey::seeded(7).with_reorder_probability(0.5);
/// let lanes = vec![vec![0, 2, 4], vec![1, 3, 5]];
/// let arrivals = monkey.interleave(lanes);
/// assert_eq!(arrivals.len(), 6);
/// ```
pub struct ChaosMonkey {
    duplicate_probability: f64,
    reorder_probability: f64,
    drop_probability: f64,
    rng: StdRng,
    events_triggered: usize,
}

impl Default for ChaosMonkey {
    fn default() -> Self {
        Self::seeded(0)
    }
}

impl ChaosMonkey {
    pub fn seeded(seed: u64) -> Self {
        Self {
            duplicate_probability: 0.0,
            reorder_probability: 0.0,
            drop_probability: 0.0,
            rng: StdRng::seed_from_u64(seed),
            events_triggered: 0,
        }
    }

    /// Heavy reordering with some duplicates, for stress runs
    pub fn aggressive(seed: u64) -> Self {
        Self::seeded(seed)
            .with_reorder_probability(0.3)
            .with_duplicate_probability(0.05)
    }

    pub fn with_duplicate_probability(mut self, prob: f64) -> Self {
        self.duplicate_probability = prob.clamp(0.0, 1.0);
        self
    }

    pub fn with_reorder_probability(mut self, prob: f64) -> Self {
        self.reorder_probability = prob.clamp(0.0, 1.0);
        self
    }

    pub fn with_drop_probability(mut self, prob: f64) -> Self {
        self.drop_probability = prob.clamp(0.0, 1.0);
        self
    }

    /// Decide what happens to the next delivery
    pub fn decide(&mut self) -> ChaosEvent {
        let roll = self.rng.gen::<f64>();
        let mut threshold = 0.0;

        threshold += self.duplicate_probability;
        if roll < threshold {
            self.events_triggered += 1;
            return ChaosEvent::Duplicate;
        }

        threshold += self.reorder_probability;
        if roll < threshold {
            self.events_triggered += 1;
            return ChaosEvent::Reorder;
        }

        threshold += self.drop_probability;
        if roll < threshold {
            self.events_triggered += 1;
            return ChaosEvent::Drop;
        }

        ChaosEvent::None
    }

    /// Apply duplicate and reorder decisions to a delivery stream. Drops are
    /// left to the caller, which knows how to retry.
    pub fn scramble<T: Clone>(&mut self, items: Vec<T>) -> Vec<T> {
        let mut out: Vec<T> = Vec::with_capacity(items.len());
        let mut held: Option<T> = None;
        for item in items {
            let event = self.decide();
            if event == ChaosEvent::Reorder && held.is_none() {
                held = Some(item);
                continue;
            }
            if event == ChaosEvent::Duplicate {
                out.push(item.clone());
            }
            out.push(item);
            // A held item goes out right after the one that overtook it.
            if let Some(late) = held.take() {
                out.push(late);
            }
        }
        out.extend(held);
        out
    }

    /// Merge per-connection lanes into one arrival order. Each lane keeps its
    /// own FIFO order; which lane delivers next is random.
    pub fn interleave<T>(&mut self, lanes: Vec<Vec<T>>) -> Vec<T> {
        let total = lanes.iter().map(Vec::len).sum();
        let mut lanes: Vec<std::vec::IntoIter<T>> = lanes.into_iter().map(Vec::into_iter).collect();
        let mut out = Vec::with_capacity(total);
        while out.len() < total {
            let live: Vec<usize> = (0..lanes.len()).filter(|i| !lanes[*i].as_slice().is_empty()).collect();
            let Some(&lane) = live.choose(&mut self.rng) else {
                break;
            };
            if let Some(item) = lanes[lane].next() {
                out.push(item);
            }
        }
        out
    }

    /// Uniform shuffle, for the worst case.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        items.shuffle(&mut self.rng);
        self.events_triggered += 1;
    }

    /// Pick one of `n` lanes
    pub fn pick(&mut self, n: usize) -> usize {
        self.rng.gen_range(0..n.max(1))
    }

    /// Get number of chaos events triggered
    pub fn events_triggered(&self) -> usize {
        self.events_triggered
    }
}
