//! Transmission failure plans.
//!
//! A mock transport asks a [`LossGenerator`] whether each send attempt should
//! fail. Plans are deterministic (random loss is seeded) so a failing scenario
//! replays exactly.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;

/// Decision for one send attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropDecision {
    Drop,
    Pass,
}

/// Pattern for send failures
#[derive(Debug, Clone)]
pub enum LossPattern {
    /// No loss - pass everything
    None,
    /// Fail every Nth attempt
    Periodic { every_n: usize },
    /// Fail attempts randomly with given probability (0.0-1.0)
    Random { probability: f64 },
    /// Fail the first attempt of each listed sequence id; retries pass
    FirstAttempt { sequences: HashSet<u32> },
    /// Fail every attempt of each listed sequence id
    Always { sequences: HashSet<u32> },
    /// Fail if any pattern says so
    Combined(Vec<LossPattern>),
}

/// Decides which transmissions fail.
///
/// # Example
///
/// ```
/// use kaos_test_support::loss::{DropDecision, LossGenerator};
///
/// let mut gen = LossGenerator::first_attempt([3]);
/// assert_eq!(gen.should_drop(3), DropDecision::Drop);
/// assert_eq!(gen.should_drop(3), DropDecision::Pass); // the retry
/// ```
pub struct LossGenerator {
    pattern: LossPattern,
    attempts: usize,
    dropped: usize,
    failed_once: HashSet<u32>,
    rng: StdRng,
}

impl LossGenerator {
    pub fn new(pattern: LossPattern) -> Self {
        Self::seeded(pattern, 0)
    }

    pub fn seeded(pattern: LossPattern, seed: u64) -> Self {
        Self {
            pattern,
            attempts: 0,
            dropped: 0,
            failed_once: HashSet::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Create a generator that drops nothing
    pub fn none() -> Self {
        Self::new(LossPattern::None)
    }

    /// Create a generator that fails every Nth attempt
    pub fn periodic(every_n: usize) -> Self {
        Self::new(LossPattern::Periodic { every_n })
    }

    /// Create a generator with random loss probability
    pub fn random(probability: f64, seed: u64) -> Self {
        Self::seeded(
            LossPattern::Random {
                probability: probability.clamp(0.0, 1.0),
            },
            seed,
        )
    }

    /// Create a generator that fails the first send of each listed sequence
    pub fn first_attempt(sequences: impl IntoIterator<Item = u32>) -> Self {
        Self::new(LossPattern::FirstAttempt {
            sequences: sequences.into_iter().collect(),
        })
    }

    /// Decide whether the send of `seq` should fail
    pub fn should_drop(&mut self, seq: u32) -> DropDecision {
        self.attempts += 1;
        let pattern = self.pattern.clone();
        let decision = self.check_pattern(seq, &pattern);
        if decision == DropDecision::Drop {
            self.dropped += 1;
        }
        decision
    }

    fn check_pattern(&mut self, seq: u32, pattern: &LossPattern) -> DropDecision {
        let drop = match pattern {
            LossPattern::None => false,
            LossPattern::Periodic { every_n } => *every_n > 0 && self.attempts % *every_n == 0,
            LossPattern::Random { probability } => self.rng.gen::<f64>() < *probability,
            LossPattern::FirstAttempt { sequences } => {
                sequences.contains(&seq) && self.failed_once.insert(seq)
            }
            LossPattern::Always { sequences } => sequences.contains(&seq),
            LossPattern::Combined(patterns) => {
                return patterns
                    .iter()
                    .map(|p| self.check_pattern(seq, p))
                    .fold(DropDecision::Pass, |acc, d| {
                        if d == DropDecision::Drop {
                            d
                        } else {
                            acc
                        }
                    });
            }
        };
        if drop {
            DropDecision::Drop
        } else {
            DropDecision::Pass
        }
    }

    /// Get statistics
    pub fn stats(&self) -> LossStats {
        LossStats {
            attempts: self.attempts,
            dropped: self.dropped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LossStats {
    pub attempts: usize,
    pub dropped: usize,
}
