//! Test harness for session delivery.
//!
//! - [`chaos`]: seeded reordering and duplication of deliveries across lanes
//! - [`loss`]: deterministic plans for which transmissions fail
//! - [`verify`]: order, gap and duplicate checks on what the application saw

pub mod chaos;
pub mod loss;
pub mod verify;

pub use chaos::{ChaosEvent, ChaosMonkey};
pub use loss::{DropDecision, LossGenerator, LossPattern};
pub use verify::{OrderVerifier, VerifyStats};
