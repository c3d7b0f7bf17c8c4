//! Tiered racing of provider attempts.
//!
//! - **Policy**: which models run, grouped into tiers with stagger delays.
//! - **Attempt table**: per-request lifecycle of every attempt.
//! - **Coordinator**: the loop that launches, judges and delivers.

mod attempt;
mod coordinator;
mod policy;

pub use attempt::{AttemptSnapshot, AttemptState};
pub use coordinator::*;
pub use policy::*;
