//! Per-step concurrency enforcement.
//!
//! [`strategy`] holds the pure admission policies. A [`ConcurrencyManager`]
//! runs one strategy for one tenant on a tick, and the
//! [`ConcurrencySupervisor`] owns the managers of a scheduler partition and
//! publishes their decisions.

pub mod manager;
pub mod strategy;
pub mod supervisor;

pub use manager::{ConcurrencyManager, ConcurrencyResults};
pub use strategy::{SlotCandidate, StrategyAction, StrategyDecision, evaluate, fold_decisions};
pub use supervisor::ConcurrencySupervisor;
