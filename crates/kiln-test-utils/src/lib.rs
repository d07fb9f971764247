//! Shared test utilities for kiln integration tests.
//!
//! This crate provides:
//! - [`FlowHarness`]: An in-memory store, bus and tasks controller wired for one tenant
//! - [`WorkflowFactory`]: Workflow definitions for common scenarios
//! - Assertion helpers over published messages and task state
//! - [`FaultyMessageQueue`]: A recording bus that fails sends to chosen queues
//!
//! # Example
//!
//! ```rust,ignore
//! use kiln_test_utils::{FlowHarness, WorkflowFactory};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let harness = FlowHarness::new().await;
//!     harness.register(WorkflowFactory::single_step("w"));
//!     let tasks = harness.trigger("w", serde_json::json!({})).await;
//!     // ... run test ...
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod assertions;
pub mod fixtures;
pub mod queue;

pub use assertions::*;
pub use fixtures::*;
pub use queue::FaultyMessageQueue;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("kiln_flow=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
