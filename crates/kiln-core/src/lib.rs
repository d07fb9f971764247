//! # kiln-core
//!
//! Shared primitives for the kiln task execution core.
//!
//! - **Identifiers**: Strongly-typed UUID identifiers for tenants, tasks, workers and dispatchers
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization and span constructors
//!
//! ## Crate Boundary
//!
//! `kiln-core` holds only primitives that more than one kiln crate needs.
//! Orchestration semantics live in `kiln-flow`.
//!
//! ## Example
//!
//! ```rust
//! use kiln_core::prelude::*;
//!
//! let tenant = TenantId::generate();
//! let external_id = ExternalId::generate();
//! assert_ne!(tenant.to_string(), external_id.to_string());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use kiln_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{
        DagExternalId, DispatcherId, ExternalId, StepId, TenantId, WorkerId, WorkflowId,
    };
    pub use crate::observability::{LogFormat, init_logging};
}

pub use error::{Error, Result};
pub use id::{DagExternalId, DispatcherId, ExternalId, StepId, TenantId, WorkerId, WorkflowId};
pub use observability::{LogFormat, init_logging};
