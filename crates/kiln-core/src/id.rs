//! Strongly-typed identifiers for kiln entities.
//!
//! Every externally visible identifier is a UUID wrapped in its own type so a
//! worker id can never be passed where a dispatcher id is expected. Numeric
//! task and strategy identifiers are partition-local and live in `kiln-flow`.
//!
//! # Example
//!
//! ```rust
//! use kiln_core::id::{TenantId, WorkerId};
//!
//! let tenant = TenantId::generate();
//! let worker: WorkerId = "3f2b6c1e-8d7a-4b7e-9a35-0a1f0c2d4e5f".parse().unwrap();
//!
//! // IDs are different types - this won't compile:
//! // let wrong: TenantId = worker;
//! # let _ = (tenant, worker);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a new random identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wraps an existing UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Uuid::parse_str(s).map(Self).map_err(|e| Error::InvalidId {
                    message: format!("invalid {} '{s}': {e}", $label),
                })
            }
        }
    };
}

uuid_id!(
    /// A unique identifier for a tenant.
    ///
    /// All task, run and strategy state is scoped to exactly one tenant.
    TenantId,
    "tenant ID"
);

uuid_id!(
    /// The stable, API-facing identifier of a task.
    ///
    /// Event keys for completion, failure and cancellation are derived from it.
    ExternalId,
    "task external ID"
);

uuid_id!(
    /// The stable, API-facing identifier of a DAG (workflow run).
    DagExternalId,
    "DAG external ID"
);

uuid_id!(
    /// A workflow definition identifier.
    WorkflowId,
    "workflow ID"
);

uuid_id!(
    /// A step (node within a workflow) identifier.
    StepId,
    "step ID"
);

uuid_id!(
    /// A worker process identifier.
    WorkerId,
    "worker ID"
);

uuid_id!(
    /// A dispatcher identifier. Each worker is connected to exactly one dispatcher.
    DispatcherId,
    "dispatcher ID"
);
