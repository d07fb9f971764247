//! # kiln-flow
//!
//! The execution core of the kiln task orchestrator.
//!
//! This crate implements the three subsystems that move task attempts
//! through their lifecycle and keep readers informed:
//!
//! - **Task Lifecycle Controller**: Consumes batched lifecycle messages,
//!   mutates attempts and emits follow-on events ([`controller`])
//! - **Concurrency Manager**: Enforces per-step concurrency strategies, one
//!   manager per tenant and strategy ([`concurrency`])
//! - **Status Reconciliation**: Folds the append-only event log into the
//!   monotonic status read APIs serve ([`olap`])
//!
//! ## Core Concepts
//!
//! - **Attempt**: One execution of a task, identified by
//!   `(task id, retry count)`. Every mutation is keyed by the attempt and is
//!   a no-op for stale attempts.
//! - **Message Bus**: At-least-once queues the subsystems talk through
//!   ([`msgqueue`])
//! - **Repositories**: Transactional persistence contracts with in-memory
//!   implementations ([`repository`], [`olap::memory`])
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use kiln_core::TenantId;
//! use kiln_flow::prelude::*;
//! use kiln_flow::msgqueue::memory::InMemoryMessageQueue;
//! use kiln_flow::tasktypes::{trigger_task_message, TriggerTaskPayload};
//! use kiln_flow::workflow::{StepDefinition, WorkflowDefinition};
//!
//! # async fn run() -> Result<()> {
//! let store = Arc::new(InMemoryRepository::new());
//! let tenant = TenantId::generate();
//! store.register_tenant(tenant, Some("partition-1".into()))?;
//! store.register_workflow(
//!     tenant,
//!     WorkflowDefinition::new("ingest").with_step(StepDefinition::new("load", "default")),
//! )?;
//!
//! let mq = Arc::new(InMemoryMessageQueue::new());
//! let controller = Arc::new(TasksController::new(
//!     mq.clone(),
//!     Repositories::in_memory(&store),
//!     FlowConfig::default(),
//! ));
//! let handle = controller.start().await?;
//!
//! let msg = trigger_task_message(
//!     tenant,
//!     &[TriggerTaskPayload::new("ingest", serde_json::json!({}))],
//! )?;
//! mq.send_message(&QueueType::TaskProcessing, msg).await?;
//!
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod concurrency;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod metrics;
pub mod msgqueue;
pub mod olap;
pub mod recovery;
pub mod repository;
pub mod service;
pub mod task;
pub mod tasktypes;
pub mod workflow;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::concurrency::{ConcurrencyManager, ConcurrencySupervisor};
    pub use crate::config::FlowConfig;
    pub use crate::controller::TasksController;
    pub use crate::error::{Error, MultiError, Result};
    pub use crate::metrics::FlowMetrics;
    pub use crate::msgqueue::{Message, MessageKind, MessageQueue, QueueType};
    pub use crate::olap::controller::OlapController;
    pub use crate::olap::{OlapRepository, ReadableStatus};
    pub use crate::recovery::{Alerter, NoOpAlerter, TracingAlerter};
    pub use crate::repository::{InMemoryRepository, Repositories};
    pub use crate::service::ServiceHandle;
    pub use crate::task::{Task, TaskIdRetryCount, TaskState};
}
