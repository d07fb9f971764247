//! Error types for the task execution domain.
//!
//! The variants follow the failure classes the controller has to tell apart:
//! transport failures are redelivered by the bus, storage failures abort the
//! batch, classification failures reject a single message, and partial-item
//! failures are accumulated into [`MultiError`] while the batch continues.

use std::fmt;
use std::time::Duration;

use chrono::NaiveDate;

use crate::task::{StrategyId, TaskId};

/// The result type used throughout kiln-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in task execution operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A task was not found.
    #[error("task not found: {task_id}")]
    TaskNotFound {
        /// The task ID that was not found.
        task_id: TaskId,
    },

    /// A named resource was not found.
    #[error("not found: {resource_type} with id {id}")]
    ResourceNotFound {
        /// The type of resource that was not found.
        resource_type: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// A message arrived with a kind no handler is registered for.
    #[error("unknown message kind: {kind}")]
    UnknownMessageKind {
        /// The unrecognized kind string.
        kind: String,
    },

    /// A monitoring event carried an event type that has no readable status.
    #[error("unknown event type: {event_type}")]
    UnknownEventType {
        /// The unrecognized event type string.
        event_type: String,
    },

    /// Sending to or receiving from the message bus failed.
    #[error("transport error: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// Configuration was invalid.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the invalid setting.
        message: String,
    },

    /// The strategy-scoped advisory lock could not be acquired in time.
    #[error("timed out after {timeout:?} waiting for advisory lock on strategy {strategy_id}")]
    LockTimeout {
        /// The strategy whose lock was contended.
        strategy_id: StrategyId,
        /// How long the caller waited.
        timeout: Duration,
    },

    /// A write targeted a date partition that does not exist.
    #[error("no partition of {table} covers {date}")]
    PartitionMissing {
        /// The partitioned table.
        table: String,
        /// The date the row belongs to.
        date: NaiveDate,
    },

    /// A panic was recovered while handling a batch.
    #[error("recovered from panic: {message}")]
    Panic {
        /// The panic payload rendered as text.
        message: String,
    },

    /// Several items of one batch failed independently.
    #[error("{0}")]
    Multiple(MultiError),

    /// An error from kiln-core.
    #[error("core error: {0}")]
    Core(#[from] kiln_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new transport error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new resource not found error.
    #[must_use]
    pub fn resource_not_found(resource_type: &'static str, id: impl fmt::Display) -> Self {
        Self::ResourceNotFound {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Returns true for errors that reject a message outright rather than
    /// failing transiently.
    #[must_use]
    pub const fn is_classification(&self) -> bool {
        matches!(
            self,
            Self::UnknownMessageKind { .. } | Self::UnknownEventType { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

/// A combined error for independent per-item failures within one batch.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<Error>,
}

impl MultiError {
    /// Creates an empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one failure.
    pub fn push(&mut self, err: Error) {
        self.errors.push(err);
    }

    /// Records the error of a failed result, discarding successes.
    pub fn absorb<T>(&mut self, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.push(err);
                None
            }
        }
    }

    /// Returns true if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of recorded failures.
    #[must_use]
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Returns the recorded failures.
    #[must_use]
    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// Consumes the accumulator, returning the recorded failures.
    #[must_use]
    pub fn into_errors(self) -> Vec<Error> {
        self.errors
    }

    /// Converts the accumulator into a result.
    ///
    /// A single failure is returned as-is; several are wrapped in
    /// [`Error::Multiple`].
    ///
    /// # Errors
    ///
    /// Returns an error if at least one failure was recorded.
    pub fn into_result(mut self) -> Result<()> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(Error::Multiple(self)),
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred:", self.errors.len())?;
        for err in &self.errors {
            write!(f, "\n\t* {err}")?;
        }
        Ok(())
    }
}
