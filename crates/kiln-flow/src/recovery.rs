//! Panic recovery for message handlers.
//!
//! A panic inside a handler must not take down the consumer loop. The panic
//! is converted into [`Error::Panic`], reported to the configured
//! [`Alerter`], and the batch is then nacked like any other failure.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;

use crate::error::{Error, Result};

/// Receives recovered panics.
pub trait Alerter: Send + Sync {
    /// Reports a recovered panic.
    fn send_alert(&self, error: &Error, context: &str);
}

/// Discards alerts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpAlerter;

impl Alerter for NoOpAlerter {
    fn send_alert(&self, _error: &Error, _context: &str) {}
}

/// Reports alerts as error-level log records.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlerter;

impl Alerter for TracingAlerter {
    fn send_alert(&self, error: &Error, context: &str) {
        tracing::error!(error = %error, context, "recovered from panic");
    }
}

/// Runs `fut`, converting a panic into [`Error::Panic`] and alerting on it.
///
/// # Errors
///
/// Returns the future's own error, or [`Error::Panic`] if it panicked.
pub async fn recover_with_alert<T, F>(
    alerter: &Arc<dyn Alerter>,
    context: &str,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let err = Error::Panic {
                message: panic_message(panic.as_ref()),
            };
            alerter.send_alert(&err, context);
            Err(err)
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
