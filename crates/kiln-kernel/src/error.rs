//! Crate-level error types for `kiln-kernel`.
//!
//! Provides a unified [`KernelError`] that composes errors from every
//! sub-module (cron, task, store, scm, protocol, config) together with
//! [`error_stack::Report`] for rich, context-carrying error propagation.

use thiserror::Error;

use crate::config::ConfigError;
use crate::cron::CronError;
use crate::message::ProtocolError;
use crate::scm::ScmError;
use crate::store::StoreError;
use crate::task::TaskError;

/// Crate-level error type for `kiln-kernel`.
///
/// Wraps each sub-module's typed error via `#[from]` so that the `?`
/// operator converts them automatically. Use
/// [`error_stack::Report<KernelError>`] (via [`KernelResult`]) to attach
/// human-readable context as the error propagates up the call stack.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KernelError {
    /// A cron spec failed to parse.
    #[error("Cron error: {0}")]
    Cron(#[from] CronError),

    /// A task-model error (corrupt stored descriptor).
    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    /// A task-store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// An SCM probe error.
    #[error("Scm error: {0}")]
    Scm(#[from] ScmError),

    /// A runner-protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A configuration error.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// A low-level I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON (de)serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An internal / untyped error described by a message string.
    #[error("{0}")]
    Internal(String),
}

/// Convenience result alias using [`error_stack::Report`].
///
/// Equivalent to `Result<T, error_stack::Report<KernelError>>`.
pub type KernelResult<T> = Result<T, error_stack::Report<KernelError>>;

#[cfg(test)]
mod tests {
    use super::*;
    use error_stack::{Report, ResultExt};

    #[test]
    fn cron_error_converts_via_from() {
        let cron_err = CronError::InvalidSpec {
            spec: "nope".into(),
            reason: "expected 5 fields, got 1".into(),
        };
        let kernel_err: KernelError = cron_err.into();

        assert!(matches!(kernel_err, KernelError::Cron(_)));
        assert!(kernel_err.to_string().contains("nope"));
    }

    #[test]
    fn store_error_converts_via_from() {
        let kernel_err: KernelError = StoreError::Busy.into();
        assert!(matches!(kernel_err, KernelError::Store(StoreError::Busy)));
    }

    #[test]
    fn serde_error_converts_via_from() {
        let serde_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let kernel_err: KernelError = serde_err.into();
        assert!(matches!(kernel_err, KernelError::Serialization(_)));
    }

    #[test]
    fn report_carries_context() {
        let result: KernelResult<()> =
            Err(Report::new(KernelError::Internal("root cause".into())))
                .attach_printable("while building the project registry");

        let report = result.unwrap_err();
        let display = format!("{report:?}");

        assert!(display.contains("root cause"));
        assert!(display.contains("while building the project registry"));
    }
}
