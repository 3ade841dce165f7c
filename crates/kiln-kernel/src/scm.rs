//! SCM probe contract.
//!
//! A probe answers one question per project: "is the upstream ahead of our
//! last known state?" — and when it is, produces the task that builds it.
//! The kernel only defines the contract; the git implementation lives in
//! `kiln-core`. Variants are closed: new SCM kinds are added as new
//! implementations, not runtime-registered plugins.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::task::Task;

/// A probe failure. Probes degrade softly — an unreachable remote is *not*
/// an error but a `None` check result — so anything surfacing here is worth
/// a warning, and the project is skipped for the current pass.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ScmError {
    #[error("scm failure: {0}")]
    Failure(String),

    #[error("scm i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-project upstream watcher.
#[async_trait]
pub trait ScmProbe: Send + Sync {
    /// The SCM configuration descriptor, forwarded verbatim to runners so
    /// they can fetch the sources themselves.
    fn descriptor(&self) -> &Value;

    /// Fetch from the upstream and return a new task iff the local view of
    /// the upstream changed since the previous call on this probe.
    ///
    /// Returns `Ok(None)` when the remote is unreachable, when the fetch
    /// brought nothing new, or when the transfer ended incomplete.
    async fn check(&self) -> Result<Option<Task>, ScmError>;
}
