//! Error types for the sandbox runner
//!
//! Every public operation returns [`RunnerResult`]. Orchestration steps wrap
//! the underlying cause with [`ResultExt::context`] so a failed `create` reads
//! as "failed to create disk: base image not found: ..." rather than a bare
//! I/O error.

use std::time::Duration;

use thiserror::Error;

use crate::vm::VmState;

/// The result of a runner operation.
pub type RunnerResult<T> = Result<T, RunnerError>;

/// An error that occurred while managing sandboxes or their host resources.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The VM is not in a state that permits the operation.
    #[error("cannot {operation} sandbox {sandbox_id}: VM is {state}")]
    InvalidState {
        sandbox_id: String,
        operation: &'static str,
        state: VmState,
    },

    /// A bounded resource pool has no free slot left.
    #[error("{0} pool exhausted")]
    PoolExhausted(&'static str),

    /// A bounded wait expired.
    #[error("timeout waiting for {what} after {after:?}")]
    Timeout { what: String, after: Duration },

    /// The hypervisor API answered with a non-2xx status.
    #[error("API error on {endpoint} (status {status}): {body}")]
    Api {
        endpoint: &'static str,
        status: u16,
        body: String,
    },

    /// A local or remote command exited unsuccessfully.
    #[error("command `{command}` failed: {output}")]
    Command { command: String, output: String },

    /// The resource already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The resource was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The sandbox has a disk on the host but no running hypervisor.
    #[error("sandbox {0} exists but needs recovery (disk found, socket missing)")]
    NeedsRecovery(String),

    /// A caller supplied an unusable argument or configuration value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An HTTP protocol error on the hypervisor socket.
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    /// A request could not be built.
    #[error("http request error: {0}")]
    HttpRequest(#[from] hyper::http::Error),

    /// A connection-level error from the pooled socket client.
    #[error("http client error: {0}")]
    HttpClient(#[from] hyper_util::client::legacy::Error),

    /// An HTTP error talking to a guest daemon.
    #[error("guest request error: {0}")]
    Request(#[from] reqwest::Error),

    /// A lower-level error annotated with what was being attempted.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<RunnerError>,
    },
}

impl RunnerError {
    /// Builds a [`RunnerError::Command`] from a command line and its output.
    pub fn command(command: impl Into<String>, output: impl Into<String>) -> Self {
        RunnerError::Command {
            command: command.into(),
            output: output.into(),
        }
    }

    /// Builds a [`RunnerError::Timeout`].
    pub fn timeout(what: impl Into<String>, after: Duration) -> Self {
        RunnerError::Timeout {
            what: what.into(),
            after,
        }
    }

    /// Returns the innermost error, skipping context wrappers.
    pub fn root(&self) -> &RunnerError {
        match self {
            RunnerError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// True when the root cause is a state violation.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self.root(), RunnerError::InvalidState { .. })
    }

    /// True when the root cause is an exhausted pool.
    pub fn is_exhausted(&self) -> bool {
        matches!(self.root(), RunnerError::PoolExhausted(_))
    }

    /// True when the root cause is an expired wait.
    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), RunnerError::Timeout { .. })
    }
}

/// Adds human-readable context to a [`RunnerResult`].
pub trait ResultExt<T> {
    /// Wraps the error with a description of the step that failed.
    fn context(self, context: impl Into<String>) -> RunnerResult<T>;

    /// Like [`ResultExt::context`], but only builds the message on error.
    fn with_context<F, S>(self, f: F) -> RunnerResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E: Into<RunnerError>> ResultExt<T> for Result<T, E> {
    fn context(self, context: impl Into<String>) -> RunnerResult<T> {
        self.map_err(|e| RunnerError::Context {
            context: context.into(),
            source: Box::new(e.into()),
        })
    }

    fn with_context<F, S>(self, f: F) -> RunnerResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| RunnerError::Context {
            context: f().into(),
            source: Box::new(e.into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_preserves_root_cause() {
        let err: RunnerResult<()> = Err(RunnerError::PoolExhausted("netns"));
        let wrapped = err.context("failed to create network namespace").unwrap_err();

        assert!(wrapped.is_exhausted());
        assert_eq!(
            wrapped.to_string(),
            "failed to create network namespace: netns pool exhausted"
        );
    }

    #[test]
    fn test_invalid_state_message() {
        let err = RunnerError::InvalidState {
            sandbox_id: "sb-1".into(),
            operation: "resize",
            state: VmState::Shutdown,
        };
        assert!(err.is_invalid_state());
        assert_eq!(err.to_string(), "cannot resize sandbox sb-1: VM is Shutdown");
    }
}
