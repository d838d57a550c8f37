//! Error taxonomy for the aggregation and routing core.
//!
//! Each failure domain gets its own enum: framing/IO on a single channel
//! ([`TransportError`]), a single in-flight request ([`CallError`]), the
//! routing surface ([`RouterError`]), configuration records ([`ConfigError`]),
//! and scheduled-task bookkeeping ([`SchedulerError`]).
//!
//! Transport and call errors from one backend never unwind past its
//! connection; they degrade that connection and surface to `route()` callers
//! as typed [`RouterError`] values. Policy and unknown-tool rejections are
//! deterministic and never retried.

use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

/// Errors on a single transport channel: framing and IO.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The underlying stream or process has closed; the channel is finished.
    #[error("channel closed")]
    Closed,

    /// An IO failure on the underlying stream.
    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),

    /// A frame could not be produced or accepted: truncated stream,
    /// oversized line, or bytes that cannot form a complete frame.
    #[error("malformed frame: {reason}")]
    MalformedFrame {
        /// Human-readable description of the framing failure.
        reason: String,
    },
}

/// Errors for a single correlated request on a downstream connection.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// No response frame arrived within the caller's deadline. The pending
    /// slot is released before this is returned; a late response is dropped.
    #[error("call to {method:?} timed out after {timeout:?}")]
    Timeout {
        /// The method that was invoked.
        method: String,
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// The connection left `Ready` (or closed outright) before a response
    /// arrived, or was never available within the deadline.
    #[error("connection lost before a response arrived")]
    ConnectionLost,

    /// The backend answered with a JSON-RPC error object. The correlation
    /// succeeded; the failure is the backend's own.
    #[error("backend error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code reported by the backend.
        code: i64,
        /// JSON-RPC error message reported by the backend.
        message: String,
    },
}

/// Errors surfaced to callers of the routing path.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// The requested name is absent from the live aggregate. Returned before
    /// any downstream dispatch occurs.
    #[error("unknown tool: {name}")]
    UnknownTool {
        /// The name that failed to resolve.
        name: String,
    },

    /// The call was rejected by policy. Deterministic; never retried.
    #[error("denied by policy: {reason}")]
    PolicyDenied {
        /// Why the policy engine rejected the call.
        reason: String,
    },

    /// The downstream dispatch failed.
    #[error(transparent)]
    Call(#[from] CallError),
}

/// Errors validating or loading downstream server configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A STDIO server entry has no command to spawn.
    #[error("stdio server {name:?} requires a non-empty command")]
    MissingCommand {
        /// The offending server's name.
        name: String,
    },

    /// An SSE/HTTP server entry has no URL to connect to.
    #[error("remote server {name:?} requires a non-empty url")]
    MissingUrl {
        /// The offending server's name.
        name: String,
    },

    /// Two server entries share a uuid.
    #[error("duplicate server uuid {uuid} ({first:?} and {second:?})")]
    DuplicateUuid {
        /// The shared uuid.
        uuid: Uuid,
        /// Name of the first entry carrying it.
        first: String,
        /// Name of the second entry carrying it.
        second: String,
    },

    /// The configuration file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        /// The path that was read.
        path: PathBuf,
        /// The underlying IO error.
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for the expected shape.
    #[error("failed to parse {}: {reason}", path.display())]
    Parse {
        /// The path that was parsed.
        path: PathBuf,
        /// Human-readable description of the parse failure.
        reason: String,
    },

    /// Startup configuration names no downstream servers at all. The only
    /// fatal condition in the core; everything else degrades.
    #[error("no downstream servers configured")]
    NoServers,
}

/// Errors managing scheduled tasks.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The cron expression could not be parsed.
    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidCron {
        /// The rejected expression.
        expr: String,
        /// Parser diagnostic.
        reason: String,
    },

    /// No task with the given uuid exists.
    #[error("unknown scheduled task {uuid}")]
    UnknownTask {
        /// The uuid that failed to resolve.
        uuid: Uuid,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display_names_method() {
        let err = CallError::Timeout {
            method: "tools/call".to_string(),
            timeout: Duration::from_secs(30),
        };
        let msg = err.to_string();
        assert!(msg.contains("tools/call"), "got: {msg}");
        assert!(msg.contains("30"), "got: {msg}");
    }

    #[test]
    fn test_router_error_wraps_call_error() {
        let err: RouterError = CallError::ConnectionLost.into();
        assert!(matches!(err, RouterError::Call(CallError::ConnectionLost)));
    }

    #[test]
    fn test_config_error_missing_command() {
        let err = ConfigError::MissingCommand {
            name: "fs".to_string(),
        };
        assert!(err.to_string().contains("fs"));
    }
}
