//! Error types for Rotor
//!
//! This module defines the main error type used throughout the worker and
//! the retryable/fatal classification that drives the bus ack/redeliver
//! decision. The classification is a property of the error kind, never of
//! the step that produced it.

use thiserror::Error;

/// Result type alias for Rotor operations
pub type Result<T> = std::result::Result<T, RotorError>;

/// Errors produced while processing a message through the pipeline.
#[derive(Debug, Error)]
pub enum RotorError {
    /// The bus payload was not valid JSON or did not match the ingest shape.
    /// Poison-message policy: drop with a warning, never retry.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The config store has no enriched connection for the routing key.
    #[error("unknown connection '{0}'")]
    UnknownConnection(String),

    /// A UDF reference points at a function the config store does not know.
    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    /// A function definition lives in a different workspace than the
    /// connection referencing it. No invocation happens.
    #[error("function '{function_id}' belongs to workspace '{function_workspace}', connection is in '{connection_workspace}'")]
    WorkspaceMismatch {
        function_id: String,
        function_workspace: String,
        connection_workspace: String,
    },

    /// A function id whose prefix is neither `builtin.*` nor `udf.*`.
    #[error("unknown function type '{0}'")]
    UnknownFunctionType(String),

    /// Invalid or incomplete configuration (missing destination builtin,
    /// missing environment variable, malformed options).
    #[error("configuration error: {0}")]
    Config(String),

    /// The isolated interpreter backing a compiled UDF was torn down
    /// between invocations. Recovered inline by a single rebuild.
    #[error("sandbox disposed for function '{0}'")]
    SandboxDisposed(String),

    /// Any other failure raised by user code at runtime.
    #[error("udf '{function_id}' failed: {message}")]
    UdfRuntime { function_id: String, message: String },

    /// Transient downstream delivery failure (bulker 5xx, connection
    /// refused). The message is redelivered.
    #[error("downstream delivery failed: {0}")]
    Downstream(String),

    /// The external config store errored (as opposed to returning nil).
    #[error("config store error: {0}")]
    ConfigStore(String),

    /// The per-message deadline expired with a step still in flight.
    #[error("message deadline exceeded after {0} ms")]
    Timeout(u64),

    /// Shared KV store failure.
    #[error("kv store error: {0}")]
    Kv(String),

    /// JSON (de)serialization failure outside the ingest decode path.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl RotorError {
    /// Returns true when the failure is transient and the message should be
    /// redelivered by the bus.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RotorError::Downstream(_) | RotorError::ConfigStore(_) | RotorError::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(RotorError::Downstream("503".into()).is_retryable());
        assert!(RotorError::ConfigStore("connection refused".into()).is_retryable());
        assert!(RotorError::Timeout(30_000).is_retryable());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(!RotorError::MalformedMessage("not json".into()).is_retryable());
        assert!(!RotorError::UnknownConnection("c1".into()).is_retryable());
        assert!(!RotorError::UnknownFunction("f1".into()).is_retryable());
        assert!(!RotorError::UnknownFunctionType("x.y".into()).is_retryable());
        assert!(!RotorError::Config("no destination".into()).is_retryable());
        assert!(!RotorError::SandboxDisposed("f1".into()).is_retryable());
        assert!(!RotorError::UdfRuntime {
            function_id: "f1".into(),
            message: "boom".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_workspace_mismatch_display() {
        let err = RotorError::WorkspaceMismatch {
            function_id: "udf.f9".into(),
            function_workspace: "W2".into(),
            connection_workspace: "W1".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("udf.f9"));
        assert!(msg.contains("W2"));
        assert!(msg.contains("W1"));
    }
}
