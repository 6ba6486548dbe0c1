//! Controller-level error taxonomy.

use reverie_ipc::{IpcError, RemoteError};
use serde_json::Value;
use thiserror::Error;

/// Message carried by [`ControlError::Halted`] when no cause is given.
pub const DEFAULT_HALT_MESSAGE: &str = "Reverie Halted";

/// Everything that can go wrong while driving the worker.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The run was halted before the queue drained.
    #[error("{message}")]
    Halted { message: String },

    /// A timed wait exhausted its ceiling.
    #[error("wait timed out after {waited_ms}msec")]
    WaitTimeout { waited_ms: u64 },

    /// A selector wait exhausted the hard timeout.
    #[error("wait for {selector} timed out after {waited_ms}msec")]
    SelectorTimeout { selector: String, waited_ms: u64 },

    /// A page-side evaluation never invoked its completion path.
    #[error(
        "evaluation timed out after {elapsed_ms}msec; \
         did the evaluated function signal completion?"
    )]
    EvaluationTimeout { elapsed_ms: u64 },

    /// The worker rejected an operation with a serialized error.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The worker rejected an operation with a non-error value.
    #[error("worker rejected with value: {value}")]
    RemoteValue { value: Value },

    /// A transport-level failure (closed channel, framing).
    #[error(transparent)]
    Ipc(IpcError),

    /// The worker process could not be started.
    #[error("failed to spawn worker: {detail}")]
    Spawn { detail: String },

    /// The worker process died out from under us.
    #[error("worker died: {message}")]
    WorkerDied { message: String },

    /// The worker's runner hit an unhandled error. Fatal for the
    /// instance; the worker has already been torn down.
    #[error("fatal worker error: {message}")]
    FatalWorker {
        message: String,
        stack: Option<String>,
    },

    /// An operation was attempted on an instance that already ended.
    #[error("instance already ended")]
    Ended,

    /// A local filesystem operation failed (inject, screenshot output).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControlError {
    /// A halt with the default message.
    pub fn halted() -> Self {
        Self::Halted {
            message: DEFAULT_HALT_MESSAGE.to_string(),
        }
    }
}

impl From<IpcError> for ControlError {
    fn from(err: IpcError) -> Self {
        match err {
            IpcError::Remote(remote) => Self::Remote(remote),
            IpcError::RemoteValue { value } => Self::RemoteValue { value },
            other => Self::Ipc(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_halt_message() {
        assert_eq!(ControlError::halted().to_string(), "Reverie Halted");
    }

    #[test]
    fn remote_rejections_unwrap_from_ipc() {
        let err: ControlError = IpcError::Remote(RemoteError::from_message("nope")).into();
        assert!(matches!(err, ControlError::Remote(_)));

        let err: ControlError = IpcError::RemoteValue {
            value: Value::from(7),
        }
        .into();
        assert!(matches!(err, ControlError::RemoteValue { .. }));

        let err: ControlError = IpcError::ChannelClosed.into();
        assert!(matches!(err, ControlError::Ipc(IpcError::ChannelClosed)));
    }

    #[test]
    fn wait_timeout_names_the_bound() {
        let err = ControlError::WaitTimeout { waited_ms: 30000 };
        assert_eq!(err.to_string(), "wait timed out after 30000msec");

        let err = ControlError::SelectorTimeout {
            selector: "#login".into(),
            waited_ms: 30000,
        };
        assert_eq!(err.to_string(), "wait for #login timed out after 30000msec");
    }
}
