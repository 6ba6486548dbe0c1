//! Error types for the IPC channel, including the serialized error shape
//! that crosses the process boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

fn default_code() -> i64 {
    -1
}

/// An error that crossed the process boundary in serialized form.
///
/// Produced whenever an error-like value is sent with a call result and
/// reconstructed on the receiving side with the same fields. `code`
/// defaults to -1 when the sender omitted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct RemoteError {
    #[serde(default = "default_code")]
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl RemoteError {
    /// Build an error with just a message (code -1, no stack).
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            code: -1,
            message: message.into(),
            details: None,
            stack: None,
        }
    }
}

/// The error slot of a call result.
///
/// Error-like values (objects carrying a string `message`) are
/// reconstructed as [`RemoteError`]. Anything else passes through
/// unmodified, preserving the distinction between "failure" and
/// "successful null" -- a responder may reject with a bare string or
/// number and the caller sees exactly that value.
#[derive(Debug, Clone, PartialEq)]
pub enum CallFailure {
    /// A serialized error reconstructed with code/message/details/stack.
    Remote(RemoteError),
    /// A non-error rejection value, passed through as-is.
    Value(Value),
}

impl CallFailure {
    /// Decode the wire error slot. `Null` means success (`None`).
    pub fn from_wire(value: &Value) -> Option<Self> {
        if value.is_null() {
            return None;
        }
        if value.get("message").and_then(Value::as_str).is_some() {
            if let Ok(err) = serde_json::from_value::<RemoteError>(value.clone()) {
                return Some(Self::Remote(err));
            }
        }
        Some(Self::Value(value.clone()))
    }

    /// Encode for the wire error slot.
    pub fn to_wire(&self) -> Value {
        match self {
            Self::Remote(err) => serde_json::to_value(err).unwrap_or(Value::Null),
            Self::Value(v) => v.clone(),
        }
    }
}

/// Errors surfaced by the IPC layer.
#[derive(Debug, Error)]
pub enum IpcError {
    /// The transport closed before the call settled. The pending call is
    /// abandoned; callers pair calls with the channel's death
    /// notification rather than treating this as the call's own failure.
    #[error("ipc channel closed")]
    ChannelClosed,

    /// A message could not be serialized for sending.
    #[error("failed to encode ipc message: {0}")]
    Encode(#[source] serde_json::Error),

    /// An inbound line was not a valid `[event, ...payload]` array.
    #[error("malformed ipc message: {detail}")]
    Malformed { detail: String },

    /// The remote side rejected the call with a serialized error.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The remote side rejected the call with a non-error value.
    #[error("remote call rejected with value: {value}")]
    RemoteValue { value: Value },
}

impl From<CallFailure> for IpcError {
    fn from(failure: CallFailure) -> Self {
        match failure {
            CallFailure::Remote(err) => Self::Remote(err),
            CallFailure::Value(value) => Self::RemoteValue { value },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_round_trip_preserves_fields() {
        let err = RemoteError {
            code: -7,
            message: "navigation error".into(),
            details: Some(Value::from("Navigation timed out after 30000 ms")),
            stack: Some("Error: navigation error\n    at goto".into()),
        };
        let wire = serde_json::to_value(&err).unwrap();
        let back: RemoteError = serde_json::from_value(wire).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn missing_code_defaults_to_minus_one() {
        let wire = serde_json::json!({ "message": "boom" });
        let err: RemoteError = serde_json::from_value(wire).unwrap();
        assert_eq!(err.code, -1);
        assert_eq!(err.message, "boom");
        assert!(err.stack.is_none());
    }

    #[test]
    fn null_error_slot_means_success() {
        assert_eq!(CallFailure::from_wire(&Value::Null), None);
    }

    #[test]
    fn error_like_object_reconstructs_remote_error() {
        let wire = serde_json::json!({
            "code": -1000,
            "message": "unhandled protocol",
            "stack": "trace",
        });
        match CallFailure::from_wire(&wire) {
            Some(CallFailure::Remote(err)) => {
                assert_eq!(err.code, -1000);
                assert_eq!(err.message, "unhandled protocol");
                assert_eq!(err.stack.as_deref(), Some("trace"));
            }
            other => panic!("expected Remote, got {other:?}"),
        }
    }

    #[test]
    fn non_error_value_passes_through_unmodified() {
        let wire = Value::from("just a string rejection");
        match CallFailure::from_wire(&wire) {
            Some(CallFailure::Value(v)) => assert_eq!(v, wire),
            other => panic!("expected Value, got {other:?}"),
        }
        // Objects without a message field also pass through.
        let wire = serde_json::json!({ "status": 500 });
        assert!(matches!(
            CallFailure::from_wire(&wire),
            Some(CallFailure::Value(_))
        ));
    }

    #[test]
    fn to_wire_round_trips_both_variants() {
        let remote = CallFailure::Remote(RemoteError::from_message("oops"));
        assert_eq!(CallFailure::from_wire(&remote.to_wire()), Some(remote));

        let value = CallFailure::Value(Value::from(42));
        assert_eq!(CallFailure::from_wire(&value.to_wire()), Some(value));
    }
}
