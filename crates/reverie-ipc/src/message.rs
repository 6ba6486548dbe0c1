//! Wire message model for the controller/worker channel.
//!
//! Every message is one JSON array per line: `[eventName, ...payload]`.
//! Three event names are reserved for the call protocol:
//!
//! - `CALL` -- `[CALL, id, name, ...args]` opens a named call.
//! - `CALL_DATA_<id>` -- zero or more progress notifications for a call.
//! - `CALL_RESULT_<id>` -- `[CALL_RESULT_<id>, errOrNull, ...results]`,
//!   exactly one per call, ever.
//!
//! Anything else is a free-form named event (`ready`, `log`, `die`,
//! `uncaughtException`, and rendering-host passthrough events).

use serde_json::Value;

use crate::error::IpcError;

/// Event name that opens a call.
pub const EVENT_CALL: &str = "CALL";
/// Prefix for per-call progress events.
pub const CALL_DATA_PREFIX: &str = "CALL_DATA_";
/// Prefix for per-call result events.
pub const CALL_RESULT_PREFIX: &str = "CALL_RESULT_";

/// One framed message: an event name plus its positional payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// The event name (first array element).
    pub event: String,
    /// The remaining array elements, in order.
    pub payload: Vec<Value>,
}

impl Message {
    /// Create a message with an arbitrary event name.
    pub fn new(event: impl Into<String>, payload: Vec<Value>) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }

    /// Build a `[CALL, id, name, ...args]` message.
    pub fn call(id: u64, name: &str, args: Vec<Value>) -> Self {
        let mut payload = Vec::with_capacity(args.len() + 2);
        payload.push(Value::from(id));
        payload.push(Value::from(name));
        payload.extend(args);
        Self::new(EVENT_CALL, payload)
    }

    /// Build a `[CALL_DATA_<id>, ...payload]` progress message.
    pub fn call_data(id: u64, payload: Vec<Value>) -> Self {
        Self::new(format!("{CALL_DATA_PREFIX}{id}"), payload)
    }

    /// Build a `[CALL_RESULT_<id>, errOrNull, ...results]` message.
    ///
    /// `err` is `Value::Null` for success; the serialized error otherwise.
    pub fn call_result(id: u64, err: Value, results: Vec<Value>) -> Self {
        let mut payload = Vec::with_capacity(results.len() + 1);
        payload.push(err);
        payload.extend(results);
        Self::new(format!("{CALL_RESULT_PREFIX}{id}"), payload)
    }

    /// Encode to a single JSON-array line (no trailing newline).
    pub fn encode(&self) -> Result<String, IpcError> {
        let mut array = Vec::with_capacity(self.payload.len() + 1);
        array.push(Value::from(self.event.as_str()));
        array.extend(self.payload.iter().cloned());
        serde_json::to_string(&array).map_err(IpcError::Encode)
    }

    /// Decode one line into a message.
    ///
    /// The line must be a JSON array whose first element is a string.
    pub fn decode(line: &str) -> Result<Self, IpcError> {
        let array: Vec<Value> = serde_json::from_str(line).map_err(|e| IpcError::Malformed {
            detail: format!("not a JSON array: {e}"),
        })?;
        let mut iter = array.into_iter();
        let event = match iter.next() {
            Some(Value::String(s)) => s,
            Some(other) => {
                return Err(IpcError::Malformed {
                    detail: format!("event name is not a string: {other}"),
                })
            }
            None => {
                return Err(IpcError::Malformed {
                    detail: "empty message array".into(),
                })
            }
        };
        Ok(Self {
            event,
            payload: iter.collect(),
        })
    }

    /// Interpret this message as a `CALL`, yielding `(id, name, args)`.
    pub fn as_call(&self) -> Option<(u64, &str, &[Value])> {
        if self.event != EVENT_CALL {
            return None;
        }
        let id = self.payload.first()?.as_u64()?;
        let name = self.payload.get(1)?.as_str()?;
        Some((id, name, self.payload.get(2..).unwrap_or(&[])))
    }

    /// The call id if this is a `CALL_DATA_<id>` message.
    pub fn call_data_id(&self) -> Option<u64> {
        self.event.strip_prefix(CALL_DATA_PREFIX)?.parse().ok()
    }

    /// The call id if this is a `CALL_RESULT_<id>` message.
    pub fn call_result_id(&self) -> Option<u64> {
        self.event.strip_prefix(CALL_RESULT_PREFIX)?.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_message_shape() {
        let msg = Message::call(7, "goto", vec![Value::from("https://example.com")]);
        assert_eq!(msg.event, "CALL");
        assert_eq!(msg.payload[0], 7);
        assert_eq!(msg.payload[1], "goto");
        assert_eq!(msg.payload[2], "https://example.com");
    }

    #[test]
    fn encode_decode_round_trip() {
        let msg = Message::call(3, "size", vec![Value::from(1024), Value::from(768)]);
        let line = msg.encode().unwrap();
        let back = Message::decode(&line).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn as_call_extracts_parts() {
        let msg = Message::call(12, "cookie.get", vec![serde_json::json!({"name": "sid"})]);
        let (id, name, args) = msg.as_call().unwrap();
        assert_eq!(id, 12);
        assert_eq!(name, "cookie.get");
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn as_call_rejects_other_events() {
        let msg = Message::new("ready", vec![]);
        assert!(msg.as_call().is_none());
    }

    #[test]
    fn call_data_id_parsed_from_event_name() {
        let msg = Message::call_data(42, vec![Value::from("chunk")]);
        assert_eq!(msg.event, "CALL_DATA_42");
        assert_eq!(msg.call_data_id(), Some(42));
        assert_eq!(msg.call_result_id(), None);
    }

    #[test]
    fn call_result_carries_error_slot_first() {
        let msg = Message::call_result(9, Value::Null, vec![Value::from(true)]);
        assert_eq!(msg.event, "CALL_RESULT_9");
        assert_eq!(msg.payload[0], Value::Null);
        assert_eq!(msg.payload[1], true);
        assert_eq!(msg.call_result_id(), Some(9));
    }

    #[test]
    fn decode_rejects_non_array() {
        assert!(Message::decode("{\"event\": \"x\"}").is_err());
    }

    #[test]
    fn decode_rejects_empty_array() {
        assert!(Message::decode("[]").is_err());
    }

    #[test]
    fn decode_rejects_numeric_event_name() {
        assert!(Message::decode("[42, \"payload\"]").is_err());
    }

    #[test]
    fn free_form_event_round_trip() {
        let msg = Message::new("did-finish-load", vec![serde_json::json!({})]);
        let line = msg.encode().unwrap();
        assert_eq!(Message::decode(&line).unwrap(), msg);
    }
}
