//! Messages exchanged over a profile connection.
//!
//! Every message carries the correlation id of the call it belongs to. A
//! caller sends exactly one [`Request`] per call and receives, in order:
//!
//! 1. zero or more [`CallbackNotification`]s,
//! 2. one `returned` [`Outcome`] for the method body,
//! 3. for calls with callback parameters, one `completed` [`Outcome`].
//!
//! Messages are tagged by `kind`:
//! ```json
//! {"kind": "request", "id": 7, "service": "notes", "method": "count", "args": ["inbox"]}
//! {"kind": "callback", "id": 7, "slot": 1, "event": "progress", "payload": 40}
//! {"kind": "returned", "id": 7, "result": 12}
//! {"kind": "completed", "id": 7, "error": {"message": "disk full", "name": "IoError"}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Correlates every message of one call on one connection.
pub type CorrelationId = u64;

/// Discriminated union of protocol messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Message {
	/// Caller to endpoint: invoke a method.
	Request(Request),
	/// Endpoint to caller: the method body finished.
	Returned(Outcome),
	/// Endpoint to caller: a callback parameter reached its terminal outcome.
	Completed(Outcome),
	/// Endpoint to caller: non-terminal callback notification.
	Callback(CallbackNotification),
}

impl Message {
	/// Correlation id of the call this message belongs to.
	pub fn id(&self) -> CorrelationId {
		match self {
			Message::Request(request) => request.id,
			Message::Returned(outcome) | Message::Completed(outcome) => outcome.id,
			Message::Callback(notification) => notification.id,
		}
	}
}

/// Method invocation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
	pub id: CorrelationId,
	/// Name of the declared cross-profile service.
	pub service: String,
	/// Method name within the service.
	pub method: String,
	/// Serialized value arguments, in declaration order, callbacks excluded.
	#[serde(default)]
	pub args: Vec<Value>,
	/// Parameter slots that are callback references.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub callbacks: Vec<u32>,
}

/// Success or failure of a method body or of a callback.
///
/// `result` and `error` are mutually exclusive; a missing result means `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
	pub id: CorrelationId,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub result: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<ErrorPayload>,
}

impl Outcome {
	pub fn success(id: CorrelationId, result: Value) -> Self {
		Self {
			id,
			result: Some(result),
			error: None,
		}
	}

	pub fn failure(id: CorrelationId, error: ErrorPayload) -> Self {
		Self { id, result: None, error: Some(error) }
	}

	pub fn into_result(self) -> Result<Value, ErrorPayload> {
		match self.error {
			Some(error) => Err(error),
			None => Ok(self.result.unwrap_or(Value::Null)),
		}
	}
}

/// Notification emitted through a callback parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackNotification {
	pub id: CorrelationId,
	/// Callback slot, as listed in [`Request::callbacks`].
	pub slot: u32,
	pub event: String,
	#[serde(default)]
	pub payload: Value,
}

/// Structured failure raised by a method in the target profile.
///
/// ```json
/// {"message": "no such note", "name": "NotFound", "stack": "..."}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
	pub message: String,
	/// Error class identity, when the target could represent it.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub stack: Option<String>,
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn request_roundtrips_with_kind_tag() {
		let json = r#"{"kind":"request","id":3,"service":"notes","method":"count","args":["inbox"],"callbacks":[1]}"#;
		let message: Message = serde_json::from_str(json).unwrap();
		match &message {
			Message::Request(request) => {
				assert_eq!(request.id, 3);
				assert_eq!(request.method, "count");
				assert_eq!(request.args, vec![json!("inbox")]);
				assert_eq!(request.callbacks, vec![1]);
			}
			other => panic!("expected request, got {other:?}"),
		}
		assert_eq!(serde_json::to_value(&message).unwrap()["kind"], "request");
	}

	#[test]
	fn returned_without_result_is_null() {
		let message: Message = serde_json::from_value(json!({"kind": "returned", "id": 9})).unwrap();
		let Message::Returned(outcome) = message else {
			panic!("expected returned");
		};
		assert_eq!(outcome.into_result().unwrap(), Value::Null);
	}

	#[test]
	fn completed_error_deserializes_payload() {
		let message: Message = serde_json::from_value(json!({
			"kind": "completed",
			"id": 4,
			"error": {"message": "disk full", "name": "IoError"}
		}))
		.unwrap();
		assert_eq!(message.id(), 4);
		let Message::Completed(outcome) = message else {
			panic!("expected completed");
		};
		let error = outcome.into_result().unwrap_err();
		assert_eq!(error.name.as_deref(), Some("IoError"));
		assert_eq!(error.message, "disk full");
	}

	#[test]
	fn callback_payload_defaults_to_null() {
		let message: Message = serde_json::from_value(json!({"kind": "callback", "id": 1, "slot": 0, "event": "tick"})).unwrap();
		assert_eq!(
			message,
			Message::Callback(CallbackNotification {
				id: 1,
				slot: 0,
				event: "tick".to_string(),
				payload: Value::Null,
			})
		);
	}
}
