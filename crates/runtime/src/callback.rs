//! Caller-side receivers for callback parameters.
//!
//! A callback parameter is registered against its call's correlation id before
//! the request is sent. Notifications for that id are routed to the sink until
//! the call's terminal outcome arrives, even if the caller stopped waiting for
//! the method's return value.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use xprofile_protocol::Profile;

use crate::error::Result;

/// Receiver of callback notifications and the callback's terminal outcome.
pub trait CallbackSink: Send + Sync {
	/// A non-terminal notification emitted by the target.
	fn on_event(&self, profile: Profile, event: &str, payload: Value);

	/// The terminal outcome. Called at most once per call and profile.
	fn on_complete(&self, profile: Profile, outcome: Result<Value>) {
		let _ = (profile, outcome);
	}
}

/// Event observed through a [`channel_sink`].
#[derive(Debug, Clone)]
pub enum CallbackEvent {
	Notification { profile: Profile, event: String, payload: Value },
	Completed { profile: Profile, outcome: Result<Value> },
}

impl CallbackEvent {
	pub fn profile(&self) -> Profile {
		match self {
			CallbackEvent::Notification { profile, .. } | CallbackEvent::Completed { profile, .. } => *profile,
		}
	}

	pub fn is_terminal(&self) -> bool {
		matches!(self, CallbackEvent::Completed { .. })
	}
}

struct ChannelSink {
	tx: mpsc::UnboundedSender<CallbackEvent>,
}

impl CallbackSink for ChannelSink {
	fn on_event(&self, profile: Profile, event: &str, payload: Value) {
		let _ = self.tx.send(CallbackEvent::Notification {
			profile,
			event: event.to_string(),
			payload,
		});
	}

	fn on_complete(&self, profile: Profile, outcome: Result<Value>) {
		let _ = self.tx.send(CallbackEvent::Completed { profile, outcome });
	}
}

/// Creates a sink that forwards every event into an unbounded channel.
pub fn channel_sink() -> (Arc<dyn CallbackSink>, mpsc::UnboundedReceiver<CallbackEvent>) {
	let (tx, rx) = mpsc::unbounded_channel();
	(Arc::new(ChannelSink { tx }), rx)
}

struct FnSink<F> {
	on_event: F,
}

impl<F> CallbackSink for FnSink<F>
where
	F: Fn(Profile, &str, Value) + Send + Sync,
{
	fn on_event(&self, profile: Profile, event: &str, payload: Value) {
		(self.on_event)(profile, event, payload)
	}
}

/// Wraps a closure that only cares about notifications.
pub fn sink_fn<F>(on_event: F) -> Arc<dyn CallbackSink>
where
	F: Fn(Profile, &str, Value) + Send + Sync + 'static,
{
	Arc::new(FnSink { on_event })
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	#[tokio::test]
	async fn channel_sink_forwards_in_order() {
		let (sink, mut rx) = channel_sink();
		sink.on_event(Profile::Work, "progress", Value::from(10));
		sink.on_complete(Profile::Work, Ok(Value::from("done")));

		let first = rx.recv().await.unwrap();
		assert!(!first.is_terminal());
		assert_eq!(first.profile(), Profile::Work);
		match rx.recv().await.unwrap() {
			CallbackEvent::Completed { outcome, .. } => assert_eq!(outcome.unwrap(), "done"),
			other => panic!("expected completion, got {other:?}"),
		}
	}

	#[test]
	fn sink_fn_ignores_completion() {
		let count = Arc::new(AtomicUsize::new(0));
		let seen = Arc::clone(&count);
		let sink = sink_fn(move |_, _, _| {
			seen.fetch_add(1, Ordering::SeqCst);
		});
		sink.on_event(Profile::Personal, "tick", Value::Null);
		sink.on_complete(Profile::Personal, Ok(Value::Null));
		assert_eq!(count.load(Ordering::SeqCst), 1);
	}
}
