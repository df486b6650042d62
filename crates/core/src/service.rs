//! Target-side service implementations and callback handles.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;
use xprofile_protocol::{CallbackNotification, CorrelationId, Message, Outcome, Profile};
use xprofile_runtime::{CallbackSink, Error, MethodFailure, ProfileRuntimeException};

/// A service implementation hosted in one profile.
///
/// `args` holds the call's value arguments in declaration order. `callbacks`
/// holds one handle per callback parameter, in declaration order.
#[async_trait]
pub trait ServiceImpl: Send + Sync {
	async fn invoke(&self, method: &str, args: Vec<Value>, callbacks: Vec<CallbackHandle>) -> Result<Value, MethodFailure>;
}

enum Route {
	Remote {
		id: CorrelationId,
		outbound: mpsc::UnboundedSender<Value>,
	},
	Local {
		profile: Profile,
		service: String,
		method: String,
		slots: Vec<u32>,
		sinks: Vec<Arc<dyn CallbackSink>>,
	},
}

/// Terminal state shared by every callback handle of one call.
///
/// Completes exactly once: on `complete`/`fail`, or with `null` when the last
/// reference drops. [`Completion::abandon`] marks it done without sending,
/// for remote calls whose body failed; the caller's connection then completes
/// the open sinks with that failure.
pub(crate) struct Completion {
	route: Route,
	done: AtomicBool,
}

impl Completion {
	pub(crate) fn remote(id: CorrelationId, outbound: mpsc::UnboundedSender<Value>) -> Arc<Self> {
		Arc::new(Self {
			route: Route::Remote { id, outbound },
			done: AtomicBool::new(false),
		})
	}

	pub(crate) fn local(profile: Profile, service: &str, method: &str, slots: Vec<u32>, sinks: Vec<Arc<dyn CallbackSink>>) -> Arc<Self> {
		Arc::new(Self {
			route: Route::Local {
				profile,
				service: service.to_string(),
				method: method.to_string(),
				slots,
				sinks,
			},
			done: AtomicBool::new(false),
		})
	}

	pub(crate) fn handles(self: &Arc<Self>, slots: &[u32]) -> Vec<CallbackHandle> {
		slots
			.iter()
			.map(|slot| CallbackHandle {
				slot: *slot,
				completion: Arc::clone(self),
			})
			.collect()
	}

	pub(crate) fn abandon(&self) {
		self.done.store(true, Ordering::SeqCst);
	}

	fn is_done(&self) -> bool {
		self.done.load(Ordering::SeqCst)
	}

	fn notify(&self, slot: u32, event: &str, payload: Value) {
		if self.is_done() {
			debug!(target = "xprofile.endpoint", slot, event, "notification after completion dropped");
			return;
		}
		match &self.route {
			Route::Remote { id, outbound } => {
				let message = Message::Callback(CallbackNotification {
					id: *id,
					slot,
					event: event.to_string(),
					payload,
				});
				if let Ok(value) = serde_json::to_value(&message) {
					let _ = outbound.send(value);
				}
			}
			Route::Local { profile, slots, sinks, .. } => {
				if let Some(index) = slots.iter().position(|s| *s == slot) {
					sinks[index].on_event(*profile, event, payload);
				}
			}
		}
	}

	pub(crate) fn finish(&self, outcome: Result<Value, MethodFailure>) {
		if self.done.swap(true, Ordering::SeqCst) {
			debug!(target = "xprofile.endpoint", "callback already completed");
			return;
		}
		match &self.route {
			Route::Remote { id, outbound } => {
				let outcome = match outcome {
					Ok(value) => Outcome::success(*id, value),
					Err(failure) => Outcome::failure(*id, failure.to_payload()),
				};
				if let Ok(value) = serde_json::to_value(Message::Completed(outcome)) {
					let _ = outbound.send(value);
				}
			}
			Route::Local {
				profile,
				service,
				method,
				sinks,
				..
			} => {
				let outcome = outcome.map_err(|failure| Error::RemoteInvocation(ProfileRuntimeException::new(*profile, service.as_str(), method.as_str(), failure)));
				for sink in sinks {
					sink.on_complete(*profile, outcome.clone());
				}
			}
		}
	}
}

impl Drop for Completion {
	fn drop(&mut self) {
		self.finish(Ok(Value::Null));
	}
}

/// Target-side handle to one callback parameter of a call.
///
/// Handles of the same call share a single terminal outcome: the first
/// `complete` or `fail` wins, and dropping the last handle completes with
/// `null`.
#[derive(Clone)]
pub struct CallbackHandle {
	slot: u32,
	completion: Arc<Completion>,
}

impl CallbackHandle {
	/// Parameter position of this callback in the method signature.
	pub fn slot(&self) -> u32 {
		self.slot
	}

	pub fn is_completed(&self) -> bool {
		self.completion.is_done()
	}

	/// Sends a non-terminal notification.
	pub fn notify(&self, event: &str, payload: Value) {
		self.completion.notify(self.slot, event, payload);
	}

	pub fn complete(&self, result: Value) {
		self.completion.finish(Ok(result));
	}

	pub fn fail(&self, failure: MethodFailure) {
		self.completion.finish(Err(failure));
	}
}

impl fmt::Debug for CallbackHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("CallbackHandle")
			.field("slot", &self.slot)
			.field("completed", &self.is_completed())
			.finish()
	}
}
