//! Target-side request serving.
//!
//! A [`ServiceEndpoint`] lives in the profile that hosts the services. It
//! reads requests from a transport, runs each one in its own task so calls
//! pipeline by correlation id, and writes every outgoing message through a
//! single writer so per-call ordering holds: notifications are sent before the
//! completion that follows them.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use xprofile_protocol::{ErrorPayload, Message, Outcome, Profile, Request};
use xprofile_runtime::{MethodFailure, Result, TransportParts};

use crate::service::{Completion, ServiceImpl};

/// Services hosted in one profile, served over any number of transports.
pub struct ServiceEndpoint {
	profile: Profile,
	services: RwLock<HashMap<String, Arc<dyn ServiceImpl>>>,
}

impl ServiceEndpoint {
	pub fn new(profile: Profile) -> Arc<Self> {
		Arc::new(Self {
			profile,
			services: RwLock::new(HashMap::new()),
		})
	}

	pub fn profile(&self) -> Profile {
		self.profile
	}

	/// Registers `service` under `name`, replacing any previous registration.
	pub fn register(&self, name: impl Into<String>, service: Arc<dyn ServiceImpl>) {
		self.services.write().insert(name.into(), service);
	}

	pub fn is_registered(&self, name: &str) -> bool {
		self.services.read().contains_key(name)
	}

	fn service(&self, name: &str) -> Option<Arc<dyn ServiceImpl>> {
		self.services.read().get(name).cloned()
	}

	/// Serves one connection until the caller closes it or the link is severed.
	///
	/// Requests still running when the inbound stream ends are allowed to
	/// finish; the sending half is closed after their last message.
	pub async fn serve(self: Arc<Self>, parts: TransportParts) -> Result<()> {
		let TransportParts {
			mut sender,
			receiver,
			mut message_rx,
		} = parts;
		let profile = self.profile;

		let transport_handle = tokio::spawn(async move {
			if let Err(err) = receiver.run().await {
				error!(target = "xprofile.endpoint", %profile, error = %err, "transport error");
			}
		});

		let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Value>();
		let writer = tokio::spawn(async move {
			while let Some(message) = outbound_rx.recv().await {
				if let Err(err) = sender.send(message).await {
					warn!(target = "xprofile.endpoint", %profile, error = %err, "failed to write message");
					break;
				}
			}
			if let Err(err) = sender.close().await {
				debug!(target = "xprofile.endpoint", %profile, error = %err, "close failed");
			}
		});

		while let Some(message_value) = message_rx.recv().await {
			match serde_json::from_value::<Message>(message_value) {
				Ok(Message::Request(request)) => {
					let endpoint = Arc::clone(&self);
					let outbound = outbound_tx.clone();
					tokio::spawn(async move { endpoint.handle(request, outbound).await });
				}
				Ok(other) => {
					warn!(target = "xprofile.endpoint", %profile, id = other.id(), "ignoring non-request message");
				}
				Err(err) => {
					error!(target = "xprofile.endpoint", %profile, error = %err, "failed to parse message");
				}
			}
		}

		debug!(target = "xprofile.endpoint", %profile, "inbound stream ended");
		drop(outbound_tx);
		let _ = writer.await;
		let _ = transport_handle.await;
		Ok(())
	}

	async fn handle(&self, request: Request, outbound: mpsc::UnboundedSender<Value>) {
		let Request {
			id,
			service,
			method,
			args,
			callbacks,
		} = request;
		debug!(target = "xprofile.endpoint", profile = %self.profile, id, %service, %method, "request");

		let Some(target) = self.service(&service) else {
			warn!(target = "xprofile.endpoint", profile = %self.profile, %service, "service not registered");
			let payload = ErrorPayload {
				message: format!("no implementation of service '{service}' is registered in profile {}", self.profile),
				name: Some("ServiceNotRegistered".to_string()),
				stack: None,
			};
			send(&outbound, Message::Returned(Outcome::failure(id, payload)));
			return;
		};

		let completion = (!callbacks.is_empty()).then(|| Completion::remote(id, outbound.clone()));
		let handles = completion.as_ref().map(|c| c.handles(&callbacks)).unwrap_or_default();

		let outcome = match AssertUnwindSafe(target.invoke(&method, args, handles)).catch_unwind().await {
			Ok(outcome) => outcome,
			Err(panic) => {
				let failure = MethodFailure::panicked(panic);
				error!(target = "xprofile.endpoint", profile = %self.profile, id, %service, %method, %failure, "target method panicked");
				Err(failure)
			}
		};

		let message = match outcome {
			Ok(value) => Message::Returned(Outcome::success(id, value)),
			Err(failure) => {
				if let Some(completion) = &completion {
					completion.abandon();
				}
				debug!(target = "xprofile.endpoint", profile = %self.profile, id, %failure, "method failed");
				Message::Returned(Outcome::failure(id, failure.to_payload()))
			}
		};
		send(&outbound, message);
		drop(completion);
	}
}

fn send(outbound: &mpsc::UnboundedSender<Value>, message: Message) {
	match serde_json::to_value(&message) {
		Ok(value) => {
			let _ = outbound.send(value);
		}
		Err(err) => error!(target = "xprofile.endpoint", error = %err, "failed to serialize message"),
	}
}

#[cfg(test)]
mod tests {
	use async_trait::async_trait;
	use serde_json::json;
	use xprofile_runtime::{LinkSeverer, Transport, memory_pair};

	use super::*;
	use crate::service::CallbackHandle;

	struct Echo;

	#[async_trait]
	impl ServiceImpl for Echo {
		async fn invoke(&self, method: &str, args: Vec<Value>, callbacks: Vec<CallbackHandle>) -> std::result::Result<Value, MethodFailure> {
			match method {
				"echo" => Ok(args.into_iter().next().unwrap_or(Value::Null)),
				"count" => {
					let progress = &callbacks[0];
					for step in 0..3 {
						progress.notify("step", json!(step));
					}
					Ok(json!(3))
				}
				"boom" => panic!("kaboom"),
				other => Err(MethodFailure::new("UnknownMethod", other)),
			}
		}
	}

	struct Client {
		sender: Box<dyn Transport>,
		inbound: mpsc::UnboundedReceiver<Value>,
		_severer: LinkSeverer,
	}

	impl Client {
		async fn request(&mut self, message: Value) {
			self.sender.send(message).await.unwrap();
		}

		async fn next(&mut self) -> Message {
			serde_json::from_value(self.inbound.recv().await.unwrap()).unwrap()
		}
	}

	fn start() -> (Client, tokio::task::JoinHandle<Result<()>>) {
		let endpoint = ServiceEndpoint::new(Profile::Work);
		endpoint.register("Echo", Arc::new(Echo));
		let (client, server, severer) = memory_pair();
		let TransportParts { sender, receiver, message_rx } = client;
		tokio::spawn(receiver.run());
		let handle = tokio::spawn(endpoint.serve(server));
		(
			Client {
				sender,
				inbound: message_rx,
				_severer: severer,
			},
			handle,
		)
	}

	#[tokio::test]
	async fn returns_results_and_failures() {
		let (mut client, _handle) = start();

		client.request(json!({"kind": "request", "id": 1, "service": "Echo", "method": "echo", "args": ["hi"]})).await;
		match client.next().await {
			Message::Returned(outcome) => assert_eq!(outcome.into_result().unwrap(), json!("hi")),
			other => panic!("unexpected {other:?}"),
		}

		client.request(json!({"kind": "request", "id": 2, "service": "Echo", "method": "nope"})).await;
		match client.next().await {
			Message::Returned(outcome) => assert_eq!(outcome.into_result().unwrap_err().name.as_deref(), Some("UnknownMethod")),
			other => panic!("unexpected {other:?}"),
		}

		client.request(json!({"kind": "request", "id": 3, "service": "Missing", "method": "echo"})).await;
		match client.next().await {
			Message::Returned(outcome) => assert_eq!(outcome.into_result().unwrap_err().name.as_deref(), Some("ServiceNotRegistered")),
			other => panic!("unexpected {other:?}"),
		}
	}

	#[tokio::test]
	async fn panics_become_generic_failures() {
		let (mut client, _handle) = start();
		client.request(json!({"kind": "request", "id": 9, "service": "Echo", "method": "boom"})).await;
		match client.next().await {
			Message::Returned(outcome) => {
				let error = outcome.into_result().unwrap_err();
				assert_eq!(error.name, None);
				assert!(error.message.contains("kaboom"));
			}
			other => panic!("unexpected {other:?}"),
		}
	}

	#[tokio::test]
	async fn notifications_precede_completion() {
		let (mut client, _handle) = start();
		client.request(json!({"kind": "request", "id": 4, "service": "Echo", "method": "count", "callbacks": [0]})).await;

		for step in 0..3 {
			match client.next().await {
				Message::Callback(notification) => {
					assert_eq!((notification.id, notification.slot), (4, 0));
					assert_eq!(notification.payload, json!(step));
				}
				other => panic!("expected notification, got {other:?}"),
			}
		}
		match client.next().await {
			Message::Returned(outcome) => assert_eq!(outcome.into_result().unwrap(), json!(3)),
			other => panic!("expected return, got {other:?}"),
		}
		match client.next().await {
			Message::Completed(outcome) => assert_eq!(outcome.into_result().unwrap(), Value::Null),
			other => panic!("expected completion, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn closing_the_caller_side_ends_serving() {
		let (mut client, handle) = start();
		client.sender.close().await.unwrap();
		handle.await.unwrap().unwrap();
		assert!(client.inbound.recv().await.is_none());
	}
}
