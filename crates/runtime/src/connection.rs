//! Call correlation layer for one profile connection.
//!
//! This module implements call envelopes on top of a transport. It handles:
//! - Generating correlation ids
//! - Registering callback sinks before a request is sent
//! - Routing `returned`, `callback` and `completed` messages to the right call
//! - Failing every open call when the transport is severed
//!
//! # Message Flow
//!
//! 1. Caller builds a [`CallEnvelope`] with [`Connection::envelope`]
//! 2. [`Connection::call`] registers a oneshot reply and the callback sinks
//! 3. The request is serialized and sent via the transport
//! 4. The message loop ([`Connection::run`]) receives messages from the transport
//! 5. `callback` messages go to the registered sinks, in arrival order
//! 6. `returned` completes the reply; `completed` completes the sinks
//! 7. The envelope is released once its terminal message arrived
//!
//! Calls are pipelined: many envelopes can be open on one connection and their
//! outcomes may arrive in any order.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{Notify, mpsc, oneshot};
use tracing::{debug, error, warn};
use xprofile_protocol::{CallbackNotification, CorrelationId, ErrorPayload, Message, Outcome, Profile, Request};

use crate::callback::CallbackSink;
use crate::error::{Error, Result};
use crate::exception::{MethodFailure, ProfileRuntimeException};
use crate::transport::{Transport, TransportParts, TransportReceiver};

/// A correlatable call record bound to one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct CallEnvelope {
	pub id: CorrelationId,
	pub profile: Profile,
	pub service: String,
	pub method: String,
	/// Serialized value arguments in declaration order.
	pub args: Vec<Value>,
	/// Parameter slots holding callback references, matched by position with
	/// the sinks passed to [`Connection::call`].
	pub callback_slots: Vec<u32>,
}

struct PendingCall {
	service: String,
	method: String,
	reply: Option<oneshot::Sender<Result<Value>>>,
	callback_slots: Vec<u32>,
	sinks: Vec<Arc<dyn CallbackSink>>,
	awaiting_completion: bool,
}

impl PendingCall {
	fn wrap_failure(&self, profile: Profile, payload: ErrorPayload) -> Error {
		Error::RemoteInvocation(ProfileRuntimeException::new(
			profile,
			self.service.clone(),
			self.method.clone(),
			MethodFailure::from(payload),
		))
	}
}

/// Connection to the service endpoint hosted in one profile.
///
/// Shared across tasks through `Arc`. The message loop must be running
/// (see [`Connection::run`]) for calls to complete.
pub struct Connection {
	profile: Profile,
	last_id: AtomicU64,
	pending: Mutex<HashMap<CorrelationId, PendingCall>>,
	idle: Notify,
	closed: AtomicBool,
	sender: tokio::sync::Mutex<Box<dyn Transport>>,
	inbound: Mutex<Option<(Box<dyn TransportReceiver>, mpsc::UnboundedReceiver<Value>)>>,
}

impl Connection {
	pub fn new(profile: Profile, parts: TransportParts) -> Arc<Self> {
		let TransportParts { sender, receiver, message_rx } = parts;
		Arc::new(Self {
			profile,
			last_id: AtomicU64::new(0),
			pending: Mutex::new(HashMap::new()),
			idle: Notify::new(),
			closed: AtomicBool::new(false),
			sender: tokio::sync::Mutex::new(sender),
			inbound: Mutex::new(Some((receiver, message_rx))),
		})
	}

	pub fn profile(&self) -> Profile {
		self.profile
	}

	/// Returns `true` once the connection was closed or its transport severed.
	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	/// Number of envelopes that have not reached their terminal outcome.
	pub fn pending_calls(&self) -> usize {
		self.pending.lock().len()
	}

	/// Builds an envelope with a fresh correlation id.
	pub fn envelope(&self, service: &str, method: &str, args: Vec<Value>, callback_slots: Vec<u32>) -> CallEnvelope {
		CallEnvelope {
			id: self.last_id.fetch_add(1, Ordering::SeqCst),
			profile: self.profile,
			service: service.to_string(),
			method: method.to_string(),
			args,
			callback_slots,
		}
	}

	/// Sends `envelope` and awaits the method's return value.
	///
	/// `sinks` receive the envelope's callback notifications and, for calls with
	/// callbacks, its terminal outcome. They stay registered after this future
	/// resolves (or is dropped) until the terminal message arrives.
	pub async fn call(&self, envelope: CallEnvelope, sinks: Vec<Arc<dyn CallbackSink>>) -> Result<Value> {
		if sinks.len() != envelope.callback_slots.len() {
			return Err(Error::InvalidArguments {
				method: envelope.method,
				reason: format!("{} callback slots but {} sinks", envelope.callback_slots.len(), sinks.len()),
			});
		}

		let (tx, rx) = oneshot::channel();
		let id = envelope.id;
		{
			let mut pending = self.pending.lock();
			if self.is_closed() {
				return Err(Error::connection_unavailable(self.profile, "connection closed"));
			}
			pending.insert(
				id,
				PendingCall {
					service: envelope.service.clone(),
					method: envelope.method.clone(),
					reply: Some(tx),
					callback_slots: envelope.callback_slots.clone(),
					awaiting_completion: !sinks.is_empty(),
					sinks,
				},
			);
		}

		let mut guard = UnsentGuard { connection: self, id, armed: true };

		let request = Message::Request(Request {
			id,
			service: envelope.service,
			method: envelope.method,
			args: envelope.args,
			callbacks: envelope.callback_slots,
		});
		let request_value = serde_json::to_value(&request)?;
		if let Err(err) = self.sender.lock().await.send(request_value).await {
			return Err(Error::connection_unavailable(self.profile, err.to_string()));
		}
		guard.armed = false;

		rx.await
			.map_err(|_| Error::connection_unavailable(self.profile, "connection dropped before reply"))
			.and_then(|result| result)
	}

	/// Runs the message dispatch loop until the transport closes.
	///
	/// Must be called once, typically from a spawned task. When the loop ends
	/// every open envelope fails with [`Error::ConnectionUnavailable`].
	pub async fn run(&self) {
		let inbound = self.inbound.lock().take();
		let Some((receiver, mut message_rx)) = inbound else {
			warn!(target = "xprofile.connection", profile = %self.profile, "message loop already started");
			return;
		};

		let profile = self.profile;
		let transport_handle = tokio::spawn(async move {
			if let Err(err) = receiver.run().await {
				error!(target = "xprofile.connection", %profile, error = %err, "transport error");
			}
		});

		while let Some(message_value) = message_rx.recv().await {
			match Message::deserialize(&message_value) {
				Ok(message) => {
					if let Err(err) = self.dispatch(message) {
						error!(target = "xprofile.connection", %profile, error = %err, "error dispatching message");
					}
				}
				Err(err) => {
					error!(
						target = "xprofile.connection",
						%profile,
						error = %err,
						message = %message_value,
						"failed to parse message"
					);
				}
			}
		}

		debug!(target = "xprofile.connection", %profile, "message loop ended (transport closed)");
		let _ = transport_handle.await;

		let reason = if self.is_closed() { "connection closed" } else { "transport severed" };
		self.sever(reason);
	}

	/// Resolves once no envelope is open on this connection.
	pub async fn wait_idle(&self) {
		loop {
			let notified = self.idle.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();
			if self.pending.lock().is_empty() {
				return;
			}
			notified.await;
		}
	}

	/// Closes the sending half. New calls fail immediately; the message loop
	/// ends once the endpoint finishes and closes its side.
	pub async fn close(&self) {
		self.closed.store(true, Ordering::SeqCst);
		if let Err(err) = self.sender.lock().await.close().await {
			warn!(target = "xprofile.connection", profile = %self.profile, error = %err, "failed to close transport");
		}
	}

	fn dispatch(&self, message: Message) -> Result<()> {
		match message {
			Message::Returned(outcome) => {
				self.on_returned(outcome);
				Ok(())
			}
			Message::Completed(outcome) => {
				self.on_completed(outcome);
				Ok(())
			}
			Message::Callback(notification) => {
				self.on_callback(notification);
				Ok(())
			}
			Message::Request(request) => Err(Error::Protocol(format!(
				"unexpected request for {}.{} on caller connection (id={})",
				request.service, request.method, request.id
			))),
		}
	}

	fn on_returned(&self, outcome: Outcome) {
		let id = outcome.id;
		let (reply, result, orphaned) = {
			let mut pending = self.pending.lock();
			let Some(call) = pending.get_mut(&id) else {
				debug!(target = "xprofile.connection", profile = %self.profile, id, "returned for unknown call");
				return;
			};

			let result = outcome.into_result().map_err(|payload| call.wrap_failure(self.profile, payload));
			let reply = call.reply.take();
			// A failed body ends the callbacks too; sinks still awaiting their
			// terminal outcome receive the body's failure.
			let orphaned = if result.is_err() && call.awaiting_completion {
				call.awaiting_completion = false;
				call.sinks.clone()
			} else {
				Vec::new()
			};
			let terminal = !call.awaiting_completion || result.is_err();
			if terminal {
				pending.remove(&id);
				if pending.is_empty() {
					self.idle.notify_waiters();
				}
			}
			(reply, result, orphaned)
		};

		for sink in orphaned {
			sink.on_complete(self.profile, result.clone());
		}
		if let Some(reply) = reply {
			let _ = reply.send(result);
		}
	}

	fn on_completed(&self, outcome: Outcome) {
		let id = outcome.id;
		let (sinks, result) = {
			let mut pending = self.pending.lock();
			let Some(call) = pending.get_mut(&id) else {
				debug!(target = "xprofile.connection", profile = %self.profile, id, "completion for unknown call");
				return;
			};
			if !call.awaiting_completion {
				warn!(target = "xprofile.connection", profile = %self.profile, id, "duplicate completion ignored");
				return;
			}

			call.awaiting_completion = false;
			let result = outcome.into_result().map_err(|payload| call.wrap_failure(self.profile, payload));
			let sinks = call.sinks.clone();
			if call.reply.is_none() {
				pending.remove(&id);
				if pending.is_empty() {
					self.idle.notify_waiters();
				}
			}
			(sinks, result)
		};

		for sink in sinks {
			sink.on_complete(self.profile, result.clone());
		}
	}

	fn on_callback(&self, notification: CallbackNotification) {
		let sink = {
			let pending = self.pending.lock();
			let Some(call) = pending.get(&notification.id) else {
				debug!(
					target = "xprofile.connection",
					profile = %self.profile,
					id = notification.id,
					"notification for unknown call"
				);
				return;
			};
			call.callback_slots
				.iter()
				.position(|slot| *slot == notification.slot)
				.map(|index| Arc::clone(&call.sinks[index]))
		};

		match sink {
			Some(sink) => sink.on_event(self.profile, &notification.event, notification.payload),
			None => warn!(
				target = "xprofile.connection",
				profile = %self.profile,
				id = notification.id,
				slot = notification.slot,
				"notification for unregistered callback slot"
			),
		}
	}

	fn sever(&self, reason: &str) {
		self.closed.store(true, Ordering::SeqCst);
		let drained: Vec<PendingCall> = self.pending.lock().drain().map(|(_, call)| call).collect();
		if !drained.is_empty() {
			warn!(
				target = "xprofile.connection",
				profile = %self.profile,
				open_calls = drained.len(),
				reason,
				"failing open calls"
			);
		}

		for call in drained {
			let failure = Error::connection_unavailable(self.profile, reason);
			if let Some(reply) = call.reply {
				let _ = reply.send(Err(failure.clone()));
			}
			if call.awaiting_completion {
				for sink in &call.sinks {
					sink.on_complete(self.profile, Err(failure.clone()));
				}
			}
		}
		self.idle.notify_waiters();
	}
}

/// Removes a registered call whose request never left, e.g. when the caller
/// stops waiting while the transport lock is contended.
struct UnsentGuard<'a> {
	connection: &'a Connection,
	id: CorrelationId,
	armed: bool,
}

impl Drop for UnsentGuard<'_> {
	fn drop(&mut self) {
		if self.armed {
			let mut pending = self.connection.pending.lock();
			pending.remove(&self.id);
			if pending.is_empty() {
				self.connection.idle.notify_waiters();
			}
		}
	}
}
