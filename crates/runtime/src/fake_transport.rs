//! Fake transport for unit testing call correlation and callback routing.
//!
//! Provides an in-memory transport whose peer is driven by hand: tests inject
//! outcomes and notifications and inspect what the connection sent.
//!
//! # Example
//!
//! ```ignore
//! let (parts, controller) = FakeTransportBuilder::new().build();
//! let connection = Connection::new(Profile::Work, parts);
//! tokio::spawn({
//!     let conn = Arc::clone(&connection);
//!     async move { conn.run().await }
//! });
//!
//! let fut = connection.call(envelope, Vec::new());
//! controller.inject_returned(0, json!(42));
//! let result = fut.await?;
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};

use crate::error::{Error, Result};
use crate::transport::{Transport, TransportParts, TransportReceiver};

/// Builder for creating fake transport instances.
#[derive(Debug, Default)]
pub struct FakeTransportBuilder {
	fail_sends: bool,
}

impl FakeTransportBuilder {
	pub fn new() -> Self {
		Self::default()
	}

	/// Makes every send fail, as a transport whose peer vanished would.
	pub fn failing_sends(mut self) -> Self {
		self.fail_sends = true;
		self
	}

	/// Build the fake transport and return both parts and a controller.
	pub fn build(self) -> (TransportParts, FakeTransportController) {
		let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
		let (message_tx, message_rx) = mpsc::unbounded_channel();
		let sent_messages = Arc::new(Mutex::new(Vec::new()));

		let sender = FakeTransportSender {
			sent: Arc::clone(&sent_messages),
			fail_sends: self.fail_sends,
			closed: false,
		};

		let receiver = FakeTransportReceiver { inbound_rx, message_tx };

		let controller = FakeTransportController {
			inbound_tx: parking_lot::Mutex::new(Some(inbound_tx)),
			sent: sent_messages,
		};

		let parts = TransportParts {
			sender: Box::new(sender),
			receiver: Box::new(receiver),
			message_rx,
		};

		(parts, controller)
	}
}

/// Controller for injecting endpoint messages and inspecting sent messages.
pub struct FakeTransportController {
	inbound_tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<Value>>>,
	sent: Arc<Mutex<Vec<Value>>>,
}

impl FakeTransportController {
	/// Inject a raw JSON message as if the endpoint had sent it.
	pub fn inject(&self, message: Value) {
		if let Some(tx) = self.inbound_tx.lock().as_ref() {
			let _ = tx.send(message);
		}
	}

	/// Inject a successful method return.
	pub fn inject_returned(&self, id: u64, result: Value) {
		self.inject(json!({ "kind": "returned", "id": id, "result": result }));
	}

	/// Inject a failed method return.
	pub fn inject_returned_error(&self, id: u64, name: &str, message: &str) {
		self.inject(json!({
			"kind": "returned",
			"id": id,
			"error": { "message": message, "name": name }
		}));
	}

	/// Inject a callback terminal outcome.
	pub fn inject_completed(&self, id: u64, result: Value) {
		self.inject(json!({ "kind": "completed", "id": id, "result": result }));
	}

	/// Inject a callback notification.
	pub fn inject_callback(&self, id: u64, slot: u32, event: &str, payload: Value) {
		self.inject(json!({
			"kind": "callback",
			"id": id,
			"slot": slot,
			"event": event,
			"payload": payload
		}));
	}

	/// Ends the inbound stream, as a severed endpoint would.
	pub fn disconnect(&self) {
		self.inbound_tx.lock().take();
	}

	/// Take all sent messages, clearing the buffer.
	pub async fn take_sent(&self) -> Vec<Value> {
		std::mem::take(&mut *self.sent.lock().await)
	}
}

struct FakeTransportSender {
	sent: Arc<Mutex<Vec<Value>>>,
	fail_sends: bool,
	closed: bool,
}

impl Transport for FakeTransportSender {
	fn send(&mut self, message: Value) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
		let sent = Arc::clone(&self.sent);
		let refuse = self.fail_sends || self.closed;
		Box::pin(async move {
			if refuse {
				return Err(Error::Io("fake transport refused send".to_string()));
			}
			sent.lock().await.push(message);
			Ok(())
		})
	}

	fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
		self.closed = true;
		Box::pin(async { Ok(()) })
	}
}

struct FakeTransportReceiver {
	inbound_rx: mpsc::UnboundedReceiver<Value>,
	message_tx: mpsc::UnboundedSender<Value>,
}

impl TransportReceiver for FakeTransportReceiver {
	fn run(mut self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
		Box::pin(async move {
			while let Some(message) = self.inbound_rx.recv().await {
				if self.message_tx.send(message).is_err() {
					break;
				}
			}
			Ok(())
		})
	}
}
