//! Transport abstraction for profile connections.
//!
//! A transport is an ordered, reliable message channel to a service endpoint
//! in another profile. It is split into a sending half ([`Transport`]) and a
//! receiving half ([`TransportReceiver`]) that pumps inbound messages into an
//! unbounded channel until the peer goes away.
//!
//! How bytes cross the process boundary is up to the implementation; this
//! crate only ships [`memory_pair`], an in-process link used by tests and by
//! single-process hosts.

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use xprofile_protocol::Profile;

use crate::error::{Error, Result};

/// Sending half of a connection.
pub trait Transport: Send + Sync {
	/// Sends one message. Messages are delivered in send order.
	fn send(&mut self, message: Value) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

	/// Closes the sending half. The peer observes end-of-stream once buffered
	/// messages are drained.
	fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Receiving half of a connection.
pub trait TransportReceiver: Send {
	/// Reads until the peer closes, forwarding each message to the channel
	/// returned alongside it in [`TransportParts`].
	fn run(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>;
}

/// Everything needed to build a [`Connection`](crate::Connection) or serve an endpoint.
pub struct TransportParts {
	pub sender: Box<dyn Transport>,
	pub receiver: Box<dyn TransportReceiver>,
	pub message_rx: mpsc::UnboundedReceiver<Value>,
}

/// Host collaborator that establishes transports to service endpoints in
/// other profiles.
pub trait ProfileBinder: Send + Sync {
	/// Binds to the endpoint hosted in `profile`.
	fn bind(&self, profile: Profile) -> Pin<Box<dyn Future<Output = Result<TransportParts>> + Send + '_>>;
}

/// Handle that severs an in-memory link from outside, as a crashed or
/// disconnected peer would.
#[derive(Debug, Clone)]
pub struct LinkSeverer {
	tx: watch::Sender<bool>,
}

impl LinkSeverer {
	pub fn sever(&self) {
		let _ = self.tx.send(true);
	}

	pub fn is_severed(&self) -> bool {
		*self.tx.borrow()
	}
}

/// Creates two connected in-memory transport ends plus a severer for the link.
pub fn memory_pair() -> (TransportParts, TransportParts, LinkSeverer) {
	let (severed_tx, severed_rx) = watch::channel(false);
	let (a_to_b_tx, a_to_b_rx) = mpsc::unbounded_channel();
	let (b_to_a_tx, b_to_a_rx) = mpsc::unbounded_channel();

	let a = memory_end(a_to_b_tx, b_to_a_rx, severed_rx.clone());
	let b = memory_end(b_to_a_tx, a_to_b_rx, severed_rx);
	(a, b, LinkSeverer { tx: severed_tx })
}

fn memory_end(outbound: mpsc::UnboundedSender<Value>, inbound: mpsc::UnboundedReceiver<Value>, severed: watch::Receiver<bool>) -> TransportParts {
	let (message_tx, message_rx) = mpsc::unbounded_channel();
	TransportParts {
		sender: Box::new(MemorySender {
			outbound: Some(outbound),
			severed: severed.clone(),
		}),
		receiver: Box::new(MemoryReceiver { inbound, message_tx, severed }),
		message_rx,
	}
}

struct MemorySender {
	outbound: Option<mpsc::UnboundedSender<Value>>,
	severed: watch::Receiver<bool>,
}

impl Transport for MemorySender {
	fn send(&mut self, message: Value) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
		Box::pin(async move {
			if *self.severed.borrow() {
				return Err(Error::Io("link severed".to_string()));
			}
			let outbound = self.outbound.as_ref().ok_or_else(|| Error::Io("transport closed".to_string()))?;
			outbound.send(message).map_err(|_| Error::Io("peer closed".to_string()))
		})
	}

	fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
		Box::pin(async move {
			self.outbound = None;
			Ok(())
		})
	}
}

struct MemoryReceiver {
	inbound: mpsc::UnboundedReceiver<Value>,
	message_tx: mpsc::UnboundedSender<Value>,
	severed: watch::Receiver<bool>,
}

impl TransportReceiver for MemoryReceiver {
	fn run(mut self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
		Box::pin(async move {
			loop {
				if *self.severed.borrow() {
					break;
				}
				tokio::select! {
					message = self.inbound.recv() => {
						let Some(message) = message else {
							break;
						};
						if self.message_tx.send(message).is_err() {
							break;
						}
					}
					changed = self.severed.changed() => {
						if changed.is_err() || *self.severed.borrow() {
							break;
						}
					}
				}
			}
			Ok(())
		})
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[tokio::test]
	async fn memory_pair_delivers_in_order() {
		let (mut a, b, _severer) = memory_pair();
		let TransportParts { receiver, mut message_rx, .. } = b;
		tokio::spawn(receiver.run());

		a.sender.send(json!(1)).await.unwrap();
		a.sender.send(json!(2)).await.unwrap();

		assert_eq!(message_rx.recv().await.unwrap(), json!(1));
		assert_eq!(message_rx.recv().await.unwrap(), json!(2));
	}

	#[tokio::test]
	async fn close_ends_peer_stream() {
		let (mut a, b, _severer) = memory_pair();
		let TransportParts { receiver, mut message_rx, .. } = b;
		let handle = tokio::spawn(receiver.run());

		a.sender.send(json!("last")).await.unwrap();
		a.sender.close().await.unwrap();

		assert_eq!(message_rx.recv().await.unwrap(), json!("last"));
		assert!(message_rx.recv().await.is_none());
		handle.await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn sever_stops_both_directions() {
		let (mut a, b, severer) = memory_pair();
		let TransportParts { receiver, mut message_rx, .. } = b;
		let handle = tokio::spawn(receiver.run());

		severer.sever();
		assert!(severer.is_severed());
		assert!(a.sender.send(json!(1)).await.is_err());
		handle.await.unwrap().unwrap();
		assert!(message_rx.recv().await.is_none());
	}
}
