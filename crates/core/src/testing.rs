//! In-process profile harness.
//!
//! [`LoopbackBinder`] binds profiles to [`ServiceEndpoint`]s living in the
//! same process over [`memory_pair`] links, so the whole caller/target path
//! (envelopes, callbacks, failure capture, unbinding) runs without a real
//! process boundary.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;
use xprofile_protocol::Profile;
use xprofile_runtime::{Error, LinkSeverer, ProfileBinder, Result, TransportParts, memory_pair};

use crate::endpoint::ServiceEndpoint;

#[derive(Default)]
pub struct LoopbackBinder {
	endpoints: Mutex<HashMap<Profile, Arc<ServiceEndpoint>>>,
	links: Mutex<HashMap<Profile, Vec<LinkSeverer>>>,
	binds: Mutex<HashMap<Profile, usize>>,
	delay: Option<Duration>,
}

impl LoopbackBinder {
	pub fn new() -> Self {
		Self::default()
	}

	/// Delays every bind, widening the window in which connects overlap.
	pub fn with_bind_delay(mut self, delay: Duration) -> Self {
		self.delay = Some(delay);
		self
	}

	/// Makes `endpoint` reachable as its profile.
	pub fn register(&self, endpoint: Arc<ServiceEndpoint>) {
		self.endpoints.lock().insert(endpoint.profile(), endpoint);
	}

	pub fn bind_count(&self, profile: Profile) -> usize {
		self.binds.lock().get(&profile).copied().unwrap_or(0)
	}

	/// Severs every live link to `profile`, as a crashed peer would.
	pub fn sever(&self, profile: Profile) {
		let links = self.links.lock().remove(&profile).unwrap_or_default();
		debug!(target = "xprofile.connector", %profile, links = links.len(), "severing loopback links");
		for link in links {
			link.sever();
		}
	}
}

impl ProfileBinder for LoopbackBinder {
	fn bind(&self, profile: Profile) -> Pin<Box<dyn Future<Output = Result<TransportParts>> + Send + '_>> {
		Box::pin(async move {
			*self.binds.lock().entry(profile).or_default() += 1;
			if let Some(delay) = self.delay {
				tokio::time::sleep(delay).await;
			}

			let endpoint = self.endpoints.lock().get(&profile).cloned().ok_or(Error::ProfileUnavailable(profile))?;
			let (client, server, severer) = memory_pair();
			self.links.lock().entry(profile).or_default().push(severer);
			tokio::spawn(endpoint.serve(server));
			Ok(client)
		})
	}
}
