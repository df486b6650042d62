//! Per-profile connection lifecycle.
//!
//! Each remote profile moves through:
//!
//! ```text
//! UNBOUND -> BINDING -> BOUND -> UNBINDING -> UNBOUND
//!     any state -> UNAVAILABLE -> BINDING (retry only)
//! ```
//!
//! Concurrent [`ProfileConnector::connect`] calls for one profile share a single
//! bind attempt. [`ConnectionHolder`]s keep a bound connection alive; when the
//! last holder is released the connection unbinds after the configured idle
//! timeout, once its open calls have finished. Re-adding a holder during that
//! window returns the profile to `BOUND` on the same connection.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::Shared;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use xprofile_protocol::Profile;

use crate::config::ConnectorConfig;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::host::ProfileHost;
use crate::transport::ProfileBinder;

/// Connection state of one profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
	#[default]
	Unbound,
	Binding,
	Bound,
	Unbinding,
	Unavailable,
}

/// Opaque keep-alive token. Holders are plain ids; registering and releasing
/// them is always explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHolder(u64);

impl ConnectionHolder {
	pub fn id(self) -> u64 {
		self.0
	}
}

/// Result of [`ProfileConnector::connect`].
#[derive(Clone)]
pub enum Connected {
	/// The target is the caller's own profile; no transport is involved.
	Local(Profile),
	Remote(Arc<Connection>),
}

impl Connected {
	pub fn profile(&self) -> Profile {
		match self {
			Connected::Local(profile) => *profile,
			Connected::Remote(connection) => connection.profile(),
		}
	}
}

impl fmt::Debug for Connected {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Connected::Local(profile) => f.debug_tuple("Local").field(profile).finish(),
			Connected::Remote(connection) => f.debug_tuple("Remote").field(&connection.profile()).finish(),
		}
	}
}

type BindAttempt = Shared<Pin<Box<dyn Future<Output = Result<Arc<Connection>>> + Send>>>;

#[derive(Default)]
struct ProfileSlot {
	state: ConnectionState,
	holders: HashSet<ConnectionHolder>,
	connection: Option<Arc<Connection>>,
	attempt: Option<BindAttempt>,
	/// Bumped whenever a pending bind or teardown must be invalidated.
	epoch: u64,
	binds: u64,
}

struct Inner {
	config: ConnectorConfig,
	host: Arc<dyn ProfileHost>,
	binder: Arc<dyn ProfileBinder>,
	slots: Mutex<HashMap<Profile, ProfileSlot>>,
	next_holder: AtomicU64,
}

/// Owner of connection state for every profile reachable through one
/// declared connector. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ProfileConnector {
	inner: Arc<Inner>,
}

impl ProfileConnector {
	pub fn new(config: ConnectorConfig, host: Arc<dyn ProfileHost>, binder: Arc<dyn ProfileBinder>) -> Self {
		Self {
			inner: Arc::new(Inner {
				config,
				host,
				binder,
				slots: Mutex::new(HashMap::new()),
				next_holder: AtomicU64::new(1),
			}),
		}
	}

	pub fn config(&self) -> &ConnectorConfig {
		&self.inner.config
	}

	pub fn name(&self) -> &str {
		&self.inner.config.name
	}

	pub fn host(&self) -> &Arc<dyn ProfileHost> {
		&self.inner.host
	}

	/// Profile the calling process executes in.
	pub fn current_profile(&self) -> Profile {
		self.inner.host.current_profile()
	}

	pub fn primary_profile(&self) -> Result<Profile> {
		self.inner.config.primary_profile.profile().ok_or_else(|| Error::NoPrimaryProfileConfigured {
			connector: self.inner.config.name.clone(),
		})
	}

	pub fn secondary_profile(&self) -> Result<Profile> {
		self.primary_profile().map(Profile::other)
	}

	/// Non-blocking connectivity check. The current profile is always connected.
	pub fn is_connected(&self, profile: Profile) -> bool {
		if profile == self.current_profile() {
			return true;
		}
		let slots = self.inner.slots.lock();
		slots.get(&profile).is_some_and(|slot| {
			matches!(slot.state, ConnectionState::Bound | ConnectionState::Unbinding) && slot.connection.as_ref().is_some_and(|c| !c.is_closed())
		})
	}

	/// Snapshot of a profile's state. The current profile reports `Bound`.
	pub fn state(&self, profile: Profile) -> ConnectionState {
		if profile == self.current_profile() {
			return ConnectionState::Bound;
		}
		self.inner.slots.lock().get(&profile).map(|slot| slot.state).unwrap_or_default()
	}

	/// Number of holders registered for `profile`.
	pub fn holder_count(&self, profile: Profile) -> usize {
		self.inner.slots.lock().get(&profile).map_or(0, |slot| slot.holders.len())
	}

	/// Number of bind attempts started for `profile` so far.
	pub fn bind_count(&self, profile: Profile) -> u64 {
		self.inner.slots.lock().get(&profile).map_or(0, |slot| slot.binds)
	}

	/// Ensures `profile` is bound. Concurrent callers share one attempt.
	pub async fn connect(&self, profile: Profile) -> Result<Connected> {
		if profile == self.current_profile() {
			return Ok(Connected::Local(profile));
		}

		let attempt = {
			let mut slots = self.inner.slots.lock();
			let slot = slots.entry(profile).or_default();
			match slot.state {
				ConnectionState::Bound | ConnectionState::Unbinding => match slot.connection.as_ref().filter(|c| !c.is_closed()) {
					Some(connection) => return Ok(Connected::Remote(Arc::clone(connection))),
					None => self.begin_bind(slot, profile)?,
				},
				ConnectionState::Binding => match slot.attempt.clone() {
					Some(attempt) => attempt,
					None => self.begin_bind(slot, profile)?,
				},
				ConnectionState::Unbound | ConnectionState::Unavailable => self.begin_bind(slot, profile)?,
			}
		};

		attempt.await.map(Connected::Remote)
	}

	/// Mints a new holder id. The holder is not registered anywhere yet.
	pub fn new_holder(&self) -> ConnectionHolder {
		ConnectionHolder(self.inner.next_holder.fetch_add(1, Ordering::SeqCst))
	}

	/// Registers `holder` for `profile`, starting a background bind when the
	/// profile is not bound.
	pub fn add_connection_holder(&self, holder: ConnectionHolder, profile: Profile) {
		if self.register_holder(holder, profile) {
			self.spawn_connect(profile);
		}
	}

	/// Releases `holder`. Releasing the last holder schedules unbinding.
	pub fn remove_connection_holder(&self, holder: ConnectionHolder, profile: Profile) {
		let current = self.current_profile();
		let mut slots = self.inner.slots.lock();
		let Some(slot) = slots.get_mut(&profile) else {
			debug!(target = "xprofile.connector", %profile, holder = holder.0, "release of unknown holder");
			return;
		};
		if !slot.holders.remove(&holder) {
			debug!(target = "xprofile.connector", %profile, holder = holder.0, "release of unknown holder");
			return;
		}
		if slot.holders.is_empty() && profile != current && slot.state == ConnectionState::Bound {
			self.schedule_unbind(slot, profile);
		}
	}

	/// Registers a fresh holder for the lifetime of the returned guard.
	///
	/// Unlike [`ProfileConnector::add_connection_holder`] this never starts a
	/// background bind; it is meant to bracket a call that connects itself.
	pub fn hold(&self, profile: Profile) -> HoldGuard {
		let holder = self.new_holder();
		self.register_holder(holder, profile);
		HoldGuard {
			connector: self.clone(),
			holder,
			profile,
		}
	}

	/// Records a host-reported failure for `profile` (e.g. the profile was
	/// turned off). The connection, if any, is closed.
	pub fn mark_unavailable(&self, profile: Profile) {
		if profile == self.current_profile() {
			return;
		}
		let connection = {
			let mut slots = self.inner.slots.lock();
			let slot = slots.entry(profile).or_default();
			slot.state = ConnectionState::Unavailable;
			slot.epoch += 1;
			slot.attempt = None;
			slot.connection.take()
		};
		warn!(target = "xprofile.connector", %profile, "profile reported unavailable");

		if let Some(connection) = connection {
			spawn_detached(async move { connection.close().await });
		}
	}

	/// Returns `true` when the slot needs a bind to honour the new holder.
	fn register_holder(&self, holder: ConnectionHolder, profile: Profile) -> bool {
		let current = self.current_profile();
		let mut slots = self.inner.slots.lock();
		let slot = slots.entry(profile).or_default();
		slot.holders.insert(holder);
		if profile == current {
			return false;
		}

		match slot.state {
			ConnectionState::Unbinding => {
				slot.state = ConnectionState::Bound;
				slot.epoch += 1;
				debug!(target = "xprofile.connector", %profile, "teardown cancelled by new holder");
				false
			}
			ConnectionState::Unbound | ConnectionState::Unavailable => true,
			ConnectionState::Binding | ConnectionState::Bound => false,
		}
	}

	fn spawn_connect(&self, profile: Profile) {
		let connector = self.clone();
		spawn_detached(async move {
			if let Err(err) = connector.connect(profile).await {
				warn!(target = "xprofile.connector", %profile, error = %err, "background bind failed");
			}
		});
	}

	fn begin_bind(&self, slot: &mut ProfileSlot, profile: Profile) -> Result<BindAttempt> {
		if !self.inner.host.is_available(profile) {
			slot.state = ConnectionState::Unavailable;
			slot.connection = None;
			slot.attempt = None;
			info!(target = "xprofile.connector", %profile, "profile not available");
			return Err(Error::ProfileUnavailable(profile));
		}

		slot.state = ConnectionState::Binding;
		slot.epoch += 1;
		slot.binds += 1;
		let epoch = slot.epoch;
		debug!(target = "xprofile.connector", %profile, epoch, "binding");

		let connector = self.clone();
		let attempt: Pin<Box<dyn Future<Output = Result<Arc<Connection>>> + Send>> = Box::pin(async move { connector.finish_bind(profile, epoch).await });
		let attempt = attempt.shared();
		slot.attempt = Some(attempt.clone());
		Ok(attempt)
	}

	async fn finish_bind(self, profile: Profile, epoch: u64) -> Result<Arc<Connection>> {
		let bound = self.inner.binder.bind(profile).await;

		let mut slots = self.inner.slots.lock();
		let slot = slots.entry(profile).or_default();
		if slot.epoch != epoch {
			debug!(target = "xprofile.connector", %profile, "bind superseded");
			return Err(Error::connection_unavailable(profile, "bind superseded"));
		}
		slot.attempt = None;

		match bound {
			Ok(parts) => {
				let connection = Connection::new(profile, parts);
				slot.connection = Some(Arc::clone(&connection));
				slot.state = ConnectionState::Bound;
				info!(target = "xprofile.connector", %profile, "bound");

				let connector = self.clone();
				let driven = Arc::clone(&connection);
				spawn_detached(async move { connector.drive(profile, driven).await });

				if slot.holders.is_empty() {
					self.schedule_unbind(slot, profile);
				}
				Ok(connection)
			}
			Err(err) => {
				slot.state = ConnectionState::Unavailable;
				warn!(target = "xprofile.connector", %profile, error = %err, "bind failed");
				Err(Error::ProfileUnavailable(profile))
			}
		}
	}

	/// Runs the connection's message loop and reacts to the transport ending.
	async fn drive(self, profile: Profile, connection: Arc<Connection>) {
		connection.run().await;

		let rebind = {
			let mut slots = self.inner.slots.lock();
			let Some(slot) = slots.get_mut(&profile) else {
				return;
			};
			let current = slot.connection.as_ref().is_some_and(|c| Arc::ptr_eq(c, &connection));
			if !current {
				return;
			}
			slot.connection = None;
			slot.state = ConnectionState::Unavailable;
			slot.epoch += 1;
			warn!(target = "xprofile.connector", %profile, holders = slot.holders.len(), "connection severed");
			!slot.holders.is_empty()
		};

		if rebind {
			self.spawn_connect(profile);
		}
	}

	fn schedule_unbind(&self, slot: &mut ProfileSlot, profile: Profile) {
		slot.state = ConnectionState::Unbinding;
		slot.epoch += 1;
		let epoch = slot.epoch;
		let delay = self.inner.config.idle_timeout();
		debug!(target = "xprofile.connector", %profile, delay_ms = delay.as_millis() as u64, "unbind scheduled");

		let connector = self.clone();
		if !spawn_detached(async move { connector.teardown(profile, epoch, delay).await }) {
			slot.state = ConnectionState::Bound;
		}
	}

	async fn teardown(self, profile: Profile, epoch: u64, delay: Duration) {
		tokio::time::sleep(delay).await;

		let Some(connection) = self.teardown_candidate(profile, epoch) else {
			return;
		};
		connection.wait_idle().await;

		let connection = {
			let mut slots = self.inner.slots.lock();
			let Some(slot) = slots.get_mut(&profile) else {
				return;
			};
			if slot.epoch != epoch || slot.state != ConnectionState::Unbinding || !slot.holders.is_empty() {
				return;
			}
			slot.state = ConnectionState::Unbound;
			slot.epoch += 1;
			slot.connection.take()
		};

		if let Some(connection) = connection {
			connection.close().await;
		}
		info!(target = "xprofile.connector", %profile, "unbound");
	}

	fn teardown_candidate(&self, profile: Profile, epoch: u64) -> Option<Arc<Connection>> {
		let slots = self.inner.slots.lock();
		let slot = slots.get(&profile)?;
		if slot.epoch != epoch || slot.state != ConnectionState::Unbinding || !slot.holders.is_empty() {
			return None;
		}
		slot.connection.clone()
	}
}

impl fmt::Debug for ProfileConnector {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ProfileConnector")
			.field("name", &self.inner.config.name)
			.field("primary_profile", &self.inner.config.primary_profile)
			.finish()
	}
}

/// Keeps one holder registered until dropped.
#[must_use = "the holder is released when the guard is dropped"]
pub struct HoldGuard {
	connector: ProfileConnector,
	holder: ConnectionHolder,
	profile: Profile,
}

impl Drop for HoldGuard {
	fn drop(&mut self) {
		self.connector.remove_connection_holder(self.holder, self.profile);
	}
}

/// Spawns onto the ambient tokio runtime. Returns `false` outside a runtime.
fn spawn_detached<F>(future: F) -> bool
where
	F: Future<Output = ()> + Send + 'static,
{
	match tokio::runtime::Handle::try_current() {
		Ok(handle) => {
			handle.spawn(future);
			true
		}
		Err(_) => {
			warn!(target = "xprofile.connector", "no async runtime; background work skipped");
			false
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicUsize;

	use tokio::sync::Notify;
	use xprofile_protocol::ProfileType;

	use super::*;
	use crate::fake_transport::{FakeTransportBuilder, FakeTransportController};
	use crate::host::StaticProfileHost;
	use crate::transport::TransportParts;

	#[derive(Default)]
	struct RecordingBinder {
		binds: AtomicUsize,
		gate: Option<Arc<Notify>>,
		controllers: parking_lot::Mutex<Vec<FakeTransportController>>,
	}

	impl ProfileBinder for RecordingBinder {
		fn bind(&self, _profile: Profile) -> Pin<Box<dyn Future<Output = Result<TransportParts>> + Send + '_>> {
			Box::pin(async move {
				self.binds.fetch_add(1, Ordering::SeqCst);
				if let Some(gate) = &self.gate {
					gate.notified().await;
				}
				let (parts, controller) = FakeTransportBuilder::new().build();
				self.controllers.lock().push(controller);
				Ok(parts)
			})
		}
	}

	fn connector_with(binder: Arc<RecordingBinder>, host: Arc<StaticProfileHost>, idle: Duration) -> ProfileConnector {
		let config = ConnectorConfig::new("test").with_primary_profile(ProfileType::Personal).with_idle_timeout(idle);
		ProfileConnector::new(config, host, binder)
	}

	async fn settle() {
		tokio::time::sleep(Duration::from_millis(20)).await;
	}

	#[tokio::test]
	async fn current_profile_connects_locally() {
		let binder = Arc::new(RecordingBinder::default());
		let connector = connector_with(Arc::clone(&binder), Arc::new(StaticProfileHost::new(Profile::Personal)), Duration::ZERO);

		let connected = connector.connect(Profile::Personal).await.unwrap();
		assert!(matches!(connected, Connected::Local(Profile::Personal)));
		assert!(connector.is_connected(Profile::Personal));
		assert_eq!(binder.binds.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn concurrent_connects_share_one_attempt() {
		let gate = Arc::new(Notify::new());
		let binder = Arc::new(RecordingBinder {
			gate: Some(Arc::clone(&gate)),
			..Default::default()
		});
		let connector = connector_with(Arc::clone(&binder), Arc::new(StaticProfileHost::new(Profile::Personal)), Duration::from_secs(60));
		let _holder = connector.hold(Profile::Work);

		let a = tokio::spawn({
			let connector = connector.clone();
			async move { connector.connect(Profile::Work).await }
		});
		let b = tokio::spawn({
			let connector = connector.clone();
			async move { connector.connect(Profile::Work).await }
		});
		settle().await;
		assert_eq!(connector.state(Profile::Work), ConnectionState::Binding);

		gate.notify_one();
		let a = a.await.unwrap().unwrap();
		let b = b.await.unwrap().unwrap();
		match (a, b) {
			(Connected::Remote(a), Connected::Remote(b)) => assert!(Arc::ptr_eq(&a, &b)),
			other => panic!("expected remote connections, got {other:?}"),
		}
		assert_eq!(binder.binds.load(Ordering::SeqCst), 1);
		assert_eq!(connector.bind_count(Profile::Work), 1);
		assert_eq!(connector.state(Profile::Work), ConnectionState::Bound);
	}

	#[tokio::test]
	async fn unavailable_profile_fails_and_records_state() {
		let binder = Arc::new(RecordingBinder::default());
		let connector = connector_with(Arc::clone(&binder), Arc::new(StaticProfileHost::isolated(Profile::Personal)), Duration::ZERO);

		let err = connector.connect(Profile::Work).await.unwrap_err();
		assert!(matches!(err, Error::ProfileUnavailable(Profile::Work)));
		assert_eq!(connector.state(Profile::Work), ConnectionState::Unavailable);
		assert!(!connector.is_connected(Profile::Work));
		assert_eq!(binder.binds.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn retry_after_unavailable_binds() {
		let binder = Arc::new(RecordingBinder::default());
		let host = Arc::new(StaticProfileHost::isolated(Profile::Personal));
		let connector = connector_with(Arc::clone(&binder), Arc::clone(&host), Duration::from_secs(60));
		let _holder = connector.hold(Profile::Work);

		assert!(connector.connect(Profile::Work).await.is_err());
		host.set_available(Profile::Work, true);
		assert!(connector.connect(Profile::Work).await.is_ok());
		assert_eq!(connector.state(Profile::Work), ConnectionState::Bound);
	}

	#[tokio::test]
	async fn releasing_last_holder_unbinds() {
		let binder = Arc::new(RecordingBinder::default());
		let connector = connector_with(Arc::clone(&binder), Arc::new(StaticProfileHost::new(Profile::Personal)), Duration::from_millis(5));

		let holder = connector.new_holder();
		connector.add_connection_holder(holder, Profile::Work);
		settle().await;
		assert_eq!(connector.state(Profile::Work), ConnectionState::Bound);
		assert_eq!(connector.holder_count(Profile::Work), 1);

		connector.remove_connection_holder(holder, Profile::Work);
		assert_eq!(connector.state(Profile::Work), ConnectionState::Unbinding);
		settle().await;
		assert_eq!(connector.state(Profile::Work), ConnectionState::Unbound);
		assert!(!connector.is_connected(Profile::Work));
	}

	#[tokio::test]
	async fn new_holder_during_unbinding_keeps_connection() {
		let binder = Arc::new(RecordingBinder::default());
		let connector = connector_with(Arc::clone(&binder), Arc::new(StaticProfileHost::new(Profile::Personal)), Duration::from_millis(10));

		let first = connector.new_holder();
		connector.add_connection_holder(first, Profile::Work);
		settle().await;
		connector.remove_connection_holder(first, Profile::Work);

		let second = connector.new_holder();
		connector.add_connection_holder(second, Profile::Work);
		settle().await;

		assert_eq!(connector.state(Profile::Work), ConnectionState::Bound);
		assert_eq!(binder.binds.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn severed_connection_rebinds_while_held() {
		let binder = Arc::new(RecordingBinder::default());
		let connector = connector_with(Arc::clone(&binder), Arc::new(StaticProfileHost::new(Profile::Personal)), Duration::from_secs(60));

		let holder = connector.new_holder();
		connector.add_connection_holder(holder, Profile::Work);
		settle().await;
		assert_eq!(binder.binds.load(Ordering::SeqCst), 1);

		binder.controllers.lock()[0].disconnect();
		settle().await;

		assert_eq!(binder.binds.load(Ordering::SeqCst), 2);
		assert_eq!(connector.state(Profile::Work), ConnectionState::Bound);
	}

	#[tokio::test]
	async fn mark_unavailable_drops_connection() {
		let binder = Arc::new(RecordingBinder::default());
		let connector = connector_with(Arc::clone(&binder), Arc::new(StaticProfileHost::new(Profile::Personal)), Duration::from_secs(60));
		let _holder = connector.hold(Profile::Work);
		connector.connect(Profile::Work).await.unwrap();

		connector.mark_unavailable(Profile::Work);
		assert_eq!(connector.state(Profile::Work), ConnectionState::Unavailable);
		assert!(!connector.is_connected(Profile::Work));
	}

	#[test]
	fn roles_follow_configuration() {
		let binder = Arc::new(RecordingBinder::default());
		let host = Arc::new(StaticProfileHost::new(Profile::Work));
		let connector = connector_with(Arc::clone(&binder), Arc::clone(&host), Duration::ZERO);
		assert_eq!(connector.primary_profile().unwrap(), Profile::Personal);
		assert_eq!(connector.secondary_profile().unwrap(), Profile::Work);

		let unconfigured = ProfileConnector::new(ConnectorConfig::new("plain"), host, binder);
		assert!(unconfigured.primary_profile().unwrap_err().is_no_primary_profile());
		assert!(unconfigured.secondary_profile().unwrap_err().is_no_primary_profile());
	}
}
