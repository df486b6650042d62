//! Profile-aware entry points of a service.
//!
//! [`ServiceSurface`] binds a descriptor's generated plan to a connector. Each
//! entry point returns a sender that resolves its targets at call time:
//!
//! ```ignore
//! let notes = ServiceSurface::create(descriptor, connector)?;
//! let count = notes.other().call("count", vec![json!("inbox")]).await?;
//! let all = notes.both().call("count", vec![json!("inbox")]).await?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use serde_json::Value;
use xprofile_protocol::Profile;
use xprofile_runtime::{CallbackSink, Intent, ProfileConnector, ProfileRuntimeException, Result, Targets};

use crate::descriptor::CrossProfileType;
use crate::dispatch::{Dispatcher, TargetOutcome};
use crate::generator::{GeneratedSurface, generate};
use crate::service::ServiceImpl;

/// Per-profile outcomes of a multi-target call, keyed by distinct profile.
pub type ProfileResults = BTreeMap<Profile, TargetOutcome>;

#[derive(Clone)]
pub struct ServiceSurface {
	dispatcher: Arc<Dispatcher>,
	plan: Arc<GeneratedSurface>,
}

impl ServiceSurface {
	/// Binds `descriptor` to `connector` for calling only; calls that resolve
	/// to the current profile fail with `ServiceNotRegistered`.
	pub fn create(descriptor: CrossProfileType, connector: ProfileConnector) -> Result<Self> {
		Self::build(descriptor, connector, None)
	}

	/// Binds `descriptor` to `connector` with the implementation used for
	/// current-profile calls.
	pub fn create_with_local(descriptor: CrossProfileType, connector: ProfileConnector, local: Arc<dyn ServiceImpl>) -> Result<Self> {
		Self::build(descriptor, connector, Some(local))
	}

	fn build(descriptor: CrossProfileType, connector: ProfileConnector, local: Option<Arc<dyn ServiceImpl>>) -> Result<Self> {
		descriptor.validate()?;
		let plan = generate(&descriptor, Some(connector.config()));
		Ok(Self {
			dispatcher: Arc::new(Dispatcher::new(descriptor, connector, local)),
			plan: Arc::new(plan),
		})
	}

	pub fn descriptor(&self) -> &CrossProfileType {
		self.dispatcher.descriptor()
	}

	pub fn connector(&self) -> &ProfileConnector {
		self.dispatcher.connector()
	}

	pub fn entry_points(&self) -> &GeneratedSurface {
		&self.plan
	}

	pub fn current(&self) -> SingleSender {
		self.single(Intent::Current)
	}

	pub fn other(&self) -> SingleSender {
		self.single(Intent::Other)
	}

	pub fn personal(&self) -> SingleSender {
		self.single(Intent::Personal)
	}

	pub fn work(&self) -> SingleSender {
		self.single(Intent::Work)
	}

	pub fn profile(&self, profile: Profile) -> SingleSender {
		self.single(Intent::Profile(profile))
	}

	/// Fails with `NoPrimaryProfileConfigured` at call time when the connector
	/// has no primary profile.
	pub fn primary(&self) -> SingleSender {
		self.single(Intent::Primary)
	}

	pub fn secondary(&self) -> SingleSender {
		self.single(Intent::Secondary)
	}

	pub fn profiles(&self, profiles: impl IntoIterator<Item = Profile>) -> MultiSender {
		self.multi(Intent::Profiles(profiles.into_iter().collect()))
	}

	pub fn both(&self) -> MultiSender {
		self.multi(Intent::Both)
	}

	pub fn suppliers(&self) -> MultiSender {
		self.multi(Intent::Suppliers)
	}

	/// Registers a listener for failures raised by target methods.
	pub fn on_uncaught_failure<F>(&self, listener: F)
	where
		F: Fn(&ProfileRuntimeException) + Send + Sync + 'static,
	{
		self.dispatcher.propagator().add_listener(Arc::new(listener));
	}

	pub fn clear_cache(&self) {
		self.dispatcher.cache().clear();
	}

	pub fn clear_cached(&self, method: &str) {
		self.dispatcher.cache().clear_method(self.dispatcher.descriptor().name(), method);
	}

	pub fn clear_cached_profile(&self, profile: Profile) {
		self.dispatcher.cache().clear_profile(profile);
	}

	pub fn cached_entries(&self) -> usize {
		self.dispatcher.cache().len()
	}

	fn single(&self, intent: Intent) -> SingleSender {
		SingleSender {
			dispatcher: Arc::clone(&self.dispatcher),
			intent,
			fallback: None,
		}
	}

	fn multi(&self, intent: Intent) -> MultiSender {
		MultiSender {
			dispatcher: Arc::clone(&self.dispatcher),
			intent,
			only_connected: false,
		}
	}
}

/// Sender bound to exactly one profile.
#[derive(Clone)]
pub struct SingleSender {
	dispatcher: Arc<Dispatcher>,
	intent: Intent,
	fallback: Option<Value>,
}

impl SingleSender {
	pub fn intent(&self) -> &Intent {
		&self.intent
	}

	/// Resolves the target profile without calling it.
	pub fn target(&self) -> Result<Profile> {
		self.dispatcher.resolver().resolve_single(&self.intent)
	}

	/// Returns `default` instead of failing when the target is unavailable.
	pub fn if_available(mut self, default: Value) -> Self {
		self.fallback = Some(default);
		self
	}

	pub async fn call(&self, method: &str, args: Vec<Value>) -> TargetOutcome {
		self.call_with_callbacks(method, args, Vec::new()).await
	}

	pub async fn call_with_callbacks(&self, method: &str, args: Vec<Value>, sinks: Vec<Arc<dyn CallbackSink>>) -> TargetOutcome {
		let outcome = match self.target() {
			Ok(profile) => self.dispatcher.call_profile(profile, method, args, sinks).await,
			Err(err) => Err(err),
		};

		match (outcome, &self.fallback) {
			(Err(err), Some(default)) if err.is_unavailable() => Ok(Some(default.clone())),
			(outcome, _) => outcome,
		}
	}
}

/// Sender bound to a deduplicated set of profiles.
#[derive(Clone)]
pub struct MultiSender {
	dispatcher: Arc<Dispatcher>,
	intent: Intent,
	only_connected: bool,
}

impl MultiSender {
	pub fn intent(&self) -> &Intent {
		&self.intent
	}

	/// Restricts the call to profiles whose connection is already bound.
	pub fn only_connected(mut self) -> Self {
		self.only_connected = true;
		self
	}

	pub fn targets(&self) -> Result<Targets> {
		let mut targets = self.dispatcher.resolver().resolve_many(&self.intent)?;
		if self.only_connected {
			targets.retain_connected(self.dispatcher.connector());
		}
		Ok(targets)
	}

	/// Calls every target and collects one outcome per distinct profile.
	pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<ProfileResults> {
		self.call_with_callbacks(method, args, Vec::new()).await
	}

	pub async fn call_with_callbacks(&self, method: &str, args: Vec<Value>, sinks: Vec<Arc<dyn CallbackSink>>) -> Result<ProfileResults> {
		let results = self.each_with_callbacks(method, args, sinks)?.collect::<ProfileResults>().await;
		Ok(results)
	}

	/// Streams `(profile, outcome)` pairs as targets complete.
	pub fn call_each(&self, method: &str, args: Vec<Value>) -> Result<BoxStream<'static, (Profile, TargetOutcome)>> {
		self.each_with_callbacks(method, args, Vec::new())
	}

	pub fn each_with_callbacks(&self, method: &str, args: Vec<Value>, sinks: Vec<Arc<dyn CallbackSink>>) -> Result<BoxStream<'static, (Profile, TargetOutcome)>> {
		let targets = self.targets()?;
		if targets.is_empty() {
			return Ok(stream::empty().boxed());
		}
		Ok(self.dispatcher.fan_out(&targets, method, args, sinks))
	}
}
